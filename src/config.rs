//! Encoder configuration.
//!
//! # Example
//!
//! ```rust
//! use retrograph_nn::config::{EncoderConfig, Fusion, Variant};
//!
//! let config = EncoderConfig::default()
//!     .with_emb_dim(64)
//!     .with_n_layers(3)
//!     .with_variant(Variant::Gat)
//!     .with_heads(4)
//!     .with_fusion(Fusion::Gate);
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.head_dim(), 16);
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Sparse message-passing variant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    /// Additive GIN-style aggregation: `MLP((1 + ε) x_v + Σ ReLU(x_u + e_uv))`.
    #[default]
    Gin,
    /// Edge-conditioned multi-head attention (GAT-style) with self-loops.
    Gat,
}

/// Rule combining the sparse branch and the dense attention branch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Fusion {
    /// Elementwise sum.
    #[default]
    Add,
    /// Concatenate, then project back to the embedding width.
    Cat,
    /// GRU cell: attention output is the hidden state, sparse output the input.
    Gate,
}

/// Encoder layer layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backbone {
    /// Sparse message passing fused with dense self-attention every layer.
    #[default]
    Mix,
    /// Sparse message passing only.
    Sparse,
}

macro_rules! named_enum {
    ($ty:ty, $what:literal, { $($name:literal => $variant:path),+ $(,)? }) => {
        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($name => Ok($variant),)+
                    other => Err(Error::InvalidConfig(format!(
                        concat!("unknown ", $what, " `{}`"),
                        other
                    ))),
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let name = match self {
                    $($variant => $name,)+
                };
                f.write_str(name)
            }
        }
    };
}

named_enum!(Variant, "variant", { "gin" => Variant::Gin, "gat" => Variant::Gat });
named_enum!(Fusion, "fusion", { "add" => Fusion::Add, "cat" => Fusion::Cat, "gate" => Fusion::Gate });
named_enum!(Backbone, "backbone", { "mix" => Backbone::Mix, "sparse" => Backbone::Sparse });

/// Encoder configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Node and edge embedding width (default: 256).
    pub emb_dim: usize,
    /// Number of stacked layers, at least 2 (default: 8).
    pub n_layers: usize,
    /// Sparse message-passing variant (default: gin).
    pub variant: Variant,
    /// Attention heads, shared by the GAT variant and the dense block (default: 4).
    pub heads: usize,
    /// LeakyReLU negative slope for attention logits (default: 0.2).
    pub negative_slope: f64,
    /// Dropout probability in `[0, 1)` (default: 0.3).
    pub dropout: f32,
    /// Branch fusion policy (default: add).
    pub fusion: Fusion,
    /// Residual connections on node and edge updates (default: true).
    pub residual: bool,
    /// Run the edge update after the final layer as well (default: true).
    pub edge_last: bool,
    /// Layer layout (default: mix).
    pub backbone: Backbone,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            emb_dim: 256,
            n_layers: 8,
            variant: Variant::Gin,
            heads: 4,
            negative_slope: 0.2,
            dropout: 0.3,
            fusion: Fusion::Add,
            residual: true,
            edge_last: true,
            backbone: Backbone::Mix,
        }
    }
}

impl EncoderConfig {
    pub fn with_emb_dim(mut self, emb_dim: usize) -> Self {
        self.emb_dim = emb_dim;
        self
    }

    pub fn with_n_layers(mut self, n_layers: usize) -> Self {
        self.n_layers = n_layers;
        self
    }

    pub fn with_variant(mut self, variant: Variant) -> Self {
        self.variant = variant;
        self
    }

    pub fn with_heads(mut self, heads: usize) -> Self {
        self.heads = heads;
        self
    }

    pub fn with_negative_slope(mut self, negative_slope: f64) -> Self {
        self.negative_slope = negative_slope;
        self
    }

    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn with_fusion(mut self, fusion: Fusion) -> Self {
        self.fusion = fusion;
        self
    }

    pub fn with_residual(mut self, residual: bool) -> Self {
        self.residual = residual;
        self
    }

    pub fn with_edge_last(mut self, edge_last: bool) -> Self {
        self.edge_last = edge_last;
        self
    }

    pub fn with_backbone(mut self, backbone: Backbone) -> Self {
        self.backbone = backbone;
        self
    }

    /// Per-head width: the GAT `out_channels` and the dense block's head size.
    pub fn head_dim(&self) -> usize {
        if self.heads == 0 {
            0
        } else {
            self.emb_dim / self.heads
        }
    }

    /// Whether layer `layer` (0-based) is followed by an edge update.
    pub fn updates_edges_after(&self, layer: usize) -> bool {
        layer + 1 < self.n_layers || self.edge_last
    }

    /// Check every construction-time invariant.
    pub fn validate(&self) -> Result<()> {
        if self.emb_dim == 0 {
            return Err(Error::InvalidConfig("emb_dim must be positive".into()));
        }
        if self.n_layers < 2 {
            return Err(Error::InvalidConfig(format!(
                "n_layers must be at least 2, got {}",
                self.n_layers
            )));
        }
        if self.heads == 0 {
            return Err(Error::InvalidConfig("heads must be positive".into()));
        }
        if self.emb_dim % self.heads != 0 {
            return Err(Error::InvalidConfig(format!(
                "emb_dim {} is not divisible by {} heads",
                self.emb_dim, self.heads
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::InvalidConfig(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if !self.negative_slope.is_finite() {
            return Err(Error::InvalidConfig(format!(
                "negative_slope must be finite, got {}",
                self.negative_slope
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = EncoderConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.head_dim(), 64);
    }

    #[test]
    fn test_rejects_short_stack() {
        let err = EncoderConfig::default().with_n_layers(1).validate();
        assert!(matches!(err, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_indivisible_heads() {
        let err = EncoderConfig::default()
            .with_emb_dim(30)
            .with_heads(4)
            .validate();
        assert!(matches!(err, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_rejects_zero_heads_and_bad_dropout() {
        assert!(EncoderConfig::default().with_heads(0).validate().is_err());
        assert!(EncoderConfig::default().with_dropout(1.0).validate().is_err());
        assert!(EncoderConfig::default().with_dropout(-0.1).validate().is_err());
        assert!(EncoderConfig::default()
            .with_negative_slope(f64::NAN)
            .validate()
            .is_err());
    }

    #[test]
    fn test_names_parse_and_display() {
        assert_eq!("gat".parse::<Variant>().unwrap(), Variant::Gat);
        assert_eq!("gate".parse::<Fusion>().unwrap(), Fusion::Gate);
        assert_eq!("sparse".parse::<Backbone>().unwrap(), Backbone::Sparse);
        assert_eq!(Fusion::Cat.to_string(), "cat");
        assert_eq!(Variant::Gin.to_string(), "gin");

        assert!(matches!(
            "gcn".parse::<Variant>(),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!("mul".parse::<Fusion>(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_edge_update_schedule() {
        let config = EncoderConfig::default().with_n_layers(3).with_edge_last(false);
        assert!(config.updates_edges_after(0));
        assert!(config.updates_edges_after(1));
        assert!(!config.updates_edges_after(2));

        let config = config.with_edge_last(true);
        assert!(config.updates_edges_after(2));
    }
}
