//! The stacked graph encoder.
//!
//! ```text
//! for i in 0..n_layers:
//!     h = MixLayer_i(x, e)              (Backbone::Mix)
//!     x = dropout(relu(LayerNorm_i(h + x)))
//!     e = EdgeUpdate_i(x, e)            (skipped after the last layer unless edge_last)
//! ```
//!
//! With [`Backbone::Sparse`] the dense branch is dropped and the layer reads
//! `x = LayerNorm_i(conv_i(x))`; the edge update sees the normalized `x`, and
//! the ReLU is skipped after the final layer.

use candle_core::Tensor;
use candle_nn::VarBuilder;
use rand::rngs::StdRng;
use tracing::{debug, debug_span, trace};

use crate::batch::BatchIndex;
use crate::config::{Backbone, EncoderConfig};
use crate::conv::{check_features, MessageGraph, SparseConv};
use crate::dropout::Dropout;
use crate::edge_update::EdgeUpdateLayer;
use crate::error::{Error, Result};
use crate::graph::EdgeIndex;
use crate::mix::MixLayer;
use crate::norm::{layer_norm, LayerNorm};

/// A batch of graphs in concatenated (sparse) form.
#[derive(Debug, Clone)]
pub struct GraphBatch {
    node_features: Tensor,
    edge_features: Tensor,
    edges: EdgeIndex,
    batch: BatchIndex,
    attn_mask: Option<Tensor>,
}

impl GraphBatch {
    /// Bundle a batch, checking that the tensors agree with the edge list
    /// and `batch`.
    ///
    /// `node_features` is `(N, d)` with `N == batch.num_nodes()`;
    /// `edge_features` is `(E, d_e)` aligned with `edges`.
    pub fn new(node_features: Tensor, edge_features: Tensor, edges: EdgeIndex, batch: BatchIndex) -> Result<Self> {
        let (n, _) = node_features
            .dims2()
            .map_err(|_| Error::shape("node features", "(N, d)", node_features.dims()))?;
        let (e, _) = edge_features
            .dims2()
            .map_err(|_| Error::shape("edge features", "(E, d)", edge_features.dims()))?;
        if n != batch.num_nodes() {
            return Err(Error::DimensionMismatch {
                what: "node feature rows vs ptr",
                expected: batch.num_nodes(),
                got: n,
            });
        }
        if edges.num_nodes() != n {
            return Err(Error::DimensionMismatch {
                what: "edge index node count",
                expected: n,
                got: edges.num_nodes(),
            });
        }
        if e != edges.num_edges() {
            return Err(Error::DimensionMismatch {
                what: "edge feature rows",
                expected: edges.num_edges(),
                got: e,
            });
        }
        Ok(Self {
            node_features,
            edge_features,
            edges,
            batch,
            attn_mask: None,
        })
    }

    /// Build from raw parts: a `(2, E)` integer edge tensor and `ptr`.
    pub fn from_parts(
        node_features: Tensor,
        edge_features: Tensor,
        edge_index: &Tensor,
        ptr: &[usize],
        attn_mask: Option<Tensor>,
    ) -> Result<Self> {
        let batch = BatchIndex::from_ptr(ptr, node_features.device())?;
        let edges = EdgeIndex::from_tensor(edge_index, batch.num_nodes())?;
        let graph = Self::new(node_features, edge_features, edges, batch)?;
        match attn_mask {
            Some(mask) => graph.with_attn_mask(mask),
            None => Ok(graph),
        }
    }

    /// Use a caller-supplied `(B, N_max, N_max)` attention mask instead of
    /// the per-graph default. Any dtype is accepted; nonzero entries are
    /// allowed pairs. The mask is stored as `u8`.
    pub fn with_attn_mask(mut self, mask: Tensor) -> Result<Self> {
        let (b, n) = (self.batch.batch_size(), self.batch.max_nodes());
        if mask.dims() != [b, n, n] {
            return Err(Error::shape("attention mask", format!("({b}, {n}, {n})"), mask.dims()));
        }
        self.attn_mask = Some(mask.ne(&mask.zeros_like()?)?);
        Ok(self)
    }

    pub fn node_features(&self) -> &Tensor {
        &self.node_features
    }

    pub fn edge_features(&self) -> &Tensor {
        &self.edge_features
    }

    pub fn edges(&self) -> &EdgeIndex {
        &self.edges
    }

    pub fn batch(&self) -> &BatchIndex {
        &self.batch
    }

    /// The supplied attention mask, or the per-graph mask from `ptr`.
    pub fn attention_mask(&self) -> Result<Tensor> {
        match &self.attn_mask {
            Some(mask) => Ok(mask.clone()),
            None => self.batch.attention_mask(),
        }
    }
}

/// Encoder output: refined node and edge features.
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    pub node_features: Tensor,
    pub edge_features: Tensor,
}

enum Block {
    Mix(MixLayer),
    Sparse(SparseConv),
}

/// Stack of `n_layers` mix (or sparse-only) layers with edge updates.
pub struct Encoder {
    config: EncoderConfig,
    blocks: Vec<Block>,
    norms: Vec<LayerNorm>,
    /// `None` where the layer is not followed by an edge update.
    edge_updates: Vec<Option<EdgeUpdateLayer>>,
    dropout: Dropout,
}

impl Encoder {
    /// Build an encoder; fails with [`Error::InvalidConfig`] before any
    /// parameter is created if `config` is invalid.
    pub fn new(config: EncoderConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let d = config.emb_dim;

        let mut blocks = Vec::with_capacity(config.n_layers);
        let mut norms = Vec::with_capacity(config.n_layers);
        let mut edge_updates = Vec::with_capacity(config.n_layers);
        for i in 0..config.n_layers {
            let vb = vb.pp(format!("layers.{i}"));
            blocks.push(match config.backbone {
                Backbone::Mix => Block::Mix(MixLayer::new(&config, vb.pp("mix"))?),
                Backbone::Sparse => Block::Sparse(SparseConv::new(&config, vb.pp("conv"))?),
            });
            norms.push(layer_norm(d, 1e-5, vb.pp("norm"))?);
            edge_updates.push(if config.updates_edges_after(i) {
                Some(EdgeUpdateLayer::new(d, d, config.residual, vb.pp("edge_update"))?)
            } else {
                None
            });
        }

        debug!(
            n_layers = config.n_layers,
            emb_dim = d,
            variant = %config.variant,
            fusion = %config.fusion,
            backbone = %config.backbone,
            "built encoder"
        );

        Ok(Self {
            dropout: Dropout::new(config.dropout)?,
            config,
            blocks,
            norms,
            edge_updates,
        })
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Encode a batch.
    ///
    /// Node and edge features must both be `emb_dim` wide. All shape and
    /// index checks run before the first layer.
    ///
    /// `rng` switches training mode on: every dropout mask is drawn from it,
    /// layer by layer, so equally seeded generators give identical outputs.
    /// `None` runs inference.
    pub fn forward(&self, graph: &GraphBatch, mut rng: Option<&mut StdRng>) -> Result<EncoderOutput> {
        let d = self.config.emb_dim;
        let batch = graph.batch();
        check_features(
            graph.node_features(),
            batch.num_nodes(),
            d,
            ("node feature rows", "node feature width"),
        )?;
        check_features(
            graph.edge_features(),
            graph.edges().num_edges(),
            d,
            ("edge feature rows", "edge feature width"),
        )?;

        let span = debug_span!(
            "encoder_forward",
            graphs = batch.batch_size(),
            nodes = batch.num_nodes(),
            edges = graph.edges().num_edges(),
            train = rng.is_some()
        );
        let _enter = span.enter();

        let device = graph.node_features().device();
        let message_graph = MessageGraph::new(graph.edges(), self.config.variant, device)?;
        let mask = match self.config.backbone {
            Backbone::Mix => Some(graph.attention_mask()?),
            Backbone::Sparse => None,
        };

        let mut x = graph.node_features().clone();
        let mut e = graph.edge_features().clone();
        let last = self.config.n_layers - 1;

        let layers = self.blocks.iter().zip(&self.norms).zip(&self.edge_updates);
        for (i, ((block, norm), update)) in layers.enumerate() {
            match block {
                Block::Mix(layer) => {
                    let mut h = layer.forward(&x, &e, &message_graph, batch, mask.as_ref(), rng.as_deref_mut())?;
                    if self.config.residual {
                        h = (h + &x)?;
                    }
                    x = self.dropout.forward(&norm.forward(&h)?.relu()?, rng.as_deref_mut())?;
                    if let Some(update) = update {
                        e = update.forward(&x, &e, graph.edges())?;
                    }
                }
                Block::Sparse(conv) => {
                    let h = norm.forward(&conv.forward(&x, &e, &message_graph, rng.as_deref_mut())?)?;
                    if let Some(update) = update {
                        e = update.forward(&h, &e, graph.edges())?;
                    }
                    let h = if i == last { h } else { h.relu()? };
                    x = self.dropout.forward(&h, rng.as_deref_mut())?;
                }
            }
            trace!(layer = i, "encoder layer done");
        }

        Ok(EncoderOutput {
            node_features: x,
            edge_features: e,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Fusion, Variant};
    use candle_core::{DType, Device, Var};
    use candle_nn::VarMap;
    use rand::SeedableRng;

    fn features(rows: usize, d: usize, phase: f32) -> Tensor {
        let data: Vec<f32> = (0..rows * d).map(|i| (i as f32 * 0.17 + phase).sin()).collect();
        Tensor::from_vec(data, (rows, d), &Device::Cpu).unwrap()
    }

    fn two_graphs(d: usize) -> GraphBatch {
        // Graph 0: triangle on 0..3; graph 1: path on 3..8.
        let pairs = [
            (0, 1), (1, 0), (1, 2), (2, 1), (2, 0), (0, 2),
            (3, 4), (4, 3), (4, 5), (5, 4), (5, 6), (6, 5), (6, 7), (7, 6),
        ];
        let edges = EdgeIndex::from_pairs(&pairs, 8).unwrap();
        let batch = BatchIndex::from_ptr(&[0, 3, 8], &Device::Cpu).unwrap();
        GraphBatch::new(features(8, d, 0.0), features(pairs.len(), d, 1.0), edges, batch).unwrap()
    }

    fn small(backbone: Backbone) -> EncoderConfig {
        EncoderConfig::default()
            .with_emb_dim(8)
            .with_heads(2)
            .with_n_layers(2)
            .with_backbone(backbone)
    }

    #[test]
    fn test_forward_shapes() {
        let graph = two_graphs(8);
        for backbone in [Backbone::Mix, Backbone::Sparse] {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
            let encoder = Encoder::new(small(backbone), vb).unwrap();

            let out = encoder.forward(&graph, Some(&mut StdRng::seed_from_u64(0))).unwrap();
            assert_eq!(out.node_features.dims(), &[8, 8]);
            assert_eq!(out.edge_features.dims(), &[14, 8]);
        }
    }

    #[test]
    fn test_edge_last_false_keeps_last_edge_features() {
        let graph = two_graphs(8);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = small(Backbone::Mix).with_edge_last(false).with_dropout(0.0);
        let encoder = Encoder::new(config, vb).unwrap();
        assert_eq!(encoder.edge_updates.iter().flatten().count(), 1);

        let out = encoder.forward(&graph, None).unwrap();
        assert_eq!(out.edge_features.dims(), &[14, 8]);
    }

    #[test]
    fn test_invalid_config_fails_at_construction() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = small(Backbone::Mix).with_n_layers(1);
        assert!(matches!(Encoder::new(config, vb), Err(Error::InvalidConfig(_))));
        assert!(varmap.all_vars().is_empty());
    }

    #[test]
    fn test_rejects_wrong_width() {
        let graph = two_graphs(6);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let encoder = Encoder::new(small(Backbone::Mix), vb).unwrap();
        assert!(matches!(
            encoder.forward(&graph, None),
            Err(Error::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_graph_batch_validation() {
        let edges = EdgeIndex::from_pairs(&[(0, 1)], 3).unwrap();
        let batch = BatchIndex::from_ptr(&[0, 1, 3], &Device::Cpu).unwrap();
        let ok = GraphBatch::new(features(3, 4, 0.0), features(1, 4, 0.0), edges.clone(), batch.clone());
        assert!(ok.is_ok());

        let err = GraphBatch::new(features(3, 4, 0.0), features(2, 4, 0.0), edges.clone(), batch.clone());
        assert!(matches!(err, Err(Error::DimensionMismatch { .. })));

        let mask = Tensor::ones((2, 3, 3), DType::U8, &Device::Cpu).unwrap();
        let err = ok.unwrap().with_attn_mask(mask);
        assert!(matches!(err, Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn test_from_parts_rejects_out_of_range_edge() {
        let edge_index = Tensor::new(&[[0i64, 1], [1, 5]], &Device::Cpu).unwrap();
        let err = GraphBatch::from_parts(features(3, 4, 0.0), features(2, 4, 0.0), &edge_index, &[0, 3], None);
        assert!(matches!(err, Err(Error::IndexOutOfRange { .. })));
    }

    #[test]
    fn test_gat_gate_stack() {
        let graph = two_graphs(8);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = small(Backbone::Mix)
            .with_n_layers(3)
            .with_variant(Variant::Gat)
            .with_fusion(Fusion::Gate);
        let encoder = Encoder::new(config, vb).unwrap();

        let out = encoder.forward(&graph, None).unwrap();
        let values = out.node_features.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| v.is_finite()));
    }

    fn assert_gradients_reach_everything(config: EncoderConfig) {
        let label = format!("{} / {} / {}", config.variant, config.fusion, config.backbone);
        let base = two_graphs(8);
        let x = Var::from_tensor(base.node_features()).unwrap();
        let e = Var::from_tensor(base.edge_features()).unwrap();
        let graph = GraphBatch::new(
            x.as_tensor().clone(),
            e.as_tensor().clone(),
            base.edges().clone(),
            base.batch().clone(),
        )
        .unwrap();

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let encoder = Encoder::new(config, vb).unwrap();
        let out = encoder
            .forward(&graph, Some(&mut StdRng::seed_from_u64(11)))
            .unwrap();
        let loss = (out.node_features.sqr().unwrap().sum_all().unwrap()
            + out.edge_features.sqr().unwrap().sum_all().unwrap())
        .unwrap();
        let grads = loss.backward().unwrap();

        let magnitude = |t: &Tensor| {
            grads
                .get(t)
                .map(|g| g.abs().unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap())
                .unwrap_or(0.0)
        };
        assert!(magnitude(x.as_tensor()) > 0.0, "{label}: no gradient for node features");
        assert!(magnitude(e.as_tensor()) > 0.0, "{label}: no gradient for edge features");

        let vars = varmap.data().lock().unwrap();
        assert!(!vars.is_empty());
        for (name, var) in vars.iter() {
            assert!(magnitude(var.as_tensor()) > 0.0, "{label}: no gradient for {name}");
        }
    }

    #[test]
    fn test_gradients_flow_through_every_layer() {
        let configs = [
            small(Backbone::Mix).with_variant(Variant::Gat).with_fusion(Fusion::Gate),
            small(Backbone::Mix).with_variant(Variant::Gin).with_fusion(Fusion::Cat),
            small(Backbone::Mix).with_variant(Variant::Gin).with_fusion(Fusion::Add),
            small(Backbone::Sparse).with_variant(Variant::Gat),
            small(Backbone::Sparse).with_variant(Variant::Gin),
        ];
        for config in configs {
            assert_gradients_reach_everything(config.with_dropout(0.1));
        }
    }

    #[test]
    fn test_training_pass_is_reproducible_from_seed() {
        let graph = two_graphs(8);
        for backbone in [Backbone::Mix, Backbone::Sparse] {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
            let config = small(backbone).with_variant(Variant::Gat).with_dropout(0.3);
            let encoder = Encoder::new(config, vb).unwrap();

            let run = |rng: Option<&mut StdRng>| {
                encoder
                    .forward(&graph, rng)
                    .unwrap()
                    .node_features
                    .to_vec2::<f32>()
                    .unwrap()
            };
            let first = run(Some(&mut StdRng::seed_from_u64(42)));
            assert_eq!(first, run(Some(&mut StdRng::seed_from_u64(42))), "{backbone}");
            assert_ne!(first, run(Some(&mut StdRng::seed_from_u64(43))), "{backbone}");
            assert_ne!(first, run(None), "{backbone}");
        }
    }

    #[test]
    fn test_caller_mask_is_normalized_before_forward() {
        let graph = two_graphs(8);
        let mask = graph.batch().attention_mask().unwrap();
        let float_mask = mask.to_dtype(DType::F32).unwrap().affine(0.5, 0.0).unwrap();

        let with_u8 = graph.clone().with_attn_mask(mask).unwrap();
        let with_f32 = graph.with_attn_mask(float_mask).unwrap();
        assert_eq!(with_f32.attention_mask().unwrap().dtype(), DType::U8);

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let encoder = Encoder::new(small(Backbone::Mix), vb).unwrap();
        let a = encoder.forward(&with_u8, None).unwrap().node_features;
        let b = encoder.forward(&with_f32, None).unwrap().node_features;
        assert_eq!(a.to_vec2::<f32>().unwrap(), b.to_vec2::<f32>().unwrap());
    }
}
