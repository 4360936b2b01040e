//! One encoder layer: sparse message passing fused with dense self-attention.
//!
//! ```text
//!        x ──► SparseConv ───────────────────────────┐
//!        │                                           ├─► fuse ─► x'
//!        └─► to_dense ─► DenseSelfAttention ─► to_sparse
//! ```

use candle_core::{Tensor, D};
use candle_nn::rnn::{gru, GRUConfig, GRUState, GRU, RNN};
use candle_nn::{linear, Linear, Module, VarBuilder};
use rand::rngs::StdRng;

use crate::attention::DenseSelfAttention;
use crate::batch::BatchIndex;
use crate::config::{EncoderConfig, Fusion};
use crate::conv::{check_features, MessageGraph, SparseConv};
use crate::error::Result;

/// Learned part of a fusion policy.
enum FusionCell {
    Add,
    /// `Linear([attn || sparse])`, `2d -> d`.
    Cat(Linear),
    /// GRU cell: sparse output is the input, attention output the hidden state.
    Gate(GRU),
}

/// Sparse branch, dense branch and the rule that merges them.
pub struct MixLayer {
    conv: SparseConv,
    attn: DenseSelfAttention,
    fusion: FusionCell,
    emb_dim: usize,
}

impl MixLayer {
    pub fn new(config: &EncoderConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let d = config.emb_dim;
        let fusion = match config.fusion {
            Fusion::Add => FusionCell::Add,
            Fusion::Cat => FusionCell::Cat(linear(2 * d, d, vb.pp("fuse"))?),
            Fusion::Gate => FusionCell::Gate(gru(d, d, GRUConfig::default(), vb.pp("fuse"))?),
        };
        Ok(Self {
            conv: SparseConv::new(config, vb.pp("conv"))?,
            attn: DenseSelfAttention::new(
                d,
                config.head_dim(),
                config.heads,
                config.negative_slope,
                config.dropout,
                vb.pp("attn"),
            )?,
            fusion,
            emb_dim: d,
        })
    }

    pub fn fusion(&self) -> Fusion {
        match self.fusion {
            FusionCell::Add => Fusion::Add,
            FusionCell::Cat(_) => Fusion::Cat,
            FusionCell::Gate(_) => Fusion::Gate,
        }
    }

    pub fn conv(&self) -> &SparseConv {
        &self.conv
    }

    pub fn attention(&self) -> &DenseSelfAttention {
        &self.attn
    }

    /// Merge per-node sparse and attention outputs, both `(N, d)`.
    pub fn fuse(&self, sparse: &Tensor, attn: &Tensor) -> Result<Tensor> {
        let n = sparse.dim(0)?;
        check_features(sparse, n, self.emb_dim, ("sparse rows", "sparse width"))?;
        check_features(attn, n, self.emb_dim, ("attention rows", "attention width"))?;
        match &self.fusion {
            FusionCell::Add => Ok((sparse + attn)?),
            FusionCell::Cat(lin) => Ok(lin.forward(&Tensor::cat(&[attn, sparse], D::Minus1)?)?),
            FusionCell::Gate(cell) => {
                let state = GRUState { h: attn.clone() };
                Ok(cell.step(sparse, &state)?.h)
            }
        }
    }

    /// Fused node features `(N, d)` before residual and normalization.
    ///
    /// `mask` is the `(B, N_max, N_max)` attention mask of `batch`; without
    /// one every arena slot, padding included, is attended. With `rng` the
    /// sparse branch draws its dropout masks first, then the dense branch.
    pub fn forward(
        &self,
        x: &Tensor,
        edge_attr: &Tensor,
        graph: &MessageGraph,
        batch: &BatchIndex,
        mask: Option<&Tensor>,
        mut rng: Option<&mut StdRng>,
    ) -> Result<Tensor> {
        let sparse = self.conv.forward(x, edge_attr, graph, rng.as_deref_mut())?;

        let dense = batch.to_dense(x)?;
        let attn = self.attn.forward(&dense, mask, rng)?;
        let attn = batch.to_sparse(&attn)?;

        self.fuse(&sparse, &attn)
    }
}
