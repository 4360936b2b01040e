//! Cross-attention between two batched graph sets.
//!
//! After encoding, the product graphs and the leaving-group graphs of the
//! same reactions exchange information: every node of one side attends over
//! the nodes of its partner graph on the other side, and the result is added
//! back to the node (residual). Graph `b` of one batch is paired with graph
//! `b` of the other.

use candle_core::Tensor;
use candle_nn::VarBuilder;
use rand::rngs::StdRng;

use crate::attention::{expand_key_mask, DenseMultiHeadAttention};
use crate::batch::BatchIndex;
use crate::conv::check_features;
use crate::error::{Error, Result};

/// Residual cross-attention from one graph set onto another.
pub struct GraphInteraction {
    attn: DenseMultiHeadAttention,
    q_dim: usize,
    kv_dim: usize,
}

impl GraphInteraction {
    /// `q_dim` must be divisible by `heads`; the output keeps `q_dim`.
    pub fn new(
        q_dim: usize,
        kv_dim: usize,
        heads: usize,
        negative_slope: f64,
        dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        if heads == 0 || q_dim % heads != 0 {
            return Err(Error::InvalidConfig(format!(
                "query width {q_dim} is not divisible by {heads} heads"
            )));
        }
        Ok(Self {
            attn: DenseMultiHeadAttention::new(
                (q_dim, kv_dim, kv_dim),
                q_dim / heads,
                heads,
                negative_slope,
                dropout,
                vb,
            )?,
            q_dim,
            kv_dim,
        })
    }

    /// Update `x` (sparse rows of `x_batch`) with attention over `other`
    /// (sparse rows of `other_batch`). Returns the new `(N_x, q_dim)` rows.
    pub fn forward(
        &self,
        x: &Tensor,
        x_batch: &BatchIndex,
        other: &Tensor,
        other_batch: &BatchIndex,
        rng: Option<&mut StdRng>,
    ) -> Result<Tensor> {
        if x_batch.batch_size() != other_batch.batch_size() {
            return Err(Error::DimensionMismatch {
                what: "paired batch size",
                expected: x_batch.batch_size(),
                got: other_batch.batch_size(),
            });
        }
        check_features(x, x_batch.num_nodes(), self.q_dim, ("query rows", "query width"))?;
        check_features(other, other_batch.num_nodes(), self.kv_dim, ("key rows", "key width"))?;

        let queries = x_batch.to_dense(x)?;
        let memory = other_batch.to_dense(other)?;
        let mask = expand_key_mask(&other_batch.key_padding_mask()?, x_batch.max_nodes())?;

        let update = self.attn.forward(&queries, &memory, &memory, Some(&mask), rng)?;
        x_batch.to_sparse(&(queries + update)?)
    }
}

/// Symmetric exchange: each side is updated from the other's input state.
pub struct PairInteraction {
    left: GraphInteraction,
    right: GraphInteraction,
}

impl PairInteraction {
    pub fn new(
        left_dim: usize,
        right_dim: usize,
        heads: usize,
        negative_slope: f64,
        dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            left: GraphInteraction::new(left_dim, right_dim, heads, negative_slope, dropout, vb.pp("left"))?,
            right: GraphInteraction::new(right_dim, left_dim, heads, negative_slope, dropout, vb.pp("right"))?,
        })
    }

    pub fn forward(
        &self,
        left: &Tensor,
        left_batch: &BatchIndex,
        right: &Tensor,
        right_batch: &BatchIndex,
        mut rng: Option<&mut StdRng>,
    ) -> Result<(Tensor, Tensor)> {
        let new_left = self.left.forward(left, left_batch, right, right_batch, rng.as_deref_mut())?;
        let new_right = self.right.forward(right, right_batch, left, left_batch, rng)?;
        Ok((new_left, new_right))
    }
}
