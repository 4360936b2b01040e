//! Dense multi-head attention over padded graph batches.
//!
//! Scores are additive rather than dot-product: each head projects queries
//! and keys to a scalar with a learned vector, and the pair score is
//!
//! ```text
//! s[b, h, i, j] = LeakyReLU(<α_q,h, Q_h[b, i]> + <α_k,h, K_h[b, j]>)
//! ```
//!
//! Softmax runs over keys `j`. Keys a mask marks invalid get `-inf` before
//! the softmax, so their weight is exactly zero.
//!
//! ## Fully masked rows
//!
//! A query row whose mask has no valid key (a padding slot under a
//! per-graph mask) has no meaningful distribution. Such rows are given
//! all-zero logits over every key, which yields a uniform distribution
//! instead of `NaN`. Their outputs correspond to padding and are discarded
//! when the batch is converted back to sparse form.

use candle_core::{Tensor, D};
use candle_nn::{linear_no_bias, ops, Linear, Module, VarBuilder};
use rand::rngs::StdRng;

use crate::conv::{glorot, leaky_relu};
use crate::dropout::Dropout;
use crate::error::{Error, Result};

/// Multi-head attention block with additive LeakyReLU scoring.
pub struct DenseMultiHeadAttention {
    lin_q: Linear,
    lin_k: Linear,
    lin_v: Linear,
    alpha_q: Tensor,
    alpha_k: Tensor,
    bias: Tensor,
    dims: (usize, usize, usize),
    heads: usize,
    head_dim: usize,
    negative_slope: f64,
    dropout: Dropout,
}

impl DenseMultiHeadAttention {
    /// Create a block reading `(q_dim, k_dim, v_dim)` inputs and producing
    /// `heads * head_dim` outputs.
    pub fn new(
        (q_dim, k_dim, v_dim): (usize, usize, usize),
        head_dim: usize,
        heads: usize,
        negative_slope: f64,
        dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        if heads == 0 || head_dim == 0 || q_dim == 0 || k_dim == 0 || v_dim == 0 {
            return Err(Error::InvalidConfig(format!(
                "attention dimensions must be positive (q {q_dim}, k {k_dim}, v {v_dim}, \
                 head_dim {head_dim}, heads {heads})"
            )));
        }
        let width = heads * head_dim;
        let dropout = Dropout::new(dropout)?;
        Ok(Self {
            lin_q: linear_no_bias(q_dim, width, vb.pp("lin_q"))?,
            lin_k: linear_no_bias(k_dim, width, vb.pp("lin_k"))?,
            lin_v: linear_no_bias(v_dim, width, vb.pp("lin_v"))?,
            alpha_q: vb.get_with_hints((1, 1, heads, head_dim), "alpha_q", glorot(width, width))?,
            alpha_k: vb.get_with_hints((1, 1, heads, head_dim), "alpha_k", glorot(width, width))?,
            bias: vb.get_with_hints((heads, head_dim), "bias", glorot(head_dim, heads))?,
            dims: (q_dim, k_dim, v_dim),
            heads,
            head_dim,
            negative_slope,
            dropout,
        })
    }

    pub fn heads(&self) -> usize {
        self.heads
    }

    /// Output width: `heads * head_dim`.
    pub fn out_dim(&self) -> usize {
        self.heads * self.head_dim
    }

    /// Split `(B, L, heads * head_dim)` into `(B, heads, L, head_dim)`.
    fn split_heads(&self, t: &Tensor) -> Result<Tensor> {
        let (b, l, _) = t.dims3()?;
        Ok(t.reshape((b, l, self.heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    /// Per-head additive score of each position: `(B, heads, L)`.
    fn head_scores(projected: &Tensor, alpha: &Tensor) -> Result<Tensor> {
        // (B, H, L, O) * (1, H, 1, O) summed over O.
        let alpha = alpha.transpose(1, 2)?;
        Ok(projected.broadcast_mul(&alpha)?.sum(D::Minus1)?)
    }

    fn check_inputs(&self, q: &Tensor, k: &Tensor, v: Option<&Tensor>) -> Result<(usize, usize, usize)> {
        let (b, lq, qd) = q
            .dims3()
            .map_err(|_| Error::shape("query", "(B, Lq, d)", q.dims()))?;
        let (bk, lk, kd) = k
            .dims3()
            .map_err(|_| Error::shape("key", "(B, Lk, d)", k.dims()))?;
        if let Some(v) = v {
            if v.dims() != [bk, lk, self.dims.2] {
                return Err(Error::shape("value", format!("({bk}, {lk}, {})", self.dims.2), v.dims()));
            }
        }
        if bk != b {
            return Err(Error::DimensionMismatch {
                what: "key batch size",
                expected: b,
                got: bk,
            });
        }
        if qd != self.dims.0 {
            return Err(Error::DimensionMismatch {
                what: "query width",
                expected: self.dims.0,
                got: qd,
            });
        }
        if kd != self.dims.1 {
            return Err(Error::DimensionMismatch {
                what: "key width",
                expected: self.dims.1,
                got: kd,
            });
        }
        Ok((b, lq, lk))
    }

    /// Masked logits `(B, heads, Lq, Lk)`.
    fn logits(&self, q: &Tensor, k: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let (b, lq, lk) = (q.dim(0)?, q.dim(1)?, k.dim(1)?);
        let mask = mask.map(|m| normalize_mask(m, (b, lq, lk))).transpose()?;

        let q_proj = self.split_heads(&self.lin_q.forward(q)?)?;
        let k_proj = self.split_heads(&self.lin_k.forward(k)?)?;
        let s_q = Self::head_scores(&q_proj, &self.alpha_q)?.unsqueeze(3)?;
        let s_k = Self::head_scores(&k_proj, &self.alpha_k)?.unsqueeze(2)?;
        let logits = leaky_relu(&s_q.broadcast_add(&s_k)?, self.negative_slope)?;

        match mask {
            None => Ok(logits),
            Some(mask) => apply_mask(&logits, &mask),
        }
    }

    /// Attention weights `(B, heads, Lq, Lk)` without dropout.
    pub fn attention_weights(&self, q: &Tensor, k: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        self.check_inputs(q, k, None)?;
        let logits = self.logits(q, k, mask)?;
        Ok(ops::softmax(&logits, D::Minus1)?)
    }

    /// Attend from `q (B, Lq, q_dim)` over `k (B, Lk, k_dim)` / `v (B, Lk, v_dim)`.
    ///
    /// `mask` is `(B, Lq, Lk)`; nonzero entries are allowed. Returns
    /// `(B, Lq, heads * head_dim)`. Passing `rng` enables dropout on the
    /// attention weights.
    pub fn forward(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        rng: Option<&mut StdRng>,
    ) -> Result<Tensor> {
        let (b, lq, _) = self.check_inputs(q, k, Some(v))?;

        let logits = self.logits(q, k, mask)?;
        let weights = ops::softmax(&logits, D::Minus1)?;
        let weights = self.dropout.forward(&weights, rng)?;

        let v_proj = self.split_heads(&self.lin_v.forward(v)?)?;
        let out = weights.matmul(&v_proj)?; // (B, H, Lq, O)
        let out = out.transpose(1, 2)?.broadcast_add(&self.bias)?;
        Ok(out.reshape((b, lq, self.out_dim()))?)
    }
}

/// Self-attention over a padded batch: queries, keys and values are `x`.
pub struct DenseSelfAttention {
    block: DenseMultiHeadAttention,
}

impl DenseSelfAttention {
    pub fn new(
        dim: usize,
        head_dim: usize,
        heads: usize,
        negative_slope: f64,
        dropout: f32,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            block: DenseMultiHeadAttention::new((dim, dim, dim), head_dim, heads, negative_slope, dropout, vb)?,
        })
    }

    pub fn block(&self) -> &DenseMultiHeadAttention {
        &self.block
    }

    /// `x (B, N, dim)` with optional `(B, N, N)` mask.
    pub fn forward(&self, x: &Tensor, mask: Option<&Tensor>, rng: Option<&mut StdRng>) -> Result<Tensor> {
        self.block.forward(x, x, x, mask, rng)
    }
}

/// Expand a `(B, Lk)` key-padding mask to `(B, Lq, Lk)`.
pub fn expand_key_mask(key_mask: &Tensor, lq: usize) -> Result<Tensor> {
    let (b, lk) = key_mask
        .dims2()
        .map_err(|_| Error::shape("key padding mask", "(B, Lk)", key_mask.dims()))?;
    Ok(key_mask
        .unsqueeze(1)?
        .broadcast_as((b, lq, lk))?
        .contiguous()?)
}

/// Check the mask shape and turn it into a `u8` tensor (1 = allowed).
fn normalize_mask(mask: &Tensor, (b, lq, lk): (usize, usize, usize)) -> Result<Tensor> {
    if mask.dims() != [b, lq, lk] {
        return Err(Error::shape("attention mask", format!("({b}, {lq}, {lk})"), mask.dims()));
    }
    Ok(mask.ne(&mask.zeros_like()?)?)
}

/// Replace disallowed logits with `-inf`; fully masked query rows become
/// all-zero logits over every key.
fn apply_mask(logits: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let shape = logits.dims().to_vec();

    // (B, Lq, 1): 1 where the row has no allowed key.
    let row_any = mask.max_keepdim(D::Minus1)?;
    let dead_row = row_any.eq(&row_any.zeros_like()?)?;
    let allowed = mask.broadcast_maximum(&dead_row)?;

    let dead_row = dead_row.unsqueeze(1)?.broadcast_as(shape.as_slice())?;
    let allowed = allowed.unsqueeze(1)?.broadcast_as(shape.as_slice())?;

    let zeros = logits.zeros_like()?;
    let neg_inf = Tensor::full(f32::NEG_INFINITY, shape.as_slice(), logits.device())?.to_dtype(logits.dtype())?;

    let logits = dead_row.where_cond(&zeros, logits)?;
    Ok(allowed.where_cond(&logits, &neg_inf)?)
}
