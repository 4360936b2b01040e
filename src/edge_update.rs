//! Edge feature refresh from endpoint node features.

use candle_core::{Tensor, D};
use candle_nn::{linear, Linear, Module, VarBuilder};

use crate::conv::check_features;
use crate::error::{Error, Result};
use crate::graph::EdgeIndex;
use crate::norm::{layer_norm, LayerNorm};

/// Recomputes edge features from both endpoints and the previous edge state.
///
/// For edge `(u -> v)` with feature `e`:
///
/// ```text
/// z   = [x_u + x_v || |x_u - x_v| || e]
/// e'  = Linear(z) → LayerNorm → ReLU → Linear   (+ e when residual)
/// ```
///
/// The sum and absolute difference are symmetric in `u` and `v`, so both
/// directions of a bond see the same node-derived input.
pub struct EdgeUpdateLayer {
    lin_0: Linear,
    norm: LayerNorm,
    lin_1: Linear,
    node_dim: usize,
    edge_dim: usize,
    residual: bool,
}

impl EdgeUpdateLayer {
    pub fn new(node_dim: usize, edge_dim: usize, residual: bool, vb: VarBuilder) -> Result<Self> {
        if node_dim == 0 || edge_dim == 0 {
            return Err(Error::InvalidConfig(format!(
                "edge update widths must be positive (node {node_dim}, edge {edge_dim})"
            )));
        }
        let input_dim = 2 * node_dim + edge_dim;
        Ok(Self {
            lin_0: linear(input_dim, input_dim, vb.pp("lin_0"))?,
            norm: layer_norm(input_dim, 1e-5, vb.pp("norm"))?,
            lin_1: linear(input_dim, edge_dim, vb.pp("lin_1"))?,
            node_dim,
            edge_dim,
            residual,
        })
    }

    /// `(N, node_dim)` nodes and `(E, edge_dim)` edges to new `(E, edge_dim)` edges.
    pub fn forward(&self, x: &Tensor, edge_attr: &Tensor, edges: &EdgeIndex) -> Result<Tensor> {
        check_features(x, edges.num_nodes(), self.node_dim, ("node feature rows", "node feature width"))?;
        check_features(
            edge_attr,
            edges.num_edges(),
            self.edge_dim,
            ("edge feature rows", "edge feature width"),
        )?;
        if edges.is_empty() {
            return Ok(edge_attr.clone());
        }

        let x_u = x.index_select(&edges.src_tensor(x.device())?, 0)?;
        let x_v = x.index_select(&edges.dst_tensor(x.device())?, 0)?;
        let z = Tensor::cat(&[&(&x_u + &x_v)?, &(&x_u - &x_v)?.abs()?, edge_attr], D::Minus1)?;

        let h = self.lin_0.forward(&z)?;
        let h = self.norm.forward(&h)?.relu()?;
        let out = self.lin_1.forward(&h)?;
        if self.residual {
            Ok((out + edge_attr)?)
        } else {
            Ok(out)
        }
    }
}
