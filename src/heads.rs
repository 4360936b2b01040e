//! Synthon edit classifiers over encoder outputs.
//!
//! Retrosynthesis starts by predicting which atoms change and which bonds
//! break in the product:
//!
//! | Head | Input | Classes |
//! |------|-------|---------|
//! | node | atom features | 7 (atom edit types) |
//! | edge | bond features | 3 (keep / break / change) |
//!
//! Training uses a per-graph summed cross-entropy: element losses are summed
//! within each molecule, then averaged over molecules, so large molecules
//! weigh more than small ones.

use candle_core::{DType, Tensor, D};
use candle_nn::{linear, ops, Linear, Module, VarBuilder};

use crate::conv::check_features;
use crate::encoder::{EncoderOutput, GraphBatch};
use crate::error::{Error, Result};
use crate::segment::SegmentIndex;

/// Number of atom edit classes.
pub const NODE_CLASSES: usize = 7;
/// Number of bond edit classes.
pub const EDGE_CLASSES: usize = 3;

/// Per-element logits from [`SynthonHead::forward`].
#[derive(Debug, Clone)]
pub struct SynthonLogits {
    /// `(N, NODE_CLASSES)`.
    pub node: Tensor,
    /// `(E, EDGE_CLASSES)`.
    pub edge: Tensor,
}

/// Two-layer MLP classifiers for atom and bond edits.
pub struct SynthonHead {
    node_0: Linear,
    node_1: Linear,
    edge_0: Linear,
    edge_1: Linear,
    node_dim: usize,
    edge_dim: usize,
}

impl SynthonHead {
    pub fn new(node_dim: usize, edge_dim: usize, vb: VarBuilder) -> Result<Self> {
        if node_dim == 0 || edge_dim == 0 {
            return Err(Error::InvalidConfig(format!(
                "head widths must be positive (node {node_dim}, edge {edge_dim})"
            )));
        }
        Ok(Self {
            node_0: linear(node_dim, node_dim, vb.pp("node_0"))?,
            node_1: linear(node_dim, NODE_CLASSES, vb.pp("node_1"))?,
            edge_0: linear(edge_dim, edge_dim, vb.pp("edge_0"))?,
            edge_1: linear(edge_dim, EDGE_CLASSES, vb.pp("edge_1"))?,
            node_dim,
            edge_dim,
        })
    }

    pub fn forward(&self, encoded: &EncoderOutput) -> Result<SynthonLogits> {
        let nodes = &encoded.node_features;
        let edges = &encoded.edge_features;
        check_features(nodes, nodes.dim(0)?, self.node_dim, ("node rows", "node width"))?;
        check_features(edges, edges.dim(0)?, self.edge_dim, ("edge rows", "edge width"))?;

        let node = self.node_1.forward(&self.node_0.forward(nodes)?.relu()?)?;
        let edge = self.edge_1.forward(&self.edge_0.forward(edges)?.relu()?)?;
        Ok(SynthonLogits { node, edge })
    }

    /// `(node_loss, edge_loss)` for a batch. Labels are `u32` class ids;
    /// each edge counts toward the graph of its source node.
    pub fn loss(
        &self,
        logits: &SynthonLogits,
        node_labels: &Tensor,
        edge_labels: &Tensor,
        graph: &GraphBatch,
    ) -> Result<(Tensor, Tensor)> {
        let batch = graph.batch();
        let device = batch.device();
        let node_graphs = batch.node_graph_ids();

        let edge_graphs: Vec<u32> = graph
            .edges()
            .src()
            .iter()
            .map(|&s| node_graphs[s as usize])
            .collect();

        let node_segments = SegmentIndex::new(&node_graphs, batch.batch_size(), device)?;
        let edge_segments = SegmentIndex::new(&edge_graphs, batch.batch_size(), device)?;

        let node_loss = graph_summed_cross_entropy(&logits.node, node_labels, &node_segments)?;
        let edge_loss = graph_summed_cross_entropy(&logits.edge, edge_labels, &edge_segments)?;
        Ok((node_loss, edge_loss))
    }
}

/// Cross-entropy of every row, summed per group of `segments` and averaged
/// over groups. Returns a scalar.
///
/// `logits` is `(m, C)`, `labels` is `(m,)` with values in `[0, C)`. Groups
/// without elements contribute zero to the average.
pub fn graph_summed_cross_entropy(logits: &Tensor, labels: &Tensor, segments: &SegmentIndex) -> Result<Tensor> {
    let (m, classes) = logits
        .dims2()
        .map_err(|_| Error::shape("logits", "(m, classes)", logits.dims()))?;
    if labels.dims() != [m] {
        return Err(Error::shape("labels", format!("({m},)"), labels.dims()));
    }
    let labels = labels.to_dtype(DType::U32)?;
    if let Some((index, &label)) = labels
        .to_vec1::<u32>()?
        .iter()
        .enumerate()
        .find(|&(_, &l)| l as usize >= classes)
    {
        return Err(Error::LabelOutOfRange { index, label, classes });
    }
    if segments.num_groups() == 0 {
        return Err(Error::InvalidPtr("loss over zero graphs".into()));
    }

    let log_p = ops::log_softmax(logits, D::Minus1)?;
    let nll = log_p.gather(&labels.unsqueeze(1)?, 1)?.squeeze(1)?.neg()?;
    Ok(segments.sum(&nll)?.mean_all()?)
}
