//! Edge lists and the self-loop preprocessing pass.
//!
//! Edges are directed `(src, dst)` pairs over a concatenated node space;
//! an undirected bond appears as two directed edges. Endpoints are checked
//! against `num_nodes` once, when the [`EdgeIndex`] is built, so every layer
//! downstream can index without re-validating.

use candle_core::{DType, Device, Tensor};

use crate::error::{Error, Result};
use crate::segment::SegmentIndex;

/// Validated directed edge list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeIndex {
    src: Vec<u32>,
    dst: Vec<u32>,
    num_nodes: usize,
}

impl EdgeIndex {
    /// Build from parallel source/destination vectors.
    ///
    /// # Errors
    ///
    /// - [`Error::DimensionMismatch`] if `src` and `dst` differ in length.
    /// - [`Error::IndexOutOfRange`] if an endpoint is `>= num_nodes`.
    pub fn new(src: Vec<u32>, dst: Vec<u32>, num_nodes: usize) -> Result<Self> {
        if src.len() != dst.len() {
            return Err(Error::DimensionMismatch {
                what: "edge destinations",
                expected: src.len(),
                got: dst.len(),
            });
        }
        if u32::try_from(num_nodes).is_err() {
            return Err(Error::InvalidConfig(format!(
                "{num_nodes} nodes exceed the u32 index space"
            )));
        }
        for (edge, (&s, &d)) in src.iter().zip(&dst).enumerate() {
            for node in [s, d] {
                if node as usize >= num_nodes {
                    return Err(Error::IndexOutOfRange {
                        edge,
                        node: i64::from(node),
                        num_nodes,
                    });
                }
            }
        }
        Ok(Self {
            src,
            dst,
            num_nodes,
        })
    }

    /// Build from `(src, dst)` pairs.
    pub fn from_pairs(pairs: &[(usize, usize)], num_nodes: usize) -> Result<Self> {
        let mut src = Vec::with_capacity(pairs.len());
        let mut dst = Vec::with_capacity(pairs.len());
        for (edge, &(s, d)) in pairs.iter().enumerate() {
            src.push(to_node_id(edge, s as i64, num_nodes)?);
            dst.push(to_node_id(edge, d as i64, num_nodes)?);
        }
        Self::new(src, dst, num_nodes)
    }

    /// Build from a `(2, E)` integer tensor: row 0 = source, row 1 = destination.
    pub fn from_tensor(edge_index: &Tensor, num_nodes: usize) -> Result<Self> {
        let (rows, _) = edge_index
            .dims2()
            .map_err(|_| Error::shape("edge_index", "(2, E)", edge_index.dims()))?;
        if rows != 2 {
            return Err(Error::shape("edge_index", "(2, E)", edge_index.dims()));
        }
        let rows = edge_index.to_dtype(DType::I64)?.to_vec2::<i64>()?;
        let mut src = Vec::with_capacity(rows[0].len());
        let mut dst = Vec::with_capacity(rows[1].len());
        for (edge, (&s, &d)) in rows[0].iter().zip(&rows[1]).enumerate() {
            src.push(to_node_id(edge, s, num_nodes)?);
            dst.push(to_node_id(edge, d, num_nodes)?);
        }
        Self::new(src, dst, num_nodes)
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn num_edges(&self) -> usize {
        self.src.len()
    }

    pub fn is_empty(&self) -> bool {
        self.src.is_empty()
    }

    pub fn src(&self) -> &[u32] {
        &self.src
    }

    pub fn dst(&self) -> &[u32] {
        &self.dst
    }

    /// Iterate `(src, dst)` pairs in edge order.
    pub fn pairs(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.src
            .iter()
            .zip(&self.dst)
            .map(|(&s, &d)| (s as usize, d as usize))
    }

    /// Source ids as a `u32` tensor, shape `(E,)`.
    pub fn src_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_slice(&self.src, self.src.len(), device)?)
    }

    /// Destination ids as a `u32` tensor, shape `(E,)`.
    pub fn dst_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::from_slice(&self.dst, self.dst.len(), device)?)
    }

    /// Edges grouped by destination node: the normalization groups for
    /// attention and the reduction groups for aggregation.
    pub fn destination_segments(&self, device: &Device) -> Result<SegmentIndex> {
        SegmentIndex::new(&self.dst, self.num_nodes, device)
    }
}

fn to_node_id(edge: usize, node: i64, num_nodes: usize) -> Result<u32> {
    if node < 0 || node as u64 >= num_nodes as u64 {
        return Err(Error::IndexOutOfRange {
            edge,
            node,
            num_nodes,
        });
    }
    Ok(node as u32)
}

/// Self-loop injection for attention-based message passing.
///
/// Removes every existing `v -> v` edge and appends exactly one self-loop
/// per node, in node order, after the kept edges. The loop attribute is the
/// mean of the node's kept incoming edge attributes, or zero when the node
/// has none. Every node therefore owns at least one attention term and no
/// softmax group is empty.
///
/// The plan is structural: build it once per batch and [`apply`] it to each
/// layer's edge attributes. The source [`EdgeIndex`] is left untouched.
///
/// [`apply`]: SelfLoopPlan::apply
#[derive(Debug, Clone)]
pub struct SelfLoopPlan {
    /// Number of edges in the source list.
    source_edges: usize,
    /// Ids (into the source list) of non-loop edges, as a device tensor.
    kept: Option<Tensor>,
    /// Kept edges grouped by destination, for the mean fill.
    kept_by_dst: SegmentIndex,
    /// Kept edges followed by one loop per node.
    edges: EdgeIndex,
}

impl SelfLoopPlan {
    pub fn new(source: &EdgeIndex, device: &Device) -> Result<Self> {
        let n = source.num_nodes();
        let mut kept = Vec::with_capacity(source.num_edges());
        let mut src = Vec::with_capacity(source.num_edges() + n);
        let mut dst = Vec::with_capacity(source.num_edges() + n);
        for (i, (&s, &d)) in source.src().iter().zip(source.dst()).enumerate() {
            if s != d {
                kept.push(i as u32);
                src.push(s);
                dst.push(d);
            }
        }
        let kept_by_dst = SegmentIndex::new(&dst, n, device)?;
        for v in 0..n as u32 {
            src.push(v);
            dst.push(v);
        }
        let kept_ids = if kept.is_empty() {
            None
        } else {
            Some(Tensor::from_slice(&kept, kept.len(), device)?)
        };
        Ok(Self {
            source_edges: source.num_edges(),
            kept: kept_ids,
            kept_by_dst,
            edges: EdgeIndex::new(src, dst, n)?,
        })
    }

    /// The augmented edge list.
    pub fn edges(&self) -> &EdgeIndex {
        &self.edges
    }

    /// Number of source edges that survived loop removal.
    pub fn num_kept(&self) -> usize {
        self.kept_by_dst.len()
    }

    /// Produce edge attributes aligned with [`edges`](Self::edges).
    ///
    /// `edge_attr` is `(E, d)` aligned with the source edge list.
    pub fn apply(&self, edge_attr: &Tensor) -> Result<Tensor> {
        let (rows, width) = edge_attr
            .dims2()
            .map_err(|_| Error::shape("edge_attr", "(E, d)", edge_attr.dims()))?;
        if rows != self.source_edges {
            return Err(Error::DimensionMismatch {
                what: "edge attribute rows",
                expected: self.source_edges,
                got: rows,
            });
        }
        let n = self.edges.num_nodes();
        match &self.kept {
            None => Ok(Tensor::zeros((n, width), edge_attr.dtype(), edge_attr.device())?),
            Some(kept) => {
                let kept_attr = edge_attr.index_select(kept, 0)?;
                let loop_attr = self.kept_by_dst.mean(&kept_attr)?;
                Ok(Tensor::cat(&[&kept_attr, &loop_attr], 0)?)
            }
        }
    }
}
