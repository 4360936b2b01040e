//! Ragged sparse node batches <-> padded dense batches.
//!
//! A batch concatenates the nodes of several graphs into one index space;
//! `ptr` (length `batch_size + 1`) marks the boundaries, so node `i` belongs
//! to graph `g` iff `ptr[g] <= i < ptr[g + 1]`.
//!
//! The dense side is an arena of `(graph, slot)` coordinates of shape
//! `(batch_size, max_nodes)`; graphs are left-aligned and the tail of each
//! row is padding. [`BatchIndex`] is the explicit map between the two, built
//! once per batch from `ptr` and reused in both directions:
//!
//! ```text
//! sparse rows:  [a0 a1 a2 | b0 b1 b2 b3 b4]        ptr = [0, 3, 8]
//!
//! dense arena:  [[a0 a1 a2 __ __],                 mask = [[T T T F F],
//!                [b0 b1 b2 b3 b4]]                          [T T T T T]]
//! ```
//!
//! `to_sparse(to_dense(x)) == x` exactly: both directions are pure row
//! gathers, no arithmetic touches the values.

use candle_core::{DType, Device, Tensor};

use crate::error::{Error, Result};
use crate::segment::SegmentIndex;

/// Index map between a concatenated node tensor and its padded batch form.
#[derive(Debug, Clone)]
pub struct BatchIndex {
    ptr: Vec<usize>,
    max_nodes: usize,
    /// Flat arena slot (`graph * max_nodes + position`) of every node.
    slots: Tensor,
    /// Node stored in every arena slot; padding slots point one past the last
    /// node, at the zero row appended by `to_dense`.
    gather: Tensor,
    device: Device,
}

impl BatchIndex {
    /// Build the map for `ptr` with an explicit arena width.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidPtr`] when `ptr` is empty, does not start at zero, is
    /// not non-decreasing, or contains a graph larger than `max_nodes`.
    /// Graphs without nodes are allowed, including a batch of only those.
    pub fn new(ptr: &[usize], max_nodes: usize, device: &Device) -> Result<Self> {
        validate_ptr(ptr)?;
        let batch_size = ptr.len() - 1;
        let num_nodes = ptr[batch_size];
        if u32::try_from(batch_size * max_nodes.max(1) + 1).is_err() {
            return Err(Error::InvalidPtr(format!(
                "arena of {batch_size} x {max_nodes} exceeds the u32 index space"
            )));
        }

        let mut slots = Vec::with_capacity(num_nodes);
        let mut gather = vec![num_nodes as u32; batch_size * max_nodes];
        for g in 0..batch_size {
            let size = ptr[g + 1] - ptr[g];
            if size > max_nodes {
                return Err(Error::InvalidPtr(format!(
                    "graph {g} has {size} nodes but max_nodes is {max_nodes}"
                )));
            }
            for pos in 0..size {
                let slot = g * max_nodes + pos;
                slots.push(slot as u32);
                gather[slot] = (ptr[g] + pos) as u32;
            }
        }

        Ok(Self {
            ptr: ptr.to_vec(),
            max_nodes,
            slots: Tensor::from_vec(slots, num_nodes, device)?,
            gather: Tensor::from_vec(gather, batch_size * max_nodes, device)?,
            device: device.clone(),
        })
    }

    /// Build the map with `max_nodes` set to the largest graph.
    pub fn from_ptr(ptr: &[usize], device: &Device) -> Result<Self> {
        validate_ptr(ptr)?;
        let max_nodes = ptr.windows(2).map(|w| w[1] - w[0]).max().unwrap_or(0);
        Self::new(ptr, max_nodes, device)
    }

    /// Build the map from per-graph node counts.
    pub fn from_sizes(sizes: &[usize], device: &Device) -> Result<Self> {
        let mut ptr = Vec::with_capacity(sizes.len() + 1);
        ptr.push(0);
        for &s in sizes {
            ptr.push(ptr[ptr.len() - 1] + s);
        }
        Self::from_ptr(&ptr, device)
    }

    pub fn ptr(&self) -> &[usize] {
        &self.ptr
    }

    pub fn batch_size(&self) -> usize {
        self.ptr.len() - 1
    }

    pub fn max_nodes(&self) -> usize {
        self.max_nodes
    }

    pub fn num_nodes(&self) -> usize {
        self.ptr[self.ptr.len() - 1]
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Node count of every graph.
    pub fn graph_sizes(&self) -> Vec<usize> {
        self.ptr.windows(2).map(|w| w[1] - w[0]).collect()
    }

    /// Graph id of every node, in node order.
    pub fn node_graph_ids(&self) -> Vec<u32> {
        let mut ids = Vec::with_capacity(self.num_nodes());
        for (g, w) in self.ptr.windows(2).enumerate() {
            ids.extend(std::iter::repeat(g as u32).take(w[1] - w[0]));
        }
        ids
    }

    /// Nodes grouped by graph.
    pub fn node_segments(&self) -> Result<SegmentIndex> {
        SegmentIndex::new(&self.node_graph_ids(), self.batch_size(), &self.device)
    }

    /// Row-major validity of every arena slot.
    pub fn validity(&self) -> Vec<bool> {
        let mut valid = vec![false; self.batch_size() * self.max_nodes];
        for (g, size) in self.graph_sizes().into_iter().enumerate() {
            let row = g * self.max_nodes;
            valid[row..row + size].iter_mut().for_each(|v| *v = true);
        }
        valid
    }

    /// Validity mask, `u8` of shape `(batch_size, max_nodes)`.
    pub fn key_padding_mask(&self) -> Result<Tensor> {
        let mask: Vec<u8> = self.validity().into_iter().map(u8::from).collect();
        Ok(Tensor::from_vec(
            mask,
            (self.batch_size(), self.max_nodes),
            &self.device,
        )?)
    }

    /// Pairwise self-attention mask, `u8` of shape `(B, N, N)`: a
    /// `(query, key)` pair is allowed iff both slots hold real nodes.
    pub fn attention_mask(&self) -> Result<Tensor> {
        let n = self.max_nodes;
        let valid = self.validity();
        let mut mask = vec![0u8; self.batch_size() * n * n];
        for g in 0..self.batch_size() {
            for q in 0..n {
                for k in 0..n {
                    mask[(g * n + q) * n + k] = u8::from(valid[g * n + q] && valid[g * n + k]);
                }
            }
        }
        Ok(Tensor::from_vec(mask, (self.batch_size(), n, n), &self.device)?)
    }

    /// Scatter `(num_nodes, d)` node rows into a zero-padded
    /// `(batch_size, max_nodes, d)` arena.
    pub fn to_dense(&self, x: &Tensor) -> Result<Tensor> {
        let (rows, width) = x
            .dims2()
            .map_err(|_| Error::shape("sparse features", "(num_nodes, d)", x.dims()))?;
        if rows != self.num_nodes() {
            return Err(Error::DimensionMismatch {
                what: "sparse feature rows",
                expected: self.num_nodes(),
                got: rows,
            });
        }
        if self.max_nodes == 0 {
            return Ok(Tensor::zeros((self.batch_size(), 0, width), x.dtype(), x.device())?);
        }
        let pad = Tensor::zeros((1, width), x.dtype(), x.device())?;
        let padded = if rows == 0 { pad } else { Tensor::cat(&[x, &pad], 0)? };
        let dense = padded.index_select(&self.gather, 0)?;
        Ok(dense.reshape((self.batch_size(), self.max_nodes, width))?)
    }

    /// Select the valid arena slots back out, in row-major (graph, then
    /// position) order: the original concatenated node order.
    pub fn to_sparse(&self, dense: &Tensor) -> Result<Tensor> {
        let (b, n, width) = dense
            .dims3()
            .map_err(|_| Error::shape("dense features", "(batch, max_nodes, d)", dense.dims()))?;
        if b != self.batch_size() || n != self.max_nodes {
            return Err(Error::shape(
                "dense features",
                format!("({}, {}, d)", self.batch_size(), self.max_nodes),
                dense.dims(),
            ));
        }
        if self.num_nodes() == 0 {
            return Ok(Tensor::zeros((0, width), dense.dtype(), dense.device())?);
        }
        let flat = dense.reshape((b * n, width))?;
        Ok(flat.index_select(&self.slots, 0)?)
    }
}

fn validate_ptr(ptr: &[usize]) -> Result<()> {
    match ptr.first() {
        None => return Err(Error::InvalidPtr("ptr is empty".into())),
        Some(&first) if first != 0 => {
            return Err(Error::InvalidPtr(format!("ptr[0] must be 0, got {first}")))
        }
        _ => {}
    }
    if ptr.len() < 2 {
        return Err(Error::InvalidPtr("ptr describes no graphs".into()));
    }
    if let Some(g) = ptr.windows(2).position(|w| w[1] < w[0]) {
        return Err(Error::InvalidPtr(format!(
            "ptr decreases between graph {g} ({}) and {} ({})",
            ptr[g],
            g + 1,
            ptr[g + 1]
        )));
    }
    Ok(())
}

/// Inverse conversion driven by an arbitrary `(B, N)` validity mask.
///
/// Rows whose mask entry is non-zero are selected in row-major order. With
/// the mask produced by [`BatchIndex::key_padding_mask`] this is identical to
/// [`BatchIndex::to_sparse`].
pub fn to_sparse_masked(dense: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let (b, n, width) = dense
        .dims3()
        .map_err(|_| Error::shape("dense features", "(batch, max_nodes, d)", dense.dims()))?;
    if mask.dims() != [b, n] {
        return Err(Error::shape("validity mask", format!("({b}, {n})"), mask.dims()));
    }
    let keep: Vec<u32> = mask
        .to_dtype(DType::U32)?
        .flatten_all()?
        .to_vec1::<u32>()?
        .into_iter()
        .enumerate()
        .filter(|&(_, m)| m != 0)
        .map(|(i, _)| i as u32)
        .collect();
    let flat = dense.reshape((b * n, width))?;
    if keep.is_empty() {
        return Ok(Tensor::zeros((0, width), dense.dtype(), dense.device())?);
    }
    let len = keep.len();
    let ids = Tensor::from_vec(keep, len, dense.device())?;
    Ok(flat.index_select(&ids, 0)?)
}
