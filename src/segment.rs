//! Grouped reductions over a sparse index.
//!
//! A [`SegmentIndex`] partitions `m` elements (edges, nodes, ...) into `G`
//! groups. All reductions here are scoped to a group: the canonical use is
//! "edges sharing a destination node", where attention logits must be
//! normalized per destination rather than with one global softmax.
//!
//! ```text
//! softmax_g(s)_i = exp(s_i - max_g) / Σ_{j ∈ g} exp(s_j - max_g)
//! ```
//!
//! Sums use `index_add`, so results do not depend on the order in which
//! elements are listed (up to floating-point rounding) and gradients flow
//! back to every element.

use candle_core::{DType, Device, Tensor};

use crate::error::{Error, Result};

/// Partition of `len()` elements into `num_groups()` groups.
#[derive(Debug, Clone)]
pub struct SegmentIndex {
    /// Group id for each element.
    groups: Vec<u32>,
    /// Elements per group.
    sizes: Vec<usize>,
    /// `groups` as a `u32` device tensor.
    ids: Tensor,
}

impl SegmentIndex {
    /// Build a partition from a group id per element.
    ///
    /// Fails if any id is `>= num_groups`.
    pub fn new(groups: &[u32], num_groups: usize, device: &Device) -> Result<Self> {
        let mut sizes = vec![0usize; num_groups];
        for (i, &g) in groups.iter().enumerate() {
            let slot = sizes.get_mut(g as usize).ok_or(Error::IndexOutOfRange {
                edge: i,
                node: i64::from(g),
                num_nodes: num_groups,
            })?;
            *slot += 1;
        }
        let ids = Tensor::from_slice(groups, groups.len(), device)?;
        Ok(Self {
            groups: groups.to_vec(),
            sizes,
            ids,
        })
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Whether there are no elements.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Number of groups (including empty ones).
    pub fn num_groups(&self) -> usize {
        self.sizes.len()
    }

    /// Group id per element.
    pub fn groups(&self) -> &[u32] {
        &self.groups
    }

    /// Elements per group.
    pub fn group_sizes(&self) -> &[usize] {
        &self.sizes
    }

    /// Group ids as a device tensor, shape `(len,)`.
    pub fn ids(&self) -> &Tensor {
        &self.ids
    }

    fn check_rows(&self, values: &Tensor, what: &'static str) -> Result<()> {
        let rows = values.dims().first().copied().unwrap_or(0);
        if values.rank() == 0 || rows != self.len() {
            return Err(Error::DimensionMismatch {
                what,
                expected: self.len(),
                got: rows,
            });
        }
        Ok(())
    }

    /// Sum element rows into their groups: `(m, ...) -> (G, ...)`.
    ///
    /// Empty groups receive zeros.
    pub fn sum(&self, values: &Tensor) -> Result<Tensor> {
        self.check_rows(values, "segment values")?;
        let mut dims = values.dims().to_vec();
        dims[0] = self.num_groups();
        let zeros = Tensor::zeros(dims, values.dtype(), values.device())?;
        if self.is_empty() {
            return Ok(zeros);
        }
        Ok(zeros.index_add(&self.ids, values, 0)?)
    }

    /// Mean of element rows per group; empty groups receive zeros.
    pub fn mean(&self, values: &Tensor) -> Result<Tensor> {
        let sums = self.sum(values)?;
        let counts: Vec<f32> = self.sizes.iter().map(|&c| c.max(1) as f32).collect();
        let mut shape = vec![1usize; values.rank()];
        shape[0] = self.num_groups();
        let counts = Tensor::from_vec(counts, shape, values.device())?.to_dtype(values.dtype())?;
        Ok(sums.broadcast_div(&counts)?)
    }

    /// Gather a per-group row back to every element: `(G, ...) -> (m, ...)`.
    pub fn broadcast(&self, per_group: &Tensor) -> Result<Tensor> {
        let rows = per_group.dims().first().copied().unwrap_or(0);
        if rows != self.num_groups() {
            return Err(Error::DimensionMismatch {
                what: "per-group values",
                expected: self.num_groups(),
                got: rows,
            });
        }
        Ok(per_group.index_select(&self.ids, 0)?)
    }

    /// Per-group maximum of a `(m, k)` score matrix, computed on the host.
    ///
    /// Empty groups (and groups whose scores are all `-inf`) yield `0.0`, so
    /// the shift applied by [`segment_softmax`] stays finite.
    fn group_max(&self, scores: &Tensor, k: usize) -> Result<Tensor> {
        let host = scores.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let mut max = vec![f32::NEG_INFINITY; self.num_groups() * k];
        for (i, &g) in self.groups.iter().enumerate() {
            let row = &host[i * k..(i + 1) * k];
            let acc = &mut max[g as usize * k..(g as usize + 1) * k];
            for (a, &s) in acc.iter_mut().zip(row) {
                if s > *a {
                    *a = s;
                }
            }
        }
        for m in max.iter_mut() {
            if !m.is_finite() {
                *m = 0.0;
            }
        }
        Ok(Tensor::from_vec(max, (self.num_groups(), k), scores.device())?.to_dtype(scores.dtype())?)
    }
}

/// Softmax restricted to each group of `segments`.
///
/// `scores` is `(m,)` or `(m, k)`; each of the `k` columns (e.g. attention
/// heads) is normalized independently. Every non-empty group sums to one
/// per column. The per-group maximum is subtracted before exponentiation; it
/// is a constant with respect to autograd, which leaves the softmax and its
/// gradient unchanged.
pub fn segment_softmax(scores: &Tensor, segments: &SegmentIndex) -> Result<Tensor> {
    segments.check_rows(scores, "segment scores")?;
    if segments.is_empty() {
        return Ok(scores.clone());
    }
    let m = segments.len();
    let k = scores.elem_count() / m;
    let flat = scores.reshape((m, k))?;

    let max = segments.group_max(&flat, k)?;
    let shifted = flat.sub(&segments.broadcast(&max)?)?;
    let exp = shifted.exp()?;
    let denom = segments.broadcast(&segments.sum(&exp)?)?;
    let alpha = exp.div(&denom)?;

    Ok(alpha.reshape(scores.shape())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu() -> Device {
        Device::Cpu
    }

    #[test]
    fn test_rejects_group_out_of_range() {
        let err = SegmentIndex::new(&[0, 3], 2, &cpu());
        assert!(matches!(err, Err(Error::IndexOutOfRange { .. })));
    }

    #[test]
    fn test_sum_and_mean() {
        let seg = SegmentIndex::new(&[1, 1, 0, 1], 3, &cpu()).unwrap();
        assert_eq!(seg.group_sizes(), &[1, 3, 0]);

        let values = Tensor::from_vec(vec![1f32, 2., 3., 4., 5., 6., 7., 8.], (4, 2), &cpu()).unwrap();

        let sum = seg.sum(&values).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(sum, vec![vec![5., 6.], vec![11., 14.], vec![0., 0.]]);

        let mean = seg.mean(&values).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(mean[0], vec![5., 6.]);
        assert!((mean[1][0] - 11. / 3.).abs() < 1e-6);
        assert_eq!(mean[2], vec![0., 0.]);
    }

    #[test]
    fn test_softmax_normalizes_each_group() {
        let seg = SegmentIndex::new(&[0, 1, 1, 0, 1], 2, &cpu()).unwrap();
        let scores =
            Tensor::from_vec(vec![0.5f32, -1.0, 3.0, 2.0, 0.0], 5, &cpu()).unwrap();

        let alpha = segment_softmax(&scores, &seg).unwrap().to_vec1::<f32>().unwrap();

        let g0 = alpha[0] + alpha[3];
        let g1 = alpha[1] + alpha[2] + alpha[4];
        assert!((g0 - 1.0).abs() < 1e-6);
        assert!((g1 - 1.0).abs() < 1e-6);
        // Larger logit, larger weight within its own group only.
        assert!(alpha[3] > alpha[0]);
        assert!(alpha[2] > alpha[4] && alpha[4] > alpha[1]);
    }

    #[test]
    fn test_softmax_is_stable_for_large_logits() {
        let seg = SegmentIndex::new(&[0, 0, 1], 2, &cpu()).unwrap();
        let scores = Tensor::from_vec(vec![1e4f32, 1e4 - 1.0, -1e4], 3, &cpu()).unwrap();

        let alpha = segment_softmax(&scores, &seg).unwrap().to_vec1::<f32>().unwrap();

        assert!(alpha.iter().all(|a| a.is_finite()));
        assert!((alpha[0] + alpha[1] - 1.0).abs() < 1e-6);
        assert!((alpha[2] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_softmax_multi_column() {
        let seg = SegmentIndex::new(&[0, 0, 0], 1, &cpu()).unwrap();
        let scores =
            Tensor::from_vec(vec![1f32, -2., 0., 5., 3., 0.], (3, 2), &cpu()).unwrap();

        let alpha = segment_softmax(&scores, &seg).unwrap();
        let col_sums = alpha.sum(0).unwrap().to_vec1::<f32>().unwrap();

        for s in col_sums {
            assert!((s - 1.0).abs() < 1e-6);
        }
    }
}
