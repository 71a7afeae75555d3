use ax_core::{Array, BatchDim, BatchDims, BatchedArray, DimVec, LevelSet};
use std::fmt;

/// Recoverable errors surfaced to the batching rule's caller. These come
/// from user-supplied arguments (typically a `dim=` argument forwarded from
/// the original operation call); everything else in this crate is an
/// internal invariant and panics instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmapError {
    /// A logical dimension index fell outside the valid wrapped range
    /// `[-logical_rank, logical_rank)`.
    LogicalDimOutOfRange { dim: i64, logical_rank: i64 },
}

impl fmt::Display for VmapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LogicalDimOutOfRange { dim, logical_rank } => write!(
                f,
                "logical dimension {dim} out of range for a view with {logical_rank} logical \
                 dimensions (expected -{logical_rank} <= dim < {logical_rank})"
            ),
        }
    }
}

impl std::error::Error for VmapError {}

/// A physical view on an array produced by one of the vmap transforms.
///
/// The view holds the unwrapped physical [`Array`] — never a
/// [`BatchedArray`], so double tagging is impossible by construction — plus
/// the set of levels whose batch dimensions occupy the front of the array
/// in ascending-level order. `levels.count()` equals the number of those
/// leading batch dimensions.
///
/// A view is a short-lived value: created by `logical_to_physical`,
/// consumed inside one batching rule, then discarded. It is never mutated;
/// [`Self::get_physical_dims`] is a pure query and
/// [`Self::new_logical_from_physical`] constructs a fresh `BatchedArray`.
#[derive(Debug, Clone)]
pub struct VmapPhysicalView {
    array: Array,
    levels: LevelSet,
}

impl VmapPhysicalView {
    /// Wrap a physical array whose leading `levels.count()` dimensions are
    /// the batch dims, in ascending-level order.
    #[must_use]
    pub fn new(array: Array, levels: LevelSet) -> Self {
        assert!(
            array.rank() >= levels.count(),
            "physical array of rank {} cannot hold {} batch dimensions",
            array.rank(),
            levels.count()
        );
        Self { array, levels }
    }

    #[must_use]
    pub fn array(&self) -> &Array {
        &self.array
    }

    #[must_use]
    pub fn into_array(self) -> Array {
        self.array
    }

    #[must_use]
    pub fn levels(&self) -> LevelSet {
        self.levels
    }

    /// Number of leading batch dimensions on the physical array.
    #[must_use]
    pub fn num_batch_dims(&self) -> usize {
        self.levels.count()
    }

    /// Number of dimensions the operation author perceives.
    #[must_use]
    pub fn num_logical_dims(&self) -> usize {
        self.array.rank() - self.num_batch_dims()
    }

    /// Map a logical dimension index to its physical position.
    ///
    /// Negative indices wrap the way user-facing `dim=` arguments do. Since
    /// every batch dim sits at the front, a wrapped logical index shifts
    /// right by `num_batch_dims()`:
    ///
    /// ```
    /// # use ax_core::{Array, LevelSet};
    /// # use ax_vmap::VmapPhysicalView;
    /// let levels: LevelSet = [1, 3].into_iter().collect();
    /// let view = VmapPhysicalView::new(Array::ones(&[2, 3, 4, 5]), levels);
    /// assert_eq!(view.get_physical_dim(0).unwrap(), 2);
    /// assert_eq!(view.get_physical_dim(1).unwrap(), 3);
    /// ```
    pub fn get_physical_dim(&self, logical_dim: i64) -> Result<i64, VmapError> {
        let logical_rank = self.num_logical_dims() as i64;
        let mut dim = logical_dim;
        if dim < 0 {
            dim += logical_rank;
        }
        if dim < 0 || dim >= logical_rank {
            return Err(VmapError::LogicalDimOutOfRange {
                dim: logical_dim,
                logical_rank,
            });
        }
        Ok(dim + self.num_batch_dims() as i64)
    }

    /// Sequence form of [`Self::get_physical_dim`].
    pub fn get_physical_dims(&self, logical_dims: &[i64]) -> Result<Vec<i64>, VmapError> {
        logical_dims
            .iter()
            .map(|&dim| self.get_physical_dim(dim))
            .collect()
    }

    /// Prepend this view's batch-dim sizes to a logical shape, yielding the
    /// physical shape a result of that logical shape must have. Factory-style
    /// batching rules use this to size their physical outputs.
    #[must_use]
    pub fn get_physical_shape(&self, logical_sizes: &[i64]) -> DimVec {
        let mut physical: DimVec = self.array.sizes()[..self.num_batch_dims()]
            .iter()
            .copied()
            .collect();
        physical.extend_from_slice(logical_sizes);
        physical
    }

    /// Tag a physical result array as a new logical [`BatchedArray`], using
    /// the mapping stored in this view.
    ///
    /// The caller guarantees the leading `num_batch_dims()` dimensions of
    /// `physical` are the batch dims in the same ascending-level order as
    /// `levels()`; each set level is assigned to successive physical
    /// dimensions `0, 1, 2, …`. An array of insufficient rank means the
    /// batching rule mismatched the view contract, which panics.
    #[must_use]
    pub fn new_logical_from_physical(&self, physical: Array) -> BatchedArray {
        assert!(
            physical.rank() >= self.num_batch_dims(),
            "physical result of rank {} cannot carry the view's {} batch dimensions",
            physical.rank(),
            self.num_batch_dims()
        );
        let bdims: BatchDims = self
            .levels
            .iter()
            .enumerate()
            .map(|(dim, level)| BatchDim::new(level, dim))
            .collect();
        BatchedArray::new(physical, bdims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ax_core::MAX_LEVELS;
    use proptest::prelude::*;

    fn view(sizes: &[i64], levels: &[usize]) -> VmapPhysicalView {
        VmapPhysicalView::new(Array::ones(sizes), levels.iter().copied().collect())
    }

    #[test]
    fn dim_counts_split_rank() {
        let view = view(&[2, 3, 4, 5], &[1, 3]);
        assert_eq!(view.num_batch_dims(), 2);
        assert_eq!(view.num_logical_dims(), 2);
    }

    #[test]
    fn physical_dims_shift_by_batch_count() {
        let view = view(&[2, 3, 4, 5], &[1, 3]);
        assert_eq!(view.get_physical_dims(&[0, 1]).unwrap(), vec![2, 3]);
    }

    #[test]
    fn negative_index_wraps() {
        let view = view(&[2, 3, 4, 5], &[1, 3]);
        assert_eq!(
            view.get_physical_dim(-1).unwrap(),
            view.get_physical_dim(1).unwrap()
        );
        assert_eq!(view.get_physical_dim(-2).unwrap(), 2);
    }

    #[test]
    fn out_of_range_dims_are_rejected() {
        let view = view(&[2, 3, 4], &[0]);
        // logical rank is 2: valid range is [-2, 2)
        assert_eq!(
            view.get_physical_dim(2),
            Err(VmapError::LogicalDimOutOfRange {
                dim: 2,
                logical_rank: 2
            })
        );
        assert_eq!(
            view.get_physical_dim(-3),
            Err(VmapError::LogicalDimOutOfRange {
                dim: -3,
                logical_rank: 2
            })
        );
        let message = view.get_physical_dim(2).unwrap_err().to_string();
        assert!(message.contains("out of range"));
    }

    #[test]
    fn physical_shape_prepends_batch_sizes() {
        let view = view(&[2, 4, 3], &[0, 1]);
        assert_eq!(view.get_physical_shape(&[7, 8]).as_slice(), &[2, 4, 7, 8]);
        assert_eq!(view.get_physical_shape(&[]).as_slice(), &[2, 4]);
    }

    #[test]
    fn new_logical_tags_levels_in_ascending_order() {
        let view = view(&[2, 4, 3], &[5, 2]);
        let result = view.new_logical_from_physical(Array::ones(&[2, 4, 6]));
        let bdims = result.bdims();
        assert_eq!(bdims.len(), 2);
        assert_eq!(bdims[0], BatchDim::new(2, 0));
        assert_eq!(bdims[1], BatchDim::new(5, 1));
        assert_eq!(result.logical_rank(), 1);
    }

    #[test]
    #[should_panic(expected = "cannot carry the view's")]
    fn new_logical_rejects_insufficient_rank() {
        let view = view(&[2, 4, 3], &[0, 1]);
        let _ = view.new_logical_from_physical(Array::ones(&[2]));
    }

    #[test]
    #[should_panic(expected = "cannot hold")]
    fn view_rejects_more_levels_than_rank() {
        let _ = view(&[2], &[0, 1]);
    }

    proptest! {
        // For any view with k batch dims and n logical dims, every wrapped
        // logical index d maps to d + k and every index outside [-n, n)
        // is rejected.
        #[test]
        fn dim_shift_law(
            batch in proptest::collection::btree_map(0..MAX_LEVELS, 1_i64..4, 0..3),
            logical in proptest::collection::vec(1_i64..4, 1..4),
            probe in -6_i64..6,
        ) {
            let mut sizes: Vec<i64> = batch.values().copied().collect();
            sizes.extend_from_slice(&logical);
            let view = VmapPhysicalView::new(
                Array::ones(&sizes),
                batch.keys().copied().collect(),
            );
            let n = logical.len() as i64;
            let k = batch.len() as i64;
            let wrapped = if probe < 0 { probe + n } else { probe };
            match view.get_physical_dim(probe) {
                Ok(physical) => {
                    prop_assert!((0..n).contains(&wrapped));
                    prop_assert_eq!(physical, wrapped + k);
                }
                Err(VmapError::LogicalDimOutOfRange { dim, logical_rank }) => {
                    prop_assert!(!(0..n).contains(&wrapped));
                    prop_assert_eq!(dim, probe);
                    prop_assert_eq!(logical_rank, n);
                }
            }
        }
    }
}
