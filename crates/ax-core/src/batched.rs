use crate::array::Array;
use crate::level::{LevelSet, MAX_LEVELS};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// One batch-dimension tag: vmap level `level` occupies physical dimension
/// `dim` of the tagged array's storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchDim {
    pub level: usize,
    pub dim: usize,
}

impl BatchDim {
    #[must_use]
    pub fn new(level: usize, dim: usize) -> Self {
        Self { level, dim }
    }
}

/// The tags of one batched array. Most code sees one or two nesting levels.
pub type BatchDims = SmallVec<[BatchDim; 4]>;

/// A plain array tagged with `(level, dim)` pairs — the *logical*
/// representation a vmap'd operation author perceives.
///
/// The tagged dimensions are invisible in the logical view: an array of
/// physical shape `[2, 3, 4]` with levels tagged on dims 0 and 2 has
/// logical shape `[3]`. Tags need not be contiguous at the front nor in
/// level order; the transforms in `ax-vmap` normalize them.
#[derive(Debug, Clone)]
pub struct BatchedArray {
    array: Array,
    bdims: BatchDims,
}

impl BatchedArray {
    /// Tag `array` with `bdims`.
    ///
    /// The tags must reference pairwise-distinct physical dimensions within
    /// the array's rank, and pairwise-distinct levels below [`MAX_LEVELS`].
    /// Violations are bugs in the caller and panic.
    #[must_use]
    pub fn new(array: Array, bdims: BatchDims) -> Self {
        let rank = array.rank();
        let mut levels = LevelSet::empty();
        let mut dim_taken = vec![false; rank];
        for bdim in &bdims {
            assert!(
                bdim.dim < rank,
                "batch dim {} out of range for array of rank {rank}",
                bdim.dim
            );
            assert!(
                !dim_taken[bdim.dim],
                "physical dimension {} tagged by more than one level",
                bdim.dim
            );
            dim_taken[bdim.dim] = true;
            assert!(
                bdim.level < MAX_LEVELS && !levels.contains(bdim.level),
                "level {} is out of range or tagged twice",
                bdim.level
            );
            levels.insert(bdim.level);
        }
        Self { array, bdims }
    }

    /// An array with no batch dimensions at all (logical == physical).
    #[must_use]
    pub fn unbatched(array: Array) -> Self {
        Self {
            array,
            bdims: BatchDims::new(),
        }
    }

    #[must_use]
    pub fn is_batched(&self) -> bool {
        !self.bdims.is_empty()
    }

    #[must_use]
    pub fn array(&self) -> &Array {
        &self.array
    }

    #[must_use]
    pub fn bdims(&self) -> &[BatchDim] {
        &self.bdims
    }

    /// The set of levels tagged on this array.
    #[must_use]
    pub fn level_set(&self) -> LevelSet {
        self.bdims.iter().map(|bdim| bdim.level).collect()
    }

    /// Rank as seen by the operation author: physical rank minus the number
    /// of tagged dimensions.
    #[must_use]
    pub fn logical_rank(&self) -> usize {
        self.array.rank() - self.bdims.len()
    }

    /// Extent of the batch dimension contributed by `level`, if this array
    /// carries it.
    #[must_use]
    pub fn size_of_level(&self, level: usize) -> Option<i64> {
        self.bdims
            .iter()
            .find(|bdim| bdim.level == level)
            .map(|bdim| self.array.size(bdim.dim))
    }
}
