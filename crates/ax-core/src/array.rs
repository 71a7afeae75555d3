use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

/// Dimension sizes, strides, and permutation scratch. Inline capacity covers
/// the ranks batching rules actually see; deeper nesting spills to the heap.
pub type DimVec = SmallVec<[i64; 8]>;

/// Shared element storage. Views hand out `Arc` clones of this and never
/// write through it.
#[derive(Debug)]
struct ArrayStorage {
    elements: Vec<f64>,
}

/// A strided view over shared storage.
///
/// All shape operations (`permute`, `unsqueeze`, `expand`, `select`) are
/// pure metadata transforms: they produce a new `Array` sharing the same
/// storage. `expand` broadcasts a size-1 dimension by giving it stride 0,
/// so no element is ever duplicated.
///
/// Misusing a view operation (bad permutation, expanding a non-unit
/// dimension, out-of-range select) is a bug in the calling batching rule,
/// not a user error, and panics with a descriptive message.
#[derive(Debug, Clone)]
pub struct Array {
    storage: Arc<ArrayStorage>,
    sizes: DimVec,
    strides: DimVec,
    offset: i64,
}

/// Construction failure for [`Array::from_elements`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArrayError {
    /// The element buffer does not match the product of the requested sizes.
    ElementCountMismatch { expected: u64, got: usize },
    /// The requested sizes overflow when multiplied together.
    ShapeOverflow { sizes: Vec<i64> },
}

impl fmt::Display for ArrayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ElementCountMismatch { expected, got } => {
                write!(f, "shape requires {expected} elements, got {got}")
            }
            Self::ShapeOverflow { sizes } => {
                write!(f, "element count of shape {sizes:?} overflows u64")
            }
        }
    }
}

impl std::error::Error for ArrayError {}

fn contiguous_strides(sizes: &[i64]) -> DimVec {
    let mut strides: DimVec = SmallVec::from_elem(1, sizes.len());
    let mut running = 1;
    for dim in (0..sizes.len()).rev() {
        strides[dim] = running;
        running *= sizes[dim];
    }
    strides
}

fn checked_element_count(sizes: &[i64]) -> Result<u64, ArrayError> {
    sizes
        .iter()
        .try_fold(1_u64, |acc, size| {
            let size = u64::try_from(*size).ok()?;
            acc.checked_mul(size)
        })
        .ok_or_else(|| ArrayError::ShapeOverflow {
            sizes: sizes.to_vec(),
        })
}

impl Array {
    /// Build a contiguous array from an element buffer and a shape.
    pub fn from_elements(elements: Vec<f64>, sizes: &[i64]) -> Result<Self, ArrayError> {
        let expected = checked_element_count(sizes)?;
        if expected != elements.len() as u64 {
            return Err(ArrayError::ElementCountMismatch {
                expected,
                got: elements.len(),
            });
        }
        Ok(Self {
            storage: Arc::new(ArrayStorage { elements }),
            sizes: sizes.iter().copied().collect(),
            strides: contiguous_strides(sizes),
            offset: 0,
        })
    }

    /// Contiguous array filled with ones. Shape-metadata tests only care
    /// about sizes and strides, so the fill value is arbitrary.
    #[must_use]
    pub fn ones(sizes: &[i64]) -> Self {
        let count = checked_element_count(sizes)
            .unwrap_or_else(|err| panic!("ones: {err}"));
        Self {
            storage: Arc::new(ArrayStorage {
                elements: vec![1.0; count as usize],
            }),
            sizes: sizes.iter().copied().collect(),
            strides: contiguous_strides(sizes),
            offset: 0,
        }
    }

    #[must_use]
    pub fn rank(&self) -> usize {
        self.sizes.len()
    }

    #[must_use]
    pub fn size(&self, dim: usize) -> i64 {
        assert!(
            dim < self.rank(),
            "dimension {dim} out of range for rank {}",
            self.rank()
        );
        self.sizes[dim]
    }

    #[must_use]
    pub fn sizes(&self) -> &[i64] {
        &self.sizes
    }

    #[must_use]
    pub fn strides(&self) -> &[i64] {
        &self.strides
    }

    /// Number of elements the view presents. Broadcast dimensions count at
    /// their expanded size even though they alias storage.
    #[must_use]
    pub fn numel(&self) -> u64 {
        self.sizes.iter().map(|&size| size as u64).product()
    }

    /// Reorder dimensions. `order[i]` names the source dimension that lands
    /// at position `i` of the result.
    #[must_use]
    pub fn permute(&self, order: &[usize]) -> Self {
        assert_eq!(
            order.len(),
            self.rank(),
            "permutation has {} entries for rank {}",
            order.len(),
            self.rank()
        );
        let mut seen = vec![false; self.rank()];
        let mut sizes = DimVec::with_capacity(self.rank());
        let mut strides = DimVec::with_capacity(self.rank());
        for &source in order {
            assert!(
                source < self.rank() && !seen[source],
                "invalid permutation {order:?} for rank {}",
                self.rank()
            );
            seen[source] = true;
            sizes.push(self.sizes[source]);
            strides.push(self.strides[source]);
        }
        Self {
            storage: Arc::clone(&self.storage),
            sizes,
            strides,
            offset: self.offset,
        }
    }

    /// Insert a size-1 dimension at `dim`. The new dimension carries stride
    /// 0 so a later `expand` can broadcast it in place.
    #[must_use]
    pub fn unsqueeze(&self, dim: usize) -> Self {
        assert!(
            dim <= self.rank(),
            "unsqueeze position {dim} out of range for rank {}",
            self.rank()
        );
        let mut sizes = self.sizes.clone();
        let mut strides = self.strides.clone();
        sizes.insert(dim, 1);
        strides.insert(dim, 0);
        Self {
            storage: Arc::clone(&self.storage),
            sizes,
            strides,
            offset: self.offset,
        }
    }

    /// Broadcast to `target` without copying: every dimension must either
    /// match or be size 1, and broadcast dimensions get stride 0.
    #[must_use]
    pub fn expand(&self, target: &[i64]) -> Self {
        assert_eq!(
            target.len(),
            self.rank(),
            "expand target rank {} does not match view rank {}",
            target.len(),
            self.rank()
        );
        let mut strides = self.strides.clone();
        for dim in 0..self.rank() {
            if self.sizes[dim] == target[dim] {
                continue;
            }
            assert!(
                self.sizes[dim] == 1,
                "cannot expand dimension {dim} of size {} to {}",
                self.sizes[dim],
                target[dim]
            );
            strides[dim] = 0;
        }
        Self {
            storage: Arc::clone(&self.storage),
            sizes: target.iter().copied().collect(),
            strides,
            offset: self.offset,
        }
    }

    /// Index into `dim` at `index`, removing that dimension from the view.
    #[must_use]
    pub fn select(&self, dim: usize, index: i64) -> Self {
        assert!(
            dim < self.rank(),
            "select dimension {dim} out of range for rank {}",
            self.rank()
        );
        assert!(
            index >= 0 && index < self.sizes[dim],
            "select index {index} out of range for dimension {dim} of size {}",
            self.sizes[dim]
        );
        let mut sizes = self.sizes.clone();
        let mut strides = self.strides.clone();
        let offset = self.offset + index * strides[dim];
        sizes.remove(dim);
        strides.remove(dim);
        Self {
            storage: Arc::clone(&self.storage),
            sizes,
            strides,
            offset,
        }
    }

    /// Read one element through the strides. Used by tests to verify that
    /// expanded views alias storage instead of copying it.
    #[must_use]
    pub fn at(&self, indices: &[i64]) -> f64 {
        assert_eq!(
            indices.len(),
            self.rank(),
            "index has {} coordinates for rank {}",
            indices.len(),
            self.rank()
        );
        let mut position = self.offset;
        for dim in 0..self.rank() {
            assert!(
                indices[dim] >= 0 && indices[dim] < self.sizes[dim],
                "coordinate {} out of range for dimension {dim} of size {}",
                indices[dim],
                self.sizes[dim]
            );
            position += indices[dim] * self.strides[dim];
        }
        self.storage.elements[position as usize]
    }

    /// Whether two views alias the same underlying storage.
    #[must_use]
    pub fn shares_storage_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }
}
