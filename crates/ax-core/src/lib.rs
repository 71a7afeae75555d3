#![forbid(unsafe_code)]

//! Array and batched-array capability layer consumed by the `ax-vmap`
//! transforms.
//!
//! An [`Array`] is a strided metadata view over shared storage: permute,
//! expand, unsqueeze, and select all produce new views without touching
//! element data. A [`BatchedArray`] tags an `Array` with a set of
//! `(level, dim)` pairs recording which physical dimensions were introduced
//! by which nesting depth of vmap. Numeric kernels, allocation strategy,
//! and autograd live elsewhere; this crate only deals in shape metadata.

pub mod array;
pub mod batched;
pub mod level;

pub use array::{Array, ArrayError, DimVec};
pub use batched::{BatchDim, BatchDims, BatchedArray};
pub use level::{LevelSet, Levels, MAX_LEVELS};
