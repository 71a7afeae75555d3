#![forbid(unsafe_code)]

//! Logical-to-physical batching transforms for nested vmap.
//!
//! Consider `vmap(vmap(f, in_dims=2), in_dims=0)` applied to an array of
//! shape `[2, 3, 4]`. The result of tracing is a [`BatchedArray`] tagged
//! with `(level=1, dim=0)` and `(level=2, dim=2)`: inside `f` the array
//! *logically* has shape `[3]`, while the *physical* storage still has
//! shape `[2, 3, 4]`.
//!
//! Batching rules bridge the two views with the transforms in this crate:
//! convert logical arguments to physical ones with a transform's
//! `logical_to_physical`, run a plain (non-batched) operation on the
//! underlying arrays, then wrap each physical result back into a logical
//! [`BatchedArray`] via [`VmapPhysicalView::new_logical_from_physical`].
//!
//! [`BatchedArray`]: ax_core::BatchedArray

mod physical_view;
mod transforms;

pub use physical_view::{VmapError, VmapPhysicalView};
pub use transforms::{BroadcastingVmapTransform, MultiBatchVmapTransform};
