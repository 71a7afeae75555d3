use crate::physical_view::VmapPhysicalView;
use ax_core::{Array, BatchDims, BatchedArray, DimVec, LevelSet, MAX_LEVELS};
use smallvec::SmallVec;

/// Extent of each level, gathered over all inputs of one transform call.
/// Indexed directly by level; slots for absent levels stay zero. The level
/// universe is one machine word wide, so a flat array beats any map.
type LevelSizes = [i64; MAX_LEVELS];

/// Permute an array's own tagged batch dimensions to the front, ascending
/// by level; logical dimensions keep their relative order behind them.
fn permute_batch_dims_to_front(input: &BatchedArray) -> (Array, LevelSet) {
    let rank = input.array().rank();
    let mut sorted: BatchDims = input.bdims().iter().copied().collect();
    sorted.sort_unstable_by_key(|bdim| bdim.level);

    let mut is_batch = vec![false; rank];
    for bdim in &sorted {
        is_batch[bdim.dim] = true;
    }
    let mut order: SmallVec<[usize; 8]> = SmallVec::with_capacity(rank);
    order.extend(sorted.iter().map(|bdim| bdim.dim));
    order.extend((0..rank).filter(|dim| !is_batch[*dim]));

    (input.array().permute(&order), input.level_set())
}

/// Union the level sets of all inputs and record each level's extent.
///
/// All arrays sharing a level must agree on that level's extent; the wider
/// vmap machinery enforces this when levels are created, so it is only
/// re-checked in debug builds here.
fn collect_level_sizes(inputs: &[BatchedArray]) -> (LevelSet, LevelSizes) {
    let mut union = LevelSet::empty();
    let mut sizes: LevelSizes = [0; MAX_LEVELS];
    for input in inputs {
        for bdim in input.bdims() {
            let extent = input.array().size(bdim.dim);
            debug_assert!(
                !union.contains(bdim.level) || sizes[bdim.level] == extent,
                "inputs disagree on the extent of level {}: {} vs {extent}",
                bdim.level,
                sizes[bdim.level]
            );
            union.insert(bdim.level);
            sizes[bdim.level] = extent;
        }
    }
    (union, sizes)
}

/// The shared alignment step behind both transforms.
///
/// Moves the input's own batch dims to the front in ascending-level order,
/// inserts a size-1 slot for every requested level the input lacks (at the
/// front position ascending-level order dictates) and broadcast-expands it
/// to the level's true extent, then pads the front of the logical block
/// with size-1 dims up to `requested_logical_rank`. Everything is a view;
/// no element is copied.
fn align_batch_dims_at_front(
    input: &BatchedArray,
    requested_levels: LevelSet,
    level_sizes: &LevelSizes,
    requested_logical_rank: usize,
) -> Array {
    let (physical, own_levels) = permute_batch_dims_to_front(input);
    let own_logical_rank = physical.rank() - own_levels.count();
    debug_assert!(requested_logical_rank >= own_logical_rank);

    let num_batch_dims = requested_levels.count();
    let mut aligned = physical;
    for (front, level) in requested_levels.iter().enumerate() {
        if !own_levels.contains(level) {
            aligned = aligned.unsqueeze(front);
        }
    }
    for _ in own_logical_rank..requested_logical_rank {
        aligned = aligned.unsqueeze(num_batch_dims);
    }

    // Expand the freshly inserted batch slots to their true extents. The
    // logical padding stays size 1: downstream elementwise broadcasting
    // absorbs it.
    let mut target: DimVec = aligned.sizes().iter().copied().collect();
    for (front, level) in requested_levels.iter().enumerate() {
        if !own_levels.contains(level) {
            target[front] = level_sizes[level];
        }
    }
    aligned.expand(&target)
}

/// Transform for operations whose batching rules accept arbitrary-rank
/// operands (no elementwise broadcasting between them).
///
/// `logical_to_physical` permutes every input's batch dims to the front and,
/// in the multi-array form, aligns and expands them so that each output
/// carries the batch dims of *every* level present in *any* input — a later
/// joint operation then sees the same physical batch layout across all of
/// its arguments.
pub struct MultiBatchVmapTransform;

impl MultiBatchVmapTransform {
    /// Single-array form: batch dims go to the front, levels are the
    /// array's own. An unbatched input comes back unchanged with an empty
    /// level set.
    #[must_use]
    pub fn logical_to_physical(input: &BatchedArray) -> VmapPhysicalView {
        let (physical, levels) = permute_batch_dims_to_front(input);
        VmapPhysicalView::new(physical, levels)
    }

    /// Multi-array form, one output view per input in order. Levels an
    /// input lacks are filled with broadcast-expanded size-1 dims at the
    /// positions ascending-level order dictates.
    #[must_use]
    pub fn logical_to_physical_many(inputs: &[BatchedArray]) -> Vec<VmapPhysicalView> {
        let (union_levels, level_sizes) = collect_level_sizes(inputs);
        inputs
            .iter()
            .map(|input| {
                let aligned = align_batch_dims_at_front(
                    input,
                    union_levels,
                    &level_sizes,
                    input.logical_rank(),
                );
                VmapPhysicalView::new(aligned, union_levels)
            })
            .collect()
    }
}

/// Transform for operations that broadcast all of their inputs elementwise.
///
/// On top of the multi-batch alignment, every output is padded with size-1
/// dims between the batch block and its logical dims until all outputs have
/// equal total rank, lining the logical dims up from the right — standard
/// elementwise-broadcast convention. Outputs always carry a batch dim for
/// every collective level, even where the kernel's own broadcasting could
/// have coped without one: uniform rank keeps the kernel simple and the
/// expansion is a free view.
pub struct BroadcastingVmapTransform;

impl BroadcastingVmapTransform {
    #[must_use]
    pub fn logical_to_physical(inputs: &[BatchedArray]) -> Vec<VmapPhysicalView> {
        let (union_levels, level_sizes) = collect_level_sizes(inputs);
        let max_logical_rank = inputs
            .iter()
            .map(BatchedArray::logical_rank)
            .max()
            .unwrap_or(0);
        inputs
            .iter()
            .map(|input| {
                let aligned =
                    align_batch_dims_at_front(input, union_levels, &level_sizes, max_logical_rank);
                VmapPhysicalView::new(aligned, union_levels)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ax_core::BatchDim;

    fn batched(sizes: &[i64], bdims: &[(usize, usize)]) -> BatchedArray {
        BatchedArray::new(
            Array::ones(sizes),
            bdims
                .iter()
                .map(|&(level, dim)| BatchDim::new(level, dim))
                .collect(),
        )
    }

    // ── MultiBatchVmapTransform ────────────────────────────────────

    #[test]
    fn single_input_moves_batch_dims_to_front() {
        // Logical shape [3] under two nesting levels of extent 2 and 4.
        let input = batched(&[2, 3, 4], &[(1, 0), (2, 2)]);
        let view = MultiBatchVmapTransform::logical_to_physical(&input);
        assert_eq!(view.array().sizes(), &[2, 4, 3]);
        assert_eq!(view.levels().count(), 2);
        assert_eq!(view.num_logical_dims(), 1);
        assert_eq!(view.get_physical_dim(0).unwrap(), 2);
    }

    #[test]
    fn single_input_orders_front_by_level_not_by_dim() {
        // Level 7 tagged on dim 0, level 3 on dim 2: level 3 is outermost.
        let input = batched(&[2, 5, 4], &[(7, 0), (3, 2)]);
        let view = MultiBatchVmapTransform::logical_to_physical(&input);
        assert_eq!(view.array().sizes(), &[4, 2, 5]);
    }

    #[test]
    fn single_unbatched_input_is_unchanged() {
        let input = BatchedArray::unbatched(Array::ones(&[3, 5]));
        let view = MultiBatchVmapTransform::logical_to_physical(&input);
        assert_eq!(view.array().sizes(), &[3, 5]);
        assert!(view.levels().is_empty());
        assert_eq!(view.num_logical_dims(), 2);
    }

    #[test]
    fn many_outputs_report_the_union_of_levels() {
        let lhs = batched(&[2, 3], &[(0, 0)]);
        let rhs = batched(&[4, 3], &[(1, 0)]);
        let views = MultiBatchVmapTransform::logical_to_physical_many(&[lhs, rhs]);
        let expected: LevelSet = [0, 1].into_iter().collect();
        for view in &views {
            assert_eq!(view.levels(), expected);
            assert_eq!(view.num_batch_dims(), 2);
        }
        // Each missing level was expanded to its true extent.
        assert_eq!(views[0].array().sizes(), &[2, 4, 3]);
        assert_eq!(views[1].array().sizes(), &[2, 4, 3]);
    }

    #[test]
    fn many_preserves_each_inputs_logical_rank() {
        let vector = batched(&[2, 3], &[(0, 0)]);
        let matrix = batched(&[5, 6], &[]);
        let views = MultiBatchVmapTransform::logical_to_physical_many(&[vector, matrix]);
        assert_eq!(views[0].array().sizes(), &[2, 3]);
        // The unbatched matrix gains only the batch dim, nothing else.
        assert_eq!(views[1].array().sizes(), &[2, 5, 6]);
        assert_eq!(views[1].num_logical_dims(), 2);
    }

    #[test]
    fn missing_level_expansion_is_a_view_not_a_copy() {
        let carrier = batched(&[4, 2], &[(0, 0)]);
        let absent = batched(&[2], &[]);
        let views =
            MultiBatchVmapTransform::logical_to_physical_many(&[carrier, absent.clone()]);
        assert_eq!(views[1].array().sizes(), &[4, 2]);
        assert!(views[1].array().shares_storage_with(absent.array()));
        // Broadcast slices all alias the same elements.
        assert_eq!(views[1].array().strides()[0], 0);
    }

    #[test]
    fn round_trip_recovers_front_to_back_tagging() {
        let input = batched(&[2, 3, 4], &[(5, 2), (1, 0)]);
        let view = MultiBatchVmapTransform::logical_to_physical(&input);
        let rebuilt = view.new_logical_from_physical(view.array().clone());
        let bdims = rebuilt.bdims();
        assert_eq!(bdims[0], BatchDim::new(1, 0));
        assert_eq!(bdims[1], BatchDim::new(5, 1));
        assert_eq!(rebuilt.level_set(), input.level_set());
    }

    // ── BroadcastingVmapTransform ──────────────────────────────────

    #[test]
    fn broadcasting_worked_example() {
        // Logical [2] and [3, 2], both under batch level 0 of extent 4.
        let lhs = batched(&[4, 2], &[(0, 0)]);
        let rhs = batched(&[4, 3, 2], &[(0, 0)]);
        let views = BroadcastingVmapTransform::logical_to_physical(&[lhs, rhs]);
        assert_eq!(views[0].array().sizes(), &[4, 1, 2]);
        assert_eq!(views[1].array().sizes(), &[4, 3, 2]);
    }

    #[test]
    fn broadcasting_over_aligns_unbatched_inputs() {
        // (B, 2) against plain (2,): the plain input still gets a size-B
        // batch dim so the downstream kernel sees uniform rank.
        let lhs = batched(&[4, 2], &[(0, 0)]);
        let rhs = batched(&[2], &[]);
        let views = BroadcastingVmapTransform::logical_to_physical(&[lhs, rhs]);
        assert_eq!(views[0].array().sizes(), &[4, 2]);
        assert_eq!(views[1].array().sizes(), &[4, 2]);
        assert_eq!(views[1].array().strides()[0], 0);
    }

    #[test]
    fn broadcasting_equalizes_total_rank() {
        let a = batched(&[2, 3], &[(0, 0)]);
        let b = batched(&[5, 4, 6, 7], &[(2, 1)]);
        let c = batched(&[9], &[]);
        let views = BroadcastingVmapTransform::logical_to_physical(&[a, b, c]);
        let rank = views[0].array().rank();
        assert!(views.iter().all(|view| view.array().rank() == rank));
        // Batch block: levels 0 (extent 2) and 2 (extent 4); logical block
        // right-aligned at width 3.
        assert_eq!(views[0].array().sizes(), &[2, 4, 1, 1, 3]);
        assert_eq!(views[1].array().sizes(), &[2, 4, 5, 6, 7]);
        assert_eq!(views[2].array().sizes(), &[2, 4, 1, 1, 9]);
        // Trailing logical sizes pairwise match or are 1.
        for lhs in &views {
            for rhs in &views {
                for (a, b) in lhs.array().sizes()[2..]
                    .iter()
                    .rev()
                    .zip(rhs.array().sizes()[2..].iter().rev())
                {
                    assert!(a == b || *a == 1 || *b == 1);
                }
            }
        }
    }

    #[test]
    fn broadcasting_of_nothing_is_nothing() {
        assert!(BroadcastingVmapTransform::logical_to_physical(&[]).is_empty());
    }

    #[test]
    fn interleaved_levels_slot_into_ascending_positions() {
        // One input carries levels {1, 5}, the other {3}. In the union the
        // level-3 slot sits between the level-1 and level-5 dims.
        let outer = batched(&[2, 6, 3], &[(1, 0), (5, 1)]);
        let inner = batched(&[4, 3], &[(3, 0)]);
        let views = MultiBatchVmapTransform::logical_to_physical_many(&[outer, inner]);
        assert_eq!(views[0].array().sizes(), &[2, 4, 6, 3]);
        assert_eq!(views[1].array().sizes(), &[2, 4, 6, 3]);
        let levels: Vec<usize> = views[0].levels().iter().collect();
        assert_eq!(levels, vec![1, 3, 5]);
    }
}
