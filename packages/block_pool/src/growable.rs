use std::alloc::Layout;
use std::collections::{BTreeMap, VecDeque};
use std::num::NonZero;
use std::ptr::NonNull;

use nm::{Event, Magnitude};

use crate::{DropPolicy, FixedBlockPool, GrowablePoolBuilder, MAX_BLOCKS_PER_POOL, Result};

const SLAB_BLOCKS_BUCKETS: &[Magnitude] = &[16, 64, 128, 256, 1024, 4096, 16384, 65536];

thread_local! {
    static SLABS_CREATED: Event = Event::builder()
        .name("block_pool_slabs_created")
        .build();

    static SLABS_DISCARDED: Event = Event::builder()
        .name("block_pool_slabs_discarded")
        .build();

    static SLAB_BLOCKS: Event = Event::builder()
        .name("block_pool_slab_blocks")
        .histogram(SLAB_BLOCKS_BUCKETS)
        .build();
}

/// A dynamically growing pool of equal-size memory blocks, assembled from [`FixedBlockPool`]
/// slabs.
///
/// When every slab is exhausted, the pool creates a new slab whose block count is the total
/// number of blocks already reserved scaled by the growth factor (but never fewer than the
/// initial block count and never more than [`MAX_BLOCKS_PER_POOL`]).
///
/// Allocation takes a block from the first slab known to have free capacity and is amortized
/// O(1). Releasing a block finds the owning slab by its base address in O(log P) for P slabs.
/// Slabs are never returned to the process implicitly - call [`shrink()`](Self::shrink) to drop
/// slabs that no longer have any allocated blocks.
///
/// The first slab is created lazily, by the first allocation.
///
/// # Examples
///
/// ```
/// use block_pool::GrowablePool;
/// use new_zealand::nz;
///
/// let mut pool = GrowablePool::builder()
///     .block_layout_of::<u64>()
///     .initial_blocks(nz!(4))
///     .growth_factor(2.0)
///     .build();
///
/// assert_eq!(pool.capacity(), 0);
///
/// let blocks = (0..5)
///     .map(|_| pool.allocate())
///     .collect::<Result<Vec<_>, _>>()?;
///
/// // The fifth block did not fit into the first slab of 4, so a slab of 8 was added.
/// assert_eq!(pool.pool_count(), 2);
/// assert_eq!(pool.capacity(), 12);
///
/// for block in blocks {
///     pool.release(block);
/// }
///
/// assert_eq!(pool.shrink(), 2);
/// assert_eq!(pool.capacity(), 0);
/// # Ok::<(), block_pool::Error>(())
/// ```
///
/// # Thread safety
///
/// The pool is thread-mobile ([`Send`]) but not thread-safe ([`Sync`]). It performs no
/// internal locking; callers that share a pool must serialize access externally.
#[derive(Debug)]
pub struct GrowablePool {
    block_layout: Layout,
    initial_blocks: NonZero<usize>,
    growth_factor: f32,
    drop_policy: DropPolicy,

    /// Every slab we own, keyed by the address of its first block. The slabs do not overlap,
    /// so the owner of any block is the slab with the greatest base address not above it.
    pools: BTreeMap<usize, FixedBlockPool>,

    /// Base addresses of the slabs that have at least one free block. A slab is in this queue
    /// if and only if it is not exhausted.
    available: VecDeque<usize>,

    /// Total number of blocks across all slabs, allocated or not.
    reserved_blocks: usize,

    /// Number of blocks currently handed out to callers.
    length: usize,
}

impl GrowablePool {
    /// Creates a builder for configuring and constructing a [`GrowablePool`].
    ///
    /// The block layout is mandatory, other settings are optional.
    ///
    /// # Example
    ///
    /// ```
    /// use block_pool::GrowablePool;
    ///
    /// let pool = GrowablePool::builder().block_layout_of::<[u8; 48]>().build();
    ///
    /// assert!(pool.is_empty());
    /// ```
    #[inline]
    pub fn builder() -> GrowablePoolBuilder {
        GrowablePoolBuilder::new()
    }

    #[must_use]
    pub(crate) fn new_inner(
        block_layout: Layout,
        initial_blocks: NonZero<usize>,
        growth_factor: f32,
        drop_policy: DropPolicy,
    ) -> Self {
        assert!(
            block_layout.size() > 0,
            "GrowablePool must have non-zero block size"
        );
        assert!(
            initial_blocks.get() <= MAX_BLOCKS_PER_POOL,
            "GrowablePool cannot start with {initial_blocks} blocks per slab, the limit is {MAX_BLOCKS_PER_POOL}"
        );
        assert!(
            growth_factor.is_finite() && growth_factor > 1.0,
            "GrowablePool growth factor must be a finite number greater than 1.0, got {growth_factor}"
        );

        Self {
            block_layout,
            initial_blocks,
            growth_factor,
            drop_policy,
            pools: BTreeMap::new(),
            available: VecDeque::new(),
            reserved_blocks: 0,
            length: 0,
        }
    }

    /// The memory layout every block of the pool is able to hold.
    #[must_use]
    #[inline]
    pub fn block_layout(&self) -> Layout {
        self.block_layout
    }

    /// The number of blocks the first slab is created with, and the minimum size of any
    /// later slab.
    #[must_use]
    #[inline]
    pub fn initial_blocks(&self) -> NonZero<usize> {
        self.initial_blocks
    }

    /// The factor by which the total reserved block count is scaled to size a new slab.
    #[must_use]
    #[inline]
    pub fn growth_factor(&self) -> f32 {
        self.growth_factor
    }

    /// The number of blocks currently handed out to callers.
    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        debug_assert_eq!(
            self.length,
            self.pools.values().map(FixedBlockPool::len).sum::<usize>()
        );

        self.length
    }

    /// Whether no blocks are currently handed out to callers.
    ///
    /// An empty pool may still be holding slabs; see [`shrink()`](Self::shrink).
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// The total number of blocks in all slabs, allocated or not.
    #[must_use]
    #[inline]
    pub fn capacity(&self) -> usize {
        self.reserved_blocks
    }

    /// The number of slabs the pool currently owns.
    #[must_use]
    #[inline]
    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Takes a free block out of the pool and returns its address, creating a new slab if
    /// every existing slab is exhausted.
    ///
    /// The memory of the block is not initialized.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`](crate::Error::OutOfMemory) if a new slab was needed but
    /// the process allocator could not supply it. The pool is left unchanged in that case.
    pub fn allocate(&mut self) -> Result<NonNull<u8>> {
        let base = match self.available.front() {
            Some(&base) => base,
            None => self.grow()?,
        };

        let pool = self
            .pools
            .get_mut(&base)
            .expect("the available queue only refers to slabs we own");

        let block = pool
            .allocate()
            .expect("the available queue only refers to slabs with a free block");

        if pool.is_exhausted() {
            self.available.pop_front();
        }

        // Cannot overflow because that would imply more blocks than fit in virtual memory.
        self.length = self.length.wrapping_add(1);

        Ok(block)
    }

    /// Returns a block previously handed out by [`allocate()`](Self::allocate) to the pool.
    ///
    /// The owning slab is found by its base address in O(log P) for P slabs. The block must
    /// not be used by the caller after it has been released.
    ///
    /// # Panics
    ///
    /// Panics if the block does not belong to any slab of this pool. In debug builds, also
    /// panics if the block is already free.
    pub fn release(&mut self, block: NonNull<u8>) {
        let address = block.addr().get();

        let Some((&base, pool)) = self
            .pools
            .range_mut(..=address)
            .next_back()
            .filter(|(_, pool)| pool.contains(block))
        else {
            panic!("released block {block:?} does not belong to any slab of this GrowablePool");
        };

        let was_exhausted = pool.is_exhausted();
        pool.release(block);

        if was_exhausted {
            self.available.push_back(base);
        }

        // Cannot wrap because the block we just released was counted when allocated.
        self.length = self.length.wrapping_sub(1);
    }

    /// Drops every slab that has no allocated blocks, returning its memory to the process.
    ///
    /// Returns the number of slabs dropped. Allocated blocks are never affected.
    ///
    /// This is O(P) for P slabs and is never done implicitly by the pool.
    pub fn shrink(&mut self) -> usize {
        let pools_before = self.pools.len();
        let mut released_blocks: usize = 0;

        self.pools.retain(|_, pool| {
            if !pool.is_unused() {
                return true;
            }

            // Cannot overflow because the sum is bounded by reserved_blocks.
            released_blocks = released_blocks.wrapping_add(pool.num_blocks().get());
            false
        });

        self.available.retain(|base| self.pools.contains_key(base));

        // Cannot wrap because we only subtract blocks of slabs that were counted when created.
        self.reserved_blocks = self.reserved_blocks.wrapping_sub(released_blocks);

        // Cannot wrap because retain() only ever removes elements.
        let discarded = pools_before.wrapping_sub(self.pools.len());

        if discarded > 0 {
            SLABS_DISCARDED.with(|event| event.batch(discarded).observe_once());

            tracing::debug!(
                discarded,
                released_blocks,
                remaining = self.pools.len(),
                "shrank block pool"
            );
        }

        #[cfg(debug_assertions)]
        self.integrity_check();

        discarded
    }

    /// Creates a new slab, registers it and marks it available. Returns its base address.
    fn grow(&mut self) -> Result<usize> {
        let num_blocks = self.next_slab_blocks();

        let pool =
            FixedBlockPool::with_drop_policy(num_blocks, self.block_layout, self.drop_policy)?;
        let base = pool.base_address().addr().get();

        self.pools.insert(base, pool);
        self.available.push_back(base);

        // Cannot overflow because that would imply more blocks than fit in virtual memory.
        self.reserved_blocks = self.reserved_blocks.wrapping_add(num_blocks.get());

        SLABS_CREATED.with(Event::observe_once);
        SLAB_BLOCKS.with(|event| event.observe(num_blocks.get()));

        tracing::debug!(
            slab_blocks = num_blocks.get(),
            reserved_blocks = self.reserved_blocks,
            slabs = self.pools.len(),
            "grew block pool"
        );

        Ok(base)
    }

    /// The block count of the next slab: the reserved total scaled by the growth factor, but
    /// at least the initial block count and at most the per-slab ceiling.
    #[expect(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        reason = "block counts are far below the f64 mantissa limit and the result is clamped"
    )]
    fn next_slab_blocks(&self) -> NonZero<usize> {
        let scaled = (self.reserved_blocks as f64 * f64::from(self.growth_factor)).round();

        let scaled = if scaled >= MAX_BLOCKS_PER_POOL as f64 {
            MAX_BLOCKS_PER_POOL
        } else {
            scaled as usize
        };

        scaled
            .clamp(self.initial_blocks.get(), MAX_BLOCKS_PER_POOL)
            .try_into()
            .expect("clamped to at least the initial block count, which is non-zero")
    }

    /// Verifies that the slab map, the available queue and the counters agree.
    #[cfg_attr(test, mutants::skip)] // This is essentially test logic, mutation is meaningless.
    #[cfg(debug_assertions)]
    pub(crate) fn integrity_check(&self) {
        let mut previous_end: Option<usize> = None;

        for (&base, pool) in &self.pools {
            assert_eq!(
                base,
                pool.base_address().addr().get(),
                "slab registered under the wrong base address"
            );

            if let Some(previous_end) = previous_end {
                assert!(base >= previous_end, "slabs at {base:#x} and before overlap");
            }

            previous_end = Some(
                base.wrapping_add(pool.num_blocks().get().wrapping_mul(pool.block_size().get())),
            );

            let queued = self.available.iter().filter(|&&queued| queued == base).count();
            let expected = usize::from(!pool.is_exhausted());

            assert_eq!(
                queued, expected,
                "slab at {base:#x} is queued {queued} times but should be queued {expected} times"
            );

            pool.integrity_check();
        }

        assert_eq!(
            self.available.len(),
            self.pools.values().filter(|pool| !pool.is_exhausted()).count(),
            "available queue refers to slabs we do not own"
        );

        assert_eq!(
            self.reserved_blocks,
            self.pools
                .values()
                .map(|pool| pool.num_blocks().get())
                .sum::<usize>()
        );
    }
}

#[cfg(test)]
#[allow(
    clippy::indexing_slicing,
    reason = "test code doesn't need the same rigor as production code"
)]
mod tests {
    use std::collections::HashSet;

    use new_zealand::nz;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::Error;

    assert_impl_all!(GrowablePool: Send, std::fmt::Debug);
    assert_not_impl_any!(GrowablePool: Sync, Clone);

    fn pool(initial_blocks: NonZero<usize>, growth_factor: f32) -> GrowablePool {
        GrowablePool::builder()
            .block_layout_of::<u64>()
            .initial_blocks(initial_blocks)
            .growth_factor(growth_factor)
            .build()
    }

    fn allocate_n(pool: &mut GrowablePool, count: usize) -> Vec<NonNull<u8>> {
        (0..count).map(|_| pool.allocate().unwrap()).collect()
    }

    #[test]
    fn first_slab_is_created_lazily() {
        let mut pool = pool(nz!(4), 2.0);

        assert_eq!(pool.pool_count(), 0);
        assert_eq!(pool.capacity(), 0);

        let block = pool.allocate().unwrap();

        assert_eq!(pool.pool_count(), 1);
        assert_eq!(pool.capacity(), 4);

        pool.release(block);
    }

    #[test]
    fn fifth_block_grows_by_factor() {
        let mut pool = pool(nz!(4), 2.0);

        let mut blocks = allocate_n(&mut pool, 4);
        assert_eq!(pool.pool_count(), 1);

        blocks.push(pool.allocate().unwrap());

        assert_eq!(pool.pool_count(), 2);
        assert!(pool.capacity() >= 8);
        assert_eq!(pool.capacity(), 4 + 8);

        for block in blocks {
            pool.release(block);
        }
    }

    #[test]
    fn slabs_grow_geometrically() {
        let mut pool = pool(nz!(2), 2.0);

        // 2, then 2 * 2 = 4, then 6 * 2 = 12, then 18 * 2 = 36.
        let blocks = allocate_n(&mut pool, 2 + 4 + 12 + 1);

        assert_eq!(pool.pool_count(), 4);
        assert_eq!(pool.capacity(), 2 + 4 + 12 + 36);

        for block in blocks {
            pool.release(block);
        }
    }

    #[test]
    fn small_growth_factor_still_uses_initial_blocks_as_minimum() {
        let mut pool = pool(nz!(10), 1.01);

        let blocks = allocate_n(&mut pool, 11);

        // round(10 * 1.01) = 10, which equals the initial block count.
        assert_eq!(pool.capacity(), 20);

        for block in blocks {
            pool.release(block);
        }
    }

    #[test]
    fn slab_size_is_capped_at_ceiling() {
        let mut pool = GrowablePool::builder()
            .block_layout_of::<u8>()
            .initial_blocks(NonZero::new(MAX_BLOCKS_PER_POOL).unwrap())
            .growth_factor(4.0)
            .build();

        let blocks = allocate_n(&mut pool, MAX_BLOCKS_PER_POOL + 1);

        assert_eq!(pool.pool_count(), 2);
        assert_eq!(pool.capacity(), 2 * MAX_BLOCKS_PER_POOL);

        for block in blocks {
            pool.release(block);
        }
    }

    #[test]
    fn allocated_blocks_are_distinct() {
        let mut pool = pool(nz!(3), 1.5);

        let blocks = allocate_n(&mut pool, 500);
        let distinct: HashSet<_> = blocks.iter().copied().collect();

        assert_eq!(distinct.len(), 500);
        assert_eq!(pool.len(), 500);

        for block in blocks {
            pool.release(block);
        }

        assert!(pool.is_empty());

        #[cfg(debug_assertions)]
        pool.integrity_check();
    }

    #[test]
    fn released_blocks_are_reused_before_growing() {
        let mut pool = pool(nz!(4), 2.0);

        let blocks = allocate_n(&mut pool, 4);
        let capacity = pool.capacity();

        pool.release(blocks[1]);
        let reused = pool.allocate().unwrap();

        assert_eq!(reused, blocks[1]);
        assert_eq!(pool.capacity(), capacity);

        for block in blocks {
            pool.release(block);
        }
    }

    #[test]
    fn exhausted_slab_becomes_available_after_release() {
        let mut pool = pool(nz!(2), 2.0);

        // First slab of 2 is exhausted, second slab of 4 has 3 free.
        let blocks = allocate_n(&mut pool, 3);
        assert_eq!(pool.pool_count(), 2);

        // Releasing into the exhausted first slab re-queues it.
        pool.release(blocks[0]);

        #[cfg(debug_assertions)]
        pool.integrity_check();

        // Drain all free capacity; no new slab may be needed.
        let more = allocate_n(&mut pool, 4);
        assert_eq!(pool.pool_count(), 2);
        assert!(more.contains(&blocks[0]));

        for block in blocks.into_iter().skip(1).chain(more) {
            pool.release(block);
        }

        assert!(pool.is_empty());
    }

    #[test]
    fn shrink_discards_only_unused_slabs() {
        let mut pool = pool(nz!(4), 2.0);

        // Slabs of 4 and 8.
        let blocks = allocate_n(&mut pool, 6);
        assert_eq!(pool.pool_count(), 2);

        // Release everything in the first slab, keep the two blocks of the second.
        let (first_slab, second_slab) = blocks.split_at(4);
        for &block in first_slab {
            pool.release(block);
        }

        assert_eq!(pool.shrink(), 1);
        assert_eq!(pool.pool_count(), 1);
        assert_eq!(pool.capacity(), 8);
        assert_eq!(pool.len(), 2);

        // The surviving slab still serves allocations and releases.
        let extra = pool.allocate().unwrap();
        pool.release(extra);

        for &block in second_slab {
            pool.release(block);
        }

        assert_eq!(pool.shrink(), 1);
        assert_eq!(pool.pool_count(), 0);
        assert_eq!(pool.capacity(), 0);
    }

    #[test]
    fn shrink_after_releasing_everything_strictly_decreases_pool_count() {
        let mut pool = pool(nz!(4), 2.0);

        let blocks = allocate_n(&mut pool, 30);
        let pools_before = pool.pool_count();
        assert!(pools_before > 1);

        for block in blocks {
            pool.release(block);
        }

        pool.shrink();
        assert!(pool.pool_count() < pools_before);
    }

    #[test]
    fn shrink_with_everything_allocated_is_noop() {
        let mut pool = pool(nz!(4), 2.0);

        let blocks = allocate_n(&mut pool, 12);

        assert_eq!(pool.shrink(), 0);
        assert_eq!(pool.pool_count(), 2);

        for block in blocks {
            pool.release(block);
        }
    }

    #[test]
    fn allocation_after_full_shrink_starts_over() {
        let mut pool = pool(nz!(4), 2.0);

        let blocks = allocate_n(&mut pool, 5);
        for block in blocks {
            pool.release(block);
        }
        pool.shrink();

        let block = pool.allocate().unwrap();
        assert_eq!(pool.capacity(), 4);

        pool.release(block);
    }

    #[test]
    #[should_panic]
    fn release_foreign_block_panics() {
        let mut pool = pool(nz!(4), 2.0);
        let block = pool.allocate().unwrap();

        let outsider = 0_u64;
        pool.release(NonNull::from(&outsider).cast());

        pool.release(block);
    }

    #[test]
    #[should_panic]
    fn release_into_empty_pool_panics() {
        let mut pool = pool(nz!(4), 2.0);

        let outsider = 0_u64;
        pool.release(NonNull::from(&outsider).cast());
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic]
    fn double_release_is_detected() {
        let mut pool = pool(nz!(4), 2.0);

        let blocks = allocate_n(&mut pool, 2);
        pool.release(blocks[0]);
        pool.release(blocks[0]);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn growth_failure_is_reported_and_leaves_pool_unchanged() {
        let huge = Layout::from_size_align(1 << 44, 8).unwrap();

        let mut pool = GrowablePool::builder()
            .block_layout(huge)
            .initial_blocks(NonZero::new(MAX_BLOCKS_PER_POOL).unwrap())
            .build();

        let result = pool.allocate();

        assert!(matches!(result, Err(Error::OutOfMemory { .. })));
        assert_eq!(pool.pool_count(), 0);
        assert_eq!(pool.capacity(), 0);
        assert!(pool.is_empty());
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn slab_larger_than_address_space_is_reported_as_out_of_memory() {
        let huge = Layout::from_size_align(1 << 61, 8).unwrap();

        let mut pool = GrowablePool::builder()
            .block_layout(huge)
            .initial_blocks(nz!(4))
            .build();

        let result = pool.allocate();

        assert!(matches!(result, Err(Error::OutOfMemory { .. })));
        assert_eq!(pool.pool_count(), 0);
        assert!(pool.is_empty());
    }

    #[test]
    #[should_panic]
    fn drop_with_outstanding_blocks_under_strict_policy_panics() {
        let mut pool = GrowablePool::builder()
            .block_layout_of::<u64>()
            .drop_policy(DropPolicy::MustNotDropContents)
            .build();

        _ = pool.allocate().unwrap();
    }
}
