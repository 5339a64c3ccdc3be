use std::alloc::Layout;
use std::cell::Cell;
use std::marker::PhantomData;
use std::num::NonZero;

use new_zealand::nz;

use crate::{DropPolicy, GrowablePool};

/// The number of blocks in the first slab of a [`GrowablePool`] unless configured otherwise.
pub const DEFAULT_INITIAL_BLOCKS: NonZero<usize> = nz!(128);

/// The factor by which a [`GrowablePool`] scales its reserved block count when it needs a new
/// slab, unless configured otherwise.
pub const DEFAULT_GROWTH_FACTOR: f32 = 2.0;

/// Builder for creating an instance of [`GrowablePool`].
///
/// The block layout is mandatory, whereas other settings are optional.
///
/// # Examples
///
/// ```
/// use std::alloc::Layout;
///
/// use block_pool::{DropPolicy, GrowablePool};
/// use new_zealand::nz;
///
/// let pool = GrowablePool::builder()
///     .block_layout(Layout::from_size_align(40, 8).unwrap())
///     .initial_blocks(nz!(64))
///     .growth_factor(1.5)
///     .drop_policy(DropPolicy::MustNotDropContents)
///     .build();
///
/// assert_eq!(pool.initial_blocks().get(), 64);
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) but not thread-safe ([`Sync`]).
#[derive(Debug)]
#[must_use]
pub struct GrowablePoolBuilder {
    block_layout: Option<Layout>,
    initial_blocks: NonZero<usize>,
    growth_factor: f32,
    drop_policy: DropPolicy,

    // Prevents Sync while allowing Send - builders are thread-mobile but not thread-safe
    _not_sync: PhantomData<Cell<()>>,
}

impl GrowablePoolBuilder {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            block_layout: None,
            initial_blocks: DEFAULT_INITIAL_BLOCKS,
            growth_factor: DEFAULT_GROWTH_FACTOR,
            drop_policy: DropPolicy::default(),
            _not_sync: PhantomData,
        }
    }

    /// Sets the memory layout that every block of the pool must be able to hold.
    ///
    /// # Panics
    ///
    /// Panics if the layout is zero-sized.
    #[inline]
    pub fn block_layout(mut self, layout: Layout) -> Self {
        assert!(layout.size() > 0, "GrowablePool must have non-zero block size");
        self.block_layout = Some(layout);
        self
    }

    /// Sets the block layout to that of `T`.
    ///
    /// # Panics
    ///
    /// Panics if `T` is zero-sized.
    #[inline]
    pub fn block_layout_of<T>(self) -> Self {
        self.block_layout(Layout::new::<T>())
    }

    /// Sets the number of blocks of the first slab, which is also the minimum number of blocks
    /// of every later slab.
    ///
    /// # Panics
    ///
    /// Panics if the count exceeds [`MAX_BLOCKS_PER_POOL`](crate::MAX_BLOCKS_PER_POOL).
    #[inline]
    pub fn initial_blocks(mut self, initial_blocks: NonZero<usize>) -> Self {
        assert!(
            initial_blocks.get() <= crate::MAX_BLOCKS_PER_POOL,
            "initial block count {initial_blocks} exceeds the per-slab limit of {}",
            crate::MAX_BLOCKS_PER_POOL
        );
        self.initial_blocks = initial_blocks;
        self
    }

    /// Sets the factor by which the total reserved block count is scaled to size a new slab.
    ///
    /// # Panics
    ///
    /// Panics if the factor is not a finite number greater than 1.0.
    #[inline]
    pub fn growth_factor(mut self, growth_factor: f32) -> Self {
        assert!(
            growth_factor.is_finite() && growth_factor > 1.0,
            "growth factor must be a finite number greater than 1.0, got {growth_factor}"
        );
        self.growth_factor = growth_factor;
        self
    }

    /// Sets the [drop policy][DropPolicy] for the pool. This governs what happens if the pool
    /// is dropped while blocks are still allocated.
    #[inline]
    pub fn drop_policy(mut self, policy: DropPolicy) -> Self {
        self.drop_policy = policy;
        self
    }

    /// Builds the pool with the specified configuration. No memory is reserved until the
    /// first allocation.
    ///
    /// # Panics
    ///
    /// Panics if no block layout has been set.
    #[must_use]
    #[inline]
    pub fn build(self) -> GrowablePool {
        let block_layout = self.block_layout.expect(
            "block layout must be set using .block_layout() or .block_layout_of::<T>() before calling .build()",
        );

        GrowablePool::new_inner(
            block_layout,
            self.initial_blocks,
            self.growth_factor,
            self.drop_policy,
        )
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(GrowablePoolBuilder: Send, std::fmt::Debug);
    assert_not_impl_any!(GrowablePoolBuilder: Sync);

    #[test]
    fn defaults_are_applied() {
        let pool = GrowablePoolBuilder::new().block_layout_of::<u32>().build();

        assert_eq!(pool.block_layout(), Layout::new::<u32>());
        assert_eq!(pool.initial_blocks(), DEFAULT_INITIAL_BLOCKS);
        assert!((pool.growth_factor() - DEFAULT_GROWTH_FACTOR).abs() < f32::EPSILON);
    }

    #[test]
    fn settings_are_applied() {
        let pool = GrowablePoolBuilder::new()
            .block_layout_of::<u64>()
            .initial_blocks(nz!(7))
            .growth_factor(3.5)
            .build();

        assert_eq!(pool.initial_blocks().get(), 7);
        assert!((pool.growth_factor() - 3.5).abs() < f32::EPSILON);
    }

    #[test]
    fn layout_can_be_overridden() {
        let pool = GrowablePoolBuilder::new()
            .block_layout_of::<u8>()
            .block_layout_of::<[u64; 4]>()
            .build();

        assert_eq!(pool.block_layout(), Layout::new::<[u64; 4]>());
    }

    #[test]
    #[should_panic]
    fn build_without_layout_panics() {
        let _pool = GrowablePoolBuilder::new().build();
    }

    #[test]
    #[should_panic]
    fn zero_sized_layout_panics() {
        let _builder = GrowablePoolBuilder::new().block_layout_of::<()>();
    }

    #[test]
    #[should_panic]
    fn growth_factor_of_one_panics() {
        let _builder = GrowablePoolBuilder::new().growth_factor(1.0);
    }

    #[test]
    #[should_panic]
    fn nan_growth_factor_panics() {
        let _builder = GrowablePoolBuilder::new().growth_factor(f32::NAN);
    }

    #[test]
    #[should_panic]
    fn initial_blocks_above_ceiling_panics() {
        let _builder = GrowablePoolBuilder::new()
            .initial_blocks(NonZero::new(crate::MAX_BLOCKS_PER_POOL + 1).unwrap());
    }

    #[test]
    fn builder_can_move_between_threads() {
        let builder = GrowablePoolBuilder::new().block_layout_of::<u64>();
        let handle = std::thread::spawn(move || builder.build());
        let _pool = handle.join().expect("thread completed successfully");
    }
}
