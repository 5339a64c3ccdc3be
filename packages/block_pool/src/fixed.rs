use std::alloc::{Layout, alloc, dealloc};
use std::num::NonZero;
use std::ptr::NonNull;
use std::thread;

use crate::{DropPolicy, Error, Result};

/// Index of a block within a [`FixedBlockPool`].
///
/// The width of this type is what limits the number of blocks in one pool.
pub type BlockIndex = u16;

/// The maximum number of blocks a single [`FixedBlockPool`] can hold.
///
/// This is a hard ceiling derived from the width of [`BlockIndex`]. Requesting a larger pool
/// is a contract violation and panics.
pub const MAX_BLOCKS_PER_POOL: usize = 1 << BlockIndex::BITS;

/// A single contiguous slab of memory divided into blocks of equal size.
///
/// Allocation and release are both O(1): the pool keeps a stack of free block indexes and
/// pops/pushes it. The pool never reads or writes the memory of the blocks it hands out - the
/// caller is responsible for initializing and destroying whatever it stores there.
///
/// Every address returned by [`allocate()`](Self::allocate) lies within
/// `[base_address, base_address + num_blocks * block_size)` and is a whole number of blocks
/// away from the base address.
///
/// # Examples
///
/// ```
/// use std::alloc::Layout;
///
/// use block_pool::FixedBlockPool;
/// use new_zealand::nz;
///
/// let mut pool = FixedBlockPool::new(nz!(4), Layout::new::<u64>())?;
///
/// let block = pool.allocate().expect("fresh pool has free blocks");
/// assert!(pool.contains(block));
/// assert_eq!(pool.len(), 1);
///
/// pool.release(block);
/// assert!(pool.is_unused());
/// # Ok::<(), block_pool::Error>(())
/// ```
///
/// # Thread safety
///
/// The pool is thread-mobile ([`Send`]) but not thread-safe ([`Sync`]). All mutation requires
/// an exclusive reference, so callers that share a pool must serialize access externally.
#[derive(Debug)]
pub struct FixedBlockPool {
    /// Start of the slab. Block `i` starts at `base_ptr + i * block_size`.
    base_ptr: NonNull<u8>,

    /// Layout of the entire slab, required again when returning it to the process.
    slab_layout: Layout,

    /// Distance between the starts of two neighboring blocks. This is the requested block
    /// layout padded to its alignment.
    block_size: NonZero<usize>,

    num_blocks: NonZero<usize>,

    /// Stack of block indexes that are free to hand out. The top of the stack is the block
    /// handed out by the next allocation.
    free_indexes: Vec<BlockIndex>,

    /// Shadow of `free_indexes` that lets debug builds detect a block being released twice.
    #[cfg(debug_assertions)]
    is_free: Vec<bool>,

    drop_policy: DropPolicy,
}

#[allow(
    clippy::len_without_is_empty,
    reason = "is_unused() covers it; is_empty() would read as the opposite of is_exhausted()"
)]
impl FixedBlockPool {
    /// Reserves a slab of `num_blocks` blocks, each able to hold a value of `block_layout`.
    ///
    /// The memory is not initialized. All blocks start out free.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the process allocator cannot supply the slab, including
    /// when the slab is too large for the address space.
    ///
    /// # Panics
    ///
    /// Panics if `num_blocks` exceeds [`MAX_BLOCKS_PER_POOL`] or if the block layout is
    /// zero-sized.
    pub fn new(num_blocks: NonZero<usize>, block_layout: Layout) -> Result<Self> {
        Self::with_drop_policy(num_blocks, block_layout, DropPolicy::default())
    }

    /// Reserves a slab like [`new()`](Self::new) but with a custom [drop policy][DropPolicy].
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the process allocator cannot supply the slab, including
    /// when the slab is too large for the address space.
    ///
    /// # Panics
    ///
    /// Panics if `num_blocks` exceeds [`MAX_BLOCKS_PER_POOL`] or if the block layout is
    /// zero-sized.
    pub fn with_drop_policy(
        num_blocks: NonZero<usize>,
        block_layout: Layout,
        drop_policy: DropPolicy,
    ) -> Result<Self> {
        assert!(
            num_blocks.get() <= MAX_BLOCKS_PER_POOL,
            "FixedBlockPool cannot hold {num_blocks} blocks, the limit is {MAX_BLOCKS_PER_POOL}"
        );

        let block_layout = block_layout.pad_to_align();

        let block_size = NonZero::new(block_layout.size())
            .expect("FixedBlockPool must have non-zero block size");

        // A slab that does not fit in the address space can never be supplied by the allocator.
        let slab_layout = block_size
            .get()
            .checked_mul(num_blocks.get())
            .and_then(|slab_size| Layout::from_size_align(slab_size, block_layout.align()).ok())
            .ok_or(Error::OutOfMemory {
                bytes: block_size.get().saturating_mul(num_blocks.get()),
                align: block_layout.align(),
            })?;

        // SAFETY: The layout has non-zero size because both factors of its size are non-zero.
        let base_ptr = NonNull::new(unsafe { alloc(slab_layout) }).ok_or(Error::OutOfMemory {
            bytes: slab_layout.size(),
            align: slab_layout.align(),
        })?;

        // Reversed, so the lowest index sits on top of the stack and gets handed out first.
        let free_indexes = (0..num_blocks.get())
            .rev()
            .map(|index| {
                BlockIndex::try_from(index).expect("guarded by the block count assertion above")
            })
            .collect();

        Ok(Self {
            base_ptr,
            slab_layout,
            block_size,
            num_blocks,
            free_indexes,
            #[cfg(debug_assertions)]
            is_free: vec![true; num_blocks.get()],
            drop_policy,
        })
    }

    /// The number of blocks in the pool, free or not.
    #[must_use]
    pub fn num_blocks(&self) -> NonZero<usize> {
        self.num_blocks
    }

    /// The distance in bytes between the starts of two neighboring blocks.
    #[must_use]
    pub fn block_size(&self) -> NonZero<usize> {
        self.block_size
    }

    /// The address of the first block of the slab.
    #[must_use]
    pub fn base_address(&self) -> NonNull<u8> {
        self.base_ptr
    }

    /// The number of blocks currently handed out to callers.
    #[must_use]
    pub fn len(&self) -> usize {
        // Cannot wrap because the free stack never holds more indexes than there are blocks.
        self.num_blocks.get().wrapping_sub(self.free_indexes.len())
    }

    /// The number of blocks that can be allocated before the pool is exhausted.
    #[must_use]
    pub fn available(&self) -> usize {
        self.free_indexes.len()
    }

    /// Whether every block of the pool is free, meaning the pool is not in use and its
    /// slab could be returned to the process without affecting any caller.
    #[must_use]
    pub fn is_unused(&self) -> bool {
        self.free_indexes.len() == self.num_blocks.get()
    }

    /// Whether no block of the pool is free, meaning [`allocate()`](Self::allocate) would
    /// return `None` until a block is released.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.free_indexes.is_empty()
    }

    /// Whether `address` lies within the slab of this pool.
    ///
    /// This does not say whether the address is the start of a block or whether that block
    /// is currently allocated.
    #[must_use]
    pub fn contains(&self, address: NonNull<u8>) -> bool {
        let base = self.base_ptr.addr().get();
        let address = address.addr().get();

        // Cannot wrap because the slab exists in the address space.
        address >= base && address < base.wrapping_add(self.slab_layout.size())
    }

    /// Takes a free block out of the pool and returns its address.
    ///
    /// Returns `None` if the pool is exhausted.
    #[must_use]
    pub fn allocate(&mut self) -> Option<NonNull<u8>> {
        let index = self.free_indexes.pop()?;

        #[cfg(debug_assertions)]
        {
            let is_free = self
                .is_free
                .get_mut(usize::from(index))
                .expect("free indexes are always within the pool");
            assert!(*is_free, "free stack of FixedBlockPool handed out block {index} twice");
            *is_free = false;
        }

        Some(self.block_ptr(index))
    }

    /// Returns a block previously handed out by [`allocate()`](Self::allocate) to the pool.
    ///
    /// Releasing the same block twice without allocating it again in between is a contract
    /// violation. Debug builds detect it and panic. Release builds silently corrupt the free
    /// stack, after which two allocations may return the same address.
    ///
    /// # Panics
    ///
    /// Panics if `block` does not lie within this pool. In debug builds, also panics if
    /// `block` is not the start of a block or if the block is already free.
    pub fn release(&mut self, block: NonNull<u8>) {
        assert!(
            self.contains(block),
            "released block {block:?} does not belong to FixedBlockPool at {:?}",
            self.base_ptr
        );

        // Cannot wrap because we just checked that the block lies after the base address.
        let offset = block.addr().get().wrapping_sub(self.base_ptr.addr().get());

        debug_assert!(
            offset % self.block_size == 0,
            "released address {block:?} is not the start of a block in FixedBlockPool at {:?}",
            self.base_ptr
        );

        let index = BlockIndex::try_from(offset / self.block_size)
            .expect("containment check keeps the index within the block count ceiling");

        #[cfg(debug_assertions)]
        {
            let is_free = self
                .is_free
                .get_mut(usize::from(index))
                .expect("containment check keeps the index within the pool");
            assert!(
                !*is_free,
                "block {index} of FixedBlockPool at {:?} was released twice",
                self.base_ptr
            );
            *is_free = true;
        }

        self.free_indexes.push(index);
    }

    fn block_ptr(&self, index: BlockIndex) -> NonNull<u8> {
        // Cannot wrap because the block lies within the slab, which exists in the address space.
        let offset = usize::from(index).wrapping_mul(self.block_size.get());

        // SAFETY: Every index on the free stack is below num_blocks, so the offset stays
        // within the slab we allocated in the constructor.
        unsafe { self.base_ptr.add(offset) }
    }

    /// Verifies that the free stack is consistent with the block count.
    ///
    /// Panics if any free index is out of range or appears more than once.
    #[cfg_attr(test, mutants::skip)] // This is essentially test logic, mutation is meaningless.
    #[cfg(debug_assertions)]
    pub(crate) fn integrity_check(&self) {
        let mut seen = vec![false; self.num_blocks.get()];

        for &index in &self.free_indexes {
            let seen_before = seen.get_mut(usize::from(index)).unwrap_or_else(|| {
                panic!(
                    "free index {index} is out of bounds in FixedBlockPool of {} blocks",
                    self.num_blocks
                )
            });

            assert!(
                !*seen_before,
                "free index {index} appears twice in FixedBlockPool of {} blocks",
                self.num_blocks
            );
            *seen_before = true;
        }

        assert_eq!(
            seen, self.is_free,
            "free stack and occupancy shadow disagree in FixedBlockPool of {} blocks",
            self.num_blocks
        );
    }
}

impl Drop for FixedBlockPool {
    fn drop(&mut self) {
        let outstanding = self.len();

        // SAFETY: The layout matches the one the slab was allocated with in the constructor.
        unsafe {
            dealloc(self.base_ptr.as_ptr(), self.slab_layout);
        }

        if outstanding == 0 {
            return;
        }

        // We do this check at the end so we clean up the memory first. If we are already
        // panicking, we do not want to panic again because that would obscure the original panic.
        match self.drop_policy {
            DropPolicy::MustNotDropContents if !thread::panicking() => panic!(
                "dropped FixedBlockPool with {outstanding} allocated blocks - this is forbidden by DropPolicy::MustNotDropContents"
            ),
            _ => tracing::warn!(
                outstanding,
                block_size = self.block_size.get(),
                "dropped FixedBlockPool with allocated blocks"
            ),
        }
    }
}

// SAFETY: The pool only holds a pointer to a slab it exclusively owns and never touches the
// contents of the blocks, so nothing ties it to the thread that created it.
unsafe impl Send for FixedBlockPool {}

#[cfg(test)]
#[allow(
    clippy::indexing_slicing,
    clippy::undocumented_unsafe_blocks,
    reason = "test code doesn't need the same rigor as production code"
)]
mod tests {
    use std::collections::HashSet;

    use new_zealand::nz;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(FixedBlockPool: Send, std::fmt::Debug);
    assert_not_impl_any!(FixedBlockPool: Sync, Clone);

    fn pool_of_u64(num_blocks: NonZero<usize>) -> FixedBlockPool {
        FixedBlockPool::new(num_blocks, Layout::new::<u64>()).unwrap()
    }

    #[test]
    fn smoke_test() {
        let mut pool = pool_of_u64(nz!(3));

        assert!(pool.is_unused());
        assert!(!pool.is_exhausted());

        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        let c = pool.allocate().unwrap();

        assert_eq!(pool.len(), 3);
        assert!(pool.is_exhausted());
        assert!(pool.allocate().is_none());

        pool.release(b);
        assert_eq!(pool.len(), 2);
        assert!(!pool.is_exhausted());

        // The most recently released block is handed out first.
        let d = pool.allocate().unwrap();
        assert_eq!(d, b);

        pool.release(a);
        pool.release(c);
        pool.release(d);

        assert!(pool.is_unused());
    }

    #[test]
    fn allocating_everything_yields_distinct_contained_addresses() {
        let mut pool = pool_of_u64(nz!(100));

        let blocks: Vec<_> = iter_allocate(&mut pool).collect();
        assert_eq!(blocks.len(), 100);

        let distinct: HashSet<_> = blocks.iter().copied().collect();
        assert_eq!(distinct.len(), 100);

        for &block in &blocks {
            assert!(pool.contains(block));
        }

        assert!(pool.is_exhausted());

        for block in blocks {
            pool.release(block);
        }

        assert!(pool.is_unused());

        #[cfg(debug_assertions)]
        pool.integrity_check();
    }

    fn iter_allocate(pool: &mut FixedBlockPool) -> impl Iterator<Item = NonNull<u8>> + '_ {
        std::iter::from_fn(|| pool.allocate())
    }

    #[test]
    fn addresses_are_block_aligned_offsets_from_base() {
        let layout = Layout::from_size_align(24, 8).unwrap();
        let mut pool = FixedBlockPool::new(nz!(16), layout).unwrap();

        let base = pool.base_address().addr().get();
        let blocks: Vec<_> = iter_allocate(&mut pool).collect();

        for &block in &blocks {
            let offset = block.addr().get() - base;
            assert_eq!(offset % 24, 0);
            assert!(offset < 24 * 16);
            assert_eq!(block.addr().get() % 8, 0);
        }

        for block in blocks {
            pool.release(block);
        }
    }

    #[test]
    fn block_size_is_padded_to_alignment() {
        let layout = Layout::from_size_align(5, 4).unwrap();
        let pool = FixedBlockPool::new(nz!(2), layout).unwrap();

        assert_eq!(pool.block_size().get(), 8);
    }

    #[test]
    fn blocks_are_writable() {
        let mut pool = pool_of_u64(nz!(2));

        let a = pool.allocate().unwrap().cast::<u64>();
        let b = pool.allocate().unwrap().cast::<u64>();

        unsafe {
            a.write(0xdead_beef);
            b.write(0xcafe_babe);

            assert_eq!(a.read(), 0xdead_beef);
            assert_eq!(b.read(), 0xcafe_babe);
        }

        pool.release(a.cast());
        pool.release(b.cast());
    }

    #[test]
    fn contains_rejects_addresses_outside_slab() {
        let pool = pool_of_u64(nz!(4));
        let base = pool.base_address();

        let one_past_end = unsafe { base.add(4 * 8) };
        assert!(!pool.contains(one_past_end));

        let last_byte = unsafe { base.add(4 * 8 - 1) };
        assert!(pool.contains(last_byte));

        let outsider = 0_u64;
        assert!(!pool.contains(NonNull::from(&outsider).cast()));
    }

    #[test]
    fn max_blocks_per_pool_is_accepted() {
        let mut pool = FixedBlockPool::new(
            NonZero::new(MAX_BLOCKS_PER_POOL).unwrap(),
            Layout::new::<u8>(),
        )
        .unwrap();

        let blocks: Vec<_> = iter_allocate(&mut pool).collect();
        assert_eq!(blocks.len(), MAX_BLOCKS_PER_POOL);

        for block in blocks {
            pool.release(block);
        }

        assert!(pool.is_unused());
    }

    #[test]
    #[should_panic]
    fn more_than_max_blocks_panics() {
        drop(FixedBlockPool::new(
            NonZero::new(MAX_BLOCKS_PER_POOL + 1).unwrap(),
            Layout::new::<u8>(),
        ));
    }

    #[test]
    #[should_panic]
    fn zero_sized_block_panics() {
        drop(FixedBlockPool::new(nz!(4), Layout::new::<()>()));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn unsatisfiable_slab_is_out_of_memory() {
        // 2^16 blocks of 2^44 bytes is 2^60 bytes, far beyond any real address space.
        let layout = Layout::from_size_align(1 << 44, 8).unwrap();

        let result = FixedBlockPool::new(NonZero::new(MAX_BLOCKS_PER_POOL).unwrap(), layout);

        assert!(matches!(
            result,
            Err(Error::OutOfMemory { bytes, align: 8 }) if bytes == 1 << 60
        ));
    }

    #[test]
    fn slab_size_overflowing_address_space_is_out_of_memory() {
        // Four blocks of just over a quarter of the address space overflow usize.
        let layout = Layout::from_size_align(usize::MAX / 4 + 1, 8).unwrap();

        let result = FixedBlockPool::new(nz!(4), layout);

        assert!(matches!(
            result,
            Err(Error::OutOfMemory {
                bytes: usize::MAX,
                align: 8
            })
        ));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn slab_size_beyond_layout_limit_is_out_of_memory() {
        // 4 * 2^61 = 2^63 fits in usize but exceeds the isize::MAX limit of Layout.
        let layout = Layout::from_size_align(1 << 61, 8).unwrap();

        let result = FixedBlockPool::new(nz!(4), layout);

        assert!(matches!(
            result,
            Err(Error::OutOfMemory { bytes, align: 8 }) if bytes == 1 << 63
        ));
    }

    #[test]
    #[should_panic]
    fn release_foreign_address_panics() {
        let mut pool = pool_of_u64(nz!(4));
        let outsider = 0_u64;

        pool.release(NonNull::from(&outsider).cast());
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic]
    fn double_release_is_detected() {
        let mut pool = pool_of_u64(nz!(4));

        let block = pool.allocate().unwrap();
        pool.release(block);
        pool.release(block);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic]
    fn release_of_never_allocated_block_is_detected() {
        let mut pool = pool_of_u64(nz!(4));

        let base = pool.base_address();
        pool.release(base);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic]
    fn misaligned_release_is_detected() {
        let mut pool = pool_of_u64(nz!(4));

        let block = pool.allocate().unwrap();
        pool.release(unsafe { block.add(1) });
    }

    #[test]
    fn moved_pool_keeps_its_blocks() {
        let mut pool = pool_of_u64(nz!(4));
        let block = pool.allocate().unwrap();

        let mut moved = pool;
        assert!(moved.contains(block));
        assert_eq!(moved.len(), 1);

        moved.release(block);
        assert!(moved.is_unused());
    }

    #[test]
    fn drop_with_outstanding_blocks_is_allowed_by_default() {
        let mut pool = pool_of_u64(nz!(4));
        _ = pool.allocate().unwrap();

        drop(pool);
    }

    #[test]
    #[should_panic]
    fn drop_with_outstanding_blocks_under_strict_policy_panics() {
        let mut pool = FixedBlockPool::with_drop_policy(
            nz!(4),
            Layout::new::<u64>(),
            DropPolicy::MustNotDropContents,
        )
        .unwrap();
        _ = pool.allocate().unwrap();

        drop(pool);
    }

    #[test]
    fn drop_unused_under_strict_policy_is_fine() {
        let mut pool = FixedBlockPool::with_drop_policy(
            nz!(4),
            Layout::new::<u64>(),
            DropPolicy::MustNotDropContents,
        )
        .unwrap();

        let block = pool.allocate().unwrap();
        pool.release(block);

        drop(pool);
    }
}
