use std::cell::Cell;
use std::marker::PhantomData;
use std::num::NonZero;
use std::ptr::NonNull;

use block_pool::{DEFAULT_GROWTH_FACTOR, DEFAULT_INITIAL_BLOCKS, DropPolicy, GrowablePool};

use crate::{Vertex, VertexStore};

/// Builder for creating an instance of [`VertexStore`].
///
/// All settings are optional and concern the internal pool that holds the vertices.
///
/// # Examples
///
/// ```
/// use block_pool::DropPolicy;
/// use new_zealand::nz;
/// use vertex_store::VertexStore;
///
/// let store: VertexStore = VertexStore::builder()
///     .initial_capacity(nz!(1024))
///     .growth_factor(1.5)
///     .drop_policy(DropPolicy::MustNotDropContents)
///     .build();
///
/// assert!(store.is_empty());
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) but not thread-safe ([`Sync`]).
#[derive(Debug)]
#[must_use]
pub struct VertexStoreBuilder {
    initial_capacity: NonZero<usize>,
    growth_factor: f32,
    drop_policy: DropPolicy,

    // Prevents Sync while allowing Send - builders are thread-mobile but not thread-safe
    _not_sync: PhantomData<Cell<()>>,
}

impl VertexStoreBuilder {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            initial_capacity: DEFAULT_INITIAL_BLOCKS,
            growth_factor: DEFAULT_GROWTH_FACTOR,
            drop_policy: DropPolicy::default(),
            _not_sync: PhantomData,
        }
    }

    /// Sets the number of vertex slots reserved when the first vertex is added.
    ///
    /// # Panics
    ///
    /// Panics if the count exceeds
    /// [`MAX_BLOCKS_PER_POOL`](block_pool::MAX_BLOCKS_PER_POOL).
    #[inline]
    pub fn initial_capacity(mut self, initial_capacity: NonZero<usize>) -> Self {
        assert!(
            initial_capacity.get() <= block_pool::MAX_BLOCKS_PER_POOL,
            "initial capacity {initial_capacity} exceeds the per-slab limit of {}",
            block_pool::MAX_BLOCKS_PER_POOL
        );
        self.initial_capacity = initial_capacity;
        self
    }

    /// Sets the factor by which the reserved slot count is scaled whenever the store runs out
    /// of free vertex slots.
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

    /// Sets the [drop policy][DropPolicy] for the store. This governs what happens if the store
    /// is dropped while it still tracks vertices.
    #[inline]
    pub fn drop_policy(mut self, policy: DropPolicy) -> Self {
        self.drop_policy = policy;
        self
    }

    /// Builds the store with the specified configuration. No memory is reserved until the
    /// first vertex is added.
    #[must_use]
    pub fn build<R>(self) -> VertexStore<R>
    where
        R: FnOnce(NonNull<u8>),
    {
        // The slot pool keeps the default MayDropContents policy because the store releases
        // every slot in its own Drop before the pool is dropped.
        let slots = GrowablePool::builder()
            .block_layout_of::<Vertex<R>>()
            .initial_blocks(self.initial_capacity)
            .growth_factor(self.growth_factor)
            .build();

        VertexStore::new_inner(slots, self.drop_policy)
    }
}

#[cfg(test)]
mod tests {
    use new_zealand::nz;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(VertexStoreBuilder: Send, std::fmt::Debug);
    assert_not_impl_any!(VertexStoreBuilder: Sync);

    fn ignore(_: NonNull<u8>) {}

    #[test]
    fn default_store_reserves_default_capacity_on_first_vertex() {
        let mut store: VertexStore = VertexStoreBuilder::new().build();
        assert_eq!(store.pool_capacity(), 0);

        let key = store.add_vertex(NonNull::dangling(), 1, ignore).unwrap();
        assert_eq!(store.pool_capacity(), DEFAULT_INITIAL_BLOCKS.get());

        store.remove_vertex(key);
    }

    #[test]
    fn initial_capacity_is_applied() {
        let mut store: VertexStore = VertexStoreBuilder::new().initial_capacity(nz!(3)).build();

        let key = store.add_vertex(NonNull::dangling(), 1, ignore).unwrap();
        assert_eq!(store.pool_capacity(), 3);

        store.remove_vertex(key);
    }

    #[test]
    #[should_panic]
    fn growth_factor_below_one_panics() {
        let _builder = VertexStoreBuilder::new().growth_factor(0.5);
    }

    #[test]
    #[should_panic]
    fn infinite_growth_factor_panics() {
        let _builder = VertexStoreBuilder::new().growth_factor(f32::INFINITY);
    }

    #[test]
    #[should_panic]
    fn initial_capacity_above_ceiling_panics() {
        let _builder = VertexStoreBuilder::new()
            .initial_capacity(NonZero::new(block_pool::MAX_BLOCKS_PER_POOL + 1).unwrap());
    }

    #[test]
    fn builder_can_move_between_threads() {
        let builder = VertexStoreBuilder::new().initial_capacity(nz!(8));
        let handle = std::thread::spawn(move || builder.build::<fn(NonNull<u8>)>());
        let store = handle.join().expect("thread completed successfully");
        assert!(store.is_empty());
    }
}
