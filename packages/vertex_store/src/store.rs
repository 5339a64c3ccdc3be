use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use block_pool::{DropPolicy, GrowablePool};
use nm::Event;

use crate::{Result, Vertex, VertexKey, VertexStoreBuilder};

/// Global counter for generating unique store IDs.
static STORE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn generate_store_id() -> u64 {
    STORE_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

thread_local! {
    static VERTICES_ADDED: Event = Event::builder()
        .name("vertex_store_vertices_added")
        .build();

    static VERTICES_REMOVED: Event = Event::builder()
        .name("vertex_store_vertices_removed")
        .build();
}

/// An address-ordered index of the memory blocks tracked by a garbage collector.
///
/// Each tracked block is represented by a [`Vertex`] that records the block's base address, its
/// size and a callback that releases the block. The store keeps the vertices ordered by address,
/// which makes both exact lookups ([`get_vertex()`](Self::get_vertex)) and lookups of interior
/// addresses ([`get_container_vertex()`](Self::get_container_vertex)) O(log V) for V tracked
/// vertices.
///
/// The vertices themselves live in slots taken from an internal [`GrowablePool`], so tracking a
/// vertex costs amortized O(1) in bookkeeping memory. Slots freed by removed vertices are kept
/// for reuse until [`shrink_pool()`](Self::shrink_pool) is called.
///
/// The release callback of a vertex is invoked exactly once, by
/// [`remove_vertex()`](Self::remove_vertex). A store dropped while it still tracks vertices
/// drops their callbacks without invoking them.
///
/// # Examples
///
/// ```
/// use std::ptr::NonNull;
///
/// use vertex_store::VertexStore;
///
/// let mut store = VertexStore::builder().build();
///
/// let block = Box::into_raw(Box::new([0_u8; 64]));
/// let address = NonNull::new(block).unwrap().cast::<u8>();
///
/// let key = store.add_vertex(address, 64, |address: NonNull<u8>| {
///     // SAFETY: The address came from Box::into_raw() on a [u8; 64] and is released only once.
///     drop(unsafe { Box::from_raw(address.cast::<[u8; 64]>().as_ptr()) });
/// })?;
///
/// // An address in the middle of the block resolves to the vertex of the block.
/// // SAFETY: The offset is within the allocation.
/// let interior = unsafe { address.add(10) };
/// let vertex = store.get_container_vertex(interior.as_ptr()).unwrap();
/// assert_eq!(vertex.key(), key);
///
/// store.remove_vertex(key);
/// assert!(store.is_empty());
/// # Ok::<(), vertex_store::Error>(())
/// ```
///
/// # Thread safety
///
/// The store is thread-mobile ([`Send`]) if its callbacks are, but it is never thread-safe
/// ([`Sync`]). The owning collector must serialize all access to it.
pub struct VertexStore<R = fn(NonNull<u8>)> {
    /// Distinguishes keys of this store from keys handed out by other stores.
    store_id: u64,

    /// Sequence number of the next vertex to be added. Keeps keys of removed vertices from
    /// matching a vertex tracked later at the same address.
    next_sequence: u64,

    /// Every tracked vertex, keyed by the base address of its block. Each value points to an
    /// initialized vertex in a slot of `slots`.
    index: BTreeMap<usize, NonNull<Vertex<R>>>,

    /// Slots for the vertices, each sized for one `Vertex<R>`.
    slots: GrowablePool,

    drop_policy: DropPolicy,

    _owns_vertices: PhantomData<Vertex<R>>,
}

impl VertexStore {
    /// Creates a builder for configuring and constructing a [`VertexStore`].
    ///
    /// The type of the release callback is inferred from how the store is used. It defaults to a
    /// plain function pointer.
    ///
    /// # Example
    ///
    /// ```
    /// use vertex_store::VertexStore;
    ///
    /// let store: VertexStore = VertexStore::builder().build();
    ///
    /// assert!(store.is_empty());
    /// ```
    #[inline]
    pub fn builder() -> VertexStoreBuilder {
        VertexStoreBuilder::new()
    }
}

impl<R> VertexStore<R>
where
    R: FnOnce(NonNull<u8>),
{
    #[must_use]
    pub(crate) fn new_inner(slots: GrowablePool, drop_policy: DropPolicy) -> Self {
        Self {
            store_id: generate_store_id(),
            next_sequence: 0,
            index: BTreeMap::new(),
            slots,
            drop_policy,
            _owns_vertices: PhantomData,
        }
    }

    /// The number of vertices currently tracked.
    #[must_use]
    #[inline]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether the store tracks no vertices.
    #[must_use]
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// The number of vertex slots reserved by the store, tracked or not.
    #[must_use]
    #[inline]
    pub fn pool_capacity(&self) -> usize {
        self.slots.capacity()
    }

    /// Starts tracking the block of `size` bytes at `address`.
    ///
    /// `release` is invoked with `address` when the vertex is removed via
    /// [`remove_vertex()`](Self::remove_vertex). The returned key identifies the vertex in later
    /// calls.
    ///
    /// Tracked blocks are expected not to overlap. Overlapping blocks make
    /// [`get_container_vertex()`](Self::get_container_vertex) ambiguous.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Pool`](crate::Error::Pool) if a new vertex slot was needed but could not
    /// be reserved. The store is left unchanged and `release` is dropped without being invoked.
    ///
    /// # Panics
    ///
    /// Panics if a vertex with the same base address is already tracked.
    pub fn add_vertex(
        &mut self,
        address: NonNull<u8>,
        size: usize,
        release: R,
    ) -> Result<VertexKey> {
        let Entry::Vacant(entry) = self.index.entry(address.addr().get()) else {
            panic!("block at {address:?} is already tracked by this VertexStore");
        };

        let slot = self.slots.allocate()?.cast::<Vertex<R>>();
        let key = VertexKey::new(self.store_id, self.next_sequence, address);

        // SAFETY: The slot is fresh from a pool whose block layout is that of Vertex<R>, so it
        // is valid for writes of one vertex.
        unsafe {
            slot.write(Vertex::new(key, size, release));
        }

        entry.insert(slot);

        // Cannot overflow because that would take centuries of adding vertices.
        self.next_sequence = self.next_sequence.wrapping_add(1);

        VERTICES_ADDED.with(Event::observe_once);
        tracing::trace!(?address, size, "added vertex");

        Ok(key)
    }

    /// Stops tracking a vertex and invokes its release callback.
    ///
    /// The vertex is taken out of the index, its slot is returned to the internal pool and the
    /// release callback is then invoked exactly once with the base address of the block.
    ///
    /// # Panics
    ///
    /// Panics if the key was issued by a different store or the vertex is no longer tracked,
    /// including when another vertex has since been added at the same address.
    pub fn remove_vertex(&mut self, key: VertexKey) {
        assert!(
            key.store_id() == self.store_id,
            "attempted to remove a vertex of a different store (key store ID: {}, current store ID: {})",
            key.store_id(),
            self.store_id
        );

        let address = key.address();

        let Entry::Occupied(entry) = self.index.entry(address.addr().get()) else {
            panic!("block at {address:?} is not tracked by this VertexStore");
        };

        // SAFETY: Every slot in the index holds an initialized vertex.
        let tracked_key = unsafe { entry.get().as_ref() }.key();

        assert!(
            tracked_key == key,
            "vertex key for block at {address:?} is stale, the vertex was removed and the block tracked again"
        );

        let slot = entry.remove();

        // SAFETY: Every slot in the index holds an initialized vertex. We just removed the only
        // reference to this one, so nothing else reads it again after we move it out.
        let vertex = unsafe { slot.read() };

        self.slots.release(slot.cast());

        VERTICES_REMOVED.with(Event::observe_once);
        tracing::trace!(?address, size = vertex.size(), "removed vertex");

        let release = vertex.into_release();
        release(address);
    }

    /// Returns the vertex whose block starts exactly at `address`, if one is tracked.
    #[must_use]
    pub fn get_vertex(&self, address: *const u8) -> Option<&Vertex<R>> {
        self.index
            .get(&address.addr())
            // SAFETY: Every slot in the index holds an initialized vertex that lives at least as
            // long as the shared borrow of the store.
            .map(|slot| unsafe { slot.as_ref() })
    }

    /// Returns the vertex whose block starts exactly at `address` for modification, if one is
    /// tracked.
    #[must_use]
    pub fn get_vertex_mut(&mut self, address: *const u8) -> Option<&mut Vertex<R>> {
        self.index
            .get_mut(&address.addr())
            // SAFETY: Every slot in the index holds an initialized vertex that lives at least as
            // long as the exclusive borrow of the store, which also rules out aliasing.
            .map(|slot| unsafe { slot.as_mut() })
    }

    /// Returns the vertex whose block contains `address`, if one is tracked.
    ///
    /// The address may point anywhere inside the block, not only to its start.
    #[must_use]
    pub fn get_container_vertex(&self, address: *const u8) -> Option<&Vertex<R>> {
        self.index
            .range(..=address.addr())
            .next_back()
            // SAFETY: Every slot in the index holds an initialized vertex that lives at least as
            // long as the shared borrow of the store.
            .map(|(_, slot)| unsafe { slot.as_ref() })
            .filter(|vertex| vertex.contains(address))
    }

    /// Returns the vertex whose block contains `address` for modification, if one is tracked.
    #[must_use]
    pub fn get_container_vertex_mut(&mut self, address: *const u8) -> Option<&mut Vertex<R>> {
        self.index
            .range_mut(..=address.addr())
            .next_back()
            // SAFETY: Every slot in the index holds an initialized vertex that lives at least as
            // long as the exclusive borrow of the store, which also rules out aliasing.
            .map(|(_, slot)| unsafe { slot.as_mut() })
            .filter(|vertex| vertex.contains(address))
    }

    /// Iterates over the tracked vertices in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = &Vertex<R>> {
        self.index
            .values()
            // SAFETY: Every slot in the index holds an initialized vertex that lives at least as
            // long as the shared borrow of the store.
            .map(|slot| unsafe { slot.as_ref() })
    }

    /// Returns vertex slots that hold no tracked vertex to the process.
    ///
    /// Returns the number of slabs of slots that were discarded. Tracked vertices are never
    /// affected.
    pub fn shrink_pool(&mut self) -> usize {
        self.slots.shrink()
    }
}

impl<R> Drop for VertexStore<R> {
    fn drop(&mut self) {
        let outstanding = self.index.len();

        for slot in mem::take(&mut self.index).into_values() {
            // SAFETY: Every slot in the index holds an initialized vertex and the index is gone,
            // so nothing refers to it anymore.
            unsafe {
                slot.drop_in_place();
            }

            self.slots.release(slot.cast());
        }

        if outstanding == 0 {
            return;
        }

        // The vertices are cleaned up first. If we are already panicking, we do not want to
        // panic again because that would obscure the original panic.
        match self.drop_policy {
            DropPolicy::MustNotDropContents if !thread::panicking() => panic!(
                "dropped VertexStore with {outstanding} tracked vertices - this is forbidden by DropPolicy::MustNotDropContents"
            ),
            _ => tracing::warn!(
                outstanding,
                "dropped VertexStore with tracked vertices, their release callbacks were not invoked"
            ),
        }
    }
}

impl<R> fmt::Debug for VertexStore<R> {
    #[cfg_attr(test, mutants::skip)] // Debug output has no contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VertexStore")
            .field("store_id", &self.store_id)
            .field("len", &self.index.len())
            .field("slots", &self.slots)
            .field("drop_policy", &self.drop_policy)
            .finish_non_exhaustive()
    }
}

// SAFETY: The store exclusively owns its vertices and their slots. The only thread-bound state
// a vertex can carry is its callback, which is required to be Send.
unsafe impl<R: Send> Send for VertexStore<R> {}

#[cfg(test)]
#[allow(
    clippy::indexing_slicing,
    clippy::undocumented_unsafe_blocks,
    reason = "test code doesn't need the same rigor as production code"
)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::ptr;
    use std::rc::Rc;

    use new_zealand::nz;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(VertexStore: Send, fmt::Debug);
    assert_impl_all!(VertexStore<Box<dyn FnOnce(NonNull<u8>) + Send>>: Send);
    assert_not_impl_any!(VertexStore: Sync, Clone);
    assert_not_impl_any!(VertexStore<Box<dyn FnOnce(NonNull<u8>)>>: Send);

    fn address(value: usize) -> NonNull<u8> {
        NonNull::new(ptr::without_provenance_mut(value)).unwrap()
    }

    fn at(value: usize) -> *const u8 {
        ptr::without_provenance(value)
    }

    fn ignore(_: NonNull<u8>) {}

    type BoxedRelease = Box<dyn FnOnce(NonNull<u8>)>;

    fn counter(calls: &Rc<Cell<usize>>) -> BoxedRelease {
        let calls = Rc::clone(calls);
        Box::new(move |_| calls.set(calls.get() + 1))
    }

    #[test]
    fn new_store_is_empty() {
        let store: VertexStore = VertexStore::builder().build();

        assert!(store.is_empty());
        assert_eq!(store.len(), 0);
        assert_eq!(store.pool_capacity(), 0);
        assert!(store.get_vertex(at(100)).is_none());
        assert!(store.get_container_vertex(at(100)).is_none());
    }

    #[test]
    fn exact_lookup_finds_only_base_address() {
        let mut store: VertexStore = VertexStore::builder().build();
        let key = store.add_vertex(address(100), 10, ignore).unwrap();

        let vertex = store.get_vertex(at(100)).unwrap();
        assert_eq!(vertex.key(), key);
        assert_eq!(vertex.size(), 10);

        assert!(store.get_vertex(at(105)).is_none());
        assert!(store.get_vertex(at(99)).is_none());

        store.remove_vertex(key);
    }

    #[test]
    fn container_lookup_scenario() {
        let mut store: VertexStore = VertexStore::builder().build();

        let key_100 = store.add_vertex(address(100), 10, ignore).unwrap();
        let key_200 = store.add_vertex(address(200), 10, ignore).unwrap();
        let key_300 = store.add_vertex(address(300), 10, ignore).unwrap();

        assert_eq!(store.get_container_vertex(at(205)).unwrap().key(), key_200);
        assert_eq!(store.get_container_vertex(at(100)).unwrap().key(), key_100);
        assert_eq!(store.get_container_vertex(at(309)).unwrap().key(), key_300);
        assert!(store.get_container_vertex(at(110)).is_none());
        assert!(store.get_container_vertex(at(50)).is_none());
        assert!(store.get_container_vertex(at(1000)).is_none());

        store.remove_vertex(key_200);

        assert!(store.get_vertex(at(200)).is_none());
        assert!(store.get_container_vertex(at(205)).is_none());
        assert_eq!(store.len(), 2);

        store.remove_vertex(key_100);
        store.remove_vertex(key_300);
        assert!(store.is_empty());
    }

    #[test]
    fn zero_sized_vertex_is_found_by_container_lookup_at_its_base() {
        let mut store: VertexStore = VertexStore::builder().build();
        let key = store.add_vertex(address(100), 0, ignore).unwrap();

        assert_eq!(store.get_container_vertex(at(100)).unwrap().key(), key);
        assert!(store.get_container_vertex(at(101)).is_none());

        store.remove_vertex(key);
    }

    #[test]
    fn remove_invokes_callback_exactly_once_with_base_address() {
        let released = Rc::new(RefCell::new(Vec::new()));

        let mut store = VertexStore::builder().build();

        let key = {
            let released = Rc::clone(&released);
            store
                .add_vertex(address(200), 10, move |address: NonNull<u8>| {
                    released.borrow_mut().push(address.addr().get());
                })
                .unwrap()
        };

        assert!(released.borrow().is_empty());

        store.remove_vertex(key);

        assert_eq!(*released.borrow(), vec![200]);
    }

    #[test]
    fn remove_invokes_only_the_callback_of_the_removed_vertex() {
        let calls = Rc::new(Cell::new(0));
        let mut store: VertexStore<BoxedRelease> = VertexStore::builder().build();

        let first = store.add_vertex(address(100), 10, counter(&calls)).unwrap();
        let second = store.add_vertex(address(200), 10, counter(&calls)).unwrap();

        store.remove_vertex(first);
        assert_eq!(calls.get(), 1);
        assert!(store.get_vertex(at(200)).is_some());

        store.remove_vertex(second);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn marks_are_visible_through_lookups() {
        let mut store: VertexStore = VertexStore::builder().build();
        let key = store.add_vertex(address(100), 10, ignore).unwrap();

        store.get_container_vertex_mut(at(104)).unwrap().set_marked(true);
        assert!(store.get_vertex(at(100)).unwrap().is_marked());

        store.get_vertex_mut(at(100)).unwrap().set_marked(false);
        assert!(!store.get_container_vertex(at(109)).unwrap().is_marked());

        assert!(store.get_vertex_mut(at(104)).is_none());
        assert!(store.get_container_vertex_mut(at(110)).is_none());

        store.remove_vertex(key);
    }

    #[test]
    fn iter_yields_vertices_in_address_order() {
        let mut store: VertexStore = VertexStore::builder().build();

        let keys: Vec<_> = [300, 100, 200]
            .into_iter()
            .map(|base| store.add_vertex(address(base), 10, ignore).unwrap())
            .collect();

        let bases: Vec<_> = store.iter().map(|vertex| vertex.address().addr().get()).collect();
        assert_eq!(bases, vec![100, 200, 300]);

        for key in keys {
            store.remove_vertex(key);
        }
    }

    #[test]
    fn slots_are_reused_and_shrunk() {
        let mut store: VertexStore = VertexStore::builder().initial_capacity(nz!(4)).build();

        let keys: Vec<_> = (1..=6)
            .map(|i| store.add_vertex(address(i * 100), 10, ignore).unwrap())
            .collect();

        // Slabs of 4 and 8 slots.
        assert_eq!(store.pool_capacity(), 12);

        for key in keys {
            store.remove_vertex(key);
        }

        assert_eq!(store.pool_capacity(), 12);
        assert_eq!(store.shrink_pool(), 2);
        assert_eq!(store.pool_capacity(), 0);

        // The store remains usable after shrinking.
        let key = store.add_vertex(address(100), 10, ignore).unwrap();
        assert_eq!(store.pool_capacity(), 4);
        store.remove_vertex(key);
    }

    #[test]
    fn shrink_pool_keeps_tracked_vertices() {
        let mut store: VertexStore = VertexStore::builder().initial_capacity(nz!(2)).build();

        let keys: Vec<_> = (1..=3)
            .map(|i| store.add_vertex(address(i * 100), 10, ignore).unwrap())
            .collect();

        store.remove_vertex(keys[0]);
        store.remove_vertex(keys[1]);

        // The first slab of 2 is unused, the second slab still holds the vertex at 300.
        assert_eq!(store.shrink_pool(), 1);
        assert_eq!(store.get_vertex(at(300)).unwrap().size(), 10);

        store.remove_vertex(keys[2]);
    }

    #[test]
    #[should_panic]
    fn duplicate_address_panics() {
        let mut store: VertexStore = VertexStore::builder().build();

        _ = store.add_vertex(address(100), 10, ignore).unwrap();
        _ = store.add_vertex(address(100), 20, ignore).unwrap();
    }

    #[test]
    fn duplicate_address_leaves_store_unchanged() {
        let mut store: VertexStore = VertexStore::builder().build();
        let key = store.add_vertex(address(100), 10, ignore).unwrap();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            _ = store.add_vertex(address(100), 20, ignore);
        }));

        assert!(result.is_err());
        assert_eq!(store.len(), 1);
        assert_eq!(store.get_vertex(at(100)).unwrap().size(), 10);

        store.remove_vertex(key);
    }

    #[test]
    #[should_panic]
    fn removing_twice_panics() {
        let mut store: VertexStore = VertexStore::builder().build();
        let key = store.add_vertex(address(100), 10, ignore).unwrap();

        store.remove_vertex(key);
        store.remove_vertex(key);
    }

    #[test]
    fn stale_key_does_not_remove_vertex_tracked_again_at_same_address() {
        let calls = Rc::new(Cell::new(0));
        let mut store: VertexStore<BoxedRelease> = VertexStore::builder().build();

        let old = store.add_vertex(address(100), 10, counter(&calls)).unwrap();
        store.remove_vertex(old);
        assert_eq!(calls.get(), 1);

        let new = store.add_vertex(address(100), 20, counter(&calls)).unwrap();
        assert_ne!(old, new);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            store.remove_vertex(old);
        }));

        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get_vertex(at(100)).unwrap().key(), new);
        assert_eq!(store.get_vertex(at(100)).unwrap().size(), 20);

        store.remove_vertex(new);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    #[should_panic]
    fn removing_stale_key_panics() {
        let mut store: VertexStore = VertexStore::builder().build();

        let old = store.add_vertex(address(100), 10, ignore).unwrap();
        store.remove_vertex(old);
        _ = store.add_vertex(address(100), 10, ignore).unwrap();

        store.remove_vertex(old);
    }

    #[test]
    #[should_panic]
    fn removing_key_of_other_store_panics() {
        let mut first: VertexStore = VertexStore::builder().build();
        let mut second: VertexStore = VertexStore::builder().build();

        let key = first.add_vertex(address(100), 10, ignore).unwrap();
        _ = second.add_vertex(address(100), 10, ignore).unwrap();

        second.remove_vertex(key);
    }

    #[test]
    fn drop_with_tracked_vertices_does_not_invoke_callbacks() {
        let calls = Rc::new(Cell::new(0));
        let mut store: VertexStore<BoxedRelease> = VertexStore::builder().build();

        _ = store.add_vertex(address(100), 10, counter(&calls)).unwrap();
        _ = store.add_vertex(address(200), 10, counter(&calls)).unwrap();

        drop(store);

        assert_eq!(calls.get(), 0);

        // The callbacks themselves were dropped along with the store.
        assert_eq!(Rc::strong_count(&calls), 1);
    }

    #[test]
    #[should_panic]
    fn drop_with_tracked_vertices_under_strict_policy_panics() {
        let mut store: VertexStore = VertexStore::builder()
            .drop_policy(DropPolicy::MustNotDropContents)
            .build();

        _ = store.add_vertex(address(100), 10, ignore).unwrap();
    }

    #[test]
    fn empty_store_under_strict_policy_drops_cleanly() {
        let mut store: VertexStore = VertexStore::builder()
            .drop_policy(DropPolicy::MustNotDropContents)
            .build();

        let key = store.add_vertex(address(100), 10, ignore).unwrap();
        store.remove_vertex(key);
    }
}
