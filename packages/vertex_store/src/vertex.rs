use std::fmt;
use std::ptr::NonNull;

/// Identifies one vertex tracked by a specific [`VertexStore`][crate::VertexStore].
///
/// A key is returned when a vertex is added and can also be obtained from the vertex itself via
/// [`Vertex::key()`]. It stays meaningful only while the vertex is tracked; using it with a
/// different store, or after the vertex was removed, is a contract violation that panics. This
/// holds even if the same address has been tracked again in the meantime, as every vertex
/// added to a store gets a distinct key.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct VertexKey {
    store_id: u64,

    /// Position of the vertex in the sequence of all vertices ever added to the store.
    sequence: u64,

    address: NonNull<u8>,
}

impl VertexKey {
    #[must_use]
    pub(crate) fn new(store_id: u64, sequence: u64, address: NonNull<u8>) -> Self {
        Self {
            store_id,
            sequence,
            address,
        }
    }

    #[must_use]
    pub(crate) fn store_id(&self) -> u64 {
        self.store_id
    }

    /// The base address of the tracked block this key refers to.
    #[must_use]
    #[inline]
    pub fn address(&self) -> NonNull<u8> {
        self.address
    }
}

// SAFETY: The key is only an identifier. The address it holds is never dereferenced.
unsafe impl Send for VertexKey {}

// SAFETY: The key is only an identifier. The address it holds is never dereferenced.
unsafe impl Sync for VertexKey {}

/// Bookkeeping record of one block of memory tracked by the collector.
///
/// The vertex does not own the tracked block. It only remembers where the block lives and how
/// large it is, plus the callback that releases the block when the vertex is removed from its
/// store. Vertices are created and destroyed exclusively by
/// [`VertexStore`][crate::VertexStore].
pub struct Vertex<R> {
    key: VertexKey,
    size: usize,
    marked: bool,
    release: R,
}

impl<R> Vertex<R> {
    #[must_use]
    pub(crate) fn new(key: VertexKey, size: usize, release: R) -> Self {
        Self {
            key,
            size,
            marked: false,
            release,
        }
    }

    /// The key that identifies this vertex in its store.
    #[must_use]
    #[inline]
    pub fn key(&self) -> VertexKey {
        self.key
    }

    /// The base address of the tracked block.
    #[must_use]
    #[inline]
    pub fn address(&self) -> NonNull<u8> {
        self.key.address
    }

    /// The size of the tracked block in bytes.
    #[must_use]
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether `address` lies within the tracked block.
    ///
    /// A zero-sized block contains its own base address and nothing else.
    #[must_use]
    pub fn contains(&self, address: *const u8) -> bool {
        let base = self.key.address.addr().get();

        address
            .addr()
            .checked_sub(base)
            .is_some_and(|offset| offset < self.size.max(1))
    }

    /// Whether the collector has marked this vertex during its current traversal.
    #[must_use]
    #[inline]
    pub fn is_marked(&self) -> bool {
        self.marked
    }

    /// Marks or unmarks the vertex.
    #[inline]
    pub fn set_marked(&mut self, marked: bool) {
        self.marked = marked;
    }

    /// Consumes the vertex, handing back the release callback.
    pub(crate) fn into_release(self) -> R {
        self.release
    }
}

impl<R> fmt::Debug for Vertex<R> {
    #[cfg_attr(test, mutants::skip)] // Debug output has no contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vertex")
            .field("address", &self.key.address)
            .field("size", &self.size)
            .field("marked", &self.marked)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::ptr;

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(VertexKey: Send, Sync, Copy, fmt::Debug);
    assert_impl_all!(Vertex<fn(NonNull<u8>)>: Send, Sync, fmt::Debug);
    assert_not_impl_any!(Vertex<std::rc::Rc<u8>>: Send);
    assert_not_impl_any!(Vertex<fn(NonNull<u8>)>: Clone);

    fn address(value: usize) -> NonNull<u8> {
        NonNull::new(ptr::without_provenance_mut(value)).unwrap()
    }

    fn vertex(base: usize, size: usize) -> Vertex<()> {
        Vertex::new(VertexKey::new(1, 0, address(base)), size, ())
    }

    #[test]
    fn contains_covers_exactly_the_block_range() {
        let vertex = vertex(100, 10);

        assert!(!vertex.contains(ptr::without_provenance(99)));
        assert!(vertex.contains(ptr::without_provenance(100)));
        assert!(vertex.contains(ptr::without_provenance(105)));
        assert!(vertex.contains(ptr::without_provenance(109)));
        assert!(!vertex.contains(ptr::without_provenance(110)));
    }

    #[test]
    fn zero_sized_block_contains_only_its_base() {
        let vertex = vertex(100, 0);

        assert!(vertex.contains(ptr::without_provenance(100)));
        assert!(!vertex.contains(ptr::without_provenance(101)));
        assert!(!vertex.contains(ptr::without_provenance(99)));
    }

    #[test]
    fn block_at_end_of_address_space_does_not_overflow() {
        let vertex = vertex(usize::MAX - 4, 8);

        assert!(vertex.contains(ptr::without_provenance(usize::MAX)));
        assert!(!vertex.contains(ptr::without_provenance(usize::MAX - 5)));
    }

    #[test]
    fn marking_is_reversible() {
        let mut vertex = vertex(100, 10);
        assert!(!vertex.is_marked());

        vertex.set_marked(true);
        assert!(vertex.is_marked());

        vertex.set_marked(false);
        assert!(!vertex.is_marked());
    }

    #[test]
    fn accessors_report_construction_values() {
        let vertex = vertex(200, 24);

        assert_eq!(vertex.address(), address(200));
        assert_eq!(vertex.size(), 24);
        assert_eq!(vertex.key().address(), address(200));
        assert_eq!(vertex.key().store_id(), 1);
    }

    #[test]
    fn keys_for_same_address_differ_by_sequence() {
        let first = VertexKey::new(1, 0, address(100));
        let second = VertexKey::new(1, 1, address(100));

        assert_ne!(first, second);
        assert_eq!(first.address(), second.address());
    }

    #[test]
    fn release_callback_is_handed_back() {
        let vertex = Vertex::new(VertexKey::new(1, 0, address(100)), 10, 42_u32);

        assert_eq!(vertex.into_release(), 42);
    }
}
