//! Integration tests that drive a `VertexStore` through long randomized sequences of additions
//! and removals and check every lookup against a simple model.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::ptr::{self, NonNull};
use std::rc::Rc;

use new_zealand::nz;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use vertex_store::{VertexKey, VertexStore};

/// Blocks are laid out on a grid so they never overlap: slot `n` may hold a block starting at
/// `GRID_BASE + n * GRID_STRIDE` of at most `GRID_STRIDE` bytes.
const GRID_BASE: usize = 0x1_0000;
const GRID_STRIDE: usize = 64;
const GRID_SLOTS: usize = 512;

const PROBE_START: usize = GRID_BASE - GRID_STRIDE;
const PROBE_END: usize = GRID_BASE + (GRID_SLOTS + 1) * GRID_STRIDE;

type Release = Box<dyn FnOnce(NonNull<u8>)>;

fn address(value: usize) -> NonNull<u8> {
    NonNull::new(ptr::without_provenance_mut(value)).unwrap()
}

fn at(value: usize) -> *const u8 {
    ptr::without_provenance(value)
}

fn recorder(log: &Rc<RefCell<Vec<usize>>>) -> Release {
    let log = Rc::clone(log);
    Box::new(move |address: NonNull<u8>| log.borrow_mut().push(address.addr().get()))
}

#[test]
fn randomized_lookups_match_model() {
    let mut rng = StdRng::seed_from_u64(0x7e57_0ce5);
    let released = Rc::new(RefCell::new(Vec::new()));

    let mut store: VertexStore<Release> = VertexStore::builder()
        .initial_capacity(nz!(16))
        .growth_factor(1.5)
        .build();

    // Base address -> (key, size).
    let mut model: BTreeMap<usize, (VertexKey, usize)> = BTreeMap::new();
    let mut expected_released = Vec::new();

    for step in 0..10_000 {
        let slot = rng.random_range(0..GRID_SLOTS);
        let base = GRID_BASE + slot * GRID_STRIDE;

        if let Some((key, _)) = model.remove(&base) {
            store.remove_vertex(key);
            expected_released.push(base);
        } else {
            let size = rng.random_range(0..=GRID_STRIDE);
            let key = store.add_vertex(address(base), size, recorder(&released)).unwrap();
            model.insert(base, (key, size));
        }

        if step % 1_000 == 0 {
            store.shrink_pool();
        }

        assert_eq!(store.len(), model.len());

        // Probe a handful of random addresses across the whole grid, including its edges.
        for _ in 0..8 {
            let probe = rng.random_range(PROBE_START..PROBE_END);
            check_probe(&store, &model, probe);
        }
    }

    assert_eq!(*released.borrow(), expected_released);

    // Every tracked vertex resolves through both lookups at its first and last byte.
    for (&base, &(key, size)) in &model {
        assert_eq!(store.get_vertex(at(base)).unwrap().key(), key);
        assert_eq!(store.get_container_vertex(at(base)).unwrap().key(), key);

        if size > 0 {
            let last = base + size - 1;
            assert_eq!(store.get_container_vertex(at(last)).unwrap().key(), key);
        }
    }

    let ordered: Vec<_> = store.iter().map(|vertex| vertex.key()).collect();
    let expected: Vec<_> = model.values().map(|&(key, _)| key).collect();
    assert_eq!(ordered, expected);

    for (_, (key, _)) in model {
        store.remove_vertex(key);
    }

    assert!(store.is_empty());
    store.shrink_pool();
    assert_eq!(store.pool_capacity(), 0);
}

fn check_probe(
    store: &VertexStore<Release>,
    model: &BTreeMap<usize, (VertexKey, usize)>,
    probe: usize,
) {
    let exact = model.get(&probe).map(|&(key, _)| key);
    assert_eq!(store.get_vertex(at(probe)).map(|vertex| vertex.key()), exact);

    let container = model
        .range(..=probe)
        .next_back()
        .filter(|&(&base, &(_, size))| probe - base < size.max(1))
        .map(|(_, &(key, _))| key);
    assert_eq!(
        store.get_container_vertex(at(probe)).map(|vertex| vertex.key()),
        container
    );
}

#[test]
fn every_callback_fires_exactly_once_across_slab_boundaries() {
    let released = Rc::new(RefCell::new(Vec::new()));

    let mut store: VertexStore<Release> = VertexStore::builder().initial_capacity(nz!(4)).build();

    let keys: Vec<_> = (0..100)
        .map(|i| {
            store
                .add_vertex(address(GRID_BASE + i * GRID_STRIDE), 8, recorder(&released))
                .unwrap()
        })
        .collect();

    assert!(store.pool_capacity() >= 100);

    // Remove in reverse order to release slots out of allocation order.
    for key in keys.iter().rev() {
        store.remove_vertex(*key);
    }

    let mut released = released.borrow().clone();
    released.sort_unstable();

    let expected: Vec<_> = (0..100).map(|i| GRID_BASE + i * GRID_STRIDE).collect();
    assert_eq!(released, expected);
}

#[test]
fn store_can_be_moved_to_another_thread() {
    fn ignore(_: NonNull<u8>) {}

    let mut store: VertexStore = VertexStore::builder().build();
    let key = store.add_vertex(address(GRID_BASE), 16, ignore).unwrap();

    let store = std::thread::spawn(move || {
        let mut store = store;
        assert_eq!(store.get_container_vertex(at(GRID_BASE + 15)).unwrap().key(), key);
        store.remove_vertex(key);
        store
    })
    .join()
    .expect("thread completed successfully");

    assert!(store.is_empty());
}
