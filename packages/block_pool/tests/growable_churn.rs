//! Integration tests for `GrowablePool` under long randomized sequences of allocations,
//! releases and shrinks.

use std::collections::HashSet;
use std::ptr::NonNull;

use block_pool::GrowablePool;
use new_zealand::nz;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[repr(C)]
struct Payload {
    id: u64,
    check: u64,
}

impl Payload {
    fn new(id: u64) -> Self {
        Self {
            id,
            check: !id,
        }
    }

    fn is_intact(&self, id: u64) -> bool {
        self.id == id && self.check == !id
    }
}

#[test]
fn randomized_churn_keeps_blocks_disjoint_and_intact() {
    let mut rng = StdRng::seed_from_u64(0x5eed_b10c);

    let mut pool = GrowablePool::builder()
        .block_layout_of::<Payload>()
        .initial_blocks(nz!(8))
        .growth_factor(1.5)
        .build();

    let mut live: Vec<(NonNull<Payload>, u64)> = Vec::new();
    let mut next_id = 0_u64;

    for step in 0..20_000 {
        if live.is_empty() || rng.random_bool(0.55) {
            let block = pool.allocate().unwrap().cast::<Payload>();

            // SAFETY: The block is valid for writes of Payload, the layout the pool was built for.
            unsafe { block.write(Payload::new(next_id)) };

            live.push((block, next_id));
            next_id += 1;
        } else {
            let index = rng.random_range(0..live.len());
            let (block, id) = live.swap_remove(index);

            // SAFETY: The block is live and holds the payload we wrote into it.
            assert!(unsafe { block.as_ref() }.is_intact(id));

            pool.release(block.cast());
        }

        if step % 2_500 == 0 {
            let capacity_before = pool.capacity();
            pool.shrink();
            assert!(pool.capacity() <= capacity_before);
        }

        assert_eq!(pool.len(), live.len());
    }

    let distinct: HashSet<_> = live.iter().map(|(block, _)| *block).collect();
    assert_eq!(distinct.len(), live.len());

    for (block, id) in live {
        // SAFETY: The block is live and holds the payload we wrote into it.
        assert!(unsafe { block.as_ref() }.is_intact(id));
        pool.release(block.cast());
    }

    assert!(pool.is_empty());
    assert!(pool.pool_count() > 0);

    pool.shrink();
    assert_eq!(pool.pool_count(), 0);
}

#[test]
fn shrink_never_discards_slab_with_allocated_block() {
    let mut pool = GrowablePool::builder()
        .block_layout_of::<u64>()
        .initial_blocks(nz!(4))
        .growth_factor(2.0)
        .build();

    // Slabs of 4, 8 and 24 blocks.
    let blocks: Vec<_> = (0..36).map(|_| pool.allocate().unwrap()).collect();
    assert_eq!(pool.pool_count(), 3);

    // Keep exactly one block alive (the very first one, in the first slab).
    let (keep, release) = blocks.split_first().unwrap();
    for &block in release {
        pool.release(block);
    }

    assert_eq!(pool.shrink(), 2);
    assert_eq!(pool.pool_count(), 1);
    assert_eq!(pool.capacity(), 4);

    // The kept block is still owned by the pool: releasing it must succeed.
    pool.release(*keep);
    assert!(pool.is_empty());
}

#[test]
fn pool_can_be_moved_to_another_thread() {
    let mut pool = GrowablePool::builder().block_layout_of::<u32>().build();
    let address = pool.allocate().unwrap().addr();

    let (pool, allocated_elsewhere) = std::thread::spawn(move || {
        let mut pool = pool;
        let block = pool.allocate().unwrap();
        let allocated_elsewhere = block.addr();
        pool.release(block);
        (pool, allocated_elsewhere)
    })
    .join()
    .expect("thread completed successfully");

    assert_eq!(pool.len(), 1);
    assert_ne!(address, allocated_elsewhere);
}
