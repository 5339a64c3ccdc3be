//! Basic usage example for `GrowablePool`.
//!
//! This example allocates blocks beyond the capacity of the first slab to show how the pool
//! grows, then releases everything and shrinks the pool back down.

use block_pool::GrowablePool;
use new_zealand::nz;

fn main() -> Result<(), block_pool::Error> {
    let mut pool = GrowablePool::builder()
        .block_layout_of::<[u32; 8]>()
        .initial_blocks(nz!(16))
        .growth_factor(2.0)
        .build();

    println!("Created GrowablePool with capacity: {}", pool.capacity());

    let mut blocks = Vec::new();

    for round in 0..100_u32 {
        let block = pool.allocate()?.cast::<[u32; 8]>();

        // SAFETY: The block is valid for writes of the layout the pool was built for.
        unsafe { block.write([round; 8]) };

        blocks.push(block);
    }

    println!(
        "Allocated {} blocks across {} slabs, capacity {}",
        pool.len(),
        pool.pool_count(),
        pool.capacity()
    );

    for block in blocks {
        pool.release(block.cast());
    }

    let discarded = pool.shrink();

    println!(
        "Released everything and discarded {discarded} slabs, capacity now {}",
        pool.capacity()
    );

    Ok(())
}
