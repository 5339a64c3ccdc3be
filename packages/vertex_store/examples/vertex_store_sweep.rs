//! Demonstrates how a collector uses `VertexStore` for one mark and sweep cycle.
//!
//! A handful of heap blocks are tracked, some of them are marked as reachable through interior
//! pointers, and every unmarked vertex is then removed, which releases its block.

use std::alloc::{Layout, alloc, dealloc};
use std::ptr::NonNull;

use vertex_store::{VertexKey, VertexStore};

const BLOCK_SIZE: usize = 48;

fn block_layout() -> Layout {
    Layout::from_size_align(BLOCK_SIZE, 8).expect("valid layout parameters")
}

fn release_block(address: NonNull<u8>) {
    println!("  released block at {address:?}");

    // SAFETY: Every tracked block was allocated in main() with block_layout() and the store
    // invokes this callback once per block.
    unsafe { dealloc(address.as_ptr(), block_layout()) };
}

fn main() -> Result<(), vertex_store::Error> {
    let mut store: VertexStore = VertexStore::builder().build();

    let mut keys = Vec::new();

    for _ in 0..6 {
        // SAFETY: The layout has a non-zero size.
        let block = NonNull::new(unsafe { alloc(block_layout()) }).expect("allocation succeeded");

        keys.push(store.add_vertex(block, BLOCK_SIZE, release_block)?);
    }

    println!("Tracking {} blocks", store.len());

    // Pretend the object graph walk found pointers into the middle of every other block.
    for key in keys.iter().step_by(2) {
        // SAFETY: The offset is within the block.
        let interior = unsafe { key.address().add(BLOCK_SIZE / 2) };

        if let Some(vertex) = store.get_container_vertex_mut(interior.as_ptr()) {
            vertex.set_marked(true);
        }
    }

    let dead: Vec<VertexKey> = store
        .iter()
        .filter(|vertex| !vertex.is_marked())
        .map(|vertex| vertex.key())
        .collect();

    println!("Sweeping {} unreachable blocks:", dead.len());

    for key in dead {
        store.remove_vertex(key);
    }

    // Clear the marks of the survivors for the next cycle.
    for key in &keys {
        if let Some(vertex) = store
            .get_vertex_mut(key.address().as_ptr())
            .filter(|vertex| vertex.key() == *key)
        {
            vertex.set_marked(false);
        }
    }

    println!("{} blocks survive the cycle", store.len());

    let discarded = store.shrink_pool();
    println!("Shrinking the vertex pool discarded {discarded} slabs");

    // Keys of swept vertices are stale. Only remove the vertices that are still tracked.
    for key in keys {
        let is_tracked = store
            .get_vertex(key.address().as_ptr())
            .is_some_and(|vertex| vertex.key() == key);

        if is_tracked {
            store.remove_vertex(key);
        }
    }

    Ok(())
}
