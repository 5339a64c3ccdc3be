//! Basic benchmarks for the `vertex_store` crate.
#![allow(
    missing_docs,
    reason = "No need for API documentation in benchmark code"
)]

use std::hint::black_box;
use std::ptr::{self, NonNull};
use std::time::Instant;

use alloc_tracker::Allocator;
use criterion::{Criterion, criterion_group, criterion_main};
use vertex_store::{VertexKey, VertexStore};

criterion_group!(benches, entrypoint);
criterion_main!(benches);

#[global_allocator]
static ALLOCATOR: Allocator<std::alloc::System> = Allocator::system();

const TRACKED_VERTICES: usize = 10_000;
const VERTEX_SIZE: usize = 64;

fn ignore(_: NonNull<u8>) {}

fn address(index: usize) -> NonNull<u8> {
    NonNull::new(ptr::without_provenance_mut(0x10_0000 + index * VERTEX_SIZE)).unwrap()
}

fn populated_store() -> (VertexStore, Vec<VertexKey>) {
    let mut store: VertexStore = VertexStore::builder().build();

    let keys = (0..TRACKED_VERTICES)
        .map(|index| store.add_vertex(address(index), VERTEX_SIZE, ignore).unwrap())
        .collect();

    (store, keys)
}

fn entrypoint(c: &mut Criterion) {
    let allocs = alloc_tracker::Session::new();

    let mut group = c.benchmark_group("vertex_store_basic");

    let allocs_op = allocs.operation("add_remove_warm");
    group.bench_function("add_remove_warm", |b| {
        b.iter_custom(|iters| {
            let (mut store, keys) = populated_store();

            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for _ in 0..iters {
                let key = store
                    .add_vertex(address(TRACKED_VERTICES), VERTEX_SIZE, ignore)
                    .unwrap();
                store.remove_vertex(black_box(key));
            }

            let elapsed = start.elapsed();

            for key in keys {
                store.remove_vertex(key);
            }

            elapsed
        });
    });

    let allocs_op = allocs.operation("get_vertex");
    group.bench_function("get_vertex", |b| {
        b.iter_custom(|iters| {
            let (mut store, keys) = populated_store();

            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for i in 0..iters {
                let index = usize::try_from(i).unwrap() % TRACKED_VERTICES;
                _ = black_box(store.get_vertex(address(index).as_ptr()));
            }

            let elapsed = start.elapsed();

            for key in keys {
                store.remove_vertex(key);
            }

            elapsed
        });
    });

    let allocs_op = allocs.operation("get_container_vertex");
    group.bench_function("get_container_vertex", |b| {
        b.iter_custom(|iters| {
            let (mut store, keys) = populated_store();

            let _span = allocs_op.measure_thread().iterations(iters);

            let start = Instant::now();

            for i in 0..iters {
                let index = usize::try_from(i).unwrap() % TRACKED_VERTICES;
                let interior = address(index).as_ptr().wrapping_add(VERTEX_SIZE / 2);
                _ = black_box(store.get_container_vertex(interior));
            }

            let elapsed = start.elapsed();

            for key in keys {
                store.remove_vertex(key);
            }

            elapsed
        });
    });

    group.finish();

    allocs.print_to_stdout();
}
