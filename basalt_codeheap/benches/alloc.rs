//! Code Heap Allocation Benchmarks
//!
//! Measures the hot paths of the segment allocator: virgin-space carving,
//! free-list reuse, and interior-pointer resolution through the segment map.
//!
//! # Benchmark Categories
//!
//! 1. **Virgin Allocation**: carving fresh segments off the frontier
//! 2. **Free-List Reuse**: allocate/free churn hitting the free list
//! 3. **Interior Lookup**: `find_start` hop-chain walks of varying depth

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use basalt_codeheap::{CodeHeap, HeapConfig};

fn bench_config() -> HeapConfig {
    HeapConfig {
        reserved_size: 64 * 1024 * 1024,
        ..Default::default()
    }
}

fn bench_virgin_allocation(c: &mut Criterion) {
    let mut group = c.benchmark_group("virgin_allocation");
    for size in [64usize, 512, 4096] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || CodeHeap::new("bench", bench_config()).unwrap(),
                |mut heap| {
                    for _ in 0..128 {
                        black_box(heap.allocate(size));
                    }
                },
                criterion::BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

fn bench_freelist_churn(c: &mut Criterion) {
    c.bench_function("freelist_churn", |b| {
        let mut heap = CodeHeap::new("bench", bench_config()).unwrap();
        // Seed a fragmented free list.
        let blocks: Vec<_> = (0..256).map(|_| heap.allocate(200).unwrap()).collect();
        for block in blocks.iter().step_by(2) {
            unsafe { heap.deallocate(*block) };
        }

        b.iter(|| {
            let p = heap.allocate(200).unwrap();
            unsafe { heap.deallocate(black_box(p)) };
        })
    });
}

fn bench_find_start(c: &mut Criterion) {
    let mut group = c.benchmark_group("find_start");
    // Deeper interior pointers walk longer hop chains.
    for block_size in [128usize, 4096, 64 * 1024] {
        group.bench_with_input(
            BenchmarkId::from_parameter(block_size),
            &block_size,
            |b, &block_size| {
                let mut heap = CodeHeap::new("bench", bench_config()).unwrap();
                let block = heap.allocate(block_size).unwrap();
                let interior = unsafe { block.as_ptr().add(block_size - 1) };

                b.iter(|| black_box(heap.find_start(black_box(interior))))
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_virgin_allocation,
    bench_freelist_churn,
    bench_find_start
);
criterion_main!(benches);
