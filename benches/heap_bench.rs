//! Allocation throughput of both heap kinds.
//!
//! Run with: cargo bench --bench heap_bench

use std::ptr::NonNull;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use nestalloc::{FitPolicy, Heap, MemoryContext, ResetEnds};

const ARENA: usize = 4 * 1024 * 1024;

fn bootstrap(memory: &mut [usize]) -> MemoryContext {
    let start = NonNull::new(memory.as_mut_ptr().cast::<u8>()).unwrap();
    unsafe { MemoryContext::bootstrap(start, memory.len() * std::mem::size_of::<usize>()).unwrap() }
}

fn bench_expanding(c: &mut Criterion) {
    let mut group = c.benchmark_group("expanding");

    for policy in [FitPolicy::FirstFit, FitPolicy::BestFit] {
        let mut memory = vec![0usize; ARENA / std::mem::size_of::<usize>()];
        let mut context = bootstrap(&mut memory);
        let root = context.root();
        context.expanding_heap_mut(root).unwrap().set_fit_policy(policy);

        // Fragment the free list a bit so that the policies differ.
        let pinned: Vec<_> = (0..512)
            .map(|i| context.allocate(16 + (i % 7) * 24, 8, None).unwrap())
            .collect();
        for address in pinned.iter().step_by(2) {
            unsafe { context.deallocate(*address, None).unwrap() };
        }

        group.throughput(Throughput::Elements(64));
        group.bench_with_input(BenchmarkId::new("alloc_free_64", format!("{policy:?}")), &policy, |b, _| {
            let mut live = Vec::with_capacity(64);
            b.iter(|| {
                for i in 0..64 {
                    live.push(context.allocate(black_box(8 + i * 8), 8, None).unwrap());
                }
                for address in live.drain(..).rev() {
                    unsafe { context.deallocate(address, None).unwrap() };
                }
            });
        });
    }

    group.finish();
}

fn bench_solid(c: &mut Criterion) {
    let mut group = c.benchmark_group("solid");

    let mut memory = vec![0usize; ARENA / std::mem::size_of::<usize>()];
    let mut context = bootstrap(&mut memory);
    let solid = context.create_solid_heap(ARENA / 2, None, 8).unwrap();

    group.throughput(Throughput::Elements(256));
    group.bench_function("bump_256_then_reset", |b| {
        let heap = context.solid_heap_mut(solid).unwrap();
        b.iter(|| {
            for i in 0..256 {
                let align = if i % 2 == 0 { 8 } else { -16 };
                black_box(heap.allocate(black_box(48), align).unwrap());
            }
            heap.reset(ResetEnds::Both).unwrap();
        });
    });

    group.bench_function("checkpoint_round_trip", |b| {
        let heap = context.solid_heap_mut(solid).unwrap();
        b.iter(|| {
            heap.save_state(1).unwrap();
            for _ in 0..32 {
                black_box(heap.allocate(black_box(128), 16).unwrap());
            }
            heap.load_state(1).unwrap();
        });
    });

    group.finish();
}

fn bench_nested(c: &mut Criterion) {
    let mut memory = vec![0usize; ARENA / std::mem::size_of::<usize>()];
    let mut context = bootstrap(&mut memory);

    c.bench_function("create_destroy_nested", |b| {
        b.iter(|| {
            let heap = context.create_expanding_heap(black_box(64 * 1024), None, 8).unwrap();
            context.destroy_heap(heap).unwrap();
        });
    });
}

criterion_group!(benches, bench_expanding, bench_solid, bench_nested);
criterion_main!(benches);
