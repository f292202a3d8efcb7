//! Allocator benchmarks.

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use spanalloc::{Allocator, Config, NoopWorld};

fn bench_alloc_free_cycle(c: &mut Criterion) {
    let alloc = Allocator::new(Config::default());
    let sizes: &[usize] = &[16, 64, 256, 1024, 4096, 32768, 65536];
    let mut group = c.benchmark_group("alloc_free_cycle");

    for &size in sizes {
        group.bench_with_input(BenchmarkId::new("spanalloc", size), &size, |b, &sz| {
            let mut cache = alloc.cache();
            b.iter(|| {
                let p = cache.alloc(black_box(sz)).unwrap();
                cache.free(black_box(p));
            });
        });
    }
    group.finish();
}

fn bench_alloc_burst(c: &mut Criterion) {
    let alloc = Allocator::new(Config::default());
    let mut group = c.benchmark_group("alloc_burst");

    group.bench_function("1000x64B", |b| {
        let mut cache = alloc.cache();
        let mut ptrs = Vec::with_capacity(1000);
        b.iter(|| {
            ptrs.extend((0..1000).map(|_| cache.alloc(64).unwrap()));
            for p in ptrs.drain(..) {
                cache.free(p);
            }
        });
    });

    group.bench_function("central_only_64B", |b| {
        let cls = alloc.class_for(64);
        let central = alloc.central(cls);
        let mut out = Vec::with_capacity(32);
        b.iter(|| {
            central.alloc_list(alloc.heap(), 32, &mut out);
            central.free_list(alloc.heap(), &out);
            out.clear();
        });
    });

    group.finish();
}

fn bench_class_for(c: &mut Criterion) {
    let alloc = Allocator::new(Config::default());
    c.bench_function("class_for", |b| {
        b.iter(|| {
            for size in (1..=32 * 1024).step_by(97) {
                black_box(alloc.class_for(black_box(size)));
            }
        });
    });
}

fn bench_scavenge(c: &mut Criterion) {
    c.bench_function("free_os_memory_256_pages", |b| {
        b.iter_batched(
            || {
                let alloc = Allocator::new(Config::default());
                alloc.free_large(alloc.alloc_large(64 * 1024).unwrap());
                alloc
            },
            |alloc| black_box(alloc.free_os_memory(&NoopWorld)),
            criterion::BatchSize::SmallInput,
        );
    });
}

criterion_group!(
    benches,
    bench_alloc_free_cycle,
    bench_alloc_burst,
    bench_class_for,
    bench_scavenge
);
criterion_main!(benches);
