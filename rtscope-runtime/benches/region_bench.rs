//! Region and interrupt benchmarks using criterion.
//!
//! Run with: cargo bench --bench region_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rtscope_runtime::{AsyncInterrupt, End, GlobalPool, Region};

fn bench_enter_exit(c: &mut Criterion) {
    let mut group = c.benchmark_group("enter_exit");

    group.bench_function("generic", |b| {
        let region = Region::new(4096).unwrap();
        b.iter(|| region.enter(|| Ok(black_box(1))).unwrap());
    });

    group.bench_function("pinned", |b| {
        let region = Region::pinnable(4096).unwrap();
        region.enter(|| region.pin()).unwrap();
        b.iter(|| region.enter(|| Ok(black_box(1))).unwrap());
        region.unpin().unwrap();
    });

    for depth in [1usize, 4, 16] {
        let regions: Vec<Region> = (0..depth).map(|_| Region::new(1024).unwrap()).collect();
        group.bench_with_input(BenchmarkId::new("nested", depth), &regions, |b, regions| {
            b.iter(|| enter_chain(regions));
        });
    }

    group.finish();
}

fn enter_chain(regions: &[Region]) {
    if let Some((first, rest)) = regions.split_first() {
        first
            .enter(|| {
                enter_chain(rest);
                Ok(())
            })
            .unwrap();
    }
}

fn bench_alloc(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_and_reclaim");

    for count in [16usize, 256] {
        group.throughput(Throughput::Elements(count as u64));
        let region = Region::new(count * 16).unwrap();
        group.bench_with_input(BenchmarkId::new("u64", count), &count, |b, &count| {
            b.iter(|| {
                region
                    .enter(|| {
                        for i in 0..count {
                            black_box(region.alloc(i as u64)?);
                        }
                        Ok(())
                    })
                    .unwrap()
            });
        });
    }

    group.finish();
}

fn bench_backing_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("backing_store");

    let pool = GlobalPool::new(1 << 24);
    group.bench_function("pool_reserve_dispose", |b| {
        b.iter(|| black_box(pool.reserve(4096).unwrap()));
    });

    let store = pool.reserve(1 << 16).unwrap();
    group.bench_function("carve_release_bottom", |b| {
        b.iter(|| {
            let carve = store.sub_reserve(End::Bottom, black_box(256)).unwrap();
            store.release(carve).unwrap();
        });
    });

    group.bench_function("carve_release_both_ends", |b| {
        b.iter(|| {
            let low = store.sub_reserve(End::Bottom, 128).unwrap();
            let high = store.sub_reserve(End::Top, 128).unwrap();
            store.release(high).unwrap();
            store.release(low).unwrap();
        });
    });

    group.finish();
}

fn bench_interrupts(c: &mut Criterion) {
    let mut group = c.benchmark_group("interrupts");

    let irq = AsyncInterrupt::new();
    group.bench_function("protected_call", |b| {
        b.iter(|| irq.run(|_| Ok(black_box(1))).unwrap());
    });

    group.bench_function("fire_clear", |b| {
        irq.run(|_| {
            b.iter(|| {
                black_box(irq.fire());
                black_box(irq.clear());
            });
            Ok(())
        })
        .unwrap();
    });

    group.bench_function("fire_deliver", |b| {
        b.iter(|| {
            irq.run(|frame| {
                irq.fire();
                frame.check()
            })
            .unwrap()
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_enter_exit,
    bench_alloc,
    bench_backing_store,
    bench_interrupts,
);
criterion_main!(benches);
