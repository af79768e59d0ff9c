//! Buffer-exchange benchmarks.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dmashare::exchange::{Consumer, Direction, HandleRegistry, PAGE_SIZE};
use std::sync::Arc;

fn bench_create_close(c: &mut Criterion) {
    let mut group = c.benchmark_group("create_close");

    for pages in [1, 16, 256] {
        let registry = HandleRegistry::with_host_platform();
        let owner = Consumer::new("bench");

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(pages), &pages, |b, &pages| {
            b.iter(|| {
                let descriptor = registry.create(&owner, pages * PAGE_SIZE).unwrap();
                registry.close(descriptor).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_attach_map(c: &mut Criterion) {
    let mut group = c.benchmark_group("attach_map");

    let registry = HandleRegistry::with_host_platform();
    let owner = Consumer::new("bench");
    let descriptor = registry.create(&owner, 16 * PAGE_SIZE).unwrap();
    let handle = registry.get(descriptor).unwrap();
    let consumer = Consumer::new("consumer");

    group.throughput(Throughput::Elements(1));
    group.bench_function("attach_map_unmap_detach", |b| {
        b.iter(|| {
            let attachment = handle.attach(&consumer);
            let view = attachment.map(Direction::Bidirectional).unwrap();
            std::hint::black_box(view.ranges());
            view.unmap();
            attachment.detach();
        });
    });

    group.finish();
}

fn bench_access_brackets(c: &mut Criterion) {
    let mut group = c.benchmark_group("access_brackets");

    let registry = HandleRegistry::with_host_platform();
    let owner = Consumer::new("bench");
    let descriptor = registry.create(&owner, 16 * PAGE_SIZE).unwrap();
    let handle = registry.get(descriptor).unwrap();

    group.throughput(Throughput::Elements(1));
    group.bench_function("begin_end_cached", |b| {
        b.iter(|| {
            handle.begin_access(Direction::Bidirectional).unwrap();
            handle.end_access(Direction::Bidirectional).unwrap();
        });
    });

    group.finish();
}

fn bench_concurrent_attach(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_attach");

    let registry = Arc::new(HandleRegistry::with_host_platform());
    let owner = Consumer::new("bench");
    let descriptor = registry.create(&owner, 16 * PAGE_SIZE).unwrap();
    let handle = Arc::new(registry.get(descriptor).unwrap());

    group.throughput(Throughput::Elements(100));
    group.bench_function("4_threads_100_ops_each", |b| {
        b.iter(|| {
            let workers: Vec<_> = (0..4)
                .map(|i| {
                    let handle = Arc::clone(&handle);
                    std::thread::spawn(move || {
                        let consumer = Consumer::new(&format!("worker-{i}"));
                        for _ in 0..100 {
                            let attachment = handle.attach(&consumer);
                            let view = attachment.map(Direction::ToConsumer).unwrap();
                            std::hint::black_box(view.ranges());
                        }
                    })
                })
                .collect();

            for w in workers {
                w.join().unwrap();
            }
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_create_close,
    bench_attach_map,
    bench_access_brackets,
    bench_concurrent_attach
);
criterion_main!(benches);
