//! Paginated upgrade benchmarks.

use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use shardline_bench::{Scale, TestContext};
use shardline_core::Upgrade;

fn bench_upgrade(c: &mut Criterion) {
    let mut group = c.benchmark_group("upgrade/run");
    group.sample_size(10);

    for page_size in [50usize, 500] {
        group.bench_with_input(
            BenchmarkId::new("page_size", page_size),
            &page_size,
            |b, &page_size| {
                b.iter_batched(
                    || TestContext::with_pending_upgrade(Scale::Small),
                    |ctx| {
                        let result = ctx
                            .db
                            .run(&Upgrade::new("activity").page_size(page_size))
                            .unwrap();
                        assert!(result.complete);
                        ctx
                    },
                    BatchSize::PerIteration,
                );
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_upgrade);
criterion_main!(benches);
