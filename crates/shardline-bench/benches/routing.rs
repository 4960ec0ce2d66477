//! Shard routing benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use shardline_bench::fixtures::generate_keys;
use shardline_bench::TestContext;
use shardline_core::locator::shard_for;
use shardline_core::{row, EntityRef};

fn bench_shard_for(c: &mut Criterion) {
    let mut group = c.benchmark_group("routing/shard_for");
    let keys = generate_keys(1_000);

    for shards in [1u64, 4, 64] {
        group.bench_with_input(BenchmarkId::new("mixed", shards), &shards, |b, &shards| {
            b.iter(|| {
                for key in &keys {
                    black_box(shard_for(black_box(key), shards));
                }
            });
        });
    }

    group.finish();
}

fn bench_writable_buckets(c: &mut Criterion) {
    let mut group = c.benchmark_group("routing/get_buckets");

    for shards in [1u64, 4] {
        let ctx = TestContext::with_shards(shards);
        let activity = EntityRef::class("Activity");
        // assign every shard up front
        for id in 0..shards as i64 {
            ctx.db
                .locator()
                .get_buckets(&activity, &row! { "id" => id }, true, false)
                .unwrap();
        }

        group.bench_with_input(BenchmarkId::new("writable", shards), &shards, |b, _| {
            let mut id = 0i64;
            b.iter(|| {
                id += 1;
                ctx.db
                    .locator()
                    .get_buckets(&activity, black_box(&row! { "id" => id }), true, false)
                    .unwrap()
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_shard_for, bench_writable_buckets);
criterion_main!(benches);
