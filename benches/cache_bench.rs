//! Benchmarks for the sharded answer cache.
//!
//! Measures lookups against a warm cache and writes that keep rotating
//! shards.

use criterion::{black_box, BenchmarkId, Criterion, Throughput};
use rand::Rng;
use std::time::Duration;

use dnsoverride::cache::{ShardCache, SHARD_CAPACITY};

const KEYS: usize = SHARD_CAPACITY * 8;

fn keys() -> Vec<String> {
    (0..KEYS).map(|i| format!("host{i}.example.com.")).collect()
}

fn bench_get(c: &mut Criterion) {
    let keys = keys();
    let cache = ShardCache::new(Some(Duration::from_secs(3600)));
    for (i, key) in keys.iter().enumerate() {
        cache.set(key.as_str(), i);
    }

    let mut group = c.benchmark_group("cache");
    group.throughput(Throughput::Elements(1));

    // Newest shard
    group.bench_function(BenchmarkId::new("get", "head_hit"), |b| {
        let key = &keys[KEYS - 1];
        b.iter(|| cache.get(black_box(key)))
    });

    // Has to walk the whole chain
    group.bench_function(BenchmarkId::new("get", "tail_hit"), |b| {
        let key = &keys[0];
        b.iter(|| cache.get(black_box(key)))
    });

    group.bench_function(BenchmarkId::new("get", "miss"), |b| {
        b.iter(|| cache.get(black_box("absent.example.com.")))
    });

    group.bench_function(BenchmarkId::new("get", "random_hit"), |b| {
        let mut rng = rand::rng();
        b.iter(|| cache.get(black_box(&keys[rng.random_range(0..KEYS)])))
    });

    group.finish();
}

fn bench_set(c: &mut Criterion) {
    let keys = keys();

    let mut group = c.benchmark_group("cache");
    group.throughput(Throughput::Elements(1));

    group.bench_function(BenchmarkId::new("set", "no_expiration"), |b| {
        let cache = ShardCache::new(None);
        let mut i = 0;
        b.iter(|| {
            cache.set(keys[i % KEYS].as_str(), i);
            i += 1;
        })
    });

    group.bench_function(BenchmarkId::new("set", "rotating"), |b| {
        let cache = ShardCache::new(Some(Duration::from_millis(10))).with_shard_capacity(64);
        let mut i = 0;
        b.iter(|| {
            cache.set(keys[i % KEYS].as_str(), i);
            i += 1;
        })
    });

    group.finish();
}

fn main() {
    let mut criterion = Criterion::default().configure_from_args();
    bench_get(&mut criterion);
    bench_set(&mut criterion);
    criterion.final_summary();
}
