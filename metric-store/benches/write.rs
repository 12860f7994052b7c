//! Benchmarks for the store write and query paths.
//!
//! Run with: `cargo bench -p metric-store -- write`

#![allow(missing_docs, clippy::cast_precision_loss, clippy::cast_possible_wrap)]

use std::sync::Arc;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use metric_store::clock::{Clock, SystemClock};
use metric_store::config::StoreConfig;
use metric_store::metrics::NoopRegistrar;
use metric_store::point::{Batch, Point};
use metric_store::query::LabelMatcher;
use metric_store::store::Store;
use tempfile::tempdir;

fn setup_store() -> (Store, tempfile::TempDir) {
    let temp_dir = tempdir().unwrap();
    let config = StoreConfig::default()
        .with_rotation_age(Duration::from_secs(3600))
        .with_rotation_size(1 << 30);
    let store = Store::open(temp_dir.path().join("bench_store"), config, Arc::new(NoopRegistrar))
        .unwrap();
    (store, temp_dir)
}

fn batch_at(ts: i64, series: usize) -> Batch {
    (0..series)
        .map(|i| {
            Point::new(format!("app-{}", i % 8), "cpu", ts, i as f64)
                .with_label("core", i.to_string())
        })
        .collect()
}

fn bench_write_batch(c: &mut Criterion) {
    let mut group = c.benchmark_group("write/batch_size");

    for size in [1, 30, 1000] {
        let (store, _dir) = setup_store();
        let mut ts = SystemClock.now_ms() - 1_000_000;

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                ts += 1;
                store.write(black_box(&batch_at(ts, size))).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_query(c: &mut Criterion) {
    let (store, _dir) = setup_store();
    let start = SystemClock.now_ms() - 600_000;
    for i in 0..600 {
        store.write(&batch_at(start + i * 1000, 64)).unwrap();
    }
    let matchers = [LabelMatcher::equal("source_id", "app-3")];

    c.bench_function("query/one_tenant_10m", |b| {
        b.iter(|| {
            let result = store
                .query(black_box(start), black_box(start + 600_000), &matchers)
                .unwrap();
            black_box(result.sample_count())
        });
    });
}

criterion_group!(benches, bench_write_batch, bench_query);
criterion_main!(benches);
