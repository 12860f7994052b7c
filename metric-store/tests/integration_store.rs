//! Integration tests for the full store lifecycle.
//!
//! These tests drive the public API only: opening a store, writing batches,
//! querying them back, running retention passes and reopening from disk.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use metric_store::clock::MockClock;
use metric_store::config::StoreConfig;
use metric_store::disk::FixedDiskProbe;
use metric_store::error::{MetricStoreError, QueryError, StoreError};
use metric_store::metrics::{self, MemoryRegistrar};
use metric_store::point::{Batch, Point};
use metric_store::query::{LabelMatcher, MatchOp};
use metric_store::store::{Store, WriteSummary, align_down};
use tempfile::tempdir;

const HOUR: i64 = 3_600_000;
const DAY: i64 = 24 * HOUR;
const NOW: i64 = 1_700_000_000_000;

struct Harness {
    store: Store,
    clock: Arc<MockClock>,
    disk: Arc<FixedDiskProbe>,
    metrics: Arc<MemoryRegistrar>,
}

fn config() -> StoreConfig {
    StoreConfig::default()
        .with_retention_days(1)
        .with_rotation_age(Duration::from_secs(3600))
        .with_rotation_size(1 << 30)
        .with_min_disk_free_ratio(0.2)
}

fn open(path: &Path, config: StoreConfig) -> Harness {
    let clock = Arc::new(MockClock::new(NOW));
    let disk = Arc::new(FixedDiskProbe::new(u64::MAX));
    let metrics = Arc::new(MemoryRegistrar::new());
    let store = Store::open_with(
        path,
        config,
        metrics.clone(),
        clock.clone(),
        Box::new(disk.clone()),
    )
    .unwrap();
    Harness {
        store,
        clock,
        disk,
        metrics,
    }
}

fn tenant(id: &str) -> Vec<LabelMatcher> {
    vec![LabelMatcher::equal("source_id", id)]
}

#[test]
fn test_full_store_lifecycle() {
    let dir = tempdir().unwrap();
    let h = open(dir.path(), config());

    let batch = Batch::new(vec![
        Point::new("app-1", "cpu", NOW - 3000, 0.25).with_label("env", "prod"),
        Point::new("app-1", "cpu", NOW - 2000, 0.5).with_label("env", "staging"),
        Point::new("app-1", "cpu", NOW - 1000, 0.75).with_label("env", "prod"),
    ]);
    let summary = h.store.write(&batch).unwrap();
    assert_eq!(summary.written, 3);
    assert_eq!(summary.dropped(), 0);

    let prod = h
        .store
        .query(
            NOW - 60_000,
            NOW,
            &[
                LabelMatcher::equal("source_id", "app-1"),
                LabelMatcher::equal("env", "prod"),
            ],
        )
        .unwrap();
    assert_eq!(prod.len(), 1);
    let values: Vec<f64> = prod.series[0].samples.iter().map(|s| s.value).collect();
    assert_eq!(values, vec![0.25, 0.75]);

    let all = h.store.query(NOW - 60_000, NOW, &tenant("app-1")).unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all.sample_count(), 3);

    let stats = h.store.stats();
    assert_eq!(stats.shard_count, 1);
    assert_eq!(stats.series_count, 2);
    assert_eq!(stats.measurement_count, 1);
    assert_eq!(stats.point_count, 3);
    assert_eq!(h.metrics.get(metrics::WRITTEN_POINTS_TOTAL), 3.0);
}

#[test]
fn test_tenants_are_isolated_and_unioned_explicitly() {
    let dir = tempdir().unwrap();
    let h = open(dir.path(), config());

    let batch: Batch = ["app-1", "app-2", "app-3"]
        .iter()
        .map(|id| Point::new(*id, "requests", NOW - 10, 1.0))
        .collect();
    h.store.write(&batch).unwrap();

    let one = h.store.query(NOW - 100, NOW, &tenant("app-2")).unwrap();
    assert_eq!(one.len(), 1);
    assert_eq!(one.series[0].key.source_id(), "app-2");

    let two = h
        .store
        .query(
            NOW - 100,
            NOW,
            &[LabelMatcher::new("source_id", MatchOp::Regex, "app-1|app-3").unwrap()],
        )
        .unwrap();
    let ids: Vec<&str> = two.iter().map(|s| s.key.source_id()).collect();
    assert_eq!(ids, vec!["app-1", "app-3"]);
}

#[test]
fn test_shard_ranges_never_overlap() {
    let dir = tempdir().unwrap();
    let h = open(dir.path(), config());

    // Out-of-order timestamps spanning several windows in one batch, then
    // a second batch that lands back in the newest window.
    let base = align_down(NOW - 6 * HOUR, HOUR);
    let batch: Batch = [5, 0, 3, 1, 4]
        .iter()
        .map(|h| Point::new("app-1", "cpu", base + h * HOUR + 11, 1.0))
        .collect();
    assert_eq!(h.store.write(&batch).unwrap().written, 5);
    h.store
        .write(&Batch::new(vec![Point::new("app-1", "cpu", base + 5 * HOUR + 12, 2.0)]))
        .unwrap();

    let snapshot = h.store.snapshot();
    for pair in snapshot.shards().windows(2) {
        assert!(pair[0].end() <= pair[1].start());
        assert!(pair[0].id() < pair[1].id());
    }
    let active: Vec<_> = snapshot.shards().iter().filter(|s| s.is_active()).collect();
    assert_eq!(active.len(), 1);

    let all = h.store.query(base, base + 6 * HOUR, &tenant("app-1")).unwrap();
    assert_eq!(all.sample_count(), 6);
}

#[test]
fn test_query_validation_errors() {
    let dir = tempdir().unwrap();
    let h = open(dir.path(), config());

    let err = h.store.query(NOW, NOW, &tenant("a")).unwrap_err();
    assert!(matches!(err, QueryError::InvalidTimeRange { .. }));

    let err = h.store.query(NOW - 1, NOW, &[]).unwrap_err();
    assert!(matches!(err, QueryError::NoMatchers));

    let err = LabelMatcher::new("env", MatchOp::Regex, "(").unwrap_err();
    assert!(matches!(err, QueryError::InvalidRegex { .. }));
}

#[test]
fn test_retention_by_age() {
    let dir = tempdir().unwrap();
    let h = open(dir.path(), config());

    let base = align_down(NOW - 3 * HOUR, HOUR);
    for hour in 0..3 {
        h.store
            .write(&Batch::new(vec![Point::new("app-1", "cpu", base + hour * HOUR, 1.0)]))
            .unwrap();
    }
    assert_eq!(h.store.snapshot().len(), 3);

    // Nothing is old enough yet.
    assert_eq!(h.store.enforce_retention().expired, 0);

    h.clock.advance(Duration::from_millis(u64::try_from(DAY).unwrap()));
    let report = h.store.enforce_retention();
    assert_eq!(report.expired, 3);
    assert!(h.store.snapshot().is_empty());
    assert_eq!(h.metrics.get(metrics::EXPIRED_SHARDS_TOTAL), 3.0);

    // The store keeps accepting data after everything expired.
    let now = NOW + DAY;
    let summary = h
        .store
        .write(&Batch::new(vec![Point::new("app-1", "cpu", now, 1.0)]))
        .unwrap();
    assert_eq!(summary.written, 1);
    assert_eq!(h.store.snapshot().len(), 1);
}

#[test]
fn test_disk_pressure_never_prunes_active_shard() {
    let dir = tempdir().unwrap();
    let h = open(dir.path(), config());

    let base = align_down(NOW - 3 * HOUR, HOUR);
    for hour in 0..3 {
        h.store
            .write(&Batch::new(vec![Point::new("app-1", "cpu", base + hour * HOUR, 1.0)]))
            .unwrap();
    }
    let active_id = h.store.snapshot().active().unwrap().id();

    // A volume that is permanently full: pruning runs out of candidates.
    h.disk.set_capacity(1);
    let report = h.store.enforce_retention();
    assert_eq!(report.pruned, 2);
    assert_eq!(report.free_ratio, Some(0.0));

    let snapshot = h.store.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot.active().unwrap().id(), active_id);

    // A second pass finds nothing left to prune.
    assert_eq!(h.store.enforce_retention().pruned, 0);
}

#[test]
fn test_query_snapshot_survives_eviction() {
    let dir = tempdir().unwrap();
    let h = open(dir.path(), config());

    let base = align_down(NOW - 2 * HOUR, HOUR);
    h.store
        .write(&Batch::new(vec![
            Point::new("app-1", "cpu", base, 1.0),
            Point::new("app-1", "cpu", base + HOUR, 2.0),
        ]))
        .unwrap();

    let before = h.store.snapshot();
    h.disk.set_capacity(1);
    h.store.enforce_retention();

    // The old snapshot still holds the evicted shard and can read from it.
    assert_eq!(before.len(), 2);
    let oldest = &before.shards()[0];
    let part = oldest.read(base, base + HOUR, &tenant("app-1")).unwrap();
    assert_eq!(part.len(), 1);

    // New queries no longer see it.
    drop(before);
    let after = h.store.query(base, base + 2 * HOUR, &tenant("app-1")).unwrap();
    assert_eq!(after.sample_count(), 1);
}

#[test]
fn test_reopen_restores_all_shards() {
    let dir = tempdir().unwrap();
    let base = align_down(NOW - 3 * HOUR, HOUR);
    {
        let h = open(dir.path(), config());
        for hour in 0..3 {
            h.store
                .write(&Batch::new(vec![
                    Point::new("app-1", "cpu", base + hour * HOUR, 1.0).with_label("core", "0"),
                ]))
                .unwrap();
        }
    }

    let h = open(dir.path(), config());
    let snapshot = h.store.snapshot();
    assert_eq!(snapshot.len(), 3);
    assert_eq!(snapshot.shards().iter().filter(|s| s.is_active()).count(), 1);

    let result = h.store.query(base, base + 3 * HOUR, &tenant("app-1")).unwrap();
    assert_eq!(result.len(), 1);
    assert_eq!(result.sample_count(), 3);
    assert_eq!(result.series[0].key.label("core"), "0");
}

#[test]
fn test_torn_tail_is_discarded_on_reopen() {
    let dir = tempdir().unwrap();
    let segment = {
        let h = open(dir.path(), config());
        h.store
            .write(&Batch::new(vec![Point::new("app-1", "cpu", NOW - 5, 1.0)]))
            .unwrap();
        h.store.snapshot().active().unwrap().dir().join("points.seg")
    };

    // Simulate a crash halfway through appending a record.
    let mut file = OpenOptions::new().append(true).open(&segment).unwrap();
    file.write_all(&200u32.to_le_bytes()).unwrap();
    file.write_all(b"partial").unwrap();
    drop(file);

    {
        let h = open(dir.path(), config());
        let result = h.store.query(NOW - 60, NOW, &tenant("app-1")).unwrap();
        assert_eq!(result.sample_count(), 1);

        h.store
            .write(&Batch::new(vec![Point::new("app-1", "cpu", NOW - 4, 2.0)]))
            .unwrap();
    }

    // The record appended after the truncation is readable on the next open.
    let h = open(dir.path(), config());
    let result = h.store.query(NOW - 60, NOW, &tenant("app-1")).unwrap();
    assert_eq!(result.sample_count(), 2);
}

#[test]
fn test_open_rejects_bad_metadata_and_config() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("meta.json"), "{ not json").unwrap();
    let err = Store::open_with(
        dir.path(),
        config(),
        Arc::new(MemoryRegistrar::new()),
        Arc::new(MockClock::new(NOW)),
        Box::new(FixedDiskProbe::new(u64::MAX)),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        MetricStoreError::Store(StoreError::CorruptedMetadata { .. })
    ));

    let other = tempdir().unwrap();
    let err = Store::open_with(
        other.path(),
        config().with_rotation_size(0),
        Arc::new(MemoryRegistrar::new()),
        Arc::new(MockClock::new(NOW)),
        Box::new(FixedDiskProbe::new(u64::MAX)),
    )
    .unwrap_err();
    assert!(matches!(err, MetricStoreError::Config(_)));
}

#[test]
fn test_concurrent_writers_across_rotations() {
    let dir = tempdir().unwrap();
    let h = open(dir.path(), config().with_rotation_size(512));
    let sources = ["app-1", "app-2", "app-3", "app-4"];

    let summaries: Vec<(&str, WriteSummary)> = thread::scope(|scope| {
        let handles: Vec<_> = sources
            .iter()
            .map(|&source| {
                let store = &h.store;
                scope.spawn(move || {
                    let mut total = WriteSummary::default();
                    for round in 0..50 {
                        let batch: Batch = (0..5)
                            .map(|j| Point::new(source, "cpu", NOW - 10_000 + round * 10 + j, 1.0))
                            .collect();
                        let summary = store.write(&batch).unwrap();
                        total.written += summary.written;
                        total.late += summary.late;
                        total.out_of_range += summary.out_of_range;
                        total.expired += summary.expired;
                        total.invalid += summary.invalid;
                    }
                    (source, total)
                })
            })
            .collect();
        handles.into_iter().map(|handle| handle.join().unwrap()).collect()
    });

    let mut written = 0;
    for (source, summary) in &summaries {
        assert_eq!(summary.written + summary.dropped(), 250, "{source}");
        let stored = h
            .store
            .query(NOW - HOUR, NOW, &tenant(source))
            .unwrap()
            .sample_count();
        assert_eq!(stored, summary.written, "{source}");
        written += summary.written;
    }
    assert!(written > 0);
    assert_eq!(h.metrics.get(metrics::WRITTEN_POINTS_TOTAL), written as f64);

    let snapshot = h.store.snapshot();
    assert!(snapshot.len() > 1, "size threshold never rotated");
    for pair in snapshot.shards().windows(2) {
        assert!(pair[0].end() <= pair[1].start());
        assert!(!pair[0].is_active());
    }
}
