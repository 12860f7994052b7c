//! Health metrics emitted by the store and ingest path.
//!
//! The store never talks to a metrics backend directly. It reports through a
//! [`MetricsRegistrar`], which the embedding process wires to whatever
//! exporter it uses. [`MemoryRegistrar`] keeps values in memory and is what
//! the CLI's `info` output and the tests read from.

use std::collections::BTreeMap;

use parking_lot::Mutex;

/// Fraction of the data volume that is still free.
pub const DISK_FREE_RATIO: &str = "metric_store_disk_free_ratio";
/// Points accepted into a shard.
pub const WRITTEN_POINTS_TOTAL: &str = "metric_store_written_points_total";
/// Points rejected as expired, late or out of range.
pub const DROPPED_POINTS_TOTAL: &str = "metric_store_dropped_points_total";
/// Batches that failed to persist.
pub const WRITE_ERRORS_TOTAL: &str = "metric_store_write_errors_total";
/// Shards removed because they aged past retention.
pub const EXPIRED_SHARDS_TOTAL: &str = "metric_store_expired_shards_total";
/// Shards removed to relieve disk pressure.
pub const PRUNED_SHARDS_TOTAL: &str = "metric_store_pruned_shards_total";
/// Days between the oldest retained shard and now.
pub const STORAGE_DAYS: &str = "metric_store_storage_days";
/// Bytes held by all shard segments.
pub const INDEX_SIZE_BYTES: &str = "metric_store_index_size_bytes";
/// Distinct series across all shards.
pub const SERIES_COUNT: &str = "metric_store_series_count";
/// Distinct metric names across all shards.
pub const MEASUREMENTS_COUNT: &str = "metric_store_measurements_count";
/// Queries that failed while reading a shard.
pub const READ_ERRORS_TOTAL: &str = "metric_store_read_errors_total";
/// Points received over the ingestion transport, counted per decoded frame.
pub const INGRESS_ENVELOPES_TOTAL: &str = "metric_store_nozzle_ingress_envelopes_total";
/// Frames dropped because they failed to decode.
pub const DROPPED_ENVELOPES_TOTAL: &str = "metric_store_nozzle_dropped_envelopes_total";

/// Sink for gauges and counters.
///
/// Implementations must be cheap and must not block for long: they are
/// called from the write path.
pub trait MetricsRegistrar: Send + Sync {
    /// Sets a gauge.
    fn set(&self, name: &str, value: f64);

    /// Adds `delta` to a counter.
    fn add(&self, name: &str, delta: f64);

    /// Adds one to a counter.
    fn inc(&self, name: &str) {
        self.add(name, 1.0);
    }
}

/// Registrar that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRegistrar;

impl MetricsRegistrar for NoopRegistrar {
    fn set(&self, _name: &str, _value: f64) {}

    fn add(&self, _name: &str, _delta: f64) {}
}

/// Registrar that keeps the latest value of every metric in memory.
#[derive(Debug, Default)]
pub struct MemoryRegistrar {
    values: Mutex<BTreeMap<String, f64>>,
}

impl MemoryRegistrar {
    /// Creates an empty registrar.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of `name`, or `0.0` if it was never reported.
    pub fn get(&self, name: &str) -> f64 {
        self.values.lock().get(name).copied().unwrap_or(0.0)
    }

    /// Copy of every reported metric.
    pub fn snapshot(&self) -> BTreeMap<String, f64> {
        self.values.lock().clone()
    }
}

impl MetricsRegistrar for MemoryRegistrar {
    fn set(&self, name: &str, value: f64) {
        self.values.lock().insert(name.to_string(), value);
    }

    fn add(&self, name: &str, delta: f64) {
        *self.values.lock().entry(name.to_string()).or_insert(0.0) += delta;
    }
}
