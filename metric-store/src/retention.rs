//! Retention: age-based expiry, disk-pressure pruning and store gauges.
//!
//! [`Store::enforce_retention`] runs one pass. [`RetentionWorker`] runs it on
//! a background thread at the configured interval until stopped.
//!
//! One pass, in order:
//! 1. retry directory removals that failed earlier;
//! 2. expire every shard created more than the retention age ago;
//! 3. rotate the active shard if it has been open for the rotation age;
//! 4. while free disk space is under the configured ratio, prune the oldest
//!    frozen shard (the active shard is never pruned);
//! 5. publish disk, storage and index gauges.

use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::Serialize;

use crate::error::StoreError;
use crate::metrics;
use crate::store::Store;

const MS_PER_DAY: f64 = 86_400_000.0;

/// What a retention pass did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetentionReport {
    /// Directory removals retried successfully.
    pub swept: usize,
    /// Whether the active shard was rotated for age.
    pub rotated: bool,
    /// Shards removed for age.
    pub expired: usize,
    /// Shards removed for disk pressure.
    pub pruned: usize,
    /// Free disk ratio after the pass, if it could be measured.
    pub free_ratio: Option<f64>,
}

impl Store {
    /// Runs one retention pass.
    ///
    /// Failures are logged and never abort the pass: a failed rotation still
    /// lets pruning run, and an unreadable disk probe only skips
    /// pruning. A read-only store is left alone.
    pub fn enforce_retention(&self) -> RetentionReport {
        if self.is_read_only() {
            tracing::debug!("skipping retention on read-only store");
            return RetentionReport::default();
        }
        let mut report = RetentionReport {
            swept: self.graveyard().sweep(),
            ..RetentionReport::default()
        };
        let now = self.clock().now_ms();

        report.expired = self.expire(now);

        match self.rotate_if_aged(now) {
            Ok(rotated) => report.rotated = rotated,
            Err(e) => tracing::warn!(error = %e, "age rotation failed"),
        }

        report.pruned = self.prune(&mut report.free_ratio);
        self.publish_gauges(now, report.free_ratio);

        if report.expired > 0 || report.pruned > 0 || report.rotated {
            tracing::info!(
                expired = report.expired,
                pruned = report.pruned,
                rotated = report.rotated,
                "retention pass"
            );
        }
        report
    }

    fn expire(&self, now: i64) -> usize {
        let max_age = self.config().retention_max_age_ms();
        let evicted = self.evict_where(true, |shard| {
            now.saturating_sub(shard.created_at_ms()) >= max_age
        });
        for shard in &evicted {
            tracing::info!(
                shard = shard.id(),
                start = shard.start(),
                created_at_ms = shard.created_at_ms(),
                "expired shard"
            );
            self.metrics().inc(metrics::EXPIRED_SHARDS_TOTAL);
        }
        evicted.len()
    }

    fn prune(&self, free_ratio: &mut Option<f64>) -> usize {
        let min_ratio = self.config().min_disk_free_ratio;
        let mut pruned = 0;
        loop {
            let ratio = match self.disk_free_ratio() {
                Ok(ratio) => ratio,
                Err(e) => {
                    tracing::warn!(error = %e, "disk probe failed, skipping prune");
                    *free_ratio = None;
                    return pruned;
                }
            };
            *free_ratio = Some(ratio);
            if ratio >= min_ratio {
                return pruned;
            }

            let snapshot = self.snapshot();
            let active_id = snapshot.active().map(|s| s.id());
            let Some(oldest) = snapshot
                .shards()
                .iter()
                .find(|s| Some(s.id()) != active_id)
                .map(|s| s.id())
            else {
                tracing::warn!(
                    free_ratio = ratio,
                    min_ratio,
                    "disk pressure but only the active shard remains"
                );
                return pruned;
            };
            drop(snapshot);

            for shard in self.evict_where(false, |s| s.id() == oldest) {
                tracing::info!(
                    shard = shard.id(),
                    bytes = shard.byte_size(),
                    free_ratio = ratio,
                    "pruned shard for disk pressure"
                );
                self.metrics().inc(metrics::PRUNED_SHARDS_TOTAL);
                pruned += 1;
            }
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn publish_gauges(&self, now: i64, free_ratio: Option<f64>) {
        let stats = self.stats();
        let registrar = self.metrics();
        if let Some(ratio) = free_ratio {
            registrar.set(metrics::DISK_FREE_RATIO, ratio);
        }
        let days = stats
            .oldest_start
            .map_or(0.0, |start| now.saturating_sub(start).max(0) as f64 / MS_PER_DAY);
        registrar.set(metrics::STORAGE_DAYS, days);
        registrar.set(metrics::INDEX_SIZE_BYTES, stats.byte_size as f64);
        registrar.set(metrics::SERIES_COUNT, stats.series_count as f64);
        registrar.set(metrics::MEASUREMENTS_COUNT, stats.measurement_count as f64);
    }
}

/// Runs retention passes on a background thread.
///
/// Dropping the worker stops it and waits for an in-flight pass to finish.
#[derive(Debug)]
pub struct RetentionWorker {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl RetentionWorker {
    /// Starts the worker. The first pass runs immediately.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::WorkerSpawn`] if the thread cannot be started.
    pub fn spawn(store: Arc<Store>, interval: Duration) -> Result<Self, StoreError> {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("retention".to_string())
            .spawn(move || {
                tracing::debug!(interval_ms = interval.as_millis(), "retention worker started");
                loop {
                    store.enforce_retention();
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                tracing::debug!("retention worker stopped");
            })
            .map_err(StoreError::WorkerSpawn)?;

        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    /// Stops the worker and waits for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::error!("retention worker panicked");
        }
    }
}

impl Drop for RetentionWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
