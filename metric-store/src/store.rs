//! Store lifecycle, write routing and range queries.
//!
//! The [`Store`] is the top-level handle. It:
//! - manages the store directory with `meta.json` and one directory per shard;
//! - routes incoming points to the active shard, rotating it by time window
//!   or size;
//! - answers range + matcher queries against a consistent snapshot of the
//!   shard index;
//! - exposes the hooks the retention loop ([`crate::retention`]) drives.
//!
//! # Directory Layout
//!
//! ```text
//! data_dir/
//! ├── meta.json            <- store metadata (format version, creation time)
//! └── shards/
//!     ├── 000000000001/    <- frozen shard
//!     └── 000000000002/    <- active shard
//! ```
//!
//! # Concurrency
//!
//! The shard list is an immutable [`ShardIndex`] behind an [`ArcSwap`].
//! Queries load the current snapshot once and never see shards created
//! after they started; shards evicted while a query runs stay readable
//! until the query drops its snapshot. Writers are serialized by a mutex
//! that rotation also takes, so no write can land in a shard that is being
//! frozen. Eviction swaps the index with `rcu` and never blocks on writers.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use metric_store::config::StoreConfig;
//! use metric_store::metrics::NoopRegistrar;
//! use metric_store::point::{Batch, Point};
//! use metric_store::query::LabelMatcher;
//! use metric_store::store::Store;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Store::open("./metrics", StoreConfig::default(), Arc::new(NoopRegistrar))?;
//!
//! let now = 1_700_000_000_000;
//! store.write(&Batch::new(vec![Point::new("app-1", "cpu", now, 0.5)]))?;
//!
//! let result = store.query(now - 60_000, now + 1, &[LabelMatcher::equal("source_id", "app-1")])?;
//! assert_eq!(result.sample_count(), 1);
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::ast::{Expr, Selector};
use crate::clock::{Clock, SystemClock};
use crate::codec;
use crate::config::StoreConfig;
use crate::disk::{self, DiskProbe};
use crate::error::{QueryError, Result, StoreError, WriteError};
use crate::metrics::{self, MetricsRegistrar};
use crate::point::{Batch, METRIC_NAME_LABEL, Point};
use crate::query::{LabelMatcher, Sample, Series, SeriesSet};
use crate::series::SeriesKey;
use crate::shard::{Graveyard, Shard, ShardStats};

/// Current store metadata format version.
const METADATA_VERSION: u32 = 1;

/// Name of the metadata file in the store directory.
const METADATA_FILE: &str = "meta.json";

/// Name of the directory holding shard directories.
const SHARDS_DIR: &str = "shards";

/// Metadata stored in the store's meta.json file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoreMetadata {
    /// Metadata format version.
    version: u32,
    /// When the store was first created, epoch milliseconds.
    created_at_ms: i64,
}

/// Immutable, ordered view of the store's shards.
///
/// Shards are sorted by start time with non-overlapping ranges. If the last
/// shard is active it is the only one accepting writes.
#[derive(Debug, Default)]
pub struct ShardIndex {
    shards: Vec<Arc<Shard>>,
}

impl ShardIndex {
    /// All shards, oldest first.
    pub fn shards(&self) -> &[Arc<Shard>] {
        &self.shards
    }

    /// The shard accepting writes, if any.
    pub fn active(&self) -> Option<&Arc<Shard>> {
        self.shards.last().filter(|s| s.is_active())
    }

    /// The oldest shard.
    pub fn oldest(&self) -> Option<&Arc<Shard>> {
        self.shards.first()
    }

    /// The shard whose range contains `ts`.
    pub fn containing(&self, ts: i64) -> Option<&Arc<Shard>> {
        self.shards.iter().find(|s| s.contains(ts))
    }

    /// Total segment bytes across all shards.
    pub fn byte_size(&self) -> u64 {
        self.shards.iter().map(|s| s.byte_size()).sum()
    }

    /// Number of shards.
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    /// Whether the store holds no shards.
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    fn with(&self, shard: Arc<Shard>) -> Self {
        let mut shards = self.shards.clone();
        shards.push(shard);
        Self { shards }
    }
}

/// Per-batch write accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteSummary {
    /// Points persisted.
    pub written: usize,
    /// Points older than the retention window.
    pub expired: usize,
    /// Points that belonged to an already frozen shard.
    pub late: usize,
    /// Points before the oldest shard or past the acceptance ceiling.
    pub out_of_range: usize,
    /// Points too large for the segment format.
    pub invalid: usize,
}

impl WriteSummary {
    /// Points rejected for any reason.
    pub fn dropped(&self) -> usize {
        self.expired + self.late + self.out_of_range + self.invalid
    }
}

/// Timestamps a write accepts: `[cutoff, ceiling)`.
#[derive(Debug, Clone, Copy)]
struct AcceptWindow {
    cutoff: i64,
    ceiling: i64,
}

/// Store-wide statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreStats {
    /// Number of shards.
    pub shard_count: usize,
    /// Distinct series across all shards.
    pub series_count: usize,
    /// Distinct metric names across all shards.
    pub measurement_count: usize,
    /// Points across all shards.
    pub point_count: u64,
    /// Segment bytes across all shards.
    pub byte_size: u64,
    /// Approximate in-memory index footprint.
    pub index_memory_bytes: usize,
    /// Start of the oldest shard.
    pub oldest_start: Option<i64>,
    /// Per-shard detail, oldest first.
    pub shards: Vec<ShardStats>,
}

struct WriterState {
    next_shard_id: u64,
}

/// How a store directory is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenMode {
    ReadWrite,
    /// Nothing on disk is created, truncated, frozen or removed.
    ReadOnly,
}

/// A multi-tenant, time-sharded metric store.
pub struct Store {
    path: PathBuf,
    shards_dir: PathBuf,
    config: StoreConfig,
    index: ArcSwap<ShardIndex>,
    writer: Mutex<WriterState>,
    graveyard: Arc<Graveyard>,
    metrics: Arc<dyn MetricsRegistrar>,
    clock: Arc<dyn Clock>,
    disk: Box<dyn DiskProbe>,
    mode: OpenMode,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .field("config", &self.config)
            .field("shards", &self.index.load().len())
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Opens an existing store or creates a new one at the given path.
    ///
    /// Uses the system clock and the platform's free-space probe.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the directory cannot
    /// be created or read, or existing metadata or shards are corrupted.
    pub fn open<P: AsRef<Path>>(
        path: P,
        config: StoreConfig,
        metrics: Arc<dyn MetricsRegistrar>,
    ) -> Result<Self> {
        Self::open_with(
            path,
            config,
            metrics,
            Arc::new(SystemClock),
            disk::default_probe(),
        )
    }

    /// Opens a store with an explicit clock and disk probe.
    ///
    /// When opening an existing store:
    /// - `meta.json` must carry a supported version;
    /// - every shard directory is reopened, active shards replaying their
    ///   segments;
    /// - an active shard that is not the newest (a crash between creating a
    ///   new shard and freezing the old one) is frozen at its successor's start;
    /// - shard ranges must not overlap.
    ///
    /// # Errors
    ///
    /// See [`Store::open`].
    pub fn open_with<P: AsRef<Path>>(
        path: P,
        config: StoreConfig,
        metrics: Arc<dyn MetricsRegistrar>,
        clock: Arc<dyn Clock>,
        disk: Box<dyn DiskProbe>,
    ) -> Result<Self> {
        config.validate()?;

        let path = path.as_ref().to_path_buf();
        let shards_dir = path.join(SHARDS_DIR);
        fs::create_dir_all(&shards_dir).map_err(|e| StoreError::DirectoryAccess {
            path: shards_dir.display().to_string(),
            source: e,
        })?;

        let metadata_path = path.join(METADATA_FILE);
        if metadata_path.exists() {
            read_metadata(&metadata_path)?;
        } else {
            write_metadata(
                &metadata_path,
                &StoreMetadata {
                    version: METADATA_VERSION,
                    created_at_ms: clock.now_ms(),
                },
            )?;
        }

        let graveyard = Arc::new(Graveyard::default());
        let shards = load_shards(&shards_dir, &graveyard, OpenMode::ReadWrite)?;

        tracing::info!(
            path = %path.display(),
            shards = shards.len(),
            "opened store"
        );

        Ok(Self::assemble(
            path,
            config,
            shards,
            graveyard,
            (metrics, clock, disk),
            OpenMode::ReadWrite,
        ))
    }

    /// Opens an existing store for inspection while another process may be
    /// writing to it.
    ///
    /// Nothing on disk changes: no directory or metadata is created, torn
    /// segment tails are skipped instead of truncated, an interrupted
    /// rotation is resolved in memory only, and incomplete shard directories
    /// are ignored. Writes fail with [`WriteError::ReadOnly`] and retention
    /// passes do nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if `meta.json` is missing or invalid, or a shard
    /// cannot be read.
    pub fn open_read_only<P: AsRef<Path>>(
        path: P,
        metrics: Arc<dyn MetricsRegistrar>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        read_metadata(&path.join(METADATA_FILE))?;

        let graveyard = Arc::new(Graveyard::default());
        let shards = load_shards(&path.join(SHARDS_DIR), &graveyard, OpenMode::ReadOnly)?;

        tracing::info!(
            path = %path.display(),
            shards = shards.len(),
            "opened store read-only"
        );

        Ok(Self::assemble(
            path,
            StoreConfig::default(),
            shards,
            graveyard,
            (metrics, Arc::new(SystemClock), disk::default_probe()),
            OpenMode::ReadOnly,
        ))
    }

    fn assemble(
        path: PathBuf,
        config: StoreConfig,
        shards: Vec<Arc<Shard>>,
        graveyard: Arc<Graveyard>,
        (metrics, clock, disk): (Arc<dyn MetricsRegistrar>, Arc<dyn Clock>, Box<dyn DiskProbe>),
        mode: OpenMode,
    ) -> Self {
        let next_shard_id = shards.iter().map(|s| s.id()).max().map_or(1, |id| id + 1);
        Self {
            shards_dir: path.join(SHARDS_DIR),
            path,
            config,
            index: ArcSwap::from_pointee(ShardIndex { shards }),
            writer: Mutex::new(WriterState { next_shard_id }),
            graveyard,
            metrics,
            clock,
            disk,
            mode,
        }
    }

    /// Whether the store was opened with [`Store::open_read_only`].
    pub fn is_read_only(&self) -> bool {
        self.mode == OpenMode::ReadOnly
    }

    /// Writes a batch, routing each point to its shard.
    ///
    /// Points are processed in timestamp order. Each point is either
    /// persisted or dropped and counted:
    /// - too large for the segment format: dropped as invalid;
    /// - older than the retention window: dropped as expired;
    /// - at or past `now` plus one rotation window: dropped as out of range,
    ///   so a single far-future point cannot move the active window forward;
    /// - at or past the active window's end: the active shard is rotated first;
    /// - inside a frozen shard, or before the oldest shard: dropped.
    ///
    /// Accepted points are appended to the shard segment before they become
    /// visible to queries. After the batch the active shard is rotated if it
    /// reached the size threshold.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError::ReadOnly`] on a read-only store,
    /// [`WriteError::Io`] if appending to a segment fails, or
    /// [`WriteError::Rotation`] if a new shard cannot be created. Points
    /// accepted before the failure stay written. Dropped points are never
    /// an error.
    pub fn write(&self, batch: &Batch) -> std::result::Result<WriteSummary, WriteError> {
        if self.is_read_only() {
            return Err(WriteError::ReadOnly);
        }
        let mut summary = WriteSummary::default();
        if batch.is_empty() {
            return Ok(summary);
        }

        let now = self.clock.now_ms();
        let accept = AcceptWindow {
            cutoff: now.saturating_sub(self.config.retention_max_age_ms()),
            ceiling: now.saturating_add(self.config.shard_rotation_max_age_ms()),
        };
        let mut points: Vec<&Point> = Vec::with_capacity(batch.len());
        for point in &batch.points {
            match codec::check_point(point) {
                Ok(()) => points.push(point),
                Err(source) => {
                    summary.invalid += 1;
                    tracing::debug!(
                        reason = %WriteError::Unencodable {
                            timestamp: point.timestamp,
                            source,
                        },
                        "dropped point"
                    );
                }
            }
        }
        points.sort_by_key(|p| p.timestamp);

        let outcome = {
            let mut state = self.writer.lock();
            self.write_sorted(&mut state, &points, accept, &mut summary)
        };

        if summary.written > 0 {
            self.metrics
                .add(metrics::WRITTEN_POINTS_TOTAL, count_f64(summary.written));
        }
        if summary.dropped() > 0 {
            self.metrics
                .add(metrics::DROPPED_POINTS_TOTAL, count_f64(summary.dropped()));
        }
        if let Err(e) = &outcome {
            self.metrics.inc(metrics::WRITE_ERRORS_TOTAL);
            tracing::warn!(error = %e, written = summary.written, "write failed");
        }
        outcome.map(|()| summary)
    }

    fn write_sorted(
        &self,
        state: &mut WriterState,
        points: &[&Point],
        accept: AcceptWindow,
        summary: &mut WriteSummary,
    ) -> std::result::Result<(), WriteError> {
        let AcceptWindow { cutoff, ceiling } = accept;
        let window = self.config.shard_rotation_max_age_ms();
        let mut active = self.index.load().active().cloned();
        let mut pending: Vec<Point> = Vec::new();

        for &point in points {
            let ts = point.timestamp;
            if ts < cutoff {
                summary.expired += 1;
                tracing::debug!(
                    reason = %WriteError::Expired { timestamp: ts, cutoff },
                    "dropped point"
                );
                continue;
            }
            // The ceiling is at most i64::MAX, so `ts + 1` never overflows below.
            if ts >= ceiling {
                summary.out_of_range += 1;
                tracing::debug!(
                    reason = %WriteError::TooFarAhead { timestamp: ts, ceiling },
                    "dropped point"
                );
                continue;
            }

            if active.is_none() {
                let floor = self.index.load().shards().last().map_or(i64::MIN, |s| s.end());
                if ts >= floor {
                    let start = align_down(ts, window).max(floor);
                    active = Some(self.create_active(state, start).map_err(rotation_err)?);
                }
            }

            if let Some(shard) = &active
                && ts >= shard.start().saturating_add(window)
            {
                self.append_pending(state, shard, &mut pending, summary)?;
                let floor = shard.max_ts().map_or(i64::MIN, |m| m.saturating_add(1));
                let start = align_down(ts, window).max(floor);
                let next = self.rotate_locked(state, shard, start).map_err(rotation_err)?;
                active = Some(next);
            }

            match &active {
                Some(shard) if ts >= shard.start() => pending.push(point.clone()),
                _ => self.drop_late(ts, summary),
            }
        }

        if let Some(shard) = &active {
            self.append_pending(state, shard, &mut pending, summary)?;

            if shard.byte_size() >= self.config.shard_rotation_size_bytes
                && let Some(boundary) = shard.max_ts().and_then(|m| m.checked_add(1))
            {
                tracing::info!(
                    shard = shard.id(),
                    bytes = shard.byte_size(),
                    "shard reached size threshold"
                );
                self.rotate_locked(state, shard, boundary)
                    .map_err(rotation_err)?;
            }
        }
        Ok(())
    }

    /// Appends `pending` to `shard` and clears it.
    ///
    /// A shard whose segment could not be rolled back after a failed append
    /// is rotated out so later writes land in a fresh segment.
    fn append_pending(
        &self,
        state: &mut WriterState,
        shard: &Arc<Shard>,
        pending: &mut Vec<Point>,
        summary: &mut WriteSummary,
    ) -> std::result::Result<(), WriteError> {
        if let Err(e) = shard.append(pending) {
            if shard.is_poisoned() {
                let boundary = shard
                    .max_ts()
                    .map_or(shard.start(), |m| m.saturating_add(1));
                match self.rotate_locked(state, shard, boundary) {
                    Ok(next) => tracing::warn!(
                        shard = shard.id(),
                        next = next.id(),
                        "retired shard after a failed segment rollback"
                    ),
                    Err(rotation) => tracing::error!(
                        shard = shard.id(),
                        error = %rotation,
                        "could not retire poisoned shard"
                    ),
                }
            }
            return Err(e);
        }
        summary.written += pending.len();
        pending.clear();
        Ok(())
    }

    fn drop_late(&self, ts: i64, summary: &mut WriteSummary) {
        let index = self.index.load();
        let reason = match index.containing(ts) {
            Some(shard) => {
                summary.late += 1;
                WriteError::ShardFrozen {
                    timestamp: ts,
                    shard_id: shard.id(),
                }
            }
            None => {
                summary.out_of_range += 1;
                WriteError::OutOfRange {
                    timestamp: ts,
                    oldest_start: index.oldest().map_or(i64::MIN, |s| s.start()),
                }
            }
        };
        tracing::debug!(%reason, "dropped point");
    }

    fn create_shard(
        &self,
        state: &mut WriterState,
        start: i64,
    ) -> std::result::Result<Arc<Shard>, StoreError> {
        let id = state.next_shard_id;
        let shard = Shard::create(
            &self.shards_dir,
            id,
            start,
            self.clock.now_ms(),
            self.graveyard.clone(),
        )?;
        state.next_shard_id += 1;
        Ok(Arc::new(shard))
    }

    fn create_active(
        &self,
        state: &mut WriterState,
        start: i64,
    ) -> std::result::Result<Arc<Shard>, StoreError> {
        let shard = self.create_shard(state, start)?;
        self.index.rcu(|index| index.with(shard.clone()));
        Ok(shard)
    }

    /// Freezes `current` at `new_start` and publishes a new active shard.
    ///
    /// The new shard is created before anything is frozen, so a failure at
    /// any step leaves the index unchanged.
    fn rotate_locked(
        &self,
        state: &mut WriterState,
        current: &Arc<Shard>,
        new_start: i64,
    ) -> std::result::Result<Arc<Shard>, StoreError> {
        let next = self.create_shard(state, new_start)?;
        if let Err(e) = current.freeze(new_start) {
            next.mark_evicted();
            return Err(e);
        }
        self.index.rcu(|index| index.with(next.clone()));
        tracing::info!(
            frozen = current.id(),
            active = next.id(),
            boundary = new_start,
            "rotated shard"
        );
        Ok(next)
    }

    /// Rotates the active shard if it holds data and has been open for at
    /// least the rotation age. Returns whether a rotation happened.
    pub(crate) fn rotate_if_aged(&self, now: i64) -> std::result::Result<bool, StoreError> {
        let mut state = self.writer.lock();
        let Some(active) = self.index.load().active().cloned() else {
            return Ok(false);
        };
        let age = now.saturating_sub(active.created_at_ms());
        let Some(boundary) = active.max_ts().and_then(|m| m.checked_add(1)) else {
            return Ok(false);
        };
        if age < self.config.shard_rotation_max_age_ms() {
            return Ok(false);
        }
        tracing::info!(shard = active.id(), age_ms = age, "shard reached age threshold");
        self.rotate_locked(&mut state, &active, boundary)?;
        Ok(true)
    }

    /// Removes every shard matching `doomed` from the index.
    ///
    /// When `include_active` is false the active shard is never removed.
    /// Removed shards are marked for deletion; their files go away once the
    /// last reader lets go.
    pub(crate) fn evict_where(
        &self,
        include_active: bool,
        doomed: impl Fn(&Shard) -> bool,
    ) -> Vec<Arc<Shard>> {
        // Writers must not append to an active shard that is being removed.
        let _writer = include_active.then(|| self.writer.lock());

        let mut evicted = Vec::new();
        self.index.rcu(|index| {
            let active_id = index.active().map(|s| s.id());
            let (gone, kept): (Vec<_>, Vec<_>) = index.shards.iter().cloned().partition(|s| {
                (include_active || Some(s.id()) != active_id) && doomed(s.as_ref())
            });
            evicted = gone;
            ShardIndex { shards: kept }
        });
        for shard in &evicted {
            shard.mark_evicted();
        }
        evicted
    }

    /// Queries samples in `[start, end)` for series matching every matcher.
    ///
    /// The result is built from one snapshot of the shard index. Series are
    /// merged across shards and sorted by key; samples are sorted by time.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidTimeRange`] if `start >= end`,
    /// [`QueryError::NoMatchers`] if `matchers` is empty, or
    /// [`QueryError::Io`] if any shard fails to read. No partial result is
    /// returned on error.
    pub fn query(
        &self,
        start: i64,
        end: i64,
        matchers: &[LabelMatcher],
    ) -> std::result::Result<SeriesSet, QueryError> {
        if start >= end {
            return Err(QueryError::InvalidTimeRange { start, end });
        }
        if matchers.is_empty() {
            return Err(QueryError::NoMatchers);
        }

        let snapshot = self.index.load_full();
        let mut merged: BTreeMap<SeriesKey, Vec<Sample>> = BTreeMap::new();
        for shard in snapshot.shards().iter().filter(|s| s.overlaps(start, end)) {
            let part = shard.read(start, end, matchers).map_err(|e| {
                self.metrics.inc(metrics::READ_ERRORS_TOTAL);
                tracing::warn!(shard = shard.id(), error = %e, "shard read failed");
                QueryError::Io {
                    shard_id: shard.id(),
                    source: Box::new(e),
                }
            })?;
            for (key, samples) in part {
                merged.entry(key).or_default().extend(samples);
            }
        }

        let series = merged
            .into_iter()
            .map(|(key, mut samples)| {
                samples.sort_by_key(|s| s.timestamp);
                Series { key, samples }
            })
            .collect();
        Ok(SeriesSet { series })
    }

    /// Runs a query for one selector of a parsed expression.
    ///
    /// Each alternative matcher group of the selector is queried and the
    /// results are unioned by series.
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidRegex`] for a bad pattern, plus any error
    /// from [`Store::query`].
    pub fn select(
        &self,
        selector: &Selector,
        start: i64,
        end: i64,
    ) -> std::result::Result<SeriesSet, QueryError> {
        let mut merged: BTreeMap<SeriesKey, Vec<Sample>> = BTreeMap::new();
        for group in selector.matcher_groups() {
            let mut matchers = Vec::with_capacity(group.len() + 1);
            if let Some(name) = &selector.metric_name {
                matchers.push(LabelMatcher::equal(METRIC_NAME_LABEL, name.as_str()));
            }
            for m in group {
                matchers.push(LabelMatcher::new(m.name.as_str(), m.op, m.value.as_str())?);
            }
            for series in self.query(start, end, &matchers)? {
                merged.entry(series.key).or_insert(series.samples);
            }
        }
        Ok(SeriesSet {
            series: merged
                .into_iter()
                .map(|(key, samples)| Series { key, samples })
                .collect(),
        })
    }

    /// Runs every selector of `expr` and unions the results by series.
    ///
    /// A series selected by several terms appears once.
    ///
    /// # Errors
    ///
    /// Any error from [`Store::select`].
    pub fn select_all(
        &self,
        expr: &Expr,
        start: i64,
        end: i64,
    ) -> std::result::Result<SeriesSet, QueryError> {
        let mut merged: BTreeMap<SeriesKey, Vec<Sample>> = BTreeMap::new();
        for selector in expr.selectors() {
            for series in self.select(selector, start, end)? {
                merged.entry(series.key).or_insert(series.samples);
            }
        }
        Ok(SeriesSet {
            series: merged
                .into_iter()
                .map(|(key, samples)| Series { key, samples })
                .collect(),
        })
    }

    /// Current shard index snapshot.
    pub fn snapshot(&self) -> Arc<ShardIndex> {
        self.index.load_full()
    }

    /// Computes store-wide statistics from the current snapshot.
    pub fn stats(&self) -> StoreStats {
        let snapshot = self.index.load_full();
        let mut series: HashSet<SeriesKey> = HashSet::new();
        let mut stats = StoreStats {
            shard_count: snapshot.len(),
            byte_size: snapshot.byte_size(),
            oldest_start: snapshot.oldest().map(|s| s.start()),
            ..StoreStats::default()
        };
        for shard in snapshot.shards() {
            series.extend(shard.series_keys());
            stats.index_memory_bytes += shard.index_size_bytes();
            let shard_stats = shard.stats();
            stats.point_count += shard_stats.point_count;
            stats.shards.push(shard_stats);
        }
        stats.measurement_count = series
            .iter()
            .map(|k| k.metric_name.as_str())
            .collect::<HashSet<_>>()
            .len();
        stats.series_count = series.len();
        stats
    }

    /// Free fraction of the volume holding the store.
    pub(crate) fn disk_free_ratio(&self) -> std::io::Result<f64> {
        self.disk
            .free_ratio(&self.path, self.index.load().byte_size())
    }

    /// Directory removals waiting to be retried.
    pub(crate) fn graveyard(&self) -> &Graveyard {
        &self.graveyard
    }

    /// The store's clock.
    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// The metrics sink.
    pub fn metrics(&self) -> &dyn MetricsRegistrar {
        self.metrics.as_ref()
    }

    /// The configuration the store was opened with.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Returns the path to the store directory.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn rotation_err(e: StoreError) -> WriteError {
    WriteError::Rotation(Box::new(e))
}

/// Largest multiple of `window` that is `<= ts`.
pub fn align_down(ts: i64, window: i64) -> i64 {
    ts - ts.rem_euclid(window)
}

#[allow(clippy::cast_precision_loss)]
fn count_f64(n: usize) -> f64 {
    n as f64
}

fn read_metadata(path: &Path) -> std::result::Result<StoreMetadata, StoreError> {
    let json = fs::read_to_string(path).map_err(|e| StoreError::DirectoryAccess {
        path: path.display().to_string(),
        source: e,
    })?;
    let metadata: StoreMetadata =
        serde_json::from_str(&json).map_err(|e| StoreError::CorruptedMetadata {
            reason: format!("failed to parse meta.json: {e}"),
        })?;
    if metadata.version != METADATA_VERSION {
        return Err(StoreError::CorruptedMetadata {
            reason: format!(
                "unsupported metadata version: expected {}, found {}",
                METADATA_VERSION, metadata.version
            ),
        });
    }
    Ok(metadata)
}

fn write_metadata(path: &Path, metadata: &StoreMetadata) -> std::result::Result<(), StoreError> {
    let json = serde_json::to_string_pretty(metadata)?;
    fs::write(path, json).map_err(|e| StoreError::DirectoryAccess {
        path: path.display().to_string(),
        source: e,
    })
}

fn load_shards(
    shards_dir: &Path,
    graveyard: &Arc<Graveyard>,
    mode: OpenMode,
) -> std::result::Result<Vec<Arc<Shard>>, StoreError> {
    let access = |e| StoreError::DirectoryAccess {
        path: shards_dir.display().to_string(),
        source: e,
    };

    let mut shards = Vec::new();
    for entry in fs::read_dir(shards_dir).map_err(access)? {
        let dir = entry.map_err(access)?.path();
        if !dir.is_dir() {
            continue;
        }
        if !dir.join("shard.json").exists() {
            if mode == OpenMode::ReadOnly {
                tracing::debug!(dir = %dir.display(), "skipping incomplete shard directory");
            } else {
                tracing::warn!(dir = %dir.display(), "removing incomplete shard directory");
                graveyard.bury(dir);
            }
            continue;
        }
        shards.push(match mode {
            OpenMode::ReadWrite => Shard::open(&dir, graveyard.clone())?,
            OpenMode::ReadOnly => Shard::open_read_only(&dir)?,
        });
    }
    shards.sort_by_key(Shard::start);

    for i in 1..shards.len() {
        let (earlier, later) = (&shards[i - 1], &shards[i]);
        if earlier.is_active() {
            if mode == OpenMode::ReadOnly {
                earlier.close_in_memory(later.start());
            } else {
                tracing::warn!(
                    shard = earlier.id(),
                    successor = later.id(),
                    "freezing interrupted rotation"
                );
                earlier.freeze(later.start())?;
            }
        }
        if earlier.end() > later.start() {
            return Err(StoreError::OverlappingShards {
                earlier: earlier.id(),
                earlier_end: earlier.end(),
                later: later.id(),
                later_start: later.start(),
            });
        }
    }

    if mode == OpenMode::ReadWrite {
        graveyard.sweep();
    }
    Ok(shards.into_iter().map(Arc::new).collect())
}
