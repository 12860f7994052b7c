//! Time-windowed shards: the unit of storage, rotation and eviction.
//!
//! Each shard lives in its own directory:
//!
//! ```text
//! 000000000042/
//! ├── shard.json   <- manifest (id, range, created_at)
//! └── points.seg   <- segment records, see [`crate::segment`]
//! ```
//!
//! # Design
//!
//! - The range `[start, end)` is fixed at creation except for `end`, which
//!   is [`OPEN_END`] while the shard is active and set exactly once when it
//!   is frozen.
//! - An active shard holds its samples in memory (one column per series)
//!   and appends every accepted batch to its segment before updating memory.
//! - A frozen shard drops the in-memory samples, keeps only its
//!   [`SeriesIndex`], and serves reads from a memory-mapped segment.
//! - Eviction only marks a shard. The directory is removed when the last
//!   `Arc<Shard>` is dropped, so a query still holding an old index snapshot
//!   keeps reading valid files. A failed removal is queued on the
//!   [`Graveyard`] and retried by the retention loop.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, WriteError};
use crate::point::{Batch, Point};
use crate::query::{LabelMatcher, Sample};
use crate::segment::{self, SegmentReader, SegmentWriter};
use crate::series::{SeriesId, SeriesIndex, SeriesKey};

/// `end` of a shard that is still accepting writes.
pub const OPEN_END: i64 = i64::MAX;

/// Current manifest format version.
const MANIFEST_VERSION: u32 = 1;

/// Name of the manifest file in a shard directory.
const MANIFEST_FILE: &str = "shard.json";

/// Name of the segment file in a shard directory.
const SEGMENT_FILE: &str = "points.seg";

/// Persisted description of a shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ShardManifest {
    version: u32,
    id: u64,
    start: i64,
    /// `None` while the shard is active.
    end: Option<i64>,
    created_at_ms: i64,
}

/// Directories whose removal failed and must be retried.
#[derive(Debug, Default)]
pub struct Graveyard {
    pending: Mutex<Vec<PathBuf>>,
}

impl Graveyard {
    /// Queues a directory for a later removal attempt.
    pub fn bury(&self, dir: PathBuf) {
        self.pending.lock().push(dir);
    }

    /// Retries every queued removal and returns how many succeeded.
    pub fn sweep(&self) -> usize {
        let pending = std::mem::take(&mut *self.pending.lock());
        let mut removed = 0;
        for dir in pending {
            match fs::remove_dir_all(&dir) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => removed += 1,
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "shard removal failed again");
                    self.bury(dir);
                }
            }
        }
        removed
    }

    /// Number of directories awaiting removal.
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether nothing is awaiting removal.
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

/// Point-in-time summary of a shard.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShardStats {
    /// Shard id.
    pub id: u64,
    /// Inclusive range start.
    pub start: i64,
    /// Exclusive range end, `None` while active.
    pub end: Option<i64>,
    /// Creation time, epoch milliseconds.
    pub created_at_ms: i64,
    /// Segment size on disk.
    pub byte_size: u64,
    /// Points stored.
    pub point_count: u64,
    /// Distinct series.
    pub series_count: usize,
    /// Oldest point timestamp.
    pub min_ts: Option<i64>,
    /// Newest point timestamp.
    pub max_ts: Option<i64>,
}

enum Storage {
    Active(SegmentWriter),
    /// An active shard loaded read-only: samples in memory, no writer.
    Snapshot,
    Frozen(SegmentReader),
    /// File handles closed; only reached while dropping an evicted shard.
    Released,
}

struct ShardData {
    index: SeriesIndex,
    /// Samples per series id. Only populated while active.
    columns: Vec<Vec<Sample>>,
    storage: Storage,
    point_count: u64,
    min_ts: Option<i64>,
    max_ts: Option<i64>,
}

impl ShardData {
    fn new(storage: Storage) -> Self {
        Self {
            index: SeriesIndex::new(),
            columns: Vec::new(),
            storage,
            point_count: 0,
            min_ts: None,
            max_ts: None,
        }
    }

    fn insert(&mut self, points: &[Point], keep_samples: bool) {
        for point in points {
            let id = self.index.get_or_insert(&SeriesKey::from_point(point)) as usize;
            if keep_samples {
                if self.columns.len() <= id {
                    self.columns.resize_with(id + 1, Vec::new);
                }
                self.columns[id].push(Sample {
                    timestamp: point.timestamp,
                    value: point.value,
                });
            }
            self.point_count += 1;
            self.min_ts = Some(self.min_ts.map_or(point.timestamp, |m| m.min(point.timestamp)));
            self.max_ts = Some(self.max_ts.map_or(point.timestamp, |m| m.max(point.timestamp)));
        }
    }
}

/// One time window of stored points.
pub struct Shard {
    id: u64,
    start: i64,
    end: AtomicI64,
    created_at_ms: i64,
    dir: PathBuf,
    byte_size: AtomicU64,
    data: RwLock<ShardData>,
    evicted: AtomicBool,
    graveyard: Arc<Graveyard>,
}

impl std::fmt::Debug for Shard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shard")
            .field("id", &self.id)
            .field("start", &self.start)
            .field("end", &self.end())
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl Shard {
    /// Creates a new, empty, active shard under `shards_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the directory, manifest or segment cannot be
    /// created. A partially created directory is removed.
    pub fn create(
        shards_dir: &Path,
        id: u64,
        start: i64,
        created_at_ms: i64,
        graveyard: Arc<Graveyard>,
    ) -> Result<Self, StoreError> {
        let dir = shards_dir.join(format!("{id:012}"));
        fs::create_dir(&dir).map_err(|e| StoreError::DirectoryAccess {
            path: dir.display().to_string(),
            source: e,
        })?;

        let manifest = ShardManifest {
            version: MANIFEST_VERSION,
            id,
            start,
            end: None,
            created_at_ms,
        };
        let writer = match write_manifest(&dir, &manifest)
            .and_then(|()| SegmentWriter::create(dir.join(SEGMENT_FILE)))
        {
            Ok(writer) => writer,
            Err(e) => {
                let _ = fs::remove_dir_all(&dir);
                return Err(e);
            }
        };

        tracing::info!(shard = id, start, "created shard");

        Ok(Self {
            id,
            start,
            end: AtomicI64::new(OPEN_END),
            created_at_ms,
            byte_size: AtomicU64::new(writer.len()),
            dir,
            data: RwLock::new(ShardData::new(Storage::Active(writer))),
            evicted: AtomicBool::new(false),
            graveyard,
        })
    }

    /// Reopens a shard directory written by an earlier process.
    ///
    /// Active shards replay their segment into memory and cut off a torn
    /// tail; frozen shards rebuild their series index from the mapped segment.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the manifest is missing or invalid, or the
    /// segment is corrupted.
    pub fn open(dir: &Path, graveyard: Arc<Graveyard>) -> Result<Self, StoreError> {
        Self::load(dir, graveyard, true)
    }

    /// Opens a shard directory without changing anything on disk.
    ///
    /// An active shard's segment is replayed into memory up to any torn tail,
    /// which is left in place; the shard rejects appends and freezing.
    ///
    /// # Errors
    ///
    /// See [`Shard::open`].
    pub fn open_read_only(dir: &Path) -> Result<Self, StoreError> {
        Self::load(dir, Arc::default(), false)
    }

    fn load(dir: &Path, graveyard: Arc<Graveyard>, writable: bool) -> Result<Self, StoreError> {
        let manifest = read_manifest(dir)?;
        let segment_path = dir.join(SEGMENT_FILE);
        let mut data = ShardData::new(Storage::Released);

        let (storage, outcome, byte_size) = if manifest.end.is_some() {
            let reader = SegmentReader::open(&segment_path)?;
            let outcome = reader.for_each(|batch| data.insert(&batch.points, false))?;
            let byte_size = reader.len();
            (Storage::Frozen(reader), outcome, byte_size)
        } else {
            let bytes = fs::read(&segment_path).map_err(|e| StoreError::DirectoryAccess {
                path: segment_path.display().to_string(),
                source: e,
            })?;
            let outcome = segment::scan(&bytes, &segment_path, |batch| {
                data.insert(&batch.points, true);
            })?;
            let storage = if writable {
                Storage::Active(SegmentWriter::reopen(&segment_path, outcome.valid_len)?)
            } else {
                Storage::Snapshot
            };
            (storage, outcome, outcome.valid_len)
        };
        data.storage = storage;

        if outcome.torn_bytes > 0 {
            tracing::warn!(
                shard = manifest.id,
                torn_bytes = outcome.torn_bytes,
                active = manifest.end.is_none(),
                "segment has a torn tail record"
            );
        }
        tracing::info!(
            shard = manifest.id,
            start = manifest.start,
            active = manifest.end.is_none(),
            points = data.point_count,
            "opened shard"
        );

        Ok(Self {
            id: manifest.id,
            start: manifest.start,
            end: AtomicI64::new(manifest.end.unwrap_or(OPEN_END)),
            created_at_ms: manifest.created_at_ms,
            dir: dir.to_path_buf(),
            byte_size: AtomicU64::new(byte_size),
            data: RwLock::new(data),
            evicted: AtomicBool::new(false),
            graveyard,
        })
    }

    /// Shard id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Inclusive range start.
    pub fn start(&self) -> i64 {
        self.start
    }

    /// Exclusive range end, [`OPEN_END`] while active.
    pub fn end(&self) -> i64 {
        self.end.load(Ordering::Acquire)
    }

    /// Whether the shard still accepts writes.
    pub fn is_active(&self) -> bool {
        self.end() == OPEN_END
    }

    /// Creation time, epoch milliseconds.
    pub fn created_at_ms(&self) -> i64 {
        self.created_at_ms
    }

    /// Segment size in bytes.
    pub fn byte_size(&self) -> u64 {
        self.byte_size.load(Ordering::Acquire)
    }

    /// The shard directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether `ts` falls in `[start, end)`.
    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.start && ts < self.end()
    }

    /// Whether `[start, end)` intersects this shard's range.
    pub fn overlaps(&self, start: i64, end: i64) -> bool {
        self.start < end && self.end() > start
    }

    /// Number of stored points.
    pub fn point_count(&self) -> u64 {
        self.data.read().point_count
    }

    /// Newest stored timestamp.
    pub fn max_ts(&self) -> Option<i64> {
        self.data.read().max_ts
    }

    /// Whether the segment writer gave up after a failed rollback.
    pub fn is_poisoned(&self) -> bool {
        matches!(&self.data.read().storage, Storage::Active(w) if w.is_poisoned())
    }

    /// Ends a read-only view of an active shard at `end` without touching
    /// disk. Used when a newer shard shows the rotation already began.
    pub(crate) fn close_in_memory(&self, end: i64) {
        if matches!(self.data.read().storage, Storage::Snapshot) {
            self.end.store(end, Ordering::Release);
        }
    }

    /// Appends points that all belong to this shard.
    ///
    /// The segment is written first; memory is only updated once the record
    /// is in the file, so a failed append leaves no visible points.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError::ShardFrozen`] if the shard was rotated, or
    /// [`WriteError::Io`] if the segment append fails.
    pub fn append(&self, points: &[Point]) -> Result<(), WriteError> {
        let Some(first) = points.first() else {
            return Ok(());
        };
        let mut data = self.data.write();
        let Storage::Active(writer) = &mut data.storage else {
            return Err(WriteError::ShardFrozen {
                timestamp: first.timestamp,
                shard_id: self.id,
            });
        };

        let written = writer
            .append(&Batch::new(points.to_vec()))
            .map_err(|e| WriteError::Io {
                shard_id: self.id,
                source: e,
            })?;
        self.byte_size.fetch_add(written, Ordering::AcqRel);

        data.insert(points, true);
        Ok(())
    }

    /// Freezes the shard at `end` and switches it to mapped reads.
    ///
    /// Nothing changes if any step fails. Freezing a frozen shard is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the segment cannot be synced or mapped, or the
    /// manifest cannot be rewritten.
    pub fn freeze(&self, end: i64) -> Result<(), StoreError> {
        let mut data = self.data.write();
        let Storage::Active(writer) = &data.storage else {
            return Ok(());
        };

        writer.sync().map_err(|e| StoreError::DirectoryAccess {
            path: writer.path().display().to_string(),
            source: e,
        })?;
        let reader = SegmentReader::open(writer.path())?;
        write_manifest(
            &self.dir,
            &ShardManifest {
                version: MANIFEST_VERSION,
                id: self.id,
                start: self.start,
                end: Some(end),
                created_at_ms: self.created_at_ms,
            },
        )?;

        data.storage = Storage::Frozen(reader);
        data.columns = Vec::new();
        self.end.store(end, Ordering::Release);

        tracing::info!(
            shard = self.id,
            start = self.start,
            end,
            points = data.point_count,
            bytes = self.byte_size(),
            "froze shard"
        );
        Ok(())
    }

    /// Reads samples in `[start, end)` for every series matching `matchers`.
    ///
    /// Samples within a series are sorted by timestamp. Series with no
    /// samples in range are omitted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::CorruptedSegment`] if a frozen segment cannot be read.
    pub fn read(
        &self,
        start: i64,
        end: i64,
        matchers: &[LabelMatcher],
    ) -> Result<Vec<(SeriesKey, Vec<Sample>)>, StoreError> {
        let data = self.data.read();
        let selected = data.index.select(matchers);
        if selected.is_empty() {
            return Ok(Vec::new());
        }
        let in_range = |ts: i64| ts >= start && ts < end;

        let mut found: HashMap<SeriesId, Vec<Sample>> = HashMap::new();
        match &data.storage {
            Storage::Active(_) | Storage::Snapshot => {
                for &id in &selected {
                    let samples: Vec<Sample> = data
                        .columns
                        .get(id as usize)
                        .into_iter()
                        .flatten()
                        .filter(|s| in_range(s.timestamp))
                        .copied()
                        .collect();
                    found.insert(id, samples);
                }
            }
            Storage::Frozen(reader) => {
                let wanted: HashSet<SeriesId> = selected.iter().copied().collect();
                reader.for_each(|batch| {
                    for point in &batch.points {
                        if !in_range(point.timestamp) {
                            continue;
                        }
                        if let Some(id) = data.index.get(&SeriesKey::from_point(point))
                            && wanted.contains(&id)
                        {
                            found.entry(id).or_default().push(Sample {
                                timestamp: point.timestamp,
                                value: point.value,
                            });
                        }
                    }
                })?;
            }
            Storage::Released => {}
        }

        let mut out = Vec::with_capacity(found.len());
        for (id, mut samples) in found {
            if samples.is_empty() {
                continue;
            }
            if let Some(key) = data.index.key(id) {
                samples.sort_by_key(|s| s.timestamp);
                out.push((key.clone(), samples));
            }
        }
        Ok(out)
    }

    /// Every series key in the shard.
    pub fn series_keys(&self) -> Vec<SeriesKey> {
        self.data.read().index.keys().cloned().collect()
    }

    /// Approximate in-memory index footprint.
    pub fn index_size_bytes(&self) -> usize {
        self.data.read().index.size_bytes()
    }

    /// Summary of the shard.
    pub fn stats(&self) -> ShardStats {
        let data = self.data.read();
        let end = self.end();
        ShardStats {
            id: self.id,
            start: self.start,
            end: (end != OPEN_END).then_some(end),
            created_at_ms: self.created_at_ms,
            byte_size: self.byte_size(),
            point_count: data.point_count,
            series_count: data.index.len(),
            min_ts: data.min_ts,
            max_ts: data.max_ts,
        }
    }

    /// Marks the shard for removal once the last reference is dropped.
    pub fn mark_evicted(&self) {
        self.evicted.store(true, Ordering::Release);
    }

    /// Whether the shard has been evicted.
    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }
}

impl Drop for Shard {
    fn drop(&mut self) {
        if !self.evicted.load(Ordering::Acquire) {
            return;
        }
        // Close the mapping and file handle before removing the directory.
        self.data.get_mut().storage = Storage::Released;

        match fs::remove_dir_all(&self.dir) {
            Ok(()) => tracing::info!(shard = self.id, "removed shard directory"),
            Err(e) => {
                tracing::warn!(
                    shard = self.id,
                    dir = %self.dir.display(),
                    error = %e,
                    "failed to remove shard directory; will retry"
                );
                self.graveyard.bury(self.dir.clone());
            }
        }
    }
}

fn write_manifest(dir: &Path, manifest: &ShardManifest) -> Result<(), StoreError> {
    let path = dir.join(MANIFEST_FILE);
    let tmp = dir.join(format!("{MANIFEST_FILE}.tmp"));
    let json = serde_json::to_string_pretty(manifest)?;
    fs::write(&tmp, json)
        .and_then(|()| fs::rename(&tmp, &path))
        .map_err(|e| StoreError::DirectoryAccess {
            path: path.display().to_string(),
            source: e,
        })
}

fn read_manifest(dir: &Path) -> Result<ShardManifest, StoreError> {
    let path = dir.join(MANIFEST_FILE);
    let json = fs::read_to_string(&path).map_err(|e| StoreError::DirectoryAccess {
        path: path.display().to_string(),
        source: e,
    })?;
    let manifest: ShardManifest =
        serde_json::from_str(&json).map_err(|e| StoreError::CorruptedMetadata {
            reason: format!("shard manifest '{}': {e}", path.display()),
        })?;

    if manifest.version != MANIFEST_VERSION {
        return Err(StoreError::CorruptedMetadata {
            reason: format!(
                "shard manifest '{}': unsupported version {}, expected {}",
                path.display(),
                manifest.version,
                MANIFEST_VERSION
            ),
        });
    }
    if let Some(end) = manifest.end
        && end < manifest.start
    {
        return Err(StoreError::CorruptedMetadata {
            reason: format!(
                "shard manifest '{}': end {end} precedes start {}",
                path.display(),
                manifest.start
            ),
        });
    }
    Ok(manifest)
}
