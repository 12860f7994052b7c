//! Append-only segment files holding a shard's points.
//!
//! # File Format
//!
//! ```text
//! [0..4)    magic "MSSG"
//! [4..8)    format version (u32 LE)
//! [8..)     records: payload_len u32 LE | snappy(codec::encode(batch))
//! ```
//!
//! The active shard appends one record per accepted batch through a
//! [`SegmentWriter`]. Once a shard is frozen its segment is never written
//! again and is read through a read-only memory map ([`SegmentReader`]).
//!
//! A crash can leave a partially written record at the end of the file.
//! [`scan`] stops at such a torn tail and reports how many bytes are valid,
//! so the writer can truncate before appending again. A failed append is
//! rolled back the same way at once, so later records never land behind a
//! torn one. A complete record that
//! fails to decompress or decode is real corruption and is reported as an
//! error.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::codec;
use crate::error::StoreError;
use crate::point::Batch;

/// Magic bytes identifying a segment file.
const SEGMENT_MAGIC: [u8; 4] = *b"MSSG";

/// Current segment format version.
const SEGMENT_VERSION: u32 = 1;

/// Size of the file header in bytes.
pub const HEADER_SIZE: u64 = HEADER_LEN as u64;

const HEADER_LEN: usize = 8;

/// Size of a record's length prefix.
const RECORD_PREFIX: usize = 4;

/// What [`scan`] found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOutcome {
    /// Bytes up to the end of the last complete record.
    pub valid_len: u64,
    /// Complete records visited.
    pub records: usize,
    /// Bytes after `valid_len` belonging to a torn record.
    pub torn_bytes: u64,
}

/// Visits every batch in a segment image.
///
/// # Errors
///
/// Returns [`StoreError::CorruptedSegment`] on a bad header or a complete
/// record that cannot be decoded.
pub fn scan(
    data: &[u8],
    path: &Path,
    mut visit: impl FnMut(Batch),
) -> Result<ScanOutcome, StoreError> {
    let corrupted = |offset: usize, reason: String| StoreError::CorruptedSegment {
        path: path.display().to_string(),
        offset: offset as u64,
        reason,
    };

    if data.len() < HEADER_LEN || data[..4] != SEGMENT_MAGIC {
        return Err(corrupted(0, "missing segment header".to_string()));
    }
    let mut version = [0u8; 4];
    version.copy_from_slice(&data[4..8]);
    let version = u32::from_le_bytes(version);
    if version != SEGMENT_VERSION {
        return Err(corrupted(
            4,
            format!("unsupported segment version {version}, expected {SEGMENT_VERSION}"),
        ));
    }

    let mut pos = HEADER_LEN;
    let mut records = 0;
    let mut decoder = snap::raw::Decoder::new();

    while pos < data.len() {
        let Some(prefix) = data.get(pos..pos + RECORD_PREFIX) else {
            break;
        };
        let mut len = [0u8; RECORD_PREFIX];
        len.copy_from_slice(prefix);
        let len = u32::from_le_bytes(len) as usize;

        let body_start = pos + RECORD_PREFIX;
        let Some(body) = data.get(body_start..body_start.saturating_add(len)) else {
            break;
        };

        let raw = decoder
            .decompress_vec(body)
            .map_err(|e| corrupted(pos, format!("decompression failed: {e}")))?;
        let batch = codec::decode(&raw).map_err(|e| corrupted(pos, e.to_string()))?;
        visit(batch);

        records += 1;
        pos = body_start + len;
    }

    Ok(ScanOutcome {
        valid_len: pos as u64,
        records,
        torn_bytes: (data.len() - pos) as u64,
    })
}

/// Where a [`SegmentWriter`] puts its bytes.
trait RecordSink: Write {
    /// Cuts the sink back to `len` bytes and positions writes at the end.
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
}

impl RecordSink for File {
    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)?;
        self.seek(SeekFrom::Start(len))?;
        Ok(())
    }
}

/// Writes one record at `len`, cutting the sink back to `len` if the write
/// fails part way.
///
/// Returns `Err((error, rolled_back))`; when `rolled_back` is false the sink
/// may still hold a partial record.
fn write_record<S: RecordSink>(
    sink: &mut S,
    len: u64,
    record: &[u8],
) -> Result<(), (io::Error, bool)> {
    let Err(e) = sink.write_all(record) else {
        return Ok(());
    };
    match sink.truncate_to(len) {
        Ok(()) => Err((e, true)),
        Err(rollback) => {
            tracing::error!(error = %rollback, "failed to roll back partial segment record");
            Err((e, false))
        }
    }
}

/// Appends records to a segment file.
///
/// An append that fails is cut back off the file. If that cut fails too the
/// writer is poisoned and refuses further appends, so nothing acknowledged
/// is ever stored behind a torn record.
#[derive(Debug)]
pub struct SegmentWriter {
    file: File,
    path: PathBuf,
    len: u64,
    encoder: snap::raw::Encoder,
    poisoned: bool,
}

impl SegmentWriter {
    /// Creates a new segment, failing if the file exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DirectoryAccess`] if the file cannot be created.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let access = |e| StoreError::DirectoryAccess {
            path: path.display().to_string(),
            source: e,
        };

        let mut file = OpenOptions::new()
            .append(true)
            .create_new(true)
            .open(&path)
            .map_err(access)?;
        let mut header = [0u8; HEADER_LEN];
        header[..4].copy_from_slice(&SEGMENT_MAGIC);
        header[4..].copy_from_slice(&SEGMENT_VERSION.to_le_bytes());
        file.write_all(&header).map_err(access)?;

        Ok(Self {
            file,
            path,
            len: HEADER_SIZE,
            encoder: snap::raw::Encoder::new(),
            poisoned: false,
        })
    }

    /// Reopens an existing segment for appending after `valid_len` bytes.
    ///
    /// Anything past `valid_len` (a torn tail found by [`scan`]) is cut off.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DirectoryAccess`] if the file cannot be opened
    /// or truncated.
    pub fn reopen<P: AsRef<Path>>(path: P, valid_len: u64) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let access = |e| StoreError::DirectoryAccess {
            path: path.display().to_string(),
            source: e,
        };

        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(access)?;
        if file.metadata().map_err(access)?.len() > valid_len {
            file.set_len(valid_len).map_err(access)?;
        }

        Ok(Self {
            file,
            path,
            len: valid_len,
            encoder: snap::raw::Encoder::new(),
            poisoned: false,
        })
    }

    /// Appends one batch as a single record and returns the bytes written.
    ///
    /// The record is assembled in memory and written with one `write_all`.
    /// On failure the file is cut back to its previous length.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error, [`io::ErrorKind::InvalidInput`] if
    /// the batch cannot be encoded, or [`io::ErrorKind::BrokenPipe`] once the
    /// writer is poisoned.
    pub fn append(&mut self, batch: &Batch) -> io::Result<u64> {
        if self.poisoned {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "segment writer poisoned by a failed rollback",
            ));
        }
        let raw = codec::encode(batch).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let compressed = self
            .encoder
            .compress_vec(&raw)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let len = u32::try_from(compressed.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "record too large"))?;

        let mut record = Vec::with_capacity(RECORD_PREFIX + compressed.len());
        record.extend_from_slice(&len.to_le_bytes());
        record.extend_from_slice(&compressed);

        if let Err((e, rolled_back)) = write_record(&mut self.file, self.len, &record) {
            self.poisoned = !rolled_back;
            return Err(e);
        }
        let written = record.len() as u64;
        self.len += written;
        Ok(written)
    }

    /// Whether a failed rollback has disabled this writer.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Flushes file contents to stable storage.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error.
    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    /// Current file length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether only the header has been written.
    pub fn is_empty(&self) -> bool {
        self.len <= HEADER_SIZE
    }

    /// Path of the segment file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read-only view of a frozen segment.
#[derive(Debug)]
pub struct SegmentReader {
    mmap: Mmap,
    path: PathBuf,
}

impl SegmentReader {
    /// Memory-maps a segment.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::MemoryMap`] if the file cannot be opened or mapped.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let map_err = |e| StoreError::MemoryMap {
            path: path.display().to_string(),
            source: e,
        };

        let file = File::open(&path).map_err(map_err)?;
        // SAFETY: Frozen segments are never written or truncated again by this
        // process, and the file is only removed after the last reader drops.
        let mmap = unsafe { Mmap::map(&file).map_err(map_err)? };

        Ok(Self { mmap, path })
    }

    /// Visits every complete batch in the segment.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::CorruptedSegment`] if a record cannot be decoded.
    pub fn for_each(&self, visit: impl FnMut(Batch)) -> Result<ScanOutcome, StoreError> {
        scan(&self.mmap, &self.path, visit)
    }

    /// Mapped length in bytes.
    pub fn len(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// Whether the segment holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() <= HEADER_SIZE
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::point::Point;
    use tempfile::tempdir;

    fn batch(ts: i64) -> Batch {
        Batch::new(vec![
            Point::new("app-1", "cpu", ts, 1.5).with_label("env", "prod"),
            Point::new("app-2", "cpu", ts + 1, 2.5),
        ])
    }

    fn read_all(path: &Path) -> (Vec<Batch>, ScanOutcome) {
        let mut batches = Vec::new();
        let outcome = SegmentReader::open(path)
            .unwrap()
            .for_each(|b| batches.push(b))
            .unwrap();
        (batches, outcome)
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("points.seg");

        let mut writer = SegmentWriter::create(&path).unwrap();
        assert!(writer.is_empty());
        writer.append(&batch(10)).unwrap();
        writer.append(&batch(20)).unwrap();
        writer.sync().unwrap();
        assert_eq!(writer.len(), fs::metadata(&path).unwrap().len());

        let (batches, outcome) = read_all(&path);
        assert_eq!(batches, vec![batch(10), batch(20)]);
        assert_eq!(outcome.records, 2);
        assert_eq!(outcome.torn_bytes, 0);
    }

    #[test]
    fn test_create_refuses_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("points.seg");
        SegmentWriter::create(&path).unwrap();
        assert!(matches!(
            SegmentWriter::create(&path),
            Err(StoreError::DirectoryAccess { .. })
        ));
    }

    #[test]
    fn test_torn_tail_is_reported_and_truncated() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("points.seg");

        let mut writer = SegmentWriter::create(&path).unwrap();
        writer.append(&batch(10)).unwrap();
        let good_len = writer.len();
        writer.append(&batch(20)).unwrap();
        drop(writer);

        // Chop the second record in half.
        let full = fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(good_len + (full - good_len) / 2).unwrap();
        drop(file);

        let (batches, outcome) = read_all(&path);
        assert_eq!(batches, vec![batch(10)]);
        assert_eq!(outcome.valid_len, good_len);
        assert!(outcome.torn_bytes > 0);

        let mut writer = SegmentWriter::reopen(&path, outcome.valid_len).unwrap();
        writer.append(&batch(30)).unwrap();
        drop(writer);

        let (batches, outcome) = read_all(&path);
        assert_eq!(batches, vec![batch(10), batch(30)]);
        assert_eq!(outcome.torn_bytes, 0);
    }

    #[test]
    fn test_corrupt_record_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("points.seg");

        let mut writer = SegmentWriter::create(&path).unwrap();
        writer.append(&batch(10)).unwrap();
        drop(writer);

        let mut bytes = fs::read(&path).unwrap();
        let body = HEADER_LEN + RECORD_PREFIX;
        for b in &mut bytes[body..] {
            *b = 0xff;
        }
        fs::write(&path, &bytes).unwrap();

        let reader = SegmentReader::open(&path).unwrap();
        assert!(matches!(
            reader.for_each(|_| {}),
            Err(StoreError::CorruptedSegment { .. })
        ));
    }

    /// In-memory sink that fails after a byte budget, optionally failing
    /// the rollback too.
    struct FlakySink {
        bytes: Vec<u8>,
        budget: usize,
        truncate_fails: bool,
    }

    impl Write for FlakySink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::new(io::ErrorKind::StorageFull, "disk full"));
            }
            let n = buf.len().min(self.budget);
            self.budget -= n;
            self.bytes.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl RecordSink for FlakySink {
        fn truncate_to(&mut self, len: u64) -> io::Result<()> {
            if self.truncate_fails {
                return Err(io::Error::other("truncate failed"));
            }
            self.bytes.truncate(usize::try_from(len).unwrap());
            Ok(())
        }
    }

    fn record_for(batch: &Batch) -> Vec<u8> {
        let compressed = snap::raw::Encoder::new()
            .compress_vec(&codec::encode(batch).unwrap())
            .unwrap();
        let mut record = u32::try_from(compressed.len()).unwrap().to_le_bytes().to_vec();
        record.extend_from_slice(&compressed);
        record
    }

    #[test]
    fn test_partial_write_is_rolled_back() {
        let mut header = SEGMENT_MAGIC.to_vec();
        header.extend_from_slice(&SEGMENT_VERSION.to_le_bytes());
        let first = record_for(&batch(10));
        let second = record_for(&batch(20));
        let third = record_for(&batch(30));

        let mut sink = FlakySink {
            bytes: header.clone(),
            budget: first.len() + second.len() / 2,
            truncate_fails: false,
        };
        assert!(write_record(&mut sink, 8, &first).is_ok());
        let before = sink.bytes.len() as u64;
        let (_, rolled_back) = write_record(&mut sink, before, &second).unwrap_err();
        assert!(rolled_back);
        assert_eq!(sink.bytes.len() as u64, before);

        sink.budget = usize::MAX;
        assert!(write_record(&mut sink, before, &third).is_ok());

        let mut batches = Vec::new();
        let outcome = scan(&sink.bytes, Path::new("mem"), |b| batches.push(b)).unwrap();
        assert_eq!(batches, vec![batch(10), batch(30)]);
        assert_eq!(outcome.torn_bytes, 0);
    }

    #[test]
    fn test_failed_rollback_is_reported() {
        let mut sink = FlakySink {
            bytes: Vec::new(),
            budget: 3,
            truncate_fails: true,
        };
        let (e, rolled_back) = write_record(&mut sink, 0, &record_for(&batch(10))).unwrap_err();
        assert_eq!(e.kind(), io::ErrorKind::StorageFull);
        assert!(!rolled_back);
    }

    #[test]
    fn test_unencodable_batch_writes_nothing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("points.seg");
        let mut writer = SegmentWriter::create(&path).unwrap();

        let huge = Batch::new(vec![Point::new("a", "cpu", 0, 0.0).with_label("v", "x".repeat(70_000))]);
        let err = writer.append(&huge).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(!writer.is_poisoned());
        assert_eq!(writer.len(), HEADER_SIZE);

        writer.append(&batch(10)).unwrap();
        drop(writer);
        assert_eq!(read_all(&path).0, vec![batch(10)]);
    }

    #[test]
    fn test_bad_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("points.seg");
        fs::write(&path, b"NOPE\x01\x00\x00\x00").unwrap();
        let reader = SegmentReader::open(&path).unwrap();
        assert!(matches!(
            reader.for_each(|_| {}),
            Err(StoreError::CorruptedSegment { offset: 0, .. })
        ));
    }
}
