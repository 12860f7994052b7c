//! Error types for the metric store.

use thiserror::Error;

/// The main error type for all metric store operations.
///
/// Each subsystem has its own error enum so callers can match precisely on
/// the layer that failed; this type wraps them for code that does not care.
#[derive(Error, Debug)]
pub enum MetricStoreError {
    /// Error decoding a point batch.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A batch cannot be represented in the binary format.
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    /// Error on the ingestion transport.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Error opening or maintaining a store.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Error during a write (ingest path).
    #[error("write error: {0}")]
    Write(#[from] WriteError),

    /// Error during a query (read path).
    #[error("query error: {0}")]
    Query(#[from] QueryError),

    /// A query was rejected by the authorizer.
    #[error("authorization error: {0}")]
    Auth(#[from] AuthError),

    /// Invalid store configuration.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Error talking to the remote rule manager.
    #[cfg(feature = "remote-rules")]
    #[error("rule manager error: {0}")]
    Rule(#[from] RuleError),
}

/// Errors produced while decoding a binary point batch.
///
/// Decoding is all-or-nothing: any of these means no points were produced.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The buffer does not start with the batch magic.
    #[error("bad batch magic: {found:02x?}")]
    BadMagic {
        /// The first bytes that were found instead.
        found: Vec<u8>,
    },

    /// The buffer ended before a field could be read.
    #[error("unexpected end of input at offset {offset}: needed {needed} more bytes")]
    UnexpectedEof {
        /// Offset at which the read was attempted.
        offset: usize,
        /// Bytes required to complete the read.
        needed: usize,
    },

    /// A declared count cannot possibly fit in the remaining input.
    #[error("invalid {what} count {count}: only {remaining} bytes remain")]
    InvalidCount {
        /// Which count was invalid ("point" or "label").
        what: &'static str,
        /// The declared count.
        count: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },

    /// A string field is not valid UTF-8.
    #[error("invalid utf-8 in string at offset {offset}")]
    InvalidUtf8 {
        /// Offset of the string payload.
        offset: usize,
    },

    /// A point carries the same label key twice.
    #[error("duplicate label key '{key}'")]
    DuplicateLabel {
        /// The repeated key.
        key: String,
    },

    /// Bytes remain after the last declared point.
    #[error("{count} trailing bytes after batch")]
    TrailingBytes {
        /// Number of unread bytes.
        count: usize,
    },
}

/// A point or batch exceeds a limit of the binary format.
///
/// Encoding checks the whole batch before writing anything, so these never
/// leave a partial encoding behind.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// A string field is longer than a `u16` length prefix can describe.
    #[error("{field} of {len} bytes exceeds the {max} byte limit")]
    StringTooLong {
        /// Which field: "source_id", "metric_name", "label key" or "label value".
        field: &'static str,
        /// Byte length of the field.
        len: usize,
        /// Largest encodable length.
        max: usize,
    },

    /// A point has more labels than a `u16` count can describe.
    #[error("{count} labels exceed the {max} label limit")]
    TooManyLabels {
        /// Labels on the point.
        count: usize,
        /// Largest encodable count.
        max: usize,
    },

    /// A batch has more points than a `u32` count can describe.
    #[error("{count} points exceed the {max} point limit")]
    TooManyPoints {
        /// Points in the batch.
        count: usize,
        /// Largest encodable count.
        max: usize,
    },
}

/// Errors on the framed ingestion transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The peer closed the stream, or this sender was poisoned by an earlier failure.
    #[error("connection closed")]
    Closed,

    /// The stream is no longer frame aligned. The connection must be dropped.
    #[error("framing error: {reason}")]
    Framing {
        /// What was wrong with the frame header or body.
        reason: String,
    },

    /// A well-framed payload failed to decode. The stream is still usable.
    #[error("dropped undecodable frame: {0}")]
    Decode(#[from] DecodeError),

    /// A batch could not be encoded; nothing was written.
    #[error("batch cannot be encoded: {0}")]
    Encode(#[from] EncodeError),

    /// A batch encoded larger than the maximum frame size.
    #[error("frame of {size} bytes exceeds limit of {max} bytes")]
    FrameTooLarge {
        /// The encoded payload size.
        size: usize,
        /// The configured maximum.
        max: usize,
    },

    /// No data arrived within the idle timeout.
    #[error("read timed out")]
    Timeout,

    /// Underlying socket I/O failed.
    #[error("transport I/O failed: {0}")]
    Io(#[source] std::io::Error),
}

/// Errors that can occur when opening or maintaining a store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store directory could not be created or accessed.
    #[error("failed to access store directory '{path}': {source}")]
    DirectoryAccess {
        /// The path that could not be accessed.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A metadata or manifest file is corrupted or invalid.
    #[error("corrupted metadata file: {reason}")]
    CorruptedMetadata {
        /// Description of what was invalid about the metadata.
        reason: String,
    },

    /// Shards found on disk have overlapping time ranges.
    #[error("shard {later} [{later_start}, ..) overlaps shard {earlier} ending at {earlier_end}")]
    OverlappingShards {
        /// Id of the earlier shard.
        earlier: u64,
        /// End of the earlier shard's range.
        earlier_end: i64,
        /// Id of the later shard.
        later: u64,
        /// Start of the later shard's range.
        later_start: i64,
    },

    /// Failed to serialize metadata to JSON.
    #[error("failed to serialize metadata: {0}")]
    MetadataSerialize(#[from] serde_json::Error),

    /// Memory mapping a shard segment failed.
    #[error("memory mapping failed for file '{path}': {source}")]
    MemoryMap {
        /// The file path that failed to map.
        path: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A shard segment file is unreadable.
    #[error("segment '{path}' is corrupted at offset {offset}: {reason}")]
    CorruptedSegment {
        /// The segment file path.
        path: String,
        /// Offset of the bad record.
        offset: u64,
        /// Description of the corruption.
        reason: String,
    },

    /// The retention worker thread could not be started.
    #[error("failed to spawn retention worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),
}

/// Errors that can occur during a write (ingest path).
///
/// Per-point rejections ([`WriteError::Expired`], [`WriteError::ShardFrozen`],
/// [`WriteError::OutOfRange`], [`WriteError::TooFarAhead`],
/// [`WriteError::Unencodable`]) are counted and logged by the store rather
/// than returned; they are public so drop reasons can be reported uniformly.
#[derive(Error, Debug)]
pub enum WriteError {
    /// The point is older than the retention window.
    #[error("point at {timestamp} is older than retention cutoff {cutoff}")]
    Expired {
        /// The point timestamp.
        timestamp: i64,
        /// The retention cutoff.
        cutoff: i64,
    },

    /// The point falls in a shard that has already been rotated.
    #[error("point at {timestamp} falls in frozen shard {shard_id}")]
    ShardFrozen {
        /// The point timestamp.
        timestamp: i64,
        /// The frozen shard it would belong to.
        shard_id: u64,
    },

    /// The point predates every shard in the store.
    #[error("point at {timestamp} precedes the oldest shard starting at {oldest_start}")]
    OutOfRange {
        /// The point timestamp.
        timestamp: i64,
        /// Start of the oldest shard.
        oldest_start: i64,
    },

    /// The point lies further in the future than the store accepts.
    #[error("point at {timestamp} is past the acceptance ceiling {ceiling}")]
    TooFarAhead {
        /// The point timestamp.
        timestamp: i64,
        /// Latest accepted timestamp, exclusive.
        ceiling: i64,
    },

    /// The point cannot be stored in the segment format.
    #[error("point at {timestamp} cannot be stored: {source}")]
    Unencodable {
        /// The point timestamp.
        timestamp: i64,
        /// The format limit it exceeds.
        #[source]
        source: EncodeError,
    },

    /// The store was opened read-only.
    #[error("store is open read-only")]
    ReadOnly,

    /// Appending to the shard segment failed.
    #[error("failed to append to shard {shard_id}: {source}")]
    Io {
        /// The shard being written.
        shard_id: u64,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Creating or rotating a shard failed.
    #[error("shard rotation failed: {0}")]
    Rotation(#[source] Box<StoreError>),
}

/// Errors that can occur during query operations (read path).
#[derive(Error, Debug)]
pub enum QueryError {
    /// The time range is invalid (start >= end).
    #[error("invalid time range: start {start} >= end {end}")]
    InvalidTimeRange {
        /// The start time.
        start: i64,
        /// The end time.
        end: i64,
    },

    /// A query must carry at least one matcher.
    #[error("query has no label matchers")]
    NoMatchers,

    /// A regex matcher failed to compile.
    #[error("invalid regex '{pattern}' for label '{label}': {source}")]
    InvalidRegex {
        /// The label the matcher applies to.
        label: String,
        /// The offending pattern.
        pattern: String,
        /// The compile error.
        #[source]
        source: regex::Error,
    },

    /// Reading a shard failed; no partial result is returned.
    #[error("failed to read shard {shard_id}: {source}")]
    Io {
        /// The shard being read.
        shard_id: u64,
        /// The underlying error.
        #[source]
        source: Box<StoreError>,
    },
}

/// Reasons a query is rejected before it reaches storage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// A selector uses a regex operator on the scoping label.
    #[error("regular expressions are unavailable on source ids")]
    RegexNotAllowed,

    /// A selector has no non-empty equality matcher on the scoping label.
    #[error("one or more terms lack a sourceId")]
    UnscopedSelector,

    /// The query references a source id the caller may not read.
    #[error("access to source id '{source_id}' is forbidden")]
    Forbidden {
        /// The first disallowed id.
        source_id: String,
    },

    /// The query text could not be parsed.
    #[error("failed to parse query: {0}")]
    Parse(String),

    /// The parsed query contains a node the authorizer does not understand.
    #[error("unsupported query expression: {0}")]
    UnsupportedExpression(String),
}

/// Errors from store configuration validation or loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A configuration value is out of range.
    #[error("invalid {field}: {reason}")]
    Invalid {
        /// The offending field.
        field: &'static str,
        /// Why it is invalid.
        reason: String,
    },

    /// The configuration file could not be read.
    #[error("failed to read config '{path}': {source}")]
    Read {
        /// The config file path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for [`crate::config::StoreConfig`].
    #[error("failed to parse config '{path}': {source}")]
    Parse {
        /// The config file path.
        path: String,
        /// The underlying JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// Errors from the remote rule manager API.
#[cfg(feature = "remote-rules")]
#[derive(Error, Debug)]
pub enum RuleError {
    /// A manager with this id already exists.
    #[error("rule manager '{id}' already exists")]
    AlreadyExists {
        /// The manager id.
        id: String,
    },

    /// The API answered with an error status.
    #[error("rules API returned status {status}: {title}")]
    Api {
        /// The HTTP status code.
        status: u16,
        /// The first error title from the body, or the raw body.
        title: String,
    },

    /// Failed to create the HTTP client.
    #[error("failed to create HTTP client: {source}")]
    ClientCreate {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },

    /// The base URL and path do not form a valid request URL.
    #[error("invalid rules API url '{url}': {reason}")]
    InvalidUrl {
        /// The URL that was rejected.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The request or its response body failed in transit.
    #[error("rules API request failed: {source}")]
    Transport {
        /// The underlying reqwest error.
        #[source]
        source: reqwest::Error,
    },
}

#[cfg(feature = "remote-rules")]
impl RuleError {
    /// Returns `true` if retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Api { status, .. } => *status >= 500,
            Self::AlreadyExists { .. } | Self::ClientCreate { .. } | Self::InvalidUrl { .. } => {
                false
            }
        }
    }
}

/// Type alias for `Result<T, MetricStoreError>`.
pub type Result<T> = std::result::Result<T, MetricStoreError>;
