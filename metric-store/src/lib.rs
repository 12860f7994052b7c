//! # metric-store
//!
//! Multi-tenant time-series metric storage with tenant-scoped queries.
//!
//! metric-store ingests batches of labeled points over a length-prefixed
//! binary transport, persists them in time-windowed shards on local disk, and
//! answers range queries. Every point belongs to a tenant through its
//! `source_id`; queries must name their tenants explicitly and the
//! [`QueryAuthorizer`] rejects any query that could read beyond them.
//!
//! **Status**: This crate is in early development. The API is not yet stable.
//!
//! ## Key Properties
//!
//! - Shards cover fixed time windows and are dropped whole, never truncated
//! - Background retention by age, plus oldest-first pruning under disk pressure
//! - Queries read a copy-on-write snapshot of the shard index, so eviction
//!   never pulls data out from under a running query
//! - Lossy, retry-free ingestion: undecodable frames are dropped and counted
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use metric_store::{Batch, NoopRegistrar, Point, QueryAuthorizer, Store, StoreConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Open or create a store
//! let store = Store::open("./metrics", StoreConfig::default(), Arc::new(NoopRegistrar))?;
//!
//! // Write a batch
//! let now = 1_700_000_000_000;
//! store.write(&Batch::new(vec![
//!     Point::new("app-1", "http_requests", now, 12.0).with_label("env", "prod"),
//! ]))?;
//!
//! // Parse, scope and run a query
//! let expr = metric_store::promql::parse(r#"http_requests{source_id="app-1"}"#)?;
//! let tenants = QueryAuthorizer::default().authorize(&expr, &["app-1"])?;
//! assert!(tenants.contains("app-1"));
//! for selector in expr.selectors() {
//!     let result = store.select(selector, now - 60_000, now + 1)?;
//!     println!("{} series", result.len());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`Store`]: Top-level handle; opens a directory, routes writes, answers queries
//! - [`StoreConfig`]: Retention and rotation policy
//! - [`QueryAuthorizer`]: Extracts and validates the tenants a query reads
//! - [`FrameSender`] / [`FrameReceiver`]: The ingestion wire protocol
//! - [`RetentionWorker`]: Background expiry and disk-pressure pruning
//!
//! ## Modules
//!
//! For lower-level access, the individual modules are also public:
//!
//! - [`point`]: Points and batches
//! - [`codec`]: Binary batch encoding
//! - [`transport`]: Framed ingestion over byte streams and TCP
//! - [`store`]: Store lifecycle, write routing, queries
//! - [`shard`]: One time window of data on disk
//! - [`segment`]: Append-only compressed record files
//! - [`series`]: Series identity and per-shard index
//! - [`query`]: Label matchers and result types
//! - [`retention`]: Retention passes and the background worker
//! - [`ast`]: Query syntax tree
//! - [`promql`]: PromQL parsing into the syntax tree
//! - [`auth`]: Tenant scoping for queries
//! - [`metrics`]: Metric names and registrar sinks
//! - [`config`]: Store configuration
//! - [`clock`]: Time sources
//! - [`disk`]: Free-space probes
//! - `rules`: Remote rules API client (feature `remote-rules`)
//! - [`error`]: Error types

pub mod ast;
pub mod auth;
pub mod clock;
pub mod codec;
pub mod config;
pub mod disk;
pub mod error;
pub mod metrics;
pub mod point;
pub mod promql;
pub mod query;
pub mod retention;
#[cfg(feature = "remote-rules")]
pub mod rules;
pub mod segment;
pub mod series;
pub mod shard;
pub mod store;
pub mod transport;

// Re-export primary API types at crate root for convenience.
pub use auth::QueryAuthorizer;
pub use config::StoreConfig;
pub use error::{MetricStoreError, Result};
pub use metrics::{MemoryRegistrar, MetricsRegistrar, NoopRegistrar};
pub use point::{Batch, Point};
pub use query::{LabelMatcher, MatchOp, SeriesSet};
pub use retention::RetentionWorker;
pub use store::Store;
pub use transport::{FrameReceiver, FrameSender, IngestServer};
