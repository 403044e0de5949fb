//! Per-shard in-memory metric store.
//!
//! This crate is the storage-side half of the emberdb write path: decoded
//! metric points land here, get organised by metric → tag combination →
//! field → time slot, and leave again as flush artifacts (data blocks,
//! forward index, inverted index) through the flusher traits in [`flush`].
//!
//! ## Structure
//!
//! The store is a tower of small containers, leaves first:
//!
//! ```text
//! MemoryDatabase            32 hash-sharded buckets of MetricStore
//!   └─ MetricStore          mutable TagIndex + atomic immutable slot + field metas
//!        └─ TagIndex        tag kv entry sets (inverted bitmaps) + seriesID → store
//!             └─ TimeSeriesStore   sorted FieldStore list per series
//!                  └─ FieldStore   sorted SegmentStore list per field
//!                       └─ SegmentStore   fixed-width slot buffer per family
//! ```
//!
//! Small collections (segments per field, fields per series) are sorted
//! vectors with binary search rather than maps: they hold a handful of
//! entries and churn once per family rollover.
//!
//! ## Concurrency
//!
//! Buckets and metric stores use `parking_lot` read-write locks with short
//! critical sections; all size counters are atomics, so the database-wide
//! byte size is eventually consistent and only drives flush scheduling.
//! The immutable tag index is published through an atomic cell and read
//! lock-free. The evictor is a tokio task woken by a single-slot signal
//! after every family flush.

pub mod block_store;
pub mod constants;
pub mod database;
pub mod error;
pub mod field_store;
pub mod filter;
pub mod flush;
pub mod generator;
pub mod metric_store;
pub mod scan;
pub mod segment_store;
pub mod tag_index;
pub mod time_series_store;
pub mod watcher;

pub use database::{Evictor, MemoryDatabase, MemoryDatabaseConfig};
pub use error::{Error, Result};
pub use filter::TagFilter;
pub use flush::{ForwardIndexFlusher, InvertedIndexFlusher, MetricsDataFlusher};
pub use generator::{IdGenerator, SequenceIdGenerator};
pub use metric_store::{FieldMeta, MetricStore};
pub use scan::{ScanContext, ScanEvent, ScanWorker};
pub use watcher::{FlushableShard, MemoryWatcher, WatermarkConfig};

/// Wall clock in epoch milliseconds.
pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
