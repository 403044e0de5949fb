//! Flusher traits consumed by the store.
//!
//! The columnar file subsystem implements these; the store only drives the
//! call sequence. Three artifact kinds leave the store per flush pass:
//!
//! - **metrics data** — per (metric, family): field metas, then per series
//!   the encoded slot blocks per field, closed by the series id, closed by
//!   the metric id;
//! - **forward index** — per metric and index version: (tag value, bitmap)
//!   pairs per key, the key, then the version with its observed time range;
//! - **inverted index** — per (tag key, tag value): one bitmap per index
//!   version that contains the value, then the value, closed by the
//!   generated tag-key id.
//!
//! Every method that can touch storage returns `Result`; an error cancels
//! the flush pass and bubbles to the scheduler.

use bytes::Bytes;
use roaring::RoaringBitmap;

use emberdb_core::{TimeRange, Version};

use crate::error::Result;
use crate::metric_store::FieldMeta;

/// Receives the data blocks of one family flush.
pub trait MetricsDataFlusher {
    fn flush_field_metas(&mut self, metas: &[FieldMeta]);

    /// One encoded slot block: `[start_slot u16][end_slot u16][presence
    /// bitmap][f64 values]`, all big-endian.
    fn flush_field(&mut self, field_id: u16, data: Bytes);

    /// Closes the fields of one series.
    fn flush_series(&mut self, series_id: u32);

    /// Closes one metric.
    fn flush_metric(&mut self, metric_id: u32) -> Result<()>;

    fn commit(&mut self) -> Result<()>;
}

/// Receives the seriesID → tag values mapping.
pub trait ForwardIndexFlusher {
    fn flush_tag_value(&mut self, tag_value: &str, series_ids: &RoaringBitmap);

    /// Closes the values of one tag key.
    fn flush_tag_key(&mut self, tag_key: &str);

    /// Closes one index version with the time range it observed.
    fn flush_version(&mut self, version: Version, time_range: TimeRange);

    /// Closes one metric.
    fn flush_metric_id(&mut self, metric_id: u32) -> Result<()>;

    fn commit(&mut self) -> Result<()>;
}

/// Receives the (tag key, tag value) → series bitmap mapping.
pub trait InvertedIndexFlusher {
    fn flush_version(&mut self, version: Version, time_range: TimeRange, series_ids: &RoaringBitmap);

    /// Closes the versions of one tag value.
    fn flush_tag_value(&mut self, tag_value: &str);

    /// Closes one tag key by its generated id.
    fn flush_tag_key_id(&mut self, tag_key_id: u32) -> Result<()>;

    fn commit(&mut self) -> Result<()>;
}
