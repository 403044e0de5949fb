//! Capacity limits and flush watermarks.

/// Tag-combination cap applied to a metric store when no explicit limit has
/// been pushed down.
pub const DEFAULT_MAX_TAGS_LIMIT: u32 = 10_000_000;

/// Distinct tag keys allowed per metric.
pub const MAX_TAG_KEYS_COUNT: usize = 512;

/// Distinct field names allowed per metric.
pub const MAX_FIELDS_COUNT: usize = 1024;

/// Cap on prefix-suggestion results.
pub const MAX_SUGGESTIONS: usize = 10_000;

/// Bucket count of the metric-store sharding map. Power of two; the low
/// bits of the 64-bit name hash select the bucket.
pub const SHARDING_COUNT: usize = 32;
pub const SHARDING_MASK: u64 = (SHARDING_COUNT as u64) - 1;

/// Process memory percentages that start and stop watermark flushing.
pub const MEMORY_HIGH_WATERMARK: u8 = 80;
pub const MEMORY_LOW_WATERMARK: u8 = 60;

/// Per-shard byte size that triggers a flush on its own.
pub const SHARD_MEMORY_USED_THRESHOLD: usize = 500 * 1024 * 1024;

/// Parallel flushers run by the watermark watcher.
pub const FLUSH_CONCURRENCY: usize = 4;

/// How long a series may sit without writes before the evictor may drop it
/// (provided it also holds no data).
pub const DEFAULT_SERIES_TTL_MS: i64 = 5 * 60 * 1000;
