//! Shared leaf types for the emberdb write path.
//!
//! This crate holds everything both halves of the write path agree on:
//!
//! - the metric point model ([`Metric`], [`Field`], [`FieldValue`]) and its
//!   wire codec, used by the broker to fill replication payloads and by the
//!   storage side to decode them,
//! - field kinds and their aggregation rules ([`FieldType`]),
//! - the interval calculator that maps a timestamp to a (family, slot) pair,
//! - series-level primitives: [`Version`], [`TimeRange`],
//!   [`MultiVersionSeriesIdSet`].
//!
//! Nothing in here does I/O and nothing spawns tasks; the crate is a pure
//! data layer shared by `emberdb-memdb` and `emberdb-replication`.

pub mod error;
pub mod field;
pub mod interval;
pub mod metric;
pub mod series;
pub mod varint;

pub use error::{Error, Result};
pub use field::{FieldType, FieldValue};
pub use interval::IntervalCalc;
pub use metric::{Field, Metric, MetricList};
pub use series::{MultiVersionSeriesIdSet, TimeRange, Version};
