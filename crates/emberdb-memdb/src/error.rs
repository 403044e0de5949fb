//! Error types for the in-memory metric store.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// The metric reached its tag-combination limit; the write is rejected.
    #[error("too many tag combinations for metric")]
    TooManyTags,

    /// The metric reached the distinct tag-key limit.
    #[error("too many tag keys for metric")]
    TooManyTagKeys,

    /// The metric reached the distinct field-name limit.
    #[error("too many fields for metric")]
    TooManyFields,

    /// A field name was reused with a different kind.
    #[error("wrong type for field {field}")]
    WrongFieldType { field: String },

    /// Metric id, tag key, or version lookup miss.
    #[error("not found")]
    NotFound,

    /// ResetVersion while the immutable slot is still occupied.
    #[error("reset version unavailable: immutable index not yet flushed")]
    ResetVersionUnavailable,

    #[error("metric {0} does not exist")]
    MetricNotFound(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Surfaced by flusher implementations; cancels the current flush pass.
    #[error("flush failed: {0}")]
    Flush(String),
}
