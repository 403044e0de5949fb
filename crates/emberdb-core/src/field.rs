//! Field kinds and their aggregation rules.
//!
//! A field kind decides how two writes to the same (series, field, slot)
//! merge. The kind set is closed, so the merge is a plain match instead of a
//! trait object:
//!
//! | Kind  | Merge of `existing` and `incoming`        |
//! |-------|-------------------------------------------|
//! | Sum   | `existing + incoming`                     |
//! | Min   | `min(existing, incoming)` (idempotent)    |
//! | Max   | `max(existing, incoming)` (idempotent)    |
//! | First | `existing` (first write wins)             |
//! | Last  | `incoming` (latest write wins)            |
//!
//! Histogram fields carry a bucket vector and do not merge slot-wise; the
//! in-memory store logs and drops them.

use serde::{Deserialize, Serialize};

/// The kind of a metric field. Stable numeric ids are part of the wire
/// format and of the persisted field metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FieldType {
    Sum = 1,
    Min = 2,
    Max = 3,
    First = 4,
    Last = 5,
    Histogram = 6,
}

impl FieldType {
    pub fn from_u8(value: u8) -> Option<FieldType> {
        match value {
            1 => Some(FieldType::Sum),
            2 => Some(FieldType::Min),
            3 => Some(FieldType::Max),
            4 => Some(FieldType::First),
            5 => Some(FieldType::Last),
            6 => Some(FieldType::Histogram),
            _ => None,
        }
    }

    /// Whether a slot buffer can hold this kind.
    pub fn is_scalar(&self) -> bool {
        !matches!(self, FieldType::Histogram)
    }

    /// Merge a newly written value into an occupied slot.
    ///
    /// Histogram has no slot-wise merge; callers must not route histogram
    /// fields into slot buffers.
    pub fn agg(&self, existing: f64, incoming: f64) -> f64 {
        match self {
            FieldType::Sum => existing + incoming,
            FieldType::Min => existing.min(incoming),
            FieldType::Max => existing.max(incoming),
            FieldType::First => existing,
            FieldType::Last => incoming,
            FieldType::Histogram => unreachable!("histogram fields have no slot aggregation"),
        }
    }
}

/// A field value as it arrives in a metric point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Sum(f64),
    Min(f64),
    Max(f64),
    First(f64),
    Last(f64),
    Histogram(Vec<f64>),
}

impl FieldValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::Sum(_) => FieldType::Sum,
            FieldValue::Min(_) => FieldType::Min,
            FieldValue::Max(_) => FieldType::Max,
            FieldValue::First(_) => FieldType::First,
            FieldValue::Last(_) => FieldType::Last,
            FieldValue::Histogram(_) => FieldType::Histogram,
        }
    }

    /// The scalar payload, `None` for histograms.
    pub fn scalar(&self) -> Option<f64> {
        match self {
            FieldValue::Sum(v)
            | FieldValue::Min(v)
            | FieldValue::Max(v)
            | FieldValue::First(v)
            | FieldValue::Last(v) => Some(*v),
            FieldValue::Histogram(_) => None,
        }
    }
}
