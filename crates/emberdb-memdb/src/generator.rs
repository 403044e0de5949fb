//! ID generation seam.
//!
//! Metric, field, and tag-key ids are owned by the metadata index, which
//! lives outside this crate. The store only needs three lookups, all of
//! which create on miss, so the seam is one trait. [`SequenceIdGenerator`]
//! is the in-process implementation used by tests and single-node setups.

use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;

use emberdb_core::FieldType;

use crate::error::{Error, Result};

/// Generates stable ids for metric names, field names, and tag keys.
///
/// Implementations must be thread-safe: every write path thread resolves
/// ids through a shared reference.
pub trait IdGenerator: Send + Sync {
    /// Id for a metric name, created on first sight.
    fn gen_metric_id(&self, metric_name: &str) -> u32;

    /// Id for a field of a metric. Fails with [`Error::WrongFieldType`]
    /// when the name was registered before under a different kind.
    fn gen_field_id(&self, metric_id: u32, field_name: &str, field_type: FieldType)
        -> Result<u16>;

    /// Id for a tag key of a metric, created on first sight.
    fn gen_tag_key_id(&self, metric_id: u32, tag_key: &str) -> u32;
}

/// In-memory sequence-based id generator.
#[derive(Debug, Default)]
pub struct SequenceIdGenerator {
    metric_ids: DashMap<String, u32>,
    field_ids: DashMap<(u32, String), (u16, FieldType)>,
    tag_key_ids: DashMap<(u32, String), u32>,
    next_metric_id: AtomicU32,
    next_field_id: AtomicU32,
    next_tag_key_id: AtomicU32,
}

impl SequenceIdGenerator {
    pub fn new() -> SequenceIdGenerator {
        SequenceIdGenerator::default()
    }
}

impl IdGenerator for SequenceIdGenerator {
    fn gen_metric_id(&self, metric_name: &str) -> u32 {
        if let Some(id) = self.metric_ids.get(metric_name) {
            return *id;
        }
        *self
            .metric_ids
            .entry(metric_name.to_string())
            .or_insert_with(|| self.next_metric_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn gen_field_id(
        &self,
        metric_id: u32,
        field_name: &str,
        field_type: FieldType,
    ) -> Result<u16> {
        let entry = self
            .field_ids
            .entry((metric_id, field_name.to_string()))
            .or_insert_with(|| {
                let id = self.next_field_id.fetch_add(1, Ordering::SeqCst) + 1;
                (id as u16, field_type)
            });
        let (id, registered) = *entry;
        if registered != field_type {
            return Err(Error::WrongFieldType {
                field: field_name.to_string(),
            });
        }
        Ok(id)
    }

    fn gen_tag_key_id(&self, metric_id: u32, tag_key: &str) -> u32 {
        *self
            .tag_key_ids
            .entry((metric_id, tag_key.to_string()))
            .or_insert_with(|| self.next_tag_key_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_ids_are_stable() {
        let generator = SequenceIdGenerator::new();
        let a = generator.gen_metric_id("cpu");
        let b = generator.gen_metric_id("mem");
        assert_ne!(a, b);
        assert_eq!(generator.gen_metric_id("cpu"), a);
    }

    #[test]
    fn test_field_id_type_conflict() {
        let generator = SequenceIdGenerator::new();
        let id = generator.gen_field_id(1, "f1", FieldType::Sum).unwrap();
        assert_eq!(generator.gen_field_id(1, "f1", FieldType::Sum).unwrap(), id);
        assert_eq!(
            generator.gen_field_id(1, "f1", FieldType::Min),
            Err(Error::WrongFieldType {
                field: "f1".to_string()
            })
        );
    }

    #[test]
    fn test_tag_key_ids_scoped_by_metric() {
        let generator = SequenceIdGenerator::new();
        let a = generator.gen_tag_key_id(1, "host");
        let b = generator.gen_tag_key_id(2, "host");
        assert_ne!(a, b);
        assert_eq!(generator.gen_tag_key_id(1, "host"), a);
    }
}
