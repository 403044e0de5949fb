//! Per-series field storage.
//!
//! One time-series store exists per tag combination. It owns the field
//! stores of that series (a sorted vector keyed by field id) behind its own
//! mutex, so two writers to the same series serialize here while writers to
//! different series never meet. The metric-store lock is *not* held while a
//! series is written; field-id resolution reaches back into the metric
//! store through [`FieldIdResolver`].

use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;

use emberdb_core::Metric;

use crate::database::WriteContext;
use crate::error::Result;
use crate::field_store::FieldStore;
use crate::flush::MetricsDataFlusher;
use crate::generator::IdGenerator;
use crate::now_ms;

/// Resolves a field name to its id, creating metadata on first sight.
/// Implemented by the metric store.
pub trait FieldIdResolver {
    fn field_id_or_generate(
        &self,
        field_name: &str,
        field_type: emberdb_core::FieldType,
        generator: &dyn IdGenerator,
    ) -> Result<u16>;
}

#[derive(Debug)]
pub struct TimeSeriesStore {
    /// Sorted ascending by field id.
    field_stores: Mutex<Vec<FieldStore>>,
    /// Epoch ms of the last write, drives eviction.
    last_used: AtomicI64,
}

impl Default for TimeSeriesStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSeriesStore {
    pub fn new() -> TimeSeriesStore {
        TimeSeriesStore {
            field_stores: Mutex::new(Vec::new()),
            last_used: AtomicI64::new(now_ms()),
        }
    }

    /// Write every field of a metric point. Fields whose id cannot be
    /// resolved fail the whole write; size growth of fields already written
    /// is still reported so the caller's accounting stays correct.
    pub fn write_fields(
        &self,
        metric: &Metric,
        ctx: &WriteContext<'_>,
        resolver: &dyn FieldIdResolver,
        generator: &dyn IdGenerator,
    ) -> Result<usize> {
        self.last_used.store(now_ms(), Ordering::Relaxed);
        let mut grown = 0;
        let mut stores = self.field_stores.lock();
        for field in &metric.fields {
            let field_id =
                resolver.field_id_or_generate(&field.name, field.value.field_type(), generator)?;
            let idx = match stores.binary_search_by_key(&field_id, |fs| fs.field_id()) {
                Ok(idx) => idx,
                Err(idx) => {
                    stores.insert(idx, FieldStore::new(field_id));
                    grown += std::mem::size_of::<FieldStore>();
                    idx
                }
            };
            grown += stores[idx].write(&field.value, ctx);
        }
        Ok(grown)
    }

    /// Flush this series' data for one family. Returns the bytes reclaimed.
    pub fn flush_series_to(
        &self,
        flusher: &mut dyn MetricsDataFlusher,
        family_time: i64,
        block_store: &crate::block_store::BlockStore,
    ) -> usize {
        let mut stores = self.field_stores.lock();
        stores
            .iter_mut()
            .map(|fs| fs.flush_field_to(flusher, family_time, block_store))
            .sum()
    }

    /// Which of the requested field ids exist on this series.
    pub fn fields_present(&self, field_ids: &[u16]) -> Vec<u16> {
        let stores = self.field_stores.lock();
        field_ids
            .iter()
            .copied()
            .filter(|id| stores.binary_search_by_key(id, |fs| fs.field_id()).is_ok())
            .collect()
    }

    pub fn is_expired(&self, ttl_ms: i64, now: i64) -> bool {
        self.last_used.load(Ordering::Relaxed) + ttl_ms < now
    }

    /// True when no field holds any segment.
    pub fn is_no_data(&self) -> bool {
        self.field_stores
            .lock()
            .iter()
            .all(|fs| fs.segments_count() == 0)
    }

    pub fn mem_size(&self) -> usize {
        std::mem::size_of::<TimeSeriesStore>()
            + self
                .field_stores
                .lock()
                .iter()
                .map(|fs| fs.mem_size())
                .sum::<usize>()
    }

    #[cfg(test)]
    pub(crate) fn insert_field_store(&self, field_id: u16) {
        let mut stores = self.field_stores.lock();
        if let Err(idx) = stores.binary_search_by_key(&field_id, |fs| fs.field_id()) {
            stores.insert(idx, FieldStore::new(field_id));
        }
    }

    #[cfg(test)]
    pub(crate) fn set_last_used(&self, epoch_ms: i64) {
        self.last_used.store(epoch_ms, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_store::BlockStore;
    use crate::generator::SequenceIdGenerator;
    use emberdb_core::{Field, FieldValue};
    use std::collections::BTreeMap;

    struct FixedResolver;

    impl FieldIdResolver for FixedResolver {
        fn field_id_or_generate(
            &self,
            field_name: &str,
            _field_type: emberdb_core::FieldType,
            _generator: &dyn IdGenerator,
        ) -> Result<u16> {
            Ok(field_name.len() as u16)
        }
    }

    fn metric(fields: Vec<Field>) -> Metric {
        Metric {
            name: "cpu".to_string(),
            timestamp: 0,
            tags: BTreeMap::new(),
            fields,
        }
    }

    #[test]
    fn test_write_creates_sorted_field_stores() {
        let pool = BlockStore::new(360);
        let generator = SequenceIdGenerator::new();
        let store = TimeSeriesStore::new();
        let ctx = WriteContext {
            metric_id: 1,
            family_time: 0,
            slot_index: 0,
            interval_ms: 10_000,
            block_store: &pool,
        };
        let m = metric(vec![
            Field {
                name: "abcd".to_string(),
                value: FieldValue::Sum(1.0),
            },
            Field {
                name: "ab".to_string(),
                value: FieldValue::Sum(1.0),
            },
        ]);
        let grown = store
            .write_fields(&m, &ctx, &FixedResolver, &generator)
            .unwrap();
        assert!(grown > 0);
        assert_eq!(store.fields_present(&[2, 4, 9]), vec![2, 4]);
        assert!(!store.is_no_data());
    }

    #[test]
    fn test_expiry_is_driven_by_last_used() {
        let store = TimeSeriesStore::new();
        let now = now_ms();
        assert!(!store.is_expired(60_000, now));
        store.set_last_used(now - 120_000);
        assert!(store.is_expired(60_000, now));
    }

    #[test]
    fn test_flush_series_reclaims_bytes() {
        let pool = BlockStore::new(360);
        let generator = SequenceIdGenerator::new();
        let store = TimeSeriesStore::new();
        let ctx = WriteContext {
            metric_id: 1,
            family_time: 0,
            slot_index: 3,
            interval_ms: 10_000,
            block_store: &pool,
        };
        let m = metric(vec![Field {
            name: "f1".to_string(),
            value: FieldValue::Sum(1.0),
        }]);
        store
            .write_fields(&m, &ctx, &FixedResolver, &generator)
            .unwrap();

        let mut flusher = crate::flush::mock::RecordingDataFlusher::default();
        let reclaimed = store.flush_series_to(&mut flusher, 0, &pool);
        assert!(reclaimed > 0);
        assert!(store.is_no_data());
    }
}
