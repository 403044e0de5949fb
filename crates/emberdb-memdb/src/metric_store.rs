//! Per-metric store: two index versions plus field metadata.
//!
//! A metric store holds a mutable [`TagIndex`] behind a read-write lock and
//! an optional immutable one behind an atomic cell. `reset_version`
//! promotes the mutable index into the immutable slot; the flush pass
//! drains the slot back to `None`. Readers see the immutable index through
//! a lock-free load, and since a promoted index is never structurally
//! mutated again, both the flusher and in-flight queries can hold it for as
//! long as they need.
//!
//! Field metadata is a copy-on-write list published through an atomic cell:
//! the read path never locks, the create path clones, inserts, and
//! republishes under a small mutex.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::{Mutex, RwLock};
use roaring::RoaringBitmap;

use emberdb_core::{FieldType, Metric, MultiVersionSeriesIdSet, Version};

use crate::block_store::BlockStore;
use crate::constants::{DEFAULT_MAX_TAGS_LIMIT, MAX_FIELDS_COUNT, MAX_SUGGESTIONS};
use crate::database::WriteContext;
use crate::error::{Error, Result};
use crate::filter::TagFilter;
use crate::flush::{ForwardIndexFlusher, InvertedIndexFlusher, MetricsDataFlusher};
use crate::generator::IdGenerator;
use crate::now_ms;
use crate::scan::{ScanContext, ScanEvent};
use crate::tag_index::TagIndex;
use crate::time_series_store::FieldIdResolver;

/// Metadata of one field of a metric. Append-only per metric; the id is
/// assigned by the [`IdGenerator`] and persisted on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMeta {
    pub id: u16,
    pub field_type: FieldType,
    pub name: String,
}

pub struct MetricStore {
    metric_id: u32,
    /// Active index taking writes.
    mutable: RwLock<TagIndex>,
    /// Promoted index awaiting flush; `None` when the slot is empty.
    immutable: ArcSwapOption<TagIndex>,
    /// Sorted by field name; replaced wholesale on insert.
    field_metas: ArcSwap<Vec<FieldMeta>>,
    /// Serializes field-meta creation.
    meta_lock: Mutex<()>,
    max_tags_limit: AtomicU32,
    /// Bytes owned by this store, mutable and immutable halves included.
    size: AtomicI64,
}

impl MetricStore {
    pub fn new(metric_id: u32) -> MetricStore {
        let mutable = TagIndex::new(Version(now_ms()));
        let size = std::mem::size_of::<MetricStore>() + mutable.mem_size();
        MetricStore {
            metric_id,
            mutable: RwLock::new(mutable),
            immutable: ArcSwapOption::const_empty(),
            field_metas: ArcSwap::from_pointee(Vec::new()),
            meta_lock: Mutex::new(()),
            max_tags_limit: AtomicU32::new(DEFAULT_MAX_TAGS_LIMIT),
            size: AtomicI64::new(size as i64),
        }
    }

    pub fn metric_id(&self) -> u32 {
        self.metric_id
    }

    pub fn set_max_tags_limit(&self, limit: u32) {
        self.max_tags_limit.store(limit, Ordering::Relaxed);
    }

    fn is_full(&self) -> bool {
        self.tags_used() >= self.max_tags_limit.load(Ordering::Relaxed)
    }

    /// Live series count of the mutable index.
    pub fn tags_in_use(&self) -> usize {
        self.mutable.read().tags_in_use()
    }

    /// Series ever created in the mutable index, evicted ones included.
    pub fn tags_used(&self) -> u32 {
        self.mutable.read().tags_used()
    }

    /// True when every series was evicted and nothing awaits flush.
    pub fn is_empty(&self) -> bool {
        self.tags_in_use() == 0 && self.immutable.load().is_none()
    }

    pub fn mem_size(&self) -> usize {
        self.size.load(Ordering::Relaxed).max(0) as usize
    }

    /// Write one metric point. Returns the bytes the store grew by.
    pub fn write(
        &self,
        metric: &Metric,
        ctx: &WriteContext<'_>,
        generator: &dyn IdGenerator,
    ) -> Result<usize> {
        if self.is_full() {
            return Err(Error::TooManyTags);
        }
        let signature = metric.tag_signature();
        let existing = self.mutable.read().get_series(&signature);
        let (store, created) = match existing {
            Some(store) => (store, 0),
            None => self.mutable.write().get_or_create_series(metric)?,
        };
        if created > 0 {
            self.size.fetch_add(created as i64, Ordering::Relaxed);
        }
        let written = store.write_fields(metric, ctx, self, generator)?;
        self.mutable.read().update_time_range(ctx.point_time());
        self.size.fetch_add(written as i64, Ordering::Relaxed);
        Ok(written + created)
    }

    /// Promote the mutable index into the immutable slot and install a
    /// fresh mutable one. Fails while a previous promotion awaits flush.
    pub fn reset_version(&self) -> Result<usize> {
        if self.immutable.load().is_some() {
            return Err(Error::ResetVersionUnavailable);
        }
        let mut mutable = self.mutable.write();
        if self.immutable.load().is_some() {
            return Err(Error::ResetVersionUnavailable);
        }
        let next = Version(now_ms().max(mutable.version().0 + 1));
        let promoted = std::mem::replace(&mut *mutable, TagIndex::new(next));
        self.immutable.store(Some(Arc::new(promoted)));
        let created = mutable.mem_size();
        self.size.fetch_add(created as i64, Ordering::Relaxed);
        Ok(created)
    }

    /// Two-pass eviction of series that are expired and hold no data.
    /// Returns the bytes reclaimed.
    pub fn evict(&self, ttl_ms: i64, now: i64) -> usize {
        let candidates: Vec<u32> = {
            let mutable = self.mutable.read();
            mutable
                .all_series()
                .into_iter()
                .filter(|(_, store)| store.is_expired(ttl_ms, now) && store.is_no_data())
                .map(|(series_id, _)| series_id)
                .collect()
        };
        if candidates.is_empty() {
            return 0;
        }

        let mut mutable = self.mutable.write();
        let confirmed: Vec<u32> = candidates
            .into_iter()
            .filter(|series_id| {
                mutable
                    .get_series_by_id(*series_id)
                    .map(|store| store.is_expired(ttl_ms, now) && store.is_no_data())
                    .unwrap_or(false)
            })
            .collect();
        let evicted: usize = mutable
            .remove_series(&confirmed)
            .iter()
            .map(|store| store.mem_size())
            .sum();
        self.size.fetch_sub(evicted as i64, Ordering::Relaxed);
        evicted
    }

    /// Flush the slot data of both index versions for one family, mutable
    /// first so versions land on disk in ascending order, then drop the
    /// immutable index. Returns the bytes reclaimed.
    pub fn flush_metrics_data_to(
        &self,
        flusher: &mut dyn MetricsDataFlusher,
        family_time: i64,
        block_store: &BlockStore,
    ) -> Result<usize> {
        flusher.flush_field_metas(&self.field_metas.load());

        let mut flushed = {
            let mutable = self.mutable.read();
            mutable.flush_version_data_to(flusher, family_time, block_store)
        };
        let immutable = self.immutable.swap(None);
        if let Some(immutable) = immutable {
            // the whole promoted index goes away with this flush
            flushed += immutable.mem_size();
            immutable.flush_version_data_to(flusher, family_time, block_store);
        }
        self.size.fetch_sub(flushed as i64, Ordering::Relaxed);
        flusher.flush_metric(self.metric_id)?;
        Ok(flushed)
    }

    /// Flush the seriesID → tag values mapping of both index versions.
    pub fn flush_forward_index_to(&self, flusher: &mut dyn ForwardIndexFlusher) -> Result<()> {
        fn flush_index(index: &TagIndex, flusher: &mut dyn ForwardIndexFlusher) {
            for entry in index.entry_sets() {
                for (value, bitmap) in &entry.values {
                    flusher.flush_tag_value(value, bitmap);
                }
                flusher.flush_tag_key(&entry.key);
            }
            flusher.flush_version(index.version(), index.time_range());
        }

        let immutable = self.immutable.load_full();
        {
            let mutable = self.mutable.read();
            flush_index(&mutable, flusher);
        }
        if let Some(immutable) = immutable {
            flush_index(&immutable, flusher);
        }
        flusher.flush_metric_id(self.metric_id)
    }

    /// Flush the (tag key, tag value) → series bitmaps of both index
    /// versions, grouped so each value appears once across versions.
    pub fn flush_inverted_index_to(
        &self,
        flusher: &mut dyn InvertedIndexFlusher,
        generator: &dyn IdGenerator,
    ) -> Result<()> {
        use std::collections::BTreeMap;

        let immutable = self.immutable.load_full();
        let mutable = self.mutable.read();

        // tag key -> every value either version knows
        let mut key_values: BTreeMap<String, std::collections::BTreeSet<String>> = BTreeMap::new();
        let mut collect = |index: &TagIndex| {
            for entry in index.entry_sets() {
                let values = key_values.entry(entry.key.clone()).or_default();
                for value in entry.values.keys() {
                    values.insert(value.clone());
                }
            }
        };
        if let Some(immutable) = immutable.as_deref() {
            collect(immutable);
        }
        collect(&mutable);

        for (key, values) in &key_values {
            for value in values {
                if let Some(immutable) = immutable.as_deref() {
                    Self::flush_inverted_value(immutable, key, value, flusher);
                }
                Self::flush_inverted_value(&mutable, key, value, flusher);
                flusher.flush_tag_value(value);
            }
            flusher.flush_tag_key_id(generator.gen_tag_key_id(self.metric_id, key))?;
        }
        Ok(())
    }

    fn flush_inverted_value(
        index: &TagIndex,
        key: &str,
        value: &str,
        flusher: &mut dyn InvertedIndexFlusher,
    ) {
        if let Some(entry) = index.get_entry(key) {
            if let Some(bitmap) = entry.values.get(value) {
                flusher.flush_version(index.version(), index.time_range(), bitmap);
            }
        }
    }

    /// Evaluate a tag filter across both index versions.
    pub fn find_series_ids_by_expr(&self, expr: &TagFilter) -> MultiVersionSeriesIdSet {
        let mut set = MultiVersionSeriesIdSet::new();
        {
            let mutable = self.mutable.read();
            let bitmap = mutable.find_series_ids_by_expr(expr);
            if !bitmap.is_empty() {
                set.add(mutable.version(), bitmap);
            }
        }
        if let Some(immutable) = self.immutable.load_full() {
            let bitmap = immutable.find_series_ids_by_expr(expr);
            if !bitmap.is_empty() {
                set.add(immutable.version(), bitmap);
            }
        }
        set
    }

    /// Every series carrying one tag key, across both index versions.
    pub fn get_series_ids_for_tag(&self, tag_key: &str) -> MultiVersionSeriesIdSet {
        let mut set = MultiVersionSeriesIdSet::new();
        {
            let mutable = self.mutable.read();
            if let Some(bitmap) = mutable.series_ids_for_tag(tag_key) {
                if !bitmap.is_empty() {
                    set.add(mutable.version(), bitmap);
                }
            }
        }
        if let Some(immutable) = self.immutable.load_full() {
            if let Some(bitmap) = immutable.series_ids_for_tag(tag_key) {
                if !bitmap.is_empty() {
                    set.add(immutable.version(), bitmap);
                }
            }
        }
        set
    }

    /// Forward lookup: tag values per series id for one index version.
    /// Fails when the version is not live or a requested key is unknown.
    pub fn get_tag_values(
        &self,
        tag_keys: &[String],
        version: Version,
        series_ids: &RoaringBitmap,
    ) -> Result<HashMap<u32, Vec<String>>> {
        let immutable = self.immutable.load_full();
        let mutable = self.mutable.read();
        let index: &TagIndex = if mutable.version() == version {
            &mutable
        } else {
            match immutable.as_deref() {
                Some(immutable) if immutable.version() == version => immutable,
                _ => return Err(Error::NotFound),
            }
        };

        for key in tag_keys {
            if index.get_entry(key).is_none() {
                return Err(Error::NotFound);
            }
        }

        let mut result = HashMap::new();
        for series_id in series_ids {
            let mut values = Vec::with_capacity(tag_keys.len());
            for key in tag_keys {
                let entry = index.get_entry(key);
                let value = entry
                    .and_then(|entry| {
                        entry
                            .values
                            .iter()
                            .find(|(_, bitmap)| bitmap.contains(series_id))
                            .map(|(value, _)| value.clone())
                    })
                    .unwrap_or_default();
                values.push(value);
            }
            result.insert(series_id, values);
        }
        Ok(result)
    }

    /// Tag keys matching a prefix, across both index versions.
    pub fn suggest_tag_keys(&self, prefix: &str, limit: usize) -> Vec<String> {
        let limit = limit.min(MAX_SUGGESTIONS);
        if limit == 0 {
            return Vec::new();
        }
        let mut keys = std::collections::BTreeSet::new();
        let mut collect = |index: &TagIndex| {
            for entry in index.entry_sets() {
                if keys.len() >= limit {
                    return;
                }
                if entry.key.starts_with(prefix) {
                    keys.insert(entry.key.clone());
                }
            }
        };
        {
            let mutable = self.mutable.read();
            collect(&mutable);
        }
        if let Some(immutable) = self.immutable.load_full() {
            collect(&immutable);
        }
        keys.into_iter().collect()
    }

    /// Values of one tag key matching a prefix, across both index versions.
    pub fn suggest_tag_values(&self, tag_key: &str, prefix: &str, limit: usize) -> Vec<String> {
        let limit = limit.min(MAX_SUGGESTIONS);
        if limit == 0 {
            return Vec::new();
        }
        let mut values = std::collections::BTreeSet::new();
        let mut collect = |index: &TagIndex| {
            if let Some(entry) = index.get_entry(tag_key) {
                for value in entry.values.keys() {
                    if values.len() >= limit {
                        return;
                    }
                    if value.starts_with(prefix) {
                        values.insert(value.clone());
                    }
                }
            }
        };
        {
            let mutable = self.mutable.read();
            collect(&mutable);
        }
        if let Some(immutable) = self.immutable.load_full() {
            collect(&immutable);
        }
        values.into_iter().collect()
    }

    /// Emit one event per matching series; see [`crate::scan`].
    pub fn scan(&self, ctx: &mut ScanContext<'_>) {
        let metas = self.field_metas.load();
        for field_id in &ctx.field_ids {
            if !metas.iter().any(|meta| meta.id == *field_id) {
                return;
            }
        }

        fn scan_index(index: &TagIndex, ctx: &mut ScanContext<'_>) {
            let Some(bitmap) = ctx.series_id_set.get(index.version()) else {
                return;
            };
            for series_id in bitmap {
                let Some(store) = index.get_series_by_id(series_id) else {
                    continue;
                };
                let present = store.fields_present(&ctx.field_ids);
                if !present.is_empty() {
                    ctx.worker.emit(ScanEvent {
                        version: index.version(),
                        series_id,
                        field_ids: present,
                    });
                }
            }
        }

        {
            let mutable = self.mutable.read();
            scan_index(&mutable, ctx);
        }
        if let Some(immutable) = self.immutable.load_full() {
            scan_index(&immutable, ctx);
        }
    }

    #[cfg(test)]
    pub(crate) fn set_field_metas(&self, metas: Vec<FieldMeta>) {
        self.field_metas.store(Arc::new(metas));
    }

    #[cfg(test)]
    pub(crate) fn install_mutable(&self, index: TagIndex) {
        *self.mutable.write() = index;
    }

    #[cfg(test)]
    pub(crate) fn install_immutable(&self, index: TagIndex) {
        self.immutable.store(Some(Arc::new(index)));
    }

    #[cfg(test)]
    pub(crate) fn age_series_for_test(&self, last_used_ms: i64) {
        let mutable = self.mutable.read();
        for (_, series) in mutable.all_series() {
            series.set_last_used(last_used_ms);
        }
    }
}

impl FieldIdResolver for MetricStore {
    fn field_id_or_generate(
        &self,
        field_name: &str,
        field_type: FieldType,
        generator: &dyn IdGenerator,
    ) -> Result<u16> {
        let metas = self.field_metas.load();
        if let Some(meta) = metas.iter().find(|meta| meta.name == field_name) {
            if meta.field_type == field_type {
                return Ok(meta.id);
            }
            return Err(Error::WrongFieldType {
                field: field_name.to_string(),
            });
        }
        if metas.len() >= MAX_FIELDS_COUNT {
            return Err(Error::TooManyFields);
        }

        let _guard = self.meta_lock.lock();
        let metas = self.field_metas.load();
        if let Some(meta) = metas.iter().find(|meta| meta.name == field_name) {
            if meta.field_type == field_type {
                return Ok(meta.id);
            }
            return Err(Error::WrongFieldType {
                field: field_name.to_string(),
            });
        }
        let id = generator.gen_field_id(self.metric_id, field_name, field_type)?;
        let mut next = metas.as_ref().clone();
        let insert_at = next
            .binary_search_by(|meta| meta.name.as_str().cmp(field_name))
            .unwrap_err();
        next.insert(
            insert_at,
            FieldMeta {
                id,
                field_type,
                name: field_name.to_string(),
            },
        );
        self.field_metas.store(Arc::new(next));
        self.size.fetch_add(
            (std::mem::size_of::<FieldMeta>() + field_name.len()) as i64,
            Ordering::Relaxed,
        );
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flush::mock::{
        DataCall, ForwardCall, InvertedCall, RecordingDataFlusher, RecordingForwardFlusher,
        RecordingInvertedFlusher,
    };
    use crate::generator::SequenceIdGenerator;
    use crate::scan::CollectingScanWorker;
    use crate::time_series_store::TimeSeriesStore;
    use emberdb_core::{Field, FieldValue};
    use std::collections::BTreeMap;

    fn sample_metric() -> Metric {
        Metric {
            name: "cpu".to_string(),
            timestamp: 0,
            tags: BTreeMap::from([("host".to_string(), "1.1.1.1".to_string())]),
            fields: vec![Field {
                name: "f1".to_string(),
                value: FieldValue::Sum(1.0),
            }],
        }
    }

    fn write_once(store: &MetricStore, block_store: &BlockStore) -> Result<usize> {
        let generator = SequenceIdGenerator::new();
        let ctx = WriteContext {
            metric_id: store.metric_id(),
            family_time: 0,
            slot_index: 20,
            interval_ms: 10_000,
            block_store,
        };
        store.write(&sample_metric(), &ctx, &generator)
    }

    #[test]
    fn test_single_write_creates_one_series() {
        let block_store = BlockStore::new(360);
        let store = MetricStore::new(10);
        let written = write_once(&store, &block_store).unwrap();
        assert!(written > 0);
        assert_eq!(store.tags_in_use(), 1);
        assert!(store.mem_size() > 0);
        assert!(!store.is_empty());
    }

    #[test]
    fn test_tag_limit_rejects_writes() {
        let block_store = BlockStore::new(360);
        let store = MetricStore::new(10);
        store.set_max_tags_limit(0);
        assert_eq!(write_once(&store, &block_store), Err(Error::TooManyTags));
    }

    #[test]
    fn test_field_type_conflict() {
        let block_store = BlockStore::new(360);
        let store = MetricStore::new(10);
        let generator = SequenceIdGenerator::new();
        let ctx = WriteContext {
            metric_id: 10,
            family_time: 0,
            slot_index: 0,
            interval_ms: 10_000,
            block_store: &block_store,
        };
        let mut metric = sample_metric();
        store.write(&metric, &ctx, &generator).unwrap();
        metric.fields[0].value = FieldValue::Min(1.0);
        assert_eq!(
            store.write(&metric, &ctx, &generator),
            Err(Error::WrongFieldType {
                field: "f1".to_string()
            })
        );
    }

    #[test]
    fn test_too_many_fields() {
        let store = MetricStore::new(10);
        let generator = SequenceIdGenerator::new();
        let metas: Vec<FieldMeta> = (0..MAX_FIELDS_COUNT)
            .map(|i| FieldMeta {
                id: i as u16,
                field_type: FieldType::Sum,
                name: format!("f{i:04}"),
            })
            .collect();
        store.set_field_metas(metas);
        assert_eq!(
            store.field_id_or_generate("one-more", FieldType::Sum, &generator),
            Err(Error::TooManyFields)
        );
    }

    #[test]
    fn test_reset_version_promotes_once() {
        let block_store = BlockStore::new(360);
        let store = MetricStore::new(10);
        write_once(&store, &block_store).unwrap();
        let old_version = store.mutable.read().version();

        store.reset_version().unwrap();
        assert!(store.immutable.load().is_some());
        assert!(store.mutable.read().version() > old_version);
        assert_eq!(store.tags_in_use(), 0);
        assert!(!store.is_empty());

        assert_eq!(store.reset_version(), Err(Error::ResetVersionUnavailable));
    }

    #[test]
    fn test_flush_drains_both_versions() {
        let block_store = BlockStore::new(360);
        let store = MetricStore::new(10);
        write_once(&store, &block_store).unwrap();
        store.reset_version().unwrap();
        // second generation of the same series in the new mutable index
        write_once(&store, &block_store).unwrap();

        let size_before = store.mem_size();
        let mut flusher = RecordingDataFlusher::default();
        let flushed = store
            .flush_metrics_data_to(&mut flusher, 0, &block_store)
            .unwrap();
        assert!(flushed > 0);
        assert!(store.mem_size() < size_before);
        assert!(store.immutable.load().is_none());

        // field metas first, metric close last, one series per version
        assert!(matches!(flusher.calls.first(), Some(DataCall::FieldMetas(_))));
        assert!(matches!(flusher.calls.last(), Some(DataCall::Metric(10))));
        let series_closes = flusher
            .calls
            .iter()
            .filter(|call| matches!(call, DataCall::Series(_)))
            .count();
        assert_eq!(series_closes, 2);
    }

    #[test]
    fn test_forward_index_flush_order() {
        let block_store = BlockStore::new(360);
        let store = MetricStore::new(10);
        write_once(&store, &block_store).unwrap();

        let mut flusher = RecordingForwardFlusher::default();
        store.flush_forward_index_to(&mut flusher).unwrap();
        assert!(matches!(
            flusher.calls.as_slice(),
            [
                ForwardCall::TagValue(_, _),
                ForwardCall::TagKey(_),
                ForwardCall::Version(_, _),
                ForwardCall::MetricId(10),
            ]
        ));
        match &flusher.calls[0] {
            ForwardCall::TagValue(value, ids) => {
                assert_eq!(value, "1.1.1.1");
                assert_eq!(ids, &vec![0u32]);
            }
            call => panic!("unexpected call {call:?}"),
        }
    }

    #[test]
    fn test_inverted_index_groups_versions() {
        let block_store = BlockStore::new(360);
        let store = MetricStore::new(10);
        let generator = SequenceIdGenerator::new();
        write_once(&store, &block_store).unwrap();
        store.reset_version().unwrap();
        write_once(&store, &block_store).unwrap();

        let mut flusher = RecordingInvertedFlusher::default();
        store
            .flush_inverted_index_to(&mut flusher, &generator)
            .unwrap();
        // one value shared by two versions: two bitmaps, one value close,
        // one key close
        let versions = flusher
            .calls
            .iter()
            .filter(|call| matches!(call, InvertedCall::Version(_, _)))
            .count();
        assert_eq!(versions, 2);
        assert_eq!(
            flusher
                .calls
                .iter()
                .filter(|call| matches!(call, InvertedCall::TagValue(_)))
                .count(),
            1
        );
        assert!(matches!(
            flusher.calls.last(),
            Some(InvertedCall::TagKeyId(_))
        ));
    }

    #[test]
    fn test_find_series_ids_across_versions() {
        let block_store = BlockStore::new(360);
        let store = MetricStore::new(10);
        write_once(&store, &block_store).unwrap();
        store.reset_version().unwrap();
        write_once(&store, &block_store).unwrap();

        let set = store.find_series_ids_by_expr(&TagFilter::eq("host", "1.1.1.1"));
        assert_eq!(set.versions().count(), 2);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_get_tag_values() {
        let block_store = BlockStore::new(360);
        let store = MetricStore::new(10);
        write_once(&store, &block_store).unwrap();
        let version = store.mutable.read().version();

        let ids = RoaringBitmap::from_iter([0u32]);
        let values = store
            .get_tag_values(&["host".to_string()], version, &ids)
            .unwrap();
        assert_eq!(values[&0], vec!["1.1.1.1".to_string()]);

        assert_eq!(
            store.get_tag_values(&["host".to_string()], Version(123), &ids),
            Err(Error::NotFound)
        );
        assert_eq!(
            store.get_tag_values(&["nope".to_string()], version, &ids),
            Err(Error::NotFound)
        );
    }

    #[test]
    fn test_suggestions() {
        let block_store = BlockStore::new(360);
        let store = MetricStore::new(10);
        write_once(&store, &block_store).unwrap();
        assert_eq!(store.suggest_tag_keys("ho", 10), vec!["host".to_string()]);
        assert!(store.suggest_tag_keys("zz", 10).is_empty());
        assert_eq!(
            store.suggest_tag_values("host", "1.", 10),
            vec!["1.1.1.1".to_string()]
        );
        assert!(store.suggest_tag_values("host", "2.", 10).is_empty());
        assert!(store.suggest_tag_keys("ho", 0).is_empty());
    }

    #[test]
    fn test_evict_removes_expired_empty_series() {
        let block_store = BlockStore::new(360);
        let store = MetricStore::new(10);
        write_once(&store, &block_store).unwrap();

        // flush the data away so the series is empty, then age it
        let mut flusher = RecordingDataFlusher::default();
        store
            .flush_metrics_data_to(&mut flusher, 0, &block_store)
            .unwrap();
        {
            let mutable = store.mutable.read();
            for (_, series) in mutable.all_series() {
                series.set_last_used(0);
            }
        }
        let evicted = store.evict(1_000, now_ms());
        assert!(evicted > 0);
        assert_eq!(store.tags_in_use(), 0);
        assert!(store.is_empty());
    }

    #[test]
    fn test_scan_emits_per_matching_series() {
        let store = MetricStore::new(100);
        store.set_field_metas(vec![
            FieldMeta {
                id: 3,
                field_type: FieldType::Sum,
                name: "sum3".to_string(),
            },
            FieldMeta {
                id: 4,
                field_type: FieldType::Sum,
                name: "sum4".to_string(),
            },
            FieldMeta {
                id: 5,
                field_type: FieldType::Sum,
                name: "sum5".to_string(),
            },
            FieldMeta {
                id: 6,
                field_type: FieldType::Sum,
                name: "sum6".to_string(),
            },
        ]);

        let ti1 = TagIndex::new(Version(1));
        let ti2 = TagIndex::new(Version(2));
        store.install_immutable(ti1);
        store.install_mutable(ti2);
        {
            let mut mutable = store.mutable.write();
            // seed the forward map with series 5..8; series 5 carries
            // field stores 1..4
            let ts5 = Arc::new(TimeSeriesStore::new());
            for field_id in 1..=4u16 {
                ts5.insert_field_store(field_id);
            }
            mutable.insert_series_for_test(5, ts5);
            mutable.insert_series_for_test(6, Arc::new(TimeSeriesStore::new()));
            mutable.insert_series_for_test(7, Arc::new(TimeSeriesStore::new()));
            mutable.insert_series_for_test(8, Arc::new(TimeSeriesStore::new()));
        }

        let mut id_set = MultiVersionSeriesIdSet::new();
        id_set.add(Version(0), RoaringBitmap::new());
        id_set.add(Version(2), RoaringBitmap::from_iter([1u32, 2, 3, 4, 5, 7]));

        // field 5 is registered but missing on the series; 3 and 4 present
        let mut worker = CollectingScanWorker::default();
        store.scan(&mut ScanContext {
            metric_id: 100,
            series_id_set: &id_set,
            field_ids: vec![3, 4, 5],
            worker: &mut worker,
        });
        assert_eq!(worker.events.len(), 1);
        assert_eq!(worker.events[0].series_id, 5);
        assert_eq!(worker.events[0].field_ids, vec![3, 4]);

        // unregistered fields: no events at all
        let mut worker = CollectingScanWorker::default();
        store.scan(&mut ScanContext {
            metric_id: 100,
            series_id_set: &id_set,
            field_ids: vec![1, 2],
            worker: &mut worker,
        });
        assert!(worker.events.is_empty());

        let mut worker = CollectingScanWorker::default();
        store.scan(&mut ScanContext {
            metric_id: 100,
            series_id_set: &id_set,
            field_ids: vec![1, 2, 3, 4],
            worker: &mut worker,
        });
        assert!(worker.events.is_empty());
    }
}
