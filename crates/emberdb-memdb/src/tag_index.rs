//! One version of a metric's tag index.
//!
//! A tag index owns three views of the same series population:
//!
//! - the inverted index: an ordered list of [`TagKvEntrySet`], one per tag
//!   key in first-seen order, each mapping tag value → series bitmap;
//! - the forward store: series id → [`TimeSeriesStore`];
//! - the signature map: canonical tag-combination bytes → series id, the
//!   write fast path.
//!
//! Series ids are dense and local to the index (the counter starts at zero
//! for every new version). A series is indexed under exactly one value per
//! tag key: the entry insertion in [`TagIndex::get_or_create_series`] is the
//! only writer and runs once per series.
//!
//! The index has no lock of its own; the owning metric store guards it.
//! Only the observed time range is atomic, so readers under the shared lock
//! can widen it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use regex::Regex;
use roaring::RoaringBitmap;
use tracing::warn;

use emberdb_core::{Metric, TimeRange, Version};

use crate::block_store::BlockStore;
use crate::constants::MAX_TAG_KEYS_COUNT;
use crate::error::{Error, Result};
use crate::filter::TagFilter;
use crate::flush::MetricsDataFlusher;
use crate::time_series_store::TimeSeriesStore;

/// All values of one tag key with the series carrying each value.
#[derive(Debug, Default)]
pub struct TagKvEntrySet {
    pub key: String,
    /// Ordered by value for deterministic flush output.
    pub values: std::collections::BTreeMap<String, RoaringBitmap>,
}

#[derive(Debug)]
pub struct TagIndex {
    version: Version,
    /// Tag keys in first-seen order.
    entry_sets: Vec<TagKvEntrySet>,
    series: HashMap<u32, Arc<TimeSeriesStore>>,
    signature_to_series: HashMap<Vec<u8>, u32>,
    /// Next series id; also the count of series ever created here.
    id_counter: u32,
    /// Observed point-time bounds as offsets to the version, epoch ms.
    earliest_delta: AtomicI64,
    latest_delta: AtomicI64,
}

impl TagIndex {
    pub fn new(version: Version) -> TagIndex {
        TagIndex {
            version,
            entry_sets: Vec::new(),
            series: HashMap::new(),
            signature_to_series: HashMap::new(),
            id_counter: 0,
            earliest_delta: AtomicI64::new(i64::MAX),
            latest_delta: AtomicI64::new(i64::MIN),
        }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Live series count.
    pub fn tags_in_use(&self) -> usize {
        self.series.len()
    }

    /// Series ever created, including evicted ones. Drives the tag limit.
    pub fn tags_used(&self) -> u32 {
        self.id_counter
    }

    /// Fast-path lookup by canonical tag signature.
    pub fn get_series(&self, signature: &[u8]) -> Option<Arc<TimeSeriesStore>> {
        let id = self.signature_to_series.get(signature)?;
        self.series.get(id).cloned()
    }

    pub fn get_series_by_id(&self, series_id: u32) -> Option<Arc<TimeSeriesStore>> {
        self.series.get(&series_id).cloned()
    }

    /// Look up or create the series of a tag combination. Returns the store
    /// and the bytes created (zero when the series existed).
    pub fn get_or_create_series(
        &mut self,
        metric: &Metric,
    ) -> Result<(Arc<TimeSeriesStore>, usize)> {
        let signature = metric.tag_signature();
        if let Some(store) = self.get_series(&signature) {
            return Ok((store, 0));
        }

        let new_keys = metric
            .tags
            .keys()
            .filter(|key| !self.entry_sets.iter().any(|e| &e.key == *key))
            .count();
        if self.entry_sets.len() + new_keys > MAX_TAG_KEYS_COUNT {
            return Err(Error::TooManyTagKeys);
        }

        let series_id = self.id_counter;
        self.id_counter += 1;

        let mut created = std::mem::size_of::<TimeSeriesStore>() + signature.len() * 2;
        for (key, value) in &metric.tags {
            let idx = match self.entry_sets.iter().position(|e| &e.key == key) {
                Some(idx) => idx,
                None => {
                    created += std::mem::size_of::<TagKvEntrySet>() + key.len();
                    self.entry_sets.push(TagKvEntrySet {
                        key: key.clone(),
                        values: Default::default(),
                    });
                    self.entry_sets.len() - 1
                }
            };
            let bitmap = self.entry_sets[idx]
                .values
                .entry(value.clone())
                .or_insert_with(|| {
                    created += value.len() + std::mem::size_of::<RoaringBitmap>();
                    RoaringBitmap::new()
                });
            bitmap.insert(series_id);
        }

        let store = Arc::new(TimeSeriesStore::new());
        created += store.mem_size();
        self.series.insert(series_id, store.clone());
        self.signature_to_series.insert(signature, series_id);
        Ok((store, created))
    }

    /// Remove series from every view. Returns the removed stores so the
    /// caller can account their sizes.
    pub fn remove_series(&mut self, series_ids: &[u32]) -> Vec<Arc<TimeSeriesStore>> {
        let mut removed = Vec::new();
        for series_id in series_ids {
            if let Some(store) = self.series.remove(series_id) {
                removed.push(store);
            }
        }
        if removed.is_empty() {
            return removed;
        }
        let gone: RoaringBitmap = series_ids.iter().copied().collect();
        self.signature_to_series
            .retain(|_, id| !gone.contains(*id));
        for entry in &mut self.entry_sets {
            for bitmap in entry.values.values_mut() {
                *bitmap -= &gone;
            }
            entry.values.retain(|_, bitmap| !bitmap.is_empty());
        }
        removed
    }

    pub fn all_series(&self) -> Vec<(u32, Arc<TimeSeriesStore>)> {
        let mut all: Vec<_> = self
            .series
            .iter()
            .map(|(id, store)| (*id, store.clone()))
            .collect();
        all.sort_by_key(|(id, _)| *id);
        all
    }

    pub fn entry_sets(&self) -> &[TagKvEntrySet] {
        &self.entry_sets
    }

    pub fn get_entry(&self, tag_key: &str) -> Option<&TagKvEntrySet> {
        self.entry_sets.iter().find(|e| e.key == tag_key)
    }

    /// Widen the observed time range to include a point time.
    pub fn update_time_range(&self, point_time: i64) {
        let delta = point_time - self.version.0;
        self.earliest_delta.fetch_min(delta, Ordering::Relaxed);
        self.latest_delta.fetch_max(delta, Ordering::Relaxed);
    }

    pub fn time_range(&self) -> TimeRange {
        let earliest = self.earliest_delta.load(Ordering::Relaxed);
        let latest = self.latest_delta.load(Ordering::Relaxed);
        if earliest > latest {
            // no writes observed yet
            return TimeRange::new(self.version.0, self.version.0);
        }
        TimeRange::new(self.version.0 + earliest, self.version.0 + latest)
    }

    /// Union of every bitmap under one tag key.
    pub fn series_ids_for_tag(&self, tag_key: &str) -> Option<RoaringBitmap> {
        let entry = self.get_entry(tag_key)?;
        let mut union = RoaringBitmap::new();
        for bitmap in entry.values.values() {
            union |= bitmap;
        }
        Some(union)
    }

    fn live_series_bitmap(&self) -> RoaringBitmap {
        self.series.keys().copied().collect()
    }

    /// Evaluate a tag filter into a series bitmap. Unknown keys and
    /// non-matching values produce an empty bitmap, never an error.
    pub fn find_series_ids_by_expr(&self, expr: &TagFilter) -> RoaringBitmap {
        match expr {
            TagFilter::Eq { key, value } => self
                .get_entry(key)
                .and_then(|e| e.values.get(value).cloned())
                .unwrap_or_default(),
            TagFilter::In { key, values } => {
                let mut union = RoaringBitmap::new();
                if let Some(entry) = self.get_entry(key) {
                    for value in values {
                        if let Some(bitmap) = entry.values.get(value) {
                            union |= bitmap;
                        }
                    }
                }
                union
            }
            TagFilter::Like { key, prefix } => {
                let mut union = RoaringBitmap::new();
                if let Some(entry) = self.get_entry(key) {
                    for (value, bitmap) in entry.values.range(prefix.clone()..) {
                        if !value.starts_with(prefix.as_str()) {
                            break;
                        }
                        union |= bitmap;
                    }
                }
                union
            }
            TagFilter::Regex { key, pattern } => {
                let regex = match Regex::new(pattern) {
                    Ok(regex) => regex,
                    Err(err) => {
                        warn!(pattern = %pattern, error = %err, "invalid tag filter regex");
                        return RoaringBitmap::new();
                    }
                };
                let mut union = RoaringBitmap::new();
                if let Some(entry) = self.get_entry(key) {
                    for (value, bitmap) in &entry.values {
                        if regex.is_match(value) {
                            union |= bitmap;
                        }
                    }
                }
                union
            }
            TagFilter::Not(inner) => {
                let matched = self.find_series_ids_by_expr(inner);
                self.live_series_bitmap() - matched
            }
            TagFilter::And(children) => {
                let mut iter = children.iter();
                let Some(first) = iter.next() else {
                    return RoaringBitmap::new();
                };
                let mut result = self.find_series_ids_by_expr(first);
                for child in iter {
                    if result.is_empty() {
                        break;
                    }
                    result &= self.find_series_ids_by_expr(child);
                }
                result
            }
            TagFilter::Or(children) => {
                let mut result = RoaringBitmap::new();
                for child in children {
                    result |= self.find_series_ids_by_expr(child);
                }
                result
            }
        }
    }

    /// Flush this version's slot data for one family. Series that flushed
    /// at least one field are closed with `flush_series`. Returns the bytes
    /// reclaimed.
    pub fn flush_version_data_to(
        &self,
        flusher: &mut dyn MetricsDataFlusher,
        family_time: i64,
        block_store: &BlockStore,
    ) -> usize {
        let mut reclaimed = 0;
        for (series_id, store) in self.all_series() {
            let flushed = store.flush_series_to(flusher, family_time, block_store);
            if flushed > 0 {
                flusher.flush_series(series_id);
                reclaimed += flushed;
            }
        }
        reclaimed
    }

    /// Seed the forward map directly; only tests build indexes this way.
    #[cfg(test)]
    pub(crate) fn insert_series_for_test(&mut self, series_id: u32, store: Arc<TimeSeriesStore>) {
        self.series.insert(series_id, store);
        self.id_counter = self.id_counter.max(series_id + 1);
    }

    /// Structural memory estimate: entries, signatures, and series stores.
    pub fn mem_size(&self) -> usize {
        let mut size = std::mem::size_of::<TagIndex>();
        for entry in &self.entry_sets {
            size += std::mem::size_of::<TagKvEntrySet>() + entry.key.len();
            for (value, bitmap) in &entry.values {
                size += value.len() + bitmap.serialized_size();
            }
        }
        for signature in self.signature_to_series.keys() {
            size += signature.len() * 2;
        }
        for store in self.series.values() {
            size += store.mem_size();
        }
        size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use emberdb_core::FieldValue;
    use std::collections::BTreeMap;

    fn metric_with_tags(tags: &[(&str, &str)]) -> Metric {
        Metric {
            name: "cpu".to_string(),
            timestamp: 0,
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            fields: vec![emberdb_core::Field {
                name: "f1".to_string(),
                value: FieldValue::Sum(1.0),
            }],
        }
    }

    fn index_with_hosts(hosts: &[&str]) -> TagIndex {
        let mut index = TagIndex::new(Version(1));
        for host in hosts {
            index
                .get_or_create_series(&metric_with_tags(&[("host", host)]))
                .unwrap();
        }
        index
    }

    #[test]
    fn test_series_ids_are_dense() {
        let mut index = TagIndex::new(Version(1));
        let (_, created_a) = index
            .get_or_create_series(&metric_with_tags(&[("host", "a")]))
            .unwrap();
        assert!(created_a > 0);
        let (_, created_again) = index
            .get_or_create_series(&metric_with_tags(&[("host", "a")]))
            .unwrap();
        assert_eq!(created_again, 0);
        index
            .get_or_create_series(&metric_with_tags(&[("host", "b")]))
            .unwrap();
        assert_eq!(index.tags_in_use(), 2);
        assert_eq!(index.tags_used(), 2);
        let entry = index.get_entry("host").unwrap();
        assert!(entry.values["a"].contains(0));
        assert!(entry.values["b"].contains(1));
    }

    #[test]
    fn test_series_map_matches_bitmap_union() {
        let index = index_with_hosts(&["a", "b", "c"]);
        let mut union = RoaringBitmap::new();
        for entry in index.entry_sets() {
            for bitmap in entry.values.values() {
                union |= bitmap;
            }
        }
        let live: RoaringBitmap = index.all_series().iter().map(|(id, _)| *id).collect();
        assert_eq!(union, live);
    }

    #[test]
    fn test_remove_series_clears_all_views() {
        let mut index = index_with_hosts(&["a", "b"]);
        let removed = index.remove_series(&[0]);
        assert_eq!(removed.len(), 1);
        assert_eq!(index.tags_in_use(), 1);
        // counter never goes back
        assert_eq!(index.tags_used(), 2);
        assert!(index
            .get_series(&metric_with_tags(&[("host", "a")]).tag_signature())
            .is_none());
        let entry = index.get_entry("host").unwrap();
        assert!(!entry.values.contains_key("a"));

        // invariant: union of bitmaps still equals live series
        let mut union = RoaringBitmap::new();
        for bitmap in entry.values.values() {
            union |= bitmap;
        }
        let live: RoaringBitmap = index.all_series().iter().map(|(id, _)| *id).collect();
        assert_eq!(union, live);
    }

    #[test]
    fn test_filter_eq_in_like_regex() {
        let index = index_with_hosts(&["web-1", "web-2", "db-1"]);
        assert_eq!(
            index.find_series_ids_by_expr(&TagFilter::eq("host", "web-1")),
            RoaringBitmap::from_iter([0u32])
        );
        assert_eq!(
            index.find_series_ids_by_expr(&TagFilter::In {
                key: "host".to_string(),
                values: vec!["web-2".to_string(), "db-1".to_string()],
            }),
            RoaringBitmap::from_iter([1u32, 2])
        );
        assert_eq!(
            index.find_series_ids_by_expr(&TagFilter::like("host", "web-")),
            RoaringBitmap::from_iter([0u32, 1])
        );
        assert_eq!(
            index.find_series_ids_by_expr(&TagFilter::Regex {
                key: "host".to_string(),
                pattern: "^db-\\d+$".to_string(),
            }),
            RoaringBitmap::from_iter([2u32])
        );
    }

    #[test]
    fn test_filter_combinators() {
        let index = index_with_hosts(&["web-1", "web-2", "db-1"]);
        let not_web = TagFilter::Not(Box::new(TagFilter::like("host", "web-")));
        assert_eq!(
            index.find_series_ids_by_expr(&not_web),
            RoaringBitmap::from_iter([2u32])
        );
        let and = TagFilter::And(vec![
            TagFilter::like("host", "web-"),
            TagFilter::eq("host", "web-2"),
        ]);
        assert_eq!(
            index.find_series_ids_by_expr(&and),
            RoaringBitmap::from_iter([1u32])
        );
        let or = TagFilter::Or(vec![
            TagFilter::eq("host", "db-1"),
            TagFilter::eq("host", "web-1"),
        ]);
        assert_eq!(
            index.find_series_ids_by_expr(&or),
            RoaringBitmap::from_iter([0u32, 2])
        );
        assert!(index
            .find_series_ids_by_expr(&TagFilter::eq("zone", "us"))
            .is_empty());
    }

    #[test]
    fn test_tag_key_limit() {
        let mut index = TagIndex::new(Version(1));
        let tags: Vec<(String, String)> = (0..MAX_TAG_KEYS_COUNT)
            .map(|i| (format!("k{i:03}"), "v".to_string()))
            .collect();
        let metric = Metric {
            name: "cpu".to_string(),
            timestamp: 0,
            tags: tags.into_iter().collect(),
            fields: vec![],
        };
        index.get_or_create_series(&metric).unwrap();

        let over = metric_with_tags(&[("one-key-too-many", "v")]);
        let err = index.get_or_create_series(&over).unwrap_err();
        assert_eq!(err, Error::TooManyTagKeys);
    }

    #[test]
    fn test_time_range_updates() {
        let index = TagIndex::new(Version(1_000));
        assert_eq!(index.time_range(), TimeRange::new(1_000, 1_000));
        index.update_time_range(1_100);
        index.update_time_range(900);
        assert_eq!(index.time_range(), TimeRange::new(900, 1_100));
    }
}
