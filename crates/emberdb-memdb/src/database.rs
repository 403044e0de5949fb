//! The per-shard memory database.
//!
//! Metric stores live in 32 hash-sharded buckets, each behind its own
//! read-write lock, so writers to different metrics rarely contend. The
//! database tracks its own byte size through an atomic counter fed by the
//! deltas every operation reports; the counter is eventually consistent and
//! only drives flush scheduling, never correctness.
//!
//! The evictor is a separate task woken through a single-slot channel after
//! each family flush; the wake is a `try_send`, so a flush never blocks on
//! eviction.

use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use emberdb_core::{IntervalCalc, Metric, MultiVersionSeriesIdSet, TimeRange, Version};

use crate::block_store::BlockStore;
use crate::constants::{DEFAULT_SERIES_TTL_MS, SHARDING_COUNT, SHARDING_MASK};
use crate::error::{Error, Result};
use crate::filter::TagFilter;
use crate::flush::{ForwardIndexFlusher, InvertedIndexFlusher, MetricsDataFlusher};
use crate::generator::IdGenerator;
use crate::metric_store::MetricStore;
use crate::now_ms;
use crate::scan::ScanContext;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryDatabaseConfig {
    /// Slot width, epoch ms.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: i64,

    /// Rollup family width, epoch ms. Must be a multiple of the interval.
    #[serde(default = "default_family_ms")]
    pub family_ms: i64,

    /// Idle time after which a series with no data may be evicted.
    #[serde(default = "default_series_ttl_ms")]
    pub series_ttl_ms: i64,
}

impl Default for MemoryDatabaseConfig {
    fn default() -> Self {
        MemoryDatabaseConfig {
            interval_ms: default_interval_ms(),
            family_ms: default_family_ms(),
            series_ttl_ms: default_series_ttl_ms(),
        }
    }
}

fn default_interval_ms() -> i64 {
    10_000
}

fn default_family_ms() -> i64 {
    3_600_000
}

fn default_series_ttl_ms() -> i64 {
    DEFAULT_SERIES_TTL_MS
}

/// Everything a write needs on its way down the store tower.
pub struct WriteContext<'a> {
    pub metric_id: u32,
    pub family_time: i64,
    pub slot_index: u16,
    pub interval_ms: i64,
    pub block_store: &'a BlockStore,
}

impl WriteContext<'_> {
    /// The point timestamp this write lands on.
    pub fn point_time(&self) -> i64 {
        self.family_time + self.interval_ms * self.slot_index as i64
    }
}

#[derive(Default)]
struct Bucket {
    stores: RwLock<HashMap<u64, Arc<MetricStore>>>,
}

impl Bucket {
    fn snapshot(&self) -> Vec<(u64, Arc<MetricStore>)> {
        self.stores
            .read()
            .iter()
            .map(|(hash, store)| (*hash, store.clone()))
            .collect()
    }
}

pub struct MemoryDatabase {
    calc: IntervalCalc,
    series_ttl_ms: i64,
    block_store: BlockStore,
    generator: Arc<dyn IdGenerator>,
    buckets: Vec<Bucket>,
    metric_id_to_hash: DashMap<u32, u64>,
    /// Families written since the last flush.
    family_times: DashMap<i64, ()>,
    /// Short-circuits repeated inserts of the same family.
    last_wrote_family: AtomicI64,
    size: AtomicI64,
    evict_tx: mpsc::Sender<()>,
}

impl MemoryDatabase {
    /// Build the database and its evictor. The evictor is returned rather
    /// than spawned so the caller owns the task lifecycle.
    pub fn new(
        cfg: MemoryDatabaseConfig,
        generator: Arc<dyn IdGenerator>,
    ) -> Result<(Arc<MemoryDatabase>, Evictor)> {
        let calc = IntervalCalc::new(cfg.interval_ms, cfg.family_ms)
            .map_err(|err| Error::Config(err.to_string()))?;
        let (evict_tx, evict_rx) = mpsc::channel(1);
        let db = Arc::new(MemoryDatabase {
            calc,
            series_ttl_ms: cfg.series_ttl_ms,
            block_store: BlockStore::new(calc.time_window()),
            generator,
            buckets: (0..SHARDING_COUNT).map(|_| Bucket::default()).collect(),
            metric_id_to_hash: DashMap::new(),
            family_times: DashMap::new(),
            last_wrote_family: AtomicI64::new(0),
            size: AtomicI64::new(0),
            evict_tx,
        });
        let evictor = Evictor {
            db: db.clone(),
            rx: evict_rx,
        };
        Ok((db, evictor))
    }

    fn hash_name(name: &str) -> u64 {
        let mut hasher = twox_hash::XxHash64::with_seed(0);
        hasher.write(name.as_bytes());
        hasher.finish()
    }

    fn bucket(&self, hash: u64) -> &Bucket {
        &self.buckets[(hash & SHARDING_MASK) as usize]
    }

    fn get_mstore_by_hash(&self, hash: u64) -> Option<Arc<MetricStore>> {
        self.bucket(hash).stores.read().get(&hash).cloned()
    }

    pub fn get_mstore(&self, metric_name: &str) -> Option<Arc<MetricStore>> {
        self.get_mstore_by_hash(Self::hash_name(metric_name))
    }

    pub fn get_mstore_by_metric_id(&self, metric_id: u32) -> Option<Arc<MetricStore>> {
        let hash = *self.metric_id_to_hash.get(&metric_id)?;
        self.get_mstore_by_hash(hash)
    }

    fn get_or_create_mstore(&self, metric_name: &str, hash: u64) -> Arc<MetricStore> {
        if let Some(store) = self.get_mstore_by_hash(hash) {
            return store;
        }
        let metric_id = self.generator.gen_metric_id(metric_name);
        let bucket = self.bucket(hash);
        let mut stores = bucket.stores.write();
        stores
            .entry(hash)
            .or_insert_with(|| {
                let store = Arc::new(MetricStore::new(metric_id));
                self.size
                    .fetch_add(store.mem_size() as i64, Ordering::Relaxed);
                self.metric_id_to_hash.insert(metric_id, hash);
                store
            })
            .clone()
    }

    fn add_family_time(&self, family_time: i64) {
        if self.last_wrote_family.swap(family_time, Ordering::Relaxed) == family_time {
            return;
        }
        self.family_times.insert(family_time, ());
    }

    /// Write one decoded metric point.
    pub fn write(&self, metric: &Metric) -> Result<()> {
        let family_time = self.calc.family_time(metric.timestamp);
        let slot_index = self.calc.slot_of(metric.timestamp, family_time);

        let hash = Self::hash_name(&metric.name);
        let store = self.get_or_create_mstore(&metric.name, hash);
        let ctx = WriteContext {
            metric_id: store.metric_id(),
            family_time,
            slot_index,
            interval_ms: self.calc.interval_ms(),
            block_store: &self.block_store,
        };
        let written = store.write(metric, &ctx, &*self.generator)?;
        self.add_family_time(family_time);
        self.size.fetch_add(written as i64, Ordering::Relaxed);
        Ok(())
    }

    /// Push per-metric tag-cardinality limits down to the stores.
    pub fn set_max_tags_limits(&self, limits: &HashMap<String, u32>) {
        for (metric_name, limit) in limits {
            if let Some(store) = self.get_mstore(metric_name) {
                store.set_max_tags_limit(*limit);
            }
        }
    }

    /// Promote the named metric's mutable index to a new version.
    pub fn reset_metric_store(&self, metric_name: &str) -> Result<()> {
        let store = self
            .get_mstore(metric_name)
            .ok_or_else(|| Error::MetricNotFound(metric_name.to_string()))?;
        let created = store.reset_version()?;
        self.size.fetch_add(created as i64, Ordering::Relaxed);
        Ok(())
    }

    pub fn count_metrics(&self) -> usize {
        self.buckets
            .iter()
            .map(|bucket| bucket.stores.read().len())
            .sum()
    }

    /// Tag combinations ever used by a metric; `None` when unknown.
    pub fn count_tags(&self, metric_name: &str) -> Option<usize> {
        self.get_mstore(metric_name)
            .map(|store| store.tags_used() as usize)
    }

    /// Families with unflushed writes, ascending.
    pub fn families(&self) -> Vec<i64> {
        let mut families: Vec<i64> = self.family_times.iter().map(|e| *e.key()).collect();
        families.sort_unstable();
        families
    }

    pub fn interval_ms(&self) -> i64 {
        self.calc.interval_ms()
    }

    pub fn mem_size(&self) -> usize {
        self.size.load(Ordering::Relaxed).max(0) as usize
    }

    /// Flush every metric's data for one family, then wake the evictor.
    /// An error aborts the pass; already-flushed stores stay flushed.
    pub fn flush_family_to(
        &self,
        flusher: &mut dyn MetricsDataFlusher,
        family_time: i64,
    ) -> Result<()> {
        let result = self.flush_family_inner(flusher, family_time);
        if self.evict_tx.try_send(()).is_err() {
            debug!("evictor already signalled, dropping wake");
        }
        result
    }

    fn flush_family_inner(
        &self,
        flusher: &mut dyn MetricsDataFlusher,
        family_time: i64,
    ) -> Result<()> {
        self.family_times.remove(&family_time);
        self.last_wrote_family.store(0, Ordering::Relaxed);

        for bucket in &self.buckets {
            for (_, store) in bucket.snapshot() {
                let flushed =
                    store.flush_metrics_data_to(flusher, family_time, &self.block_store)?;
                self.size.fetch_sub(flushed as i64, Ordering::Relaxed);
            }
        }
        info!(family_time, "family flushed");
        Ok(())
    }

    /// Flush the forward index of every metric.
    pub fn flush_forward_index_to(&self, flusher: &mut dyn ForwardIndexFlusher) -> Result<()> {
        for bucket in &self.buckets {
            for (_, store) in bucket.snapshot() {
                store.flush_forward_index_to(flusher)?;
            }
        }
        Ok(())
    }

    /// Flush the inverted index of every metric.
    pub fn flush_inverted_index_to(&self, flusher: &mut dyn InvertedIndexFlusher) -> Result<()> {
        for bucket in &self.buckets {
            for (_, store) in bucket.snapshot() {
                store.flush_inverted_index_to(flusher, &*self.generator)?;
            }
        }
        Ok(())
    }

    pub fn find_series_ids_by_expr(
        &self,
        metric_id: u32,
        expr: &TagFilter,
        _time_range: TimeRange,
    ) -> Result<MultiVersionSeriesIdSet> {
        let store = self
            .get_mstore_by_metric_id(metric_id)
            .ok_or(Error::NotFound)?;
        Ok(store.find_series_ids_by_expr(expr))
    }

    pub fn get_series_ids_for_tag(
        &self,
        metric_id: u32,
        tag_key: &str,
        _time_range: TimeRange,
    ) -> Result<MultiVersionSeriesIdSet> {
        let store = self
            .get_mstore_by_metric_id(metric_id)
            .ok_or(Error::NotFound)?;
        Ok(store.get_series_ids_for_tag(tag_key))
    }

    pub fn get_tag_values(
        &self,
        metric_id: u32,
        tag_keys: &[String],
        version: Version,
        series_ids: &RoaringBitmap,
    ) -> Result<HashMap<u32, Vec<String>>> {
        let store = self
            .get_mstore_by_metric_id(metric_id)
            .ok_or(Error::NotFound)?;
        store.get_tag_values(tag_keys, version, series_ids)
    }

    /// Metric-name completion is served by the id index, which has every
    /// name ever seen; the memory database holds only hashes.
    pub fn suggest_metrics(&self, _prefix: &str, _limit: usize) -> Vec<String> {
        Vec::new()
    }

    pub fn suggest_tag_keys(&self, metric_name: &str, prefix: &str, limit: usize) -> Vec<String> {
        self.get_mstore(metric_name)
            .map(|store| store.suggest_tag_keys(prefix, limit))
            .unwrap_or_default()
    }

    pub fn suggest_tag_values(
        &self,
        metric_name: &str,
        tag_key: &str,
        prefix: &str,
        limit: usize,
    ) -> Vec<String> {
        self.get_mstore(metric_name)
            .map(|store| store.suggest_tag_values(tag_key, prefix, limit))
            .unwrap_or_default()
    }

    pub fn scan(&self, ctx: &mut ScanContext<'_>) {
        if let Some(store) = self.get_mstore_by_metric_id(ctx.metric_id) {
            store.scan(ctx);
        }
    }

    /// One eviction sweep: drop expired empty series, then drop metric
    /// stores that became fully empty.
    pub fn evict_all(&self) {
        let now = now_ms();
        for bucket in &self.buckets {
            for (hash, store) in bucket.snapshot() {
                let evicted = store.evict(self.series_ttl_ms, now);
                self.size.fetch_sub(evicted as i64, Ordering::Relaxed);
                if store.is_empty() {
                    let mut stores = bucket.stores.write();
                    if store.is_empty() {
                        if stores.remove(&hash).is_some() {
                            self.metric_id_to_hash.remove(&store.metric_id());
                            self.size
                                .fetch_sub(store.mem_size() as i64, Ordering::Relaxed);
                        }
                    }
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn sum_of_store_sizes(&self) -> usize {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.snapshot())
            .map(|(_, store)| store.mem_size())
            .sum()
    }
}

/// The eviction task. Waits for a wake from a family flush, sweeps, and
/// exits on shutdown.
pub struct Evictor {
    db: Arc<MemoryDatabase>,
    rx: mpsc::Receiver<()>,
}

impl Evictor {
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("evictor started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                wake = self.rx.recv() => {
                    match wake {
                        Some(()) => self.db.evict_all(),
                        None => break,
                    }
                }
            }
        }
        info!("evictor stopped");
    }
}
