//! Memory watermark watcher.
//!
//! Watches the registered shards' in-memory byte sizes and decides when to
//! flush. Two triggers:
//!
//! - the sum across shards crosses the high watermark of the configured
//!   memory budget: flush biggest shards first until the projected total is
//!   back under the low watermark;
//! - a single shard crosses its own byte threshold.
//!
//! Flushes run concurrently under a semaphore. A failed flush is logged and
//! retried on a later tick; the shard keeps its size, so it stays a
//! candidate until a flush succeeds.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::constants::{
    FLUSH_CONCURRENCY, MEMORY_HIGH_WATERMARK, MEMORY_LOW_WATERMARK, SHARD_MEMORY_USED_THRESHOLD,
};
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatermarkConfig {
    /// Byte budget the watermark percentages apply to.
    #[serde(default = "default_memory_budget")]
    pub total_memory_budget: usize,

    /// Percent of the budget that starts flushing.
    #[serde(default = "default_high_watermark")]
    pub memory_high_watermark: u8,

    /// Percent of the budget at which flushing stops.
    #[serde(default = "default_low_watermark")]
    pub memory_low_watermark: u8,

    /// Per-shard byte size that triggers a flush on its own.
    #[serde(default = "default_shard_threshold")]
    pub shard_memory_used_threshold: usize,

    /// Parallel flushes.
    #[serde(default = "default_flush_concurrency")]
    pub flush_concurrency: usize,

    /// Watch cadence.
    #[serde(default = "default_check_interval_ms")]
    pub check_flush_interval_ms: u64,
}

impl Default for WatermarkConfig {
    fn default() -> Self {
        WatermarkConfig {
            total_memory_budget: default_memory_budget(),
            memory_high_watermark: default_high_watermark(),
            memory_low_watermark: default_low_watermark(),
            shard_memory_used_threshold: default_shard_threshold(),
            flush_concurrency: default_flush_concurrency(),
            check_flush_interval_ms: default_check_interval_ms(),
        }
    }
}

fn default_memory_budget() -> usize {
    4 * 1024 * 1024 * 1024
}

fn default_high_watermark() -> u8 {
    MEMORY_HIGH_WATERMARK
}

fn default_low_watermark() -> u8 {
    MEMORY_LOW_WATERMARK
}

fn default_shard_threshold() -> usize {
    SHARD_MEMORY_USED_THRESHOLD
}

fn default_flush_concurrency() -> usize {
    FLUSH_CONCURRENCY
}

fn default_check_interval_ms() -> u64 {
    1_000
}

/// One flushable shard as the watcher sees it. Implemented by the shard
/// wrapper that owns a memory database and its flushers.
#[async_trait]
pub trait FlushableShard: Send + Sync {
    fn shard_id(&self) -> u32;

    /// Current in-memory byte size.
    fn mem_size(&self) -> usize;

    /// Flush the shard's current families and indexes.
    async fn flush(&self) -> Result<()>;
}

pub struct MemoryWatcher {
    cfg: WatermarkConfig,
    shards: RwLock<Vec<Arc<dyn FlushableShard>>>,
    permits: Arc<Semaphore>,
}

impl MemoryWatcher {
    pub fn new(cfg: WatermarkConfig) -> MemoryWatcher {
        let permits = Arc::new(Semaphore::new(cfg.flush_concurrency.max(1)));
        MemoryWatcher {
            cfg,
            shards: RwLock::new(Vec::new()),
            permits,
        }
    }

    pub fn register(&self, shard: Arc<dyn FlushableShard>) {
        self.shards.write().push(shard);
    }

    /// Run the watch loop until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.cfg.check_flush_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!("memory watcher started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.check_once().await;
                }
            }
        }
        info!("memory watcher stopped");
    }

    /// One watch pass; exposed so tests and manual triggers can drive it.
    pub async fn check_once(&self) {
        let shards = self.shards.read().clone();
        if shards.is_empty() {
            return;
        }

        let mut sized: Vec<(usize, Arc<dyn FlushableShard>)> = shards
            .iter()
            .map(|shard| (shard.mem_size(), shard.clone()))
            .collect();
        // biggest first
        sized.sort_by(|a, b| b.0.cmp(&a.0));

        let total: usize = sized.iter().map(|(size, _)| *size).sum();
        let high = self.cfg.total_memory_budget / 100 * self.cfg.memory_high_watermark as usize;
        let low = self.cfg.total_memory_budget / 100 * self.cfg.memory_low_watermark as usize;

        let mut candidates: Vec<Arc<dyn FlushableShard>> = Vec::new();
        if total > high {
            let mut projected = total;
            for (size, shard) in &sized {
                if projected <= low {
                    break;
                }
                projected = projected.saturating_sub(*size);
                candidates.push(shard.clone());
            }
        }
        for (size, shard) in &sized {
            if *size > self.cfg.shard_memory_used_threshold
                && !candidates
                    .iter()
                    .any(|candidate| candidate.shard_id() == shard.shard_id())
            {
                candidates.push(shard.clone());
            }
        }
        if candidates.is_empty() {
            return;
        }

        let mut tasks = JoinSet::new();
        for shard in candidates {
            let permits = self.permits.clone();
            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire().await else {
                    return;
                };
                let shard_id = shard.shard_id();
                let before = shard.mem_size();
                match shard.flush().await {
                    Ok(()) => info!(
                        shard = shard_id,
                        flushed = before.saturating_sub(shard.mem_size()),
                        "shard flushed by watermark"
                    ),
                    // the shard keeps its size and will be retried next tick
                    Err(err) => warn!(shard = shard_id, error = %err, "shard flush failed"),
                }
            });
        }
        while tasks.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockShard {
        id: u32,
        size: AtomicUsize,
        flushes: AtomicUsize,
        fail: bool,
    }

    impl MockShard {
        fn new(id: u32, size: usize) -> Arc<MockShard> {
            Arc::new(MockShard {
                id,
                size: AtomicUsize::new(size),
                flushes: AtomicUsize::new(0),
                fail: false,
            })
        }

        fn failing(id: u32, size: usize) -> Arc<MockShard> {
            Arc::new(MockShard {
                id,
                size: AtomicUsize::new(size),
                flushes: AtomicUsize::new(0),
                fail: true,
            })
        }
    }

    #[async_trait]
    impl FlushableShard for MockShard {
        fn shard_id(&self) -> u32 {
            self.id
        }
        fn mem_size(&self) -> usize {
            self.size.load(Ordering::Relaxed)
        }
        async fn flush(&self) -> Result<()> {
            self.flushes.fetch_add(1, Ordering::Relaxed);
            if self.fail {
                return Err(Error::Flush("disk unavailable".to_string()));
            }
            self.size.store(0, Ordering::Relaxed);
            Ok(())
        }
    }

    fn config(budget: usize) -> WatermarkConfig {
        WatermarkConfig {
            total_memory_budget: budget,
            shard_memory_used_threshold: usize::MAX,
            ..WatermarkConfig::default()
        }
    }

    #[tokio::test]
    async fn test_high_watermark_flushes_biggest_first() {
        let watcher = MemoryWatcher::new(config(1_000));
        let small = MockShard::new(1, 100);
        let big = MockShard::new(2, 900);
        watcher.register(small.clone());
        watcher.register(big.clone());

        watcher.check_once().await;
        assert_eq!(big.flushes.load(Ordering::Relaxed), 1);
        // dropping the biggest shard was enough to get under the low mark
        assert_eq!(small.flushes.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_below_watermark_does_nothing() {
        let watcher = MemoryWatcher::new(config(1_000_000));
        let shard = MockShard::new(1, 100);
        watcher.register(shard.clone());
        watcher.check_once().await;
        assert_eq!(shard.flushes.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_shard_threshold_triggers_alone() {
        let mut cfg = config(usize::MAX / 200);
        cfg.shard_memory_used_threshold = 500;
        let watcher = MemoryWatcher::new(cfg);
        let shard = MockShard::new(1, 501);
        watcher.register(shard.clone());
        watcher.check_once().await;
        assert_eq!(shard.flushes.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_failed_flush_is_retried_next_pass() {
        let watcher = MemoryWatcher::new(config(100));
        let shard = MockShard::failing(1, 900);
        watcher.register(shard.clone());
        watcher.check_once().await;
        watcher.check_once().await;
        assert_eq!(shard.flushes.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_run_exits_on_shutdown() {
        let watcher = Arc::new(MemoryWatcher::new(config(1_000)));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(watcher.run(rx));
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("watcher should exit")
            .unwrap();
    }
}
