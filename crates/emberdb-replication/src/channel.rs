//! Channels and the channel manager.
//!
//! A [`Channel`] owns the fan-out queue of one (database, shard) and the
//! replicators feeding its targets. A client write is one durable append;
//! replication happens behind it and never fails the write. The
//! [`ChannelManager`] owns every channel of this broker, routes metric
//! batches to shards by tag hash, and reports replicator lag on a ticker.

use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use emberdb_core::{Metric, MetricList};

use crate::config::ReplicationConfig;
use crate::error::{Error, Result};
use crate::queue::FanOutQueue;
use crate::replicator::{Replicator, ReplicatorState};
use crate::rpc::StreamFactory;

/// Consumes replicator lag reports; implemented by whatever aggregates
/// them (a cluster state store, a metrics endpoint).
pub trait StateReport: Send + Sync {
    fn report(&self, state: &ReplicatorState) -> Result<()>;
}

pub struct Channel {
    database: String,
    shard_id: u32,
    queue: Arc<FanOutQueue>,
    replicators: DashMap<String, Arc<Replicator>>,
    replicator_create: Mutex<()>,
    factory: Arc<dyn StreamFactory>,
    window_size: u64,
    shutdown: watch::Receiver<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Channel {
    async fn open(
        cfg: &ReplicationConfig,
        database: &str,
        shard_id: u32,
        factory: Arc<dyn StreamFactory>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Arc<Channel>> {
        let dir = cfg.dir.join(database).join(shard_id.to_string());
        tokio::fs::create_dir_all(&dir).await?;
        let queue = Arc::new(
            FanOutQueue::open(
                &dir,
                cfg.segment_file_size(),
                cfg.flush_interval_ms == 0,
                cfg.buffer_size,
            )
            .await?,
        );

        let channel = Arc::new(Channel {
            database: database.to_string(),
            shard_id,
            queue: queue.clone(),
            replicators: DashMap::new(),
            replicator_create: Mutex::new(()),
            factory,
            window_size: cfg.window_size,
            shutdown: shutdown.clone(),
            tasks: parking_lot::Mutex::new(Vec::new()),
        });

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(Self::gc_loop(
            queue.clone(),
            cfg.remove_task_interval(),
            shutdown.clone(),
        )));
        if cfg.flush_interval_ms > 0 {
            tasks.push(tokio::spawn(Self::flush_loop(
                queue,
                std::time::Duration::from_millis(cfg.flush_interval_ms),
                shutdown,
            )));
        }
        *channel.tasks.lock() = tasks;

        info!(database, shard = shard_id, "channel opened");
        Ok(channel)
    }

    async fn gc_loop(
        queue: Arc<FanOutQueue>,
        period: std::time::Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(err) = queue.remove_stale_segments().await {
                        warn!(error = %err, "segment gc failed");
                    }
                }
            }
        }
    }

    async fn flush_loop(
        queue: Arc<FanOutQueue>,
        period: std::time::Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(err) = queue.sync().await {
                        warn!(error = %err, "queue group-commit failed");
                    }
                }
            }
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    /// Sequence of the last appended record.
    pub fn append_seq(&self) -> u64 {
        self.queue.append_seq()
    }

    pub fn targets(&self) -> Vec<String> {
        self.replicators
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn replicators(&self) -> Vec<Arc<Replicator>> {
        self.replicators
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Append one payload durably; returns its sequence. The caller does
    /// not wait for replication.
    pub async fn write(&self, payload: Bytes) -> Result<u64> {
        self.queue.append(&payload).await
    }

    /// Read one appended payload back; what a replicator would stream.
    pub async fn read_message(&self, seq: u64) -> Result<Bytes> {
        self.queue.get_message(seq).await
    }

    /// Get or start the replicator for one target node.
    pub async fn get_or_create_replicator(&self, target: &str) -> Result<Arc<Replicator>> {
        if let Some(replicator) = self.replicators.get(target) {
            return Ok(replicator.clone());
        }
        let _guard = self.replicator_create.lock().await;
        if let Some(replicator) = self.replicators.get(target) {
            return Ok(replicator.clone());
        }
        let replicator = Replicator::start(
            self.database.clone(),
            self.shard_id,
            target.to_string(),
            self.queue.clone(),
            self.factory.clone(),
            self.window_size,
            self.shutdown.clone(),
        )
        .await?;
        self.replicators
            .insert(target.to_string(), replicator.clone());
        info!(
            database = %self.database,
            shard = self.shard_id,
            target,
            "replicator started"
        );
        Ok(replicator)
    }

    async fn close(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        for replicator in self.replicators() {
            replicator.stop().await;
        }
        if let Err(err) = self.queue.close().await {
            warn!(
                database = %self.database,
                shard = self.shard_id,
                error = %err,
                "queue close failed"
            );
        }
    }
}

pub struct ChannelManager {
    cfg: ReplicationConfig,
    factory: Arc<dyn StreamFactory>,
    channels: Arc<DashMap<(String, u32), Arc<Channel>>>,
    /// Shard count per database, fixed by the first successful channel.
    database_shards: DashMap<String, u32>,
    shutdown_tx: watch::Sender<bool>,
    report_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ChannelManager {
    pub fn new(
        cfg: ReplicationConfig,
        factory: Arc<dyn StreamFactory>,
        report: Arc<dyn StateReport>,
    ) -> ChannelManager {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let channels: Arc<DashMap<(String, u32), Arc<Channel>>> = Arc::new(DashMap::new());
        let report_task = tokio::spawn(Self::report_loop(
            channels.clone(),
            report,
            cfg.report_interval(),
            shutdown_rx,
        ));
        ChannelManager {
            cfg,
            factory,
            channels,
            database_shards: DashMap::new(),
            shutdown_tx,
            report_task: parking_lot::Mutex::new(Some(report_task)),
        }
    }

    async fn report_loop(
        channels: Arc<DashMap<(String, u32), Arc<Channel>>>,
        report: Arc<dyn StateReport>,
        period: std::time::Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                _ = ticker.tick() => {
                    for entry in channels.iter() {
                        for replicator in entry.value().replicators() {
                            if let Err(err) = report.report(&replicator.state()) {
                                debug!(error = %err, "lag report failed");
                            }
                        }
                    }
                }
            }
        }
    }

    /// Create (or fetch) the channel for one (database, shard). The shard
    /// count must be consistent across calls for the same database.
    pub async fn create_channel(
        &self,
        database: &str,
        num_shards: u32,
        shard_id: u32,
    ) -> Result<Arc<Channel>> {
        if num_shards == 0 || shard_id >= num_shards {
            return Err(Error::ShardConfigConflict {
                database: database.to_string(),
                reason: format!("shard id {shard_id} outside shard count {num_shards}"),
            });
        }
        if let Some(existing) = self.database_shards.get(database) {
            if *existing != num_shards {
                return Err(Error::ShardConfigConflict {
                    database: database.to_string(),
                    reason: format!(
                        "shard count {num_shards} conflicts with earlier {}",
                        *existing
                    ),
                });
            }
        }
        if let Some(channel) = self.channels.get(&(database.to_string(), shard_id)) {
            return Ok(channel.clone());
        }

        let channel = Channel::open(
            &self.cfg,
            database,
            shard_id,
            self.factory.clone(),
            self.shutdown_tx.subscribe(),
        )
        .await?;
        self.database_shards
            .insert(database.to_string(), num_shards);
        self.channels
            .insert((database.to_string(), shard_id), channel.clone());
        Ok(channel)
    }

    pub fn get_channel(&self, database: &str, shard_id: u32) -> Option<Arc<Channel>> {
        self.channels
            .get(&(database.to_string(), shard_id))
            .map(|entry| entry.clone())
    }

    fn shard_of(metric: &Metric, num_shards: u32) -> u32 {
        let mut hasher = twox_hash::XxHash64::with_seed(0);
        hasher.write(&metric.tag_signature());
        (hasher.finish() % num_shards as u64) as u32
    }

    /// Route a metric batch to its shards and append one encoded payload
    /// per shard touched.
    pub async fn write(&self, metric_list: &MetricList) -> Result<()> {
        let num_shards = self
            .database_shards
            .get(&metric_list.database)
            .map(|entry| *entry)
            .ok_or_else(|| Error::DatabaseNotFound(metric_list.database.clone()))?;

        let mut groups: HashMap<u32, Vec<Metric>> = HashMap::new();
        for metric in &metric_list.metrics {
            groups
                .entry(Self::shard_of(metric, num_shards))
                .or_default()
                .push(metric.clone());
        }

        for (shard_id, metrics) in groups {
            let channel =
                self.get_channel(&metric_list.database, shard_id)
                    .ok_or(Error::ChannelNotFound {
                        database: metric_list.database.clone(),
                        shard_id,
                    })?;
            let payload = MetricList {
                database: metric_list.database.clone(),
                metrics,
            }
            .encode();
            channel.write(payload).await?;
        }
        Ok(())
    }

    /// Stop the report ticker, every replicator, and every queue.
    pub async fn close(&self) {
        let _ = self.shutdown_tx.send(true);
        let report_task = self.report_task.lock().take();
        if let Some(task) = report_task {
            let _ = task.await;
        }
        for entry in self.channels.iter() {
            entry.value().close().await;
        }
        info!("channel manager closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replicator::ReplicatorPhase;
    use crate::rpc::{WriteClient, WriteRequest, WriteResponse, WriteStreamReceiver, WriteStreamSender};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tempfile::TempDir;

    struct NopReport;

    impl StateReport for NopReport {
        fn report(&self, _state: &ReplicatorState) -> Result<()> {
            Err(Error::Transient("aggregator offline".to_string()))
        }
    }

    /// A factory whose connections always fail.
    struct FailingFactory;

    #[async_trait]
    impl StreamFactory for FailingFactory {
        async fn create_write_client(&self, _target: &str) -> Result<Box<dyn WriteClient>> {
            Err(Error::Transient("connection refused".to_string()))
        }
    }

    /// A working in-memory target: every sent request is recorded and
    /// immediately acked.
    #[derive(Default)]
    struct MockTarget {
        requests: StdMutex<Vec<WriteRequest>>,
        remote_seq: u64,
    }

    struct MockFactory {
        target: Arc<MockTarget>,
    }

    #[async_trait]
    impl StreamFactory for MockFactory {
        async fn create_write_client(&self, _target: &str) -> Result<Box<dyn WriteClient>> {
            Ok(Box::new(MockClient {
                target: self.target.clone(),
            }))
        }
    }

    struct MockClient {
        target: Arc<MockTarget>,
    }

    #[async_trait]
    impl WriteClient for MockClient {
        async fn next_seq(&mut self, _database: &str, _shard_id: u32) -> Result<u64> {
            Ok(self.target.remote_seq)
        }

        async fn open_stream(
            &mut self,
            _database: &str,
            _shard_id: u32,
        ) -> Result<(Box<dyn WriteStreamSender>, Box<dyn WriteStreamReceiver>)> {
            let (ack_tx, ack_rx) = tokio::sync::mpsc::unbounded_channel();
            Ok((
                Box::new(MockSender {
                    target: self.target.clone(),
                    ack_tx,
                }),
                Box::new(MockReceiver { ack_rx }),
            ))
        }
    }

    struct MockSender {
        target: Arc<MockTarget>,
        ack_tx: tokio::sync::mpsc::UnboundedSender<u64>,
    }

    #[async_trait]
    impl WriteStreamSender for MockSender {
        async fn send(&mut self, request: WriteRequest) -> Result<()> {
            let seq = request.seq;
            self.target.requests.lock().unwrap().push(request);
            let _ = self.ack_tx.send(seq);
            Ok(())
        }
    }

    struct MockReceiver {
        ack_rx: tokio::sync::mpsc::UnboundedReceiver<u64>,
    }

    #[async_trait]
    impl WriteStreamReceiver for MockReceiver {
        async fn recv(&mut self) -> Result<WriteResponse> {
            match self.ack_rx.recv().await {
                Some(ack_seq) => Ok(WriteResponse { ack_seq }),
                None => Err(Error::Transient("stream closed".to_string())),
            }
        }
    }

    fn config(dir: &TempDir) -> ReplicationConfig {
        ReplicationConfig::new(dir.path())
    }

    async fn wait_until(mut probe: impl FnMut() -> bool, budget: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + budget;
        while tokio::time::Instant::now() < deadline {
            if probe() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        probe()
    }

    #[tokio::test]
    async fn test_create_channel_validates_shard_config() {
        let dir = TempDir::new().unwrap();
        let cm = ChannelManager::new(config(&dir), Arc::new(FailingFactory), Arc::new(NopReport));

        // shard id outside the shard count
        assert!(matches!(
            cm.create_channel("database", 2, 2).await,
            Err(Error::ShardConfigConflict { .. })
        ));

        let ch1 = cm.create_channel("database", 3, 0).await.unwrap();

        // shard count mismatch with the first successful call
        assert!(matches!(
            cm.create_channel("database", 2, 1).await,
            Err(Error::ShardConfigConflict { .. })
        ));

        // same config returns the same channel instance
        let ch2 = cm.create_channel("database", 3, 0).await.unwrap();
        assert!(Arc::ptr_eq(&ch1, &ch2));

        cm.close().await;
    }

    #[tokio::test]
    async fn test_replicator_is_created_once_per_target() {
        let dir = TempDir::new().unwrap();
        let cm = ChannelManager::new(config(&dir), Arc::new(FailingFactory), Arc::new(NopReport));
        let channel = cm.create_channel("database", 2, 0).await.unwrap();
        assert_eq!(channel.database(), "database");
        assert_eq!(channel.shard_id(), 0);
        assert!(channel.targets().is_empty());

        let rep1 = channel.get_or_create_replicator("node-1").await.unwrap();
        let rep2 = channel.get_or_create_replicator("node-1").await.unwrap();
        assert!(Arc::ptr_eq(&rep1, &rep2));
        assert_eq!(channel.targets(), vec!["node-1".to_string()]);

        cm.close().await;
    }

    #[tokio::test]
    async fn test_pending_stays_when_target_unreachable() {
        let dir = TempDir::new().unwrap();
        let cm = ChannelManager::new(config(&dir), Arc::new(FailingFactory), Arc::new(NopReport));
        let channel = cm.create_channel("database", 2, 0).await.unwrap();
        let replicator = channel.get_or_create_replicator("node-1").await.unwrap();

        channel.write(Bytes::from_static(b"123")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(replicator.pending(), 1);
        cm.close().await;

        // pending survives a broker restart: the cursor and the queue are
        // both on disk
        let cm = ChannelManager::new(config(&dir), Arc::new(FailingFactory), Arc::new(NopReport));
        let channel = cm.create_channel("database", 2, 0).await.unwrap();
        let replicator = channel.get_or_create_replicator("node-1").await.unwrap();
        assert_eq!(replicator.pending(), 1);
        cm.close().await;
    }

    #[tokio::test]
    async fn test_write_reaches_target_with_seq_one() {
        let dir = TempDir::new().unwrap();
        let target = Arc::new(MockTarget::default());
        let cm = ChannelManager::new(
            config(&dir),
            Arc::new(MockFactory {
                target: target.clone(),
            }),
            Arc::new(NopReport),
        );
        let channel = cm.create_channel("database", 2, 0).await.unwrap();
        let replicator = channel.get_or_create_replicator("node-1").await.unwrap();

        channel.write(Bytes::from_static(b"0")).await.unwrap();
        assert!(
            wait_until(|| replicator.pending() == 0, Duration::from_secs(2)).await,
            "replication should drain"
        );

        let requests = target.requests.lock().unwrap().clone();
        assert_eq!(
            requests,
            vec![WriteRequest {
                seq: 1,
                payload: Bytes::from_static(b"0"),
            }]
        );
        assert_eq!(replicator.phase(), ReplicatorPhase::Streaming);
        cm.close().await;
        assert_eq!(replicator.phase(), ReplicatorPhase::Closed);
    }

    #[tokio::test]
    async fn test_sync_skips_what_the_target_already_has() {
        let dir = TempDir::new().unwrap();
        let target = Arc::new(MockTarget {
            requests: StdMutex::new(Vec::new()),
            remote_seq: 3,
        });
        let cm = ChannelManager::new(
            config(&dir),
            Arc::new(MockFactory {
                target: target.clone(),
            }),
            Arc::new(NopReport),
        );
        let channel = cm.create_channel("database", 1, 0).await.unwrap();
        for i in 1..=5u8 {
            channel.write(Bytes::from(vec![i])).await.unwrap();
        }
        let replicator = channel.get_or_create_replicator("node-1").await.unwrap();
        assert!(
            wait_until(|| replicator.pending() == 0, Duration::from_secs(2)).await,
            "replication should drain"
        );

        let seqs: Vec<u64> = target
            .requests
            .lock()
            .unwrap()
            .iter()
            .map(|request| request.seq)
            .collect();
        assert_eq!(seqs, vec![4, 5]);
        cm.close().await;
    }

    #[tokio::test]
    async fn test_manager_write_routes_by_tags() {
        let dir = TempDir::new().unwrap();
        let cm = ChannelManager::new(config(&dir), Arc::new(FailingFactory), Arc::new(NopReport));

        let list = MetricList {
            database: "database".to_string(),
            metrics: vec![Metric {
                name: "cpu".to_string(),
                timestamp: 1_700_000_000_000,
                tags: [("host".to_string(), "1.1.1.1".to_string())].into(),
                fields: vec![emberdb_core::Field {
                    name: "sum".to_string(),
                    value: emberdb_core::FieldValue::Sum(1.0),
                }],
            }],
        };

        // no channel yet
        assert!(matches!(
            cm.write(&list).await,
            Err(Error::DatabaseNotFound(_))
        ));

        let ch0 = cm.create_channel("database", 1, 0).await.unwrap();
        cm.write(&list).await.unwrap();
        assert_eq!(ch0.append_seq(), 1);

        // a second batch appends behind the first
        cm.write(&list).await.unwrap();
        assert_eq!(ch0.append_seq(), 2);
        cm.close().await;
    }
}
