//! The per-shard fan-out queue.
//!
//! One appender, many independent consumers. Appends go to the active
//! [`LogSegment`] under a single append lock and rotate it when it would
//! exceed the configured size; consumers read sealed and active segments
//! lock-free against each other and track their own cursor, persisted as a
//! big-endian `u64` under `consumers/<target>.cur`.
//!
//! Sequences start at 1; `append_seq` is the sequence of the last appended
//! record, 0 when the queue is empty. A consumer at cursor `s` has acked
//! everything `≤ s` and next consumes `s + 1`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::segment::LogSegment;

/// Persist-every-ack would fsync the cursor file on each response; batching
/// syncs every N advances instead, the cursor is rebuilt from the remote
/// side on reconnect anyway.
const CURSOR_SYNC_EVERY: u32 = 16;

/// One consumer's position in the queue.
pub struct ConsumerCursor {
    target: String,
    seq: AtomicU64,
    file: Mutex<tokio::fs::File>,
    acks_since_sync: AtomicU32,
}

impl ConsumerCursor {
    async fn load(dir: &Path, target: &str) -> Result<ConsumerCursor> {
        let path = dir.join(format!("{target}.cur"));
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .await?;
        let mut raw = [0u8; 8];
        let seq = match file.read_exact(&mut raw).await {
            Ok(_) => u64::from_be_bytes(raw),
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => 0,
            Err(err) => return Err(err.into()),
        };
        Ok(ConsumerCursor {
            target: target.to_string(),
            seq: AtomicU64::new(seq),
            file: Mutex::new(file),
            acks_since_sync: AtomicU32::new(0),
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Last acked sequence.
    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// Advance the cursor; never moves backwards.
    pub async fn ack(&self, up_to: u64) -> Result<()> {
        let mut current = self.seq.load(Ordering::Acquire);
        loop {
            if up_to <= current {
                return Ok(());
            }
            match self
                .seq
                .compare_exchange(current, up_to, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.persist(up_to).await
    }

    async fn persist(&self, seq: u64) -> Result<()> {
        let mut file = self.file.lock().await;
        file.seek(std::io::SeekFrom::Start(0)).await?;
        file.write_all(&seq.to_be_bytes()).await?;
        let advances = self.acks_since_sync.fetch_add(1, Ordering::Relaxed) + 1;
        if advances >= CURSOR_SYNC_EVERY {
            self.acks_since_sync.store(0, Ordering::Relaxed);
            file.sync_data().await?;
        }
        Ok(())
    }

    async fn sync(&self) -> Result<()> {
        let file = self.file.lock().await;
        file.sync_data().await?;
        Ok(())
    }
}

pub struct FanOutQueue {
    dir: PathBuf,
    consumers_dir: PathBuf,
    segment_bytes: u64,
    /// Sequence of the last appended record.
    append_seq: AtomicU64,
    /// Ordered ascending by base sequence; the last one is active.
    segments: RwLock<Vec<Arc<LogSegment>>>,
    append_lock: Mutex<()>,
    appended: Notify,
    consumers: DashMap<String, Arc<ConsumerCursor>>,
    sync_on_append: bool,
    /// With group-commit, sync anyway once this many records accumulated.
    sync_every_records: u64,
    unsynced_records: AtomicU64,
}

impl FanOutQueue {
    /// Open or create the queue under `dir`, recovering segments and
    /// consumer cursors. `sync_on_append` syncs every record; otherwise the
    /// group-commit ticker and the `sync_every_records` bound drive syncs.
    pub async fn open(
        dir: &Path,
        segment_bytes: u64,
        sync_on_append: bool,
        sync_every_records: u64,
    ) -> Result<FanOutQueue> {
        let consumers_dir = dir.join("consumers");
        tokio::fs::create_dir_all(&consumers_dir).await?;

        let mut bases = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(base) = name.strip_suffix(".log") {
                if let Ok(base) = base.parse::<u64>() {
                    bases.push(base);
                }
            }
        }
        bases.sort_unstable();

        let mut segments = Vec::with_capacity(bases.len().max(1));
        for (idx, base) in bases.iter().enumerate() {
            let writable = idx == bases.len() - 1;
            segments.push(Arc::new(LogSegment::open(dir, *base, writable).await?));
        }
        if segments.is_empty() {
            segments.push(Arc::new(LogSegment::create(dir, 1).await?));
        }
        let append_seq = segments.last().expect("at least one segment").last_seq().await;

        let queue = FanOutQueue {
            dir: dir.to_path_buf(),
            consumers_dir: consumers_dir.clone(),
            segment_bytes,
            append_seq: AtomicU64::new(append_seq),
            segments: RwLock::new(segments),
            append_lock: Mutex::new(()),
            appended: Notify::new(),
            consumers: DashMap::new(),
            sync_on_append,
            sync_every_records: sync_every_records.max(1),
            unsynced_records: AtomicU64::new(0),
        };

        let mut entries = tokio::fs::read_dir(&consumers_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(target) = name.strip_suffix(".cur") {
                queue.consumer(target).await?;
            }
        }

        info!(dir = %dir.display(), append_seq, "fan-out queue opened");
        Ok(queue)
    }

    /// Sequence of the last appended record, 0 when empty.
    pub fn append_seq(&self) -> u64 {
        self.append_seq.load(Ordering::Acquire)
    }

    /// Append one payload; returns its sequence. Durable (modulo the
    /// group-commit window) once this returns.
    pub async fn append(&self, payload: &[u8]) -> Result<u64> {
        let _guard = self.append_lock.lock().await;
        let seq = self.append_seq() + 1;

        let active = { self.segments.read().await.last().expect("active segment").clone() };
        let active = if active.size().await + 4 + payload.len() as u64 > self.segment_bytes
            && active.size().await > 0
        {
            active.seal().await?;
            let next = Arc::new(LogSegment::create(&self.dir, seq).await?);
            self.segments.write().await.push(next.clone());
            debug!(base_seq = seq, "rotated log segment");
            next
        } else {
            active
        };

        active.append(payload).await?;
        if self.sync_on_append {
            active.sync().await?;
        } else {
            let unsynced = self.unsynced_records.fetch_add(1, Ordering::Relaxed) + 1;
            if unsynced >= self.sync_every_records {
                self.unsynced_records.store(0, Ordering::Relaxed);
                active.sync().await?;
            }
        }
        self.append_seq.store(seq, Ordering::Release);
        self.appended.notify_waiters();
        Ok(seq)
    }

    /// Read the payload of one sequence.
    pub async fn get_message(&self, seq: u64) -> Result<Bytes> {
        let segment = {
            let segments = self.segments.read().await;
            let idx = match segments.binary_search_by_key(&seq, |s| s.base_seq()) {
                Ok(idx) => idx,
                Err(0) => return Err(Error::NotFound(seq)),
                Err(idx) => idx - 1,
            };
            segments[idx].clone()
        };
        segment.read(seq).await
    }

    /// Wait until `append_seq >= seq`.
    pub async fn wait_for(&self, seq: u64) {
        loop {
            let notified = self.appended.notified();
            if self.append_seq() >= seq {
                return;
            }
            notified.await;
        }
    }

    /// Get or create the cursor of one consumer.
    pub async fn consumer(&self, target: &str) -> Result<Arc<ConsumerCursor>> {
        if let Some(cursor) = self.consumers.get(target) {
            return Ok(cursor.clone());
        }
        let cursor = Arc::new(ConsumerCursor::load(&self.consumers_dir, target).await?);
        Ok(self
            .consumers
            .entry(target.to_string())
            .or_insert(cursor)
            .clone())
    }

    pub fn consumers(&self) -> Vec<Arc<ConsumerCursor>> {
        self.consumers.iter().map(|e| e.value().clone()).collect()
    }

    /// Drop sealed segments every consumer has passed. The active segment
    /// always stays; with no consumers registered nothing is dropped.
    pub async fn remove_stale_segments(&self) -> Result<usize> {
        let Some(min_seq) = self
            .consumers
            .iter()
            .map(|e| e.value().seq())
            .min()
        else {
            return Ok(0);
        };

        let stale: Vec<Arc<LogSegment>> = {
            let mut segments = self.segments.write().await;
            let mut stale = Vec::new();
            while segments.len() > 1 {
                let first = segments[0].clone();
                if first.last_seq().await <= min_seq {
                    segments.remove(0);
                    stale.push(first);
                } else {
                    break;
                }
            }
            stale
        };

        let removed = stale.len();
        for segment in stale {
            if let Err(err) = segment.remove().await {
                warn!(base_seq = segment.base_seq(), error = %err, "failed to delete stale segment");
            }
        }
        if removed > 0 {
            debug!(removed, min_seq, "removed stale segments");
        }
        Ok(removed)
    }

    /// Flush the active segment; the group-commit ticker drives this when
    /// `sync_on_append` is off.
    pub async fn sync(&self) -> Result<()> {
        let active = { self.segments.read().await.last().expect("active segment").clone() };
        active.sync().await
    }

    /// Flush everything and persist cursors.
    pub async fn close(&self) -> Result<()> {
        self.sync().await?;
        for cursor in self.consumers() {
            cursor.sync().await?;
        }
        Ok(())
    }
}
