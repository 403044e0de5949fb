//! One replicator per (database, shard, target).
//!
//! The replicator is a consumer of the shard's [`FanOutQueue`] paired with
//! one remote target. A single driver task walks the connection state
//! machine:
//!
//! ```text
//! INIT → CONNECTING → SYNCING → STREAMING → (FAILED → CONNECTING ...) → CLOSED
//! ```
//!
//! While STREAMING, a sender task pulls payloads starting at the cursor and
//! pushes `WriteRequest`s, bounded by the unacked window; the driver itself
//! consumes acks and advances the cursor. Any stream error tears both down,
//! the state goes FAILED, and after a backoff the driver reconnects. The
//! cursor only ever advances on ack, so a reconnect resends everything the
//! target did not confirm; the target dedupes by comparing sequences
//! against its own cursor.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::queue::{ConsumerCursor, FanOutQueue};
use crate::rpc::{StreamFactory, WriteRequest, WriteStreamSender};

/// Connection state, readable without locking for lag reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplicatorPhase {
    Init = 0,
    Connecting = 1,
    Syncing = 2,
    Streaming = 3,
    Failed = 4,
    Closed = 5,
}

impl ReplicatorPhase {
    fn from_u8(value: u8) -> ReplicatorPhase {
        match value {
            1 => ReplicatorPhase::Connecting,
            2 => ReplicatorPhase::Syncing,
            3 => ReplicatorPhase::Streaming,
            4 => ReplicatorPhase::Failed,
            5 => ReplicatorPhase::Closed,
            _ => ReplicatorPhase::Init,
        }
    }
}

/// A lag report snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicatorState {
    pub database: String,
    pub shard_id: u32,
    pub target: String,
    pub append_seq: u64,
    pub consumer_seq: u64,
    pub pending: u64,
    pub phase: ReplicatorPhase,
}

pub struct Replicator {
    database: String,
    shard_id: u32,
    target: String,
    queue: Arc<FanOutQueue>,
    cursor: Arc<ConsumerCursor>,
    phase: Arc<AtomicU8>,
    driver: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

const BACKOFF_BASE_MS: u64 = 100;
const BACKOFF_CAP_MS: u64 = 30_000;

/// Exponential backoff with deterministic jitter from the attempt counter.
fn backoff(attempt: u32) -> Duration {
    let exp = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(10));
    let jitter = (attempt as u64).wrapping_mul(37) % BACKOFF_BASE_MS;
    Duration::from_millis(exp.min(BACKOFF_CAP_MS) + jitter)
}

impl Replicator {
    /// Create the replicator and start its driver task.
    pub async fn start(
        database: String,
        shard_id: u32,
        target: String,
        queue: Arc<FanOutQueue>,
        factory: Arc<dyn StreamFactory>,
        window_size: u64,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Arc<Replicator>> {
        let cursor = queue.consumer(&target).await?;
        let replicator = Arc::new(Replicator {
            database,
            shard_id,
            target,
            queue,
            cursor,
            phase: Arc::new(AtomicU8::new(ReplicatorPhase::Init as u8)),
            driver: parking_lot::Mutex::new(None),
        });
        let handle = tokio::spawn(Self::drive(
            replicator.clone(),
            factory,
            window_size,
            shutdown,
        ));
        *replicator.driver.lock() = Some(handle);
        Ok(replicator)
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn phase(&self) -> ReplicatorPhase {
        ReplicatorPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: ReplicatorPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Records appended but not yet acked by the target.
    pub fn pending(&self) -> u64 {
        self.queue.append_seq().saturating_sub(self.cursor.seq())
    }

    pub fn state(&self) -> ReplicatorState {
        let append_seq = self.queue.append_seq();
        let consumer_seq = self.cursor.seq();
        ReplicatorState {
            database: self.database.clone(),
            shard_id: self.shard_id,
            target: self.target.clone(),
            append_seq,
            consumer_seq,
            pending: append_seq.saturating_sub(consumer_seq),
            phase: self.phase(),
        }
    }

    /// Wait for the driver to exit after shutdown was signalled, aborting
    /// it if it does not come down in time. In-flight requests stay unacked
    /// and will be resent after a restart.
    pub async fn stop(&self) {
        let handle = self.driver.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(Duration::from_secs(5), &mut handle)
                .await
                .is_err()
            {
                handle.abort();
                let _ = handle.await;
            }
        }
        self.set_phase(ReplicatorPhase::Closed);
    }

    async fn drive(
        this: Arc<Replicator>,
        factory: Arc<dyn StreamFactory>,
        window_size: u64,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut attempt: u32 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }
            this.set_phase(ReplicatorPhase::Connecting);
            let result = Self::connect_and_stream(
                &this,
                &factory,
                window_size,
                &mut shutdown,
                &mut attempt,
            )
            .await;
            if *shutdown.borrow() {
                break;
            }
            if let Err(err) = result {
                this.set_phase(ReplicatorPhase::Failed);
                attempt = attempt.saturating_add(1);
                let delay = backoff(attempt);
                warn!(
                    database = %this.database,
                    shard = this.shard_id,
                    target = %this.target,
                    error = %err,
                    backoff_ms = delay.as_millis() as u64,
                    "replication stream failed, reconnecting"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
        this.set_phase(ReplicatorPhase::Closed);
        info!(
            database = %this.database,
            shard = this.shard_id,
            target = %this.target,
            "replicator closed"
        );
    }

    async fn connect_and_stream(
        this: &Arc<Replicator>,
        factory: &Arc<dyn StreamFactory>,
        window_size: u64,
        shutdown: &mut watch::Receiver<bool>,
        attempt: &mut u32,
    ) -> Result<()> {
        let mut client = factory.create_write_client(&this.target).await?;

        this.set_phase(ReplicatorPhase::Syncing);
        let remote_seq = client.next_seq(&this.database, this.shard_id).await?;
        if remote_seq > this.cursor.seq() {
            // the target is ahead of our local cursor; skip what it has
            this.cursor.ack(remote_seq).await?;
        }
        debug!(
            target = %this.target,
            remote_seq,
            local_seq = this.cursor.seq(),
            "replicator synced"
        );

        this.set_phase(ReplicatorPhase::Streaming);
        *attempt = 0;
        let (sender, mut receiver) = client.open_stream(&this.database, this.shard_id).await?;

        let ack_notify = Arc::new(Notify::new());
        let sender_task = tokio::spawn(Self::send_loop(
            this.clone(),
            sender,
            window_size,
            ack_notify.clone(),
            shutdown.clone(),
        ));

        // ack loop; any receive error tears the stream down
        let result = loop {
            tokio::select! {
                response = receiver.recv() => {
                    match response {
                        Ok(response) => {
                            this.cursor.ack(response.ack_seq).await?;
                            ack_notify.notify_waiters();
                        }
                        Err(err) => break Err(err),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break Ok(());
                    }
                }
            }
        };
        sender_task.abort();
        let _ = sender_task.await;
        result
    }

    async fn send_loop(
        this: Arc<Replicator>,
        mut sender: Box<dyn WriteStreamSender>,
        window_size: u64,
        ack_notify: Arc<Notify>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut next = this.cursor.seq() + 1;
        loop {
            if *shutdown.borrow() {
                return;
            }
            // bound the unacked window
            while next.saturating_sub(this.cursor.seq()) > window_size {
                let notified = ack_notify.notified();
                if next.saturating_sub(this.cursor.seq()) <= window_size {
                    break;
                }
                tokio::select! {
                    _ = notified => {}
                    _ = shutdown.changed() => return,
                }
            }
            tokio::select! {
                _ = this.queue.wait_for(next) => {}
                _ = shutdown.changed() => return,
            }
            let payload = match this.queue.get_message(next).await {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(seq = next, error = %err, "failed to read queued payload");
                    return;
                }
            };
            if sender
                .send(WriteRequest { seq: next, payload })
                .await
                .is_err()
            {
                // the driver sees the same failure through the receiver
                return;
            }
            next += 1;
        }
    }
}
