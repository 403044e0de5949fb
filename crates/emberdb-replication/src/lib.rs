//! Broker-side replication channel.
//!
//! Writes for a (database, shard) pair are serialized into an append-only
//! segmented log on local disk, then fanned out to storage replicas by one
//! replicator per target node. The client write returns once the append is
//! durable; replication runs behind it and its lag is observable through
//! periodic state reports.
//!
//! ```text
//! ChannelManager ── routes MetricList by tag hash
//!   └─ Channel (database, shard)
//!        ├─ FanOutQueue ── append-only segments + per-consumer cursors
//!        └─ Replicator per target ── CONNECTING → SYNCING → STREAMING
//! ```
//!
//! The RPC transport is not part of this crate: replicators drive the
//! [`rpc::StreamFactory`] seam, which hands back a bidirectional stream
//! pair for one (database, shard, target).

pub mod channel;
pub mod config;
pub mod error;
pub mod queue;
pub mod replicator;
pub mod rpc;
pub mod segment;

pub use channel::{Channel, ChannelManager, StateReport};
pub use config::ReplicationConfig;
pub use error::{Error, Result};
pub use queue::FanOutQueue;
pub use replicator::{Replicator, ReplicatorPhase, ReplicatorState};
pub use rpc::{
    StreamFactory, WriteClient, WriteRequest, WriteResponse, WriteStreamReceiver,
    WriteStreamSender,
};
