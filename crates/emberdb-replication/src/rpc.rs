//! The transport seam replicators drive.
//!
//! The real transport (connection management, TLS, retries below the stream
//! level) lives outside this crate. A replicator asks the factory for a
//! client to its target node, learns the target's durable high sequence
//! with `next_seq`, and opens one bidirectional stream per connection: the
//! send half carries `WriteRequest`s in sequence order, the receive half
//! returns cumulative acks.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// One replication request: a queue payload with its sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub seq: u64,
    pub payload: Bytes,
}

/// Cumulative ack: everything `≤ ack_seq` is durable on the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResponse {
    pub ack_seq: u64,
}

/// Creates write clients for target nodes.
#[async_trait]
pub trait StreamFactory: Send + Sync {
    async fn create_write_client(&self, target: &str) -> Result<Box<dyn WriteClient>>;
}

/// A connection to one storage target.
#[async_trait]
pub trait WriteClient: Send {
    /// The highest sequence the target has already persisted for the
    /// shard; 0 when it has nothing.
    async fn next_seq(&mut self, database: &str, shard_id: u32) -> Result<u64>;

    /// Open the bidirectional replication stream for the shard.
    async fn open_stream(
        &mut self,
        database: &str,
        shard_id: u32,
    ) -> Result<(Box<dyn WriteStreamSender>, Box<dyn WriteStreamReceiver>)>;
}

#[async_trait]
pub trait WriteStreamSender: Send {
    async fn send(&mut self, request: WriteRequest) -> Result<()>;
}

#[async_trait]
pub trait WriteStreamReceiver: Send {
    async fn recv(&mut self) -> Result<WriteResponse>;
}
