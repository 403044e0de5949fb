//! Error types for the replication channel.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Length prefix or sidecar checksum does not add up.
    #[error("corrupt log: {0}")]
    CorruptLog(String),

    /// Shard count disagrees with an earlier channel of the same database,
    /// or the shard id is outside the shard count.
    #[error("shard config conflict for database {database}: {reason}")]
    ShardConfigConflict { database: String, reason: String },

    /// Sequence lookup miss in the fan-out queue.
    #[error("sequence {0} not found")]
    NotFound(u64),

    #[error("no channel for database {0}")]
    DatabaseNotFound(String),

    #[error("no channel for database {database} shard {shard_id}")]
    ChannelNotFound { database: String, shard_id: u32 },

    /// Connection, stream, or remote failure; the replicator backs off and
    /// retries.
    #[error("transient replication failure: {0}")]
    Transient(String),

    #[error(transparent)]
    Codec(#[from] emberdb_core::Error),

    #[error("channel closed")]
    Closed,
}
