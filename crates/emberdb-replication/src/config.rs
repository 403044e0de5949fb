//! Replication channel configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Root directory of the per-shard queues; each (database, shard) gets
    /// a subdirectory under it.
    pub dir: PathBuf,

    /// Log segment rotation threshold, MiB.
    #[serde(default = "default_segment_file_size_mib")]
    pub segment_file_size_mib: u16,

    /// Segment garbage-collection period.
    #[serde(default = "default_remove_task_interval_ms")]
    pub remove_task_interval_ms: u64,

    /// Replicator lag reporting cadence.
    #[serde(default = "default_report_interval_ms")]
    pub report_interval_ms: u64,

    /// Group-commit period for queue fsyncs; 0 syncs on every append.
    #[serde(default)]
    pub flush_interval_ms: u64,

    /// With group-commit enabled, also sync once this many records have
    /// accumulated since the last sync.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: u64,

    /// Unacked requests a replicator keeps in flight.
    #[serde(default = "default_window_size")]
    pub window_size: u64,
}

impl ReplicationConfig {
    pub fn new(dir: impl Into<PathBuf>) -> ReplicationConfig {
        ReplicationConfig {
            dir: dir.into(),
            segment_file_size_mib: default_segment_file_size_mib(),
            remove_task_interval_ms: default_remove_task_interval_ms(),
            report_interval_ms: default_report_interval_ms(),
            flush_interval_ms: 0,
            buffer_size: default_buffer_size(),
            window_size: default_window_size(),
        }
    }

    pub fn segment_file_size(&self) -> u64 {
        self.segment_file_size_mib as u64 * 1024 * 1024
    }

    pub fn remove_task_interval(&self) -> Duration {
        Duration::from_millis(self.remove_task_interval_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }
}

fn default_segment_file_size_mib() -> u16 {
    128
}

fn default_remove_task_interval_ms() -> u64 {
    60_000
}

fn default_report_interval_ms() -> u64 {
    1_000
}

fn default_window_size() -> u64 {
    64
}

fn default_buffer_size() -> u64 {
    512
}
