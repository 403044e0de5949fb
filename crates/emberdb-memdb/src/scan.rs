//! Scan surface over the in-memory store.
//!
//! A scan asks one metric for a set of fields across an already-filtered
//! set of series (grouped by index version, since two versions can be live
//! during a flush). The store emits one event per series that is present
//! in the version's forward map and carries at least one of the requested
//! fields; the executor consuming the events lives outside this crate.

use emberdb_core::{MultiVersionSeriesIdSet, Version};

/// One scan request against a metric.
pub struct ScanContext<'a> {
    pub metric_id: u32,
    /// Series to visit, per index version.
    pub series_id_set: &'a MultiVersionSeriesIdSet,
    /// Requested field ids. Every id must be registered on the metric,
    /// otherwise the scan emits nothing.
    pub field_ids: Vec<u16>,
    pub worker: &'a mut dyn ScanWorker,
}

/// One series that matched the scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEvent {
    pub version: Version,
    pub series_id: u32,
    /// The requested fields this series actually carries.
    pub field_ids: Vec<u16>,
}

/// Receives scan events; implemented by the query executor.
pub trait ScanWorker {
    fn emit(&mut self, event: ScanEvent);
}

/// A worker that just collects events; used by tests.
#[derive(Default)]
pub struct CollectingScanWorker {
    pub events: Vec<ScanEvent>,
}

impl ScanWorker for CollectingScanWorker {
    fn emit(&mut self, event: ScanEvent) {
        self.events.push(event);
    }
}
