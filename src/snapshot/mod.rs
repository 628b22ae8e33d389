use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Instant;

use serde::Serialize;
use utoipa::ToSchema;

use crate::metering_p1::structs::{format_number, Snapshot};

/// Holds the most recent snapshot for the HTTP side.
///
/// The lock only guards a `Copy` value, readers copy it out and release
/// the lock immediately.
pub struct SnapshotPublisher {
    latest: RwLock<Option<(Snapshot, Instant)>>,
}

impl SnapshotPublisher {
    pub fn new() -> Self {
        Self { latest: RwLock::new(None) }
    }

    pub fn publish(&self, snapshot: Snapshot) {
        // a poisoned lock still holds a complete value
        let mut guard = self.latest.write().unwrap_or_else(|e| e.into_inner());
        *guard = Some((snapshot, Instant::now()));
    }

    /// `None` until the first telegram made it through the pipeline.
    pub fn read(&self) -> Option<Snapshot> {
        self.read_with_age().map(|(snapshot, _)| snapshot)
    }

    /// Latest snapshot and the seconds since it was published.
    pub fn read_with_age(&self) -> Option<(Snapshot, u64)> {
        let latest = *self.latest.read().unwrap_or_else(|e| e.into_inner());
        latest.map(|(snapshot, at)| (snapshot, at.elapsed().as_secs()))
    }
}

impl Default for SnapshotPublisher {
    fn default() -> Self {
        Self::new()
    }
}

/// Wire format of the live reading, all values rendered as strings.
#[derive(Debug, Serialize, ToSchema, PartialEq)]
pub struct LiveReading {
    /// Meter time in Unix seconds
    pub ts: String,
    /// Total consumption, day plus night rate
    pub c: String,
    /// Total production, day plus night rate
    pub p: String,
}

impl From<Snapshot> for LiveReading {
    fn from(s: Snapshot) -> Self {
        LiveReading {
            ts: s.unix_timestamp.to_string(),
            c: format_number(s.total_consumption),
            p: format_number(s.total_production),
        }
    }
}

/// Counters of the acquisition loop, reported on `/health`.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub telegrams: AtomicU64,
    pub published: AtomicU64,
    pub framing_faults: AtomicU64,
    pub checksum_faults: AtomicU64,
    pub field_faults: AtomicU64,
    pub stream_faults: AtomicU64,
    pub storage_faults: AtomicU64,
}

impl PipelineStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
