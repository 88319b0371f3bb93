//! Workload age tracking
//!
//! Records the first time each workload was seen. The ingestion path writes
//! (`observe`), decision strategies only read (`age`). Ages are measured on
//! the snapshot clock: `age = latest snapshot time - first seen`.

use crate::error::{QosError, Result};
use crate::models::{UsageSnapshot, WorkloadId};
use crate::pipeline::{Consumer, Producer};
use crate::state::WorkloadStateMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// First-seen timestamps per workload
pub struct AgeTracker {
    first_seen: WorkloadStateMap<f64>,
    now: Mutex<f64>,
}

impl Default for AgeTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl AgeTracker {
    pub fn new() -> Self {
        Self {
            first_seen: WorkloadStateMap::new(),
            now: Mutex::new(0.0),
        }
    }

    /// Insert a first-seen timestamp unless the workload is already tracked
    pub fn observe(&self, id: &WorkloadId, now: f64) {
        self.first_seen.with_entry(id, || now, |_| ());
        let mut clock = crate::pipeline::lock(&self.now);
        if now > *clock {
            *clock = now;
        }
    }

    /// Time since the workload was first seen
    pub fn age(&self, id: &WorkloadId) -> Result<Duration> {
        let now = *crate::pipeline::lock(&self.now);
        self.age_at(id, now)
    }

    /// Time between first sighting and `now`
    pub fn age_at(&self, id: &WorkloadId, now: f64) -> Result<Duration> {
        let first_seen = self
            .first_seen
            .get(id)
            .ok_or_else(|| QosError::NotPresent(id.clone()))?;
        Ok(Duration::from_secs_f64((now - first_seen).max(0.0)))
    }

    pub fn first_seen(&self, id: &WorkloadId) -> Option<f64> {
        self.first_seen.get(id)
    }

    pub fn tracked(&self) -> usize {
        self.first_seen.len()
    }

    /// Record every identified workload of a snapshot and evict the
    /// ones missing from the last two snapshots
    pub fn observe_snapshot(&self, snapshot: &UsageSnapshot) {
        self.first_seen.begin_cycle();
        for id in snapshot.samples.iter().filter_map(|s| s.id.as_ref()) {
            self.observe(id, snapshot.timestamp);
        }
        let evicted = self.first_seen.evict_stale();
        if evicted > 0 {
            debug!(evicted = evicted, "Evicted stale workload ages");
        }
    }
}

/// Pass-through stage feeding the age tracker
pub struct AgeFilter {
    tracker: Arc<AgeTracker>,
    producer: Producer<UsageSnapshot>,
}

impl AgeFilter {
    pub fn new(tracker: Arc<AgeTracker>, producer: Producer<UsageSnapshot>) -> Self {
        Self { tracker, producer }
    }
}

impl Consumer<UsageSnapshot> for AgeFilter {
    fn consume(&self, snapshot: &UsageSnapshot) -> Result<()> {
        self.tracker.observe_snapshot(snapshot);
        self.producer.produce(snapshot);
        Ok(())
    }
}
