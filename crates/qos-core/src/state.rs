//! Per-workload state maps with explicit age-out
//!
//! Stages that remember something per workload keep it in a
//! [`WorkloadStateMap`]. Each snapshot starts a new cycle; entries not
//! touched during the last two cycles are evicted.

use crate::models::WorkloadId;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Number of consecutive snapshots a workload may be absent before eviction
pub const ABSENT_CYCLES_BEFORE_EVICTION: u64 = 2;

struct Tracked<V> {
    value: V,
    last_cycle: u64,
}

/// Concurrent map of per-workload state keyed by identity
pub struct WorkloadStateMap<V> {
    entries: DashMap<WorkloadId, Tracked<V>>,
    cycle: AtomicU64,
}

impl<V> Default for WorkloadStateMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> WorkloadStateMap<V> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            cycle: AtomicU64::new(0),
        }
    }

    /// Start a new snapshot cycle and return its number
    pub fn begin_cycle(&self) -> u64 {
        self.cycle.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn current_cycle(&self) -> u64 {
        self.cycle.load(Ordering::SeqCst)
    }

    /// Mark the workload as present in the current cycle
    pub fn touch(&self, id: &WorkloadId) {
        let cycle = self.current_cycle();
        if let Some(mut entry) = self.entries.get_mut(id) {
            entry.last_cycle = cycle;
        }
    }

    pub fn insert(&self, id: WorkloadId, value: V) -> Option<V> {
        let cycle = self.current_cycle();
        self.entries
            .insert(
                id,
                Tracked {
                    value,
                    last_cycle: cycle,
                },
            )
            .map(|t| t.value)
    }

    /// Run `f` on the workload's state, creating it with `init` first if absent.
    /// The entry is stamped with the current cycle.
    pub fn with_entry<R>(
        &self,
        id: &WorkloadId,
        init: impl FnOnce() -> V,
        f: impl FnOnce(&mut V) -> R,
    ) -> R {
        let cycle = self.current_cycle();
        let mut entry = self.entries.entry(id.clone()).or_insert_with(|| Tracked {
            value: init(),
            last_cycle: cycle,
        });
        entry.last_cycle = cycle;
        f(&mut entry.value)
    }

    /// Run `f` on existing state without creating or stamping it
    pub fn with_existing<R>(&self, id: &WorkloadId, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        self.entries.get_mut(id).map(|mut e| f(&mut e.value))
    }

    pub fn contains(&self, id: &WorkloadId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Apply `f` to every tracked state
    pub fn for_each_mut(&self, mut f: impl FnMut(&WorkloadId, &mut V)) {
        for mut entry in self.entries.iter_mut() {
            let (id, tracked) = entry.pair_mut();
            f(id, &mut tracked.value);
        }
    }

    /// Drop entries absent from the last two cycles; returns how many were removed
    pub fn evict_stale(&self) -> usize {
        let cycle = self.current_cycle();
        let before = self.entries.len();
        self.entries
            .retain(|_, t| cycle.saturating_sub(t.last_cycle) < ABSENT_CYCLES_BEFORE_EVICTION);
        before - self.entries.len()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl<V: Clone> WorkloadStateMap<V> {
    pub fn get(&self, id: &WorkloadId) -> Option<V> {
        self.entries.get(id).map(|t| t.value.clone())
    }
}
