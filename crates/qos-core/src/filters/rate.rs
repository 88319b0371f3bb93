//! Cumulative counter to rate conversion
//!
//! Cpu time and perf counters arrive as monotonically growing totals. This
//! stage keeps the previous sample of every workload and writes per-interval
//! rates into the derived slots:
//! - `cpu_usage = Δ(user + system secs) / Δt` (0 when Δt is 0)
//! - `ipc = Δinstructions / Δcycles` (left empty when Δcycles is 0)

use crate::error::{QosError, Result};
use crate::models::{UsageSnapshot, WorkloadStats};
use crate::pipeline::{Consumer, Producer};
use crate::state::WorkloadStateMap;
use tracing::{debug, warn};

/// Cpu usage between two samples of the same workload
pub fn cpu_usage(previous: &WorkloadStats, current: &WorkloadStats) -> Result<f64> {
    let prev_cpu = previous
        .cpu_time_secs()
        .ok_or_else(|| QosError::missing("previous sample", "cpu time counters"))?;
    let cur_cpu = current
        .cpu_time_secs()
        .ok_or_else(|| QosError::missing("current sample", "cpu time counters"))?;

    let dt = current.timestamp - previous.timestamp;
    if dt == 0.0 {
        return Ok(0.0);
    }
    Ok((cur_cpu - prev_cpu) / dt)
}

/// Instructions per cycle between two samples; `None` when no cycles elapsed
pub fn ipc(previous: &WorkloadStats, current: &WorkloadStats) -> Option<f64> {
    let (prev, cur) = (previous.perf?, current.perf?);
    let cycles = cur.cycles - prev.cycles;
    if cycles <= 0.0 {
        return None;
    }
    let value = (cur.instructions - prev.instructions) / cycles;
    value.is_finite().then_some(value)
}

/// Converts cumulative counters into per-interval rates
pub struct RateFilter {
    previous: WorkloadStateMap<WorkloadStats>,
    producer: Producer<UsageSnapshot>,
}

impl RateFilter {
    pub fn new(producer: Producer<UsageSnapshot>) -> Self {
        Self {
            previous: WorkloadStateMap::new(),
            producer,
        }
    }

    pub fn tracked(&self) -> usize {
        self.previous.len()
    }
}

impl Consumer<UsageSnapshot> for RateFilter {
    fn consume(&self, snapshot: &UsageSnapshot) -> Result<()> {
        self.previous.begin_cycle();
        let mut out = Vec::with_capacity(snapshot.samples.len());

        for sample in &snapshot.samples {
            let Some((id, stats)) = sample.complete() else {
                warn!(workload = %sample.label(), "Sample without identity or statistics, skipping");
                continue;
            };

            let previous = self.previous.insert(id.clone(), stats.clone());
            let Some(previous) = previous else {
                debug!(workload = %id, "First sample, waiting for a second one");
                continue;
            };

            let mut rated = stats.clone();
            match cpu_usage(&previous, stats) {
                Ok(usage) => rated.cpu_usage = Some(usage),
                Err(e) => debug!(workload = %id, error = %e, "Cannot compute cpu usage"),
            }
            rated.ipc = ipc(&previous, stats);

            let mut sample = sample.clone();
            sample.stats = Some(rated);
            out.push(sample);
        }
        self.previous.evict_stale();

        if out.is_empty() {
            debug!("No workloads with rates this cycle, ending pipeline");
            return Ok(());
        }

        self.producer.produce(&snapshot.with_samples(out));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{WorkloadId, WorkloadSample};
    use crate::pipeline::ResultSlot;
    use std::sync::Arc;

    fn sample(ts: f64, cpu_secs: f64, instructions: f64, cycles: f64) -> WorkloadSample {
        WorkloadSample::new(WorkloadId::new("fw", "pr"))
            .production(2.0)
            .with_stats(
                WorkloadStats::at(ts)
                    .with_cpu_time(cpu_secs, 0.0)
                    .with_perf(instructions, cycles),
            )
    }

    #[test]
    fn test_cpu_usage_rate() {
        let a = WorkloadStats::at(10.0).with_cpu_time(4.0, 1.0);
        let b = WorkloadStats::at(20.0).with_cpu_time(10.0, 5.0);
        assert_eq!(cpu_usage(&a, &b).unwrap(), 1.0);
    }

    #[test]
    fn test_cpu_usage_zero_interval() {
        let a = WorkloadStats::at(10.0).with_cpu_time(4.0, 1.0);
        assert_eq!(cpu_usage(&a, &a).unwrap(), 0.0);
    }

    #[test]
    fn test_cpu_usage_missing_counters() {
        let a = WorkloadStats::at(10.0);
        let b = WorkloadStats::at(20.0).with_cpu_time(1.0, 1.0);
        assert!(cpu_usage(&a, &b).is_err());
    }

    #[test]
    fn test_ipc_guards_zero_cycles() {
        let a = WorkloadStats::at(1.0).with_perf(100.0, 50.0);
        let b = WorkloadStats::at(2.0).with_perf(300.0, 150.0);
        assert_eq!(ipc(&a, &b), Some(2.0));
        assert_eq!(ipc(&a, &a), None);
    }

    #[test]
    fn test_first_snapshot_ends_pipeline() {
        let sink = Arc::new(ResultSlot::<UsageSnapshot>::new());
        let filter = RateFilter::new(Producer::<UsageSnapshot>::new("rate").with_consumer(sink.clone()));

        filter
            .consume(&UsageSnapshot::new(1.0, vec![sample(1.0, 1.0, 100.0, 100.0)]))
            .unwrap();
        assert!(sink.take().is_none());

        filter
            .consume(&UsageSnapshot::new(2.0, vec![sample(2.0, 1.5, 250.0, 200.0)]))
            .unwrap();
        let out = sink.take().unwrap();
        let stats = out.samples[0].stats.as_ref().unwrap();
        assert_eq!(stats.cpu_usage, Some(0.5));
        assert_eq!(stats.ipc, Some(1.5));
    }

    #[test]
    fn test_incomplete_samples_never_reach_state() {
        let filter = RateFilter::new(Producer::<UsageSnapshot>::new("rate"));
        let incomplete = WorkloadSample::new(WorkloadId::new("fw", "x"));

        filter
            .consume(&UsageSnapshot::new(1.0, vec![incomplete]))
            .unwrap();
        assert_eq!(filter.tracked(), 0);
    }
}
