//! Node-wide cpu overload detection

use crate::config::{keys, QosConfig};
use crate::error::Result;
use crate::models::{Contention, UsageSnapshot, WorkloadId};
use crate::pipeline::{Consumer, Producer};
use tracing::{debug, error, info};

/// Default fraction of node cpus above which the node counts as overloaded
pub const DEFAULT_OVERLOAD_THRESHOLD: f64 = 0.72;

/// Emits a cpu contention when the summed usage of all workloads exceeds
/// `threshold * total_cpus` and best-effort workloads are present.
///
/// Severity is the number of cpus above the threshold. The victim is the
/// busiest production workload.
pub struct OverloadDetector {
    threshold: f64,
    producer: Producer<Vec<Contention>>,
}

impl OverloadDetector {
    pub fn new(threshold: f64, producer: Producer<Vec<Contention>>) -> Self {
        Self {
            threshold,
            producer,
        }
    }

    pub fn from_config(config: &QosConfig, producer: Producer<Vec<Contention>>) -> Self {
        Self::new(
            config.positive_f64_or(keys::OVERLOAD_THRESHOLD, DEFAULT_OVERLOAD_THRESHOLD),
            producer,
        )
    }

    fn detect(&self, snapshot: &UsageSnapshot) -> Vec<Contention> {
        let Some(total_cpus) = snapshot.total_cpus else {
            error!("No total cpus in usage snapshot");
            return Vec::new();
        };
        let threshold_cpus = self.threshold * total_cpus;

        let mut sum_cpus = 0.0;
        let mut best_effort = 0usize;
        let mut victim: Option<(&WorkloadId, f64)> = None;
        let mut first: Option<&WorkloadId> = None;

        for sample in &snapshot.samples {
            let Some((id, stats)) = sample.complete() else {
                debug!(workload = %sample.label(), "Workload without statistics skipped");
                continue;
            };
            let Some(usage) = stats.best_cpu_usage() else {
                debug!(workload = %id, "No cpu usage for workload");
                continue;
            };

            sum_cpus += usage;
            first.get_or_insert(id);
            if sample.is_revocable() {
                best_effort += 1;
            } else if victim.map_or(true, |(_, best)| usage > best) {
                victim = Some((id, usage));
            }
        }

        info!(
            sum_cpus = sum_cpus,
            total_cpus = total_cpus,
            threshold_cpus = threshold_cpus,
            "Node cpu utilization"
        );

        if sum_cpus <= threshold_cpus {
            return Vec::new();
        }
        if best_effort == 0 {
            info!("No best-effort workloads, only high node utilization");
            return Vec::new();
        }

        let Some(victim) = victim.map(|(id, _)| id).or(first) else {
            return Vec::new();
        };
        let severity = sum_cpus - threshold_cpus;
        info!(
            victim = %victim,
            severity = severity,
            "Creating cpu contention, usage above threshold"
        );
        vec![Contention::cpu(victim.clone(), severity, snapshot.timestamp)]
    }
}

impl Consumer<UsageSnapshot> for OverloadDetector {
    fn consume(&self, snapshot: &UsageSnapshot) -> Result<()> {
        let contentions = self.detect(snapshot);
        self.producer.produce(&contentions);
        Ok(())
    }
}
