//! Usage-based sample filters

use super::age::AgeTracker;
use crate::error::{QosError, Result};
use crate::models::UsageSnapshot;
use crate::pipeline::{Consumer, Producer};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Default minimal cpu usage (cpus per second) of a production workload
pub const DEFAULT_MINIMAL_CPU_USAGE: f64 = 0.25;

/// Default age a workload needs before it counts for estimation
pub const DEFAULT_NEW_EXECUTOR_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// Default fraction of node cpus above which slack is not estimated
pub const DEFAULT_UTILIZATION_THRESHOLD: f64 = 0.95;

/// Drops production workloads too idle to judge interference on.
/// Best-effort workloads always pass.
pub struct TooLowUsageFilter {
    minimal_cpu_usage: f64,
    producer: Producer<UsageSnapshot>,
}

impl TooLowUsageFilter {
    pub fn new(minimal_cpu_usage: f64, producer: Producer<UsageSnapshot>) -> Self {
        Self {
            minimal_cpu_usage,
            producer,
        }
    }
}

impl Consumer<UsageSnapshot> for TooLowUsageFilter {
    fn consume(&self, snapshot: &UsageSnapshot) -> Result<()> {
        let samples = snapshot
            .samples
            .iter()
            .filter(|s| {
                if s.is_revocable() {
                    return true;
                }
                match s.stats.as_ref().and_then(|st| st.cpu_usage) {
                    Some(usage) if usage > self.minimal_cpu_usage => true,
                    usage => {
                        debug!(workload = %s.label(), usage = ?usage, "Usage too low, filtered");
                        false
                    }
                }
            })
            .cloned()
            .collect();

        self.producer.produce(&snapshot.with_samples(samples));
        Ok(())
    }
}

/// Passes only workloads older than a threshold
pub struct IgnoreNewExecutorsFilter {
    ages: Arc<AgeTracker>,
    threshold: Duration,
    producer: Producer<UsageSnapshot>,
}

impl IgnoreNewExecutorsFilter {
    pub fn new(ages: Arc<AgeTracker>, threshold: Duration, producer: Producer<UsageSnapshot>) -> Self {
        Self {
            ages,
            threshold,
            producer,
        }
    }
}

impl Consumer<UsageSnapshot> for IgnoreNewExecutorsFilter {
    fn consume(&self, snapshot: &UsageSnapshot) -> Result<()> {
        let samples = snapshot
            .samples
            .iter()
            .filter(|s| {
                let Some(id) = s.id.as_ref() else {
                    return false;
                };
                match self.ages.age(id) {
                    Ok(age) => age >= self.threshold,
                    Err(e) => {
                        debug!(workload = %id, error = %e, "No age, treating as new");
                        false
                    }
                }
            })
            .cloned()
            .collect();

        self.producer.produce(&snapshot.with_samples(samples));
        Ok(())
    }
}

/// Stops the cycle when the node is already nearly saturated
pub struct UtilizationThresholdFilter {
    threshold: f64,
    producer: Producer<UsageSnapshot>,
}

impl UtilizationThresholdFilter {
    pub fn new(threshold: f64, producer: Producer<UsageSnapshot>) -> Self {
        Self {
            threshold,
            producer,
        }
    }
}

impl Consumer<UsageSnapshot> for UtilizationThresholdFilter {
    fn consume(&self, snapshot: &UsageSnapshot) -> Result<()> {
        let total = snapshot.total_cpus.ok_or(QosError::NoTotalCapacity)?;
        let used: f64 = snapshot
            .samples
            .iter()
            .filter_map(|s| s.stats.as_ref()?.best_cpu_usage())
            .sum();

        let limit = self.threshold * total;
        if used > limit {
            info!(
                used_cpus = used,
                limit_cpus = limit,
                "Node utilization above threshold, skipping estimation"
            );
            return Ok(());
        }

        self.producer.produce(snapshot);
        Ok(())
    }
}

/// Forwards only production (non-revocable) workloads
pub struct ProductionPassFilter {
    producer: Producer<UsageSnapshot>,
}

impl ProductionPassFilter {
    pub fn new(producer: Producer<UsageSnapshot>) -> Self {
        Self { producer }
    }
}

impl Consumer<UsageSnapshot> for ProductionPassFilter {
    fn consume(&self, snapshot: &UsageSnapshot) -> Result<()> {
        let samples = snapshot
            .samples
            .iter()
            .filter(|s| !s.is_revocable())
            .cloned()
            .collect();
        self.producer.produce(&snapshot.with_samples(samples));
        Ok(())
    }
}
