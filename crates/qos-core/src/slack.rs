//! Slack cpu estimation for best-effort workloads
//!
//! Slack is the cpu production workloads were granted but did not use:
//! `sum(cpus_limit - cpu_usage)`, capped so the node never offers more than
//! `max_oversubscription_fraction * total_cpus - sum(cpu_usage)`.

use crate::config::{keys, QosConfig};
use crate::error::{QosError, Result};
use crate::models::{SlackEstimate, UsageSnapshot};
use crate::observability::QosMetrics;
use crate::pipeline::{Consumer, Producer};
use tracing::{debug, error};

pub const DEFAULT_MAX_OVERSUBSCRIPTION_FRACTION: f64 = 0.8;

/// Estimates below this are reported as zero
pub const SLACK_EPSILON: f64 = 0.001;

pub struct SlackEstimator {
    max_oversubscription_fraction: f64,
    producer: Producer<SlackEstimate>,
    metrics: QosMetrics,
}

impl SlackEstimator {
    pub fn new(max_oversubscription_fraction: f64, producer: Producer<SlackEstimate>) -> Self {
        Self {
            max_oversubscription_fraction,
            producer,
            metrics: QosMetrics::new(),
        }
    }

    pub fn from_config(config: &QosConfig, producer: Producer<SlackEstimate>) -> Self {
        Self::new(
            config.positive_f64_or(
                keys::MAX_OVERSUBSCRIPTION_FRACTION,
                DEFAULT_MAX_OVERSUBSCRIPTION_FRACTION,
            ),
            producer,
        )
    }

    pub fn estimate(&self, snapshot: &UsageSnapshot) -> Result<SlackEstimate> {
        let total_cpus = snapshot.total_cpus.ok_or(QosError::NoTotalCapacity)?;

        let mut cpu_usage = 0.0;
        let mut slack = 0.0;
        for sample in &snapshot.samples {
            let Some((id, stats)) = sample.complete() else {
                continue;
            };
            let Some(usage) = stats.cpu_usage else {
                debug!(workload = %id, "No cpu usage yet, skipping");
                continue;
            };
            let limit = stats
                .cpus_limit
                .ok_or_else(|| QosError::missing(id, "cpus_limit"))?;

            cpu_usage += usage;
            slack += limit - usage;
        }

        let max_slack = self.max_oversubscription_fraction * total_cpus - cpu_usage;
        if slack > max_slack {
            slack = max_slack;
        }
        if slack < SLACK_EPSILON {
            slack = 0.0;
        }

        Ok(SlackEstimate {
            cpus: slack,
            timestamp: snapshot.timestamp,
        })
    }
}

impl Consumer<UsageSnapshot> for SlackEstimator {
    fn consume(&self, snapshot: &UsageSnapshot) -> Result<()> {
        let estimate = self.estimate(snapshot).map_err(|e| {
            error!(error = %e, "Cannot estimate slack resources");
            e
        })?;
        self.metrics.set_slack_cpus(estimate.cpus);
        self.producer.produce(&estimate);
        Ok(())
    }
}
