//! Cpu amount based selection

use super::{candidate_id, candidates, check_severities};
use crate::config::{keys, QosConfig};
use crate::error::Result;
use crate::filters::AgeTracker;
use crate::models::{Contention, ContentionType, CorrectionAction, UsageSnapshot, WorkloadId, WorkloadSample};
use std::time::Duration;
use tracing::{error, info, warn};

pub const DEFAULT_CPU_SEVERITY: f64 = 1.0;

const NAME: &str = "cpu_contention";

fn cpu_usage(sample: &WorkloadSample) -> Option<f64> {
    sample.stats.as_ref()?.best_cpu_usage()
}

/// Severity is the number of cpus to recover. Workloads running above
/// their allocation go first, then the youngest, until enough cpus are freed.
#[derive(Debug, Clone, Copy)]
pub struct CpuContentionStrategy {
    default_severity: f64,
}

impl Default for CpuContentionStrategy {
    fn default() -> Self {
        Self {
            default_severity: DEFAULT_CPU_SEVERITY,
        }
    }
}

impl CpuContentionStrategy {
    pub fn new(default_severity: f64) -> Self {
        Self { default_severity }
    }

    pub fn from_config(config: &QosConfig) -> Self {
        Self::new(config.positive_f64_or(keys::DEFAULT_SEVERITY, DEFAULT_CPU_SEVERITY))
    }

    pub fn decide(
        &self,
        ages: &AgeTracker,
        contentions: &[Contention],
        usage: &UsageSnapshot,
    ) -> Result<Vec<CorrectionAction>> {
        check_severities(NAME, contentions)?;

        let mut cpu_to_recover: f64 = 0.0;
        for contention in contentions {
            if contention.kind != ContentionType::Cpu {
                error!(victim = %contention.victim, "Cannot decide about contentions other than cpu");
            }
            cpu_to_recover = cpu_to_recover.max(contention.severity.unwrap_or(self.default_severity));
        }
        info!(cpus = cpu_to_recover, "Cpus to recover from best-effort workloads");

        let mut targets: Vec<WorkloadId> = Vec::new();
        let mut aged: Vec<(Duration, &WorkloadSample)> = Vec::new();

        for sample in candidates(usage) {
            if cpu_to_recover <= 0.0 {
                break;
            }
            let Some(id) = candidate_id(sample) else {
                continue;
            };
            let allocated = sample.allocation.cpus.unwrap_or(0.0);

            match cpu_usage(sample) {
                Some(used) if used > allocated => {
                    info!(workload = %id, usage = used, allocated = allocated, "Marked workload for limit violation");
                    targets.push(id.clone());
                    cpu_to_recover -= used;
                    continue;
                }
                Some(_) => {}
                None => {
                    error!(workload = %id, "No cpu usage for workload");
                    continue;
                }
            }

            match ages.age(id) {
                Ok(age) => aged.push((age, sample)),
                Err(e) => warn!(workload = %id, error = %e, "No age for workload, skipping"),
            }
        }

        if cpu_to_recover > 0.0 {
            aged.sort_by_key(|(age, _)| *age);
            for (age, sample) in aged {
                if cpu_to_recover <= 0.0 {
                    break;
                }
                let Some(id) = candidate_id(sample) else {
                    continue;
                };
                let recovered = cpu_usage(sample)
                    .or(sample.allocation.cpus)
                    .unwrap_or(0.0);
                info!(workload = %id, age_secs = age.as_secs_f64(), "Marked workload for removal");
                targets.push(id.clone());
                cpu_to_recover -= recovered;
            }
        }

        Ok(targets.into_iter().map(CorrectionAction::terminate).collect())
    }
}
