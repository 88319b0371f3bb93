//! Core data models for the QoS engine

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Workload identity: equality and hash are defined over the pair only
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkloadId {
    pub framework_id: String,
    pub executor_id: String,
}

impl WorkloadId {
    pub fn new(framework_id: impl Into<String>, executor_id: impl Into<String>) -> Self {
        Self {
            framework_id: framework_id.into(),
            executor_id: executor_id.into(),
        }
    }
}

impl fmt::Display for WorkloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.framework_id, self.executor_id)
    }
}

/// Resource allocation of a workload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    /// Allocated cpus
    #[serde(default)]
    pub cpus: Option<f64>,
    /// True when the allocation contains revocable (best-effort) resources
    #[serde(default)]
    pub revocable: bool,
}

/// Hardware performance counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PerfCounters {
    pub instructions: f64,
    pub cycles: f64,
}

/// Scalar signals a stage can read from a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    CpuUsage,
    Ipc,
    EmaCpuUsage,
    EmaIpc,
}

impl Signal {
    /// Slot an EMA over this signal writes to
    pub fn smoothed(self) -> Signal {
        match self {
            Signal::CpuUsage | Signal::EmaCpuUsage => Signal::EmaCpuUsage,
            Signal::Ipc | Signal::EmaIpc => Signal::EmaIpc,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Signal::CpuUsage => "cpu_usage",
            Signal::Ipc => "ipc",
            Signal::EmaCpuUsage => "ema_cpu_usage",
            Signal::EmaIpc => "ema_ipc",
        };
        f.write_str(name)
    }
}

/// Raw counters plus derived metric slots for one workload
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkloadStats {
    /// Sample time in seconds
    pub timestamp: f64,
    #[serde(default)]
    pub cpus_user_time_secs: Option<f64>,
    #[serde(default)]
    pub cpus_system_time_secs: Option<f64>,
    #[serde(default)]
    pub cpus_limit: Option<f64>,
    #[serde(default)]
    pub perf: Option<PerfCounters>,
    #[serde(default)]
    pub llc_occupancy: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipc: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ema_cpu_usage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ema_ipc: Option<f64>,
}

impl WorkloadStats {
    pub fn at(timestamp: f64) -> Self {
        Self {
            timestamp,
            ..Default::default()
        }
    }

    pub fn with_cpu_time(mut self, user_secs: f64, system_secs: f64) -> Self {
        self.cpus_user_time_secs = Some(user_secs);
        self.cpus_system_time_secs = Some(system_secs);
        self
    }

    pub fn with_perf(mut self, instructions: f64, cycles: f64) -> Self {
        self.perf = Some(PerfCounters {
            instructions,
            cycles,
        });
        self
    }

    pub fn with_cpus_limit(mut self, cpus: f64) -> Self {
        self.cpus_limit = Some(cpus);
        self
    }

    pub fn with_llc_occupancy(mut self, bytes: u64) -> Self {
        self.llc_occupancy = Some(bytes);
        self
    }

    pub fn with_signal(mut self, signal: Signal, value: f64) -> Self {
        self.set_signal(signal, value);
        self
    }

    /// Total cpu seconds (user + system), if both counters are present
    pub fn cpu_time_secs(&self) -> Option<f64> {
        Some(self.cpus_user_time_secs? + self.cpus_system_time_secs?)
    }

    pub fn signal(&self, signal: Signal) -> Option<f64> {
        match signal {
            Signal::CpuUsage => self.cpu_usage,
            Signal::Ipc => self.ipc,
            Signal::EmaCpuUsage => self.ema_cpu_usage,
            Signal::EmaIpc => self.ema_ipc,
        }
    }

    pub fn set_signal(&mut self, signal: Signal, value: f64) {
        let slot = match signal {
            Signal::CpuUsage => &mut self.cpu_usage,
            Signal::Ipc => &mut self.ipc,
            Signal::EmaCpuUsage => &mut self.ema_cpu_usage,
            Signal::EmaIpc => &mut self.ema_ipc,
        };
        *slot = Some(value);
    }

    /// Smoothed cpu usage when available, raw rate otherwise
    pub fn best_cpu_usage(&self) -> Option<f64> {
        self.ema_cpu_usage.or(self.cpu_usage)
    }
}

/// One workload entry of a usage snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkloadSample {
    #[serde(default)]
    pub id: Option<WorkloadId>,
    #[serde(default)]
    pub allocation: Allocation,
    #[serde(default)]
    pub stats: Option<WorkloadStats>,
}

impl WorkloadSample {
    pub fn new(id: WorkloadId) -> Self {
        Self {
            id: Some(id),
            ..Default::default()
        }
    }

    /// Mark as production (guaranteed) with the given allocation
    pub fn production(mut self, cpus: f64) -> Self {
        self.allocation = Allocation {
            cpus: Some(cpus),
            revocable: false,
        };
        self
    }

    /// Mark as best-effort (revocable) with the given allocation
    pub fn best_effort(mut self, cpus: f64) -> Self {
        self.allocation = Allocation {
            cpus: Some(cpus),
            revocable: true,
        };
        self
    }

    pub fn with_stats(mut self, stats: WorkloadStats) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn is_revocable(&self) -> bool {
        self.allocation.revocable
    }

    /// Identity and counters, or `None` when either is missing
    pub fn complete(&self) -> Option<(&WorkloadId, &WorkloadStats)> {
        Some((self.id.as_ref()?, self.stats.as_ref()?))
    }

    pub fn signal(&self, signal: Signal) -> Option<f64> {
        self.stats.as_ref()?.signal(signal)
    }

    /// Label used in logs for samples that may lack identity
    pub fn label(&self) -> String {
        self.id
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "<unknown>".to_string())
    }
}

/// Point-in-time usage report for a node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    /// Snapshot time in seconds
    pub timestamp: f64,
    /// Total cpus of the node
    #[serde(default)]
    pub total_cpus: Option<f64>,
    #[serde(default)]
    pub samples: Vec<WorkloadSample>,
}

impl UsageSnapshot {
    pub fn new(timestamp: f64, samples: Vec<WorkloadSample>) -> Self {
        Self {
            timestamp,
            total_cpus: None,
            samples,
        }
    }

    pub fn with_total_cpus(mut self, cpus: f64) -> Self {
        self.total_cpus = Some(cpus);
        self
    }

    /// Copy of this snapshot carrying different samples
    pub fn with_samples(&self, samples: Vec<WorkloadSample>) -> Self {
        Self {
            timestamp: self.timestamp,
            total_cpus: self.total_cpus,
            samples,
        }
    }

    /// Best-effort samples that carry an identity
    pub fn revocable(&self) -> impl Iterator<Item = &WorkloadSample> {
        self.samples
            .iter()
            .filter(|s| s.is_revocable() && s.id.is_some())
    }

    pub fn has_revocable(&self) -> bool {
        self.revocable().next().is_some()
    }

    pub fn find(&self, id: &WorkloadId) -> Option<&WorkloadSample> {
        self.samples.iter().find(|s| s.id.as_ref() == Some(id))
    }
}

/// Kind of resource under contention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentionType {
    Cpu,
    Other,
}

/// Signal that a production workload degraded beyond a threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contention {
    #[serde(rename = "type")]
    pub kind: ContentionType,
    /// Amount of the victim's resource to free; absent means minimal correction
    #[serde(default)]
    pub severity: Option<f64>,
    pub victim: WorkloadId,
    /// When absent, the strategy selects aggressors
    #[serde(default)]
    pub aggressor: Option<WorkloadId>,
    pub timestamp: f64,
}

impl Contention {
    /// CPU contention; severity is only recorded when positive
    pub fn cpu(victim: WorkloadId, severity: f64, timestamp: f64) -> Self {
        Self {
            kind: ContentionType::Cpu,
            severity: (severity > 0.0).then_some(severity),
            victim,
            aggressor: None,
            timestamp,
        }
    }

    pub fn with_aggressor(mut self, aggressor: WorkloadId) -> Self {
        self.aggressor = Some(aggressor);
        self
    }
}

/// Kind of correction handed to the executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrectionKind {
    Terminate,
}

/// Decision to act on one workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectionAction {
    pub kind: CorrectionKind,
    pub target: WorkloadId,
}

impl CorrectionAction {
    pub fn terminate(target: WorkloadId) -> Self {
        Self {
            kind: CorrectionKind::Terminate,
            target,
        }
    }
}

/// Drop repeated targets, keeping the first occurrence and input order
pub fn dedup_by_target(actions: Vec<CorrectionAction>) -> Vec<CorrectionAction> {
    let mut seen = HashSet::new();
    actions
        .into_iter()
        .filter(|a| seen.insert(a.target.clone()))
        .collect()
}

/// Spare cpu capacity offered to best-effort workloads
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SlackEstimate {
    pub cpus: f64,
    pub timestamp: f64,
}
