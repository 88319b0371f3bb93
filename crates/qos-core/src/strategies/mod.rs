//! Contention decision strategies
//!
//! Provides:
//! - [`Strategy`]: closed set of strategies turning contentions into
//!   terminate actions
//! - [`StrategyKind`]: configuration-time selection of a strategy
//!
//! Every strategy only targets best-effort workloads, never returns the
//! same target twice and keeps a deterministic order for a given input.

pub mod cache_occupancy;
pub mod cpu_contention;
pub mod kill_all;
pub mod seniority;
pub mod severity;

pub use cache_occupancy::CacheOccupancyStrategy;
pub use cpu_contention::CpuContentionStrategy;
pub use kill_all::KillAllStrategy;
pub use seniority::{SeniorityStrategy, SenioritySettings};
pub use severity::SeverityStrategy;

use crate::bus::ControlBus;
use crate::config::QosConfig;
use crate::error::{QosError, Result};
use crate::filters::AgeTracker;
use crate::models::{dedup_by_target, Contention, CorrectionAction, UsageSnapshot, WorkloadId, WorkloadSample};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Strategy selected for an observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    KillAll,
    Severity,
    Seniority,
    CacheOccupancy,
    CpuContention,
}

impl StrategyKind {
    /// Kind named by `key`, or `default` when unset
    pub fn from_config(config: &QosConfig, key: &str, default: StrategyKind) -> Result<Self> {
        match config.get_str(key) {
            Some(name) => name.parse().map_err(|_| {
                QosError::invalid(key, format!("unknown strategy '{}'", name))
            }),
            None => Ok(default),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::KillAll => "kill_all",
            StrategyKind::Severity => "severity",
            StrategyKind::Seniority => "seniority",
            StrategyKind::CacheOccupancy => "cache_occupancy",
            StrategyKind::CpuContention => "cpu_contention",
        }
    }
}

impl FromStr for StrategyKind {
    type Err = QosError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "kill_all" => Ok(StrategyKind::KillAll),
            "severity" => Ok(StrategyKind::Severity),
            "seniority" => Ok(StrategyKind::Seniority),
            "cache_occupancy" => Ok(StrategyKind::CacheOccupancy),
            "cpu_contention" => Ok(StrategyKind::CpuContention),
            other => Err(QosError::invalid("strategy", format!("unknown strategy '{}'", other))),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decision strategy
#[derive(Debug)]
pub enum Strategy {
    KillAll(KillAllStrategy),
    Severity(SeverityStrategy),
    Seniority(SeniorityStrategy),
    CacheOccupancy(CacheOccupancyStrategy),
    CpuContention(CpuContentionStrategy),
}

impl Strategy {
    /// Build a strategy of `kind`. Only the seniority strategy uses `bus`.
    pub fn new(kind: StrategyKind, config: &QosConfig, bus: Option<Arc<ControlBus>>) -> Self {
        match kind {
            StrategyKind::KillAll => Strategy::KillAll(KillAllStrategy),
            StrategyKind::Severity => Strategy::Severity(SeverityStrategy),
            StrategyKind::Seniority => {
                let strategy = SeniorityStrategy::new(SenioritySettings::from_config(config));
                Strategy::Seniority(match bus {
                    Some(bus) => strategy.with_bus(bus),
                    None => strategy,
                })
            }
            StrategyKind::CacheOccupancy => Strategy::CacheOccupancy(CacheOccupancyStrategy),
            StrategyKind::CpuContention => Strategy::CpuContention(CpuContentionStrategy::from_config(config)),
        }
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            Strategy::KillAll(_) => StrategyKind::KillAll,
            Strategy::Severity(_) => StrategyKind::Severity,
            Strategy::Seniority(_) => StrategyKind::Seniority,
            Strategy::CacheOccupancy(_) => StrategyKind::CacheOccupancy,
            Strategy::CpuContention(_) => StrategyKind::CpuContention,
        }
    }

    /// Turn the cycle's contentions into corrections.
    ///
    /// `ages` is read-only here; it is written by the ingestion path.
    pub fn decide(
        &mut self,
        ages: &AgeTracker,
        contentions: &[Contention],
        usage: &UsageSnapshot,
    ) -> Result<Vec<CorrectionAction>> {
        let actions = match self {
            Strategy::KillAll(s) => s.decide(usage),
            Strategy::Severity(s) => s.decide(contentions, usage)?,
            Strategy::Seniority(s) => s.decide(ages, contentions, usage)?,
            Strategy::CacheOccupancy(s) => s.decide(usage),
            Strategy::CpuContention(s) => s.decide(ages, contentions, usage)?,
        };
        Ok(dedup_by_target(actions))
    }

    /// Called on cycles that reported no contention
    pub fn on_quiet_cycle(&mut self) {
        if let Strategy::Seniority(s) = self {
            s.on_quiet_cycle();
        }
    }

    pub fn in_cooldown(&self) -> bool {
        matches!(self, Strategy::Seniority(s) if s.cooldown_remaining() > 0)
    }
}

/// Best-effort samples that carry an identity, in snapshot order
pub(crate) fn candidates(usage: &UsageSnapshot) -> Vec<&WorkloadSample> {
    usage.revocable().collect()
}

/// Identity of a candidate; candidates always carry one
pub(crate) fn candidate_id(sample: &WorkloadSample) -> Option<&WorkloadId> {
    sample.id.as_ref()
}

/// Reject severities that would poison the arithmetic of a decision
pub(crate) fn check_severities(strategy: &'static str, contentions: &[Contention]) -> Result<()> {
    match contentions
        .iter()
        .find(|c| c.severity.is_some_and(|s| !s.is_finite()))
    {
        Some(c) => Err(QosError::strategy(
            strategy,
            format!("non-finite severity for victim {}", c.victim),
        )),
        None => Ok(()),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::models::{Signal, WorkloadStats};

    pub fn id(name: &str) -> WorkloadId {
        WorkloadId::new("fw", name)
    }

    pub fn be(name: &str, cpus: f64) -> WorkloadSample {
        WorkloadSample::new(id(name))
            .best_effort(cpus)
            .with_stats(WorkloadStats::at(100.0))
    }

    pub fn be_using(name: &str, cpus: f64, usage: f64) -> WorkloadSample {
        WorkloadSample::new(id(name))
            .best_effort(cpus)
            .with_stats(WorkloadStats::at(100.0).with_signal(Signal::CpuUsage, usage))
    }

    pub fn pr(name: &str) -> WorkloadSample {
        WorkloadSample::new(id(name))
            .production(4.0)
            .with_stats(WorkloadStats::at(100.0))
    }

    pub fn contention(victim: &str, severity: f64) -> Contention {
        Contention::cpu(id(victim), severity, 100.0)
    }

    pub fn targets(actions: &[CorrectionAction]) -> Vec<String> {
        actions.iter().map(|a| a.target.executor_id.clone()).collect()
    }
}
