//! Severity-based greedy selection
//!
//! Candidates are ordered by allocated cpus, largest first. For every
//! contention without an explicit aggressor, candidates are terminated until
//! their allocations cover the severity. Surplus from one contention carries
//! over to the next one within the same cycle.

use super::{candidate_id, candidates, check_severities};
use crate::error::Result;
use crate::models::{Contention, ContentionType, CorrectionAction, UsageSnapshot, WorkloadId, WorkloadSample};
use std::collections::HashSet;
use tracing::{info, warn};

/// Severity assumed for contentions that carry none
pub const MINIMAL_SEVERITY: f64 = 0.1;

const NAME: &str = "severity";

fn allocated_cpus(sample: &WorkloadSample) -> f64 {
    sample.allocation.cpus.unwrap_or(0.0)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SeverityStrategy;

impl SeverityStrategy {
    pub fn decide(&self, contentions: &[Contention], usage: &UsageSnapshot) -> Result<Vec<CorrectionAction>> {
        check_severities(NAME, contentions)?;

        let mut pool = candidates(usage);
        pool.sort_by(|a, b| allocated_cpus(b).total_cmp(&allocated_cpus(a)));

        let mut corrected: HashSet<&WorkloadId> = HashSet::new();
        let mut targets: Vec<WorkloadId> = Vec::new();
        let mut balance = 0.0;

        for contention in contentions {
            if corrected.contains(&contention.victim) {
                continue;
            }
            if contention.kind != ContentionType::Cpu {
                warn!(
                    victim = %contention.victim,
                    "Only cpu contentions are supported by this strategy"
                );
                continue;
            }

            if let Some(aggressor) = &contention.aggressor {
                if let Some(pos) = pool.iter().position(|s| s.id.as_ref() == Some(aggressor)) {
                    pool.remove(pos);
                    targets.push(aggressor.clone());
                }
                continue;
            }

            let mut severity = match contention.severity {
                Some(severity) => severity,
                None => {
                    info!(
                        victim = %contention.victim,
                        "Contention without severity, assuming lowest severity"
                    );
                    MINIMAL_SEVERITY
                }
            } + balance;

            if severity > 0.0 {
                let mut remaining = Vec::with_capacity(pool.len());
                for sample in pool.drain(..) {
                    if severity <= 0.0 {
                        remaining.push(sample);
                        continue;
                    }
                    // Candidates without an allocation leave the pool unkilled
                    if let (Some(cpus), Some(id)) = (sample.allocation.cpus, candidate_id(sample)) {
                        severity -= cpus;
                        info!(workload = %id, cpus = cpus, "Decided to kill workload");
                        targets.push(id.clone());
                    }
                }
                pool = remaining;
            }

            if severity > 0.0 {
                info!(
                    victim = %contention.victim,
                    unmet = severity,
                    "Aggressors are not the cause of CPU contention or lack of info about some aggressors"
                );
                break;
            }

            balance = severity;
            corrected.insert(&contention.victim);
        }

        Ok(targets.into_iter().map(CorrectionAction::terminate).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;

    fn usage() -> UsageSnapshot {
        UsageSnapshot::new(
            100.0,
            vec![be("one_a", 1.0), be("two", 2.0), pr("pr"), be("four", 4.0), be("one_b", 1.0)],
        )
    }

    #[test]
    fn test_minimum_prefix_covers_severity() {
        let actions = SeverityStrategy.decide(&[contention("pr", 4.5)], &usage()).unwrap();
        assert_eq!(targets(&actions), vec!["four", "two"]);
    }

    #[test]
    fn test_surplus_carries_to_next_contention() {
        // 4.5 kills 4 + 2, leaving 1.5 of surplus that covers the second one
        let contentions = vec![contention("pr", 4.5), contention("pr2", 1.0)];
        let actions = SeverityStrategy.decide(&contentions, &usage()).unwrap();
        assert_eq!(targets(&actions), vec!["four", "two"]);
    }

    #[test]
    fn test_duplicate_victims_corrected_once() {
        let contentions = vec![contention("pr", 0.5), contention("pr", 0.5)];
        let actions = SeverityStrategy.decide(&contentions, &usage()).unwrap();
        assert_eq!(targets(&actions), vec!["four"]);
    }

    #[test]
    fn test_explicit_aggressor_removed_from_pool() {
        let contentions = vec![
            contention("pr", 1.0).with_aggressor(id("four")),
            contention("pr2", 1.5),
        ];
        let actions = SeverityStrategy.decide(&contentions, &usage()).unwrap();
        assert_eq!(targets(&actions), vec!["four", "two"]);
    }

    #[test]
    fn test_unmet_severity_stops_cycle() {
        let contentions = vec![contention("pr", 100.0), contention("pr2", 0.5)];
        let actions = SeverityStrategy.decide(&contentions, &usage()).unwrap();
        // Everything was marked while trying to meet the first contention
        assert_eq!(targets(&actions), vec!["four", "two", "one_a", "one_b"]);
    }

    #[test]
    fn test_missing_severity_kills_largest() {
        let mut c = contention("pr", 0.0);
        c.severity = None;
        let actions = SeverityStrategy.decide(&[c], &usage()).unwrap();
        assert_eq!(targets(&actions), vec!["four"]);
    }

    #[test]
    fn test_idempotent_re_decision() {
        let contentions = vec![contention("pr", 2.5), contention("pr2", 1.0)];
        let first = SeverityStrategy.decide(&contentions, &usage()).unwrap();
        let second = SeverityStrategy.decide(&contentions, &usage()).unwrap();
        assert_eq!(first, second);
    }
}
