//! Terminate every best-effort workload

use super::{candidate_id, candidates};
use crate::models::{CorrectionAction, UsageSnapshot};
use tracing::info;

#[derive(Debug, Default, Clone, Copy)]
pub struct KillAllStrategy;

impl KillAllStrategy {
    pub fn decide(&self, usage: &UsageSnapshot) -> Vec<CorrectionAction> {
        let actions: Vec<CorrectionAction> = candidates(usage)
            .into_iter()
            .filter_map(candidate_id)
            .cloned()
            .map(CorrectionAction::terminate)
            .collect();
        info!(count = actions.len(), "Revoking all best-effort workloads");
        actions
    }
}
