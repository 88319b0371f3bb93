//! Last-level cache occupancy based selection

use super::{candidate_id, candidates};
use crate::models::{CorrectionAction, UsageSnapshot};
use tracing::{debug, info};

/// Terminates best-effort workloads whose cache occupancy is at or above
/// the mean of those exposing the counter. Contentions are not consulted.
#[derive(Debug, Default, Clone, Copy)]
pub struct CacheOccupancyStrategy;

impl CacheOccupancyStrategy {
    pub fn decide(&self, usage: &UsageSnapshot) -> Vec<CorrectionAction> {
        let measured: Vec<_> = candidates(usage)
            .into_iter()
            .filter_map(|s| {
                let occupancy = s.stats.as_ref()?.llc_occupancy?;
                Some((candidate_id(s)?, occupancy as f64))
            })
            .collect();

        if measured.is_empty() {
            debug!("No best-effort workload exposes cache occupancy");
            return Vec::new();
        }

        let mean = measured.iter().map(|(_, o)| o).sum::<f64>() / measured.len() as f64;
        let actions: Vec<CorrectionAction> = measured
            .into_iter()
            .filter(|(_, occupancy)| *occupancy >= mean)
            .map(|(id, _)| CorrectionAction::terminate(id.clone()))
            .collect();

        info!(
            mean_occupancy = mean,
            count = actions.len(),
            "Revoking workloads above mean cache occupancy"
        );
        actions
    }
}
