//! Signal-based contention detection over production workloads

use super::{Detector, DetectorKind};
use crate::config::QosConfig;
use crate::error::Result;
use crate::models::{Contention, Signal, UsageSnapshot};
use crate::pipeline::{Consumer, Producer};
use crate::state::WorkloadStateMap;
use tracing::{debug, info, warn};

/// Runs one detector per production workload on `signal` and emits the
/// contentions of the cycle (possibly none) every time it consumes.
pub struct DropFilter {
    signal: Signal,
    prototype: Detector,
    detectors: WorkloadStateMap<Detector>,
    producer: Producer<Vec<Contention>>,
}

impl DropFilter {
    /// Fails when the detector settings are invalid
    pub fn new(
        signal: Signal,
        kind: DetectorKind,
        config: &QosConfig,
        producer: Producer<Vec<Contention>>,
    ) -> Result<Self> {
        Ok(Self {
            signal,
            prototype: Detector::new(kind, config)?,
            detectors: WorkloadStateMap::new(),
            producer,
        })
    }

    pub fn kind(&self) -> DetectorKind {
        self.prototype.kind()
    }

    pub fn tracked(&self) -> usize {
        self.detectors.len()
    }
}

impl Consumer<UsageSnapshot> for DropFilter {
    fn consume(&self, snapshot: &UsageSnapshot) -> Result<()> {
        self.detectors.begin_cycle();
        let has_revocable = snapshot.has_revocable();
        let mut contentions = Vec::new();

        for sample in snapshot.samples.iter().filter(|s| !s.is_revocable()) {
            let Some((id, stats)) = sample.complete() else {
                debug!(workload = %sample.label(), "No statistics for workload");
                continue;
            };
            let Some(value) = stats.signal(self.signal) else {
                warn!(workload = %id, signal = %self.signal, "Signal missing, workload skipped");
                continue;
            };

            let detected = self.detectors.with_entry(
                id,
                || self.prototype.clone(),
                |detector| {
                    let detected = detector.process_sample(value);
                    if detected.is_some() && !has_revocable {
                        detector.reset_recovery();
                    }
                    detected
                },
            );

            match detected {
                Some(severity) if has_revocable => {
                    info!(
                        workload = %id,
                        signal = %self.signal,
                        severity = severity,
                        "Signal contention spotted"
                    );
                    contentions.push(Contention::cpu(id.clone(), severity, stats.timestamp));
                }
                Some(_) => info!(
                    workload = %id,
                    "Contention spotted without best-effort workloads, assuming false positive"
                ),
                None => {}
            }
        }

        if !has_revocable {
            self.detectors.for_each_mut(|_, detector| detector.reset_recovery());
        }
        self.detectors.evict_stale();

        debug!(count = contentions.len(), "Producing contentions");
        self.producer.produce(&contentions);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::keys;
    use crate::models::{WorkloadId, WorkloadSample, WorkloadStats};
    use crate::pipeline::ResultSlot;
    use std::sync::Arc;

    fn pr(value: f64, ts: f64) -> WorkloadSample {
        WorkloadSample::new(WorkloadId::new("fw", "pr"))
            .production(2.0)
            .with_stats(WorkloadStats::at(ts).with_signal(Signal::EmaIpc, value))
    }

    fn be() -> WorkloadSample {
        WorkloadSample::new(WorkloadId::new("fw", "be")).best_effort(1.0)
    }

    fn filter(sink: Arc<ResultSlot<Vec<Contention>>>) -> DropFilter {
        let config = QosConfig::new()
            .with(keys::WINDOW_SIZE, 2i64)
            .with(keys::QUORUM_FRACTION, 1.0);
        DropFilter::new(
            Signal::EmaIpc,
            DetectorKind::Quorum,
            &config,
            Producer::<Vec<Contention>>::new("drop").with_consumer(sink),
        )
        .unwrap()
    }

    #[test]
    fn test_emits_contention_for_production_drop() {
        let sink = Arc::new(ResultSlot::<Vec<Contention>>::new());
        let f = filter(sink.clone());

        f.consume(&UsageSnapshot::new(1.0, vec![pr(2.0, 1.0), be()])).unwrap();
        assert_eq!(sink.take(), Some(vec![]));
        f.consume(&UsageSnapshot::new(2.0, vec![pr(2.0, 2.0), be()])).unwrap();
        assert_eq!(sink.take(), Some(vec![]));

        f.consume(&UsageSnapshot::new(3.0, vec![pr(0.5, 3.0), be()])).unwrap();
        let contentions = sink.take().unwrap();
        assert_eq!(contentions.len(), 1);
        assert_eq!(contentions[0].victim, WorkloadId::new("fw", "pr"));
        assert_eq!(contentions[0].timestamp, 3.0);
        assert!(contentions[0].severity.unwrap() > 0.0);
    }

    #[test]
    fn test_drop_without_best_effort_is_false_positive() {
        let sink = Arc::new(ResultSlot::<Vec<Contention>>::new());
        let f = filter(sink.clone());

        f.consume(&UsageSnapshot::new(1.0, vec![pr(2.0, 1.0)])).unwrap();
        f.consume(&UsageSnapshot::new(2.0, vec![pr(2.0, 2.0)])).unwrap();
        f.consume(&UsageSnapshot::new(3.0, vec![pr(0.5, 3.0)])).unwrap();
        assert_eq!(sink.take(), Some(vec![]));

        // Recovery tracking was reset: the low value is the new normal
        f.consume(&UsageSnapshot::new(4.0, vec![pr(0.5, 4.0), be()])).unwrap();
        assert_eq!(sink.take(), Some(vec![]));
    }

    #[test]
    fn test_skips_samples_without_signal() {
        let sink = Arc::new(ResultSlot::<Vec<Contention>>::new());
        let f = filter(sink.clone());
        let bare = WorkloadSample::new(WorkloadId::new("fw", "pr")).with_stats(WorkloadStats::at(1.0));

        f.consume(&UsageSnapshot::new(1.0, vec![bare, be()])).unwrap();
        assert_eq!(sink.take(), Some(vec![]));
        assert_eq!(f.tracked(), 0);
    }

    #[test]
    fn test_invalid_settings_fail_construction() {
        let config = QosConfig::new().with(keys::WINDOW_SIZE, -1i64);
        let result = DropFilter::new(
            Signal::EmaIpc,
            DetectorKind::Assurance,
            &config,
            Producer::<Vec<Contention>>::new("drop"),
        );
        assert!(result.is_err());
    }
}
