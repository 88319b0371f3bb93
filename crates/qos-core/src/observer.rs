//! Correction observer
//!
//! Joins the contention batches of all detectors with the cycle's usage
//! snapshot, runs the decision strategy once both are present and emits
//! the resulting corrections.
//!
//! Phases: `Idle -> Collecting -> Deciding -> CoolingDown -> Idle`. Every
//! cycle that reaches a decision emits a list, empty when there is nothing
//! to do.

use crate::error::Result;
use crate::filters::AgeTracker;
use crate::models::{Contention, CorrectionAction, UsageSnapshot};
use crate::observability::{QosMetrics, StructuredLogger};
use crate::pipeline::{lock, Consumer, CycleReset, MultiConsumer, Producer, ProductsReady};
use crate::strategies::{Strategy, StrategyKind};
use serde::Serialize;
use std::cmp::Ordering;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObserverPhase {
    Idle,
    Collecting,
    Deciding,
    CoolingDown,
}

#[derive(Default)]
struct CycleBuffers {
    contentions: Option<Vec<Vec<Contention>>>,
    usage: Option<UsageSnapshot>,
}

pub struct CorrectionObserver {
    name: &'static str,
    strategy: Mutex<Strategy>,
    ages: Arc<AgeTracker>,
    buffers: Mutex<CycleBuffers>,
    phase: Mutex<ObserverPhase>,
    last_contentions: AtomicUsize,
    producer: Producer<Vec<CorrectionAction>>,
    metrics: QosMetrics,
    logger: StructuredLogger,
}

impl CorrectionObserver {
    pub fn new(
        name: &'static str,
        strategy: Strategy,
        ages: Arc<AgeTracker>,
        producer: Producer<Vec<CorrectionAction>>,
    ) -> Self {
        Self {
            name,
            strategy: Mutex::new(strategy),
            ages,
            buffers: Mutex::new(CycleBuffers::default()),
            phase: Mutex::new(ObserverPhase::Idle),
            last_contentions: AtomicUsize::new(0),
            producer,
            metrics: QosMetrics::new(),
            logger: StructuredLogger::new("local"),
        }
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    /// Fan-in barrier feeding this observer from `detectors` producers
    pub fn barrier(self: &Arc<Self>, detectors: usize) -> Arc<MultiConsumer<Vec<Contention>>> {
        Arc::new(MultiConsumer::new(detectors, self.clone()))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn strategy_kind(&self) -> StrategyKind {
        lock(&self.strategy).kind()
    }

    pub fn phase(&self) -> ObserverPhase {
        *lock(&self.phase)
    }

    /// Contentions seen by the latest decision
    pub fn last_contentions(&self) -> usize {
        self.last_contentions.load(AtomicOrdering::Relaxed)
    }

    fn set_phase(&self, phase: ObserverPhase) {
        *lock(&self.phase) = phase;
    }

    /// Decide once both the contentions and the usage of the cycle arrived
    fn try_decide(&self) -> Result<()> {
        let (batches, usage) = {
            let mut buffers = lock(&self.buffers);
            if buffers.contentions.is_none() || buffers.usage.is_none() {
                drop(buffers);
                self.set_phase(ObserverPhase::Collecting);
                return Ok(());
            }
            match (buffers.contentions.take(), buffers.usage.take()) {
                (Some(batches), Some(usage)) => (batches, usage),
                _ => return Ok(()),
            }
        };
        self.set_phase(ObserverPhase::Deciding);

        let contentions = merge_contentions(batches);
        for contention in &contentions {
            self.logger.log_contention(self.name, contention);
        }
        self.metrics.add_contentions(contentions.len());
        self.last_contentions
            .store(contentions.len(), AtomicOrdering::Relaxed);

        let (actions, cooling_down) = {
            let mut strategy = lock(&self.strategy);
            let actions = if contentions.is_empty() {
                strategy.on_quiet_cycle();
                Vec::new()
            } else {
                match strategy.decide(&self.ages, &contentions, &usage) {
                    Ok(actions) => actions,
                    Err(e) => {
                        self.metrics.inc_strategy_failures();
                        self.logger
                            .log_strategy_failure(self.name, strategy.kind().as_str(), &e.to_string());
                        Vec::new()
                    }
                }
            };
            (actions, strategy.in_cooldown())
        };

        self.set_phase(if cooling_down {
            ObserverPhase::CoolingDown
        } else {
            ObserverPhase::Idle
        });

        debug!(
            observer = self.name,
            contentions = contentions.len(),
            corrections = actions.len(),
            "Observer decided"
        );
        self.producer.produce(&actions);
        Ok(())
    }
}

/// Concatenate batches in producer order, then order by severity, highest
/// first. Contentions without severity go last; ties keep their order.
pub fn merge_contentions(batches: Vec<Vec<Contention>>) -> Vec<Contention> {
    let mut merged: Vec<Contention> = batches.into_iter().flatten().collect();
    merged.sort_by(|a, b| match (a.severity, b.severity) {
        (Some(x), Some(y)) => y.total_cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });
    merged
}

impl Consumer<UsageSnapshot> for CorrectionObserver {
    fn consume(&self, usage: &UsageSnapshot) -> Result<()> {
        lock(&self.buffers).usage = Some(usage.clone());
        self.try_decide()
    }
}

impl ProductsReady<Vec<Contention>> for CorrectionObserver {
    fn all_products_ready(&self, products: Vec<Vec<Contention>>) -> Result<()> {
        lock(&self.buffers).contentions = Some(products);
        self.try_decide()
    }
}

impl CycleReset for CorrectionObserver {
    fn reset_cycle(&self) {
        let mut buffers = lock(&self.buffers);
        buffers.contentions = None;
        buffers.usage = None;
        drop(buffers);

        let mut phase = lock(&self.phase);
        if *phase == ObserverPhase::Collecting {
            *phase = ObserverPhase::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QosConfig;
    use crate::models::{WorkloadId, WorkloadSample, WorkloadStats};
    use crate::pipeline::ResultSlot;

    fn id(name: &str) -> WorkloadId {
        WorkloadId::new("fw", name)
    }

    fn usage() -> UsageSnapshot {
        UsageSnapshot::new(
            100.0,
            vec![
                WorkloadSample::new(id("pr"))
                    .production(4.0)
                    .with_stats(WorkloadStats::at(100.0)),
                WorkloadSample::new(id("be"))
                    .best_effort(1.0)
                    .with_stats(WorkloadStats::at(100.0)),
            ],
        )
        .with_total_cpus(8.0)
    }

    fn observer(kind: StrategyKind) -> (Arc<CorrectionObserver>, Arc<ResultSlot<Vec<CorrectionAction>>>) {
        let sink = Arc::new(ResultSlot::<Vec<CorrectionAction>>::new());
        let ages = Arc::new(AgeTracker::new());
        ages.observe(&id("pr"), 0.0);
        ages.observe(&id("be"), 50.0);
        let strategy = Strategy::new(kind, &QosConfig::new(), None);
        let observer = CorrectionObserver::new(
            "test",
            strategy,
            ages,
            Producer::<Vec<CorrectionAction>>::new("observer").with_consumer(sink.clone()),
        );
        (Arc::new(observer), sink)
    }

    #[test]
    fn test_waits_for_usage_and_all_detectors() {
        let (observer, sink) = observer(StrategyKind::KillAll);
        let barrier = observer.barrier(2);

        barrier.consume(&vec![Contention::cpu(id("pr"), 1.0, 100.0)]).unwrap();
        observer.consume(&usage()).unwrap();
        assert!(sink.take().is_none());
        assert_eq!(observer.phase(), ObserverPhase::Collecting);

        barrier.consume(&Vec::new()).unwrap();
        let actions = sink.take().unwrap();
        assert_eq!(actions, vec![CorrectionAction::terminate(id("be"))]);
        assert_eq!(observer.phase(), ObserverPhase::Idle);
    }

    #[test]
    fn test_empty_list_on_quiet_cycle() {
        let (observer, sink) = observer(StrategyKind::KillAll);
        let barrier = observer.barrier(1);

        observer.consume(&usage()).unwrap();
        barrier.consume(&Vec::new()).unwrap();
        assert_eq!(sink.take(), Some(Vec::new()));
    }

    #[test]
    fn test_reset_drops_partial_cycle() {
        let (observer, sink) = observer(StrategyKind::KillAll);
        let barrier = observer.barrier(1);

        observer.consume(&usage()).unwrap();
        observer.reset_cycle();
        barrier.consume(&vec![Contention::cpu(id("pr"), 1.0, 100.0)]).unwrap();
        // Usage of the previous cycle must not be reused
        assert!(sink.take().is_none());
    }

    #[test]
    fn test_strategy_failure_yields_no_actions() {
        let (observer, sink) = observer(StrategyKind::Seniority);
        let barrier = observer.barrier(1);
        let bad = Contention {
            severity: Some(f64::NAN),
            ..Contention::cpu(id("pr"), 1.0, 100.0)
        };

        observer.consume(&usage()).unwrap();
        barrier.consume(&vec![bad]).unwrap();
        assert_eq!(sink.take(), Some(Vec::new()));
        assert_eq!(observer.phase(), ObserverPhase::Idle);
    }

    #[test]
    fn test_seniority_enters_cooldown() {
        let (observer, sink) = observer(StrategyKind::Seniority);
        let barrier = observer.barrier(1);

        observer.consume(&usage()).unwrap();
        barrier.consume(&vec![Contention::cpu(id("pr"), 1.0, 100.0)]).unwrap();
        assert_eq!(sink.take().map(|a| a.len()), Some(1));
        assert_eq!(observer.phase(), ObserverPhase::CoolingDown);

        observer.consume(&usage()).unwrap();
        barrier.consume(&Vec::new()).unwrap();
        assert_eq!(observer.phase(), ObserverPhase::Idle);
    }

    #[test]
    fn test_merge_orders_by_severity() {
        let mut unknown = Contention::cpu(id("c"), 0.0, 1.0);
        unknown.severity = None;
        let merged = merge_contentions(vec![
            vec![Contention::cpu(id("a"), 0.5, 1.0), unknown],
            vec![Contention::cpu(id("b"), 2.0, 1.0)],
        ]);
        let victims: Vec<_> = merged.iter().map(|c| c.victim.executor_id.as_str()).collect();
        assert_eq!(victims, vec!["b", "a", "c"]);
    }
}
