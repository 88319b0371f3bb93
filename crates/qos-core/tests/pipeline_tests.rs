//! Integration tests for the assembled pipelines

use qos_core::config::keys;
use qos_core::detectors::{DetectorKind, DropFilter};
use qos_core::filters::{AgeFilter, AgeTracker};
use qos_core::observer::{CorrectionObserver, ObserverPhase};
use qos_core::pipeline::{Pipeline, Producer, ResultSlot};
use qos_core::strategies::{Strategy, StrategyKind};
use qos_core::{
    Contention, ControlBus, CorrectionAction, EstimatorPipelineBuilder, QosConfig,
    QosPipelineBuilder, Signal, UsageSnapshot, WorkloadId, WorkloadSample, WorkloadStats,
};
use std::sync::Arc;

fn id(name: &str) -> WorkloadId {
    WorkloadId::new("fw", name)
}

fn production(ts: f64, cpu_secs: f64) -> WorkloadSample {
    WorkloadSample::new(id("pr"))
        .production(4.0)
        .with_stats(WorkloadStats::at(ts).with_cpu_time(cpu_secs, 0.0).with_cpus_limit(4.0))
}

fn best_effort(ts: f64, cpu_secs: f64) -> WorkloadSample {
    WorkloadSample::new(id("be"))
        .best_effort(1.0)
        .with_stats(WorkloadStats::at(ts).with_cpu_time(cpu_secs, 0.0).with_cpus_limit(1.0))
}

fn node(ts: f64, pr_secs: f64, be_secs: f64) -> UsageSnapshot {
    UsageSnapshot::new(ts, vec![production(ts, pr_secs), best_effort(ts, be_secs)]).with_total_cpus(8.0)
}

fn drop_pipeline(
    kind: StrategyKind,
    bus: Option<Arc<ControlBus>>,
) -> (Pipeline<UsageSnapshot, Vec<CorrectionAction>>, Arc<CorrectionObserver>) {
    let config = QosConfig::new()
        .with(keys::WINDOW_SIZE, 10i64)
        .with(keys::RELATIVE_THRESHOLD, 5.0)
        .with(keys::CONTENTION_COOLDOWN, 10i64);

    let sink = Arc::new(ResultSlot::<Vec<CorrectionAction>>::new());
    let ages = Arc::new(AgeTracker::new());
    let observer = Arc::new(CorrectionObserver::new(
        "ipc",
        Strategy::new(kind, &config, bus),
        ages.clone(),
        Producer::<Vec<CorrectionAction>>::new("observer").with_consumer(sink.clone()),
    ));
    let barrier = observer.barrier(1);
    let drop_filter = DropFilter::new(
        Signal::Ipc,
        DetectorKind::Rolling,
        &config,
        Producer::<Vec<Contention>>::new("drop").with_consumer(barrier.clone()),
    )
    .unwrap();
    let age = AgeFilter::new(
        ages,
        Producer::<UsageSnapshot>::new("age")
            .with_consumer(observer.clone())
            .with_consumer(Arc::new(drop_filter)),
    );
    let pipeline = Pipeline::new(
        Producer::<UsageSnapshot>::new("entry").with_consumer(Arc::new(age)),
        sink,
    )
    .with_reset(barrier)
    .with_reset(observer.clone());

    (pipeline, observer)
}

/// Production ipc of 10 for ten cycles, then 4
fn ipc_snapshot(cycle: u64) -> UsageSnapshot {
    let ts = cycle as f64;
    let ipc = if cycle <= 10 { 10.0 } else { 4.0 };
    UsageSnapshot::new(
        ts,
        vec![
            WorkloadSample::new(id("pr"))
                .production(4.0)
                .with_stats(WorkloadStats::at(ts).with_signal(Signal::Ipc, ipc)),
            WorkloadSample::new(id("be"))
                .best_effort(1.0)
                .with_stats(WorkloadStats::at(ts)),
        ],
    )
}

#[test]
fn test_ipc_drop_leads_to_single_correction() {
    let (pipeline, observer) = drop_pipeline(StrategyKind::Severity, None);

    let mut corrections = Vec::new();
    for cycle in 1..=40 {
        let actions = pipeline.run(&ipc_snapshot(cycle)).unwrap().unwrap();
        if !actions.is_empty() {
            corrections.push((cycle, actions));
        }
    }

    assert_eq!(
        corrections,
        vec![(11, vec![CorrectionAction::terminate(id("be"))])]
    );
    assert_eq!(observer.phase(), ObserverPhase::Idle);
}

#[test]
fn test_ipc_drop_pauses_estimator_until_quiet() {
    let bus = Arc::new(ControlBus::new());
    let (pipeline, observer) = drop_pipeline(StrategyKind::Seniority, Some(bus.clone()));
    let estimator = EstimatorPipelineBuilder::new().with_bus(bus).build().unwrap();

    for cycle in 1..=10 {
        assert_eq!(pipeline.run(&ipc_snapshot(cycle)).unwrap(), Some(vec![]));
        assert!(estimator.valve().is_open());
    }

    let actions = pipeline.run(&ipc_snapshot(11)).unwrap().unwrap();
    assert_eq!(actions, vec![CorrectionAction::terminate(id("be"))]);
    assert_eq!(observer.phase(), ObserverPhase::CoolingDown);
    assert!(!estimator.valve().is_open());

    // No new drop: the cooldown clears and the estimator resumes
    assert_eq!(pipeline.run(&ipc_snapshot(12)).unwrap(), Some(vec![]));
    assert_eq!(observer.phase(), ObserverPhase::Idle);
    assert!(estimator.valve().is_open());
}

#[test]
fn test_closed_valve_leaves_state_untouched() {
    let qos = QosPipelineBuilder::new().build().unwrap();
    qos.valve().set_enabled(false);

    assert!(qos.run(&node(1.0, 0.0, 0.0)).unwrap().is_none());
    assert_eq!(qos.ages().tracked(), 0);

    qos.valve().set_enabled(true);
    assert!(qos.run(&node(2.0, 1.0, 1.0)).unwrap().is_none());
    assert_eq!(qos.ages().tracked(), 2);
}

#[test]
fn test_overload_frees_only_needed_cpus() {
    let qos = QosPipelineBuilder::new().build().unwrap();
    let node = |ts: f64, pr_secs: f64, be_secs: f64| {
        let mut samples = vec![production(ts, pr_secs)];
        for name in ["be1", "be2", "be3", "be4"] {
            samples.push(
                WorkloadSample::new(id(name))
                    .best_effort(1.0)
                    .with_stats(WorkloadStats::at(ts).with_cpu_time(be_secs, 0.0).with_cpus_limit(1.0)),
            );
        }
        UsageSnapshot::new(ts, samples).with_total_cpus(8.0)
    };

    assert!(qos.run(&node(1.0, 0.0, 0.0)).unwrap().is_none());

    // 7 cpus used against a 5.76 cpu threshold: 1.24 cpus to free
    let actions = qos.run(&node(2.0, 3.0, 1.0)).unwrap().unwrap();
    assert_eq!(
        actions,
        vec![
            CorrectionAction::terminate(id("be1")),
            CorrectionAction::terminate(id("be2")),
        ]
    );
    assert_eq!(qos.last_contentions(), 1);
}

#[test]
fn test_overload_correction_keeps_estimator_running() {
    let bus = Arc::new(ControlBus::new());
    let qos = QosPipelineBuilder::new().with_bus(bus.clone()).build().unwrap();
    let estimator = EstimatorPipelineBuilder::new()
        .with_config(QosConfig::new().with(keys::NEW_EXECUTOR_THRESHOLD_SEC, 0.0))
        .with_bus(bus)
        .build()
        .unwrap();

    // First sighting: no rates yet
    let first = node(1.0, 0.0, 0.0);
    assert!(qos.run(&first).unwrap().is_none());
    assert!(estimator.run(&first).unwrap().is_none());

    // 6 cpus used on an 8 cpu node is above the 0.72 overload threshold
    let overloaded = node(2.0, 3.0, 3.0);
    let actions = qos.run(&overloaded).unwrap().unwrap();
    assert_eq!(actions, vec![CorrectionAction::terminate(id("be"))]);
    assert_eq!(qos.last_contentions(), 1);
    assert!(estimator.valve().is_open());

    let slack = estimator.run(&overloaded).unwrap().unwrap();
    assert!((slack.cpus - 1.0).abs() < 1e-9);

    // Smoothed usage drops to 1.2 per workload, the node is quiet again
    let quiet = node(3.0, 4.0, 4.0);
    assert_eq!(qos.run(&quiet).unwrap(), Some(vec![]));

    let slack = estimator.run(&quiet).unwrap().unwrap();
    assert!((slack.cpus - 3.0).abs() < 1e-9);
    assert_eq!(slack.timestamp, 3.0);
}
