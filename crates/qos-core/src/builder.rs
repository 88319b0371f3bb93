//! Composition roots for the engine pipelines
//!
//! Provides:
//! - [`QosPipelineBuilder`]: cpu QoS pipeline turning snapshots into
//!   corrections
//! - [`EstimatorPipelineBuilder`]: slack estimation pipeline
//!
//! QoS pipeline layout:
//!
//! ```text
//! valve -> age -> rate -+-> ipc observer (usage)
//!                       +-> too low usage -> ipc ema -> drop filter -> ipc observer
//!                       +-> cpu ema -+-> cpu observer (usage)
//!                                    +-> overload detector -> cpu observer
//! ipc observer + cpu observer -> correction merger -> sink
//! ```
//!
//! By default the ipc observer runs the seniority strategy, which pauses the
//! estimator while it cools down, and the cpu observer frees the overloaded
//! cpus with the cpu contention strategy.
//!
//! Estimator pipeline layout:
//!
//! ```text
//! valve -> age -> rate -> utilization -> production pass -> ignore new -> slack -> sink
//! ```

use crate::bus::ControlBus;
use crate::config::{keys, QosConfig};
use crate::detectors::{DetectorKind, DropFilter, OverloadDetector};
use crate::error::Result;
use crate::filters::usage::{
    DEFAULT_MINIMAL_CPU_USAGE, DEFAULT_NEW_EXECUTOR_THRESHOLD, DEFAULT_UTILIZATION_THRESHOLD,
};
use crate::filters::{
    AgeFilter, AgeTracker, EmaFilter, EmaSettings, IgnoreNewExecutorsFilter, ProductionPassFilter,
    RateFilter, TooLowUsageFilter, UtilizationThresholdFilter, ValveControl, ValveFilter,
};
use crate::merger::CorrectionMerger;
use crate::models::{Contention, CorrectionAction, Signal, SlackEstimate, UsageSnapshot};
use crate::observability::{QosMetrics, StructuredLogger};
use crate::observer::{CorrectionObserver, ObserverPhase};
use crate::pipeline::{Pipeline, Producer, ResultSlot};
use crate::slack::SlackEstimator;
use crate::strategies::{Strategy, StrategyKind};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// Smoothing factor of the QoS pipeline EMA stages
pub const DEFAULT_QOS_ALPHA: f64 = 0.9;

pub const QOS_PIPELINE: &str = "qos";
pub const ESTIMATOR_PIPELINE: &str = "estimator";

/// A built pipeline with the controls the host needs
pub struct PipelineHandle<Out> {
    name: &'static str,
    pipeline: Pipeline<UsageSnapshot, Out>,
    valve: Arc<ValveControl>,
    ages: Arc<AgeTracker>,
    observers: Vec<Arc<CorrectionObserver>>,
    metrics: QosMetrics,
}

pub type QosPipeline = PipelineHandle<Vec<CorrectionAction>>;
pub type EstimatorPipeline = PipelineHandle<SlackEstimate>;

impl<Out> PipelineHandle<Out> {
    /// Run one cycle; `Ok(None)` when the cycle produced nothing
    pub fn run(&self, snapshot: &UsageSnapshot) -> Result<Option<Out>> {
        let started = Instant::now();
        let result = self.pipeline.run(snapshot);
        self.metrics
            .observe_cycle_latency(self.name, started.elapsed().as_secs_f64());
        result
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn valve(&self) -> &Arc<ValveControl> {
        &self.valve
    }

    pub fn ages(&self) -> &Arc<AgeTracker> {
        &self.ages
    }

    /// Current phase of every observer, by observer name
    pub fn observer_phases(&self) -> Vec<(&'static str, ObserverPhase)> {
        self.observers.iter().map(|o| (o.name(), o.phase())).collect()
    }

    /// Contentions behind the latest decision of every observer. Only
    /// meaningful after a run that returned a result.
    pub fn last_contentions(&self) -> usize {
        self.observers.iter().map(|o| o.last_contentions()).sum()
    }
}

fn valve_from_config(name: &'static str, config: &QosConfig) -> Arc<ValveControl> {
    Arc::new(ValveControl::with_threshold(
        name,
        config.bool_or(keys::VALVE_OPENED, true),
        config.i64_or(keys::VALVE_THRESHOLD, 1),
    ))
}

/// Builder for the cpu QoS pipeline
#[derive(Default)]
pub struct QosPipelineBuilder {
    config: QosConfig,
    bus: Option<Arc<ControlBus>>,
    valve: Option<Arc<ValveControl>>,
    logger: Option<StructuredLogger>,
}

impl QosPipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: QosConfig) -> Self {
        self.config = config;
        self
    }

    /// Bus receiving estimator feedback from cooldown-bearing strategies
    pub fn with_bus(mut self, bus: Arc<ControlBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_valve(mut self, valve: Arc<ValveControl>) -> Self {
        self.valve = Some(valve);
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Fails when a detector or strategy cannot be configured
    pub fn build(self) -> Result<QosPipeline> {
        let config = self.config;
        let logger = self.logger.unwrap_or_else(|| StructuredLogger::new("local"));
        let valve = self
            .valve
            .unwrap_or_else(|| valve_from_config(QOS_PIPELINE, &config));
        let ages = Arc::new(AgeTracker::new());

        // Drop severities are fractions, overload severities are cpus
        let ipc_strategy = StrategyKind::from_config(&config, keys::IPC_STRATEGY, StrategyKind::Seniority)?;
        let cpu_strategy = StrategyKind::from_config(&config, keys::CPU_STRATEGY, StrategyKind::CpuContention)?;
        let detector = DetectorKind::from_config(&config)?;

        let sink = Arc::new(ResultSlot::<Vec<CorrectionAction>>::new());
        let merger = Arc::new(CorrectionMerger::new(
            Producer::<Vec<CorrectionAction>>::new("correction_merger").with_consumer(sink.clone()),
        ));
        let merger_barrier = merger.barrier(2);

        // Interference on ipc
        let ipc_observer = Arc::new(
            CorrectionObserver::new(
                "ipc",
                Strategy::new(ipc_strategy, &config, self.bus.clone()),
                ages.clone(),
                Producer::<Vec<CorrectionAction>>::new("ipc_observer").with_consumer(merger_barrier.clone()),
            )
            .with_logger(logger.clone()),
        );
        let ipc_barrier = ipc_observer.barrier(1);
        let drop_filter = DropFilter::new(
            Signal::EmaIpc,
            detector,
            &config,
            Producer::<Vec<Contention>>::new("ipc_drop_filter").with_consumer(ipc_barrier.clone()),
        )?;
        let ipc_ema = EmaFilter::new(
            Signal::Ipc,
            EmaSettings::from_config(&config, keys::ALPHA_IPC, DEFAULT_QOS_ALPHA),
            Producer::<UsageSnapshot>::new("ipc_ema").with_consumer(Arc::new(drop_filter)),
        );
        let too_low = TooLowUsageFilter::new(
            config.positive_f64_or(keys::MINIMAL_CPU_USAGE, DEFAULT_MINIMAL_CPU_USAGE),
            Producer::<UsageSnapshot>::new("too_low_usage").with_consumer(Arc::new(ipc_ema)),
        );

        // Node overload
        let cpu_observer = Arc::new(
            CorrectionObserver::new(
                "cpu",
                Strategy::new(cpu_strategy, &config, self.bus.clone()),
                ages.clone(),
                Producer::<Vec<CorrectionAction>>::new("cpu_observer").with_consumer(merger_barrier.clone()),
            )
            .with_logger(logger.clone()),
        );
        let cpu_barrier = cpu_observer.barrier(1);
        let overload = OverloadDetector::from_config(
            &config,
            Producer::<Vec<Contention>>::new("overload_detector").with_consumer(cpu_barrier.clone()),
        );
        let cpu_ema = EmaFilter::new(
            Signal::CpuUsage,
            EmaSettings::from_config(&config, keys::ALPHA_CPU, DEFAULT_QOS_ALPHA),
            Producer::<UsageSnapshot>::new("cpu_ema")
                .with_consumer(cpu_observer.clone())
                .with_consumer(Arc::new(overload)),
        );

        let rate = RateFilter::new(
            Producer::<UsageSnapshot>::new("rate")
                .with_consumer(ipc_observer.clone())
                .with_consumer(Arc::new(too_low))
                .with_consumer(Arc::new(cpu_ema)),
        );
        let age = AgeFilter::new(ages.clone(), Producer::<UsageSnapshot>::new("age").with_consumer(Arc::new(rate)));
        let valve_filter = ValveFilter::new(valve.clone(), Producer::<UsageSnapshot>::new("valve").with_consumer(Arc::new(age)));

        let pipeline = Pipeline::new(
            Producer::<UsageSnapshot>::new(QOS_PIPELINE).with_consumer(Arc::new(valve_filter)),
            sink,
        )
        .with_reset(ipc_barrier)
        .with_reset(cpu_barrier)
        .with_reset(merger_barrier)
        .with_reset(ipc_observer.clone())
        .with_reset(cpu_observer.clone());

        info!(
            detector = %detector,
            ipc_strategy = %ipc_strategy,
            cpu_strategy = %cpu_strategy,
            valve_open = valve.is_open(),
            "QoS pipeline built"
        );

        Ok(PipelineHandle {
            name: QOS_PIPELINE,
            pipeline,
            valve,
            ages,
            observers: vec![ipc_observer, cpu_observer],
            metrics: QosMetrics::new(),
        })
    }
}

/// Builder for the slack estimation pipeline
#[derive(Default)]
pub struct EstimatorPipelineBuilder {
    config: QosConfig,
    bus: Option<Arc<ControlBus>>,
    valve: Option<Arc<ValveControl>>,
}

impl EstimatorPipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, config: QosConfig) -> Self {
        self.config = config;
        self
    }

    /// Subscribe the estimator valve to pause/resume feedback on `bus`
    pub fn with_bus(mut self, bus: Arc<ControlBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_valve(mut self, valve: Arc<ValveControl>) -> Self {
        self.valve = Some(valve);
        self
    }

    pub fn build(self) -> Result<EstimatorPipeline> {
        let config = self.config;
        let valve = self
            .valve
            .unwrap_or_else(|| valve_from_config(ESTIMATOR_PIPELINE, &config));
        if let Some(bus) = &self.bus {
            bus.subscribe(valve.clone());
        }
        let ages = Arc::new(AgeTracker::new());

        let new_executor_threshold = config
            .get_f64(keys::NEW_EXECUTOR_THRESHOLD_SEC)
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or(DEFAULT_NEW_EXECUTOR_THRESHOLD);

        let sink = Arc::new(ResultSlot::<SlackEstimate>::new());
        let slack = SlackEstimator::from_config(&config, Producer::<SlackEstimate>::new("slack_estimator").with_consumer(sink.clone()));
        let ignore_new = IgnoreNewExecutorsFilter::new(
            ages.clone(),
            new_executor_threshold,
            Producer::<UsageSnapshot>::new("ignore_new_executors").with_consumer(Arc::new(slack)),
        );
        let production = ProductionPassFilter::new(Producer::<UsageSnapshot>::new("production_pass").with_consumer(Arc::new(ignore_new)));
        let utilization = UtilizationThresholdFilter::new(
            config.positive_f64_or(keys::UTILIZATION_THRESHOLD, DEFAULT_UTILIZATION_THRESHOLD),
            Producer::<UsageSnapshot>::new("utilization_threshold").with_consumer(Arc::new(production)),
        );
        let rate = RateFilter::new(Producer::<UsageSnapshot>::new("rate").with_consumer(Arc::new(utilization)));
        let age = AgeFilter::new(ages.clone(), Producer::<UsageSnapshot>::new("age").with_consumer(Arc::new(rate)));
        let valve_filter = ValveFilter::new(valve.clone(), Producer::<UsageSnapshot>::new("valve").with_consumer(Arc::new(age)));

        let pipeline = Pipeline::new(
            Producer::<UsageSnapshot>::new(ESTIMATOR_PIPELINE).with_consumer(Arc::new(valve_filter)),
            sink,
        );

        info!(
            new_executor_threshold_secs = new_executor_threshold.as_secs_f64(),
            valve_open = valve.is_open(),
            "Estimator pipeline built"
        );

        Ok(PipelineHandle {
            name: ESTIMATOR_PIPELINE,
            pipeline,
            valve,
            ages,
            observers: Vec::new(),
            metrics: QosMetrics::new(),
        })
    }
}
