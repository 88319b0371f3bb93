//! Periodic control loop
//!
//! Every tick pulls one snapshot, runs the QoS pipeline then the estimator
//! pipeline, and hands corrections to the sink. The QoS pipeline runs first
//! so that estimator feedback published during its cycle applies to the
//! estimator run of the same snapshot.

use super::{CorrectionSink, UsageSource};
use crate::builder::{EstimatorPipeline, QosPipeline};
use crate::health::{components, HealthRegistry};
use crate::models::{CorrectionAction, SlackEstimate, UsageSnapshot};
use crate::observability::{QosMetrics, StructuredLogger};
use crate::observer::ObserverPhase;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ControlLoopConfig {
    /// Time between cycles (default: 5 seconds)
    pub interval: Duration,
    /// Retries after a failed sink call (default: 3)
    pub max_sink_retries: u32,
    /// Wait before the first retry, doubled for each further one
    pub retry_backoff: Duration,
}

impl Default for ControlLoopConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_sink_retries: 3,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObserverStatus {
    pub name: String,
    pub phase: String,
}

/// Outcome of the latest cycles, served on `/status`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleStatus {
    pub cycles: u64,
    pub last_snapshot_timestamp: Option<f64>,
    pub workloads: usize,
    pub last_corrections: Vec<CorrectionAction>,
    pub total_corrections: u64,
    pub last_slack: Option<SlackEstimate>,
    pub qos_valve_open: bool,
    pub estimator_valve_open: bool,
    #[serde(default)]
    pub observers: Vec<ObserverStatus>,
    /// Cycles whose corrections the sink could not execute
    #[serde(default)]
    pub sink_failures: u64,
    #[serde(default)]
    pub last_sink_error: Option<String>,
}

pub type SharedStatus = Arc<RwLock<CycleStatus>>;

fn phase_name(phase: ObserverPhase) -> &'static str {
    match phase {
        ObserverPhase::Idle => "idle",
        ObserverPhase::Collecting => "collecting",
        ObserverPhase::Deciding => "deciding",
        ObserverPhase::CoolingDown => "cooling_down",
    }
}

pub struct ControlLoop {
    source: Arc<dyn UsageSource>,
    sink: Arc<dyn CorrectionSink>,
    qos: Arc<QosPipeline>,
    estimator: Arc<EstimatorPipeline>,
    health: HealthRegistry,
    status: SharedStatus,
    metrics: QosMetrics,
    logger: StructuredLogger,
    config: ControlLoopConfig,
}

impl ControlLoop {
    pub fn status(&self) -> SharedStatus {
        self.status.clone()
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            source = %self.source.describe(),
            "Starting control loop"
        );

        let mut ticker = interval(self.config.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_cycle().await {
                        warn!(error = %e, "Control cycle failed");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down control loop");
                    break;
                }
            }
        }
    }

    /// Run one cycle; `Ok(false)` when the source had no new snapshot
    pub async fn run_cycle(&self) -> Result<bool> {
        let snapshot = match self.source.next_snapshot().await {
            Ok(Some(snapshot)) => {
                self.health.set_healthy(components::INGEST).await;
                snapshot
            }
            Ok(None) => return Ok(false),
            Err(e) => {
                self.health
                    .set_degraded(components::INGEST, format!("{:#}", e))
                    .await;
                return Err(e);
            }
        };
        self.metrics.set_workloads_observed(snapshot.samples.len() as i64);

        let corrections = self.run_qos(&snapshot).await;
        let slack = self.run_estimator(&snapshot).await;

        let mut sink_error = None;
        if !corrections.is_empty() {
            for action in &corrections {
                self.logger.log_correction(action);
            }
            self.metrics.add_corrections(corrections.len());
            match self.execute_with_retry(&corrections).await {
                Ok(()) => self.health.set_healthy(components::SINK).await,
                Err(e) => {
                    let message = format!("{:#}", e);
                    error!(error = %message, corrections = corrections.len(), "Corrections not executed");
                    self.health.set_degraded(components::SINK, message.clone()).await;
                    sink_error = Some(message);
                }
            }
        }

        let qos_open = self.qos.valve().is_open();
        let estimator_open = self.estimator.valve().is_open();
        self.metrics.set_valve_open(self.qos.name(), qos_open);
        self.metrics.set_valve_open(self.estimator.name(), estimator_open);

        {
            let mut status = self.status.write().await;
            status.cycles += 1;
            status.last_snapshot_timestamp = Some(snapshot.timestamp);
            status.workloads = snapshot.samples.len();
            status.total_corrections += corrections.len() as u64;
            status.last_corrections = corrections;
            if slack.is_some() {
                status.last_slack = slack;
            }
            status.qos_valve_open = qos_open;
            status.estimator_valve_open = estimator_open;
            if sink_error.is_some() {
                status.sink_failures += 1;
                status.last_sink_error = sink_error;
            }
            status.observers = self
                .qos
                .observer_phases()
                .into_iter()
                .map(|(name, phase)| ObserverStatus {
                    name: name.to_string(),
                    phase: phase_name(phase).to_string(),
                })
                .collect();
        }

        self.health.set_ready(true).await;
        Ok(true)
    }

    async fn run_qos(&self, snapshot: &UsageSnapshot) -> Vec<CorrectionAction> {
        let outcome = self.qos.run(snapshot);
        self.health.record_cycle(components::QOS_PIPELINE, &outcome).await;
        match outcome {
            Ok(Some(actions)) => actions,
            Ok(None) => {
                self.skipped(self.qos.name(), self.qos.valve().is_open(), "no corrections produced");
                Vec::new()
            }
            Err(e) => {
                self.skipped(self.qos.name(), true, &e.to_string());
                Vec::new()
            }
        }
    }

    async fn run_estimator(&self, snapshot: &UsageSnapshot) -> Option<SlackEstimate> {
        let outcome = self.estimator.run(snapshot);
        self.health.record_cycle(components::ESTIMATOR, &outcome).await;
        match outcome {
            Ok(Some(estimate)) => {
                self.logger.log_slack(&estimate);
                Some(estimate)
            }
            Ok(None) => {
                self.skipped(self.estimator.name(), self.estimator.valve().is_open(), "no estimate produced");
                None
            }
            Err(e) => {
                self.skipped(self.estimator.name(), true, &e.to_string());
                None
            }
        }
    }

    fn skipped(&self, pipeline: &str, valve_open: bool, reason: &str) {
        self.metrics.inc_snapshots_skipped();
        if valve_open {
            self.logger.log_snapshot_skipped(pipeline, reason);
        } else {
            debug!(pipeline = pipeline, "Valve closed, snapshot skipped");
        }
    }

    /// Bounded retry around the sink
    async fn execute_with_retry(&self, actions: &[CorrectionAction]) -> Result<()> {
        let mut attempt = 0u32;
        let mut backoff = self.config.retry_backoff;
        loop {
            match self.sink.execute(actions).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.config.max_sink_retries => {
                    attempt += 1;
                    warn!(
                        attempt = attempt,
                        max_retries = self.config.max_sink_retries,
                        error = %e,
                        "Correction sink failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Err(e) => {
                    return Err(e.context(format!(
                        "Correction sink failed after {} retries",
                        attempt
                    )))
                }
            }
        }
    }
}

/// Builder for the control loop
pub struct ControlLoopBuilder {
    source: Option<Arc<dyn UsageSource>>,
    sink: Option<Arc<dyn CorrectionSink>>,
    qos: Option<Arc<QosPipeline>>,
    estimator: Option<Arc<EstimatorPipeline>>,
    health: Option<HealthRegistry>,
    status: Option<SharedStatus>,
    logger: Option<StructuredLogger>,
    config: ControlLoopConfig,
}

impl ControlLoopBuilder {
    pub fn new() -> Self {
        Self {
            source: None,
            sink: None,
            qos: None,
            estimator: None,
            health: None,
            status: None,
            logger: None,
            config: ControlLoopConfig::default(),
        }
    }

    pub fn source(mut self, source: Arc<dyn UsageSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn sink(mut self, sink: Arc<dyn CorrectionSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn qos_pipeline(mut self, pipeline: Arc<QosPipeline>) -> Self {
        self.qos = Some(pipeline);
        self
    }

    pub fn estimator_pipeline(mut self, pipeline: Arc<EstimatorPipeline>) -> Self {
        self.estimator = Some(pipeline);
        self
    }

    pub fn health(mut self, health: HealthRegistry) -> Self {
        self.health = Some(health);
        self
    }

    /// Share the status with another reader, e.g. the HTTP API
    pub fn status(mut self, status: SharedStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    pub fn max_sink_retries(mut self, retries: u32) -> Self {
        self.config.max_sink_retries = retries;
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.config.retry_backoff = backoff;
        self
    }

    pub fn build(self) -> Result<ControlLoop> {
        let source = self
            .source
            .ok_or_else(|| anyhow::anyhow!("Snapshot source is required"))?;
        let sink = self
            .sink
            .ok_or_else(|| anyhow::anyhow!("Correction sink is required"))?;
        let qos = self
            .qos
            .ok_or_else(|| anyhow::anyhow!("QoS pipeline is required"))?;
        let estimator = self
            .estimator
            .ok_or_else(|| anyhow::anyhow!("Estimator pipeline is required"))?;

        Ok(ControlLoop {
            source,
            sink,
            qos,
            estimator,
            health: self.health.unwrap_or_default(),
            status: self.status.unwrap_or_default(),
            metrics: QosMetrics::new(),
            logger: self.logger.unwrap_or_else(|| StructuredLogger::new("local")),
            config: self.config,
        })
    }
}

impl Default for ControlLoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}
