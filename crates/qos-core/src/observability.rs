//! Observability infrastructure for the QoS engine
//!
//! Provides:
//! - Prometheus metrics (cycle latency, contentions, corrections, slack, valve state)
//! - Structured JSON logging with tracing

use crate::bus::{ControlEvent, ControlSubscriber};
use crate::models::{Contention, CorrectionAction, SlackEstimate};
use prometheus::{
    register_gauge, register_histogram_vec, register_int_counter, register_int_gauge,
    register_int_gauge_vec, Gauge, HistogramVec, IntCounter, IntGauge, IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Default histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.5,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<QosMetricsInner> = OnceLock::new();

struct QosMetricsInner {
    cycle_latency_seconds: HistogramVec,
    workloads_observed: IntGauge,
    contentions_detected: IntCounter,
    corrections_issued: IntCounter,
    snapshots_skipped: IntCounter,
    strategy_failures: IntCounter,
    slack_cpus: Gauge,
    valve_open: IntGaugeVec,
}

impl QosMetricsInner {
    fn new() -> Self {
        Self {
            cycle_latency_seconds: register_histogram_vec!(
                "qos_guard_cycle_latency_seconds",
                "Time spent running one pipeline cycle",
                &["pipeline"],
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_latency_seconds"),

            workloads_observed: register_int_gauge!(
                "qos_guard_workloads_observed",
                "Number of workloads in the latest usage snapshot"
            )
            .expect("Failed to register workloads_observed"),

            contentions_detected: register_int_counter!(
                "qos_guard_contentions_detected_total",
                "Total number of contentions detected"
            )
            .expect("Failed to register contentions_detected"),

            corrections_issued: register_int_counter!(
                "qos_guard_corrections_issued_total",
                "Total number of corrections handed to the executor"
            )
            .expect("Failed to register corrections_issued"),

            snapshots_skipped: register_int_counter!(
                "qos_guard_snapshots_skipped_total",
                "Total number of snapshots that produced no result"
            )
            .expect("Failed to register snapshots_skipped"),

            strategy_failures: register_int_counter!(
                "qos_guard_strategy_failures_total",
                "Total number of failed decision strategy calls"
            )
            .expect("Failed to register strategy_failures"),

            slack_cpus: register_gauge!(
                "qos_guard_slack_cpus",
                "Latest slack cpu estimate offered to best-effort workloads"
            )
            .expect("Failed to register slack_cpus"),

            valve_open: register_int_gauge_vec!(
                "qos_guard_valve_open",
                "Whether a pipeline valve is open (1) or closed (0)",
                &["pipeline"]
            )
            .expect("Failed to register valve_open"),
        }
    }
}

/// Engine metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct QosMetrics {
    _private: (),
}

impl Default for QosMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl QosMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(QosMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &QosMetricsInner {
        GLOBAL_METRICS.get_or_init(QosMetricsInner::new)
    }

    pub fn observe_cycle_latency(&self, pipeline: &str, duration_secs: f64) {
        self.inner()
            .cycle_latency_seconds
            .with_label_values(&[pipeline])
            .observe(duration_secs);
    }

    pub fn set_workloads_observed(&self, count: i64) {
        self.inner().workloads_observed.set(count);
    }

    pub fn add_contentions(&self, count: usize) {
        self.inner().contentions_detected.inc_by(count as u64);
    }

    pub fn add_corrections(&self, count: usize) {
        self.inner().corrections_issued.inc_by(count as u64);
    }

    pub fn inc_snapshots_skipped(&self) {
        self.inner().snapshots_skipped.inc();
    }

    pub fn inc_strategy_failures(&self) {
        self.inner().strategy_failures.inc();
    }

    pub fn set_slack_cpus(&self, cpus: f64) {
        self.inner().slack_cpus.set(cpus);
    }

    pub fn set_valve_open(&self, pipeline: &str, open: bool) {
        self.inner()
            .valve_open
            .with_label_values(&[pipeline])
            .set(i64::from(open));
    }
}

/// Structured logger for engine events
///
/// Consistent JSON-formatted logging of contentions, corrections,
/// feedback and lifecycle events.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn log_startup(&self, version: &str, snapshot_source: &str) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_version = %version,
            snapshot_source = %snapshot_source,
            "QoS agent started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            node = %self.node_name,
            reason = %reason,
            "QoS agent shutting down"
        );
    }

    pub fn log_contention(&self, observer: &str, contention: &Contention) {
        info!(
            event = "contention_detected",
            node = %self.node_name,
            observer = %observer,
            victim = %contention.victim,
            kind = ?contention.kind,
            severity = ?contention.severity,
            aggressor = ?contention.aggressor.as_ref().map(ToString::to_string),
            "Contention detected"
        );
    }

    pub fn log_correction(&self, action: &CorrectionAction) {
        warn!(
            event = "correction_issued",
            node = %self.node_name,
            target = %action.target,
            kind = ?action.kind,
            "Correction issued"
        );
    }

    pub fn log_strategy_failure(&self, observer: &str, strategy: &str, error: &str) {
        warn!(
            event = "strategy_failed",
            node = %self.node_name,
            observer = %observer,
            strategy = %strategy,
            error = %error,
            "Decision strategy failed, no corrections this cycle"
        );
    }

    pub fn log_feedback(&self, event: ControlEvent) {
        match event {
            ControlEvent::EstimatorPaused => info!(
                event = "estimator_paused",
                node = %self.node_name,
                "Slack estimation paused while contention is corrected"
            ),
            ControlEvent::EstimatorResumed => info!(
                event = "estimator_resumed",
                node = %self.node_name,
                "Slack estimation resumed"
            ),
        }
    }

    pub fn log_valve(&self, pipeline: &str, open: bool, source: &str) {
        info!(
            event = "valve_toggled",
            node = %self.node_name,
            pipeline = %pipeline,
            open = open,
            source = %source,
            "Pipeline valve toggled"
        );
    }

    pub fn log_slack(&self, estimate: &SlackEstimate) {
        info!(
            event = "slack_estimated",
            node = %self.node_name,
            slack_cpus = estimate.cpus,
            timestamp = estimate.timestamp,
            "Slack resources estimated"
        );
    }

    pub fn log_snapshot_skipped(&self, pipeline: &str, reason: &str) {
        warn!(
            event = "snapshot_skipped",
            node = %self.node_name,
            pipeline = %pipeline,
            reason = %reason,
            "Snapshot produced no result"
        );
    }
}

impl ControlSubscriber for StructuredLogger {
    fn on_event(&self, event: ControlEvent) {
        self.log_feedback(event);
    }
}
