//! QoS Agent - per-node contention detection and correction daemon
//!
//! Reads usage snapshots, runs the QoS and slack estimation pipelines
//! every cycle and serves health, metrics and valve controls over HTTP.

use anyhow::{Context, Result};
use qos_core::health::{components, HealthRegistry};
use qos_core::ingest::{
    ControlLoopBuilder, CorrectionSink, CycleStatus, JsonLinesSink, JsonLinesSource, LogSink,
    SharedStatus, UsageSource,
};
use qos_core::{ControlBus, EstimatorPipelineBuilder, QosPipelineBuilder, StructuredLogger};
use qos_agent::{api, config::AgentConfig};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting qos-agent");

    let config = AgentConfig::load()?;
    info!(
        node_name = %config.node_name,
        snapshot_path = %config.snapshot_path.display(),
        interval_secs = config.interval_secs,
        "Agent configured"
    );

    let health_registry = HealthRegistry::new();
    for component in [
        components::INGEST,
        components::QOS_PIPELINE,
        components::ESTIMATOR,
        components::SINK,
        components::API,
    ] {
        health_registry.register(component).await;
    }

    let logger = StructuredLogger::new(&config.node_name);

    // Pipelines share one bus so the QoS strategies can pause the estimator
    let bus = Arc::new(ControlBus::new());
    bus.subscribe(Arc::new(logger.clone()));
    let qos = QosPipelineBuilder::new()
        .with_config(config.engine.clone())
        .with_bus(bus.clone())
        .with_logger(logger.clone())
        .build()
        .context("Failed to build QoS pipeline")?;
    let estimator = EstimatorPipelineBuilder::new()
        .with_config(config.engine.clone())
        .with_bus(bus.clone())
        .build()
        .context("Failed to build estimator pipeline")?;

    let source: Arc<dyn UsageSource> = Arc::new(JsonLinesSource::new(&config.snapshot_path));
    let sink: Arc<dyn CorrectionSink> = match &config.corrections_path {
        Some(path) => Arc::new(JsonLinesSink::new(path)),
        None => Arc::new(LogSink::new(&config.node_name)),
    };
    logger.log_startup(AGENT_VERSION, &source.describe());

    let status: SharedStatus = Arc::new(RwLock::new(CycleStatus::default()));
    let app_state = Arc::new(
        api::AppState::new(
            health_registry.clone(),
            status.clone(),
            qos.valve().clone(),
            estimator.valve().clone(),
        )
        .with_logger(logger.clone()),
    );

    let control_loop = ControlLoopBuilder::new()
        .source(source)
        .sink(sink)
        .qos_pipeline(Arc::new(qos))
        .estimator_pipeline(Arc::new(estimator))
        .health(health_registry.clone())
        .status(status)
        .logger(logger.clone())
        .interval(config.interval())
        .max_sink_retries(config.max_sink_retries)
        .build()?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let loop_handle = tokio::spawn(control_loop.run(shutdown_tx.subscribe()));

    let api_port = config.api_port;
    let api_registry = health_registry.clone();
    let api_shutdown = shutdown_tx.subscribe();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api::serve(api_port, app_state, api_shutdown).await {
            error!(error = %e, "API server failed");
            api_registry
                .set_unhealthy(components::API, format!("{:#}", e))
                .await;
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    let _ = shutdown_tx.send(());

    let _ = loop_handle.await;
    let _ = api_handle.await;
    info!("Shutdown complete");

    Ok(())
}
