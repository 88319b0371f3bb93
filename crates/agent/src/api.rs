//! HTTP API for health checks, Prometheus metrics, cycle status and valves

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use qos_core::filters::ValveControl;
use qos_core::health::{ComponentStatus, HealthRegistry};
use qos_core::ingest::SharedStatus;
use qos_core::{QosMetrics, StructuredLogger};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Valve requests allowed per window
pub const VALVE_REQUESTS_PER_WINDOW: u32 = 2;

/// Rate limit window for valve requests
pub const VALVE_RATE_WINDOW: Duration = Duration::from_secs(1);

/// Fixed-window limiter shared by all valve endpoints
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    state: Mutex<(Instant, u32)>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            state: Mutex::new((Instant::now(), 0)),
        }
    }

    /// Count one request; false when the current window is exhausted
    pub async fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        if now.duration_since(state.0) >= self.window {
            *state = (now, 0);
        }
        if state.1 >= self.max_requests {
            return false;
        }
        state.1 += 1;
        true
    }
}

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: QosMetrics,
    pub status: SharedStatus,
    pub qos_valve: Arc<ValveControl>,
    pub estimator_valve: Arc<ValveControl>,
    pub logger: StructuredLogger,
    pub limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        status: SharedStatus,
        qos_valve: Arc<ValveControl>,
        estimator_valve: Arc<ValveControl>,
    ) -> Self {
        Self {
            health_registry,
            metrics: QosMetrics::new(),
            status,
            qos_valve,
            estimator_valve,
            logger: StructuredLogger::new("local"),
            limiter: Arc::new(RateLimiter::new(VALVE_REQUESTS_PER_WINDOW, VALVE_RATE_WINDOW)),
        }
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = Arc::new(limiter);
        self
    }

    fn valve(&self, pipeline: &str) -> Option<&Arc<ValveControl>> {
        match pipeline {
            "qos" => Some(&self.qos_valve),
            "estimator" => Some(&self.estimator_valve),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValveState {
    pub pipeline: String,
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct ValveQuery {
    enabled: Option<String>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.into(),
        }),
    )
        .into_response()
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics");
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.status.read().await.clone())
}

async fn get_valve(State(state): State<Arc<AppState>>, Path(pipeline): Path<String>) -> Response {
    match state.valve(&pipeline) {
        Some(valve) => Json(ValveState {
            enabled: valve.is_open(),
            pipeline,
        })
        .into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("Unknown pipeline '{}'", pipeline)),
    }
}

async fn set_valve(
    State(state): State<Arc<AppState>>,
    Path(pipeline): Path<String>,
    Query(query): Query<ValveQuery>,
) -> Response {
    let Some(valve) = state.valve(&pipeline) else {
        return error_response(StatusCode::NOT_FOUND, format!("Unknown pipeline '{}'", pipeline));
    };

    let enabled = match query.enabled.as_deref().map(str::parse::<bool>) {
        Some(Ok(enabled)) => enabled,
        Some(Err(_)) | None => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "Query parameter 'enabled' must be true or false",
            )
        }
    };

    if !state.limiter.try_acquire().await {
        warn!(pipeline = %pipeline, "Valve request rate limited");
        return error_response(StatusCode::TOO_MANY_REQUESTS, "Too many valve requests");
    }

    let open = valve.set_enabled(enabled);
    state.metrics.set_valve_open(valve.name(), open);
    state.logger.log_valve(valve.name(), open, "api");

    Json(ValveState {
        pipeline,
        enabled: open,
    })
    .into_response()
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/status", get(status))
        .route("/valve/:pipeline", get(get_valve).post(set_valve))
        .with_state(state)
}

/// Start the API server
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}
