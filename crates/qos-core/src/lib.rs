//! Streaming contention detection and correction engine
//!
//! This crate provides:
//! - A synchronous producer/consumer pipeline framework
//! - Usage filters (rates, smoothing, age and utilization gates)
//! - Change-point detectors for per-workload signal drops and node overload
//! - Decision strategies turning contentions into terminate actions
//! - Slack cpu estimation for best-effort workloads
//! - The periodic control loop, health checks and observability

pub mod builder;
pub mod bus;
pub mod config;
pub mod detectors;
pub mod error;
pub mod filters;
pub mod health;
pub mod ingest;
pub mod merger;
pub mod models;
pub mod observability;
pub mod observer;
pub mod pipeline;
pub mod slack;
pub mod state;
pub mod strategies;

pub use builder::{
    EstimatorPipeline, EstimatorPipelineBuilder, PipelineHandle, QosPipeline, QosPipelineBuilder,
};
pub use bus::{ControlBus, ControlEvent, ControlSubscriber};
pub use config::{ConfigValue, QosConfig};
pub use error::{QosError, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{QosMetrics, StructuredLogger};
