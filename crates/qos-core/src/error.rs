//! Error types for the QoS engine

use crate::models::WorkloadId;
use thiserror::Error;

/// Errors raised by pipeline stages, detectors and strategies
#[derive(Debug, Error)]
pub enum QosError {
    /// A workload sample lacks identity, counters or a derived value
    #[error("missing data for {workload}: {what}")]
    MissingData { workload: String, what: String },

    /// A configuration value cannot be corrected to a safe default
    #[error("invalid configuration for '{key}': {reason}")]
    InvalidConfiguration { key: String, reason: String },

    /// Workload is not tracked by the age tracker
    #[error("workload {0} is not tracked")]
    NotPresent(WorkloadId),

    /// Decision strategy failed for this cycle
    #[error("strategy {strategy} failed: {reason}")]
    Strategy { strategy: String, reason: String },

    /// Snapshot carries no total capacity
    #[error("usage snapshot does not contain total cpus")]
    NoTotalCapacity,

    /// First pipeline stage failed and nothing reached the sink
    #[error("pipeline aborted: {failed} stage(s) failed")]
    PipelineAborted { failed: usize },
}

impl QosError {
    pub fn missing(workload: impl std::fmt::Display, what: impl Into<String>) -> Self {
        QosError::MissingData {
            workload: workload.to_string(),
            what: what.into(),
        }
    }

    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        QosError::InvalidConfiguration {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn strategy(strategy: impl Into<String>, reason: impl Into<String>) -> Self {
        QosError::Strategy {
            strategy: strategy.into(),
            reason: reason.into(),
        }
    }
}

/// Result alias used across the engine
pub type Result<T> = std::result::Result<T, QosError>;
