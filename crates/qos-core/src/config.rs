//! Flat key/value engine configuration
//!
//! Every detector, filter and strategy reads its parameters from a
//! [`QosConfig`] map:
//! - unknown keys are ignored
//! - missing or mistyped keys fall back to the documented default
//! - out-of-range values are corrected to a safe default where one exists

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

/// Configuration keys understood by the engine
pub mod keys {
    // Smoothing
    pub const ALPHA: &str = "alpha";
    pub const ALPHA_IPC: &str = "alpha_ipc";
    pub const ALPHA_CPU: &str = "alpha_cpu";
    pub const EMA_SERIES: &str = "ema_series";

    // Change-point detectors
    pub const WINDOW_SIZE: &str = "window_size";
    pub const CONTENTION_COOLDOWN: &str = "contention_cooldown";
    pub const ABSOLUTE_THRESHOLD: &str = "absolute_threshold";
    pub const RELATIVE_THRESHOLD: &str = "relative_threshold";
    pub const FRACTIONAL_THRESHOLD: &str = "fractional_threshold";
    pub const SEVERITY_FRACTION: &str = "severity_fraction";
    pub const NEAR_FRACTION: &str = "near_fraction";
    pub const MAX_CHECKPOINTS: &str = "max_checkpoints";
    pub const QUORUM_FRACTION: &str = "quorum_fraction";
    pub const DROP_DETECTOR: &str = "drop_detector";

    // Filters
    pub const MINIMAL_CPU_USAGE: &str = "minimal_cpu_usage";
    pub const NEW_EXECUTOR_THRESHOLD_SEC: &str = "new_executor_threshold_sec";
    pub const OVERLOAD_THRESHOLD: &str = "overload_threshold";
    pub const UTILIZATION_THRESHOLD: &str = "utilization_threshold";
    pub const VALVE_OPENED: &str = "valve_opened";
    pub const VALVE_THRESHOLD: &str = "valve_threshold";

    // Strategies
    pub const DEFAULT_SEVERITY: &str = "default_severity";
    pub const IPC_STRATEGY: &str = "ipc_strategy";
    pub const CPU_STRATEGY: &str = "cpu_strategy";
    pub const STRATEGY_COOLDOWN: &str = "strategy_cooldown";
    pub const STARTING_SEVERITY: &str = "starting_severity";

    // Slack estimation
    pub const MAX_OVERSUBSCRIPTION_FRACTION: &str = "max_oversubscription_fraction";
}

/// A single configuration value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for ConfigValue {
    fn from(v: bool) -> Self {
        ConfigValue::Bool(v)
    }
}

impl From<i64> for ConfigValue {
    fn from(v: i64) -> Self {
        ConfigValue::Int(v)
    }
}

impl From<f64> for ConfigValue {
    fn from(v: f64) -> Self {
        ConfigValue::Float(v)
    }
}

impl From<&str> for ConfigValue {
    fn from(v: &str) -> Self {
        ConfigValue::Text(v.to_string())
    }
}

/// Flat key to typed value map
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QosConfig {
    values: HashMap<String, ConfigValue>,
}

impl QosConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: &str, value: impl Into<ConfigValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<ConfigValue>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Layer `other` on top of this config
    pub fn merged(mut self, other: &QosConfig) -> Self {
        for (k, v) in &other.values {
            self.values.insert(k.clone(), v.clone());
        }
        self
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.values.get(key)? {
            ConfigValue::Float(v) => Some(*v),
            ConfigValue::Int(v) => Some(*v as f64),
            ConfigValue::Text(s) => s.parse().ok(),
            ConfigValue::Bool(_) => None,
        }
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.values.get(key)? {
            ConfigValue::Int(v) => Some(*v),
            ConfigValue::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            ConfigValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.values.get(key)? {
            ConfigValue::Bool(v) => Some(*v),
            ConfigValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.values.get(key)? {
            ConfigValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn f64_or(&self, key: &str, default: f64) -> f64 {
        self.get_f64(key).unwrap_or(default)
    }

    pub fn i64_or(&self, key: &str, default: i64) -> i64 {
        self.get_i64(key).unwrap_or(default)
    }

    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        self.get_bool(key).unwrap_or(default)
    }

    /// Positive float, or `default` with a warning
    pub fn positive_f64_or(&self, key: &str, default: f64) -> f64 {
        match self.get_f64(key) {
            Some(v) if v > 0.0 && v.is_finite() => v,
            Some(v) => {
                warn!(key = %key, value = v, default = default, "Non-positive value, using default");
                default
            }
            None => default,
        }
    }

    /// Non-negative integer, or `default` with a warning
    pub fn non_negative_i64_or(&self, key: &str, default: i64) -> i64 {
        match self.get_i64(key) {
            Some(v) if v >= 0 => v,
            Some(v) => {
                warn!(key = %key, value = v, default = default, "Negative value, using default");
                default
            }
            None => default,
        }
    }
}
