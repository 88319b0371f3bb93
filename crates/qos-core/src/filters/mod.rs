//! Snapshot filters
//!
//! Provides:
//! - Valve gating of whole pipelines
//! - Workload age tracking
//! - Counter-to-rate conversion and EMA smoothing
//! - Usage-based sample selection

pub mod age;
pub mod ema;
pub mod rate;
pub mod usage;
pub mod valve;

pub use age::{AgeFilter, AgeTracker};
pub use ema::{EmaFilter, EmaSeries, EmaSettings, ExponentialMovingAverage};
pub use rate::RateFilter;
pub use usage::{
    IgnoreNewExecutorsFilter, ProductionPassFilter, TooLowUsageFilter, UtilizationThresholdFilter,
};
pub use valve::{ValveControl, ValveFilter};
