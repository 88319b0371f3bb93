//! Change-point detectors and the stages that run them
//!
//! Provides:
//! - [`Detector`]: closed set of single-signal drop detectors
//! - [`DetectorKind`]: configuration-time selection of a detector
//! - [`DropFilter`]: one detector per production workload
//! - [`OverloadDetector`]: node-wide cpu saturation check
//!
//! Every detector keeps a [`Cooldown`]: after an event, exactly
//! `cooldown` further calls are suppressed.

pub mod assurance;
pub mod drop_filter;
pub mod naive;
pub mod overload;
pub mod quorum;
pub mod rolling;

pub use assurance::AssuranceDetector;
pub use drop_filter::DropFilter;
pub use naive::{NaiveDetector, NaiveSettings};
pub use overload::OverloadDetector;
pub use quorum::{DropAnalyzerSettings, SignalDropAnalyzer};
pub use rolling::{RollingDetector, RollingFractionalDetector, RollingSettings};

use crate::config::{keys, QosConfig};
use crate::error::{QosError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_WINDOW_SIZE: usize = 10;
pub const DEFAULT_CONTENTION_COOLDOWN: u64 = 10;
pub const DEFAULT_ABSOLUTE_THRESHOLD: f64 = 0.0;
pub const DEFAULT_RELATIVE_THRESHOLD: f64 = 20.0;
pub const DEFAULT_FRACTIONAL_THRESHOLD: f64 = 0.5;
pub const DEFAULT_SEVERITY_FRACTION: f64 = 0.4;
pub const DEFAULT_NEAR_FRACTION: f64 = 0.1;

/// Inputs of fractional detectors are floored here so base points never divide by zero
pub const MIN_SAMPLE_VALUE: f64 = 0.1;

pub(crate) fn clamp_sample(value: f64) -> f64 {
    if value.is_nan() || value < MIN_SAMPLE_VALUE {
        MIN_SAMPLE_VALUE
    } else {
        value
    }
}

/// Read a window size; zero or negative is rejected at construction
pub(crate) fn window_size_from(config: &QosConfig, default: usize) -> Result<usize> {
    match config.get_i64(keys::WINDOW_SIZE) {
        Some(w) if w > 0 => Ok(w as usize),
        Some(w) => Err(QosError::invalid(
            keys::WINDOW_SIZE,
            format!("window size must be positive, got {}", w),
        )),
        None => Ok(default),
    }
}

pub(crate) fn cooldown_from(config: &QosConfig, default: u64) -> u64 {
    config.non_negative_i64_or(keys::CONTENTION_COOLDOWN, default as i64) as u64
}

/// Suppression counter shared by all detectors
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cooldown {
    length: u64,
    remaining: u64,
}

impl Cooldown {
    pub fn new(length: u64) -> Self {
        Self {
            length,
            remaining: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        self.remaining > 0
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Consume one call; returns true when the call is suppressed
    pub fn tick(&mut self) -> bool {
        if self.remaining > 0 {
            self.remaining -= 1;
            true
        } else {
            false
        }
    }

    pub fn start(&mut self) {
        self.remaining = self.length;
    }

    pub fn clear(&mut self) {
        self.remaining = 0;
    }
}

/// Detector selected for a drop filter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    Naive,
    Rolling,
    RollingFractional,
    Assurance,
    #[default]
    Quorum,
}

impl DetectorKind {
    /// Kind named by `drop_detector`, quorum when unset
    pub fn from_config(config: &QosConfig) -> Result<Self> {
        match config.get_str(keys::DROP_DETECTOR) {
            Some(name) => name.parse(),
            None => Ok(Self::default()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorKind::Naive => "naive",
            DetectorKind::Rolling => "rolling",
            DetectorKind::RollingFractional => "rolling_fractional",
            DetectorKind::Assurance => "assurance",
            DetectorKind::Quorum => "quorum",
        }
    }
}

impl FromStr for DetectorKind {
    type Err = QosError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "naive" => Ok(DetectorKind::Naive),
            "rolling" => Ok(DetectorKind::Rolling),
            "rolling_fractional" => Ok(DetectorKind::RollingFractional),
            "assurance" => Ok(DetectorKind::Assurance),
            "quorum" => Ok(DetectorKind::Quorum),
            other => Err(QosError::invalid(
                keys::DROP_DETECTOR,
                format!("unknown detector '{}'", other),
            )),
        }
    }
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single-signal detector
#[derive(Debug, Clone)]
pub enum Detector {
    Naive(NaiveDetector),
    Rolling(RollingDetector),
    RollingFractional(RollingFractionalDetector),
    Assurance(AssuranceDetector),
    Quorum(SignalDropAnalyzer),
}

impl Detector {
    /// Build a detector of `kind`; invalid settings fail here, never per sample
    pub fn new(kind: DetectorKind, config: &QosConfig) -> Result<Self> {
        Ok(match kind {
            DetectorKind::Naive => Detector::Naive(NaiveDetector::new(NaiveSettings::from_config(config))),
            DetectorKind::Rolling => Detector::Rolling(RollingDetector::new(RollingSettings::from_config(config)?)),
            DetectorKind::RollingFractional => Detector::RollingFractional(RollingFractionalDetector::new(
                RollingSettings::from_config(config)?,
            )),
            DetectorKind::Assurance => {
                Detector::Assurance(AssuranceDetector::new(RollingSettings::from_config(config)?))
            }
            DetectorKind::Quorum => {
                Detector::Quorum(SignalDropAnalyzer::new(DropAnalyzerSettings::from_config(config)?))
            }
        })
    }

    pub fn kind(&self) -> DetectorKind {
        match self {
            Detector::Naive(_) => DetectorKind::Naive,
            Detector::Rolling(_) => DetectorKind::Rolling,
            Detector::RollingFractional(_) => DetectorKind::RollingFractional,
            Detector::Assurance(_) => DetectorKind::Assurance,
            Detector::Quorum(_) => DetectorKind::Quorum,
        }
    }

    /// Feed one value; returns the severity when a drop is detected
    pub fn process_sample(&mut self, value: f64) -> Option<f64> {
        match self {
            Detector::Naive(d) => d.process_sample(value),
            Detector::Rolling(d) => d.process_sample(value),
            Detector::RollingFractional(d) => d.process_sample(value),
            Detector::Assurance(d) => d.process_sample(value),
            Detector::Quorum(d) => d.process_sample(value),
        }
    }

    /// Apply new settings; history starts over
    pub fn configure(&mut self, config: &QosConfig) -> Result<()> {
        *self = Self::new(self.kind(), config)?;
        Ok(())
    }

    /// Back to the cold-start state with the same settings
    pub fn reset(&mut self) {
        match self {
            Detector::Naive(d) => d.reset(),
            Detector::Rolling(d) => d.reset(),
            Detector::RollingFractional(d) => d.reset(),
            Detector::Assurance(d) => d.reset(),
            Detector::Quorum(d) => d.reset(),
        }
    }

    /// Stop tracking recovery of a previous drop, if any
    pub fn reset_recovery(&mut self) {
        match self {
            Detector::Assurance(d) => d.reset_recovery(),
            Detector::Quorum(d) => d.reset_recovery(),
            _ => {}
        }
    }

    pub fn is_recovering(&self) -> bool {
        match self {
            Detector::Assurance(d) => d.reference_point().is_some(),
            Detector::Quorum(d) => d.reference_point().is_some(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cooldown_suppresses_exact_count() {
        let mut cooldown = Cooldown::new(3);
        cooldown.start();
        assert!(cooldown.tick());
        assert!(cooldown.tick());
        assert!(cooldown.tick());
        assert!(!cooldown.tick());
    }

    #[test]
    fn test_zero_cooldown_never_suppresses() {
        let mut cooldown = Cooldown::new(0);
        cooldown.start();
        assert!(!cooldown.is_active());
        assert!(!cooldown.tick());
    }

    #[test]
    fn test_kind_from_config() {
        assert_eq!(
            DetectorKind::from_config(&QosConfig::new()).unwrap(),
            DetectorKind::Quorum
        );
        let config = QosConfig::new().with(keys::DROP_DETECTOR, "rolling_fractional");
        assert_eq!(
            DetectorKind::from_config(&config).unwrap(),
            DetectorKind::RollingFractional
        );
        let config = QosConfig::new().with(keys::DROP_DETECTOR, "magic");
        assert!(DetectorKind::from_config(&config).is_err());
    }

    #[test]
    fn test_zero_window_rejected_at_construction() {
        let config = QosConfig::new().with(keys::WINDOW_SIZE, 0i64);
        for kind in [
            DetectorKind::Rolling,
            DetectorKind::RollingFractional,
            DetectorKind::Assurance,
            DetectorKind::Quorum,
        ] {
            assert!(matches!(
                Detector::new(kind, &config),
                Err(QosError::InvalidConfiguration { .. })
            ));
        }
        // No window at all
        assert!(Detector::new(DetectorKind::Naive, &config).is_ok());
    }

    #[test]
    fn test_configure_keeps_kind_and_restarts() {
        let mut detector = Detector::new(DetectorKind::Rolling, &QosConfig::new()).unwrap();
        let config = QosConfig::new()
            .with(keys::WINDOW_SIZE, 2i64)
            .with(keys::RELATIVE_THRESHOLD, 1.0);
        detector.configure(&config).unwrap();

        assert_eq!(detector.kind(), DetectorKind::Rolling);
        assert_eq!(detector.process_sample(10.0), None);
        assert_eq!(detector.process_sample(5.0), Some(4.0));
    }

    #[test]
    fn test_clamp_sample() {
        assert_eq!(clamp_sample(0.0), MIN_SAMPLE_VALUE);
        assert_eq!(clamp_sample(f64::NAN), MIN_SAMPLE_VALUE);
        assert_eq!(clamp_sample(3.0), 3.0);
    }
}
