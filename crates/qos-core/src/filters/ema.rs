//! Exponential moving average smoothing
//!
//! Provides:
//! - [`ExponentialMovingAverage`]: per-series EMA with regular and
//!   irregular-interval update rules
//! - [`EmaFilter`]: pipeline stage smoothing one signal per workload

use crate::config::{keys, QosConfig};
use crate::error::Result;
use crate::models::{Signal, UsageSnapshot};
use crate::pipeline::{Consumer, Producer};
use crate::state::WorkloadStateMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Default smoothing factor
pub const DEFAULT_ALPHA: f64 = 0.2;

/// Update rule for the moving average
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmaSeries {
    /// Constant sampling cadence
    #[default]
    Regular,
    /// Weights depend on the time between samples
    Irregular,
}

/// Smoothing parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmaSettings {
    pub alpha: f64,
    pub series: EmaSeries,
}

impl Default for EmaSettings {
    fn default() -> Self {
        Self {
            alpha: DEFAULT_ALPHA,
            series: EmaSeries::Regular,
        }
    }
}

impl EmaSettings {
    /// Read `alpha_key` (falling back to `alpha`) and the series type.
    /// Alpha outside (0, 1] is replaced by the default.
    pub fn from_config(config: &QosConfig, alpha_key: &str, default_alpha: f64) -> Self {
        let alpha = config
            .get_f64(alpha_key)
            .or_else(|| config.get_f64(keys::ALPHA))
            .unwrap_or(default_alpha);
        let alpha = if alpha > 0.0 && alpha <= 1.0 {
            alpha
        } else {
            warn!(key = %alpha_key, value = alpha, "Alpha must be in (0, 1], using default");
            default_alpha
        };
        let series = match config.get_str(keys::EMA_SERIES) {
            Some("irregular") => EmaSeries::Irregular,
            _ => EmaSeries::Regular,
        };
        Self { alpha, series }
    }
}

/// Moving average over one series
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialMovingAverage {
    settings: EmaSettings,
    previous_ema: f64,
    previous_sample: f64,
    previous_timestamp: f64,
    initialized: bool,
}

impl ExponentialMovingAverage {
    pub fn new(settings: EmaSettings) -> Self {
        Self {
            settings,
            previous_ema: 0.0,
            previous_sample: 0.0,
            previous_timestamp: 0.0,
            initialized: false,
        }
    }

    pub fn with_alpha(alpha: f64) -> Self {
        Self::new(EmaSettings {
            alpha,
            ..EmaSettings::default()
        })
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Feed a sample taken at `timestamp` and return the smoothed value.
    /// The first sample is returned unchanged.
    pub fn calculate_ema(&mut self, sample: f64, timestamp: f64) -> f64 {
        if !self.initialized {
            self.previous_ema = sample;
            self.initialized = true;
        } else {
            self.previous_ema = match self.settings.series {
                EmaSeries::Regular => self.regular(sample),
                EmaSeries::Irregular => self.irregular(sample, timestamp),
            };
        }
        self.previous_sample = sample;
        self.previous_timestamp = timestamp;
        self.previous_ema
    }

    fn regular(&self, sample: f64) -> f64 {
        let alpha = self.settings.alpha;
        alpha * sample + (1.0 - alpha) * self.previous_ema
    }

    fn irregular(&self, sample: f64, timestamp: f64) -> f64 {
        let delta_t = timestamp - self.previous_timestamp;
        if delta_t <= 0.0 {
            return self.regular(sample);
        }

        let dynamic_alpha = delta_t / self.settings.alpha;
        let weight = (-dynamic_alpha).exp();
        let dynamic_weight = (1.0 - weight) / dynamic_alpha;
        let ema = weight * self.previous_ema
            + (dynamic_weight - weight) * self.previous_sample
            + (1.0 - dynamic_weight) * sample;

        if ema.is_finite() {
            ema
        } else {
            self.regular(sample)
        }
    }
}

/// Smooths `signal` per workload and writes the matching EMA slot
pub struct EmaFilter {
    signal: Signal,
    settings: EmaSettings,
    averages: WorkloadStateMap<ExponentialMovingAverage>,
    producer: Producer<UsageSnapshot>,
}

impl EmaFilter {
    pub fn new(signal: Signal, settings: EmaSettings, producer: Producer<UsageSnapshot>) -> Self {
        Self {
            signal,
            settings,
            averages: WorkloadStateMap::new(),
            producer,
        }
    }

    pub fn tracked(&self) -> usize {
        self.averages.len()
    }
}

impl Consumer<UsageSnapshot> for EmaFilter {
    fn consume(&self, snapshot: &UsageSnapshot) -> Result<()> {
        self.averages.begin_cycle();
        let target = self.signal.smoothed();
        let mut out = Vec::with_capacity(snapshot.samples.len());

        for sample in &snapshot.samples {
            let Some((id, stats)) = sample.complete() else {
                continue;
            };
            let Some(value) = stats.signal(self.signal) else {
                debug!(workload = %id, signal = %self.signal, "Signal missing, passed through unsmoothed");
                out.push(sample.clone());
                continue;
            };

            let settings = self.settings;
            let ema = self.averages.with_entry(
                id,
                || ExponentialMovingAverage::new(settings),
                |avg| avg.calculate_ema(value, stats.timestamp),
            );

            let mut sample = sample.clone();
            if let Some(stats) = sample.stats.as_mut() {
                stats.set_signal(target, ema);
            }
            out.push(sample);
        }
        self.averages.evict_stale();

        // Downstream detectors report every cycle, even when nothing was smoothed
        self.producer.produce(&snapshot.with_samples(out));
        Ok(())
    }
}
