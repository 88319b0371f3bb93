//! Multi-checkpoint drop analyzer with quorum voting
//!
//! Checkpoints sit at `T-1, T-2, T-4, ...` inside the window, at most
//! `max_checkpoints` of them. Each one votes on a fractional drop; an event
//! fires when at least `quorum` vote. The history starts pre-filled with a
//! tiny value, so there is no warm-up.

use super::{clamp_sample, cooldown_from, window_size_from, Cooldown, DEFAULT_NEAR_FRACTION, DEFAULT_WINDOW_SIZE};
use crate::config::{keys, QosConfig};
use crate::error::Result;
use std::collections::VecDeque;
use tracing::{debug, info, warn};

pub const DEFAULT_DROP_FRACTIONAL_THRESHOLD: f64 = 0.3;
pub const DEFAULT_DROP_SEVERITY_FRACTION: f64 = 2.1;
pub const DEFAULT_MAX_CHECKPOINTS: usize = 3;
pub const DEFAULT_QUORUM_FRACTION: f64 = 0.7;
pub const DEFAULT_DROP_COOLDOWN: u64 = 0;

/// Value the history is pre-filled with
pub const START_VALUE: f64 = 0.00001;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DropAnalyzerSettings {
    pub window_size: usize,
    pub fractional_threshold: f64,
    pub severity_fraction: f64,
    pub near_fraction: f64,
    pub max_checkpoints: usize,
    pub quorum_fraction: f64,
    pub cooldown: u64,
}

impl Default for DropAnalyzerSettings {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            fractional_threshold: DEFAULT_DROP_FRACTIONAL_THRESHOLD,
            severity_fraction: DEFAULT_DROP_SEVERITY_FRACTION,
            near_fraction: DEFAULT_NEAR_FRACTION,
            max_checkpoints: DEFAULT_MAX_CHECKPOINTS,
            quorum_fraction: DEFAULT_QUORUM_FRACTION,
            cooldown: DEFAULT_DROP_COOLDOWN,
        }
    }
}

impl DropAnalyzerSettings {
    pub fn from_config(config: &QosConfig) -> Result<Self> {
        let max_checkpoints = config.get_i64(keys::MAX_CHECKPOINTS).unwrap_or(DEFAULT_MAX_CHECKPOINTS as i64);
        let max_checkpoints = if max_checkpoints > 0 {
            max_checkpoints as usize
        } else {
            warn!(value = max_checkpoints, "Max checkpoints must be positive, using default");
            DEFAULT_MAX_CHECKPOINTS
        };

        Ok(Self {
            window_size: window_size_from(config, DEFAULT_WINDOW_SIZE)?,
            fractional_threshold: config
                .positive_f64_or(keys::FRACTIONAL_THRESHOLD, DEFAULT_DROP_FRACTIONAL_THRESHOLD),
            severity_fraction: config
                .positive_f64_or(keys::SEVERITY_FRACTION, DEFAULT_DROP_SEVERITY_FRACTION),
            near_fraction: config.positive_f64_or(keys::NEAR_FRACTION, DEFAULT_NEAR_FRACTION),
            max_checkpoints,
            quorum_fraction: config.f64_or(keys::QUORUM_FRACTION, DEFAULT_QUORUM_FRACTION),
            cooldown: cooldown_from(config, DEFAULT_DROP_COOLDOWN),
        })
    }
}

/// Number of `T-2^k` checkpoints that fit in the window
pub fn checkpoint_count(window_size: usize, max_checkpoints: usize) -> usize {
    let fitting = (usize::BITS - window_size.leading_zeros()) as usize;
    fitting.min(max_checkpoints).max(1)
}

/// `ceil(fraction * checkpoints)`, or all checkpoints when that is out of range
pub fn quorum_size(quorum_fraction: f64, checkpoints: usize) -> usize {
    let quorum = (quorum_fraction * checkpoints as f64).ceil();
    if quorum.is_finite() && quorum >= 1.0 && quorum <= checkpoints as f64 {
        quorum as usize
    } else {
        warn!(
            quorum_fraction = quorum_fraction,
            checkpoints = checkpoints,
            "Bad value for quorum, creating 100% quorum"
        );
        checkpoints
    }
}

#[derive(Debug, Clone)]
pub struct SignalDropAnalyzer {
    settings: DropAnalyzerSettings,
    history: VecDeque<f64>,
    /// Lookback offsets, newest first
    offsets: Vec<usize>,
    quorum: usize,
    cooldown: Cooldown,
    reference_point: Option<f64>,
}

impl SignalDropAnalyzer {
    pub fn new(mut settings: DropAnalyzerSettings) -> Self {
        settings.window_size = settings.window_size.max(1);
        let checkpoints = checkpoint_count(settings.window_size, settings.max_checkpoints);
        let quorum = quorum_size(settings.quorum_fraction, checkpoints);
        let offsets: Vec<usize> = (0..checkpoints).map(|k| 1usize << k).collect();

        info!(
            quorum = quorum,
            checkpoints = checkpoints,
            offsets = ?offsets,
            "Drop analyzer parameters"
        );

        Self {
            settings,
            history: std::iter::repeat(START_VALUE).take(settings.window_size).collect(),
            offsets,
            quorum,
            cooldown: Cooldown::new(settings.cooldown),
            reference_point: None,
        }
    }

    pub fn checkpoints(&self) -> usize {
        self.offsets.len()
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    pub fn reference_point(&self) -> Option<f64> {
        self.reference_point
    }

    pub fn process_sample(&mut self, value: f64) -> Option<f64> {
        let value = clamp_sample(value);
        let result = self.evaluate(value);

        self.history.push_back(value);
        self.history.pop_front();
        result
    }

    fn evaluate(&mut self, value: f64) -> Option<f64> {
        if let Some(reference) = self.reference_point {
            let target = reference - self.settings.near_fraction * reference;
            if value >= target {
                info!(value = value, target = target, "Signal returned to established state");
                self.reset_recovery();
            } else {
                if self.cooldown.tick() {
                    return None;
                }
                self.cooldown.start();
                return Some((target - value) * self.settings.severity_fraction);
            }
        }

        if self.cooldown.tick() {
            return None;
        }

        let window = self.settings.window_size;
        let mut votes = 0usize;
        let mut drop_sum = 0.0;
        let mut base_sum = 0.0;
        for offset in &self.offsets {
            let base = self.history[window - offset];
            let drop_fraction = 1.0 - value / base;
            if drop_fraction >= self.settings.fractional_threshold {
                votes += 1;
                drop_sum += drop_fraction;
                base_sum += base;
            }
        }

        debug!(
            value = value,
            votes = votes,
            quorum = self.quorum,
            "Checkpoint voting"
        );

        if votes == 0 || votes < self.quorum {
            return None;
        }

        let mean_drop = drop_sum / votes as f64;
        self.reference_point = Some(base_sum / votes as f64);
        self.cooldown.start();
        Some(mean_drop * self.settings.severity_fraction)
    }

    pub fn reset_recovery(&mut self) {
        self.reference_point = None;
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.settings);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzer(window: usize, quorum_fraction: f64) -> SignalDropAnalyzer {
        SignalDropAnalyzer::new(DropAnalyzerSettings {
            window_size: window,
            quorum_fraction,
            ..DropAnalyzerSettings::default()
        })
    }

    #[test]
    fn test_checkpoint_count() {
        assert_eq!(checkpoint_count(1, 3), 1);
        assert_eq!(checkpoint_count(4, 3), 3);
        assert_eq!(checkpoint_count(10, 3), 3);
        assert_eq!(checkpoint_count(10, 8), 4);
    }

    #[test]
    fn test_quorum_rounding_and_fallback() {
        assert_eq!(quorum_size(0.7, 3), 3);
        assert_eq!(quorum_size(0.5, 3), 2);
        assert_eq!(quorum_size(0.0, 3), 3);
        assert_eq!(quorum_size(1.5, 3), 3);
        assert_eq!(quorum_size(-1.0, 3), 3);
        assert_eq!(quorum_size(f64::NAN, 3), 3);
    }

    #[test]
    fn test_no_warm_up_and_no_false_start() {
        let mut a = analyzer(10, 0.7);
        // Any value is a rise against the start value
        assert_eq!(a.process_sample(10.0), None);
    }

    #[test]
    fn test_quorum_minus_one_votes_does_not_fire() {
        // Window 4: checkpoints at T-1, T-2, T-4; quorum ceil(0.5 * 3) = 2
        let mut a = analyzer(4, 0.5);
        assert_eq!(a.quorum(), 2);
        for v in [4.0, 4.0, 4.0, 10.0] {
            assert_eq!(a.process_sample(v), None);
        }
        // Only T-1 (10.0) sees a drop
        assert_eq!(a.process_sample(6.0), None);
    }

    #[test]
    fn test_quorum_votes_fire() {
        let mut a = analyzer(4, 0.5);
        for v in [4.0, 4.0, 10.0, 10.0] {
            assert_eq!(a.process_sample(v), None);
        }
        // T-1 and T-2 (10.0) vote, T-4 (4.0) does not
        let severity = a.process_sample(6.0).unwrap();
        assert!((severity - 0.4 * DEFAULT_DROP_SEVERITY_FRACTION).abs() < 1e-9);
        assert_eq!(a.reference_point(), Some(10.0));
    }

    #[test]
    fn test_recovery_severity_recomputed_against_reference() {
        let mut a = analyzer(4, 0.5);
        for v in [4.0, 4.0, 10.0, 10.0] {
            a.process_sample(v);
        }
        a.process_sample(6.0).unwrap();

        // target = 10 - 0.1 * 10 = 9
        let severity = a.process_sample(7.0).unwrap();
        assert!((severity - 2.0 * DEFAULT_DROP_SEVERITY_FRACTION).abs() < 1e-9);

        assert_eq!(a.process_sample(9.5), None);
        assert_eq!(a.reference_point(), None);
    }

    #[test]
    fn test_zero_input_is_clamped() {
        let mut a = analyzer(2, 1.0);
        a.process_sample(0.0);
        a.process_sample(0.0);
        assert_eq!(a.process_sample(0.0), None);
    }

    #[test]
    fn test_window_of_one() {
        let mut a = analyzer(1, 1.0);
        assert_eq!(a.checkpoints(), 1);
        a.process_sample(10.0);
        assert!(a.process_sample(2.0).is_some());
    }

    #[test]
    fn test_cooldown_suppresses_refires() {
        let mut a = SignalDropAnalyzer::new(DropAnalyzerSettings {
            window_size: 1,
            quorum_fraction: 1.0,
            cooldown: 2,
            ..DropAnalyzerSettings::default()
        });
        a.process_sample(10.0);
        assert!(a.process_sample(2.0).is_some());
        assert_eq!(a.process_sample(2.0), None);
        assert_eq!(a.process_sample(2.0), None);
        assert!(a.process_sample(2.0).is_some());
    }

    #[test]
    fn test_reset_recovery_returns_to_voting() {
        let mut a = analyzer(1, 1.0);
        a.process_sample(10.0);
        a.process_sample(2.0);
        a.reset_recovery();
        // T-1 is now 2.0, so 2.0 is no drop
        assert_eq!(a.process_sample(2.0), None);
    }
}
