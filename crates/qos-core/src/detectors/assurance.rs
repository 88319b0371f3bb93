//! Fractional drop detector with recovery tracking
//!
//! After the first drop the base point is remembered as the reference
//! point. Until the signal climbs back to `reference - near * reference`,
//! every call outside the cooldown fires again with the severity of the
//! first drop. While tracking, only the reference point is consulted; the
//! window keeps rolling underneath without being looked at.

use super::rolling::{RollingSettings, Window};
use super::{clamp_sample, Cooldown};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct AssuranceDetector {
    settings: RollingSettings,
    window: Window,
    cooldown: Cooldown,
    reference_point: Option<f64>,
    last_severity: f64,
}

impl AssuranceDetector {
    pub fn new(settings: RollingSettings) -> Self {
        Self {
            settings,
            window: Window::new(settings.window_size),
            cooldown: Cooldown::new(settings.cooldown),
            reference_point: None,
            last_severity: 0.0,
        }
    }

    pub fn reference_point(&self) -> Option<f64> {
        self.reference_point
    }

    pub fn process_sample(&mut self, value: f64) -> Option<f64> {
        let value = clamp_sample(value);
        let mut base = self.window.push(value)?;

        if let Some(reference) = self.reference_point {
            let target = reference - self.settings.near_fraction * reference;
            if value >= target {
                info!(value = value, target = target, "Signal returned to established state");
                self.reference_point = None;
            }
            base = value;
        }

        if self.cooldown.tick() {
            return None;
        }

        let drop_fraction = 1.0 - value / base;
        if drop_fraction <= self.settings.fractional_threshold && self.reference_point.is_none() {
            return None;
        }

        let severity = match self.reference_point {
            None => {
                self.last_severity = drop_fraction * self.settings.severity_fraction;
                self.reference_point = Some(base);
                debug!(value = value, base = base, drop = drop_fraction, "Drop detected, tracking recovery");
                self.last_severity
            }
            Some(reference) => {
                debug!(value = value, reference = reference, "Signal still below reference");
                self.last_severity
            }
        };
        self.cooldown.start();
        Some(severity)
    }

    pub fn reset_recovery(&mut self) {
        self.reference_point = None;
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.cooldown.clear();
        self.reference_point = None;
        self.last_severity = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(cooldown: u64) -> AssuranceDetector {
        AssuranceDetector::new(
            RollingSettings {
                fractional_threshold: 0.3,
                severity_fraction: 1.0,
                near_fraction: 0.1,
                ..RollingSettings::default()
            }
            .with_window(2)
            .with_cooldown(cooldown),
        )
    }

    #[test]
    fn test_refires_same_severity_until_recovery() {
        let mut d = detector(0);
        d.process_sample(10.0);

        let first = d.process_sample(5.0).unwrap();
        assert!((first - 0.5).abs() < 1e-9);
        assert_eq!(d.reference_point(), Some(10.0));

        // Deeper and shallower drops keep the first severity
        assert_eq!(d.process_sample(2.0), Some(first));
        assert_eq!(d.process_sample(8.0), Some(first));

        // 9.0 is within 10% of the reference
        assert_eq!(d.process_sample(9.0), None);
        assert_eq!(d.reference_point(), None);
    }

    #[test]
    fn test_recovery_ignores_window_base() {
        let mut d = detector(0);
        d.process_sample(10.0);
        d.process_sample(5.0);

        // Against the window base (5.0) this is a rise; against the
        // reference it is still a drop.
        assert!(d.process_sample(6.0).is_some());
    }

    #[test]
    fn test_cooldown_applies_while_tracking() {
        let mut d = detector(2);
        d.process_sample(10.0);
        assert!(d.process_sample(5.0).is_some());
        assert_eq!(d.process_sample(5.0), None);
        assert_eq!(d.process_sample(5.0), None);
        assert!(d.process_sample(5.0).is_some());
    }

    #[test]
    fn test_recovery_observed_during_cooldown() {
        let mut d = detector(5);
        d.process_sample(10.0);
        d.process_sample(5.0);
        assert_eq!(d.process_sample(10.0), None);
        assert_eq!(d.reference_point(), None);
    }

    #[test]
    fn test_reset_recovery() {
        let mut d = detector(0);
        d.process_sample(10.0);
        d.process_sample(5.0);
        d.reset_recovery();
        // Back to fractional evaluation against the window: 5 -> 5 is no drop
        assert_eq!(d.process_sample(5.0), None);
    }
}
