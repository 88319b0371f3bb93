//! Absolute-threshold detector

use super::{cooldown_from, Cooldown, DEFAULT_ABSOLUTE_THRESHOLD, DEFAULT_CONTENTION_COOLDOWN};
use crate::config::{keys, QosConfig};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NaiveSettings {
    pub absolute_threshold: f64,
    pub cooldown: u64,
}

impl Default for NaiveSettings {
    fn default() -> Self {
        Self {
            absolute_threshold: DEFAULT_ABSOLUTE_THRESHOLD,
            cooldown: DEFAULT_CONTENTION_COOLDOWN,
        }
    }
}

impl NaiveSettings {
    pub fn from_config(config: &QosConfig) -> Self {
        Self {
            absolute_threshold: config.f64_or(keys::ABSOLUTE_THRESHOLD, DEFAULT_ABSOLUTE_THRESHOLD),
            cooldown: cooldown_from(config, DEFAULT_CONTENTION_COOLDOWN),
        }
    }
}

/// Fires when a value falls below a known floor
#[derive(Debug, Clone)]
pub struct NaiveDetector {
    settings: NaiveSettings,
    cooldown: Cooldown,
}

impl NaiveDetector {
    pub fn new(settings: NaiveSettings) -> Self {
        Self {
            settings,
            cooldown: Cooldown::new(settings.cooldown),
        }
    }

    pub fn process_sample(&mut self, value: f64) -> Option<f64> {
        if self.cooldown.tick() {
            return None;
        }

        let threshold = self.settings.absolute_threshold;
        if value < threshold {
            debug!(value = value, threshold = threshold, "Value below absolute threshold");
            self.cooldown.start();
            return Some(threshold - value);
        }
        None
    }

    pub fn reset(&mut self) {
        self.cooldown.clear();
    }
}
