//! Windowed drop detectors
//!
//! Both detectors compare the newest value with the value that left the
//! window, and stay silent until the window has filled once (`W - 1`
//! calls).

use super::{
    clamp_sample, cooldown_from, window_size_from, Cooldown, DEFAULT_CONTENTION_COOLDOWN,
    DEFAULT_FRACTIONAL_THRESHOLD, DEFAULT_NEAR_FRACTION, DEFAULT_RELATIVE_THRESHOLD,
    DEFAULT_SEVERITY_FRACTION, DEFAULT_WINDOW_SIZE,
};
use crate::config::{keys, QosConfig};
use crate::error::Result;
use std::collections::VecDeque;
use tracing::debug;

/// Parameters of the windowed detectors
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RollingSettings {
    pub window_size: usize,
    pub cooldown: u64,
    pub relative_threshold: f64,
    pub fractional_threshold: f64,
    pub severity_fraction: f64,
    pub near_fraction: f64,
}

impl Default for RollingSettings {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            cooldown: DEFAULT_CONTENTION_COOLDOWN,
            relative_threshold: DEFAULT_RELATIVE_THRESHOLD,
            fractional_threshold: DEFAULT_FRACTIONAL_THRESHOLD,
            severity_fraction: DEFAULT_SEVERITY_FRACTION,
            near_fraction: DEFAULT_NEAR_FRACTION,
        }
    }
}

impl RollingSettings {
    pub fn from_config(config: &QosConfig) -> Result<Self> {
        Ok(Self {
            window_size: window_size_from(config, DEFAULT_WINDOW_SIZE)?,
            cooldown: cooldown_from(config, DEFAULT_CONTENTION_COOLDOWN),
            relative_threshold: config.positive_f64_or(keys::RELATIVE_THRESHOLD, DEFAULT_RELATIVE_THRESHOLD),
            fractional_threshold: config
                .positive_f64_or(keys::FRACTIONAL_THRESHOLD, DEFAULT_FRACTIONAL_THRESHOLD),
            severity_fraction: config.positive_f64_or(keys::SEVERITY_FRACTION, DEFAULT_SEVERITY_FRACTION),
            near_fraction: config.positive_f64_or(keys::NEAR_FRACTION, DEFAULT_NEAR_FRACTION),
        })
    }

    pub fn with_window(mut self, window_size: usize) -> Self {
        self.window_size = window_size;
        self
    }

    pub fn with_cooldown(mut self, cooldown: u64) -> Self {
        self.cooldown = cooldown;
        self
    }
}

/// Fixed-size FIFO that yields the value leaving the window
#[derive(Debug, Clone, Default)]
pub(crate) struct Window {
    size: usize,
    values: VecDeque<f64>,
}

impl Window {
    pub(crate) fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            values: VecDeque::with_capacity(size),
        }
    }

    /// Push `value`; returns the base point once the window is full
    pub(crate) fn push(&mut self, value: f64) -> Option<f64> {
        self.values.push_back(value);
        if self.values.len() < self.size {
            return None;
        }
        self.values.pop_front()
    }

    pub(crate) fn clear(&mut self) {
        self.values.clear();
    }
}

/// Fires on an absolute drop against the base point
#[derive(Debug, Clone)]
pub struct RollingDetector {
    settings: RollingSettings,
    window: Window,
    cooldown: Cooldown,
}

impl RollingDetector {
    pub fn new(settings: RollingSettings) -> Self {
        Self {
            settings,
            window: Window::new(settings.window_size),
            cooldown: Cooldown::new(settings.cooldown),
        }
    }

    pub fn process_sample(&mut self, value: f64) -> Option<f64> {
        let base = self.window.push(value)?;
        if self.cooldown.tick() {
            return None;
        }

        let floor = base - self.settings.relative_threshold;
        if value < floor {
            debug!(value = value, base = base, "Absolute drop detected");
            self.cooldown.start();
            return Some(floor - value);
        }
        None
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.cooldown.clear();
    }
}

/// Fires on a fractional drop against the base point
#[derive(Debug, Clone)]
pub struct RollingFractionalDetector {
    settings: RollingSettings,
    window: Window,
    cooldown: Cooldown,
}

impl RollingFractionalDetector {
    pub fn new(settings: RollingSettings) -> Self {
        Self {
            settings,
            window: Window::new(settings.window_size),
            cooldown: Cooldown::new(settings.cooldown),
        }
    }

    pub fn process_sample(&mut self, value: f64) -> Option<f64> {
        let value = clamp_sample(value);
        let base = self.window.push(value)?;
        if self.cooldown.tick() {
            return None;
        }

        let drop_fraction = 1.0 - value / base;
        if drop_fraction > self.settings.fractional_threshold {
            debug!(value = value, base = base, drop = drop_fraction, "Fractional drop detected");
            self.cooldown.start();
            return Some(drop_fraction * self.settings.severity_fraction);
        }
        None
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.cooldown.clear();
    }
}
