//! Pipeline on/off valve
//!
//! The valve is open iff its counter is at or above the threshold. Every
//! independent closer decrements the counter; reopening increments it but
//! never above the threshold, so all closers must reopen before the
//! pipeline runs again.

use crate::bus::{ControlEvent, ControlSubscriber};
use crate::error::Result;
use crate::models::UsageSnapshot;
use crate::pipeline::{Consumer, Producer};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Default number of openers required for the valve to pass products
pub const DEFAULT_VALVE_THRESHOLD: i64 = 1;

/// Shared on/off state, toggled from the HTTP API or the control bus
#[derive(Debug)]
pub struct ValveControl {
    name: &'static str,
    counter: AtomicI64,
    threshold: i64,
}

impl ValveControl {
    pub fn new(name: &'static str, opened: bool) -> Self {
        Self::with_threshold(name, opened, DEFAULT_VALVE_THRESHOLD)
    }

    pub fn with_threshold(name: &'static str, opened: bool, threshold: i64) -> Self {
        let threshold = threshold.max(1);
        Self {
            name,
            counter: AtomicI64::new(if opened { threshold } else { threshold - 1 }),
            threshold,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_open(&self) -> bool {
        self.counter.load(Ordering::SeqCst) >= self.threshold
    }

    /// Add one opener, saturating at the threshold; returns the new state
    pub fn open(&self) -> bool {
        let threshold = self.threshold;
        let _ = self
            .counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                (c < threshold).then_some(c + 1)
            });
        let open = self.is_open();
        info!(valve = self.name, open = open, "Valve opened by caller");
        open
    }

    /// Remove one opener; returns the new state
    pub fn close(&self) -> bool {
        self.counter.fetch_sub(1, Ordering::SeqCst);
        let open = self.is_open();
        info!(valve = self.name, open = open, "Valve closed by caller");
        open
    }

    /// Apply an enable/disable request
    pub fn set_enabled(&self, enabled: bool) -> bool {
        if enabled {
            self.open()
        } else {
            self.close()
        }
    }
}

impl ControlSubscriber for ValveControl {
    fn on_event(&self, event: ControlEvent) {
        match event {
            ControlEvent::EstimatorPaused => {
                self.close();
            }
            ControlEvent::EstimatorResumed => {
                self.open();
            }
        }
    }
}

/// First stage of a pipeline: forwards snapshots only while the valve is open
pub struct ValveFilter {
    control: Arc<ValveControl>,
    producer: Producer<UsageSnapshot>,
}

impl ValveFilter {
    pub fn new(control: Arc<ValveControl>, producer: Producer<UsageSnapshot>) -> Self {
        Self { control, producer }
    }
}

impl Consumer<UsageSnapshot> for ValveFilter {
    fn consume(&self, snapshot: &UsageSnapshot) -> Result<()> {
        if !self.control.is_open() {
            debug!(valve = self.control.name(), "Valve closed, skipping cycle");
            return Ok(());
        }
        self.producer.produce(snapshot);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::ResultSlot;

    #[test]
    fn test_valve_open_by_default() {
        let valve = ValveControl::new("qos", true);
        assert!(valve.is_open());
        assert!(!ValveControl::new("qos", false).is_open());
    }

    #[test]
    fn test_open_saturates_at_threshold() {
        let valve = ValveControl::new("qos", true);
        valve.open();
        valve.open();
        // One close is enough since opening never exceeds the threshold
        assert!(!valve.close());
        assert!(valve.open());
    }

    #[test]
    fn test_every_closer_must_reopen() {
        let valve = ValveControl::new("estimator", true);
        valve.close();
        valve.on_event(ControlEvent::EstimatorPaused);
        assert!(!valve.is_open());

        valve.open();
        assert!(!valve.is_open());
        valve.on_event(ControlEvent::EstimatorResumed);
        assert!(valve.is_open());
    }

    #[test]
    fn test_closed_valve_does_not_forward() {
        let control = Arc::new(ValveControl::new("qos", false));
        let sink = Arc::new(ResultSlot::<UsageSnapshot>::new());
        let filter = ValveFilter::new(control.clone(), Producer::<UsageSnapshot>::new("valve").with_consumer(sink.clone()));

        filter.consume(&UsageSnapshot::default()).unwrap();
        assert!(sink.take().is_none());

        control.open();
        filter.consume(&UsageSnapshot::default()).unwrap();
        assert!(sink.take().is_some());
    }
}
