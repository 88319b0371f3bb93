//! Control bus for feedback between pipelines
//!
//! The bus is an owned registry passed by `Arc` into the composition root.
//! Delivery is synchronous: `publish` returns after every subscriber ran.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Feedback signals emitted by cooldown-bearing strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlEvent {
    /// Stop offering slack while contention is being corrected
    EstimatorPaused,
    /// Contention cleared, slack estimation may continue
    EstimatorResumed,
}

/// Receiver of control events
pub trait ControlSubscriber: Send + Sync {
    fn on_event(&self, event: ControlEvent);
}

/// Registry of control event subscribers
#[derive(Default)]
pub struct ControlBus {
    subscribers: RwLock<Vec<Arc<dyn ControlSubscriber>>>,
}

impl ControlBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, subscriber: Arc<dyn ControlSubscriber>) {
        self.subscribers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(subscriber);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Deliver `event` to every subscriber
    pub fn publish(&self, event: ControlEvent) {
        let subscribers = self
            .subscribers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();

        if subscribers.is_empty() {
            debug!(event = ?event, "No subscribers for control event");
        }
        for subscriber in subscribers {
            subscriber.on_event(event);
        }
    }
}
