//! Host side of the engine: snapshot sources, correction sinks and the
//! periodic control loop driving both pipelines.

mod r#loop;
mod sink;
mod source;

pub use r#loop::{
    ControlLoop, ControlLoopBuilder, ControlLoopConfig, CycleStatus, ObserverStatus, SharedStatus,
};
pub use sink::{JsonLinesSink, LogSink};
pub use source::JsonLinesSource;

use crate::models::{CorrectionAction, UsageSnapshot};
use anyhow::Result;

pub use async_trait::async_trait;

/// Supplier of usage snapshots, polled once per cycle
#[async_trait]
pub trait UsageSource: Send + Sync {
    /// Next snapshot, or `None` when nothing new is available yet
    async fn next_snapshot(&self) -> Result<Option<UsageSnapshot>>;

    /// Human readable origin for logs
    fn describe(&self) -> String;
}

/// Executor of corrections
#[async_trait]
pub trait CorrectionSink: Send + Sync {
    async fn execute(&self, actions: &[CorrectionAction]) -> Result<()>;
}
