//! Joins the correction lists of several observers into one

use crate::error::Result;
use crate::models::{dedup_by_target, CorrectionAction};
use crate::pipeline::{MultiConsumer, Producer, ProductsReady};
use std::sync::Arc;
use tracing::debug;

/// Concatenates observer lists in producer order and drops repeated
/// targets, keeping the first occurrence.
pub struct CorrectionMerger {
    producer: Producer<Vec<CorrectionAction>>,
}

impl CorrectionMerger {
    pub fn new(producer: Producer<Vec<CorrectionAction>>) -> Self {
        Self { producer }
    }

    /// Barrier that fires once `observers` lists arrived
    pub fn barrier(self: &Arc<Self>, observers: usize) -> Arc<MultiConsumer<Vec<CorrectionAction>>> {
        Arc::new(MultiConsumer::new(observers, self.clone()))
    }
}

impl ProductsReady<Vec<CorrectionAction>> for CorrectionMerger {
    fn all_products_ready(&self, products: Vec<Vec<CorrectionAction>>) -> Result<()> {
        let total: usize = products.iter().map(Vec::len).sum();
        let merged = dedup_by_target(products.into_iter().flatten().collect());
        debug!(received = total, merged = merged.len(), "Merged corrections");
        self.producer.produce(&merged);
        Ok(())
    }
}
