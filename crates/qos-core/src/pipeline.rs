//! Synchronous producer/consumer pipeline framework
//!
//! Provides:
//! - [`Producer`]: ordered fan-out to registered consumers
//! - [`Consumer`]: a stage that accepts a product
//! - [`MultiConsumer`]: fan-in barrier joining N producers per cycle
//! - [`Pipeline`]: entry producer plus result slot, run once per cycle
//!
//! `produce` calls consumers in-line and in registration order. There is
//! no queueing: a whole cycle completes inside one `Pipeline::run` call.

use crate::error::{QosError, Result};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::warn;

/// A stage that accepts products of type `T`
pub trait Consumer<T>: Send + Sync {
    fn consume(&self, product: &T) -> Result<()>;
}

/// Per-cycle state that must be cleared between pipeline runs
pub trait CycleReset: Send + Sync {
    fn reset_cycle(&self);
}

/// Lock a mutex, recovering the data if a previous holder panicked
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fan-out point owned by every stage that emits products
pub struct Producer<T> {
    name: &'static str,
    consumers: Vec<Arc<dyn Consumer<T>>>,
}

impl<T> Producer<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            consumers: Vec::new(),
        }
    }

    /// Register a downstream consumer
    pub fn with_consumer(mut self, consumer: Arc<dyn Consumer<T>>) -> Self {
        self.consumers.push(consumer);
        self
    }

    pub fn add_consumer(&mut self, consumer: Arc<dyn Consumer<T>>) {
        self.consumers.push(consumer);
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Hand `product` to every consumer in registration order.
    ///
    /// A failing consumer is logged and its branch abandoned for this
    /// cycle; the remaining consumers still run. Returns how many failed.
    pub fn produce(&self, product: &T) -> usize {
        let mut failed = 0;
        for (index, consumer) in self.consumers.iter().enumerate() {
            if let Err(e) = consumer.consume(product) {
                failed += 1;
                warn!(
                    stage = self.name,
                    consumer = index,
                    error = %e,
                    "Consumer failed, branch abandoned for this cycle"
                );
            }
        }
        failed
    }
}

/// Callback fired by a [`MultiConsumer`] once all contributions arrived
pub trait ProductsReady<T>: Send + Sync {
    fn all_products_ready(&self, products: Vec<T>) -> Result<()>;
}

/// Fan-in barrier: buffers contributions until `expected` have arrived,
/// then fires the handler once with all of them and clears the buffer.
pub struct MultiConsumer<T> {
    expected: usize,
    buffer: Mutex<Vec<T>>,
    handler: Arc<dyn ProductsReady<T>>,
}

impl<T: Clone + Send> MultiConsumer<T> {
    pub fn new(expected: usize, handler: Arc<dyn ProductsReady<T>>) -> Self {
        Self {
            expected: expected.max(1),
            buffer: Mutex::new(Vec::with_capacity(expected)),
            handler,
        }
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn pending(&self) -> usize {
        lock(&self.buffer).len()
    }
}

impl<T: Clone + Send> Consumer<T> for MultiConsumer<T> {
    fn consume(&self, product: &T) -> Result<()> {
        let ready = {
            let mut buffer = lock(&self.buffer);
            buffer.push(product.clone());
            if buffer.len() >= self.expected {
                Some(std::mem::take(&mut *buffer))
            } else {
                None
            }
        };

        match ready {
            Some(products) => self.handler.all_products_ready(products),
            None => Ok(()),
        }
    }
}

impl<T: Clone + Send> CycleReset for MultiConsumer<T> {
    fn reset_cycle(&self) {
        lock(&self.buffer).clear();
    }
}

/// Terminal consumer that keeps the last product of the cycle
pub struct ResultSlot<T> {
    slot: Mutex<Option<T>>,
}

impl<T> Default for ResultSlot<T> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }
}

impl<T> ResultSlot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Option<T> {
        lock(&self.slot).take()
    }

    pub fn clear(&self) {
        *lock(&self.slot) = None;
    }
}

impl<T: Clone + Send> Consumer<T> for ResultSlot<T> {
    fn consume(&self, product: &T) -> Result<()> {
        *lock(&self.slot) = Some(product.clone());
        Ok(())
    }
}

/// Entry producer, registered fan-in barriers and a result slot
pub struct Pipeline<In, Out> {
    entry: Producer<In>,
    sink: Arc<ResultSlot<Out>>,
    resettables: Vec<Arc<dyn CycleReset>>,
}

impl<In, Out> Pipeline<In, Out> {
    pub fn new(entry: Producer<In>, sink: Arc<ResultSlot<Out>>) -> Self {
        Self {
            entry,
            sink,
            resettables: Vec::new(),
        }
    }

    /// Register per-cycle state cleared after every run
    pub fn with_reset(mut self, stage: Arc<dyn CycleReset>) -> Self {
        self.resettables.push(stage);
        self
    }

    /// Run one cycle.
    ///
    /// Returns `Ok(None)` when the cycle never reached the sink (a stage
    /// dropped the record), and `Err` only when entry stages failed and
    /// nothing was produced.
    pub fn run(&self, input: &In) -> Result<Option<Out>> {
        self.sink.clear();
        let failed = self.entry.produce(input);
        for stage in &self.resettables {
            stage.reset_cycle();
        }

        match self.sink.take() {
            Some(out) => Ok(Some(out)),
            None if failed > 0 => Err(QosError::PipelineAborted { failed }),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        seen: Mutex<Vec<u32>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    impl Consumer<u32> for Recorder {
        fn consume(&self, product: &u32) -> Result<()> {
            lock(&self.seen).push(*product);
            Ok(())
        }
    }

    struct Failing;

    impl Consumer<u32> for Failing {
        fn consume(&self, _product: &u32) -> Result<()> {
            Err(QosError::missing("test", "always fails"))
        }
    }

    struct CountingHandler {
        calls: AtomicUsize,
        last: Mutex<Vec<u32>>,
    }

    impl ProductsReady<u32> for CountingHandler {
        fn all_products_ready(&self, products: Vec<u32>) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *lock(&self.last) = products;
            Ok(())
        }
    }

    fn handler() -> Arc<CountingHandler> {
        Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
            last: Mutex::new(Vec::new()),
        })
    }

    #[test]
    fn test_produce_calls_consumers_in_order() {
        let first = Recorder::new();
        let second = Recorder::new();
        let producer = Producer::<u32>::new("test")
            .with_consumer(first.clone())
            .with_consumer(second.clone());

        assert_eq!(producer.produce(&7), 0);
        assert_eq!(*lock(&first.seen), vec![7]);
        assert_eq!(*lock(&second.seen), vec![7]);
    }

    #[test]
    fn test_failing_consumer_does_not_stop_others() {
        let after = Recorder::new();
        let producer = Producer::<u32>::new("test")
            .with_consumer(Arc::new(Failing))
            .with_consumer(after.clone());

        assert_eq!(producer.produce(&1), 1);
        assert_eq!(*lock(&after.seen), vec![1]);
    }

    #[test]
    fn test_fan_in_waits_for_all_producers() {
        let h = handler();
        let barrier = MultiConsumer::<u32>::new(3, h.clone());

        barrier.consume(&1).unwrap();
        barrier.consume(&2).unwrap();
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);

        barrier.consume(&3).unwrap();
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*lock(&h.last), vec![1, 2, 3]);
        assert_eq!(barrier.pending(), 0);
    }

    #[test]
    fn test_fan_in_reset_discards_partial_cycle() {
        let h = handler();
        let barrier = MultiConsumer::<u32>::new(3, h.clone());

        barrier.consume(&1).unwrap();
        barrier.consume(&2).unwrap();
        barrier.reset_cycle();

        barrier.consume(&3).unwrap();
        barrier.consume(&4).unwrap();
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);

        barrier.consume(&5).unwrap();
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*lock(&h.last), vec![3, 4, 5]);
    }

    #[test]
    fn test_pipeline_run_returns_sink_product() {
        let sink: Arc<ResultSlot<u32>> = Arc::new(ResultSlot::new());
        let pipeline = Pipeline::new(Producer::<u32>::new("entry").with_consumer(sink.clone()), sink);

        assert_eq!(pipeline.run(&5).unwrap(), Some(5));
        // Slot is reset between runs
        assert_eq!(pipeline.run(&6).unwrap(), Some(6));
    }

    #[test]
    fn test_pipeline_without_result_is_not_an_error() {
        let sink: Arc<ResultSlot<u32>> = Arc::new(ResultSlot::new());
        let pipeline = Pipeline::new(Producer::<u32>::new("entry").with_consumer(Recorder::new()), sink);

        assert_eq!(pipeline.run(&5).unwrap(), None);
    }

    #[test]
    fn test_pipeline_error_when_entry_fails() {
        let sink: Arc<ResultSlot<u32>> = Arc::new(ResultSlot::new());
        let pipeline = Pipeline::new(Producer::<u32>::new("entry").with_consumer(Arc::new(Failing)), sink);

        assert!(matches!(
            pipeline.run(&5),
            Err(QosError::PipelineAborted { failed: 1 })
        ));
    }
}
