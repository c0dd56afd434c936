//! Batched persistence with backpressure
//!
//! Items are buffered into a capped queue and handed to a [`BatchSink`] in
//! batches:
//! - A batch is flushed when `batch_size` items are queued or `batch_timeout_ms`
//!   elapses after the first unflushed item, whichever comes first
//! - A size-triggered flush invalidates the pending timer (generation
//!   counter), so the same items are never flushed twice
//! - At most `concurrent_batches` flushes run at once
//! - Adds beyond `max_queue_size` are rejected with `BatchError::QueueFull`
//! - Failed batches are retried with exponential backoff up to `max_retries`,
//!   then requeued at the front so they precede fresh items
//! - `flush()` drains everything synchronously for graceful shutdown

use async_trait::async_trait;
use chrono::Utc;
use coherence_common::events::{CoherenceEvent, EventBus};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

/// Destination for flushed batches
#[async_trait]
pub trait BatchSink<T>: Send + Sync {
    async fn process_batch(&self, batch: &[T]) -> coherence_common::Result<()>;
}

/// Batch processor errors
#[derive(Debug, Error)]
pub enum BatchError {
    /// Queue at capacity; the items were not accepted
    #[error("Batch queue full ({queued}/{capacity}), rejected {rejected} item(s)")]
    QueueFull {
        queued: usize,
        capacity: usize,
        rejected: usize,
    },

    /// Processor destroyed
    #[error("Batch processor is closed")]
    Closed,

    /// A batch failed during a synchronous flush; its items were requeued
    #[error("Flush failed: {0}")]
    Flush(String),
}

/// Batch processor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,
    #[serde(default = "default_concurrent_batches")]
    pub concurrent_batches: usize,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

fn default_batch_size() -> usize {
    100
}
fn default_batch_timeout_ms() -> u64 {
    5_000
}
fn default_concurrent_batches() -> usize {
    3
}
fn default_max_queue_size() -> usize {
    10_000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    200
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
            concurrent_batches: default_concurrent_batches(),
            max_queue_size: default_max_queue_size(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 {
            return Err("batch.batch_size must be at least 1".to_string());
        }
        if self.batch_timeout_ms == 0 {
            return Err("batch.batch_timeout_ms must be positive".to_string());
        }
        if self.concurrent_batches == 0 {
            return Err("batch.concurrent_batches must be at least 1".to_string());
        }
        if self.max_queue_size < self.batch_size {
            return Err("batch.max_queue_size must be >= batch.batch_size".to_string());
        }
        Ok(())
    }
}

/// What caused a flush
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushTrigger {
    Size,
    Timeout,
}

/// Counters exposed for health output
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchStats {
    pub queued: usize,
    pub size_flushes: u64,
    pub timeout_flushes: u64,
    pub batches_succeeded: u64,
    pub items_processed: u64,
    pub batches_failed: u64,
    pub items_requeued: u64,
    pub items_rejected: u64,
}

#[derive(Default)]
struct Counters {
    size_flushes: AtomicU64,
    timeout_flushes: AtomicU64,
    batches_succeeded: AtomicU64,
    items_processed: AtomicU64,
    batches_failed: AtomicU64,
    items_requeued: AtomicU64,
    items_rejected: AtomicU64,
}

struct BatchInner<T> {
    queue: VecDeque<T>,
    timer_generation: u64,
    timer: Option<JoinHandle<()>>,
    closed: bool,
}

/// Size/time-triggered batch flusher over a [`BatchSink`]
pub struct BatchProcessor<T> {
    config: BatchConfig,
    sink: Arc<dyn BatchSink<T>>,
    inner: Mutex<BatchInner<T>>,
    permits: Arc<Semaphore>,
    tasks: TaskTracker,
    counters: Counters,
    event_bus: Option<EventBus>,
}

impl<T: Send + Sync + 'static> BatchProcessor<T> {
    pub fn new(config: BatchConfig, sink: Arc<dyn BatchSink<T>>) -> Arc<Self> {
        Self::build(config, sink, None)
    }

    /// Emit `BatchFailed` events on this bus
    pub fn with_event_bus(
        config: BatchConfig,
        sink: Arc<dyn BatchSink<T>>,
        event_bus: EventBus,
    ) -> Arc<Self> {
        Self::build(config, sink, Some(event_bus))
    }

    fn build(config: BatchConfig, sink: Arc<dyn BatchSink<T>>, event_bus: Option<EventBus>) -> Arc<Self> {
        let permits = Arc::new(Semaphore::new(config.concurrent_batches.max(1)));
        Arc::new(Self {
            config,
            sink,
            inner: Mutex::new(BatchInner {
                queue: VecDeque::new(),
                timer_generation: 0,
                timer: None,
                closed: false,
            }),
            permits,
            tasks: TaskTracker::new(),
            counters: Counters::default(),
            event_bus,
        })
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BatchInner<T>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue one item
    pub fn add(self: &Arc<Self>, item: T) -> Result<(), BatchError> {
        self.add_many(vec![item])
    }

    /// Queue several items; all-or-nothing with respect to capacity
    pub fn add_many(self: &Arc<Self>, items: Vec<T>) -> Result<(), BatchError> {
        if items.is_empty() {
            return Ok(());
        }

        let ready = {
            let mut inner = self.lock();
            if inner.closed {
                return Err(BatchError::Closed);
            }

            let queued = inner.queue.len();
            if queued + items.len() > self.config.max_queue_size {
                self.counters
                    .items_rejected
                    .fetch_add(items.len() as u64, Ordering::Relaxed);
                tracing::warn!(
                    queued,
                    capacity = self.config.max_queue_size,
                    rejected = items.len(),
                    "Batch queue full, rejecting items"
                );
                return Err(BatchError::QueueFull {
                    queued,
                    capacity: self.config.max_queue_size,
                    rejected: items.len(),
                });
            }

            inner.queue.extend(items);

            let mut ready = Vec::new();
            while inner.queue.len() >= self.config.batch_size {
                let batch: Vec<T> = inner.queue.drain(..self.config.batch_size).collect();
                ready.push(batch);
            }

            if !ready.is_empty() {
                Self::cancel_timer(&mut inner);
            }
            if !inner.queue.is_empty() && inner.timer.is_none() {
                self.schedule_timer(&mut inner);
            }
            ready
        };

        for batch in ready {
            self.counters.size_flushes.fetch_add(1, Ordering::Relaxed);
            self.spawn_flush(batch, FlushTrigger::Size);
        }
        Ok(())
    }

    fn cancel_timer(inner: &mut BatchInner<T>) {
        inner.timer_generation += 1;
        if let Some(handle) = inner.timer.take() {
            handle.abort();
        }
    }

    fn schedule_timer(self: &Arc<Self>, inner: &mut BatchInner<T>) {
        inner.timer_generation += 1;
        let generation = inner.timer_generation;
        let timeout = Duration::from_millis(self.config.batch_timeout_ms);
        let this = Arc::clone(self);

        inner.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            this.on_timer(generation);
        }));
    }

    fn on_timer(self: &Arc<Self>, generation: u64) {
        let batch = {
            let mut inner = self.lock();
            if inner.timer_generation != generation || inner.closed {
                // superseded by a size-triggered flush or a newer timer
                return;
            }
            inner.timer = None;

            let take = inner.queue.len().min(self.config.batch_size);
            let batch: Vec<T> = inner.queue.drain(..take).collect();
            if !inner.queue.is_empty() {
                self.schedule_timer(&mut inner);
            }
            batch
        };

        if !batch.is_empty() {
            self.counters.timeout_flushes.fetch_add(1, Ordering::Relaxed);
            self.spawn_flush(batch, FlushTrigger::Timeout);
        }
    }

    fn spawn_flush(self: &Arc<Self>, batch: Vec<T>, trigger: FlushTrigger) {
        let this = Arc::clone(self);
        self.tasks.spawn(async move {
            let permit = Arc::clone(&this.permits).acquire_owned().await;
            if permit.is_err() {
                this.requeue_front(batch);
                return;
            }
            tracing::trace!(size = batch.len(), ?trigger, "Flushing batch");
            let _ = this.process_with_retry(batch).await;
        });
    }

    /// Hand a batch to the sink, retrying with backoff; requeues on final failure
    async fn process_with_retry(self: &Arc<Self>, batch: Vec<T>) -> Result<usize, BatchError> {
        let attempts = self.config.max_retries + 1;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.sink.process_batch(&batch).await {
                Ok(()) => {
                    self.counters.batches_succeeded.fetch_add(1, Ordering::Relaxed);
                    self.counters
                        .items_processed
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    return Ok(batch.len());
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < attempts {
                        let delay = self
                            .config
                            .retry_base_delay_ms
                            .saturating_mul(1u64 << (attempt - 1).min(16));
                        tracing::warn!(
                            attempt,
                            size = batch.len(),
                            backoff_ms = delay,
                            error = %e,
                            "Batch failed, will retry after backoff"
                        );
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                }
            }
        }

        let size = batch.len();
        tracing::error!(size, attempts, error = %last_error, "Batch failed, requeueing at front");
        self.counters.batches_failed.fetch_add(1, Ordering::Relaxed);
        if let Some(bus) = &self.event_bus {
            bus.emit_lossy(CoherenceEvent::BatchFailed {
                size,
                attempts,
                error: last_error.clone(),
                timestamp: Utc::now(),
            });
        }
        self.requeue_front(batch);
        Err(BatchError::Flush(last_error))
    }

    fn requeue_front(self: &Arc<Self>, batch: Vec<T>) {
        let mut inner = self.lock();
        self.counters
            .items_requeued
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        for item in batch.into_iter().rev() {
            inner.queue.push_front(item);
        }
        if !inner.closed && inner.timer.is_none() {
            self.schedule_timer(&mut inner);
        }
    }

    /// Drain the queue synchronously, after waiting for in-flight batches
    ///
    /// Returns the number of items written. Stops at the first batch that
    /// still fails after retries; that batch is requeued.
    pub async fn flush(self: &Arc<Self>) -> Result<usize, BatchError> {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();

        let mut written = 0;
        loop {
            let batch = {
                let mut inner = self.lock();
                Self::cancel_timer(&mut inner);
                let take = inner.queue.len().min(self.config.batch_size);
                if take == 0 {
                    break;
                }
                inner.queue.drain(..take).collect::<Vec<T>>()
            };

            let _permit = Arc::clone(&self.permits).acquire_owned().await;
            match self.process_with_retry(batch).await {
                Ok(n) => written += n,
                Err(e) => {
                    // leave the requeued batch for the next flush, without a timer
                    Self::cancel_timer(&mut self.lock());
                    return Err(e);
                }
            }
        }
        Ok(written)
    }

    /// Stop timers and refuse new items; queued items stay until `flush()`
    pub fn destroy(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        Self::cancel_timer(&mut inner);
    }

    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn stats(&self) -> BatchStats {
        BatchStats {
            queued: self.queued(),
            size_flushes: self.counters.size_flushes.load(Ordering::Relaxed),
            timeout_flushes: self.counters.timeout_flushes.load(Ordering::Relaxed),
            batches_succeeded: self.counters.batches_succeeded.load(Ordering::Relaxed),
            items_processed: self.counters.items_processed.load(Ordering::Relaxed),
            batches_failed: self.counters.batches_failed.load(Ordering::Relaxed),
            items_requeued: self.counters.items_requeued.load(Ordering::Relaxed),
            items_rejected: self.counters.items_rejected.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coherence_common::Error;
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<Vec<u32>>>,
        failures_remaining: AtomicU32,
    }

    #[async_trait]
    impl BatchSink<u32> for RecordingSink {
        async fn process_batch(&self, batch: &[u32]) -> coherence_common::Result<()> {
            if self.failures_remaining.load(Ordering::SeqCst) > 0 {
                self.failures_remaining.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::Storage("sink unavailable".to_string()));
            }
            self.batches.lock().unwrap().push(batch.to_vec());
            Ok(())
        }
    }

    fn config() -> BatchConfig {
        BatchConfig {
            batch_size: 3,
            batch_timeout_ms: 1_000,
            concurrent_batches: 2,
            max_queue_size: 5,
            max_retries: 1,
            retry_base_delay_ms: 10,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_many_is_all_or_nothing() {
        let sink = Arc::new(RecordingSink::default());
        let processor = BatchProcessor::new(
            BatchConfig {
                batch_size: 10,
                max_queue_size: 10,
                ..config()
            },
            sink,
        );

        processor.add_many((0..8).collect()).unwrap();
        let result = processor.add_many(vec![8, 9, 10]);
        assert!(matches!(result, Err(BatchError::QueueFull { rejected: 3, .. })));
        assert_eq!(processor.queued(), 8);
        assert_eq!(processor.stats().items_rejected, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batch_is_retried_then_requeued_in_front() {
        let sink = Arc::new(RecordingSink::default());
        // first attempt + one retry both fail
        sink.failures_remaining.store(2, Ordering::SeqCst);
        let processor = BatchProcessor::new(config(), sink.clone());

        processor.add_many(vec![1, 2, 3]).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stats = processor.stats();
        assert_eq!(stats.batches_failed, 1);
        assert_eq!(stats.items_requeued, 3);

        processor.add(4).unwrap();
        processor.flush().await.unwrap();
        assert_eq!(processor.stats().items_processed, 4);

        let batches = sink.batches.lock().unwrap().clone();
        assert_eq!(batches, vec![vec![1, 2, 3], vec![4]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_drains_everything() {
        let sink = Arc::new(RecordingSink::default());
        let processor = BatchProcessor::new(config(), sink.clone());

        processor.add_many(vec![1, 2]).unwrap();
        assert_eq!(processor.flush().await.unwrap(), 2);
        assert_eq!(processor.queued(), 0);

        // timer was cancelled: nothing further is flushed
        tokio::time::sleep(Duration::from_millis(2_000)).await;
        assert_eq!(sink.batches.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_rejects_new_items() {
        let sink = Arc::new(RecordingSink::default());
        let processor = BatchProcessor::new(config(), sink);
        processor.destroy();
        processor.destroy();
        assert!(matches!(processor.add(1), Err(BatchError::Closed)));
    }

    #[test]
    fn test_config_validation() {
        assert!(BatchConfig::default().validate().is_ok());
        let bad = BatchConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
