//! Batch processor flush triggers, backpressure and shutdown drain

use async_trait::async_trait;
use coherence_common::events::{CoherenceEvent, EventBus};
use coherence_common::Error;
use coherence_engine::utils::{BatchConfig, BatchError, BatchProcessor, BatchSink};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct CollectingSink {
    batches: Mutex<Vec<Vec<usize>>>,
    failing: AtomicBool,
}

impl CollectingSink {
    fn batches(&self) -> Vec<Vec<usize>> {
        self.batches.lock().unwrap().clone()
    }

    fn items(&self) -> Vec<usize> {
        self.batches().into_iter().flatten().collect()
    }
}

#[async_trait]
impl BatchSink<usize> for CollectingSink {
    async fn process_batch(&self, batch: &[usize]) -> coherence_common::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::Storage("write refused".to_string()));
        }
        self.batches.lock().unwrap().push(batch.to_vec());
        Ok(())
    }
}

fn config(batch_size: usize, max_queue_size: usize) -> BatchConfig {
    BatchConfig {
        batch_size,
        batch_timeout_ms: 100,
        concurrent_batches: 2,
        max_queue_size,
        max_retries: 1,
        retry_base_delay_ms: 10,
    }
}

#[tokio::test(start_paused = true)]
async fn test_size_and_timeout_flushes() {
    let sink = Arc::new(CollectingSink::default());
    let processor = BatchProcessor::new(config(3, 100), sink.clone());

    for i in 0..7 {
        processor.add(i).unwrap();
    }
    tokio::task::yield_now().await;

    // the trailing item waits for the timer
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(processor.queued(), 1);
    assert_eq!(sink.items().len(), 6);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let stats = processor.stats();
    assert_eq!(stats.size_flushes, 2);
    assert_eq!(stats.timeout_flushes, 1);
    assert_eq!(stats.items_processed, 7);
    assert_eq!(stats.queued, 0);

    let mut items = sink.items();
    items.sort();
    assert_eq!(items, (0..7).collect::<Vec<_>>());
}

#[tokio::test(start_paused = true)]
async fn test_size_flush_supersedes_pending_timer() {
    let sink = Arc::new(CollectingSink::default());
    let processor = BatchProcessor::new(config(3, 100), sink.clone());

    processor.add(1).unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    processor.add_many(vec![2, 3]).unwrap();

    // past the first item's original deadline
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(sink.batches(), vec![vec![1, 2, 3]]);
    assert_eq!(processor.stats().timeout_flushes, 0);
}

#[tokio::test]
async fn test_queue_full_rejects_whole_request() {
    let sink = Arc::new(CollectingSink::default());
    let processor = BatchProcessor::new(config(5, 6), sink);

    let err = processor.add_many((0..7).collect()).unwrap_err();
    assert!(matches!(
        err,
        BatchError::QueueFull { queued: 0, capacity: 6, rejected: 7 }
    ));

    processor.add_many(vec![1, 2, 3]).unwrap();
    assert!(processor.add_many(vec![4, 5, 6, 7]).is_err());
    assert_eq!(processor.queued(), 3);
    assert_eq!(processor.stats().items_rejected, 11);
}

#[tokio::test(start_paused = true)]
async fn test_failed_batch_emits_event_and_survives_for_flush() {
    let bus = EventBus::new(16);
    let mut events = bus.subscribe();
    let sink = Arc::new(CollectingSink::default());
    sink.failing.store(true, Ordering::SeqCst);
    let processor = BatchProcessor::with_event_bus(config(2, 100), sink.clone(), bus);

    processor.add_many(vec![10, 11]).unwrap();
    match events.recv().await.unwrap() {
        CoherenceEvent::BatchFailed { size, attempts, .. } => {
            assert_eq!(size, 2);
            assert_eq!(attempts, 2);
        }
        other => panic!("unexpected event {}", other.name()),
    }
    processor.destroy();

    sink.failing.store(false, Ordering::SeqCst);
    assert_eq!(processor.flush().await.unwrap(), 2);
    assert_eq!(sink.items(), vec![10, 11]);
    assert_eq!(processor.stats().batches_failed, 1);
}

#[tokio::test]
async fn test_flush_on_shutdown_drains_partial_batches() {
    let sink = Arc::new(CollectingSink::default());
    let mut cfg = config(4, 100);
    cfg.batch_timeout_ms = 60_000;
    let processor = BatchProcessor::new(cfg, sink.clone());

    processor.add_many((0..10).collect()).unwrap();
    processor.destroy();
    assert!(matches!(processor.add(99), Err(BatchError::Closed)));

    processor.flush().await.unwrap();
    assert_eq!(sink.items().len(), 10);
    assert_eq!(processor.queued(), 0);
}
