//! Event types and the event bus
//!
//! Provides the shared event definitions and EventBus used by every
//! engine component to notify listeners.

mod analytics_types;

pub use analytics_types::{Anomaly, AnomalyKind, ClusterSummary};

use crate::model::{DataPoint, FilteredDataPoint, Weights};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Engine event types
///
/// Events are broadcast via EventBus and serialize with a `type` tag so
/// an outer transport can forward them unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CoherenceEvent {
    /// An item was extracted from a source
    Data { point: DataPoint },

    /// An item cleared the sensitivity threshold
    FilteredData { point: FilteredDataPoint },

    /// A fetch failed after all retries
    CollectionError {
        source_id: String,
        endpoint: String,
        error: String,
        attempts: u32,
        timestamp: DateTime<Utc>,
    },

    /// A source answered with HTTP 429
    RateLimited {
        source_id: String,
        endpoint: String,
        /// Value of the Retry-After header, if the source sent one
        retry_after_secs: Option<u64>,
        timestamp: DateTime<Utc>,
    },

    /// The anomaly ensemble flagged an accepted item
    AnomalyDetected { anomaly: Box<Anomaly> },

    /// A circuit breaker tripped
    CircuitOpened {
        operation: String,
        failure_count: u32,
        timestamp: DateTime<Utc>,
    },

    /// A circuit breaker recovered
    CircuitClosed {
        operation: String,
        timestamp: DateTime<Utc>,
    },

    /// The optimizer committed new scorer weights
    WeightsUpdated {
        previous: Weights,
        weights: Weights,
        improvement: f64,
        confidence: f64,
        timestamp: DateTime<Utc>,
    },

    /// A clustering pass finished
    ClustersUpdated {
        clusters: Vec<ClusterSummary>,
        timestamp: DateTime<Utc>,
    },

    /// A batch exhausted its retries and was requeued
    BatchFailed {
        size: usize,
        attempts: u32,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl CoherenceEvent {
    /// Kebab-case event name, matching the serialized `type` tag
    pub fn name(&self) -> &'static str {
        match self {
            CoherenceEvent::Data { .. } => "data",
            CoherenceEvent::FilteredData { .. } => "filtered-data",
            CoherenceEvent::CollectionError { .. } => "collection-error",
            CoherenceEvent::RateLimited { .. } => "rate-limited",
            CoherenceEvent::AnomalyDetected { .. } => "anomaly-detected",
            CoherenceEvent::CircuitOpened { .. } => "circuit-opened",
            CoherenceEvent::CircuitClosed { .. } => "circuit-closed",
            CoherenceEvent::WeightsUpdated { .. } => "weights-updated",
            CoherenceEvent::ClustersUpdated { .. } => "clusters-updated",
            CoherenceEvent::BatchFailed { .. } => "batch-failed",
        }
    }
}

// ========================================
// EventBus Implementation
// ========================================

/// Central event distribution bus
///
/// Wraps `tokio::broadcast`:
/// - Non-blocking publish (slow subscribers don't block producers)
/// - Multiple concurrent subscribers
/// - Lagged message detection for slow subscribers
///
/// # Examples
///
/// ```
/// use coherence_common::events::{CoherenceEvent, EventBus};
///
/// let bus = EventBus::new(100);
/// let mut rx = bus.subscribe();
///
/// bus.emit_lossy(CoherenceEvent::CircuitClosed {
///     operation: "fetch:news:/top".to_string(),
///     timestamp: chrono::Utc::now(),
/// });
///
/// assert!(matches!(rx.try_recv(), Ok(CoherenceEvent::CircuitClosed { .. })));
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoherenceEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// * `capacity` - Number of events buffered before slow subscribers lag
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<CoherenceEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: CoherenceEvent,
    ) -> Result<usize, broadcast::error::SendError<CoherenceEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: CoherenceEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}
