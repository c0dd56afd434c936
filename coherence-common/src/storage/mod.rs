//! Persistence interface consumed by the engine
//!
//! The engine depends only on the [`Storage`] trait. Two adapters ship with
//! the crate: [`MemoryStorage`] (always available, also the fallback when no
//! backend is reachable) and `SqliteStorage` (feature `sqlite`).

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::MemoryStorage;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;

use crate::model::FilteredDataPoint;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Filter for `query` / `count`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageQuery {
    pub source: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub min_score: Option<f64>,
    /// Newest records first when limited
    pub limit: Option<usize>,
}

impl StorageQuery {
    pub fn for_source(source: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether a record satisfies every set criterion (limit excluded)
    pub fn matches(&self, record: &FilteredDataPoint) -> bool {
        if let Some(source) = &self.source {
            if record.source() != source {
                return false;
            }
        }
        if let Some(since) = self.since {
            if record.point.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if record.point.timestamp > until {
                return false;
            }
        }
        if let Some(min_score) = self.min_score {
            if record.coherence_score < min_score {
                return false;
            }
        }
        true
    }
}

/// Backend health report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageHealth {
    pub backend: String,
    pub connected: bool,
    pub records: u64,
    pub latency_ms: Option<u64>,
    pub message: Option<String>,
}

/// Storage backend for accepted data points
#[async_trait]
pub trait Storage: Send + Sync {
    /// Short backend name for logs and health output
    fn name(&self) -> &'static str;

    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    async fn store(&self, record: &FilteredDataPoint) -> Result<()>;

    /// Store several records; returns the number written
    async fn store_batch(&self, records: &[FilteredDataPoint]) -> Result<usize>;

    /// Matching records in timestamp order (oldest first)
    async fn query(&self, query: &StorageQuery) -> Result<Vec<FilteredDataPoint>>;

    async fn count(&self, query: &StorageQuery) -> Result<u64>;

    async fn get_health(&self) -> StorageHealth;
}
