//! In-process storage adapter

use super::{Storage, StorageHealth, StorageQuery};
use crate::model::FilteredDataPoint;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// Keeps records in a map keyed by data point id
///
/// Re-storing an id replaces the previous record. Not durable; used as the
/// fallback backend and in tests.
#[derive(Default)]
pub struct MemoryStorage {
    records: RwLock<HashMap<String, FilteredDataPoint>>,
    connected: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Already-connected instance
    pub fn connected() -> Self {
        let storage = Self::default();
        storage.connected.store(true, Ordering::SeqCst);
        storage
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Storage("memory storage is not connected".to_string()))
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn store(&self, record: &FilteredDataPoint) -> Result<()> {
        self.ensure_connected()?;
        self.records
            .write()
            .await
            .insert(record.id().to_string(), record.clone());
        Ok(())
    }

    async fn store_batch(&self, records: &[FilteredDataPoint]) -> Result<usize> {
        self.ensure_connected()?;
        let mut map = self.records.write().await;
        for record in records {
            map.insert(record.id().to_string(), record.clone());
        }
        Ok(records.len())
    }

    async fn query(&self, query: &StorageQuery) -> Result<Vec<FilteredDataPoint>> {
        self.ensure_connected()?;
        let map = self.records.read().await;
        let mut matching: Vec<FilteredDataPoint> =
            map.values().filter(|r| query.matches(r)).cloned().collect();
        matching.sort_by(|a, b| {
            a.point
                .timestamp
                .cmp(&b.point.timestamp)
                .then_with(|| a.id().cmp(b.id()))
        });
        if let Some(limit) = query.limit {
            let skip = matching.len().saturating_sub(limit);
            matching.drain(..skip);
        }
        Ok(matching)
    }

    async fn count(&self, query: &StorageQuery) -> Result<u64> {
        self.ensure_connected()?;
        let map = self.records.read().await;
        Ok(map.values().filter(|r| query.matches(r)).count() as u64)
    }

    async fn get_health(&self) -> StorageHealth {
        let connected = self.connected.load(Ordering::SeqCst);
        StorageHealth {
            backend: self.name().to_string(),
            connected,
            records: self.records.read().await.len() as u64,
            latency_ms: Some(0),
            message: None,
        }
    }
}
