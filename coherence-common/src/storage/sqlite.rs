//! SQLite storage adapter
//!
//! Accepted points are stored as JSON payload rows with the columns needed
//! for filtering (source, timestamp, score) broken out.

use super::{Storage, StorageHealth, StorageQuery};
use crate::model::FilteredDataPoint;
use crate::{Error, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// SQLite-backed storage using a sqlx connection pool
pub struct SqliteStorage {
    url: String,
    max_connections: u32,
    pool: RwLock<Option<SqlitePool>>,
}

impl SqliteStorage {
    /// * `url` - sqlx connection URL, e.g. `sqlite://data/points.db?mode=rwc` or `sqlite::memory:`
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        // every connection to an in-memory database is a separate database
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        Self {
            url,
            max_connections,
            pool: RwLock::new(None),
        }
    }

    async fn pool(&self) -> Result<SqlitePool> {
        self.pool
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::Storage("sqlite storage is not connected".to_string()))
    }

    fn where_clause(query: &StorageQuery) -> String {
        let mut conditions = Vec::new();
        if query.source.is_some() {
            conditions.push("source = ?");
        }
        if query.since.is_some() {
            conditions.push("timestamp_ms >= ?");
        }
        if query.until.is_some() {
            conditions.push("timestamp_ms <= ?");
        }
        if query.min_score.is_some() {
            conditions.push("score >= ?");
        }
        if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        }
    }
}

async fn create_points_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS filtered_points (
            id TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            timestamp_ms INTEGER NOT NULL,
            score REAL NOT NULL,
            payload TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_filtered_points_source_ts ON filtered_points(source, timestamp_ms)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

#[async_trait]
impl Storage for SqliteStorage {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn connect(&self) -> Result<()> {
        let mut guard = self.pool.write().await;
        if guard.is_some() {
            return Ok(());
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(self.max_connections)
            .connect(&self.url)
            .await?;
        create_points_table(&pool).await?;

        info!(url = %self.url, "SQLite storage connected");
        *guard = Some(pool);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(pool) = self.pool.write().await.take() {
            pool.close().await;
            info!("SQLite storage disconnected");
        }
        Ok(())
    }

    async fn store(&self, record: &FilteredDataPoint) -> Result<()> {
        self.store_batch(std::slice::from_ref(record)).await.map(|_| ())
    }

    async fn store_batch(&self, records: &[FilteredDataPoint]) -> Result<usize> {
        let pool = self.pool().await?;
        let mut tx = pool.begin().await?;

        for record in records {
            let payload = serde_json::to_string(record)?;
            sqlx::query(
                "INSERT OR REPLACE INTO filtered_points (id, source, timestamp_ms, score, payload) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(record.id())
            .bind(record.source())
            .bind(record.point.timestamp.timestamp_millis())
            .bind(record.coherence_score)
            .bind(payload)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(records.len())
    }

    async fn query(&self, query: &StorageQuery) -> Result<Vec<FilteredDataPoint>> {
        let pool = self.pool().await?;

        let mut sql = format!("SELECT payload FROM filtered_points{}", Self::where_clause(query));
        if query.limit.is_some() {
            sql.push_str(" ORDER BY timestamp_ms DESC, id DESC LIMIT ?");
        } else {
            sql.push_str(" ORDER BY timestamp_ms ASC, id ASC");
        }

        let mut q = sqlx::query_scalar::<_, String>(&sql);
        if let Some(source) = &query.source {
            q = q.bind(source.clone());
        }
        if let Some(since) = query.since {
            q = q.bind(since.timestamp_millis());
        }
        if let Some(until) = query.until {
            q = q.bind(until.timestamp_millis());
        }
        if let Some(min_score) = query.min_score {
            q = q.bind(min_score);
        }
        if let Some(limit) = query.limit {
            q = q.bind(limit as i64);
        }

        let payloads = q.fetch_all(&pool).await?;
        let mut records = payloads
            .iter()
            .map(|p| serde_json::from_str::<FilteredDataPoint>(p))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        if query.limit.is_some() {
            records.reverse();
        }
        Ok(records)
    }

    async fn count(&self, query: &StorageQuery) -> Result<u64> {
        let pool = self.pool().await?;
        let sql = format!("SELECT COUNT(*) FROM filtered_points{}", Self::where_clause(query));

        let mut q = sqlx::query_scalar::<_, i64>(&sql);
        if let Some(source) = &query.source {
            q = q.bind(source.clone());
        }
        if let Some(since) = query.since {
            q = q.bind(since.timestamp_millis());
        }
        if let Some(until) = query.until {
            q = q.bind(until.timestamp_millis());
        }
        if let Some(min_score) = query.min_score {
            q = q.bind(min_score);
        }

        let count = q.fetch_one(&pool).await?;
        Ok(count.max(0) as u64)
    }

    async fn get_health(&self) -> StorageHealth {
        let pool = match self.pool().await {
            Ok(pool) => pool,
            Err(e) => {
                return StorageHealth {
                    backend: self.name().to_string(),
                    connected: false,
                    records: 0,
                    latency_ms: None,
                    message: Some(e.to_string()),
                }
            }
        };

        let started = Instant::now();
        match sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM filtered_points")
            .fetch_one(&pool)
            .await
        {
            Ok(records) => StorageHealth {
                backend: self.name().to_string(),
                connected: true,
                records: records.max(0) as u64,
                latency_ms: Some(started.elapsed().as_millis() as u64),
                message: None,
            },
            Err(e) => {
                warn!(error = %e, "SQLite health check failed");
                StorageHealth {
                    backend: self.name().to_string(),
                    connected: false,
                    records: 0,
                    latency_ms: None,
                    message: Some(e.to_string()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CoherenceDimensions, DataPoint};
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn record(id: &str, source: &str, offset_secs: i64, score: f64) -> FilteredDataPoint {
        FilteredDataPoint {
            point: DataPoint::new(
                id,
                source,
                Utc::now() + Duration::seconds(offset_secs),
                json!({"text": format!("item {}", id)}),
            ),
            coherence_score: score,
            dimensions: CoherenceDimensions::new(0.5, 0.5, 0.5, 0.5),
            explanations: vec!["psi: complete".to_string()],
        }
    }

    #[tokio::test]
    async fn test_not_connected_is_storage_error() {
        let storage = SqliteStorage::new("sqlite::memory:");
        let result = storage.store(&record("a", "s", 0, 0.6)).await;
        assert!(matches!(result, Err(Error::Storage(_))));
        assert!(!storage.get_health().await.connected);
    }

    #[tokio::test]
    async fn test_store_query_count() {
        let storage = SqliteStorage::new("sqlite::memory:");
        storage.connect().await.unwrap();

        let written = storage
            .store_batch(&[
                record("a", "news", 10, 0.6),
                record("b", "news", 20, 0.9),
                record("c", "blog", 30, 0.7),
            ])
            .await
            .unwrap();
        assert_eq!(written, 3);

        let news = storage.query(&StorageQuery::for_source("news")).await.unwrap();
        assert_eq!(news.len(), 2);
        assert_eq!(news[0].id(), "a");
        assert_eq!(news[1].explanations, vec!["psi: complete".to_string()]);

        let latest = storage.query(&StorageQuery::default().with_limit(1)).await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].id(), "c");

        let high = StorageQuery {
            min_score: Some(0.65),
            ..Default::default()
        };
        assert_eq!(storage.count(&high).await.unwrap(), 2);

        let health = storage.get_health().await;
        assert!(health.connected);
        assert_eq!(health.records, 3);

        storage.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_restore_replaces_existing_id() {
        let storage = SqliteStorage::new("sqlite::memory:");
        storage.connect().await.unwrap();
        storage.store(&record("a", "news", 0, 0.6)).await.unwrap();
        storage.store(&record("a", "news", 0, 0.8)).await.unwrap();

        let all = storage.query(&StorageQuery::default()).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!((all[0].coherence_score - 0.8).abs() < 1e-9);
    }
}
