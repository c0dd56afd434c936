//! Pipeline counters and the health snapshot
//!
//! Counters are plain atomics so health reads never contend with ingestion.

use crate::services::collector::SourceCounts;
use crate::utils::{BatchStats, CacheStats};
use coherence_common::storage::StorageHealth;
use coherence_common::Weights;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;

/// Scores are accumulated in millionths
const SCORE_SCALE: f64 = 1_000_000.0;

#[derive(Debug)]
pub struct PipelineCounters {
    processed: AtomicU64,
    filtered: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
    anomalies: AtomicU64,
    score_sum: AtomicU64,
    started: Instant,
}

impl Default for PipelineCounters {
    fn default() -> Self {
        Self {
            processed: AtomicU64::new(0),
            filtered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            anomalies: AtomicU64::new(0),
            score_sum: AtomicU64::new(0),
            started: Instant::now(),
        }
    }
}

impl PipelineCounters {
    pub fn record_accepted(&self, score: f64) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.filtered.fetch_add(1, Ordering::Relaxed);
        self.score_sum
            .fetch_add((score.clamp(0.0, 1.0) * SCORE_SCALE).round() as u64, Ordering::Relaxed);
    }

    /// Below threshold, rejected by a pre-processor, or invalid
    pub fn record_dropped(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_anomaly(&self) {
        self.anomalies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> PipelineStats {
        let processed = self.processed.load(Ordering::Relaxed);
        let filtered = self.filtered.load(Ordering::Relaxed);
        let dropped = self.dropped.load(Ordering::Relaxed);
        let score_sum = self.score_sum.load(Ordering::Relaxed) as f64 / SCORE_SCALE;
        let elapsed = self.started.elapsed().as_secs_f64();

        PipelineStats {
            processed,
            filtered,
            dropped,
            errors: self.errors.load(Ordering::Relaxed),
            anomalies: self.anomalies.load(Ordering::Relaxed),
            filter_rate: if processed == 0 {
                0.0
            } else {
                filtered as f64 / processed as f64
            },
            average_coherence: if filtered == 0 { 0.0 } else { score_sum / filtered as f64 },
            processing_rate: if elapsed > 0.0 { processed as f64 / elapsed } else { 0.0 },
        }
    }
}

/// Point-in-time counter values
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub processed: u64,
    pub filtered: u64,
    pub dropped: u64,
    pub errors: u64,
    pub anomalies: u64,
    /// filtered / processed
    pub filter_rate: f64,
    /// Mean score of accepted points
    pub average_coherence: f64,
    /// Points per second since the engine was created
    pub processing_rate: f64,
}

/// Engine health as reported by `Orchestrator::health`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub running: bool,
    #[serde(flatten)]
    pub pipeline: PipelineStats,
    pub sources: SourceCounts,
    pub weights: Weights,
    pub storage: StorageHealth,
    pub cache: CacheStats,
    pub batch: BatchStats,
    pub open_circuits: usize,
}

impl HealthSnapshot {
    pub fn display_string(&self) -> String {
        format!(
            "{} processed, {} filtered ({:.1}%), {} dropped, {} errors, {}/{} sources active",
            self.pipeline.processed,
            self.pipeline.filtered,
            self.pipeline.filter_rate * 100.0,
            self.pipeline.dropped,
            self.pipeline.errors,
            self.sources.active,
            self.sources.total
        )
    }
}
