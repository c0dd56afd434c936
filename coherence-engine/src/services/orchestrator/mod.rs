//! Ingest pipeline orchestrator
//!
//! # Data flow
//! Collector → pipeline channel → Scorer → (Cache, Batch → Storage,
//! Analytics, Optimizer) → events
//!
//! # Background tasks (while running)
//! - pipeline: drains the collector channel through [`Orchestrator::ingest`]
//! - clustering: periodic k-means pass, labels scorer patterns
//! - optimization: periodic weight optimization when enough feedback exists
//! - cache sweeper
//!
//! All components are owned here and reached through an explicit
//! [`EngineContext`]; nothing is global.

mod statistics;

pub use statistics::{HealthSnapshot, PipelineCounters, PipelineStats};

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::services::analytics::{AnalyticsEngine, ClusteringResult, Forecast};
use crate::services::collector::{Collector, SourceDescriptor};
use crate::services::optimizer::{Feedback, OptimizationOutcome, OptimizerError, WeightOptimizer};
use crate::services::scorer::{Pattern, Scorer};
use crate::utils::{BatchError, BatchProcessor, BatchSink, CacheManager, ResilienceError, ResilienceRegistry};
use async_trait::async_trait;
use chrono::Utc;
use coherence_common::events::{Anomaly, CoherenceEvent, EventBus};
use coherence_common::storage::{MemoryStorage, Storage, StorageQuery};
use coherence_common::{DataPoint, FilteredDataPoint};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Orchestrator tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Continue on `MemoryStorage` when the configured backend cannot connect
    #[serde(default = "default_true")]
    pub allow_memory_fallback: bool,
    /// Treat anomalies as negative relevance feedback
    #[serde(default)]
    pub implicit_anomaly_feedback: bool,
    #[serde(default = "default_implicit_feedback_confidence")]
    pub implicit_feedback_confidence: f64,
    #[serde(default = "default_cluster_interval_secs")]
    pub cluster_interval_secs: u64,
    #[serde(default = "default_optimize_interval_secs")]
    pub optimize_interval_secs: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// TTL of accepted points in the cache (cache default when unset)
    #[serde(default)]
    pub cache_ttl_ms: Option<u64>,
}

fn default_true() -> bool {
    true
}
fn default_implicit_feedback_confidence() -> f64 {
    0.5
}
fn default_cluster_interval_secs() -> u64 {
    300
}
fn default_optimize_interval_secs() -> u64 {
    600
}
fn default_event_capacity() -> usize {
    1_000
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            allow_memory_fallback: default_true(),
            implicit_anomaly_feedback: false,
            implicit_feedback_confidence: default_implicit_feedback_confidence(),
            cluster_interval_secs: default_cluster_interval_secs(),
            optimize_interval_secs: default_optimize_interval_secs(),
            event_capacity: default_event_capacity(),
            cache_ttl_ms: None,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.cluster_interval_secs == 0 || self.optimize_interval_secs == 0 {
            return Err("pipeline intervals must be positive".to_string());
        }
        if self.event_capacity == 0 {
            return Err("pipeline.event_capacity must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.implicit_feedback_confidence) {
            return Err("pipeline.implicit_feedback_confidence must be in [0, 1]".to_string());
        }
        if self.cache_ttl_ms == Some(0) {
            return Err("pipeline.cache_ttl_ms must be positive".to_string());
        }
        Ok(())
    }
}

/// Swappable storage backend (replaced by the memory fallback on start)
#[derive(Clone)]
pub struct StorageHandle {
    inner: Arc<RwLock<Arc<dyn Storage>>>,
}

impl StorageHandle {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(storage)),
        }
    }

    pub fn current(&self) -> Arc<dyn Storage> {
        Arc::clone(&self.inner.read().unwrap_or_else(|e| e.into_inner()))
    }

    fn replace(&self, storage: Arc<dyn Storage>) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = storage;
    }
}

/// Shared handles passed to components
#[derive(Clone)]
pub struct EngineContext {
    pub config: Arc<EngineConfig>,
    pub event_bus: EventBus,
    pub storage: StorageHandle,
    pub resilience: Arc<ResilienceRegistry>,
}

/// Batch sink writing through the resilience wrapper into storage
pub struct StorageSink {
    storage: StorageHandle,
    resilience: Arc<ResilienceRegistry>,
}

impl StorageSink {
    pub fn new(storage: StorageHandle, resilience: Arc<ResilienceRegistry>) -> Self {
        Self { storage, resilience }
    }
}

#[async_trait]
impl BatchSink<FilteredDataPoint> for StorageSink {
    async fn process_batch(&self, batch: &[FilteredDataPoint]) -> coherence_common::Result<()> {
        let storage = self.storage.current();
        self.resilience
            .execute("storage:store_batch", || storage.store_batch(batch))
            .await
            .map(|written| debug!(written, "Batch stored"))
            .map_err(|e| match e {
                ResilienceError::CircuitOpen { operation } => {
                    coherence_common::Error::Storage(format!("circuit open for {}", operation))
                }
                ResilienceError::Failed(err) => err,
            })
    }
}

fn storage_error(e: ResilienceError<coherence_common::Error>) -> EngineError {
    match e {
        ResilienceError::CircuitOpen { operation } => {
            EngineError::StorageUnavailable(format!("circuit open for {}", operation))
        }
        ResilienceError::Failed(err) => EngineError::Common(err),
    }
}

struct RunState {
    token: CancellationToken,
    tasks: TaskTracker,
    sweeper: JoinHandle<()>,
}

/// Owns every component and the background tasks
pub struct Orchestrator {
    context: EngineContext,
    collector: Collector,
    scorer: Scorer,
    analytics: AnalyticsEngine,
    optimizer: WeightOptimizer,
    cache: Arc<CacheManager<FilteredDataPoint>>,
    batch: Arc<BatchProcessor<FilteredDataPoint>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<DataPoint>>>,
    counters: PipelineCounters,
    running: Mutex<Option<RunState>>,
}

impl Orchestrator {
    /// Build every component from `config`; nothing runs until [`start`](Self::start)
    pub fn new(config: EngineConfig, storage: Arc<dyn Storage>) -> EngineResult<Arc<Self>> {
        config.validate()?;

        let event_bus = EventBus::new(config.pipeline.event_capacity);
        let resilience = Arc::new(
            ResilienceRegistry::new(config.resilience.clone()).with_event_bus(event_bus.clone()),
        );
        let storage = StorageHandle::new(storage);

        let (tx, rx) = mpsc::channel(config.collector.channel_capacity);
        let collector = Collector::new(
            config.collector.clone(),
            Arc::clone(&resilience),
            event_bus.clone(),
            tx,
        )?;
        for source in &config.sources {
            collector.add_source(source.clone())?;
        }

        let scorer = Scorer::new(config.scorer.clone())?;
        let analytics = AnalyticsEngine::new(config.analytics.clone())?;
        let optimizer = WeightOptimizer::new(config.optimizer.clone())?;
        let cache = Arc::new(CacheManager::new(config.cache.clone()));
        let batch = BatchProcessor::with_event_bus(
            config.batch.clone(),
            Arc::new(StorageSink::new(storage.clone(), Arc::clone(&resilience))),
            event_bus.clone(),
        );

        Ok(Arc::new(Self {
            context: EngineContext {
                config: Arc::new(config),
                event_bus,
                storage,
                resilience,
            },
            collector,
            scorer,
            analytics,
            optimizer,
            cache,
            batch,
            receiver: Arc::new(tokio::sync::Mutex::new(rx)),
            counters: PipelineCounters::default(),
            running: Mutex::new(None),
        }))
    }

    pub fn context(&self) -> &EngineContext {
        &self.context
    }

    fn running(&self) -> MutexGuard<'_, Option<RunState>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    /// Connect storage and start collection plus background tasks; idempotent
    pub async fn start(self: &Arc<Self>) -> EngineResult<()> {
        if self.is_running() {
            debug!("Orchestrator already running");
            return Ok(());
        }

        self.connect_storage().await?;

        let token = CancellationToken::new();
        let tasks = TaskTracker::new();
        let sweeper = self.cache.start_sweeper();

        // tasks hold weak handles so dropping the last user handle tears down
        tasks.spawn(Self::run_pipeline(
            Arc::downgrade(self),
            Arc::clone(&self.receiver),
            token.clone(),
        ));

        let pipeline = &self.context.config.pipeline;
        let this = Arc::downgrade(self);
        tasks.spawn(periodic(
            token.clone(),
            Duration::from_secs(pipeline.cluster_interval_secs),
            move || {
                if let Some(this) = this.upgrade() {
                    this.run_clustering();
                }
            },
        ));

        let this = Arc::downgrade(self);
        tasks.spawn(periodic(
            token.clone(),
            Duration::from_secs(pipeline.optimize_interval_secs),
            move || {
                let Some(this) = this.upgrade() else {
                    return;
                };
                match this.optimize_now() {
                    Ok(_) | Err(EngineError::Optimizer(OptimizerError::InsufficientFeedback { .. })) => {}
                    Err(e) => warn!(error = %e, "Scheduled weight optimization failed"),
                }
            },
        ));

        self.collector.start();

        let mut running = self.running();
        if running.is_some() {
            // lost a concurrent start; the winner keeps its tasks
            token.cancel();
            sweeper.abort();
            return Ok(());
        }
        *running = Some(RunState {
            token,
            tasks,
            sweeper,
        });
        info!(sources = self.collector.source_ids().len(), "Orchestrator started");
        Ok(())
    }

    async fn connect_storage(&self) -> EngineResult<()> {
        let storage = self.context.storage.current();
        let result = self
            .context
            .resilience
            .execute("storage:connect", || storage.connect())
            .await;

        match result {
            Ok(()) => {
                info!(backend = storage.name(), "Storage connected");
                Ok(())
            }
            Err(e) if self.context.config.pipeline.allow_memory_fallback => {
                warn!(backend = storage.name(), error = %e, "Storage unavailable, falling back to memory");
                let fallback: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
                fallback.connect().await?;
                self.context.storage.replace(fallback);
                Ok(())
            }
            Err(e) => {
                error!(backend = storage.name(), error = %e, "Storage unavailable");
                Err(EngineError::StorageUnavailable(e.to_string()))
            }
        }
    }

    async fn run_pipeline(
        engine: Weak<Self>,
        receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<DataPoint>>>,
        token: CancellationToken,
    ) {
        let mut receiver = receiver.lock().await;
        loop {
            let point = tokio::select! {
                _ = token.cancelled() => break,
                point = receiver.recv() => match point {
                    Some(point) => point,
                    None => break,
                },
            };
            let Some(engine) = engine.upgrade() else {
                break;
            };
            if let Err(e) = engine.ingest(point).await {
                debug!(error = %e, "Point dropped");
            }
        }
        debug!("Pipeline task exiting");
    }

    /// Stop background work, flush pending writes and disconnect storage
    ///
    /// Safe to call at any time, including when not running.
    pub async fn stop(&self) {
        let state = self.running().take();
        self.collector.stop();

        let Some(state) = state else {
            return;
        };
        state.token.cancel();
        state.sweeper.abort();
        state.tasks.close();
        state.tasks.wait().await;

        match self.batch.flush().await {
            Ok(written) => debug!(written, "Final batch flush complete"),
            Err(e) => error!(error = %e, queued = self.batch.queued(), "Final batch flush failed"),
        }
        self.cache.clear();

        let storage = self.context.storage.current();
        if let Err(e) = storage.disconnect().await {
            warn!(backend = storage.name(), error = %e, "Storage disconnect failed");
        }
        info!("Orchestrator stopped");
    }

    /// Score one point and fan it out to the downstream components
    ///
    /// Returns the filtered point when it cleared the threshold. Invalid or
    /// rejected points count as dropped.
    pub async fn ingest(&self, point: DataPoint) -> EngineResult<Option<FilteredDataPoint>> {
        let filtered = match self.scorer.filter(&point) {
            Ok(Some(filtered)) => filtered,
            Ok(None) => {
                self.counters.record_dropped();
                return Ok(None);
            }
            Err(e) => {
                self.counters.record_dropped();
                self.counters.record_error();
                return Err(e.into());
            }
        };
        self.counters.record_accepted(filtered.coherence_score);

        let ttl = self
            .context
            .config
            .pipeline
            .cache_ttl_ms
            .map(Duration::from_millis);
        if let Err(e) = self.cache.set(filtered.id(), filtered.clone(), ttl) {
            debug!(point_id = %filtered.id(), error = %e, "Cache rejected point");
        }

        match self.batch.add(filtered.clone()) {
            Ok(()) => {}
            Err(BatchError::QueueFull { queued, capacity, .. }) => {
                self.counters.record_error();
                warn!(point_id = %filtered.id(), queued, capacity, "Storage queue full, point not persisted");
            }
            Err(e) => {
                self.counters.record_error();
                warn!(point_id = %filtered.id(), error = %e, "Point not queued for storage");
            }
        }

        self.optimizer.observe(&filtered);
        if let Some(anomaly) = self.analytics.observe(&filtered) {
            self.counters.record_anomaly();
            let pipeline = &self.context.config.pipeline;
            if pipeline.implicit_anomaly_feedback {
                let feedback =
                    Feedback::new(filtered.id(), false, pipeline.implicit_feedback_confidence);
                if let Err(e) = self.optimizer.record_feedback(feedback) {
                    debug!(error = %e, "Implicit feedback rejected");
                }
            }
            self.context.event_bus.emit_lossy(CoherenceEvent::AnomalyDetected {
                anomaly: Box::new(anomaly),
            });
        }

        self.context.event_bus.emit_lossy(CoherenceEvent::FilteredData {
            point: filtered.clone(),
        });
        Ok(Some(filtered))
    }

    /// Score without mutating any state
    pub fn evaluate(&self, point: &DataPoint) -> EngineResult<crate::services::scorer::Evaluation> {
        Ok(self.scorer.evaluate(point)?)
    }

    /// Relevance feedback on an accepted point; `Ok(false)` for unknown ids
    pub fn record_feedback(&self, feedback: Feedback) -> EngineResult<bool> {
        Ok(self.optimizer.record_feedback(feedback)?)
    }

    /// Run the weight optimizer now against the scorer's active combination
    /// mode; applied weights go straight to the scorer
    pub fn optimize_now(&self) -> EngineResult<OptimizationOutcome> {
        let previous = self.scorer.weights();
        let outcome = self
            .optimizer
            .optimize_with(previous, self.scorer.score_function())?;
        if outcome.applied {
            let weights = self.scorer.set_weights(outcome.weights)?;
            info!(
                psi = weights.psi,
                rho = weights.rho,
                q = weights.q,
                f = weights.f,
                improvement = outcome.improvement,
                "Scorer weights updated"
            );
            self.context.event_bus.emit_lossy(CoherenceEvent::WeightsUpdated {
                previous,
                weights,
                improvement: outcome.improvement,
                confidence: outcome.confidence,
                timestamp: Utc::now(),
            });
        }
        Ok(outcome)
    }

    /// Cluster recent accepted points and label scorer patterns
    pub fn run_clustering(&self) -> ClusteringResult {
        let result = self.analytics.cluster();
        let labelled = self.scorer.label_patterns(&result.labels);
        debug!(labelled, "Patterns labelled with clusters");
        self.context.event_bus.emit_lossy(CoherenceEvent::ClustersUpdated {
            clusters: result.clusters.clone(),
            timestamp: result.computed_at,
        });
        result
    }

    /// Forecast from the in-memory per-source series
    pub fn forecast(&self, source_id: &str, horizon: usize) -> EngineResult<Forecast> {
        Ok(self.analytics.forecast(source_id, horizon)?)
    }

    /// Forecast from a series rebuilt out of stored points; storage is only
    /// connected while running
    pub async fn forecast_from_storage(&self, source_id: &str, horizon: usize) -> EngineResult<Forecast> {
        if !self.is_running() {
            return Err(EngineError::NotRunning);
        }
        let storage = self.context.storage.current();
        let query = StorageQuery::for_source(source_id)
            .with_limit(self.context.config.analytics.forecast.series_capacity);
        let records = self
            .context
            .resilience
            .execute("storage:query", || storage.query(&query))
            .await
            .map_err(storage_error)?;

        let series: Vec<_> = records
            .iter()
            .map(|r| (r.point.timestamp, r.coherence_score))
            .collect();
        Ok(self.analytics.forecast_series(source_id, &series, horizon)?)
    }

    /// Most recent anomalies, newest first
    pub fn anomalies(&self, limit: usize) -> Vec<Anomaly> {
        self.analytics.anomalies(limit)
    }

    pub fn patterns(&self) -> Vec<Pattern> {
        self.scorer.patterns()
    }

    /// Accepted point from the cache, if still live
    pub fn cached(&self, point_id: &str) -> Option<FilteredDataPoint> {
        self.cache.get(point_id)
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<CoherenceEvent> {
        self.context.event_bus.subscribe()
    }

    pub fn add_source(&self, descriptor: SourceDescriptor) -> EngineResult<()> {
        Ok(self.collector.add_source(descriptor)?)
    }

    pub fn remove_source(&self, source_id: &str) -> EngineResult<()> {
        Ok(self.collector.remove_source(source_id)?)
    }

    pub fn stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }

    /// Point-in-time health; reads counters and asks storage for its status
    pub async fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            running: self.is_running(),
            pipeline: self.counters.snapshot(),
            sources: self.collector.source_counts(),
            weights: self.scorer.weights(),
            storage: self.context.storage.current().get_health().await,
            cache: self.cache.stats(),
            batch: self.batch.stats(),
            open_circuits: self.context.resilience.open_count(),
        }
    }
}

/// Dropping the last handle cancels background work without flushing;
/// call [`Orchestrator::stop`] first to persist queued points.
impl Drop for Orchestrator {
    fn drop(&mut self) {
        if let Some(state) = self.running().take() {
            state.token.cancel();
            state.sweeper.abort();
        }
        self.cache.destroy();
        self.batch.destroy();
    }
}

/// Run `tick` every `period` until cancelled; the immediate first tick is skipped
async fn periodic<F>(token: CancellationToken, period: Duration, mut tick: F)
where
    F: FnMut() + Send + 'static,
{
    let mut timer = tokio::time::interval(period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    timer.tick().await;
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = timer.tick() => tick(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use coherence_common::storage::StorageHealth;
    use serde_json::json;

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.scorer.sensitivity = 0.3;
        config.batch.batch_size = 10;
        config.resilience.max_attempts = 1;
        config
    }

    fn point(i: usize) -> DataPoint {
        DataPoint::new(
            format!("item-{}", i),
            "news",
            Utc::now(),
            json!({
                "id": i,
                "title": format!("Community update {}", i),
                "body": "We must help and protect our community together, with hope and trust for everyone",
                "author": "ana",
                "url": "http://example.com/update",
                "created": 1_700_000_000,
                "likes": 40,
            }),
        )
    }

    struct DownStorage;

    #[async_trait]
    impl Storage for DownStorage {
        fn name(&self) -> &'static str {
            "down"
        }
        async fn connect(&self) -> coherence_common::Result<()> {
            Err(coherence_common::Error::Config("unreachable".into()))
        }
        async fn disconnect(&self) -> coherence_common::Result<()> {
            Ok(())
        }
        async fn store(&self, _record: &FilteredDataPoint) -> coherence_common::Result<()> {
            Err(coherence_common::Error::Config("unreachable".into()))
        }
        async fn store_batch(&self, _records: &[FilteredDataPoint]) -> coherence_common::Result<usize> {
            Err(coherence_common::Error::Config("unreachable".into()))
        }
        async fn query(&self, _query: &StorageQuery) -> coherence_common::Result<Vec<FilteredDataPoint>> {
            Ok(Vec::new())
        }
        async fn count(&self, _query: &StorageQuery) -> coherence_common::Result<u64> {
            Ok(0)
        }
        async fn get_health(&self) -> StorageHealth {
            StorageHealth {
                backend: "down".into(),
                connected: false,
                records: 0,
                latency_ms: None,
                message: None,
            }
        }
    }

    #[tokio::test]
    async fn test_ingest_counts_balance() {
        let engine = Orchestrator::new(config(), Arc::new(MemoryStorage::new())).unwrap();
        for i in 0..20 {
            let _ = engine.ingest(point(i)).await;
        }
        let _ = engine.ingest(DataPoint::new("empty", "news", Utc::now(), json!(null))).await;

        let stats = engine.stats();
        assert_eq!(stats.processed, 21);
        assert_eq!(stats.filtered + stats.dropped, stats.processed);
        assert!(stats.dropped >= 1);
    }

    #[tokio::test]
    async fn test_accepted_points_reach_cache_and_storage() {
        let storage = Arc::new(MemoryStorage::new());
        let engine = Orchestrator::new(config(), storage.clone()).unwrap();
        engine.start().await.unwrap();

        let accepted = engine.ingest(point(1)).await.unwrap().expect("accepted");
        assert!(engine.cached(accepted.id()).is_some());

        engine.stop().await;
        // stop disconnects the backend
        storage.connect().await.unwrap();
        assert_eq!(storage.count(&StorageQuery::default()).await.unwrap(), 1);
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_is_safe() {
        let engine = Orchestrator::new(config(), Arc::new(MemoryStorage::new())).unwrap();
        engine.stop().await;
        engine.start().await.unwrap();
        engine.start().await.unwrap();
        assert!(engine.is_running());
        engine.stop().await;
        engine.stop().await;
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_storage_fallback() {
        let engine = Orchestrator::new(config(), Arc::new(DownStorage)).unwrap();
        engine.start().await.unwrap();
        assert_eq!(engine.context().storage.current().name(), "memory");
        engine.stop().await;

        let mut strict = config();
        strict.pipeline.allow_memory_fallback = false;
        let engine = Orchestrator::new(strict, Arc::new(DownStorage)).unwrap();
        assert!(matches!(
            engine.start().await,
            Err(EngineError::StorageUnavailable(_))
        ));
        assert!(!engine.is_running());
    }

    #[tokio::test]
    async fn test_unknown_feedback_is_noop() {
        let engine = Orchestrator::new(config(), Arc::new(MemoryStorage::new())).unwrap();
        assert!(!engine.record_feedback(Feedback::new("nope", true, 1.0)).unwrap());
        assert!(matches!(
            engine.optimize_now(),
            Err(EngineError::Optimizer(OptimizerError::InsufficientFeedback { .. }))
        ));
    }

    #[tokio::test]
    async fn test_health_snapshot() {
        let engine = Orchestrator::new(config(), Arc::new(MemoryStorage::new())).unwrap();
        engine.start().await.unwrap();
        let _ = engine.ingest(point(1)).await;

        let health = engine.health().await;
        assert!(health.running);
        assert_eq!(health.pipeline.processed, 1);
        assert!((health.weights.sum() - 1.0).abs() < 1e-9);
        assert!(health.storage.connected);
        engine.stop().await;
    }
}
