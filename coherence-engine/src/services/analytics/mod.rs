//! Analytics engine
//!
//! Runs over accepted points only:
//! - anomaly ensemble ([`anomaly`])
//! - per-source short-horizon forecasting ([`forecast`])
//! - k-means pattern clustering ([`clustering`])
//!
//! All state lives behind one mutex owned by [`AnalyticsEngine`]; callers
//! hold no references into it.

pub mod anomaly;
pub mod clustering;
pub mod forecast;
pub mod stats;

pub use anomaly::{AnomalyConfig, AnomalyDetector, AnomalyEnsemble, DetectionHistory, DetectorFamily, DetectorResult};
pub use clustering::{ClusteringConfig, ClusteringResult};
pub use forecast::{Forecast, ForecastAccuracy, ForecastConfig, ForecastPoint};

use chrono::{DateTime, Utc};
use coherence_common::events::Anomaly;
use coherence_common::FilteredDataPoint;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error, PartialEq)]
pub enum AnalyticsError {
    #[error("Invalid forecast horizon {requested} (max {max})")]
    InvalidHorizon { requested: usize, max: usize },

    #[error("Invalid analytics configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    #[serde(default)]
    pub anomaly: AnomalyConfig,
    #[serde(default)]
    pub forecast: ForecastConfig,
    #[serde(default)]
    pub clustering: ClusteringConfig,
    /// Seed for the isolation forest and k-means++ initialisation
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_seed() -> u64 {
    42
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            anomaly: AnomalyConfig::default(),
            forecast: ForecastConfig::default(),
            clustering: ClusteringConfig::default(),
            seed: default_seed(),
        }
    }
}

impl AnalyticsConfig {
    pub fn validate(&self) -> Result<(), AnalyticsError> {
        self.anomaly
            .validate()
            .and_then(|_| self.forecast.validate())
            .and_then(|_| self.clustering.validate())
            .map_err(AnalyticsError::InvalidConfig)
    }
}

/// Counters reported by [`AnalyticsEngine::stats`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsStats {
    pub history_len: usize,
    pub anomalies: usize,
    pub anomalies_total: u64,
    pub series: usize,
    pub last_clustering: Option<DateTime<Utc>>,
    pub clusters: usize,
}

struct AnalyticsState {
    history: VecDeque<FilteredDataPoint>,
    anomalies: VecDeque<Anomaly>,
    anomalies_total: u64,
    series: HashMap<String, VecDeque<(DateTime<Utc>, f64)>>,
    last_clustering: Option<ClusteringResult>,
    clustering_runs: u64,
}

pub struct AnalyticsEngine {
    config: AnalyticsConfig,
    ensemble: AnomalyEnsemble,
    state: Mutex<AnalyticsState>,
}

impl AnalyticsEngine {
    pub fn new(config: AnalyticsConfig) -> Result<Self, AnalyticsError> {
        config.validate()?;
        Ok(Self {
            ensemble: AnomalyEnsemble::new(&config.anomaly, config.seed),
            config,
            state: Mutex::new(AnalyticsState {
                history: VecDeque::new(),
                anomalies: VecDeque::new(),
                anomalies_total: 0,
                series: HashMap::new(),
                last_clustering: None,
                clustering_runs: 0,
            }),
        })
    }

    pub fn config(&self) -> &AnalyticsConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, AnalyticsState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Check `point` against prior history, then append it
    ///
    /// Returns the anomaly when the ensemble flags it; the anomaly is also
    /// kept in the capped anomaly log.
    pub fn observe(&self, point: &FilteredDataPoint) -> Option<Anomaly> {
        let mut state = self.lock();

        let history = DetectionHistory::from_points(state.history.iter());
        let anomaly = self.ensemble.evaluate(point, &history);

        if let Some(anomaly) = &anomaly {
            debug!(
                point_id = %point.id(),
                kind = anomaly.kind.as_str(),
                votes = anomaly.votes(),
                "Anomaly detected"
            );
            state.anomalies.push_back(anomaly.clone());
            state.anomalies_total += 1;
            while state.anomalies.len() > self.config.anomaly.max_anomalies {
                state.anomalies.pop_front();
            }
        }

        state.history.push_back(point.clone());
        while state.history.len() > self.config.anomaly.history_size {
            state.history.pop_front();
        }

        let capacity = self.config.forecast.series_capacity;
        let series = state.series.entry(point.source().to_string()).or_default();
        series.push_back((point.point.timestamp, point.coherence_score));
        while series.len() > capacity {
            series.pop_front();
        }

        anomaly
    }

    /// Forecast `horizon` steps of one source's in-memory series
    pub fn forecast(&self, source_id: &str, horizon: usize) -> Result<Forecast, AnalyticsError> {
        let series: Vec<(DateTime<Utc>, f64)> = self
            .lock()
            .series
            .get(source_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        self.forecast_series(source_id, &series, horizon)
    }

    /// Forecast an externally supplied series (e.g. rebuilt from storage)
    pub fn forecast_series(
        &self,
        source_id: &str,
        series: &[(DateTime<Utc>, f64)],
        horizon: usize,
    ) -> Result<Forecast, AnalyticsError> {
        let max = self.config.forecast.max_horizon;
        if horizon == 0 || horizon > max {
            return Err(AnalyticsError::InvalidHorizon {
                requested: horizon,
                max,
            });
        }
        let mut ordered = series.to_vec();
        ordered.sort_by_key(|(ts, _)| *ts);
        Ok(forecast::forecast_series(source_id, &ordered, horizon, &self.config.forecast))
    }

    /// Cluster recent accepted points; the result is also kept as the latest
    pub fn cluster(&self) -> ClusteringResult {
        let (points, run) = {
            let state = self.lock();
            let points: Vec<FilteredDataPoint> = state.history.iter().cloned().collect();
            (points, state.clustering_runs)
        };

        // vary the seed per run so repeated passes are not locked to one start
        let seed = self.config.seed.wrapping_add(run);
        let result = clustering::cluster_points(&points, &self.config.clustering, seed);
        info!(
            points = result.points,
            clusters = result.clusters.len(),
            iterations = result.iterations,
            "Pattern clustering complete"
        );

        let mut state = self.lock();
        state.clustering_runs += 1;
        state.last_clustering = Some(result.clone());
        result
    }

    pub fn last_clustering(&self) -> Option<ClusteringResult> {
        self.lock().last_clustering.clone()
    }

    /// Most recent anomalies, newest first
    pub fn anomalies(&self, limit: usize) -> Vec<Anomaly> {
        self.lock().anomalies.iter().rev().take(limit).cloned().collect()
    }

    pub fn stats(&self) -> AnalyticsStats {
        let state = self.lock();
        AnalyticsStats {
            history_len: state.history.len(),
            anomalies: state.anomalies.len(),
            anomalies_total: state.anomalies_total,
            series: state.series.len(),
            last_clustering: state.last_clustering.as_ref().map(|c| c.computed_at),
            clusters: state.last_clustering.as_ref().map(|c| c.clusters.len()).unwrap_or(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use coherence_common::{CoherenceDimensions, DataPoint};
    use serde_json::json;

    fn filtered(i: usize, source: &str, score: f64) -> FilteredDataPoint {
        let start = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        FilteredDataPoint {
            point: DataPoint::new(
                format!("{}-{}", source, i),
                source,
                start + ChronoDuration::minutes(i as i64),
                json!({"title": "t"}),
            ),
            coherence_score: score,
            dimensions: CoherenceDimensions::new(score, score, score, score),
            explanations: Vec::new(),
        }
    }

    fn small_config() -> AnalyticsConfig {
        let mut config = AnalyticsConfig::default();
        config.anomaly.history_size = 20;
        config.anomaly.max_anomalies = 2;
        config.forecast.series_capacity = 15;
        config
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = AnalyticsConfig::default();
        config.clustering.k = 0;
        assert!(matches!(
            AnalyticsEngine::new(config),
            Err(AnalyticsError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_observe_caps_history_and_series() {
        let engine = AnalyticsEngine::new(small_config()).unwrap();
        for i in 0..30 {
            engine.observe(&filtered(i, "a", 0.5));
        }
        engine.observe(&filtered(0, "b", 0.5));

        let stats = engine.stats();
        assert_eq!(stats.history_len, 20);
        assert_eq!(stats.series, 2);
        assert!(stats.last_clustering.is_none());
    }

    #[test]
    fn test_no_detection_before_min_history() {
        let engine = AnalyticsEngine::new(AnalyticsConfig::default()).unwrap();
        for i in 0..5 {
            engine.observe(&filtered(i, "a", 0.5));
        }
        assert!(engine.observe(&filtered(5, "a", 0.99)).is_none());
        assert_eq!(engine.stats().anomalies, 0);
    }

    #[test]
    fn test_forecast_horizon_validation() {
        let engine = AnalyticsEngine::new(AnalyticsConfig::default()).unwrap();
        assert_eq!(
            engine.forecast("a", 0).unwrap_err(),
            AnalyticsError::InvalidHorizon { requested: 0, max: 100 }
        );
        assert!(engine.forecast("a", 101).is_err());

        // unknown source is neutral, not an error
        let forecast = engine.forecast("unknown", 3).unwrap();
        assert_eq!(forecast.points.len(), 3);
        assert_eq!(forecast.confidence, 0.0);
    }

    #[test]
    fn test_forecast_uses_series() {
        let engine = AnalyticsEngine::new(AnalyticsConfig::default()).unwrap();
        for i in 0..40 {
            engine.observe(&filtered(i, "a", 0.4 + 0.005 * i as f64));
        }
        let forecast = engine.forecast("a", 4).unwrap();
        assert_eq!(forecast.points.len(), 4);
        assert!(forecast.confidence > 0.0);
        assert!(forecast.points[0].value > 0.5);
    }

    #[test]
    fn test_cluster_records_last_result() {
        let engine = AnalyticsEngine::new(AnalyticsConfig::default()).unwrap();
        for i in 0..20 {
            engine.observe(&filtered(i, "a", if i % 2 == 0 { 0.2 } else { 0.8 }));
        }
        let result = engine.cluster();
        assert!(!result.clusters.is_empty());
        assert_eq!(result.clusters.iter().map(|c| c.size).sum::<usize>(), 20);

        let stats = engine.stats();
        assert_eq!(stats.clusters, result.clusters.len());
        assert!(stats.last_clustering.is_some());
    }
}
