//! Anomaly ensemble, forecasting and clustering through the analytics engine

mod helpers;

use chrono::Duration as ChronoDuration;
use coherence_common::events::AnomalyKind;
use coherence_common::CoherenceDimensions;
use coherence_engine::services::analytics::{AnalyticsConfig, AnalyticsEngine, AnalyticsError};
use helpers::{base_time, filtered_point, normal_scores};

#[test]
fn test_outlier_after_stable_history_is_flagged() {
    let engine = AnalyticsEngine::new(AnalyticsConfig::default()).unwrap();
    for (i, score) in normal_scores(50, 0.5, 0.05, 11).into_iter().enumerate() {
        engine.observe(&filtered_point(i, "news", score));
    }

    let anomaly = engine
        .observe(&filtered_point(50, "news", 0.99))
        .expect("outlier should be flagged");
    assert!(anomaly.votes() >= 3, "flagged by {:?}", anomaly.flagged_by);
    assert!(anomaly.flagged_by.iter().any(|d| d == "zscore"));
    assert!((0.0..=1.0).contains(&anomaly.ensemble_score));
    assert_eq!(anomaly.point.id(), "news:50");

    let recent = engine.anomalies(10);
    assert_eq!(recent.first().map(|a| a.id), Some(anomaly.id));
    assert!(engine.stats().anomalies_total >= 1);
}

#[test]
fn test_in_distribution_point_is_not_flagged() {
    let engine = AnalyticsEngine::new(AnalyticsConfig::default()).unwrap();
    for (i, score) in normal_scores(60, 0.5, 0.05, 5).into_iter().enumerate() {
        engine.observe(&filtered_point(i, "news", score));
    }
    assert!(engine.observe(&filtered_point(60, "news", 0.5)).is_none());
}

#[test]
fn test_statistical_only_outlier_is_point_kind() {
    let mut config = AnalyticsConfig::default();
    // keep the temporal and density families quiet
    config.anomaly.seasonal_min_samples = 10_000;
    config.anomaly.knn_window = 1;
    let engine = AnalyticsEngine::new(config).unwrap();

    for (i, score) in normal_scores(40, 0.4, 0.03, 3).into_iter().enumerate() {
        engine.observe(&filtered_point(i, "feed", score));
    }
    let anomaly = engine.observe(&filtered_point(40, "feed", 0.95)).unwrap();
    assert_eq!(anomaly.kind, AnomalyKind::Point);
}

#[test]
fn test_forecast_tracks_seasonal_series() {
    let engine = AnalyticsEngine::new(AnalyticsConfig::default()).unwrap();
    let series: Vec<_> = (0..120)
        .map(|i| {
            let phase = (i % 24) as f64 / 24.0 * std::f64::consts::TAU;
            (base_time() + ChronoDuration::minutes(i), 0.5 + 0.2 * phase.sin())
        })
        .collect();

    let forecast = engine.forecast_series("sine", &series, 24).unwrap();
    assert_eq!(forecast.points.len(), 24);
    assert!(forecast.confidence > 0.0 && forecast.confidence <= 1.0);
    assert!(forecast.accuracy.mae < 0.1, "mae {}", forecast.accuracy.mae);
    assert!(!forecast.model_weights.is_empty());

    let last = series.last().unwrap().0;
    assert_eq!(forecast.points[0].timestamp, last + ChronoDuration::minutes(1));
    for point in &forecast.points {
        assert!(point.lower <= point.value && point.value <= point.upper);
        assert!((0.0..=1.0).contains(&point.lower) && (0.0..=1.0).contains(&point.upper));
    }

    assert!(matches!(
        engine.forecast_series("sine", &series, 0),
        Err(AnalyticsError::InvalidHorizon { requested: 0, .. })
    ));
}

#[test]
fn test_forecast_accepts_unsorted_series() {
    let engine = AnalyticsEngine::new(AnalyticsConfig::default()).unwrap();
    let mut series: Vec<_> = (0..40)
        .map(|i| (base_time() + ChronoDuration::minutes(i), 0.6))
        .collect();
    series.reverse();

    let forecast = engine.forecast_series("flat", &series, 5).unwrap();
    for point in &forecast.points {
        assert!((point.value - 0.6).abs() < 0.05);
    }
}

#[test]
fn test_clustering_separates_two_groups() {
    let mut config = AnalyticsConfig::default();
    config.clustering.k = 2;
    let engine = AnalyticsEngine::new(config).unwrap();

    for i in 0..30 {
        let mut point = filtered_point(i, "mixed", 0.5);
        point.dimensions = if i % 2 == 0 {
            CoherenceDimensions::new(0.9, 0.1, 0.9, 0.1)
        } else {
            CoherenceDimensions::new(0.1, 0.9, 0.1, 0.9)
        };
        engine.observe(&point);
    }

    let result = engine.cluster();
    assert_eq!(result.points, 30);
    assert_eq!(result.clusters.len(), 2);
    let mut sizes: Vec<usize> = result.clusters.iter().map(|c| c.size).collect();
    sizes.sort();
    assert_eq!(sizes, vec![15, 15]);
    assert!(engine.last_clustering().is_some());
}
