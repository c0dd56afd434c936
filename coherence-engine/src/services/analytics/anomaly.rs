//! Anomaly detection ensemble
//!
//! Every accepted point is checked by independent detectors against the
//! history of previously accepted points. Each detector that has enough data
//! returns a normalized score in [0, 1] and a vote; the point is anomalous
//! when at least `min_votes` detectors vote.
//!
//! Classification follows the detector families that voted:
//! - any temporal detector ⇒ contextual
//! - otherwise any density or pattern detector ⇒ collective
//! - otherwise (statistical only) ⇒ point

use super::stats::{knn_mean_distance, mad, mean, median, quantile, std_dev};
use chrono::{Timelike, Utc};
use coherence_common::events::{Anomaly, AnomalyKind};
use coherence_common::FilteredDataPoint;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Anomaly ensemble tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyConfig {
    /// Detectors that must agree
    #[serde(default = "default_min_votes")]
    pub min_votes: usize,
    /// Accepted points required before any detection runs
    #[serde(default = "default_min_history")]
    pub min_history: usize,
    #[serde(default = "default_history_size")]
    pub history_size: usize,
    #[serde(default = "default_max_anomalies")]
    pub max_anomalies: usize,
    #[serde(default = "default_zscore_threshold")]
    pub zscore_threshold: f64,
    #[serde(default = "default_iqr_multiplier")]
    pub iqr_multiplier: f64,
    #[serde(default = "default_mad_threshold")]
    pub mad_threshold: f64,
    #[serde(default = "default_isolation_min_samples")]
    pub isolation_min_samples: usize,
    #[serde(default = "default_isolation_trees")]
    pub isolation_trees: usize,
    #[serde(default = "default_isolation_sample_size")]
    pub isolation_sample_size: usize,
    #[serde(default = "default_isolation_threshold")]
    pub isolation_threshold: f64,
    #[serde(default = "default_knn_k")]
    pub knn_k: usize,
    /// Most recent points considered by the density detector
    #[serde(default = "default_knn_window")]
    pub knn_window: usize,
    #[serde(default = "default_density_ratio_threshold")]
    pub density_ratio_threshold: f64,
    #[serde(default = "default_seasonal_min_samples")]
    pub seasonal_min_samples: usize,
    #[serde(default = "default_imbalance_threshold")]
    pub imbalance_threshold: f64,
}

fn default_min_votes() -> usize {
    3
}
fn default_min_history() -> usize {
    10
}
fn default_history_size() -> usize {
    1_000
}
fn default_max_anomalies() -> usize {
    1_000
}
fn default_zscore_threshold() -> f64 {
    3.0
}
fn default_iqr_multiplier() -> f64 {
    1.5
}
fn default_mad_threshold() -> f64 {
    3.5
}
fn default_isolation_min_samples() -> usize {
    100
}
fn default_isolation_trees() -> usize {
    50
}
fn default_isolation_sample_size() -> usize {
    64
}
fn default_isolation_threshold() -> f64 {
    0.6
}
fn default_knn_k() -> usize {
    5
}
fn default_knn_window() -> usize {
    200
}
fn default_density_ratio_threshold() -> f64 {
    3.0
}
fn default_seasonal_min_samples() -> usize {
    8
}
fn default_imbalance_threshold() -> f64 {
    0.6
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            min_votes: default_min_votes(),
            min_history: default_min_history(),
            history_size: default_history_size(),
            max_anomalies: default_max_anomalies(),
            zscore_threshold: default_zscore_threshold(),
            iqr_multiplier: default_iqr_multiplier(),
            mad_threshold: default_mad_threshold(),
            isolation_min_samples: default_isolation_min_samples(),
            isolation_trees: default_isolation_trees(),
            isolation_sample_size: default_isolation_sample_size(),
            isolation_threshold: default_isolation_threshold(),
            knn_k: default_knn_k(),
            knn_window: default_knn_window(),
            density_ratio_threshold: default_density_ratio_threshold(),
            seasonal_min_samples: default_seasonal_min_samples(),
            imbalance_threshold: default_imbalance_threshold(),
        }
    }
}

impl AnomalyConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.min_votes == 0 {
            return Err("analytics.anomaly.min_votes must be at least 1".to_string());
        }
        if self.history_size < self.min_history {
            return Err("analytics.anomaly.history_size must be >= min_history".to_string());
        }
        if self.knn_k == 0 || self.isolation_trees == 0 || self.isolation_sample_size < 2 {
            return Err("analytics.anomaly detector sizes must be positive".to_string());
        }
        for (name, value) in [
            ("zscore_threshold", self.zscore_threshold),
            ("iqr_multiplier", self.iqr_multiplier),
            ("mad_threshold", self.mad_threshold),
            ("density_ratio_threshold", self.density_ratio_threshold),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(format!("analytics.anomaly.{} must be positive", name));
            }
        }
        Ok(())
    }
}

/// Which aspect of the data a detector looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorFamily {
    /// Value distribution of the coherence score
    Statistical,
    /// Time-of-day behaviour
    Temporal,
    /// Local density in feature space
    Density,
    /// Shape of the dimension vector
    Pattern,
}

/// One detector's verdict
#[derive(Debug, Clone, PartialEq)]
pub struct DetectorResult {
    pub name: &'static str,
    pub family: DetectorFamily,
    pub score: f64,
    pub flagged: bool,
}

/// Prior accepted points, in arrival order
pub struct DetectionHistory {
    pub scores: Vec<f64>,
    pub features: Vec<[f64; 5]>,
    pub hours: Vec<u32>,
}

impl DetectionHistory {
    pub fn from_points<'a>(points: impl Iterator<Item = &'a FilteredDataPoint>) -> Self {
        let mut history = Self {
            scores: Vec::new(),
            features: Vec::new(),
            hours: Vec::new(),
        };
        for p in points {
            history.scores.push(p.coherence_score);
            history.features.push(p.feature_vector());
            history.hours.push(p.point.timestamp.hour());
        }
        history
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

/// A single ensemble member
pub trait AnomalyDetector: Send + Sync {
    fn name(&self) -> &'static str;

    fn family(&self) -> DetectorFamily;

    /// `None` when the detector lacks the data it needs
    fn detect(&self, point: &FilteredDataPoint, history: &DetectionHistory) -> Option<DetectorResult>;
}

fn result(detector: &dyn AnomalyDetector, score: f64, flagged: bool) -> DetectorResult {
    DetectorResult {
        name: detector.name(),
        family: detector.family(),
        score: if score.is_finite() { score.clamp(0.0, 1.0) } else { 1.0 },
        flagged,
    }
}

/// z-score against the history mean/stdev
pub struct ZScoreDetector {
    pub threshold: f64,
}

impl AnomalyDetector for ZScoreDetector {
    fn name(&self) -> &'static str {
        "zscore"
    }

    fn family(&self) -> DetectorFamily {
        DetectorFamily::Statistical
    }

    fn detect(&self, point: &FilteredDataPoint, history: &DetectionHistory) -> Option<DetectorResult> {
        if history.len() < 2 {
            return None;
        }
        Some(z_result(self, point.coherence_score, &history.scores, self.threshold))
    }
}

fn z_result(detector: &dyn AnomalyDetector, value: f64, sample: &[f64], threshold: f64) -> DetectorResult {
    let m = mean(sample);
    let sd = std_dev(sample);
    if sd < 1e-12 {
        let deviates = (value - m).abs() > 1e-9;
        return result(detector, if deviates { 1.0 } else { 0.0 }, deviates);
    }
    let z = (value - m).abs() / sd;
    result(detector, z / (2.0 * threshold), z > threshold)
}

/// Tukey fences on the interquartile range
pub struct IqrDetector {
    pub multiplier: f64,
}

impl AnomalyDetector for IqrDetector {
    fn name(&self) -> &'static str {
        "iqr"
    }

    fn family(&self) -> DetectorFamily {
        DetectorFamily::Statistical
    }

    fn detect(&self, point: &FilteredDataPoint, history: &DetectionHistory) -> Option<DetectorResult> {
        if history.len() < 4 {
            return None;
        }
        let x = point.coherence_score;
        let q1 = quantile(&history.scores, 0.25);
        let q3 = quantile(&history.scores, 0.75);
        let iqr = q3 - q1;
        if iqr < 1e-12 {
            let deviates = (x - median(&history.scores)).abs() > 1e-9;
            return Some(result(self, if deviates { 1.0 } else { 0.0 }, deviates));
        }
        let lower = q1 - self.multiplier * iqr;
        let upper = q3 + self.multiplier * iqr;
        let center = (lower + upper) / 2.0;
        let half_width = (upper - lower) / 2.0;
        let score = (x - center).abs() / (2.0 * half_width);
        Some(result(self, score, x < lower || x > upper))
    }
}

/// Modified z-score on the median absolute deviation
pub struct MadDetector {
    pub threshold: f64,
}

impl AnomalyDetector for MadDetector {
    fn name(&self) -> &'static str {
        "mad"
    }

    fn family(&self) -> DetectorFamily {
        DetectorFamily::Statistical
    }

    fn detect(&self, point: &FilteredDataPoint, history: &DetectionHistory) -> Option<DetectorResult> {
        if history.len() < 3 {
            return None;
        }
        let x = point.coherence_score;
        let m = median(&history.scores);
        let mut spread = mad(&history.scores);
        if spread < 1e-12 {
            // more than half the values identical; mean absolute deviation keeps some resolution
            spread = 1.2533 * mean(&history.scores.iter().map(|v| (v - m).abs()).collect::<Vec<_>>());
        }
        if spread < 1e-12 {
            let deviates = (x - m).abs() > 1e-9;
            return Some(result(self, if deviates { 1.0 } else { 0.0 }, deviates));
        }
        let modified_z = 0.6745 * (x - m).abs() / spread;
        Some(result(self, modified_z / (2.0 * self.threshold), modified_z > self.threshold))
    }
}

enum IsolationNode {
    Leaf { size: usize },
    Split {
        feature: usize,
        value: f64,
        left: Box<IsolationNode>,
        right: Box<IsolationNode>,
    },
}

/// Average path length of an unsuccessful BST search over `n` points
fn average_path_length(n: usize) -> f64 {
    match n {
        0 | 1 => 0.0,
        2 => 1.0,
        _ => {
            let n = n as f64;
            2.0 * ((n - 1.0).ln() + 0.577_215_664_9) - 2.0 * (n - 1.0) / n
        }
    }
}

fn build_tree(rng: &mut StdRng, sample: &mut [[f64; 5]], depth: usize, max_depth: usize) -> IsolationNode {
    if depth >= max_depth || sample.len() <= 1 {
        return IsolationNode::Leaf { size: sample.len() };
    }

    let feature = rng.gen_range(0..5);
    let (min, max) = sample.iter().fold((f64::MAX, f64::MIN), |(lo, hi), p| {
        (lo.min(p[feature]), hi.max(p[feature]))
    });
    if max - min < 1e-12 {
        return IsolationNode::Leaf { size: sample.len() };
    }

    let value = rng.gen_range(min..max);
    let mut split = 0;
    for i in 0..sample.len() {
        if sample[i][feature] < value {
            sample.swap(i, split);
            split += 1;
        }
    }
    let (left, right) = sample.split_at_mut(split);
    IsolationNode::Split {
        feature,
        value,
        left: Box::new(build_tree(rng, left, depth + 1, max_depth)),
        right: Box::new(build_tree(rng, right, depth + 1, max_depth)),
    }
}

fn path_length(node: &IsolationNode, point: &[f64; 5], depth: usize) -> f64 {
    match node {
        IsolationNode::Leaf { size } => depth as f64 + average_path_length(*size),
        IsolationNode::Split {
            feature,
            value,
            left,
            right,
        } => {
            if point[*feature] < *value {
                path_length(left, point, depth + 1)
            } else {
                path_length(right, point, depth + 1)
            }
        }
    }
}

/// Random-partition path length (isolation forest) over feature vectors
pub struct IsolationForestDetector {
    pub min_samples: usize,
    pub trees: usize,
    pub sample_size: usize,
    pub threshold: f64,
    pub seed: u64,
}

impl AnomalyDetector for IsolationForestDetector {
    fn name(&self) -> &'static str {
        "isolation_forest"
    }

    fn family(&self) -> DetectorFamily {
        DetectorFamily::Statistical
    }

    fn detect(&self, point: &FilteredDataPoint, history: &DetectionHistory) -> Option<DetectorResult> {
        if history.len() < self.min_samples.max(2) {
            return None;
        }

        let mut rng = StdRng::seed_from_u64(self.seed);
        let sample_size = self.sample_size.min(history.len()).max(2);
        let max_depth = (sample_size as f64).log2().ceil() as usize;
        let target = point.feature_vector();

        let mut total = 0.0;
        for _ in 0..self.trees.max(1) {
            let mut sample: Vec<[f64; 5]> = (0..sample_size)
                .map(|_| history.features[rng.gen_range(0..history.len())])
                .collect();
            let tree = build_tree(&mut rng, &mut sample, 0, max_depth);
            total += path_length(&tree, &target, 0);
        }
        let expected = total / self.trees.max(1) as f64;
        let score = 2f64.powf(-expected / average_path_length(sample_size));
        Some(result(self, score, score > self.threshold))
    }
}

/// k-nearest-neighbour distance relative to the history's typical spacing
pub struct NeighborDensityDetector {
    pub k: usize,
    pub window: usize,
    pub ratio_threshold: f64,
}

impl AnomalyDetector for NeighborDensityDetector {
    fn name(&self) -> &'static str {
        "neighbor_density"
    }

    fn family(&self) -> DetectorFamily {
        DetectorFamily::Density
    }

    fn detect(&self, point: &FilteredDataPoint, history: &DetectionHistory) -> Option<DetectorResult> {
        let start = history.features.len().saturating_sub(self.window);
        let recent = &history.features[start..];
        if recent.len() <= self.k {
            return None;
        }

        let own = knn_mean_distance(&point.feature_vector(), recent, self.k, None)?;
        let reference: Vec<f64> = recent
            .iter()
            .enumerate()
            .filter_map(|(i, p)| knn_mean_distance(p, recent, self.k, Some(i)))
            .collect();
        let typical = mean(&reference);

        if typical < 1e-12 {
            let deviates = own > 1e-9;
            return Some(result(self, if deviates { 1.0 } else { 0.0 }, deviates));
        }
        let ratio = own / typical;
        Some(result(self, ratio / (2.0 * self.ratio_threshold), ratio > self.ratio_threshold))
    }
}

/// z-score against points accepted in the same hour of day
pub struct SeasonalDetector {
    pub min_samples: usize,
    pub threshold: f64,
}

impl AnomalyDetector for SeasonalDetector {
    fn name(&self) -> &'static str {
        "seasonal"
    }

    fn family(&self) -> DetectorFamily {
        DetectorFamily::Temporal
    }

    fn detect(&self, point: &FilteredDataPoint, history: &DetectionHistory) -> Option<DetectorResult> {
        let hour = point.point.timestamp.hour();
        let same_hour: Vec<f64> = history
            .scores
            .iter()
            .zip(history.hours.iter())
            .filter(|(_, h)| **h == hour)
            .map(|(s, _)| *s)
            .collect();
        if same_hour.len() < self.min_samples.max(2) {
            return None;
        }
        Some(z_result(self, point.coherence_score, &same_hour, self.threshold))
    }
}

/// Spread between the strongest and weakest dimension
pub struct DimensionImbalanceDetector {
    pub threshold: f64,
}

impl AnomalyDetector for DimensionImbalanceDetector {
    fn name(&self) -> &'static str {
        "dimension_imbalance"
    }

    fn family(&self) -> DetectorFamily {
        DetectorFamily::Pattern
    }

    fn detect(&self, point: &FilteredDataPoint, _history: &DetectionHistory) -> Option<DetectorResult> {
        let dims = point.dimensions.as_array();
        let max = dims.iter().copied().fold(f64::MIN, f64::max);
        let min = dims.iter().copied().fold(f64::MAX, f64::min);
        let spread = max - min;
        Some(result(self, spread, spread > self.threshold))
    }
}

/// Ordered set of detectors plus the voting rule
pub struct AnomalyEnsemble {
    min_votes: usize,
    min_history: usize,
    detectors: Vec<Box<dyn AnomalyDetector>>,
}

impl AnomalyEnsemble {
    pub fn new(config: &AnomalyConfig, seed: u64) -> Self {
        let detectors: Vec<Box<dyn AnomalyDetector>> = vec![
            Box::new(ZScoreDetector {
                threshold: config.zscore_threshold,
            }),
            Box::new(IqrDetector {
                multiplier: config.iqr_multiplier,
            }),
            Box::new(MadDetector {
                threshold: config.mad_threshold,
            }),
            Box::new(IsolationForestDetector {
                min_samples: config.isolation_min_samples,
                trees: config.isolation_trees,
                sample_size: config.isolation_sample_size,
                threshold: config.isolation_threshold,
                seed,
            }),
            Box::new(NeighborDensityDetector {
                k: config.knn_k,
                window: config.knn_window,
                ratio_threshold: config.density_ratio_threshold,
            }),
            Box::new(SeasonalDetector {
                min_samples: config.seasonal_min_samples,
                threshold: config.zscore_threshold,
            }),
            Box::new(DimensionImbalanceDetector {
                threshold: config.imbalance_threshold,
            }),
        ];
        Self {
            min_votes: config.min_votes,
            min_history: config.min_history,
            detectors,
        }
    }

    pub fn detector_names(&self) -> Vec<&'static str> {
        self.detectors.iter().map(|d| d.name()).collect()
    }

    /// Run every detector; returns the individual verdicts
    pub fn run(&self, point: &FilteredDataPoint, history: &DetectionHistory) -> Vec<DetectorResult> {
        self.detectors
            .iter()
            .filter_map(|d| d.detect(point, history))
            .collect()
    }

    /// Full ensemble decision; `None` when not anomalous or history is too short
    pub fn evaluate(&self, point: &FilteredDataPoint, history: &DetectionHistory) -> Option<Anomaly> {
        if history.len() < self.min_history {
            return None;
        }

        let results = self.run(point, history);
        let flagged: Vec<&DetectorResult> = results.iter().filter(|r| r.flagged).collect();
        if flagged.len() < self.min_votes {
            return None;
        }

        let kind = classify(&flagged);
        let method_scores: BTreeMap<String, f64> = results
            .iter()
            .map(|r| (r.name.to_string(), r.score))
            .collect();
        let ensemble_score = mean(&results.iter().map(|r| r.score).collect::<Vec<_>>());
        let flagged_by: Vec<String> = flagged.iter().map(|r| r.name.to_string()).collect();
        let explanation = format!(
            "{} anomaly: flagged by {} ({}/{} detectors ran), score {:.3} vs history mean {:.3}",
            kind.as_str(),
            flagged_by.join(", "),
            flagged.len(),
            results.len(),
            point.coherence_score,
            mean(&history.scores)
        );

        Some(Anomaly {
            id: Uuid::new_v4(),
            point: point.clone(),
            method_scores,
            flagged_by,
            ensemble_score,
            kind,
            explanation,
            detected_at: Utc::now(),
        })
    }
}

fn classify(flagged: &[&DetectorResult]) -> AnomalyKind {
    if flagged.iter().any(|r| r.family == DetectorFamily::Temporal) {
        AnomalyKind::Contextual
    } else if flagged
        .iter()
        .any(|r| matches!(r.family, DetectorFamily::Density | DetectorFamily::Pattern))
    {
        AnomalyKind::Collective
    } else {
        AnomalyKind::Point
    }
}
