//! Feedback-driven weight optimizer
//!
//! Learns dimension weights from relevance feedback on accepted points.
//! Each run searches two ways from the current weights:
//! 1. exploration: a ±step nudge per dimension plus a few random perturbations
//! 2. central-difference gradient descent on the feedback loss
//!
//! The best candidate is only committed when both the loss improvement and
//! the run's confidence clear their thresholds. Candidates are always
//! renormalized, so committed weights sum to 1 with every weight floored.
//!
//! Predictions come from the caller's scoring function
//! ([`WeightOptimizer::optimize_with`]) so the loss matches the combination
//! mode that decides acceptance; [`WeightOptimizer::optimize`] assumes a
//! plain weighted average.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use coherence_common::model::Dimension;
use coherence_common::{CoherenceDimensions, FilteredDataPoint, Weights};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error, PartialEq)]
pub enum OptimizerError {
    #[error("Insufficient feedback: have {have}, need {need}")]
    InsufficientFeedback { have: usize, need: usize },

    #[error("Invalid feedback: {0}")]
    InvalidFeedback(String),

    #[error("Invalid optimizer configuration: {0}")]
    InvalidConfig(String),
}

/// Relevance judgement on one accepted point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub point_id: String,
    pub relevant: bool,
    /// In [0, 1]
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

impl Feedback {
    pub fn new(point_id: impl Into<String>, relevant: bool, confidence: f64) -> Self {
        Self {
            point_id: point_id.into(),
            relevant,
            confidence,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Feedback entries required before a run
    #[serde(default = "default_min_feedback")]
    pub min_feedback: usize,
    /// Per-dimension nudge size
    #[serde(default = "default_exploration")]
    pub exploration: f64,
    #[serde(default = "default_random_variations")]
    pub random_variations: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Step used for central differences
    #[serde(default = "default_gradient_epsilon")]
    pub gradient_epsilon: f64,
    #[serde(default = "default_gradient_iterations")]
    pub gradient_iterations: usize,
    /// Absolute loss decrease required to commit
    #[serde(default = "default_min_improvement")]
    pub min_improvement: f64,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// Feedback older than this is dropped after each run
    #[serde(default = "default_feedback_horizon_secs")]
    pub feedback_horizon_secs: u64,
    #[serde(default = "default_max_observations")]
    pub max_observations: usize,
    #[serde(default = "default_max_feedback")]
    pub max_feedback: usize,
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_min_feedback() -> usize {
    10
}
fn default_exploration() -> f64 {
    0.05
}
fn default_random_variations() -> usize {
    8
}
fn default_learning_rate() -> f64 {
    0.5
}
fn default_gradient_epsilon() -> f64 {
    1e-3
}
fn default_gradient_iterations() -> usize {
    25
}
fn default_min_improvement() -> f64 {
    1e-3
}
fn default_min_confidence() -> f64 {
    0.3
}
fn default_feedback_horizon_secs() -> u64 {
    86_400
}
fn default_max_observations() -> usize {
    5_000
}
fn default_max_feedback() -> usize {
    1_000
}
fn default_max_history() -> usize {
    100
}
fn default_seed() -> u64 {
    7
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            min_feedback: default_min_feedback(),
            exploration: default_exploration(),
            random_variations: default_random_variations(),
            learning_rate: default_learning_rate(),
            gradient_epsilon: default_gradient_epsilon(),
            gradient_iterations: default_gradient_iterations(),
            min_improvement: default_min_improvement(),
            min_confidence: default_min_confidence(),
            feedback_horizon_secs: default_feedback_horizon_secs(),
            max_observations: default_max_observations(),
            max_feedback: default_max_feedback(),
            max_history: default_max_history(),
            seed: default_seed(),
        }
    }
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<(), OptimizerError> {
        if self.min_feedback == 0 {
            return Err(OptimizerError::InvalidConfig("optimizer.min_feedback must be positive".into()));
        }
        if !(self.exploration > 0.0 && self.exploration < 1.0) {
            return Err(OptimizerError::InvalidConfig("optimizer.exploration must be in (0, 1)".into()));
        }
        if !(self.learning_rate > 0.0) || !(self.gradient_epsilon > 0.0) {
            return Err(OptimizerError::InvalidConfig(
                "optimizer.learning_rate and gradient_epsilon must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) || self.min_improvement < 0.0 {
            return Err(OptimizerError::InvalidConfig(
                "optimizer.min_confidence must be in [0, 1] and min_improvement >= 0".into(),
            ));
        }
        if self.max_feedback < self.min_feedback {
            return Err(OptimizerError::InvalidConfig("optimizer.max_feedback must be >= min_feedback".into()));
        }
        Ok(())
    }
}

/// Result of one optimization run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationOutcome {
    /// Committed weights (the input weights when not applied)
    pub weights: Weights,
    /// Loss decrease of the best candidate
    pub improvement: f64,
    /// No candidate beat the current weights by `min_improvement`
    pub converged: bool,
    pub applied: bool,
    pub confidence: f64,
    pub loss_before: f64,
    pub loss_after: f64,
    pub feedback_used: usize,
    pub completed_at: DateTime<Utc>,
}

struct Sample {
    dimensions: CoherenceDimensions,
    target: f64,
    confidence: f64,
    timestamp: DateTime<Utc>,
}

struct OptimizerState {
    observations: HashMap<String, CoherenceDimensions>,
    observation_order: VecDeque<String>,
    feedback: VecDeque<Sample>,
    history: VecDeque<OptimizationOutcome>,
    rng: StdRng,
}

pub struct WeightOptimizer {
    config: OptimizerConfig,
    state: Mutex<OptimizerState>,
}

struct Candidate {
    weights: Weights,
    loss: f64,
}

/// Predicted score for `dimensions` under candidate weights
type ScoreFn<'a> = &'a dyn Fn(&Weights, &CoherenceDimensions) -> f64;

impl Candidate {
    fn consider(&mut self, weights: Weights, samples: &[Sample], score: ScoreFn<'_>) {
        let l = loss(&weights, samples, score);
        if l < self.loss {
            self.weights = weights;
            self.loss = l;
        }
    }
}

/// Confidence-weighted mean squared error of predicted scores
fn loss(weights: &Weights, samples: &[Sample], score: ScoreFn<'_>) -> f64 {
    let total: f64 = samples.iter().map(|s| s.confidence).sum();
    if total <= 0.0 {
        return 0.0;
    }
    samples
        .iter()
        .map(|s| s.confidence * (score(weights, &s.dimensions) - s.target).powi(2))
        .sum::<f64>()
        / total
}

impl WeightOptimizer {
    pub fn new(config: OptimizerConfig) -> Result<Self, OptimizerError> {
        config.validate()?;
        Ok(Self {
            state: Mutex::new(OptimizerState {
                observations: HashMap::new(),
                observation_order: VecDeque::new(),
                feedback: VecDeque::new(),
                history: VecDeque::new(),
                rng: StdRng::seed_from_u64(config.seed),
            }),
            config,
        })
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, OptimizerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Remember an accepted point's dimensions so feedback can refer to it
    pub fn observe(&self, point: &FilteredDataPoint) {
        let mut state = self.lock();
        let id = point.id().to_string();
        if state.observations.insert(id.clone(), point.dimensions).is_none() {
            state.observation_order.push_back(id);
        }
        while state.observation_order.len() > self.config.max_observations {
            if let Some(oldest) = state.observation_order.pop_front() {
                state.observations.remove(&oldest);
            }
        }
    }

    /// Attach feedback to an observed point
    ///
    /// Returns `Ok(false)` when the point was never observed (or has been
    /// forgotten); nothing is recorded in that case.
    pub fn record_feedback(&self, feedback: Feedback) -> Result<bool, OptimizerError> {
        if !(0.0..=1.0).contains(&feedback.confidence) {
            return Err(OptimizerError::InvalidFeedback(format!(
                "confidence {} outside [0, 1]",
                feedback.confidence
            )));
        }

        let mut state = self.lock();
        let Some(dimensions) = state.observations.get(&feedback.point_id).copied() else {
            debug!(point_id = %feedback.point_id, "Feedback for unknown point ignored");
            return Ok(false);
        };
        state.feedback.push_back(Sample {
            dimensions,
            target: if feedback.relevant { 1.0 } else { 0.0 },
            confidence: feedback.confidence,
            timestamp: feedback.timestamp,
        });
        while state.feedback.len() > self.config.max_feedback {
            state.feedback.pop_front();
        }
        Ok(true)
    }

    pub fn feedback_len(&self) -> usize {
        self.lock().feedback.len()
    }

    /// Run one optimization pass starting from `current`, predicting scores
    /// as a weighted average of the dimensions
    pub fn optimize(&self, current: Weights) -> Result<OptimizationOutcome, OptimizerError> {
        self.optimize_with(current, |weights, dimensions| weights.apply(dimensions))
    }

    /// Run one optimization pass with `score` as the prediction model
    pub fn optimize_with<F>(&self, current: Weights, score: F) -> Result<OptimizationOutcome, OptimizerError>
    where
        F: Fn(&Weights, &CoherenceDimensions) -> f64,
    {
        let score: ScoreFn<'_> = &score;
        let mut state = self.lock();
        let have = state.feedback.len();
        if have < self.config.min_feedback {
            return Err(OptimizerError::InsufficientFeedback {
                have,
                need: self.config.min_feedback,
            });
        }

        let samples: Vec<Sample> = state.feedback.drain(..).collect();
        let loss_before = loss(&current, &samples, score);

        let mut best = Candidate {
            weights: current,
            loss: loss_before,
        };

        // exploration around the current weights
        let base = current.as_array();
        let step = self.config.exploration;
        for dimension in Dimension::ALL {
            for sign in [1.0, -1.0] {
                let mut values = base;
                values[dimension.index()] += sign * step;
                best.consider(Weights::renormalized(values), &samples, score);
            }
        }
        for _ in 0..self.config.random_variations {
            let values = base.map(|w| w + state.rng.gen_range(-step..=step) * 2.0);
            best.consider(Weights::renormalized(values), &samples, score);
        }

        // gradient descent from the best exploration candidate
        let eps = self.config.gradient_epsilon;
        let mut position = best.weights.as_array();
        for _ in 0..self.config.gradient_iterations {
            let mut gradient = [0.0; 4];
            for (i, g) in gradient.iter_mut().enumerate() {
                let mut plus = position;
                let mut minus = position;
                plus[i] += eps;
                minus[i] -= eps;
                *g = (loss(&Weights::renormalized(plus), &samples, score)
                    - loss(&Weights::renormalized(minus), &samples, score))
                    / (2.0 * eps);
            }
            let mut next = position;
            for (w, g) in next.iter_mut().zip(gradient.iter()) {
                *w -= self.config.learning_rate * g;
            }
            let candidate = Weights::renormalized(next);
            best.consider(candidate, &samples, score);
            position = candidate.as_array();
        }
        let Candidate {
            weights: best,
            loss: best_loss,
        } = best;

        let improvement = (loss_before - best_loss).max(0.0);
        let confidence = self.run_confidence(samples.len(), improvement, loss_before);
        let better = improvement > self.config.min_improvement;
        let applied = better && confidence > self.config.min_confidence;

        let outcome = OptimizationOutcome {
            weights: if applied { best } else { current },
            improvement,
            converged: !better,
            applied,
            confidence,
            loss_before,
            loss_after: if applied { best_loss } else { loss_before },
            feedback_used: samples.len(),
            completed_at: Utc::now(),
        };

        // keep fresh feedback for the next run
        let horizon = ChronoDuration::seconds(self.config.feedback_horizon_secs as i64);
        let cutoff = Utc::now() - horizon;
        state
            .feedback
            .extend(samples.into_iter().filter(|s| s.timestamp >= cutoff));

        state.history.push_back(outcome.clone());
        while state.history.len() > self.config.max_history {
            state.history.pop_front();
        }

        info!(
            applied = outcome.applied,
            improvement = outcome.improvement,
            confidence = outcome.confidence,
            loss_before = outcome.loss_before,
            loss_after = outcome.loss_after,
            "Weight optimization run complete"
        );
        Ok(outcome)
    }

    /// Grows with feedback volume and with the relative loss improvement
    fn run_confidence(&self, volume: usize, improvement: f64, loss_before: f64) -> f64 {
        let volume = volume as f64;
        let volume_factor = volume / (volume + self.config.min_feedback as f64);
        if loss_before <= f64::EPSILON {
            return 0.0;
        }
        let relative = (improvement / loss_before).clamp(0.0, 1.0);
        (volume_factor * relative / (relative + 0.05)).clamp(0.0, 1.0)
    }

    /// Past runs, oldest first
    pub fn history(&self) -> Vec<OptimizationOutcome> {
        self.lock().history.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coherence_common::DataPoint;
    use serde_json::json;

    fn observed(optimizer: &WeightOptimizer, id: &str, dims: CoherenceDimensions) {
        optimizer.observe(&FilteredDataPoint {
            point: DataPoint::new(id, "s", Utc::now(), json!("x")),
            coherence_score: 0.5,
            dimensions: dims,
            explanations: Vec::new(),
        });
    }

    /// Relevant items are high in ψ only; irrelevant ones high in ρ only
    fn trained_optimizer(count: usize) -> WeightOptimizer {
        let optimizer = WeightOptimizer::new(OptimizerConfig::default()).unwrap();
        for i in 0..count {
            let relevant = i % 2 == 0;
            let dims = if relevant {
                CoherenceDimensions::new(0.9, 0.2, 0.2, 0.2)
            } else {
                CoherenceDimensions::new(0.1, 0.9, 0.2, 0.2)
            };
            let id = format!("p{}", i);
            observed(&optimizer, &id, dims);
            assert!(optimizer.record_feedback(Feedback::new(id, relevant, 1.0)).unwrap());
        }
        optimizer
    }

    #[test]
    fn test_unknown_point_is_noop() {
        let optimizer = WeightOptimizer::new(OptimizerConfig::default()).unwrap();
        assert!(!optimizer.record_feedback(Feedback::new("missing", true, 1.0)).unwrap());
        assert_eq!(optimizer.feedback_len(), 0);
    }

    #[test]
    fn test_confidence_validated() {
        let optimizer = WeightOptimizer::new(OptimizerConfig::default()).unwrap();
        observed(&optimizer, "a", CoherenceDimensions::default());
        assert!(matches!(
            optimizer.record_feedback(Feedback::new("a", true, 1.5)),
            Err(OptimizerError::InvalidFeedback(_))
        ));
    }

    #[test]
    fn test_insufficient_feedback() {
        let optimizer = trained_optimizer(4);
        assert_eq!(
            optimizer.optimize(Weights::equal()).unwrap_err(),
            OptimizerError::InsufficientFeedback { have: 4, need: 10 }
        );
    }

    #[test]
    fn test_optimize_moves_weight_toward_signal() {
        let optimizer = trained_optimizer(30);
        let outcome = optimizer.optimize(Weights::equal()).unwrap();

        assert!(outcome.applied);
        assert!(!outcome.converged);
        assert!(outcome.loss_after < outcome.loss_before);
        assert!((outcome.weights.sum() - 1.0).abs() < 1e-9);
        assert!(outcome.weights.psi > 0.25);
        assert!(outcome.weights.rho < 0.25);
        assert!(outcome.weights.as_array().iter().all(|w| *w >= coherence_common::model::MIN_WEIGHT - 1e-12));
        assert_eq!(optimizer.history().len(), 1);
        // fresh feedback is retained
        assert_eq!(optimizer.feedback_len(), 30);
    }

    #[test]
    fn test_stale_feedback_cleared_after_run() {
        let optimizer = trained_optimizer(0);
        for i in 0..12 {
            let id = format!("old{}", i);
            observed(&optimizer, &id, CoherenceDimensions::new(0.5, 0.5, 0.5, 0.5));
            let mut feedback = Feedback::new(id, i % 2 == 0, 1.0);
            feedback.timestamp = Utc::now() - ChronoDuration::days(3);
            optimizer.record_feedback(feedback).unwrap();
        }
        let outcome = optimizer.optimize(Weights::equal()).unwrap();
        // identical dimensions give every weighting the same loss
        assert!(!outcome.applied);
        assert!(outcome.converged);
        assert_eq!(outcome.weights, Weights::equal());
        assert_eq!(optimizer.feedback_len(), 0);
    }

    #[test]
    fn test_observation_cap() {
        let config = OptimizerConfig {
            max_observations: 2,
            ..Default::default()
        };
        let optimizer = WeightOptimizer::new(config).unwrap();
        observed(&optimizer, "a", CoherenceDimensions::default());
        observed(&optimizer, "b", CoherenceDimensions::default());
        observed(&optimizer, "c", CoherenceDimensions::default());
        assert!(!optimizer.record_feedback(Feedback::new("a", true, 1.0)).unwrap());
        assert!(optimizer.record_feedback(Feedback::new("c", true, 1.0)).unwrap());
    }
}
