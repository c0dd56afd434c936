//! Coherence scorer
//!
//! Scores each data point along ψ/ρ/q/f and keeps it when the combined score
//! reaches the sensitivity threshold.
//!
//! # Combination modes
//! - `WeightedAverage`: `Σ wᵢ·dᵢ`
//! - `Compounding`:
//!   `q_opt = q / (km + q + q²/ki)`,
//!   `score = ψ + ρψ + q_opt + fψ + coupling·ρ·q_opt`, each of the first four
//!   terms scaled by `4·w` and the total divided by its value at the maximum,
//!   so the score stays in [0, 1]
//!
//! Accepted points update the context buffer and the pattern table, which
//! feed ρ and the enhancement steps on later calls.

pub mod context;
pub mod dimensions;
pub mod extensions;

pub use context::{Pattern, PatternSignature};
pub use dimensions::{DimensionCalculator, DimensionScore, ScoringContext};
pub use extensions::{ContextBoostEnhancement, EmptyContentFilter, Enhancement, ExtensionRegistry, PreProcessor};

use coherence_common::model::{clamp_unit, CoherenceDimensions, Dimension};
use coherence_common::{DataPoint, FilteredDataPoint, Weights};
use context::{dimension_profile, ContextBuffer, PatternTable};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

/// Scorer errors
#[derive(Debug, Error, PartialEq)]
pub enum ScorerError {
    /// A numeric parameter would make the score NaN or infinite
    #[error("Degenerate parameter {parameter} = {value}")]
    DegenerateParameter { parameter: &'static str, value: f64 },

    #[error("Invalid scorer configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid data point: {0}")]
    InvalidInput(String),
}

/// How dimensions are combined into one score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombinationMode {
    /// `Σ wᵢ·dᵢ`
    #[default]
    WeightedAverage,
    /// `ψ + ρψ + q_opt + fψ + coupling·ρ·q_opt` with the first four terms
    /// scaled by `4·w`, divided by the same expression at its maximum
    Compounding,
}

/// Scorer configuration; hot-swappable through `update_config`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScorerConfig {
    /// Minimum score for a point to be retained
    #[serde(default = "default_sensitivity")]
    pub sensitivity: f64,
    #[serde(default)]
    pub weights: Weights,
    #[serde(default)]
    pub mode: CombinationMode,
    /// Activation half-saturation constant
    #[serde(default = "default_km")]
    pub km: f64,
    /// Inhibition constant; must be positive
    #[serde(default = "default_ki")]
    pub ki: f64,
    /// ρ·q_opt cross-term coefficient
    #[serde(default = "default_coupling")]
    pub coupling: f64,
    #[serde(default = "default_context_window_secs")]
    pub context_window_secs: u64,
    #[serde(default = "default_max_context")]
    pub max_context: usize,
    #[serde(default = "default_max_patterns")]
    pub max_patterns: usize,
}

fn default_sensitivity() -> f64 {
    0.5
}
fn default_km() -> f64 {
    0.2
}
fn default_ki() -> f64 {
    0.8
}
fn default_coupling() -> f64 {
    0.15
}
fn default_context_window_secs() -> u64 {
    3_600
}
fn default_max_context() -> usize {
    1_000
}
fn default_max_patterns() -> usize {
    500
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            sensitivity: default_sensitivity(),
            weights: Weights::default(),
            mode: CombinationMode::default(),
            km: default_km(),
            ki: default_ki(),
            coupling: default_coupling(),
            context_window_secs: default_context_window_secs(),
            max_context: default_max_context(),
            max_patterns: default_max_patterns(),
        }
    }
}

impl ScorerConfig {
    pub fn validate(&self) -> Result<(), ScorerError> {
        if !self.ki.is_finite() || self.ki <= 0.0 {
            return Err(ScorerError::DegenerateParameter {
                parameter: "ki",
                value: self.ki,
            });
        }
        if !self.km.is_finite() || self.km < 0.0 {
            return Err(ScorerError::DegenerateParameter {
                parameter: "km",
                value: self.km,
            });
        }
        if !self.coupling.is_finite() || self.coupling < 0.0 {
            return Err(ScorerError::InvalidConfig(format!(
                "coupling must be finite and non-negative, got {}",
                self.coupling
            )));
        }
        if !(0.0..=1.0).contains(&self.sensitivity) {
            return Err(ScorerError::InvalidConfig(format!(
                "sensitivity must be within [0, 1], got {}",
                self.sensitivity
            )));
        }
        if self.max_patterns == 0 || self.max_context == 0 {
            return Err(ScorerError::InvalidConfig(
                "max_patterns and max_context must be at least 1".to_string(),
            ));
        }
        Weights::from_array(self.weights.as_array())
            .map_err(|e| ScorerError::InvalidConfig(e.to_string()))?;
        Ok(())
    }
}

/// Inhibited activation `q / (km + q + q²/ki)`; requires `ki > 0`
pub fn optimize_q(q_raw: f64, km: f64, ki: f64) -> Result<f64, ScorerError> {
    if !ki.is_finite() || ki <= 0.0 {
        return Err(ScorerError::DegenerateParameter {
            parameter: "ki",
            value: ki,
        });
    }
    if q_raw <= 0.0 {
        return Ok(0.0);
    }
    Ok(clamp_unit(q_raw / (km + q_raw + q_raw * q_raw / ki)))
}

/// Supremum of `optimize_q` over q ∈ (0, 1]
fn max_optimized_q(km: f64, ki: f64) -> f64 {
    let q_star = (km * ki).sqrt().min(1.0);
    if q_star <= 0.0 {
        return 1.0;
    }
    1.0 / (km / q_star + 1.0 + q_star / ki)
}

/// Combine dimensions into a score in [0, 1]
///
/// In compounding mode `dimensions.q_optimized` is overwritten with the
/// inhibited activation.
pub fn combine(
    dimensions: &mut CoherenceDimensions,
    weights: &Weights,
    config: &ScorerConfig,
) -> Result<f64, ScorerError> {
    match config.mode {
        CombinationMode::WeightedAverage => {
            dimensions.q_optimized = dimensions.q_raw;
            Ok(clamp_unit(weights.apply(dimensions)))
        }
        CombinationMode::Compounding => {
            let q_opt = optimize_q(dimensions.q_raw, config.km, config.ki)?;
            dimensions.q_optimized = q_opt;

            let CoherenceDimensions { psi, rho, f, .. } = *dimensions;
            let raw = 4.0 * weights.psi * psi
                + 4.0 * weights.rho * rho * psi
                + 4.0 * weights.q * q_opt
                + 4.0 * weights.f * f * psi
                + config.coupling * rho * q_opt;

            let q_max = max_optimized_q(config.km, config.ki);
            let max = 4.0 * (weights.psi + weights.rho + weights.q * q_max + weights.f)
                + config.coupling * q_max;
            if max <= f64::EPSILON {
                return Ok(0.0);
            }
            Ok(clamp_unit(raw / max))
        }
    }
}

/// Score of a point without mutating scorer state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub score: f64,
    pub dimensions: CoherenceDimensions,
    pub explanations: Vec<String>,
    pub accepted: bool,
    /// Pre-processor rejection reason, if any
    pub rejected: Option<String>,
}

struct ScorerState {
    config: ScorerConfig,
    context: ContextBuffer,
    patterns: PatternTable,
}

/// Stateful, order-dependent coherence scorer
pub struct Scorer {
    registry: ExtensionRegistry,
    state: Mutex<ScorerState>,
}

impl Scorer {
    pub fn new(config: ScorerConfig) -> Result<Self, ScorerError> {
        Self::with_registry(config, ExtensionRegistry::with_defaults())
    }

    pub fn with_registry(mut config: ScorerConfig, registry: ExtensionRegistry) -> Result<Self, ScorerError> {
        config.validate()?;
        config.weights = Weights::from_array(config.weights.as_array())
            .map_err(|e| ScorerError::InvalidConfig(e.to_string()))?;

        for dimension in Dimension::ALL {
            if registry.calculator(dimension).is_none() {
                return Err(ScorerError::InvalidConfig(format!(
                    "no calculator registered for {}",
                    dimension
                )));
            }
        }

        Ok(Self {
            registry,
            state: Mutex::new(ScorerState {
                context: ContextBuffer::new(config.context_window_secs, config.max_context),
                patterns: PatternTable::new(config.max_patterns),
                config,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ScorerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Score `point` and keep it if it clears the sensitivity threshold
    ///
    /// Returns `Ok(None)` for points below the threshold or rejected by a
    /// pre-processor.
    pub fn filter(&self, point: &DataPoint) -> Result<Option<FilteredDataPoint>, ScorerError> {
        let mut state = self.lock();
        let evaluation = self.evaluate_locked(&state, point)?;
        if !evaluation.accepted {
            tracing::trace!(
                point_id = %point.id,
                score = evaluation.score,
                rejected = ?evaluation.rejected,
                "Point dropped"
            );
            return Ok(None);
        }

        let profile = dimension_profile(&evaluation.dimensions);
        state.patterns.record(point, profile, evaluation.score);
        state.context.push(&point.source, point.timestamp, evaluation.score);

        Ok(Some(FilteredDataPoint {
            point: point.clone(),
            coherence_score: evaluation.score,
            dimensions: evaluation.dimensions,
            explanations: evaluation.explanations,
        }))
    }

    /// Score `point` without touching the context buffer or pattern table
    pub fn evaluate(&self, point: &DataPoint) -> Result<Evaluation, ScorerError> {
        let state = self.lock();
        self.evaluate_locked(&state, point)
    }

    fn evaluate_locked(&self, state: &ScorerState, point: &DataPoint) -> Result<Evaluation, ScorerError> {
        point
            .validate()
            .map_err(|e| ScorerError::InvalidInput(e.to_string()))?;

        for pre in self.registry.pre_processors() {
            if let Err(reason) = pre.check(point) {
                return Ok(Evaluation {
                    score: 0.0,
                    dimensions: CoherenceDimensions::default(),
                    explanations: vec![format!("{}: {}", pre.name(), reason)],
                    accepted: false,
                    rejected: Some(reason),
                });
            }
        }

        let ctx = ScoringContext {
            patterns: &state.patterns,
            context: &state.context,
        };

        let mut dimensions = CoherenceDimensions::default();
        let mut explanations = Vec::with_capacity(6);
        for dimension in Dimension::ALL {
            let Some(calculator) = self.registry.calculator(dimension) else {
                continue;
            };
            let scored = calculator.calculate(point, &ctx);
            dimensions.set(dimension, scored.value);
            explanations.push(format!("{}: {:.2} ({})", dimension, scored.value, scored.explanation));
        }

        for enhancement in self.registry.enhancements() {
            if let Some(note) = enhancement.enhance(point, &mut dimensions, &ctx) {
                explanations.push(note);
            }
        }
        let mut dimensions = dimensions.clamped();

        let score = combine(&mut dimensions, &state.config.weights, &state.config)?;
        Ok(Evaluation {
            score,
            dimensions,
            explanations,
            accepted: score >= state.config.sensitivity,
            rejected: None,
        })
    }

    /// Hot-swap configuration; invalid configs leave the current one in place
    pub fn update_config(&self, mut config: ScorerConfig) -> Result<(), ScorerError> {
        config.validate()?;
        config.weights = Weights::from_array(config.weights.as_array())
            .map_err(|e| ScorerError::InvalidConfig(e.to_string()))?;

        let mut state = self.lock();
        state
            .context
            .reconfigure(config.context_window_secs, config.max_context);
        state.patterns.set_max_patterns(config.max_patterns);
        tracing::info!(
            sensitivity = config.sensitivity,
            mode = ?config.mode,
            "Scorer configuration updated"
        );
        state.config = config;
        Ok(())
    }

    pub fn config(&self) -> ScorerConfig {
        self.lock().config.clone()
    }

    /// Combination under the current mode and constants, for scoring
    /// stored dimensions with alternative weights
    pub fn score_function(&self) -> impl Fn(&Weights, &CoherenceDimensions) -> f64 + Send + Sync {
        let config = self.config();
        move |weights: &Weights, dimensions: &CoherenceDimensions| -> f64 {
            let mut dimensions = *dimensions;
            combine(&mut dimensions, weights, &config).unwrap_or(0.0)
        }
    }

    pub fn weights(&self) -> Weights {
        self.lock().config.weights
    }

    /// Replace the weight vector (normalized)
    pub fn set_weights(&self, weights: Weights) -> Result<Weights, ScorerError> {
        let weights = Weights::from_array(weights.as_array())
            .map_err(|e| ScorerError::InvalidConfig(e.to_string()))?;
        self.lock().config.weights = weights;
        Ok(weights)
    }

    pub fn sensitivity(&self) -> f64 {
        self.lock().config.sensitivity
    }

    /// Pattern table snapshot, most frequent first
    pub fn patterns(&self) -> Vec<Pattern> {
        self.lock().patterns.snapshot()
    }

    /// Attach cluster ids from analytics; returns how many patterns matched
    pub fn label_patterns(&self, assignments: &[(PatternSignature, usize)]) -> usize {
        self.lock().patterns.label(assignments)
    }

    pub fn context_len(&self) -> usize {
        self.lock().context.len()
    }
}
