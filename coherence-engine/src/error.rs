//! Error types for coherence-engine
//!
//! Component errors live next to their components (`CollectorError`,
//! `ScorerError`, ...); `EngineError` is what the orchestrator surfaces.

use crate::services::analytics::AnalyticsError;
use crate::services::collector::CollectorError;
use crate::services::optimizer::OptimizerError;
use crate::services::scorer::ScorerError;
use crate::utils::BatchError;
use thiserror::Error;

/// Orchestrator-level error
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration rejected at load or validation time
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Storage could not be connected and memory fallback is disabled
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Operation requires a running engine
    #[error("Engine is not running")]
    NotRunning,

    #[error("Collector error: {0}")]
    Collector(#[from] CollectorError),

    #[error("Scorer error: {0}")]
    Scorer(#[from] ScorerError),

    #[error("Analytics error: {0}")]
    Analytics(#[from] AnalyticsError),

    #[error("Optimizer error: {0}")]
    Optimizer(#[from] OptimizerError),

    #[error("Batch error: {0}")]
    Batch(#[from] BatchError),

    /// coherence-common error
    #[error("Common error: {0}")]
    Common(#[from] coherence_common::Error),
}

/// Result alias for orchestrator operations
pub type EngineResult<T> = std::result::Result<T, EngineError>;
