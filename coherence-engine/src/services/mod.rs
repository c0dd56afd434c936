//! Engine components
//!
//! - `collector`: multi-source HTTP polling
//! - `scorer`: four-dimension coherence scoring and filtering
//! - `analytics`: anomaly ensemble, forecasting, pattern clustering
//! - `optimizer`: feedback-driven weight tuning
//! - `orchestrator`: wiring, background tasks and health

pub mod analytics;
pub mod collector;
pub mod optimizer;
pub mod orchestrator;
pub mod scorer;

pub use analytics::{AnalyticsConfig, AnalyticsEngine, AnalyticsError, AnalyticsStats, Forecast};
pub use collector::{
    Collector, CollectorConfig, CollectorError, EndpointConfig, SourceAuth, SourceDescriptor,
};
pub use optimizer::{Feedback, OptimizationOutcome, OptimizerConfig, OptimizerError, WeightOptimizer};
pub use orchestrator::{EngineContext, HealthSnapshot, Orchestrator, PipelineConfig};
pub use scorer::{CombinationMode, Scorer, ScorerConfig, ScorerError};
