//! Cross-cutting runtime utilities for coherence-engine

pub mod batch;
pub mod cache;
pub mod resilience;

pub use batch::{BatchConfig, BatchError, BatchProcessor, BatchSink, BatchStats};
pub use cache::{CacheConfig, CacheError, CacheManager, CacheStats, EvictionPolicy};
pub use resilience::{
    CircuitState, CircuitStatus, ResilienceConfig, ResilienceError, ResilienceRegistry, Retryable,
};
