//! coherence-engine library interface
//!
//! Exposes the engine components for embedding and integration testing.

pub mod config;
pub mod error;
pub mod services;
pub mod utils;

pub use crate::config::{EngineConfig, StorageBackend, StorageSettings};
pub use crate::error::{EngineError, EngineResult};
pub use crate::services::{HealthSnapshot, Orchestrator};
