//! # Coherence Common Library
//!
//! Shared code for the coherence ingest engine:
//! - Error type and result alias
//! - Domain model (data points, dimensions, weights)
//! - Event types (CoherenceEvent enum) and the EventBus
//! - Storage interface plus in-memory and SQLite adapters
//! - TOML configuration helpers and logging initialization
//! - Time utilities

pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod model;
pub mod storage;
pub mod time;

pub use error::{Error, Result};
pub use model::{
    CoherenceDimensions, DataPoint, Dimension, FilteredDataPoint, Weights,
};
