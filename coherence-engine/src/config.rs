//! Engine configuration
//!
//! One TOML document with a section per component. Every field has a
//! default, so an empty file is a valid configuration:
//!
//! ```toml
//! [scorer]
//! sensitivity = 0.6
//! mode = "compounding"
//!
//! [storage]
//! backend = "sqlite"
//! sqlite_url = "sqlite://coherence.db?mode=rwc"
//!
//! [[sources]]
//! id = "news"
//! base_url = "https://api.example.com"
//! endpoints = [{ path = "/top", refresh_interval_secs = 60 }]
//! ```

use crate::error::{EngineError, EngineResult};
use crate::services::analytics::AnalyticsConfig;
use crate::services::collector::{CollectorConfig, SourceDescriptor};
use crate::services::optimizer::OptimizerConfig;
use crate::services::orchestrator::PipelineConfig;
use crate::services::scorer::ScorerConfig;
use crate::utils::{BatchConfig, CacheConfig, ResilienceConfig};
use coherence_common::config::{parse_toml, read_toml_file, LoggingConfig};
use coherence_common::storage::{MemoryStorage, Storage};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

/// Storage backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "default_sqlite_url")]
    pub sqlite_url: String,
}

fn default_sqlite_url() -> String {
    "sqlite://coherence.db?mode=rwc".to_string()
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            sqlite_url: default_sqlite_url(),
        }
    }
}

impl StorageSettings {
    /// Instantiate the configured backend (not yet connected)
    pub fn build(&self) -> Arc<dyn Storage> {
        match self.backend {
            StorageBackend::Memory => Arc::new(MemoryStorage::new()),
            StorageBackend::Sqlite => Arc::new(coherence_common::storage::SqliteStorage::new(
                self.sqlite_url.clone(),
            )),
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub scorer: ScorerConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub resilience: ResilienceConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Sources registered at startup
    #[serde(default)]
    pub sources: Vec<SourceDescriptor>,
}

impl EngineConfig {
    /// Parse and validate TOML text
    pub fn from_toml_str(content: &str) -> EngineResult<Self> {
        let config: Self = parse_toml(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn load(path: &Path) -> EngineResult<Self> {
        let config: Self = read_toml_file(path)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), sources = config.sources.len(), "Configuration loaded");
        Ok(config)
    }

    /// Reject configurations that would misbehave at runtime
    pub fn validate(&self) -> EngineResult<()> {
        self.collector.validate().map_err(EngineError::InvalidConfig)?;
        self.scorer.validate()?;
        self.analytics.validate()?;
        self.optimizer.validate()?;
        self.resilience.validate().map_err(EngineError::InvalidConfig)?;
        self.cache.validate().map_err(EngineError::InvalidConfig)?;
        self.batch.validate().map_err(EngineError::InvalidConfig)?;
        self.pipeline.validate().map_err(EngineError::InvalidConfig)?;

        let mut seen = HashSet::new();
        for source in &self.sources {
            source.validate()?;
            if !seen.insert(source.id.as_str()) {
                return Err(EngineError::InvalidConfig(format!(
                    "duplicate source id '{}'",
                    source.id
                )));
            }
        }
        Ok(())
    }
}
