//! coherence-engine - multi-source coherence ingest
//!
//! Usage: `coherence-engine [CONFIG_PATH]`
//!
//! Without an argument the configuration is looked up in the user config
//! directory, then `/etc/coherence`; when none exists the defaults are used.

use anyhow::{Context, Result};
use coherence_common::config::resolve_config_path;
use coherence_common::logging::init_tracing;
use coherence_engine::{EngineConfig, Orchestrator};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Interval between health log lines
const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    let explicit = std::env::args_os().nth(1).map(PathBuf::from);
    let config = match resolve_config_path(explicit.as_deref()) {
        Ok(path) => EngineConfig::load(&path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        Err(_) if explicit.is_none() => EngineConfig::default(),
        Err(e) => return Err(e.into()),
    };

    init_tracing(&config.logging)?;
    info!("Starting coherence-engine");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        sources = config.sources.len(),
        backend = ?config.storage.backend,
        sensitivity = config.scorer.sensitivity,
        "Configuration loaded"
    );

    let storage = config.storage.build();
    let engine = Orchestrator::new(config, storage)?;
    engine.start().await?;

    let mut health_timer = tokio::time::interval(HEALTH_LOG_INTERVAL);
    health_timer.tick().await;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "Signal handler failed, shutting down");
                }
                break;
            }
            _ = health_timer.tick() => {
                let health = engine.health().await;
                info!("{}", health.display_string());
            }
        }
    }

    info!("Shutting down");
    engine.stop().await;
    Ok(())
}
