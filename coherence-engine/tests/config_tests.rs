//! Loading engine configuration from disk

use coherence_common::config::write_toml_file;
use coherence_engine::services::collector::{EndpointConfig, SourceAuth, SourceDescriptor};
use coherence_engine::services::scorer::CombinationMode;
use coherence_engine::utils::EvictionPolicy;
use coherence_engine::{EngineConfig, EngineError, StorageBackend};
use std::fs;
use tempfile::TempDir;

const FULL: &str = r#"
[logging]
level = "coherence_engine=debug,info"
json = true

[collector]
max_concurrent = 2
max_retries = 1

[scorer]
sensitivity = 0.45
mode = "compounding"
km = 0.4
ki = 3.0
weights = { psi = 2.0, rho = 1.0, q = 1.0, f = 0.0 }

[analytics]
seed = 99
anomaly = { min_votes = 2 }
forecast = { max_horizon = 48 }
clustering = { k = 6 }

[optimizer]
min_feedback = 25

[resilience]
failure_threshold = 4
cooldown_ms = 10000

[cache]
max_entries = 500
policy = "oldest_access"

[batch]
batch_size = 50
batch_timeout_ms = 1000

[pipeline]
implicit_anomaly_feedback = true
cache_ttl_ms = 60000

[storage]
backend = "sqlite"
sqlite_url = "sqlite::memory:"

[[sources]]
id = "news"
name = "News API"
base_url = "https://news.example.com/v2"
auth = { type = "api_key", header = "x-api-key", value = "k" }
rate_limits = { requests_per_minute = 60 }

[[sources.endpoints]]
path = "/top"
refresh_interval_secs = 30.0
params = { country = "us", limit = 50 }

[[sources]]
id = "forum"
base_url = "http://forum.local"
endpoints = [{ path = "/latest" }]
"#;

#[test]
fn test_load_full_document() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("engine.toml");
    fs::write(&path, FULL).unwrap();

    let config = EngineConfig::load(&path).unwrap();
    assert!(config.logging.json);
    assert_eq!(config.collector.max_retries, 1);
    assert_eq!(config.scorer.mode, CombinationMode::Compounding);
    assert_eq!(config.scorer.sensitivity, 0.45);
    assert_eq!(config.analytics.seed, 99);
    assert_eq!(config.analytics.anomaly.min_votes, 2);
    // unspecified nested fields keep their defaults
    assert_eq!(config.analytics.anomaly.min_history, 10);
    assert_eq!(config.analytics.clustering.k, 6);
    assert_eq!(config.optimizer.min_feedback, 25);
    assert_eq!(config.resilience.failure_threshold, 4);
    assert_eq!(config.resilience.success_threshold, 2);
    assert_eq!(config.cache.policy, EvictionPolicy::OldestAccess);
    assert_eq!(config.batch.batch_size, 50);
    assert_eq!(config.pipeline.cache_ttl_ms, Some(60_000));
    assert!(config.pipeline.implicit_anomaly_feedback);
    assert_eq!(config.storage.backend, StorageBackend::Sqlite);

    assert_eq!(config.sources.len(), 2);
    let news = &config.sources[0];
    assert_eq!(news.name, "News API");
    assert!(matches!(news.auth, Some(SourceAuth::ApiKey { .. })));
    assert_eq!(news.endpoints[0].params["limit"], 50);
    assert_eq!(config.sources[1].endpoints[0].refresh_interval_secs, 300.0);
}

#[test]
fn test_written_config_loads_back() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("conf").join("engine.toml");

    let mut config = EngineConfig::default();
    config.scorer.sensitivity = 0.6;
    config.batch.batch_size = 20;
    config.sources.push(SourceDescriptor::new(
        "feed",
        "http://localhost:9000",
        vec![EndpointConfig::get("/items", 15.0)],
    ));
    write_toml_file(&config, &path).unwrap();

    let loaded = EngineConfig::load(&path).unwrap();
    assert_eq!(loaded.scorer, config.scorer);
    assert_eq!(loaded.batch, config.batch);
    assert_eq!(loaded.sources[0].id, "feed");
    assert_eq!(loaded.sources[0].endpoints[0].refresh_interval_secs, 15.0);
}

#[test]
fn test_invalid_documents_rejected() {
    let dir = TempDir::new().unwrap();
    let cases = [
        ("missing.toml", None),
        ("syntax.toml", Some("[scorer\nsensitivity = 0.5")),
        ("range.toml", Some("[scorer]\nsensitivity = 1.5\n")),
        ("weights.toml", Some("[scorer]\nweights = { psi = 0.0, rho = 0.0, q = 0.0, f = 0.0 }\n")),
        ("source.toml", Some("[[sources]]\nid = \"x\"\nbase_url = \"ftp://host\"\nendpoints = [{ path = \"/a\" }]\n")),
        ("resilience.toml", Some("[resilience]\nmax_attempts = 0\n")),
    ];

    for (name, content) in cases {
        let path = dir.path().join(name);
        if let Some(content) = content {
            fs::write(&path, content).unwrap();
        }
        assert!(EngineConfig::load(&path).is_err(), "{} should be rejected", name);
    }

    let err = EngineConfig::from_toml_str("[resilience]\nmax_attempts = 0\n").unwrap_err();
    assert!(matches!(err, EngineError::InvalidConfig(_)));
}
