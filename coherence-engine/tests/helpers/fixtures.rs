//! Data builders shared by the integration tests

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use coherence_common::{CoherenceDimensions, DataPoint, FilteredDataPoint};
use coherence_engine::EngineConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};

pub fn base_time() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

/// Item body that scores comfortably above a 0.3 threshold
pub fn rich_item(i: usize) -> Value {
    json!({
        "id": i,
        "title": format!("Community update {}", i),
        "body": "We must help and protect our community together, with hope and trust for everyone",
        "author": "ana",
        "url": format!("http://example.com/update/{}", i),
        "created": 1_700_000_000 + i as i64,
        "likes": 40,
    })
}

pub fn data_point(i: usize, source: &str) -> DataPoint {
    DataPoint::new(
        format!("{}:{}", source, i),
        source,
        base_time() + ChronoDuration::minutes(i as i64),
        rich_item(i),
    )
}

/// Accepted point with uniform dimensions equal to `score`
pub fn filtered_point(i: usize, source: &str, score: f64) -> FilteredDataPoint {
    FilteredDataPoint {
        point: data_point(i, source),
        coherence_score: score,
        dimensions: CoherenceDimensions::new(score, score, score, score),
        explanations: Vec::new(),
    }
}

/// `n` draws from N(mean, sd) via Box-Muller, clamped to [0, 1]
pub fn normal_scores(n: usize, mean: f64, sd: f64, seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
            let u2: f64 = rng.gen();
            let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
            (mean + sd * z).clamp(0.0, 1.0)
        })
        .collect()
}

/// Defaults tuned for fast, deterministic tests
pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.scorer.sensitivity = 0.3;
    config.batch.batch_size = 10;
    config.batch.batch_timeout_ms = 50;
    config.resilience.max_attempts = 1;
    config.collector.retry_base_delay_ms = 10;
    config.collector.request_timeout_ms = 2_000;
    config
}
