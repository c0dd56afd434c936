//! Domain model shared by the collector, scorer, analytics and storage layers

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Object fields that carry the human-readable body of an item
pub const TEXT_FIELDS: &[&str] = &[
    "title",
    "text",
    "body",
    "content",
    "description",
    "summary",
    "selftext",
    "message",
];

/// One item extracted from a source response
///
/// Produced by the collector and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// Stable identifier (source-prefixed natural id, or a UUID)
    pub id: String,
    /// Source descriptor id
    pub source: String,
    /// Collection time
    pub timestamp: DateTime<Utc>,
    /// Raw item payload
    pub content: Value,
    /// Collector-supplied metadata (endpoint, status code, etc.)
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl DataPoint {
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        timestamp: DateTime<Utc>,
        content: Value,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            timestamp,
            content,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Boundary validation: an item must carry an id and a source
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::InvalidInput("data point id is empty".to_string()));
        }
        if self.source.trim().is_empty() {
            return Err(Error::InvalidInput(format!(
                "data point {} has no source",
                self.id
            )));
        }
        Ok(())
    }

    /// Textual body of the item
    ///
    /// Strings are returned as-is; objects contribute their known text fields
    /// joined by newlines; anything else falls back to its JSON rendering.
    pub fn text(&self) -> String {
        match &self.content {
            Value::String(s) => s.clone(),
            Value::Object(map) => {
                let parts: Vec<&str> = TEXT_FIELDS
                    .iter()
                    .filter_map(|field| map.get(*field).and_then(Value::as_str))
                    .filter(|s| !s.trim().is_empty())
                    .collect();
                parts.join("\n")
            }
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// The four semantic axes of a coherence score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    /// ψ: clarity / internal consistency
    Psi,
    /// ρ: accumulated pattern wisdom
    Rho,
    /// q: moral / emotional activation
    Q,
    /// f: social belonging
    F,
}

impl Dimension {
    pub const ALL: [Dimension; 4] = [Dimension::Psi, Dimension::Rho, Dimension::Q, Dimension::F];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Psi => "psi",
            Dimension::Rho => "rho",
            Dimension::Q => "q",
            Dimension::F => "f",
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Dimension::Psi => 0,
            Dimension::Rho => 1,
            Dimension::Q => 2,
            Dimension::F => 3,
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Clamp a heuristic output into [0, 1], mapping NaN to 0
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Per-item dimension values, all in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CoherenceDimensions {
    pub psi: f64,
    pub rho: f64,
    /// Raw activation before the inhibition transform
    pub q_raw: f64,
    /// Activation after `q / (km + q + q²/ki)`; equals `q_raw` in weighted mode
    pub q_optimized: f64,
    pub f: f64,
}

impl CoherenceDimensions {
    /// Build from raw values, clamping every component
    pub fn new(psi: f64, rho: f64, q_raw: f64, f: f64) -> Self {
        let q_raw = clamp_unit(q_raw);
        Self {
            psi: clamp_unit(psi),
            rho: clamp_unit(rho),
            q_raw,
            q_optimized: q_raw,
            f: clamp_unit(f),
        }
    }

    /// Value used for weighting (q uses the optimized form)
    pub fn get(&self, dimension: Dimension) -> f64 {
        match dimension {
            Dimension::Psi => self.psi,
            Dimension::Rho => self.rho,
            Dimension::Q => self.q_optimized,
            Dimension::F => self.f,
        }
    }

    pub fn set(&mut self, dimension: Dimension, value: f64) {
        let value = clamp_unit(value);
        match dimension {
            Dimension::Psi => self.psi = value,
            Dimension::Rho => self.rho = value,
            Dimension::Q => {
                self.q_raw = value;
                self.q_optimized = value;
            }
            Dimension::F => self.f = value,
        }
    }

    pub fn as_array(&self) -> [f64; 4] {
        [self.psi, self.rho, self.q_optimized, self.f]
    }

    /// Re-clamp every component (after enhancement steps)
    pub fn clamped(self) -> Self {
        Self {
            psi: clamp_unit(self.psi),
            rho: clamp_unit(self.rho),
            q_raw: clamp_unit(self.q_raw),
            q_optimized: clamp_unit(self.q_optimized),
            f: clamp_unit(self.f),
        }
    }
}

/// A data point that cleared the sensitivity threshold
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilteredDataPoint {
    pub point: DataPoint,
    pub coherence_score: f64,
    pub dimensions: CoherenceDimensions,
    #[serde(default)]
    pub explanations: Vec<String>,
}

impl FilteredDataPoint {
    pub fn id(&self) -> &str {
        &self.point.id
    }

    pub fn source(&self) -> &str {
        &self.point.source
    }

    /// Feature vector `[score, ψ, ρ, q, f]` used by analytics
    pub fn feature_vector(&self) -> [f64; 5] {
        let d = &self.dimensions;
        [self.coherence_score, d.psi, d.rho, d.q_optimized, d.f]
    }
}

/// Minimum weight any dimension keeps after renormalization
pub const MIN_WEIGHT: f64 = 0.01;

/// Dimension weights, normalized to sum to 1
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Weights {
    pub psi: f64,
    pub rho: f64,
    pub q: f64,
    pub f: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Self::equal()
    }
}

impl Weights {
    pub fn equal() -> Self {
        Self {
            psi: 0.25,
            rho: 0.25,
            q: 0.25,
            f: 0.25,
        }
    }

    /// Build and normalize; rejects negative, non-finite or all-zero input
    pub fn new(psi: f64, rho: f64, q: f64, f: f64) -> Result<Self> {
        Self::from_array([psi, rho, q, f])
    }

    pub fn from_array(values: [f64; 4]) -> Result<Self> {
        if values.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(Error::InvalidInput(format!(
                "weights must be finite and non-negative: {:?}",
                values
            )));
        }
        let sum: f64 = values.iter().sum();
        if sum <= f64::EPSILON {
            return Err(Error::InvalidInput("weights sum to zero".to_string()));
        }
        Ok(Self {
            psi: values[0] / sum,
            rho: values[1] / sum,
            q: values[2] / sum,
            f: values[3] / sum,
        })
    }

    pub fn as_array(&self) -> [f64; 4] {
        [self.psi, self.rho, self.q, self.f]
    }

    pub fn get(&self, dimension: Dimension) -> f64 {
        self.as_array()[dimension.index()]
    }

    pub fn sum(&self) -> f64 {
        self.as_array().iter().sum()
    }

    /// Floor each weight at `MIN_WEIGHT` and rescale to sum to 1
    ///
    /// Non-finite components are treated as the floor, so the result is
    /// always a valid weight vector.
    pub fn renormalized(values: [f64; 4]) -> Self {
        let floored = values.map(|v| if v.is_finite() { v.max(MIN_WEIGHT) } else { MIN_WEIGHT });
        let sum: f64 = floored.iter().sum();
        Self {
            psi: floored[0] / sum,
            rho: floored[1] / sum,
            q: floored[2] / sum,
            f: floored[3] / sum,
        }
    }

    /// Weighted sum of the dimensions
    pub fn apply(&self, dimensions: &CoherenceDimensions) -> f64 {
        Dimension::ALL
            .iter()
            .map(|d| self.get(*d) * dimensions.get(*d))
            .sum()
    }
}
