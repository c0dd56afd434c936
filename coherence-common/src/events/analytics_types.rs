//! Analytics payload types carried by events

use crate::model::FilteredDataPoint;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Anomaly classification, derived from which detector families fired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    /// Only value-distribution detectors fired
    Point,
    /// Time-of-day / seasonal detectors fired
    Contextual,
    /// Density or dimension-pattern detectors fired
    Collective,
}

impl AnomalyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyKind::Point => "point",
            AnomalyKind::Contextual => "contextual",
            AnomalyKind::Collective => "collective",
        }
    }
}

/// A flagged data point with the ensemble's evidence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: Uuid,
    pub point: FilteredDataPoint,
    /// Normalized score per detector that ran
    pub method_scores: BTreeMap<String, f64>,
    /// Detectors that voted "anomalous"
    pub flagged_by: Vec<String>,
    pub ensemble_score: f64,
    pub kind: AnomalyKind,
    pub explanation: String,
    pub detected_at: DateTime<Utc>,
}

impl Anomaly {
    pub fn votes(&self) -> usize {
        self.flagged_by.len()
    }
}

/// Summary of one clustering pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSummary {
    pub cluster_id: usize,
    pub centroid: Vec<f64>,
    pub size: usize,
}
