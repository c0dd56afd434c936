//! Scorer memory: the time-windowed context buffer and the pattern table
//!
//! Both are fed only by accepted points and both influence later scores, so
//! the scorer is order-dependent.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use coherence_common::model::CoherenceDimensions;
use coherence_common::{DataPoint, FilteredDataPoint};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};

/// Object keys included in a content shape
const MAX_SHAPE_KEYS: usize = 8;

/// Coarse structural fingerprint of an item's content
pub fn content_shape(content: &Value) -> String {
    match content {
        Value::Object(map) => {
            let mut keys: Vec<&str> = map.keys().map(String::as_str).collect();
            keys.sort_unstable();
            keys.truncate(MAX_SHAPE_KEYS);
            format!("obj:{}", keys.join(","))
        }
        Value::Array(_) => "array".to_string(),
        Value::String(_) => "text".to_string(),
        Value::Number(_) => "number".to_string(),
        Value::Bool(_) => "bool".to_string(),
        Value::Null => "null".to_string(),
    }
}

fn bucket(value: f64) -> char {
    if value < 1.0 / 3.0 {
        'L'
    } else if value < 2.0 / 3.0 {
        'M'
    } else {
        'H'
    }
}

/// Low/medium/high bucket per dimension, e.g. `H-M-L-M`
pub fn dimension_profile(dimensions: &CoherenceDimensions) -> String {
    let [psi, rho, q, f] = dimensions.as_array();
    format!("{}-{}-{}-{}", bucket(psi), bucket(rho), bucket(q), bucket(f))
}

/// Pattern identity: source, content shape and dimension profile
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PatternSignature {
    pub source: String,
    pub shape: String,
    pub profile: String,
}

impl PatternSignature {
    /// Signature of an accepted point
    pub fn of(filtered: &FilteredDataPoint) -> Self {
        Self {
            source: filtered.point.source.clone(),
            shape: content_shape(&filtered.point.content),
            profile: dimension_profile(&filtered.dimensions),
        }
    }
}

/// A recurring signature with its running statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub signature: PatternSignature,
    pub frequency: u64,
    pub average_coherence: f64,
    pub last_seen: DateTime<Utc>,
    pub cluster_id: Option<usize>,
}

/// Frequency table of accepted-point signatures, capped at `max_patterns`
#[derive(Debug, Clone)]
pub struct PatternTable {
    max_patterns: usize,
    patterns: HashMap<PatternSignature, Pattern>,
    /// Frequency summed per (source, shape), read by the ρ calculator
    shape_counts: HashMap<(String, String), u64>,
}

impl PatternTable {
    pub fn new(max_patterns: usize) -> Self {
        Self {
            max_patterns: max_patterns.max(1),
            patterns: HashMap::new(),
            shape_counts: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Occurrences of this source/shape across all profiles
    pub fn shape_frequency(&self, source: &str, shape: &str) -> u64 {
        self.shape_counts
            .get(&(source.to_string(), shape.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn get(&self, signature: &PatternSignature) -> Option<&Pattern> {
        self.patterns.get(signature)
    }

    /// Record one accepted occurrence
    pub fn record(&mut self, point: &DataPoint, profile: String, score: f64) {
        let signature = PatternSignature {
            source: point.source.clone(),
            shape: content_shape(&point.content),
            profile,
        };
        *self
            .shape_counts
            .entry((signature.source.clone(), signature.shape.clone()))
            .or_insert(0) += 1;

        match self.patterns.get_mut(&signature) {
            Some(pattern) => {
                pattern.frequency += 1;
                pattern.average_coherence +=
                    (score - pattern.average_coherence) / pattern.frequency as f64;
                if point.timestamp > pattern.last_seen {
                    pattern.last_seen = point.timestamp;
                }
            }
            None => {
                self.patterns.insert(
                    signature.clone(),
                    Pattern {
                        signature,
                        frequency: 1,
                        average_coherence: score,
                        last_seen: point.timestamp,
                        cluster_id: None,
                    },
                );
                self.evict_to(self.max_patterns);
            }
        }
    }

    /// Drop least frequent patterns (oldest first among equals) until `limit` remain
    fn evict_to(&mut self, limit: usize) {
        while self.patterns.len() > limit {
            let victim = self
                .patterns
                .values()
                .min_by(|a, b| {
                    a.frequency
                        .cmp(&b.frequency)
                        .then(a.last_seen.cmp(&b.last_seen))
                })
                .map(|p| p.signature.clone());
            let Some(victim) = victim else {
                break;
            };
            if let Some(evicted) = self.patterns.remove(&victim) {
                let key = (evicted.signature.source, evicted.signature.shape);
                if let Some(count) = self.shape_counts.get_mut(&key) {
                    *count = count.saturating_sub(evicted.frequency);
                    if *count == 0 {
                        self.shape_counts.remove(&key);
                    }
                }
            }
        }
    }

    pub fn set_max_patterns(&mut self, max_patterns: usize) {
        self.max_patterns = max_patterns.max(1);
        self.evict_to(self.max_patterns);
    }

    /// Attach cluster ids; returns how many known patterns were labelled
    pub fn label(&mut self, assignments: &[(PatternSignature, usize)]) -> usize {
        assignments
            .iter()
            .filter(|(signature, cluster)| match self.patterns.get_mut(signature) {
                Some(pattern) => {
                    pattern.cluster_id = Some(*cluster);
                    true
                }
                None => false,
            })
            .count()
    }

    /// Snapshot, most frequent first
    pub fn snapshot(&self) -> Vec<Pattern> {
        let mut all: Vec<Pattern> = self.patterns.values().cloned().collect();
        all.sort_by(|a, b| {
            b.frequency
                .cmp(&a.frequency)
                .then_with(|| a.signature.cmp(&b.signature))
        });
        all
    }
}

#[derive(Debug, Clone)]
struct ContextEntry {
    source: String,
    timestamp: DateTime<Utc>,
    score: f64,
}

/// Recent accepted points, windowed on data-point timestamps
#[derive(Debug, Clone)]
pub struct ContextBuffer {
    window: ChronoDuration,
    max_entries: usize,
    entries: VecDeque<ContextEntry>,
    latest: Option<DateTime<Utc>>,
}

/// Per-source summary of the context window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceContext {
    pub count: usize,
    pub mean_score: f64,
}

impl ContextBuffer {
    pub fn new(window_secs: u64, max_entries: usize) -> Self {
        Self {
            window: ChronoDuration::seconds(window_secs.min(i64::MAX as u64) as i64),
            max_entries: max_entries.max(1),
            entries: VecDeque::new(),
            latest: None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn push(&mut self, source: &str, timestamp: DateTime<Utc>, score: f64) {
        self.entries.push_back(ContextEntry {
            source: source.to_string(),
            timestamp,
            score,
        });
        self.latest = Some(self.latest.map_or(timestamp, |l| l.max(timestamp)));
        self.prune();
    }

    pub fn reconfigure(&mut self, window_secs: u64, max_entries: usize) {
        self.window = ChronoDuration::seconds(window_secs.min(i64::MAX as u64) as i64);
        self.max_entries = max_entries.max(1);
        self.prune();
    }

    fn prune(&mut self) {
        if let Some(latest) = self.latest {
            let cutoff = latest - self.window;
            self.entries.retain(|e| e.timestamp >= cutoff);
        }
        while self.entries.len() > self.max_entries {
            self.entries.pop_front();
        }
    }

    pub fn for_source(&self, source: &str) -> SourceContext {
        let (count, total) = self
            .entries
            .iter()
            .filter(|e| e.source == source)
            .fold((0usize, 0.0f64), |(n, sum), e| (n + 1, sum + e.score));
        SourceContext {
            count,
            mean_score: if count == 0 { 0.0 } else { total / count as f64 },
        }
    }
}
