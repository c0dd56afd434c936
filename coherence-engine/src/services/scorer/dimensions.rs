//! Dimension calculators
//!
//! Each calculator maps a data point to one bounded dimension value. The
//! defaults are keyword and structure heuristics; only boundedness and
//! monotonicity matter, so they can be swapped through the registry.

use super::context::{content_shape, ContextBuffer, PatternTable};
use coherence_common::model::{clamp_unit, Dimension};
use coherence_common::DataPoint;
use serde_json::Value;

/// Read-only scorer state visible to calculators and enhancements
pub struct ScoringContext<'a> {
    pub patterns: &'a PatternTable,
    pub context: &'a ContextBuffer,
}

/// One computed dimension value with its human-readable reason
#[derive(Debug, Clone, PartialEq)]
pub struct DimensionScore {
    pub value: f64,
    pub explanation: String,
}

impl DimensionScore {
    pub fn new(value: f64, explanation: impl Into<String>) -> Self {
        Self {
            value: clamp_unit(value),
            explanation: explanation.into(),
        }
    }
}

/// Computes one coherence dimension
pub trait DimensionCalculator: Send + Sync {
    fn dimension(&self) -> Dimension;

    fn name(&self) -> &'static str;

    fn calculate(&self, point: &DataPoint, ctx: &ScoringContext<'_>) -> DimensionScore;
}

fn logistic(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

fn lowercase_words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

fn has_any(map: &serde_json::Map<String, Value>, fields: &[&str]) -> bool {
    fields.iter().any(|f| match map.get(*f) {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(_) => true,
    })
}

/// ψ: structural completeness of the item
pub struct StructuralCompleteness;

const STRUCTURE_GROUPS: &[&[&str]] = &[
    &["id", "uuid", "guid", "key"],
    &["title", "headline", "name", "subject"],
    &["text", "body", "content", "description", "summary", "selftext", "message"],
    &["author", "by", "user", "username", "creator"],
    &["url", "link", "permalink", "href"],
    &["created", "created_at", "created_utc", "timestamp", "time", "date", "published"],
];

impl DimensionCalculator for StructuralCompleteness {
    fn dimension(&self) -> Dimension {
        Dimension::Psi
    }

    fn name(&self) -> &'static str {
        "structural-completeness"
    }

    fn calculate(&self, point: &DataPoint, _ctx: &ScoringContext<'_>) -> DimensionScore {
        let text = point.text();
        let words = word_count(&text);
        let length_score = (words as f64 / 40.0).min(1.0);

        match &point.content {
            Value::Object(map) => {
                let present = STRUCTURE_GROUPS.iter().filter(|g| has_any(map, g)).count();
                let completeness = present as f64 / STRUCTURE_GROUPS.len() as f64;
                DimensionScore::new(
                    0.6 * completeness + 0.4 * length_score,
                    format!("{}/{} fields, {} words", present, STRUCTURE_GROUPS.len(), words),
                )
            }
            Value::String(_) => {
                let terminated = text.trim_end().ends_with(['.', '!', '?']);
                let bonus = if terminated { 0.2 } else { 0.0 };
                DimensionScore::new(0.2 + 0.6 * length_score + bonus, format!("plain text, {} words", words))
            }
            Value::Null => DimensionScore::new(0.0, "empty"),
            _ => DimensionScore::new(0.1, "unstructured value"),
        }
    }
}

/// ρ: how often this source has produced items of this shape, on a logistic curve
pub struct PatternFrequency {
    /// Frequency at which ρ crosses 0.5
    pub midpoint: f64,
    pub scale: f64,
}

impl Default for PatternFrequency {
    fn default() -> Self {
        Self {
            midpoint: 3.0,
            scale: 1.5,
        }
    }
}

impl DimensionCalculator for PatternFrequency {
    fn dimension(&self) -> Dimension {
        Dimension::Rho
    }

    fn name(&self) -> &'static str {
        "pattern-frequency"
    }

    fn calculate(&self, point: &DataPoint, ctx: &ScoringContext<'_>) -> DimensionScore {
        let shape = content_shape(&point.content);
        let frequency = ctx.patterns.shape_frequency(&point.source, &shape);
        let value = logistic((frequency as f64 - self.midpoint) / self.scale);
        DimensionScore::new(value, format!("seen {} time(s)", frequency))
    }
}

/// q: moral and emotional activation from keyword hits
pub struct KeywordActivation {
    pub keywords: Vec<&'static str>,
}

impl Default for KeywordActivation {
    fn default() -> Self {
        Self {
            keywords: vec![
                "justice", "fair", "unfair", "right", "wrong", "harm", "care", "help", "protect",
                "love", "hate", "fear", "hope", "angry", "outrage", "crisis", "urgent", "must",
                "should", "truth", "freedom", "danger", "safe", "trust", "betray", "proud",
                "shame", "grief", "joy",
            ],
        }
    }
}

impl DimensionCalculator for KeywordActivation {
    fn dimension(&self) -> Dimension {
        Dimension::Q
    }

    fn name(&self) -> &'static str {
        "keyword-activation"
    }

    fn calculate(&self, point: &DataPoint, _ctx: &ScoringContext<'_>) -> DimensionScore {
        let text = point.text();
        let hits = lowercase_words(&text)
            .iter()
            .filter(|w| self.keywords.contains(&w.as_str()))
            .count();
        let exclamations = text.matches('!').count().min(3);
        let activation = hits as f64 + 0.5 * exclamations as f64;
        DimensionScore::new(
            1.0 - (-activation / 3.0).exp(),
            format!("{} keyword hit(s)", hits),
        )
    }
}

/// f: social signals (engagement counters and collective language)
pub struct SocialSignal;

const ENGAGEMENT_FIELDS: &[&str] = &[
    "score", "ups", "points", "likes", "upvotes", "num_comments", "comments", "descendants",
    "shares", "retweets", "reactions", "replies",
];

const COLLECTIVE_WORDS: &[&str] = &["we", "us", "our", "together", "community", "everyone", "team"];

impl DimensionCalculator for SocialSignal {
    fn dimension(&self) -> Dimension {
        Dimension::F
    }

    fn name(&self) -> &'static str {
        "social-signal"
    }

    fn calculate(&self, point: &DataPoint, _ctx: &ScoringContext<'_>) -> DimensionScore {
        let engagement: f64 = match &point.content {
            Value::Object(map) => ENGAGEMENT_FIELDS
                .iter()
                .filter_map(|f| map.get(*f).and_then(Value::as_f64))
                .filter(|v| v.is_finite() && *v > 0.0)
                .sum(),
            _ => 0.0,
        };
        let engagement_score = ((1.0 + engagement).log10() / 4.0).min(1.0);

        let words = lowercase_words(&point.text());
        let collective = words
            .iter()
            .filter(|w| COLLECTIVE_WORDS.contains(&w.as_str()))
            .count();
        let collective_score = if words.is_empty() {
            0.0
        } else {
            (collective as f64 * 10.0 / words.len() as f64).min(1.0)
        };

        DimensionScore::new(
            0.8 * engagement_score + 0.2 * collective_score,
            format!("engagement {:.0}, {} collective term(s)", engagement, collective),
        )
    }
}
