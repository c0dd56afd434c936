//! Static extension registry
//!
//! Extensions are registered when the scorer is built:
//! - one `DimensionCalculator` per dimension
//! - ordered `PreProcessor`s, any of which may reject a point before scoring
//! - ordered `Enhancement`s that adjust dimensions after calculation

use super::dimensions::{
    DimensionCalculator, KeywordActivation, PatternFrequency, ScoringContext, SocialSignal,
    StructuralCompleteness,
};
use coherence_common::model::{CoherenceDimensions, Dimension};
use coherence_common::DataPoint;
use std::collections::BTreeMap;

/// Pre-scoring gate
pub trait PreProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    /// `Err(reason)` rejects the point; it is counted as dropped
    fn check(&self, point: &DataPoint) -> Result<(), String>;
}

/// Post-calculation adjustment step
pub trait Enhancement: Send + Sync {
    fn name(&self) -> &'static str;

    /// Adjust `dimensions` in place; returns an explanation when the step fired
    fn enhance(
        &self,
        point: &DataPoint,
        dimensions: &mut CoherenceDimensions,
        ctx: &ScoringContext<'_>,
    ) -> Option<String>;
}

/// Rejects items with no textual body and no structure
pub struct EmptyContentFilter;

impl PreProcessor for EmptyContentFilter {
    fn name(&self) -> &'static str {
        "empty-content"
    }

    fn check(&self, point: &DataPoint) -> Result<(), String> {
        let empty = match &point.content {
            serde_json::Value::Null => true,
            serde_json::Value::String(s) => s.trim().is_empty(),
            serde_json::Value::Object(map) => map.is_empty(),
            serde_json::Value::Array(items) => items.is_empty(),
            _ => false,
        };
        if empty {
            Err("empty content".to_string())
        } else {
            Ok(())
        }
    }
}

/// Lifts ψ for sources whose recent accepted items were consistently coherent
pub struct ContextBoostEnhancement {
    pub boost: f64,
    pub min_items: usize,
    pub min_mean: f64,
}

impl Default for ContextBoostEnhancement {
    fn default() -> Self {
        Self {
            boost: 0.05,
            min_items: 3,
            min_mean: 0.7,
        }
    }
}

impl Enhancement for ContextBoostEnhancement {
    fn name(&self) -> &'static str {
        "context-boost"
    }

    fn enhance(
        &self,
        point: &DataPoint,
        dimensions: &mut CoherenceDimensions,
        ctx: &ScoringContext<'_>,
    ) -> Option<String> {
        let recent = ctx.context.for_source(&point.source);
        if recent.count < self.min_items || recent.mean_score < self.min_mean {
            return None;
        }
        dimensions.psi = (dimensions.psi + self.boost).min(1.0);
        Some(format!(
            "context-boost: +{:.2} psi (source mean {:.2} over {})",
            self.boost, recent.mean_score, recent.count
        ))
    }
}

/// Calculators, pre-processors and enhancements used by one scorer
pub struct ExtensionRegistry {
    calculators: BTreeMap<Dimension, Box<dyn DimensionCalculator>>,
    pre_processors: Vec<Box<dyn PreProcessor>>,
    enhancements: Vec<Box<dyn Enhancement>>,
}

impl Default for ExtensionRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ExtensionRegistry {
    /// Default heuristics, the empty-content gate and the context boost
    pub fn with_defaults() -> Self {
        Self {
            calculators: BTreeMap::new(),
            pre_processors: Vec::new(),
            enhancements: Vec::new(),
        }
        .with_calculator(Box::new(StructuralCompleteness))
        .with_calculator(Box::new(PatternFrequency::default()))
        .with_calculator(Box::new(KeywordActivation::default()))
        .with_calculator(Box::new(SocialSignal))
        .with_pre_processor(Box::new(EmptyContentFilter))
        .with_enhancement(Box::new(ContextBoostEnhancement::default()))
    }

    /// Replace the calculator for its dimension
    pub fn with_calculator(mut self, calculator: Box<dyn DimensionCalculator>) -> Self {
        self.calculators.insert(calculator.dimension(), calculator);
        self
    }

    pub fn with_pre_processor(mut self, pre_processor: Box<dyn PreProcessor>) -> Self {
        self.pre_processors.push(pre_processor);
        self
    }

    pub fn with_enhancement(mut self, enhancement: Box<dyn Enhancement>) -> Self {
        self.enhancements.push(enhancement);
        self
    }

    /// Drop every enhancement step
    pub fn without_enhancements(mut self) -> Self {
        self.enhancements.clear();
        self
    }

    pub fn calculator(&self, dimension: Dimension) -> Option<&dyn DimensionCalculator> {
        self.calculators.get(&dimension).map(|c| c.as_ref())
    }

    pub fn pre_processors(&self) -> impl Iterator<Item = &dyn PreProcessor> {
        self.pre_processors.iter().map(|p| p.as_ref())
    }

    pub fn enhancements(&self) -> impl Iterator<Item = &dyn Enhancement> {
        self.enhancements.iter().map(|e| e.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::scorer::context::{ContextBuffer, PatternTable};
    use crate::services::scorer::dimensions::DimensionScore;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn test_defaults_cover_every_dimension() {
        let registry = ExtensionRegistry::with_defaults();
        for dimension in Dimension::ALL {
            assert_eq!(registry.calculator(dimension).map(|c| c.dimension()), Some(dimension));
        }
        assert_eq!(registry.pre_processors().count(), 1);
        assert_eq!(registry.enhancements().count(), 1);
    }

    #[test]
    fn test_with_calculator_replaces() {
        struct Constant;
        impl DimensionCalculator for Constant {
            fn dimension(&self) -> Dimension {
                Dimension::Q
            }
            fn name(&self) -> &'static str {
                "constant"
            }
            fn calculate(&self, _point: &DataPoint, _ctx: &ScoringContext<'_>) -> DimensionScore {
                DimensionScore::new(0.5, "constant")
            }
        }

        let registry = ExtensionRegistry::with_defaults().with_calculator(Box::new(Constant));
        assert_eq!(registry.calculator(Dimension::Q).map(|c| c.name()), Some("constant"));
    }

    #[test]
    fn test_empty_content_filter() {
        let filter = EmptyContentFilter;
        let now = Utc::now();
        assert!(filter.check(&DataPoint::new("a", "s", now, json!(null))).is_err());
        assert!(filter.check(&DataPoint::new("a", "s", now, json!({}))).is_err());
        assert!(filter.check(&DataPoint::new("a", "s", now, json!("  "))).is_err());
        assert!(filter.check(&DataPoint::new("a", "s", now, json!({"title": "x"}))).is_ok());
    }

    #[test]
    fn test_context_boost_requires_history() {
        let boost = ContextBoostEnhancement::default();
        let patterns = PatternTable::new(10);
        let mut context = ContextBuffer::new(3600, 100);
        let point = DataPoint::new("a", "s", Utc::now(), json!("x"));
        let mut dims = CoherenceDimensions::new(0.5, 0.5, 0.5, 0.5);

        let ctx = ScoringContext { patterns: &patterns, context: &context };
        assert!(boost.enhance(&point, &mut dims, &ctx).is_none());

        for _ in 0..3 {
            context.push("s", point.timestamp, 0.9);
        }
        let ctx = ScoringContext { patterns: &patterns, context: &context };
        assert!(boost.enhance(&point, &mut dims, &ctx).is_some());
        assert!((dims.psi - 0.55).abs() < 1e-9);
    }
}
