//! Score aggregation.
//!
//! ```text
//! base          = Σ w_i · score_i                  (weights sum to 1.0)
//! modifier      = clamp(±M, M · Σ p_j · factor_j)   (pillar weights, separate)
//! total_boost   = min(CAP_TOTAL, Σ capped boosts)
//! final_score   = clamp(0, 10, base + modifier + total_boost)
//! ```
//!
//! The weighted sources and the context modifier are different types and
//! draw on different weight maps; the modifier can never be folded into the
//! engine weights.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::adapter::types::{SCORE_MAX, SCORE_MIN};
use crate::boost::{capped_total, compute_boosts, BoostTerm};
use crate::candidate::{Candidate, ContextFactors};
use crate::config::AggregatorConfig;
use crate::logging::log_score;
use crate::weights::{WeightBounds, WeightError, WeightSet};

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("weight set rejected: {0}")]
    InvalidWeights(#[from] WeightError),
    #[error("source {0} has no engine weight")]
    UnweightedSource(String),
    #[error("engine weight {0} has no source result")]
    MissingSource(String),
}

/// The fixed-weight part of the formula.
pub struct WeightedSources<'w> {
    weights: &'w BTreeMap<String, f64>,
}

impl<'w> WeightedSources<'w> {
    pub fn new(weights: &'w WeightSet) -> Self {
        Self { weights: &weights.engine }
    }

    /// `Σ weight_i · score_i`. Every source needs a weight and every weight
    /// needs a source.
    pub fn base(&self, candidate: &Candidate) -> Result<f64, AggregationError> {
        for result in candidate.sources() {
            if !self.weights.contains_key(result.source_id()) {
                return Err(AggregationError::UnweightedSource(result.source_id().to_string()));
            }
        }
        let mut base = 0.0;
        for (source_id, weight) in self.weights {
            let result = candidate
                .source(source_id)
                .ok_or_else(|| AggregationError::MissingSource(source_id.clone()))?;
            base += weight * result.score();
        }
        Ok(base)
    }
}

/// Second, independently bounded adjustment over auxiliary context factors.
pub struct BoundedModifier<'w> {
    pillars: Option<&'w BTreeMap<String, f64>>,
    max_abs: f64,
}

impl<'w> BoundedModifier<'w> {
    pub fn new(pillars: Option<&'w BTreeMap<String, f64>>, max_abs: f64) -> Self {
        Self {
            pillars,
            max_abs: max_abs.abs(),
        }
    }

    pub fn apply(&self, factors: &ContextFactors) -> f64 {
        let Some(pillars) = self.pillars else {
            return 0.0;
        };
        let weighted: f64 = pillars
            .iter()
            .map(|(name, weight)| {
                let value = factors
                    .get(name)
                    .copied()
                    .filter(|v| v.is_finite())
                    .unwrap_or(0.0)
                    .clamp(-1.0, 1.0);
                weight * value
            })
            .sum();
        if !weighted.is_finite() {
            return 0.0;
        }
        (weighted * self.max_abs).clamp(-self.max_abs, self.max_abs)
    }
}

pub fn clamp_score(x: f64) -> f64 {
    if x.is_nan() {
        SCORE_MIN
    } else {
        x.clamp(SCORE_MIN, SCORE_MAX)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub base_score: f64,
    pub context_modifier: f64,
    pub boosts: Vec<BoostTerm>,
    pub total_boost: f64,
    pub final_score: f64,
    pub weights_version: u64,
}

/// A candidate plus its derived score. The candidate is only readable.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    candidate: Candidate,
    breakdown: ScoreBreakdown,
}

impl ScoredCandidate {
    pub fn candidate(&self) -> &Candidate {
        &self.candidate
    }

    pub fn breakdown(&self) -> &ScoreBreakdown {
        &self.breakdown
    }

    pub fn final_score(&self) -> f64 {
        self.breakdown.final_score
    }
}

pub struct Aggregator<'w> {
    weights: &'w WeightSet,
    cfg: AggregatorConfig,
}

impl<'w> Aggregator<'w> {
    /// Fails if the weight set does not pass the sum check. This is an
    /// invariant violation, not something to clamp away.
    pub fn new(weights: &'w WeightSet, cfg: AggregatorConfig) -> Result<Self, AggregationError> {
        weights.validate(&WeightBounds::unbounded())?;
        Ok(Self { weights, cfg })
    }

    pub fn score(&self, candidate: Candidate) -> Result<ScoredCandidate, AggregationError> {
        let base_score = WeightedSources::new(self.weights).base(&candidate)?;
        let modifier = BoundedModifier::new(
            self.weights.pillars_for(candidate.identity().category),
            self.cfg.context_max,
        );
        let context_modifier = modifier.apply(candidate.context());
        let boosts = compute_boosts(candidate.signals());
        let total_boost = capped_total(boosts.iter().map(|b| b.value), self.cfg.boost_cap_total);
        let final_score = clamp_score(base_score + context_modifier + total_boost);

        log_score(
            &candidate.identity().candidate_id,
            base_score,
            context_modifier,
            total_boost,
            final_score,
        );

        Ok(ScoredCandidate {
            candidate,
            breakdown: ScoreBreakdown {
                base_score,
                context_modifier,
                boosts,
                total_boost,
                final_score,
                weights_version: self.weights.version,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::types::{SourceResult, SourceStatus};
    use crate::boost::{MoneyFlowView, SignalFamilies, SimulationView};
    use crate::candidate::{CandidateIdentity, CandidateRequest, Category};

    fn candidate(scores: [f64; 4], signals: SignalFamilies, context: ContextFactors) -> Candidate {
        let ids = ["model", "market", "symbolic", "trigger"];
        let sources = ids
            .iter()
            .zip(scores)
            .map(|(id, s)| SourceResult::success(id, s, 0.8, vec![], BTreeMap::new(), 5.0))
            .collect();
        Candidate::new(
            CandidateRequest {
                identity: CandidateIdentity {
                    candidate_id: "c-1".to_string(),
                    category: Category::Game,
                    event_id: "E1".to_string(),
                    market: "total".to_string(),
                    selection: "OVER".to_string(),
                    line: Some(221.5),
                },
                context,
                signals,
            },
            sources,
        )
    }

    #[test]
    fn test_base_formula_reference_weights() {
        let w = WeightSet::default();
        let agg = Aggregator::new(&w, AggregatorConfig::default()).unwrap();
        let scored = agg
            .score(candidate([7.19, 4.5, 4.8, 5.0], SignalFamilies::default(), ContextFactors::new()))
            .unwrap();
        let b = scored.breakdown();
        assert!((b.base_score - 5.3325).abs() < 1e-9);
        assert_eq!(b.context_modifier, 0.0);
        assert_eq!(b.total_boost, 0.0);
        assert!((b.final_score - 5.3325).abs() < 1e-9);
    }

    #[test]
    fn test_modifier_clamped() {
        let w = WeightSet::default();
        let agg = Aggregator::new(&w, AggregatorConfig::default()).unwrap();
        let mut ctx = ContextFactors::new();
        ctx.insert("defense".to_string(), 50.0);
        ctx.insert("pace".to_string(), 1.0);
        ctx.insert("rest".to_string(), 1.0);
        let scored = agg.score(candidate([5.0; 4], SignalFamilies::default(), ctx)).unwrap();
        assert!((scored.breakdown().context_modifier - 0.35).abs() < 1e-12);
    }

    #[test]
    fn test_modifier_ignores_unknown_factors() {
        let w = WeightSet::default();
        let m = BoundedModifier::new(w.pillars_for(Category::Game), 0.35);
        let mut ctx = ContextFactors::new();
        ctx.insert("usage".to_string(), 1.0);
        assert_eq!(m.apply(&ctx), 0.0);
    }

    #[test]
    fn test_final_clamped_high() {
        let w = WeightSet::default();
        let agg = Aggregator::new(&w, AggregatorConfig::default()).unwrap();
        let signals = SignalFamilies {
            money_flow: Some(MoneyFlowView { money_pct: 90.0, ticket_pct: 30.0 }),
            simulation: Some(SimulationView { win_probability: 0.99 }),
            ..Default::default()
        };
        let scored = agg.score(candidate([10.0; 4], signals, ContextFactors::new())).unwrap();
        assert_eq!(scored.breakdown().total_boost, 1.5);
        assert_eq!(scored.final_score(), 10.0);
    }

    #[test]
    fn test_all_neutral_fallbacks_defined() {
        let w = WeightSet::default();
        let agg = Aggregator::new(&w, AggregatorConfig::default()).unwrap();
        let sources = ["model", "market", "symbolic", "trigger"]
            .iter()
            .map(|id| SourceResult::degraded(id, SourceStatus::Error, 5.0, "timeout"))
            .collect();
        let c = Candidate::new(
            CandidateRequest {
                identity: CandidateIdentity {
                    candidate_id: "c-2".to_string(),
                    category: Category::Prop,
                    event_id: "E2".to_string(),
                    market: "points:p1".to_string(),
                    selection: "UNDER".to_string(),
                    line: None,
                },
                context: ContextFactors::new(),
                signals: SignalFamilies::default(),
            },
            sources,
        );
        let scored = agg.score(c).unwrap();
        assert!((scored.final_score() - 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_weights_refused() {
        let mut w = WeightSet::default();
        w.engine.insert("trigger".to_string(), 0.5);
        assert!(matches!(
            Aggregator::new(&w, AggregatorConfig::default()),
            Err(AggregationError::InvalidWeights(_))
        ));
    }

    #[test]
    fn test_missing_source_is_error() {
        let mut w = WeightSet::default();
        w.engine.remove("trigger");
        w.engine.insert("market".to_string(), 0.55);
        let agg = Aggregator::new(&w, AggregatorConfig::default()).unwrap();
        let err = agg
            .score(candidate([5.0; 4], SignalFamilies::default(), ContextFactors::new()))
            .unwrap_err();
        assert!(matches!(err, AggregationError::UnweightedSource(ref s) if s == "trigger"));
    }

    #[test]
    fn test_deterministic() {
        let w = WeightSet::default();
        let agg = Aggregator::new(&w, AggregatorConfig::default()).unwrap();
        let mut ctx = ContextFactors::new();
        ctx.insert("pace".to_string(), 0.37);
        let signals = SignalFamilies {
            simulation: Some(SimulationView { win_probability: 0.61 }),
            ..Default::default()
        };
        let a = agg.score(candidate([6.1, 7.3, 5.5, 8.8], signals.clone(), ctx.clone())).unwrap();
        let b = agg.score(candidate([6.1, 7.3, 5.5, 8.8], signals, ctx)).unwrap();
        assert_eq!(a.breakdown(), b.breakdown());
    }
}
