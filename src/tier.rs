//! Tier classification.
//!
//! Rules are evaluated in priority order and the first match wins:
//!
//! 1. super-majority: `k` of `n` sources at or above the threshold, final
//!    score at or above the category floor → `TOP_TIER`
//! 2. final score at or above `HIGH_THRESHOLD` and every gate passes →
//!    `HIGH_CONVICTION` (a failed gate falls through, it does not reject)
//! 3. final score at or above the category floor → `STANDARD`
//! 4. final score at or above the watch floor → `MONITOR` (hidden)
//! 5. otherwise → `REJECT` (hidden)

use serde::{Deserialize, Serialize};

use crate::aggregator::ScoredCandidate;
use crate::candidate::Category;
use crate::config::TierConfig;
use crate::logging::log_tier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tier {
    TopTier,
    HighConviction,
    Standard,
    Monitor,
    Reject,
}

/// The tiers that may leave the process. Hidden tiers have no variant here,
/// so a public response cannot carry one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PublicTier {
    TopTier,
    HighConviction,
    Standard,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::TopTier => "TOP_TIER",
            Tier::HighConviction => "HIGH_CONVICTION",
            Tier::Standard => "STANDARD",
            Tier::Monitor => "MONITOR",
            Tier::Reject => "REJECT",
        }
    }

    pub fn public(&self) -> Option<PublicTier> {
        match self {
            Tier::TopTier => Some(PublicTier::TopTier),
            Tier::HighConviction => Some(PublicTier::HighConviction),
            Tier::Standard => Some(PublicTier::Standard),
            Tier::Monitor | Tier::Reject => None,
        }
    }

    pub fn is_hidden(&self) -> bool {
        self.public().is_none()
    }
}

impl PublicTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublicTier::TopTier => "TOP_TIER",
            PublicTier::HighConviction => "HIGH_CONVICTION",
            PublicTier::Standard => "STANDARD",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierRule {
    SuperMajority,
    GatedHigh,
    CategoryFloor,
    WatchBand,
    BelowWatch,
}

impl TierRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            TierRule::SuperMajority => "super_majority",
            TierRule::GatedHigh => "gated_high",
            TierRule::CategoryFloor => "category_floor",
            TierRule::WatchBand => "watch_band",
            TierRule::BelowWatch => "below_watch",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierDecision {
    pub tier: Tier,
    pub rule: TierRule,
    /// Sources at or above the super-majority threshold.
    pub super_majority_hits: usize,
    /// Gates that did not pass (only evaluated above the high threshold).
    pub failed_gates: Vec<String>,
    /// Set when the score cleared the high threshold but a gate failed.
    pub downgraded: bool,
}

pub struct TierClassifier {
    cfg: TierConfig,
}

impl TierClassifier {
    pub fn new(cfg: TierConfig) -> Self {
        Self { cfg }
    }

    /// Core transition function over plain values.
    pub fn decide(&self, category: Category, final_score: f64, source_scores: &[(&str, f64)]) -> TierDecision {
        let floor = self.cfg.floor(category);
        let hits = source_scores
            .iter()
            .filter(|(_, s)| *s >= self.cfg.super_majority_threshold)
            .count();

        if hits >= self.cfg.super_majority_k && final_score >= floor {
            return TierDecision {
                tier: Tier::TopTier,
                rule: TierRule::SuperMajority,
                super_majority_hits: hits,
                failed_gates: Vec::new(),
                downgraded: false,
            };
        }

        let mut failed_gates = Vec::new();
        let mut downgraded = false;
        if final_score >= self.cfg.high_threshold {
            for (gate_source, minimum) in &self.cfg.gates {
                let passes = source_scores
                    .iter()
                    .find(|(id, _)| *id == gate_source.as_str())
                    .map(|(_, s)| *s >= *minimum)
                    .unwrap_or(false);
                if !passes {
                    failed_gates.push(gate_source.clone());
                }
            }
            if failed_gates.is_empty() {
                return TierDecision {
                    tier: Tier::HighConviction,
                    rule: TierRule::GatedHigh,
                    super_majority_hits: hits,
                    failed_gates,
                    downgraded: false,
                };
            }
            downgraded = true;
        }

        let (tier, rule) = if final_score >= floor {
            (Tier::Standard, TierRule::CategoryFloor)
        } else if final_score >= self.cfg.watch_floor {
            (Tier::Monitor, TierRule::WatchBand)
        } else {
            (Tier::Reject, TierRule::BelowWatch)
        };
        TierDecision {
            tier,
            rule,
            super_majority_hits: hits,
            failed_gates,
            downgraded,
        }
    }

    pub fn classify(&self, scored: ScoredCandidate) -> ClassifiedCandidate {
        let candidate = scored.candidate();
        let scores: Vec<(&str, f64)> = candidate
            .sources()
            .iter()
            .map(|s| (s.source_id(), s.score()))
            .collect();
        let decision = self.decide(candidate.identity().category, scored.final_score(), &scores);
        log_tier(
            &scored.candidate().identity().candidate_id,
            decision.tier.as_str(),
            decision.rule.as_str(),
            scored.final_score(),
            &decision.failed_gates,
        );
        ClassifiedCandidate { scored, decision }
    }
}

#[derive(Debug, Clone)]
pub struct ClassifiedCandidate {
    scored: ScoredCandidate,
    decision: TierDecision,
}

impl ClassifiedCandidate {
    pub fn scored(&self) -> &ScoredCandidate {
        &self.scored
    }

    pub fn decision(&self) -> &TierDecision {
        &self.decision
    }

    pub fn tier(&self) -> Tier {
        self.decision.tier
    }

    pub fn pick_id(&self) -> &str {
        self.scored.candidate().pick_id()
    }

    pub fn final_score(&self) -> f64 {
        self.scored.final_score()
    }

    pub fn category(&self) -> Category {
        self.scored.candidate().identity().category
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> TierClassifier {
        TierClassifier::new(TierConfig::default())
    }

    fn scores(model: f64, market: f64, symbolic: f64, trigger: f64) -> Vec<(&'static str, f64)> {
        vec![("model", model), ("market", market), ("symbolic", symbolic), ("trigger", trigger)]
    }

    #[test]
    fn test_super_majority_boundary_inclusive() {
        let c = classifier();
        let d = c.decide(Category::Game, 7.2, &scores(8.0, 8.0, 4.0, 8.0));
        assert_eq!(d.tier, Tier::TopTier);
        assert_eq!(d.super_majority_hits, 3);

        let d = c.decide(Category::Game, 7.2, &scores(8.0, 8.0, 4.0, 7.99));
        assert_ne!(d.tier, Tier::TopTier);
        assert_eq!(d.super_majority_hits, 2);
    }

    #[test]
    fn test_super_majority_needs_floor() {
        let d = classifier().decide(Category::Game, 6.9, &scores(9.0, 9.0, 0.0, 9.0));
        assert_ne!(d.tier, Tier::TopTier);
        assert_eq!(d.tier, Tier::Monitor);
    }

    #[test]
    fn test_gated_high_all_pass() {
        let d = classifier().decide(Category::Game, 7.6, &scores(6.8, 6.5, 5.5, 6.5));
        assert_eq!(d.tier, Tier::HighConviction);
        assert!(!d.downgraded);
    }

    #[test]
    fn test_single_failed_gate_downgrades() {
        // model 6.9, market 6.6, trigger 6.6, symbolic 5.4 vs 6.8/6.5/6.5/5.5
        let d = classifier().decide(Category::Game, 7.6, &scores(6.9, 6.6, 5.4, 6.6));
        assert_eq!(d.tier, Tier::Standard);
        assert!(d.downgraded);
        assert_eq!(d.failed_gates, vec!["symbolic".to_string()]);
    }

    #[test]
    fn test_missing_gate_source_fails_gate() {
        let d = classifier().decide(
            Category::Game,
            7.8,
            &[("model", 7.0), ("market", 7.0), ("symbolic", 7.0)],
        );
        assert_eq!(d.tier, Tier::Standard);
        assert_eq!(d.failed_gates, vec!["trigger".to_string()]);
    }

    #[test]
    fn test_category_floors() {
        let c = classifier();
        let s = scores(6.0, 6.0, 6.0, 6.0);
        assert_eq!(c.decide(Category::Prop, 6.6, &s).tier, Tier::Standard);
        assert_eq!(c.decide(Category::Game, 6.6, &s).tier, Tier::Monitor);
    }

    #[test]
    fn test_hidden_bands() {
        let c = classifier();
        let s = scores(5.0, 5.0, 5.0, 5.0);
        assert_eq!(c.decide(Category::Game, 5.5, &s).tier, Tier::Monitor);
        assert_eq!(c.decide(Category::Game, 5.3325, &s).tier, Tier::Reject);
        assert!(Tier::Monitor.is_hidden());
        assert!(Tier::Reject.is_hidden());
        assert_eq!(Tier::Standard.public(), Some(PublicTier::Standard));
    }
}
