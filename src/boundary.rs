//! Output boundary: the one place candidates leave through.
//!
//! Steps run in a fixed order and every dropped candidate lands in exactly
//! one reason bucket, so `input == emitted + Σ drops` always holds.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::config::TierConfig;
use crate::logging::{log_boundary_drop, log_invariant};
use crate::tier::{ClassifiedCandidate, PublicTier, Tier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    HiddenTier,
    BelowCategoryFloor,
    DuplicatePick,
    Contradiction,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::HiddenTier => "hidden_tier",
            DropReason::BelowCategoryFloor => "below_category_floor",
            DropReason::DuplicatePick => "duplicate_pick",
            DropReason::Contradiction => "contradiction",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundaryTelemetry {
    pub input: usize,
    pub emitted: usize,
    /// Tier counts before any filtering, hidden tiers included.
    pub tier_distribution: BTreeMap<Tier, usize>,
    pub drops: BTreeMap<DropReason, usize>,
    /// Public-tier candidates the floor re-check disagreed with.
    pub floor_disagreements: usize,
}

impl BoundaryTelemetry {
    pub fn dropped(&self) -> usize {
        self.drops.values().sum()
    }

    pub fn reconciles(&self) -> bool {
        self.input == self.emitted + self.dropped()
    }

    fn record_drop(&mut self, candidate: &ClassifiedCandidate, reason: DropReason) {
        *self.drops.entry(reason).or_insert(0) += 1;
        log_boundary_drop(
            &candidate.scored().candidate().identity().candidate_id,
            candidate.pick_id(),
            reason.as_str(),
        );
    }
}

/// A candidate that made it through, with its tier narrowed to the public set.
#[derive(Debug, Clone)]
pub struct EmittedCandidate {
    pub classified: ClassifiedCandidate,
    pub tier: PublicTier,
}

#[derive(Debug, Clone)]
pub struct BoundaryOutput {
    pub emitted: Vec<EmittedCandidate>,
    pub telemetry: BoundaryTelemetry,
}

pub struct OutputBoundary {
    tiers: TierConfig,
}

impl OutputBoundary {
    pub fn new(tiers: TierConfig) -> Self {
        Self { tiers }
    }

    pub fn filter(&self, candidates: Vec<ClassifiedCandidate>) -> BoundaryOutput {
        let mut telemetry = BoundaryTelemetry {
            input: candidates.len(),
            ..Default::default()
        };
        for c in &candidates {
            *telemetry.tier_distribution.entry(c.tier()).or_insert(0) += 1;
        }

        // (a) hidden tiers, (b) floor re-check
        let mut visible: Vec<EmittedCandidate> = Vec::with_capacity(candidates.len());
        for c in candidates {
            let Some(tier) = c.tier().public() else {
                telemetry.record_drop(&c, DropReason::HiddenTier);
                continue;
            };
            let floor = self.tiers.floor(c.category());
            if c.final_score() < floor {
                telemetry.floor_disagreements += 1;
                log_invariant(
                    "category_floor",
                    &format!(
                        "{} classified {} at {:.4} below floor {:.2}",
                        c.pick_id(),
                        tier.as_str(),
                        c.final_score(),
                        floor
                    ),
                );
                telemetry.record_drop(&c, DropReason::BelowCategoryFloor);
                continue;
            }
            visible.push(EmittedCandidate { classified: c, tier });
        }

        // (c) first-seen wins per pick_id
        let mut seen: HashSet<String> = HashSet::new();
        let mut unique: Vec<EmittedCandidate> = Vec::with_capacity(visible.len());
        for e in visible {
            if seen.insert(e.classified.pick_id().to_string()) {
                unique.push(e);
            } else {
                telemetry.record_drop(&e.classified, DropReason::DuplicatePick);
            }
        }

        // (d) opposite selections on the same market: drop every side
        let mut selections: HashMap<(String, String), HashSet<String>> = HashMap::new();
        for e in &unique {
            let identity = e.classified.scored().candidate().identity();
            selections
                .entry(identity.market_key())
                .or_default()
                .insert(identity.selection.trim().to_uppercase());
        }
        let mut emitted = Vec::with_capacity(unique.len());
        for e in unique {
            let key = e.classified.scored().candidate().identity().market_key();
            let contested = selections.get(&key).map(|s| s.len() > 1).unwrap_or(false);
            if contested {
                telemetry.record_drop(&e.classified, DropReason::Contradiction);
            } else {
                emitted.push(e);
            }
        }

        telemetry.emitted = emitted.len();
        BoundaryOutput { emitted, telemetry }
    }
}
