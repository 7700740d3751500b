use serde::{Deserialize, Serialize};

use crate::adapter::types::SourceResult;
use crate::boost::BoostTerm;
use crate::boundary::EmittedCandidate;
use crate::candidate::{CandidateIdentity, ContextFactors};
use crate::tier::PublicTier;

/// One emitted decision as written to `decisions.jsonl`.
///
/// Collections default to empty so that a partial line still parses and is
/// counted by the learning filter instead of vanishing as a parse error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub pick_id: String,
    pub identity: CandidateIdentity,
    #[serde(default)]
    pub sources: Vec<SourceResult>,
    #[serde(default)]
    pub context: ContextFactors,
    #[serde(default)]
    pub context_modifier: f64,
    #[serde(default)]
    pub boosts: Vec<BoostTerm>,
    pub base_score: f64,
    #[serde(default)]
    pub total_boost: f64,
    pub final_score: f64,
    pub tier: PublicTier,
    #[serde(default)]
    pub weights_version: u64,
    pub emitted_at: u64,
}

impl DecisionRecord {
    pub fn from_emitted(emitted: &EmittedCandidate, emitted_at: u64) -> Self {
        let scored = emitted.classified.scored();
        let candidate = scored.candidate();
        let b = scored.breakdown();
        Self {
            pick_id: candidate.pick_id().to_string(),
            identity: candidate.identity().clone(),
            sources: candidate.sources().to_vec(),
            context: candidate.context().clone(),
            context_modifier: b.context_modifier,
            boosts: b.boosts.clone(),
            base_score: b.base_score,
            total_boost: b.total_boost,
            final_score: b.final_score,
            tier: emitted.tier,
            weights_version: b.weights_version,
            emitted_at,
        }
    }

    pub fn source_score(&self, source_id: &str) -> Option<f64> {
        self.sources
            .iter()
            .find(|s| s.source_id() == source_id)
            .map(|s| s.score())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GradeResult {
    Win,
    Loss,
    Push,
}

impl GradeResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            GradeResult::Win => "WIN",
            GradeResult::Loss => "LOSS",
            GradeResult::Push => "PUSH",
        }
    }
}

/// Outcome label for a persisted pick. `result` is empty while the oracle
/// has acknowledged the pick but not settled it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeLabel {
    pub pick_id: String,
    #[serde(default)]
    pub result: Option<GradeResult>,
    #[serde(default)]
    pub actual_value: Option<f64>,
    pub graded_at: u64,
}

impl GradeLabel {
    /// Same verdict, regardless of when it was issued.
    pub fn same_verdict(&self, other: &GradeLabel) -> bool {
        self.pick_id == other.pick_id && self.result == other.result && self.actual_value == other.actual_value
    }

    /// Whether this label replaces `current` in the overlay. A pending label
    /// never replaces a settled one; otherwise the newer `graded_at` wins and
    /// a tie goes to `self`.
    pub fn supersedes(&self, current: &GradeLabel) -> bool {
        match (self.result.is_some(), current.result.is_some()) {
            (false, true) => false,
            (true, false) => true,
            _ => self.graded_at >= current.graded_at,
        }
    }
}

/// A decision with its grade overlay merged in.
#[derive(Debug, Clone, PartialEq)]
pub struct GradedRecord {
    pub record: DecisionRecord,
    pub grade: Option<GradeLabel>,
}

impl GradedRecord {
    pub fn result(&self) -> Option<GradeResult> {
        self.grade.as_ref().and_then(|g| g.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label(result: Option<GradeResult>, graded_at: u64) -> GradeLabel {
        GradeLabel {
            pick_id: "p".to_string(),
            result,
            actual_value: None,
            graded_at,
        }
    }

    #[test]
    fn test_supersedes() {
        let pending = label(None, 5_000);
        let win = label(Some(GradeResult::Win), 2_000);
        let loss = label(Some(GradeResult::Loss), 3_000);

        assert!(!pending.supersedes(&win));
        assert!(win.supersedes(&pending));
        assert!(loss.supersedes(&win));
        assert!(!win.supersedes(&loss));
        // a tie goes to the later line
        assert!(label(Some(GradeResult::Push), 3_000).supersedes(&loss));
    }
}
