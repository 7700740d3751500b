use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;

use super::types::{SourceResult, SourceStatus};
use crate::candidate::CandidateIdentity;

pub const DEFAULT_NEUTRAL: f64 = 5.0;

/// One scoring source. Implementations may fail freely; the collector turns
/// errors, panics and timeouts into neutral substitutes.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn id(&self) -> &str;

    /// Score reported whenever this source has nothing live to say.
    fn neutral_score(&self) -> f64 {
        DEFAULT_NEUTRAL
    }

    async fn evaluate(&self, identity: &CandidateIdentity) -> Result<SourceResult>;
}

/// Always returns the same live score. Used for replays and demos.
pub struct FixedAdapter {
    id: String,
    score: f64,
    confidence: f64,
}

impl FixedAdapter {
    pub fn new(id: &str, score: f64, confidence: f64) -> Self {
        Self {
            id: id.to_string(),
            score,
            confidence,
        }
    }
}

#[async_trait]
impl SourceAdapter for FixedAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn evaluate(&self, _identity: &CandidateIdentity) -> Result<SourceResult> {
        Ok(SourceResult::success(
            &self.id,
            self.score,
            self.confidence,
            vec!["fixed".to_string()],
            BTreeMap::new(),
            self.neutral_score(),
        ))
    }
}

// Stub for sources with no configured backend.
pub struct NoDataAdapter {
    id: String,
}

impl NoDataAdapter {
    pub fn new(id: &str) -> Self {
        Self { id: id.to_string() }
    }
}

#[async_trait]
impl SourceAdapter for NoDataAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn evaluate(&self, _identity: &CandidateIdentity) -> Result<SourceResult> {
        Ok(SourceResult::degraded(
            &self.id,
            SourceStatus::NoData,
            self.neutral_score(),
            "no backend configured",
        ))
    }
}
