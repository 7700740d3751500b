//! Candidate identity and the inputs carried alongside it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::adapter::types::SourceResult;
use crate::boost::SignalFamilies;

/// Decision category. Each category has its own minimum-score floor and its
/// own pillar weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Category {
    Game,
    Prop,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Game => "GAME",
            Category::Prop => "PROP",
        }
    }

    pub fn all() -> [Category; 2] {
        [Category::Game, Category::Prop]
    }

    pub fn parse(s: &str) -> Option<Category> {
        match s.trim().to_uppercase().as_str() {
            "GAME" => Some(Category::Game),
            "PROP" => Some(Category::Prop),
            _ => None,
        }
    }
}

/// Immutable identity of a decision under evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateIdentity {
    pub candidate_id: String,
    pub category: Category,
    /// Underlying event (a game, a match).
    pub event_id: String,
    /// Market within the event, e.g. "spread" or "points:player-23".
    pub market: String,
    /// Recommended outcome within the market, e.g. "OVER" or "HOME".
    pub selection: String,
    #[serde(default)]
    pub line: Option<f64>,
}

impl CandidateIdentity {
    /// Deterministic id of the logical decision. Built only from immutable
    /// identity fields; `candidate_id` is deliberately left out so the same
    /// pick submitted twice under different request ids collapses.
    pub fn pick_id(&self) -> String {
        let line = self
            .line
            .map(|l| format!("{:.2}", l))
            .unwrap_or_else(|| "-".to_string());
        let key = format!(
            "{}|{}|{}|{}|{}",
            self.category.as_str(),
            self.event_id.trim().to_lowercase(),
            self.market.trim().to_lowercase(),
            self.selection.trim().to_uppercase(),
            line
        );
        let digest = Sha256::digest(key.as_bytes());
        hex::encode(&digest[..12])
    }

    /// Key shared by candidates that compete for the same outcome.
    pub fn market_key(&self) -> (String, String) {
        (
            self.event_id.trim().to_lowercase(),
            self.market.trim().to_lowercase(),
        )
    }
}

/// Auxiliary context factors feeding the bounded modifier, keyed by pillar
/// name. Values are expected in [-1, 1].
pub type ContextFactors = BTreeMap<String, f64>;

/// What a caller submits for evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateRequest {
    pub identity: CandidateIdentity,
    #[serde(default)]
    pub context: ContextFactors,
    #[serde(default)]
    pub signals: SignalFamilies,
}

/// A candidate with its collected source results. Nothing here changes once
/// the collector has built it.
#[derive(Debug, Clone)]
pub struct Candidate {
    identity: CandidateIdentity,
    pick_id: String,
    sources: Vec<SourceResult>,
    context: ContextFactors,
    signals: SignalFamilies,
}

impl Candidate {
    pub fn new(request: CandidateRequest, sources: Vec<SourceResult>) -> Self {
        let pick_id = request.identity.pick_id();
        Self {
            identity: request.identity,
            pick_id,
            sources,
            context: request.context,
            signals: request.signals,
        }
    }

    pub fn identity(&self) -> &CandidateIdentity {
        &self.identity
    }

    pub fn pick_id(&self) -> &str {
        &self.pick_id
    }

    pub fn sources(&self) -> &[SourceResult] {
        &self.sources
    }

    pub fn source(&self, source_id: &str) -> Option<&SourceResult> {
        self.sources.iter().find(|s| s.source_id() == source_id)
    }

    pub fn context(&self) -> &ContextFactors {
        &self.context
    }

    pub fn signals(&self) -> &SignalFamilies {
        &self.signals
    }
}
