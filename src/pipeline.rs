//! Request orchestration: collect → aggregate → classify → boundary → persist.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::adapter::http::HttpSourceAdapter;
use crate::adapter::types::SourceStatus;
use crate::adapter::unified::{NoDataAdapter, SourceAdapter};
use crate::aggregator::{Aggregator, ScoredCandidate};
use crate::boost::BoostTerm;
use crate::boundary::{BoundaryTelemetry, EmittedCandidate, OutputBoundary};
use crate::candidate::{Candidate, CandidateIdentity, CandidateRequest};
use crate::collector::{ScoreCollector, SourceCall, SourceUsage};
use crate::config::{now_ts, AggregatorConfig, Config, TierConfig};
use crate::logging::{log, log_invariant, log_persist, obj, run_id, Domain, Level, ProfileScope};
use crate::reliability::retry::{retry_async, RetryConfig};
use crate::store::record::DecisionRecord;
use crate::store::DecisionStore;
use crate::tier::{ClassifiedCandidate, PublicTier, TierClassifier};
use crate::verify::invariants::{
    assert_boundary_reconciles, assert_score_bounds, assert_total_boost, assert_weight_sum,
};
use crate::weights::{WeightStore, REFERENCE_SOURCES};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceView {
    pub source_id: String,
    pub score: f64,
    pub confidence: f64,
    pub status: SourceStatus,
}

/// One served decision. Only public tiers can appear here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicDecision {
    pub pick_id: String,
    pub identity: CandidateIdentity,
    pub sources: Vec<SourceView>,
    pub base_score: f64,
    pub context_modifier: f64,
    pub boosts: Vec<BoostTerm>,
    pub total_boost: f64,
    pub final_score: f64,
    pub tier: PublicTier,
    pub weights_version: u64,
    pub persisted: bool,
}

impl PublicDecision {
    fn from_emitted(emitted: &EmittedCandidate, persisted: bool) -> Self {
        let scored = emitted.classified.scored();
        let candidate = scored.candidate();
        let b = scored.breakdown();
        Self {
            pick_id: candidate.pick_id().to_string(),
            identity: candidate.identity().clone(),
            sources: candidate
                .sources()
                .iter()
                .map(|s| SourceView {
                    source_id: s.source_id().to_string(),
                    score: s.score(),
                    confidence: s.confidence(),
                    status: s.status(),
                })
                .collect(),
            base_score: b.base_score,
            context_modifier: b.context_modifier,
            boosts: b.boosts.clone(),
            total_boost: b.total_boost,
            final_score: b.final_score,
            tier: emitted.tier,
            weights_version: b.weights_version,
            persisted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestErrorKind {
    InvalidRequest,
    Timeout,
    Aggregation,
    Invariant,
    /// Served, but the decision log append failed after its retry.
    Storage,
}

/// A candidate that could not be evaluated. It is reported, never served.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestError {
    pub candidate_id: String,
    pub kind: RequestErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugTelemetry {
    pub boundary: BoundaryTelemetry,
    pub source_calls: BTreeMap<String, Vec<SourceCall>>,
    pub usage: BTreeMap<String, SourceUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionResponse {
    pub run_id: String,
    pub generated_at: u64,
    pub weights_version: u64,
    pub picks: Vec<PublicDecision>,
    pub errors: Vec<RequestError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<DebugTelemetry>,
}

pub struct DecisionPipeline {
    collector: ScoreCollector,
    weights: WeightStore,
    store: Arc<DecisionStore>,
    aggregator: AggregatorConfig,
    tiers: TierConfig,
    request_timeout: Duration,
}

/// One adapter per reference source, in reference order: HTTP when an
/// endpoint is configured, otherwise a no-data stub.
pub fn adapters_from_config(cfg: &Config) -> Result<Vec<Arc<dyn SourceAdapter>>> {
    REFERENCE_SOURCES
        .iter()
        .map(|id| {
            let adapter: Arc<dyn SourceAdapter> = match cfg.source_urls.get(*id) {
                Some(url) => Arc::new(HttpSourceAdapter::new(id, url)?),
                None => Arc::new(NoDataAdapter::new(id)),
            };
            Ok(adapter)
        })
        .collect()
}

impl DecisionPipeline {
    pub fn new(collector: ScoreCollector, weights: WeightStore, store: DecisionStore, cfg: &Config) -> Self {
        Self {
            collector,
            weights,
            store: Arc::new(store),
            aggregator: cfg.aggregator.clone(),
            tiers: cfg.tiers.clone(),
            request_timeout: cfg.request_timeout,
        }
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let collector = ScoreCollector::new(adapters_from_config(cfg)?, cfg.collector.clone());
        let weights = WeightStore::open(&cfg.store_dir).context("opening weight store")?;
        let store = DecisionStore::open(&cfg.store_dir).context("opening decision store")?;
        Ok(Self::new(collector, weights, store, cfg))
    }

    pub fn store(&self) -> &DecisionStore {
        &self.store
    }

    /// Evaluates a batch. Fails as a whole only when no valid weight set is
    /// available; per-candidate problems land in `errors`.
    pub async fn evaluate(&self, requests: Vec<CandidateRequest>, debug: bool) -> Result<DecisionResponse> {
        let _prof = ProfileScope::with_context("pipeline.evaluate", &[("candidates", json!(requests.len()))]);

        let weights = self.weights.snapshot().context("loading weight snapshot")?;
        if let Err(v) = assert_weight_sum(&weights) {
            log_invariant(v.check, &v.msg);
            anyhow::bail!("refusing to score: {}", v);
        }
        let aggregator = Aggregator::new(&weights, self.aggregator.clone())?;
        let classifier = TierClassifier::new(self.tiers.clone());

        let collected = join_all(requests.iter().map(|r| {
            tokio::time::timeout(self.request_timeout, self.collector.collect(&r.identity))
        }))
        .await;

        let mut errors = Vec::new();
        let mut source_calls = BTreeMap::new();
        let mut classified: Vec<ClassifiedCandidate> = Vec::with_capacity(requests.len());
        for (request, collection) in requests.into_iter().zip(collected) {
            let candidate_id = request.identity.candidate_id.clone();
            let Ok(collection) = collection else {
                errors.push(RequestError {
                    candidate_id,
                    kind: RequestErrorKind::Timeout,
                    message: format!("evaluation exceeded {:?}", self.request_timeout),
                });
                continue;
            };
            source_calls.insert(candidate_id.clone(), collection.calls);

            let scored = match aggregator.score(Candidate::new(request, collection.results)) {
                Ok(s) => s,
                Err(e) => {
                    log_invariant("aggregation", &format!("{}: {}", candidate_id, e));
                    errors.push(RequestError {
                        candidate_id,
                        kind: RequestErrorKind::Aggregation,
                        message: e.to_string(),
                    });
                    continue;
                }
            };
            if let Err(v) = self.check_scored(&scored) {
                log_invariant(v.check, &v.msg);
                errors.push(RequestError {
                    candidate_id,
                    kind: RequestErrorKind::Invariant,
                    message: v.to_string(),
                });
                continue;
            }
            classified.push(classifier.classify(scored));
        }

        let output = OutputBoundary::new(self.tiers.clone()).filter(classified);
        if let Err(v) = assert_boundary_reconciles(&output.telemetry) {
            log_invariant(v.check, &v.msg);
        }

        let now = now_ts();
        let mut picks = Vec::with_capacity(output.emitted.len());
        for emitted in &output.emitted {
            let record = DecisionRecord::from_emitted(emitted, now);
            let persisted = match self.persist(&record).await {
                Ok(()) => true,
                Err(e) => {
                    errors.push(RequestError {
                        candidate_id: emitted.classified.scored().candidate().identity().candidate_id.clone(),
                        kind: RequestErrorKind::Storage,
                        message: format!("decision {} not persisted: {:#}", record.pick_id, e),
                    });
                    false
                }
            };
            picks.push(PublicDecision::from_emitted(emitted, persisted));
        }

        log(
            Level::Info,
            Domain::Boundary,
            "metrics.batch",
            obj(&[
                ("input", json!(output.telemetry.input)),
                ("emitted", json!(output.telemetry.emitted)),
                ("errors", json!(errors.len())),
                ("weights_version", json!(weights.version)),
            ]),
        );

        Ok(DecisionResponse {
            run_id: run_id(),
            generated_at: now,
            weights_version: weights.version,
            picks,
            errors,
            debug: debug.then(|| DebugTelemetry {
                boundary: output.telemetry.clone(),
                source_calls,
                usage: self.collector.usage(),
            }),
        })
    }

    fn check_scored(&self, scored: &ScoredCandidate) -> Result<(), crate::verify::invariants::InvariantViolation> {
        assert_score_bounds(scored.final_score())?;
        assert_total_boost(scored.breakdown().total_boost, self.aggregator.boost_cap_total)
    }

    /// Append with one retry. The locked write and fsync run on the
    /// blocking pool; a failure is logged and returned, never fatal to the
    /// response.
    async fn persist(&self, record: &DecisionRecord) -> Result<()> {
        let result = retry_async(&RetryConfig::once(), "persist_decision", || {
            let store = Arc::clone(&self.store);
            let record = record.clone();
            async move {
                tokio::task::spawn_blocking(move || store.persist(&record))
                    .await
                    .context("append task")?
                    .map_err(anyhow::Error::from)
            }
        })
        .await;
        if let Err(e) = &result {
            log_persist(&record.pick_id, "failed", Some(&format!("{:#}", e)));
        }
        result.map(|_| ())
    }
}
