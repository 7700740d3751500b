//! Fail-soft fan-out over the scoring sources.
//!
//! Every adapter runs in its own task under one shared deadline. Whatever
//! happens inside an adapter (error, panic, overrun) the caller gets exactly
//! one `SourceResult` per configured source, in adapter order.

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use crate::adapter::types::{SourceResult, SourceStatus};
use crate::adapter::unified::SourceAdapter;
use crate::candidate::CandidateIdentity;
use crate::config::CollectorConfig;
use crate::logging::{log_invariant, log_source_call};
use crate::reliability::circuit::CircuitBreaker;
use crate::verify::invariants::assert_neutral_fallback;

/// Last live result per (source, pick), kept for FALLBACK marking.
struct CachedScore {
    score: f64,
    fetched_at: Instant,
}

impl CachedScore {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }
}

/// One adapter invocation as observed by the collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceCall {
    pub source_id: String,
    pub status: SourceStatus,
    pub latency_ms: u64,
    pub error: Option<String>,
}

/// Cumulative per-source counters since process start.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceUsage {
    pub calls: u64,
    pub successes: u64,
    pub no_data: u64,
    pub failures: u64,
    pub timeouts: u64,
    pub fallbacks: u64,
    pub disabled: u64,
    pub total_latency_ms: u64,
}

impl SourceUsage {
    pub fn mean_latency_ms(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.total_latency_ms as f64 / self.calls as f64
        }
    }
}

#[derive(Debug, Clone)]
pub struct Collection {
    pub results: Vec<SourceResult>,
    pub calls: Vec<SourceCall>,
}

enum Outcome {
    Returned(SourceResult),
    Failed(String),
    TimedOut,
    Skipped,
}

pub struct ScoreCollector {
    adapters: Vec<Arc<dyn SourceAdapter>>,
    cfg: CollectorConfig,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
    cache: Mutex<HashMap<(String, String), CachedScore>>,
    usage: Mutex<BTreeMap<String, SourceUsage>>,
}

impl ScoreCollector {
    pub fn new(adapters: Vec<Arc<dyn SourceAdapter>>, cfg: CollectorConfig) -> Self {
        // A breaker stays open for one cache TTL before probing again.
        let breakers = adapters
            .iter()
            .map(|a| {
                (
                    a.id().to_string(),
                    CircuitBreaker::new(cfg.breaker_threshold, cfg.cache_ttl),
                )
            })
            .collect();
        Self {
            adapters,
            cfg,
            breakers: Mutex::new(breakers),
            cache: Mutex::new(HashMap::new()),
            usage: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn usage(&self) -> BTreeMap<String, SourceUsage> {
        self.usage.lock().map(|u| u.clone()).unwrap_or_default()
    }

    fn is_disabled(&self, source_id: &str) -> bool {
        if self.cfg.disabled_sources.iter().any(|s| s == source_id) {
            return true;
        }
        self.breakers
            .lock()
            .map(|mut b| b.get_mut(source_id).map(|cb| !cb.allow()).unwrap_or(false))
            .unwrap_or(false)
    }

    pub async fn collect(&self, identity: &CandidateIdentity) -> Collection {
        let pick_id = identity.pick_id();
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.cfg.budget;

        let mut outcomes: Vec<Option<(Outcome, u64)>> = self.adapters.iter().map(|_| None).collect();
        let mut set = JoinSet::new();
        for (idx, adapter) in self.adapters.iter().enumerate() {
            if self.is_disabled(adapter.id()) {
                outcomes[idx] = Some((Outcome::Skipped, 0));
                continue;
            }
            let adapter = Arc::clone(adapter);
            let identity = identity.clone();
            set.spawn(async move {
                let t0 = Instant::now();
                let res = AssertUnwindSafe(adapter.evaluate(&identity)).catch_unwind().await;
                let outcome = match res {
                    Ok(Ok(result)) => Outcome::Returned(result),
                    Ok(Err(e)) => Outcome::Failed(format!("{:#}", e)),
                    Err(_) => Outcome::Failed("adapter panicked".to_string()),
                };
                (idx, outcome, t0.elapsed().as_millis() as u64)
            });
        }

        loop {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(Ok((idx, outcome, latency)))) => outcomes[idx] = Some((outcome, latency)),
                // Tasks catch their own panics; a join error here means cancellation.
                Ok(Some(Err(_))) => continue,
                Ok(None) => break,
                Err(_) => {
                    set.abort_all();
                    break;
                }
            }
        }

        let budget_ms = started.elapsed().as_millis() as u64;
        let mut results = Vec::with_capacity(self.adapters.len());
        let mut calls = Vec::with_capacity(self.adapters.len());
        for (adapter, slot) in self.adapters.iter().zip(outcomes) {
            let (outcome, latency_ms) = slot.unwrap_or((Outcome::TimedOut, budget_ms));
            let (result, error) = self.settle(adapter.as_ref(), &pick_id, outcome, latency_ms);
            let result = result.with_latency(latency_ms);
            if let Err(v) = assert_neutral_fallback(&result, adapter.neutral_score()) {
                log_invariant(v.check, &v.msg);
            }
            log_source_call(
                &identity.candidate_id,
                adapter.id(),
                result.status().as_str(),
                latency_ms,
                error.as_deref(),
            );
            calls.push(SourceCall {
                source_id: adapter.id().to_string(),
                status: result.status(),
                latency_ms,
                error,
            });
            results.push(result);
        }
        Collection { results, calls }
    }

    /// Turns a raw outcome into the result that enters the pipeline and
    /// updates breaker, cache and usage counters.
    fn settle(
        &self,
        adapter: &dyn SourceAdapter,
        pick_id: &str,
        outcome: Outcome,
        latency_ms: u64,
    ) -> (SourceResult, Option<String>) {
        let id = adapter.id();
        let neutral = adapter.neutral_score();

        let (result, error, timed_out) = match outcome {
            Outcome::Skipped => {
                let result = SourceResult::degraded(id, SourceStatus::Disabled, neutral, "source disabled");
                self.bump(id, 0, |u| u.disabled += 1);
                return (result, None);
            }
            Outcome::Returned(raw) if raw.source_id() != id => {
                let msg = format!("adapter answered as {}", raw.source_id());
                (None, Some(msg), false)
            }
            Outcome::Returned(raw) => (Some(raw.sanitized(neutral)), None, false),
            Outcome::Failed(msg) => (None, Some(msg), false),
            Outcome::TimedOut => (None, Some("source budget exceeded".to_string()), true),
        };

        match result {
            Some(result) if result.status() == SourceStatus::Success => {
                self.record_breaker(id, true);
                if let Ok(mut cache) = self.cache.lock() {
                    cache.insert(
                        (id.to_string(), pick_id.to_string()),
                        CachedScore {
                            score: result.score(),
                            fetched_at: Instant::now(),
                        },
                    );
                }
                self.bump(id, latency_ms, |u| u.successes += 1);
                (result, None)
            }
            Some(result) => {
                // NO_DATA and friends are answers, not failures
                self.record_breaker(id, true);
                self.bump(id, latency_ms, |u| u.no_data += 1);
                (result, None)
            }
            None => {
                self.record_breaker(id, false);
                let msg = error.unwrap_or_else(|| "unknown failure".to_string());
                let result = match self.cached(id, pick_id) {
                    Some(prior) => SourceResult::degraded(id, SourceStatus::Fallback, neutral, &msg)
                        .with_reason(&format!("cached SUCCESS score {:.2} within ttl", prior)),
                    None => SourceResult::degraded(id, SourceStatus::Error, neutral, &msg),
                };
                let fallback = result.status() == SourceStatus::Fallback;
                self.bump(id, latency_ms, |u| {
                    u.failures += 1;
                    if timed_out {
                        u.timeouts += 1;
                    }
                    if fallback {
                        u.fallbacks += 1;
                    }
                });
                (result, Some(msg))
            }
        }
    }

    fn cached(&self, source_id: &str, pick_id: &str) -> Option<f64> {
        let cache = self.cache.lock().ok()?;
        cache
            .get(&(source_id.to_string(), pick_id.to_string()))
            .filter(|c| c.is_fresh(self.cfg.cache_ttl))
            .map(|c| c.score)
    }

    fn record_breaker(&self, source_id: &str, ok: bool) {
        if let Ok(mut breakers) = self.breakers.lock() {
            if let Some(cb) = breakers.get_mut(source_id) {
                if ok {
                    cb.record_success();
                } else {
                    cb.record_failure();
                }
            }
        }
    }

    fn bump<F: FnOnce(&mut SourceUsage)>(&self, source_id: &str, latency_ms: u64, f: F) {
        if let Ok(mut usage) = self.usage.lock() {
            let entry = usage.entry(source_id.to_string()).or_default();
            entry.calls += 1;
            entry.total_latency_ms += latency_ms;
            f(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::unified::{FixedAdapter, NoDataAdapter};
    use crate::candidate::Category;
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Failing(&'static str);

    #[async_trait]
    impl SourceAdapter for Failing {
        fn id(&self) -> &str {
            self.0
        }
        async fn evaluate(&self, _identity: &CandidateIdentity) -> Result<SourceResult> {
            Err(anyhow!("upstream 503"))
        }
    }

    struct Panicking;

    #[async_trait]
    impl SourceAdapter for Panicking {
        fn id(&self) -> &str {
            "symbolic"
        }
        async fn evaluate(&self, _identity: &CandidateIdentity) -> Result<SourceResult> {
            panic!("rule table missing")
        }
    }

    struct Slow;

    #[async_trait]
    impl SourceAdapter for Slow {
        fn id(&self) -> &str {
            "trigger"
        }
        async fn evaluate(&self, _identity: &CandidateIdentity) -> Result<SourceResult> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(SourceResult::success("trigger", 9.0, 0.9, vec![], BTreeMap::new(), 5.0))
        }
    }

    /// Succeeds until switched off.
    struct Flaky {
        up: AtomicBool,
    }

    #[async_trait]
    impl SourceAdapter for Flaky {
        fn id(&self) -> &str {
            "market"
        }
        async fn evaluate(&self, _identity: &CandidateIdentity) -> Result<SourceResult> {
            if self.up.load(Ordering::SeqCst) {
                Ok(SourceResult::success("market", 7.7, 0.6, vec![], BTreeMap::new(), 5.0))
            } else {
                Err(anyhow!("connection reset"))
            }
        }
    }

    fn identity() -> CandidateIdentity {
        CandidateIdentity {
            candidate_id: "c-1".to_string(),
            category: Category::Game,
            event_id: "E1".to_string(),
            market: "spread".to_string(),
            selection: "HOME".to_string(),
            line: Some(-3.5),
        }
    }

    fn cfg(budget_ms: u64) -> CollectorConfig {
        CollectorConfig {
            budget: Duration::from_millis(budget_ms),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_every_source_answers_in_order() {
        let collector = ScoreCollector::new(
            vec![
                Arc::new(FixedAdapter::new("model", 7.1, 0.8)),
                Arc::new(Failing("market")),
                Arc::new(Panicking),
                Arc::new(Slow),
            ],
            cfg(100),
        );
        let out = collector.collect(&identity()).await;
        let ids: Vec<&str> = out.results.iter().map(|r| r.source_id()).collect();
        assert_eq!(ids, vec!["model", "market", "symbolic", "trigger"]);

        assert_eq!(out.results[0].status(), SourceStatus::Success);
        for r in &out.results[1..] {
            assert_eq!(r.status(), SourceStatus::Error);
            assert_eq!(r.score(), 5.0);
        }
        assert!(out.results.iter().all(|r| assert_neutral_fallback(r, 5.0).is_ok()));
        assert_eq!(out.calls[3].error.as_deref(), Some("source budget exceeded"));
        assert_eq!(collector.usage()["trigger"].timeouts, 1);
    }

    #[tokio::test]
    async fn test_all_sources_failing_still_returns_shell() {
        let collector = ScoreCollector::new(
            vec![Arc::new(Failing("model")), Arc::new(Failing("market"))],
            cfg(100),
        );
        let out = collector.collect(&identity()).await;
        assert_eq!(out.results.len(), 2);
        assert!(out.results.iter().all(|r| r.score() == 5.0));
    }

    #[tokio::test]
    async fn test_no_data_is_not_a_failure() {
        let collector = ScoreCollector::new(vec![Arc::new(NoDataAdapter::new("trigger"))], cfg(100));
        let out = collector.collect(&identity()).await;
        assert_eq!(out.results[0].status(), SourceStatus::NoData);
        assert_eq!(collector.usage()["trigger"].failures, 0);
    }

    #[tokio::test]
    async fn test_fallback_after_prior_success() {
        let flaky = Arc::new(Flaky {
            up: AtomicBool::new(true),
        });
        let collector = ScoreCollector::new(vec![flaky.clone() as Arc<dyn SourceAdapter>], cfg(100));
        let first = collector.collect(&identity()).await;
        assert_eq!(first.results[0].score(), 7.7);

        flaky.up.store(false, Ordering::SeqCst);
        let second = collector.collect(&identity()).await;
        assert_eq!(second.results[0].status(), SourceStatus::Fallback);
        assert_eq!(second.results[0].score(), 5.0);
        assert_eq!(collector.usage()["market"].fallbacks, 1);
    }

    #[tokio::test]
    async fn test_breaker_disables_source() {
        let mut c = cfg(100);
        c.breaker_threshold = 2;
        let collector = ScoreCollector::new(vec![Arc::new(Failing("model"))], c);
        collector.collect(&identity()).await;
        collector.collect(&identity()).await;
        let third = collector.collect(&identity()).await;
        assert_eq!(third.results[0].status(), SourceStatus::Disabled);
        assert_eq!(third.results[0].score(), 5.0);
        assert_eq!(collector.usage()["model"].disabled, 1);
    }

    #[tokio::test]
    async fn test_configured_disabled_source_not_called() {
        let mut c = cfg(100);
        c.disabled_sources = vec!["model".to_string()];
        let collector = ScoreCollector::new(vec![Arc::new(FixedAdapter::new("model", 9.0, 1.0))], c);
        let out = collector.collect(&identity()).await;
        assert_eq!(out.results[0].status(), SourceStatus::Disabled);
        assert_eq!(collector.usage()["model"].successes, 0);
    }

    #[tokio::test]
    async fn test_misattributed_result_rejected() {
        // adapter registered as "trigger" but answering as "model"
        struct Impostor;

        #[async_trait]
        impl SourceAdapter for Impostor {
            fn id(&self) -> &str {
                "trigger"
            }
            async fn evaluate(&self, _identity: &CandidateIdentity) -> Result<SourceResult> {
                Ok(SourceResult::success("model", 9.5, 1.0, vec![], BTreeMap::new(), 5.0))
            }
        }

        let collector = ScoreCollector::new(vec![Arc::new(Impostor)], cfg(100));
        let out = collector.collect(&identity()).await;
        assert_eq!(out.results[0].source_id(), "trigger");
        assert_eq!(out.results[0].status(), SourceStatus::Error);
        assert_eq!(out.results[0].score(), 5.0);
    }
}
