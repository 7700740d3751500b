use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const SCORE_MIN: f64 = 0.0;
pub const SCORE_MAX: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SourceStatus {
    Success,
    NoData,
    Error,
    Disabled,
    Fallback,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceStatus::Success => "SUCCESS",
            SourceStatus::NoData => "NO_DATA",
            SourceStatus::Error => "ERROR",
            SourceStatus::Disabled => "DISABLED",
            SourceStatus::Fallback => "FALLBACK",
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, SourceStatus::Success)
    }
}

/// One source's verdict on one candidate.
///
/// Fields are private: a result is built through [`SourceResult::success`] or
/// [`SourceResult::degraded`] and read through accessors, so nothing
/// downstream can rewrite a score after the collector hands it over. Any
/// non-SUCCESS result carries the source's neutral score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceResult {
    source_id: String,
    score: f64,
    confidence: f64,
    status: SourceStatus,
    #[serde(default)]
    reasons: Vec<String>,
    #[serde(default)]
    breakdown: BTreeMap<String, f64>,
    #[serde(default)]
    latency_ms: u64,
}

impl SourceResult {
    /// Live result. Out-of-range values are clamped; a non-finite score
    /// cannot be trusted and degrades to ERROR at the neutral score.
    pub fn success(
        source_id: &str,
        score: f64,
        confidence: f64,
        reasons: Vec<String>,
        breakdown: BTreeMap<String, f64>,
        neutral: f64,
    ) -> Self {
        if !score.is_finite() {
            return Self::degraded(source_id, SourceStatus::Error, neutral, "non-finite score from source");
        }
        let confidence = if confidence.is_finite() { confidence.clamp(0.0, 1.0) } else { 0.0 };
        Self {
            source_id: source_id.to_string(),
            score: score.clamp(SCORE_MIN, SCORE_MAX),
            confidence,
            status: SourceStatus::Success,
            reasons,
            breakdown: breakdown.into_iter().filter(|(_, v)| v.is_finite()).collect(),
            latency_ms: 0,
        }
    }

    /// Substitute result for a source that produced nothing usable.
    /// Passing `SourceStatus::Success` here is treated as `Error`.
    pub fn degraded(source_id: &str, status: SourceStatus, neutral: f64, reason: &str) -> Self {
        let status = if status == SourceStatus::Success { SourceStatus::Error } else { status };
        Self {
            source_id: source_id.to_string(),
            score: neutral.clamp(SCORE_MIN, SCORE_MAX),
            confidence: 0.0,
            status,
            reasons: vec![reason.to_string()],
            breakdown: BTreeMap::new(),
            latency_ms: 0,
        }
    }

    /// Re-establishes the neutral-score invariant on a result that came from
    /// outside (adapter output or a deserialized payload).
    pub fn sanitized(self, neutral: f64) -> Self {
        if self.status.is_live() {
            let mut out = Self::success(
                &self.source_id,
                self.score,
                self.confidence,
                self.reasons,
                self.breakdown,
                neutral,
            );
            out.latency_ms = self.latency_ms;
            out
        } else {
            let reason = self.reasons.first().cloned().unwrap_or_else(|| self.status.as_str().to_lowercase());
            let mut out = Self::degraded(&self.source_id, self.status, neutral, &reason);
            out.latency_ms = self.latency_ms;
            out
        }
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reasons.push(reason.to_string());
        self
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn status(&self) -> SourceStatus {
        self.status
    }

    pub fn reasons(&self) -> &[String] {
        &self.reasons
    }

    pub fn breakdown(&self) -> &BTreeMap<String, f64> {
        &self.breakdown
    }

    pub fn latency_ms(&self) -> u64 {
        self.latency_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_clamps_range() {
        let r = SourceResult::success("model", 12.5, 1.4, vec![], BTreeMap::new(), 5.0);
        assert_eq!(r.score(), 10.0);
        assert_eq!(r.confidence(), 1.0);
        assert_eq!(r.status(), SourceStatus::Success);
    }

    #[test]
    fn test_nan_score_degrades_to_neutral() {
        let r = SourceResult::success("model", f64::NAN, 0.9, vec![], BTreeMap::new(), 5.0);
        assert_eq!(r.status(), SourceStatus::Error);
        assert_eq!(r.score(), 5.0);
        assert_eq!(r.confidence(), 0.0);
    }

    #[test]
    fn test_degraded_never_claims_success() {
        let r = SourceResult::degraded("market", SourceStatus::Success, 5.0, "bogus");
        assert_eq!(r.status(), SourceStatus::Error);
        assert_eq!(r.score(), 5.0);
    }

    #[test]
    fn test_sanitize_restores_neutral_for_failed_payload() {
        // A deserialized payload that claims NO_DATA with a confident score
        let raw: SourceResult = serde_json::from_str(
            r#"{"source_id":"trigger","score":9.4,"confidence":0.9,"status":"NO_DATA"}"#,
        )
        .unwrap();
        let r = raw.sanitized(5.0);
        assert_eq!(r.status(), SourceStatus::NoData);
        assert_eq!(r.score(), 5.0);
        assert_eq!(r.confidence(), 0.0);
    }
}
