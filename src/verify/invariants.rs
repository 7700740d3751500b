use crate::adapter::types::{SourceResult, SourceStatus, SCORE_MAX, SCORE_MIN};
use crate::boundary::BoundaryTelemetry;
use crate::learning::FilterCounts;
use crate::store::LoadReport;
use crate::weights::{WeightSet, SUM_TOLERANCE};

#[derive(Debug, Clone)]
pub struct InvariantViolation {
    pub check: &'static str,
    pub msg: String,
}

impl InvariantViolation {
    fn new(check: &'static str, msg: String) -> Self {
        Self { check, msg }
    }
}

impl std::fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.check, self.msg)
    }
}

pub fn assert_weight_sum(weights: &WeightSet) -> Result<(), InvariantViolation> {
    let sum = weights.engine_sum();
    if (sum - 1.0).abs() > SUM_TOLERANCE {
        return Err(InvariantViolation::new(
            "weight_sum",
            format!("engine weights v{} sum to {}", weights.version, sum),
        ));
    }
    for (category, pillars) in &weights.pillars {
        let sum: f64 = pillars.values().sum();
        if (sum - 1.0).abs() > SUM_TOLERANCE {
            return Err(InvariantViolation::new(
                "weight_sum",
                format!("{} pillars v{} sum to {}", category.as_str(), weights.version, sum),
            ));
        }
    }
    Ok(())
}

pub fn assert_score_bounds(final_score: f64) -> Result<(), InvariantViolation> {
    if !(SCORE_MIN..=SCORE_MAX).contains(&final_score) {
        return Err(InvariantViolation::new(
            "score_bounds",
            format!("final score {} outside [{}, {}]", final_score, SCORE_MIN, SCORE_MAX),
        ));
    }
    Ok(())
}

pub fn assert_total_boost(total_boost: f64, cap_total: f64) -> Result<(), InvariantViolation> {
    if !total_boost.is_finite() || total_boost > cap_total + 1e-12 {
        return Err(InvariantViolation::new(
            "boost_cap",
            format!("total boost {} above cap {}", total_boost, cap_total),
        ));
    }
    Ok(())
}

/// Non-SUCCESS results must carry the neutral score.
pub fn assert_neutral_fallback(result: &SourceResult, neutral: f64) -> Result<(), InvariantViolation> {
    if result.status() != SourceStatus::Success && (result.score() - neutral).abs() > 1e-12 {
        return Err(InvariantViolation::new(
            "neutral_fallback",
            format!(
                "{} is {} with score {} (neutral {})",
                result.source_id(),
                result.status().as_str(),
                result.score(),
                neutral
            ),
        ));
    }
    Ok(())
}

pub fn assert_boundary_reconciles(t: &BoundaryTelemetry) -> Result<(), InvariantViolation> {
    if !t.reconciles() {
        return Err(InvariantViolation::new(
            "boundary_reconcile",
            format!("input {} != emitted {} + dropped {}", t.input, t.emitted, t.dropped()),
        ));
    }
    Ok(())
}

pub fn assert_load_reconciles(r: &LoadReport) -> Result<(), InvariantViolation> {
    if !r.reconciles() {
        return Err(InvariantViolation::new(
            "load_reconcile",
            format!(
                "lines {} ok {} errors {} kept {} duplicates {} filtered {}",
                r.total_lines,
                r.parsed_ok,
                r.parse_errors,
                r.records.len(),
                r.duplicates,
                r.filtered_out
            ),
        ));
    }
    Ok(())
}

pub fn assert_buckets_reconcile(c: &FilterCounts) -> Result<(), InvariantViolation> {
    if !c.reconciles() {
        return Err(InvariantViolation::new(
            "bucket_reconcile",
            format!("eligible {} + dropped {} != loaded {}", c.eligible, c.dropped(), c.total_loaded),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_weights_pass() {
        assert!(assert_weight_sum(&WeightSet::default()).is_ok());
    }

    #[test]
    fn test_bad_pillar_sum_caught() {
        let mut w = WeightSet::default();
        if let Some(p) = w.pillars.values_mut().next() {
            p.insert("extra".to_string(), 0.1);
        }
        let err = assert_weight_sum(&w).unwrap_err();
        assert_eq!(err.check, "weight_sum");
    }

    #[test]
    fn test_score_bounds() {
        assert!(assert_score_bounds(0.0).is_ok());
        assert!(assert_score_bounds(10.0).is_ok());
        assert!(assert_score_bounds(10.01).is_err());
        assert!(assert_score_bounds(f64::NAN).is_err());
    }

    #[test]
    fn test_neutral_fallback() {
        let ok = SourceResult::degraded("market", SourceStatus::Error, 5.0, "down");
        assert!(assert_neutral_fallback(&ok, 5.0).is_ok());

        // an unsanitized payload claiming NO_DATA with a real score
        let raw: SourceResult =
            serde_json::from_str(r#"{"source_id":"market","score":8.4,"confidence":0.9,"status":"NO_DATA"}"#).unwrap();
        assert_eq!(assert_neutral_fallback(&raw, 5.0).unwrap_err().check, "neutral_fallback");
        assert!(assert_neutral_fallback(&raw.sanitized(5.0), 5.0).is_ok());
    }

    #[test]
    fn test_load_report_mismatch() {
        let r = LoadReport {
            total_lines: 4,
            parsed_ok: 3,
            parse_errors: 0,
            ..Default::default()
        };
        assert_eq!(assert_load_reconciles(&r).unwrap_err().check, "load_reconcile");
        assert!(assert_load_reconciles(&LoadReport::default()).is_ok());
    }

    #[test]
    fn test_bucket_mismatch() {
        let c = FilterCounts {
            eligible: 3,
            no_grade: 1,
            total_loaded: 5,
            ..Default::default()
        };
        assert!(assert_buckets_reconcile(&c).is_err());
    }
}
