//! Daily bias correction.
//!
//! Reads graded decisions, measures how each factor separated wins from
//! losses, nudges the weights a bounded step in that direction and installs
//! the result through the weight store. A cycle that fails any check leaves
//! the current weights in place.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::candidate::Category;
use crate::config::LearningConfig;
use crate::logging::{log_invariant, log_learning_cycle, ProfileScope};
use crate::store::record::{GradeResult, GradedRecord};
use crate::store::{DecisionStore, LoadFilter};
use crate::tier::PublicTier;
use crate::verify::invariants::assert_load_reconciles;
use crate::weights::{TrainingSignature, WeightError, WeightSet, WeightStore};

/// Where each loaded record went. Every record lands in exactly one bucket,
/// checked in field order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterCounts {
    pub no_grade: usize,
    pub no_result: usize,
    pub wrong_category: usize,
    pub missing_required_fields: usize,
    pub outside_window: usize,
    pub push_excluded: usize,
    pub eligible: usize,
    pub total_loaded: usize,
}

impl FilterCounts {
    pub fn dropped(&self) -> usize {
        self.no_grade
            + self.no_result
            + self.wrong_category
            + self.missing_required_fields
            + self.outside_window
            + self.push_excluded
    }

    pub fn reconciles(&self) -> bool {
        self.eligible + self.dropped() == self.total_loaded
    }
}

/// Splits records into training rows and drop buckets.
pub fn filter_records<'a>(
    records: &'a [GradedRecord],
    engine_keys: &[String],
    cfg: &LearningConfig,
    now: u64,
) -> (Vec<&'a GradedRecord>, FilterCounts) {
    let mut counts = FilterCounts {
        total_loaded: records.len(),
        ..Default::default()
    };
    let window_start = now.saturating_sub(cfg.window_secs());
    let mut eligible = Vec::new();

    for r in records {
        let Some(grade) = r.grade.as_ref() else {
            counts.no_grade += 1;
            continue;
        };
        let Some(result) = grade.result else {
            counts.no_result += 1;
            continue;
        };
        if !cfg.categories.contains(&r.record.identity.category) {
            counts.wrong_category += 1;
            continue;
        }
        let complete = r.record.final_score.is_finite()
            && engine_keys
                .iter()
                .all(|k| r.record.source_score(k).map(f64::is_finite).unwrap_or(false));
        if !complete {
            counts.missing_required_fields += 1;
            continue;
        }
        if r.record.emitted_at < window_start || r.record.emitted_at > now {
            counts.outside_window += 1;
            continue;
        }
        if result == GradeResult::Push {
            counts.push_excluded += 1;
            continue;
        }
        eligible.push(r);
    }
    counts.eligible = eligible.len();
    (eligible, counts)
}

/// How one factor lines up with the outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorBias {
    pub factor: String,
    /// Point-biserial correlation with WIN; `None` when undefined.
    pub correlation: Option<f64>,
    pub win_mean: f64,
    pub loss_mean: f64,
    pub wins: usize,
    pub losses: usize,
}

/// Point-biserial correlation between a continuous value and a binary
/// outcome. Undefined without both outcomes or without any spread.
pub fn point_biserial(samples: &[(f64, bool)]) -> Option<f64> {
    let n = samples.len() as f64;
    let wins: Vec<f64> = samples.iter().filter(|(_, w)| *w).map(|(v, _)| *v).collect();
    let losses: Vec<f64> = samples.iter().filter(|(_, w)| !*w).map(|(v, _)| *v).collect();
    if wins.is_empty() || losses.is_empty() {
        return None;
    }
    let mean = samples.iter().map(|(v, _)| v).sum::<f64>() / n;
    let var = samples.iter().map(|(v, _)| (v - mean).powi(2)).sum::<f64>() / n;
    let sd = var.sqrt();
    if !sd.is_finite() || sd < 1e-12 {
        return None;
    }
    let m1 = wins.iter().sum::<f64>() / wins.len() as f64;
    let m0 = losses.iter().sum::<f64>() / losses.len() as f64;
    let p = wins.len() as f64 / n;
    let r = (m1 - m0) / sd * (p * (1.0 - p)).sqrt();
    r.is_finite().then_some(r.clamp(-1.0, 1.0))
}

fn factor_bias(factor: &str, samples: &[(f64, bool)]) -> FactorBias {
    let mean_of = |want: bool| {
        let vals: Vec<f64> = samples.iter().filter(|(_, w)| *w == want).map(|(v, _)| *v).collect();
        if vals.is_empty() {
            (0.0, 0)
        } else {
            (vals.iter().sum::<f64>() / vals.len() as f64, vals.len())
        }
    };
    let (win_mean, wins) = mean_of(true);
    let (loss_mean, losses) = mean_of(false);
    FactorBias {
        factor: factor.to_string(),
        correlation: point_biserial(samples),
        win_mean,
        loss_mean,
        wins,
        losses,
    }
}

/// `w' = w · (1 + lr · r)`, each change clamped to `max_step`, then
/// renormalized. Factors without a correlation keep their weight.
pub fn derive_weights(
    current: &BTreeMap<String, f64>,
    biases: &[FactorBias],
    learning_rate: f64,
    max_step: f64,
) -> BTreeMap<String, f64> {
    let mut next: BTreeMap<String, f64> = current
        .iter()
        .map(|(k, w)| {
            let r = biases
                .iter()
                .find(|b| &b.factor == k)
                .and_then(|b| b.correlation)
                .unwrap_or(0.0);
            let proposed = w * (1.0 + learning_rate * r);
            let step = (proposed - w).clamp(-max_step, max_step);
            (k.clone(), (w + step).max(0.0))
        })
        .collect();
    let total: f64 = next.values().sum();
    if total > 0.0 && total.is_finite() {
        for w in next.values_mut() {
            *w /= total;
        }
    }
    next
}

/// SHA-256 over the sorted feature names a weight set was trained on.
pub fn schema_hash(weights: &WeightSet) -> String {
    let mut names: Vec<String> = weights.engine.keys().map(|k| format!("engine:{}", k)).collect();
    for (cat, pillars) in &weights.pillars {
        names.extend(pillars.keys().map(|k| format!("{}:{}", cat.as_str(), k)));
    }
    names.sort();
    hex::encode(Sha256::digest(names.join("\n").as_bytes()))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierHitRate {
    pub wins: usize,
    pub losses: usize,
    pub pushes: usize,
}

impl TierHitRate {
    pub fn hit_rate(&self) -> Option<f64> {
        let decided = self.wins + self.losses;
        (decided > 0).then(|| self.wins as f64 / decided as f64)
    }
}

pub fn tier_hit_rates(records: &[GradedRecord]) -> BTreeMap<PublicTier, TierHitRate> {
    let mut out: BTreeMap<PublicTier, TierHitRate> = BTreeMap::new();
    for r in records {
        let Some(result) = r.result() else { continue };
        let entry = out.entry(r.record.tier).or_default();
        match result {
            GradeResult::Win => entry.wins += 1,
            GradeResult::Loss => entry.losses += 1,
            GradeResult::Push => entry.pushes += 1,
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    Updated { version: u64 },
    Aborted { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    #[serde(flatten)]
    pub outcome: CycleOutcome,
    pub counts: FilterCounts,
    pub parse_errors: usize,
    pub duplicates: usize,
    pub orphan_grades: usize,
    pub previous_version: u64,
    pub schema_hash: String,
    pub engine_bias: Vec<FactorBias>,
    pub pillar_bias: BTreeMap<Category, Vec<FactorBias>>,
    pub tier_hit_rates: BTreeMap<PublicTier, TierHitRate>,
    /// Weights as installed, or as proposed when the cycle aborted on them.
    pub proposed: Option<WeightSet>,
    pub ran_at: u64,
}

impl CycleReport {
    pub fn updated(&self) -> bool {
        matches!(self.outcome, CycleOutcome::Updated { .. })
    }
}

pub struct BiasEngine {
    cfg: LearningConfig,
}

impl BiasEngine {
    pub fn new(cfg: LearningConfig) -> Self {
        Self { cfg }
    }

    /// One learning cycle. Store errors propagate; anything wrong with the
    /// data or the proposed weights aborts the cycle and is reported.
    pub fn run_cycle(&self, store: &DecisionStore, weights: &WeightStore, now: u64) -> Result<CycleReport> {
        let _prof = ProfileScope::new("learning.cycle");

        let current = weights.load().context("loading current weights")?.weights;
        let load = store.load(&LoadFilter::all()).context("loading decision log")?;
        let engine_keys: Vec<String> = current.engine.keys().cloned().collect();
        let (eligible, counts) = filter_records(&load.records, &engine_keys, &self.cfg, now);

        let mut report = CycleReport {
            outcome: CycleOutcome::Aborted {
                reason: String::new(),
            },
            counts,
            parse_errors: load.parse_errors,
            duplicates: load.duplicates,
            orphan_grades: load.orphan_grades,
            previous_version: current.version,
            schema_hash: schema_hash(&current),
            engine_bias: Vec::new(),
            pillar_bias: BTreeMap::new(),
            tier_hit_rates: tier_hit_rates(&load.records),
            proposed: None,
            ran_at: now,
        };

        if let Err(v) = assert_load_reconciles(&load) {
            log_invariant(v.check, &v.msg);
            return Ok(self.abort(report, format!("store counts do not reconcile: {}", v.msg)));
        }
        if eligible.len() < self.cfg.min_samples {
            return Ok(self.abort(
                report,
                format!("insufficient samples: {} < {}", eligible.len(), self.cfg.min_samples),
            ));
        }

        report.engine_bias = engine_keys
            .iter()
            .map(|k| {
                let samples: Vec<(f64, bool)> = eligible
                    .iter()
                    .filter_map(|r| Some((r.record.source_score(k)?, r.result()? == GradeResult::Win)))
                    .collect();
                factor_bias(k, &samples)
            })
            .collect();
        if report.engine_bias.iter().all(|b| b.correlation.is_none()) {
            return Ok(self.abort(report, "no factor separates wins from losses".to_string()));
        }

        let mut next = current.clone();
        next.engine = derive_weights(
            &current.engine,
            &report.engine_bias,
            self.cfg.learning_rate,
            self.cfg.max_step,
        );

        for (category, pillars) in &current.pillars {
            if !self.cfg.categories.contains(category) {
                continue;
            }
            let rows: Vec<&&GradedRecord> = eligible
                .iter()
                .filter(|r| r.record.identity.category == *category)
                .collect();
            // Thin categories keep their pillars rather than aborting the day.
            if rows.len() < self.cfg.min_samples {
                continue;
            }
            let biases: Vec<FactorBias> = pillars
                .keys()
                .map(|p| {
                    let samples: Vec<(f64, bool)> = rows
                        .iter()
                        .filter_map(|r| {
                            let v = r.record.context.get(p).copied().unwrap_or(0.0);
                            let v = if v.is_finite() { v.clamp(-1.0, 1.0) } else { 0.0 };
                            Some((v, r.result()? == GradeResult::Win))
                        })
                        .collect();
                    factor_bias(p, &samples)
                })
                .collect();
            next.pillars.insert(
                *category,
                derive_weights(pillars, &biases, self.cfg.learning_rate, self.cfg.max_step),
            );
            report.pillar_bias.insert(*category, biases);
        }

        report.proposed = Some(next.clone());
        let signature = TrainingSignature {
            sample_count: report.counts.eligible,
            filter_counts: report.counts.clone(),
            schema_hash: report.schema_hash.clone(),
            window_days: self.cfg.window_days,
            previous_version: current.version,
            trained_at: now,
        };
        match weights.replace(next, signature, &self.cfg.bounds, now) {
            Ok(version) => {
                if let Some(p) = report.proposed.as_mut() {
                    p.version = version;
                }
                report.outcome = CycleOutcome::Updated { version };
                log_learning_cycle(
                    "updated",
                    None,
                    report.counts.eligible,
                    report.counts.total_loaded,
                    Some(version),
                );
                Ok(report)
            }
            Err(e @ (WeightError::Io(_) | WeightError::Encoding(_))) => {
                Err(anyhow::Error::new(e).context("writing weight file"))
            }
            Err(e) => Ok(self.abort(report, format!("validation failed: {}", e))),
        }
    }

    fn abort(&self, mut report: CycleReport, reason: String) -> CycleReport {
        log_learning_cycle(
            "aborted",
            Some(&reason),
            report.counts.eligible,
            report.counts.total_loaded,
            None,
        );
        report.outcome = CycleOutcome::Aborted { reason };
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_biserial_perfect_split() {
        let samples = vec![(1.0, true), (1.0, true), (0.0, false), (0.0, false)];
        let r = point_biserial(&samples).unwrap();
        assert!((r - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_point_biserial_undefined() {
        assert!(point_biserial(&[(1.0, true), (2.0, true)]).is_none());
        assert!(point_biserial(&[(3.0, true), (3.0, false)]).is_none());
        assert!(point_biserial(&[]).is_none());
    }

    #[test]
    fn test_derive_weights_step_bounded_and_normalized() {
        let current = WeightSet::default().engine;
        let biases = vec![FactorBias {
            factor: "market".to_string(),
            correlation: Some(1.0),
            win_mean: 8.0,
            loss_mean: 4.0,
            wins: 20,
            losses: 20,
        }];
        // lr 1.0 would move market by 0.35; the step clamp allows 0.03
        let next = derive_weights(&current, &biases, 1.0, 0.03);
        assert!((next.values().sum::<f64>() - 1.0).abs() < crate::weights::SUM_TOLERANCE);
        let raw_market = 0.35 + 0.03;
        let expected = raw_market / 1.03;
        assert!((next["market"] - expected).abs() < 1e-12);
        assert!(next["model"] < current["model"]);
    }

    #[test]
    fn test_schema_hash_order_independent() {
        let a = WeightSet::default();
        let mut b = WeightSet::default();
        b.version = 9;
        assert_eq!(schema_hash(&a), schema_hash(&b));
        b.engine.insert("extra".to_string(), 0.0);
        assert_ne!(schema_hash(&a), schema_hash(&b));
    }

    #[test]
    fn test_hit_rate_ignores_pushes() {
        let h = TierHitRate {
            wins: 3,
            losses: 1,
            pushes: 5,
        };
        assert_eq!(h.hit_rate(), Some(0.75));
        assert_eq!(TierHitRate::default().hit_rate(), None);
    }
}
