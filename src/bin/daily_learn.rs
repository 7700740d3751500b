//! Daily learning job: pull grades, run one bias cycle, record it.
//!
//! Usage:
//!   cargo run --bin daily_learn
//!
//! Grades come from GRADING_URL, or GRADES_FILE when no URL is set. A grading
//! failure is logged and the cycle runs on the grades already on file.

use anyhow::Result;
use serde_json::json;

use pickscore::config::{now_ts, Config};
use pickscore::grading::{run_grading, GradingOracle, HttpGradingOracle, JsonlGradingOracle};
use pickscore::learning::BiasEngine;
use pickscore::logging::{log, log_invariant, obj, v_str, Domain, Level};
use pickscore::storage::LearningLedger;
use pickscore::store::DecisionStore;
use pickscore::verify::invariants::assert_buckets_reconcile;
use pickscore::weights::WeightStore;

fn oracle_from_config(cfg: &Config) -> Result<Option<Box<dyn GradingOracle>>> {
    if let Some(url) = &cfg.grading_url {
        return Ok(Some(Box::new(HttpGradingOracle::new(url, cfg.request_timeout)?)));
    }
    Ok(cfg
        .grades_file
        .as_ref()
        .map(|path| Box::new(JsonlGradingOracle::new(path)) as Box<dyn GradingOracle>))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    let store = DecisionStore::open(&cfg.store_dir)?;
    let weights = WeightStore::open(&cfg.store_dir)?;
    let now = now_ts();

    let grading = match oracle_from_config(&cfg)? {
        Some(oracle) => {
            let since = now.saturating_sub(cfg.learning.window_secs());
            match run_grading(oracle.as_ref(), &store, since).await {
                Ok(summary) => Some(summary),
                Err(e) => {
                    log(
                        Level::Error,
                        Domain::Grade,
                        "grading_failed",
                        obj(&[("error", v_str(&format!("{:#}", e)))]),
                    );
                    None
                }
            }
        }
        None => None,
    };

    let engine = BiasEngine::new(cfg.learning.clone());
    let report = engine.run_cycle(&store, &weights, now)?;
    if let Err(v) = assert_buckets_reconcile(&report.counts) {
        log_invariant(v.check, &v.msg);
    }

    let mut ledger = LearningLedger::new(&cfg.ledger_path)?;
    ledger.init()?;
    ledger.record_cycle(&report)?;

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "grading": grading,
            "cycle": report,
        }))?
    );
    Ok(())
}
