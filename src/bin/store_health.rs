//! Print a health snapshot of the storage directory.
//!
//! Usage:
//!   cargo run --bin store_health [-- --history N]

use anyhow::Result;
use serde_json::json;

use pickscore::config::Config;
use pickscore::storage::LearningLedger;
use pickscore::store::{DecisionStore, LoadFilter};
use pickscore::verify::invariants::assert_load_reconciles;
use pickscore::weights::WeightStore;

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let history = args
        .iter()
        .position(|a| a == "--history")
        .and_then(|i| args.get(i + 1))
        .and_then(|n| n.parse::<usize>().ok())
        .unwrap_or(5);

    let cfg = Config::from_env();
    let store = DecisionStore::open(&cfg.store_dir)?;
    let health = store.health();
    let load = store.load(&LoadFilter::all())?;
    let weights = WeightStore::open(&cfg.store_dir)?.load();

    let recent = LearningLedger::new(&cfg.ledger_path).and_then(|mut l| {
        l.init()?;
        l.recent(history)
    });

    let out = json!({
        "health": health,
        "decisions": {
            "total_lines": load.total_lines,
            "parsed_ok": load.parsed_ok,
            "parse_errors": load.parse_errors,
            "duplicates": load.duplicates,
            "graded": load.records.iter().filter(|r| r.grade.is_some()).count(),
            "grade_lines": load.grade_lines,
            "grade_parse_errors": load.grade_parse_errors,
            "orphan_grades": load.orphan_grades,
            "reconcile_error": assert_load_reconciles(&load).err().map(|v| v.to_string()),
        },
        "weights": match &weights {
            Ok(file) => json!({
                "version": file.weights.version,
                "written_at": file.written_at,
                "engine": file.weights.engine,
            }),
            Err(e) => json!({ "error": e.to_string() }),
        },
        "learning_history": match recent {
            Ok(rows) => json!(rows),
            Err(e) => json!({ "error": format!("{:#}", e) }),
        },
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
