//! Evaluate a batch of candidate requests.
//!
//! Usage:
//!   pickscore [requests.jsonl] [--debug]
//!
//! Reads one `CandidateRequest` JSON object per line (stdin when no file is
//! given) and prints the decision response to stdout.

use std::fs::File;
use std::io::{self, BufRead, BufReader};

use anyhow::{Context, Result};
use serde_json::json;

use pickscore::candidate::CandidateRequest;
use pickscore::config::Config;
use pickscore::logging::{log, obj, v_str, Domain, Level};
use pickscore::pipeline::{DecisionPipeline, RequestError, RequestErrorKind};

fn read_requests(reader: Box<dyn BufRead>) -> Result<(Vec<CandidateRequest>, Vec<RequestError>)> {
    let mut requests = Vec::new();
    let mut rejected = Vec::new();
    for (n, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<CandidateRequest>(&line) {
            Ok(r) => requests.push(r),
            Err(e) => rejected.push(RequestError {
                candidate_id: format!("line:{}", n + 1),
                kind: RequestErrorKind::InvalidRequest,
                message: e.to_string(),
            }),
        }
    }
    Ok((requests, rejected))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let debug = args.iter().any(|a| a == "--debug");
    let input = args.iter().skip(1).find(|a| !a.starts_with("--"));

    let cfg = Config::from_env();
    log(
        Level::Info,
        Domain::System,
        "startup",
        obj(&[
            ("store_dir", v_str(&cfg.store_dir.to_string_lossy())),
            ("sources", json!(cfg.source_urls.keys().collect::<Vec<_>>())),
            ("debug", json!(debug)),
        ]),
    );

    let reader: Box<dyn BufRead> = match input {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("opening {}", path))?,
        )),
        None => Box::new(BufReader::new(io::stdin())),
    };
    let (requests, rejected) = read_requests(reader)?;

    let pipeline = DecisionPipeline::from_config(&cfg)?;
    let mut response = pipeline.evaluate(requests, debug).await?;
    response.errors.extend(rejected);

    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
