//! Structured logging for the scoring pipeline.
//!
//! Every line is a JSON object with a run id, a sequence number, a level,
//! a domain and a free-form `data` map. Lines land in a per-run directory:
//!
//! - `events.jsonl`  info and above
//! - `trace.jsonl`   trace/debug
//! - `metrics.jsonl` anything emitted under the `metrics.` prefix
//!
//! and are mirrored to stderr so stdout stays reserved for responses.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("info") => Level::Info,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            Ok("fatal") => Level::Fatal,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

// =============================================================================
// Log Domains (categories for filtering)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Collect,   // Source fan-out, fallbacks, breakers
    Aggregate, // Base formula, modifier, boosts
    Tier,      // Classification decisions
    Boundary,  // Output filtering, drops
    Store,     // Decision log, grade overlay, weight file
    Grade,     // Oracle fetches
    Learn,     // Bias engine cycles
    System,    // Startup, shutdown
    Profile,   // Timing
    Audit,     // Invariant checks
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Collect => "collect",
            Domain::Aggregate => "aggregate",
            Domain::Tier => "tier",
            Domain::Boundary => "boundary",
            Domain::Store => "store",
            Domain::Grade => "grade",
            Domain::Learn => "learn",
            Domain::System => "system",
            Domain::Profile => "profile",
            Domain::Audit => "audit",
        }
    }

    pub fn is_enabled(&self) -> bool {
        // LOG_DOMAINS: comma-separated list or "all"
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

// =============================================================================
// Run context
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static PROFILE_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    events: Option<Mutex<BufWriter<File>>>,
    trace: Option<Mutex<BufWriter<File>>>,
    metrics: Option<Mutex<BufWriter<File>>>,
}

fn open_sink(path: PathBuf) -> Option<Mutex<BufWriter<File>>> {
    match File::create(&path) {
        Ok(file) => Some(Mutex::new(BufWriter::new(file))),
        Err(err) => {
            eprintln!("[log] failed to create {}: {}", path.display(), err);
            None
        }
    }
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = run_id_from_env();
        let base = std::env::var("LOG_DIR").unwrap_or_else(|_| "out/runs".to_string());
        let mut run_dir = PathBuf::from(base);
        run_dir.push(&run_id);
        if let Err(err) = create_dir_all(&run_dir) {
            eprintln!("[log] failed to create run dir: {}", err);
        }

        let _ = std::fs::write(
            run_dir.join("manifest.json"),
            json!({
                "run_id": run_id,
                "ts": ts_now(),
                "pid": process::id(),
                "log_dir": run_dir.to_string_lossy(),
            })
            .to_string(),
        );

        RunContext {
            events: open_sink(run_dir.join("events.jsonl")),
            trace: open_sink(run_dir.join("trace.jsonl")),
            metrics: open_sink(run_dir.join("metrics.jsonl")),
            run_id,
        }
    })
}

fn run_id_from_env() -> String {
    std::env::var("RUN_ID").unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()))
}

/// Run id shared by every log line of this process.
pub fn run_id() -> String {
    ensure_run_context().run_id.clone()
}

fn sanitize_fields(mut fields: Map<String, Value>) -> Map<String, Value> {
    let redacted = Value::String("[REDACTED]".to_string());
    for key in ["authorization", "Authorization", "api_key", "token"] {
        if fields.contains_key(key) {
            fields.insert(key.to_string(), redacted.clone());
        }
    }
    fields
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["pick_id", "candidate_id", "source_id", "event_id", "msg"] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

fn write_line(writer: &Option<Mutex<BufWriter<File>>>, line: &str) {
    if let Some(writer) = writer {
        if let Ok(mut w) = writer.lock() {
            let _ = writeln!(w, "{}", line);
            let _ = w.flush();
        }
    }
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Epoch milliseconds
pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    let min_level = Level::from_env();
    if level < min_level || !domain.is_enabled() {
        return;
    }

    emit_record(level, domain.as_str(), event, fields);
}

fn emit_record(level: Level, component: &str, event: &str, fields: Map<String, Value>) {
    let ctx = ensure_run_context();
    let fields = sanitize_fields(fields);
    let (mut top, data) = split_fields(fields);

    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(component));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for (k, v) in top {
        entry.insert(k, v);
    }
    entry.insert("data".to_string(), Value::Object(data));

    let line = Value::Object(entry).to_string();
    if event.starts_with("metrics.") {
        write_line(&ctx.metrics, &line);
    }
    match level {
        Level::Trace | Level::Debug => write_line(&ctx.trace, &line),
        _ => write_line(&ctx.events, &line),
    }
    eprintln!("{}", line);
}

// =============================================================================
// Domain-specific helpers
// =============================================================================

pub fn log_source_call(
    candidate_id: &str,
    source_id: &str,
    status: &str,
    latency_ms: u64,
    detail: Option<&str>,
) {
    let level = if status == "SUCCESS" { Level::Debug } else { Level::Warn };
    log(
        level,
        Domain::Collect,
        "source_call",
        obj(&[
            ("candidate_id", v_str(candidate_id)),
            ("source_id", v_str(source_id)),
            ("status", v_str(status)),
            ("latency_ms", json!(latency_ms)),
            ("detail", detail.map(v_str).unwrap_or(Value::Null)),
        ]),
    );
}

pub fn log_score(candidate_id: &str, base: f64, modifier: f64, total_boost: f64, final_score: f64) {
    log(
        Level::Debug,
        Domain::Aggregate,
        "score",
        obj(&[
            ("candidate_id", v_str(candidate_id)),
            ("base", v_num(base)),
            ("context_modifier", v_num(modifier)),
            ("total_boost", v_num(total_boost)),
            ("final_score", v_num(final_score)),
        ]),
    );
}

pub fn log_tier(candidate_id: &str, tier: &str, rule: &str, final_score: f64, failed_gates: &[String]) {
    log(
        Level::Debug,
        Domain::Tier,
        "classified",
        obj(&[
            ("candidate_id", v_str(candidate_id)),
            ("tier", v_str(tier)),
            ("rule", v_str(rule)),
            ("final_score", v_num(final_score)),
            (
                "failed_gates",
                Value::Array(failed_gates.iter().map(|g| v_str(g)).collect()),
            ),
        ]),
    );
}

pub fn log_boundary_drop(candidate_id: &str, pick_id: &str, reason: &str) {
    log(
        Level::Debug,
        Domain::Boundary,
        "drop",
        obj(&[
            ("candidate_id", v_str(candidate_id)),
            ("pick_id", v_str(pick_id)),
            ("reason", v_str(reason)),
        ]),
    );
}

pub fn log_persist(pick_id: &str, outcome: &str, error: Option<&str>) {
    let level = if error.is_some() { Level::Error } else { Level::Info };
    log(
        level,
        Domain::Store,
        "persist",
        obj(&[
            ("pick_id", v_str(pick_id)),
            ("outcome", v_str(outcome)),
            ("error", error.map(v_str).unwrap_or(Value::Null)),
        ]),
    );
}

pub fn log_invariant(check: &str, msg: &str) {
    log(
        Level::Error,
        Domain::Audit,
        "invariant_violation",
        obj(&[("check", v_str(check)), ("msg", v_str(msg))]),
    );
}

pub fn log_learning_cycle(outcome: &str, reason: Option<&str>, eligible: usize, total_loaded: usize, version: Option<u64>) {
    let level = if reason.is_some() { Level::Warn } else { Level::Info };
    log(
        level,
        Domain::Learn,
        "cycle",
        obj(&[
            ("outcome", v_str(outcome)),
            ("reason", reason.map(v_str).unwrap_or(Value::Null)),
            ("eligible", json!(eligible)),
            ("total_loaded", json!(total_loaded)),
            ("weights_version", version.map(|v| json!(v)).unwrap_or(Value::Null)),
        ]),
    );
}

// =============================================================================
// Utility Functions
// =============================================================================

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}

// =============================================================================
// Profiling Scope
// =============================================================================

/// Profiling scope that emits structured timing on drop.
pub struct ProfileScope {
    label: &'static str,
    context: Option<Map<String, Value>>,
    started: Instant,
    enabled: bool,
}

impl ProfileScope {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            context: None,
            started: Instant::now(),
            enabled: Self::should_sample(),
        }
    }

    pub fn with_context(label: &'static str, fields: &[(&str, Value)]) -> Self {
        let enabled = Self::should_sample();
        Self {
            label,
            context: if enabled { Some(obj(fields)) } else { None },
            started: Instant::now(),
            enabled,
        }
    }

    fn should_sample() -> bool {
        std::env::var("PROFILE_SAMPLE")
            .ok()
            .and_then(|v| v.parse::<f64>().ok())
            .map(|p| {
                if p >= 1.0 {
                    true
                } else if p <= 0.0 {
                    false
                } else {
                    let seq = PROFILE_SEQ.fetch_add(1, Ordering::SeqCst);
                    let bucket = (seq % 10_000) as f64 / 10_000.0;
                    bucket < p
                }
            })
            .unwrap_or(true)
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        if !self.enabled {
            return;
        }
        let elapsed_ms = self.started.elapsed().as_secs_f64() * 1000.0;
        let mut fields = self.context.take().unwrap_or_default();
        fields.insert("label".to_string(), v_str(self.label));
        fields.insert("elapsed_ms".to_string(), v_num(elapsed_ms));
        log(Level::Trace, Domain::Profile, "profile", fields);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(Level::Trace < Level::Debug);
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Warn);
        assert!(Level::Warn < Level::Error);
        assert!(Level::Error < Level::Fatal);
    }

    #[test]
    fn test_obj_helper() {
        let m = obj(&[("key", v_str("value")), ("num", v_num(42.0))]);
        assert_eq!(m.get("key").unwrap(), "value");
        assert_eq!(m.get("num").unwrap(), 42.0);
    }

    #[test]
    fn test_split_fields_lifts_identity_keys() {
        let (top, data) = split_fields(obj(&[
            ("pick_id", v_str("abc")),
            ("source_id", v_str("model")),
            ("score", v_num(7.0)),
        ]));
        assert_eq!(top.get("pick_id").unwrap(), "abc");
        assert_eq!(top.get("source_id").unwrap(), "model");
        assert!(data.contains_key("score"));
        assert!(!data.contains_key("pick_id"));
    }

    #[test]
    fn test_sanitize_redacts_secrets() {
        let m = sanitize_fields(obj(&[("api_key", v_str("secret")), ("ok", v_num(1.0))]));
        assert_eq!(m.get("api_key").unwrap(), "[REDACTED]");
        assert_eq!(m.get("ok").unwrap(), 1.0);
    }

    #[test]
    fn test_seq_increments() {
        let s1 = next_seq();
        let s2 = next_seq();
        assert!(s2 > s1);
    }
}
