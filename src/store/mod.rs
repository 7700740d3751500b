//! Append-only decision log with a grade overlay.
//!
//! ```text
//! <dir>/decisions.jsonl   one DecisionRecord per line, never rewritten
//! <dir>/grades.jsonl      one GradeLabel per line, newest verdict per pick wins
//! ```
//!
//! Writers take an exclusive lock on the file they append to for the length
//! of one append. Readers never lock; a torn trailing line is simply counted
//! as a parse error.

pub mod health;
pub mod record;

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fd_lock::RwLock;
use serde::{Deserialize, Serialize};

use crate::candidate::Category;
use crate::config::now_ts;
use crate::logging::{log, log_persist, obj, v_str, Domain, Level};
use health::{FileHealth, StoreHealth};
use record::{DecisionRecord, GradeLabel, GradedRecord};

pub const DECISIONS_FILE: &str = "decisions.jsonl";
pub const GRADES_FILE: &str = "grades.jsonl";
pub const WEIGHTS_FILE: &str = "weights.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Appended,
    /// The pick was already in the log; nothing was written.
    AlreadyPresent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradeOutcome {
    Attached,
    /// Same verdict already on file for this pick.
    Unchanged,
    /// No decision with this pick id; refused.
    Orphan,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GradingSummary {
    pub submitted: usize,
    pub attached: usize,
    pub unchanged: usize,
    pub orphaned: usize,
}

impl GradingSummary {
    fn count(&mut self, outcome: GradeOutcome) {
        self.submitted += 1;
        match outcome {
            GradeOutcome::Attached => self.attached += 1,
            GradeOutcome::Unchanged => self.unchanged += 1,
            GradeOutcome::Orphan => self.orphaned += 1,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoadFilter {
    pub category: Option<Category>,
    /// Only records emitted at or after this epoch second.
    pub since: Option<u64>,
    pub graded_only: bool,
}

impl LoadFilter {
    pub fn all() -> Self {
        Self::default()
    }

    fn admits(&self, r: &GradedRecord) -> bool {
        if let Some(cat) = self.category {
            if r.record.identity.category != cat {
                return false;
            }
        }
        if let Some(since) = self.since {
            if r.record.emitted_at < since {
                return false;
            }
        }
        !(self.graded_only && r.grade.is_none())
    }
}

/// Result of one full read of the store.
///
/// Non-blank decision lines satisfy `parsed_ok + parse_errors == total_lines`;
/// `records` holds what survives dedupe and the filter.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub records: Vec<GradedRecord>,
    pub total_lines: usize,
    pub parsed_ok: usize,
    pub parse_errors: usize,
    /// Parsed lines repeating an earlier pick id; the first one is kept.
    pub duplicates: usize,
    pub filtered_out: usize,
    pub grade_lines: usize,
    pub grade_parse_errors: usize,
    /// Distinct pick ids in the overlay with no decision behind them.
    pub orphan_grades: usize,
}

impl LoadReport {
    pub fn reconciles(&self) -> bool {
        self.parsed_ok + self.parse_errors == self.total_lines
            && self.records.len() + self.duplicates + self.filtered_out == self.parsed_ok
    }
}

#[derive(Default)]
struct PickIndex {
    /// Byte offset up to which the decision log has been indexed.
    offset: u64,
    ids: HashSet<String>,
}

pub struct DecisionStore {
    dir: PathBuf,
    decisions_path: PathBuf,
    grades_path: PathBuf,
    index: Mutex<PickIndex>,
}

fn poisoned() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "pick index lock poisoned")
}

/// Streams the non-blank lines of a file as raw bytes. A missing file has
/// no lines.
fn for_each_line<F: FnMut(&[u8])>(path: &Path, mut f: F) -> io::Result<()> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            return Ok(());
        }
        if buf.iter().all(|b| b.is_ascii_whitespace()) {
            continue;
        }
        f(&buf);
    }
}

/// Folds one label into the overlay under [`GradeLabel::supersedes`].
fn merge_label(overlay: &mut HashMap<String, GradeLabel>, label: GradeLabel) {
    match overlay.get(&label.pick_id) {
        Some(current) if !label.supersedes(current) => {}
        _ => {
            overlay.insert(label.pick_id.clone(), label);
        }
    }
}

impl DecisionStore {
    pub fn open(dir: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            decisions_path: dir.join(DECISIONS_FILE),
            grades_path: dir.join(GRADES_FILE),
            index: Mutex::new(PickIndex::default()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn decisions_path(&self) -> &Path {
        &self.decisions_path
    }

    pub fn grades_path(&self) -> &Path {
        &self.grades_path
    }

    /// Catches the in-memory index up with complete lines appended since the
    /// last call, by this process or any other. Returns true when the file
    /// ends in a torn line.
    fn refresh_index(&self, file: &mut File) -> io::Result<bool> {
        let mut index = self.index.lock().map_err(|_| poisoned())?;
        let len = file.metadata()?.len();
        if len < index.offset {
            *index = PickIndex::default();
        }
        file.seek(SeekFrom::Start(index.offset))?;
        let mut reader = BufReader::new(Read::by_ref(file));
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf)?;
            if n == 0 || buf.last() != Some(&b'\n') {
                break;
            }
            index.offset += n as u64;
            if let Ok(record) = serde_json::from_slice::<DecisionRecord>(&buf) {
                index.ids.insert(record.pick_id);
            }
        }
        Ok(index.offset < len)
    }

    fn knows(&self, pick_id: &str) -> io::Result<bool> {
        Ok(self.index.lock().map_err(|_| poisoned())?.ids.contains(pick_id))
    }

    /// Appends one decision under an exclusive lock. A pick id already in
    /// the log is not written again.
    pub fn persist(&self, record: &DecisionRecord) -> io::Result<PersistOutcome> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.decisions_path)?;
        let mut lock = RwLock::new(file);
        let mut guard = lock.write()?;

        let torn_tail = self.refresh_index(&mut guard)?;
        if self.knows(&record.pick_id)? {
            log_persist(&record.pick_id, "already_present", None);
            return Ok(PersistOutcome::AlreadyPresent);
        }

        let mut line = Vec::new();
        if torn_tail {
            // keep the torn fragment on its own line
            line.push(b'\n');
        }
        serde_json::to_writer(&mut line, record)?;
        line.push(b'\n');
        guard.write_all(&line)?;
        guard.sync_data()?;

        self.index
            .lock()
            .map_err(|_| poisoned())?
            .ids
            .insert(record.pick_id.clone());
        log_persist(&record.pick_id, "appended", None);
        Ok(PersistOutcome::Appended)
    }

    /// Current overlay per pick, plus (lines, parse errors) of the grade file.
    fn read_overlay(&self) -> io::Result<(HashMap<String, GradeLabel>, usize, usize)> {
        let mut overlay = HashMap::new();
        let (mut total, mut errors) = (0, 0);
        for_each_line(&self.grades_path, |line| {
            total += 1;
            match serde_json::from_slice::<GradeLabel>(line) {
                Ok(label) => merge_label(&mut overlay, label),
                Err(_) => errors += 1,
            }
        })?;
        Ok((overlay, total, errors))
    }

    /// Streams both files and merges the overlay. Malformed lines are
    /// skipped and counted, never fatal.
    pub fn load(&self, filter: &LoadFilter) -> io::Result<LoadReport> {
        let mut report = LoadReport::default();

        let mut seen: HashSet<String> = HashSet::new();
        let mut decisions: Vec<DecisionRecord> = Vec::new();
        for_each_line(&self.decisions_path, |line| {
            report.total_lines += 1;
            match serde_json::from_slice::<DecisionRecord>(line) {
                Ok(record) => {
                    report.parsed_ok += 1;
                    if seen.insert(record.pick_id.clone()) {
                        decisions.push(record);
                    } else {
                        report.duplicates += 1;
                    }
                }
                Err(_) => report.parse_errors += 1,
            }
        })?;

        let (overlay, grade_lines, grade_errors) = self.read_overlay()?;
        report.grade_lines = grade_lines;
        report.grade_parse_errors = grade_errors;
        report.orphan_grades = overlay.keys().filter(|id| !seen.contains(*id)).count();

        for record in decisions {
            let grade = overlay.get(&record.pick_id).cloned();
            let graded = GradedRecord { record, grade };
            if filter.admits(&graded) {
                report.records.push(graded);
            } else {
                report.filtered_out += 1;
            }
        }

        if report.parse_errors > 0 || report.grade_parse_errors > 0 {
            log(
                Level::Warn,
                Domain::Store,
                "malformed_lines",
                obj(&[
                    ("decision_errors", serde_json::json!(report.parse_errors)),
                    ("grade_errors", serde_json::json!(report.grade_parse_errors)),
                    ("path", v_str(&self.dir.to_string_lossy())),
                ]),
            );
        }
        Ok(report)
    }

    pub fn attach_grade(&self, label: &GradeLabel) -> io::Result<GradeOutcome> {
        let mut outcomes = self.attach_all(std::slice::from_ref(label))?;
        Ok(outcomes.pop().unwrap_or(GradeOutcome::Orphan))
    }

    pub fn attach_grades(&self, labels: &[GradeLabel]) -> io::Result<GradingSummary> {
        let mut summary = GradingSummary::default();
        for outcome in self.attach_all(labels)? {
            summary.count(outcome);
        }
        Ok(summary)
    }

    /// Appends labels to the overlay under one lock. Unknown picks are
    /// refused. A label that repeats the current verdict, or would not
    /// supersede it, is a no-op, so re-fetching a pick's history is
    /// idempotent.
    fn attach_all(&self, labels: &[GradeLabel]) -> io::Result<Vec<GradeOutcome>> {
        if let Ok(mut decisions) = File::open(&self.decisions_path) {
            self.refresh_index(&mut decisions)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.grades_path)?;
        let mut lock = RwLock::new(file);
        let mut guard = lock.write()?;

        let (mut current, _, _) = self.read_overlay()?;

        let mut outcomes = Vec::with_capacity(labels.len());
        let mut out = Vec::new();
        for label in labels {
            if !self.knows(&label.pick_id)? {
                log(
                    Level::Warn,
                    Domain::Store,
                    "orphan_grade",
                    obj(&[("pick_id", v_str(&label.pick_id))]),
                );
                outcomes.push(GradeOutcome::Orphan);
                continue;
            }
            let unchanged = current
                .get(&label.pick_id)
                .map(|c| c.same_verdict(label) || !label.supersedes(c))
                .unwrap_or(false);
            if unchanged {
                outcomes.push(GradeOutcome::Unchanged);
                continue;
            }
            serde_json::to_writer(&mut out, label)?;
            out.push(b'\n');
            current.insert(label.pick_id.clone(), label.clone());
            outcomes.push(GradeOutcome::Attached);
        }

        if !out.is_empty() {
            guard.write_all(&out)?;
            guard.sync_data()?;
        }
        Ok(outcomes)
    }

    pub fn health(&self) -> StoreHealth {
        StoreHealth {
            decisions: FileHealth::probe(&self.decisions_path),
            grades: FileHealth::probe(&self.grades_path),
            weights: FileHealth::probe(&self.dir.join(WEIGHTS_FILE)),
            checked_at: now_ts(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::CandidateIdentity;
    use crate::tier::PublicTier;
    use super::record::GradeResult;

    fn record(event: &str, category: Category, emitted_at: u64) -> DecisionRecord {
        let identity = CandidateIdentity {
            candidate_id: format!("c-{}", event),
            category,
            event_id: event.to_string(),
            market: "total".to_string(),
            selection: "OVER".to_string(),
            line: Some(210.5),
        };
        DecisionRecord {
            pick_id: identity.pick_id(),
            identity,
            sources: vec![],
            context: Default::default(),
            context_modifier: 0.0,
            boosts: vec![],
            base_score: 7.2,
            total_boost: 0.0,
            final_score: 7.2,
            tier: PublicTier::Standard,
            weights_version: 0,
            emitted_at,
        }
    }

    #[test]
    fn test_persist_dedupes_by_pick_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = DecisionStore::open(dir.path()).unwrap();
        let r = record("E1", Category::Game, 100);
        assert_eq!(store.persist(&r).unwrap(), PersistOutcome::Appended);
        assert_eq!(store.persist(&r).unwrap(), PersistOutcome::AlreadyPresent);

        // a second handle sees the first one's append
        let other = DecisionStore::open(dir.path()).unwrap();
        assert_eq!(other.persist(&r).unwrap(), PersistOutcome::AlreadyPresent);
        assert_eq!(store.load(&LoadFilter::all()).unwrap().records.len(), 1);
    }

    #[test]
    fn test_torn_tail_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store = DecisionStore::open(dir.path()).unwrap();
        store.persist(&record("E1", Category::Game, 100)).unwrap();
        {
            let mut f = OpenOptions::new().append(true).open(store.decisions_path()).unwrap();
            f.write_all(b"{\"pick_id\":\"trunc").unwrap();
        }
        store.persist(&record("E2", Category::Game, 101)).unwrap();

        let report = store.load(&LoadFilter::all()).unwrap();
        assert_eq!(report.total_lines, 3);
        assert_eq!(report.parsed_ok, 2);
        assert_eq!(report.parse_errors, 1);
        assert!(report.reconciles());
    }

    #[test]
    fn test_filters() {
        let dir = tempfile::tempdir().unwrap();
        let store = DecisionStore::open(dir.path()).unwrap();
        let a = record("E1", Category::Game, 100);
        store.persist(&a).unwrap();
        store.persist(&record("E2", Category::Prop, 200)).unwrap();
        store.persist(&record("E3", Category::Game, 300)).unwrap();
        store
            .attach_grade(&GradeLabel {
                pick_id: a.pick_id.clone(),
                result: Some(GradeResult::Win),
                actual_value: Some(215.0),
                graded_at: 400,
            })
            .unwrap();

        let games = store
            .load(&LoadFilter {
                category: Some(Category::Game),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(games.records.len(), 2);
        assert_eq!(games.filtered_out, 1);

        let recent = store
            .load(&LoadFilter {
                since: Some(200),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(recent.records.len(), 2);

        let graded = store
            .load(&LoadFilter {
                graded_only: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(graded.records.len(), 1);
        assert_eq!(graded.records[0].result(), Some(GradeResult::Win));
        assert!(graded.reconciles());
    }

    fn label(pick_id: &str, result: Option<GradeResult>, graded_at: u64) -> GradeLabel {
        GradeLabel {
            pick_id: pick_id.to_string(),
            result,
            actual_value: None,
            graded_at,
        }
    }

    fn grade_lines(store: &DecisionStore) -> usize {
        std::fs::read_to_string(store.grades_path())
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    #[test]
    fn test_refetching_history_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = DecisionStore::open(dir.path()).unwrap();
        let r = record("E1", Category::Game, 100);
        store.persist(&r).unwrap();
        let history = [label(&r.pick_id, None, 1_000), label(&r.pick_id, Some(GradeResult::Win), 2_000)];

        let first = store.attach_grades(&history).unwrap();
        assert_eq!(first.attached, 2);
        assert_eq!(grade_lines(&store), 2);

        let second = store.attach_grades(&history).unwrap();
        assert_eq!(second.attached, 0);
        assert_eq!(second.unchanged, 2);
        assert_eq!(grade_lines(&store), 2);

        let loaded = store.load(&LoadFilter::all()).unwrap();
        assert_eq!(loaded.records[0].result(), Some(GradeResult::Win));
    }

    #[test]
    fn test_stale_pending_never_erases_result() {
        let dir = tempfile::tempdir().unwrap();
        let store = DecisionStore::open(dir.path()).unwrap();
        let r = record("E1", Category::Game, 100);
        store.persist(&r).unwrap();

        let summary = store
            .attach_grades(&[label(&r.pick_id, Some(GradeResult::Win), 2_000), label(&r.pick_id, None, 1_000)])
            .unwrap();
        assert_eq!(summary.attached, 1);
        assert_eq!(summary.unchanged, 1);
        // a later pending acknowledgement does not reopen a settled pick
        assert_eq!(
            store.attach_grade(&label(&r.pick_id, None, 9_000)).unwrap(),
            GradeOutcome::Unchanged
        );
        assert_eq!(store.load(&LoadFilter::all()).unwrap().records[0].result(), Some(GradeResult::Win));
    }

    #[test]
    fn test_overlay_merge_orders_by_graded_at() {
        let dir = tempfile::tempdir().unwrap();
        let store = DecisionStore::open(dir.path()).unwrap();
        let r = record("E1", Category::Game, 100);
        store.persist(&r).unwrap();
        {
            // written out of order by some other tool
            let mut f = OpenOptions::new().create(true).append(true).open(store.grades_path()).unwrap();
            for l in [
                label(&r.pick_id, Some(GradeResult::Loss), 3_000),
                label(&r.pick_id, Some(GradeResult::Win), 2_000),
                label(&r.pick_id, None, 4_000),
            ] {
                writeln!(f, "{}", serde_json::to_string(&l).unwrap()).unwrap();
            }
        }
        let loaded = store.load(&LoadFilter::all()).unwrap();
        assert_eq!(loaded.grade_lines, 3);
        assert_eq!(loaded.records[0].result(), Some(GradeResult::Loss));
    }

    #[test]
    fn test_health_reports_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = DecisionStore::open(dir.path()).unwrap();
        assert!(!store.health().decisions.exists);
        store.persist(&record("E1", Category::Game, 100)).unwrap();
        let h = store.health();
        assert!(h.is_serving());
        assert_eq!(h.decisions.line_count, 1);
        assert!(!h.grades.exists);
        assert!(!h.weights.exists);
    }
}
