use anyhow::Result;
use rusqlite::{params, Connection};
use serde::Serialize;

use crate::learning::{CycleOutcome, CycleReport};

/// One row of the learning ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub ran_at: u64,
    pub outcome: String,
    pub reason: Option<String>,
    pub eligible: u64,
    pub total_loaded: u64,
    pub previous_version: u64,
    pub version: Option<u64>,
    pub schema_hash: String,
}

/// SQLite history of learning cycles, kept next to the weight file.
pub struct LearningLedger {
    conn: Connection,
}

impl LearningLedger {
    pub fn new(path: &str) -> Result<Self> {
        Ok(Self { conn: Connection::open(path)? })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
        })
    }

    pub fn init(&mut self) -> Result<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS cycles (
                ran_at INTEGER NOT NULL,
                outcome TEXT NOT NULL,
                reason TEXT,
                eligible INTEGER NOT NULL,
                total_loaded INTEGER NOT NULL,
                previous_version INTEGER NOT NULL,
                version INTEGER,
                schema_hash TEXT NOT NULL,
                report TEXT NOT NULL
            );
            COMMIT;",
        )?;
        Ok(())
    }

    pub fn record_cycle(&mut self, report: &CycleReport) -> Result<()> {
        let (outcome, reason, version) = match &report.outcome {
            CycleOutcome::Updated { version } => ("updated", None, Some(*version as i64)),
            CycleOutcome::Aborted { reason } => ("aborted", Some(reason.clone()), None),
        };
        let body = serde_json::to_string(report)?;
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO cycles (ran_at, outcome, reason, eligible, total_loaded, previous_version, version, schema_hash, report)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                report.ran_at as i64,
                outcome,
                reason,
                report.counts.eligible as i64,
                report.counts.total_loaded as i64,
                report.previous_version as i64,
                version,
                report.schema_hash,
                body
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Most recent cycles first.
    pub fn recent(&self, limit: usize) -> Result<Vec<LedgerEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT ran_at, outcome, reason, eligible, total_loaded, previous_version, version, schema_hash
             FROM cycles ORDER BY ran_at DESC, rowid DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(LedgerEntry {
                ran_at: row.get::<_, i64>(0)? as u64,
                outcome: row.get(1)?,
                reason: row.get(2)?,
                eligible: row.get::<_, i64>(3)? as u64,
                total_loaded: row.get::<_, i64>(4)? as u64,
                previous_version: row.get::<_, i64>(5)? as u64,
                version: row.get::<_, Option<i64>>(6)?.map(|v| v as u64),
                schema_hash: row.get(7)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
