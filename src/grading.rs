//! Outcome labels from an external oracle.

use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use url::Url;

use crate::logging::{log, obj, v_str, Domain, Level};
use crate::store::record::GradeLabel;
use crate::store::{DecisionStore, GradingSummary};

/// Source of grade labels. Fetching is idempotent: asking again for the same
/// window returns the same labels, and the store ignores repeats.
#[async_trait]
pub trait GradingOracle: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_grades(&self, since: u64) -> Result<Vec<GradeLabel>>;
}

/// `GET <base>/grades?since=<epoch>` returning a JSON array of labels.
pub struct HttpGradingOracle {
    endpoint: Url,
    client: Client,
}

impl HttpGradingOracle {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let mut base = Url::parse(base_url).context("invalid grading url")?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            endpoint: base.join("grades")?,
            client: Client::builder().timeout(timeout).build()?,
        })
    }
}

#[async_trait]
impl GradingOracle for HttpGradingOracle {
    fn name(&self) -> &str {
        "http"
    }

    async fn fetch_grades(&self, since: u64) -> Result<Vec<GradeLabel>> {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut().append_pair("since", &since.to_string());
        let resp = self.client.get(url).send().await.context("grading oracle unreachable")?;
        if !resp.status().is_success() {
            return Err(anyhow!("grading oracle returned {}", resp.status()));
        }
        Ok(resp.json().await?)
    }
}

/// Labels from a local JSONL file, one label per line. Malformed lines are
/// skipped with a warning.
pub struct JsonlGradingOracle {
    path: PathBuf,
}

impl JsonlGradingOracle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl GradingOracle for JsonlGradingOracle {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn fetch_grades(&self, since: u64) -> Result<Vec<GradeLabel>> {
        let file = std::fs::File::open(&self.path)
            .with_context(|| format!("opening grades file {}", self.path.display()))?;
        let mut labels = Vec::new();
        let mut skipped = 0usize;
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<GradeLabel>(&line) {
                Ok(label) if label.graded_at >= since => labels.push(label),
                Ok(_) => {}
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            log(
                Level::Warn,
                Domain::Grade,
                "malformed_labels",
                obj(&[
                    ("path", v_str(&self.path.to_string_lossy())),
                    ("skipped", json!(skipped)),
                ]),
            );
        }
        Ok(labels)
    }
}

/// Fetches labels since `since` and attaches them to the store.
pub async fn run_grading(oracle: &dyn GradingOracle, store: &DecisionStore, since: u64) -> Result<GradingSummary> {
    let labels = oracle.fetch_grades(since).await?;
    let summary = store.attach_grades(&labels).context("attaching grades")?;
    log(
        Level::Info,
        Domain::Grade,
        "grading_run",
        obj(&[
            ("oracle", v_str(oracle.name())),
            ("since", json!(since)),
            ("submitted", json!(summary.submitted)),
            ("attached", json!(summary.attached)),
            ("unchanged", json!(summary.unchanged)),
            ("orphaned", json!(summary.orphaned)),
        ]),
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_jsonl_oracle_skips_bad_lines_and_old_labels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("labels.jsonl");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, r#"{{"pick_id":"a","result":"WIN","graded_at":500}}"#).unwrap();
        writeln!(f, "not json").unwrap();
        writeln!(f).unwrap();
        writeln!(f, r#"{{"pick_id":"b","result":"LOSS","graded_at":50}}"#).unwrap();
        writeln!(f, r#"{{"pick_id":"c","graded_at":600}}"#).unwrap();

        let labels = JsonlGradingOracle::new(&path).fetch_grades(100).await.unwrap();
        let ids: Vec<&str> = labels.iter().map(|l| l.pick_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert!(labels[1].result.is_none());
    }

    #[test]
    fn test_http_oracle_endpoint() {
        let o = HttpGradingOracle::new("https://oracle.local/api", Duration::from_secs(5)).unwrap();
        assert_eq!(o.endpoint.as_str(), "https://oracle.local/api/grades");
    }
}
