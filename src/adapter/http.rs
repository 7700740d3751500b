use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use super::types::{SourceResult, SourceStatus};
use super::unified::SourceAdapter;
use crate::candidate::CandidateIdentity;
use crate::reliability::retry::is_retryable_http_error;

/// Wire shape of a remote scoring service reply.
#[derive(Deserialize, Debug)]
struct RemoteScore {
    score: Option<f64>,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    reasons: Vec<String>,
    #[serde(default)]
    breakdown: BTreeMap<String, f64>,
}

/// Scoring source behind an HTTP endpoint. The identity is POSTed as JSON to
/// `<base>/evaluate`; a reply without a score is NO_DATA.
pub struct HttpSourceAdapter {
    id: String,
    endpoint: Url,
    client: Client,
}

impl HttpSourceAdapter {
    pub fn new(id: &str, base_url: &str) -> Result<Self> {
        let mut base = Url::parse(base_url).with_context(|| format!("invalid url for source {}", id))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = base.join("evaluate")?;
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            id: id.to_string(),
            endpoint,
            client,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl SourceAdapter for HttpSourceAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    async fn evaluate(&self, identity: &CandidateIdentity) -> Result<SourceResult> {
        let resp = self
            .client
            .post(self.endpoint.clone())
            .json(identity)
            .send()
            .await
            .with_context(|| format!("source {} unreachable", self.id))?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let kind = if is_retryable_http_error(status) { "transient" } else { "permanent" };
            return Err(anyhow!("source {} returned {} ({})", self.id, status, kind));
        }

        let body: RemoteScore = resp.json().await?;
        Ok(match body.score {
            Some(score) => SourceResult::success(
                &self.id,
                score,
                body.confidence,
                body.reasons,
                body.breakdown,
                self.neutral_score(),
            ),
            None => SourceResult::degraded(&self.id, SourceStatus::NoData, self.neutral_score(), "remote returned no score"),
        })
    }
}
