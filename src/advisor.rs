//! Optional advisory/LLM service client. The core never blindly trusts
//! recommendations: anything below `minConfidence` is discarded before it
//! ever reaches C3/C4. Same optional-external-collaborator shape as
//! `metrics_backend.rs` — a trait plus an HTTP implementation built on
//! `reqwest`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub policy_name: String,
    pub target_key: String,
    pub condition_summary: String,
    pub recent_metric_values: Vec<(String, f64)>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Recommendation {
    pub action_type: String,
    pub target_ref: String,
    pub confidence: f64,
    pub reasoning: String,
    #[serde(default)]
    pub alternatives: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum AdvisorError {
    #[error("advisory service unreachable: {0}")]
    Unreachable(String),
    #[error("malformed advisory response: {0}")]
    Malformed(String),
}

#[async_trait::async_trait]
pub trait Advisor: Send + Sync {
    async fn analyze(&self, snapshot: &StateSnapshot) -> Result<Vec<Recommendation>, AdvisorError>;
}

/// Filters out recommendations below `min_confidence`, recording the drop
/// count via the `ADVISOR_ALTERNATIVES_CONSIDERED`/confidence-histogram
/// metrics at the call site, not here (this stays a pure filter so it is
/// trivially unit-testable).
pub fn filter_by_confidence(recommendations: Vec<Recommendation>, min_confidence: f64) -> Vec<Recommendation> {
    recommendations.into_iter().filter(|r| r.confidence >= min_confidence).collect()
}

/// HTTP client for a JSON advisory endpoint. The wire schema is treated as
/// an implementation detail of the external service; only the
/// `Vec<Recommendation>` contract is load-bearing here.
pub struct HttpAdvisor {
    endpoint: String,
    client: reqwest::Client,
    timeout: std::time::Duration,
}

impl HttpAdvisor {
    pub fn new(endpoint: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

#[derive(Deserialize)]
struct AdvisorResponse {
    recommendations: Vec<Recommendation>,
}

#[async_trait::async_trait]
impl Advisor for HttpAdvisor {
    async fn analyze(&self, snapshot: &StateSnapshot) -> Result<Vec<Recommendation>, AdvisorError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(snapshot)
            .send()
            .await
            .map_err(|e| AdvisorError::Unreachable(e.to_string()))?;

        let parsed: AdvisorResponse = resp
            .json()
            .await
            .map_err(|e| AdvisorError::Malformed(e.to_string()))?;

        Ok(parsed.recommendations)
    }
}

/// Advisor that always returns no recommendations — the default when no
/// `advisor.endpoint` is configured, so the engine never has to special-
/// case "advisor absent" beyond constructing this instead of an HTTP one.
pub struct NullAdvisor;

#[async_trait::async_trait]
impl Advisor for NullAdvisor {
    async fn analyze(&self, _snapshot: &StateSnapshot) -> Result<Vec<Recommendation>, AdvisorError> {
        Ok(vec![])
    }
}
