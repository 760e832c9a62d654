//! The external time-series query backend: `Query`/`QueryRange` plus a
//! health probe. The core treats this as optional — when it is unavailable
//! only the built-in scalar metrics (restart-count, condition-status)
//! remain available. A pluggable client trait keeps `triggers.rs` from
//! depending on a concrete time-series product.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::errors::TriggerError;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// `Query`/`QueryRange` contract a real time-series backend (Prometheus or
/// otherwise) must satisfy. Implementations are free to interpret `query`
/// however their backend expects; the core never parses query syntax.
#[async_trait::async_trait]
pub trait TimeSeriesBackend: Send + Sync {
    async fn query(&self, query: &str, now: DateTime<Utc>) -> Result<Option<f64>, TriggerError>;

    async fn query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: chrono::Duration,
    ) -> Result<Vec<Sample>, TriggerError>;

    async fn healthy(&self) -> bool;
}

/// Talks to a Prometheus-compatible HTTP API (`/api/v1/query`,
/// `/api/v1/query_range`). This is the default non-builtin backend.
pub struct HttpTimeSeriesBackend {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTimeSeriesBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl TimeSeriesBackend for HttpTimeSeriesBackend {
    async fn query(&self, query: &str, now: DateTime<Utc>) -> Result<Option<f64>, TriggerError> {
        let url = format!("{}/api/v1/query", self.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .get(&url)
            .query(&[("query", query), ("time", &now.timestamp().to_string())])
            .send()
            .await
            .map_err(|e| TriggerError::BackendUnavailable(e.to_string()))?;

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| TriggerError::BackendUnavailable(e.to_string()))?;

        let value = body["data"]["result"][0]["value"][1]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok());
        Ok(value)
    }

    async fn query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: chrono::Duration,
    ) -> Result<Vec<Sample>, TriggerError> {
        let url = format!("{}/api/v1/query_range", self.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .get(&url)
            .query(&[
                ("query", query.to_string()),
                ("start", start.timestamp().to_string()),
                ("end", end.timestamp().to_string()),
                ("step", format!("{}s", step.num_seconds().max(1))),
            ])
            .send()
            .await
            .map_err(|e| TriggerError::BackendUnavailable(e.to_string()))?;

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| TriggerError::BackendUnavailable(e.to_string()))?;

        let raw_samples = body["data"]["result"][0]["values"]
            .as_array()
            .cloned()
            .unwrap_or_default();

        let mut samples = Vec::with_capacity(raw_samples.len());
        for pair in raw_samples {
            let Some(arr) = pair.as_array() else { continue };
            let Some(ts) = arr.first().and_then(|v| v.as_f64()) else { continue };
            let Some(value) = arr.get(1).and_then(|v| v.as_str()).and_then(|s| s.parse::<f64>().ok()) else {
                continue;
            };
            samples.push(Sample {
                timestamp: DateTime::from_timestamp(ts as i64, 0).unwrap_or(start),
                value,
            });
        }
        Ok(samples)
    }

    async fn healthy(&self) -> bool {
        let url = format!("{}/-/healthy", self.base_url.trim_end_matches('/'));
        self.client.get(&url).send().await.is_ok_and(|r| r.status().is_success())
    }
}

/// In-memory backend fed directly by the controller's own collectors
/// (pod restart counts, condition transitions). Used when
/// `metrics.useBuiltinMetrics` is set or no `backendURL` is configured.
/// Data is pushed in by whoever observes the cluster (the policy
/// reconciler's resource-snapshot step); this struct only stores and
/// answers range queries over it.
#[derive(Default)]
pub struct BuiltinMetricsSource {
    series: Arc<std::sync::RwLock<BTreeMap<String, Vec<Sample>>>>,
}

impl BuiltinMetricsSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, metric: &str, sample: Sample) {
        let mut series = self.series.write().expect("builtin metrics lock poisoned");
        series.entry(metric.to_string()).or_default().push(sample);
    }
}

#[async_trait::async_trait]
impl TimeSeriesBackend for BuiltinMetricsSource {
    async fn query(&self, query: &str, _now: DateTime<Utc>) -> Result<Option<f64>, TriggerError> {
        let series = self.series.read().expect("builtin metrics lock poisoned");
        Ok(series.get(query).and_then(|s| s.last()).map(|s| s.value))
    }

    async fn query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        _step: chrono::Duration,
    ) -> Result<Vec<Sample>, TriggerError> {
        let series = self.series.read().expect("builtin metrics lock poisoned");
        Ok(series
            .get(query)
            .map(|s| {
                s.iter()
                    .filter(|sample| sample.timestamp >= start && sample.timestamp <= end)
                    .copied()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn healthy(&self) -> bool {
        true
    }
}
