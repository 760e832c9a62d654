//! Metrics/Trigger Evaluator (C1): resolves a trigger specification against
//! current cluster state and returns fired/not-fired with a human-readable
//! reason. Pure evaluation functions over snapshot data, in the same
//! scoring-function shape as a `governance.rs`-style `evaluate_pod`/
//! `calculate_health_score` pair, generalized to metric/event/condition
//! triggers instead of a fixed pod-health score.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::sync::Mutex;

use crate::crd::{ComparisonOperator, StatusCondition, TargetRef, TriggerSpec};
use crate::errors::TriggerError;
use crate::metrics_backend::{Sample, TimeSeriesBackend};

/// One observed platform event, used by event triggers.
#[derive(Debug, Clone)]
pub struct PlatformEvent {
    pub reason: String,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
}

/// One candidate resource's observed conditions and recent events, handed
/// to the evaluator by the Policy Reconciler for each selector match.
#[derive(Debug, Clone, Default)]
pub struct ResourceObservation {
    pub target: TargetRef,
    pub conditions: Vec<StatusCondition>,
    pub events: Vec<PlatformEvent>,
}

#[derive(Debug, Clone)]
pub struct ObservationContext {
    pub now: DateTime<Utc>,
    pub resources: Vec<ResourceObservation>,
}

/* ============================= SINGLE-FLIGHT CACHE ============================= */

struct CacheEntry {
    fetched_at: DateTime<Utc>,
    samples: Vec<Sample>,
}

/// Caches `(query, window)` range fetches for at most `collectionInterval`
/// (default 30s) and coalesces concurrent fetches of the same key into one
/// backend call.
pub struct MetricCache {
    ttl: chrono::Duration,
    entries: Mutex<HashMap<(String, i64), Arc<Mutex<Option<CacheEntry>>>>>,
}

impl MetricCache {
    pub fn new(ttl: chrono::Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    async fn slot(&self, query: &str, window_seconds: i64) -> Arc<Mutex<Option<CacheEntry>>> {
        let mut entries = self.entries.lock().await;
        entries
            .entry((query.to_string(), window_seconds))
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Fetch `query`'s samples over `[now-window, now]`, sharing one
    /// in-flight fetch across concurrent callers with the same key.
    pub async fn get_or_fetch(
        &self,
        backend: &dyn TimeSeriesBackend,
        query: &str,
        now: DateTime<Utc>,
        window: chrono::Duration,
        step: chrono::Duration,
    ) -> Result<Vec<Sample>, TriggerError> {
        let slot = self.slot(query, window.num_seconds()).await;
        let mut guard = slot.lock().await;

        if let Some(entry) = guard.as_ref() {
            if now - entry.fetched_at < self.ttl {
                return Ok(entry.samples.clone());
            }
        }

        let samples = backend.query_range(query, now - window, now, step).await?;
        *guard = Some(CacheEntry { fetched_at: now, samples: samples.clone() });
        Ok(samples)
    }
}

/* ============================= DERIVED METRICS (§4.1.1) ============================= */

fn ols_slope(samples: &[Sample]) -> Option<f64> {
    if samples.len() < 2 {
        return None;
    }
    let t0 = samples[0].timestamp;
    let xs: Vec<f64> = samples.iter().map(|s| (s.timestamp - t0).num_milliseconds() as f64 / 60_000.0).collect();
    let ys: Vec<f64> = samples.iter().map(|s| s.value).collect();
    let n = xs.len() as f64;
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;
    let mut num = 0.0;
    let mut den = 0.0;
    for (x, y) in xs.iter().zip(ys.iter()) {
        num += (x - mean_x) * (y - mean_y);
        den += (x - mean_x).powi(2);
    }
    if den == 0.0 {
        return Some(0.0);
    }
    Some(num / den)
}

fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.len() != b.len() || a.len() < 2 {
        return None;
    }
    let n = a.len() as f64;
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        cov += (x - mean_a) * (y - mean_b);
        var_a += (x - mean_a).powi(2);
        var_b += (y - mean_b).powi(2);
    }
    if var_a == 0.0 || var_b == 0.0 {
        return None;
    }
    Some(cov / (var_a.sqrt() * var_b.sqrt()))
}

/// Trend windows are `X` trailing minutes at a 15s sampling step;
/// oscillation/correlation use a fixed trailing 5-minute window at the
/// same step.
const DEFAULT_STEP: i64 = 15;

async fn fetch(
    cache: &MetricCache,
    backend: &dyn TimeSeriesBackend,
    now: DateTime<Utc>,
    metric: &str,
    window: chrono::Duration,
) -> Result<Vec<Sample>, TriggerError> {
    cache
        .get_or_fetch(backend, metric, now, window, chrono::Duration::seconds(DEFAULT_STEP))
        .await
}

/// Resolves a derived-metric name from the evaluator's own windowed
/// history, or `None` if `name` isn't a recognized derived form (in which
/// case the caller forwards `name` to the backend unchanged).
async fn resolve_derived(
    cache: &MetricCache,
    backend: &dyn TimeSeriesBackend,
    now: DateTime<Utc>,
    name: &str,
) -> Option<Result<f64, TriggerError>> {
    static TREND_RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let trend_re = TREND_RE.get_or_init(|| Regex::new(r"^(.+)_trend_(\d+)m$").unwrap());

    if let Some(caps) = trend_re.captures(name) {
        let base = caps.get(1).unwrap().as_str();
        let minutes: i64 = caps.get(2).unwrap().as_str().parse().unwrap_or(5);
        let result = async {
            let samples = fetch(cache, backend, now, base, chrono::Duration::minutes(minutes)).await?;
            Ok(ols_slope(&samples).unwrap_or(0.0))
        }
        .await;
        return Some(result);
    }

    if let Some(base) = name.strip_suffix("_oscillation_amplitude") {
        let result = async {
            let samples = fetch(cache, backend, now, base, chrono::Duration::minutes(5)).await?;
            if samples.len() < 10 {
                return Err(TriggerError::NoData(format!(
                    "{name}: need >=10 samples in the trailing 5m window, have {}",
                    samples.len()
                )));
            }
            let max = samples.iter().map(|s| s.value).fold(f64::MIN, f64::max);
            let min = samples.iter().map(|s| s.value).fold(f64::MAX, f64::min);
            Ok(max - min)
        }
        .await;
        return Some(result);
    }

    if name == "correlation_risk_score" {
        let result = async {
            let window = chrono::Duration::minutes(5);
            let cpu = fetch(cache, backend, now, "cpu_usage_percent", window).await?;
            let memory = fetch(cache, backend, now, "memory_usage_percent", window).await?;
            let restarts = fetch(cache, backend, now, "restart_count", window).await?;
            let errors = fetch(cache, backend, now, "error_count", window).await?;

            let series = [&cpu, &memory, &restarts, &errors];
            let len = series.iter().map(|s| s.len()).min().unwrap_or(0);
            if len < 2 {
                return Err(TriggerError::NoData("correlation_risk_score: insufficient samples".to_string()));
            }
            let vals: Vec<Vec<f64>> = series.iter().map(|s| s.iter().take(len).map(|x| x.value).collect()).collect();

            let mut correlations = Vec::new();
            for i in 0..vals.len() {
                for j in (i + 1)..vals.len() {
                    if let Some(r) = pearson(&vals[i], &vals[j]) {
                        correlations.push(r);
                    }
                }
            }
            if correlations.is_empty() {
                return Ok(0.0);
            }
            let mean = correlations.iter().sum::<f64>() / correlations.len() as f64;
            Ok(((mean + 1.0) / 2.0 * 100.0).clamp(0.0, 100.0))
        }
        .await;
        return Some(result);
    }

    if name == "system_health_score" {
        let result = async {
            let healthy = backend.query("healthy_pods", now).await?.unwrap_or(0.0);
            let total = backend.query("total_pods", now).await?.unwrap_or(0.0).max(1.0);
            let total_restarts = backend.query("restart_count", now).await?.unwrap_or(0.0);
            let recent_warnings = backend.query("recent_warnings", now).await?.unwrap_or(0.0);
            let score = 100.0 * (healthy / total) - 2.0 * total_restarts - 5.0 * recent_warnings;
            Ok(score.clamp(0.0, 100.0))
        }
        .await;
        return Some(result);
    }

    if name == "cascade_risk_score" {
        let result = async {
            let avg_restarts = backend.query("avg_restarts", now).await?.unwrap_or(0.0);
            let recent_warnings = backend.query("recent_warnings", now).await?.unwrap_or(0.0);
            let fraction_high_cpu = backend.query("fraction_high_cpu", now).await?.unwrap_or(0.0);
            let fraction_high_memory = backend.query("fraction_high_memory", now).await?.unwrap_or(0.0);
            let score = 10.0 * avg_restarts + 5.0 * recent_warnings + 30.0 * fraction_high_cpu + 40.0 * fraction_high_memory;
            Ok(score.min(100.0))
        }
        .await;
        return Some(result);
    }

    None
}

/* ============================= EVALUATE ============================= */

pub struct EvalResult {
    pub fired: bool,
    pub reason: String,
}

/// C1's single operation. `trigger_name` is used only for cache-key
/// readability in error messages.
pub async fn evaluate(
    trigger_name: &str,
    spec: &TriggerSpec,
    ctx: &ObservationContext,
    backend: &dyn TimeSeriesBackend,
    cache: &MetricCache,
) -> Result<EvalResult, TriggerError> {
    match spec {
        TriggerSpec::Metric { query, threshold, operator, sustain_seconds } => {
            evaluate_metric(query, *threshold, *operator, *sustain_seconds, ctx.now, backend, cache).await
        }
        TriggerSpec::Event { reason_regex, event_type, count_threshold, window_seconds } => {
            evaluate_event(reason_regex, event_type, *count_threshold, *window_seconds, ctx)
        }
        TriggerSpec::Condition { condition_type, expected_status, sustain_seconds } => {
            evaluate_condition(trigger_name, condition_type, expected_status, *sustain_seconds, ctx)
        }
    }
}

async fn evaluate_metric(
    query: &str,
    threshold: f64,
    operator: ComparisonOperator,
    sustain_seconds: u64,
    now: DateTime<Utc>,
    backend: &dyn TimeSeriesBackend,
    cache: &MetricCache,
) -> Result<EvalResult, TriggerError> {
    let window = chrono::Duration::seconds(sustain_seconds.max(1) as i64);

    let samples = if let Some(derived) = resolve_derived(cache, backend, now, query).await {
        let value = derived?;
        vec![Sample { timestamp: now, value }]
    } else {
        fetch(cache, backend, now, query, window).await?
    };

    if samples.is_empty() {
        return Ok(EvalResult { fired: false, reason: "no data".to_string() });
    }

    let all_hold = samples.iter().all(|s| operator.holds(s.value, threshold));
    let reason = if all_hold {
        format!("{query} held {operator:?} {threshold} across {} sample(s)", samples.len())
    } else {
        format!("{query} did not hold {operator:?} {threshold} across the sustain window")
    };
    Ok(EvalResult { fired: all_hold, reason })
}

fn evaluate_event(
    reason_regex: &str,
    event_type: &str,
    count_threshold: u32,
    window_seconds: u64,
    ctx: &ObservationContext,
) -> Result<EvalResult, TriggerError> {
    let re = Regex::new(reason_regex)
        .map_err(|e| TriggerError::MalformedPayload(format!("invalid event reason regex {reason_regex}: {e}")))?;
    let since = ctx.now - chrono::Duration::seconds(window_seconds as i64);

    let count: usize = ctx
        .resources
        .iter()
        .flat_map(|r| r.events.iter())
        .filter(|e| e.event_type == event_type && re.is_match(&e.reason) && e.timestamp >= since)
        .count();

    let fired = count as u32 >= count_threshold;
    Ok(EvalResult {
        fired,
        reason: format!("{count} matching events in the trailing {window_seconds}s window (threshold {count_threshold})"),
    })
}

fn evaluate_condition(
    trigger_name: &str,
    condition_type: &str,
    expected_status: &str,
    sustain_seconds: u64,
    ctx: &ObservationContext,
) -> Result<EvalResult, TriggerError> {
    let cutoff = ctx.now - chrono::Duration::seconds(sustain_seconds as i64);

    let any_sustained = ctx.resources.iter().any(|r| {
        r.conditions.iter().any(|c| {
            c.condition_type == condition_type
                && c.status == expected_status
                && c.last_transition_time <= cutoff
        })
    });

    Ok(EvalResult {
        fired: any_sustained,
        reason: if any_sustained {
            format!("{trigger_name}: condition {condition_type}={expected_status} sustained for >= {sustain_seconds}s")
        } else {
            format!("{trigger_name}: condition {condition_type}={expected_status} not sustained")
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics_backend::BuiltinMetricsSource;

    fn ctx() -> ObservationContext {
        ObservationContext { now: Utc::now(), resources: vec![] }
    }

    #[tokio::test]
    async fn metric_trigger_no_data_does_not_fire() {
        let backend = BuiltinMetricsSource::new();
        let cache = MetricCache::new(chrono::Duration::seconds(30));
        let result = evaluate_metric(
            "memory_usage_percent",
            85.0,
            ComparisonOperator::Gt,
            0,
            Utc::now(),
            &backend,
            &cache,
        )
        .await
        .unwrap();
        assert!(!result.fired);
        assert_eq!(result.reason, "no data");
    }

    #[tokio::test]
    async fn metric_trigger_fires_when_every_sample_holds() {
        let backend = BuiltinMetricsSource::new();
        let now = Utc::now();
        backend.push("memory_usage_percent", Sample { timestamp: now - chrono::Duration::seconds(5), value: 90.0 });
        backend.push("memory_usage_percent", Sample { timestamp: now, value: 95.0 });
        let cache = MetricCache::new(chrono::Duration::seconds(30));
        let result = evaluate_metric("memory_usage_percent", 85.0, ComparisonOperator::Gt, 10, now, &backend, &cache)
            .await
            .unwrap();
        assert!(result.fired);
    }

    #[tokio::test]
    async fn metric_trigger_does_not_fire_if_any_sample_fails() {
        let backend = BuiltinMetricsSource::new();
        let now = Utc::now();
        backend.push("memory_usage_percent", Sample { timestamp: now - chrono::Duration::seconds(5), value: 50.0 });
        backend.push("memory_usage_percent", Sample { timestamp: now, value: 95.0 });
        let cache = MetricCache::new(chrono::Duration::seconds(30));
        let result = evaluate_metric("memory_usage_percent", 85.0, ComparisonOperator::Gt, 10, now, &backend, &cache)
            .await
            .unwrap();
        assert!(!result.fired);
    }

    #[tokio::test]
    async fn cache_coalesces_identical_keys() {
        let backend = BuiltinMetricsSource::new();
        let now = Utc::now();
        backend.push("cpu", Sample { timestamp: now, value: 1.0 });
        let cache = MetricCache::new(chrono::Duration::seconds(30));
        let first = cache.get_or_fetch(&backend, "cpu", now, chrono::Duration::minutes(1), chrono::Duration::seconds(15)).await.unwrap();
        backend.push("cpu", Sample { timestamp: now, value: 2.0 });
        let second = cache.get_or_fetch(&backend, "cpu", now, chrono::Duration::minutes(1), chrono::Duration::seconds(15)).await.unwrap();
        assert_eq!(first.len(), second.len());
    }

    #[test]
    fn event_trigger_counts_matching_reason_and_type_in_window() {
        let now = Utc::now();
        let mut context = ctx();
        context.now = now;
        context.resources.push(ResourceObservation {
            target: TargetRef::default(),
            conditions: vec![],
            events: vec![
                PlatformEvent { reason: "BackOff".to_string(), event_type: "Warning".to_string(), timestamp: now },
                PlatformEvent { reason: "BackOff".to_string(), event_type: "Warning".to_string(), timestamp: now - chrono::Duration::seconds(30) },
                PlatformEvent { reason: "Scheduled".to_string(), event_type: "Normal".to_string(), timestamp: now },
            ],
        });
        let result = evaluate_event("BackOff", "Warning", 2, 300, &context).unwrap();
        assert!(result.fired);
    }

    #[test]
    fn condition_trigger_requires_sustain_duration() {
        let now = Utc::now();
        let mut context = ctx();
        context.now = now;
        context.resources.push(ResourceObservation {
            target: TargetRef::default(),
            conditions: vec![StatusCondition {
                condition_type: "Ready".to_string(),
                status: "False".to_string(),
                reason: "CrashLoop".to_string(),
                message: String::new(),
                last_transition_time: now - chrono::Duration::seconds(5),
            }],
            events: vec![],
        });
        let not_yet = evaluate_condition("t1", "Ready", "False", 60, &context).unwrap();
        assert!(!not_yet.fired);

        context.resources[0].conditions[0].last_transition_time = now - chrono::Duration::seconds(120);
        let sustained = evaluate_condition("t1", "Ready", "False", 60, &context).unwrap();
        assert!(sustained.fired);
    }

    #[tokio::test]
    async fn derived_trend_metric_computes_positive_slope() {
        let backend = BuiltinMetricsSource::new();
        let now = Utc::now();
        backend.push("cpu_usage_percent", Sample { timestamp: now - chrono::Duration::minutes(4), value: 10.0 });
        backend.push("cpu_usage_percent", Sample { timestamp: now - chrono::Duration::minutes(2), value: 30.0 });
        backend.push("cpu_usage_percent", Sample { timestamp: now, value: 50.0 });
        let cache = MetricCache::new(chrono::Duration::seconds(30));
        let value = resolve_derived(&cache, &backend, now, "cpu_usage_percent_trend_5m").await.unwrap().unwrap();
        assert!(value > 0.0);
    }

    #[tokio::test]
    async fn oscillation_amplitude_requires_minimum_samples() {
        let backend = BuiltinMetricsSource::new();
        let now = Utc::now();
        backend.push("cpu", Sample { timestamp: now, value: 10.0 });
        let cache = MetricCache::new(chrono::Duration::seconds(30));
        let result = resolve_derived(&cache, &backend, now, "cpu_oscillation_amplitude").await.unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn unrecognized_name_is_not_derived() {
        let backend = BuiltinMetricsSource::new();
        let cache = MetricCache::new(chrono::Duration::seconds(30));
        let result = resolve_derived(&cache, &backend, Utc::now(), "memory_usage_percent").await;
        assert!(result.is_none());
    }
}
