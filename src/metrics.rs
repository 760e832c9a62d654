//! Prometheus metrics exposition and the shared `/healthz` `/readyz`
//! `/metrics` HTTP surface, using a force-init-then-serve pattern so every
//! metric shows up on `/metrics` from the first scrape. Shared by both the
//! Policy Reconciler and the Action Reconciler commands.

use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};

use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use tokio::sync::{Mutex, broadcast};
use tracing::info;

static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static POLICY_RECONCILE_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("healer_policy_reconcile_total", "Total policy reconciliation cycles")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static POLICY_RECONCILE_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("healer_policy_reconcile_errors_total", "Total policy reconciliation errors")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static ACTION_RECONCILE_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("healer_action_reconcile_total", "Total action reconciliation cycles")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static ACTION_RECONCILE_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("healer_action_reconcile_errors_total", "Total action reconciliation errors")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static TRIGGER_EVALUATIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        Opts::new("healer_trigger_evaluations_total", "Trigger evaluations by kind and outcome"),
        &["kind", "fired"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

/// `healing_actions_total{action_type, namespace, status, trigger_type}`.
pub static HEALING_ACTIONS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        Opts::new("healing_actions_total", "Healing actions by type, namespace, status and trigger"),
        &["action_type", "namespace", "status", "trigger_type"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static CIRCUIT_BREAKER_STATE: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let g = IntGaugeVec::new(
        Opts::new("healer_circuit_breaker_state", "Circuit breaker state per policy (0=closed,1=open,2=half_open)"),
        &["policy"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(g.clone())).expect("metric not yet registered");
    g
});

pub static RATE_LIMIT_REJECTIONS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        Opts::new("healer_rate_limit_rejections_total", "Rate-limit rejections per policy"),
        &["policy"],
    )
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static ADVISOR_CONFIDENCE: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(HistogramOpts::new(
        "healer_advisor_confidence",
        "Confidence score distribution of advisor recommendations",
    ))
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(h.clone())).expect("metric not yet registered");
    h
});

pub static ADVISOR_ALTERNATIVES_CONSIDERED: LazyLock<IntCounter> = LazyLock::new(|| {
    let c = IntCounter::new("healer_advisor_alternatives_considered_total", "Total alternative remediations considered by the advisor")
        .expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

pub static POLICY_RECONCILE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(HistogramOpts::new(
        "healer_policy_reconcile_duration_seconds",
        "Duration of each policy reconciliation cycle",
    ))
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(h.clone())).expect("metric not yet registered");
    h
});

pub static ACTION_RECONCILE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(HistogramOpts::new(
        "healer_action_reconcile_duration_seconds",
        "Duration of each action reconciliation cycle",
    ))
    .expect("metric definition is valid");
    REGISTRY.register(Box::new(h.clone())).expect("metric not yet registered");
    h
});

/// Force every metric's LazyLock so it appears on `/metrics` before its
/// first increment.
pub fn force_init() {
    LazyLock::force(&POLICY_RECONCILE_TOTAL);
    LazyLock::force(&POLICY_RECONCILE_ERRORS);
    LazyLock::force(&ACTION_RECONCILE_TOTAL);
    LazyLock::force(&ACTION_RECONCILE_ERRORS);
    LazyLock::force(&TRIGGER_EVALUATIONS);
    LazyLock::force(&HEALING_ACTIONS_TOTAL);
    LazyLock::force(&CIRCUIT_BREAKER_STATE);
    LazyLock::force(&RATE_LIMIT_REJECTIONS);
    LazyLock::force(&ADVISOR_CONFIDENCE);
    LazyLock::force(&ADVISOR_ALTERNATIVES_CONSIDERED);
    LazyLock::force(&POLICY_RECONCILE_DURATION);
    LazyLock::force(&ACTION_RECONCILE_DURATION);
}

/// Shared readiness flag toggled true after the first successful
/// reconcile dispatch.
#[derive(Debug, Default)]
pub struct ReadyState {
    pub ready: bool,
}

pub fn build_router(state: Arc<Mutex<ReadyState>>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route(
            "/readyz",
            get({
                let state = state.clone();
                move || ready_handler(state.clone())
            }),
        )
}

pub async fn serve(
    state: Arc<Mutex<ReadyState>>,
    mut shutdown: broadcast::Receiver<()>,
    addr: SocketAddr,
) -> anyhow::Result<()> {
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind metrics server on {addr}: {e}"))?;

    info!(%addr, "metrics_server_started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}

async fn ready_handler(state: Arc<Mutex<ReadyState>>) -> impl IntoResponse {
    let state = state.lock().await;
    if state.ready {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
        },
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn healthz_always_ok() {
        let state = Arc::new(Mutex::new(ReadyState::default()));
        let app = build_router(state);
        let res = app
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn readyz_is_503_until_ready() {
        let state = Arc::new(Mutex::new(ReadyState { ready: false }));
        let app = build_router(state.clone());
        let res = app
            .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);

        state.lock().await.ready = true;
        let app = build_router(state);
        let res = app
            .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_endpoint_exposes_forced_metrics() {
        force_init();
        POLICY_RECONCILE_TOTAL.inc();
        let state = Arc::new(Mutex::new(ReadyState::default()));
        let app = build_router(state);
        let res = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body = res.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("healer_policy_reconcile_total"));
        assert!(text.contains("healing_actions_total"));
    }
}
