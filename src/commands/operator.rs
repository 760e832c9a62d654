//! Boots the Policy Reconciler and Action Reconciler controllers side by
//! side against one shared metrics/health HTTP server, following the
//! teacher's `commands/reconcile.rs` bootstrap: force-init metrics, spawn
//! the HTTP server, run the controller stream(s) until Ctrl+C, then signal
//! a graceful shutdown over a broadcast channel.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::controller::Controller;
use kube::Client;
use tokio::signal;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use healer::action_reconciler::{self, ActionReconcileContext};
use healer::config::Configuration;
use healer::crd::{HealingAction, HealingPolicy};
use healer::engine::RemediationEngine;
use healer::executors::ExecutorRegistry;
use healer::metrics::{self, ReadyState};
use healer::metrics_backend::{BuiltinMetricsSource, HttpTimeSeriesBackend, TimeSeriesBackend};
use healer::policy_reconciler::{self, PolicyReconcileContext};
use healer::recorder::ActionRecorder;
use healer::safety::{CircuitBreakerConfig, CircuitBreakerRegistry, SafetyController};
use healer::triggers::MetricCache;

pub async fn run(metrics_addr: String, config_path: Option<String>) -> Result<()> {
    println!("Starting healer controller...\n");

    let config = Configuration::load(Configuration::resolve_path(config_path).as_deref())
        .context("failed to load configuration")?;

    let client = Client::try_default().await.context("Failed to load kubeconfig")?;

    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {e}. Is the cluster running?");
        }
    }

    let recorder = Arc::new(ActionRecorder::new(chrono::Duration::seconds(config.metrics.retention_seconds as i64)));

    let breakers = CircuitBreakerRegistry::new(CircuitBreakerConfig {
        failure_threshold: config.safety.circuit_breaker.failure_threshold,
        success_threshold: config.safety.circuit_breaker.success_threshold,
        timeout: chrono::Duration::seconds(config.safety.circuit_breaker.timeout_seconds as i64),
    });

    let safety = Arc::new(SafetyController {
        global_dry_run: config.safety.dry_run_mode,
        global_require_approval: config.safety.require_approval,
        protected_namespaces: config.safety.protected_namespaces.clone(),
        protected_labels: config.safety.protected_labels.clone(),
        default_max_actions_per_hour: config.safety.max_actions_per_hour,
        breakers,
    });

    let backend: Arc<dyn TimeSeriesBackend> = match &config.metrics.backend_url {
        Some(url) => Arc::new(HttpTimeSeriesBackend::new(url.clone())),
        None => Arc::new(BuiltinMetricsSource::new()),
    };
    let cache = Arc::new(MetricCache::new(chrono::Duration::seconds(config.metrics.collection_interval_seconds as i64)));

    let engine = Arc::new(RemediationEngine::new(client.clone(), ExecutorRegistry::with_builtins(), recorder.clone()));

    let policy_ctx = Arc::new(PolicyReconcileContext {
        client: client.clone(),
        safety: safety.clone(),
        recorder: recorder.clone(),
        backend,
        cache,
        default_action_timeout_seconds: config.remediation.default_timeout_seconds,
        default_retry_policy: healer::crd::RetryPolicy {
            max_attempts: config.remediation.max_retries,
            initial_backoff_seconds: config.remediation.retry_backoff_seconds,
            multiplier: 2.0,
        },
    });

    let action_ctx = Arc::new(ActionReconcileContext { client: client.clone(), engine, safety });

    metrics::force_init();
    let addr: SocketAddr = metrics_addr.parse().context("invalid --metrics-addr")?;
    let ready_state = Arc::new(Mutex::new(ReadyState::default()));
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let http_shutdown = shutdown_tx.subscribe();
    let http_state = ready_state.clone();
    let http_handle = tokio::spawn(async move { metrics::serve(http_state, http_shutdown, addr).await });

    // R2: periodic purge of recorder entries older than the retention horizon.
    let purge_recorder = recorder.clone();
    let mut purge_shutdown = shutdown_tx.subscribe();
    let purge_interval = std::time::Duration::from_secs(config.metrics.collection_interval_seconds.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(purge_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => purge_recorder.purge_expired().await,
                _ = purge_shutdown.recv() => break,
            }
        }
    });

    println!("  Metrics server .............. http://{addr}");
    println!("Operator running. Press Ctrl+C to stop.\n");
    info!("healer_controller_started");

    let policies: Api<HealingPolicy> = Api::all(client.clone());
    let actions: Api<HealingAction> = Api::all(client.clone());

    let policy_ready = ready_state.clone();
    let policy_controller = Controller::new(policies, Default::default()).run(policy_reconciler::reconcile, policy_reconciler::error_policy, policy_ctx).for_each(
        move |result| {
            let state = policy_ready.clone();
            async move {
                state.lock().await.ready = true;
                if let Err(e) = result {
                    warn!(error = %e, "policy_reconcile_dispatch_error");
                }
            }
        },
    );

    let action_ready = ready_state.clone();
    let action_controller = Controller::new(actions, Default::default()).run(action_reconciler::reconcile, action_reconciler::error_policy, action_ctx).for_each(
        move |result| {
            let state = action_ready.clone();
            async move {
                state.lock().await.ready = true;
                if let Err(e) = result {
                    warn!(error = %e, "action_reconcile_dispatch_error");
                }
            }
        },
    );

    tokio::select! {
        _ = policy_controller => info!("policy_controller_stream_ended"),
        _ = action_controller => info!("action_controller_stream_ended"),
        _ = signal::ctrl_c() => {
            info!("shutdown_signal_received");
            println!("\nShutdown signal received. Stopping healer...");
        }
    }

    let _ = shutdown_tx.send(());
    let _ = http_handle.await?;

    info!("healer_controller_stopped");
    println!("Healer stopped.");
    Ok(())
}
