//! Action Reconciler (C6): drives each `HealingAction` through its
//! lifecycle state machine. The state-transition *decision* is a pure
//! function (`decide`), unit-tested independently of any cluster access;
//! `reconcile`/`error_policy`/the finalizer helpers are the async wiring
//! around a second `kube::runtime::controller::Controller` over
//! `HealingAction`.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{Event as FinalizerEvent, finalizer};
use kube::{Client, ResourceExt};
use tracing::{info, warn};

use crate::crd::{ActionPhase, HealingAction, HealingActionSpec, HealingActionStatus};
use crate::engine::RemediationEngine;
use crate::errors::ReconcileError;
use crate::executors::fetch_target;
use crate::metrics::{ACTION_RECONCILE_DURATION, ACTION_RECONCILE_ERRORS, ACTION_RECONCILE_TOTAL, HEALING_ACTIONS_TOTAL};
use crate::safety::{SafetyController, TargetDescriptor};

pub const FINALIZER: &str = "healer.kubeskippy.io/action-cleanup";
const DEFAULT_REQUEUE: StdDuration = StdDuration::from_secs(30);

/// The reconciler's decision for one tick, independent of I/O. `reconcile`
/// below is the only thing that turns a `Decision` into cluster writes.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// A terminal action is left alone; re-running it would be unsafe.
    NoOp,
    /// Pending, approval required and not yet granted.
    AwaitApproval,
    /// Approved → InProgress: dispatch attempt `attempt`.
    Dispatch { attempt: u32 },
    /// Re-enter InProgress after a failure; requeue at `requeue_at`.
    Backoff { requeue_at: DateTime<Utc> },
    /// Terminal transition with its condition reason.
    Terminal { phase: ActionPhase, reason: &'static str },
}

/// Pure decision function for one reconcile tick. Never touches the
/// cluster; `reconcile` interprets the result.
pub fn decide(
    status: &HealingActionStatus,
    spec: &HealingActionSpec,
    now: DateTime<Utc>,
    cancel_requested: bool,
) -> Decision {
    if status.phase.is_terminal() {
        return Decision::NoOp;
    }

    if cancel_requested {
        return Decision::Terminal { phase: ActionPhase::Cancelled, reason: "CancellationRequested" };
    }

    // Timeout check applies in every non-terminal phase (A1: no backward
    // transitions, but Cancelled/Failed can be reached from any phase).
    if let Some(start) = status.start_time {
        if now - start >= chrono::Duration::seconds(spec.timeout_seconds as i64) {
            return Decision::Terminal { phase: ActionPhase::Failed, reason: "Timeout" };
        }
    } else if status.phase == ActionPhase::Pending {
        // Deadline exceeded before any attempt started: Cancelled, not Failed.
        // We only know "not started" when start_time is unset.
    }

    match status.phase {
        ActionPhase::Pending => {
            let needs_approval = spec.approval_required;
            if needs_approval && !status.approval.granted {
                Decision::AwaitApproval
            } else {
                Decision::Dispatch { attempt: status.attempts + 1 }
            }
        }
        ActionPhase::Approved => Decision::Dispatch { attempt: status.attempts + 1 },
        ActionPhase::InProgress => {
            if status.attempts >= spec.retry_policy.max_attempts {
                Decision::Terminal { phase: ActionPhase::Failed, reason: "RetriesExhausted" }
            } else {
                // A3: the next attempt is only eligible once its backoff
                // window (computed from the last attempt) has elapsed.
                // Otherwise this tick is either a retry fired too early, or
                // the watch event from the InProgress status write for the
                // attempt still running; either way, wait it out.
                let last_attempt = status.last_attempt_time.unwrap_or(now);
                let requeue_at = last_attempt + spec.retry_policy.backoff_for_attempt(status.attempts);
                if now < requeue_at {
                    Decision::Backoff { requeue_at }
                } else {
                    Decision::Dispatch { attempt: status.attempts + 1 }
                }
            }
        }
        ActionPhase::Succeeded | ActionPhase::Failed | ActionPhase::Cancelled => Decision::NoOp,
    }
}

/// After a failed attempt, decide whether to retry (with backoff) or fail
/// terminally, per A3/§4.6's "Failed terminal" rule.
pub fn decide_after_failure(status: &HealingActionStatus, spec: &HealingActionSpec, now: DateTime<Utc>) -> Decision {
    let timed_out = status
        .start_time
        .map(|start| now - start >= chrono::Duration::seconds(spec.timeout_seconds as i64))
        .unwrap_or(false);

    if status.attempts >= spec.retry_policy.max_attempts || timed_out {
        return Decision::Terminal { phase: ActionPhase::Failed, reason: "RetriesExhausted" };
    }

    let last_attempt = status.last_attempt_time.unwrap_or(now);
    let backoff = spec.retry_policy.backoff_for_attempt(status.attempts);
    Decision::Backoff { requeue_at: last_attempt + backoff }
}

/* ============================= ASYNC WIRING ============================= */

pub struct ActionReconcileContext {
    pub client: Client,
    pub engine: Arc<RemediationEngine>,
    pub safety: Arc<SafetyController>,
}

pub async fn reconcile(action: Arc<HealingAction>, ctx: Arc<ActionReconcileContext>) -> Result<Action, ReconcileError> {
    let name = action.name_any();
    let namespace = action.namespace().unwrap_or_default();
    let api: Api<HealingAction> = Api::namespaced(ctx.client.clone(), &namespace);

    if action.metadata.deletion_timestamp.is_some() {
        return finalizer(&api, FINALIZER, action.clone(), |event| async move {
            match event {
                FinalizerEvent::Apply(_) | FinalizerEvent::Cleanup(_) => Ok(Action::await_change()),
            }
        })
        .await
        .map_err(|e| ReconcileError::Finalizer(e.to_string()));
    }

    ACTION_RECONCILE_TOTAL.inc();
    let reconcile_start = std::time::Instant::now();
    let now = Utc::now();
    let decision = decide(&action.status.clone().unwrap_or_default(), &action.spec, now, false);

    info!(action = %name, namespace = %namespace, ?decision, "action_reconcile_decided");

    let result = match decision {
        Decision::NoOp => Ok(Action::requeue(DEFAULT_REQUEUE)),
        Decision::AwaitApproval => Ok(Action::requeue(DEFAULT_REQUEUE)),
        Decision::Dispatch { attempt } => dispatch(&api, &action, attempt, ctx.clone(), now).await,
        Decision::Backoff { requeue_at } => {
            let delay = (requeue_at - now).to_std().unwrap_or(StdDuration::from_secs(1));
            Ok(Action::requeue(delay))
        }
        Decision::Terminal { phase, reason } => finalize(&api, &action, phase, reason).await.map(|_| Action::await_change()),
    };

    ACTION_RECONCILE_DURATION.observe(reconcile_start.elapsed().as_secs_f64());
    result
}

async fn dispatch(
    api: &Api<HealingAction>,
    action: &HealingAction,
    attempt: u32,
    ctx: Arc<ActionReconcileContext>,
    now: DateTime<Utc>,
) -> Result<Action, ReconcileError> {
    let name = action.name_any();

    // `safetyRules.requireHealthCheck`: confirm the target still resolves
    // within the configured timeout before committing to an attempt. A
    // failure here is a Safety-kind error (§7): the action stays Pending
    // and is reconsidered on the next tick rather than spending a retry.
    if action.spec.health_check.required {
        let deadline = StdDuration::from_secs(action.spec.health_check.timeout_seconds.max(1));
        let healthy = tokio::time::timeout(deadline, fetch_target(&ctx.client, &action.spec.target))
            .await
            .is_ok_and(|r| r.is_ok());
        if !healthy {
            warn!(action = %name, "action_health_check_failed_target_not_ready");
            return Ok(Action::requeue(StdDuration::from_secs(15)));
        }
    }

    let policy_key = format!("{}/{}", action.spec.policy_ref.namespace, action.spec.policy_ref.name);
    let namespace_label = action.namespace().unwrap_or_default();
    let action_key = format!("{}/{}", namespace_label, name);

    // Run C3 before committing the Approved -> InProgress transition: a
    // Safety-kind rejection (dry-run mismatch, circuit breaker open) must
    // leave the action Pending for reconsideration on the next tick, per
    // §7, so it must not have been written as InProgress in the first
    // place. Validation/Stale/Fatal rejections fail the action terminally
    // and also never need the InProgress write.
    let status_snapshot = action.status.clone().unwrap_or_default();
    let circuit_allows = ctx.safety.breakers.allows(&policy_key).await;
    let (target_resolved, descriptor) = match fetch_target(&ctx.client, &action.spec.target).await {
        Ok(obj) => (
            true,
            TargetDescriptor {
                namespace: obj.metadata.namespace.clone().unwrap_or_default(),
                labels: obj.metadata.labels.clone().unwrap_or_default(),
                annotations: obj.metadata.annotations.clone().unwrap_or_default(),
            },
        ),
        Err(_) => (false, TargetDescriptor::default()),
    };

    let validation = ctx.safety.validate(
        &action.spec,
        &descriptor,
        target_resolved,
        circuit_allows,
        status_snapshot.approval.granted,
    );
    if !validation.valid {
        let reason = validation.reason.unwrap_or_else(|| "safety validation rejected this action".to_string());
        if validation.kind == Some(crate::errors::ErrorKind::Safety) {
            warn!(action = %name, reason = %reason, "action_deferred_by_safety_controller");
            return Ok(Action::requeue(DEFAULT_REQUEUE));
        }
        warn!(action = %name, reason = %reason, "action_rejected_by_safety_controller");
        let mut status = status_snapshot;
        status.phase = ActionPhase::Failed;
        status.completion_time = Some(Utc::now());
        status.result = Some(crate::crd::ActionResultStatus {
            success: false,
            message: None,
            error: Some(reason.clone()),
            metrics: Default::default(),
            changes: vec![],
        });
        patch_status(api, &name, &status).await?;
        add_condition(api, &name, "SafetyRejected", &reason).await?;
        return Ok(Action::await_change());
    }

    let mut status = status_snapshot;
    status.phase = ActionPhase::InProgress;
    status.attempts = attempt;
    status.last_attempt_time = Some(now);
    if status.start_time.is_none() {
        status.start_time = Some(now);
    }
    patch_status(api, &name, &status).await?;

    let result = if action.spec.dry_run {
        ctx.engine.dry_run(&action_key, &action.spec).await
    } else {
        ctx.engine.execute(&action_key, &action.spec).await
    };

    match result {
        Ok(outcome) => {
            ctx.safety.breakers.record_outcome(&policy_key, outcome.success).await;
            HEALING_ACTIONS_TOTAL
                .with_label_values(&[action.spec.action.spec.type_name(), namespace_label.as_str(), "succeeded", "unknown"])
                .inc();
            status.phase = ActionPhase::Succeeded;
            status.completion_time = Some(Utc::now());
            status.result = Some(outcome);
            patch_status(api, &name, &status).await?;
            Ok(Action::await_change())
        }
        Err(e) => {
            ACTION_RECONCILE_ERRORS.inc();
            ctx.safety.breakers.record_outcome(&policy_key, false).await;
            warn!(action = %name, error = %e, "action_execution_failed");

            status.result = Some(crate::crd::ActionResultStatus {
                success: false,
                message: None,
                error: Some(e.to_string()),
                metrics: Default::default(),
                changes: vec![],
            });

            let decision = decide_after_failure(&status, &action.spec, Utc::now());
            match decision {
                Decision::Terminal { phase, reason } => {
                    status.phase = phase;
                    status.completion_time = Some(Utc::now());
                    patch_status(api, &name, &status).await?;
                    add_condition(api, &name, reason, &e.to_string()).await?;
                    HEALING_ACTIONS_TOTAL
                        .with_label_values(&[action.spec.action.spec.type_name(), namespace_label.as_str(), "failed", "unknown"])
                        .inc();
                    Ok(Action::await_change())
                }
                Decision::Backoff { requeue_at } => {
                    patch_status(api, &name, &status).await?;
                    let delay = (requeue_at - Utc::now()).to_std().unwrap_or(StdDuration::from_secs(1));
                    Ok(Action::requeue(delay))
                }
                _ => Ok(Action::requeue(DEFAULT_REQUEUE)),
            }
        }
    }
}

async fn finalize(api: &Api<HealingAction>, action: &HealingAction, phase: ActionPhase, reason: &str) -> Result<(), ReconcileError> {
    let name = action.name_any();
    let mut status = action.status.clone().unwrap_or_default();
    status.phase = phase;
    status.completion_time = Some(Utc::now());
    patch_status(api, &name, &status).await?;
    add_condition(api, &name, reason, reason).await?;
    Ok(())
}

async fn patch_status(api: &Api<HealingAction>, name: &str, status: &HealingActionStatus) -> Result<(), kube::Error> {
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::apply("healer"), &Patch::Merge(&patch)).await?;
    Ok(())
}

async fn add_condition(api: &Api<HealingAction>, name: &str, reason: &str, message: &str) -> Result<(), kube::Error> {
    let condition = crate::crd::StatusCondition {
        condition_type: "Ready".to_string(),
        status: "False".to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time: Utc::now(),
    };
    let patch = serde_json::json!({ "status": { "conditions": [condition] } });
    api.patch_status(name, &PatchParams::apply("healer"), &Patch::Merge(&patch)).await?;
    Ok(())
}

pub fn error_policy(_action: Arc<HealingAction>, error: &ReconcileError, _ctx: Arc<ActionReconcileContext>) -> Action {
    ACTION_RECONCILE_ERRORS.inc();
    warn!(error = %error, "action_reconcile_error");
    Action::requeue(StdDuration::from_secs(60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ActionTemplate, ActionTemplateSpec, ApprovalStatus, PolicyRef, RestartStrategy, RetryPolicy, TargetRef};

    fn spec(approval_required: bool, timeout_seconds: u64, max_attempts: u32) -> HealingActionSpec {
        HealingActionSpec {
            policy_ref: PolicyRef::default(),
            target: TargetRef::default(),
            action: ActionTemplate {
                name: "restart".to_string(),
                spec: ActionTemplateSpec::Restart { strategy: RestartStrategy::Rolling, grace_period_seconds: None },
                priority: 0,
                requires_approval: false,
            },
            approval_required,
            dry_run: false,
            timeout_seconds,
            retry_policy: RetryPolicy { max_attempts, initial_backoff_seconds: 10, multiplier: 2.0 },
            policy_protected_resources: Vec::new(),
            health_check: Default::default(),
        }
    }

    #[test]
    fn terminal_phase_reconcile_is_noop() {
        let status = HealingActionStatus { phase: ActionPhase::Succeeded, ..Default::default() };
        let decision = decide(&status, &spec(false, 300, 3), Utc::now(), false);
        assert_eq!(decision, Decision::NoOp);
    }

    #[test]
    fn pending_without_approval_requirement_dispatches() {
        let status = HealingActionStatus::default();
        let decision = decide(&status, &spec(false, 300, 3), Utc::now(), false);
        assert_eq!(decision, Decision::Dispatch { attempt: 1 });
    }

    #[test]
    fn pending_needing_approval_awaits_it() {
        let status = HealingActionStatus::default();
        let decision = decide(&status, &spec(true, 300, 3), Utc::now(), false);
        assert_eq!(decision, Decision::AwaitApproval);
    }

    #[test]
    fn pending_with_approval_granted_dispatches() {
        let status = HealingActionStatus {
            approval: ApprovalStatus { required: true, granted: true, ..Default::default() },
            ..Default::default()
        };
        let decision = decide(&status, &spec(true, 300, 3), Utc::now(), false);
        assert_eq!(decision, Decision::Dispatch { attempt: 1 });
    }

    #[test]
    fn cancellation_request_overrides_everything() {
        let status = HealingActionStatus { phase: ActionPhase::InProgress, ..Default::default() };
        let decision = decide(&status, &spec(false, 300, 3), Utc::now(), true);
        assert_eq!(decision, Decision::Terminal { phase: ActionPhase::Cancelled, reason: "CancellationRequested" });
    }

    #[test]
    fn timeout_since_start_fails_terminally() {
        let now = Utc::now();
        let status = HealingActionStatus {
            phase: ActionPhase::InProgress,
            start_time: Some(now - chrono::Duration::seconds(400)),
            attempts: 1,
            ..Default::default()
        };
        let decision = decide(&status, &spec(false, 300, 3), now, false);
        assert_eq!(decision, Decision::Terminal { phase: ActionPhase::Failed, reason: "Timeout" });
    }

    #[test]
    fn in_progress_waits_out_backoff_before_retrying() {
        // A3: attempt 1's backoff is 10s; a tick arriving immediately after
        // (e.g. the watch event from the attempt's own InProgress status
        // write) must not dispatch attempt 2 yet.
        let now = Utc::now();
        let status = HealingActionStatus {
            phase: ActionPhase::InProgress,
            attempts: 1,
            start_time: Some(now),
            last_attempt_time: Some(now),
            ..Default::default()
        };
        let decision = decide(&status, &spec(false, 300, 3), now, false);
        match decision {
            Decision::Backoff { requeue_at } => assert_eq!(requeue_at, now + chrono::Duration::seconds(10)),
            other => panic!("expected Backoff, got {other:?}"),
        }
    }

    #[test]
    fn in_progress_retries_once_backoff_elapses() {
        let now = Utc::now();
        let status = HealingActionStatus {
            phase: ActionPhase::InProgress,
            attempts: 1,
            start_time: Some(now - chrono::Duration::seconds(11)),
            last_attempt_time: Some(now - chrono::Duration::seconds(11)),
            ..Default::default()
        };
        let decision = decide(&status, &spec(false, 300, 3), now, false);
        assert_eq!(decision, Decision::Dispatch { attempt: 2 });
    }

    #[test]
    fn in_progress_exhausted_retries_fails() {
        let status = HealingActionStatus {
            phase: ActionPhase::InProgress,
            attempts: 3,
            start_time: Some(Utc::now()),
            ..Default::default()
        };
        let decision = decide(&status, &spec(false, 300, 3), Utc::now(), false);
        assert_eq!(decision, Decision::Terminal { phase: ActionPhase::Failed, reason: "RetriesExhausted" });
    }

    #[test]
    fn decide_after_failure_schedules_backoff_per_invariant_a3() {
        let now = Utc::now();
        let status = HealingActionStatus {
            phase: ActionPhase::InProgress,
            attempts: 2,
            start_time: Some(now),
            last_attempt_time: Some(now),
            ..Default::default()
        };
        let decision = decide_after_failure(&status, &spec(false, 300, 5), now);
        match decision {
            Decision::Backoff { requeue_at } => {
                assert_eq!(requeue_at, now + chrono::Duration::seconds(20));
            }
            other => panic!("expected Backoff, got {other:?}"),
        }
    }

    #[test]
    fn decide_after_failure_terminal_when_attempts_exhausted() {
        let now = Utc::now();
        let status = HealingActionStatus { attempts: 5, start_time: Some(now), last_attempt_time: Some(now), ..Default::default() };
        let decision = decide_after_failure(&status, &spec(false, 300, 5), now);
        assert_eq!(decision, Decision::Terminal { phase: ActionPhase::Failed, reason: "RetriesExhausted" });
    }
}
