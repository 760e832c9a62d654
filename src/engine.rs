//! Remediation Engine (C5): resolves the target resource, dispatches to
//! the executor registered for the action's type, tracks in-flight
//! executions, and drives rollback off the Action Recorder's history.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use kube::Client;
use tokio::sync::RwLock;

use crate::crd::{ActionResultStatus, HealingActionSpec, StructuredChange, TargetRef};
use crate::errors::EngineError;
use crate::executors::{ExecutorRegistry, fetch_target, overwrite_target, recreate_target};
use crate::recorder::{ActionRecord, ActionRecorder};

const GLOBAL_DEFAULT_TIMEOUT_SECONDS: u64 = 300;

/// Cooperative cancellation handle. Executors in this crate perform a
/// single write per call, so the only checkpoint that matters is before
/// dispatch; a richer executor would poll this between writes too.
#[derive(Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

struct InFlight {
    #[allow(dead_code)]
    start_time: chrono::DateTime<Utc>,
    cancelled: Arc<AtomicBool>,
}

/// In-flight execution registry, kept separate from `RemediationEngine` so
/// its conflict/cancel semantics can be unit-tested without a live
/// `kube::Client`.
#[derive(Default)]
struct InFlightTracker {
    entries: RwLock<HashMap<String, InFlight>>,
}

impl InFlightTracker {
    async fn track(&self, action_name: &str) -> Result<CancelToken, EngineError> {
        let mut entries = self.entries.write().await;
        if entries.contains_key(action_name) {
            return Err(EngineError::Conflict(action_name.to_string()));
        }
        let cancelled = Arc::new(AtomicBool::new(false));
        entries.insert(action_name.to_string(), InFlight { start_time: Utc::now(), cancelled: cancelled.clone() });
        Ok(CancelToken(cancelled))
    }

    async fn untrack(&self, action_name: &str) {
        self.entries.write().await.remove(action_name);
    }

    async fn cancel(&self, action_name: &str) -> Result<(), EngineError> {
        let entries = self.entries.read().await;
        match entries.get(action_name) {
            Some(entry) => {
                entry.cancelled.store(true, Ordering::SeqCst);
                Ok(())
            }
            None => Err(EngineError::Conflict(format!("{action_name} is not in flight"))),
        }
    }
}

pub struct RemediationEngine {
    client: Client,
    executors: ExecutorRegistry,
    recorder: Arc<ActionRecorder>,
    in_flight: InFlightTracker,
}

impl RemediationEngine {
    pub fn new(client: Client, executors: ExecutorRegistry, recorder: Arc<ActionRecorder>) -> Self {
        Self { client, executors, recorder, in_flight: InFlightTracker::default() }
    }

    fn effective_timeout(&self, action: &HealingActionSpec) -> chrono::Duration {
        let requested = chrono::Duration::seconds(action.timeout_seconds as i64);
        let ceiling = chrono::Duration::seconds(GLOBAL_DEFAULT_TIMEOUT_SECONDS as i64);
        requested.min(ceiling)
    }

    pub async fn cancel(&self, action_name: &str) -> Result<(), EngineError> {
        self.in_flight.cancel(action_name).await
    }

    async fn run(&self, action_name: &str, action: &HealingActionSpec, dry_run: bool) -> Result<ActionResultStatus, EngineError> {
        let cancel = self.in_flight.track(action_name).await?;
        let timeout = self.effective_timeout(action);
        let start = Utc::now();
        let outcome = self.run_inner(action_name, action, dry_run, &cancel, timeout, start).await;
        self.in_flight.untrack(action_name).await;
        outcome
    }

    async fn run_inner(
        &self,
        action_name: &str,
        action: &HealingActionSpec,
        dry_run: bool,
        cancel: &CancelToken,
        timeout: chrono::Duration,
        start: chrono::DateTime<Utc>,
    ) -> Result<ActionResultStatus, EngineError> {
        let type_name = action.action.spec.type_name();
        let executor = self
            .executors
            .get(type_name)
            .ok_or_else(|| EngineError::UnknownActionType(type_name.to_string()))?;

        if cancel.is_cancelled() {
            return Ok(terminal_result(false, "cancelled before dispatch".to_string(), None, vec![]));
        }

        let current = fetch_target(&self.client, &action.target).await?;
        if let Some(expected_uid) = &action.target.uid {
            let found_uid = current.metadata.uid.clone().unwrap_or_default();
            if &found_uid != expected_uid {
                return Err(EngineError::StaleTarget { expected: expected_uid.clone(), found: found_uid });
            }
        }

        let original_state = serde_json::to_string(&current)
            .map_err(|e| EngineError::Executor(crate::errors::ExecutorError::Validation(e.to_string())))?;

        executor.validate(action)?;

        if Utc::now() - start >= timeout {
            return Ok(terminal_result(false, "deadline exceeded before execution".to_string(), Some("Timeout".to_string()), vec![]));
        }

        let changes: Result<Vec<StructuredChange>, EngineError> = if dry_run {
            executor.dry_run(action, &self.client).await.map_err(EngineError::from)
        } else {
            executor.execute(action, &self.client).await.map_err(EngineError::from)
        };

        let record = ActionRecord {
            action_name: action_name.to_string(),
            policy_key: format!("{}/{}", action.policy_ref.namespace, action.policy_ref.name),
            action_type: type_name.to_string(),
            target_key: action.target.key(),
            success: changes.is_ok(),
            error: changes.as_ref().err().map(|e| e.to_string()),
            timestamp: Utc::now(),
            duration_ms: (Utc::now() - start).num_milliseconds().max(0) as u64,
            approver: None,
            dry_run,
        };
        self.recorder.record(record, original_state).await;

        match changes {
            Ok(changes) => Ok(ActionResultStatus {
                success: true,
                message: Some(format!("{type_name} applied {} change(s)", changes.len())),
                error: None,
                metrics: [("dry_run".to_string(), if dry_run { 1.0 } else { 0.0 })].into_iter().collect(),
                changes,
            }),
            Err(e) => Err(e),
        }
    }

    /// Execute `action`, identified by `action_name` for in-flight tracking
    /// and rollback lookups.
    pub async fn execute(&self, action_name: &str, action: &HealingActionSpec) -> Result<ActionResultStatus, EngineError> {
        self.run(action_name, action, false).await
    }

    pub async fn dry_run(&self, action_name: &str, action: &HealingActionSpec) -> Result<ActionResultStatus, EngineError> {
        self.run(action_name, action, true).await
    }

    /// Restores the target resource to its recorded pre-change state.
    /// Fails with `NoHistory` if C2 has no record or it aged out.
    pub async fn rollback(&self, action_name: &str, target: &TargetRef) -> Result<(), EngineError> {
        let history = self.recorder.history(action_name).await.map_err(|_| EngineError::NoHistory(action_name.to_string()))?;
        let Some((_record, original_state)) = history else {
            return Err(EngineError::NoHistory(action_name.to_string()));
        };

        let original: kube::core::DynamicObject =
            serde_json::from_str(&original_state).map_err(|e| EngineError::Executor(crate::errors::ExecutorError::Validation(e.to_string())))?;

        match fetch_target(&self.client, target).await {
            Ok(_) => overwrite_target(&self.client, target, &original).await.map_err(EngineError::from),
            Err(_) => recreate_target(&self.client, target, &original).await.map_err(EngineError::from),
        }
    }
}

fn terminal_result(success: bool, message: String, error: Option<String>, changes: Vec<StructuredChange>) -> ActionResultStatus {
    ActionResultStatus { success, message: Some(message), error, metrics: Default::default(), changes }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_action_names_conflict() {
        let tracker = InFlightTracker::default();
        let _first = tracker.track("a1").await.unwrap();
        let second = tracker.track("a1").await;
        assert!(matches!(second, Err(EngineError::Conflict(_))));
    }

    #[tokio::test]
    async fn cancel_marks_token_cancelled() {
        let tracker = InFlightTracker::default();
        let token = tracker.track("a1").await.unwrap();
        assert!(!token.is_cancelled());
        tracker.cancel("a1").await.unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn cancel_unknown_action_errors() {
        let tracker = InFlightTracker::default();
        assert!(tracker.cancel("ghost").await.is_err());
    }

    #[tokio::test]
    async fn untrack_allows_reuse_of_the_same_name() {
        let tracker = InFlightTracker::default();
        let _token = tracker.track("a1").await.unwrap();
        tracker.untrack("a1").await;
        assert!(tracker.track("a1").await.is_ok());
    }

    #[test]
    fn effective_timeout_is_clamped_to_global_default() {
        let action = sample_action(10_000);
        let requested = chrono::Duration::seconds(action.timeout_seconds as i64);
        let ceiling = chrono::Duration::seconds(GLOBAL_DEFAULT_TIMEOUT_SECONDS as i64);
        assert_eq!(requested.min(ceiling), ceiling);
    }

    #[test]
    fn effective_timeout_keeps_shorter_action_timeout() {
        let action = sample_action(30);
        let requested = chrono::Duration::seconds(action.timeout_seconds as i64);
        let ceiling = chrono::Duration::seconds(GLOBAL_DEFAULT_TIMEOUT_SECONDS as i64);
        assert_eq!(requested.min(ceiling), chrono::Duration::seconds(30));
    }

    fn sample_action(timeout_seconds: u64) -> HealingActionSpec {
        HealingActionSpec {
            policy_ref: crate::crd::PolicyRef::default(),
            target: crate::crd::TargetRef::default(),
            action: crate::crd::ActionTemplate {
                name: "a".to_string(),
                spec: crate::crd::ActionTemplateSpec::Restart {
                    strategy: crate::crd::RestartStrategy::Rolling,
                    grace_period_seconds: None,
                },
                priority: 0,
                requires_approval: false,
            },
            approval_required: false,
            dry_run: false,
            timeout_seconds,
            retry_policy: crate::crd::RetryPolicy::default(),
            policy_protected_resources: Vec::new(),
            health_check: Default::default(),
        }
    }
}
