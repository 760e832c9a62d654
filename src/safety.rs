//! Safety Controller (C3): protected-resource predicate, rate limiting,
//! circuit breaker, dry-run enforcement, approval gate. The circuit breaker
//! state machine (Closed/Open/HalfOpen) follows the standard
//! consecutive-failure-counter/timeout-gated-half-open shape; see
//! DESIGN.md for where it's grounded.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::crd::{ActionTemplateSpec, HealingActionSpec, TargetRef};
use crate::errors::{ErrorKind, ValidationError};
use crate::metrics::CIRCUIT_BREAKER_STATE;
use crate::recorder::ActionRecorder;

/// Kinds that may never be deleted, regardless of policy configuration.
const NON_DELETABLE_KINDS: &[&str] = &[
    "PersistentVolume",
    "CustomResourceDefinition",
    "Node",
    "Namespace",
    "ClusterRole",
    "ClusterRoleBinding",
];

const NON_DELETABLE_NAMESPACES: &[&str] =
    &["kube-system", "kube-public", "kube-node-lease", "default"];

/// Target metadata needed to evaluate the protected-resource predicate and
/// action-type invariants, independent of the target's concrete Kubernetes
/// type.
#[derive(Debug, Clone, Default)]
pub struct TargetDescriptor {
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

/// Is `target` protected: namespace in the configured protected-namespace
/// list, OR labels match every k=v in the configured protected-labels map,
/// OR annotated protected/healing-disabled.
pub fn is_protected(
    target: &TargetDescriptor,
    protected_namespaces: &[String],
    protected_labels: &BTreeMap<String, String>,
) -> bool {
    if protected_namespaces.iter().any(|ns| ns == &target.namespace)
        || target.namespace.starts_with("kube-")
        || target.namespace.ends_with("-system")
    {
        return true;
    }

    if !protected_labels.is_empty()
        && protected_labels
            .iter()
            .all(|(k, v)| target.labels.get(k) == Some(v))
    {
        return true;
    }

    matches!(target.annotations.get("protected").map(String::as_str), Some("true"))
        || matches!(
            target.annotations.get("healing-disabled").map(String::as_str),
            Some("true")
        )
}

fn is_non_deletable(target: &TargetRef) -> bool {
    NON_DELETABLE_KINDS.contains(&target.kind.as_str())
        || NON_DELETABLE_NAMESPACES.contains(&target.namespace.as_str())
}

/* ============================= CIRCUIT BREAKER ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn as_gauge_value(self) -> i64 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }
}

#[derive(Debug, Clone)]
struct CircuitBreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<DateTime<Utc>>,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout: chrono::Duration,
}

/// One breaker per policy; guarded with a per-policy lock rather than one
/// global lock so concurrent reconciles on different policies never block
/// each other.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<RwLock<CircuitBreakerState>>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    async fn breaker_for(&self, policy_key: &str) -> Arc<RwLock<CircuitBreakerState>> {
        if let Some(b) = self.breakers.read().await.get(policy_key) {
            return b.clone();
        }
        let mut breakers = self.breakers.write().await;
        breakers
            .entry(policy_key.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(CircuitBreakerState::default())))
            .clone()
    }

    /// Allowed iff Closed, or Open-but-timeout-elapsed (transitions to
    /// HalfOpen and allows one test request), or already HalfOpen.
    pub async fn allows(&self, policy_key: &str) -> bool {
        let breaker = self.breaker_for(policy_key).await;
        let mut state = breaker.write().await;
        let allowed = match state.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed_since_open = state
                    .opened_at
                    .map(|t| Utc::now() - t >= self.config.timeout)
                    .unwrap_or(false);
                if elapsed_since_open {
                    state.state = CircuitState::HalfOpen;
                    state.consecutive_successes = 0;
                    true
                } else {
                    false
                }
            }
        };
        CIRCUIT_BREAKER_STATE.with_label_values(&[policy_key]).set(state.state.as_gauge_value());
        allowed
    }

    pub async fn current_state(&self, policy_key: &str) -> CircuitState {
        self.breaker_for(policy_key).await.read().await.state
    }

    /// Advances the breaker's state machine. Called for every terminal
    /// action outcome.
    pub async fn record_outcome(&self, policy_key: &str, success: bool) {
        let breaker = self.breaker_for(policy_key).await;
        let mut state = breaker.write().await;

        match (state.state, success) {
            (CircuitState::Closed, true) => {
                state.consecutive_failures = 0;
            }
            (CircuitState::Closed, false) => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.failure_threshold {
                    state.state = CircuitState::Open;
                    state.opened_at = Some(Utc::now());
                }
            }
            (CircuitState::HalfOpen, true) => {
                state.consecutive_successes += 1;
                if state.consecutive_successes >= self.config.success_threshold {
                    state.state = CircuitState::Closed;
                    state.consecutive_failures = 0;
                    state.consecutive_successes = 0;
                    state.opened_at = None;
                }
            }
            (CircuitState::HalfOpen, false) => {
                state.state = CircuitState::Open;
                state.consecutive_failures = self.config.failure_threshold;
                state.consecutive_successes = 0;
                state.opened_at = Some(Utc::now());
            }
            (CircuitState::Open, _) => {
                // Outcomes can't normally arrive while Open (Validate rejects
                // first) but a late-arriving result from before the breaker
                // tripped should not resurrect a closed breaker.
            }
        }
        CIRCUIT_BREAKER_STATE.with_label_values(&[policy_key]).set(state.state.as_gauge_value());
    }
}

/* ============================= SAFETY CONTROLLER ============================= */

#[derive(Debug, Clone, Default)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub reason: Option<String>,
    pub warnings: Vec<String>,
    /// The error kind behind a rejection (spec.md §7's taxonomy). `None`
    /// when `valid = true`. Callers use this to tell a Safety-kind
    /// rejection (dry-run mismatch, circuit breaker open), which must
    /// leave the action Pending for reconsideration, apart from a
    /// terminal Validation/Stale/Fatal rejection.
    pub kind: Option<ErrorKind>,
}

pub struct SafetyController {
    pub global_dry_run: bool,
    pub global_require_approval: bool,
    pub protected_namespaces: Vec<String>,
    pub protected_labels: BTreeMap<String, String>,
    pub default_max_actions_per_hour: u32,
    pub breakers: CircuitBreakerRegistry,
}

impl SafetyController {
    /// Runs the full gate sequence in order, short-circuiting at the first
    /// step that fails.
    pub fn validate(
        &self,
        action: &HealingActionSpec,
        target: &TargetDescriptor,
        target_resolved: bool,
        circuit_allows: bool,
        approval_granted: bool,
    ) -> ValidationOutcome {
        let mut warnings = Vec::new();

        // 1. global dry-run mode vs action dry-run flag
        if self.global_dry_run && !action.dry_run {
            return ValidationOutcome {
                valid: false,
                reason: Some("global dry-run mode is on but action.spec.dryRun=false".to_string()),
                warnings,
                kind: Some(ErrorKind::Safety),
            };
        }

        // 2. target resolution
        if !target_resolved {
            return ValidationOutcome {
                valid: false,
                reason: Some(format!("unable to resolve target {}", action.target.key())),
                warnings,
                kind: Some(ErrorKind::Stale),
            };
        }

        // 3. protected-resource predicate: the global config (protected
        // namespaces/labels/annotations) plus this policy's own
        // `safetyRules.protectedResources` filter list, matched against
        // either the target's full key or its bare name.
        if is_protected(target, &self.protected_namespaces, &self.protected_labels)
            || action
                .policy_protected_resources
                .iter()
                .any(|r| r == &action.target.key() || r == &action.target.name)
        {
            return ValidationOutcome {
                valid: false,
                reason: Some(format!(
                    "Resource is protected: namespace {} is protected",
                    target.namespace
                )),
                warnings,
                kind: Some(ErrorKind::Validation),
            };
        }

        // 4. circuit breaker
        if !circuit_allows {
            return ValidationOutcome {
                valid: false,
                reason: Some("circuit breaker is open for this policy".to_string()),
                warnings,
                kind: Some(ErrorKind::Safety),
            };
        }

        // 5. action-type invariants
        if let Err(e) = self.check_action_type_invariants(action) {
            let kind = e.kind();
            return ValidationOutcome {
                valid: false,
                reason: Some(e.to_string()),
                warnings,
                kind: Some(kind),
            };
        }

        // 6. warnings (non-fatal)
        if matches!(action.action.spec, ActionTemplateSpec::Delete { .. }) {
            warnings.push("delete is irreversible outside of rollback history".to_string());
        }
        if self.global_require_approval && !approval_granted {
            warnings.push("global requireApproval is on and approval is not yet granted".to_string());
        }

        ValidationOutcome {
            valid: true,
            reason: None,
            warnings,
            kind: None,
        }
    }

    fn check_action_type_invariants(&self, action: &HealingActionSpec) -> Result<(), ValidationError> {
        match &action.action.spec {
            ActionTemplateSpec::Delete { .. } => {
                if is_non_deletable(&action.target) {
                    return Err(ValidationError::ForbiddenDelete(action.target.kind.clone()));
                }
                Ok(())
            }
            ActionTemplateSpec::Scale {
                min_replicas,
                max_replicas,
                ..
            } => {
                if let (Some(min), Some(max)) = (min_replicas, max_replicas) {
                    if *max != 0 && min > max {
                        return Err(ValidationError::InvertedRange(format!(
                            "minReplicas {min} > maxReplicas {max}"
                        )));
                    }
                }
                Ok(())
            }
            ActionTemplateSpec::Patch { operations, .. } => {
                if operations.is_empty() {
                    return Err(ValidationError::MissingPayload("patch".to_string()));
                }
                Ok(())
            }
            ActionTemplateSpec::Restart { .. } | ActionTemplateSpec::Custom { .. } => Ok(()),
        }
    }

    /// `limit` is the policy's `safetyRules.maxActionsPerHour` if > 0 else
    /// the global default.
    pub async fn rate_limit_allowed(
        &self,
        policy_key: &str,
        policy_limit: Option<u32>,
        recorder: &ActionRecorder,
    ) -> bool {
        let limit = policy_limit
            .filter(|l| *l > 0)
            .unwrap_or(self.default_max_actions_per_hour);
        let count = recorder.count(policy_key, Utc::now() - chrono::Duration::hours(1)).await;
        (count as u32) < limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ActionTemplate, PolicyRef, RetryPolicy, ScaleDirection};

    fn sample_action(dry_run: bool, spec: ActionTemplateSpec) -> HealingActionSpec {
        HealingActionSpec {
            policy_ref: PolicyRef {
                name: "p1".to_string(),
                namespace: "default".to_string(),
                uid: None,
            },
            target: TargetRef {
                api_version: "apps/v1".to_string(),
                kind: "Deployment".to_string(),
                name: "web".to_string(),
                namespace: "default".to_string(),
                uid: None,
            },
            action: ActionTemplate {
                name: "restart-action".to_string(),
                spec,
                priority: 0,
                requires_approval: false,
            },
            approval_required: false,
            dry_run,
            timeout_seconds: 300,
            retry_policy: RetryPolicy::default(),
            policy_protected_resources: Vec::new(),
            health_check: Default::default(),
        }
    }

    fn controller() -> SafetyController {
        SafetyController {
            global_dry_run: false,
            global_require_approval: false,
            protected_namespaces: vec!["kube-system".to_string()],
            protected_labels: BTreeMap::new(),
            default_max_actions_per_hour: 10,
            breakers: CircuitBreakerRegistry::new(CircuitBreakerConfig {
                failure_threshold: 2,
                success_threshold: 2,
                timeout: chrono::Duration::milliseconds(100),
            }),
        }
    }

    #[test]
    fn protected_namespace_rejects() {
        let ctrl = controller();
        let action = sample_action(
            false,
            ActionTemplateSpec::Restart {
                strategy: crate::crd::RestartStrategy::Rolling,
                grace_period_seconds: None,
            },
        );
        let target = TargetDescriptor {
            namespace: "kube-system".to_string(),
            ..Default::default()
        };
        let outcome = ctrl.validate(&action, &target, true, true, false);
        assert!(!outcome.valid);
        assert!(outcome.reason.unwrap().contains("protected"));
        assert_eq!(outcome.kind, Some(ErrorKind::Validation));
    }

    #[test]
    fn global_dry_run_mismatch_rejects() {
        let mut ctrl = controller();
        ctrl.global_dry_run = true;
        let action = sample_action(
            false,
            ActionTemplateSpec::Restart {
                strategy: crate::crd::RestartStrategy::Rolling,
                grace_period_seconds: None,
            },
        );
        let target = TargetDescriptor {
            namespace: "default".to_string(),
            ..Default::default()
        };
        let outcome = ctrl.validate(&action, &target, true, true, false);
        assert!(!outcome.valid);
        assert_eq!(outcome.kind, Some(ErrorKind::Safety));
    }

    #[test]
    fn circuit_breaker_open_rejects_as_safety_kind() {
        let ctrl = controller();
        let action = sample_action(
            false,
            ActionTemplateSpec::Restart {
                strategy: crate::crd::RestartStrategy::Rolling,
                grace_period_seconds: None,
            },
        );
        let target = TargetDescriptor {
            namespace: "default".to_string(),
            ..Default::default()
        };
        let outcome = ctrl.validate(&action, &target, true, false, false);
        assert!(!outcome.valid);
        assert_eq!(outcome.kind, Some(ErrorKind::Safety));
    }

    #[test]
    fn delete_on_node_is_forbidden() {
        let ctrl = controller();
        let mut action = sample_action(
            false,
            ActionTemplateSpec::Delete {
                grace_period_seconds: None,
                force: false,
                propagation_policy: crate::crd::PropagationPolicy::Background,
            },
        );
        action.target.kind = "Node".to_string();
        let target = TargetDescriptor {
            namespace: "default".to_string(),
            ..Default::default()
        };
        let outcome = ctrl.validate(&action, &target, true, true, false);
        assert!(!outcome.valid);
    }

    #[test]
    fn delete_always_warns_when_valid() {
        let ctrl = controller();
        let action = sample_action(
            false,
            ActionTemplateSpec::Delete {
                grace_period_seconds: None,
                force: false,
                propagation_policy: crate::crd::PropagationPolicy::Background,
            },
        );
        let target = TargetDescriptor {
            namespace: "default".to_string(),
            ..Default::default()
        };
        let outcome = ctrl.validate(&action, &target, true, true, false);
        assert!(outcome.valid);
        assert!(outcome.warnings.iter().any(|w| w.contains("irreversible")));
    }

    #[test]
    fn policy_scoped_protected_resource_rejects_by_name() {
        let ctrl = controller();
        let mut action = sample_action(
            false,
            ActionTemplateSpec::Restart {
                strategy: crate::crd::RestartStrategy::Rolling,
                grace_period_seconds: None,
            },
        );
        action.policy_protected_resources = vec!["web".to_string()];
        let target = TargetDescriptor {
            namespace: "default".to_string(),
            ..Default::default()
        };
        let outcome = ctrl.validate(&action, &target, true, true, false);
        assert!(!outcome.valid);
        assert!(outcome.reason.unwrap().contains("protected"));
    }

    #[test]
    fn inverted_scale_range_rejects() {
        let ctrl = controller();
        let action = sample_action(
            false,
            ActionTemplateSpec::Scale {
                direction: ScaleDirection::Absolute,
                delta: None,
                replicas: Some(5),
                min_replicas: Some(10),
                max_replicas: Some(3),
            },
        );
        let target = TargetDescriptor {
            namespace: "default".to_string(),
            ..Default::default()
        };
        let outcome = ctrl.validate(&action, &target, true, true, false);
        assert!(!outcome.valid);
    }

    #[test]
    fn protected_label_predicate_requires_every_kv() {
        let mut protected_labels = BTreeMap::new();
        protected_labels.insert("tier".to_string(), "critical".to_string());

        let target_matching = TargetDescriptor {
            namespace: "default".to_string(),
            labels: BTreeMap::from([("tier".to_string(), "critical".to_string())]),
            ..Default::default()
        };
        assert!(is_protected(&target_matching, &[], &protected_labels));

        let target_not_matching = TargetDescriptor {
            namespace: "default".to_string(),
            labels: BTreeMap::from([("tier".to_string(), "standard".to_string())]),
            ..Default::default()
        };
        assert!(!is_protected(&target_not_matching, &[], &protected_labels));
    }

    #[test]
    fn protected_annotation_predicate() {
        let target = TargetDescriptor {
            namespace: "default".to_string(),
            annotations: BTreeMap::from([("healing-disabled".to_string(), "true".to_string())]),
            ..Default::default()
        };
        assert!(is_protected(&target, &[], &BTreeMap::new()));
    }

    #[tokio::test]
    async fn circuit_breaker_opens_after_threshold_failures() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 2,
            success_threshold: 2,
            timeout: chrono::Duration::milliseconds(100),
        });
        assert!(registry.allows("p1").await);
        registry.record_outcome("p1", false).await;
        assert!(registry.allows("p1").await);
        registry.record_outcome("p1", false).await;
        assert!(!registry.allows("p1").await);
        assert_eq!(registry.current_state("p1").await, CircuitState::Open);
    }

    #[tokio::test]
    async fn circuit_breaker_half_opens_after_timeout_and_closes_on_success() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 1,
            timeout: chrono::Duration::milliseconds(10),
        });
        registry.record_outcome("p1", false).await;
        assert!(!registry.allows("p1").await);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(registry.allows("p1").await);
        assert_eq!(registry.current_state("p1").await, CircuitState::HalfOpen);

        registry.record_outcome("p1", true).await;
        assert_eq!(registry.current_state("p1").await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn circuit_breaker_half_open_failure_reopens() {
        let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 2,
            timeout: chrono::Duration::milliseconds(10),
        });
        registry.record_outcome("p1", false).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(registry.allows("p1").await);

        registry.record_outcome("p1", false).await;
        assert_eq!(registry.current_state("p1").await, CircuitState::Open);
    }

    #[tokio::test]
    async fn rate_limit_allowed_respects_per_policy_override() {
        let recorder = ActionRecorder::new(chrono::Duration::hours(2));
        for i in 0..3 {
            recorder
                .record(
                    crate::recorder::ActionRecord {
                        action_name: format!("a{i}"),
                        policy_key: "p1".to_string(),
                        action_type: "restart".to_string(),
                        target_key: "x".to_string(),
                        success: true,
                        error: None,
                        timestamp: Utc::now(),
                        duration_ms: 1,
                        approver: None,
                        dry_run: false,
                    },
                    "{}".to_string(),
                )
                .await;
        }
        let ctrl = controller();
        assert!(!ctrl.rate_limit_allowed("p1", Some(3), &recorder).await);
        assert!(ctrl.rate_limit_allowed("p1", Some(5), &recorder).await);
    }
}
