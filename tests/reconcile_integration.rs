//! Exercises the decision/safety pipeline without a live cluster: policy
//! selection -> action spec construction -> safety validation -> dispatch
//! decision. Mirrors the unit tests in each module but checks they compose
//! the way a real reconcile would drive them.

use chrono::Utc;
use healer::crd::{
    ActionPhase, ActionTemplate, ActionTemplateSpec, ApprovalStatus, HealingActionSpec,
    HealingActionStatus, HealingPolicySpec, PolicyMode, PolicyRef, RestartStrategy, RetryPolicy,
    TargetRef,
};
use healer::safety::{CircuitBreakerConfig, CircuitBreakerRegistry, SafetyController, TargetDescriptor};
use healer::{action_reconciler, policy_reconciler};

fn sample_policy() -> HealingPolicySpec {
    HealingPolicySpec {
        mode: PolicyMode::Automatic,
        actions: vec![
            ActionTemplate {
                name: "restart-low".to_string(),
                spec: ActionTemplateSpec::Restart { strategy: RestartStrategy::Rolling, grace_period_seconds: None },
                priority: 1,
                requires_approval: false,
            },
            ActionTemplate {
                name: "restart-high".to_string(),
                spec: ActionTemplateSpec::Restart { strategy: RestartStrategy::Rolling, grace_period_seconds: None },
                priority: 10,
                requires_approval: true,
            },
        ],
        ..Default::default()
    }
}

#[test]
fn highest_priority_template_drives_approval_requirement_into_the_built_action() {
    let policy = sample_policy();
    let template = policy_reconciler::select_action_template(&policy).expect("at least one template");
    assert_eq!(template.name, "restart-high");

    let target = TargetRef { api_version: "apps/v1".to_string(), kind: "Deployment".to_string(), name: "checkout".to_string(), namespace: "prod".to_string(), uid: None };
    let spec = policy_reconciler::build_action_spec(
        "cpu-saturation",
        "prod",
        Some("policy-uid".to_string()),
        template,
        target,
        policy.mode,
        300,
        RetryPolicy::default(),
        &healer::crd::SafetyRules::default(),
    );

    assert!(spec.approval_required);
    assert!(!spec.dry_run);
}

#[test]
fn protected_namespace_target_is_rejected_by_safety_before_dispatch() {
    let action = HealingActionSpec {
        policy_ref: PolicyRef { name: "cpu-saturation".to_string(), namespace: "kube-system".to_string(), uid: None },
        target: TargetRef { api_version: "apps/v1".to_string(), kind: "Deployment".to_string(), name: "coredns".to_string(), namespace: "kube-system".to_string(), uid: None },
        action: ActionTemplate {
            name: "restart".to_string(),
            spec: ActionTemplateSpec::Restart { strategy: RestartStrategy::Rolling, grace_period_seconds: None },
            priority: 0,
            requires_approval: false,
        },
        approval_required: false,
        dry_run: false,
        timeout_seconds: 300,
        retry_policy: RetryPolicy::default(),
        policy_protected_resources: Vec::new(),
        health_check: Default::default(),
    };

    let safety = SafetyController {
        global_dry_run: false,
        global_require_approval: false,
        protected_namespaces: vec!["kube-system".to_string()],
        protected_labels: Default::default(),
        default_max_actions_per_hour: 10,
        breakers: CircuitBreakerRegistry::new(CircuitBreakerConfig { failure_threshold: 5, success_threshold: 2, timeout: chrono::Duration::seconds(60) }),
    };

    let descriptor = TargetDescriptor { namespace: "kube-system".to_string(), labels: Default::default(), annotations: Default::default() };
    let outcome = safety.validate(&action, &descriptor, true, true, false);
    assert!(!outcome.valid);
}

#[test]
fn pending_action_without_approval_requirement_is_ready_to_dispatch_on_first_attempt() {
    let status = HealingActionStatus { phase: ActionPhase::Pending, approval: ApprovalStatus::default(), ..Default::default() };
    let spec = HealingActionSpec {
        policy_ref: PolicyRef { name: "cpu-saturation".to_string(), namespace: "prod".to_string(), uid: None },
        target: TargetRef { api_version: "apps/v1".to_string(), kind: "Deployment".to_string(), name: "checkout".to_string(), namespace: "prod".to_string(), uid: None },
        action: ActionTemplate {
            name: "restart".to_string(),
            spec: ActionTemplateSpec::Restart { strategy: RestartStrategy::Rolling, grace_period_seconds: None },
            priority: 0,
            requires_approval: false,
        },
        approval_required: false,
        dry_run: false,
        timeout_seconds: 300,
        retry_policy: RetryPolicy::default(),
        policy_protected_resources: Vec::new(),
        health_check: Default::default(),
    };

    let decision = action_reconciler::decide(&status, &spec, Utc::now(), false);
    assert_eq!(decision, action_reconciler::Decision::Dispatch { attempt: 1 });
}
