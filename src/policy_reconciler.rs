//! Policy Reconciler (C7): resolves a `HealingPolicy`'s selector against
//! live cluster state, evaluates its triggers via C1, enforces per-trigger
//! cooldown and the rate limit/circuit breaker via C3, and materializes
//! `HealingAction` objects for the Action Reconciler to drive. The
//! selector-resolution/trigger-evaluation split is pure and unit-tested
//! independently of the cluster; `reconcile`/`error_policy` are the async
//! wiring around `Controller::new(...).run(reconcile, error_policy, ctx)`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Event;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{Event as FinalizerEvent, finalizer};
use kube::{Client, ResourceExt, discovery};
use tracing::{info, warn};

use crate::action_reconciler;
use crate::crd::{
    ActionTemplate, HealingAction, HealingActionSpec, HealingPolicy, HealingPolicySpec,
    HealingPolicyStatus, HealthCheckSpec, PolicyMode, PolicyRef, RetryPolicy, SafetyRules,
    Selector, StatusCondition, TargetRef, Trigger,
};
use crate::errors::{ReconcileError, TriggerError};
use crate::metrics::{POLICY_RECONCILE_DURATION, POLICY_RECONCILE_ERRORS, POLICY_RECONCILE_TOTAL, TRIGGER_EVALUATIONS};
use crate::metrics_backend::TimeSeriesBackend;
use crate::recorder::ActionRecorder;
use crate::safety::SafetyController;
use crate::triggers::{self, MetricCache, ObservationContext, PlatformEvent, ResourceObservation};

pub const FINALIZER: &str = "healer.kubeskippy.io/policy-cleanup";
const DEFAULT_REQUEUE: StdDuration = StdDuration::from_secs(30);

/* ============================= PURE LOGIC ============================= */

/// True while `trigger`'s cooldown has not yet elapsed since `last_fired`
/// (invariant P1: a trigger may not re-fire while in cooldown).
pub fn cooldown_active(trigger: &Trigger, last_fired: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match last_fired {
        Some(ts) => now - ts < chrono::Duration::seconds(trigger.cooldown_seconds as i64),
        None => false,
    }
}

/// The action template to apply when a trigger fires: highest `priority`,
/// ties broken by declaration order. A policy with no action templates
/// fires triggers but remediates nothing (observe-only policies are valid
/// under `PolicyMode::Monitor`).
pub fn select_action_template(policy: &HealingPolicySpec) -> Option<&ActionTemplate> {
    policy.actions.iter().max_by_key(|a| a.priority)
}

/// All of a policy's action templates, materialized in descending-priority
/// order (ties broken by declaration order via a stable sort) per "actions
/// are materialized in priority order" (spec.md §5). Every template in the
/// policy produces its own `HealingAction` per matched target (spec.md §4.7
/// step 5: "for each action template in the policy"), not just the
/// highest-priority one.
pub fn ordered_action_templates(policy: &HealingPolicySpec) -> Vec<&ActionTemplate> {
    let mut templates: Vec<&ActionTemplate> = policy.actions.iter().collect();
    templates.sort_by(|a, b| b.priority.cmp(&a.priority));
    templates
}

/// Builds the `HealingActionSpec` materialized when `trigger` fires against
/// `target`. Per the manual-mode open question (SPEC_FULL.md §D.1), the
/// policy mode is a gate that can only ever *add* an approval requirement —
/// `template.requiresApproval=false` never overrides `mode == manual`.
pub fn build_action_spec(
    policy_name: &str,
    policy_namespace: &str,
    policy_uid: Option<String>,
    template: &ActionTemplate,
    target: TargetRef,
    mode: PolicyMode,
    default_timeout_seconds: u64,
    default_retry_policy: RetryPolicy,
    safety_rules: &SafetyRules,
) -> HealingActionSpec {
    HealingActionSpec {
        policy_ref: PolicyRef { name: policy_name.to_string(), namespace: policy_namespace.to_string(), uid: policy_uid },
        target,
        action: template.clone(),
        approval_required: matches!(mode, PolicyMode::Manual) || template.requires_approval,
        dry_run: matches!(mode, PolicyMode::Dryrun),
        timeout_seconds: default_timeout_seconds,
        retry_policy: default_retry_policy,
        policy_protected_resources: safety_rules.protected_resources.clone(),
        health_check: HealthCheckSpec {
            required: safety_rules.require_health_check,
            timeout_seconds: safety_rules.health_check_timeout_seconds.unwrap_or(30),
        },
    }
}

/// Name for the materialized `HealingAction`, deterministic per
/// (policy, trigger, target, minute) so a requeue within the same minute
/// does not create duplicate actions before the reconciler observes the
/// one it just created.
pub fn action_name(policy_name: &str, trigger_name: &str, template_name: &str, target: &TargetRef, now: DateTime<Utc>) -> String {
    let bucket = now.timestamp() / 60;
    let raw = format!("{policy_name}-{trigger_name}-{template_name}-{}-{bucket}", target.name);
    let sanitized: String = raw
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    sanitized.chars().take(253).collect()
}

fn default_api_version_for_kind(kind: &str) -> &'static str {
    match kind {
        "Pod" | "Service" | "ConfigMap" | "Secret" | "Namespace" | "Node" | "Event" | "PersistentVolumeClaim" => "v1",
        "Deployment" | "StatefulSet" | "DaemonSet" | "ReplicaSet" => "apps/v1",
        "Job" | "CronJob" => "batch/v1",
        "HorizontalPodAutoscaler" => "autoscaling/v2",
        _ => "v1",
    }
}

fn matches_label_selector(obj: &DynamicObject, predicate: &BTreeMap<String, String>) -> bool {
    if predicate.is_empty() {
        return true;
    }
    let labels = obj.metadata.labels.clone().unwrap_or_default();
    predicate.iter().all(|(k, v)| labels.get(k) == Some(v))
}

fn extract_conditions(obj: &DynamicObject) -> Vec<StatusCondition> {
    obj.data
        .get("status")
        .and_then(|s| s.get("conditions"))
        .and_then(|c| serde_json::from_value::<Vec<StatusCondition>>(c.clone()).ok())
        .unwrap_or_default()
}

fn target_ref_for(obj: &DynamicObject, kind: &str, api_version: &str) -> TargetRef {
    TargetRef {
        api_version: api_version.to_string(),
        kind: kind.to_string(),
        name: obj.name_any(),
        namespace: obj.namespace().unwrap_or_default(),
        uid: obj.metadata.uid.clone(),
    }
}

/* ============================= SELECTOR RESOLUTION ============================= */

async fn resolve_selector(client: &Client, selector: &Selector) -> Result<Vec<(DynamicObject, String, String)>, TriggerError> {
    let mut matched = Vec::new();
    let label_predicate = selector.label_selector.clone().unwrap_or_default();

    for kind_filter in &selector.resource_kinds {
        let api_version = default_api_version_for_kind(&kind_filter.kind);
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", api_version),
        };
        let gvk = GroupVersionKind::gvk(group, version, &kind_filter.kind);
        let (api_resource, _caps) = discovery::pinned_kind(client, &gvk)
            .await
            .map_err(|e| TriggerError::Kube(e))?;

        let namespaces: Vec<Option<String>> = if selector.namespaces.is_empty() {
            vec![None]
        } else {
            selector.namespaces.iter().cloned().map(Some).collect()
        };

        for namespace in namespaces {
            let api: Api<DynamicObject> = match &namespace {
                Some(ns) => Api::namespaced_with(client.clone(), ns, &api_resource),
                None => Api::all_with(client.clone(), &api_resource),
            };
            let list = api.list(&ListParams::default()).await.map_err(TriggerError::Kube)?;
            for obj in list.items {
                if kind_filter.exclude_names.contains(&obj.name_any()) {
                    continue;
                }
                if !matches_label_selector(&obj, &label_predicate) {
                    continue;
                }
                matched.push((obj, kind_filter.kind.clone(), api_version.to_string()));
            }
        }
    }

    Ok(matched)
}

async fn fetch_recent_events(client: &Client, target: &TargetRef) -> Vec<PlatformEvent> {
    let api: Api<Event> = Api::namespaced(client.clone(), &target.namespace);
    let field_selector = format!("involvedObject.name={}", target.name);
    let events = match api.list(&ListParams::default().fields(&field_selector)).await {
        Ok(list) => list.items,
        Err(e) => {
            warn!(target = %target.key(), error = %e, "event_list_failed");
            return vec![];
        }
    };

    events
        .into_iter()
        .filter_map(|e| {
            let reason = e.reason?;
            let event_type = e.type_?;
            let timestamp = e
                .last_timestamp
                .map(|t| t.0)
                .or_else(|| e.event_time.map(|t| t.0))
                .unwrap_or_else(Utc::now);
            Some(PlatformEvent { reason, event_type, timestamp })
        })
        .collect()
}

async fn build_observation_context(client: &Client, matched: &[(DynamicObject, String, String)]) -> ObservationContext {
    let now = Utc::now();
    let mut resources = Vec::with_capacity(matched.len());
    for (obj, kind, api_version) in matched {
        let target = target_ref_for(obj, kind, api_version);
        let conditions = extract_conditions(obj);
        let events = fetch_recent_events(client, &target).await;
        resources.push(ResourceObservation { target, conditions, events });
    }
    ObservationContext { now, resources }
}

/* ============================= ASYNC WIRING ============================= */

pub struct PolicyReconcileContext {
    pub client: Client,
    pub safety: Arc<SafetyController>,
    pub recorder: Arc<ActionRecorder>,
    pub backend: Arc<dyn TimeSeriesBackend>,
    pub cache: Arc<MetricCache>,
    pub default_action_timeout_seconds: u64,
    pub default_retry_policy: RetryPolicy,
}

pub async fn reconcile(policy: Arc<HealingPolicy>, ctx: Arc<PolicyReconcileContext>) -> Result<Action, ReconcileError> {
    let name = policy.name_any();
    let namespace = policy.namespace().unwrap_or_default();
    let api: Api<HealingPolicy> = Api::namespaced(ctx.client.clone(), &namespace);

    if policy.metadata.deletion_timestamp.is_some() {
        return finalizer(&api, FINALIZER, policy.clone(), |event| async move {
            match event {
                FinalizerEvent::Apply(_) | FinalizerEvent::Cleanup(_) => Ok(Action::await_change()),
            }
        })
        .await
        .map_err(|e| ReconcileError::Finalizer(e.to_string()));
    }

    POLICY_RECONCILE_TOTAL.inc();
    let reconcile_start = std::time::Instant::now();
    let now = Utc::now();

    let matched = resolve_selector(&ctx.client, &policy.spec.selector).await.map_err(policy_reconcile_error)?;
    let obs_ctx = build_observation_context(&ctx.client, &matched).await;

    let mut status = policy.status.clone().unwrap_or_default();
    let mut active_triggers = Vec::new();
    let policy_key = format!("{namespace}/{name}");

    for trigger in &policy.spec.triggers {
        let result = match triggers::evaluate(&trigger.name, &trigger.spec, &obs_ctx, &*ctx.backend, &ctx.cache).await {
            Ok(r) => r,
            Err(e) => {
                warn!(policy = %name, trigger = %trigger.name, error = %e, "trigger_evaluation_failed");
                continue;
            }
        };

        TRIGGER_EVALUATIONS
            .with_label_values(&[trigger.spec.kind_name(), if result.fired { "true" } else { "false" }])
            .inc();

        if !result.fired {
            continue;
        }

        active_triggers.push(trigger.name.clone());

        let last_fired = status.trigger_last_fired.get(&trigger.name).copied();
        if cooldown_active(trigger, last_fired, now) {
            info!(policy = %name, trigger = %trigger.name, "trigger_in_cooldown");
            continue;
        }

        status.trigger_last_fired.insert(trigger.name.clone(), now);

        if matches!(policy.spec.mode, PolicyMode::Monitor) {
            continue;
        }

        let templates = ordered_action_templates(&policy.spec);
        if templates.is_empty() {
            continue;
        }

        if !ctx
            .safety
            .rate_limit_allowed(&policy_key, policy.spec.safety_rules.max_actions_per_hour, &ctx.recorder)
            .await
        {
            crate::metrics::RATE_LIMIT_REJECTIONS.with_label_values(&[policy_key.as_str()]).inc();
            warn!(policy = %name, trigger = %trigger.name, "rate_limit_exceeded");
            continue;
        }

        for (obj, kind, api_version) in &matched {
            let target = target_ref_for(obj, kind, api_version);
            for template in &templates {
                let action_spec = build_action_spec(
                    &name,
                    &namespace,
                    policy.metadata.uid.clone(),
                    template,
                    target.clone(),
                    policy.spec.mode,
                    ctx.default_action_timeout_seconds,
                    ctx.default_retry_policy.clone(),
                    &policy.spec.safety_rules,
                );
                if let Err(e) =
                    create_healing_action(&ctx.client, &namespace, &name, &trigger.name, &template.name, &target, now, action_spec).await
                {
                    warn!(policy = %name, trigger = %trigger.name, action = %template.name, target = %target.key(), error = %e, "healing_action_create_failed");
                } else {
                    status.actions_taken += 1;
                    status.last_action_time = Some(now);
                }
            }
        }
    }

    status.last_evaluated = Some(now);
    status.active_triggers = active_triggers;
    status.observed_generation = policy.meta().generation;
    status.conditions = vec![StatusCondition {
        condition_type: "Ready".to_string(),
        status: "True".to_string(),
        reason: "Reconciled".to_string(),
        message: format!("{} candidate(s) observed", matched.len()),
        last_transition_time: now,
    }];

    let patch = serde_json::json!({ "status": status });
    api.patch_status(&name, &PatchParams::apply("healer"), &Patch::Merge(&patch))
        .await
        .map_err(ReconcileError::Kube)?;

    POLICY_RECONCILE_DURATION.observe(reconcile_start.elapsed().as_secs_f64());
    Ok(Action::requeue(DEFAULT_REQUEUE))
}

async fn create_healing_action(
    client: &Client,
    namespace: &str,
    policy_name: &str,
    trigger_name: &str,
    template_name: &str,
    target: &TargetRef,
    now: DateTime<Utc>,
    spec: HealingActionSpec,
) -> Result<(), kube::Error> {
    let api: Api<HealingAction> = Api::namespaced(client.clone(), namespace);
    let name = action_name(policy_name, trigger_name, template_name, target, now);

    if api.get_opt(&name).await?.is_some() {
        return Ok(());
    }

    let mut labels = BTreeMap::new();
    labels.insert("healer.kubeskippy.io/trigger-type".to_string(), trigger_name.to_string());
    labels.insert("healer.kubeskippy.io/policy".to_string(), policy_name.to_string());

    let action = HealingAction {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace.to_string()),
            finalizers: Some(vec![action_reconciler::FINALIZER.to_string()]),
            labels: Some(labels),
            ..Default::default()
        },
        spec,
        status: None,
    };
    api.create(&PostParams::default(), &action).await?;
    Ok(())
}

fn policy_reconcile_error(e: TriggerError) -> ReconcileError {
    match e {
        TriggerError::Kube(k) => ReconcileError::Kube(k),
        other => ReconcileError::Finalizer(other.to_string()),
    }
}

pub fn error_policy(_policy: Arc<HealingPolicy>, error: &ReconcileError, _ctx: Arc<PolicyReconcileContext>) -> Action {
    POLICY_RECONCILE_ERRORS.inc();
    warn!(error = %error, "policy_reconcile_error");
    Action::requeue(StdDuration::from_secs(60))
}
