//! Remediation Executors (C4): one executor per action type, each building
//! a patch/delete body as a pure, unit-testable function and applying it
//! through a thin async wrapper around a `kube::Client`. Grounded on the
//! teacher's `enforcement.rs` split between `build_container_patches`
//! (pure) and `apply_remediation` (async, untested against a live cluster)
//! — the same split is kept here, generalized from probe/resource
//! injection to restart/scale/patch/delete.

use std::collections::BTreeMap;

use chrono::Utc;
use kube::Client;
use kube::api::{Api, DeleteParams, Patch, PatchParams, Preconditions};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery;
use serde_json::json;

use crate::crd::{
    ActionTemplateSpec, HealingActionSpec, PatchType, PropagationPolicy, RestartStrategy,
    ScaleDirection, StructuredChange, TargetRef,
};
use crate::errors::ExecutorError;

const FIELD_MANAGER: &str = "healer";

fn parse_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

async fn resolve_api(client: &Client, target: &TargetRef) -> Result<Api<DynamicObject>, ExecutorError> {
    let (group, version) = parse_api_version(&target.api_version);
    let gvk = GroupVersionKind::gvk(group, version, &target.kind);
    let (api_resource, _caps) = discovery::pinned_kind(client, &gvk)
        .await
        .map_err(|e| ExecutorError::UnsupportedKind(format!("{}: {e}", target.kind)))?;
    Ok(Api::namespaced_with(client.clone(), &target.namespace, &api_resource))
}

/// Resolves `target` to its current dynamic representation, used by the
/// Remediation Engine (C5) to snapshot pre-change state and check for a
/// stale UID before dispatching to an executor.
pub async fn fetch_target(client: &Client, target: &TargetRef) -> Result<DynamicObject, ExecutorError> {
    let api = resolve_api(client, target).await?;
    api.get(&target.name).await.map_err(ExecutorError::Kube)
}

/// Overwrites `target` with `original` (used by rollback). `original` is
/// the exact serialized `DynamicObject` captured at execution time.
pub async fn overwrite_target(client: &Client, target: &TargetRef, original: &DynamicObject) -> Result<(), ExecutorError> {
    let api = resolve_api(client, target).await?;
    let body = serde_json::to_value(original).map_err(|e| ExecutorError::Validation(e.to_string()))?;
    api.patch(&target.name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&body))
        .await
        .map_err(ExecutorError::Kube)?;
    Ok(())
}

/// Re-creates `target` from `original` when the live resource is absent
/// (rollback after a delete).
pub async fn recreate_target(client: &Client, target: &TargetRef, original: &DynamicObject) -> Result<(), ExecutorError> {
    let api = resolve_api(client, target).await?;
    api.create(&Default::default(), original).await.map_err(ExecutorError::Kube)?;
    Ok(())
}

fn change(target: &TargetRef, change_kind: &str, field_path: &str, old: Option<String>, new: Option<String>) -> StructuredChange {
    StructuredChange {
        resource_ref: target.key(),
        change_kind: change_kind.to_string(),
        field_path: field_path.to_string(),
        old_value: old,
        new_value: new,
        timestamp: Utc::now(),
    }
}

/// Common contract every executor implements. `validate`/`dry_run` must
/// never mutate cluster state (I4); only `execute` does.
#[async_trait::async_trait]
pub trait Executor: Send + Sync {
    fn type_name(&self) -> &'static str;
    fn validate(&self, action: &HealingActionSpec) -> Result<(), ExecutorError>;
    async fn dry_run(&self, action: &HealingActionSpec, client: &Client) -> Result<Vec<StructuredChange>, ExecutorError>;
    async fn execute(&self, action: &HealingActionSpec, client: &Client) -> Result<Vec<StructuredChange>, ExecutorError>;
}

/* ============================= RESTART ============================= */

pub struct RestartExecutor;

const RESTARTABLE_KINDS: &[&str] = &["Pod", "Deployment", "StatefulSet", "DaemonSet"];

fn build_restart_patch(strategy: RestartStrategy, grace_period_seconds: Option<i64>) -> serde_json::Value {
    let mut template_spec = json!({});
    if let (RestartStrategy::Graceful, Some(grace)) = (strategy, grace_period_seconds) {
        template_spec["terminationGracePeriodSeconds"] = json!(grace);
    }

    json!({
        "spec": {
            "template": {
                "metadata": {
                    "annotations": {
                        "healer.kubeskippy.io/restartedAt": Utc::now().to_rfc3339()
                    }
                },
                "spec": template_spec
            }
        }
    })
}

fn pod_delete_params(strategy: RestartStrategy, grace_period_seconds: Option<i64>) -> DeleteParams {
    let grace = match strategy {
        RestartStrategy::Graceful => grace_period_seconds,
        RestartStrategy::Rolling | RestartStrategy::Recreate => Some(0),
    };
    DeleteParams {
        grace_period_seconds: grace.map(|g| g as u32),
        propagation_policy: None,
        preconditions: None::<Preconditions>,
        dry_run: false,
    }
}

#[async_trait::async_trait]
impl Executor for RestartExecutor {
    fn type_name(&self) -> &'static str {
        "restart"
    }

    fn validate(&self, action: &HealingActionSpec) -> Result<(), ExecutorError> {
        match &action.action.spec {
            ActionTemplateSpec::Restart { .. } => {
                if !RESTARTABLE_KINDS.contains(&action.target.kind.as_str()) {
                    return Err(ExecutorError::UnsupportedKind(action.target.kind.clone()));
                }
                Ok(())
            }
            other => Err(ExecutorError::Validation(format!(
                "RestartExecutor cannot handle action type {}",
                other.type_name()
            ))),
        }
    }

    async fn dry_run(&self, action: &HealingActionSpec, client: &Client) -> Result<Vec<StructuredChange>, ExecutorError> {
        self.validate(action)?;
        let ActionTemplateSpec::Restart { strategy, .. } = action.action.spec else {
            unreachable!("validated above")
        };

        if action.target.kind == "Pod" {
            return Ok(vec![change(&action.target, "delete", "$", Some("present".to_string()), Some("absent".to_string()))]);
        }

        if matches!(strategy, RestartStrategy::Recreate) {
            let api = resolve_api(client, &action.target).await?;
            let current_obj = api.get(&action.target.name).await.map_err(ExecutorError::Kube)?;
            let current = current_replicas(&current_obj).to_string();
            return Ok(vec![
                change(&action.target, "scale", "spec.replicas", Some(current.clone()), Some("0".to_string())),
                change(&action.target, "scale", "spec.replicas", Some("0".to_string()), Some(current)),
            ]);
        }

        Ok(vec![change(
            &action.target,
            "restart",
            "spec.template.metadata.annotations.healer.kubeskippy.io/restartedAt",
            None,
            Some("<would-be-set-to-now>".to_string()),
        )])
    }

    async fn execute(&self, action: &HealingActionSpec, client: &Client) -> Result<Vec<StructuredChange>, ExecutorError> {
        self.validate(action)?;
        let ActionTemplateSpec::Restart { strategy, grace_period_seconds } = action.action.spec else {
            unreachable!("validated above")
        };

        let api = resolve_api(client, &action.target).await?;

        if action.target.kind == "Pod" {
            let params = pod_delete_params(strategy, grace_period_seconds);
            api.delete(&action.target.name, &params).await.map_err(ExecutorError::Kube)?;
            return Ok(vec![change(&action.target, "delete", "$", Some("present".to_string()), Some("absent".to_string()))]);
        }

        if matches!(strategy, RestartStrategy::Recreate) {
            let current_obj = api.get(&action.target.name).await.map_err(ExecutorError::Kube)?;
            let original = current_replicas(&current_obj);

            api.patch(
                &action.target.name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&json!({ "spec": { "replicas": 0 } })),
            )
            .await
            .map_err(ExecutorError::Kube)?;

            api.patch(
                &action.target.name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&json!({ "spec": { "replicas": original } })),
            )
            .await
            .map_err(ExecutorError::Kube)?;

            return Ok(vec![
                change(&action.target, "scale", "spec.replicas", Some(original.to_string()), Some("0".to_string())),
                change(&action.target, "scale", "spec.replicas", Some("0".to_string()), Some(original.to_string())),
            ]);
        }

        let patch_body = build_restart_patch(strategy, grace_period_seconds);
        api.patch(
            &action.target.name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch_body),
        )
        .await
        .map_err(ExecutorError::Kube)?;

        Ok(vec![change(
            &action.target,
            "restart",
            "spec.template.metadata.annotations.healer.kubeskippy.io/restartedAt",
            None,
            Some(Utc::now().to_rfc3339()),
        )])
    }
}

/* ============================= SCALE ============================= */

pub struct ScaleExecutor;

fn compute_target_replicas(
    direction: ScaleDirection,
    delta: Option<i32>,
    replicas: Option<i32>,
    current: i32,
    min_replicas: Option<i32>,
    max_replicas: Option<i32>,
) -> i32 {
    let mut target = match direction {
        ScaleDirection::Up => current + delta.unwrap_or(1),
        ScaleDirection::Down => current - delta.unwrap_or(1),
        ScaleDirection::Absolute => replicas.unwrap_or(current),
    };
    if let Some(min) = min_replicas {
        target = target.max(min);
    }
    if let Some(max) = max_replicas {
        if max > 0 {
            target = target.min(max);
        }
    }
    target.max(0)
}

#[async_trait::async_trait]
impl Executor for ScaleExecutor {
    fn type_name(&self) -> &'static str {
        "scale"
    }

    fn validate(&self, action: &HealingActionSpec) -> Result<(), ExecutorError> {
        match &action.action.spec {
            ActionTemplateSpec::Scale { direction, replicas, .. } => {
                if matches!(direction, ScaleDirection::Absolute) && replicas.is_none() {
                    return Err(ExecutorError::Validation(
                        "absolute scale requires replicas".to_string(),
                    ));
                }
                Ok(())
            }
            other => Err(ExecutorError::Validation(format!(
                "ScaleExecutor cannot handle action type {}",
                other.type_name()
            ))),
        }
    }

    async fn dry_run(&self, action: &HealingActionSpec, client: &Client) -> Result<Vec<StructuredChange>, ExecutorError> {
        self.validate(action)?;
        let ActionTemplateSpec::Scale { direction, delta, replicas, min_replicas, max_replicas } = action.action.spec else {
            unreachable!("validated above")
        };

        let api = resolve_api(client, &action.target).await?;
        let current_obj = api.get(&action.target.name).await.map_err(ExecutorError::Kube)?;
        let current = current_replicas(&current_obj);
        let target = compute_target_replicas(direction, delta, replicas, current, min_replicas, max_replicas);

        if target == current {
            return Ok(vec![]);
        }

        Ok(vec![change(
            &action.target,
            "scale",
            "spec.replicas",
            Some(current.to_string()),
            Some(target.to_string()),
        )])
    }

    async fn execute(&self, action: &HealingActionSpec, client: &Client) -> Result<Vec<StructuredChange>, ExecutorError> {
        self.validate(action)?;
        let ActionTemplateSpec::Scale { direction, delta, replicas, min_replicas, max_replicas } = action.action.spec else {
            unreachable!("validated above")
        };

        let api = resolve_api(client, &action.target).await?;
        let current_obj = api.get(&action.target.name).await.map_err(ExecutorError::Kube)?;
        let current = current_replicas(&current_obj);
        let target = compute_target_replicas(direction, delta, replicas, current, min_replicas, max_replicas);

        // No-op if new == current: spec.md §4.4.
        if target == current {
            return Ok(vec![]);
        }

        let patch_body = json!({ "spec": { "replicas": target } });
        api.patch(
            &action.target.name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch_body),
        )
        .await
        .map_err(ExecutorError::Kube)?;

        Ok(vec![change(
            &action.target,
            "scale",
            "spec.replicas",
            Some(current.to_string()),
            Some(target.to_string()),
        )])
    }
}

fn current_replicas(obj: &DynamicObject) -> i32 {
    obj.data
        .get("spec")
        .and_then(|s| s.get("replicas"))
        .and_then(|r| r.as_i64())
        .unwrap_or(0) as i32
}

/* ============================= PATCH ============================= */

pub struct PatchExecutor;

fn build_patch_value(operations: &[crate::crd::PatchOperation], patch_type: PatchType) -> Result<serde_json::Value, ExecutorError> {
    match patch_type {
        PatchType::Json => {
            let ops: Result<Vec<serde_json::Value>, ExecutorError> = operations
                .iter()
                .map(|op| {
                    let value: serde_json::Value = serde_json::from_str(&op.value)
                        .map_err(|e| ExecutorError::Validation(format!("invalid JSON value for patch op: {e}")))?;
                    Ok(json!({
                        "op": "replace",
                        "path": format!("/{}", op.path.join("/")),
                        "value": value,
                    }))
                })
                .collect();
            Ok(serde_json::Value::Array(ops?))
        }
        PatchType::Merge | PatchType::Strategic => {
            let mut root = json!({});
            for op in operations {
                let value: serde_json::Value = serde_json::from_str(&op.value)
                    .map_err(|e| ExecutorError::Validation(format!("invalid JSON value for patch op: {e}")))?;
                set_nested(&mut root, &op.path, value);
            }
            Ok(root)
        }
    }
}

/// Reads the value currently at `path` in `obj`, for the pre-change side of
/// a patch's structured change record (spec.md §4.4: "read current value at
/// path … emit a change record"). `None` if any path segment doesn't exist.
fn read_value_at_path(obj: &DynamicObject, path: &[String]) -> Option<serde_json::Value> {
    let mut cursor = &obj.data;
    for segment in path {
        cursor = cursor.get(segment)?;
    }
    Some(cursor.clone())
}

fn set_nested(root: &mut serde_json::Value, path: &[String], value: serde_json::Value) {
    let mut cursor = root;
    for segment in &path[..path.len().saturating_sub(1)] {
        if !cursor.get(segment).is_some_and(|v| v.is_object()) {
            cursor[segment.as_str()] = json!({});
        }
        cursor = &mut cursor[segment.as_str()];
    }
    if let Some(last) = path.last() {
        cursor[last.as_str()] = value;
    }
}

#[async_trait::async_trait]
impl Executor for PatchExecutor {
    fn type_name(&self) -> &'static str {
        "patch"
    }

    fn validate(&self, action: &HealingActionSpec) -> Result<(), ExecutorError> {
        match &action.action.spec {
            ActionTemplateSpec::Patch { operations, .. } => {
                if operations.is_empty() {
                    return Err(ExecutorError::Validation("patch has no operations".to_string()));
                }
                Ok(())
            }
            other => Err(ExecutorError::Validation(format!(
                "PatchExecutor cannot handle action type {}",
                other.type_name()
            ))),
        }
    }

    async fn dry_run(&self, action: &HealingActionSpec, client: &Client) -> Result<Vec<StructuredChange>, ExecutorError> {
        self.validate(action)?;
        let ActionTemplateSpec::Patch { operations, .. } = &action.action.spec else {
            unreachable!("validated above")
        };

        let api = resolve_api(client, &action.target).await?;
        let current_obj = api.get(&action.target.name).await.map_err(ExecutorError::Kube)?;

        Ok(operations
            .iter()
            .map(|op| {
                let old_value = read_value_at_path(&current_obj, &op.path).map(|v| v.to_string());
                change(&action.target, "patch", &op.path.join("."), old_value, Some(op.value.clone()))
            })
            .collect())
    }

    async fn execute(&self, action: &HealingActionSpec, client: &Client) -> Result<Vec<StructuredChange>, ExecutorError> {
        self.validate(action)?;
        let ActionTemplateSpec::Patch { patch_type, operations } = &action.action.spec else {
            unreachable!("validated above")
        };

        let api = resolve_api(client, &action.target).await?;
        let current_obj = api.get(&action.target.name).await.map_err(ExecutorError::Kube)?;
        let patch_value = build_patch_value(operations, *patch_type)?;

        match patch_type {
            PatchType::Json => {
                api.patch(
                    &action.target.name,
                    &PatchParams::apply(FIELD_MANAGER),
                    &Patch::Json::<()>(
                        serde_json::from_value(patch_value).map_err(|e| ExecutorError::Validation(e.to_string()))?,
                    ),
                )
                .await
                .map_err(ExecutorError::Kube)?;
            }
            PatchType::Merge => {
                api.patch(
                    &action.target.name,
                    &PatchParams::apply(FIELD_MANAGER),
                    &Patch::Merge(&patch_value),
                )
                .await
                .map_err(ExecutorError::Kube)?;
            }
            PatchType::Strategic => {
                api.patch(
                    &action.target.name,
                    &PatchParams::apply(FIELD_MANAGER),
                    &Patch::Strategic(&patch_value),
                )
                .await
                .map_err(ExecutorError::Kube)?;
            }
        }

        Ok(operations
            .iter()
            .map(|op| {
                let old_value = read_value_at_path(&current_obj, &op.path).map(|v| v.to_string());
                change(&action.target, "patch", &op.path.join("."), old_value, Some(op.value.clone()))
            })
            .collect())
    }
}

/* ============================= DELETE ============================= */

pub struct DeleteExecutor;

fn build_delete_params(grace_period_seconds: Option<i64>, force: bool, propagation_policy: PropagationPolicy) -> DeleteParams {
    let grace_period_seconds = if force { Some(0) } else { grace_period_seconds };
    DeleteParams {
        grace_period_seconds: grace_period_seconds.map(|g| g as u32),
        propagation_policy: Some(match propagation_policy {
            PropagationPolicy::Orphan => kube::api::PropagationPolicy::Orphan,
            PropagationPolicy::Background => kube::api::PropagationPolicy::Background,
            PropagationPolicy::Foreground => kube::api::PropagationPolicy::Foreground,
        }),
        preconditions: None::<Preconditions>,
        dry_run: false,
    }
}

#[async_trait::async_trait]
impl Executor for DeleteExecutor {
    fn type_name(&self) -> &'static str {
        "delete"
    }

    fn validate(&self, action: &HealingActionSpec) -> Result<(), ExecutorError> {
        match &action.action.spec {
            ActionTemplateSpec::Delete { .. } => Ok(()),
            other => Err(ExecutorError::Validation(format!(
                "DeleteExecutor cannot handle action type {}",
                other.type_name()
            ))),
        }
    }

    async fn dry_run(&self, action: &HealingActionSpec, _client: &Client) -> Result<Vec<StructuredChange>, ExecutorError> {
        self.validate(action)?;
        Ok(vec![change(&action.target, "delete", "$", Some("present".to_string()), Some("absent".to_string()))])
    }

    async fn execute(&self, action: &HealingActionSpec, client: &Client) -> Result<Vec<StructuredChange>, ExecutorError> {
        self.validate(action)?;
        let ActionTemplateSpec::Delete { grace_period_seconds, force, propagation_policy } = action.action.spec else {
            unreachable!("validated above")
        };

        let api = resolve_api(client, &action.target).await?;
        let current = api.get(&action.target.name).await.map_err(ExecutorError::Kube)?;
        let finalizers = current.metadata.finalizers.clone().unwrap_or_default();

        if !finalizers.is_empty() {
            if !force {
                return Err(ExecutorError::Validation(format!(
                    "{} has {} finalizer(s); set force=true to clear them before deletion",
                    action.target.key(),
                    finalizers.len()
                )));
            }
            api.patch(
                &action.target.name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Merge(&json!({ "metadata": { "finalizers": [] } })),
            )
            .await
            .map_err(ExecutorError::Kube)?;
        }

        let params = build_delete_params(grace_period_seconds, force, propagation_policy);
        api.delete(&action.target.name, &params).await.map_err(ExecutorError::Kube)?;

        Ok(vec![change(&action.target, "delete", "$", Some("present".to_string()), Some("absent".to_string()))])
    }
}

/* ============================= REGISTRY ============================= */

/// Open registry keyed by action-type string; custom executors can be
/// registered without a central switch.
pub struct ExecutorRegistry {
    executors: BTreeMap<String, Box<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            executors: BTreeMap::new(),
        };
        registry.register(Box::new(RestartExecutor));
        registry.register(Box::new(ScaleExecutor));
        registry.register(Box::new(PatchExecutor));
        registry.register(Box::new(DeleteExecutor));
        registry
    }

    pub fn register(&mut self, executor: Box<dyn Executor>) {
        self.executors.insert(executor.type_name().to_string(), executor);
    }

    pub fn get(&self, type_name: &str) -> Option<&dyn Executor> {
        self.executors.get(type_name).map(|e| e.as_ref())
    }
}
