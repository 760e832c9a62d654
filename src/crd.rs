use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/* ============================= SELECTOR ============================= */

/// Namespace/label/kind selector a HealingPolicy watches.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    /// Namespaces to watch. Empty means all namespaces.
    #[serde(default)]
    pub namespaces: Vec<String>,

    /// Label predicate candidate resources must satisfy (all key=value pairs).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<BTreeMap<String, String>>,

    /// Resource kinds to watch, each with its own exclusion list.
    #[serde(default)]
    pub resource_kinds: Vec<ResourceKindFilter>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceKindFilter {
    pub kind: String,
    #[serde(default)]
    pub exclude_names: Vec<String>,
}

/* ============================= TRIGGERS ============================= */

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ComparisonOperator {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl ComparisonOperator {
    pub fn holds(&self, sample: f64, threshold: f64) -> bool {
        match self {
            Self::Gt => sample > threshold,
            Self::Lt => sample < threshold,
            Self::Ge => sample >= threshold,
            Self::Le => sample <= threshold,
            Self::Eq => (sample - threshold).abs() < f64::EPSILON,
            Self::Ne => (sample - threshold).abs() >= f64::EPSILON,
        }
    }
}

/// Kind-specific trigger payload; `kind` doubles as the JSON tag.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum TriggerSpec {
    Metric {
        query: String,
        threshold: f64,
        operator: ComparisonOperator,
        #[serde(default)]
        sustain_seconds: u64,
    },
    Event {
        reason_regex: String,
        event_type: String,
        count_threshold: u32,
        window_seconds: u64,
    },
    Condition {
        condition_type: String,
        expected_status: String,
        #[serde(default)]
        sustain_seconds: u64,
    },
}

impl TriggerSpec {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Metric { .. } => "metric",
            Self::Event { .. } => "event",
            Self::Condition { .. } => "condition",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    pub name: String,
    #[serde(flatten)]
    pub spec: TriggerSpec,
    pub cooldown_seconds: u64,
}

/* ============================= ACTION TEMPLATES ============================= */

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RestartStrategy {
    Rolling,
    Recreate,
    Graceful,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ScaleDirection {
    Up,
    Down,
    Absolute,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PatchType {
    Json,
    Merge,
    Strategic,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum PropagationPolicy {
    Orphan,
    Background,
    Foreground,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PatchOperation {
    pub path: Vec<String>,
    /// String-encoded JSON value to set at `path`.
    pub value: String,
}

/// Type-specific payload for an action template; `type` doubles as the tag.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum ActionTemplateSpec {
    Restart {
        strategy: RestartStrategy,
        #[serde(default)]
        grace_period_seconds: Option<i64>,
    },
    Scale {
        direction: ScaleDirection,
        #[serde(default)]
        delta: Option<i32>,
        #[serde(default)]
        replicas: Option<i32>,
        #[serde(default)]
        min_replicas: Option<i32>,
        #[serde(default)]
        max_replicas: Option<i32>,
    },
    Patch {
        patch_type: PatchType,
        operations: Vec<PatchOperation>,
    },
    Delete {
        #[serde(default)]
        grace_period_seconds: Option<i64>,
        #[serde(default)]
        force: bool,
        propagation_policy: PropagationPolicy,
    },
    Custom {
        executor_name: String,
        #[serde(default)]
        payload: Option<serde_json::Value>,
    },
}

impl ActionTemplateSpec {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Restart { .. } => "restart",
            Self::Scale { .. } => "scale",
            Self::Patch { .. } => "patch",
            Self::Delete { .. } => "delete",
            Self::Custom { .. } => "custom",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionTemplate {
    pub name: String,
    #[serde(flatten)]
    pub spec: ActionTemplateSpec,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub requires_approval: bool,
}

/* ============================= SAFETY RULES ============================= */

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SafetyRules {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_actions_per_hour: Option<u32>,

    #[serde(default)]
    pub protected_resources: Vec<String>,

    #[serde(default)]
    pub require_health_check: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_timeout_seconds: Option<u64>,
}

/* ============================= MODE ============================= */

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    #[default]
    Monitor,
    Dryrun,
    Automatic,
    Manual,
}

/* ============================= HEALING POLICY ============================= */

/// HealingPolicy declares what to watch, which triggers signal unhealthy
/// state, and which remediation templates to apply when they fire.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "kubeskippy.io",
    version = "v1alpha1",
    kind = "HealingPolicy",
    plural = "healingpolicies",
    shortname = "hp",
    status = "HealingPolicyStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct HealingPolicySpec {
    #[serde(default)]
    pub selector: Selector,

    #[serde(default)]
    pub triggers: Vec<Trigger>,

    #[serde(default)]
    pub actions: Vec<ActionTemplate>,

    #[serde(default)]
    pub safety_rules: SafetyRules,

    #[serde(default)]
    pub mode: PolicyMode,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct HealingPolicyStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_evaluated: Option<DateTime<Utc>>,

    #[serde(default)]
    pub active_triggers: Vec<String>,

    #[serde(default)]
    pub trigger_last_fired: BTreeMap<String, DateTime<Utc>>,

    #[serde(default)]
    pub actions_taken: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_action_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub conditions: Vec<StatusCondition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// A minimal condition type, following the Kubernetes `type/status/reason/
/// message` convention without pulling in the full apimachinery Condition
/// (which requires a lastTransitionTime format this crate does not need to
/// match byte-for-byte).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
    pub reason: String,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/* ============================= HEALING ACTION ============================= */

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRef {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct TargetRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

impl TargetRef {
    pub fn key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.api_version, self.kind, self.namespace, self.name
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_seconds")]
    pub initial_backoff_seconds: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff_seconds() -> u64 {
    10
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl RetryPolicy {
    /// next-attempt time for attempt `k` (1-indexed), per spec.md invariant A3.
    pub fn backoff_for_attempt(&self, k: u32) -> chrono::Duration {
        let seconds = self.initial_backoff_seconds as f64 * self.multiplier.powi(k as i32 - 1);
        chrono::Duration::milliseconds((seconds * 1000.0) as i64)
    }
}

/// HealingAction is materialized by the Policy Reconciler and driven through
/// its lifecycle by the Action Reconciler.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "kubeskippy.io",
    version = "v1alpha1",
    kind = "HealingAction",
    plural = "healingactions",
    shortname = "ha",
    status = "HealingActionStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct HealingActionSpec {
    pub policy_ref: PolicyRef,
    pub target: TargetRef,
    pub action: ActionTemplate,

    #[serde(default)]
    pub approval_required: bool,

    #[serde(default)]
    pub dry_run: bool,

    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,

    #[serde(default)]
    pub retry_policy: RetryPolicy,

    /// Snapshot of the owning policy's `safetyRules.protectedResources` at
    /// materialization time, so C3 can evaluate the predicate without a
    /// second fetch of the policy object.
    #[serde(default)]
    pub policy_protected_resources: Vec<String>,

    /// Snapshot of the owning policy's `safetyRules.requireHealthCheck`/
    /// `healthCheckTimeoutSeconds`.
    #[serde(default)]
    pub health_check: HealthCheckSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckSpec {
    #[serde(default)]
    pub required: bool,
    #[serde(default = "default_health_check_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        Self { required: false, timeout_seconds: default_health_check_timeout_seconds() }
    }
}

fn default_health_check_timeout_seconds() -> u64 {
    30
}

fn default_timeout_seconds() -> u64 {
    300
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum ActionPhase {
    #[default]
    Pending,
    Approved,
    InProgress,
    Succeeded,
    Failed,
    Cancelled,
}

impl ActionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StructuredChange {
    pub resource_ref: String,
    pub change_kind: String,
    pub field_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ActionResultStatus {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default)]
    pub changes: Vec<StructuredChange>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalStatus {
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub granted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct HealingActionStatus {
    #[serde(default)]
    pub phase: ActionPhase,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub attempts: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ActionResultStatus>,

    #[serde(default)]
    pub approval: ApprovalStatus,

    #[serde(default)]
    pub conditions: Vec<StatusCondition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/* ============================= TESTS ============================= */
