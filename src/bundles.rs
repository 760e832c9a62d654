//! Built-in starter `HealingPolicy` templates, the spec-domain equivalent of
//! the teacher's baseline/restricted/permissive bundles: ready-to-apply
//! starting points an operator can install verbatim or tweak, not something
//! the reconcilers consume directly.

use crate::crd::{
    ActionTemplate, ActionTemplateSpec, ComparisonOperator, HealingPolicySpec, PolicyMode,
    ResourceKindFilter, RestartStrategy, SafetyRules, Selector, Trigger, TriggerSpec,
};

/// A pre-defined policy template with a name and description.
#[derive(Debug, Clone)]
pub struct PolicyBundle {
    pub name: String,
    pub description: String,
    pub spec: HealingPolicySpec,
}

/// Return all built-in policy bundles.
pub fn all_bundles() -> Vec<PolicyBundle> {
    vec![conservative_bundle(), standard_bundle(), aggressive_bundle()]
}

/// Look up a bundle by name (case-insensitive).
pub fn get_bundle(name: &str) -> Option<PolicyBundle> {
    let lower = name.to_lowercase();
    all_bundles().into_iter().find(|b| b.name == lower)
}

fn deployment_selector() -> Selector {
    Selector {
        namespaces: Vec::new(),
        label_selector: None,
        resource_kinds: vec![ResourceKindFilter { kind: "Deployment".to_string(), exclude_names: Vec::new() }],
    }
}

fn restart_on_high_memory(cooldown_seconds: u64, sustain_seconds: u64) -> Trigger {
    Trigger {
        name: "high-memory".to_string(),
        spec: TriggerSpec::Metric {
            query: "memory_usage_percent".to_string(),
            threshold: 90.0,
            operator: ComparisonOperator::Gt,
            sustain_seconds,
        },
        cooldown_seconds,
    }
}

fn restart_template(requires_approval: bool) -> ActionTemplate {
    ActionTemplate {
        name: "restart".to_string(),
        spec: ActionTemplateSpec::Restart { strategy: RestartStrategy::Rolling, grace_period_seconds: None },
        priority: 10,
        requires_approval,
    }
}

fn scale_up_template(requires_approval: bool) -> ActionTemplate {
    ActionTemplate {
        name: "scale-up".to_string(),
        spec: ActionTemplateSpec::Scale {
            direction: crate::crd::ScaleDirection::Up,
            delta: Some(1),
            replicas: None,
            min_replicas: Some(1),
            max_replicas: Some(10),
        },
        priority: 5,
        requires_approval,
    }
}

/// Observe-only, human approves every action. For teams new to the
/// controller who want visibility before granting it write access.
fn conservative_bundle() -> PolicyBundle {
    PolicyBundle {
        name: "conservative".to_string(),
        description: "Watch only, no actions taken. Promote to standard once the trigger set is trusted.".to_string(),
        spec: HealingPolicySpec {
            selector: deployment_selector(),
            triggers: vec![restart_on_high_memory(600, 120)],
            actions: vec![restart_template(true)],
            safety_rules: SafetyRules { max_actions_per_hour: Some(2), require_health_check: true, ..Default::default() },
            mode: PolicyMode::Monitor,
        },
    }
}

/// Automatic restart on sustained memory pressure, approval only for scale.
fn standard_bundle() -> PolicyBundle {
    PolicyBundle {
        name: "standard".to_string(),
        description: "Automatic restart on sustained high memory, moderate rate limit.".to_string(),
        spec: HealingPolicySpec {
            selector: deployment_selector(),
            triggers: vec![restart_on_high_memory(300, 60)],
            actions: vec![restart_template(false), scale_up_template(true)],
            safety_rules: SafetyRules { max_actions_per_hour: Some(10), require_health_check: true, ..Default::default() },
            mode: PolicyMode::Automatic,
        },
    }
}

/// Automatic restart and scale, no approval gate, short cooldown and a
/// higher rate limit ceiling.
fn aggressive_bundle() -> PolicyBundle {
    PolicyBundle {
        name: "aggressive".to_string(),
        description: "Automatic restart and scale with no approval gate. For well-understood workloads only.".to_string(),
        spec: HealingPolicySpec {
            selector: deployment_selector(),
            triggers: vec![restart_on_high_memory(60, 30)],
            actions: vec![restart_template(false), scale_up_template(false)],
            safety_rules: SafetyRules { max_actions_per_hour: Some(30), require_health_check: false, ..Default::default() },
            mode: PolicyMode::Automatic,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_bundles_count() {
        assert_eq!(all_bundles().len(), 3);
    }

    #[test]
    fn get_bundle_conservative_is_monitor_only() {
        let bundle = get_bundle("conservative").unwrap();
        assert_eq!(bundle.spec.mode, PolicyMode::Monitor);
        assert!(bundle.spec.actions[0].requires_approval);
    }

    #[test]
    fn get_bundle_standard_restarts_without_approval() {
        let bundle = get_bundle("standard").unwrap();
        assert_eq!(bundle.spec.mode, PolicyMode::Automatic);
        assert!(!bundle.spec.actions[0].requires_approval);
        assert!(bundle.spec.actions[1].requires_approval);
    }

    #[test]
    fn get_bundle_aggressive_has_highest_rate_limit() {
        let bundle = get_bundle("aggressive").unwrap();
        assert_eq!(bundle.spec.safety_rules.max_actions_per_hour, Some(30));
        assert!(!bundle.spec.safety_rules.require_health_check);
    }

    #[test]
    fn get_bundle_unknown_returns_none() {
        assert!(get_bundle("nonexistent").is_none());
    }

    #[test]
    fn get_bundle_case_insensitive() {
        assert!(get_bundle("Standard").is_some());
        assert!(get_bundle("AGGRESSIVE").is_some());
    }

    #[test]
    fn bundle_names_unique() {
        let bundles = all_bundles();
        let names: Vec<&str> = bundles.iter().map(|b| b.name.as_str()).collect();
        let mut unique = names.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(names.len(), unique.len(), "bundle names should be unique");
    }

    #[test]
    fn bundle_specs_round_trip_through_json() {
        for bundle in all_bundles() {
            let json = serde_json::to_string(&bundle.spec).expect("should serialize");
            let _: HealingPolicySpec = serde_json::from_str(&json).expect("should deserialize");
        }
    }
}
