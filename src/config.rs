//! The single structured configuration document, loaded from a YAML file
//! path given by `--config` / `HEALER_CONFIG`, falling back to built-in
//! defaults so the binary runs against a bare cluster with no config file
//! at all.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricsConfig {
    pub backend_url: Option<String>,
    pub use_builtin_metrics: bool,
    pub collection_interval_seconds: u64,
    pub retention_seconds: u64,
    pub custom_queries: BTreeMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            backend_url: None,
            use_builtin_metrics: true,
            collection_interval_seconds: 30,
            retention_seconds: 3600,
            custom_queries: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AdvisorConfig {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub endpoint: Option<String>,
    pub timeout_seconds: u64,
    pub max_tokens: u32,
    pub temperature: f64,
    pub min_confidence: f64,
    pub validate_responses: bool,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            provider: None,
            model: None,
            endpoint: None,
            timeout_seconds: 30,
            max_tokens: 1024,
            temperature: 0.2,
            min_confidence: 0.6,
            validate_responses: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout_seconds: u64,
    pub half_open_budget: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout_seconds: 60,
            half_open_budget: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AuditLogConfig {
    pub enabled: bool,
    pub file_path: Option<String>,
    pub rotation_mb: u64,
    pub backups: u32,
    pub max_age_days: u32,
}

impl Default for AuditLogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            file_path: None,
            rotation_mb: 100,
            backups: 5,
            max_age_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SafetyConfig {
    pub dry_run_mode: bool,
    pub max_actions_per_hour: u32,
    pub require_approval: bool,
    pub protected_namespaces: Vec<String>,
    pub protected_labels: BTreeMap<String, String>,
    pub circuit_breaker: CircuitBreakerConfig,
    pub audit_log: AuditLogConfig,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            dry_run_mode: false,
            max_actions_per_hour: 10,
            require_approval: false,
            protected_namespaces: vec![
                "kube-system".to_string(),
                "kube-public".to_string(),
                "kube-node-lease".to_string(),
            ],
            protected_labels: BTreeMap::new(),
            circuit_breaker: CircuitBreakerConfig::default(),
            audit_log: AuditLogConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ActionTypeDefaults {
    pub timeout_seconds: Option<u64>,
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ActionDefaults {
    pub restart: ActionTypeDefaults,
    pub scale: ActionTypeDefaults,
    pub patch: ActionTypeDefaults,
    pub delete: ActionTypeDefaults,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RemediationConfig {
    pub default_timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_backoff_seconds: u64,
    pub enable_rollback: bool,
    pub parallel_actions: u32,
    pub action_defaults: ActionDefaults,
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: 300,
            max_retries: 3,
            retry_backoff_seconds: 10,
            enable_rollback: true,
            parallel_actions: 5,
            action_defaults: ActionDefaults::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Configuration {
    pub metrics: MetricsConfig,
    pub advisor: AdvisorConfig,
    pub safety: SafetyConfig,
    pub remediation: RemediationConfig,
    pub logging: LoggingConfig,
}

impl Configuration {
    /// Load from `path` if it exists, otherwise return built-in defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {:?}: {e}", path))?;
        let cfg: Self = serde_yaml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("failed to parse config file {:?}: {e}", path))?;
        Ok(cfg)
    }

    /// Resolve the config path from `--config` or the `HEALER_CONFIG` env var.
    pub fn resolve_path(cli_path: Option<String>) -> Option<std::path::PathBuf> {
        cli_path
            .map(std::path::PathBuf::from)
            .or_else(|| std::env::var("HEALER_CONFIG").ok().map(std::path::PathBuf::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_named_values() {
        let cfg = Configuration::default();
        assert_eq!(cfg.metrics.collection_interval_seconds, 30);
        assert_eq!(cfg.advisor.min_confidence, 0.6);
        assert_eq!(cfg.safety.circuit_breaker.failure_threshold, 5);
        assert_eq!(cfg.safety.circuit_breaker.success_threshold, 2);
        assert_eq!(cfg.remediation.default_timeout_seconds, 300);
        assert_eq!(cfg.remediation.parallel_actions, 5);
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let cfg = Configuration::load(Some(Path::new("/nonexistent/path/healer.yaml"))).unwrap();
        assert_eq!(cfg, Configuration::default());
    }

    #[test]
    fn no_path_falls_back_to_defaults() {
        let cfg = Configuration::load(None).unwrap();
        assert_eq!(cfg, Configuration::default());
    }

    #[test]
    fn partial_yaml_document_fills_remaining_fields_with_defaults() {
        let yaml = "safety:\n  maxActionsPerHour: 25\n";
        let cfg: Configuration = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.safety.max_actions_per_hour, 25);
        assert_eq!(cfg.metrics.collection_interval_seconds, 30);
    }

    #[test]
    fn resolve_path_prefers_cli_over_env() {
        std::env::set_var("HEALER_CONFIG", "/tmp/from-env.yaml");
        let resolved = Configuration::resolve_path(Some("/tmp/from-cli.yaml".to_string()));
        assert_eq!(resolved, Some(std::path::PathBuf::from("/tmp/from-cli.yaml")));
        std::env::remove_var("HEALER_CONFIG");
    }
}
