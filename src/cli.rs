use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "healer")]
#[command(about = "Autonomous remediation controller for Kubernetes workloads")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the controller's YAML configuration file (falls back to
    /// HEALER_CONFIG, then to built-in defaults).
    #[arg(long, global = true)]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Display application version
    Version,

    /// Check cluster connectivity and permissions
    Check,

    /// List Kubernetes resources (e.g. pods)
    List {
        /// Resource type to list (pods)
        resource: String,
    },

    /// Manage the HealingPolicy/HealingAction CRDs
    Crd {
        #[command(subcommand)]
        action: CrdAction,
    },

    /// Print a built-in starter HealingPolicy (conservative/standard/aggressive)
    Bundle {
        /// Bundle name; omit to list all available bundles
        name: Option<String>,
    },

    /// Run the Policy Reconciler and Action Reconciler controllers
    Operator {
        /// Address the /metrics, /healthz and /readyz HTTP server binds to
        #[arg(long, default_value = "0.0.0.0:9090")]
        metrics_addr: String,
    },
}

#[derive(Subcommand)]
pub enum CrdAction {
    /// Print the CRD YAML for both HealingPolicy and HealingAction to stdout
    Generate,

    /// Install both CRDs into the connected cluster
    Install,
}
