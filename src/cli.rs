use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "loadtest-operator")]
#[command(about = "gRPC benchmark LoadTest orchestrator")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Path to the system-wide defaults YAML document.
    #[arg(long, global = true, default_value = "config/defaults.yaml")]
    pub defaults_file: String,

    /// Restrict watch scope to a single namespace; unset watches all.
    #[arg(long, global = true)]
    pub namespace: Option<String>,

    /// Emit structured logs as JSON instead of human-readable text.
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage the LoadTest CRD.
    Crd {
        #[command(subcommand)]
        action: CrdAction,
    },

    /// Check cluster connectivity and basic RBAC.
    Check,

    /// List LoadTests with namespace/state/age columns.
    List,

    /// Run the primary LoadTest reconciler.
    Reconcile {
        #[arg(long, default_value = ":8080")]
        metrics_bind_address: String,
        #[arg(long, default_value = ":8081")]
        health_probe_bind_address: String,
        #[arg(long, default_value_t = false)]
        leader_elect: bool,
    },

    /// Run the cleanup agent, signalling terminated tests' live workers to quit.
    Cleanup {
        #[arg(long, default_value = ":8082")]
        metrics_bind_address: String,
        #[arg(long, default_value = ":8083")]
        health_probe_bind_address: String,
        #[arg(long, default_value_t = false)]
        leader_elect: bool,
    },
}

#[derive(Subcommand)]
pub enum CrdAction {
    /// Print the LoadTest CRD YAML to stdout.
    Generate,
    /// Install the CRD into the connected cluster.
    Install,
}
