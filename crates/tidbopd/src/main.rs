//! tidbopd — the tidbop daemon.
//!
//! Runs the cluster controller against a Kubernetes namespace:
//! - Cluster store (redb)
//! - Watch controller keeping per-cluster locks in step
//! - Startup recovery of interrupted installs and uninstalls
//! - Periodic reconciler (placement members, stores, SQL pods, versions)
//!
//! # Usage
//!
//! ```text
//! tidbopd run --config /etc/tidbop/tidbop.toml --data-dir /var/lib/tidbop
//! tidbopd check-config --config /etc/tidbop/tidbop.toml
//! ```

mod daemon;

use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tidbop_controller::OperatorConfig;

#[derive(Parser)]
#[command(name = "tidbopd", about = "tidbop cluster controller daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller until interrupted.
    Run {
        /// Operator configuration file.
        #[arg(long, default_value = "/etc/tidbop/tidbop.toml")]
        config: PathBuf,

        /// Data directory for the cluster store.
        #[arg(long, default_value = "/var/lib/tidbop")]
        data_dir: PathBuf,

        /// Kubeconfig context to use instead of the in-cluster or default one.
        #[arg(long)]
        kubeconfig_context: Option<String>,
    },
    /// Parse and validate a configuration file, then exit.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tidbopd=debug,tidbop=debug"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run {
            config,
            data_dir,
            kubeconfig_context,
        } => daemon::run(&config, data_dir, kubeconfig_context).await,
        Command::CheckConfig { config } => {
            let parsed = OperatorConfig::from_file(&config)
                .with_context(|| format!("invalid config {}", config.display()))?;
            println!(
                "{}: ok (namespace {}, registry {}, versions {})",
                config.display(),
                parsed.namespace,
                parsed.registry,
                parsed.versions.join(", ")
            );
            Ok(())
        }
    }
}
