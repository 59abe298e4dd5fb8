//! fleetd — the FleetGrid daemon.
//!
//! # Usage
//!
//! ```text
//! fleetd run --config fleetd.toml --data-dir /var/lib/fleetgrid
//! fleetd check-config --config fleetd.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fleet_core::FleetConfig;
use fleetd::ControlPlane;
use fleetgrid_autoscale::{NoopProvisioner, NullMetrics};
use fleetgrid_state::StateStore;

const DEFAULT_FILTER: &str = "info,fleetd=debug,fleetgrid=debug";

#[derive(Parser)]
#[command(name = "fleetd", about = "FleetGrid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane until Ctrl-C.
    Run {
        /// Path to fleetd.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/fleetgrid")]
        data_dir: PathBuf,

        /// Emit logs as JSON lines.
        #[arg(long)]
        log_json: bool,
    },
    /// Validate a config file and print it with defaults filled in.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            data_dir,
            log_json,
        } => {
            init_tracing(log_json);
            run(config.as_deref(), &data_dir).await
        }
        Command::CheckConfig { config } => {
            init_tracing(false);
            check_config(&config)
        }
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    // stderr keeps `check-config` output clean on stdout.
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<FleetConfig> {
    match path {
        Some(path) => FleetConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(FleetConfig::default()),
    }
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = load_config(Some(path))?;
    print!("{}", config.to_toml_string()?);
    info!(path = %path.display(), "config is valid");
    Ok(())
}

async fn run(config_path: Option<&Path>, data_dir: &Path) -> anyhow::Result<()> {
    info!("FleetGrid daemon starting");

    let config = load_config(config_path)?;

    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;
    let db_path = data_dir.join("fleetgrid.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    // Telemetry and provisioning are external; until they are wired in the
    // autoscaler only holds the pool at its minimum.
    let plane = ControlPlane::new(
        config,
        Arc::new(store),
        Arc::new(NullMetrics),
        Arc::new(NoopProvisioner),
    )
    .await?;

    // ── Shutdown signal ────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = plane.start(shutdown_rx).await;

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl-C, shutting down");
    }
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        if let Err(e) = handle.await {
            error!(error = %e, "background task failed");
        }
    }
    plane.autoscaler().shutdown();

    let stats = plane.registry().stats().await;
    info!(
        services = stats.services.len(),
        instances = stats.totals.total,
        "FleetGrid daemon stopped"
    );
    Ok(())
}
