//! fleetd: the fleetscale daemon.
//!
//! Single binary that assembles the autoscaler:
//! - Node provider (from `[provider]`)
//! - Load metrics store fed by heartbeats
//! - Autoscaler control loop
//! - REST API + Prometheus metrics
//!
//! # Usage
//!
//! ```text
//! fleetd run --config cluster.toml --port 8470
//! fleetd hash --config cluster.toml
//! fleetd validate --config cluster.toml
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fleet_core::{ClusterConfig, hashes_for};
use fleetscale_api::ApiState;
use fleetscale_autoscale::{Autoscaler, control_channel};
use fleetscale_metrics::LoadMetrics;

#[derive(Parser)]
#[command(name = "fleetd", about = "fleetscale cluster autoscaler daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control loop and serve the API.
    Run {
        /// Cluster config file.
        #[arg(long, default_value = "cluster.toml")]
        config: PathBuf,

        /// Port to listen on.
        #[arg(long, default_value = "8470")]
        port: u16,

        /// Emit JSON log lines.
        #[arg(long)]
        log_json: bool,
    },
    /// Print the launch and files hash of every node type.
    Hash {
        #[arg(long, default_value = "cluster.toml")]
        config: PathBuf,
    },
    /// Check a cluster config file and exit.
    Validate {
        #[arg(long, default_value = "cluster.toml")]
        config: PathBuf,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fleetd=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            port,
            log_json,
        } => {
            init_tracing(log_json);
            run(config, port).await
        }
        Command::Hash { config } => {
            init_tracing(false);
            print_hashes(&config)
        }
        Command::Validate { config } => {
            init_tracing(false);
            let cfg = load_config(&config)?;
            println!(
                "{}: cluster {:?}, {} node types, provider {}",
                config.display(),
                cfg.cluster_name,
                cfg.node_types.len(),
                cfg.provider.kind()
            );
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> anyhow::Result<ClusterConfig> {
    ClusterConfig::from_file(path).with_context(|| format!("loading {}", path.display()))
}

fn print_hashes(path: &Path) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let hashes = hashes_for(&config).context("hashing node types")?;
    let out: serde_json::Map<String, serde_json::Value> = hashes
        .iter()
        .map(|(node_type, h)| {
            (
                node_type.clone(),
                serde_json::json!({ "launch": h.launch.as_str(), "files": h.files.as_str() }),
            )
        })
        .collect();
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

async fn run(config_path: PathBuf, port: u16) -> anyhow::Result<()> {
    let config = load_config(&config_path)?;
    info!(
        cluster = %config.cluster_name,
        node_types = config.node_types.len(),
        path = %config_path.display(),
        "fleetd starting"
    );

    // ── Initialize subsystems ──────────────────────────────────

    let provider = fleetscale_provider::build_provider(&config).context("building node provider")?;
    let load_metrics = LoadMetrics::shared(config.autoscaler.heartbeat_timeout_s);
    let (demand_tx, demand_rx) = watch::channel(Vec::new());
    let (control_tx, control_rx) = control_channel();

    let mut autoscaler = Autoscaler::new(config, provider, load_metrics.clone(), demand_rx)
        .context("initializing autoscaler")?
        .with_control(control_rx);
    let status_rx = autoscaler.status();

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let autoscale_handle = tokio::spawn(async move {
        autoscaler.run(shutdown_rx).await;
    });

    // ── Start API server ───────────────────────────────────────

    let router = fleetscale_api::build_router(ApiState {
        load_metrics,
        demand: Arc::new(demand_tx),
        status: status_rx,
        control: control_tx,
        config_path: Some(config_path),
    });
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;

    // Graceful shutdown on Ctrl-C.
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for ctrl-c");
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = autoscale_handle.await;

    info!("fleetd stopped");
    Ok(())
}
