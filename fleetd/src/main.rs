//! Fleet daemon
//!
//! Keeps the device registry and task store on disk, re-arms recurring
//! tasks on a fixed tick and delivers pending commands to devices over the
//! TCP command channel.

use std::io;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use fleetd::{Daemon, DaemonConfig};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DAEMON_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Debug)]
#[command(name = "fleetd", version)]
#[command(about = "Fleet daemon: device registry, task scheduling and command channel")]
struct Cli {
    /// Path to the configuration file (defaults to ./fleetd.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Base directory for the registry and task snapshots
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Command channel TCP port
    #[arg(long)]
    port: Option<u16>,

    /// Interface to bind the command channel on
    #[arg(long)]
    bind: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let mut config = DaemonConfig::load(cli.config.as_deref())?;
    config.apply_env();
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if let Some(port) = cli.port {
        config.tcp_port = port;
    }
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }
    config.validate()?;

    info!("{}", fleet_build_info::banner("fleetd", DAEMON_VERSION));
    info!(
        registry = %config.registry_path().display(),
        tasks = %config.tasks_path().display(),
        "using snapshot files"
    );

    let daemon = Daemon::start(&config).await?;
    wait_for_shutdown_signal().await;
    daemon.shutdown().await
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                if signal::ctrl_c().await.is_ok() {
                    info!("Received Ctrl+C; shutting down daemon");
                }
                return;
            }
        };
        tokio::select! {
            _ = signal::ctrl_c() => info!("Received Ctrl+C; shutting down daemon"),
            _ = sigterm.recv() => info!("Received SIGTERM; shutting down daemon"),
        }
    }

    #[cfg(not(unix))]
    {
        if signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C; shutting down daemon");
        }
    }
}
