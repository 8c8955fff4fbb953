//! Fleet probe
//!
//! Pretends to be a device: says hello, polls the daemon a few times and
//! prints (and acknowledges) every command it receives.

use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use fleetd_client::{DeviceClient, DEFAULT_ADDR};
use tokio::time::sleep;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fleet-probe", version)]
#[command(about = "Poll the fleet daemon as a device")]
struct Cli {
    /// Device id to poll as
    device: String,

    /// Daemon command channel address
    #[arg(long, default_value = DEFAULT_ADDR)]
    addr: String,

    /// Number of polls
    #[arg(long, default_value_t = 1)]
    polls: u32,

    /// Seconds to wait for a reply to each poll
    #[arg(long, default_value_t = 2)]
    wait: u64,

    /// Do not acknowledge received commands
    #[arg(long)]
    no_ack: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let wait = Duration::from_secs(cli.wait);
    let mut client = DeviceClient::connect(&cli.addr, &cli.device).await?;

    let ack = client.hello(wait).await?;
    if !ack.accepted() {
        bail!("daemon rejected hello: {}", ack.reason);
    }
    info!(addr = %cli.addr, device = %cli.device, "connected");

    for round in 0..cli.polls {
        match client.poll(wait).await? {
            Some(push) => {
                println!(
                    "{}",
                    serde_json::json!({
                        "CommandUUID": push.command_uuid,
                        "type": push.content.kind,
                        "body": push.content.body,
                    })
                );
                if !cli.no_ack {
                    client.ack(&push.command_uuid).await?;
                }
            }
            None => {
                info!(round, "no pending command");
                sleep(wait).await;
            }
        }
    }
    Ok(())
}
