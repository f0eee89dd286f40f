//! Fan-out relay
//!
//! Replicates inbound traffic on one port to every server in a target list.
//!
//! This binary:
//! - Reads the target list once at startup
//! - Dials every target before accepting clients (TCP)
//! - Forwards each chunk or datagram to every reachable target
//! - Re-dials failed targets in the background (TCP)
//! - Shuts down within a grace period on SIGINT or SIGTERM

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use fanout_relay::config::{Config, Transport};
use fanout_relay::{logging, shutdown_signal, Relay, UdpRelay};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let config = Config::parse();

    logging::init(config.debug, config.log_json).context("Failed to initialize logging")?;

    info!(
        port = config.port,
        config = %config.config.display(),
        transport = ?config.transport,
        "Starting fan-out relay"
    );

    let targets = config.load_targets()?;
    if targets.is_empty() {
        warn!("Target list is empty, inbound data will be dropped");
    }
    info!(target_count = targets.len(), "Configuration loaded");

    match config.transport {
        Transport::Tcp => {
            let relay = Relay::bind(config.relay_config(targets)).await?;
            relay.run(shutdown_signal()).await?;
        }
        Transport::Udp => {
            let relay = UdpRelay::bind(config.bind_addr(), targets).await?;
            relay.serve(shutdown_signal(), config.grace_period()).await?;
        }
    }

    info!("Relay shutdown complete");
    Ok(())
}
