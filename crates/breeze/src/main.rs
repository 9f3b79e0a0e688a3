//! Breeze Hub
//!
//! Vent hub bridging the control application to wireless vents. Runs
//! against the simulated radio until a hardware transport is plugged in.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use breeze::transport::sim::SimTransport;
use breeze::{Gateway, GatewayConfig};

/// Breeze Vent Hub
#[derive(Parser, Debug)]
#[command(name = "breeze-hub")]
#[command(about = "Breeze Vent Hub", long_about = None)]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the UDP listen address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    let mut config = GatewayConfig::load(args.config.as_deref()).context("Failed to load config")?;
    if let Some(listen) = args.listen {
        config.network.listen_addr = listen;
    }

    if args.print_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    info!("Starting Breeze hub v{}", env!("CARGO_PKG_VERSION"));

    let transport = Arc::new(SimTransport::auto_create(config.simulation.clone()));
    let hub = Gateway::start(config, transport)
        .await
        .context("Failed to start hub")?;

    for status in hub.services().list() {
        info!(service = status.id, name = status.name, state = %status.state, "Service registered");
    }

    shutdown_signal().await;

    let vents = hub.gateway().vents();
    match serde_json::to_string(&vents) {
        Ok(json) => info!(count = vents.len(), vents = %json, "Final vent status"),
        Err(e) => warn!(error = %e, "Failed to serialize vent status"),
    }

    hub.shutdown().await;
    info!("Hub shutdown complete");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("breeze=info,breeze_runtime=info"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        },
    }
}
