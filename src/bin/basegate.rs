//! Basegate binary
//!
//! Runs both listeners over an in-memory store, optionally seeded with
//! bases, clients and subscriptions from a JSON file.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use basegate::server::{Gateway, GatewayConfig};
use basegate::store::{MemoryStore, Seed};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Relay gateway between field devices and application clients.
#[derive(Parser)]
#[command(name = "basegate")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the Base listener address
    #[arg(long)]
    base_addr: Option<SocketAddr>,

    /// Override the Client listener address
    #[arg(long)]
    client_addr: Option<SocketAddr>,

    /// Log filter when RUST_LOG is unset (e.g. "info", "basegate=debug")
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// JSON file with bases, clients and subscriptions for the in-memory store
    #[arg(short, long)]
    seed: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match &cli.config {
        Some(path) => GatewayConfig::from_path(path)?,
        None => GatewayConfig::default(),
    };
    if let Some(addr) = cli.base_addr {
        config.base.bind_addr = addr;
    }
    if let Some(addr) = cli.client_addr {
        config.client.bind_addr = addr;
    }

    let store = match &cli.seed {
        Some(path) => {
            let seed = Seed::from_path(path)?;
            info!(
                bases = seed.bases.len(),
                clients = seed.clients.len(),
                subscriptions = seed.subscriptions.len(),
                "seeded store"
            );
            seed.into_store()
        }
        None => {
            warn!("no seed file; every login will be rejected");
            MemoryStore::new()
        }
    };

    let gateway = Gateway::bind(config, Arc::new(store)).await?;
    let shutdown = gateway.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            shutdown.shutdown();
        }
    });

    gateway.run().await?;
    Ok(())
}
