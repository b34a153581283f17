//! roomrpc hub - TCP relay for multi-process rooms.
//!
//! Every peer process connects with a `HubClient` and uses it as its
//! transport. The hub relays each publish to all connections subscribed to the
//! topic, the publisher included.

use anyhow::{Context, Result};
use clap::Parser;
use roomrpc_core::{HubConfig, HubServer};
use std::net::SocketAddr;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "roomrpc-hub")]
#[command(about = "Relay server for roomrpc topics")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = HubConfig::DEFAULT_HOST)]
    host: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --debug when set.
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting roomrpc hub");

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", args.host, args.port))?;

    let mut handle = HubServer::start(addr).await?;

    // Launchers read the chosen port from stdout.
    println!("HUB_PORT={}", handle.port);

    info!("Hub running on {}", handle.addr());

    tokio::signal::ctrl_c().await?;
    info!(
        "Shutdown signal received, closing {} connections",
        handle.connection_count()
    );
    handle.shutdown();

    Ok(())
}
