//! Shroud relay server binary.
//!
//! # Usage
//!
//! ```bash
//! # Start with self-signed certificate and in-memory storage (development)
//! shroud-server --bind 0.0.0.0:4433
//!
//! # Start with TLS and durable storage (production)
//! shroud-server --bind 0.0.0.0:4433 --cert cert.pem --key key.pem \
//!     --storage /var/lib/shroud/events.redb
//! ```

use std::path::PathBuf;

use clap::Parser;
use shroud_core::{MemoryStore, RedbStore, RotationConfig};
use shroud_server::{DriverConfig, Server, ServerRuntimeConfig};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Shroud event relay server
#[derive(Parser, Debug)]
#[command(name = "shroud-server")]
#[command(about = "Zero-knowledge encrypted event relay")]
#[command(version)]
struct Args {
    /// Address to bind to
    #[arg(short, long, default_value = "0.0.0.0:4433")]
    bind: String,

    /// Path to TLS certificate (PEM format)
    #[arg(short, long)]
    cert: Option<String>,

    /// Path to TLS private key (PEM format)
    #[arg(short, long)]
    key: Option<String>,

    /// Path to the event database. Omit for in-memory storage, where queued
    /// events do not survive restarts.
    #[arg(short, long)]
    storage: Option<PathBuf>,

    /// Maximum concurrent connections
    #[arg(long, default_value = "10000")]
    max_connections: usize,

    /// Days undelivered events are retained before expiry
    #[arg(long, default_value = "14")]
    retention_days: u64,

    /// Seconds a rotation waits for key-update ACKs before committing
    /// without the stragglers
    #[arg(long, default_value = "30")]
    ack_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("Shroud relay starting");
    tracing::info!("Binding to {}", args.bind);

    if args.cert.is_none() || args.key.is_none() {
        tracing::warn!("No TLS certificate provided - using self-signed certificate");
        tracing::warn!("This is NOT suitable for production use!");
    }

    let driver = DriverConfig {
        max_connections: args.max_connections,
        retention_millis: args.retention_days * 24 * 60 * 60 * 1000,
        rotation: RotationConfig { ack_timeout_millis: args.ack_timeout_secs * 1000 },
        ..Default::default()
    };

    let config = ServerRuntimeConfig {
        bind_address: args.bind,
        cert_path: args.cert,
        key_path: args.key,
        driver,
    };

    match args.storage {
        Some(path) => {
            tracing::info!("Durable storage at {}", path.display());
            let store = RedbStore::open(&path)?;
            let server = Server::bind(config, store)?;
            tracing::info!("Server listening on {}", server.local_addr()?);
            server.run().await?;
        },
        None => {
            tracing::warn!("In-memory storage - queued events will not survive restart");
            let server = Server::bind(config, MemoryStore::new())?;
            tracing::info!("Server listening on {}", server.local_addr()?);
            server.run().await?;
        },
    }

    Ok(())
}
