//! PartySync Store Server Binary
//!
//! Serves the shared party keyspace and pub/sub channels over TCP.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use partysync::config::Config;
use partysync::network::Server;
use partysync::store::MemoryStore;
use tracing_subscriber::{fmt, EnvFilter};

/// PartySync Store Server
#[derive(Parser, Debug)]
#[command(name = "partysync-store")]
#[command(about = "Shared state store for party synchronization")]
#[command(version)]
struct Args {
    /// TOML config file; flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address (host:port)
    #[arg(short, long)]
    listen: Option<String>,

    /// Maximum concurrent connections
    #[arg(short, long)]
    max_connections: Option<usize>,

    /// Idle read timeout per connection in ms (0 = none)
    #[arg(long)]
    read_timeout_ms: Option<u64>,

    /// Write timeout per connection in ms (0 = none)
    #[arg(long)]
    write_timeout_ms: Option<u64>,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,partysync=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();

    tracing::info!("PartySync Store Server v{}", partysync::VERSION);

    let mut config = match &args.config {
        Some(path) => match Config::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("Failed to load {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(max) = args.max_connections {
        config.max_connections = max;
    }
    if let Some(ms) = args.read_timeout_ms {
        config.read_timeout_ms = ms;
    }
    if let Some(ms) = args.write_timeout_ms {
        config.write_timeout_ms = ms;
    }
    if let Err(e) = config.validate() {
        tracing::error!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    tracing::info!("Listen address: {}", config.listen_addr);

    let store = Arc::new(MemoryStore::new());
    let server = match Server::bind(config, store) {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("Failed to bind: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run() {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }

    tracing::info!("Server stopped");
}
