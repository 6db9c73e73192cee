//! Basalt - in-memory memcached-compatible cache server
//!
//! Serves the memcached ASCII protocol from a byte-bounded LRU, over a
//! blocking, single-reactor or multi-reactor network layer.

// Use jemalloc for better multi-threaded performance
#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use anyhow::Context;
use basalt::concurrency::Executor;
use basalt::config::{Config, NetworkKind};
use basalt::health::HealthServer;
use basalt::metrics::Metrics;
use basalt::{server, storage};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "In-memory memcached-compatible cache server")]
struct Args {
    /// TOML configuration file (defaults plus BASALT_* env vars when absent)
    #[arg(short, long)]
    config: Option<String>,

    /// Address to serve the memcached protocol on
    #[arg(short, long)]
    listen: Option<String>,

    /// Network layer
    #[arg(short, long, value_enum)]
    network: Option<NetworkKind>,

    /// Accept loops (mt_nonblocking)
    #[arg(long)]
    acceptors: Option<usize>,

    /// Reactor threads (mt_nonblocking)
    #[arg(short, long)]
    workers: Option<usize>,
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!("Starting Basalt");

    // Load configuration
    let mut config = if let Some(config_path) = &args.config {
        info!("Loading configuration from {}", config_path);
        Config::from_file(config_path)?
    } else {
        info!("Using default configuration (set BASALT_* env vars to customize)");
        Config::from_env()
    };
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    if let Some(network) = args.network {
        config.server.network = network;
    }
    if let Some(acceptors) = args.acceptors {
        config.server.acceptors = acceptors;
    }
    if let Some(workers) = args.workers {
        config.server.workers = workers;
    }
    config.validate()?;

    info!("Configuration: {:?}", config);

    let addr: SocketAddr = config
        .server
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid listen address {}", config.server.listen_addr))?;

    // Initialize storage
    let storage = storage::open(&config.storage).context("Failed to open storage")?;
    info!(
        max_size = config.storage.max_size,
        stripes = config.storage.stripes,
        "Storage ready"
    );

    // Initialize metrics
    let metrics = Arc::new(Metrics::new());

    // Start health server in separate thread if enabled
    let health_server = if config.metrics.enabled {
        let listener = HealthServer::bind(&config.metrics).with_context(|| {
            format!("Failed to bind health server on {}", config.metrics.listen_addr)
        })?;
        let pool = Executor::new("basalt-health", 1, 4, 64, Duration::from_secs(10));
        let health = Arc::new(HealthServer::new(Arc::clone(&metrics), pool));
        let health_clone = Arc::clone(&health);

        std::thread::Builder::new()
            .name("basalt-health".to_string())
            .spawn(move || {
                if let Err(e) = health_clone.run(listener) {
                    error!("Health server error: {}", e);
                }
            })?;

        Some(health)
    } else {
        None
    };

    // Create and start main server
    let mut server = server::build(
        config.server.network,
        &config,
        storage,
        Arc::clone(&metrics),
    );
    server.start(addr, config.server.acceptors, config.server.workers)?;

    // Mark as ready after initialization
    if let Some(ref health) = health_server {
        health.set_ready(true);
        info!("Server is ready");
    }

    // Setup signal handlers (SIGINT, SIGTERM)
    let (shutdown_tx, shutdown_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    })
    .context("Failed to install signal handler")?;

    let _ = shutdown_rx.recv();
    info!("Received shutdown signal, shutting down...");

    if let Some(ref health) = health_server {
        health.set_ready(false);
    }
    server.stop();
    server.join();
    if let Some(health) = health_server {
        health.stop();
    }

    info!("Basalt stopped");
    Ok(())
}
