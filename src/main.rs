use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tokenwarden::config::{LogFormat, ServiceConfig, StoreBackend};
use tokenwarden::gateway::RateLimitGateway;
use tokenwarden::http::HttpServer;
use tokenwarden::ratelimit::RateLimitEngine;
use tokenwarden::store::{MemoryStore, RedisStore, SharedStore};

/// Token bucket rate limiting service.
#[derive(Debug, Parser)]
#[command(name = "tokenwarden", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// HTTP listen address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Shared store backend
    #[arg(long, value_enum)]
    store_backend: Option<StoreBackend>,

    /// Redis connection URL
    #[arg(long)]
    store_url: Option<String>,

    /// Log output format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = ServiceConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    if let Some(backend) = args.store_backend {
        config.store.backend = backend;
    }
    if let Some(url) = args.store_url {
        config.store.url = url;
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }
    config.validate()?;

    init_tracing(&config);

    info!("Starting Tokenwarden rate limiting service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    match &args.config {
        Some(path) => info!(path = %path.display(), "Configuration file loaded"),
        None => info!("No configuration file given; using defaults and environment"),
    }

    let limits = config.limit_table()?;
    info!(limit_types = ?limits.names(), "Limit table loaded");

    let store: Arc<dyn SharedStore> = match config.store.backend {
        StoreBackend::Memory => {
            let store = Arc::new(MemoryStore::new());
            store.spawn_sweeper(config.store.sweep_interval());
            info!("Using in-process store; limits are not shared between instances");
            store
        }
        StoreBackend::Redis => {
            let store = RedisStore::connect(&config.store.url, config.store.retry_policy()).await?;
            info!(url = %config.store.url, "Connected to Redis store");
            Arc::new(store)
        }
    };

    let engine = Arc::new(RateLimitEngine::new(store, limits));
    let gateway = RateLimitGateway::new(engine);

    HttpServer::new(config.server.listen_addr, gateway)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    info!("Tokenwarden rate limiting service stopped");
    Ok(())
}

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
fn init_tracing(config: &ServiceConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match config.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
