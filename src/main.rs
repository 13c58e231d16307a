use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::config::{LogFormat, LoggingConfig, StoreBackend, TurnstileConfig};
use turnstile::http::{ClientIpResolver, HttpServer, RateLimitState};
use turnstile::ratelimit::{RateLimiter, WindowStore};
use turnstile::store::{MemoryStore, RedisStore};

/// Command line arguments.
#[derive(Parser, Debug)]
#[command(name = "turnstile", version, about = "Fixed-window HTTP rate limiting service")]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the HTTP listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = TurnstileConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.http_addr = listen;
    }

    init_tracing(&config.logging);

    info!("Starting Turnstile Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        http_addr = %config.server.http_addr,
        backend = ?config.store.backend,
        window_ms = config.rate_limiting.window_ms,
        max_requests = config.rate_limiting.max_requests,
        consistency = ?config.rate_limiting.consistency,
        "Configuration loaded"
    );

    // The store is opened once here and shared by every request
    let (store, sweeper) = match config.store.backend {
        StoreBackend::Memory => {
            let store = Arc::new(MemoryStore::new());
            let every = Duration::from_secs(config.store.sweep_interval_secs.max(1));
            let sweeper = store.spawn_sweeper(every);
            (store as Arc<dyn WindowStore>, Some(sweeper))
        }
        StoreBackend::Redis => {
            let timeout = Duration::from_millis(config.store.operation_timeout_ms);
            let store = RedisStore::connect(&config.store.redis_url, timeout).await?;
            store.ping().await?;
            (Arc::new(store) as Arc<dyn WindowStore>, None)
        }
    };
    info!("Window store initialized");

    let rate_limiter = Arc::new(RateLimiter::new(store, config.rate_limiting.clone())?);
    info!("Rate limiter initialized");

    let state = RateLimitState::new(
        rate_limiter,
        Arc::new(ClientIpResolver::new(config.middleware.trust_forwarded_for)),
        config.middleware.on_store_error,
    );

    let http_server = HttpServer::new(config.server.http_addr, state);

    info!("Starting HTTP server on {}", config.server.http_addr);

    // Run the server with graceful shutdown on Ctrl+C
    http_server.serve_with_shutdown(shutdown_signal()).await?;

    // Dropping the server released the last handles on the store
    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    info!("Window store released");

    info!("Turnstile Rate Limiting Service stopped");
    Ok(())
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
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
