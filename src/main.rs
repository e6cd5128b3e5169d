mod cache;
mod config;
mod git;
mod health;
mod http;
mod metrics;
mod store;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::cache::{CacheLimits, MirrorCache, MirrorLayout};
use crate::config::{Config, LogConfig, LogFormat};
use crate::git::GitCli;
use crate::metrics::MetricsRegistry;
use crate::store::MetadataStore;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "mirrorcache", about = "On-demand Git mirror cache")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/mirrorcache/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub cache: MirrorCache,
    pub layout: MirrorLayout,
    pub metrics: MetricsRegistry,
}

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

fn init_tracing(log: &LogConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));
    let registry = tracing_subscriber::registry().with(filter);

    match log.format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

// ---------------------------------------------------------------------------
// HTTP server
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState) -> Result<()> {
    let app = http::handler::create_router(Arc::new(state.clone()));

    let listen_addr: std::net::SocketAddr = state
        .config
        .server
        .listen
        .parse()
        .context("invalid server.listen address")?;

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;
    let config = Arc::new(config);

    // ---- Tracing ----
    init_tracing(&config.log);

    tracing::info!(config_path = %cli.config, "starting mirrorcache");

    // ---- Ensure mirror directory exists ----
    tokio::fs::create_dir_all(&config.storage.base_dir)
        .await
        .with_context(|| {
            format!(
                "failed to create mirror dir: {}",
                config.storage.base_dir.display()
            )
        })?;

    // ---- Metadata store ----
    let database_path = config.storage.database_path.clone();
    let store = tokio::task::spawn_blocking(move || MetadataStore::open(database_path))
        .await
        .context("metadata store open task failed")?
        .context("failed to open metadata store")?;
    tracing::info!(path = %store.path().display(), "metadata store opened");

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    // ---- Mirror cache ----
    let git = Arc::new(GitCli);
    let cache = MirrorCache::new(
        store.clone(),
        git.clone(),
        git,
        CacheLimits {
            probe_timeout: config.cache.probe_timeout(),
            clone_timeout: config.cache.clone_timeout(),
            max_concurrent_clones: config.cache.max_concurrent_clones,
        },
        Arc::clone(&metrics.metrics),
    );

    // ---- App state ----
    let state = AppState {
        config: Arc::clone(&config),
        cache,
        layout: MirrorLayout::new(&config.storage.base_dir),
        metrics,
    };

    let served = run_http_server(state).await;

    // Handlers are gone once the server returns; release the database.
    store.close();

    served?;
    tracing::info!("mirrorcache shut down cleanly");
    Ok(())
}
