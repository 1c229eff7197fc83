//! Detection review service (eht-detect) - Main entry point
//!
//! Serves session-scoped review of volumetric image stacks: load a dataset,
//! page through rendered layers, classify them and edit mask layers.

use std::fs::OpenOptions;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use eht_common::config::{LoggingConfig, RootFolderInitializer};
use eht_common::db::init_database;
use eht_detect::cache::SessionCache;
use eht_detect::config::{Args, Config};
use eht_detect::engine::{ReviewEngine, ReviewOptions};
use eht_detect::{build_router, AppState};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Stderr logging plus an optional plain-text log file
fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let file_layer = match &logging.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("eht_detect={},eht_common={},tower_http=info", logging.level, logging.level)
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(&args).context("Failed to load configuration")?;

    init_tracing(&config.logging)?;

    info!("Starting eht-detect {}", env!("CARGO_PKG_VERSION"));
    info!("Root folder: {}", config.root_folder.display());

    RootFolderInitializer::new(config.root_folder.clone())
        .ensure_directory_exists()
        .context("Failed to create root folder")?;

    let pool = init_database(&config.database_path)
        .await
        .context("Failed to initialize database")?;
    info!("Database: {}", config.database_path.display());

    let engine = ReviewEngine::new(
        pool,
        Arc::new(SessionCache::new()),
        ReviewOptions::from_config(&config),
    );
    let app = build_router(AppState::new(engine));

    let addr = config.listen_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install terminate handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
