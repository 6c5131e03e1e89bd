mod config;
mod db;
mod error;
mod models;
mod routes;
mod services;
mod state;
mod ws;

use crate::config::AppConfig;
use crate::db::connection::create_pool;
use crate::db::migrate::migrate;
use crate::services::components::ProcessComponents;
use crate::services::options_store::SqliteOptionsStore;
use crate::services::retention::RetentionScheduler;
use crate::state::AppState;
use backup_core::location::{StaticMounts, StatvfsDiskSpace};
use backup_core::{BackupManager, Collaborators};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "backup-supervisor")]
#[command(about = "Backup and restore service for a supervised home-automation host")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/backup-supervisor/config.toml")]
    config: PathBuf,

    /// Override the HTTP API port
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = if args.config.exists() {
        AppConfig::from_file(&args.config)?
    } else {
        AppConfig::default()
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(level) = args.log_level {
        config.log.level = level;
    }

    backup_core::utils::logger::init(&config.log.level)?;
    if !args.config.exists() {
        tracing::warn!("Config file {} not found, using defaults", args.config.display());
    }
    tracing::info!("Starting backup supervisor v{}", env!("CARGO_PKG_VERSION"));

    // Initialize database
    let pool = create_pool(&config.database.path)?;
    migrate(&pool)?;

    let shutdown = CancellationToken::new();

    // Command link to the supervised application
    let (link, client) = ws::application::link(&config.application, shutdown.clone());
    tokio::spawn(client.run());

    let manager = Arc::new(BackupManager::new(
        config.core.clone(),
        Collaborators {
            components: Arc::new(ProcessComponents::new(config.components.clone())),
            quiesce: Arc::new(link),
            mounts: Arc::new(StaticMounts::new(config.mounts.clone())),
            disk: Arc::new(StatvfsDiskSpace),
            options: Arc::new(SqliteOptionsStore::new(pool.clone())),
        },
    ));
    let count = manager.load().await?;
    tracing::info!("Found {} backups", count);

    // Initialize retention scheduler
    let scheduler = if config.retention.enabled {
        match start_retention(manager.clone(), &config.retention.cron).await {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::warn!("Failed to start retention scheduler: {:#}", e);
                None
            }
        }
    } else {
        None
    };

    let state = Arc::new(AppState::new(manager.clone(), shutdown.clone()));
    let app = routes::create_router(state);

    // Start HTTP server
    let addr = format!("0.0.0.0:{}", config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    // Cleanup
    tracing::info!("Shutting down...");
    shutdown.cancel();

    if let Some(s) = scheduler {
        if let Err(e) = s.shutdown().await {
            tracing::warn!("Scheduler shutdown error: {}", e);
        }
    }

    for warning in manager.thaw().await {
        tracing::warn!("{}", warning);
    }
    tracing::info!("Supervisor stopped");

    Ok(())
}

async fn start_retention(manager: Arc<BackupManager>, cron: &str) -> anyhow::Result<RetentionScheduler> {
    let scheduler = RetentionScheduler::new(manager).await?;
    scheduler.schedule(cron).await?;
    scheduler.start().await?;
    Ok(scheduler)
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl+c: {}", e);
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
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
        _ = cancel.cancelled() => {}
    }

    cancel.cancel();
}
