//! jobhub backend server
//!
//! Entry point with configuration loading, database migrations, worker
//! startup and HTTP server.

use std::sync::Arc;

use anyhow::Context;
use jobhub_db::JobStore;
use jobhub_engine::JobEngine;
use tokio::net::TcpListener;

use jobhub_backend::state::AppState;

mod cli;
mod config_helpers;
mod tracing_setup;

use cli::CliArgs;
use config_helpers::{
    database_config_from_config, engine_config_from_config, parse_bind_address, queue_from_config,
};
use tracing_setup::install_tracing_from_config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    eprintln!("[STARTUP] jobhub backend starting...");
    let args = CliArgs::parse();

    if args.help_requested {
        CliArgs::print_help();
        return Ok(());
    }

    // Resolve config path: CLI > environment variable
    let config_path = args
        .config_path
        .or_else(|| std::env::var("JOBHUB_CONFIG_PATH").ok());

    eprintln!("[STARTUP] Loading config from: {:?}", config_path);
    let config = load_config(&config_path)?;
    jobhub_config::validate_config(&config).context("invalid configuration")?;
    eprintln!("[STARTUP] Config loaded successfully");

    if let Err(e) = install_tracing_from_config(&config.logging) {
        eprintln!("[STARTUP] {e}");
    }

    // Create and migrate database
    let db_cfg = database_config_from_config(&config);
    let db_pool = jobhub_db::create_pool(&db_cfg)
        .await
        .context("failed to create database pool")?;
    run_migrations(&db_pool).await?;
    tracing::info!(
        db_max_connections = db_cfg.max_connections,
        worker_backend = %config.worker.backend,
        worker_concurrency = config.worker.concurrency,
        "database and worker configuration"
    );

    // Register job types and start the workers
    let store = JobStore::new(db_pool);
    let queue = queue_from_config(&config, &store);
    let engine = Arc::new(
        JobEngine::new(store, queue).with_config(engine_config_from_config(&config)),
    );
    jobhub_jobs::register_all(&engine).context("failed to register job types")?;
    engine.activate().await.context("failed to start workers")?;
    let job_types: Vec<String> = engine.job_types().into_iter().map(|t| t.name).collect();
    tracing::info!(?job_types, "workers listening");

    let app = jobhub_backend::build_router(Arc::new(AppState::new(Arc::clone(&engine))));

    let addr = parse_bind_address(&config.server.host, config.server.port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    eprintln!("[STARTUP] Server listening on {addr}");
    tracing::info!(%addr, "server listening");

    let served = axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await;

    tracing::info!("stopping workers");
    engine.shutdown().await;
    served?;
    Ok(())
}

/// Load configuration from file or defaults.
fn load_config(path: &Option<String>) -> anyhow::Result<jobhub_config::Config> {
    match path.as_deref() {
        Some(p) => jobhub_config::load_config(Some(p)).map_err(|e| {
            eprintln!("failed to load configuration: {e}");
            anyhow::anyhow!(e.to_string())
        }),
        None => jobhub_config::load_config::<&std::path::Path>(None).map_err(|e| {
            eprintln!("failed to load configuration: {e}");
            anyhow::anyhow!(e.to_string())
        }),
    }
}

async fn run_migrations(db_pool: &jobhub_db::DbPool) -> anyhow::Result<()> {
    tracing::info!("applying SQLite migrations");
    match jobhub_migrations::sqlite_migrator().run(db_pool).await {
        Ok(_) => {
            tracing::info!("database migrations applied successfully");
            Ok(())
        }
        Err(e) => {
            tracing::error!(%e, "failed to apply database migrations");
            Err(anyhow::anyhow!("failed to apply database migrations: {e}"))
        }
    }
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
