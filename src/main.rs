//! KPI federation service

use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kpi_federation::config::{Config, LogFormat};
use kpi_federation::db::Database;
use kpi_federation::executor::{ExecutorRegistry, MemoryExecutor};
use kpi_federation::routes::build_router;
use kpi_federation::state::AppState;

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "kpi_federation=info,tower_http=info".into());

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() {
    // Configuration
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    init_tracing(config.log_format);

    // Connect to database (optional)
    let db = match &config.database_url {
        Some(url) => {
            let db = match Database::new(url).await {
                Ok(db) => db,
                Err(e) => {
                    error!(error = %e, "Failed to connect to database");
                    std::process::exit(1);
                }
            };
            if let Err(e) = db.ensure_schema().await {
                error!(error = %e, "Failed to prepare database schema");
                std::process::exit(1);
            }
            info!("Database: {}", url.split('@').last().unwrap_or("***"));
            Some(db)
        }
        None => {
            warn!("DATABASE_URL not set, property mappings and derived metrics are kept in memory");
            None
        }
    };

    // Category executors
    let executors = ExecutorRegistry::new()
        .with(Arc::new(MemoryExecutor::events()))
        .with(Arc::new(MemoryExecutor::profiles()))
        .with(Arc::new(MemoryExecutor::channels()));

    // Create application state
    let state = AppState::new(&config, db, executors);
    let app = build_router(state);

    info!(
        "KPI federation v{} starting on {}",
        env!("CARGO_PKG_VERSION"),
        config.listen_addr
    );
    info!("Query concurrency: {}", config.query_concurrency);
    if let Some(timeout) = config.query_timeout {
        info!("Query group deadline: {}s", timeout.as_secs());
    }

    // Start server
    let listener = match tokio::net::TcpListener::bind(config.listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, addr = %config.listen_addr, "Failed to bind listener");
            std::process::exit(1);
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        error!(error = %e, "Server error");
        std::process::exit(1);
    }
}
