//! Courier webhook delivery service.
//!
//! Loads configuration, prepares the database, starts the delivery workers
//! and the administrative API, and shuts both down gracefully.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_api::{AppState, Config};
use courier_core::{
    storage::{schema, Storage},
    Clock, RealClock,
};
use courier_delivery::{
    seed_catalog, DeliveryEngine, DeliveryStorage, PostgresDeliveryStorage, WorkerPool,
};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config);

    info!(
        database_url = %config.database_url_masked(),
        server_addr = %config.server_addr,
        workers = config.delivery_worker_count,
        "Starting courier"
    );

    let db_pool = create_database_pool(&config).await?;
    schema::migrate(&db_pool).await.context("Failed to run database migrations")?;
    info!("Database migrations completed");

    let storage: Arc<dyn DeliveryStorage> =
        Arc::new(PostgresDeliveryStorage::new(Arc::new(Storage::new(db_pool.clone()))));
    let seeded = seed_catalog(storage.as_ref()).await.context("Failed to seed event catalog")?;
    info!(definitions = seeded, "Event catalog seeded");

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let delivery_config = config.to_delivery_config();
    let shutdown_timeout = delivery_config.shutdown_timeout;
    let engine = Arc::new(
        DeliveryEngine::new(Arc::clone(&storage), delivery_config, Arc::clone(&clock))
            .context("Failed to build delivery engine")?,
    );

    let mut workers = WorkerPool::new(Arc::clone(&engine), Arc::clone(&clock));
    workers.spawn_workers();

    let state = AppState::new(storage, engine, clock).with_workers(workers.monitor());
    let addr = config.parse_server_addr()?;
    let served = courier_api::start_server(
        state,
        addr,
        Duration::from_secs(config.request_timeout_seconds),
    )
    .await;
    if let Err(e) = &served {
        error!(error = %e, "HTTP server failed");
    }

    info!("Stopping delivery workers");
    if let Err(e) = workers.shutdown_graceful(shutdown_timeout).await {
        warn!(error = %e, "Delivery workers did not stop cleanly");
    }

    db_pool.close().await;
    info!("Courier shutdown complete");
    served.context("HTTP server failed")
}

/// Initializes tracing from `RUST_LOG` and the configured log format.
fn init_tracing(config: &Config) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("courier=info,tower_http=info"));

    let registry = tracing_subscriber::registry().with(filter);
    if config.json_logs() {
        registry.with(fmt::layer().json().with_current_span(true)).init();
    } else {
        registry.with(fmt::layer().with_target(true)).init();
    }
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    let mut retries = 0;
    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("Failed to verify database connection")?;
                info!("Database connection pool established");
                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "Database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}
