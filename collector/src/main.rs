use std::sync::Arc;

use anyhow::Context;
use axum::{http::StatusCode, routing::get, Router};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use biq_collector::alert::DebounceTracker;
use biq_collector::config::{Config, StorageBackend};
use biq_collector::metrics;
use biq_collector::notify::LogNotifier;
use biq_collector::rest;
use biq_collector::server;
use biq_collector::session::SessionContext;
use biq_collector::store::{make_pool, MemoryStore, PgStore, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env().context("invalid configuration")?;

    info!("Starting biq collector");
    info!("Device listener: {}", config.listen_addr);
    info!("HTTP server: {}", config.http_addr);
    info!("Alert policy: {:?}", config.alert_policy);

    // Initialize metrics
    metrics::init_metrics().context("failed to register metrics")?;

    let store: Arc<dyn Store> = match config.storage_backend {
        StorageBackend::Postgres => {
            info!("Database: {}", config.database_host());
            let pool = make_pool(&config.database_url)
                .await
                .context("failed to connect to database")?;
            Arc::new(PgStore::new(pool))
        }
        StorageBackend::Memory => {
            info!("Using in-memory storage; observations are not kept across restarts");
            Arc::new(MemoryStore::new())
        }
    };

    if config.notifications.is_none() {
        info!("No notification config; alerts are only logged");
    }
    let ctx = SessionContext::new(
        store.clone(),
        Arc::new(LogNotifier::new(config.notifications.clone())),
        Arc::new(DebounceTracker::new()),
        config.alert_policy,
        config.session,
    );

    let device_listener = server::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    let device_handle = tokio::spawn(server::serve(device_listener, ctx));

    // Build HTTP app with REST API and metrics endpoint
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .merge(rest::create_router(store));

    let http_listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.http_addr))?;
    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        axum::serve(http_listener, app).await.unwrap_or_else(|e| {
            error!("HTTP server error: {}", e);
        });
    });

    tokio::select! {
        result = device_handle => {
            error!("Device listener terminated: {:?}", result);
        }
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
    Ok(())
}

async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    metrics::gather_metrics().map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })
}
