mod bus;
mod execution;
mod executor;
mod handlers;
mod routes;
mod store;
mod validator;
mod ws;


use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use redis::aio::ConnectionManager;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crucible_common::config::Settings;

use crate::bus::{MemoryBus, MessageBus, RedisBus};
use crate::store::{JobStore, MemoryJobStore, RedisJobStore};

pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub bus: Arc<dyn MessageBus>,
    pub settings: Arc<Settings>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Crucible server booting...");

    let settings = Arc::new(Settings::from_env());

    // `memory` keeps everything in-process for local development; anything
    // else is the production Redis path.
    let backend = std::env::var("CRUCIBLE_BACKEND").unwrap_or_default();
    let (store, bus): (Arc<dyn JobStore>, Arc<dyn MessageBus>) = if backend == "memory" {
        warn!("Using in-memory store and bus; state dies with the process");
        (
            Arc::new(MemoryJobStore::new(&settings)),
            Arc::new(MemoryBus::new()),
        )
    } else {
        let client = redis::Client::open(settings.redis_url.as_str())
            .context("Failed to create Redis client")?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .context("Failed to connect to Redis")?;
        info!("Connected to Redis: {}", settings.redis_url);
        (
            Arc::new(RedisJobStore::new(manager.clone(), &settings)),
            Arc::new(RedisBus::new(manager, client)),
        )
    };

    let state = Arc::new(AppState {
        store,
        bus,
        settings: settings.clone(),
    });

    let app = Router::new().merge(routes::routes()).with_state(state);

    let listener = TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", settings.bind_addr))?;

    info!("HTTP server listening on {}", settings.bind_addr);
    info!("Ready to accept jobs");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        warn!("Received SIGTERM/CTRL+C - shutting down");
    }
}
