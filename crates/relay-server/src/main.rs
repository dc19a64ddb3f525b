//! Chat relay gateway.
//!
//! Run with: cargo run -p relay-server
//!
//! Reads `RELAY_CONFIG`, `./relay.json` or `~/.relay/relay.json`, then serves
//! HTTP on `server.host:server.port` with the WebSocket endpoint at `/ws`.

mod echo;
mod gateway;
mod http;

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use relay_core::{Clock, GatewayConfig, SystemClock};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::gateway::{Gateway, builtin_registry};

/// Environment variable naming an explicit config file.
const CONFIG_ENV: &str = "RELAY_CONFIG";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
    let config = GatewayConfig::load(config_path.as_deref()).context("Failed to load config")?;

    // RUST_LOG wins over the configured level
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let registry = builtin_registry(&clock)?;
    let gateway = Gateway::build(&config, &registry, clock)?;
    gateway.start_channels().await?;

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!(
        max_sessions = config.session.max_concurrent,
        throttle_ms = config.streaming.throttle_ms,
        "Server listening on http://{addr}"
    );

    axum::serve(listener, gateway.router.clone())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    gateway.shutdown().await;
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
