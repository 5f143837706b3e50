use std::net::SocketAddr;

use anyhow::{Context, Result};
use gateway_core::config::GatewayConfig;
use gateway_core::server::{build_router, spawn_sweeper, AppState};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,gateway_core=debug")),
        )
        .init();

    let config = GatewayConfig::from_env();
    let addr: SocketAddr = config
        .listen_addr()
        .parse()
        .with_context(|| format!("invalid MCP_HOST/MCP_PORT combination: {}", config.listen_addr()))?;

    let state = AppState::new(config);
    tokio::spawn(spawn_sweeper(state.clone()));

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!(target = "server", %addr, "enable-mcp-gateway listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server exited with an error")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(target = "server", error = %err, "failed to listen for ctrl_c");
    }
}
