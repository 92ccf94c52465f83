//! Tiflis relay server.
//!
//! Run with: cargo run -p tiflis-relay -- --api-key <32+ chars>
//!
//! Workstations register and clients connect on `ws://<host>:<port>/ws`.

use anyhow::Context;
use clap::Parser;
use tiflis_transport::{RandomTunnelIds, RelayConfig, RelayState, serve};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = RelayConfig::parse();
    config.validate().context("invalid relay configuration")?;

    let state = RelayState::new(&config, RandomTunnelIds);
    let addr = config.listen_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {e}");
            return;
        }
        tracing::info!("Shutdown requested");
        signal.cancel();
    });

    serve(listener, state, shutdown).await?;
    tracing::info!("Relay stopped");
    Ok(())
}
