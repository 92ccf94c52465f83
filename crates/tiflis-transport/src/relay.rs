//! Relay server: shared state, HTTP router, heartbeat sweeper.

use std::{
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use axum::{Router, routing::get};
use serde_json::{Value, json};
use tokio::{net::TcpListener, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    config::RelayConfig,
    health::{HealthSource, health_router},
    registry::{Registry, TunnelIdGenerator},
    websocket::ws_handler,
};

/// State shared by every relay handler.
pub struct RelayState {
    registry: Mutex<Registry>,
    ready: AtomicBool,
    sweep_interval: Duration,
}

impl RelayState {
    #[must_use]
    pub fn new(config: &RelayConfig, ids: impl TunnelIdGenerator + 'static) -> Arc<Self> {
        Arc::new(Self {
            registry: Mutex::new(Registry::new(config.registry_config(), ids)),
            ready: AtomicBool::new(true),
            sweep_interval: (config.heartbeat_interval() / 2).max(Duration::from_millis(10)),
        })
    }

    /// Lock the registry. Never hold the guard across an await.
    pub fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }
}

impl HealthSource for RelayState {
    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn details(&self) -> Value {
        json!({ "connections": self.registry().stats() })
    }
}

/// Relay routes: `/ws` plus the health surface.
pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(Arc::clone(&state))
        .merge(health_router(state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Periodically close silent connections and expire offline tunnels.
pub fn spawn_sweeper(state: Arc<RelayState>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(state.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let report = state.registry().sweep();
                    if !report.timed_out.is_empty() || !report.expired_tunnels.is_empty() {
                        tracing::debug!(
                            timed_out = report.timed_out.len(),
                            expired = report.expired_tunnels.len(),
                            "Sweep finished"
                        );
                    }
                }
            }
        }
    })
}

/// Serve the relay until `shutdown` fires.
///
/// On shutdown the relay reports not-ready, closes every socket and stops
/// accepting connections.
///
/// # Errors
/// Returns error if the server fails.
pub async fn serve(
    listener: TcpListener,
    state: Arc<RelayState>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let sweeper = spawn_sweeper(Arc::clone(&state), shutdown.clone());
    let app = router(Arc::clone(&state));

    tracing::info!("Relay listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            state.set_ready(false);
            state.registry().close_all();
            tracing::info!("Relay draining");
        })
        .await?;

    sweeper.abort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SequentialTunnelIds;
    use axum::{body::Body, http::Request, http::StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_health_reports_connection_counts() {
        let state = RelayState::new(&RelayConfig::local("k".repeat(32)), SequentialTunnelIds::default());
        let response = router(Arc::clone(&state))
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["connections"]["workstations"], 0);
        assert_eq!(json["connections"]["clients"], 0);
    }

    #[tokio::test]
    async fn test_readyz_while_draining() {
        let state = RelayState::new(&RelayConfig::local("k".repeat(32)), SequentialTunnelIds::default());
        state.set_ready(false);
        let response = router(state)
            .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
