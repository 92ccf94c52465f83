//! HTTP health surface: `/health`, `/healthz`, `/readyz`.

use std::{sync::Arc, time::Instant};

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use serde_json::{Value, json};

/// Something whose health can be reported.
pub trait HealthSource: Send + Sync + 'static {
    /// Whether the component can serve traffic.
    fn is_ready(&self) -> bool;

    /// Extra top-level fields for `/health`.
    fn details(&self) -> Value {
        Value::Null
    }
}

struct HealthState<H> {
    source: Arc<H>,
    started_at: Instant,
}

impl<H> Clone for HealthState<H> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            started_at: self.started_at,
        }
    }
}

/// Health routes for `source`. Uptime counts from this call.
pub fn health_router<H: HealthSource>(source: Arc<H>) -> Router {
    Router::new()
        .route("/health", get(health::<H>))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz::<H>))
        .with_state(HealthState {
            source,
            started_at: Instant::now(),
        })
}

async fn health<H: HealthSource>(State(state): State<HealthState<H>>) -> Json<Value> {
    let ready = state.source.is_ready();
    let mut report = json!({
        "status": if ready { "ok" } else { "unavailable" },
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    });
    if let (Value::Object(report), Value::Object(details)) = (&mut report, state.source.details()) {
        report.extend(details);
    }
    Json(report)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz<H: HealthSource>(State(state): State<HealthState<H>>) -> (StatusCode, &'static str) {
    if state.source.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tower::ServiceExt;

    struct Flag(AtomicBool);

    impl HealthSource for Flag {
        fn is_ready(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    async fn get_status(app: Router, uri: &str) -> StatusCode {
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    #[tokio::test]
    async fn test_liveness_ignores_readiness() {
        let flag = Arc::new(Flag(AtomicBool::new(false)));
        let app = health_router(Arc::clone(&flag));
        assert_eq!(get_status(app.clone(), "/healthz").await, StatusCode::OK);
        assert_eq!(get_status(app.clone(), "/readyz").await, StatusCode::SERVICE_UNAVAILABLE);

        flag.0.store(true, Ordering::SeqCst);
        assert_eq!(get_status(app, "/readyz").await, StatusCode::OK);
    }
}
