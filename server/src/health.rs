use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::service::RelayState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    broker: &'static str,
    store: &'static str,
    version: String,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    ready: bool,
    broker: bool,
}

/// Liveness probe - the process is up.
pub async fn liveness() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}

/// Readiness probe - the relay can accept sessions.
pub async fn readiness(State(state): State<RelayState>) -> (StatusCode, Json<ReadinessResponse>) {
    let broker = state.bus.is_connected();
    let ready = broker && !state.is_draining();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(ReadinessResponse { ready, broker }))
}

/// GET /api/v1/health — broker and store reachability plus the build
/// version. The store reports `unavailable` when no TRANSCRIPT_STORE_URL is
/// configured.
pub async fn health(State(state): State<RelayState>) -> (StatusCode, Json<HealthResponse>) {
    let broker = if state.bus.is_connected() { "ok" } else { "down" };
    let store = match &state.store {
        Some(store) => {
            if store.ping().await {
                "ok"
            } else {
                "down"
            }
        }
        None => "unavailable",
    };

    let healthy = broker == "ok" && store != "down";
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            broker,
            store,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
    )
}
