//! Health check endpoint.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use messaging::ConnectionState;
use serde::Serialize;
use tokio::sync::watch;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub app_id: String,
    pub broker: &'static str,
}

/// State the health check reports on.
#[derive(Clone)]
pub struct HealthState {
    pub app_id: String,
    pub connection: watch::Receiver<ConnectionState>,
}

/// GET /health — `200` while the broker connection is up, `503` otherwise.
pub async fn check(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let connection = state.connection.borrow().clone();
    let (code, status) = if connection.is_connected() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        code,
        Json(HealthResponse {
            status,
            app_id: state.app_id,
            broker: connection.as_str(),
        }),
    )
}
