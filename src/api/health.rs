//! Liveness probe endpoint.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

use crate::state::ProxyState;

/// `GET /health` - liveness plus the active routing mode.
///
/// No upstream dependencies and never blocks, so it is safe as a Docker /
/// Kubernetes liveness probe.
pub async fn health(State(state): State<Arc<ProxyState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "mode": state.config.mode.to_string(),
            "uptime_seconds": state.started_at.elapsed().as_secs(),
        })),
    )
}
