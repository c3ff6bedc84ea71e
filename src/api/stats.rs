//! Cost statistics endpoint.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;

use crate::state::ProxyState;

#[derive(Debug, Deserialize)]
pub struct StatsParams {
    /// Look-back window in days (default 30).
    days: Option<i64>,
}

/// `GET /stats?days=N` - aggregate cost/savings over the routing log.
pub async fn stats(
    State(state): State<Arc<ProxyState>>,
    Query(params): Query<StatsParams>,
) -> impl IntoResponse {
    let days = params.days.unwrap_or(30).max(1);
    let since = chrono::Utc::now() - chrono::Duration::days(days);
    let entries = state.routing_log.read_since(since);
    Json(crate::stats::aggregate(&entries, &state.registry, since))
}
