//! Typed proxy error for axum request handlers.
//!
//! [`ProxyError`] enumerates every failure the request path can surface to a
//! client, mapped to an HTTP status and a stable machine-readable kind.
//! Handlers return `Result<T, ProxyError>` and propagate with `?`; the
//! [`IntoResponse`] impl renders the `{"error":{"type","message"}}` body so
//! no handler builds error JSON by hand.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::catalog::Provider;

/// Everything that can go wrong between accepting a request and writing the
/// first response byte.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Malformed JSON, missing messages, unknown force-model alias,
    /// unsupported message role.
    #[error("{0}")]
    InvalidRequest(String),

    /// No model in any preference list or the global fallback is both
    /// configured and not rate-limited.
    #[error("no configured model is currently available")]
    NoAvailableModel,

    /// Every available option failed with 429; the last upstream body is kept.
    #[error("upstream rate limited: {body}")]
    UpstreamRateLimited { provider: Provider, body: String },

    /// Every available key failed with 401.
    #[error("upstream authentication failed: {body}")]
    UpstreamAuthFailed { provider: Provider, body: String },

    /// Upstream returned non-2xx and retries were exhausted.
    #[error("upstream {provider} returned HTTP {status}: {body}")]
    Upstream {
        provider: Provider,
        status: u16,
        body: String,
    },

    /// Stream interrupted before the first byte or corrupted event grammar.
    #[error("upstream stream failed: {0}")]
    UpstreamStream(String),

    /// Unexpected fault; detail goes to the server log, not the client.
    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl ProxyError {
    /// Stable kind string used in the error body and in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::NoAvailableModel => "no_available_model",
            Self::UpstreamRateLimited { .. } => "upstream_rate_limited",
            Self::UpstreamAuthFailed { .. } => "upstream_auth_failed",
            Self::Upstream { .. } => "upstream_error",
            Self::UpstreamStream(_) => "upstream_stream_error",
            Self::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::NoAvailableModel => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamRateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamAuthFailed { .. } => StatusCode::UNAUTHORIZED,
            Self::Upstream { .. } | Self::UpstreamStream(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        if let Self::Internal(ref e) = self {
            tracing::error!(error = %e, "internal handler error");
        } else {
            tracing::warn!(kind = self.kind(), error = %self, "request failed");
        }
        let message = match &self {
            // Never leak internal detail to the client.
            Self::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        };
        (
            self.status(),
            Json(json!({ "error": { "type": self.kind(), "message": message } })),
        )
            .into_response()
    }
}
