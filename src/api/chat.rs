//! The two chat proxy endpoints.
//!
//! Intentionally a thin layer: all pipeline logic lives in
//! [`crate::pipeline`]. Bodies are decoded by hand (not via the `Json`
//! extractor) so malformed JSON surfaces as the typed `invalid_request`
//! error instead of axum's generic rejection.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::Response,
};
use serde_json::Value;

use crate::{error::ProxyError, ingress::IngressFormat, state::ProxyState};

fn decode(body: &Bytes) -> Result<Value, ProxyError> {
    serde_json::from_slice(body)
        .map_err(|e| ProxyError::InvalidRequest(format!("malformed JSON body: {e}")))
}

/// `POST /v1/messages` - Anthropic Messages shape.
pub async fn messages(
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    crate::pipeline::handle(state, IngressFormat::Anthropic, &headers, decode(&body)?).await
}

/// `POST /v1/chat/completions` - OpenAI ChatCompletions shape.
pub async fn chat_completions(
    State(state): State<Arc<ProxyState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProxyError> {
    crate::pipeline::handle(state, IngressFormat::OpenAI, &headers, decode(&body)?).await
}
