//! Anthropic Messages API adapter.
//!
//! Speaks [`/v1/messages`](https://docs.anthropic.com/en/api/messages) with
//! per-request credentials - the dual-key failover logic in the dispatcher
//! decides which key each attempt uses, so unlike the other adapters no key
//! is baked into the client at construction time.
//!
//! Two request-body paths:
//!
//! - **Passthrough**: when the client spoke Messages-style, the retained raw
//!   body is forwarded with only `model` and `stream` overridden, so `tools`,
//!   `tool_choice`, `thinking`, `metadata` and tool-content blocks round-trip
//!   byte-exact.
//! - **Synthesized**: ChatCompletions-style ingress builds a minimal Messages
//!   body from the neutral request.

use std::time::Duration;

use futures_util::StreamExt as _;
use reqwest::{header, Client};
use serde_json::{json, Value};

use super::{excerpt, SseStream, UpstreamError, UPSTREAM_TIMEOUT_MS};
use crate::{
    config::AuthType,
    ingress::ParsedRequest,
};

/// Default `anthropic-version` header when the client did not send one.
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicClient {
    /// Buffered requests - bounded by the upstream timeout.
    client: Client,
    /// Streaming requests - no request-level timeout (body arrives incrementally).
    stream_client: Client,
    base_url: String,
}

/// Per-attempt credential and protocol headers. Owned so a failover retry
/// can move a fresh value into its future.
#[derive(Debug, Clone)]
pub struct AnthropicAuth {
    pub key: String,
    pub auth_type: AuthType,
    pub version: Option<String>,
    pub beta: Option<String>,
}

impl AnthropicClient {
    pub fn new(base_url: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_millis(UPSTREAM_TIMEOUT_MS))
            .build()
            .expect("failed to build reqwest client");
        let stream_client = Client::builder()
            .build()
            .expect("failed to build streaming reqwest client");
        Self {
            client,
            stream_client,
            base_url,
        }
    }

    fn headers(auth: &AnthropicAuth) -> header::HeaderMap {
        let mut headers = header::HeaderMap::new();

        // `auto` routes sk-ant-* keys to x-api-key, everything else to bearer.
        let use_api_key = match auth.auth_type {
            AuthType::ApiKey => true,
            AuthType::Bearer => false,
            AuthType::Auto => auth.key.starts_with("sk-ant-"),
        };
        let value = if use_api_key {
            ("x-api-key", auth.key.clone())
        } else {
            ("authorization", format!("Bearer {}", auth.key))
        };
        headers.insert(
            value.0,
            header::HeaderValue::from_str(&value.1)
                .expect("Anthropic key contains invalid header characters"),
        );

        let version = auth.version.as_deref().unwrap_or(ANTHROPIC_VERSION);
        headers.insert(
            "anthropic-version",
            header::HeaderValue::from_str(version).expect("invalid anthropic-version"),
        );
        if let Some(beta) = auth.beta.as_deref() {
            if let Ok(v) = header::HeaderValue::from_str(beta) {
                headers.insert("anthropic-beta", v);
            }
        }
        headers
    }

    /// `POST /v1/messages`, buffered.
    pub async fn send(&self, body: &Value, auth: &AnthropicAuth) -> Result<Value, UpstreamError> {
        let url = format!("{}/v1/messages", self.base_url);
        let response = self
            .client
            .post(&url)
            .headers(Self::headers(auth))
            .json(body)
            .send()
            .await
            .map_err(|e| UpstreamError::Network(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| UpstreamError::Network(e.to_string()))?;

        if !status.is_success() {
            return Err(UpstreamError::Http {
                status: status.as_u16(),
                body: excerpt(&text),
            });
        }
        serde_json::from_str(&text).map_err(|e| UpstreamError::Network(format!("invalid JSON: {e}")))
    }

    /// `POST /v1/messages` with `stream: true`; yields raw SSE bytes.
    pub async fn send_stream(
        &self,
        body: &Value,
        auth: &AnthropicAuth,
    ) -> Result<SseStream, UpstreamError> {
        let url = format!("{}/v1/messages", self.base_url);
        let response = self
            .stream_client
            .post(&url)
            .headers(Self::headers(auth))
            .json(body)
            .send()
            .await
            .map_err(|e| UpstreamError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(UpstreamError::Http {
                status: status.as_u16(),
                body: excerpt(&text),
            });
        }
        Ok(Box::pin(
            response.bytes_stream().map(|r| r.map_err(anyhow::Error::from)),
        ))
    }

    /// Build the outbound Messages body.
    pub fn build_body(parsed: &ParsedRequest, model: &str, stream: bool) -> Value {
        if let Some(raw) = &parsed.raw_body {
            // Passthrough: only model and stream are overridden.
            let mut body = raw.clone();
            if let Some(obj) = body.as_object_mut() {
                obj.insert("model".into(), Value::String(model.to_string()));
                obj.insert("stream".into(), Value::Bool(stream));
            }
            return body;
        }

        let messages: Vec<Value> = parsed
            .messages
            .iter()
            .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
            .collect();
        let mut body = json!({
            "model": model,
            "max_tokens": parsed.max_tokens,
            "messages": messages,
            "stream": stream,
        });
        if let Some(system) = &parsed.system {
            body["system"] = Value::String(system.clone());
        }
        if let Some(temperature) = parsed.temperature {
            body["temperature"] = json!(temperature);
        }
        body
    }

    /// Decode a Messages response to neutral parts:
    /// `(content, input_tokens, output_tokens, finish_reason)`.
    pub fn parse_response(body: &Value) -> Result<(String, u64, u64, String), UpstreamError> {
        let content = body["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b["type"] == "text")
                    .filter_map(|b| b["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        let finish_reason = match body["stop_reason"].as_str().unwrap_or("stop") {
            "end_turn" => "stop",
            "max_tokens" => "length",
            other => other,
        }
        .to_string();

        Ok((
            content,
            body["usage"]["input_tokens"].as_u64().unwrap_or(0),
            body["usage"]["output_tokens"].as_u64().unwrap_or(0),
            finish_reason,
        ))
    }
}
