//! OpenAI-compatible chat completions adapter.
//!
//! Covers every provider that speaks `POST /v1/chat/completions` with a
//! bearer token - OpenAI, DeepSeek, xAI, Moonshot, Mistral, and keyless
//! local Ollama. The adapters differ only in base URL and whether a key is
//! attached; the wire shape is identical.

use std::time::Duration;

use futures_util::StreamExt as _;
use reqwest::{header, Client};
use serde_json::{json, Value};

use super::{excerpt, SseStream, UpstreamError, UPSTREAM_TIMEOUT_MS};
use crate::ingress::ParsedRequest;

pub struct OpenAICompatClient {
    /// Buffered requests - bounded by the upstream timeout.
    client: Client,
    /// Streaming requests - no request-level timeout (body arrives incrementally).
    stream_client: Client,
    base_url: String,
}

impl OpenAICompatClient {
    pub fn new(base_url: String, api_key: Option<&str>) -> Self {
        let mut headers = header::HeaderMap::new();
        if let Some(key) = api_key.filter(|k| !k.is_empty()) {
            headers.insert(
                header::AUTHORIZATION,
                header::HeaderValue::from_str(&format!("Bearer {key}"))
                    .expect("API key contains invalid Authorization header characters"),
            );
        }

        let client = Client::builder()
            .default_headers(headers.clone())
            .timeout(Duration::from_millis(UPSTREAM_TIMEOUT_MS))
            .build()
            .expect("failed to build reqwest client");
        let stream_client = Client::builder()
            .default_headers(headers)
            .build()
            .expect("failed to build streaming reqwest client");

        Self {
            client,
            stream_client,
            base_url,
        }
    }

    /// `POST /v1/chat/completions`, buffered.
    pub async fn send(&self, body: &Value) -> Result<Value, UpstreamError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
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

    /// `POST /v1/chat/completions` with `stream: true`; raw SSE bytes.
    pub async fn send_stream(&self, body: &Value) -> Result<SseStream, UpstreamError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self
            .stream_client
            .post(&url)
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

    /// Build the outbound chat-completions body from the neutral request.
    pub fn build_body(parsed: &ParsedRequest, model: &str, stream: bool) -> Value {
        let mut messages: Vec<Value> = Vec::with_capacity(parsed.messages.len() + 1);
        if let Some(system) = &parsed.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.extend(
            parsed
                .messages
                .iter()
                .map(|m| json!({ "role": m.role.as_str(), "content": m.content })),
        );

        let mut body = json!({
            "model": model,
            "messages": messages,
            "max_tokens": parsed.max_tokens,
            "stream": stream,
        });
        if let Some(temperature) = parsed.temperature {
            body["temperature"] = json!(temperature);
        }
        if stream {
            // Ask compliant backends to attach usage to the final chunk.
            body["stream_options"] = json!({ "include_usage": true });
        }
        body
    }

    /// Decode a chat-completions response to neutral parts:
    /// `(content, input_tokens, output_tokens, finish_reason)`.
    pub fn parse_response(body: &Value) -> Result<(String, u64, u64, String), UpstreamError> {
        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string();
        let finish_reason = body["choices"][0]["finish_reason"]
            .as_str()
            .unwrap_or("stop")
            .to_string();
        Ok((
            content,
            body["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            body["usage"]["completion_tokens"].as_u64().unwrap_or(0),
            finish_reason,
        ))
    }
}
