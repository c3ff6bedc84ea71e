//! Gemini generate-content adapter.
//!
//! Google's API differs from both other families: the model id is part of
//! the URL path, the API key rides in the query string, roles are
//! `user`/`model`, and streaming uses the `:streamGenerateContent` verb with
//! `alt=sse`.

use std::time::Duration;

use futures_util::StreamExt as _;
use reqwest::Client;
use serde_json::{json, Value};

use super::{excerpt, SseStream, UpstreamError, UPSTREAM_TIMEOUT_MS};
use crate::{
    ingress::{ParsedRequest, Role},
    sse::normalize_google_finish,
};

pub struct GoogleClient {
    client: Client,
    stream_client: Client,
    base_url: String,
    api_key: String,
}

impl GoogleClient {
    pub fn new(base_url: String, api_key: String) -> Self {
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
            api_key,
        }
    }

    /// Buffered `POST …/models/{model}:generateContent`.
    pub async fn send(&self, model: &str, body: &Value) -> Result<Value, UpstreamError> {
        let url = format!(
            "{}/v1beta/models/{model}:generateContent?key={}",
            self.base_url, self.api_key
        );
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

    /// Streaming `POST …/models/{model}:streamGenerateContent?alt=sse`.
    pub async fn send_stream(&self, model: &str, body: &Value) -> Result<SseStream, UpstreamError> {
        let url = format!(
            "{}/v1beta/models/{model}:streamGenerateContent?alt=sse&key={}",
            self.base_url, self.api_key
        );
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

    /// Build the generate-content body from the neutral request. The
    /// `stream` flag lives in the URL verb, not the body.
    pub fn build_body(parsed: &ParsedRequest) -> Value {
        let contents: Vec<Value> = parsed
            .messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::User => "user",
                    Role::Assistant => "model",
                };
                json!({ "role": role, "parts": [{ "text": m.content }] })
            })
            .collect();

        let mut generation_config = json!({ "maxOutputTokens": parsed.max_tokens });
        if let Some(temperature) = parsed.temperature {
            generation_config["temperature"] = json!(temperature);
        }

        let mut body = json!({
            "contents": contents,
            "generationConfig": generation_config,
        });
        if let Some(system) = &parsed.system {
            body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }
        body
    }

    /// Decode a generate-content response to neutral parts:
    /// `(content, input_tokens, output_tokens, finish_reason)`.
    pub fn parse_response(body: &Value) -> Result<(String, u64, u64, String), UpstreamError> {
        let content = body["candidates"][0]["content"]["parts"]
            .as_array()
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p["text"].as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        let finish_reason = normalize_google_finish(
            body["candidates"][0]["finishReason"].as_str().unwrap_or("STOP"),
        )
        .to_string();

        Ok((
            content,
            body["usageMetadata"]["promptTokenCount"].as_u64().unwrap_or(0),
            body["usageMetadata"]["candidatesTokenCount"].as_u64().unwrap_or(0),
            finish_reason,
        ))
    }
}
