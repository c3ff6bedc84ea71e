//! HTTP surface - route table and the end-to-end pipeline tests.
//!
//! Handlers are thin translations between HTTP and [`crate::pipeline`]; the
//! route table is the whole public surface: two proxy endpoints and two
//! read-only endpoints, bound to loopback by default.

pub mod chat;
pub mod health;
pub mod stats;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};

use crate::state::ProxyState;

/// Build the axum router for the proxy surface.
pub fn router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/stats", get(stats::stats))
        .route("/v1/messages", post(chat::messages))
        .route("/v1/chat/completions", post(chat::chat_completions))
        .with_state(state)
}

// ──────────────────────────────────────────────────────────────────────────────
// End-to-end pipeline tests - full axum stack against mock upstreams
// ──────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        catalog::test_fixtures::{registry, routing_table},
        classify::Weights,
        config::Config,
        routing_log::RoutingLogEntry,
    };
    use axum::body::Bytes;
    use axum::http::{HeaderMap, Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt as _;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Harness {
        app: Router,
        _log_dir: tempfile::TempDir,
        log_path: std::path::PathBuf,
    }

    fn harness(server: &MockServer, mode: &str) -> Harness {
        let log_dir = tempfile::tempdir().unwrap();
        let log_path = log_dir.path().join("routing-log.jsonl");
        let config: Config = serde_json::from_value(json!({
            "mode": mode,
            "providers": {
                "openai":    { "apiKey": "sk-openai", "baseUrl": server.uri() },
                "anthropic": {
                    "apiKey": "sk-ant-enterprise",
                    "setupToken": "setup-oauth-token",
                    "preferSetupToken": true,
                    "baseUrl": server.uri(),
                },
                "google":    { "apiKey": "g-key", "baseUrl": server.uri() },
                "xai":       { "apiKey": "x-key", "baseUrl": server.uri() },
            },
            "logging": { "logFilePath": log_path.to_str().unwrap() },
        }))
        .unwrap();
        let state =
            ProxyState::from_parts(config, registry(), routing_table(), Weights::default())
                .unwrap();
        Harness {
            app: router(Arc::new(state)),
            _log_dir: log_dir,
            log_path,
        }
    }

    async fn post_json(
        app: &Router,
        uri: &str,
        headers: &[(&str, &str)],
        body: Value,
    ) -> (StatusCode, HeaderMap, Bytes) {
        let mut request = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        let response = app
            .clone()
            .oneshot(request.body(axum::body::Body::from(body.to_string())).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        (status, headers, bytes)
    }

    async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn read_log(log_path: &std::path::Path) -> Vec<RoutingLogEntry> {
        std::fs::read_to_string(log_path)
            .unwrap_or_default()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    fn openai_completion(content: &str) -> Value {
        json!({
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": content },
                "finish_reason": "stop",
            }],
            "usage": { "prompt_tokens": 20, "completion_tokens": 10 },
        })
    }

    fn anthropic_message(content: &str) -> Value {
        json!({
            "id": "msg_up",
            "content": [{ "type": "text", "text": content }],
            "stop_reason": "end_turn",
            "usage": { "input_tokens": 15, "output_tokens": 8 },
        })
    }

    async fn mount_openai(server: &MockServer, content: &str) {
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(openai_completion(content)))
            .mount(server)
            .await;
    }

    async fn mount_anthropic(server: &MockServer, content: &str) {
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(anthropic_message(content)))
            .mount(server)
            .await;
    }

    // -----------------------------------------------------------------------
    // Concrete routing scenarios
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn heartbeat_in_eco_mode_uses_cheapest_simple_model() {
        let server = MockServer::start().await;
        mount_openai(&server, "pong").await;

        let h = harness(&server, "eco");
        let (status, headers, _) = post_json(
            &h.app,
            "/v1/chat/completions",
            &[],
            json!({ "messages": [{ "role": "user", "content": "ping" }], "max_tokens": 10 }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["x-throttle-model"], "gpt-4o-mini");
        assert_eq!(headers["x-throttle-tier"], "simple");

        let log = read_log(&h.log_path);
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].override_kind, "heartbeat");
    }

    #[tokio::test]
    async fn force_model_header_wins_over_classification() {
        let server = MockServer::start().await;
        mount_anthropic(&server, "forced answer").await;

        let h = harness(&server, "eco");
        let (status, headers, body) = post_json(
            &h.app,
            "/v1/chat/completions",
            &[("x-throttle-force-model", "opus")],
            json!({ "messages": [{ "role": "user", "content": "hi" }] }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["x-throttle-model"], "claude-opus-4-1");
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["choices"][0]["message"]["content"], "forced answer");
    }

    #[tokio::test]
    async fn tool_calling_floors_trivial_prompt_to_standard() {
        let server = MockServer::start().await;
        // eco/standard head is gemini - mock the Google endpoint.
        Mock::given(method("POST"))
            .and(path("/v1beta/models/gemini-2.5-flash:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "candidates": [{
                    "content": { "parts": [{ "text": "tooling up" }], "role": "model" },
                    "finishReason": "STOP",
                }],
                "usageMetadata": { "promptTokenCount": 3, "candidatesTokenCount": 2 },
            })))
            .mount(&server)
            .await;

        let h = harness(&server, "eco");
        let (status, headers, _) = post_json(
            &h.app,
            "/v1/chat/completions",
            &[],
            json!({
                "messages": [{ "role": "user", "content": "hi" }],
                "tools": [{ "type": "function", "function": { "name": "lookup" } }],
            }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["x-throttle-tier"], "standard");
        assert!(headers["x-throttle-reasoning"]
            .to_str()
            .unwrap()
            .contains("tool_calling tier floor"));
    }

    #[tokio::test]
    async fn identical_requests_within_ttl_hit_upstream_once() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(openai_completion("cached")))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&server, "eco");
        let body = json!({
            "messages": [{ "role": "user", "content": "what's the capital of France?" }],
        });

        let (s1, h1, b1) = post_json(&h.app, "/v1/chat/completions", &[], body.clone()).await;
        let (s2, h2, b2) = post_json(&h.app, "/v1/chat/completions", &[], body).await;

        assert_eq!(s1, StatusCode::OK);
        assert_eq!(s2, StatusCode::OK);
        assert_eq!(b1, b2, "replay must be byte-identical");
        assert_eq!(h1["x-throttle-request-id"], h2["x-throttle-request-id"]);

        // Both requests logged; only the producer carries dispatcher latency
        // and token counts.
        let log = read_log(&h.log_path);
        assert_eq!(log.len(), 2);
        let with_tokens = log.iter().filter(|e| e.output_tokens > 0).count();
        assert_eq!(with_tokens, 1);
    }

    #[tokio::test]
    async fn timestamp_prefixed_repeat_still_deduplicates() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(openai_completion("once")))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&server, "eco");
        let (_, _, b1) = post_json(
            &h.app,
            "/v1/chat/completions",
            &[],
            json!({ "messages": [{ "role": "user", "content": "[MON 2026-08-01 11:30 UTC] deploy status?" }] }),
        )
        .await;
        let (_, _, b2) = post_json(
            &h.app,
            "/v1/chat/completions",
            &[],
            json!({ "messages": [{ "role": "user", "content": "[MON 2026-08-01 11:32 UTC] deploy status?" }] }),
        )
        .await;
        assert_eq!(b1, b2);
    }

    #[tokio::test]
    async fn session_pin_never_downgrades() {
        let server = MockServer::start().await;
        mount_openai(&server, "simple answer").await;
        mount_anthropic(&server, "complex answer").await;

        let h = harness(&server, "eco");
        let session = [("x-session-id", "sess-42")];

        // 1: simple → cheap model.
        let (_, headers, _) = post_json(
            &h.app,
            "/v1/chat/completions",
            &session,
            json!({ "messages": [{ "role": "user", "content": "thanks" }] }),
        )
        .await;
        assert_eq!(headers["x-throttle-model"], "gpt-4o-mini");

        // 2: complex → pin upgrades to the eco/complex model.
        let complex_prompt = "Implement and design a concurrent cache in rust. Must \
             support at least 1M entries within strict latency bounds. First design \
             the eviction algorithm, then build the API, finally explain why the \
             design avoids lock contention. 1. eviction 2. sharding 3. benchmarks \
             ```rust\npub fn get(&self)\n```";
        let (_, headers, _) = post_json(
            &h.app,
            "/v1/chat/completions",
            &session,
            json!({ "messages": [{ "role": "user", "content": complex_prompt }] }),
        )
        .await;
        assert_eq!(headers["x-throttle-model"], "claude-sonnet-4-5");
        assert_eq!(headers["x-throttle-tier"], "complex");

        // 3: simple again - the pin holds.
        let (_, headers, _) = post_json(
            &h.app,
            "/v1/chat/completions",
            &session,
            json!({ "messages": [{ "role": "user", "content": "ok great" }] }),
        )
        .await;
        assert_eq!(headers["x-throttle-model"], "claude-sonnet-4-5");
        assert!(headers["x-throttle-reasoning"]
            .to_str()
            .unwrap()
            .contains("session-pinned"));
    }

    #[tokio::test]
    async fn dual_key_failover_is_recorded_in_the_log() {
        let server = MockServer::start().await;
        // Preferred setup token (bearer under auto) is rate-limited…
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("authorization", "Bearer setup-oauth-token"))
            .respond_with(ResponseTemplate::new(429).set_body_string("overloaded"))
            .mount(&server)
            .await;
        // …the enterprise key succeeds.
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "sk-ant-enterprise"))
            .respond_with(ResponseTemplate::new(200).set_body_json(anthropic_message("ok")))
            .mount(&server)
            .await;

        let h = harness(&server, "eco");
        let (status, _, _) = post_json(
            &h.app,
            "/v1/messages",
            &[("x-throttle-force-model", "haiku")],
            json!({ "messages": [{ "role": "user", "content": "hello claude" }], "max_tokens": 64 }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let log = read_log(&h.log_path);
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].failover, Some(true));
        assert_eq!(
            serde_json::to_value(log[0].key_type).unwrap(),
            json!("enterprise")
        );
    }

    // -----------------------------------------------------------------------
    // Streaming
    // -----------------------------------------------------------------------

    const OPENAI_SSE: &str = concat!(
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\"}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hello\"}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\" world\"}}],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2}}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n",
    );

    #[tokio::test]
    async fn openai_upstream_translates_to_messages_sse() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(OPENAI_SSE, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let h = harness(&server, "eco");
        // Messages-style client, streaming, forced onto an OpenAI model.
        let (status, headers, body) = post_json(
            &h.app,
            "/v1/messages",
            &[("x-throttle-force-model", "grok-fast")],
            json!({
                "messages": [{ "role": "user", "content": "stream me something" }],
                "max_tokens": 32,
                "stream": true,
            }),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers["content-type"], "text/event-stream");

        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("event: message_start"));
        assert!(text.contains("event: content_block_delta"));
        assert!(text.contains("\"text\":\"Hello\""));
        assert!(text.contains("\"text\":\" world\""));
        assert!(text.contains("event: message_stop"));

        // Accounting took the upstream totals; one log entry was written.
        let log = read_log(&h.log_path);
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].input_tokens, 5);
        assert_eq!(log[0].output_tokens, 2);
    }

    const ANTHROPIC_SSE: &str = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":11,\"output_tokens\":1}}}\n\n",
        "event: content_block_start\n",
        "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi!\"}}\n\n",
        "event: content_block_stop\n",
        "data: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
        "event: message_delta\n",
        "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":4}}\n\n",
        "event: message_stop\n",
        "data: {\"type\":\"message_stop\"}\n\n",
    );

    #[tokio::test]
    async fn anthropic_to_anthropic_stream_is_byte_faithful() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(ANTHROPIC_SSE, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let h = harness(&server, "eco");
        let (status, _, body) = post_json(
            &h.app,
            "/v1/messages",
            &[("x-throttle-force-model", "haiku")],
            json!({
                "messages": [{ "role": "user", "content": "hello claude stream" }],
                "max_tokens": 32,
                "stream": true,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        // Passthrough modulo heartbeat comments.
        let text = String::from_utf8(body.to_vec()).unwrap();
        let without_heartbeats = text.replace(": heartbeat\n\n", "");
        assert_eq!(without_heartbeats, ANTHROPIC_SSE);

        let log = read_log(&h.log_path);
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].input_tokens, 11);
        assert_eq!(log[0].output_tokens, 4);
    }

    #[tokio::test]
    async fn anthropic_upstream_translates_to_chat_completions_sse() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(ANTHROPIC_SSE, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let h = harness(&server, "eco");
        let (status, _, body) = post_json(
            &h.app,
            "/v1/chat/completions",
            &[("x-throttle-force-model", "haiku")],
            json!({
                "messages": [{ "role": "user", "content": "hello claude stream" }],
                "stream": true,
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("chat.completion.chunk"));
        assert!(text.contains("\"content\":\"Hi!\""));
        assert!(text.contains("\"finish_reason\":\"stop\""));
        assert!(text.trim_end().ends_with("data: [DONE]"));
    }

    // -----------------------------------------------------------------------
    // Errors
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn malformed_json_is_invalid_request() {
        let server = MockServer::start().await;
        let h = harness(&server, "eco");
        let response = h
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/chat/completions")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["type"], "invalid_request");
    }

    #[tokio::test]
    async fn unknown_force_alias_is_invalid_request() {
        let server = MockServer::start().await;
        let h = harness(&server, "eco");
        let (status, _, body) = post_json(
            &h.app,
            "/v1/chat/completions",
            &[("x-throttle-force-model", "gpt-9000")],
            json!({ "messages": [{ "role": "user", "content": "hello there" }] }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"]["type"], "invalid_request");
    }

    #[tokio::test]
    async fn no_configured_provider_is_503() {
        let server = MockServer::start().await;
        let log_dir = tempfile::tempdir().unwrap();
        let config: Config = serde_json::from_value(json!({
            "mode": "eco",
            "providers": {},
            "logging": { "logFilePath": log_dir.path().join("log.jsonl").to_str().unwrap() },
        }))
        .unwrap();
        let state =
            ProxyState::from_parts(config, registry(), routing_table(), Weights::default())
                .unwrap();
        let app = router(Arc::new(state));

        let (status, _, body) = post_json(
            &app,
            "/v1/chat/completions",
            &[],
            json!({ "messages": [{ "role": "user", "content": "anyone home?" }] }),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"]["type"], "no_available_model");
    }

    #[tokio::test]
    async fn upstream_429_reexposes_as_429_with_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("provider says no"))
            .mount(&server)
            .await;

        let h = harness(&server, "eco");
        let (status, _, body) = post_json(
            &h.app,
            "/v1/chat/completions",
            &[("x-throttle-force-model", "grok-fast")],
            json!({ "messages": [{ "role": "user", "content": "please answer" }] }),
        )
        .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["error"]["type"], "upstream_rate_limited");
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("provider says no"));
    }

    // -----------------------------------------------------------------------
    // Read-only endpoints
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn health_reports_canonical_mode() {
        let server = MockServer::start().await;
        let h = harness(&server, "performance");
        let (status, body) = get_json(&h.app, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["mode"], "gigachad");
        assert!(body["uptime_seconds"].is_u64());
    }

    #[tokio::test]
    async fn stats_aggregates_logged_requests() {
        let server = MockServer::start().await;
        mount_openai(&server, "an answer").await;

        let h = harness(&server, "eco");
        post_json(
            &h.app,
            "/v1/chat/completions",
            &[],
            json!({ "messages": [{ "role": "user", "content": "what is rust?" }] }),
        )
        .await;

        let (status, body) = get_json(&h.app, "/stats?days=7").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["totalRequests"], 1);
        assert_eq!(body["baselineModel"], "claude-opus-4-1");
        assert!(body["baselineCostUsd"].as_f64().unwrap() > 0.0);
        assert!(body["modelDistribution"].is_object());
    }
}
