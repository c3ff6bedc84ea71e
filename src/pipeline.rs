//! The request-path pipeline: classify → override → dedup → route → dispatch
//! → mediate → log.
//!
//! Handlers in [`crate::api`] stay thin; this module owns the orchestration
//! for both buffered and streaming requests. The invariants that matter:
//!
//! - A request that produced any client bytes produces exactly one routing
//!   log entry, including on stream errors and client disconnects.
//! - Dedup waiters receive exactly the producer's bytes; the producer slot
//!   is cleared even when the producer errors (its guard drops).
//! - Streaming finalization always runs: the pump task owns the upstream
//!   read, the heartbeat timer, accounting, and the log write, so a dropped
//!   client body cannot skip any of it.

use std::{sync::Arc, time::Instant};

use axum::{
    body::Body,
    http::{header, HeaderMap, StatusCode},
    response::Response,
};
use bytes::Bytes;
use futures_util::StreamExt as _;
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    classify::{ClassificationResult, PromptMeta},
    dedup::{canonical_key, CachedResponse, Claim},
    dispatch::DispatchedStream,
    error::ProxyError,
    ingress::{self, ControlHeaders, IngressFormat, ParsedRequest},
    overrides,
    rate_limit::KeyType,
    router::{self, RoutingDecision},
    routing_log::RoutingLogEntry,
    sse::{interpret, SseParser, UpstreamFamily, UsageAccumulator},
    state::ProxyState,
    translate::{encode_response, heartbeat_frame, sse_frame, StreamSynthesizer},
};

/// SSE comment cadence while waiting for the first upstream byte.
const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(2);

/// Entry point for both chat endpoints.
pub async fn handle(
    state: Arc<ProxyState>,
    format: IngressFormat,
    headers: &HeaderMap,
    body: serde_json::Value,
) -> Result<Response, ProxyError> {
    let parsed = match format {
        IngressFormat::Anthropic => ingress::parse_messages_request(body)?,
        IngressFormat::OpenAI => ingress::parse_chat_request(body)?,
    };
    let control = ControlHeaders::from_headers(headers);
    let request_id = Uuid::new_v4().to_string();

    let classification = state.classifier.classify(
        parsed.last_user_text(),
        PromptMeta {
            message_count: parsed.messages.len(),
            system_prompt: parsed.system.as_deref(),
        },
    );
    let override_ = overrides::detect(
        &parsed,
        &control,
        &state.config.aliases,
        &state.registry,
        |id| state.routing_log.lookup_model(id),
    )?;

    tracing::debug!(
        request_id = %request_id,
        score = classification.score,
        tier = %classification.tier,
        confidence = classification.confidence,
        override_kind = override_.kind(),
        stream = parsed.stream,
        "classified"
    );

    if parsed.stream {
        handle_streaming(state, parsed, control, classification, override_, request_id).await
    } else {
        handle_buffered(state, parsed, control, classification, override_, request_id).await
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Buffered path
// ──────────────────────────────────────────────────────────────────────────────

async fn handle_buffered(
    state: Arc<ProxyState>,
    parsed: ParsedRequest,
    control: ControlHeaders,
    classification: ClassificationResult,
    override_: overrides::Override,
    request_id: String,
) -> Result<Response, ProxyError> {
    let prompt_hash = canonical_key(parsed.system.as_deref(), &parsed.messages);

    // Producer-vs-waiter resolution. A failed producer rejects its waiters,
    // each of which then claims again and becomes the next producer.
    let guard = loop {
        match state.dedup.claim(&prompt_hash) {
            Claim::Replay(cached) => {
                return Ok(replay(
                    &state,
                    cached,
                    &prompt_hash,
                    &classification,
                    &override_,
                    &control,
                    &request_id,
                ));
            }
            Claim::Wait(rx) => match crate::dedup::DedupCache::await_producer(rx).await {
                Some(cached) => {
                    return Ok(replay(
                        &state,
                        cached,
                        &prompt_hash,
                        &classification,
                        &override_,
                        &control,
                        &request_id,
                    ));
                }
                None => continue,
            },
            Claim::Produce(guard) => break guard,
        }
    };

    let decision = match router::decide(
        &state.routing_inputs(),
        &classification,
        override_,
        control.session_id.as_deref(),
    ) {
        Ok(decision) => decision,
        Err(e) => {
            mark_session_failed(&state, &control);
            return Err(e); // guard drops here, rejecting waiters
        }
    };

    let started = Instant::now();
    let response = match state.dispatcher.dispatch(&decision, &parsed, &control).await {
        Ok(response) => response,
        Err(e) => {
            mark_session_failed(&state, &control);
            write_log(
                &state,
                &request_id,
                &prompt_hash,
                &classification,
                &decision,
                &control,
                0,
                0,
                started.elapsed().as_millis() as u64,
                None,
                false,
            );
            return Err(e);
        }
    };

    let body = encode_response(parsed.format, &response, &request_id);
    let body_bytes = Bytes::from(body.to_string());

    let mut cached_headers = vec![(
        header::CONTENT_TYPE.to_string(),
        "application/json".to_string(),
    )];
    cached_headers.extend(throttle_headers(&decision, &classification, &request_id));
    let cached = guard.complete(CachedResponse {
        status: StatusCode::OK.as_u16(),
        headers: cached_headers,
        body: body_bytes,
    });

    write_log(
        &state,
        &request_id,
        &prompt_hash,
        &classification,
        &decision,
        &control,
        response.input_tokens,
        response.output_tokens,
        response.latency_ms,
        response.key_type,
        response.failover,
    );

    Ok(response_from_cached(&cached))
}

/// Serve a cached response byte-for-byte, logging a zero-cost entry so every
/// answered request leaves exactly one log line.
fn replay(
    state: &ProxyState,
    cached: Arc<CachedResponse>,
    prompt_hash: &str,
    classification: &ClassificationResult,
    override_: &overrides::Override,
    control: &ControlHeaders,
    request_id: &str,
) -> Response {
    let model = cached_header(&cached, "x-throttle-model").unwrap_or_default();
    let provider = state
        .registry
        .get(&model)
        .map(|spec| spec.provider)
        .unwrap_or(crate::catalog::Provider::Anthropic);

    state.routing_log.append(&RoutingLogEntry {
        request_id: request_id.to_string(),
        timestamp: chrono::Utc::now(),
        prompt_hash: prompt_hash.to_string(),
        score: classification.score,
        confidence: classification.confidence,
        tier: classification.tier,
        model,
        provider,
        mode: state.config.mode,
        override_kind: override_.kind().to_string(),
        input_tokens: 0,
        output_tokens: 0,
        estimated_cost_usd: 0.0,
        latency_ms: 0,
        parent_request_id: control.parent_request_id.clone(),
        client_id: control.client_id.clone(),
        key_type: None,
        failover: None,
    });

    response_from_cached(&cached)
}

fn cached_header(cached: &CachedResponse, name: &str) -> Option<String> {
    cached
        .headers
        .iter()
        .find(|(header_name, _)| header_name.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.clone())
}

fn response_from_cached(cached: &CachedResponse) -> Response {
    let mut builder = Response::builder().status(cached.status);
    for (name, value) in &cached.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    builder
        .body(Body::from(cached.body.clone()))
        .expect("cached response headers are valid")
}

// ──────────────────────────────────────────────────────────────────────────────
// Streaming path
// ──────────────────────────────────────────────────────────────────────────────

async fn handle_streaming(
    state: Arc<ProxyState>,
    parsed: ParsedRequest,
    control: ControlHeaders,
    classification: ClassificationResult,
    override_: overrides::Override,
    request_id: String,
) -> Result<Response, ProxyError> {
    let decision = match router::decide(
        &state.routing_inputs(),
        &classification,
        override_,
        control.session_id.as_deref(),
    ) {
        Ok(decision) => decision,
        Err(e) => {
            mark_session_failed(&state, &control);
            return Err(e);
        }
    };

    // Latency runs from first dispatch to stream end.
    let started = Instant::now();
    let dispatched = match state
        .dispatcher
        .dispatch_stream(&decision, &parsed, &control)
        .await
    {
        Ok(dispatched) => dispatched,
        Err(e) => {
            mark_session_failed(&state, &control);
            return Err(e);
        }
    };

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive");
    for (name, value) in throttle_headers(&decision, &classification, &request_id) {
        builder = builder.header(name.as_str(), value.as_str());
    }

    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(32);
    let prompt_hash = canonical_key(parsed.system.as_deref(), &parsed.messages);
    tokio::spawn(pump_stream(
        state,
        dispatched,
        parsed.format,
        decision,
        classification,
        control,
        request_id,
        prompt_hash,
        started,
        tx,
    ));

    let body_stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    Ok(builder
        .body(Body::from_stream(body_stream))
        .expect("streaming response headers are valid"))
}

/// Drive one upstream stream to completion: heartbeats until the first byte,
/// passthrough or translation per chunk, token accounting, and the
/// unconditional finalization (log write, session failure marking).
#[allow(clippy::too_many_arguments)]
async fn pump_stream(
    state: Arc<ProxyState>,
    dispatched: DispatchedStream,
    format: IngressFormat,
    decision: RoutingDecision,
    classification: ClassificationResult,
    control: ControlHeaders,
    request_id: String,
    prompt_hash: String,
    started: Instant,
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
) {
    let DispatchedStream {
        mut stream,
        family,
        key_type,
        failover,
    } = dispatched;

    // Same-family streams proxy bytes verbatim; parsing continues for
    // accounting only.
    let passthrough = matches!(
        (format, family),
        (IngressFormat::Anthropic, UpstreamFamily::Anthropic)
            | (IngressFormat::OpenAI, UpstreamFamily::OpenAI)
    );

    let mut parser = SseParser::new();
    let mut usage = UsageAccumulator::default();
    let mut synth = StreamSynthesizer::new(format, &decision.model_id, &request_id);
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await; // the first tick is immediate; skip it

    let mut saw_first_byte = false;
    let mut client_gone = false;
    let mut stream_error: Option<String> = None;

    'pump: loop {
        tokio::select! {
            _ = heartbeat.tick(), if !saw_first_byte => {
                if tx.send(Ok(heartbeat_frame())).await.is_err() {
                    client_gone = true;
                    break 'pump;
                }
            }
            item = stream.next() => {
                match item {
                    Some(Ok(chunk)) => {
                        saw_first_byte = true;
                        let mut frames: Vec<Bytes> = Vec::new();
                        for event in parser.feed(&chunk) {
                            let update = interpret(family, &event);
                            usage.observe(&update);
                            if !passthrough {
                                frames.extend(synth.render(&update, &usage));
                            }
                        }
                        if passthrough {
                            frames.push(chunk);
                        }
                        for frame in frames {
                            if tx.send(Ok(frame)).await.is_err() {
                                client_gone = true;
                                break 'pump;
                            }
                        }
                    }
                    Some(Err(e)) => {
                        stream_error = Some(e.to_string());
                        break 'pump;
                    }
                    None => break 'pump,
                }
            }
        }
    }

    if !client_gone {
        if let Some(message) = &stream_error {
            let _ = tx.send(Ok(error_frame(format, message))).await;
        } else if !passthrough {
            for frame in synth.finish(&usage) {
                if tx.send(Ok(frame)).await.is_err() {
                    break;
                }
            }
        }
    }

    // Finalization - runs on normal end, upstream error, and disconnect.
    if stream_error.is_some() {
        tracing::warn!(
            request_id = %request_id,
            model = %decision.model_id,
            error = stream_error.as_deref().unwrap_or(""),
            "upstream stream failed"
        );
        mark_session_failed(&state, &control);
    }
    write_log(
        &state,
        &request_id,
        &prompt_hash,
        &classification,
        &decision,
        &control,
        usage.input_tokens,
        usage.output_tokens,
        started.elapsed().as_millis() as u64,
        key_type,
        failover,
    );
}

fn error_frame(format: IngressFormat, message: &str) -> Bytes {
    match format {
        IngressFormat::Anthropic => sse_frame(
            Some("error"),
            &json!({
                "type": "error",
                "error": { "type": "upstream_stream_error", "message": message },
            }),
        ),
        IngressFormat::OpenAI => sse_frame(
            None,
            &json!({ "error": { "type": "upstream_stream_error", "message": message } }),
        ),
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Shared helpers
// ──────────────────────────────────────────────────────────────────────────────

/// The routing-decision headers attached to every successful response.
fn throttle_headers(
    decision: &RoutingDecision,
    classification: &ClassificationResult,
    request_id: &str,
) -> Vec<(String, String)> {
    vec![
        ("x-throttle-model".into(), decision.model_id.clone()),
        ("x-throttle-tier".into(), decision.tier.to_string()),
        (
            "x-throttle-score".into(),
            format!("{:.3}", classification.score),
        ),
        (
            "x-throttle-confidence".into(),
            format!("{:.3}", classification.confidence),
        ),
        ("x-throttle-request-id".into(), request_id.to_string()),
        ("x-throttle-reasoning".into(), decision.reasoning.clone()),
    ]
}

fn mark_session_failed(state: &ProxyState, control: &ControlHeaders) {
    if let Some(session_id) = &control.session_id {
        state.sessions.mark_failed(session_id);
    }
}

#[allow(clippy::too_many_arguments)]
fn write_log(
    state: &ProxyState,
    request_id: &str,
    prompt_hash: &str,
    classification: &ClassificationResult,
    decision: &RoutingDecision,
    control: &ControlHeaders,
    input_tokens: u64,
    output_tokens: u64,
    latency_ms: u64,
    key_type: Option<KeyType>,
    failover: bool,
) {
    let estimated_cost_usd = state
        .registry
        .get(&decision.model_id)
        .map(|spec| spec.estimate_cost(input_tokens, output_tokens))
        .unwrap_or(0.0);

    state.routing_log.append(&RoutingLogEntry {
        request_id: request_id.to_string(),
        timestamp: chrono::Utc::now(),
        prompt_hash: prompt_hash.to_string(),
        score: classification.score,
        confidence: classification.confidence,
        tier: decision.tier,
        model: decision.model_id.clone(),
        provider: decision.provider,
        mode: decision.mode,
        override_kind: decision.override_.kind().to_string(),
        input_tokens,
        output_tokens,
        estimated_cost_usd,
        latency_ms,
        parent_request_id: control.parent_request_id.clone(),
        client_id: control.client_id.clone(),
        key_type,
        failover: failover.then_some(true),
    });
}
