//! Response translation into the client's wire dialect.
//!
//! Non-streaming responses re-encode a neutral [`ProxyResponse`] as either a
//! Messages or a ChatCompletions body. Streaming responses are synthesized
//! event-by-event: the translator is a per-request state machine that
//! remembers whether the client dialect's prologue has been emitted, turns
//! every upstream text delta into the matching delta event, and closes the
//! stream with the dialect's epilogue grammar.
//!
//! Same-family streams never come through here - the mediator proxies those
//! bytes verbatim.

use bytes::Bytes;
use serde_json::{json, Value};

use crate::{
    ingress::IngressFormat,
    providers::ProxyResponse,
    sse::{StreamUpdate, UsageAccumulator},
};

/// Render one SSE frame.
pub fn sse_frame(event: Option<&str>, data: &Value) -> Bytes {
    let mut out = String::new();
    if let Some(name) = event {
        out.push_str("event: ");
        out.push_str(name);
        out.push('\n');
    }
    out.push_str("data: ");
    out.push_str(&data.to_string());
    out.push_str("\n\n");
    Bytes::from(out)
}

/// The SSE comment emitted while waiting for slow-starting upstreams.
pub fn heartbeat_frame() -> Bytes {
    Bytes::from_static(b": heartbeat\n\n")
}

/// Map a neutral finish reason to the Messages vocabulary.
fn to_anthropic_stop(reason: &str) -> &str {
    match reason {
        "stop" => "end_turn",
        "length" => "max_tokens",
        other => other,
    }
}

/// Map a Messages stop reason to the ChatCompletions vocabulary.
fn to_openai_finish(reason: &str) -> &str {
    match reason {
        "end_turn" | "stop" => "stop",
        "max_tokens" | "length" => "length",
        other => other,
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Non-streaming encoding
// ──────────────────────────────────────────────────────────────────────────────

/// Re-encode a neutral response in the client's dialect with a fresh id.
pub fn encode_response(format: IngressFormat, response: &ProxyResponse, request_id: &str) -> Value {
    match format {
        IngressFormat::Anthropic => json!({
            "id": format!("msg_{}", request_id.replace('-', "")),
            "type": "message",
            "role": "assistant",
            "model": response.model_id,
            "content": [{ "type": "text", "text": response.content }],
            "stop_reason": to_anthropic_stop(&response.finish_reason),
            "stop_sequence": null,
            "usage": {
                "input_tokens": response.input_tokens,
                "output_tokens": response.output_tokens,
            },
        }),
        IngressFormat::OpenAI => json!({
            "id": format!("chatcmpl-{request_id}"),
            "object": "chat.completion",
            "created": chrono::Utc::now().timestamp(),
            "model": response.model_id,
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": response.content },
                "finish_reason": to_openai_finish(&response.finish_reason),
            }],
            "usage": {
                "prompt_tokens": response.input_tokens,
                "completion_tokens": response.output_tokens,
                "total_tokens": response.input_tokens + response.output_tokens,
            },
        }),
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Streaming synthesis
// ──────────────────────────────────────────────────────────────────────────────

/// Stateful cross-family SSE synthesizer for one request.
pub struct StreamSynthesizer {
    format: IngressFormat,
    model_id: String,
    request_id: String,
    created: i64,
    prologue_sent: bool,
    stop_reason: Option<String>,
}

impl StreamSynthesizer {
    pub fn new(format: IngressFormat, model_id: &str, request_id: &str) -> Self {
        Self {
            format,
            model_id: model_id.to_string(),
            request_id: request_id.to_string(),
            created: chrono::Utc::now().timestamp(),
            prologue_sent: false,
            stop_reason: None,
        }
    }

    /// Translate one upstream update into zero or more client frames.
    pub fn render(&mut self, update: &StreamUpdate, usage: &UsageAccumulator) -> Vec<Bytes> {
        if let Some(reason) = &update.stop_reason {
            self.stop_reason = Some(reason.clone());
        }
        let Some(text) = update.text.as_deref() else {
            return Vec::new();
        };

        let mut frames = Vec::new();
        if !self.prologue_sent {
            self.prologue_sent = true;
            frames.extend(self.prologue(usage));
        }
        frames.push(self.delta(text));
        frames
    }

    /// Close the stream with the dialect's epilogue grammar.
    pub fn finish(&mut self, usage: &UsageAccumulator) -> Vec<Bytes> {
        let mut frames = Vec::new();
        // A stream that produced no text still owes the client a well-formed
        // event sequence.
        if !self.prologue_sent {
            self.prologue_sent = true;
            frames.extend(self.prologue(usage));
        }
        frames.extend(self.epilogue(usage));
        frames
    }

    fn prologue(&self, usage: &UsageAccumulator) -> Vec<Bytes> {
        match self.format {
            IngressFormat::Anthropic => vec![
                sse_frame(
                    Some("message_start"),
                    &json!({
                        "type": "message_start",
                        "message": {
                            "id": format!("msg_{}", self.request_id.replace('-', "")),
                            "type": "message",
                            "role": "assistant",
                            "model": self.model_id,
                            "content": [],
                            "stop_reason": null,
                            "usage": { "input_tokens": usage.input_tokens, "output_tokens": 0 },
                        },
                    }),
                ),
                sse_frame(
                    Some("content_block_start"),
                    &json!({
                        "type": "content_block_start",
                        "index": 0,
                        "content_block": { "type": "text", "text": "" },
                    }),
                ),
            ],
            IngressFormat::OpenAI => vec![sse_frame(
                None,
                &self.openai_chunk(json!({ "role": "assistant" }), None),
            )],
        }
    }

    fn delta(&self, text: &str) -> Bytes {
        match self.format {
            IngressFormat::Anthropic => sse_frame(
                Some("content_block_delta"),
                &json!({
                    "type": "content_block_delta",
                    "index": 0,
                    "delta": { "type": "text_delta", "text": text },
                }),
            ),
            IngressFormat::OpenAI => {
                sse_frame(None, &self.openai_chunk(json!({ "content": text }), None))
            }
        }
    }

    fn epilogue(&self, usage: &UsageAccumulator) -> Vec<Bytes> {
        let reason = self.stop_reason.as_deref().unwrap_or("stop");
        match self.format {
            IngressFormat::Anthropic => vec![
                sse_frame(
                    Some("content_block_stop"),
                    &json!({ "type": "content_block_stop", "index": 0 }),
                ),
                sse_frame(
                    Some("message_delta"),
                    &json!({
                        "type": "message_delta",
                        "delta": { "stop_reason": to_anthropic_stop(reason), "stop_sequence": null },
                        "usage": { "output_tokens": usage.output_tokens },
                    }),
                ),
                sse_frame(Some("message_stop"), &json!({ "type": "message_stop" })),
            ],
            IngressFormat::OpenAI => vec![
                sse_frame(
                    None,
                    &self.openai_chunk(json!({}), Some(to_openai_finish(reason))),
                ),
                Bytes::from_static(b"data: [DONE]\n\n"),
            ],
        }
    }

    fn openai_chunk(&self, delta: Value, finish_reason: Option<&str>) -> Value {
        json!({
            "id": format!("chatcmpl-{}", self.request_id),
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model_id,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        })
    }
}
