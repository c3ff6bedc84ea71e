//! Incremental server-sent-event parsing and upstream event interpretation.
//!
//! The parser is chunk-boundary safe: network reads can split an SSE frame
//! anywhere (mid-line, mid-UTF-8) and [`SseParser::feed`] carries the
//! remainder across calls. Comment lines (`: …`) - including our own
//! heartbeats - are dropped per the SSE grammar.
//!
//! Three upstream families produce three event schemas; [`interpret`]
//! flattens any of them into a [`StreamUpdate`] carrying text deltas, token
//! counts, and termination. Providers report token usage differently (running
//! totals, a single final total, or per-chunk fields), so accounting always
//! takes the latest observed value rather than summing.

use serde_json::Value;

/// One parsed SSE frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE parser. Feed raw bytes, get completed events.
#[derive(Debug, Default)]
pub struct SseParser {
    buf: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a network chunk, returning every event completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(newline) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                // Blank line: event boundary.
                if self.event.is_some() || !self.data.is_empty() {
                    events.push(SseEvent {
                        event: self.event.take(),
                        data: std::mem::take(&mut self.data).join("\n"),
                    });
                }
            } else if line.starts_with(':') {
                // Comment line (heartbeats land here); dropped per the grammar.
            } else if let Some(value) = line.strip_prefix("event:") {
                self.event = Some(value.strip_prefix(' ').unwrap_or(value).to_string());
            } else if let Some(value) = line.strip_prefix("data:") {
                self.data
                    .push(value.strip_prefix(' ').unwrap_or(value).to_string());
            }
            // Other fields (id:, retry:) are irrelevant here.
        }

        events
    }
}

/// Which SSE schema an upstream speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamFamily {
    /// Typed events: `message_start`, `content_block_delta`, `message_stop`…
    Anthropic,
    /// One JSON object per data line with `candidates[…]` and `usageMetadata`.
    Google,
    /// One JSON object per data line with `choices[…].delta`, closed by
    /// `data: [DONE]`.
    OpenAI,
}

/// The neutral meaning of one upstream event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamUpdate {
    pub text: Option<String>,
    /// Latest observed totals, not per-chunk increments.
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub stop_reason: Option<String>,
    pub done: bool,
}

/// Flatten an upstream event into a [`StreamUpdate`].
pub fn interpret(family: UpstreamFamily, event: &SseEvent) -> StreamUpdate {
    match family {
        UpstreamFamily::Anthropic => interpret_anthropic(event),
        UpstreamFamily::Google => interpret_google(event),
        UpstreamFamily::OpenAI => interpret_openai(event),
    }
}

fn interpret_anthropic(event: &SseEvent) -> StreamUpdate {
    let mut update = StreamUpdate::default();
    // The event name is authoritative, but some proxies drop it; the typed
    // `type` field inside the data is equivalent.
    let data: Value = match serde_json::from_str(&event.data) {
        Ok(v) => v,
        Err(_) => return update,
    };
    let kind = event
        .event
        .as_deref()
        .or_else(|| data["type"].as_str())
        .unwrap_or("");

    match kind {
        "message_start" => {
            update.input_tokens = data["message"]["usage"]["input_tokens"].as_u64();
            update.output_tokens = data["message"]["usage"]["output_tokens"].as_u64();
        }
        "content_block_delta" => {
            if data["delta"]["type"] == "text_delta" {
                update.text = data["delta"]["text"].as_str().map(String::from);
            }
        }
        "message_delta" => {
            update.output_tokens = data["usage"]["output_tokens"].as_u64();
            if let Some(input) = data["usage"]["input_tokens"].as_u64() {
                update.input_tokens = Some(input);
            }
            update.stop_reason = data["delta"]["stop_reason"].as_str().map(String::from);
        }
        "message_stop" => update.done = true,
        // ping / content_block_start / content_block_stop carry nothing.
        _ => {}
    }
    update
}

fn interpret_google(event: &SseEvent) -> StreamUpdate {
    let mut update = StreamUpdate::default();
    let data: Value = match serde_json::from_str(&event.data) {
        Ok(v) => v,
        Err(_) => return update,
    };

    if let Some(parts) = data["candidates"][0]["content"]["parts"].as_array() {
        let text: String = parts
            .iter()
            .filter_map(|p| p["text"].as_str())
            .collect::<Vec<_>>()
            .join("");
        if !text.is_empty() {
            update.text = Some(text);
        }
    }
    update.input_tokens = data["usageMetadata"]["promptTokenCount"].as_u64();
    update.output_tokens = data["usageMetadata"]["candidatesTokenCount"].as_u64();
    update.stop_reason = data["candidates"][0]["finishReason"]
        .as_str()
        .map(|r| normalize_google_finish(r).to_string());
    update
}

fn interpret_openai(event: &SseEvent) -> StreamUpdate {
    let mut update = StreamUpdate::default();
    if event.data.trim() == "[DONE]" {
        update.done = true;
        return update;
    }
    let data: Value = match serde_json::from_str(&event.data) {
        Ok(v) => v,
        Err(_) => return update,
    };

    update.text = data["choices"][0]["delta"]["content"]
        .as_str()
        .filter(|t| !t.is_empty())
        .map(String::from);
    update.input_tokens = data["usage"]["prompt_tokens"].as_u64();
    update.output_tokens = data["usage"]["completion_tokens"].as_u64();
    update.stop_reason = data["choices"][0]["finish_reason"].as_str().map(String::from);
    update
}

/// Google's SCREAMING finish reasons, mapped to the neutral vocabulary.
pub fn normalize_google_finish(reason: &str) -> &str {
    match reason {
        "STOP" => "stop",
        "MAX_TOKENS" => "length",
        other => other,
    }
}

/// Running token totals for one stream. Providers disagree on whether counts
/// arrive once, per chunk, or as running totals; the accumulator keeps the
/// latest value seen for each side.
#[derive(Debug, Default, Clone, Copy)]
pub struct UsageAccumulator {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl UsageAccumulator {
    pub fn observe(&mut self, update: &StreamUpdate) {
        if let Some(input) = update.input_tokens {
            self.input_tokens = input;
        }
        if let Some(output) = update.output_tokens {
            self.output_tokens = output;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // Parser
    // -----------------------------------------------------------------------

    #[test]
    fn parses_a_complete_event() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"event: message_start\ndata: {\"a\":1}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("message_start"));
        assert_eq!(events[0].data, "{\"a\":1}");
    }

    #[test]
    fn parser_state_survives_chunk_boundaries() {
        let mut parser = SseParser::new();
        // Split mid-field-name, mid-value, and before the blank line.
        assert!(parser.feed(b"eve").is_empty());
        assert!(parser.feed(b"nt: ping\nda").is_empty());
        assert!(parser.feed(b"ta: {}\n").is_empty());
        let events = parser.feed(b"\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("ping"));
    }

    #[test]
    fn multiple_events_in_one_chunk() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: one\n\ndata: two\n\ndata: three\n\n");
        assert_eq!(
            events.iter().map(|e| e.data.as_str()).collect::<Vec<_>>(),
            ["one", "two", "three"]
        );
    }

    #[test]
    fn comments_are_dropped() {
        let mut parser = SseParser::new();
        let events = parser.feed(b": heartbeat\n\ndata: real\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "real");
    }

    #[test]
    fn crlf_line_endings_are_tolerated() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: x\r\n\r\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn multi_line_data_joins_with_newline() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: line1\ndata: line2\n\n");
        assert_eq!(events[0].data, "line1\nline2");
    }

    // -----------------------------------------------------------------------
    // Anthropic interpretation
    // -----------------------------------------------------------------------

    fn event(name: Option<&str>, data: &str) -> SseEvent {
        SseEvent {
            event: name.map(String::from),
            data: data.to_string(),
        }
    }

    #[test]
    fn anthropic_message_start_yields_input_tokens() {
        let update = interpret(
            UpstreamFamily::Anthropic,
            &event(
                Some("message_start"),
                r#"{"type":"message_start","message":{"usage":{"input_tokens":42,"output_tokens":1}}}"#,
            ),
        );
        assert_eq!(update.input_tokens, Some(42));
        assert_eq!(update.output_tokens, Some(1));
    }

    #[test]
    fn anthropic_text_delta_yields_text() {
        let update = interpret(
            UpstreamFamily::Anthropic,
            &event(
                Some("content_block_delta"),
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}"#,
            ),
        );
        assert_eq!(update.text.as_deref(), Some("Hello"));
    }

    #[test]
    fn anthropic_message_delta_yields_final_usage_and_stop() {
        let update = interpret(
            UpstreamFamily::Anthropic,
            &event(
                Some("message_delta"),
                r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":128}}"#,
            ),
        );
        assert_eq!(update.output_tokens, Some(128));
        assert_eq!(update.stop_reason.as_deref(), Some("end_turn"));
    }

    #[test]
    fn anthropic_message_stop_is_done() {
        let update = interpret(
            UpstreamFamily::Anthropic,
            &event(Some("message_stop"), r#"{"type":"message_stop"}"#),
        );
        assert!(update.done);
    }

    #[test]
    fn anthropic_event_name_falls_back_to_type_field() {
        let update = interpret(
            UpstreamFamily::Anthropic,
            &event(
                None,
                r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"x"}}"#,
            ),
        );
        assert_eq!(update.text.as_deref(), Some("x"));
    }

    // -----------------------------------------------------------------------
    // Google interpretation
    // -----------------------------------------------------------------------

    #[test]
    fn google_chunk_yields_text_and_usage() {
        let update = interpret(
            UpstreamFamily::Google,
            &event(
                None,
                r#"{"candidates":[{"content":{"parts":[{"text":"Hi "},{"text":"there"}]}}],"usageMetadata":{"promptTokenCount":10,"candidatesTokenCount":5}}"#,
            ),
        );
        assert_eq!(update.text.as_deref(), Some("Hi there"));
        assert_eq!(update.input_tokens, Some(10));
        assert_eq!(update.output_tokens, Some(5));
    }

    #[test]
    fn google_finish_reason_is_normalized() {
        let update = interpret(
            UpstreamFamily::Google,
            &event(None, r#"{"candidates":[{"finishReason":"STOP"}]}"#),
        );
        assert_eq!(update.stop_reason.as_deref(), Some("stop"));
    }

    // -----------------------------------------------------------------------
    // OpenAI interpretation
    // -----------------------------------------------------------------------

    #[test]
    fn openai_delta_yields_text() {
        let update = interpret(
            UpstreamFamily::OpenAI,
            &event(None, r#"{"choices":[{"delta":{"content":"chunk"}}]}"#),
        );
        assert_eq!(update.text.as_deref(), Some("chunk"));
    }

    #[test]
    fn openai_done_sentinel_terminates() {
        let update = interpret(UpstreamFamily::OpenAI, &event(None, "[DONE]"));
        assert!(update.done);
    }

    #[test]
    fn openai_usage_chunk_yields_totals() {
        let update = interpret(
            UpstreamFamily::OpenAI,
            &event(
                None,
                r#"{"choices":[],"usage":{"prompt_tokens":7,"completion_tokens":21}}"#,
            ),
        );
        assert_eq!(update.input_tokens, Some(7));
        assert_eq!(update.output_tokens, Some(21));
    }

    // -----------------------------------------------------------------------
    // Usage accumulation
    // -----------------------------------------------------------------------

    #[test]
    fn accumulator_takes_latest_not_sum() {
        let mut usage = UsageAccumulator::default();
        usage.observe(&StreamUpdate {
            input_tokens: Some(40),
            output_tokens: Some(1),
            ..Default::default()
        });
        // Running totals: 10, then 25 - not 35.
        usage.observe(&StreamUpdate {
            output_tokens: Some(10),
            ..Default::default()
        });
        usage.observe(&StreamUpdate {
            output_tokens: Some(25),
            ..Default::default()
        });
        assert_eq!(usage.input_tokens, 40);
        assert_eq!(usage.output_tokens, 25);
    }

    #[test]
    fn accumulator_keeps_earlier_values_when_absent() {
        let mut usage = UsageAccumulator::default();
        usage.observe(&StreamUpdate {
            input_tokens: Some(12),
            ..Default::default()
        });
        usage.observe(&StreamUpdate {
            text: Some("x".into()),
            ..Default::default()
        });
        assert_eq!(usage.input_tokens, 12);
    }
}
