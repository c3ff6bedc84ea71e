//! Inbound request decoding.
//!
//! Two chat-API shapes are accepted - Anthropic Messages (`/v1/messages`) and
//! OpenAI ChatCompletions (`/v1/chat/completions`). Both decode to the same
//! [`ParsedRequest`]; the Messages shape additionally keeps the raw body so
//! tool definitions, `thinking`, `metadata` and tool-content blocks can round
//! trip verbatim when the chosen upstream is Anthropic-family.

use axum::http::HeaderMap;
use serde_json::Value;

use crate::error::ProxyError;

/// Which wire dialect the client spoke. Drives outbound re-encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressFormat {
    /// Anthropic Messages style.
    Anthropic,
    /// OpenAI ChatCompletions style.
    OpenAI,
}

impl std::fmt::Display for IngressFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Anthropic => "anthropic",
            Self::OpenAI => "openai",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A provider-neutral message. Tool-content blocks are not represented here -
/// they ride along in the retained raw body for passthrough dispatch.
#[derive(Debug, Clone)]
pub struct NeutralMessage {
    pub role: Role,
    pub content: String,
}

/// Default max output tokens when the caller omits the field. Anthropic
/// requires it; a generous ceiling suits conversational use.
pub const DEFAULT_MAX_TOKENS: u64 = 8_192;

/// The neutral decoded request every pipeline stage works from.
#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub format: IngressFormat,
    pub messages: Vec<NeutralMessage>,
    pub system: Option<String>,
    pub max_tokens: u64,
    pub temperature: Option<f64>,
    pub stream: bool,
    /// True when the request carries tool definitions (routing floor applies;
    /// the definitions themselves pass through untouched).
    pub has_tools: bool,
    /// Original Messages-style body, kept for Anthropic passthrough.
    pub raw_body: Option<Value>,
}

impl ParsedRequest {
    /// The last user utterance - the classifier's subject.
    pub fn last_user_text(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }
}

/// Routing-control headers read off the inbound request.
#[derive(Debug, Clone, Default)]
pub struct ControlHeaders {
    pub force_model: Option<String>,
    pub session_id: Option<String>,
    pub client_id: Option<String>,
    pub parent_request_id: Option<String>,
    pub anthropic_version: Option<String>,
    pub anthropic_beta: Option<String>,
}

impl ControlHeaders {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let read = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(String::from)
        };
        Self {
            force_model: read("x-throttle-force-model"),
            session_id: read("x-session-id"),
            client_id: read("x-client-id"),
            parent_request_id: read("x-parent-request-id"),
            anthropic_version: read("anthropic-version"),
            anthropic_beta: read("anthropic-beta"),
        }
    }
}

fn parse_role(role: &str) -> Result<Role, ProxyError> {
    match role {
        "user" => Ok(Role::User),
        "assistant" => Ok(Role::Assistant),
        other => Err(ProxyError::InvalidRequest(format!(
            "unsupported message role `{other}`"
        ))),
    }
}

/// Flatten Messages-style content (plain string or block array) to text.
/// Non-text blocks contribute nothing here; they survive in the raw body.
fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter(|b| b["type"] == "text")
            .filter_map(|b| b["text"].as_str())
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// Decode an Anthropic Messages request body.
pub fn parse_messages_request(body: Value) -> Result<ParsedRequest, ProxyError> {
    let raw_messages = body["messages"]
        .as_array()
        .ok_or_else(|| ProxyError::InvalidRequest("`messages` array is required".into()))?;

    let mut messages = Vec::with_capacity(raw_messages.len());
    for msg in raw_messages {
        let role = parse_role(msg["role"].as_str().unwrap_or(""))?;
        messages.push(NeutralMessage {
            role,
            content: content_text(&msg["content"]),
        });
    }
    if messages.is_empty() {
        return Err(ProxyError::InvalidRequest("`messages` must not be empty".into()));
    }

    // `system` may be a plain string or an array of text blocks.
    let system = match &body["system"] {
        Value::Null => None,
        value => Some(content_text(value)).filter(|s| !s.is_empty()),
    };

    let has_tools = body["tools"].as_array().is_some_and(|t| !t.is_empty());

    Ok(ParsedRequest {
        format: IngressFormat::Anthropic,
        system,
        max_tokens: body["max_tokens"].as_u64().unwrap_or(DEFAULT_MAX_TOKENS),
        temperature: body["temperature"].as_f64(),
        stream: body["stream"].as_bool().unwrap_or(false),
        has_tools,
        messages,
        raw_body: Some(body),
    })
}

/// Decode an OpenAI ChatCompletions request body. A leading `system` role is
/// folded into the system prompt; multiple system messages concatenate.
pub fn parse_chat_request(body: Value) -> Result<ParsedRequest, ProxyError> {
    let raw_messages = body["messages"]
        .as_array()
        .ok_or_else(|| ProxyError::InvalidRequest("`messages` array is required".into()))?;

    let mut system_parts: Vec<String> = Vec::new();
    let mut messages = Vec::with_capacity(raw_messages.len());
    for msg in raw_messages {
        let role = msg["role"].as_str().unwrap_or("");
        if role == "system" {
            if let Some(content) = msg["content"].as_str() {
                system_parts.push(content.to_string());
            }
            continue;
        }
        messages.push(NeutralMessage {
            role: parse_role(role)?,
            content: content_text(&msg["content"]),
        });
    }
    if messages.is_empty() {
        return Err(ProxyError::InvalidRequest("`messages` must not be empty".into()));
    }

    let has_tools = body["tools"].as_array().is_some_and(|t| !t.is_empty())
        || body["functions"].as_array().is_some_and(|t| !t.is_empty());

    Ok(ParsedRequest {
        format: IngressFormat::OpenAI,
        system: (!system_parts.is_empty()).then(|| system_parts.join("\n\n")),
        max_tokens: body["max_tokens"].as_u64().unwrap_or(DEFAULT_MAX_TOKENS),
        temperature: body["temperature"].as_f64(),
        stream: body["stream"].as_bool().unwrap_or(false),
        has_tools,
        messages,
        raw_body: None,
    })
}
