//! Provider adapters - one per upstream wire protocol.
//!
//! Three adapters cover eight provider tags: Anthropic speaks the Messages
//! API, Google speaks Gemini generate-content, and everything else
//! (OpenAI, DeepSeek, xAI, Moonshot, Mistral, Ollama) shares the OpenAI
//! chat-completions shape and differs only in base URL + key header. Protocol
//! details - auth headers, endpoint paths, schema translation - live entirely
//! in the adapter modules; the dispatcher never builds provider JSON itself.

mod anthropic;
mod google;
mod openai;

pub use anthropic::{AnthropicAuth, AnthropicClient};
pub use google::GoogleClient;
pub use openai::OpenAICompatClient;

use std::pin::Pin;
use std::sync::LazyLock;

use bytes::Bytes;
use futures_util::Stream;

use crate::{
    catalog::Provider,
    rate_limit::KeyType,
    sse::UpstreamFamily,
};

/// A `Send`-able, heap-allocated SSE byte stream from an upstream.
pub type SseStream = Pin<Box<dyn Stream<Item = anyhow::Result<Bytes>> + Send>>;

/// Default timeout for buffered (non-streaming) upstream calls. Streaming
/// requests use a connect-level timeout only - the body arrives incrementally.
pub const UPSTREAM_TIMEOUT_MS: u64 = 120_000;

/// How much upstream error body survives into errors and logs.
const BODY_EXCERPT_LEN: usize = 300;

/// An upstream call that did not produce a usable response.
#[derive(Debug)]
pub enum UpstreamError {
    /// Non-2xx response; the body excerpt is kept for the client.
    Http { status: u16, body: String },
    /// Connect/transport failure before any status line.
    Network(String),
}

impl UpstreamError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            Self::Network(_) => None,
        }
    }

    pub fn body(&self) -> &str {
        match self {
            Self::Http { body, .. } => body,
            Self::Network(msg) => msg,
        }
    }
}

impl std::fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http { status, body } => write!(f, "HTTP {status}: {body}"),
            Self::Network(msg) => write!(f, "network error: {msg}"),
        }
    }
}

/// Truncate an upstream body for error surfaces.
pub(crate) fn excerpt(body: &str) -> String {
    if body.len() <= BODY_EXCERPT_LEN {
        body.to_string()
    } else {
        let mut end = BODY_EXCERPT_LEN;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &body[..end])
    }
}

/// The neutral decoded upstream response.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Neutral vocabulary: `stop`, `length`, or the upstream's own word.
    pub finish_reason: String,
    pub model_id: String,
    pub provider: Provider,
    pub latency_ms: u64,
    /// Which Anthropic credential served the request, when applicable.
    pub key_type: Option<KeyType>,
    /// True when the response came from the dual-key fallback attempt.
    pub failover: bool,
}

/// Which SSE schema a provider's stream speaks.
pub fn stream_family(provider: Provider) -> UpstreamFamily {
    match provider {
        Provider::Anthropic => UpstreamFamily::Anthropic,
        Provider::Google => UpstreamFamily::Google,
        _ => UpstreamFamily::OpenAI,
    }
}

static BPE: LazyLock<tiktoken_rs::CoreBPE> =
    LazyLock::new(|| tiktoken_rs::cl100k_base().expect("bundled cl100k_base vocabulary loads"));

/// Local token estimate for upstreams that omit usage fields. Close enough
/// for cost reporting; never used when the upstream reports real counts.
pub fn estimate_tokens(text: &str) -> u64 {
    BPE.encode_ordinary(text).len() as u64
}
