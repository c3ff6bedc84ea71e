//! Classification-bypassing overrides.
//!
//! Evaluated in a fixed order, first match wins:
//! heartbeat prompt → force-model (header or inline `/alias` prefix) →
//! sub-agent tier inheritance from a parent request → tool-calling floor →
//! none. Each variant carries exactly what the router needs.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::{
    catalog::ModelRegistry,
    error::ProxyError,
    ingress::{ControlHeaders, ParsedRequest},
};

/// Anchored heartbeat / summary prompts. These are cheap liveness or recap
/// turns - no reason to burn a capable model on them.
static HEARTBEAT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)^\s*(ping|pong|heartbeat)\s*[.!?]?\s*$",
        r"(?i)^\s*are you (there|alive|up)\s*\??\s*$",
        r"(?i)^\s*(status|health)\s*check\s*[.!?]?\s*$",
        r"(?i)^\s*(summarize|summarise|recap)\b",
        r"(?i)^\s*(tldr|tl;dr)\b",
        r"(?i)^\s*give me a (brief |short |quick )?summary\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("heartbeat pattern is valid"))
    .collect()
});

/// A routing directive derived from prompt content, request headers, or the
/// relationship to a parent request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Override {
    None,
    /// Route to the cheapest configured model.
    Heartbeat,
    /// Route to this exact model.
    ForceModel(String),
    /// Floor the effective tier at `standard`.
    ToolCalling,
    /// Use the parent request's model unchanged.
    SubAgentInherit(String),
    /// Use the model one hierarchy rung below the parent's.
    SubAgentStepdown(String),
}

impl Override {
    /// Stable kind string for routing-log entries and reasoning text.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Heartbeat => "heartbeat",
            Self::ForceModel(_) => "force_model",
            Self::ToolCalling => "tool_calling",
            Self::SubAgentInherit(_) => "sub_agent_inherit",
            Self::SubAgentStepdown(_) => "sub_agent_stepdown",
        }
    }

    /// The model this override pins, when it pins one.
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::ForceModel(id) | Self::SubAgentInherit(id) | Self::SubAgentStepdown(id) => {
                Some(id)
            }
            _ => None,
        }
    }
}

pub fn is_heartbeat(text: &str) -> bool {
    HEARTBEAT_PATTERNS.iter().any(|p| p.is_match(text))
}

/// Resolve a force-model alias from the header or an inline `/alias` prefix.
///
/// An unknown header alias is a client error (400); an unknown inline prefix
/// is just message text and falls through.
fn force_model(
    parsed: &ParsedRequest,
    control: &ControlHeaders,
    aliases: &HashMap<String, String>,
) -> Result<Option<String>, ProxyError> {
    if let Some(alias) = &control.force_model {
        return match aliases.get(alias.as_str()) {
            Some(id) => Ok(Some(id.clone())),
            None => Err(ProxyError::InvalidRequest(format!(
                "unknown force-model alias `{alias}`"
            ))),
        };
    }

    let text = parsed.last_user_text();
    if let Some(rest) = text.strip_prefix('/') {
        let token = rest.split_whitespace().next().unwrap_or("");
        if let Some(id) = aliases.get(token) {
            return Ok(Some(id.clone()));
        }
    }
    Ok(None)
}

/// Run the ordered override evaluation.
///
/// `parent_model` resolves a parent request id to the model that served it -
/// backed by the routing log. An id that does not resolve is logged and the
/// evaluation continues as though no parent was named.
pub fn detect(
    parsed: &ParsedRequest,
    control: &ControlHeaders,
    aliases: &HashMap<String, String>,
    registry: &ModelRegistry,
    parent_model: impl Fn(&str) -> Option<String>,
) -> Result<Override, ProxyError> {
    if is_heartbeat(parsed.last_user_text()) {
        return Ok(Override::Heartbeat);
    }

    if let Some(id) = force_model(parsed, control, aliases)? {
        return Ok(Override::ForceModel(id));
    }

    if let Some(parent_id) = &control.parent_request_id {
        match parent_model(parent_id) {
            Some(model) => {
                // A parent outside the registered hierarchy inherits
                // unchanged rather than synthesizing a step-down.
                if !registry.contains(&model) {
                    return Ok(Override::SubAgentInherit(model));
                }
                return Ok(match registry.step_down(&model) {
                    Some(below) => Override::SubAgentStepdown(below.to_string()),
                    None => Override::SubAgentInherit(model),
                });
            }
            None => {
                tracing::warn!(parent_request_id = %parent_id, "unknown parent request id - ignoring sub-agent inheritance");
            }
        }
    }

    if parsed.has_tools {
        return Ok(Override::ToolCalling);
    }

    Ok(Override::None)
}
