//! Request routing - the brain of claw-throttle.
//!
//! Given a classification, an override, and the live availability picture
//! (configured providers, rate-limit cooldowns, session pins), pick the
//! cheapest model capable of handling the request:
//!
//! 1. Overrides first. A pinned-model override (force, sub-agent) is honored
//!    when available; a rate-limited target degrades to normal resolution
//!    while keeping the override tag for logging. Heartbeats resolve to the
//!    cheapest configured model outright.
//! 2. Effective-tier adjustments: the tool-calling floor lifts `simple` to
//!    `standard`, and low confidence (< 0.70) steps the tier up one.
//! 3. The mode/tier preference list is walked in order, skipping models
//!    whose provider is unconfigured or whose id is cooling down.
//! 4. Exhausted lists fall back to the cheapest globally available model.
//! 5. A session pin recorded after the decision substitutes the pinned model
//!    when its tier is higher; the pin itself only ever moves up.

use crate::{
    catalog::{ModelRegistry, Provider, RoutingTable},
    classify::{ClassificationResult, Tier},
    config::{Config, Mode},
    error::ProxyError,
    overrides::Override,
    rate_limit::RateLimiter,
    session::{SessionStore, FAILURE_WINDOW},
};

/// Confidence below this steps the tier up one.
pub const CONFIDENCE_STEP_UP_THRESHOLD: f64 = 0.70;

/// Everything the router reads. All shared singletons; the router never
/// holds two store locks at once.
pub struct RoutingInputs<'a> {
    pub registry: &'a ModelRegistry,
    pub table: &'a RoutingTable,
    pub config: &'a Config,
    pub rate_limiter: &'a RateLimiter,
    pub sessions: &'a SessionStore,
}

impl RoutingInputs<'_> {
    /// Configured provider, known id, and not cooling down.
    fn is_available(&self, model_id: &str) -> bool {
        match self.registry.get(model_id) {
            Some(spec) => {
                self.config.is_configured(spec.provider)
                    && !self.rate_limiter.is_rate_limited(model_id)
            }
            None => false,
        }
    }
}

/// The routing verdict for one request.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub model_id: String,
    pub provider: Provider,
    pub tier: Tier,
    pub mode: Mode,
    pub override_: Override,
    /// Human-readable decision trail, surfaced on `X-Throttle-*` headers.
    pub reasoning: String,
    pub session_pinned: bool,
}

/// Compute the routing decision for a classified request.
pub fn decide(
    inputs: &RoutingInputs<'_>,
    classification: &ClassificationResult,
    override_: Override,
    session_id: Option<&str>,
) -> Result<RoutingDecision, ProxyError> {
    let mode = inputs.config.mode;
    let mut notes: Vec<String> = Vec::new();
    let mut tier = classification.tier;

    // One-shot escalation after a failure in this session, applied before
    // any table lookup.
    if let Some(id) = session_id {
        if inputs.sessions.has_recent_failure(id, FAILURE_WINDOW) && tier < Tier::Complex {
            tier = tier.step_up();
            notes.push("recent session failure escalation".into());
        }
    }

    // Overrides that pin a concrete model short-circuit tier resolution.
    let pinned_target: Option<(String, Tier)> = match &override_ {
        Override::Heartbeat => {
            let cheapest = inputs
                .registry
                .cheapest_where(|m| inputs.is_available(&m.id))
                .ok_or(ProxyError::NoAvailableModel)?;
            notes.push("heartbeat routed to cheapest configured model".into());
            Some((cheapest.id.clone(), Tier::Simple))
        }
        Override::ForceModel(id)
        | Override::SubAgentInherit(id)
        | Override::SubAgentStepdown(id) => {
            if inputs.is_available(id) {
                notes.push(format!("{} override", override_.kind()));
                Some((id.clone(), tier))
            } else {
                // Keep the tag for logging, resolve as if no override.
                notes.push(format!(
                    "{} target `{id}` unavailable, resolving normally",
                    override_.kind()
                ));
                None
            }
        }
        Override::ToolCalling | Override::None => None,
    };

    let (model_id, tier) = match pinned_target {
        Some(pin) => pin,
        None => {
            if override_ == Override::ToolCalling && tier < Tier::Standard {
                tier = Tier::Standard;
                notes.push("tool_calling tier floor".into());
            }
            if classification.confidence < CONFIDENCE_STEP_UP_THRESHOLD && tier < Tier::Complex {
                tier = tier.step_up();
                notes.push(format!(
                    "confidence step-up ({:.2} < {CONFIDENCE_STEP_UP_THRESHOLD:.2})",
                    classification.confidence
                ));
            }

            let preference = inputs.table.preference(mode, tier);
            let chosen = preference
                .iter()
                .find(|id| inputs.is_available(id))
                .cloned();

            let model_id = match chosen {
                Some(id) => id,
                None => {
                    notes.push("preference list exhausted, global cheapest fallback".into());
                    inputs
                        .registry
                        .cheapest_where(|m| inputs.is_available(&m.id))
                        .map(|m| m.id.clone())
                        .ok_or(ProxyError::NoAvailableModel)?
                }
            };
            (model_id, tier)
        }
    };

    // Session pin: record the decision, substitute a higher pin. Explicit
    // model overrides bypass substitution - they are deliberate bypasses -
    // but still refresh the session so the pin cannot decay mid-conversation.
    let mut model_id = model_id;
    let mut tier = tier;
    let mut session_pinned = false;
    if let Some(id) = session_id {
        let (effective_model, effective_tier) = inputs.sessions.set(id, &model_id, tier);
        let bypass_pin = override_.target().is_some() || override_ == Override::Heartbeat;
        if !bypass_pin && effective_model != model_id {
            notes.push(format!("session-pinned from {model_id}"));
            model_id = effective_model;
            tier = effective_tier;
            session_pinned = true;
        }
    }

    let spec = inputs
        .registry
        .get(&model_id)
        .ok_or(ProxyError::NoAvailableModel)?;

    let mut reasoning = format!(
        "mode={mode} tier={tier} score={:.3} confidence={:.3}",
        classification.score, classification.confidence
    );
    if !notes.is_empty() {
        reasoning.push_str("; ");
        reasoning.push_str(&notes.join("; "));
    }

    Ok(RoutingDecision {
        model_id,
        provider: spec.provider,
        tier,
        mode,
        override_,
        reasoning,
        session_pinned,
    })
}
