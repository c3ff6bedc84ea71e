//! Upstream rate-limit cooldowns and Anthropic dual-key failover state.
//!
//! Two small singletons, both shared via `Arc` and internally synchronized:
//!
//! - [`RateLimiter`] puts a model id on a 60-second cooldown after an
//!   upstream 429. The router filters preference lists through it.
//! - [`DualKeyState`] tracks per-key-type cooldowns for the Anthropic family
//!   (setup token vs. enterprise key) so a 429/401 on one credential fails
//!   over transparently to the other.
//!
//! Entries are pruned lazily on read; a logically-expired cooldown behaves
//! exactly as an absent one.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Cooldown applied to a model after an upstream 429.
pub const MODEL_COOLDOWN: Duration = Duration::from_secs(60);

/// Cooldown applied to an Anthropic key type after a 429/401.
pub const KEY_COOLDOWN: Duration = Duration::from_secs(60);

/// Per-model cooldown map: model id → expiry.
#[derive(Debug)]
pub struct RateLimiter {
    cooldowns: DashMap<String, Instant>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            cooldowns: DashMap::new(),
        }
    }

    /// Put `model_id` on cooldown. Concurrent marks race benignly: the last
    /// write wins and both expiries are within the same window anyway.
    pub fn mark_rate_limited(&self, model_id: &str, cooldown: Duration) {
        self.cooldowns
            .insert(model_id.to_string(), Instant::now() + cooldown);
        tracing::warn!(model = model_id, cooldown_secs = cooldown.as_secs(), "model on rate-limit cooldown");
    }

    /// True while the cooldown is active. Expired entries are pruned here.
    pub fn is_rate_limited(&self, model_id: &str) -> bool {
        let expired = match self.cooldowns.get(model_id) {
            Some(expires_at) => *expires_at <= Instant::now(),
            None => return false,
        };
        if expired {
            self.cooldowns.remove(model_id);
            return false;
        }
        true
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Which Anthropic credential a request went out with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum KeyType {
    #[serde(rename = "setup-token")]
    SetupToken,
    #[serde(rename = "enterprise")]
    Enterprise,
}

impl std::fmt::Display for KeyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::SetupToken => "setup-token",
            Self::Enterprise => "enterprise",
        })
    }
}

/// The dispatch order for one Anthropic request: a primary key type and an
/// optional fallback to retry once on 429/401.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPlan {
    pub primary: KeyType,
    pub fallback: Option<KeyType>,
}

#[derive(Debug, Default)]
struct KeyCooldowns {
    setup_until: Option<Instant>,
    enterprise_until: Option<Instant>,
}

/// Anthropic-specific: cooldown expiries per key type plus the operator's
/// preference for which key leads.
#[derive(Debug)]
pub struct DualKeyState {
    cooldowns: std::sync::Mutex<KeyCooldowns>,
    prefer_setup_token: bool,
}

impl DualKeyState {
    pub fn new(prefer_setup_token: bool) -> Self {
        Self {
            cooldowns: std::sync::Mutex::new(KeyCooldowns::default()),
            prefer_setup_token,
        }
    }

    /// Start a cooldown for `key` after an upstream 429/401.
    pub fn mark_cooling(&self, key: KeyType, cooldown: Duration) {
        let mut state = self.cooldowns.lock().expect("dual-key lock poisoned");
        let until = Instant::now() + cooldown;
        match key {
            KeyType::SetupToken => state.setup_until = Some(until),
            KeyType::Enterprise => state.enterprise_until = Some(until),
        }
        tracing::warn!(key_type = %key, cooldown_secs = cooldown.as_secs(), "anthropic key on cooldown");
    }

    pub fn is_cooling(&self, key: KeyType) -> bool {
        let mut state = self.cooldowns.lock().expect("dual-key lock poisoned");
        let slot = match key {
            KeyType::SetupToken => &mut state.setup_until,
            KeyType::Enterprise => &mut state.enterprise_until,
        };
        match slot {
            Some(until) if *until <= Instant::now() => {
                *slot = None;
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Resolve the (primary, fallback) order for a request, given which key
    /// types actually have a credential configured.
    ///
    /// - Preferred key leads when not cooling; the other is the fallback.
    /// - A cooling preferred key hands primary to the other key with no
    ///   fallback (there is nothing left to fail over to).
    /// - When every available key is cooling, the preferred one is attempted
    ///   anyway so the client sees the upstream's own answer.
    pub fn plan(&self, setup_available: bool, enterprise_available: bool) -> Option<KeyPlan> {
        let order: [KeyType; 2] = if self.prefer_setup_token {
            [KeyType::SetupToken, KeyType::Enterprise]
        } else {
            [KeyType::Enterprise, KeyType::SetupToken]
        };
        let available = |k: KeyType| match k {
            KeyType::SetupToken => setup_available,
            KeyType::Enterprise => enterprise_available,
        };

        let candidates: Vec<KeyType> = order.into_iter().filter(|k| available(*k)).collect();
        let ready: Vec<KeyType> = candidates
            .iter()
            .copied()
            .filter(|k| !self.is_cooling(*k))
            .collect();

        match (candidates.as_slice(), ready.as_slice()) {
            ([], _) => None,
            // Nothing ready - best effort with the preferred available key.
            (&[first, ..], []) => Some(KeyPlan { primary: first, fallback: None }),
            (_, &[only]) => Some(KeyPlan { primary: only, fallback: None }),
            (_, &[first, second, ..]) => Some(KeyPlan { primary: first, fallback: Some(second) }),
        }
    }
}
