//! Per-session model pinning.
//!
//! A client that supplies `X-Session-ID` gets a sticky model: once a session
//! has seen a tier, later requests in that session never route below it. The
//! pin only moves up (`simple < standard < complex`); equal-or-lower
//! decisions keep the existing pin. A one-shot failure marker lets the next
//! request in a failed session escalate one tier before table lookup.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::classify::Tier;

/// Sessions idle longer than this are evicted (default 30 minutes).
pub const SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// How far back a `mark_failed` counts as "recent".
pub const FAILURE_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Interval of the background cleanup tick.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
struct SessionEntry {
    model_id: String,
    tier: Tier,
    last_used_at: Instant,
    last_failed_at: Option<Instant>,
}

/// Thread-safe session map. Shared via `Arc`; every mutation happens under
/// dashmap's internal shard locks, so callers never synchronize externally.
#[derive(Debug)]
pub struct SessionStore {
    sessions: DashMap<String, SessionEntry>,
    idle_timeout: Duration,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::with_timeout(SESSION_IDLE_TIMEOUT)
    }

    pub fn with_timeout(idle_timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            idle_timeout,
        }
    }

    /// Current pin, or `None`. Expired entries are removed on read.
    pub fn get(&self, id: &str) -> Option<(String, Tier)> {
        let expired = match self.sessions.get(id) {
            Some(entry) => entry.last_used_at.elapsed() >= self.idle_timeout,
            None => return None,
        };
        if expired {
            self.sessions.remove(id);
            return None;
        }
        self.sessions
            .get(id)
            .map(|e| (e.model_id.clone(), e.tier))
    }

    /// Record a routing decision for `id` and return the effective pin.
    ///
    /// A strictly higher tier replaces the pin; anything else keeps the
    /// existing model and tier. `last_used_at` refreshes either way, so an
    /// active session never expires mid-conversation.
    pub fn set(&self, id: &str, model_id: &str, tier: Tier) -> (String, Tier) {
        let mut entry = self
            .sessions
            .entry(id.to_string())
            .or_insert_with(|| SessionEntry {
                model_id: model_id.to_string(),
                tier,
                last_used_at: Instant::now(),
                last_failed_at: None,
            });

        if tier > entry.tier {
            entry.model_id = model_id.to_string();
            entry.tier = tier;
        }
        entry.last_used_at = Instant::now();
        (entry.model_id.clone(), entry.tier)
    }

    /// Record that a request in this session failed. The next classify phase
    /// for the session applies a one-shot tier escalation.
    pub fn mark_failed(&self, id: &str) {
        if let Some(mut entry) = self.sessions.get_mut(id) {
            entry.last_failed_at = Some(Instant::now());
        }
    }

    /// One-shot read of the failure marker: returns `true` (and clears the
    /// marker) when a failure was recorded within `window`.
    pub fn has_recent_failure(&self, id: &str, window: Duration) -> bool {
        let Some(mut entry) = self.sessions.get_mut(id) else {
            return false;
        };
        match entry.last_failed_at {
            Some(at) if at.elapsed() < window => {
                entry.last_failed_at = None;
                true
            }
            _ => false,
        }
    }

    /// Evict entries idle past the timeout. Called from the background tick.
    pub fn cleanup(&self) {
        self.sessions
            .retain(|_, entry| entry.last_used_at.elapsed() < self.idle_timeout);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}
