//! In-flight request deduplication and short-TTL response replay.
//!
//! Identical non-streaming requests arriving close together collapse onto a
//! single upstream call. The key is content-derived: the first 16 hex chars
//! of SHA-256 over the JSON encoding of `{system, messages}`, with one
//! leading `[DAY YYYY-MM-DD HH:MM TZ]` prefix stripped per message so agents
//! that stamp every turn still deduplicate.
//!
//! Concurrency contract: the producer-vs-waiter decision is atomic - both
//! maps live behind one mutex and a key is in at most one of them. Waiters
//! park on a `tokio::sync::watch` receiver; the producer resolves it once
//! for everyone, and a producer that dies drops the sender, which waiters
//! observe as "proceed fresh".

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use bytes::Bytes;
use regex::Regex;
use sha2::{Digest, Sha256};
use tokio::sync::watch;

use crate::ingress::NeutralMessage;

/// Completed entries are replayable for this long (default 30 seconds).
pub const COMPLETED_TTL: Duration = Duration::from_secs(30);

/// Leading timestamp prefix stripped before hashing. Exactly one prefix is
/// stripped; repeated or mid-message occurrences are left alone.
static TIMESTAMP_PREFIX: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
    Regex::new(r"(?i)^\[(MON|TUE|WED|THU|FRI|SAT|SUN)\s+\d{4}-\d{2}-\d{2}\s+\d{2}:\d{2}\s+[^\]]+\]\s*")
        .expect("timestamp prefix pattern is valid")
});

/// Compute the canonical dedup key for a request.
pub fn canonical_key(system: Option<&str>, messages: &[NeutralMessage]) -> String {
    let canonical_messages: Vec<serde_json::Value> = messages
        .iter()
        .map(|m| {
            serde_json::json!({
                "role": m.role.as_str(),
                "content": TIMESTAMP_PREFIX.replace(&m.content, ""),
            })
        })
        .collect();
    let payload = serde_json::json!({
        "system": system,
        "messages": canonical_messages,
    });

    let digest = Sha256::digest(payload.to_string().as_bytes());
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

/// A finished response, replayed byte-for-byte to later arrivals.
#[derive(Debug)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

#[derive(Debug)]
struct CompletedEntry {
    response: Arc<CachedResponse>,
    completed_at: Instant,
}

#[derive(Debug)]
struct Inner {
    completed: HashMap<String, CompletedEntry>,
    in_flight: HashMap<String, watch::Receiver<Option<Arc<CachedResponse>>>>,
}

/// What a request holds after claiming its key.
pub enum Claim {
    /// A fresh completed entry exists - replay it immediately.
    Replay(Arc<CachedResponse>),
    /// Another request is producing this key - await it.
    Wait(watch::Receiver<Option<Arc<CachedResponse>>>),
    /// This request is the producer.
    Produce(ProducerGuard),
}

#[derive(Debug)]
pub struct DedupCache {
    inner: Arc<Mutex<Inner>>,
    ttl: Duration,
}

impl DedupCache {
    pub fn new() -> Self {
        Self::with_ttl(COMPLETED_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                completed: HashMap::new(),
                in_flight: HashMap::new(),
            })),
            ttl,
        }
    }

    /// Atomically resolve this request's role for `key`.
    pub fn claim(&self, key: &str) -> Claim {
        let mut inner = self.inner.lock().expect("dedup lock poisoned");

        let stale = match inner.completed.get(key) {
            Some(entry) if entry.completed_at.elapsed() < self.ttl => {
                return Claim::Replay(entry.response.clone());
            }
            Some(_) => true,
            None => false,
        };
        if stale {
            inner.completed.remove(key);
        }

        if let Some(rx) = inner.in_flight.get(key) {
            return Claim::Wait(rx.clone());
        }

        let (tx, rx) = watch::channel(None);
        inner.in_flight.insert(key.to_string(), rx);
        Claim::Produce(ProducerGuard {
            key: key.to_string(),
            tx: Some(tx),
            inner: Arc::clone(&self.inner),
            ttl: self.ttl,
        })
    }

    /// Await the in-flight producer. `None` means the producer failed and the
    /// caller should proceed as a fresh request.
    pub async fn await_producer(
        mut rx: watch::Receiver<Option<Arc<CachedResponse>>>,
    ) -> Option<Arc<CachedResponse>> {
        loop {
            if let Some(response) = rx.borrow().as_ref() {
                return Some(response.clone());
            }
            if rx.changed().await.is_err() {
                // Sender dropped without a value: the producer errored out.
                return rx.borrow().clone();
            }
        }
    }

    #[cfg(test)]
    fn counts(&self) -> (usize, usize) {
        let inner = self.inner.lock().unwrap();
        (inner.completed.len(), inner.in_flight.len())
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Held by the single producer for a key. [`complete`][Self::complete] stores
/// the response and wakes every waiter; dropping without completing rejects
/// the waiters and clears the in-flight slot.
pub struct ProducerGuard {
    key: String,
    tx: Option<watch::Sender<Option<Arc<CachedResponse>>>>,
    inner: Arc<Mutex<Inner>>,
    ttl: Duration,
}

impl ProducerGuard {
    /// Publish the finished response: store the completed entry, drop the
    /// in-flight slot, wake waiters, and opportunistically prune stale
    /// completed entries.
    pub fn complete(mut self, response: CachedResponse) -> Arc<CachedResponse> {
        let response = Arc::new(response);
        {
            let mut inner = self.inner.lock().expect("dedup lock poisoned");
            inner.in_flight.remove(&self.key);
            inner.completed.insert(
                self.key.clone(),
                CompletedEntry {
                    response: response.clone(),
                    completed_at: Instant::now(),
                },
            );
            let ttl = self.ttl;
            inner.completed.retain(|_, e| e.completed_at.elapsed() < ttl);
        }
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(response.clone()));
        }
        response
    }
}

impl Drop for ProducerGuard {
    fn drop(&mut self) {
        // Reached only when complete() was not called: failure path.
        if self.tx.is_some() {
            let mut inner = self.inner.lock().expect("dedup lock poisoned");
            inner.in_flight.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingress::Role;

    fn msg(role: Role, content: &str) -> NeutralMessage {
        NeutralMessage {
            role,
            content: content.to_string(),
        }
    }

    fn response(body: &str) -> CachedResponse {
        CachedResponse {
            status: 200,
            headers: vec![("content-type".into(), "application/json".into())],
            body: Bytes::from(body.to_string()),
        }
    }

    // -----------------------------------------------------------------------
    // Canonical key
    // -----------------------------------------------------------------------

    #[test]
    fn key_is_16_hex_chars() {
        let key = canonical_key(None, &[msg(Role::User, "hello")]);
        assert_eq!(key.len(), 16);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn identical_requests_share_a_key() {
        let a = canonical_key(Some("sys"), &[msg(Role::User, "hello")]);
        let b = canonical_key(Some("sys"), &[msg(Role::User, "hello")]);
        assert_eq!(a, b);
    }

    #[test]
    fn different_system_prompts_differ() {
        let a = canonical_key(Some("a"), &[msg(Role::User, "hello")]);
        let b = canonical_key(Some("b"), &[msg(Role::User, "hello")]);
        assert_ne!(a, b);
    }

    #[test]
    fn role_order_is_significant() {
        let a = canonical_key(None, &[msg(Role::User, "x"), msg(Role::Assistant, "y")]);
        let b = canonical_key(None, &[msg(Role::Assistant, "y"), msg(Role::User, "x")]);
        assert_ne!(a, b);
    }

    #[test]
    fn leading_timestamp_prefix_is_stripped() {
        let plain = canonical_key(None, &[msg(Role::User, "status update")]);
        let stamped = canonical_key(
            None,
            &[msg(Role::User, "[MON 2026-08-01 11:30 UTC] status update")],
        );
        let lowercase = canonical_key(
            None,
            &[msg(Role::User, "[mon 2026-08-01 11:30 utc] status update")],
        );
        assert_eq!(plain, stamped);
        assert_eq!(plain, lowercase);
    }

    #[test]
    fn mid_message_timestamp_is_not_stripped() {
        let plain = canonical_key(None, &[msg(Role::User, "status update")]);
        let embedded = canonical_key(
            None,
            &[msg(Role::User, "status [TUE 2026-08-01 11:30 UTC] update")],
        );
        assert_ne!(plain, embedded);
    }

    // -----------------------------------------------------------------------
    // Claim semantics
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn first_claim_is_producer() {
        let cache = DedupCache::new();
        match cache.claim("k1") {
            Claim::Produce(_) => {}
            _ => panic!("first claim must produce"),
        }
    }

    #[tokio::test]
    async fn second_claim_waits_then_sees_producer_response() {
        let cache = DedupCache::new();
        let Claim::Produce(guard) = cache.claim("k1") else {
            panic!("expected producer");
        };
        let Claim::Wait(rx) = cache.claim("k1") else {
            panic!("expected waiter while in flight");
        };

        let waiter = tokio::spawn(DedupCache::await_producer(rx));
        guard.complete(response("{\"answer\":42}"));

        let replayed = waiter.await.unwrap().expect("waiter must see the response");
        assert_eq!(replayed.status, 200);
        assert_eq!(replayed.body.as_ref(), b"{\"answer\":42}");
    }

    #[tokio::test]
    async fn completed_entry_replays_within_ttl() {
        let cache = DedupCache::new();
        let Claim::Produce(guard) = cache.claim("k1") else {
            panic!()
        };
        guard.complete(response("cached"));

        match cache.claim("k1") {
            Claim::Replay(r) => assert_eq!(r.body.as_ref(), b"cached"),
            _ => panic!("expected replay from completed cache"),
        }
    }

    #[tokio::test]
    async fn completed_entry_expires_after_ttl() {
        let cache = DedupCache::with_ttl(Duration::from_millis(20));
        let Claim::Produce(guard) = cache.claim("k1") else {
            panic!()
        };
        guard.complete(response("cached"));
        tokio::time::sleep(Duration::from_millis(35)).await;

        match cache.claim("k1") {
            Claim::Produce(_) => {}
            _ => panic!("expired entry must yield a fresh producer"),
        }
    }

    #[tokio::test]
    async fn producer_failure_rejects_waiters_and_clears_slot() {
        let cache = DedupCache::new();
        let Claim::Produce(guard) = cache.claim("k1") else {
            panic!()
        };
        let Claim::Wait(rx) = cache.claim("k1") else {
            panic!()
        };

        drop(guard); // producer dies without completing

        assert!(DedupCache::await_producer(rx).await.is_none());
        let (_, in_flight) = cache.counts();
        assert_eq!(in_flight, 0, "failed producer must clear its slot");
        // Next arrival becomes a fresh producer.
        assert!(matches!(cache.claim("k1"), Claim::Produce(_)));
    }

    #[tokio::test]
    async fn many_waiters_observe_the_same_bytes() {
        let cache = DedupCache::new();
        let Claim::Produce(guard) = cache.claim("k1") else {
            panic!()
        };
        let mut waiters = Vec::new();
        for _ in 0..8 {
            let Claim::Wait(rx) = cache.claim("k1") else {
                panic!()
            };
            waiters.push(tokio::spawn(DedupCache::await_producer(rx)));
        }
        let produced = guard.complete(response("same-for-everyone"));

        for waiter in waiters {
            let seen = waiter.await.unwrap().unwrap();
            assert!(Arc::ptr_eq(&seen, &produced) || seen.body == produced.body);
        }
    }

    #[tokio::test]
    async fn complete_prunes_stale_completed_entries() {
        let cache = DedupCache::with_ttl(Duration::from_millis(10));
        let Claim::Produce(g1) = cache.claim("old") else { panic!() };
        g1.complete(response("old"));
        tokio::time::sleep(Duration::from_millis(25)).await;

        let Claim::Produce(g2) = cache.claim("new") else { panic!() };
        g2.complete(response("new"));

        let (completed, _) = cache.counts();
        assert_eq!(completed, 1, "stale entry pruned on complete");
    }

    #[tokio::test]
    async fn in_flight_and_completed_are_mutually_exclusive() {
        let cache = DedupCache::new();
        let Claim::Produce(guard) = cache.claim("k1") else {
            panic!()
        };
        let (completed, in_flight) = cache.counts();
        assert_eq!((completed, in_flight), (0, 1));

        guard.complete(response("done"));
        let (completed, in_flight) = cache.counts();
        assert_eq!((completed, in_flight), (1, 0));
    }
}
