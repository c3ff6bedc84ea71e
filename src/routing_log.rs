//! Append-only routing log.
//!
//! One JSON line per completed request - prompt hash only, never content.
//! Appends are serialized by a single mutex and are strictly best-effort: a
//! write failure is logged and swallowed, it must never surface to the
//! client. A bounded in-memory ring of recent entries keeps the sub-agent
//! parent lookup off the disk for the common case; a ring miss falls back to
//! scanning the file.

use std::{
    collections::VecDeque,
    io::{BufRead, Write},
    path::PathBuf,
    sync::Mutex,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{catalog::Provider, classify::Tier, config::Mode, rate_limit::KeyType};

/// How many recent entries the in-memory ring retains.
const RING_CAPACITY: usize = 512;

/// One completed routing decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingLogEntry {
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    /// First 16 hex chars of the prompt's SHA-256. Content is never logged.
    pub prompt_hash: String,
    pub score: f64,
    pub confidence: f64,
    pub tier: Tier,
    pub model: String,
    pub provider: Provider,
    pub mode: Mode,
    pub override_kind: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost_usd: f64,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_type: Option<KeyType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failover: Option<bool>,
}

/// Single-writer append log with a recent-entry ring index.
#[derive(Debug)]
pub struct RoutingLog {
    path: PathBuf,
    /// Serializes appends; held only for the duration of one small write.
    writer: Mutex<()>,
    recent: Mutex<VecDeque<RoutingLogEntry>>,
}

impl RoutingLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(()),
            recent: Mutex::new(VecDeque::with_capacity(RING_CAPACITY)),
        }
    }

    /// Append one entry. Best-effort: failures are logged, never raised.
    pub fn append(&self, entry: &RoutingLogEntry) {
        {
            let mut recent = self.recent.lock().expect("routing log ring poisoned");
            if recent.len() == RING_CAPACITY {
                recent.pop_front();
            }
            recent.push_back(entry.clone());
        }

        let line = match serde_json::to_string(entry) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "routing log entry failed to serialize");
                return;
            }
        };

        let _guard = self.writer.lock().expect("routing log writer poisoned");
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| writeln!(file, "{line}"));
        if let Err(e) = result {
            tracing::warn!(path = %self.path.display(), error = %e, "routing log write failed");
        }
    }

    /// Resolve a request id to the model that served it. Ring first, then a
    /// full file scan for entries that have already rotated out.
    pub fn lookup_model(&self, request_id: &str) -> Option<String> {
        {
            let recent = self.recent.lock().expect("routing log ring poisoned");
            if let Some(entry) = recent.iter().rev().find(|e| e.request_id == request_id) {
                return Some(entry.model.clone());
            }
        }
        self.scan(|entry| entry.request_id == request_id)
            .into_iter()
            .next_back()
            .map(|e| e.model)
    }

    /// All entries at or after `since`, oldest first.
    pub fn read_since(&self, since: DateTime<Utc>) -> Vec<RoutingLogEntry> {
        self.scan(|entry| entry.timestamp >= since)
    }

    fn scan(&self, keep: impl Fn(&RoutingLogEntry) -> bool) -> Vec<RoutingLogEntry> {
        let file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            // No log yet is a normal cold start.
            Err(_) => return Vec::new(),
        };
        std::io::BufReader::new(file)
            .lines()
            .map_while(Result::ok)
            .filter_map(|line| serde_json::from_str::<RoutingLogEntry>(&line).ok())
            .filter(|entry| keep(entry))
            .collect()
    }
}
