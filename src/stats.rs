//! On-demand statistics over the routing log.
//!
//! Answers the operator's one real question: what did the router save? The
//! baseline is the hypothetical spend if every logged request had used the
//! most expensive catalog model, computed from the catalog at call time.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{catalog::ModelRegistry, routing_log::RoutingLogEntry};

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelStat {
    pub count: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsReport {
    pub total_requests: u64,
    pub total_cost_usd: f64,
    /// What the same traffic would have cost on `baseline_model`.
    pub baseline_cost_usd: f64,
    pub savings_usd: f64,
    pub baseline_model: String,
    pub model_distribution: HashMap<String, ModelStat>,
    pub tier_distribution: HashMap<String, u64>,
    pub avg_latency_ms: f64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

/// Aggregate log entries from `since` to now against the catalog baseline.
pub fn aggregate(
    entries: &[RoutingLogEntry],
    registry: &ModelRegistry,
    since: DateTime<Utc>,
) -> StatsReport {
    let baseline = registry.most_expensive();

    let mut total_cost = 0.0;
    let mut baseline_cost = 0.0;
    let mut latency_sum = 0u64;
    let mut model_distribution: HashMap<String, ModelStat> = HashMap::new();
    let mut tier_distribution: HashMap<String, u64> = HashMap::new();

    for entry in entries {
        total_cost += entry.estimated_cost_usd;
        baseline_cost += baseline.estimate_cost(entry.input_tokens, entry.output_tokens);
        latency_sum += entry.latency_ms;

        let stat = model_distribution.entry(entry.model.clone()).or_default();
        stat.count += 1;
        stat.cost_usd += entry.estimated_cost_usd;

        *tier_distribution.entry(entry.tier.to_string()).or_default() += 1;
    }

    let total_requests = entries.len() as u64;
    let avg_latency_ms = if total_requests == 0 {
        0.0
    } else {
        latency_sum as f64 / total_requests as f64
    };

    StatsReport {
        total_requests,
        total_cost_usd: total_cost,
        baseline_cost_usd: baseline_cost,
        savings_usd: baseline_cost - total_cost,
        baseline_model: baseline.id.clone(),
        model_distribution,
        tier_distribution,
        avg_latency_ms,
        period_start: since,
        period_end: Utc::now(),
    }
}
