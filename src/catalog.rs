//! Model catalog and routing table - the immutable routing inputs.
//!
//! Both are loaded once at startup from JSON files and validated against each
//! other before the server opens a port: every model id the routing table or
//! alias set references must resolve in the catalog, and an unresolved id is
//! a fatal startup error, not a runtime fallback.

use std::{collections::HashMap, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{classify::Tier, config::Mode};

/// Which LLM backend a model lives on. Closed enumeration; each tag binds at
/// configuration time to `(apiKey, baseUrl)`.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// Anthropic Messages API (`/v1/messages`), dual-key capable.
    Anthropic,
    /// Standard OpenAI `/v1/chat/completions` protocol.
    #[serde(rename = "openai")]
    OpenAI,
    /// Gemini generate-content endpoint, API key in the query string.
    Google,
    /// OpenAI-compatible wire format; differs only in base URL + key.
    #[serde(rename = "deepseek")]
    DeepSeek,
    /// OpenAI-compatible wire format (x.ai).
    #[serde(rename = "xai")]
    XAi,
    /// OpenAI-compatible wire format (moonshot.ai).
    Moonshot,
    /// OpenAI-compatible wire format (mistral.ai).
    Mistral,
    /// Ollama local inference server - keyless, OpenAI-compat endpoint.
    Ollama,
}

impl Provider {
    /// Keyless local backends count as configured with just a base URL.
    pub fn requires_key(self) -> bool {
        !matches!(self, Self::Ollama)
    }

    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::Anthropic => "https://api.anthropic.com",
            Self::OpenAI => "https://api.openai.com",
            Self::Google => "https://generativelanguage.googleapis.com",
            Self::DeepSeek => "https://api.deepseek.com",
            Self::XAi => "https://api.x.ai",
            Self::Moonshot => "https://api.moonshot.ai",
            Self::Mistral => "https://api.mistral.ai",
            Self::Ollama => "http://localhost:11434",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Anthropic => "anthropic",
            Self::OpenAI => "openai",
            Self::Google => "google",
            Self::DeepSeek => "deepseek",
            Self::XAi => "xai",
            Self::Moonshot => "moonshot",
            Self::Mistral => "mistral",
            Self::Ollama => "ollama",
        })
    }
}

/// One catalog entry. Loaded at startup, never mutated.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelSpec {
    /// Stable identifier, e.g. `claude-haiku-4-5`.
    pub id: String,
    pub display_name: String,
    pub provider: Provider,
    /// USD per million input tokens.
    pub input_cost_per_mtok: f64,
    /// USD per million output tokens.
    pub output_cost_per_mtok: f64,
    pub max_context_tokens: u64,
}

impl ModelSpec {
    /// Estimated USD cost for a request with the given token counts.
    pub fn estimate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 * self.input_cost_per_mtok
            + output_tokens as f64 * self.output_cost_per_mtok)
            / 1_000_000.0
    }

    /// Blended per-MTok cost used to order models cheapest-first. Output
    /// tokens dominate real spend, so they carry triple weight.
    fn cost_rank(&self) -> f64 {
        self.input_cost_per_mtok + 3.0 * self.output_cost_per_mtok
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    models: Vec<ModelSpec>,
}

/// The model catalog, indexed by id, with a cost-ordered hierarchy.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    by_id: HashMap<String, ModelSpec>,
    /// Model ids ordered cheapest → most capable.
    hierarchy: Vec<String>,
}

impl ModelRegistry {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading model catalog {}", path.display()))?;
        let file: CatalogFile =
            serde_json::from_str(&content).context("parsing model catalog JSON")?;
        Self::from_models(file.models)
    }

    pub fn from_models(models: Vec<ModelSpec>) -> anyhow::Result<Self> {
        anyhow::ensure!(!models.is_empty(), "model catalog is empty");

        let mut hierarchy: Vec<&ModelSpec> = models.iter().collect();
        hierarchy.sort_by(|a, b| {
            a.cost_rank()
                .partial_cmp(&b.cost_rank())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let hierarchy: Vec<String> = hierarchy.into_iter().map(|m| m.id.clone()).collect();

        let mut by_id = HashMap::with_capacity(models.len());
        for model in models {
            anyhow::ensure!(
                by_id.insert(model.id.clone(), model.clone()).is_none(),
                "duplicate model id `{}` in catalog",
                model.id
            );
        }

        Ok(Self { by_id, hierarchy })
    }

    pub fn get(&self, id: &str) -> Option<&ModelSpec> {
        self.by_id.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    /// All model ids, cheapest first. The sub-agent step-down ladder.
    pub fn hierarchy(&self) -> &[String] {
        &self.hierarchy
    }

    /// Cheapest model satisfying `available` (configured and not rate-limited,
    /// in the router's case).
    pub fn cheapest_where<F>(&self, mut available: F) -> Option<&ModelSpec>
    where
        F: FnMut(&ModelSpec) -> bool,
    {
        self.hierarchy
            .iter()
            .filter_map(|id| self.by_id.get(id))
            .find(|m| available(m))
    }

    /// The most expensive catalog model - the stats baseline.
    pub fn most_expensive(&self) -> &ModelSpec {
        self.hierarchy
            .last()
            .and_then(|id| self.by_id.get(id))
            .expect("registry is never empty")
    }

    /// One step below `model_id` in the hierarchy. `None` when the model is
    /// already at the floor or not in the hierarchy at all.
    pub fn step_down(&self, model_id: &str) -> Option<&str> {
        let idx = self.hierarchy().iter().position(|id| id == model_id)?;
        if idx == 0 {
            None
        } else {
            Some(&self.hierarchy[idx - 1])
        }
    }
}

/// Ordered model preference lists for one mode.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TierPreferences {
    #[serde(default)]
    pub simple: Vec<String>,
    #[serde(default)]
    pub standard: Vec<String>,
    #[serde(default)]
    pub complex: Vec<String>,
}

impl TierPreferences {
    pub fn for_tier(&self, tier: Tier) -> &[String] {
        match tier {
            Tier::Simple => &self.simple,
            Tier::Standard => &self.standard,
            Tier::Complex => &self.complex,
        }
    }
}

/// mode → tier → ordered preference list. Loaded from the routing table file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RoutingTable {
    #[serde(default)]
    pub eco: TierPreferences,
    #[serde(default)]
    pub standard: TierPreferences,
    /// Accepts the legacy `performance` key from older config vintages.
    #[serde(default, alias = "performance")]
    pub gigachad: TierPreferences,
}

impl RoutingTable {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading routing table {}", path.display()))?;
        serde_json::from_str(&content).context("parsing routing table JSON")
    }

    pub fn for_mode(&self, mode: Mode) -> &TierPreferences {
        match mode {
            Mode::Eco => &self.eco,
            Mode::Standard => &self.standard,
            Mode::Gigachad => &self.gigachad,
        }
    }

    pub fn preference(&self, mode: Mode, tier: Tier) -> &[String] {
        self.for_mode(mode).for_tier(tier)
    }

    /// Every referenced id must resolve in the catalog - fail fast otherwise.
    pub fn validate(&self, registry: &ModelRegistry) -> anyhow::Result<()> {
        for (mode, prefs) in [
            ("eco", &self.eco),
            ("standard", &self.standard),
            ("gigachad", &self.gigachad),
        ] {
            for (tier, ids) in [
                ("simple", &prefs.simple),
                ("standard", &prefs.standard),
                ("complex", &prefs.complex),
            ] {
                for id in ids {
                    anyhow::ensure!(
                        registry.contains(id),
                        "routing table {mode}/{tier} references unknown model `{id}`"
                    );
                }
            }
        }
        Ok(())
    }
}
