//! Configuration for claw-throttle.
//!
//! Config is loaded once at startup from a JSON file and validated before the
//! server opens any ports. Invalid configs are rejected with a clear error
//! rather than silently falling back to defaults. Provider API keys and the
//! routing mode can be overridden from the environment so secrets stay out of
//! the config file.
//!
//! # Example
//! ```json
//! {
//!   "mode": "eco",
//!   "providers": {
//!     "anthropic": { "apiKey": "sk-ant-…", "authType": "auto" },
//!     "ollama":    { "baseUrl": "http://localhost:11434" }
//!   },
//!   "modelCatalogPath": "models.json",
//!   "routingTablePath": "routing.json",
//!   "http": { "port": 8484 }
//! }
//! ```

use std::{collections::HashMap, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::catalog::Provider;

/// Routing posture selected by the operator. Biases the model preference
/// order for every tier - `eco` leans cheapest, `gigachad` leans most capable.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Eco,
    #[default]
    Standard,
    /// One configuration vintage spelled this `performance`; both load, the
    /// canonical value in logs and stats is `gigachad`.
    #[serde(alias = "performance")]
    Gigachad,
}

impl Mode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "eco" => Some(Self::Eco),
            "standard" => Some(Self::Standard),
            "gigachad" | "performance" => Some(Self::Gigachad),
            _ => None,
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Eco => "eco",
            Self::Standard => "standard",
            Self::Gigachad => "gigachad",
        })
    }
}

/// How the Anthropic key is presented upstream.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum AuthType {
    /// `x-api-key: <key>` header.
    #[serde(rename = "api-key")]
    ApiKey,
    /// `Authorization: Bearer <key>` header.
    #[serde(rename = "bearer")]
    Bearer,
    /// `sk-ant-*` keys go to `x-api-key`, anything else to bearer.
    #[default]
    #[serde(rename = "auto")]
    Auto,
}

/// Per-provider connection settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSettings {
    /// API key. Empty means the provider is not configured (except for
    /// keyless local backends such as Ollama).
    #[serde(default)]
    pub api_key: String,

    /// Base URL override. Defaults to the provider's public endpoint.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Anthropic only: second independent credential (setup token) used for
    /// transparent dual-key failover.
    #[serde(default)]
    pub setup_token: Option<String>,

    /// Anthropic only: try the setup token before the enterprise key.
    #[serde(default)]
    pub prefer_setup_token: bool,

    /// Anthropic only: how the key is presented upstream.
    #[serde(default)]
    pub auth_type: AuthType,
}

/// Classifier tier boundaries, in composite-score space.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Thresholds {
    /// Composite scores at or below this are `simple` (default 0.30).
    #[serde(default = "defaults::simple_max")]
    pub simple_max: f64,
    /// Composite scores at or above this are `complex` (default 0.65).
    #[serde(default = "defaults::complex_min")]
    pub complex_min: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            simple_max: defaults::simple_max(),
            complex_min: defaults::complex_min(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifierConfig {
    /// Optional JSON file overriding the built-in dimension weights.
    #[serde(default)]
    pub weights_path: Option<String>,
    #[serde(default)]
    pub thresholds: Thresholds,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    /// Log level override (also controlled by `RUST_LOG`).
    #[serde(default)]
    pub level: Option<String>,
    /// Append-only JSONL routing log (default: `routing-log.jsonl`).
    #[serde(default = "defaults::log_file_path")]
    pub log_file_path: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: None,
            log_file_path: defaults::log_file_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpConfig {
    /// Loopback port for the proxy endpoint (default: 8484).
    #[serde(default = "defaults::port")]
    pub port: u16,
    #[serde(default = "defaults::enabled")]
    pub enabled: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: defaults::port(),
            enabled: defaults::enabled(),
        }
    }
}

/// Top-level proxy configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub mode: Mode,

    /// Provider connection settings keyed by provider tag.
    #[serde(default)]
    pub providers: HashMap<Provider, ProviderSettings>,

    /// Force-model alias → catalog model id. The built-in set covers the
    /// common inline prefixes (`/opus`, `/sonnet`, `/haiku`, `/flash`,
    /// `/grok-fast`); a config entry replaces the whole set.
    #[serde(default = "defaults::aliases")]
    pub aliases: HashMap<String, String>,

    #[serde(default)]
    pub classifier: ClassifierConfig,

    #[serde(default = "defaults::model_catalog_path")]
    pub model_catalog_path: String,

    #[serde(default = "defaults::routing_table_path")]
    pub routing_table_path: String,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub http: HttpConfig,
}

impl Default for Config {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config must deserialize via defaults")
    }
}

impl Config {
    /// Load, apply environment overrides, and sanity-check.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let mut config: Self =
            serde_json::from_str(&content).context("parsing config JSON")?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Env vars take precedence over the file for provider keys and mode.
    pub fn apply_env_overrides(&mut self) {
        if let Some(mode) = std::env::var("THROTTLE_MODE")
            .ok()
            .as_deref()
            .and_then(Mode::parse)
        {
            self.mode = mode;
        }

        let key_vars: [(Provider, &str); 7] = [
            (Provider::Anthropic, "ANTHROPIC_API_KEY"),
            (Provider::OpenAI, "OPENAI_API_KEY"),
            (Provider::Google, "GEMINI_API_KEY"),
            (Provider::DeepSeek, "DEEPSEEK_API_KEY"),
            (Provider::XAi, "XAI_API_KEY"),
            (Provider::Moonshot, "MOONSHOT_API_KEY"),
            (Provider::Mistral, "MISTRAL_API_KEY"),
        ];
        for (provider, var) in key_vars {
            if let Ok(key) = std::env::var(var) {
                if !key.is_empty() {
                    self.providers.entry(provider).or_default().api_key = key;
                }
            }
        }
        if let Ok(token) = std::env::var("ANTHROPIC_SETUP_TOKEN") {
            if !token.is_empty() {
                self.providers
                    .entry(Provider::Anthropic)
                    .or_default()
                    .setup_token = Some(token);
            }
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.classifier.thresholds.simple_max < self.classifier.thresholds.complex_min,
            "classifier thresholds: simpleMax ({}) must be below complexMin ({})",
            self.classifier.thresholds.simple_max,
            self.classifier.thresholds.complex_min
        );
        Ok(())
    }

    /// A provider counts as configured when it can actually be dispatched to:
    /// a non-empty API key, or - for keyless local backends - any entry at all.
    pub fn is_configured(&self, provider: Provider) -> bool {
        match self.providers.get(&provider) {
            Some(settings) => !provider.requires_key() || !settings.api_key.is_empty(),
            None => false,
        }
    }

    pub fn provider(&self, provider: Provider) -> Option<&ProviderSettings> {
        self.providers.get(&provider)
    }

    /// Base URL for a provider, falling back to its public endpoint.
    pub fn base_url(&self, provider: Provider) -> String {
        self.providers
            .get(&provider)
            .and_then(|s| s.base_url.as_deref())
            .unwrap_or(provider.default_base_url())
            .trim_end_matches('/')
            .to_string()
    }
}

mod defaults {
    use std::collections::HashMap;

    pub fn simple_max() -> f64 { 0.30 }
    pub fn complex_min() -> f64 { 0.65 }
    pub fn port() -> u16 { 8484 }
    pub fn enabled() -> bool { true }
    pub fn log_file_path() -> String { "routing-log.jsonl".into() }
    pub fn model_catalog_path() -> String { "models.json".into() }
    pub fn routing_table_path() -> String { "routing.json".into() }

    pub fn aliases() -> HashMap<String, String> {
        [
            ("opus", "claude-opus-4-1"),
            ("sonnet", "claude-sonnet-4-5"),
            ("haiku", "claude-haiku-4-5"),
            ("flash", "gemini-2.5-flash"),
            ("grok-fast", "grok-code-fast-1"),
        ]
        .into_iter()
        .map(|(a, m)| (a.to_string(), m.to_string()))
        .collect()
    }
}
