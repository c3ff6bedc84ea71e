//! Shared application state injected into every request handler.
//!
//! Everything immutable after load (config, catalog, routing table,
//! classifier weights) is validated here before the server opens a port;
//! the ephemeral stores (sessions, dedup, cooldowns, dual-key) are process
//! singletons owned by this struct and shared via `Arc<ProxyState>`.

use std::{path::Path, sync::Arc, time::Instant};

use anyhow::Context;

use crate::{
    catalog::{ModelRegistry, RoutingTable},
    classify::{Classifier, Weights},
    config::Config,
    dedup::DedupCache,
    dispatch::Dispatcher,
    rate_limit::{DualKeyState, RateLimiter},
    router::RoutingInputs,
    routing_log::RoutingLog,
    session::SessionStore,
};

#[derive(Debug)]
pub struct ProxyState {
    pub config: Arc<Config>,
    pub registry: ModelRegistry,
    pub table: RoutingTable,
    pub classifier: Classifier,
    pub sessions: SessionStore,
    pub dedup: DedupCache,
    pub rate_limiter: Arc<RateLimiter>,
    pub dual_key: Arc<DualKeyState>,
    pub dispatcher: Dispatcher,
    pub routing_log: RoutingLog,
    pub started_at: Instant,
}

impl ProxyState {
    /// Load catalog, routing table, and weights from the paths in `config`,
    /// then assemble the validated state. Any unresolved model id is fatal.
    pub fn load(config: Config) -> anyhow::Result<Self> {
        let registry = ModelRegistry::load(Path::new(&config.model_catalog_path))?;
        let table = RoutingTable::load(Path::new(&config.routing_table_path))?;
        let weights = match &config.classifier.weights_path {
            Some(path) => Weights::load(Path::new(path))?,
            None => Weights::default(),
        };
        Self::from_parts(config, registry, table, weights)
    }

    /// Assemble state from already-loaded parts (the test entry point).
    pub fn from_parts(
        config: Config,
        registry: ModelRegistry,
        table: RoutingTable,
        weights: Weights,
    ) -> anyhow::Result<Self> {
        table
            .validate(&registry)
            .context("routing table validation")?;
        for (alias, model_id) in &config.aliases {
            anyhow::ensure!(
                registry.contains(model_id),
                "alias `{alias}` maps to unknown model `{model_id}`"
            );
        }

        let classifier = Classifier::new(weights, config.classifier.thresholds.clone());
        let routing_log = RoutingLog::new(&config.logging.log_file_path);
        let prefer_setup = config
            .provider(crate::catalog::Provider::Anthropic)
            .map(|s| s.prefer_setup_token)
            .unwrap_or(false);

        let config = Arc::new(config);
        let rate_limiter = Arc::new(RateLimiter::new());
        let dual_key = Arc::new(DualKeyState::new(prefer_setup));
        let dispatcher = Dispatcher::new(
            Arc::clone(&config),
            Arc::clone(&dual_key),
            Arc::clone(&rate_limiter),
        );

        Ok(Self {
            config,
            registry,
            table,
            classifier,
            sessions: SessionStore::new(),
            dedup: DedupCache::new(),
            rate_limiter,
            dual_key,
            dispatcher,
            routing_log,
            started_at: Instant::now(),
        })
    }

    pub fn routing_inputs(&self) -> RoutingInputs<'_> {
        RoutingInputs {
            registry: &self.registry,
            table: &self.table,
            config: &self.config,
            rate_limiter: &self.rate_limiter,
            sessions: &self.sessions,
        }
    }
}
