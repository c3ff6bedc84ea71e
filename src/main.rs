use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use tokio::signal;
use tracing::info;

mod api;
mod catalog;
mod classify;
mod config;
mod dedup;
mod dispatch;
mod error;
mod ingress;
mod overrides;
mod pipeline;
mod providers;
mod rate_limit;
mod router;
mod routing_log;
mod session;
mod sse;
mod state;
mod stats;
mod translate;

pub use config::Config;
pub use error::ProxyError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load config before tracing so the configured level can seed the filter;
    // RUST_LOG still wins when set.
    let config_path = std::env::var("THROTTLE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("throttle.config.json"));
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let default_filter = match config.logging.level.as_deref() {
        Some(level) => format!("claw_throttle={level},tower_http=warn"),
        None => "claw_throttle=info,tower_http=warn".into(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    if !config.http.enabled {
        tracing::warn!("http.enabled is false - nothing to serve, exiting");
        return Ok(());
    }

    let port = config.http.port;
    let mode = config.mode;
    let state = Arc::new(state::ProxyState::load(config).context("building proxy state")?);

    info!(%mode, port, "claw-throttle starting");

    // Periodic session eviction. The task dies with the runtime, so it never
    // delays shutdown.
    {
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(session::CLEANUP_INTERVAL);
            tick.tick().await;
            loop {
                tick.tick().await;
                state.sessions.cleanup();
            }
        });
    }

    let trace_layer = tower_http::trace::TraceLayer::new_for_http()
        .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
        .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO));
    let app = api::router(Arc::clone(&state)).layer(trace_layer);

    // Loopback bind: the proxy trusts its local callers and authenticates
    // nobody (see the security posture in the README).
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "proxy listening");

    tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("proxy server error")?;
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
