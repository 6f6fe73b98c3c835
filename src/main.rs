// =============================================================================
// On-chain Gate — Main Entry Point
// =============================================================================
//
// Scores every configured (asset, timeframe) on its schedule and serves the
// resulting decision artifacts over REST. Metric inputs arrive through the
// ingest endpoints.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod audit;
mod baseline;
mod decision_envelope;
mod engine;
mod errors;
mod kill_switch;
mod runtime_config;
mod scoring;
mod signals;
mod types;

use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::runtime_config::EngineConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("On-chain Gate starting up");

    let config_path = EngineConfig::path_from_env();
    let mut config = EngineConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, path = %config_path, "failed to load config, using defaults");
        let config = EngineConfig::default();
        config.log_summary("defaults");
        config
    });

    // Override assets from env if available.
    if let Ok(assets) = std::env::var("ONCHAIN_ASSETS") {
        let parsed: Vec<String> = assets
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        if !parsed.is_empty() {
            config.assets = parsed;
        }
    }
    info!(assets = ?config.assets, "configured assets");

    // ── 2. Shared state ──────────────────────────────────────────────────
    let state = Arc::new(AppState::new(config, config_path.clone()));

    // ── 3. Scheduler loops ───────────────────────────────────────────────
    let handles = state.scheduler().spawn();
    info!(loops = handles.len(), "scheduler running");

    // ── 4. API server ────────────────────────────────────────────────────
    let api_state = state.clone();
    let bind_addr =
        std::env::var("ONCHAIN_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3002".into());

    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(addr = %bind_addr, error = %e, "failed to bind API server");
                return;
            }
        };
        info!(addr = %bind_addr, "API server listening");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("all subsystems running, press Ctrl+C to stop");

    // ── 5. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received");

    for h in handles {
        h.abort();
    }
    if let Err(e) = state.config().save(&config_path) {
        error!(error = %e, "failed to save engine config on shutdown");
    }

    info!(
        stored_results = state.ledger.stored_results(),
        "On-chain Gate shut down"
    );
    Ok(())
}
