//! 🧠 G-Score Engine Service
//!
//! Aggregates per-factor Bitcoin risk feeds into one composite 0-100 risk
//! score, with historical logging and a thin HTTP surface.
//!
//! ## Architecture
//! - Factor feeds: producer-dropped JSON under data/feeds/
//! - Scoring pipeline: staleness → renormalized composite → adjustments → band
//! - Persistence: atomic latest.json + append-only NDJSON history
//! - HTTP: latest / refresh (GET idempotent, POST forced) / healthz / metrics

use anyhow::{Context, Result};
use gscore_engine::config::{ConfigProvider, ServiceConfig, ValidationMode, MODEL_VERSION};
use gscore_engine::factors::feed_sources;
use gscore_engine::pipeline::ScoringPipeline;
use gscore_engine::server::{router, AppState};
use gscore_engine::store::SnapshotStore;
use gscore_engine::metrics;
use log::{error, info};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let service = ServiceConfig::from_env().context("Failed to load configuration")?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&service.log_level),
    )
    .init();

    service.validate().context("Invalid configuration")?;
    info!("✅ Configuration: Loaded");

    metrics::init_metrics();
    info!("✅ Metrics: Initialized");

    let mode = if service.strict_config {
        ValidationMode::Strict
    } else {
        ValidationMode::Lenient
    };
    let provider =
        Arc::new(ConfigProvider::from_env(mode).context("Failed to load model config")?);
    info!("✅ Model config: digest {}", &provider.digest()[..12]);

    let store = Arc::new(SnapshotStore::new(&service.data_dir)?);
    info!("✅ Store: {}", service.data_dir.display());

    // Enumerate the factor source set once at startup
    let sources = feed_sources(&provider.config(), &store.feeds_dir());
    info!("✅ Factor sources: {} registered", sources.len());

    let pipeline = Arc::new(ScoringPipeline::new(provider.clone(), store.clone(), sources));
    let state = Arc::new(AppState::new(service.clone(), store, pipeline));

    print_banner(&service, &provider.digest());

    // Scheduled refresh loop; the HTTP layer shares the same single-writer
    // refresh path
    let scheduled = state.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(scheduled.service.refresh_interval_secs));
        loop {
            interval.tick().await;
            let (status, _) = scheduled.refresh(false).await;
            if !status.is_success() {
                error!("❌ Scheduled refresh failed ({})", status);
            }
        }
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], state.service.port));
    info!("🚀 Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("HTTP server error")?;

    Ok(())
}

fn print_banner(service: &ServiceConfig, digest: &str) {
    info!("╔══════════════════════════════════════════╗");
    info!("║        G-SCORE ENGINE v{}             ║", MODEL_VERSION);
    info!("╚══════════════════════════════════════════╝");
    info!("   Port:             {}", service.port);
    info!("   Data dir:         {}", service.data_dir.display());
    info!("   Refresh interval: {}s", service.refresh_interval_secs);
    info!("   Config digest:    {}", &digest[..12]);
    info!(
        "   Config mode:      {}",
        if service.strict_config { "strict" } else { "lenient" }
    );
}
