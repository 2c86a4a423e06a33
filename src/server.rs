//! 🌐 HTTP Surface
//!
//! Thin axum layer over the scoring pipeline: latest snapshot, idempotent
//! GET refresh (computes-or-returns-latest, per-IP rate limited), forced
//! POST refresh behind a bearer/query token, health and metrics. Every
//! failure is caught and shaped `{ok:false, error}` with a non-2xx status;
//! nothing propagates to the transport as an unhandled error.

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use dashmap::DashMap;
use log::{error, info, warn};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::ServiceConfig;
use crate::metrics;
use crate::pipeline::{PipelineError, ScoringPipeline, Snapshot};
use crate::store::SnapshotStore;

/// Shared state behind every route. The refresh mutex makes snapshot and
/// history writes single-writer; the rate map debounces per-caller GETs.
pub struct AppState {
    pub service: ServiceConfig,
    pub store: Arc<SnapshotStore>,
    pub pipeline: Arc<ScoringPipeline>,
    rate: DashMap<IpAddr, Instant>,
    refresh_lock: tokio::sync::Mutex<()>,
    last_write: Mutex<Option<Instant>>,
}

impl AppState {
    pub fn new(
        service: ServiceConfig,
        store: Arc<SnapshotStore>,
        pipeline: Arc<ScoringPipeline>,
    ) -> Self {
        AppState {
            service,
            store,
            pipeline,
            rate: DashMap::new(),
            refresh_lock: tokio::sync::Mutex::new(()),
            last_write: Mutex::new(None),
        }
    }

    /// True when this IP hit the refresh endpoint within the rate window.
    fn rate_limited(&self, ip: IpAddr) -> bool {
        let window = Duration::from_millis(self.service.rate_limit_ms);
        let now = Instant::now();
        let mut limited = false;
        self.rate
            .entry(ip)
            .and_modify(|last| {
                if now.duration_since(*last) < window {
                    limited = true;
                } else {
                    *last = now;
                }
            })
            .or_insert(now);
        limited
    }

    /// Run one refresh under the single-writer lock, persist on success.
    ///
    /// Non-forced calls return the existing snapshot when the last write is
    /// younger than the minimum interval (computes-or-returns-latest).
    pub async fn refresh(&self, force: bool) -> (StatusCode, Json<Value>) {
        let _guard = self.refresh_lock.lock().await;

        if !force {
            let recent = self
                .last_write
                .lock()
                .unwrap()
                .map(|t| t.elapsed().as_secs() < self.service.min_refresh_interval_secs)
                .unwrap_or(false);
            if recent {
                if let Ok(Some(snapshot)) = self.store.read_latest() {
                    return snapshot_response(snapshot);
                }
            }
        }

        let started = Instant::now();
        match self.pipeline.run_cycle().await {
            Ok(snapshot) => {
                if let Err(e) = self.persist(&snapshot) {
                    metrics::record_refresh(false, started.elapsed().as_secs_f64());
                    error!("❌ Snapshot persistence failed: {}", e);
                    return error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        &format!("persistence_failed: {}", e),
                    );
                }
                metrics::record_refresh(true, started.elapsed().as_secs_f64());
                metrics::observe_snapshot(&snapshot);
                *self.last_write.lock().unwrap() = Some(Instant::now());
                snapshot_response(snapshot)
            }
            Err(PipelineError::InsufficientFactors { usable, required }) => {
                metrics::record_refresh(false, started.elapsed().as_secs_f64());
                warn!("🚨 Refresh degraded: {} of {} factors usable", usable, required);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({
                        "ok": false,
                        "error": format!(
                            "insufficient_factors: {} usable of {} required",
                            usable, required
                        ),
                        "health": "red",
                    })),
                )
            }
            Err(PipelineError::Other(e)) => {
                metrics::record_refresh(false, started.elapsed().as_secs_f64());
                error!("❌ Refresh failed: {}", e);
                error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
            }
        }
    }

    fn persist(&self, snapshot: &Snapshot) -> anyhow::Result<()> {
        self.store.write_latest(snapshot)?;
        let row = ScoringPipeline::history_row(snapshot);
        let min_hours = {
            // history policy comes from the model config, reloaded per cycle
            let cfg = self.pipeline_config();
            cfg.history.min_elapsed_hours
        };
        self.store.append_history_if_due(&row, min_hours)?;
        Ok(())
    }

    fn pipeline_config(&self) -> Arc<crate::config::ModelConfig> {
        self.pipeline.provider().config()
    }
}

fn snapshot_response(snapshot: Snapshot) -> (StatusCode, Json<Value>) {
    match serde_json::to_value(&snapshot) {
        Ok(value) => (StatusCode::OK, Json(value)),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

fn error_response(status: StatusCode, message: &str) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "ok": false, "error": message })))
}

/// Compare the presented token (bearer header or query param) against the
/// configured secret. An empty configured secret disables the check.
pub fn token_allowed(
    configured: &str,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
) -> bool {
    if configured.is_empty() {
        return true;
    }
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if bearer == Some(configured) {
        return true;
    }
    query.get("token").map(|t| t == configured).unwrap_or(false)
}

async fn get_latest(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.read_latest() {
        Ok(Some(snapshot)) => snapshot_response(snapshot),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "no_snapshot"),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

async fn get_refresh(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    if state.rate_limited(addr.ip()) {
        return error_response(StatusCode::TOO_MANY_REQUESTS, "rate_limited");
    }

    // Serve the existing snapshot when it is still young enough
    if let Ok(Some(snapshot)) = state.store.read_latest() {
        let age = Utc::now()
            .signed_duration_since(snapshot.as_of_utc)
            .num_seconds();
        if age >= 0 && (age as u64) < state.service.min_refresh_interval_secs {
            return snapshot_response(snapshot);
        }
    }

    state.refresh(false).await
}

async fn post_refresh(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !token_allowed(&state.service.refresh_token, &headers, &query) {
        warn!("🔒 Forced refresh rejected: bad token");
        return error_response(StatusCode::FORBIDDEN, "forbidden");
    }
    info!("🔄 Forced refresh requested");
    state.refresh(true).await
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state
        .store
        .read_latest()
        .ok()
        .flatten()
        .map(|s| s.health)
        .map(|h| serde_json::to_value(h).unwrap_or(Value::Null));
    (
        StatusCode::OK,
        Json(json!({ "ok": true, "latest_health": health })),
    )
}

async fn metrics_handler() -> impl IntoResponse {
    metrics::render()
}

/// Assemble the router. Serve with
/// `into_make_service_with_connect_info::<SocketAddr>()` so the rate
/// limiter sees caller IPs.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/gscore/latest", get(get_latest))
        .route("/api/gscore/refresh", get(get_refresh).post(post_refresh))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{default_model_config, ConfigProvider, ValidationMode};
    use crate::factors::{FactorResult, FactorSource, StaticSource};

    fn fresh_source(key: &str, score: f64) -> Box<dyn FactorSource> {
        Box::new(StaticSource::new(
            key,
            FactorResult {
                score: Some(score),
                last_utc: Some(Utc::now().to_rfc3339()),
                source: Some("test".to_string()),
                details: Vec::new(),
                reason: None,
                provenance: Vec::new(),
            },
        ))
    }

    fn test_state(name: &str, all_null: bool) -> Arc<AppState> {
        let dir = format!("/tmp/gscore_server_{}", name);
        let _ = std::fs::remove_dir_all(&dir);
        let cfg = default_model_config();
        let provider =
            Arc::new(ConfigProvider::with_config(cfg.clone(), ValidationMode::Lenient).unwrap());
        let store = Arc::new(SnapshotStore::new(&dir).unwrap());
        let sources: Vec<Box<dyn FactorSource>> = cfg
            .enabled_factors()
            .map(|f| {
                if all_null {
                    Box::new(StaticSource::new(&f.key, FactorResult::failed(&f.key)))
                        as Box<dyn FactorSource>
                } else {
                    fresh_source(&f.key, 45.0)
                }
            })
            .collect();
        let pipeline = Arc::new(ScoringPipeline::new(provider, store.clone(), sources));
        let mut service = ServiceConfig::from_env().unwrap();
        service.refresh_token = "sekrit".to_string();
        Arc::new(AppState::new(service, store, pipeline))
    }

    #[test]
    fn test_token_check() {
        let mut headers = HeaderMap::new();
        let mut query = HashMap::new();

        // Empty secret disables the check
        assert!(token_allowed("", &headers, &query));

        assert!(!token_allowed("sekrit", &headers, &query));

        headers.insert("authorization", "Bearer sekrit".parse().unwrap());
        assert!(token_allowed("sekrit", &headers, &query));

        headers.insert("authorization", "Bearer wrong".parse().unwrap());
        assert!(!token_allowed("sekrit", &headers, &query));

        headers.remove("authorization");
        query.insert("token".to_string(), "sekrit".to_string());
        assert!(token_allowed("sekrit", &headers, &query));
    }

    #[test]
    fn test_rate_limiter_window() {
        let state = test_state("rate", false);
        let ip: IpAddr = "10.1.2.3".parse().unwrap();
        assert!(!state.rate_limited(ip));
        assert!(state.rate_limited(ip)); // immediate second hit

        let other: IpAddr = "10.1.2.4".parse().unwrap();
        assert!(!state.rate_limited(other)); // other callers unaffected
    }

    #[tokio::test]
    async fn test_refresh_persists_snapshot() {
        let state = test_state("refresh_ok", false);
        let (status, Json(body)) = state.refresh(true).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["composite_score"], 45.0);

        let latest = state.store.read_latest().unwrap().unwrap();
        assert_eq!(latest.composite_score, 45.0);
        // History got exactly one row
        let raw = std::fs::read_to_string(state.store.history_path()).unwrap();
        assert_eq!(raw.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_degraded_refresh_holds_previous_snapshot() {
        let state = test_state("refresh_degraded", false);
        let (status, _) = state.refresh(true).await;
        assert_eq!(status, StatusCode::OK);

        // Swap in a pipeline whose sources all fail
        let broken = test_state("refresh_degraded_b", true);
        let (status, Json(body)) = broken.refresh(true).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["ok"], false);
        assert_eq!(body["health"], "red");
        assert!(body["error"].as_str().unwrap().contains("insufficient_factors"));
        // Nothing was written for the failed cycle
        assert!(broken.store.read_latest().unwrap().is_none());

        // The healthy state's snapshot is untouched
        assert!(state.store.read_latest().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_non_forced_refresh_debounces() {
        let state = test_state("refresh_debounce", false);
        let (status, _) = state.refresh(true).await;
        assert_eq!(status, StatusCode::OK);
        let first = state.store.read_latest().unwrap().unwrap();

        // Within the minimum interval: serve the stored snapshot unchanged
        let (status, Json(body)) = state.refresh(false).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["as_of_utc"], serde_json::to_value(first.as_of_utc).unwrap());
    }
}
