// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// Everything lives under `/api/v1/`. Reads (scores, audit trail, anomalies,
// gate status) are public. Operator actions require the `AuthBearer`
// extractor: kill/release, config replacement, ingest, baseline
// recalculation and backfill.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::audit::AuditRecord;
use crate::engine::CycleInputs;
use crate::runtime_config::EngineConfig;
use crate::types::{ScoreKey, Timeframe};

type ApiError = (StatusCode, Json<serde_json::Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(serde_json::json!({ "error": message.into() })))
}

fn parse_timeframe(raw: &str) -> Result<Timeframe, ApiError> {
    raw.parse().map_err(|e: String| api_error(StatusCode::BAD_REQUEST, e))
}

fn parse_key(asset: &str, timeframe: &str, timestamp: &str) -> Result<ScoreKey, ApiError> {
    let timeframe = parse_timeframe(timeframe)?;
    let timestamp = DateTime::parse_from_rfc3339(timestamp)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("bad timestamp '{timestamp}': {e}")))?
        .with_timezone(&Utc);
    Ok(ScoreKey::new(asset.to_uppercase(), timeframe, timestamp))
}

// =============================================================================
// Router construction
// =============================================================================

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/latest/:asset/:timeframe", get(latest_score))
        .route("/api/v1/scores/:asset/:timeframe/:timestamp", get(score_at))
        .route("/api/v1/audit/:asset/:timeframe/:timestamp", get(audit_at))
        .route("/api/v1/evaluations/:asset/:timeframe/:timestamp", get(evaluations_at))
        .route("/api/v1/decisions", get(decisions))
        .route("/api/v1/anomalies", get(anomalies))
        .route("/api/v1/failures", get(failures))
        .route("/api/v1/gate", get(gate_status))
        .route("/api/v1/config", get(get_config))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/config", post(set_config))
        .route("/api/v1/control/kill", post(control_kill))
        .route("/api/v1/control/release", post(control_release))
        .route("/api/v1/ingest", post(ingest))
        .route("/api/v1/ingest/history", post(ingest_history))
        .route("/api/v1/baselines/recalculate", post(recalculate_baselines))
        .route("/api/v1/backfill", post(backfill))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health & snapshot
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
    manual_override: bool,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        server_time: Utc::now().timestamp_millis(),
        manual_override: state.gate.manual_override().is_some(),
    })
}

async fn full_state(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

// =============================================================================
// Scores & audit trail
// =============================================================================

async fn latest_score(
    State(state): State<Arc<AppState>>,
    Path((asset, timeframe)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let timeframe = parse_timeframe(&timeframe)?;
    let asset = asset.to_uppercase();
    state
        .ledger
        .latest_for_stream(&asset, timeframe)
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("no result for {asset}/{timeframe}")))
}

async fn score_at(
    State(state): State<Arc<AppState>>,
    Path((asset, timeframe, timestamp)): Path<(String, String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let key = parse_key(&asset, &timeframe, &timestamp)?;
    state
        .ledger
        .audit(&key)
        .map(|r| Json(r.envelope))
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("no result for {key}")))
}

#[derive(Serialize)]
struct AuditResponse {
    record: AuditRecord,
    integrity_ok: bool,
    history: Vec<AuditRecord>,
}

async fn audit_at(
    State(state): State<Arc<AppState>>,
    Path((asset, timeframe, timestamp)): Path<(String, String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let key = parse_key(&asset, &timeframe, &timestamp)?;
    let record = state
        .ledger
        .audit(&key)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("no audit record for {key}")))?;
    let integrity_ok = state.ledger.verify_integrity(&key).unwrap_or(false);
    if !integrity_ok {
        warn!(key = %key, "stored result failed integrity check");
    }
    Ok(Json(AuditResponse {
        record,
        integrity_ok,
        history: state.ledger.history_for(&key),
    }))
}

/// Every evaluation row logged for the key, including rows from earlier
/// recomputations with different inputs.
async fn evaluations_at(
    State(state): State<Arc<AppState>>,
    Path((asset, timeframe, timestamp)): Path<(String, String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let key = parse_key(&asset, &timeframe, &timestamp)?;
    Ok(Json(state.ledger.evaluations_for(&key)))
}

#[derive(Deserialize)]
struct LimitQuery {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

async fn decisions(State(state): State<Arc<AppState>>, Query(q): Query<LimitQuery>) -> impl IntoResponse {
    Json(state.ledger.recent(q.limit))
}

async fn anomalies(State(state): State<Arc<AppState>>, Query(q): Query<LimitQuery>) -> impl IntoResponse {
    Json(state.ledger.anomalies(q.limit))
}

async fn failures(State(state): State<Arc<AppState>>, Query(q): Query<LimitQuery>) -> impl IntoResponse {
    Json(state.ledger.failures(q.limit))
}

// =============================================================================
// Gate control
// =============================================================================

async fn gate_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.gate.status())
}

#[derive(Deserialize)]
struct KillRequest {
    reason: String,
}

#[derive(Serialize)]
struct ControlResponse {
    manual_override: bool,
    message: String,
}

async fn control_kill(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<KillRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let reason = req.reason.trim();
    if reason.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "kill requires a reason"));
    }
    state.gate.kill(reason);
    state.increment_version();
    Ok(Json(ControlResponse {
        manual_override: true,
        message: format!("all streams BLOCKED: {reason}"),
    }))
}

async fn control_release(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let released = state.gate.release();
    state.increment_version();
    Json(ControlResponse {
        manual_override: false,
        message: if released {
            "manual override released".to_string()
        } else {
            "no manual override was engaged".to_string()
        },
    })
}

// =============================================================================
// Configuration
// =============================================================================

async fn get_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(EngineConfig::clone(&state.config()))
}

#[derive(Deserialize)]
struct SetConfigRequest {
    config: EngineConfig,
    #[serde(default)]
    persist: bool,
}

async fn set_config(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<SetConfigRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let installed = state
        .replace_config(req.config)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;
    if req.persist {
        installed
            .save(&state.config_path)
            .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}")))?;
    }
    Ok(Json(serde_json::json!({
        "config_version": installed.config_version,
        "config_hash": installed.config_hash(),
        "persisted": req.persist,
    })))
}

// =============================================================================
// Ingest, baselines, backfill
// =============================================================================

#[derive(Deserialize)]
struct IngestRequest {
    asset: String,
    timeframe: Timeframe,
    timestamp: DateTime<Utc>,
    inputs: CycleInputs,
    /// Run the cycle immediately instead of waiting for the scheduler.
    #[serde(default)]
    run: bool,
}

async fn ingest(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<IngestRequest>,
) -> impl IntoResponse {
    let key = ScoreKey::new(req.asset.to_uppercase(), req.timeframe, req.timestamp);
    state.source.push_cycle(key.clone(), req.inputs);
    info!(key = %key, "cycle inputs ingested");

    if req.run {
        let envelope = state.runner.run_cycle(state.config(), key).await;
        state.increment_version();
        Json(serde_json::json!({ "ingested": true, "envelope": envelope }))
    } else {
        Json(serde_json::json!({ "ingested": true }))
    }
}

#[derive(Deserialize)]
struct Observation {
    metric: String,
    at: DateTime<Utc>,
    value: f64,
}

#[derive(Deserialize)]
struct HistoryRequest {
    asset: String,
    timeframe: Timeframe,
    observations: Vec<Observation>,
}

async fn ingest_history(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<HistoryRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(bad) = req.observations.iter().find(|o| !o.value.is_finite()) {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("non-finite value for {} at {}", bad.metric, bad.at),
        ));
    }
    let asset = req.asset.to_uppercase();
    for o in &req.observations {
        state
            .source
            .push_observation(&asset, req.timeframe, &o.metric, o.at, o.value);
    }
    Ok(Json(serde_json::json!({ "stored": req.observations.len() })))
}

#[derive(Deserialize)]
struct RecalculateRequest {
    asset: String,
    timeframe: Timeframe,
    #[serde(default)]
    as_of: Option<DateTime<Utc>>,
}

async fn recalculate_baselines(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<RecalculateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let config = state.config();
    let as_of = req.as_of.unwrap_or_else(|| req.timeframe.align(Utc::now()));
    let written = state
        .runner
        .recalculate_baselines(&config, &req.asset.to_uppercase(), req.timeframe, as_of)
        .await
        .map_err(|e| api_error(StatusCode::BAD_GATEWAY, e.to_string()))?;
    state.increment_version();
    Ok(Json(serde_json::json!({ "written": written, "as_of": as_of })))
}

#[derive(Deserialize)]
struct BackfillRequest {
    asset: String,
    timeframe: Timeframe,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
}

#[derive(Serialize)]
struct BackfillResponse {
    processed: usize,
    failed: usize,
    blocked: usize,
}

async fn backfill(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<BackfillRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.from > req.to {
        return Err(api_error(StatusCode::BAD_REQUEST, "from is after to"));
    }
    let asset = req.asset.to_uppercase();
    let timestamps = state
        .source
        .cycle_timestamps(&asset, req.timeframe, req.from, req.to);
    let out = state
        .scheduler()
        .backfill(&asset, req.timeframe, timestamps)
        .await;
    state.increment_version();
    Ok(Json(BackfillResponse {
        processed: out.len(),
        failed: out.iter().filter(|e| e.cycle_failed).count(),
        blocked: out.iter().filter(|e| !e.is_usable()).count(),
    }))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    const TOKEN: &str = "test-operator-token";

    fn app() -> (Arc<AppState>, Router) {
        std::env::set_var(crate::api::auth::ADMIN_TOKEN_ENV, TOKEN);
        let state = Arc::new(AppState::new(EngineConfig::default(), "unused.json"));
        (state.clone(), router(state))
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value, token: Option<&str>) -> Request<Body> {
        let mut req = Request::post(uri).header("content-type", "application/json");
        if let Some(t) = token {
            req = req.header("authorization", format!("Bearer {t}"));
        }
        req.body(Body::from(body.to_string())).unwrap()
    }

    #[test]
    fn key_parsing() {
        let key = parse_key("btc", "4h", "2024-01-01T04:00:00Z").unwrap();
        assert_eq!(key.asset, "BTC");
        assert_eq!(key.timeframe, Timeframe::H4);
        assert_eq!(parse_key("btc", "2h", "2024-01-01T04:00:00Z").unwrap_err().0, StatusCode::BAD_REQUEST);
        assert_eq!(parse_key("btc", "1h", "yesterday").unwrap_err().0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_is_public() {
        let (_, app) = app();
        let resp = app
            .oneshot(Request::get("/api/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["status"], "ok");
    }

    #[tokio::test]
    async fn kill_requires_token() {
        let (state, app) = app();
        let resp = app
            .oneshot(post_json("/api/v1/control/kill", serde_json::json!({ "reason": "x" }), None))
            .await
            .unwrap();
        assert_ne!(resp.status(), StatusCode::OK);
        assert!(state.gate.manual_override().is_none());
    }

    #[tokio::test]
    async fn kill_then_ingest_returns_blocked_artifact() {
        let (state, app) = app();
        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/v1/control/kill",
                serde_json::json!({ "reason": "exchange outage" }),
                Some(TOKEN),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(state.gate.manual_override().is_some());

        let resp = app
            .clone()
            .oneshot(post_json(
                "/api/v1/ingest",
                serde_json::json!({
                    "asset": "btc",
                    "timeframe": "1h",
                    "timestamp": "2024-05-01T10:00:00Z",
                    "inputs": { "metrics": { "tx_count": 10.0 }, "data_completeness": 1.0 },
                    "run": true
                }),
                Some(TOKEN),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["envelope"]["state"], "BLOCKED");
        assert_eq!(body["envelope"]["block_reason"], "manual_override");

        let resp = app
            .oneshot(
                Request::get("/api/v1/latest/BTC/1h")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["asset"], "BTC");
        assert_eq!(body["timeframe"], "1h");
    }

    #[tokio::test]
    async fn unknown_stream_is_not_found() {
        let (_, app) = app();
        let resp = app
            .oneshot(
                Request::get("/api/v1/audit/ETH/1d/2024-01-01T00:00:00Z")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
