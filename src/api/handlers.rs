//! Request Handlers
//!
//! Thin adapters over [`CrashEngine`]: parse, call, map errors.

use super::{errors::ApiError, middleware::RequestId, models::*, websocket::WebSocketManager};
use crate::{
    engine::CrashEngine,
    errors::CrashError,
    fairness::FairnessProof,
    ledger::Settlement,
    round::{RoundStatus, RoundView},
    types::{BetId, RoundId},
};
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use std::sync::Arc;

/// Shared application state
pub struct AppState {
    pub engine: Arc<CrashEngine>,
    pub websocket_manager: Arc<WebSocketManager>,
    pub version: String,
    pub enable_metrics: bool,
}

impl AppState {
    pub fn new(engine: Arc<CrashEngine>, enable_metrics: bool) -> Self {
        Self {
            websocket_manager: Arc::new(WebSocketManager::new(engine.clone())),
            engine,
            version: env!("CARGO_PKG_VERSION").to_string(),
            enable_metrics,
        }
    }
}

fn engine_error(request_id: &RequestId) -> impl Fn(CrashError) -> ApiError + '_ {
    move |e| ApiError::from_crash(request_id.0.clone(), e)
}

/// Accepts the engine-local id or the persisted id
async fn resolve_round_id(state: &AppState, request_id: &RequestId, raw: &str) -> Result<RoundId, ApiError> {
    state.engine.resolve_round_id(raw).await.map_err(engine_error(request_id))
}

/// GET /
pub async fn root_handler() -> Json<BannerResponse> {
    Json(BannerResponse {
        message: "Crash backend ready".to_string(),
    })
}

/// GET /health
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        storage: state.engine.storage_mode().to_string(),
        storage_healthy: state.engine.storage_healthy().await,
        open_rounds: state.engine.open_round_count(),
        websocket_clients: state.websocket_manager.client_count(),
        version: state.version.clone(),
    })
}

/// POST /api/round
pub async fn create_round_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    body: Option<Json<CreateRoundRequest>>,
) -> Result<(StatusCode, Json<RoundView>), ApiError> {
    let Json(request) = body.unwrap_or_default();
    let view = state
        .engine
        .create_round(request.k, request.delay_seconds)
        .await
        .map_err(engine_error(&request_id))?;
    Ok((StatusCode::CREATED, Json(view)))
}

/// GET /api/round/current
pub async fn current_round_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<RoundView>, ApiError> {
    let view = state.engine.current_round().await.map_err(engine_error(&request_id))?;
    Ok(Json(view))
}

/// GET /api/round/:id
pub async fn round_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RoundView>, ApiError> {
    let round_id = resolve_round_id(&state, &request_id, &id).await?;
    let view = state.engine.round(round_id).await.map_err(engine_error(&request_id))?;
    Ok(Json(view))
}

/// POST /api/round/:id/status?status={scheduled|running|crashed}
pub async fn update_status_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<StatusQuery>,
) -> Result<Json<OkResponse>, ApiError> {
    let round_id = resolve_round_id(&state, &request_id, &id).await?;
    let raw = params
        .status
        .ok_or_else(|| ApiError::validation(request_id.0.clone(), "Missing query parameter 'status'".to_string()))?;
    let status: RoundStatus = raw.parse().map_err(engine_error(&request_id))?;

    state
        .engine
        .update_round_status(round_id, status)
        .await
        .map_err(engine_error(&request_id))?;
    Ok(Json(OkResponse { ok: true }))
}

/// POST /api/round/:id/bet
pub async fn place_bet_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<PlaceBetRequest>,
) -> Result<Json<PlaceBetResponse>, ApiError> {
    let round_id = resolve_round_id(&state, &request_id, &id).await?;
    let bet_id = state
        .engine
        .place_bet(round_id, &request.player_id, request.amount, request.auto_cashout)
        .await
        .map_err(engine_error(&request_id))?;
    Ok(Json(PlaceBetResponse {
        bet_id: bet_id.to_string(),
    }))
}

/// POST /api/round/:id/cashout?at_multiplier={x}
pub async fn cashout_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<CashoutQuery>,
    Json(request): Json<CashoutRequest>,
) -> Result<Json<Settlement>, ApiError> {
    let round_id = resolve_round_id(&state, &request_id, &id).await?;
    let at_multiplier = params.at_multiplier.ok_or_else(|| {
        ApiError::validation(request_id.0.clone(), "Missing query parameter 'at_multiplier'".to_string())
    })?;
    let bet_id = request
        .bet_id
        .as_deref()
        .map(str::parse::<BetId>)
        .transpose()
        .map_err(engine_error(&request_id))?;

    let settlement = state
        .engine
        .cashout(round_id, &request.player_id, bet_id, at_multiplier)
        .await
        .map_err(engine_error(&request_id))?;
    Ok(Json(settlement))
}

/// GET /api/round/:id/bets
pub async fn bets_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<BetsResponse>, ApiError> {
    let round_id = resolve_round_id(&state, &request_id, &id).await?;
    let bets = state.engine.bets(round_id).await.map_err(engine_error(&request_id))?;
    Ok(Json(BetsResponse {
        round_id: round_id.to_string(),
        bets: bets.iter().map(BetResponse::from).collect(),
    }))
}

/// GET /api/round/:id/verify
pub async fn verify_handler(
    Extension(request_id): Extension<RequestId>,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<FairnessProof>, ApiError> {
    let round_id = resolve_round_id(&state, &request_id, &id).await?;
    let proof = state.engine.verify_round(round_id).await.map_err(engine_error(&request_id))?;
    Ok(Json(proof))
}

/// GET /metrics
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    if !state.enable_metrics {
        return StatusCode::NOT_FOUND.into_response();
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.engine.metrics().render(),
    )
        .into_response()
}
