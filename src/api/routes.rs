//! Route Definitions

use super::{handlers::*, websocket::websocket_handler};
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

/// Build the API router with all endpoints
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        // Round lifecycle
        .route("/api/round", post(create_round_handler))
        .route("/api/round/current", get(current_round_handler))
        .route("/api/round/:id", get(round_handler))
        .route("/api/round/:id/status", post(update_status_handler))
        // Bets
        .route("/api/round/:id/bet", post(place_bet_handler))
        .route("/api/round/:id/cashout", post(cashout_handler))
        .route("/api/round/:id/bets", get(bets_handler))
        .route("/api/round/:id/verify", get(verify_handler))
        .route("/ws", get(websocket_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
