//! API Request and Response Models

use crate::ledger::{Bet, SettlementKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Banner returned by `GET /`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BannerResponse {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    /// `persistent` or `ephemeral`
    pub storage: String,
    pub storage_healthy: bool,
    pub open_rounds: usize,
    pub websocket_clients: u64,
    pub version: String,
}

/// `POST /api/round`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateRoundRequest {
    #[serde(default)]
    pub k: Option<f64>,
    #[serde(default)]
    pub delay_seconds: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusQuery {
    pub status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

/// `POST /api/round/:id/bet`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceBetRequest {
    pub player_id: String,
    pub amount: f64,
    #[serde(default)]
    pub auto_cashout: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceBetResponse {
    pub bet_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CashoutQuery {
    pub at_multiplier: Option<f64>,
}

/// `POST /api/round/:id/cashout`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CashoutRequest {
    pub player_id: String,
    #[serde(default)]
    pub bet_id: Option<String>,
}

/// One bet as listed by `GET /api/round/:id/bets`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BetResponse {
    pub bet_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persisted_id: Option<String>,
    pub player_id: String,
    pub amount: f64,
    pub auto_cashout: Option<f64>,
    pub placed_at: DateTime<Utc>,
    pub cashed_out_at: Option<f64>,
    pub profit: Option<f64>,
    pub settlement: Option<SettlementKind>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl From<&Bet> for BetResponse {
    fn from(bet: &Bet) -> Self {
        let settlement = bet.settlement();
        Self {
            bet_id: bet.id().to_string(),
            persisted_id: bet.persisted_id().map(str::to_string),
            player_id: bet.player_id().to_string(),
            amount: bet.amount(),
            auto_cashout: bet.auto_cashout(),
            placed_at: bet.placed_at(),
            cashed_out_at: bet.cashed_out_at(),
            profit: bet.profit(),
            settlement: settlement.map(|s| s.kind),
            settled_at: settlement.map(|s| s.settled_at),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BetsResponse {
    pub round_id: String,
    pub bets: Vec<BetResponse>,
}
