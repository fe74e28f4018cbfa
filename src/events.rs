//! Round events published to observers (WebSocket clients, logs)

use crate::{ledger::Settlement, round::RoundView};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoundEvent {
    RoundCreated {
        round: RoundView,
    },
    RoundStarted {
        round_id: String,
        start_time: DateTime<Utc>,
    },
    /// Live multiplier of a running round, once per tick
    Multiplier {
        round_id: String,
        multiplier: f64,
        elapsed_secs: f64,
    },
    BetPlaced {
        round_id: String,
        bet_id: String,
        player_id: String,
        amount: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        auto_cashout: Option<f64>,
    },
    BetSettled {
        settlement: Settlement,
    },
    /// Crash point and seed are revealed here for verification
    RoundCrashed {
        round_id: String,
        crash_at: f64,
        final_multiplier: f64,
        server_seed: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        crashed_time: Option<DateTime<Utc>>,
    },
}

impl RoundEvent {
    pub fn round_id(&self) -> String {
        match self {
            RoundEvent::RoundCreated { round } => round.id.clone(),
            RoundEvent::RoundStarted { round_id, .. }
            | RoundEvent::Multiplier { round_id, .. }
            | RoundEvent::BetPlaced { round_id, .. }
            | RoundEvent::RoundCrashed { round_id, .. } => round_id.clone(),
            RoundEvent::BetSettled { settlement } => settlement.round_id.to_string(),
        }
    }
}

/// Broadcast fan-out of round events
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RoundEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to current subscribers; dropped silently when nobody listens
    pub fn publish(&self, event: RoundEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoundEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
