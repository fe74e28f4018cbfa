//! Error types for the crash round engine
//!
//! Every rejection the engine can produce maps onto one variant of
//! [`CrashError`]. Storage failures have their own enum because the engine
//! downgrades them to warnings instead of failing the request.

use crate::{
    ledger::Settlement,
    round::RoundStatus,
    types::{BetId, RoundId},
};
use thiserror::Error;

/// Root error type for all engine operations
#[derive(Debug, Error)]
pub enum CrashError {
    /// Bad amount, multiplier, player id or malformed id
    #[error("Invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("Round {0} not found")]
    RoundNotFound(RoundId),

    #[error("No round with persisted id {0}")]
    PersistedIdNotFound(String),

    #[error("Bet {0} not found")]
    BetNotFound(String),

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: RoundStatus, to: RoundStatus },

    /// Placement attempted on a round that no longer accepts bets
    #[error("Round {round_id} is {status}; betting is closed")]
    BettingClosed { round_id: RoundId, status: RoundStatus },

    /// Cashout attempted while the round is not running
    #[error("Round {round_id} is {status}; cashout requires a running round")]
    RoundNotRunning { round_id: RoundId, status: RoundStatus },

    #[error("Bet {bet_id} already settled at {:.2}x", .settlement.cashed_out_at)]
    AlreadySettled { bet_id: BetId, settlement: Settlement },

    /// Client asserted a multiplier the engine has not reached yet
    #[error("Requested multiplier {requested:.2}x exceeds live multiplier {live:.4}x")]
    StaleMultiplier { requested: f64, live: f64 },

    /// Verification requested before the seed is revealed
    #[error("Round {round_id} is {status}; the seed is revealed once it crashes")]
    NotRevealed { round_id: RoundId, status: RoundStatus },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl CrashError {
    pub fn validation(field: &str, reason: impl Into<String>) -> Self {
        CrashError::Validation {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// Short machine-readable reason, used as a metrics label
    pub fn reason(&self) -> &'static str {
        match self {
            CrashError::Validation { .. } => "validation",
            CrashError::RoundNotFound(_) | CrashError::PersistedIdNotFound(_) => "round_not_found",
            CrashError::BetNotFound(_) => "bet_not_found",
            CrashError::InvalidTransition { .. } => "invalid_transition",
            CrashError::BettingClosed { .. } => "betting_closed",
            CrashError::RoundNotRunning { .. } => "round_not_running",
            CrashError::AlreadySettled { .. } => "already_settled",
            CrashError::StaleMultiplier { .. } => "stale_multiplier",
            CrashError::NotRevealed { .. } => "not_revealed",
            CrashError::Storage(_) => "storage",
            CrashError::Configuration(_) => "configuration",
            CrashError::Metrics(_) => "metrics",
        }
    }
}

/// Persistence collaborator failures
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Database open failed: {0}")]
    DatabaseOpenFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Corrupted data: {0}")]
    CorruptedData(String),
}

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid value for {field}: '{value}' ({reason})")]
    InvalidValue { field: String, value: String, reason: String },

    #[error("Missing required field: {0}")]
    MissingRequired(String),

    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("Failed to save configuration: {0}")]
    SaveFailed(String),
}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::WriteFailed(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::CorruptedData(e.to_string())
    }
}

/// Convenience type alias for Results
pub type CrashResult<T> = Result<T, CrashError>;
