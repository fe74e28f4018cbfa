//! Crashpoint - Provably-Fair Crash Round Engine
//!
//! A round commits to a crash point derived from a server seed, its
//! multiplier grows as `exp(k * t)` from the start time, and it crashes the
//! first time the curve reaches that point. Players bet before or during the
//! run and cash out automatically at a target or manually at the live
//! multiplier; everything unsettled at the crash is lost.

pub mod api;
pub mod clock;
pub mod config;
pub mod engine;
pub mod errors;
pub mod events;
pub mod fairness;
pub mod ledger;
pub mod metrics;
pub mod round;
pub mod scheduler;
pub mod storage;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigLoader, CrashConfig};
pub use engine::{CrashEngine, TickOutcome, TickReport};
pub use errors::{CrashError, CrashResult, StorageError};
pub use events::{EventBus, RoundEvent};
pub use fairness::{derive_crash_point, verify, FairnessProof};
pub use ledger::{Bet, BetLedger, Settlement, SettlementKind};
pub use metrics::EngineMetrics;
pub use round::{Round, RoundStatus, RoundView};
pub use scheduler::RoundScheduler;
pub use storage::{RocksRoundStore, RoundStore};
pub use types::{BetId, RoundId};
