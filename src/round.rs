//! Round state and multiplier curve
//!
//! A round commits to its crash point at creation. The live multiplier is
//! `exp(k * t)` where `t` is the time elapsed since `start_time`, and the
//! round crashes the first time that curve reaches `crash_at`.

use crate::{
    errors::{CrashError, CrashResult},
    fairness,
    types::RoundId,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

/// Round lifecycle status. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundStatus {
    Scheduled,
    Running,
    Crashed,
}

impl RoundStatus {
    pub fn can_transition_to(self, to: RoundStatus) -> bool {
        matches!(
            (self, to),
            (RoundStatus::Scheduled, RoundStatus::Running) | (RoundStatus::Running, RoundStatus::Crashed)
        )
    }

    /// Scheduled or running
    pub fn is_open(self) -> bool {
        self != RoundStatus::Crashed
    }
}

impl fmt::Display for RoundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoundStatus::Scheduled => write!(f, "scheduled"),
            RoundStatus::Running => write!(f, "running"),
            RoundStatus::Crashed => write!(f, "crashed"),
        }
    }
}

impl FromStr for RoundStatus {
    type Err = CrashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scheduled" => Ok(RoundStatus::Scheduled),
            "running" => Ok(RoundStatus::Running),
            "crashed" => Ok(RoundStatus::Crashed),
            other => Err(CrashError::validation(
                "status",
                format!("unknown status '{}', expected scheduled|running|crashed", other),
            )),
        }
    }
}

/// Floor a multiplier to two decimals so the shown value never exceeds the
/// true one
pub fn floor_multiplier(multiplier: f64) -> f64 {
    (multiplier * 100.0).floor() / 100.0
}

/// One crash round
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Round {
    id: RoundId,
    persisted_id: Option<String>,
    server_seed: String,
    start_time: DateTime<Utc>,
    crash_at: f64,
    k: f64,
    status: RoundStatus,
    created_at: DateTime<Utc>,
    crashed_time: Option<DateTime<Utc>>,
    final_multiplier: Option<f64>,
}

impl Round {
    /// Schedule a round with a freshly generated seed
    pub fn new(k: f64, start_time: DateTime<Utc>, now: DateTime<Utc>) -> CrashResult<Self> {
        Self::with_seed(fairness::generate_server_seed(), k, start_time, now)
    }

    /// Schedule a round committed to a caller-provided seed
    pub fn with_seed(
        server_seed: String,
        k: f64,
        start_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> CrashResult<Self> {
        if !k.is_finite() || k <= 0.0 {
            return Err(CrashError::validation("k", "growth constant must be positive and finite"));
        }
        if server_seed.is_empty() {
            return Err(CrashError::validation("server_seed", "seed must not be empty"));
        }

        let crash_at = fairness::derive_crash_point(&server_seed);
        Ok(Self {
            id: RoundId::new(),
            persisted_id: None,
            server_seed,
            start_time,
            crash_at,
            k,
            status: RoundStatus::Scheduled,
            created_at: now,
            crashed_time: None,
            final_multiplier: None,
        })
    }

    pub fn id(&self) -> RoundId {
        self.id
    }

    pub fn persisted_id(&self) -> Option<&str> {
        self.persisted_id.as_deref()
    }

    pub fn attach_persisted_id(&mut self, persisted_id: String) {
        self.persisted_id = Some(persisted_id);
    }

    pub fn server_seed(&self) -> &str {
        &self.server_seed
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn crash_at(&self) -> f64 {
        self.crash_at
    }

    pub fn k(&self) -> f64 {
        self.k
    }

    pub fn status(&self) -> RoundStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn crashed_time(&self) -> Option<DateTime<Utc>> {
        self.crashed_time
    }

    pub fn final_multiplier(&self) -> Option<f64> {
        self.final_multiplier
    }

    /// Seconds since start, zero before start
    pub fn elapsed_secs(&self, now: DateTime<Utc>) -> f64 {
        let elapsed = now - self.start_time;
        match elapsed.num_microseconds() {
            Some(us) if us > 0 => us as f64 / 1_000_000.0,
            Some(_) => 0.0,
            None if elapsed > Duration::zero() => f64::MAX,
            None => 0.0,
        }
    }

    /// `exp(k * t)`; 1.0 at and before start
    pub fn multiplier_at(&self, now: DateTime<Utc>) -> f64 {
        (self.k * self.elapsed_secs(now)).exp()
    }

    /// Seconds after start at which the curve reaches `crash_at`
    pub fn crash_elapsed_secs(&self) -> f64 {
        self.crash_at.ln() / self.k
    }

    pub fn crash_time(&self) -> DateTime<Utc> {
        let micros = (self.crash_elapsed_secs() * 1_000_000.0).ceil() as i64;
        self.start_time + Duration::microseconds(micros)
    }

    /// Whether the curve has reached the crash point at `now`
    pub fn crash_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.start_time && self.multiplier_at(now) >= self.crash_at
    }

    /// Status implied by the time rules at `now`, without mutating.
    ///
    /// Request paths use this to re-check status at call time instead of
    /// trusting the last tick.
    pub fn status_at(&self, now: DateTime<Utc>) -> RoundStatus {
        match self.status {
            RoundStatus::Crashed => RoundStatus::Crashed,
            _ if self.crash_due(now) => RoundStatus::Crashed,
            RoundStatus::Running => RoundStatus::Running,
            RoundStatus::Scheduled if now >= self.start_time => RoundStatus::Running,
            RoundStatus::Scheduled => RoundStatus::Scheduled,
        }
    }

    /// Apply the next time-driven transition that is due, if any.
    ///
    /// Moves at most one step so callers can settle bets between
    /// `running` and `crashed`.
    pub fn advance(&mut self, now: DateTime<Utc>) -> CrashResult<Option<RoundStatus>> {
        let next = match self.status {
            RoundStatus::Scheduled if now >= self.start_time => RoundStatus::Running,
            RoundStatus::Running if self.crash_due(now) => RoundStatus::Crashed,
            _ => return Ok(None),
        };
        self.transition(next, now)?;
        Ok(Some(next))
    }

    /// Move to `to`, failing on any move other than scheduled → running or
    /// running → crashed
    pub fn transition(&mut self, to: RoundStatus, now: DateTime<Utc>) -> CrashResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(CrashError::InvalidTransition { from: self.status, to });
        }

        if to == RoundStatus::Crashed {
            let live = self.multiplier_at(now);
            self.final_multiplier = Some(live.min(self.crash_at));
            self.crashed_time = Some(if live >= self.crash_at { now.min(self.crash_time()) } else { now });
        }
        self.status = to;
        Ok(())
    }

    /// Public descriptor. Crash point and seed only appear once crashed.
    pub fn view(&self, now: DateTime<Utc>) -> RoundView {
        let crashed = self.status == RoundStatus::Crashed;
        let multiplier = match self.status {
            RoundStatus::Scheduled => 1.0,
            RoundStatus::Running => floor_multiplier(self.multiplier_at(now).min(self.crash_at)),
            RoundStatus::Crashed => self.final_multiplier.unwrap_or(self.crash_at),
        };

        RoundView {
            id: self.id.to_string(),
            persisted_id: self.persisted_id.clone(),
            start_time: self.start_time,
            k: self.k,
            status: self.status,
            multiplier,
            crash_at: crashed.then_some(self.crash_at),
            server_seed: crashed.then(|| self.server_seed.clone()),
            crashed_time: self.crashed_time,
        }
    }
}

/// Client-facing round descriptor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoundView {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persisted_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub k: f64,
    pub status: RoundStatus,
    /// Live multiplier floored to two decimals (final multiplier once crashed)
    pub multiplier: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crash_at: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_seed: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crashed_time: Option<DateTime<Utc>>,
}
