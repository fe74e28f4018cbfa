//! Bet ledger for a single round
//!
//! Owns placement, auto-cashout sweeps, manual cashouts and crash
//! finalization. The ledger reads the round it is handed but never mutates
//! it; round status is written only by the lifecycle code in `round`.

use crate::{
    errors::{CrashError, CrashResult},
    fairness::MIN_CRASH_POINT,
    round::{Round, RoundStatus},
    types::{BetId, RoundId},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const MAX_PLAYER_ID_LEN: usize = 128;

/// How a bet was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementKind {
    Auto,
    Manual,
    Loss,
}

impl SettlementKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SettlementKind::Auto => "auto",
            SettlementKind::Manual => "manual",
            SettlementKind::Loss => "loss",
        }
    }
}

/// Final outcome of a bet, fixed once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    pub bet_id: BetId,
    pub round_id: RoundId,
    pub player_id: String,
    pub kind: SettlementKind,
    pub cashed_out_at: f64,
    pub profit: f64,
    pub settled_at: DateTime<Utc>,
}

/// `amount * (multiplier - 1)` rounded to cents
pub fn compute_profit(amount: f64, multiplier: f64) -> f64 {
    (amount * (multiplier - 1.0) * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bet {
    id: BetId,
    persisted_id: Option<String>,
    round_id: RoundId,
    player_id: String,
    amount: f64,
    auto_cashout: Option<f64>,
    placed_at: DateTime<Utc>,
    settlement: Option<Settlement>,
}

impl Bet {
    pub fn id(&self) -> BetId {
        self.id
    }

    pub fn persisted_id(&self) -> Option<&str> {
        self.persisted_id.as_deref()
    }

    pub fn round_id(&self) -> RoundId {
        self.round_id
    }

    pub fn player_id(&self) -> &str {
        &self.player_id
    }

    pub fn amount(&self) -> f64 {
        self.amount
    }

    pub fn auto_cashout(&self) -> Option<f64> {
        self.auto_cashout
    }

    pub fn placed_at(&self) -> DateTime<Utc> {
        self.placed_at
    }

    pub fn settlement(&self) -> Option<&Settlement> {
        self.settlement.as_ref()
    }

    pub fn is_settled(&self) -> bool {
        self.settlement.is_some()
    }

    pub fn cashed_out_at(&self) -> Option<f64> {
        self.settlement.as_ref().map(|s| s.cashed_out_at)
    }

    pub fn profit(&self) -> Option<f64> {
        self.settlement.as_ref().map(|s| s.profit)
    }

    pub fn attach_persisted_id(&mut self, persisted_id: String) {
        self.persisted_id = Some(persisted_id);
    }

    fn settle(&mut self, kind: SettlementKind, multiplier: f64, profit: f64, now: DateTime<Utc>) -> CrashResult<Settlement> {
        if let Some(prior) = &self.settlement {
            return Err(CrashError::AlreadySettled {
                bet_id: self.id,
                settlement: prior.clone(),
            });
        }

        let settlement = Settlement {
            bet_id: self.id,
            round_id: self.round_id,
            player_id: self.player_id.clone(),
            kind,
            cashed_out_at: multiplier,
            profit,
            settled_at: now,
        };
        self.settlement = Some(settlement.clone());
        Ok(settlement)
    }
}

/// All bets of one round, in placement order
#[derive(Debug, Clone)]
pub struct BetLedger {
    round_id: RoundId,
    bets: Vec<Bet>,
    index: HashMap<BetId, usize>,
}

impl BetLedger {
    pub fn new(round_id: RoundId) -> Self {
        Self {
            round_id,
            bets: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn round_id(&self) -> RoundId {
        self.round_id
    }

    pub fn bets(&self) -> &[Bet] {
        &self.bets
    }

    pub fn get(&self, bet_id: BetId) -> Option<&Bet> {
        self.index.get(&bet_id).map(|&i| &self.bets[i])
    }

    pub fn unsettled_count(&self) -> usize {
        self.bets.iter().filter(|b| !b.is_settled()).count()
    }

    pub fn attach_persisted_id(&mut self, bet_id: BetId, persisted_id: String) {
        if let Some(&i) = self.index.get(&bet_id) {
            self.bets[i].attach_persisted_id(persisted_id);
        }
    }

    /// Record a new unsettled bet.
    ///
    /// Legal while the round is scheduled or running at `now`. While running,
    /// an auto-cashout at or below the live multiplier is refused because it
    /// would settle at a point the bet never rode.
    pub fn place(
        &mut self,
        round: &Round,
        now: DateTime<Utc>,
        player_id: &str,
        amount: f64,
        auto_cashout: Option<f64>,
    ) -> CrashResult<BetId> {
        let status = round.status_at(now);
        if !status.is_open() {
            return Err(CrashError::BettingClosed { round_id: round.id(), status });
        }

        let player_id = player_id.trim();
        if player_id.is_empty() {
            return Err(CrashError::validation("player_id", "must not be empty"));
        }
        if player_id.len() > MAX_PLAYER_ID_LEN {
            return Err(CrashError::validation(
                "player_id",
                format!("must be at most {} characters", MAX_PLAYER_ID_LEN),
            ));
        }
        if !amount.is_finite() || amount <= 0.0 {
            return Err(CrashError::validation("amount", "must be a positive number"));
        }
        if let Some(target) = auto_cashout {
            if !target.is_finite() || target < MIN_CRASH_POINT {
                return Err(CrashError::validation(
                    "auto_cashout",
                    format!("must be at least {:.2}", MIN_CRASH_POINT),
                ));
            }
            if status == RoundStatus::Running && target <= round.multiplier_at(now) {
                return Err(CrashError::validation(
                    "auto_cashout",
                    "must be above the current multiplier",
                ));
            }
        }

        let bet = Bet {
            id: BetId::new(),
            persisted_id: None,
            round_id: self.round_id,
            player_id: player_id.to_string(),
            amount,
            auto_cashout,
            placed_at: now,
            settlement: None,
        };
        let bet_id = bet.id;
        self.index.insert(bet_id, self.bets.len());
        self.bets.push(bet);
        Ok(bet_id)
    }

    /// Settle every unsettled bet whose auto-cashout the curve has reached.
    ///
    /// The effective multiplier is capped at `crash_at`, so a threshold equal
    /// to the crash point still pays out. Bets are visited in placement order.
    pub fn evaluate_auto_cashouts(
        &mut self,
        round: &Round,
        current_multiplier: f64,
        now: DateTime<Utc>,
    ) -> Vec<Settlement> {
        if round.status() != RoundStatus::Running {
            return Vec::new();
        }

        let reached = current_multiplier.min(round.crash_at());
        let mut settled = Vec::new();
        for bet in self.bets.iter_mut().filter(|b| !b.is_settled()) {
            let Some(target) = bet.auto_cashout else {
                continue;
            };
            if target > reached {
                continue;
            }
            let profit = compute_profit(bet.amount, target);
            if let Ok(settlement) = bet.settle(SettlementKind::Auto, target, profit, now) {
                settled.push(settlement);
            }
        }
        settled
    }

    /// Cash out the player's most recent unsettled bet at `requested`
    pub fn manual_cashout(
        &mut self,
        round: &Round,
        now: DateTime<Utc>,
        player_id: &str,
        requested: f64,
    ) -> CrashResult<Settlement> {
        let player_id = player_id.trim();
        let mut latest_settled = None;
        let mut target = None;
        for (i, bet) in self.bets.iter().enumerate().rev() {
            if bet.player_id != player_id {
                continue;
            }
            if !bet.is_settled() {
                target = Some(i);
                break;
            }
            latest_settled.get_or_insert(i);
        }

        match (target, latest_settled) {
            (Some(i), _) => self.cashout_at(i, round, now, requested),
            (None, Some(i)) => {
                let bet = &self.bets[i];
                Err(CrashError::AlreadySettled {
                    bet_id: bet.id,
                    settlement: bet.settlement.clone().ok_or_else(|| CrashError::BetNotFound(bet.id.to_string()))?,
                })
            }
            (None, None) => Err(CrashError::BetNotFound(format!("player {} in round {}", player_id, self.round_id))),
        }
    }

    /// Cash out a specific bet at `requested`
    pub fn cashout_bet(
        &mut self,
        round: &Round,
        now: DateTime<Utc>,
        bet_id: BetId,
        requested: f64,
    ) -> CrashResult<Settlement> {
        let i = *self
            .index
            .get(&bet_id)
            .ok_or_else(|| CrashError::BetNotFound(bet_id.to_string()))?;
        self.cashout_at(i, round, now, requested)
    }

    fn cashout_at(&mut self, i: usize, round: &Round, now: DateTime<Utc>, requested: f64) -> CrashResult<Settlement> {
        if let Some(prior) = &self.bets[i].settlement {
            return Err(CrashError::AlreadySettled {
                bet_id: self.bets[i].id,
                settlement: prior.clone(),
            });
        }
        if !requested.is_finite() || requested < 1.0 {
            return Err(CrashError::validation("at_multiplier", "must be a number of at least 1.00"));
        }
        let status = round.status_at(now);
        if status != RoundStatus::Running {
            return Err(CrashError::RoundNotRunning {
                round_id: round.id(),
                status,
            });
        }

        // The engine's own clock is authoritative, never the client's value.
        let live = round.multiplier_at(now);
        if requested > live || requested > round.crash_at() {
            return Err(CrashError::StaleMultiplier { requested, live });
        }

        let bet = &mut self.bets[i];
        let profit = compute_profit(bet.amount, requested);
        bet.settle(SettlementKind::Manual, requested, profit, now)
    }

    /// Settle every remaining bet as a total loss once the round has crashed
    pub fn finalize_on_crash(&mut self, round: &Round, now: DateTime<Utc>) -> Vec<Settlement> {
        if round.status() != RoundStatus::Crashed {
            return Vec::new();
        }

        let crash_at = round.crash_at();
        let mut settled = Vec::new();
        for bet in self.bets.iter_mut().filter(|b| !b.is_settled()) {
            let loss = -bet.amount;
            if let Ok(settlement) = bet.settle(SettlementKind::Loss, crash_at, loss, now) {
                settled.push(settlement);
            }
        }
        settled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_700_000_000_000).unwrap()
    }

    fn at(ms: i64) -> DateTime<Utc> {
        t0() + Duration::milliseconds(ms)
    }

    /// Round with k = 0.25 and crash_at = 2.00 starting at t0, plus its ledger
    fn setup() -> (Round, BetLedger) {
        let round = Round::with_seed("seed-743".to_string(), 0.25, t0(), at(-2_000)).unwrap();
        let ledger = BetLedger::new(round.id());
        (round, ledger)
    }

    /// Milliseconds after start at which exp(0.25 t) reaches `m`
    fn ms_for(m: f64) -> i64 {
        ((m.ln() / 0.25) * 1000.0).ceil() as i64
    }

    #[test]
    fn test_auto_cashout_settles_before_crash() {
        let (mut round, mut ledger) = setup();
        let bet_id = ledger.place(&round, at(-1_000), "alice", 10.0, Some(1.50)).unwrap();

        round.advance(t0()).unwrap();
        let before = ms_for(1.50) - 20;
        assert!(ledger.evaluate_auto_cashouts(&round, round.multiplier_at(at(before)), at(before)).is_empty());

        let when = at(ms_for(1.50));
        let settled = ledger.evaluate_auto_cashouts(&round, round.multiplier_at(when), when);
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].kind, SettlementKind::Auto);
        assert_eq!(settled[0].cashed_out_at, 1.50);
        assert_eq!(settled[0].profit, 5.00);
        assert!(when < round.crash_time());

        let bet = ledger.get(bet_id).unwrap();
        assert_eq!(bet.profit(), Some(5.00));
    }

    #[test]
    fn test_unreached_auto_cashout_loses_at_crash() {
        let (mut round, mut ledger) = setup();
        let bet_id = ledger.place(&round, t0(), "bob", 25.0, Some(3.00)).unwrap();

        round.advance(t0()).unwrap();
        let crash = at(3_000);
        assert!(ledger.evaluate_auto_cashouts(&round, round.crash_at(), crash).is_empty());
        round.advance(crash).unwrap();
        let losses = ledger.finalize_on_crash(&round, crash);

        assert_eq!(losses.len(), 1);
        let bet = ledger.get(bet_id).unwrap();
        assert_eq!(bet.cashed_out_at(), Some(2.00));
        assert_eq!(bet.profit(), Some(-25.0));
        assert_eq!(bet.settlement().unwrap().kind, SettlementKind::Loss);
    }

    #[test]
    fn test_auto_cashout_equal_to_crash_point_wins() {
        let (mut round, mut ledger) = setup();
        let bet_id = ledger.place(&round, t0(), "carol", 4.0, Some(2.00)).unwrap();
        round.advance(t0()).unwrap();

        // Crash tick: sweep at crash_at before the round is marked crashed
        let crash = at(2_900);
        let settled = ledger.evaluate_auto_cashouts(&round, round.multiplier_at(crash), crash);
        round.advance(crash).unwrap();
        assert!(ledger.finalize_on_crash(&round, crash).is_empty());

        assert_eq!(settled.len(), 1);
        assert_eq!(ledger.get(bet_id).unwrap().profit(), Some(4.0));
    }

    #[test]
    fn test_sweep_is_in_placement_order() {
        let (mut round, mut ledger) = setup();
        let first = ledger.place(&round, t0(), "p1", 1.0, Some(1.30)).unwrap();
        let second = ledger.place(&round, t0(), "p2", 1.0, Some(1.20)).unwrap();
        let third = ledger.place(&round, t0(), "p3", 1.0, Some(1.90)).unwrap();
        round.advance(t0()).unwrap();

        let settled = ledger.evaluate_auto_cashouts(&round, 1.35, at(1_200));
        let ids: Vec<BetId> = settled.iter().map(|s| s.bet_id).collect();
        assert_eq!(ids, vec![first, second]);
        assert!(!ledger.get(third).unwrap().is_settled());
    }

    #[test]
    fn test_no_auto_sweep_unless_running() {
        let (round, mut ledger) = setup();
        ledger.place(&round, at(-500), "p1", 1.0, Some(1.10)).unwrap();
        assert!(ledger.evaluate_auto_cashouts(&round, 5.0, at(-100)).is_empty());
    }

    #[test]
    fn test_manual_cashout_above_live_is_rejected() {
        let (mut round, mut ledger) = setup();
        let bet_id = ledger.place(&round, t0(), "dave", 10.0, None).unwrap();
        round.advance(t0()).unwrap();

        let now = at(1_000);
        let live = round.multiplier_at(now);
        let err = ledger.manual_cashout(&round, now, "dave", 1.90).unwrap_err();
        assert!(matches!(err, CrashError::StaleMultiplier { requested, live: l } if requested == 1.90 && l == live));
        assert!(!ledger.get(bet_id).unwrap().is_settled());

        let settlement = ledger.manual_cashout(&round, now, "dave", 1.28).unwrap();
        assert_eq!(settlement.kind, SettlementKind::Manual);
        assert_eq!(settlement.profit, 2.80);
    }

    #[test]
    fn test_no_double_settlement() {
        let (mut round, mut ledger) = setup();
        let bet_id = ledger.place(&round, t0(), "erin", 10.0, Some(1.50)).unwrap();
        round.advance(t0()).unwrap();

        let when = at(ms_for(1.60));
        ledger.evaluate_auto_cashouts(&round, round.multiplier_at(when), when);

        let err = ledger.manual_cashout(&round, when, "erin", 1.55).unwrap_err();
        match err {
            CrashError::AlreadySettled { bet_id: id, settlement } => {
                assert_eq!(id, bet_id);
                assert_eq!(settlement.profit, 5.00);
            }
            other => panic!("expected AlreadySettled, got {other:?}"),
        }
        let err = ledger.cashout_bet(&round, when, bet_id, 1.55).unwrap_err();
        assert!(matches!(err, CrashError::AlreadySettled { .. }));
        assert_eq!(ledger.get(bet_id).unwrap().profit(), Some(5.00));
    }

    #[test]
    fn test_cashout_requires_running_round() {
        let (mut round, mut ledger) = setup();
        ledger.place(&round, at(-500), "frank", 10.0, None).unwrap();
        let err = ledger.manual_cashout(&round, at(-100), "frank", 1.0).unwrap_err();
        assert!(matches!(err, CrashError::RoundNotRunning { status: RoundStatus::Scheduled, .. }));

        round.advance(t0()).unwrap();
        // Past the crash point but before the next tick: already effectively crashed
        let err = ledger.manual_cashout(&round, at(4_000), "frank", 1.5).unwrap_err();
        assert!(matches!(err, CrashError::RoundNotRunning { status: RoundStatus::Crashed, .. }));
    }

    #[test]
    fn test_cashout_after_start_before_first_tick() {
        let (round, mut ledger) = setup();
        let bet_id = ledger.place(&round, at(-1_000), "gina", 10.0, None).unwrap();
        assert_eq!(round.status(), RoundStatus::Scheduled);

        let settlement = ledger.manual_cashout(&round, at(1_000), "gina", 1.1).unwrap();
        assert_eq!(settlement.kind, SettlementKind::Manual);
        assert_eq!(settlement.cashed_out_at, 1.1);
        assert_eq!(settlement.profit, 1.0);
        assert!(ledger.get(bet_id).unwrap().is_settled());
    }

    #[test]
    fn test_cashout_resolves_most_recent_unsettled_bet() {
        let (mut round, mut ledger) = setup();
        let older = ledger.place(&round, at(-900), "gina", 5.0, None).unwrap();
        let newer = ledger.place(&round, at(-800), "gina", 7.0, None).unwrap();
        round.advance(t0()).unwrap();

        let first = ledger.manual_cashout(&round, at(1_000), "gina", 1.2).unwrap();
        assert_eq!(first.bet_id, newer);
        let second = ledger.manual_cashout(&round, at(1_000), "gina", 1.2).unwrap();
        assert_eq!(second.bet_id, older);

        let err = ledger.manual_cashout(&round, at(1_000), "gina", 1.2).unwrap_err();
        assert!(matches!(err, CrashError::AlreadySettled { bet_id, .. } if bet_id == newer));
        let err = ledger.manual_cashout(&round, at(1_000), "nobody", 1.2).unwrap_err();
        assert!(matches!(err, CrashError::BetNotFound(_)));
    }

    #[test]
    fn test_placement_validation() {
        let (mut round, mut ledger) = setup();
        assert!(matches!(
            ledger.place(&round, t0(), "p", 0.0, None),
            Err(CrashError::Validation { ref field, .. }) if field == "amount"
        ));
        assert!(ledger.place(&round, t0(), "p", f64::NAN, None).is_err());
        assert!(ledger.place(&round, t0(), "p", 1.0, Some(1.0)).is_err());
        assert!(ledger.place(&round, t0(), "  ", 1.0, None).is_err());
        assert!(ledger.place(&round, t0(), &"x".repeat(200), 1.0, None).is_err());
        assert!(ledger.place(&round, t0(), "p", 1.0, Some(1.01)).is_ok());

        round.advance(t0()).unwrap();
        // Live multiplier ~1.28 at t = 1s
        assert!(ledger.place(&round, at(1_000), "late", 1.0, Some(1.20)).is_err());
        assert!(ledger.place(&round, at(1_000), "late", 1.0, Some(1.40)).is_ok());
    }

    #[test]
    fn test_bet_on_crashed_round_rejected() {
        let (mut round, mut ledger) = setup();
        round.advance(t0()).unwrap();
        round.advance(at(3_000)).unwrap();
        assert_eq!(round.status(), RoundStatus::Crashed);

        let err = ledger.place(&round, at(3_000), "henry", 10.0, None).unwrap_err();
        assert!(matches!(err, CrashError::BettingClosed { status: RoundStatus::Crashed, .. }));
        assert!(ledger.bets().is_empty());
    }

    #[test]
    fn test_profit_rounding() {
        assert_eq!(compute_profit(10.0, 1.5), 5.0);
        assert_eq!(compute_profit(3.33, 1.07), 0.23);
        assert_eq!(compute_profit(10.0, 1.0), 0.0);
    }
}
