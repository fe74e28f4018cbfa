//! Round engine
//!
//! Owns the registry of open rounds, the bounded history of crashed rounds
//! and the optional persistence collaborator. Every mutation of a round or
//! its bets happens under that round's mutex. Storage writes happen after the
//! mutex is released and never fail the caller.

use crate::{
    clock::Clock,
    config::{EngineConfig, MAX_START_DELAY_SECS},
    errors::{CrashError, CrashResult, StorageError},
    events::{EventBus, RoundEvent},
    fairness::{self, FairnessProof},
    ledger::{Bet, BetLedger, Settlement},
    metrics::EngineMetrics,
    round::{floor_multiplier, Round, RoundStatus, RoundView},
    storage::RoundStore,
    types::{BetId, RoundId},
};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use lru::LruCache;
use std::{num::NonZeroUsize, sync::Arc};
use tokio::sync::{broadcast, Mutex};

/// A round together with its bets, guarded by one lock
struct RoundEntry {
    round: Round,
    ledger: BetLedger,
}

type SharedEntry = Arc<Mutex<RoundEntry>>;

/// What one tick did to one round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickOutcome {
    pub started: bool,
    pub crashed: bool,
    pub settled: usize,
}

/// Aggregate of a full tick over the registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub rounds: usize,
    pub started: usize,
    pub crashed: usize,
    pub settled: usize,
}

impl TickReport {
    pub fn absorb(&mut self, outcome: TickOutcome) {
        self.rounds += 1;
        self.started += usize::from(outcome.started);
        self.crashed += usize::from(outcome.crashed);
        self.settled += outcome.settled;
    }
}

pub struct CrashEngine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn RoundStore>>,
    rounds: DashMap<RoundId, SharedEntry>,
    history: Mutex<LruCache<RoundId, SharedEntry>>,
    /// Serializes the find-or-create path of `current_round`
    current_lock: Mutex<()>,
    events: EventBus,
    metrics: EngineMetrics,
}

impl CrashEngine {
    pub fn new(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        store: Option<Arc<dyn RoundStore>>,
        metrics: EngineMetrics,
    ) -> Self {
        let capacity = NonZeroUsize::new(config.history_capacity).unwrap_or(NonZeroUsize::MIN);
        let events = EventBus::new(config.event_buffer);

        Self {
            config,
            clock,
            store,
            rounds: DashMap::new(),
            history: Mutex::new(LruCache::new(capacity)),
            current_lock: Mutex::new(()),
            events,
            metrics,
        }
    }

    /// Engine without persistence and with its own metrics registry
    pub fn ephemeral(config: EngineConfig, clock: Arc<dyn Clock>) -> CrashResult<Self> {
        Ok(Self::new(config, clock, None, EngineMetrics::new()?))
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoundEvent> {
        self.events.subscribe()
    }

    /// `persistent` when a store is attached, `ephemeral` otherwise
    pub fn storage_mode(&self) -> &'static str {
        if self.store.is_some() {
            "persistent"
        } else {
            "ephemeral"
        }
    }

    pub async fn storage_healthy(&self) -> bool {
        match &self.store {
            Some(store) => store.health().await.is_ok(),
            None => true,
        }
    }

    /// Ids of rounds that are scheduled or running
    pub fn active_round_ids(&self) -> Vec<RoundId> {
        self.rounds.iter().map(|entry| *entry.key()).collect()
    }

    pub fn open_round_count(&self) -> usize {
        self.rounds.len()
    }

    /// Schedule a new round with a fresh seed.
    ///
    /// `k` defaults to the configured growth constant and `delay_secs` to the
    /// configured start delay.
    pub async fn create_round(&self, k: Option<f64>, delay_secs: Option<f64>) -> CrashResult<RoundView> {
        self.create_round_with_seed(fairness::generate_server_seed(), k, delay_secs).await
    }

    /// Schedule a new round committed to a caller-provided seed
    pub async fn create_round_with_seed(
        &self,
        server_seed: String,
        k: Option<f64>,
        delay_secs: Option<f64>,
    ) -> CrashResult<RoundView> {
        let now = self.clock.now();
        let start_time = start_after(now, delay_secs.unwrap_or(self.config.default_start_delay_secs))
            .map_err(|e| self.rejected(e))?;
        let k = k.unwrap_or(self.config.default_k);

        let mut round = Round::with_seed(server_seed, k, start_time, now).map_err(|e| self.rejected(e))?;

        if let Some(store) = &self.store {
            match store.save_round(&round).await {
                Ok(persisted_id) => round.attach_persisted_id(persisted_id),
                Err(e) => self.storage_failed("save_round", round.id(), &e),
            }
        }

        let view = round.view(now);
        let round_id = round.id();
        let entry = RoundEntry {
            ledger: BetLedger::new(round_id),
            round,
        };
        self.rounds.insert(round_id, Arc::new(Mutex::new(entry)));

        self.metrics.rounds_created.inc();
        self.metrics.active_rounds.set(self.rounds.len() as i64);
        self.events.publish(RoundEvent::RoundCreated { round: view.clone() });

        tracing::info!(
            round_id = %round_id,
            k = k,
            start_time = %view.start_time,
            persisted_id = ?view.persisted_id,
            "Round scheduled"
        );
        Ok(view)
    }

    /// Most recent open round by start time, creating one with defaults when
    /// none is open
    pub async fn current_round(&self) -> CrashResult<RoundView> {
        let _guard = self.current_lock.lock().await;
        let now = self.clock.now();

        let candidates: Vec<SharedEntry> = self.rounds.iter().map(|e| Arc::clone(e.value())).collect();
        let mut latest: Option<(DateTime<Utc>, SharedEntry)> = None;
        for entry in candidates {
            let (open, start) = {
                let guard = entry.lock().await;
                (guard.round.status_at(now).is_open(), guard.round.start_time())
            };
            if open && latest.as_ref().map_or(true, |(best, _)| start > *best) {
                latest = Some((start, entry));
            }
        }

        match latest {
            Some((_, entry)) => {
                let view = entry.lock().await.round.view(now);
                Ok(view)
            }
            None => self.create_round(None, None).await,
        }
    }

    /// Resolve a round reference that is either the engine-local id or the
    /// 24-hex persisted id assigned by the store
    pub async fn resolve_round_id(&self, raw: &str) -> CrashResult<RoundId> {
        let raw = raw.trim();
        let persisted = raw.len() == 24 && raw.bytes().all(|b| b.is_ascii_hexdigit());
        if !persisted {
            return raw.parse();
        }

        let open: Vec<SharedEntry> = self.rounds.iter().map(|e| Arc::clone(e.value())).collect();
        let crashed: Vec<SharedEntry> = self.history.lock().await.iter().map(|(_, e)| Arc::clone(e)).collect();
        for entry in open.into_iter().chain(crashed) {
            let guard = entry.lock().await;
            if guard.round.persisted_id() == Some(raw) {
                return Ok(guard.round.id());
            }
        }

        if let Some(store) = &self.store {
            match store.find_round_by_persisted_id(raw).await {
                Ok(Some(round_id)) => return Ok(round_id),
                Ok(None) => {}
                Err(e) => tracing::warn!(persisted_id = raw, error = %e, "Persisted id lookup failed"),
            }
        }
        Err(CrashError::PersistedIdNotFound(raw.to_string()))
    }

    pub async fn round(&self, round_id: RoundId) -> CrashResult<RoundView> {
        let entry = self.entry(round_id).await?;
        let view = entry.lock().await.round.view(self.clock.now());
        Ok(view)
    }

    /// All bets of a round in placement order, settlements included
    pub async fn bets(&self, round_id: RoundId) -> CrashResult<Vec<Bet>> {
        let entry = self.entry(round_id).await?;
        let bets = entry.lock().await.ledger.bets().to_vec();
        Ok(bets)
    }

    /// Recompute the crash point of a crashed round from its revealed seed
    pub async fn verify_round(&self, round_id: RoundId) -> CrashResult<FairnessProof> {
        let entry = self.entry(round_id).await?;
        let guard = entry.lock().await;
        let round = &guard.round;
        if round.status() != RoundStatus::Crashed {
            return Err(CrashError::NotRevealed {
                round_id,
                status: round.status(),
            });
        }
        Ok(fairness::verify(round.server_seed(), round.crash_at()))
    }

    /// Operator override of the round status.
    ///
    /// Only scheduled → running and running → crashed are accepted. A forced
    /// crash sweeps auto-cashouts at the live multiplier and settles the rest
    /// as losses, exactly like a natural crash.
    pub async fn update_round_status(&self, round_id: RoundId, status: RoundStatus) -> CrashResult<RoundView> {
        let now = self.clock.now();
        let entry = self.entry(round_id).await?;

        let (view, snapshot, settled_bets) = {
            let mut guard = entry.lock().await;
            let RoundEntry { round, ledger } = &mut *guard;

            let from = round.status();
            if !from.can_transition_to(status) {
                tracing::warn!(round_id = %round_id, from = %from, to = %status, "Rejected status override");
                return Err(self.rejected(CrashError::InvalidTransition { from, to: status }));
            }

            let mut settlements = Vec::new();
            if status == RoundStatus::Crashed {
                settlements = ledger.evaluate_auto_cashouts(round, round.multiplier_at(now), now);
            }
            round.transition(status, now)?;

            match status {
                RoundStatus::Running => self.events.publish(RoundEvent::RoundStarted {
                    round_id: round_id.to_string(),
                    start_time: round.start_time(),
                }),
                RoundStatus::Crashed => {
                    settlements.extend(ledger.finalize_on_crash(round, now));
                    self.publish_settlements(&settlements);
                    self.publish_crash(round);
                }
                RoundStatus::Scheduled => {}
            }

            tracing::info!(round_id = %round_id, from = %from, to = %status, "Round status overridden");
            let settled_bets = settled_bets_of(ledger, &settlements);
            (round.view(now), round.clone(), settled_bets)
        };

        if status == RoundStatus::Crashed {
            self.retire(round_id, entry).await;
        }
        self.persist_round(&snapshot).await;
        self.persist_bets(&settled_bets).await;
        Ok(view)
    }

    /// Record a bet on a scheduled or running round
    pub async fn place_bet(
        &self,
        round_id: RoundId,
        player_id: &str,
        amount: f64,
        auto_cashout: Option<f64>,
    ) -> CrashResult<BetId> {
        let now = self.clock.now();
        let entry = self.entry(round_id).await.map_err(|e| self.rejected(e))?;

        let bet = {
            let mut guard = entry.lock().await;
            let RoundEntry { round, ledger } = &mut *guard;
            let bet_id = ledger
                .place(round, now, player_id, amount, auto_cashout)
                .map_err(|e| self.rejected(e))?;
            let bet = ledger
                .get(bet_id)
                .cloned()
                .ok_or_else(|| CrashError::BetNotFound(bet_id.to_string()))?;

            self.events.publish(RoundEvent::BetPlaced {
                round_id: round_id.to_string(),
                bet_id: bet_id.to_string(),
                player_id: bet.player_id().to_string(),
                amount,
                auto_cashout,
            });
            bet
        };

        self.metrics.bets_placed.inc();
        tracing::info!(
            round_id = %round_id,
            bet_id = %bet.id(),
            player_id = %bet.player_id(),
            amount = amount,
            auto_cashout = ?auto_cashout,
            "Bet placed"
        );

        if let Some(store) = &self.store {
            match store.save_bet(&bet).await {
                Ok(persisted_id) => entry.lock().await.ledger.attach_persisted_id(bet.id(), persisted_id),
                Err(e) => self.storage_failed("save_bet", round_id, &e),
            }
        }
        Ok(bet.id())
    }

    /// Manual cashout at the client-asserted multiplier.
    ///
    /// With a bet id the named bet is settled; without one the player's most
    /// recent unsettled bet is. The asserted multiplier must not exceed the
    /// live multiplier computed from the engine clock.
    pub async fn cashout(
        &self,
        round_id: RoundId,
        player_id: &str,
        bet_id: Option<BetId>,
        asserted_multiplier: f64,
    ) -> CrashResult<Settlement> {
        let now = self.clock.now();
        let entry = self.entry(round_id).await.map_err(|e| self.rejected(e))?;

        let (settlement, bet) = {
            let mut guard = entry.lock().await;
            let RoundEntry { round, ledger } = &mut *guard;

            let result = match bet_id {
                Some(bet_id) => match ledger.get(bet_id) {
                    Some(bet) if bet.player_id() == player_id.trim() => {
                        ledger.cashout_bet(round, now, bet_id, asserted_multiplier)
                    }
                    _ => Err(CrashError::BetNotFound(bet_id.to_string())),
                },
                None => ledger.manual_cashout(round, now, player_id, asserted_multiplier),
            };
            let settlement = result.map_err(|e| self.rejected(e))?;
            let bet = ledger
                .get(settlement.bet_id)
                .cloned()
                .ok_or_else(|| CrashError::BetNotFound(settlement.bet_id.to_string()))?;

            self.publish_settlements(std::slice::from_ref(&settlement));
            (settlement, bet)
        };

        tracing::info!(
            round_id = %round_id,
            bet_id = %settlement.bet_id,
            player_id = %settlement.player_id,
            multiplier = settlement.cashed_out_at,
            profit = settlement.profit,
            "Manual cashout"
        );
        self.persist_bets(std::slice::from_ref(&bet)).await;
        Ok(settlement)
    }

    /// Drive every open round once, one after another
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        for round_id in self.active_round_ids() {
            match self.tick_round(round_id, now).await {
                Ok(outcome) => report.absorb(outcome),
                Err(CrashError::RoundNotFound(_)) => {}
                Err(e) => tracing::error!(round_id = %round_id, error = %e, "Tick failed"),
            }
        }
        report
    }

    /// Apply the time rules to one open round at `now`.
    ///
    /// A due start moves the round to running. While running, auto-cashouts
    /// are swept at the live multiplier. When the crash is due, auto-cashouts
    /// are swept at the crash point first, then the round is marked crashed,
    /// the remaining bets lose and the round moves to history.
    pub async fn tick_round(&self, round_id: RoundId, now: DateTime<Utc>) -> CrashResult<TickOutcome> {
        let entry = self
            .rounds
            .get(&round_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or(CrashError::RoundNotFound(round_id))?;

        let mut outcome = TickOutcome::default();
        let (snapshot, settled_bets) = {
            let mut guard = entry.lock().await;
            let RoundEntry { round, ledger } = &mut *guard;

            if round.status() == RoundStatus::Scheduled && round.advance(now)?.is_some() {
                outcome.started = true;
                tracing::info!(round_id = %round_id, "Round started");
                self.events.publish(RoundEvent::RoundStarted {
                    round_id: round_id.to_string(),
                    start_time: round.start_time(),
                });
            }

            let mut settlements = Vec::new();
            if round.status() == RoundStatus::Running {
                if round.crash_due(now) {
                    settlements = ledger.evaluate_auto_cashouts(round, round.crash_at(), now);
                    round.advance(now)?;
                    settlements.extend(ledger.finalize_on_crash(round, now));
                    outcome.crashed = true;
                } else {
                    let live = round.multiplier_at(now);
                    settlements = ledger.evaluate_auto_cashouts(round, live, now);
                    self.events.publish(RoundEvent::Multiplier {
                        round_id: round_id.to_string(),
                        multiplier: floor_multiplier(live),
                        elapsed_secs: round.elapsed_secs(now),
                    });
                }
            }

            self.publish_settlements(&settlements);
            if outcome.crashed {
                self.publish_crash(round);
            }
            outcome.settled = settlements.len();

            let changed = outcome.started || outcome.crashed;
            (changed.then(|| round.clone()), settled_bets_of(ledger, &settlements))
        };

        if outcome.crashed {
            self.retire(round_id, entry).await;
        }
        if let Some(round) = snapshot {
            self.persist_round(&round).await;
        }
        self.persist_bets(&settled_bets).await;
        Ok(outcome)
    }

    async fn entry(&self, round_id: RoundId) -> CrashResult<SharedEntry> {
        if let Some(entry) = self.rounds.get(&round_id) {
            return Ok(Arc::clone(entry.value()));
        }
        let mut history = self.history.lock().await;
        history
            .get(&round_id)
            .map(Arc::clone)
            .ok_or(CrashError::RoundNotFound(round_id))
    }

    /// Move a crashed round from the registry into history. History is
    /// written first so lookups never miss the round in between.
    async fn retire(&self, round_id: RoundId, entry: SharedEntry) {
        self.history.lock().await.put(round_id, entry);
        self.rounds.remove(&round_id);
        self.metrics.rounds_crashed.inc();
        self.metrics.active_rounds.set(self.rounds.len() as i64);
    }

    fn publish_settlements(&self, settlements: &[Settlement]) {
        for settlement in settlements {
            self.metrics.record_settlement(settlement.kind.as_str());
            tracing::debug!(
                round_id = %settlement.round_id,
                bet_id = %settlement.bet_id,
                kind = settlement.kind.as_str(),
                multiplier = settlement.cashed_out_at,
                profit = settlement.profit,
                "Bet settled"
            );
            self.events.publish(RoundEvent::BetSettled {
                settlement: settlement.clone(),
            });
        }
    }

    fn publish_crash(&self, round: &Round) {
        let final_multiplier = round.final_multiplier().unwrap_or(round.crash_at());
        tracing::info!(
            round_id = %round.id(),
            crash_at = round.crash_at(),
            final_multiplier = final_multiplier,
            "Round crashed"
        );
        self.events.publish(RoundEvent::RoundCrashed {
            round_id: round.id().to_string(),
            crash_at: round.crash_at(),
            final_multiplier,
            server_seed: round.server_seed().to_string(),
            crashed_time: round.crashed_time(),
        });
    }

    fn rejected(&self, err: CrashError) -> CrashError {
        self.metrics.record_rejection(err.reason());
        tracing::debug!(reason = err.reason(), error = %err, "Request rejected");
        err
    }

    fn storage_failed(&self, operation: &'static str, round_id: RoundId, err: &StorageError) {
        self.metrics.storage_failures.inc();
        tracing::warn!(
            operation = operation,
            round_id = %round_id,
            error = %err,
            "Persistence failed; continuing with in-memory state"
        );
    }

    async fn persist_round(&self, round: &Round) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.update_round(round).await {
            self.storage_failed("update_round", round.id(), &e);
        }
    }

    async fn persist_bets(&self, bets: &[Bet]) {
        let Some(store) = &self.store else {
            return;
        };
        for bet in bets {
            if let Err(e) = store.update_bet(bet).await {
                self.storage_failed("update_bet", bet.round_id(), &e);
            }
        }
    }
}

/// Start time `delay_secs` after `now`, bounded by [`MAX_START_DELAY_SECS`]
fn start_after(now: DateTime<Utc>, delay_secs: f64) -> CrashResult<DateTime<Utc>> {
    if !delay_secs.is_finite() || !(0.0..=MAX_START_DELAY_SECS).contains(&delay_secs) {
        return Err(CrashError::validation(
            "delay_seconds",
            format!("must be between 0 and {} seconds", MAX_START_DELAY_SECS),
        ));
    }
    Duration::try_milliseconds((delay_secs * 1000.0).round() as i64)
        .and_then(|delay| now.checked_add_signed(delay))
        .ok_or_else(|| CrashError::validation("delay_seconds", "start time out of range"))
}

fn settled_bets_of(ledger: &BetLedger, settlements: &[Settlement]) -> Vec<Bet> {
    settlements
        .iter()
        .filter_map(|s| ledger.get(s.bet_id).cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{clock::ManualClock, ledger::SettlementKind};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_700_000_000_000).unwrap()
    }

    fn engine_with(store: Option<Arc<dyn RoundStore>>) -> (Arc<CrashEngine>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(t0()));
        let engine = CrashEngine::new(
            EngineConfig::default(),
            clock.clone(),
            store,
            EngineMetrics::new().unwrap(),
        );
        (Arc::new(engine), clock)
    }

    /// Schedules the seed-743 round (crash at 2.00) starting one second out
    async fn two_x_round(engine: &CrashEngine) -> RoundId {
        let view = engine
            .create_round_with_seed("seed-743".to_string(), Some(0.25), Some(1.0))
            .await
            .unwrap();
        view.id.parse().unwrap()
    }

    struct FailingStore;

    #[async_trait]
    impl RoundStore for FailingStore {
        async fn save_round(&self, _: &Round) -> Result<String, StorageError> {
            Err(StorageError::Unavailable("offline".to_string()))
        }
        async fn update_round(&self, _: &Round) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("offline".to_string()))
        }
        async fn save_bet(&self, _: &Bet) -> Result<String, StorageError> {
            Err(StorageError::Unavailable("offline".to_string()))
        }
        async fn update_bet(&self, _: &Bet) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("offline".to_string()))
        }
        async fn find_round_by_persisted_id(&self, _: &str) -> Result<Option<RoundId>, StorageError> {
            Err(StorageError::Unavailable("offline".to_string()))
        }
        async fn health(&self) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("offline".to_string()))
        }
    }

    #[derive(Default)]
    struct CountingStore {
        saves: AtomicUsize,
        updates: AtomicUsize,
    }

    #[async_trait]
    impl RoundStore for CountingStore {
        async fn save_round(&self, _: &Round) -> Result<String, StorageError> {
            let n = self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{:024x}", n + 1))
        }
        async fn update_round(&self, _: &Round) -> Result<(), StorageError> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn save_bet(&self, _: &Bet) -> Result<String, StorageError> {
            let n = self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{:024x}", n + 1))
        }
        async fn update_bet(&self, _: &Bet) -> Result<(), StorageError> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn find_round_by_persisted_id(&self, _: &str) -> Result<Option<RoundId>, StorageError> {
            Ok(None)
        }
        async fn health(&self) -> Result<(), StorageError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_full_round_with_auto_and_loss() {
        let (engine, clock) = engine_with(None);
        let round_id = two_x_round(&engine).await;

        let winner = engine.place_bet(round_id, "alice", 10.0, Some(1.50)).await.unwrap();
        let loser = engine.place_bet(round_id, "bob", 25.0, Some(3.00)).await.unwrap();

        clock.advance(Duration::seconds(1));
        let report = engine.tick(clock.now()).await;
        assert_eq!(report.started, 1);
        assert_eq!(engine.round(round_id).await.unwrap().status, RoundStatus::Running);

        clock.advance(Duration::milliseconds(1_700));
        engine.tick(clock.now()).await;
        let bets = engine.bets(round_id).await.unwrap();
        assert_eq!(bets[0].profit(), Some(5.00));
        assert!(!bets[1].is_settled());

        clock.advance(Duration::milliseconds(1_200));
        let report = engine.tick(clock.now()).await;
        assert_eq!(report.crashed, 1);
        assert_eq!(engine.open_round_count(), 0);

        let bets = engine.bets(round_id).await.unwrap();
        let by_id = |id| bets.iter().find(|b| b.id() == id).unwrap();
        assert_eq!(by_id(winner).settlement().unwrap().kind, SettlementKind::Auto);
        assert_eq!(by_id(loser).profit(), Some(-25.0));
        assert_eq!(by_id(loser).cashed_out_at(), Some(2.00));

        let view = engine.round(round_id).await.unwrap();
        assert_eq!(view.crash_at, Some(2.00));
        assert!(engine.verify_round(round_id).await.unwrap().valid);
    }

    #[tokio::test]
    async fn test_late_tick_sweeps_skipped_thresholds() {
        let (engine, clock) = engine_with(None);
        let round_id = two_x_round(&engine).await;
        engine.place_bet(round_id, "p1", 4.0, Some(1.90)).await.unwrap();
        engine.place_bet(round_id, "p2", 4.0, Some(2.00)).await.unwrap();

        clock.advance(Duration::seconds(1));
        engine.tick(clock.now()).await;
        // Next tick lands well past the crash point
        clock.advance(Duration::seconds(10));
        engine.tick(clock.now()).await;

        let bets = engine.bets(round_id).await.unwrap();
        assert_eq!(bets[0].profit(), Some(3.60));
        assert_eq!(bets[1].profit(), Some(4.00));
    }

    #[tokio::test]
    async fn test_verify_refused_before_crash() {
        let (engine, _) = engine_with(None);
        let round_id = two_x_round(&engine).await;
        let err = engine.verify_round(round_id).await.unwrap_err();
        assert!(matches!(err, CrashError::NotRevealed { status: RoundStatus::Scheduled, .. }));
        let view = engine.round(round_id).await.unwrap();
        assert!(view.crash_at.is_none());
        assert!(view.server_seed.is_none());
    }

    #[tokio::test]
    async fn test_current_round_reuses_open_round() {
        let (engine, _) = engine_with(None);
        let first = engine.current_round().await.unwrap();
        let again = engine.current_round().await.unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(engine.open_round_count(), 1);

        let later = engine.create_round(None, Some(5.0)).await.unwrap();
        assert_eq!(engine.current_round().await.unwrap().id, later.id);
    }

    #[tokio::test]
    async fn test_current_round_replaces_crashed_round() {
        let (engine, _) = engine_with(None);
        let first = engine.current_round().await.unwrap();
        let id: RoundId = first.id.parse().unwrap();
        engine.update_round_status(id, RoundStatus::Running).await.unwrap();
        engine.update_round_status(id, RoundStatus::Crashed).await.unwrap();

        let next = engine.current_round().await.unwrap();
        assert_ne!(next.id, first.id);
        assert_eq!(next.status, RoundStatus::Scheduled);
    }

    #[tokio::test]
    async fn test_override_rejects_backward_and_repeated_moves() {
        let (engine, _) = engine_with(None);
        let round_id = two_x_round(&engine).await;

        let err = engine.update_round_status(round_id, RoundStatus::Crashed).await.unwrap_err();
        assert!(matches!(err, CrashError::InvalidTransition { .. }));
        let err = engine.update_round_status(round_id, RoundStatus::Scheduled).await.unwrap_err();
        assert!(matches!(err, CrashError::InvalidTransition { .. }));

        engine.update_round_status(round_id, RoundStatus::Running).await.unwrap();
        let err = engine.update_round_status(round_id, RoundStatus::Running).await.unwrap_err();
        assert!(matches!(err, CrashError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_forced_crash_settles_open_bets() {
        let (engine, clock) = engine_with(None);
        let round_id = two_x_round(&engine).await;
        engine.place_bet(round_id, "p1", 10.0, Some(1.10)).await.unwrap();
        engine.place_bet(round_id, "p2", 10.0, None).await.unwrap();

        clock.advance(Duration::seconds(1));
        engine.tick(clock.now()).await;
        clock.advance(Duration::seconds(1));
        let view = engine.update_round_status(round_id, RoundStatus::Crashed).await.unwrap();
        assert_eq!(view.status, RoundStatus::Crashed);
        assert!(view.multiplier < 2.00);

        let bets = engine.bets(round_id).await.unwrap();
        assert_eq!(bets[0].profit(), Some(1.00));
        assert_eq!(bets[1].profit(), Some(-10.0));

        // A late natural-crash tick finds nothing to do
        let report = engine.tick(clock.now() + Duration::seconds(5)).await;
        assert_eq!(report.rounds, 0);
    }

    #[tokio::test]
    async fn test_cashout_by_bet_id_checks_owner() {
        let (engine, clock) = engine_with(None);
        let round_id = two_x_round(&engine).await;
        let bet_id = engine.place_bet(round_id, "alice", 10.0, None).await.unwrap();

        clock.advance(Duration::seconds(2));
        engine.tick(clock.now()).await;

        let err = engine.cashout(round_id, "mallory", Some(bet_id), 1.1).await.unwrap_err();
        assert!(matches!(err, CrashError::BetNotFound(_)));

        let settlement = engine.cashout(round_id, "alice", Some(bet_id), 1.2).await.unwrap();
        assert_eq!(settlement.profit, 2.00);

        let err = engine.cashout(round_id, "alice", Some(bet_id), 1.2).await.unwrap_err();
        assert!(matches!(err, CrashError::AlreadySettled { .. }));
        assert!(engine.metrics().render().contains("reason=\"already_settled\""));
    }

    #[tokio::test]
    async fn test_cashout_uses_engine_clock_not_tick_state() {
        let (engine, clock) = engine_with(None);
        let round_id = two_x_round(&engine).await;
        engine.place_bet(round_id, "alice", 10.0, None).await.unwrap();

        clock.advance(Duration::seconds(1));
        engine.tick(clock.now()).await;

        // Past the crash point, before the scheduler noticed
        clock.advance(Duration::seconds(4));
        let err = engine.cashout(round_id, "alice", None, 1.5).await.unwrap_err();
        assert!(matches!(err, CrashError::RoundNotRunning { status: RoundStatus::Crashed, .. }));
    }

    #[tokio::test]
    async fn test_concurrent_cashout_and_tick_settle_once() {
        let (engine, clock) = engine_with(None);
        let round_id = two_x_round(&engine).await;
        let bet_id = engine.place_bet(round_id, "alice", 10.0, Some(1.20)).await.unwrap();

        clock.advance(Duration::seconds(1));
        engine.tick(clock.now()).await;
        clock.advance(Duration::milliseconds(1_000));

        let now = clock.now();
        let a = tokio::spawn({
            let engine = engine.clone();
            async move { engine.cashout(round_id, "alice", Some(bet_id), 1.25).await }
        });
        let b = tokio::spawn({
            let engine = engine.clone();
            async move { engine.tick_round(round_id, now).await }
        });
        let (cashout, tick) = (a.await.unwrap(), b.await.unwrap().unwrap());

        let bets = engine.bets(round_id).await.unwrap();
        let settlement = bets[0].settlement().unwrap();
        match cashout {
            Ok(manual) => {
                assert_eq!(tick.settled, 0);
                assert_eq!(&manual, settlement);
            }
            Err(CrashError::AlreadySettled { settlement: prior, .. }) => {
                assert_eq!(tick.settled, 1);
                assert_eq!(prior.kind, SettlementKind::Auto);
            }
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_storage_failure_is_soft() {
        let store: Arc<dyn RoundStore> = Arc::new(FailingStore);
        let (engine, clock) = engine_with(Some(store));
        assert_eq!(engine.storage_mode(), "persistent");
        assert!(!engine.storage_healthy().await);

        let round_id = two_x_round(&engine).await;
        let view = engine.round(round_id).await.unwrap();
        assert!(view.persisted_id.is_none());

        let bet_id = engine.place_bet(round_id, "alice", 10.0, None).await.unwrap();
        clock.advance(Duration::seconds(2));
        engine.tick(clock.now()).await;
        engine.cashout(round_id, "alice", Some(bet_id), 1.1).await.unwrap();

        let failures = engine.metrics().storage_failures.get();
        assert!(failures >= 4, "expected failures to be counted, got {failures}");
    }

    #[tokio::test]
    async fn test_persisted_ids_attached_on_success() {
        let store = Arc::new(CountingStore::default());
        let (engine, clock) = engine_with(Some(store.clone() as Arc<dyn RoundStore>));

        let round_id = two_x_round(&engine).await;
        assert!(engine.round(round_id).await.unwrap().persisted_id.is_some());

        engine.place_bet(round_id, "alice", 10.0, None).await.unwrap();
        assert!(engine.bets(round_id).await.unwrap()[0].persisted_id().is_some());

        clock.advance(Duration::seconds(5));
        engine.tick(clock.now()).await;
        engine.tick(clock.now()).await;
        assert_eq!(store.saves.load(Ordering::SeqCst), 2);
        // One round write covering start and crash, one for the losing bet
        assert_eq!(store.updates.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_events_follow_lifecycle() {
        let (engine, clock) = engine_with(None);
        let mut events = engine.subscribe();
        let round_id = two_x_round(&engine).await;
        engine.place_bet(round_id, "alice", 10.0, None).await.unwrap();

        clock.advance(Duration::seconds(1));
        engine.tick(clock.now()).await;
        clock.advance(Duration::seconds(1));
        engine.tick(clock.now()).await;
        clock.advance(Duration::seconds(5));
        engine.tick(clock.now()).await;

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.round_id(), round_id.to_string());
            kinds.push(match event {
                RoundEvent::RoundCreated { .. } => "created",
                RoundEvent::RoundStarted { .. } => "started",
                RoundEvent::Multiplier { .. } => "multiplier",
                RoundEvent::BetPlaced { .. } => "bet",
                RoundEvent::BetSettled { .. } => "settled",
                RoundEvent::RoundCrashed { .. } => "crashed",
            });
        }
        assert_eq!(kinds, vec!["created", "bet", "started", "multiplier", "multiplier", "settled", "crashed"]);
    }

    #[tokio::test]
    async fn test_unknown_round() {
        let (engine, _) = engine_with(None);
        let missing = RoundId::new();
        assert!(matches!(engine.round(missing).await, Err(CrashError::RoundNotFound(_))));
        assert!(matches!(
            engine.place_bet(missing, "a", 1.0, None).await,
            Err(CrashError::RoundNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_round_parameters() {
        let (engine, _) = engine_with(None);
        assert!(engine.create_round(Some(0.0), None).await.is_err());
        assert!(engine.create_round(None, Some(-1.0)).await.is_err());
        assert_eq!(engine.open_round_count(), 0);
    }

    #[tokio::test]
    async fn test_out_of_range_delay_is_rejected() {
        let (engine, _) = engine_with(None);
        for delay in [1e13, MAX_START_DELAY_SECS + 1.0, f64::INFINITY, f64::NAN] {
            let err = engine.create_round(None, Some(delay)).await.unwrap_err();
            assert!(matches!(err, CrashError::Validation { ref field, .. } if field == "delay_seconds"));
        }
        assert!(engine.create_round(None, Some(MAX_START_DELAY_SECS)).await.is_ok());

        let config = EngineConfig {
            default_start_delay_secs: 1e13,
            ..EngineConfig::default()
        };
        let engine = CrashEngine::ephemeral(config, Arc::new(ManualClock::new(t0()))).unwrap();
        assert!(engine.current_round().await.is_err());
        assert_eq!(engine.open_round_count(), 0);
    }

    #[tokio::test]
    async fn test_cashout_before_first_tick_after_start() {
        let (engine, clock) = engine_with(None);
        let round_id = two_x_round(&engine).await;
        let bet_id = engine.place_bet(round_id, "alice", 10.0, None).await.unwrap();

        // Start has passed but no tick has run yet
        clock.advance(Duration::seconds(2));
        let settlement = engine.cashout(round_id, "alice", None, 1.1).await.unwrap();
        assert_eq!(settlement.bet_id, bet_id);
        assert_eq!(settlement.profit, 1.0);
    }

    #[tokio::test]
    async fn test_resolve_round_by_persisted_id() {
        let store = Arc::new(CountingStore::default());
        let (engine, clock) = engine_with(Some(store as Arc<dyn RoundStore>));
        let round_id = two_x_round(&engine).await;
        let persisted_id = engine.round(round_id).await.unwrap().persisted_id.unwrap();

        assert_eq!(engine.resolve_round_id(&persisted_id).await.unwrap(), round_id);
        assert_eq!(engine.resolve_round_id(&round_id.to_string()).await.unwrap(), round_id);

        clock.advance(Duration::seconds(5));
        engine.tick(clock.now()).await;
        engine.tick(clock.now()).await;
        assert_eq!(engine.open_round_count(), 0);
        assert_eq!(engine.resolve_round_id(&persisted_id).await.unwrap(), round_id);

        let unknown = "f".repeat(24);
        assert!(matches!(
            engine.resolve_round_id(&unknown).await,
            Err(CrashError::PersistedIdNotFound(_))
        ));
        assert!(matches!(
            engine.resolve_round_id("nope").await,
            Err(CrashError::Validation { .. })
        ));
    }
}
