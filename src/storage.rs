//! Persistence collaborator.
//!
//! The engine's in-memory state is authoritative while a round is live; the
//! store only receives copies. Each saved document gets a persisted id from a
//! durable sequence, which the engine attaches to its local record when the
//! write succeeds.

use crate::{
    errors::StorageError,
    ledger::Bet,
    round::Round,
    types::{BetId, RoundId},
};
use async_trait::async_trait;
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use std::{
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::Mutex;

const NEXT_ID_KEY: &[u8] = b"meta:next_id";
const ROUND_PREFIX: &str = "round:";
const BET_PREFIX: &str = "bet:";
const ROUND_BETS_PREFIX: &str = "round_bets:";
const PERSISTED_ID_PREFIX: &str = "pid:";

/// Durable store for rounds and bets keyed by engine-local ids
#[async_trait]
pub trait RoundStore: Send + Sync {
    /// Insert a new round, returning its persisted id
    async fn save_round(&self, round: &Round) -> Result<String, StorageError>;

    async fn update_round(&self, round: &Round) -> Result<(), StorageError>;

    /// Insert a new bet, returning its persisted id
    async fn save_bet(&self, bet: &Bet) -> Result<String, StorageError>;

    async fn update_bet(&self, bet: &Bet) -> Result<(), StorageError>;

    /// Resolve a persisted id back to the engine-local round id
    async fn find_round_by_persisted_id(&self, persisted_id: &str) -> Result<Option<RoundId>, StorageError>;

    async fn health(&self) -> Result<(), StorageError>;
}

/// RocksDB-backed store holding JSON documents
#[derive(Clone)]
pub struct RocksRoundStore {
    db: Arc<DB>,
    next_id: Arc<AtomicU64>,
    /// Serializes read-merge-write of bet documents
    bet_writes: Arc<Mutex<()>>,
}

fn round_key(id: RoundId) -> Vec<u8> {
    format!("{}{}", ROUND_PREFIX, id).into_bytes()
}

fn bet_key(id: BetId) -> Vec<u8> {
    format!("{}{}", BET_PREFIX, id).into_bytes()
}

fn round_bets_prefix(round_id: RoundId) -> Vec<u8> {
    format!("{}{}:", ROUND_BETS_PREFIX, round_id).into_bytes()
}

fn persisted_id_key(persisted_id: &str) -> Vec<u8> {
    format!("{}{}", PERSISTED_ID_PREFIX, persisted_id).into_bytes()
}

/// Combine an incoming bet write with the stored document.
///
/// Insert and settlement writes race once the round lock is released, so a
/// settled document is never replaced by an unsettled snapshot and a known
/// persisted id is never dropped.
fn merge_bet(stored: Option<Bet>, incoming: &Bet) -> Bet {
    let Some(stored) = stored else {
        return incoming.clone();
    };
    let mut merged = if stored.is_settled() && !incoming.is_settled() {
        stored.clone()
    } else {
        incoming.clone()
    };
    if merged.persisted_id().is_none() {
        if let Some(persisted_id) = incoming.persisted_id().or(stored.persisted_id()) {
            merged.attach_persisted_id(persisted_id.to_string());
        }
    }
    merged
}

impl RocksRoundStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DB::open(&opts, path).map_err(|e| StorageError::DatabaseOpenFailed(e.to_string()))?;

        let next_id = match db.get(NEXT_ID_KEY).map_err(|e| StorageError::ReadFailed(e.to_string()))? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StorageError::CorruptedData("Invalid id sequence bytes".to_string()))?;
                u64::from_le_bytes(arr)
            }
            None => 1,
        };

        Ok(Self {
            db: Arc::new(db),
            next_id: Arc::new(AtomicU64::new(next_id)),
            bet_writes: Arc::new(Mutex::new(())),
        })
    }

    /// Reserve the next persisted id, formatted as 24 hex characters
    fn allocate_id(&self, batch: &mut WriteBatch) -> String {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        batch.put(NEXT_ID_KEY, (id + 1).to_le_bytes());
        format!("{:024x}", id)
    }

    pub fn load_round(&self, id: RoundId) -> Result<Option<Round>, StorageError> {
        let Some(bytes) = self.db.get(round_key(id)).map_err(|e| StorageError::ReadFailed(e.to_string()))? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    pub fn load_bet(&self, id: BetId) -> Result<Option<Bet>, StorageError> {
        let Some(bytes) = self.db.get(bet_key(id)).map_err(|e| StorageError::ReadFailed(e.to_string()))? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// All bets stored for a round
    pub fn load_bets(&self, round_id: RoundId) -> Result<Vec<Bet>, StorageError> {
        let prefix = round_bets_prefix(round_id);
        let mut bets = Vec::new();

        for item in self.db.iterator(IteratorMode::From(&prefix, Direction::Forward)) {
            let (key, _) = item.map_err(|e| StorageError::ReadFailed(e.to_string()))?;
            if !key.starts_with(&prefix) {
                break;
            }
            let bet_id: BetId = std::str::from_utf8(&key[prefix.len()..])
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| StorageError::CorruptedData("Invalid bet index key".to_string()))?;
            if let Some(bet) = self.load_bet(bet_id)? {
                bets.push(bet);
            }
        }

        bets.sort_by_key(|b| b.placed_at());
        Ok(bets)
    }
}

#[async_trait]
impl RoundStore for RocksRoundStore {
    async fn save_round(&self, round: &Round) -> Result<String, StorageError> {
        let mut batch = WriteBatch::default();
        let persisted_id = self.allocate_id(&mut batch);

        let mut document = round.clone();
        document.attach_persisted_id(persisted_id.clone());
        let key = round_key(round.id());

        batch.put(&key, serde_json::to_vec(&document)?);
        batch.put(persisted_id_key(&persisted_id), &key);
        self.db.write(batch)?;

        tracing::debug!(round_id = %round.id(), persisted_id = %persisted_id, "Round persisted");
        Ok(persisted_id)
    }

    async fn update_round(&self, round: &Round) -> Result<(), StorageError> {
        self.db.put(round_key(round.id()), serde_json::to_vec(round)?)?;
        Ok(())
    }

    async fn save_bet(&self, bet: &Bet) -> Result<String, StorageError> {
        let _guard = self.bet_writes.lock().await;
        let mut batch = WriteBatch::default();
        let persisted_id = self.allocate_id(&mut batch);
        let key = bet_key(bet.id());

        let mut index_key = round_bets_prefix(bet.round_id());
        index_key.extend_from_slice(bet.id().to_string().as_bytes());

        let mut document = merge_bet(self.load_bet(bet.id())?, bet);
        document.attach_persisted_id(persisted_id.clone());

        batch.put(&key, serde_json::to_vec(&document)?);
        batch.put(index_key, b"");
        batch.put(persisted_id_key(&persisted_id), &key);
        self.db.write(batch)?;

        Ok(persisted_id)
    }

    async fn update_bet(&self, bet: &Bet) -> Result<(), StorageError> {
        let _guard = self.bet_writes.lock().await;
        let document = merge_bet(self.load_bet(bet.id())?, bet);
        self.db.put(bet_key(bet.id()), serde_json::to_vec(&document)?)?;
        Ok(())
    }

    async fn find_round_by_persisted_id(&self, persisted_id: &str) -> Result<Option<RoundId>, StorageError> {
        let Some(bytes) = self
            .db
            .get(persisted_id_key(persisted_id))
            .map_err(|e| StorageError::ReadFailed(e.to_string()))?
        else {
            return Ok(None);
        };
        let key = String::from_utf8(bytes).map_err(|e| StorageError::CorruptedData(e.to_string()))?;
        match key.strip_prefix(ROUND_PREFIX) {
            Some(local) => local
                .parse()
                .map(Some)
                .map_err(|_| StorageError::CorruptedData(format!("Invalid round key '{}'", key))),
            None => Ok(None),
        }
    }

    async fn health(&self) -> Result<(), StorageError> {
        self.db
            .get(NEXT_ID_KEY)
            .map(|_| ())
            .map_err(|e| StorageError::Unavailable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ledger::BetLedger, round::RoundStatus};
    use chrono::{DateTime, Duration, Utc};

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_700_000_000_000).unwrap()
    }

    #[tokio::test]
    async fn test_round_roundtrip_and_persisted_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksRoundStore::open(dir.path()).unwrap();

        let mut round = Round::with_seed("seed-743".to_string(), 0.25, t0(), t0()).unwrap();
        let first = store.save_round(&round).await.unwrap();
        assert_eq!(first.len(), 24);

        round.attach_persisted_id(first.clone());
        round.advance(t0()).unwrap();
        store.update_round(&round).await.unwrap();

        let loaded = store.load_round(round.id()).unwrap().unwrap();
        assert_eq!(loaded.status(), RoundStatus::Running);
        assert_eq!(loaded.crash_at(), 2.00);
        assert_eq!(loaded.persisted_id(), Some(first.as_str()));
        assert_eq!(store.find_round_by_persisted_id(&first).await.unwrap(), Some(round.id()));

        let other = Round::new(0.25, t0(), t0()).unwrap();
        let second = store.save_round(&other).await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_bet_writes_merge_out_of_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksRoundStore::open(dir.path()).unwrap();

        let mut round = Round::with_seed("seed-743".to_string(), 0.25, t0(), t0()).unwrap();
        let mut ledger = BetLedger::new(round.id());
        let bet_id = ledger.place(&round, t0() - Duration::seconds(1), "alice", 10.0, None).unwrap();
        let unsettled = ledger.get(bet_id).unwrap().clone();

        round.advance(t0()).unwrap();
        ledger.manual_cashout(&round, t0() + Duration::seconds(1), "alice", 1.2).unwrap();
        let settled = ledger.get(bet_id).unwrap().clone();

        // Settlement write lands before the insert
        store.update_bet(&settled).await.unwrap();
        let persisted_id = store.save_bet(&unsettled).await.unwrap();

        let stored = store.load_bet(bet_id).unwrap().unwrap();
        assert_eq!(stored.profit(), Some(2.0));
        assert_eq!(stored.persisted_id(), Some(persisted_id.as_str()));

        // Copy taken before the persisted id was attached
        store.update_bet(&settled).await.unwrap();
        let stored = store.load_bet(bet_id).unwrap().unwrap();
        assert!(stored.is_settled());
        assert_eq!(stored.persisted_id(), Some(persisted_id.as_str()));
        assert_eq!(store.load_bets(round.id()).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_id_sequence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let first = {
            let store = RocksRoundStore::open(dir.path()).unwrap();
            store.save_round(&Round::new(0.25, t0(), t0()).unwrap()).await.unwrap()
        };

        let store = RocksRoundStore::open(dir.path()).unwrap();
        let second = store.save_round(&Round::new(0.25, t0(), t0()).unwrap()).await.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_bets_indexed_by_round() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksRoundStore::open(dir.path()).unwrap();

        let round = Round::with_seed("seed-743".to_string(), 0.25, t0(), t0()).unwrap();
        let mut ledger = BetLedger::new(round.id());
        ledger.place(&round, t0() - Duration::seconds(1), "alice", 10.0, Some(1.5)).unwrap();
        ledger.place(&round, t0() - Duration::milliseconds(500), "bob", 3.0, None).unwrap();

        for bet in ledger.bets() {
            store.save_bet(bet).await.unwrap();
        }

        let bets = store.load_bets(round.id()).unwrap();
        assert_eq!(bets.len(), 2);
        assert_eq!(bets[0].player_id(), "alice");
        assert!(bets[0].persisted_id().is_some());
        assert!(store.load_bets(RoundId::new()).unwrap().is_empty());
    }
}
