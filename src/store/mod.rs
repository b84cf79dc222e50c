//! Persisted Store Contract
//!
//! Row-shape contract this server relies on: profile rows with currency
//! balances and rank progression, match-history rows, per-player statistics
//! rows, and read-only arena bot configuration rows. The storage engine
//! itself is an external collaborator; an in-memory implementation backs
//! tests and local runs.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use tracing::warn;
use uuid::Uuid;

use crate::game::resolve::RankTier;
use crate::game::types::{ArenaKey, Currency, Mode, PlayerId};
use crate::game::bot::BotArenaConfig;

/// Store errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// No row exists for the identity.
    #[error("Profile not found")]
    ProfileNotFound,

    /// A write was rejected by the storage engine.
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// The atomic increment path is unavailable; use the
    /// read-modify-write fallback.
    #[error("Atomic increment unavailable")]
    AtomicUnavailable,
}

/// Persisted profile row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileRow {
    /// Owning identity.
    pub id: PlayerId,
    /// Casual currency balance.
    pub coins: u64,
    /// Ranked currency balance.
    pub gems: u64,
    /// Cumulative rank points.
    pub rank_points: u64,
    /// Rank tier name, kept in sync with `rank_points`.
    pub rank_tier: String,
    /// Matches won.
    pub wins: u64,
    /// Matches played.
    pub games: u64,
}

impl ProfileRow {
    /// Fresh profile with the given starting balances.
    pub fn new(id: PlayerId, coins: u64, gems: u64) -> Self {
        Self {
            id,
            coins,
            gems,
            rank_points: 0,
            rank_tier: RankTier::Bronze.name().to_string(),
            wins: 0,
            games: 0,
        }
    }

    /// Balance for one currency.
    pub fn balance(&self, currency: Currency) -> u64 {
        match currency {
            Currency::Coins => self.coins,
            Currency::Gems => self.gems,
        }
    }

    /// Overwrite the balance for one currency.
    pub fn set_balance(&mut self, currency: Currency, amount: u64) {
        match currency {
            Currency::Coins => self.coins = amount,
            Currency::Gems => self.gems = amount,
        }
    }

    /// Current rank tier derived from points.
    pub fn tier(&self) -> RankTier {
        RankTier::from_points(self.rank_points)
    }
}

/// Persisted match-history row, one per completed match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRecord {
    /// Match identifier.
    pub match_id: Uuid,
    /// Both participants.
    pub players: [PlayerId; 2],
    /// Final scores, aligned with `players`.
    pub scores: [u8; 2],
    /// Match mode.
    pub mode: Mode,
    /// Stake each side escrowed.
    pub stake: u64,
    /// Winner, if the match was decisive.
    pub winner: Option<PlayerId>,
    /// Completion timestamp.
    pub finished_at: DateTime<Utc>,
}

/// Per-player statistics row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsRow {
    /// Moves played, indexed rock/paper/scissors.
    pub moves: [u64; 3],
    /// Opening (round 1) moves, same indexing.
    pub opening_moves: [u64; 3],
    /// Matches completed.
    pub matches: u64,
    /// Matches won.
    pub wins: u64,
}

/// Increment applied to a statistics row.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsDelta {
    /// Move counts to add.
    pub moves: [u64; 3],
    /// Opening-move counts to add.
    pub opening_moves: [u64; 3],
    /// Matches completed to add.
    pub matches: u64,
    /// Matches won to add.
    pub wins: u64,
}

impl StatsRow {
    /// Merge a delta into this row.
    pub fn apply(&mut self, delta: &StatsDelta) {
        for i in 0..3 {
            self.moves[i] += delta.moves[i];
            self.opening_moves[i] += delta.opening_moves[i];
        }
        self.matches += delta.matches;
        self.wins += delta.wins;
    }
}

/// Transactional row-level store contract.
///
/// Every method is a single round trip against one row; the economy adapter
/// composes them into multi-row settlements.
#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Fetch a profile row.
    async fn fetch_profile(&self, id: &PlayerId) -> Result<Option<ProfileRow>, StoreError>;

    /// Write a profile row back.
    async fn put_profile(&self, row: ProfileRow) -> Result<(), StoreError>;

    /// Append one match-history row.
    async fn record_match(&self, record: MatchRecord) -> Result<(), StoreError>;

    /// Fetch a statistics row.
    async fn fetch_stats(&self, id: &PlayerId) -> Result<Option<StatsRow>, StoreError>;

    /// Write a statistics row back.
    async fn put_stats(&self, id: &PlayerId, row: StatsRow) -> Result<(), StoreError>;

    /// Atomically increment a statistics row.
    ///
    /// Errs with [`StoreError::AtomicUnavailable`] when the engine has no
    /// atomic path; callers fall back to fetch + apply + put.
    async fn increment_stats(&self, id: &PlayerId, delta: &StatsDelta) -> Result<(), StoreError>;

    /// Read the bot configuration row for an arena. Read-only.
    async fn arena_config(&self, arena: &ArenaKey) -> Result<Option<BotArenaConfig>, StoreError>;
}

// =============================================================================
// STATS WRITER
// =============================================================================

/// One interface for statistics increments; callers never see which path
/// performed the write.
#[async_trait]
pub trait StatsWriter: Send + Sync {
    /// Apply a delta to a player's statistics row.
    async fn increment(&self, id: &PlayerId, delta: StatsDelta) -> Result<(), StoreError>;
}

/// Atomic increment against the store's native path.
pub struct AtomicStatsWriter {
    store: Arc<dyn ProfileStore>,
}

impl AtomicStatsWriter {
    /// Wrap a store.
    pub fn new(store: Arc<dyn ProfileStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StatsWriter for AtomicStatsWriter {
    async fn increment(&self, id: &PlayerId, delta: StatsDelta) -> Result<(), StoreError> {
        self.store.increment_stats(id, &delta).await
    }
}

/// Manual read-modify-write increment.
pub struct ReadModifyWriteStatsWriter {
    store: Arc<dyn ProfileStore>,
}

impl ReadModifyWriteStatsWriter {
    /// Wrap a store.
    pub fn new(store: Arc<dyn ProfileStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StatsWriter for ReadModifyWriteStatsWriter {
    async fn increment(&self, id: &PlayerId, delta: StatsDelta) -> Result<(), StoreError> {
        let mut row = self.store.fetch_stats(id).await?.unwrap_or_default();
        row.apply(&delta);
        self.store.put_stats(id, row).await
    }
}

/// Default writer: atomic path first, read-modify-write on
/// [`StoreError::AtomicUnavailable`].
pub struct StatsRecorder {
    atomic: AtomicStatsWriter,
    fallback: ReadModifyWriteStatsWriter,
}

impl StatsRecorder {
    /// Build both paths over one store.
    pub fn new(store: Arc<dyn ProfileStore>) -> Self {
        Self {
            atomic: AtomicStatsWriter::new(store.clone()),
            fallback: ReadModifyWriteStatsWriter::new(store),
        }
    }
}

#[async_trait]
impl StatsWriter for StatsRecorder {
    async fn increment(&self, id: &PlayerId, delta: StatsDelta) -> Result<(), StoreError> {
        match self.atomic.increment(id, delta).await {
            Err(StoreError::AtomicUnavailable) => {
                warn!(player = %id, "atomic stats path unavailable, using read-modify-write");
                self.fallback.increment(id, delta).await
            }
            other => other,
        }
    }
}

// =============================================================================
// IN-MEMORY STORE
// =============================================================================

/// In-memory store for tests and local runs.
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    atomic_stats: AtomicBool,
}

#[derive(Default)]
struct MemoryInner {
    profiles: BTreeMap<PlayerId, ProfileRow>,
    stats: BTreeMap<PlayerId, StatsRow>,
    matches: Vec<MatchRecord>,
    arenas: BTreeMap<ArenaKey, BotArenaConfig>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryInner::default()),
            atomic_stats: AtomicBool::new(true),
        }
    }

    /// Seed a profile row.
    pub fn with_profile(self, row: ProfileRow) -> Self {
        self.inner.lock().unwrap().profiles.insert(row.id.clone(), row);
        self
    }

    /// Seed an arena configuration row.
    pub fn with_arena(self, config: BotArenaConfig) -> Self {
        self.inner.lock().unwrap().arenas.insert(config.arena, config);
        self
    }

    /// Disable the atomic stats path, forcing the fallback.
    pub fn disable_atomic_stats(&self) {
        self.atomic_stats.store(false, Ordering::SeqCst);
    }

    /// Current balance for one identity, for assertions.
    pub fn balance_of(&self, id: &PlayerId, currency: Currency) -> Option<u64> {
        self.inner.lock().unwrap().profiles.get(id).map(|p| p.balance(currency))
    }

    /// Recorded match rows, for assertions.
    pub fn match_records(&self) -> Vec<MatchRecord> {
        self.inner.lock().unwrap().matches.clone()
    }

    /// Current stats row for one identity, for assertions.
    pub fn stats_of(&self, id: &PlayerId) -> Option<StatsRow> {
        self.inner.lock().unwrap().stats.get(id).cloned()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProfileStore for MemoryStore {
    async fn fetch_profile(&self, id: &PlayerId) -> Result<Option<ProfileRow>, StoreError> {
        Ok(self.inner.lock().unwrap().profiles.get(id).cloned())
    }

    async fn put_profile(&self, row: ProfileRow) -> Result<(), StoreError> {
        self.inner.lock().unwrap().profiles.insert(row.id.clone(), row);
        Ok(())
    }

    async fn record_match(&self, record: MatchRecord) -> Result<(), StoreError> {
        self.inner.lock().unwrap().matches.push(record);
        Ok(())
    }

    async fn fetch_stats(&self, id: &PlayerId) -> Result<Option<StatsRow>, StoreError> {
        Ok(self.inner.lock().unwrap().stats.get(id).cloned())
    }

    async fn put_stats(&self, id: &PlayerId, row: StatsRow) -> Result<(), StoreError> {
        self.inner.lock().unwrap().stats.insert(id.clone(), row);
        Ok(())
    }

    async fn increment_stats(&self, id: &PlayerId, delta: &StatsDelta) -> Result<(), StoreError> {
        if !self.atomic_stats.load(Ordering::SeqCst) {
            return Err(StoreError::AtomicUnavailable);
        }
        let mut inner = self.inner.lock().unwrap();
        inner.stats.entry(id.clone()).or_default().apply(delta);
        Ok(())
    }

    async fn arena_config(&self, arena: &ArenaKey) -> Result<Option<BotArenaConfig>, StoreError> {
        Ok(self.inner.lock().unwrap().arenas.get(arena).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player(n: &str) -> PlayerId {
        PlayerId::new(n)
    }

    #[tokio::test]
    async fn test_profile_roundtrip() {
        let store = MemoryStore::new();
        let id = player("alice");

        assert!(store.fetch_profile(&id).await.unwrap().is_none());

        store.put_profile(ProfileRow::new(id.clone(), 100, 50)).await.unwrap();
        let row = store.fetch_profile(&id).await.unwrap().unwrap();
        assert_eq!(row.coins, 100);
        assert_eq!(row.gems, 50);
        assert_eq!(row.rank_tier, "Bronze");
    }

    #[tokio::test]
    async fn test_atomic_stats_increment() {
        let store = MemoryStore::new();
        let id = player("bob");
        let delta = StatsDelta {
            moves: [1, 0, 0],
            opening_moves: [1, 0, 0],
            matches: 1,
            wins: 1,
        };

        store.increment_stats(&id, &delta).await.unwrap();
        store.increment_stats(&id, &delta).await.unwrap();

        let row = store.fetch_stats(&id).await.unwrap().unwrap();
        assert_eq!(row.moves[0], 2);
        assert_eq!(row.wins, 2);
    }

    #[tokio::test]
    async fn test_stats_recorder_falls_back() {
        let store = Arc::new(MemoryStore::new());
        store.disable_atomic_stats();

        let recorder = StatsRecorder::new(store.clone());
        let id = player("carol");
        let delta = StatsDelta { moves: [0, 1, 0], matches: 1, ..Default::default() };

        recorder.increment(&id, delta).await.unwrap();
        recorder.increment(&id, delta).await.unwrap();

        let row = store.stats_of(&id).unwrap();
        assert_eq!(row.moves[1], 2);
        assert_eq!(row.matches, 2);
    }

    #[tokio::test]
    async fn test_rmw_writer_creates_missing_row() {
        let store = Arc::new(MemoryStore::new());
        let writer = ReadModifyWriteStatsWriter::new(store.clone());
        let id = player("dave");

        writer.increment(&id, StatsDelta { wins: 1, ..Default::default() }).await.unwrap();
        assert_eq!(store.stats_of(&id).unwrap().wins, 1);
    }

    #[tokio::test]
    async fn test_match_records_append() {
        let store = MemoryStore::new();
        let a = player("a");
        let b = player("b");
        store.record_match(MatchRecord {
            match_id: Uuid::new_v4(),
            players: [a.clone(), b.clone()],
            scores: [3, 1],
            mode: Mode::Casual,
            stake: 10,
            winner: Some(a),
            finished_at: Utc::now(),
        }).await.unwrap();

        assert_eq!(store.match_records().len(), 1);
        assert_eq!(store.match_records()[0].scores, [3, 1]);
    }
}
