//! Economy Store Adapter
//!
//! Atomic stake escrow, refund and payout against persisted profile rows.
//! A match must never start, or continue, with only one side's stake
//! collected: dual escrow validates both balances first and rolls back the
//! first deduction when the second loses a race to a concurrent spend.
//!
//! Synthetic bot identities always succeed without touching storage.

use std::sync::Arc;
use tracing::{error, warn};

use crate::game::resolve::{prize_for_stake, rank_points_lost, rank_points_won, RankTier};
use crate::game::types::{Currency, PlayerId};
use crate::store::{ProfileStore, StoreError};

/// Economy errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EconomyError {
    /// A player lacks the stake.
    #[error("Insufficient funds")]
    InsufficientFunds,

    /// Balances validated but a deduction then failed; any applied
    /// deduction was rolled back.
    #[error("Escrow race lost")]
    EscrowRace,

    /// No profile row for the identity.
    #[error("Profile not found")]
    ProfileNotFound,

    /// Zero or otherwise invalid amount.
    #[error("Invalid amount")]
    InvalidAmount,

    /// The storage engine failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Rank progression applied at ranked game over.
#[derive(Debug, Clone, Copy, Default)]
pub struct RankAdjustment {
    /// Signed point change.
    pub delta: i64,
    /// Points after the change.
    pub points: u64,
    /// Tier after the change.
    pub tier: RankTier,
}

/// Balance operations over the persisted store.
pub struct Economy {
    store: Arc<dyn ProfileStore>,
}

impl Economy {
    /// Wrap a store handle.
    pub fn new(store: Arc<dyn ProfileStore>) -> Self {
        Self { store }
    }

    /// Deduct `amount` of `currency` from a player.
    ///
    /// Fails on a zero amount, a missing profile, or an insufficient
    /// balance. Returns the new balance. Bots succeed without storage.
    pub async fn deduct(
        &self,
        id: &PlayerId,
        currency: Currency,
        amount: u64,
    ) -> Result<u64, EconomyError> {
        if amount == 0 {
            return Err(EconomyError::InvalidAmount);
        }
        if id.is_bot() {
            return Ok(0);
        }

        let mut profile = self
            .store
            .fetch_profile(id)
            .await?
            .ok_or(EconomyError::ProfileNotFound)?;

        let balance = profile.balance(currency);
        if balance < amount {
            return Err(EconomyError::InsufficientFunds);
        }
        profile.set_balance(currency, balance - amount);
        self.store.put_profile(profile).await?;
        Ok(balance - amount)
    }

    /// Credit `amount` of `currency` to a player. Returns the new balance.
    pub async fn credit(
        &self,
        id: &PlayerId,
        currency: Currency,
        amount: u64,
    ) -> Result<u64, EconomyError> {
        if amount == 0 {
            return Err(EconomyError::InvalidAmount);
        }
        if id.is_bot() {
            return Ok(0);
        }

        let mut profile = self
            .store
            .fetch_profile(id)
            .await?
            .ok_or(EconomyError::ProfileNotFound)?;

        let balance = profile.balance(currency) + amount;
        profile.set_balance(currency, balance);
        self.store.put_profile(profile).await?;
        Ok(balance)
    }

    /// Return an escrowed stake to a player.
    pub async fn refund(
        &self,
        id: &PlayerId,
        currency: Currency,
        amount: u64,
    ) -> Result<u64, EconomyError> {
        self.credit(id, currency, amount).await
    }

    /// Whether a player can cover `amount`. Bots always can.
    async fn has_funds(
        &self,
        id: &PlayerId,
        currency: Currency,
        amount: u64,
    ) -> Result<bool, EconomyError> {
        if id.is_bot() {
            return Ok(true);
        }
        let profile = self
            .store
            .fetch_profile(id)
            .await?
            .ok_or(EconomyError::ProfileNotFound)?;
        Ok(profile.balance(currency) >= amount)
    }

    /// Atomic dual escrow for starting or restarting a match.
    ///
    /// Validates both balances, then deducts both. If the second deduction
    /// fails after validation passed (a concurrent spend won the race), the
    /// first deduction is rolled back before reporting failure.
    pub async fn escrow_pair(
        &self,
        a: &PlayerId,
        b: &PlayerId,
        currency: Currency,
        amount: u64,
    ) -> Result<(), EconomyError> {
        if amount == 0 {
            return Err(EconomyError::InvalidAmount);
        }
        if !self.has_funds(a, currency, amount).await?
            || !self.has_funds(b, currency, amount).await?
        {
            return Err(EconomyError::InsufficientFunds);
        }

        self.deduct(a, currency, amount).await?;

        if let Err(cause) = self.deduct(b, currency, amount).await {
            warn!(player = %b, %cause, "escrow deduction lost race, rolling back");
            if let Err(rollback) = self.refund(a, currency, amount).await {
                // Funds would otherwise vanish; this is the one place a
                // failed credit is escalated rather than swallowed.
                error!(player = %a, %rollback, "escrow rollback failed");
                return Err(rollback);
            }
            return Err(EconomyError::EscrowRace);
        }

        Ok(())
    }

    /// Credit the winner's prize: both stakes.
    pub async fn payout_winner(
        &self,
        winner: &PlayerId,
        currency: Currency,
        stake: u64,
    ) -> Result<u64, EconomyError> {
        self.credit(winner, currency, prize_for_stake(stake)).await
    }

    /// Return both stakes in full. Used only for the inactivity-abort path.
    pub async fn refund_both(
        &self,
        a: &PlayerId,
        b: &PlayerId,
        currency: Currency,
        amount: u64,
    ) -> Result<(), EconomyError> {
        self.refund(a, currency, amount).await?;
        self.refund(b, currency, amount).await?;
        Ok(())
    }

    /// Apply ranked point deltas to both sides.
    ///
    /// Winner gains, loser drops with balances floored at 0; tier names are
    /// kept in sync on the profile rows. Bots are skipped.
    pub async fn apply_rank_result(
        &self,
        winner: &PlayerId,
        loser: &PlayerId,
        match_tier: RankTier,
    ) -> Result<(RankAdjustment, RankAdjustment), EconomyError> {
        let gain = rank_points_won(match_tier) as i64;
        let drop = -(rank_points_lost(match_tier) as i64);
        let won = self.adjust_rank(winner, gain).await?;
        let lost = self.adjust_rank(loser, drop).await?;
        Ok((won, lost))
    }

    async fn adjust_rank(
        &self,
        id: &PlayerId,
        delta: i64,
    ) -> Result<RankAdjustment, EconomyError> {
        if id.is_bot() {
            return Ok(RankAdjustment::default());
        }
        let mut profile = self
            .store
            .fetch_profile(id)
            .await?
            .ok_or(EconomyError::ProfileNotFound)?;

        let points = if delta >= 0 {
            profile.rank_points.saturating_add(delta as u64)
        } else {
            profile.rank_points.saturating_sub(delta.unsigned_abs())
        };
        let tier = RankTier::from_points(points);
        profile.rank_points = points;
        profile.rank_tier = tier.name().to_string();
        self.store.put_profile(profile).await?;

        Ok(RankAdjustment { delta, points, tier })
    }

    /// Bump the played/won counters on a profile row. Bots are skipped.
    pub async fn note_match_played(
        &self,
        id: &PlayerId,
        won: bool,
    ) -> Result<(), EconomyError> {
        if id.is_bot() {
            return Ok(());
        }
        let mut profile = self
            .store
            .fetch_profile(id)
            .await?
            .ok_or(EconomyError::ProfileNotFound)?;
        profile.games += 1;
        if won {
            profile.wins += 1;
        }
        self.store.put_profile(profile).await
            .map_err(EconomyError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use async_trait::async_trait;
    use crate::store::{MatchRecord, MemoryStore, ProfileRow, StatsDelta, StatsRow};
    use crate::game::bot::BotArenaConfig;
    use crate::game::types::ArenaKey;

    fn seeded(coins: &[(&str, u64)]) -> Arc<MemoryStore> {
        let mut store = MemoryStore::new();
        for (name, amount) in coins {
            store = store.with_profile(ProfileRow::new(PlayerId::new(*name), *amount, *amount));
        }
        Arc::new(store)
    }

    #[tokio::test]
    async fn test_deduct_and_credit() {
        let store = seeded(&[("alice", 100)]);
        let economy = Economy::new(store.clone());
        let alice = PlayerId::new("alice");

        assert_eq!(economy.deduct(&alice, Currency::Coins, 30).await.unwrap(), 70);
        assert_eq!(economy.credit(&alice, Currency::Coins, 10).await.unwrap(), 80);
        assert_eq!(store.balance_of(&alice, Currency::Coins), Some(80));
    }

    #[tokio::test]
    async fn test_deduct_rejects_bad_amounts() {
        let store = seeded(&[("alice", 20)]);
        let economy = Economy::new(store);
        let alice = PlayerId::new("alice");

        assert!(matches!(
            economy.deduct(&alice, Currency::Coins, 0).await,
            Err(EconomyError::InvalidAmount)
        ));
        assert!(matches!(
            economy.deduct(&alice, Currency::Coins, 21).await,
            Err(EconomyError::InsufficientFunds)
        ));
        assert!(matches!(
            economy.deduct(&PlayerId::new("ghost"), Currency::Coins, 5).await,
            Err(EconomyError::ProfileNotFound)
        ));
    }

    #[tokio::test]
    async fn test_bot_identity_bypasses_storage() {
        let store = seeded(&[]);
        let economy = Economy::new(store);
        let bot = PlayerId::bot();

        assert_eq!(economy.deduct(&bot, Currency::Coins, 1000).await.unwrap(), 0);
        assert_eq!(economy.credit(&bot, Currency::Gems, 1000).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_escrow_pair_success() {
        let store = seeded(&[("a", 100), ("b", 100)]);
        let economy = Economy::new(store.clone());
        let (a, b) = (PlayerId::new("a"), PlayerId::new("b"));

        economy.escrow_pair(&a, &b, Currency::Coins, 50).await.unwrap();
        assert_eq!(store.balance_of(&a, Currency::Coins), Some(50));
        assert_eq!(store.balance_of(&b, Currency::Coins), Some(50));
    }

    #[tokio::test]
    async fn test_escrow_pair_insufficient_takes_nothing() {
        let store = seeded(&[("a", 100), ("b", 10)]);
        let economy = Economy::new(store.clone());
        let (a, b) = (PlayerId::new("a"), PlayerId::new("b"));

        let result = economy.escrow_pair(&a, &b, Currency::Coins, 50).await;
        assert!(matches!(result, Err(EconomyError::InsufficientFunds)));
        assert_eq!(store.balance_of(&a, Currency::Coins), Some(100));
        assert_eq!(store.balance_of(&b, Currency::Coins), Some(10));
    }

    /// Store wrapper that drains the victim's balance between validation
    /// and deduction, reproducing a concurrent spend.
    struct RacingStore {
        inner: Arc<MemoryStore>,
        victim: PlayerId,
        fetches_before_drain: AtomicU32,
    }

    #[async_trait]
    impl ProfileStore for RacingStore {
        async fn fetch_profile(&self, id: &PlayerId) -> Result<Option<ProfileRow>, StoreError> {
            if *id == self.victim
                && self.fetches_before_drain.fetch_sub(1, Ordering::SeqCst) == 1
            {
                // Concurrent spend lands now.
                if let Some(mut row) = self.inner.fetch_profile(id).await? {
                    row.coins = 0;
                    self.inner.put_profile(row).await?;
                }
            }
            self.inner.fetch_profile(id).await
        }

        async fn put_profile(&self, row: ProfileRow) -> Result<(), StoreError> {
            self.inner.put_profile(row).await
        }

        async fn record_match(&self, record: MatchRecord) -> Result<(), StoreError> {
            self.inner.record_match(record).await
        }

        async fn fetch_stats(&self, id: &PlayerId) -> Result<Option<StatsRow>, StoreError> {
            self.inner.fetch_stats(id).await
        }

        async fn put_stats(&self, id: &PlayerId, row: StatsRow) -> Result<(), StoreError> {
            self.inner.put_stats(id, row).await
        }

        async fn increment_stats(&self, id: &PlayerId, delta: &StatsDelta) -> Result<(), StoreError> {
            self.inner.increment_stats(id, delta).await
        }

        async fn arena_config(&self, arena: &ArenaKey) -> Result<Option<BotArenaConfig>, StoreError> {
            self.inner.arena_config(arena).await
        }
    }

    #[tokio::test]
    async fn test_escrow_race_rolls_back() {
        let memory = seeded(&[("a", 100), ("b", 100)]);
        let (a, b) = (PlayerId::new("a"), PlayerId::new("b"));

        // b is fetched once for validation, once for deduction; the
        // concurrent spend lands on the second fetch.
        let racing = Arc::new(RacingStore {
            inner: memory.clone(),
            victim: b.clone(),
            fetches_before_drain: AtomicU32::new(2),
        });
        let economy = Economy::new(racing);

        let result = economy.escrow_pair(&a, &b, Currency::Coins, 50).await;
        assert!(matches!(result, Err(EconomyError::EscrowRace)));

        // a's deduction was rolled back, no funds vanished.
        assert_eq!(memory.balance_of(&a, Currency::Coins), Some(100));
        assert_eq!(memory.balance_of(&b, Currency::Coins), Some(0));
    }

    #[tokio::test]
    async fn test_escrow_payout_conserves_funds() {
        let store = seeded(&[("a", 100), ("b", 100)]);
        let economy = Economy::new(store.clone());
        let (a, b) = (PlayerId::new("a"), PlayerId::new("b"));
        let stake = 40;

        economy.escrow_pair(&a, &b, Currency::Coins, stake).await.unwrap();
        economy.payout_winner(&a, Currency::Coins, stake).await.unwrap();

        let total = store.balance_of(&a, Currency::Coins).unwrap()
            + store.balance_of(&b, Currency::Coins).unwrap();
        assert_eq!(total, 200); // escrowed == paid out
        assert_eq!(store.balance_of(&a, Currency::Coins), Some(140));
        assert_eq!(store.balance_of(&b, Currency::Coins), Some(60));
    }

    #[tokio::test]
    async fn test_escrow_refund_conserves_funds() {
        let store = seeded(&[("a", 100), ("b", 100)]);
        let economy = Economy::new(store.clone());
        let (a, b) = (PlayerId::new("a"), PlayerId::new("b"));

        economy.escrow_pair(&a, &b, Currency::Coins, 25).await.unwrap();
        economy.refund_both(&a, &b, Currency::Coins, 25).await.unwrap();

        assert_eq!(store.balance_of(&a, Currency::Coins), Some(100));
        assert_eq!(store.balance_of(&b, Currency::Coins), Some(100));
    }

    #[tokio::test]
    async fn test_rank_result_floors_at_zero() {
        let store = seeded(&[("a", 100), ("b", 100)]);
        let economy = Economy::new(store.clone());
        let (a, b) = (PlayerId::new("a"), PlayerId::new("b"));

        // Both start at 0 points (Bronze, x1): winner +20, loser floored.
        let (won, lost) = economy
            .apply_rank_result(&a, &b, RankTier::Bronze)
            .await
            .unwrap();

        assert_eq!(won.delta, 20);
        assert_eq!(won.points, 20);
        assert_eq!(lost.delta, -15);
        assert_eq!(lost.points, 0);

        let row = store.fetch_profile(&a).await.unwrap().unwrap();
        assert_eq!(row.rank_points, 20);
        assert_eq!(row.rank_tier, "Bronze");
    }

    #[tokio::test]
    async fn test_rank_result_promotes_tier() {
        let store = Arc::new(MemoryStore::new().with_profile({
            let mut row = ProfileRow::new(PlayerId::new("a"), 0, 0);
            row.rank_points = 990;
            row
        }).with_profile(ProfileRow::new(PlayerId::new("b"), 0, 0)));
        let economy = Economy::new(store.clone());

        let (won, _) = economy
            .apply_rank_result(&PlayerId::new("a"), &PlayerId::new("b"), RankTier::Bronze)
            .await
            .unwrap();

        assert_eq!(won.points, 1010);
        assert_eq!(won.tier, RankTier::Silver);
        let row = store.fetch_profile(&PlayerId::new("a")).await.unwrap().unwrap();
        assert_eq!(row.rank_tier, "Silver");
    }

    #[tokio::test]
    async fn test_note_match_played() {
        let store = seeded(&[("a", 0)]);
        let economy = Economy::new(store.clone());
        let a = PlayerId::new("a");

        economy.note_match_played(&a, true).await.unwrap();
        economy.note_match_played(&a, false).await.unwrap();

        let row = store.fetch_profile(&a).await.unwrap().unwrap();
        assert_eq!(row.games, 2);
        assert_eq!(row.wins, 1);
    }
}
