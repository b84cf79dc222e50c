//! Matchmaking Queues
//!
//! Per-arena FIFO queues. Casual players queue under their chosen stake;
//! ranked players queue under the stake derived from their rank tier, which
//! also restricts ranked pairing to same-tier opponents. A player occupies
//! at most one queue slot at a time; re-queuing moves the entry.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::game::types::{ArenaKey, PlayerId};
use crate::network::protocol::ServerMessage;

/// A player waiting for an opponent.
#[derive(Debug)]
pub struct QueueEntry {
    /// Waiting player.
    pub id: PlayerId,
    /// Display image forwarded to the eventual opponent.
    pub image_ref: Option<String>,
    /// Outbound channel, carried into the session on pairing.
    pub sender: mpsc::Sender<ServerMessage>,
    /// When the entry joined, for bot backfill.
    pub enqueued_at: Instant,
}

/// Result of a queue join.
#[derive(Debug)]
pub enum EnqueueOutcome {
    /// An opponent was already waiting; neither remains queued.
    PairedWith(QueueEntry, QueueEntry),
    /// No opponent yet; the entry waits.
    Queued,
    /// Already waiting in this arena; the duplicate request is dropped
    /// and the original entry keeps its queue position.
    AlreadyQueued,
}

/// All matchmaking queues, grouped by arena.
pub struct QueueManager {
    queues: RwLock<BTreeMap<ArenaKey, VecDeque<QueueEntry>>>,
}

impl QueueManager {
    /// Create an empty queue set.
    pub fn new() -> Self {
        Self { queues: RwLock::new(BTreeMap::new()) }
    }

    /// Join the queue for an arena.
    ///
    /// If the player is already waiting anywhere, that older entry is
    /// replaced. When an opponent is available the two are paired FIFO and
    /// neither remains queued.
    pub async fn enqueue(&self, arena: ArenaKey, entry: QueueEntry) -> EnqueueOutcome {
        let mut queues = self.queues.write().await;

        // A duplicate request for the arena the player already occupies is
        // ignored; the original entry keeps its FIFO position.
        if queues
            .get(&arena)
            .map_or(false, |q| q.iter().any(|e| e.id == entry.id))
        {
            debug!(arena = %arena, player = %entry.id, "already queued");
            return EnqueueOutcome::AlreadyQueued;
        }

        // Single queue occupancy: switching arenas drops the previous entry.
        for queue in queues.values_mut() {
            queue.retain(|e| e.id != entry.id);
        }

        let queue = queues.entry(arena).or_default();
        if let Some(opponent) = queue.pop_front() {
            debug!(arena = %arena, player = %entry.id, opponent = %opponent.id, "paired");
            // Entry never enters the queue; hand it back with its opponent.
            drop(queues);
            return EnqueueOutcome::PairedWith(opponent, entry);
        }

        debug!(arena = %arena, player = %entry.id, "queued");
        queue.push_back(entry);
        EnqueueOutcome::Queued
    }

    /// Leave all queues. Idempotent; true when an entry was removed.
    pub async fn remove(&self, id: &PlayerId) -> bool {
        let mut queues = self.queues.write().await;
        let mut removed = false;
        for queue in queues.values_mut() {
            let before = queue.len();
            queue.retain(|e| &e.id != id);
            removed |= queue.len() != before;
        }
        queues.retain(|_, q| !q.is_empty());
        removed
    }

    /// Whether a player is currently waiting in any queue.
    pub async fn is_queued(&self, id: &PlayerId) -> bool {
        let queues = self.queues.read().await;
        queues.values().any(|q| q.iter().any(|e| &e.id == id))
    }

    /// Pop every entry that has waited at least `max_wait`, for bot
    /// backfill.
    pub async fn take_stale(&self, now: Instant, max_wait: Duration) -> Vec<(ArenaKey, QueueEntry)> {
        let mut queues = self.queues.write().await;
        let mut stale = Vec::new();
        for (arena, queue) in queues.iter_mut() {
            while queue
                .front()
                .map(|e| now.duration_since(e.enqueued_at) >= max_wait)
                .unwrap_or(false)
            {
                if let Some(entry) = queue.pop_front() {
                    stale.push((*arena, entry));
                }
            }
        }
        queues.retain(|_, q| !q.is_empty());
        stale
    }

    /// Waiting players in one arena.
    pub async fn depth(&self, arena: ArenaKey) -> usize {
        let queues = self.queues.read().await;
        queues.get(&arena).map(|q| q.len()).unwrap_or(0)
    }
}

impl Default for QueueManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::types::Mode;

    fn entry(name: &str, at: Instant) -> QueueEntry {
        let (tx, _rx) = mpsc::channel(8);
        QueueEntry {
            id: PlayerId::new(name),
            image_ref: None,
            sender: tx,
            enqueued_at: at,
        }
    }

    fn arena(stake: u64) -> ArenaKey {
        ArenaKey { mode: Mode::Casual, stake }
    }

    #[tokio::test]
    async fn test_fifo_pairing() {
        let queues = QueueManager::new();
        let now = Instant::now();

        assert!(matches!(
            queues.enqueue(arena(100), entry("a", now)).await,
            EnqueueOutcome::Queued
        ));

        match queues.enqueue(arena(100), entry("b", now)).await {
            EnqueueOutcome::PairedWith(opponent, joiner) => {
                assert_eq!(opponent.id, PlayerId::new("a"));
                assert_eq!(joiner.id, PlayerId::new("b"));
            }
            other => panic!("expected pairing, got {:?}", other),
        }
        assert_eq!(queues.depth(arena(100)).await, 0);

        assert!(matches!(
            queues.enqueue(arena(100), entry("c", now)).await,
            EnqueueOutcome::Queued
        ));
        assert_eq!(queues.depth(arena(100)).await, 1);
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_same_arena_is_ignored() {
        let queues = QueueManager::new();
        let now = Instant::now();

        queues.enqueue(arena(100), entry("a", now)).await;
        assert!(matches!(
            queues
                .enqueue(arena(100), entry("a", now + Duration::from_secs(5)))
                .await,
            EnqueueOutcome::AlreadyQueued
        ));
        assert_eq!(queues.depth(arena(100)).await, 1);

        // The original entry, not the duplicate, gets paired.
        match queues.enqueue(arena(100), entry("b", now)).await {
            EnqueueOutcome::PairedWith(opponent, _) => {
                assert_eq!(opponent.id, PlayerId::new("a"));
                assert_eq!(opponent.enqueued_at, now);
            }
            other => panic!("expected pairing, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stakes_do_not_cross() {
        let queues = QueueManager::new();
        let now = Instant::now();

        queues.enqueue(arena(10), entry("a", now)).await;
        assert!(matches!(
            queues.enqueue(arena(500), entry("b", now)).await,
            EnqueueOutcome::Queued
        ));
    }

    #[tokio::test]
    async fn test_requeue_replaces_previous_entry() {
        let queues = QueueManager::new();
        let now = Instant::now();

        queues.enqueue(arena(10), entry("a", now)).await;
        queues.enqueue(arena(500), entry("a", now)).await;

        assert_eq!(queues.depth(arena(10)).await, 0);
        assert_eq!(queues.depth(arena(500)).await, 1);

        // Not paired against the player's own stale entry.
        queues.enqueue(arena(10), entry("b", now)).await;
        match queues.enqueue(arena(10), entry("a", now)).await {
            EnqueueOutcome::PairedWith(opponent, _) => {
                assert_eq!(opponent.id, PlayerId::new("b"));
            }
            other => panic!("expected pairing, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let queues = QueueManager::new();
        let now = Instant::now();
        let id = PlayerId::new("a");

        queues.enqueue(arena(100), entry("a", now)).await;
        assert!(queues.remove(&id).await);
        assert!(!queues.remove(&id).await);
        assert!(!queues.is_queued(&id).await);
    }

    #[tokio::test]
    async fn test_take_stale_pops_old_entries() {
        let queues = QueueManager::new();
        let now = Instant::now();

        queues.enqueue(arena(100), entry("a", now)).await;
        queues
            .enqueue(arena(50), entry("b", now + Duration::from_secs(5)))
            .await;

        let stale = queues
            .take_stale(now + Duration::from_secs(6), Duration::from_secs(6))
            .await;
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].0, arena(100));
        assert_eq!(stale[0].1.id, PlayerId::new("a"));
        assert_eq!(queues.depth(arena(50)).await, 1);
    }
}
