//! Bot Decision Engine
//!
//! Produces moves for synthetic opponents. The bot never sees the human's
//! current-round choice, only the previous round's, so it cannot win a live
//! round deterministically. It nudges its realized win rate toward the
//! arena's configured target over many rounds by varying how often it
//! attempts to beat the last known move.

use std::collections::BTreeMap;
use serde::{Serialize, Deserialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::core::rng::DeterministicRng;
use crate::game::resolve::{Move, ALL_MOVES};
use crate::game::types::ArenaKey;

/// Deadband around the target win rate (percentage points) inside which the
/// bot plays 50/50.
const TARGET_DEADBAND: f64 = 5.0;

/// Win-attempt probability when the bot is behind its target.
const PUSH_UP_PERCENT: u32 = 70;

/// Win-attempt probability when the bot is ahead of its target.
const PUSH_DOWN_PERCENT: u32 = 30;

/// Persisted per-arena bot configuration (read-only from this server).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotArenaConfig {
    /// Arena this configuration applies to.
    pub arena: ArenaKey,
    /// Target bot win rate in percent.
    pub target_win_rate: f64,
    /// When set, the bot ignores history and plays uniformly at random.
    pub random_only: bool,
}

impl BotArenaConfig {
    /// Default configuration for arenas without a persisted row.
    pub fn default_for(arena: ArenaKey) -> Self {
        Self {
            arena,
            target_win_rate: 50.0,
            random_only: false,
        }
    }
}

/// Running win/loss counters for one arena's bot.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArenaTelemetry {
    /// Decisive rounds the bot won.
    pub wins: u64,
    /// Decisive rounds the bot lost.
    pub losses: u64,
}

impl ArenaTelemetry {
    /// Realized win rate in percent over decisive rounds.
    ///
    /// Returns None before the first decisive round.
    pub fn win_rate(&self) -> Option<f64> {
        let total = self.wins + self.losses;
        if total == 0 {
            None
        } else {
            Some(self.wins as f64 * 100.0 / total as f64)
        }
    }

    /// Record a decisive round. Ties are not counted.
    pub fn record(&mut self, bot_won: bool) {
        if bot_won {
            self.wins += 1;
        } else {
            self.losses += 1;
        }
    }
}

/// Everything the decision function needs about an arena, captured at
/// round start.
#[derive(Debug, Clone, Copy)]
pub struct BotView {
    /// Target win rate in percent.
    pub target_win_rate: f64,
    /// Current realized win rate in percent, if any rounds were decisive.
    pub current_win_rate: Option<f64>,
    /// Fully-random arena flag.
    pub random_only: bool,
}

/// Decide the bot's move for the coming round.
///
/// `last_opponent_move` is the human's move from the previous round;
/// unknown on round 1.
pub fn decide(
    rng: &mut DeterministicRng,
    view: BotView,
    last_opponent_move: Option<Move>,
) -> Move {
    let prior = match (view.random_only, last_opponent_move) {
        (true, _) | (_, None) => {
            return *rng.choose(&ALL_MOVES).unwrap_or(&Move::Rock);
        }
        (false, Some(mv)) => mv,
    };

    // No telemetry yet: treat realized rate as on-target.
    let diff = view.current_win_rate.unwrap_or(view.target_win_rate) - view.target_win_rate;
    let try_win_percent = if diff < -TARGET_DEADBAND {
        PUSH_UP_PERCENT
    } else if diff > TARGET_DEADBAND {
        PUSH_DOWN_PERCENT
    } else {
        50
    };

    if rng.percent(try_win_percent) {
        prior.loses_to() // the move that beats the prior move
    } else {
        prior.beats() // the move that loses to the prior move
    }
}

// =============================================================================
// ARENA TABLE
// =============================================================================

/// Live telemetry per arena, seeded from persisted configuration.
///
/// Persisted arena rows are never written by this server; the admin surface
/// owns them. This table closes the feedback loop for matches in flight.
pub struct ArenaTable {
    arenas: RwLock<BTreeMap<ArenaKey, ArenaEntry>>,
}

struct ArenaEntry {
    config: BotArenaConfig,
    telemetry: ArenaTelemetry,
}

impl ArenaTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self { arenas: RwLock::new(BTreeMap::new()) }
    }

    /// Install or refresh the configuration for an arena, keeping any
    /// telemetry already accumulated.
    pub async fn install(&self, config: BotArenaConfig) {
        let mut arenas = self.arenas.write().await;
        match arenas.get_mut(&config.arena) {
            Some(entry) => entry.config = config,
            None => {
                arenas.insert(config.arena, ArenaEntry {
                    config,
                    telemetry: ArenaTelemetry::default(),
                });
            }
        }
    }

    /// Whether a configuration is already installed for this arena.
    pub async fn contains(&self, arena: &ArenaKey) -> bool {
        self.arenas.read().await.contains_key(arena)
    }

    /// Snapshot the decision inputs for an arena.
    ///
    /// Arenas without an installed configuration get the defaults.
    pub async fn view(&self, arena: &ArenaKey) -> BotView {
        let arenas = self.arenas.read().await;
        match arenas.get(arena) {
            Some(entry) => BotView {
                target_win_rate: entry.config.target_win_rate,
                current_win_rate: entry.telemetry.win_rate(),
                random_only: entry.config.random_only,
            },
            None => BotView {
                target_win_rate: 50.0,
                current_win_rate: None,
                random_only: false,
            },
        }
    }

    /// Record the outcome of a decisive bot round.
    pub async fn record_round(&self, arena: &ArenaKey, bot_won: bool) {
        let mut arenas = self.arenas.write().await;
        let entry = arenas.entry(*arena).or_insert_with(|| ArenaEntry {
            config: BotArenaConfig::default_for(*arena),
            telemetry: ArenaTelemetry::default(),
        });
        entry.telemetry.record(bot_won);
        debug!(
            arena = %arena,
            win_rate = ?entry.telemetry.win_rate(),
            "bot round recorded"
        );
    }
}

impl Default for ArenaTable {
    fn default() -> Self {
        Self::new()
    }
}
