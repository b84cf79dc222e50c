//! # Duel Arena Server
//!
//! Authoritative server for real-time, stake-based rock/paper/scissors
//! duels.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    DUEL ARENA SERVER                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Shared primitives                         │
//! │  └── rng.rs      - Deterministic Xorshift128+ PRNG           │
//! │                                                              │
//! │  game/           - Game rules and match lifecycle            │
//! │  ├── types.rs    - Identities, modes, currencies, arenas     │
//! │  ├── resolve.rs  - Move resolution and rank math             │
//! │  ├── bot.rs      - Adaptive bot opponent policy              │
//! │  └── session.rs  - Per-match state machine                   │
//! │                                                              │
//! │  economy/        - Stake escrow, payout, rank settlement     │
//! │                                                              │
//! │  store/          - Profile/stats persistence contract        │
//! │                                                              │
//! │  network/        - WebSocket server (non-deterministic)      │
//! │  ├── protocol.rs - Wire messages                             │
//! │  ├── matchmaking - Per-arena FIFO queues                     │
//! │  ├── registry.rs - Connection and session maps               │
//! │  └── server.rs   - Accept loop and session drivers           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Money Conservation
//!
//! Stakes are escrowed atomically when a match starts and leave escrow by
//! exactly one path: winner payout (both stakes), or a full refund of both
//! on an inactivity abort or server shutdown. No partial refunds exist.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

use std::time::Duration;

pub mod core;
pub mod economy;
pub mod game;
pub mod network;
pub mod store;

// Re-export commonly used types
pub use crate::core::rng::DeterministicRng;
pub use crate::economy::{Economy, EconomyError};
pub use crate::game::resolve::{resolve, Move, RankTier, RoundOutcome};
pub use crate::game::session::{DuelSession, SessionConfig};
pub use crate::game::types::{ArenaKey, Currency, Mode, PlayerId};
pub use crate::network::server::{DuelServer, DuelServerError, ServerConfig};
pub use crate::store::{MemoryStore, ProfileStore};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Pre-round countdown start value; ticks down once per second to 0.
pub const COUNTDOWN_FROM: u8 = 3;

/// Bounded round timer.
pub const ROUND_TIME: Duration = Duration::from_secs(3);

/// How long a round result stays on display.
pub const RESULT_DISPLAY: Duration = Duration::from_secs(2);

/// Round wins that end a match.
pub const SCORE_TO_WIN: u8 = 3;

/// Consecutive mutually-absent rounds that abort a match.
pub const INACTIVITY_ABORT_ROUNDS: u8 = 3;

/// Grace window for a disconnected player to resume.
pub const RECONNECT_GRACE: Duration = Duration::from_secs(10);

/// How long a finished session lingers for rematch negotiation.
pub const GAME_OVER_LINGER: Duration = Duration::from_secs(30);

/// Queue wait before a bot opponent is backfilled.
pub const BOT_BACKFILL_AFTER: Duration = Duration::from_secs(6);

/// Valid casual stake tiers, in coins.
pub const CASUAL_STAKES: [u64; 4] = [10, 50, 100, 500];
