//! Game Rules and Match Lifecycle
//!
//! Pure move resolution and rank math, the adaptive bot policy, and the
//! deadline-driven session state machine that owns one duel.

pub mod bot;
pub mod resolve;
pub mod session;
pub mod types;

pub use resolve::{resolve, Move, RankTier, RoundOutcome};
pub use session::{Directive, DuelSession, Participant, SessionConfig, Settlement};
pub use types::{ArenaKey, Currency, Mode, PlayerId};
