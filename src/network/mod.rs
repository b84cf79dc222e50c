//! Network Layer
//!
//! WebSocket server for real-time duels. All game rules live in `game/`;
//! this layer binds identities, pairs players, and drives sessions.

pub mod matchmaking;
pub mod protocol;
pub mod registry;
pub mod server;

pub use matchmaking::{EnqueueOutcome, QueueEntry, QueueManager};
pub use protocol::{
    ClientMessage, GameOverInfo, MatchFoundInfo, MatchSnapshot, MatchWinner,
    RoundResultInfo, RoundWinner, ServerMessage,
};
pub use registry::{ConnectionHandle, Registry, SessionHandle};
pub use server::{DuelServer, DuelServerError, ServerConfig};
