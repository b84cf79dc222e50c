//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! All messages are serialized as JSON with a `type` tag.
//! Results are personalized: each side sees itself as "you" and the
//! other side as "opponent".

use serde::{Serialize, Deserialize};

use crate::game::resolve::Move;
use crate::game::types::Mode;

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Bind the connection to a verified identity.
    ///
    /// Token verification happens upstream; this carries only its result.
    Identify { user_id: String },

    /// Request a match in a mode and stake tier.
    FindMatch {
        /// Desired mode.
        mode: Mode,
        /// Casual stake tier; ignored for ranked (derived from rank tier).
        stake: Option<u64>,
        /// Display image reference shown to the opponent.
        image_ref: Option<String>,
    },

    /// Leave the matchmaking queue.
    LeaveQueue,

    /// Submit the move for the current round.
    MakeChoice { choice: Move },

    /// Ask the opponent for a rematch (only valid at game over).
    RequestRematch,

    /// Answer a rematch request.
    RematchResponse { accept: bool },

    /// Resume a match interrupted by a disconnect.
    CheckReconnection,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Queued; no opponent available yet.
    Waiting,

    /// Paired with an opponent.
    MatchFound(MatchFoundInfo),

    /// Pre-round countdown tick.
    Countdown { n: u8 },

    /// A round has begun.
    RoundStart { round: u32 },

    /// Round timer tick.
    Timer { remaining: u8 },

    /// Round resolved.
    RoundResult(RoundResultInfo),

    /// Match finished.
    GameOver(GameOverInfo),

    /// The opponent dropped; the match holds for the grace window.
    OpponentDisconnected { timeout_ms: u64 },

    /// The opponent came back within the grace window.
    OpponentReconnected,

    /// Full state snapshot for a rejoining player.
    ReconnectSuccess(MatchSnapshot),

    /// The opponent wants a rematch.
    RematchRequested,

    /// Rematch accepted; stakes re-escrowed, new countdown starting.
    RematchAccepted,

    /// Rematch declined.
    RematchDeclined,

    /// The opponent left the session.
    OpponentLeft,

    /// A match-scoped failure, summarized for display.
    MatchError { message: String },

    /// Server is shutting down.
    Shutdown { reason: String },
}

/// Opponent reference shown to a player.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpponentRef {
    /// Opponent identity.
    pub id: String,
    /// Opponent display image.
    pub image_ref: Option<String>,
}

/// Pairing details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchFoundInfo {
    /// The paired opponent.
    pub opponent: OpponentRef,
    /// Entry stake both sides escrow.
    pub stake: u64,
    /// Match mode.
    pub mode: Mode,
}

/// Round winner from the recipient's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundWinner {
    /// The recipient won the round.
    You,
    /// The opponent won the round.
    Opponent,
    /// The round tied.
    Tie,
}

/// Personalized round result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundResultInfo {
    /// Round number just resolved.
    pub round: u32,
    /// Winner relative to the recipient.
    pub winner: RoundWinner,
    /// Recipient's move; absent on a mutual-timeout tie.
    pub your_move: Option<Move>,
    /// Opponent's move; absent on a mutual-timeout tie.
    pub opponent_move: Option<Move>,
    /// Recipient's score after the round.
    pub your_score: u8,
    /// Opponent's score after the round.
    pub opponent_score: u8,
}

/// Match winner from the recipient's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchWinner {
    /// The recipient won.
    You,
    /// The opponent won.
    Opponent,
    /// No winner (inactivity abort).
    #[serde(rename = "none")]
    Nobody,
}

/// Personalized match outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameOverInfo {
    /// Winner relative to the recipient.
    pub winner: MatchWinner,
    /// Set when the match ended by disconnect forfeit.
    pub forfeit: bool,
    /// Set when the match ended by inactivity abort (stakes refunded).
    pub aborted: bool,
    /// Prize credited, when the recipient won.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prize: Option<u64>,
    /// Recipient's stake-currency balance after settlement.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_balance: Option<u64>,
    /// Signed rank-point change (ranked only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rank_delta: Option<i64>,
    /// Rank tier name after settlement (ranked only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_rank: Option<String>,
}

/// Session phase names as exposed to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseName {
    /// Pre-round countdown.
    Countdown,
    /// Round in progress.
    Playing,
    /// Round result on display.
    RoundResult,
    /// Match over, rematch negotiation possible.
    GameOver,
}

/// Full state pushed to a player who rejoined inside the grace window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchSnapshot {
    /// Current round number.
    pub round: u32,
    /// Current phase.
    pub phase: PhaseName,
    /// Recipient's score.
    pub your_score: u8,
    /// Opponent's score.
    pub opponent_score: u8,
    /// Remaining round-timer seconds, when a round is running.
    pub timer_remaining: Option<u8>,
    /// Match mode.
    pub mode: Mode,
    /// Entry stake.
    pub stake: u64,
    /// The opponent.
    pub opponent: OpponentRef,
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
