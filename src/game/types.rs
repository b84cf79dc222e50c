//! Shared Game Types
//!
//! Identities, modes and currencies referenced across matchmaking,
//! sessions and the economy adapter.

use std::fmt;
use serde::{Serialize, Deserialize};

/// Prefix marking synthetic (bot) identities.
const BOT_PREFIX: &str = "bot:";

/// Verified player identity.
///
/// Issued by the upstream auth layer; this server treats it as opaque.
/// Implements Ord for deterministic BTreeMap ordering.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PlayerId(String);

impl PlayerId {
    /// Wrap a verified identity string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a fresh synthetic identity for a bot opponent.
    pub fn bot() -> Self {
        Self(format!("{}{}", BOT_PREFIX, uuid::Uuid::new_v4()))
    }

    /// Whether this identity is a synthetic bot.
    pub fn is_bot(&self) -> bool {
        self.0.starts_with(BOT_PREFIX)
    }

    /// The raw identity string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Match mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Casual play staked in coins.
    Casual,
    /// Ranked play staked in gems, affecting rank points.
    Ranked,
}

impl Mode {
    /// The currency wagered in this mode.
    pub fn currency(self) -> Currency {
        match self {
            Mode::Casual => Currency::Coins,
            Mode::Ranked => Currency::Gems,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Casual => f.write_str("casual"),
            Mode::Ranked => f.write_str("ranked"),
        }
    }
}

/// Stake currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Currency {
    /// Casual currency.
    Coins,
    /// Ranked currency.
    Gems,
}

/// A (mode, stake) bucket.
///
/// Used both for matchmaking grouping and for bot win-rate targeting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ArenaKey {
    /// Match mode.
    pub mode: Mode,
    /// Entry amount wagered by both players.
    pub stake: u64,
}

impl fmt::Display for ArenaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.mode, self.stake)
    }
}
