//! Match Resolution Engine
//!
//! Pure round resolution for the fixed cyclic dominance
//! rock > scissors > paper > rock, plus rank-tier lookup and the
//! stake/prize/rank-point rules. No I/O, no state.

use std::fmt;
use serde::{Serialize, Deserialize};

/// Rank points gained by the winner of a ranked match, per tier multiplier.
pub const RANKED_WIN_POINTS: u64 = 20;

/// Rank points lost by the loser of a ranked match, per tier multiplier.
pub const RANKED_LOSS_POINTS: u64 = 15;

/// Base gem stake for ranked play; actual stake is base x tier multiplier.
pub const RANKED_BASE_STAKE: u64 = 100;

/// A player's move in one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Move {
    /// Rock crushes scissors.
    Rock,
    /// Paper covers rock.
    Paper,
    /// Scissors cut paper.
    Scissors,
}

/// All moves, for uniform random selection.
pub const ALL_MOVES: [Move; 3] = [Move::Rock, Move::Paper, Move::Scissors];

impl Move {
    /// The move this one defeats.
    pub fn beats(self) -> Move {
        match self {
            Move::Rock => Move::Scissors,
            Move::Paper => Move::Rock,
            Move::Scissors => Move::Paper,
        }
    }

    /// The move this one loses to.
    pub fn loses_to(self) -> Move {
        match self {
            Move::Rock => Move::Paper,
            Move::Paper => Move::Scissors,
            Move::Scissors => Move::Rock,
        }
    }

    /// Index into move-count stat arrays.
    pub fn index(self) -> usize {
        match self {
            Move::Rock => 0,
            Move::Paper => 1,
            Move::Scissors => 2,
        }
    }
}

impl fmt::Display for Move {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Move::Rock => f.write_str("rock"),
            Move::Paper => f.write_str("paper"),
            Move::Scissors => f.write_str("scissors"),
        }
    }
}

/// Outcome of resolving two simultaneous moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    /// Both played the same move.
    Tie,
    /// First move wins.
    AWins,
    /// Second move wins.
    BWins,
}

/// Resolve two simultaneous moves.
pub fn resolve(a: Move, b: Move) -> RoundOutcome {
    if a == b {
        RoundOutcome::Tie
    } else if a.beats() == b {
        RoundOutcome::AWins
    } else {
        RoundOutcome::BWins
    }
}

// =============================================================================
// RANK TIERS
// =============================================================================

/// Named band of cumulative rank points.
///
/// Determines the ranked stake multiplier and matchmaking grouping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankTier {
    /// 0 - 999 points.
    #[default]
    Bronze,
    /// 1000 - 2499 points.
    Silver,
    /// 2500 - 4999 points.
    Gold,
    /// 5000+ points.
    Diamond,
}

/// Ordered rank bands: (tier, min points, max points inclusive).
/// Contiguous from 0 so every point total maps to exactly one tier.
const RANK_BANDS: [(RankTier, u64, u64); 4] = [
    (RankTier::Bronze, 0, 999),
    (RankTier::Silver, 1000, 2499),
    (RankTier::Gold, 2500, 4999),
    (RankTier::Diamond, 5000, u64::MAX),
];

impl RankTier {
    /// Look up the tier containing `points`.
    ///
    /// Scans the ordered bands; falls back to the lowest band, which cannot
    /// happen while the bands stay contiguous and start at 0.
    pub fn from_points(points: u64) -> RankTier {
        RANK_BANDS
            .iter()
            .find(|(_, min, max)| (*min..=*max).contains(&points))
            .map(|(tier, _, _)| *tier)
            .unwrap_or(RankTier::Bronze)
    }

    /// Ranked stake multiplier for this tier.
    pub fn multiplier(self) -> u64 {
        match self {
            RankTier::Bronze => 1,
            RankTier::Silver => 2,
            RankTier::Gold => 5,
            RankTier::Diamond => 10,
        }
    }

    /// Gem stake for a ranked match at this tier.
    pub fn stake(self) -> u64 {
        RANKED_BASE_STAKE * self.multiplier()
    }

    /// Reverse lookup from a ranked stake to its tier.
    pub fn for_stake(stake: u64) -> Option<RankTier> {
        RANK_BANDS
            .iter()
            .map(|(tier, _, _)| *tier)
            .find(|tier| tier.stake() == stake)
    }

    /// Tier name as persisted on profile rows.
    pub fn name(self) -> &'static str {
        match self {
            RankTier::Bronze => "Bronze",
            RankTier::Silver => "Silver",
            RankTier::Gold => "Gold",
            RankTier::Diamond => "Diamond",
        }
    }
}

impl fmt::Display for RankTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Prize credited to the winner: both stakes.
pub fn prize_for_stake(stake: u64) -> u64 {
    stake * 2
}

/// Rank points gained by the winner at the given tier.
pub fn rank_points_won(tier: RankTier) -> u64 {
    RANKED_WIN_POINTS * tier.multiplier()
}

/// Rank points lost by the loser at the given tier.
///
/// Callers floor the resulting balance at 0.
pub fn rank_points_lost(tier: RankTier) -> u64 {
    RANKED_LOSS_POINTS * tier.multiplier()
}
