//! Match Session State Machine
//!
//! Owns one paired duel: countdown, round loop, timers, disconnect and
//! reconnect handling, rematch negotiation. All transitions are synchronous
//! and driven by explicit `Instant`s; side effects (message delivery,
//! economy settlement, bot decisions) are returned as [`Directive`]s for
//! the orchestrator's per-session driver task to execute. That keeps every
//! mutation of a session behind a single coordination point and makes the
//! state machine testable without a runtime.

use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::game::resolve::{resolve, Move, RoundOutcome};
use crate::game::types::{ArenaKey, Currency, Mode, PlayerId};
use crate::network::protocol::{
    MatchSnapshot, OpponentRef, PhaseName, RoundResultInfo, RoundWinner, ServerMessage,
};
use crate::store::StatsDelta;

/// The other slot of a two-slot session.
fn other(slot: usize) -> usize {
    1 - slot
}

/// Session timing and rule configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Countdown start value; ticks once per second down to 0.
    pub countdown_from: u8,
    /// Bounded round timer.
    pub round_time: Duration,
    /// How long a round result stays on display before the next round.
    pub result_display: Duration,
    /// Score that ends the match.
    pub score_to_win: u8,
    /// Consecutive mutually-absent rounds that abort the match.
    pub inactivity_abort_rounds: u8,
    /// Grace window for a disconnected player to resume.
    pub reconnect_grace: Duration,
    /// How long a finished session lingers for rematch negotiation.
    pub game_over_linger: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            countdown_from: crate::COUNTDOWN_FROM,
            round_time: crate::ROUND_TIME,
            result_display: crate::RESULT_DISPLAY,
            score_to_win: crate::SCORE_TO_WIN,
            inactivity_abort_rounds: crate::INACTIVITY_ABORT_ROUNDS,
            reconnect_grace: crate::RECONNECT_GRACE,
            game_over_linger: crate::GAME_OVER_LINGER,
        }
    }
}

/// One participant joining a session.
pub struct Participant {
    /// Verified identity (or synthetic bot identity).
    pub id: PlayerId,
    /// Display image shown to the opponent.
    pub image_ref: Option<String>,
    /// Outbound channel; None for bots.
    pub sender: Option<mpsc::Sender<ServerMessage>>,
}

/// A player slot within a session.
pub struct PlayerSlot {
    /// Identity bound to this slot.
    pub id: PlayerId,
    /// Display image reference.
    pub image_ref: Option<String>,
    /// Outbound channel; rebound on reconnect, None for bots.
    pub sender: Option<mpsc::Sender<ServerMessage>>,
    /// Rounds won this match.
    pub score: u8,
    /// Whether the connection is live. Bots count as connected.
    pub connected: bool,
    choice: Option<Move>,
    forfeit_assigned: bool,
    grace_deadline: Option<Instant>,
    wants_rematch: bool,
    move_counts: [u64; 3],
    opening_counts: [u64; 3],
}

impl PlayerSlot {
    fn new(p: Participant) -> Self {
        Self {
            id: p.id,
            image_ref: p.image_ref,
            sender: p.sender,
            score: 0,
            connected: true,
            choice: None,
            forfeit_assigned: false,
            grace_deadline: None,
            wants_rematch: false,
            move_counts: [0; 3],
            opening_counts: [0; 3],
        }
    }

    fn opponent_ref(&self) -> OpponentRef {
        OpponentRef {
            id: self.id.as_str().to_string(),
            image_ref: self.image_ref.clone(),
        }
    }

    fn reset_for_rematch(&mut self) {
        self.score = 0;
        self.choice = None;
        self.forfeit_assigned = false;
        self.wants_rematch = false;
        self.move_counts = [0; 3];
        self.opening_counts = [0; 3];
    }
}

/// Bot bookkeeping when one slot is synthetic.
struct BotSeat {
    slot: usize,
    /// The human's move from the previous round; never the live round's.
    last_human_move: Option<Move>,
}

/// Internal phase, deadline-driven.
enum Phase {
    Countdown { remaining: u8, next_tick_at: Instant },
    Playing { deadline: Instant, next_timer_at: Instant, timer_left: u8 },
    RoundResult { resume_at: Instant },
    GameOver { discard_at: Instant },
    Closed,
}

/// How the match ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    /// One side reached the winning score, or won by forfeit.
    Winner {
        /// Winning slot index.
        slot: usize,
        /// True when decided by disconnect forfeit.
        forfeit: bool,
    },
    /// Inactivity abort: both stakes refunded, no winner.
    Aborted,
}

/// Economy action the driver must perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Pay the winner 2 x stake, apply rank/stat/history writes.
    Payout {
        /// Winning slot index.
        winner: usize,
        /// Decided by disconnect forfeit.
        forfeit: bool,
    },
    /// Inactivity abort: refund both stakes in full.
    RefundBoth,
    /// Rematch accepted: re-escrow both stakes.
    RematchEscrow,
}

/// Side effect requested by a transition.
pub enum Directive {
    /// Deliver to one slot (skipped when disconnected or a bot).
    Send {
        /// Target slot index.
        slot: usize,
        /// Message to deliver.
        message: ServerMessage,
    },
    /// Deliver to both connected slots.
    Broadcast(ServerMessage),
    /// A round is open and the bot seat needs a move.
    RequestBotMove {
        /// Human's move from the previous round, if known.
        last_human_move: Option<Move>,
    },
    /// A decisive bot round resolved; feed arena telemetry.
    BotRoundResolved {
        /// Whether the bot won the round.
        bot_won: bool,
    },
    /// Perform an economy settlement step.
    Settle(Settlement),
    /// Session is finished; unbind players and drop it.
    Discard,
}

/// One live duel between two slots.
pub struct DuelSession {
    /// Unique match identifier.
    pub id: Uuid,
    /// Match mode.
    pub mode: Mode,
    /// Entry stake escrowed by both sides.
    pub stake: u64,
    /// Current round, starting at 1.
    pub round: u32,
    config: SessionConfig,
    slots: [PlayerSlot; 2],
    phase: Phase,
    inactivity_ties: u8,
    outcome: Option<MatchOutcome>,
    bot: Option<BotSeat>,
}

impl DuelSession {
    /// Create a session in countdown. The first tick at or after `now`
    /// broadcasts the opening countdown value.
    pub fn new(
        id: Uuid,
        mode: Mode,
        stake: u64,
        a: Participant,
        b: Participant,
        config: SessionConfig,
        now: Instant,
    ) -> Self {
        let bot = if b.id.is_bot() {
            Some(BotSeat { slot: 1, last_human_move: None })
        } else if a.id.is_bot() {
            Some(BotSeat { slot: 0, last_human_move: None })
        } else {
            None
        };

        Self {
            id,
            mode,
            stake,
            round: 1,
            phase: Phase::Countdown {
                remaining: config.countdown_from,
                next_tick_at: now,
            },
            config,
            slots: [PlayerSlot::new(a), PlayerSlot::new(b)],
            inactivity_ties: 0,
            outcome: None,
            bot,
        }
    }

    /// The currency staked in this session.
    pub fn currency(&self) -> Currency {
        self.mode.currency()
    }

    /// The arena bucket this session belongs to.
    pub fn arena(&self) -> ArenaKey {
        ArenaKey { mode: self.mode, stake: self.stake }
    }

    /// Slot index for an identity.
    pub fn slot_of(&self, id: &PlayerId) -> Option<usize> {
        self.slots.iter().position(|s| &s.id == id)
    }

    /// Both slots, winner-settlement bookkeeping for the driver.
    pub fn slots(&self) -> &[PlayerSlot; 2] {
        &self.slots
    }

    /// Current scores.
    pub fn scores(&self) -> [u8; 2] {
        [self.slots[0].score, self.slots[1].score]
    }

    /// How the match ended, once it has.
    pub fn outcome(&self) -> Option<MatchOutcome> {
        self.outcome
    }

    /// Whether the session has been discarded.
    pub fn is_closed(&self) -> bool {
        matches!(self.phase, Phase::Closed)
    }

    /// Client-visible phase name.
    pub fn phase_name(&self) -> PhaseName {
        match self.phase {
            Phase::Countdown { .. } => PhaseName::Countdown,
            Phase::Playing { .. } => PhaseName::Playing,
            Phase::RoundResult { .. } => PhaseName::RoundResult,
            Phase::GameOver { .. } | Phase::Closed => PhaseName::GameOver,
        }
    }

    /// Statistics delta for one slot at settlement time.
    pub fn stats_delta(&self, slot: usize, won: bool) -> StatsDelta {
        StatsDelta {
            moves: self.slots[slot].move_counts,
            opening_moves: self.slots[slot].opening_counts,
            matches: 1,
            wins: u64::from(won),
        }
    }

    // =========================================================================
    // TICK
    // =========================================================================

    /// Advance deadline-driven transitions up to `now`.
    pub fn tick(&mut self, now: Instant) -> Vec<Directive> {
        let mut out = Vec::new();

        if let Some(directives) = self.check_grace_expiry(now) {
            return directives;
        }

        loop {
            match &mut self.phase {
                Phase::Countdown { remaining, next_tick_at } => {
                    if now < *next_tick_at {
                        break;
                    }
                    let n = *remaining;
                    out.push(Directive::Broadcast(ServerMessage::Countdown { n }));
                    if n == 0 {
                        out.extend(self.open_round(now));
                    } else {
                        *remaining = n - 1;
                        *next_tick_at += Duration::from_secs(1);
                    }
                }
                Phase::Playing { deadline, next_timer_at, timer_left } => {
                    if now >= *deadline {
                        let directives = self.resolve_timeout(now);
                        out.extend(directives);
                        continue;
                    }
                    if *timer_left > 0 && now >= *next_timer_at {
                        *timer_left -= 1;
                        *next_timer_at += Duration::from_secs(1);
                        let remaining = *timer_left;
                        out.push(Directive::Broadcast(ServerMessage::Timer { remaining }));
                        continue;
                    }
                    break;
                }
                Phase::RoundResult { resume_at } => {
                    if now < *resume_at {
                        break;
                    }
                    out.extend(self.after_round_result(now));
                }
                Phase::GameOver { discard_at } => {
                    if now >= *discard_at {
                        self.phase = Phase::Closed;
                        out.push(Directive::Discard);
                    }
                    break;
                }
                Phase::Closed => break,
            }
        }

        out
    }

    /// Grace expiry ends the match in favour of whoever is still here.
    ///
    /// Once an outcome exists the stakes have already been settled; a
    /// grace deadline still pending from a mid-match disconnect must not
    /// settle the match a second time during the game-over linger.
    fn check_grace_expiry(&mut self, now: Instant) -> Option<Vec<Directive>> {
        if self.outcome.is_some() || matches!(self.phase, Phase::Closed) {
            return None;
        }
        let expired = (0..2).find(|&i| {
            !self.slots[i].connected
                && self.slots[i].grace_deadline.map(|d| now >= d).unwrap_or(false)
        })?;

        let survivor = other(expired);
        if !self.slots[survivor].connected {
            // Nobody left to win; hand the stakes back and fold.
            self.outcome = Some(MatchOutcome::Aborted);
            self.phase = Phase::Closed;
            return Some(vec![
                Directive::Settle(Settlement::RefundBoth),
                Directive::Discard,
            ]);
        }

        self.outcome = Some(MatchOutcome::Winner { slot: survivor, forfeit: true });
        self.phase = Phase::Closed;
        Some(vec![
            Directive::Settle(Settlement::Payout { winner: survivor, forfeit: true }),
            Directive::Discard,
        ])
    }

    /// Start the next round (or the first, out of countdown).
    fn open_round(&mut self, now: Instant) -> Vec<Directive> {
        for slot in &mut self.slots {
            slot.choice = None;
            slot.forfeit_assigned = false;
        }
        self.phase = Phase::Playing {
            deadline: now + self.config.round_time,
            next_timer_at: now + Duration::from_secs(1),
            timer_left: self.config.round_time.as_secs() as u8,
        };

        let mut out = vec![Directive::Broadcast(ServerMessage::RoundStart { round: self.round })];
        if let Some(bot) = &self.bot {
            out.push(Directive::RequestBotMove { last_human_move: bot.last_human_move });
        }
        out
    }

    // =========================================================================
    // MOVES
    // =========================================================================

    /// Submit a move for the current round.
    ///
    /// Ignored for players who are not in this session, have already moved,
    /// are disconnected, or when no round is open. Duplicate submissions are
    /// rejected silently.
    pub fn submit_move(&mut self, who: &PlayerId, mv: Move, now: Instant) -> Vec<Directive> {
        if !matches!(self.phase, Phase::Playing { .. }) {
            return Vec::new();
        }
        let Some(slot) = self.slot_of(who) else {
            return Vec::new();
        };
        if !self.slots[slot].connected || self.slots[slot].choice.is_some() {
            return Vec::new();
        }

        self.slots[slot].choice = Some(mv);

        if self.slots[0].choice.is_some() && self.slots[1].choice.is_some() {
            let a = self.slots[0].choice;
            let b = self.slots[1].choice;
            self.resolve_round(a, b, now)
        } else {
            Vec::new()
        }
    }

    /// Round timer expired; apply the timeout policy.
    fn resolve_timeout(&mut self, now: Instant) -> Vec<Directive> {
        let a = self.slots[0].choice;
        let b = self.slots[1].choice;

        match (a, b) {
            (None, None) => {
                self.inactivity_ties += 1;
                if self.inactivity_ties >= self.config.inactivity_abort_rounds {
                    return self.abort_for_inactivity();
                }
                // Implicit tie: nothing is recorded, the round repeats.
                self.resolve_round(None, None, now)
            }
            (Some(mv), None) => {
                // Non-mover forfeits the round with the losing move.
                self.slots[1].choice = Some(mv.beats());
                self.slots[1].forfeit_assigned = true;
                self.resolve_round(Some(mv), Some(mv.beats()), now)
            }
            (None, Some(mv)) => {
                self.slots[0].choice = Some(mv.beats());
                self.slots[0].forfeit_assigned = true;
                self.resolve_round(Some(mv.beats()), Some(mv), now)
            }
            (Some(a), Some(b)) => self.resolve_round(Some(a), Some(b), now),
        }
    }

    /// Resolve the round from the present (possibly assigned) moves and
    /// emit personalized results.
    ///
    /// `None` moves mean a mutual-timeout implicit tie; assigned forfeit
    /// moves arrive as `Some` but are not recorded in the stat accumulator.
    fn resolve_round(
        &mut self,
        a: Option<Move>,
        b: Option<Move>,
        now: Instant,
    ) -> Vec<Directive> {
        let mut out = Vec::new();

        let outcome = match (a, b) {
            (Some(a), Some(b)) => resolve(a, b),
            _ => RoundOutcome::Tie,
        };

        self.record_moves(a, b);

        if a.is_some() || b.is_some() {
            self.inactivity_ties = 0;
        }

        let winner_slot = match outcome {
            RoundOutcome::Tie => None,
            RoundOutcome::AWins => Some(0),
            RoundOutcome::BWins => Some(1),
        };
        if let Some(w) = winner_slot {
            self.slots[w].score += 1;
        }

        // Bot bookkeeping: remember the human's move for the next round and
        // report decisive rounds to arena telemetry.
        if let Some(bot) = &mut self.bot {
            let human = other(bot.slot);
            let human_move = if human == 0 { a } else { b };
            if let Some(mv) = human_move {
                if !self.slots[human].forfeit_assigned {
                    bot.last_human_move = Some(mv);
                }
            }
            if let Some(w) = winner_slot {
                out.push(Directive::BotRoundResolved { bot_won: w == bot.slot });
            }
        }

        for slot in 0..2 {
            let (own, theirs) = if slot == 0 { (a, b) } else { (b, a) };
            let winner = match winner_slot {
                None => RoundWinner::Tie,
                Some(w) if w == slot => RoundWinner::You,
                Some(_) => RoundWinner::Opponent,
            };
            out.push(Directive::Send {
                slot,
                message: ServerMessage::RoundResult(RoundResultInfo {
                    round: self.round,
                    winner,
                    your_move: own,
                    opponent_move: theirs,
                    your_score: self.slots[slot].score,
                    opponent_score: self.slots[other(slot)].score,
                }),
            });
        }

        self.phase = Phase::RoundResult { resume_at: now + self.config.result_display };
        out
    }

    /// Accumulate per-move stats. Assigned forfeit moves are excluded,
    /// only what a player actually submitted counts.
    fn record_moves(&mut self, a: Option<Move>, b: Option<Move>) {
        for (slot, mv) in [(0usize, a), (1usize, b)] {
            let Some(mv) = mv else { continue };
            if self.slots[slot].forfeit_assigned {
                continue;
            }
            self.slots[slot].move_counts[mv.index()] += 1;
            if self.round == 1 {
                self.slots[slot].opening_counts[mv.index()] += 1;
            }
        }
    }

    /// Display delay elapsed: next round or game over.
    fn after_round_result(&mut self, now: Instant) -> Vec<Directive> {
        let scores = self.scores();
        if scores[0] >= self.config.score_to_win || scores[1] >= self.config.score_to_win {
            let winner = if scores[0] >= self.config.score_to_win { 0 } else { 1 };
            self.outcome = Some(MatchOutcome::Winner { slot: winner, forfeit: false });
            self.phase = Phase::GameOver { discard_at: now + self.config.game_over_linger };
            return vec![Directive::Settle(Settlement::Payout { winner, forfeit: false })];
        }

        self.round += 1;
        self.open_round(now)
    }

    fn abort_for_inactivity(&mut self) -> Vec<Directive> {
        self.outcome = Some(MatchOutcome::Aborted);
        self.phase = Phase::Closed;
        vec![
            Directive::Settle(Settlement::RefundBoth),
            Directive::Discard,
        ]
    }

    // =========================================================================
    // DISCONNECT / RECONNECT
    // =========================================================================

    /// A slot's connection dropped.
    ///
    /// Mid-match this opens the grace window; during game over (rematch
    /// negotiation) it discards the session without re-escrow. The
    /// inactivity-tie counter is preserved across disconnects.
    pub fn mark_disconnected(&mut self, who: &PlayerId, now: Instant) -> Vec<Directive> {
        let Some(slot) = self.slot_of(who) else {
            return Vec::new();
        };
        if self.is_closed() || !self.slots[slot].connected {
            return Vec::new();
        }

        self.slots[slot].connected = false;
        self.slots[slot].sender = None;

        if matches!(self.phase, Phase::GameOver { .. }) {
            self.phase = Phase::Closed;
            return vec![
                Directive::Send { slot: other(slot), message: ServerMessage::OpponentLeft },
                Directive::Discard,
            ];
        }

        self.slots[slot].grace_deadline = Some(now + self.config.reconnect_grace);
        vec![Directive::Send {
            slot: other(slot),
            message: ServerMessage::OpponentDisconnected {
                timeout_ms: self.config.reconnect_grace.as_millis() as u64,
            },
        }]
    }

    /// Rebind a returning player inside the grace window.
    ///
    /// Returns directives on success; None when this identity has no
    /// resumable slot here (unknown, still connected, or grace expired).
    pub fn reconnect(
        &mut self,
        who: &PlayerId,
        sender: mpsc::Sender<ServerMessage>,
        now: Instant,
    ) -> Option<Vec<Directive>> {
        let slot = self.slot_of(who)?;
        if self.is_closed() || self.slots[slot].connected {
            return None;
        }
        let deadline = self.slots[slot].grace_deadline?;
        if now >= deadline {
            return None;
        }

        self.slots[slot].connected = true;
        self.slots[slot].sender = Some(sender);
        self.slots[slot].grace_deadline = None;

        let snapshot = self.snapshot_for(slot, now);
        Some(vec![
            Directive::Send { slot, message: ServerMessage::ReconnectSuccess(snapshot) },
            Directive::Send { slot: other(slot), message: ServerMessage::OpponentReconnected },
        ])
    }

    /// Full state snapshot from one slot's point of view.
    pub fn snapshot_for(&self, slot: usize, now: Instant) -> MatchSnapshot {
        let timer_remaining = match &self.phase {
            Phase::Playing { deadline, .. } => {
                Some(deadline.saturating_duration_since(now).as_secs() as u8)
            }
            _ => None,
        };
        MatchSnapshot {
            round: self.round,
            phase: self.phase_name(),
            your_score: self.slots[slot].score,
            opponent_score: self.slots[other(slot)].score,
            timer_remaining,
            mode: self.mode,
            stake: self.stake,
            opponent: self.slots[other(slot)].opponent_ref(),
        }
    }

    // =========================================================================
    // REMATCH
    // =========================================================================

    /// One side asks for a rematch. Valid only at game over with both
    /// sides still connected.
    pub fn request_rematch(&mut self, who: &PlayerId) -> Vec<Directive> {
        if !matches!(self.phase, Phase::GameOver { .. }) {
            return Vec::new();
        }
        let Some(slot) = self.slot_of(who) else {
            return Vec::new();
        };
        if self.slots[slot].wants_rematch || !self.slots[other(slot)].connected {
            return Vec::new();
        }

        self.slots[slot].wants_rematch = true;
        if self.slots[other(slot)].wants_rematch {
            // Both sides asked: treat as accepted.
            return vec![Directive::Settle(Settlement::RematchEscrow)];
        }
        vec![Directive::Send { slot: other(slot), message: ServerMessage::RematchRequested }]
    }

    /// Answer a pending rematch request.
    pub fn respond_rematch(&mut self, who: &PlayerId, accept: bool) -> Vec<Directive> {
        if !matches!(self.phase, Phase::GameOver { .. }) {
            return Vec::new();
        }
        let Some(slot) = self.slot_of(who) else {
            return Vec::new();
        };
        let requester = other(slot);
        if !self.slots[requester].wants_rematch {
            return Vec::new();
        }

        if accept {
            vec![Directive::Settle(Settlement::RematchEscrow)]
        } else {
            self.phase = Phase::Closed;
            vec![
                Directive::Send { slot: requester, message: ServerMessage::RematchDeclined },
                Directive::Discard,
            ]
        }
    }

    /// Rematch escrow succeeded: reset and re-enter countdown.
    pub fn restart(&mut self, now: Instant) -> Vec<Directive> {
        for slot in &mut self.slots {
            slot.reset_for_rematch();
        }
        if let Some(bot) = &mut self.bot {
            bot.last_human_move = None;
        }
        self.round = 1;
        self.inactivity_ties = 0;
        self.outcome = None;
        self.phase = Phase::Countdown {
            remaining: self.config.countdown_from,
            next_tick_at: now,
        };
        vec![Directive::Broadcast(ServerMessage::RematchAccepted)]
    }

    /// Rematch escrow failed (or another unrecoverable settlement error):
    /// close without further settlement.
    pub fn close(&mut self) {
        self.phase = Phase::Closed;
    }
}
