//! WebSocket Duel Server
//!
//! Async WebSocket server for staked duels. Accepts connections, binds
//! identities, runs matchmaking and escrow, and drives one task per live
//! session that executes the state machine's directives: message delivery,
//! bot decisions and economy settlement.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex, Notify};
use tokio::time::{interval, sleep};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::core::DeterministicRng;
use crate::economy::{Economy, EconomyError};
use crate::game::bot::{self, ArenaTable, BotArenaConfig};
use crate::game::resolve::{prize_for_stake, Move, RankTier};
use crate::game::session::{
    Directive, DuelSession, Participant, SessionConfig, Settlement,
};
use crate::game::types::{ArenaKey, Currency, Mode, PlayerId};
use crate::network::matchmaking::{EnqueueOutcome, QueueEntry, QueueManager};
use crate::network::protocol::{
    ClientMessage, GameOverInfo, MatchFoundInfo, MatchWinner, OpponentRef, ServerMessage,
};
use crate::network::registry::{ConnectionHandle, Registry, SessionHandle};
use crate::store::{MatchRecord, ProfileStore, StatsRecorder, StatsWriter};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Queue wait before a bot opponent is backfilled.
    pub bot_backfill_after: Duration,
    /// Per-session timing and rules.
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().unwrap(),
            max_connections: 1000,
            bot_backfill_after: crate::BOT_BACKFILL_AFTER,
            session: SessionConfig::default(),
        }
    }
}

/// Duel server errors.
#[derive(Debug, thiserror::Error)]
pub enum DuelServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// One side of a match being assembled: a queued human or a bot.
struct Contender {
    id: PlayerId,
    image_ref: Option<String>,
    sender: Option<mpsc::Sender<ServerMessage>>,
}

impl Contender {
    fn human(entry: QueueEntry) -> Self {
        Self {
            id: entry.id,
            image_ref: entry.image_ref,
            sender: Some(entry.sender),
        }
    }

    fn bot() -> Self {
        Self { id: PlayerId::bot(), image_ref: None, sender: None }
    }

    fn opponent_ref(&self) -> OpponentRef {
        OpponentRef {
            id: self.id.as_str().to_string(),
            image_ref: self.image_ref.clone(),
        }
    }
}

/// Shared server state, cloned into every task.
struct Shared {
    config: ServerConfig,
    registry: Registry,
    queues: QueueManager,
    economy: Economy,
    store: Arc<dyn ProfileStore>,
    stats: StatsRecorder,
    arenas: ArenaTable,
    rng: Mutex<DeterministicRng>,
    shutdown_tx: broadcast::Sender<()>,
    connections: std::sync::atomic::AtomicUsize,
}

/// The duel server.
pub struct DuelServer {
    shared: Arc<Shared>,
}

impl DuelServer {
    /// Create a server over a profile store.
    pub fn new(config: ServerConfig, store: Arc<dyn ProfileStore>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shared: Arc::new(Shared {
                config,
                registry: Registry::new(),
                queues: QueueManager::new(),
                economy: Economy::new(store.clone()),
                stats: StatsRecorder::new(store.clone()),
                store,
                arenas: ArenaTable::new(),
                rng: Mutex::new(DeterministicRng::from_entropy()),
                shutdown_tx,
                connections: std::sync::atomic::AtomicUsize::new(0),
            }),
        }
    }

    /// Run the accept loop until shutdown.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), DuelServerError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        info!("Duel server listening on {}", self.shared.config.bind_addr);

        let backfill = tokio::spawn(run_backfill_loop(self.shared.clone()));

        let mut shutdown_rx = self.shared.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let open = self
                                .shared
                                .connections
                                .load(std::sync::atomic::Ordering::Relaxed);
                            if open >= self.shared.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }
                            debug!("New connection from {}", addr);
                            tokio::spawn(handle_connection(self.shared.clone(), stream, addr));
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        backfill.abort();
        refund_live_sessions(&self.shared).await;
        Ok(())
    }

    /// Trigger shutdown: connections are notified, unfinished matches are
    /// refunded in full.
    pub fn shutdown(&self) {
        let _ = self.shared.shutdown_tx.send(());
    }

    /// Live session count.
    pub async fn session_count(&self) -> usize {
        self.shared.registry.session_count().await
    }

    /// Open connection count.
    pub fn connection_count(&self) -> usize {
        self.shared
            .connections
            .load(std::sync::atomic::Ordering::Relaxed)
    }
}

/// Refund every session that has not settled yet. Shutdown only.
async fn refund_live_sessions(shared: &Arc<Shared>) {
    for handle in shared.registry.sessions().await {
        let refund = {
            let mut session = handle.session.lock().await;
            let unsettled = !session.is_closed() && session.outcome().is_none();
            if unsettled {
                session.close();
            }
            unsettled
        };
        if refund {
            let (players, currency, stake) = {
                let session = handle.session.lock().await;
                let slots = session.slots();
                (
                    [slots[0].id.clone(), slots[1].id.clone()],
                    session.currency(),
                    session.stake,
                )
            };
            with_retry(&handle, "shutdown refund", || {
                shared
                    .economy
                    .refund_both(&players[0], &players[1], currency, stake)
            })
            .await;
        }
        shared.registry.remove_session(handle.id).await;
    }
}

// =============================================================================
// CONNECTION HANDLING
// =============================================================================

async fn handle_connection(shared: Arc<Shared>, stream: TcpStream, addr: SocketAddr) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };
    shared
        .connections
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(64);

    // Writer task: serialize and push outbound messages.
    let sender_task = tokio::spawn(async move {
        while let Some(msg) = msg_rx.recv().await {
            let text = match msg.to_json() {
                Ok(t) => t,
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let handle = ConnectionHandle {
        sender: msg_tx.clone(),
        kill: Arc::new(Notify::new()),
    };
    let mut identity: Option<PlayerId> = None;
    let mut shutdown_rx = shared.shutdown_tx.subscribe();

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let client_msg = match ClientMessage::from_json(&text) {
                            Ok(m) => m,
                            Err(e) => {
                                debug!("Invalid message from {}: {}", addr, e);
                                let _ = msg_tx.send(ServerMessage::MatchError {
                                    message: "Invalid message format".to_string(),
                                }).await;
                                continue;
                            }
                        };
                        handle_client_message(
                            &shared,
                            client_msg,
                            &handle,
                            &mut identity,
                        ).await;
                    }
                    // tungstenite queues the pong itself.
                    Some(Ok(Message::Ping(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Client {} disconnected", addr);
                        break;
                    }
                    Some(Err(e)) => {
                        debug!("WebSocket error for {}: {}", addr, e);
                        break;
                    }
                    _ => {}
                }
            }
            _ = handle.kill.notified() => {
                debug!("Connection {} superseded by a newer one", addr);
                break;
            }
            _ = shutdown_rx.recv() => {
                let _ = msg_tx.send(ServerMessage::Shutdown {
                    reason: "Server shutting down".to_string(),
                }).await;
                break;
            }
        }
    }

    sender_task.abort();

    if let Some(id) = identity {
        shared.queues.remove(&id).await;
        if shared.registry.unbind_connection(&id, &handle).await {
            // Only the still-bound connection opens the grace window; a
            // superseded socket must not disconnect its replacement.
            if let Some(session) = shared.registry.session_of(&id).await {
                let directives = {
                    let mut s = session.session.lock().await;
                    s.mark_disconnected(&id, Instant::now())
                };
                let _ = execute_directives(&shared, &session, directives).await;
                session.wake.notify_one();
            }
        }
    }

    shared
        .connections
        .fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
    debug!("Client {} cleaned up", addr);
}

async fn handle_client_message(
    shared: &Arc<Shared>,
    msg: ClientMessage,
    handle: &ConnectionHandle,
    identity: &mut Option<PlayerId>,
) {
    let msg = match msg {
        ClientMessage::Identify { user_id } => {
            handle_identify(shared, user_id, handle, identity).await;
            return;
        }
        other => other,
    };

    let Some(id) = identity.clone() else {
        let _ = handle
            .sender
            .send(ServerMessage::MatchError {
                message: "Identify first".to_string(),
            })
            .await;
        return;
    };

    match msg {
        ClientMessage::FindMatch { mode, stake, image_ref } => {
            handle_find_match(shared, &id, mode, stake, image_ref, handle).await;
        }
        ClientMessage::LeaveQueue => {
            if shared.queues.remove(&id).await {
                debug!(player = %id, "left queue");
            }
        }
        ClientMessage::MakeChoice { choice } => {
            forward_to_session(shared, &id, |s, now| s.submit_move(&id, choice, now)).await;
        }
        ClientMessage::RequestRematch => {
            forward_to_session(shared, &id, |s, _| s.request_rematch(&id)).await;
        }
        ClientMessage::RematchResponse { accept } => {
            forward_to_session(shared, &id, |s, _| s.respond_rematch(&id, accept)).await;
        }
        ClientMessage::CheckReconnection => {
            handle_reconnection(shared, &id, handle).await;
        }
        ClientMessage::Identify { .. } => unreachable!(),
    }
}

async fn handle_identify(
    shared: &Arc<Shared>,
    user_id: String,
    handle: &ConnectionHandle,
    identity: &mut Option<PlayerId>,
) {
    if identity.is_some() {
        debug!("Duplicate identify ignored");
        return;
    }
    let id = PlayerId::new(user_id);

    match shared.store.fetch_profile(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            let _ = handle
                .sender
                .send(ServerMessage::MatchError {
                    message: "Unknown player".to_string(),
                })
                .await;
            return;
        }
        Err(e) => {
            error!(player = %id, "profile lookup failed: {}", e);
            let _ = handle
                .sender
                .send(ServerMessage::MatchError {
                    message: "Profile unavailable".to_string(),
                })
                .await;
            return;
        }
    }

    // Newest connection wins; the superseded socket is force-closed.
    if let Some(old) = shared
        .registry
        .bind_connection(id.clone(), handle.clone())
        .await
    {
        old.kill.notify_waiters();
    }
    info!(player = %id, "identified");
    *identity = Some(id);
}

/// Apply a session operation and execute its directives.
async fn forward_to_session<F>(shared: &Arc<Shared>, id: &PlayerId, op: F)
where
    F: FnOnce(&mut DuelSession, Instant) -> Vec<Directive>,
{
    let Some(session) = shared.registry.session_of(id).await else {
        return;
    };
    let directives = {
        let mut s = session.session.lock().await;
        op(&mut s, Instant::now())
    };
    let _ = execute_directives(shared, &session, directives).await;
    session.wake.notify_one();
}

async fn handle_reconnection(shared: &Arc<Shared>, id: &PlayerId, handle: &ConnectionHandle) {
    let Some(session) = shared.registry.session_of(id).await else {
        let _ = handle
            .sender
            .send(ServerMessage::MatchError {
                message: "No match to resume".to_string(),
            })
            .await;
        return;
    };

    let directives = {
        let mut s = session.session.lock().await;
        s.reconnect(id, handle.sender.clone(), Instant::now())
    };
    match directives {
        Some(directives) => {
            info!(player = %id, match_id = %session.id, "reconnected");
            let _ = execute_directives(shared, &session, directives).await;
            session.wake.notify_one();
        }
        None => {
            let _ = handle
                .sender
                .send(ServerMessage::MatchError {
                    message: "No match to resume".to_string(),
                })
                .await;
        }
    }
}

// =============================================================================
// MATCHMAKING
// =============================================================================

async fn handle_find_match(
    shared: &Arc<Shared>,
    id: &PlayerId,
    mode: Mode,
    stake: Option<u64>,
    image_ref: Option<String>,
    handle: &ConnectionHandle,
) {
    if shared.registry.in_session(id).await {
        let _ = handle
            .sender
            .send(ServerMessage::MatchError {
                message: "Already in a match".to_string(),
            })
            .await;
        return;
    }

    let arena = match mode {
        Mode::Casual => {
            let Some(stake) = stake.filter(|s| crate::CASUAL_STAKES.contains(s)) else {
                let _ = handle
                    .sender
                    .send(ServerMessage::MatchError {
                        message: "Invalid stake".to_string(),
                    })
                    .await;
                return;
            };
            ArenaKey { mode, stake }
        }
        Mode::Ranked => {
            // Stake and opponent pool follow the player's tier.
            let tier = match shared.store.fetch_profile(id).await {
                Ok(Some(profile)) => profile.tier(),
                Ok(None) | Err(_) => {
                    let _ = handle
                        .sender
                        .send(ServerMessage::MatchError {
                            message: "Profile unavailable".to_string(),
                        })
                        .await;
                    return;
                }
            };
            ArenaKey { mode, stake: tier.stake() }
        }
    };

    let entry = QueueEntry {
        id: id.clone(),
        image_ref,
        sender: handle.sender.clone(),
        enqueued_at: Instant::now(),
    };
    match shared.queues.enqueue(arena, entry).await {
        EnqueueOutcome::PairedWith(opponent, joiner) => {
            start_match(
                shared,
                arena,
                Contender::human(opponent),
                Contender::human(joiner),
            )
            .await;
        }
        EnqueueOutcome::Queued => {
            let _ = handle.sender.send(ServerMessage::Waiting).await;
        }
        EnqueueOutcome::AlreadyQueued => {
            debug!(player = %id, arena = %arena, "duplicate find_match ignored");
        }
    }
}

/// Escrow both stakes and launch a session.
async fn start_match(shared: &Arc<Shared>, arena: ArenaKey, a: Contender, b: Contender) {
    let currency = arena.mode.currency();

    let notify = |sender: Option<mpsc::Sender<ServerMessage>>, msg: ServerMessage| async move {
        if let Some(sender) = sender {
            let _ = sender.send(msg).await;
        }
    };

    if let Err(cause) = shared
        .economy
        .escrow_pair(&a.id, &b.id, currency, arena.stake)
        .await
    {
        warn!(arena = %arena, "escrow failed: {}", cause);
        let notice = ServerMessage::MatchError {
            message: "Match could not start: stake escrow failed".to_string(),
        };
        notify(a.sender.clone(), notice.clone()).await;
        notify(b.sender.clone(), notice).await;
        return;
    }

    let match_id = Uuid::new_v4();
    let players = [a.id.clone(), b.id.clone()];
    let (a_sender, b_sender) = (a.sender.clone(), b.sender.clone());
    let (a_ref, b_ref) = (a.opponent_ref(), b.opponent_ref());

    let session = DuelSession::new(
        match_id,
        arena.mode,
        arena.stake,
        Participant { id: a.id, image_ref: a.image_ref, sender: a.sender },
        Participant { id: b.id, image_ref: b.image_ref, sender: b.sender },
        shared.config.session.clone(),
        Instant::now(),
    );
    let handle = SessionHandle::new(session);

    if !shared
        .registry
        .insert_session(handle.clone(), players.clone())
        .await
    {
        // A player slipped into another session between pairing and
        // registration; undo the escrow.
        warn!(match_id = %match_id, "session registration lost race, refunding");
        if let Err(e) = shared
            .economy
            .refund_both(&players[0], &players[1], currency, arena.stake)
            .await
        {
            error!(match_id = %match_id, "refund after lost registration failed: {}", e);
        }
        let notice = ServerMessage::MatchError {
            message: "Match could not start".to_string(),
        };
        notify(a_sender, notice.clone()).await;
        notify(b_sender, notice).await;
        return;
    }

    notify(
        a_sender,
        ServerMessage::MatchFound(MatchFoundInfo {
            opponent: b_ref,
            stake: arena.stake,
            mode: arena.mode,
        }),
    )
    .await;
    notify(
        b_sender,
        ServerMessage::MatchFound(MatchFoundInfo {
            opponent: a_ref,
            stake: arena.stake,
            mode: arena.mode,
        }),
    )
    .await;

    info!(match_id = %match_id, arena = %arena, a = %players[0], b = %players[1], "match started");
    tokio::spawn(run_session_driver(shared.clone(), handle));
}

/// Pair players who waited too long with a bot opponent.
async fn run_backfill_loop(shared: Arc<Shared>) {
    let mut ticker = interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;
        let stale = shared
            .queues
            .take_stale(Instant::now(), shared.config.bot_backfill_after)
            .await;

        for (arena, entry) in stale {
            ensure_arena_installed(&shared, arena).await;
            info!(arena = %arena, player = %entry.id, "backfilling bot opponent");
            start_match(&shared, arena, Contender::human(entry), Contender::bot()).await;
        }
    }
}

/// Seed live telemetry from the persisted arena row, once per arena.
async fn ensure_arena_installed(shared: &Arc<Shared>, arena: ArenaKey) {
    if shared.arenas.contains(&arena).await {
        return;
    }
    let config = match shared.store.arena_config(&arena).await {
        Ok(Some(config)) => config,
        Ok(None) => BotArenaConfig::default_for(arena),
        Err(e) => {
            warn!(arena = %arena, "arena config lookup failed, using default: {}", e);
            BotArenaConfig::default_for(arena)
        }
    };
    shared.arenas.install(config).await;
}

// =============================================================================
// SESSION DRIVER
// =============================================================================

/// Drive one session: periodic ticks plus wakeups after external events.
async fn run_session_driver(shared: Arc<Shared>, handle: Arc<SessionHandle>) {
    let mut ticker = interval(Duration::from_millis(100));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = handle.wake.notified() => {}
        }

        let directives = {
            let mut session = handle.session.lock().await;
            session.tick(Instant::now())
        };
        let discarded = execute_directives(&shared, &handle, directives).await;

        let closed = handle.session.lock().await.is_closed();
        if discarded || closed {
            shared.registry.remove_session(handle.id).await;
            debug!(match_id = %handle.id, "session driver finished");
            break;
        }
    }
}

/// Execute directives, including any produced transitively (a bot move can
/// resolve a round, a rematch escrow restarts the countdown).
///
/// Returns true when the session asked to be discarded.
async fn execute_directives(
    shared: &Arc<Shared>,
    handle: &Arc<SessionHandle>,
    directives: Vec<Directive>,
) -> bool {
    let mut queue: VecDeque<Directive> = directives.into();
    let mut discarded = false;

    while let Some(directive) = queue.pop_front() {
        match directive {
            Directive::Send { slot, message } => {
                let sender = {
                    let session = handle.session.lock().await;
                    session.slots()[slot].sender.clone()
                };
                if let Some(sender) = sender {
                    let _ = sender.send(message).await;
                }
            }
            Directive::Broadcast(message) => {
                let senders: Vec<_> = {
                    let session = handle.session.lock().await;
                    session
                        .slots()
                        .iter()
                        .filter_map(|s| s.sender.clone())
                        .collect()
                };
                for sender in senders {
                    let _ = sender.send(message.clone()).await;
                }
            }
            Directive::RequestBotMove { last_human_move } => {
                queue.extend(play_bot_move(shared, handle, last_human_move).await);
            }
            Directive::BotRoundResolved { bot_won } => {
                let arena = handle.session.lock().await.arena();
                shared.arenas.record_round(&arena, bot_won).await;
            }
            Directive::Settle(settlement) => {
                queue.extend(settle(shared, handle, settlement).await);
            }
            Directive::Discard => {
                discarded = true;
            }
        }
    }

    discarded
}

/// Decide and submit the bot's move for the round that just opened.
async fn play_bot_move(
    shared: &Arc<Shared>,
    handle: &Arc<SessionHandle>,
    last_human_move: Option<Move>,
) -> Vec<Directive> {
    let (arena, bot_id) = {
        let session = handle.session.lock().await;
        let bot_id = session
            .slots()
            .iter()
            .find(|s| s.id.is_bot())
            .map(|s| s.id.clone());
        (session.arena(), bot_id)
    };
    let Some(bot_id) = bot_id else {
        return Vec::new();
    };

    ensure_arena_installed(shared, arena).await;
    let view = shared.arenas.view(&arena).await;
    let choice = {
        let mut rng = shared.rng.lock().await;
        bot::decide(&mut rng, view, last_human_move)
    };

    let mut session = handle.session.lock().await;
    session.submit_move(&bot_id, choice, Instant::now())
}

// =============================================================================
// SETTLEMENT
// =============================================================================

/// Perform one economy settlement step.
///
/// Failed writes are retried once; a second failure is reported to the
/// players as a match error rather than silently dropped.
async fn settle(
    shared: &Arc<Shared>,
    handle: &Arc<SessionHandle>,
    settlement: Settlement,
) -> Vec<Directive> {
    match settlement {
        Settlement::Payout { winner, forfeit } => {
            settle_payout(shared, handle, winner, forfeit).await
        }
        Settlement::RefundBoth => settle_abort(shared, handle).await,
        Settlement::RematchEscrow => settle_rematch(shared, handle).await,
    }
}

async fn settle_payout(
    shared: &Arc<Shared>,
    handle: &Arc<SessionHandle>,
    winner: usize,
    forfeit: bool,
) -> Vec<Directive> {
    let (players, scores, mode, stake, deltas) = {
        let session = handle.session.lock().await;
        let slots = session.slots();
        (
            [slots[0].id.clone(), slots[1].id.clone()],
            session.scores(),
            session.mode,
            session.stake,
            [
                session.stats_delta(0, winner == 0),
                session.stats_delta(1, winner == 1),
            ],
        )
    };
    let currency = mode.currency();
    let loser = 1 - winner;
    let winner_id = &players[winner];
    let loser_id = &players[loser];

    let winner_balance = with_retry(handle, "prize payout", || {
        shared.economy.payout_winner(winner_id, currency, stake)
    })
    .await;

    let mut rank: Option<(crate::economy::RankAdjustment, crate::economy::RankAdjustment)> = None;
    if mode == Mode::Ranked {
        let tier = RankTier::for_stake(stake).unwrap_or_default();
        rank = Some(
            with_retry(handle, "rank adjustment", || {
                shared.economy.apply_rank_result(winner_id, loser_id, tier)
            })
            .await,
        );
    }

    for (id, won) in [(winner_id, true), (loser_id, false)] {
        if let Err(e) = shared.economy.note_match_played(id, won).await {
            warn!(player = %id, "match counter update failed: {}", e);
        }
    }

    for (slot, won) in [(winner, true), (loser, false)] {
        let id = &players[slot];
        if id.is_bot() {
            continue;
        }
        if let Err(e) = shared.stats.increment(id, deltas[slot].clone()).await {
            warn!(player = %id, "stats update failed: {}", e);
        }
    }

    let record = MatchRecord {
        match_id: handle.id,
        players: players.clone(),
        scores,
        mode,
        stake,
        winner: Some(players[winner].clone()),
        finished_at: chrono::Utc::now(),
    };
    if let Err(e) = shared.store.record_match(record).await {
        warn!(match_id = %handle.id, "match history write failed: {}", e);
    }

    info!(
        match_id = %handle.id,
        winner = %winner_id,
        forfeit,
        "match settled"
    );

    // Personalized game-over, built after settlement so balances and
    // ranks reflect it.
    let mut out = Vec::new();
    for slot in 0..2 {
        let id = &players[slot];
        if id.is_bot() {
            continue;
        }
        let won = slot == winner;
        let balance = if won {
            Some(winner_balance)
        } else {
            current_balance(shared, id, currency).await
        };
        let (rank_delta, new_rank) = match (&rank, won) {
            (Some((adj, _)), true) | (Some((_, adj)), false) => {
                (Some(adj.delta), Some(adj.tier.name().to_string()))
            }
            (None, _) => (None, None),
        };
        out.push(Directive::Send {
            slot,
            message: ServerMessage::GameOver(GameOverInfo {
                winner: if won { MatchWinner::You } else { MatchWinner::Opponent },
                forfeit,
                aborted: false,
                prize: won.then(|| prize_for_stake(stake)),
                new_balance: balance,
                rank_delta,
                new_rank,
            }),
        });
    }
    out
}

async fn settle_abort(shared: &Arc<Shared>, handle: &Arc<SessionHandle>) -> Vec<Directive> {
    let (players, mode, stake) = {
        let session = handle.session.lock().await;
        let slots = session.slots();
        (
            [slots[0].id.clone(), slots[1].id.clone()],
            session.mode,
            session.stake,
        )
    };
    let currency = mode.currency();

    with_retry(handle, "stake refund", || {
        shared
            .economy
            .refund_both(&players[0], &players[1], currency, stake)
    })
    .await;
    info!(match_id = %handle.id, "match aborted, stakes refunded");

    let mut out = Vec::new();
    for slot in 0..2 {
        if players[slot].is_bot() {
            continue;
        }
        let balance = current_balance(shared, &players[slot], currency).await;
        out.push(Directive::Send {
            slot,
            message: ServerMessage::GameOver(GameOverInfo {
                winner: MatchWinner::Nobody,
                forfeit: false,
                aborted: true,
                prize: None,
                new_balance: balance,
                rank_delta: None,
                new_rank: None,
            }),
        });
    }
    out
}

async fn settle_rematch(shared: &Arc<Shared>, handle: &Arc<SessionHandle>) -> Vec<Directive> {
    let (players, mode, stake) = {
        let session = handle.session.lock().await;
        let slots = session.slots();
        (
            [slots[0].id.clone(), slots[1].id.clone()],
            session.mode,
            session.stake,
        )
    };

    match shared
        .economy
        .escrow_pair(&players[0], &players[1], mode.currency(), stake)
        .await
    {
        Ok(()) => {
            info!(match_id = %handle.id, "rematch stakes escrowed");
            let mut session = handle.session.lock().await;
            session.restart(Instant::now())
        }
        Err(cause) => {
            warn!(match_id = %handle.id, "rematch escrow failed: {}", cause);
            let notice = ServerMessage::MatchError {
                message: "Rematch could not start: stake escrow failed".to_string(),
            };
            let mut session = handle.session.lock().await;
            session.close();
            vec![
                Directive::Broadcast(notice),
                Directive::Discard,
            ]
        }
    }
}

/// Run a balance-affecting settlement write, retrying with backoff until
/// it lands. The settlement step must not complete past a failed write;
/// stakes still in escrow would otherwise vanish.
async fn with_retry<T, F, Fut>(
    handle: &Arc<SessionHandle>,
    what: &str,
    mut attempt: F,
) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, EconomyError>>,
{
    let mut backoff = Duration::from_millis(100);
    let mut failures = 0u32;
    loop {
        match attempt().await {
            Ok(v) => return v,
            Err(cause) => {
                failures += 1;
                if failures % 5 == 0 {
                    error!(
                        match_id = %handle.id,
                        "{} still failing after {} attempts: {}", what, failures, cause
                    );
                } else {
                    warn!(match_id = %handle.id, "{} failed, retrying: {}", what, cause);
                }
                sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(5));
            }
        }
    }
}

async fn current_balance(
    shared: &Arc<Shared>,
    id: &PlayerId,
    currency: Currency,
) -> Option<u64> {
    match shared.store.fetch_profile(id).await {
        Ok(Some(profile)) => Some(profile.balance(currency)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use async_trait::async_trait;
    use crate::store::{MemoryStore, ProfileRow, StatsDelta, StatsRow, StoreError};

    fn server_with(store: MemoryStore) -> DuelServer {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        DuelServer::new(config, Arc::new(store))
    }

    fn profile(name: &str, coins: u64, gems: u64) -> ProfileRow {
        ProfileRow::new(PlayerId::new(name), coins, gems)
    }

    fn contender(name: &str) -> (Contender, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(32);
        (
            Contender {
                id: PlayerId::new(name),
                image_ref: None,
                sender: Some(tx),
            },
            rx,
        )
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = server_with(MemoryStore::new());
        assert_eq!(server.session_count().await, 0);
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_start_match_escrows_and_registers() {
        let store = MemoryStore::new()
            .with_profile(profile("a", 500, 0))
            .with_profile(profile("b", 500, 0));
        let server = server_with(store);
        let shared = server.shared.clone();

        let arena = ArenaKey { mode: Mode::Casual, stake: 100 };
        let (a, mut rx_a) = contender("a");
        let (b, _rx_b) = contender("b");
        start_match(&shared, arena, a, b).await;

        assert_eq!(shared.registry.session_count().await, 1);
        assert!(shared.registry.in_session(&PlayerId::new("a")).await);

        let escrowed = shared
            .store
            .fetch_profile(&PlayerId::new("a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(escrowed.coins, 400);

        match rx_a.recv().await.unwrap() {
            ServerMessage::MatchFound(info) => {
                assert_eq!(info.stake, 100);
                assert_eq!(info.opponent.id, "b");
            }
            other => panic!("expected match found, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_start_match_insufficient_funds_notifies_both() {
        let store = MemoryStore::new()
            .with_profile(profile("a", 500, 0))
            .with_profile(profile("b", 50, 0));
        let server = server_with(store);
        let shared = server.shared.clone();

        let arena = ArenaKey { mode: Mode::Casual, stake: 100 };
        let (a, mut rx_a) = contender("a");
        let (b, mut rx_b) = contender("b");
        start_match(&shared, arena, a, b).await;

        assert_eq!(shared.registry.session_count().await, 0);
        // Neither balance moved.
        let a_row = shared
            .store
            .fetch_profile(&PlayerId::new("a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(a_row.coins, 500);
        assert!(matches!(
            rx_a.recv().await.unwrap(),
            ServerMessage::MatchError { .. }
        ));
        assert!(matches!(
            rx_b.recv().await.unwrap(),
            ServerMessage::MatchError { .. }
        ));
    }

    #[tokio::test]
    async fn test_bot_match_escrows_only_the_human() {
        let store = MemoryStore::new().with_profile(profile("a", 500, 0));
        let server = server_with(store);
        let shared = server.shared.clone();

        let arena = ArenaKey { mode: Mode::Casual, stake: 100 };
        let (a, mut rx_a) = contender("a");
        start_match(&shared, arena, a, Contender::bot()).await;

        assert_eq!(shared.registry.session_count().await, 1);
        match rx_a.recv().await.unwrap() {
            ServerMessage::MatchFound(info) => {
                assert!(info.opponent.id.starts_with("bot:"));
            }
            other => panic!("expected match found, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_payout_settlement_pays_winner_and_records_match() {
        let store = MemoryStore::new()
            .with_profile(profile("a", 400, 0))
            .with_profile(profile("b", 400, 0));
        let server = server_with(store);
        let shared = server.shared.clone();

        // Stakes already escrowed; build the finished session directly.
        let (a, _rx_a) = contender("a");
        let (b, _rx_b) = contender("b");
        let session = DuelSession::new(
            Uuid::new_v4(),
            Mode::Casual,
            100,
            Participant { id: a.id, image_ref: None, sender: a.sender },
            Participant { id: b.id, image_ref: None, sender: b.sender },
            SessionConfig::default(),
            Instant::now(),
        );
        let handle = SessionHandle::new(session);

        let out = settle_payout(&shared, &handle, 0, false).await;

        let winner = shared
            .store
            .fetch_profile(&PlayerId::new("a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(winner.coins, 600);
        assert_eq!(winner.wins, 1);
        assert_eq!(winner.games, 1);

        let loser = shared
            .store
            .fetch_profile(&PlayerId::new("b"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loser.coins, 400);
        assert_eq!(loser.wins, 0);
        assert_eq!(loser.games, 1);

        let game_over: Vec<_> = out
            .iter()
            .filter_map(|d| match d {
                Directive::Send { message: ServerMessage::GameOver(info), .. } => Some(info),
                _ => None,
            })
            .collect();
        assert_eq!(game_over.len(), 2);
        assert_eq!(game_over[0].winner, MatchWinner::You);
        assert_eq!(game_over[0].prize, Some(200));
        assert_eq!(game_over[0].new_balance, Some(600));
        assert_eq!(game_over[1].winner, MatchWinner::Opponent);
        assert_eq!(game_over[1].prize, None);
    }

    /// Delegates to a memory store, failing the next N profile writes.
    struct FlakyStore {
        inner: MemoryStore,
        failing_puts: AtomicU32,
    }

    #[async_trait]
    impl ProfileStore for FlakyStore {
        async fn fetch_profile(&self, id: &PlayerId) -> Result<Option<ProfileRow>, StoreError> {
            self.inner.fetch_profile(id).await
        }

        async fn put_profile(&self, row: ProfileRow) -> Result<(), StoreError> {
            let remaining = self.failing_puts.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failing_puts.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::WriteFailed("storage offline".to_string()));
            }
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

        async fn increment_stats(
            &self,
            id: &PlayerId,
            delta: &StatsDelta,
        ) -> Result<(), StoreError> {
            self.inner.increment_stats(id, delta).await
        }

        async fn arena_config(
            &self,
            arena: &ArenaKey,
        ) -> Result<Option<BotArenaConfig>, StoreError> {
            self.inner.arena_config(arena).await
        }
    }

    #[tokio::test]
    async fn test_payout_blocks_until_prize_credit_lands() {
        let flaky = Arc::new(FlakyStore {
            inner: MemoryStore::new()
                .with_profile(profile("a", 400, 0))
                .with_profile(profile("b", 400, 0)),
            failing_puts: AtomicU32::new(2),
        });
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let server = DuelServer::new(config, flaky.clone());
        let shared = server.shared.clone();

        let (a, _rx_a) = contender("a");
        let (b, _rx_b) = contender("b");
        let session = DuelSession::new(
            Uuid::new_v4(),
            Mode::Casual,
            100,
            Participant { id: a.id, image_ref: None, sender: a.sender },
            Participant { id: b.id, image_ref: None, sender: b.sender },
            SessionConfig::default(),
            Instant::now(),
        );
        let handle = SessionHandle::new(session);

        let out = settle_payout(&shared, &handle, 0, false).await;

        // The transient write failures were retried through, not skipped.
        assert_eq!(flaky.failing_puts.load(Ordering::SeqCst), 0);
        let winner = shared
            .store
            .fetch_profile(&PlayerId::new("a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(winner.coins, 600);

        // Game over is only reported once the credit has landed.
        assert!(out.iter().any(|d| matches!(
            d,
            Directive::Send { message: ServerMessage::GameOver(_), .. }
        )));
    }

    #[tokio::test]
    async fn test_ranked_payout_applies_rank_points() {
        let mut a = profile("a", 0, 400);
        a.rank_points = 100;
        let mut b = profile("b", 0, 400);
        b.rank_points = 100;
        let store = MemoryStore::new().with_profile(a).with_profile(b);
        let server = server_with(store);
        let shared = server.shared.clone();

        let (ca, _rx_a) = contender("a");
        let (cb, _rx_b) = contender("b");
        let session = DuelSession::new(
            Uuid::new_v4(),
            Mode::Ranked,
            100,
            Participant { id: ca.id, image_ref: None, sender: ca.sender },
            Participant { id: cb.id, image_ref: None, sender: cb.sender },
            SessionConfig::default(),
            Instant::now(),
        );
        let handle = SessionHandle::new(session);

        let out = settle_payout(&shared, &handle, 0, false).await;

        let winner = shared
            .store
            .fetch_profile(&PlayerId::new("a"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(winner.rank_points, 120);
        let loser = shared
            .store
            .fetch_profile(&PlayerId::new("b"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loser.rank_points, 85);

        let winner_info = out
            .iter()
            .find_map(|d| match d {
                Directive::Send { slot: 0, message: ServerMessage::GameOver(info) } => Some(info),
                _ => None,
            })
            .unwrap();
        assert_eq!(winner_info.rank_delta, Some(20));
        assert_eq!(winner_info.new_rank.as_deref(), Some("Bronze"));
    }

    #[tokio::test]
    async fn test_abort_settlement_refunds_both() {
        let store = MemoryStore::new()
            .with_profile(profile("a", 400, 0))
            .with_profile(profile("b", 400, 0));
        let server = server_with(store);
        let shared = server.shared.clone();

        let (a, _rx_a) = contender("a");
        let (b, _rx_b) = contender("b");
        let session = DuelSession::new(
            Uuid::new_v4(),
            Mode::Casual,
            100,
            Participant { id: a.id, image_ref: None, sender: a.sender },
            Participant { id: b.id, image_ref: None, sender: b.sender },
            SessionConfig::default(),
            Instant::now(),
        );
        let handle = SessionHandle::new(session);

        let out = settle_abort(&shared, &handle).await;

        for name in ["a", "b"] {
            let row = shared
                .store
                .fetch_profile(&PlayerId::new(name))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(row.coins, 500);
            assert_eq!(row.games, 0);
        }
        let info = out
            .iter()
            .find_map(|d| match d {
                Directive::Send { message: ServerMessage::GameOver(info), .. } => Some(info),
                _ => None,
            })
            .unwrap();
        assert_eq!(info.winner, MatchWinner::Nobody);
        assert!(info.aborted);
    }

    #[tokio::test]
    async fn test_rematch_escrow_failure_closes_session() {
        let store = MemoryStore::new()
            .with_profile(profile("a", 50, 0))
            .with_profile(profile("b", 400, 0));
        let server = server_with(store);
        let shared = server.shared.clone();

        let (a, _rx_a) = contender("a");
        let (b, _rx_b) = contender("b");
        let session = DuelSession::new(
            Uuid::new_v4(),
            Mode::Casual,
            100,
            Participant { id: a.id, image_ref: None, sender: a.sender },
            Participant { id: b.id, image_ref: None, sender: b.sender },
            SessionConfig::default(),
            Instant::now(),
        );
        let handle = SessionHandle::new(session);

        let out = settle_rematch(&shared, &handle).await;
        assert!(handle.session.lock().await.is_closed());
        assert!(out.iter().any(|d| matches!(d, Directive::Discard)));
    }

    #[tokio::test]
    async fn test_shutdown_refunds_live_sessions() {
        let store = MemoryStore::new()
            .with_profile(profile("a", 400, 0))
            .with_profile(profile("b", 400, 0));
        let server = server_with(store);
        let shared = server.shared.clone();

        let (a, _rx_a) = contender("a");
        let (b, _rx_b) = contender("b");
        let session = DuelSession::new(
            Uuid::new_v4(),
            Mode::Casual,
            100,
            Participant { id: a.id, image_ref: None, sender: a.sender },
            Participant { id: b.id, image_ref: None, sender: b.sender },
            SessionConfig::default(),
            Instant::now(),
        );
        assert!(session.outcome().is_none());
        let handle = SessionHandle::new(session);
        shared
            .registry
            .insert_session(handle, [PlayerId::new("a"), PlayerId::new("b")])
            .await;

        refund_live_sessions(&shared).await;

        for name in ["a", "b"] {
            let row = shared
                .store
                .fetch_profile(&PlayerId::new(name))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(row.coins, 500);
        }
        assert_eq!(shared.registry.session_count().await, 0);
    }
}
