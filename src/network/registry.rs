//! Connection and Session Registry
//!
//! Shared maps from identity to live connection and from identity to the
//! session it occupies. A duplicate connection for an identity supersedes
//! the old one; a player occupies at most one session at a time.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use uuid::Uuid;

use crate::game::session::DuelSession;
use crate::game::types::PlayerId;
use crate::network::protocol::ServerMessage;

/// A live client connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    /// Outbound message channel, consumed by the socket writer task.
    pub sender: mpsc::Sender<ServerMessage>,
    /// Signalled to force-close the socket when superseded.
    pub kill: Arc<Notify>,
}

/// One session plus its driver's wakeup signal.
///
/// The session lock is the single coordination point for all mutation;
/// `wake` nudges the driver task after externally-applied transitions.
pub struct SessionHandle {
    /// Match identifier.
    pub id: Uuid,
    /// The state machine itself.
    pub session: Mutex<DuelSession>,
    /// Wakes the driver out of its tick sleep.
    pub wake: Notify,
}

impl SessionHandle {
    /// Wrap a session for registration.
    pub fn new(session: DuelSession) -> Arc<Self> {
        Arc::new(Self {
            id: session.id,
            session: Mutex::new(session),
            wake: Notify::new(),
        })
    }
}

struct Inner {
    connections: BTreeMap<PlayerId, ConnectionHandle>,
    sessions: BTreeMap<Uuid, Arc<SessionHandle>>,
    player_sessions: BTreeMap<PlayerId, Uuid>,
}

/// Shared registry of connections and sessions.
pub struct Registry {
    inner: RwLock<Inner>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                connections: BTreeMap::new(),
                sessions: BTreeMap::new(),
                player_sessions: BTreeMap::new(),
            }),
        }
    }

    /// Bind a connection to an identity.
    ///
    /// Returns the superseded handle, if any, so the caller can kill it.
    pub async fn bind_connection(
        &self,
        id: PlayerId,
        handle: ConnectionHandle,
    ) -> Option<ConnectionHandle> {
        let mut inner = self.inner.write().await;
        inner.connections.insert(id, handle)
    }

    /// Unbind a connection, but only if it is still the bound one.
    ///
    /// An old connection's cleanup must not evict the newer connection
    /// that superseded it; handles are compared by kill-signal identity.
    pub async fn unbind_connection(&self, id: &PlayerId, handle: &ConnectionHandle) -> bool {
        let mut inner = self.inner.write().await;
        match inner.connections.get(id) {
            Some(bound) if Arc::ptr_eq(&bound.kill, &handle.kill) => {
                inner.connections.remove(id);
                true
            }
            _ => false,
        }
    }

    /// The currently bound connection for an identity.
    pub async fn connection(&self, id: &PlayerId) -> Option<ConnectionHandle> {
        let inner = self.inner.read().await;
        inner.connections.get(id).cloned()
    }

    /// Register a session and claim both players.
    ///
    /// Fails when either player already occupies a session; bots are not
    /// tracked (a bot identity is unique to its session).
    pub async fn insert_session(
        &self,
        handle: Arc<SessionHandle>,
        players: [PlayerId; 2],
    ) -> bool {
        let mut inner = self.inner.write().await;
        if players
            .iter()
            .any(|p| !p.is_bot() && inner.player_sessions.contains_key(p))
        {
            return false;
        }
        for p in players {
            if !p.is_bot() {
                inner.player_sessions.insert(p, handle.id);
            }
        }
        inner.sessions.insert(handle.id, handle);
        true
    }

    /// The session a player currently occupies.
    pub async fn session_of(&self, id: &PlayerId) -> Option<Arc<SessionHandle>> {
        let inner = self.inner.read().await;
        let match_id = inner.player_sessions.get(id)?;
        inner.sessions.get(match_id).cloned()
    }

    /// Whether a player currently occupies a session.
    pub async fn in_session(&self, id: &PlayerId) -> bool {
        let inner = self.inner.read().await;
        inner.player_sessions.contains_key(id)
    }

    /// Drop a session and release its players.
    pub async fn remove_session(&self, match_id: Uuid) {
        let mut inner = self.inner.write().await;
        inner.sessions.remove(&match_id);
        inner.player_sessions.retain(|_, s| *s != match_id);
    }

    /// All live sessions, for shutdown fan-out.
    pub async fn sessions(&self) -> Vec<Arc<SessionHandle>> {
        let inner = self.inner.read().await;
        inner.sessions.values().cloned().collect()
    }

    /// Live session count.
    pub async fn session_count(&self) -> usize {
        let inner = self.inner.read().await;
        inner.sessions.len()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use crate::game::session::{Participant, SessionConfig};
    use crate::game::types::Mode;

    fn handle() -> ConnectionHandle {
        let (tx, _rx) = mpsc::channel(8);
        ConnectionHandle { sender: tx, kill: Arc::new(Notify::new()) }
    }

    fn participant(name: &str) -> Participant {
        let (tx, _rx) = mpsc::channel(8);
        Participant {
            id: PlayerId::new(name),
            image_ref: None,
            sender: Some(tx),
        }
    }

    fn session(a: &str, b: &str) -> Arc<SessionHandle> {
        SessionHandle::new(DuelSession::new(
            Uuid::new_v4(),
            Mode::Casual,
            100,
            participant(a),
            participant(b),
            SessionConfig::default(),
            Instant::now(),
        ))
    }

    #[tokio::test]
    async fn test_duplicate_connection_supersedes() {
        let registry = Registry::new();
        let id = PlayerId::new("a");

        assert!(registry.bind_connection(id.clone(), handle()).await.is_none());
        let old = registry.bind_connection(id.clone(), handle()).await;
        assert!(old.is_some());
    }

    #[tokio::test]
    async fn test_stale_unbind_leaves_newer_connection() {
        let registry = Registry::new();
        let id = PlayerId::new("a");

        let first = handle();
        registry.bind_connection(id.clone(), first.clone()).await;
        let second = handle();
        registry.bind_connection(id.clone(), second.clone()).await;

        assert!(!registry.unbind_connection(&id, &first).await);
        assert!(registry.connection(&id).await.is_some());
        assert!(registry.unbind_connection(&id, &second).await);
        assert!(registry.connection(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_single_session_occupancy() {
        let registry = Registry::new();

        let s1 = session("a", "b");
        assert!(
            registry
                .insert_session(s1.clone(), [PlayerId::new("a"), PlayerId::new("b")])
                .await
        );

        let s2 = session("a", "c");
        assert!(
            !registry
                .insert_session(s2, [PlayerId::new("a"), PlayerId::new("c")])
                .await
        );

        assert_eq!(
            registry.session_of(&PlayerId::new("a")).await.unwrap().id,
            s1.id
        );
    }

    #[tokio::test]
    async fn test_remove_session_releases_players() {
        let registry = Registry::new();

        let s = session("a", "b");
        registry
            .insert_session(s.clone(), [PlayerId::new("a"), PlayerId::new("b")])
            .await;
        registry.remove_session(s.id).await;

        assert!(!registry.in_session(&PlayerId::new("a")).await);
        assert_eq!(registry.session_count().await, 0);
    }
}
