//! Connection Registry and Broadcast Hub
//!
//! Tracks every live connection, which table it is subscribed to and
//! which player it speaks for. Fanout serializes a message once and pushes
//! it onto each target's bounded outbound queue without waiting: a target
//! whose queue is full or closed is dropped from the registry instead, and
//! its connection task is told to stop.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, error, info, warn};

use crate::game::state::{GameId, PlayerId};
use crate::network::protocol::ServerMessage;
use crate::network::session::SessionManager;

/// Connection identifier, unique for the life of the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Item on a connection's outbound queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Serialized message.
    Text(String),
    /// Send a close frame and stop writing.
    Close,
}

/// What a connection has joined.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Subscribed table.
    pub game_id: Option<GameId>,
    /// Player the connection speaks for.
    pub player_id: Option<PlayerId>,
}

/// Hub errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    /// The connection was closed or dropped for falling behind.
    #[error("connection {0} is gone")]
    ConnectionGone(ConnectionId),
}

struct ConnectedClient {
    identity: ClientIdentity,
    connected_at: Instant,
    sender: mpsc::Sender<Outbound>,
    evicted: oneshot::Sender<()>,
}

#[derive(Default)]
struct Registry {
    clients: BTreeMap<ConnectionId, ConnectedClient>,
    game_clients: BTreeMap<GameId, BTreeSet<ConnectionId>>,
    /// Seated identities of connections dropped by fanout, kept until the
    /// connection's own task unregisters so the departure still happens.
    orphans: BTreeMap<ConnectionId, (GameId, PlayerId)>,
}

impl Registry {
    fn detach(&mut self, game_id: &GameId, conn: ConnectionId) {
        if let Some(subscribers) = self.game_clients.get_mut(game_id) {
            subscribers.remove(&conn);
            if subscribers.is_empty() {
                self.game_clients.remove(game_id);
            }
        }
    }

    fn remove(&mut self, conn: ConnectionId) -> Option<ConnectedClient> {
        let client = self.clients.remove(&conn)?;
        if let Some(game_id) = &client.identity.game_id {
            self.detach(game_id, conn);
        }
        Some(client)
    }

    fn evict(&mut self, conn: ConnectionId) {
        let Some(client) = self.remove(conn) else {
            return;
        };
        let _ = client.evicted.send(());
        let ClientIdentity { game_id, player_id } = client.identity;
        if let Some(seat) = game_id.zip(player_id) {
            self.orphans.insert(conn, seat);
        }
    }

    fn session_targets(&self, game_id: &GameId, except: Option<ConnectionId>) -> Vec<ConnectionId> {
        self.game_clients
            .get(game_id)
            .map(|subscribers| {
                subscribers
                    .iter()
                    .copied()
                    .filter(|conn| Some(*conn) != except)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Connection registry and fanout.
pub struct Hub {
    sessions: Arc<SessionManager>,
    registry: RwLock<Registry>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl Hub {
    /// Create a hub whose connections get queues of `queue_capacity`.
    pub fn new(sessions: Arc<SessionManager>, queue_capacity: usize) -> Self {
        Self {
            sessions,
            registry: RwLock::new(Registry::default()),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
        }
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Add a connection.
    ///
    /// Returns its outbound queue and a signal that resolves once the hub
    /// has dropped the connection. The connection's task must stop and
    /// [`unregister`](Self::unregister) when the signal fires.
    pub async fn register(
        &self,
    ) -> (ConnectionId, mpsc::Receiver<Outbound>, oneshot::Receiver<()>) {
        let conn = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let (evicted, evicted_rx) = oneshot::channel();

        let mut registry = self.registry.write().await;
        registry.clients.insert(
            conn,
            ConnectedClient {
                identity: ClientIdentity::default(),
                connected_at: Instant::now(),
                sender,
                evicted,
            },
        );
        debug!(%conn, total = registry.clients.len(), "Connection registered");

        (conn, receiver, evicted_rx)
    }

    /// Remove a connection. A seated player is taken out of their table
    /// and the rest of the table is told.
    pub async fn unregister(&self, conn: ConnectionId) {
        let seat = {
            let mut registry = self.registry.write().await;
            match registry.remove(conn) {
                Some(client) => {
                    debug!(
                        %conn,
                        connected_for = ?client.connected_at.elapsed(),
                        "Connection unregistered"
                    );
                    let ClientIdentity { game_id, player_id } = client.identity;
                    game_id.zip(player_id)
                }
                None => registry.orphans.remove(&conn),
            }
        };

        if let Some((game_id, player_id)) = seat {
            self.handle_player_leave(&game_id, &player_id).await;
        }
    }

    /// Subscribe a connection to a table's broadcasts.
    pub async fn subscribe(&self, conn: ConnectionId, game_id: &GameId) -> Result<(), HubError> {
        let mut registry = self.registry.write().await;
        let previous = {
            let client = registry
                .clients
                .get_mut(&conn)
                .ok_or(HubError::ConnectionGone(conn))?;
            client.identity.game_id.replace(game_id.clone())
        };
        if let Some(previous) = previous.filter(|g| g != game_id) {
            registry.detach(&previous, conn);
        }
        registry
            .game_clients
            .entry(game_id.clone())
            .or_default()
            .insert(conn);
        Ok(())
    }

    /// Record the player a connection speaks for.
    pub async fn assign_player(&self, conn: ConnectionId, player_id: &PlayerId) -> Result<(), HubError> {
        let mut registry = self.registry.write().await;
        let client = registry
            .clients
            .get_mut(&conn)
            .ok_or(HubError::ConnectionGone(conn))?;
        client.identity.player_id = Some(player_id.clone());
        Ok(())
    }

    /// Clear a connection's table and player. Returns the seat it held.
    pub async fn unsubscribe(&self, conn: ConnectionId) -> Option<(GameId, PlayerId)> {
        let mut registry = self.registry.write().await;
        let identity = {
            let client = registry.clients.get_mut(&conn)?;
            std::mem::take(&mut client.identity)
        };
        if let Some(game_id) = &identity.game_id {
            registry.detach(game_id, conn);
        }
        identity.game_id.zip(identity.player_id)
    }

    /// What a connection has joined, or `None` if it is not registered.
    pub async fn identity(&self, conn: ConnectionId) -> Option<ClientIdentity> {
        let registry = self.registry.read().await;
        registry.clients.get(&conn).map(|c| c.identity.clone())
    }

    /// Take a player out of a table and tell whoever remains.
    pub async fn handle_player_leave(&self, game_id: &GameId, player_id: &PlayerId) {
        let mut txn = self.sessions.begin().await;
        match txn.leave_session(game_id, player_id) {
            Ok(Some(game)) => {
                self.broadcast_to_session(
                    game_id,
                    &ServerMessage::PlayerLeft {
                        player_id: player_id.clone(),
                    },
                )
                .await;
                self.broadcast_to_session(game_id, &ServerMessage::GameState { game })
                    .await;
            }
            Ok(None) => {}
            Err(err) => {
                warn!(%game_id, %player_id, error = %err, "Leave failed");
            }
        }
    }

    // =========================================================================
    // Fanout
    // =========================================================================

    /// Send to every connection. Returns how many queues accepted it.
    pub async fn broadcast_all(&self, message: &ServerMessage) -> usize {
        self.fanout(message, |registry| registry.clients.keys().copied().collect())
            .await
    }

    /// Send to every subscriber of a table.
    pub async fn broadcast_to_session(&self, game_id: &GameId, message: &ServerMessage) -> usize {
        self.fanout(message, |registry| registry.session_targets(game_id, None))
            .await
    }

    /// Send to every subscriber of a table but one.
    pub async fn broadcast_to_session_except(
        &self,
        game_id: &GameId,
        except: ConnectionId,
        message: &ServerMessage,
    ) -> usize {
        self.fanout(message, |registry| registry.session_targets(game_id, Some(except)))
            .await
    }

    /// Send to one connection. Returns whether its queue accepted it.
    pub async fn send_to(&self, conn: ConnectionId, message: &ServerMessage) -> bool {
        self.fanout(message, |_| vec![conn]).await == 1
    }

    /// Ask every connection to close.
    pub async fn close_all(&self) {
        let mut registry = self.registry.write().await;
        let stuck: Vec<_> = registry
            .clients
            .iter()
            .filter(|(_, client)| client.sender.try_send(Outbound::Close).is_err())
            .map(|(conn, _)| *conn)
            .collect();
        // Dropping the sender closes the queue, which also ends the writer
        for conn in stuck {
            registry.evict(conn);
        }
        info!(connections = registry.clients.len(), "Close requested for all connections");
    }

    async fn fanout<F>(&self, message: &ServerMessage, targets: F) -> usize
    where
        F: FnOnce(&Registry) -> Vec<ConnectionId>,
    {
        let text = match message.to_json() {
            Ok(text) => text,
            Err(err) => {
                error!(kind = message.kind(), error = %err, "Failed to serialize message");
                return 0;
            }
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let registry = self.registry.read().await;
            for conn in targets(&*registry) {
                let Some(client) = registry.clients.get(&conn) else {
                    continue;
                };
                match client.sender.try_send(Outbound::Text(text.clone())) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        warn!(%conn, kind = message.kind(), "Outbound queue full, dropping connection");
                        dead.push(conn);
                    }
                    Err(TrySendError::Closed(_)) => dead.push(conn),
                }
            }
        }

        if !dead.is_empty() {
            let mut registry = self.registry.write().await;
            for conn in dead {
                registry.evict(conn);
            }
        }

        delivered
    }

    // =========================================================================
    // Stats
    // =========================================================================

    /// Live connections.
    pub async fn connection_count(&self) -> usize {
        self.registry.read().await.clients.len()
    }

    /// Connections subscribed to a table.
    pub async fn subscriber_count(&self, game_id: &GameId) -> usize {
        let registry = self.registry.read().await;
        registry.game_clients.get(game_id).map_or(0, |s| s.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn hub() -> Hub {
        Hub::new(Arc::new(SessionManager::new()), 16)
    }

    fn next_json(rx: &mut mpsc::Receiver<Outbound>) -> Value {
        match rx.try_recv().expect("expected a queued message") {
            Outbound::Text(text) => serde_json::from_str(&text).unwrap(),
            Outbound::Close => panic!("unexpected close"),
        }
    }

    fn shutdown() -> ServerMessage {
        ServerMessage::Shutdown {
            reason: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_register_unregister() {
        let hub = hub();
        let (a, _rx_a, _) = hub.register().await;
        let (b, _rx_b, _) = hub.register().await;

        assert_ne!(a, b);
        assert_eq!(hub.connection_count().await, 2);
        assert_eq!(hub.identity(a).await, Some(ClientIdentity::default()));

        hub.unregister(a).await;
        assert_eq!(hub.connection_count().await, 1);
        assert!(hub.identity(a).await.is_none());

        // Second unregister is a no-op
        hub.unregister(a).await;
        assert_eq!(hub.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_broadcast_isolated_by_session() {
        let hub = hub();
        let g1 = GameId::from("g1");
        let g2 = GameId::from("g2");
        let (a, mut rx_a, _) = hub.register().await;
        let (b, mut rx_b, _) = hub.register().await;
        let (c, mut rx_c, _) = hub.register().await;
        hub.subscribe(a, &g1).await.unwrap();
        hub.subscribe(b, &g1).await.unwrap();
        hub.subscribe(c, &g2).await.unwrap();

        let sent = hub.broadcast_to_session(&g1, &shutdown()).await;

        assert_eq!(sent, 2);
        assert_eq!(next_json(&mut rx_a)["type"], "shutdown");
        assert_eq!(next_json(&mut rx_b)["type"], "shutdown");
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_except_and_send_to() {
        let hub = hub();
        let g = GameId::from("g");
        let (a, mut rx_a, _) = hub.register().await;
        let (b, mut rx_b, _) = hub.register().await;
        hub.subscribe(a, &g).await.unwrap();
        hub.subscribe(b, &g).await.unwrap();

        assert_eq!(hub.broadcast_to_session_except(&g, a, &shutdown()).await, 1);
        assert!(rx_a.try_recv().is_err());
        assert_eq!(next_json(&mut rx_b)["type"], "shutdown");

        assert!(hub.send_to(a, &shutdown()).await);
        assert_eq!(next_json(&mut rx_a)["data"]["reason"], "test");

        hub.unregister(b).await;
        assert!(!hub.send_to(b, &shutdown()).await);
    }

    #[tokio::test]
    async fn test_resubscribe_moves_connection() {
        let hub = hub();
        let (a, _rx, _) = hub.register().await;
        hub.subscribe(a, &GameId::from("old")).await.unwrap();
        hub.subscribe(a, &GameId::from("new")).await.unwrap();

        assert_eq!(hub.subscriber_count(&GameId::from("old")).await, 0);
        assert_eq!(hub.subscriber_count(&GameId::from("new")).await, 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops_connection() {
        let hub = Hub::new(Arc::new(SessionManager::new()), 1);
        let g = GameId::from("g");
        let (slow, mut rx_slow, mut evicted_slow) = hub.register().await;
        let (fast, mut rx_fast, mut evicted_fast) = hub.register().await;
        hub.subscribe(slow, &g).await.unwrap();
        hub.subscribe(fast, &g).await.unwrap();

        assert_eq!(hub.broadcast_to_session(&g, &shutdown()).await, 2);
        next_json(&mut rx_fast);
        assert_eq!(hub.broadcast_to_session(&g, &shutdown()).await, 1);

        assert_eq!(hub.connection_count().await, 1);
        assert_eq!(hub.subscriber_count(&g).await, 1);
        assert!(hub.identity(slow).await.is_none());
        assert_eq!(evicted_slow.try_recv(), Ok(()));
        assert!(evicted_fast.try_recv().is_err());

        // The slow queue keeps what it accepted, then reports closed
        assert_eq!(next_json(&mut rx_slow)["type"], "shutdown");
        assert!(rx_slow.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unregister_leaves_table() {
        let sessions = Arc::new(SessionManager::new());
        let hub = Hub::new(Arc::clone(&sessions), 16);
        let g = GameId::from("g");
        let (_, alice) = sessions.join_session(&g, "Alice").await.unwrap();
        let (_, bob) = sessions.join_session(&g, "Bob").await.unwrap();

        let (a, _rx_a, _) = hub.register().await;
        let (b, mut rx_b, _) = hub.register().await;
        hub.subscribe(a, &g).await.unwrap();
        hub.assign_player(a, &alice.id).await.unwrap();
        hub.subscribe(b, &g).await.unwrap();
        hub.assign_player(b, &bob.id).await.unwrap();

        hub.unregister(a).await;

        let left = next_json(&mut rx_b);
        assert_eq!(left["type"], "player_left");
        assert_eq!(left["data"]["playerId"], alice.id.as_str());
        let state = next_json(&mut rx_b);
        assert_eq!(state["type"], "game_state");
        assert_eq!(state["data"]["game"]["gamePhase"], "waiting");

        let game = sessions.get_session(&g).await.unwrap();
        assert_eq!(game.players().len(), 1);
        assert_eq!(game.current_player_id(), Some(&bob.id));
    }

    #[tokio::test]
    async fn test_dropped_connection_still_leaves_on_unregister() {
        let sessions = Arc::new(SessionManager::new());
        let hub = Hub::new(Arc::clone(&sessions), 1);
        let g = GameId::from("g");
        let (_, alice) = sessions.join_session(&g, "Alice").await.unwrap();

        let (a, _rx_a, _) = hub.register().await;
        hub.subscribe(a, &g).await.unwrap();
        hub.assign_player(a, &alice.id).await.unwrap();

        hub.send_to(a, &shutdown()).await;
        assert!(!hub.send_to(a, &shutdown()).await);
        assert_eq!(hub.connection_count().await, 0);
        assert_eq!(sessions.session_count().await, 1);

        hub.unregister(a).await;
        assert_eq!(sessions.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_returns_seat() {
        let hub = hub();
        let g = GameId::from("g");
        let player = PlayerId::from("p");
        let (a, _rx, _) = hub.register().await;

        assert!(hub.unsubscribe(a).await.is_none());

        hub.subscribe(a, &g).await.unwrap();
        hub.assign_player(a, &player).await.unwrap();

        assert_eq!(hub.unsubscribe(a).await, Some((g.clone(), player)));
        assert_eq!(hub.identity(a).await, Some(ClientIdentity::default()));
        assert_eq!(hub.subscriber_count(&g).await, 0);
    }

    #[tokio::test]
    async fn test_close_all() {
        let hub = hub();
        let (_, mut rx_a, _) = hub.register().await;
        let (_, mut rx_b, _) = hub.register().await;

        assert_eq!(hub.broadcast_all(&shutdown()).await, 2);
        hub.close_all().await;

        next_json(&mut rx_a);
        assert_eq!(rx_a.try_recv().unwrap(), Outbound::Close);
        next_json(&mut rx_b);
        assert_eq!(rx_b.try_recv().unwrap(), Outbound::Close);
    }

    #[tokio::test]
    async fn test_subscribe_unknown_connection() {
        let hub = hub();
        let (a, _rx, _) = hub.register().await;
        hub.unregister(a).await;

        assert_eq!(
            hub.subscribe(a, &GameId::from("g")).await,
            Err(HubError::ConnectionGone(a))
        );
    }
}
