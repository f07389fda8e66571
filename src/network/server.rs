//! WebSocket Game Server
//!
//! Accept loop and per-connection tasks. Each connection gets a reader
//! that feeds the router and a writer that drains the connection's
//! outbound queue; the hub is the only thing holding the queue's sender.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::game::rules::GameRules;
use crate::network::hub::{ConnectionId, Hub, Outbound};
use crate::network::protocol::{Envelope, ServerMessage};
use crate::network::router::MessageRouter;
use crate::network::session::SessionManager;

/// Port used when neither `PORT` nor `BIND_ADDR` says otherwise.
pub const DEFAULT_PORT: u16 = 8000;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Outbound queue capacity per connection.
    pub outbound_queue: usize,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            max_connections: 1000,
            outbound_queue: 256,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable did not parse.
    #[error("Invalid value for {var}: {value:?}")]
    Invalid {
        /// Variable name.
        var: &'static str,
        /// Raw value.
        value: String,
    },
}

impl ServerConfig {
    /// Defaults overridden by `BIND_ADDR`, `PORT`, `MAX_CONNECTIONS` and
    /// `OUTBOUND_QUEUE`. `PORT` wins over the port in `BIND_ADDR`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(value) = get("BIND_ADDR") {
            config.bind_addr = parse_var("BIND_ADDR", value)?;
        }
        if let Some(value) = get("PORT") {
            config.bind_addr.set_port(parse_var("PORT", value)?);
        }
        if let Some(value) = get("MAX_CONNECTIONS") {
            config.max_connections = parse_var("MAX_CONNECTIONS", value)?;
        }
        if let Some(value) = get("OUTBOUND_QUEUE") {
            let capacity: usize = parse_var("OUTBOUND_QUEUE", value.clone())?;
            if capacity == 0 {
                return Err(ConfigError::Invalid {
                    var: "OUTBOUND_QUEUE",
                    value,
                });
            }
            config.outbound_queue = capacity;
        }

        Ok(config)
    }
}

fn parse_var<T: FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid { var, value })
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Connection limit reached.
    #[error("Connection limit reached")]
    ConnectionLimitReached,
}

/// The game server.
pub struct GameServer {
    /// Server configuration.
    config: ServerConfig,
    /// Session store.
    sessions: Arc<SessionManager>,
    /// Connection registry and fanout.
    hub: Arc<Hub>,
    /// Action dispatch.
    router: Arc<MessageRouter>,
    /// Connection tasks alive, handshakes included.
    live_connections: Arc<AtomicUsize>,
    /// Shutdown signal. Latched, so a late subscriber still sees it.
    shutdown_tx: watch::Sender<bool>,
}

impl GameServer {
    /// Create a new game server with default table rules.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_rules(config, GameRules::default())
    }

    /// Create a new game server with custom table rules.
    pub fn with_rules(config: ServerConfig, rules: GameRules) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let sessions = Arc::new(SessionManager::with_rules(rules));
        let hub = Arc::new(Hub::new(Arc::clone(&sessions), config.outbound_queue));
        let router = Arc::new(MessageRouter::new(Arc::clone(&sessions), Arc::clone(&hub)));

        Self {
            config,
            sessions,
            hub,
            router,
            live_connections: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        }
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> Result<TcpListener, GameServerError> {
        Ok(TcpListener::bind(&self.config.bind_addr).await?)
    }

    /// Bind and serve until shutdown.
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve an already bound listener until shutdown.
    #[instrument(skip(self, listener))]
    pub async fn serve(&self, listener: TcpListener) -> Result<(), GameServerError> {
        let local_addr = listener.local_addr()?;
        info!(
            "Card table server v{} listening on {}",
            self.config.version, local_addr
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        while !*shutdown_rx.borrow_and_update() {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if let Err(e) = self.check_capacity() {
                                warn!("Rejecting {}: {}", addr, e);
                                continue;
                            }

                            info!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!("Shutdown signal received");
        self.hub
            .broadcast_all(&ServerMessage::Shutdown {
                reason: "Server shutting down".to_string(),
            })
            .await;
        self.hub.close_all().await;

        Ok(())
    }

    fn check_capacity(&self) -> Result<(), GameServerError> {
        if self.live_connections.load(Ordering::Acquire) >= self.config.max_connections {
            return Err(GameServerError::ConnectionLimitReached);
        }
        Ok(())
    }

    /// Handle a new WebSocket connection.
    fn handle_connection<S>(&self, stream: S, addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let hub = Arc::clone(&self.hub);
        let router = Arc::clone(&self.router);
        let slot = LiveSlot::acquire(&self.live_connections);

        tokio::spawn(async move {
            let _slot = slot;
            if let Err(e) = Self::serve_connection(stream, addr, hub, router).await {
                error!("Connection {} failed: {}", addr, e);
            }
        });
    }

    async fn serve_connection<S>(
        stream: S,
        addr: SocketAddr,
        hub: Arc<Hub>,
        router: Arc<MessageRouter>,
    ) -> Result<(), GameServerError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let ws_stream = accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let (conn, outbound, mut evicted) = hub.register().await;
        debug!(%conn, %addr, "WebSocket established");

        // Writer: drains the outbound queue until it closes or asks to close
        let mut writer = tokio::spawn(async move {
            let mut outbound: mpsc::Receiver<Outbound> = outbound;
            while let Some(item) = outbound.recv().await {
                match item {
                    Outbound::Text(text) => {
                        if let Err(e) = ws_sender.send(Message::Text(text)).await {
                            debug!(%conn, "Write failed: {}", e);
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            let _ = ws_sender.close().await;
        });

        // Reader
        loop {
            tokio::select! {
                frame = ws_receiver.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            Self::route_frame(conn, Envelope::from_json(&text), &router).await;
                        }
                        Some(Ok(Message::Binary(data))) => {
                            Self::route_frame(conn, Envelope::from_slice(&data), &router).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!(%conn, "Client {} disconnected", addr);
                            break;
                        }
                        Some(Err(e)) => {
                            warn!(%conn, "WebSocket error for {}: {}", addr, e);
                            break;
                        }
                        // Ping/pong is answered by tungstenite
                        Some(Ok(_)) => {}
                    }
                }
                _ = &mut writer => {
                    debug!(%conn, "Outbound closed for {}", addr);
                    break;
                }
                _ = &mut evicted => {
                    warn!(%conn, "Dropping {}: fell behind on outbound messages", addr);
                    break;
                }
            }
        }

        hub.unregister(conn).await;
        writer.abort();

        info!("Client {} cleaned up", addr);
        Ok(())
    }

    async fn route_frame(
        conn: ConnectionId,
        decoded: Result<Envelope, serde_json::Error>,
        router: &MessageRouter,
    ) {
        match decoded {
            Ok(envelope) => router.dispatch(conn, envelope).await,
            Err(e) => debug!(%conn, "Invalid message: {}", e),
        }
    }

    /// Shutdown the server.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Get active connection count.
    pub async fn connection_count(&self) -> usize {
        self.hub.connection_count().await
    }

    /// Connection tasks still running, including ones mid-handshake.
    pub fn live_connection_count(&self) -> usize {
        self.live_connections.load(Ordering::Acquire)
    }

    /// Get active session count.
    pub async fn session_count(&self) -> usize {
        self.sessions.session_count().await
    }
}

/// Counts a connection task for as long as it is held.
struct LiveSlot(Arc<AtomicUsize>);

impl LiveSlot {
    fn acquire(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(counter))
    }
}

impl Drop for LiveSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use serde_json::json;
    use tokio::net::TcpStream;
    use tokio::time::{sleep, timeout};
    use tokio_tungstenite::{client_async, connect_async};

    use crate::game::state::GameId;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: BTreeMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 8000);
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.outbound_queue, 256);
    }

    #[test]
    fn test_config_from_vars() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("BIND_ADDR", "127.0.0.1:9000"),
            ("PORT", "9100"),
            ("MAX_CONNECTIONS", "12"),
            ("OUTBOUND_QUEUE", "8"),
        ]))
        .unwrap();

        assert_eq!(config.bind_addr, "127.0.0.1:9100".parse().unwrap());
        assert_eq!(config.max_connections, 12);
        assert_eq!(config.outbound_queue, 8);
    }

    #[test]
    fn test_config_empty_vars_ignored() {
        let config = ServerConfig::from_lookup(lookup(&[("PORT", "")])).unwrap();
        assert_eq!(config.bind_addr.port(), DEFAULT_PORT);
    }

    #[test]
    fn test_config_rejects_garbage() {
        let err = ServerConfig::from_lookup(lookup(&[("PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "PORT", .. }));

        let err = ServerConfig::from_lookup(lookup(&[("OUTBOUND_QUEUE", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "OUTBOUND_QUEUE", .. }));
    }

    #[tokio::test]
    async fn test_server_creation() {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let server = GameServer::new(config);

        assert_eq!(server.connection_count().await, 0);
        assert_eq!(server.session_count().await, 0);
        assert!(server.check_capacity().is_ok());
    }

    #[tokio::test]
    async fn test_server_shutdown() {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let server = Arc::new(GameServer::new(config));
        let listener = server.bind().await.unwrap();

        // Signalled before serving starts; the latch still stops the loop
        server.shutdown();
        let serving = Arc::clone(&server);
        let handle = tokio::spawn(async move { serving.serve(listener).await });

        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_zero_capacity_rejects() {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            max_connections: 0,
            ..Default::default()
        };
        let server = GameServer::new(config);

        assert!(matches!(
            server.check_capacity(),
            Err(GameServerError::ConnectionLimitReached)
        ));
    }

    #[tokio::test]
    async fn test_capacity_counts_pending_handshakes() {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            max_connections: 1,
            ..Default::default()
        };
        let server = Arc::new(GameServer::new(config));
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serving = Arc::clone(&server);
        tokio::spawn(async move { serving.serve(listener).await });

        // Connected but never completes the WebSocket handshake
        let _pending = TcpStream::connect(addr).await.unwrap();
        timeout(Duration::from_secs(5), async {
            while server.live_connection_count() < 1 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(server.connection_count().await, 0);

        assert!(connect_async(format!("ws://{}", addr)).await.is_err());
        assert_eq!(server.live_connection_count(), 1);

        server.shutdown();
    }

    #[tokio::test]
    async fn test_stalled_seated_connection_leaves_table() {
        let config = ServerConfig {
            outbound_queue: 1,
            ..Default::default()
        };
        let server = GameServer::new(config);
        let table = GameId::from("table");

        // Alice's socket only buffers a few bytes and she never reads it
        let (client_io, server_io) = tokio::io::duplex(64);
        tokio::spawn(GameServer::serve_connection(
            server_io,
            "127.0.0.1:9".parse().unwrap(),
            Arc::clone(&server.hub),
            Arc::clone(&server.router),
        ));
        let (mut alice, _) = client_async("ws://localhost/", client_io).await.unwrap();
        let join = json!({"type": "join_game", "gameId": "table", "data": {"playerName": "Alice"}});
        alice.send(Message::Text(join.to_string())).await.unwrap();

        timeout(Duration::from_secs(5), async {
            while server.sessions.get_session(&table).await.is_err() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let (bob, mut rx_bob, _) = server.hub.register().await;
        let join = json!({"type": "join_game", "gameId": "table", "data": {"playerName": "Bob"}});
        server
            .router
            .dispatch(bob, Envelope::from_json(&join.to_string()).unwrap())
            .await;
        let game = server.sessions.get_session(&table).await.unwrap();
        assert_eq!(game.players().len(), 2);
        assert_eq!(game.current_player_id(), Some(&game.players()[0].id));
        let bob_id = game.players()[1].id.clone();
        while rx_bob.try_recv().is_ok() {}

        // Overflow Alice's queue while her writer is stuck on the socket
        for _ in 0..3 {
            server
                .hub
                .broadcast_to_session_except(
                    &table,
                    bob,
                    &ServerMessage::Shutdown {
                        reason: "filler".to_string(),
                    },
                )
                .await;
        }

        let game = timeout(Duration::from_secs(5), async {
            loop {
                let game = server.sessions.get_session(&table).await.unwrap();
                if game.players().len() == 1 {
                    return game;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("stalled player kept their seat");

        assert_eq!(game.players()[0].id, bob_id);
        assert_eq!(game.current_player_id(), Some(&bob_id));
        match rx_bob.recv().await {
            Some(Outbound::Text(text)) => assert!(text.contains("player_left")),
            other => panic!("expected player_left, got {:?}", other),
        }
        drop(alice);
    }
}
