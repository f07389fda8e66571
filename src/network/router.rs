//! Message Router
//!
//! Turns a decoded client action into a session store operation and the
//! broadcasts that follow it. The store transaction stays open until every
//! resulting message is queued, so all subscribers see one table's
//! messages in commit order. Failures go back to the sender only.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::game::card::Card;
use crate::game::state::{Game, GameId, GamePhase, PlayerId, Position};
use crate::network::hub::{ConnectionId, Hub, HubError};
use crate::network::protocol::{
    ClientMessage, Envelope, ErrorCode, GameSummary, ProtocolError, ServerMessage,
};
use crate::network::session::{SessionError, SessionManager};

/// Routing failures, reported to the sender as an `error` message.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    /// The action needs a seat at a table.
    #[error("not in a game")]
    NotInGame,

    /// The connection already speaks for a player.
    #[error("already in a game")]
    AlreadyInGame,

    /// Store or rule failure.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Bad payload.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The connection went away mid-request.
    #[error(transparent)]
    Hub(#[from] HubError),
}

impl RouteError {
    /// Error class reported to the client.
    pub fn code(&self) -> ErrorCode {
        match self {
            RouteError::NotInGame | RouteError::AlreadyInGame => ErrorCode::Conflict,
            RouteError::Session(err) => err.code(),
            RouteError::Protocol(err) => err.code(),
            RouteError::Hub(_) => ErrorCode::NotFound,
        }
    }
}

/// Dispatches client actions.
pub struct MessageRouter {
    sessions: Arc<SessionManager>,
    hub: Arc<Hub>,
}

impl MessageRouter {
    /// Create a router over a store and a hub.
    pub fn new(sessions: Arc<SessionManager>, hub: Arc<Hub>) -> Self {
        Self { sessions, hub }
    }

    /// Handle one envelope from `conn`.
    ///
    /// Unknown actions are ignored. Any other failure is sent back to
    /// `conn` as an `error` message.
    #[instrument(skip(self, envelope), fields(kind = %envelope.kind))]
    pub async fn dispatch(&self, conn: ConnectionId, envelope: Envelope) {
        let result = match ClientMessage::from_envelope(&envelope) {
            Ok(Some(message)) => self.route(conn, message).await,
            Ok(None) => {
                warn!(%conn, kind = %envelope.kind, "Unknown message type");
                return;
            }
            Err(err) => Err(err.into()),
        };

        if let Err(err) = result {
            debug!(%conn, error = %err, "Request failed");
            self.hub
                .send_to(conn, &ServerMessage::error(err.code(), err.to_string()))
                .await;
        }
    }

    /// Apply a decoded action.
    pub async fn route(&self, conn: ConnectionId, message: ClientMessage) -> Result<(), RouteError> {
        match message {
            ClientMessage::JoinGame { player_name, game_id } => {
                self.handle_join_game(conn, &player_name, game_id).await
            }
            ClientMessage::LeaveGame => self.handle_leave_game(conn).await,
            ClientMessage::PlayCard { card } => self.handle_play_card(conn, &card).await,
            ClientMessage::DealCards => self.handle_deal_cards(conn).await,
            ClientMessage::DropCardShared { card, position } => {
                self.handle_drop_card_shared(conn, &card, position).await
            }
            ClientMessage::ListGames => self.handle_list_games(conn).await,
        }
    }

    // =========================================================================
    // Handlers
    // =========================================================================

    async fn handle_join_game(
        &self,
        conn: ConnectionId,
        player_name: &str,
        game_id: Option<GameId>,
    ) -> Result<(), RouteError> {
        let identity = self
            .hub
            .identity(conn)
            .await
            .ok_or(HubError::ConnectionGone(conn))?;
        if identity.player_id.is_some() {
            return Err(RouteError::AlreadyInGame);
        }

        let game_id = game_id.unwrap_or_else(GameId::generate);

        let mut txn = self.sessions.begin().await;
        let (game, player) = txn.join_session(&game_id, player_name)?;

        if let Err(err) = self.attach(conn, &game_id, &player.id).await {
            if let Err(rollback) = txn.leave_session(&game_id, &player.id) {
                warn!(%conn, %game_id, error = %rollback, "Join rollback failed");
            }
            return Err(err.into());
        }

        self.hub
            .send_to(conn, &ServerMessage::GameState { game })
            .await;
        self.hub
            .broadcast_to_session_except(&game_id, conn, &ServerMessage::PlayerJoined { player })
            .await;
        Ok(())
    }

    async fn handle_leave_game(&self, conn: ConnectionId) -> Result<(), RouteError> {
        let (game_id, player_id) = self
            .hub
            .unsubscribe(conn)
            .await
            .ok_or(RouteError::NotInGame)?;
        self.hub.handle_player_leave(&game_id, &player_id).await;
        Ok(())
    }

    async fn handle_play_card(&self, conn: ConnectionId, card: &Card) -> Result<(), RouteError> {
        let (game_id, player_id) = self.seat_of(conn).await?;

        let mut txn = self.sessions.begin().await;
        let (game, card) = txn.play_card(&game_id, &player_id, card)?;

        self.hub
            .broadcast_to_session(
                &game_id,
                &ServerMessage::CardPlayed {
                    player_id,
                    card,
                },
            )
            .await;
        self.broadcast_outcome(&game_id, game).await;
        Ok(())
    }

    async fn handle_deal_cards(&self, conn: ConnectionId) -> Result<(), RouteError> {
        let game_id = self
            .hub
            .identity(conn)
            .await
            .and_then(|identity| identity.game_id)
            .ok_or(RouteError::NotInGame)?;

        let mut txn = self.sessions.begin().await;
        let game = txn.deal_cards(&game_id)?;

        self.hub
            .broadcast_to_session(&game_id, &ServerMessage::CardsDealt { game: game.clone() })
            .await;
        self.hub
            .broadcast_to_session(&game_id, &ServerMessage::GameState { game })
            .await;
        Ok(())
    }

    async fn handle_drop_card_shared(
        &self,
        conn: ConnectionId,
        card: &Card,
        position: Position,
    ) -> Result<(), RouteError> {
        let (game_id, player_id) = self.seat_of(conn).await?;

        let mut txn = self.sessions.begin().await;
        let (game, card) = txn.drop_card_in_shared_zone(&game_id, &player_id, card, position)?;

        self.hub
            .broadcast_to_session(
                &game_id,
                &ServerMessage::CardDropped {
                    player_id,
                    card,
                    position,
                },
            )
            .await;
        self.broadcast_outcome(&game_id, game).await;
        Ok(())
    }

    async fn handle_list_games(&self, conn: ConnectionId) -> Result<(), RouteError> {
        let games = self
            .sessions
            .list_sessions()
            .await
            .iter()
            .map(GameSummary::from)
            .collect();
        self.hub
            .send_to(conn, &ServerMessage::GameList { games })
            .await;
        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn attach(&self, conn: ConnectionId, game_id: &GameId, player_id: &PlayerId) -> Result<(), HubError> {
        self.hub.subscribe(conn, game_id).await?;
        self.hub.assign_player(conn, player_id).await
    }

    async fn seat_of(&self, conn: ConnectionId) -> Result<(GameId, PlayerId), RouteError> {
        self.hub
            .identity(conn)
            .await
            .and_then(|identity| identity.game_id.zip(identity.player_id))
            .ok_or(RouteError::NotInGame)
    }

    /// State after a move, plus the final state if the move ended the game.
    async fn broadcast_outcome(&self, game_id: &GameId, game: Game) {
        if game.phase() == GamePhase::Finished {
            self.hub
                .broadcast_to_session(game_id, &ServerMessage::GameState { game: game.clone() })
                .await;
            self.hub
                .broadcast_to_session(game_id, &ServerMessage::GameEnded { game })
                .await;
        } else {
            self.hub
                .broadcast_to_session(game_id, &ServerMessage::GameState { game })
                .await;
        }
    }
}
