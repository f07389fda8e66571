//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Every frame is a JSON envelope `{type, gameId?, playerId?, data?}`.
//! Inbound envelopes are decoded in two steps: the envelope itself, then
//! the action-specific payload, so an unknown action can be ignored while
//! a malformed payload is reported back to the sender.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::game::card::Card;
use crate::game::state::{Game, GameId, GamePhase, Player, PlayerId, Position};

// =============================================================================
// ENVELOPE
// =============================================================================

/// A parsed inbound frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Action tag.
    #[serde(rename = "type")]
    pub kind: String,
    /// Target game, if the client names one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub game_id: Option<String>,
    /// Claimed player identity. Informational only; the server uses the
    /// identity recorded on the connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_id: Option<String>,
    /// Action payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Envelope {
    /// Build an envelope with a payload.
    pub fn new(kind: &str, data: Option<serde_json::Value>) -> Self {
        Self {
            kind: kind.to_string(),
            game_id: None,
            player_id: None,
            data,
        }
    }

    /// Deserialize from a text frame.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Deserialize from a binary frame carrying JSON.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    fn payload<T: DeserializeOwned>(&self, action: &'static str) -> Result<T, ProtocolError> {
        let data = self.data.clone().ok_or(ProtocolError::MissingData(action))?;
        serde_json::from_value(data)
            .map_err(|source| ProtocolError::InvalidPayload { action, source })
    }
}

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Action tags accepted from clients.
pub mod action {
    /// Sit down at a table.
    pub const JOIN_GAME: &str = "join_game";
    /// Leave the current table.
    pub const LEAVE_GAME: &str = "leave_game";
    /// Play a card on your turn.
    pub const PLAY_CARD: &str = "play_card";
    /// Deal one card to every player.
    pub const DEAL_CARDS: &str = "deal_cards";
    /// Drop a card in the shared zone.
    pub const DROP_CARD_SHARED: &str = "drop_card_shared";
    /// List open tables.
    pub const LIST_GAMES: &str = "list_games";
}

/// A decoded client action.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    /// Join (or create) a table.
    JoinGame {
        /// Display name.
        player_name: String,
        /// Table to join; `None` opens a new one.
        game_id: Option<GameId>,
    },
    /// Leave the current table.
    LeaveGame,
    /// Play a card.
    PlayCard {
        /// Card to play, matched by id.
        card: Card,
    },
    /// Deal a round.
    DealCards,
    /// Drop a card in the shared zone.
    DropCardShared {
        /// Card to drop, matched by id.
        card: Card,
        /// Where it lands.
        position: Position,
    },
    /// List tables.
    ListGames,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinGameData {
    #[serde(default)]
    player_name: String,
    #[serde(default)]
    game_id: Option<String>,
}

#[derive(Deserialize)]
struct PlayCardData {
    card: Card,
}

#[derive(Deserialize)]
struct DropCardData {
    card: Card,
    position: Position,
}

impl ClientMessage {
    /// Decode the action carried by an envelope.
    ///
    /// Returns `Ok(None)` for an action tag this server does not know.
    pub fn from_envelope(envelope: &Envelope) -> Result<Option<Self>, ProtocolError> {
        let message = match envelope.kind.as_str() {
            action::JOIN_GAME => {
                let data: JoinGameData = envelope.payload(action::JOIN_GAME)?;
                let player_name = data.player_name.trim().to_string();
                if player_name.is_empty() {
                    return Err(ProtocolError::EmptyPlayerName);
                }
                let game_id = envelope
                    .game_id
                    .clone()
                    .or(data.game_id)
                    .filter(|id| !id.is_empty())
                    .map(GameId::new);
                ClientMessage::JoinGame { player_name, game_id }
            }
            action::LEAVE_GAME => ClientMessage::LeaveGame,
            action::PLAY_CARD => {
                let data: PlayCardData = envelope.payload(action::PLAY_CARD)?;
                ClientMessage::PlayCard { card: data.card }
            }
            action::DEAL_CARDS => ClientMessage::DealCards,
            action::DROP_CARD_SHARED => {
                let data: DropCardData = envelope.payload(action::DROP_CARD_SHARED)?;
                if !data.position.x.is_finite() || !data.position.y.is_finite() {
                    return Err(ProtocolError::InvalidPosition);
                }
                ClientMessage::DropCardShared {
                    card: data.card,
                    position: data.position,
                }
            }
            action::LIST_GAMES => ClientMessage::ListGames,
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}

/// Payload decode failures.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The action needs a `data` object.
    #[error("Missing data for {0}")]
    MissingData(&'static str),

    /// The `data` object has the wrong shape.
    #[error("Invalid {action} data: {source}")]
    InvalidPayload {
        /// Action tag.
        action: &'static str,
        /// Decode error.
        #[source]
        source: serde_json::Error,
    },

    /// Blank display name.
    #[error("Player name is required")]
    EmptyPlayerName,

    /// NaN or infinite coordinates.
    #[error("Position must be finite")]
    InvalidPosition,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client, as `{type, data}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full table snapshot.
    GameState {
        /// Snapshot.
        game: Game,
    },

    /// Someone sat down.
    PlayerJoined {
        /// The new player.
        player: Player,
    },

    /// Someone left.
    PlayerLeft {
        /// Who left.
        #[serde(rename = "playerId")]
        player_id: PlayerId,
    },

    /// A card was played.
    CardPlayed {
        /// Who played it.
        #[serde(rename = "playerId")]
        player_id: PlayerId,
        /// The card.
        card: Card,
    },

    /// A player emptied their hand.
    GameEnded {
        /// Final snapshot.
        game: Game,
    },

    /// A round was dealt.
    CardsDealt {
        /// Snapshot after the deal.
        game: Game,
    },

    /// A card was dropped in the shared zone.
    CardDropped {
        /// Who dropped it.
        #[serde(rename = "playerId")]
        player_id: PlayerId,
        /// The card.
        card: Card,
        /// Where it landed.
        position: Position,
    },

    /// Table listing.
    GameList {
        /// One entry per table.
        games: Vec<GameSummary>,
    },

    /// Server is shutting down.
    Shutdown {
        /// Reason.
        reason: String,
    },

    /// Request failed.
    Error(ServerError),
}

/// One row of a table listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSummary {
    /// Table identifier.
    pub id: GameId,
    /// Phase.
    pub game_phase: GamePhase,
    /// Seated players.
    pub player_count: usize,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl From<&Game> for GameSummary {
    fn from(game: &Game) -> Self {
        Self {
            id: game.id.clone(),
            game_phase: game.phase(),
            player_count: game.players().len(),
            created_at: game.created_at,
        }
    }
}

/// Server error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerError {
    /// Error class.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

/// Error classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Table, player or card absent.
    NotFound,
    /// Request conflicts with table state (full, wrong turn, wrong phase).
    Conflict,
    /// Malformed envelope or payload.
    InvalidInput,
    /// Deck ran out.
    ResourceExhausted,
}

impl ProtocolError {
    /// Error class reported to the client.
    pub fn code(&self) -> ErrorCode {
        ErrorCode::InvalidInput
    }
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ServerMessage {
    /// Build an error message.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error(ServerError {
            code,
            message: message.into(),
        })
    }

    /// Outbound tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::GameState { .. } => "game_state",
            ServerMessage::PlayerJoined { .. } => "player_joined",
            ServerMessage::PlayerLeft { .. } => "player_left",
            ServerMessage::CardPlayed { .. } => "card_played",
            ServerMessage::GameEnded { .. } => "game_ended",
            ServerMessage::CardsDealt { .. } => "cards_dealt",
            ServerMessage::CardDropped { .. } => "card_dropped",
            ServerMessage::GameList { .. } => "game_list",
            ServerMessage::Shutdown { .. } => "shutdown",
            ServerMessage::Error(_) => "error",
        }
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::card::Suit;
    use crate::game::rules::GameRules;
    use serde_json::json;

    fn decode(raw: &str) -> Result<Option<ClientMessage>, ProtocolError> {
        ClientMessage::from_envelope(&Envelope::from_json(raw).unwrap())
    }

    #[test]
    fn test_envelope_optional_fields() {
        let env = Envelope::from_json(r#"{"type":"deal_cards"}"#).unwrap();
        assert_eq!(env.kind, "deal_cards");
        assert!(env.game_id.is_none());
        assert!(env.data.is_none());

        let json = env.to_json().unwrap();
        assert_eq!(json, r#"{"type":"deal_cards"}"#);
    }

    #[test]
    fn test_envelope_rejects_garbage() {
        assert!(Envelope::from_json("not json").is_err());
        assert!(Envelope::from_json(r#"{"gameId":"x"}"#).is_err());
        assert!(Envelope::from_slice(br#"{"type":"list_games"}"#).is_ok());
    }

    #[test]
    fn test_join_game_id_from_envelope_or_data() {
        let msg = decode(r#"{"type":"join_game","gameId":"g1","data":{"playerName":"Alice"}}"#)
            .unwrap()
            .unwrap();
        match msg {
            ClientMessage::JoinGame { player_name, game_id } => {
                assert_eq!(player_name, "Alice");
                assert_eq!(game_id, Some(GameId::from("g1")));
            }
            other => panic!("Wrong message type: {:?}", other),
        }

        let msg = decode(r#"{"type":"join_game","data":{"playerName":"Bob","gameId":"g2"}}"#)
            .unwrap()
            .unwrap();
        assert!(matches!(
            msg,
            ClientMessage::JoinGame { game_id: Some(ref id), .. } if id.as_str() == "g2"
        ));

        let msg = decode(r#"{"type":"join_game","gameId":"","data":{"playerName":"Eve"}}"#)
            .unwrap()
            .unwrap();
        assert!(matches!(msg, ClientMessage::JoinGame { game_id: None, .. }));
    }

    #[test]
    fn test_join_requires_name() {
        assert!(matches!(
            decode(r#"{"type":"join_game","data":{"playerName":"   "}}"#),
            Err(ProtocolError::EmptyPlayerName)
        ));
        assert!(matches!(
            decode(r#"{"type":"join_game","data":{}}"#),
            Err(ProtocolError::EmptyPlayerName)
        ));
        assert!(matches!(
            decode(r#"{"type":"join_game"}"#),
            Err(ProtocolError::MissingData("join_game"))
        ));
    }

    #[test]
    fn test_play_card_ignores_client_extras() {
        let raw = json!({
            "type": "play_card",
            "data": {"card": {"id": "c1", "suit": "hearts", "rank": "7", "value": 7, "x": 10, "isSelected": true}}
        });
        let msg = decode(&raw.to_string()).unwrap().unwrap();
        match msg {
            ClientMessage::PlayCard { card } => {
                assert_eq!(card.id, "c1");
                assert_eq!(card.suit, Suit::Hearts);
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_play_card_bad_payload() {
        let err = decode(r#"{"type":"play_card","data":{"card":{"id":"c1"}}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { action: "play_card", .. }));
        assert_eq!(err.code(), ErrorCode::InvalidInput);
    }

    #[test]
    fn test_drop_card_shared() {
        let raw = json!({
            "type": "drop_card_shared",
            "data": {
                "card": {"id": "c9", "suit": "clubs", "rank": "K", "value": 13},
                "position": {"x": 12.5, "y": -3.0}
            }
        });
        let msg = decode(&raw.to_string()).unwrap().unwrap();
        match msg {
            ClientMessage::DropCardShared { card, position } => {
                assert_eq!(card.rank, "K");
                assert_eq!(position, Position { x: 12.5, y: -3.0 });
            }
            other => panic!("Wrong message type: {:?}", other),
        }

        let missing = json!({
            "type": "drop_card_shared",
            "data": {"card": {"id": "c9", "suit": "clubs", "rank": "K", "value": 13}}
        });
        assert!(decode(&missing.to_string()).is_err());
    }

    #[test]
    fn test_unknown_action_is_not_an_error() {
        assert!(decode(r#"{"type":"dance","data":{"style":"tango"}}"#).unwrap().is_none());
    }

    #[test]
    fn test_error_message_shape() {
        let msg = ServerMessage::error(ErrorCode::Conflict, "not your turn");
        let json: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert_eq!(json["type"], "error");
        assert_eq!(json["data"]["code"], "conflict");
        assert_eq!(json["data"]["message"], "not your turn");
    }

    #[test]
    fn test_player_left_shape() {
        let msg = ServerMessage::PlayerLeft { player_id: PlayerId::from("p1") };
        let json: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(json, json!({"type": "player_left", "data": {"playerId": "p1"}}));
    }

    #[test]
    fn test_game_state_shape() {
        let mut game = Game::with_seed(GameId::from("g"), 3);
        game.add_player("Alice", &GameRules::default()).unwrap();

        let msg = ServerMessage::GameState { game: game.clone() };
        assert_eq!(msg.kind(), "game_state");
        let json: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert_eq!(json["type"], "game_state");
        assert_eq!(json["data"]["game"]["id"], "g");
        assert_eq!(json["data"]["game"]["gamePhase"], "waiting");
        assert_eq!(json["data"]["game"]["players"][0]["name"], "Alice");

        let summary = GameSummary::from(&game);
        assert_eq!(summary.player_count, 1);
        assert_eq!(summary.game_phase, GamePhase::Waiting);
    }
}
