//! Game Session Management
//!
//! In-memory store of every live table. A single lock over the whole map
//! makes each operation atomic with respect to every other one. Callers
//! that must fan out results in commit order take a [`SessionTxn`] and
//! hold it across the broadcast.

use std::collections::BTreeMap;

use tokio::sync::{RwLock, RwLockWriteGuard};
use tracing::{debug, info};

use crate::game::card::Card;
use crate::game::rules::GameRules;
use crate::game::state::{Game, GameError, GameId, Player, PlayerId, Position};
use crate::network::protocol::ErrorCode;
use crate::DECK_SIZE;

/// Session store errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// No table with this identifier.
    #[error("game not found: {0}")]
    NotFound(GameId),

    /// Rule violation inside an existing table.
    #[error(transparent)]
    Game(#[from] GameError),
}

impl SessionError {
    /// Error class reported to the client.
    pub fn code(&self) -> ErrorCode {
        match self {
            SessionError::NotFound(_) => ErrorCode::NotFound,
            SessionError::Game(err) => match err {
                GameError::PlayerNotFound | GameError::CardNotInHand => ErrorCode::NotFound,
                GameError::SessionFull
                | GameError::DuplicateName
                | GameError::GameFinished
                | GameError::NotPlayingPhase
                | GameError::NotYourTurn => ErrorCode::Conflict,
                GameError::DeckExhausted { .. } => ErrorCode::ResourceExhausted,
            },
        }
    }
}

/// Store of all live tables.
pub struct SessionManager {
    /// Tables by identifier.
    games: RwLock<BTreeMap<GameId, Game>>,
    /// Rules applied to every table.
    rules: GameRules,
}

impl SessionManager {
    /// Create an empty store with default rules.
    pub fn new() -> Self {
        Self::with_rules(GameRules::default())
    }

    /// Create an empty store with custom rules.
    pub fn with_rules(rules: GameRules) -> Self {
        Self {
            games: RwLock::new(BTreeMap::new()),
            rules,
        }
    }

    /// Rules in force.
    pub fn rules(&self) -> &GameRules {
        &self.rules
    }

    /// Take the exclusive section.
    ///
    /// Every other store operation waits until the transaction is dropped.
    pub async fn begin(&self) -> SessionTxn<'_> {
        SessionTxn {
            games: self.games.write().await,
            rules: &self.rules,
        }
    }

    /// Open a new empty table.
    pub async fn create_session(&self) -> Game {
        self.begin().await.create_session()
    }

    /// Snapshot of one table.
    pub async fn get_session(&self, id: &GameId) -> Result<Game, SessionError> {
        let games = self.games.read().await;
        games
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(id.clone()))
    }

    /// Seat a player, creating the table if the identifier is unknown.
    pub async fn join_session(&self, id: &GameId, name: &str) -> Result<(Game, Player), SessionError> {
        self.begin().await.join_session(id, name)
    }

    /// Remove a player. Returns `None` when the table closed as a result.
    pub async fn leave_session(
        &self,
        id: &GameId,
        player_id: &PlayerId,
    ) -> Result<Option<Game>, SessionError> {
        self.begin().await.leave_session(id, player_id)
    }

    /// Play a card on the player's turn.
    pub async fn play_card(
        &self,
        id: &GameId,
        player_id: &PlayerId,
        card: &Card,
    ) -> Result<(Game, Card), SessionError> {
        self.begin().await.play_card(id, player_id, card)
    }

    /// Deal one card to every player.
    pub async fn deal_cards(&self, id: &GameId) -> Result<Game, SessionError> {
        self.begin().await.deal_cards(id)
    }

    /// Drop a card in the shared zone.
    pub async fn drop_card_in_shared_zone(
        &self,
        id: &GameId,
        player_id: &PlayerId,
        card: &Card,
        position: Position,
    ) -> Result<(Game, Card), SessionError> {
        self.begin()
            .await
            .drop_card_in_shared_zone(id, player_id, card, position)
    }

    /// Snapshot of every table.
    pub async fn list_sessions(&self) -> Vec<Game> {
        let games = self.games.read().await;
        games.values().cloned().collect()
    }

    /// Number of live tables.
    pub async fn session_count(&self) -> usize {
        let games = self.games.read().await;
        games.len()
    }

    /// Remove a table unconditionally.
    pub async fn cleanup(&self, id: &GameId) -> bool {
        self.begin().await.cleanup(id)
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// TRANSACTION
// =============================================================================

/// Exclusive access to the store.
///
/// Results returned from here are snapshots; broadcasting them before the
/// transaction is dropped keeps fanout in commit order.
pub struct SessionTxn<'a> {
    games: RwLockWriteGuard<'a, BTreeMap<GameId, Game>>,
    rules: &'a GameRules,
}

impl SessionTxn<'_> {
    fn game_mut(&mut self, id: &GameId) -> Result<&mut Game, SessionError> {
        self.games
            .get_mut(id)
            .ok_or_else(|| SessionError::NotFound(id.clone()))
    }

    /// See [`SessionManager::create_session`].
    pub fn create_session(&mut self) -> Game {
        let game = Game::new(GameId::generate());
        self.games.insert(game.id.clone(), game.clone());
        info!(game_id = %game.id, "Game created");
        game
    }

    /// See [`SessionManager::get_session`].
    pub fn get_session(&self, id: &GameId) -> Result<Game, SessionError> {
        self.games
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(id.clone()))
    }

    /// See [`SessionManager::join_session`].
    ///
    /// A failed join into a table this call created leaves no table behind.
    pub fn join_session(&mut self, id: &GameId, name: &str) -> Result<(Game, Player), SessionError> {
        let rules = self.rules;
        let created = !self.games.contains_key(id);
        let game = self
            .games
            .entry(id.clone())
            .or_insert_with(|| Game::new(id.clone()));

        match game.add_player(name, rules) {
            Ok(player) => {
                debug_assert_eq!(game.card_count(), DECK_SIZE);
                if created {
                    info!(game_id = %id, "Game created");
                }
                info!(game_id = %id, player_id = %player.id, name, "Player joined");
                Ok((game.clone(), player))
            }
            Err(err) => {
                if created {
                    self.games.remove(id);
                }
                debug!(game_id = %id, name, error = %err, "Join rejected");
                Err(err.into())
            }
        }
    }

    /// See [`SessionManager::leave_session`].
    pub fn leave_session(
        &mut self,
        id: &GameId,
        player_id: &PlayerId,
    ) -> Result<Option<Game>, SessionError> {
        let snapshot = {
            let game = self.game_mut(id)?;
            game.remove_player(player_id)?;
            debug_assert_eq!(game.card_count(), DECK_SIZE);
            game.clone()
        };
        info!(game_id = %id, player_id = %player_id, "Player left");

        if snapshot.players().is_empty() {
            self.games.remove(id);
            info!(game_id = %id, "Game closed");
            return Ok(None);
        }
        Ok(Some(snapshot))
    }

    /// See [`SessionManager::play_card`].
    pub fn play_card(
        &mut self,
        id: &GameId,
        player_id: &PlayerId,
        card: &Card,
    ) -> Result<(Game, Card), SessionError> {
        let rules = self.rules;
        let game = self.game_mut(id)?;
        let played = game.play_card(player_id, &card.id, rules)?;
        debug_assert_eq!(game.card_count(), DECK_SIZE);
        debug!(game_id = %id, player_id = %player_id, card_id = %played.id, "Card played");
        Ok((game.clone(), played))
    }

    /// See [`SessionManager::deal_cards`].
    pub fn deal_cards(&mut self, id: &GameId) -> Result<Game, SessionError> {
        let game = self.game_mut(id)?;
        game.deal_round()?;
        debug_assert_eq!(game.card_count(), DECK_SIZE);
        debug!(game_id = %id, deck = game.deck_len(), "Round dealt");
        Ok(game.clone())
    }

    /// See [`SessionManager::drop_card_in_shared_zone`].
    pub fn drop_card_in_shared_zone(
        &mut self,
        id: &GameId,
        player_id: &PlayerId,
        card: &Card,
        position: Position,
    ) -> Result<(Game, Card), SessionError> {
        let rules = self.rules;
        let game = self.game_mut(id)?;
        let dropped = game.drop_in_shared_zone(player_id, &card.id, position, rules)?;
        debug_assert_eq!(game.card_count(), DECK_SIZE);
        debug!(game_id = %id, player_id = %player_id, card_id = %dropped.id, "Card dropped");
        Ok((game.clone(), dropped))
    }

    /// See [`SessionManager::cleanup`].
    pub fn cleanup(&mut self, id: &GameId) -> bool {
        self.games.remove(id).is_some()
    }
}
