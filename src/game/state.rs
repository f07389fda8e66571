//! Game State Definitions
//!
//! Per-table state and the rules that mutate it. Everything here is
//! synchronous; the session store wraps it in a lock.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};

use crate::core::rng::DeterministicRng;
use crate::game::card::{Card, Deck};
use crate::game::rules::GameRules;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Game (session) identifier.
///
/// Clients may pick their own identifier when joining, so this is an
/// arbitrary string rather than a parsed UUID.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GameId(String);

impl GameId {
    /// Create from any string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow as `&str`.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for GameId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Player identifier, issued by the server on join.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(String);

impl PlayerId {
    /// Create from any string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow as `&str`.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlayerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

// =============================================================================
// PHASE
// =============================================================================

/// Game phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GamePhase {
    /// Fewer than two players seated.
    Waiting,
    /// Turns are being taken.
    Playing,
    /// A player emptied their hand. Terminal.
    Finished,
}

// =============================================================================
// PLAYER
// =============================================================================

/// A seated player.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    /// Player identifier.
    pub id: PlayerId,
    /// Display name, unique within the table.
    pub name: String,
    /// Cards held.
    pub hand: Vec<Card>,
    /// Score. Never decreases.
    pub score: u32,
    /// Whether this player holds the turn.
    pub is_current_player: bool,
    /// When the player sat down.
    pub joined_at: DateTime<Utc>,
}

impl Player {
    fn new(name: &str, hand: Vec<Card>) -> Self {
        Self {
            id: PlayerId::generate(),
            name: name.to_string(),
            hand,
            score: 0,
            is_current_player: false,
            joined_at: Utc::now(),
        }
    }

    /// Whether the hand holds a card with this id.
    pub fn has_card(&self, card_id: &str) -> bool {
        self.hand.iter().any(|c| c.id == card_id)
    }

    fn take_card(&mut self, card_id: &str) -> Option<Card> {
        let index = self.hand.iter().position(|c| c.id == card_id)?;
        Some(self.hand.remove(index))
    }
}

// =============================================================================
// SHARED ZONE
// =============================================================================

/// Table position of a card dropped in the shared zone.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Horizontal coordinate.
    pub x: f64,
    /// Vertical coordinate.
    pub y: f64,
}

/// A card placed in the shared zone.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedCard {
    /// The card.
    pub card: Card,
    /// Where it was dropped.
    pub position: Position,
    /// Who dropped it.
    pub player_id: PlayerId,
}

// =============================================================================
// ERRORS
// =============================================================================

/// Rule violations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GameError {
    /// All seats are taken.
    #[error("game is full")]
    SessionFull,

    /// Display name already used at this table.
    #[error("player name already exists")]
    DuplicateName,

    /// The game has ended.
    #[error("game has already finished")]
    GameFinished,

    /// Action requires the playing phase.
    #[error("game is not in playing phase")]
    NotPlayingPhase,

    /// Another player holds the turn.
    #[error("not your turn")]
    NotYourTurn,

    /// No such player at this table.
    #[error("player not found")]
    PlayerNotFound,

    /// The player does not hold that card.
    #[error("card not found in player's hand")]
    CardNotInHand,

    /// Not enough cards left to deal.
    #[error("not enough cards in deck (need {needed}, {remaining} left)")]
    DeckExhausted {
        /// Cards requested.
        needed: usize,
        /// Cards remaining.
        remaining: usize,
    },
}

// =============================================================================
// GAME
// =============================================================================

/// Authoritative state of one table.
///
/// Card custody: every card of the original deck is in exactly one of the
/// deck, a hand, the played pile, or the discard pile of departed players.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Game {
    /// Game identifier.
    pub id: GameId,
    /// Seated players in turn order.
    players: Vec<Player>,
    /// Player holding the turn.
    current_player: Option<PlayerId>,
    /// Phase.
    #[serde(rename = "gamePhase")]
    phase: GamePhase,
    /// Undealt cards. Only the count goes over the wire.
    #[serde(rename = "deckCount", serialize_with = "serialize_deck_count")]
    deck: Deck,
    /// Played cards, oldest first.
    played_cards: Vec<Card>,
    /// Shared-zone placements. Each card here is also in `played_cards`.
    shared_zone: Vec<SharedCard>,
    /// Hands of departed players.
    #[serde(skip)]
    discarded: Vec<Card>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    rng: DeterministicRng,
    #[serde(skip)]
    shuffled: bool,
}

fn serialize_deck_count<S: Serializer>(deck: &Deck, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(deck.len() as u64)
}

impl Game {
    /// Create an empty table with a freshly seeded deck.
    pub fn new(id: GameId) -> Self {
        let entropy = uuid::Uuid::new_v4().as_u128() as u64;
        let rng = DeterministicRng::for_session(id.as_str(), entropy);
        Self::build(id, rng)
    }

    /// Create an empty table with a fixed shuffle seed.
    pub fn with_seed(id: GameId, seed: u64) -> Self {
        Self::build(id, DeterministicRng::new(seed))
    }

    fn build(id: GameId, rng: DeterministicRng) -> Self {
        let now = Utc::now();
        Self {
            id,
            players: Vec::new(),
            current_player: None,
            phase: GamePhase::Waiting,
            deck: Deck::standard(),
            played_cards: Vec::new(),
            shared_zone: Vec::new(),
            discarded: Vec::new(),
            created_at: now,
            updated_at: now,
            rng,
            shuffled: false,
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Seated players in turn order.
    pub fn players(&self) -> &[Player] {
        &self.players
    }

    /// Look up a player.
    pub fn player(&self, id: &PlayerId) -> Option<&Player> {
        self.players.iter().find(|p| &p.id == id)
    }

    /// Identifier of the player holding the turn.
    pub fn current_player_id(&self) -> Option<&PlayerId> {
        self.current_player.as_ref()
    }

    /// Player holding the turn.
    pub fn current_player(&self) -> Option<&Player> {
        self.current_player.as_ref().and_then(|id| self.player(id))
    }

    /// Current phase.
    pub fn phase(&self) -> GamePhase {
        self.phase
    }

    /// Cards left in the deck.
    pub fn deck_len(&self) -> usize {
        self.deck.len()
    }

    /// Played cards, oldest first.
    pub fn played_cards(&self) -> &[Card] {
        &self.played_cards
    }

    /// Shared-zone placements.
    pub fn shared_zone(&self) -> &[SharedCard] {
        &self.shared_zone
    }

    /// Total cards under this table's custody. Always the deck size.
    pub fn card_count(&self) -> usize {
        self.deck.len()
            + self.players.iter().map(|p| p.hand.len()).sum::<usize>()
            + self.played_cards.len()
            + self.discarded.len()
    }

    fn seat_of(&self, id: &PlayerId) -> Option<usize> {
        self.players.iter().position(|p| &p.id == id)
    }

    // -------------------------------------------------------------------------
    // Rules
    // -------------------------------------------------------------------------

    /// Seat a new player and deal their starting hand.
    pub fn add_player(&mut self, name: &str, rules: &GameRules) -> Result<Player, GameError> {
        if self.phase == GamePhase::Finished {
            return Err(GameError::GameFinished);
        }
        if self.players.len() >= rules.max_players {
            return Err(GameError::SessionFull);
        }
        if self.players.iter().any(|p| p.name == name) {
            return Err(GameError::DuplicateName);
        }

        let hand = self.draw(rules.hand_size)?;
        let mut player = Player::new(name, hand);

        // First to sit down holds the turn
        if self.players.is_empty() {
            player.is_current_player = true;
            self.current_player = Some(player.id.clone());
        }
        self.players.push(player.clone());

        if self.players.len() >= 2 && self.phase == GamePhase::Waiting {
            self.phase = GamePhase::Playing;
        }

        self.touch();
        Ok(player)
    }

    /// Remove a player. Their hand goes to the discard pile.
    pub fn remove_player(&mut self, player_id: &PlayerId) -> Result<Player, GameError> {
        let seat = self.seat_of(player_id).ok_or(GameError::PlayerNotFound)?;
        let mut removed = self.players.remove(seat);
        self.discarded.append(&mut removed.hand);

        if self.current_player.as_ref() == Some(player_id) {
            let next = if self.players.is_empty() { None } else { Some(0) };
            self.set_current(next);
        }

        if self.players.len() < 2 && self.phase == GamePhase::Playing {
            self.phase = GamePhase::Waiting;
        }

        self.touch();
        Ok(removed)
    }

    /// Play a card from the current player's hand.
    ///
    /// Checks run in this order: phase, turn, seat, card. Nothing changes
    /// on failure.
    pub fn play_card(
        &mut self,
        player_id: &PlayerId,
        card_id: &str,
        rules: &GameRules,
    ) -> Result<Card, GameError> {
        if self.phase != GamePhase::Playing {
            return Err(GameError::NotPlayingPhase);
        }
        if self.current_player.as_ref() != Some(player_id) {
            return Err(GameError::NotYourTurn);
        }
        let seat = self.seat_of(player_id).ok_or(GameError::PlayerNotFound)?;
        let card = self.players[seat]
            .take_card(card_id)
            .ok_or(GameError::CardNotInHand)?;

        self.played_cards.push(card.clone());

        let emptied = self.players[seat].hand.is_empty();
        if !emptied || rules.advance_turn_on_win {
            self.advance_turn();
        }
        if emptied {
            self.finish(seat, rules);
        }

        self.touch();
        Ok(card)
    }

    /// Deal one card to every seated player, in seat order.
    ///
    /// Deals nothing if the deck cannot cover every seat.
    pub fn deal_round(&mut self) -> Result<(), GameError> {
        if self.phase != GamePhase::Playing {
            return Err(GameError::NotPlayingPhase);
        }

        let cards = self.draw(self.players.len())?;
        for (player, card) in self.players.iter_mut().zip(cards) {
            player.hand.push(card);
        }

        self.touch();
        Ok(())
    }

    /// Move a card from a player's hand to the shared zone.
    ///
    /// Any seated player may drop at any time during play; the turn is
    /// left alone.
    pub fn drop_in_shared_zone(
        &mut self,
        player_id: &PlayerId,
        card_id: &str,
        position: Position,
        rules: &GameRules,
    ) -> Result<Card, GameError> {
        if self.phase != GamePhase::Playing {
            return Err(GameError::NotPlayingPhase);
        }
        let seat = self.seat_of(player_id).ok_or(GameError::PlayerNotFound)?;
        let card = self.players[seat]
            .take_card(card_id)
            .ok_or(GameError::CardNotInHand)?;

        self.played_cards.push(card.clone());
        self.shared_zone.push(SharedCard {
            card: card.clone(),
            position,
            player_id: player_id.clone(),
        });

        if self.players[seat].hand.is_empty() {
            self.finish(seat, rules);
        }

        self.touch();
        Ok(card)
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Draw from the front of the deck, shuffling once before the first deal.
    fn draw(&mut self, count: usize) -> Result<Vec<Card>, GameError> {
        let exhausted = GameError::DeckExhausted {
            needed: count,
            remaining: self.deck.len(),
        };
        if self.deck.len() < count {
            return Err(exhausted);
        }

        if !self.shuffled && self.played_cards.is_empty() {
            self.deck.shuffle(&mut self.rng);
            self.shuffled = true;
        }

        self.deck.draw(count).ok_or(exhausted)
    }

    /// Round-robin by seat.
    fn advance_turn(&mut self) {
        if self.players.len() <= 1 {
            return;
        }
        let Some(seat) = self.current_player.as_ref().and_then(|id| self.seat_of(id)) else {
            return;
        };
        self.set_current(Some((seat + 1) % self.players.len()));
    }

    /// Move the turn flag to `seat`, keeping the flag and the id in step.
    fn set_current(&mut self, seat: Option<usize>) {
        for player in &mut self.players {
            player.is_current_player = false;
        }
        self.current_player = match seat.and_then(|i| self.players.get_mut(i)) {
            Some(player) => {
                player.is_current_player = true;
                Some(player.id.clone())
            }
            None => None,
        };
    }

    fn finish(&mut self, winner_seat: usize, rules: &GameRules) {
        self.phase = GamePhase::Finished;
        self.players[winner_seat].score += rules.win_bonus;
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
