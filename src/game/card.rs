//! Cards and Decks
//!
//! A standard 52-card deck. Cards are immutable values that move between
//! the deck, player hands and the played pile.

use serde::{Deserialize, Serialize};

use crate::core::rng::DeterministicRng;
use crate::DECK_SIZE;

/// Card suit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Suit {
    /// Hearts.
    Hearts,
    /// Diamonds.
    Diamonds,
    /// Clubs.
    Clubs,
    /// Spades.
    Spades,
}

impl Suit {
    /// All suits in deck construction order.
    pub const ALL: [Suit; 4] = [Suit::Hearts, Suit::Diamonds, Suit::Clubs, Suit::Spades];
}

/// Rank labels with their numeric values.
pub const RANKS: [(&str, u8); 13] = [
    ("A", 1), ("2", 2), ("3", 3), ("4", 4), ("5", 5), ("6", 6), ("7", 7),
    ("8", 8), ("9", 9), ("10", 10), ("J", 11), ("Q", 12), ("K", 13),
];

/// A playing card.
///
/// Identity is the `id`; two cards with equal suit and rank in different
/// sessions are still distinct cards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Card {
    /// Unique card identifier.
    pub id: String,
    /// Suit.
    pub suit: Suit,
    /// Rank label ("A", "2".."10", "J", "Q", "K").
    pub rank: String,
    /// Numeric value (1..=13).
    pub value: u8,
}

impl Card {
    /// Create a card with a fresh identifier.
    pub fn new(suit: Suit, rank: &str, value: u8) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            suit,
            rank: rank.to_string(),
            value,
        }
    }
}

/// An ordered deck of cards. Deals from the front.
#[derive(Debug, Clone, Default)]
pub struct Deck {
    cards: Vec<Card>,
}

impl Deck {
    /// Build a standard unshuffled 52-card deck.
    pub fn standard() -> Self {
        let mut cards = Vec::with_capacity(DECK_SIZE);
        for suit in Suit::ALL {
            for (rank, value) in RANKS {
                cards.push(Card::new(suit, rank, value));
            }
        }
        Self { cards }
    }

    /// Cards remaining.
    pub fn len(&self) -> usize {
        self.cards.len()
    }

    /// Whether the deck is empty.
    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    /// Remaining cards, front first.
    pub fn cards(&self) -> &[Card] {
        &self.cards
    }

    /// Shuffle remaining cards in place.
    pub fn shuffle(&mut self, rng: &mut DeterministicRng) {
        rng.shuffle(&mut self.cards);
    }

    /// Take `count` cards from the front.
    ///
    /// Returns `None` and leaves the deck untouched if fewer remain.
    pub fn draw(&mut self, count: usize) -> Option<Vec<Card>> {
        if self.cards.len() < count {
            return None;
        }
        Some(self.cards.drain(..count).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_standard_deck_composition() {
        let deck = Deck::standard();
        assert_eq!(deck.len(), 52);

        for suit in Suit::ALL {
            let of_suit: Vec<_> = deck.cards().iter().filter(|c| c.suit == suit).collect();
            assert_eq!(of_suit.len(), 13);
            let values: u32 = of_suit.iter().map(|c| c.value as u32).sum();
            assert_eq!(values, (1..=13).sum::<u32>());
        }

        let ids: HashSet<_> = deck.cards().iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids.len(), 52);
    }

    #[test]
    fn test_draw_from_front() {
        let mut deck = Deck::standard();
        let first = deck.cards()[0].clone();

        let hand = deck.draw(5).unwrap();
        assert_eq!(hand.len(), 5);
        assert_eq!(hand[0], first);
        assert_eq!(deck.len(), 47);
    }

    #[test]
    fn test_draw_underflow_leaves_deck() {
        let mut deck = Deck::standard();
        deck.draw(50).unwrap();

        assert!(deck.draw(3).is_none());
        assert_eq!(deck.len(), 2);
    }

    #[test]
    fn test_shuffle_reorders() {
        let mut deck = Deck::standard();
        let before: Vec<_> = deck.cards().iter().map(|c| c.id.clone()).collect();

        deck.shuffle(&mut DeterministicRng::new(5));
        let after: Vec<_> = deck.cards().iter().map(|c| c.id.clone()).collect();

        assert_ne!(before, after);
        assert_eq!(
            before.iter().collect::<HashSet<_>>(),
            after.iter().collect::<HashSet<_>>()
        );
    }

    #[test]
    fn test_card_json_shape() {
        let card = Card::new(Suit::Spades, "Q", 12);
        let json = serde_json::to_value(&card).unwrap();
        assert_eq!(json["suit"], "spades");
        assert_eq!(json["rank"], "Q");
        assert_eq!(json["value"], 12);
    }
}
