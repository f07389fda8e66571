//! Game Logic Module
//!
//! Card game rules. Synchronous and free of I/O; the network layer
//! decides when and under which lock these run.
//!
//! ## Module Structure
//!
//! - `card`: Cards and the 52-card deck
//! - `rules`: Tunable table rules
//! - `state`: Table state, players, turn order and card custody

pub mod card;
pub mod rules;
pub mod state;

// Re-export key types
pub use card::{Card, Deck, Suit};
pub use rules::GameRules;
pub use state::{Game, GameError, GameId, GamePhase, Player, PlayerId, Position, SharedCard};
