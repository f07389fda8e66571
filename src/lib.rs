//! # Card Table Server
//!
//! Authoritative WebSocket server for turn-based multiplayer card games.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    CARD TABLE SERVER                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Primitives                                │
//! │  └── rng.rs      - Seeded Xoroshiro128+ shuffle RNG          │
//! │                                                              │
//! │  game/           - Game rules (synchronous, no I/O)          │
//! │  ├── card.rs     - Cards and the 52-card deck                │
//! │  ├── rules.rs    - Table rules                               │
//! │  └── state.rs    - Table state, turns, card custody          │
//! │                                                              │
//! │  network/        - Networking                                │
//! │  ├── session.rs  - Session store                             │
//! │  ├── protocol.rs - Message types                             │
//! │  ├── hub.rs      - Connection registry and fanout            │
//! │  ├── router.rs   - Client action dispatch                    │
//! │  └── server.rs   - WebSocket server                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Card Custody
//!
//! Every table owns exactly [`DECK_SIZE`] cards for its whole life. A card
//! is always in the deck, a player's hand, the played pile, or the hands
//! of players who left. Every store operation checks this in debug builds.
//!
//! ## Ordering
//!
//! Store mutations and the broadcasts they cause happen under one lock, so
//! every subscriber of a table sees that table's messages in commit order.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod network;

// Re-export commonly used types
pub use core::rng::DeterministicRng;
pub use game::card::{Card, Deck, Suit};
pub use game::rules::GameRules;
pub use game::state::{Game, GameId, GamePhase, Player, PlayerId};
pub use network::{GameServer, ServerConfig, SessionManager};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Cards in a full deck
pub const DECK_SIZE: usize = 52;

/// Seats per table
pub const MAX_PLAYERS: usize = 4;

/// Cards dealt to a joining player
pub const HAND_SIZE: usize = 5;

/// Points for emptying your hand
pub const WIN_BONUS: u32 = 100;
