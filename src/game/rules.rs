//! Table Rules
//!
//! Tunable parameters of the card game.

use crate::{HAND_SIZE, MAX_PLAYERS, WIN_BONUS};

/// Rules applied by every session of a [`SessionManager`](crate::network::SessionManager).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameRules {
    /// Seats per table.
    pub max_players: usize,
    /// Cards dealt to a joining player.
    pub hand_size: usize,
    /// Points credited to the player who empties their hand.
    pub win_bonus: u32,
    /// Whether the winning play still passes the turn to the next seat.
    ///
    /// When true the current actor at game end is the player after the
    /// winner; when false the winner keeps the turn.
    pub advance_turn_on_win: bool,
}

impl Default for GameRules {
    fn default() -> Self {
        Self {
            max_players: MAX_PLAYERS,
            hand_size: HAND_SIZE,
            win_bonus: WIN_BONUS,
            advance_turn_on_win: true,
        }
    }
}
