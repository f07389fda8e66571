//! Core Primitives
//!
//! Building blocks shared by the game rules.

pub mod rng;

pub use rng::{derive_deck_seed, DeterministicRng};
