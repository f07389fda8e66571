//! Seeded Shuffle RNG
//!
//! Xoroshiro128+ generator used to shuffle a session's deck.
//! Each session owns its own generator, so one table's shuffle never
//! depends on traffic at another table.

use sha2::{Digest, Sha256};

/// Domain separator for deck seeds.
const DECK_SEED_DOMAIN: &[u8] = b"CARD_TABLE_DECK_V1";

/// Seeded PRNG.
///
/// The same seed deals the same cards on every platform, which makes a
/// table reproducible in tests.
///
/// ```
/// use card_table::core::rng::DeterministicRng;
///
/// let mut a = DeterministicRng::new(7);
/// let mut b = DeterministicRng::new(7);
/// assert_eq!(a.next_u64(), b.next_u64());
/// ```
#[derive(Clone, Debug)]
pub struct DeterministicRng {
    lo: u64,
    hi: u64,
}

impl Default for DeterministicRng {
    fn default() -> Self {
        Self::new(0)
    }
}

impl DeterministicRng {
    /// Create from a 64-bit seed, expanded through SplitMix64.
    pub fn new(seed: u64) -> Self {
        let mut mix = SplitMix64(seed);
        let (lo, hi) = (mix.next_u64(), mix.next_u64());
        if (lo | hi) == 0 {
            // Xoroshiro is stuck at zero forever from an all-zero state
            return Self { lo: 1, hi: 1 };
        }
        Self { lo, hi }
    }

    /// Create the generator for a freshly created session.
    pub fn for_session(session_id: &str, entropy: u64) -> Self {
        Self::new(derive_deck_seed(session_id, entropy))
    }

    /// Next 64 random bits.
    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        let out = self.lo.wrapping_add(self.hi);
        let x = self.hi ^ self.lo;
        self.lo = self.lo.rotate_left(24) ^ x ^ (x << 16);
        self.hi = x.rotate_left(37);
        out
    }

    /// Uniform-enough index in `0..bound`. Zero when `bound` is zero.
    #[inline]
    pub fn next_index(&mut self, bound: usize) -> usize {
        match bound {
            0 => 0,
            n => (self.next_u64() % n as u64) as usize,
        }
    }

    /// Fisher-Yates shuffle in place.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for upper in (1..items.len()).rev() {
            let pick = self.next_index(upper + 1);
            items.swap(upper, pick);
        }
    }

    /// Raw generator state.
    pub fn state(&self) -> [u64; 2] {
        [self.lo, self.hi]
    }
}

struct SplitMix64(u64);

impl SplitMix64 {
    fn next_u64(&mut self) -> u64 {
        self.0 = self.0.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.0;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }
}

/// Derive a deck seed from a session identifier and creation entropy.
///
/// A table recreated under the same identifier gets a different seed
/// because the entropy differs per creation.
pub fn derive_deck_seed(session_id: &str, entropy: u64) -> u64 {
    let digest = Sha256::new()
        .chain_update(DECK_SEED_DOMAIN)
        .chain_update(session_id.as_bytes())
        .chain_update(entropy.to_le_bytes())
        .finalize();

    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(head)
}
