//! Randomness Sources
//!
//! Uses Xorshift128+ for fast, deterministic randomness on the authority
//! peer, and a replay source that hands back values received over the wire
//! on the remote peer. Grid operations only ever see the [`RandomSource`]
//! trait, so the same code path serves both sides.

use std::collections::VecDeque;

use sha2::{Sha256, Digest};

/// Deterministic PRNG using Xorshift128+ algorithm.
///
/// # Determinism Guarantee
///
/// Given the same seed, this RNG will produce the exact same sequence
/// of random numbers on any platform.
///
/// # Example
///
/// ```
/// use match3_duel::core::rng::DeterministicRng;
///
/// let mut rng = DeterministicRng::new(12345);
/// let value = rng.next_u64();
/// assert_eq!(value, 6233086606872742541); // Always the same!
/// ```
#[derive(Clone, Debug)]
pub struct DeterministicRng {
    state: [u64; 2],
}

impl Default for DeterministicRng {
    fn default() -> Self {
        Self::new(0)
    }
}

impl DeterministicRng {
    /// Create a new RNG from a 64-bit seed.
    ///
    /// Uses SplitMix64 to initialize the internal state, ensuring
    /// good distribution even from weak seeds.
    pub fn new(seed: u64) -> Self {
        let mut s = seed;
        let state0 = splitmix64(&mut s);
        let state1 = splitmix64(&mut s);

        // Ensure state is never all zeros
        let state = if state0 == 0 && state1 == 0 {
            [1, 1]
        } else {
            [state0, state1]
        };

        Self { state }
    }

    /// Create an RNG for a fresh session.
    ///
    /// The seed is derived from the session id and the nicknames taking
    /// part, see [`derive_session_seed`].
    pub fn for_session(session_id: &[u8; 16], nicknames: &[String]) -> Self {
        Self::new(derive_session_seed(session_id, nicknames))
    }

    /// Generate the next 64-bit random value.
    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        let s0 = self.state[0];
        let mut s1 = self.state[1];
        let result = s0.wrapping_add(s1);

        s1 ^= s0;
        self.state[0] = s0.rotate_left(24) ^ s1 ^ (s1 << 16);
        self.state[1] = s1.rotate_left(37);

        result
    }

    /// Generate a random integer in range [0, max).
    #[inline]
    pub fn next_int(&mut self, max: u32) -> u32 {
        if max == 0 {
            return 0;
        }
        // Simple modulo - slight bias for very large max, but acceptable
        (self.next_u64() % max as u64) as u32
    }

    /// Shuffle a slice in place using Fisher-Yates algorithm.
    pub fn shuffle<T>(&mut self, slice: &mut [T]) {
        let len = slice.len();
        for i in (1..len).rev() {
            let j = self.next_int((i + 1) as u32) as usize;
            slice.swap(i, j);
        }
    }
}

/// SplitMix64 for seed initialization.
/// Produces well-distributed values from sequential seeds.
#[inline]
fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// Derive a session seed from the session id and the nicknames.
///
/// Nicknames are hashed in the order given; callers pass them exactly as
/// entered so a replay of the same session reproduces the same seed.
pub fn derive_session_seed(session_id: &[u8; 16], nicknames: &[String]) -> u64 {
    let mut hasher = Sha256::new();

    // Domain separator
    hasher.update(b"MATCH3_DUEL_SEED_V1");
    hasher.update(session_id);

    for name in nicknames {
        hasher.update((name.len() as u32).to_le_bytes());
        hasher.update(name.as_bytes());
    }

    let hash = hasher.finalize();
    let mut seed = [0u8; 8];
    seed.copy_from_slice(&hash[0..8]);
    u64::from_le_bytes(seed)
}

// =============================================================================
// RANDOM SOURCES
// =============================================================================

/// Where a grid operation gets its random values from.
///
/// The authority peer draws fresh values; the remote peer replays the values
/// the authority transmitted. Nothing else in the grid is random.
pub trait RandomSource {
    /// Draw a value in `[0, bound)`. A `bound` of 0 yields 0.
    fn draw(&mut self, bound: u32) -> u32;
}

/// Fresh randomness, used by the peer that resolves an action.
#[derive(Clone, Debug)]
pub struct AuthoritySource {
    rng: DeterministicRng,
    tape: Option<Vec<u32>>,
}

impl AuthoritySource {
    /// Wrap an RNG.
    pub fn new(rng: DeterministicRng) -> Self {
        Self { rng, tape: None }
    }

    /// Wrap an RNG and keep a copy of every value drawn.
    pub fn recording(rng: DeterministicRng) -> Self {
        Self { rng, tape: Some(Vec::new()) }
    }

    /// Shuffle through the underlying RNG (turn queue construction).
    pub fn shuffle<T>(&mut self, slice: &mut [T]) {
        self.rng.shuffle(slice);
    }

    /// Values drawn so far, if recording.
    pub fn tape(&self) -> Option<&[u32]> {
        self.tape.as_deref()
    }
}

impl RandomSource for AuthoritySource {
    fn draw(&mut self, bound: u32) -> u32 {
        let value = self.rng.next_int(bound);
        if let Some(tape) = self.tape.as_mut() {
            tape.push(value);
        }
        value
    }
}

/// Replays a pre-supplied sequence of values.
///
/// Values are clamped into the requested bound. Drawing past the end yields
/// 0 and is counted as an underrun so the caller can flag divergence.
#[derive(Clone, Debug, Default)]
pub struct ReplaySource {
    values: VecDeque<u32>,
    underruns: u32,
}

impl ReplaySource {
    /// Create from a sequence of values.
    pub fn new(values: impl IntoIterator<Item = u32>) -> Self {
        Self {
            values: values.into_iter().collect(),
            underruns: 0,
        }
    }

    /// Values not consumed yet.
    pub fn remaining(&self) -> usize {
        self.values.len()
    }

    /// Number of draws that found the sequence empty.
    pub fn underruns(&self) -> u32 {
        self.underruns
    }

    /// True when every value was consumed and no draw ran dry.
    pub fn is_exact(&self) -> bool {
        self.values.is_empty() && self.underruns == 0
    }
}

impl RandomSource for ReplaySource {
    fn draw(&mut self, bound: u32) -> u32 {
        match self.values.pop_front() {
            Some(value) if bound > 0 => value % bound,
            Some(_) => 0,
            None => {
                self.underruns += 1;
                0
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
