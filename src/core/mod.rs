//! Core deterministic primitives.
//!
//! Randomness and hashing shared by the grid engine and the session layer.
//! Nothing here knows about cells, messages or peers.

pub mod rng;
pub mod hash;

// Re-export core types
pub use rng::{DeterministicRng, RandomSource, AuthoritySource, ReplaySource};
pub use hash::{StateHash, StateHasher, compute_board_hash};
