//! # Match-3 Duel
//!
//! Two-peer match-3 engine: a deterministic 8x7 grid plus the turn protocol
//! that keeps two independently running boards identical.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       MATCH-3 DUEL                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Deterministic primitives                  │
//! │  ├── rng.rs      - Xorshift128+ PRNG, authority/replay       │
//! │  └── hash.rs     - Board hashing for divergence checks       │
//! │                                                              │
//! │  game/           - Board logic (deterministic)               │
//! │  ├── cell.rs     - Positions, colors, bonuses, handles       │
//! │  └── grid.rs     - Swaps, matching, bonuses, gravity         │
//! │                                                              │
//! │  network/        - Peers (sockets only in link.rs)           │
//! │  ├── protocol.rs - Message types and JSON codec              │
//! │  ├── events.rs   - Session events and sink                   │
//! │  ├── session.rs  - Turn coordinator                          │
//! │  └── link.rs     - WebSocket host/join                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Single Authority
//!
//! Only the peer that makes a swap draws random numbers for it. The matched
//! cells, bonus placements, falls and spawned colors are sent as data, and
//! the other peer applies them through a replay source that hands back the
//! transmitted values. Each `auto_swap` also carries the full board so any
//! residual divergence is detected (by hash) and overwritten.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod network;

// Re-export commonly used types
pub use core::rng::{DeterministicRng, RandomSource, AuthoritySource, ReplaySource};
pub use game::cell::{Pos, Color, Bonus, Cell, CellHandle};
pub use game::grid::{GridEngine, BoardSnapshot, ROWS, COLS};
pub use network::session::{TurnCoordinator, SessionConfig, SessionState};
pub use network::events::{SessionEvent, EventSink};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
