//! Game Logic Module
//!
//! The match-3 board. Deterministic given its random source.
//!
//! ## Module Structure
//!
//! - `cell`: Positions, colors, bonuses, cell handles
//! - `grid`: Grid engine (generation, swaps, matching, gravity)

pub mod cell;
pub mod grid;

// Re-export key types
pub use cell::{Pos, Color, Bonus, Cell, CellHandle, SnapshotError};
pub use grid::{GridEngine, SwapOutcome, GravityOutcome, BoardSnapshot, ROWS, COLS};
