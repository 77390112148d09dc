//! Cell Definitions
//!
//! Positions, colors, bonuses and the cells that carry them, plus the short
//! text tokens used in board snapshots.

use serde::{Serialize, Deserialize};
use thiserror::Error;

use crate::game::grid::{ROWS, COLS};

// =============================================================================
// POSITION
// =============================================================================

/// A grid slot. Row 0 is the top row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pos {
    /// Row index (0 = top)
    pub row: usize,
    /// Column index (0 = left)
    pub col: usize,
}

impl Pos {
    /// Create a position.
    pub const fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }

    /// Whether this slot lies on the board.
    #[inline]
    pub fn in_bounds(self) -> bool {
        self.row < ROWS && self.col < COLS
    }

    /// Manhattan distance exactly 1.
    pub fn is_adjacent(self, other: Pos) -> bool {
        self.row.abs_diff(other.row) + self.col.abs_diff(other.col) == 1
    }
}

// =============================================================================
// COLOR
// =============================================================================

/// Tile color. Matching only ever compares colors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum Color {
    /// Red
    Red = 0,
    /// Green
    Green = 1,
    /// Blue
    Blue = 2,
    /// Yellow
    Yellow = 3,
}

impl Color {
    /// Every color, in index order.
    pub const ALL: [Color; 4] = [Color::Red, Color::Green, Color::Blue, Color::Yellow];

    /// Number of colors (bound for random draws).
    pub const COUNT: u32 = 4;

    /// Get color from index (0-3).
    pub fn from_index(index: u32) -> Option<Color> {
        Self::ALL.get(index as usize).copied()
    }

    /// Index used for random draws and hashing.
    #[inline]
    pub fn index(self) -> u32 {
        self as u32
    }

    /// Lowercase first letter.
    pub fn letter(self) -> char {
        match self {
            Color::Red => 'r',
            Color::Green => 'g',
            Color::Blue => 'b',
            Color::Yellow => 'y',
        }
    }

    /// Parse a lowercase first letter.
    pub fn from_letter(letter: char) -> Option<Color> {
        Self::ALL.into_iter().find(|c| c.letter() == letter)
    }
}

// =============================================================================
// BONUS
// =============================================================================

/// Bonus modifier carried by a cell on top of its color.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum Bonus {
    /// Plain cell
    #[default]
    None = 0,
    /// Granted by a run of five or more
    Bomb = 1,
    /// Horizontal rocket, granted by a run of four
    RocketH = 2,
    /// Vertical rocket, granted by a run of four
    RocketV = 3,
}

impl Bonus {
    /// Rocket for an axis draw: 0 is horizontal, anything else vertical.
    pub fn rocket(axis_draw: u32) -> Bonus {
        if axis_draw == 0 {
            Bonus::RocketH
        } else {
            Bonus::RocketV
        }
    }

    /// Whether this is either rocket.
    pub fn is_rocket(self) -> bool {
        matches!(self, Bonus::RocketH | Bonus::RocketV)
    }

    /// Snapshot mark, `None` for plain cells.
    pub fn mark(self) -> Option<char> {
        match self {
            Bonus::None => None,
            Bonus::Bomb => Some('B'),
            Bonus::RocketH => Some('h'),
            Bonus::RocketV => Some('v'),
        }
    }

    fn from_mark(mark: char) -> Option<Bonus> {
        match mark {
            'B' => Some(Bonus::Bomb),
            'h' => Some(Bonus::RocketH),
            'v' => Some(Bonus::RocketV),
            _ => None,
        }
    }
}

// =============================================================================
// CELL
// =============================================================================

/// Stable per-peer identity of a cell.
///
/// Assigned when the cell is created and kept through swaps and falls, so a
/// renderer can follow a tile without comparing references.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellHandle(pub u32);

/// A tile on the board.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    /// Stable handle
    pub handle: CellHandle,
    /// Color
    pub color: Color,
    /// Bonus modifier
    pub bonus: Bonus,
}

impl Cell {
    /// Create a plain cell.
    pub fn new(handle: CellHandle, color: Color) -> Self {
        Self { handle, color, bonus: Bonus::None }
    }

    /// Same color and bonus, ignoring the handle.
    pub fn same_face(&self, other: &Cell) -> bool {
        self.color == other.color && self.bonus == other.bonus
    }

    /// One-character rendering for logs: the bonus mark if any, else the
    /// color letter.
    pub fn glyph(&self) -> char {
        self.bonus.mark().unwrap_or_else(|| self.color.letter())
    }

    /// Snapshot token: color letter followed by the bonus mark.
    pub fn token(&self) -> String {
        let mut token = String::with_capacity(2);
        token.push(self.color.letter());
        if let Some(mark) = self.bonus.mark() {
            token.push(mark);
        }
        token
    }
}

/// Token for an empty slot.
pub const EMPTY_TOKEN: &str = ".";

/// Token for an optional slot.
pub fn slot_token(slot: Option<&Cell>) -> String {
    slot.map_or_else(|| EMPTY_TOKEN.to_string(), Cell::token)
}

/// Parse a snapshot token into color and bonus. `Ok(None)` is an empty slot.
pub fn parse_token(token: &str) -> Result<Option<(Color, Bonus)>, SnapshotError> {
    if token == EMPTY_TOKEN {
        return Ok(None);
    }

    let mut chars = token.chars();
    let color = chars
        .next()
        .and_then(Color::from_letter)
        .ok_or_else(|| SnapshotError::BadToken(token.to_string()))?;
    let bonus = match chars.next() {
        None => Bonus::None,
        Some(mark) => Bonus::from_mark(mark).ok_or_else(|| SnapshotError::BadToken(token.to_string()))?,
    };

    if chars.next().is_some() {
        return Err(SnapshotError::BadToken(token.to_string()));
    }

    Ok(Some((color, bonus)))
}

/// Errors loading a board snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    /// Token is not a color letter with an optional bonus mark.
    #[error("bad cell token {0:?}")]
    BadToken(String),

    /// Snapshot does not have the board's dimensions.
    #[error("snapshot shape mismatch at row {row}: expected {expected} entries, got {got}")]
    WrongShape {
        /// Row index, or the row count when the number of rows is wrong
        row: usize,
        /// Expected entries
        expected: usize,
        /// Entries present
        got: usize,
    },
}
