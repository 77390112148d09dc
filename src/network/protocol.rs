//! Protocol Messages
//!
//! Wire format for peer-to-peer session traffic.
//! Every message is a JSON object whose `command` field names its kind;
//! field names rather than positions keep the traffic readable in logs.
//! Decoders ignore fields they do not know.

use serde::{Serialize, Deserialize};
use thiserror::Error;

use crate::game::cell::{Bonus, Cell, Color, Pos};
use crate::game::grid::{BoardSnapshot, BonusPlacement, Fall, Spawn};

/// Every command this version understands.
pub const COMMANDS: [&str; 6] = [
    "join",
    "start_game",
    "swap",
    "completed_swap",
    "auto_swap",
    "end_game",
];

// =============================================================================
// MESSAGES
// =============================================================================

/// Messages exchanged between the two peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Message {
    /// Joining peer announces itself to the host.
    Join {
        /// Joining player's nickname.
        nickname: String,
    },

    /// Host starts the session.
    StartGame(StartGameInfo),

    /// A player exchanged two cells.
    Swap {
        /// First cell, as it was before the exchange.
        a_lbl: CellDto,
        /// Second cell, as it was before the exchange.
        b_lbl: CellDto,
        /// Player whose turn it is now.
        next_player: String,
        /// Player who made the exchange.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        player: Option<String>,
    },

    /// Matches removed by the last exchange (or cascade wave).
    CompletedSwap {
        /// Matched positions as `[row, col]`, ascending.
        removed: Vec<[usize; 2]>,
        /// Bonus cells granted.
        bonuses: Vec<BonusDto>,
    },

    /// Gravity and refill after a removal.
    AutoSwap {
        /// Cells that fell, with their new slot.
        fallen: Vec<FallenDto>,
        /// Cells created at the top, in fill order.
        spawned: Vec<CellDto>,
        /// Full board after refill.
        board: BoardSnapshot,
    },

    /// Session is over.
    EndGame {
        /// Winning player's nickname.
        winner: String,
    },
}

/// Session parameters and opening board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartGameInfo {
    /// Turn or time mode.
    pub mode: GameMode,
    /// Turn order.
    pub queue_players: Vec<String>,
    /// Player who moves first.
    pub current_player: String,
    /// Nicknames as entered.
    pub nicknames: Vec<String>,
    /// Opening board.
    pub board: BoardSnapshot,
    /// Session length in seconds (time mode).
    pub time_limit: u32,
    /// Score that ends the session, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_score: Option<u32>,
}

/// Session modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameMode {
    /// Players alternate following the turn queue.
    Turn,
    /// Everyone may act at any time until the clock runs out.
    Time,
}

impl GameMode {
    /// Parse `turn` / `time`.
    pub fn parse(s: &str) -> Option<GameMode> {
        match s {
            "turn" => Some(GameMode::Turn),
            "time" => Some(GameMode::Time),
            _ => None,
        }
    }
}

/// A cell on the wire. `x` is the row, `y` the column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellDto {
    /// Row
    pub x: usize,
    /// Column
    pub y: usize,
    /// Color
    pub color: Color,
    /// Bonus
    pub bonus: Bonus,
}

impl CellDto {
    /// Describe `cell` sitting at `pos`.
    pub fn new(pos: Pos, cell: &Cell) -> Self {
        Self {
            x: pos.row,
            y: pos.col,
            color: cell.color,
            bonus: cell.bonus,
        }
    }

    /// Slot this cell refers to.
    pub fn pos(&self) -> Pos {
        Pos::new(self.x, self.y)
    }
}

impl From<&Spawn> for CellDto {
    fn from(spawn: &Spawn) -> Self {
        CellDto::new(spawn.pos, &spawn.cell)
    }
}

/// A fallen cell: its old slot plus where it landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallenDto {
    /// Cell at its old slot
    #[serde(flatten)]
    pub cell: CellDto,
    /// New row
    pub new_r: usize,
    /// New column
    pub new_c: usize,
}

impl FallenDto {
    /// Slot the cell landed in.
    pub fn to(&self) -> Pos {
        Pos::new(self.new_r, self.new_c)
    }
}

impl From<&Fall> for FallenDto {
    fn from(fall: &Fall) -> Self {
        Self {
            cell: CellDto::new(fall.from, &fall.cell),
            new_r: fall.to.row,
            new_c: fall.to.col,
        }
    }
}

/// A bonus placement on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BonusDto {
    /// Row
    pub r: usize,
    /// Column
    pub c: usize,
    /// Granted bonus
    pub bonus: Bonus,
}

impl From<&BonusPlacement> for BonusDto {
    fn from(placement: &BonusPlacement) -> Self {
        Self {
            r: placement.pos.row,
            c: placement.pos.col,
            bonus: placement.bonus,
        }
    }
}

impl From<&BonusDto> for BonusPlacement {
    fn from(dto: &BonusDto) -> Self {
        Self {
            pos: Pos::new(dto.r, dto.c),
            bonus: dto.bonus,
        }
    }
}

// =============================================================================
// CONSTRUCTORS
// =============================================================================

impl Message {
    /// Command tag of this message.
    pub fn command(&self) -> &'static str {
        match self {
            Message::Join { .. } => "join",
            Message::StartGame(_) => "start_game",
            Message::Swap { .. } => "swap",
            Message::CompletedSwap { .. } => "completed_swap",
            Message::AutoSwap { .. } => "auto_swap",
            Message::EndGame { .. } => "end_game",
        }
    }

    /// Build a `completed_swap` from engine output.
    pub fn completed_swap(removed: &[Pos], bonuses: &[BonusPlacement]) -> Self {
        Message::CompletedSwap {
            removed: removed.iter().map(|p| [p.row, p.col]).collect(),
            bonuses: bonuses.iter().map(BonusDto::from).collect(),
        }
    }

    /// Build an `auto_swap` from engine output.
    pub fn auto_swap(fallen: &[Fall], spawned: &[Spawn], board: BoardSnapshot) -> Self {
        Message::AutoSwap {
            fallen: fallen.iter().map(FallenDto::from).collect(),
            spawned: spawned.iter().map(CellDto::from).collect(),
            board,
        }
    }
}

// =============================================================================
// ENCODING
// =============================================================================

/// Errors decoding or encoding a message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Input is not a JSON object.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Object has no string `command` field.
    #[error("message has no command")]
    MissingCommand,

    /// Command is not one this version knows.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// Known command with missing or ill-typed fields.
    #[error("malformed {command} message: {reason}")]
    Malformed {
        /// Command tag
        command: String,
        /// Decoder message
        reason: String,
    },
}

/// Encode a message to JSON bytes.
pub fn encode(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    Ok(serde_json::to_vec(message)?)
}

/// Decode JSON bytes into a message.
///
/// The command tag is checked before the body so an unknown command can be
/// told apart from a broken known one.
pub fn decode(bytes: &[u8]) -> Result<Message, ProtocolError> {
    let value: serde_json::Value = serde_json::from_slice(bytes)?;

    let command = value
        .get("command")
        .and_then(serde_json::Value::as_str)
        .ok_or(ProtocolError::MissingCommand)?
        .to_string();

    if !COMMANDS.contains(&command.as_str()) {
        return Err(ProtocolError::UnknownCommand(command));
    }

    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed {
        command,
        reason: e.to_string(),
    })
}

impl Message {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, ProtocolError> {
        decode(s.as_bytes())
    }
}
