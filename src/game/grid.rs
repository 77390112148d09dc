//! Grid Engine
//!
//! The 8x7 match-3 board: swap validation, match detection, bonus creation,
//! gravity and refill. Every random value comes from the [`RandomSource`]
//! passed in, which is what lets the remote peer replay an authority's
//! result instead of rolling its own.
//!
//! ## Resolution
//!
//! A swap is resolved in two phases. First the full set of runs on the board
//! is collected and every bonus placement is decided; only then is the grid
//! mutated. Gravity and refill are a separate step so the caller can ship
//! each phase to the remote peer as its own message.

use std::collections::BTreeSet;

use serde::{Serialize, Deserialize};

use crate::core::hash::{StateHash, compute_board_hash};
use crate::core::rng::RandomSource;
use crate::game::cell::{
    Bonus, Cell, CellHandle, Color, Pos, SnapshotError,
    parse_token, slot_token,
};

/// Board height.
pub const ROWS: usize = 8;

/// Board width.
pub const COLS: usize = 7;

/// Shortest run that counts as a match.
pub const MIN_RUN: usize = 3;

/// Run length that grants a rocket.
pub const ROCKET_RUN: usize = 4;

/// Run length from which a bomb is granted.
pub const BOMB_RUN: usize = 5;

type Slots = [[Option<Cell>; COLS]; ROWS];

// =============================================================================
// RESULT TYPES
// =============================================================================

/// Direction of a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Axis {
    /// Along a row
    Horizontal,
    /// Along a column
    Vertical,
}

/// Maximal same-color sequence of at least [`MIN_RUN`] cells.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Run {
    /// Direction
    pub axis: Axis,
    /// Members, in increasing row/column order
    pub cells: Vec<Pos>,
}

impl Run {
    /// Number of cells.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Whether the run has no cells.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Whether `pos` is a member.
    pub fn contains(&self, pos: Pos) -> bool {
        self.cells.contains(&pos)
    }

    /// Middle member (upper middle for even lengths).
    pub fn midpoint(&self) -> Pos {
        self.cells[self.cells.len() / 2]
    }
}

/// A bonus granted to the cell at `pos`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BonusPlacement {
    /// Target cell
    pub pos: Pos,
    /// Granted bonus
    pub bonus: Bonus,
}

/// Result of a swap or a cascade wave.
///
/// Empty when the swap was rejected.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SwapOutcome {
    /// Every matched position, ascending. Includes bonus targets.
    pub matched: Vec<Pos>,
    /// One entry per run of four or more.
    pub bonuses: Vec<BonusPlacement>,
}

impl SwapOutcome {
    /// Whether anything matched.
    pub fn is_success(&self) -> bool {
        !self.matched.is_empty()
    }

    /// Number of cells actually removed from the board.
    pub fn cleared(&self) -> usize {
        self.matched.len() - self.bonuses.len()
    }
}

/// A surviving cell moved down by gravity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fall {
    /// The cell (handle preserved)
    pub cell: Cell,
    /// Slot before the fall
    pub from: Pos,
    /// Slot after the fall
    pub to: Pos,
}

/// A cell created by refill.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spawn {
    /// The new cell
    pub cell: Cell,
    /// Final slot
    pub pos: Pos,
}

/// Result of gravity and refill.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GravityOutcome {
    /// Cells that changed row
    pub fallen: Vec<Fall>,
    /// Fresh cells, in fill order (column by column, top down)
    pub spawned: Vec<Spawn>,
}

impl GravityOutcome {
    /// Colors of the spawned cells in fill order, as random draws.
    pub fn spawn_draws(&self) -> Vec<u32> {
        self.spawned.iter().map(|s| s.cell.color.index()).collect()
    }
}

/// Board as a grid of snapshot tokens, one inner vector per row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BoardSnapshot(pub Vec<Vec<String>>);

impl BoardSnapshot {
    /// Build from one string per row, each character a plain-cell token.
    ///
    /// Convenience for fixtures and logs; bonus cells need [`BoardSnapshot::from_tokens`].
    pub fn from_rows(rows: &[&str]) -> Self {
        Self(
            rows.iter()
                .map(|row| row.chars().map(|c| c.to_string()).collect())
                .collect(),
        )
    }

    /// Build from explicit tokens.
    pub fn from_tokens(rows: &[&[&str]]) -> Self {
        Self(
            rows.iter()
                .map(|row| row.iter().map(|t| t.to_string()).collect())
                .collect(),
        )
    }

    /// Hash of the board this snapshot describes.
    pub fn compute_hash(&self) -> Result<StateHash, SnapshotError> {
        Ok(GridEngine::from_snapshot(self)?.compute_hash())
    }
}

// =============================================================================
// GRID ENGINE
// =============================================================================

/// Owner of the board.
#[derive(Clone, Debug)]
pub struct GridEngine {
    slots: Slots,
    next_handle: u32,
}

impl Default for GridEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl GridEngine {
    /// Create an empty board. Call [`GridEngine::generate_initial`] or
    /// [`GridEngine::load_snapshot`] before playing on it.
    pub fn new() -> Self {
        Self {
            slots: [[None; COLS]; ROWS],
            next_handle: 0,
        }
    }

    /// Create a freshly generated board.
    pub fn generate<R: RandomSource + ?Sized>(rng: &mut R) -> Self {
        let mut grid = Self::new();
        grid.generate_initial(rng);
        grid
    }

    /// Create from a snapshot.
    pub fn from_snapshot(snapshot: &BoardSnapshot) -> Result<Self, SnapshotError> {
        let mut grid = Self::new();
        grid.load_snapshot(snapshot)?;
        Ok(grid)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Cell at (row, col), `None` when empty or out of bounds.
    pub fn cell(&self, row: usize, col: usize) -> Option<Cell> {
        self.at(Pos::new(row, col))
    }

    /// Cell at a position, `None` when empty or out of bounds.
    pub fn at(&self, pos: Pos) -> Option<Cell> {
        if pos.in_bounds() {
            self.slots[pos.row][pos.col]
        } else {
            None
        }
    }

    /// Whether every slot holds a cell.
    pub fn is_full(&self) -> bool {
        self.slots.iter().flatten().all(Option::is_some)
    }

    /// All runs currently on the board: horizontal runs by row, then
    /// vertical runs by column.
    pub fn runs(&self) -> Vec<Run> {
        find_runs(&self.slots)
    }

    /// First adjacent exchange that would create a match.
    ///
    /// Scans row-major, probing the right neighbour before the one below.
    pub fn find_move(&self) -> Option<(Pos, Pos)> {
        for row in 0..ROWS {
            for col in 0..COLS {
                let here = Pos::new(row, col);
                if col + 1 < COLS && self.would_match(here, Pos::new(row, col + 1)) {
                    return Some((here, Pos::new(row, col + 1)));
                }
                if row + 1 < ROWS && self.would_match(here, Pos::new(row + 1, col)) {
                    return Some((here, Pos::new(row + 1, col)));
                }
            }
        }
        None
    }

    /// Whether any adjacent exchange would create a match.
    pub fn has_move(&self) -> bool {
        self.find_move().is_some()
    }

    /// Probe an exchange without touching the board.
    pub fn would_match(&self, a: Pos, b: Pos) -> bool {
        if !a.in_bounds() || !b.in_bounds() {
            return false;
        }
        let mut scratch = self.slots;
        swap_slots(&mut scratch, a, b);
        touches_run(&scratch, &[a, b])
    }

    /// Hash of colors and bonuses (handles excluded).
    pub fn compute_hash(&self) -> StateHash {
        compute_board_hash(ROWS, COLS, |hasher| {
            for slot in self.slots.iter().flatten() {
                match slot {
                    Some(cell) => {
                        hasher.update_u8(cell.color as u8);
                        hasher.update_u8(cell.bonus as u8);
                    }
                    None => hasher.update_u8(0xFF),
                }
            }
        })
    }

    /// Token grid of the board.
    pub fn snapshot(&self) -> BoardSnapshot {
        BoardSnapshot(
            self.slots
                .iter()
                .map(|row| row.iter().map(|slot| slot_token(slot.as_ref())).collect())
                .collect(),
        )
    }

    /// One glyph per cell, rows separated by newlines.
    pub fn render(&self) -> String {
        self.slots
            .iter()
            .map(|row| {
                row.iter()
                    .map(|slot| slot.map_or('.', |cell| cell.glyph()))
                    .collect::<String>()
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    // -------------------------------------------------------------------------
    // Generation
    // -------------------------------------------------------------------------

    /// Fill the board with random colors until it has no match and at least
    /// one available move.
    ///
    /// Rejection sampling: unbounded in principle, terminates with
    /// probability 1.
    pub fn generate_initial<R: RandomSource + ?Sized>(&mut self, rng: &mut R) {
        loop {
            for row in 0..ROWS {
                for col in 0..COLS {
                    let cell = self.spawn(rng);
                    self.slots[row][col] = Some(cell);
                }
            }
            if find_runs(&self.slots).is_empty() && self.has_move() {
                break;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Authority operations
    // -------------------------------------------------------------------------

    /// Exchange `a` and `b` and resolve the matches this creates.
    ///
    /// Adjacency is the caller's concern. When the exchange creates no run
    /// through either position it is undone and an empty outcome returned.
    /// Otherwise every run on the board is resolved: runs of four or more
    /// leave one bonus cell (on the swapped cell when it is a member, else
    /// on the run midpoint) and all other matched cells are cleared.
    pub fn swap<R: RandomSource + ?Sized>(&mut self, a: Pos, b: Pos, rng: &mut R) -> SwapOutcome {
        if a == b || !a.in_bounds() || !b.in_bounds() {
            return SwapOutcome::default();
        }

        swap_slots(&mut self.slots, a, b);
        if !touches_run(&self.slots, &[a, b]) {
            swap_slots(&mut self.slots, a, b);
            return SwapOutcome::default();
        }

        self.resolve(&[a, b], rng)
    }

    /// Resolve whatever runs are on the board without a swap.
    ///
    /// Used for cascades after refill; bonus targets are run midpoints.
    pub fn clear_matches<R: RandomSource + ?Sized>(&mut self, rng: &mut R) -> SwapOutcome {
        self.resolve(&[], rng)
    }

    /// Compact every column downward and refill from the top.
    pub fn collapse_and_fill<R: RandomSource + ?Sized>(&mut self, rng: &mut R) -> GravityOutcome {
        let mut outcome = GravityOutcome::default();

        for col in 0..COLS {
            let mut write = ROWS;
            for read in (0..ROWS).rev() {
                if let Some(cell) = self.slots[read][col] {
                    write -= 1;
                    if read != write {
                        self.slots[write][col] = Some(cell);
                        self.slots[read][col] = None;
                        outcome.fallen.push(Fall {
                            cell,
                            from: Pos::new(read, col),
                            to: Pos::new(write, col),
                        });
                    }
                }
            }
        }

        for col in 0..COLS {
            for row in 0..ROWS {
                if self.slots[row][col].is_none() {
                    let cell = self.spawn(rng);
                    self.slots[row][col] = Some(cell);
                    outcome.spawned.push(Spawn { cell, pos: Pos::new(row, col) });
                }
            }
        }

        outcome
    }

    // -------------------------------------------------------------------------
    // Replay operations
    // -------------------------------------------------------------------------

    /// Unconditionally exchange two cells. Returns false if either position
    /// is off the board.
    pub fn exchange(&mut self, a: Pos, b: Pos) -> bool {
        if !a.in_bounds() || !b.in_bounds() {
            return false;
        }
        swap_slots(&mut self.slots, a, b);
        true
    }

    /// Apply a resolution computed elsewhere.
    ///
    /// Every position in `removed` not named by a bonus is cleared; bonus
    /// targets keep their color and take the given bonus. Off-board
    /// positions are skipped. Returns the number of cells cleared.
    pub fn apply_removal(&mut self, removed: &[Pos], bonuses: &[BonusPlacement]) -> usize {
        let targets: BTreeSet<Pos> = bonuses.iter().map(|b| b.pos).collect();
        let mut cleared = 0;

        for pos in removed.iter().filter(|p| p.in_bounds() && !targets.contains(p)) {
            if self.slots[pos.row][pos.col].take().is_some() {
                cleared += 1;
            }
        }

        for placement in bonuses.iter().filter(|b| b.pos.in_bounds()) {
            if let Some(cell) = self.slots[placement.pos.row][placement.pos.col].as_mut() {
                cell.bonus = placement.bonus;
            }
        }

        cleared
    }

    /// Overwrite the board with a snapshot.
    ///
    /// Slots whose color and bonus are unchanged keep their handle; anything
    /// else gets a fresh one. The board is untouched on error.
    pub fn load_snapshot(&mut self, snapshot: &BoardSnapshot) -> Result<(), SnapshotError> {
        if snapshot.0.len() != ROWS {
            return Err(SnapshotError::WrongShape {
                row: snapshot.0.len(),
                expected: ROWS,
                got: snapshot.0.len(),
            });
        }

        let mut parsed = [[None; COLS]; ROWS];
        for (row, tokens) in snapshot.0.iter().enumerate() {
            if tokens.len() != COLS {
                return Err(SnapshotError::WrongShape { row, expected: COLS, got: tokens.len() });
            }
            for (col, token) in tokens.iter().enumerate() {
                parsed[row][col] = parse_token(token)?;
            }
        }

        for (row, parsed_row) in parsed.iter().enumerate() {
            for (col, face) in parsed_row.iter().enumerate() {
                let slot = match *face {
                    None => None,
                    Some((color, bonus)) => {
                        let face = Cell { handle: CellHandle(0), color, bonus };
                        match self.slots[row][col] {
                            Some(cell) if cell.same_face(&face) => Some(cell),
                            _ => Some(Cell { handle: self.next_handle(), ..face }),
                        }
                    }
                };
                self.slots[row][col] = slot;
            }
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn next_handle(&mut self) -> CellHandle {
        let handle = CellHandle(self.next_handle);
        self.next_handle = self.next_handle.wrapping_add(1);
        handle
    }

    fn spawn<R: RandomSource + ?Sized>(&mut self, rng: &mut R) -> Cell {
        let color = Color::from_index(rng.draw(Color::COUNT)).unwrap_or(Color::Red);
        Cell::new(self.next_handle(), color)
    }

    fn resolve<R: RandomSource + ?Sized>(&mut self, preferred: &[Pos], rng: &mut R) -> SwapOutcome {
        let runs = find_runs(&self.slots);
        if runs.is_empty() {
            return SwapOutcome::default();
        }

        // Phase 1: decide everything.
        let matched: BTreeSet<Pos> = runs.iter().flat_map(|r| r.cells.iter().copied()).collect();
        let mut bonuses: Vec<BonusPlacement> = Vec::new();

        for run in runs.iter().filter(|r| r.len() >= ROCKET_RUN) {
            let taken = |pos: &Pos| bonuses.iter().any(|b| b.pos == *pos);
            let target = preferred
                .iter()
                .copied()
                .find(|p| run.contains(*p) && !taken(p))
                .or_else(|| Some(run.midpoint()).filter(|p| !taken(p)))
                .or_else(|| run.cells.iter().copied().find(|p| !taken(p)));

            let Some(pos) = target else { continue };
            let bonus = if run.len() >= BOMB_RUN {
                Bonus::Bomb
            } else {
                Bonus::rocket(rng.draw(2))
            };
            bonuses.push(BonusPlacement { pos, bonus });
        }

        // Phase 2: mutate.
        let matched: Vec<Pos> = matched.into_iter().collect();
        self.apply_removal(&matched, &bonuses);

        SwapOutcome { matched, bonuses }
    }
}

// =============================================================================
// SLOT HELPERS
// =============================================================================

fn swap_slots(slots: &mut Slots, a: Pos, b: Pos) {
    let first = slots[a.row][a.col];
    slots[a.row][a.col] = slots[b.row][b.col];
    slots[b.row][b.col] = first;
}

fn color_at(slots: &Slots, row: usize, col: usize) -> Option<Color> {
    slots[row][col].map(|cell| cell.color)
}

/// Length of the same-color line through `pos` along (dr, dc).
fn line_length(slots: &Slots, pos: Pos, dr: isize, dc: isize) -> usize {
    let Some(color) = color_at(slots, pos.row, pos.col) else {
        return 0;
    };

    let mut count = 1;
    for sign in [1isize, -1] {
        let mut row = pos.row as isize + dr * sign;
        let mut col = pos.col as isize + dc * sign;
        while (0..ROWS as isize).contains(&row)
            && (0..COLS as isize).contains(&col)
            && color_at(slots, row as usize, col as usize) == Some(color)
        {
            count += 1;
            row += dr * sign;
            col += dc * sign;
        }
    }
    count
}

/// Whether a run of at least [`MIN_RUN`] passes through any of `positions`.
fn touches_run(slots: &Slots, positions: &[Pos]) -> bool {
    positions.iter().any(|&pos| {
        line_length(slots, pos, 0, 1) >= MIN_RUN || line_length(slots, pos, 1, 0) >= MIN_RUN
    })
}

fn find_runs(slots: &Slots) -> Vec<Run> {
    let mut runs = Vec::new();

    for row in 0..ROWS {
        collect_line(&mut runs, Axis::Horizontal, (0..COLS).map(|col| Pos::new(row, col)), slots);
    }
    for col in 0..COLS {
        collect_line(&mut runs, Axis::Vertical, (0..ROWS).map(|row| Pos::new(row, col)), slots);
    }

    runs
}

fn collect_line(runs: &mut Vec<Run>, axis: Axis, line: impl Iterator<Item = Pos>, slots: &Slots) {
    let mut current: Vec<Pos> = Vec::new();
    let mut current_color: Option<Color> = None;

    for pos in line {
        let color = color_at(slots, pos.row, pos.col);
        if color.is_some() && color == current_color {
            current.push(pos);
            continue;
        }
        if current.len() >= MIN_RUN {
            runs.push(Run { axis, cells: std::mem::take(&mut current) });
        }
        current.clear();
        current.push(pos);
        current_color = color;
    }

    if current.len() >= MIN_RUN {
        runs.push(Run { axis, cells: current });
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::rng::{AuthoritySource, DeterministicRng, ReplaySource};
    use proptest::prelude::*;

    /// Run-free base pattern used by most fixtures.
    const BASE: [&str; ROWS] = [
        "rbrbrbr",
        "gygygyg",
        "brbrbrb",
        "ygygygy",
        "rbrbrbr",
        "gygygyg",
        "brbrbrb",
        "ygygygy",
    ];

    fn grid(rows: &[&str]) -> GridEngine {
        GridEngine::from_snapshot(&BoardSnapshot::from_rows(rows)).unwrap()
    }

    fn colors(grid: &GridEngine) -> Vec<Option<(Color, Bonus)>> {
        (0..ROWS)
            .flat_map(|r| (0..COLS).map(move |c| (r, c)))
            .map(|(r, c)| grid.cell(r, c).map(|cell| (cell.color, cell.bonus)))
            .collect()
    }

    fn authority(seed: u64) -> AuthoritySource {
        AuthoritySource::recording(DeterministicRng::new(seed))
    }

    #[test]
    fn test_base_fixture_has_no_runs() {
        assert!(grid(&BASE).runs().is_empty());
    }

    #[test]
    fn test_generate_initial_invariants() {
        for seed in 0..50 {
            let g = GridEngine::generate(&mut authority(seed));
            assert!(g.is_full());
            assert!(g.runs().is_empty(), "seed {seed} produced a run");
            assert!(g.has_move(), "seed {seed} produced a dead board");
        }
    }

    #[test]
    fn test_rejected_swap_leaves_board_identical() {
        let mut g = grid(&BASE);
        let before = colors(&g);
        let handles_before = g.cell(0, 0).map(|c| c.handle);

        let outcome = g.swap(Pos::new(0, 0), Pos::new(0, 1), &mut authority(1));

        assert!(!outcome.is_success());
        assert_eq!(outcome, SwapOutcome::default());
        assert_eq!(colors(&g), before);
        assert_eq!(g.cell(0, 0).map(|c| c.handle), handles_before);
    }

    #[test]
    fn test_run_of_three() {
        // The y at (6,1) drops into row 7 next to two more.
        let mut rows = BASE;
        rows[6] = "bybrbrb";
        rows[7] = "ygyrygy";
        let mut g = grid(&rows);
        assert!(g.runs().is_empty());

        let outcome = g.swap(Pos::new(6, 1), Pos::new(7, 1), &mut authority(2));

        assert_eq!(outcome.matched, vec![Pos::new(7, 0), Pos::new(7, 1), Pos::new(7, 2)]);
        assert!(outcome.bonuses.is_empty());
        assert_eq!(outcome.cleared(), 3);
        assert!(g.cell(7, 0).is_none());
        assert!(g.cell(7, 1).is_none());
        assert!(g.cell(7, 2).is_none());
    }

    #[test]
    fn test_run_of_four_places_rocket_on_swapped_cell() {
        // Row 7: y y . y with the missing y sitting above at (6,2).
        let mut rows = BASE;
        rows[6] = "brybrbr";
        rows[7] = "yyryrgr";
        let mut g = grid(&rows);
        assert!(g.runs().is_empty());

        let mut rng = authority(3);
        let outcome = g.swap(Pos::new(6, 2), Pos::new(7, 2), &mut rng);

        assert_eq!(outcome.matched.len(), 4);
        assert_eq!(outcome.cleared(), 3);
        assert_eq!(outcome.bonuses.len(), 1);
        let placement = outcome.bonuses[0];
        assert_eq!(placement.pos, Pos::new(7, 2));
        assert!(placement.bonus.is_rocket());

        let bonus_cell = g.cell(7, 2).unwrap();
        assert_eq!(bonus_cell.color, Color::Yellow);
        assert_eq!(bonus_cell.bonus, placement.bonus);
        assert!(g.cell(7, 0).is_none() && g.cell(7, 1).is_none() && g.cell(7, 3).is_none());

        // Exactly one axis draw was made.
        assert_eq!(rng.tape().unwrap().len(), 1);

        let gravity = g.collapse_and_fill(&mut rng);
        assert_eq!(gravity.spawned.len(), 3);
        let spawned: Vec<Pos> = gravity.spawned.iter().map(|s| s.pos).collect();
        assert_eq!(spawned, vec![Pos::new(0, 0), Pos::new(0, 1), Pos::new(0, 3)]);
        assert_eq!(gravity.fallen.len(), 21);
        assert!(g.is_full());
    }

    #[test]
    fn test_run_of_five_places_bomb() {
        // Row 7: y y . y y; the y above (7,2) completes five.
        let mut rows = BASE;
        rows[6] = "brybrbr";
        rows[7] = "yyryygr";
        let mut g = grid(&rows);
        assert!(g.runs().is_empty());

        let outcome = g.swap(Pos::new(6, 2), Pos::new(7, 2), &mut authority(4));

        assert_eq!(outcome.matched.len(), 5);
        assert_eq!(outcome.bonuses, vec![BonusPlacement { pos: Pos::new(7, 2), bonus: Bonus::Bomb }]);
        assert_eq!(g.cell(7, 2).unwrap().bonus, Bonus::Bomb);
        assert_eq!(outcome.cleared(), 4);
    }

    #[test]
    fn test_swap_bomb_away_from_swapped_cells_uses_midpoint() {
        // Row 0 already holds five blues; the swap only completes row 7.
        let mut rows = BASE;
        rows[0] = "bbbbbrr";
        rows[6] = "bybrbrb";
        rows[7] = "ygyrygy";
        let mut g = grid(&rows);
        let runs = g.runs();
        assert_eq!(runs.len(), 1);
        let bomb_run = runs[0].clone();
        assert!(!bomb_run.contains(Pos::new(6, 1)) && !bomb_run.contains(Pos::new(7, 1)));

        let outcome = g.swap(Pos::new(6, 1), Pos::new(7, 1), &mut authority(8));

        assert_eq!(outcome.bonuses, vec![BonusPlacement { pos: bomb_run.midpoint(), bonus: Bonus::Bomb }]);
        assert_eq!(bomb_run.midpoint(), Pos::new(0, 2));
        assert_eq!(outcome.matched.len(), 8);
        assert_eq!(outcome.cleared(), 7);
        assert_eq!(g.cell(0, 2).unwrap().bonus, Bonus::Bomb);
        assert!(g.cell(7, 1).is_none());
    }

    #[test]
    fn test_sideways_swap_completes_column_of_four() {
        // Moving the b at (4,3) left joins b's above and below in column 2.
        let mut rows = BASE;
        rows[2] = "brgrbrb";
        rows[3] = "ygbgygy";
        rows[5] = "gybygyg";
        let mut g = grid(&rows);
        assert!(g.runs().is_empty());

        let mut rng = authority(9);
        let outcome = g.swap(Pos::new(4, 2), Pos::new(4, 3), &mut rng);

        assert_eq!(
            outcome.matched,
            vec![Pos::new(3, 2), Pos::new(4, 2), Pos::new(5, 2), Pos::new(6, 2)]
        );
        assert_eq!(outcome.cleared(), 3);
        assert_eq!(outcome.bonuses.len(), 1);
        assert_eq!(outcome.bonuses[0].pos, Pos::new(4, 2));
        assert!(outcome.bonuses[0].bonus.is_rocket());
        assert_eq!(g.cell(4, 3).unwrap().color, Color::Red);

        let rocket = g.cell(4, 2).unwrap();
        let gravity = g.collapse_and_fill(&mut rng);
        let spawned: Vec<Pos> = gravity.spawned.iter().map(|s| s.pos).collect();
        assert_eq!(spawned, vec![Pos::new(0, 2), Pos::new(1, 2), Pos::new(2, 2)]);
        assert_eq!(gravity.fallen.len(), 4);
        assert_eq!(g.cell(6, 2).map(|c| c.handle), Some(rocket.handle));
        assert!(g.is_full());
    }

    #[test]
    fn test_cascade_bonus_goes_to_midpoint() {
        // Without a swapped cell the rocket lands on the run midpoint.
        let mut rows = BASE;
        rows[0] = "ggggrbr";
        let mut g = grid(&rows);
        assert_eq!(g.runs().len(), 1);

        let mut rng = authority(5);
        let outcome = g.clear_matches(&mut rng);

        assert_eq!(outcome.matched.len(), 4);
        assert_eq!(outcome.bonuses.len(), 1);
        assert_eq!(outcome.bonuses[0].pos, Pos::new(0, 2));
    }

    #[test]
    fn test_swap_resolves_board_wide() {
        // A pre-existing run elsewhere is swept up by a valid swap.
        let mut rows = BASE;
        rows[0] = "rrrbrbr";
        rows[6] = "bybrbrb";
        rows[7] = "ygyrygy";
        let mut g = grid(&rows);

        let outcome = g.swap(Pos::new(6, 1), Pos::new(7, 1), &mut authority(6));

        assert_eq!(outcome.matched.len(), 6);
        assert!(outcome.matched.contains(&Pos::new(0, 0)));
        assert!(outcome.matched.contains(&Pos::new(7, 2)));
        // Ascending order
        let mut sorted = outcome.matched.clone();
        sorted.sort();
        assert_eq!(outcome.matched, sorted);
    }

    #[test]
    fn test_crossing_runs_get_distinct_targets() {
        // Column 2 already holds g g g in rows 5-7. Dropping the g at (3,2)
        // into (4,2) completes a horizontal four in row 4 and stretches the
        // column run to four. The swapped cell serves the horizontal run; the
        // vertical run falls back to its midpoint.
        let rows = [
            "rbrbrbr",
            "gygygyg",
            "brbrbrb",
            "yrgyryr",
            "ggrgbrb",
            "rygbgyg",
            "bygrbrb",
            "ybgrygy",
        ];
        let mut g = grid(&rows);
        let mut rng = authority(7);

        let outcome = g.swap(Pos::new(3, 2), Pos::new(4, 2), &mut rng);

        assert_eq!(outcome.matched.len(), 7);
        let targets: Vec<Pos> = outcome.bonuses.iter().map(|b| b.pos).collect();
        assert_eq!(targets, vec![Pos::new(4, 2), Pos::new(6, 2)]);
        assert!(outcome.bonuses.iter().all(|b| b.bonus.is_rocket()));
        assert_eq!(outcome.cleared(), 5);
        assert_eq!(rng.tape().unwrap().len(), 2);
        assert!(g.cell(5, 2).is_none());
        assert_eq!(g.cell(6, 2).unwrap().color, Color::Green);
    }

    #[test]
    fn test_apply_removal_matches_authority() {
        let mut rows = BASE;
        rows[6] = "brybrbr";
        rows[7] = "yyryrgr";
        let mut authority_grid = grid(&rows);
        let mut remote_grid = grid(&rows);

        let outcome = authority_grid.swap(Pos::new(6, 2), Pos::new(7, 2), &mut authority(8));
        remote_grid.exchange(Pos::new(6, 2), Pos::new(7, 2));
        let cleared = remote_grid.apply_removal(&outcome.matched, &outcome.bonuses);

        assert_eq!(cleared, outcome.cleared());
        assert_eq!(colors(&remote_grid), colors(&authority_grid));
    }

    #[test]
    fn test_replayed_gravity_matches_authority() {
        let mut rows = BASE;
        rows[6] = "bybrbrb";
        rows[7] = "ygyrygy";
        let mut authority_grid = grid(&rows);
        let mut remote_grid = grid(&rows);
        let mut rng = authority(9);

        let outcome = authority_grid.swap(Pos::new(6, 1), Pos::new(7, 1), &mut rng);
        let gravity = authority_grid.collapse_and_fill(&mut rng);

        remote_grid.exchange(Pos::new(6, 1), Pos::new(7, 1));
        remote_grid.apply_removal(&outcome.matched, &outcome.bonuses);
        let mut replay = ReplaySource::new(gravity.spawn_draws());
        let replayed = remote_grid.collapse_and_fill(&mut replay);

        assert!(replay.is_exact());
        assert_eq!(replayed.spawned.len(), gravity.spawned.len());
        assert_eq!(remote_grid.compute_hash(), authority_grid.compute_hash());
        assert_eq!(remote_grid.snapshot(), authority_grid.snapshot());
    }

    #[test]
    fn test_handles_survive_gravity() {
        let mut rows = BASE;
        rows[6] = "bybrbrb";
        rows[7] = "ygyrygy";
        let mut g = grid(&rows);
        let falling = g.cell(5, 0).unwrap().handle;

        g.swap(Pos::new(6, 1), Pos::new(7, 1), &mut authority(10));
        let gravity = g.collapse_and_fill(&mut authority(11));

        let fall = gravity.fallen.iter().find(|f| f.cell.handle == falling).unwrap();
        assert_eq!(fall.from, Pos::new(5, 0));
        assert_eq!(fall.to, Pos::new(6, 0));
        assert_eq!(g.cell(6, 0).unwrap().handle, falling);
    }

    #[test]
    fn test_snapshot_roundtrip_keeps_bonuses() {
        let snapshot = BoardSnapshot::from_tokens(&[
            &["rB", "b", "r", "b", "r", "b", "r"],
            &["g", "yh", "g", "y", "g", "y", "g"],
            &["b", "r", "bv", "r", "b", "r", "b"],
            &["y", "g", "y", "g", "y", "g", "y"],
            &["r", "b", "r", "b", "r", "b", "r"],
            &["g", "y", "g", "y", "g", "y", "g"],
            &["b", "r", "b", "r", "b", "r", "b"],
            &["y", "g", "y", "g", "y", "g", "."],
        ]);
        let g = GridEngine::from_snapshot(&snapshot).unwrap();

        assert_eq!(g.cell(0, 0).unwrap().bonus, Bonus::Bomb);
        assert_eq!(g.cell(1, 1).unwrap().bonus, Bonus::RocketH);
        assert!(g.cell(7, 6).is_none());
        assert_eq!(g.snapshot(), snapshot);
        assert_eq!(g.render().lines().next(), Some("Bbrbrbr"));
    }

    #[test]
    fn test_load_snapshot_rejects_bad_shape() {
        let mut g = grid(&BASE);
        let before = colors(&g);

        let short = BoardSnapshot::from_rows(&BASE[..7]);
        assert!(matches!(g.load_snapshot(&short), Err(SnapshotError::WrongShape { .. })));

        let mut rows = BASE;
        rows[3] = "ygygyg";
        assert!(matches!(
            g.load_snapshot(&BoardSnapshot::from_rows(&rows)),
            Err(SnapshotError::WrongShape { row: 3, .. })
        ));

        let mut rows = BASE;
        rows[2] = "brbrbrx";
        assert!(g.load_snapshot(&BoardSnapshot::from_rows(&rows)).is_err());

        assert_eq!(colors(&g), before);
    }

    #[test]
    fn test_load_snapshot_keeps_unchanged_handles() {
        let mut g = grid(&BASE);
        let kept = g.cell(0, 0).unwrap().handle;
        let replaced = g.cell(0, 1).unwrap().handle;

        let mut rows = BASE;
        rows[0] = "rgrbrbr";
        g.load_snapshot(&BoardSnapshot::from_rows(&rows)).unwrap();

        assert_eq!(g.cell(0, 0).unwrap().handle, kept);
        assert_ne!(g.cell(0, 1).unwrap().handle, replaced);
        assert_eq!(g.cell(0, 1).unwrap().color, Color::Green);
    }

    #[test]
    fn test_find_move() {
        assert_eq!(grid(&BASE).find_move(), None);

        let mut rows = BASE;
        rows[6] = "bybrbrb";
        rows[7] = "ygyrygy";
        let g = grid(&rows);
        assert_eq!(g.find_move(), Some((Pos::new(6, 1), Pos::new(7, 1))));
        assert!(g.would_match(Pos::new(6, 1), Pos::new(7, 1)));
    }

    proptest! {
        #[test]
        fn prop_generated_boards_are_playable(seed in any::<u64>()) {
            let g = GridEngine::generate(&mut AuthoritySource::new(DeterministicRng::new(seed)));
            prop_assert!(g.runs().is_empty());
            prop_assert!(g.has_move());
        }

        #[test]
        fn prop_gravity_leaves_no_gaps(seed in any::<u64>(), holes in proptest::collection::vec((0..ROWS, 0..COLS), 0..20)) {
            let mut rng = AuthoritySource::new(DeterministicRng::new(seed));
            let mut g = GridEngine::generate(&mut rng);
            let removed: Vec<Pos> = holes.iter().map(|&(r, c)| Pos::new(r, c)).collect();
            let unique: BTreeSet<Pos> = removed.iter().copied().collect();

            // Survivor handles per column, bottom up.
            let survivors = |g: &GridEngine, col: usize| -> Vec<CellHandle> {
                (0..ROWS).rev().filter_map(|r| g.cell(r, col)).map(|c| c.handle).collect()
            };

            prop_assert_eq!(g.apply_removal(&removed, &[]), unique.len());
            let before: Vec<Vec<CellHandle>> = (0..COLS).map(|c| survivors(&g, c)).collect();

            let outcome = g.collapse_and_fill(&mut rng);
            prop_assert_eq!(outcome.spawned.len(), unique.len());
            prop_assert!(g.is_full());

            for col in 0..COLS {
                let kept = &before[col];
                // Survivors sit in the bottom rows, in their original order.
                let bottom: Vec<CellHandle> = (ROWS - kept.len()..ROWS)
                    .rev()
                    .map(|r| g.cell(r, col).unwrap().handle)
                    .collect();
                prop_assert_eq!(&bottom, kept);
                // Spawns fill exactly the rows above them.
                let spawned_rows: Vec<usize> = outcome.spawned.iter()
                    .filter(|s| s.pos.col == col)
                    .map(|s| s.pos.row)
                    .collect();
                prop_assert_eq!(spawned_rows, (0..ROWS - kept.len()).collect::<Vec<_>>());
            }
        }

        #[test]
        fn prop_one_bonus_per_long_run(seed in any::<u64>()) {
            let g = GridEngine::generate(&mut AuthoritySource::new(DeterministicRng::new(seed)));
            let moves: Vec<(Pos, Pos)> = (0..ROWS)
                .flat_map(|r| (0..COLS).map(move |c| Pos::new(r, c)))
                .flat_map(|p| [(p, Pos::new(p.row, p.col + 1)), (p, Pos::new(p.row + 1, p.col))])
                .filter(|&(a, b)| g.would_match(a, b))
                .collect();

            for (a, b) in moves {
                let mut exchanged = g.clone();
                exchanged.exchange(a, b);
                let long: Vec<Run> = exchanged.runs().into_iter().filter(|r| r.len() >= ROCKET_RUN).collect();

                let mut played = g.clone();
                let outcome = played.swap(a, b, &mut AuthoritySource::new(DeterministicRng::new(seed)));
                prop_assert_eq!(outcome.bonuses.len(), long.len());

                for (i, (run, placement)) in long.iter().zip(&outcome.bonuses).enumerate() {
                    let earlier = &outcome.bonuses[..i];
                    let free = |p: &Pos| earlier.iter().all(|b| b.pos != *p);
                    prop_assert!(run.contains(placement.pos));
                    prop_assert_eq!(placement.bonus == Bonus::Bomb, run.len() >= BOMB_RUN);
                    match [a, b].into_iter().find(|p| run.contains(*p) && free(p)) {
                        Some(swapped) => {
                            prop_assert_eq!(placement.pos, swapped);
                        }
                        None if free(&run.midpoint()) => {
                            prop_assert_eq!(placement.pos, run.midpoint());
                        }
                        None => {}
                    }
                    prop_assert_eq!(played.cell(placement.pos.row, placement.pos.col).map(|c| c.bonus), Some(placement.bonus));
                }
            }
        }

        #[test]
        fn prop_failed_swap_is_identity(seed in any::<u64>(), row in 0..ROWS, col in 0..COLS - 1) {
            let mut rng = AuthoritySource::new(DeterministicRng::new(seed));
            let mut g = GridEngine::generate(&mut rng);
            let (a, b) = (Pos::new(row, col), Pos::new(row, col + 1));
            if !g.would_match(a, b) {
                let before = g.snapshot();
                let outcome = g.swap(a, b, &mut rng);
                prop_assert!(!outcome.is_success());
                prop_assert_eq!(g.snapshot(), before);
            }
        }
    }
}
