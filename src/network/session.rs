//! Turn Coordination
//!
//! Drives one peer's side of a two-player session. Local swaps are resolved
//! here with fresh randomness and published as concrete results; the remote
//! peer's results are applied verbatim without drawing anything.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::core::hash::short_hex;
use crate::core::rng::{AuthoritySource, DeterministicRng, ReplaySource};
use crate::game::cell::{Cell, Pos, SnapshotError};
use crate::game::grid::{BoardSnapshot, BonusPlacement, GridEngine, SwapOutcome};
use crate::network::events::{EventSink, SessionEvent};
use crate::network::protocol::{
    self, BonusDto, CellDto, FallenDto, GameMode, Message, ProtocolError, StartGameInfo,
};

/// Coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session yet.
    Idle,
    /// Joined a host, waiting for `start_game`.
    AwaitingStart,
    /// Session running.
    InTurn,
    /// Session over. Terminal.
    Ended,
}

/// Local player settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Local player's nickname.
    pub nickname: String,
    /// Mode used when this peer hosts.
    pub mode: GameMode,
    /// Session length in seconds (time mode).
    pub time_limit: u32,
    /// Score at which the local player declares victory.
    pub target_score: Option<u32>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            nickname: "player".to_string(),
            mode: GameMode::Turn,
            time_limit: 120,
            target_score: Some(100),
        }
    }
}

impl SessionConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            nickname: std::env::var("MATCH3_NICKNAME").unwrap_or(defaults.nickname),
            mode: std::env::var("MATCH3_MODE")
                .ok()
                .and_then(|m| GameMode::parse(&m))
                .unwrap_or(defaults.mode),
            time_limit: std::env::var("MATCH3_TIME_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.time_limit),
            target_score: std::env::var("MATCH3_TARGET_SCORE")
                .ok()
                .and_then(|v| v.parse().ok())
                .or(defaults.target_score),
        }
    }
}

/// Shared session parameters, identical on both peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Turn or time mode.
    pub mode: GameMode,
    /// Turn order, fixed for the session.
    pub queue: Vec<String>,
    /// Player whose turn it is.
    pub current: String,
    /// Session length in seconds.
    pub time_limit: u32,
    /// Nicknames as entered.
    pub nicknames: Vec<String>,
    /// Cells cleared per player.
    pub scores: BTreeMap<String, u32>,
    /// Score that ends the session.
    pub target_score: Option<u32>,
    /// Set once the session ends.
    pub winner: Option<String>,
}

impl Session {
    /// Player after `current` in the queue.
    fn next_player(&self) -> String {
        let index = self.queue.iter().position(|p| *p == self.current).unwrap_or(0);
        self.queue[(index + 1) % self.queue.len()].clone()
    }

    /// Highest score, ties going to the earlier queue entry.
    fn leader(&self) -> String {
        let mut best: Option<(&String, u32)> = None;
        for player in &self.queue {
            let score = self.scores.get(player).copied().unwrap_or(0);
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((player, score));
            }
        }
        best.map(|(p, _)| p.clone()).unwrap_or_else(|| self.current.clone())
    }
}

/// Outbound side of the peer connection.
pub trait Transport {
    /// Deliver one encoded message. Called once per message, in order.
    fn send(&mut self, bytes: Vec<u8>);

    /// Release the connection.
    fn close(&mut self) {}
}

impl<F> Transport for F
where
    F: FnMut(Vec<u8>),
{
    fn send(&mut self, bytes: Vec<u8>) {
        self(bytes)
    }
}

/// Session errors.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No session running.
    #[error("Session not in progress")]
    NotInTurn,

    /// Turn mode and someone else holds the turn.
    #[error("Not your turn")]
    NotYourTurn,

    /// Session already ended.
    #[error("Game has ended")]
    GameEnded,

    /// Session already started or joined.
    #[error("Game already started")]
    AlreadyStarted,

    /// `new_game` without players.
    #[error("No players to queue")]
    EmptyQueue,

    /// Inbound message could not be decoded.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Inbound board could not be loaded.
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
}

// =============================================================================
// TURN COORDINATOR
// =============================================================================

/// One peer's session state machine.
pub struct TurnCoordinator {
    config: SessionConfig,
    state: SessionState,
    session: Option<Session>,
    grid: GridEngine,
    rng: AuthoritySource,
    transport: Option<Box<dyn Transport>>,
    sink: Option<Box<dyn EventSink>>,
    is_my_step: bool,
    /// Player credited for the removals that follow.
    last_actor: Option<String>,
    divergences: u32,
}

impl TurnCoordinator {
    /// Create a coordinator with a fresh random seed.
    pub fn new(config: SessionConfig) -> Self {
        let session_id = Uuid::new_v4();
        let rng = DeterministicRng::for_session(
            session_id.as_bytes(),
            std::slice::from_ref(&config.nickname),
        );
        Self::with_rng(config, rng)
    }

    /// Create a coordinator drawing from `rng`.
    pub fn with_rng(config: SessionConfig, rng: DeterministicRng) -> Self {
        Self {
            config,
            state: SessionState::Idle,
            session: None,
            grid: GridEngine::new(),
            rng: AuthoritySource::new(rng),
            transport: None,
            sink: None,
            is_my_step: false,
            last_actor: None,
            divergences: 0,
        }
    }

    /// Install the outbound transport.
    pub fn set_transport(&mut self, transport: impl Transport + 'static) {
        self.transport = Some(Box::new(transport));
    }

    /// Install the event subscriber, replacing any previous one.
    pub fn set_sink(&mut self, sink: impl EventSink + 'static) {
        self.sink = Some(Box::new(sink));
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Running (or finished) session.
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Whether the local player may act now.
    pub fn is_my_step(&self) -> bool {
        self.is_my_step
    }

    /// Local nickname.
    pub fn nickname(&self) -> &str {
        &self.config.nickname
    }

    /// Player holding the turn.
    pub fn current(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.current.as_str())
    }

    /// Read-only board access.
    pub fn grid(&self) -> &GridEngine {
        &self.grid
    }

    /// Cell at `(row, col)`.
    pub fn cell(&self, row: usize, col: usize) -> Option<Cell> {
        self.grid.cell(row, col)
    }

    /// Score of `player`.
    pub fn score(&self, player: &str) -> u32 {
        self.session
            .as_ref()
            .and_then(|s| s.scores.get(player).copied())
            .unwrap_or(0)
    }

    /// Number of `auto_swap` messages whose falls, spawns or board disagreed
    /// with the local replay.
    pub fn divergences(&self) -> u32 {
        self.divergences
    }

    // -------------------------------------------------------------------------
    // Lifecycle
    // -------------------------------------------------------------------------

    /// Announce the local player to a host and wait for `start_game`.
    pub fn await_start(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Idle {
            return Err(SessionError::AlreadyStarted);
        }

        self.send(&Message::Join { nickname: self.config.nickname.clone() })?;
        self.state = SessionState::AwaitingStart;
        info!("{} waiting for start_game", self.config.nickname);
        Ok(())
    }

    /// Host a new session for `nicknames`.
    pub fn new_game(&mut self, nicknames: &[String]) -> Result<(), SessionError> {
        match self.state {
            SessionState::Idle | SessionState::AwaitingStart => {}
            SessionState::InTurn => return Err(SessionError::AlreadyStarted),
            SessionState::Ended => return Err(SessionError::GameEnded),
        }
        if nicknames.is_empty() {
            return Err(SessionError::EmptyQueue);
        }

        let mut queue = nicknames.to_vec();
        self.rng.shuffle(&mut queue);
        self.grid.generate_initial(&mut self.rng);

        let session = Session {
            mode: self.config.mode,
            current: queue[0].clone(),
            scores: queue.iter().map(|p| (p.clone(), 0)).collect(),
            queue,
            time_limit: self.config.time_limit,
            nicknames: nicknames.to_vec(),
            target_score: self.config.target_score,
            winner: None,
        };

        self.send(&Message::StartGame(StartGameInfo {
            mode: session.mode,
            queue_players: session.queue.clone(),
            current_player: session.current.clone(),
            nicknames: session.nicknames.clone(),
            board: self.grid.snapshot(),
            time_limit: session.time_limit,
            target_score: session.target_score,
        }))?;

        info!(
            "Session started: mode {:?}, queue {:?}, board {}",
            session.mode,
            session.queue,
            short_hex(&self.grid.compute_hash())
        );
        self.begin(session);
        Ok(())
    }

    /// Submit a local swap.
    ///
    /// Returns `Ok(false)` when the cells are not adjacent or the exchange
    /// matches nothing; the board is unchanged and nothing is sent.
    /// On success the turn passes on before the resolution is published.
    pub fn swap(&mut self, a: Pos, b: Pos) -> Result<bool, SessionError> {
        self.ensure_running()?;
        if !self.is_my_step {
            return Err(SessionError::NotYourTurn);
        }
        if !a.in_bounds() || !b.in_bounds() || !a.is_adjacent(b) {
            debug!("Rejected swap {:?} <-> {:?}: not adjacent", a, b);
            return Ok(false);
        }
        let (Some(cell_a), Some(cell_b)) = (self.grid.at(a), self.grid.at(b)) else {
            return Ok(false);
        };

        let outcome = self.grid.swap(a, b, &mut self.rng);
        if !outcome.is_success() {
            debug!("Rejected swap {:?} <-> {:?}: no match", a, b);
            return Ok(false);
        }

        let player = self.config.nickname.clone();
        let next_player = self.pass_turn()?;
        self.last_actor = Some(player.clone());

        self.send(&Message::Swap {
            a_lbl: CellDto::new(a, &cell_a),
            b_lbl: CellDto::new(b, &cell_b),
            next_player: next_player.clone(),
            player: Some(player.clone()),
        })?;
        self.emit(SessionEvent::Swapped {
            a,
            b,
            player,
            next_player,
            is_my_step: self.is_my_step,
        });

        let mut wave = outcome;
        loop {
            self.publish_removal(&wave)?;

            let gravity = self.grid.collapse_and_fill(&mut self.rng);
            self.send(&Message::auto_swap(&gravity.fallen, &gravity.spawned, self.grid.snapshot()))?;
            self.emit(SessionEvent::GravityApplied {
                fallen: gravity.fallen,
                spawned: gravity.spawned,
            });

            wave = self.grid.clear_matches(&mut self.rng);
            if !wave.is_success() {
                break;
            }
            debug!("Cascade: {} more cells matched", wave.matched.len());
        }

        if self.reached_target() {
            self.win()?;
        }
        Ok(true)
    }

    /// Declare the local player the winner.
    pub fn win(&mut self) -> Result<(), SessionError> {
        let winner = self.config.nickname.clone();
        self.end_game(&winner)
    }

    /// Clock ran out: the highest score wins. Returns the winner.
    pub fn time_expired(&mut self) -> Result<String, SessionError> {
        self.ensure_running()?;
        let winner = self
            .session
            .as_ref()
            .map(Session::leader)
            .ok_or(SessionError::NotInTurn)?;
        self.end_game(&winner)?;
        Ok(winner)
    }

    /// End the session with `winner` and tell the peer.
    pub fn end_game(&mut self, winner: &str) -> Result<(), SessionError> {
        self.ensure_running()?;
        self.send(&Message::EndGame { winner: winner.to_string() })?;
        self.finish(winner.to_string());
        Ok(())
    }

    /// Report a transport fault. Session state is left alone.
    pub fn handle_error(&mut self, nickname: Option<&str>) {
        warn!("Peer error ({})", nickname.unwrap_or("unknown peer"));
        self.emit(SessionEvent::PeerError { nickname: nickname.map(str::to_string) });
    }

    /// Release the transport.
    pub fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
            debug!("Transport closed");
        }
    }

    // -------------------------------------------------------------------------
    // Inbound
    // -------------------------------------------------------------------------

    /// Decode and apply one inbound message.
    ///
    /// Unknown commands are ignored. Anything after the session ended is
    /// ignored too.
    pub fn handle_command(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        if self.state == SessionState::Ended {
            debug!("Ignoring message after end_game");
            return Ok(());
        }

        match protocol::decode(bytes) {
            Ok(message) => self.handle_message(message),
            Err(ProtocolError::UnknownCommand(command)) => {
                debug!("Ignoring unknown command {}", command);
                Ok(())
            }
            Err(e) => {
                warn!("Undecodable message: {}", e);
                Err(e.into())
            }
        }
    }

    /// Apply one decoded inbound message.
    pub fn handle_message(&mut self, message: Message) -> Result<(), SessionError> {
        debug!("Received {}", message.command());

        match (self.state, message) {
            (SessionState::Ended, message) => {
                debug!("Ignoring {} after end_game", message.command());
                Ok(())
            }

            (SessionState::Idle, Message::Join { nickname }) => {
                info!("{} wants to join", nickname);
                self.emit(SessionEvent::PeerJoined { nickname });
                Ok(())
            }

            (SessionState::Idle | SessionState::AwaitingStart, Message::StartGame(info)) => {
                self.apply_start(info)
            }

            (SessionState::InTurn, Message::Swap { a_lbl, b_lbl, next_player, player }) => {
                self.apply_swap(a_lbl, b_lbl, next_player, player);
                Ok(())
            }

            (SessionState::InTurn, Message::CompletedSwap { removed, bonuses }) => {
                self.apply_removal(&removed, &bonuses);
                Ok(())
            }

            (SessionState::InTurn, Message::AutoSwap { fallen, spawned, board }) => {
                self.apply_gravity(&fallen, &spawned, &board)
            }

            (SessionState::InTurn, Message::EndGame { winner }) => {
                self.finish(winner);
                Ok(())
            }

            (state, message) => {
                warn!("Ignoring {} in state {:?}", message.command(), state);
                Ok(())
            }
        }
    }

    fn apply_start(&mut self, info: StartGameInfo) -> Result<(), SessionError> {
        if info.queue_players.is_empty() {
            return Err(SessionError::EmptyQueue);
        }
        self.grid.load_snapshot(&info.board)?;

        let session = Session {
            mode: info.mode,
            scores: info.queue_players.iter().map(|p| (p.clone(), 0)).collect(),
            queue: info.queue_players,
            current: info.current_player,
            time_limit: info.time_limit,
            nicknames: info.nicknames,
            target_score: info.target_score,
            winner: None,
        };

        info!(
            "Joined session: mode {:?}, queue {:?}, board {}",
            session.mode,
            session.queue,
            short_hex(&self.grid.compute_hash())
        );
        self.begin(session);
        Ok(())
    }

    fn apply_swap(&mut self, a_lbl: CellDto, b_lbl: CellDto, next_player: String, player: Option<String>) {
        let (a, b) = (a_lbl.pos(), b_lbl.pos());
        if !self.grid.exchange(a, b) {
            warn!("Remote swap {:?} <-> {:?} is off the board", a, b);
        }

        let Some(session) = self.session.as_mut() else { return };
        let player = player.unwrap_or_else(|| session.current.clone());
        session.current = next_player.clone();
        let mode = session.mode;

        self.is_my_step = self.step_for(&next_player, mode);
        self.last_actor = Some(player.clone());
        self.emit(SessionEvent::Swapped {
            a,
            b,
            player,
            next_player,
            is_my_step: self.is_my_step,
        });
    }

    fn apply_removal(&mut self, removed: &[[usize; 2]], bonuses: &[BonusDto]) {
        let removed: Vec<Pos> = removed.iter().map(|&[row, col]| Pos::new(row, col)).collect();
        let bonuses: Vec<BonusPlacement> = bonuses.iter().map(BonusPlacement::from).collect();

        let cleared = self.grid.apply_removal(&removed, &bonuses);
        let (player, score) = self.credit(cleared);
        self.emit(SessionEvent::SwapCompleted { removed, bonuses, player, score });
    }

    fn apply_gravity(
        &mut self,
        fallen: &[FallenDto],
        spawned: &[CellDto],
        board: &BoardSnapshot,
    ) -> Result<(), SessionError> {
        let authority_hash = board.compute_hash()?;

        let mut replay = ReplaySource::new(spawned.iter().map(|c| c.color.index()));
        let gravity = self.grid.collapse_and_fill(&mut replay);

        let same_falls = gravity
            .fallen
            .iter()
            .map(|f| (f.from, f.to))
            .eq(fallen.iter().map(|f| (f.cell.pos(), f.to())));
        let same_spawns = gravity
            .spawned
            .iter()
            .map(|s| s.pos)
            .eq(spawned.iter().map(CellDto::pos));
        let replay_agrees = same_falls && same_spawns && replay.is_exact();
        if !replay_agrees {
            warn!(
                "Gravity replay disagrees: {} falls vs {}, {} spawns vs {}, {} colors unused, {} missing",
                gravity.fallen.len(),
                fallen.len(),
                gravity.spawned.len(),
                spawned.len(),
                replay.remaining(),
                replay.underruns()
            );
        }

        let local_hash = self.grid.compute_hash();
        if local_hash != authority_hash {
            warn!(
                "Board diverged (local {}, authority {}); adopting snapshot",
                short_hex(&local_hash),
                short_hex(&authority_hash)
            );
        }
        if !replay_agrees || local_hash != authority_hash {
            self.divergences += 1;
        }
        self.grid.load_snapshot(board)?;

        self.emit(SessionEvent::GravityApplied {
            fallen: gravity.fallen,
            spawned: gravity.spawned,
        });
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn ensure_running(&self) -> Result<(), SessionError> {
        match self.state {
            SessionState::InTurn => Ok(()),
            SessionState::Ended => Err(SessionError::GameEnded),
            SessionState::Idle | SessionState::AwaitingStart => Err(SessionError::NotInTurn),
        }
    }

    fn step_for(&self, current: &str, mode: GameMode) -> bool {
        mode == GameMode::Time || current == self.config.nickname
    }

    fn begin(&mut self, session: Session) {
        self.is_my_step = self.step_for(&session.current, session.mode);
        self.state = SessionState::InTurn;
        self.last_actor = None;

        let event = SessionEvent::GameStarted {
            mode: session.mode,
            queue: session.queue.clone(),
            current: session.current.clone(),
            time_limit: session.time_limit,
            is_my_step: self.is_my_step,
        };
        self.session = Some(session);
        self.emit(event);
    }

    /// Move the turn to the next player and return them.
    fn pass_turn(&mut self) -> Result<String, SessionError> {
        let session = self.session.as_mut().ok_or(SessionError::NotInTurn)?;
        let next = session.next_player();
        session.current = next.clone();
        let mode = session.mode;
        self.is_my_step = self.step_for(&next, mode);
        Ok(next)
    }

    fn publish_removal(&mut self, wave: &SwapOutcome) -> Result<(), SessionError> {
        let (player, score) = self.credit(wave.cleared());
        self.send(&Message::completed_swap(&wave.matched, &wave.bonuses))?;
        self.emit(SessionEvent::SwapCompleted {
            removed: wave.matched.clone(),
            bonuses: wave.bonuses.clone(),
            player,
            score,
        });
        Ok(())
    }

    /// Add `cleared` to the last actor's score.
    fn credit(&mut self, cleared: usize) -> (String, u32) {
        let Some(session) = self.session.as_mut() else {
            return (String::new(), 0);
        };
        let player = self.last_actor.clone().unwrap_or_else(|| session.current.clone());
        let score = session.scores.entry(player.clone()).or_insert(0);
        *score += cleared as u32;
        (player, *score)
    }

    fn reached_target(&self) -> bool {
        let Some(target) = self.session.as_ref().and_then(|s| s.target_score) else {
            return false;
        };
        self.score(&self.config.nickname) >= target
    }

    fn finish(&mut self, winner: String) {
        info!("Session over, winner {}", winner);
        self.state = SessionState::Ended;
        self.is_my_step = false;
        if let Some(session) = self.session.as_mut() {
            session.winner = Some(winner.clone());
        }
        self.emit(SessionEvent::GameEnded { winner });
    }

    fn send(&mut self, message: &Message) -> Result<(), SessionError> {
        let bytes = protocol::encode(message)?;
        match self.transport.as_mut() {
            Some(transport) => {
                debug!("Sending {} ({} bytes)", message.command(), bytes.len());
                transport.send(bytes);
            }
            None => debug!("No transport, dropping {}", message.command()),
        }
        Ok(())
    }

    fn emit(&mut self, event: SessionEvent) {
        if let Some(sink) = self.sink.as_mut() {
            sink.on_event(&event);
        }
    }
}
