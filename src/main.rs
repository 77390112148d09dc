//! Match-3 Duel
//!
//! `demo [moves]` plays both peers in-process; `host` and `join` run one peer
//! over a WebSocket link. A simple bot makes the first move it finds.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::time::{interval, sleep_until, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use match3_duel::{
    VERSION,
    core::hash::short_hex,
    network::{
        events::SessionEvent,
        link::{self, LinkConfig, LinkEvent, PeerLink},
        protocol::GameMode,
        session::{SessionConfig, SessionState, TurnCoordinator},
    },
};

/// Pause between bot actions in networked play.
const BOT_DELAY: Duration = Duration::from_millis(400);

/// Default number of demo moves.
const DEMO_MOVES: usize = 20;

type Outbox = Rc<RefCell<Vec<Vec<u8>>>>;
type EventQueue = Rc<RefCell<VecDeque<SessionEvent>>>;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    info!("Match-3 Duel v{}", VERSION);

    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        None | Some("demo") => {
            let moves = match args.next() {
                Some(n) => n.parse().context("moves must be a number")?,
                None => DEMO_MOVES,
            };
            demo_match(moves)
        }
        Some("host") => {
            let link = link::host(&LinkConfig::from_env()).await?;
            run_peer(TurnCoordinator::new(SessionConfig::from_env()), link, true).await
        }
        Some("join") => {
            let link = link::join(&LinkConfig::from_env()).await?;
            run_peer(TurnCoordinator::new(SessionConfig::from_env()), link, false).await
        }
        Some(other) => bail!("unknown command {other:?}; expected demo, host or join"),
    }
}

// =============================================================================
// DEMO
// =============================================================================

fn demo_peer(name: &str) -> (TurnCoordinator, Outbox) {
    let config = SessionConfig {
        nickname: name.to_string(),
        ..SessionConfig::from_env()
    };
    let mut coordinator = TurnCoordinator::new(config);
    let outbox: Outbox = Rc::default();
    let sent = Rc::clone(&outbox);
    coordinator.set_transport(move |bytes: Vec<u8>| sent.borrow_mut().push(bytes));
    (coordinator, outbox)
}

/// Deliver everything queued in `outbox`.
fn pump(outbox: &Outbox, to: &mut TurnCoordinator) -> Result<usize> {
    let frames: Vec<Vec<u8>> = outbox.borrow_mut().drain(..).collect();
    for bytes in &frames {
        to.handle_command(bytes)?;
    }
    Ok(frames.len())
}

/// Two peers wired back to back.
fn demo_match(moves: usize) -> Result<()> {
    info!("=== Starting Demo Session ===");

    let (mut alpha, alpha_out) = demo_peer("alpha");
    let (mut beta, beta_out) = demo_peer("beta");

    beta.await_start()?;
    pump(&beta_out, &mut alpha)?;
    alpha.new_game(&["alpha".to_string(), "beta".to_string()])?;
    pump(&alpha_out, &mut beta)?;

    if let Some(session) = alpha.session() {
        info!("Mode: {:?}, queue: {:?}", session.mode, session.queue);
    }
    for line in alpha.grid().render().lines() {
        info!("  {}", line);
    }

    let mut in_sync = true;
    for turn in 1..=moves {
        if alpha.state() != SessionState::InTurn {
            break;
        }

        let (actor, actor_out, other) = if alpha.is_my_step() {
            (&mut alpha, &alpha_out, &mut beta)
        } else {
            (&mut beta, &beta_out, &mut alpha)
        };

        let Some((a, b)) = actor.grid().find_move() else {
            info!("No moves left on the board");
            actor.time_expired()?;
            pump(actor_out, other)?;
            break;
        };

        actor.swap(a, b)?;
        let messages = pump(actor_out, other)?;

        let actor_hash = actor.grid().compute_hash();
        let other_hash = other.grid().compute_hash();
        info!(
            "Turn {}: {} swapped ({},{}) <-> ({},{}), {} messages, board {}",
            turn,
            actor.nickname(),
            a.row,
            a.col,
            b.row,
            b.col,
            messages,
            short_hex(&actor_hash)
        );
        if actor_hash != other_hash {
            warn!("Boards differ: {} vs {}", short_hex(&actor_hash), short_hex(&other_hash));
            in_sync = false;
        }
    }

    if alpha.state() == SessionState::InTurn {
        alpha.time_expired()?;
        pump(&alpha_out, &mut beta)?;
    }

    // Print final results
    info!("=== Session Results ===");
    for line in alpha.grid().render().lines() {
        info!("  {}", line);
    }
    for player in ["alpha", "beta"] {
        info!("{}: {} cells", player, alpha.score(player));
    }
    if let Some(winner) = beta.session().and_then(|s| s.winner.as_deref()) {
        info!("Winner: {}", winner);
    }

    if in_sync && alpha.divergences() == 0 && beta.divergences() == 0 {
        info!("PEERS IN SYNC: hashes matched after every action");
    } else {
        warn!("PEER DIVERGENCE: snapshots had to repair the board");
    }

    Ok(())
}

// =============================================================================
// NETWORKED PEER
// =============================================================================

/// The other player's name, once known.
fn peer_name(coordinator: &TurnCoordinator) -> Option<String> {
    coordinator
        .session()?
        .queue
        .iter()
        .find(|p| p.as_str() != coordinator.nickname())
        .cloned()
}

/// Play one side of a session over `link` until it ends or the link drops.
async fn run_peer(mut coordinator: TurnCoordinator, mut link: PeerLink, hosting: bool) -> Result<()> {
    let events: EventQueue = Rc::default();
    let queue = Rc::clone(&events);
    coordinator.set_sink(move |event: &SessionEvent| queue.borrow_mut().push_back(event.clone()));
    coordinator.set_transport(link.transport());

    if !hosting {
        coordinator.await_start()?;
    }

    let mut ticker = interval(BOT_DELAY);
    let mut deadline: Option<Instant> = None;
    let mut finished = false;

    while !finished {
        let clock = {
            let at = deadline;
            async move {
                match at {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            }
        };

        tokio::select! {
            event = link.incoming.recv() => match event {
                Some(LinkEvent::Frame(bytes)) => {
                    if let Err(e) = coordinator.handle_command(&bytes) {
                        error!("Session broken: {}", e);
                        coordinator.handle_error(peer_name(&coordinator).as_deref());
                        break;
                    }
                }
                Some(LinkEvent::Closed) | None => {
                    coordinator.handle_error(peer_name(&coordinator).as_deref());
                    break;
                }
            },
            _ = ticker.tick() => {
                if coordinator.state() == SessionState::InTurn && coordinator.is_my_step() {
                    match coordinator.grid().find_move() {
                        Some((a, b)) => {
                            coordinator.swap(a, b)?;
                        }
                        None => {
                            info!("No moves left on the board");
                            coordinator.time_expired()?;
                        }
                    }
                }
            },
            _ = clock => {
                info!("Time is up");
                deadline = None;
                coordinator.time_expired()?;
            },
        }

        let pending: Vec<SessionEvent> = events.borrow_mut().drain(..).collect();
        for event in pending {
            match event {
                SessionEvent::PeerJoined { nickname } if hosting => {
                    let players = [coordinator.nickname().to_string(), nickname];
                    coordinator.new_game(&players)?;
                }
                SessionEvent::GameStarted { mode, time_limit, current, .. } => {
                    info!("Game on, {} moves first", current);
                    for line in coordinator.grid().render().lines() {
                        info!("  {}", line);
                    }
                    if mode == GameMode::Time && hosting {
                        deadline = Some(Instant::now() + Duration::from_secs(u64::from(time_limit)));
                    }
                }
                SessionEvent::GameEnded { winner } => {
                    info!(
                        "Winner: {} ({} vs {} cells)",
                        winner,
                        coordinator.score(coordinator.nickname()),
                        peer_name(&coordinator).map_or(0, |p| coordinator.score(&p))
                    );
                    finished = true;
                }
                SessionEvent::PeerError { nickname } => {
                    warn!("Lost {}", nickname.as_deref().unwrap_or("peer"));
                }
                _ => {}
            }
        }
    }

    coordinator.close();
    // Let the writer flush the final frames.
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(())
}
