//! Session Events
//!
//! Notifications the coordinator publishes to its subscriber.

use serde::{Serialize, Deserialize};

use crate::game::cell::Pos;
use crate::game::grid::{BonusPlacement, Fall, Spawn};
use crate::network::protocol::GameMode;

/// Something the coordinator did or observed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A peer asked to join (host side).
    PeerJoined {
        nickname: String,
    },

    /// Session started, locally or by the host.
    GameStarted {
        mode: GameMode,
        queue: Vec<String>,
        current: String,
        time_limit: u32,
        is_my_step: bool,
    },

    /// Two cells were exchanged.
    Swapped {
        a: Pos,
        b: Pos,
        player: String,
        next_player: String,
        is_my_step: bool,
    },

    /// Matches were removed.
    SwapCompleted {
        removed: Vec<Pos>,
        bonuses: Vec<BonusPlacement>,
        player: String,
        score: u32,
    },

    /// Gravity and refill ran.
    GravityApplied {
        fallen: Vec<Fall>,
        spawned: Vec<Spawn>,
    },

    /// Session is over.
    GameEnded {
        winner: String,
    },

    /// The link to a peer failed.
    PeerError {
        nickname: Option<String>,
    },
}

impl SessionEvent {
    /// Short name for log lines.
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::PeerJoined { .. } => "peer_joined",
            SessionEvent::GameStarted { .. } => "game_started",
            SessionEvent::Swapped { .. } => "swapped",
            SessionEvent::SwapCompleted { .. } => "swap_completed",
            SessionEvent::GravityApplied { .. } => "gravity_applied",
            SessionEvent::GameEnded { .. } => "game_ended",
            SessionEvent::PeerError { .. } => "peer_error",
        }
    }
}

/// Receiver of session events.
///
/// A coordinator holds at most one sink; installing another replaces it.
pub trait EventSink {
    /// Called once per event, in emission order.
    fn on_event(&mut self, event: &SessionEvent);
}

impl<F> EventSink for F
where
    F: FnMut(&SessionEvent),
{
    fn on_event(&mut self, event: &SessionEvent) {
        self(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_sink() {
        let mut seen = Vec::new();
        {
            let mut sink = |event: &SessionEvent| seen.push(event.name());
            sink.on_event(&SessionEvent::GameEnded { winner: "A".to_string() });
            sink.on_event(&SessionEvent::PeerError { nickname: None });
        }
        assert_eq!(seen, vec!["game_ended", "peer_error"]);
    }

    #[test]
    fn test_event_serialization() {
        let event = SessionEvent::PeerJoined { nickname: "bob".to_string() };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"event":"peer_joined","nickname":"bob"}"#);
    }
}
