//! Network Layer
//!
//! Wire protocol, turn coordination and the WebSocket link between peers.
//! The coordinator is synchronous; only `link` touches sockets.

pub mod events;
pub mod protocol;
pub mod session;
pub mod link;

pub use events::{SessionEvent, EventSink};
pub use protocol::{Message, GameMode, CellDto, ProtocolError, encode, decode};
pub use session::{TurnCoordinator, SessionConfig, SessionState, Session, SessionError, Transport};
pub use link::{LinkConfig, LinkEvent, LinkError, PeerLink, HostListener, ChannelTransport};
