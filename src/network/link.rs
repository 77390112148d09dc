//! WebSocket Peer Link
//!
//! Carries encoded session messages between the two peers. One side hosts
//! (binds and accepts a single peer), the other joins. Either way the caller
//! gets a pair of channels and never touches the socket.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::network::session::Transport;

/// Link configuration.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Address the host binds and the joiner dials.
    pub addr: SocketAddr,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 9100)),
        }
    }
}

impl LinkConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            addr: std::env::var("MATCH3_ADDR")
                .ok()
                .and_then(|a| a.parse().ok())
                .unwrap_or_else(|| Self::default().addr),
        }
    }
}

/// Something arriving from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// One encoded message.
    Frame(Vec<u8>),
    /// Connection gone.
    Closed,
}

/// An established connection to the other peer.
#[derive(Debug)]
pub struct PeerLink {
    /// Remote address.
    pub peer_addr: SocketAddr,
    /// Outbound messages.
    pub outgoing: mpsc::UnboundedSender<Vec<u8>>,
    /// Inbound messages, ending with [`LinkEvent::Closed`].
    pub incoming: mpsc::UnboundedReceiver<LinkEvent>,
}

impl PeerLink {
    /// A transport writing into this link.
    pub fn transport(&self) -> ChannelTransport {
        ChannelTransport::new(self.outgoing.clone())
    }
}

/// Link errors.
#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    /// Socket error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Handshake or protocol error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

// =============================================================================
// HOST / JOIN
// =============================================================================

/// Listening side, waiting for its one peer.
pub struct HostListener {
    listener: TcpListener,
}

impl HostListener {
    /// Bind the configured address.
    pub async fn bind(config: &LinkConfig) -> Result<Self, LinkError> {
        let listener = TcpListener::bind(config.addr).await?;
        info!("Waiting for a peer on {}", listener.local_addr()?);
        Ok(Self { listener })
    }

    /// Bound address (useful when binding port 0).
    pub fn local_addr(&self) -> Result<SocketAddr, LinkError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept one peer and complete the WebSocket handshake.
    pub async fn accept(self) -> Result<PeerLink, LinkError> {
        let (stream, addr) = self.listener.accept().await?;
        let ws_stream = accept_async(stream).await?;
        info!("Peer connected from {}", addr);
        Ok(spawn_pumps(ws_stream, addr))
    }
}

/// Host a session: bind, then accept one peer.
pub async fn host(config: &LinkConfig) -> Result<PeerLink, LinkError> {
    HostListener::bind(config).await?.accept().await
}

/// Join a hosted session.
pub async fn join(config: &LinkConfig) -> Result<PeerLink, LinkError> {
    let url = format!("ws://{}", config.addr);
    let (ws_stream, _) = connect_async(url.as_str()).await?;
    info!("Connected to {}", url);
    Ok(spawn_pumps(ws_stream, config.addr))
}

/// Split the socket into a writer task and a reader task.
fn spawn_pumps<S>(ws_stream: WebSocketStream<S>, peer_addr: SocketAddr) -> PeerLink
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<LinkEvent>();

    tokio::spawn(async move {
        while let Some(bytes) = out_rx.recv().await {
            let frame = match String::from_utf8(bytes) {
                Ok(text) => Message::Text(text),
                Err(e) => Message::Binary(e.into_bytes()),
            };
            if let Err(e) = ws_sender.send(frame).await {
                warn!("Send to {} failed: {}", peer_addr, e);
                break;
            }
        }
        let _ = ws_sender.close().await;
        debug!("Writer for {} finished", peer_addr);
    });

    tokio::spawn(async move {
        loop {
            match ws_receiver.next().await {
                Some(Ok(Message::Text(text))) => {
                    if in_tx.send(LinkEvent::Frame(text.into_bytes())).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if in_tx.send(LinkEvent::Frame(data)).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!("Peer {} disconnected", peer_addr);
                    break;
                }
                Some(Err(e)) => {
                    error!("WebSocket error for {}: {}", peer_addr, e);
                    break;
                }
                _ => {}
            }
        }
        let _ = in_tx.send(LinkEvent::Closed);
    });

    PeerLink {
        peer_addr,
        outgoing: out_tx,
        incoming: in_rx,
    }
}

// =============================================================================
// TRANSPORT
// =============================================================================

/// [`Transport`] over a link's outbound channel.
///
/// Closing drops the sender; the socket closes once every sender is gone.
pub struct ChannelTransport {
    sender: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl ChannelTransport {
    /// Wrap an outbound sender.
    pub fn new(sender: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self { sender: Some(sender) }
    }
}

impl Transport for ChannelTransport {
    fn send(&mut self, bytes: Vec<u8>) {
        match &self.sender {
            Some(sender) => {
                if sender.send(bytes).is_err() {
                    warn!("Link closed, message dropped");
                }
            }
            None => debug!("Transport closed, message dropped"),
        }
    }

    fn close(&mut self) {
        self.sender = None;
    }
}
