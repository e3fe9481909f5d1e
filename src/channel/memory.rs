//! # In-Memory Transport
//!
//! A `Connector` whose connections are a pair of unbounded queues. Every `connect`
//! hands the far end (`MemoryPeer`) to whoever holds the peer receiver, which lets
//! tests script a backend frame by frame without a network.

use crate::channel::transport::{Connection, Connector, TransportEvent, ABNORMAL_CLOSURE};
use crate::error::{AppError, AppResult};
use crate::protocol::{encode_control, ControlFrame, WireMessage};
use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// What the client did on a memory connection, as seen by the peer.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    Message(WireMessage),
    Closed(u16),
}

/// Connector that hands every new connection's far end to a test.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    peers: Option<UnboundedSender<MemoryPeer>>,
}

impl MemoryConnector {
    /// Create a connector and the receiver its peers arrive on.
    pub fn new() -> (Self, UnboundedReceiver<MemoryPeer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { peers: Some(tx) }, rx)
    }

    /// A connector that refuses every connection.
    pub fn refusing() -> Self {
        Self { peers: None }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &str) -> AppResult<Box<dyn Connection>> {
        let peers = self
            .peers
            .as_ref()
            .ok_or_else(|| AppError::Transport(format!("connection to {} refused", url)))?;

        let (client_tx, peer_rx) = mpsc::unbounded_channel();
        let (peer_tx, client_rx) = mpsc::unbounded_channel();

        let peer = MemoryPeer {
            url: url.to_string(),
            inbound: peer_rx,
            outbound: peer_tx,
        };
        peers
            .send(peer)
            .map_err(|_| AppError::Transport(format!("connection to {} refused", url)))?;

        Ok(Box::new(MemoryConnection {
            outbound: client_tx,
            inbound: client_rx,
            open: true,
        }))
    }
}

/// Client end of a memory connection.
pub struct MemoryConnection {
    outbound: UnboundedSender<PeerEvent>,
    inbound: UnboundedReceiver<TransportEvent>,
    open: bool,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn send(&mut self, message: WireMessage) -> AppResult<()> {
        if !self.is_open() {
            return Err(AppError::Transport("connection is closed".to_string()));
        }
        self.outbound.send(PeerEvent::Message(message)).map_err(|_| {
            self.open = false;
            AppError::Transport("peer went away".to_string())
        })
    }

    async fn recv(&mut self) -> TransportEvent {
        match self.inbound.recv().await {
            Some(event) => {
                if matches!(event, TransportEvent::Closed { .. }) {
                    self.open = false;
                }
                event
            }
            None => {
                self.open = false;
                TransportEvent::closed(ABNORMAL_CLOSURE, "peer dropped")
            }
        }
    }

    async fn close(&mut self, code: u16) -> AppResult<()> {
        if self.open {
            self.open = false;
            let _ = self.outbound.send(PeerEvent::Closed(code));
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open && !self.outbound.is_closed()
    }
}

/// Far end of a memory connection, driven by a test.
pub struct MemoryPeer {
    url: String,
    inbound: UnboundedReceiver<PeerEvent>,
    outbound: UnboundedSender<TransportEvent>,
}

impl MemoryPeer {
    /// URL the client connected to.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.outbound
            .send(TransportEvent::Message(WireMessage::Text(text.into())))
            .is_ok()
    }

    pub fn send_json(&self, value: serde_json::Value) -> bool {
        self.send_text(value.to_string())
    }

    pub fn send_control(&self, frame: &ControlFrame) -> bool {
        self.send_text(encode_control(frame))
    }

    pub fn send_binary(&self, bytes: impl Into<Vec<u8>>) -> bool {
        self.outbound
            .send(TransportEvent::Message(WireMessage::Binary(bytes.into())))
            .is_ok()
    }

    /// Close from the peer side with the given code.
    pub fn close(&self, code: u16) -> bool {
        self.outbound
            .send(TransportEvent::closed(code, ""))
            .is_ok()
    }

    /// Next thing the client sent, or `None` once the client end is gone.
    pub async fn next_sent(&mut self) -> Option<PeerEvent> {
        self.inbound.recv().await
    }
}
