//! # Message Socket Transport
//!
//! The seam between the channel drivers and the network. A `Connector` opens a
//! `Connection`; a connection sends and receives whole text or binary messages and
//! reports its closure as an event carrying the close code.
//!
//! ## Implementations:
//! - **WsConnector**: WebSocket client on `tokio-tungstenite` (production)
//! - **MemoryConnector**: in-process pair of queues (see `channel::memory`)

use crate::error::{AppError, AppResult};
use crate::protocol::WireMessage;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

/// Close code for an orderly shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close code used when the connection ended without a close handshake.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Close code for a close frame that carried no status.
pub const NO_STATUS: u16 = 1005;

/// Something that happened on an open connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(WireMessage),
    Closed { code: u16, reason: String },
}

impl TransportEvent {
    pub fn closed(code: u16, reason: impl Into<String>) -> Self {
        TransportEvent::Closed {
            code,
            reason: reason.into(),
        }
    }
}

/// One open message socket.
///
/// ## Rust Concepts:
/// - **#[async_trait]**: lets the trait have async methods and still be used as
///   `Box<dyn Connection>`
/// - **Send bound**: drivers run connections inside spawned tokio tasks
#[async_trait]
pub trait Connection: Send {
    /// Send one message. Fails once the connection is no longer open.
    async fn send(&mut self, message: WireMessage) -> AppResult<()>;

    /// Wait for the next message or for the closure of the connection.
    /// After a `Closed` event the connection stays closed.
    async fn recv(&mut self) -> TransportEvent;

    /// Close with the given code. Closing twice is a no-op.
    async fn close(&mut self, code: u16) -> AppResult<()>;

    /// Whether sends can still succeed as far as the connection knows.
    fn is_open(&self) -> bool;
}

/// Opens connections to a URL.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> AppResult<Box<dyn Connection>>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket connector for `ws://` and `wss://` URLs.
#[derive(Debug, Clone, Default)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        WsConnector
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> AppResult<Box<dyn Connection>> {
        let (stream, response) = connect_async(url).await.map_err(|e| {
            AppError::Transport(format!("Failed to connect to {}: {}", url, e))
        })?;
        debug!(url, status = %response.status(), "WebSocket connected");

        Ok(Box::new(WsConnection { stream, open: true }))
    }
}

/// A live WebSocket connection.
pub struct WsConnection {
    stream: WsStream,
    open: bool,
}

#[async_trait]
impl Connection for WsConnection {
    async fn send(&mut self, message: WireMessage) -> AppResult<()> {
        if !self.open {
            return Err(AppError::Transport("connection is closed".to_string()));
        }

        let message = match message {
            WireMessage::Text(text) => Message::Text(text),
            WireMessage::Binary(bytes) => Message::Binary(bytes),
        };

        if let Err(e) = self.stream.send(message).await {
            self.open = false;
            return Err(e.into());
        }
        Ok(())
    }

    async fn recv(&mut self) -> TransportEvent {
        if !self.open {
            return TransportEvent::closed(ABNORMAL_CLOSURE, "connection is closed");
        }

        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return TransportEvent::Message(WireMessage::Text(text))
                }
                Some(Ok(Message::Binary(bytes))) => {
                    return TransportEvent::Message(WireMessage::Binary(bytes))
                }
                Some(Ok(Message::Close(frame))) => {
                    self.open = false;
                    let (code, reason) = frame
                        .map(|frame| (u16::from(frame.code), frame.reason.into_owned()))
                        .unwrap_or((NO_STATUS, String::new()));
                    debug!(code, reason = %reason, "WebSocket closed by peer");
                    return TransportEvent::Closed { code, reason };
                }
                // Ping/pong are answered by tungstenite itself
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    self.open = false;
                    warn!(error = %e, "WebSocket read failed");
                    return TransportEvent::closed(ABNORMAL_CLOSURE, e.to_string());
                }
                None => {
                    self.open = false;
                    return TransportEvent::closed(ABNORMAL_CLOSURE, "stream ended");
                }
            }
        }
    }

    async fn close(&mut self, code: u16) -> AppResult<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;

        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: Cow::Borrowed(""),
        };
        self.stream.close(Some(frame)).await.map_err(AppError::from)
    }

    fn is_open(&self) -> bool {
        self.open
    }
}
