//! # Channel Controllers
//!
//! One controller per connection of a turn:
//! - **Upload**: owns the input connection, sends the payload as metadata+binary pairs
//!   and waits for the task id and the queued confirmation
//! - **Download**: owns the output connection for one task id and feeds the audio
//!   reassembly buffer
//!
//! Controllers are plain state machines (`on_message`/`on_close`) that return the
//! session events a message implies. The async drivers (`run_upload`, `run_download`)
//! move messages from a `Connection` through a controller and post the events on the
//! session queue through an `Emitter`.

pub mod download;
pub mod memory;
pub mod transport;
pub mod upload;

use crate::protocol::WireMessage;
use crate::session::{Envelope, SessionEvent};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;
use transport::{Connection, TransportEvent, NORMAL_CLOSURE};

pub use download::{run_download, DownloadController};
pub use memory::{MemoryConnector, MemoryPeer, PeerEvent};
pub use transport::{Connector, WsConnector};
pub use upload::{run_upload, UploadController, UploadPayload};

/// What a controller wants done after a message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reaction {
    /// Events to post, in order
    pub events: Vec<SessionEvent>,
    /// Close the connection normally once the events are posted
    pub close: bool,
}

impl Reaction {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn emit(event: SessionEvent) -> Self {
        Self {
            events: vec![event],
            close: false,
        }
    }

    pub fn and_close(mut self) -> Self {
        self.close = true;
        self
    }
}

/// Message handling shared by both channel controllers.
pub trait ChannelController {
    /// React to one received message.
    fn on_message(&mut self, message: WireMessage) -> Reaction;

    /// React to the connection closing with `code`. Called at most once.
    fn on_close(&mut self, code: u16) -> Vec<SessionEvent>;
}

/// Posts events for one turn onto the session queue.
#[derive(Debug, Clone)]
pub struct Emitter {
    generation: u64,
    sink: UnboundedSender<Envelope>,
}

impl Emitter {
    pub fn new(generation: u64, sink: UnboundedSender<Envelope>) -> Self {
        Self { generation, sink }
    }

    /// Post one event. Returns `false` once nobody is listening any more.
    pub fn emit(&self, event: SessionEvent) -> bool {
        self.sink
            .send(Envelope {
                generation: self.generation,
                event,
            })
            .is_ok()
    }

    /// Post several events in order, stopping at the first failure.
    pub fn emit_all(&self, events: Vec<SessionEvent>) -> bool {
        events.into_iter().all(|event| self.emit(event))
    }
}

/// Feed every message of `connection` through `controller` until the channel ends.
pub(crate) async fn pump<C: ChannelController + Send>(
    connection: &mut dyn Connection,
    controller: &mut C,
    emitter: &Emitter,
) {
    loop {
        match connection.recv().await {
            TransportEvent::Message(message) => {
                let reaction = controller.on_message(message);
                let listening = emitter.emit_all(reaction.events);
                if reaction.close || !listening {
                    let _ = connection.close(NORMAL_CLOSURE).await;
                    return;
                }
            }
            TransportEvent::Closed { code, reason } => {
                debug!(code, reason = %reason, "Connection closed");
                emitter.emit_all(controller.on_close(code));
                return;
            }
        }
    }
}
