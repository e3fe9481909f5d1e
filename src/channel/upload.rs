//! # Upload Channel Controller
//!
//! Sends one turn's payload on the input connection.
//!
//! ## Frame Sequence:
//! 1. `{"action":"data_chunk","type":<text|audio>,"chunk_id":i}` metadata
//! 2. one binary frame with the bytes for index `i`
//! 3. repeat 1-2 for every segment in capture order, then `{"action":"upload_complete"}`
//!
//! Text is a single pair with `chunk_id` 0. Audio waits for the task id before the
//! first pair, checks the connection before every send and gives up on the whole
//! upload at the first failed send.

use crate::audio::RecordedInput;
use crate::channel::transport::{Connection, Connector, TransportEvent, NORMAL_CLOSURE};
use crate::channel::{pump, ChannelController, Emitter, Reaction};
use crate::error::AppError;
use crate::protocol::{decode_control, ControlFrame, DecodeFailure, PayloadKind, WireMessage};
use crate::session::{Channel, SessionEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

/// What one turn uploads.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadPayload {
    Text(String),
    Audio(RecordedInput),
}

impl UploadPayload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            UploadPayload::Text(_) => PayloadKind::Text,
            UploadPayload::Audio(_) => PayloadKind::Audio,
        }
    }

    /// Every frame of the upload, in send order.
    pub fn frames(&self) -> Vec<WireMessage> {
        match self {
            UploadPayload::Text(content) => text_frames(content),
            UploadPayload::Audio(recording) => audio_frames(recording),
        }
    }
}

/// Frames for a text upload: one metadata+binary pair and the completion signal.
pub fn text_frames(content: &str) -> Vec<WireMessage> {
    vec![
        WireMessage::control(&ControlFrame::DataChunk {
            kind: PayloadKind::Text,
            chunk_id: 0,
        }),
        WireMessage::Binary(content.as_bytes().to_vec()),
        WireMessage::control(&ControlFrame::UploadComplete),
    ]
}

/// Frames for an audio upload: one pair per segment, numbered by position.
pub fn audio_frames(recording: &RecordedInput) -> Vec<WireMessage> {
    let mut frames = Vec::with_capacity(recording.len() * 2 + 1);
    for (chunk_id, segment) in recording.indexed() {
        frames.push(WireMessage::control(&ControlFrame::DataChunk {
            kind: PayloadKind::Audio,
            chunk_id,
        }));
        frames.push(WireMessage::Binary(segment.to_vec()));
    }
    frames.push(WireMessage::control(&ControlFrame::UploadComplete));
    frames
}

/// Reacts to what the backend sends on the input connection.
#[derive(Debug, Default)]
pub struct UploadController {
    task_id: Option<String>,
    finished: bool,
}

impl UploadController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Task id assigned on this connection, if any.
    pub fn task_id(&self) -> Option<&str> {
        self.task_id.as_deref()
    }

    fn warning(detail: impl Into<String>) -> Reaction {
        Reaction::emit(SessionEvent::ProtocolWarning {
            channel: Channel::Input,
            detail: detail.into(),
        })
    }

    fn fail(&mut self, message: String) -> Reaction {
        self.finished = true;
        Reaction::emit(SessionEvent::UploadFailed(message)).and_close()
    }

    fn on_frame(&mut self, frame: ControlFrame) -> Reaction {
        match frame {
            ControlFrame::TaskIdAssigned { task_id } => match &self.task_id {
                None => {
                    debug!(task_id = %task_id, "Task id received on input channel");
                    self.task_id = Some(task_id.clone());
                    Reaction::emit(SessionEvent::TaskAssigned(task_id))
                }
                Some(current) if *current == task_id => Reaction::none(),
                Some(current) => Self::warning(format!(
                    "second task id {} assigned while {} is active",
                    task_id, current
                )),
            },
            ControlFrame::UploadQueued { .. } => {
                info!(task_id = self.task_id.as_deref().unwrap_or("-"), "Upload queued");
                self.finished = true;
                Reaction::emit(SessionEvent::UploadQueued).and_close()
            }
            ControlFrame::Error { message } => self.fail(message),
            other => Self::warning(format!(
                "unexpected {} frame on input channel",
                other.name()
            )),
        }
    }
}

impl ChannelController for UploadController {
    fn on_message(&mut self, message: WireMessage) -> Reaction {
        if self.finished {
            debug!("Input channel already finished, ignoring message");
            return Reaction::none();
        }

        match message {
            WireMessage::Binary(bytes) => Self::warning(format!(
                "unexpected {} byte binary frame on input channel",
                bytes.len()
            )),
            WireMessage::Text(text) => match decode_control(&text) {
                Ok(frame) => self.on_frame(frame),
                Err(DecodeFailure::Acknowledgement(ack)) => {
                    debug!(ack = %ack, "Upload chunk acknowledged");
                    Reaction::none()
                }
                Err(DecodeFailure::Sentinel(message)) => self.fail(message),
                Err(failure) => Self::warning(failure.to_string()),
            },
        }
    }

    fn on_close(&mut self, code: u16) -> Vec<SessionEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;
        vec![SessionEvent::UploadClosed { code }]
    }
}

/// Timeouts used by the upload driver.
#[derive(Debug, Clone, Copy)]
pub struct UploadTimeouts {
    pub connect: Duration,
    pub task_id: Duration,
}

/// Drive one upload from connect to close.
///
/// ## Flow:
/// 1. Open the input connection (bounded by `timeouts.connect`)
/// 2. Audio only: wait for the task id (bounded by `timeouts.task_id`)
/// 3. Send every frame; any failed send fails the upload and drops the rest
/// 4. Post `UploadSent` and keep handling backend messages until the channel ends
pub async fn run_upload(
    connector: Arc<dyn Connector>,
    url: String,
    payload: UploadPayload,
    timeouts: UploadTimeouts,
    emitter: Emitter,
) {
    let kind = payload.kind();
    info!(url = %url, kind = kind.as_str(), "Opening input channel");

    let mut connection = match timeout(timeouts.connect, connector.connect(&url)).await {
        Ok(Ok(connection)) => connection,
        Ok(Err(e)) => {
            error!(url = %url, error = %e, "Input channel failed to open");
            emitter.emit(SessionEvent::UploadFailed(e.to_string()));
            return;
        }
        Err(_) => {
            error!(url = %url, "Input channel connect timed out");
            emitter.emit(SessionEvent::UploadFailed(
                AppError::Transport(format!("connecting to {} timed out", url)).to_string(),
            ));
            return;
        }
    };

    let mut controller = UploadController::new();

    if kind == PayloadKind::Audio {
        let assigned =
            await_task_id(connection.as_mut(), &mut controller, timeouts.task_id, &emitter).await;
        if !assigned {
            return;
        }
    }

    let frames = payload.frames();
    let total = frames.len();
    for (sent, frame) in frames.into_iter().enumerate() {
        let result = if connection.is_open() {
            connection.send(frame).await
        } else {
            Err(AppError::Transport("connection is closed".to_string()))
        };

        if let Err(e) = result {
            error!(sent, total, error = %e, "Upload interrupted, discarding remaining frames");
            emitter.emit(SessionEvent::UploadFailed(format!(
                "input connection dropped after {} of {} frames: {}",
                sent,
                total,
                e.message()
            )));
            let _ = connection.close(NORMAL_CLOSURE).await;
            return;
        }
    }
    debug!(frames = total, "Upload frames sent");

    if !emitter.emit(SessionEvent::UploadSent) {
        let _ = connection.close(NORMAL_CLOSURE).await;
        return;
    }

    pump(connection.as_mut(), &mut controller, &emitter).await;
}

/// Handle backend messages until a task id arrives.
///
/// Returns `false` when the upload ended before that (failure, close or timeout).
async fn await_task_id(
    connection: &mut dyn Connection,
    controller: &mut UploadController,
    limit: Duration,
    emitter: &Emitter,
) -> bool {
    let deadline = Instant::now() + limit;

    while controller.task_id().is_none() {
        let event = match tokio::time::timeout_at(deadline, connection.recv()).await {
            Ok(event) => event,
            Err(_) => {
                warn!("No task id assigned in time, abandoning audio upload");
                emitter.emit(SessionEvent::UploadFailed(
                    AppError::Transport("timed out waiting for a task id".to_string())
                        .to_string(),
                ));
                let _ = connection.close(NORMAL_CLOSURE).await;
                return false;
            }
        };

        match event {
            TransportEvent::Message(message) => {
                let reaction = controller.on_message(message);
                let listening = emitter.emit_all(reaction.events);
                if reaction.close || !listening {
                    let _ = connection.close(NORMAL_CLOSURE).await;
                    return false;
                }
            }
            TransportEvent::Closed { code, .. } => {
                emitter.emit_all(controller.on_close(code));
                return false;
            }
        }
    }

    true
}
