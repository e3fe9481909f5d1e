//! # Download Channel Controller
//!
//! Consumes the output connection of one task: a text result, optionally a numbered
//! stream of binary audio chunks, and a completion or error signal.
//!
//! `success`, `audio_chunk` and `audio_complete` count only when they carry this
//! channel's task id; a frame for another task or with no id at all is a warning.
//!
//! ## Message Rules (in priority order):
//! 1. **Binary**: stored under the `chunk_id` of the latest `audio_chunk` metadata;
//!    without pending metadata it is dropped with a warning
//! 2. **success**: emits the text; without audio the turn completes and the channel
//!    closes, with audio the buffer is reset and streaming begins
//! 3. **audio_chunk**: `chunk_id == 0` (re-)creates the chunk set; every one sets the
//!    pending id for the next binary frame
//! 4. **audio_complete**: reassembles, completes the turn, closes
//! 5. **error**: fails the output, closes
//! 6. **anything else**: warning, no state change

use crate::audio::buffer::SlotFill;
use crate::audio::{AudioReassemblyBuffer, Reassembly};
use crate::channel::transport::{Connector, NORMAL_CLOSURE};
use crate::channel::{pump, ChannelController, Emitter, Reaction};
use crate::error::AppError;
use crate::protocol::{decode_control, ControlFrame, WireMessage};
use crate::session::{Channel, SessionEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info};

/// Where the output stream of a task is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Connected, nothing decisive received yet
    Open,
    /// Audio announced or expected
    Streaming,
    /// A terminal signal was handled; nothing else changes state
    Finished,
}

/// State machine for one task's output connection.
#[derive(Debug)]
pub struct DownloadController {
    task_id: String,
    phase: Phase,
    pending_chunk: Option<u32>,
    buffer: AudioReassemblyBuffer,
}

impl DownloadController {
    pub fn new(task_id: impl Into<String>, media_type: &str) -> Self {
        Self {
            task_id: task_id.into(),
            phase: Phase::Open,
            pending_chunk: None,
            buffer: AudioReassemblyBuffer::new(media_type),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn is_finished(&self) -> bool {
        self.phase == Phase::Finished
    }

    fn warning(detail: impl Into<String>) -> SessionEvent {
        SessionEvent::ProtocolWarning {
            channel: Channel::Output,
            detail: detail.into(),
        }
    }

    fn finish(&mut self) {
        self.phase = Phase::Finished;
        self.pending_chunk = None;
    }

    /// Events for a finished audio stream.
    fn finalize_audio(&mut self) -> Vec<SessionEvent> {
        match self.buffer.finalize() {
            Ok(Reassembly::Audio(audio)) => vec![SessionEvent::AudioReady(audio)],
            Ok(Reassembly::Empty) => Vec::new(),
            Err(e) => vec![SessionEvent::AudioIncomplete(e.message().to_string())],
        }
    }

    fn on_binary(&mut self, bytes: Vec<u8>) -> Reaction {
        let chunk_id = match self.pending_chunk.take() {
            Some(chunk_id) => chunk_id,
            None => {
                return Reaction::emit(Self::warning(format!(
                    "{} byte binary frame without pending audio_chunk metadata",
                    bytes.len()
                )))
            }
        };

        match self.buffer.accept(chunk_id, bytes) {
            Ok(SlotFill::Filled) => {
                debug!(task_id = %self.task_id, chunk_id, "Audio chunk stored");
                Reaction::none()
            }
            Ok(SlotFill::Replaced) => {
                debug!(task_id = %self.task_id, chunk_id, "Duplicate audio chunk replaced");
                Reaction::none()
            }
            Err(e) => Reaction::emit(Self::warning(e.message())),
        }
    }

    fn on_frame(&mut self, frame: ControlFrame) -> Reaction {
        // Errors are accepted without an id; they are never task-tagged on the wire
        let needs_task = matches!(
            frame,
            ControlFrame::Success { .. }
                | ControlFrame::AudioChunk { .. }
                | ControlFrame::AudioComplete { .. }
        );
        match frame.task_id() {
            Some(frame_task) if frame_task != self.task_id => {
                return Reaction::emit(Self::warning(format!(
                    "{} frame for task {} on the output channel of {}",
                    frame.name(),
                    frame_task,
                    self.task_id
                )));
            }
            None if needs_task => {
                return Reaction::emit(Self::warning(format!(
                    "{} frame without a task id on the output channel of {}",
                    frame.name(),
                    self.task_id
                )));
            }
            _ => {}
        }

        match frame {
            ControlFrame::Success {
                content,
                audio_present,
                ..
            } => {
                let mut reaction = Reaction::emit(SessionEvent::TextReceived(content));
                if audio_present {
                    debug!(task_id = %self.task_id, "Text received, audio follows");
                    self.buffer.reset();
                    self.pending_chunk = None;
                    self.phase = Phase::Streaming;
                    reaction.events.push(SessionEvent::OutputStreaming);
                    reaction
                } else {
                    info!(task_id = %self.task_id, "Text-only reply received");
                    self.finish();
                    reaction.events.push(SessionEvent::OutputCompleted);
                    reaction.and_close()
                }
            }
            ControlFrame::AudioChunk {
                chunk_id,
                total_chunks,
                ..
            } => {
                let mut reaction = Reaction::none();
                if chunk_id == 0 {
                    match total_chunks {
                        Some(total) => {
                            debug!(task_id = %self.task_id, total, "Audio chunk set announced");
                            self.buffer.begin(total);
                        }
                        None => reaction.events.push(Self::warning(
                            "audio_chunk 0 did not announce total_chunks",
                        )),
                    }
                }
                self.pending_chunk = Some(chunk_id);

                if self.phase != Phase::Streaming {
                    self.phase = Phase::Streaming;
                    reaction.events.push(SessionEvent::OutputStreaming);
                }
                reaction
            }
            ControlFrame::AudioComplete { .. } => {
                info!(task_id = %self.task_id, "Audio stream complete");
                // Audio is posted first so the turn is never seen settled without it
                let mut events = self.finalize_audio();
                events.push(SessionEvent::OutputCompleted);
                self.finish();
                Reaction {
                    events,
                    close: true,
                }
            }
            ControlFrame::Error { message } => {
                self.finish();
                self.buffer.reset();
                Reaction::emit(SessionEvent::OutputFailed(message)).and_close()
            }
            other => Reaction::emit(Self::warning(format!(
                "unexpected {} frame on output channel",
                other.name()
            ))),
        }
    }
}

impl ChannelController for DownloadController {
    fn on_message(&mut self, message: WireMessage) -> Reaction {
        if self.is_finished() {
            debug!(task_id = %self.task_id, "Output already finished, ignoring message");
            return Reaction::none();
        }

        match message {
            WireMessage::Binary(bytes) => self.on_binary(bytes),
            WireMessage::Text(text) => match decode_control(&text) {
                Ok(frame) => self.on_frame(frame),
                Err(failure) if failure.is_fatal() => {
                    self.finish();
                    Reaction::emit(SessionEvent::OutputFailed(failure.to_string())).and_close()
                }
                Err(failure) => Reaction::emit(Self::warning(failure.to_string())),
            },
        }
    }

    fn on_close(&mut self, code: u16) -> Vec<SessionEvent> {
        if self.is_finished() {
            return Vec::new();
        }
        self.finish();

        if let Some((filled, total)) = self.buffer.discard_partial() {
            return vec![SessionEvent::OutputFailed(format!(
                "audio stream closed before all chunks arrived ({}/{} received)",
                filled, total
            ))];
        }

        if code == NORMAL_CLOSURE {
            let mut events = self.finalize_audio();
            events.push(SessionEvent::OutputCompleted);
            events
        } else {
            vec![SessionEvent::OutputFailed(
                "connection closed before completion".to_string(),
            )]
        }
    }
}

/// Drive the output connection of `task_id` until it ends.
pub async fn run_download(
    connector: Arc<dyn Connector>,
    url: String,
    task_id: String,
    media_type: String,
    connect_timeout: Duration,
    emitter: Emitter,
) {
    info!(url = %url, task_id = %task_id, "Opening output channel");

    let mut connection = match timeout(connect_timeout, connector.connect(&url)).await {
        Ok(Ok(connection)) => connection,
        Ok(Err(e)) => {
            error!(task_id = %task_id, error = %e, "Output channel failed to open");
            emitter.emit(SessionEvent::OutputFailed(e.to_string()));
            return;
        }
        Err(_) => {
            error!(task_id = %task_id, "Output channel connect timed out");
            emitter.emit(SessionEvent::OutputFailed(
                AppError::Transport(format!("connecting to {} timed out", url)).to_string(),
            ));
            return;
        }
    };

    let mut controller = DownloadController::new(task_id, &media_type);
    pump(connection.as_mut(), &mut controller, &emitter).await;
}
