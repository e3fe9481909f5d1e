//! # Session Status Machine
//!
//! The single source of truth for one turn: which task the backend assigned, how far
//! the upload and output channels have got, the last error and the results.
//!
//! ## Event Flow:
//! Channel drivers never touch the session. They post `SessionEvent`s onto one ordered
//! queue and the turn client applies them here one at a time. Applying an event may ask
//! the caller for a side effect (opening the output channel).
//!
//! ## Upload Lifecycle:
//! idle → connecting → uploading → queued, or → error from any non-terminal state
//!
//! ## Output Lifecycle:
//! idle → connecting → streaming → completed, or → error from any non-terminal state.
//! A text-only reply goes straight from connecting to completed.
//!
//! Terminal states are never left until the next reset.

use crate::audio::{AudioHandle, AudioObject, AudioStore, ReassembledAudio};
use crate::channel::transport::NORMAL_CLOSURE;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Progress of the input channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Idle,
    Connecting,
    Uploading,
    Queued,
    Error,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Idle => "idle",
            UploadStatus::Connecting => "connecting",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Queued => "queued",
            UploadStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadStatus::Queued | UploadStatus::Error)
    }
}

/// Progress of the output channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStatus {
    Idle,
    Connecting,
    Streaming,
    Completed,
    Error,
}

impl OutputStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStatus::Idle => "idle",
            OutputStatus::Connecting => "connecting",
            OutputStatus::Streaming => "streaming",
            OutputStatus::Completed => "completed",
            OutputStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OutputStatus::Completed | OutputStatus::Error)
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for OutputStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which connection an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Input,
    Output,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Input => "input",
            Channel::Output => "output",
        }
    }
}

/// Everything a channel driver can report.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// All upload frames, including `upload_complete`, were sent
    UploadSent,
    /// Backend assigned the task id
    TaskAssigned(String),
    /// Backend queued the upload; the input channel is done
    UploadQueued,
    /// Upload failed (transport, sentinel or backend error)
    UploadFailed(String),
    /// Input connection closed with this code
    UploadClosed { code: u16 },
    /// Output channel entered audio streaming
    OutputStreaming,
    /// Text result for the turn
    TextReceived(String),
    /// Output finished normally
    OutputCompleted,
    /// All audio chunks arrived and were joined
    AudioReady(ReassembledAudio),
    /// Audio finalization found missing chunks
    AudioIncomplete(String),
    /// Output failed (transport or backend error)
    OutputFailed(String),
    /// Non-fatal protocol violation
    ProtocolWarning { channel: Channel, detail: String },
    /// The stop request for the current task was rejected or never arrived
    InterruptFailed(String),
}

/// An event tagged with the turn it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub generation: u64,
    pub event: SessionEvent,
}

/// Side effect requested by applying an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Open the output channel for this task id
    OpenOutput(String),
}

/// Read-only copy of the observable fields, for UI code.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub task_id: Option<String>,
    pub upload_status: UploadStatus,
    pub output_status: OutputStatus,
    pub last_error: Option<String>,
    pub received_text: Option<String>,
    pub audio_handle: Option<AudioHandle>,
    pub protocol_warnings: u32,
}

/// The one active turn.
///
/// ## Rust Concepts:
/// - **Owned state**: the turn client owns the only `Session`; nothing else holds a
///   reference, so there is no way to have two active sessions
/// - **Option<T>**: fields that are unset until the backend fills them
#[derive(Debug)]
pub struct Session {
    task_id: Option<String>,
    upload_status: UploadStatus,
    output_status: OutputStatus,
    last_error: Option<String>,
    received_text: Option<String>,
    audio_handle: Option<AudioHandle>,
    protocol_warnings: u32,

    /// Task id the output channel was opened for in this session
    output_opened_for: Option<String>,

    /// Live audio handles; survives resets so released handles stay invalid
    audio_store: AudioStore,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            task_id: None,
            upload_status: UploadStatus::Idle,
            output_status: OutputStatus::Idle,
            last_error: None,
            received_text: None,
            audio_handle: None,
            protocol_warnings: 0,
            output_opened_for: None,
            audio_store: AudioStore::new(),
        }
    }

    /// Return every field to idle and release the playable audio handle.
    pub fn reset(&mut self) {
        if let Some(handle) = self.audio_handle.take() {
            self.audio_store.release(&handle);
            debug!(handle = %handle, "Released audio handle");
        }
        self.task_id = None;
        self.upload_status = UploadStatus::Idle;
        self.output_status = OutputStatus::Idle;
        self.last_error = None;
        self.received_text = None;
        self.protocol_warnings = 0;
        self.output_opened_for = None;
    }

    /// Mark the start of an upload (submit was called).
    pub fn begin_upload(&mut self) {
        self.upload_status = UploadStatus::Connecting;
    }

    pub fn task_id(&self) -> Option<&str> {
        self.task_id.as_deref()
    }

    pub fn upload_status(&self) -> UploadStatus {
        self.upload_status
    }

    pub fn output_status(&self) -> OutputStatus {
        self.output_status
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn received_text(&self) -> Option<&str> {
        self.received_text.as_deref()
    }

    pub fn audio_handle(&self) -> Option<&AudioHandle> {
        self.audio_handle.as_ref()
    }

    pub fn protocol_warnings(&self) -> u32 {
        self.protocol_warnings
    }

    /// Dereference a playable audio handle.
    pub fn resolve_audio(&self, handle: &AudioHandle) -> Option<Arc<AudioObject>> {
        self.audio_store.resolve(handle)
    }

    /// Whether nothing more can happen in this turn without a new submit.
    pub fn is_settled(&self) -> bool {
        let upload_done = matches!(
            self.upload_status,
            UploadStatus::Idle | UploadStatus::Queued | UploadStatus::Error
        );
        match self.output_status {
            OutputStatus::Completed | OutputStatus::Error => upload_done,
            // The output channel only opens once a task id exists
            OutputStatus::Idle => upload_done && self.task_id.is_none(),
            OutputStatus::Connecting | OutputStatus::Streaming => false,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            task_id: self.task_id.clone(),
            upload_status: self.upload_status,
            output_status: self.output_status,
            last_error: self.last_error.clone(),
            received_text: self.received_text.clone(),
            audio_handle: self.audio_handle.clone(),
            protocol_warnings: self.protocol_warnings,
        }
    }

    /// Apply one channel event.
    ///
    /// ## Returns:
    /// - **Some(Effect::OpenOutput)**: the first task id of this session was assigned
    /// - **None**: nothing for the caller to do
    pub fn apply(&mut self, event: SessionEvent) -> Option<Effect> {
        let effect = match event {
            SessionEvent::UploadSent => {
                if self.upload_status == UploadStatus::Connecting {
                    self.upload_status = UploadStatus::Uploading;
                }
                None
            }
            SessionEvent::TaskAssigned(task_id) => self.assign_task(task_id),
            SessionEvent::UploadQueued => {
                if !self.upload_status.is_terminal() {
                    self.upload_status = UploadStatus::Queued;
                }
                None
            }
            SessionEvent::UploadFailed(message) => {
                if self.upload_status.is_terminal() {
                    debug!(error = %message, "Upload already resolved, ignoring failure");
                } else {
                    warn!(error = %message, "Upload failed");
                    self.upload_status = UploadStatus::Error;
                    self.last_error = Some(message);
                }
                None
            }
            SessionEvent::UploadClosed { code } => {
                self.input_closed(code);
                None
            }
            SessionEvent::OutputStreaming => {
                if matches!(
                    self.output_status,
                    OutputStatus::Idle | OutputStatus::Connecting
                ) {
                    self.output_status = OutputStatus::Streaming;
                }
                None
            }
            SessionEvent::TextReceived(text) => {
                if self.output_status.is_terminal() {
                    warn!("Text result arrived after the output finished, ignoring");
                } else {
                    self.received_text = Some(text);
                }
                None
            }
            SessionEvent::OutputCompleted => {
                if !self.output_status.is_terminal() {
                    self.output_status = OutputStatus::Completed;
                }
                None
            }
            SessionEvent::AudioReady(audio) => {
                self.store_audio(audio);
                None
            }
            SessionEvent::AudioIncomplete(message) => {
                // Received text and the completed status stay as they are
                warn!(error = %message, "Audio could not be reassembled");
                self.last_error = Some(message);
                None
            }
            SessionEvent::OutputFailed(message) => {
                if self.output_status.is_terminal() {
                    debug!(error = %message, "Output already resolved, ignoring failure");
                } else {
                    warn!(error = %message, "Output failed");
                    self.output_status = OutputStatus::Error;
                    self.last_error = Some(message);
                }
                None
            }
            SessionEvent::ProtocolWarning { channel, detail } => {
                warn!(channel = channel.as_str(), detail = %detail, "Protocol violation");
                self.protocol_warnings += 1;
                None
            }
            SessionEvent::InterruptFailed(message) => {
                // Advisory: neither channel status moves
                warn!(error = %message, "Interrupt failed");
                self.last_error = Some(message);
                None
            }
        };

        debug!(
            task_id = self.task_id.as_deref().unwrap_or("-"),
            upload = %self.upload_status,
            output = %self.output_status,
            "Session updated"
        );

        effect
    }

    fn assign_task(&mut self, task_id: String) -> Option<Effect> {
        match &self.task_id {
            Some(current) if *current == task_id => {
                debug!(task_id = %task_id, "Task id repeated");
                None
            }
            Some(current) => {
                warn!(
                    current = %current,
                    ignored = %task_id,
                    "Second task id assigned within one session, ignoring"
                );
                self.protocol_warnings += 1;
                None
            }
            None => {
                info!(task_id = %task_id, "Task id assigned");
                self.task_id = Some(task_id.clone());

                if self.output_opened_for.as_deref() == Some(task_id.as_str()) {
                    return None;
                }
                self.output_opened_for = Some(task_id.clone());
                self.output_status = OutputStatus::Connecting;
                Some(Effect::OpenOutput(task_id))
            }
        }
    }

    fn input_closed(&mut self, code: u16) {
        if self.upload_status.is_terminal() || self.upload_status == UploadStatus::Idle {
            return;
        }

        if self.output_status == OutputStatus::Completed {
            // The backend evidently processed the upload already
            debug!(code, "Input closed after the output completed");
            self.upload_status = UploadStatus::Queued;
            return;
        }

        let message = if code == NORMAL_CLOSURE {
            "input connection closed before the upload was queued".to_string()
        } else if self.task_id.is_none() {
            format!("input connection lost before a task id was assigned (code {})", code)
        } else {
            format!("input connection lost (code {})", code)
        };
        warn!(code, error = %message, "Input connection closed early");
        self.upload_status = UploadStatus::Error;
        self.last_error = Some(message);
    }

    fn store_audio(&mut self, audio: ReassembledAudio) {
        if let Some(previous) = self.audio_handle.take() {
            self.audio_store.release(&previous);
        }
        let chunks = audio.chunk_count;
        let size = audio.bytes.len();
        let handle = self.audio_store.register(audio);
        info!(handle = %handle, chunks, size, "Audio ready");
        self.audio_handle = Some(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio(bytes: &[u8]) -> ReassembledAudio {
        ReassembledAudio {
            media_type: "audio/mpeg".to_string(),
            bytes: bytes.to_vec(),
            chunk_count: 1,
        }
    }

    #[test]
    fn test_text_turn_lifecycle() {
        let mut session = Session::new();
        session.begin_upload();
        assert_eq!(session.upload_status(), UploadStatus::Connecting);

        assert_eq!(session.apply(SessionEvent::UploadSent), None);
        assert_eq!(session.upload_status(), UploadStatus::Uploading);

        let effect = session.apply(SessionEvent::TaskAssigned("t1".to_string()));
        assert_eq!(effect, Some(Effect::OpenOutput("t1".to_string())));
        assert_eq!(session.output_status(), OutputStatus::Connecting);

        session.apply(SessionEvent::UploadQueued);
        session.apply(SessionEvent::TextReceived("hi".to_string()));
        session.apply(SessionEvent::OutputCompleted);

        let snapshot = session.snapshot();
        assert_eq!(snapshot.upload_status, UploadStatus::Queued);
        assert_eq!(snapshot.output_status, OutputStatus::Completed);
        assert_eq!(snapshot.received_text.as_deref(), Some("hi"));
        assert!(snapshot.audio_handle.is_none());
        assert!(session.is_settled());
    }

    #[test]
    fn test_output_opens_once_per_task() {
        let mut session = Session::new();
        session.begin_upload();
        assert!(session
            .apply(SessionEvent::TaskAssigned("t1".to_string()))
            .is_some());
        assert!(session
            .apply(SessionEvent::TaskAssigned("t1".to_string()))
            .is_none());
        assert!(session
            .apply(SessionEvent::TaskAssigned("t9".to_string()))
            .is_none());
        assert_eq!(session.task_id(), Some("t1"));
        assert_eq!(session.protocol_warnings(), 1);
    }

    #[test]
    fn test_terminal_states_are_not_left() {
        let mut session = Session::new();
        session.begin_upload();
        session.apply(SessionEvent::TaskAssigned("t1".to_string()));
        session.apply(SessionEvent::OutputFailed("boom".to_string()));
        session.apply(SessionEvent::OutputCompleted);
        session.apply(SessionEvent::OutputFailed("later".to_string()));
        assert_eq!(session.output_status(), OutputStatus::Error);
        assert_eq!(session.last_error(), Some("boom"));

        session.apply(SessionEvent::UploadQueued);
        session.apply(SessionEvent::UploadFailed("late".to_string()));
        session.apply(SessionEvent::UploadClosed { code: 1006 });
        assert_eq!(session.upload_status(), UploadStatus::Queued);
    }

    #[test]
    fn test_channel_errors_stay_local() {
        let mut session = Session::new();
        session.begin_upload();
        session.apply(SessionEvent::UploadSent);
        session.apply(SessionEvent::TaskAssigned("t1".to_string()));
        session.apply(SessionEvent::UploadFailed("Chunk ID mismatch".to_string()));

        assert_eq!(session.upload_status(), UploadStatus::Error);
        assert_eq!(session.output_status(), OutputStatus::Connecting);
        assert!(!session.is_settled());
    }

    #[test]
    fn test_input_close_before_task_id_is_error() {
        let mut session = Session::new();
        session.begin_upload();
        session.apply(SessionEvent::UploadClosed { code: 1006 });

        assert_eq!(session.upload_status(), UploadStatus::Error);
        assert!(session.last_error().unwrap().contains("before a task id"));
        assert!(session.is_settled());
    }

    #[test]
    fn test_input_close_after_output_completed_is_not_an_error() {
        let mut session = Session::new();
        session.begin_upload();
        session.apply(SessionEvent::UploadSent);
        session.apply(SessionEvent::TaskAssigned("t1".to_string()));
        session.apply(SessionEvent::TextReceived("hi".to_string()));
        session.apply(SessionEvent::OutputCompleted);
        session.apply(SessionEvent::UploadClosed { code: 1006 });

        assert_eq!(session.upload_status(), UploadStatus::Queued);
        assert!(session.last_error().is_none());
    }

    #[test]
    fn test_audio_handles_are_released() {
        let mut session = Session::new();
        session.apply(SessionEvent::AudioReady(audio(b"one")));
        let first = session.audio_handle().cloned().unwrap();

        session.apply(SessionEvent::AudioReady(audio(b"two")));
        let second = session.audio_handle().cloned().unwrap();
        assert!(session.resolve_audio(&first).is_none());
        assert_eq!(session.resolve_audio(&second).unwrap().bytes, b"two");

        session.reset();
        assert!(session.resolve_audio(&second).is_none());
        assert_eq!(session.snapshot().output_status, OutputStatus::Idle);
    }

    #[test]
    fn test_audio_incomplete_keeps_text_and_status() {
        let mut session = Session::new();
        session.begin_upload();
        session.apply(SessionEvent::TaskAssigned("t2".to_string()));
        session.apply(SessionEvent::TextReceived("hi".to_string()));
        session.apply(SessionEvent::OutputStreaming);
        session.apply(SessionEvent::OutputCompleted);
        session.apply(SessionEvent::AudioIncomplete("missing chunks".to_string()));

        assert_eq!(session.output_status(), OutputStatus::Completed);
        assert_eq!(session.received_text(), Some("hi"));
        assert_eq!(session.last_error(), Some("missing chunks"));
        assert!(session.audio_handle().is_none());
    }

    #[test]
    fn test_interrupt_failure_only_sets_last_error() {
        let mut session = Session::new();
        session.begin_upload();
        session.apply(SessionEvent::UploadSent);
        session.apply(SessionEvent::TaskAssigned("t3".to_string()));
        let before = session.snapshot();

        let effect = session.apply(SessionEvent::InterruptFailed(
            "Session t3 not found".to_string(),
        ));

        assert_eq!(effect, None);
        assert_eq!(session.upload_status(), before.upload_status);
        assert_eq!(session.output_status(), before.output_status);
        assert_eq!(session.last_error(), Some("Session t3 not found"));
        assert!(!session.is_settled());
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let session = Session::new();
        let value = serde_json::to_value(session.snapshot()).unwrap();
        assert_eq!(value["uploadStatus"], "idle");
        assert_eq!(value["outputStatus"], "idle");
        assert!(value["taskId"].is_null());
    }
}
