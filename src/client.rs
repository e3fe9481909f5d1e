//! # Turn Client
//!
//! Owns the one `Session`, starts the channel drivers for a turn and applies their
//! events in arrival order.
//!
//! ## Turn Flow:
//! 1. `submit_text`/`submit_audio` resets the session, tears down both channels and
//!    spawns the upload driver
//! 2. `next_update` applies the next queued event; a first task id opens the output
//!    channel for that id
//! 3. `run_until_settled` repeats step 2 until neither channel can change any more
//!
//! ## Rust Concepts:
//! - **Generation counter**: every turn gets a new number and events carry the number
//!   of the turn that produced them, so a late event from an aborted driver is dropped
//! - **JoinHandle::abort**: tears a driver task down wherever it is suspended

use crate::audio::{AudioHandle, AudioObject, RecordedInput};
use crate::channel::upload::UploadTimeouts;
use crate::channel::{run_download, run_upload, Connector, Emitter, UploadPayload, WsConnector};
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::interrupt::{HttpInterrupter, Interrupter};
use crate::session::{Effect, Envelope, Session, SessionEvent, SessionSnapshot};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Client side of one conversation, one turn at a time.
pub struct TurnClient {
    config: AppConfig,
    connector: Arc<dyn Connector>,
    interrupter: Arc<dyn Interrupter>,
    session: Session,
    generation: u64,
    events_tx: UnboundedSender<Envelope>,
    events_rx: UnboundedReceiver<Envelope>,
    upload: Option<JoinHandle<()>>,
    download: Option<(String, JoinHandle<()>)>,
}

impl TurnClient {
    pub fn new(
        config: AppConfig,
        connector: Arc<dyn Connector>,
        interrupter: Arc<dyn Interrupter>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            config,
            connector,
            interrupter,
            session: Session::new(),
            generation: 0,
            events_tx,
            events_rx,
            upload: None,
            download: None,
        }
    }

    /// Client talking WebSocket and HTTP to the configured gateway.
    pub fn from_config(config: AppConfig) -> AppResult<Self> {
        config
            .validate()
            .map_err(|e| AppError::ConfigError(e.to_string()))?;
        let interrupter = HttpInterrupter::new(&config)?;
        Ok(Self::new(
            config,
            Arc::new(WsConnector::new()),
            Arc::new(interrupter),
        ))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.session.snapshot()
    }

    /// Dereference the playable audio handle of the current turn.
    pub fn resolve_audio(&self, handle: &AudioHandle) -> Option<Arc<AudioObject>> {
        self.session.resolve_audio(handle)
    }

    /// Start a text turn.
    ///
    /// ## Returns:
    /// - **Err(ValidationError)**: the content is empty; the current turn is untouched
    pub fn submit_text(&mut self, content: &str) -> AppResult<()> {
        if content.trim().is_empty() {
            return Err(AppError::ValidationError(
                "Text content cannot be empty".to_string(),
            ));
        }
        self.start_turn(UploadPayload::Text(content.to_string()));
        Ok(())
    }

    /// Start an audio turn from a finished recording.
    pub fn submit_audio(&mut self, recording: RecordedInput) -> AppResult<()> {
        if recording.is_empty() {
            return Err(AppError::ValidationError(
                "Recording has no segments".to_string(),
            ));
        }
        self.start_turn(UploadPayload::Audio(recording));
        Ok(())
    }

    fn start_turn(&mut self, payload: UploadPayload) {
        self.teardown();
        self.session.begin_upload();

        let url = self.config.gateway.input_url();
        info!(
            generation = self.generation,
            kind = payload.kind().as_str(),
            "Starting turn"
        );

        let timeouts = UploadTimeouts {
            connect: self.config.client.connect_timeout(),
            task_id: self.config.client.task_id_timeout(),
        };
        self.upload = Some(tokio::spawn(run_upload(
            self.connector.clone(),
            url,
            payload,
            timeouts,
            self.emitter(),
        )));
    }

    fn emitter(&self) -> Emitter {
        Emitter::new(self.generation, self.events_tx.clone())
    }

    /// Abort both channels, release audio and return the session to idle.
    pub fn teardown(&mut self) {
        if let Some(upload) = self.upload.take() {
            upload.abort();
        }
        if let Some((task_id, download)) = self.download.take() {
            debug!(task_id = %task_id, "Closing output channel");
            download.abort();
        }
        // Anything still queued belongs to the previous turn
        self.generation += 1;
        self.session.reset();
    }

    /// Apply the next event of the current turn and return the resulting state.
    ///
    /// Returns `None` only if the event queue is gone, which cannot happen while
    /// the client is alive.
    pub async fn next_update(&mut self) -> Option<SessionSnapshot> {
        loop {
            let envelope = self.events_rx.recv().await?;
            if envelope.generation != self.generation {
                debug!(
                    stale = envelope.generation,
                    current = self.generation,
                    "Dropping event from an earlier turn"
                );
                continue;
            }
            self.apply(envelope.event);
            return Some(self.session.snapshot());
        }
    }

    fn apply(&mut self, event: SessionEvent) {
        if let Some(Effect::OpenOutput(task_id)) = self.session.apply(event) {
            self.open_output(task_id);
        }
    }

    fn open_output(&mut self, task_id: String) {
        if let Some((open_for, handle)) = &self.download {
            if *open_for == task_id && !handle.is_finished() {
                warn!(task_id = %task_id, "Output channel already open for this task");
                return;
            }
        }
        if let Some((_, previous)) = self.download.take() {
            previous.abort();
        }

        let url = self.config.gateway.output_url(&task_id);
        let handle = tokio::spawn(run_download(
            self.connector.clone(),
            url,
            task_id.clone(),
            self.config.audio.media_type.clone(),
            self.config.client.connect_timeout(),
            self.emitter(),
        ));
        self.download = Some((task_id, handle));
    }

    /// Apply events until the turn is settled.
    ///
    /// ## Returns:
    /// - **Ok(snapshot)**: final state (which may itself report an error)
    /// - **Err(Transport)**: the turn did not settle within `client.turn_timeout_ms`
    pub async fn run_until_settled(&mut self) -> AppResult<SessionSnapshot> {
        let limit = self.config.client.turn_timeout();
        let settle = async {
            while !self.session.is_settled() {
                if self.next_update().await.is_none() {
                    break;
                }
            }
        };

        if tokio::time::timeout(limit, settle).await.is_err() {
            return Err(AppError::Transport(format!(
                "turn did not settle within {} ms",
                limit.as_millis()
            )));
        }
        self.apply_pending();
        Ok(self.session.snapshot())
    }

    /// Apply whatever the drivers already queued, without waiting.
    fn apply_pending(&mut self) {
        while let Ok(envelope) = self.events_rx.try_recv() {
            if envelope.generation == self.generation {
                self.apply(envelope.event);
            }
        }
    }

    /// Ask the backend to stop the current task.
    ///
    /// Returns `false` without sending anything when no task id is known. The request
    /// runs on its own task so the caller never waits on the network; a failure comes
    /// back through the event queue as `InterruptFailed` and only sets the last error.
    pub fn interrupt(&self) -> bool {
        let task_id = match self.session.task_id() {
            Some(task_id) => task_id.to_string(),
            None => {
                debug!("No task id yet, nothing to interrupt");
                return false;
            }
        };

        info!(task_id = %task_id, "Sending interrupt");
        let interrupter = Arc::clone(&self.interrupter);
        let emitter = self.emitter();
        tokio::spawn(async move {
            if let Err(e) = interrupter.stop(&task_id).await {
                warn!(task_id = %task_id, error = %e, "Interrupt failed");
                emitter.emit(SessionEvent::InterruptFailed(e.message().to_string()));
            }
        });
        true
    }
}

impl Drop for TurnClient {
    fn drop(&mut self) {
        if let Some(upload) = self.upload.take() {
            upload.abort();
        }
        if let Some((_, download)) = self.download.take() {
            download.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::memory::{MemoryConnector, MemoryPeer, PeerEvent};
    use crate::protocol::{ControlFrame, WireMessage};
    use crate::session::{OutputStatus, UploadStatus};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::{Duration, Instant};
    use tokio::sync::mpsc::UnboundedReceiver as PeerQueue;

    /// Records stop requests; optionally answers late and/or fails them.
    #[derive(Default)]
    struct RecordingInterrupter {
        calls: Mutex<Vec<String>>,
        fail_with: Option<String>,
        delay: Duration,
    }

    #[async_trait]
    impl Interrupter for RecordingInterrupter {
        async fn stop(&self, session_id: &str) -> AppResult<()> {
            self.calls.lock().unwrap().push(session_id.to_string());
            tokio::time::sleep(self.delay).await;
            match &self.fail_with {
                Some(message) => Err(AppError::Backend(message.clone())),
                None => Ok(()),
            }
        }
    }

    fn client_with(interrupter: Arc<RecordingInterrupter>) -> (TurnClient, PeerQueue<MemoryPeer>) {
        let (connector, peers) = MemoryConnector::new();
        let mut config = AppConfig::default();
        config.client.turn_timeout_ms = 2_000;
        config.client.task_id_timeout_ms = 1_000;
        let client = TurnClient::new(config, Arc::new(connector), interrupter);
        (client, peers)
    }

    async fn drain_upload(peer: &mut MemoryPeer, frames: usize) -> Vec<WireMessage> {
        let mut sent = Vec::new();
        for _ in 0..frames {
            match peer.next_sent().await {
                Some(PeerEvent::Message(message)) => sent.push(message),
                other => panic!("expected an upload frame, got {:?}", other),
            }
        }
        sent
    }

    /// Apply updates until the output channel has been opened.
    async fn await_output_peer(
        client: &mut TurnClient,
        peers: &mut PeerQueue<MemoryPeer>,
    ) -> MemoryPeer {
        loop {
            tokio::select! {
                peer = peers.recv() => return peer.unwrap(),
                update = client.next_update() => { update.unwrap(); }
            }
        }
    }

    #[tokio::test]
    async fn test_text_turn_without_audio() {
        let (mut client, mut peers) = client_with(Arc::default());
        client.submit_text("hello").unwrap();
        assert_eq!(client.snapshot().upload_status, UploadStatus::Connecting);

        let mut input = peers.recv().await.unwrap();
        assert_eq!(input.url(), "ws://127.0.0.1:8000/ws/input");
        let sent = drain_upload(&mut input, 3).await;
        assert_eq!(sent[1], WireMessage::Binary(b"hello".to_vec()));

        input.send_control(&ControlFrame::TaskIdAssigned {
            task_id: "t1".to_string(),
        });
        let output = await_output_peer(&mut client, &mut peers).await;
        assert_eq!(output.url(), "ws://127.0.0.1:8000/ws/output/t1");

        input.send_control(&ControlFrame::UploadQueued {
            task_id: Some("t1".to_string()),
        });
        output.send_control(&ControlFrame::Success {
            task_id: Some("t1".to_string()),
            content: "hi".to_string(),
            audio_present: false,
        });

        let snapshot = client.run_until_settled().await.unwrap();
        assert_eq!(snapshot.task_id.as_deref(), Some("t1"));
        assert_eq!(snapshot.upload_status, UploadStatus::Queued);
        assert_eq!(snapshot.output_status, OutputStatus::Completed);
        assert_eq!(snapshot.received_text.as_deref(), Some("hi"));
        assert!(snapshot.audio_handle.is_none());
        assert!(snapshot.last_error.is_none());
    }

    #[tokio::test]
    async fn test_audio_turn_reassembles_reply() {
        let (mut client, mut peers) = client_with(Arc::default());
        let recording = RecordedInput::new(vec![vec![1; 4], vec![2; 4], vec![3; 2]]);
        client.submit_audio(recording).unwrap();

        let mut input = peers.recv().await.unwrap();
        input.send_control(&ControlFrame::TaskIdAssigned {
            task_id: "t2".to_string(),
        });
        let output = await_output_peer(&mut client, &mut peers).await;

        let sent = drain_upload(&mut input, 7).await;
        assert_eq!(sent.iter().filter(|m| m.is_binary()).count(), 3);
        input.send_control(&ControlFrame::UploadQueued {
            task_id: Some("t2".to_string()),
        });
        assert_eq!(input.next_sent().await, Some(PeerEvent::Closed(1000)));

        output.send_control(&ControlFrame::AudioChunk {
            task_id: Some("t2".to_string()),
            chunk_id: 0,
            total_chunks: Some(2),
        });
        output.send_binary(b"AAA".to_vec());
        output.send_control(&ControlFrame::AudioChunk {
            task_id: Some("t2".to_string()),
            chunk_id: 1,
            total_chunks: None,
        });
        output.send_binary(b"BB".to_vec());
        output.send_control(&ControlFrame::AudioComplete {
            task_id: Some("t2".to_string()),
        });

        let snapshot = client.run_until_settled().await.unwrap();
        assert_eq!(snapshot.output_status, OutputStatus::Completed);
        let handle = snapshot.audio_handle.unwrap();
        let audio = client.resolve_audio(&handle).unwrap();
        assert_eq!(audio.bytes, b"AAABB");
        assert_eq!(audio.media_type, "audio/mpeg");
    }

    #[tokio::test]
    async fn test_abnormal_close_mid_audio() {
        let (mut client, mut peers) = client_with(Arc::default());
        client.submit_text("hello").unwrap();

        let input = peers.recv().await.unwrap();
        input.send_control(&ControlFrame::TaskIdAssigned {
            task_id: "t3".to_string(),
        });
        let output = await_output_peer(&mut client, &mut peers).await;
        input.send_control(&ControlFrame::UploadQueued { task_id: None });

        output.send_control(&ControlFrame::AudioChunk {
            task_id: Some("t3".to_string()),
            chunk_id: 0,
            total_chunks: Some(2),
        });
        output.send_binary(vec![0u8; 8]);
        output.close(1006);

        let snapshot = client.run_until_settled().await.unwrap();
        assert_eq!(snapshot.output_status, OutputStatus::Error);
        assert!(snapshot.audio_handle.is_none());
        assert!(snapshot
            .last_error
            .unwrap()
            .contains("before all chunks arrived"));
    }

    #[tokio::test]
    async fn test_new_turn_discards_previous_one() {
        let (mut client, mut peers) = client_with(Arc::default());
        client.submit_text("first").unwrap();
        let first_input = peers.recv().await.unwrap();

        client.submit_text("second").unwrap();
        let second_input = peers.recv().await.unwrap();

        // The aborted driver's peer may still send; none of it reaches the session
        first_input.send_control(&ControlFrame::TaskIdAssigned {
            task_id: "old".to_string(),
        });
        second_input.send_control(&ControlFrame::TaskIdAssigned {
            task_id: "new".to_string(),
        });

        let output = await_output_peer(&mut client, &mut peers).await;
        assert!(output.url().ends_with("/new"));
        assert_eq!(client.snapshot().task_id.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_empty_submissions_are_rejected() {
        let (mut client, _peers) = client_with(Arc::default());
        assert!(matches!(
            client.submit_text("   "),
            Err(AppError::ValidationError(_))
        ));
        assert!(matches!(
            client.submit_audio(RecordedInput::default()),
            Err(AppError::ValidationError(_))
        ));
        assert_eq!(client.snapshot().upload_status, UploadStatus::Idle);
    }

    #[tokio::test]
    async fn test_interrupt_is_advisory() {
        let interrupter = Arc::new(RecordingInterrupter {
            fail_with: Some("session not found".to_string()),
            ..Default::default()
        });
        let (mut client, mut peers) = client_with(interrupter.clone());

        assert!(!client.interrupt());
        assert!(interrupter.calls.lock().unwrap().is_empty());

        client.submit_text("hello").unwrap();
        let input = peers.recv().await.unwrap();
        input.send_control(&ControlFrame::TaskIdAssigned {
            task_id: "t4".to_string(),
        });
        let _output = await_output_peer(&mut client, &mut peers).await;

        assert!(client.interrupt());
        assert!(client.interrupt());

        tokio::time::timeout(Duration::from_secs(1), async {
            while client.snapshot().last_error.is_none()
                || interrupter.calls.lock().unwrap().len() < 2
            {
                client.next_update().await.unwrap();
            }
        })
        .await
        .expect("interrupt failure reported");

        let after = client.snapshot();
        assert_eq!(*interrupter.calls.lock().unwrap(), vec!["t4", "t4"]);
        assert_eq!(after.output_status, OutputStatus::Connecting);
        assert_ne!(after.upload_status, UploadStatus::Error);
        assert_eq!(after.last_error.as_deref(), Some("session not found"));
    }

    #[tokio::test]
    async fn test_slow_interrupt_does_not_block_caller() {
        let interrupter = Arc::new(RecordingInterrupter {
            fail_with: Some("gateway timed out".to_string()),
            delay: Duration::from_millis(500),
            ..Default::default()
        });
        let (mut client, mut peers) = client_with(interrupter.clone());

        client.submit_text("hello").unwrap();
        let input = peers.recv().await.unwrap();
        input.send_control(&ControlFrame::TaskIdAssigned {
            task_id: "t5".to_string(),
        });
        let _output = await_output_peer(&mut client, &mut peers).await;

        let started = Instant::now();
        assert!(client.interrupt());
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(client.snapshot().last_error, None);

        tokio::time::timeout(Duration::from_secs(2), async {
            while client.snapshot().last_error.is_none() {
                client.next_update().await.unwrap();
            }
        })
        .await
        .expect("late interrupt failure reported");

        let after = client.snapshot();
        assert_eq!(after.last_error.as_deref(), Some("gateway timed out"));
        assert_eq!(after.output_status, OutputStatus::Connecting);
        assert_eq!(*interrupter.calls.lock().unwrap(), vec!["t5"]);
    }
}
