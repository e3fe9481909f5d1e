//! # Gateway WebSocket Actors
//!
//! The two sockets of a turn, served by the loopback gateway:
//! - `InputSocket` on the input route: assigns the task id, collects `data_chunk`+binary
//!   pairs and queues the reply on `upload_complete`
//! - `OutputSocket` on the output route: waits for the task's reply and streams it back as
//!   a `success` frame followed by `audio_chunk`+binary pairs and `audio_complete`
//!
//! ## Actor Model:
//! Each connection is an independent actix actor. The actors never address each other
//! directly; they meet in `GatewayState`. An output socket registers its `Recipient`
//! there, and whoever settles the task (the input socket on `upload_complete`, the stop
//! handler, or an abandoned upload) pushes a `ReplyEvent` to it with `do_send`.

use super::state::{GatewayState, OutputAttach, Reply, ReplyEvent, TaskOutcome};
use crate::protocol::{
    decode_control, encode_control, ControlFrame, DecodeFailure, PayloadKind, CHUNK_ACK,
};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const NO_METADATA: &str = "Error: No metadata received before binary data";
const INVALID_JSON: &str = "Invalid JSON format";
const EMPTY_PAYLOAD: &str = "text_payload_empty";

/// Upload state of one input connection, kept apart from the actor so it can be
/// exercised without a socket.
#[derive(Debug, Default)]
pub struct UploadAssembler {
    kind: Option<PayloadKind>,
    expected_chunk: u32,
    /// Metadata received, binary frame not yet
    awaiting_binary: bool,
    bytes: Vec<u8>,
}

impl UploadAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept the metadata announcing the next binary frame.
    ///
    /// ## Returns:
    /// - **Err(text)**: the plain-text rejection to send back
    pub fn on_metadata(&mut self, kind: PayloadKind, chunk_id: u32) -> Result<(), String> {
        if chunk_id != self.expected_chunk {
            return Err(format!(
                "Chunk ID mismatch: expected {}, got {}",
                self.expected_chunk, chunk_id
            ));
        }
        if self.kind.is_none() {
            self.kind = Some(kind);
        }
        self.awaiting_binary = true;
        Ok(())
    }

    /// Append a binary frame announced by the previous metadata.
    pub fn on_binary(&mut self, data: &[u8]) -> Result<(), String> {
        if !self.awaiting_binary {
            return Err(NO_METADATA.to_string());
        }
        self.bytes.extend_from_slice(data);
        self.awaiting_binary = false;
        self.expected_chunk += 1;
        Ok(())
    }

    pub fn chunks_received(&self) -> u32 {
        self.expected_chunk
    }

    /// Build the reply for the finished upload.
    ///
    /// Text is echoed back. Audio is answered with a short summary and the uploaded bytes
    /// as the reply audio.
    pub fn finish(self) -> Result<Reply, &'static str> {
        if self.bytes.is_empty() {
            return Err(EMPTY_PAYLOAD);
        }

        match self.kind.unwrap_or(PayloadKind::Text) {
            PayloadKind::Text => Ok(Reply {
                content: String::from_utf8_lossy(&self.bytes).into_owned(),
                audio: None,
            }),
            PayloadKind::Audio => Ok(Reply {
                content: format!(
                    "Received {} bytes of audio in {} chunks",
                    self.bytes.len(),
                    self.expected_chunk
                ),
                audio: Some(self.bytes),
            }),
        }
    }
}

/// Split a reply into the frames the output socket sends, in order.
pub fn reply_frames(task_id: &str, reply: Reply, chunk_bytes: usize) -> Vec<OutboundFrame> {
    let audio = reply.audio.filter(|bytes| !bytes.is_empty());
    let mut frames = vec![OutboundFrame::Control(ControlFrame::Success {
        task_id: Some(task_id.to_string()),
        content: reply.content,
        audio_present: audio.is_some(),
    })];

    if let Some(bytes) = audio {
        let chunk_bytes = chunk_bytes.max(1);
        let total = bytes.len().div_ceil(chunk_bytes) as u32;
        for (chunk_id, chunk) in bytes.chunks(chunk_bytes).enumerate() {
            frames.push(OutboundFrame::Control(ControlFrame::AudioChunk {
                task_id: Some(task_id.to_string()),
                chunk_id: chunk_id as u32,
                total_chunks: Some(total),
            }));
            frames.push(OutboundFrame::Binary(chunk.to_vec()));
        }
        frames.push(OutboundFrame::Control(ControlFrame::AudioComplete {
            task_id: Some(task_id.to_string()),
        }));
    }

    frames
}

/// One message queued for an output socket.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Control(ControlFrame),
    Binary(Vec<u8>),
}

fn start_heartbeat<A>(ctx: &mut ws::WebsocketContext<A>, state: &GatewayState)
where
    A: Actor<Context = ws::WebsocketContext<A>> + Heartbeat,
{
    let config = state.get_config();
    let interval = Duration::from_secs(config.server.heartbeat_interval_secs.max(1));
    let timeout = Duration::from_secs(config.server.client_timeout_secs.max(1));

    ctx.run_interval(interval, move |act, ctx| {
        if Instant::now().duration_since(act.last_heartbeat()) > timeout {
            warn!("WebSocket heartbeat timeout, closing connection");
            ctx.stop();
        } else {
            ctx.ping(b"");
        }
    });
}

/// Access to the time of the last frame seen from the peer.
trait Heartbeat {
    fn last_heartbeat(&self) -> Instant;
}

/// Input socket: one upload per connection.
pub struct InputSocket {
    task_id: String,
    state: GatewayState,
    upload: Option<UploadAssembler>,
    last_heartbeat: Instant,
}

impl InputSocket {
    pub fn new(state: GatewayState) -> Self {
        Self {
            task_id: uuid::Uuid::new_v4().to_string(),
            state,
            upload: Some(UploadAssembler::new()),
            last_heartbeat: Instant::now(),
        }
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let frame = match decode_control(text) {
            Ok(frame) => frame,
            Err(failure @ DecodeFailure::Unrecognized(_)) => {
                warn!(task_id = %self.task_id, error = %failure, "Ignoring unknown input frame");
                return;
            }
            Err(failure) => {
                warn!(task_id = %self.task_id, error = %failure, "Rejected input frame");
                ctx.text(INVALID_JSON);
                return;
            }
        };

        let upload = match self.upload.as_mut() {
            Some(upload) => upload,
            None => {
                debug!(task_id = %self.task_id, frame = frame.name(), "Frame after upload completed");
                return;
            }
        };

        match frame {
            ControlFrame::DataChunk { kind, chunk_id } => {
                if let Err(rejection) = upload.on_metadata(kind, chunk_id) {
                    warn!(task_id = %self.task_id, error = %rejection, "Chunk rejected");
                    ctx.text(rejection);
                }
            }
            ControlFrame::UploadComplete => self.complete_upload(ctx),
            other => {
                warn!(task_id = %self.task_id, frame = other.name(), "Unexpected frame on input socket");
            }
        }
    }

    fn handle_binary(&mut self, data: &[u8], ctx: &mut ws::WebsocketContext<Self>) {
        let result = match self.upload.as_mut() {
            Some(upload) => upload.on_binary(data),
            None => Err(NO_METADATA.to_string()),
        };

        match result {
            Ok(()) => {
                debug!(task_id = %self.task_id, bytes = data.len(), "Chunk received");
                ctx.text(CHUNK_ACK);
            }
            Err(rejection) => ctx.text(rejection),
        }
    }

    fn complete_upload(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let upload = match self.upload.take() {
            Some(upload) => upload,
            None => return,
        };
        let chunks = upload.chunks_received();

        match upload.finish() {
            Ok(reply) => {
                if self.state.complete_upload(&self.task_id, reply) {
                    info!(task_id = %self.task_id, chunks, "Upload queued");
                } else {
                    // Stopped while uploading; the output socket reports it
                    info!(task_id = %self.task_id, "Upload completed for a stopped task");
                }
                ctx.text(encode_control(&ControlFrame::UploadQueued {
                    task_id: Some(self.task_id.clone()),
                }));
            }
            Err(reason) => {
                warn!(task_id = %self.task_id, error = reason, "Upload rejected");
                self.state.abandon_task(&self.task_id);
                ctx.text(encode_control(&ControlFrame::Error {
                    message: reason.to_string(),
                }));
            }
        }
    }
}

impl Heartbeat for InputSocket {
    fn last_heartbeat(&self) -> Instant {
        self.last_heartbeat
    }
}

impl Actor for InputSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.state.register_task(&self.task_id);
        self.state.connection_opened();
        info!(task_id = %self.task_id, "Input connection started");

        ctx.text(encode_control(&ControlFrame::TaskIdAssigned {
            task_id: self.task_id.clone(),
        }));
        start_heartbeat(ctx, &self.state);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.state.connection_closed();
        if self.upload.is_some() {
            self.state.abandon_task(&self.task_id);
        }
        info!(task_id = %self.task_id, "Input connection stopped");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for InputSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_heartbeat = Instant::now();
        match msg {
            Ok(ws::Message::Text(text)) => self.handle_text(&text, ctx),
            Ok(ws::Message::Binary(data)) => self.handle_binary(&data, ctx),
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                debug!(task_id = %self.task_id, reason = ?reason, "Input socket closed by client");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(task_id = %self.task_id, error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

/// Output socket: streams the reply of one task.
pub struct OutputSocket {
    task_id: String,
    state: GatewayState,
    chunk_bytes: usize,
    /// Registered in `GatewayState` as the task's waiting output
    waiting: bool,
    last_heartbeat: Instant,
}

impl OutputSocket {
    pub fn new(task_id: String, state: GatewayState) -> Self {
        let chunk_bytes = state.get_config().server.audio_chunk_bytes;
        Self {
            task_id,
            state,
            chunk_bytes,
            waiting: false,
            last_heartbeat: Instant::now(),
        }
    }

    fn fail(&mut self, message: &str, ctx: &mut ws::WebsocketContext<Self>) {
        self.waiting = false;
        ctx.text(encode_control(&ControlFrame::Error {
            message: message.to_string(),
        }));
        ctx.close(Some(ws::CloseCode::Normal.into()));
        ctx.stop();
    }

    fn deliver(&mut self, reply: Reply, ctx: &mut ws::WebsocketContext<Self>) {
        self.waiting = false;
        let frames = reply_frames(&self.task_id, reply, self.chunk_bytes);
        info!(task_id = %self.task_id, frames = frames.len(), "Delivering reply");
        for frame in frames {
            match frame {
                OutboundFrame::Control(control) => ctx.text(encode_control(&control)),
                OutboundFrame::Binary(bytes) => ctx.binary(bytes),
            }
        }
    }
}

impl Heartbeat for OutputSocket {
    fn last_heartbeat(&self) -> Instant {
        self.last_heartbeat
    }
}

impl Actor for OutputSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.state.connection_opened();
        info!(task_id = %self.task_id, "Output connection started");
        start_heartbeat(ctx, &self.state);

        match self
            .state
            .attach_output(&self.task_id, ctx.address().recipient())
        {
            OutputAttach::Ready(reply) => self.deliver(reply, ctx),
            OutputAttach::Waiting => {
                self.waiting = true;
                debug!(task_id = %self.task_id, "Upload still running, waiting for reply");
            }
            OutputAttach::Busy => {
                warn!(task_id = %self.task_id, "Another output connection is waiting");
                self.fail("Output already open for this task", ctx);
            }
            OutputAttach::Finished(TaskOutcome::Stopped) => {
                info!(task_id = %self.task_id, "Task stopped before delivery");
                self.fail("Task stopped", ctx);
            }
            OutputAttach::Finished(TaskOutcome::Delivered) => {
                warn!(task_id = %self.task_id, "Reply already delivered");
                self.fail("Reply already delivered", ctx);
            }
            OutputAttach::Unknown => {
                warn!(task_id = %self.task_id, "Output requested for unknown task");
                self.fail("Unknown task id", ctx);
            }
        }
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if self.waiting {
            self.state.detach_output(&self.task_id);
        }
        self.state.connection_closed();
        info!(task_id = %self.task_id, "Output connection stopped");
    }
}

/// Handle a reply, stop or abandonment pushed from `GatewayState`.
impl Handler<ReplyEvent> for OutputSocket {
    type Result = ();

    fn handle(&mut self, msg: ReplyEvent, ctx: &mut Self::Context) {
        match msg {
            ReplyEvent::Ready(reply) => self.deliver(reply, ctx),
            ReplyEvent::Stopped => {
                info!(task_id = %self.task_id, "Task stopped before delivery");
                self.fail("Task stopped", ctx);
            }
            ReplyEvent::Abandoned => {
                warn!(task_id = %self.task_id, "Upload abandoned before completion");
                self.fail("Upload abandoned", ctx);
            }
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for OutputSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_heartbeat = Instant::now();
        match msg {
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Pong(_)) | Ok(ws::Message::Nop) => {}
            Ok(ws::Message::Close(reason)) => {
                debug!(task_id = %self.task_id, reason = ?reason, "Output socket closed by client");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(other) => {
                debug!(task_id = %self.task_id, message = ?other, "Ignoring client message on output socket");
            }
            Err(err) => {
                error!(task_id = %self.task_id, error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

/// Upgrade handler for the input route.
pub async fn input_socket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<GatewayState>,
) -> ActixResult<HttpResponse> {
    info!("New input connection from: {:?}", req.connection_info().peer_addr());
    ws::start(InputSocket::new(state.get_ref().clone()), &req, stream)
}

/// Upgrade handler for the output route.
pub async fn output_socket(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<String>,
    state: web::Data<GatewayState>,
) -> ActixResult<HttpResponse> {
    let task_id = path.into_inner();
    info!(task_id = %task_id, "New output connection");
    ws::start(OutputSocket::new(task_id, state.get_ref().clone()), &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assembler_enforces_chunk_order() {
        let mut upload = UploadAssembler::new();
        assert_eq!(upload.on_binary(b"x"), Err(NO_METADATA.to_string()));

        upload.on_metadata(PayloadKind::Text, 0).unwrap();
        upload.on_binary(b"hel").unwrap();
        assert_eq!(
            upload.on_metadata(PayloadKind::Text, 2),
            Err("Chunk ID mismatch: expected 1, got 2".to_string())
        );
        upload.on_metadata(PayloadKind::Text, 1).unwrap();
        upload.on_binary(b"lo").unwrap();

        assert_eq!(upload.chunks_received(), 2);
        assert_eq!(
            upload.finish(),
            Ok(Reply {
                content: "hello".to_string(),
                audio: None,
            })
        );
    }

    #[test]
    fn test_empty_upload_is_rejected() {
        assert_eq!(UploadAssembler::new().finish(), Err(EMPTY_PAYLOAD));
    }

    #[test]
    fn test_audio_upload_returns_bytes() {
        let mut upload = UploadAssembler::new();
        upload.on_metadata(PayloadKind::Audio, 0).unwrap();
        upload.on_binary(&[1, 2, 3]).unwrap();

        let reply = upload.finish().unwrap();
        assert_eq!(reply.audio, Some(vec![1, 2, 3]));
        assert!(reply.content.contains("3 bytes"));
    }

    #[test]
    fn test_reply_frames_split_audio() {
        let reply = Reply {
            content: "ok".to_string(),
            audio: Some(vec![0u8; 5]),
        };
        let frames = reply_frames("t1", reply, 2);

        // success + 3 × (metadata, binary) + complete
        assert_eq!(frames.len(), 8);
        assert!(matches!(
            &frames[0],
            OutboundFrame::Control(ControlFrame::Success { audio_present: true, .. })
        ));
        assert_eq!(
            frames[1],
            OutboundFrame::Control(ControlFrame::AudioChunk {
                task_id: Some("t1".to_string()),
                chunk_id: 0,
                total_chunks: Some(3),
            })
        );
        assert_eq!(frames[6], OutboundFrame::Binary(vec![0u8; 1]));
        assert!(matches!(
            &frames[7],
            OutboundFrame::Control(ControlFrame::AudioComplete { .. })
        ));
    }

    #[test]
    fn test_text_reply_is_single_frame() {
        let reply = Reply {
            content: "echo".to_string(),
            audio: Some(Vec::new()),
        };
        let frames = reply_frames("t1", reply, 1024);
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            &frames[0],
            OutboundFrame::Control(ControlFrame::Success { audio_present: false, .. })
        ));
    }
}
