//! # Frame Codec
//!
//! Encodes and decodes the control frames used on the input and output channels.
//!
//! ## Wire Shapes:
//! - `{"action":"data_chunk","type":"text","chunk_id":0}` (client → input)
//! - `{"action":"upload_complete"}` (client → input)
//! - `{"type":"system","action":"task_id_assigned","task_id":"…"}` (input → client)
//! - `{"type":"system","action":"upload_processed","status":"queued","task_id":"…"}`
//! - `{"status":"success","task_id":"…","content":"…","audio_present":true}` (output → client)
//! - `{"type":"audio_chunk","task_id":"…","chunk_id":0,"total_chunks":3}`
//! - `{"type":"audio_complete","task_id":"…"}`
//! - `{"status":"error","error":"…"}` or `{"type":"error","message":"…"}`
//!
//! The backend tags frames inconsistently (`action`, `type` or `status`), so decoding
//! goes through `serde_json::Value` rather than a single tagged enum.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;

/// Plain-text acknowledgement the backend sends after each binary upload frame.
pub const CHUNK_ACK: &str = "File chunk received";

/// Plain-text prefixes that mean the backend rejected the upload.
const SENTINEL_ERRORS: [&str; 3] = ["Chunk ID mismatch", "Error:", "Invalid JSON format"];

/// Message fallback when an error frame carries no text.
const UNKNOWN_ERROR: &str = "unknown processing error";

/// A single WebSocket message, either direction.
///
/// Binary payloads pass through the codec untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl WireMessage {
    /// Build a text message from a control frame.
    pub fn control(frame: &ControlFrame) -> Self {
        WireMessage::Text(encode_control(frame))
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, WireMessage::Binary(_))
    }
}

/// What a `data_chunk` upload carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    Text,
    Audio,
}

impl PayloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadKind::Text => "text",
            PayloadKind::Audio => "audio",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" => Some(PayloadKind::Text),
            "audio" => Some(PayloadKind::Audio),
            _ => None,
        }
    }
}

/// Every control frame either side of the protocol can send.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlFrame {
    /// Backend assigned the correlation id for this turn
    TaskIdAssigned { task_id: String },
    /// Backend accepted the upload and started processing
    UploadQueued { task_id: Option<String> },
    /// Metadata announcing the next binary upload frame
    DataChunk { kind: PayloadKind, chunk_id: u32 },
    /// Client finished uploading
    UploadComplete,
    /// Metadata announcing the next binary audio frame; `total_chunks` is only
    /// meaningful on `chunk_id == 0`
    AudioChunk {
        task_id: Option<String>,
        chunk_id: u32,
        total_chunks: Option<u32>,
    },
    /// No more audio chunks follow
    AudioComplete { task_id: Option<String> },
    /// Text result for the turn
    Success {
        task_id: Option<String>,
        content: String,
        audio_present: bool,
    },
    /// Backend-reported failure
    Error { message: String },
}

impl ControlFrame {
    /// Task id carried by the frame, if the shape has one.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            ControlFrame::TaskIdAssigned { task_id } => Some(task_id),
            ControlFrame::UploadQueued { task_id }
            | ControlFrame::AudioChunk { task_id, .. }
            | ControlFrame::AudioComplete { task_id }
            | ControlFrame::Success { task_id, .. } => task_id.as_deref(),
            ControlFrame::DataChunk { .. }
            | ControlFrame::UploadComplete
            | ControlFrame::Error { .. } => None,
        }
    }

    /// Short name used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            ControlFrame::TaskIdAssigned { .. } => "task_id_assigned",
            ControlFrame::UploadQueued { .. } => "queued",
            ControlFrame::DataChunk { .. } => "data_chunk",
            ControlFrame::UploadComplete => "upload_complete",
            ControlFrame::AudioChunk { .. } => "audio_chunk",
            ControlFrame::AudioComplete { .. } => "audio_complete",
            ControlFrame::Success { .. } => "success",
            ControlFrame::Error { .. } => "error",
        }
    }
}

/// Why a text message did not decode into a control frame.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeFailure {
    /// Known plain-text acknowledgement (`File chunk received`)
    Acknowledgement(String),
    /// Plain-text error the backend uses to reject an upload; fatal for the channel
    Sentinel(String),
    /// Not JSON (or not a JSON object) and not a known string
    Malformed { raw: String, reason: String },
    /// Valid JSON object whose shape matches no known frame
    Unrecognized(Value),
}

impl DecodeFailure {
    /// Only sentinel errors terminate the channel.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DecodeFailure::Sentinel(_))
    }
}

impl fmt::Display for DecodeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeFailure::Acknowledgement(text) => write!(f, "acknowledgement: {}", text),
            DecodeFailure::Sentinel(text) => write!(f, "{}", text),
            DecodeFailure::Malformed { raw, reason } => {
                write!(f, "malformed frame ({}): {}", reason, truncate(raw, 120))
            }
            DecodeFailure::Unrecognized(value) => write!(f, "unrecognized frame: {}", value),
        }
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

/// Encode a control frame into the JSON text the peer expects.
pub fn encode_control(frame: &ControlFrame) -> String {
    let value = match frame {
        ControlFrame::TaskIdAssigned { task_id } => json!({
            "type": "system",
            "action": "task_id_assigned",
            "task_id": task_id,
        }),
        ControlFrame::UploadQueued { task_id } => {
            let mut value = json!({
                "type": "system",
                "action": "upload_processed",
                "status": "queued",
            });
            insert_task_id(&mut value, task_id.as_deref());
            value
        }
        ControlFrame::DataChunk { kind, chunk_id } => json!({
            "action": "data_chunk",
            "type": kind.as_str(),
            "chunk_id": chunk_id,
        }),
        ControlFrame::UploadComplete => json!({ "action": "upload_complete" }),
        ControlFrame::AudioChunk {
            task_id,
            chunk_id,
            total_chunks,
        } => {
            let mut value = json!({
                "type": "audio_chunk",
                "chunk_id": chunk_id,
            });
            if let (Some(total), Some(map)) = (total_chunks, value.as_object_mut()) {
                map.insert("total_chunks".to_string(), json!(total));
            }
            insert_task_id(&mut value, task_id.as_deref());
            value
        }
        ControlFrame::AudioComplete { task_id } => {
            let mut value = json!({ "type": "audio_complete" });
            insert_task_id(&mut value, task_id.as_deref());
            value
        }
        ControlFrame::Success {
            task_id,
            content,
            audio_present,
        } => {
            let mut value = json!({
                "status": "success",
                "content": content,
                "audio_present": audio_present,
            });
            insert_task_id(&mut value, task_id.as_deref());
            value
        }
        ControlFrame::Error { message } => json!({
            "status": "error",
            "error": message,
        }),
    };

    value.to_string()
}

fn insert_task_id(value: &mut Value, task_id: Option<&str>) {
    if let (Some(task_id), Some(map)) = (task_id, value.as_object_mut()) {
        map.insert("task_id".to_string(), json!(task_id));
    }
}

/// Decode one text message.
///
/// ## Returns:
/// - **Ok(frame)**: a known control frame
/// - **Err(failure)**: an acknowledgement, a sentinel error, malformed text or an
///   unknown JSON shape (see `DecodeFailure::is_fatal`)
pub fn decode_control(text: &str) -> Result<ControlFrame, DecodeFailure> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(err) => return Err(classify_plain_text(text, err.to_string())),
    };

    let map = match value.as_object() {
        Some(map) => map,
        None => {
            return Err(DecodeFailure::Malformed {
                raw: text.to_string(),
                reason: "control frame is not a JSON object".to_string(),
            })
        }
    };

    match decode_object(map) {
        Some(frame) => Ok(frame),
        None => Err(DecodeFailure::Unrecognized(value.clone())),
    }
}

fn classify_plain_text(text: &str, reason: String) -> DecodeFailure {
    let trimmed = text.trim();
    if trimmed == CHUNK_ACK {
        return DecodeFailure::Acknowledgement(trimmed.to_string());
    }
    if SENTINEL_ERRORS.iter().any(|prefix| trimmed.starts_with(prefix)) {
        return DecodeFailure::Sentinel(trimmed.to_string());
    }
    DecodeFailure::Malformed {
        raw: text.to_string(),
        reason,
    }
}

fn str_field<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    map.get(key).and_then(Value::as_str)
}

fn u32_field(map: &Map<String, Value>, key: &str) -> Option<u32> {
    map.get(key)
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
}

fn task_id_field(map: &Map<String, Value>) -> Option<String> {
    str_field(map, "task_id").map(str::to_string)
}

/// `audio_present` is loosely typed on the wire: a bool, the audio file name or a number.
/// Empty and zero values mean no audio.
fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(text)) => !text.is_empty(),
        Some(Value::Number(number)) => number.as_f64().map(|n| n != 0.0).unwrap_or(false),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Object(fields)) => !fields.is_empty(),
    }
}

fn error_message(map: &Map<String, Value>) -> String {
    str_field(map, "error")
        .or_else(|| str_field(map, "message"))
        .filter(|msg| !msg.is_empty())
        .unwrap_or(UNKNOWN_ERROR)
        .to_string()
}

fn decode_object(map: &Map<String, Value>) -> Option<ControlFrame> {
    let action = str_field(map, "action");
    let kind = str_field(map, "type");
    let status = str_field(map, "status");

    // `action` is the most specific tag, then `type`, then `status`
    match action {
        Some("task_id_assigned") => {
            return task_id_field(map).map(|task_id| ControlFrame::TaskIdAssigned { task_id });
        }
        Some("upload_processed") => {
            return match status {
                Some("queued") => Some(ControlFrame::UploadQueued {
                    task_id: task_id_field(map),
                }),
                Some("error") => Some(ControlFrame::Error {
                    message: error_message(map),
                }),
                _ => None,
            };
        }
        Some("data_chunk") => {
            let kind = kind.and_then(PayloadKind::parse)?;
            let chunk_id = u32_field(map, "chunk_id")?;
            return Some(ControlFrame::DataChunk { kind, chunk_id });
        }
        Some("upload_complete") => return Some(ControlFrame::UploadComplete),
        _ => {}
    }

    match kind {
        Some("audio_chunk") => {
            let chunk_id = u32_field(map, "chunk_id")?;
            return Some(ControlFrame::AudioChunk {
                task_id: task_id_field(map),
                chunk_id,
                total_chunks: u32_field(map, "total_chunks"),
            });
        }
        Some("audio_complete") => {
            return Some(ControlFrame::AudioComplete {
                task_id: task_id_field(map),
            });
        }
        Some("error") => {
            return Some(ControlFrame::Error {
                message: error_message(map),
            });
        }
        _ => {}
    }

    match status {
        Some("success") => {
            let content = match map.get("content") {
                None | Some(Value::Null) => String::new(),
                Some(Value::String(content)) => content.clone(),
                Some(_) => return None,
            };
            Some(ControlFrame::Success {
                task_id: task_id_field(map),
                content,
                audio_present: truthy(map.get("audio_present")),
            })
        }
        Some("queued") => Some(ControlFrame::UploadQueued {
            task_id: task_id_field(map),
        }),
        Some("error") => Some(ControlFrame::Error {
            message: error_message(map),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_upload_frames() {
        let meta = encode_control(&ControlFrame::DataChunk {
            kind: PayloadKind::Audio,
            chunk_id: 2,
        });
        let value: Value = serde_json::from_str(&meta).unwrap();
        assert_eq!(value["action"], "data_chunk");
        assert_eq!(value["type"], "audio");
        assert_eq!(value["chunk_id"], 2);

        let done = encode_control(&ControlFrame::UploadComplete);
        assert_eq!(done, r#"{"action":"upload_complete"}"#);
    }

    #[test]
    fn test_decode_backend_system_frames() {
        let assigned = decode_control(
            r#"{"type":"system","action":"task_id_assigned","task_id":"t1"}"#,
        );
        assert_eq!(
            assigned,
            Ok(ControlFrame::TaskIdAssigned {
                task_id: "t1".to_string()
            })
        );

        let queued = decode_control(
            r#"{"type":"system","action":"upload_processed","status":"queued","task_id":"t1"}"#,
        );
        assert_eq!(
            queued,
            Ok(ControlFrame::UploadQueued {
                task_id: Some("t1".to_string())
            })
        );

        let failed = decode_control(
            r#"{"type":"system","action":"upload_processed","status":"error","error":"text_payload_empty"}"#,
        );
        assert_eq!(
            failed,
            Ok(ControlFrame::Error {
                message: "text_payload_empty".to_string()
            })
        );
    }

    #[test]
    fn test_decode_output_frames() {
        let success = decode_control(
            r#"{"status":"success","task_id":"t2","content":"hi","audio_present":"/tmp/reply.mp3"}"#,
        )
        .unwrap();
        assert_eq!(
            success,
            ControlFrame::Success {
                task_id: Some("t2".to_string()),
                content: "hi".to_string(),
                audio_present: true,
            }
        );

        let chunk = decode_control(
            r#"{"type":"audio_chunk","task_id":"t2","chunk_id":0,"total_chunks":2}"#,
        )
        .unwrap();
        assert_eq!(
            chunk,
            ControlFrame::AudioChunk {
                task_id: Some("t2".to_string()),
                chunk_id: 0,
                total_chunks: Some(2),
            }
        );

        let error = decode_control(r#"{"type":"error","message":"Audio transmission failed"}"#);
        assert_eq!(
            error,
            Ok(ControlFrame::Error {
                message: "Audio transmission failed".to_string()
            })
        );
    }

    #[test]
    fn test_audio_present_false_variants() {
        for raw in [
            r#"{"status":"success","content":"x","audio_present":false}"#,
            r#"{"status":"success","content":"x","audio_present":""}"#,
            r#"{"status":"success","content":"x"}"#,
        ] {
            match decode_control(raw) {
                Ok(ControlFrame::Success { audio_present, .. }) => assert!(!audio_present, "{raw}"),
                other => panic!("unexpected decode for {raw}: {other:?}"),
            }
        }
    }

    #[test]
    fn test_plain_text_classification() {
        assert_eq!(
            decode_control("File chunk received"),
            Err(DecodeFailure::Acknowledgement(CHUNK_ACK.to_string()))
        );

        let sentinel = decode_control("Chunk ID mismatch: expected 1, got 3").unwrap_err();
        assert!(sentinel.is_fatal());

        let noise = decode_control("hello there").unwrap_err();
        assert!(matches!(noise, DecodeFailure::Malformed { .. }));
        assert!(!noise.is_fatal());
    }

    #[test]
    fn test_unknown_shape_is_unrecognized() {
        let failure = decode_control(r#"{"type":"heartbeat"}"#).unwrap_err();
        assert!(matches!(failure, DecodeFailure::Unrecognized(_)));
        assert!(!failure.is_fatal());

        // audio_chunk without chunk_id is not a usable frame either
        let failure = decode_control(r#"{"type":"audio_chunk","total_chunks":2}"#).unwrap_err();
        assert!(matches!(failure, DecodeFailure::Unrecognized(_)));
    }

    #[test]
    fn test_encoded_frames_decode_back() {
        let frames = [
            ControlFrame::TaskIdAssigned {
                task_id: "abc".to_string(),
            },
            ControlFrame::AudioChunk {
                task_id: Some("abc".to_string()),
                chunk_id: 1,
                total_chunks: None,
            },
            ControlFrame::Success {
                task_id: Some("abc".to_string()),
                content: "hola".to_string(),
                audio_present: false,
            },
        ];
        for frame in frames {
            assert_eq!(decode_control(&encode_control(&frame)), Ok(frame));
        }
    }
}
