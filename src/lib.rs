//! # turnlink
//!
//! Client for a conversational gateway that exchanges one turn at a time over two
//! WebSocket channels:
//!
//! - **Input channel**: the client uploads text or recorded audio as
//!   metadata+binary pairs and receives a task id plus a queued confirmation
//! - **Output channel**: opened per task id, streams the text result and optional
//!   synthesized audio in indexed chunks that are reassembled into one playable object
//! - **Interrupt**: an out-of-band HTTP stop request for the current task
//!
//! ## Module Layout:
//! - **protocol**: frame codec for the JSON control frames and binary payloads
//! - **channel**: transport seam plus the upload and download controllers
//! - **audio**: capture input, reassembly buffer and the handle store
//! - **session**: the status machine observable by UI code
//! - **client**: `TurnClient`, which owns the session and drives the channels
//! - **interrupt**: the stop request
//! - **gateway**: an actix-web loopback backend speaking the same protocol
//! - **config** / **error**: layered configuration and the shared error type

pub mod audio;
pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod gateway;
pub mod interrupt;
pub mod protocol;
pub mod session;

pub use client::TurnClient;
pub use config::AppConfig;
pub use error::{AppError, AppResult};
pub use session::{OutputStatus, SessionSnapshot, UploadStatus};
