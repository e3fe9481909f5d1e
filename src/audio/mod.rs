//! # Audio Module
//!
//! Everything the client does with audio bytes, on both sides of a turn.
//!
//! ## Key Components:
//! - **Reassembly Buffer**: Collects numbered output chunks into one playable object
//! - **Audio Store**: Turns reassembled audio into `blob:` handles and releases them
//! - **Capture**: Produces recorded input as an ordered batch of segments
//!
//! ## Audio Format:
//! The backend streams synthesized speech as MP3 (`audio/mpeg`) split into 64KB pieces.
//! No decoding happens here; bytes are joined in index order and handed over as-is.

pub mod buffer;       // Chunk set and reassembly
pub mod capture;      // Recorded input sources
pub mod store;        // Playable audio handles

pub use buffer::{AudioReassemblyBuffer, ReassembledAudio, Reassembly};
pub use capture::{BufferedCapture, CaptureDevice, FileCapture, RecordedInput};
pub use store::{AudioHandle, AudioObject, AudioStore};
