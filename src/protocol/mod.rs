//! # Wire Protocol
//!
//! Both channels carry two kinds of WebSocket messages:
//! - **Control frames**: JSON text describing metadata, status or signalling
//! - **Binary frames**: raw payload bytes whose meaning comes from the control frame
//!   received just before them on the same channel
//!
//! The backend also sends a few plain-text strings on the input channel
//! (acknowledgements and error sentinels); the codec classifies those too.

pub mod frame;

pub use frame::{
    decode_control, encode_control, ControlFrame, DecodeFailure, PayloadKind, WireMessage,
    CHUNK_ACK,
};
