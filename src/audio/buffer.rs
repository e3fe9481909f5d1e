//! # Audio Reassembly Buffer
//!
//! Collects the numbered binary audio chunks streamed on the output channel and
//! concatenates them into one playable object once every announced slot is filled.
//!
//! ## Key Rules:
//! - **Announcement**: the chunk with `chunk_id == 0` carries `total_chunks` and
//!   (re-)creates the chunk set; the count is never taken from later chunks
//! - **Sparse slots**: chunks are stored in a map keyed by index, with the expected
//!   count kept separately, so a missing slot is never confused with an empty one
//! - **Reassembly**: succeeds only if filled slots == `total_chunks` and `total_chunks > 0`;
//!   a `total_chunks == 0` announcement is a no-op success
//! - **Lifetime**: the set is consumed by reassembly whether it succeeds or fails

use crate::error::{AppError, AppResult};
use std::collections::BTreeMap;
use tracing::debug;

/// One announced set of audio chunks.
///
/// ## Rust Concepts:
/// - **BTreeMap**: A sorted map, so iterating it yields chunks in index order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioChunkSet {
    /// Number of chunks announced on `chunk_id == 0`
    total_chunks: u32,

    /// Received chunk bytes by index
    slots: BTreeMap<u32, Vec<u8>>,
}

/// What happened when a binary chunk was offered to the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotFill {
    /// A previously empty slot was filled
    Filled,
    /// The slot already had bytes; they were replaced and the count is unchanged
    Replaced,
}

impl AudioChunkSet {
    /// Create an empty set expecting `total_chunks` chunks.
    pub fn new(total_chunks: u32) -> Self {
        Self {
            total_chunks,
            slots: BTreeMap::new(),
        }
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    /// Number of slots that have received their binary frame.
    pub fn filled(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Whether every announced slot has arrived.
    pub fn is_complete(&self) -> bool {
        self.total_chunks > 0 && self.filled() == self.total_chunks
    }

    /// Store the bytes for slot `chunk_id`.
    ///
    /// ## Returns:
    /// - **Err(Protocol)**: the index is outside the announced range
    pub fn insert(&mut self, chunk_id: u32, bytes: Vec<u8>) -> AppResult<SlotFill> {
        if chunk_id >= self.total_chunks {
            return Err(AppError::Protocol(format!(
                "audio chunk {} is outside the announced range of {} chunks",
                chunk_id, self.total_chunks
            )));
        }

        match self.slots.insert(chunk_id, bytes) {
            Some(_) => Ok(SlotFill::Replaced),
            None => Ok(SlotFill::Filled),
        }
    }
}

/// A successfully reassembled audio payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ReassembledAudio {
    /// Media type of the bytes (e.g. "audio/mpeg")
    pub media_type: String,
    /// Concatenated chunk bytes in index order
    pub bytes: Vec<u8>,
    /// How many chunks were joined
    pub chunk_count: u32,
}

/// Result of finalizing a chunk set.
#[derive(Debug, Clone, PartialEq)]
pub enum Reassembly {
    /// Audio is ready for playback
    Audio(ReassembledAudio),
    /// Nothing to reassemble (`total_chunks == 0`, or no set was ever announced)
    Empty,
}

/// Concatenate a chunk set into one audio object.
///
/// ## Returns:
/// - **Ok(Audio)**: filled slots == `total_chunks` > 0
/// - **Ok(Empty)**: `total_chunks == 0`
/// - **Err(DataIncomplete)**: some announced slots never arrived
pub fn reassemble(set: AudioChunkSet, media_type: &str) -> AppResult<Reassembly> {
    if set.total_chunks == 0 {
        debug!("No audio chunks were announced, nothing to reassemble");
        return Ok(Reassembly::Empty);
    }

    if !set.is_complete() {
        return Err(AppError::DataIncomplete(format!(
            "audio data incomplete: expected {} chunks, received {}",
            set.total_chunks,
            set.filled()
        )));
    }

    let chunk_count = set.total_chunks;
    let size: usize = set.slots.values().map(Vec::len).sum();
    let mut bytes = Vec::with_capacity(size);
    for chunk in set.slots.into_values() {
        bytes.extend_from_slice(&chunk);
    }

    debug!(chunk_count, size, "Audio reassembled");

    Ok(Reassembly::Audio(ReassembledAudio {
        media_type: media_type.to_string(),
        bytes,
        chunk_count,
    }))
}

/// Holds at most one chunk set for the current output stream.
#[derive(Debug, Clone)]
pub struct AudioReassemblyBuffer {
    set: Option<AudioChunkSet>,
    media_type: String,
}

impl AudioReassemblyBuffer {
    pub fn new(media_type: impl Into<String>) -> Self {
        Self {
            set: None,
            media_type: media_type.into(),
        }
    }

    /// Discard any partial state.
    pub fn reset(&mut self) {
        self.set = None;
    }

    /// Start a new chunk set (called for the `chunk_id == 0` announcement).
    pub fn begin(&mut self, total_chunks: u32) {
        if let Some(previous) = &self.set {
            if previous.filled() > 0 {
                debug!(
                    filled = previous.filled(),
                    total = previous.total_chunks(),
                    "Discarding previous audio chunk set"
                );
            }
        }
        self.set = Some(AudioChunkSet::new(total_chunks));
    }

    /// Store a binary chunk in the current set.
    pub fn accept(&mut self, chunk_id: u32, bytes: Vec<u8>) -> AppResult<SlotFill> {
        match self.set.as_mut() {
            Some(set) => set.insert(chunk_id, bytes),
            None => Err(AppError::Protocol(format!(
                "audio chunk {} arrived before any chunk set was announced",
                chunk_id
            ))),
        }
    }

    /// The current set, if one has been announced.
    pub fn current(&self) -> Option<&AudioChunkSet> {
        self.set.as_ref()
    }

    /// Whether a set exists that still misses announced slots.
    pub fn is_partial(&self) -> bool {
        self.set
            .as_ref()
            .map(|set| set.total_chunks() > 0 && !set.is_complete())
            .unwrap_or(false)
    }

    /// Consume the current set and reassemble it.
    pub fn finalize(&mut self) -> AppResult<Reassembly> {
        match self.set.take() {
            Some(set) => reassemble(set, &self.media_type),
            None => Ok(Reassembly::Empty),
        }
    }

    /// Drop the current set if it is partial, returning `(filled, total)` when it was.
    pub fn discard_partial(&mut self) -> Option<(u32, u32)> {
        if self.is_partial() {
            self.set
                .take()
                .map(|set| (set.filled(), set.total_chunks()))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reassembles_in_index_order() {
        let mut set = AudioChunkSet::new(3);
        assert_eq!(set.insert(2, b"cc".to_vec()), Ok(SlotFill::Filled));
        assert_eq!(set.insert(0, b"aa".to_vec()), Ok(SlotFill::Filled));
        assert_eq!(set.insert(1, b"bb".to_vec()), Ok(SlotFill::Filled));

        match reassemble(set, "audio/mpeg").unwrap() {
            Reassembly::Audio(audio) => {
                assert_eq!(audio.bytes, b"aabbcc");
                assert_eq!(audio.media_type, "audio/mpeg");
                assert_eq!(audio.chunk_count, 3);
            }
            Reassembly::Empty => panic!("expected audio"),
        }
    }

    #[test]
    fn test_missing_slot_is_data_incomplete() {
        let mut set = AudioChunkSet::new(2);
        set.insert(0, vec![1, 2]).unwrap();

        let err = reassemble(set, "audio/mpeg").unwrap_err();
        assert!(matches!(err, AppError::DataIncomplete(_)));
    }

    #[test]
    fn test_zero_total_is_empty_success() {
        assert_eq!(
            reassemble(AudioChunkSet::new(0), "audio/mpeg"),
            Ok(Reassembly::Empty)
        );
    }

    #[test]
    fn test_out_of_range_and_duplicate_slots() {
        let mut set = AudioChunkSet::new(1);
        assert!(matches!(set.insert(1, vec![0]), Err(AppError::Protocol(_))));
        assert_eq!(set.insert(0, vec![1]), Ok(SlotFill::Filled));
        assert_eq!(set.insert(0, vec![2]), Ok(SlotFill::Replaced));
        assert_eq!(set.filled(), 1);
    }

    #[test]
    fn test_buffer_lifecycle() {
        let mut buffer = AudioReassemblyBuffer::new("audio/mpeg");
        assert!(matches!(buffer.accept(0, vec![1]), Err(AppError::Protocol(_))));
        assert_eq!(buffer.finalize(), Ok(Reassembly::Empty));

        buffer.begin(2);
        buffer.accept(0, vec![1]).unwrap();
        assert!(buffer.is_partial());
        assert_eq!(buffer.discard_partial(), Some((1, 2)));
        assert!(buffer.current().is_none());

        buffer.begin(1);
        buffer.accept(0, vec![9]).unwrap();
        assert!(!buffer.is_partial());
        assert!(matches!(buffer.finalize(), Ok(Reassembly::Audio(_))));
        assert!(buffer.current().is_none());
    }

    #[test]
    fn test_reannouncement_resets_the_set() {
        let mut buffer = AudioReassemblyBuffer::new("audio/mpeg");
        buffer.begin(2);
        buffer.accept(0, vec![1]).unwrap();
        buffer.accept(1, vec![2]).unwrap();

        buffer.begin(2);
        assert_eq!(buffer.current().map(AudioChunkSet::filled), Some(0));
    }
}
