//! # Playable Audio Handles
//!
//! Reassembled audio is handed to UI code as a URL-like handle (`blob:turnlink/<uuid>`)
//! rather than as raw bytes. The store keeps the bytes alive until the handle is
//! released, the same way a browser keeps a blob alive until its object URL is revoked.

use crate::audio::buffer::ReassembledAudio;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

const HANDLE_PREFIX: &str = "blob:turnlink/";

/// Dereferenceable reference to a reassembled audio object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioHandle(String);

impl AudioHandle {
    fn generate() -> Self {
        AudioHandle(format!("{}{}", HANDLE_PREFIX, Uuid::new_v4()))
    }

    /// The handle as a URL string.
    pub fn as_url(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AudioHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An audio object kept alive by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioObject {
    pub media_type: String,
    pub bytes: Vec<u8>,
}

impl AudioObject {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Registry of live audio handles.
#[derive(Debug, Default)]
pub struct AudioStore {
    entries: HashMap<AudioHandle, Arc<AudioObject>>,
}

impl AudioStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register reassembled audio and return a fresh handle for it.
    pub fn register(&mut self, audio: ReassembledAudio) -> AudioHandle {
        let handle = AudioHandle::generate();
        self.entries.insert(
            handle.clone(),
            Arc::new(AudioObject {
                media_type: audio.media_type,
                bytes: audio.bytes,
            }),
        );
        handle
    }

    /// Dereference a handle; `None` once it has been released.
    pub fn resolve(&self, handle: &AudioHandle) -> Option<Arc<AudioObject>> {
        self.entries.get(handle).cloned()
    }

    /// Revoke a handle. Releasing twice is harmless and returns `false`.
    pub fn release(&mut self, handle: &AudioHandle) -> bool {
        self.entries.remove(handle).is_some()
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
