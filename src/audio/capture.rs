//! # Capture Sources
//!
//! A capture device produces a finished recording as an ordered batch of binary segments
//! (record-then-send). How the device splits its output is its own business: the upload
//! controller assigns `chunk_id`s purely by enumeration order when it sends.

use crate::error::{AppError, AppResult};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Ordered binary segments of one recording.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordedInput {
    segments: Vec<Vec<u8>>,
}

impl RecordedInput {
    pub fn new(segments: Vec<Vec<u8>>) -> Self {
        Self { segments }
    }

    /// Split one contiguous recording into segments of at most `segment_bytes`.
    pub fn from_bytes(bytes: &[u8], segment_bytes: usize) -> AppResult<Self> {
        if segment_bytes == 0 {
            return Err(AppError::ValidationError(
                "segment size must be greater than 0".to_string(),
            ));
        }
        let segments = bytes
            .chunks(segment_bytes)
            .map(<[u8]>::to_vec)
            .collect();
        Ok(Self { segments })
    }

    /// Segments paired with the position index they are sent under.
    pub fn indexed(&self) -> impl Iterator<Item = (u32, &[u8])> {
        self.segments
            .iter()
            .enumerate()
            .map(|(index, segment)| (index as u32, segment.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.segments.iter().map(Vec::len).sum()
    }

    pub fn into_segments(self) -> Vec<Vec<u8>> {
        self.segments
    }
}

/// Anything that can hand over a finished recording.
///
/// ## Rust Concepts:
/// - **Trait object seam**: the turn client only sees `RecordedInput`, so microphones,
///   files and test fixtures are interchangeable
pub trait CaptureDevice {
    fn take_recording(&mut self) -> AppResult<RecordedInput>;
}

/// Reads a recording from disk and splits it into fixed-size segments.
#[derive(Debug, Clone)]
pub struct FileCapture {
    path: PathBuf,
    segment_bytes: usize,
}

impl FileCapture {
    pub fn new(path: impl AsRef<Path>, segment_bytes: usize) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            segment_bytes,
        }
    }
}

impl CaptureDevice for FileCapture {
    fn take_recording(&mut self) -> AppResult<RecordedInput> {
        let bytes = std::fs::read(&self.path).map_err(|e| {
            AppError::ValidationError(format!(
                "Cannot read recording {}: {}",
                self.path.display(),
                e
            ))
        })?;

        let recording = RecordedInput::from_bytes(&bytes, self.segment_bytes)?;
        info!(
            path = %self.path.display(),
            segments = recording.len(),
            bytes = recording.total_bytes(),
            "Recording loaded"
        );
        Ok(recording)
    }
}

/// Replays segments that were captured elsewhere, exactly as they were split.
#[derive(Debug, Clone, Default)]
pub struct BufferedCapture {
    pending: Vec<Vec<u8>>,
}

impl BufferedCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one segment as the device produced it.
    pub fn push_segment(&mut self, segment: Vec<u8>) {
        debug!(size = segment.len(), "Segment captured");
        self.pending.push(segment);
    }
}

impl CaptureDevice for BufferedCapture {
    fn take_recording(&mut self) -> AppResult<RecordedInput> {
        Ok(RecordedInput::new(std::mem::take(&mut self.pending)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_bytes_splits_in_order() {
        let recording = RecordedInput::from_bytes(b"abcdefg", 3).unwrap();
        let segments: Vec<(u32, &[u8])> = recording.indexed().collect();
        assert_eq!(
            segments,
            vec![(0, &b"abc"[..]), (1, &b"def"[..]), (2, &b"g"[..])]
        );
        assert_eq!(recording.total_bytes(), 7);
        assert!(RecordedInput::from_bytes(b"abc", 0).is_err());
    }

    #[test]
    fn test_buffered_capture_keeps_device_split() {
        let mut device = BufferedCapture::new();
        device.push_segment(vec![1]);
        device.push_segment(vec![2, 3, 4]);

        let recording = device.take_recording().unwrap();
        assert_eq!(recording.into_segments(), vec![vec![1], vec![2, 3, 4]]);
        assert!(device.take_recording().unwrap().is_empty());
    }

    #[test]
    fn test_file_capture_reads_and_splits() {
        let path = std::env::temp_dir().join(format!("turnlink-capture-{}.bin", uuid::Uuid::new_v4()));
        std::fs::write(&path, vec![7u8; 10]).unwrap();

        let mut device = FileCapture::new(&path, 4);
        let recording = device.take_recording().unwrap();
        assert_eq!(recording.len(), 3);
        assert_eq!(recording.total_bytes(), 10);

        std::fs::remove_file(&path).unwrap();
        assert!(matches!(
            device.take_recording(),
            Err(AppError::ValidationError(_))
        ));
    }
}
