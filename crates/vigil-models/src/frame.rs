//! Captured frames handed to the pipeline.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::StreamId;

/// Encoded image bytes, shared between the worker and in-flight requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameData {
    pub content_type: String,
    pub bytes: Arc<Vec<u8>>,
}

impl FrameData {
    pub fn new(content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            content_type: content_type.into(),
            bytes: Arc::new(bytes),
        }
    }

    /// JPEG frame.
    pub fn jpeg(bytes: Vec<u8>) -> Self {
        Self::new("image/jpeg", bytes)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// One frame of one stream.
///
/// `sequence` is assigned by the capture side and must increase
/// monotonically within a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub stream_id: StreamId,
    pub sequence: u64,
    pub captured_at: DateTime<Utc>,
    pub image: FrameData,
}

impl Frame {
    pub fn new(stream_id: StreamId, sequence: u64, image: FrameData) -> Self {
        Self {
            stream_id,
            sequence,
            captured_at: Utc::now(),
            image,
        }
    }
}
