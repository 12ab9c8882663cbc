//! Stream records reported by collectors.
//!
//! Collectors report which frame indices became available since the previous
//! drain. Payloads stay with the device-layer writers.

use serde::{Deserialize, Serialize};
use std::ops::Range;

/// A contiguous range of newly written frames in one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDatum {
    /// Stream name, e.g. `kinetix_detector_stream`.
    pub stream: String,
    /// First new frame index.
    pub start: u64,
    /// One past the last new frame index.
    pub stop: u64,
}

impl StreamDatum {
    /// Create a datum covering `indices` of `stream`.
    pub fn new(stream: impl Into<String>, indices: Range<u64>) -> Self {
        Self {
            stream: stream.into(),
            start: indices.start,
            stop: indices.end,
        }
    }

    /// Number of frames covered.
    pub fn len(&self) -> u64 {
        self.stop.saturating_sub(self.start)
    }

    /// Whether the range is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
