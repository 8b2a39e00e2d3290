//! Recorder identity

use crate::format::RecordFormat;

/// Identifies one active recording: a stream recorded into one format
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecorderKey {
    /// Stream identifier (e.g., "live/cam1")
    pub stream: String,
    pub format: RecordFormat,
}

impl RecorderKey {
    pub fn new(stream: impl Into<String>, format: RecordFormat) -> Self {
        Self {
            stream: stream.into(),
            format,
        }
    }
}

impl std::fmt::Display for RecorderKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]", self.stream, self.format)
    }
}
