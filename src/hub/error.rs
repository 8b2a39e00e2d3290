//! Stream source errors

/// Error returned when subscribing to or publishing into a stream source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// No publisher for this stream
    StreamNotFound(String),
    /// Stream already has a publisher
    StreamAlreadyPublishing(String),
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::StreamNotFound(stream) => write!(f, "Stream not found: {}", stream),
            SourceError::StreamAlreadyPublishing(stream) => {
                write!(f, "Stream already has a publisher: {}", stream)
            }
        }
    }
}

impl std::error::Error for SourceError {}
