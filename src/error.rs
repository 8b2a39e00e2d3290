//! Error types
//!
//! Every failure is scoped to a single (stream, format) pair. None of these
//! errors is fatal to the hosting process; the service logs them and moves on.

use std::io;
use std::path::{Path, PathBuf};

use crate::format::RecordFormat;
use crate::hub::SourceError;
use crate::registry::RecorderKey;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, RecordError>;

/// Codec-level parse failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// Malformed AVC packet or decoder configuration record
    InvalidAvcPacket,
    /// Malformed HEVC packet or decoder configuration record
    InvalidHevcPacket,
    /// Malformed AAC packet or AudioSpecificConfig
    InvalidAacPacket,
    /// Codec the container cannot carry
    UnsupportedCodec(String),
}

impl std::fmt::Display for MediaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaError::InvalidAvcPacket => write!(f, "Invalid AVC packet"),
            MediaError::InvalidHevcPacket => write!(f, "Invalid HEVC packet"),
            MediaError::InvalidAacPacket => write!(f, "Invalid AAC packet"),
            MediaError::UnsupportedCodec(codec) => write!(f, "Unsupported codec: {}", codec),
        }
    }
}

impl std::error::Error for MediaError {}

/// AMF0 decode failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmfError {
    UnexpectedEof,
    UnknownMarker(u8),
    NestingTooDeep,
    InvalidUtf8,
}

impl std::fmt::Display for AmfError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AmfError::UnexpectedEof => write!(f, "Unexpected end of AMF data"),
            AmfError::UnknownMarker(m) => write!(f, "Unknown AMF0 marker: 0x{:02x}", m),
            AmfError::NestingTooDeep => write!(f, "AMF nesting too deep"),
            AmfError::InvalidUtf8 => write!(f, "Invalid UTF-8 in AMF string"),
        }
    }
}

impl std::error::Error for AmfError {}

/// Configuration compile failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Regex filter failed to compile
    InvalidRegex {
        format: RecordFormat,
        pattern: String,
        message: String,
    },
    /// Glob filter could not be translated
    InvalidGlob {
        format: RecordFormat,
        pattern: String,
        message: String,
    },
    /// Unknown format tag
    UnknownFormat(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidRegex {
                format,
                pattern,
                message,
            } => write!(f, "Invalid regex filter for {}: '{}': {}", format, pattern, message),
            ConfigError::InvalidGlob {
                format,
                pattern,
                message,
            } => write!(f, "Invalid glob filter for {}: '{}': {}", format, pattern, message),
            ConfigError::UnknownFormat(tag) => write!(f, "Unknown record format: {}", tag),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Path template rendering failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// Stream identifier is empty
    EmptyStream,
    /// Stream identifier contains an empty, `.` or `..` segment
    InvalidSegment(String),
    /// Template names a placeholder that does not exist
    UnknownPlaceholder(String),
    /// Template has a `{` without a matching `}`
    UnclosedPlaceholder,
    /// Placeholder exists but the stream identifier cannot fill it
    MissingSubstitution(&'static str),
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolveError::EmptyStream => write!(f, "Empty stream identifier"),
            ResolveError::InvalidSegment(stream) => {
                write!(f, "Invalid path segment in stream identifier: {}", stream)
            }
            ResolveError::UnknownPlaceholder(name) => write!(f, "Unknown placeholder: {{{}}}", name),
            ResolveError::UnclosedPlaceholder => write!(f, "Unclosed placeholder in path template"),
            ResolveError::MissingSubstitution(name) => {
                write!(f, "Stream identifier cannot fill {{{}}}", name)
            }
        }
    }
}

impl std::error::Error for ResolveError {}

/// Error type for recording operations
#[derive(Debug)]
pub enum RecordError {
    /// A recorder for this key is already active (benign)
    AlreadyRecording(RecorderKey),
    /// Format policy is disabled or does not match the stream
    NotRecordable(RecorderKey),
    /// Destination path could not be rendered
    Resolve(ResolveError),
    /// Frame source refused the subscription
    Source(SourceError),
    /// File system failure
    Io {
        path: Option<PathBuf>,
        source: io::Error,
    },
    /// Codec data could not be parsed or muxed
    Media(MediaError),
    /// Recorder task ended before reporting its open result
    Aborted,
}

impl RecordError {
    /// Wrap an I/O error with the path it happened on
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        RecordError::Io {
            path: Some(path.as_ref().to_path_buf()),
            source,
        }
    }

    /// Duplicate starts are expected and ignored by callers
    pub fn is_already_recording(&self) -> bool {
        matches!(self, RecordError::AlreadyRecording(_))
    }
}

impl std::fmt::Display for RecordError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordError::AlreadyRecording(key) => write!(f, "Recorder exists: {}", key),
            RecordError::NotRecordable(key) => write!(f, "Stream not recordable: {}", key),
            RecordError::Resolve(e) => write!(f, "Path resolution failed: {}", e),
            RecordError::Source(e) => write!(f, "Subscription failed: {}", e),
            RecordError::Io {
                path: Some(path),
                source,
            } => write!(f, "I/O error on {}: {}", path.display(), source),
            RecordError::Io { path: None, source } => write!(f, "I/O error: {}", source),
            RecordError::Media(e) => write!(f, "Media error: {}", e),
            RecordError::Aborted => write!(f, "Recorder task aborted"),
        }
    }
}

impl std::error::Error for RecordError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RecordError::Resolve(e) => Some(e),
            RecordError::Source(e) => Some(e),
            RecordError::Io { source, .. } => Some(source),
            RecordError::Media(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for RecordError {
    fn from(source: io::Error) -> Self {
        RecordError::Io { path: None, source }
    }
}

impl From<MediaError> for RecordError {
    fn from(e: MediaError) -> Self {
        RecordError::Media(e)
    }
}

impl From<ResolveError> for RecordError {
    fn from(e: ResolveError) -> Self {
        RecordError::Resolve(e)
    }
}

impl From<SourceError> for RecordError {
    fn from(e: SourceError) -> Self {
        RecordError::Source(e)
    }
}
