//! Per-recording statistics

use std::path::PathBuf;
use std::time::Duration;

use crate::hub::{FrameType, MediaFrame};

/// Summary returned when a recorder closes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordingStats {
    /// Bytes written across every output file
    pub bytes_written: u64,
    /// Video frames written
    pub video_frames: u64,
    /// Audio frames written
    pub audio_frames: u64,
    /// Keyframes written
    pub keyframes: u64,
    /// Frames skipped (filtered, before the first keyframe, or unsupported)
    pub dropped_frames: u64,
    /// Segments or fragments completed
    pub segments: u64,
    /// First media timestamp written (ms)
    pub first_timestamp: Option<u32>,
    /// Last media timestamp written (ms)
    pub last_timestamp: u32,
    /// Files created or appended to
    pub files: Vec<PathBuf>,
}

impl RecordingStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for one media frame written
    pub fn record_frame(&mut self, frame: &MediaFrame) {
        match frame.frame_type {
            FrameType::Video => {
                self.video_frames += 1;
                if frame.is_keyframe && !frame.is_header {
                    self.keyframes += 1;
                }
            }
            FrameType::Audio => self.audio_frames += 1,
            FrameType::Metadata => return,
        }
        if self.first_timestamp.is_none() {
            self.first_timestamp = Some(frame.timestamp);
        }
        self.last_timestamp = self.last_timestamp.max(frame.timestamp);
    }

    pub fn record_bytes(&mut self, n: usize) {
        self.bytes_written += n as u64;
    }

    pub fn record_drop(&mut self) {
        self.dropped_frames += 1;
    }

    pub fn record_file(&mut self, path: impl Into<PathBuf>) {
        self.files.push(path.into());
    }

    /// Media time covered by the written frames
    pub fn media_duration(&self) -> Duration {
        let first = self.first_timestamp.unwrap_or(self.last_timestamp);
        Duration::from_millis(self.last_timestamp.saturating_sub(first) as u64)
    }

    /// Average bitrate over the media duration in bits per second
    pub fn bitrate(&self) -> u64 {
        let millis = self.media_duration().as_millis() as u64;
        if millis > 0 {
            self.bytes_written * 8 * 1000 / millis
        } else {
            0
        }
    }
}
