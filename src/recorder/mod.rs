//! Per-format recorders
//!
//! A recorder turns the frames of one subscription into files. The shared
//! lifecycle (path resolution, resume baseline, subscription, gating and
//! timestamp normalization, stop handling) lives in [`session`]; each
//! format only implements [`Recorder`].
//!
//! ```text
//!   session::run
//!     ├─ resolve path, recover baseline (append)
//!     ├─ subscribe (wait for publish)
//!     ├─ Recorder::open
//!     ├─ loop { stop? | next_frame → gate → normalize → write_frame }
//!     └─ Recorder::close → RecordingStats
//! ```

pub mod flv;
pub mod fmp4;
pub mod hls;
pub mod mp4;
pub mod output;
pub mod raw;
pub mod session;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{Policy, RecordPolicies};
use crate::error::Result;
use crate::format::RecordFormat;
use crate::hub::MediaFrame;
use crate::registry::RecorderKey;
use crate::stats::RecordingStats;

pub use flv::FlvRecorder;
pub use fmp4::Fmp4Recorder;
pub use hls::HlsRecorder;
pub use mp4::Mp4Recorder;
pub use output::OutputFile;
pub use raw::{RawAudioRecorder, RawVideoRecorder};
pub use session::{SessionParams, SessionState};

/// Everything a recorder needs to open its output
#[derive(Debug, Clone)]
pub struct RecordTarget {
    pub key: RecorderKey,
    /// Resolved output path (without extension for codec-dependent formats)
    pub path: PathBuf,
    /// Snapshot the recorder was started with
    pub policies: Arc<RecordPolicies>,
    /// Continue an existing file instead of truncating it
    pub append: bool,
    /// Timestamp the first written frame maps to (ms)
    pub baseline: u32,
}

impl RecordTarget {
    pub fn policy(&self) -> &Policy {
        self.policies.policy(self.key.format)
    }

    pub fn stream(&self) -> &str {
        &self.key.stream
    }

    /// Segment or fragment length for segmented formats
    pub fn fragment_duration(&self) -> Option<Duration> {
        self.policy().fragment_duration
    }
}

/// Outcome of a successful open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenInfo {
    /// File opened, or `None` when it is created once the codec is known
    pub path: Option<PathBuf>,
    /// Whether an existing file is being continued
    pub appended: bool,
}

/// Container writer driven by [`session::run`]
///
/// Frames arrive in publish order with timestamps already normalized.
/// Video frames before the first keyframe are never delivered to
/// containers that carry video.
#[async_trait]
pub trait Recorder: Send {
    fn format(&self) -> RecordFormat;

    /// Whether an existing file can be continued. Recorders that cannot
    /// are opened fresh even when append is configured.
    fn supports_append(&self) -> bool {
        true
    }

    /// Create or reopen the output
    async fn open(&mut self, target: &RecordTarget) -> Result<OpenInfo>;

    async fn write_frame(&mut self, frame: &MediaFrame) -> Result<()>;

    /// Cut the current segment or fragment
    async fn rotate(&mut self) -> Result<()> {
        Ok(())
    }

    /// Write trailers and release the output
    async fn close(&mut self) -> Result<RecordingStats>;
}

/// Creates a fresh recorder
pub type RecorderConstructor = fn() -> Box<dyn Recorder>;

fn new_flv() -> Box<dyn Recorder> {
    Box::new(FlvRecorder::new())
}

fn new_mp4() -> Box<dyn Recorder> {
    Box::new(Mp4Recorder::new())
}

fn new_fmp4() -> Box<dyn Recorder> {
    Box::new(Fmp4Recorder::new())
}

fn new_hls() -> Box<dyn Recorder> {
    Box::new(HlsRecorder::new())
}

fn new_raw_video() -> Box<dyn Recorder> {
    Box::new(RawVideoRecorder::new())
}

fn new_raw_audio() -> Box<dyn Recorder> {
    Box::new(RawAudioRecorder::new())
}

/// Constructor table, one entry per format
pub const RECORDERS: [(RecordFormat, RecorderConstructor); 6] = [
    (RecordFormat::Flv, new_flv),
    (RecordFormat::Mp4, new_mp4),
    (RecordFormat::Fmp4, new_fmp4),
    (RecordFormat::Hls, new_hls),
    (RecordFormat::Raw, new_raw_video),
    (RecordFormat::RawAudio, new_raw_audio),
];

/// Constructor registered for `format`
pub fn constructor(format: RecordFormat) -> Option<RecorderConstructor> {
    RECORDERS
        .iter()
        .find(|(f, _)| *f == format)
        .map(|(_, ctor)| *ctor)
}
