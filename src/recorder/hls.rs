//! HLS recorder
//!
//! MPEG-TS segments are written next to the playlist, in a directory named
//! after the playlist stem:
//!
//! ```text
//!   record/hls/live/cam1.m3u8
//!   record/hls/live/cam1/0.ts
//!   record/hls/live/cam1/1.ts
//! ```
//!
//! The playlist is rewritten after every segment through a temporary file
//! and a rename, so readers never see a partial playlist.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::BytesMut;

use super::output::{existing_len, OutputFile};
use super::{OpenInfo, RecordTarget, Recorder};
use crate::error::{RecordError, Result};
use crate::format::RecordFormat;
use crate::hub::{FrameType, MediaFrame};
use crate::media::aac::AudioSpecificConfig;
use crate::media::m3u8::Playlist;
use crate::media::ts::{StreamType, TsMuxer};
use crate::media::{AudioPacket, VideoCodec, VideoConfig, VideoPacket};
use crate::recovery::hls::parse_playlist;
use crate::stats::RecordingStats;

const DEFAULT_SEGMENT_MS: u64 = 10_000;

struct Segment {
    output: OutputFile,
    muxer: TsMuxer,
    start: u64,
    uri: String,
}

/// Records a stream as an HLS event playlist
pub struct HlsRecorder {
    playlist_path: PathBuf,
    segment_dir: PathBuf,
    stem: String,
    playlist: Playlist,
    video: Option<VideoConfig>,
    audio: Option<AudioSpecificConfig>,
    segment: Option<Segment>,
    segment_duration: u64,
    last_ts: u64,
    scratch: BytesMut,
    stats: RecordingStats,
}

impl HlsRecorder {
    pub fn new() -> Self {
        Self {
            playlist_path: PathBuf::new(),
            segment_dir: PathBuf::new(),
            stem: String::new(),
            playlist: Playlist::default(),
            video: None,
            audio: None,
            segment: None,
            segment_duration: DEFAULT_SEGMENT_MS,
            last_ts: 0,
            scratch: BytesMut::new(),
            stats: RecordingStats::new(),
        }
    }

    async fn start_segment(&mut self, start: u64) -> Result<()> {
        let sequence = self.playlist.next_sequence();
        let path = self.segment_dir.join(format!("{}.ts", sequence));
        let mut output = OutputFile::create(&path).await?;

        let video = self.video.as_ref().map(|config| match config.codec() {
            VideoCodec::Hevc => StreamType::H265,
            _ => StreamType::H264,
        });
        let audio = self.audio.as_ref().map(|_| StreamType::AdtsAac);
        let mut muxer = TsMuxer::new(video, audio);

        self.scratch.clear();
        muxer.write_tables(&mut self.scratch);
        output.write_all(&self.scratch).await?;
        self.stats.record_bytes(self.scratch.len());
        self.stats.record_file(&path);

        tracing::debug!(path = %path.display(), sequence = sequence, start = start, "HLS segment opened");
        self.segment = Some(Segment {
            output,
            muxer,
            start,
            uri: format!("{}/{}.ts", self.stem, sequence),
        });
        Ok(())
    }

    /// Close the open segment as ending at `end` and publish it
    async fn finish_segment(&mut self, end: u64) -> Result<()> {
        let Some(segment) = self.segment.take() else {
            return Ok(());
        };
        segment.output.finish().await?;

        let duration = end.saturating_sub(segment.start);
        self.playlist.push(duration, segment.uri);
        self.stats.segments += 1;
        self.write_playlist().await
    }

    async fn write_playlist(&self) -> Result<()> {
        let path = &self.playlist_path;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RecordError::io(parent, e))?;
        }

        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, self.playlist.render())
            .await
            .map_err(|e| RecordError::io(&tmp, e))?;
        tokio::fs::rename(&tmp, path)
            .await
            .map_err(|e| RecordError::io(path, e))
    }

    /// Whether a new segment starts with `frame`
    fn starts_segment(&self, frame: &MediaFrame) -> bool {
        let boundary = if self.video.is_some() {
            frame.is_video() && frame.is_keyframe
        } else {
            frame.is_audio()
        };
        if !boundary {
            return false;
        }
        match &self.segment {
            None => true,
            Some(segment) => (frame.timestamp as u64).saturating_sub(segment.start) >= self.segment_duration,
        }
    }

    fn handle_header(&mut self, frame: &MediaFrame) {
        if frame.is_video() {
            match VideoPacket::parse(&frame.data) {
                Ok(VideoPacket::SequenceHeader { codec, record }) => match VideoConfig::parse(codec, record) {
                    Ok(config) => self.video = Some(config),
                    Err(e) => tracing::warn!(error = %e, "Unusable video sequence header"),
                },
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Unusable video sequence header"),
            }
        } else if let Ok(AudioPacket::AacConfig(raw)) = AudioPacket::parse(&frame.data) {
            match AudioSpecificConfig::parse(raw) {
                Ok(config) => self.audio = Some(config),
                Err(e) => tracing::warn!(error = %e, "Unusable audio sequence header"),
            }
        }
    }
}

impl Default for HlsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

fn segment_layout(playlist: &Path) -> (PathBuf, String) {
    let stem = playlist
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "index".to_string());
    let dir = playlist
        .parent()
        .map(|parent| parent.join(&stem))
        .unwrap_or_else(|| PathBuf::from(&stem));
    (dir, stem)
}

#[async_trait]
impl Recorder for HlsRecorder {
    fn format(&self) -> RecordFormat {
        RecordFormat::Hls
    }

    async fn open(&mut self, target: &RecordTarget) -> Result<OpenInfo> {
        if let Some(duration) = target.fragment_duration() {
            self.segment_duration = duration.as_millis() as u64;
        }
        self.playlist_path = target.path.clone();
        (self.segment_dir, self.stem) = segment_layout(&target.path);

        let resume = target.append && existing_len(&target.path).await > 0;
        if resume {
            let path = target.path.clone();
            let mut playlist = tokio::task::spawn_blocking(move || parse_playlist(&path))
                .await
                .unwrap_or_default();
            playlist.ended = false;
            tracing::debug!(
                path = %target.path.display(),
                segments = playlist.segments.len(),
                next_sequence = playlist.next_sequence(),
                "Continuing HLS playlist"
            );
            self.playlist = playlist;
        }
        self.write_playlist().await?;
        self.stats.record_file(&target.path);

        Ok(OpenInfo {
            path: Some(target.path.clone()),
            appended: resume,
        })
    }

    async fn write_frame(&mut self, frame: &MediaFrame) -> Result<()> {
        match frame.frame_type {
            FrameType::Metadata => return Ok(()),
            _ if frame.is_header => {
                self.handle_header(frame);
                return Ok(());
            }
            _ => {}
        }

        let ts = frame.timestamp as u64;
        if self.starts_segment(frame) {
            self.last_ts = self.last_ts.max(ts);
            self.rotate().await?;
            self.start_segment(ts).await?;
        }
        self.last_ts = self.last_ts.max(ts);

        let Some(segment) = self.segment.as_mut() else {
            self.stats.record_drop();
            return Ok(());
        };

        self.scratch.clear();
        let written = match frame.frame_type {
            FrameType::Video => match (&self.video, VideoPacket::parse(&frame.data)) {
                (
                    Some(config),
                    Ok(VideoPacket::Frame {
                        keyframe,
                        composition_time,
                        data,
                        ..
                    }),
                ) => {
                    let mut annexb = BytesMut::with_capacity(data.len() + 64);
                    config.write_annexb(&data, keyframe, true, &mut annexb);
                    let pts = (ts as i64 + composition_time as i64).max(0) as u64;
                    segment.muxer.write_video(&mut self.scratch, &annexb, ts, pts, keyframe);
                    true
                }
                _ => false,
            },
            _ => match (&self.audio, AudioPacket::parse(&frame.data)) {
                (Some(config), Ok(AudioPacket::Aac(data))) => {
                    let mut adts = BytesMut::with_capacity(data.len() + 7);
                    config.write_adts(&data, &mut adts);
                    segment.muxer.write_audio(&mut self.scratch, &adts, ts);
                    true
                }
                _ => false,
            },
        };
        if !written {
            self.stats.record_drop();
            return Ok(());
        }

        segment.output.write_all(&self.scratch).await?;
        self.stats.record_bytes(self.scratch.len());
        self.stats.record_frame(frame);
        Ok(())
    }

    async fn rotate(&mut self) -> Result<()> {
        self.finish_segment(self.last_ts).await
    }

    async fn close(&mut self) -> Result<RecordingStats> {
        self.rotate().await?;
        if !self.playlist_path.as_os_str().is_empty() {
            self.playlist.ended = true;
            self.write_playlist().await?;
        }
        Ok(std::mem::take(&mut self.stats))
    }
}
