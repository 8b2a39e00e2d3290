//! Raw elementary stream recorders
//!
//! Video is written as Annex-B with parameter sets ahead of every
//! keyframe; AAC audio as ADTS; G.711 and MP3 as their bare payload. The
//! output file is created once the codec is known, since a `.` extension
//! lets the codec pick it.

use std::path::PathBuf;

use async_trait::async_trait;
use bytes::BytesMut;

use super::output::OutputFile;
use super::{OpenInfo, RecordTarget, Recorder};
use crate::error::Result;
use crate::format::RecordFormat;
use crate::hub::MediaFrame;
use crate::media::aac::AudioSpecificConfig;
use crate::media::packet::audio_elementary_ext;
use crate::media::{AudioFormat, AudioPacket, VideoConfig, VideoPacket};
use crate::stats::RecordingStats;

/// Output file shared by both raw recorders
struct RawOutput {
    target: Option<RecordTarget>,
    output: Option<OutputFile>,
    stats: RecordingStats,
}

impl RawOutput {
    fn new() -> Self {
        Self {
            target: None,
            output: None,
            stats: RecordingStats::new(),
        }
    }

    fn open(&mut self, target: &RecordTarget) -> OpenInfo {
        self.target = Some(target.clone());
        let path = (!target.policy().codec_dependent_ext()).then(|| target.path.clone());
        OpenInfo {
            path,
            appended: false,
        }
    }

    fn path_for(&self, target: &RecordTarget, codec_ext: &str) -> Result<PathBuf> {
        if target.policy().codec_dependent_ext() {
            Ok(target
                .policies
                .resolve_path_with_ext(target.key.format, target.stream(), codec_ext)?)
        } else {
            Ok(target.path.clone())
        }
    }

    /// Create the file on first use
    async fn ensure(&mut self, codec_ext: &str) -> Result<()> {
        if self.output.is_some() {
            return Ok(());
        }
        let Some(target) = self.target.as_ref() else {
            return Ok(());
        };
        let path = self.path_for(target, codec_ext)?;
        let output = if target.append {
            OutputFile::append(&path).await?
        } else {
            OutputFile::create(&path).await?
        };
        tracing::info!(
            recorder = %target.key,
            path = %path.display(),
            offset = output.position(),
            "Raw output created"
        );
        self.stats.record_file(&path);
        self.output = Some(output);
        Ok(())
    }

    async fn write(&mut self, data: &[u8], frame: &MediaFrame) -> Result<()> {
        let Some(output) = self.output.as_mut() else {
            self.stats.record_drop();
            return Ok(());
        };
        output.write_all(data).await?;
        self.stats.record_bytes(data.len());
        self.stats.record_frame(frame);
        Ok(())
    }

    async fn close(&mut self) -> Result<RecordingStats> {
        if let Some(output) = self.output.take() {
            output.finish().await?;
        }
        Ok(std::mem::take(&mut self.stats))
    }
}

/// Records the video track as an Annex-B elementary stream
pub struct RawVideoRecorder {
    out: RawOutput,
    config: Option<VideoConfig>,
    buf: BytesMut,
}

impl RawVideoRecorder {
    pub fn new() -> Self {
        Self {
            out: RawOutput::new(),
            config: None,
            buf: BytesMut::new(),
        }
    }
}

impl Default for RawVideoRecorder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Recorder for RawVideoRecorder {
    fn format(&self) -> RecordFormat {
        RecordFormat::Raw
    }

    async fn open(&mut self, target: &RecordTarget) -> Result<OpenInfo> {
        Ok(self.out.open(target))
    }

    async fn write_frame(&mut self, frame: &MediaFrame) -> Result<()> {
        if !frame.is_video() {
            return Ok(());
        }
        match VideoPacket::parse(&frame.data) {
            Ok(VideoPacket::SequenceHeader { codec, record }) => match VideoConfig::parse(codec, record) {
                Ok(config) => {
                    self.out.ensure(config.elementary_ext()).await?;
                    self.config = Some(config);
                }
                Err(e) => tracing::warn!(error = %e, "Unusable video sequence header"),
            },
            Ok(VideoPacket::Frame { keyframe, data, .. }) => {
                let Some(config) = self.config.as_ref() else {
                    self.out.stats.record_drop();
                    return Ok(());
                };
                self.buf.clear();
                config.write_annexb(&data, keyframe, false, &mut self.buf);
                self.out.write(&self.buf, frame).await?;
            }
            Ok(VideoPacket::EndOfSequence) => {}
            Err(e) => {
                tracing::debug!(error = %e, "Skipping video frame");
                self.out.stats.record_drop();
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<RecordingStats> {
        self.out.close().await
    }
}

/// Records the audio track as a raw elementary stream
pub struct RawAudioRecorder {
    out: RawOutput,
    aac: Option<AudioSpecificConfig>,
    buf: BytesMut,
}

impl RawAudioRecorder {
    pub fn new() -> Self {
        Self {
            out: RawOutput::new(),
            aac: None,
            buf: BytesMut::new(),
        }
    }
}

impl Default for RawAudioRecorder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Recorder for RawAudioRecorder {
    fn format(&self) -> RecordFormat {
        RecordFormat::RawAudio
    }

    async fn open(&mut self, target: &RecordTarget) -> Result<OpenInfo> {
        Ok(self.out.open(target))
    }

    async fn write_frame(&mut self, frame: &MediaFrame) -> Result<()> {
        if !frame.is_audio() {
            return Ok(());
        }
        match AudioPacket::parse(&frame.data) {
            Ok(AudioPacket::AacConfig(raw)) => match AudioSpecificConfig::parse(raw) {
                Ok(config) => {
                    if let Some(ext) = audio_elementary_ext(AudioFormat::Aac) {
                        self.out.ensure(ext).await?;
                    }
                    self.aac = Some(config);
                }
                Err(e) => tracing::warn!(error = %e, "Unusable audio sequence header"),
            },
            Ok(AudioPacket::Aac(data)) => {
                let Some(config) = self.aac.as_ref() else {
                    self.out.stats.record_drop();
                    return Ok(());
                };
                self.buf.clear();
                config.write_adts(&data, &mut self.buf);
                self.out.write(&self.buf, frame).await?;
            }
            Ok(AudioPacket::Other { format, data }) => match audio_elementary_ext(format) {
                Some(ext) => {
                    self.out.ensure(ext).await?;
                    self.out.write(&data, frame).await?;
                }
                None => {
                    tracing::debug!(format = ?format, "Audio codec has no raw form");
                    self.out.stats.record_drop();
                }
            },
            Err(e) => {
                tracing::debug!(error = %e, "Skipping audio frame");
                self.out.stats.record_drop();
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<RecordingStats> {
        self.out.close().await
    }
}
