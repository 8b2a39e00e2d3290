//! FLV recorder
//!
//! Tags are written as received. The `onMetaData` tag is written ahead of
//! the first audio/video tag with a placeholder duration, and the 8-byte
//! duration value is patched in place when the recording closes.

use std::io::Read;
use std::path::Path;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;

use super::output::{existing_len, OutputFile};
use super::{OpenInfo, RecordTarget, Recorder};
use crate::amf;
use crate::error::{RecordError, Result};
use crate::format::RecordFormat;
use crate::hub::{FrameType, MediaFrame};
use crate::media::flv::{
    self, AudioFormat, FlvTagHeader, FlvTagType, VideoCodec, FILE_HEADER_LEN, PREV_TAG_SIZE_LEN,
    TAG_HEADER_LEN,
};
use crate::media::StreamMetadata;
use crate::recovery;
use crate::stats::RecordingStats;

const BODY_START: u64 = (FILE_HEADER_LEN + PREV_TAG_SIZE_LEN) as u64;

/// Records a stream into a single FLV file
pub struct FlvRecorder {
    output: Option<OutputFile>,
    /// Publisher metadata seen before the script tag was written
    metadata: Option<StreamMetadata>,
    script_written: bool,
    /// Absolute offset of the `duration` number
    duration_offset: Option<u64>,
    scratch: BytesMut,
    stats: RecordingStats,
}

impl FlvRecorder {
    pub fn new() -> Self {
        Self {
            output: None,
            metadata: None,
            script_written: false,
            duration_offset: None,
            scratch: BytesMut::with_capacity(64 * 1024),
            stats: RecordingStats::new(),
        }
    }

    async fn write_script(&mut self, first: &MediaFrame) -> Result<()> {
        let Some(output) = self.output.as_mut() else {
            return Ok(());
        };

        let video = (first.frame_type == FrameType::Video)
            .then(|| first.data.first().copied().and_then(VideoCodec::from_byte))
            .flatten()
            .map(VideoCodec::id);
        let audio = (first.frame_type == FrameType::Audio)
            .then(|| first.data.first().copied().and_then(AudioFormat::from_byte))
            .flatten()
            .map(AudioFormat::id);
        let metadata = self.metadata.take().unwrap_or_default().with_codecs(video, audio);
        let (body, offset) = metadata.to_script(0.0);

        self.duration_offset = Some(output.position() + (TAG_HEADER_LEN + offset) as u64);
        self.scratch.clear();
        flv::encode_tag(&mut self.scratch, FlvTagType::Script, 0, &body);
        output.write_all(&self.scratch).await?;
        self.stats.record_bytes(self.scratch.len());
        self.script_written = true;
        Ok(())
    }
}

impl Default for FlvRecorder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Recorder for FlvRecorder {
    fn format(&self) -> RecordFormat {
        RecordFormat::Flv
    }

    async fn open(&mut self, target: &RecordTarget) -> Result<OpenInfo> {
        let path = target.path.as_path();
        let resume = target.append && existing_len(path).await > BODY_START && {
            let trusted = trusted_tail(path).await;
            if !trusted {
                tracing::warn!(path = %path.display(), "FLV tail not resumable, recreating file");
            }
            trusted
        };

        let output = if resume {
            self.duration_offset = locate_duration(path).await?;
            // an appended file keeps its own script tag
            self.script_written = true;
            if self.duration_offset.is_none() {
                tracing::debug!(path = %path.display(), "No duration field to patch");
            }
            OutputFile::append(path).await?
        } else {
            let mut output = OutputFile::create(path).await?;
            let subscribe = target.policies.subscribe();
            let header = flv::file_header(subscribe.sub_audio, subscribe.sub_video);
            output.write_all(&header).await?;
            self.stats.record_bytes(header.len());
            output
        };

        self.stats.record_file(path);
        self.output = Some(output);
        Ok(OpenInfo {
            path: Some(path.to_path_buf()),
            appended: resume,
        })
    }

    async fn write_frame(&mut self, frame: &MediaFrame) -> Result<()> {
        if frame.frame_type == FrameType::Metadata {
            if !self.script_written {
                if let Some(metadata) = StreamMetadata::from_script(&frame.data) {
                    self.metadata = Some(metadata);
                }
            }
            return Ok(());
        }

        if !self.script_written {
            self.write_script(frame).await?;
        }
        let Some(output) = self.output.as_mut() else {
            return Ok(());
        };

        let tag_type = if frame.is_video() {
            FlvTagType::Video
        } else {
            FlvTagType::Audio
        };
        self.scratch.clear();
        flv::encode_tag(&mut self.scratch, tag_type, frame.timestamp, &frame.data);
        output.write_all(&self.scratch).await?;

        self.stats.record_bytes(self.scratch.len());
        self.stats.record_frame(frame);
        Ok(())
    }

    async fn close(&mut self) -> Result<RecordingStats> {
        if let Some(mut output) = self.output.take() {
            if let (Some(offset), Some(_)) = (self.duration_offset, self.stats.first_timestamp) {
                let duration = self.stats.last_timestamp as f64 / 1000.0;
                output.patch(offset, &duration.to_be_bytes()).await?;
                tracing::debug!(
                    path = %output.path().display(),
                    duration_secs = duration,
                    "Patched FLV duration"
                );
            }
            output.finish().await?;
        }
        Ok(std::mem::take(&mut self.stats))
    }
}

/// Whether an existing file starts with an FLV header and ends on a
/// complete tag
async fn trusted_tail(path: &Path) -> bool {
    let path = path.to_path_buf();
    let checked = tokio::task::spawn_blocking(move || -> std::io::Result<bool> {
        let mut file = std::fs::File::open(&path)?;
        let mut signature = [0u8; 3];
        file.read_exact(&mut signature)?;
        if &signature != b"FLV" {
            return Ok(false);
        }
        Ok(recovery::flv::last_tag_header(&mut file)?.is_some())
    })
    .await;
    matches!(checked, Ok(Ok(true)))
}

/// Offset of the `duration` value inside the first script tag of an
/// existing file
async fn locate_duration(path: &Path) -> Result<Option<u64>> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| RecordError::io(path, e))?;

    let mut head = [0u8; FILE_HEADER_LEN + PREV_TAG_SIZE_LEN + TAG_HEADER_LEN];
    if file.read_exact(&mut head).await.is_err() || &head[..3] != b"FLV" {
        return Ok(None);
    }
    let mut tag = [0u8; TAG_HEADER_LEN];
    tag.copy_from_slice(&head[BODY_START as usize..]);
    let header = match FlvTagHeader::parse(&tag) {
        Some(header) if header.tag_type == FlvTagType::Script => header,
        _ => return Ok(None),
    };

    let mut body = vec![0u8; header.data_size as usize];
    if file.read_exact(&mut body).await.is_err() {
        return Ok(None);
    }
    Ok(amf::locate_number(&Bytes::from(body), "duration")
        .map(|offset| BODY_START + TAG_HEADER_LEN as u64 + offset as u64))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::amf::AmfValue;
    use crate::config::{FormatPolicy, RecordConfig, RecordPolicies};
    use crate::recorder::test_support::*;
    use crate::registry::RecorderKey;

    fn target(path: &Path, append: bool, baseline: u32) -> RecordTarget {
        let config = RecordConfig::default().with_format(RecordFormat::Flv, FormatPolicy::enabled());
        RecordTarget {
            key: RecorderKey::new("live/cam1", RecordFormat::Flv),
            path: path.to_path_buf(),
            policies: Arc::new(RecordPolicies::compile(&config).unwrap()),
            append,
            baseline,
        }
    }

    fn script_values(file: &[u8]) -> Vec<AmfValue> {
        let mut tag = [0u8; TAG_HEADER_LEN];
        tag.copy_from_slice(&file[13..24]);
        let header = FlvTagHeader::parse(&tag).unwrap();
        assert_eq!(header.tag_type, FlvTagType::Script);
        let body = Bytes::copy_from_slice(&file[24..24 + header.data_size as usize]);
        let values = amf::decode_all(&body).unwrap();
        assert_eq!(values[0].as_str(), Some("onMetaData"));
        values
    }

    fn script_duration(file: &[u8]) -> f64 {
        script_values(file)[1]
            .get("duration")
            .and_then(AmfValue::as_number)
            .unwrap()
    }

    /// Walk the tag chain from the file header; true when every
    /// PreviousTagSize matches and the chain ends exactly at EOF
    fn walks_cleanly(file: &[u8]) -> bool {
        let mut pos = BODY_START as usize;
        while pos < file.len() {
            if pos + TAG_HEADER_LEN > file.len() {
                return false;
            }
            let mut raw = [0u8; TAG_HEADER_LEN];
            raw.copy_from_slice(&file[pos..pos + TAG_HEADER_LEN]);
            let Some(header) = FlvTagHeader::parse(&raw) else {
                return false;
            };
            let end = pos + TAG_HEADER_LEN + header.data_size as usize;
            if end + PREV_TAG_SIZE_LEN > file.len() {
                return false;
            }
            let prev = u32::from_be_bytes([file[end], file[end + 1], file[end + 2], file[end + 3]]);
            if prev as usize != TAG_HEADER_LEN + header.data_size as usize {
                return false;
            }
            pos = end + PREV_TAG_SIZE_LEN;
        }
        pos == file.len()
    }

    async fn record(path: &Path, append: bool, baseline: u32, frames: Vec<MediaFrame>) -> RecordingStats {
        let mut recorder = FlvRecorder::new();
        recorder.open(&target(path, append, baseline)).await.unwrap();
        for frame in frames {
            let ts = baseline + frame.timestamp;
            recorder.write_frame(&frame.with_timestamp(ts)).await.unwrap();
        }
        recorder.close().await.unwrap()
    }

    #[tokio::test]
    async fn test_fresh_recording() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live/cam1.flv");

        let stats = record(&path, false, 0, stream(2)).await;
        assert_eq!(stats.video_frames, 51);
        assert_eq!(stats.last_timestamp, 1965);

        let file = std::fs::read(&path).unwrap();
        assert_eq!(&file[..3], b"FLV");
        assert_eq!(file.len() as u64, stats.bytes_written);
        assert_eq!(script_duration(&file), 1.965);

        let recovered = recovery::recover_last_timestamp(RecordFormat::Flv, &path);
        assert_eq!(recovered, 1965);
    }

    #[tokio::test]
    async fn test_metadata_fields_carried() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.flv");
        record(&path, false, 0, stream(1)).await;

        let file = std::fs::read(&path).unwrap();
        let values = script_values(&file);
        let props = &values[1];
        assert_eq!(props.get("width").and_then(AmfValue::as_number), Some(1280.0));
        assert_eq!(props.get("framerate").and_then(AmfValue::as_number), Some(25.0));
        assert_eq!(props.get("videocodecid").and_then(AmfValue::as_number), Some(7.0));
    }

    #[tokio::test]
    async fn test_append_continues_timeline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cam1.flv");

        record(&path, false, 0, stream(1)).await;
        let before = std::fs::metadata(&path).unwrap().len();
        let baseline = recovery::recover_last_timestamp(RecordFormat::Flv, &path);
        assert_eq!(baseline, 965);

        let mut more = stream(1);
        more.retain(|f| !f.is_header && f.frame_type != FrameType::Metadata);
        let stats = record(&path, true, baseline, more).await;
        assert_eq!(stats.first_timestamp, Some(965));

        let file = std::fs::read(&path).unwrap();
        assert!(file.len() as u64 > before);
        assert_eq!(&file[..3], b"FLV");
        assert_eq!(
            recovery::recover_last_timestamp(RecordFormat::Flv, &path),
            965 + 965
        );
        assert_eq!(script_duration(&file), 1.93);
        assert!(walks_cleanly(&file));
    }

    #[tokio::test]
    async fn test_append_onto_torn_tail_recreates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("torn.flv");

        record(&path, false, 0, stream(1)).await;
        let len = std::fs::metadata(&path).unwrap().len();
        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(len - 7)
            .unwrap();
        let baseline = recovery::recover_last_timestamp(RecordFormat::Flv, &path);
        assert_eq!(baseline, 0);

        let mut recorder = FlvRecorder::new();
        let info = recorder.open(&target(&path, true, baseline)).await.unwrap();
        assert!(!info.appended);
        for frame in stream(1) {
            recorder.write_frame(&frame).await.unwrap();
        }
        let stats = recorder.close().await.unwrap();

        let file = std::fs::read(&path).unwrap();
        assert_eq!(file.len() as u64, stats.bytes_written);
        assert!(walks_cleanly(&file));
        assert_eq!(recovery::recover_last_timestamp(RecordFormat::Flv, &path), 965);
    }

    #[tokio::test]
    async fn test_append_onto_foreign_file_recreates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foreign.flv");
        std::fs::write(&path, vec![0x42u8; 256]).unwrap();

        let mut recorder = FlvRecorder::new();
        let info = recorder.open(&target(&path, true, 0)).await.unwrap();
        assert!(!info.appended);
        recorder.close().await.unwrap();
        assert_eq!(&std::fs::read(&path).unwrap()[..3], b"FLV");
    }

    #[tokio::test]
    async fn test_append_to_missing_file_starts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("new.flv");

        let mut recorder = FlvRecorder::new();
        let info = recorder.open(&target(&path, true, 0)).await.unwrap();
        assert!(!info.appended);
        recorder.close().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap().len(), 13);
    }
}
