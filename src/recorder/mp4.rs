//! Progressive MP4 recorder
//!
//! Samples stream into a 64-bit `mdat` right after `ftyp`; the sample
//! tables are kept in memory and written as `moov` at close, together with
//! the final `mdat` size. A file without `moov` is not playable, so a
//! progressive MP4 cannot be appended to once closed.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use super::output::OutputFile;
use super::{OpenInfo, RecordTarget, Recorder};
use crate::error::Result;
use crate::format::RecordFormat;
use crate::hub::{FrameType, MediaFrame};
use crate::media::aac::AudioSpecificConfig;
use crate::media::mp4::{self, Sample, SampleTable, Track, TrackCodec};
use crate::media::{AudioPacket, StreamMetadata, VideoConfig, VideoPacket};
use crate::stats::RecordingStats;

pub(super) const VIDEO_TRACK_ID: u32 = 1;
pub(super) const AUDIO_TRACK_ID: u32 = 2;

/// Build a track from a sequence header frame
pub(super) fn track_from_header(frame: &MediaFrame, metadata: &StreamMetadata) -> Option<Track> {
    let codec = match frame.frame_type {
        FrameType::Video => match VideoPacket::parse(&frame.data) {
            Ok(VideoPacket::SequenceHeader { codec, record }) => VideoConfig::parse(codec, record)
                .map(TrackCodec::Video)
                .map_err(|e| tracing::warn!(error = %e, "Unusable video sequence header"))
                .ok()?,
            Ok(_) => return None,
            Err(e) => {
                tracing::warn!(error = %e, "Unusable video sequence header");
                return None;
            }
        },
        FrameType::Audio => match AudioPacket::parse(&frame.data) {
            Ok(AudioPacket::AacConfig(raw)) => AudioSpecificConfig::parse(raw)
                .map(TrackCodec::Audio)
                .map_err(|e| tracing::warn!(error = %e, "Unusable audio sequence header"))
                .ok()?,
            _ => return None,
        },
        FrameType::Metadata => return None,
    };

    let (width, height) = metadata.dimensions();
    let id = match codec {
        TrackCodec::Video(_) => VIDEO_TRACK_ID,
        TrackCodec::Audio(_) => AUDIO_TRACK_ID,
    };
    Some(Track {
        id,
        codec,
        width,
        height,
    })
}

/// Sample payload of a media frame: data, composition offset, sync flag
pub(super) fn sample_payload(frame: &MediaFrame) -> Option<(Bytes, i32, bool)> {
    match frame.frame_type {
        FrameType::Video => match VideoPacket::parse(&frame.data) {
            Ok(VideoPacket::Frame {
                data,
                composition_time,
                keyframe,
                ..
            }) => Some((data, composition_time, keyframe)),
            _ => None,
        },
        FrameType::Audio => match AudioPacket::parse(&frame.data) {
            Ok(AudioPacket::Aac(data)) => Some((data, 0, true)),
            _ => None,
        },
        FrameType::Metadata => None,
    }
}

struct TrackState {
    track: Track,
    table: SampleTable,
}

/// Records a stream into a progressive MP4 file
pub struct Mp4Recorder {
    output: Option<OutputFile>,
    mdat_offset: u64,
    metadata: StreamMetadata,
    video: Option<TrackState>,
    audio: Option<TrackState>,
    stats: RecordingStats,
}

impl Mp4Recorder {
    pub fn new() -> Self {
        Self {
            output: None,
            mdat_offset: 0,
            metadata: StreamMetadata::default(),
            video: None,
            audio: None,
            stats: RecordingStats::new(),
        }
    }

    fn track_mut(&mut self, frame_type: FrameType) -> &mut Option<TrackState> {
        if frame_type == FrameType::Video {
            &mut self.video
        } else {
            &mut self.audio
        }
    }
}

impl Default for Mp4Recorder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Recorder for Mp4Recorder {
    fn format(&self) -> RecordFormat {
        RecordFormat::Mp4
    }

    fn supports_append(&self) -> bool {
        false
    }

    async fn open(&mut self, target: &RecordTarget) -> Result<OpenInfo> {
        let mut output = OutputFile::create(&target.path).await?;

        let mut head = BytesMut::new();
        mp4::write_ftyp(&mut head, false);
        self.mdat_offset = head.len() as u64;
        head.extend_from_slice(&mp4::large_mdat_header());
        output.write_all(&head).await?;

        self.stats.record_bytes(head.len());
        self.stats.record_file(&target.path);
        self.output = Some(output);
        Ok(OpenInfo {
            path: Some(target.path.clone()),
            appended: false,
        })
    }

    async fn write_frame(&mut self, frame: &MediaFrame) -> Result<()> {
        if frame.frame_type == FrameType::Metadata {
            if let Some(metadata) = StreamMetadata::from_script(&frame.data) {
                self.metadata = metadata;
            }
            return Ok(());
        }

        if frame.is_header {
            let slot = self.track_mut(frame.frame_type);
            if slot.as_ref().is_some_and(|state| !state.table.is_empty()) {
                tracing::debug!("Ignoring sequence header change mid-recording");
                return Ok(());
            }
            let track = track_from_header(frame, &self.metadata);
            *self.track_mut(frame.frame_type) = track.map(|track| TrackState {
                track,
                table: SampleTable::new(),
            });
            return Ok(());
        }

        let Some(output) = self.output.as_mut() else {
            return Ok(());
        };
        let state = match frame.frame_type {
            FrameType::Video => self.video.as_mut(),
            _ => self.audio.as_mut(),
        };
        let (Some(state), Some((data, cts_offset, sync))) = (state, sample_payload(frame)) else {
            self.stats.record_drop();
            return Ok(());
        };

        state.table.push(Sample {
            dts: frame.timestamp as u64,
            cts_offset,
            size: data.len() as u32,
            sync,
            offset: output.position(),
        });
        output.write_all(&data).await?;
        self.stats.record_bytes(data.len());
        self.stats.record_frame(frame);
        Ok(())
    }

    async fn close(&mut self) -> Result<RecordingStats> {
        let Some(mut output) = self.output.take() else {
            return Ok(std::mem::take(&mut self.stats));
        };

        let mdat_size = output.position() - self.mdat_offset;
        output.patch(self.mdat_offset + 8, &mdat_size.to_be_bytes()).await?;

        let tracks: Vec<(&Track, &SampleTable)> = [self.video.as_ref(), self.audio.as_ref()]
            .into_iter()
            .flatten()
            .filter(|state| !state.table.is_empty())
            .map(|state| (&state.track, &state.table))
            .collect();
        let mut moov = BytesMut::new();
        mp4::write_moov(&mut moov, &tracks);
        output.write_all(&moov).await?;
        self.stats.record_bytes(moov.len());

        tracing::debug!(
            path = %output.path().display(),
            tracks = tracks.len(),
            mdat_size = mdat_size,
            "Wrote MP4 index"
        );
        output.finish().await?;
        Ok(std::mem::take(&mut self.stats))
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::Arc;

    use super::*;
    use crate::config::{FormatPolicy, RecordConfig, RecordPolicies};
    use crate::media::mp4::{child_boxes, find_path};
    use crate::recorder::test_support::*;
    use crate::recovery;
    use crate::registry::RecorderKey;

    fn target(path: &Path) -> RecordTarget {
        let config = RecordConfig::default().with_format(RecordFormat::Mp4, FormatPolicy::enabled());
        RecordTarget {
            key: RecorderKey::new("live/cam1", RecordFormat::Mp4),
            path: path.to_path_buf(),
            policies: Arc::new(RecordPolicies::compile(&config).unwrap()),
            append: false,
            baseline: 0,
        }
    }

    #[tokio::test]
    async fn test_progressive_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cam1.mp4");

        let mut recorder = Mp4Recorder::new();
        recorder.open(&target(&path)).await.unwrap();
        for frame in stream(2) {
            recorder.write_frame(&frame).await.unwrap();
        }
        let stats = recorder.close().await.unwrap();
        assert_eq!(stats.video_frames, 50);
        assert_eq!(stats.audio_frames, 50);

        let file = std::fs::read(&path).unwrap();
        assert_eq!(file.len() as u64, stats.bytes_written);
        let kinds: Vec<[u8; 4]> = child_boxes(&file).map(|(kind, _)| kind).collect();
        assert_eq!(kinds, vec![*b"ftyp", *b"mdat", *b"moov"]);

        let moov = child_boxes(&file)
            .find(|(kind, _)| kind == b"moov")
            .map(|(_, body)| body)
            .unwrap();
        assert!(find_path(moov, &[b"trak", b"mdia", b"minf", b"stbl", b"stsd"]).is_some());

        assert_eq!(recovery::recover_last_timestamp(RecordFormat::Mp4, &path), 2000);
    }

    #[tokio::test]
    async fn test_frames_without_header_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("noheader.mp4");

        let mut recorder = Mp4Recorder::new();
        recorder.open(&target(&path)).await.unwrap();
        recorder.write_frame(&video(0, true)).await.unwrap();
        recorder.write_frame(&audio(5)).await.unwrap();
        let stats = recorder.close().await.unwrap();
        assert_eq!(stats.dropped_frames, 2);
        assert_eq!(stats.video_frames, 0);
    }
}
