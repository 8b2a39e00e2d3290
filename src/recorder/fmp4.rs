//! Fragmented MP4 recorder
//!
//! ```text
//!   ftyp | moov (mvex) | moof mdat | moof mdat | ... | mfra
//! ```
//!
//! The init segment is written when the first media sample arrives, using
//! whichever sequence headers have been seen by then. Each sample is held
//! back until its successor arrives so its duration is exact. Fragments
//! are cut at video keyframes (or any audio sample for audio-only streams)
//! once the fragment duration has elapsed.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};

use super::mp4::{sample_payload, track_from_header};
use super::output::{existing_len, OutputFile};
use super::{OpenInfo, RecordTarget, Recorder};
use crate::error::Result;
use crate::format::RecordFormat;
use crate::hub::{FrameType, MediaFrame};
use crate::media::mp4::{self, FragmentSample, RandomAccessEntry, Track, TrackFragment};
use crate::media::StreamMetadata;
use crate::recovery::mp4::{scan_fragmented_tail, FragmentedTail};
use crate::stats::RecordingStats;

const DEFAULT_FRAGMENT: Duration = Duration::from_secs(2);

struct PendingSample {
    dts: u64,
    cts_offset: i32,
    sync: bool,
    data: Bytes,
}

struct FragmentTrack {
    track: Track,
    /// Samples with a known duration, waiting for the next fragment
    ready: TrackFragment,
    held: Option<PendingSample>,
    last_duration: u32,
}

impl FragmentTrack {
    fn new(track: Track) -> Self {
        let id = track.id;
        Self {
            track,
            ready: TrackFragment::new(id, 0),
            held: None,
            last_duration: 0,
        }
    }

    fn release(&mut self, sample: PendingSample, duration: u32) {
        if self.ready.samples.is_empty() {
            self.ready.base_decode_time = sample.dts;
        }
        self.last_duration = duration;
        self.ready.push(
            FragmentSample {
                duration,
                size: sample.data.len() as u32,
                cts_offset: sample.cts_offset,
                sync: sample.sync,
            },
            &sample.data,
        );
    }

    /// The held sample ends at `dts`
    fn advance(&mut self, dts: u64) {
        if let Some(held) = self.held.take() {
            let duration = dts.saturating_sub(held.dts) as u32;
            self.release(held, duration);
        }
    }

    /// Release the held sample, reusing the last known duration
    fn drain(&mut self) {
        if let Some(held) = self.held.take() {
            let duration = self.last_duration;
            self.release(held, duration);
        }
    }

    fn take_ready(&mut self) -> TrackFragment {
        std::mem::replace(&mut self.ready, TrackFragment::new(self.track.id, 0))
    }
}

/// Records a stream into a single fragmented MP4 file
pub struct Fmp4Recorder {
    output: Option<OutputFile>,
    metadata: StreamMetadata,
    video: Option<FragmentTrack>,
    audio: Option<FragmentTrack>,
    init_written: bool,
    sequence: u32,
    fragment_duration: u64,
    fragment_start: Option<u64>,
    random_access: BTreeMap<u32, Vec<RandomAccessEntry>>,
    stats: RecordingStats,
}

impl Fmp4Recorder {
    pub fn new() -> Self {
        Self {
            output: None,
            metadata: StreamMetadata::default(),
            video: None,
            audio: None,
            init_written: false,
            sequence: 0,
            fragment_duration: DEFAULT_FRAGMENT.as_millis() as u64,
            fragment_start: None,
            random_access: BTreeMap::new(),
            stats: RecordingStats::new(),
        }
    }

    fn track_mut(&mut self, frame_type: FrameType) -> Option<&mut FragmentTrack> {
        if frame_type == FrameType::Video {
            self.video.as_mut()
        } else {
            self.audio.as_mut()
        }
    }

    fn tracks_mut(&mut self) -> impl Iterator<Item = &mut FragmentTrack> {
        [self.video.as_mut(), self.audio.as_mut()].into_iter().flatten()
    }

    async fn write_init(&mut self) -> Result<()> {
        let Some(output) = self.output.as_mut() else {
            return Ok(());
        };
        let tracks: Vec<&Track> = [self.video.as_ref(), self.audio.as_ref()]
            .into_iter()
            .flatten()
            .map(|t| &t.track)
            .collect();

        let mut init = BytesMut::new();
        mp4::write_ftyp(&mut init, true);
        mp4::write_init_moov(&mut init, &tracks);
        output.write_all(&init).await?;

        self.stats.record_bytes(init.len());
        self.init_written = true;
        tracing::debug!(path = %output.path().display(), tracks = tracks.len(), "Wrote fMP4 init segment");
        Ok(())
    }

    /// Whether a fragment should end before `frame`
    fn should_cut(&self, frame: &MediaFrame) -> bool {
        let Some(start) = self.fragment_start else {
            return false;
        };
        let boundary = if self.video.is_some() {
            frame.is_video() && frame.is_keyframe
        } else {
            frame.is_audio()
        };
        boundary && (frame.timestamp as u64).saturating_sub(start) >= self.fragment_duration
    }

    fn resume(&mut self, tail: FragmentedTail) {
        self.init_written = true;
        self.sequence = tail.last_sequence;
        for (track_id, entry) in tail.random_access {
            self.random_access.entry(track_id).or_default().push(entry);
        }
    }
}

impl Default for Fmp4Recorder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Recorder for Fmp4Recorder {
    fn format(&self) -> RecordFormat {
        RecordFormat::Fmp4
    }

    async fn open(&mut self, target: &RecordTarget) -> Result<OpenInfo> {
        if let Some(duration) = target.fragment_duration() {
            self.fragment_duration = duration.as_millis() as u64;
        }

        let path = target.path.clone();
        let tail = if target.append && existing_len(&path).await > 0 {
            let scan_path = path.clone();
            let scanned = tokio::task::spawn_blocking(move || {
                let mut file = std::fs::File::open(&scan_path)?;
                scan_fragmented_tail(&mut file)
            })
            .await;
            match scanned {
                Ok(Ok(tail)) if tail.has_init => Some(tail),
                Ok(Ok(_)) => {
                    tracing::warn!(path = %path.display(), "No fMP4 init segment, recreating file");
                    None
                }
                Ok(Err(e)) => {
                    tracing::warn!(path = %path.display(), error = %e, "fMP4 tail unreadable, recreating file");
                    None
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "fMP4 tail scan failed, recreating file");
                    None
                }
            }
        } else {
            None
        };

        let appended = tail.is_some();
        let output = match tail {
            Some(tail) => {
                let output = OutputFile::resume_at(&path, tail.append_offset).await?;
                if let Some(mfra) = tail.mfra_offset {
                    tracing::debug!(path = %path.display(), mfra_offset = mfra, "Dropped trailing fMP4 index");
                }
                self.resume(tail);
                output
            }
            None => OutputFile::create(&path).await?,
        };

        self.stats.record_file(&path);
        self.output = Some(output);
        Ok(OpenInfo {
            path: Some(path),
            appended,
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
            let slot = if frame.is_video() { &self.video } else { &self.audio };
            if self.init_written && slot.is_some() {
                return Ok(());
            }
            if let Some(track) = track_from_header(frame, &self.metadata) {
                let state = Some(FragmentTrack::new(track));
                if frame.is_video() {
                    self.video = state;
                } else {
                    self.audio = state;
                }
            }
            return Ok(());
        }

        let Some((data, cts_offset, sync)) = sample_payload(frame) else {
            self.stats.record_drop();
            return Ok(());
        };
        if self.track_mut(frame.frame_type).is_none() {
            self.stats.record_drop();
            return Ok(());
        }

        if !self.init_written {
            self.write_init().await?;
        }
        let dts = frame.timestamp as u64;
        if let Some(track) = self.track_mut(frame.frame_type) {
            track.advance(dts);
        }
        if self.should_cut(frame) {
            self.rotate().await?;
        }
        self.fragment_start.get_or_insert(dts);

        if let Some(track) = self.track_mut(frame.frame_type) {
            track.held = Some(PendingSample {
                dts,
                cts_offset,
                sync,
                data,
            });
        }
        self.stats.record_frame(frame);
        Ok(())
    }

    /// Write every ready sample as one `moof` + `mdat`
    async fn rotate(&mut self) -> Result<()> {
        let fragments: Vec<TrackFragment> = self
            .tracks_mut()
            .map(FragmentTrack::take_ready)
            .filter(|f| !f.samples.is_empty())
            .collect();
        self.fragment_start = None;
        if fragments.is_empty() {
            return Ok(());
        }
        let Some(output) = self.output.as_mut() else {
            return Ok(());
        };

        self.sequence = self.sequence.wrapping_add(1);
        let moof_offset = output.position();
        let mut buf = BytesMut::new();
        mp4::write_fragment(&mut buf, self.sequence, &fragments);
        output.write_all(&buf).await?;

        for fragment in &fragments {
            self.random_access
                .entry(fragment.track_id)
                .or_default()
                .push(RandomAccessEntry {
                    time: fragment.base_decode_time,
                    moof_offset,
                });
        }
        self.stats.record_bytes(buf.len());
        self.stats.segments += 1;
        tracing::debug!(
            sequence = self.sequence,
            bytes = buf.len(),
            "Wrote fMP4 fragment"
        );
        Ok(())
    }

    async fn close(&mut self) -> Result<RecordingStats> {
        if self.output.is_none() {
            return Ok(std::mem::take(&mut self.stats));
        }
        for track in self.tracks_mut() {
            track.drain();
        }
        self.rotate().await?;

        if let Some(mut output) = self.output.take() {
            if self.init_written {
                let index: Vec<(u32, &[RandomAccessEntry])> = self
                    .random_access
                    .iter()
                    .map(|(id, entries)| (*id, entries.as_slice()))
                    .collect();
                let mut mfra = BytesMut::new();
                mp4::write_mfra(&mut mfra, &index);
                output.write_all(&mfra).await?;
                self.stats.record_bytes(mfra.len());
            }
            output.finish().await?;
        }
        Ok(std::mem::take(&mut self.stats))
    }
}
