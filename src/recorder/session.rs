//! Recorder lifecycle driver
//!
//! ```text
//!   Idle ─► Opening ─► Recording ─► Closing ─► Closed
//!              │
//!              └─► Failed
//! ```
//!
//! The outcome of `Opening` is reported once through a oneshot so the
//! starter learns whether the recording actually began.

use std::sync::Arc;

use tokio::sync::oneshot;

use super::{OpenInfo, RecordTarget, Recorder};
use crate::config::{RecordPolicies, SubscribePolicy};
use crate::error::{RecordError, Result};
use crate::format::RecordFormat;
use crate::hub::{FrameType, MediaFrame, StreamSource};
use crate::recovery;
use crate::registry::{RecorderKey, StopSignal};
use crate::stats::RecordingStats;

/// Lifecycle state of one recording
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Opening,
    Recording,
    Closing,
    Closed,
    Failed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Opening => "opening",
            SessionState::Recording => "recording",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Inputs of one recording
pub struct SessionParams {
    pub key: RecorderKey,
    pub policies: Arc<RecordPolicies>,
    pub source: Arc<dyn StreamSource>,
    pub recorder: Box<dyn Recorder>,
}

struct Session {
    key: RecorderKey,
    state: SessionState,
}

impl Session {
    fn transition(&mut self, next: SessionState) {
        tracing::debug!(recorder = %self.key, from = %self.state, to = %next, "Recorder state");
        self.state = next;
    }

    fn fail(&mut self, opened: oneshot::Sender<Result<OpenInfo>>, error: RecordError) {
        tracing::error!(recorder = %self.key, error = %error, "Recorder failed to open");
        self.transition(SessionState::Failed);
        let _ = opened.send(Err(error));
    }
}

/// Drive one recording from open to close.
///
/// Returns the recording summary, or `None` if the recorder never opened
/// or failed to close cleanly.
pub async fn run(
    params: SessionParams,
    mut stop: StopSignal,
    opened: oneshot::Sender<Result<OpenInfo>>,
) -> Option<RecordingStats> {
    let SessionParams {
        key,
        policies,
        source,
        mut recorder,
    } = params;
    let mut session = Session {
        key: key.clone(),
        state: SessionState::Idle,
    };
    session.transition(SessionState::Opening);

    let policy = policies.policy(key.format);
    let path = match policy.resolve_path(&key.stream) {
        Ok(path) => path,
        Err(e) => {
            session.fail(opened, e.into());
            return None;
        }
    };

    let mut append = policy.append;
    if append && !recorder.supports_append() {
        tracing::warn!(
            recorder = %key,
            path = %path.display(),
            "Format cannot be appended to, recreating file"
        );
        append = false;
    }

    let baseline = if append {
        let format = key.format;
        let recover_path = path.clone();
        tokio::task::spawn_blocking(move || recovery::recover_last_timestamp(format, &recover_path))
            .await
            .unwrap_or(0)
    } else {
        0
    };

    let subscribe = policies.subscribe().clone();
    let subscribed = tokio::select! {
        biased;
        _ = stop.stopped() => {
            session.fail(opened, RecordError::Aborted);
            return None;
        }
        result = source.subscribe_within(&key.stream, subscribe.wait_timeout()) => result,
    };
    let mut subscription = match subscribed {
        Ok(subscription) => subscription.with_lag_limit(subscribe.broadcast_lag_limit),
        Err(e) => {
            session.fail(opened, e.into());
            return None;
        }
    };

    let target = RecordTarget {
        key: key.clone(),
        path,
        policies: Arc::clone(&policies),
        append,
        baseline,
    };
    match recorder.open(&target).await {
        Ok(info) => {
            tracing::info!(
                recorder = %key,
                path = %target.path.display(),
                append = info.appended,
                baseline = baseline,
                "Recording started"
            );
            let _ = opened.send(Ok(info));
        }
        Err(e) => {
            session.fail(opened, e);
            return None;
        }
    }
    session.transition(SessionState::Recording);

    let mut gate = FrameGate::new(key.format, &subscribe, baseline);
    let mut dropped = 0u64;
    let mut reason = "stream ended";
    loop {
        let next = tokio::select! {
            biased;
            _ = stop.stopped() => {
                reason = "stop requested";
                break;
            }
            next = subscription.next_frame() => next,
        };
        let Some(frame) = next else {
            break;
        };

        let lagged = subscription.take_lagged();
        if lagged > 0 {
            dropped += lagged;
            gate.resync();
        }

        let Some(frame) = gate.admit(frame) else {
            dropped += 1;
            continue;
        };
        if let Err(e) = recorder.write_frame(&frame).await {
            tracing::error!(recorder = %key, error = %e, "Write failed, closing recorder");
            reason = "write error";
            break;
        }
    }
    drop(subscription);

    session.transition(SessionState::Closing);
    let result = recorder.close().await;
    match result {
        Ok(mut stats) => {
            stats.dropped_frames += dropped;
            session.transition(SessionState::Closed);
            tracing::info!(
                recorder = %key,
                reason = reason,
                bytes = stats.bytes_written,
                video_frames = stats.video_frames,
                audio_frames = stats.audio_frames,
                dropped = stats.dropped_frames,
                segments = stats.segments,
                duration_ms = stats.media_duration().as_millis() as u64,
                "Recording finished"
            );
            Some(stats)
        }
        Err(e) => {
            session.transition(SessionState::Failed);
            tracing::error!(recorder = %key, reason = reason, error = %e, "Recorder close failed");
            None
        }
    }
}

/// Decides which frames reach the recorder and rewrites their timestamps
///
/// Video waits for a keyframe. Audio waits too, but only once a video
/// sequence header shows the stream actually has video. Sequence headers
/// and metadata always pass.
#[derive(Debug)]
pub(crate) struct FrameGate {
    video: bool,
    audio: bool,
    seen_video_header: bool,
    seen_keyframe: bool,
    baseline: u32,
    origin: Option<u32>,
}

impl FrameGate {
    pub(crate) fn new(format: RecordFormat, subscribe: &SubscribePolicy, baseline: u32) -> Self {
        Self {
            video: format.carries_video() && subscribe.sub_video,
            audio: format.carries_audio() && subscribe.sub_audio,
            seen_video_header: false,
            seen_keyframe: false,
            baseline,
            origin: None,
        }
    }

    /// Wait for the next keyframe again (after frames were lost)
    pub(crate) fn resync(&mut self) {
        if self.seen_keyframe {
            tracing::debug!("Frames lost, waiting for next keyframe");
        }
        self.seen_keyframe = false;
    }

    pub(crate) fn admit(&mut self, frame: MediaFrame) -> Option<MediaFrame> {
        match frame.frame_type {
            FrameType::Metadata => {}
            FrameType::Video => {
                if !self.video {
                    return None;
                }
                if frame.is_header {
                    self.seen_video_header = true;
                } else if !self.seen_keyframe {
                    if !frame.is_keyframe {
                        return None;
                    }
                    self.seen_keyframe = true;
                }
            }
            FrameType::Audio => {
                if !self.audio {
                    return None;
                }
                let waiting_for_video = self.video && self.seen_video_header && !self.seen_keyframe;
                if !frame.is_header && waiting_for_video {
                    return None;
                }
            }
        }

        let timestamp = self.normalize(&frame);
        Some(frame.with_timestamp(timestamp))
    }

    fn normalize(&mut self, frame: &MediaFrame) -> u32 {
        if frame.is_header || frame.frame_type == FrameType::Metadata {
            return match self.origin {
                Some(origin) => self.baseline.saturating_add(frame.timestamp.saturating_sub(origin)),
                None => self.baseline,
            };
        }
        let origin = *self.origin.get_or_insert(frame.timestamp);
        self.baseline
            .saturating_add(frame.timestamp.saturating_sub(origin))
    }
}
