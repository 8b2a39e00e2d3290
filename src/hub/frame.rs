//! Frames fanned out to subscribers
//!
//! Cheap to clone: the payload is a reference-counted `Bytes`.

use bytes::Bytes;

use crate::media::flv::{FlvTag, FlvTagType};

/// Kind of frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Video,
    Audio,
    /// Script data (onMetaData)
    Metadata,
}

/// One demuxed unit of a live stream, carried as an FLV tag body
#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub frame_type: FrameType,
    /// Timestamp in milliseconds
    pub timestamp: u32,
    pub data: Bytes,
    /// Video keyframe
    pub is_keyframe: bool,
    /// Decoder configuration (AVC/HEVC record or AudioSpecificConfig)
    pub is_header: bool,
}

impl MediaFrame {
    pub fn video(timestamp: u32, data: Bytes, is_keyframe: bool, is_header: bool) -> Self {
        Self {
            frame_type: FrameType::Video,
            timestamp,
            data,
            is_keyframe,
            is_header,
        }
    }

    pub fn audio(timestamp: u32, data: Bytes, is_header: bool) -> Self {
        Self {
            frame_type: FrameType::Audio,
            timestamp,
            data,
            is_keyframe: false,
            is_header,
        }
    }

    pub fn metadata(data: Bytes) -> Self {
        Self {
            frame_type: FrameType::Metadata,
            timestamp: 0,
            data,
            is_keyframe: false,
            is_header: false,
        }
    }

    /// Classify an FLV tag
    pub fn from_flv_tag(tag: &FlvTag) -> Self {
        match tag.tag_type {
            FlvTagType::Video => Self::video(
                tag.timestamp,
                tag.data.clone(),
                tag.is_keyframe(),
                tag.is_sequence_header(),
            ),
            FlvTagType::Audio => Self::audio(tag.timestamp, tag.data.clone(), tag.is_sequence_header()),
            FlvTagType::Script => Self::metadata(tag.data.clone()),
        }
    }

    pub fn is_video(&self) -> bool {
        self.frame_type == FrameType::Video
    }

    pub fn is_audio(&self) -> bool {
        self.frame_type == FrameType::Audio
    }

    /// Same frame at another timestamp
    pub fn with_timestamp(mut self, timestamp: u32) -> Self {
        self.timestamp = timestamp;
        self
    }
}
