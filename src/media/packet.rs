//! Codec-level view of FLV audio/video tag bodies

use bytes::{BufMut, Bytes, BytesMut};

use super::flv::{AudioFormat, VideoCodec, VideoFrameType};
use super::h264::{self, AvcConfig, NaluType};
use super::hevc::{self, HevcConfig};
use crate::error::MediaError;

/// Video tag body split into its codec parts
#[derive(Debug, Clone)]
pub enum VideoPacket {
    /// Decoder configuration record (avcC / hvcC payload)
    SequenceHeader { codec: VideoCodec, record: Bytes },
    /// Length-prefixed NAL units
    Frame {
        codec: VideoCodec,
        keyframe: bool,
        composition_time: i32,
        data: Bytes,
    },
    EndOfSequence,
}

impl VideoPacket {
    pub fn parse(body: &Bytes) -> Result<Self, MediaError> {
        let first = *body.first().ok_or(MediaError::InvalidAvcPacket)?;
        let codec = VideoCodec::from_byte(first)
            .ok_or_else(|| MediaError::UnsupportedCodec(format!("video codec id {}", first & 0x0F)))?;
        if !codec.has_avc_layout() {
            return Err(MediaError::UnsupportedCodec(format!("{:?}", codec)));
        }
        let invalid = match codec {
            VideoCodec::Hevc => MediaError::InvalidHevcPacket,
            _ => MediaError::InvalidAvcPacket,
        };
        if body.len() < 5 {
            return Err(invalid);
        }

        let raw_cts = ((body[2] as i32) << 16) | ((body[3] as i32) << 8) | body[4] as i32;
        let composition_time = if raw_cts & 0x80_0000 != 0 {
            raw_cts | !0xFF_FFFF
        } else {
            raw_cts
        };

        match body[1] {
            0 => Ok(VideoPacket::SequenceHeader {
                codec,
                record: body.slice(5..),
            }),
            1 => Ok(VideoPacket::Frame {
                codec,
                keyframe: VideoFrameType::from_byte(first)
                    .map(|ft| ft.is_keyframe())
                    .unwrap_or(false),
                composition_time,
                data: body.slice(5..),
            }),
            2 => Ok(VideoPacket::EndOfSequence),
            _ => Err(invalid),
        }
    }
}

/// Parsed video decoder configuration
#[derive(Debug, Clone)]
pub enum VideoConfig {
    Avc(AvcConfig),
    Hevc(HevcConfig),
}

impl VideoConfig {
    pub fn parse(codec: VideoCodec, record: Bytes) -> Result<Self, MediaError> {
        match codec {
            VideoCodec::Avc => AvcConfig::parse(record).map(VideoConfig::Avc),
            VideoCodec::Hevc => HevcConfig::parse(record).map(VideoConfig::Hevc),
            other => Err(MediaError::UnsupportedCodec(format!("{:?}", other))),
        }
    }

    pub fn codec(&self) -> VideoCodec {
        match self {
            VideoConfig::Avc(_) => VideoCodec::Avc,
            VideoConfig::Hevc(_) => VideoCodec::Hevc,
        }
    }

    pub fn nalu_length_size(&self) -> u8 {
        match self {
            VideoConfig::Avc(c) => c.nalu_length_size,
            VideoConfig::Hevc(c) => c.nalu_length_size,
        }
    }

    /// Decoder configuration record as received
    pub fn record(&self) -> &Bytes {
        match self {
            VideoConfig::Avc(c) => &c.raw,
            VideoConfig::Hevc(c) => &c.raw,
        }
    }

    /// File extension of the Annex-B elementary stream
    pub fn elementary_ext(&self) -> &'static str {
        match self {
            VideoConfig::Avc(_) => ".h264",
            VideoConfig::Hevc(_) => ".h265",
        }
    }

    fn is_parameter_set(&self, nalu: &[u8]) -> bool {
        match self {
            VideoConfig::Avc(_) => NaluType::from_byte(nalu[0]).is_parameter_set(),
            VideoConfig::Hevc(_) => hevc::nal::is_parameter_set(hevc::nal_type(nalu[0])),
        }
    }

    fn is_delimiter(&self, nalu: &[u8]) -> bool {
        match self {
            VideoConfig::Avc(_) => NaluType::from_byte(nalu[0]) == NaluType::Aud,
            VideoConfig::Hevc(_) => hevc::nal_type(nalu[0]) == hevc::nal::AUD,
        }
    }

    /// Convert one access unit to Annex-B.
    ///
    /// Keyframes are preceded by the configured parameter sets; in-band
    /// parameter sets and delimiters are dropped. An access unit delimiter
    /// is written first when `with_aud` is set (required by MPEG-TS).
    pub fn write_annexb(&self, data: &[u8], keyframe: bool, with_aud: bool, out: &mut BytesMut) {
        if with_aud {
            match self {
                VideoConfig::Avc(_) => out.put_slice(&[0, 0, 0, 1, 0x09, 0xF0]),
                VideoConfig::Hevc(_) => out.put_slice(&[0, 0, 0, 1, 0x46, 0x01, 0x50]),
            }
        }
        if keyframe {
            match self {
                VideoConfig::Avc(c) => c.write_parameter_sets(out),
                VideoConfig::Hevc(c) => c.write_parameter_sets(out),
            }
        }
        h264::avcc_to_annexb(data, self.nalu_length_size(), out, |nalu| {
            !self.is_parameter_set(nalu) && !self.is_delimiter(nalu)
        });
    }
}

/// Audio tag body split into its codec parts
#[derive(Debug, Clone)]
pub enum AudioPacket {
    /// AAC AudioSpecificConfig
    AacConfig(Bytes),
    /// Raw AAC access unit
    Aac(Bytes),
    /// Any other codec: payload after the format byte
    Other { format: AudioFormat, data: Bytes },
}

impl AudioPacket {
    pub fn parse(body: &Bytes) -> Result<Self, MediaError> {
        let first = *body.first().ok_or(MediaError::InvalidAacPacket)?;
        let format = AudioFormat::from_byte(first)
            .ok_or_else(|| MediaError::UnsupportedCodec(format!("audio format {}", first >> 4)))?;

        if format != AudioFormat::Aac {
            return Ok(AudioPacket::Other {
                format,
                data: body.slice(1..),
            });
        }
        match body.get(1) {
            Some(0) => Ok(AudioPacket::AacConfig(body.slice(2..))),
            Some(1) => Ok(AudioPacket::Aac(body.slice(2..))),
            _ => Err(MediaError::InvalidAacPacket),
        }
    }
}

/// Elementary-stream extension for an audio codec, if it can be stored raw
pub fn audio_elementary_ext(format: AudioFormat) -> Option<&'static str> {
    match format {
        AudioFormat::Aac => Some(".aac"),
        AudioFormat::G711ALaw => Some(".pcma"),
        AudioFormat::G711MuLaw => Some(".pcmu"),
        AudioFormat::Mp3 | AudioFormat::Mp38k => Some(".mp3"),
        _ => None,
    }
}
