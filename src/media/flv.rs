//! FLV tag model, writer and header reader
//!
//! Frames travel through the hub as FLV tag bodies (the same payload an RTMP
//! audio/video message carries). This module knows how to classify those
//! bodies and how to lay them out on disk.
//!
//! FLV file layout:
//! ```text
//! +============+==================+==============+==================+
//! | FLV Header | PrevTagSize0 (0) | Tag 1        | PrevTagSize1 ... |
//! | (9 bytes)  | (4 bytes)        | (11+N bytes) | (4 bytes)        |
//! +============+==================+==============+==================+
//! ```
//!
//! Tag header:
//! ```text
//! +------+----------+-----------+-------+----------+------+
//! | Type | DataSize | Timestamp | TSExt | StreamID | Data |
//! | 1B   | 3B BE    | 3B BE     | 1B    | 3B (=0)  | N B  |
//! +------+----------+-----------+-------+----------+------+
//! ```

use bytes::{BufMut, Bytes, BytesMut};

/// FLV file header length ("FLV" + version + flags + header size)
pub const FILE_HEADER_LEN: usize = 9;

/// Tag header length
pub const TAG_HEADER_LEN: usize = 11;

/// PreviousTagSize field length
pub const PREV_TAG_SIZE_LEN: usize = 4;

const SIGNATURE: [u8; 3] = *b"FLV";
const VERSION: u8 = 0x01;
const FLAG_AUDIO: u8 = 0x04;
const FLAG_VIDEO: u8 = 0x01;

/// FLV tag type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlvTagType {
    Audio,
    Video,
    Script,
}

impl FlvTagType {
    /// Tag type code as stored in the file
    pub fn to_byte(self) -> u8 {
        match self {
            FlvTagType::Audio => 8,
            FlvTagType::Video => 9,
            FlvTagType::Script => 18,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        // Upper bits carry the filter/reserved flags
        match b & 0x1F {
            8 => Some(FlvTagType::Audio),
            9 => Some(FlvTagType::Video),
            18 => Some(FlvTagType::Script),
            _ => None,
        }
    }
}

/// Video frame type (upper 4 bits of first byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoFrameType {
    Keyframe = 1,
    InterFrame = 2,
    DisposableInterFrame = 3,
    GeneratedKeyframe = 4,
    VideoInfoFrame = 5,
}

impl VideoFrameType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match (b >> 4) & 0x0F {
            1 => Some(VideoFrameType::Keyframe),
            2 => Some(VideoFrameType::InterFrame),
            3 => Some(VideoFrameType::DisposableInterFrame),
            4 => Some(VideoFrameType::GeneratedKeyframe),
            5 => Some(VideoFrameType::VideoInfoFrame),
            _ => None,
        }
    }

    pub fn is_keyframe(&self) -> bool {
        matches!(
            self,
            VideoFrameType::Keyframe | VideoFrameType::GeneratedKeyframe
        )
    }
}

/// Video codec ID (lower 4 bits of first byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    SorensonH263 = 2,
    ScreenVideo = 3,
    Vp6 = 4,
    Vp6Alpha = 5,
    ScreenVideoV2 = 6,
    /// AVC (H.264)
    Avc = 7,
    /// HEVC (H.265), legacy codec id used by most servers
    Hevc = 12,
    /// AV1
    Av1 = 13,
}

impl VideoCodec {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b & 0x0F {
            2 => Some(VideoCodec::SorensonH263),
            3 => Some(VideoCodec::ScreenVideo),
            4 => Some(VideoCodec::Vp6),
            5 => Some(VideoCodec::Vp6Alpha),
            6 => Some(VideoCodec::ScreenVideoV2),
            7 => Some(VideoCodec::Avc),
            12 => Some(VideoCodec::Hevc),
            13 => Some(VideoCodec::Av1),
            _ => None,
        }
    }

    /// Codec id written into onMetaData
    pub fn id(self) -> u8 {
        self as u8
    }

    /// Whether the codec uses the AVC-style packet layout
    /// (packet type byte + 24-bit composition time)
    pub fn has_avc_layout(self) -> bool {
        matches!(self, VideoCodec::Avc | VideoCodec::Hevc)
    }
}

/// Audio format (upper 4 bits of first byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    LinearPcmPlatform = 0,
    Adpcm = 1,
    Mp3 = 2,
    LinearPcmLe = 3,
    Nellymoser16kMono = 4,
    Nellymoser8kMono = 5,
    Nellymoser = 6,
    /// G.711 A-law
    G711ALaw = 7,
    /// G.711 mu-law
    G711MuLaw = 8,
    Aac = 10,
    Speex = 11,
    Mp38k = 14,
    DeviceSpecific = 15,
}

impl AudioFormat {
    pub fn from_byte(b: u8) -> Option<Self> {
        match (b >> 4) & 0x0F {
            0 => Some(AudioFormat::LinearPcmPlatform),
            1 => Some(AudioFormat::Adpcm),
            2 => Some(AudioFormat::Mp3),
            3 => Some(AudioFormat::LinearPcmLe),
            4 => Some(AudioFormat::Nellymoser16kMono),
            5 => Some(AudioFormat::Nellymoser8kMono),
            6 => Some(AudioFormat::Nellymoser),
            7 => Some(AudioFormat::G711ALaw),
            8 => Some(AudioFormat::G711MuLaw),
            10 => Some(AudioFormat::Aac),
            11 => Some(AudioFormat::Speex),
            14 => Some(AudioFormat::Mp38k),
            15 => Some(AudioFormat::DeviceSpecific),
            _ => None,
        }
    }

    /// Codec id written into onMetaData
    pub fn id(self) -> u8 {
        self as u8
    }
}

/// FLV tag: type, timestamp and body
#[derive(Debug, Clone)]
pub struct FlvTag {
    pub tag_type: FlvTagType,
    /// Timestamp in milliseconds
    pub timestamp: u32,
    /// Tag body (codec header byte(s) + payload)
    pub data: Bytes,
}

impl FlvTag {
    pub fn video(timestamp: u32, data: Bytes) -> Self {
        Self {
            tag_type: FlvTagType::Video,
            timestamp,
            data,
        }
    }

    pub fn audio(timestamp: u32, data: Bytes) -> Self {
        Self {
            tag_type: FlvTagType::Audio,
            timestamp,
            data,
        }
    }

    pub fn script(data: Bytes) -> Self {
        Self {
            tag_type: FlvTagType::Script,
            timestamp: 0,
            data,
        }
    }

    pub fn is_video(&self) -> bool {
        self.tag_type == FlvTagType::Video
    }

    pub fn is_audio(&self) -> bool {
        self.tag_type == FlvTagType::Audio
    }

    pub fn video_frame_type(&self) -> Option<VideoFrameType> {
        if self.is_video() && !self.data.is_empty() {
            VideoFrameType::from_byte(self.data[0])
        } else {
            None
        }
    }

    pub fn video_codec(&self) -> Option<VideoCodec> {
        if self.is_video() && !self.data.is_empty() {
            VideoCodec::from_byte(self.data[0])
        } else {
            None
        }
    }

    pub fn audio_format(&self) -> Option<AudioFormat> {
        if self.is_audio() && !self.data.is_empty() {
            AudioFormat::from_byte(self.data[0])
        } else {
            None
        }
    }

    pub fn is_keyframe(&self) -> bool {
        self.video_frame_type()
            .map(|ft| ft.is_keyframe())
            .unwrap_or(false)
    }

    /// Decoder configuration for AVC/HEVC video or AAC audio
    pub fn is_sequence_header(&self) -> bool {
        if self.data.len() < 2 {
            return false;
        }
        match self.tag_type {
            FlvTagType::Video => self
                .video_codec()
                .map(|c| c.has_avc_layout() && self.data[1] == 0)
                .unwrap_or(false),
            FlvTagType::Audio => self.audio_format() == Some(AudioFormat::Aac) && self.data[1] == 0,
            FlvTagType::Script => false,
        }
    }
}

/// Parsed 11-byte tag header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlvTagHeader {
    pub tag_type: FlvTagType,
    pub data_size: u32,
    pub timestamp: u32,
}

impl FlvTagHeader {
    /// Parse a tag header; `None` on an unknown tag type
    pub fn parse(buf: &[u8; TAG_HEADER_LEN]) -> Option<Self> {
        let tag_type = FlvTagType::from_byte(buf[0])?;
        let data_size = u32::from_be_bytes([0, buf[1], buf[2], buf[3]]);
        let timestamp = u32::from_be_bytes([buf[7], buf[4], buf[5], buf[6]]);
        Some(Self {
            tag_type,
            data_size,
            timestamp,
        })
    }
}

/// FLV file header followed by PreviousTagSize0
pub fn file_header(has_audio: bool, has_video: bool) -> [u8; FILE_HEADER_LEN + PREV_TAG_SIZE_LEN] {
    let mut flags = 0;
    if has_audio {
        flags |= FLAG_AUDIO;
    }
    if has_video {
        flags |= FLAG_VIDEO;
    }

    let mut out = [0u8; FILE_HEADER_LEN + PREV_TAG_SIZE_LEN];
    out[..3].copy_from_slice(&SIGNATURE);
    out[3] = VERSION;
    out[4] = flags;
    out[5..9].copy_from_slice(&(FILE_HEADER_LEN as u32).to_be_bytes());
    out
}

/// Append a tag (header, body and trailing PreviousTagSize) to `buf`
pub fn encode_tag(buf: &mut BytesMut, tag_type: FlvTagType, timestamp: u32, data: &[u8]) {
    let data_size = data.len() as u32;
    buf.reserve(TAG_HEADER_LEN + data.len() + PREV_TAG_SIZE_LEN);

    buf.put_u8(tag_type.to_byte());
    buf.put_slice(&data_size.to_be_bytes()[1..]);
    // Lower 24 bits first, then the extension byte
    buf.put_slice(&timestamp.to_be_bytes()[1..]);
    buf.put_u8((timestamp >> 24) as u8);
    buf.put_slice(&[0, 0, 0]);
    buf.put_slice(data);
    buf.put_u32(TAG_HEADER_LEN as u32 + data_size);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_byte_decoding() {
        assert_eq!(
            VideoFrameType::from_byte(0x17),
            Some(VideoFrameType::Keyframe)
        );
        assert_eq!(VideoCodec::from_byte(0x17), Some(VideoCodec::Avc));
        assert_eq!(
            VideoFrameType::from_byte(0x2C),
            Some(VideoFrameType::InterFrame)
        );
        assert_eq!(VideoCodec::from_byte(0x2C), Some(VideoCodec::Hevc));
        assert_eq!(VideoFrameType::from_byte(0x60), None);
        assert_eq!(VideoCodec::from_byte(0x08), None);
    }

    #[test]
    fn test_sequence_headers() {
        let avc = FlvTag::video(0, Bytes::from_static(&[0x17, 0x00, 0, 0, 0]));
        assert!(avc.is_sequence_header());
        assert!(avc.is_keyframe());

        let hevc = FlvTag::video(0, Bytes::from_static(&[0x1C, 0x00, 0, 0, 0]));
        assert!(hevc.is_sequence_header());

        let nalu = FlvTag::video(0, Bytes::from_static(&[0x17, 0x01, 0, 0, 0]));
        assert!(!nalu.is_sequence_header());

        let aac = FlvTag::audio(0, Bytes::from_static(&[0xAF, 0x00, 0x12, 0x10]));
        assert!(aac.is_sequence_header());

        let mp3 = FlvTag::audio(0, Bytes::from_static(&[0x2F, 0x00]));
        assert!(!mp3.is_sequence_header());

        let short = FlvTag::video(0, Bytes::from_static(&[0x17]));
        assert!(!short.is_sequence_header());
    }

    #[test]
    fn test_file_header_flags() {
        let header = file_header(true, true);
        assert_eq!(&header[..3], b"FLV");
        assert_eq!(header[4], 0x05);
        assert_eq!(&header[5..9], &[0, 0, 0, 9]);
        assert_eq!(&header[9..], &[0, 0, 0, 0]);

        assert_eq!(file_header(false, true)[4], 0x01);
        assert_eq!(file_header(true, false)[4], 0x04);
    }

    #[test]
    fn test_encoded_tag_header_parses_back() {
        let mut buf = BytesMut::new();
        let body = [0x17u8, 0x01, 0, 0, 0, 0xAA];
        encode_tag(&mut buf, FlvTagType::Video, 0x0123_4567, &body);

        assert_eq!(buf.len(), TAG_HEADER_LEN + body.len() + PREV_TAG_SIZE_LEN);
        // extended timestamp byte carries the top 8 bits
        assert_eq!(buf[7], 0x01);

        let mut header = [0u8; TAG_HEADER_LEN];
        header.copy_from_slice(&buf[..TAG_HEADER_LEN]);
        let parsed = FlvTagHeader::parse(&header).unwrap();
        assert_eq!(parsed.tag_type, FlvTagType::Video);
        assert_eq!(parsed.data_size, body.len() as u32);
        assert_eq!(parsed.timestamp, 0x0123_4567);

        let tail = &buf[buf.len() - 4..];
        assert_eq!(u32::from_be_bytes([tail[0], tail[1], tail[2], tail[3]]), 17);
    }

    #[test]
    fn test_unknown_tag_type_rejected() {
        let header = [0x07u8, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0];
        assert!(FlvTagHeader::parse(&header).is_none());
    }

    #[test]
    fn test_audio_format_decoding() {
        assert_eq!(AudioFormat::from_byte(0xAF), Some(AudioFormat::Aac));
        assert_eq!(AudioFormat::from_byte(0x70), Some(AudioFormat::G711ALaw));
        assert_eq!(AudioFormat::from_byte(0x82), Some(AudioFormat::G711MuLaw));
        assert_eq!(AudioFormat::from_byte(0x90), None);
    }
}
