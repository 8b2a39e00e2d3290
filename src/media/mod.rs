//! Media handling
//!
//! This module provides:
//! - FLV tag model, writer and header reader
//! - AMF0 `onMetaData` handling
//! - H.264/AVC and H.265/HEVC decoder configuration and Annex-B conversion
//! - AAC AudioSpecificConfig and ADTS framing
//! - ISO-BMFF box writer/reader, MPEG-TS muxer and HLS playlists

pub mod aac;
pub mod flv;
pub mod h264;
pub mod hevc;
pub mod m3u8;
pub mod metadata;
pub mod mp4;
pub mod packet;
pub mod ts;

pub use aac::AudioSpecificConfig;
pub use flv::{AudioFormat, FlvTag, FlvTagType, VideoCodec};
pub use metadata::StreamMetadata;
pub use packet::{AudioPacket, VideoConfig, VideoPacket};
