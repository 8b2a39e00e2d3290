//! Supported container formats

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::recovery::{self, RecoverFn};

/// Container format a stream can be recorded into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordFormat {
    /// Flash Video tags
    Flv,
    /// Progressive MP4 (moov written at close)
    Mp4,
    /// Fragmented MP4 (moof/mdat pairs)
    Fmp4,
    /// HLS playlist with MPEG-TS segments
    Hls,
    /// Raw video elementary stream (Annex-B)
    Raw,
    /// Raw audio elementary stream (ADTS / G.711 / MP3)
    RawAudio,
}

impl RecordFormat {
    /// Every format, in dispatch order
    pub const ALL: [RecordFormat; 6] = [
        RecordFormat::Flv,
        RecordFormat::Mp4,
        RecordFormat::Fmp4,
        RecordFormat::Hls,
        RecordFormat::Raw,
        RecordFormat::RawAudio,
    ];

    /// Configuration tag for this format
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordFormat::Flv => "flv",
            RecordFormat::Mp4 => "mp4",
            RecordFormat::Fmp4 => "fmp4",
            RecordFormat::Hls => "hls",
            RecordFormat::Raw => "raw",
            RecordFormat::RawAudio => "raw_audio",
        }
    }

    /// Whether the format rolls over into fragments/segments
    pub fn is_segmented(&self) -> bool {
        matches!(self, RecordFormat::Fmp4 | RecordFormat::Hls)
    }

    /// Whether the container carries video
    pub fn carries_video(&self) -> bool {
        !matches!(self, RecordFormat::RawAudio)
    }

    /// Whether the container carries audio
    pub fn carries_audio(&self) -> bool {
        !matches!(self, RecordFormat::Raw)
    }

    /// Tail-inspection strategy used to resume an existing file
    ///
    /// Raw elementary streams carry no timestamps and have none.
    pub fn recovery(&self) -> Option<RecoverFn> {
        match self {
            RecordFormat::Flv => Some(recovery::flv::recover_last_timestamp),
            RecordFormat::Mp4 | RecordFormat::Fmp4 => Some(recovery::mp4::recover_last_timestamp),
            RecordFormat::Hls => Some(recovery::hls::recover_last_timestamp),
            RecordFormat::Raw | RecordFormat::RawAudio => None,
        }
    }
}

impl std::fmt::Display for RecordFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "flv" => Ok(RecordFormat::Flv),
            "mp4" => Ok(RecordFormat::Mp4),
            "fmp4" => Ok(RecordFormat::Fmp4),
            "hls" => Ok(RecordFormat::Hls),
            "raw" => Ok(RecordFormat::Raw),
            "raw_audio" => Ok(RecordFormat::RawAudio),
            _ => Err(ConfigError::UnknownFormat(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_parse_back() {
        for format in RecordFormat::ALL {
            assert_eq!(format.as_str().parse::<RecordFormat>().unwrap(), format);
        }
        assert_eq!("HLS".parse::<RecordFormat>().unwrap(), RecordFormat::Hls);
        assert!(matches!(
            "webm".parse::<RecordFormat>(),
            Err(ConfigError::UnknownFormat(_))
        ));
    }

    #[test]
    fn test_recovery_availability() {
        assert!(RecordFormat::Flv.recovery().is_some());
        assert!(RecordFormat::Hls.recovery().is_some());
        assert!(RecordFormat::Raw.recovery().is_none());
        assert!(RecordFormat::RawAudio.recovery().is_none());
    }

    #[test]
    fn test_track_capabilities() {
        assert!(!RecordFormat::Raw.carries_audio());
        assert!(!RecordFormat::RawAudio.carries_video());
        assert!(RecordFormat::Flv.carries_audio() && RecordFormat::Flv.carries_video());
        assert!(RecordFormat::Hls.is_segmented());
        assert!(!RecordFormat::Mp4.is_segmented());
    }
}
