//! AAC configuration and ADTS framing
//!
//! Publishers send AAC as raw access units. The decoder configuration
//! (AudioSpecificConfig) arrives once in a sequence header; MP4 stores it
//! verbatim in `esds`, while elementary-stream and MPEG-TS outputs need an
//! ADTS header in front of every frame.
//!
//! AAC audio tag body:
//! ```text
//! +-------------+----------+----------+----------+---------+
//! | SoundFormat | SoundRate| SoundSize| SoundType| AACType | AACData
//! | (4 bits)    | (2 bits) | (1 bit)  | (1 bit)  | (1 byte)|
//! +-------------+----------+----------+----------+---------+
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::MediaError;

/// ADTS header length without CRC
pub const ADTS_HEADER_LEN: usize = 7;

const SAMPLING_FREQUENCIES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// AudioSpecificConfig (from sequence header)
#[derive(Debug, Clone)]
pub struct AudioSpecificConfig {
    /// Audio object type (2 = AAC LC)
    pub audio_object_type: u8,
    pub sampling_frequency_index: u8,
    /// Sampling frequency in Hz
    pub sampling_frequency: u32,
    /// Channel configuration (1=mono, 2=stereo, etc.)
    pub channel_configuration: u8,
    /// 960-sample frames instead of 1024
    pub frame_length_flag: bool,
    /// Raw config bytes, copied into `esds`
    pub raw: Bytes,
}

impl AudioSpecificConfig {
    /// Parse the bit-packed AudioSpecificConfig
    ///
    /// ```text
    /// audioObjectType (5) | samplingFrequencyIndex (4) | [samplingFrequency (24)]
    /// | channelConfiguration (4) | frameLengthFlag (1) | ...
    /// ```
    pub fn parse(raw: Bytes) -> Result<Self, MediaError> {
        if raw.len() < 2 {
            return Err(MediaError::InvalidAacPacket);
        }

        let audio_object_type = raw[0] >> 3;
        let sampling_frequency_index = ((raw[0] & 0x07) << 1) | (raw[1] >> 7);

        let (sampling_frequency, tail) = if sampling_frequency_index == 0x0F {
            if raw.len() < 5 {
                return Err(MediaError::InvalidAacPacket);
            }
            let freq = ((raw[1] as u32 & 0x7F) << 17)
                | ((raw[2] as u32) << 9)
                | ((raw[3] as u32) << 1)
                | (raw[4] as u32 >> 7);
            // channel config follows the explicit frequency, 7 bits into byte 4
            (freq, ((raw[4] as u16) << 8) | raw.get(5).copied().unwrap_or(0) as u16)
        } else {
            let freq = *SAMPLING_FREQUENCIES
                .get(sampling_frequency_index as usize)
                .ok_or(MediaError::InvalidAacPacket)?;
            (freq, ((raw[1] as u16) << 8) | raw.get(2).copied().unwrap_or(0) as u16)
        };

        // `tail` holds the 16 bits whose top bit is the last frequency bit
        let channel_configuration = ((tail >> 11) & 0x0F) as u8;
        let frame_length_flag = (tail >> 10) & 0x01 == 1;

        Ok(AudioSpecificConfig {
            audio_object_type,
            sampling_frequency_index,
            sampling_frequency,
            channel_configuration,
            frame_length_flag,
            raw,
        })
    }

    pub fn channels(&self) -> u8 {
        match self.channel_configuration {
            7 => 8,
            c if c <= 6 => c,
            _ => 0,
        }
    }

    /// ADTS header for a raw frame of `payload_len` bytes
    pub fn adts_header(&self, payload_len: usize) -> [u8; ADTS_HEADER_LEN] {
        // ADTS carries profile as object type - 1
        let profile = self.audio_object_type.saturating_sub(1) & 0x03;
        let freq_idx = self.sampling_frequency_index & 0x0F;
        let channels = self.channel_configuration & 0x07;
        let frame_len = (payload_len + ADTS_HEADER_LEN) & 0x1FFF;

        [
            0xFF,
            0xF1, // MPEG-4, layer 0, no CRC
            (profile << 6) | (freq_idx << 2) | (channels >> 2),
            ((channels & 0x03) << 6) | (frame_len >> 11) as u8,
            (frame_len >> 3) as u8,
            (((frame_len & 0x07) << 5) | 0x1F) as u8,
            0xFC,
        ]
    }

    /// Append `payload` to `out` behind its ADTS header
    pub fn write_adts(&self, payload: &[u8], out: &mut BytesMut) {
        out.reserve(ADTS_HEADER_LEN + payload.len());
        out.put_slice(&self.adts_header(payload.len()));
        out.put_slice(payload);
    }
}
