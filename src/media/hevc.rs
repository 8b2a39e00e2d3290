//! H.265/HEVC decoder configuration
//!
//! HEVCDecoderConfigurationRecord (`hvcC`):
//! ```text
//! version (1) | profile_space/tier/profile_idc (1) | compat flags (4)
//! | constraint flags (6) | level_idc (1) | ... (8)
//! | ... lengthSizeMinusOne (1, lower 2 bits) | numOfArrays (1)
//! | { type (1, lower 6 bits) | numNalus (2) | { len (2) | nalu }* }*
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use super::h264::START_CODE;
use crate::error::MediaError;

const FIXED_HEADER_LEN: usize = 23;

/// HEVC NAL unit types we care about
pub mod nal {
    pub const VPS: u8 = 32;
    pub const SPS: u8 = 33;
    pub const PPS: u8 = 34;
    pub const AUD: u8 = 35;

    pub fn is_parameter_set(nal_type: u8) -> bool {
        matches!(nal_type, VPS | SPS | PPS)
    }
}

/// NAL unit type from the first header byte
pub fn nal_type(header: u8) -> u8 {
    (header >> 1) & 0x3F
}

/// HEVC decoder configuration
#[derive(Debug, Clone)]
pub struct HevcConfig {
    pub general_profile_idc: u8,
    pub general_level_idc: u8,
    pub nalu_length_size: u8,
    /// VPS, SPS and PPS in record order
    pub parameter_sets: Vec<Bytes>,
    /// Raw record, copied verbatim into `hvcC`
    pub raw: Bytes,
}

impl HevcConfig {
    pub fn parse(raw: Bytes) -> Result<Self, MediaError> {
        if raw.len() < FIXED_HEADER_LEN || raw[0] != 1 {
            return Err(MediaError::InvalidHevcPacket);
        }

        let general_profile_idc = raw[1] & 0x1F;
        let general_level_idc = raw[12];
        let nalu_length_size = (raw[21] & 0x03) + 1;
        let num_arrays = raw[22] as usize;

        let mut parameter_sets = Vec::new();
        let mut pos = FIXED_HEADER_LEN;
        for _ in 0..num_arrays {
            if pos + 3 > raw.len() {
                return Err(MediaError::InvalidHevcPacket);
            }
            let count = u16::from_be_bytes([raw[pos + 1], raw[pos + 2]]) as usize;
            pos += 3;
            for _ in 0..count {
                if pos + 2 > raw.len() {
                    return Err(MediaError::InvalidHevcPacket);
                }
                let len = u16::from_be_bytes([raw[pos], raw[pos + 1]]) as usize;
                pos += 2;
                if pos + len > raw.len() {
                    return Err(MediaError::InvalidHevcPacket);
                }
                parameter_sets.push(raw.slice(pos..pos + len));
                pos += len;
            }
        }

        Ok(HevcConfig {
            general_profile_idc,
            general_level_idc,
            nalu_length_size,
            parameter_sets,
            raw,
        })
    }

    /// Write every parameter set behind a start code
    pub fn write_parameter_sets(&self, out: &mut BytesMut) {
        for ps in &self.parameter_sets {
            out.put_slice(&START_CODE);
            out.put_slice(ps);
        }
    }
}
