//! H.264/AVC parsing
//!
//! Publishers deliver H.264 in AVCC format (length-prefixed NAL units) with
//! the decoder configuration sent once as a sequence header.
//!
//! AVCDecoderConfigurationRecord (sequence header):
//! ```text
//! configurationVersion (1) | AVCProfileIndication (1) | profile_compatibility (1)
//! | AVCLevelIndication (1) | lengthSizeMinusOne (1, lower 2 bits)
//! | numOfSPS (1, lower 5 bits) | { spsLength (2) | spsNALUnit }*
//! | numOfPPS (1) | { ppsLength (2) | ppsNALUnit }*
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::MediaError;

/// Annex-B start code written before every NAL unit
pub const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// NAL unit type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NaluType {
    /// Non-IDR slice
    Slice,
    /// IDR slice (keyframe)
    Idr,
    /// Supplemental enhancement information
    Sei,
    /// Sequence parameter set
    Sps,
    /// Picture parameter set
    Pps,
    /// Access unit delimiter
    Aud,
    Other(u8),
}

impl NaluType {
    pub fn from_byte(b: u8) -> Self {
        match b & 0x1F {
            1 => NaluType::Slice,
            5 => NaluType::Idr,
            6 => NaluType::Sei,
            7 => NaluType::Sps,
            8 => NaluType::Pps,
            9 => NaluType::Aud,
            other => NaluType::Other(other),
        }
    }

    pub fn is_parameter_set(&self) -> bool {
        matches!(self, NaluType::Sps | NaluType::Pps)
    }
}

/// AVC decoder configuration (from sequence header)
#[derive(Debug, Clone)]
pub struct AvcConfig {
    /// AVC profile (66=Baseline, 77=Main, 100=High, etc.)
    pub profile: u8,
    /// Profile compatibility flags
    pub compatibility: u8,
    /// AVC level (e.g., 31 = 3.1)
    pub level: u8,
    /// NALU length size in bytes (usually 4)
    pub nalu_length_size: u8,
    pub sps: Vec<Bytes>,
    pub pps: Vec<Bytes>,
    /// Raw AVCDecoderConfigurationRecord bytes, copied verbatim into `avcC`
    pub raw: Bytes,
}

impl AvcConfig {
    /// Parse an AVCDecoderConfigurationRecord
    pub fn parse(raw: Bytes) -> Result<Self, MediaError> {
        if raw.len() < 7 || raw[0] != 1 {
            return Err(MediaError::InvalidAvcPacket);
        }

        let mut data = raw.clone();
        data.advance(1);
        let profile = data.get_u8();
        let compatibility = data.get_u8();
        let level = data.get_u8();
        let nalu_length_size = (data.get_u8() & 0x03) + 1;

        let num_sps = (data.get_u8() & 0x1F) as usize;
        let sps = read_parameter_sets(&mut data, num_sps)?;

        if !data.has_remaining() {
            return Err(MediaError::InvalidAvcPacket);
        }
        let num_pps = data.get_u8() as usize;
        let pps = read_parameter_sets(&mut data, num_pps)?;

        Ok(AvcConfig {
            profile,
            compatibility,
            level,
            nalu_length_size,
            sps,
            pps,
            raw,
        })
    }

    /// Write SPS then PPS, each behind a start code
    pub fn write_parameter_sets(&self, out: &mut BytesMut) {
        for ps in self.sps.iter().chain(self.pps.iter()) {
            out.put_slice(&START_CODE);
            out.put_slice(ps);
        }
    }
}

fn read_parameter_sets(data: &mut Bytes, count: usize) -> Result<Vec<Bytes>, MediaError> {
    let mut sets = Vec::with_capacity(count);
    for _ in 0..count {
        if data.remaining() < 2 {
            return Err(MediaError::InvalidAvcPacket);
        }
        let len = data.get_u16() as usize;
        if data.remaining() < len {
            return Err(MediaError::InvalidAvcPacket);
        }
        sets.push(data.copy_to_bytes(len));
    }
    Ok(sets)
}

/// Iterator over NAL units in AVCC format
pub struct NaluIterator<'a> {
    data: &'a [u8],
    offset: usize,
    nalu_length_size: usize,
}

impl<'a> NaluIterator<'a> {
    pub fn new(data: &'a [u8], nalu_length_size: u8) -> Self {
        Self {
            data,
            offset: 0,
            nalu_length_size: nalu_length_size as usize,
        }
    }
}

impl<'a> Iterator for NaluIterator<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.nalu_length_size == 0 || self.offset + self.nalu_length_size > self.data.len() {
            return None;
        }

        let len = self.data[self.offset..self.offset + self.nalu_length_size]
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | *b as usize);
        self.offset += self.nalu_length_size;

        if self.offset + len > self.data.len() {
            return None;
        }

        let nalu = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Some(nalu)
    }
}

/// Copy length-prefixed NAL units to `out` with start codes.
///
/// `keep` decides per NAL unit whether it is emitted; in-band parameter sets
/// are usually dropped because the writer re-inserts them before keyframes.
pub fn avcc_to_annexb<F>(data: &[u8], nalu_length_size: u8, out: &mut BytesMut, mut keep: F)
where
    F: FnMut(&[u8]) -> bool,
{
    for nalu in NaluIterator::new(data, nalu_length_size) {
        if nalu.is_empty() || !keep(nalu) {
            continue;
        }
        out.put_slice(&START_CODE);
        out.put_slice(nalu);
    }
}
