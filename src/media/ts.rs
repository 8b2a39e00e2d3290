//! MPEG-TS muxer for HLS segments
//!
//! Emits one PAT/PMT pair at the start of every segment, then PES packets
//! for H.264/H.265 (Annex-B) video and ADTS AAC audio. Timestamps are
//! converted from milliseconds to the 90 kHz system clock.

use bytes::{BufMut, BytesMut};

/// Transport packet size
pub const TS_PACKET_LEN: usize = 188;

const SYNC_BYTE: u8 = 0x47;
const PAT_PID: u16 = 0x0000;
const PMT_PID: u16 = 0x1000;
const VIDEO_PID: u16 = 0x0100;
const AUDIO_PID: u16 = 0x0101;
const PROGRAM_NUMBER: u16 = 1;

const VIDEO_STREAM_ID: u8 = 0xE0;
const AUDIO_STREAM_ID: u8 = 0xC0;

/// Elementary stream types announced in the PMT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    H264 = 0x1B,
    H265 = 0x24,
    AdtsAac = 0x0F,
}

/// CRC-32/MPEG-2 used by PSI sections
pub fn crc32_mpeg2(data: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ 0x04C1_1DB7
            } else {
                crc << 1
            };
        }
    }
    crc
}

fn ms_to_90k(ms: u64) -> u64 {
    (ms * 90) & 0x1_FFFF_FFFF
}

fn put_timestamp(buf: &mut BytesMut, prefix: u8, ts: u64) {
    buf.put_u8((prefix << 4) | ((((ts >> 30) & 0x07) as u8) << 1) | 1);
    buf.put_u16(((((ts >> 15) & 0x7FFF) as u16) << 1) | 1);
    buf.put_u16((((ts & 0x7FFF) as u16) << 1) | 1);
}

/// MPEG-TS muxer state for one output stream
#[derive(Debug)]
pub struct TsMuxer {
    video: Option<StreamType>,
    audio: Option<StreamType>,
    cc_pat: u8,
    cc_pmt: u8,
    cc_video: u8,
    cc_audio: u8,
}

impl TsMuxer {
    pub fn new(video: Option<StreamType>, audio: Option<StreamType>) -> Self {
        Self {
            video,
            audio,
            cc_pat: 0,
            cc_pmt: 0,
            cc_video: 0,
            cc_audio: 0,
        }
    }

    fn pcr_pid(&self) -> u16 {
        if self.video.is_some() {
            VIDEO_PID
        } else {
            AUDIO_PID
        }
    }

    /// PAT followed by PMT
    pub fn write_tables(&mut self, out: &mut BytesMut) {
        let mut pat = BytesMut::new();
        pat.put_u8(0x00); // table id
        pat.put_u16(0xB000 | 13);
        pat.put_u16(1); // transport stream id
        pat.put_u8(0xC1);
        pat.put_u8(0);
        pat.put_u8(0);
        pat.put_u16(PROGRAM_NUMBER);
        pat.put_u16(0xE000 | PMT_PID);
        let crc = crc32_mpeg2(&pat);
        pat.put_u32(crc);
        let mut cc = self.cc_pat;
        write_section(out, PAT_PID, &mut cc, &pat);
        self.cc_pat = cc;

        let streams: Vec<(StreamType, u16)> = self
            .video
            .map(|t| (t, VIDEO_PID))
            .into_iter()
            .chain(self.audio.map(|t| (t, AUDIO_PID)))
            .collect();

        let mut pmt = BytesMut::new();
        pmt.put_u8(0x02);
        pmt.put_u16(0xB000 | (9 + 5 * streams.len() as u16 + 4));
        pmt.put_u16(PROGRAM_NUMBER);
        pmt.put_u8(0xC1);
        pmt.put_u8(0);
        pmt.put_u8(0);
        pmt.put_u16(0xE000 | self.pcr_pid());
        pmt.put_u16(0xF000); // no program descriptors
        for (stream_type, pid) in streams {
            pmt.put_u8(stream_type as u8);
            pmt.put_u16(0xE000 | pid);
            pmt.put_u16(0xF000);
        }
        let crc = crc32_mpeg2(&pmt);
        pmt.put_u32(crc);
        let mut cc = self.cc_pmt;
        write_section(out, PMT_PID, &mut cc, &pmt);
        self.cc_pmt = cc;
    }

    /// One Annex-B access unit
    pub fn write_video(&mut self, out: &mut BytesMut, annexb: &[u8], dts_ms: u64, pts_ms: u64, keyframe: bool) {
        let dts = ms_to_90k(dts_ms);
        let pts = ms_to_90k(pts_ms);

        let mut pes = BytesMut::with_capacity(annexb.len() + 19);
        pes.put_slice(&[0x00, 0x00, 0x01, VIDEO_STREAM_ID]);
        pes.put_u16(0); // unbounded for video
        pes.put_u8(0x80);
        if pts != dts {
            pes.put_u8(0xC0);
            pes.put_u8(10);
            put_timestamp(&mut pes, 0x3, pts);
            put_timestamp(&mut pes, 0x1, dts);
        } else {
            pes.put_u8(0x80);
            pes.put_u8(5);
            put_timestamp(&mut pes, 0x2, pts);
        }
        pes.put_slice(annexb);

        let pcr = (self.pcr_pid() == VIDEO_PID).then_some(dts);
        let mut cc = self.cc_video;
        write_payload(out, VIDEO_PID, &mut cc, &pes, keyframe, pcr);
        self.cc_video = cc;
    }

    /// One or more ADTS frames sharing a timestamp
    pub fn write_audio(&mut self, out: &mut BytesMut, adts: &[u8], pts_ms: u64) {
        let pts = ms_to_90k(pts_ms);

        let mut pes = BytesMut::with_capacity(adts.len() + 14);
        pes.put_slice(&[0x00, 0x00, 0x01, AUDIO_STREAM_ID]);
        let pes_len = 3 + 5 + adts.len();
        pes.put_u16(if pes_len > 0xFFFF { 0 } else { pes_len as u16 });
        pes.put_u8(0x80);
        pes.put_u8(0x80);
        pes.put_u8(5);
        put_timestamp(&mut pes, 0x2, pts);
        pes.put_slice(adts);

        let pcr = (self.pcr_pid() == AUDIO_PID).then_some(pts);
        let mut cc = self.cc_audio;
        write_payload(out, AUDIO_PID, &mut cc, &pes, pcr.is_some(), pcr);
        self.cc_audio = cc;
    }
}

fn write_section(out: &mut BytesMut, pid: u16, cc: &mut u8, section: &[u8]) {
    let mut payload = BytesMut::with_capacity(section.len() + 1);
    payload.put_u8(0); // pointer field
    payload.put_slice(section);

    out.put_u8(SYNC_BYTE);
    out.put_u8(0x40 | ((pid >> 8) as u8 & 0x1F));
    out.put_u8(pid as u8);
    out.put_u8(0x10 | (*cc & 0x0F));
    *cc = (*cc + 1) & 0x0F;
    out.put_slice(&payload);
    out.put_bytes(0xFF, TS_PACKET_LEN - 4 - payload.len());
}

/// Split a PES packet into transport packets, stuffing the last one through
/// its adaptation field
fn write_payload(
    out: &mut BytesMut,
    pid: u16,
    cc: &mut u8,
    payload: &[u8],
    random_access: bool,
    pcr: Option<u64>,
) {
    let mut offset = 0;
    let mut first = true;

    while offset < payload.len() {
        // adaptation field body, without its length byte
        let mut adaptation = BytesMut::new();
        if first && (random_access || pcr.is_some()) {
            let mut flags = 0u8;
            if random_access {
                flags |= 0x40;
            }
            if pcr.is_some() {
                flags |= 0x10;
            }
            adaptation.put_u8(flags);
            if let Some(base) = pcr {
                adaptation.put_u32((base >> 1) as u32);
                adaptation.put_u8((((base & 1) as u8) << 7) | 0x7E);
                adaptation.put_u8(0);
            }
        }

        let mut has_adaptation = !adaptation.is_empty();
        let mut room = TS_PACKET_LEN - 4 - if has_adaptation { 1 + adaptation.len() } else { 0 };
        let remaining = payload.len() - offset;
        if remaining < room {
            let mut stuffing = room - remaining;
            if !has_adaptation {
                has_adaptation = true;
                stuffing -= 1;
                if stuffing > 0 {
                    adaptation.put_u8(0x00);
                    stuffing -= 1;
                }
            }
            adaptation.put_bytes(0xFF, stuffing);
            room = remaining;
        }

        out.put_u8(SYNC_BYTE);
        out.put_u8(if first { 0x40 } else { 0x00 } | ((pid >> 8) as u8 & 0x1F));
        out.put_u8(pid as u8);
        out.put_u8(if has_adaptation { 0x30 } else { 0x10 } | (*cc & 0x0F));
        *cc = (*cc + 1) & 0x0F;
        if has_adaptation {
            out.put_u8(adaptation.len() as u8);
            out.put_slice(&adaptation);
        }
        out.put_slice(&payload[offset..offset + room]);

        offset += room;
        first = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packets(buf: &[u8]) -> Vec<&[u8]> {
        buf.chunks(TS_PACKET_LEN).collect()
    }

    fn pid_of(packet: &[u8]) -> u16 {
        (((packet[1] & 0x1F) as u16) << 8) | packet[2] as u16
    }

    #[test]
    fn test_crc32_check_value() {
        assert_eq!(crc32_mpeg2(b"123456789"), 0x0376_E6E7);
    }

    #[test]
    fn test_tables_have_valid_crc() {
        let mut muxer = TsMuxer::new(Some(StreamType::H264), Some(StreamType::AdtsAac));
        let mut out = BytesMut::new();
        muxer.write_tables(&mut out);

        let pkts = packets(&out);
        assert_eq!(pkts.len(), 2);
        assert_eq!(pid_of(pkts[0]), PAT_PID);
        assert_eq!(pid_of(pkts[1]), PMT_PID);

        for pkt in pkts {
            let section = &pkt[5..];
            let len = (((section[1] & 0x0F) as usize) << 8) | section[2] as usize;
            // CRC over the whole section including its CRC is zero
            assert_eq!(crc32_mpeg2(&section[..3 + len]), 0);
        }
    }

    #[test]
    fn test_video_pes_is_packetized_to_188() {
        let mut muxer = TsMuxer::new(Some(StreamType::H264), None);
        let mut out = BytesMut::new();
        let frame = vec![0xABu8; 1000];
        muxer.write_video(&mut out, &frame, 1000, 1040, true);

        assert_eq!(out.len() % TS_PACKET_LEN, 0);
        let pkts = packets(&out);
        assert!(pkts.iter().all(|p| p[0] == SYNC_BYTE && pid_of(p) == VIDEO_PID));

        // first packet: payload start, adaptation with RAI + PCR
        assert_eq!(pkts[0][1] & 0x40, 0x40);
        assert_eq!(pkts[0][3] & 0x30, 0x30);
        assert_eq!(pkts[0][5] & 0x50, 0x50);

        // continuity counter increments per packet
        for (i, p) in pkts.iter().enumerate() {
            assert_eq!((p[3] & 0x0F) as usize, i % 16);
        }

        // all frame bytes made it through
        let total_ab = pkts.iter().flat_map(|p| p.iter()).filter(|b| **b == 0xAB).count();
        assert_eq!(total_ab, 1000);
    }

    #[test]
    fn test_pes_timestamps() {
        let mut muxer = TsMuxer::new(None, Some(StreamType::AdtsAac));
        let mut out = BytesMut::new();
        muxer.write_audio(&mut out, &[0xFF, 0xF1, 0x50, 0x80, 0x01, 0x1F, 0xFC], 2000);

        let pkt = &out[..TS_PACKET_LEN];
        let af_len = pkt[4] as usize;
        let pes = &pkt[5 + af_len..];
        assert_eq!(&pes[..4], &[0, 0, 1, AUDIO_STREAM_ID]);

        let ts = &pes[9..14];
        let decoded = (((ts[0] >> 1) & 0x07) as u64) << 30
            | ((u16::from_be_bytes([ts[1], ts[2]]) >> 1) as u64) << 15
            | (u16::from_be_bytes([ts[3], ts[4]]) >> 1) as u64;
        assert_eq!(decoded, 180_000);
    }

    #[test]
    fn test_single_byte_stuffing() {
        let mut out = BytesMut::new();
        let mut cc = 0;
        // 183 bytes leave exactly one byte for the adaptation length
        write_payload(&mut out, VIDEO_PID, &mut cc, &[0x11; 183], false, None);
        assert_eq!(out.len(), TS_PACKET_LEN);
        assert_eq!(out[4], 0);
        assert_eq!(out[5], 0x11);
    }
}
