//! MP4 and fragmented MP4 tail inspection
//!
//! Top-level boxes are walked by seeking over their headers; only `moov`,
//! `moof` and `mfra` bodies are read. A `moof` only counts once the `mdat`
//! that follows it is complete.

use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom};

use bytes::Bytes;

use super::{to_millis, ReadSeek};
use crate::media::mp4::{
    child_boxes, find_child, find_path, full_box, read_box_body, read_box_header,
    RandomAccessEntry, TIMESCALE,
};

const TFHD_BASE_DATA_OFFSET: u32 = 0x01;
const TFHD_SAMPLE_DESCRIPTION: u32 = 0x02;
const TFHD_DEFAULT_DURATION: u32 = 0x08;

const TRUN_DATA_OFFSET: u32 = 0x001;
const TRUN_FIRST_SAMPLE_FLAGS: u32 = 0x004;
const TRUN_SAMPLE_DURATION: u32 = 0x100;
const TRUN_SAMPLE_SIZE: u32 = 0x200;
const TRUN_SAMPLE_FLAGS: u32 = 0x400;
const TRUN_SAMPLE_CTS: u32 = 0x800;

/// Last timestamp of an MP4 or fragmented MP4 file in milliseconds
pub fn recover_last_timestamp(r: &mut dyn ReadSeek) -> u32 {
    match scan_layout(r) {
        Ok(layout) => layout.last_timestamp(),
        Err(e) => {
            tracing::debug!(error = %e, "MP4 scan failed");
            0
        }
    }
}

/// State needed to keep appending fragments to an existing file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FragmentedTail {
    /// End of the last complete fragment, in milliseconds
    pub last_timestamp: u32,
    /// `mfhd` sequence number of the last complete fragment
    pub last_sequence: u32,
    /// Offset of a trailing `mfra` index, if one was written
    pub mfra_offset: Option<u64>,
    /// Offset where new boxes go; everything after it is index or garbage
    pub append_offset: u64,
    /// Whether an init `moov` is present
    pub has_init: bool,
    /// Fragment start times per track, for rebuilding `mfra`
    pub random_access: Vec<(u32, RandomAccessEntry)>,
}

/// Inspect a fragmented file for appending
pub fn scan_fragmented_tail<R: Read + Seek + ?Sized>(r: &mut R) -> io::Result<FragmentedTail> {
    let layout = scan_layout(r)?;
    Ok(FragmentedTail {
        last_timestamp: layout.last_timestamp(),
        last_sequence: layout.last_sequence,
        mfra_offset: layout.mfra_offset,
        append_offset: layout.append_offset,
        has_init: layout.moov.is_some(),
        random_access: layout.random_access,
    })
}

#[derive(Debug, Default)]
struct Layout {
    moov: Option<Bytes>,
    last_moof: Option<Bytes>,
    last_sequence: u32,
    random_access: Vec<(u32, RandomAccessEntry)>,
    mfra_offset: Option<u64>,
    append_offset: u64,
}

impl Layout {
    fn last_timestamp(&self) -> u32 {
        let timescales = self.moov.as_deref().map(track_timescales).unwrap_or_default();

        if let Some(moof) = &self.last_moof {
            return child_boxes(moof)
                .filter(|(kind, _)| kind == b"traf")
                .filter_map(|(_, traf)| parse_traf(traf))
                .map(|t| {
                    let timescale = timescales.get(&t.track_id).copied().unwrap_or(TIMESCALE);
                    to_millis(t.base_decode_time.saturating_add(t.duration), timescale)
                })
                .max()
                .unwrap_or(0);
        }

        self.moov
            .as_deref()
            .and_then(movie_duration)
            .map(|(duration, timescale)| to_millis(duration, timescale))
            .unwrap_or(0)
    }
}

fn scan_layout<R: Read + Seek + ?Sized>(r: &mut R) -> io::Result<Layout> {
    let file_len = r.seek(SeekFrom::End(0))?;
    let mut layout = Layout::default();
    let mut pending: Option<(u64, Bytes)> = None;
    let mut offset = 0;

    while let Some(header) = read_box_header(r, offset, file_len)? {
        match &header.kind {
            b"moov" => layout.moov = Some(read_box_body(r, &header)?),
            b"moof" => pending = Some((header.offset, read_box_body(r, &header)?)),
            b"mdat" => {
                if let Some((moof_offset, moof)) = pending.take() {
                    layout.commit_fragment(moof_offset, moof);
                }
            }
            b"mfra" => {
                layout.mfra_offset = Some(header.offset);
                break;
            }
            _ => {}
        }
        offset = header.end();
        if pending.is_none() {
            layout.append_offset = offset;
        }
    }
    Ok(layout)
}

impl Layout {
    fn commit_fragment(&mut self, moof_offset: u64, moof: Bytes) {
        if let Some(sequence) = find_child(&moof, b"mfhd")
            .and_then(full_box)
            .and_then(|(_, _, payload)| be_u32(payload, 0))
        {
            self.last_sequence = sequence;
        }
        for (kind, traf) in child_boxes(&moof) {
            if &kind != b"traf" {
                continue;
            }
            if let Some(t) = parse_traf(traf) {
                self.random_access.push((
                    t.track_id,
                    RandomAccessEntry {
                        time: t.base_decode_time,
                        moof_offset,
                    },
                ));
            }
        }
        self.last_moof = Some(moof);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TrafSummary {
    track_id: u32,
    base_decode_time: u64,
    duration: u64,
}

fn parse_traf(traf: &[u8]) -> Option<TrafSummary> {
    let (_, tfhd_flags, tfhd) = full_box(find_child(traf, b"tfhd")?)?;
    let track_id = be_u32(tfhd, 0)?;
    let mut pos = 4;
    if tfhd_flags & TFHD_BASE_DATA_OFFSET != 0 {
        pos += 8;
    }
    if tfhd_flags & TFHD_SAMPLE_DESCRIPTION != 0 {
        pos += 4;
    }
    let default_duration = if tfhd_flags & TFHD_DEFAULT_DURATION != 0 {
        be_u32(tfhd, pos)?
    } else {
        0
    };

    let base_decode_time = match find_child(traf, b"tfdt").and_then(full_box) {
        Some((1, _, payload)) => be_u64(payload, 0)?,
        Some((_, _, payload)) => be_u32(payload, 0)? as u64,
        None => 0,
    };

    let mut duration = 0u64;
    for (kind, body) in child_boxes(traf) {
        if &kind == b"trun" {
            duration = duration.saturating_add(trun_duration(body, default_duration)?);
        }
    }

    Some(TrafSummary {
        track_id,
        base_decode_time,
        duration,
    })
}

fn trun_duration(trun: &[u8], default_duration: u32) -> Option<u64> {
    let (_, flags, payload) = full_box(trun)?;
    let count = be_u32(payload, 0)?;
    let mut pos = 4;
    if flags & TRUN_DATA_OFFSET != 0 {
        pos += 4;
    }
    if flags & TRUN_FIRST_SAMPLE_FLAGS != 0 {
        pos += 4;
    }

    if flags & TRUN_SAMPLE_DURATION == 0 {
        return Some(count as u64 * default_duration as u64);
    }

    let stride = [
        TRUN_SAMPLE_DURATION,
        TRUN_SAMPLE_SIZE,
        TRUN_SAMPLE_FLAGS,
        TRUN_SAMPLE_CTS,
    ]
    .iter()
    .filter(|bit| flags & **bit != 0)
    .count()
        * 4;

    let mut total = 0u64;
    for _ in 0..count {
        total = total.saturating_add(be_u32(payload, pos)? as u64);
        pos += stride;
    }
    Some(total)
}

/// Media timescale per track id
fn track_timescales(moov: &[u8]) -> HashMap<u32, u32> {
    let mut timescales = HashMap::new();
    for (kind, trak) in child_boxes(moov) {
        if &kind != b"trak" {
            continue;
        }
        let track_id = find_child(trak, b"tkhd")
            .and_then(full_box)
            .and_then(|(version, _, p)| be_u32(p, if version == 1 { 16 } else { 8 }));
        let timescale = find_path(trak, &[b"mdia", b"mdhd"])
            .and_then(full_box)
            .and_then(|(version, _, p)| be_u32(p, if version == 1 { 16 } else { 8 }));
        if let (Some(id), Some(timescale)) = (track_id, timescale) {
            timescales.insert(id, timescale);
        }
    }
    timescales
}

/// `(duration, timescale)` from `mvhd`
fn movie_duration(moov: &[u8]) -> Option<(u64, u32)> {
    let (version, _, p) = full_box(find_child(moov, b"mvhd")?)?;
    if version == 1 {
        Some((be_u64(p, 20)?, be_u32(p, 16)?))
    } else {
        Some((be_u32(p, 12)? as u64, be_u32(p, 8)?))
    }
}

fn be_u32(data: &[u8], at: usize) -> Option<u32> {
    let raw = data.get(at..at + 4)?;
    Some(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

fn be_u64(data: &[u8], at: usize) -> Option<u64> {
    let raw = data.get(at..at + 8)?;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(raw);
    Some(u64::from_be_bytes(buf))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bytes::{BufMut, BytesMut};

    use super::*;
    use crate::media::aac::AudioSpecificConfig;
    use crate::media::mp4::{
        write_box, write_fragment, write_ftyp, write_full_box, write_init_moov, write_mfra,
        write_moov, FragmentSample, Sample, SampleTable, Track, TrackCodec, TrackFragment,
    };

    fn audio_track() -> Track {
        Track {
            id: 1,
            codec: TrackCodec::Audio(
                AudioSpecificConfig::parse(Bytes::from_static(&[0x12, 0x10])).unwrap(),
            ),
            width: 0,
            height: 0,
        }
    }

    fn fragment(track_id: u32, base: u64, durations: &[u32]) -> TrackFragment {
        let mut frag = TrackFragment::new(track_id, base);
        for d in durations {
            frag.push(
                FragmentSample {
                    duration: *d,
                    size: 4,
                    cts_offset: 0,
                    sync: true,
                },
                &[1, 2, 3, 4],
            );
        }
        frag
    }

    fn fragmented_file(with_mfra: bool) -> Vec<u8> {
        let track = audio_track();
        let mut buf = BytesMut::new();
        write_ftyp(&mut buf, true);
        write_init_moov(&mut buf, &[&track]);
        let mut entries = Vec::new();
        for (seq, base) in [(1u32, 0u64), (2, 2000)] {
            entries.push(RandomAccessEntry {
                time: base,
                moof_offset: buf.len() as u64,
            });
            write_fragment(&mut buf, seq, &[fragment(1, base, &[1000, 1000])]);
        }
        if with_mfra {
            write_mfra(&mut buf, &[(1, &entries)]);
        }
        buf.to_vec()
    }

    #[test]
    fn test_fragmented_last_timestamp() {
        let data = fragmented_file(true);
        assert_eq!(recover_last_timestamp(&mut Cursor::new(data)), 4000);
    }

    #[test]
    fn test_fragmented_tail() {
        let plain = fragmented_file(false);
        let indexed = fragmented_file(true);

        let tail = scan_fragmented_tail(&mut Cursor::new(indexed.clone())).unwrap();
        assert_eq!(tail.last_timestamp, 4000);
        assert_eq!(tail.last_sequence, 2);
        assert_eq!(tail.mfra_offset, Some(plain.len() as u64));
        assert_eq!(tail.append_offset, plain.len() as u64);
        assert!(tail.has_init);
        assert_eq!(tail.random_access.len(), 2);
        assert_eq!(tail.random_access[1].1.time, 2000);
    }

    #[test]
    fn test_incomplete_fragment_is_ignored() {
        let mut data = fragmented_file(false);
        let complete_len = data.len();

        let mut extra = BytesMut::new();
        write_fragment(&mut extra, 3, &[fragment(1, 4000, &[1000])]);
        data.extend_from_slice(&extra[..extra.len() - 2]);

        let tail = scan_fragmented_tail(&mut Cursor::new(data)).unwrap();
        assert_eq!(tail.last_timestamp, 4000);
        assert_eq!(tail.last_sequence, 2);
        assert_eq!(tail.append_offset, complete_len as u64);
    }

    #[test]
    fn test_track_timescale_conversion() {
        // hand-built init with a 90 kHz video track
        let mut buf = BytesMut::new();
        write_ftyp(&mut buf, true);
        write_box(&mut buf, b"moov", |moov| {
            write_box(moov, b"trak", |trak| {
                write_full_box(trak, b"tkhd", 0, 3, |b| {
                    b.put_u32(0);
                    b.put_u32(0);
                    b.put_u32(7);
                });
                write_box(trak, b"mdia", |mdia| {
                    write_full_box(mdia, b"mdhd", 0, 0, |b| {
                        b.put_u32(0);
                        b.put_u32(0);
                        b.put_u32(90_000);
                        b.put_u32(0);
                    });
                });
            });
        });
        write_fragment(&mut buf, 1, &[fragment(7, 90_000, &[3000, 3000, 3000])]);

        assert_eq!(recover_last_timestamp(&mut Cursor::new(buf.to_vec())), 1100);
    }

    #[test]
    fn test_progressive_moov_duration() {
        let track = audio_track();
        let mut table = SampleTable::new();
        for i in 0..5u64 {
            table.push(Sample {
                dts: i * 500,
                cts_offset: 0,
                size: 4,
                sync: true,
                offset: 0,
            });
        }
        let mut buf = BytesMut::new();
        write_ftyp(&mut buf, false);
        write_moov(&mut buf, &[(&track, &table)]);

        assert_eq!(recover_last_timestamp(&mut Cursor::new(buf.to_vec())), 2500);
    }

    #[test]
    fn test_unfinished_progressive_is_zero() {
        let mut buf = BytesMut::new();
        write_ftyp(&mut buf, false);
        buf.extend_from_slice(&crate::media::mp4::large_mdat_header());
        buf.extend_from_slice(&[0u8; 64]);
        assert_eq!(recover_last_timestamp(&mut Cursor::new(buf.to_vec())), 0);
        assert_eq!(recover_last_timestamp(&mut Cursor::new(vec![0u8; 3])), 0);
    }

    fn with_ftyp(rest: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        write_ftyp(&mut buf, true);
        buf.extend_from_slice(rest);
        buf.to_vec()
    }

    #[test]
    fn test_box_smaller_than_header_stops_walk() {
        let mut data = fragmented_file(false);
        let complete_len = data.len() as u64;
        data.extend_from_slice(&[0, 0, 0, 4]);
        data.extend_from_slice(b"moof");
        data.extend_from_slice(&[0u8; 32]);

        assert_eq!(recover_last_timestamp(&mut Cursor::new(data.clone())), 4000);
        let tail = scan_fragmented_tail(&mut Cursor::new(data)).unwrap();
        assert_eq!(tail.append_offset, complete_len);
        assert_eq!(recover_last_timestamp(&mut Cursor::new(with_ftyp(&[0, 0, 0, 3, b'f', b'r', b'e', b'e']))), 0);
    }

    #[test]
    fn test_box_past_eof_is_zero() {
        let mut moov = vec![0, 0, 0x03, 0xE8];
        moov.extend_from_slice(b"moov");
        moov.extend_from_slice(&[0u8; 12]);
        assert_eq!(recover_last_timestamp(&mut Cursor::new(with_ftyp(&moov))), 0);
    }

    #[test]
    fn test_largesize_overflow_is_zero() {
        let mut free = vec![0, 0, 0, 1];
        free.extend_from_slice(b"free");
        free.extend_from_slice(&u64::MAX.to_be_bytes());
        let data = with_ftyp(&free);

        assert_eq!(recover_last_timestamp(&mut Cursor::new(data.clone())), 0);
        let tail = scan_fragmented_tail(&mut Cursor::new(data)).unwrap();
        assert!(!tail.has_init);
    }

    fn hand_fragment(tfdt: u64, declared: u32, durations: &[u32]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        write_box(&mut buf, b"moof", |moof| {
            write_full_box(moof, b"mfhd", 0, 0, |b| b.put_u32(1));
            write_box(moof, b"traf", |traf| {
                write_full_box(traf, b"tfhd", 0, 0, |b| b.put_u32(1));
                write_full_box(traf, b"tfdt", 1, 0, |b| b.put_u64(tfdt));
                write_full_box(traf, b"trun", 0, TRUN_SAMPLE_DURATION, |b| {
                    b.put_u32(declared);
                    for d in durations {
                        b.put_u32(*d);
                    }
                });
            });
        });
        write_box(&mut buf, b"mdat", |b| b.put_u32(0));
        buf.to_vec()
    }

    #[test]
    fn test_truncated_trun_is_zero() {
        let data = with_ftyp(&hand_fragment(1000, 5, &[1000]));
        assert_eq!(recover_last_timestamp(&mut Cursor::new(data)), 0);
    }

    #[test]
    fn test_decode_time_overflow_saturates() {
        let data = with_ftyp(&hand_fragment(u64::MAX - 10, 2, &[u32::MAX, u32::MAX]));
        assert_eq!(recover_last_timestamp(&mut Cursor::new(data)), u32::MAX);
    }
}
