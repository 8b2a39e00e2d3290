//! ISO-BMFF box writer and reader
//!
//! Covers what the progressive and fragmented MP4 recorders emit:
//!
//! ```text
//! Progressive:  ftyp | mdat (64-bit) | moov
//! Fragmented:   ftyp | moov (mvex/trex) | { moof | mdat }* | mfra
//! ```
//!
//! Both track kinds use a millisecond timescale so that FLV timestamps map
//! onto decode times without rounding.

use std::io::{self, Read, Seek, SeekFrom};

use bytes::{BufMut, Bytes, BytesMut};

use super::aac::AudioSpecificConfig;
use super::packet::VideoConfig;

/// Media timescale of every track
pub const TIMESCALE: u32 = 1000;

const MATRIX: [u32; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];

/// `und` packed as ISO-639-2/T
const LANGUAGE_UND: u16 = 0x55C4;

const SYNC_SAMPLE_FLAGS: u32 = 0x0200_0000;
const NON_SYNC_SAMPLE_FLAGS: u32 = 0x0101_0000;

/// Write a box, back-patching its 32-bit size once `body` has run
pub fn write_box<F>(buf: &mut BytesMut, kind: &[u8; 4], body: F)
where
    F: FnOnce(&mut BytesMut),
{
    let start = buf.len();
    buf.put_u32(0);
    buf.put_slice(kind);
    body(buf);
    let size = (buf.len() - start) as u32;
    buf[start..start + 4].copy_from_slice(&size.to_be_bytes());
}

/// Write a full box (version + 24-bit flags)
pub fn write_full_box<F>(buf: &mut BytesMut, kind: &[u8; 4], version: u8, flags: u32, body: F)
where
    F: FnOnce(&mut BytesMut),
{
    write_box(buf, kind, |b| {
        b.put_u32(((version as u32) << 24) | (flags & 0x00FF_FFFF));
        body(b);
    });
}

/// `ftyp` for progressive or fragmented output
pub fn write_ftyp(buf: &mut BytesMut, fragmented: bool) {
    write_box(buf, b"ftyp", |b| {
        b.put_slice(b"isom");
        b.put_u32(0x200);
        b.put_slice(b"isom");
        b.put_slice(b"iso2");
        if fragmented {
            b.put_slice(b"iso6");
        }
        b.put_slice(b"avc1");
        b.put_slice(b"mp41");
    });
}

/// 64-bit `mdat` header with a zero size, patched at close
pub fn large_mdat_header() -> [u8; 16] {
    let mut header = [0u8; 16];
    header[..4].copy_from_slice(&1u32.to_be_bytes());
    header[4..8].copy_from_slice(b"mdat");
    header
}

/// Codec carried by a track
#[derive(Debug, Clone)]
pub enum TrackCodec {
    Video(VideoConfig),
    Audio(AudioSpecificConfig),
}

/// Static description of one track
#[derive(Debug, Clone)]
pub struct Track {
    pub id: u32,
    pub codec: TrackCodec,
    pub width: u16,
    pub height: u16,
}

impl Track {
    pub fn is_video(&self) -> bool {
        matches!(self.codec, TrackCodec::Video(_))
    }
}

/// One sample in a progressive sample table
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub dts: u64,
    pub cts_offset: i32,
    pub size: u32,
    pub sync: bool,
    /// Absolute file offset of the sample data
    pub offset: u64,
}

/// Samples of one track, turned into `stbl` at close
#[derive(Debug, Clone, Default)]
pub struct SampleTable {
    samples: Vec<Sample>,
}

impl SampleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sample: Sample) {
        self.samples.push(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Per-sample durations; the last sample repeats the previous delta
    fn durations(&self) -> Vec<u32> {
        let mut durations: Vec<u32> = self
            .samples
            .windows(2)
            .map(|w| w[1].dts.saturating_sub(w[0].dts) as u32)
            .collect();
        if !self.samples.is_empty() {
            durations.push(durations.last().copied().unwrap_or(0));
        }
        durations
    }

    /// Track duration in timescale units
    pub fn duration(&self) -> u64 {
        match (self.samples.first(), self.samples.last()) {
            (Some(first), Some(last)) => {
                let tail = self.durations().last().copied().unwrap_or(0) as u64;
                last.dts - first.dts + tail
            }
            _ => 0,
        }
    }
}

/// Progressive `moov` covering every sample written to `mdat`
pub fn write_moov(buf: &mut BytesMut, tracks: &[(&Track, &SampleTable)]) {
    let duration = tracks.iter().map(|(_, t)| t.duration()).max().unwrap_or(0);
    let next_track_id = tracks.iter().map(|(t, _)| t.id).max().unwrap_or(0) + 1;

    write_box(buf, b"moov", |b| {
        write_mvhd(b, duration, next_track_id);
        for (track, table) in tracks {
            write_trak(b, track, table.duration(), |stbl| write_sample_table(stbl, track, table));
        }
    });
}

/// Fragmented init `moov`: empty sample tables plus `mvex`
pub fn write_init_moov(buf: &mut BytesMut, tracks: &[&Track]) {
    let next_track_id = tracks.iter().map(|t| t.id).max().unwrap_or(0) + 1;

    write_box(buf, b"moov", |b| {
        write_mvhd(b, 0, next_track_id);
        for track in tracks {
            write_trak(b, track, 0, |stbl| {
                write_stsd(stbl, track);
                write_full_box(stbl, b"stts", 0, 0, |x| x.put_u32(0));
                write_full_box(stbl, b"stsc", 0, 0, |x| x.put_u32(0));
                write_full_box(stbl, b"stsz", 0, 0, |x| {
                    x.put_u32(0);
                    x.put_u32(0);
                });
                write_full_box(stbl, b"stco", 0, 0, |x| x.put_u32(0));
            });
        }
        write_box(b, b"mvex", |mvex| {
            for track in tracks {
                write_full_box(mvex, b"trex", 0, 0, |x| {
                    x.put_u32(track.id);
                    x.put_u32(1); // sample description index
                    x.put_u32(0);
                    x.put_u32(0);
                    x.put_u32(0);
                });
            }
        });
    });
}

fn write_mvhd(buf: &mut BytesMut, duration: u64, next_track_id: u32) {
    write_full_box(buf, b"mvhd", 1, 0, |b| {
        b.put_u64(0); // creation time
        b.put_u64(0); // modification time
        b.put_u32(TIMESCALE);
        b.put_u64(duration);
        b.put_u32(0x0001_0000); // rate 1.0
        b.put_u16(0x0100); // volume 1.0
        b.put_bytes(0, 10);
        for m in MATRIX {
            b.put_u32(m);
        }
        b.put_bytes(0, 24);
        b.put_u32(next_track_id);
    });
}

fn write_trak<F>(buf: &mut BytesMut, track: &Track, duration: u64, stbl: F)
where
    F: FnOnce(&mut BytesMut),
{
    write_box(buf, b"trak", |b| {
        write_full_box(b, b"tkhd", 1, 0x3, |x| {
            x.put_u64(0);
            x.put_u64(0);
            x.put_u32(track.id);
            x.put_u32(0);
            x.put_u64(duration);
            x.put_bytes(0, 8);
            x.put_u16(0); // layer
            x.put_u16(0); // alternate group
            x.put_u16(if track.is_video() { 0 } else { 0x0100 });
            x.put_u16(0);
            for m in MATRIX {
                x.put_u32(m);
            }
            x.put_u32((track.width as u32) << 16);
            x.put_u32((track.height as u32) << 16);
        });

        write_box(b, b"mdia", |mdia| {
            write_full_box(mdia, b"mdhd", 1, 0, |x| {
                x.put_u64(0);
                x.put_u64(0);
                x.put_u32(TIMESCALE);
                x.put_u64(duration);
                x.put_u16(LANGUAGE_UND);
                x.put_u16(0);
            });

            let (handler, name): (&[u8; 4], &[u8]) = if track.is_video() {
                (b"vide", b"VideoHandler\0")
            } else {
                (b"soun", b"SoundHandler\0")
            };
            write_full_box(mdia, b"hdlr", 0, 0, |x| {
                x.put_u32(0);
                x.put_slice(handler);
                x.put_bytes(0, 12);
                x.put_slice(name);
            });

            write_box(mdia, b"minf", |minf| {
                if track.is_video() {
                    write_full_box(minf, b"vmhd", 0, 1, |x| x.put_bytes(0, 8));
                } else {
                    write_full_box(minf, b"smhd", 0, 0, |x| x.put_u32(0));
                }
                write_box(minf, b"dinf", |dinf| {
                    write_full_box(dinf, b"dref", 0, 0, |x| {
                        x.put_u32(1);
                        write_full_box(x, b"url ", 0, 1, |_| {});
                    });
                });
                write_box(minf, b"stbl", stbl);
            });
        });
    });
}

fn write_stsd(buf: &mut BytesMut, track: &Track) {
    write_full_box(buf, b"stsd", 0, 0, |b| {
        b.put_u32(1);
        match &track.codec {
            TrackCodec::Video(config) => {
                let (entry, config_box): (&[u8; 4], &[u8; 4]) = match config {
                    VideoConfig::Avc(_) => (b"avc1", b"avcC"),
                    VideoConfig::Hevc(_) => (b"hvc1", b"hvcC"),
                };
                write_box(b, entry, |x| {
                    x.put_bytes(0, 6);
                    x.put_u16(1); // data reference index
                    x.put_bytes(0, 16);
                    x.put_u16(track.width);
                    x.put_u16(track.height);
                    x.put_u32(0x0048_0000); // 72 dpi
                    x.put_u32(0x0048_0000);
                    x.put_u32(0);
                    x.put_u16(1); // frame count
                    x.put_bytes(0, 32); // compressor name
                    x.put_u16(0x0018);
                    x.put_i16(-1);
                    write_box(x, config_box, |c| c.put_slice(config.record()));
                });
            }
            TrackCodec::Audio(asc) => {
                write_box(b, b"mp4a", |x| {
                    x.put_bytes(0, 6);
                    x.put_u16(1);
                    x.put_bytes(0, 8);
                    x.put_u16(asc.channels().max(1) as u16);
                    x.put_u16(16);
                    x.put_u32(0);
                    x.put_u32(asc.sampling_frequency.min(0xFFFF) << 16);
                    write_esds(x, track.id, asc);
                });
            }
        }
    });
}

fn put_descriptor(buf: &mut BytesMut, tag: u8, body: &[u8]) {
    buf.put_u8(tag);
    let len = body.len() as u32;
    // 4-byte expandable length keeps the layout independent of payload size
    buf.put_u8(0x80 | ((len >> 21) & 0x7F) as u8);
    buf.put_u8(0x80 | ((len >> 14) & 0x7F) as u8);
    buf.put_u8(0x80 | ((len >> 7) & 0x7F) as u8);
    buf.put_u8((len & 0x7F) as u8);
    buf.put_slice(body);
}

fn write_esds(buf: &mut BytesMut, track_id: u32, asc: &AudioSpecificConfig) {
    let mut specific = BytesMut::new();
    put_descriptor(&mut specific, 0x05, &asc.raw);

    let mut decoder = BytesMut::new();
    decoder.put_u8(0x40); // MPEG-4 audio
    decoder.put_u8(0x15); // audio stream
    decoder.put_bytes(0, 3); // buffer size
    decoder.put_u32(0); // max bitrate
    decoder.put_u32(0); // avg bitrate
    decoder.put_slice(&specific);

    let mut es = BytesMut::new();
    es.put_u16(track_id as u16);
    es.put_u8(0);
    put_descriptor(&mut es, 0x04, &decoder);
    put_descriptor(&mut es, 0x06, &[0x02]);

    write_full_box(buf, b"esds", 0, 0, |b| put_descriptor(b, 0x03, &es));
}

fn write_sample_table(buf: &mut BytesMut, track: &Track, table: &SampleTable) {
    write_stsd(buf, track);

    let durations = table.durations();
    let mut stts: Vec<(u32, u32)> = Vec::new();
    for d in durations {
        match stts.last_mut() {
            Some((count, delta)) if *delta == d => *count += 1,
            _ => stts.push((1, d)),
        }
    }
    write_full_box(buf, b"stts", 0, 0, |b| {
        b.put_u32(stts.len() as u32);
        for (count, delta) in &stts {
            b.put_u32(*count);
            b.put_u32(*delta);
        }
    });

    if table.samples.iter().any(|s| s.cts_offset != 0) {
        let mut ctts: Vec<(u32, i32)> = Vec::new();
        for s in &table.samples {
            match ctts.last_mut() {
                Some((count, offset)) if *offset == s.cts_offset => *count += 1,
                _ => ctts.push((1, s.cts_offset)),
            }
        }
        write_full_box(buf, b"ctts", 1, 0, |b| {
            b.put_u32(ctts.len() as u32);
            for (count, offset) in &ctts {
                b.put_u32(*count);
                b.put_i32(*offset);
            }
        });
    }

    if track.is_video() && table.samples.iter().any(|s| !s.sync) {
        let sync: Vec<u32> = table
            .samples
            .iter()
            .enumerate()
            .filter(|(_, s)| s.sync)
            .map(|(i, _)| i as u32 + 1)
            .collect();
        write_full_box(buf, b"stss", 0, 0, |b| {
            b.put_u32(sync.len() as u32);
            for n in sync {
                b.put_u32(n);
            }
        });
    }

    // one sample per chunk
    write_full_box(buf, b"stsc", 0, 0, |b| {
        if table.is_empty() {
            b.put_u32(0);
        } else {
            b.put_u32(1);
            b.put_u32(1);
            b.put_u32(1);
            b.put_u32(1);
        }
    });

    write_full_box(buf, b"stsz", 0, 0, |b| {
        b.put_u32(0);
        b.put_u32(table.len() as u32);
        for s in &table.samples {
            b.put_u32(s.size);
        }
    });

    write_full_box(buf, b"co64", 0, 0, |b| {
        b.put_u32(table.len() as u32);
        for s in &table.samples {
            b.put_u64(s.offset);
        }
    });
}

/// Sample inside a fragment run
#[derive(Debug, Clone, Copy)]
pub struct FragmentSample {
    pub duration: u32,
    pub size: u32,
    pub cts_offset: i32,
    pub sync: bool,
}

/// Samples of one track inside one `moof`
#[derive(Debug, Clone, Default)]
pub struct TrackFragment {
    pub track_id: u32,
    pub base_decode_time: u64,
    pub samples: Vec<FragmentSample>,
    pub data: BytesMut,
}

impl TrackFragment {
    pub fn new(track_id: u32, base_decode_time: u64) -> Self {
        Self {
            track_id,
            base_decode_time,
            ..Default::default()
        }
    }

    pub fn push(&mut self, sample: FragmentSample, payload: &[u8]) {
        self.samples.push(sample);
        self.data.put_slice(payload);
    }

    pub fn duration(&self) -> u64 {
        self.samples.iter().map(|s| s.duration as u64).sum()
    }
}

/// `moof` + `mdat` for one fragment; trun data offsets are moof-relative
pub fn write_fragment(buf: &mut BytesMut, sequence: u32, fragments: &[TrackFragment]) {
    let moof_start = buf.len();
    let mut offset_slots = Vec::with_capacity(fragments.len());

    write_box(buf, b"moof", |moof| {
        write_full_box(moof, b"mfhd", 0, 0, |b| b.put_u32(sequence));
        for frag in fragments.iter().filter(|f| !f.samples.is_empty()) {
            write_box(moof, b"traf", |traf| {
                // default-base-is-moof
                write_full_box(traf, b"tfhd", 0, 0x02_0000, |b| b.put_u32(frag.track_id));
                write_full_box(traf, b"tfdt", 1, 0, |b| b.put_u64(frag.base_decode_time));
                // data offset, duration, size, flags, composition offset
                write_full_box(traf, b"trun", 1, 0x000F01, |b| {
                    b.put_u32(frag.samples.len() as u32);
                    offset_slots.push(b.len());
                    b.put_u32(0);
                    for s in &frag.samples {
                        b.put_u32(s.duration);
                        b.put_u32(s.size);
                        b.put_u32(if s.sync {
                            SYNC_SAMPLE_FLAGS
                        } else {
                            NON_SYNC_SAMPLE_FLAGS
                        });
                        b.put_i32(s.cts_offset);
                    }
                });
            });
        }
    });

    let moof_len = buf.len() - moof_start;
    let mut data_offset = moof_len + 8;
    for (slot, frag) in offset_slots
        .iter()
        .zip(fragments.iter().filter(|f| !f.samples.is_empty()))
    {
        buf[*slot..*slot + 4].copy_from_slice(&(data_offset as u32).to_be_bytes());
        data_offset += frag.data.len();
    }

    write_box(buf, b"mdat", |b| {
        for frag in fragments {
            b.put_slice(&frag.data);
        }
    });
}

/// Random access point recorded in `tfra`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RandomAccessEntry {
    pub time: u64,
    pub moof_offset: u64,
}

/// `mfra` index with one `tfra` per track, closed by `mfro`
pub fn write_mfra(buf: &mut BytesMut, tracks: &[(u32, &[RandomAccessEntry])]) {
    let start = buf.len();
    write_box(buf, b"mfra", |mfra| {
        for (track_id, entries) in tracks {
            write_full_box(mfra, b"tfra", 1, 0, |b| {
                b.put_u32(*track_id);
                b.put_u32(0); // 1-byte traf/trun/sample numbers
                b.put_u32(entries.len() as u32);
                for e in entries.iter() {
                    b.put_u64(e.time);
                    b.put_u64(e.moof_offset);
                    b.put_u8(1);
                    b.put_u8(1);
                    b.put_u8(1);
                }
            });
        }
        let mfra_len = mfra.len() - start + 16;
        write_full_box(mfra, b"mfro", 0, 0, |b| b.put_u32(mfra_len as u32));
    });
}

/// Box header located in a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxHeader {
    pub kind: [u8; 4],
    pub offset: u64,
    pub size: u64,
    pub header_len: u64,
}

impl BoxHeader {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    pub fn body_len(&self) -> u64 {
        self.size - self.header_len
    }
}

/// Read the box header at `offset`; `None` at EOF or on a malformed header
pub fn read_box_header<R: Read + Seek + ?Sized>(
    r: &mut R,
    offset: u64,
    file_len: u64,
) -> io::Result<Option<BoxHeader>> {
    let past_end = |len: u64| offset.checked_add(len).map_or(true, |end| end > file_len);
    if past_end(8) {
        return Ok(None);
    }
    r.seek(SeekFrom::Start(offset))?;
    let mut header = [0u8; 8];
    r.read_exact(&mut header)?;

    let mut kind = [0u8; 4];
    kind.copy_from_slice(&header[4..]);
    let (size, header_len) = match u32::from_be_bytes([header[0], header[1], header[2], header[3]]) {
        0 => (file_len - offset, 8),
        1 => {
            if past_end(16) {
                return Ok(None);
            }
            let mut large = [0u8; 8];
            r.read_exact(&mut large)?;
            (u64::from_be_bytes(large), 16)
        }
        n => (n as u64, 8),
    };

    if size < header_len || past_end(size) {
        return Ok(None);
    }
    Ok(Some(BoxHeader {
        kind,
        offset,
        size,
        header_len,
    }))
}

/// Read a whole box body into memory
pub fn read_box_body<R: Read + Seek + ?Sized>(r: &mut R, header: &BoxHeader) -> io::Result<Bytes> {
    r.seek(SeekFrom::Start(header.offset + header.header_len))?;
    let mut body = vec![0u8; header.body_len() as usize];
    r.read_exact(&mut body)?;
    Ok(Bytes::from(body))
}

/// Iterator over boxes nested in an in-memory body, yielding `(kind, body)`
pub struct ChildBoxes<'a> {
    data: &'a [u8],
}

impl<'a> Iterator for ChildBoxes<'a> {
    type Item = ([u8; 4], &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.len() < 8 {
            return None;
        }
        let size = u32::from_be_bytes([self.data[0], self.data[1], self.data[2], self.data[3]]);
        let (size, header_len) = match size {
            0 => (self.data.len(), 8),
            1 if self.data.len() >= 16 => {
                let mut large = [0u8; 8];
                large.copy_from_slice(&self.data[8..16]);
                (u64::from_be_bytes(large) as usize, 16)
            }
            n => (n as usize, 8),
        };
        if size < header_len || size > self.data.len() {
            return None;
        }
        let mut kind = [0u8; 4];
        kind.copy_from_slice(&self.data[4..8]);
        let body = &self.data[header_len..size];
        self.data = &self.data[size..];
        Some((kind, body))
    }
}

pub fn child_boxes(data: &[u8]) -> ChildBoxes<'_> {
    ChildBoxes { data }
}

/// Body of the first child of `kind`
pub fn find_child<'a>(data: &'a [u8], kind: &[u8; 4]) -> Option<&'a [u8]> {
    child_boxes(data).find(|(k, _)| k == kind).map(|(_, body)| body)
}

/// Body of the box reached by following `path` through nested containers
pub fn find_path<'a>(data: &'a [u8], path: &[&[u8; 4]]) -> Option<&'a [u8]> {
    path.iter()
        .try_fold(data, |current, kind| find_child(current, kind))
}

/// Split a full box body into (version, flags, payload)
pub fn full_box(body: &[u8]) -> Option<(u8, u32, &[u8])> {
    if body.len() < 4 {
        return None;
    }
    let flags = u32::from_be_bytes([0, body[1], body[2], body[3]]);
    Some((body[0], flags, &body[4..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::flv::VideoCodec;

    const AVC_RECORD: &[u8] = &[
        0x01, 0x64, 0x00, 0x1F, 0xFF, 0xE1, 0x00, 0x02, 0x67, 0x64, 0x01, 0x00, 0x02, 0x68, 0xEF,
    ];

    fn video_track() -> Track {
        Track {
            id: 1,
            codec: TrackCodec::Video(
                VideoConfig::parse(VideoCodec::Avc, Bytes::from_static(AVC_RECORD)).unwrap(),
            ),
            width: 1280,
            height: 720,
        }
    }

    fn audio_track() -> Track {
        Track {
            id: 2,
            codec: TrackCodec::Audio(
                AudioSpecificConfig::parse(Bytes::from_static(&[0x12, 0x10])).unwrap(),
            ),
            width: 0,
            height: 0,
        }
    }

    #[test]
    fn test_write_box_patches_size() {
        let mut buf = BytesMut::new();
        write_full_box(&mut buf, b"test", 1, 0x000102, |b| b.put_u16(7));
        assert_eq!(&buf[..], &[0, 0, 0, 14, b't', b'e', b's', b't', 1, 0, 1, 2, 0, 7]);
    }

    #[test]
    fn test_progressive_moov_tables() {
        let mut table = SampleTable::new();
        for (i, sync) in [true, false, false, true].iter().enumerate() {
            table.push(Sample {
                dts: i as u64 * 40,
                cts_offset: if i == 1 { 80 } else { 0 },
                size: 100,
                sync: *sync,
                offset: 48 + i as u64 * 100,
            });
        }
        assert_eq!(table.duration(), 160);

        let track = video_track();
        let mut buf = BytesMut::new();
        write_moov(&mut buf, &[(&track, &table)]);

        let moov = find_child(&buf, b"moov").unwrap();
        let (version, _, mvhd) = full_box(find_child(moov, b"mvhd").unwrap()).unwrap();
        assert_eq!(version, 1);
        assert_eq!(u32::from_be_bytes([mvhd[16], mvhd[17], mvhd[18], mvhd[19]]), TIMESCALE);
        assert_eq!(u64::from_be_bytes(mvhd[20..28].try_into().unwrap()), 160);

        let stbl = find_path(moov, &[b"trak", b"mdia", b"minf", b"stbl"]).unwrap();
        let (_, _, stts) = full_box(find_child(stbl, b"stts").unwrap()).unwrap();
        // single run: 4 samples of 40
        assert_eq!(&stts[..12], &[0, 0, 0, 1, 0, 0, 0, 4, 0, 0, 0, 40]);

        let (_, _, stss) = full_box(find_child(stbl, b"stss").unwrap()).unwrap();
        assert_eq!(&stss[..], &[0, 0, 0, 2, 0, 0, 0, 1, 0, 0, 0, 4]);

        assert!(find_child(stbl, b"ctts").is_some());
        let (_, _, co64) = full_box(find_child(stbl, b"co64").unwrap()).unwrap();
        assert_eq!(u32::from_be_bytes(co64[..4].try_into().unwrap()), 4);

        let stsd = find_child(stbl, b"stsd").unwrap();
        let avc1 = find_child(&stsd[8..], b"avc1").unwrap();
        assert_eq!(find_child(&avc1[78..], b"avcC").unwrap(), AVC_RECORD);
    }

    #[test]
    fn test_audio_sample_entry_has_esds() {
        let track = audio_track();
        let mut buf = BytesMut::new();
        write_init_moov(&mut buf, &[&track]);

        let stsd = find_path(&buf, &[b"moov", b"trak", b"mdia", b"minf", b"stbl", b"stsd"]).unwrap();
        let mp4a = find_child(&stsd[8..], b"mp4a").unwrap();
        assert_eq!(u16::from_be_bytes([mp4a[16], mp4a[17]]), 2);
        let esds = find_child(&mp4a[28..], b"esds").unwrap();
        // AudioSpecificConfig is carried verbatim at the end of the decoder config
        assert!(esds.windows(2).any(|w| w == [0x12, 0x10]));

        let mvex = find_path(&buf, &[b"moov", b"mvex"]).unwrap();
        let (_, _, trex) = full_box(find_child(mvex, b"trex").unwrap()).unwrap();
        assert_eq!(u32::from_be_bytes(trex[..4].try_into().unwrap()), 2);
    }

    #[test]
    fn test_fragment_data_offsets_point_into_mdat() {
        let mut video = TrackFragment::new(1, 1000);
        video.push(
            FragmentSample {
                duration: 40,
                size: 3,
                cts_offset: 0,
                sync: true,
            },
            &[0xA1, 0xA2, 0xA3],
        );
        let mut audio = TrackFragment::new(2, 990);
        audio.push(
            FragmentSample {
                duration: 23,
                size: 2,
                cts_offset: 0,
                sync: true,
            },
            &[0xB1, 0xB2],
        );

        let mut buf = BytesMut::new();
        write_fragment(&mut buf, 7, &[video, audio]);

        let moof = find_child(&buf, b"moof").unwrap();
        let (_, _, mfhd) = full_box(find_child(moof, b"mfhd").unwrap()).unwrap();
        assert_eq!(mfhd, &[0, 0, 0, 7]);

        let offsets: Vec<usize> = child_boxes(moof)
            .filter(|(k, _)| k == b"traf")
            .map(|(_, traf)| {
                let (_, _, trun) = full_box(find_child(traf, b"trun").unwrap()).unwrap();
                u32::from_be_bytes(trun[4..8].try_into().unwrap()) as usize
            })
            .collect();
        assert_eq!(buf[offsets[0]], 0xA1);
        assert_eq!(buf[offsets[1]], 0xB1);
    }

    #[test]
    fn test_mfro_records_mfra_size() {
        let entries = [RandomAccessEntry {
            time: 0,
            moof_offset: 1234,
        }];
        let mut buf = BytesMut::new();
        buf.put_slice(b"prefix");
        write_mfra(&mut buf, &[(1, &entries[..])]);

        let mfra_len = buf.len() - 6;
        let tail = &buf[buf.len() - 4..];
        assert_eq!(u32::from_be_bytes(tail.try_into().unwrap()) as usize, mfra_len);
    }

    #[test]
    fn test_read_box_header_from_file() {
        let mut buf = BytesMut::new();
        write_ftyp(&mut buf, false);
        let ftyp_len = buf.len();
        buf.put_slice(&large_mdat_header());
        buf[ftyp_len + 8..ftyp_len + 16].copy_from_slice(&16u64.to_be_bytes());
        let len = buf.len() as u64;

        let mut cursor = std::io::Cursor::new(buf.to_vec());
        let ftyp = read_box_header(&mut cursor, 0, len).unwrap().unwrap();
        assert_eq!(&ftyp.kind, b"ftyp");
        assert_eq!(ftyp.size, ftyp_len as u64);

        let mdat = read_box_header(&mut cursor, ftyp.end(), len).unwrap().unwrap();
        assert_eq!(&mdat.kind, b"mdat");
        assert_eq!(mdat.header_len, 16);
        assert!(read_box_header(&mut cursor, mdat.end(), len).unwrap().is_none());
    }
}
