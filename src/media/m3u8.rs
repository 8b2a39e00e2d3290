//! HLS media playlist rendering and parsing

use std::fmt::Write as _;

/// One `#EXTINF` entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistSegment {
    /// Duration in milliseconds
    pub duration_ms: u64,
    /// Segment URI relative to the playlist
    pub uri: String,
}

/// Media playlist as written by the HLS recorder
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Playlist {
    /// Sequence number of the first segment
    pub media_sequence: u64,
    pub segments: Vec<PlaylistSegment>,
    /// `#EXT-X-ENDLIST` present
    pub ended: bool,
}

impl Playlist {
    pub fn new(media_sequence: u64) -> Self {
        Self {
            media_sequence,
            ..Default::default()
        }
    }

    /// Sequence number the next segment gets
    pub fn next_sequence(&self) -> u64 {
        self.media_sequence.saturating_add(self.segments.len() as u64)
    }

    /// Sum of segment durations in milliseconds
    pub fn total_duration_ms(&self) -> u64 {
        self.segments
            .iter()
            .fold(0u64, |total, s| total.saturating_add(s.duration_ms))
    }

    /// Longest segment rounded up to whole seconds
    pub fn target_duration(&self) -> u64 {
        self.segments
            .iter()
            .map(|s| s.duration_ms.div_ceil(1000))
            .max()
            .unwrap_or(0)
            .max(1)
    }

    pub fn push(&mut self, duration_ms: u64, uri: impl Into<String>) {
        self.segments.push(PlaylistSegment {
            duration_ms,
            uri: uri.into(),
        });
    }

    /// Render as an EVENT playlist
    pub fn render(&self) -> String {
        let mut m3u8 = String::new();
        m3u8.push_str("#EXTM3U\n");
        m3u8.push_str("#EXT-X-VERSION:3\n");
        m3u8.push_str("#EXT-X-PLAYLIST-TYPE:EVENT\n");
        let _ = writeln!(m3u8, "#EXT-X-TARGETDURATION:{}", self.target_duration());
        let _ = writeln!(m3u8, "#EXT-X-MEDIA-SEQUENCE:{}", self.media_sequence);

        for segment in &self.segments {
            let _ = writeln!(
                m3u8,
                "#EXTINF:{}.{:03},",
                segment.duration_ms / 1000,
                segment.duration_ms % 1000
            );
            m3u8.push_str(&segment.uri);
            m3u8.push('\n');
        }

        if self.ended {
            m3u8.push_str("#EXT-X-ENDLIST\n");
        }
        m3u8
    }

    /// Parse a media playlist. Unknown tags are ignored; a missing header
    /// yields an empty playlist.
    pub fn parse(text: &str) -> Self {
        let mut playlist = Playlist::default();
        let mut lines = text.lines().map(str::trim);

        match lines.next() {
            Some(first) if first.trim_start_matches('\u{feff}') == "#EXTM3U" => {}
            _ => return playlist,
        }

        let mut pending: Option<u64> = None;
        for line in lines {
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix("#EXTINF:") {
                let value = rest.split(',').next().unwrap_or("");
                pending = Some(parse_seconds_ms(value).unwrap_or(0));
            } else if let Some(rest) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
                playlist.media_sequence = rest.trim().parse().unwrap_or(0);
            } else if line == "#EXT-X-ENDLIST" {
                playlist.ended = true;
            } else if !line.starts_with('#') {
                if let Some(duration_ms) = pending.take() {
                    playlist.push(duration_ms, line);
                }
            }
        }
        playlist
    }
}

/// Parse a decimal seconds value into milliseconds without float rounding
fn parse_seconds_ms(value: &str) -> Option<u64> {
    let value = value.trim();
    let (whole, frac) = value.split_once('.').unwrap_or((value, ""));
    let whole: u64 = if whole.is_empty() { 0 } else { whole.parse().ok()? };
    let mut millis = 0u64;
    for (i, c) in frac.chars().take(3).enumerate() {
        let digit = c.to_digit(10)? as u64;
        millis += digit * 10u64.pow(2 - i as u32);
    }
    whole.checked_mul(1000)?.checked_add(millis)
}
