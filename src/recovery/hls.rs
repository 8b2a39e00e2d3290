//! HLS playlist inspection

use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use super::ReadSeek;
use crate::media::m3u8::Playlist;

/// Sum of `#EXTINF` durations, 0 if the playlist cannot be read
pub fn recover_last_timestamp(r: &mut dyn ReadSeek) -> u32 {
    match read_playlist(r) {
        Ok(playlist) => playlist.total_duration_ms().min(u32::MAX as u64) as u32,
        Err(e) => {
            tracing::debug!(error = %e, "Playlist read failed");
            0
        }
    }
}

/// Parse a playlist from the start of `r`
pub fn read_playlist<R: Read + Seek + ?Sized>(r: &mut R) -> io::Result<Playlist> {
    r.seek(SeekFrom::Start(0))?;
    let mut raw = Vec::new();
    r.read_to_end(&mut raw)?;
    Ok(Playlist::parse(&String::from_utf8_lossy(&raw)))
}

/// Load the playlist at `path`; a missing or unreadable file is an empty
/// playlist
pub fn parse_playlist(path: &Path) -> Playlist {
    match std::fs::File::open(path) {
        Ok(mut file) => read_playlist(&mut file).unwrap_or_default(),
        Err(_) => Playlist::default(),
    }
}
