//! Duration recovery
//!
//! Resuming a recording needs the timestamp of the last unit already on
//! disk. Each container has its own tail-inspection strategy; all of them
//! return 0 for anything they cannot trust, so a damaged file restarts the
//! timeline instead of failing the recorder.

pub mod flv;
pub mod hls;
pub mod mp4;

use std::io::{Read, Seek};
use std::path::Path;

use crate::format::RecordFormat;

/// Object-safe `Read + Seek`
pub trait ReadSeek: Read + Seek {}

impl<T: Read + Seek + ?Sized> ReadSeek for T {}

/// Last written timestamp in milliseconds, 0 when unknown
pub type RecoverFn = fn(&mut dyn ReadSeek) -> u32;

/// Recover the continuation timestamp of `path` for `format`.
///
/// Blocking; run it off the async executor.
pub fn recover_last_timestamp(format: RecordFormat, path: &Path) -> u32 {
    let Some(recover) = format.recovery() else {
        return 0;
    };

    let mut file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "No file to recover");
            return 0;
        }
    };
    match file.metadata() {
        Ok(meta) if meta.len() > 0 => {}
        _ => return 0,
    }

    let timestamp = recover(&mut file);
    tracing::debug!(
        format = %format,
        path = %path.display(),
        timestamp = timestamp,
        "Recovered last timestamp"
    );
    timestamp
}

/// Convert a duration in `timescale` units to milliseconds, saturating
pub(crate) fn to_millis(value: u64, timescale: u32) -> u32 {
    let timescale = if timescale == 0 { 1000 } else { timescale as u64 };
    let millis = (value as u128 * 1000) / timescale as u128;
    millis.min(u32::MAX as u128) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_and_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.flv");
        assert_eq!(recover_last_timestamp(RecordFormat::Flv, &missing), 0);

        let empty = dir.path().join("empty.mp4");
        std::fs::write(&empty, b"").unwrap();
        assert_eq!(recover_last_timestamp(RecordFormat::Mp4, &empty), 0);
    }

    #[test]
    fn test_raw_has_no_strategy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cam.h264");
        std::fs::write(&path, [0, 0, 0, 1, 0x65]).unwrap();
        assert_eq!(recover_last_timestamp(RecordFormat::Raw, &path), 0);
    }

    #[test]
    fn test_to_millis() {
        assert_eq!(to_millis(90_000, 90_000), 1000);
        assert_eq!(to_millis(1234, 1000), 1234);
        assert_eq!(to_millis(48_000 * 3, 48_000), 3000);
        assert_eq!(to_millis(5, 0), 5);
        assert_eq!(to_millis(u64::MAX, 1), u32::MAX);
    }
}
