//! FLV tail inspection
//!
//! ```text
//! ... | tag header (11) | data (S - 11) | PreviousTagSize = S (4) | EOF
//! ```

use std::io::{self, Read, Seek, SeekFrom};

use super::ReadSeek;
use crate::media::flv::{FlvTagHeader, FILE_HEADER_LEN, PREV_TAG_SIZE_LEN, TAG_HEADER_LEN};

/// Timestamp of the last complete tag, 0 if the tail cannot be trusted
pub fn recover_last_timestamp(r: &mut dyn ReadSeek) -> u32 {
    match last_tag_header(r) {
        Ok(Some(header)) => header.timestamp,
        Ok(None) => 0,
        Err(e) => {
            tracing::debug!(error = %e, "FLV tail read failed");
            0
        }
    }
}

/// Header of the tag closed by the final PreviousTagSize field
pub fn last_tag_header<R: Read + Seek + ?Sized>(r: &mut R) -> io::Result<Option<FlvTagHeader>> {
    let file_len = r.seek(SeekFrom::End(0))?;
    if file_len < PREV_TAG_SIZE_LEN as u64 {
        return Ok(None);
    }

    r.seek(SeekFrom::Start(file_len - PREV_TAG_SIZE_LEN as u64))?;
    let mut size = [0u8; PREV_TAG_SIZE_LEN];
    r.read_exact(&mut size)?;
    let tag_size = u32::from_be_bytes(size) as u64;

    if tag_size < TAG_HEADER_LEN as u64 {
        return Ok(None);
    }
    // The tag must start after the file header and PreviousTagSize0
    let min_start = (FILE_HEADER_LEN + PREV_TAG_SIZE_LEN) as u64;
    let Some(tag_start) = file_len.checked_sub(PREV_TAG_SIZE_LEN as u64 + tag_size) else {
        return Ok(None);
    };
    if tag_start < min_start {
        return Ok(None);
    }

    r.seek(SeekFrom::Start(tag_start))?;
    let mut raw = [0u8; TAG_HEADER_LEN];
    r.read_exact(&mut raw)?;

    let Some(header) = FlvTagHeader::parse(&raw) else {
        return Ok(None);
    };
    if header.data_size as u64 != tag_size - TAG_HEADER_LEN as u64 {
        return Ok(None);
    }
    Ok(Some(header))
}
