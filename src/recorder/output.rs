//! Buffered output file with position tracking and in-place patching

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt, BufWriter};

use crate::error::{RecordError, Result};

const WRITE_BUFFER: usize = 64 * 1024;

/// Output file owned by one recorder
pub struct OutputFile {
    path: PathBuf,
    writer: BufWriter<File>,
    position: u64,
}

impl OutputFile {
    /// Create or truncate `path`, creating parent directories
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        ensure_parent(path).await?;
        let file = File::create(path)
            .await
            .map_err(|e| RecordError::io(path, e))?;
        Ok(Self::wrap(path, file, 0))
    }

    /// Open `path` for writing at its end, creating it if missing
    pub async fn append(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        ensure_parent(path).await?;
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .await
            .map_err(|e| RecordError::io(path, e))?;
        let position = file
            .seek(SeekFrom::End(0))
            .await
            .map_err(|e| RecordError::io(path, e))?;
        Ok(Self::wrap(path, file, position))
    }

    /// Open an existing file, discard everything after `offset` and continue
    /// writing there
    pub async fn resume_at(path: impl AsRef<Path>, offset: u64) -> Result<Self> {
        let path = path.as_ref();
        let mut file = OpenOptions::new()
            .write(true)
            .open(path)
            .await
            .map_err(|e| RecordError::io(path, e))?;
        file.set_len(offset)
            .await
            .map_err(|e| RecordError::io(path, e))?;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| RecordError::io(path, e))?;
        Ok(Self::wrap(path, file, offset))
    }

    fn wrap(path: &Path, file: File, position: u64) -> Self {
        Self {
            path: path.to_path_buf(),
            writer: BufWriter::with_capacity(WRITE_BUFFER, file),
            position,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset the next write lands at
    pub fn position(&self) -> u64 {
        self.position
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.writer
            .write_all(data)
            .await
            .map_err(|e| RecordError::io(&self.path, e))?;
        self.position += data.len() as u64;
        Ok(())
    }

    /// Overwrite bytes at `offset`, then continue at the end
    pub async fn patch(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let path = &self.path;
        self.writer.flush().await.map_err(|e| RecordError::io(path, e))?;
        let file = self.writer.get_mut();
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| RecordError::io(path, e))?;
        file.write_all(data).await.map_err(|e| RecordError::io(path, e))?;
        file.seek(SeekFrom::Start(self.position))
            .await
            .map_err(|e| RecordError::io(path, e))?;
        Ok(())
    }

    /// Flush and sync; returns the final size
    pub async fn finish(mut self) -> Result<u64> {
        let path = &self.path;
        self.writer.flush().await.map_err(|e| RecordError::io(path, e))?;
        self.writer
            .get_mut()
            .sync_all()
            .await
            .map_err(|e| RecordError::io(path, e))?;
        Ok(self.position)
    }
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| RecordError::io(parent, e))?;
    }
    Ok(())
}

/// Size of `path`, 0 when missing
pub async fn existing_len(path: &Path) -> u64 {
    fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}
