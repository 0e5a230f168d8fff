//! File-based backend for persistent storage.

use crate::backend::LogBackend;
use crate::error::{LogError, LogResult};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A byte store backed by a single file.
///
/// The file is opened for reading and appending and grows monotonically
/// except through [`LogBackend::truncate`], which only the rollback and
/// clear paths use.
///
/// `flush` calls `sync_data`, so data acknowledged by the log survives
/// process termination.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    file: Mutex<File>,
    size: Mutex<u64>,
}

impl FileBackend {
    /// Opens or creates a file backend at `path`.
    pub fn open(path: &Path) -> LogResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let size = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            size: Mutex::new(size),
        })
    }

    /// Opens a file backend, creating parent directories as needed.
    pub fn open_with_create_dirs(path: &Path) -> LogResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open(path)
    }

    /// Returns the path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> LogResult<Vec<u8>> {
        let size = *self.size.lock();
        let end = offset.saturating_add(len as u64);
        if offset > size || end > size {
            return Err(LogError::ReadPastEnd { offset, len, size });
        }
        if len == 0 {
            return Ok(Vec::new());
        }

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    fn append(&mut self, data: &[u8]) -> LogResult<u64> {
        let mut file = self.file.lock();
        let mut size = self.size.lock();

        let offset = *size;
        if !data.is_empty() {
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(data)?;
            *size += data.len() as u64;
        }
        Ok(offset)
    }

    fn flush(&mut self) -> LogResult<()> {
        let file = self.file.lock();
        file.sync_data()?;
        Ok(())
    }

    fn len(&self) -> LogResult<u64> {
        Ok(*self.size.lock())
    }

    fn truncate(&mut self, new_len: u64) -> LogResult<()> {
        let file = self.file.lock();
        let mut size = self.size.lock();

        if new_len > *size {
            return Err(LogError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("cannot truncate to {} past current size {}", new_len, *size),
            )));
        }
        file.set_len(new_len)?;
        file.sync_data()?;
        *size = new_len;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_and_read_back() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("data.log")).unwrap();

        let offset = backend.append(b"durable bytes").unwrap();
        assert_eq!(offset, 0);
        assert_eq!(backend.read_at(0, 13).unwrap(), b"durable bytes");
    }

    #[test]
    fn size_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.log");

        {
            let mut backend = FileBackend::open(&path).unwrap();
            backend.append(b"persisted").unwrap();
            backend.flush().unwrap();
        }

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.len().unwrap(), 9);
        assert_eq!(backend.read_at(0, 9).unwrap(), b"persisted");
    }

    #[test]
    fn truncate_shrinks_file() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("data.log")).unwrap();
        backend.append(b"hello world").unwrap();
        backend.truncate(5).unwrap();
        assert_eq!(backend.len().unwrap(), 5);
        assert!(backend.read_at(5, 1).is_err());
    }

    #[test]
    fn create_dirs_builds_parents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("data.log");
        let backend = FileBackend::open_with_create_dirs(&path).unwrap();
        assert_eq!(backend.len().unwrap(), 0);
    }
}
