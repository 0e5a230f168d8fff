//! In-memory backend for tests and ephemeral environments.

use crate::backend::LogBackend;
use crate::error::{LogError, LogResult};
use parking_lot::RwLock;

/// A byte store held entirely in memory.
///
/// Suitable for unit tests and environments that do not need persistence.
/// Data is lost when the backend is dropped.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    data: RwLock<Vec<u8>>,
}

impl MemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend preloaded with `data`.
    ///
    /// Useful for reopen and recovery tests.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(data),
        }
    }

    /// Returns a copy of the current contents.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.read().clone()
    }
}

impl LogBackend for MemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> LogResult<Vec<u8>> {
        let data = self.data.read();
        let size = data.len() as u64;
        let start = offset as usize;
        let end = start.saturating_add(len);

        if offset > size || end > data.len() {
            return Err(LogError::ReadPastEnd { offset, len, size });
        }

        Ok(data[start..end].to_vec())
    }

    fn append(&mut self, new_data: &[u8]) -> LogResult<u64> {
        let mut data = self.data.write();
        let offset = data.len() as u64;
        data.extend_from_slice(new_data);
        Ok(offset)
    }

    fn flush(&mut self) -> LogResult<()> {
        Ok(())
    }

    fn len(&self) -> LogResult<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn truncate(&mut self, new_len: u64) -> LogResult<()> {
        let mut data = self.data.write();
        if new_len > data.len() as u64 {
            return Err(LogError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!(
                    "cannot truncate to {} past current size {}",
                    new_len,
                    data.len()
                ),
            )));
        }
        data.truncate(new_len as usize);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_is_empty() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.len().unwrap(), 0);
        assert!(backend.is_empty().unwrap());
    }

    #[test]
    fn append_returns_offsets() {
        let mut backend = MemoryBackend::new();
        assert_eq!(backend.append(b"hello").unwrap(), 0);
        assert_eq!(backend.append(b" world").unwrap(), 5);
        assert_eq!(backend.len().unwrap(), 11);
    }

    #[test]
    fn read_at_returns_written_bytes() {
        let mut backend = MemoryBackend::new();
        backend.append(b"hello world").unwrap();
        assert_eq!(backend.read_at(0, 5).unwrap(), b"hello");
        assert_eq!(backend.read_at(6, 5).unwrap(), b"world");
    }

    #[test]
    fn read_past_end_fails() {
        let mut backend = MemoryBackend::new();
        backend.append(b"hello").unwrap();
        assert!(matches!(
            backend.read_at(3, 10),
            Err(LogError::ReadPastEnd { .. })
        ));
    }

    #[test]
    fn truncate_discards_tail() {
        let mut backend = MemoryBackend::new();
        backend.append(b"hello world").unwrap();
        backend.truncate(5).unwrap();
        assert_eq!(backend.len().unwrap(), 5);
        assert_eq!(backend.read_at(0, 5).unwrap(), b"hello");
    }

    #[test]
    fn truncate_past_end_fails() {
        let mut backend = MemoryBackend::new();
        backend.append(b"hi").unwrap();
        assert!(backend.truncate(100).is_err());
    }

    #[test]
    fn with_data_preloads() {
        let backend = MemoryBackend::with_data(b"seed".to_vec());
        assert_eq!(backend.len().unwrap(), 4);
        assert_eq!(backend.read_at(0, 4).unwrap(), b"seed");
    }
}
