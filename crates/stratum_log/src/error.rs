//! Error types for log operations.

use std::io;
use thiserror::Error;

/// Result type for log operations.
pub type LogResult<T> = Result<T, LogError>;

/// Errors that can occur in the log layer.
#[derive(Debug, Error)]
pub enum LogError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of the store.
    #[error("read beyond end of store: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current store size.
        size: u64,
    },

    /// A record failed its integrity check.
    #[error("corrupt record at address {address}: {message}")]
    Corrupt {
        /// Address of the offending record.
        address: u64,
        /// Description of the corruption.
        message: String,
    },

    /// The log has been closed.
    #[error("log is closed")]
    Closed,
}

impl LogError {
    /// Creates a corruption error.
    pub fn corrupt(address: u64, message: impl Into<String>) -> Self {
        Self::Corrupt {
            address,
            message: message.into(),
        }
    }
}
