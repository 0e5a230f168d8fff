//! Error types for entry bindings.

use thiserror::Error;

/// Result type for binding operations.
pub type BindingResult<T> = Result<T, BindingError>;

/// Errors raised when an entry cannot be decoded.
#[derive(Debug, Error)]
pub enum BindingError {
    /// A string entry did not end with the zero terminator.
    #[error("string entry is missing its zero terminator")]
    MissingTerminator,

    /// A string entry contained invalid UTF-8.
    #[error("string entry is not valid UTF-8")]
    InvalidUtf8,

    /// An integer entry had the wrong length.
    #[error("integer entry has length {actual}, expected {expected}")]
    WrongLength {
        /// Expected entry length in bytes.
        expected: usize,
        /// Actual entry length in bytes.
        actual: usize,
    },
}
