//! Error types for the environment core.

use stratum_bindings::BindingError;
use stratum_log::LogError;
use thiserror::Error;

/// Result type for environment operations.
pub type EnvResult<T> = Result<T, EnvError>;

/// Errors raised by the environment core.
///
/// A stale snapshot is never an error: `flush()` reports it as `Ok(false)`
/// so executor combinators can revert and retry.
#[derive(Debug, Error)]
pub enum EnvError {
    /// The named store does not exist.
    #[error("no such store: '{name}'")]
    NoSuchStore {
        /// Name of the missing store.
        name: String,
    },

    /// An existing store was opened with an incompatible configuration.
    #[error("store '{name}' configuration mismatch: {message}")]
    ConfigMismatch {
        /// Name of the store.
        name: String,
        /// Description of the mismatch.
        message: String,
    },

    /// A new store was requested without a transaction to create it in.
    #[error("transaction required to create a new store")]
    NoTransaction,

    /// A commit failed and its rollback failed too; the environment can no
    /// longer guarantee consistency and refuses all further work.
    #[error("environment is inoperative: {cause}")]
    Inoperative {
        /// The failure that latched the environment.
        cause: String,
    },

    /// The environment has been closed.
    #[error("environment is closed")]
    Closed,

    /// Close or clear was requested while transactions are live.
    #[error("environment is active: {count} transaction(s) not finished")]
    Active {
        /// Number of unfinished transactions.
        count: usize,
    },

    /// A commit could not be applied; the log was rolled back and the
    /// environment remains operative.
    #[error("failed to flush transaction: {message}")]
    TransactionFailed {
        /// Description of the failure.
        message: String,
    },

    /// An operation was attempted on a flushed or aborted transaction.
    #[error("transaction is already finished")]
    TransactionFinished,

    /// A write was attempted through a read-only transaction.
    #[error("transaction is read-only")]
    Readonly,

    /// Another process holds the environment location.
    #[error("environment location is locked by another process")]
    Locked,

    /// A configuration value could not be parsed.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Description of the offending setting.
        message: String,
    },

    /// An error surfaced from the log layer.
    #[error("log error: {0}")]
    Log(#[from] LogError),

    /// An error surfaced from the bindings layer.
    #[error("binding error: {0}")]
    Binding(#[from] BindingError),
}

impl EnvError {
    /// Creates a missing-store error.
    pub fn no_such_store(name: impl Into<String>) -> Self {
        Self::NoSuchStore { name: name.into() }
    }

    /// Creates a store configuration mismatch error.
    pub fn config_mismatch(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigMismatch {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Creates an inoperative-environment error.
    pub fn inoperative(cause: impl Into<String>) -> Self {
        Self::Inoperative {
            cause: cause.into(),
        }
    }

    /// Creates a flush-failure error.
    pub fn transaction_failed(message: impl Into<String>) -> Self {
        Self::TransactionFailed {
            message: message.into(),
        }
    }

    /// Creates an invalid-configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}
