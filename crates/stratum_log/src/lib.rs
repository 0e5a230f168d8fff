//! # Stratum Log
//!
//! Append-only record log for the Stratum storage engine.
//!
//! The log is a sequence of addressable, checksummed records ("loggables")
//! written over an opaque byte-store backend. It exposes the contract the
//! environment core builds on:
//!
//! - `append` is durable before it returns
//! - `high_address` is one past the last durable byte and only ever moves
//!   backwards through `set_high_address` (post-failure rollback)
//! - records are never rewritten in place; space is reclaimed only by the
//!   garbage collector once no live snapshot depends on it
//!
//! ## Backends
//!
//! - [`MemoryBackend`] - for tests and ephemeral environments
//! - [`FileBackend`] - persistent single-file storage
//! - [`FaultBackend`] - wrapper that injects failures on demand

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod fault;
mod file;
mod log;
mod memory;

pub use backend::LogBackend;
pub use error::{LogError, LogResult};
pub use fault::{FaultBackend, FaultPlan};
pub use file::FileBackend;
pub use log::{compute_crc32, Log, LogIterator, Loggable, LOGGABLE_HEADER_SIZE};
pub use memory::MemoryBackend;
