//! # Stratum Bindings
//!
//! Conversions between Rust values and the byte entries stored in Stratum
//! trees.
//!
//! Two key families share the meta tree's key space:
//!
//! - **String entries** are UTF-8 with a terminating zero byte, so they
//!   always end in `0x00`.
//! - **Integer entries** are 8-byte big-endian. The environment allocates
//!   structure ids whose low byte is never zero, so an id entry never ends
//!   in `0x00` and cannot collide with a string key.
//!
//! String decoding can optionally intern through a shared pool; the
//! strategy is chosen at construction time, never through process-global
//! state.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod integer;
mod string;

pub use error::{BindingError, BindingResult};
pub use integer::{entry_to_u64, u64_to_entry};
pub use string::{InternStrategy, StringBinding};
