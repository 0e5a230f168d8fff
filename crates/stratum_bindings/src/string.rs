//! Zero-terminated string entries with optional interning.

use crate::error::{BindingError, BindingResult};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

/// How decoded strings are deduplicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InternStrategy {
    /// Every decode allocates a fresh string.
    #[default]
    None,
    /// Decoded strings are deduplicated through a shared pool, so repeated
    /// keys share one allocation.
    Pooled,
}

/// Encoder/decoder for string entries.
///
/// The encoded form is the string's UTF-8 bytes followed by a single zero
/// terminator. An embedded NUL character is escaped as the overlong pair
/// `0xC0 0x80` so the terminator is the only zero byte in the entry; this
/// keeps string keys distinguishable from 8-byte id keys, which never end
/// in zero.
///
/// The interning strategy is fixed at construction. An environment builds
/// one binding from its configuration and hands it out to callers.
#[derive(Debug)]
pub struct StringBinding {
    strategy: InternStrategy,
    pool: Mutex<HashSet<Arc<str>>>,
}

impl StringBinding {
    /// Creates a binding with the given interning strategy.
    #[must_use]
    pub fn new(strategy: InternStrategy) -> Self {
        Self {
            strategy,
            pool: Mutex::new(HashSet::new()),
        }
    }

    /// Returns the configured strategy.
    #[must_use]
    pub fn strategy(&self) -> InternStrategy {
        self.strategy
    }

    /// Encodes `value` as a zero-terminated entry.
    #[must_use]
    pub fn string_to_entry(&self, value: &str) -> Vec<u8> {
        let mut entry = Vec::with_capacity(value.len() + 1);
        for byte in value.bytes() {
            if byte == 0 {
                entry.extend_from_slice(&[0xC0, 0x80]);
            } else {
                entry.push(byte);
            }
        }
        entry.push(0);
        entry
    }

    /// Decodes a zero-terminated entry.
    pub fn entry_to_string(&self, entry: &[u8]) -> BindingResult<Arc<str>> {
        let (&last, body) = entry.split_last().ok_or(BindingError::MissingTerminator)?;
        if last != 0 {
            return Err(BindingError::MissingTerminator);
        }

        let decoded = if body.contains(&0xC0) {
            let mut bytes = Vec::with_capacity(body.len());
            let mut i = 0;
            while i < body.len() {
                if body[i] == 0xC0 && body.get(i + 1) == Some(&0x80) {
                    bytes.push(0);
                    i += 2;
                } else {
                    bytes.push(body[i]);
                    i += 1;
                }
            }
            String::from_utf8(bytes).map_err(|_| BindingError::InvalidUtf8)?
        } else {
            std::str::from_utf8(body)
                .map_err(|_| BindingError::InvalidUtf8)?
                .to_owned()
        };

        Ok(self.resolve(decoded))
    }

    fn resolve(&self, decoded: String) -> Arc<str> {
        match self.strategy {
            InternStrategy::None => Arc::from(decoded),
            InternStrategy::Pooled => {
                let mut pool = self.pool.lock();
                if let Some(existing) = pool.get(decoded.as_str()) {
                    return Arc::clone(existing);
                }
                let shared: Arc<str> = Arc::from(decoded);
                pool.insert(Arc::clone(&shared));
                shared
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain() -> StringBinding {
        StringBinding::new(InternStrategy::None)
    }

    #[test]
    fn round_trip_simple() {
        let binding = plain();
        let entry = binding.string_to_entry("users");
        assert_eq!(&*binding.entry_to_string(&entry).unwrap(), "users");
    }

    #[test]
    fn round_trip_empty() {
        let binding = plain();
        let entry = binding.string_to_entry("");
        assert_eq!(entry, vec![0]);
        assert_eq!(&*binding.entry_to_string(&entry).unwrap(), "");
    }

    #[test]
    fn round_trip_unicode() {
        let binding = plain();
        for value in ["héllo", "日本語", "emoji 🚀", "mixed\tws\n"] {
            let entry = binding.string_to_entry(value);
            assert_eq!(&*binding.entry_to_string(&entry).unwrap(), value);
        }
    }

    #[test]
    fn entries_end_in_zero() {
        let binding = plain();
        for value in ["", "a", "store-name", "日本"] {
            assert_eq!(*binding.string_to_entry(value).last().unwrap(), 0);
        }
    }

    #[test]
    fn embedded_nul_is_escaped() {
        let binding = plain();
        let value = "a\0b";
        let entry = binding.string_to_entry(value);
        // Only the terminator is a zero byte.
        assert_eq!(entry.iter().filter(|&&b| b == 0).count(), 1);
        assert_eq!(&*binding.entry_to_string(&entry).unwrap(), value);
    }

    #[test]
    fn missing_terminator_rejected() {
        let binding = plain();
        assert!(matches!(
            binding.entry_to_string(b"abc"),
            Err(BindingError::MissingTerminator)
        ));
        assert!(matches!(
            binding.entry_to_string(b""),
            Err(BindingError::MissingTerminator)
        ));
    }

    #[test]
    fn invalid_utf8_rejected() {
        let binding = plain();
        assert!(matches!(
            binding.entry_to_string(&[0xFF, 0xFE, 0]),
            Err(BindingError::InvalidUtf8)
        ));
    }

    #[test]
    fn pooled_decoding_shares_allocations() {
        let binding = StringBinding::new(InternStrategy::Pooled);
        let entry = binding.string_to_entry("shared");
        let a = binding.entry_to_string(&entry).unwrap();
        let b = binding.entry_to_string(&entry).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn unpooled_decoding_does_not_share() {
        let binding = plain();
        let entry = binding.string_to_entry("fresh");
        let a = binding.entry_to_string(&entry).unwrap();
        let b = binding.entry_to_string(&entry).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
