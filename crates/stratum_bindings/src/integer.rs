//! Big-endian integer entries.

use crate::error::{BindingError, BindingResult};

/// Encodes `value` as an 8-byte big-endian entry.
///
/// Big-endian keeps the byte order of entries consistent with the numeric
/// order of the values, so id keys sort naturally in a tree.
#[must_use]
pub fn u64_to_entry(value: u64) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

/// Decodes an 8-byte big-endian entry.
pub fn entry_to_u64(entry: &[u8]) -> BindingResult<u64> {
    let bytes: [u8; 8] = entry.try_into().map_err(|_| BindingError::WrongLength {
        expected: 8,
        actual: entry.len(),
    })?;
    Ok(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        for value in [0u64, 1, 0xFF, 0x0100, u64::MAX] {
            assert_eq!(entry_to_u64(&u64_to_entry(value)).unwrap(), value);
        }
    }

    #[test]
    fn sorts_like_numbers() {
        let a = u64_to_entry(5);
        let b = u64_to_entry(300);
        assert!(a < b);
    }

    #[test]
    fn id_with_nonzero_low_byte_never_ends_in_zero() {
        // Structure ids are allocated so that (id & 0xff) != 0; their
        // entries therefore never end with the string terminator byte.
        for id in (1u64..2000).filter(|id| id & 0xFF != 0) {
            assert_ne!(*u64_to_entry(id).last().unwrap(), 0);
        }
    }

    #[test]
    fn wrong_length_rejected() {
        assert!(matches!(
            entry_to_u64(&[1, 2, 3]),
            Err(BindingError::WrongLength { expected: 8, actual: 3 })
        ));
    }
}
