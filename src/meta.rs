//! Metadata records queued through the index, and the integer-key fast path.

/// Locator for the latest value of a key inside the store's data files.
///
/// The index never interprets the fields; it flushes the record as a byte
/// block and hands it to the backing tree verbatim. Fixed layout so the
/// flushed size is known at compile time.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexMeta {
    pub file_number: u32,
    pub offset: u64,
    pub size: u64,
}

impl IndexMeta {
    pub fn new(file_number: u32, offset: u64, size: u64) -> Self {
        Self {
            file_number,
            offset,
            size,
        }
    }
}

/// One pending index operation.
///
/// `prev_file_number == 0` selects an unconditional insert; any other value
/// makes the operation a conditional update that the backing tree applies
/// only while the indexed entry still references that file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyAndMeta {
    pub key: u32,
    pub prev_file_number: u32,
    pub meta: IndexMeta,
}

impl KeyAndMeta {
    pub fn insert(key: u32, meta: IndexMeta) -> Self {
        Self {
            key,
            prev_file_number: 0,
            meta,
        }
    }

    pub fn update(key: u32, prev_file_number: u32, meta: IndexMeta) -> Self {
        Self {
            key,
            prev_file_number,
            meta,
        }
    }
}

/// Parses the leading ASCII decimal digits of `bytes` as a u32.
///
/// Stops at the first non-digit, so key payloads may carry a suffix. No
/// digits parses to 0. Values past `u32::MAX` saturate, degrading an
/// oversized key to a miss instead of aliasing a small one.
pub fn parse_key_prefix(bytes: &[u8]) -> u32 {
    let mut value: u32 = 0;
    for &b in bytes {
        if !b.is_ascii_digit() {
            break;
        }
        value = match value
            .checked_mul(10)
            .and_then(|v| v.checked_add(u32::from(b - b'0')))
        {
            Some(v) => v,
            None => return u32::MAX,
        };
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digits_with_suffix_stop_at_first_non_digit() {
        assert_eq!(parse_key_prefix(b"12345xyz"), 12345);
        assert_eq!(parse_key_prefix(b"42"), 42);
    }

    #[test]
    fn no_digits_parse_to_zero() {
        assert_eq!(parse_key_prefix(b""), 0);
        assert_eq!(parse_key_prefix(b"abc"), 0);
        assert_eq!(parse_key_prefix(b"-1"), 0);
        assert_eq!(parse_key_prefix(b" 7"), 0);
    }

    #[test]
    fn leading_zeros_are_plain_decimal() {
        assert_eq!(parse_key_prefix(b"007"), 7);
        assert_eq!(parse_key_prefix(b"000"), 0);
    }

    #[test]
    fn overflow_saturates() {
        assert_eq!(parse_key_prefix(b"4294967295"), u32::MAX);
        assert_eq!(parse_key_prefix(b"4294967296"), u32::MAX);
        assert_eq!(parse_key_prefix(b"99999999999999"), u32::MAX);
    }

    #[test]
    fn operation_kind_follows_prev_file_number() {
        let meta = IndexMeta::new(7, 0, 128);
        assert_eq!(KeyAndMeta::insert(1, meta).prev_file_number, 0);
        assert_eq!(KeyAndMeta::update(1, 7, meta).prev_file_number, 7);
    }
}
