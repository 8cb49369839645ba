//! Bitmap index - two-file (key, value) inverted index
//!
//! Key file layout:
//! ```text
//! +--------------------------------------------------+
//! | Header (64 bytes reserved)                       |
//! |   - signature: u8, 7 bytes padding               |
//! |   - sequence: u64                                |
//! |   - value memory size: u64                       |
//! |   - block value count: u32, 4 bytes padding      |
//! |   - key count: u64                               |
//! |   - sequence check: u64                          |
//! |   - padding to 64 bytes                          |
//! +--------------------------------------------------+
//! | Key entries (32 bytes each)                      |
//! |   - value count: u64                             |
//! |   - first value block offset: u64                |
//! |   - last value block offset: u64                 |
//! |   - value count check: u64                       |
//! +--------------------------------------------------+
//! ```
//!
//! The value file is a run of blocks of `B * 8 + 16` bytes: B values
//! followed by the previous- and next-block offsets. Readers trust a
//! header only when sequence == sequence check, and a key entry only
//! when value count == value count check; a mismatch means a write is in
//! flight and the read retries.

pub mod reader;
pub mod writer;

pub use reader::BitmapIndexReader;
pub use writer::BitmapIndexWriter;

/// Key file signature byte
pub const SIGNATURE: u8 = b'M';
/// Reserved header bytes at the head of the key file
pub const KEY_FILE_RESERVED: u64 = 64;
/// Bytes per key entry
pub const KEY_ENTRY_SIZE: u64 = 32;
/// Link bytes at the tail of each value block (prev, next)
pub const VALUE_BLOCK_RESERVED: u64 = 16;

pub(crate) const OFFSET_SIGNATURE: u64 = 0;
pub(crate) const OFFSET_SEQUENCE: u64 = 8;
pub(crate) const OFFSET_VALUE_MEM_SIZE: u64 = 16;
pub(crate) const OFFSET_BLOCK_VALUE_COUNT: u64 = 24;
pub(crate) const OFFSET_KEY_COUNT: u64 = 32;
pub(crate) const OFFSET_SEQUENCE_CHECK: u64 = 40;

pub(crate) const ENTRY_OFFSET_VALUE_COUNT: u64 = 0;
pub(crate) const ENTRY_OFFSET_FIRST_BLOCK: u64 = 8;
pub(crate) const ENTRY_OFFSET_LAST_BLOCK: u64 = 16;
pub(crate) const ENTRY_OFFSET_COUNT_CHECK: u64 = 24;

/// Byte offset of a key's entry in the key file
#[inline]
pub(crate) fn key_entry_offset(key: u64) -> u64 {
    KEY_FILE_RESERVED + key * KEY_ENTRY_SIZE
}

pub(crate) fn key_file_name(name: &str) -> String {
    format!("{name}.k")
}

pub(crate) fn value_file_name(name: &str) -> String {
    format!("{name}.v")
}

/// Map a 4-byte symbol id to its index key; the null symbol (-1) lands
/// on key 0
#[inline]
pub fn to_index_key(symbol: i32) -> u64 {
    (symbol + 1) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_key_mapping() {
        assert_eq!(to_index_key(-1), 0);
        assert_eq!(to_index_key(0), 1);
        assert_eq!(to_index_key(41), 42);
    }

    #[test]
    fn test_key_entry_offsets() {
        assert_eq!(key_entry_offset(0), 64);
        assert_eq!(key_entry_offset(5), 64 + 5 * 32);
    }
}
