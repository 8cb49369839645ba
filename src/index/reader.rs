//! Bitmap index reader
//!
//! Walks a key's value blocks backward from the last block, following
//! prev links to the first, and returns values in insertion order. Works
//! against a live writer: the header is trusted only when sequence ==
//! sequence check, a key entry only when count == count check; on
//! mismatch the read retries until the writer's store lands.

use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, Ordering};

use crate::index::{
    key_entry_offset, key_file_name, value_file_name, ENTRY_OFFSET_COUNT_CHECK, ENTRY_OFFSET_FIRST_BLOCK,
    ENTRY_OFFSET_LAST_BLOCK, ENTRY_OFFSET_VALUE_COUNT, KEY_ENTRY_SIZE, KEY_FILE_RESERVED, OFFSET_BLOCK_VALUE_COUNT,
    OFFSET_KEY_COUNT, OFFSET_SEQUENCE, OFFSET_SEQUENCE_CHECK, OFFSET_SIGNATURE, OFFSET_VALUE_MEM_SIZE, SIGNATURE,
    VALUE_BLOCK_RESERVED,
};
use crate::storage::GrowableMemory;
use crate::{MeridianError, Result};

/// Give an in-flight writer this many chances to finish a double write
/// before declaring the entry dead (a writer crash between the paired
/// writes leaves it permanently "in progress")
const RETRY_LIMIT: u32 = 100_000;

pub struct BitmapIndexReader {
    key_mem: GrowableMemory,
    value_mem: GrowableMemory,
    key_path: PathBuf,
    block_value_count_mod: u64,
    block_capacity: u64,
    key_count: u64,
    value_mem_size: u64,
}

impl BitmapIndexReader {
    pub fn open(dir: &Path, name: &str) -> Result<Self> {
        let key_path = dir.join(key_file_name(name));
        let key_mem = GrowableMemory::open_existing(&key_path)?;
        if key_mem.len_at_open() < KEY_FILE_RESERVED {
            return Err(corrupt(&key_path, "key file too small"));
        }
        if key_mem.get_u8(OFFSET_SIGNATURE) != SIGNATURE {
            return Err(corrupt(&key_path, "invalid signature"));
        }
        let b = key_mem.get_u32(OFFSET_BLOCK_VALUE_COUNT) as u64;
        if b == 0 || !b.is_power_of_two() {
            return Err(corrupt(&key_path, "block value count not a power of two"));
        }
        let value_mem = GrowableMemory::open_existing(&dir.join(value_file_name(name)))?;
        let mut reader = Self {
            key_mem,
            value_mem,
            key_path,
            block_value_count_mod: b - 1,
            block_capacity: b * 8 + VALUE_BLOCK_RESERVED,
            key_count: 0,
            value_mem_size: 0,
        };
        reader.read_header()?;
        Ok(reader)
    }

    pub fn key_count(&self) -> u64 {
        self.key_count
    }

    /// All values of `key` in insertion order; empty for unknown and
    /// sparse-hole keys
    pub fn values(&mut self, key: u64) -> Result<Vec<u64>> {
        self.read_header()?;
        if key >= self.key_count {
            return Ok(Vec::new());
        }

        let offset = key_entry_offset(key);
        if self.key_mem.mapped_len() < offset + KEY_ENTRY_SIZE {
            self.key_mem.refresh()?;
        }
        if self.value_mem.mapped_len() < self.value_mem_size {
            self.value_mem.refresh()?;
        }

        // count / count-check snapshot
        let mut retries = 0;
        let (count, first, last) = loop {
            let count = self.key_mem.get_u64(offset + ENTRY_OFFSET_VALUE_COUNT);
            fence(Ordering::Acquire);
            let first = self.key_mem.get_u64(offset + ENTRY_OFFSET_FIRST_BLOCK);
            let last = self.key_mem.get_u64(offset + ENTRY_OFFSET_LAST_BLOCK);
            fence(Ordering::Acquire);
            let check = self.key_mem.get_u64(offset + ENTRY_OFFSET_COUNT_CHECK);
            if count == check {
                break (count, first, last);
            }
            retries += 1;
            if retries > RETRY_LIMIT {
                return Err(corrupt(&self.key_path, "key entry never committed"));
            }
            std::hint::spin_loop();
        };

        if count == 0 {
            return Ok(Vec::new());
        }
        self.collect_backward(count, first, last)
    }

    /// Re-read the mutable header fields under the sequence protocol
    fn read_header(&mut self) -> Result<()> {
        let mut retries = 0;
        loop {
            let seq = self.key_mem.get_u64(OFFSET_SEQUENCE);
            fence(Ordering::Acquire);
            let value_mem_size = self.key_mem.get_u64(OFFSET_VALUE_MEM_SIZE);
            let key_count = self.key_mem.get_u64(OFFSET_KEY_COUNT);
            fence(Ordering::Acquire);
            let check = self.key_mem.get_u64(OFFSET_SEQUENCE_CHECK);
            if seq == check {
                self.value_mem_size = value_mem_size;
                self.key_count = key_count;
                return Ok(());
            }
            retries += 1;
            if retries > RETRY_LIMIT {
                return Err(corrupt(&self.key_path, "header never committed"));
            }
            std::hint::spin_loop();
        }
    }

    fn collect_backward(&self, count: u64, first: u64, last: u64) -> Result<Vec<u64>> {
        let mut out = vec![0u64; count as usize];
        let mut write_idx = count;
        let mut remaining = count;
        let mut block = last;
        while remaining > 0 {
            if block + self.block_capacity > self.value_mem_size {
                return Err(corrupt(&self.key_path, "value block beyond committed value memory"));
            }
            // the last block holds the count's remainder, earlier blocks
            // are full; the formula covers both
            let cells = ((remaining - 1) & self.block_value_count_mod) + 1;
            for i in (0..cells).rev() {
                write_idx -= 1;
                out[write_idx as usize] = self.value_mem.get_u64(block + i * 8);
            }
            remaining -= cells;
            if remaining > 0 {
                block = self.value_mem.get_u64(block + self.block_capacity - VALUE_BLOCK_RESERVED);
            }
        }
        if block != first {
            return Err(corrupt(&self.key_path, "block chain does not terminate at first block"));
        }
        Ok(out)
    }
}

fn corrupt(path: &Path, reason: &str) -> MeridianError {
    MeridianError::CorruptIndex { path: path.to_path_buf(), reason: reason.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::BitmapIndexWriter;
    use tempfile::tempdir;

    #[test]
    fn test_round_trip_insertion_order() {
        let dir = tempdir().unwrap();
        let mut writer = BitmapIndexWriter::open(dir.path(), "sym", 4).unwrap();
        for v in 0..11u64 {
            writer.add(3, v * 10).unwrap();
        }
        writer.add(0, 5).unwrap();
        writer.close().unwrap();

        let mut reader = BitmapIndexReader::open(dir.path(), "sym").unwrap();
        assert_eq!(reader.key_count(), 4);
        let expected: Vec<u64> = (0..11).map(|v| v * 10).collect();
        assert_eq!(reader.values(3).unwrap(), expected);
        assert_eq!(reader.values(0).unwrap(), vec![5]);
        assert_eq!(reader.values(1).unwrap(), Vec::<u64>::new());
        assert_eq!(reader.values(99).unwrap(), Vec::<u64>::new());
    }

    #[test]
    fn test_reads_interleaved_with_live_writer() {
        let dir = tempdir().unwrap();
        let mut writer = BitmapIndexWriter::open(dir.path(), "sym", 2).unwrap();
        writer.add(0, 1).unwrap();

        let mut reader = BitmapIndexReader::open(dir.path(), "sym").unwrap();
        assert_eq!(reader.values(0).unwrap(), vec![1]);

        // keep appending past several block boundaries while the reader
        // stays open
        for v in 2..=9u64 {
            writer.add(0, v).unwrap();
            let observed = reader.values(0).unwrap();
            assert_eq!(observed, (1..=v).collect::<Vec<_>>());
        }
        writer.close().unwrap();
    }

    #[test]
    fn test_backward_chain_matches_committed_count() {
        // invariant: a committed count of n yields exactly n values and
        // the chain ends at the first block
        let dir = tempdir().unwrap();
        let mut writer = BitmapIndexWriter::open(dir.path(), "sym", 2).unwrap();
        for v in 100..107u64 {
            writer.add(1, v).unwrap();
        }
        writer.close().unwrap();

        let mut reader = BitmapIndexReader::open(dir.path(), "sym").unwrap();
        let values = reader.values(1).unwrap();
        assert_eq!(values.len(), 7);
        assert_eq!(*values.last().unwrap(), 106);
    }
}
