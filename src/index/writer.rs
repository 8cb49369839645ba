//! Bitmap index writer
//!
//! Appends (key, rowId) pairs. Single-threaded per index instance;
//! visibility to concurrent readers is governed by the
//! sequence/sequence-check and count/count-check double writes with
//! store fences between them. A reader that observes mismatched pairs
//! retries; it never trusts intervening data.

use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, Ordering};

use crate::config::EngineConfig;
use crate::index::{
    key_entry_offset, key_file_name, value_file_name, ENTRY_OFFSET_COUNT_CHECK, ENTRY_OFFSET_FIRST_BLOCK,
    ENTRY_OFFSET_LAST_BLOCK, ENTRY_OFFSET_VALUE_COUNT, KEY_ENTRY_SIZE, KEY_FILE_RESERVED, OFFSET_BLOCK_VALUE_COUNT,
    OFFSET_KEY_COUNT, OFFSET_SEQUENCE, OFFSET_SEQUENCE_CHECK, OFFSET_SIGNATURE, OFFSET_VALUE_MEM_SIZE, SIGNATURE,
    VALUE_BLOCK_RESERVED,
};
use crate::storage::GrowableMemory;
use crate::{MeridianError, Result};

pub struct BitmapIndexWriter {
    key_mem: GrowableMemory,
    value_mem: GrowableMemory,
    key_path: PathBuf,
    /// `B - 1`; value cell index within a block is `count & mod`
    block_value_count_mod: u64,
    /// `B * 8 + 16`
    block_capacity: u64,
    value_mem_size: u64,
    key_count: u64,
}

impl BitmapIndexWriter {
    /// Open the index `<name>.k` / `<name>.v` under `dir`, initializing
    /// fresh files with `block_value_count` values per block. An existing
    /// index keeps its own block value count.
    pub fn open(dir: &Path, name: &str, block_value_count: u64) -> Result<Self> {
        Self::open_with_growth(dir, name, block_value_count, EngineConfig::default().map_growth_granularity)
    }

    pub fn open_with_growth(dir: &Path, name: &str, block_value_count: u64, growth: u64) -> Result<Self> {
        debug_assert!(block_value_count.is_power_of_two());
        let key_path = dir.join(key_file_name(name));
        let exists = key_path.exists();
        let mut key_mem = GrowableMemory::open(&key_path, growth)?;
        if !exists {
            init_key_memory(&mut key_mem, block_value_count);
        }

        let key_file_len = if exists { key_mem.len_at_open() } else { KEY_FILE_RESERVED };
        if key_file_len < KEY_FILE_RESERVED {
            return Err(corrupt(&key_path, "key file too small"));
        }
        if key_mem.get_u8(OFFSET_SIGNATURE) != SIGNATURE {
            return Err(corrupt(&key_path, "invalid signature"));
        }
        let key_count = key_mem.get_u64(OFFSET_KEY_COUNT);
        if key_file_len < key_count * KEY_ENTRY_SIZE + KEY_FILE_RESERVED {
            return Err(corrupt(&key_path, "truncated key file"));
        }
        let value_mem_size = key_mem.get_u64(OFFSET_VALUE_MEM_SIZE);

        let value_path = dir.join(value_file_name(name));
        let value_mem = GrowableMemory::open(&value_path, growth)?;
        if exists && value_mem.len_at_open() < value_mem_size {
            return Err(corrupt(&value_path, "truncated value file"));
        }

        let b = key_mem.get_u32(OFFSET_BLOCK_VALUE_COUNT) as u64;
        if b == 0 || !b.is_power_of_two() {
            return Err(corrupt(&key_path, "block value count not a power of two"));
        }

        Ok(Self {
            key_mem,
            value_mem,
            key_path,
            block_value_count_mod: b - 1,
            block_capacity: b * 8 + VALUE_BLOCK_RESERVED,
            value_mem_size,
            key_count,
        })
    }

    /// Append `value` to `key`'s list
    pub fn add(&mut self, key: u64, value: u64) -> Result<()> {
        let offset = key_entry_offset(key);
        if key < self.key_count {
            let value_block_offset = self.key_mem.get_u64(offset + ENTRY_OFFSET_LAST_BLOCK);
            let value_count = self.key_mem.get_u64(offset + ENTRY_OFFSET_VALUE_COUNT);
            let cell = value_count & self.block_value_count_mod;
            if cell > 0 {
                // last block has room
                self.append_value(offset, value_block_offset, value_count, cell, value)
            } else if value_count == 0 {
                // hole left behind by a sparse key
                self.init_value_block_and_store(offset, value)
            } else {
                // last block is full
                self.add_value_block_and_store(offset, value_block_offset, value_count, value)
            }
        } else {
            // new key; entries skipped over by a sparse key set stay
            // zero-filled
            self.key_mem.ensure(offset + KEY_ENTRY_SIZE)?;
            self.init_value_block_and_store(offset, value)?;
            self.update_key_count(key);
            Ok(())
        }
    }

    pub fn key_count(&self) -> u64 {
        self.key_count
    }

    pub fn value_mem_size(&self) -> u64 {
        self.value_mem_size
    }

    /// Cut both files to their logical sizes and release the mappings
    pub fn close(mut self) -> Result<()> {
        log::debug!("closing index {}, {} keys", self.key_path.display(), self.key_count);
        let key_len = self.key_count * KEY_ENTRY_SIZE + KEY_FILE_RESERVED;
        self.key_mem.truncate(key_len)?;
        self.value_mem.truncate(self.value_mem_size)?;
        Ok(())
    }

    /// Scenario: room left in the last block. Store the value, then bump
    /// count and count check; readers act on whichever matched pair they
    /// observe, and nothing between the two writes changed.
    fn append_value(&mut self, offset: u64, block_offset: u64, value_count: u64, cell: u64, value: u64) -> Result<()> {
        self.value_mem.put_u64(block_offset + cell * 8, value);
        self.key_mem.put_u64(offset + ENTRY_OFFSET_VALUE_COUNT, value_count + 1);
        self.key_mem.put_u64(offset + ENTRY_OFFSET_COUNT_CHECK, value_count + 1);
        Ok(())
    }

    /// Scenario: fresh key (or sparse hole). Allocate the first block,
    /// then commit the entry: count, both block offsets, count check,
    /// fenced so readers never see a half-written entry as committed.
    fn init_value_block_and_store(&mut self, offset: u64, value: u64) -> Result<()> {
        let new_block_offset = self.allocate_value_block_and_store(value)?;

        self.key_mem.put_u64(offset + ENTRY_OFFSET_VALUE_COUNT, 1);
        fence(Ordering::Release);
        self.key_mem.put_u64(offset + ENTRY_OFFSET_FIRST_BLOCK, new_block_offset);
        self.key_mem.put_u64(offset + ENTRY_OFFSET_LAST_BLOCK, new_block_offset);
        fence(Ordering::Release);
        self.key_mem.put_u64(offset + ENTRY_OFFSET_COUNT_CHECK, 1);
        fence(Ordering::Release);
        Ok(())
    }

    /// Scenario: last block full. Allocate a new block and link it in
    /// before the count bump - a reader that observes the new last block
    /// offset must find a well-linked predecessor.
    fn add_value_block_and_store(&mut self, offset: u64, last_block_offset: u64, value_count: u64, value: u64) -> Result<()> {
        let new_block_offset = self.allocate_value_block_and_store(value)?;

        // previous link on the new block first, then the next link on
        // the old block
        self.value_mem.put_u64(new_block_offset + self.block_capacity - VALUE_BLOCK_RESERVED, last_block_offset);
        self.value_mem.put_u64(last_block_offset + self.block_capacity - VALUE_BLOCK_RESERVED + 8, new_block_offset);

        self.key_mem.put_u64(offset + ENTRY_OFFSET_VALUE_COUNT, value_count + 1);
        fence(Ordering::Release);
        // first block offset was set when the key was created
        self.key_mem.put_u64(offset + ENTRY_OFFSET_LAST_BLOCK, new_block_offset);
        fence(Ordering::Release);
        self.key_mem.put_u64(offset + ENTRY_OFFSET_COUNT_CHECK, value_count + 1);
        fence(Ordering::Release);
        Ok(())
    }

    /// Reserve one block at the tail of the value memory, publish the
    /// new value memory size in the key header, and store the first
    /// value at the block's start
    fn allocate_value_block_and_store(&mut self, value: u64) -> Result<u64> {
        let new_block_offset = self.value_mem_size;
        self.value_mem_size += self.block_capacity;

        let new_size = self.value_mem_size;
        self.commit_header(|mem| mem.put_u64(OFFSET_VALUE_MEM_SIZE, new_size));

        self.value_mem.ensure(new_block_offset + self.block_capacity)?;
        self.value_mem.put_u64(new_block_offset, value);
        Ok(new_block_offset)
    }

    fn update_key_count(&mut self, key: u64) {
        // the key set may be sparse; jump, not increment
        self.key_count = key + 1;
        let key_count = self.key_count;
        self.commit_header(|mem| mem.put_u64(OFFSET_KEY_COUNT, key_count));
    }

    /// Header mutation under the sequence protocol: bump the sequence,
    /// fence, apply, fence, match the sequence check
    fn commit_header<F: FnOnce(&mut GrowableMemory)>(&mut self, mutate: F) {
        let seq = self.key_mem.get_u64(OFFSET_SEQUENCE) + 1;
        self.key_mem.put_u64(OFFSET_SEQUENCE, seq);
        fence(Ordering::Release);
        mutate(&mut self.key_mem);
        fence(Ordering::Release);
        self.key_mem.put_u64(OFFSET_SEQUENCE_CHECK, seq);
    }

    #[cfg(test)]
    pub(crate) fn key_path(&self) -> &Path {
        &self.key_path
    }
}

fn init_key_memory(key_mem: &mut GrowableMemory, block_value_count: u64) {
    key_mem.put_u8(OFFSET_SIGNATURE, SIGNATURE);
    key_mem.put_u64(OFFSET_SEQUENCE, 1);
    fence(Ordering::Release);
    key_mem.put_u64(OFFSET_VALUE_MEM_SIZE, 0);
    key_mem.put_u32(OFFSET_BLOCK_VALUE_COUNT, block_value_count as u32);
    key_mem.put_u64(OFFSET_KEY_COUNT, 0);
    fence(Ordering::Release);
    key_mem.put_u64(OFFSET_SEQUENCE_CHECK, 1);
}

fn corrupt(path: &Path, reason: &str) -> MeridianError {
    MeridianError::CorruptIndex { path: path.to_path_buf(), reason: reason.to_string() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MappedMemory;
    use tempfile::tempdir;

    #[test]
    fn test_sparse_key_leaves_holes() {
        let dir = tempdir().unwrap();
        let mut writer = BitmapIndexWriter::open(dir.path(), "sym", 4).unwrap();
        writer.add(0, 10).unwrap();
        writer.add(5, 20).unwrap();
        writer.add(5, 21).unwrap();
        assert_eq!(writer.key_count(), 6);
        writer.close().unwrap();

        let key = MappedMemory::open_rw(&dir.path().join("sym.k")).unwrap();
        assert_eq!(key.len(), 6 * 32 + 64);
        for k in 1..5u64 {
            let entry = key_entry_offset(k);
            assert_eq!(key.get_u64(entry + ENTRY_OFFSET_VALUE_COUNT), 0);
            assert_eq!(key.get_u64(entry + ENTRY_OFFSET_FIRST_BLOCK), 0);
            assert_eq!(key.get_u64(entry + ENTRY_OFFSET_LAST_BLOCK), 0);
            assert_eq!(key.get_u64(entry + ENTRY_OFFSET_COUNT_CHECK), 0);
        }
        let entry = key_entry_offset(5);
        assert_eq!(key.get_u64(entry + ENTRY_OFFSET_VALUE_COUNT), 2);
        assert_eq!(key.get_u64(entry + ENTRY_OFFSET_COUNT_CHECK), 2);
        let block = key.get_u64(entry + ENTRY_OFFSET_FIRST_BLOCK);
        let value = MappedMemory::open_rw(&dir.path().join("sym.v")).unwrap();
        assert_eq!(value.get_u64(block), 20);
        assert_eq!(value.get_u64(block + 8), 21);
    }

    #[test]
    fn test_block_overflow_links_blocks() {
        let dir = tempdir().unwrap();
        let mut writer = BitmapIndexWriter::open(dir.path(), "sym", 2).unwrap();
        for v in 1..=3 {
            writer.add(0, v).unwrap();
        }
        writer.close().unwrap();

        // block capacity 2 * 8 + 16 = 32
        let key = MappedMemory::open_rw(&dir.path().join("sym.k")).unwrap();
        let entry = key_entry_offset(0);
        assert_eq!(key.get_u64(entry + ENTRY_OFFSET_VALUE_COUNT), 3);
        assert_eq!(key.get_u64(entry + ENTRY_OFFSET_FIRST_BLOCK), 0);
        assert_eq!(key.get_u64(entry + ENTRY_OFFSET_LAST_BLOCK), 32);
        assert_eq!(key.get_u64(entry + ENTRY_OFFSET_COUNT_CHECK), 3);

        let value = MappedMemory::open_rw(&dir.path().join("sym.v")).unwrap();
        assert_eq!(value.len(), 64);
        assert_eq!(value.get_u64(0), 1);
        assert_eq!(value.get_u64(8), 2);
        assert_eq!(value.get_u64(24), 32); // next link of block 0
        assert_eq!(value.get_u64(32), 3);
        assert_eq!(value.get_u64(48), 0); // prev link of block 1
    }

    #[test]
    fn test_close_truncates_to_logical_sizes() {
        let dir = tempdir().unwrap();
        let mut writer = BitmapIndexWriter::open(dir.path(), "sym", 4).unwrap();
        writer.add(2, 7).unwrap();
        let value_size = writer.value_mem_size();
        writer.close().unwrap();

        assert_eq!(std::fs::metadata(dir.path().join("sym.k")).unwrap().len(), 3 * 32 + 64);
        assert_eq!(std::fs::metadata(dir.path().join("sym.v")).unwrap().len(), value_size);
        assert_eq!(value_size, 4 * 8 + 16);
    }

    #[test]
    fn test_reopen_continues_appending() {
        let dir = tempdir().unwrap();
        let mut writer = BitmapIndexWriter::open(dir.path(), "sym", 4).unwrap();
        writer.add(1, 100).unwrap();
        writer.close().unwrap();

        // the block value count argument is ignored for an existing index
        let mut writer = BitmapIndexWriter::open(dir.path(), "sym", 64).unwrap();
        assert_eq!(writer.key_count(), 2);
        writer.add(1, 101).unwrap();
        writer.close().unwrap();

        let key = MappedMemory::open_rw(&dir.path().join("sym.k")).unwrap();
        let entry = key_entry_offset(1);
        assert_eq!(key.get_u64(entry + ENTRY_OFFSET_VALUE_COUNT), 2);
        let block = key.get_u64(entry + ENTRY_OFFSET_FIRST_BLOCK);
        let value = MappedMemory::open_rw(&dir.path().join("sym.v")).unwrap();
        assert_eq!(value.get_u64(block), 100);
        assert_eq!(value.get_u64(block + 8), 101);
    }

    #[test]
    fn test_invalid_signature_is_corrupt() {
        let dir = tempdir().unwrap();
        let writer = BitmapIndexWriter::open(dir.path(), "sym", 4).unwrap();
        let path = writer.key_path().to_path_buf();
        writer.close().unwrap();

        let key = MappedMemory::open_rw(&path).unwrap();
        key.put_u8(0, 0x00);
        drop(key);

        let err = BitmapIndexWriter::open(dir.path(), "sym", 4).err().expect("open must fail");
        assert!(matches!(err, MeridianError::CorruptIndex { .. }), "{err}");
    }

    #[test]
    fn test_truncated_key_file_is_corrupt() {
        let dir = tempdir().unwrap();
        let mut writer = BitmapIndexWriter::open(dir.path(), "sym", 4).unwrap();
        writer.add(9, 1).unwrap();
        writer.close().unwrap();

        // chop one entry off the tail
        let path = dir.path().join("sym.k");
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(9 * 32 + 64).unwrap();
        drop(file);

        let err = BitmapIndexWriter::open(dir.path(), "sym", 4).err().expect("open must fail");
        assert!(matches!(err, MeridianError::CorruptIndex { .. }), "{err}");
    }
}
