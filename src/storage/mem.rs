//! Memory-mapped region handles
//!
//! Two flavours:
//! - [`MappedMemory`]: a fixed-length region, file-backed or anonymous.
//!   The merge engine shares one handle per column file across worker
//!   threads; tasks write disjoint byte windows, so accessors take
//!   `&self` and bounds are asserted in debug builds only.
//! - [`GrowableMemory`]: a file-backed region that grows by extending the
//!   file and remapping. The bitmap index files live behind this.
//!
//! All integer accessors are little-endian, matching the on-disk column
//! format.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::ptr;

use memmap2::MmapMut;

use crate::Result;

/// Fixed-length owning handle over a mapped byte region.
///
/// Writes go through `&self`: concurrent tasks are handed disjoint
/// `[offset, offset + len)` windows by the partition planner, so the
/// region itself does no synchronization. The mapping is released and the
/// backing file closed when the last clone of the owning `Arc` drops.
pub struct MappedMemory {
    ptr: *mut u8,
    len: u64,
    _mmap: MmapMut,
    _file: Option<File>,
}

unsafe impl Send for MappedMemory {}
unsafe impl Sync for MappedMemory {}

impl MappedMemory {
    /// Create (or overwrite) a file of exactly `len` bytes and map it
    pub fn create(path: &Path, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len)?;
        Self::from_file(file, len)
    }

    /// Map an existing file whole
    pub fn open_rw(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        Self::from_file(file, len)
    }

    /// Anonymous region, used for staging the O3 batch in memory
    pub fn anon(len: u64) -> Result<Self> {
        let mut mmap = MmapMut::map_anon(len as usize)?;
        let ptr = mmap.as_mut_ptr();
        Ok(Self { ptr, len, _mmap: mmap, _file: None })
    }

    fn from_file(file: File, len: u64) -> Result<Self> {
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        let ptr = mmap.as_mut_ptr();
        Ok(Self { ptr, len, _mmap: mmap, _file: Some(file) })
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn read_into(&self, offset: u64, buf: &mut [u8]) {
        debug_assert!(offset + buf.len() as u64 <= self.len);
        unsafe { ptr::copy_nonoverlapping(self.ptr.add(offset as usize), buf.as_mut_ptr(), buf.len()) }
    }

    /// Write raw bytes at `offset`
    #[inline]
    pub fn write_bytes(&self, offset: u64, bytes: &[u8]) {
        debug_assert!(offset + bytes.len() as u64 <= self.len);
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(offset as usize), bytes.len()) }
    }

    /// Borrow a byte range. The caller must ensure no task writes the
    /// range for the lifetime of the borrow.
    #[inline]
    pub fn bytes(&self, offset: u64, len: u64) -> &[u8] {
        debug_assert!(offset + len <= self.len);
        unsafe { std::slice::from_raw_parts(self.ptr.add(offset as usize), len as usize) }
    }

    /// Copy `len` bytes from another region
    #[inline]
    pub fn copy_from(&self, dst_offset: u64, src: &MappedMemory, src_offset: u64, len: u64) {
        debug_assert!(src_offset + len <= src.len);
        debug_assert!(dst_offset + len <= self.len);
        unsafe {
            ptr::copy_nonoverlapping(
                src.ptr.add(src_offset as usize),
                self.ptr.add(dst_offset as usize),
                len as usize,
            )
        }
    }

    #[inline]
    pub fn get_u8(&self, offset: u64) -> u8 {
        let mut buf = [0u8; 1];
        self.read_into(offset, &mut buf);
        buf[0]
    }

    #[inline]
    pub fn put_u8(&self, offset: u64, v: u8) {
        self.write_bytes(offset, &[v]);
    }

    #[inline]
    pub fn get_u16(&self, offset: u64) -> u16 {
        let mut buf = [0u8; 2];
        self.read_into(offset, &mut buf);
        u16::from_le_bytes(buf)
    }

    #[inline]
    pub fn put_u16(&self, offset: u64, v: u16) {
        self.write_bytes(offset, &v.to_le_bytes());
    }

    #[inline]
    pub fn get_u32(&self, offset: u64) -> u32 {
        let mut buf = [0u8; 4];
        self.read_into(offset, &mut buf);
        u32::from_le_bytes(buf)
    }

    #[inline]
    pub fn put_u32(&self, offset: u64, v: u32) {
        self.write_bytes(offset, &v.to_le_bytes());
    }

    #[inline]
    pub fn get_i32(&self, offset: u64) -> i32 {
        self.get_u32(offset) as i32
    }

    #[inline]
    pub fn put_i32(&self, offset: u64, v: i32) {
        self.put_u32(offset, v as u32);
    }

    #[inline]
    pub fn get_u64(&self, offset: u64) -> u64 {
        let mut buf = [0u8; 8];
        self.read_into(offset, &mut buf);
        u64::from_le_bytes(buf)
    }

    #[inline]
    pub fn put_u64(&self, offset: u64, v: u64) {
        self.write_bytes(offset, &v.to_le_bytes());
    }

    #[inline]
    pub fn get_i64(&self, offset: u64) -> i64 {
        self.get_u64(offset) as i64
    }

    #[inline]
    pub fn put_i64(&self, offset: u64, v: i64) {
        self.put_u64(offset, v as u64);
    }
}

/// File-backed region that grows by extending the file and remapping.
///
/// The file's physical length is always a multiple of the growth
/// granularity; logical sizes (how much of the file is meaningful) are
/// tracked by the caller and applied with [`GrowableMemory::truncate`] on
/// close.
pub struct GrowableMemory {
    file: File,
    mmap: Option<MmapMut>,
    mapped_len: u64,
    growth: u64,
    len_at_open: u64,
}

impl GrowableMemory {
    /// Open (creating if absent) and map the file, extending it to at
    /// least one growth unit
    pub fn open(path: &Path, growth: u64) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        Self::from_file(file, growth)
    }

    /// Open an existing file and map it as-is, without growing it;
    /// fails if absent. [`GrowableMemory::refresh`] picks up growth done
    /// by another handle.
    pub fn open_existing(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len_at_open = file.metadata()?.len();
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { file, mmap: Some(mmap), mapped_len: len_at_open, growth: 1, len_at_open })
    }

    fn from_file(file: File, growth: u64) -> Result<Self> {
        debug_assert!(growth > 0);
        let len_at_open = file.metadata()?.len();
        let mapped_len = round_up(len_at_open.max(1), growth);
        if mapped_len != len_at_open {
            file.set_len(mapped_len)?;
        }
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { file, mmap: Some(mmap), mapped_len, growth, len_at_open })
    }

    /// File length as found on disk before this handle extended it
    #[inline]
    pub fn len_at_open(&self) -> u64 {
        self.len_at_open
    }

    #[inline]
    pub fn mapped_len(&self) -> u64 {
        self.mapped_len
    }

    /// Grow the file and remap so that `[0, end)` is addressable
    pub fn ensure(&mut self, end: u64) -> Result<()> {
        if end > self.mapped_len {
            let new_len = round_up(end, self.growth);
            self.mmap = None;
            self.file.set_len(new_len)?;
            self.mmap = Some(unsafe { MmapMut::map_mut(&self.file)? });
            self.mapped_len = new_len;
        }
        Ok(())
    }

    /// Remap to the file's current length (reader side, after a writer
    /// has grown the file)
    pub fn refresh(&mut self) -> Result<()> {
        let len = self.file.metadata()?.len();
        if len != self.mapped_len {
            self.mmap = None;
            self.mmap = Some(unsafe { MmapMut::map_mut(&self.file)? });
            self.mapped_len = len;
        }
        Ok(())
    }

    /// Drop the mapping and cut the file to its logical length
    pub fn truncate(&mut self, len: u64) -> Result<()> {
        self.mmap = None;
        self.mapped_len = 0;
        self.file.set_len(len)?;
        Ok(())
    }

    #[inline]
    fn map(&self) -> &MmapMut {
        self.mmap.as_ref().expect("mapping released")
    }

    #[inline]
    pub fn get_u8(&self, offset: u64) -> u8 {
        self.map()[offset as usize]
    }

    #[inline]
    pub fn put_u8(&mut self, offset: u64, v: u8) {
        let map = self.mmap.as_mut().expect("mapping released");
        map[offset as usize] = v;
    }

    #[inline]
    pub fn get_u32(&self, offset: u64) -> u32 {
        let map = self.map();
        let buf: [u8; 4] = map[offset as usize..offset as usize + 4].try_into().unwrap();
        u32::from_le_bytes(buf)
    }

    #[inline]
    pub fn put_u32(&mut self, offset: u64, v: u32) {
        let map = self.mmap.as_mut().expect("mapping released");
        map[offset as usize..offset as usize + 4].copy_from_slice(&v.to_le_bytes());
    }

    #[inline]
    pub fn get_u64(&self, offset: u64) -> u64 {
        let map = self.map();
        let buf: [u8; 8] = map[offset as usize..offset as usize + 8].try_into().unwrap();
        u64::from_le_bytes(buf)
    }

    #[inline]
    pub fn put_u64(&mut self, offset: u64, v: u64) {
        let map = self.mmap.as_mut().expect("mapping released");
        map[offset as usize..offset as usize + 8].copy_from_slice(&v.to_le_bytes());
    }
}

#[inline]
fn round_up(v: u64, granularity: u64) -> u64 {
    v.div_ceil(granularity) * granularity
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_mapped_memory_rw() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("col.d");
        let mem = MappedMemory::create(&path, 64).unwrap();

        mem.put_i64(0, -42);
        mem.put_u32(8, 7);
        mem.put_u8(12, 0xAB);
        assert_eq!(mem.get_i64(0), -42);
        assert_eq!(mem.get_u32(8), 7);
        assert_eq!(mem.get_u8(12), 0xAB);
        drop(mem);

        let mem = MappedMemory::open_rw(&path).unwrap();
        assert_eq!(mem.len(), 64);
        assert_eq!(mem.get_i64(0), -42);
    }

    #[test]
    fn test_mapped_memory_copy_between_regions() {
        let a = MappedMemory::anon(32).unwrap();
        let b = MappedMemory::anon(32).unwrap();
        a.write_bytes(4, b"columnar");
        b.copy_from(0, &a, 4, 8);
        assert_eq!(b.bytes(0, 8), b"columnar");
    }

    #[test]
    fn test_growable_memory_grows_and_truncates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("idx.k");
        let mut mem = GrowableMemory::open(&path, 4096).unwrap();
        assert_eq!(mem.len_at_open(), 0);
        assert_eq!(mem.mapped_len(), 4096);

        mem.put_u64(0, 99);
        mem.ensure(4096 + 16).unwrap();
        assert_eq!(mem.mapped_len(), 8192);
        mem.put_u64(4096 + 8, 100);
        assert_eq!(mem.get_u64(0), 99);
        assert_eq!(mem.get_u64(4096 + 8), 100);

        mem.truncate(24).unwrap();
        drop(mem);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 24);
    }
}
