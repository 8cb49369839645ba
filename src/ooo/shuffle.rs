//! Merge shuffle
//!
//! Row-by-row materialization of a MERGE block: each merge-index entry
//! selects a source side and row; the destination advances one slot per
//! entry. Var-width variants also thread the destination var offset.

use crate::ooo::merge_index::{MergeEntry, Side};
use crate::storage::{
    binary_entry_size, string_entry_size, MappedMemory, BINARY_LENGTH_BYTES, STRING_LENGTH_BYTES,
};

#[inline]
fn pick<'a>(e: &MergeEntry, ooo: &'a MappedMemory, data: &'a MappedMemory) -> &'a MappedMemory {
    match e.side() {
        Side::Ooo => ooo,
        Side::Data => data,
    }
}

pub fn shuffle_8(data: &MappedMemory, ooo: &MappedMemory, dst: &MappedMemory, dst_offset: u64, index: &[MergeEntry]) {
    for (i, e) in index.iter().enumerate() {
        dst.put_u8(dst_offset + i as u64, pick(e, ooo, data).get_u8(e.row_index()));
    }
}

pub fn shuffle_16(data: &MappedMemory, ooo: &MappedMemory, dst: &MappedMemory, dst_offset: u64, index: &[MergeEntry]) {
    for (i, e) in index.iter().enumerate() {
        dst.put_u16(dst_offset + ((i as u64) << 1), pick(e, ooo, data).get_u16(e.row_index() << 1));
    }
}

pub fn shuffle_32(data: &MappedMemory, ooo: &MappedMemory, dst: &MappedMemory, dst_offset: u64, index: &[MergeEntry]) {
    for (i, e) in index.iter().enumerate() {
        dst.put_u32(dst_offset + ((i as u64) << 2), pick(e, ooo, data).get_u32(e.row_index() << 2));
    }
}

pub fn shuffle_64(data: &MappedMemory, ooo: &MappedMemory, dst: &MappedMemory, dst_offset: u64, index: &[MergeEntry]) {
    for (i, e) in index.iter().enumerate() {
        dst.put_u64(dst_offset + ((i as u64) << 3), pick(e, ooo, data).get_u64(e.row_index() << 3));
    }
}

/// Write the timestamp half of each merge-index entry, yielding the
/// merged designated-timestamp column
pub fn copy_timestamps(index: &[MergeEntry], dst: &MappedMemory, dst_offset: u64) {
    for (i, e) in index.iter().enumerate() {
        dst.put_i64(dst_offset + ((i as u64) << 3), e.timestamp());
    }
}

/// Merge a string column: 4-byte length prefix, UTF-16 payload, length -1
/// propagated with no payload
#[allow(clippy::too_many_arguments)]
pub fn merge_copy_str(
    index: &[MergeEntry],
    data_fix: &MappedMemory,
    data_var: &MappedMemory,
    ooo_fix: &MappedMemory,
    ooo_var: &MappedMemory,
    dst_fix: &MappedMemory,
    dst_fix_offset: u64,
    dst_var: &MappedMemory,
    dst_var_offset: u64,
) {
    let mut dest_var_offset = dst_var_offset;
    for (i, e) in index.iter().enumerate() {
        let src_fix = pick(e, ooo_fix, data_fix);
        let src_var = pick(e, ooo_var, data_var);
        dst_fix.put_i64(dst_fix_offset + ((i as u64) << 3), dest_var_offset as i64);
        let offset = src_fix.get_i64(e.row_index() << 3) as u64;
        let len = src_var.get_i32(offset);
        dst_var.put_i32(dest_var_offset, len);
        let entry_size = string_entry_size(len);
        dst_var.copy_from(
            dest_var_offset + STRING_LENGTH_BYTES,
            src_var,
            offset + STRING_LENGTH_BYTES,
            entry_size - STRING_LENGTH_BYTES,
        );
        dest_var_offset += entry_size;
    }
}

/// Merge a binary column: 8-byte length prefix, raw payload; a positive
/// length copies prefix and payload in one pass
#[allow(clippy::too_many_arguments)]
pub fn merge_copy_bin(
    index: &[MergeEntry],
    data_fix: &MappedMemory,
    data_var: &MappedMemory,
    ooo_fix: &MappedMemory,
    ooo_var: &MappedMemory,
    dst_fix: &MappedMemory,
    dst_fix_offset: u64,
    dst_var: &MappedMemory,
    dst_var_offset: u64,
) {
    let mut dest_var_offset = dst_var_offset;
    for (i, e) in index.iter().enumerate() {
        let src_fix = pick(e, ooo_fix, data_fix);
        let src_var = pick(e, ooo_var, data_var);
        dst_fix.put_i64(dst_fix_offset + ((i as u64) << 3), dest_var_offset as i64);
        let offset = src_fix.get_i64(e.row_index() << 3) as u64;
        let len = src_var.get_i64(offset);
        let entry_size = binary_entry_size(len);
        if len > 0 {
            // one pass for prefix and payload
            dst_var.copy_from(dest_var_offset, src_var, offset, entry_size);
        } else {
            debug_assert_eq!(entry_size, BINARY_LENGTH_BYTES);
            dst_var.put_i64(dest_var_offset, len);
        }
        dest_var_offset += entry_size;
    }
}
