//! Column copier
//!
//! Contiguous-slice copies for OO and DATA blocks. All row ranges are
//! inclusive; an inverted range copies nothing.

use crate::storage::MappedMemory;

/// Copy rows `[src_lo, src_hi]` of a fixed-width column with cell shift
/// `shl` to `dst + dst_offset`
pub fn copy_fixed(src: &MappedMemory, src_lo: u64, src_hi: u64, dst: &MappedMemory, dst_offset: u64, shl: u32) {
    if src_hi < src_lo {
        return;
    }
    let len = (src_hi - src_lo + 1) << shl;
    dst.copy_from(dst_offset, src, src_lo << shl, len);
}

/// Copy rows `[src_lo, src_hi]` of a var-width column: one bulk copy of
/// the payload run, then the offset column, shifted when the payload
/// landed at a different var offset than it came from.
#[allow(clippy::too_many_arguments)]
pub fn copy_var(
    src_fix: &MappedMemory,
    src_fix_size: u64,
    src_var: &MappedMemory,
    src_var_size: u64,
    src_lo: u64,
    src_hi: u64,
    dst_fix: &MappedMemory,
    dst_fix_offset: u64,
    dst_var: &MappedMemory,
    dst_var_offset: u64,
) {
    if src_hi < src_lo {
        return;
    }
    let lo = src_fix.get_i64(src_lo * 8) as u64;
    // the upper edge is either the next row's offset or, for the last
    // row of the column, the var file size
    let hi = if src_hi + 1 == src_fix_size / 8 {
        src_var_size
    } else {
        src_fix.get_i64((src_hi + 1) * 8) as u64
    };
    dst_var.copy_from(dst_var_offset, src_var, lo, hi - lo);
    if lo == dst_var_offset {
        copy_fixed(src_fix, src_lo, src_hi, dst_fix, dst_fix_offset, 3);
    } else {
        shift_copy_fixed(lo as i64 - dst_var_offset as i64, src_fix, src_lo, src_hi, dst_fix, dst_fix_offset);
    }
}

/// Rewrite 8-byte offsets subtracting `shift` from each
fn shift_copy_fixed(shift: i64, src: &MappedMemory, src_lo: u64, src_hi: u64, dst: &MappedMemory, dst_offset: u64) {
    let lo = src_lo << 3;
    let hi = (src_hi + 1) << 3;
    let mut o = 0;
    while o < hi - lo {
        dst.put_i64(dst_offset + o, src.get_i64(lo + o) - shift);
        o += 8;
    }
}

/// Copy the timestamp half of 16-byte (timestamp, row-id) pairs into a
/// plain 8-byte timestamp column
pub fn copy_from_timestamp_index(src: &MappedMemory, src_lo: u64, src_hi: u64, dst: &MappedMemory, dst_offset: u64) {
    if src_hi < src_lo {
        return;
    }
    let lo = src_lo << 4;
    let hi = (src_hi + 1) << 4;
    let mut l = 0;
    while l < hi - lo {
        dst.put_i64(dst_offset + l / 2, src.get_i64(lo + l));
        l += 16;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_of(values: &[i64]) -> MappedMemory {
        let mem = MappedMemory::anon(values.len() as u64 * 8).unwrap();
        for (i, v) in values.iter().enumerate() {
            mem.put_i64(i as u64 * 8, *v);
        }
        mem
    }

    #[test]
    fn test_fixed_copy_bytes_exact() {
        let src = fixed_of(&[10, 20, 30, 40]);
        let dst = MappedMemory::anon(64).unwrap();
        copy_fixed(&src, 1, 2, &dst, 8, 3);
        assert_eq!(dst.get_i64(8), 20);
        assert_eq!(dst.get_i64(16), 30);
    }

    #[test]
    fn test_fixed_copy_empty_range() {
        let src = fixed_of(&[1]);
        let dst = MappedMemory::anon(8).unwrap();
        dst.put_i64(0, -1);
        copy_fixed(&src, 5, 4, &dst, 0, 3);
        assert_eq!(dst.get_i64(0), -1);
    }

    // two strings "ab", "c": fix [0, 8], var [len=2]'a''b' [len=1]'c'
    fn string_col() -> (MappedMemory, MappedMemory, u64) {
        let fix = fixed_of(&[0, 8]);
        let var = MappedMemory::anon(14).unwrap();
        var.put_i32(0, 2);
        var.put_u16(4, 'a' as u16);
        var.put_u16(6, 'b' as u16);
        var.put_i32(8, 1);
        var.put_u16(12, 'c' as u16);
        (fix, var, 14)
    }

    #[test]
    fn test_var_copy_verbatim_offsets() {
        let (fix, var, var_size) = string_col();
        let dst_fix = MappedMemory::anon(16).unwrap();
        let dst_var = MappedMemory::anon(14).unwrap();
        copy_var(&fix, 16, &var, var_size, 0, 1, &dst_fix, 0, &dst_var, 0);
        assert_eq!(dst_fix.get_i64(0), 0);
        assert_eq!(dst_fix.get_i64(8), 8);
        assert_eq!(dst_var.bytes(0, 14), var.bytes(0, 14));
    }

    #[test]
    fn test_var_copy_shifted_offsets() {
        let (fix, var, var_size) = string_col();
        let dst_fix = MappedMemory::anon(8).unwrap();
        let dst_var = MappedMemory::anon(6).unwrap();
        // second row only: source offset 8 lands at var offset 0
        copy_var(&fix, 16, &var, var_size, 1, 1, &dst_fix, 0, &dst_var, 0);
        assert_eq!(dst_fix.get_i64(0), 0);
        assert_eq!(dst_var.get_i32(0), 1);
        assert_eq!(dst_var.get_u16(4), 'c' as u16);
    }

    #[test]
    fn test_timestamp_index_copy_drops_row_ids() {
        let src = MappedMemory::anon(32).unwrap();
        src.put_i64(0, 100); // t0
        src.put_i64(8, 7); // r0
        src.put_i64(16, 200); // t1
        src.put_i64(24, 8); // r1
        let dst = MappedMemory::anon(16).unwrap();
        copy_from_timestamp_index(&src, 0, 1, &dst, 0);
        assert_eq!(dst.get_i64(0), 100);
        assert_eq!(dst.get_i64(8), 200);
    }
}
