//! Merge index
//!
//! One entry per output row of a merged block: the designated timestamp
//! in the first 8 bytes, and a packed source descriptor in the second.
//! Bit 63 of the descriptor selects the source side (0 = O3 batch,
//! 1 = on-disk partition), bits 0..62 hold the source row on that side.
//! Callers never touch the raw word; side and row come out of the
//! accessors.

use std::cmp::Ordering;

const SIDE_BIT: u64 = 1 << 63;
const ROW_MASK: u64 = SIDE_BIT - 1;

/// Source side of a merged row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The out-of-order batch
    Ooo,
    /// The existing on-disk partition
    Data,
}

/// (timestamp, packed row descriptor)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct MergeEntry {
    timestamp: i64,
    row: u64,
}

impl MergeEntry {
    pub fn new(timestamp: i64, side: Side, row: u64) -> Self {
        debug_assert!(row & SIDE_BIT == 0, "row index overflows 63 bits");
        let row = match side {
            Side::Ooo => row,
            Side::Data => row | SIDE_BIT,
        };
        Self { timestamp, row }
    }

    #[inline]
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    #[inline]
    pub fn side(&self) -> Side {
        if self.row & SIDE_BIT == 0 {
            Side::Ooo
        } else {
            Side::Data
        }
    }

    /// Source row on the selected side
    #[inline]
    pub fn row_index(&self) -> u64 {
        self.row & ROW_MASK
    }
}

/// Row order of a merged block. Owns its allocation; the engine shares it
/// across a partition's copy tasks behind an `Arc` and the last consumer
/// frees it.
pub struct MergeIndex {
    entries: Box<[MergeEntry]>,
}

impl MergeIndex {
    pub fn from_entries(entries: Vec<MergeEntry>) -> Self {
        Self { entries: entries.into_boxed_slice() }
    }

    /// Two-way merge of the sorted on-disk and O3 timestamp runs.
    /// `data_first_row` / `ooo_first_row` are the absolute row numbers of
    /// the first element of each slice on its side. Equal timestamps
    /// order the on-disk row first.
    pub fn for_sorted(data_ts: &[i64], data_first_row: u64, ooo_ts: &[i64], ooo_first_row: u64) -> Self {
        let mut entries = Vec::with_capacity(data_ts.len() + ooo_ts.len());
        let (mut d, mut o) = (0usize, 0usize);
        while d < data_ts.len() && o < ooo_ts.len() {
            match data_ts[d].cmp(&ooo_ts[o]) {
                Ordering::Less | Ordering::Equal => {
                    entries.push(MergeEntry::new(data_ts[d], Side::Data, data_first_row + d as u64));
                    d += 1;
                }
                Ordering::Greater => {
                    entries.push(MergeEntry::new(ooo_ts[o], Side::Ooo, ooo_first_row + o as u64));
                    o += 1;
                }
            }
        }
        for (i, &ts) in data_ts.iter().enumerate().skip(d) {
            entries.push(MergeEntry::new(ts, Side::Data, data_first_row + i as u64));
        }
        for (i, &ts) in ooo_ts.iter().enumerate().skip(o) {
            entries.push(MergeEntry::new(ts, Side::Ooo, ooo_first_row + i as u64));
        }
        Self::from_entries(entries)
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn entries(&self) -> &[MergeEntry] {
        &self.entries
    }
}
