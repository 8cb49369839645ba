//! Copy task carrier
//!
//! One task per (column x block). Region handles are shared `Arc`s; the
//! producer wires the two counters and the latch before publishing, and
//! never touches the task again. Absent regions (no var file, no on-disk
//! side) are `None`.

use std::path::PathBuf;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::exec::CountDownLatch;
use crate::ooo::merge_index::MergeIndex;
use crate::storage::{ColumnKind, MappedMemory};

/// Provenance of the slice a copy task materializes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockType {
    /// Entirely from the out-of-order batch
    Ooo,
    /// Entirely from the existing on-disk partition
    Data,
    /// Both sides interleave under the merge index
    Merge,
}

/// Bitmap index to (re)build once a column's destination is complete
#[derive(Debug, Clone)]
pub struct IndexTarget {
    /// Directory holding the `.k` / `.v` pair
    pub dir: PathBuf,
    /// Index name (column name)
    pub name: String,
    /// Values per block for a fresh index
    pub block_value_count: u64,
    /// Byte offset into the destination fixed file from which rows need
    /// indexing; 0 replays the whole column
    pub dst_index_offset: u64,
}

/// One unit of copy work
pub struct ColumnCopyTask {
    /// Columns still in flight for the partition
    pub column_counter: Arc<AtomicU32>,
    /// Copy tasks still in flight for this column
    pub part_counter: Arc<AtomicU32>,
    pub block_type: BlockType,
    pub column_kind: ColumnKind,

    pub src_data_fix: Option<Arc<MappedMemory>>,
    pub src_data_fix_size: u64,
    pub src_data_var: Option<Arc<MappedMemory>>,
    pub src_data_var_size: u64,
    pub src_data_lo: u64,
    pub src_data_hi: u64,

    pub src_ooo_fix: Option<Arc<MappedMemory>>,
    pub src_ooo_fix_size: u64,
    pub src_ooo_var: Option<Arc<MappedMemory>>,
    pub src_ooo_var_size: u64,
    pub src_ooo_lo: u64,
    pub src_ooo_hi: u64,

    pub dst_fix: Arc<MappedMemory>,
    pub dst_fix_offset: u64,
    pub dst_fix_size: u64,
    pub dst_var: Option<Arc<MappedMemory>>,
    pub dst_var_offset: u64,
    pub dst_var_size: u64,

    pub merge_index: Option<Arc<MergeIndex>>,
    pub index: Option<Arc<IndexTarget>>,
    pub done_latch: Arc<CountDownLatch>,
}
