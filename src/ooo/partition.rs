//! Partition task envelope
//!
//! An immutable description of one partition's O3 work. The producer
//! fills it before publish; the planner and the fan-out only read it.
//! The on-disk side of each column is memory-mapped from the partition
//! directory; the O3 side is the staged, timestamp-sorted batch.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::exec::CountDownLatch;
use crate::storage::{ColumnKind, MappedMemory};

/// Partition granularity of the table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionBy {
    None,
    Day,
    Month,
    Year,
}

/// One column's regions, both sides
pub struct PartitionColumn {
    pub name: String,
    pub kind: ColumnKind,
    /// Whether the column carries a bitmap index (symbol columns only)
    pub indexed: bool,

    pub data_fix: Option<Arc<MappedMemory>>,
    pub data_fix_size: u64,
    pub data_var: Option<Arc<MappedMemory>>,
    pub data_var_size: u64,

    pub ooo_fix: Option<Arc<MappedMemory>>,
    pub ooo_fix_size: u64,
    pub ooo_var: Option<Arc<MappedMemory>>,
    pub ooo_var_size: u64,
}

/// One partition's O3 work order
pub struct PartitionMergeTask {
    /// Partition directory of the existing data
    pub path: PathBuf,
    pub partition_by: PartitionBy,
    pub columns: Vec<PartitionColumn>,
    /// Index of the designated timestamp column in `columns`
    pub timestamp_column: usize,

    /// O3 batch row range to merge (inclusive)
    pub src_ooo_lo: u64,
    pub src_ooo_hi: u64,
    /// Total rows staged in the O3 batch
    pub src_ooo_max: u64,
    pub ooo_timestamp_min: i64,
    pub ooo_timestamp_max: i64,
    pub partition_timestamp: i64,
    /// Table's max timestamp before this merge
    pub max_timestamp: i64,
    /// Rows in the on-disk partition
    pub src_data_max: u64,
    pub src_data_txn: u64,
    /// Whether this is the table's newest partition
    pub last_partition: bool,
    pub txn: u64,

    /// The batch's designated timestamps, sorted: 16-byte
    /// (timestamp, row-id) pairs
    pub sorted_timestamps: Arc<MappedMemory>,
    pub done_latch: Arc<CountDownLatch>,
}
