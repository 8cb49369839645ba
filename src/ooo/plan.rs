//! Partition planning and fan-out
//!
//! Splits one partition's O3 work into the ordered block list (DATA or
//! OO prefix, MERGE middle, DATA or OO suffix), sizes and creates the
//! destination column files, and publishes one copy task per
//! (column x block) with the counters and latch wired.
//!
//! File naming: a fixed-width column is `<name>.d`; a var-width column is
//! `<name>.i` (offsets) plus `<name>.d` (payload); a bitmap index is
//! `<name>.k` / `<name>.v`.

use std::path::Path;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::exec::Producer;
use crate::ooo::merge_index::MergeIndex;
use crate::ooo::partition::{PartitionColumn, PartitionMergeTask};
use crate::ooo::task::{BlockType, ColumnCopyTask, IndexTarget};
use crate::storage::{ColumnKind, MappedMemory};
use crate::{MeridianError, Result};

/// One output block of a partition merge, with inclusive per-side ranges
pub enum Block {
    Data { lo: u64, hi: u64 },
    Ooo { lo: u64, hi: u64 },
    Merge { data_lo: u64, data_hi: u64, ooo_lo: u64, ooo_hi: u64, index: Arc<MergeIndex> },
}

impl Block {
    pub fn row_count(&self) -> u64 {
        match *self {
            Block::Data { lo, hi } | Block::Ooo { lo, hi } => hi - lo + 1,
            Block::Merge { data_lo, data_hi, ooo_lo, ooo_hi, .. } => {
                (data_hi - data_lo + 1) + (ooo_hi - ooo_lo + 1)
            }
        }
    }

    pub fn block_type(&self) -> BlockType {
        match self {
            Block::Data { .. } => BlockType::Data,
            Block::Ooo { .. } => BlockType::Ooo,
            Block::Merge { .. } => BlockType::Merge,
        }
    }
}

/// Split the partition into its ordered block list by binary-searching
/// both sorted timestamp runs
pub fn plan_blocks(task: &PartitionMergeTask) -> Result<Vec<Block>> {
    if task.src_ooo_hi < task.src_ooo_lo {
        return Err(MeridianError::InvariantViolation("empty o3 batch".into()));
    }
    let ooo_len = task.src_ooo_hi - task.src_ooo_lo + 1;
    let mut ooo_ts = Vec::with_capacity(ooo_len as usize);
    for i in 0..ooo_len {
        ooo_ts.push(task.sorted_timestamps.get_i64((task.src_ooo_lo + i) << 4));
    }

    if task.src_data_max == 0 {
        return Ok(vec![Block::Ooo { lo: task.src_ooo_lo, hi: task.src_ooo_hi }]);
    }

    let ts_col = &task.columns[task.timestamp_column];
    let data_fix = ts_col
        .data_fix
        .as_deref()
        .ok_or_else(|| MeridianError::InvariantViolation("timestamp column missing on-disk region".into()))?;
    let mut data_ts = Vec::with_capacity(task.src_data_max as usize);
    for r in 0..task.src_data_max {
        data_ts.push(data_fix.get_i64(r << 3));
    }

    let ooo_min = ooo_ts[0];
    let ooo_max = *ooo_ts.last().unwrap();
    let data_min = data_ts[0];
    let data_max = *data_ts.last().unwrap();

    let mut blocks = Vec::with_capacity(3);

    // exactly one side can run ahead of the other's minimum
    let d_start = data_ts.partition_point(|&t| t < ooo_min) as u64;
    let o_start = ooo_ts.partition_point(|&t| t < data_min) as u64;
    if d_start > 0 {
        blocks.push(Block::Data { lo: 0, hi: d_start - 1 });
    } else if o_start > 0 {
        blocks.push(Block::Ooo { lo: task.src_ooo_lo, hi: task.src_ooo_lo + o_start - 1 });
    }

    let d_end = data_ts.partition_point(|&t| t <= ooo_max) as u64;
    let o_end = ooo_ts.partition_point(|&t| t <= data_max) as u64;
    let d_mid = d_start < d_end;
    let o_mid = o_start < o_end;
    if d_mid && o_mid {
        let index = MergeIndex::for_sorted(
            &data_ts[d_start as usize..d_end as usize],
            d_start,
            &ooo_ts[o_start as usize..o_end as usize],
            task.src_ooo_lo + o_start,
        );
        blocks.push(Block::Merge {
            data_lo: d_start,
            data_hi: d_end - 1,
            ooo_lo: task.src_ooo_lo + o_start,
            ooo_hi: task.src_ooo_lo + o_end - 1,
            index: Arc::new(index),
        });
    } else if d_mid {
        blocks.push(Block::Data { lo: d_start, hi: d_end - 1 });
    } else if o_mid {
        blocks.push(Block::Ooo { lo: task.src_ooo_lo + o_start, hi: task.src_ooo_lo + o_end - 1 });
    }

    if d_end < task.src_data_max {
        blocks.push(Block::Data { lo: d_end, hi: task.src_data_max - 1 });
    } else if o_end < ooo_len {
        blocks.push(Block::Ooo { lo: task.src_ooo_lo + o_end, hi: task.src_ooo_hi });
    }

    Ok(blocks)
}

/// Plan the partition, create its destination files, and publish one
/// copy task per (column x block). The caller's latch must be armed with
/// one count for the partition.
pub fn fan_out(
    task: PartitionMergeTask,
    dst_dir: &Path,
    producer: &mut Producer<ColumnCopyTask>,
    config: &EngineConfig,
) -> Result<()> {
    let blocks = plan_blocks(&task)?;
    std::fs::create_dir_all(dst_dir)?;

    let ooo_len = task.src_ooo_hi - task.src_ooo_lo + 1;
    let total_rows = task.src_data_max + ooo_len;
    let column_counter = Arc::new(AtomicU32::new(task.columns.len() as u32));

    // the merge index, if any, is shared by every column's merge task
    let merge_index = blocks.iter().find_map(|b| match b {
        Block::Merge { index, .. } => Some(Arc::clone(index)),
        _ => None,
    });

    for column in &task.columns {
        let part_counter = Arc::new(AtomicU32::new(blocks.len() as u32));

        let (dst_fix, dst_fix_size, dst_var, dst_var_size) = if column.kind.is_var_size() {
            let dst_fix_size = total_rows << 3;
            let dst_var_size = data_var_bytes(column, task.src_data_max)
                + var_range_bytes(
                    column.ooo_fix.as_deref(),
                    column.ooo_fix_size,
                    column.ooo_var_size,
                    task.src_ooo_lo,
                    task.src_ooo_hi,
                );
            let fix = MappedMemory::create(&dst_dir.join(format!("{}.i", column.name)), dst_fix_size)?;
            let var = MappedMemory::create(&dst_dir.join(format!("{}.d", column.name)), dst_var_size.max(1))?;
            (Arc::new(fix), dst_fix_size, Some(Arc::new(var)), dst_var_size)
        } else {
            let width = column
                .kind
                .size_class()
                .ok_or_else(|| MeridianError::InvariantViolation(format!("{:?} has no cell width", column.kind)))?
                .size();
            let dst_fix_size = total_rows * width;
            let fix = MappedMemory::create(&dst_dir.join(format!("{}.d", column.name)), dst_fix_size)?;
            (Arc::new(fix), dst_fix_size, None, 0)
        };

        let index_target = if column.indexed && column.kind == ColumnKind::Symbol {
            Some(Arc::new(IndexTarget {
                dir: dst_dir.to_path_buf(),
                name: column.name.clone(),
                block_value_count: config.index_block_value_count,
                dst_index_offset: 0,
            }))
        } else {
            None
        };

        let mut dst_fix_offset = 0u64;
        let mut dst_var_offset = 0u64;
        for block in &blocks {
            let (data_lo, data_hi, ooo_lo, ooo_hi) = match *block {
                Block::Data { lo, hi } => (lo, hi, 1, 0),
                Block::Ooo { lo, hi } => (1, 0, lo, hi),
                Block::Merge { data_lo, data_hi, ooo_lo, ooo_hi, .. } => (data_lo, data_hi, ooo_lo, ooo_hi),
            };
            let block_var_bytes = if column.kind.is_var_size() {
                var_range_bytes(column.data_fix.as_deref(), column.data_fix_size, column.data_var_size, data_lo, data_hi)
                    + var_range_bytes(column.ooo_fix.as_deref(), column.ooo_fix_size, column.ooo_var_size, ooo_lo, ooo_hi)
            } else {
                0
            };

            let copy = ColumnCopyTask {
                column_counter: Arc::clone(&column_counter),
                part_counter: Arc::clone(&part_counter),
                block_type: block.block_type(),
                column_kind: column.kind,
                src_data_fix: column.data_fix.clone(),
                src_data_fix_size: column.data_fix_size,
                src_data_var: column.data_var.clone(),
                src_data_var_size: column.data_var_size,
                src_data_lo: data_lo,
                src_data_hi: data_hi,
                src_ooo_fix: column.ooo_fix.clone(),
                src_ooo_fix_size: column.ooo_fix_size,
                src_ooo_var: column.ooo_var.clone(),
                src_ooo_var_size: column.ooo_var_size,
                src_ooo_lo: ooo_lo,
                src_ooo_hi: ooo_hi,
                dst_fix: Arc::clone(&dst_fix),
                dst_fix_offset,
                dst_fix_size,
                dst_var: dst_var.clone(),
                dst_var_offset,
                dst_var_size,
                merge_index: if matches!(block, Block::Merge { .. }) { merge_index.clone() } else { None },
                index: index_target.clone(),
                done_latch: Arc::clone(&task.done_latch),
            };
            publish(producer, copy);

            let width = if column.kind.is_var_size() {
                8
            } else {
                column.kind.size_class().map(|c| c.size()).unwrap_or(8)
            };
            dst_fix_offset += block.row_count() * width;
            dst_var_offset += block_var_bytes;
        }
    }
    Ok(())
}

/// Publish with backpressure: the consumer releases slots before
/// copying, so a full ring drains quickly
fn publish(producer: &mut Producer<ColumnCopyTask>, mut task: ColumnCopyTask) {
    loop {
        match producer.publish(task) {
            Ok(()) => return,
            Err(returned) => {
                task = returned;
                std::thread::yield_now();
            }
        }
    }
}

/// Var-file bytes spanned by the inclusive row range, 0 when the range
/// or the region is empty
fn var_range_bytes(fix: Option<&MappedMemory>, fix_size: u64, var_size: u64, lo: u64, hi: u64) -> u64 {
    let fix = match fix {
        Some(fix) if lo <= hi => fix,
        _ => return 0,
    };
    let start = fix.get_i64(lo << 3) as u64;
    let end = if hi + 1 == fix_size >> 3 { var_size } else { fix.get_i64((hi + 1) << 3) as u64 };
    end - start
}

fn data_var_bytes(column: &PartitionColumn, src_data_max: u64) -> u64 {
    if src_data_max == 0 {
        return 0;
    }
    var_range_bytes(column.data_fix.as_deref(), column.data_fix_size, column.data_var_size, 0, src_data_max - 1)
}
