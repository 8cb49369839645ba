//! Copy job - drains the task ring and materializes blocks
//!
//! Consumer ordering is load-bearing: the task is snapshotted off the
//! ring and the cursor released BEFORE any copying, so the producer can
//! refill the slot while the copy runs. Once a task's counters hit zero
//! its memory is reclaimed; nothing may touch the task afterwards.

use std::sync::atomic::Ordering;

use crate::exec::Consumer;
use crate::index::{to_index_key, BitmapIndexWriter};
use crate::ooo::task::{BlockType, ColumnCopyTask, IndexTarget};
use crate::ooo::{copy, shuffle};
use crate::storage::{ColumnKind, MappedMemory};
use crate::{MeridianError, Result};

pub struct CopyJob;

impl CopyJob {
    /// Consume and execute at most one task. Returns whether a task ran.
    pub fn run(consumer: &mut Consumer<ColumnCopyTask>) -> Result<bool> {
        match consumer.poll() {
            Some(cursor) => {
                let task = consumer.take(cursor);
                consumer.done(cursor);
                Self::execute(task)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Consume until the ring is momentarily empty
    pub fn drain(consumer: &mut Consumer<ColumnCopyTask>) -> Result<usize> {
        let mut executed = 0;
        while Self::run(consumer)? {
            executed += 1;
        }
        Ok(executed)
    }

    /// Execute one copy task end to end: dispatch the block copy, then
    /// run the counter-driven teardown when this was the column's last
    /// task
    pub fn execute(task: ColumnCopyTask) -> Result<()> {
        Self::copy_block(&task)?;

        if task.part_counter.fetch_sub(1, Ordering::AcqRel) == 1 {
            Self::column_done(task)?;
        }
        Ok(())
    }

    fn copy_block(task: &ColumnCopyTask) -> Result<()> {
        match task.block_type {
            BlockType::Merge => Self::merge_copy(task),
            BlockType::Ooo => Self::copy_ooo(task),
            BlockType::Data => Self::copy_data(task),
        }
    }

    fn copy_ooo(task: &ColumnCopyTask) -> Result<()> {
        let fix = region(&task.src_ooo_fix, "o3 fixed")?;
        match task.column_kind {
            ColumnKind::String | ColumnKind::Binary => copy::copy_var(
                fix,
                task.src_ooo_fix_size,
                region(&task.src_ooo_var, "o3 var")?,
                task.src_ooo_var_size,
                task.src_ooo_lo,
                task.src_ooo_hi,
                &task.dst_fix,
                task.dst_fix_offset,
                region(&task.dst_var, "dst var")?,
                task.dst_var_offset,
            ),
            ColumnKind::TimestampIndex => copy::copy_from_timestamp_index(
                fix,
                task.src_ooo_lo,
                task.src_ooo_hi,
                &task.dst_fix,
                task.dst_fix_offset,
            ),
            kind => copy::copy_fixed(
                fix,
                task.src_ooo_lo,
                task.src_ooo_hi,
                &task.dst_fix,
                task.dst_fix_offset,
                size_shift(kind)?,
            ),
        }
        Ok(())
    }

    fn copy_data(task: &ColumnCopyTask) -> Result<()> {
        let fix = region(&task.src_data_fix, "data fixed")?;
        match task.column_kind {
            ColumnKind::String | ColumnKind::Binary => copy::copy_var(
                fix,
                task.src_data_fix_size,
                region(&task.src_data_var, "data var")?,
                task.src_data_var_size,
                task.src_data_lo,
                task.src_data_hi,
                &task.dst_fix,
                task.dst_fix_offset,
                region(&task.dst_var, "dst var")?,
                task.dst_var_offset,
            ),
            // the on-disk designated timestamp is already a plain 8-byte column
            kind => copy::copy_fixed(
                fix,
                task.src_data_lo,
                task.src_data_hi,
                &task.dst_fix,
                task.dst_fix_offset,
                size_shift(kind)?,
            ),
        }
        Ok(())
    }

    fn merge_copy(task: &ColumnCopyTask) -> Result<()> {
        let index = task
            .merge_index
            .as_deref()
            .ok_or_else(|| MeridianError::InvariantViolation("merge block without merge index".into()))?;
        debug_assert_eq!(index.len(), range_len(task.src_ooo_lo, task.src_ooo_hi) + range_len(task.src_data_lo, task.src_data_hi));
        let entries = index.entries();
        match task.column_kind {
            ColumnKind::TimestampIndex => {
                shuffle::copy_timestamps(entries, &task.dst_fix, task.dst_fix_offset);
                return Ok(());
            }
            ColumnKind::String | ColumnKind::Binary => {
                let data_fix = region(&task.src_data_fix, "data fixed")?;
                let data_var = region(&task.src_data_var, "data var")?;
                let ooo_fix = region(&task.src_ooo_fix, "o3 fixed")?;
                let ooo_var = region(&task.src_ooo_var, "o3 var")?;
                let dst_var = region(&task.dst_var, "dst var")?;
                let merge = if task.column_kind == ColumnKind::String {
                    shuffle::merge_copy_str
                } else {
                    shuffle::merge_copy_bin
                };
                merge(
                    entries,
                    data_fix,
                    data_var,
                    ooo_fix,
                    ooo_var,
                    &task.dst_fix,
                    task.dst_fix_offset,
                    dst_var,
                    task.dst_var_offset,
                );
                return Ok(());
            }
            _ => {}
        }
        let data = region(&task.src_data_fix, "data fixed")?;
        let ooo = region(&task.src_ooo_fix, "o3 fixed")?;
        let dst = &task.dst_fix;
        match size_shift(task.column_kind)? {
            0 => shuffle::shuffle_8(data, ooo, dst, task.dst_fix_offset, entries),
            1 => shuffle::shuffle_16(data, ooo, dst, task.dst_fix_offset, entries),
            2 => shuffle::shuffle_32(data, ooo, dst, task.dst_fix_offset, entries),
            _ => shuffle::shuffle_64(data, ooo, dst, task.dst_fix_offset, entries),
        }
        Ok(())
    }

    /// Last task of the column: rebuild the bitmap index if the column
    /// is indexed, release the column's mappings, and if this was the
    /// partition's last column, free the merge index and signal the
    /// latch
    fn column_done(task: ColumnCopyTask) -> Result<()> {
        if let Some(target) = task.index.as_deref() {
            Self::update_index(&task, target)?;
        }

        let ColumnCopyTask {
            column_counter,
            done_latch,
            merge_index,
            src_data_fix,
            src_data_var,
            dst_fix,
            dst_var,
            ..
        } = task;
        drop(src_data_fix);
        drop(src_data_var);
        drop(dst_fix);
        drop(dst_var);

        if column_counter.fetch_sub(1, Ordering::AcqRel) == 1 {
            drop(merge_index);
            log::debug!("partition merge complete");
            done_latch.count_down();
        }
        Ok(())
    }

    /// Replay the freshly materialized symbol column into its bitmap
    /// index, mapping each 4-byte symbol id to its index key
    fn update_index(task: &ColumnCopyTask, target: &IndexTarget) -> Result<()> {
        let mut writer = BitmapIndexWriter::open(&target.dir, &target.name, target.block_value_count)?;
        let mut row = target.dst_index_offset / 4;
        let count = task.dst_fix_size / 4;
        log::debug!("indexing {} [{row}, {count})", target.name);
        while row < count {
            writer.add(to_index_key(task.dst_fix.get_i32(row * 4)), row)?;
            row += 1;
        }
        writer.close()
    }
}

fn region<'a>(mem: &'a Option<std::sync::Arc<MappedMemory>>, what: &str) -> Result<&'a MappedMemory> {
    mem.as_deref()
        .ok_or_else(|| MeridianError::InvariantViolation(format!("{what} region missing")))
}

/// Rows in an inclusive range; inverted ranges are empty
#[inline]
fn range_len(lo: u64, hi: u64) -> u64 {
    if hi < lo {
        0
    } else {
        hi - lo + 1
    }
}

fn size_shift(kind: ColumnKind) -> Result<u32> {
    kind.size_class()
        .map(|c| c.shift())
        .ok_or_else(|| MeridianError::InvariantViolation(format!("{kind:?} has no fixed cell width")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{CountDownLatch, TaskRing};
    use crate::ooo::merge_index::{MergeEntry, MergeIndex, Side};
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    fn fixed_task(
        part: u32,
        columns: u32,
        block_type: BlockType,
        latch: &Arc<CountDownLatch>,
    ) -> (ColumnCopyTask, Arc<MappedMemory>) {
        let src = Arc::new(MappedMemory::anon(32).unwrap());
        for i in 0..4 {
            src.put_i64(i * 8, 100 + i as i64);
        }
        let dst = Arc::new(MappedMemory::anon(64).unwrap());
        let task = ColumnCopyTask {
            column_counter: Arc::new(AtomicU32::new(columns)),
            part_counter: Arc::new(AtomicU32::new(part)),
            block_type,
            column_kind: ColumnKind::Long,
            src_data_fix: Some(Arc::clone(&src)),
            src_data_fix_size: 32,
            src_data_var: None,
            src_data_var_size: 0,
            src_data_lo: 0,
            src_data_hi: 3,
            src_ooo_fix: Some(Arc::clone(&src)),
            src_ooo_fix_size: 32,
            src_ooo_var: None,
            src_ooo_var_size: 0,
            src_ooo_lo: 0,
            src_ooo_hi: 3,
            dst_fix: Arc::clone(&dst),
            dst_fix_offset: 0,
            dst_fix_size: 64,
            dst_var: None,
            dst_var_offset: 0,
            dst_var_size: 0,
            merge_index: None,
            index: None,
            done_latch: Arc::clone(latch),
        };
        (task, dst)
    }

    #[test]
    fn test_empty_ooo_range_still_counts_down() {
        let latch = Arc::new(CountDownLatch::new(1));
        let (mut task, dst) = fixed_task(1, 1, BlockType::Ooo, &latch);
        task.src_ooo_lo = 5;
        task.src_ooo_hi = 4;
        dst.put_i64(0, -7);
        let part = Arc::clone(&task.part_counter);
        CopyJob::execute(task).unwrap();
        // nothing copied, counters and latch still ran down
        assert_eq!(dst.get_i64(0), -7);
        assert_eq!(part.load(Ordering::Acquire), 0);
        assert_eq!(latch.count(), 0);
    }

    #[test]
    fn test_merge_does_not_fall_through_to_ooo() {
        let latch = Arc::new(CountDownLatch::new(1));
        let (mut task, dst) = fixed_task(1, 1, BlockType::Merge, &latch);
        // two-entry merge: disk row 1, then o3 row 0; running the OO
        // copy on top of it would overwrite dst[0] with the o3 row
        task.src_data_lo = 1;
        task.src_data_hi = 1;
        task.src_ooo_lo = 0;
        task.src_ooo_hi = 0;
        task.merge_index = Some(Arc::new(MergeIndex::from_entries(vec![
            MergeEntry::new(0, Side::Data, 1),
            MergeEntry::new(1, Side::Ooo, 0),
        ])));
        CopyJob::execute(task).unwrap();
        assert_eq!(dst.get_i64(0), 101);
        assert_eq!(dst.get_i64(8), 100);
        assert_eq!(latch.count(), 0);
    }

    #[test]
    fn test_latch_fires_once_after_all_columns() {
        let latch = Arc::new(CountDownLatch::new(1));
        let column_counter = Arc::new(AtomicU32::new(2));

        // two columns, two parts each
        for _ in 0..2 {
            let part_counter = Arc::new(AtomicU32::new(2));
            for _ in 0..2 {
                let (mut task, _dst) = fixed_task(1, 1, BlockType::Data, &latch);
                task.part_counter = Arc::clone(&part_counter);
                task.column_counter = Arc::clone(&column_counter);
                CopyJob::execute(task).unwrap();
            }
        }
        assert_eq!(column_counter.load(Ordering::Acquire), 0);
        assert_eq!(latch.count(), 0);
    }

    #[test]
    fn test_ring_consumption_order() {
        let (mut tx, mut rx) = TaskRing::new(4);
        let latch = Arc::new(CountDownLatch::new(1));
        let (task, dst) = fixed_task(1, 1, BlockType::Data, &latch);
        assert!(tx.publish(task).is_ok());
        assert!(CopyJob::run(&mut rx).unwrap());
        assert!(!CopyJob::run(&mut rx).unwrap());
        assert_eq!(dst.get_i64(0), 100);
        latch.wait();
    }
}
