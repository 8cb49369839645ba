//! Meridian Columnar Time-Series Storage Core
//!
//! The two hard subsystems of the engine:
//! - the out-of-order (O3) merge engine, which splices a sorted batch of
//!   late rows into an existing partition of memory-mapped column files
//! - the bitmap index writer, which maintains a two-file inverted index
//!   with lock-free atomic visibility for concurrent readers
//!
//! Everything else (SQL, planning, the table writer's transaction
//! envelope, partition discovery) lives above this crate and talks to it
//! through plain data carriers and the task ring.

pub mod config;
pub mod exec;
pub mod index;
pub mod ooo;
pub mod storage;

// Re-export main types
pub use config::EngineConfig;
pub use index::{BitmapIndexReader, BitmapIndexWriter};
pub use ooo::{BlockType, ColumnCopyTask, CopyJob, MergeIndex, PartitionMergeTask};
pub use storage::{ColumnKind, GrowableMemory, MappedMemory, SizeClass};

/// Storage engine error type
#[derive(Debug, thiserror::Error)]
pub enum MeridianError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt index {}: {reason}", path.display())]
    CorruptIndex { path: std::path::PathBuf, reason: String },

    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

pub type Result<T> = std::result::Result<T, MeridianError>;
