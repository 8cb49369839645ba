//! Storage module - memory-mapped regions and the column data model
//!
//! Column files are raw little-endian byte runs with no header (the
//! partition directory layout above this crate gives them meaning).
//! This module provides the owning mapped-region handles the merge
//! engine and the bitmap index operate on, plus the column type model.

pub mod column;
pub mod mem;

pub use column::{
    binary_entry_size, string_entry_size, ColumnKind, SizeClass, BINARY_LENGTH_BYTES, NULL_LEN,
    STRING_LENGTH_BYTES,
};
pub use mem::{GrowableMemory, MappedMemory};
