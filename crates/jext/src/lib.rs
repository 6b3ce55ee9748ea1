#![forbid(unsafe_code)]
//! Public API facade for the jext workspace.
//!
//! Re-exports the mounted-filesystem API from `jext-core` together with
//! the device and journal types a consumer needs to open a volume. This
//! is the crate downstream users depend on.

pub use jext_core::*;

pub use jext_block::{
    BlockDevice, ByteBlockDevice, ByteDevice, FileByteDevice, MemBlockDevice,
};
pub use jext_error::{JextError, Result};
pub use jext_journal::{JournalEngine, MemJournal, Txn};
pub use jext_types::{BlockNumber, ByteOffset, GroupNumber, InodeNumber};
