#![forbid(unsafe_code)]
//! On-disk format parsing and encoding for jext structures.
//!
//! Pure codec crate, no I/O and no side effects. Byte slices go in, typed
//! structures come out, and every writer has an `encode_into` that is the
//! exact inverse of its parser. Covers the superblock, group descriptors,
//! inode records, directory entries, hash-tree index blocks, and the
//! orphan table.

pub mod dirent;
pub mod group;
pub mod htree;
pub mod inode;
pub mod orphan;
pub mod superblock;

pub use dirent::{
    DIRENT_HEADER_SIZE, DirBlockIter, DirEntry, DirEntryRef, DirSlot, DirSlotIter, FileType,
    MAX_NAME_LEN, iter_dir_block, iter_dir_slots, lookup_in_dir_block, parse_dir_block,
    required_rec_len,
};
pub use group::{GROUP_DESC_SIZE, GroupDesc};
pub use htree::{
    DX_ENTRY_SIZE, DX_NODE_ENTRIES_OFFSET, DX_ROOT_ENTRIES_OFFSET, DxEntry, DxHash, DxNode,
    DxRoot, HTREE_EOF_HASH, HashVersion, dx_hash, dx_node_limit, dx_root_limit, find_leaf,
};
pub use inode::{
    DIND_BLOCK, IND_BLOCK, INODE_BASE_SIZE, InodeRecord, NDIR_BLOCKS, N_BLOCKS, TIND_BLOCK,
};
pub use orphan::{ORPHAN_TABLE_MAGIC, OrphanTable, orphan_table_capacity};
pub use superblock::{
    CompatFeatures, ErrorsPolicy, IncompatFeatures, RoCompatFeatures, STATE_CLEAN, STATE_ERRORS,
    STATE_ORPHAN_PENDING, Superblock,
};
