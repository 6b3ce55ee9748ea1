#![forbid(unsafe_code)]
//! Directory operations: entry management inside directory blocks and the
//! hash-tree index built over them.
//!
//! Three layers:
//! - block-level entry management ([`add_entry`], [`remove_entry`],
//!   [`init_dir_block`]) working on one directory block buffer;
//! - the hash-tree index ([`lookup`], [`insert`], [`remove`]) descending
//!   root and interior nodes to the leaf covering a name's hash, splitting
//!   leaves on overflow;
//! - hash-ordered enumeration ([`readdir`]) with a cursor that stays valid
//!   across concurrent splits.
//!
//! Every mutation rides the caller's transaction: declared, then dirtied,
//! never written to storage directly. Block access goes through
//! [`DirStore`], implemented by the filesystem layer that owns the
//! directory inode's block map.

pub mod cursor;
pub mod htree;

use jext_error::{JextError, Result};
use jext_journal::Txn;
use jext_ondisk::htree::HashVersion;
use jext_ondisk::{
    iter_dir_slots, required_rec_len, DirEntry, DirSlot, FileType, DIRENT_HEADER_SIZE,
    MAX_NAME_LEN,
};
use jext_types::{write_le_u16, write_le_u32, BlockNumber, InodeNumber, ParseError};

pub use cursor::{readdir, DirCursor, ReaddirChunk, ReaddirEntry};
pub use htree::{init_directory, insert, is_empty, lookup, remove};

// ── Configuration and storage seam ──────────────────────────────────────────

/// Per-mount directory behavior, resolved once at mount time.
#[derive(Debug, Clone, Copy)]
pub struct DirConfig {
    /// Hash algorithm for new indexes. An existing root recording a
    /// different version is rejected as corruption.
    pub hash_version: HashVersion,
    /// Hash seed from the superblock.
    pub seed: [u32; 4],
    /// Build a hash index when a one-block directory overflows.
    pub index_enabled: bool,
}

/// Storage access for one directory, implemented by the layer that owns
/// the inode's block map.
///
/// Logical block numbers are directory-relative; the index stores them,
/// not absolute device blocks, so nothing here changes if the directory
/// is relocated. `map` and `append` may touch mapping metadata (indirect
/// blocks, the inode record) inside the caller's transaction.
pub trait DirStore {
    /// Directory inode, for diagnostics.
    fn ino(&self) -> InodeNumber;

    /// Filesystem block size in bytes.
    fn block_size(&self) -> u32;

    /// Logical blocks currently mapped to the directory.
    fn block_count(&self) -> u32;

    /// Whether the inode carries the hash-index flag.
    fn is_indexed(&self) -> bool;

    /// Resolve a logical block to its device block. A hole inside a
    /// directory is corruption.
    fn map(&mut self, txn: &mut Txn<'_>, lblock: u32) -> Result<BlockNumber>;

    /// Allocate and map the next logical block. The caller declares the
    /// returned block as new metadata and initializes it.
    fn append(&mut self, txn: &mut Txn<'_>) -> Result<(u32, BlockNumber)>;

    /// Persist the hash-index flag on the inode.
    fn set_indexed(&mut self, txn: &mut Txn<'_>) -> Result<()>;
}

// ── Block-level entry management ────────────────────────────────────────────

/// Reject names the on-disk format cannot hold.
pub fn validate_name(name: &[u8]) -> Result<()> {
    if name.is_empty() {
        return Err(JextError::Format("empty directory entry name".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(JextError::NameTooLong);
    }
    if name.contains(&b'/') || name.contains(&0) {
        return Err(JextError::Format(
            "directory entry name contains '/' or NUL".into(),
        ));
    }
    Ok(())
}

fn block_corrupt(err: ParseError) -> JextError {
    JextError::Corruption {
        block: 0,
        detail: format!("directory block: {err}"),
    }
}

pub(crate) fn encode_entry(
    block: &mut [u8],
    offset: usize,
    ino: u32,
    rec_len: usize,
    file_type: FileType,
    name: &[u8],
) -> Result<()> {
    let entry = DirEntry {
        inode: ino,
        rec_len: u16::try_from(rec_len).map_err(|_| block_corrupt(ParseError::InvalidField {
            field: "de_rec_len",
            reason: "slot exceeds u16",
        }))?,
        file_type,
        name: name.to_vec(),
    };
    entry.encode_into(block, offset).map_err(block_corrupt)
}

/// Add an entry to a single directory block.
///
/// Reuses a deleted slot when one is large enough, otherwise carves the
/// slack off the first live entry with room. Returns the byte offset of
/// the new record, or [`JextError::NoSpace`] when the block is full.
pub fn add_entry(block: &mut [u8], ino: u32, name: &[u8], file_type: FileType) -> Result<usize> {
    if ino == 0 {
        return Err(JextError::Format(
            "directory entry inode cannot be zero".into(),
        ));
    }
    validate_name(name)?;
    let need = required_rec_len(name.len());

    let mut slots = Vec::new();
    for slot in iter_dir_slots(block) {
        slots.push(slot.map_err(block_corrupt)?);
    }

    for slot in slots {
        if slot.inode == 0 {
            if usize::from(slot.rec_len) >= need {
                encode_entry(block, slot.offset, ino, usize::from(slot.rec_len), file_type, name)?;
                return Ok(slot.offset);
            }
            continue;
        }
        let used = slot.used_len();
        if slot.free_len() >= need {
            // Shrink the live record to its real size and take the slack.
            let used_u16 = u16::try_from(used).map_err(|_| block_corrupt(ParseError::InvalidField {
                field: "de_rec_len",
                reason: "record size exceeds u16",
            }))?;
            write_le_u16(block, slot.offset + 4, used_u16).map_err(block_corrupt)?;
            let new_offset = slot.offset + used;
            encode_entry(block, new_offset, ino, slot.free_len(), file_type, name)?;
            return Ok(new_offset);
        }
    }

    Err(JextError::NoSpace)
}

/// Remove an entry from a single directory block by name.
///
/// The freed space merges into the preceding live record when there is
/// one; a leading entry is marked deleted in place. Returns `false` when
/// the name is not in this block.
pub fn remove_entry(block: &mut [u8], name: &[u8]) -> Result<bool> {
    validate_name(name)?;

    let mut slots = Vec::new();
    for slot in iter_dir_slots(block) {
        slots.push(slot.map_err(block_corrupt)?);
    }

    let mut prev_live: Option<DirSlot> = None;
    for slot in slots {
        if slot.inode == 0 {
            continue;
        }
        let name_start = slot.offset + DIRENT_HEADER_SIZE;
        let matches = &block[name_start..name_start + usize::from(slot.name_len)] == name;
        if !matches {
            prev_live = Some(slot);
            continue;
        }

        if let Some(prev) = prev_live {
            let merged = usize::from(prev.rec_len) + usize::from(slot.rec_len);
            let merged_u16 =
                u16::try_from(merged).map_err(|_| block_corrupt(ParseError::InvalidField {
                    field: "de_rec_len",
                    reason: "merged record exceeds u16",
                }))?;
            write_le_u16(block, prev.offset + 4, merged_u16).map_err(block_corrupt)?;
        }
        write_le_u32(block, slot.offset, 0).map_err(block_corrupt)?;
        block[slot.offset + 6] = 0;
        block[slot.offset + 7] = 0;
        return Ok(true);
    }

    Ok(false)
}

/// Initialize a directory's first block with `.` and `..` entries.
pub fn init_dir_block(block: &mut [u8], self_ino: u32, parent_ino: u32) -> Result<()> {
    let dot_len = required_rec_len(1);
    if block.len() < dot_len + required_rec_len(2) {
        return Err(JextError::Format(
            "block too small for '.' and '..' entries".into(),
        ));
    }
    block.fill(0);
    encode_entry(block, 0, self_ino, dot_len, FileType::Dir, b".")?;
    encode_entry(
        block,
        dot_len,
        parent_ino,
        block.len() - dot_len,
        FileType::Dir,
        b"..",
    )
}

/// Initialize a fresh non-first directory block: free slots spanning the
/// whole block, ready for [`add_entry`].
pub fn init_empty_dir_block(block: &mut [u8]) -> Result<()> {
    if block.len() < DIRENT_HEADER_SIZE {
        return Err(JextError::Format("directory block too small".into()));
    }
    block.fill(0);
    fill_free_space(block, 0)
}

/// Largest rec_len a record can carry: the u16 maximum rounded down to
/// the 4-byte grain.
pub(crate) const MAX_REC_LEN: usize = 0xFFFC;

/// Cover `[offset, block.len())` with deleted records. The span must be
/// at least one header long.
pub(crate) fn fill_free_space(block: &mut [u8], mut offset: usize) -> Result<()> {
    while offset < block.len() {
        let remaining = block.len() - offset;
        if remaining < DIRENT_HEADER_SIZE {
            return Err(JextError::Format(
                "directory free space fragment below the record header size".into(),
            ));
        }
        // One record when it fits in a u16; otherwise peel half-size
        // chunks, which keeps every remainder above the header size.
        let chunk = if remaining <= MAX_REC_LEN {
            remaining
        } else {
            0x8000
        };
        write_le_u32(block, offset, 0).map_err(block_corrupt)?;
        let chunk_u16 = u16::try_from(chunk).map_err(|_| {
            block_corrupt(ParseError::InvalidField {
                field: "de_rec_len",
                reason: "free chunk exceeds u16",
            })
        })?;
        write_le_u16(block, offset + 4, chunk_u16).map_err(block_corrupt)?;
        offset += chunk;
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;
    use jext_ondisk::{lookup_in_dir_block, parse_dir_block};

    const BS: usize = 1024;

    fn fresh_dir_block() -> Vec<u8> {
        let mut block = vec![0_u8; BS];
        init_dir_block(&mut block, 11, 2).expect("init");
        block
    }

    #[test]
    fn init_writes_dot_and_dotdot() {
        let block = fresh_dir_block();
        let entries = parse_dir_block(&block).expect("parse");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, b".".to_vec());
        assert_eq!(entries[0].inode, 11);
        assert_eq!(entries[1].name, b"..".to_vec());
        assert_eq!(entries[1].inode, 2);
        assert_eq!(usize::from(entries[0].rec_len) + usize::from(entries[1].rec_len), BS);
    }

    #[test]
    fn add_carves_slack_from_the_tail_entry() {
        let mut block = fresh_dir_block();
        let off = add_entry(&mut block, 20, b"alpha", FileType::RegFile).expect("add");
        // ".." shrinks to its real 12 bytes; the new record starts after it.
        assert_eq!(off, 24);
        let entries = parse_dir_block(&block).expect("parse");
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].inode, 20);
        assert_eq!(entries[2].name, b"alpha".to_vec());
        assert_eq!(usize::from(entries[2].rec_len), BS - 24);
    }

    #[test]
    fn add_reuses_a_deleted_slot() {
        let mut block = fresh_dir_block();
        add_entry(&mut block, 20, b"alpha", FileType::RegFile).expect("add");
        add_entry(&mut block, 21, b"beta", FileType::RegFile).expect("add");
        assert!(remove_entry(&mut block, b"alpha").expect("remove"));

        // "alpha"'s slot merged into "..", so the next add lands there.
        let off = add_entry(&mut block, 22, b"gamma", FileType::RegFile).expect("add");
        assert_eq!(off, 24);
        assert_eq!(lookup_in_dir_block(&block, b"gamma").expect("found").inode, 22);
        assert_eq!(lookup_in_dir_block(&block, b"beta").expect("found").inode, 21);
        assert!(lookup_in_dir_block(&block, b"alpha").is_none());
    }

    #[test]
    fn full_block_reports_nospace() {
        let mut block = fresh_dir_block();
        let mut added = 0_u32;
        loop {
            let name = format!("file{added:04}");
            match add_entry(&mut block, 100 + added, name.as_bytes(), FileType::RegFile) {
                Ok(_) => added += 1,
                Err(JextError::NoSpace) => break,
                Err(e) => panic!("unexpected error: {e:?}"),
            }
        }
        // 16 bytes per record over the space behind "." and "..".
        assert_eq!(added, u32::try_from((BS - 24) / 16).expect("fits"));

        // Everything added is still findable.
        let live = parse_dir_block(&block).expect("parse");
        assert_eq!(live.len(), 2 + added as usize);
    }

    #[test]
    fn remove_leading_entry_marks_slot_deleted() {
        let mut block = vec![0_u8; BS];
        init_empty_dir_block(&mut block).expect("init");
        add_entry(&mut block, 30, b"solo", FileType::RegFile).expect("add");
        assert!(remove_entry(&mut block, b"solo").expect("remove"));

        // No live predecessor: the record is zeroed in place, and the block
        // still parses with no live entries.
        assert_eq!(parse_dir_block(&block).expect("parse").len(), 0);
        let slots: Vec<DirSlot> = iter_dir_slots(&block)
            .map(|s| s.expect("slot"))
            .collect();
        assert_eq!(slots[0].inode, 0);
    }

    #[test]
    fn remove_missing_name_is_false() {
        let mut block = fresh_dir_block();
        assert!(!remove_entry(&mut block, b"ghost").expect("remove"));
    }

    #[test]
    fn rec_lens_always_tile_the_block() {
        let mut block = fresh_dir_block();
        for i in 0..20 {
            let name = format!("entry-{i}");
            add_entry(&mut block, 50 + i, name.as_bytes(), FileType::RegFile).expect("add");
        }
        remove_entry(&mut block, b"entry-7").expect("remove");
        remove_entry(&mut block, b"entry-8").expect("remove");
        add_entry(&mut block, 99, b"replacement", FileType::RegFile).expect("add");

        let total: usize = iter_dir_slots(&block)
            .map(|s| usize::from(s.expect("slot").rec_len))
            .sum();
        assert_eq!(total, BS);
    }

    #[test]
    fn rejected_names() {
        let mut block = fresh_dir_block();
        assert!(matches!(
            add_entry(&mut block, 1, b"", FileType::RegFile),
            Err(JextError::Format(_))
        ));
        assert!(matches!(
            add_entry(&mut block, 1, &[b'x'; 256], FileType::RegFile),
            Err(JextError::NameTooLong)
        ));
        assert!(matches!(
            add_entry(&mut block, 1, b"a/b", FileType::RegFile),
            Err(JextError::Format(_))
        ));
        assert!(matches!(
            add_entry(&mut block, 0, b"ok", FileType::RegFile),
            Err(JextError::Format(_))
        ));
    }

    #[test]
    fn corrupt_block_is_reported_not_trusted() {
        let mut block = fresh_dir_block();
        // rec_len of "." below the header size.
        block[4..6].copy_from_slice(&4_u16.to_le_bytes());
        assert!(matches!(
            add_entry(&mut block, 5, b"x", FileType::RegFile),
            Err(JextError::Corruption { .. })
        ));
        assert!(matches!(
            remove_entry(&mut block, b"x"),
            Err(JextError::Corruption { .. })
        ));
    }
}
