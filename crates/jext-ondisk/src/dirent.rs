//! Directory entries: variable-length records packed into directory
//! blocks.
//!
//! Each record is an 8-byte header (inode, rec_len, name_len, file_type)
//! followed by the name, padded to a 4-byte boundary. A record's `rec_len`
//! may exceed its used size; the slack is where new entries go. Deleted
//! entries have `inode == 0` and their space is absorbed by a neighbor or
//! reused in place.

use jext_types::{
    ParseError, S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK,
    ensure_slice, read_le_u16, read_le_u32, write_le_u16, write_le_u32,
};
use serde::{Deserialize, Serialize};

/// Longest permitted entry name.
pub const MAX_NAME_LEN: usize = 255;

/// Header bytes before the name.
pub const DIRENT_HEADER_SIZE: usize = 8;

/// File type tags stored in directory entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FileType {
    Unknown = 0,
    RegFile = 1,
    Dir = 2,
    Chrdev = 3,
    Blkdev = 4,
    Fifo = 5,
    Sock = 6,
    Symlink = 7,
}

impl FileType {
    #[must_use]
    pub fn from_raw(val: u8) -> Self {
        match val {
            1 => Self::RegFile,
            2 => Self::Dir,
            3 => Self::Chrdev,
            4 => Self::Blkdev,
            5 => Self::Fifo,
            6 => Self::Sock,
            7 => Self::Symlink,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn to_raw(self) -> u8 {
        self as u8
    }

    /// Derive the tag from an inode mode.
    #[must_use]
    pub fn from_mode(mode: u16) -> Self {
        match mode & S_IFMT {
            S_IFREG => Self::RegFile,
            S_IFDIR => Self::Dir,
            S_IFCHR => Self::Chrdev,
            S_IFBLK => Self::Blkdev,
            S_IFIFO => Self::Fifo,
            S_IFSOCK => Self::Sock,
            S_IFLNK => Self::Symlink,
            _ => Self::Unknown,
        }
    }
}

/// Bytes a record with an `n`-byte name occupies (header + name, padded to
/// 4 bytes).
#[must_use]
pub fn required_rec_len(name_len: usize) -> usize {
    (DIRENT_HEADER_SIZE + name_len + 3) & !3
}

/// An owned directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub inode: u32,
    pub rec_len: u16,
    pub file_type: FileType,
    pub name: Vec<u8>,
}

impl DirEntry {
    /// Build an entry sized exactly for its name.
    pub fn new(inode: u32, file_type: FileType, name: &[u8]) -> Result<Self, ParseError> {
        if name.is_empty() {
            return Err(ParseError::InvalidField {
                field: "de_name_len",
                reason: "empty name",
            });
        }
        if name.len() > MAX_NAME_LEN {
            return Err(ParseError::InvalidField {
                field: "de_name_len",
                reason: "name exceeds 255 bytes",
            });
        }
        #[allow(clippy::cast_possible_truncation)]
        let rec_len = required_rec_len(name.len()) as u16;
        Ok(Self {
            inode,
            rec_len,
            file_type,
            name: name.to_vec(),
        })
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn name_len(&self) -> u8 {
        self.name.len() as u8
    }

    /// Bytes this entry actually needs (its `rec_len` may be larger).
    #[must_use]
    pub fn used_len(&self) -> usize {
        required_rec_len(self.name.len())
    }

    /// Write the record at `offset`, spanning `self.rec_len` bytes.
    pub fn encode_into(&self, block: &mut [u8], offset: usize) -> Result<(), ParseError> {
        if usize::from(self.rec_len) < self.used_len() {
            return Err(ParseError::InvalidField {
                field: "de_rec_len",
                reason: "rec_len smaller than record",
            });
        }
        let end = offset
            .checked_add(usize::from(self.rec_len))
            .ok_or(ParseError::InvalidField {
                field: "de_rec_len",
                reason: "overflow",
            })?;
        if end > block.len() {
            return Err(ParseError::InsufficientData {
                needed: usize::from(self.rec_len),
                offset,
                actual: block.len().saturating_sub(offset),
            });
        }

        write_le_u32(block, offset, self.inode)?;
        write_le_u16(block, offset + 4, self.rec_len)?;
        block[offset + 6] = self.name_len();
        block[offset + 7] = self.file_type.to_raw();
        let name_start = offset + DIRENT_HEADER_SIZE;
        block[name_start..name_start + self.name.len()].copy_from_slice(&self.name);
        // Zero the padding and slack so stale names never leak.
        block[name_start + self.name.len()..end].fill(0);
        Ok(())
    }

    /// Return the name as a UTF-8 string (lossy).
    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    #[must_use]
    pub fn is_dot(&self) -> bool {
        self.name == b"."
    }

    #[must_use]
    pub fn is_dotdot(&self) -> bool {
        self.name == b".."
    }
}

/// A borrowed directory entry (zero-copy reference into the block buffer).
///
/// Carries the byte offset of the record so callers can edit it in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntryRef<'a> {
    pub offset: usize,
    pub inode: u32,
    pub rec_len: u16,
    pub file_type: FileType,
    pub name: &'a [u8],
}

impl DirEntryRef<'_> {
    /// Convert to an owned [`DirEntry`] (allocates name bytes).
    #[must_use]
    pub fn to_owned_entry(&self) -> DirEntry {
        DirEntry {
            inode: self.inode,
            rec_len: self.rec_len,
            file_type: self.file_type,
            name: self.name.to_vec(),
        }
    }

    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(self.name).into_owned()
    }

    #[must_use]
    pub fn is_dot(&self) -> bool {
        self.name == b"."
    }

    #[must_use]
    pub fn is_dotdot(&self) -> bool {
        self.name == b".."
    }
}

/// A physical record slot, live or deleted.
///
/// Unlike [`DirEntryRef`] this includes `inode == 0` slots, which is what
/// insertion and compaction need to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirSlot {
    pub offset: usize,
    pub inode: u32,
    pub rec_len: u16,
    pub name_len: u8,
}

impl DirSlot {
    /// Bytes actually used by the record in this slot (0 when deleted).
    #[must_use]
    pub fn used_len(&self) -> usize {
        if self.inode == 0 {
            0
        } else {
            required_rec_len(usize::from(self.name_len))
        }
    }

    /// Slack bytes available past the record.
    #[must_use]
    pub fn free_len(&self) -> usize {
        usize::from(self.rec_len).saturating_sub(self.used_len())
    }
}

fn read_slot(block: &[u8], offset: usize) -> Result<DirSlot, ParseError> {
    let inode = read_le_u32(block, offset)?;
    let rec_len = read_le_u16(block, offset + 4)?;
    let name_len = ensure_slice(block, offset + 6, 1)?[0];

    if rec_len < 8 || usize::from(rec_len) % 4 != 0 {
        return Err(ParseError::InvalidField {
            field: "de_rec_len",
            reason: "must be a 4-byte multiple >= 8",
        });
    }
    let end = offset
        .checked_add(usize::from(rec_len))
        .ok_or(ParseError::InvalidField {
            field: "de_rec_len",
            reason: "overflow",
        })?;
    if end > block.len() {
        return Err(ParseError::InvalidField {
            field: "de_rec_len",
            reason: "record extends past block boundary",
        });
    }
    if inode != 0 && offset + DIRENT_HEADER_SIZE + usize::from(name_len) > end {
        return Err(ParseError::InvalidField {
            field: "de_name_len",
            reason: "name extends past rec_len",
        });
    }

    Ok(DirSlot {
        offset,
        inode,
        rec_len,
        name_len,
    })
}

/// Iterator over every physical slot in a directory block.
#[derive(Debug)]
pub struct DirSlotIter<'a> {
    block: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> Iterator for DirSlotIter<'a> {
    type Item = Result<DirSlot, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset + DIRENT_HEADER_SIZE > self.block.len() {
            return None;
        }
        match read_slot(self.block, self.offset) {
            Ok(slot) => {
                self.offset += usize::from(slot.rec_len);
                Some(Ok(slot))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Iterate every record slot (including deleted ones) in a block.
#[must_use]
pub fn iter_dir_slots(block: &[u8]) -> DirSlotIter<'_> {
    DirSlotIter {
        block,
        offset: 0,
        done: false,
    }
}

/// A zero-allocation iterator over live directory entries in a block.
///
/// Yields `Result<DirEntryRef<'a>, ParseError>` for each entry with
/// `inode != 0`, skipping deleted slots.
#[derive(Debug)]
pub struct DirBlockIter<'a> {
    block: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> DirBlockIter<'a> {
    #[must_use]
    pub fn new(block: &'a [u8]) -> Self {
        Self {
            block,
            offset: 0,
            done: false,
        }
    }
}

impl<'a> Iterator for DirBlockIter<'a> {
    type Item = Result<DirEntryRef<'a>, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done || self.offset + DIRENT_HEADER_SIZE > self.block.len() {
                return None;
            }

            let slot = match read_slot(self.block, self.offset) {
                Ok(slot) => slot,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };
            let start = self.offset;
            self.offset += usize::from(slot.rec_len);

            if slot.inode == 0 {
                continue;
            }

            let file_type_raw = self.block[start + 7];
            let name_start = start + DIRENT_HEADER_SIZE;
            let name = &self.block[name_start..name_start + usize::from(slot.name_len)];

            return Some(Ok(DirEntryRef {
                offset: start,
                inode: slot.inode,
                rec_len: slot.rec_len,
                file_type: FileType::from_raw(file_type_raw),
                name,
            }));
        }
    }
}

/// Iterate live directory entries in a block buffer.
#[must_use]
pub fn iter_dir_block(block: &[u8]) -> DirBlockIter<'_> {
    DirBlockIter::new(block)
}

/// Parse all live directory entries from a block.
pub fn parse_dir_block(block: &[u8]) -> Result<Vec<DirEntry>, ParseError> {
    iter_dir_block(block)
        .map(|entry| entry.map(|e| e.to_owned_entry()))
        .collect()
}

/// Look up a single name in a directory block.
#[must_use]
pub fn lookup_in_dir_block(block: &[u8], target: &[u8]) -> Option<DirEntry> {
    iter_dir_block(block)
        .filter_map(Result::ok)
        .find(|e| e.name == target)
        .map(|e| e.to_owned_entry())
}
