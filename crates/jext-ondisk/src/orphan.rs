//! Orphan table: a dedicated block listing inodes that were unlinked (or
//! mid-truncate) inside a committed transaction but not yet reclaimed.
//!
//! Layout: magic(4), count(4), then `count` little-endian u32 inode
//! numbers. The final 4 bytes of the block hold a CRC32C over everything
//! before them. Recovery replays this table after the journal, so a torn
//! table must be detectable; the checksum covers that.

use jext_types::{InodeNumber, ParseError, read_le_u32, write_le_u32};
use serde::{Deserialize, Serialize};

/// Magic tag in the table's first word.
pub const ORPHAN_TABLE_MAGIC: u32 = 0x0BF5_A9E1;

/// Header bytes before the entries.
const HEADER_SIZE: usize = 8;
/// Trailing checksum bytes.
const CHECKSUM_SIZE: usize = 4;

/// Entries one table block can hold.
#[must_use]
pub fn orphan_table_capacity(block_size: u32) -> usize {
    (block_size as usize).saturating_sub(HEADER_SIZE + CHECKSUM_SIZE) / 4
}

/// In-memory image of the orphan table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanTable {
    pub inodes: Vec<InodeNumber>,
}

impl OrphanTable {
    #[must_use]
    pub fn len(&self) -> usize {
        self.inodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inodes.is_empty()
    }

    #[must_use]
    pub fn contains(&self, ino: InodeNumber) -> bool {
        self.inodes.contains(&ino)
    }

    /// Parse and verify a table block.
    pub fn parse_from_block(block: &[u8]) -> Result<Self, ParseError> {
        if block.len() < HEADER_SIZE + CHECKSUM_SIZE {
            return Err(ParseError::InsufficientData {
                needed: HEADER_SIZE + CHECKSUM_SIZE,
                offset: 0,
                actual: block.len(),
            });
        }

        let magic = read_le_u32(block, 0)?;
        if magic != ORPHAN_TABLE_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(ORPHAN_TABLE_MAGIC),
                actual: u64::from(magic),
            });
        }

        let body_end = block.len() - CHECKSUM_SIZE;
        let stored_csum = read_le_u32(block, body_end)?;
        let computed = crc32c::crc32c(&block[..body_end]);
        if stored_csum != computed {
            return Err(ParseError::InvalidField {
                field: "ot_checksum",
                reason: "crc32c mismatch",
            });
        }

        let count = read_le_u32(block, 4)? as usize;
        let capacity = (body_end - HEADER_SIZE) / 4;
        if count > capacity {
            return Err(ParseError::InvalidField {
                field: "ot_count",
                reason: "count exceeds block capacity",
            });
        }

        let mut inodes = Vec::with_capacity(count);
        for slot in 0..count {
            let raw = read_le_u32(block, HEADER_SIZE + slot * 4)?;
            if raw == 0 {
                return Err(ParseError::InvalidField {
                    field: "ot_entry",
                    reason: "zero inode number",
                });
            }
            inodes.push(InodeNumber(u64::from(raw)));
        }

        Ok(Self { inodes })
    }

    /// Encode the table, checksum included. The whole block is rewritten.
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode_into(&self, block: &mut [u8]) -> Result<(), ParseError> {
        if block.len() < HEADER_SIZE + CHECKSUM_SIZE {
            return Err(ParseError::InsufficientData {
                needed: HEADER_SIZE + CHECKSUM_SIZE,
                offset: 0,
                actual: block.len(),
            });
        }
        let body_end = block.len() - CHECKSUM_SIZE;
        let capacity = (body_end - HEADER_SIZE) / 4;
        if self.inodes.len() > capacity {
            return Err(ParseError::InvalidField {
                field: "ot_count",
                reason: "count exceeds block capacity",
            });
        }

        block.fill(0);
        write_le_u32(block, 0, ORPHAN_TABLE_MAGIC)?;
        write_le_u32(block, 4, self.inodes.len() as u32)?;
        for (slot, ino) in self.inodes.iter().enumerate() {
            let raw = u32::try_from(ino.0).map_err(|_| ParseError::IntegerConversion {
                field: "ot_entry",
            })?;
            if raw == 0 {
                return Err(ParseError::InvalidField {
                    field: "ot_entry",
                    reason: "zero inode number",
                });
            }
            write_le_u32(block, HEADER_SIZE + slot * 4, raw)?;
        }

        let csum = crc32c::crc32c(&block[..body_end]);
        write_le_u32(block, body_end, csum)?;
        Ok(())
    }
}
