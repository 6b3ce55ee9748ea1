//! Block group descriptors: 32 bytes each, packed into the descriptor
//! table that follows the superblock.

use jext_types::{
    BlockNumber, FsGeometry, GroupNumber, ParseError, read_le_u16, read_le_u32, write_le_u16,
    write_le_u32,
};
use serde::{Deserialize, Serialize};

/// On-disk size of one group descriptor.
pub const GROUP_DESC_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDesc {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
}

impl GroupDesc {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < GROUP_DESC_SIZE {
            return Err(ParseError::InsufficientData {
                needed: GROUP_DESC_SIZE,
                offset: 0,
                actual: bytes.len(),
            });
        }

        Ok(Self {
            block_bitmap: read_le_u32(bytes, 0x00)?,
            inode_bitmap: read_le_u32(bytes, 0x04)?,
            inode_table: read_le_u32(bytes, 0x08)?,
            free_blocks_count: read_le_u16(bytes, 0x0C)?,
            free_inodes_count: read_le_u16(bytes, 0x0E)?,
            used_dirs_count: read_le_u16(bytes, 0x10)?,
        })
    }

    pub fn encode_into(&self, bytes: &mut [u8]) -> Result<(), ParseError> {
        if bytes.len() < GROUP_DESC_SIZE {
            return Err(ParseError::InsufficientData {
                needed: GROUP_DESC_SIZE,
                offset: 0,
                actual: bytes.len(),
            });
        }

        write_le_u32(bytes, 0x00, self.block_bitmap)?;
        write_le_u32(bytes, 0x04, self.inode_bitmap)?;
        write_le_u32(bytes, 0x08, self.inode_table)?;
        write_le_u16(bytes, 0x0C, self.free_blocks_count)?;
        write_le_u16(bytes, 0x0E, self.free_inodes_count)?;
        write_le_u16(bytes, 0x10, self.used_dirs_count)?;
        Ok(())
    }

    /// Check that the bitmap and inode table blocks fall inside their
    /// group's block range.
    pub fn validate(&self, geo: &FsGeometry, group: GroupNumber) -> Result<(), ParseError> {
        let first = geo.group_block_to_absolute(group, 0).0;
        let last = first + u64::from(geo.blocks_in_group(group));

        let in_group = |block: u32| {
            let b = u64::from(block);
            b >= first && b < last
        };

        if !in_group(self.block_bitmap) {
            return Err(ParseError::InvalidField {
                field: "bg_block_bitmap",
                reason: "outside its block group",
            });
        }
        if !in_group(self.inode_bitmap) {
            return Err(ParseError::InvalidField {
                field: "bg_inode_bitmap",
                reason: "outside its block group",
            });
        }
        if !in_group(self.inode_table) {
            return Err(ParseError::InvalidField {
                field: "bg_inode_table",
                reason: "outside its block group",
            });
        }
        let table_end = u64::from(self.inode_table) + u64::from(geo.inode_table_blocks());
        if table_end > last {
            return Err(ParseError::InvalidField {
                field: "bg_inode_table",
                reason: "inode table extends past group",
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn block_bitmap_block(&self) -> BlockNumber {
        BlockNumber(u64::from(self.block_bitmap))
    }

    #[must_use]
    pub fn inode_bitmap_block(&self) -> BlockNumber {
        BlockNumber(u64::from(self.inode_bitmap))
    }

    #[must_use]
    pub fn inode_table_block(&self) -> BlockNumber {
        BlockNumber(u64::from(self.inode_table))
    }
}
