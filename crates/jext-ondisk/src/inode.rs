//! Inode records: 128-byte base layout, optionally padded to the
//! superblock's `inode_size` with an extended area.
//!
//! Block mapping uses 15 pointer slots: 12 direct, then one each of
//! indirect, double-indirect, and triple-indirect.

use jext_types::{
    Generation, ParseError, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG, read_le_u16, read_le_u32,
    write_le_u16, write_le_u32,
};
use serde::{Deserialize, Serialize};

/// Direct block pointers per inode.
pub const NDIR_BLOCKS: usize = 12;
/// Slot index of the single-indirect block.
pub const IND_BLOCK: usize = 12;
/// Slot index of the double-indirect block.
pub const DIND_BLOCK: usize = 13;
/// Slot index of the triple-indirect block.
pub const TIND_BLOCK: usize = 14;
/// Total pointer slots.
pub const N_BLOCKS: usize = 15;

/// Size of the base inode layout.
pub const INODE_BASE_SIZE: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeRecord {
    pub mode: u16,
    pub uid: u32,
    pub gid: u32,
    /// Byte length. For regular files the high 32 bits live in the
    /// `i_dir_acl` slot on disk.
    pub size: u64,
    pub links_count: u16,
    /// Allocation charge in 512-byte sectors.
    pub blocks_512: u32,
    pub flags: u32,
    pub generation: Generation,
    pub file_acl: u32,

    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,

    /// Block map: slots `0..12` direct, then indirect, double, triple.
    pub block: [u32; N_BLOCKS],

    pub extra_isize: u16,
}

impl InodeRecord {
    /// A zeroed record with just the mode set.
    #[must_use]
    pub fn new(mode: u16) -> Self {
        Self {
            mode,
            uid: 0,
            gid: 0,
            size: 0,
            links_count: 0,
            blocks_512: 0,
            flags: 0,
            generation: Generation(0),
            file_acl: 0,
            atime: 0,
            ctime: 0,
            mtime: 0,
            dtime: 0,
            block: [0; N_BLOCKS],
            extra_isize: 0,
        }
    }

    /// Parse an inode record. Requires at least the 128-byte base area;
    /// the extended area is read when the buffer carries it.
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < INODE_BASE_SIZE {
            return Err(ParseError::InsufficientData {
                needed: INODE_BASE_SIZE,
                offset: 0,
                actual: bytes.len(),
            });
        }

        let mode = read_le_u16(bytes, 0x00)?;
        let uid_lo = u32::from(read_le_u16(bytes, 0x02)?);
        let gid_lo = u32::from(read_le_u16(bytes, 0x18)?);
        let uid_hi = u32::from(read_le_u16(bytes, 0x78)?);
        let gid_hi = u32::from(read_le_u16(bytes, 0x7A)?);

        let size_lo = u64::from(read_le_u32(bytes, 0x04)?);
        // The dir_acl slot doubles as size_high for regular files only.
        let size = if mode & S_IFMT == S_IFREG {
            size_lo | (u64::from(read_le_u32(bytes, 0x6C)?) << 32)
        } else {
            size_lo
        };

        let mut block = [0_u32; N_BLOCKS];
        for (slot, value) in block.iter_mut().enumerate() {
            *value = read_le_u32(bytes, 0x28 + slot * 4)?;
        }

        let extra_isize = if bytes.len() >= 0x82 {
            read_le_u16(bytes, 0x80)?
        } else {
            0
        };

        Ok(Self {
            mode,
            uid: uid_lo | (uid_hi << 16),
            gid: gid_lo | (gid_hi << 16),
            size,
            links_count: read_le_u16(bytes, 0x1A)?,
            blocks_512: read_le_u32(bytes, 0x1C)?,
            flags: read_le_u32(bytes, 0x20)?,
            generation: Generation(read_le_u32(bytes, 0x64)?),
            file_acl: read_le_u32(bytes, 0x68)?,
            atime: read_le_u32(bytes, 0x08)?,
            ctime: read_le_u32(bytes, 0x0C)?,
            mtime: read_le_u32(bytes, 0x10)?,
            dtime: read_le_u32(bytes, 0x14)?,
            block,
            extra_isize,
        })
    }

    /// Encode into an inode slot. The buffer is the full `inode_size`
    /// region and is fully rewritten.
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode_into(&self, bytes: &mut [u8]) -> Result<(), ParseError> {
        if bytes.len() < INODE_BASE_SIZE {
            return Err(ParseError::InsufficientData {
                needed: INODE_BASE_SIZE,
                offset: 0,
                actual: bytes.len(),
            });
        }
        bytes.fill(0);

        write_le_u16(bytes, 0x00, self.mode)?;
        write_le_u16(bytes, 0x02, self.uid as u16)?;
        write_le_u32(bytes, 0x04, self.size as u32)?;
        write_le_u32(bytes, 0x08, self.atime)?;
        write_le_u32(bytes, 0x0C, self.ctime)?;
        write_le_u32(bytes, 0x10, self.mtime)?;
        write_le_u32(bytes, 0x14, self.dtime)?;
        write_le_u16(bytes, 0x18, self.gid as u16)?;
        write_le_u16(bytes, 0x1A, self.links_count)?;
        write_le_u32(bytes, 0x1C, self.blocks_512)?;
        write_le_u32(bytes, 0x20, self.flags)?;
        for (slot, value) in self.block.iter().enumerate() {
            write_le_u32(bytes, 0x28 + slot * 4, *value)?;
        }
        write_le_u32(bytes, 0x64, self.generation.0)?;
        write_le_u32(bytes, 0x68, self.file_acl)?;
        if self.mode & S_IFMT == S_IFREG {
            write_le_u32(bytes, 0x6C, (self.size >> 32) as u32)?;
        }
        write_le_u16(bytes, 0x78, (self.uid >> 16) as u16)?;
        write_le_u16(bytes, 0x7A, (self.gid >> 16) as u16)?;

        if bytes.len() >= 0x82 {
            write_le_u16(bytes, 0x80, self.extra_isize)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    /// Whether the inode is free (never used or fully deleted).
    #[must_use]
    pub fn is_unused(&self) -> bool {
        self.links_count == 0 && self.mode == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inode_round_trips_base_fields() {
        let mut rec = InodeRecord::new(S_IFDIR | 0o755);
        rec.uid = 0x0001_0002;
        rec.gid = 0x0003_0004;
        rec.size = 4096;
        rec.links_count = 3;
        rec.blocks_512 = 8;
        rec.flags = jext_types::JEXT_INDEX_FL;
        rec.generation = Generation(42);
        rec.atime = 100;
        rec.ctime = 101;
        rec.mtime = 102;
        rec.dtime = 0;
        rec.block[0] = 1234;
        rec.block[IND_BLOCK] = 5678;
        rec.block[TIND_BLOCK] = 9999;

        let mut bytes = [0_u8; INODE_BASE_SIZE];
        rec.encode_into(&mut bytes).expect("encode");
        let parsed = InodeRecord::parse_from_bytes(&bytes).expect("parse");
        assert_eq!(rec, parsed);
        assert!(parsed.is_dir());
        assert!(!parsed.is_regular());
    }

    #[test]
    fn regular_file_size_uses_high_slot() {
        let mut rec = InodeRecord::new(S_IFREG | 0o644);
        rec.size = (5_u64 << 32) | 77;
        rec.links_count = 1;

        let mut bytes = [0_u8; INODE_BASE_SIZE];
        rec.encode_into(&mut bytes).expect("encode");
        assert_eq!(u32::from_le_bytes([bytes[0x04], bytes[0x05], bytes[0x06], bytes[0x07]]), 77);
        assert_eq!(u32::from_le_bytes([bytes[0x6C], bytes[0x6D], bytes[0x6E], bytes[0x6F]]), 5);

        let parsed = InodeRecord::parse_from_bytes(&bytes).expect("parse");
        assert_eq!(parsed.size, (5_u64 << 32) | 77);
    }

    #[test]
    fn directory_size_stays_32_bit() {
        let mut bytes = [0_u8; INODE_BASE_SIZE];
        let mut rec = InodeRecord::new(S_IFDIR | 0o700);
        rec.size = 2048;
        rec.encode_into(&mut bytes).expect("encode");
        // Poke garbage into the dir_acl slot; directories must ignore it.
        bytes[0x6C..0x70].copy_from_slice(&0xFFFF_FFFF_u32.to_le_bytes());
        let parsed = InodeRecord::parse_from_bytes(&bytes).expect("parse");
        assert_eq!(parsed.size, 2048);
    }

    #[test]
    fn extended_record_carries_extra_isize() {
        let mut rec = InodeRecord::new(S_IFREG | 0o600);
        rec.extra_isize = 32;
        let mut bytes = [0_u8; 256];
        rec.encode_into(&mut bytes).expect("encode");
        let parsed = InodeRecord::parse_from_bytes(&bytes).expect("parse");
        assert_eq!(parsed.extra_isize, 32);
    }

    #[test]
    fn parse_rejects_short_buffer() {
        assert!(InodeRecord::parse_from_bytes(&[0_u8; 64]).is_err());
    }

    #[test]
    fn unused_detection() {
        let rec = InodeRecord::new(0);
        assert!(rec.is_unused());
        let live = InodeRecord::new(S_IFREG);
        assert!(!live.is_unused());
    }
}
