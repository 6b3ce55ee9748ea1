//! Superblock layout: the 1024-byte region at byte offset 1024.
//!
//! All multi-byte fields are little-endian. `parse_superblock_region` and
//! `encode_into` are exact inverses over the fields jext maintains;
//! unrecognized regions of the superblock are preserved as zeroes.

use jext_types::{
    BlockSize, FsGeometry, ParseError, SUPER_MAGIC, SUPERBLOCK_SIZE, ensure_slice, read_fixed,
    read_le_u16, read_le_u32, trim_nul_padded, write_bytes, write_le_u16, write_le_u32,
};
use serde::{Deserialize, Serialize};

// ── Filesystem state flags (s_state) ────────────────────────────────────────

/// Cleanly unmounted.
pub const STATE_CLEAN: u16 = 0x0001;
/// Errors were detected and recorded.
pub const STATE_ERRORS: u16 = 0x0002;
/// The orphan table holds entries that recovery must process.
pub const STATE_ORPHAN_PENDING: u16 = 0x0004;

// ── On-error policy (s_errors) ──────────────────────────────────────────────

/// What to do when metadata damage is detected at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorsPolicy {
    /// Log and keep going.
    Continue,
    /// Degrade to read-only.
    RemountReadOnly,
    /// Refuse all further operations.
    Halt,
}

impl ErrorsPolicy {
    /// Decode the on-disk policy value. Unknown values fall back to
    /// `Continue`.
    #[must_use]
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            2 => Self::RemountReadOnly,
            3 => Self::Halt,
            _ => Self::Continue,
        }
    }

    #[must_use]
    pub fn to_raw(self) -> u16 {
        match self {
            Self::Continue => 1,
            Self::RemountReadOnly => 2,
            Self::Halt => 3,
        }
    }
}

// ── Feature flags ───────────────────────────────────────────────────────────

/// Compatible feature flags (`s_feature_compat`).
///
/// Advisory; unknown bits are safe to ignore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatFeatures(pub u32);

impl CompatFeatures {
    pub const HAS_JOURNAL: Self = Self(0x0004);
    pub const EXT_ATTR: Self = Self(0x0008);
    pub const RESIZE_INODE: Self = Self(0x0010);
    pub const DIR_INDEX: Self = Self(0x0020);

    const KNOWN: &[(u32, &'static str)] = &[
        (0x0004, "HAS_JOURNAL"),
        (0x0008, "EXT_ATTR"),
        (0x0010, "RESIZE_INODE"),
        (0x0020, "DIR_INDEX"),
    ];

    #[must_use]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
    }

    /// Names of all set flags. Unknown bits are omitted.
    #[must_use]
    pub fn describe(self) -> Vec<&'static str> {
        describe_flags(self.0, Self::KNOWN)
    }

    #[must_use]
    pub fn unknown_bits(self) -> u32 {
        unknown_bits(self.0, Self::KNOWN)
    }
}

impl std::fmt::Display for CompatFeatures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        format_flags(f, self.0, Self::KNOWN)
    }
}

/// Incompatible feature flags (`s_feature_incompat`).
///
/// Unknown bits MUST cause mount failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncompatFeatures(pub u32);

impl IncompatFeatures {
    pub const FILETYPE: Self = Self(0x0002);
    pub const RECOVER: Self = Self(0x0004);
    pub const JOURNAL_DEV: Self = Self(0x0008);
    pub const META_BG: Self = Self(0x0010);

    /// Features every jext volume carries.
    pub const REQUIRED: Self = Self(Self::FILETYPE.0);

    /// Bits a mount can proceed with.
    pub const ALLOWED: Self = Self(Self::FILETYPE.0 | Self::RECOVER.0);

    const KNOWN: &[(u32, &'static str)] = &[
        (0x0002, "FILETYPE"),
        (0x0004, "RECOVER"),
        (0x0008, "JOURNAL_DEV"),
        (0x0010, "META_BG"),
    ];

    #[must_use]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
    }

    #[must_use]
    pub fn describe(self) -> Vec<&'static str> {
        describe_flags(self.0, Self::KNOWN)
    }

    #[must_use]
    pub fn unknown_bits(self) -> u32 {
        unknown_bits(self.0, Self::KNOWN)
    }
}

impl std::fmt::Display for IncompatFeatures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        format_flags(f, self.0, Self::KNOWN)
    }
}

/// Read-only-compatible feature flags (`s_feature_ro_compat`).
///
/// Unknown bits force a read-only mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoCompatFeatures(pub u32);

impl RoCompatFeatures {
    pub const SPARSE_SUPER: Self = Self(0x0001);
    pub const LARGE_FILE: Self = Self(0x0002);
    pub const BTREE_DIR: Self = Self(0x0004);
    /// Volume carries the persisted orphan table record.
    pub const ORPHAN_TABLE: Self = Self(0x0008);

    const KNOWN: &[(u32, &'static str)] = &[
        (0x0001, "SPARSE_SUPER"),
        (0x0002, "LARGE_FILE"),
        (0x0004, "BTREE_DIR"),
        (0x0008, "ORPHAN_TABLE"),
    ];

    #[must_use]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn contains(self, flag: Self) -> bool {
        (self.0 & flag.0) != 0
    }

    #[must_use]
    pub fn describe(self) -> Vec<&'static str> {
        describe_flags(self.0, Self::KNOWN)
    }

    #[must_use]
    pub fn unknown_bits(self) -> u32 {
        unknown_bits(self.0, Self::KNOWN)
    }
}

impl std::fmt::Display for RoCompatFeatures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        format_flags(f, self.0, Self::KNOWN)
    }
}

// ── Shared flag helpers ─────────────────────────────────────────────────────

fn describe_flags(bits: u32, known: &[(u32, &'static str)]) -> Vec<&'static str> {
    known
        .iter()
        .filter(|(bit, _)| bits & bit != 0)
        .map(|(_, name)| *name)
        .collect()
}

fn unknown_bits(bits: u32, known: &[(u32, &'static str)]) -> u32 {
    let known_mask: u32 = known.iter().map(|(bit, _)| bit).fold(0, |a, b| a | b);
    bits & !known_mask
}

/// Format a bitmask as a pipe-separated list of flag names.
///
/// Example output: `FILETYPE|RECOVER` or `(none)` when zero. Unknown bits
/// are appended as hex, e.g. `FILETYPE|0x80000000`.
fn format_flags(
    f: &mut std::fmt::Formatter<'_>,
    bits: u32,
    known: &[(u32, &'static str)],
) -> std::fmt::Result {
    if bits == 0 {
        return f.write_str("(none)");
    }
    let mut first = true;
    let mut remaining = bits;
    for &(bit, name) in known {
        if remaining & bit != 0 {
            if !first {
                f.write_str("|")?;
            }
            f.write_str(name)?;
            remaining &= !bit;
            first = false;
        }
    }
    if remaining != 0 {
        if !first {
            f.write_str("|")?;
        }
        write!(f, "0x{remaining:X}")?;
    }
    Ok(())
}

// ── Superblock ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    // ── Core geometry ────────────────────────────────────────────────────
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub reserved_blocks_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub block_size: BlockSize,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub inode_size: u16,
    pub first_ino: u32,
    pub reserved_gdt_blocks: u16,

    // ── Identity ─────────────────────────────────────────────────────────
    pub magic: u16,
    pub uuid: [u8; 16],
    pub volume_name: String,
    pub last_mounted: String,

    // ── Revision & OS ────────────────────────────────────────────────────
    pub rev_level: u32,
    pub minor_rev_level: u16,
    pub creator_os: u32,

    // ── Features ─────────────────────────────────────────────────────────
    pub feature_compat: CompatFeatures,
    pub feature_incompat: IncompatFeatures,
    pub feature_ro_compat: RoCompatFeatures,
    pub default_mount_opts: u32,

    // ── State & error tracking ───────────────────────────────────────────
    pub state: u16,
    pub errors: u16,
    pub mnt_count: u16,
    pub max_mnt_count: u16,

    // ── Timestamps ───────────────────────────────────────────────────────
    pub mtime: u32,
    pub wtime: u32,
    pub lastcheck: u32,
    pub checkinterval: u32,

    // ── Reserved-block ownership ─────────────────────────────────────────
    pub def_resuid: u16,
    pub def_resgid: u16,

    // ── Journal ──────────────────────────────────────────────────────────
    pub journal_inum: u32,
    pub journal_dev: u32,

    // ── Orphan table ─────────────────────────────────────────────────────
    /// Block number of the orphan table, or 0 when none is provisioned.
    pub orphan_table_block: u32,

    // ── Directory index hashing ──────────────────────────────────────────
    pub hash_seed: [u32; 4],
    pub def_hash_version: u8,
}

impl Superblock {
    /// Parse a superblock from its 1024-byte on-disk region.
    pub fn parse_superblock_region(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u16(region, 0x38)?;
        if magic != SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(SUPER_MAGIC),
                actual: u64::from(magic),
            });
        }

        let log_block_size = read_le_u32(region, 0x18)?;
        let block_size = BlockSize::from_log(log_block_size)?;

        let def_hash_version = ensure_slice(region, 0xFC, 1)?[0];

        Ok(Self {
            // Core geometry
            inodes_count: read_le_u32(region, 0x00)?,
            blocks_count: read_le_u32(region, 0x04)?,
            reserved_blocks_count: read_le_u32(region, 0x08)?,
            free_blocks_count: read_le_u32(region, 0x0C)?,
            free_inodes_count: read_le_u32(region, 0x10)?,
            first_data_block: read_le_u32(region, 0x14)?,
            block_size,
            blocks_per_group: read_le_u32(region, 0x20)?,
            inodes_per_group: read_le_u32(region, 0x28)?,
            inode_size: read_le_u16(region, 0x58)?,
            first_ino: read_le_u32(region, 0x54)?,
            reserved_gdt_blocks: read_le_u16(region, 0xCE)?,

            // Identity
            magic,
            uuid: read_fixed::<16>(region, 0x68)?,
            volume_name: trim_nul_padded(&read_fixed::<16>(region, 0x78)?),
            last_mounted: trim_nul_padded(&read_fixed::<64>(region, 0x88)?),

            // Revision & OS
            rev_level: read_le_u32(region, 0x4C)?,
            minor_rev_level: read_le_u16(region, 0x3E)?,
            creator_os: read_le_u32(region, 0x48)?,

            // Features
            feature_compat: CompatFeatures(read_le_u32(region, 0x5C)?),
            feature_incompat: IncompatFeatures(read_le_u32(region, 0x60)?),
            feature_ro_compat: RoCompatFeatures(read_le_u32(region, 0x64)?),
            default_mount_opts: read_le_u32(region, 0x100)?,

            // State & error tracking
            state: read_le_u16(region, 0x3A)?,
            errors: read_le_u16(region, 0x3C)?,
            mnt_count: read_le_u16(region, 0x34)?,
            max_mnt_count: read_le_u16(region, 0x36)?,

            // Timestamps
            mtime: read_le_u32(region, 0x2C)?,
            wtime: read_le_u32(region, 0x30)?,
            lastcheck: read_le_u32(region, 0x40)?,
            checkinterval: read_le_u32(region, 0x44)?,

            // Reserved-block ownership
            def_resuid: read_le_u16(region, 0x50)?,
            def_resgid: read_le_u16(region, 0x52)?,

            // Journal
            journal_inum: read_le_u32(region, 0xE0)?,
            journal_dev: read_le_u32(region, 0xE4)?,

            // Orphan table
            orphan_table_block: read_le_u32(region, 0xE8)?,

            // Directory index hashing
            hash_seed: [
                read_le_u32(region, 0xEC)?,
                read_le_u32(region, 0xF0)?,
                read_le_u32(region, 0xF4)?,
                read_le_u32(region, 0xF8)?,
            ],
            def_hash_version,
        })
    }

    /// Encode into a 1024-byte superblock region. Bytes not covered by a
    /// field are left untouched.
    pub fn encode_into(&self, region: &mut [u8]) -> Result<(), ParseError> {
        if region.len() < SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        write_le_u32(region, 0x00, self.inodes_count)?;
        write_le_u32(region, 0x04, self.blocks_count)?;
        write_le_u32(region, 0x08, self.reserved_blocks_count)?;
        write_le_u32(region, 0x0C, self.free_blocks_count)?;
        write_le_u32(region, 0x10, self.free_inodes_count)?;
        write_le_u32(region, 0x14, self.first_data_block)?;
        write_le_u32(region, 0x18, self.block_size.log())?;
        write_le_u32(region, 0x20, self.blocks_per_group)?;
        write_le_u32(region, 0x28, self.inodes_per_group)?;
        write_le_u32(region, 0x2C, self.mtime)?;
        write_le_u32(region, 0x30, self.wtime)?;
        write_le_u16(region, 0x34, self.mnt_count)?;
        write_le_u16(region, 0x36, self.max_mnt_count)?;
        write_le_u16(region, 0x38, self.magic)?;
        write_le_u16(region, 0x3A, self.state)?;
        write_le_u16(region, 0x3C, self.errors)?;
        write_le_u16(region, 0x3E, self.minor_rev_level)?;
        write_le_u32(region, 0x40, self.lastcheck)?;
        write_le_u32(region, 0x44, self.checkinterval)?;
        write_le_u32(region, 0x48, self.creator_os)?;
        write_le_u32(region, 0x4C, self.rev_level)?;
        write_le_u16(region, 0x50, self.def_resuid)?;
        write_le_u16(region, 0x52, self.def_resgid)?;
        write_le_u32(region, 0x54, self.first_ino)?;
        write_le_u16(region, 0x58, self.inode_size)?;
        write_le_u32(region, 0x5C, self.feature_compat.0)?;
        write_le_u32(region, 0x60, self.feature_incompat.0)?;
        write_le_u32(region, 0x64, self.feature_ro_compat.0)?;
        write_bytes(region, 0x68, &self.uuid)?;
        write_nul_padded(region, 0x78, 16, self.volume_name.as_bytes())?;
        write_nul_padded(region, 0x88, 64, self.last_mounted.as_bytes())?;
        write_le_u16(region, 0xCE, self.reserved_gdt_blocks)?;
        write_le_u32(region, 0xE0, self.journal_inum)?;
        write_le_u32(region, 0xE4, self.journal_dev)?;
        write_le_u32(region, 0xE8, self.orphan_table_block)?;
        write_le_u32(region, 0xEC, self.hash_seed[0])?;
        write_le_u32(region, 0xF0, self.hash_seed[1])?;
        write_le_u32(region, 0xF4, self.hash_seed[2])?;
        write_le_u32(region, 0xF8, self.hash_seed[3])?;
        region[0xFC] = self.def_hash_version;
        write_le_u32(region, 0x100, self.default_mount_opts)?;
        Ok(())
    }

    #[must_use]
    pub fn has_compat(&self, mask: CompatFeatures) -> bool {
        self.feature_compat.contains(mask)
    }

    #[must_use]
    pub fn has_incompat(&self, mask: IncompatFeatures) -> bool {
        self.feature_incompat.contains(mask)
    }

    #[must_use]
    pub fn has_ro_compat(&self, mask: RoCompatFeatures) -> bool {
        self.feature_ro_compat.contains(mask)
    }

    /// Incompat bits this implementation cannot honor. Nonzero means the
    /// mount must fail.
    #[must_use]
    pub fn unsupported_incompat_bits(&self) -> u32 {
        self.feature_incompat.0 & !IncompatFeatures::ALLOWED.0
    }

    /// Ro-compat bits this implementation does not know. Nonzero forces a
    /// read-only mount.
    #[must_use]
    pub fn unknown_ro_compat_bits(&self) -> u32 {
        self.feature_ro_compat.unknown_bits()
    }

    /// Whether the required feature set is present.
    #[must_use]
    pub fn has_required_features(&self) -> bool {
        (self.feature_incompat.0 & IncompatFeatures::REQUIRED.0) == IncompatFeatures::REQUIRED.0
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.state & STATE_CLEAN != 0
    }

    #[must_use]
    pub fn has_error_flag(&self) -> bool {
        self.state & STATE_ERRORS != 0
    }

    #[must_use]
    pub fn orphan_pending(&self) -> bool {
        self.state & STATE_ORPHAN_PENDING != 0
    }

    #[must_use]
    pub fn errors_policy(&self) -> ErrorsPolicy {
        ErrorsPolicy::from_raw(self.errors)
    }

    /// Validate geometry fields against each other.
    ///
    /// Catches zero or oversized per-group counts, inode records that do
    /// not fit their table blocks, and a first data block inconsistent
    /// with the block size.
    pub fn validate_geometry(&self) -> Result<(), ParseError> {
        let block_size = self.block_size.get();
        let bitmap_bits = block_size
            .checked_mul(8)
            .ok_or(ParseError::InvalidField {
                field: "s_log_block_size",
                reason: "bitmap capacity overflow",
            })?;

        if self.blocks_count == 0 {
            return Err(ParseError::InvalidField {
                field: "s_blocks_count",
                reason: "zero blocks",
            });
        }
        if self.inodes_count == 0 {
            return Err(ParseError::InvalidField {
                field: "s_inodes_count",
                reason: "zero inodes",
            });
        }
        if self.blocks_per_group == 0 || self.blocks_per_group > bitmap_bits {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "must be 1..=8*block_size",
            });
        }
        if self.inodes_per_group == 0 || self.inodes_per_group > bitmap_bits {
            return Err(ParseError::InvalidField {
                field: "s_inodes_per_group",
                reason: "must be 1..=8*block_size",
            });
        }

        let expected_first = u32::from(block_size == 1024);
        if self.first_data_block != expected_first {
            return Err(ParseError::InvalidField {
                field: "s_first_data_block",
                reason: "must be 1 for 1K blocks, 0 otherwise",
            });
        }
        if self.first_data_block >= self.blocks_count {
            return Err(ParseError::InvalidField {
                field: "s_first_data_block",
                reason: "beyond end of volume",
            });
        }

        if !self.inode_size.is_power_of_two() || self.inode_size < 128 {
            return Err(ParseError::InvalidField {
                field: "s_inode_size",
                reason: "must be a power of two >= 128",
            });
        }
        if u32::from(self.inode_size) > block_size {
            return Err(ParseError::InvalidField {
                field: "s_inode_size",
                reason: "inode_size exceeds block_size",
            });
        }

        if self.first_ino < 11 {
            return Err(ParseError::InvalidField {
                field: "s_first_ino",
                reason: "overlaps reserved inodes",
            });
        }

        // inodes_count must be an exact multiple of inodes_per_group so
        // every group's inode table is fully populated.
        if self.inodes_count % self.inodes_per_group != 0 {
            return Err(ParseError::InvalidField {
                field: "s_inodes_count",
                reason: "not a multiple of inodes_per_group",
            });
        }

        let data_blocks = self.blocks_count - self.first_data_block;
        let group_count = data_blocks.div_ceil(self.blocks_per_group);
        if group_count == 0 {
            return Err(ParseError::InvalidField {
                field: "s_blocks_count",
                reason: "no block groups",
            });
        }
        if self.inodes_count / self.inodes_per_group != group_count {
            return Err(ParseError::InvalidField {
                field: "s_inodes_count",
                reason: "inode total disagrees with group count",
            });
        }

        Ok(())
    }

    /// Derive the in-memory geometry. Calls `validate_geometry` first.
    pub fn geometry(&self) -> Result<FsGeometry, ParseError> {
        self.validate_geometry()?;
        let data_blocks = self.blocks_count - self.first_data_block;
        Ok(FsGeometry {
            block_size: self.block_size,
            blocks_per_group: self.blocks_per_group,
            inodes_per_group: self.inodes_per_group,
            total_blocks: u64::from(self.blocks_count),
            total_inodes: self.inodes_count,
            first_data_block: self.first_data_block,
            group_count: data_blocks.div_ceil(self.blocks_per_group),
            inode_size: self.inode_size,
        })
    }
}

fn write_nul_padded(
    region: &mut [u8],
    offset: usize,
    width: usize,
    value: &[u8],
) -> Result<(), ParseError> {
    let mut field = vec![0_u8; width];
    let len = value.len().min(width);
    field[..len].copy_from_slice(&value[..len]);
    write_bytes(region, offset, &field)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jext_types::SUPERBLOCK_SIZE;

    fn make_valid_sb() -> [u8; SUPERBLOCK_SIZE] {
        let mut sb = [0_u8; SUPERBLOCK_SIZE];
        sb[0x38..0x3A].copy_from_slice(&SUPER_MAGIC.to_le_bytes());
        sb[0x18..0x1C].copy_from_slice(&2_u32.to_le_bytes()); // log_block_size=2 -> 4K
        sb[0x00..0x04].copy_from_slice(&8192_u32.to_le_bytes()); // inodes_count
        sb[0x04..0x08].copy_from_slice(&32768_u32.to_le_bytes()); // blocks_count
        sb[0x14..0x18].copy_from_slice(&0_u32.to_le_bytes()); // first_data_block
        sb[0x20..0x24].copy_from_slice(&32768_u32.to_le_bytes()); // blocks_per_group
        sb[0x28..0x2C].copy_from_slice(&8192_u32.to_le_bytes()); // inodes_per_group
        sb[0x54..0x58].copy_from_slice(&11_u32.to_le_bytes()); // first_ino
        sb[0x58..0x5A].copy_from_slice(&256_u16.to_le_bytes()); // inode_size
        sb[0x60..0x64].copy_from_slice(&IncompatFeatures::FILETYPE.0.to_le_bytes());
        sb
    }

    #[test]
    fn parse_superblock_region_smoke() {
        let mut sb = make_valid_sb();
        sb[0x78..0x7C].copy_from_slice(b"jext");
        sb[0x3A..0x3C].copy_from_slice(&STATE_CLEAN.to_le_bytes());
        sb[0xE8..0xEC].copy_from_slice(&77_u32.to_le_bytes());

        let parsed = Superblock::parse_superblock_region(&sb).expect("superblock parse");
        assert_eq!(parsed.inodes_count, 8192);
        assert_eq!(parsed.blocks_count, 32768);
        assert_eq!(parsed.block_size.get(), 4096);
        assert_eq!(parsed.volume_name, "jext");
        assert_eq!(parsed.orphan_table_block, 77);
        assert!(parsed.is_clean());
        assert!(!parsed.orphan_pending());
    }

    #[test]
    fn parse_rejects_bad_magic() {
        let mut sb = make_valid_sb();
        sb[0x38..0x3A].copy_from_slice(&0xBEEF_u16.to_le_bytes());
        let err = Superblock::parse_superblock_region(&sb).expect_err("reject");
        assert!(matches!(err, ParseError::InvalidMagic { .. }));
    }

    #[test]
    fn parse_rejects_unsupported_block_size() {
        let mut sb = make_valid_sb();
        sb[0x18..0x1C].copy_from_slice(&3_u32.to_le_bytes()); // 8K
        assert!(Superblock::parse_superblock_region(&sb).is_err());
    }

    #[test]
    fn encode_round_trips() {
        let mut sb = make_valid_sb();
        sb[0x3A..0x3C].copy_from_slice(&(STATE_CLEAN | STATE_ORPHAN_PENDING).to_le_bytes());
        sb[0x3C..0x3E].copy_from_slice(&2_u16.to_le_bytes());
        sb[0x78..0x7C].copy_from_slice(b"volA");
        sb[0xEC..0xF0].copy_from_slice(&0xDEAD_BEEF_u32.to_le_bytes());

        let parsed = Superblock::parse_superblock_region(&sb).expect("parse");
        let mut out = [0_u8; SUPERBLOCK_SIZE];
        parsed.encode_into(&mut out).expect("encode");
        let reparsed = Superblock::parse_superblock_region(&out).expect("reparse");
        assert_eq!(parsed, reparsed);
        assert_eq!(reparsed.errors_policy(), ErrorsPolicy::RemountReadOnly);
        assert!(reparsed.orphan_pending());
        assert_eq!(reparsed.hash_seed[0], 0xDEAD_BEEF);
    }

    #[test]
    fn feature_gates() {
        let mut sb = make_valid_sb();
        let parsed = Superblock::parse_superblock_region(&sb).expect("parse");
        assert!(parsed.has_required_features());
        assert_eq!(parsed.unsupported_incompat_bits(), 0);

        sb[0x60..0x64]
            .copy_from_slice(&(IncompatFeatures::FILETYPE.0 | (1_u32 << 31)).to_le_bytes());
        let parsed = Superblock::parse_superblock_region(&sb).expect("parse");
        assert_ne!(parsed.unsupported_incompat_bits(), 0);

        sb[0x64..0x68].copy_from_slice(&(1_u32 << 30).to_le_bytes());
        let parsed = Superblock::parse_superblock_region(&sb).expect("parse");
        assert_ne!(parsed.unknown_ro_compat_bits(), 0);
    }

    #[test]
    fn geometry_catches_bad_values() {
        // Zero blocks_per_group
        let mut bad = make_valid_sb();
        bad[0x20..0x24].copy_from_slice(&0_u32.to_le_bytes());
        let p = Superblock::parse_superblock_region(&bad).expect("parse");
        assert!(p.validate_geometry().is_err());

        // blocks_per_group exceeds bitmap capacity (4096*8+1)
        let mut bad = make_valid_sb();
        bad[0x20..0x24].copy_from_slice(&32769_u32.to_le_bytes());
        let p = Superblock::parse_superblock_region(&bad).expect("parse");
        let err = p.validate_geometry().expect_err("reject");
        assert!(matches!(
            err,
            ParseError::InvalidField {
                field: "s_blocks_per_group",
                ..
            }
        ));

        // inode_size not a power of two
        let mut bad = make_valid_sb();
        bad[0x58..0x5A].copy_from_slice(&200_u16.to_le_bytes());
        let p = Superblock::parse_superblock_region(&bad).expect("parse");
        assert!(p.validate_geometry().is_err());

        // first_data_block must be 0 for 4K blocks
        let mut bad = make_valid_sb();
        bad[0x14..0x18].copy_from_slice(&1_u32.to_le_bytes());
        let p = Superblock::parse_superblock_region(&bad).expect("parse");
        assert!(p.validate_geometry().is_err());

        // inode total disagrees with group count
        let mut bad = make_valid_sb();
        bad[0x00..0x04].copy_from_slice(&16384_u32.to_le_bytes());
        let p = Superblock::parse_superblock_region(&bad).expect("parse");
        assert!(p.validate_geometry().is_err());
    }

    #[test]
    fn geometry_derivation() {
        // Two groups: 1K blocks, first_data_block=1, 8192 blocks per group.
        let mut sb = make_valid_sb();
        sb[0x18..0x1C].copy_from_slice(&0_u32.to_le_bytes()); // 1K blocks
        sb[0x14..0x18].copy_from_slice(&1_u32.to_le_bytes());
        sb[0x04..0x08].copy_from_slice(&16385_u32.to_le_bytes());
        sb[0x20..0x24].copy_from_slice(&8192_u32.to_le_bytes());
        sb[0x28..0x2C].copy_from_slice(&1024_u32.to_le_bytes());
        sb[0x00..0x04].copy_from_slice(&2048_u32.to_le_bytes());
        sb[0x58..0x5A].copy_from_slice(&128_u16.to_le_bytes());

        let p = Superblock::parse_superblock_region(&sb).expect("parse");
        let geo = p.geometry().expect("geometry");
        assert_eq!(geo.group_count, 2);
        assert_eq!(geo.block_size.get(), 1024);
        assert_eq!(geo.first_data_block, 1);
        assert_eq!(geo.total_inodes, 2048);
    }

    #[test]
    fn errors_policy_decoding() {
        assert_eq!(ErrorsPolicy::from_raw(1), ErrorsPolicy::Continue);
        assert_eq!(ErrorsPolicy::from_raw(2), ErrorsPolicy::RemountReadOnly);
        assert_eq!(ErrorsPolicy::from_raw(3), ErrorsPolicy::Halt);
        assert_eq!(ErrorsPolicy::from_raw(0), ErrorsPolicy::Continue);
        assert_eq!(ErrorsPolicy::from_raw(99), ErrorsPolicy::Continue);
        assert_eq!(ErrorsPolicy::Halt.to_raw(), 3);
    }

    #[test]
    fn feature_display_formats() {
        let compat = CompatFeatures(CompatFeatures::HAS_JOURNAL.0 | CompatFeatures::DIR_INDEX.0);
        assert_eq!(compat.to_string(), "HAS_JOURNAL|DIR_INDEX");
        assert_eq!(CompatFeatures(0).to_string(), "(none)");
        let with_unknown = IncompatFeatures(IncompatFeatures::FILETYPE.0 | 0x8000_0000);
        assert_eq!(with_unknown.to_string(), "FILETYPE|0x80000000");
    }
}
