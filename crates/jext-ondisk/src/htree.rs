//! Hash-tree directory index: root and interior node layouts plus the
//! name-hash family.
//!
//! The index root lives in directory block 0 behind fake `.` and `..`
//! entries, so linear readers that ignore the index still see a valid
//! directory block. Interior nodes hide their payload behind a single
//! fake entry spanning the whole block. Leaves are ordinary directory
//! blocks.

use jext_types::{ParseError, read_le_u16, read_le_u32, write_le_u16, write_le_u32};
use serde::{Deserialize, Serialize};

/// Byte offset of the first index entry in a root block.
pub const DX_ROOT_ENTRIES_OFFSET: usize = 0x24;
/// Byte offset of the first index entry in an interior node.
pub const DX_NODE_ENTRIES_OFFSET: usize = 0x0C;
/// On-disk size of one index entry.
pub const DX_ENTRY_SIZE: usize = 8;

/// Hash value marking the end of the index space in readdir positions.
pub const HTREE_EOF_HASH: u32 = 0x7FFF_FFFF;

/// Initial state used when the superblock seed is all zeroes.
const DEFAULT_HASH_SEED: [u32; 4] = [0x6745_2301, 0xEFCD_AB89, 0x98BA_DCFE, 0x1032_5476];

// ── Hash functions ──────────────────────────────────────────────────────────

/// Name-hash algorithm for an indexed directory.
///
/// Fixed per directory at index creation and recorded in the root; every
/// probe of that directory must use the recorded version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum HashVersion {
    Legacy = 0,
    HalfMd4 = 1,
    Tea = 2,
    LegacyUnsigned = 3,
    HalfMd4Unsigned = 4,
    TeaUnsigned = 5,
}

impl HashVersion {
    /// Decode the on-disk version byte. Unknown values are rejected so a
    /// directory is never probed with the wrong algorithm.
    #[must_use]
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::Legacy),
            1 => Some(Self::HalfMd4),
            2 => Some(Self::Tea),
            3 => Some(Self::LegacyUnsigned),
            4 => Some(Self::HalfMd4Unsigned),
            5 => Some(Self::TeaUnsigned),
            _ => None,
        }
    }

    #[must_use]
    pub fn to_raw(self) -> u8 {
        self as u8
    }
}

/// A computed name hash: `major` orders the index, `minor` breaks ties
/// within an equal-major run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DxHash {
    pub major: u32,
    pub minor: u32,
}

/// Hash a name under the given algorithm.
///
/// The low bit of `major` is always cleared; readdir positions use it as
/// a continuation marker. The one value that would collide with the
/// end-of-directory position is remapped one step down.
#[must_use]
pub fn dx_hash(version: HashVersion, name: &[u8], seed: &[u32; 4]) -> DxHash {
    let (major, minor) = match version {
        HashVersion::Legacy => hash_legacy(name, true),
        HashVersion::LegacyUnsigned => hash_legacy(name, false),
        HashVersion::HalfMd4 => hash_half_md4(name, seed, true),
        HashVersion::HalfMd4Unsigned => hash_half_md4(name, seed, false),
        HashVersion::Tea => hash_tea(name, seed, true),
        HashVersion::TeaUnsigned => hash_tea(name, seed, false),
    };
    let mut major = major & !1;
    if major == HTREE_EOF_HASH << 1 {
        major = (HTREE_EOF_HASH - 1) << 1;
    }
    DxHash { major, minor }
}

fn effective_seed(seed: &[u32; 4]) -> [u32; 4] {
    if *seed == [0; 4] {
        DEFAULT_HASH_SEED
    } else {
        *seed
    }
}

/// Polynomial hash over two independent accumulators.
#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
fn hash_legacy(name: &[u8], signed: bool) -> (u32, u32) {
    let mut h0: u32 = 0x12a3_fe2d;
    let mut h1: u32 = 0x37ab_e8f9;

    for &b in name {
        let val = if signed {
            i32::from(b as i8) as u32
        } else {
            u32::from(b)
        };
        h0 = h0.wrapping_mul(16).wrapping_add(val);
        h1 = h1.wrapping_mul(16).wrapping_add(val);
    }

    (h0, h1)
}

fn hash_half_md4(name: &[u8], seed: &[u32; 4], signed: bool) -> (u32, u32) {
    let buf = str2hashbuf(name, 8, signed);
    let [mut a, mut b, mut c, mut d] = effective_seed(seed);
    half_md4_transform(&mut a, &mut b, &mut c, &mut d, &buf);
    (a, b)
}

fn hash_tea(name: &[u8], seed: &[u32; 4], signed: bool) -> (u32, u32) {
    let buf = str2hashbuf(name, 4, signed);
    let [mut a, mut b, mut c, mut d] = effective_seed(seed);
    tea_transform(&mut a, &mut b, &mut c, &mut d, &buf);
    (a, b)
}

/// Pack a filename into little-endian u32 words, with a 0x80 terminator
/// in the word after the last name byte.
#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
fn str2hashbuf(name: &[u8], buf_size: usize, signed: bool) -> Vec<u32> {
    let mut buf = vec![0_u32; buf_size];
    let mut idx = 0_usize;
    let mut shift = 0_u32;

    for &b in name {
        let val = if signed {
            (b as i8) as u32
        } else {
            u32::from(b)
        };
        buf[idx] |= val << shift;
        shift += 8;
        if shift >= 32 {
            shift = 0;
            idx += 1;
            if idx >= buf_size {
                break;
            }
        }
    }

    if idx < buf_size {
        buf[idx] |= 0x80 << shift;
    }

    buf
}

/// Half-MD4 transform: one MD4 pass over 8 words with halved round counts.
fn half_md4_transform(a: &mut u32, b: &mut u32, c: &mut u32, d: &mut u32, buf: &[u32]) {
    const K2: u32 = 0x5A82_7999;
    const K3: u32 = 0x6ED9_EBA1;

    let get = |i: usize| -> u32 { buf.get(i).copied().unwrap_or(0) };

    // Round 1: F(x,y,z) = (x & y) | (!x & z)
    macro_rules! ff {
        ($a:expr, $b:expr, $c:expr, $d:expr, $k:expr, $s:expr) => {
            $a = $a
                .wrapping_add(($b & $c) | (!$b & $d))
                .wrapping_add(get($k));
            $a = $a.rotate_left($s);
        };
    }

    ff!(*a, *b, *c, *d, 0, 3);
    ff!(*d, *a, *b, *c, 1, 7);
    ff!(*c, *d, *a, *b, 2, 11);
    ff!(*b, *c, *d, *a, 3, 19);
    ff!(*a, *b, *c, *d, 4, 3);
    ff!(*d, *a, *b, *c, 5, 7);
    ff!(*c, *d, *a, *b, 6, 11);
    ff!(*b, *c, *d, *a, 7, 19);

    // Round 2: G(x,y,z) = (x & y) | (x & z) | (y & z)
    macro_rules! gg {
        ($a:expr, $b:expr, $c:expr, $d:expr, $k:expr, $s:expr) => {
            $a = $a
                .wrapping_add(($b & $c) | ($b & $d) | ($c & $d))
                .wrapping_add(get($k))
                .wrapping_add(K2);
            $a = $a.rotate_left($s);
        };
    }

    gg!(*a, *b, *c, *d, 1, 3);
    gg!(*d, *a, *b, *c, 3, 5);
    gg!(*c, *d, *a, *b, 5, 9);
    gg!(*b, *c, *d, *a, 7, 13);
    gg!(*a, *b, *c, *d, 0, 3);
    gg!(*d, *a, *b, *c, 2, 5);
    gg!(*c, *d, *a, *b, 4, 9);
    gg!(*b, *c, *d, *a, 6, 13);

    // Round 3: H(x,y,z) = x ^ y ^ z
    macro_rules! hh {
        ($a:expr, $b:expr, $c:expr, $d:expr, $k:expr, $s:expr) => {
            $a = $a
                .wrapping_add($b ^ $c ^ $d)
                .wrapping_add(get($k))
                .wrapping_add(K3);
            $a = $a.rotate_left($s);
        };
    }

    hh!(*a, *b, *c, *d, 0, 3);
    hh!(*d, *a, *b, *c, 4, 9);
    hh!(*c, *d, *a, *b, 7, 11);
    hh!(*b, *c, *d, *a, 2, 15);
    hh!(*a, *b, *c, *d, 6, 3);
    hh!(*d, *a, *b, *c, 1, 9);
    hh!(*c, *d, *a, *b, 3, 11);
    hh!(*b, *c, *d, *a, 5, 15);
}

/// TEA transform: the name words are the key, the state is the data.
fn tea_transform(a: &mut u32, b: &mut u32, c: &mut u32, d: &mut u32, buf: &[u32]) {
    let get = |i: usize| -> u32 { buf.get(i).copied().unwrap_or(0) };
    let delta: u32 = 0x9E37_79B9;

    let k0 = get(0);
    let k1 = get(1);
    let k2 = get(2);
    let k3 = get(3);

    let mut sum: u32 = 0;
    for _ in 0..16 {
        sum = sum.wrapping_add(delta);
        *a = a.wrapping_add(
            (b.wrapping_shl(4).wrapping_add(k0))
                ^ b.wrapping_add(sum)
                ^ (b.wrapping_shr(5).wrapping_add(k1)),
        );
        *b = b.wrapping_add(
            (a.wrapping_shl(4).wrapping_add(k2))
                ^ a.wrapping_add(sum)
                ^ (a.wrapping_shr(5).wrapping_add(k3)),
        );
    }

    sum = 0;
    for _ in 0..16 {
        sum = sum.wrapping_add(delta);
        *c = c.wrapping_add(
            (d.wrapping_shl(4).wrapping_add(k0))
                ^ d.wrapping_add(sum)
                ^ (d.wrapping_shr(5).wrapping_add(k1)),
        );
        *d = d.wrapping_add(
            (c.wrapping_shl(4).wrapping_add(k2))
                ^ c.wrapping_add(sum)
                ^ (c.wrapping_shr(5).wrapping_add(k3)),
        );
    }
}

// ── Index block layouts ─────────────────────────────────────────────────────

/// One index entry: names hashing at or above `hash` (and below the next
/// entry's hash) live under `block`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DxEntry {
    pub hash: u32,
    /// Directory-relative block number of the child.
    pub block: u32,
}

/// Index root stored in directory block 0.
///
/// Entry 0 is the sentinel covering hashes below `entries[1].hash`; its
/// stored hash is always 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DxRoot {
    pub hash_version: HashVersion,
    /// 0 = entries point at leaves, 1 = entries point at interior nodes.
    pub indirect_levels: u8,
    pub dot_inode: u32,
    pub dotdot_inode: u32,
    pub entries: Vec<DxEntry>,
}

/// Interior index node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DxNode {
    pub entries: Vec<DxEntry>,
}

/// Index entries a root block can hold.
#[must_use]
pub fn dx_root_limit(block_size: u32) -> usize {
    (block_size as usize - DX_ROOT_ENTRIES_OFFSET) / DX_ENTRY_SIZE
}

/// Index entries an interior node can hold.
#[must_use]
pub fn dx_node_limit(block_size: u32) -> usize {
    (block_size as usize - DX_NODE_ENTRIES_OFFSET) / DX_ENTRY_SIZE
}

impl DxRoot {
    /// Parse an index root from directory block 0.
    pub fn parse_from_block(block: &[u8]) -> Result<Self, ParseError> {
        if block.len() < DX_ROOT_ENTRIES_OFFSET + DX_ENTRY_SIZE {
            return Err(ParseError::InsufficientData {
                needed: DX_ROOT_ENTRIES_OFFSET + DX_ENTRY_SIZE,
                offset: 0,
                actual: block.len(),
            });
        }

        // Fake "." entry: rec_len 12, 1-byte name.
        let dot_inode = read_le_u32(block, 0x00)?;
        let dot_rec_len = read_le_u16(block, 0x04)?;
        if dot_inode == 0 || dot_rec_len != 12 || block[0x06] != 1 || block[0x08] != b'.' {
            return Err(ParseError::InvalidField {
                field: "dx_root_dot",
                reason: "malformed fake dot entry",
            });
        }

        // Fake ".." entry: rec_len spans the rest of the block.
        let dotdot_inode = read_le_u32(block, 0x0C)?;
        let dotdot_rec_len = usize::from(read_le_u16(block, 0x10)?);
        if dotdot_inode == 0
            || dotdot_rec_len != block.len() - 12
            || block[0x12] != 2
            || &block[0x14..0x16] != b".."
        {
            return Err(ParseError::InvalidField {
                field: "dx_root_dotdot",
                reason: "malformed fake dotdot entry",
            });
        }

        let hash_version_raw = block[0x1C];
        let Some(hash_version) = HashVersion::from_raw(hash_version_raw) else {
            return Err(ParseError::InvalidField {
                field: "dx_hash_version",
                reason: "unknown hash version",
            });
        };
        if block[0x1D] != 8 {
            return Err(ParseError::InvalidField {
                field: "dx_info_length",
                reason: "expected 8",
            });
        }
        let indirect_levels = block[0x1E];
        if indirect_levels > 1 {
            return Err(ParseError::InvalidField {
                field: "dx_indirect_levels",
                reason: "exceeds maximum (1)",
            });
        }

        let count = usize::from(read_le_u16(block, 0x20)?);
        let limit = usize::from(read_le_u16(block, 0x22)?);
        let capacity = dx_root_limit(u32::try_from(block.len()).unwrap_or(u32::MAX));
        if limit != capacity {
            return Err(ParseError::InvalidField {
                field: "dx_limit",
                reason: "limit disagrees with block size",
            });
        }
        if count == 0 || count > limit {
            return Err(ParseError::InvalidField {
                field: "dx_count",
                reason: "count out of range",
            });
        }

        let entries = parse_dx_entries(block, DX_ROOT_ENTRIES_OFFSET, count)?;

        Ok(Self {
            hash_version,
            indirect_levels,
            dot_inode,
            dotdot_inode,
            entries,
        })
    }

    /// Encode into directory block 0, fake dot entries included. The
    /// whole block is rewritten.
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode_into(&self, block: &mut [u8]) -> Result<(), ParseError> {
        let capacity = dx_root_limit(u32::try_from(block.len()).unwrap_or(u32::MAX));
        validate_encode(block.len(), DX_ROOT_ENTRIES_OFFSET, capacity, &self.entries)?;
        block.fill(0);

        // Fake "." and ".." entries keep linear readers working.
        write_le_u32(block, 0x00, self.dot_inode)?;
        write_le_u16(block, 0x04, 12)?;
        block[0x06] = 1;
        block[0x07] = 2; // FileType::Dir
        block[0x08] = b'.';

        write_le_u32(block, 0x0C, self.dotdot_inode)?;
        write_le_u16(block, 0x10, (block.len() - 12) as u16)?;
        block[0x12] = 2;
        block[0x13] = 2;
        block[0x14..0x16].copy_from_slice(b"..");

        // Root info at 0x18: reserved(4), version, info_length, levels, flags.
        block[0x1C] = self.hash_version.to_raw();
        block[0x1D] = 8;
        block[0x1E] = self.indirect_levels;

        write_le_u16(block, 0x20, self.entries.len() as u16)?;
        write_le_u16(block, 0x22, capacity as u16)?;
        encode_dx_entries(block, DX_ROOT_ENTRIES_OFFSET, &self.entries)
    }
}

impl DxNode {
    /// Parse an interior node block.
    pub fn parse_from_block(block: &[u8]) -> Result<Self, ParseError> {
        if block.len() < DX_NODE_ENTRIES_OFFSET + DX_ENTRY_SIZE {
            return Err(ParseError::InsufficientData {
                needed: DX_NODE_ENTRIES_OFFSET + DX_ENTRY_SIZE,
                offset: 0,
                actual: block.len(),
            });
        }

        // Fake entry hiding the node from linear readers: inode 0, rec_len
        // spanning the whole block.
        let fake_inode = read_le_u32(block, 0x00)?;
        let fake_rec_len = usize::from(read_le_u16(block, 0x04)?);
        if fake_inode != 0 || fake_rec_len != block.len() {
            return Err(ParseError::InvalidField {
                field: "dx_node_fake_dirent",
                reason: "malformed node header",
            });
        }

        let count = usize::from(read_le_u16(block, 0x08)?);
        let limit = usize::from(read_le_u16(block, 0x0A)?);
        let capacity = dx_node_limit(u32::try_from(block.len()).unwrap_or(u32::MAX));
        if limit != capacity {
            return Err(ParseError::InvalidField {
                field: "dx_limit",
                reason: "limit disagrees with block size",
            });
        }
        if count == 0 || count > limit {
            return Err(ParseError::InvalidField {
                field: "dx_count",
                reason: "count out of range",
            });
        }

        let entries = parse_dx_entries(block, DX_NODE_ENTRIES_OFFSET, count)?;
        Ok(Self { entries })
    }

    /// Encode an interior node. The whole block is rewritten.
    #[allow(clippy::cast_possible_truncation)]
    pub fn encode_into(&self, block: &mut [u8]) -> Result<(), ParseError> {
        let capacity = dx_node_limit(u32::try_from(block.len()).unwrap_or(u32::MAX));
        validate_encode(block.len(), DX_NODE_ENTRIES_OFFSET, capacity, &self.entries)?;
        block.fill(0);

        write_le_u16(block, 0x04, block.len() as u16)?;
        write_le_u16(block, 0x08, self.entries.len() as u16)?;
        write_le_u16(block, 0x0A, capacity as u16)?;
        encode_dx_entries(block, DX_NODE_ENTRIES_OFFSET, &self.entries)
    }
}

fn validate_encode(
    block_len: usize,
    entries_offset: usize,
    capacity: usize,
    entries: &[DxEntry],
) -> Result<(), ParseError> {
    if block_len < entries_offset + DX_ENTRY_SIZE {
        return Err(ParseError::InsufficientData {
            needed: entries_offset + DX_ENTRY_SIZE,
            offset: 0,
            actual: block_len,
        });
    }
    if entries.is_empty() || entries.len() > capacity {
        return Err(ParseError::InvalidField {
            field: "dx_count",
            reason: "count out of range",
        });
    }
    if entries[0].hash != 0 {
        return Err(ParseError::InvalidField {
            field: "dx_entries",
            reason: "missing zero-hash sentinel",
        });
    }
    if entries.windows(2).any(|w| w[0].hash > w[1].hash) {
        return Err(ParseError::InvalidField {
            field: "dx_entries",
            reason: "hashes not sorted",
        });
    }
    Ok(())
}

fn parse_dx_entries(
    block: &[u8],
    start: usize,
    count: usize,
) -> Result<Vec<DxEntry>, ParseError> {
    let mut entries = Vec::with_capacity(count);
    let mut off = start;
    for _ in 0..count {
        let hash = read_le_u32(block, off)?;
        let child = read_le_u32(block, off + 4)?;
        entries.push(DxEntry { hash, block: child });
        off += DX_ENTRY_SIZE;
    }
    if entries[0].hash != 0 {
        return Err(ParseError::InvalidField {
            field: "dx_entries",
            reason: "missing zero-hash sentinel",
        });
    }
    if entries.windows(2).any(|w| w[0].hash > w[1].hash) {
        return Err(ParseError::InvalidField {
            field: "dx_entries",
            reason: "hashes not sorted",
        });
    }
    Ok(entries)
}

fn encode_dx_entries(
    block: &mut [u8],
    start: usize,
    entries: &[DxEntry],
) -> Result<(), ParseError> {
    let mut off = start;
    for entry in entries {
        write_le_u32(block, off, entry.hash)?;
        write_le_u32(block, off + 4, entry.block)?;
        off += DX_ENTRY_SIZE;
    }
    Ok(())
}

/// Index of the entry covering `hash`: the rightmost entry whose hash is
/// `<= hash`. The zero-hash sentinel guarantees a match.
#[must_use]
pub fn find_leaf(entries: &[DxEntry], hash: u32) -> usize {
    let mut lo = 0_usize;
    let mut hi = entries.len();
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if entries[mid].hash <= hash {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo.saturating_sub(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_hash_known_values() {
        let seed = [0_u32; 4];
        let ab = dx_hash(HashVersion::Legacy, b"AB", &seed);
        assert_eq!(ab.major, 0xA3FE_3152);
        assert_eq!(ab.minor, 0xABE8_FD52);
    }

    #[test]
    fn legacy_full_collision_pair() {
        // 16*'A' + 'B' == 16*'@' + 'R', so both accumulators agree.
        let seed = [0_u32; 4];
        let a = dx_hash(HashVersion::Legacy, b"AB", &seed);
        let b = dx_hash(HashVersion::Legacy, b"@R", &seed);
        assert_eq!(a, b);
    }

    #[test]
    fn legacy_major_only_collision_pair() {
        // "AB" and "AC" differ only in the cleared low bit of major.
        let seed = [0_u32; 4];
        let ab = dx_hash(HashVersion::Legacy, b"AB", &seed);
        let ac = dx_hash(HashVersion::Legacy, b"AC", &seed);
        assert_eq!(ab.major, ac.major);
        assert_ne!(ab.minor, ac.minor);
    }

    #[test]
    fn major_low_bit_always_clear() {
        let seed = [0x1111_1111, 0x2222_2222, 0x3333_3333, 0x4444_4444];
        for version in [
            HashVersion::Legacy,
            HashVersion::HalfMd4,
            HashVersion::Tea,
            HashVersion::LegacyUnsigned,
            HashVersion::HalfMd4Unsigned,
            HashVersion::TeaUnsigned,
        ] {
            for name in [&b"a"[..], b"some-longer0name.ext", b"\xE9\x80"] {
                let hash = dx_hash(version, name, &seed);
                assert_eq!(hash.major & 1, 0, "{version:?} {name:?}");
            }
        }
    }

    #[test]
    fn hashing_is_deterministic() {
        let seed = [0xAA, 0xBB, 0xCC, 0xDD];
        for version in [HashVersion::HalfMd4, HashVersion::Tea] {
            let first = dx_hash(version, b"stable-name", &seed);
            let second = dx_hash(version, b"stable-name", &seed);
            assert_eq!(first, second);
        }
    }

    #[test]
    fn signedness_changes_high_byte_names_only() {
        let seed = [0_u32; 4];
        // ASCII-only names hash identically under both signedness rules.
        let s = dx_hash(HashVersion::Legacy, b"plain", &seed);
        let u = dx_hash(HashVersion::LegacyUnsigned, b"plain", &seed);
        assert_eq!(s, u);

        // A name with the high bit set diverges.
        let s = dx_hash(HashVersion::Legacy, b"\xE9", &seed);
        let u = dx_hash(HashVersion::LegacyUnsigned, b"\xE9", &seed);
        assert_ne!(s.major, u.major);
    }

    #[test]
    fn hash_version_raw_round_trip() {
        for raw in 0..6_u8 {
            let version = HashVersion::from_raw(raw).expect("known version");
            assert_eq!(version.to_raw(), raw);
        }
        assert!(HashVersion::from_raw(6).is_none());
        assert!(HashVersion::from_raw(0xFF).is_none());
    }

    #[test]
    fn find_leaf_picks_covering_entry() {
        let entries = vec![
            DxEntry { hash: 0, block: 1 },
            DxEntry {
                hash: 100,
                block: 2,
            },
            DxEntry {
                hash: 200,
                block: 3,
            },
        ];
        assert_eq!(find_leaf(&entries, 0), 0);
        assert_eq!(find_leaf(&entries, 50), 0);
        assert_eq!(find_leaf(&entries, 100), 1);
        assert_eq!(find_leaf(&entries, 150), 1);
        assert_eq!(find_leaf(&entries, 200), 2);
        assert_eq!(find_leaf(&entries, u32::MAX), 2);
    }

    #[test]
    fn dx_root_round_trips() {
        let root = DxRoot {
            hash_version: HashVersion::HalfMd4,
            indirect_levels: 0,
            dot_inode: 15,
            dotdot_inode: 2,
            entries: vec![
                DxEntry { hash: 0, block: 1 },
                DxEntry {
                    hash: 0x8000_0000,
                    block: 2,
                },
            ],
        };

        let mut block = vec![0_u8; 1024];
        root.encode_into(&mut block).expect("encode");
        let parsed = DxRoot::parse_from_block(&block).expect("parse");
        assert_eq!(root, parsed);
    }

    #[test]
    fn dx_root_parse_rejects_malformed() {
        let root = DxRoot {
            hash_version: HashVersion::Tea,
            indirect_levels: 0,
            dot_inode: 11,
            dotdot_inode: 2,
            entries: vec![DxEntry { hash: 0, block: 1 }],
        };
        let mut good = vec![0_u8; 1024];
        root.encode_into(&mut good).expect("encode");

        // Unknown hash version.
        let mut bad = good.clone();
        bad[0x1C] = 9;
        assert!(DxRoot::parse_from_block(&bad).is_err());

        // Wrong info length.
        let mut bad = good.clone();
        bad[0x1D] = 4;
        assert!(DxRoot::parse_from_block(&bad).is_err());

        // Too many levels.
        let mut bad = good.clone();
        bad[0x1E] = 2;
        assert!(DxRoot::parse_from_block(&bad).is_err());

        // Count of zero.
        let mut bad = good.clone();
        bad[0x20..0x22].copy_from_slice(&0_u16.to_le_bytes());
        assert!(DxRoot::parse_from_block(&bad).is_err());

        // Limit not matching the block size.
        let mut bad = good.clone();
        bad[0x22..0x24].copy_from_slice(&7_u16.to_le_bytes());
        assert!(DxRoot::parse_from_block(&bad).is_err());

        // Broken fake dot entry.
        let mut bad = good;
        bad[0x08] = b'x';
        assert!(DxRoot::parse_from_block(&bad).is_err());
    }

    #[test]
    fn dx_root_encode_rejects_unsorted_entries() {
        let root = DxRoot {
            hash_version: HashVersion::Legacy,
            indirect_levels: 0,
            dot_inode: 11,
            dotdot_inode: 2,
            entries: vec![
                DxEntry { hash: 0, block: 1 },
                DxEntry {
                    hash: 500,
                    block: 2,
                },
                DxEntry {
                    hash: 400,
                    block: 3,
                },
            ],
        };
        let mut block = vec![0_u8; 1024];
        assert!(root.encode_into(&mut block).is_err());
    }

    #[test]
    fn dx_node_round_trips() {
        let node = DxNode {
            entries: vec![
                DxEntry { hash: 0, block: 4 },
                DxEntry {
                    hash: 0x4000_0000,
                    block: 9,
                },
                DxEntry {
                    hash: 0xA000_0000,
                    block: 6,
                },
            ],
        };
        let mut block = vec![0_u8; 4096];
        node.encode_into(&mut block).expect("encode");
        let parsed = DxNode::parse_from_block(&block).expect("parse");
        assert_eq!(node, parsed);
    }

    #[test]
    fn dx_node_parse_rejects_live_fake_dirent() {
        let node = DxNode {
            entries: vec![DxEntry { hash: 0, block: 4 }],
        };
        let mut block = vec![0_u8; 1024];
        node.encode_into(&mut block).expect("encode");
        // A nonzero inode in the fake dirent means this is a leaf block.
        block[0x00..0x04].copy_from_slice(&33_u32.to_le_bytes());
        assert!(DxNode::parse_from_block(&block).is_err());
    }

    #[test]
    fn limits_match_block_sizes() {
        assert_eq!(dx_root_limit(1024), (1024 - 0x24) / 8);
        assert_eq!(dx_node_limit(1024), (1024 - 0x0C) / 8);
        assert_eq!(dx_root_limit(4096), (4096 - 0x24) / 8);
    }
}
