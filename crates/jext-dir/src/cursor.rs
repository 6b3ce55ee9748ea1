//! Hash-ordered directory enumeration with a resumable cursor.
//!
//! A cursor names a position in the 31-bit hash space, not a block or a
//! byte offset, so it survives leaf splits between batches: entries keep
//! their hash when they move, and batch boundaries fall on leaf bounds,
//! which are always equal-major run boundaries. Every entry present for
//! the whole enumeration is returned exactly once; `.` and `..` are not
//! part of the stream.

use jext_error::Result;
use jext_journal::{AccessKind, Txn};
use jext_ondisk::htree::{dx_hash, DxHash, HTREE_EOF_HASH};
use jext_ondisk::DirEntry;
use jext_types::BlockNumber;

use crate::htree::{corrupt, descend, load_block, read_root};
use crate::{DirConfig, DirStore};

/// Resumable position in a directory's hash order.
///
/// `major` holds the upper 31 bits of a name's major hash (the low bit
/// is a continuation marker and always clear in stored hashes); `minor`
/// refines the position inside an equal-major run. Entries at exactly
/// `(major, minor)` belong to the batch that starts there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DirCursor {
    pub major: u32,
    pub minor: u32,
}

impl DirCursor {
    /// Position before the first entry.
    pub const START: Self = Self { major: 0, minor: 0 };
    /// Position past every possible entry.
    pub const END: Self = Self {
        major: HTREE_EOF_HASH,
        minor: 0,
    };

    /// Whether the enumeration is finished.
    #[must_use]
    pub fn is_end(self) -> bool {
        self.major >= HTREE_EOF_HASH
    }

    fn from_bound(hash: u32) -> Self {
        Self {
            major: hash >> 1,
            minor: 0,
        }
    }

    fn position(hash: DxHash) -> (u32, u32) {
        (hash.major >> 1, hash.minor)
    }
}

/// One enumerated entry with the hash that ordered it.
#[derive(Debug, Clone)]
pub struct ReaddirEntry {
    pub hash: DxHash,
    pub entry: DirEntry,
}

/// A batch of entries in hash order plus the position to resume from.
#[derive(Debug, Clone)]
pub struct ReaddirChunk {
    pub entries: Vec<ReaddirEntry>,
    pub next: DirCursor,
}

/// Enumerate the directory from `cursor`, in `(hash, name)` order.
///
/// Indexed directories return one leaf's worth of entries per call;
/// unindexed directories return everything at once. An empty chunk with
/// an end cursor means the enumeration is done.
pub fn readdir(
    store: &mut dyn DirStore,
    txn: &mut Txn<'_>,
    cfg: &DirConfig,
    cursor: DirCursor,
) -> Result<ReaddirChunk> {
    if cursor.is_end() {
        return Ok(ReaddirChunk {
            entries: Vec::new(),
            next: DirCursor::END,
        });
    }
    if store.is_indexed() {
        readdir_indexed(store, txn, cfg, cursor)
    } else {
        readdir_linear(store, txn, cfg, cursor)
    }
}

fn readdir_indexed(
    store: &mut dyn DirStore,
    txn: &mut Txn<'_>,
    cfg: &DirConfig,
    mut cursor: DirCursor,
) -> Result<ReaddirChunk> {
    loop {
        let (_, _, root) = read_root(store, txn, cfg, AccessKind::Read)?;
        let path = descend(store, txn, &root, cursor.major << 1)?;
        let (leaf_phys, leaf_buf) = load_block(store, txn, path.leaf, AccessKind::Read)?;

        let mut entries = collect_hashed(&leaf_buf, leaf_phys, cfg)?;
        entries.retain(|e| DirCursor::position(e.hash) >= (cursor.major, cursor.minor));
        entries.sort_by(|a, b| a.hash.cmp(&b.hash).then_with(|| a.entry.name.cmp(&b.entry.name)));

        let next = match path.next_hash {
            Some(bound) => DirCursor::from_bound(bound),
            None => DirCursor::END,
        };
        if !entries.is_empty() || next.is_end() {
            return Ok(ReaddirChunk { entries, next });
        }
        // Nothing at or past the cursor in this leaf; move to the next
        // hash range.
        cursor = next;
    }
}

fn readdir_linear(
    store: &mut dyn DirStore,
    txn: &mut Txn<'_>,
    cfg: &DirConfig,
    cursor: DirCursor,
) -> Result<ReaddirChunk> {
    let mut entries = Vec::new();
    for lblock in 0..store.block_count() {
        let (phys, buf) = load_block(store, txn, lblock, AccessKind::Read)?;
        entries.extend(collect_hashed(&buf, phys, cfg)?);
    }
    entries.retain(|e| DirCursor::position(e.hash) >= (cursor.major, cursor.minor));
    entries.sort_by(|a, b| a.hash.cmp(&b.hash).then_with(|| a.entry.name.cmp(&b.entry.name)));
    Ok(ReaddirChunk {
        entries,
        next: DirCursor::END,
    })
}

fn collect_hashed(buf: &[u8], phys: BlockNumber, cfg: &DirConfig) -> Result<Vec<ReaddirEntry>> {
    let mut out = Vec::new();
    for entry in jext_ondisk::iter_dir_block(buf) {
        let entry = entry.map_err(|e| corrupt(phys, "directory entries", e))?;
        if entry.is_dot() || entry.is_dotdot() {
            continue;
        }
        let hash = dx_hash(cfg.hash_version, entry.name, &cfg.seed);
        out.push(ReaddirEntry {
            hash,
            entry: entry.to_owned_entry(),
        });
    }
    Ok(out)
}
