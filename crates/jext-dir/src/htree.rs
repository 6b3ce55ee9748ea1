//! Directory operations over the hash-tree index: lookup, insertion with
//! leaf splits, removal, and index construction.
//!
//! An unindexed directory is a linear run of entry blocks and stays that
//! way until its single block overflows; the first overflow converts
//! block 0 into an index root and moves the entries to leaf blocks. From
//! then on every name is found by hashing it and descending root (and at
//! most one interior level) to the covering leaf.
//!
//! Entries sharing a major hash always live in one leaf. A split picks
//! the run boundary nearest the middle of the hash order, so equal-major
//! runs never straddle blocks and collision probes stay single-leaf.

use jext_error::{JextError, Result};
use jext_journal::{AccessKind, Txn};
use jext_ondisk::htree::{
    dx_hash, dx_node_limit, dx_root_limit, find_leaf, DxEntry, DxHash, DxNode, DxRoot,
};
use jext_ondisk::{iter_dir_block, DirEntry, FileType};
use jext_types::{BlockNumber, InodeNumber, ParseError};

use crate::{
    add_entry, encode_entry, fill_free_space, init_dir_block, remove_entry, validate_name,
    DirConfig, DirStore, MAX_REC_LEN,
};

// ── Public operations ───────────────────────────────────────────────────────

/// Create a directory's first block with `.` and `..` entries.
///
/// The directory must have no blocks yet; the new block is journaled as
/// freshly created metadata.
pub fn init_directory(
    store: &mut dyn DirStore,
    txn: &mut Txn<'_>,
    parent: InodeNumber,
) -> Result<()> {
    let (lblock, phys) = store.append(txn)?;
    if lblock != 0 {
        return Err(JextError::Corruption {
            block: phys.0,
            detail: format!("new directory inode {} already has blocks", store.ino().0),
        });
    }
    txn.declare(phys, AccessKind::Create)?;
    let mut buf = vec![0_u8; store.block_size() as usize];
    init_dir_block(&mut buf, dirent_ino(store.ino())?, dirent_ino(parent)?)?;
    txn.dirty(phys, &buf)
}

/// Find `name` in the directory.
///
/// Indexed directories answer `.` and `..` from the root block and
/// descend the index for everything else; unindexed directories scan
/// their blocks in order.
pub fn lookup(
    store: &mut dyn DirStore,
    txn: &mut Txn<'_>,
    cfg: &DirConfig,
    name: &[u8],
) -> Result<Option<DirEntry>> {
    validate_name(name)?;
    if store.block_count() == 0 {
        return Err(JextError::Corruption {
            block: 0,
            detail: format!("directory inode {} has no blocks", store.ino().0),
        });
    }
    if !store.is_indexed() {
        return lookup_linear(store, txn, name);
    }

    let (_, _, root) = read_root(store, txn, cfg, AccessKind::Read)?;
    if name == b"." || name == b".." {
        let inode = if name == b"." {
            root.dot_inode
        } else {
            root.dotdot_inode
        };
        return Ok(Some(DirEntry {
            inode,
            rec_len: 12,
            file_type: FileType::Dir,
            name: name.to_vec(),
        }));
    }

    let hash = dx_hash(cfg.hash_version, name, &cfg.seed);
    let path = descend(store, txn, &root, hash.major)?;
    let (leaf_phys, leaf_buf) = load_block(store, txn, path.leaf, AccessKind::Read)?;
    scan_block(&leaf_buf, leaf_phys, name)
}

/// Add an entry for `name`.
///
/// A duplicate name is [`JextError::Exists`]. The first overflow of a
/// one-block directory builds the index when the mount enables it; leaf
/// overflows split. [`JextError::NoSpace`] means the index cannot take
/// another block, either because an equal-hash run fills a whole leaf or
/// because both index levels are at capacity.
pub fn insert(
    store: &mut dyn DirStore,
    txn: &mut Txn<'_>,
    cfg: &DirConfig,
    name: &[u8],
    ino: InodeNumber,
    file_type: FileType,
) -> Result<()> {
    validate_name(name)?;
    if name == b"." || name == b".." {
        return Err(JextError::Exists);
    }
    let ino32 = dirent_ino(ino)?;
    if lookup(store, txn, cfg, name)?.is_some() {
        return Err(JextError::Exists);
    }

    if store.is_indexed() {
        insert_indexed(store, txn, cfg, name, ino32, file_type)
    } else {
        insert_linear(store, txn, cfg, name, ino32, file_type)
    }
}

/// Remove the entry for `name`. `.` and `..` are not removable.
pub fn remove(
    store: &mut dyn DirStore,
    txn: &mut Txn<'_>,
    cfg: &DirConfig,
    name: &[u8],
) -> Result<()> {
    validate_name(name)?;
    if name == b"." || name == b".." {
        return Err(JextError::Format("'.' and '..' cannot be removed".into()));
    }

    if store.is_indexed() {
        let (_, _, root) = read_root(store, txn, cfg, AccessKind::Read)?;
        let hash = dx_hash(cfg.hash_version, name, &cfg.seed);
        let path = descend(store, txn, &root, hash.major)?;
        let (leaf_phys, mut leaf_buf) = load_block(store, txn, path.leaf, AccessKind::Write)?;
        if remove_entry(&mut leaf_buf, name).map_err(|e| at_block(e, leaf_phys))? {
            txn.dirty(leaf_phys, &leaf_buf)?;
            return Ok(());
        }
    } else {
        for lblock in 0..store.block_count() {
            let (phys, mut buf) = load_block(store, txn, lblock, AccessKind::Write)?;
            if remove_entry(&mut buf, name).map_err(|e| at_block(e, phys))? {
                txn.dirty(phys, &buf)?;
                return Ok(());
            }
        }
    }

    Err(JextError::NotFound(
        String::from_utf8_lossy(name).into_owned(),
    ))
}

/// Whether the directory holds nothing but `.` and `..`.
pub fn is_empty(store: &mut dyn DirStore, txn: &mut Txn<'_>) -> Result<bool> {
    for lblock in 0..store.block_count() {
        let (phys, buf) = load_block(store, txn, lblock, AccessKind::Read)?;
        for entry in iter_dir_block(&buf) {
            let entry = entry.map_err(|e| corrupt(phys, "directory entries", e))?;
            if !entry.is_dot() && !entry.is_dotdot() {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

// ── Descent ─────────────────────────────────────────────────────────────────

/// Path from the root to the leaf covering one hash value.
pub(crate) struct Descent {
    /// Logical block of the covering leaf.
    pub(crate) leaf: u32,
    /// Interior node on the path, when the root has one level.
    pub(crate) node: Option<u32>,
    /// Hash bound of the next leaf to the right, when one exists.
    pub(crate) next_hash: Option<u32>,
}

pub(crate) fn load_block(
    store: &mut dyn DirStore,
    txn: &mut Txn<'_>,
    lblock: u32,
    kind: AccessKind,
) -> Result<(BlockNumber, Vec<u8>)> {
    let phys = store.map(txn, lblock)?;
    txn.declare(phys, kind)?;
    let buf = txn.read(phys)?.to_vec();
    Ok((phys, buf))
}

/// Parse the index root and check it against the mount's hash version.
pub(crate) fn read_root(
    store: &mut dyn DirStore,
    txn: &mut Txn<'_>,
    cfg: &DirConfig,
    kind: AccessKind,
) -> Result<(BlockNumber, Vec<u8>, DxRoot)> {
    let (phys, buf) = load_block(store, txn, 0, kind)?;
    let root = DxRoot::parse_from_block(&buf).map_err(|e| corrupt(phys, "index root", e))?;
    if root.hash_version != cfg.hash_version {
        return Err(JextError::Corruption {
            block: phys.0,
            detail: format!(
                "index recorded hash version {:?} but the mount uses {:?}",
                root.hash_version, cfg.hash_version
            ),
        });
    }
    Ok((phys, buf, root))
}

pub(crate) fn descend(
    store: &mut dyn DirStore,
    txn: &mut Txn<'_>,
    root: &DxRoot,
    hash: u32,
) -> Result<Descent> {
    let idx = find_leaf(&root.entries, hash);
    let mut next_hash = root.entries.get(idx + 1).map(|e| e.hash);
    let child = root.entries[idx].block;
    if root.indirect_levels == 0 {
        return Ok(Descent {
            leaf: child,
            node: None,
            next_hash,
        });
    }

    let (node_phys, node_buf) = load_block(store, txn, child, AccessKind::Read)?;
    let node = DxNode::parse_from_block(&node_buf).map_err(|e| corrupt(node_phys, "index node", e))?;
    let nidx = find_leaf(&node.entries, hash);
    if let Some(entry) = node.entries.get(nidx + 1) {
        next_hash = Some(entry.hash);
    }
    Ok(Descent {
        leaf: node.entries[nidx].block,
        node: Some(child),
        next_hash,
    })
}

// ── Linear directories ──────────────────────────────────────────────────────

fn lookup_linear(
    store: &mut dyn DirStore,
    txn: &mut Txn<'_>,
    name: &[u8],
) -> Result<Option<DirEntry>> {
    for lblock in 0..store.block_count() {
        let (phys, buf) = load_block(store, txn, lblock, AccessKind::Read)?;
        if let Some(entry) = scan_block(&buf, phys, name)? {
            return Ok(Some(entry));
        }
    }
    Ok(None)
}

fn scan_block(buf: &[u8], phys: BlockNumber, name: &[u8]) -> Result<Option<DirEntry>> {
    for entry in iter_dir_block(buf) {
        let entry = entry.map_err(|e| corrupt(phys, "directory entries", e))?;
        if entry.name == name {
            return Ok(Some(entry.to_owned_entry()));
        }
    }
    Ok(None)
}

fn insert_linear(
    store: &mut dyn DirStore,
    txn: &mut Txn<'_>,
    cfg: &DirConfig,
    name: &[u8],
    ino: u32,
    file_type: FileType,
) -> Result<()> {
    let blocks = store.block_count();
    for lblock in 0..blocks {
        let (phys, mut buf) = load_block(store, txn, lblock, AccessKind::Write)?;
        match add_entry(&mut buf, ino, name, file_type) {
            Ok(_) => {
                txn.dirty(phys, &buf)?;
                return Ok(());
            }
            Err(JextError::NoSpace) => {}
            Err(e) => return Err(at_block(e, phys)),
        }
    }

    if cfg.index_enabled && blocks == 1 {
        build_index(store, txn, cfg)?;
        return insert_indexed(store, txn, cfg, name, ino, file_type);
    }

    // Index disabled or the directory already grew linear; stay linear.
    let (lblock, phys) = store.append(txn)?;
    txn.declare(phys, AccessKind::Create)?;
    let mut buf = vec![0_u8; store.block_size() as usize];
    fill_free_space(&mut buf, 0)?;
    add_entry(&mut buf, ino, name, file_type).map_err(|e| at_block(e, phys))?;
    txn.dirty(phys, &buf)?;
    tracing::debug!(
        target: "jext::dir",
        ino = store.ino().0,
        lblock,
        "dir_block_appended"
    );
    Ok(())
}

// ── Index construction and splits ───────────────────────────────────────────

/// Convert a full one-block directory into an indexed one: block 0
/// becomes the root, its entries move to a fresh leaf.
fn build_index(store: &mut dyn DirStore, txn: &mut Txn<'_>, cfg: &DirConfig) -> Result<()> {
    let (root_phys, root_buf) = load_block(store, txn, 0, AccessKind::Write)?;

    let mut dot_inode = 0_u32;
    let mut dotdot_inode = 0_u32;
    let mut moved: Vec<DirEntry> = Vec::new();
    for entry in iter_dir_block(&root_buf) {
        let entry = entry.map_err(|e| corrupt(root_phys, "directory entries", e))?;
        if entry.is_dot() {
            dot_inode = entry.inode;
        } else if entry.is_dotdot() {
            dotdot_inode = entry.inode;
        } else {
            moved.push(entry.to_owned_entry());
        }
    }
    if dot_inode == 0 || dotdot_inode == 0 {
        return Err(JextError::Corruption {
            block: root_phys.0,
            detail: "directory block 0 is missing '.' or '..'".into(),
        });
    }

    let (leaf_lblock, leaf_phys) = store.append(txn)?;
    txn.declare(leaf_phys, AccessKind::Create)?;
    let mut leaf_buf = vec![0_u8; root_buf.len()];
    build_leaf_block(&mut leaf_buf, &moved).map_err(|e| at_block(e, leaf_phys))?;
    txn.dirty(leaf_phys, &leaf_buf)?;

    let root = DxRoot {
        hash_version: cfg.hash_version,
        indirect_levels: 0,
        dot_inode,
        dotdot_inode,
        entries: vec![DxEntry {
            hash: 0,
            block: leaf_lblock,
        }],
    };
    write_root(txn, root_phys, &root, store.block_size())?;
    store.set_indexed(txn)?;

    tracing::info!(
        target: "jext::dir",
        ino = store.ino().0,
        moved = moved.len(),
        "dir_index_built"
    );
    Ok(())
}

fn insert_indexed(
    store: &mut dyn DirStore,
    txn: &mut Txn<'_>,
    cfg: &DirConfig,
    name: &[u8],
    ino: u32,
    file_type: FileType,
) -> Result<()> {
    let hash = dx_hash(cfg.hash_version, name, &cfg.seed);

    // A split moves the covering leaf's boundary, so re-descend and retry
    // until the entry lands. Every split strictly shrinks the covering
    // leaf, and an unsplittable leaf reports NoSpace.
    loop {
        let (_, _, root) = read_root(store, txn, cfg, AccessKind::Read)?;
        let path = descend(store, txn, &root, hash.major)?;
        let (leaf_phys, mut leaf_buf) = load_block(store, txn, path.leaf, AccessKind::Write)?;
        match add_entry(&mut leaf_buf, ino, name, file_type) {
            Ok(_) => {
                txn.dirty(leaf_phys, &leaf_buf)?;
                return Ok(());
            }
            Err(JextError::NoSpace) => split_leaf(store, txn, cfg, &path, leaf_phys, &leaf_buf)?,
            Err(e) => return Err(at_block(e, leaf_phys)),
        }
    }
}

/// Split a full leaf at the equal-major run boundary nearest the middle
/// and hook the upper half into the index.
fn split_leaf(
    store: &mut dyn DirStore,
    txn: &mut Txn<'_>,
    cfg: &DirConfig,
    path: &Descent,
    leaf_phys: BlockNumber,
    leaf_buf: &[u8],
) -> Result<()> {
    let mut hashed: Vec<(DxHash, DirEntry)> = Vec::new();
    for entry in iter_dir_block(leaf_buf) {
        let entry = entry.map_err(|e| corrupt(leaf_phys, "directory entries", e))?;
        let hash = dx_hash(cfg.hash_version, entry.name, &cfg.seed);
        hashed.push((hash, entry.to_owned_entry()));
    }
    hashed.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.name.cmp(&b.1.name)));

    let Some(split_at) = split_point(&hashed) else {
        // Every entry shares one major hash; the index cannot separate
        // them into two leaves.
        return Err(JextError::NoSpace);
    };
    // Fail a capacity-bound split before any block changes.
    ensure_index_room(store, txn, cfg, path)?;

    let pivot = hashed[split_at].0.major;
    let (new_lblock, new_phys) = store.append(txn)?;
    txn.declare(new_phys, AccessKind::Create)?;

    let lower: Vec<DirEntry> = hashed[..split_at].iter().map(|(_, e)| e.clone()).collect();
    let upper: Vec<DirEntry> = hashed[split_at..].iter().map(|(_, e)| e.clone()).collect();

    let mut lower_buf = vec![0_u8; leaf_buf.len()];
    build_leaf_block(&mut lower_buf, &lower).map_err(|e| at_block(e, leaf_phys))?;
    let mut upper_buf = vec![0_u8; leaf_buf.len()];
    build_leaf_block(&mut upper_buf, &upper).map_err(|e| at_block(e, new_phys))?;
    txn.dirty(leaf_phys, &lower_buf)?;
    txn.dirty(new_phys, &upper_buf)?;

    add_index_entry(
        store,
        txn,
        cfg,
        path,
        DxEntry {
            hash: pivot,
            block: new_lblock,
        },
    )?;
    tracing::debug!(
        target: "jext::dir",
        ino = store.ino().0,
        pivot,
        new_lblock,
        "dir_leaf_split"
    );
    Ok(())
}

/// Split position for a hash-sorted leaf: the major-run boundary nearest
/// the middle, or `None` when the whole leaf is one run.
fn split_point(hashed: &[(DxHash, DirEntry)]) -> Option<usize> {
    let mid = hashed.len() / 2;
    let mut best: Option<usize> = None;
    for boundary in 1..hashed.len() {
        if hashed[boundary - 1].0.major == hashed[boundary].0.major {
            continue;
        }
        match best {
            Some(current) if current.abs_diff(mid) <= boundary.abs_diff(mid) => {}
            _ => best = Some(boundary),
        }
    }
    best
}

/// Check the index can take one more leaf pointer on this path.
fn ensure_index_room(
    store: &mut dyn DirStore,
    txn: &mut Txn<'_>,
    cfg: &DirConfig,
    path: &Descent,
) -> Result<()> {
    // A root-level insert either fits or promotes into a fresh interior
    // node, which always has more room than the root.
    let Some(node_lblock) = path.node else {
        return Ok(());
    };
    let (_, _, root) = read_root(store, txn, cfg, AccessKind::Read)?;
    let (node_phys, node_buf) = load_block(store, txn, node_lblock, AccessKind::Read)?;
    let node = DxNode::parse_from_block(&node_buf).map_err(|e| corrupt(node_phys, "index node", e))?;
    let bs = store.block_size();
    if node.entries.len() < dx_node_limit(bs) || root.entries.len() < dx_root_limit(bs) {
        Ok(())
    } else {
        Err(JextError::NoSpace)
    }
}

/// Hook a new leaf into the index at the level `path` descended through.
fn add_index_entry(
    store: &mut dyn DirStore,
    txn: &mut Txn<'_>,
    cfg: &DirConfig,
    path: &Descent,
    pending: DxEntry,
) -> Result<()> {
    let (root_phys, _, mut root) = read_root(store, txn, cfg, AccessKind::Write)?;
    let bs = store.block_size();

    let Some(node_lblock) = path.node else {
        if root.entries.len() < dx_root_limit(bs) {
            insert_sorted(&mut root.entries, pending);
            return write_root(txn, root_phys, &root, bs);
        }
        return promote_root(store, txn, &mut root, root_phys, pending);
    };

    let (node_phys, node_buf) = load_block(store, txn, node_lblock, AccessKind::Write)?;
    let mut node = DxNode::parse_from_block(&node_buf).map_err(|e| corrupt(node_phys, "index node", e))?;
    if node.entries.len() < dx_node_limit(bs) {
        insert_sorted(&mut node.entries, pending);
        return write_node(txn, node_phys, &node, bs);
    }
    split_interior(store, txn, &mut root, root_phys, node, node_phys, pending)
}

/// Push a full root's entries down into a fresh interior node and point
/// the root at it.
fn promote_root(
    store: &mut dyn DirStore,
    txn: &mut Txn<'_>,
    root: &mut DxRoot,
    root_phys: BlockNumber,
    pending: DxEntry,
) -> Result<()> {
    let bs = store.block_size();
    let (node_lblock, node_phys) = store.append(txn)?;
    txn.declare(node_phys, AccessKind::Create)?;

    let mut node = DxNode {
        entries: std::mem::take(&mut root.entries),
    };
    insert_sorted(&mut node.entries, pending);
    write_node(txn, node_phys, &node, bs)?;

    root.indirect_levels = 1;
    root.entries = vec![DxEntry {
        hash: 0,
        block: node_lblock,
    }];
    write_root(txn, root_phys, root, bs)?;

    tracing::info!(
        target: "jext::dir",
        ino = store.ino().0,
        leaves = node.entries.len(),
        "dir_index_promoted"
    );
    Ok(())
}

/// Split a full interior node, promoting its median bound into the root.
fn split_interior(
    store: &mut dyn DirStore,
    txn: &mut Txn<'_>,
    root: &mut DxRoot,
    root_phys: BlockNumber,
    mut node: DxNode,
    node_phys: BlockNumber,
    pending: DxEntry,
) -> Result<()> {
    let bs = store.block_size();
    insert_sorted(&mut node.entries, pending);

    let at = node.entries.len() / 2;
    let mut upper = node.entries.split_off(at);
    let promoted = upper[0].hash;
    // The promoted bound lives in the root; the new node starts with the
    // zero-hash sentinel like every other.
    upper[0].hash = 0;

    let (new_lblock, new_phys) = store.append(txn)?;
    txn.declare(new_phys, AccessKind::Create)?;
    write_node(txn, new_phys, &DxNode { entries: upper }, bs)?;
    write_node(txn, node_phys, &node, bs)?;

    insert_sorted(
        &mut root.entries,
        DxEntry {
            hash: promoted,
            block: new_lblock,
        },
    );
    write_root(txn, root_phys, root, bs)?;

    tracing::debug!(
        target: "jext::dir",
        ino = store.ino().0,
        promoted,
        "dir_index_node_split"
    );
    Ok(())
}

/// Insert after the last entry whose hash is `<=` the new one, keeping
/// the list sorted.
fn insert_sorted(entries: &mut Vec<DxEntry>, entry: DxEntry) {
    let at = entries.partition_point(|e| e.hash <= entry.hash);
    entries.insert(at, entry);
}

/// Lay out entries compactly; the final record absorbs the slack.
pub(crate) fn build_leaf_block(buf: &mut [u8], entries: &[DirEntry]) -> Result<()> {
    buf.fill(0);
    let Some((last, rest)) = entries.split_last() else {
        return fill_free_space(buf, 0);
    };

    let mut offset = 0_usize;
    for entry in rest {
        let rec = entry.used_len();
        encode_entry(buf, offset, entry.inode, rec, entry.file_type, &entry.name)?;
        offset += rec;
    }

    let remaining = buf.len() - offset;
    if remaining <= MAX_REC_LEN {
        encode_entry(buf, offset, last.inode, remaining, last.file_type, &last.name)
    } else {
        let rec = last.used_len();
        encode_entry(buf, offset, last.inode, rec, last.file_type, &last.name)?;
        fill_free_space(buf, offset + rec)
    }
}

fn write_root(txn: &mut Txn<'_>, phys: BlockNumber, root: &DxRoot, block_size: u32) -> Result<()> {
    let mut buf = vec![0_u8; block_size as usize];
    root.encode_into(&mut buf).map_err(|e| corrupt(phys, "index root", e))?;
    txn.dirty(phys, &buf)
}

fn write_node(txn: &mut Txn<'_>, phys: BlockNumber, node: &DxNode, block_size: u32) -> Result<()> {
    let mut buf = vec![0_u8; block_size as usize];
    node.encode_into(&mut buf).map_err(|e| corrupt(phys, "index node", e))?;
    txn.dirty(phys, &buf)
}

// ── Error mapping ───────────────────────────────────────────────────────────

pub(crate) fn corrupt(phys: BlockNumber, what: &str, err: ParseError) -> JextError {
    JextError::Corruption {
        block: phys.0,
        detail: format!("{what}: {err}"),
    }
}

/// Fill in the physical block for corruption reported by block-level
/// helpers, which do not know where their buffer lives.
fn at_block(err: JextError, phys: BlockNumber) -> JextError {
    match err {
        JextError::Corruption { block: 0, detail } => JextError::Corruption {
            block: phys.0,
            detail,
        },
        other => other,
    }
}

fn dirent_ino(ino: InodeNumber) -> Result<u32> {
    u32::try_from(ino.0).map_err(|_| {
        JextError::Format(format!("inode {} exceeds the directory entry width", ino.0))
    })
}
