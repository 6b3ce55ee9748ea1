#![forbid(unsafe_code)]
//! Mounting and filesystem-level operations.
//!
//! This crate ties the lower layers together into a [`Filesystem`]: the
//! superblock and group descriptors are parsed and validated at mount,
//! the allocator is seeded from them, and every metadata mutation from
//! here on flows through journal transactions.
//!
//! ## Layering
//!
//! ```text
//!   Filesystem  ── mount state, error policy, counters
//!     ├── inode    inode records, lifecycle, orphan recovery
//!     ├── map      logical-to-physical block mapping, truncate
//!     ├── dir      directory operations over jext-dir
//!     ├── resize   online group addition
//!     └── format   mkfs
//! ```
//!
//! ## Error policy
//!
//! Benign per-call failures (`NoSpace`, `Exists`, `NotFound`, `Busy`, ...)
//! return to the caller and leave the filesystem untouched. Metadata
//! damage (`Io`, `Corruption`, `Journal`) additionally trips the
//! superblock error state: the flag is persisted straight to the device,
//! bypassing the possibly-failing journal, and the mount-resolved policy
//! decides whether the instance continues, fences writes, or halts.

mod dir;
mod format;
mod inode;
mod map;
mod resize;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use jext_alloc::{Allocator, DEFAULT_RESERVE_BLOCKS};
use jext_block::{BlockDevice, BlockBuf};
use jext_dir::DirConfig;
use jext_error::{JextError, Result};
use jext_journal::{JournalEngine, Txn};
use jext_ondisk::group::{GroupDesc, GROUP_DESC_SIZE};
use jext_ondisk::htree::HashVersion;
use jext_ondisk::superblock::{CompatFeatures, ErrorsPolicy, Superblock, STATE_CLEAN, STATE_ERRORS};
use jext_types::{
    BlockNumber, FsGeometry, GroupNumber, InodeNumber, ParseError, SUPERBLOCK_OFFSET,
    SUPERBLOCK_SIZE,
};

pub use dir::DirHandle;
pub use format::{format, FormatOptions};
pub use resize::NewGroupInput;

pub use jext_alloc::{AllocHint, BlockAlloc};
pub use jext_dir::{DirCursor, ReaddirChunk, ReaddirEntry};
pub use jext_ondisk::dirent::{DirEntry, FileType};
pub use jext_ondisk::inode::InodeRecord;

// ── Mount options ───────────────────────────────────────────────────────────

/// Caller-supplied knobs for [`Filesystem::mount`].
#[derive(Debug, Clone, Default)]
pub struct MountOptions {
    /// Mount without accepting any mutation. Orphan recovery is
    /// deferred to the next writable mount.
    pub read_only: bool,
    /// Override the on-disk `errors` policy.
    pub errors_override: Option<ErrorsPolicy>,
    /// Override whether directories build hash indexes on overflow.
    /// Defaults to the superblock's `DIR_INDEX` compat feature.
    pub dir_index_override: Option<bool>,
    /// Disable per-inode reservation windows. Allocations still honor
    /// goal hints but no longer fence blocks ahead of growing files.
    pub no_reservations: bool,
}

/// Mount-time configuration, resolved once from the superblock and
/// [`MountOptions`]. Nothing here changes while mounted.
#[derive(Debug, Clone)]
pub struct MountConfig {
    pub read_only: bool,
    pub errors: ErrorsPolicy,
    pub dir: DirConfig,
    pub reservations_enabled: bool,
    pub default_reservation_size: u32,
}

// ── Filesystem ──────────────────────────────────────────────────────────────

/// A mounted filesystem instance.
///
/// All mutating operations go through journal transactions on the
/// engine supplied at mount. Reads go through the journal's view so a
/// transaction's own buffered writes are visible before commit.
pub struct Filesystem {
    device: Arc<dyn BlockDevice>,
    journal: Arc<dyn JournalEngine>,
    alloc: Allocator,
    config: MountConfig,
    pub(crate) sb: Mutex<Superblock>,
    sb_block: BlockNumber,
    sb_offset: usize,
    gdt_start: BlockNumber,
    orphan_table: Option<BlockNumber>,
    inode_locks: Mutex<HashMap<u64, Arc<Mutex<()>>>>,
    pub(crate) next_generation: AtomicU32,
    write_fenced: AtomicBool,
    halted: AtomicBool,
}

impl std::fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filesystem")
            .field("config", &self.config)
            .field("gdt_start", &self.gdt_start)
            .field("orphan_table", &self.orphan_table)
            .finish_non_exhaustive()
    }
}

impl Filesystem {
    /// Mount a filesystem from `device`, journaling through `journal`.
    ///
    /// Validates the superblock and every group descriptor, seeds the
    /// allocator, resolves the mount configuration, and on writable
    /// mounts runs orphan recovery and marks the volume in use. A
    /// superblock carrying unknown incompatible feature bits refuses to
    /// mount; unknown read-only-compatible bits force the mount
    /// read-only.
    pub fn mount(
        device: Arc<dyn BlockDevice>,
        journal: Arc<dyn JournalEngine>,
        options: &MountOptions,
    ) -> Result<Self> {
        let sb = read_superblock(device.as_ref())?;

        if !sb.has_required_features() {
            return Err(JextError::IncompatibleFeature(format!(
                "missing required incompat features, found {:#x}",
                sb.feature_incompat.0
            )));
        }
        let unknown_incompat = sb.unsupported_incompat_bits();
        if unknown_incompat != 0 {
            return Err(JextError::UnsupportedFeature(format!(
                "unknown incompat feature bits {unknown_incompat:#x}"
            )));
        }
        let mut read_only = options.read_only;
        let unknown_ro = sb.unknown_ro_compat_bits();
        if unknown_ro != 0 && !read_only {
            tracing::warn!(
                target: "jext::core",
                bits = format_args!("{unknown_ro:#x}"),
                "unknown ro-compat feature bits, forcing read-only"
            );
            read_only = true;
        }

        let geo = sb
            .geometry()
            .map_err(|err| JextError::InvalidGeometry(err.to_string()))?;
        if geo.block_size.get() != device.block_size() {
            return Err(JextError::InvalidGeometry(format!(
                "filesystem block size {} does not match device block size {}",
                geo.block_size.get(),
                device.block_size()
            )));
        }
        if geo.total_blocks > device.block_count() {
            return Err(JextError::InvalidGeometry(format!(
                "filesystem spans {} blocks but device holds {}",
                geo.total_blocks,
                device.block_count()
            )));
        }

        let gdt_start = BlockNumber(u64::from(geo.first_data_block) + 1);
        let descs = read_group_descriptors(journal.as_ref(), &geo, gdt_start)?;
        let mut alloc = Allocator::new(geo.clone(), gdt_start, &descs);

        let hash_version = HashVersion::from_raw(sb.def_hash_version).ok_or_else(|| {
            JextError::Format(format!(
                "unknown default hash version {}",
                sb.def_hash_version
            ))
        })?;
        let config = MountConfig {
            read_only,
            errors: options.errors_override.unwrap_or_else(|| sb.errors_policy()),
            dir: DirConfig {
                hash_version,
                seed: sb.hash_seed,
                index_enabled: options
                    .dir_index_override
                    .unwrap_or_else(|| sb.has_compat(CompatFeatures::DIR_INDEX)),
            },
            reservations_enabled: !options.no_reservations,
            default_reservation_size: DEFAULT_RESERVE_BLOCKS,
        };
        alloc.set_reservation_policy(config.reservations_enabled, config.default_reservation_size);

        if !sb.is_clean() {
            tracing::warn!(target: "jext::core", "volume was not cleanly unmounted");
        }
        if sb.has_error_flag() {
            tracing::warn!(target: "jext::core", "volume carries a recorded error, check advised");
        }

        let orphan_table = if sb.orphan_table_block == 0 {
            None
        } else {
            let block = BlockNumber(u64::from(sb.orphan_table_block));
            if !geo.block_in_range(block) {
                return Err(JextError::InvalidGeometry(format!(
                    "orphan table block {block} out of range"
                )));
            }
            Some(block)
        };

        let orphan_pending = sb.orphan_pending();
        let sb_block = BlockNumber(u64::from(geo.first_data_block));
        let sb_offset = SUPERBLOCK_OFFSET % geo.block_size.get() as usize;
        let fs = Self {
            device,
            journal,
            alloc,
            config,
            sb: Mutex::new(sb),
            sb_block,
            sb_offset,
            gdt_start,
            orphan_table,
            inode_locks: Mutex::new(HashMap::new()),
            next_generation: AtomicU32::new(generation_seed()),
            write_fenced: AtomicBool::new(false),
            halted: AtomicBool::new(false),
        };

        if fs.config.read_only {
            if orphan_pending {
                tracing::warn!(
                    target: "jext::core",
                    "orphan recovery pending, deferred by read-only mount"
                );
            }
        } else {
            if orphan_pending {
                if fs.orphan_table.is_none() {
                    return Err(JextError::Corruption {
                        block: fs.sb_block.0,
                        detail: "orphan recovery pending but no orphan table recorded".into(),
                    });
                }
                let recovered = fs.orphan_recover_all()?;
                tracing::info!(target: "jext::core", recovered, "orphan recovery finished");
            }
            fs.mark_mounted()?;
        }

        let geo = fs.alloc.geometry();
        tracing::info!(
            target: "jext::core",
            blocks = geo.total_blocks,
            groups = geo.group_count,
            block_size = geo.block_size.get(),
            read_only = fs.config.read_only,
            "mounted"
        );
        Ok(fs)
    }

    /// Write the clean-unmount state and flush everything.
    ///
    /// After an error fenced writes, the state bits on disk are left for
    /// the next check run instead; only the device is synced.
    pub fn unmount(&self) -> Result<()> {
        self.ensure_ok()?;
        if !self.config.read_only && !self.write_fenced.load(Ordering::Acquire) {
            let mut txn = self.begin(jext_journal::SINGLEDATA_CREDITS)?;
            {
                let mut sb = self.sb.lock();
                sb.state |= STATE_CLEAN;
                sb.wtime = inode::unix_now();
            }
            match self.write_superblock(&mut txn) {
                Ok(()) => txn.stop()?,
                Err(err) => return self.fail_txn(txn, err),
            }
            self.journal.force_commit()?;
        }
        self.device.sync()?;
        tracing::info!(target: "jext::core", "unmounted");
        Ok(())
    }

    // ── Accessors ───────────────────────────────────────────────────────

    /// Current geometry. Owned snapshot; resize swaps the whole value.
    #[must_use]
    pub fn geometry(&self) -> FsGeometry {
        self.alloc.geometry()
    }

    /// Filesystem block size in bytes.
    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.alloc.geometry().block_size.get()
    }

    /// The allocator, exposed for diagnostics and tooling.
    #[must_use]
    pub fn allocator(&self) -> &Allocator {
        &self.alloc
    }

    /// Resolved mount configuration.
    #[must_use]
    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    /// Free blocks across all groups.
    #[must_use]
    pub fn free_block_count(&self) -> u64 {
        self.alloc.free_blocks()
    }

    /// Free inodes across all groups.
    #[must_use]
    pub fn free_inode_count(&self) -> u64 {
        self.alloc.free_inodes()
    }

    /// Snapshot of the in-memory superblock.
    #[must_use]
    pub fn superblock(&self) -> Superblock {
        self.sb.lock().clone()
    }

    /// Whether an error has fenced writes or halted the instance.
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.write_fenced.load(Ordering::Acquire) || self.halted.load(Ordering::Acquire)
    }

    pub(crate) fn journal(&self) -> &dyn JournalEngine {
        self.journal.as_ref()
    }

    pub(crate) fn orphan_table(&self) -> Option<BlockNumber> {
        self.orphan_table
    }

    // ── Transactions ────────────────────────────────────────────────────

    /// Open a journal transaction reserving `credits` metadata blocks.
    pub fn begin(&self, credits: u32) -> Result<Txn<'_>> {
        self.ensure_ok()?;
        Txn::start(self.journal.as_ref(), credits)
    }

    /// Abort `txn` and run `err` through the error policy.
    pub(crate) fn fail_txn<T>(&self, txn: Txn<'_>, err: JextError) -> Result<T> {
        if let Err(abort_err) = txn.abort() {
            tracing::warn!(target: "jext::core", error = %abort_err, "abort failed");
        }
        Err(self.fs_error(err))
    }

    // ── Error policy ────────────────────────────────────────────────────

    pub(crate) fn ensure_ok(&self) -> Result<()> {
        if self.halted.load(Ordering::Acquire) {
            return Err(JextError::Halted);
        }
        Ok(())
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        self.ensure_ok()?;
        if self.config.read_only || self.write_fenced.load(Ordering::Acquire) {
            return Err(JextError::ReadOnly);
        }
        Ok(())
    }

    /// Route a failure through the mount-resolved error policy.
    ///
    /// Damage-class errors set the sticky superblock error flag and,
    /// depending on policy, fence writes or halt the instance. Benign
    /// errors pass through untouched.
    pub(crate) fn fs_error(&self, err: JextError) -> JextError {
        if !err.is_damage() {
            return err;
        }
        tracing::error!(
            target: "jext::core",
            error = %err,
            policy = ?self.config.errors,
            "metadata failure"
        );
        self.persist_error_flag();
        match self.config.errors {
            ErrorsPolicy::Continue => {}
            ErrorsPolicy::RemountReadOnly => {
                self.write_fenced.store(true, Ordering::Release);
            }
            ErrorsPolicy::Halt => {
                self.halted.store(true, Ordering::Release);
            }
        }
        err
    }

    /// Persist the error state bit straight to the device.
    ///
    /// The journal may be the failing component, so this write bypasses
    /// it. Best effort: a failure here only logs.
    fn persist_error_flag(&self) {
        let mut sb = self.sb.lock();
        sb.state |= STATE_ERRORS;
        let encoded = {
            let buf = match self.device.read_block(self.sb_block) {
                Ok(buf) => buf,
                Err(err) => {
                    tracing::warn!(target: "jext::core", error = %err, "error flag not persisted");
                    return;
                }
            };
            let mut bytes = buf.to_vec();
            let end = self.sb_offset + SUPERBLOCK_SIZE;
            if let Err(err) = sb.encode_into(&mut bytes[self.sb_offset..end]) {
                tracing::warn!(target: "jext::core", error = %err, "error flag not persisted");
                return;
            }
            bytes
        };
        drop(sb);
        if let Err(err) = self
            .device
            .write_block(self.sb_block, &encoded)
            .and_then(|()| self.device.sync())
        {
            tracing::warn!(target: "jext::core", error = %err, "error flag not persisted");
        }
    }

    // ── Superblock maintenance ──────────────────────────────────────────

    /// Re-encode the superblock into `txn`, syncing the free counters
    /// from the allocator. Every transaction that changes counters calls
    /// this so the on-disk shadows travel with the change.
    pub(crate) fn write_superblock(&self, txn: &mut Txn<'_>) -> Result<()> {
        txn.declare(self.sb_block, jext_journal::AccessKind::Write)?;
        let mut bytes = txn.read(self.sb_block)?.to_vec();
        {
            let mut sb = self.sb.lock();
            sb.free_blocks_count = saturate_u32(self.alloc.free_blocks());
            sb.free_inodes_count = saturate_u32(self.alloc.free_inodes());
            let end = self.sb_offset + SUPERBLOCK_SIZE;
            sb.encode_into(&mut bytes[self.sb_offset..end])
                .map_err(|err| JextError::Corruption {
                    block: self.sb_block.0,
                    detail: format!("superblock encode: {err}"),
                })?;
        }
        txn.dirty(self.sb_block, &bytes)
    }

    /// Clear the clean bit and count the mount.
    fn mark_mounted(&self) -> Result<()> {
        let mut txn = self.begin(jext_journal::SINGLEDATA_CREDITS)?;
        {
            let mut sb = self.sb.lock();
            sb.state &= !STATE_CLEAN;
            sb.mnt_count = sb.mnt_count.saturating_add(1);
            sb.mtime = inode::unix_now();
        }
        match self.write_superblock(&mut txn) {
            Ok(()) => txn.stop()?,
            Err(err) => return self.fail_txn(txn, err),
        }
        self.journal.force_commit()?;
        Ok(())
    }

    pub(crate) fn gdt_start(&self) -> BlockNumber {
        self.gdt_start
    }

    // ── Locking ─────────────────────────────────────────────────────────

    /// Per-inode mutation lock. Held across a whole mapping walk or
    /// directory mutation; composites lock parent before child.
    pub(crate) fn inode_lock(&self, ino: InodeNumber) -> Arc<Mutex<()>> {
        self.inode_locks.lock().entry(ino.0).or_default().clone()
    }

    // ── Verification ────────────────────────────────────────────────────

    /// Cross-check free counters: bitmap popcounts against group
    /// descriptors and global atomics, and the persisted superblock
    /// shadows against the atomics.
    pub fn verify_counters(&self) -> Result<()> {
        self.ensure_ok()?;
        jext_alloc::verify_free_counts(&self.alloc, self.journal.as_ref())?;
        let disk = parse_superblock_block(
            self.journal.read_block(self.sb_block)?,
            self.sb_offset,
            self.sb_block,
        )?;
        let free_blocks = saturate_u32(self.alloc.free_blocks());
        let free_inodes = saturate_u32(self.alloc.free_inodes());
        if disk.free_blocks_count != free_blocks || disk.free_inodes_count != free_inodes {
            return Err(JextError::Corruption {
                block: self.sb_block.0,
                detail: format!(
                    "superblock counters {}/{} disagree with allocator {}/{}",
                    disk.free_blocks_count, disk.free_inodes_count, free_blocks, free_inodes
                ),
            });
        }
        Ok(())
    }
}

// ── Mount helpers ───────────────────────────────────────────────────────────

fn read_superblock(device: &dyn BlockDevice) -> Result<Superblock> {
    let dev_bs = device.block_size() as usize;
    let (block, offset) = if dev_bs > SUPERBLOCK_OFFSET {
        (BlockNumber(0), SUPERBLOCK_OFFSET)
    } else {
        (BlockNumber((SUPERBLOCK_OFFSET / dev_bs) as u64), 0)
    };
    parse_superblock_block(device.read_block(block)?, offset, block)
}

fn parse_superblock_block(buf: BlockBuf, offset: usize, block: BlockNumber) -> Result<Superblock> {
    let bytes = buf.as_slice();
    let end = offset + SUPERBLOCK_SIZE;
    if bytes.len() < end {
        return Err(JextError::Corruption {
            block: block.0,
            detail: "device block too small for the superblock".into(),
        });
    }
    Superblock::parse_superblock_region(&bytes[offset..end]).map_err(|err| match err {
        ParseError::InvalidMagic { .. } => {
            JextError::Format("superblock magic not found".into())
        }
        other => JextError::Parse(other.to_string()),
    })
}

fn read_group_descriptors(
    journal: &dyn JournalEngine,
    geo: &FsGeometry,
    gdt_start: BlockNumber,
) -> Result<Vec<GroupDesc>> {
    let bs = geo.block_size.get() as usize;
    let total = geo.group_count as usize * GROUP_DESC_SIZE;
    let gdt_blocks = total.div_ceil(bs);
    let mut raw = Vec::with_capacity(gdt_blocks * bs);
    for i in 0..gdt_blocks {
        let block = BlockNumber(gdt_start.0 + i as u64);
        raw.extend_from_slice(journal.read_block(block)?.as_slice());
    }

    let mut descs = Vec::with_capacity(geo.group_count as usize);
    for g in 0..geo.group_count {
        let group = GroupNumber(g);
        let offset = g as usize * GROUP_DESC_SIZE;
        let block = BlockNumber(gdt_start.0 + (offset / bs) as u64);
        let desc = GroupDesc::parse_from_bytes(&raw[offset..offset + GROUP_DESC_SIZE]).map_err(
            |err| JextError::Corruption {
                block: block.0,
                detail: format!("group descriptor {g}: {err}"),
            },
        )?;
        desc.validate(geo, group).map_err(|err| JextError::Corruption {
            block: block.0,
            detail: format!("group descriptor {g}: {err}"),
        })?;
        descs.push(desc);
    }
    Ok(descs)
}

fn generation_seed() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(1, |d| d.subsec_nanos().wrapping_add(d.subsec_micros()))
}

fn saturate_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}
