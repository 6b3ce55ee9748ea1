//! Directory operations bound to inodes.
//!
//! [`DirHandle`] adapts an inode record to the index layer's block
//! store: logical directory blocks map through the inode's pointer
//! tree, and appends grow the file by one block inside the caller's
//! transaction. The composite operations own their transactions, hold
//! the directory's inode lock for the whole mutation, and keep the
//! orphan table in step with link counts so a crash between commit and
//! eviction never strands an unreferenced inode.
//!
//! Lock order is parent before child. Benign failures compensate any
//! state already changed in the transaction and stop it; damage aborts
//! through the mount error policy.

use jext_alloc::block as balloc;
use jext_dir::{DirConfig, DirCursor, DirStore, ReaddirChunk};
use jext_error::{JextError, Result};
use jext_journal::{Txn, INDEX_EXTRA_CREDITS, RESERVE_CREDITS, SINGLEDATA_CREDITS};
use jext_ondisk::dirent::{DirEntry, FileType};
use jext_ondisk::inode::InodeRecord;
use jext_types::{BlockNumber, InodeNumber, JEXT_INDEX_FL, S_IFDIR, S_IFMT};

use crate::inode::unix_now;
use crate::Filesystem;

/// An open directory: the inode record plus the mount it belongs to.
///
/// The handle caches the record across the index layer's calls; every
/// store re-reads the table block through the transaction, so handles
/// for inodes sharing a block never clobber each other.
#[derive(Debug)]
pub struct DirHandle<'f> {
    fs: &'f Filesystem,
    ino: InodeNumber,
    inode: InodeRecord,
}

impl DirHandle<'_> {
    fn touch(&mut self, txn: &mut Txn<'_>) -> Result<()> {
        let now = unix_now();
        self.inode.mtime = now;
        self.inode.ctime = now;
        self.fs.store_inode_txn(txn, self.ino, &self.inode)
    }
}

impl DirStore for DirHandle<'_> {
    fn ino(&self) -> InodeNumber {
        self.ino
    }

    fn block_size(&self) -> u32 {
        self.fs.block_size()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn block_count(&self) -> u32 {
        (self.inode.size / u64::from(self.fs.block_size())) as u32
    }

    fn is_indexed(&self) -> bool {
        self.inode.flags & JEXT_INDEX_FL != 0
    }

    fn map(&mut self, txn: &mut Txn<'_>, lblock: u32) -> Result<BlockNumber> {
        let mapped =
            self.fs
                .map_block_locked(txn, self.ino, &mut self.inode, u64::from(lblock), false)?;
        match mapped {
            Some(block) => Ok(block),
            None => {
                let (table_block, _) = self.fs.inode_position(self.ino)?;
                Err(JextError::Corruption {
                    block: table_block.0,
                    detail: format!(
                        "directory inode {} has a hole at block {lblock}",
                        self.ino.0
                    ),
                })
            }
        }
    }

    fn append(&mut self, txn: &mut Txn<'_>) -> Result<(u32, BlockNumber)> {
        let lblock = self.block_count();
        let phys = self
            .fs
            .map_block_locked(txn, self.ino, &mut self.inode, u64::from(lblock), true)?
            .ok_or_else(|| JextError::Corruption {
                block: 0,
                detail: format!("directory inode {} grew no block", self.ino.0),
            })?;
        self.inode.size += u64::from(self.fs.block_size());
        self.fs.store_inode_txn(txn, self.ino, &self.inode)?;
        Ok((lblock, phys))
    }

    fn set_indexed(&mut self, txn: &mut Txn<'_>) -> Result<()> {
        self.inode.flags |= JEXT_INDEX_FL;
        self.fs.store_inode_txn(txn, self.ino, &self.inode)
    }
}

impl Filesystem {
    fn dir_handle(&self, txn: &mut Txn<'_>, ino: InodeNumber) -> Result<DirHandle<'_>> {
        let inode = self.load_inode_txn(txn, ino)?;
        if !inode.is_dir() {
            return Err(JextError::NotDirectory);
        }
        Ok(DirHandle {
            fs: self,
            ino,
            inode,
        })
    }

    fn dir_cfg(&self) -> DirConfig {
        self.config().dir
    }

    fn finish_read<T>(&self, txn: Txn<'_>, out: Result<T>) -> Result<T> {
        match out {
            Ok(value) => {
                txn.stop()?;
                Ok(value)
            }
            Err(err) if err.is_damage() => {
                let _ = txn.stop();
                Err(self.fs_error(err))
            }
            Err(err) => {
                txn.stop()?;
                Err(err)
            }
        }
    }

    fn finish_write<T>(&self, txn: Txn<'_>, out: Result<T>) -> Result<T> {
        match out {
            Ok(value) => {
                txn.stop()?;
                Ok(value)
            }
            Err(err) if err.is_damage() => self.fail_txn(txn, err),
            Err(err) => {
                txn.stop()?;
                Err(err)
            }
        }
    }

    // ── Primitives ──────────────────────────────────────────────────────

    /// Find `name` in directory `dir`.
    pub fn dir_lookup(&self, dir: InodeNumber, name: &[u8]) -> Result<Option<DirEntry>> {
        self.ensure_ok()?;
        let cfg = self.dir_cfg();
        let lock = self.inode_lock(dir);
        let _guard = lock.lock();
        let mut txn = self.begin(0)?;
        let out = self
            .dir_handle(&mut txn, dir)
            .and_then(|mut handle| jext_dir::lookup(&mut handle, &mut txn, &cfg, name));
        self.finish_read(txn, out)
    }

    /// Enumerate `dir` from `cursor` in hash order. Dot entries are not
    /// reported.
    pub fn dir_readdir(&self, dir: InodeNumber, cursor: DirCursor) -> Result<ReaddirChunk> {
        self.ensure_ok()?;
        let cfg = self.dir_cfg();
        let lock = self.inode_lock(dir);
        let _guard = lock.lock();
        let mut txn = self.begin(0)?;
        let out = self
            .dir_handle(&mut txn, dir)
            .and_then(|mut handle| jext_dir::readdir(&mut handle, &mut txn, &cfg, cursor));
        self.finish_read(txn, out)
    }

    /// Add an entry inside the caller's transaction.
    ///
    /// The target inode's record is not touched; composites layer link
    /// counting on top.
    pub fn dir_insert(
        &self,
        txn: &mut Txn<'_>,
        dir: InodeNumber,
        name: &[u8],
        ino: InodeNumber,
        file_type: FileType,
    ) -> Result<()> {
        self.ensure_writable()?;
        if !self.geometry().inode_in_range(ino) {
            return Err(JextError::Format(format!(
                "entry target inode {} out of range",
                ino.0
            )));
        }
        let cfg = self.dir_cfg();
        let lock = self.inode_lock(dir);
        let _guard = lock.lock();
        let mut handle = self.dir_handle(txn, dir)?;
        jext_dir::insert(&mut handle, txn, &cfg, name, ino, file_type)?;
        handle.touch(txn)
    }

    /// Remove an entry inside the caller's transaction.
    pub fn dir_delete(&self, txn: &mut Txn<'_>, dir: InodeNumber, name: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        let cfg = self.dir_cfg();
        let lock = self.inode_lock(dir);
        let _guard = lock.lock();
        let mut handle = self.dir_handle(txn, dir)?;
        jext_dir::remove(&mut handle, txn, &cfg, name)?;
        handle.touch(txn)
    }

    // ── Composites ──────────────────────────────────────────────────────

    /// Create a non-directory inode named `name` under `parent`.
    pub fn create(&self, parent: InodeNumber, name: &[u8], mode: u16) -> Result<InodeNumber> {
        self.ensure_writable()?;
        if mode & S_IFMT == S_IFDIR {
            return Err(JextError::IsDirectory);
        }
        let cfg = self.dir_cfg();
        let lock = self.inode_lock(parent);
        let _guard = lock.lock();
        let mut txn = self.begin(RESERVE_CREDITS + INDEX_EXTRA_CREDITS)?;
        let out = (|txn: &mut Txn<'_>| -> Result<InodeNumber> {
            let mut handle = self.dir_handle(txn, parent)?;
            if jext_dir::lookup(&mut handle, txn, &cfg, name)?.is_some() {
                return Err(JextError::Exists);
            }
            let child = self.new_inode(txn, parent, mode)?;
            let inserted =
                jext_dir::insert(&mut handle, txn, &cfg, name, child, FileType::from_mode(mode));
            if let Err(err) = inserted {
                if !err.is_damage() {
                    self.free_inode(txn, child)?;
                }
                return Err(err);
            }
            handle.touch(txn)?;
            tracing::debug!(
                target: "jext::core",
                parent = parent.0,
                ino = child.0,
                "created"
            );
            Ok(child)
        })(&mut txn);
        self.finish_write(txn, out)
    }

    /// Create a directory named `name` under `parent`.
    ///
    /// The child starts with `.` and `..` and two links; the parent
    /// gains the link `..` holds on it.
    pub fn mkdir(&self, parent: InodeNumber, name: &[u8], mode: u16) -> Result<InodeNumber> {
        self.ensure_writable()?;
        let dmode = S_IFDIR | (mode & !S_IFMT);
        let cfg = self.dir_cfg();
        let lock = self.inode_lock(parent);
        let _guard = lock.lock();
        let mut txn =
            self.begin(RESERVE_CREDITS + SINGLEDATA_CREDITS + INDEX_EXTRA_CREDITS)?;
        let out = (|txn: &mut Txn<'_>| -> Result<InodeNumber> {
            let mut handle = self.dir_handle(txn, parent)?;
            if jext_dir::lookup(&mut handle, txn, &cfg, name)?.is_some() {
                return Err(JextError::Exists);
            }
            let child = self.new_inode(txn, parent, dmode)?;
            let child_lock = self.inode_lock(child);
            let _child_guard = child_lock.lock();
            let mut child_handle = self.dir_handle(txn, child)?;
            jext_dir::init_directory(&mut child_handle, txn, parent)?;
            child_handle.inode.links_count = 2;
            self.store_inode_txn(txn, child, &child_handle.inode)?;

            let inserted =
                jext_dir::insert(&mut handle, txn, &cfg, name, child, FileType::Dir);
            if let Err(err) = inserted {
                if !err.is_damage() {
                    self.scrap_new_dir(txn, child, &mut child_handle.inode)?;
                }
                return Err(err);
            }
            handle.inode.links_count = handle.inode.links_count.saturating_add(1);
            handle.touch(txn)?;
            tracing::debug!(
                target: "jext::core",
                parent = parent.0,
                ino = child.0,
                "mkdir"
            );
            Ok(child)
        })(&mut txn);
        self.finish_write(txn, out)
    }

    /// Undo a directory creation whose parent insert failed: return the
    /// dot block and the inode, all inside the failing transaction.
    fn scrap_new_dir(
        &self,
        txn: &mut Txn<'_>,
        child: InodeNumber,
        record: &mut InodeRecord,
    ) -> Result<()> {
        let root_block = record.block[0];
        record.block[0] = 0;
        record.size = 0;
        record.blocks_512 = 0;
        self.store_inode_txn(txn, child, record)?;
        if root_block != 0 {
            balloc::free_blocks(
                self.allocator(),
                txn,
                Some(child),
                BlockNumber(u64::from(root_block)),
                1,
                false,
            )?;
        }
        self.free_inode(txn, child)
    }

    /// Remove the entry `name` from `parent` and drop one link from the
    /// inode it names. Returns the inode so the caller can evict it once
    /// the last reference goes away.
    ///
    /// An inode reaching zero links is recorded in the orphan table in
    /// the same transaction, before the entry disappears.
    pub fn unlink(&self, parent: InodeNumber, name: &[u8]) -> Result<InodeNumber> {
        self.ensure_writable()?;
        let cfg = self.dir_cfg();
        let lock = self.inode_lock(parent);
        let _guard = lock.lock();
        let mut txn = self.begin(RESERVE_CREDITS + INDEX_EXTRA_CREDITS)?;
        let out = (|txn: &mut Txn<'_>| -> Result<InodeNumber> {
            let mut handle = self.dir_handle(txn, parent)?;
            let entry = jext_dir::lookup(&mut handle, txn, &cfg, name)?
                .ok_or_else(|| JextError::NotFound(String::from_utf8_lossy(name).into_owned()))?;
            let child = InodeNumber(u64::from(entry.inode));
            if !self.geometry().inode_in_range(child) {
                let (table_block, _) = self.inode_position(parent)?;
                return Err(JextError::Corruption {
                    block: table_block.0,
                    detail: format!(
                        "directory {} entry references inode {} outside the volume",
                        parent.0, entry.inode
                    ),
                });
            }
            let child_lock = self.inode_lock(child);
            let _child_guard = child_lock.lock();
            let mut record = self.load_inode_txn(txn, child)?;
            if record.is_dir() {
                return Err(JextError::IsDirectory);
            }
            let orphaned = record.links_count <= 1;
            if orphaned {
                self.orphan_add(txn, child)?;
            }
            if let Err(err) = jext_dir::remove(&mut handle, txn, &cfg, name) {
                if orphaned && !err.is_damage() {
                    self.orphan_del(txn, child)?;
                }
                return Err(err);
            }
            record.links_count = record.links_count.saturating_sub(1);
            record.ctime = unix_now();
            self.store_inode_txn(txn, child, &record)?;
            handle.touch(txn)?;
            tracing::debug!(
                target: "jext::core",
                parent = parent.0,
                ino = child.0,
                links = record.links_count,
                "unlinked"
            );
            Ok(child)
        })(&mut txn);
        self.finish_write(txn, out)
    }

    /// Remove the empty directory `name` under `parent`. Returns the
    /// directory's inode for eviction after commit.
    pub fn rmdir(&self, parent: InodeNumber, name: &[u8]) -> Result<InodeNumber> {
        self.ensure_writable()?;
        let cfg = self.dir_cfg();
        let lock = self.inode_lock(parent);
        let _guard = lock.lock();
        let mut txn = self.begin(RESERVE_CREDITS + INDEX_EXTRA_CREDITS)?;
        let out = (|txn: &mut Txn<'_>| -> Result<InodeNumber> {
            let mut handle = self.dir_handle(txn, parent)?;
            let entry = jext_dir::lookup(&mut handle, txn, &cfg, name)?
                .ok_or_else(|| JextError::NotFound(String::from_utf8_lossy(name).into_owned()))?;
            let child = InodeNumber(u64::from(entry.inode));
            if !self.geometry().inode_in_range(child) {
                let (table_block, _) = self.inode_position(parent)?;
                return Err(JextError::Corruption {
                    block: table_block.0,
                    detail: format!(
                        "directory {} entry references inode {} outside the volume",
                        parent.0, entry.inode
                    ),
                });
            }
            let child_lock = self.inode_lock(child);
            let _child_guard = child_lock.lock();
            let mut child_handle = self.dir_handle(txn, child)?;
            if !jext_dir::is_empty(&mut child_handle, txn)? {
                return Err(JextError::NotEmpty);
            }
            self.orphan_add(txn, child)?;
            if let Err(err) = jext_dir::remove(&mut handle, txn, &cfg, name) {
                if !err.is_damage() {
                    self.orphan_del(txn, child)?;
                }
                return Err(err);
            }
            child_handle.inode.links_count = 0;
            child_handle.inode.ctime = unix_now();
            self.store_inode_txn(txn, child, &child_handle.inode)?;
            handle.inode.links_count = handle.inode.links_count.saturating_sub(1);
            handle.touch(txn)?;
            tracing::debug!(
                target: "jext::core",
                parent = parent.0,
                ino = child.0,
                "rmdir"
            );
            Ok(child)
        })(&mut txn);
        self.finish_write(txn, out)
    }
}
