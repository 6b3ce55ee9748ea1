//! Inode records and their lifecycle.
//!
//! Records live packed in per-group inode tables; all reads and writes
//! go through the journal so a transaction sees its own buffered
//! updates. Orphan handling follows the crash contract: an inode whose
//! last link goes away while still open is listed in the orphan table
//! within the same transaction as the unlink, and the listing is removed
//! in the same transaction as the final release.

use std::sync::atomic::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use jext_alloc::inode as ialloc;
use jext_error::{JextError, Result};
use jext_journal::{orphan, AccessKind, Txn, DELETE_CREDITS, SINGLEDATA_CREDITS};
use jext_ondisk::inode::InodeRecord;
use jext_ondisk::orphan::OrphanTable;
use jext_ondisk::superblock::STATE_ORPHAN_PENDING;
use jext_types::{BlockNumber, Generation, InodeNumber, S_IFDIR, S_IFMT};

use crate::Filesystem;

/// Seconds since the epoch, clamped to the on-disk 32-bit fields.
pub(crate) fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
}

impl Filesystem {
    /// Table block and byte offset holding `ino`'s record.
    pub(crate) fn inode_position(&self, ino: InodeNumber) -> Result<(BlockNumber, usize)> {
        let geo = self.allocator().geometry();
        if !geo.inode_in_range(ino) {
            return Err(JextError::NotFound(format!("inode {ino}")));
        }
        let group = geo.inode_group(ino);
        let index = geo.inode_index_in_group(ino);
        let table = self.allocator().slot(group)?.snapshot().inode_table;
        let byte = u64::from(index) * u64::from(geo.inode_size);
        let bs = u64::from(geo.block_size.get());
        #[allow(clippy::cast_possible_truncation)]
        let offset = (byte % bs) as usize;
        Ok((BlockNumber(table.0 + byte / bs), offset))
    }

    /// Read `ino`'s record through the journal's view.
    pub fn read_inode(&self, ino: InodeNumber) -> Result<InodeRecord> {
        self.ensure_ok()?;
        let (block, offset) = self.inode_position(ino)?;
        let buf = self.journal().read_block(block)?;
        decode_inode(buf.as_slice(), offset, block, ino)
    }

    pub(crate) fn load_inode_txn(&self, txn: &mut Txn<'_>, ino: InodeNumber) -> Result<InodeRecord> {
        let (block, offset) = self.inode_position(ino)?;
        let buf = txn.read(block)?;
        decode_inode(buf.as_slice(), offset, block, ino)
    }

    pub(crate) fn store_inode_txn(
        &self,
        txn: &mut Txn<'_>,
        ino: InodeNumber,
        record: &InodeRecord,
    ) -> Result<()> {
        let (block, offset) = self.inode_position(ino)?;
        let isize = self.allocator().geometry().inode_size as usize;
        txn.declare(block, AccessKind::Write)?;
        let mut bytes = txn.read(block)?.to_vec();
        record
            .encode_into(&mut bytes[offset..offset + isize])
            .map_err(|err| JextError::Corruption {
                block: block.0,
                detail: format!("inode {ino} encode: {err}"),
            })?;
        txn.dirty(block, &bytes)
    }

    /// Allocate an inode near `parent` and write its initial record.
    ///
    /// The record starts with one link; directory callers bump it for
    /// the extra "." reference themselves.
    pub fn new_inode(
        &self,
        txn: &mut Txn<'_>,
        parent: InodeNumber,
        mode: u16,
    ) -> Result<InodeNumber> {
        self.ensure_writable()?;
        if mode & S_IFMT == 0 {
            return Err(JextError::Format(format!(
                "mode {mode:#o} carries no file type"
            )));
        }
        let geo = self.allocator().geometry();
        let parent_group = geo.inode_group(parent);
        let is_directory = mode & S_IFMT == S_IFDIR;
        let got = ialloc::allocate_inode(self.allocator(), txn, parent_group, is_directory)?;

        let mut record = InodeRecord::new(mode);
        record.links_count = 1;
        let now = unix_now();
        record.atime = now;
        record.ctime = now;
        record.mtime = now;
        record.generation = Generation(self.next_generation.fetch_add(1, Ordering::Relaxed));
        self.store_inode_txn(txn, got.ino, &record)?;
        self.write_superblock(txn)?;
        tracing::debug!(
            target: "jext::core",
            ino = got.ino.0,
            group = got.group.0,
            mode = format_args!("{mode:#o}"),
            "inode_created"
        );
        Ok(got.ino)
    }

    /// Release `ino`'s slot in the inode bitmap and stamp its record
    /// deleted. The caller must already have freed the inode's blocks.
    pub fn free_inode(&self, txn: &mut Txn<'_>, ino: InodeNumber) -> Result<()> {
        self.ensure_writable()?;
        let mut record = self.load_inode_txn(txn, ino)?;
        let was_directory = record.is_dir();
        record.links_count = 0;
        record.dtime = unix_now();
        self.store_inode_txn(txn, ino, &record)?;
        ialloc::free_inode(self.allocator(), txn, ino, was_directory)?;
        self.write_superblock(txn)?;
        tracing::debug!(target: "jext::core", ino = ino.0, "inode_freed");
        Ok(())
    }

    // ── Orphan list ─────────────────────────────────────────────────────

    /// List `ino` in the orphan table and raise the recovery-pending
    /// state bit, all inside `txn`.
    pub fn orphan_add(&self, txn: &mut Txn<'_>, ino: InodeNumber) -> Result<()> {
        self.ensure_writable()?;
        let table = self.require_orphan_table()?;
        orphan::orphan_add(txn, table, ino)?;
        let raised = {
            let mut sb = self.sb.lock();
            if sb.state & STATE_ORPHAN_PENDING == 0 {
                sb.state |= STATE_ORPHAN_PENDING;
                true
            } else {
                false
            }
        };
        if raised {
            self.write_superblock(txn)?;
        }
        Ok(())
    }

    /// Drop `ino` from the orphan table; clears the pending bit when the
    /// table empties. Absent entries are a no-op.
    pub fn orphan_del(&self, txn: &mut Txn<'_>, ino: InodeNumber) -> Result<()> {
        self.ensure_writable()?;
        let table = self.require_orphan_table()?;
        orphan::orphan_remove(txn, table, ino)?;
        let buf = txn.read(table)?;
        let parsed =
            OrphanTable::parse_from_block(buf.as_slice()).map_err(|err| JextError::Corruption {
                block: table.0,
                detail: format!("orphan table: {err}"),
            })?;
        if parsed.is_empty() {
            let lowered = {
                let mut sb = self.sb.lock();
                if sb.state & STATE_ORPHAN_PENDING == 0 {
                    false
                } else {
                    sb.state &= !STATE_ORPHAN_PENDING;
                    true
                }
            };
            if lowered {
                self.write_superblock(txn)?;
            }
        }
        Ok(())
    }

    fn require_orphan_table(&self) -> Result<BlockNumber> {
        self.orphan_table()
            .ok_or_else(|| JextError::Format("volume has no orphan table".into()))
    }

    // ── Release and recovery ────────────────────────────────────────────

    /// Final release of an unreferenced inode: free all its blocks, stamp
    /// the record deleted, return the slot, and drop any orphan listing.
    ///
    /// Returns `false` when the inode is still linked and nothing was
    /// done.
    pub fn evict_inode(&self, ino: InodeNumber) -> Result<bool> {
        self.ensure_writable()?;
        let lock = self.inode_lock(ino);
        let _guard = lock.lock();
        let mut txn = self.begin(DELETE_CREDITS)?;
        let mut reaped = false;
        let outcome = (|| -> Result<()> {
            let mut record = self.load_inode_txn(&mut txn, ino)?;
            if record.links_count > 0 {
                return Ok(());
            }
            self.release_inode(&mut txn, ino, &mut record)?;
            if self.orphan_table().is_some() {
                self.orphan_del(&mut txn, ino)?;
            }
            reaped = true;
            Ok(())
        })();
        match outcome {
            Ok(()) => {
                txn.stop()?;
                Ok(reaped)
            }
            Err(err) if err.is_damage() => self.fail_txn(txn, err),
            Err(err) => {
                txn.stop()?;
                Err(err)
            }
        }
    }

    /// Truncate to zero, stamp deleted, and free the inode slot.
    pub(crate) fn release_inode(
        &self,
        txn: &mut Txn<'_>,
        ino: InodeNumber,
        record: &mut InodeRecord,
    ) -> Result<()> {
        self.shrink_blocks(txn, ino, record, 0)?;
        let was_directory = record.is_dir();
        record.dtime = unix_now();
        self.store_inode_txn(txn, ino, record)?;
        ialloc::free_inode(self.allocator(), txn, ino, was_directory)?;
        self.write_superblock(txn)?;
        tracing::debug!(target: "jext::core", ino = ino.0, "inode_released");
        Ok(())
    }

    /// Reap every inode listed in the orphan table, then empty the table
    /// and clear the pending state bit.
    ///
    /// Runs at mount before any other mutation is accepted. Entries that
    /// cannot be reaped (out of range, still linked, unreadable) are
    /// logged and skipped; each successful reap commits on its own so a
    /// crash mid-recovery only redoes the remainder.
    pub fn orphan_recover_all(&self) -> Result<u32> {
        self.ensure_writable()?;
        let Some(table_block) = self.orphan_table() else {
            return Ok(0);
        };
        let table = orphan::load_table(self.journal(), table_block)?;
        let mut recovered = 0_u32;
        for ino in table.inodes {
            match self.reap_orphan(ino) {
                Ok(true) => recovered += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(
                        target: "jext::core",
                        ino = ino.0,
                        error = %err,
                        "orphan reap failed, skipping"
                    );
                }
            }
        }

        let mut txn = self.begin(SINGLEDATA_CREDITS)?;
        let finish = orphan::init_table(&mut txn, table_block).and_then(|()| {
            {
                let mut sb = self.sb.lock();
                sb.state &= !STATE_ORPHAN_PENDING;
            }
            self.write_superblock(&mut txn)
        });
        match finish {
            Ok(()) => txn.stop()?,
            Err(err) => return self.fail_txn(txn, err),
        }
        self.journal().force_commit()?;
        Ok(recovered)
    }

    /// Resume the release of one listed orphan. Commits on success.
    fn reap_orphan(&self, ino: InodeNumber) -> Result<bool> {
        let geo = self.allocator().geometry();
        if !geo.inode_in_range(ino) || ino.0 < InodeNumber::FIRST_USER.0 {
            tracing::warn!(target: "jext::core", ino = ino.0, "orphan entry out of range, skipping");
            return Ok(false);
        }
        let lock = self.inode_lock(ino);
        let _guard = lock.lock();
        let mut txn = self.begin(DELETE_CREDITS)?;
        let mut skipped = false;
        let outcome = (|| -> Result<()> {
            let mut record = self.load_inode_txn(&mut txn, ino)?;
            if record.links_count > 0 {
                tracing::warn!(
                    target: "jext::core",
                    ino = ino.0,
                    links = record.links_count,
                    "orphan entry still linked, skipping"
                );
                skipped = true;
                return Ok(());
            }
            self.release_inode(&mut txn, ino, &mut record)
        })();
        match outcome {
            Ok(()) => {
                txn.stop()?;
                self.journal().force_commit()?;
                if !skipped {
                    tracing::info!(target: "jext::core", ino = ino.0, "orphan_recovered");
                }
                Ok(!skipped)
            }
            Err(err) => {
                if let Err(abort_err) = txn.abort() {
                    tracing::warn!(target: "jext::core", error = %abort_err, "abort failed");
                }
                Err(err)
            }
        }
    }
}

fn decode_inode(
    bytes: &[u8],
    offset: usize,
    block: BlockNumber,
    ino: InodeNumber,
) -> Result<InodeRecord> {
    let end = offset + jext_ondisk::inode::INODE_BASE_SIZE;
    if bytes.len() < end {
        return Err(JextError::Corruption {
            block: block.0,
            detail: format!("inode {ino} record extends past the table block"),
        });
    }
    InodeRecord::parse_from_bytes(&bytes[offset..]).map_err(|err| JextError::Corruption {
        block: block.0,
        detail: format!("inode {ino}: {err}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::rig;
    use jext_journal::{JournalEngine, RESERVE_CREDITS};
    use jext_types::{S_IFDIR, S_IFREG};

    #[test]
    fn new_inode_round_trips_through_the_table() {
        let r = rig(1024);
        let mut txn = r.fs.begin(RESERVE_CREDITS).expect("begin");
        let ino = r
            .fs
            .new_inode(&mut txn, InodeNumber::ROOT, S_IFREG | 0o644)
            .expect("new inode");
        txn.stop().expect("stop");

        let record = r.fs.read_inode(ino).expect("read");
        assert_eq!(record.links_count, 1);
        assert!(record.is_regular());
        assert!(ino.0 >= InodeNumber::FIRST_USER.0);
    }

    #[test]
    fn new_inode_rejects_typeless_mode() {
        let r = rig(1024);
        let mut txn = r.fs.begin(RESERVE_CREDITS).expect("begin");
        let err = r.fs.new_inode(&mut txn, InodeNumber::ROOT, 0o644).unwrap_err();
        assert!(matches!(err, JextError::Format(_)));
        txn.stop().expect("stop");
    }

    #[test]
    fn free_inode_returns_the_slot() {
        let r = rig(1024);
        let before = r.fs.free_inode_count();
        let mut txn = r.fs.begin(RESERVE_CREDITS).expect("begin");
        let ino = r
            .fs
            .new_inode(&mut txn, InodeNumber::ROOT, S_IFREG | 0o644)
            .expect("new inode");
        txn.stop().expect("stop");
        assert_eq!(r.fs.free_inode_count(), before - 1);

        let mut txn = r.fs.begin(RESERVE_CREDITS).expect("begin");
        r.fs.free_inode(&mut txn, ino).expect("free inode");
        txn.stop().expect("stop");
        assert_eq!(r.fs.free_inode_count(), before);

        let record = r.fs.read_inode(ino).expect("read");
        assert_eq!(record.links_count, 0);
        assert_ne!(record.dtime, 0);
    }

    #[test]
    fn orphan_add_raises_pending_and_del_clears_it() {
        let r = rig(1024);
        let mut txn = r.fs.begin(RESERVE_CREDITS).expect("begin");
        let ino = r
            .fs
            .new_inode(&mut txn, InodeNumber::ROOT, S_IFREG | 0o644)
            .expect("new inode");
        r.fs.orphan_add(&mut txn, ino).expect("orphan add");
        txn.stop().expect("stop");
        assert_ne!(r.fs.superblock().state & STATE_ORPHAN_PENDING, 0);

        let mut txn = r.fs.begin(RESERVE_CREDITS).expect("begin");
        r.fs.orphan_del(&mut txn, ino).expect("orphan del");
        txn.stop().expect("stop");
        assert_eq!(r.fs.superblock().state & STATE_ORPHAN_PENDING, 0);
    }

    #[test]
    fn evict_skips_linked_inodes() {
        let r = rig(1024);
        let mut txn = r.fs.begin(RESERVE_CREDITS).expect("begin");
        let ino = r
            .fs
            .new_inode(&mut txn, InodeNumber::ROOT, S_IFREG | 0o644)
            .expect("new inode");
        txn.stop().expect("stop");

        assert!(!r.fs.evict_inode(ino).expect("evict"));
        assert_eq!(r.fs.read_inode(ino).expect("read").links_count, 1);
    }

    #[test]
    fn evict_releases_an_unlinked_inode() {
        let r = rig(1024);
        let free_inodes = r.fs.free_inode_count();
        let free_blocks = r.fs.free_block_count();

        let mut txn = r.fs.begin(RESERVE_CREDITS).expect("begin");
        let ino = r
            .fs
            .new_inode(&mut txn, InodeNumber::ROOT, S_IFREG | 0o644)
            .expect("new inode");
        txn.stop().expect("stop");

        let mut txn = r.fs.begin(RESERVE_CREDITS).expect("begin");
        r.fs.get_block(&mut txn, ino, 0, true).expect("map").expect("mapped");
        r.fs.get_block(&mut txn, ino, 1, true).expect("map").expect("mapped");
        txn.stop().expect("stop");

        let mut txn = r.fs.begin(RESERVE_CREDITS).expect("begin");
        let mut record = r.fs.load_inode_txn(&mut txn, ino).expect("load");
        record.links_count = 0;
        r.fs.store_inode_txn(&mut txn, ino, &record).expect("store");
        r.fs.orphan_add(&mut txn, ino).expect("orphan add");
        txn.stop().expect("stop");

        assert!(r.fs.evict_inode(ino).expect("evict"));
        r.journal.force_commit().expect("commit");
        assert_eq!(r.fs.free_inode_count(), free_inodes);
        assert_eq!(r.fs.free_block_count(), free_blocks);
        assert_eq!(r.fs.superblock().state & STATE_ORPHAN_PENDING, 0);
        r.fs.verify_counters().expect("counters");
    }

    #[test]
    fn directory_mode_spreads_into_any_group() {
        let r = rig(1024);
        let mut txn = r.fs.begin(RESERVE_CREDITS).expect("begin");
        let ino = r
            .fs
            .new_inode(&mut txn, InodeNumber::ROOT, S_IFDIR | 0o755)
            .expect("new inode");
        txn.stop().expect("stop");
        assert!(r.fs.read_inode(ino).expect("read").is_dir());
    }
}
