//! Logical-to-physical block mapping and truncation.
//!
//! Files use the classic direct/indirect pointer scheme: twelve direct
//! slots in the record, then single, double, and triple indirect trees.
//! Mapping with `create` allocates missing tree blocks zero-filled and
//! installs pointers inside the caller's transaction.
//!
//! Truncation frees the tail from the pointers down: the record's size
//! and pointers are cut first, then the no-longer-referenced blocks are
//! returned, so every commit boundary mid-truncate leaves a consistent
//! image. When journal capacity runs out the transaction restarts at a
//! commit boundary and the walk resumes; a crash between boundaries at
//! worst leaks blocks for check to reclaim, never dangles a pointer.

use jext_alloc::block as balloc;
use jext_alloc::{AllocHint, BlockAlloc};
use jext_error::{JextError, Result};
use jext_journal::{AccessKind, ExtendOutcome, Txn, DELETE_CREDITS};
use jext_ondisk::inode::{InodeRecord, DIND_BLOCK, IND_BLOCK, NDIR_BLOCKS, TIND_BLOCK};
use jext_types::{read_le_u32, write_le_u32, BlockNumber, InodeNumber};

use crate::inode::unix_now;
use crate::Filesystem;

/// Credits asked for ahead of each truncate chunk: a bitmap and
/// descriptor per touched group, the record and superblock, and slack
/// for a run straddling a group boundary.
const TRUNCATE_CHUNK_CREDITS: u32 = 8;

/// Pointer path from the record to one logical block.
struct BlockPath {
    /// `slots[0]` indexes `InodeRecord::block`; deeper entries index
    /// indirect blocks.
    slots: [u32; 4],
    depth: usize,
}

#[allow(clippy::cast_possible_truncation)]
fn block_path(apb: u64, logical: u64) -> Result<BlockPath> {
    if logical < NDIR_BLOCKS as u64 {
        return Ok(BlockPath {
            slots: [logical as u32, 0, 0, 0],
            depth: 1,
        });
    }
    let mut rest = logical - NDIR_BLOCKS as u64;
    if rest < apb {
        return Ok(BlockPath {
            slots: [IND_BLOCK as u32, rest as u32, 0, 0],
            depth: 2,
        });
    }
    rest -= apb;
    if rest < apb * apb {
        return Ok(BlockPath {
            slots: [DIND_BLOCK as u32, (rest / apb) as u32, (rest % apb) as u32, 0],
            depth: 3,
        });
    }
    rest -= apb * apb;
    if rest < apb * apb * apb {
        return Ok(BlockPath {
            slots: [
                TIND_BLOCK as u32,
                (rest / (apb * apb)) as u32,
                ((rest / apb) % apb) as u32,
                (rest % apb) as u32,
            ],
            depth: 4,
        });
    }
    Err(JextError::Format(format!(
        "logical block {logical} beyond the largest mappable file"
    )))
}

fn read_pointers(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

impl Filesystem {
    /// Map `logical` to a device block, allocating the path when
    /// `create` is set. Returns `None` for holes on read mappings.
    ///
    /// Newly allocated data blocks are not initialized; the caller owns
    /// their first write. Tree blocks are installed zero-filled through
    /// the journal.
    pub fn get_block(
        &self,
        txn: &mut Txn<'_>,
        ino: InodeNumber,
        logical: u64,
        create: bool,
    ) -> Result<Option<BlockNumber>> {
        if create {
            self.ensure_writable()?;
        } else {
            self.ensure_ok()?;
        }
        let lock = self.inode_lock(ino);
        let _guard = lock.lock();
        let mut record = self.load_inode_txn(txn, ino)?;
        self.map_block_locked(txn, ino, &mut record, logical, create)
    }

    /// Mapping walk under an already-held inode lock.
    pub(crate) fn map_block_locked(
        &self,
        txn: &mut Txn<'_>,
        ino: InodeNumber,
        record: &mut InodeRecord,
        logical: u64,
        create: bool,
    ) -> Result<Option<BlockNumber>> {
        let geo = self.allocator().geometry();
        let apb = u64::from(geo.addresses_per_block());
        let path = block_path(apb, logical)?;
        let mut allocated = false;

        let root_idx = path.slots[0] as usize;
        let mut cur = record.block[root_idx];
        if cur == 0 {
            if !create {
                return Ok(None);
            }
            let leaf = path.depth == 1;
            cur = self.allocate_tree_block(txn, ino, record, logical, !leaf)?;
            record.block[root_idx] = cur;
            allocated = true;
        }

        for level in 1..path.depth {
            let parent = BlockNumber(u64::from(cur));
            let idx = path.slots[level] as usize;
            let buf = txn.read(parent)?;
            let mut next =
                read_le_u32(buf.as_slice(), idx * 4).map_err(|err| JextError::Corruption {
                    block: parent.0,
                    detail: format!("indirect block: {err}"),
                })?;
            if next == 0 {
                if !create {
                    return Ok(None);
                }
                let leaf = level == path.depth - 1;
                next = self.allocate_tree_block(txn, ino, record, logical, !leaf)?;
                txn.declare(parent, AccessKind::Write)?;
                let mut bytes = buf.to_vec();
                write_le_u32(&mut bytes, idx * 4, next).map_err(|err| JextError::Corruption {
                    block: parent.0,
                    detail: format!("indirect block: {err}"),
                })?;
                txn.dirty(parent, &bytes)?;
                allocated = true;
            }
            cur = next;
        }

        if allocated {
            self.store_inode_txn(txn, ino, record)?;
            self.write_superblock(txn)?;
        }
        Ok(Some(BlockNumber(u64::from(cur))))
    }

    /// One goal-directed block for the mapping tree, zero-initialized
    /// when it will hold pointers.
    fn allocate_tree_block(
        &self,
        txn: &mut Txn<'_>,
        ino: InodeNumber,
        record: &mut InodeRecord,
        logical: u64,
        init_zeroed: bool,
    ) -> Result<u32> {
        let hint = self.alloc_hint(ino, logical);
        let got = balloc::allocate_blocks(self.allocator(), txn, ino, &hint, 1)?;
        if init_zeroed {
            txn.declare(got.start, AccessKind::Create)?;
            txn.dirty(got.start, &vec![0_u8; self.block_size() as usize])?;
        }
        record.blocks_512 = record.blocks_512.saturating_add(self.sectors_per_block());
        got.start.to_u32().map_err(|err| JextError::Corruption {
            block: got.start.0,
            detail: format!("allocated block: {err}"),
        })
    }

    /// Sequential writes continue right after the previous allocation;
    /// anything else starts from the inode's own group.
    fn alloc_hint(&self, ino: InodeNumber, logical: u64) -> AllocHint {
        let goal_block = self
            .allocator()
            .reservations()
            .last_alloc(ino)
            .and_then(|(last_logical, last_physical)| {
                (logical == last_logical + 1).then(|| BlockNumber(last_physical + 1))
            });
        AllocHint {
            goal_group: Some(self.allocator().geometry().inode_group(ino)),
            goal_block,
            logical,
        }
    }

    pub(crate) fn sectors_per_block(&self) -> u32 {
        self.block_size() / 512
    }

    // ── Raw block allocation ────────────────────────────────────────────

    /// Allocate up to `count` contiguous blocks for `ino`, steered by
    /// `hint`. Mapping callers go through [`get_block`](Self::get_block);
    /// this is the surface for glue code that keeps its own pointers.
    /// The superblock counter shadows travel in the same transaction.
    pub fn new_blocks(
        &self,
        txn: &mut Txn<'_>,
        ino: InodeNumber,
        hint: &AllocHint,
        count: u32,
    ) -> Result<BlockAlloc> {
        self.ensure_writable()?;
        let got = balloc::allocate_blocks(self.allocator(), txn, ino, hint, count)?;
        self.write_superblock(txn)?;
        Ok(got)
    }

    /// Return `count` blocks starting at `start` to the free pool.
    /// `metadata` marks blocks that held pointer or index structures so
    /// stale journal records are revoked before reuse.
    pub fn free_blocks(
        &self,
        txn: &mut Txn<'_>,
        ino: Option<InodeNumber>,
        start: BlockNumber,
        count: u32,
        metadata: bool,
    ) -> Result<()> {
        self.ensure_writable()?;
        balloc::free_blocks(self.allocator(), txn, ino, start, count, metadata)?;
        self.write_superblock(txn)
    }

    // ── Truncate ────────────────────────────────────────────────────────

    /// Set `ino`'s size to `new_size`, freeing any blocks past it.
    ///
    /// Growing only moves the size; the new range reads as a hole.
    /// Directories cannot be truncated through this entry point.
    pub fn truncate(&self, ino: InodeNumber, new_size: u64) -> Result<()> {
        self.ensure_writable()?;
        let lock = self.inode_lock(ino);
        let _guard = lock.lock();
        let mut txn = self.begin(DELETE_CREDITS)?;
        let outcome = (|| -> Result<()> {
            let mut record = self.load_inode_txn(&mut txn, ino)?;
            if record.is_dir() {
                return Err(JextError::IsDirectory);
            }
            if new_size >= record.size {
                if new_size > record.size {
                    record.size = new_size;
                    let now = unix_now();
                    record.mtime = now;
                    record.ctime = now;
                    self.store_inode_txn(&mut txn, ino, &record)?;
                }
                return Ok(());
            }
            self.shrink_blocks(&mut txn, ino, &mut record, new_size)
        })();
        match outcome {
            Ok(()) => txn.stop(),
            Err(err) if err.is_damage() => return self.fail_txn(txn, err),
            Err(err) => {
                txn.stop()?;
                return Err(err);
            }
        }
    }

    /// Free every block backing `ino` past `new_size` and update the
    /// record. Pointers are cut before their blocks are freed, and the
    /// record is re-stored at every commit boundary, so the walk can
    /// resume after a crash.
    pub(crate) fn shrink_blocks(
        &self,
        txn: &mut Txn<'_>,
        ino: InodeNumber,
        record: &mut InodeRecord,
        new_size: u64,
    ) -> Result<()> {
        let geo = self.allocator().geometry();
        let bs = u64::from(geo.block_size.get());
        let apb = u64::from(geo.addresses_per_block());
        let keep = new_size.div_ceil(bs);

        // Cutting the tail ends the sequential stream; the window and
        // pattern state go with it.
        self.allocator().reservations().discard(ino);

        record.size = new_size;
        let now = unix_now();
        record.mtime = now;
        record.ctime = now;
        self.store_inode_txn(txn, ino, record)?;

        if keep < NDIR_BLOCKS as u64 {
            #[allow(clippy::cast_possible_truncation)]
            let from = keep as usize;
            let mut doomed = Vec::new();
            for slot in from..NDIR_BLOCKS {
                let block = record.block[slot];
                if block != 0 {
                    doomed.push(block);
                    record.block[slot] = 0;
                }
            }
            if !doomed.is_empty() {
                self.store_inode_txn(txn, ino, record)?;
                self.free_block_list(txn, ino, record, &doomed)?;
            }
        }

        let levels = [
            (IND_BLOCK, 1_u32, NDIR_BLOCKS as u64, apb),
            (DIND_BLOCK, 2, NDIR_BLOCKS as u64 + apb, apb * apb),
            (
                TIND_BLOCK,
                3,
                NDIR_BLOCKS as u64 + apb + apb * apb,
                apb * apb * apb,
            ),
        ];
        for (slot, depth, base, span) in levels {
            let root = record.block[slot];
            if root == 0 {
                continue;
            }
            let keep_here = keep.saturating_sub(base).min(span);
            if keep_here == 0 {
                record.block[slot] = 0;
                self.store_inode_txn(txn, ino, record)?;
                self.free_tree(txn, ino, record, root, depth)?;
            } else if keep_here < span {
                self.shrink_tree(txn, ino, record, root, depth, keep_here)?;
            }
        }

        self.store_inode_txn(txn, ino, record)?;
        self.write_superblock(txn)?;
        tracing::debug!(
            target: "jext::core",
            ino = ino.0,
            size = new_size,
            "truncated"
        );
        Ok(())
    }

    /// Free a whole pointer tree, children before the tree block itself.
    fn free_tree(
        &self,
        txn: &mut Txn<'_>,
        ino: InodeNumber,
        record: &mut InodeRecord,
        root: u32,
        depth: u32,
    ) -> Result<()> {
        let root_block = BlockNumber(u64::from(root));
        let pointers = read_pointers(txn.read(root_block)?.as_slice());
        if depth == 1 {
            let live: Vec<u32> = pointers.into_iter().filter(|b| *b != 0).collect();
            self.free_block_list(txn, ino, record, &live)?;
        } else {
            for child in pointers.into_iter().filter(|b| *b != 0) {
                self.free_tree(txn, ino, record, child, depth - 1)?;
            }
        }
        self.chunk_credits(txn, ino, record)?;
        balloc::free_blocks(self.allocator(), txn, Some(ino), root_block, 1, true)?;
        record.blocks_512 = record.blocks_512.saturating_sub(self.sectors_per_block());
        Ok(())
    }

    /// Free the tail of a tree that keeps `keep` leading data blocks.
    fn shrink_tree(
        &self,
        txn: &mut Txn<'_>,
        ino: InodeNumber,
        record: &mut InodeRecord,
        root: u32,
        depth: u32,
        keep: u64,
    ) -> Result<()> {
        let geo = self.allocator().geometry();
        let apb = u64::from(geo.addresses_per_block());
        let child_span = apb.pow(depth - 1);
        let root_block = BlockNumber(u64::from(root));
        let mut bytes = txn.read(root_block)?.to_vec();
        let pointers = read_pointers(&bytes);

        #[allow(clippy::cast_possible_truncation)]
        let boundary = (keep / child_span) as usize;
        let partial = keep % child_span;
        let doom_from = if partial == 0 { boundary } else { boundary + 1 };

        let doomed: Vec<u32> = pointers
            .iter()
            .skip(doom_from)
            .copied()
            .filter(|b| *b != 0)
            .collect();
        if !doomed.is_empty() {
            for slot in doom_from..pointers.len() {
                write_le_u32(&mut bytes, slot * 4, 0).map_err(|err| JextError::Corruption {
                    block: root_block.0,
                    detail: format!("indirect block: {err}"),
                })?;
            }
            self.chunk_credits(txn, ino, record)?;
            txn.declare(root_block, AccessKind::Write)?;
            txn.dirty(root_block, &bytes)?;
            if depth == 1 {
                self.free_block_list(txn, ino, record, &doomed)?;
            } else {
                for child in doomed {
                    self.free_tree(txn, ino, record, child, depth - 1)?;
                }
            }
        }

        if partial > 0 {
            if let Some(&child) = pointers.get(boundary) {
                if child != 0 {
                    self.shrink_tree(txn, ino, record, child, depth - 1, partial)?;
                }
            }
        }
        Ok(())
    }

    /// Free data blocks, coalescing numerically adjacent runs.
    fn free_block_list(
        &self,
        txn: &mut Txn<'_>,
        ino: InodeNumber,
        record: &mut InodeRecord,
        blocks: &[u32],
    ) -> Result<()> {
        let spb = self.sectors_per_block();
        let mut i = 0;
        while i < blocks.len() {
            let start = blocks[i];
            let mut len = 1_u32;
            while i + len as usize != blocks.len() && blocks[i + len as usize] == start + len {
                len += 1;
            }
            self.chunk_credits(txn, ino, record)?;
            balloc::free_blocks(
                self.allocator(),
                txn,
                Some(ino),
                BlockNumber(u64::from(start)),
                len,
                false,
            )?;
            record.blocks_512 = record.blocks_512.saturating_sub(len.saturating_mul(spb));
            i += len as usize;
        }
        Ok(())
    }

    /// Make room for the next truncate chunk, cutting a commit boundary
    /// when the journal cannot grow the reservation. The record and
    /// counters are persisted before the boundary so the committed image
    /// stands on its own.
    fn chunk_credits(
        &self,
        txn: &mut Txn<'_>,
        ino: InodeNumber,
        record: &mut InodeRecord,
    ) -> Result<()> {
        match txn.extend(TRUNCATE_CHUNK_CREDITS)? {
            ExtendOutcome::Extended => Ok(()),
            ExtendOutcome::NeedsRestart => {
                self.store_inode_txn(txn, ino, record)?;
                self.write_superblock(txn)?;
                txn.restart(DELETE_CREDITS)?;
                tracing::debug!(target: "jext::core", ino = ino.0, "truncate_commit_boundary");
                Ok(())
            }
        }
    }
}
