#![forbid(unsafe_code)]
//! Journal transaction protocol: the engine interface metadata code talks
//! to, plus the handle state machine that keeps callers honest.
//!
//! The engine batches handles into a running compound transaction and
//! commits the batch atomically. Everything a caller mutates must follow
//! the declare-then-dirty protocol:
//!
//! `Started → (N × {AccessDeclared → Dirtied}) → Stopped | Aborted`
//!
//! [`Txn`] enforces that order and aborts on drop, so an error path that
//! unwinds early never leaves half-declared mutations behind. The
//! in-memory reference engine lives in [`mem`]; orphan table maintenance
//! (which rides inside the same transactions) lives in [`orphan`].

pub mod mem;
pub mod orphan;

use jext_block::BlockBuf;
use jext_error::{JextError, Result};
use jext_types::{BlockNumber, CommitSeq, TxnId};
use std::collections::HashSet;

pub use mem::MemJournal;

// ── Credit sizing ───────────────────────────────────────────────────────────
//
// A credit is one metadata block a transaction may dirty. Callers reserve
// a worst case up front and extend (or restart) when a long operation
// outgrows it.

/// One block-mapping update: bitmap, group descriptor, superblock,
/// indirect chain, and the inode itself.
pub const SINGLEDATA_CREDITS: u32 = 8;
/// A mapping update plus directory modification headroom.
pub const RESERVE_CREDITS: u32 = 12;
/// Worst-case truncate/delete step before a restart is forced.
pub const DELETE_CREDITS: u32 = 64;
/// Extra headroom when the directory is hash-indexed (root, interior
/// node, and both split leaves).
pub const INDEX_EXTRA_CREDITS: u32 = 8;

// ── Protocol types ──────────────────────────────────────────────────────────

/// Declared intent for a metadata buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    /// Buffer will only be inspected.
    Read,
    /// Buffer will be mutated in place.
    Write,
    /// Freshly allocated buffer with no meaningful prior contents.
    Create,
}

/// Outcome of asking for more credits on an open handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendOutcome {
    /// The handle now owns the additional credits.
    Extended,
    /// No room in the running transaction; the caller must restart the
    /// handle at a commit boundary and re-validate its state.
    NeedsRestart,
}

/// An open transaction handle. Obtained from [`JournalEngine::start`] and
/// consumed by `stop` or `abort`; the [`Txn`] wrapper manages this
/// automatically.
#[derive(Debug, PartialEq, Eq)]
pub struct TxnHandle {
    id: TxnId,
}

impl TxnHandle {
    #[must_use]
    pub fn new(id: TxnId) -> Self {
        Self { id }
    }

    #[must_use]
    pub fn id(&self) -> TxnId {
        self.id
    }
}

// ── Engine interface ────────────────────────────────────────────────────────

/// The journaling engine as seen by allocator and directory code.
///
/// Implementations guarantee: everything dirtied through a handle becomes
/// durable atomically when the enclosing compound transaction commits,
/// and none of it survives a crash before that commit.
pub trait JournalEngine: Send + Sync {
    /// Open a handle reserving `credits` metadata blocks. Fails with
    /// [`JextError::Busy`] when the journal cannot admit the reservation
    /// yet; callers retry within their bounded retry budget.
    fn start(&self, credits: u32) -> Result<TxnHandle>;

    /// Ask for `additional` credits on an open handle.
    fn extend(&self, handle: &TxnHandle, additional: u32) -> Result<ExtendOutcome>;

    /// Detach `handle` at a commit boundary and reopen it with a fresh
    /// reservation of `credits`. Buffered state from the old handle is
    /// committed; the caller must re-read any metadata it still needs.
    fn restart(&self, handle: &mut TxnHandle, credits: u32) -> Result<()>;

    /// Close the handle. Its changes commit with the batch.
    fn stop(&self, handle: TxnHandle) -> Result<()>;

    /// Abandon the running compound transaction. All buffered changes
    /// are discarded; other open handles in the batch fail from here on.
    fn abort(&self, handle: TxnHandle) -> Result<()>;

    /// Declare intent to touch `block`.
    fn declare_access(&self, handle: &TxnHandle, block: BlockNumber, kind: AccessKind)
    -> Result<()>;

    /// Record the new contents of a block. One credit per distinct block.
    fn mark_dirty(&self, handle: &TxnHandle, block: BlockNumber, data: &[u8]) -> Result<()>;

    /// Invalidate a freed metadata block so stale journal records are
    /// never replayed over it. Drops any buffered write to the block.
    fn revoke(&self, handle: &TxnHandle, block: BlockNumber) -> Result<()>;

    /// Mark a freed block range as unreusable until the batch commits.
    fn pending_free(&self, handle: &TxnHandle, start: BlockNumber, count: u32) -> Result<()>;

    /// Snapshot of all blocks freed by the running transaction. The
    /// allocator masks these out of its search space.
    fn pending_free_snapshot(&self) -> Vec<u64>;

    /// Read a block through the journal's view: buffered uncommitted
    /// contents when present, committed contents otherwise.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Commit the running batch. All handles must be closed.
    fn force_commit(&self) -> Result<CommitSeq>;
}

// ── Handle wrapper ──────────────────────────────────────────────────────────

/// A transaction handle with the declare-then-dirty protocol enforced.
///
/// Dropping a `Txn` that was neither stopped nor aborted aborts it, so
/// `?`-style unwinding discards provisional state instead of leaking an
/// open handle.
pub struct Txn<'j> {
    engine: &'j dyn JournalEngine,
    handle: Option<TxnHandle>,
    writable: HashSet<u64>,
}

impl std::fmt::Debug for Txn<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Txn")
            .field("handle", &self.handle)
            .field("writable_blocks", &self.writable.len())
            .finish_non_exhaustive()
    }
}

impl<'j> Txn<'j> {
    /// Open a handle with `credits` reserved.
    pub fn start(engine: &'j dyn JournalEngine, credits: u32) -> Result<Self> {
        let handle = engine.start(credits)?;
        tracing::trace!(
            target: "jext::journal",
            txn_id = handle.id().0,
            credits,
            "txn_start"
        );
        Ok(Self {
            engine,
            handle: Some(handle),
            writable: HashSet::new(),
        })
    }

    fn handle(&self) -> Result<&TxnHandle> {
        self.handle.as_ref().ok_or(JextError::Journal {
            detail: "transaction handle already closed".to_owned(),
        })
    }

    #[must_use]
    pub fn id(&self) -> Option<TxnId> {
        self.handle.as_ref().map(TxnHandle::id)
    }

    /// Declare access to a block before touching it.
    pub fn declare(&mut self, block: BlockNumber, kind: AccessKind) -> Result<()> {
        let handle = self.handle.as_ref().ok_or(JextError::Journal {
            detail: "transaction handle already closed".to_owned(),
        })?;
        self.engine.declare_access(handle, block, kind)?;
        if matches!(kind, AccessKind::Write | AccessKind::Create) {
            self.writable.insert(block.0);
        }
        Ok(())
    }

    /// Record a block's new contents. The block must have been declared
    /// with write or create intent first.
    pub fn dirty(&mut self, block: BlockNumber, data: &[u8]) -> Result<()> {
        if !self.writable.contains(&block.0) {
            return Err(JextError::Journal {
                detail: format!("block {} dirtied without a write-access declaration", block.0),
            });
        }
        let handle = self.handle.as_ref().ok_or(JextError::Journal {
            detail: "transaction handle already closed".to_owned(),
        })?;
        self.engine.mark_dirty(handle, block, data)
    }

    /// Read a block through the journal's view.
    pub fn read(&self, block: BlockNumber) -> Result<BlockBuf> {
        self.handle()?;
        self.engine.read_block(block)
    }

    /// Revoke a freed metadata block.
    pub fn revoke(&mut self, block: BlockNumber) -> Result<()> {
        let handle = self.handle.as_ref().ok_or(JextError::Journal {
            detail: "transaction handle already closed".to_owned(),
        })?;
        self.writable.remove(&block.0);
        self.engine.revoke(handle, block)
    }

    /// Fence a freed block range until commit.
    pub fn pending_free(&mut self, start: BlockNumber, count: u32) -> Result<()> {
        let handle = self.handle()?;
        self.engine.pending_free(handle, start, count)
    }

    /// Blocks freed anywhere in the running batch, still fenced from reuse.
    #[must_use]
    pub fn pending_free_snapshot(&self) -> Vec<u64> {
        self.engine.pending_free_snapshot()
    }

    /// Ask for more credits.
    pub fn extend(&mut self, additional: u32) -> Result<ExtendOutcome> {
        let handle = self.handle()?;
        let outcome = self.engine.extend(handle, additional)?;
        tracing::trace!(
            target: "jext::journal",
            txn_id = handle.id().0,
            additional,
            ?outcome,
            "txn_extend"
        );
        Ok(outcome)
    }

    /// Restart the handle at a commit boundary with a fresh reservation.
    ///
    /// Prior declarations are committed and forgotten; the caller must
    /// re-declare every block it still intends to touch.
    pub fn restart(&mut self, credits: u32) -> Result<()> {
        let handle = self.handle.as_mut().ok_or(JextError::Journal {
            detail: "transaction handle already closed".to_owned(),
        })?;
        self.engine.restart(handle, credits)?;
        self.writable.clear();
        tracing::debug!(
            target: "jext::journal",
            txn_id = handle.id().0,
            credits,
            "txn_restart"
        );
        Ok(())
    }

    /// Close the handle; its changes commit with the batch.
    pub fn stop(mut self) -> Result<()> {
        let handle = self.handle.take().ok_or(JextError::Journal {
            detail: "transaction handle already closed".to_owned(),
        })?;
        tracing::trace!(target: "jext::journal", txn_id = handle.id().0, "txn_stop");
        self.engine.stop(handle)
    }

    /// Abandon the transaction, discarding buffered changes.
    pub fn abort(mut self) -> Result<()> {
        let handle = self.handle.take().ok_or(JextError::Journal {
            detail: "transaction handle already closed".to_owned(),
        })?;
        tracing::debug!(target: "jext::journal", txn_id = handle.id().0, "txn_abort");
        self.engine.abort(handle)
    }
}

impl Drop for Txn<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            tracing::warn!(
                target: "jext::journal",
                txn_id = handle.id().0,
                "txn_dropped_open"
            );
            let _ = self.engine.abort(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jext_block::{BlockDevice, MemBlockDevice};
    use std::sync::Arc;

    fn engine() -> (Arc<MemBlockDevice>, MemJournal) {
        let dev = Arc::new(MemBlockDevice::new(1024, 64));
        let journal = MemJournal::new(dev.clone(), 256);
        (dev, journal)
    }

    #[test]
    fn dirty_requires_declaration() {
        let (_dev, journal) = engine();
        let mut txn = Txn::start(&journal, SINGLEDATA_CREDITS).expect("start");
        let err = txn
            .dirty(BlockNumber(3), &[0_u8; 1024])
            .expect_err("undeclared dirty must fail");
        assert!(matches!(err, JextError::Journal { .. }));

        txn.declare(BlockNumber(3), AccessKind::Write).expect("declare");
        txn.dirty(BlockNumber(3), &[7_u8; 1024]).expect("dirty");
        txn.stop().expect("stop");
    }

    #[test]
    fn read_declaration_does_not_allow_dirty() {
        let (_dev, journal) = engine();
        let mut txn = Txn::start(&journal, SINGLEDATA_CREDITS).expect("start");
        txn.declare(BlockNumber(5), AccessKind::Read).expect("declare");
        assert!(txn.dirty(BlockNumber(5), &[1_u8; 1024]).is_err());
        txn.abort().expect("abort");
    }

    #[test]
    fn drop_aborts_open_handle() {
        let (dev, journal) = engine();
        {
            let mut txn = Txn::start(&journal, SINGLEDATA_CREDITS).expect("start");
            txn.declare(BlockNumber(2), AccessKind::Write).expect("declare");
            txn.dirty(BlockNumber(2), &[9_u8; 1024]).expect("dirty");
            // Dropped without stop: the engine must discard the write.
        }
        journal.force_commit().expect("commit of empty batch");
        let buf = dev.read_block(BlockNumber(2)).expect("read");
        assert_eq!(buf.as_slice(), &[0_u8; 1024]);
    }

    #[test]
    fn restart_clears_declarations() {
        let (_dev, journal) = engine();
        let mut txn = Txn::start(&journal, SINGLEDATA_CREDITS).expect("start");
        txn.declare(BlockNumber(4), AccessKind::Write).expect("declare");
        txn.restart(SINGLEDATA_CREDITS).expect("restart");
        // The old declaration is gone after a restart.
        assert!(txn.dirty(BlockNumber(4), &[1_u8; 1024]).is_err());
        txn.declare(BlockNumber(4), AccessKind::Write).expect("redeclare");
        txn.dirty(BlockNumber(4), &[1_u8; 1024]).expect("dirty");
        txn.stop().expect("stop");
    }

    #[test]
    fn revoked_block_loses_write_permission() {
        let (_dev, journal) = engine();
        let mut txn = Txn::start(&journal, SINGLEDATA_CREDITS).expect("start");
        txn.declare(BlockNumber(6), AccessKind::Create).expect("declare");
        txn.dirty(BlockNumber(6), &[3_u8; 1024]).expect("dirty");
        txn.revoke(BlockNumber(6)).expect("revoke");
        assert!(txn.dirty(BlockNumber(6), &[4_u8; 1024]).is_err());
        txn.stop().expect("stop");
    }
}
