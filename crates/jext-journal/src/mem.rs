//! In-memory reference engine.
//!
//! [`MemJournal`] implements the batch-commit model: open handles join a
//! single running compound transaction, and `force_commit` applies the
//! batch's surviving dirty blocks to the backing device in one step. Until
//! that step, buffered contents are visible only through the journal's
//! [`read_block`](crate::JournalEngine::read_block) overlay; the backing
//! device holds the last committed state, which is exactly what a crash
//! rolls back to.
//!
//! [`crash`](MemJournal::crash) simulates power loss by discarding every
//! uncommitted buffer, which is how the atomicity tests in `jext-core`
//! drive recovery scenarios without a real journal replay.

use crate::{AccessKind, ExtendOutcome, JournalEngine, TxnHandle};
use jext_block::{BlockBuf, BlockDevice};
use jext_error::{JextError, Result};
use jext_types::{BlockNumber, CommitSeq, TxnId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

/// One running compound transaction. Handles join it until it commits,
/// aborts, or is lost to a crash.
#[derive(Debug, Default)]
struct RunningTxn {
    open_handles: HashSet<u64>,
    credits_reserved: u32,
    credits_used: u32,
    /// Buffered block contents, keyed by absolute block number.
    dirty: BTreeMap<u64, Vec<u8>>,
    /// Write/create declarations, per handle.
    declared: HashMap<u64, HashSet<u64>>,
    /// Blocks freed in this transaction; unreusable until commit.
    pending_free: BTreeSet<u64>,
    /// Freed metadata blocks whose buffered writes must not reach disk.
    revoked: BTreeSet<u64>,
    aborted: bool,
}

#[derive(Default)]
struct Inner {
    running: Option<RunningTxn>,
    committed_seq: u64,
    next_handle_id: u64,
}

impl Inner {
    /// The running transaction `handle_id` belongs to, aborted or not.
    fn member_txn(&mut self, handle_id: u64) -> Result<&mut RunningTxn> {
        let txn = self.running.as_mut().ok_or_else(|| JextError::Journal {
            detail: "no running transaction".to_owned(),
        })?;
        if !txn.open_handles.contains(&handle_id) {
            return Err(JextError::Journal {
                detail: format!("handle {handle_id} is not part of the running transaction"),
            });
        }
        Ok(txn)
    }

    /// Like [`member_txn`](Self::member_txn), but refuses aborted batches.
    fn live_txn(&mut self, handle_id: u64) -> Result<&mut RunningTxn> {
        let txn = self.member_txn(handle_id)?;
        if txn.aborted {
            return Err(JextError::Journal {
                detail: "transaction aborted".to_owned(),
            });
        }
        Ok(txn)
    }
}

/// Reference [`JournalEngine`] backed by a [`BlockDevice`].
///
/// The backing device always holds the last committed image. Capacity is
/// expressed in credits: when admitting a new reservation would exceed it,
/// an idle batch is committed in place, and a batch with open handles
/// pushes back with [`JextError::Busy`].
pub struct MemJournal {
    device: Arc<dyn BlockDevice>,
    capacity_credits: u32,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for MemJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MemJournal")
            .field("capacity_credits", &self.capacity_credits)
            .field("committed_seq", &inner.committed_seq)
            .field("running", &inner.running.is_some())
            .finish_non_exhaustive()
    }
}

impl MemJournal {
    #[must_use]
    pub fn new(device: Arc<dyn BlockDevice>, capacity_credits: u32) -> Self {
        Self {
            device,
            capacity_credits,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Last committed sequence number.
    #[must_use]
    pub fn committed_seq(&self) -> CommitSeq {
        CommitSeq(self.inner.lock().committed_seq)
    }

    /// Simulate power loss: every uncommitted buffered change is gone.
    /// The backing device keeps the last committed image.
    pub fn crash(&self) {
        let mut inner = self.inner.lock();
        let dropped = inner.running.take().map_or(0, |txn| txn.dirty.len());
        tracing::warn!(
            target: "jext::journal",
            dropped_blocks = dropped,
            "journal_crashed"
        );
    }

    /// Commit the running batch while holding the lock. A failed device
    /// write abandons the batch; the caller records the damage through the
    /// error-state machinery.
    fn commit_locked(&self, inner: &mut Inner) -> Result<CommitSeq> {
        let Some(txn) = inner.running.take() else {
            return Ok(CommitSeq(inner.committed_seq));
        };
        if !txn.open_handles.is_empty() {
            let open = txn.open_handles.len();
            inner.running = Some(txn);
            return Err(JextError::Journal {
                detail: format!("commit requested with {open} handle(s) still open"),
            });
        }
        if txn.aborted {
            tracing::debug!(target: "jext::journal", "commit_skipped_aborted_txn");
            return Ok(CommitSeq(inner.committed_seq));
        }

        let mut written = 0_usize;
        for (block, data) in &txn.dirty {
            if txn.revoked.contains(block) {
                continue;
            }
            self.device.write_block(BlockNumber(*block), data)?;
            written += 1;
        }
        self.device.sync()?;
        inner.committed_seq += 1;
        tracing::debug!(
            target: "jext::journal",
            seq = inner.committed_seq,
            blocks_written = written,
            blocks_revoked = txn.revoked.len(),
            blocks_freed = txn.pending_free.len(),
            "txn_committed"
        );
        Ok(CommitSeq(inner.committed_seq))
    }
}

impl JournalEngine for MemJournal {
    fn start(&self, credits: u32) -> Result<TxnHandle> {
        if credits > self.capacity_credits {
            return Err(JextError::Journal {
                detail: format!(
                    "reservation of {credits} credits exceeds journal capacity {}",
                    self.capacity_credits
                ),
            });
        }
        let mut inner = self.inner.lock();

        // An aborted batch blocks admission until its last handle closes.
        let discard_aborted = match inner.running.as_ref() {
            Some(txn) if txn.aborted && txn.open_handles.is_empty() => true,
            Some(txn) if txn.aborted => return Err(JextError::Busy),
            _ => false,
        };
        if discard_aborted {
            tracing::debug!(target: "jext::journal", "aborted_txn_discarded");
            inner.running = None;
        }

        // Capacity pressure: commit an idle batch in place, push back on a
        // batch that still has open handles.
        let over_capacity = inner.running.as_ref().is_some_and(|txn| {
            txn.credits_reserved.saturating_add(credits) > self.capacity_credits
        });
        if over_capacity {
            let idle = inner
                .running
                .as_ref()
                .is_some_and(|txn| txn.open_handles.is_empty());
            if idle {
                self.commit_locked(&mut inner)?;
            } else {
                return Err(JextError::Busy);
            }
        }

        let id = inner.next_handle_id;
        inner.next_handle_id += 1;
        let txn = inner.running.get_or_insert_with(RunningTxn::default);
        txn.open_handles.insert(id);
        txn.credits_reserved = txn.credits_reserved.saturating_add(credits);
        tracing::trace!(
            target: "jext::journal",
            handle = id,
            credits,
            reserved = txn.credits_reserved,
            "handle_started"
        );
        Ok(TxnHandle::new(TxnId(id)))
    }

    fn extend(&self, handle: &TxnHandle, additional: u32) -> Result<ExtendOutcome> {
        let capacity = self.capacity_credits;
        let mut inner = self.inner.lock();
        let txn = inner.live_txn(handle.id().0)?;
        if txn.credits_reserved.saturating_add(additional) > capacity {
            return Ok(ExtendOutcome::NeedsRestart);
        }
        txn.credits_reserved += additional;
        Ok(ExtendOutcome::Extended)
    }

    fn restart(&self, handle: &mut TxnHandle, credits: u32) -> Result<()> {
        if credits > self.capacity_credits {
            return Err(JextError::Journal {
                detail: format!(
                    "reservation of {credits} credits exceeds journal capacity {}",
                    self.capacity_credits
                ),
            });
        }
        let mut inner = self.inner.lock();
        let old_id = handle.id().0;
        {
            let capacity = self.capacity_credits;
            let txn = inner.live_txn(old_id)?;
            let others_open = txn.open_handles.len() > 1;
            if others_open && txn.credits_reserved.saturating_add(credits) > capacity {
                return Err(JextError::Busy);
            }
            txn.open_handles.remove(&old_id);
            txn.declared.remove(&old_id);
        }

        // Sole holder: the batch reaches its commit boundary now. With
        // other handles open, the detached work simply stays queued and
        // commits with the batch.
        if inner
            .running
            .as_ref()
            .is_some_and(|txn| txn.open_handles.is_empty())
        {
            self.commit_locked(&mut inner)?;
        }

        let id = inner.next_handle_id;
        inner.next_handle_id += 1;
        let txn = inner.running.get_or_insert_with(RunningTxn::default);
        txn.open_handles.insert(id);
        txn.credits_reserved = txn.credits_reserved.saturating_add(credits);
        *handle = TxnHandle::new(TxnId(id));
        tracing::debug!(
            target: "jext::journal",
            old_handle = old_id,
            new_handle = id,
            credits,
            "handle_restarted"
        );
        Ok(())
    }

    fn stop(&self, handle: TxnHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        let id = handle.id().0;
        let txn = inner.member_txn(id)?;
        txn.open_handles.remove(&id);
        txn.declared.remove(&id);
        let discard = txn.aborted && txn.open_handles.is_empty();
        if discard {
            tracing::debug!(target: "jext::journal", "aborted_txn_discarded");
            inner.running = None;
        }
        Ok(())
    }

    fn abort(&self, handle: TxnHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        let id = handle.id().0;
        let txn = inner.member_txn(id)?;
        txn.aborted = true;
        txn.open_handles.remove(&id);
        txn.declared.remove(&id);
        tracing::warn!(
            target: "jext::journal",
            handle = id,
            dirty_blocks = txn.dirty.len(),
            "txn_aborted"
        );
        let last = txn.open_handles.is_empty();
        if last {
            inner.running = None;
        }
        Ok(())
    }

    fn declare_access(
        &self,
        handle: &TxnHandle,
        block: BlockNumber,
        kind: AccessKind,
    ) -> Result<()> {
        let block_count = self.device.block_count();
        if block.0 >= block_count {
            return Err(JextError::Corruption {
                block: block.0,
                detail: format!("access declared beyond device end ({block_count} blocks)"),
            });
        }
        let mut inner = self.inner.lock();
        let txn = inner.live_txn(handle.id().0)?;
        if matches!(kind, AccessKind::Write | AccessKind::Create) {
            txn.declared.entry(handle.id().0).or_default().insert(block.0);
        }
        Ok(())
    }

    fn mark_dirty(&self, handle: &TxnHandle, block: BlockNumber, data: &[u8]) -> Result<()> {
        let block_size = self.device.block_size() as usize;
        if data.len() != block_size {
            return Err(JextError::Journal {
                detail: format!(
                    "dirty data length {} does not match block size {block_size}",
                    data.len()
                ),
            });
        }
        let mut inner = self.inner.lock();
        let txn = inner.live_txn(handle.id().0)?;
        let declared = txn
            .declared
            .get(&handle.id().0)
            .is_some_and(|set| set.contains(&block.0));
        if !declared {
            return Err(JextError::Journal {
                detail: format!(
                    "block {} dirtied without a write-access declaration",
                    block.0
                ),
            });
        }
        // One credit per distinct block in the batch.
        if !txn.dirty.contains_key(&block.0) {
            if txn.credits_used >= txn.credits_reserved {
                return Err(JextError::Journal {
                    detail: format!("credits exhausted ({} reserved)", txn.credits_reserved),
                });
            }
            txn.credits_used += 1;
        }
        // A revoked block that gets re-dirtied was reallocated; the new
        // contents win.
        txn.revoked.remove(&block.0);
        txn.dirty.insert(block.0, data.to_vec());
        Ok(())
    }

    fn revoke(&self, handle: &TxnHandle, block: BlockNumber) -> Result<()> {
        let mut inner = self.inner.lock();
        let id = handle.id().0;
        let txn = inner.live_txn(id)?;
        txn.revoked.insert(block.0);
        // The buffered write is dropped; the credit stays spent.
        txn.dirty.remove(&block.0);
        if let Some(set) = txn.declared.get_mut(&id) {
            set.remove(&block.0);
        }
        tracing::trace!(target: "jext::journal", block = block.0, "block_revoked");
        Ok(())
    }

    fn pending_free(&self, handle: &TxnHandle, start: BlockNumber, count: u32) -> Result<()> {
        let mut inner = self.inner.lock();
        let txn = inner.live_txn(handle.id().0)?;
        for block in start.0..start.0.saturating_add(u64::from(count)) {
            txn.pending_free.insert(block);
        }
        Ok(())
    }

    fn pending_free_snapshot(&self) -> Vec<u64> {
        let inner = self.inner.lock();
        match inner.running.as_ref() {
            Some(txn) if !txn.aborted => txn.pending_free.iter().copied().collect(),
            _ => Vec::new(),
        }
    }

    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        let inner = self.inner.lock();
        if let Some(txn) = inner.running.as_ref() {
            if !txn.aborted {
                if let Some(data) = txn.dirty.get(&block.0) {
                    return Ok(BlockBuf::new(data.clone()));
                }
            }
        }
        drop(inner);
        self.device.read_block(block)
    }

    fn force_commit(&self) -> Result<CommitSeq> {
        let mut inner = self.inner.lock();
        self.commit_locked(&mut inner)
    }
}
