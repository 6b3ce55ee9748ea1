//! Goal-directed block allocation and freeing.
//!
//! Allocation probes the goal group first, then nearby groups, then the
//! whole volume, with a bounded retry budget. Early attempts skip
//! contended group locks and respect other inodes' reservation windows;
//! the final sweep takes every lock and ignores windows, so advisory
//! clustering never turns real free space into a spurious failure.
//!
//! Blocks freed inside a still-running transaction stay fenced: their
//! bitmap bits are cleared in the journaled copy, but the allocator masks
//! them out of its search until the batch commits. A full group whose only
//! free space is fenced reports [`JextError::Busy`], not
//! [`JextError::NoSpace`].

use crate::{
    bitmap_clear, bitmap_find_run_from, bitmap_get, bitmap_longest_run, bitmap_set, gdt_block_of,
    is_reserved, reserved_blocks_in_group, update_group_desc, AllocHint, Allocator, BlockAlloc,
};
use jext_error::{JextError, Result};
use jext_journal::{AccessKind, Txn};
use jext_types::{BlockNumber, FsGeometry, GroupNumber, InodeNumber};

/// Full passes over the candidate groups before giving up.
pub const MAX_ALLOC_RETRIES: u32 = 3;
/// Groups probed after the goal group before the search widens to the
/// whole volume.
pub const NEARBY_GROUPS: u32 = 8;

enum TryOutcome {
    Found(BlockAlloc),
    Miss { masked_free: bool },
    Contended,
}

#[derive(Clone, Copy)]
struct Probe {
    /// Block on the group lock instead of skipping contended groups.
    blocking: bool,
    /// Search inside the caller's window and mask foreign windows.
    honor_windows: bool,
}

/// Allocate up to `count` contiguous blocks for `ino` near the hinted
/// goal. Returns a shorter run when no exact fit exists near the goal;
/// the caller issues follow-up requests for the remainder.
pub fn allocate_blocks(
    alloc: &Allocator,
    txn: &mut Txn<'_>,
    ino: InodeNumber,
    hint: &AllocHint,
    count: u32,
) -> Result<BlockAlloc> {
    if count == 0 {
        return Err(JextError::Format("cannot allocate 0 blocks".into()));
    }

    let geo = alloc.geometry();
    let total_groups = alloc.group_count();
    let goal_group = goal_group_of(&geo, ino, hint);
    let mut masked_free_seen = false;

    for attempt in 0..MAX_ALLOC_RETRIES {
        let last = attempt + 1 == MAX_ALLOC_RETRIES;
        let radius = if last {
            total_groups.saturating_sub(1)
        } else {
            NEARBY_GROUPS
        };
        let probe = Probe {
            blocking: attempt > 0,
            honor_windows: !last,
        };

        for group in candidate_groups(goal_group, total_groups, radius) {
            let outcome = match try_group(alloc, txn, &geo, ino, hint, count, group, probe) {
                Ok(outcome) => outcome,
                Err(err) => {
                    // Declaring or dirtying failed mid-operation. The
                    // journal discards the partial transaction; drop the
                    // provisional window with it.
                    alloc.reservations().discard(ino);
                    return Err(err);
                }
            };
            match outcome {
                TryOutcome::Found(found) => {
                    tracing::debug!(
                        target: "jext::alloc",
                        ino = ino.0,
                        start = found.start.0,
                        count = found.count,
                        group = group.0,
                        attempt,
                        "blocks_allocated"
                    );
                    return Ok(found);
                }
                TryOutcome::Miss { masked_free } => masked_free_seen |= masked_free,
                TryOutcome::Contended => {}
            }
        }
    }

    if masked_free_seen {
        // Free space exists but is fenced behind an uncommitted free or
        // drifted counters; retryable once the running batch commits.
        return Err(JextError::Busy);
    }
    Err(JextError::NoSpace)
}

fn goal_group_of(geo: &FsGeometry, ino: InodeNumber, hint: &AllocHint) -> GroupNumber {
    if let Some(goal) = hint.goal_block {
        if geo.block_in_range(goal) {
            return geo.absolute_to_group_block(goal).0;
        }
    }
    if let Some(group) = hint.goal_group {
        if group.0 < geo.group_count {
            return group;
        }
    }
    geo.inode_group(ino)
}

fn candidate_groups(
    start: GroupNumber,
    total: u32,
    radius: u32,
) -> impl Iterator<Item = GroupNumber> {
    let total = total.max(1);
    let span = radius.saturating_add(1).min(total);
    (0..span).map(move |step| GroupNumber((start.0 + step) % total))
}

#[allow(clippy::too_many_arguments, clippy::cast_possible_truncation)]
fn try_group(
    alloc: &Allocator,
    txn: &mut Txn<'_>,
    geo: &FsGeometry,
    ino: InodeNumber,
    hint: &AllocHint,
    count: u32,
    group: GroupNumber,
    probe: Probe,
) -> Result<TryOutcome> {
    let slot = alloc.slot(group)?;
    if slot.snapshot().free_blocks == 0 {
        return Ok(TryOutcome::Miss { masked_free: false });
    }

    let bits = geo.blocks_in_group(group);
    let group_start = geo.group_block_to_absolute(group, 0).0;
    let group_end = group_start + u64::from(bits);
    let bitmap_block = slot.snapshot().block_bitmap;
    let gdt_block = gdt_block_of(geo, alloc.gdt_start(), group);

    // Pull both blocks into the journal's view now; the re-reads under
    // the group lock are then served from memory, never from the device.
    txn.declare(bitmap_block, AccessKind::Read)?;
    let _ = txn.read(bitmap_block)?;
    txn.declare(gdt_block, AccessKind::Read)?;
    let _ = txn.read(gdt_block)?;

    let mut state = if probe.blocking {
        slot.lock()
    } else {
        match slot.try_lock() {
            Some(guard) => guard,
            None => return Ok(TryOutcome::Contended),
        }
    };
    if state.free_blocks == 0 {
        return Ok(TryOutcome::Miss { masked_free: false });
    }

    let bitmap = txn.read(state.block_bitmap)?.to_vec();

    // Search on a masked copy: metadata blocks, ranges freed by the
    // running batch, and (on early attempts) foreign windows all read as
    // in-use. The real bitmap is what gets flipped and journaled.
    let mut overlay = bitmap.clone();
    let reserved = reserved_blocks_in_group(geo, &state, group);
    for rel in &reserved {
        bitmap_set(&mut overlay, *rel);
    }
    for abs in txn.pending_free_snapshot() {
        if abs >= group_start && abs < group_end {
            bitmap_set(&mut overlay, (abs - group_start) as u32);
        }
    }
    if probe.honor_windows {
        for (lo, hi) in alloc
            .reservations()
            .masked_ranges(group_start, group_end, Some(ino))
        {
            for abs in lo..hi {
                bitmap_set(&mut overlay, (abs - group_start) as u32);
            }
        }
    }

    let goal_rel = hint
        .goal_block
        .filter(|goal| goal.0 >= group_start && goal.0 < group_end)
        .map_or(0, |goal| (goal.0 - group_start) as u32);

    let mut pick: Option<(u32, u32)> = None;

    if probe.honor_windows {
        if let Some((win_start, win_end)) = alloc.reservations().window_of(ino) {
            let goal_abs = group_start + u64::from(goal_rel);
            if goal_abs >= win_start && goal_abs < win_end && win_start < group_end {
                let rel_lo = win_start.max(group_start) - group_start;
                let rel_hi = win_end.min(group_end) - group_start;
                // A run only has to start inside the window; the window
                // repositions past whatever gets taken.
                if let Some(found) = bitmap_find_run_from(&overlay, bits, count, rel_lo as u32) {
                    if u64::from(found) >= rel_lo && u64::from(found) < rel_hi {
                        pick = Some((found, count));
                    }
                }
            }
        }
    }

    if pick.is_none() {
        pick = match bitmap_find_run_from(&overlay, bits, count, goal_rel) {
            Some(found) => Some((found, count)),
            None => bitmap_longest_run(&overlay, bits, count),
        };
    }

    let Some((rel_start, len)) = pick else {
        // The counter promised free bits but the masked view has none.
        return Ok(TryOutcome::Miss { masked_free: true });
    };

    txn.declare(state.block_bitmap, AccessKind::Write)?;
    let mut updated = bitmap;
    for rel in rel_start..rel_start + len {
        if bitmap_get(&updated, rel) {
            return Err(JextError::Corruption {
                block: state.block_bitmap.0,
                detail: format!("group {}: chosen block bit {rel} already in use", group.0),
            });
        }
        bitmap_set(&mut updated, rel);
    }
    txn.dirty(state.block_bitmap, &updated)?;

    let new_free = state
        .free_blocks
        .checked_sub(len)
        .ok_or_else(|| JextError::Corruption {
            block: state.block_bitmap.0,
            detail: format!("group {}: free-block counter underflow", group.0),
        })?;
    let desc_free = u16::try_from(new_free).map_err(|_| JextError::Corruption {
        block: gdt_block.0,
        detail: format!(
            "group {}: free-block count {new_free} overflows its descriptor",
            group.0
        ),
    })?;
    update_group_desc(txn, geo, alloc.gdt_start(), group, |desc| {
        desc.free_blocks_count = desc_free;
    })?;

    // Journal writes are in; only infallible in-memory state is left.
    state.free_blocks = new_free;
    alloc.note_blocks_allocated(len);

    let start = geo.group_block_to_absolute(group, rel_start);
    if alloc.reservations_enabled() {
        alloc
            .reservations()
            .record_alloc(ino, hint.logical, start.0, len, group_end);
    }

    Ok(TryOutcome::Found(BlockAlloc { start, count: len }))
}

/// Free `count` blocks starting at `start`, splitting the range per
/// group. The bits are cleared in the journaled bitmap copy and fenced
/// from reallocation until the batch commits. `metadata` additionally
/// revokes each block so stale journal records are never replayed over
/// it after reuse.
pub fn free_blocks(
    alloc: &Allocator,
    txn: &mut Txn<'_>,
    ino: Option<InodeNumber>,
    start: BlockNumber,
    count: u32,
    metadata: bool,
) -> Result<()> {
    if count == 0 {
        return Ok(());
    }
    let geo = alloc.geometry();
    let end = start.0.saturating_add(u64::from(count));
    if start.0 < u64::from(geo.first_data_block) || end > geo.total_blocks {
        return Err(JextError::Corruption {
            block: start.0,
            detail: format!("freed range [{}, {end}) escapes the volume", start.0),
        });
    }

    let mut abs = start.0;
    while abs < end {
        let (group, rel) = geo.absolute_to_group_block(BlockNumber(abs));
        let group_start = geo.group_block_to_absolute(group, 0).0;
        let group_end = group_start + u64::from(geo.blocks_in_group(group));
        #[allow(clippy::cast_possible_truncation)]
        let chunk = (end.min(group_end) - abs) as u32;

        free_in_group(alloc, txn, &geo, group, rel, chunk, metadata)?;
        alloc.reservations().trim_freed(abs, u64::from(chunk));
        abs += u64::from(chunk);
    }

    tracing::debug!(
        target: "jext::alloc",
        ino = ino.map(|i| i.0),
        start = start.0,
        count,
        metadata,
        "blocks_freed"
    );
    Ok(())
}

fn free_in_group(
    alloc: &Allocator,
    txn: &mut Txn<'_>,
    geo: &FsGeometry,
    group: GroupNumber,
    rel_start: u32,
    count: u32,
    metadata: bool,
) -> Result<()> {
    let slot = alloc.slot(group)?;
    let bitmap_block = slot.snapshot().block_bitmap;
    let gdt_block = gdt_block_of(geo, alloc.gdt_start(), group);
    let group_start = geo.group_block_to_absolute(group, 0).0;

    // Same discipline as allocation: warm the journal's view first, then
    // lock and work on the buffered copies.
    txn.declare(bitmap_block, AccessKind::Write)?;
    let _ = txn.read(bitmap_block)?;
    txn.declare(gdt_block, AccessKind::Read)?;
    let _ = txn.read(gdt_block)?;

    let mut state = slot.lock();
    let mut bitmap = txn.read(state.block_bitmap)?.to_vec();
    let reserved = reserved_blocks_in_group(geo, &state, group);

    for rel in rel_start..rel_start + count {
        if is_reserved(&reserved, rel) {
            return Err(JextError::Corruption {
                block: group_start + u64::from(rel),
                detail: format!("group {}: freeing a filesystem metadata block", group.0),
            });
        }
        if !bitmap_get(&bitmap, rel) {
            return Err(JextError::Corruption {
                block: group_start + u64::from(rel),
                detail: format!("group {}: double free of block bit {rel}", group.0),
            });
        }
        bitmap_clear(&mut bitmap, rel);
    }
    txn.dirty(state.block_bitmap, &bitmap)?;

    let new_free = state
        .free_blocks
        .checked_add(count)
        .ok_or_else(|| JextError::Corruption {
            block: state.block_bitmap.0,
            detail: format!("group {}: free-block counter overflow", group.0),
        })?;
    let desc_free = u16::try_from(new_free).map_err(|_| JextError::Corruption {
        block: gdt_block.0,
        detail: format!(
            "group {}: free-block count {new_free} overflows its descriptor",
            group.0
        ),
    })?;
    update_group_desc(txn, geo, alloc.gdt_start(), group, |desc| {
        desc.free_blocks_count = desc_free;
    })?;

    txn.pending_free(BlockNumber(group_start + u64::from(rel_start)), count)?;
    if metadata {
        for rel in rel_start..rel_start + count {
            txn.revoke(BlockNumber(group_start + u64::from(rel)))?;
        }
    }

    state.free_blocks = new_free;
    alloc.note_blocks_freed(count);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bitmap_set, verify_free_counts, Allocator};
    use jext_block::{BlockDevice, MemBlockDevice};
    use jext_journal::{JournalEngine, MemJournal};
    use jext_ondisk::group::GroupDesc;
    use std::sync::Arc;

    const BS: u32 = 1024;
    const INO: InodeNumber = InodeNumber(12);

    fn geometry(groups: u32) -> FsGeometry {
        FsGeometry {
            block_size: jext_types::BlockSize::new(BS).expect("block size"),
            blocks_per_group: 1024,
            inodes_per_group: 128,
            total_blocks: 1 + 1024 * u64::from(groups),
            total_inodes: 128 * groups,
            first_data_block: 1,
            group_count: groups,
            inode_size: 128,
        }
    }

    /// One group: superblock at 1, GDT at 2, block bitmap at 3, inode
    /// bitmap at 4, inode table at 5..21. 1003 data blocks free.
    fn fixture() -> (Arc<MemBlockDevice>, MemJournal, Allocator) {
        let dev = Arc::new(MemBlockDevice::new(BS, 1025));
        let desc = GroupDesc {
            block_bitmap: 3,
            inode_bitmap: 4,
            inode_table: 5,
            free_blocks_count: 1003,
            free_inodes_count: 118,
            used_dirs_count: 1,
        };

        let mut bitmap = vec![0_u8; BS as usize];
        for bit in 0..21 {
            bitmap_set(&mut bitmap, bit);
        }
        dev.write_block(BlockNumber(3), &bitmap).expect("bitmap");

        let mut gdt = vec![0_u8; BS as usize];
        desc.encode_into(&mut gdt).expect("encode");
        dev.write_block(BlockNumber(2), &gdt).expect("gdt");

        let journal = MemJournal::new(dev.clone(), 4096);
        let alloc = Allocator::new(geometry(1), BlockNumber(2), &[desc]);
        (dev, journal, alloc)
    }

    fn hint_at(block: u64, logical: u64) -> AllocHint {
        AllocHint {
            goal_block: Some(BlockNumber(block)),
            logical,
            ..AllocHint::default()
        }
    }

    #[test]
    fn goal_allocation_is_exact_on_an_empty_group() {
        let (_dev, journal, alloc) = fixture();
        let mut txn = Txn::start(&journal, 16).expect("start");

        let got = allocate_blocks(&alloc, &mut txn, INO, &hint_at(100, 0), 10).expect("alloc");
        assert_eq!(
            got,
            BlockAlloc {
                start: BlockNumber(100),
                count: 10
            }
        );
        assert_eq!(alloc.reservations().window_of(INO), Some((110, 118)));
        assert_eq!(alloc.free_blocks(), 993);
        txn.stop().expect("stop");
    }

    #[test]
    fn sequential_allocations_extend_through_the_window() {
        let (_dev, journal, alloc) = fixture();
        let mut txn = Txn::start(&journal, 16).expect("start");

        let first = allocate_blocks(&alloc, &mut txn, INO, &hint_at(100, 0), 10).expect("alloc");
        let second = allocate_blocks(&alloc, &mut txn, INO, &hint_at(110, 10), 5).expect("alloc");
        assert_eq!(first.start, BlockNumber(100));
        assert_eq!(second.start, BlockNumber(110));
        assert_eq!(second.count, 5);

        // The hit doubled the window.
        assert_eq!(alloc.reservations().window_of(INO), Some((115, 131)));
        assert_eq!(alloc.reservations().hits_of(INO), 1);
        txn.stop().expect("stop");
    }

    #[test]
    fn freed_blocks_come_back_only_after_commit() {
        let (_dev, journal, alloc) = fixture();
        let mut txn = Txn::start(&journal, 32).expect("start");

        allocate_blocks(&alloc, &mut txn, INO, &hint_at(100, 0), 10).expect("alloc");
        allocate_blocks(&alloc, &mut txn, INO, &hint_at(110, 10), 5).expect("alloc");
        free_blocks(&alloc, &mut txn, Some(INO), BlockNumber(100), 5, false).expect("free");

        // Same batch: the freed range is fenced, so goal=100 lands past
        // the live allocations instead.
        let fenced = allocate_blocks(&alloc, &mut txn, INO, &hint_at(100, 20), 3).expect("alloc");
        assert_eq!(fenced.start, BlockNumber(115));
        txn.stop().expect("stop");
        journal.force_commit().expect("commit");

        // Fresh batch: the committed free range is reusable.
        let mut txn = Txn::start(&journal, 16).expect("start");
        let reused = allocate_blocks(&alloc, &mut txn, INO, &hint_at(100, 30), 3).expect("alloc");
        assert_eq!(
            reused,
            BlockAlloc {
                start: BlockNumber(100),
                count: 3
            }
        );
        txn.stop().expect("stop");
    }

    #[test]
    fn allocation_skips_foreign_windows() {
        let (_dev, journal, alloc) = fixture();
        let ino_a = InodeNumber(20);
        let ino_b = InodeNumber(21);
        let mut txn = Txn::start(&journal, 32).expect("start");

        let a1 = allocate_blocks(&alloc, &mut txn, ino_a, &AllocHint::default(), 2).expect("a1");
        assert_eq!(a1.start, BlockNumber(22));
        assert_eq!(alloc.reservations().window_of(ino_a), Some((24, 32)));

        // B's scan starts past A's window, leaving it intact.
        let b1 = allocate_blocks(&alloc, &mut txn, ino_b, &AllocHint::default(), 2).expect("b1");
        assert_eq!(b1.start, BlockNumber(32));
        assert_eq!(alloc.reservations().window_of(ino_a), Some((24, 32)));
        assert_eq!(alloc.reservations().window_of(ino_b), Some((34, 42)));
        txn.stop().expect("stop");
    }

    #[test]
    fn two_streams_stay_contiguous_via_their_windows() {
        let (_dev, journal, alloc) = fixture();
        let ino_a = InodeNumber(20);
        let ino_b = InodeNumber(21);
        let mut txn = Txn::start(&journal, 32).expect("start");

        let a1 = allocate_blocks(&alloc, &mut txn, ino_a, &AllocHint::default(), 2).expect("a1");
        let b1 = allocate_blocks(&alloc, &mut txn, ino_b, &hint_at(500, 0), 2).expect("b1");
        let a2 = allocate_blocks(&alloc, &mut txn, ino_a, &hint_at(24, 2), 2).expect("a2");
        let b2 = allocate_blocks(&alloc, &mut txn, ino_b, &hint_at(502, 2), 2).expect("b2");

        // Each stream is physically contiguous.
        assert_eq!(a1.start, BlockNumber(22));
        assert_eq!(a2.start, BlockNumber(24));
        assert_eq!(b1.start, BlockNumber(500));
        assert_eq!(b2.start, BlockNumber(502));
        txn.stop().expect("stop");
    }

    #[test]
    fn desperation_pass_takes_space_inside_foreign_windows() {
        let (dev, _journal, alloc) = fixture();
        // Fill every data bit except [500, 508).
        let mut bitmap = vec![0xFF_u8; BS as usize];
        for bit in 499..507 {
            crate::bitmap_clear(&mut bitmap, bit);
        }
        dev.write_block(BlockNumber(3), &bitmap).expect("bitmap");
        {
            let slot = alloc.slot(GroupNumber(0)).expect("slot");
            slot.lock().free_blocks = 8;
        }
        // Another inode holds a window over the only free run.
        alloc.reservations().record_alloc(InodeNumber(30), 0, 492, 8, 1025);
        assert_eq!(
            alloc.reservations().window_of(InodeNumber(30)),
            Some((500, 508))
        );

        let journal = MemJournal::new(dev.clone(), 4096);
        let mut txn = Txn::start(&journal, 16).expect("start");
        let got = allocate_blocks(&alloc, &mut txn, INO, &AllocHint::default(), 4).expect("alloc");
        assert_eq!(got.start, BlockNumber(500));
        assert_eq!(got.count, 4);
        txn.stop().expect("stop");
    }

    #[test]
    fn fenced_only_space_reports_busy_not_nospace() {
        let (dev, _journal, alloc) = fixture();
        // Every bit in use; nothing free anywhere.
        dev.write_block(BlockNumber(3), &vec![0xFF_u8; BS as usize])
            .expect("bitmap");
        {
            let slot = alloc.slot(GroupNumber(0)).expect("slot");
            slot.lock().free_blocks = 0;
        }
        let mut gdt = vec![0_u8; BS as usize];
        GroupDesc {
            block_bitmap: 3,
            inode_bitmap: 4,
            inode_table: 5,
            free_blocks_count: 0,
            free_inodes_count: 118,
            used_dirs_count: 1,
        }
        .encode_into(&mut gdt)
        .expect("encode");
        dev.write_block(BlockNumber(2), &gdt).expect("gdt");

        let journal = MemJournal::new(dev.clone(), 4096);
        let mut txn = Txn::start(&journal, 16).expect("start");

        // Free a range inside this batch: space exists but is fenced.
        free_blocks(&alloc, &mut txn, Some(INO), BlockNumber(600), 8, false).expect("free");
        let err = allocate_blocks(&alloc, &mut txn, INO, &hint_at(600, 0), 4)
            .expect_err("fenced space must not satisfy the request");
        assert!(matches!(err, JextError::Busy), "got {err:?}");

        txn.stop().expect("stop");
        journal.force_commit().expect("commit");

        let mut txn = Txn::start(&journal, 16).expect("start");
        let got = allocate_blocks(&alloc, &mut txn, INO, &hint_at(600, 0), 4).expect("alloc");
        assert_eq!(got.start, BlockNumber(600));
        txn.stop().expect("stop");
    }

    #[test]
    fn exhausted_group_reports_nospace() {
        let (_dev, journal, alloc) = fixture();
        let mut txn = Txn::start(&journal, 64).expect("start");

        // Ask for more than exists: the longest-run fallback grabs all
        // 1003 data blocks in one partial allocation.
        let got = allocate_blocks(&alloc, &mut txn, INO, &AllocHint::default(), 1010)
            .expect("partial alloc");
        assert_eq!(got.start, BlockNumber(22));
        assert_eq!(got.count, 1003);
        assert_eq!(alloc.free_blocks(), 0);

        let err = allocate_blocks(&alloc, &mut txn, INO, &AllocHint::default(), 1)
            .expect_err("group is full");
        assert!(matches!(err, JextError::NoSpace), "got {err:?}");
        txn.stop().expect("stop");
    }

    #[test]
    fn double_free_is_corruption() {
        let (_dev, journal, alloc) = fixture();
        let mut txn = Txn::start(&journal, 16).expect("start");

        allocate_blocks(&alloc, &mut txn, INO, &hint_at(200, 0), 4).expect("alloc");
        free_blocks(&alloc, &mut txn, Some(INO), BlockNumber(200), 4, false).expect("free");
        let err = free_blocks(&alloc, &mut txn, Some(INO), BlockNumber(200), 4, false)
            .expect_err("double free");
        assert!(matches!(err, JextError::Corruption { .. }), "got {err:?}");
    }

    #[test]
    fn freeing_metadata_is_corruption() {
        let (_dev, journal, alloc) = fixture();
        let mut txn = Txn::start(&journal, 16).expect("start");

        let err = free_blocks(&alloc, &mut txn, None, BlockNumber(3), 1, false)
            .expect_err("block bitmap is not freeable");
        assert!(matches!(err, JextError::Corruption { .. }), "got {err:?}");

        let err = free_blocks(&alloc, &mut txn, None, BlockNumber(5000), 4, false)
            .expect_err("range escapes the volume");
        assert!(matches!(err, JextError::Corruption { .. }), "got {err:?}");
    }

    #[test]
    fn metadata_free_revokes_the_blocks() {
        let (dev, journal, alloc) = fixture();
        let mut txn = Txn::start(&journal, 16).expect("start");

        let got = allocate_blocks(&alloc, &mut txn, INO, &hint_at(300, 0), 1).expect("alloc");
        assert_eq!(got.start, BlockNumber(300));
        txn.declare(BlockNumber(300), AccessKind::Create).expect("declare");
        txn.dirty(BlockNumber(300), &[0xAB_u8; BS as usize]).expect("dirty");

        // Freeing it as metadata revokes the buffered write.
        free_blocks(&alloc, &mut txn, Some(INO), BlockNumber(300), 1, true).expect("free");
        txn.stop().expect("stop");
        journal.force_commit().expect("commit");

        let buf = dev.read_block(BlockNumber(300)).expect("read");
        assert_eq!(buf.as_slice(), &[0_u8; BS as usize]);
    }

    #[test]
    fn counters_line_up_after_commit() {
        let (_dev, journal, alloc) = fixture();
        let mut txn = Txn::start(&journal, 32).expect("start");

        allocate_blocks(&alloc, &mut txn, INO, &hint_at(100, 0), 10).expect("alloc");
        free_blocks(&alloc, &mut txn, Some(INO), BlockNumber(104), 4, false).expect("free");
        txn.stop().expect("stop");
        journal.force_commit().expect("commit");

        assert_eq!(alloc.free_blocks(), 1003 - 10 + 4);
        verify_free_counts(&alloc, &journal).expect("consistent counters");

        let desc_block = journal.read_block(BlockNumber(2)).expect("gdt");
        let desc = GroupDesc::parse_from_bytes(desc_block.as_slice()).expect("parse");
        assert_eq!(desc.free_blocks_count, 997);
    }

    #[test]
    fn journal_failure_discards_the_window() {
        let (_dev, journal, alloc) = fixture();

        let mut txn = Txn::start(&journal, 16).expect("start");
        allocate_blocks(&alloc, &mut txn, INO, &hint_at(100, 0), 4).expect("alloc");
        assert!(alloc.reservations().window_of(INO).is_some());
        txn.stop().expect("stop");
        journal.force_commit().expect("commit");

        // One credit in a fresh batch: the bitmap write fits, the
        // descriptor write does not, and the failed operation must drop
        // the inode's window.
        let mut txn = Txn::start(&journal, 1).expect("start");
        let err = allocate_blocks(&alloc, &mut txn, INO, &hint_at(104, 4), 4)
            .expect_err("credit exhaustion");
        assert!(matches!(err, JextError::Journal { .. }), "got {err:?}");
        assert_eq!(alloc.reservations().window_of(INO), None);
    }

    /// Two groups; group 0 full, group 1 empty with its metadata at
    /// blocks 1500..1519 so frees can cross the group boundary.
    fn fixture_two_groups() -> (Arc<MemBlockDevice>, MemJournal, Allocator) {
        let dev = Arc::new(MemBlockDevice::new(BS, 2049));
        let descs = [
            GroupDesc {
                block_bitmap: 3,
                inode_bitmap: 4,
                inode_table: 5,
                free_blocks_count: 0,
                free_inodes_count: 0,
                used_dirs_count: 1,
            },
            GroupDesc {
                block_bitmap: 1500,
                inode_bitmap: 1501,
                inode_table: 1502,
                free_blocks_count: 1001,
                free_inodes_count: 128,
                used_dirs_count: 0,
            },
        ];

        dev.write_block(BlockNumber(3), &vec![0xFF_u8; BS as usize])
            .expect("bitmap 0");
        let mut bitmap1 = vec![0_u8; BS as usize];
        // Metadata at rel 475..493, plus rel 0..5 in use so a free can
        // span the boundary from group 0.
        for bit in 475..493 {
            bitmap_set(&mut bitmap1, bit);
        }
        for bit in 0..5 {
            bitmap_set(&mut bitmap1, bit);
        }
        dev.write_block(BlockNumber(1500), &bitmap1).expect("bitmap 1");

        let mut gdt = vec![0_u8; BS as usize];
        for (idx, desc) in descs.iter().enumerate() {
            desc.encode_into(&mut gdt[idx * 32..]).expect("encode");
        }
        dev.write_block(BlockNumber(2), &gdt).expect("gdt");

        let journal = MemJournal::new(dev.clone(), 4096);
        let alloc = Allocator::new(geometry(2), BlockNumber(2), &descs);
        (dev, journal, alloc)
    }

    #[test]
    fn full_goal_group_falls_through_to_the_next() {
        let (_dev, journal, alloc) = fixture_two_groups();
        let mut txn = Txn::start(&journal, 16).expect("start");

        let hint = AllocHint {
            goal_group: Some(GroupNumber(0)),
            ..AllocHint::default()
        };
        let got = allocate_blocks(&alloc, &mut txn, INO, &hint, 4).expect("alloc");
        // First free bit of group 1: rel 5, absolute 1 + 1024 + 5.
        assert_eq!(got.start, BlockNumber(1030));
        assert_eq!(got.count, 4);
        txn.stop().expect("stop");
    }

    #[test]
    fn freeing_splits_across_the_group_boundary() {
        let (_dev, journal, alloc) = fixture_two_groups();
        let mut txn = Txn::start(&journal, 16).expect("start");

        // [1023, 1030): two blocks in group 0, five in group 1.
        free_blocks(&alloc, &mut txn, None, BlockNumber(1023), 7, false).expect("free");

        let g0 = alloc.slot(GroupNumber(0)).expect("slot").snapshot();
        let g1 = alloc.slot(GroupNumber(1)).expect("slot").snapshot();
        assert_eq!(g0.free_blocks, 2);
        assert_eq!(g1.free_blocks, 1006);
        assert_eq!(txn.pending_free_snapshot().len(), 7);

        txn.stop().expect("stop");
        journal.force_commit().expect("commit");
        verify_free_counts(&alloc, &journal).expect("consistent counters");
    }
}
