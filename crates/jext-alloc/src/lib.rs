#![forbid(unsafe_code)]
//! Block and inode allocation.
//!
//! ## Design
//!
//! The allocator is layered:
//!
//! 1. **Bitmap**: raw bit manipulation on block/inode bitmaps.
//! 2. **[`Allocator`]**: sharded per-group state plus atomic global
//!    free counters.
//! 3. **[`block`]**: goal-directed, reservation-window-aware block
//!    allocation across groups, journaled.
//! 4. **[`inode`]**: spread-directories/cluster-files inode placement,
//!    journaled.
//!
//! Every bitmap and group-descriptor mutation flows through a journal
//! transaction handle: write access is declared before the flip and the
//! buffer is marked dirty after, so a crash replays to either the old or
//! the new state of the whole operation.
//!
//! Group locks shard by group number. At most one group lock is held at a
//! time on the allocation path; the rare caller that must hold several
//! (free-count verification) acquires them in ascending group order.

pub mod block;
pub mod inode;
pub mod reservation;

use jext_error::{JextError, Result};
use jext_journal::{AccessKind, JournalEngine, Txn};
use jext_ondisk::group::{GroupDesc, GROUP_DESC_SIZE};
use jext_types::{BlockNumber, FsGeometry, GroupNumber, InodeNumber};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub use reservation::{ReservationTree, DEFAULT_RESERVE_BLOCKS, MAX_RESERVE_BLOCKS};

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Count free (zero) bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    let full_bytes = (count / 8) as usize;
    let remainder = count % 8;
    let mut free = 0_u32;

    for &byte in bitmap.iter().take(full_bytes) {
        free += byte.count_zeros();
    }

    if remainder > 0 && full_bytes < bitmap.len() {
        let byte = bitmap[full_bytes];
        for bit in 0..remainder {
            if (byte >> bit) & 1 == 0 {
                free += 1;
            }
        }
    }

    free
}

/// Find the first free (zero) bit in the first `count` bits of `bitmap`,
/// starting from `start` and wrapping around.
#[must_use]
pub fn bitmap_find_free(bitmap: &[u8], count: u32, start: u32) -> Option<u32> {
    let start = if start >= count { 0 } else { start };
    for idx in start..count {
        if !bitmap_get(bitmap, idx) {
            return Some(idx);
        }
    }
    (0..start).find(|&idx| !bitmap_get(bitmap, idx))
}

/// Find a run of `run_len` contiguous free bits, scanning forward from
/// `from` and restarting at bit 0 if the tail has no fit. Runs never span
/// the wrap point.
#[must_use]
pub fn bitmap_find_run_from(bitmap: &[u8], count: u32, run_len: u32, from: u32) -> Option<u32> {
    if run_len == 0 || run_len > count {
        return None;
    }
    let from = if from >= count { 0 } else { from };
    let scan = |lo: u32, hi: u32| -> Option<u32> {
        let mut run_start = lo;
        let mut len = 0_u32;
        for idx in lo..hi {
            if bitmap_get(bitmap, idx) {
                run_start = idx + 1;
                len = 0;
            } else {
                len += 1;
                if len >= run_len {
                    return Some(run_start);
                }
            }
        }
        None
    };
    scan(from, count).or_else(|| scan(0, count))
}

/// Longest run of free bits in the first `count` bits, capped at `cap`.
/// Returns `(start, len)` with `len >= 1`, or `None` when every bit is set.
#[must_use]
pub fn bitmap_longest_run(bitmap: &[u8], count: u32, cap: u32) -> Option<(u32, u32)> {
    if cap == 0 {
        return None;
    }
    let mut best: Option<(u32, u32)> = None;
    let mut run_start = 0_u32;
    let mut len = 0_u32;
    for idx in 0..count {
        if bitmap_get(bitmap, idx) {
            run_start = idx + 1;
            len = 0;
        } else {
            len += 1;
            if len > best.map_or(0, |(_, b)| b) {
                best = Some((run_start, len));
                if len >= cap {
                    return Some((run_start, cap));
                }
            }
        }
    }
    best
}

// ── Allocation results ──────────────────────────────────────────────────────

/// Hint for the block allocator to guide placement decisions.
#[derive(Debug, Clone, Default)]
pub struct AllocHint {
    /// Preferred block group (e.g. same as the owning inode).
    pub goal_group: Option<GroupNumber>,
    /// Preferred block number (e.g. adjacent to the last mapped block).
    pub goal_block: Option<BlockNumber>,
    /// Logical block this allocation backs, for sequential-pattern
    /// tracking in the reservation layer.
    pub logical: u64,
}

/// Result of a block allocation. `count` may be less than requested when
/// only a shorter free run was available near the goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAlloc {
    pub start: BlockNumber,
    pub count: u32,
}

/// Result of an inode allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeAlloc {
    pub ino: InodeNumber,
    pub group: GroupNumber,
}

// ── Sharded group state ─────────────────────────────────────────────────────

/// Mutable per-group allocator state, guarded by its [`GroupSlot`] lock.
#[derive(Debug, Clone)]
pub struct GroupState {
    pub block_bitmap: BlockNumber,
    pub inode_bitmap: BlockNumber,
    pub inode_table: BlockNumber,
    pub free_blocks: u32,
    pub free_inodes: u32,
    pub used_dirs: u32,
}

impl GroupState {
    #[must_use]
    pub fn from_desc(desc: &GroupDesc) -> Self {
        Self {
            block_bitmap: desc.block_bitmap_block(),
            inode_bitmap: desc.inode_bitmap_block(),
            inode_table: desc.inode_table_block(),
            free_blocks: u32::from(desc.free_blocks_count),
            free_inodes: u32::from(desc.free_inodes_count),
            used_dirs: u32::from(desc.used_dirs_count),
        }
    }
}

/// One block group's lock shard.
///
/// When more than one slot must be held at once, acquire in ascending
/// group-number order.
#[derive(Debug)]
pub struct GroupSlot {
    group: GroupNumber,
    state: Mutex<GroupState>,
}

impl GroupSlot {
    #[must_use]
    pub fn group(&self) -> GroupNumber {
        self.group
    }

    pub fn lock(&self) -> MutexGuard<'_, GroupState> {
        self.state.lock()
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, GroupState>> {
        self.state.try_lock()
    }

    /// Copy of the current state, for inspection paths that must not hold
    /// the lock.
    #[must_use]
    pub fn snapshot(&self) -> GroupState {
        self.state.lock().clone()
    }
}

// ── Allocator ───────────────────────────────────────────────────────────────

/// Shared allocator state for one mounted filesystem.
///
/// Global free counters are atomics; they move together with the per-group
/// counters inside the enclosing transaction, and
/// [`verify_free_counts`] cross-checks all three levels (atomics, group
/// descriptors, bitmap population) after commit.
#[derive(Debug)]
pub struct Allocator {
    geo: RwLock<FsGeometry>,
    groups: RwLock<Vec<Arc<GroupSlot>>>,
    gdt_start: BlockNumber,
    free_blocks: AtomicU64,
    free_inodes: AtomicU64,
    reservations: ReservationTree,
    reservations_enabled: bool,
}

impl Allocator {
    #[must_use]
    pub fn new(geo: FsGeometry, gdt_start: BlockNumber, descs: &[GroupDesc]) -> Self {
        let mut free_blocks = 0_u64;
        let mut free_inodes = 0_u64;
        let groups = descs
            .iter()
            .enumerate()
            .map(|(idx, desc)| {
                free_blocks += u64::from(desc.free_blocks_count);
                free_inodes += u64::from(desc.free_inodes_count);
                #[allow(clippy::cast_possible_truncation)]
                Arc::new(GroupSlot {
                    group: GroupNumber(idx as u32),
                    state: Mutex::new(GroupState::from_desc(desc)),
                })
            })
            .collect();
        Self {
            geo: RwLock::new(geo),
            groups: RwLock::new(groups),
            gdt_start,
            free_blocks: AtomicU64::new(free_blocks),
            free_inodes: AtomicU64::new(free_inodes),
            reservations: ReservationTree::new(),
            reservations_enabled: true,
        }
    }

    /// Current geometry snapshot. Changes only through [`add_group`](Self::add_group).
    #[must_use]
    pub fn geometry(&self) -> FsGeometry {
        self.geo.read().clone()
    }

    #[must_use]
    pub fn group_count(&self) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        let n = self.groups.read().len() as u32;
        n
    }

    #[must_use]
    pub fn gdt_start(&self) -> BlockNumber {
        self.gdt_start
    }

    pub fn slot(&self, group: GroupNumber) -> Result<Arc<GroupSlot>> {
        self.groups
            .read()
            .get(group.0 as usize)
            .cloned()
            .ok_or_else(|| JextError::Corruption {
                block: 0,
                detail: format!("group {} out of range", group.0),
            })
    }

    /// Snapshot of all group slots, for scans.
    #[must_use]
    pub fn slots(&self) -> Vec<Arc<GroupSlot>> {
        self.groups.read().clone()
    }

    #[must_use]
    pub fn free_blocks(&self) -> u64 {
        self.free_blocks.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn free_inodes(&self) -> u64 {
        self.free_inodes.load(Ordering::Acquire)
    }

    pub(crate) fn note_blocks_allocated(&self, count: u32) {
        self.free_blocks.fetch_sub(u64::from(count), Ordering::AcqRel);
    }

    pub(crate) fn note_blocks_freed(&self, count: u32) {
        self.free_blocks.fetch_add(u64::from(count), Ordering::AcqRel);
    }

    pub(crate) fn note_inode_allocated(&self) {
        self.free_inodes.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn note_inode_freed(&self) {
        self.free_inodes.fetch_add(1, Ordering::AcqRel);
    }

    #[must_use]
    pub fn reservations(&self) -> &ReservationTree {
        &self.reservations
    }

    /// Whether successful allocations place reservation windows.
    #[must_use]
    pub fn reservations_enabled(&self) -> bool {
        self.reservations_enabled
    }

    /// Set the reservation policy for this volume. `&mut self` restricts
    /// this to mount time, before the allocator is shared; any windows
    /// recorded earlier are dropped.
    pub fn set_reservation_policy(&mut self, enabled: bool, default_goal: u32) {
        self.reservations = ReservationTree::with_default_goal(default_goal);
        self.reservations_enabled = enabled;
    }

    /// Extend the volume by one already-initialized group. The caller has
    /// journaled the new group's descriptor, bitmaps, and inode table;
    /// this publishes the group to the allocation paths.
    pub fn add_group(&self, new_geo: FsGeometry, desc: &GroupDesc) -> Result<()> {
        let mut groups = self.groups.write();
        #[allow(clippy::cast_possible_truncation)]
        let group = GroupNumber(groups.len() as u32);
        if new_geo.group_count != group.0 + 1 {
            return Err(JextError::InvalidGeometry(format!(
                "resize to {} groups but {} slots would exist",
                new_geo.group_count,
                group.0 + 1
            )));
        }
        groups.push(Arc::new(GroupSlot {
            group,
            state: Mutex::new(GroupState::from_desc(desc)),
        }));
        *self.geo.write() = new_geo;
        self.free_blocks
            .fetch_add(u64::from(desc.free_blocks_count), Ordering::AcqRel);
        self.free_inodes
            .fetch_add(u64::from(desc.free_inodes_count), Ordering::AcqRel);
        tracing::info!(
            target: "jext::alloc",
            group = group.0,
            free_blocks = desc.free_blocks_count,
            free_inodes = desc.free_inodes_count,
            "group_added"
        );
        Ok(())
    }
}

// ── Group descriptor persistence ────────────────────────────────────────────

/// Descriptor-table block holding `group`'s record.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn gdt_block_of(geo: &FsGeometry, gdt_start: BlockNumber, group: GroupNumber) -> BlockNumber {
    let descs_per_block = geo.block_size.get() as u64 / GROUP_DESC_SIZE as u64;
    BlockNumber(gdt_start.0 + u64::from(group.0) / descs_per_block)
}

/// Read-modify-write one group descriptor inside the transaction.
///
/// The descriptor table is packed 32-byte records starting at `gdt_start`;
/// counter updates travel in the same transaction as the bitmap flip they
/// account for.
#[allow(clippy::cast_possible_truncation)]
pub fn update_group_desc<F>(
    txn: &mut Txn<'_>,
    geo: &FsGeometry,
    gdt_start: BlockNumber,
    group: GroupNumber,
    patch: F,
) -> Result<()>
where
    F: FnOnce(&mut GroupDesc),
{
    let descs_per_block = geo.block_size.get() as usize / GROUP_DESC_SIZE;
    let gdt_block = gdt_block_of(geo, gdt_start, group);
    let offset = (group.0 as usize % descs_per_block) * GROUP_DESC_SIZE;

    txn.declare(gdt_block, AccessKind::Write)?;
    let buf = txn.read(gdt_block)?;
    let mut bytes = buf.to_vec();
    let mut desc = GroupDesc::parse_from_bytes(&bytes[offset..]).map_err(|err| {
        JextError::Corruption {
            block: gdt_block.0,
            detail: format!("group descriptor {}: {err}", group.0),
        }
    })?;
    patch(&mut desc);
    desc.encode_into(&mut bytes[offset..])
        .map_err(|err| JextError::Corruption {
            block: gdt_block.0,
            detail: format!("group descriptor {}: {err}", group.0),
        })?;
    txn.dirty(gdt_block, &bytes)?;
    Ok(())
}

/// Relative block offsets within `group` that hold metadata (bitmaps and
/// the inode table) and must never be handed out as data blocks. Masked
/// into every scan overlay even though the format-time bitmap already
/// marks them allocated.
#[must_use]
pub fn reserved_blocks_in_group(
    geo: &FsGeometry,
    state: &GroupState,
    group: GroupNumber,
) -> Vec<u32> {
    let group_start =
        u64::from(geo.first_data_block) + u64::from(group.0) * u64::from(geo.blocks_per_group);
    let blocks_in_group = geo.blocks_in_group(group);
    let mut reserved = Vec::new();

    let mut add_abs = |abs: u64| {
        if abs >= group_start {
            let rel = abs - group_start;
            if rel < u64::from(blocks_in_group) {
                #[allow(clippy::cast_possible_truncation)]
                reserved.push(rel as u32);
            }
        }
    };

    add_abs(state.block_bitmap.0);
    add_abs(state.inode_bitmap.0);
    for i in 0..u64::from(geo.inode_table_blocks()) {
        add_abs(state.inode_table.0 + i);
    }

    reserved.sort_unstable();
    reserved.dedup();
    reserved
}

pub(crate) fn is_reserved(reserved: &[u32], rel_block: u32) -> bool {
    reserved.binary_search(&rel_block).is_ok()
}

// ── Free-count verification ─────────────────────────────────────────────────

/// Cross-check the three levels of free accounting: bitmap population,
/// per-group counters, and the global atomics. Any divergence is a
/// consistency violation.
pub fn verify_free_counts(alloc: &Allocator, engine: &dyn JournalEngine) -> Result<()> {
    let geo = alloc.geometry();
    let mut blocks_total = 0_u64;
    let mut inodes_total = 0_u64;

    for slot in alloc.slots() {
        let group = slot.group();
        let state = slot.snapshot();

        let block_bits = geo.blocks_in_group(group);
        let bitmap = engine.read_block(state.block_bitmap)?;
        let bitmap_free = bitmap_count_free(bitmap.as_slice(), block_bits);
        if bitmap_free != state.free_blocks {
            return Err(JextError::Corruption {
                block: state.block_bitmap.0,
                detail: format!(
                    "group {}: block bitmap has {bitmap_free} free, counter says {}",
                    group.0, state.free_blocks
                ),
            });
        }

        let inode_bits = geo.inodes_in_group(group);
        let bitmap = engine.read_block(state.inode_bitmap)?;
        let bitmap_free = bitmap_count_free(bitmap.as_slice(), inode_bits);
        if bitmap_free != state.free_inodes {
            return Err(JextError::Corruption {
                block: state.inode_bitmap.0,
                detail: format!(
                    "group {}: inode bitmap has {bitmap_free} free, counter says {}",
                    group.0, state.free_inodes
                ),
            });
        }

        blocks_total += u64::from(state.free_blocks);
        inodes_total += u64::from(state.free_inodes);
    }

    if blocks_total != alloc.free_blocks() {
        return Err(JextError::Corruption {
            block: 0,
            detail: format!(
                "global free-block counter {} != per-group sum {blocks_total}",
                alloc.free_blocks()
            ),
        });
    }
    if inodes_total != alloc.free_inodes() {
        return Err(JextError::Corruption {
            block: 0,
            detail: format!(
                "global free-inode counter {} != per-group sum {inodes_total}",
                alloc.free_inodes()
            ),
        });
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_get_set_clear() {
        let mut bm = vec![0_u8; 4];
        assert!(!bitmap_get(&bm, 0));
        bitmap_set(&mut bm, 0);
        assert!(bitmap_get(&bm, 0));
        bitmap_clear(&mut bm, 0);
        assert!(!bitmap_get(&bm, 0));

        bitmap_set(&mut bm, 7);
        assert!(bitmap_get(&bm, 7));
        assert_eq!(bm[0], 0x80);

        bitmap_set(&mut bm, 8);
        assert!(bitmap_get(&bm, 8));
        assert_eq!(bm[1], 0x01);
    }

    #[test]
    fn bitmap_count_free_partial_byte() {
        let mut bm = vec![0_u8; 2];
        bitmap_set(&mut bm, 0);
        bitmap_set(&mut bm, 5);
        bitmap_set(&mut bm, 12);
        assert_eq!(bitmap_count_free(&bm, 16), 13);
        // Bit 12 is past the first 10 bits.
        assert_eq!(bitmap_count_free(&bm, 10), 8);
    }

    #[test]
    fn bitmap_find_free_wraps() {
        let mut bm = vec![0xFF_u8; 2];
        bitmap_clear(&mut bm, 3);
        assert_eq!(bitmap_find_free(&bm, 16, 5), Some(3));
        assert_eq!(bitmap_find_free(&bm, 16, 2), Some(3));
        // Out-of-range start falls back to 0.
        assert_eq!(bitmap_find_free(&bm, 16, 99), Some(3));
    }

    #[test]
    fn bitmap_run_from_prefers_forward_then_restarts() {
        let mut bm = vec![0_u8; 4];
        // Occupy 10..=20 so a 4-run exists at 0 and at 21.
        for i in 10..=20 {
            bitmap_set(&mut bm, i);
        }
        assert_eq!(bitmap_find_run_from(&bm, 32, 4, 12), Some(21));
        // From 30 the tail has no 4-run; restart finds bit 0.
        assert_eq!(bitmap_find_run_from(&bm, 32, 4, 30), Some(0));
        // Impossible length.
        assert_eq!(bitmap_find_run_from(&bm, 32, 33, 0), None);
    }

    #[test]
    fn bitmap_longest_run_capped() {
        let mut bm = vec![0_u8; 4];
        for i in 0..32 {
            // Free runs: [4..10) len 6 and [14..17) len 3.
            if !(4..10).contains(&i) && !(14..17).contains(&i) {
                bitmap_set(&mut bm, i);
            }
        }
        assert_eq!(bitmap_longest_run(&bm, 32, 32), Some((4, 6)));
        assert_eq!(bitmap_longest_run(&bm, 32, 4), Some((4, 4)));

        let full = vec![0xFF_u8; 4];
        assert_eq!(bitmap_longest_run(&full, 32, 8), None);
    }

    fn test_geo() -> FsGeometry {
        FsGeometry {
            block_size: jext_types::BlockSize::new(1024).expect("block size"),
            blocks_per_group: 1024,
            inodes_per_group: 128,
            total_blocks: 2049,
            total_inodes: 256,
            first_data_block: 1,
            group_count: 2,
            inode_size: 128,
        }
    }

    fn test_descs() -> Vec<GroupDesc> {
        vec![
            GroupDesc {
                block_bitmap: 3,
                inode_bitmap: 4,
                inode_table: 5,
                free_blocks_count: 1000,
                free_inodes_count: 117,
                used_dirs_count: 1,
            },
            GroupDesc {
                block_bitmap: 1025,
                inode_bitmap: 1026,
                inode_table: 1027,
                free_blocks_count: 1005,
                free_inodes_count: 128,
                used_dirs_count: 0,
            },
        ]
    }

    #[test]
    fn allocator_sums_counters_from_descriptors() {
        let alloc = Allocator::new(test_geo(), BlockNumber(2), &test_descs());
        assert_eq!(alloc.free_blocks(), 2005);
        assert_eq!(alloc.free_inodes(), 245);
        assert_eq!(alloc.group_count(), 2);

        let slot = alloc.slot(GroupNumber(1)).expect("slot");
        let state = slot.snapshot();
        assert_eq!(state.block_bitmap, BlockNumber(1025));
        assert_eq!(state.free_inodes, 128);

        assert!(alloc.slot(GroupNumber(2)).is_err());
    }

    #[test]
    fn add_group_publishes_new_slot() {
        let alloc = Allocator::new(test_geo(), BlockNumber(2), &test_descs());
        let mut new_geo = test_geo();
        new_geo.group_count = 3;
        new_geo.total_blocks += 1024;
        new_geo.total_inodes += 128;
        let desc = GroupDesc {
            block_bitmap: 2049,
            inode_bitmap: 2050,
            inode_table: 2051,
            free_blocks_count: 1005,
            free_inodes_count: 128,
            used_dirs_count: 0,
        };
        alloc.add_group(new_geo.clone(), &desc).expect("add group");
        assert_eq!(alloc.group_count(), 3);
        assert_eq!(alloc.free_blocks(), 2005 + 1005);
        assert_eq!(alloc.geometry(), new_geo);

        // A second add with a stale group_count is rejected.
        let stale = alloc.add_group(new_geo, &desc);
        assert!(matches!(stale, Err(JextError::InvalidGeometry(_))));
    }

    #[test]
    fn reserved_set_covers_bitmaps_and_inode_table() {
        let geo = test_geo();
        let state = GroupState {
            block_bitmap: BlockNumber(3),
            inode_bitmap: BlockNumber(4),
            inode_table: BlockNumber(5),
            free_blocks: 1000,
            free_inodes: 117,
            used_dirs: 1,
        };
        // Inode table: 128 inodes * 128 bytes / 1024 = 16 blocks (5..21).
        let reserved = reserved_blocks_in_group(&geo, &state, GroupNumber(0));
        assert!(is_reserved(&reserved, 2)); // abs 3, rel 2
        assert!(is_reserved(&reserved, 3));
        assert!(is_reserved(&reserved, 4)); // table start, abs 5
        assert!(is_reserved(&reserved, 19)); // table end, abs 20
        assert!(!is_reserved(&reserved, 20));
        assert_eq!(reserved.len(), 18);
    }
}
