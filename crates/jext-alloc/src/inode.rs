//! Inode allocation: spread directories, cluster files.
//!
//! New directories go to the group with the most free inodes among a
//! small candidate set around the parent, balancing load while keeping
//! some locality. New files stick to the parent directory's group when it
//! still has room for data blocks; a group that can hold the inode but
//! none of its data is used only as a last resort.

use crate::{
    bitmap_clear, bitmap_find_free, bitmap_get, bitmap_set, gdt_block_of, update_group_desc,
    Allocator, InodeAlloc,
};
use jext_error::{JextError, Result};
use jext_journal::{AccessKind, Txn};
use jext_types::{FsGeometry, GroupNumber, InodeNumber};

/// Groups considered when placing a new directory.
pub const DIR_CANDIDATE_GROUPS: u32 = 4;

/// Allocate an inode for a child of a directory living in `parent_group`.
pub fn allocate_inode(
    alloc: &Allocator,
    txn: &mut Txn<'_>,
    parent_group: GroupNumber,
    is_directory: bool,
) -> Result<InodeAlloc> {
    let geo = alloc.geometry();
    let order = if is_directory {
        directory_candidates(alloc, parent_group)
    } else {
        file_candidates(alloc, parent_group)
    };

    for group in order {
        if let Some(got) = try_inode_in_group(alloc, txn, &geo, group, is_directory)? {
            tracing::debug!(
                target: "jext::ialloc",
                ino = got.ino.0,
                group = got.group.0,
                is_directory,
                "inode_allocated"
            );
            return Ok(got);
        }
    }
    Err(JextError::NoSpace)
}

/// Candidate groups for a directory: the parent's group and its
/// successors, most free inodes first. Equal counts resolve to the lower
/// group number.
fn directory_candidates(alloc: &Allocator, parent: GroupNumber) -> Vec<GroupNumber> {
    let total = alloc.group_count().max(1);
    let span = DIR_CANDIDATE_GROUPS.min(total);
    let mut candidates: Vec<(u32, GroupNumber)> = (0..span)
        .map(|step| GroupNumber((parent.0 + step) % total))
        .map(|group| {
            let free = alloc
                .slot(group)
                .map_or(0, |slot| slot.snapshot().free_inodes);
            (free, group)
        })
        .collect();
    candidates.sort_by(|(free_a, group_a), (free_b, group_b)| {
        free_b.cmp(free_a).then(group_a.0.cmp(&group_b.0))
    });
    candidates.into_iter().map(|(_, group)| group).collect()
}

/// Candidate groups for a file: parent first, then the wrap scan, all
/// requiring room for data blocks too; groups that could hold only the
/// inode come last.
fn file_candidates(alloc: &Allocator, parent: GroupNumber) -> Vec<GroupNumber> {
    let total = alloc.group_count().max(1);
    let snapshot_of = |group: GroupNumber| alloc.slot(group).ok().map(|slot| slot.snapshot());

    let mut order = Vec::new();
    for step in 0..total {
        let group = GroupNumber((parent.0 + step) % total);
        if let Some(snap) = snapshot_of(group) {
            if snap.free_inodes > 0 && snap.free_blocks > 0 {
                order.push(group);
            }
        }
    }
    for step in 0..total {
        let group = GroupNumber((parent.0 + step) % total);
        if order.contains(&group) {
            continue;
        }
        if let Some(snap) = snapshot_of(group) {
            if snap.free_inodes > 0 {
                order.push(group);
            }
        }
    }
    order
}

/// Grab the first free inode bit in `group`. `Ok(None)` means the group
/// had nothing usable after all and the caller should try the next one.
fn try_inode_in_group(
    alloc: &Allocator,
    txn: &mut Txn<'_>,
    geo: &FsGeometry,
    group: GroupNumber,
    is_directory: bool,
) -> Result<Option<InodeAlloc>> {
    let slot = alloc.slot(group)?;
    if slot.snapshot().free_inodes == 0 {
        return Ok(None);
    }

    let bitmap_block = slot.snapshot().inode_bitmap;
    let gdt_block = gdt_block_of(geo, alloc.gdt_start(), group);

    // Warm the journal's view before locking the group.
    txn.declare(bitmap_block, AccessKind::Read)?;
    let _ = txn.read(bitmap_block)?;
    txn.declare(gdt_block, AccessKind::Read)?;
    let _ = txn.read(gdt_block)?;

    let mut state = slot.lock();
    if state.free_inodes == 0 {
        return Ok(None);
    }

    let bits = geo.inodes_in_group(group);
    let mut bitmap = txn.read(state.inode_bitmap)?.to_vec();
    let Some(idx) = bitmap_find_free(&bitmap, bits, 0) else {
        // Counter said otherwise; let the caller move on and the
        // consistency check flag the drift.
        return Ok(None);
    };

    let ino = InodeNumber(
        u64::from(group.0) * u64::from(geo.inodes_per_group) + u64::from(idx) + 1,
    );
    if ino.0 < InodeNumber::FIRST_USER.0 {
        return Err(JextError::Corruption {
            block: state.inode_bitmap.0,
            detail: format!("reserved inode {} is clear in the bitmap", ino.0),
        });
    }

    txn.declare(state.inode_bitmap, AccessKind::Write)?;
    bitmap_set(&mut bitmap, idx);
    txn.dirty(state.inode_bitmap, &bitmap)?;

    let new_free = state
        .free_inodes
        .checked_sub(1)
        .ok_or_else(|| JextError::Corruption {
            block: state.inode_bitmap.0,
            detail: format!("group {}: free-inode counter underflow", group.0),
        })?;
    let new_dirs = if is_directory {
        state.used_dirs + 1
    } else {
        state.used_dirs
    };
    let desc_free = counter_to_desc(new_free, gdt_block.0, group)?;
    let desc_dirs = counter_to_desc(new_dirs, gdt_block.0, group)?;
    update_group_desc(txn, geo, alloc.gdt_start(), group, |desc| {
        desc.free_inodes_count = desc_free;
        desc.used_dirs_count = desc_dirs;
    })?;

    state.free_inodes = new_free;
    state.used_dirs = new_dirs;
    alloc.note_inode_allocated();

    Ok(Some(InodeAlloc { ino, group }))
}

/// Release `ino`'s bitmap bit and counters. The caller has already
/// confirmed the link count and open-reference count are both zero.
pub fn free_inode(
    alloc: &Allocator,
    txn: &mut Txn<'_>,
    ino: InodeNumber,
    was_directory: bool,
) -> Result<()> {
    let geo = alloc.geometry();
    if !geo.inode_in_range(ino) || ino.0 < InodeNumber::FIRST_USER.0 {
        return Err(JextError::Corruption {
            block: 0,
            detail: format!("freeing out-of-range inode {}", ino.0),
        });
    }
    let group = geo.inode_group(ino);
    let idx = geo.inode_index_in_group(ino);
    let slot = alloc.slot(group)?;
    let bitmap_block = slot.snapshot().inode_bitmap;
    let gdt_block = gdt_block_of(&geo, alloc.gdt_start(), group);

    txn.declare(bitmap_block, AccessKind::Write)?;
    let _ = txn.read(bitmap_block)?;
    txn.declare(gdt_block, AccessKind::Read)?;
    let _ = txn.read(gdt_block)?;

    let mut state = slot.lock();
    let mut bitmap = txn.read(state.inode_bitmap)?.to_vec();
    if !bitmap_get(&bitmap, idx) {
        return Err(JextError::Corruption {
            block: state.inode_bitmap.0,
            detail: format!("double free of inode {}", ino.0),
        });
    }
    bitmap_clear(&mut bitmap, idx);
    txn.dirty(state.inode_bitmap, &bitmap)?;

    let new_free = state
        .free_inodes
        .checked_add(1)
        .ok_or_else(|| JextError::Corruption {
            block: state.inode_bitmap.0,
            detail: format!("group {}: free-inode counter overflow", group.0),
        })?;
    let new_dirs = if was_directory {
        state
            .used_dirs
            .checked_sub(1)
            .ok_or_else(|| JextError::Corruption {
                block: gdt_block.0,
                detail: format!("group {}: directory counter underflow", group.0),
            })?
    } else {
        state.used_dirs
    };
    let desc_free = counter_to_desc(new_free, gdt_block.0, group)?;
    let desc_dirs = counter_to_desc(new_dirs, gdt_block.0, group)?;
    update_group_desc(txn, &geo, alloc.gdt_start(), group, |desc| {
        desc.free_inodes_count = desc_free;
        desc.used_dirs_count = desc_dirs;
    })?;

    state.free_inodes = new_free;
    state.used_dirs = new_dirs;
    alloc.note_inode_freed();

    tracing::debug!(
        target: "jext::ialloc",
        ino = ino.0,
        group = group.0,
        was_directory,
        "inode_freed"
    );
    Ok(())
}

fn counter_to_desc(value: u32, gdt_block: u64, group: GroupNumber) -> Result<u16> {
    u16::try_from(value).map_err(|_| JextError::Corruption {
        block: gdt_block,
        detail: format!("group {}: counter {value} overflows its descriptor", group.0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use jext_block::{BlockDevice, MemBlockDevice};
    use jext_journal::{JournalEngine, MemJournal};
    use jext_ondisk::group::GroupDesc;
    use jext_types::{BlockNumber, BlockSize};
    use std::sync::Arc;

    const BS: u32 = 1024;

    fn geometry(groups: u32) -> FsGeometry {
        FsGeometry {
            block_size: BlockSize::new(BS).expect("block size"),
            blocks_per_group: 1024,
            inodes_per_group: 128,
            total_blocks: 1 + 1024 * u64::from(groups),
            total_inodes: 128 * groups,
            first_data_block: 1,
            group_count: groups,
            inode_size: 128,
        }
    }

    /// Two groups. Group 0 holds the ten reserved inodes; per-group free
    /// counts and block headroom come from `descs`.
    fn fixture(descs: [GroupDesc; 2]) -> (Arc<MemBlockDevice>, MemJournal, Allocator) {
        let dev = Arc::new(MemBlockDevice::new(BS, 2049));

        let mut bitmap0 = vec![0_u8; BS as usize];
        for bit in 0..(128 - u32::from(descs[0].free_inodes_count)) {
            bitmap_set(&mut bitmap0, bit);
        }
        dev.write_block(BlockNumber(4), &bitmap0).expect("bitmap 0");

        let mut bitmap1 = vec![0_u8; BS as usize];
        for bit in 0..(128 - u32::from(descs[1].free_inodes_count)) {
            bitmap_set(&mut bitmap1, bit);
        }
        dev.write_block(BlockNumber(1026), &bitmap1).expect("bitmap 1");

        let mut gdt = vec![0_u8; BS as usize];
        for (idx, desc) in descs.iter().enumerate() {
            desc.encode_into(&mut gdt[idx * 32..]).expect("encode");
        }
        dev.write_block(BlockNumber(2), &gdt).expect("gdt");

        let journal = MemJournal::new(dev.clone(), 1024);
        let alloc = Allocator::new(geometry(2), BlockNumber(2), &descs);
        (dev, journal, alloc)
    }

    fn desc(bitmaps: (u32, u32, u32), free_blocks: u16, free_inodes: u16, dirs: u16) -> GroupDesc {
        GroupDesc {
            block_bitmap: bitmaps.0,
            inode_bitmap: bitmaps.1,
            inode_table: bitmaps.2,
            free_blocks_count: free_blocks,
            free_inodes_count: free_inodes,
            used_dirs_count: dirs,
        }
    }

    fn g0(free_blocks: u16, free_inodes: u16, dirs: u16) -> GroupDesc {
        desc((3, 4, 5), free_blocks, free_inodes, dirs)
    }

    fn g1(free_blocks: u16, free_inodes: u16, dirs: u16) -> GroupDesc {
        desc((1025, 1026, 1027), free_blocks, free_inodes, dirs)
    }

    #[test]
    fn file_prefers_the_parent_group() {
        let (_dev, journal, alloc) = fixture([g0(1003, 118, 1), g1(1005, 128, 0)]);
        let mut txn = Txn::start(&journal, 8).expect("start");

        let got =
            allocate_inode(&alloc, &mut txn, GroupNumber(0), false).expect("alloc");
        // First free bit after the ten reserved inodes.
        assert_eq!(got.ino, InodeNumber(11));
        assert_eq!(got.group, GroupNumber(0));
        assert_eq!(alloc.free_inodes(), 117 + 128);
        txn.stop().expect("stop");
    }

    #[test]
    fn file_skips_a_group_with_no_data_room() {
        let (_dev, journal, alloc) = fixture([g0(0, 118, 1), g1(1005, 128, 0)]);
        let mut txn = Txn::start(&journal, 8).expect("start");

        let got =
            allocate_inode(&alloc, &mut txn, GroupNumber(0), false).expect("alloc");
        assert_eq!(got.group, GroupNumber(1));
        assert_eq!(got.ino, InodeNumber(129));
        txn.stop().expect("stop");
    }

    #[test]
    fn file_desperation_takes_an_inode_without_data_room() {
        let (_dev, journal, alloc) = fixture([g0(0, 0, 1), g1(0, 128, 0)]);
        let mut txn = Txn::start(&journal, 8).expect("start");

        let got =
            allocate_inode(&alloc, &mut txn, GroupNumber(0), false).expect("alloc");
        assert_eq!(got.group, GroupNumber(1));
        assert_eq!(got.ino, InodeNumber(129));
        txn.stop().expect("stop");
    }

    #[test]
    fn directory_goes_to_the_emptiest_candidate() {
        let (_dev, journal, alloc) = fixture([g0(1003, 50, 1), g1(1005, 128, 0)]);
        let mut txn = Txn::start(&journal, 8).expect("start");

        let got = allocate_inode(&alloc, &mut txn, GroupNumber(0), true).expect("alloc");
        assert_eq!(got.group, GroupNumber(1));
        assert_eq!(got.ino, InodeNumber(129));

        let snap = alloc.slot(GroupNumber(1)).expect("slot").snapshot();
        assert_eq!(snap.used_dirs, 1);
        assert_eq!(snap.free_inodes, 127);
        txn.stop().expect("stop");
    }

    #[test]
    fn alloc_free_roundtrip_restores_counters() {
        let (_dev, journal, alloc) = fixture([g0(1003, 118, 1), g1(1005, 128, 0)]);
        let mut txn = Txn::start(&journal, 8).expect("start");

        let got = allocate_inode(&alloc, &mut txn, GroupNumber(1), true).expect("alloc");
        assert_eq!(got.ino, InodeNumber(129));
        free_inode(&alloc, &mut txn, got.ino, true).expect("free");

        let snap = alloc.slot(GroupNumber(1)).expect("slot").snapshot();
        assert_eq!(snap.free_inodes, 128);
        assert_eq!(snap.used_dirs, 0);
        assert_eq!(alloc.free_inodes(), 118 + 128);

        // The slot is reusable straight away.
        let again = allocate_inode(&alloc, &mut txn, GroupNumber(1), false).expect("alloc");
        assert_eq!(again.ino, InodeNumber(129));
        txn.stop().expect("stop");
    }

    #[test]
    fn descriptor_counters_survive_commit() {
        let (_dev, journal, alloc) = fixture([g0(1003, 118, 1), g1(1005, 128, 0)]);
        let mut txn = Txn::start(&journal, 8).expect("start");
        allocate_inode(&alloc, &mut txn, GroupNumber(0), true).expect("alloc");
        txn.stop().expect("stop");
        journal.force_commit().expect("commit");

        let gdt = journal.read_block(BlockNumber(2)).expect("gdt");
        let desc = GroupDesc::parse_from_bytes(gdt.as_slice()).expect("parse");
        assert_eq!(desc.free_inodes_count, 117);
        assert_eq!(desc.used_dirs_count, 2);
    }

    #[test]
    fn double_free_is_corruption() {
        let (_dev, journal, alloc) = fixture([g0(1003, 118, 1), g1(1005, 128, 0)]);
        let mut txn = Txn::start(&journal, 8).expect("start");

        let got = allocate_inode(&alloc, &mut txn, GroupNumber(0), false).expect("alloc");
        free_inode(&alloc, &mut txn, got.ino, false).expect("free");
        let err = free_inode(&alloc, &mut txn, got.ino, false).expect_err("double free");
        assert!(matches!(err, JextError::Corruption { .. }), "got {err:?}");

        let err = free_inode(&alloc, &mut txn, InodeNumber(9999), false)
            .expect_err("out of range");
        assert!(matches!(err, JextError::Corruption { .. }), "got {err:?}");
    }

    #[test]
    fn exhausted_volume_reports_nospace() {
        let (_dev, journal, alloc) = fixture([g0(1003, 0, 1), g1(1005, 0, 0)]);
        let mut txn = Txn::start(&journal, 8).expect("start");
        let err = allocate_inode(&alloc, &mut txn, GroupNumber(0), false)
            .expect_err("no inodes anywhere");
        assert!(matches!(err, JextError::NoSpace), "got {err:?}");
        txn.abort().expect("abort");
    }

    #[test]
    fn clear_reserved_bit_is_corruption() {
        let (dev, _journal, alloc) = fixture([g0(1003, 118, 1), g1(1005, 128, 0)]);
        // Inode 6 is reserved but its bit reads free.
        let mut bitmap0 = vec![0_u8; BS as usize];
        for bit in 0..10 {
            if bit != 5 {
                bitmap_set(&mut bitmap0, bit);
            }
        }
        dev.write_block(BlockNumber(4), &bitmap0).expect("bitmap 0");

        let journal = MemJournal::new(dev.clone(), 1024);
        let mut txn = Txn::start(&journal, 8).expect("start");
        let err = allocate_inode(&alloc, &mut txn, GroupNumber(0), false)
            .expect_err("reserved bit must not be handed out");
        assert!(matches!(err, JextError::Corruption { .. }), "got {err:?}");
    }
}
