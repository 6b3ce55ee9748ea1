#![forbid(unsafe_code)]
//! Crash, orphan, and error-policy recovery, end to end.
//!
//! Scenarios:
//! 1. Committed work survives a crash; queued work vanishes with it.
//! 2. An open-but-deleted file left behind by a crash is reaped on the
//!    next writable mount.
//! 3. A metadata failure under `errors=remount-ro` fences writes,
//!    persists the error flag, and leaves reads working.
//! 4. The same failure under `errors=halt` stops the instance cold.
//! 5. A truncate that restarts at commit boundaries leaves a consistent
//!    image even when the tail of the work is lost.

use std::sync::Arc;

use jext_block::{BlockDevice, MemBlockDevice};
use jext_core::{format, Filesystem, FormatOptions, InodeRecord, MountOptions};
use jext_error::JextError;
use jext_journal::{JournalEngine, MemJournal};
use jext_ondisk::superblock::{ErrorsPolicy, Superblock, STATE_ORPHAN_PENDING};
use jext_ondisk::{GroupDesc, GROUP_DESC_SIZE};
use jext_types::{BlockNumber, InodeNumber};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn fresh_volume(blocks: u64) -> Arc<MemBlockDevice> {
    let device = Arc::new(MemBlockDevice::new(1024, blocks));
    format(device.as_ref(), &FormatOptions::default()).expect("format");
    device
}

fn mount_on(
    device: &Arc<MemBlockDevice>,
    capacity: u32,
    options: &MountOptions,
) -> (Arc<MemJournal>, Filesystem) {
    let journal = Arc::new(MemJournal::new(device.clone(), capacity));
    let fs = Filesystem::mount(device.clone(), journal.clone(), options).expect("mount");
    (journal, fs)
}

fn map_blocks(fs: &Filesystem, ino: InodeNumber, count: u64) {
    let mut txn = fs.begin(64).expect("txn");
    for logical in 0..count {
        fs.get_block(&mut txn, ino, logical, true)
            .expect("map")
            .expect("mapped");
    }
    txn.stop().expect("stop");
}

fn read_mapping(fs: &Filesystem, ino: InodeNumber, logical: u64) -> Option<BlockNumber> {
    let mut txn = fs.begin(0).expect("txn");
    let got = fs.get_block(&mut txn, ino, logical, false).expect("map");
    txn.stop().expect("stop");
    got
}

/// Point the victim's first block slot far past the device end, writing
/// straight to the backing store the way latent disk damage would.
fn corrupt_first_block_pointer(device: &MemBlockDevice, victim: InodeNumber) {
    let sb_buf = device.read_block(BlockNumber(1)).expect("superblock block");
    let sb = Superblock::parse_superblock_region(sb_buf.as_slice()).expect("superblock");
    let gdt_buf = device.read_block(BlockNumber(2)).expect("gdt block");
    let desc =
        GroupDesc::parse_from_bytes(&gdt_buf.as_slice()[..GROUP_DESC_SIZE]).expect("group desc");

    let inode_size = u64::from(sb.inode_size);
    let per_block = u64::from(sb.block_size.get()) / inode_size;
    let index = (victim.0 - 1) % u64::from(sb.inodes_per_group);
    let table_block = BlockNumber(u64::from(desc.inode_table) + index / per_block);
    let offset = usize::try_from((index % per_block) * inode_size).expect("offset");
    let span = usize::try_from(inode_size).expect("inode size");

    let mut bytes = device.read_block(table_block).expect("itable block").to_vec();
    let mut record =
        InodeRecord::parse_from_bytes(&bytes[offset..offset + span]).expect("inode record");
    record.block[0] = 0x0FFF_FFF0;
    record
        .encode_into(&mut bytes[offset..offset + span])
        .expect("encode");
    device.write_block(table_block, &bytes).expect("write back");
}

// ---------------------------------------------------------------------------
// Scenario 1: crash durability line
// ---------------------------------------------------------------------------

#[test]
fn committed_work_survives_a_crash_and_queued_work_does_not() {
    let device = fresh_volume(2048);
    let (journal, fs) = mount_on(&device, 4096, &MountOptions::default());

    let kept = fs
        .create(InodeNumber::ROOT, b"kept", 0o100644)
        .expect("create kept");
    fs.create(InodeNumber::ROOT, b"also-kept", 0o100644)
        .expect("create also-kept");
    map_blocks(&fs, kept, 6);
    journal.force_commit().expect("commit");

    fs.create(InodeNumber::ROOT, b"lost", 0o100644)
        .expect("create lost");
    journal.crash();
    drop(fs);

    let (_journal, fs) = mount_on(&device, 4096, &MountOptions::default());
    assert!(fs
        .dir_lookup(InodeNumber::ROOT, b"kept")
        .expect("lookup")
        .is_some());
    assert!(fs
        .dir_lookup(InodeNumber::ROOT, b"also-kept")
        .expect("lookup")
        .is_some());
    assert!(
        fs.dir_lookup(InodeNumber::ROOT, b"lost")
            .expect("lookup")
            .is_none(),
        "uncommitted create came back from the dead"
    );
    for logical in 0..6 {
        assert!(
            read_mapping(&fs, kept, logical).is_some(),
            "committed mapping lost at logical {logical}"
        );
    }
    fs.verify_counters().expect("counters");
}

// ---------------------------------------------------------------------------
// Scenario 2: orphan reaping
// ---------------------------------------------------------------------------

#[test]
fn orphaned_file_is_reaped_on_the_next_mount() {
    let device = fresh_volume(2048);
    let (journal, fs) = mount_on(&device, 4096, &MountOptions::default());
    let blocks_before = fs.free_block_count();
    let inodes_before = fs.free_inode_count();

    let doomed = fs
        .create(InodeNumber::ROOT, b"doomed", 0o100644)
        .expect("create");
    map_blocks(&fs, doomed, 8);

    // Last link gone while the file is still open: the inode moves to
    // the orphan table instead of being freed.
    let gone = fs.unlink(InodeNumber::ROOT, b"doomed").expect("unlink");
    assert_eq!(gone, doomed);
    assert_ne!(fs.superblock().state & STATE_ORPHAN_PENDING, 0);
    journal.force_commit().expect("commit");
    journal.crash();
    drop(fs);

    let (_journal, fs) = mount_on(&device, 4096, &MountOptions::default());
    assert!(fs
        .dir_lookup(InodeNumber::ROOT, b"doomed")
        .expect("lookup")
        .is_none());
    assert_eq!(fs.free_block_count(), blocks_before, "orphan blocks not reclaimed");
    assert_eq!(fs.free_inode_count(), inodes_before, "orphan inode not reclaimed");
    assert_eq!(fs.superblock().state & STATE_ORPHAN_PENDING, 0);
    fs.verify_counters().expect("counters");
}

// ---------------------------------------------------------------------------
// Scenario 3: errors=remount-ro
// ---------------------------------------------------------------------------

#[test]
fn metadata_failure_fences_writes_under_remount_ro() {
    let device = fresh_volume(2048);
    let (_journal, fs) = mount_on(&device, 4096, &MountOptions::default());
    let victim = fs
        .create(InodeNumber::ROOT, b"victim", 0o100644)
        .expect("create");
    map_blocks(&fs, victim, 2);
    fs.unmount().expect("unmount");
    drop(fs);

    corrupt_first_block_pointer(&device, victim);

    let options = MountOptions {
        errors_override: Some(ErrorsPolicy::RemountReadOnly),
        ..MountOptions::default()
    };
    let (_journal, fs) = mount_on(&device, 4096, &options);
    let err = fs.truncate(victim, 0).unwrap_err();
    assert!(matches!(err, JextError::Corruption { .. }), "got {err}");

    assert!(fs.is_degraded());
    assert!(fs.superblock().has_error_flag());
    let err = fs
        .create(InodeNumber::ROOT, b"after", 0o100644)
        .unwrap_err();
    assert!(matches!(err, JextError::ReadOnly), "got {err}");
    // Reads keep working on the fenced mount.
    assert!(fs
        .dir_lookup(InodeNumber::ROOT, b"victim")
        .expect("lookup")
        .is_some());
    drop(fs);

    // The flag went straight to the device, so a fresh mount sees it
    // even though the failing transaction never committed.
    let (_journal, fs) = mount_on(&device, 4096, &MountOptions::default());
    assert!(fs.superblock().has_error_flag());
    fs.verify_counters().expect("counters");
}

// ---------------------------------------------------------------------------
// Scenario 4: errors=halt
// ---------------------------------------------------------------------------

#[test]
fn metadata_failure_halts_the_instance_under_halt() {
    let device = fresh_volume(2048);
    let (_journal, fs) = mount_on(&device, 4096, &MountOptions::default());
    let victim = fs
        .create(InodeNumber::ROOT, b"victim", 0o100644)
        .expect("create");
    map_blocks(&fs, victim, 2);
    fs.unmount().expect("unmount");
    drop(fs);

    corrupt_first_block_pointer(&device, victim);

    let options = MountOptions {
        errors_override: Some(ErrorsPolicy::Halt),
        ..MountOptions::default()
    };
    let (_journal, fs) = mount_on(&device, 4096, &options);
    let err = fs.truncate(victim, 0).unwrap_err();
    assert!(matches!(err, JextError::Corruption { .. }), "got {err}");

    assert!(fs.is_degraded());
    let err = fs
        .dir_lookup(InodeNumber::ROOT, b"victim")
        .unwrap_err();
    assert!(matches!(err, JextError::Halted), "reads must halt, got {err}");
    let err = fs
        .create(InodeNumber::ROOT, b"after", 0o100644)
        .unwrap_err();
    assert!(matches!(err, JextError::Halted), "writes must halt, got {err}");
}

// ---------------------------------------------------------------------------
// Scenario 5: interrupted truncate
// ---------------------------------------------------------------------------

#[test]
fn interrupted_truncate_leaves_a_consistent_image() {
    let device = fresh_volume(2048);
    // Capacity small enough that a 40-block truncate cannot fit in one
    // batch and must commit at restart boundaries.
    let (journal, fs) = mount_on(&device, 72, &MountOptions::default());
    let big = fs
        .create(InodeNumber::ROOT, b"big", 0o100644)
        .expect("create");
    let free_full = fs.free_block_count();
    map_blocks(&fs, big, 40);
    journal.force_commit().expect("commit");
    let free_mapped = fs.free_block_count();
    assert_eq!(free_mapped, free_full - 41);

    let seq_before = journal.committed_seq();
    fs.truncate(big, 0).expect("truncate");
    assert!(
        journal.committed_seq() > seq_before,
        "truncate never hit a commit boundary"
    );

    // Power loss before the tail of the truncate commits.
    journal.crash();
    drop(fs);

    let (_journal, fs) = mount_on(&device, 4096, &MountOptions::default());
    let record = fs.read_inode(big).expect("inode");
    assert_eq!(record.size, 0, "committed boundary lost the size cut");
    assert!(read_mapping(&fs, big, 0).is_none(), "pointer outlived the cut");

    // Blocks whose frees were queued but never committed stay leaked;
    // everything committed is consistent.
    let free_now = fs.free_block_count();
    assert!(free_now >= free_mapped, "recovered image lost blocks");
    assert!(free_now < free_full, "lost frees cannot reappear");
    fs.verify_counters().expect("counters");
}
