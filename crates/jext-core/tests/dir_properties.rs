#![forbid(unsafe_code)]
//! Directory behavior under both layouts, end to end.
//!
//! Scenarios:
//! 1. An indexed directory and a linear one answer every lookup and
//!    enumeration identically, including crafted full-hash collisions
//!    and removals.
//! 2. Lookup cost stays flat as the directory grows: the hash index
//!    reads a bounded number of blocks per lookup.
//! 3. A readdir cursor survives inserts between batches without
//!    repeating or losing entries.
//! 4. Name validation rejects what the on-disk format cannot hold.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use jext_block::{CountingBlockDevice, MemBlockDevice};
use jext_core::{format, DirCursor, Filesystem, FormatOptions, MountOptions};
use jext_error::JextError;
use jext_journal::{JournalEngine, MemJournal};
use jext_ondisk::htree::HashVersion;
use jext_types::InodeNumber;

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn mounted_with_index(index: bool) -> Filesystem {
    let device = Arc::new(MemBlockDevice::new(1024, 4096));
    let opts = FormatOptions {
        hash_version: HashVersion::Legacy,
        ..FormatOptions::default()
    };
    format(device.as_ref(), &opts).expect("format");
    let journal = Arc::new(MemJournal::new(device.clone(), 4096));
    let options = MountOptions {
        dir_index_override: Some(index),
        ..MountOptions::default()
    };
    Filesystem::mount(device, journal, &options).expect("mount")
}

fn collect_names(fs: &Filesystem, dir: InodeNumber) -> Vec<Vec<u8>> {
    let mut names = Vec::new();
    let mut cursor = DirCursor::START;
    loop {
        let chunk = fs.dir_readdir(dir, cursor).expect("readdir");
        for item in &chunk.entries {
            names.push(item.entry.name.clone());
        }
        if chunk.next.is_end() {
            break;
        }
        cursor = chunk.next;
    }
    names
}

// ---------------------------------------------------------------------------
// Scenario 1: layout equivalence
// ---------------------------------------------------------------------------

#[test]
fn indexed_and_linear_directories_answer_identically() {
    let indexed = mounted_with_index(true);
    let linear = mounted_with_index(false);

    // "AB" and "@R" collide on the full legacy hash; the index must
    // keep both distinguishable by name.
    let mut names: Vec<Vec<u8>> = (0..148).map(|i| format!("n{i:04}").into_bytes()).collect();
    names.push(b"AB".to_vec());
    names.push(b"@R".to_vec());

    let mut indexed_inos = BTreeMap::new();
    let mut linear_inos = BTreeMap::new();
    for name in &names {
        let a = indexed
            .create(InodeNumber::ROOT, name, 0o100644)
            .expect("create indexed");
        let b = linear
            .create(InodeNumber::ROOT, name, 0o100644)
            .expect("create linear");
        indexed_inos.insert(name.clone(), a);
        linear_inos.insert(name.clone(), b);
    }

    let root_flags = indexed.read_inode(InodeNumber::ROOT).expect("root").flags;
    assert_ne!(root_flags & jext_types::JEXT_INDEX_FL, 0, "index never built");
    let root_flags = linear.read_inode(InodeNumber::ROOT).expect("root").flags;
    assert_eq!(root_flags & jext_types::JEXT_INDEX_FL, 0, "linear dir got indexed");

    for name in &names {
        let a = indexed
            .dir_lookup(InodeNumber::ROOT, name)
            .expect("lookup")
            .expect("present");
        let b = linear
            .dir_lookup(InodeNumber::ROOT, name)
            .expect("lookup")
            .expect("present");
        assert_eq!(u64::from(a.inode), indexed_inos[name].0);
        assert_eq!(u64::from(b.inode), linear_inos[name].0);
    }

    let expected: BTreeSet<Vec<u8>> = names.iter().cloned().collect();
    let seen: BTreeSet<Vec<u8>> = collect_names(&indexed, InodeNumber::ROOT).into_iter().collect();
    assert_eq!(seen, expected);
    let seen: BTreeSet<Vec<u8>> = collect_names(&linear, InodeNumber::ROOT).into_iter().collect();
    assert_eq!(seen, expected);

    // Remove every third name, one collision partner among them.
    let mut removed = BTreeSet::new();
    for name in names.iter().step_by(3) {
        let a = indexed.unlink(InodeNumber::ROOT, name).expect("unlink indexed");
        let b = linear.unlink(InodeNumber::ROOT, name).expect("unlink linear");
        assert!(indexed.evict_inode(a).expect("evict"));
        assert!(linear.evict_inode(b).expect("evict"));
        removed.insert(name.clone());
    }
    let gone = indexed.unlink(InodeNumber::ROOT, b"AB").expect("unlink AB");
    assert!(indexed.evict_inode(gone).expect("evict"));
    let gone = linear.unlink(InodeNumber::ROOT, b"AB").expect("unlink AB");
    assert!(linear.evict_inode(gone).expect("evict"));
    removed.insert(b"AB".to_vec());

    for name in &names {
        let a = indexed.dir_lookup(InodeNumber::ROOT, name).expect("lookup");
        let b = linear.dir_lookup(InodeNumber::ROOT, name).expect("lookup");
        assert_eq!(a.is_some(), !removed.contains(name), "indexed disagreed on {name:?}");
        assert_eq!(b.is_some(), !removed.contains(name), "linear disagreed on {name:?}");
    }
    // The surviving collision partner still resolves in both.
    assert!(indexed
        .dir_lookup(InodeNumber::ROOT, b"@R")
        .expect("lookup")
        .is_some());
    assert!(linear
        .dir_lookup(InodeNumber::ROOT, b"@R")
        .expect("lookup")
        .is_some());

    let expected: BTreeSet<Vec<u8>> = names
        .iter()
        .filter(|name| !removed.contains(*name))
        .cloned()
        .collect();
    let seen: BTreeSet<Vec<u8>> = collect_names(&indexed, InodeNumber::ROOT).into_iter().collect();
    assert_eq!(seen, expected);
    let seen: BTreeSet<Vec<u8>> = collect_names(&linear, InodeNumber::ROOT).into_iter().collect();
    assert_eq!(seen, expected);

    indexed.verify_counters().expect("counters");
    linear.verify_counters().expect("counters");
}

// ---------------------------------------------------------------------------
// Scenario 2: bounded lookup cost
// ---------------------------------------------------------------------------

fn lookup_read_cost(population: usize) -> u64 {
    let device = Arc::new(CountingBlockDevice::new(MemBlockDevice::new(1024, 8192)));
    format(device.as_ref(), &FormatOptions::default()).expect("format");
    let journal = Arc::new(MemJournal::new(device.clone(), 4096));
    let fs = Filesystem::mount(device.clone(), journal.clone(), &MountOptions::default())
        .expect("mount");

    let mut last = Vec::new();
    for i in 0..population {
        last = format!("f{i:04}").into_bytes();
        fs.create(InodeNumber::ROOT, &last, 0o100644).expect("create");
    }
    journal.force_commit().expect("commit");

    device.reset();
    let hit = fs
        .dir_lookup(InodeNumber::ROOT, &last)
        .expect("lookup")
        .expect("present");
    assert_ne!(hit.inode, 0);
    device.reads()
}

#[test]
fn lookup_reads_stay_bounded_as_the_directory_grows() {
    let small = lookup_read_cost(40);
    let large = lookup_read_cost(400);

    assert!(small <= 8, "small directory lookup read {small} blocks");
    assert!(large <= 8, "large directory lookup read {large} blocks");
    assert!(
        large <= small + 2,
        "lookup cost grew with the directory: {small} -> {large}"
    );
}

// ---------------------------------------------------------------------------
// Scenario 3: cursor stability across growth
// ---------------------------------------------------------------------------

#[test]
fn readdir_cursor_survives_inserts_between_batches() {
    let fs = mounted_with_index(true);
    let originals: Vec<Vec<u8>> = (0..120).map(|i| format!("orig{i:03}").into_bytes()).collect();
    for name in &originals {
        fs.create(InodeNumber::ROOT, name, 0o100644).expect("create");
    }

    let first = fs.dir_readdir(InodeNumber::ROOT, DirCursor::START).expect("readdir");
    assert!(!first.entries.is_empty());
    assert!(!first.next.is_end(), "expected more than one batch");

    // Grow the directory between batches; leaf splits may move entries,
    // but their hashes, and so their cursor positions, do not change.
    for i in 0..30 {
        let name = format!("late{i:02}").into_bytes();
        fs.create(InodeNumber::ROOT, &name, 0o100644).expect("create");
    }

    let mut seen: BTreeMap<Vec<u8>, u32> = BTreeMap::new();
    for item in &first.entries {
        *seen.entry(item.entry.name.clone()).or_insert(0) += 1;
    }
    let mut cursor = first.next;
    while !cursor.is_end() {
        let chunk = fs.dir_readdir(InodeNumber::ROOT, cursor).expect("readdir");
        for item in &chunk.entries {
            *seen.entry(item.entry.name.clone()).or_insert(0) += 1;
        }
        cursor = chunk.next;
    }

    for name in &originals {
        assert_eq!(
            seen.get(name).copied(),
            Some(1),
            "entry {name:?} not returned exactly once"
        );
    }
    for (name, count) in &seen {
        assert_eq!(*count, 1, "entry {name:?} repeated");
    }
}

// ---------------------------------------------------------------------------
// Scenario 4: name validation
// ---------------------------------------------------------------------------

#[test]
fn hostile_names_are_rejected_at_the_boundary() {
    let fs = mounted_with_index(true);

    let err = fs.create(InodeNumber::ROOT, b"", 0o100644).unwrap_err();
    assert!(matches!(err, JextError::Format(_)), "got {err}");

    let long = vec![b'x'; 256];
    let err = fs.create(InodeNumber::ROOT, &long, 0o100644).unwrap_err();
    assert!(matches!(err, JextError::NameTooLong), "got {err}");

    let err = fs.create(InodeNumber::ROOT, b"a/b", 0o100644).unwrap_err();
    assert!(matches!(err, JextError::Format(_)), "got {err}");

    let err = fs.create(InodeNumber::ROOT, b"a\0b", 0o100644).unwrap_err();
    assert!(matches!(err, JextError::Format(_)), "got {err}");

    // Exactly at the limit is fine.
    let max = vec![b'y'; 255];
    let ino = fs.create(InodeNumber::ROOT, &max, 0o100644).expect("create");
    let hit = fs
        .dir_lookup(InodeNumber::ROOT, &max)
        .expect("lookup")
        .expect("present");
    assert_eq!(u64::from(hit.inode), ino.0);

    fs.verify_counters().expect("counters");
}
