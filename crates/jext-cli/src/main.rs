#![forbid(unsafe_code)]
//! Volume image tools: format, inspect, per-group stats, and an offline
//! consistency check of the free-space accounting.

use std::env;
use std::path::Path;

use anyhow::{bail, Context, Result};
use jext_alloc::{bitmap_count_free, bitmap_get};
use jext_block::{
    read_superblock_region, BlockDevice, ByteBlockDevice, FileByteDevice,
};
use jext_core::{format, FormatOptions};
use jext_ondisk::htree::HashVersion;
use jext_ondisk::superblock::{
    ErrorsPolicy, Superblock, STATE_CLEAN, STATE_ERRORS, STATE_ORPHAN_PENDING,
};
use jext_ondisk::{GroupDesc, GROUP_DESC_SIZE};
use jext_types::{BlockNumber, FsGeometry, GroupNumber};
use serde::Serialize;

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "format" => {
            let Some(path) = args.next() else {
                bail!("format requires an image path");
            };
            let rest: Vec<String> = args.collect();
            let flags = FormatFlags::parse(&rest)?;
            format_cmd(Path::new(&path), &flags)
        }
        "inspect" => {
            let Some(path) = args.next() else {
                bail!("inspect requires an image path");
            };
            let json = args.any(|arg| arg == "--json");
            inspect_cmd(Path::new(&path), json)
        }
        "groups" => {
            let Some(path) = args.next() else {
                bail!("groups requires an image path");
            };
            let json = args.any(|arg| arg == "--json");
            groups_cmd(Path::new(&path), json)
        }
        "check" => {
            let Some(path) = args.next() else {
                bail!("check requires an image path");
            };
            let json = args.any(|arg| arg == "--json");
            check_cmd(Path::new(&path), json)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("jext volume tools\n");
    println!("USAGE:");
    println!("  jext format <image> [--blocks N] [--block-size BYTES] [--label NAME]");
    println!("  jext inspect <image> [--json]");
    println!("  jext groups <image> [--json]");
    println!("  jext check <image> [--json]");
}

// ── format ──────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct FormatFlags {
    blocks: Option<u64>,
    block_size: u32,
    label: String,
}

impl FormatFlags {
    fn parse(args: &[String]) -> Result<Self> {
        let mut flags = Self {
            blocks: None,
            block_size: 1024,
            label: String::new(),
        };
        let mut it = args.iter();
        while let Some(arg) = it.next() {
            match arg.as_str() {
                "--blocks" => {
                    let value = flag_value(&mut it, "--blocks")?;
                    flags.blocks = Some(value.parse().context("--blocks expects a number")?);
                }
                "--block-size" => {
                    let value = flag_value(&mut it, "--block-size")?;
                    flags.block_size = value.parse().context("--block-size expects a number")?;
                }
                "--label" => {
                    flags.label = flag_value(&mut it, "--label")?.clone();
                }
                _ => bail!("unknown format flag: {arg}"),
            }
        }
        Ok(flags)
    }
}

fn flag_value<'a>(
    it: &mut std::slice::Iter<'a, String>,
    flag: &str,
) -> Result<&'a String> {
    it.next().with_context(|| format!("{flag} requires a value"))
}

fn format_cmd(path: &Path, flags: &FormatFlags) -> Result<()> {
    let file = FileByteDevice::open(path)
        .with_context(|| format!("open image {}", path.display()))?;
    if !file.is_writable() {
        bail!("image {} is not writable", path.display());
    }
    let device = ByteBlockDevice::new(file, flags.block_size)
        .with_context(|| format!("image {} block geometry", path.display()))?;
    let opts = FormatOptions {
        blocks: flags.blocks,
        volume_name: flags.label.clone(),
        ..FormatOptions::default()
    };
    let sb = format(&device, &opts).context("format image")?;
    println!(
        "formatted {}: {} blocks of {} bytes, {} inodes, {} group(s)",
        path.display(),
        sb.blocks_count,
        sb.block_size.get(),
        sb.inodes_count,
        sb.geometry().map_or(0, |geo| geo.group_count),
    );
    Ok(())
}

// ── inspect ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct InspectOutput {
    block_size: u32,
    blocks_count: u32,
    inodes_count: u32,
    free_blocks: u32,
    free_inodes: u32,
    blocks_per_group: u32,
    inodes_per_group: u32,
    inode_size: u16,
    groups: u32,
    reserved_gdt_blocks: u16,
    orphan_table_block: u32,
    volume_name: String,
    uuid: String,
    state: Vec<&'static str>,
    errors_policy: &'static str,
    mount_count: u16,
    hash_version: Option<HashVersion>,
}

fn load_superblock(path: &Path) -> Result<(FileByteDevice, Superblock)> {
    let file = FileByteDevice::open(path)
        .with_context(|| format!("open image {}", path.display()))?;
    let region = read_superblock_region(&file)
        .with_context(|| format!("read superblock of {}", path.display()))?;
    let sb = Superblock::parse_superblock_region(&region)
        .with_context(|| format!("parse superblock of {}", path.display()))?;
    Ok((file, sb))
}

fn state_labels(state: u16) -> Vec<&'static str> {
    let mut labels = Vec::new();
    if state & STATE_CLEAN != 0 {
        labels.push("clean");
    }
    if state & STATE_ERRORS != 0 {
        labels.push("errors");
    }
    if state & STATE_ORPHAN_PENDING != 0 {
        labels.push("orphan-pending");
    }
    if labels.is_empty() {
        labels.push("in-use");
    }
    labels
}

fn policy_label(policy: ErrorsPolicy) -> &'static str {
    match policy {
        ErrorsPolicy::Continue => "continue",
        ErrorsPolicy::RemountReadOnly => "remount-ro",
        ErrorsPolicy::Halt => "halt",
    }
}

fn hex_uuid(uuid: &[u8; 16]) -> String {
    let mut out = String::with_capacity(32);
    for byte in uuid {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn inspect_cmd(path: &Path, json: bool) -> Result<()> {
    let (_file, sb) = load_superblock(path)?;
    let geo = sb.geometry().context("derive geometry")?;

    let output = InspectOutput {
        block_size: sb.block_size.get(),
        blocks_count: sb.blocks_count,
        inodes_count: sb.inodes_count,
        free_blocks: sb.free_blocks_count,
        free_inodes: sb.free_inodes_count,
        blocks_per_group: sb.blocks_per_group,
        inodes_per_group: sb.inodes_per_group,
        inode_size: sb.inode_size,
        groups: geo.group_count,
        reserved_gdt_blocks: sb.reserved_gdt_blocks,
        orphan_table_block: sb.orphan_table_block,
        volume_name: sb.volume_name.clone(),
        uuid: hex_uuid(&sb.uuid),
        state: state_labels(sb.state),
        errors_policy: policy_label(ErrorsPolicy::from_raw(sb.errors)),
        mount_count: sb.mnt_count,
        hash_version: HashVersion::from_raw(sb.def_hash_version),
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
        return Ok(());
    }

    println!("block_size: {}", output.block_size);
    println!("blocks_count: {}", output.blocks_count);
    println!("inodes_count: {}", output.inodes_count);
    println!("free_blocks: {}", output.free_blocks);
    println!("free_inodes: {}", output.free_inodes);
    println!("blocks_per_group: {}", output.blocks_per_group);
    println!("inodes_per_group: {}", output.inodes_per_group);
    println!("inode_size: {}", output.inode_size);
    println!("groups: {}", output.groups);
    println!("reserved_gdt_blocks: {}", output.reserved_gdt_blocks);
    println!("orphan_table_block: {}", output.orphan_table_block);
    println!("volume_name: {}", output.volume_name);
    println!("uuid: {}", output.uuid);
    println!("state: {}", output.state.join(","));
    println!("errors_policy: {}", output.errors_policy);
    println!("mount_count: {}", output.mount_count);
    match output.hash_version {
        Some(version) => println!("hash_version: {version:?}"),
        None => println!("hash_version: unknown ({})", sb.def_hash_version),
    }
    Ok(())
}

// ── groups ──────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct GroupRow {
    group: u32,
    start_block: u64,
    blocks: u32,
    inodes: u32,
    free_blocks: u16,
    free_inodes: u16,
    used_dirs: u16,
    block_bitmap: u32,
    inode_bitmap: u32,
    inode_table: u32,
}

/// Read descriptor `group` out of the on-disk descriptor table.
#[allow(clippy::cast_possible_truncation)]
fn read_descriptor(
    device: &dyn BlockDevice,
    geo: &FsGeometry,
    group: u32,
) -> Result<GroupDesc> {
    let per_block = geo.block_size.get() as usize / GROUP_DESC_SIZE;
    let gdt_start = u64::from(geo.first_data_block) + 1;
    let block = gdt_start + u64::from(group) / per_block as u64;
    let offset = (group as usize % per_block) * GROUP_DESC_SIZE;
    let buf = device
        .read_block(BlockNumber(block))
        .with_context(|| format!("read descriptor block {block}"))?;
    let desc = GroupDesc::parse_from_bytes(&buf.as_slice()[offset..offset + GROUP_DESC_SIZE])
        .with_context(|| format!("parse descriptor of group {group}"))?;
    Ok(desc)
}

fn open_block_device(path: &Path) -> Result<(ByteBlockDevice<FileByteDevice>, Superblock, FsGeometry)> {
    let (file, sb) = load_superblock(path)?;
    let geo = sb.geometry().context("derive geometry")?;
    let device = ByteBlockDevice::new(file, geo.block_size.get())
        .with_context(|| format!("image {} block geometry", path.display()))?;
    Ok((device, sb, geo))
}

fn group_rows(path: &Path) -> Result<Vec<GroupRow>> {
    let (device, _sb, geo) = open_block_device(path)?;
    let mut rows = Vec::new();
    for group in 0..geo.group_count {
        let desc = read_descriptor(&device, &geo, group)?;
        rows.push(GroupRow {
            group,
            start_block: geo.group_block_to_absolute(GroupNumber(group), 0).0,
            blocks: geo.blocks_in_group(GroupNumber(group)),
            inodes: geo.inodes_in_group(GroupNumber(group)),
            free_blocks: desc.free_blocks_count,
            free_inodes: desc.free_inodes_count,
            used_dirs: desc.used_dirs_count,
            block_bitmap: desc.block_bitmap,
            inode_bitmap: desc.inode_bitmap,
            inode_table: desc.inode_table,
        });
    }
    Ok(rows)
}

fn groups_cmd(path: &Path, json: bool) -> Result<()> {
    let rows = group_rows(path)?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&rows).context("serialize output")?
        );
        return Ok(());
    }
    println!(
        "{:>5} {:>10} {:>7} {:>7} {:>11} {:>11} {:>9} {:>10} {:>10} {:>10}",
        "group",
        "start",
        "blocks",
        "inodes",
        "free_blocks",
        "free_inodes",
        "used_dirs",
        "blk_bitmap",
        "ino_bitmap",
        "ino_table"
    );
    for row in &rows {
        println!(
            "{:>5} {:>10} {:>7} {:>7} {:>11} {:>11} {:>9} {:>10} {:>10} {:>10}",
            row.group,
            row.start_block,
            row.blocks,
            row.inodes,
            row.free_blocks,
            row.free_inodes,
            row.used_dirs,
            row.block_bitmap,
            row.inode_bitmap,
            row.inode_table
        );
    }
    Ok(())
}

// ── check ───────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct CheckReport {
    groups: u32,
    superblock_free_blocks: u32,
    superblock_free_inodes: u32,
    descriptor_free_blocks: u64,
    descriptor_free_inodes: u64,
    bitmap_free_blocks: u64,
    bitmap_free_inodes: u64,
    problems: Vec<String>,
}

impl CheckReport {
    fn is_clean(&self) -> bool {
        self.problems.is_empty()
    }
}

/// Every bit past a group's real width must read as allocated, or the
/// scan paths could hand out blocks past the group end.
fn tail_is_masked(bitmap: &[u8], used: u32) -> bool {
    let capacity = u32::try_from(bitmap.len() * 8).unwrap_or(u32::MAX);
    (used..capacity).all(|idx| bitmap_get(bitmap, idx))
}

/// Recompute the free-space accounting from the bitmaps and compare all
/// three ledgers: superblock totals, per-group descriptor counts, and
/// bitmap popcounts.
fn check_image(path: &Path) -> Result<CheckReport> {
    let (device, sb, geo) = open_block_device(path)?;
    let mut report = CheckReport {
        groups: geo.group_count,
        superblock_free_blocks: sb.free_blocks_count,
        superblock_free_inodes: sb.free_inodes_count,
        descriptor_free_blocks: 0,
        descriptor_free_inodes: 0,
        bitmap_free_blocks: 0,
        bitmap_free_inodes: 0,
        problems: Vec::new(),
    };

    for group in 0..geo.group_count {
        let desc = read_descriptor(&device, &geo, group)?;
        if let Err(err) = desc.validate(&geo, GroupNumber(group)) {
            report
                .problems
                .push(format!("group {group}: invalid descriptor: {err}"));
            continue;
        }

        let block_bits = geo.blocks_in_group(GroupNumber(group));
        let block_bitmap = device
            .read_block(BlockNumber(u64::from(desc.block_bitmap)))
            .with_context(|| format!("read block bitmap of group {group}"))?;
        let free_blocks = bitmap_count_free(block_bitmap.as_slice(), block_bits);
        if !tail_is_masked(block_bitmap.as_slice(), block_bits) {
            report
                .problems
                .push(format!("group {group}: block bitmap tail reads as free"));
        }
        if free_blocks != u32::from(desc.free_blocks_count) {
            report.problems.push(format!(
                "group {group}: descriptor says {} free blocks, bitmap says {free_blocks}",
                desc.free_blocks_count
            ));
        }

        let inode_bits = geo.inodes_in_group(GroupNumber(group));
        let inode_bitmap = device
            .read_block(BlockNumber(u64::from(desc.inode_bitmap)))
            .with_context(|| format!("read inode bitmap of group {group}"))?;
        let free_inodes = bitmap_count_free(inode_bitmap.as_slice(), inode_bits);
        if !tail_is_masked(inode_bitmap.as_slice(), inode_bits) {
            report
                .problems
                .push(format!("group {group}: inode bitmap tail reads as free"));
        }
        if free_inodes != u32::from(desc.free_inodes_count) {
            report.problems.push(format!(
                "group {group}: descriptor says {} free inodes, bitmap says {free_inodes}",
                desc.free_inodes_count
            ));
        }

        report.descriptor_free_blocks += u64::from(desc.free_blocks_count);
        report.descriptor_free_inodes += u64::from(desc.free_inodes_count);
        report.bitmap_free_blocks += u64::from(free_blocks);
        report.bitmap_free_inodes += u64::from(free_inodes);
    }

    if report.descriptor_free_blocks != u64::from(sb.free_blocks_count) {
        report.problems.push(format!(
            "superblock says {} free blocks, descriptors sum to {}",
            sb.free_blocks_count, report.descriptor_free_blocks
        ));
    }
    if report.descriptor_free_inodes != u64::from(sb.free_inodes_count) {
        report.problems.push(format!(
            "superblock says {} free inodes, descriptors sum to {}",
            sb.free_inodes_count, report.descriptor_free_inodes
        ));
    }

    Ok(report)
}

fn check_cmd(path: &Path, json: bool) -> Result<()> {
    let report = check_image(path)?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize output")?
        );
    } else if report.is_clean() {
        println!(
            "{}: clean ({} free blocks, {} free inodes across {} group(s))",
            path.display(),
            report.bitmap_free_blocks,
            report.bitmap_free_inodes,
            report.groups
        );
    } else {
        for problem in &report.problems {
            println!("{problem}");
        }
    }
    if !report.is_clean() {
        bail!(
            "{}: {} consistency problem(s)",
            path.display(),
            report.problems.len()
        );
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────
