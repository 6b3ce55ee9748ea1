//! Volume initialization.
//!
//! Writes straight to the device with no journal: a fresh volume has
//! nothing to protect. Group 0 packs every global structure after the
//! boot area, descriptors first so the table can grow in place into the
//! reserved blocks behind it:
//!
//! ```text
//! [boot] [superblock] [gdt] [reserved gdt] [orphan] [bbitmap] [ibitmap] [itable] [root]
//! ```
//!
//! Later groups carry only their bitmap pair and inode table. A last
//! group too small to hold even that is dropped from the volume.

use jext_alloc::bitmap_set;
use jext_block::BlockDevice;
use jext_dir::init_dir_block;
use jext_error::{JextError, Result};
use jext_ondisk::htree::HashVersion;
use jext_ondisk::inode::InodeRecord;
use jext_ondisk::superblock::{
    CompatFeatures, ErrorsPolicy, IncompatFeatures, RoCompatFeatures, Superblock, STATE_CLEAN,
};
use jext_ondisk::{GroupDesc, OrphanTable, GROUP_DESC_SIZE};
use jext_types::{
    u64_to_u32, BlockNumber, BlockSize, InodeNumber, SUPERBLOCK_SIZE, SUPER_MAGIC, S_IFDIR,
};

use crate::inode::unix_now;

/// Knobs for [`format`]. The defaults make a volume that fills the
/// device, one group per `8 * block_size` blocks.
#[derive(Debug, Clone)]
pub struct FormatOptions {
    /// Volume size in blocks; `None` takes the whole device.
    pub blocks: Option<u64>,
    /// Blocks per group, multiple of 8, at most `8 * block_size`.
    pub blocks_per_group: Option<u32>,
    /// Inodes per group, multiple of 8, at least 16.
    pub inodes_per_group: Option<u32>,
    /// On-disk record size, 128 or 256.
    pub inode_size: u16,
    /// Percentage of blocks held back from ordinary allocation.
    pub reserved_percent: u8,
    /// Descriptor-table headroom for later growth.
    pub reserved_gdt_blocks: u16,
    pub volume_name: String,
    pub uuid: [u8; 16],
    /// Directory hash seed; all zeros selects the hash's own constants.
    pub hash_seed: [u32; 4],
    pub hash_version: HashVersion,
    /// Advertise the directory index feature.
    pub dir_index: bool,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            blocks: None,
            blocks_per_group: None,
            inodes_per_group: None,
            inode_size: 128,
            reserved_percent: 5,
            reserved_gdt_blocks: 4,
            volume_name: String::new(),
            uuid: [0; 16],
            hash_seed: [0; 4],
            hash_version: HashVersion::Tea,
            dir_index: true,
        }
    }
}

/// Mark every bit from `from` to the end of the bitmap as in use.
///
/// Bitmap bits past a group's real block or inode count must read as
/// allocated so the scan paths never hand them out.
pub(crate) fn mark_tail_used(bitmap: &mut [u8], from: usize) {
    let bits = bitmap.len() * 8;
    let from = from.min(bits);
    let boundary = from.div_ceil(8) * 8;
    for bit in from..boundary.min(bits) {
        bitmap[bit / 8] |= 1 << (bit % 8);
    }
    for byte in &mut bitmap[boundary / 8..] {
        *byte = 0xFF;
    }
}

#[allow(clippy::cast_possible_truncation)]
fn ino32(ino: InodeNumber) -> u32 {
    ino.0 as u32
}

/// Write a fresh filesystem onto `device` and return the superblock it
/// now carries.
#[allow(clippy::too_many_lines)]
pub fn format(device: &dyn BlockDevice, opts: &FormatOptions) -> Result<Superblock> {
    let bs = device.block_size();
    let block_size =
        BlockSize::new(bs).map_err(|err| JextError::InvalidGeometry(err.to_string()))?;
    let bsz = bs as usize;
    let requested = opts.blocks.unwrap_or_else(|| device.block_count());
    if requested > device.block_count() {
        return Err(JextError::InvalidGeometry(format!(
            "{requested} blocks requested but the device holds {}",
            device.block_count()
        )));
    }
    let fdb: u32 = if bs == 1024 { 1 } else { 0 };

    let bpg = opts.blocks_per_group.unwrap_or(bs * 8);
    if bpg == 0 || bpg % 8 != 0 || bpg > bs * 8 {
        return Err(JextError::InvalidGeometry(format!(
            "blocks_per_group {bpg} must be a nonzero multiple of 8 up to {}",
            bs * 8
        )));
    }
    let ipg = opts
        .inodes_per_group
        .unwrap_or_else(|| (bpg / 4).next_multiple_of(8));
    if ipg < 16 || ipg % 8 != 0 || ipg > bs * 8 {
        return Err(JextError::InvalidGeometry(format!(
            "inodes_per_group {ipg} must be a multiple of 8 in 16..={}",
            bs * 8
        )));
    }
    if !matches!(opts.inode_size, 128 | 256) {
        return Err(JextError::InvalidGeometry(format!(
            "inode size {} is not 128 or 256",
            opts.inode_size
        )));
    }
    let itb = (ipg * u32::from(opts.inode_size)).div_ceil(bs);

    let usable = requested.saturating_sub(u64::from(fdb));
    if usable == 0 {
        return Err(JextError::InvalidGeometry(
            "device too small for one block group".into(),
        ));
    }
    let mut group_count = u64_to_u32(usable.div_ceil(u64::from(bpg)), "group count")
        .map_err(|err| JextError::InvalidGeometry(err.to_string()))?;
    let mut total = requested;
    let tail = usable % u64::from(bpg);
    if group_count > 1 && tail != 0 && tail <= u64::from(2 + itb) {
        group_count -= 1;
        total = u64::from(fdb) + u64::from(group_count) * u64::from(bpg);
    }
    let total32 = u64_to_u32(total, "blocks count")
        .map_err(|err| JextError::InvalidGeometry(err.to_string()))?;

    #[allow(clippy::cast_possible_truncation)]
    let gdt_blocks = (group_count as usize).div_ceil(bsz / GROUP_DESC_SIZE) as u32;
    let rgdt = u32::from(opts.reserved_gdt_blocks);

    // Group 0 layout, all contiguous from the superblock on.
    let gdt_start = fdb + 1;
    let orphan_block = gdt_start + gdt_blocks + rgdt;
    let g0_block_bitmap = orphan_block + 1;
    let g0_inode_bitmap = g0_block_bitmap + 1;
    let g0_inode_table = g0_inode_bitmap + 1;
    let root_block = g0_inode_table + itb;
    let g0_overhead = 1 + gdt_blocks + rgdt + 1 + 2 + itb + 1;

    #[allow(clippy::cast_possible_truncation)]
    let big0 = u64::from(bpg).min(total - u64::from(fdb)) as u32;
    if g0_overhead > big0 {
        return Err(JextError::InvalidGeometry(format!(
            "group 0 holds {big0} blocks but its metadata needs {g0_overhead}"
        )));
    }

    let now = unix_now();
    let zero = vec![0_u8; bsz];
    let mut descs = Vec::with_capacity(group_count as usize);
    let mut free_blocks_total = 0_u64;
    let mut free_inodes_total = 0_u64;

    for g in 0..group_count {
        let start = u64::from(fdb) + u64::from(g) * u64::from(bpg);
        #[allow(clippy::cast_possible_truncation)]
        let big = u64::from(bpg).min(total - start) as u32;
        let (bb, ib, it, meta) = if g == 0 {
            (
                u64::from(g0_block_bitmap),
                u64::from(g0_inode_bitmap),
                u64::from(g0_inode_table),
                g0_overhead,
            )
        } else {
            (start, start + 1, start + 2, 2 + itb)
        };

        let mut bitmap = vec![0_u8; bsz];
        for bit in 0..meta {
            bitmap_set(&mut bitmap, bit);
        }
        mark_tail_used(&mut bitmap, big as usize);
        device.write_block(BlockNumber(bb), &bitmap)?;

        let mut ibitmap = vec![0_u8; bsz];
        let reserved_inodes = if g == 0 {
            let count = ino32(InodeNumber::FIRST_USER) - 1;
            for bit in 0..count {
                bitmap_set(&mut ibitmap, bit);
            }
            count
        } else {
            0
        };
        mark_tail_used(&mut ibitmap, ipg as usize);
        device.write_block(BlockNumber(ib), &ibitmap)?;

        if g == 0 {
            let mut table = vec![0_u8; bsz];
            let mut root = InodeRecord::new(S_IFDIR | 0o755);
            root.links_count = 2;
            root.size = u64::from(bs);
            root.blocks_512 = bs / 512;
            root.block[0] = root_block;
            root.atime = now;
            root.ctime = now;
            root.mtime = now;
            let isz = usize::from(opts.inode_size);
            root.encode_into(&mut table[isz..2 * isz])
                .map_err(|err| JextError::Format(format!("root inode: {err}")))?;
            device.write_block(BlockNumber(it), &table)?;
            for i in 1..u64::from(itb) {
                device.write_block(BlockNumber(it + i), &zero)?;
            }

            let mut dirbuf = vec![0_u8; bsz];
            init_dir_block(&mut dirbuf, ino32(InodeNumber::ROOT), ino32(InodeNumber::ROOT))?;
            device.write_block(BlockNumber(u64::from(root_block)), &dirbuf)?;
        } else {
            for i in 0..u64::from(itb) {
                device.write_block(BlockNumber(it + i), &zero)?;
            }
        }

        #[allow(clippy::cast_possible_truncation)]
        let desc = GroupDesc {
            block_bitmap: bb as u32,
            inode_bitmap: ib as u32,
            inode_table: it as u32,
            free_blocks_count: (big - meta) as u16,
            free_inodes_count: (ipg - reserved_inodes) as u16,
            used_dirs_count: u16::from(g == 0),
        };
        free_blocks_total += u64::from(desc.free_blocks_count);
        free_inodes_total += u64::from(desc.free_inodes_count);
        descs.push(desc);
    }

    // Descriptor table, then zeroed headroom behind it.
    let mut gdt = vec![0_u8; bsz * gdt_blocks as usize];
    for (i, desc) in descs.iter().enumerate() {
        desc.encode_into(&mut gdt[i * GROUP_DESC_SIZE..(i + 1) * GROUP_DESC_SIZE])
            .map_err(|err| JextError::Format(format!("group descriptor {i}: {err}")))?;
    }
    for (i, chunk) in gdt.chunks(bsz).enumerate() {
        device.write_block(BlockNumber(u64::from(gdt_start) + i as u64), chunk)?;
    }
    for i in 0..u64::from(rgdt) {
        device.write_block(
            BlockNumber(u64::from(gdt_start + gdt_blocks) + i),
            &zero,
        )?;
    }

    let mut orphan_buf = vec![0_u8; bsz];
    OrphanTable::default()
        .encode_into(&mut orphan_buf)
        .map_err(|err| JextError::Format(format!("orphan table: {err}")))?;
    device.write_block(BlockNumber(u64::from(orphan_block)), &orphan_buf)?;

    let sb = Superblock {
        inodes_count: u64_to_u32(u64::from(ipg) * u64::from(group_count), "inodes count")
            .map_err(|err| JextError::InvalidGeometry(err.to_string()))?,
        blocks_count: total32,
        reserved_blocks_count: u64_to_u32(
            total * u64::from(opts.reserved_percent) / 100,
            "reserved blocks",
        )
        .map_err(|err| JextError::InvalidGeometry(err.to_string()))?,
        free_blocks_count: u64_to_u32(free_blocks_total, "free blocks")
            .map_err(|err| JextError::InvalidGeometry(err.to_string()))?,
        free_inodes_count: u64_to_u32(free_inodes_total, "free inodes")
            .map_err(|err| JextError::InvalidGeometry(err.to_string()))?,
        first_data_block: fdb,
        block_size,
        blocks_per_group: bpg,
        inodes_per_group: ipg,
        inode_size: opts.inode_size,
        first_ino: ino32(InodeNumber::FIRST_USER),
        reserved_gdt_blocks: opts.reserved_gdt_blocks,
        magic: SUPER_MAGIC,
        uuid: opts.uuid,
        volume_name: opts.volume_name.clone(),
        last_mounted: String::new(),
        rev_level: 1,
        minor_rev_level: 0,
        creator_os: 0,
        feature_compat: CompatFeatures(if opts.dir_index {
            CompatFeatures::DIR_INDEX.0
        } else {
            0
        }),
        feature_incompat: IncompatFeatures(IncompatFeatures::FILETYPE.0),
        feature_ro_compat: RoCompatFeatures(RoCompatFeatures::ORPHAN_TABLE.0),
        default_mount_opts: 0,
        state: STATE_CLEAN,
        errors: ErrorsPolicy::Continue.to_raw(),
        mnt_count: 0,
        max_mnt_count: u16::MAX,
        mtime: 0,
        wtime: now,
        lastcheck: now,
        checkinterval: 0,
        def_resuid: 0,
        def_resgid: 0,
        journal_inum: 0,
        journal_dev: 0,
        orphan_table_block: orphan_block,
        hash_seed: opts.hash_seed,
        def_hash_version: opts.hash_version.to_raw(),
    };

    let mut region = vec![0_u8; SUPERBLOCK_SIZE];
    sb.encode_into(&mut region)
        .map_err(|err| JextError::Format(format!("superblock: {err}")))?;
    if bsz == SUPERBLOCK_SIZE {
        device.write_block(BlockNumber(u64::from(fdb)), &region)?;
    } else {
        let mut head = device.read_block(BlockNumber(0))?.to_vec();
        head[SUPERBLOCK_SIZE..2 * SUPERBLOCK_SIZE].copy_from_slice(&region);
        device.write_block(BlockNumber(0), &head)?;
    }
    device.sync()?;

    tracing::info!(
        target: "jext::core",
        blocks = total,
        groups = group_count,
        block_size = bs,
        "formatted"
    );
    Ok(sb)
}
