//! Online growth by whole block groups.
//!
//! A new group's metadata is staged through the journal, its descriptor
//! lands in the table, and only then does the superblock advance the
//! block count, all in one transaction. The descriptor table can spill
//! into the next block only while format-time reserved descriptor
//! blocks remain.

use jext_alloc::{bitmap_set, update_group_desc};
use jext_error::{JextError, Result};
use jext_journal::{AccessKind, SINGLEDATA_CREDITS};
use jext_ondisk::{GroupDesc, GROUP_DESC_SIZE};
use jext_types::{u64_to_u32, BlockNumber, GroupNumber, InodeNumber};

use crate::format::mark_tail_used;
use crate::Filesystem;

/// Caller-chosen layout for one appended group.
///
/// The metadata blocks must fall inside the group's own block range;
/// every other block in the range starts out free.
#[derive(Debug, Clone)]
pub struct NewGroupInput {
    pub group: GroupNumber,
    pub block_bitmap: BlockNumber,
    pub inode_bitmap: BlockNumber,
    pub inode_table: BlockNumber,
    pub blocks_count: u32,
    pub reserved_blocks: u32,
}

impl Filesystem {
    /// Append one initialized group to the volume.
    ///
    /// Groups are added strictly in order. The device must already cover
    /// the new range.
    pub fn group_add(&self, input: &NewGroupInput) -> Result<()> {
        self.ensure_writable()?;
        // One resize at a time, keyed by the reserved resize inode.
        let lock = self.inode_lock(InodeNumber::RESIZE);
        let _guard = lock.lock();

        let geo = self.geometry();
        let bs = geo.block_size.get();
        if input.group.0 != geo.group_count {
            return Err(JextError::InvalidGeometry(format!(
                "group {} is not the next group ({} exist)",
                input.group.0, geo.group_count
            )));
        }
        if input.blocks_count == 0 || input.blocks_count > geo.blocks_per_group {
            return Err(JextError::InvalidGeometry(format!(
                "new group of {} blocks, 1..={} allowed",
                input.blocks_count, geo.blocks_per_group
            )));
        }
        let itb = geo.inode_table_blocks();
        let overhead = 2 + itb;
        if input.blocks_count <= overhead {
            return Err(JextError::InvalidGeometry(format!(
                "{} blocks cannot hold the group's own {overhead} metadata blocks",
                input.blocks_count
            )));
        }

        let group_start = u64::from(geo.first_data_block)
            + u64::from(geo.group_count) * u64::from(geo.blocks_per_group);
        let new_total = group_start + u64::from(input.blocks_count);
        let new_total32 = u64_to_u32(new_total, "blocks count")
            .map_err(|err| JextError::InvalidGeometry(err.to_string()))?;
        if new_total > self.device.block_count() {
            return Err(JextError::InvalidGeometry(format!(
                "group {} would end at block {new_total} but the device holds {}",
                input.group.0,
                self.device.block_count()
            )));
        }

        let to_desc_field = |block: BlockNumber, what: &str| {
            block.to_u32().map_err(|_| {
                JextError::InvalidGeometry(format!("{what} block {} out of range", block.0))
            })
        };
        #[allow(clippy::cast_possible_truncation)]
        let desc = GroupDesc {
            block_bitmap: to_desc_field(input.block_bitmap, "block bitmap")?,
            inode_bitmap: to_desc_field(input.inode_bitmap, "inode bitmap")?,
            inode_table: to_desc_field(input.inode_table, "inode table")?,
            free_blocks_count: (input.blocks_count - overhead) as u16,
            free_inodes_count: geo.inodes_per_group as u16,
            used_dirs_count: 0,
        };

        let mut new_geo = geo.clone();
        new_geo.total_blocks = new_total;
        new_geo.total_inodes = geo.total_inodes.saturating_add(geo.inodes_per_group);
        new_geo.group_count = geo.group_count + 1;
        desc.validate(&new_geo, input.group)
            .map_err(|err| JextError::InvalidGeometry(format!("group {}: {err}", input.group.0)))?;

        let dpb = u64::from(bs) / GROUP_DESC_SIZE as u64;
        let need_gdt = u64::from(new_geo.group_count).div_ceil(dpb)
            - u64::from(geo.group_count).div_ceil(dpb);
        #[allow(clippy::cast_possible_truncation)]
        let need_gdt = need_gdt as u16;
        if need_gdt > self.sb.lock().reserved_gdt_blocks {
            return Err(JextError::InvalidGeometry(format!(
                "descriptor table is full and group {} has no reserved block to grow into",
                input.group.0
            )));
        }

        let mut txn = self.begin(SINGLEDATA_CREDITS + itb + 4)?;
        let out = (|txn: &mut jext_journal::Txn<'_>| -> Result<()> {
            #[allow(clippy::cast_possible_truncation)]
            let rel = |block: BlockNumber| (block.0 - group_start) as u32;

            let mut bitmap = vec![0_u8; bs as usize];
            bitmap_set(&mut bitmap, rel(input.block_bitmap));
            bitmap_set(&mut bitmap, rel(input.inode_bitmap));
            for i in 0..itb {
                bitmap_set(&mut bitmap, rel(input.inode_table) + i);
            }
            mark_tail_used(&mut bitmap, input.blocks_count as usize);
            txn.declare(input.block_bitmap, AccessKind::Create)?;
            txn.dirty(input.block_bitmap, &bitmap)?;

            let mut ibitmap = vec![0_u8; bs as usize];
            mark_tail_used(&mut ibitmap, geo.inodes_per_group as usize);
            txn.declare(input.inode_bitmap, AccessKind::Create)?;
            txn.dirty(input.inode_bitmap, &ibitmap)?;

            let zero = vec![0_u8; bs as usize];
            for i in 0..u64::from(itb) {
                let block = BlockNumber(input.inode_table.0 + i);
                txn.declare(block, AccessKind::Create)?;
                txn.dirty(block, &zero)?;
            }

            update_group_desc(txn, &geo, self.gdt_start(), input.group, |d| *d = desc)?;

            self.allocator().add_group(new_geo.clone(), &desc)?;

            {
                let mut sb = self.sb.lock();
                sb.blocks_count = new_total32;
                sb.inodes_count = sb.inodes_count.saturating_add(geo.inodes_per_group);
                sb.reserved_blocks_count =
                    sb.reserved_blocks_count.saturating_add(input.reserved_blocks);
                sb.reserved_gdt_blocks -= need_gdt;
            }
            self.write_superblock(txn)?;
            tracing::info!(
                target: "jext::core",
                group = input.group.0,
                blocks = input.blocks_count,
                total_blocks = new_total,
                "volume_grown"
            );
            Ok(())
        })(&mut txn);
        match out {
            Ok(()) => txn.stop(),
            Err(err) if err.is_damage() => self.fail_txn(txn, err),
            Err(err) => {
                txn.stop()?;
                Err(err)
            }
        }
    }
}
