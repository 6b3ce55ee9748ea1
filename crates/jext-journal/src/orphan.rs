//! Orphan table maintenance inside a transaction.
//!
//! The orphan table is a dedicated metadata block listing inodes that were
//! unlinked while still open (or truncated mid-flight). Entries are added
//! and removed through the same transaction that performs the unlink or
//! truncate, so the table is always consistent with the committed image.
//! The recovery scan that consumes a stale table after a crash lives in
//! `jext-core`; this module only provides the table primitives.

use crate::{AccessKind, JournalEngine, Txn};
use jext_error::{JextError, Result};
use jext_ondisk::orphan::{orphan_table_capacity, OrphanTable};
use jext_types::{BlockNumber, InodeNumber, ParseError};

fn table_corruption(block: BlockNumber, err: &ParseError) -> JextError {
    JextError::Corruption {
        block: block.0,
        detail: format!("orphan table: {err}"),
    }
}

fn block_size_of(buf_len: usize, block: BlockNumber) -> Result<u32> {
    u32::try_from(buf_len).map_err(|_| JextError::Corruption {
        block: block.0,
        detail: "orphan table block too large".to_owned(),
    })
}

/// Write an empty orphan table to `table_block`. Used at format time and
/// after a completed recovery scan.
pub fn init_table(txn: &mut Txn<'_>, table_block: BlockNumber) -> Result<()> {
    txn.declare(table_block, AccessKind::Create)?;
    let len = txn.read(table_block)?.len();
    let mut block = vec![0_u8; len];
    OrphanTable::default()
        .encode_into(&mut block)
        .map_err(|err| table_corruption(table_block, &err))?;
    txn.dirty(table_block, &block)?;
    tracing::debug!(
        target: "jext::journal",
        block = table_block.0,
        "orphan_table_initialized"
    );
    Ok(())
}

/// Record `ino` as orphaned. Idempotent; costs one credit the first time
/// the table is dirtied in this transaction. A full table reports
/// [`JextError::NoSpace`].
pub fn orphan_add(txn: &mut Txn<'_>, table_block: BlockNumber, ino: InodeNumber) -> Result<()> {
    txn.declare(table_block, AccessKind::Write)?;
    let buf = txn.read(table_block)?;
    let mut table = OrphanTable::parse_from_block(buf.as_slice())
        .map_err(|err| table_corruption(table_block, &err))?;
    if table.contains(ino) {
        return Ok(());
    }
    let block_size = block_size_of(buf.len(), table_block)?;
    if table.len() >= orphan_table_capacity(block_size) {
        return Err(JextError::NoSpace);
    }
    table.inodes.push(ino);

    let mut block = vec![0_u8; buf.len()];
    table
        .encode_into(&mut block)
        .map_err(|err| table_corruption(table_block, &err))?;
    txn.dirty(table_block, &block)?;
    tracing::debug!(
        target: "jext::journal",
        ino = ino.0,
        entries = table.len(),
        "orphan_added"
    );
    Ok(())
}

/// Drop `ino` from the orphan table. Removing an absent inode is a no-op;
/// the recovery scan and the last-close path may race benignly.
pub fn orphan_remove(txn: &mut Txn<'_>, table_block: BlockNumber, ino: InodeNumber) -> Result<()> {
    txn.declare(table_block, AccessKind::Write)?;
    let buf = txn.read(table_block)?;
    let mut table = OrphanTable::parse_from_block(buf.as_slice())
        .map_err(|err| table_corruption(table_block, &err))?;
    if !table.contains(ino) {
        return Ok(());
    }
    table.inodes.retain(|entry| *entry != ino);

    let mut block = vec![0_u8; buf.len()];
    table
        .encode_into(&mut block)
        .map_err(|err| table_corruption(table_block, &err))?;
    txn.dirty(table_block, &block)?;
    tracing::debug!(
        target: "jext::journal",
        ino = ino.0,
        entries = table.len(),
        "orphan_removed"
    );
    Ok(())
}

/// Read and parse the orphan table outside any handle. Recovery runs this
/// before the filesystem accepts writes.
pub fn load_table(engine: &dyn JournalEngine, table_block: BlockNumber) -> Result<OrphanTable> {
    let buf = engine.read_block(table_block)?;
    OrphanTable::parse_from_block(buf.as_slice())
        .map_err(|err| table_corruption(table_block, &err))
}
