//! Logical-block-index → physical-block-number resolver:
//! direct, single-indirect, then double-indirect tiers. Every value stored
//! in an inode's `direct`/`indirect`/`dindirect` fields (and inside
//! indirect/dindirect pointer blocks) is a *data-region-relative* index —
//! `0` means "unallocated" for any inode but the root directory's, which
//! the mkfs tool that built the image always seeds into data-block index
//! 0 (so runtime allocation, which only ever hands out bits the bitmap
//! still shows free, can never reissue it). Physical block numbers for the
//! cache are always `(data_region_relative_index + data_region_start) *
//! BLKSZ`.

use crate::block::{BlockCache, BLKSZ};
use crate::lib::error::{KernelError, KResult};

use super::layout::{Inode, Superblock, BLKS_PER_DINDIRECT, BLKS_PER_INDIRECT, DIRECT_COUNT};

pub(crate) fn data_pos(sb: &Superblock, data_relative: u32) -> u64 {
    (data_relative as u64 + sb.data_region_start() as u64) * BLKSZ as u64
}

pub(crate) fn read_ptr_entry(cache: &BlockCache, sb: &Superblock, ptr_block: u32, entry: usize) -> KResult<u32> {
    if ptr_block == 0 {
        return Err(KernelError::NoSuchEntry);
    }
    let h = cache.get_block(data_pos(sb, ptr_block))?;
    let mut buf = [0u8; BLKSZ];
    cache.read_block(&h, &mut buf);
    cache.release_block(h, false)?;
    let off = entry * 4;
    Ok(u32::from_le_bytes(buf[off..off + 4].try_into().unwrap()))
}

/// Writes one `u32` entry into a pointer block (indirect or
/// double-indirect), used only by `add_block` when extending a file.
pub(crate) fn write_ptr_entry(
    cache: &BlockCache,
    sb: &Superblock,
    ptr_block: u32,
    entry: usize,
    value: u32,
) -> KResult<()> {
    let h = cache.get_block(data_pos(sb, ptr_block))?;
    let mut buf = [0u8; BLKSZ];
    cache.read_block(&h, &mut buf);
    let off = entry * 4;
    buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
    cache.write_block(&h, &buf);
    cache.release_block(h, true)
}

/// Zeroes a freshly allocated pointer block so every entry reads as
/// "unallocated" until populated.
pub(crate) fn zero_block(cache: &BlockCache, sb: &Superblock, block: u32) -> KResult<()> {
    let h = cache.get_block(data_pos(sb, block))?;
    let zeros = [0u8; BLKSZ];
    cache.write_block(&h, &zeros);
    cache.release_block(h, true)
}

/// Resolves logical block `idx` of `inode` to a data-region-relative
/// block number. `0` in any tier means the block was never
/// allocated — reads must treat that as a hole of zero bytes; writes must
/// not reach here without having extended via `SETEND`/`add_block` first.
pub fn resolve(cache: &BlockCache, sb: &Superblock, inode: &Inode, idx: usize) -> KResult<u32> {
    if idx < DIRECT_COUNT {
        return Ok(inode.direct[idx]);
    }
    let idx = idx - DIRECT_COUNT;
    if idx < BLKS_PER_INDIRECT {
        return read_ptr_entry(cache, sb, inode.indirect, idx);
    }
    let offset = idx - BLKS_PER_INDIRECT;
    let (dind_block, offset) = if offset < BLKS_PER_DINDIRECT {
        (inode.dindirect[0], offset)
    } else {
        (inode.dindirect[1], offset - BLKS_PER_DINDIRECT)
    };
    let indirect_ptr_idx = offset / BLKS_PER_INDIRECT;
    let inner_idx = offset % BLKS_PER_INDIRECT;
    let indirect_block = read_ptr_entry(cache, sb, dind_block, indirect_ptr_idx)?;
    read_ptr_entry(cache, sb, indirect_block, inner_idx)
}

/// Number of logical data blocks addressable without allocating any more
/// indirect/double-indirect pointer blocks than currently exist — used by
/// `add_block` to decide whether a new pointer block must be allocated
/// first.
pub fn tier_of(idx: usize) -> Tier {
    if idx < DIRECT_COUNT {
        Tier::Direct
    } else if idx - DIRECT_COUNT < BLKS_PER_INDIRECT {
        Tier::Indirect
    } else {
        Tier::DoubleIndirect
    }
}

pub enum Tier {
    Direct,
    Indirect,
    DoubleIndirect,
}
