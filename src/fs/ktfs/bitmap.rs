//! Data-block bitmap: one bit per data block, LSB-first within each byte,
//! stored in the blocks right after the superblock.

use crate::block::{BlockCache, BLKSZ};
use crate::lib::error::{KernelError, KResult};

use super::layout::Superblock;

/// Scans bitmap blocks in order, bits LSB…MSB within each byte, for the
/// first zero bit; sets it, writes the block back dirty, and returns the
/// absolute data-block index.
pub fn allocate_block(cache: &BlockCache, sb: &Superblock) -> KResult<u32> {
    for block in 0..sb.bitmap_block_count {
        let pos = (sb.bitmap_region_start() as u64 + block as u64) * BLKSZ as u64;
        let h = cache.get_block(pos)?;
        let mut buf = [0u8; BLKSZ];
        cache.read_block(&h, &mut buf);
        let mut found = None;
        'search: for (byte_idx, byte) in buf.iter_mut().enumerate() {
            for bit in 0..8 {
                if *byte & (1 << bit) == 0 {
                    *byte |= 1 << bit;
                    found = Some((block as u64 * BLKSZ as u64 * 8) + (byte_idx as u64 * 8) + bit as u64);
                    break 'search;
                }
            }
        }
        if let Some(idx) = found {
            cache.write_block(&h, &buf);
            cache.release_block(h, true)?;
            return Ok(idx as u32);
        }
        cache.release_block(h, false)?;
    }
    Err(KernelError::NoDataBlocks)
}

/// Clears the bit for `block_idx`, returning it to the free pool.
pub fn free_block(cache: &BlockCache, sb: &Superblock, block_idx: u32) -> KResult<()> {
    let bit_offset = block_idx as u64;
    let block = bit_offset / (BLKSZ as u64 * 8);
    let within = bit_offset % (BLKSZ as u64 * 8);
    let byte_idx = (within / 8) as usize;
    let bit = (within % 8) as u8;

    let pos = (sb.bitmap_region_start() as u64 + block) * BLKSZ as u64;
    let h = cache.get_block(pos)?;
    let mut buf = [0u8; BLKSZ];
    cache.read_block(&h, &mut buf);
    buf[byte_idx] &= !(1 << bit);
    cache.write_block(&h, &buf);
    cache.release_block(h, true)
}
