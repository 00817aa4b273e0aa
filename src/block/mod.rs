//! Fixed-associativity write-back block cache over a backing I/O endpoint:
//! 64 slots of 512 bytes apiece, one cache-wide lock held from
//! `get_block` to the matching `release_block`, least-recently-used
//! eviction driven by a decaying recency counter rather than a timestamp or
//! an intrusive list.

use crate::io::IoRef;
use crate::lib::error::{KernelError, KResult};
use crate::thread::Lock;
use spin::Mutex;

pub const BLKSZ: usize = 512;
const NSLOTS: usize = 64;

struct Slot {
    block_id: Option<u32>,
    data: [u8; BLKSZ],
    recency: u32,
}

impl Slot {
    const fn empty() -> Self {
        Slot { block_id: None, data: [0u8; BLKSZ], recency: 0 }
    }
}

struct State {
    slots: [Slot; NSLOTS],
    clock: u32,
}

/// A checked-out slot. Holding one keeps the cache-wide lock held; it must
/// be handed back to `release_block` (the lock is held from
/// `get_block` to `release_block`).
pub struct BlockHandle {
    idx: usize,
}

pub struct BlockCache {
    backing: IoRef,
    lock: Lock,
    state: Mutex<State>,
    held: Mutex<Option<usize>>,
}

impl BlockCache {
    pub fn new(backing: IoRef) -> Self {
        Self {
            backing,
            lock: Lock::new(),
            state: Mutex::new(State {
                slots: [const { Slot::empty() }; NSLOTS],
                clock: 0,
            }),
            held: Mutex::new(None),
        }
    }

    /// `get_block(cache, pos)`: `pos` must be block-aligned.
    /// Acquires the cache lock (held until `release_block`), finds or loads
    /// the slot for this block, and records it as the currently held slot.
    pub fn get_block(&self, pos: u64) -> KResult<BlockHandle> {
        if pos % BLKSZ as u64 != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let block_id = (pos / BLKSZ as u64) as u32;
        self.lock.acquire();

        let (idx, need_read) = {
            let state = self.state.lock();
            if let Some(idx) = state.slots.iter().position(|s| s.block_id == Some(block_id)) {
                (idx, false)
            } else if let Some(idx) = state.slots.iter().position(|s| s.block_id.is_none()) {
                (idx, true)
            } else {
                let idx = state
                    .slots
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, s)| s.recency)
                    .map(|(i, _)| i)
                    .expect("block cache has zero slots");
                (idx, true)
            }
        };

        if need_read {
            let mut buf = [0u8; BLKSZ];
            let n = self.backing.readat(block_id as u64 * BLKSZ as u64, &mut buf);
            if let Err(e) = n {
                self.lock.release();
                return Err(e);
            }
            let mut state = self.state.lock();
            state.slots[idx] = Slot { block_id: Some(block_id), data: buf, recency: 0 };
        }

        *self.held.lock() = Some(idx);
        Ok(BlockHandle { idx })
    }

    /// Copy the slot's current contents out.
    pub fn read_block(&self, handle: &BlockHandle, out: &mut [u8; BLKSZ]) {
        let state = self.state.lock();
        out.copy_from_slice(&state.slots[handle.idx].data);
    }

    /// Overwrite the slot's contents in place. Visible to any subsequent
    /// `get_block` of the same block immediately; the write-through to
    /// `backing` happens only at `release_block(dirty)`/`flush`.
    pub fn write_block(&self, handle: &BlockHandle, data: &[u8; BLKSZ]) {
        let mut state = self.state.lock();
        state.slots[handle.idx].data.copy_from_slice(data);
    }

    /// `release_block(cache, buf, dirty?)`: writes back to the
    /// backing device if dirty, updates the recency counters (the released
    /// slot becomes most-recent; every other slot whose counter was
    /// strictly below the previous maximum decrements by one), then drops
    /// the cache lock.
    pub fn release_block(&self, handle: BlockHandle, dirty: bool) -> KResult<()> {
        let result = self.release_block_inner(&handle, dirty);
        *self.held.lock() = None;
        self.lock.release();
        result
    }

    fn release_block_inner(&self, handle: &BlockHandle, dirty: bool) -> KResult<()> {
        if dirty {
            let (block_id, data) = {
                let state = self.state.lock();
                let slot = &state.slots[handle.idx];
                (slot.block_id.expect("release of an empty slot"), slot.data)
            };
            self.backing.writeat(block_id as u64 * BLKSZ as u64, &data)?;
        }

        let mut state = self.state.lock();
        let prev_max = state.clock;
        let new_val = prev_max + 1;
        state.clock = new_val;
        for (i, slot) in state.slots.iter_mut().enumerate() {
            if i == handle.idx {
                slot.recency = new_val;
            } else if slot.recency > 0 && slot.recency < prev_max {
                slot.recency -= 1;
            }
        }
        Ok(())
    }

    /// `flush(cache)`: if a slot is currently held (checked out
    /// by a `get_block` whose `release_block` hasn't run yet), release it
    /// as dirty.
    pub fn flush(&self) {
        let held_idx = self.held.lock().take();
        if let Some(idx) = held_idx {
            let _ = self.release_block(BlockHandle { idx }, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{mem::MemIo, IoKind, IoObject};

    fn cache_over(capacity_blocks: usize) -> BlockCache {
        let io = IoObject::new(IoKind::Mem(MemIo::new(capacity_blocks * BLKSZ)));
        BlockCache::new(io)
    }

    #[test]
    fn write_then_read_back_same_block() {
        let cache = cache_over(4);
        let h = cache.get_block(BLKSZ as u64).unwrap();
        let mut data = [0u8; BLKSZ];
        data[0] = 0xAB;
        cache.write_block(&h, &data);
        cache.release_block(h, true).unwrap();

        let h2 = cache.get_block(BLKSZ as u64).unwrap();
        let mut out = [0u8; BLKSZ];
        cache.read_block(&h2, &mut out);
        cache.release_block(h2, false).unwrap();
        assert_eq!(out[0], 0xAB);
    }

    #[test]
    fn eviction_reclaims_least_recently_used_slot() {
        let cache = cache_over(NSLOTS + 1);
        // Fill every slot, oldest first.
        for i in 0..NSLOTS {
            let h = cache.get_block(i as u64 * BLKSZ as u64).unwrap();
            cache.release_block(h, false).unwrap();
        }
        // Touch every slot but the first again, so it has the lowest recency.
        for i in 1..NSLOTS {
            let h = cache.get_block(i as u64 * BLKSZ as u64).unwrap();
            cache.release_block(h, false).unwrap();
        }
        // One more distinct block forces an eviction; it must not be block 0
        // that survives untouched, since it is the current minimum.
        let extra = cache.get_block(NSLOTS as u64 * BLKSZ as u64).unwrap();
        cache.release_block(extra, false).unwrap();

        let state = cache.state.lock();
        assert!(!state.slots.iter().any(|s| s.block_id == Some(0)));
    }

    #[test]
    fn rejects_unaligned_position() {
        let cache = cache_over(2);
        assert!(cache.get_block(1).is_err());
    }
}
