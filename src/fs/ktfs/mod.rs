//! KTFS: the on-disk filesystem. Consumes the block cache and
//! I/O layer; exposes per-file I/O objects through `crate::io::IoKind`.
//! There is exactly one mounted filesystem in this kernel, held in a
//! module-level `Mutex<Option<Ktfs>>` rather than threaded through every
//! call site — the same shape `crate::device`'s registry uses for "exactly
//! one of these exists, found by name/key instead of passed around".

mod bitmap;
mod layout;
mod resolver;

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::block::{BlockCache, BLKSZ};
use crate::io::{IoKind, IoObject, IoRef};
use crate::lib::error::{KernelError, KResult};

use layout::{DirEntry, Inode, Superblock, DENTS_PER_BLK, DENT_SIZE, DIRECT_COUNT, INODES_PER_BLK, MAX_FILENAME_LEN};
use resolver::Tier;

struct OpenFile {
    key: u32,
    name: String,
    inode_idx: u16,
    inode: Inode,
}

struct Ktfs {
    cache: BlockCache,
    sb: Superblock,
    root_inode: Inode,
    inode_bitmap: Vec<u8>,
    dirent_count: u32,
    open_files: Vec<OpenFile>,
    next_key: u32,
}

static FS: Mutex<Option<Ktfs>> = Mutex::new(None);

fn not_mounted() -> KernelError {
    KernelError::IoError
}

fn read_inode(cache: &BlockCache, sb: &Superblock, inode_idx: u32) -> KResult<Inode> {
    let block = inode_idx as usize / INODES_PER_BLK;
    let slot = inode_idx as usize % INODES_PER_BLK;
    let pos = (sb.inode_region_start() as u64 + block as u64) * BLKSZ as u64;
    let h = cache.get_block(pos)?;
    let mut buf = [0u8; BLKSZ];
    cache.read_block(&h, &mut buf);
    cache.release_block(h, false)?;
    Ok(Inode::parse(&buf, slot))
}

fn write_inode(cache: &BlockCache, sb: &Superblock, inode_idx: u32, inode: &Inode) -> KResult<()> {
    let block = inode_idx as usize / INODES_PER_BLK;
    let slot = inode_idx as usize % INODES_PER_BLK;
    let pos = (sb.inode_region_start() as u64 + block as u64) * BLKSZ as u64;
    let h = cache.get_block(pos)?;
    let mut buf = [0u8; BLKSZ];
    cache.read_block(&h, &mut buf);
    inode.serialize(&mut buf, slot);
    cache.write_block(&h, &buf);
    cache.release_block(h, true)
}

impl Ktfs {
    fn read_dentry(&self, i: u32) -> KResult<DirEntry> {
        let block_idx = i as usize / DENTS_PER_BLK;
        let slot = i as usize % DENTS_PER_BLK;
        if block_idx >= DIRECT_COUNT {
            return Err(KernelError::NoSuchEntry);
        }
        let data_block = self.root_inode.direct[block_idx];
        let pos = resolver::data_pos(&self.sb, data_block);
        let h = self.cache.get_block(pos)?;
        let mut buf = [0u8; BLKSZ];
        self.cache.read_block(&h, &mut buf);
        self.cache.release_block(h, false)?;
        Ok(DirEntry::parse(&buf, slot))
    }

    fn write_dentry(&self, i: u32, dent: &DirEntry) -> KResult<()> {
        let block_idx = i as usize / DENTS_PER_BLK;
        let slot = i as usize % DENTS_PER_BLK;
        if block_idx >= DIRECT_COUNT {
            return Err(KernelError::NoSuchEntry);
        }
        let data_block = self.root_inode.direct[block_idx];
        let pos = resolver::data_pos(&self.sb, data_block);
        let h = self.cache.get_block(pos)?;
        let mut buf = [0u8; BLKSZ];
        self.cache.read_block(&h, &mut buf);
        dent.serialize(&mut buf, slot);
        self.cache.write_block(&h, &buf);
        self.cache.release_block(h, true)
    }

    fn find_dentry(&self, name: &str) -> KResult<(u16, u32)> {
        for i in 0..self.dirent_count {
            let dent = self.read_dentry(i)?;
            if dent.name_matches(name) {
                return Ok((dent.inode, i));
            }
        }
        Err(KernelError::NoSuchEntry)
    }

    fn persist_root_inode(&self) -> KResult<()> {
        write_inode(&self.cache, &self.sb, self.sb.root_directory_inode as u32, &self.root_inode)
    }
}

/// Allocates one more data block and installs it at logical index
/// `current_last_idx + 1`, allocating any missing indirect/double-indirect
/// pointer blocks along the way.
fn add_block(cache: &BlockCache, sb: &Superblock, inode: &mut Inode, current_last_idx: usize) -> KResult<()> {
    let new_idx = current_last_idx + 1;
    let new_block = bitmap::allocate_block(cache, sb)?;
    // The bitmap only promises the block was unused, not zeroed; a grown
    // file must read back as zero bytes regardless of what the backing
    // device held there before.
    resolver::zero_block(cache, sb, new_block)?;
    match resolver::tier_of(new_idx) {
        Tier::Direct => inode.direct[new_idx] = new_block,
        Tier::Indirect => {
            if inode.indirect == 0 {
                inode.indirect = bitmap::allocate_block(cache, sb)?;
                resolver::zero_block(cache, sb, inode.indirect)?;
            }
            let entry = new_idx - DIRECT_COUNT;
            resolver::write_ptr_entry(cache, sb, inode.indirect, entry, new_block)?;
        }
        Tier::DoubleIndirect => {
            let offset = new_idx - DIRECT_COUNT - layout::BLKS_PER_INDIRECT;
            let (slot, offset) = if offset < layout::BLKS_PER_DINDIRECT {
                (0, offset)
            } else {
                (1, offset - layout::BLKS_PER_DINDIRECT)
            };
            if inode.dindirect[slot] == 0 {
                inode.dindirect[slot] = bitmap::allocate_block(cache, sb)?;
                resolver::zero_block(cache, sb, inode.dindirect[slot])?;
            }
            let indirect_ptr_idx = offset / layout::BLKS_PER_INDIRECT;
            let inner_idx = offset % layout::BLKS_PER_INDIRECT;
            let mut indirect_block = resolver::read_ptr_entry(cache, sb, inode.dindirect[slot], indirect_ptr_idx)?;
            if indirect_block == 0 {
                indirect_block = bitmap::allocate_block(cache, sb)?;
                resolver::zero_block(cache, sb, indirect_block)?;
                resolver::write_ptr_entry(cache, sb, inode.dindirect[slot], indirect_ptr_idx, indirect_block)?;
            }
            resolver::write_ptr_entry(cache, sb, indirect_block, inner_idx, new_block)?;
        }
    }
    Ok(())
}

fn grow(cache: &BlockCache, sb: &Superblock, inode: &mut Inode, new_size: u32) -> KResult<()> {
    let mut block_count = if inode.size == 0 { 0usize } else { ((inode.size - 1) / BLKSZ as u32 + 1) as usize };
    while (block_count as u32) * BLKSZ as u32 < new_size {
        if block_count == 0 {
            let first = bitmap::allocate_block(cache, sb)?;
            resolver::zero_block(cache, sb, first)?;
            inode.direct[0] = first;
        } else {
            add_block(cache, sb, inode, block_count - 1)?;
        }
        block_count += 1;
    }
    inode.size = new_size;
    Ok(())
}

/// `mount(backing_io)`: creates the block cache, reads the
/// superblock and root inode, then scans the root directory to build the
/// in-memory inode-usage bitmap.
pub fn mount(backing: IoRef) -> KResult<()> {
    let cache = BlockCache::new(backing);
    let sb = {
        let h = cache.get_block(0)?;
        let mut buf = [0u8; BLKSZ];
        cache.read_block(&h, &mut buf);
        cache.release_block(h, false)?;
        Superblock::parse(&buf)
    };

    let root_idx = sb.root_directory_inode as u32;
    let root_inode = read_inode(&cache, &sb, root_idx)?;
    let dirent_count = root_inode.size / DENT_SIZE as u32;

    let inode_count = INODES_PER_BLK * sb.inode_block_count as usize;
    let mut inode_bitmap = vec![0u8; inode_count];
    inode_bitmap[root_idx as usize] = 1;

    for i in 0..dirent_count {
        let block_idx = i as usize / DENTS_PER_BLK;
        let slot = i as usize % DENTS_PER_BLK;
        let data_block = root_inode.direct[block_idx];
        let pos = resolver::data_pos(&sb, data_block);
        let h = cache.get_block(pos)?;
        let mut buf = [0u8; BLKSZ];
        cache.read_block(&h, &mut buf);
        cache.release_block(h, false)?;
        let dent = DirEntry::parse(&buf, slot);
        inode_bitmap[dent.inode as usize] = 1;
    }

    *FS.lock() = Some(Ktfs {
        cache,
        sb,
        root_inode,
        inode_bitmap,
        dirent_count,
        open_files: Vec::new(),
        next_key: 0,
    });
    crate::info!("ktfs: mounted ({} entries in root)", dirent_count);
    Ok(())
}

/// `open(name, &io)`: busy if already open, else a fresh
/// `KtfsFile` wrapped in a `Seekable`.
pub fn open(name: &str) -> KResult<IoRef> {
    let key = {
        let mut guard = FS.lock();
        let fs = guard.as_mut().ok_or_else(not_mounted)?;
        if fs.open_files.iter().any(|f| f.name == name) {
            return Err(KernelError::Busy);
        }
        let (inode_idx, _) = fs.find_dentry(name)?;
        let inode = read_inode(&fs.cache, &fs.sb, inode_idx as u32)?;
        let key = fs.next_key;
        fs.next_key += 1;
        fs.open_files.push(OpenFile { key, name: String::from(name), inode_idx, inode });
        key
    };
    let raw = IoObject::new(IoKind::KtfsFile(FileIo { key }));
    let seekable = crate::io::seekable::Seekable::new(raw)?;
    Ok(IoObject::new(IoKind::Seekable(seekable)))
}

/// Reject empty/too-long/duplicate names; grow the root directory's direct
/// blocks as needed; pick the lowest free inode index.
pub fn create(name: &str) -> KResult<()> {
    if name.is_empty() || name.len() > MAX_FILENAME_LEN {
        return Err(KernelError::InvalidArgument);
    }
    let mut guard = FS.lock();
    let fs = guard.as_mut().ok_or_else(not_mounted)?;

    if fs.find_dentry(name).is_ok() {
        return Err(KernelError::Busy);
    }

    let inode_idx = fs
        .inode_bitmap
        .iter()
        .position(|&used| used == 0)
        .ok_or(KernelError::NoDataBlocks)? as u32;

    let slot_in_block = fs.dirent_count as usize % DENTS_PER_BLK;
    let block_idx = fs.dirent_count as usize / DENTS_PER_BLK;
    if block_idx >= DIRECT_COUNT {
        return Err(KernelError::NoDataBlocks);
    }
    if slot_in_block == 0 && fs.root_inode.direct[block_idx] == 0 {
        let new_block = bitmap::allocate_block(&fs.cache, &fs.sb)?;
        fs.root_inode.direct[block_idx] = new_block;
        resolver::zero_block(&fs.cache, &fs.sb, new_block)?;
    }

    let dent = DirEntry::new(inode_idx as u16, name);
    fs.write_dentry(fs.dirent_count, &dent)?;

    fs.dirent_count += 1;
    fs.root_inode.size += DENT_SIZE as u32;
    fs.persist_root_inode()?;

    fs.inode_bitmap[inode_idx as usize] = 1;
    write_inode(&fs.cache, &fs.sb, inode_idx, &Inode::default())?;
    Ok(())
}

/// Frees every data/indirect/double-indirect block, force-closes the file
/// if open, swap-removes the directory entry, and clears the inode.
pub fn delete(name: &str) -> KResult<()> {
    let mut guard = FS.lock();
    let fs = guard.as_mut().ok_or_else(not_mounted)?;

    let (inode_idx, entry_index) = fs.find_dentry(name)?;
    let inode = read_inode(&fs.cache, &fs.sb, inode_idx as u32)?;

    let block_count = if inode.size == 0 { 0 } else { ((inode.size - 1) / BLKSZ as u32 + 1) as usize };
    for logical_idx in 0..block_count {
        let data_rel = resolver::resolve(&fs.cache, &fs.sb, &inode, logical_idx)?;
        if data_rel != 0 {
            bitmap::free_block(&fs.cache, &fs.sb, data_rel)?;
        }
    }
    if inode.indirect != 0 {
        bitmap::free_block(&fs.cache, &fs.sb, inode.indirect)?;
    }
    for &dind in &inode.dindirect {
        if dind == 0 {
            continue;
        }
        for entry in 0..layout::BLKS_PER_INDIRECT {
            let indirect_block = resolver::read_ptr_entry(&fs.cache, &fs.sb, dind, entry)?;
            if indirect_block != 0 {
                bitmap::free_block(&fs.cache, &fs.sb, indirect_block)?;
            }
        }
        bitmap::free_block(&fs.cache, &fs.sb, dind)?;
    }

    if let Some(pos) = fs.open_files.iter().position(|f| f.name == name) {
        fs.open_files.swap_remove(pos);
    }

    let last_index = fs.dirent_count - 1;
    if entry_index != last_index {
        let last = fs.read_dentry(last_index)?;
        fs.write_dentry(entry_index, &last)?;
    }
    fs.write_dentry(last_index, &DirEntry::new(0, ""))?;
    fs.dirent_count -= 1;
    fs.root_inode.size -= DENT_SIZE as u32;
    fs.persist_root_inode()?;

    fs.inode_bitmap[inode_idx as usize] = 0;
    write_inode(&fs.cache, &fs.sb, inode_idx as u32, &Inode::default())?;

    fs.cache.flush();
    Ok(())
}

/// Releases any block the cache still holds checked out — called by
/// `exit`/`fscreate`/`fsdelete`'s own flush points and at shutdown.
pub fn flush() {
    if let Some(fs) = FS.lock().as_ref() {
        fs.cache.flush();
    }
}

pub(crate) fn close(key: u32) {
    let mut guard = FS.lock();
    if let Some(fs) = guard.as_mut() {
        if let Some(pos) = fs.open_files.iter().position(|f| f.key == key) {
            fs.open_files.swap_remove(pos);
        }
    }
}

pub(crate) fn readat(key: u32, pos: u64, buf: &mut [u8]) -> KResult<usize> {
    let mut guard = FS.lock();
    let fs = guard.as_mut().ok_or_else(not_mounted)?;
    let idx = fs.open_files.iter().position(|f| f.key == key).ok_or(KernelError::BadFd)?;
    let size = fs.open_files[idx].inode.size as u64;
    if pos >= size {
        return Err(KernelError::InvalidArgument);
    }
    let want = buf.len().min((size - pos) as usize);
    let mut done = 0usize;
    while done < want {
        let cur = pos + done as u64;
        let logical_idx = (cur / BLKSZ as u64) as usize;
        let within = (cur % BLKSZ as u64) as usize;
        let chunk = (BLKSZ - within).min(want - done);

        let inode = fs.open_files[idx].inode;
        let data_rel = resolver::resolve(&fs.cache, &fs.sb, &inode, logical_idx)?;
        let pos_on_disk = resolver::data_pos(&fs.sb, data_rel);
        let h = fs.cache.get_block(pos_on_disk)?;
        let mut block = [0u8; BLKSZ];
        fs.cache.read_block(&h, &mut block);
        fs.cache.release_block(h, false)?;

        buf[done..done + chunk].copy_from_slice(&block[within..within + chunk]);
        done += chunk;
    }
    Ok(done)
}

pub(crate) fn writeat(key: u32, pos: u64, buf: &[u8]) -> KResult<usize> {
    let mut guard = FS.lock();
    let fs = guard.as_mut().ok_or_else(not_mounted)?;
    let idx = fs.open_files.iter().position(|f| f.key == key).ok_or(KernelError::BadFd)?;
    let size = fs.open_files[idx].inode.size as u64;
    if pos >= size {
        return Err(KernelError::InvalidArgument);
    }
    let want = buf.len().min((size - pos) as usize);
    let mut done = 0usize;
    while done < want {
        let cur = pos + done as u64;
        let logical_idx = (cur / BLKSZ as u64) as usize;
        let within = (cur % BLKSZ as u64) as usize;
        let chunk = (BLKSZ - within).min(want - done);

        let inode = fs.open_files[idx].inode;
        let data_rel = resolver::resolve(&fs.cache, &fs.sb, &inode, logical_idx)?;
        let pos_on_disk = resolver::data_pos(&fs.sb, data_rel);
        let h = fs.cache.get_block(pos_on_disk)?;
        let mut block = [0u8; BLKSZ];
        fs.cache.read_block(&h, &mut block);
        block[within..within + chunk].copy_from_slice(&buf[done..done + chunk]);
        fs.cache.write_block(&h, &block);
        fs.cache.release_block(h, true)?;

        done += chunk;
    }
    Ok(done)
}

pub(crate) fn file_cntl(key: u32, cmd: i64, arg: i64) -> KResult<i64> {
    let mut guard = FS.lock();
    let fs = guard.as_mut().ok_or_else(not_mounted)?;
    let idx = fs.open_files.iter().position(|f| f.key == key).ok_or(KernelError::BadFd)?;
    match cmd {
        crate::io::CNTL_GETBLKSZ => Ok(1),
        crate::io::CNTL_GETEND => Ok(fs.open_files[idx].inode.size as i64),
        crate::io::CNTL_SETEND => {
            let new_size = arg as u32;
            let mut inode = fs.open_files[idx].inode;
            if new_size == inode.size {
                return Ok(0);
            }
            if new_size < inode.size {
                return Err(KernelError::Unsupported);
            }
            grow(&fs.cache, &fs.sb, &mut inode, new_size)?;
            let inode_idx = fs.open_files[idx].inode_idx as u32;
            write_inode(&fs.cache, &fs.sb, inode_idx, &inode)?;
            fs.open_files[idx].inode = inode;
            Ok(0)
        }
        _ => Err(KernelError::Unsupported),
    }
}

/// A raw KTFS file endpoint: `readat`/`writeat`/`cntl` only. Identifies
/// its open-file record by a monotonic key rather than a table index so a
/// sibling file's `close` (which swap-removes) never invalidates it.
pub struct FileIo {
    key: u32,
}

impl FileIo {
    pub fn readat(&mut self, pos: u64, buf: &mut [u8]) -> KResult<usize> {
        readat(self.key, pos, buf)
    }

    pub fn writeat(&mut self, pos: u64, buf: &[u8]) -> KResult<usize> {
        writeat(self.key, pos, buf)
    }

    pub fn cntl(&mut self, cmd: i64, arg: i64) -> KResult<i64> {
        file_cntl(self.key, cmd, arg)
    }
}

impl Drop for FileIo {
    fn drop(&mut self) {
        close(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{mem::MemIo, IoKind, IoObject};

    const BITMAP_BLOCKS: u32 = 1;
    const INODE_BLOCKS: u32 = 2;
    const DATA_BLOCKS: u32 = 64;

    /// Builds a blank KTFS image (empty root directory, zeroed bitmap and
    /// inode blocks) over a `MemIo` backing store and mounts it. Every test
    /// gets its own image; `FS` is a single global slot so tests that mount
    /// must run to completion (mount/operate/assert) before the next one
    /// mounts over it.
    fn mount_blank_image() {
        let total = 1 + BITMAP_BLOCKS + INODE_BLOCKS + DATA_BLOCKS;
        let mut mem = MemIo::new(total as usize * BLKSZ);

        let sb = Superblock {
            block_count: total,
            bitmap_block_count: BITMAP_BLOCKS,
            inode_block_count: INODE_BLOCKS,
            root_directory_inode: 0,
        };
        let mut buf = [0u8; BLKSZ];
        sb.serialize(&mut buf);
        mem.writeat(0, &buf).unwrap();
        // Bitmap and inode blocks are already zeroed by `MemIo::new`; root
        // inode (index 0, block 0 slot 0) stays all-zero (size 0, no blocks).

        let io = IoObject::new(IoKind::Mem(mem));
        mount(io).expect("mount of a freshly formatted image");
    }

    #[test]
    fn create_then_delete_round_trips_directory_and_bitmap() {
        mount_blank_image();
        create("a").unwrap();
        create("b").unwrap();
        create("c").unwrap();
        {
            let guard = FS.lock();
            let fs = guard.as_ref().unwrap();
            assert_eq!(fs.dirent_count, 3);
        }

        delete("a").unwrap();
        // Scenario 5: swap-remove moves the last entry ("c") into the
        // deleted slot; directory contiguity holds for every i < count.
        let guard = FS.lock();
        let fs = guard.as_ref().unwrap();
        assert_eq!(fs.dirent_count, 2);
        let e0 = fs.read_dentry(0).unwrap();
        let e1 = fs.read_dentry(1).unwrap();
        assert!(e0.name_matches("c"));
        assert!(e1.name_matches("b"));
    }

    #[test]
    fn extend_then_write_then_read_back() {
        mount_blank_image();
        create("x").unwrap();
        let io = open("x").unwrap();

        // SETEND(x, 0) is a no-op.
        assert_eq!(io.cntl(crate::io::CNTL_SETEND, 0), Ok(0));
        assert_eq!(io.cntl(crate::io::CNTL_GETEND, 0), Ok(0));

        // SETEND(x, 1600) extends to 4 blocks (3 direct + 1 indirect).
        assert_eq!(io.cntl(crate::io::CNTL_SETEND, 1600), Ok(0));
        assert_eq!(io.cntl(crate::io::CNTL_GETEND, 0), Ok(1600));

        let mut buf = [0xFFu8; 1600];
        let n = io.readat(0, &mut buf).unwrap();
        assert_eq!(n, 1600);
        assert!(buf.iter().all(|&b| b == 0), "extended region must read back zeroed");

        io.writeat(1500, b"abc").unwrap();
        let mut window = [0u8; 6];
        io.readat(1498, &mut window).unwrap();
        assert_eq!(window, [0, 0, b'a', b'b', b'c', 0]);

        // Shrinking is not supported by this filesystem.
        assert!(io.cntl(crate::io::CNTL_SETEND, 100).is_err());
    }

    #[test]
    fn writeat_past_end_is_rejected() {
        mount_blank_image();
        create("y").unwrap();
        let io = open("y").unwrap();
        io.cntl(crate::io::CNTL_SETEND, 10).unwrap();
        assert!(io.writeat(10, b"z").is_err());
        assert!(io.readat(10, &mut [0u8; 1]).is_err());
    }

    #[test]
    fn open_is_exclusive_until_closed() {
        mount_blank_image();
        create("f").unwrap();
        let first = open("f").unwrap();
        assert_eq!(open("f"), Err(KernelError::Busy));
        drop(first);
        assert!(open("f").is_ok());
    }

    #[test]
    fn create_rejects_duplicate_and_oversized_names() {
        mount_blank_image();
        create("dup").unwrap();
        assert_eq!(create("dup"), Err(KernelError::Busy));
        assert!(create("this-name-is-too-long").is_err());
    }

    #[test]
    fn mount_recovers_inode_usage_bitmap_from_directory() {
        mount_blank_image();
        create("p").unwrap();
        create("q").unwrap();
        let (used_before, count_before) = {
            let guard = FS.lock();
            let fs = guard.as_ref().unwrap();
            (fs.inode_bitmap.clone(), fs.dirent_count)
        };
        assert!(used_before[0] == 1, "root inode always marked in-use");
        assert_eq!(used_before.iter().filter(|&&b| b == 1).count(), 3); // root + p + q
        assert_eq!(count_before, 2);
    }
}
