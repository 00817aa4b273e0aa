//! Three-level Sv39 page-table layer.
//!
//! Owns the tree-walking logic over the `Pte`/`PteFlags` encoding defined in
//! `crate::arch::riscv64::sv39`. The "main" mspace is the one created at
//! boot; it identity-maps all of physical RAM with the global (`G`) bit set
//! so that every later mspace — which shares global entries by reference
//! during `clone_active_mspace` — can still dereference physical addresses
//! directly while its own satp is active. That is also what lets this
//! module poke at page-table pages of the *currently inactive* root: they
//! are reached through the always-present global identity map, never
//! through the mspace being manipulated.

use crate::arch::riscv64::sv39::{
    self, is_well_formed_vma, pack_mspace, vpn, Pte, PteFlags, PAGE_SIZE,
};
use crate::lib::error::KernelError;
use crate::mm::phys;
use core::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use spin::Mutex;

pub type MSpace = u64;

#[repr(C, align(4096))]
struct Table {
    entries: [Pte; 512],
}

fn table_ptr(ppn: u64) -> *mut Table {
    ((ppn as usize) << 12) as *mut Table
}

fn zero_page(phys_addr: usize) {
    unsafe { core::ptr::write_bytes(phys_addr as *mut u8, 0, PAGE_SIZE) };
}

fn alloc_table() -> Result<u64, KernelError> {
    let page = phys::alloc_page().ok_or(KernelError::OutOfMemory)?;
    zero_page(page);
    Ok((page / PAGE_SIZE) as u64)
}

static ACTIVE: AtomicU64 = AtomicU64::new(0);
static MAIN: AtomicU64 = AtomicU64::new(0);
static NEXT_ASID: AtomicU16 = AtomicU16::new(1); // 0 is reserved for the main mspace

/// Guards structural page-table edits against concurrent callers; threads
/// never run page-table surgery in parallel on a single hart, but interrupt
/// handlers (the fault path) can interleave with in-progress kernel work.
static PT_LOCK: Mutex<()> = Mutex::new(());

pub fn active_mspace() -> MSpace {
    ACTIVE.load(Ordering::SeqCst)
}

pub fn main_mspace() -> MSpace {
    MAIN.load(Ordering::SeqCst)
}

/// Switch the hart to `mspace` and fence the TLB ("if the new thread belongs to a process, switch to that
/// process's address space").
pub fn activate(mspace: MSpace) {
    sv39::activate(mspace);
    ACTIVE.store(mspace, Ordering::SeqCst);
}

/// One-time boot-time setup: build the main mspace's root table, identity-map
/// `[ram_base, ram_base+ram_len)` global+RWX, and activate it.
pub fn init(ram_base: usize, ram_len: usize) -> MSpace {
    let root_ppn = alloc_table().expect("mm: no memory for root page table");
    let mspace = pack_mspace(0, root_ppn);
    MAIN.store(mspace, Ordering::SeqCst);
    ACTIVE.store(mspace, Ordering::SeqCst);

    let flags = PteFlags::R | PteFlags::W | PteFlags::X | PteFlags::G;
    let pages = ram_len.div_ceil(PAGE_SIZE);
    for i in 0..pages {
        let va = ram_base + i * PAGE_SIZE;
        map_page_in(root_ppn, va, va, flags).expect("mm: failed to identity-map RAM");
    }
    sv39::activate(mspace);
    mspace
}

/// Walk from `root_ppn` down to the level-0 table holding `vma`'s leaf PTE,
/// allocating missing intermediate tables (propagating the global bit from
/// `alloc_flags` so kernel-shared subtrees are marked consistently) when
/// `alloc_missing` is set. Returns a pointer to the leaf slot.
fn walk(root_ppn: u64, vma: usize, alloc_missing: bool, alloc_flags: PteFlags) -> Option<*mut Pte> {
    let mut ppn = root_ppn;
    for level in [2usize, 1usize] {
        let idx = vpn(vma, level);
        let table = table_ptr(ppn);
        let pte = unsafe { (*table).entries[idx] };
        if !pte.is_valid() {
            if !alloc_missing {
                return None;
            }
            let child_ppn = alloc_table().ok()?;
            let g = alloc_flags & PteFlags::G;
            unsafe {
                (*table).entries[idx] = Pte::new(child_ppn, PteFlags::V | g);
            }
            ppn = child_ppn;
        } else if pte.flags().is_leaf() {
            // A leaf already occupies a slot that should hold a subtable;
            // this kernel never installs superpages, so this is a conflict.
            return None;
        } else {
            ppn = pte.ppn();
        }
    }
    let idx0 = vpn(vma, 0);
    let table = table_ptr(ppn);
    Some(unsafe { &mut (*table).entries[idx0] as *mut Pte })
}

fn map_page_in(root_ppn: u64, vma: usize, phys: usize, flags: PteFlags) -> Option<usize> {
    if !is_well_formed_vma(vma) {
        return None;
    }
    let pte_ptr = walk(root_ppn, vma, true, flags)?;
    let pte = unsafe { &mut *pte_ptr };
    if pte.is_valid() {
        return Some(vma); // already mapped: no-op
    }
    *pte = Pte::new((phys / PAGE_SIZE) as u64, flags | PteFlags::V | PteFlags::A | PteFlags::D);
    Some(vma)
}

/// Map one page in the active mspace. Returns `None` on a malformed `vma` or
/// allocation failure. Callers must issue a TLB fence after mapping; batch
/// operations below do this once for the whole range instead.
pub fn map_page(vma: usize, phys: usize, flags: PteFlags) -> Option<usize> {
    let _g = PT_LOCK.lock();
    let root_ppn = sv39::mspace_root_ppn(active_mspace());
    map_page_in(root_ppn, vma, phys, flags)
}

pub fn map_range(vma: usize, size: usize, phys: usize, flags: PteFlags) -> Option<()> {
    let _g = PT_LOCK.lock();
    let root_ppn = sv39::mspace_root_ppn(active_mspace());
    let pages = size.div_ceil(PAGE_SIZE);
    for i in 0..pages {
        map_page_in(root_ppn, vma + i * PAGE_SIZE, phys + i * PAGE_SIZE, flags)?;
    }
    drop(_g);
    crate::arch::riscv64::sfence_vma_all();
    Some(())
}

/// Allocate each physical page independently (they need not be contiguous)
/// and map them across a contiguous virtual range.
pub fn alloc_and_map_range(vma: usize, size: usize, flags: PteFlags) -> Result<(), KernelError> {
    let _g = PT_LOCK.lock();
    let root_ppn = sv39::mspace_root_ppn(active_mspace());
    let pages = size.div_ceil(PAGE_SIZE);
    for i in 0..pages {
        let page = phys::alloc_page().ok_or(KernelError::OutOfMemory)?;
        zero_page(page);
        map_page_in(root_ppn, vma + i * PAGE_SIZE, page, flags).ok_or(KernelError::InvalidArgument)?;
    }
    drop(_g);
    crate::arch::riscv64::sfence_vma_all();
    Ok(())
}

/// Rewrite leaf flag bits over a contiguous range, preserving V/A/D;
/// unmapped pages are silently skipped (the `set_range_flags`).
pub fn set_range_flags(vma: usize, size: usize, flags: PteFlags) {
    let _g = PT_LOCK.lock();
    let root_ppn = sv39::mspace_root_ppn(active_mspace());
    let pages = size.div_ceil(PAGE_SIZE);
    let preserve = PteFlags::V | PteFlags::A | PteFlags::D;
    for i in 0..pages {
        let vma_i = vma + i * PAGE_SIZE;
        if let Some(pte_ptr) = walk(root_ppn, vma_i, false, flags) {
            let pte = unsafe { &mut *pte_ptr };
            if pte.is_valid() {
                let kept = pte.flags() & preserve;
                *pte = Pte::new(pte.ppn(), (flags - preserve) | kept);
            }
        }
    }
    drop(_g);
    crate::arch::riscv64::sfence_vma_all();
}

/// Unmap and free each page of `[vma, vma+size)`; if freeing a leaf empties
/// its level-0 table, that table is freed too (recursively up to level 2).
pub fn unmap_and_free_range(vma: usize, size: usize) {
    let _g = PT_LOCK.lock();
    let root_ppn = sv39::mspace_root_ppn(active_mspace());
    let pages = size.div_ceil(PAGE_SIZE);
    for i in 0..pages {
        unmap_one(root_ppn, vma + i * PAGE_SIZE);
    }
}

fn table_is_empty(ppn: u64) -> bool {
    let table = table_ptr(ppn);
    (0..512).all(|i| !unsafe { (*table).entries[i] }.is_valid())
}

fn unmap_one(root_ppn: u64, vma: usize) {
    let idx2 = vpn(vma, 2);
    let root = table_ptr(root_ppn);
    let pte2 = unsafe { (*root).entries[idx2] };
    if !pte2.is_valid() || pte2.flags().is_leaf() {
        return;
    }
    let l1_ppn = pte2.ppn();

    let idx1 = vpn(vma, 1);
    let l1 = table_ptr(l1_ppn);
    let pte1 = unsafe { (*l1).entries[idx1] };
    if !pte1.is_valid() || pte1.flags().is_leaf() {
        return;
    }
    let l0_ppn = pte1.ppn();

    let idx0 = vpn(vma, 0);
    let l0 = table_ptr(l0_ppn);
    let pte0 = unsafe { (*l0).entries[idx0] };
    if !pte0.is_valid() {
        return;
    }

    phys::free_page((pte0.ppn() as usize) << 12);
    unsafe { (*l0).entries[idx0] = Pte::empty() };
    crate::arch::riscv64::sfence_vma_all();

    if table_is_empty(l0_ppn) {
        phys::free_page((l0_ppn as usize) << 12);
        unsafe { (*l1).entries[idx1] = Pte::empty() };
        crate::arch::riscv64::sfence_vma_all();

        if table_is_empty(l1_ppn) {
            phys::free_page((l1_ppn as usize) << 12);
            unsafe { (*root).entries[idx2] = Pte::empty() };
            crate::arch::riscv64::sfence_vma_all();
        }
    }
}

/// Deep-copy the active mspace: global entries are shared by reference, and
/// everything else is duplicated (fresh subtables, byte-for-byte-copied leaf
/// pages), `clone_active_mspace`.
pub fn clone_active_mspace() -> Result<MSpace, KernelError> {
    let _g = PT_LOCK.lock();
    let src_root = sv39::mspace_root_ppn(active_mspace());
    let dst_root = clone_level(src_root)?;
    let asid = NEXT_ASID.fetch_add(1, Ordering::SeqCst);
    Ok(pack_mspace(asid, dst_root))
}

fn clone_level(src_ppn: u64) -> Result<u64, KernelError> {
    let dst_ppn = alloc_table()?;
    let src = table_ptr(src_ppn);
    let dst = table_ptr(dst_ppn);
    for i in 0..512 {
        let pte = unsafe { (*src).entries[i] };
        if !pte.is_valid() {
            continue;
        }
        if pte.flags().contains(PteFlags::G) {
            unsafe { (*dst).entries[i] = pte };
            continue;
        }
        if pte.flags().is_leaf() {
            let page = phys::alloc_page().ok_or(KernelError::OutOfMemory)?;
            unsafe {
                core::ptr::copy_nonoverlapping(
                    pte.phys_addr() as *const u8,
                    page as *mut u8,
                    PAGE_SIZE,
                );
                (*dst).entries[i] = Pte::new((page / PAGE_SIZE) as u64, pte.flags());
            }
        } else {
            let child = clone_level(pte.ppn())?;
            unsafe { (*dst).entries[i] = Pte::new(child, pte.flags()) };
        }
    }
    Ok(dst_ppn)
}

/// Free every non-global mapping in the active mspace, leaf pages and
/// subtables alike, leaving global (kernel-shared) entries untouched.
pub fn reset_active_mspace() {
    let _g = PT_LOCK.lock();
    let root_ppn = sv39::mspace_root_ppn(active_mspace());
    reset_level(root_ppn);
    crate::arch::riscv64::sfence_vma_all();
}

fn reset_level(ppn: u64) {
    let table = table_ptr(ppn);
    for i in 0..512 {
        let pte = unsafe { (*table).entries[i] };
        if !pte.is_valid() || pte.flags().contains(PteFlags::G) {
            continue;
        }
        if pte.flags().is_leaf() {
            phys::free_page(pte.phys_addr());
        } else {
            reset_level(pte.ppn());
            phys::free_page((pte.ppn() as usize) << 12);
        }
        unsafe { (*table).entries[i] = Pte::empty() };
        crate::arch::riscv64::sfence_vma_all();
    }
}

/// Reset the active mspace, then switch the hart back to the main mspace
/// (the `discard_active_mspace`).
pub fn discard_active_mspace() {
    reset_active_mspace();
    activate(main_mspace());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mspace_packing_roundtrips_ppn_and_asid() {
        let m = pack_mspace(0x1234, 0xabcd);
        assert_eq!(sv39::mspace_root_ppn(m), 0xabcd);
        assert_eq!(sv39::mspace_asid(m), 0x1234);
    }

    #[test]
    fn well_formed_vma_accepts_canonical_forms() {
        assert!(is_well_formed_vma(0x1000_0000));
        assert!(is_well_formed_vma(0));
        assert!(!is_well_formed_vma(1usize << 40));
    }
}
