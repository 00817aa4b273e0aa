//! Virtual memory manager: physical-page allocator, three-level Sv39 page
//! tables, and user-mode demand-fault handling.
//!
//! `phys` has no notion of virtual addresses at all; `pagetable` is the only
//! module that speaks `mspace`/`Pte`; `fault` is the demand-paging policy
//! built on top of both. Everything above this module (threads, process,
//! syscalls) goes through `pagetable`'s public operations, never through raw
//! PTEs.

pub mod fault;
pub mod pagetable;
pub mod phys;

use crate::arch::riscv64::sv39::PAGE_SIZE;

/// User address space window, consulted by `fault::handle_umode_page_fault`:
/// kept well clear of the kernel's identity-mapped RAM range so the two
/// never collide in the same Sv39 tree.
pub const UMEM_START_VMA: usize = 0x1000_0000;
pub const UMEM_END_VMA: usize = 0x2000_0000;
pub const UMEM_SIZE: usize = UMEM_END_VMA - UMEM_START_VMA;

/// One-time memory bring-up at boot: seed the physical-page allocator with
/// everything past the kernel image and the early heap, then build and
/// activate the main mspace's identity map over all of RAM.
///
/// `ram_base`/`ram_len` describe the whole machine's RAM (QEMU `virt`);
/// `reserved_end` is the first free physical address, past the kernel image
/// and the heap region `crate::heap` already carved out.
pub fn init(ram_base: usize, ram_len: usize, reserved_end: usize) {
    let free_base = align_up(reserved_end, PAGE_SIZE);
    let free_len = (ram_base + ram_len).saturating_sub(free_base);
    phys::init(free_base, free_len);
    pagetable::init(ram_base, ram_len);
    crate::info!(
        "mm: {} pages free after reserving up to {:#x}",
        phys::free_page_count(),
        free_base
    );
}

fn align_up(addr: usize, align: usize) -> usize {
    (addr + align - 1) & !(align - 1)
}
