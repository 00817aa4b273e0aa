//! User-mode page-fault handling (the `handle_umode_page_fault`).
//!
//! This kernel does demand-paging for user memory only: the first touch of
//! any page inside `[UMEM_START_VMA, UMEM_END_VMA)` allocates and maps a
//! fresh zeroed physical page. There is no COW-on-write path here — `fork`
//! is eager, copying pages up front via
//! `pagetable::clone_active_mspace`, so a page fault past that point always
//! means "never touched", never "shared and needs splitting".

use super::{UMEM_END_VMA, UMEM_START_VMA};
use crate::arch::riscv64::sv39::{PteFlags, PAGE_SIZE};
use crate::mm::{pagetable, phys};

/// Handle a fault at `fault_vma`. Returns `true` if it was a legitimate
/// first-touch of user memory and is now mapped; `false` means the fault is
/// fatal and the caller (the trap handler) should panic the hart.
pub fn handle_umode_page_fault(fault_vma: usize) -> bool {
    if fault_vma < UMEM_START_VMA || fault_vma >= UMEM_END_VMA {
        return false;
    }
    let page_vma = fault_vma & !(PAGE_SIZE - 1);

    let phys_page = match phys::alloc_page() {
        Some(p) => p,
        None => {
            crate::error!("page fault at {:#x}: out of physical memory", fault_vma);
            return false;
        }
    };
    unsafe { core::ptr::write_bytes(phys_page as *mut u8, 0, PAGE_SIZE) };

    let flags = PteFlags::R | PteFlags::W | PteFlags::U;
    match pagetable::map_page(page_vma, phys_page, flags) {
        Some(_) => {
            crate::arch::riscv64::sfence_vma_all();
            crate::debug!("demand-paged {:#x} -> {:#x}", page_vma, phys_page);
            true
        }
        None => {
            phys::free_page(phys_page);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_addresses_outside_user_memory() {
        assert!(!handle_umode_page_fault(0));
        assert!(!handle_umode_page_fault(UMEM_END_VMA));
        assert!(!handle_umode_page_fault(usize::MAX));
    }
}
