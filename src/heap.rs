//! Early heap: a fixed arena carved out of the kernel image's own `.bss`,
//! handed to `linked_list_allocator` before `mm::phys` exists to back
//! `extern crate alloc` from the first line of `kernel_main`.

use linked_list_allocator::LockedHeap;

const HEAP_SIZE: usize = 8 * 1024 * 1024;

#[repr(align(4096))]
struct Arena([u8; HEAP_SIZE]);

static mut ARENA: Arena = Arena([0; HEAP_SIZE]);

#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

/// Initializes the global allocator over the static arena and returns the
/// first physical address past it, for `mm::init`'s `reserved_end`.
pub fn init() -> usize {
    let base = core::ptr::addr_of_mut!(ARENA) as *mut u8;
    unsafe {
        ALLOCATOR.lock().init(base, HEAP_SIZE);
    }
    base as usize + HEAP_SIZE
}

#[alloc_error_handler]
fn alloc_error(layout: core::alloc::Layout) -> ! {
    panic!("heap: allocation failed, layout={:?}", layout);
}
