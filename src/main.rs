#![no_std]
#![no_main]
#![feature(alloc_error_handler)]
// CI lint gate: when built with `--features strict`, fail on any warning.
#![cfg_attr(feature = "strict", deny(warnings))]
#![cfg_attr(feature = "strict", deny(unsafe_op_in_unsafe_fn))]

//! A small preemptive single-hart RISC-V kernel: three-level
//! paging, a cooperative+preemptive thread scheduler, a tagged-variant I/O
//! object model with pipes and a write-back block cache, and KTFS, the
//! on-disk filesystem.
//!
//! Module layout mirrors the four subsystems that stay tightly coupled:
//! `mm` (virtual memory), `thread` (scheduling), `io`/`block` (the I/O
//! object model and block cache), `fs` (KTFS on top of both). Above those,
//! `device`, `process`, and `syscall` are the layers that actually run
//! user programs.

extern crate alloc;

#[allow(special_module_name)]
pub mod lib;

pub mod arch;
pub mod block;
pub mod device;
pub mod fs;
pub mod heap;
pub mod io;
pub mod mm;
pub mod process;
pub mod syscall;
pub mod thread;

const RAM_BASE: usize = arch::riscv64::KERNEL_BASE;
const RAM_LEN: usize = 128 * 1024 * 1024;
const BOOT_PROGRAM: &str = "shell.elf";

#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    lib::panic::panic_handler(info)
}

/// Single entry point reached from `arch::riscv64::boot::kernel_entry`.
/// Brings up the heap, virtual memory, threading, devices, and the
/// filesystem, then `exec`s the distinguished boot program. Never returns.
#[no_mangle]
pub extern "C" fn kernel_main(hart_id: usize, _dtb_ptr: usize) -> ! {
    let reserved_end = heap::init();

    crate::info!("ktfs_kernel: booting on hart {}", hart_id);
    crate::info!(
        "ktfs_kernel: ram [{:#x}, {:#x}), kernel image ends near {:#x}",
        RAM_BASE,
        RAM_BASE + RAM_LEN,
        reserved_end
    );

    arch::riscv64::init();
    mm::init(RAM_BASE, RAM_LEN, reserved_end);
    thread::init();
    device::init();
    process::init();

    let blk = device::open("vioblk", 0).unwrap_or_else(|e| {
        panic!("kernel_main: failed to open vioblk#0: {}", e);
    });
    fs::ktfs::mount(blk).unwrap_or_else(|e| {
        panic!("kernel_main: failed to mount ktfs: {}", e);
    });

    arch::riscv64::enable_interrupts();

    crate::info!("ktfs_kernel: exec'ing boot program {}", BOOT_PROGRAM);
    process::boot_exec(BOOT_PROGRAM);
}
