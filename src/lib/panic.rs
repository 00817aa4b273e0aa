//! Panic handling. A panic halts the hart: panics are reserved for
//! corruption detected by assertions, main-process exit, and impossible
//! device states, and the kernel distinguishes "halt success" from "halt
//! failure" only in that a panic is always the latter.

use core::panic::PanicInfo;
use core::sync::atomic::{AtomicBool, Ordering};

static PANICKING: AtomicBool = AtomicBool::new(false);

pub fn panic_handler(info: &PanicInfo) -> ! {
    if PANICKING.swap(true, Ordering::SeqCst) {
        crate::device::uart::console_write(b"\n!!! panic while panicking, halting !!!\n");
        crate::arch::riscv64::halt_forever();
    }

    crate::arch::riscv64::disable_interrupts();

    crate::error!("kernel panic: {}", info);
    for line in crate::lib::printk::recent_lines() {
        let msg = core::str::from_utf8(&line.message[..line.len]).unwrap_or("<binary>");
        crate::error!("  (recent) [{}] {}", line.level.as_str(), msg);
    }
    crate::error!("-- halt failure --");

    crate::arch::riscv64::halt_forever();
}
