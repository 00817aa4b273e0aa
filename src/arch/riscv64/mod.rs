//! RISC-V (Sv39, single-hart, QEMU `virt`) architecture support.
//!
//! Everything below `src/mm`, `src/thread`, `src/io` etc. is architecture
//! neutral; this module is the one place that speaks CSRs, `sfence.vma`, and
//! trap vectors. Trap entry/exit and the exact `ecall` register save/restore
//! sequence are an external collaborator as far as the rest of the kernel is
//! concerned: callers above this module only see a `TrapFrame` and a
//! "resume with this frame" call.

pub mod boot;
pub mod context;
pub mod plic;
pub mod sv39;
pub mod trap;

use riscv::asm::wfi;
use riscv::register::sstatus;

/// Hart id of the single supported hart.
pub const BOOT_HART: usize = 0;

/// Kernel link/load address, matching `boot.rs`'s linker script expectations
/// and QEMU `virt`'s RAM base.
pub const KERNEL_BASE: usize = 0x8000_0000;

/// Architecture bring-up: install the trap vector, unmask the timer
/// interrupt source, and set up the PLIC for the devices this kernel drives.
pub fn init() {
    trap::install();
    plic::init();
    unsafe {
        riscv::register::sie::set_stimer();
        riscv::register::sie::set_sext();
    }
    schedule_next_tick();
}

/// Disable supervisor interrupts, returning whether they were enabled
/// beforehand so the caller can restore the prior state exactly.
#[inline]
pub fn disable_interrupts() -> bool {
    let was_enabled = sstatus::read().sie();
    unsafe { sstatus::clear_sie() };
    was_enabled
}

/// Restore a previously-saved interrupt-enable state.
#[inline]
pub fn restore_interrupts(was_enabled: bool) {
    if was_enabled {
        unsafe { sstatus::set_sie() };
    }
}

#[inline]
pub fn enable_interrupts() {
    unsafe { sstatus::set_sie() };
}

/// Halt the hart forever. Used both for "halt success" (idle thread with an
/// empty ready list) and "halt failure" (panic).
pub fn halt_forever() -> ! {
    disable_interrupts();
    loop {
        wfi();
    }
}

/// Timer tick period, ~20ms, expressed in core-clock cycles.
/// QEMU `virt`'s CLINT ticks at 10MHz.
pub const TIMER_FREQ_HZ: u64 = 10_000_000;
const TICK_PERIOD: u64 = TIMER_FREQ_HZ / 50; // ~20ms

/// Current value of the free-running timer (the
/// syscall layer polls this against a deadline rather than owning its own
/// tick source).
#[inline]
pub fn read_time() -> u64 {
    riscv::register::time::read64()
}

/// Program the next timer interrupt via the SBI timer extension. Real
/// hardware/QEMU OpenSBI supplies this call; there is no CLINT mtimecmp MMIO
/// access available from supervisor mode.
pub fn schedule_next_tick() {
    let now = riscv::register::time::read64();
    sbi_set_timer(now + TICK_PERIOD);
}

fn sbi_set_timer(stime_value: u64) {
    const SBI_SET_TIMER: usize = 0;
    unsafe {
        core::arch::asm!(
            "ecall",
            in("a7") 0x54494d45usize, // "TIME" extension id
            in("a6") SBI_SET_TIMER,
            in("a0") stime_value,
            out("a1") _,
            out("a2") _,
            out("a3") _,
            out("a4") _,
            out("a5") _,
        );
    }
}

/// Flush the whole TLB. Page-table operations must call this after any
/// structural change visible to the currently active address space.
#[inline]
pub fn sfence_vma_all() {
    riscv::asm::sfence_vma_all();
}
