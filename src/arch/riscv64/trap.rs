//! Trap entry/exit and `scause` dispatch.
//!
//! Register save/restore across the user/kernel boundary lives entirely in
//! this module: `TrapFrame` is the `repr(C)` contract the assembly and the
//! dispatcher agree on byte-for-byte, and nothing above this layer assumes
//! more than "a trap delivers a saved register frame, and resuming it is a
//! single call".

use core::arch::global_asm;
use riscv::register::{scause, sepc, sstatus, stval, stvec};

/// Saved register state at a trap boundary. Field order and size must match
/// the save/restore sequence in the assembly below exactly.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TrapFrame {
    pub regs: [usize; 32], // x0..x31, x0 (zero) unused but kept for offset stability
    pub sepc: usize,
    pub sstatus: usize,
    pub kernel_sp: usize,
    pub kernel_satp: usize,
}

impl TrapFrame {
    pub const fn zeroed() -> Self {
        Self {
            regs: [0; 32],
            sepc: 0,
            sstatus: 0,
            kernel_sp: 0,
            kernel_satp: 0,
        }
    }

    pub fn a(&self, n: usize) -> usize {
        self.regs[10 + n] // a0..a5 are x10..x15
    }
    pub fn set_a0(&mut self, v: usize) {
        self.regs[10] = v;
    }
    pub fn sp(&self) -> usize {
        self.regs[2]
    }
    pub fn set_sp(&mut self, v: usize) {
        self.regs[2] = v;
    }
}

global_asm!(
    r#"
    .section .text
    .align 4
    .global __trap_vector
__trap_vector:
    csrrw sp, sscratch, sp
    addi sp, sp, -280
    sd x1, 8(sp)
    sd x3, 24(sp)
    sd x4, 32(sp)
    sd x5, 40(sp)
    sd x6, 48(sp)
    sd x7, 56(sp)
    sd x8, 64(sp)
    sd x9, 72(sp)
    sd x10, 80(sp)
    sd x11, 88(sp)
    sd x12, 96(sp)
    sd x13, 104(sp)
    sd x14, 112(sp)
    sd x15, 120(sp)
    sd x16, 128(sp)
    sd x17, 136(sp)
    sd x18, 144(sp)
    sd x19, 152(sp)
    sd x20, 160(sp)
    sd x21, 168(sp)
    sd x22, 176(sp)
    sd x23, 184(sp)
    sd x24, 192(sp)
    sd x25, 200(sp)
    sd x26, 208(sp)
    sd x27, 216(sp)
    sd x28, 224(sp)
    sd x29, 232(sp)
    sd x30, 240(sp)
    sd x31, 248(sp)
    csrr t0, sscratch
    sd t0, 16(sp)
    csrr t0, sepc
    sd t0, 256(sp)
    csrr t0, sstatus
    sd t0, 264(sp)
    mv a0, sp
    call rust_trap_handler
    ld t0, 256(sp)
    csrw sepc, t0
    ld t0, 264(sp)
    csrw sstatus, t0
    ld x1, 8(sp)
    ld x3, 24(sp)
    ld x4, 32(sp)
    ld x5, 40(sp)
    ld x6, 48(sp)
    ld x7, 56(sp)
    ld x8, 64(sp)
    ld x9, 72(sp)
    ld x10, 80(sp)
    ld x11, 88(sp)
    ld x12, 96(sp)
    ld x13, 104(sp)
    ld x14, 112(sp)
    ld x15, 120(sp)
    ld x16, 128(sp)
    ld x17, 136(sp)
    ld x18, 144(sp)
    ld x19, 152(sp)
    ld x20, 160(sp)
    ld x21, 168(sp)
    ld x22, 176(sp)
    ld x23, 184(sp)
    ld x24, 192(sp)
    ld x25, 200(sp)
    ld x26, 208(sp)
    ld x27, 216(sp)
    ld x28, 224(sp)
    ld x29, 232(sp)
    ld x30, 240(sp)
    ld x31, 248(sp)
    ld sp, 16(sp)
    csrrw sp, sscratch, sp
    sret
"#
);

extern "C" {
    fn __trap_vector();
}

/// Point `stvec` at the trap vector in direct mode.
pub fn install() {
    unsafe {
        stvec::write(__trap_vector as usize, stvec::TrapMode::Direct);
    }
}

/// `scause` interpretation shared with callers that need to tell interrupt
/// from exception without re-deriving the encoding.
pub enum TrapCause {
    TimerInterrupt,
    ExternalInterrupt,
    UserEcall,
    PageFault { faulting_vma: usize },
    Other,
}

fn classify(cause: scause::Scause, stval: usize) -> TrapCause {
    use riscv::register::scause::{Exception, Interrupt, Trap};
    match cause.cause() {
        Trap::Interrupt(Interrupt::SupervisorTimer) => TrapCause::TimerInterrupt,
        Trap::Interrupt(Interrupt::SupervisorExternal) => TrapCause::ExternalInterrupt,
        Trap::Exception(Exception::UserEnvCall) => TrapCause::UserEcall,
        Trap::Exception(Exception::StorePageFault)
        | Trap::Exception(Exception::LoadPageFault)
        | Trap::Exception(Exception::InstructionPageFault) => {
            TrapCause::PageFault { faulting_vma: stval }
        }
        _ => TrapCause::Other,
    }
}

/// Entry point called from assembly with the freshly-saved frame. Dispatches
/// to the syscall layer, the fault handler, or the scheduler's tick
/// callback, then returns so the assembly can restore and `sret`.
#[no_mangle]
extern "C" fn rust_trap_handler(frame: &mut TrapFrame) {
    let cause = scause::read();
    let tval = stval::read();
    match classify(cause, tval) {
        TrapCause::UserEcall => {
            frame.sepc += 4; // advance past `ecall`, 
            let result = crate::syscall::dispatch(frame);
            frame.set_a0(result as usize);
        }
        TrapCause::PageFault { faulting_vma } => {
            if !crate::mm::fault::handle_umode_page_fault(faulting_vma) {
                panic!("fatal page fault at {:#x}, sepc={:#x}", faulting_vma, frame.sepc);
            }
        }
        TrapCause::TimerInterrupt => {
            super::schedule_next_tick();
            crate::thread::sched::on_timer_tick();
        }
        TrapCause::ExternalInterrupt => {
            if let Some(irq) = super::plic::claim() {
                crate::device::dispatch_irq(irq);
                super::plic::complete(irq);
            }
        }
        TrapCause::Other => {
            panic!(
                "unhandled trap: scause={:#x} stval={:#x} sepc={:#x}",
                cause.bits(),
                tval,
                frame.sepc
            );
        }
    }
}

/// Construct the initial trap frame for a freshly-loaded user program.
pub fn user_entry_frame(entry: usize, user_sp: usize, a0: usize, a1: usize) -> TrapFrame {
    let mut frame = TrapFrame::zeroed();
    frame.sepc = entry;
    frame.set_sp(user_sp);
    frame.set_a0(a0);
    frame.regs[11] = a1; // a1
    // previous privilege = user (SPP, bit 8, cleared), previous interrupt-enable = 1 (SPIE, bit 5).

    let mut bits = sstatus::read().bits();
    bits &= !(1 << 8);
    bits |= 1 << 5;
    frame.sstatus = bits;
    frame
}

global_asm!(
    r#"
    .section .text
    .align 4
    .global __enter_user
__enter_user:
    ld t0, 256(a0)
    csrw sepc, t0
    ld t0, 264(a0)
    csrw sstatus, t0
    ld t0, 272(a0)
    csrw sscratch, t0
    ld x1, 8(a0)
    ld x2, 16(a0)
    ld x3, 24(a0)
    ld x4, 32(a0)
    ld x5, 40(a0)
    ld x6, 48(a0)
    ld x7, 56(a0)
    ld x8, 64(a0)
    ld x9, 72(a0)
    ld x11, 88(a0)
    ld x12, 96(a0)
    ld x13, 104(a0)
    ld x14, 112(a0)
    ld x15, 120(a0)
    ld x16, 128(a0)
    ld x17, 136(a0)
    ld x18, 144(a0)
    ld x19, 152(a0)
    ld x20, 160(a0)
    ld x21, 168(a0)
    ld x22, 176(a0)
    ld x23, 184(a0)
    ld x24, 192(a0)
    ld x25, 200(a0)
    ld x26, 208(a0)
    ld x27, 216(a0)
    ld x28, 224(a0)
    ld x29, 232(a0)
    ld x30, 240(a0)
    ld x31, 248(a0)
    ld x10, 80(a0)
    sret
"#
);

extern "C" {
    fn __enter_user(frame: *const TrapFrame) -> !;
}

/// Drop to user mode through a freshly-built `TrapFrame`. `sscratch` is
/// loaded from `frame.kernel_sp` first so the very next trap taken from user
/// mode finds the right kernel stack via `__trap_vector`'s usual
/// `csrrw sp, sscratch, sp`. Never returns.
pub fn enter_user(frame: &TrapFrame) -> ! {
    unsafe { __enter_user(frame as *const TrapFrame) }
}
