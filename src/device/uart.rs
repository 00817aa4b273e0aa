//! ns16550a UART driver (QEMU `virt`'s `uart0` at `0x1000_0000`, PLIC source
//! 10). Exposes read/write with internal blocking on ring buffers,
//! refilled and drained by the UART's ISR rather than by polling.
//!
//! `console_write` is the raw, non-blocking path `printk`/`panic` use: it
//! must work before the thread subsystem exists and must never itself wait
//! on a condition (a panic inside the scheduler would deadlock). The
//! `UartIo` device object used by user-space `read`/`write` syscalls is the
//! blocking path, built on the same ring buffers an ISR drains/refills.

use crate::lib::error::{KernelError, KResult};
use crate::lib::ringbuf::RingBuffer;
use crate::thread::{Condition, Lock};
use spin::Mutex;

const UART_BASE: usize = 0x1000_0000;
const REG_RBR_THR: usize = 0; // DLAB=0: receive buffer / transmit holding
const REG_IER: usize = 1;
const REG_FCR: usize = 2;
const REG_LCR: usize = 3;
const REG_LSR: usize = 5;

const LSR_DATA_READY: u8 = 1 << 0;
const LSR_THR_EMPTY: u8 = 1 << 5;

unsafe fn reg(offset: usize) -> *mut u8 {
    (UART_BASE + offset) as *mut u8
}

unsafe fn read_reg(offset: usize) -> u8 {
    reg(offset).read_volatile()
}

unsafe fn write_reg(offset: usize, val: u8) {
    reg(offset).write_volatile(val)
}

const RING_CAP: usize = 256;

struct Rings {
    rx: RingBuffer<u8, RING_CAP>,
    tx: RingBuffer<u8, RING_CAP>,
}

static RINGS: Mutex<Rings> = Mutex::new(Rings {
    rx: RingBuffer::new(),
    tx: RingBuffer::new(),
});
static NOT_EMPTY: Condition = Condition::new();
static NOT_FULL: Condition = Condition::new();
static IO_LOCK: Lock = Lock::new();

/// Bring up the UART: 8N1, FIFOs on, RX-available interrupt unmasked, PLIC
/// source enabled. Must run before `crate::lib::printk` emits anything.
pub fn init() {
    unsafe {
        write_reg(REG_LCR, 0x03); // 8 data bits, no parity, one stop bit
        write_reg(REG_FCR, 0xC7); // enable + clear FIFOs, 14-byte RX trigger
        write_reg(REG_IER, 0x01); // RX data-available interrupt only
    }
    crate::arch::riscv64::plic::enable_source(crate::arch::riscv64::plic::UART0_IRQ);
}

/// Raw, poll-based write used by `printk`/panic: never blocks on a
/// condition, safe to call before threads exist or mid-panic.
pub fn console_write(bytes: &[u8]) {
    for &b in bytes {
        unsafe {
            while read_reg(REG_LSR) & LSR_THR_EMPTY == 0 {}
            write_reg(REG_RBR_THR, b);
        }
    }
}

/// ISR entry point ("ISR-driven refill/drain"), called from
/// `device::dispatch_irq` after the PLIC claim. Drains hardware RX into the
/// ring (waking blocked readers) and refills hardware TX from the ring.
pub fn isr() {
    let mut rings = RINGS.lock();
    let mut woke_reader = false;
    unsafe {
        while read_reg(REG_LSR) & LSR_DATA_READY != 0 {
            rings.rx.push(read_reg(REG_RBR_THR));
            woke_reader = true;
        }
        while read_reg(REG_LSR) & LSR_THR_EMPTY != 0 {
            match rings.tx.pop() {
                Some(b) => write_reg(REG_RBR_THR, b),
                None => break,
            }
        }
    }
    drop(rings);
    if woke_reader {
        NOT_EMPTY.broadcast();
    }
    NOT_FULL.broadcast();
}

pub struct UartIo;

impl UartIo {
    pub fn new() -> Self {
        UartIo
    }

    /// Blocks on `NOT_EMPTY` while the RX ring is empty, then drains what's
    /// there (a short read is fine).
    pub fn read(&mut self, buf: &mut [u8]) -> KResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        IO_LOCK.acquire();
        loop {
            let mut rings = RINGS.lock();
            let mut n = 0;
            while n < buf.len() {
                match rings.rx.pop() {
                    Some(b) => {
                        buf[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }
            if n > 0 {
                IO_LOCK.release();
                return Ok(n);
            }
            drop(rings);
            NOT_EMPTY.wait();
        }
    }

    /// Blocks on `NOT_FULL` while the TX ring has no room, enqueuing bytes
    /// for the ISR to drain into hardware.
    pub fn write(&mut self, buf: &[u8]) -> KResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        IO_LOCK.acquire();
        let mut written = 0;
        while written < buf.len() {
            let mut rings = RINGS.lock();
            if rings.tx.push_checked(buf[written]) {
                written += 1;
            } else {
                drop(rings);
                NOT_FULL.wait();
                continue;
            }
            drop(rings);
        }
        // Kick the hardware in case TX was idle (ISR only runs on a
        // transition, not continuously).
        unsafe {
            let mut rings = RINGS.lock();
            while read_reg(REG_LSR) & LSR_THR_EMPTY != 0 {
                match rings.tx.pop() {
                    Some(b) => write_reg(REG_RBR_THR, b),
                    None => break,
                }
            }
        }
        IO_LOCK.release();
        Ok(written)
    }

    pub fn cntl(&mut self, cmd: i64, _arg: i64) -> KResult<i64> {
        match cmd {
            crate::io::CNTL_GETBLKSZ => Ok(1),
            _ => Err(KernelError::Unsupported),
        }
    }
}
