//! VirtIO entropy source. A single device-writable descriptor per request:
//! the device fills up to the buffer's length with random bytes and reports
//! how many in the used-ring length field.

use super::virtio::{Queue, Transport};
use crate::lib::error::{KernelError, KResult};
use crate::mm::phys;
use crate::thread::{Condition, Lock};
use spin::Mutex;

const SCRATCH_LEN: usize = 256;

struct RngState {
    queue: Queue,
    scratch_page: usize,
}

static RNG: Mutex<Option<RngState>> = Mutex::new(None);
static IO_LOCK: Lock = Lock::new();
static COMPLETED: Condition = Condition::new();

pub fn probe(transport: Transport, irq: u32) {
    transport.handshake();
    let queue = transport.setup_queue(0, 4);
    let scratch_page = phys::alloc_page().expect("viorng: no memory for scratch buffer");
    *RNG.lock() = Some(RngState { queue, scratch_page });
    crate::arch::riscv64::plic::enable_source(irq);
    super::register("rng", 0, irq, |_| Ok(super::new_io(super::DeviceIo::VirtioRng(RngIo))));
    crate::info!("viorng: ready (irq {})", irq);
}

pub fn isr(_instance: u32) {
    let mut guard = RNG.lock();
    if let Some(state) = guard.as_mut() {
        state.queue.ack_interrupt();
    }
    drop(guard);
    COMPLETED.broadcast();
}

pub struct RngIo;

impl RngIo {
    pub fn read(&mut self, buf: &mut [u8]) -> KResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min(SCRATCH_LEN);

        IO_LOCK.acquire();
        let filled = read_locked(want);
        IO_LOCK.release();

        let n = filled?;
        let scratch = RNG.lock().as_ref().unwrap().scratch_page;
        unsafe {
            core::ptr::copy_nonoverlapping(scratch as *const u8, buf.as_mut_ptr(), n);
        }
        Ok(n)
    }

    pub fn cntl(&mut self, cmd: i64, _arg: i64) -> KResult<i64> {
        match cmd {
            crate::io::CNTL_GETBLKSZ => Ok(1),
            _ => Err(KernelError::Unsupported),
        }
    }
}

fn read_locked(want: usize) -> KResult<usize> {
    {
        let mut guard = RNG.lock();
        let state = match guard.as_mut() {
            Some(s) => s,
            None => return Err(KernelError::IoError),
        };
        state.queue.submit(&[(state.scratch_page, want as u32, true)]);
    }

    loop {
        let completed = {
            let mut guard = RNG.lock();
            let state = guard.as_mut().unwrap();
            state.queue.has_completed()
        };
        if completed {
            break;
        }
        COMPLETED.wait();
    }

    let (_, len) = {
        let mut guard = RNG.lock();
        let state = guard.as_mut().unwrap();
        state.queue.consume_used_with_len()
    };
    Ok((len as usize).min(want))
}
