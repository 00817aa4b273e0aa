//! VirtIO block driver. Exposes `readat`/`writeat`: one request in flight
//! at a time, serialized by a per-device `Lock`, completion signalled by
//! the device's ISR broadcasting a `Condition` rather than the caller
//! busy-polling the used ring.

use super::virtio::{Queue, Transport};
use crate::lib::error::{KernelError, KResult};
use crate::mm::phys;
use crate::thread::{Condition, Lock};
use spin::Mutex;

pub const SECTOR_SIZE: usize = 512;
const VIRTIO_BLK_T_IN: u32 = 0;
const VIRTIO_BLK_T_OUT: u32 = 1;

#[repr(C)]
struct ReqHeader {
    kind: u32,
    reserved: u32,
    sector: u64,
}

struct BlkState {
    queue: Queue,
    header_page: usize, // scratch for the 16-byte request header
    status_page: usize, // scratch for the 1-byte status
}

static BLK: Mutex<Option<BlkState>> = Mutex::new(None);
static IO_LOCK: Lock = Lock::new();
static COMPLETED: Condition = Condition::new();

pub fn probe(transport: Transport, irq: u32) {
    transport.handshake();
    let queue = transport.setup_queue(0, 8);
    let header_page = phys::alloc_page().expect("vioblk: no memory for request header");
    let status_page = phys::alloc_page().expect("vioblk: no memory for status byte");
    *BLK.lock() = Some(BlkState { queue, header_page, status_page });
    crate::arch::riscv64::plic::enable_source(irq);
    super::register("vioblk", 0, irq, |_| Ok(super::new_io(super::DeviceIo::VirtioBlk(BlkIo))));
    crate::info!("vioblk: ready (irq {})", irq);
}

pub fn isr(_instance: u32) {
    let mut guard = BLK.lock();
    if let Some(state) = guard.as_mut() {
        state.queue.ack_interrupt();
    }
    drop(guard);
    COMPLETED.broadcast();
}

fn do_request(sector: u64, data_addr: usize, len: u32, is_write: bool) -> KResult<()> {
    IO_LOCK.acquire();
    let result = do_request_locked(sector, data_addr, len, is_write);
    IO_LOCK.release();
    result
}

/// Runs with `IO_LOCK` held (one request in flight per device).
fn do_request_locked(sector: u64, data_addr: usize, len: u32, is_write: bool) -> KResult<()> {
    {
        let mut guard = BLK.lock();
        let state = match guard.as_mut() {
            Some(s) => s,
            None => return Err(KernelError::IoError),
        };

        let header = state.header_page as *mut ReqHeader;
        unsafe {
            (*header).kind = if is_write { VIRTIO_BLK_T_OUT } else { VIRTIO_BLK_T_IN };
            (*header).reserved = 0;
            (*header).sector = sector;
            (state.status_page as *mut u8).write_volatile(0xff);
        }

        let bufs = [
            (state.header_page, core::mem::size_of::<ReqHeader>() as u32, false),
            (data_addr, len, !is_write),
            (state.status_page, 1, true),
        ];
        state.queue.submit(&bufs);
    }

    loop {
        let done = {
            let mut guard = BLK.lock();
            let state = guard.as_mut().unwrap();
            if state.queue.has_completed() {
                state.queue.consume_used();
                true
            } else {
                false
            }
        };
        if done {
            break;
        }
        COMPLETED.wait();
    }

    let status = unsafe { (BLK.lock().as_ref().unwrap().status_page as *const u8).read_volatile() };
    if status == 0 {
        Ok(())
    } else {
        Err(KernelError::IoError)
    }
}

pub struct BlkIo;

impl BlkIo {
    /// `pos`/`buf.len()` must both be sector-aligned; the block cache (the
    /// only caller in this kernel) only ever issues whole-block requests.
    pub fn readat(&mut self, pos: u64, buf: &mut [u8]) -> KResult<usize> {
        if pos as usize % SECTOR_SIZE != 0 || buf.len() % SECTOR_SIZE != 0 || buf.is_empty() {
            return Err(KernelError::InvalidArgument);
        }
        do_request(pos / SECTOR_SIZE as u64, buf.as_mut_ptr() as usize, buf.len() as u32, false)?;
        Ok(buf.len())
    }

    pub fn writeat(&mut self, pos: u64, buf: &[u8]) -> KResult<usize> {
        if pos as usize % SECTOR_SIZE != 0 || buf.len() % SECTOR_SIZE != 0 || buf.is_empty() {
            return Err(KernelError::InvalidArgument);
        }
        do_request(pos / SECTOR_SIZE as u64, buf.as_ptr() as usize, buf.len() as u32, true)?;
        Ok(buf.len())
    }

    pub fn cntl(&mut self, cmd: i64, _arg: i64) -> KResult<i64> {
        match cmd {
            crate::io::CNTL_GETBLKSZ => Ok(SECTOR_SIZE as i64),
            _ => Err(KernelError::Unsupported),
        }
    }
}
