//! Goldfish RTC driver (QEMU `virt`'s `rtc0` at `0x0010_1000`). Read-only:
//! `read` hands back an 8-byte little-endian nanosecond timestamp, registered
//! as `(name, instance)` = `("rtc", 0)`. No interrupt source — this device is
//! polled, never claimed off the PLIC.

use crate::lib::error::{KernelError, KResult};

const RTC_BASE: usize = 0x0010_1000;
const REG_TIME_LOW: usize = 0x00;
const REG_TIME_HIGH: usize = 0x04;

fn read_time_ns() -> u64 {
    unsafe {
        let low = ((RTC_BASE + REG_TIME_LOW) as *const u32).read_volatile() as u64;
        let high = ((RTC_BASE + REG_TIME_HIGH) as *const u32).read_volatile() as u64;
        (high << 32) | low
    }
}

pub fn init() {}

pub struct RtcIo;

impl RtcIo {
    pub fn new() -> Self {
        RtcIo
    }

    /// Clamps to 8 bytes; a shorter caller buffer is just a short read.
    pub fn read(&mut self, buf: &mut [u8]) -> KResult<usize> {
        let ts = read_time_ns().to_le_bytes();
        let n = buf.len().min(ts.len());
        buf[..n].copy_from_slice(&ts[..n]);
        Ok(n)
    }

    pub fn cntl(&mut self, cmd: i64, _arg: i64) -> KResult<i64> {
        match cmd {
            crate::io::CNTL_GETBLKSZ => Ok(1),
            _ => Err(KernelError::Unsupported),
        }
    }
}
