//! Memory-backed I/O endpoint: wraps a fixed backing buffer and
//! a logical size. `readat`/`writeat` clamp to that size rather than
//! erroring past it; `SETEND` may shrink the logical size but never grow it
//! past the buffer's capacity.

use alloc::vec;
use alloc::vec::Vec;

use crate::lib::error::{KernelError, KResult};

pub struct MemIo {
    buffer: Vec<u8>,
    size: usize,
}

impl MemIo {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: vec![0u8; capacity],
            size: capacity,
        }
    }

    pub fn readat(&mut self, pos: u64, buf: &mut [u8]) -> KResult<usize> {
        let pos = pos as usize;
        if pos >= self.size {
            return Ok(0);
        }
        let n = buf.len().min(self.size - pos);
        buf[..n].copy_from_slice(&self.buffer[pos..pos + n]);
        Ok(n)
    }

    pub fn writeat(&mut self, pos: u64, buf: &[u8]) -> KResult<usize> {
        let pos = pos as usize;
        if pos >= self.size {
            return Ok(0);
        }
        let n = buf.len().min(self.size - pos);
        self.buffer[pos..pos + n].copy_from_slice(&buf[..n]);
        Ok(n)
    }

    pub fn cntl(&mut self, cmd: i64, arg: i64) -> KResult<i64> {
        match cmd {
            crate::io::CNTL_GETBLKSZ => Ok(1),
            crate::io::CNTL_GETEND => Ok(self.size as i64),
            crate::io::CNTL_SETEND => {
                let new_end = arg as usize;
                if new_end > self.size || new_end > self.buffer.len() {
                    return Err(KernelError::Unsupported);
                }
                self.size = new_end;
                Ok(0)
            }
            _ => Err(KernelError::Unsupported),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readat_writeat_clamp_to_size() {
        let mut m = MemIo::new(8);
        let n = m.writeat(4, &[1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(n, 4); // clamped to size - pos
        let mut out = [0u8; 8];
        let n = m.readat(4, &mut out).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&out[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn setend_shrinks_but_not_grows() {
        let mut m = MemIo::new(8);
        assert_eq!(m.cntl(crate::io::CNTL_SETEND, 4), Ok(0));
        assert_eq!(m.cntl(crate::io::CNTL_GETEND, 0), Ok(4));
        assert!(m.cntl(crate::io::CNTL_SETEND, 20).is_err());
    }
}
