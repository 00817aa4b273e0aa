//! Seekable wrapper: turns any `readat`/`writeat` endpoint into
//! a cursor-tracking stream. `read`/`write` thread a position through;
//! `readat`/`writeat` pass straight through to the backing object and leave
//! the cursor untouched.

use super::{IoRef, CNTL_GETBLKSZ, CNTL_GETEND, CNTL_GETPOS, CNTL_SETEND, CNTL_SETPOS};
use crate::lib::error::{KernelError, KResult};

pub struct Seekable {
    backing: IoRef,
    pos: u64,
    end: u64,
    blksz: i64,
}

impl Seekable {
    pub fn new(backing: IoRef) -> KResult<Self> {
        let blksz = backing.cntl(CNTL_GETBLKSZ, 0)?;
        let end = backing.cntl(CNTL_GETEND, 0)? as u64;
        Ok(Self { backing, pos: 0, end, blksz })
    }

    /// `readat(pos)` followed by `pos += n`.
    pub fn read(&mut self, buf: &mut [u8]) -> KResult<usize> {
        let n = self.backing.readat(self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    /// Extends the backing object via `SETEND` first if the write would
    /// land past the current end, then writes and advances the
    /// cursor.
    pub fn write(&mut self, buf: &[u8]) -> KResult<usize> {
        let want_end = self.pos + buf.len() as u64;
        if want_end > self.end {
            self.backing.cntl(CNTL_SETEND, want_end as i64)?;
            self.end = self.backing.cntl(CNTL_GETEND, 0)? as u64;
        }
        let n = self.backing.writeat(self.pos, buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    pub fn readat(&mut self, pos: u64, buf: &mut [u8]) -> KResult<usize> {
        self.backing.readat(pos, buf)
    }

    pub fn writeat(&mut self, pos: u64, buf: &[u8]) -> KResult<usize> {
        self.backing.writeat(pos, buf)
    }

    pub fn cntl(&mut self, cmd: i64, arg: i64) -> KResult<i64> {
        match cmd {
            CNTL_GETBLKSZ => Ok(self.blksz),
            CNTL_GETPOS => Ok(self.pos as i64),
            CNTL_SETPOS => {
                let new_pos = arg as u64;
                if self.blksz > 0 && new_pos % self.blksz as u64 != 0 {
                    return Err(KernelError::InvalidArgument);
                }
                if new_pos > self.end {
                    return Err(KernelError::InvalidArgument);
                }
                self.pos = new_pos;
                Ok(0)
            }
            CNTL_GETEND => Ok(self.end as i64),
            CNTL_SETEND => {
                self.backing.cntl(CNTL_SETEND, arg)?;
                self.end = self.backing.cntl(CNTL_GETEND, 0)? as u64;
                Ok(0)
            }
            _ => self.backing.cntl(cmd, arg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{mem::MemIo, IoKind, IoObject};

    fn seekable_over_mem(cap: usize) -> Seekable {
        let io = IoObject::new(IoKind::Mem(MemIo::new(cap)));
        Seekable::new(io).unwrap()
    }

    #[test]
    fn read_advances_position() {
        let mut s = seekable_over_mem(16);
        s.writeat(0, b"abcdefgh").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(s.read(&mut buf), Ok(4));
        assert_eq!(&buf, b"abcd");
        assert_eq!(s.read(&mut buf), Ok(4));
        assert_eq!(&buf, b"efgh");
    }

    #[test]
    fn setpos_past_end_is_rejected() {
        let mut s = seekable_over_mem(16);
        assert!(s.cntl(CNTL_SETPOS, 32).is_err());
    }
}
