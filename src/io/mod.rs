//! I/O object model: a uniform reference-counted stream object
//! with a small op set {read, write, readat, writeat, cntl} plus variants for
//! memory-backed, seekable-wrapped, pipe, device, and KTFS-file endpoints.
//!
//! `IoKind` is a tagged variant (sum type) whose arms carry their backing
//! data directly, rather than an `offsetof`-based downcast from a generic I/O
//! object to a concrete device: the vtable becomes a match on the tag, and
//! there is no `dyn` trait object anywhere in this module.
//!
//! Refcounting is `Arc`, not a hand-rolled counter: every `dup` is
//! `IoRef::clone`, every `close` is a dropped `IoRef`, and the close hook
//! that should run at refcount zero is just each variant's `Drop` impl
//! (see `pipe::ReadEnd`/`WriteEnd`).

pub mod mem;
pub mod pipe;
pub mod seekable;

use alloc::sync::Arc;
use spin::Mutex;

use crate::lib::error::{KernelError, KResult};

/// `cntl` command set. Unknown commands return `Unsupported`.
pub const CNTL_GETBLKSZ: i64 = 0;
pub const CNTL_GETPOS: i64 = 1;
pub const CNTL_SETPOS: i64 = 2;
pub const CNTL_GETEND: i64 = 3;
pub const CNTL_SETEND: i64 = 4;

pub enum IoKind {
    Mem(mem::MemIo),
    Seekable(seekable::Seekable),
    PipeRead(pipe::ReadEnd),
    PipeWrite(pipe::WriteEnd),
    Device(crate::device::DeviceIo),
    /// A raw KTFS file endpoint (readat/writeat only). Never installed
    /// directly into a process iotab: `fs::ktfs::open` always wraps it in a
    /// `Seekable` before handing it back, giving every file a seek position.
    KtfsFile(crate::fs::ktfs::FileIo),
}

pub struct IoObject {
    kind: Mutex<IoKind>,
}

pub type IoRef = Arc<IoObject>;

impl IoObject {
    pub fn new(kind: IoKind) -> IoRef {
        Arc::new(IoObject {
            kind: Mutex::new(kind),
        })
    }

    /// `read(io, buf, n)`. `n == 0` returns 0; short reads are
    /// allowed and are not an error.
    pub fn read(&self, buf: &mut [u8]) -> KResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut kind = self.kind.lock();
        match &mut *kind {
            IoKind::Mem(_) | IoKind::KtfsFile(_) => Err(KernelError::Unsupported),
            IoKind::Seekable(s) => s.read(buf),
            IoKind::PipeRead(p) => p.read(buf),
            IoKind::PipeWrite(_) => Err(KernelError::Unsupported),
            IoKind::Device(d) => d.read(buf),
        }
    }

    /// `write(io, buf, n)`: retried internally until all bytes are written,
    /// an error surfaces, or a call makes zero progress.
    pub fn write(&self, buf: &[u8]) -> KResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut total = 0usize;
        while total < buf.len() {
            match self.write_once(&buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) => {
                    if total > 0 {
                        break;
                    }
                    return Err(e);
                }
            }
        }
        Ok(total)
    }

    fn write_once(&self, buf: &[u8]) -> KResult<usize> {
        let mut kind = self.kind.lock();
        match &mut *kind {
            IoKind::Mem(_) | IoKind::KtfsFile(_) => Err(KernelError::Unsupported),
            IoKind::Seekable(s) => s.write(buf),
            IoKind::PipeWrite(p) => p.write(buf),
            IoKind::PipeRead(_) => Err(KernelError::Unsupported),
            IoKind::Device(d) => d.write(buf),
        }
    }

    pub fn readat(&self, pos: u64, buf: &mut [u8]) -> KResult<usize> {
        let mut kind = self.kind.lock();
        match &mut *kind {
            IoKind::Mem(m) => m.readat(pos, buf),
            IoKind::Seekable(s) => s.readat(pos, buf),
            IoKind::KtfsFile(f) => f.readat(pos, buf),
            IoKind::Device(d) => d.readat(pos, buf),
            IoKind::PipeRead(_) | IoKind::PipeWrite(_) => Err(KernelError::Unsupported),
        }
    }

    pub fn writeat(&self, pos: u64, buf: &[u8]) -> KResult<usize> {
        let mut kind = self.kind.lock();
        match &mut *kind {
            IoKind::Mem(m) => m.writeat(pos, buf),
            IoKind::Seekable(s) => s.writeat(pos, buf),
            IoKind::KtfsFile(f) => f.writeat(pos, buf),
            IoKind::Device(d) => d.writeat(pos, buf),
            IoKind::PipeRead(_) | IoKind::PipeWrite(_) => Err(KernelError::Unsupported),
        }
    }

    pub fn cntl(&self, cmd: i64, arg: i64) -> KResult<i64> {
        let mut kind = self.kind.lock();
        match &mut *kind {
            IoKind::Mem(m) => m.cntl(cmd, arg),
            IoKind::Seekable(s) => s.cntl(cmd, arg),
            IoKind::PipeRead(p) => p.cntl(cmd, arg),
            IoKind::PipeWrite(p) => p.cntl(cmd, arg),
            IoKind::Device(d) => d.cntl(cmd, arg),
            IoKind::KtfsFile(f) => f.cntl(cmd, arg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_of_zero_length_is_a_noop() {
        let io = IoObject::new(IoKind::Mem(mem::MemIo::new(16)));
        assert_eq!(io.read(&mut []), Ok(0));
        assert_eq!(io.write(&[]), Ok(0));
    }
}
