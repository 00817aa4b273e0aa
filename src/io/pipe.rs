//! Bounded ring-buffer pipe: a 4096-byte ring shared by one
//! read endpoint and one write endpoint, each living inside its own
//! `IoObject`. `iodup` duplicates the owning `IoRef`'s `Arc` refcount, not
//! the endpoint itself, so "reader/writer refcount" below is really "has the
//! sole `ReadEnd`/`WriteEnd` been dropped yet" — exactly what deciding EOF
//! versus a broken pipe needs to know.

use alloc::sync::Arc;
use spin::Mutex;

use crate::arch::riscv64::sv39::PAGE_SIZE;
use crate::arch::riscv64::{disable_interrupts, restore_interrupts};
use crate::lib::error::{KernelError, KResult};
use crate::thread::Condition;

const CAP: usize = 4096;

struct Core {
    buf: [u8; CAP],
    head: u16, // ever-increasing mod 65536; `tail - head` (wrapping) is the fill count
    tail: u16,
    readers: u32,
    writers: u32,
}

struct Shared {
    core: Mutex<Core>,
    not_empty: Condition,
    not_full: Condition,
}

pub struct ReadEnd {
    shared: Arc<Shared>,
}

pub struct WriteEnd {
    shared: Arc<Shared>,
}

pub fn new_pipe() -> (WriteEnd, ReadEnd) {
    let shared = Arc::new(Shared {
        core: Mutex::new(Core {
            buf: [0u8; CAP],
            head: 0,
            tail: 0,
            readers: 1,
            writers: 1,
        }),
        not_empty: Condition::new(),
        not_full: Condition::new(),
    });
    (WriteEnd { shared: shared.clone() }, ReadEnd { shared })
}

impl ReadEnd {
    /// Blocks on `not_empty` while the ring is empty and a writer still
    /// exists; returns 0 (EOF) once the writer is gone.
    pub fn read(&mut self, buf: &mut [u8]) -> KResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            // Disabled across the empty/writers check and, when blocking,
            // straight into `wait`'s own enqueue onto `not_empty`'s wait
            // list: otherwise a preempting writer could fill the ring and
            // broadcast in the gap between the check below and actually
            // registering as a waiter, losing the wakeup.
            let was_enabled = disable_interrupts();
            let mut core = self.shared.core.lock();
            let avail = core.tail.wrapping_sub(core.head) as usize;
            if avail > 0 {
                let n = buf.len().min(avail);
                let head = core.head;
                for i in 0..n {
                    buf[i] = core.buf[(head as usize + i) % CAP];
                }
                core.head = core.head.wrapping_add(n as u16);
                drop(core);
                restore_interrupts(was_enabled);
                self.shared.not_full.broadcast();
                return Ok(n);
            }
            if core.writers == 0 {
                drop(core);
                restore_interrupts(was_enabled);
                return Ok(0);
            }
            drop(core);
            self.shared.not_empty.wait();
        }
    }

    /// `GETEND` on a read endpoint is the number of readable bytes.
    pub fn cntl(&mut self, cmd: i64, _arg: i64) -> KResult<i64> {
        match cmd {
            crate::io::CNTL_GETBLKSZ => Ok(1),
            crate::io::CNTL_GETEND => {
                let core = self.shared.core.lock();
                Ok(core.tail.wrapping_sub(core.head) as i64)
            }
            _ => Err(KernelError::Unsupported),
        }
    }
}

impl Drop for ReadEnd {
    fn drop(&mut self) {
        self.shared.core.lock().readers -= 1;
        // Wake any writer blocked on `not_full`: with no reader left it
        // must re-check and return broken-pipe instead of waiting forever.
        self.shared.not_full.broadcast();
    }
}

impl WriteEnd {
    /// Writes byte by byte, blocking on `not_full` while the
    /// ring is full and a reader still exists; re-checks reader presence on
    /// every byte so a reader that vanishes mid-write is caught promptly.
    /// Broadcasts `not_empty` every `PAGE_SIZE` bytes and once more at the
    /// end.
    pub fn write(&mut self, buf: &[u8]) -> KResult<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut written = 0usize;
        for &byte in buf {
            loop {
                // Same discipline as `ReadEnd::read`: the full/readers check
                // and the enqueue onto `not_full` (when blocking) must be one
                // interrupts-disabled span, or a preempting reader can drain
                // the ring and broadcast before we've registered as a waiter.
                let was_enabled = disable_interrupts();
                let mut core = self.shared.core.lock();
                if core.readers == 0 {
                    drop(core);
                    restore_interrupts(was_enabled);
                    if written > 0 {
                        return Ok(written);
                    }
                    return Err(KernelError::BrokenPipe);
                }
                let len = core.tail.wrapping_sub(core.head) as usize;
                if len < CAP {
                    let idx = core.tail as usize % CAP;
                    core.buf[idx] = byte;
                    core.tail = core.tail.wrapping_add(1);
                    written += 1;
                    drop(core);
                    restore_interrupts(was_enabled);
                    if written % PAGE_SIZE == 0 {
                        self.shared.not_empty.broadcast();
                    }
                    break;
                }
                drop(core);
                self.shared.not_full.wait();
            }
        }
        self.shared.not_empty.broadcast();
        Ok(written)
    }

    /// `GETEND` on a write endpoint is the number of free bytes.
    pub fn cntl(&mut self, cmd: i64, _arg: i64) -> KResult<i64> {
        match cmd {
            crate::io::CNTL_GETBLKSZ => Ok(1),
            crate::io::CNTL_GETEND => {
                let core = self.shared.core.lock();
                let len = core.tail.wrapping_sub(core.head) as usize;
                Ok((CAP - len) as i64)
            }
            _ => Err(KernelError::Unsupported),
        }
    }
}

impl Drop for WriteEnd {
    fn drop(&mut self) {
        self.shared.core.lock().writers -= 1;
        // Wake readers blocked on `not_empty`: with no writer left they
        // must re-check and return EOF instead of waiting forever.
        self.shared.not_empty.broadcast();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_preserves_order() {
        let (mut w, mut r) = new_pipe();
        let n = w.write(b"Hello from kernel pipe!\n").unwrap();
        assert_eq!(n, 24);
        let mut buf = [0u8; 64];
        let n = r.read(&mut buf).unwrap();
        assert_eq!(n, 24);
        assert_eq!(&buf[..24], b"Hello from kernel pipe!\n");
        assert!(buf[24..].iter().all(|&b| b == 0));
    }

    #[test]
    fn reader_sees_eof_after_writer_dropped() {
        let (w, mut r) = new_pipe();
        drop(w);
        let mut buf = [0u8; 8];
        assert_eq!(r.read(&mut buf), Ok(0));
    }

    #[test]
    fn writer_sees_broken_pipe_after_reader_dropped() {
        let (mut w, r) = new_pipe();
        drop(r);
        assert_eq!(w.write(b"x"), Err(KernelError::BrokenPipe));
    }

    #[test]
    fn getend_reports_readable_and_free_bytes() {
        let (mut w, mut r) = new_pipe();
        w.write(b"abc").unwrap();
        assert_eq!(r.cntl(crate::io::CNTL_GETEND, 0), Ok(3));
        assert_eq!(w.cntl(crate::io::CNTL_GETEND, 0), Ok((CAP - 3) as i64));
    }
}
