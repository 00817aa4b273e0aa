//! Syscall dispatch: the sixteen-entry table invoked from
//! `arch::riscv64::trap::rust_trap_handler` on `UserEcall`.
//!
//! The dispatcher itself only reads `a7` for the number and `a0..a5` for
//! arguments; every handler below delegates straight into `process`,
//! `device`, `fs::ktfs`, `thread`, or `io::pipe` and converts a `KernelError`
//! into the small-negative-integer ABI value with `as_isize()`. Argument
//! validation beyond "fd is in range" and "pointer lands in user memory"
//! lives in the collaborator being called, not here.

pub mod uaccess;

use crate::arch::riscv64::trap::TrapFrame;
use crate::lib::error::KernelError;
use crate::process::{self, PROCESS_IOMAX};

const MAX_NAME_LEN: usize = 32;
const MAX_PRINT_LEN: usize = 256;

/// Entry point called from the trap handler with `sepc` already advanced
/// past `ecall`. Unknown syscall numbers return "unsupported".
pub fn dispatch(frame: &mut TrapFrame) -> isize {
    let pid = process::current_pid();
    match frame.a(7) {
        0 => sys_exit(),
        1 => sys_exec(pid, frame),
        2 => sys_fork(frame),
        3 => sys_wait(frame.a(0) as isize),
        4 => sys_usleep(frame.a(0)),
        5 => sys_print(pid, frame.a(0)),
        6 => sys_devopen(pid, frame.a(0) as isize, frame.a(1), frame.a(2) as u32),
        7 => sys_fsopen(pid, frame.a(0) as isize, frame.a(1)),
        8 => sys_close(pid, frame.a(0)),
        9 => sys_read(pid, frame.a(0), frame.a(1), frame.a(2)),
        10 => sys_write(pid, frame.a(0), frame.a(1), frame.a(2)),
        11 => sys_ioctl(pid, frame.a(0), frame.a(1) as i64, frame.a(2) as i64),
        12 => sys_fscreate(frame.a(0)),
        13 => sys_fsdelete(frame.a(0)),
        14 => sys_pipe(pid, frame.a(0), frame.a(1)),
        15 => sys_iodup(pid, frame.a(0), frame.a(1) as isize),
        _ => KernelError::Unsupported.as_isize(),
    }
}

fn fd_in_range(fd: usize) -> Result<usize, isize> {
    if fd >= PROCESS_IOMAX {
        Err(KernelError::BadFd.as_isize())
    } else {
        Ok(fd)
    }
}

fn sys_exit() -> isize {
    process::exit()
}

fn sys_exec(pid: usize, frame: &TrapFrame) -> isize {
    let fd = match fd_in_range(frame.a(0)) {
        Ok(fd) => fd,
        Err(e) => return e,
    };
    process::exec_current(pid, fd, frame.a(1), frame.a(2))
}

fn sys_fork(frame: &TrapFrame) -> isize {
    match process::fork(frame) {
        Ok(tid) => tid as isize,
        Err(e) => e.as_isize(),
    }
}

fn sys_wait(tid: isize) -> isize {
    let result = if tid < 0 {
        crate::thread::join_any()
    } else {
        crate::thread::join(tid as usize).map(|_| tid as usize)
    };
    match result {
        Ok(tid) => tid as isize,
        Err(e) => e.as_isize(),
    }
}

fn sys_usleep(us: usize) -> isize {
    let ticks = us as u64 * (crate::arch::riscv64::TIMER_FREQ_HZ / 1_000_000);
    let deadline = crate::arch::riscv64::read_time() + ticks;
    while crate::arch::riscv64::read_time() < deadline {
        crate::thread::yield_now();
    }
    0
}

fn sys_print(pid: usize, msg_ptr: usize) -> isize {
    let msg = match uaccess::read_cstr(msg_ptr, MAX_PRINT_LEN) {
        Ok(m) => m,
        Err(e) => return e.as_isize(),
    };
    let _ = pid;
    crate::thread::sched::with_current(|t| {
        crate::info!("<{}:{}> says: {}", t.name(), t.tid, core::str::from_utf8(&msg).unwrap_or("?"));
    });
    0
}

fn sys_devopen(pid: usize, fd: isize, name_ptr: usize, instno: u32) -> isize {
    let name = match uaccess::read_cstr(name_ptr, MAX_NAME_LEN) {
        Ok(n) => n,
        Err(e) => return e.as_isize(),
    };
    let name = match core::str::from_utf8(&name) {
        Ok(n) => n,
        Err(_) => return KernelError::InvalidArgument.as_isize(),
    };
    let io = match crate::device::open(name, instno) {
        Ok(io) => io,
        Err(e) => return e.as_isize(),
    };
    match process::io_open(pid, fd, io) {
        Ok(fd) => fd as isize,
        Err(e) => e.as_isize(),
    }
}

fn sys_fsopen(pid: usize, fd: isize, name_ptr: usize) -> isize {
    let name = match uaccess::read_cstr(name_ptr, MAX_NAME_LEN) {
        Ok(n) => n,
        Err(e) => return e.as_isize(),
    };
    let name = match core::str::from_utf8(&name) {
        Ok(n) => n,
        Err(_) => return KernelError::InvalidArgument.as_isize(),
    };
    let io = match crate::fs::ktfs::open(name) {
        Ok(io) => io,
        Err(e) => return e.as_isize(),
    };
    match process::io_open(pid, fd, io) {
        Ok(fd) => fd as isize,
        Err(e) => e.as_isize(),
    }
}

fn sys_close(pid: usize, fd: usize) -> isize {
    let fd = match fd_in_range(fd) {
        Ok(fd) => fd,
        Err(e) => return e,
    };
    match process::io_close(pid, fd) {
        Ok(()) => 0,
        Err(e) => e.as_isize(),
    }
}

fn sys_read(pid: usize, fd: usize, buf_ptr: usize, n: usize) -> isize {
    let fd = match fd_in_range(fd) {
        Ok(fd) => fd,
        Err(e) => return e,
    };
    let io = match process::io_get(pid, fd) {
        Ok(io) => io,
        Err(e) => return e.as_isize(),
    };
    let buf = match uaccess::checked_slice_mut(buf_ptr, n) {
        Ok(b) => b,
        Err(e) => return e.as_isize(),
    };
    match io.read(buf) {
        Ok(read) if read > n => KernelError::IoError.as_isize(),
        Ok(read) => read as isize,
        Err(e) => e.as_isize(),
    }
}

fn sys_write(pid: usize, fd: usize, buf_ptr: usize, n: usize) -> isize {
    let fd = match fd_in_range(fd) {
        Ok(fd) => fd,
        Err(e) => return e,
    };
    let io = match process::io_get(pid, fd) {
        Ok(io) => io,
        Err(e) => return e.as_isize(),
    };
    let buf = match uaccess::checked_slice(buf_ptr, n) {
        Ok(b) => b,
        Err(e) => return e.as_isize(),
    };
    match io.write(buf) {
        Ok(written) if written > n => KernelError::IoError.as_isize(),
        Ok(written) => written as isize,
        Err(e) => e.as_isize(),
    }
}

fn sys_ioctl(pid: usize, fd: usize, cmd: i64, arg: i64) -> isize {
    let fd = match fd_in_range(fd) {
        Ok(fd) => fd,
        Err(e) => return e,
    };
    let io = match process::io_get(pid, fd) {
        Ok(io) => io,
        Err(e) => return e.as_isize(),
    };
    match io.cntl(cmd, arg) {
        Ok(v) => v as isize,
        Err(e) => e.as_isize(),
    }
}

fn sys_fscreate(name_ptr: usize) -> isize {
    let name = match uaccess::read_cstr(name_ptr, MAX_NAME_LEN) {
        Ok(n) => n,
        Err(e) => return e.as_isize(),
    };
    let name = match core::str::from_utf8(&name) {
        Ok(n) => n,
        Err(_) => return KernelError::InvalidArgument.as_isize(),
    };
    match crate::fs::ktfs::create(name) {
        Ok(()) => 0,
        Err(e) => e.as_isize(),
    }
}

fn sys_fsdelete(name_ptr: usize) -> isize {
    let name = match uaccess::read_cstr(name_ptr, MAX_NAME_LEN) {
        Ok(n) => n,
        Err(e) => return e.as_isize(),
    };
    let name = match core::str::from_utf8(&name) {
        Ok(n) => n,
        Err(_) => return KernelError::InvalidArgument.as_isize(),
    };
    match crate::fs::ktfs::delete(name) {
        Ok(()) => 0,
        Err(e) => e.as_isize(),
    }
}

fn sys_pipe(pid: usize, wfd_ptr: usize, rfd_ptr: usize) -> isize {
    let (w, r) = crate::io::pipe::new_pipe();
    let w_io = crate::io::IoObject::new(crate::io::IoKind::PipeWrite(w));
    let r_io = crate::io::IoObject::new(crate::io::IoKind::PipeRead(r));

    let wfd = match process::io_open(pid, -1, w_io) {
        Ok(fd) => fd,
        Err(e) => return e.as_isize(),
    };
    let rfd = match process::io_open(pid, -1, r_io) {
        Ok(fd) => fd,
        Err(e) => {
            let _ = process::io_close(pid, wfd);
            return e.as_isize();
        }
    };

    if let Err(e) = uaccess::write_u64(wfd_ptr, wfd as u64) {
        let _ = process::io_close(pid, wfd);
        let _ = process::io_close(pid, rfd);
        return e.as_isize();
    }
    if let Err(e) = uaccess::write_u64(rfd_ptr, rfd as u64) {
        let _ = process::io_close(pid, wfd);
        let _ = process::io_close(pid, rfd);
        return e.as_isize();
    }
    0
}

fn sys_iodup(pid: usize, old_fd: usize, new_fd: isize) -> isize {
    let old_fd = match fd_in_range(old_fd) {
        Ok(fd) => fd,
        Err(e) => return e,
    };
    match process::io_dup(pid, old_fd, new_fd) {
        Ok(fd) => fd as isize,
        Err(e) => e.as_isize(),
    }
}
