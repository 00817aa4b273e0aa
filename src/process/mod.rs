//! Process table and the process-level half of `exec`/`fork`/`exit`.
//! `syscall::dispatch` is the only caller of the public functions here;
//! everything below (the per-process I/O table, the ELF loader) stays
//! private to this module.
//!
//! `proctab[NPROC]` is small and fixed, same shape as `thread::sched`'s
//! thread table: index 0 is the boot thread's process and reuses the main
//! mspace directly rather than cloning it, since it never runs anything but
//! the boot-time `exec` into the initial program.

pub mod elf;

use alloc::boxed::Box;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;

use crate::arch::riscv64::sv39::{PteFlags, PAGE_SIZE};
use crate::arch::riscv64::trap::{self, TrapFrame};
use crate::io::IoRef;
use crate::lib::error::{KernelError, KResult};
use crate::mm::pagetable::{self, MSpace};
use crate::mm::phys;
use crate::mm::UMEM_END_VMA;

/// Per-process open-file table size ("file-descriptor arguments
/// must be in `[0, PROCESS_IOMAX)`").
pub const PROCESS_IOMAX: usize = 16;
const NPROC: usize = 8;
const MAIN_PROCESS: usize = 0;

struct Process {
    active: bool,
    mspace: MSpace,
    iotab: [Option<IoRef>; PROCESS_IOMAX],
}

impl Process {
    fn blank() -> Self {
        Self {
            active: false,
            mspace: 0,
            iotab: core::array::from_fn(|_| None),
        }
    }
}

lazy_static! {
    static ref PROCS: Mutex<[Process; NPROC]> =
        Mutex::new(core::array::from_fn(|_| Process::blank()));
}

/// Bring up the process table. Must run after `thread::init` (it tags the
/// boot thread's `process` field) and after `mm::init` (it reads the main
/// mspace).
pub fn init() {
    {
        let mut procs = PROCS.lock();
        procs[MAIN_PROCESS].active = true;
        procs[MAIN_PROCESS].mspace = pagetable::main_mspace();
    }
    crate::thread::sched::with_thread(crate::thread::sched::MAIN_TID, |t| {
        t.process = Some(MAIN_PROCESS)
    });
}

/// Address space backing `pid` (used by `thread::sched::suspend`'s mspace
/// switch on every context switch tied to a process).
pub fn mspace_of(pid: usize) -> MSpace {
    PROCS.lock()[pid].mspace
}

/// Process the calling thread belongs to. Threads never tied to a process
/// (the idle thread, and the boot thread before `init` has run) are treated
/// as the main process.
pub fn current_pid() -> usize {
    crate::thread::sched::with_current(|t| t.process).unwrap_or(MAIN_PROCESS)
}

fn io_install(pid: usize, want_fd: isize, io: IoRef) -> KResult<usize> {
    let mut procs = PROCS.lock();
    let p = &mut procs[pid];
    let fd = if want_fd >= 0 {
        let fd = want_fd as usize;
        if fd >= PROCESS_IOMAX {
            return Err(KernelError::BadFd);
        }
        fd
    } else {
        p.iotab
            .iter()
            .position(|cell| cell.is_none())
            .ok_or(KernelError::TooManyFilesOpen)?
    };
    p.iotab[fd] = Some(io);
    Ok(fd)
}

/// Install `io` into `pid`'s I/O table at `fd`, or at the first free slot if
/// `fd < 0` ("a negative `fd` ... means find a free slot").
pub fn io_open(pid: usize, fd: isize, io: IoRef) -> KResult<usize> {
    io_install(pid, fd, io)
}

pub fn io_get(pid: usize, fd: usize) -> KResult<IoRef> {
    if fd >= PROCESS_IOMAX {
        return Err(KernelError::BadFd);
    }
    PROCS.lock()[pid].iotab[fd]
        .clone()
        .ok_or(KernelError::BadFd)
}

pub fn io_close(pid: usize, fd: usize) -> KResult<()> {
    if fd >= PROCESS_IOMAX {
        return Err(KernelError::BadFd);
    }
    PROCS.lock()[pid].iotab[fd]
        .take()
        .map(|_| ())
        .ok_or(KernelError::BadFd)
}

/// `iodup(oldfd, newfd)`: copy the ref at `oldfd` into `newfd`, or a new
/// slot if `newfd < 0`.
pub fn io_dup(pid: usize, old_fd: usize, new_fd: isize) -> KResult<usize> {
    let io = io_get(pid, old_fd)?;
    io_install(pid, new_fd, io)
}

/// `exec(fd, argc, argv)`. `argv` is a user pointer to `argc`
/// 8-byte string pointers, read out of the caller's still-active address
/// space before it is torn down. Only returns on failure -- a successful
/// exec jumps to user mode and never comes back through this call.
pub fn exec_current(pid: usize, fd: usize, argc: usize, argv_ptr: usize) -> isize {
    let io = match io_get(pid, fd) {
        Ok(io) => io,
        Err(e) => return e.as_isize(),
    };

    let mut argv: Vec<Vec<u8>> = Vec::with_capacity(argc);
    for i in 0..argc {
        let ptr = match crate::syscall::uaccess::read_u64(argv_ptr + i * 8) {
            Ok(p) => p as usize,
            Err(e) => return e.as_isize(),
        };
        match crate::syscall::uaccess::read_cstr(ptr, PAGE_SIZE) {
            Ok(s) => argv.push(s),
            Err(e) => return e.as_isize(),
        }
    }

    exec_with_io(pid, fd, io, argv).as_isize()
}

/// Builds the user stack (`{argv pointers, strings}`, ), loads the
/// ELF, and jumps to user mode. Diverges on success; returns the failure
/// reason otherwise.
fn exec_with_io(pid: usize, fd: usize, exe_io: IoRef, argv: Vec<Vec<u8>>) -> KernelError {
    let stack_phys = match phys::alloc_page() {
        Some(p) => p,
        None => return KernelError::OutOfMemory,
    };

    // Strings grow down from the top of the page; the argv pointer array
    // (NULL-terminated) and the leading argc word sit just below them, so
    // `sp` always points at a fully self-contained {argc, argv[], strings}
    // block regardless of how much string data there is (`*(uintptr_t*)sp == argc`, `((uintptr_t*)sp)[1]` is `argv[0]`).
    let stack_vma = UMEM_END_VMA - PAGE_SIZE;
    let mut offset = PAGE_SIZE;
    let mut str_vmas: Vec<usize> = Vec::with_capacity(argv.len());
    for s in argv.iter().rev() {
        offset -= s.len() + 1;
        unsafe {
            core::ptr::copy_nonoverlapping(s.as_ptr(), (stack_phys + offset) as *mut u8, s.len());
            *((stack_phys + offset + s.len()) as *mut u8) = 0;
        }
        str_vmas.push(stack_vma + offset);
    }
    str_vmas.reverse();

    let argc = argv.len();
    offset -= (argc + 1) * 8;
    offset &= !7usize;
    unsafe {
        let base = (stack_phys + offset) as *mut u64;
        for (i, &vma) in str_vmas.iter().enumerate() {
            core::ptr::write(base.add(i), vma as u64);
        }
        core::ptr::write(base.add(argc), 0u64);
    }
    offset -= 8;
    unsafe { core::ptr::write((stack_phys + offset) as *mut u64, argc as u64) };
    let sp_vma = stack_vma + offset;

    pagetable::reset_active_mspace();

    if pagetable::map_page(stack_vma, stack_phys, PteFlags::R | PteFlags::W | PteFlags::U).is_none()
    {
        phys::free_page(stack_phys);
        return KernelError::InvalidArgument;
    }
    crate::arch::riscv64::sfence_vma_all();

    let entry = match elf::load(&exe_io) {
        Ok(e) => e,
        Err(e) => return e,
    };

    let _ = io_close(pid, fd);
    let frame = trap::user_entry_frame(entry, sp_vma, argc, sp_vma);
    trap::enter_user(&frame)
}

/// `fork(trap_frame)`: find a free process slot, duplicate the
/// I/O table, clone the active address space, and spawn a thread that
/// resumes the parent's trap frame with `a0 = 0`. Returns the child's tid
/// to the parent.
pub fn fork(frame: &TrapFrame) -> KResult<usize> {
    let parent_pid = current_pid();

    let child_pid = {
        let mut procs = PROCS.lock();
        let slot = (0..NPROC)
            .find(|&i| !procs[i].active)
            .ok_or(KernelError::NoThreads)?;
        procs[slot].active = true; // reserved; filled in below once the clone succeeds
        slot
    };

    let mspace = match pagetable::clone_active_mspace() {
        Ok(m) => m,
        Err(e) => {
            PROCS.lock()[child_pid] = Process::blank();
            return Err(e);
        }
    };

    {
        let mut procs = PROCS.lock();
        let dup: [Option<IoRef>; PROCESS_IOMAX] =
            core::array::from_fn(|i| procs[parent_pid].iotab[i].clone());
        procs[child_pid].mspace = mspace;
        procs[child_pid].iotab = dup;
    }

    let mut child_frame = *frame;
    child_frame.set_a0(0);
    let arg = Box::into_raw(Box::new(child_frame)) as usize;

    match crate::thread::spawn("forked", fork_trampoline, arg, Some(child_pid)) {
        Ok(tid) => Ok(tid),
        Err(e) => {
            unsafe { drop(Box::from_raw(arg as *mut TrapFrame)) };
            PROCS.lock()[child_pid] = Process::blank();
            Err(e)
        }
    }
}

extern "C" fn fork_trampoline(arg: usize) {
    let frame = unsafe { *Box::from_raw(arg as *mut TrapFrame) };
    trap::enter_user(&frame)
}

/// `exit()`: flush the filesystem, discard the address space,
/// close every I/O cell, clear the process slot, and terminate the thread.
/// Calling this on the main process is a kernel bug, not a user error.
pub fn exit() -> ! {
    let pid = current_pid();
    if pid == MAIN_PROCESS {
        panic!("process: exit() called on the main process");
    }
    crate::fs::ktfs::flush();
    pagetable::discard_active_mspace();
    PROCS.lock()[pid] = Process::blank();
    crate::thread::exit()
}

/// The boot-time `exec` of the initial program: opens a distinguished user
/// program and execs it, run directly from `kernel_main` rather than through
/// a syscall. There is no installed fd yet, so this takes the `IoRef`
/// straight from `fs::ktfs::open`.
pub fn boot_exec(path: &str) -> ! {
    let io = match crate::fs::ktfs::open(path) {
        Ok(io) => io,
        Err(e) => panic!("process: failed to open boot program {}: {}", path, e),
    };
    let argv = alloc::vec![path.as_bytes().to_vec()];
    let err = exec_with_io(MAIN_PROCESS, PROCESS_IOMAX, io, argv);
    panic!("process: boot exec of {} failed: {}", path, err);
}
