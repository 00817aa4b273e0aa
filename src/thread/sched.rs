//! Thread table, ready list, and the suspend/switch protocol.
//!
//! Everything here runs with the scheduler's lock held and, around the
//! actual context switch, with interrupts explicitly disabled
//! ("every wait-list modification, ready-list modification... must occur
//! with interrupts disabled"). The lock alone would already serialize a
//! single hart's accesses; the explicit disable/enable bracket additionally
//! keeps the timer ISR from re-entering scheduler state while a suspension
//! point is mid-update.

use crate::arch::riscv64::context::{switch_to, ThreadContext};
use crate::arch::riscv64::sv39::PAGE_SIZE;
use crate::arch::riscv64::{disable_interrupts, enable_interrupts, restore_interrupts};
use crate::lib::error::KernelError;
use crate::mm::phys;
use alloc::vec::Vec;
use lazy_static::lazy_static;
use spin::Mutex;

pub const NTHR: usize = 16;
pub const MAIN_TID: usize = 0;
pub const IDLE_TID: usize = NTHR - 1;
const STACK_SIZE: usize = PAGE_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Uninitialized,
    Waiting,
    Running,
    Ready,
    Exited,
}

pub struct Tcb {
    pub tid: usize,
    pub name: [u8; 16],
    pub name_len: usize,
    pub state: ThreadState,
    pub ctx: ThreadContext,
    pub stack_base: usize,
    pub stack_top: usize,
    pub parent: Option<usize>,
    pub next: Option<usize>,
    pub process: Option<usize>,
    pub held_locks: Vec<*mut super::lock::Lock>,
    /// Condition children broadcast into when they exit; waited on by `join`.
    pub child_exit: super::condition::Condition,
}

unsafe impl Send for Tcb {}

impl Tcb {
    const fn blank(tid: usize) -> Self {
        Self {
            tid,
            name: [0; 16],
            name_len: 0,
            state: ThreadState::Uninitialized,
            ctx: ThreadContext::zeroed(),
            stack_base: 0,
            stack_top: 0,
            parent: None,
            next: None,
            process: None,
            held_locks: Vec::new(),
            child_exit: super::condition::Condition::new(),
        }
    }

    pub fn name(&self) -> &str {
        core::str::from_utf8(&self.name[..self.name_len]).unwrap_or("?")
    }
}

pub struct Scheduler {
    pub threads: [Tcb; NTHR],
    ready_head: Option<usize>,
    ready_tail: Option<usize>,
    pub current: usize,
    exited_pending: Option<usize>,
}

impl Scheduler {
    pub fn enqueue_ready(&mut self, tid: usize) {
        self.threads[tid].next = None;
        self.threads[tid].state = ThreadState::Ready;
        match self.ready_tail {
            Some(tail) => self.threads[tail].next = Some(tid),
            None => self.ready_head = Some(tid),
        }
        self.ready_tail = Some(tid);
    }

    fn dequeue_ready(&mut self) -> Option<usize> {
        let head = self.ready_head?;
        self.ready_head = self.threads[head].next.take();
        if self.ready_head.is_none() {
            self.ready_tail = None;
        }
        Some(head)
    }

    fn alloc_slot(&self) -> Option<usize> {
        (0..IDLE_TID).find(|&i| self.threads[i].state == ThreadState::Uninitialized)
    }
}

lazy_static! {
    static ref SCHED: Mutex<Scheduler> = Mutex::new(Scheduler {
        threads: core::array::from_fn(Tcb::blank),
        ready_head: None,
        ready_tail: None,
        current: MAIN_TID,
        exited_pending: None,
    });
}

/// Bring up the boot thread (tid 0, "main") and the idle thread (last slot)
/// before any scheduling can occur.
pub fn init() {
    let mut s = SCHED.lock();
    s.threads[MAIN_TID].state = ThreadState::Running;
    set_name(&mut s.threads[MAIN_TID], "main");
    s.current = MAIN_TID;
    drop(s);
    spawn_idle();
}

fn set_name(t: &mut Tcb, name: &str) {
    let n = name.as_bytes();
    let len = n.len().min(t.name.len());
    t.name[..len].copy_from_slice(&n[..len]);
    t.name_len = len;
}

fn spawn_idle() {
    let stack = phys::alloc_page().expect("mm: no memory for idle stack");
    let mut s = SCHED.lock();
    let t = &mut s.threads[IDLE_TID];
    t.stack_base = stack;
    t.stack_top = stack + STACK_SIZE;
    t.ctx = ThreadContext::new(t.stack_top, idle_entry as usize, 0);
    t.state = ThreadState::Ready;
    set_name(t, "idle");
    s.enqueue_ready(IDLE_TID);
}

extern "C" fn idle_entry(_arg: usize) {
    loop {
        let empty = {
            let s = SCHED.lock();
            s.ready_head.is_none()
        };
        if empty {
            // Nothing runnable; wait for the next interrupt with SIE set so
            // `wfi` actually wakes us ("halts the hart pending
            // interrupt").
            enable_interrupts();
            riscv::asm::wfi();
        } else {
            super::yield_now();
        }
    }
}

/// Every helper below that touches `SCHED` brackets the critical section
/// with `disable_interrupts`/`restore_interrupts`: without that, a timer
/// tick taken while the lock is held re-enters `on_timer_tick -> suspend ->
/// SCHED.lock()` on the same hart and spins forever against itself.
pub fn current_tid() -> usize {
    let was_enabled = disable_interrupts();
    let tid = SCHED.lock().current;
    restore_interrupts(was_enabled);
    tid
}

pub fn with_current<R>(f: impl FnOnce(&mut Tcb) -> R) -> R {
    let was_enabled = disable_interrupts();
    let mut s = SCHED.lock();
    let cur = s.current;
    let r = f(&mut s.threads[cur]);
    drop(s);
    restore_interrupts(was_enabled);
    r
}

pub fn with_thread<R>(tid: usize, f: impl FnOnce(&mut Tcb) -> R) -> R {
    let was_enabled = disable_interrupts();
    let mut s = SCHED.lock();
    let r = f(&mut s.threads[tid]);
    drop(s);
    restore_interrupts(was_enabled);
    r
}

/// Raw lock accessor for callers (`Condition::wait`/`broadcast`) that have
/// already disabled interrupts themselves before taking `SCHED`.
pub(super) fn lock_sched() -> spin::MutexGuard<'static, Scheduler> {
    SCHED.lock()
}

/// Raw pointer to `tid`'s `child_exit` condition, stable for the thread
/// table's lifetime. Used to call `wait`/`broadcast` on it without holding
/// `SCHED`'s lock across that call (both methods take it themselves).
pub(super) fn child_exit_ptr(tid: usize) -> *const super::condition::Condition {
    let was_enabled = disable_interrupts();
    let s = SCHED.lock();
    let ptr = &s.threads[tid].child_exit as *const _;
    drop(s);
    restore_interrupts(was_enabled);
    ptr
}

/// Allocate a fresh stack and thread-table slot, start it READY at the tail
/// of the ready list.
pub fn spawn(
    name: &str,
    entry: extern "C" fn(usize) -> (),
    arg: usize,
    parent: Option<usize>,
    process: Option<usize>,
) -> Result<usize, KernelError> {
    let stack = phys::alloc_page().ok_or(KernelError::OutOfMemory)?;
    let was_enabled = disable_interrupts();
    let mut s = SCHED.lock();
    let tid = match s.alloc_slot() {
        Some(t) => t,
        None => {
            drop(s);
            restore_interrupts(was_enabled);
            phys::free_page(stack);
            return Err(KernelError::NoThreads);
        }
    };
    let t = &mut s.threads[tid];
    *t = Tcb::blank(tid);
    t.stack_base = stack;
    t.stack_top = stack + STACK_SIZE;
    t.ctx = ThreadContext::new(t.stack_top, entry as usize, arg);
    t.parent = parent;
    t.process = process;
    set_name(t, name);
    s.enqueue_ready(tid);
    drop(s);
    restore_interrupts(was_enabled);
    crate::info!("thread: spawned tid={} name={}", tid, name);
    Ok(tid)
}

/// Voluntary or preemptive suspension: enqueue the current thread (if still
/// RUNNING) and switch to the next READY thread.
///
/// Interrupts are disabled for the ready-list bookkeeping and unconditionally
/// re-enabled before the actual `switch_to` ("every suspension
/// point re-enables interrupts before performing the context switch"), so a
/// resumed thread always continues with interrupts on rather than inheriting
/// whatever disable-nesting its suspender happened to be in.
///
/// `reap_pending_exit` runs *after* `switch_to` returns, never before: a
/// thread that just called `exit` is still executing on its own stack at
/// the top of this function, and freeing that stack out from under it
/// would be use-after-free. By the time `switch_to` returns here, we are
/// running on whichever thread got switched to, so the exited thread's
/// stack (if any is pending) is safe to release.
pub fn suspend() {
    disable_interrupts();

    let (prev_ptr, next_ptr, next_mspace) = {
        let mut s = SCHED.lock();
        let cur = s.current;
        if s.threads[cur].state == ThreadState::Running {
            s.enqueue_ready(cur);
        }
        let next = s.dequeue_ready().unwrap_or(cur);
        s.threads[next].state = ThreadState::Running;
        s.current = next;
        let next_mspace = s.threads[next]
            .process
            .map(|p| crate::process::mspace_of(p));
        let prev_ptr = &mut s.threads[cur].ctx as *mut ThreadContext;
        let next_ptr = &s.threads[next].ctx as *const ThreadContext;
        (prev_ptr, next_ptr, next_mspace)
    };

    if let Some(Some(m)) = next_mspace {
        crate::mm::pagetable::activate(m);
    }
    enable_interrupts();
    switch_to(prev_ptr, next_ptr);
    reap_pending_exit();
}

fn reap_pending_exit() {
    let was_enabled = disable_interrupts();
    let mut s = SCHED.lock();
    let pending = s.exited_pending.take().map(|tid| {
        let t = &mut s.threads[tid];
        (tid, t.stack_base, core::mem::take(&mut t.held_locks))
    });
    drop(s);
    restore_interrupts(was_enabled);
    if let Some((tid, stack_base, held)) = pending {
        for lock in held {
            super::lock::force_release(lock, tid);
        }
        phys::free_page(stack_base);
    }
}

/// Mark `tid` EXITED and hand it to the next resumer for stack/lock cleanup
/// (freeing a stack while still running on it is not possible).
pub(super) fn retire(tid: usize) {
    let was_enabled = disable_interrupts();
    let mut s = SCHED.lock();
    s.threads[tid].state = ThreadState::Exited;
    s.exited_pending = Some(tid);
    drop(s);
    restore_interrupts(was_enabled);
}

/// First EXITED thread whose parent is `parent`, if any (backs `wait(-1)`).
pub(super) fn find_exited_child(parent: usize) -> Option<usize> {
    let was_enabled = disable_interrupts();
    let s = SCHED.lock();
    let found = s
        .threads
        .iter()
        .find(|t| t.parent == Some(parent) && t.state == ThreadState::Exited)
        .map(|t| t.tid);
    drop(s);
    restore_interrupts(was_enabled);
    found
}

/// Whether `parent` has any child at all, exited or not (used to reject
/// `wait(-1)` when there is nothing to wait for).
pub(super) fn has_any_child(parent: usize) -> bool {
    let was_enabled = disable_interrupts();
    let s = SCHED.lock();
    let any = s
        .threads
        .iter()
        .any(|t| t.parent == Some(parent) && t.state != ThreadState::Uninitialized);
    drop(s);
    restore_interrupts(was_enabled);
    any
}

/// Reclaim an EXITED child's slot back to `Uninitialized` so `alloc_slot`
/// can reuse it ("reclaims its slot ... making this thread the new parent
/// of any grand-children"). Called by `join`/`join_any` once they have
/// observed `tid` as EXITED; any thread still parented to `tid` (a
/// grandchild from the joining caller's point of view) is reparented to
/// `new_parent` in the same critical section.
pub(super) fn reclaim_exited(tid: usize, new_parent: usize) {
    let was_enabled = disable_interrupts();
    let mut s = SCHED.lock();
    for i in 0..IDLE_TID {
        if s.threads[i].parent == Some(tid) {
            s.threads[i].parent = Some(new_parent);
        }
    }
    s.threads[tid] = Tcb::blank(tid);
    drop(s);
    restore_interrupts(was_enabled);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_list_is_fifo() {
        let mut s = Scheduler {
            threads: core::array::from_fn(Tcb::blank),
            ready_head: None,
            ready_tail: None,
            current: 0,
            exited_pending: None,
        };
        s.enqueue_ready(3);
        s.enqueue_ready(5);
        s.enqueue_ready(1);
        assert_eq!(s.dequeue_ready(), Some(3));
        assert_eq!(s.dequeue_ready(), Some(5));
        assert_eq!(s.dequeue_ready(), Some(1));
        assert_eq!(s.dequeue_ready(), None);
    }
}

/// Timer-tick entry point called from the trap handler (preemptive
/// among kernel threads at timer ticks).
pub fn on_timer_tick() {
    suspend();
}
