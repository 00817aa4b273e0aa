//! Kernel thread subsystem: a fixed thread table, a cooperative
//! and preemptive scheduler, condition variables, and recursive locks.
//!
//! `sched` owns the thread table and the suspend/switch protocol; `lock`
//! and `condition` are built on top of it and hand their primitives to
//! everything above (pipes, the block cache, KTFS) that needs to block a
//! thread rather than spin.

pub mod condition;
pub mod lock;
pub mod sched;

pub use condition::Condition;
pub use lock::Lock;
pub use sched::{ThreadState, NTHR};

use crate::lib::error::KernelError;

/// Bring up threading: the boot hart becomes thread 0 ("main"), plus the
/// idle thread. Must run after `mm::init` (spawning needs the physical
/// allocator) and before the timer is unmasked.
pub fn init() {
    sched::init();
}

/// Start a new kernel thread running `entry(arg)`, READY at the tail of the
/// ready list. `process` ties the thread to a process's
/// address space for `suspend`'s mspace activation; `None` means "runs in
/// the main/kernel address space".
pub fn spawn(
    name: &str,
    entry: extern "C" fn(usize) -> (),
    arg: usize,
    process: Option<usize>,
) -> Result<usize, KernelError> {
    let parent = Some(sched::current_tid());
    sched::spawn(name, entry, arg, parent, process)
}

pub fn current_tid() -> usize {
    sched::current_tid()
}

/// Give up the hart voluntarily without changing state: re-enqueue at the
/// tail of the ready list and let someone else run.
pub fn yield_now() {
    sched::suspend();
}

/// Terminate the calling thread. Never returns: the
/// thread's own stack cannot be freed while it is still executing on it, so
/// cleanup is deferred to whichever thread next calls `suspend` (see
/// `sched::reap_pending_exit`). Broadcasts `child_exit` so any `join`er
/// wakes up.
pub fn exit() -> ! {
    let tid = sched::current_tid();
    let parent = sched::with_thread(tid, |t| t.parent);
    if let Some(parent) = parent {
        // Fetched without holding `SCHED`'s lock across the call: `broadcast`
        // takes that lock itself.
        let cond = sched::child_exit_ptr(parent);
        unsafe { (*cond).broadcast() };
    }
    sched::retire(tid);
    loop {
        sched::suspend();
    }
}

/// Block until thread `tid` exits. `tid` must be a child
/// of the caller; polls `child_exit` since several children may share it.
/// Reclaims `tid`'s slot on success, reparenting any of its own children
/// (the caller's grandchildren) to the caller.
pub fn join(tid: usize) -> Result<(), KernelError> {
    let caller = sched::current_tid();
    loop {
        let (state, parent_matches) =
            sched::with_thread(tid, |t| (t.state, t.parent == Some(caller)));
        if !parent_matches {
            return Err(KernelError::InvalidArgument);
        }
        if state == ThreadState::Exited {
            sched::reclaim_exited(tid, caller);
            return Ok(());
        }
        let cond = sched::child_exit_ptr(caller);
        unsafe { (*cond).wait() };
    }
}

/// Block until any child of the caller exits, returning its tid. Reclaims
/// that child's slot the same way `join` does. Errors immediately if the
/// caller has no child at all, the way `join` errors on a `tid` that isn't
/// a child.
pub fn join_any() -> Result<usize, KernelError> {
    let caller = sched::current_tid();
    if !sched::has_any_child(caller) {
        return Err(KernelError::InvalidArgument);
    }
    loop {
        if let Some(tid) = sched::find_exited_child(caller) {
            sched::reclaim_exited(tid, caller);
            return Ok(tid);
        }
        let cond = sched::child_exit_ptr(caller);
        unsafe { (*cond).wait() };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_assigns_distinct_tids_up_to_capacity() {
        extern "C" fn noop(_arg: usize) {}
        let mut tids = alloc::vec::Vec::new();
        // NTHR - 2: one slot is main (already Running), one is idle.
        for i in 0..(NTHR - 2) {
            let tid = spawn("t", noop, i, None).expect("slot available");
            tids.push(tid);
        }
        let all_distinct = {
            let mut sorted = tids.clone();
            sorted.sort_unstable();
            sorted.windows(2).all(|w| w[0] != w[1])
        };
        assert!(all_distinct);
        assert!(spawn("overflow", noop, 0, None).is_err());
    }
}
