//! Recursive locks with forced release on thread exit.
//!
//! `acquire`/`release` are built directly on `Condition`, not on
//! `spin::Mutex` — holding a `Lock` can legitimately span a suspension
//! point (a file's lock stays held while its caller blocks on I/O), which a
//! spinlock must never do.

use spin::Mutex as SpinMutex;

use super::condition::Condition;

struct Inner {
    owner: Option<usize>,
    recursion: u32,
}

pub struct Lock {
    inner: SpinMutex<Inner>,
    released: Condition,
}

impl Lock {
    pub const fn new() -> Self {
        Self {
            inner: SpinMutex::new(Inner {
                owner: None,
                recursion: 0,
            }),
            released: Condition::new(),
        }
    }

    /// Acquire, blocking if another thread holds it: if the caller already
    /// owns the lock, just bump the recursion count;
    /// otherwise wait on `released` until the owner drops to none.
    pub fn acquire(&self) {
        let cur = super::sched::current_tid();
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.owner == Some(cur) {
                    inner.recursion += 1;
                    return;
                }
                if inner.owner.is_none() {
                    inner.owner = Some(cur);
                    inner.recursion = 1;
                } else {
                    drop(inner);
                    self.released.wait();
                    continue;
                }
            }
            super::sched::with_thread(cur, |t| t.held_locks.push(self as *const Lock as *mut Lock));
            return;
        }
    }

    /// Release one level of recursion; when it reaches zero, clear the
    /// owner, drop this lock from the caller's held-lock list, and wake
    /// everyone waiting in `acquire`.
    pub fn release(&self) {
        let cur = super::sched::current_tid();
        let drained = {
            let mut inner = self.inner.lock();
            debug_assert_eq!(inner.owner, Some(cur), "release of a lock not held by the caller");
            inner.recursion -= 1;
            if inner.recursion == 0 {
                inner.owner = None;
                true
            } else {
                false
            }
        };
        if drained {
            super::sched::with_thread(cur, |t| {
                if let Some(pos) = t
                    .held_locks
                    .iter()
                    .position(|&p| core::ptr::eq(p, self as *const Lock as *mut Lock))
                {
                    t.held_locks.remove(pos);
                }
            });
            self.released.broadcast();
        }
    }

    pub fn is_held_by_current(&self) -> bool {
        self.inner.lock().owner == Some(super::sched::current_tid())
    }
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

/// Forcibly drop `tid`'s ownership of `*lock_ptr` regardless of recursion
/// depth ("on thread exit, every held lock is forcibly
/// released"). Called only by `sched::reap_pending_exit` against locks
/// still in the dead thread's `held_locks`, so `lock_ptr` is guaranteed live.
pub(super) fn force_release(lock_ptr: *mut Lock, tid: usize) {
    let lock = unsafe { &*lock_ptr };
    let was_owner = {
        let mut inner = lock.inner.lock();
        if inner.owner == Some(tid) {
            inner.owner = None;
            inner.recursion = 0;
            true
        } else {
            false
        }
    };
    if was_owner {
        lock.released.broadcast();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncontended_acquire_and_release_clears_owner() {
        let lock = Lock::new();
        lock.acquire();
        assert!(lock.is_held_by_current());
        lock.release();
        assert_eq!(lock.inner.lock().owner, None);
    }

    #[test]
    fn recursive_acquire_requires_matching_releases() {
        let lock = Lock::new();
        lock.acquire();
        lock.acquire();
        assert_eq!(lock.inner.lock().recursion, 2);
        lock.release();
        assert!(lock.is_held_by_current());
        lock.release();
        assert_eq!(lock.inner.lock().owner, None);
    }
}
