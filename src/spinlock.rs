//! Test-and-set mutual exclusion with owner tracking and a bounded
//! acquisition backtrace.
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::cpu::Cpus;
use crate::error::KernelError;
use crate::param::DEBUG_TRACEFRAMES;

const NO_OWNER: usize = usize::MAX;

/// A spinlock guarding `T`, with owner-CPU tracking and a captured
/// return-address chain for debugging.
///
/// Every acquisition threads `cpus`/`id` through explicitly rather than
/// discovering "which CPU am I" internally: identifying the running CPU is
/// an architecture concern this core leaves to its caller (see
/// [`crate::cpu::Cpus`]).
pub struct Spinlock<T> {
    name: &'static str,
    locked: AtomicBool,
    owner: AtomicUsize,
    file: UnsafeCell<&'static str>,
    line: UnsafeCell<u32>,
    eips: UnsafeCell<[u32; DEBUG_TRACEFRAMES]>,
    data: UnsafeCell<T>,
}

// SAFETY: access to `data` is only ever granted through a `SpinlockGuard`,
// which is only constructed while `locked` is held.
unsafe impl<T: Send> Sync for Spinlock<T> {}

impl<T> Spinlock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            name,
            locked: AtomicBool::new(false),
            owner: AtomicUsize::new(NO_OWNER),
            file: UnsafeCell::new(""),
            line: UnsafeCell::new(0),
            eips: UnsafeCell::new([0; DEBUG_TRACEFRAMES]),
            data: UnsafeCell::new(data),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn owned_by(&self, id: usize) -> bool {
        self.locked.load(Ordering::Relaxed) && self.owner.load(Ordering::Relaxed) == id
    }

    /// True iff `locked` and `owner = id`. Wraps the check in push_off/pop_off
    /// so the calling CPU cannot be rescheduled mid-check.
    pub fn holding(&self, cpus: &Cpus, id: usize) -> bool {
        cpus.push_off(id);
        let r = self.owned_by(id);
        cpus.pop_off(id);
        r
    }

    /// Busy-spins until the lock is free, then acquires it.
    ///
    /// `backtrace` is the kernel return-address chain at the call site, as
    /// supplied by an architecture-specific unwinder outside this core; it
    /// is copied into `eips` truncated (zero-padded) to `DEBUG_TRACEFRAMES`
    /// entries. Halts the CPU with [`KernelError::DoubleAcquire`] if `id`
    /// already holds this lock.
    #[track_caller]
    pub fn acquire<'a>(&'a self, cpus: &'a Cpus, id: usize, backtrace: &[u32]) -> SpinlockGuard<'a, T> {
        cpus.push_off(id);
        if self.owned_by(id) {
            KernelError::DoubleAcquire.halt();
        }
        while self.locked.swap(true, Ordering::Acquire) {
            core::hint::spin_loop();
        }
        self.owner.store(id, Ordering::Relaxed);
        let loc = core::panic::Location::caller();
        // SAFETY: exclusive access established by the swap above.
        unsafe {
            *self.file.get() = loc.file();
            *self.line.get() = loc.line();
            let eips = &mut *self.eips.get();
            let mut it = backtrace.iter();
            for slot in eips.iter_mut() {
                *slot = it.next().copied().unwrap_or(0);
            }
        }
        SpinlockGuard { lock: self, cpus, id }
    }

    fn release(&self, cpus: &Cpus, id: usize) {
        if !self.owned_by(id) {
            KernelError::NotOwner.halt();
        }
        self.owner.store(NO_OWNER, Ordering::Relaxed);
        // SAFETY: still exclusive, lock has not been released yet.
        unsafe {
            *self.eips.get() = [0; DEBUG_TRACEFRAMES];
        }
        self.locked.store(false, Ordering::Release);
        cpus.pop_off(id);
    }

    /// File/line recorded at the most recent acquisition (or the
    /// compile-time defaults if never acquired).
    pub fn debug_location(&self) -> (&'static str, u32) {
        // SAFETY: read-only snapshot; acceptable race with a concurrent
        // acquire for debugging purposes only.
        unsafe { (*self.file.get(), *self.line.get()) }
    }

    /// The return-address chain captured at the most recent acquisition.
    pub fn debug_eips(&self) -> [u32; DEBUG_TRACEFRAMES] {
        // SAFETY: read-only snapshot; acceptable race with a concurrent
        // acquire for debugging purposes only.
        unsafe { *self.eips.get() }
    }
}

/// RAII guard returned by [`Spinlock::acquire`]; releases on drop.
pub struct SpinlockGuard<'a, T> {
    lock: &'a Spinlock<T>,
    cpus: &'a Cpus,
    id: usize,
}

impl<T> Deref for SpinlockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: holding the lock grants exclusive access.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinlockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: holding the lock grants exclusive access.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinlockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release(self.cpus, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::leaked_interrupt_control;

    #[test]
    fn acquire_release_round_trip() {
        let cpus = Cpus::new(leaked_interrupt_control(true));
        let lock = Spinlock::new("test", 0u32);
        {
            let mut guard = lock.acquire(&cpus, 0, &[]);
            *guard += 1;
        }
        assert!(!lock.holding(&cpus, 0));
        assert_eq!(*lock.acquire(&cpus, 0, &[]), 1);
    }

    #[test]
    #[should_panic(expected = "already held by this CPU")]
    fn double_acquire_is_fatal() {
        let cpus = Cpus::new(leaked_interrupt_control(true));
        let lock = Spinlock::new("test", 0u32);
        let _g1 = lock.acquire(&cpus, 0, &[]);
        let _g2 = lock.acquire(&cpus, 0, &[]);
    }

    #[test]
    fn eips_cleared_on_release_and_truncated_on_acquire() {
        let cpus = Cpus::new(leaked_interrupt_control(true));
        let lock = Spinlock::new("test", 0u32);
        let backtrace = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];
        {
            let _g = lock.acquire(&cpus, 0, &backtrace);
            let eips = lock.debug_eips();
            assert_eq!(eips.len(), DEBUG_TRACEFRAMES);
            assert_eq!(&eips[..], &backtrace[..DEBUG_TRACEFRAMES]);
        }
        assert_eq!(lock.debug_eips(), [0; DEBUG_TRACEFRAMES]);
    }

    /// Ten locks, each acquired through nested calls and released in
    /// reverse: after release, every lock is free and unheld.
    #[test]
    fn spinlock_stress_ten_nested_locks() {
        let cpus = Cpus::new(leaked_interrupt_control(true));
        let locks: [Spinlock<u32>; 10] = core::array::from_fn(|i| Spinlock::new("stress", i as u32));
        let mut guards = Vec::new();
        for lock in &locks {
            guards.push(lock.acquire(&cpus, 0, &[]));
        }
        while guards.pop().is_some() {}
        for lock in &locks {
            assert!(!lock.holding(&cpus, 0));
        }
    }
}
