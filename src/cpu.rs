//! Per-CPU descriptor and the push_off/pop_off interrupt-nesting discipline
//! that every spinlock acquisition relies on.
use core::cell::UnsafeCell;
use core::ptr;

use array_macro::array;

use crate::hal::InterruptControl;
use crate::param::NCPU;
use crate::trapframe::TrapFrame;

/// Diverts control to `systrap` if a fault lands mid-copy; see
/// [`Cpu::recover`] and spec §4.3.2.
pub type RecoverFn = fn(ktf: &TrapFrame, recoverdata: *mut TrapFrame);

/// Per-CPU state: the currently running process, the in-copy recovery slot,
/// and the push_off/pop_off nesting counters.
///
/// `proc` is a table index rather than a pointer (this rendition's process
/// table is an arena of fixed slots, see [`crate::proc`]), everything else
/// mirrors the teacher's `Cpu`.
pub struct Cpu {
    proc: Option<usize>,
    pub recover: Option<RecoverFn>,
    pub recoverdata: *mut TrapFrame,
    noff: u32,
    interrupt_enabled: bool,
}

impl Cpu {
    const fn new() -> Self {
        Self {
            proc: None,
            recover: None,
            recoverdata: ptr::null_mut(),
            noff: 0,
            interrupt_enabled: false,
        }
    }
}

/// The table of per-CPU descriptors, one per physical CPU.
///
/// Access always goes through an explicit CPU id rather than a
/// "who am I" primitive: determining the running CPU's identity is an
/// architecture concern (reading an APIC id or a per-CPU segment) that lies
/// outside this core, so callers (the trap entry stub, in a full kernel)
/// thread the id through.
pub struct Cpus {
    cpus: [UnsafeCell<Cpu>; NCPU],
    intr: &'static dyn InterruptControl,
}

// SAFETY: each CPU only ever touches the `Cpu` slot at its own id.
unsafe impl Sync for Cpus {}

impl Cpus {
    pub fn new(intr: &'static dyn InterruptControl) -> Self {
        Self {
            cpus: array![_ => UnsafeCell::new(Cpu::new()); NCPU],
            intr,
        }
    }

    fn slot(&self, id: usize) -> *mut Cpu {
        self.cpus[id].get()
    }

    pub fn get_proc(&self, id: usize) -> Option<usize> {
        // SAFETY: only the owning CPU id calls this for its own slot.
        unsafe { (*self.slot(id)).proc }
    }

    pub fn set_proc(&self, id: usize, proc: Option<usize>) {
        // SAFETY: only the owning CPU id calls this for its own slot.
        unsafe {
            (*self.slot(id)).proc = proc;
        }
    }

    pub fn recover(&self, id: usize) -> Option<RecoverFn> {
        // SAFETY: only the owning CPU id calls this for its own slot.
        unsafe { (*self.slot(id)).recover }
    }

    pub fn set_recover(&self, id: usize, recover: Option<RecoverFn>, recoverdata: *mut TrapFrame) {
        // SAFETY: only the owning CPU id calls this for its own slot.
        unsafe {
            (*self.slot(id)).recover = recover;
            (*self.slot(id)).recoverdata = recoverdata;
        }
    }

    pub fn recoverdata(&self, id: usize) -> *mut TrapFrame {
        // SAFETY: only the owning CPU id calls this for its own slot.
        unsafe { (*self.slot(id)).recoverdata }
    }

    fn get_noff(&self, id: usize) -> u32 {
        // SAFETY: only the owning CPU id calls this for its own slot.
        unsafe { (*self.slot(id)).noff }
    }

    fn set_noff(&self, id: usize, noff: u32) {
        // SAFETY: only the owning CPU id calls this for its own slot.
        unsafe {
            (*self.slot(id)).noff = noff;
        }
    }

    fn get_interrupt(&self, id: usize) -> bool {
        // SAFETY: only the owning CPU id calls this for its own slot.
        unsafe { (*self.slot(id)).interrupt_enabled }
    }

    fn set_interrupt(&self, id: usize, enabled: bool) {
        // SAFETY: only the owning CPU id calls this for its own slot.
        unsafe {
            (*self.slot(id)).interrupt_enabled = enabled;
        }
    }

    /// push_off/pop_off are like `intr_off`/`intr_on` except matched: it
    /// takes two `pop_off`s to undo two `push_off`s, and if interrupts were
    /// already off, `push_off`...`pop_off` leaves them off.
    pub fn push_off(&self, id: usize) {
        let old = self.intr.get();
        self.intr.set(false);
        let noff = self.get_noff(id);
        if noff == 0 {
            self.set_interrupt(id, old);
        }
        self.set_noff(id, noff + 1);
    }

    /// Must be paired with a preceding `push_off` on the same CPU id.
    pub fn pop_off(&self, id: usize) {
        assert!(!self.intr.get(), "pop_off: interruptible");
        let noff = self.get_noff(id);
        assert!(noff >= 1, "pop_off: not holding any lock");
        self.set_noff(id, noff - 1);
        if noff == 1 && self.get_interrupt(id) {
            self.intr.set(true);
        }
    }

    /// True while `id`'s nesting counter is nonzero, i.e. at least one
    /// spinlock is held on that CPU.
    pub fn holding_any(&self, id: usize) -> bool {
        self.get_noff(id) > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::leaked_interrupt_control;

    #[test]
    fn push_pop_restores_prior_state() {
        let intr = leaked_interrupt_control(true);
        let cpus = Cpus::new(intr);
        cpus.push_off(0);
        assert!(!intr.get());
        cpus.pop_off(0);
        assert!(intr.get());
    }

    #[test]
    fn nested_push_off_keeps_interrupts_disabled_until_outermost_pop() {
        let intr = leaked_interrupt_control(true);
        let cpus = Cpus::new(intr);
        cpus.push_off(0);
        cpus.push_off(0);
        assert!(!intr.get());
        cpus.pop_off(0);
        assert!(!intr.get());
        cpus.pop_off(0);
        assert!(intr.get());
    }

    #[test]
    fn push_off_when_already_off_leaves_interrupts_off() {
        let intr = leaked_interrupt_control(false);
        let cpus = Cpus::new(intr);
        cpus.push_off(0);
        cpus.pop_off(0);
        assert!(!intr.get());
    }

    #[test]
    #[should_panic(expected = "pop_off: not holding any lock")]
    fn unmatched_pop_off_panics() {
        let intr = leaked_interrupt_control(true);
        let cpus = Cpus::new(intr);
        cpus.pop_off(0);
    }
}
