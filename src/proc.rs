//! Process table and state machine.
use core::sync::atomic::{AtomicUsize, Ordering};

use array_macro::array;

use crate::cpu::Cpus;
use crate::error::KernelError;
use crate::hal::AddressSpace;
use crate::param::{NPROC, PROC_CHILDREN};
use crate::spinlock::{Spinlock, SpinlockGuard};
use crate::trapframe::TrapFrame;

/// Width, in bytes, of the trap instruction that enters the kernel on a
/// syscall (x86 `int imm8`: one opcode byte plus one immediate byte). `ret`
/// adds this to a returning child's saved EIP so it resumes past the
/// instruction rather than re-issuing the same syscall.
pub const SYSCALL_INSN_LEN: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Procstate {
    Avail,
    Stop,
    Ready,
    Run,
    Wait,
}

/// One process table entry.
///
/// `D` is the owning address space's directory handle
/// ([`crate::hal::AddressSpace::Dir`]); `dir` is `None` only for `Avail`
/// slots that have never been allocated.
pub struct ProcSlot<D> {
    pub state: Procstate,
    pub parent: Option<usize>,
    pub childno: Option<usize>,
    pub children: [Option<usize>; PROC_CHILDREN],
    pub wait_target: Option<usize>,
    pub tf: TrapFrame,
    pub dir: Option<D>,
}

impl<D: Copy> ProcSlot<D> {
    fn empty() -> Self {
        Self {
            state: Procstate::Avail,
            parent: None,
            childno: None,
            children: [None; PROC_CHILDREN],
            wait_target: None,
            tf: TrapFrame::default(),
            dir: None,
        }
    }
}

/// The fixed-size table of process slots.
///
/// Every access, including a process reading or writing its own fields,
/// goes through the slot's own [`Spinlock`]: the spec permits a running
/// process to touch its own entry lock-free since it is the sole owner
/// while `state = RUN`, but this rendition always takes the lock for
/// uniformity. No two CPUs ever contend on a `RUN` process's own lock, so
/// this costs nothing but a local atomic swap.
pub struct ProcTable<D> {
    slots: [Spinlock<ProcSlot<D>>; NPROC],
    next: AtomicUsize,
}

impl<D: Copy> ProcTable<D> {
    pub fn new() -> Self {
        Self {
            slots: array![_ => Spinlock::new("proc", ProcSlot::empty()); NPROC],
            next: AtomicUsize::new(0),
        }
    }

    /// Direct access to one slot's lock, for handlers that need to read or
    /// write fields the higher-level operations below don't cover (e.g. the
    /// `SYS_REGS` register copy in `PUT`/`GET`).
    pub fn slot(&self, idx: usize) -> &Spinlock<ProcSlot<D>> {
        &self.slots[idx]
    }

    pub fn state_of(&self, cpus: &Cpus, id: usize, idx: usize) -> Procstate {
        self.slots[idx].acquire(cpus, id, &[]).state
    }

    pub fn child_of(&self, cpus: &Cpus, id: usize, idx: usize, childno: usize) -> Option<usize> {
        self.slots[idx].acquire(cpus, id, &[]).children[childno]
    }

    /// Takes a free slot, zeroes its child array, installs a fresh address
    /// space, links it to `parent`/`childno`, and records it in the
    /// parent's child array. Fails with [`KernelError::NoSlot`] if the
    /// table is full.
    pub fn alloc(
        &self,
        cpus: &Cpus,
        id: usize,
        addrspace: &impl AddressSpace<Dir = D>,
        parent: usize,
        childno: usize,
    ) -> Result<usize, KernelError> {
        debug_assert!(childno < PROC_CHILDREN);
        let mut allocated = None;
        for idx in 0..NPROC {
            let mut guard = self.slots[idx].acquire(cpus, id, &[]);
            if guard.state == Procstate::Avail {
                guard.state = Procstate::Stop;
                guard.parent = Some(parent);
                guard.childno = Some(childno);
                guard.children = [None; PROC_CHILDREN];
                guard.wait_target = None;
                guard.tf = TrapFrame::default();
                guard.dir = Some(addrspace.new_dir());
                allocated = Some(idx);
                break;
            }
        }
        let idx = allocated.ok_or(KernelError::NoSlot)?;
        self.slots[parent].acquire(cpus, id, &[]).children[childno] = Some(idx);
        Ok(idx)
    }

    /// STOP -> READY.
    pub fn ready(&self, cpus: &Cpus, id: usize, idx: usize) {
        let mut guard = self.slots[idx].acquire(cpus, id, &[]);
        debug_assert_eq!(guard.state, Procstate::Stop);
        guard.state = Procstate::Ready;
    }

    /// Blocks `parent` on `child_idx`, whose lock the caller already holds
    /// as `child_guard`. Links the parent as the child's waiter, then
    /// drops `child_guard` last, so a concurrent `ret` on the child cannot
    /// observe a parent that isn't linked yet (closes the missed-wakeup
    /// window described in the resource model).
    pub fn wait(
        &self,
        cpus: &Cpus,
        id: usize,
        parent_idx: usize,
        child_idx: usize,
        rewound_tf: TrapFrame,
        child_guard: SpinlockGuard<'_, ProcSlot<D>>,
    ) {
        {
            let mut parent_guard = self.slots[parent_idx].acquire(cpus, id, &[]);
            parent_guard.tf = rewound_tf;
            parent_guard.wait_target = Some(child_idx);
            parent_guard.state = Procstate::Wait;
        }
        drop(child_guard);
    }

    /// RUN -> STOP for `child_idx`; wakes its parent if the parent is
    /// waiting specifically on it.
    pub fn ret(&self, cpus: &Cpus, id: usize, child_idx: usize, mut tf: TrapFrame, entry: bool) {
        let parent_idx = {
            let mut guard = self.slots[child_idx].acquire(cpus, id, &[]);
            if entry {
                tf.eip = tf.eip.wrapping_add(SYSCALL_INSN_LEN);
            }
            guard.tf = tf;
            guard.state = Procstate::Stop;
            guard.parent
        };
        if let Some(parent_idx) = parent_idx {
            let mut parent_guard = self.slots[parent_idx].acquire(cpus, id, &[]);
            if parent_guard.state == Procstate::Wait && parent_guard.wait_target == Some(child_idx) {
                parent_guard.state = Procstate::Ready;
                parent_guard.wait_target = None;
            }
        }
    }

    /// Picks the next READY process in round-robin order, transitions it to
    /// RUN, installs it as the current CPU's process and loads its address
    /// space. Returns `None` if no process is READY.
    pub fn sched(&self, cpus: &Cpus, id: usize, addrspace: &impl AddressSpace<Dir = D>) -> Option<usize> {
        let start = self.next.load(Ordering::Relaxed);
        for offset in 0..NPROC {
            let idx = (start + offset) % NPROC;
            let mut guard = self.slots[idx].acquire(cpus, id, &[]);
            if guard.state == Procstate::Ready {
                guard.state = Procstate::Run;
                let dir = guard.dir.expect("a READY process always has an address space");
                drop(guard);
                cpus.set_proc(id, Some(idx));
                addrspace.load(dir);
                self.next.store((idx + 1) % NPROC, Ordering::Relaxed);
                return Some(idx);
            }
        }
        None
    }
}

impl<D: Copy> Default for ProcTable<D> {
    fn default() -> Self {
        Self::new()
    }
}
