//! Fault reflection to a process's parent.
use crate::cpu::Cpus;
use crate::proc::ProcTable;
use crate::trapframe::TrapFrame;

/// Software trap number: syscall entry via `int imm8`.
pub const T_SYSCALL: u32 = 48;
/// Hardware trap number: page fault.
pub const T_PGFLT: u32 = 14;
/// Hardware trap number: general protection fault.
pub const T_GPFLT: u32 = 13;

/// Reflects a fault in the current process back to its parent, the same way
/// a syscall return does: installs `trapno`/`err` in the trap frame and
/// hands control to [`ProcTable::ret`] with `entry = true` so the saved EIP
/// advances past the instruction that faulted.
///
/// The original kernel's `systrap` walks the current CPU's held locks and
/// releases any it finds before reflecting the fault, because a longjmp-style
/// recovery can unwind past a held lock's `release` call. This core instead
/// detects fault conditions as ordinary `Err` returns (see
/// [`crate::usercopy`]), so by the time `systrap` runs here, every
/// [`crate::spinlock::SpinlockGuard`] the caller was holding has already
/// dropped out of scope through ordinary control flow; there is nothing left
/// to scan for.
pub fn systrap<D: Copy>(
    table: &ProcTable<D>,
    cpus: &Cpus,
    id: usize,
    mut utf: TrapFrame,
    trapno: u32,
    err: u32,
) {
    utf.trapno = trapno;
    utf.err = err;
    let child_idx = cpus
        .get_proc(id)
        .expect("systrap: no process running on this CPU");
    table.ret(cpus, id, child_idx, utf, true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::Procstate;
    use crate::testkit::{leaked_interrupt_control, TestAddressSpace};

    #[test]
    fn systrap_reflects_fault_and_advances_eip() {
        let cpus = Cpus::new(leaked_interrupt_control(true));
        let table: ProcTable<u32> = ProcTable::new();
        let addrspace = TestAddressSpace::new();
        {
            let mut root = table.slot(0).acquire(&cpus, 0, &[]);
            root.state = Procstate::Run;
        }
        let child = table.alloc(&cpus, 0, &addrspace, 0, 0).unwrap();
        {
            let mut guard = table.slot(child).acquire(&cpus, 0, &[]);
            guard.state = Procstate::Run;
        }
        cpus.set_proc(0, Some(child));

        let tf = TrapFrame { eip: 0x2000, ..Default::default() };
        systrap(&table, &cpus, 0, tf, T_PGFLT, 1);

        let guard = table.slot(child).acquire(&cpus, 0, &[]);
        assert_eq!(guard.state, Procstate::Stop);
        assert_eq!(guard.tf.trapno, T_PGFLT);
        assert_eq!(guard.tf.err, 1);
        assert_eq!(guard.tf.eip, 0x2000 + crate::proc::SYSCALL_INSN_LEN);
    }
}
