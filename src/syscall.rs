//! System-call dispatcher: `CPUTS`/`PUT`/`GET`/`RET`.
use bitflags::bitflags;
use zerocopy::{AsBytes, FromBytes};

use crate::cpu::Cpus;
use crate::error::KernelError;
use crate::hal::{AddressSpace, Console, PageAllocator};
use crate::memlayout::PAGESIZE;
use crate::param::PROC_CHILDREN;
use crate::proc::{ProcTable, Procstate, SYSCALL_INSN_LEN};
use crate::trap;
use crate::trapframe::{TrapFrame, USER_CODE_SELECTOR, USER_DATA_SELECTOR};
use crate::usercopy::{self, CopyFault};

/// Mask selecting the command nibble out of `EAX`.
pub const SYS_TYPE: u32 = 0xf;

pub const SYS_CPUTS: u32 = 1;
pub const SYS_PUT: u32 = 2;
pub const SYS_GET: u32 = 3;
pub const SYS_RET: u32 = 4;

bitflags! {
    /// Flag bits above the `SYS_TYPE` nibble of `EAX`.
    pub struct SysFlags: u32 {
        const REGS = 1 << 4;
        const START = 1 << 5;
        const COPY = 1 << 6;
        const ZERO = 1 << 7;
        const MERGE = 1 << 8;
    }
}

/// Rewinds `tf.eip` back to the trapping instruction, so that when the
/// blocked process resumes it re-issues the same syscall. Undoes whatever
/// the trap entry stub advanced `eip` by on entry (outside this core).
fn rewind(tf: &TrapFrame) -> TrapFrame {
    TrapFrame {
        eip: tf.eip.wrapping_sub(SYSCALL_INSN_LEN),
        ..*tf
    }
}

/// Validates `[va, va + size)` against the user window, reflecting a page
/// fault to `tf`'s process and returning `Err` if it's out of bounds.
fn checkva_or_trap<D: Copy>(
    table: &ProcTable<D>,
    cpus: &Cpus,
    id: usize,
    tf: &TrapFrame,
    va: u32,
    size: u32,
) -> Result<(), ()> {
    match usercopy::checkva(va, size) {
        Ok(()) => Ok(()),
        Err(fault) => {
            let (trapno, err) = fault.trap();
            trap::systrap(table, cpus, id, *tf, trapno, err);
            Err(())
        }
    }
}

/// Entry point called by the (out-of-core) trap dispatcher with the
/// currently running process's trap frame. `dir` is that process's own
/// address space directory, already looked up by the caller.
pub fn dispatch<D: Copy>(
    table: &ProcTable<D>,
    cpus: &Cpus,
    id: usize,
    addrspace: &impl AddressSpace<Dir = D>,
    page_allocator: &impl PageAllocator,
    console: &dyn Console,
    dir: D,
    tf: TrapFrame,
) {
    let cmd = tf.regs.eax;
    match cmd & SYS_TYPE {
        SYS_CPUTS => do_cputs(table, cpus, id, addrspace, page_allocator, console, dir, tf),
        SYS_PUT => do_put(table, cpus, id, addrspace, dir, tf),
        SYS_GET => do_get(table, cpus, id, addrspace, dir, tf),
        SYS_RET => {
            let self_idx = cpus.get_proc(id).expect("syscall: no process running on this CPU");
            table.ret(cpus, id, self_idx, tf, true);
        }
        _ => KernelError::BadSyscall.halt(),
    }
}

/// Reads a NUL-terminated user string (up to one page) and writes it to the
/// console. The scratch buffer lives on the kernel stack rather than a
/// mapped [`crate::hal::Page`]: this core has no way to obtain a kernel-side
/// pointer into a physical frame without a full virtual-memory mapping
/// facility, which is out of scope (see `hal.rs`).
fn do_cputs<D: Copy>(
    table: &ProcTable<D>,
    cpus: &Cpus,
    id: usize,
    addrspace: &impl AddressSpace<Dir = D>,
    _page_allocator: &impl PageAllocator,
    console: &dyn Console,
    dir: D,
    tf: TrapFrame,
) {
    let uva = tf.regs.ebx;
    let mut byte = [0u8; 1];
    for offset in 0..PAGESIZE {
        let va = match uva.checked_add(offset) {
            Some(va) => va,
            None => {
                let (trapno, err) = CopyFault::OutOfWindow.trap();
                trap::systrap(table, cpus, id, tf, trapno, err);
                return;
            }
        };
        if usercopy::copyin(cpus, id, addrspace, dir, &mut byte, va).is_err() {
            let (trapno, err) = CopyFault::Unmapped.trap();
            trap::systrap(table, cpus, id, tf, trapno, err);
            return;
        }
        if byte[0] == 0 {
            break;
        }
        console.putc(byte[0]);
    }
}

/// `PUT(flags, childno, userstate*)`: installs register/fs/gs/eflags state,
/// copies or zero-fills memory, and optionally starts a stopped child.
fn do_put<D: Copy>(
    table: &ProcTable<D>,
    cpus: &Cpus,
    id: usize,
    addrspace: &impl AddressSpace<Dir = D>,
    parent_dir: D,
    tf: TrapFrame,
) {
    let flags = SysFlags::from_bits_truncate(tf.regs.eax);
    let childno = tf.regs.edx as usize;
    debug_assert!(childno < PROC_CHILDREN, "PUT: child index out of range");

    let parent_idx = cpus.get_proc(id).expect("PUT: no process running on this CPU");
    let child_idx = match table.child_of(cpus, id, parent_idx, childno) {
        Some(idx) => idx,
        None => table
            .alloc(cpus, id, addrspace, parent_idx, childno)
            .unwrap_or_else(|e| e.halt()),
    };

    let mut child_guard = table.slot(child_idx).acquire(cpus, id, &[]);
    if child_guard.state != Procstate::Stop {
        table.wait(cpus, id, parent_idx, child_idx, rewind(&tf), child_guard);
        return;
    }

    let child_dir = child_guard.dir.expect("PUT: child has no address space");

    if flags.contains(SysFlags::REGS) {
        let mut userstate = TrapFrame::default();
        if usercopy::copyin(cpus, id, addrspace, parent_dir, userstate.as_bytes_mut(), tf.regs.ebx).is_err() {
            drop(child_guard);
            let (trapno, err) = CopyFault::Unmapped.trap();
            trap::systrap(table, cpus, id, tf, trapno, err);
            return;
        }
        child_guard.tf.regs = userstate.regs;
        child_guard.tf.cs = USER_CODE_SELECTOR;
        child_guard.tf.ds = USER_DATA_SELECTOR;
        child_guard.tf.es = USER_DATA_SELECTOR;
        child_guard.tf.ss = USER_DATA_SELECTOR;
        child_guard.tf.eip = userstate.eip;
        child_guard.tf.esp = userstate.esp;
        child_guard.tf.fs = userstate.fs;
        child_guard.tf.gs = userstate.gs;
        child_guard.tf.set_user_eflags(userstate.user_eflags());
    }

    if flags.contains(SysFlags::COPY) {
        let size = tf.regs.ecx;
        let sva = tf.regs.esi;
        let dva = tf.regs.edi;
        if checkva_or_trap(table, cpus, id, &tf, sva, size).is_err()
            || checkva_or_trap(table, cpus, id, &tf, dva, size).is_err()
        {
            return;
        }
        if addrspace.copy(parent_dir, sva, child_dir, dva, size).is_err() {
            let (trapno, err) = CopyFault::Unmapped.trap();
            trap::systrap(table, cpus, id, tf, trapno, err);
            return;
        }
    }

    if flags.contains(SysFlags::ZERO) {
        let size = tf.regs.ecx;
        let dva = tf.regs.edi;
        if checkva_or_trap(table, cpus, id, &tf, dva, size).is_err() {
            return;
        }
        if addrspace.zero_fill(child_dir, dva, size).is_err() {
            let (trapno, err) = CopyFault::Unmapped.trap();
            trap::systrap(table, cpus, id, tf, trapno, err);
            return;
        }
    }

    if flags.contains(SysFlags::START) {
        drop(child_guard);
        table.ready(cpus, id, child_idx);
    }
}

/// `GET(flags, childno, userstate*)`: dual of `PUT`.
fn do_get<D: Copy>(
    table: &ProcTable<D>,
    cpus: &Cpus,
    id: usize,
    addrspace: &impl AddressSpace<Dir = D>,
    parent_dir: D,
    tf: TrapFrame,
) {
    let flags = SysFlags::from_bits_truncate(tf.regs.eax);
    let childno = tf.regs.edx as usize;
    debug_assert!(childno < PROC_CHILDREN, "GET: child index out of range");

    let parent_idx = cpus.get_proc(id).expect("GET: no process running on this CPU");
    let child_idx = table
        .child_of(cpus, id, parent_idx, childno)
        .expect("GET: child slot was never PUT");

    let child_guard = table.slot(child_idx).acquire(cpus, id, &[]);
    if child_guard.state != Procstate::Stop {
        table.wait(cpus, id, parent_idx, child_idx, rewind(&tf), child_guard);
        return;
    }

    let child_dir = child_guard.dir.expect("GET: child has no address space");

    if flags.contains(SysFlags::REGS) {
        let regs_ok = usercopy::copyout(cpus, id, addrspace, parent_dir, tf.regs.ebx, child_guard.tf.as_bytes()).is_ok();
        if !regs_ok {
            drop(child_guard);
            let (trapno, err) = CopyFault::Unmapped.trap();
            trap::systrap(table, cpus, id, tf, trapno, err);
            return;
        }
    }
    drop(child_guard);

    if flags.contains(SysFlags::COPY) {
        let size = tf.regs.ecx;
        let sva = tf.regs.esi;
        let dva = tf.regs.edi;
        if checkva_or_trap(table, cpus, id, &tf, sva, size).is_err()
            || checkva_or_trap(table, cpus, id, &tf, dva, size).is_err()
        {
            return;
        }
        if addrspace.copy(child_dir, sva, parent_dir, dva, size).is_err() {
            let (trapno, err) = CopyFault::Unmapped.trap();
            trap::systrap(table, cpus, id, tf, trapno, err);
            return;
        }
    }

    if flags.contains(SysFlags::ZERO) || flags.contains(SysFlags::MERGE) {
        KernelError::UnimplementedFlag.halt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{leaked_interrupt_control, BufferConsole, TestAddressSpace, TestPageAllocator};
    use crate::trapframe::PushRegs;

    fn fixture() -> (Cpus, ProcTable<u32>, TestAddressSpace, TestPageAllocator, BufferConsole) {
        let cpus = Cpus::new(leaked_interrupt_control(true));
        (cpus, ProcTable::new(), TestAddressSpace::new(), TestPageAllocator::default(), BufferConsole::new())
    }

    fn boot_root(cpus: &Cpus, table: &ProcTable<u32>, addrspace: &TestAddressSpace) -> u32 {
        let dir = addrspace.new_dir();
        let mut root = table.slot(0).acquire(cpus, 0, &[]);
        root.state = Procstate::Run;
        root.dir = Some(dir);
        drop(root);
        cpus.set_proc(0, Some(0));
        dir
    }

    #[test]
    fn cputs_writes_string_up_to_nul_terminator() {
        let (cpus, table, addrspace, alloc, console) = fixture();
        let dir = boot_root(&cpus, &table, &addrspace);
        let page = alloc.alloc_page().unwrap();
        let uva = crate::memlayout::VM_USERLO;
        addrspace
            .insert(dir, page, uva, crate::hal::PteFlags::PRESENT | crate::hal::PteFlags::WRITABLE | crate::hal::PteFlags::USER)
            .unwrap();
        usercopy::copyout(&cpus, 0, &addrspace, dir, uva, b"hi\0").unwrap();

        let tf = TrapFrame {
            regs: PushRegs { eax: SYS_CPUTS, ebx: uva, ..Default::default() },
            ..Default::default()
        };
        do_cputs(&table, &cpus, 0, &addrspace, &alloc, &console, dir, tf);
        assert_eq!(console.take(), b"hi".to_vec());
    }

    #[test]
    fn put_allocates_and_starts_a_child() {
        let (cpus, table, addrspace, _alloc, _console) = fixture();
        let dir = boot_root(&cpus, &table, &addrspace);

        let tf = TrapFrame {
            regs: PushRegs { eax: SYS_PUT | SysFlags::START.bits(), edx: 3, ..Default::default() },
            ..Default::default()
        };
        do_put(&table, &cpus, 0, &addrspace, dir, tf);

        let child = table.child_of(&cpus, 0, 0, 3).expect("child slot 3 allocated");
        assert_eq!(table.state_of(&cpus, 0, child), Procstate::Ready);
    }

    #[test]
    fn put_with_regs_masks_eflags_and_forces_selectors() {
        let (cpus, table, addrspace, alloc, _console) = fixture();
        let dir = boot_root(&cpus, &table, &addrspace);
        let userstate_va = crate::memlayout::VM_USERLO;
        let page = alloc.alloc_page().unwrap();
        addrspace
            .insert(dir, page, userstate_va, crate::hal::PteFlags::PRESENT | crate::hal::PteFlags::WRITABLE | crate::hal::PteFlags::USER)
            .unwrap();
        let mut userstate = TrapFrame {
            eip: 0x5000,
            esp: 0x6000,
            fs: 0x23,
            gs: 0x2b,
            eflags: (crate::trapframe::EflagsFlags::CF | crate::trapframe::EflagsFlags::IF).bits(),
            ..Default::default()
        };
        userstate.regs.eax = 42;
        usercopy::copyout(&cpus, 0, &addrspace, dir, userstate_va, userstate.as_bytes()).unwrap();

        let tf = TrapFrame {
            regs: PushRegs {
                eax: SYS_PUT | SysFlags::REGS.bits(),
                edx: 5,
                ebx: userstate_va,
                ..Default::default()
            },
            ..Default::default()
        };
        do_put(&table, &cpus, 0, &addrspace, dir, tf);

        let child = table.child_of(&cpus, 0, 0, 5).unwrap();
        let guard = table.slot(child).acquire(&cpus, 0, &[]);
        assert_eq!(guard.tf.regs.eax, 42);
        assert_eq!(guard.tf.eip, 0x5000);
        assert_eq!(guard.tf.esp, 0x6000);
        assert_eq!(guard.tf.fs, 0x23);
        assert_eq!(guard.tf.gs, 0x2b);
        assert_eq!(guard.tf.cs, USER_CODE_SELECTOR);
        assert!(guard.tf.user_eflags().contains(crate::trapframe::EflagsFlags::CF));
        let installed = crate::trapframe::EflagsFlags::from_bits_truncate(guard.tf.eflags);
        assert!(!installed.contains(crate::trapframe::EflagsFlags::IF));
    }

    #[test]
    fn put_on_running_child_blocks_the_parent() {
        let (cpus, table, addrspace, _alloc, _console) = fixture();
        boot_root(&cpus, &table, &addrspace);
        let child = table.alloc(&cpus, 0, &addrspace, 0, 1).unwrap();
        {
            let mut guard = table.slot(child).acquire(&cpus, 0, &[]);
            guard.state = Procstate::Run;
        }

        let tf = TrapFrame {
            eip: 0x1234,
            regs: PushRegs { eax: SYS_PUT, edx: 1, ..Default::default() },
            ..Default::default()
        };
        do_put(&table, &cpus, 0, &addrspace, 0, tf);

        assert_eq!(table.state_of(&cpus, 0, 0), Procstate::Wait);
        let guard = table.slot(0).acquire(&cpus, 0, &[]);
        assert_eq!(guard.tf.eip, 0x1234 - SYSCALL_INSN_LEN);
    }

    #[test]
    fn get_with_zero_flag_is_fatal() {
        let (cpus, table, addrspace, _alloc, _console) = fixture();
        let dir = boot_root(&cpus, &table, &addrspace);
        let child = table.alloc(&cpus, 0, &addrspace, 0, 2).unwrap();
        {
            let mut guard = table.slot(child).acquire(&cpus, 0, &[]);
            guard.state = Procstate::Stop;
        }
        let tf = TrapFrame {
            regs: PushRegs { eax: SYS_GET | SysFlags::ZERO.bits(), edx: 2, ..Default::default() },
            ..Default::default()
        };
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            do_get(&table, &cpus, 0, &addrspace, dir, tf);
        }));
        assert!(result.is_err());
    }
}
