//! Bounds-checked user/kernel memory copy.
use crate::cpu::Cpus;
use crate::hal::{AddrSpaceError, AddressSpace};
use crate::memlayout::in_user_window;
use crate::trap::T_PGFLT;
use crate::trapframe::TrapFrame;

/// Why a copy could not be completed; carries enough information for the
/// caller to reflect it to the process's parent via `systrap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyFault {
    /// `uva`/`size` fall outside `[VM_USERLO, VM_USERHI)`, or the range
    /// overflows.
    OutOfWindow,
    /// The address space has no mapping somewhere in the range.
    Unmapped,
    /// The range is mapped but not writable (only possible for `copyout`).
    BadPermissions,
}

impl CopyFault {
    /// `(trapno, err)` to install in the trap frame before reflecting the
    /// fault, mirroring the hardware page-fault error code's present/absent
    /// bit.
    pub fn trap(self) -> (u32, u32) {
        match self {
            CopyFault::OutOfWindow => (T_PGFLT, 0),
            CopyFault::Unmapped => (T_PGFLT, 0),
            CopyFault::BadPermissions => (T_PGFLT, 1),
        }
    }
}

impl From<AddrSpaceError> for CopyFault {
    fn from(e: AddrSpaceError) -> Self {
        match e {
            AddrSpaceError::Unmapped => CopyFault::Unmapped,
            AddrSpaceError::BadPermissions => CopyFault::BadPermissions,
            AddrSpaceError::OutOfMemory => CopyFault::Unmapped,
        }
    }
}

/// Validates that `[uva, uva + size)` lies entirely inside the user
/// address window, rejecting overflow rather than wrapping.
pub fn checkva(uva: u32, size: u32) -> Result<(), CopyFault> {
    if in_user_window(uva, size) {
        Ok(())
    } else {
        Err(CopyFault::OutOfWindow)
    }
}

/// Placeholder for the `recover` slot a real (out-of-core) trap dispatcher
/// would invoke if a hardware fault landed mid-copy. This core's copy
/// primitives detect fault conditions directly and return `Err`, so this
/// is never actually called; it exists only so `Cpu::recover` has a
/// well-typed value to hold while a copy is in flight, matching the data
/// layout a real trap handler expects.
pub fn sysrecover(_ktf: &TrapFrame, _recoverdata: *mut TrapFrame) {
    unreachable!("copy faults are detected and returned as Err, not trapped into")
}

/// Copies `out.len()` bytes from `uva` in `dir` into `out` (user -> kernel),
/// after validating the range and installing/clearing the per-CPU recovery
/// slot around the copy.
pub fn copyin<D: Copy>(
    cpus: &Cpus,
    id: usize,
    addrspace: &impl AddressSpace<Dir = D>,
    dir: D,
    out: &mut [u8],
    uva: u32,
) -> Result<(), CopyFault> {
    checkva(uva, out.len() as u32)?;
    cpus.set_recover(id, Some(sysrecover), core::ptr::null_mut());
    let result = addrspace.copy_in(dir, out, uva).map_err(CopyFault::from);
    cpus.set_recover(id, None, core::ptr::null_mut());
    result
}

/// Copies `bytes` into `dir` starting at `uva` (kernel -> user), after
/// validating the range.
pub fn copyout<D: Copy>(
    cpus: &Cpus,
    id: usize,
    addrspace: &impl AddressSpace<Dir = D>,
    dir: D,
    uva: u32,
    bytes: &[u8],
) -> Result<(), CopyFault> {
    checkva(uva, bytes.len() as u32)?;
    cpus.set_recover(id, Some(sysrecover), core::ptr::null_mut());
    let result = addrspace.copy_out(dir, uva, bytes).map_err(CopyFault::from);
    cpus.set_recover(id, None, core::ptr::null_mut());
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::{Page, PageAllocator, PteFlags};
    use crate::memlayout::{VM_USERHI, VM_USERLO};
    use crate::testkit::{leaked_interrupt_control, TestAddressSpace, TestPageAllocator};

    #[test]
    fn rejects_out_of_window_addresses() {
        assert_eq!(checkva(VM_USERLO - 1, 1), Err(CopyFault::OutOfWindow));
        assert_eq!(checkva(VM_USERHI, 1), Err(CopyFault::OutOfWindow));
        assert!(checkva(VM_USERLO, VM_USERHI - VM_USERLO).is_ok());
    }

    #[test]
    fn rejects_size_that_would_overflow_the_window() {
        assert_eq!(checkva(VM_USERHI - 4, u32::MAX), Err(CopyFault::OutOfWindow));
    }

    #[test]
    fn copyin_round_trips_through_a_mapped_page() {
        let cpus = Cpus::new(leaked_interrupt_control(true));
        let addrspace = TestAddressSpace::new();
        let alloc = TestPageAllocator::default();
        let dir = addrspace.new_dir();
        let page: Page = alloc.alloc_page().unwrap();
        let va = VM_USERLO;
        addrspace
            .insert(dir, page, va, PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER)
            .unwrap();
        copyout(&cpus, 0, &addrspace, dir, va, b"hi").unwrap();
        let mut out = [0u8; 2];
        copyin(&cpus, 0, &addrspace, dir, &mut out, va).unwrap();
        assert_eq!(&out, b"hi");
    }

    #[test]
    fn copyin_from_unmapped_address_is_reflected_as_a_page_fault() {
        let cpus = Cpus::new(leaked_interrupt_control(true));
        let addrspace = TestAddressSpace::new();
        let dir = addrspace.new_dir();
        let mut out = [0u8; 4];
        let fault = copyin(&cpus, 0, &addrspace, dir, &mut out, VM_USERLO).unwrap_err();
        assert_eq!(fault, CopyFault::Unmapped);
        assert_eq!(fault.trap().0, T_PGFLT);
    }

    #[test]
    fn copyout_to_read_only_page_is_rejected() {
        let cpus = Cpus::new(leaked_interrupt_control(true));
        let addrspace = TestAddressSpace::new();
        let alloc = TestPageAllocator::default();
        let dir = addrspace.new_dir();
        let page = alloc.alloc_page().unwrap();
        let va = VM_USERLO;
        addrspace.insert(dir, page, va, PteFlags::PRESENT | PteFlags::USER).unwrap();
        let fault = copyout(&cpus, 0, &addrspace, dir, va, b"x").unwrap_err();
        assert_eq!(fault, CopyFault::BadPermissions);
    }
}
