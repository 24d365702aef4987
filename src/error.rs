//! Error kinds for the process-control core.
use core::fmt;

/// A kernel-fatal condition: the calling CPU halts with a diagnostic print.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// The current CPU attempted to acquire a spinlock it already holds.
    DoubleAcquire,
    /// The current CPU attempted to release a spinlock it does not hold.
    NotOwner,
    /// The syscall command word did not match any known `SYS_TYPE`.
    BadSyscall,
    /// The process table has no `AVAIL` slot left for `alloc`.
    NoSlot,
    /// A syscall flag bit was set that this kernel does not implement.
    UnimplementedFlag,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            KernelError::DoubleAcquire => "spinlock: already held by this CPU",
            KernelError::NotOwner => "spinlock: released by a CPU that does not hold it",
            KernelError::BadSyscall => "unhandled syscall command",
            KernelError::NoSlot => "process table full",
            KernelError::UnimplementedFlag => "syscall flag not implemented",
        };
        f.write_str(msg)
    }
}

impl KernelError {
    /// Halts the calling CPU after logging the error, per spec §7's fatal
    /// error contract. Loops forever on real hardware; under test, panics
    /// so the condition is observable by `#[should_panic]`.
    #[cfg(not(test))]
    pub fn halt(self) -> ! {
        crate::println!("kernel: fatal: {}", self);
        loop {
            core::hint::spin_loop();
        }
    }

    #[cfg(test)]
    pub fn halt(self) -> ! {
        panic!("kernel: fatal: {}", self);
    }
}

/// Boot-time validation failure while parsing the root process's ELF image.
///
/// Distinct from [`KernelError`] because a malformed root image is bad input,
/// not a runtime invariant violation; `read_elf` returns this instead of
/// panicking the bootstrap CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfLoadError {
    /// `e_magic` did not match `ELF_MAGIC`.
    BadMagic,
    /// A section's `(sh_offset, sh_size)` falls outside the supplied image.
    SectionOutOfBounds,
    /// A section's `(sh_addr, sh_size)` would overflow or escape the user window.
    AddressOutOfWindow,
}

impl fmt::Display for ElfLoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            ElfLoadError::BadMagic => "root image is not a valid ELF file",
            ElfLoadError::SectionOutOfBounds => "section references data past the end of the image",
            ElfLoadError::AddressOutOfWindow => "section address falls outside the user window",
        };
        f.write_str(msg)
    }
}
