//! Collaborator contracts.
//!
//! Boot entry, console wiring, GDT/IDT/TSS setup, interrupt-controller
//! programming, the physical page allocator and the paged address space all
//! live outside this core. They are modeled here as traits so the
//! process-control subsystem can be built, and tested on the host, against a
//! fixed interface instead of real hardware. A production kernel supplies one
//! concrete implementation of each trait at boot; `testkit` supplies another
//! for `#[cfg(test)]`.
use bitflags::bitflags;

/// A page-sized physical frame handle.
///
/// Frames are identified by their physical address; the core never
/// dereferences this value directly, all access goes through
/// [`AddressSpace`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page(pub u32);

/// Hands out page-sized physical frames.
///
/// Mirrors the teacher's `kalloc.rs`/`page.rs` free-list allocator, reduced
/// to the contract this core depends on; the allocator's own free-list
/// implementation is out of scope here.
pub trait PageAllocator {
    /// Allocates one zeroed page, or `None` if physical memory is exhausted.
    fn alloc_page(&self) -> Option<Page>;

    /// Returns a page to the allocator.
    fn free_page(&self, page: Page);

    /// The shared read-only sentinel "zero page": a single physical frame of
    /// zero bytes that a deferred-zero-fill mapping (SYS_ZERO) can point
    /// multiple virtual addresses at without allocating real backing storage
    /// until one of them is written.
    fn zero_page(&self) -> Page;
}

bitflags! {
    /// Page-table entry permission bits, independent of any one directory format.
    #[derive(Default)]
    pub struct PteFlags: u32 {
        const PRESENT  = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER     = 1 << 2;
    }
}

/// Failure modes an [`AddressSpace`] operation can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrSpaceError {
    /// The target virtual address has no mapping.
    Unmapped,
    /// A mapping exists but the operation required different permissions
    /// (e.g. `set_writable` on a page that was never present).
    BadPermissions,
    /// The allocator could not supply a frame for a new mapping.
    OutOfMemory,
}

/// Builds and mutates a per-process page directory.
///
/// `Dir` is an opaque handle to one address space (a page directory, in the
/// x86 sense); it is `Copy` because directories are cheap to pass around by
/// value to the structure that owns them.
///
/// Mirrors the teacher's `arch::interface` trait-per-concern style and the
/// `pmap_*` functions the original kernel calls directly.
pub trait AddressSpace {
    type Dir: Copy;

    /// Creates a fresh, empty address space.
    fn new_dir(&self) -> Self::Dir;

    /// Maps a freshly allocated page at `va` with the given permissions,
    /// displacing any existing mapping there.
    fn insert(&self, dir: Self::Dir, page: Page, va: u32, perms: PteFlags) -> Result<(), AddrSpaceError>;

    /// Returns the permissions of the mapping at `va`, or `None` if unmapped.
    fn perms(&self, dir: Self::Dir, va: u32) -> Option<PteFlags>;

    /// Sets or clears the writable bit of an existing mapping at `va`.
    /// Fails with [`AddrSpaceError::Unmapped`] if no page is mapped there.
    fn set_writable(&self, dir: Self::Dir, va: u32, writable: bool) -> Result<(), AddrSpaceError>;

    /// Copies `size` bytes from `src_va` in `src` to `dst_va` in `dst`.
    /// Range-granular; a real implementation may share frames copy-on-write
    /// rather than duplicating bytes, that policy is this trait's
    /// implementor's business.
    fn copy(
        &self,
        src: Self::Dir,
        src_va: u32,
        dst: Self::Dir,
        dst_va: u32,
        size: u32,
    ) -> Result<(), AddrSpaceError>;

    /// Fills `[va, va + size)` in `dir` with zero bytes, installing mappings
    /// to the allocator's zero-page sentinel where none exist yet.
    fn zero_fill(&self, dir: Self::Dir, va: u32, size: u32) -> Result<(), AddrSpaceError>;

    /// Writes `bytes` into `dir` starting at `dst_va` (kernel -> user).
    fn copy_out(&self, dir: Self::Dir, dst_va: u32, bytes: &[u8]) -> Result<(), AddrSpaceError>;

    /// Reads `out.len()` bytes starting at `src_va` in `dir` (user -> kernel).
    fn copy_in(&self, dir: Self::Dir, out: &mut [u8], src_va: u32) -> Result<(), AddrSpaceError>;

    /// Installs `dir` as the current CPU's active address space.
    fn load(&self, dir: Self::Dir);
}

/// Prints kernel-space bytes one at a time.
///
/// The only console operation this core needs; UART/VGA wiring is an
/// external concern.
pub trait Console: Sync {
    fn putc(&self, byte: u8);
}

/// Controls whether external interrupts are delivered to the current CPU.
///
/// Backs the push_off/pop_off nesting discipline in [`crate::cpu`]: a real
/// implementation wraps `cli`/`sti`; `testkit` wraps an `AtomicBool`.
pub trait InterruptControl: Sync {
    fn get(&self) -> bool;
    fn set(&self, enabled: bool);
}
