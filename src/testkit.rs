//! Host-testable reference collaborators.
//!
//! Stand-ins for the hardware-dependent traits in [`crate::hal`] and for
//! [`crate::cpu::Cpus`]'s `'static` interrupt-controller requirement, reused
//! across the spinlock, cpu, proc, syscall, usercopy and elf test modules.
//! Pattern: a `#[cfg(test)]`-only module of fixtures standing in for
//! external collaborators, the same shape other no_std kernels in the wider
//! pack use for host-side unit testing.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use crate::hal::{AddrSpaceError, AddressSpace, Console, InterruptControl, Page, PageAllocator, PteFlags};
use crate::memlayout::PAGESIZE;

/// An `AtomicBool`-backed [`InterruptControl`].
pub struct TestInterruptControl(AtomicBool);

impl TestInterruptControl {
    pub const fn new(initial: bool) -> Self {
        Self(AtomicBool::new(initial))
    }
}

impl InterruptControl for TestInterruptControl {
    fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::SeqCst);
    }
}

/// Leaks a fresh [`TestInterruptControl`] so it can satisfy
/// [`crate::cpu::Cpus::new`]'s `'static` bound without two tests sharing
/// (and racing on) one global flag.
pub fn leaked_interrupt_control(initial: bool) -> &'static TestInterruptControl {
    Box::leak(Box::new(TestInterruptControl::new(initial)))
}

/// A console that records bytes instead of printing them.
pub struct BufferConsole(Mutex<Vec<u8>>);

impl BufferConsole {
    pub fn new() -> Self {
        Self(Mutex::new(Vec::new()))
    }

    /// Drains and returns everything written so far.
    pub fn take(&self) -> Vec<u8> {
        core::mem::take(&mut *self.0.lock().unwrap())
    }
}

impl Default for BufferConsole {
    fn default() -> Self {
        Self::new()
    }
}

impl Console for BufferConsole {
    fn putc(&self, byte: u8) {
        self.0.lock().unwrap().push(byte);
    }
}

const ZERO_PAGE_ADDR: u32 = 0xffff_f000;

/// A bump allocator over a fixed pool of frame addresses; never reuses a
/// freed frame (sufficient for exercising the contract, not a real
/// allocator).
pub struct TestPageAllocator {
    next: AtomicU32,
    limit: u32,
}

impl TestPageAllocator {
    pub fn new(capacity_pages: u32) -> Self {
        Self {
            next: AtomicU32::new(0x1000_0000),
            limit: 0x1000_0000 + capacity_pages * PAGESIZE,
        }
    }
}

impl Default for TestPageAllocator {
    fn default() -> Self {
        Self::new(256)
    }
}

impl PageAllocator for TestPageAllocator {
    fn alloc_page(&self) -> Option<Page> {
        let addr = self.next.fetch_add(PAGESIZE, Ordering::SeqCst);
        if addr >= self.limit {
            return None;
        }
        Some(Page(addr))
    }

    fn free_page(&self, _page: Page) {}

    fn zero_page(&self) -> Page {
        Page(ZERO_PAGE_ADDR)
    }
}

/// An in-memory, `HashMap`-backed [`AddressSpace`]. Each directory is an
/// opaque `u32` id; page contents live directly in this structure rather
/// than being backed by a [`PageAllocator`]'s frames, since the mapping
/// between a frame and its bytes is this trait implementor's business, not
/// part of the contract under test.
pub struct TestAddressSpace {
    next_dir: AtomicU32,
    pages: Mutex<HashMap<(u32, u32), ([u8; PAGESIZE as usize], PteFlags)>>,
}

impl TestAddressSpace {
    pub fn new() -> Self {
        Self {
            next_dir: AtomicU32::new(1),
            pages: Mutex::new(HashMap::new()),
        }
    }

    fn page_va(va: u32) -> u32 {
        va & !(PAGESIZE - 1)
    }
}

impl Default for TestAddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpace for TestAddressSpace {
    type Dir = u32;

    fn new_dir(&self) -> u32 {
        self.next_dir.fetch_add(1, Ordering::SeqCst)
    }

    fn insert(&self, dir: u32, _page: Page, va: u32, perms: PteFlags) -> Result<(), AddrSpaceError> {
        self.pages
            .lock()
            .unwrap()
            .insert((dir, Self::page_va(va)), ([0u8; PAGESIZE as usize], perms));
        Ok(())
    }

    fn perms(&self, dir: u32, va: u32) -> Option<PteFlags> {
        self.pages
            .lock()
            .unwrap()
            .get(&(dir, Self::page_va(va)))
            .map(|(_, perms)| *perms)
    }

    fn set_writable(&self, dir: u32, va: u32, writable: bool) -> Result<(), AddrSpaceError> {
        let mut pages = self.pages.lock().unwrap();
        let (_, perms) = pages
            .get_mut(&(dir, Self::page_va(va)))
            .ok_or(AddrSpaceError::Unmapped)?;
        perms.set(PteFlags::WRITABLE, writable);
        Ok(())
    }

    fn copy(&self, src: u32, src_va: u32, dst: u32, dst_va: u32, size: u32) -> Result<(), AddrSpaceError> {
        let mut buf = vec![0u8; size as usize];
        self.copy_in(src, &mut buf, src_va)?;
        self.copy_out(dst, dst_va, &buf)
    }

    fn zero_fill(&self, dir: u32, va: u32, size: u32) -> Result<(), AddrSpaceError> {
        let mut pages = self.pages.lock().unwrap();
        for off in 0..size {
            let addr = va.checked_add(off).ok_or(AddrSpaceError::Unmapped)?;
            let key = (dir, Self::page_va(addr));
            let entry = pages
                .entry(key)
                .or_insert(([0u8; PAGESIZE as usize], PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER));
            entry.0[(addr & (PAGESIZE - 1)) as usize] = 0;
        }
        Ok(())
    }

    fn copy_out(&self, dir: u32, dst_va: u32, bytes: &[u8]) -> Result<(), AddrSpaceError> {
        let mut pages = self.pages.lock().unwrap();
        for (i, byte) in bytes.iter().enumerate() {
            let addr = dst_va.checked_add(i as u32).ok_or(AddrSpaceError::Unmapped)?;
            let (buf, perms) = pages
                .get_mut(&(dir, Self::page_va(addr)))
                .ok_or(AddrSpaceError::Unmapped)?;
            if !perms.contains(PteFlags::WRITABLE) {
                return Err(AddrSpaceError::BadPermissions);
            }
            buf[(addr & (PAGESIZE - 1)) as usize] = *byte;
        }
        Ok(())
    }

    fn copy_in(&self, dir: u32, out: &mut [u8], src_va: u32) -> Result<(), AddrSpaceError> {
        let pages = self.pages.lock().unwrap();
        for (i, slot) in out.iter_mut().enumerate() {
            let addr = src_va.checked_add(i as u32).ok_or(AddrSpaceError::Unmapped)?;
            let (buf, _) = pages
                .get(&(dir, Self::page_va(addr)))
                .ok_or(AddrSpaceError::Unmapped)?;
            *slot = buf[(addr & (PAGESIZE - 1)) as usize];
        }
        Ok(())
    }

    fn load(&self, _dir: u32) {}
}
