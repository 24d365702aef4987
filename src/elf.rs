//! Section-header ELF loader for the root process.
use bitflags::bitflags;
use scopeguard::guard;

use crate::error::ElfLoadError;
use crate::hal::{AddressSpace, PageAllocator, PteFlags};
use crate::memlayout::{in_user_window, page_round_down, PAGESIZE, VM_USERHI};
use crate::trapframe::{EflagsFlags, TrapFrame, USER_CODE_SELECTOR, USER_DATA_SELECTOR};

/// `"\x7fELF"` in little endian.
pub const ELF_MAGIC: u32 = 0x464c_457f;

/// File header, 32-bit section-header flavor (not the teacher's 64-bit
/// program-header `ElfHdr`: the system this core loads roots for links
/// section headers directly, per `kern/init.c`'s `read_elf`).
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct ElfHdr {
    pub magic: u32,
    pub elf: [u8; 12],
    pub typ: u16,
    pub machine: u16,
    pub version: u32,
    pub entry: u32,
    pub phoff: u32,
    pub shoff: u32,
    pub flags: u32,
    pub ehsize: u16,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

/// Section header.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct SectHdr {
    pub name: u32,
    pub typ: u32,
    pub flags: u32,
    pub addr: u32,
    pub offset: u32,
    pub size: u32,
    pub link: u32,
    pub info: u32,
    pub addralign: u32,
    pub entsize: u32,
}

pub const SHT_PROGBITS: u32 = 1;
pub const SHT_NOBITS: u32 = 8;

bitflags! {
    pub struct ShFlags: u32 {
        const WRITE = 1 << 0;
    }
}

const ELF_HDR_SIZE: usize = core::mem::size_of::<ElfHdr>();
const SECT_HDR_SIZE: usize = core::mem::size_of::<SectHdr>();

fn read_u16(image: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([image[off], image[off + 1]])
}

fn read_u32(image: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([image[off], image[off + 1], image[off + 2], image[off + 3]])
}

fn parse_elf_hdr(image: &[u8]) -> Result<ElfHdr, ElfLoadError> {
    if image.len() < ELF_HDR_SIZE {
        return Err(ElfLoadError::SectionOutOfBounds);
    }
    let magic = read_u32(image, 0);
    if magic != ELF_MAGIC {
        return Err(ElfLoadError::BadMagic);
    }
    let mut elf = [0u8; 12];
    elf.copy_from_slice(&image[4..16]);
    Ok(ElfHdr {
        magic,
        elf,
        typ: read_u16(image, 16),
        machine: read_u16(image, 18),
        version: read_u32(image, 20),
        entry: read_u32(image, 24),
        phoff: read_u32(image, 28),
        shoff: read_u32(image, 32),
        flags: read_u32(image, 36),
        ehsize: read_u16(image, 40),
        phentsize: read_u16(image, 42),
        phnum: read_u16(image, 44),
        shentsize: read_u16(image, 46),
        shnum: read_u16(image, 48),
        shstrndx: read_u16(image, 50),
    })
}

fn parse_sect_hdr(image: &[u8], off: usize) -> SectHdr {
    SectHdr {
        name: read_u32(image, off),
        typ: read_u32(image, off + 4),
        flags: read_u32(image, off + 8),
        addr: read_u32(image, off + 12),
        offset: read_u32(image, off + 16),
        size: read_u32(image, off + 20),
        link: read_u32(image, off + 24),
        info: read_u32(image, off + 28),
        addralign: read_u32(image, off + 32),
        entsize: read_u32(image, off + 36),
    }
}

fn section_headers(image: &[u8], hdr: &ElfHdr) -> Result<impl Iterator<Item = SectHdr> + '_, ElfLoadError> {
    let shoff = hdr.shoff as usize;
    let count = hdr.shnum as usize;
    let table_len = count
        .checked_mul(SECT_HDR_SIZE)
        .ok_or(ElfLoadError::SectionOutOfBounds)?;
    let table_end = shoff
        .checked_add(table_len)
        .ok_or(ElfLoadError::SectionOutOfBounds)?;
    if table_end > image.len() {
        return Err(ElfLoadError::SectionOutOfBounds);
    }
    Ok((0..count).map(move |i| parse_sect_hdr(image, shoff + i * SECT_HDR_SIZE)))
}

/// A loadable section: type `PROGBITS`/`NOBITS` with a non-zero load address.
fn is_loadable(sh: &SectHdr) -> bool {
    (sh.typ == SHT_PROGBITS || sh.typ == SHT_NOBITS) && sh.addr != 0
}

fn validate_range(addr: u32, size: u32) -> Result<(), ElfLoadError> {
    if !in_user_window(addr, size) {
        return Err(ElfLoadError::AddressOutOfWindow);
    }
    Ok(())
}

/// Builds the root process's address space from a statically linked ELF
/// image and returns the trap frame it should first run with.
///
/// `image` is the embedded root executable, `dir` the freshly allocated
/// address space to populate. Rejects a malformed image with
/// [`ElfLoadError`] rather than panicking the bootstrap CPU.
pub fn read_elf<D: Copy>(
    image: &[u8],
    addrspace: &impl AddressSpace<Dir = D>,
    page_allocator: &impl PageAllocator,
    dir: D,
) -> Result<TrapFrame, ElfLoadError> {
    addrspace.load(dir);

    let hdr = parse_elf_hdr(image)?;

    // Every pass below re-walks the section header table rather than
    // collecting it once: this core has no heap, so there is nowhere to
    // stash a filtered list between passes.

    // Pass 1: allocate and map a fresh page for every page the section covers.
    for sh in section_headers(image, &hdr)?.filter(is_loadable) {
        validate_range(sh.addr, sh.size)?;
        if sh.typ == SHT_PROGBITS {
            let file_end = (sh.offset as usize)
                .checked_add(sh.size as usize)
                .ok_or(ElfLoadError::SectionOutOfBounds)?;
            if file_end > image.len() {
                return Err(ElfLoadError::SectionOutOfBounds);
            }
        }
        let va_start = page_round_down(sh.addr);
        let va_end = page_round_down(sh.addr + sh.size.saturating_sub(1));
        let mut va = va_start;
        loop {
            let page = page_allocator
                .alloc_page()
                .expect("read_elf: out of physical pages");
            let page = guard(page, |p| page_allocator.free_page(p));
            addrspace
                .insert(dir, *page, va, PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER)
                .expect("read_elf: fresh mapping cannot fail");
            scopeguard::ScopeGuard::into_inner(page);
            if va == va_end {
                break;
            }
            va += PAGESIZE;
        }
    }

    // Pass 2: copy file contents (PROGBITS) or zero-fill (NOBITS).
    for sh in section_headers(image, &hdr)?.filter(is_loadable) {
        if sh.typ == SHT_PROGBITS {
            let start = sh.offset as usize;
            let end = start + sh.size as usize;
            addrspace
                .copy_out(dir, sh.addr, &image[start..end])
                .expect("read_elf: section page was just mapped");
        } else {
            addrspace
                .zero_fill(dir, sh.addr, sh.size)
                .expect("read_elf: section page was just mapped");
        }
    }

    // Pass 3: clear the writable bit on every page of a section without SHF_WRITE.
    for sh in section_headers(image, &hdr)?.filter(is_loadable) {
        if ShFlags::from_bits_truncate(sh.flags).contains(ShFlags::WRITE) {
            continue;
        }
        let va_start = page_round_down(sh.addr);
        let va_end = page_round_down(sh.addr + sh.size.saturating_sub(1));
        let mut va = va_start;
        loop {
            addrspace
                .set_writable(dir, va, false)
                .expect("read_elf: section page was just mapped");
            if va == va_end {
                break;
            }
            va += PAGESIZE;
        }
    }

    // User stack: one page just below VM_USERHI.
    let stack_va = VM_USERHI - PAGESIZE;
    let stack_page = page_allocator.alloc_page().expect("read_elf: out of physical pages");
    addrspace
        .insert(dir, stack_page, stack_va, PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER)
        .expect("read_elf: fresh stack mapping cannot fail");

    addrspace.load(dir);

    Ok(TrapFrame {
        eip: hdr.entry,
        esp: VM_USERHI - 1,
        eflags: EflagsFlags::IF.bits(),
        cs: USER_CODE_SELECTOR,
        ds: USER_DATA_SELECTOR,
        es: USER_DATA_SELECTOR,
        ss: USER_DATA_SELECTOR,
        ..Default::default()
    })
}
