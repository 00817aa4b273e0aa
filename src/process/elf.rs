//! ELF64 loader: header validation and segment placement.
//!
//! Reads headers straight through the caller's `IoRef` with `readat`; no
//! whole-file buffering. Segment data lands directly at its mapped virtual
//! address, which only works because the mspace being built is already the
//! active one when `load` runs (`process::exec_with_io` resets and starts
//! mapping into it before calling here).

use crate::arch::riscv64::sv39::{PteFlags, PAGE_SIZE};
use crate::io::IoRef;
use crate::lib::error::{KernelError, KResult};
use crate::mm::pagetable;
use crate::mm::{UMEM_END_VMA, UMEM_START_VMA};

const EI_NIDENT: usize = 16;
const ELFMAG: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_RISCV: u16 = 243;
const PT_LOAD: u32 = 1;

const PF_X: u32 = 1 << 0;
const PF_W: u32 = 1 << 1;
const PF_R: u32 = 1 << 2;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct Elf64Ehdr {
    e_ident: [u8; EI_NIDENT],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u64,
    e_phoff: u64,
    e_shoff: u64,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

const EHDR_SIZE: usize = core::mem::size_of::<Elf64Ehdr>();

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct Elf64Phdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

const PHDR_SIZE: usize = core::mem::size_of::<Elf64Phdr>();

fn read_exact(io: &IoRef, pos: u64, buf: &mut [u8]) -> KResult<()> {
    let n = io.readat(pos, buf)?;
    if n != buf.len() {
        return Err(KernelError::BadFormat);
    }
    Ok(())
}

fn read_ehdr(io: &IoRef) -> KResult<Elf64Ehdr> {
    let mut buf = [0u8; EHDR_SIZE];
    read_exact(io, 0, &mut buf)?;
    let mut h = Elf64Ehdr::default();
    h.e_ident.copy_from_slice(&buf[0..EI_NIDENT]);
    h.e_type = u16::from_le_bytes(buf[16..18].try_into().unwrap());
    h.e_machine = u16::from_le_bytes(buf[18..20].try_into().unwrap());
    h.e_version = u32::from_le_bytes(buf[20..24].try_into().unwrap());
    h.e_entry = u64::from_le_bytes(buf[24..32].try_into().unwrap());
    h.e_phoff = u64::from_le_bytes(buf[32..40].try_into().unwrap());
    h.e_shoff = u64::from_le_bytes(buf[40..48].try_into().unwrap());
    h.e_flags = u32::from_le_bytes(buf[48..52].try_into().unwrap());
    h.e_ehsize = u16::from_le_bytes(buf[52..54].try_into().unwrap());
    h.e_phentsize = u16::from_le_bytes(buf[54..56].try_into().unwrap());
    h.e_phnum = u16::from_le_bytes(buf[56..58].try_into().unwrap());
    h.e_shentsize = u16::from_le_bytes(buf[58..60].try_into().unwrap());
    h.e_shnum = u16::from_le_bytes(buf[60..62].try_into().unwrap());
    h.e_shstrndx = u16::from_le_bytes(buf[62..64].try_into().unwrap());

    if h.e_ident[0..4] != ELFMAG {
        return Err(KernelError::BadFormat);
    }
    if h.e_ident[4] != ELFCLASS64 || h.e_ident[5] != ELFDATA2LSB {
        return Err(KernelError::BadFormat);
    }
    if h.e_machine != EM_RISCV || h.e_type != ET_EXEC {
        return Err(KernelError::BadFormat);
    }
    Ok(h)
}

fn read_phdr(io: &IoRef, ehdr: &Elf64Ehdr, index: u16) -> KResult<Elf64Phdr> {
    let mut buf = [0u8; PHDR_SIZE];
    let pos = ehdr.e_phoff + index as u64 * ehdr.e_phentsize as u64;
    read_exact(io, pos, &mut buf)?;
    Ok(Elf64Phdr {
        p_type: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
        p_flags: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
        p_offset: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
        p_vaddr: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
        p_paddr: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
        p_filesz: u64::from_le_bytes(buf[32..40].try_into().unwrap()),
        p_memsz: u64::from_le_bytes(buf[40..48].try_into().unwrap()),
        p_align: u64::from_le_bytes(buf[48..56].try_into().unwrap()),
    })
}

fn segment_flags(p_flags: u32) -> PteFlags {
    let mut flags = PteFlags::U;
    if p_flags & PF_R != 0 {
        flags |= PteFlags::R;
    }
    if p_flags & PF_W != 0 {
        flags |= PteFlags::W;
    }
    if p_flags & PF_X != 0 {
        flags |= PteFlags::X;
    }
    flags
}

const READ_CHUNK: usize = 512;

/// Load every `PT_LOAD` segment of the ELF at `io` into the active mspace
/// and return the entry address. The caller has already mapped
/// the user stack and reset the address space; this only ever adds mappings
/// disjoint from the stack page at `UMEM_END_VMA - PAGE_SIZE`.
pub fn load(io: &IoRef) -> KResult<usize> {
    let ehdr = read_ehdr(io)?;

    for i in 0..ehdr.e_phnum {
        let ph = read_phdr(io, &ehdr, i)?;
        if ph.p_type != PT_LOAD {
            continue;
        }

        let vaddr = ph.p_vaddr as usize;
        let memsz = ph.p_memsz as usize;
        let page_start = vaddr & !(PAGE_SIZE - 1);
        let page_end = (vaddr + memsz + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        if page_start < UMEM_START_VMA || page_end > UMEM_END_VMA || page_end <= page_start {
            return Err(KernelError::AccessViolation);
        }

        pagetable::alloc_and_map_range(
            page_start,
            page_end - page_start,
            PteFlags::R | PteFlags::W | PteFlags::U,
        )?;

        let filesz = ph.p_filesz as usize;
        let mut done = 0usize;
        let mut chunk = [0u8; READ_CHUNK];
        while done < filesz {
            let want = (filesz - done).min(READ_CHUNK);
            read_exact(io, ph.p_offset + done as u64, &mut chunk[..want])?;
            unsafe {
                core::ptr::copy_nonoverlapping(chunk.as_ptr(), (vaddr + done) as *mut u8, want);
            }
            done += want;
        }
        if memsz > filesz {
            unsafe {
                core::ptr::write_bytes((vaddr + filesz) as *mut u8, 0, memsz - filesz);
            }
        }

        pagetable::set_range_flags(page_start, page_end - page_start, segment_flags(ph.p_flags));
    }

    Ok(ehdr.e_entry as usize)
}
