//! ELF intake: translates loadable program headers into the `(vaddr,
//! filesz, memsz, rights, align, payload)` tuples `Memory::from_elf` wants.
//!
//! Only ELF class 32, little-endian is accepted, per the spec's ELF intake
//! rule. Non-`PT_LOAD` headers are ignored.

use crate::error::{ElfError, Rights};
use crate::memory::{Memory, DEFAULT_ALIGN};
use elf::abi::PT_LOAD;
use elf::endian::LittleEndian;
use elf::file::Class;
use elf::ElfBytes;

fn translate_flags(p_flags: u32) -> Rights {
    // ELF program-header flag bits: PF_X=1, PF_W=2, PF_R=4 — note this is a
    // different bit assignment than this crate's own Rights (R=1, W=2, X=4).
    let mut rights = Rights::NONE;
    if p_flags & 0x4 != 0 {
        rights = rights.union(Rights::R);
    }
    if p_flags & 0x2 != 0 {
        rights = rights.union(Rights::W);
    }
    if p_flags & 0x1 != 0 {
        rights = rights.union(Rights::X);
    }
    rights
}

/// Parse `bytes` as an ELF32 little-endian file and build memory from its
/// loadable program headers. Returns the memory image and the entry point.
///
/// The `LittleEndian` type parameter commits the parse to little-endian
/// decoding; a big-endian file fails here rather than needing a separate
/// runtime check.
pub fn load(bytes: &[u8]) -> Result<(Memory, u32), ElfError> {
    let file = ElfBytes::<LittleEndian>::minimal_parse(bytes)
        .map_err(|e| ElfError::Parse(e.to_string()))?;

    if file.ehdr.class != Class::ELF32 {
        return Err(ElfError::UnsupportedClassOrEndian);
    }

    let headers = file
        .segments()
        .ok_or(ElfError::NoLoadableSegments)?;

    let mut loadable: Vec<(u32, u32, u32, Rights, u32, Vec<u8>)> = Vec::new();
    for header in headers.iter() {
        if header.p_type != PT_LOAD {
            continue;
        }
        let rights = translate_flags(header.p_flags);
        let align = if header.p_align == 0 {
            DEFAULT_ALIGN
        } else {
            header.p_align as u32
        };
        let start = header.p_offset as usize;
        let end = start + header.p_filesz as usize;
        let payload = bytes[start..end].to_vec();
        loadable.push((
            header.p_vaddr as u32,
            header.p_filesz as u32,
            header.p_memsz as u32,
            rights,
            align,
            payload,
        ));
    }

    if loadable.is_empty() {
        return Err(ElfError::NoLoadableSegments);
    }

    let segments_for_memory: Vec<_> = loadable
        .iter()
        .map(|(vaddr, filesz, memsz, rights, align, payload)| {
            (*vaddr, *filesz, *memsz, *rights, *align, payload.as_slice())
        })
        .collect();

    let memory = Memory::from_elf(segments_for_memory)?;
    let entry = file.ehdr.e_entry as u32;
    Ok((memory, entry))
}
