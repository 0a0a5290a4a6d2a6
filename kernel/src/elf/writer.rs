//! ELF32 serializer — the AOT output path.
//!
//! Lays out an ET_EXEC/EM_386 file with one RX PT_LOAD for the code buffer
//! and, when present, one RW PT_LOAD for the data buffer. The loader in
//! this kernel (and any other sane ELF loader) reads it back.

use alloc::vec::Vec;

use super::{
    EHDR_SIZE, ELFCLASS32, ELFDATA2LSB, ELF_MAGIC, EM_386, ET_EXEC, PF_R, PF_W, PF_X, PHDR_SIZE,
    PT_LOAD,
};

fn push_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

struct PhdrSpec {
    offset: u32,
    vaddr: u32,
    filesz: u32,
    flags: u32,
}

/// Serialize code and data buffers into a complete ELF32 executable.
///
/// `entry` must point into the code segment; the loader enforces it on the
/// way back in.
pub fn write_exec(code: &[u8], code_base: u32, data: &[u8], data_base: u32, entry: u32) -> Vec<u8> {
    let phnum: u16 = if data.is_empty() { 1 } else { 2 };
    let headers_len = EHDR_SIZE + phnum as usize * PHDR_SIZE;
    // Keep segment file offsets 4-aligned; bases are page-aligned so the
    // p_align congruence (mod 4) holds.
    let code_off = (headers_len + 3) & !3;
    let data_off = (code_off + code.len() + 3) & !3;

    let mut out = Vec::with_capacity(data_off + data.len());

    // ELF header
    out.extend_from_slice(&ELF_MAGIC);
    out.push(ELFCLASS32);
    out.push(ELFDATA2LSB);
    out.push(1); // EV_CURRENT
    out.extend_from_slice(&[0u8; 9]); // OS ABI + padding
    push_u16(&mut out, ET_EXEC);
    push_u16(&mut out, EM_386);
    push_u32(&mut out, 1); // e_version
    push_u32(&mut out, entry);
    push_u32(&mut out, EHDR_SIZE as u32); // e_phoff
    push_u32(&mut out, 0); // e_shoff
    push_u32(&mut out, 0); // e_flags
    push_u16(&mut out, EHDR_SIZE as u16);
    push_u16(&mut out, PHDR_SIZE as u16);
    push_u16(&mut out, phnum);
    push_u16(&mut out, 0); // e_shentsize
    push_u16(&mut out, 0); // e_shnum
    push_u16(&mut out, 0); // e_shstrndx

    let mut specs = Vec::new();
    specs.push(PhdrSpec {
        offset: code_off as u32,
        vaddr: code_base,
        filesz: code.len() as u32,
        flags: PF_R | PF_X,
    });
    if !data.is_empty() {
        specs.push(PhdrSpec {
            offset: data_off as u32,
            vaddr: data_base,
            filesz: data.len() as u32,
            flags: PF_R | PF_W,
        });
    }

    for spec in &specs {
        push_u32(&mut out, PT_LOAD);
        push_u32(&mut out, spec.offset);
        push_u32(&mut out, spec.vaddr);
        push_u32(&mut out, spec.vaddr); // p_paddr mirrors p_vaddr
        push_u32(&mut out, spec.filesz);
        push_u32(&mut out, spec.filesz); // memsz == filesz; no BSS yet
        push_u32(&mut out, spec.flags);
        push_u32(&mut out, 4); // p_align
    }

    out.resize(code_off, 0);
    out.extend_from_slice(code);
    out.resize(data_off, 0);
    out.extend_from_slice(data);
    out
}

#[cfg(test)]
mod tests {
    use super::super::{parse, Elf32Header};
    use super::*;

    #[test]
    fn produced_header_fields_match_the_abi() {
        let image = write_exec(&[0xB8, 1, 0, 0, 0, 0xC3], 0x40_0000, b"Hi\n", 0x50_0000, 0x40_0000);
        let header = Elf32Header::parse(&image).unwrap();
        assert_eq!(header.e_machine, 3);
        assert_eq!(header.e_type, 2);
        assert_eq!(header.e_entry, 0x40_0000);
        assert_eq!(header.e_phnum, 2);
    }

    #[test]
    fn writer_output_parses_back_byte_identical_segments() {
        let code = [0x55u8, 0x89, 0xE5, 0xC9, 0xC3];
        let data = b"hello data";
        let image = write_exec(&code, 0x40_0000, data, 0x40_1000, 0x40_0000);

        let parsed = parse(&image).unwrap();
        assert_eq!(parsed.entry, 0x40_0000);
        assert_eq!(parsed.segments.len(), 2);
        assert_eq!(parsed.segments[0].data, &code);
        assert_eq!(parsed.segments[0].flags, PF_R | PF_X);
        assert_eq!(parsed.segments[1].data, data);
        assert_eq!(parsed.segments[1].flags, PF_R | PF_W);
    }

    #[test]
    fn dataless_program_gets_one_segment() {
        let image = write_exec(&[0xC3], 0x40_0000, &[], 0x50_0000, 0x40_0000);
        let parsed = parse(&image).unwrap();
        assert_eq!(parsed.segments.len(), 1);
    }

    #[test]
    fn entry_inside_code_segment_validates() {
        let code = [0x90u8; 32];
        let image = write_exec(&code, 0x40_0000, &[], 0, 0x40_0010);
        let parsed = parse(&image).unwrap();
        let seg = &parsed.segments[0];
        assert!(parsed.entry >= seg.vaddr && parsed.entry < seg.vaddr + seg.memsz);
    }

    #[test]
    fn serialization_is_deterministic() {
        let a = write_exec(&[1, 2, 3], 0x40_0000, &[4, 5], 0x40_1000, 0x40_0000);
        let b = write_exec(&[1, 2, 3], 0x40_0000, &[4, 5], 0x40_1000, 0x40_0000);
        assert_eq!(a, b);
    }
}
