//! ELF32 executable images.
//!
//! The loader side parses and validates ET_EXEC/EM_386 images; the
//! [`writer`] side serializes the JIT's code/data buffers into the same
//! format. Parsing is pure slice inspection so the whole pipeline is
//! testable off-target.

pub mod writer;

use alloc::vec::Vec;

use crate::error::ElfError;

pub const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
pub const ELFCLASS32: u8 = 1;
pub const ELFDATA2LSB: u8 = 1;
pub const ET_EXEC: u16 = 2;
pub const EM_386: u16 = 3;
pub const PT_LOAD: u32 = 1;

pub const PF_X: u32 = 1;
pub const PF_W: u32 = 2;
pub const PF_R: u32 = 4;

pub const EHDR_SIZE: usize = 52;
pub const PHDR_SIZE: usize = 32;

/// ELF32 file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Elf32Header {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u32,
    pub e_phoff: u32,
    pub e_shoff: u32,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

/// ELF32 program header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Elf32ProgramHeader {
    pub p_type: u32,
    pub p_offset: u32,
    pub p_vaddr: u32,
    pub p_paddr: u32,
    pub p_filesz: u32,
    pub p_memsz: u32,
    pub p_flags: u32,
    pub p_align: u32,
}

fn u16_at(data: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([data[off], data[off + 1]])
}

fn u32_at(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

impl Elf32Header {
    /// Decode and validate the fixed 52-byte header.
    pub fn parse(data: &[u8]) -> Result<Self, ElfError> {
        if data.len() < EHDR_SIZE {
            return Err(ElfError::Truncated);
        }
        let mut e_ident = [0u8; 16];
        e_ident.copy_from_slice(&data[..16]);

        if e_ident[..4] != ELF_MAGIC {
            return Err(ElfError::BadMagic);
        }
        if e_ident[4] != ELFCLASS32 {
            return Err(ElfError::NotElf32);
        }
        if e_ident[5] != ELFDATA2LSB {
            return Err(ElfError::NotLittleEndian);
        }

        let header = Self {
            e_ident,
            e_type: u16_at(data, 16),
            e_machine: u16_at(data, 18),
            e_version: u32_at(data, 20),
            e_entry: u32_at(data, 24),
            e_phoff: u32_at(data, 28),
            e_shoff: u32_at(data, 32),
            e_flags: u32_at(data, 36),
            e_ehsize: u16_at(data, 40),
            e_phentsize: u16_at(data, 42),
            e_phnum: u16_at(data, 44),
            e_shentsize: u16_at(data, 46),
            e_shnum: u16_at(data, 48),
            e_shstrndx: u16_at(data, 50),
        };

        if header.e_type != ET_EXEC {
            return Err(ElfError::NotExecutable);
        }
        if header.e_machine != EM_386 {
            return Err(ElfError::WrongMachine);
        }
        Ok(header)
    }
}

impl Elf32ProgramHeader {
    pub fn parse(data: &[u8], off: usize) -> Result<Self, ElfError> {
        if data.len() < off + PHDR_SIZE {
            return Err(ElfError::Truncated);
        }
        Ok(Self {
            p_type: u32_at(data, off),
            p_offset: u32_at(data, off + 4),
            p_vaddr: u32_at(data, off + 8),
            p_paddr: u32_at(data, off + 12),
            p_filesz: u32_at(data, off + 16),
            p_memsz: u32_at(data, off + 20),
            p_flags: u32_at(data, off + 24),
            p_align: u32_at(data, off + 28),
        })
    }
}

/// One loadable segment, borrowing its file bytes.
#[derive(Debug, Clone, Copy)]
pub struct Segment<'a> {
    pub vaddr: u32,
    pub memsz: u32,
    pub flags: u32,
    pub data: &'a [u8],
}

/// A validated executable image.
#[derive(Debug)]
pub struct Image<'a> {
    pub entry: u32,
    pub segments: Vec<Segment<'a>>,
}

impl<'a> Image<'a> {
    /// Lowest load address.
    pub fn base(&self) -> u32 {
        self.segments.iter().map(|s| s.vaddr).min().unwrap_or(0)
    }

    /// Bytes from base to the end of the highest segment.
    pub fn size(&self) -> u32 {
        let end = self
            .segments
            .iter()
            .map(|s| s.vaddr + s.memsz)
            .max()
            .unwrap_or(0);
        end - self.base()
    }
}

/// Parse and fully validate an ET_EXEC image: magic, class, byte order,
/// machine, at least one PT_LOAD, segment bytes inside the file, and an
/// entry point inside a loaded segment.
pub fn parse(data: &[u8]) -> Result<Image<'_>, ElfError> {
    let header = Elf32Header::parse(data)?;

    let mut segments = Vec::new();
    for i in 0..header.e_phnum as usize {
        let off = header.e_phoff as usize + i * header.e_phentsize.max(PHDR_SIZE as u16) as usize;
        let ph = Elf32ProgramHeader::parse(data, off)?;
        if ph.p_type != PT_LOAD {
            continue;
        }
        if ph.p_filesz > ph.p_memsz {
            return Err(ElfError::Truncated);
        }
        let file_start = ph.p_offset as usize;
        let file_end = file_start + ph.p_filesz as usize;
        if file_end > data.len() {
            return Err(ElfError::Truncated);
        }
        segments.push(Segment {
            vaddr: ph.p_vaddr,
            memsz: ph.p_memsz,
            flags: ph.p_flags,
            data: &data[file_start..file_end],
        });
    }

    if segments.is_empty() {
        return Err(ElfError::NoLoadSegments);
    }
    let entry_ok = segments
        .iter()
        .any(|s| header.e_entry >= s.vaddr && header.e_entry < s.vaddr + s.memsz.max(1));
    if !entry_ok {
        return Err(ElfError::EntryOutsideImage);
    }

    Ok(Image {
        entry: header.e_entry,
        segments,
    })
}
