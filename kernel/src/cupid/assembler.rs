//! CupidASM: a single-pass Intel-syntax i386 assembler.
//!
//! Each line is tokenized into mnemonic + operands and encoded directly
//! into the shared [`CodeGen`] buffers. Forward references become patch
//! records; `.local` labels scope under the most recent plain label.
//! Sections: `.text` (code), `.data` (initialized bytes), `.bss`
//! (zero-filled reservations, materialized into the data image).

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

use super::{CodeGen, CompileError, PatchKind, Program, AOT_CODE_BASE, AOT_DATA_BASE};

/// Operand width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Size {
    Byte,
    Word,
    Dword,
}

/// A parsed memory operand: `[base + index*scale + disp]`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
struct MemRef {
    base: Option<u8>,
    index: Option<(u8, u8)>, // (register, scale)
    disp: i32,
    disp_label: Option<String>,
    size: Option<Size>,
}

/// A parsed operand.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Operand {
    Reg32(u8),
    Reg16(u8),
    Reg8(u8),
    Imm(i64),
    Label(String),
    Mem(MemRef),
}

fn reg32(name: &str) -> Option<u8> {
    Some(match name {
        "eax" => 0,
        "ecx" => 1,
        "edx" => 2,
        "ebx" => 3,
        "esp" => 4,
        "ebp" => 5,
        "esi" => 6,
        "edi" => 7,
        _ => return None,
    })
}

fn reg16(name: &str) -> Option<u8> {
    Some(match name {
        "ax" => 0,
        "cx" => 1,
        "dx" => 2,
        "bx" => 3,
        "sp" => 4,
        "bp" => 5,
        "si" => 6,
        "di" => 7,
        _ => return None,
    })
}

fn reg8(name: &str) -> Option<u8> {
    Some(match name {
        "al" => 0,
        "cl" => 1,
        "dl" => 2,
        "bl" => 3,
        "ah" => 4,
        "ch" => 5,
        "dh" => 6,
        "bh" => 7,
        _ => return None,
    })
}

/// Condition-code nibble for `j<cc>`/`set<cc>`.
fn cond_code(cc: &str) -> Option<u8> {
    Some(match cc {
        "o" => 0x0,
        "no" => 0x1,
        "b" | "c" | "nae" => 0x2,
        "ae" | "nb" | "nc" => 0x3,
        "e" | "z" => 0x4,
        "ne" | "nz" => 0x5,
        "be" | "na" => 0x6,
        "a" | "nbe" => 0x7,
        "s" => 0x8,
        "ns" => 0x9,
        "l" | "nge" => 0xC,
        "ge" | "nl" => 0xD,
        "le" | "ng" => 0xE,
        "g" | "nle" => 0xF,
        _ => return None,
    })
}

fn parse_number(text: &str) -> Option<i64> {
    let text = text.trim();
    if let Some(rest) = text.strip_prefix('-') {
        return parse_number(rest).map(|v| -v);
    }
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16).ok();
    }
    if text.len() == 3 && text.starts_with('\'') && text.ends_with('\'') {
        return Some(text.as_bytes()[1] as i64);
    }
    if text.chars().all(|c| c.is_ascii_digit()) && !text.is_empty() {
        return text.parse().ok();
    }
    None
}

fn is_ident(text: &str) -> bool {
    !text.is_empty()
        && text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        && !text.starts_with(|c: char| c.is_ascii_digit())
}

/// Split a line's operand field on top-level commas (quotes protected).
fn split_operands(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quote = false;
    for (i, ch) in text.char_indices() {
        match ch {
            '"' | '\'' => in_quote = !in_quote,
            ',' if !in_quote => {
                parts.push(text[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    let last = text[start..].trim();
    if !last.is_empty() {
        parts.push(last);
    }
    parts
}

/// Strip a `;` comment, respecting quotes.
fn strip_comment(line: &str) -> &str {
    let mut in_quote = false;
    for (i, ch) in line.char_indices() {
        match ch {
            '"' | '\'' => in_quote = !in_quote,
            ';' if !in_quote => return &line[..i],
            _ => {}
        }
    }
    line
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Text,
    Data,
    Bss,
}

pub struct Assembler<'cg> {
    cg: &'cg mut CodeGen,
    section: Section,
    /// Most recent non-local label; `.foo` resolves as `parent.foo`.
    scope: String,
    /// Extra prefix for inline-asm invocations so block-local labels do
    /// not collide across blocks.
    prefix: String,
}

impl<'cg> Assembler<'cg> {
    pub fn new(cg: &'cg mut CodeGen) -> Self {
        Self {
            cg,
            section: Section::Text,
            scope: String::new(),
            prefix: String::new(),
        }
    }

    /// Assembler for an inline `asm { }` block: labels get a unique prefix
    /// and the surrounding function becomes the local-label scope.
    pub fn for_inline(cg: &'cg mut CodeGen, prefix: &str) -> Self {
        Self {
            cg,
            section: Section::Text,
            scope: String::from(prefix),
            prefix: format!("{}$", prefix),
        }
    }

    fn qualify(&self, name: &str) -> String {
        if let Some(local) = name.strip_prefix('.') {
            format!("{}.{}", self.scope, local)
        } else if self.prefix.is_empty() || self.cg.lookup(name).is_some() {
            // Global or already-known symbol (kernel binding, function).
            String::from(name)
        } else {
            format!("{}{}", self.prefix, name)
        }
    }

    /// Assemble a whole source text. `first_line` biases error line
    /// numbers for inline blocks.
    pub fn assemble(&mut self, src: &str, first_line: u32) -> Result<(), CompileError> {
        for (i, raw_line) in src.lines().enumerate() {
            let line_no = first_line + i as u32;
            self.assemble_line(raw_line, line_no)?;
        }
        Ok(())
    }

    fn assemble_line(&mut self, raw_line: &str, line_no: u32) -> Result<(), CompileError> {
        let mut text = strip_comment(raw_line).trim();

        // Label definitions, possibly stacked before an instruction.
        while let Some(colon) = text.find(':') {
            let candidate = text[..colon].trim();
            if !is_ident(candidate) {
                break;
            }
            let qualified = self.qualify(candidate);
            if !candidate.starts_with('.') {
                self.scope = qualified.clone();
            }
            match self.section {
                Section::Text => self.cg.define_code_label(&qualified, line_no)?,
                Section::Data | Section::Bss => {
                    let addr = self.cg.data_here();
                    self.cg.define_symbol(&qualified, addr, line_no)?;
                }
            }
            text = text[colon + 1..].trim();
        }
        if text.is_empty() {
            return Ok(());
        }

        let (mnemonic, rest) = match text.find(char::is_whitespace) {
            Some(pos) => (&text[..pos], text[pos..].trim()),
            None => (text, ""),
        };
        let mnemonic_lower = mnemonic.to_ascii_lowercase();

        match mnemonic_lower.as_str() {
            "section" => {
                self.section = match rest {
                    ".text" => Section::Text,
                    ".data" => Section::Data,
                    ".bss" => Section::Bss,
                    other => {
                        return Err(CompileError::new(
                            line_no,
                            format!("unknown section '{}'", other),
                        ))
                    }
                };
                Ok(())
            }
            ".text" => {
                self.section = Section::Text;
                Ok(())
            }
            ".data" => {
                self.section = Section::Data;
                Ok(())
            }
            ".bss" => {
                self.section = Section::Bss;
                Ok(())
            }
            "global" | "extern" => Ok(()), // accepted for NASM compatibility
            "db" | ".byte" => self.data_bytes(rest, 1, line_no),
            "dw" | ".word" => self.data_bytes(rest, 2, line_no),
            "dd" | ".long" => self.data_bytes(rest, 4, line_no),
            "resb" => self.reserve(rest, 1, line_no),
            "resw" => self.reserve(rest, 2, line_no),
            "resd" => self.reserve(rest, 4, line_no),
            "times" => self.times(rest, line_no),
            _ => {
                if self.section != Section::Text {
                    return Err(CompileError::new(
                        line_no,
                        format!("instruction '{}' outside .text", mnemonic_lower),
                    ));
                }

                // "jmp short label" / "j<cc> short label": rel8 encoding,
                // range-verified at resolve time.
                if let Some(target) = rest.strip_prefix("short ").map(str::trim) {
                    if is_ident(target) {
                        let name = self.qualify(target);
                        if mnemonic_lower == "jmp" {
                            self.cg.emit_u8(0xEB)?;
                            return self.cg.reference(&name, PatchKind::Rel8, line_no);
                        }
                        if let Some(cc) = mnemonic_lower.strip_prefix('j').and_then(cond_code) {
                            self.cg.emit_u8(0x70 + cc)?;
                            return self.cg.reference(&name, PatchKind::Rel8, line_no);
                        }
                    }
                }

                let operands = split_operands(rest)
                    .into_iter()
                    .map(|o| self.parse_operand(o, line_no))
                    .collect::<Result<Vec<_>, _>>()?;
                self.encode(&mnemonic_lower, &operands, line_no)
            }
        }
    }

    // -- data directives --------------------------------------------------

    fn data_bytes(&mut self, rest: &str, width: usize, line_no: u32) -> Result<(), CompileError> {
        if self.section == Section::Text {
            return Err(CompileError::new(line_no, "data directive inside .text"));
        }
        for item in split_operands(rest) {
            if item.starts_with('"') && item.ends_with('"') && item.len() >= 2 {
                if width != 1 {
                    return Err(CompileError::new(line_no, "string needs db"));
                }
                self.cg.emit_data(item[1..item.len() - 1].as_bytes())?;
            } else if let Some(value) = parse_number(item) {
                let bytes = (value as u32).to_le_bytes();
                self.cg.emit_data(&bytes[..width])?;
            } else if is_ident(item) && width == 4 {
                let name = self.qualify(item);
                self.cg.reference_data(&name, line_no)?;
            } else {
                return Err(CompileError::new(
                    line_no,
                    format!("bad data operand '{}'", item),
                ));
            }
        }
        Ok(())
    }

    fn reserve(&mut self, rest: &str, width: usize, line_no: u32) -> Result<(), CompileError> {
        let count = parse_number(rest)
            .ok_or_else(|| CompileError::new(line_no, "res* needs a count"))?;
        if count < 0 {
            return Err(CompileError::new(line_no, "negative reservation"));
        }
        for _ in 0..count as usize * width {
            self.cg.emit_data(&[0])?;
        }
        Ok(())
    }

    fn times(&mut self, rest: &str, line_no: u32) -> Result<(), CompileError> {
        let (count_text, inner) = match rest.find(char::is_whitespace) {
            Some(pos) => (&rest[..pos], rest[pos..].trim()),
            None => return Err(CompileError::new(line_no, "times needs a directive")),
        };
        let count = parse_number(count_text)
            .ok_or_else(|| CompileError::new(line_no, "times needs a count"))?;
        for _ in 0..count.max(0) {
            self.assemble_line(inner, line_no)?;
        }
        Ok(())
    }

    // -- operand parsing --------------------------------------------------

    fn parse_operand(&mut self, text: &str, line_no: u32) -> Result<Operand, CompileError> {
        let text = text.trim();

        // Size hints: byte/word/dword [ptr] [..]
        for (kw, size) in [
            ("byte", Size::Byte),
            ("word", Size::Word),
            ("dword", Size::Dword),
        ] {
            if let Some(rest) = text.strip_prefix(kw) {
                let rest = rest.trim_start();
                let rest = rest.strip_prefix("ptr").map(str::trim_start).unwrap_or(rest);
                if rest.starts_with('[') {
                    if let Operand::Mem(mut mem) = self.parse_operand(rest, line_no)? {
                        mem.size = Some(size);
                        return Ok(Operand::Mem(mem));
                    }
                }
            }
        }

        if let Some(r) = reg32(text) {
            return Ok(Operand::Reg32(r));
        }
        if let Some(r) = reg16(text) {
            return Ok(Operand::Reg16(r));
        }
        if let Some(r) = reg8(text) {
            return Ok(Operand::Reg8(r));
        }
        if let Some(value) = parse_number(text) {
            return Ok(Operand::Imm(value));
        }
        if text.starts_with('[') && text.ends_with(']') {
            return self.parse_mem(&text[1..text.len() - 1], line_no);
        }
        if is_ident(text) {
            return Ok(Operand::Label(self.qualify(text)));
        }
        Err(CompileError::new(
            line_no,
            format!("cannot parse operand '{}'", text),
        ))
    }

    fn parse_mem(&mut self, inner: &str, line_no: u32) -> Result<Operand, CompileError> {
        let mut mem = MemRef::default();

        // Split on +/-, keeping the sign with each term.
        let mut terms: Vec<(i32, String)> = Vec::new();
        let mut sign = 1i32;
        let mut cur = String::new();
        for ch in inner.chars() {
            match ch {
                '+' | '-' => {
                    if !cur.trim().is_empty() {
                        terms.push((sign, cur.trim().into()));
                    }
                    cur = String::new();
                    sign = if ch == '-' { -1 } else { 1 };
                }
                _ => cur.push(ch),
            }
        }
        if !cur.trim().is_empty() {
            terms.push((sign, cur.trim().into()));
        }

        for (sign, term) in terms {
            if let Some((reg_text, scale_text)) = term.split_once('*') {
                let reg = reg32(reg_text.trim()).ok_or_else(|| {
                    CompileError::new(line_no, format!("bad index register '{}'", reg_text))
                })?;
                let scale = parse_number(scale_text.trim())
                    .filter(|s| matches!(s, 1 | 2 | 4 | 8))
                    .ok_or_else(|| CompileError::new(line_no, "scale must be 1/2/4/8"))?;
                if mem.index.is_some() || sign < 0 {
                    return Err(CompileError::new(line_no, "bad index expression"));
                }
                mem.index = Some((reg, scale as u8));
            } else if let Some(reg) = reg32(&term) {
                if sign < 0 {
                    return Err(CompileError::new(line_no, "cannot subtract a register"));
                }
                if mem.base.is_none() {
                    mem.base = Some(reg);
                } else if mem.index.is_none() {
                    mem.index = Some((reg, 1));
                } else {
                    return Err(CompileError::new(line_no, "too many registers in address"));
                }
            } else if let Some(value) = parse_number(&term) {
                mem.disp = mem.disp.wrapping_add(sign.wrapping_mul(value as i32));
            } else if is_ident(&term) {
                if mem.disp_label.is_some() || sign < 0 {
                    return Err(CompileError::new(line_no, "bad symbol in address"));
                }
                mem.disp_label = Some(self.qualify(&term));
            } else {
                return Err(CompileError::new(
                    line_no,
                    format!("bad address term '{}'", term),
                ));
            }
        }
        Ok(Operand::Mem(mem))
    }

    // -- ModRM/SIB --------------------------------------------------------

    /// Emit ModRM (+SIB, +disp) addressing `mem` with `reg` in the reg
    /// field.
    fn emit_modrm_mem(&mut self, reg: u8, mem: &MemRef, line_no: u32) -> Result<(), CompileError> {
        if mem.disp_label.is_some() && (mem.base.is_some() || mem.index.is_some()) {
            return Err(CompileError::new(
                line_no,
                "symbol addressing cannot mix with registers",
            ));
        }

        match (mem.base, mem.index) {
            (None, None) => {
                // [disp32] / [symbol]
                self.cg.emit_u8(modrm(0, reg, 5))?;
                match &mem.disp_label {
                    Some(label) => self.cg.reference(label, PatchKind::Abs32, line_no)?,
                    None => self.cg.emit_u32(mem.disp as u32)?,
                }
            }
            (Some(base), None) if base != 4 => {
                // [base (+disp)]
                if mem.disp == 0 && base != 5 {
                    self.cg.emit_u8(modrm(0, reg, base))?;
                } else if (-128..=127).contains(&mem.disp) {
                    self.cg.emit_u8(modrm(1, reg, base))?;
                    self.cg.emit_u8(mem.disp as i8 as u8)?;
                } else {
                    self.cg.emit_u8(modrm(2, reg, base))?;
                    self.cg.emit_u32(mem.disp as u32)?;
                }
            }
            (base, index) => {
                // SIB forms: esp base, or an index register.
                let (index_reg, scale) = match index {
                    Some((r, s)) => {
                        if r == 4 {
                            return Err(CompileError::new(line_no, "esp cannot be an index"));
                        }
                        (r, s)
                    }
                    None => (4, 1), // "no index" encoding
                };
                let scale_bits = match scale {
                    1 => 0,
                    2 => 1,
                    4 => 2,
                    8 => 3,
                    _ => unreachable!("scale validated at parse"),
                };
                match base {
                    Some(b) => {
                        if mem.disp == 0 && b != 5 {
                            self.cg.emit_u8(modrm(0, reg, 4))?;
                            self.cg.emit_u8(sib(scale_bits, index_reg, b))?;
                        } else if (-128..=127).contains(&mem.disp) {
                            self.cg.emit_u8(modrm(1, reg, 4))?;
                            self.cg.emit_u8(sib(scale_bits, index_reg, b))?;
                            self.cg.emit_u8(mem.disp as i8 as u8)?;
                        } else {
                            self.cg.emit_u8(modrm(2, reg, 4))?;
                            self.cg.emit_u8(sib(scale_bits, index_reg, b))?;
                            self.cg.emit_u32(mem.disp as u32)?;
                        }
                    }
                    None => {
                        // [index*scale + disp32]
                        self.cg.emit_u8(modrm(0, reg, 4))?;
                        self.cg.emit_u8(sib(scale_bits, index_reg, 5))?;
                        self.cg.emit_u32(mem.disp as u32)?;
                    }
                }
            }
        }
        Ok(())
    }

    // -- instruction encoding ---------------------------------------------

    fn encode(
        &mut self,
        mnemonic: &str,
        operands: &[Operand],
        line_no: u32,
    ) -> Result<(), CompileError> {
        use Operand::*;

        let err = |msg: &str| CompileError::new(line_no, format!("{}: {}", mnemonic, msg));

        // ALU group sharing one encoding pattern.
        let alu: Option<(u8, u8)> = match mnemonic {
            "add" => Some((0x00, 0)),
            "or" => Some((0x08, 1)),
            "adc" => Some((0x10, 2)),
            "sbb" => Some((0x18, 3)),
            "and" => Some((0x20, 4)),
            "sub" => Some((0x28, 5)),
            "xor" => Some((0x30, 6)),
            "cmp" => Some((0x38, 7)),
            _ => None,
        };
        if let Some((base, digit)) = alu {
            return match operands {
                [Reg32(dst), Reg32(src)] => {
                    self.cg.emit(&[base + 0x01, modrm(3, *src, *dst)])
                }
                [Reg8(dst), Reg8(src)] => self.cg.emit(&[base, modrm(3, *src, *dst)]),
                [Reg32(dst), Imm(v)] => {
                    if (-128..=127).contains(v) {
                        self.cg.emit(&[0x83, modrm(3, digit, *dst)])?;
                        self.cg.emit_u8(*v as i8 as u8)
                    } else {
                        self.cg.emit(&[0x81, modrm(3, digit, *dst)])?;
                        self.cg.emit_u32(*v as u32)
                    }
                }
                [Reg32(dst), Mem(mem)] => {
                    self.cg.emit_u8(base + 0x03)?;
                    self.emit_modrm_mem(*dst, mem, line_no)
                }
                [Mem(mem), Reg32(src)] => {
                    self.cg.emit_u8(base + 0x01)?;
                    self.emit_modrm_mem(*src, mem, line_no)
                }
                [Mem(mem), Imm(v)] => match mem.size {
                    Some(Size::Byte) => {
                        self.cg.emit_u8(0x80)?;
                        self.emit_modrm_mem(digit, mem, line_no)?;
                        self.cg.emit_u8(*v as u8)
                    }
                    _ => {
                        self.cg.emit_u8(0x81)?;
                        self.emit_modrm_mem(digit, mem, line_no)?;
                        self.cg.emit_u32(*v as u32)
                    }
                },
                _ => Err(err("unsupported operand combination")),
            };
        }

        // Shift group.
        let shift: Option<u8> = match mnemonic {
            "shl" | "sal" => Some(4),
            "shr" => Some(5),
            "sar" => Some(7),
            _ => None,
        };
        if let Some(digit) = shift {
            return match operands {
                [Reg32(r), Imm(1)] => self.cg.emit(&[0xD1, modrm(3, digit, *r)]),
                [Reg32(r), Imm(v)] => {
                    self.cg.emit(&[0xC1, modrm(3, digit, *r)])?;
                    self.cg.emit_u8(*v as u8)
                }
                [Reg32(r), Reg8(1)] => self.cg.emit(&[0xD3, modrm(3, digit, *r)]), // cl
                _ => Err(err("unsupported operand combination")),
            };
        }

        // Conditional jumps / setcc.
        if let Some(cc) = mnemonic.strip_prefix('j').and_then(cond_code) {
            return match operands {
                [Label(name)] => {
                    self.cg.emit(&[0x0F, 0x80 + cc])?;
                    self.cg.reference(name, PatchKind::Rel32, line_no)
                }
                _ => Err(err("needs a label")),
            };
        }
        if let Some(cc) = mnemonic.strip_prefix("set").and_then(cond_code) {
            return match operands {
                [Reg8(r)] => self.cg.emit(&[0x0F, 0x90 + cc, modrm(3, 0, *r)]),
                _ => Err(err("needs an 8-bit register")),
            };
        }

        match (mnemonic, operands) {
            ("mov", [Reg32(dst), Imm(v)]) => {
                self.cg.emit_u8(0xB8 + dst)?;
                self.cg.emit_u32(*v as u32)
            }
            ("mov", [Reg32(dst), Label(name)]) => {
                self.cg.emit_u8(0xB8 + dst)?;
                self.cg.reference(name, PatchKind::Abs32, line_no)
            }
            ("mov", [Reg32(dst), Reg32(src)]) => self.cg.emit(&[0x89, modrm(3, *src, *dst)]),
            ("mov", [Reg16(dst), Reg16(src)]) => {
                self.cg.emit(&[0x66, 0x89, modrm(3, *src, *dst)])
            }
            ("mov", [Reg8(dst), Reg8(src)]) => self.cg.emit(&[0x88, modrm(3, *src, *dst)]),
            ("mov", [Reg8(dst), Imm(v)]) => {
                self.cg.emit_u8(0xB0 + dst)?;
                self.cg.emit_u8(*v as u8)
            }
            ("mov", [Reg16(dst), Imm(v)]) => {
                self.cg.emit(&[0x66, 0xB8 + dst])?;
                self.cg.emit_u16(*v as u16)
            }
            ("mov", [Reg32(dst), Mem(mem)]) => match mem.size {
                Some(Size::Byte) | Some(Size::Word) => Err(err("size mismatch")),
                _ => {
                    self.cg.emit_u8(0x8B)?;
                    self.emit_modrm_mem(*dst, mem, line_no)
                }
            },
            ("mov", [Mem(mem), Reg32(src)]) => {
                self.cg.emit_u8(0x89)?;
                self.emit_modrm_mem(*src, mem, line_no)
            }
            ("mov", [Reg8(dst), Mem(mem)]) => {
                self.cg.emit_u8(0x8A)?;
                self.emit_modrm_mem(*dst, mem, line_no)
            }
            ("mov", [Mem(mem), Reg8(src)]) => {
                self.cg.emit_u8(0x88)?;
                self.emit_modrm_mem(*src, mem, line_no)
            }
            ("mov", [Mem(mem), Imm(v)]) => match mem.size {
                Some(Size::Byte) => {
                    self.cg.emit_u8(0xC6)?;
                    self.emit_modrm_mem(0, mem, line_no)?;
                    self.cg.emit_u8(*v as u8)
                }
                Some(Size::Word) => {
                    self.cg.emit(&[0x66, 0xC7])?;
                    self.emit_modrm_mem(0, mem, line_no)?;
                    self.cg.emit_u16(*v as u16)
                }
                _ => {
                    self.cg.emit_u8(0xC7)?;
                    self.emit_modrm_mem(0, mem, line_no)?;
                    self.cg.emit_u32(*v as u32)
                }
            },
            ("mov", [Mem(mem), Label(name)]) => {
                self.cg.emit_u8(0xC7)?;
                self.emit_modrm_mem(0, mem, line_no)?;
                self.cg.reference(name, PatchKind::Abs32, line_no)
            }

            ("movzx", [Reg32(dst), Reg8(src)]) => {
                self.cg.emit(&[0x0F, 0xB6, modrm(3, *dst, *src)])
            }
            ("movzx", [Reg32(dst), Mem(mem)]) => {
                let op = match mem.size {
                    Some(Size::Word) => 0xB7,
                    _ => 0xB6,
                };
                self.cg.emit(&[0x0F, op])?;
                self.emit_modrm_mem(*dst, mem, line_no)
            }
            ("movsx", [Reg32(dst), Reg8(src)]) => {
                self.cg.emit(&[0x0F, 0xBE, modrm(3, *dst, *src)])
            }
            ("movsx", [Reg32(dst), Mem(mem)]) => {
                let op = match mem.size {
                    Some(Size::Word) => 0xBF,
                    _ => 0xBE,
                };
                self.cg.emit(&[0x0F, op])?;
                self.emit_modrm_mem(*dst, mem, line_no)
            }

            ("lea", [Reg32(dst), Mem(mem)]) => {
                self.cg.emit_u8(0x8D)?;
                self.emit_modrm_mem(*dst, mem, line_no)
            }

            ("test", [Reg32(a), Reg32(b)]) => self.cg.emit(&[0x85, modrm(3, *b, *a)]),
            ("test", [Reg32(r), Imm(v)]) => {
                self.cg.emit(&[0xF7, modrm(3, 0, *r)])?;
                self.cg.emit_u32(*v as u32)
            }
            ("xchg", [Reg32(a), Reg32(b)]) => self.cg.emit(&[0x87, modrm(3, *b, *a)]),

            ("inc", [Reg32(r)]) => self.cg.emit_u8(0x40 + r),
            ("dec", [Reg32(r)]) => self.cg.emit_u8(0x48 + r),
            ("inc", [Mem(mem)]) => {
                match mem.size {
                    Some(Size::Byte) => self.cg.emit_u8(0xFE)?,
                    _ => self.cg.emit_u8(0xFF)?,
                }
                self.emit_modrm_mem(0, mem, line_no)
            }
            ("dec", [Mem(mem)]) => {
                match mem.size {
                    Some(Size::Byte) => self.cg.emit_u8(0xFE)?,
                    _ => self.cg.emit_u8(0xFF)?,
                }
                self.emit_modrm_mem(1, mem, line_no)
            }

            ("neg", [Reg32(r)]) => self.cg.emit(&[0xF7, modrm(3, 3, *r)]),
            ("not", [Reg32(r)]) => self.cg.emit(&[0xF7, modrm(3, 2, *r)]),
            ("mul", [Reg32(r)]) => self.cg.emit(&[0xF7, modrm(3, 4, *r)]),
            ("imul", [Reg32(r)]) => self.cg.emit(&[0xF7, modrm(3, 5, *r)]),
            ("imul", [Reg32(dst), Reg32(src)]) => {
                self.cg.emit(&[0x0F, 0xAF, modrm(3, *dst, *src)])
            }
            ("div", [Reg32(r)]) => self.cg.emit(&[0xF7, modrm(3, 6, *r)]),
            ("idiv", [Reg32(r)]) => self.cg.emit(&[0xF7, modrm(3, 7, *r)]),
            ("cdq", []) => self.cg.emit_u8(0x99),

            ("push", [Reg32(r)]) => self.cg.emit_u8(0x50 + r),
            ("push", [Imm(v)]) => {
                if (-128..=127).contains(v) {
                    self.cg.emit(&[0x6A, *v as i8 as u8])
                } else {
                    self.cg.emit_u8(0x68)?;
                    self.cg.emit_u32(*v as u32)
                }
            }
            ("push", [Label(name)]) => {
                self.cg.emit_u8(0x68)?;
                self.cg.reference(name, PatchKind::Abs32, line_no)
            }
            ("push", [Mem(mem)]) => {
                self.cg.emit_u8(0xFF)?;
                self.emit_modrm_mem(6, mem, line_no)
            }
            ("pop", [Reg32(r)]) => self.cg.emit_u8(0x58 + r),
            ("pop", [Mem(mem)]) => {
                self.cg.emit_u8(0x8F)?;
                self.emit_modrm_mem(0, mem, line_no)
            }

            ("jmp", [Label(name)]) => {
                self.cg.emit_u8(0xE9)?;
                self.cg.reference(name, PatchKind::Rel32, line_no)
            }
            ("jmp", [Reg32(r)]) => self.cg.emit(&[0xFF, modrm(3, 4, *r)]),
            ("call", [Label(name)]) => {
                self.cg.emit_u8(0xE8)?;
                self.cg.reference(name, PatchKind::Rel32, line_no)
            }
            ("call", [Reg32(r)]) => self.cg.emit(&[0xFF, modrm(3, 2, *r)]),
            ("call", [Mem(mem)]) => {
                self.cg.emit_u8(0xFF)?;
                self.emit_modrm_mem(2, mem, line_no)
            }

            ("ret", []) => self.cg.emit_u8(0xC3),
            ("ret", [Imm(v)]) => {
                self.cg.emit_u8(0xC2)?;
                self.cg.emit_u16(*v as u16)
            }
            ("int", [Imm(v)]) => self.cg.emit(&[0xCD, *v as u8]),
            ("leave", []) => self.cg.emit_u8(0xC9),
            ("nop", []) => self.cg.emit_u8(0x90),
            ("hlt", []) => self.cg.emit_u8(0xF4),
            ("cli", []) => self.cg.emit_u8(0xFA),
            ("sti", []) => self.cg.emit_u8(0xFB),
            ("pusha", []) | ("pushad", []) => self.cg.emit_u8(0x60),
            ("popa", []) | ("popad", []) => self.cg.emit_u8(0x61),
            ("pushf", []) | ("pushfd", []) => self.cg.emit_u8(0x9C),
            ("popf", []) | ("popfd", []) => self.cg.emit_u8(0x9D),
            ("iret", []) | ("iretd", []) => self.cg.emit_u8(0xCF),

            ("in", [Reg8(0), Reg16(2)]) => self.cg.emit_u8(0xEC), // in al, dx
            ("in", [Reg8(0), Imm(port)]) => self.cg.emit(&[0xE4, *port as u8]),
            ("out", [Reg16(2), Reg8(0)]) => self.cg.emit_u8(0xEE), // out dx, al
            ("out", [Imm(port), Reg8(0)]) => self.cg.emit(&[0xE6, *port as u8]),

            _ => Err(err("unknown instruction or operands")),
        }
    }
}

/// Pack a ModRM byte.
fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
    (mode << 6) | (reg << 3) | rm
}

/// Pack a SIB byte.
fn sib(scale: u8, index: u8, base: u8) -> u8 {
    (scale << 6) | (index << 3) | base
}

/// Assemble a standalone source file into a [`Program`]. The entry point
/// is the `main` label (or `_start`).
pub fn assemble_program(src: &str) -> Result<Program, CompileError> {
    assemble_program_at(src, AOT_CODE_BASE, AOT_DATA_BASE)
}

/// Assemble with explicit link bases (JIT picks its live buffer
/// addresses).
pub fn assemble_program_at(
    src: &str,
    code_base: u32,
    data_base: u32,
) -> Result<Program, CompileError> {
    let mut cg = CodeGen::new(code_base, data_base);
    {
        let mut asm = Assembler::new(&mut cg);
        asm.assemble(src, 1)?;
    }
    cg.resolve()?;

    let entry = cg
        .lookup("main")
        .or_else(|| cg.lookup("_start"))
        .ok_or_else(|| CompileError::new(0, "no 'main' or '_start' label"))?;

    Ok(Program {
        code: cg.code,
        data: cg.data,
        code_base,
        data_base,
        entry,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn asm(src: &str) -> Vec<u8> {
        assemble_program_at(src, 0x1000, 0x2000).unwrap().code
    }

    fn asm_err(src: &str) -> CompileError {
        assemble_program_at(src, 0x1000, 0x2000).unwrap_err()
    }

    #[test]
    fn mov_imm_and_ret() {
        let code = asm("main:\n mov eax, 42\n ret\n");
        assert_eq!(code, [0xB8, 42, 0, 0, 0, 0xC3]);
    }

    #[test]
    fn register_register_alu() {
        let code = asm("main:\n add eax, ecx\n sub edx, ebx\n ret\n");
        // add eax, ecx = 01 C8; sub edx, ebx = 29 DA
        assert_eq!(code, [0x01, 0xC8, 0x29, 0xDA, 0xC3]);
    }

    #[test]
    fn imm8_uses_sign_extended_form() {
        let code = asm("main:\n add eax, 5\n add eax, 1000\n ret\n");
        assert_eq!(&code[..3], &[0x83, 0xC0, 5]);
        assert_eq!(&code[3..5], &[0x81, 0xC0]);
        assert_eq!(&code[5..9], &1000i32.to_le_bytes());
    }

    #[test]
    fn ebp_relative_memory_operands() {
        let code = asm("main:\n mov eax, [ebp-4]\n mov [ebp+8], eax\n ret\n");
        // 8B 45 FC ; 89 45 08 ; C3
        assert_eq!(code, [0x8B, 0x45, 0xFC, 0x89, 0x45, 0x08, 0xC3]);
    }

    #[test]
    fn sib_is_emitted_for_scaled_index() {
        let code = asm("main:\n mov eax, [ebx+ecx*4]\n ret\n");
        // 8B 04 8B
        assert_eq!(code, [0x8B, 0x04, 0x8B, 0xC3]);
    }

    #[test]
    fn esp_base_forces_sib() {
        let code = asm("main:\n mov eax, [esp+4]\n ret\n");
        // 8B 44 24 04
        assert_eq!(code, [0x8B, 0x44, 0x24, 0x04, 0xC3]);
    }

    #[test]
    fn forward_jump_patches_rel32() {
        let code = asm("main:\n jmp done\n mov eax, 1\ndone:\n ret\n");
        // E9 rel32 to skip the 5-byte mov.
        assert_eq!(code[0], 0xE9);
        assert_eq!(&code[1..5], &5i32.to_le_bytes());
    }

    #[test]
    fn backward_conditional_jump() {
        let code = asm("main:\nloop_top:\n dec eax\n jnz loop_top\n ret\n");
        assert_eq!(code[1], 0x0F);
        assert_eq!(code[2], 0x85);
        // rel = 0 - 7 = -7
        assert_eq!(&code[3..7], &(-7i32).to_le_bytes());
    }

    #[test]
    fn local_labels_scope_to_parent() {
        let src = "\
main:
.top:
 dec eax
 jnz .top
 ret
second:
.top:
 ret
";
        // Two `.top` labels under different parents must not collide.
        assert!(assemble_program_at(src, 0, 0x1000).is_ok());
    }

    #[test]
    fn data_directives_fill_the_data_image() {
        let program = assemble_program_at(
            "main:\n ret\nsection .data\nmsg: db \"Hi\", 0\nvals: dw 1, 2\nbig: dd 0x11223344\n",
            0x1000,
            0x2000,
        )
        .unwrap();
        assert_eq!(
            program.data,
            [b'H', b'i', 0, 1, 0, 2, 0, 0x44, 0x33, 0x22, 0x11]
        );
    }

    #[test]
    fn dd_of_label_resolves_to_absolute_address() {
        let program = assemble_program_at(
            "main:\n ret\nsection .data\nmsg: db \"x\"\nptr: dd msg\n",
            0x1000,
            0x2000,
        )
        .unwrap();
        assert_eq!(&program.data[1..5], &0x2000u32.to_le_bytes());
    }

    #[test]
    fn mov_reg_label_takes_symbol_address() {
        let program = assemble_program_at(
            "main:\n mov eax, msg\n ret\nsection .data\nmsg: db 0\n",
            0x1000,
            0x2000,
        )
        .unwrap();
        assert_eq!(program.code[0], 0xB8);
        assert_eq!(&program.code[1..5], &0x2000u32.to_le_bytes());
    }

    #[test]
    fn times_repeats_its_directive() {
        let program = assemble_program_at(
            "main:\n ret\nsection .data\npad: times 4 db 0xAB\n",
            0,
            0x1000,
        )
        .unwrap();
        assert_eq!(program.data, [0xAB; 4]);
    }

    #[test]
    fn resb_reserves_zeroed_space() {
        let program = assemble_program_at(
            "main:\n ret\nsection .bss\nbuf: resb 8\nafter: resd 1\n",
            0,
            0x1000,
        )
        .unwrap();
        assert_eq!(program.data.len(), 12);
        assert!(program.data.iter().all(|&b| b == 0));
    }

    #[test]
    fn undefined_label_fails_with_line() {
        let err = asm_err("main:\n jmp nowhere\n ret\n");
        assert_eq!(err.line, 2);
        assert!(err.message.contains("nowhere"));
    }

    #[test]
    fn missing_entry_label_is_an_error() {
        let err = asm_err("start_here:\n ret\n");
        assert!(err.message.contains("main"));
    }

    #[test]
    fn unknown_mnemonic_reports_its_line() {
        let err = asm_err("main:\n frobnicate eax\n");
        assert_eq!(err.line, 2);
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let code = asm("; header\nmain: ; entry\n\n ret ; done\n");
        assert_eq!(code, [0xC3]);
    }

    #[test]
    fn byte_sized_memory_ops() {
        let code = asm("main:\n mov byte [eax], 7\n movzx ecx, byte [eax]\n ret\n");
        assert_eq!(&code[..3], &[0xC6, 0x00, 7]);
        assert_eq!(&code[3..6], &[0x0F, 0xB6, 0x08]);
    }

    #[test]
    fn push_pop_sequences() {
        let code = asm("main:\n push ebp\n push 300\n push 5\n pop eax\n pop ecx\n pop ebp\n ret\n");
        assert_eq!(code[0], 0x55);
        assert_eq!(code[1], 0x68); // push imm32 for 300
        assert_eq!(&code[2..6], &300i32.to_le_bytes());
        assert_eq!(&code[6..8], &[0x6A, 5]); // push imm8
    }

    #[test]
    fn short_jumps_use_rel8_and_verify_range() {
        let code = asm("main:\n jmp short over\n nop\nover:\n ret\n");
        assert_eq!(&code[..2], &[0xEB, 1]);

        let mut far = String::from("main:\n jmp short end\n");
        for _ in 0..200 {
            far.push_str(" nop\n");
        }
        far.push_str("end:\n ret\n");
        let err = asm_err(&far);
        assert!(err.message.contains("out of range"));
    }

    #[test]
    fn assembling_twice_is_byte_identical() {
        let src = "main:\n mov eax, msg\n call f\n ret\nf:\n ret\nsection .data\nmsg: db \"d\", 0\n";
        let a = assemble_program_at(src, 0x1000, 0x8000).unwrap();
        let b = assemble_program_at(src, 0x1000, 0x8000).unwrap();
        assert_eq!(a.code, b.code);
        assert_eq!(a.data, b.data);
    }
}
