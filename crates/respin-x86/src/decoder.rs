//! x86-64 instruction decoder.
//!
//! Decodes one instruction at a time from a byte slice. The decoder is
//! deliberately robust: an opcode it does not model becomes a single-byte
//! `Invalid` instruction and decoding continues, so unknown bytes can still
//! be carried through a trace. Only the emulated path turns `Invalid` into
//! a hard error.

use crate::inst::{
    Cond, Encoding, Inst, MemOperand, Mnemonic, OpEnc, Operand, PrefixFlags, Reg, SegReg, Trace,
    Width,
};

/// Maximum architectural x86 instruction length.
pub const MAX_INST_LEN: usize = 15;

/// Decoder error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The byte stream ended before the instruction could be fully decoded.
    UnexpectedEof,
}

impl core::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "unexpected end of instruction bytes"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Prefix state for a single instruction.
#[derive(Clone, Copy, Debug, Default)]
struct Prefixes {
    flags: PrefixFlags,
    segment: Option<SegReg>,
    addr_size_override: bool,
    rex: Option<u8>,
}

impl Prefixes {
    #[inline]
    fn rex_w(&self) -> bool {
        self.rex.is_some_and(|r| r & 0x08 != 0)
    }

    #[inline]
    fn rex_r(&self) -> bool {
        self.rex.is_some_and(|r| r & 0x04 != 0)
    }

    #[inline]
    fn rex_x(&self) -> bool {
        self.rex.is_some_and(|r| r & 0x02 != 0)
    }

    #[inline]
    fn rex_b(&self) -> bool {
        self.rex.is_some_and(|r| r & 0x01 != 0)
    }

    /// Operand width from REX.W and the 0x66 override (default 32).
    fn op_width(&self) -> Width {
        if self.rex_w() {
            Width::W64
        } else if self.flags.contains(PrefixFlags::OPSIZE) {
            Width::W16
        } else {
            Width::W32
        }
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn u8(&mut self) -> Result<u8, DecodeError> {
        let b = *self.bytes.get(self.pos).ok_or(DecodeError::UnexpectedEof)?;
        self.pos += 1;
        Ok(b)
    }

    fn i8(&mut self) -> Result<i8, DecodeError> {
        Ok(self.u8()? as i8)
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let s = self
            .bytes
            .get(self.pos..self.pos + 2)
            .ok_or(DecodeError::UnexpectedEof)?;
        self.pos += 2;
        Ok(u16::from_le_bytes(s.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let s = self
            .bytes
            .get(self.pos..self.pos + 4)
            .ok_or(DecodeError::UnexpectedEof)?;
        self.pos += 4;
        Ok(u32::from_le_bytes(s.try_into().unwrap()))
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(self.u32()? as i32)
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        let s = self
            .bytes
            .get(self.pos..self.pos + 8)
            .ok_or(DecodeError::UnexpectedEof)?;
        self.pos += 8;
        Ok(u64::from_le_bytes(s.try_into().unwrap()))
    }
}

fn scan_prefixes(c: &mut Cursor<'_>) -> Result<Prefixes, DecodeError> {
    let mut p = Prefixes::default();

    while c.pos < MAX_INST_LEN {
        let b = *c.bytes.get(c.pos).ok_or(DecodeError::UnexpectedEof)?;
        match b {
            0x66 => p.flags.insert(PrefixFlags::OPSIZE),
            0x67 => p.addr_size_override = true,
            0xF0 => p.flags.insert(PrefixFlags::LOCK),
            0xF2 => p.flags.insert(PrefixFlags::REPNE),
            0xF3 => p.flags.insert(PrefixFlags::REP),
            0x64 => p.segment = Some(SegReg::Fs),
            0x65 => p.segment = Some(SegReg::Gs),
            // CS/DS/ES/SS overrides are accepted and ignored in long mode.
            0x26 | 0x2E | 0x36 | 0x3E => {}
            // REX must directly precede the opcode; the last one wins.
            0x40..=0x4F => {
                p.rex = Some(b);
                c.pos += 1;
                continue;
            }
            _ => break,
        }
        // A legacy prefix after REX cancels it.
        p.rex = None;
        c.pos += 1;
    }

    Ok(p)
}

/// The r/m side of a parsed ModR/M byte, register index still raw.
enum RmPiece {
    Reg(u8),
    Mem {
        base: Option<Reg>,
        index: Option<Reg>,
        scale: u8,
        disp: i64,
    },
}

/// Parse ModR/M (+ SIB + displacement). Returns the extended reg-field
/// value and the r/m operand piece. See Intel SDM Vol. 2, §2.1.
fn parse_modrm(c: &mut Cursor<'_>, p: &Prefixes) -> Result<(u8, RmPiece), DecodeError> {
    let modrm = c.u8()?;
    let mode = (modrm >> 6) & 0b11;
    let reg_bits = (modrm >> 3) & 0b111;
    let rm_bits = modrm & 0b111;

    let reg = reg_bits | if p.rex_r() { 8 } else { 0 };

    if mode == 0b11 {
        let rm = rm_bits | if p.rex_b() { 8 } else { 0 };
        return Ok((reg, RmPiece::Reg(rm)));
    }

    let mut base: Option<Reg> = None;
    let mut index: Option<Reg> = None;
    let mut scale = 0u8;
    let disp: i64;

    if rm_bits == 0b100 {
        // SIB byte.
        let sib = c.u8()?;
        let scale_bits = (sib >> 6) & 0b11;
        let index_bits = (sib >> 3) & 0b111;
        let base_bits = sib & 0b111;

        // index == 4 suppresses the index regardless of REX.X.
        if index_bits != 0b100 {
            index = Reg::from_u4(index_bits | if p.rex_x() { 8 } else { 0 });
            scale = 1 << scale_bits;
        }

        if mode == 0 && base_bits == 0b101 {
            // Disp32 with no base register.
            disp = c.i32()? as i64;
        } else {
            base = Reg::from_u4(base_bits | if p.rex_b() { 8 } else { 0 });
            disp = read_disp(c, mode)?;
        }
    } else if mode == 0 && rm_bits == 0b101 {
        // RIP-relative disp32.
        base = Some(Reg::Rip);
        disp = c.i32()? as i64;
    } else {
        base = Reg::from_u4(rm_bits | if p.rex_b() { 8 } else { 0 });
        disp = read_disp(c, mode)?;
    }

    Ok((
        reg,
        RmPiece::Mem {
            base,
            index,
            scale,
            disp,
        },
    ))
}

fn read_disp(c: &mut Cursor<'_>, mode: u8) -> Result<i64, DecodeError> {
    match mode {
        0b00 => Ok(0),
        0b01 => Ok(c.i8()? as i64),
        0b10 => Ok(c.i32()? as i64),
        _ => Ok(0),
    }
}

/// Build a register operand from a raw 4-bit encoding, honoring the
/// high-byte hole: without REX, byte-width encodings 4..=7 select AH..BH,
/// which this model does not represent.
fn gpr(width: Width, enc: u8, has_rex: bool) -> Option<Operand> {
    if width == Width::W8 && !has_rex && (4..8).contains(&enc) {
        return None;
    }
    Reg::from_u4(enc).map(|reg| Operand::Reg { width, reg })
}

fn mem_operand(width: Width, piece: &RmPiece, p: &Prefixes) -> Operand {
    match piece {
        RmPiece::Reg(_) => unreachable!("register r/m handled by caller"),
        RmPiece::Mem {
            base,
            index,
            scale,
            disp,
        } => Operand::Mem(MemOperand {
            width,
            base: *base,
            index: *index,
            scale: *scale,
            disp: *disp,
            segment: p.segment,
        }),
    }
}

/// r/m operand at data width `width`.
fn rm_operand(width: Width, piece: &RmPiece, p: &Prefixes) -> Option<Operand> {
    match piece {
        RmPiece::Reg(enc) => gpr(width, *enc, p.rex.is_some()),
        RmPiece::Mem { .. } => Some(mem_operand(width, piece, p)),
    }
}

/// r/m operand where a mod=3 encoding selects an XMM register.
fn rm_xmm_operand(width: Width, piece: &RmPiece, p: &Prefixes) -> Operand {
    match piece {
        RmPiece::Reg(enc) => Operand::Xmm { reg: *enc },
        RmPiece::Mem { .. } => mem_operand(width, piece, p),
    }
}

struct SseRule {
    mnemonic: Mnemonic,
    enc: OpEnc,
    /// The ModR/M reg field selects a GPR instead of an XMM register.
    gpr_reg_field: bool,
    /// Memory width when the r/m side is a memory operand.
    mem_width: Width,
}

impl SseRule {
    fn xmm(mnemonic: Mnemonic, enc: OpEnc, mem_width: Width) -> Self {
        Self {
            mnemonic,
            enc,
            gpr_reg_field: false,
            mem_width,
        }
    }
}

/// Second-map SSE/SSE2 rules keyed by opcode byte and mandatory prefix.
fn sse_rule(op: u8, p: &Prefixes) -> Option<SseRule> {
    let f2 = p.flags.contains(PrefixFlags::REPNE);
    let f3 = p.flags.contains(PrefixFlags::REP);
    let p66 = p.flags.contains(PrefixFlags::OPSIZE);
    let np = !f2 && !f3 && !p66;

    use Mnemonic::*;
    let rule = match op {
        0x10 | 0x11 => {
            let enc = if op == 0x10 { OpEnc::Rm } else { OpEnc::Mr };
            if f3 {
                SseRule::xmm(Movss, enc, Width::W32)
            } else if f2 {
                SseRule::xmm(Movsd, enc, Width::W64)
            } else if np {
                SseRule::xmm(Movups, enc, Width::W128)
            } else {
                SseRule::xmm(SseOther, enc, Width::W128)
            }
        }
        0x28 | 0x29 => {
            let enc = if op == 0x28 { OpEnc::Rm } else { OpEnc::Mr };
            if np {
                SseRule::xmm(Movaps, enc, Width::W128)
            } else {
                SseRule::xmm(SseOther, enc, Width::W128)
            }
        }
        0x54 if np => SseRule::xmm(Andps, OpEnc::Rm, Width::W128),
        0x57 if np => SseRule::xmm(Xorps, OpEnc::Rm, Width::W128),
        0x58 | 0x59 | 0x5C | 0x5E => {
            let (ps, ss, sd) = match op {
                0x58 => (Addps, Addss, Addsd),
                0x59 => (Mulps, Mulss, Mulsd),
                0x5C => (Subps, Subss, Subsd),
                _ => (Divps, Divss, Divsd),
            };
            if f3 {
                SseRule::xmm(ss, OpEnc::Rm, Width::W32)
            } else if f2 {
                SseRule::xmm(sd, OpEnc::Rm, Width::W64)
            } else if np {
                SseRule::xmm(ps, OpEnc::Rm, Width::W128)
            } else {
                SseRule::xmm(SseOther, OpEnc::Rm, Width::W128)
            }
        }
        0x6E => {
            let w = if p.rex_w() { Width::W64 } else { Width::W32 };
            let m = if p66 { Movd } else { SseOther };
            SseRule {
                mnemonic: m,
                enc: OpEnc::Rm,
                gpr_reg_field: false,
                mem_width: w,
            }
        }
        0x7E => {
            if f3 {
                SseRule::xmm(Movq, OpEnc::Rm, Width::W64)
            } else {
                let w = if p.rex_w() { Width::W64 } else { Width::W32 };
                SseRule {
                    mnemonic: if p66 { Movd } else { SseOther },
                    enc: OpEnc::Mr,
                    gpr_reg_field: false,
                    mem_width: w,
                }
            }
        }
        0xD6 if p66 => SseRule::xmm(Movq, OpEnc::Mr, Width::W64),
        0xEF => SseRule::xmm(if p66 { Pxor } else { SseOther }, OpEnc::Rm, Width::W128),
        _ => return None,
    };
    Some(rule)
}

/// Decode a single instruction starting at `bytes[0]`, whose source address
/// is `addr`.
///
/// Unmodeled opcodes decode to a one-byte `Invalid` instruction; only a
/// truncated byte stream is an error.
pub fn decode_one(bytes: &[u8], addr: u64) -> Result<Inst, DecodeError> {
    let bytes = if bytes.len() > MAX_INST_LEN {
        &bytes[..MAX_INST_LEN]
    } else {
        bytes
    };

    let mut c = Cursor { bytes, pos: 0 };
    let p = scan_prefixes(&mut c)?;
    let inst = decode_opcode(&mut c, &p, addr)?;

    let mut inst = match inst {
        Some(i) => i,
        None => invalid(addr),
    };

    // 0x67 changes the address arithmetic of memory operands; the emulator
    // has no 32-bit address mode, so keep the length but refuse the
    // semantics.
    if p.addr_size_override {
        let len = c.pos as u8;
        inst = invalid(addr);
        inst.len = len;
        return Ok(inst);
    }

    if inst.mnemonic != Mnemonic::Invalid {
        inst.len = c.pos as u8;
        inst.enc.prefixes = p.flags;
    }
    Ok(inst)
}

fn invalid(addr: u64) -> Inst {
    Inst::simple(addr, 1, Mnemonic::Invalid)
}

/// Absolute target of a relative branch ending at `c.pos`.
fn rel_target(c: &Cursor<'_>, addr: u64, rel: i64) -> Operand {
    Operand::imm64((addr.wrapping_add(c.pos as u64)).wrapping_add(rel as u64))
}

fn decode_opcode(c: &mut Cursor<'_>, p: &Prefixes, addr: u64) -> Result<Option<Inst>, DecodeError> {
    let op = c.u8()?;
    let width = p.op_width();
    let has_rex = p.rex.is_some();

    let inst = match op {
        // ALU families: ADD/OR/AND/SUB/XOR/CMP share the same layout.
        0x00..=0x05 | 0x08..=0x0D | 0x20..=0x25 | 0x28..=0x2D | 0x30..=0x35 | 0x38..=0x3D => {
            let mnemonic = match op & 0xF8 {
                0x00 => Mnemonic::Add,
                0x08 => Mnemonic::Or,
                0x20 => Mnemonic::And,
                0x28 => Mnemonic::Sub,
                0x30 => Mnemonic::Xor,
                0x38 => Mnemonic::Cmp,
                _ => unreachable!(),
            };
            decode_alu_form(c, p, addr, mnemonic, op)?
        }

        // Group 1: op r/m, imm. The /digit ignores REX.R.
        0x80 | 0x81 | 0x83 => {
            let (reg, piece) = parse_modrm(c, p)?;
            let reg = reg & 0x7;
            let mnemonic = match reg {
                0 => Some(Mnemonic::Add),
                1 => Some(Mnemonic::Or),
                4 => Some(Mnemonic::And),
                5 => Some(Mnemonic::Sub),
                6 => Some(Mnemonic::Xor),
                7 => Some(Mnemonic::Cmp),
                _ => None, // ADC/SBB not modeled
            };
            let w = if op == 0x80 { Width::W8 } else { width };
            let imm = match op {
                0x80 | 0x83 => Operand::imm8(c.u8()?),
                _ => {
                    if w == Width::W16 {
                        Operand::imm(Width::W16, c.u16()? as u64)
                    } else {
                        Operand::imm32(c.u32()?)
                    }
                }
            };
            match (mnemonic, rm_operand(w, &piece, p)) {
                (Some(m), Some(dst)) => Some(
                    Inst::binary(addr, 0, m, dst, imm)
                        .with_enc(Encoding::recorded(OpEnc::Mi, &[op]).with_ext(reg)),
                ),
                _ => None,
            }
        }

        // TEST r/m, r.
        0x84 | 0x85 => {
            let w = if op == 0x84 { Width::W8 } else { width };
            let (reg, piece) = parse_modrm(c, p)?;
            let src = gpr(w, reg, has_rex);
            let dst = rm_operand(w, &piece, p);
            match (dst, src) {
                (Some(d), Some(s)) => Some(
                    Inst::binary(addr, 0, Mnemonic::Test, d, s)
                        .with_enc(Encoding::recorded(OpEnc::Mr, &[op])),
                ),
                _ => None,
            }
        }

        // MOV r/m, r and MOV r, r/m.
        0x88 | 0x89 | 0x8A | 0x8B => {
            let w = if op & 1 == 0 { Width::W8 } else { width };
            let to_reg = op & 2 != 0;
            let (reg, piece) = parse_modrm(c, p)?;
            let reg_op = gpr(w, reg, has_rex);
            let rm_op = rm_operand(w, &piece, p);
            match (reg_op, rm_op) {
                (Some(r), Some(m)) => {
                    let (dst, src, enc) = if to_reg {
                        (r, m, OpEnc::Rm)
                    } else {
                        (m, r, OpEnc::Mr)
                    };
                    Some(
                        Inst::binary(addr, 0, Mnemonic::Mov, dst, src)
                            .with_enc(Encoding::recorded(enc, &[op])),
                    )
                }
                _ => None,
            }
        }

        // LEA r, m.
        0x8D => {
            let (reg, piece) = parse_modrm(c, p)?;
            match (&piece, gpr(width, reg, has_rex)) {
                (RmPiece::Mem { .. }, Some(dst)) => {
                    let src = mem_operand(width, &piece, p);
                    Some(
                        Inst::binary(addr, 0, Mnemonic::Lea, dst, src)
                            .with_enc(Encoding::recorded(OpEnc::Rm, &[0x8D])),
                    )
                }
                _ => None,
            }
        }

        // POP r/m.
        0x8F => {
            let (reg, piece) = parse_modrm(c, p)?;
            if reg & 0x7 != 0 {
                None
            } else {
                rm_operand(Width::W64, &piece, p).map(|dst| {
                    Inst::unary(addr, 0, Mnemonic::Pop, dst)
                        .with_enc(Encoding::recorded(OpEnc::M, &[0x8F]).with_ext(0))
                })
            }
        }

        // 0x90 with REX.B is `xchg r8, rax`, which is not modeled.
        0x90 => (!p.rex_b()).then(|| Inst::simple(addr, 0, Mnemonic::Nop)),

        // MOVSXD r, r/m32.
        0x63 => {
            let (reg, piece) = parse_modrm(c, p)?;
            let dst = gpr(width, reg, has_rex);
            let src = rm_operand(Width::W32, &piece, p);
            match (dst, src) {
                (Some(d), Some(s)) => Some(
                    Inst::binary(addr, 0, Mnemonic::Movsx, d, s)
                        .with_enc(Encoding::recorded(OpEnc::Rm, &[0x63])),
                ),
                _ => None,
            }
        }

        // PUSH/POP r64 (opcode-embedded register).
        0x50..=0x57 | 0x58..=0x5F => {
            let reg = (op & 0x07) | if p.rex_b() { 8 } else { 0 };
            let w = if p.flags.contains(PrefixFlags::OPSIZE) {
                Width::W16
            } else {
                Width::W64
            };
            let mnemonic = if op < 0x58 {
                Mnemonic::Push
            } else {
                Mnemonic::Pop
            };
            let base = if op < 0x58 { 0x50 } else { 0x58 };
            gpr(w, reg, has_rex).map(|r| {
                Inst::unary(addr, 0, mnemonic, r).with_enc(Encoding::recorded(OpEnc::O, &[base]))
            })
        }

        // PUSH imm.
        0x68 => {
            let imm = Operand::imm32(c.u32()?);
            Some(
                Inst::unary(addr, 0, Mnemonic::Push, imm)
                    .with_enc(Encoding::recorded(OpEnc::I, &[0x68])),
            )
        }
        0x6A => {
            let imm = Operand::imm8(c.u8()?);
            Some(
                Inst::unary(addr, 0, Mnemonic::Push, imm)
                    .with_enc(Encoding::recorded(OpEnc::I, &[0x6A])),
            )
        }

        // IMUL r, r/m, imm.
        0x69 | 0x6B => {
            let (reg, piece) = parse_modrm(c, p)?;
            let dst = gpr(width, reg, has_rex);
            let src = rm_operand(width, &piece, p);
            let imm = if op == 0x6B {
                Operand::imm8(c.u8()?)
            } else {
                Operand::imm32(c.u32()?)
            };
            match (dst, src) {
                (Some(d), Some(s)) => {
                    let mut i = Inst::binary(addr, 0, Mnemonic::Imul, d, s)
                        .with_enc(Encoding::recorded(OpEnc::Rmi, &[op]));
                    i.src2 = Some(imm);
                    Some(i)
                }
                _ => None,
            }
        }

        // Jcc rel8.
        0x70..=0x7F => {
            let rel = c.i8()? as i64;
            let target = rel_target(c, addr, rel);
            Some(
                Inst::unary(addr, 0, Mnemonic::Jcc, target)
                    .with_cond(Cond(op & 0x0F))
                    .with_enc(Encoding::recorded(OpEnc::D, &[op])),
            )
        }

        // MOV r8, imm8 (opcode-embedded register).
        0xB0..=0xB7 => {
            let reg = (op & 0x07) | if p.rex_b() { 8 } else { 0 };
            let imm = Operand::imm8(c.u8()?);
            gpr(Width::W8, reg, has_rex).map(|r| {
                Inst::binary(addr, 0, Mnemonic::Mov, r, imm)
                    .with_enc(Encoding::recorded(OpEnc::Oi, &[0xB0]))
            })
        }

        // MOV r, imm32 / imm64 (the only 64-bit immediate form).
        0xB8..=0xBF => {
            let reg = (op & 0x07) | if p.rex_b() { 8 } else { 0 };
            let imm = match width {
                Width::W64 => Operand::imm64(c.u64()?),
                Width::W16 => Operand::imm(Width::W16, c.u16()? as u64),
                _ => Operand::imm32(c.u32()?),
            };
            gpr(width, reg, has_rex).map(|r| {
                Inst::binary(addr, 0, Mnemonic::Mov, r, imm)
                    .with_enc(Encoding::recorded(OpEnc::Oi, &[0xB8]))
            })
        }

        // Group 2 shifts/rotates.
        0xC0 | 0xC1 | 0xD0 | 0xD1 | 0xD2 | 0xD3 => {
            let w = if op & 1 == 0 { Width::W8 } else { width };
            let (reg, piece) = parse_modrm(c, p)?;
            let mnemonic = match reg & 0x7 {
                0 => Some(Mnemonic::Rol),
                1 => Some(Mnemonic::Ror),
                4 => Some(Mnemonic::Shl),
                5 => Some(Mnemonic::Shr),
                7 => Some(Mnemonic::Sar),
                _ => None, // RCL/RCR/SAL-alias not modeled
            };
            let src = match op {
                0xC0 | 0xC1 => Operand::imm8(c.u8()?),
                0xD0 | 0xD1 => Operand::imm8(1),
                _ => Operand::reg(Width::W8, Reg::Rcx),
            };
            match (mnemonic, rm_operand(w, &piece, p)) {
                (Some(m), Some(dst)) => Some(
                    Inst::binary(addr, 0, m, dst, src)
                        .with_enc(Encoding::recorded(OpEnc::Mi, &[op]).with_ext(reg & 0x7)),
                ),
                _ => None,
            }
        }

        // RET (with and without a stack adjustment).
        0xC2 => {
            let imm = Operand::imm(Width::W16, c.u16()? as u64);
            Some(
                Inst::unary(addr, 0, Mnemonic::Ret, imm)
                    .with_enc(Encoding::recorded(OpEnc::I, &[0xC2])),
            )
        }
        0xC3 => Some(Inst::simple(addr, 0, Mnemonic::Ret)),

        // Group 11: MOV r/m, imm.
        0xC6 | 0xC7 => {
            let (reg, piece) = parse_modrm(c, p)?;
            if reg & 0x7 != 0 {
                None
            } else {
                let w = if op == 0xC6 { Width::W8 } else { width };
                let imm = if op == 0xC6 {
                    Operand::imm8(c.u8()?)
                } else if w == Width::W16 {
                    Operand::imm(Width::W16, c.u16()? as u64)
                } else {
                    Operand::imm32(c.u32()?)
                };
                rm_operand(w, &piece, p).map(|dst| {
                    Inst::binary(addr, 0, Mnemonic::Mov, dst, imm)
                        .with_enc(Encoding::recorded(OpEnc::Mi, &[op]).with_ext(0))
                })
            }
        }

        // CALL rel32.
        0xE8 => {
            let rel = c.i32()? as i64;
            let target = rel_target(c, addr, rel);
            Some(
                Inst::unary(addr, 0, Mnemonic::Call, target)
                    .with_enc(Encoding::recorded(OpEnc::D, &[0xE8])),
            )
        }

        // JMP rel32 / rel8.
        0xE9 => {
            let rel = c.i32()? as i64;
            let target = rel_target(c, addr, rel);
            Some(
                Inst::unary(addr, 0, Mnemonic::Jmp, target)
                    .with_enc(Encoding::recorded(OpEnc::D, &[0xE9])),
            )
        }
        0xEB => {
            let rel = c.i8()? as i64;
            let target = rel_target(c, addr, rel);
            Some(
                Inst::unary(addr, 0, Mnemonic::Jmp, target)
                    .with_enc(Encoding::recorded(OpEnc::D, &[0xEB])),
            )
        }

        // Group 3: TEST/NOT/NEG.
        0xF6 | 0xF7 => {
            let w = if op == 0xF6 { Width::W8 } else { width };
            let (reg, piece) = parse_modrm(c, p)?;
            let rm = rm_operand(w, &piece, p);
            match (reg & 0x7, rm) {
                (0, Some(dst)) => {
                    let imm = if op == 0xF6 {
                        Operand::imm8(c.u8()?)
                    } else if w == Width::W16 {
                        Operand::imm(Width::W16, c.u16()? as u64)
                    } else {
                        Operand::imm32(c.u32()?)
                    };
                    Some(
                        Inst::binary(addr, 0, Mnemonic::Test, dst, imm)
                            .with_enc(Encoding::recorded(OpEnc::Mi, &[op]).with_ext(0)),
                    )
                }
                (2, Some(dst)) => Some(
                    Inst::unary(addr, 0, Mnemonic::Not, dst)
                        .with_enc(Encoding::recorded(OpEnc::M, &[op]).with_ext(2)),
                ),
                (3, Some(dst)) => Some(
                    Inst::unary(addr, 0, Mnemonic::Neg, dst)
                        .with_enc(Encoding::recorded(OpEnc::M, &[op]).with_ext(3)),
                ),
                _ => None, // MUL/IMUL/DIV/IDIV one-operand forms not modeled
            }
        }

        // Group 4: INC/DEC r/m8.
        0xFE => {
            let (reg, piece) = parse_modrm(c, p)?;
            let rm = rm_operand(Width::W8, &piece, p);
            match (reg & 0x7, rm) {
                (0, Some(dst)) => Some(
                    Inst::unary(addr, 0, Mnemonic::Inc, dst)
                        .with_enc(Encoding::recorded(OpEnc::M, &[0xFE]).with_ext(0)),
                ),
                (1, Some(dst)) => Some(
                    Inst::unary(addr, 0, Mnemonic::Dec, dst)
                        .with_enc(Encoding::recorded(OpEnc::M, &[0xFE]).with_ext(1)),
                ),
                _ => None,
            }
        }

        // Group 5: INC/DEC/CALL/JMP/PUSH r/m.
        0xFF => {
            let (reg, piece) = parse_modrm(c, p)?;
            match reg & 0x7 {
                0 | 1 => {
                    let m = if reg & 0x7 == 0 {
                        Mnemonic::Inc
                    } else {
                        Mnemonic::Dec
                    };
                    rm_operand(width, &piece, p).map(|dst| {
                        Inst::unary(addr, 0, m, dst)
                            .with_enc(Encoding::recorded(OpEnc::M, &[0xFF]).with_ext(reg & 0x7))
                    })
                }
                2 => rm_operand(Width::W64, &piece, p).map(|dst| {
                    Inst::unary(addr, 0, Mnemonic::Call, dst)
                        .with_enc(Encoding::recorded(OpEnc::M, &[0xFF]).with_ext(2))
                }),
                4 => rm_operand(Width::W64, &piece, p).map(|dst| {
                    Inst::unary(addr, 0, Mnemonic::Jmp, dst)
                        .with_enc(Encoding::recorded(OpEnc::M, &[0xFF]).with_ext(4))
                }),
                6 => rm_operand(Width::W64, &piece, p).map(|dst| {
                    Inst::unary(addr, 0, Mnemonic::Push, dst)
                        .with_enc(Encoding::recorded(OpEnc::M, &[0xFF]).with_ext(6))
                }),
                _ => None,
            }
        }

        // TEST AL/eAX, imm.
        0xA8 => {
            let dst = Operand::reg(Width::W8, Reg::Rax);
            let imm = Operand::imm8(c.u8()?);
            Some(
                Inst::binary(addr, 0, Mnemonic::Test, dst, imm)
                    .with_enc(Encoding::recorded(OpEnc::I, &[0xA8])),
            )
        }
        0xA9 => {
            let dst = Operand::reg(width, Reg::Rax);
            let imm = if width == Width::W16 {
                Operand::imm(Width::W16, c.u16()? as u64)
            } else {
                Operand::imm32(c.u32()?)
            };
            Some(
                Inst::binary(addr, 0, Mnemonic::Test, dst, imm)
                    .with_enc(Encoding::recorded(OpEnc::I, &[0xA9])),
            )
        }

        // Two-byte map.
        0x0F => decode_0f(c, p, addr)?,

        _ => None,
    };

    Ok(inst)
}

/// ALU register/immediate forms shared by ADD/OR/AND/SUB/XOR/CMP.
fn decode_alu_form(
    c: &mut Cursor<'_>,
    p: &Prefixes,
    addr: u64,
    mnemonic: Mnemonic,
    op: u8,
) -> Result<Option<Inst>, DecodeError> {
    let width = p.op_width();
    let has_rex = p.rex.is_some();

    let inst = match op & 0x07 {
        // op r/m8, r8 and op r/m, r.
        0 | 1 => {
            let w = if op & 1 == 0 { Width::W8 } else { width };
            let (reg, piece) = parse_modrm(c, p)?;
            let src = gpr(w, reg, has_rex);
            let dst = rm_operand(w, &piece, p);
            match (dst, src) {
                (Some(d), Some(s)) => Some(
                    Inst::binary(addr, 0, mnemonic, d, s)
                        .with_enc(Encoding::recorded(OpEnc::Mr, &[op])),
                ),
                _ => None,
            }
        }
        // op r8, r/m8 and op r, r/m.
        2 | 3 => {
            let w = if op & 1 == 0 { Width::W8 } else { width };
            let (reg, piece) = parse_modrm(c, p)?;
            let dst = gpr(w, reg, has_rex);
            let src = rm_operand(w, &piece, p);
            match (dst, src) {
                (Some(d), Some(s)) => Some(
                    Inst::binary(addr, 0, mnemonic, d, s)
                        .with_enc(Encoding::recorded(OpEnc::Rm, &[op])),
                ),
                _ => None,
            }
        }
        // op AL, imm8.
        4 => {
            let dst = Operand::reg(Width::W8, Reg::Rax);
            let imm = Operand::imm8(c.u8()?);
            Some(
                Inst::binary(addr, 0, mnemonic, dst, imm)
                    .with_enc(Encoding::recorded(OpEnc::I, &[op])),
            )
        }
        // op eAX, imm.
        5 => {
            let dst = Operand::reg(width, Reg::Rax);
            let imm = if width == Width::W16 {
                Operand::imm(Width::W16, c.u16()? as u64)
            } else {
                Operand::imm32(c.u32()?)
            };
            Some(
                Inst::binary(addr, 0, mnemonic, dst, imm)
                    .with_enc(Encoding::recorded(OpEnc::I, &[op])),
            )
        }
        _ => None,
    };

    Ok(inst)
}

fn decode_0f(c: &mut Cursor<'_>, p: &Prefixes, addr: u64) -> Result<Option<Inst>, DecodeError> {
    let op = c.u8()?;
    let width = p.op_width();
    let has_rex = p.rex.is_some();

    let inst = match op {
        // Multi-byte NOP.
        0x1F => {
            let (reg, piece) = parse_modrm(c, p)?;
            if reg & 0x7 != 0 {
                None
            } else {
                rm_operand(width, &piece, p).map(|dst| {
                    Inst::unary(addr, 0, Mnemonic::Nop, dst)
                        .with_enc(Encoding::recorded(OpEnc::M, &[0x0F, 0x1F]).with_ext(0))
                })
            }
        }

        // CMOVcc r, r/m.
        0x40..=0x4F => {
            let (reg, piece) = parse_modrm(c, p)?;
            let dst = gpr(width, reg, has_rex);
            let src = rm_operand(width, &piece, p);
            match (dst, src) {
                (Some(d), Some(s)) => Some(
                    Inst::binary(addr, 0, Mnemonic::Cmovcc, d, s)
                        .with_cond(Cond(op & 0x0F))
                        .with_enc(Encoding::recorded(OpEnc::Rm, &[0x0F, op])),
                ),
                _ => None,
            }
        }

        // Jcc rel32.
        0x80..=0x8F => {
            let rel = c.i32()? as i64;
            let target = rel_target(c, addr, rel);
            Some(
                Inst::unary(addr, 0, Mnemonic::Jcc, target)
                    .with_cond(Cond(op & 0x0F))
                    .with_enc(Encoding::recorded(OpEnc::D, &[0x0F, op])),
            )
        }

        // SETcc r/m8.
        0x90..=0x9F => {
            let (_, piece) = parse_modrm(c, p)?;
            rm_operand(Width::W8, &piece, p).map(|dst| {
                Inst::unary(addr, 0, Mnemonic::Setcc, dst)
                    .with_cond(Cond(op & 0x0F))
                    .with_enc(Encoding::recorded(OpEnc::M, &[0x0F, op]).with_ext(0))
            })
        }

        // IMUL r, r/m.
        0xAF => {
            let (reg, piece) = parse_modrm(c, p)?;
            let dst = gpr(width, reg, has_rex);
            let src = rm_operand(width, &piece, p);
            match (dst, src) {
                (Some(d), Some(s)) => Some(
                    Inst::binary(addr, 0, Mnemonic::Imul, d, s)
                        .with_enc(Encoding::recorded(OpEnc::Rm, &[0x0F, 0xAF])),
                ),
                _ => None,
            }
        }

        // MOVZX / MOVSX from 8/16-bit sources.
        0xB6 | 0xB7 | 0xBE | 0xBF => {
            let src_w = if op & 1 == 0 { Width::W8 } else { Width::W16 };
            let mnemonic = if op < 0xBE {
                Mnemonic::Movzx
            } else {
                Mnemonic::Movsx
            };
            let (reg, piece) = parse_modrm(c, p)?;
            let dst = gpr(width, reg, has_rex);
            let src = rm_operand(src_w, &piece, p);
            match (dst, src) {
                (Some(d), Some(s)) => Some(
                    Inst::binary(addr, 0, mnemonic, d, s)
                        .with_enc(Encoding::recorded(OpEnc::Rm, &[0x0F, op])),
                ),
                _ => None,
            }
        }

        // Three-byte maps: carried as pass-through with a ModR/M shape.
        0x38 | 0x3A => {
            let op3 = c.u8()?;
            let (reg, piece) = parse_modrm(c, p)?;
            let dst = Operand::Xmm { reg };
            let src = rm_xmm_operand(Width::W128, &piece, p);
            let mut i = Inst::binary(addr, 0, Mnemonic::SseOther, dst, src);
            if op == 0x3A {
                i.src2 = Some(Operand::imm8(c.u8()?));
                i.enc = Encoding::recorded(OpEnc::Rmi, &[0x0F, op, op3]);
            } else {
                i.enc = Encoding::recorded(OpEnc::Rm, &[0x0F, op, op3]);
            }
            Some(i)
        }

        _ => {
            // SSE/SSE2 subset.
            match sse_rule(op, p) {
                Some(rule) => {
                    let (reg, piece) = parse_modrm(c, p)?;
                    let reg_op = if rule.gpr_reg_field {
                        gpr(rule.mem_width, reg, has_rex)
                    } else {
                        Some(Operand::Xmm { reg })
                    };
                    // MOVD moves between a GPR and an XMM register: the r/m
                    // side is the GPR.
                    let rm_is_gpr = rule.mnemonic == Mnemonic::Movd;
                    let rm_op = if rm_is_gpr {
                        match &piece {
                            RmPiece::Reg(enc) => gpr(rule.mem_width, *enc, has_rex),
                            RmPiece::Mem { .. } => Some(mem_operand(rule.mem_width, &piece, p)),
                        }
                    } else {
                        Some(rm_xmm_operand(rule.mem_width, &piece, p))
                    };
                    match (reg_op, rm_op) {
                        (Some(r), Some(m)) => {
                            let (dst, src) = match rule.enc {
                                OpEnc::Rm => (r, m),
                                _ => (m, r),
                            };
                            Some(
                                Inst::binary(addr, 0, rule.mnemonic, dst, src)
                                    .with_enc(Encoding::recorded(rule.enc, &[0x0F, op])),
                            )
                        }
                        _ => None,
                    }
                }
                None => None,
            }
        }
    };

    Ok(inst)
}

/// Decode a function image starting at `base_addr`.
///
/// The cursor advances by one byte over anything that fails to decode
/// (recorded as `Invalid`). When `stop_at_ret` is set, decoding terminates
/// after the first RET.
pub fn decode_func(bytes: &[u8], base_addr: u64, max: usize, stop_at_ret: bool) -> Trace {
    let max = max.min(bytes.len());
    let mut trace = Trace::with_capacity(max / 4 + 8);
    let mut offset = 0usize;

    while offset < max {
        let addr = base_addr + offset as u64;
        let inst = match decode_one(&bytes[offset..max], addr) {
            Ok(i) => i,
            Err(DecodeError::UnexpectedEof) => invalid(addr),
        };
        offset += inst.len as usize;
        let is_ret = inst.mnemonic == Mnemonic::Ret;
        trace.push(inst);
        if is_ret && stop_at_ret {
            break;
        }
    }

    trace
}
