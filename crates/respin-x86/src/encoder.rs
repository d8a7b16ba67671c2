//! x86-64 instruction encoder.
//!
//! Re-encodes decoded (or synthesized) instructions into machine bytes.
//! Instructions that carry a recorded opcode re-emit it; synthesized
//! instructions fall back to a canonical opcode table. Canonical choices:
//! shortest displacement, no redundant REX, SIB only where the base
//! register demands it.

use crate::inst::{
    Encoding, Inst, MemOperand, Mnemonic, OpEnc, Operand, PrefixFlags, Reg, SegReg, Width,
};

/// Encoder error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    /// The instruction has no machine encoding (`Invalid`, or an SSE
    /// pass-through without recorded opcode bytes).
    Unencodable(Mnemonic),
    /// The operand combination cannot be expressed in ModR/M form
    /// (e.g. RSP as an index register, displacement out of range).
    BadOperands,
    /// A branch displacement does not fit in 32 bits.
    BranchOutOfRange,
}

impl core::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Unencodable(m) => write!(f, "no encoding for {m:?}"),
            Self::BadOperands => write!(f, "operand combination cannot be encoded"),
            Self::BranchOutOfRange => write!(f, "branch displacement exceeds 32 bits"),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Upper bound on the encoded size of any single instruction.
pub const MAX_ENC_LEN: usize = 15;

/// Encode `inst` as if it were placed at address `at`, appending the bytes
/// to `out`. Returns the number of bytes emitted (zero for trace pseudo-ops).
pub fn encode(inst: &Inst, at: u64, out: &mut Vec<u8>) -> Result<usize, EncodeError> {
    let start = out.len();

    match inst.mnemonic {
        Mnemonic::HintCall | Mnemonic::HintRet => return Ok(0),
        Mnemonic::Invalid => return Err(EncodeError::Unencodable(Mnemonic::Invalid)),
        Mnemonic::Nop if inst.dst.is_none() => {
            out.push(0x90);
            return Ok(1);
        }
        Mnemonic::Ret if inst.dst.is_none() => {
            out.push(0xC3);
            return Ok(1);
        }
        _ => {}
    }

    // Direct branches: relative displacement against the placement address.
    if matches!(inst.mnemonic, Mnemonic::Jmp | Mnemonic::Jcc | Mnemonic::Call) {
        if let Some(Operand::Imm { value: target, .. }) = inst.dst {
            encode_branch(inst, at, target, out)?;
            return Ok(out.len() - start);
        }
    }

    let enc = if inst.enc.opcode_len > 0 {
        inst.enc
    } else {
        canonical_encoding(inst)?
    };

    assemble(inst, &enc, at, start, out)?;
    Ok(out.len() - start)
}

/// Emit a direct branch. The recorded short form is kept when the
/// displacement fits in 8 bits; otherwise the rel32 form is used.
fn encode_branch(inst: &Inst, at: u64, target: u64, out: &mut Vec<u8>) -> Result<(), EncodeError> {
    let cc = inst.cond.map_or(0, |c| c.0);
    let recorded = inst.enc.opcode_bytes();
    let recorded_short = matches!(recorded, [0xEB] | [0x70..=0x7F]);

    if recorded_short {
        let rel = target.wrapping_sub(at.wrapping_add(2)) as i64;
        if let Ok(rel8) = i8::try_from(rel) {
            let op = match inst.mnemonic {
                Mnemonic::Jmp => 0xEB,
                Mnemonic::Jcc => 0x70 | cc,
                _ => unreachable!(),
            };
            out.push(op);
            out.push(rel8 as u8);
            return Ok(());
        }
    }

    let long_len = match inst.mnemonic {
        Mnemonic::Jcc => 6u64,
        _ => 5u64,
    };
    let rel = target.wrapping_sub(at.wrapping_add(long_len)) as i64;
    let rel32 = i32::try_from(rel).map_err(|_| EncodeError::BranchOutOfRange)?;
    match inst.mnemonic {
        Mnemonic::Jmp => out.push(0xE9),
        Mnemonic::Call => out.push(0xE8),
        Mnemonic::Jcc => {
            out.push(0x0F);
            out.push(0x80 | cc);
        }
        _ => unreachable!(),
    }
    out.extend_from_slice(&rel32.to_le_bytes());
    Ok(())
}

/// Pick a canonical encoding for an instruction without recorded opcode
/// bytes (synthesized by the emulator or rewritten by a peephole pass).
fn canonical_encoding(inst: &Inst) -> Result<Encoding, EncodeError> {
    use Mnemonic::*;

    let dst = inst.dst;
    let src = inst.src;
    let w8 = matches!(dst, Some(op) if op.width() == Width::W8);

    let enc = match inst.mnemonic {
        Mov => match (dst, src) {
            (Some(Operand::Reg { width, .. }), Some(Operand::Imm { value, .. })) => match width {
                Width::W8 => Encoding::recorded(OpEnc::Oi, &[0xB0]),
                Width::W64 => {
                    // Prefer the sign-extended imm32 form when it fits.
                    if (value as i64) == (value as i64 as i32) as i64 {
                        Encoding::recorded(OpEnc::Mi, &[0xC7]).with_ext(0)
                    } else {
                        Encoding::recorded(OpEnc::Oi, &[0xB8])
                    }
                }
                _ => Encoding::recorded(OpEnc::Oi, &[0xB8]),
            },
            (Some(Operand::Mem(_)), Some(Operand::Imm { .. })) => {
                Encoding::recorded(OpEnc::Mi, &[if w8 { 0xC6 } else { 0xC7 }]).with_ext(0)
            }
            (Some(Operand::Reg { .. }), Some(Operand::Mem(_))) => {
                Encoding::recorded(OpEnc::Rm, &[if w8 { 0x8A } else { 0x8B }])
            }
            (Some(_), Some(Operand::Reg { .. })) => {
                Encoding::recorded(OpEnc::Mr, &[if w8 { 0x88 } else { 0x89 }])
            }
            _ => return Err(EncodeError::BadOperands),
        },

        Add | Or | And | Sub | Xor | Cmp => {
            let (base, ext) = match inst.mnemonic {
                Add => (0x00u8, 0u8),
                Or => (0x08, 1),
                And => (0x20, 4),
                Sub => (0x28, 5),
                Xor => (0x30, 6),
                Cmp => (0x38, 7),
                _ => unreachable!(),
            };
            match (dst, src) {
                (Some(_), Some(Operand::Imm { width, .. })) => {
                    let op = if w8 {
                        0x80
                    } else if width == Width::W8 {
                        0x83
                    } else {
                        0x81
                    };
                    Encoding::recorded(OpEnc::Mi, &[op]).with_ext(ext)
                }
                (Some(Operand::Reg { .. }), Some(Operand::Mem(_))) => {
                    Encoding::recorded(OpEnc::Rm, &[base + if w8 { 2 } else { 3 }])
                }
                (Some(_), Some(Operand::Reg { .. })) => {
                    Encoding::recorded(OpEnc::Mr, &[base + if w8 { 0 } else { 1 }])
                }
                _ => return Err(EncodeError::BadOperands),
            }
        }

        Test => match (dst, src) {
            (Some(_), Some(Operand::Imm { .. })) => {
                Encoding::recorded(OpEnc::Mi, &[if w8 { 0xF6 } else { 0xF7 }]).with_ext(0)
            }
            (Some(_), Some(Operand::Reg { .. })) => {
                Encoding::recorded(OpEnc::Mr, &[if w8 { 0x84 } else { 0x85 }])
            }
            _ => return Err(EncodeError::BadOperands),
        },

        Lea => Encoding::recorded(OpEnc::Rm, &[0x8D]),

        Push => match dst {
            Some(Operand::Reg { .. }) => Encoding::recorded(OpEnc::O, &[0x50]),
            // The operand width picks the encoding: a byte immediate is the
            // sign-extended 6A form, anything wider is 68.
            Some(Operand::Imm { width: Width::W8, .. }) => Encoding::recorded(OpEnc::I, &[0x6A]),
            Some(Operand::Imm { .. }) => Encoding::recorded(OpEnc::I, &[0x68]),
            Some(Operand::Mem(_)) => Encoding::recorded(OpEnc::M, &[0xFF]).with_ext(6),
            _ => return Err(EncodeError::BadOperands),
        },
        Pop => match dst {
            Some(Operand::Reg { .. }) => Encoding::recorded(OpEnc::O, &[0x58]),
            Some(Operand::Mem(_)) => Encoding::recorded(OpEnc::M, &[0x8F]).with_ext(0),
            _ => return Err(EncodeError::BadOperands),
        },

        Not => Encoding::recorded(OpEnc::M, &[if w8 { 0xF6 } else { 0xF7 }]).with_ext(2),
        Neg => Encoding::recorded(OpEnc::M, &[if w8 { 0xF6 } else { 0xF7 }]).with_ext(3),
        Inc => Encoding::recorded(OpEnc::M, &[if w8 { 0xFE } else { 0xFF }]).with_ext(0),
        Dec => Encoding::recorded(OpEnc::M, &[if w8 { 0xFE } else { 0xFF }]).with_ext(1),

        Shl | Shr | Sar | Rol | Ror => {
            let ext = match inst.mnemonic {
                Rol => 0,
                Ror => 1,
                Shl => 4,
                Shr => 5,
                Sar => 7,
                _ => unreachable!(),
            };
            match src {
                Some(Operand::Imm { .. }) => {
                    Encoding::recorded(OpEnc::Mi, &[if w8 { 0xC0 } else { 0xC1 }]).with_ext(ext)
                }
                Some(Operand::Reg { reg: Reg::Rcx, .. }) => {
                    Encoding::recorded(OpEnc::Mi, &[if w8 { 0xD2 } else { 0xD3 }]).with_ext(ext)
                }
                _ => return Err(EncodeError::BadOperands),
            }
        }

        Movzx | Movsx => {
            let src_w = src.map(|s| s.width()).ok_or(EncodeError::BadOperands)?;
            let op = match (inst.mnemonic, src_w) {
                (Movzx, Width::W8) => [0x0F, 0xB6].as_slice(),
                (Movzx, Width::W16) => &[0x0F, 0xB7],
                (Movsx, Width::W8) => &[0x0F, 0xBE],
                (Movsx, Width::W16) => &[0x0F, 0xBF],
                (Movsx, Width::W32) => &[0x63],
                _ => return Err(EncodeError::BadOperands),
            };
            Encoding::recorded(OpEnc::Rm, op)
        }

        Imul => match inst.src2 {
            None => Encoding::recorded(OpEnc::Rm, &[0x0F, 0xAF]),
            Some(Operand::Imm { width: Width::W8, .. }) => Encoding::recorded(OpEnc::Rmi, &[0x6B]),
            Some(_) => Encoding::recorded(OpEnc::Rmi, &[0x69]),
        },

        Cmovcc => {
            let cc = inst.cond.ok_or(EncodeError::BadOperands)?.0;
            Encoding::recorded(OpEnc::Rm, &[0x0F, 0x40 | cc])
        }
        Setcc => {
            let cc = inst.cond.ok_or(EncodeError::BadOperands)?.0;
            Encoding::recorded(OpEnc::M, &[0x0F, 0x90 | cc]).with_ext(0)
        }

        Ret => Encoding::recorded(OpEnc::I, &[0xC2]),
        Nop => Encoding::recorded(OpEnc::M, &[0x0F, 0x1F]).with_ext(0),

        // SSE is only ever re-emitted from recorded bytes.
        m => return Err(EncodeError::Unencodable(m)),
    };

    Ok(enc)
}

/// Operand roles for ModR/M assembly.
struct Roles {
    /// Operand encoded in the ModR/M reg field (or the opcode byte for
    /// `O`/`Oi` forms).
    reg: Option<Operand>,
    /// Operand encoded in the r/m field.
    rm: Option<Operand>,
    /// Trailing immediate, if any.
    imm: Option<Operand>,
}

fn roles(inst: &Inst, enc: &Encoding) -> Result<Roles, EncodeError> {
    let r = match enc.enc {
        OpEnc::None => Roles {
            reg: None,
            rm: None,
            imm: None,
        },
        OpEnc::Rm => Roles {
            reg: inst.dst,
            rm: inst.src,
            imm: None,
        },
        OpEnc::Mr => Roles {
            reg: inst.src,
            rm: inst.dst,
            imm: None,
        },
        OpEnc::Mi => Roles {
            reg: None,
            rm: inst.dst,
            imm: inst.src,
        },
        OpEnc::M => Roles {
            reg: None,
            rm: inst.dst,
            imm: None,
        },
        OpEnc::Rmi => Roles {
            reg: inst.dst,
            rm: inst.src,
            imm: inst.src2,
        },
        OpEnc::Oi => Roles {
            reg: inst.dst,
            rm: None,
            imm: inst.src,
        },
        OpEnc::O => Roles {
            reg: inst.dst,
            rm: None,
            imm: None,
        },
        OpEnc::I => {
            // The immediate may sit in `src` (implicit-AX ALU forms) or be
            // the single operand itself (PUSH imm, RET imm16).
            let imm = match (inst.src, inst.dst) {
                (Some(s @ Operand::Imm { .. }), _) => Some(s),
                (None, Some(d @ Operand::Imm { .. })) => Some(d),
                _ => return Err(EncodeError::BadOperands),
            };
            Roles {
                reg: None,
                rm: None,
                imm,
            }
        }
        OpEnc::D => return Err(EncodeError::BadOperands),
    };
    Ok(r)
}

/// Instructions whose operand size defaults to 64-bit in long mode (no
/// REX.W required).
fn default_64(m: Mnemonic) -> bool {
    matches!(
        m,
        Mnemonic::Push
            | Mnemonic::Pop
            | Mnemonic::Call
            | Mnemonic::Ret
            | Mnemonic::Jmp
            | Mnemonic::Jcc
    )
}

fn gpr_of(op: &Operand) -> Option<(Width, Reg)> {
    match op {
        Operand::Reg { width, reg } => Some((*width, *reg)),
        _ => None,
    }
}

fn assemble(
    inst: &Inst,
    enc: &Encoding,
    at: u64,
    start: usize,
    out: &mut Vec<u8>,
) -> Result<(), EncodeError> {
    let r = roles(inst, enc)?;

    let has_xmm = [inst.dst, inst.src, inst.src2]
        .iter()
        .any(|o| matches!(o, Some(Operand::Xmm { .. })));

    // Data width drives the 0x66 prefix and REX.W.
    let mut data_width = Width::W32;
    let mut saw_gpr = false;
    for op in [inst.dst, inst.src, inst.src2].iter().flatten() {
        if let Some((w, _)) = gpr_of(op) {
            saw_gpr = true;
            data_width = data_width.max(w);
        }
    }
    if !saw_gpr && !has_xmm {
        // Pure memory/immediate instruction: the memory operand carries the
        // data width.
        for op in [inst.dst, inst.src].iter().flatten() {
            if let Operand::Mem(m) = op {
                data_width = data_width.max(m.width);
            }
        }
    }
    // MOVD between a GPR (or GPR-sized memory) and an XMM register is the
    // one XMM form that takes REX.W.
    if has_xmm && inst.mnemonic == Mnemonic::Movd {
        for op in [inst.dst, inst.src].iter().flatten() {
            match op {
                Operand::Reg { width, .. } | Operand::Mem(MemOperand { width, .. }) => {
                    data_width = data_width.max(*width);
                }
                _ => {}
            }
        }
    }

    let rex_w = data_width == Width::W64
        && !default_64(inst.mnemonic)
        && (!has_xmm || inst.mnemonic == Mnemonic::Movd);

    let want_66 =
        enc.prefixes.contains(PrefixFlags::OPSIZE) || (data_width == Width::W16 && !has_xmm);

    // REX R/X/B extension bits.
    let mut rex_r = false;
    let mut rex_x = false;
    let mut rex_b = false;
    let mut rex_required = false; // SPL/BPL/SIL/DIL need an empty REX

    if let Some(op) = &r.reg {
        match op {
            Operand::Reg { width, reg } => {
                if reg.is_extended() {
                    if matches!(enc.enc, OpEnc::O | OpEnc::Oi) {
                        rex_b = true;
                    } else {
                        rex_r = true;
                    }
                }
                if *width == Width::W8 && matches!(reg, Reg::Rsp | Reg::Rbp | Reg::Rsi | Reg::Rdi) {
                    rex_required = true;
                }
            }
            Operand::Xmm { reg } => {
                if *reg >= 8 {
                    rex_r = true;
                }
            }
            _ => return Err(EncodeError::BadOperands),
        }
    }

    let mut seg: Option<SegReg> = None;
    if let Some(op) = &r.rm {
        match op {
            Operand::Reg { width, reg } => {
                if reg.is_extended() {
                    rex_b = true;
                }
                if *width == Width::W8 && matches!(reg, Reg::Rsp | Reg::Rbp | Reg::Rsi | Reg::Rdi) {
                    rex_required = true;
                }
            }
            Operand::Xmm { reg } => {
                if *reg >= 8 {
                    rex_b = true;
                }
            }
            Operand::Mem(m) => {
                seg = m.segment;
                if m.base.is_some_and(|b| b.is_extended()) {
                    rex_b = true;
                }
                if m.index.is_some_and(|i| i.is_extended()) {
                    rex_x = true;
                }
            }
            Operand::Imm { .. } => return Err(EncodeError::BadOperands),
        }
    }

    // Legacy prefixes.
    if enc.prefixes.contains(PrefixFlags::LOCK) {
        out.push(0xF0);
    }
    match seg {
        Some(SegReg::Fs) => out.push(0x64),
        Some(SegReg::Gs) => out.push(0x65),
        None => {}
    }
    if want_66 {
        out.push(0x66);
    }
    if enc.prefixes.contains(PrefixFlags::REPNE) {
        out.push(0xF2);
    }
    if enc.prefixes.contains(PrefixFlags::REP) {
        out.push(0xF3);
    }

    // REX.
    let rex = (rex_w as u8) << 3 | (rex_r as u8) << 2 | (rex_x as u8) << 1 | (rex_b as u8);
    if rex != 0 || rex_required {
        out.push(0x40 | rex);
    }

    // Opcode, with the register embedded for O/OI forms.
    let opcode = enc.opcode_bytes();
    match enc.enc {
        OpEnc::O | OpEnc::Oi => {
            let (_, reg) = r
                .reg
                .as_ref()
                .and_then(gpr_of)
                .ok_or(EncodeError::BadOperands)?;
            let (head, last) = opcode.split_at(opcode.len() - 1);
            out.extend_from_slice(head);
            out.push(last[0] | (reg.encoding() & 0x7));
        }
        _ => out.extend_from_slice(opcode),
    }

    // ModR/M + SIB + displacement.
    let mut rip_patch: Option<(usize, u64)> = None;
    if let Some(rm) = &r.rm {
        let reg_field = match (&r.reg, enc.ext) {
            (_, Some(ext)) => ext & 0x7,
            (Some(Operand::Reg { reg, .. }), None) => reg.encoding() & 0x7,
            (Some(Operand::Xmm { reg }), None) => reg & 0x7,
            (None, None) => 0,
            _ => return Err(EncodeError::BadOperands),
        };
        match rm {
            Operand::Reg { reg, .. } => {
                out.push(0xC0 | (reg_field << 3) | (reg.encoding() & 0x7));
            }
            Operand::Xmm { reg } => {
                out.push(0xC0 | (reg_field << 3) | (reg & 0x7));
            }
            Operand::Mem(m) => {
                emit_mem(out, reg_field, m, inst, &mut rip_patch)?;
            }
            Operand::Imm { .. } => return Err(EncodeError::BadOperands),
        }
    }

    // Immediate. The shift-by-one and shift-by-CL opcodes carry none, and a
    // register in the immediate slot (shift-by-CL) emits nothing.
    let implicit_imm = matches!(enc.opcode_bytes(), [0xD0] | [0xD1] | [0xD2] | [0xD3]);
    if !implicit_imm {
        if let Some(Operand::Imm { width, value }) = r.imm {
            // Only the opcode-embedded MOV form takes a 64-bit immediate;
            // every ModR/M form is capped at imm32.
            let width = if width == Width::W64 && enc.enc != OpEnc::Oi {
                Width::W32
            } else {
                width
            };
            match width {
                Width::W8 => out.push(value as u8),
                Width::W16 => out.extend_from_slice(&(value as u16).to_le_bytes()),
                Width::W32 => out.extend_from_slice(&(value as u32).to_le_bytes()),
                Width::W64 => out.extend_from_slice(&value.to_le_bytes()),
                Width::W128 => return Err(EncodeError::BadOperands),
            }
        }
    }

    // Patch the RIP-relative displacement now that the total length is
    // known: new_disp = absolute_target - (placement + length).
    if let Some((pos, abs_target)) = rip_patch {
        let inst_len = (out.len() - start) as u64;
        let new_disp = abs_target.wrapping_sub(at.wrapping_add(inst_len)) as i64;
        let d32 = i32::try_from(new_disp).map_err(|_| EncodeError::BadOperands)?;
        out[pos..pos + 4].copy_from_slice(&d32.to_le_bytes());
    }

    Ok(())
}

fn emit_mem(
    out: &mut Vec<u8>,
    reg_field: u8,
    m: &MemOperand,
    inst: &Inst,
    rip_patch: &mut Option<(usize, u64)>,
) -> Result<(), EncodeError> {
    debug_assert!(matches!(m.scale, 0 | 1 | 2 | 4 | 8));

    // RIP-relative: mod=00, rm=101, disp32 patched once the tail is known.
    // The absolute target is derived from the *source* position of the
    // instruction, so relocation falls out of the patch arithmetic.
    if m.base == Some(Reg::Rip) {
        if m.index.is_some() {
            return Err(EncodeError::BadOperands);
        }
        out.push((reg_field << 3) | 0b101);
        let pos = out.len();
        out.extend_from_slice(&[0; 4]);
        let abs = inst.next_addr().wrapping_add(m.disp as u64);
        *rip_patch = Some((pos, abs));
        return Ok(());
    }

    let disp = m.disp;
    let disp8 = i8::try_from(disp).is_ok();
    let disp32 = i32::try_from(disp).map_err(|_| EncodeError::BadOperands)?;

    let needs_sib = m.index.is_some()
        || m.base.is_none()
        || matches!(m.base, Some(Reg::Rsp) | Some(Reg::R12));

    if !needs_sib {
        let base = m.base.ok_or(EncodeError::BadOperands)?;
        let base_enc = base.encoding() & 0x7;
        // [RBP]/[R13] with no displacement must be encoded as disp8=0.
        let (mode, emit8, emit32) = if disp == 0 && base_enc != 0b101 {
            (0b00u8, false, false)
        } else if disp8 {
            (0b01, true, false)
        } else {
            (0b10, false, true)
        };
        out.push((mode << 6) | (reg_field << 3) | base_enc);
        if emit8 {
            out.push(disp as i8 as u8);
        } else if emit32 {
            out.extend_from_slice(&disp32.to_le_bytes());
        }
        return Ok(());
    }

    // SIB forms.
    let (index_enc, scale_bits) = match m.index {
        Some(idx) => {
            if idx == Reg::Rsp {
                return Err(EncodeError::BadOperands);
            }
            let bits = match m.scale {
                1 => 0u8,
                2 => 1,
                4 => 2,
                8 => 3,
                _ => return Err(EncodeError::BadOperands),
            };
            (idx.encoding() & 0x7, bits)
        }
        None => (0b100, 0),
    };

    match m.base {
        None => {
            // Disp32 with no base: mod=00, SIB base=101.
            out.push((reg_field << 3) | 0b100);
            out.push((scale_bits << 6) | (index_enc << 3) | 0b101);
            out.extend_from_slice(&disp32.to_le_bytes());
        }
        Some(base) => {
            let base_enc = base.encoding() & 0x7;
            let (mode, emit8, emit32) = if disp == 0 && base_enc != 0b101 {
                (0b00u8, false, false)
            } else if disp8 {
                (0b01, true, false)
            } else {
                (0b10, false, true)
            };
            out.push((mode << 6) | (reg_field << 3) | 0b100);
            out.push((scale_bits << 6) | (index_enc << 3) | base_enc);
            if emit8 {
                out.push(disp as i8 as u8);
            } else if emit32 {
                out.extend_from_slice(&disp32.to_le_bytes());
            }
        }
    }

    Ok(())
}
