//! Intel-syntax text rendering for registers, operands and instructions.

use core::fmt;

use crate::inst::{Cond, Inst, MemOperand, Mnemonic, Operand, Reg, SegReg, Width};

fn gpr_name(reg: Reg, width: Width) -> &'static str {
    use Reg::*;
    match width {
        Width::W8 => match reg {
            Rax => "al",
            Rcx => "cl",
            Rdx => "dl",
            Rbx => "bl",
            Rsp => "spl",
            Rbp => "bpl",
            Rsi => "sil",
            Rdi => "dil",
            R8 => "r8b",
            R9 => "r9b",
            R10 => "r10b",
            R11 => "r11b",
            R12 => "r12b",
            R13 => "r13b",
            R14 => "r14b",
            R15 => "r15b",
            Rip => "??",
        },
        Width::W16 => match reg {
            Rax => "ax",
            Rcx => "cx",
            Rdx => "dx",
            Rbx => "bx",
            Rsp => "sp",
            Rbp => "bp",
            Rsi => "si",
            Rdi => "di",
            R8 => "r8w",
            R9 => "r9w",
            R10 => "r10w",
            R11 => "r11w",
            R12 => "r12w",
            R13 => "r13w",
            R14 => "r14w",
            R15 => "r15w",
            Rip => "??",
        },
        Width::W32 => match reg {
            Rax => "eax",
            Rcx => "ecx",
            Rdx => "edx",
            Rbx => "ebx",
            Rsp => "esp",
            Rbp => "ebp",
            Rsi => "esi",
            Rdi => "edi",
            R8 => "r8d",
            R9 => "r9d",
            R10 => "r10d",
            R11 => "r11d",
            R12 => "r12d",
            R13 => "r13d",
            R14 => "r14d",
            R15 => "r15d",
            Rip => "eip",
        },
        _ => match reg {
            Rax => "rax",
            Rcx => "rcx",
            Rdx => "rdx",
            Rbx => "rbx",
            Rsp => "rsp",
            Rbp => "rbp",
            Rsi => "rsi",
            Rdi => "rdi",
            R8 => "r8",
            R9 => "r9",
            R10 => "r10",
            R11 => "r11",
            R12 => "r12",
            R13 => "r13",
            R14 => "r14",
            R15 => "r15",
            Rip => "rip",
        },
    }
}

impl fmt::Display for MemOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size = match self.width {
            Width::W8 => "byte ptr ",
            Width::W16 => "word ptr ",
            Width::W32 => "dword ptr ",
            Width::W64 => "qword ptr ",
            Width::W128 => "xmmword ptr ",
        };
        f.write_str(size)?;
        match self.segment {
            Some(SegReg::Fs) => f.write_str("fs:")?,
            Some(SegReg::Gs) => f.write_str("gs:")?,
            None => {}
        }
        f.write_str("[")?;
        let mut first = true;
        if let Some(base) = self.base {
            write!(f, "{}", gpr_name(base, Width::W64))?;
            first = false;
        }
        if let Some(index) = self.index {
            if !first {
                f.write_str("+")?;
            }
            write!(f, "{}", gpr_name(index, Width::W64))?;
            if self.scale > 1 {
                write!(f, "*{}", self.scale)?;
            }
            first = false;
        }
        if self.disp != 0 || first {
            if first {
                write!(f, "0x{:x}", self.disp)?;
            } else if self.disp < 0 {
                write!(f, "-0x{:x}", -self.disp)?;
            } else {
                write!(f, "+0x{:x}", self.disp)?;
            }
        }
        f.write_str("]")
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg { width, reg } => f.write_str(gpr_name(*reg, *width)),
            Operand::Imm { value, .. } => write!(f, "0x{value:x}"),
            Operand::Xmm { reg } => write!(f, "xmm{reg}"),
            Operand::Mem(m) => write!(f, "{m}"),
        }
    }
}

fn cond_suffix(cond: Cond) -> &'static str {
    match cond.0 {
        0x0 => "o",
        0x1 => "no",
        0x2 => "b",
        0x3 => "ae",
        0x4 => "e",
        0x5 => "ne",
        0x6 => "be",
        0x7 => "a",
        0x8 => "s",
        0x9 => "ns",
        0xA => "p",
        0xB => "np",
        0xC => "l",
        0xD => "ge",
        0xE => "le",
        _ => "g",
    }
}

fn mnemonic_name(m: Mnemonic) -> &'static str {
    use Mnemonic::*;
    match m {
        Mov => "mov",
        Lea => "lea",
        Add => "add",
        Sub => "sub",
        And => "and",
        Or => "or",
        Xor => "xor",
        Neg => "neg",
        Not => "not",
        Inc => "inc",
        Dec => "dec",
        Imul => "imul",
        Cmp => "cmp",
        Test => "test",
        Shl => "shl",
        Shr => "shr",
        Sar => "sar",
        Rol => "rol",
        Ror => "ror",
        Movsx => "movsx",
        Movzx => "movzx",
        Push => "push",
        Pop => "pop",
        Call => "call",
        Ret => "ret",
        Jmp => "jmp",
        Jcc => "j",
        Cmovcc => "cmov",
        Setcc => "set",
        Nop => "nop",
        Movups => "movups",
        Movaps => "movaps",
        Movss => "movss",
        Movsd => "movsd",
        Addss => "addss",
        Addsd => "addsd",
        Addps => "addps",
        Subss => "subss",
        Subsd => "subsd",
        Subps => "subps",
        Mulss => "mulss",
        Mulsd => "mulsd",
        Mulps => "mulps",
        Divss => "divss",
        Divsd => "divsd",
        Divps => "divps",
        Movd => "movd",
        Movq => "movq",
        Pxor => "pxor",
        Andps => "andps",
        Xorps => "xorps",
        SseOther => "(sse)",
        Invalid => "(invalid)",
        HintCall => "(hint-call)",
        HintRet => "(hint-ret)",
    }
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(mnemonic_name(self.mnemonic))?;
        if let Some(cond) = self.cond {
            f.write_str(cond_suffix(cond))?;
        }
        let mut sep = " ";
        for op in [self.dst, self.src, self.src2].iter().flatten() {
            write!(f, "{sep}{op}")?;
            sep = ", ";
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode_one;

    #[test]
    fn renders_mem_operand() {
        // mov rax, [rdi+0x10]
        let i = decode_one(&[0x48, 0x8B, 0x47, 0x10], 0).unwrap();
        assert_eq!(i.to_string(), "mov rax, qword ptr [rdi+0x10]");
    }

    #[test]
    fn renders_scaled_index() {
        // mov rax, [rcx*8+0x0]
        let i = decode_one(&[0x48, 0x8B, 0x04, 0xCD, 0, 0, 0, 0], 0).unwrap();
        assert_eq!(i.to_string(), "mov rax, qword ptr [rcx*8]");
    }

    #[test]
    fn renders_jcc() {
        let i = decode_one(&[0x75, 0x02], 0x40).unwrap();
        assert_eq!(i.to_string(), "jne 0x44");
    }
}
