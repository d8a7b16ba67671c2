//! In-memory representation of decoded x86-64 instructions.
//!
//! Operands and instructions are plain values copied by assignment; nothing
//! in this module aliases externally owned memory.

/// General-purpose register in native encoding order, plus `Rip` which is
/// only valid as the base of a RIP-relative memory operand.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
    Rip = 16,
}

impl Reg {
    pub const COUNT: usize = 16;

    #[inline]
    pub fn from_u4(v: u8) -> Option<Self> {
        Some(match v {
            0 => Reg::Rax,
            1 => Reg::Rcx,
            2 => Reg::Rdx,
            3 => Reg::Rbx,
            4 => Reg::Rsp,
            5 => Reg::Rbp,
            6 => Reg::Rsi,
            7 => Reg::Rdi,
            8 => Reg::R8,
            9 => Reg::R9,
            10 => Reg::R10,
            11 => Reg::R11,
            12 => Reg::R12,
            13 => Reg::R13,
            14 => Reg::R14,
            15 => Reg::R15,
            _ => return None,
        })
    }

    /// 4-bit hardware encoding. Not defined for `Rip`.
    #[inline]
    pub fn encoding(self) -> u8 {
        debug_assert!(self != Reg::Rip);
        self as u8
    }

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Registers R8..R15 need a REX extension bit.
    #[inline]
    pub fn is_extended(self) -> bool {
        (self as u8) >= 8 && self != Reg::Rip
    }
}

/// Operand width.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Width {
    W8,
    W16,
    W32,
    W64,
    W128,
}

impl Width {
    #[inline]
    pub const fn bits(self) -> u32 {
        match self {
            Width::W8 => 8,
            Width::W16 => 16,
            Width::W32 => 32,
            Width::W64 => 64,
            Width::W128 => 128,
        }
    }

    #[inline]
    pub const fn bytes(self) -> u64 {
        (self.bits() as u64) / 8
    }

    /// All-ones mask for the width. Not defined for `W128`.
    #[inline]
    pub fn mask(self) -> u64 {
        match self {
            Width::W8 => 0xFF,
            Width::W16 => 0xFFFF,
            Width::W32 => 0xFFFF_FFFF,
            Width::W64 => u64::MAX,
            Width::W128 => unreachable!("no 64-bit mask for W128"),
        }
    }
}

/// x86 condition code (the low 4 bits of `Jcc`/`SETcc`/`CMOVcc` opcodes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cond(pub u8);

impl Cond {
    pub const O: Cond = Cond(0x0);
    pub const NO: Cond = Cond(0x1);
    pub const B: Cond = Cond(0x2);
    pub const AE: Cond = Cond(0x3);
    pub const E: Cond = Cond(0x4);
    pub const NE: Cond = Cond(0x5);
    pub const BE: Cond = Cond(0x6);
    pub const A: Cond = Cond(0x7);
    pub const S: Cond = Cond(0x8);
    pub const NS: Cond = Cond(0x9);
    pub const P: Cond = Cond(0xA);
    pub const NP: Cond = Cond(0xB);
    pub const L: Cond = Cond(0xC);
    pub const GE: Cond = Cond(0xD);
    pub const LE: Cond = Cond(0xE);
    pub const G: Cond = Cond(0xF);

    #[inline]
    pub fn negate(self) -> Cond {
        Cond(self.0 ^ 1)
    }
}

/// Segment override carried on a memory operand. Long mode ignores
/// CS/DS/ES/SS overrides, so only FS and GS are represented.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegReg {
    Fs,
    Gs,
}

/// Memory operand: effective address `base + index * scale + disp`.
///
/// Invariant: `index.is_none()` iff `scale == 0`; otherwise
/// `scale` is one of 1, 2, 4, 8.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemOperand {
    pub width: Width,
    pub base: Option<Reg>,
    pub index: Option<Reg>,
    pub scale: u8,
    pub disp: i64,
    pub segment: Option<SegReg>,
}

impl MemOperand {
    pub fn base_disp(width: Width, base: Reg, disp: i64) -> Self {
        Self {
            width,
            base: Some(base),
            index: None,
            scale: 0,
            disp,
            segment: None,
        }
    }
}

/// Decoded operand. `Imm` holds raw bits; sign interpretation is up to the
/// consumer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operand {
    Imm { width: Width, value: u64 },
    Reg { width: Width, reg: Reg },
    Xmm { reg: u8 },
    Mem(MemOperand),
}

impl Operand {
    #[inline]
    pub fn reg(width: Width, reg: Reg) -> Self {
        Operand::Reg { width, reg }
    }

    #[inline]
    pub fn reg32(reg: Reg) -> Self {
        Operand::Reg { width: Width::W32, reg }
    }

    #[inline]
    pub fn reg64(reg: Reg) -> Self {
        Operand::Reg { width: Width::W64, reg }
    }

    #[inline]
    pub fn imm(width: Width, value: u64) -> Self {
        // 32-bit immediates are unsigned-bounded; wider values must use W64.
        debug_assert!(width != Width::W32 || value < (1u64 << 32));
        Operand::Imm { width, value }
    }

    #[inline]
    pub fn imm8(value: u8) -> Self {
        Operand::Imm { width: Width::W8, value: value as u64 }
    }

    #[inline]
    pub fn imm32(value: u32) -> Self {
        Operand::Imm { width: Width::W32, value: value as u64 }
    }

    #[inline]
    pub fn imm64(value: u64) -> Self {
        Operand::Imm { width: Width::W64, value }
    }

    pub fn width(&self) -> Width {
        match self {
            Operand::Imm { width, .. } | Operand::Reg { width, .. } => *width,
            Operand::Xmm { .. } => Width::W128,
            Operand::Mem(m) => m.width,
        }
    }

    pub fn is_reg(&self, r: Reg) -> bool {
        matches!(self, Operand::Reg { reg, .. } if *reg == r)
    }
}

/// Instruction mnemonic. The set is closed: anything the decoder does not
/// model becomes `Invalid` (and is only fatal if the emulated path reaches
/// it). `HintCall`/`HintRet` are trace-only pseudo-ops that mark inlined
/// call frames and emit no bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mnemonic {
    Mov,
    Lea,
    Add,
    Sub,
    And,
    Or,
    Xor,
    Neg,
    Not,
    Inc,
    Dec,
    Imul,
    Cmp,
    Test,
    Shl,
    Shr,
    Sar,
    Rol,
    Ror,
    Movsx,
    Movzx,
    Push,
    Pop,
    Call,
    Ret,
    Jmp,
    Jcc,
    Cmovcc,
    Setcc,
    Nop,
    // SSE/SSE2 subset; decoded for length and operand shape, captured as
    // pass-through by the emulator.
    Movups,
    Movaps,
    Movss,
    Movsd,
    Addss,
    Addsd,
    Addps,
    Subss,
    Subsd,
    Subps,
    Mulss,
    Mulsd,
    Mulps,
    Divss,
    Divsd,
    Divps,
    Movd,
    Movq,
    Pxor,
    Andps,
    Xorps,
    /// Recognized-by-shape 0F 38 / 0F 3A instruction without a modeled
    /// mnemonic; re-emitted from the recorded opcode bytes.
    SseOther,
    Invalid,
    HintCall,
    HintRet,
}

impl Mnemonic {
    /// True for instructions that end a basic block.
    pub fn is_control_flow(self) -> bool {
        matches!(
            self,
            Mnemonic::Call
                | Mnemonic::Ret
                | Mnemonic::Jmp
                | Mnemonic::Jcc
                | Mnemonic::HintCall
                | Mnemonic::HintRet
        )
    }

    /// True for instructions that write the arithmetic flags.
    pub fn writes_flags(self) -> bool {
        matches!(
            self,
            Mnemonic::Add
                | Mnemonic::Sub
                | Mnemonic::And
                | Mnemonic::Or
                | Mnemonic::Xor
                | Mnemonic::Neg
                | Mnemonic::Inc
                | Mnemonic::Dec
                | Mnemonic::Imul
                | Mnemonic::Cmp
                | Mnemonic::Test
                | Mnemonic::Shl
                | Mnemonic::Shr
                | Mnemonic::Sar
                | Mnemonic::Rol
                | Mnemonic::Ror
        )
    }

    /// True for instructions that read the arithmetic flags.
    pub fn reads_flags(self) -> bool {
        matches!(self, Mnemonic::Jcc | Mnemonic::Cmovcc | Mnemonic::Setcc)
    }
}

/// Legacy prefix set observed (or required) on an instruction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PrefixFlags(u8);

impl PrefixFlags {
    pub const OPSIZE: PrefixFlags = PrefixFlags(1 << 0); // 66
    pub const REPNE: PrefixFlags = PrefixFlags(1 << 1); // F2
    pub const REP: PrefixFlags = PrefixFlags(1 << 2); // F3
    pub const LOCK: PrefixFlags = PrefixFlags(1 << 3); // F0

    #[inline]
    pub fn insert(&mut self, other: PrefixFlags) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn contains(self, other: PrefixFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Operand encoding kind, enough for the generator to rebuild the
/// ModR/M-level byte layout of a recorded instruction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OpEnc {
    /// No operands encoded (RET, NOP 90, pseudo-ops).
    #[default]
    None,
    /// ModR/M, reg field = first operand, r/m = second.
    Rm,
    /// ModR/M, r/m = first operand, reg field = second.
    Mr,
    /// ModR/M with a fixed /digit extension, immediate second operand.
    Mi,
    /// ModR/M with a fixed /digit extension, single r/m operand.
    M,
    /// ModR/M reg + r/m + trailing immediate.
    Rmi,
    /// Register embedded in the opcode byte, immediate operand.
    Oi,
    /// Register embedded in the opcode byte, no immediate.
    O,
    /// Immediate only.
    I,
    /// Relative branch displacement (operand holds the absolute target).
    D,
}

/// Raw encoding payload carried on every decoded instruction so the
/// generator can re-emit it without a per-mnemonic table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Encoding {
    pub prefixes: PrefixFlags,
    /// Recorded opcode bytes (after prefixes/REX), length in `opcode_len`.
    /// A zero length means "no recorded encoding": the encoder falls back
    /// to its canonical opcode table.
    pub opcode: [u8; 3],
    pub opcode_len: u8,
    /// ModR/M reg-field /digit for `Mi`/`M` group opcodes.
    pub ext: Option<u8>,
    pub enc: OpEnc,
}

impl Encoding {
    pub fn recorded(enc: OpEnc, opcode: &[u8]) -> Self {
        let mut op = [0u8; 3];
        op[..opcode.len()].copy_from_slice(opcode);
        Self {
            prefixes: PrefixFlags::default(),
            opcode: op,
            opcode_len: opcode.len() as u8,
            ext: None,
            enc,
        }
    }

    pub fn with_ext(mut self, ext: u8) -> Self {
        self.ext = Some(ext);
        self
    }

    pub fn with_prefixes(mut self, prefixes: PrefixFlags) -> Self {
        self.prefixes = prefixes;
        self
    }

    pub fn opcode_bytes(&self) -> &[u8] {
        &self.opcode[..self.opcode_len as usize]
    }
}

/// One decoded (or synthesized) instruction.
///
/// `addr` is the source address the instruction was decoded from (or the
/// address of the instruction that caused a synthesized one); `len` is its
/// source byte length, zero for synthesized instructions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Inst {
    pub addr: u64,
    pub len: u8,
    pub mnemonic: Mnemonic,
    pub cond: Option<Cond>,
    pub dst: Option<Operand>,
    pub src: Option<Operand>,
    pub src2: Option<Operand>,
    pub enc: Encoding,
    /// State-change hint: set by the emulator when the capture makes the
    /// destination dynamic.
    pub dst_dyn: bool,
}

impl Inst {
    pub fn simple(addr: u64, len: u8, mnemonic: Mnemonic) -> Self {
        Self {
            addr,
            len,
            mnemonic,
            cond: None,
            dst: None,
            src: None,
            src2: None,
            enc: Encoding::default(),
            dst_dyn: false,
        }
    }

    pub fn unary(addr: u64, len: u8, mnemonic: Mnemonic, dst: Operand) -> Self {
        Self {
            dst: Some(dst),
            ..Self::simple(addr, len, mnemonic)
        }
    }

    pub fn binary(addr: u64, len: u8, mnemonic: Mnemonic, dst: Operand, src: Operand) -> Self {
        Self {
            dst: Some(dst),
            src: Some(src),
            ..Self::simple(addr, len, mnemonic)
        }
    }

    pub fn with_enc(mut self, enc: Encoding) -> Self {
        self.enc = enc;
        self
    }

    pub fn with_cond(mut self, cond: Cond) -> Self {
        self.cond = Some(cond);
        self
    }

    /// Absolute branch target for `Jmp`/`Jcc`/`Call` with a direct target.
    pub fn branch_target(&self) -> Option<u64> {
        if !matches!(self.mnemonic, Mnemonic::Jmp | Mnemonic::Jcc | Mnemonic::Call) {
            return None;
        }
        match self.dst {
            Some(Operand::Imm { value, .. }) => Some(value),
            _ => None,
        }
    }

    /// Address of the instruction following this one in the source.
    #[inline]
    pub fn next_addr(&self) -> u64 {
        self.addr.wrapping_add(self.len as u64)
    }
}

/// Ordered instruction list with a capacity chosen at allocation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Trace {
    insts: Vec<Inst>,
}

impl Trace {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            insts: Vec::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn push(&mut self, inst: Inst) {
        self.insts.push(inst);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.insts.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    #[inline]
    pub fn iter(&self) -> std::slice::Iter<'_, Inst> {
        self.insts.iter()
    }

    #[inline]
    pub fn as_slice(&self) -> &[Inst] {
        &self.insts
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [Inst] {
        &mut self.insts
    }

    /// Replace the contents with `kept`, preserving allocation.
    pub fn replace(&mut self, kept: Vec<Inst>) {
        self.insts = kept;
    }

    /// Index of the instruction decoded from `addr`, if any.
    pub fn index_of_addr(&self, addr: u64) -> Option<usize> {
        self.insts.iter().position(|i| i.addr == addr && i.len > 0)
    }
}

impl std::ops::Index<usize> for Trace {
    type Output = Inst;

    fn index(&self, idx: usize) -> &Inst {
        &self.insts[idx]
    }
}

impl<'a> IntoIterator for &'a Trace {
    type Item = &'a Inst;
    type IntoIter = std::slice::Iter<'a, Inst>;

    fn into_iter(self) -> Self::IntoIter {
        self.insts.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reg_encoding_roundtrip() {
        for v in 0..16u8 {
            let r = Reg::from_u4(v).unwrap();
            assert_eq!(r.encoding(), v);
        }
        assert!(Reg::from_u4(16).is_none());
        assert!(Reg::R8.is_extended());
        assert!(!Reg::Rdi.is_extended());
    }

    #[test]
    fn cond_negation() {
        assert_eq!(Cond::E.negate(), Cond::NE);
        assert_eq!(Cond::L.negate(), Cond::GE);
        assert_eq!(Cond::NE.negate(), Cond::E);
    }

    #[test]
    fn branch_target_of_direct_jump() {
        let i = Inst::unary(0x1000, 5, Mnemonic::Jmp, Operand::imm64(0x2000))
            .with_enc(Encoding::recorded(OpEnc::D, &[0xE9]));
        assert_eq!(i.branch_target(), Some(0x2000));
        assert_eq!(i.next_addr(), 0x1005);
    }
}
