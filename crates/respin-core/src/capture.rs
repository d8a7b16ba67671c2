//! The capturing emulator.
//!
//! Consumes a decoded instruction list in program order and maintains the
//! abstract state. Operations whose sources are all static fold into the
//! state and emit nothing; anything touching a dynamic value is captured
//! into the output trace, with static register values substituted as
//! immediates (or materialized with preparatory `mov reg, imm` captures)
//! and static address components folded into displacements.

use respin_x86::{
    Cond, Encoding, Inst, MemOperand, Mnemonic, Operand, Reg, Trace, Width,
};
use tracing::trace;

use crate::alu;
use crate::error::RewriteError;
use crate::state::{AbstractState, FlagValue, Value};

/// Registers the System V ABI allows a callee to clobber.
const CALLER_SAVED: [Reg; 9] = [
    Reg::Rax,
    Reg::Rcx,
    Reg::Rdx,
    Reg::Rsi,
    Reg::Rdi,
    Reg::R8,
    Reg::R9,
    Reg::R10,
    Reg::R11,
];

/// Integer argument registers, in ABI order.
pub const ARG_REGS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];

enum Next {
    Fall,
    Goto(usize),
    End,
}

/// Run the capturing emulator over `decoded`, starting at its first
/// instruction, and return the captured trace.
pub fn run(
    decoded: &Trace,
    state: &mut AbstractState,
    step_budget: u64,
) -> Result<Trace, RewriteError> {
    if decoded.is_empty() {
        return Ok(Trace::default());
    }
    let lo = decoded[0].addr;
    let hi = decoded[decoded.len() - 1].next_addr();
    let entry_sp = state.reg(Reg::Rsp).as_static();
    let mut c = Capturer {
        decoded,
        state,
        out: Trace::with_capacity(decoded.len() + 8),
        lo,
        hi,
        entry_sp,
        inline_frames: Vec::new(),
        steps: 0,
        budget: step_budget,
    };
    c.run()?;
    Ok(c.out)
}

struct Capturer<'a> {
    decoded: &'a Trace,
    state: &'a mut AbstractState,
    out: Trace,
    lo: u64,
    hi: u64,
    /// Stack pointer at entry, for exit-consistency checks.
    entry_sp: Option<u64>,
    /// Return addresses of inlined direct calls, innermost last.
    inline_frames: Vec<u64>,
    steps: u64,
    budget: u64,
}

impl<'a> Capturer<'a> {
    fn run(&mut self) -> Result<(), RewriteError> {
        let mut idx = 0usize;
        loop {
            if idx >= self.decoded.len() {
                // Ran off the decoded range without a terminator: hand
                // control back to the original code.
                self.exit_to_original(self.hi)?;
                self.emit_jmp(self.hi, self.hi);
                return Ok(());
            }
            if self.steps >= self.budget {
                return Err(RewriteError::StepBudget(self.steps));
            }
            self.steps += 1;

            let inst = self.decoded[idx];
            trace!(addr = inst.addr, "step: {inst}");

            let next = match inst.mnemonic {
                Mnemonic::Invalid => return Err(RewriteError::InvalidInstruction(inst.addr)),
                Mnemonic::Nop | Mnemonic::HintCall | Mnemonic::HintRet => Next::Fall,
                Mnemonic::Ret => self.ret(&inst)?,
                Mnemonic::Jmp => self.jmp(&inst)?,
                Mnemonic::Jcc => self.jcc(&inst)?,
                Mnemonic::Call => self.call(&inst)?,
                Mnemonic::Push => {
                    self.push(&inst)?;
                    Next::Fall
                }
                Mnemonic::Pop => {
                    self.pop(&inst)?;
                    Next::Fall
                }
                _ => {
                    self.data_op(&inst)?;
                    Next::Fall
                }
            };

            match next {
                Next::Fall => idx += 1,
                Next::Goto(i) => idx = i,
                Next::End => return Ok(()),
            }
        }
    }

    #[inline]
    fn in_range(&self, addr: u64) -> bool {
        addr >= self.lo && addr < self.hi
    }

    fn index_of(&self, addr: u64) -> Result<usize, RewriteError> {
        self.decoded
            .index_of_addr(addr)
            .ok_or(RewriteError::Unsupported(addr))
    }

    // ---------------------------------------------------------------------
    // Operand classification
    // ---------------------------------------------------------------------

    /// Effective address of a memory operand, static iff every component is.
    fn effective_addr(&self, inst: &Inst, m: &MemOperand) -> Value {
        if m.segment.is_some() {
            // FS/GS-relative: the segment base is unknown to the emulator.
            return Value::Dynamic;
        }
        let mut addr = m.disp as u64;
        match m.base {
            Some(Reg::Rip) => addr = addr.wrapping_add(inst.next_addr()),
            Some(r) => match self.state.reg(r) {
                Value::Static(v) => addr = addr.wrapping_add(v),
                Value::Dynamic => return Value::Dynamic,
            },
            None => {}
        }
        if let Some(r) = m.index {
            match self.state.reg(r) {
                Value::Static(v) => addr = addr.wrapping_add(v.wrapping_mul(m.scale as u64)),
                Value::Dynamic => return Value::Dynamic,
            }
        }
        Value::Static(addr)
    }

    /// Read an operand value. Immediates are sign-extended to 64 bits from
    /// their own width; the consumer masks to the operation width.
    fn read_operand(&self, inst: &Inst, op: &Operand) -> Value {
        match op {
            Operand::Imm { width, value } => {
                Value::Static(alu::sign_extend(*value, *width) as u64)
            }
            Operand::Reg { width, reg } => self.state.read_reg(*reg, *width),
            Operand::Xmm { .. } => Value::Dynamic,
            Operand::Mem(m) => {
                if m.width == Width::W128 {
                    return Value::Dynamic;
                }
                match self.effective_addr(inst, m) {
                    Value::Static(a) if self.state.contains(a, m.width.bytes()) => {
                        self.state.stack_read(a, m.width.bytes())
                    }
                    _ => Value::Dynamic,
                }
            }
        }
    }

    /// Try to fold a write of `v` into the abstract state. Returns false if
    /// the destination cannot absorb the write (store to unknown memory, or
    /// a partial-width write over a dynamic register).
    fn try_fold_write(&mut self, inst: &Inst, dst: &Operand, v: u64) -> bool {
        match dst {
            Operand::Reg { width, reg } => {
                if matches!(width, Width::W8 | Width::W16) && !self.state.reg(*reg).is_static() {
                    return false;
                }
                self.state.write_reg(*reg, *width, Value::Static(v));
                true
            }
            Operand::Mem(m) => match self.effective_addr(inst, m) {
                Value::Static(a)
                    if m.width != Width::W128 && self.state.contains(a, m.width.bytes()) =>
                {
                    self.state.stack_write(a, m.width.bytes(), Value::Static(v));
                    true
                }
                _ => false,
            },
            _ => false,
        }
    }

    fn eval_cond(&self, c: Cond) -> Option<bool> {
        let f = &self.state.flags;
        let b = match c.0 & !1 {
            0x0 => f.of.as_static()?,
            0x2 => f.cf.as_static()?,
            0x4 => f.zf.as_static()?,
            0x6 => f.cf.as_static()? || f.zf.as_static()?,
            0x8 => f.sf.as_static()?,
            0xA => f.pf.as_static()?,
            0xC => f.sf.as_static()? != f.of.as_static()?,
            _ => f.zf.as_static()? || (f.sf.as_static()? != f.of.as_static()?),
        };
        Some(if c.0 & 1 == 1 { !b } else { b })
    }

    // ---------------------------------------------------------------------
    // Control flow
    // ---------------------------------------------------------------------

    fn ret(&mut self, inst: &Inst) -> Result<Next, RewriteError> {
        let extra = match inst.dst {
            Some(Operand::Imm { value, .. }) => value,
            _ => 0,
        };

        if let Value::Static(sp) = self.state.reg(Reg::Rsp) {
            let ra = self.state.stack_read(sp, 8);
            if let (Value::Static(a), Some(&frame)) = (ra, self.inline_frames.last()) {
                if a == frame {
                    self.inline_frames.pop();
                    self.state
                        .set_reg(Reg::Rsp, Value::Static(sp + 8 + extra));
                    self.out.push(Inst::simple(inst.addr, inst.len, Mnemonic::HintRet));
                    return Ok(Next::Goto(self.index_of(a)?));
                }
            }
            if !self.inline_frames.is_empty() {
                return Err(RewriteError::DynamicTarget(inst.addr));
            }
            // The emitted RET pops the caller's real return address, so the
            // runtime stack pointer must sit where it did at entry.
            if self.entry_sp.is_some_and(|e| e != sp) {
                return Err(RewriteError::StackEscape(inst.addr));
            }
        }

        // The return value lives in RAX; a statically known result must be
        // written for real before returning. (RAX is caller-saved, so this
        // is ABI-neutral even for void functions.)
        self.materialize(inst, Reg::Rax)?;
        self.out.push(*inst);
        Ok(Next::End)
    }

    fn jmp(&mut self, inst: &Inst) -> Result<Next, RewriteError> {
        match inst.branch_target() {
            Some(t) if self.in_range(t) => Ok(Next::Goto(self.index_of(t)?)),
            Some(t) => {
                // Tail-jump out of the function: carried through verbatim,
                // the generator re-patches the displacement.
                self.exit_to_original(inst.addr)?;
                self.emit_jmp(inst.addr, t);
                Ok(Next::End)
            }
            None => Err(RewriteError::DynamicTarget(inst.addr)),
        }
    }

    fn jcc(&mut self, inst: &Inst) -> Result<Next, RewriteError> {
        let cond = inst.cond.expect("Jcc carries a condition");
        let target = inst
            .branch_target()
            .ok_or(RewriteError::DynamicTarget(inst.addr))?;

        match self.eval_cond(cond) {
            Some(true) if self.in_range(target) => Ok(Next::Goto(self.index_of(target)?)),
            Some(true) => {
                self.exit_to_original(inst.addr)?;
                self.emit_jmp(inst.addr, target);
                Ok(Next::End)
            }
            Some(false) => Ok(Next::Fall),
            None => {
                // Dynamic condition: the capture ends here. Both edges
                // re-enter code by address; the generator binds targets that
                // exist in the trace and routes the rest to the original.
                // Materializations first: they do not disturb the flags the
                // branch is about to read.
                self.exit_to_original(inst.addr)?;
                self.out.push(*inst);
                self.emit_jmp(inst.addr, inst.next_addr());
                Ok(Next::End)
            }
        }
    }

    /// Leaving the trace for unspecialized code: every statically tracked
    /// register must hold its value for real, and the runtime stack pointer
    /// must be where the original expects it. Statically known flags are
    /// not recreated; compiled code does not keep flags live across the
    /// block boundaries this exit lands on.
    fn exit_to_original(&mut self, at: u64) -> Result<(), RewriteError> {
        if let Value::Static(sp) = self.state.reg(Reg::Rsp) {
            if self.entry_sp.is_some_and(|e| e != sp) {
                return Err(RewriteError::StackEscape(at));
            }
        }
        let probe = Inst::simple(at, 0, Mnemonic::Nop);
        for i in 0..Reg::COUNT as u8 {
            let reg = Reg::from_u4(i).expect("GPR index");
            if reg != Reg::Rsp {
                self.materialize(&probe, reg)?;
            }
        }
        Ok(())
    }

    fn call(&mut self, inst: &Inst) -> Result<Next, RewriteError> {
        let target = match inst.branch_target() {
            Some(t) => t,
            None => return Err(RewriteError::DynamicTarget(inst.addr)),
        };

        if self.in_range(target) {
            if let Value::Static(sp) = self.state.reg(Reg::Rsp) {
                let idx = self.index_of(target)?;
                let ra = inst.next_addr();
                let nsp = sp - 8;
                self.state.set_reg(Reg::Rsp, Value::Static(nsp));
                self.state.stack_write(nsp, 8, Value::Static(ra));
                self.inline_frames.push(ra);
                self.out.push(Inst::simple(inst.addr, inst.len, Mnemonic::HintCall));
                return Ok(Next::Goto(idx));
            }
        }

        // External (or non-inlinable) direct call: the callee may read any
        // argument register, so static ones must hold their values for real.
        for r in [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9, Reg::Rax] {
            self.materialize(inst, r)?;
        }
        self.out.push(*inst);
        for r in CALLER_SAVED {
            self.state.set_reg(r, Value::Dynamic);
        }
        self.state.flags.set_dynamic();
        Ok(Next::Fall)
    }

    /// Append a synthesized unconditional jump to an absolute target.
    fn emit_jmp(&mut self, at: u64, target: u64) {
        self.out
            .push(Inst::unary(at, 0, Mnemonic::Jmp, Operand::imm64(target)));
    }

    // ---------------------------------------------------------------------
    // Stack operations
    // ---------------------------------------------------------------------

    fn push(&mut self, inst: &Inst) -> Result<(), RewriteError> {
        let op = inst.dst.expect("push has an operand");
        let size = if op.width() == Width::W16 { 2 } else { 8 };

        let Value::Static(sp) = self.state.reg(Reg::Rsp) else {
            return self.capture(inst);
        };

        let v = self.read_operand(inst, &op);
        let nsp = sp - size;
        self.state.set_reg(Reg::Rsp, Value::Static(nsp));
        self.state.stack_write(nsp, size, v);
        if v == Value::Dynamic && size == 8 {
            if let Operand::Reg { reg, .. } = op {
                self.state.mark_saved_reg(nsp, reg);
            }
        }
        Ok(())
    }

    fn pop(&mut self, inst: &Inst) -> Result<(), RewriteError> {
        let op = inst.dst.expect("pop has an operand");
        let size = if op.width() == Width::W16 { 2 } else { 8 };

        let Value::Static(sp) = self.state.reg(Reg::Rsp) else {
            return self.capture(inst);
        };

        let v = self.state.stack_read(sp, size);
        match (v, &op) {
            (Value::Static(n), _) => {
                if !self.try_fold_write(inst, &op, n) {
                    return Err(RewriteError::Unsupported(inst.addr));
                }
            }
            (Value::Dynamic, Operand::Reg { reg, .. }) if size == 8 => {
                match self.state.saved_reg(sp) {
                    // The slot still holds exactly the pushed register: a
                    // pop into the same register is a complete no-op, into
                    // another register a plain move.
                    Some(saved) if saved == *reg => {}
                    Some(saved) => {
                        let mut mv = Inst::binary(
                            inst.addr,
                            0,
                            Mnemonic::Mov,
                            Operand::reg64(*reg),
                            Operand::reg64(saved),
                        );
                        mv.dst_dyn = true;
                        self.out.push(mv);
                        self.state.set_reg(*reg, Value::Dynamic);
                    }
                    None => {
                        self.state.set_reg(*reg, Value::Dynamic);
                    }
                }
            }
            (Value::Dynamic, Operand::Reg { reg, .. }) => {
                self.state.write_reg(*reg, op.width(), Value::Dynamic);
            }
            (Value::Dynamic, _) => return Err(RewriteError::Unsupported(inst.addr)),
        }
        self.state.set_reg(Reg::Rsp, Value::Static(sp + size));
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Data operations
    // ---------------------------------------------------------------------

    fn data_op(&mut self, inst: &Inst) -> Result<(), RewriteError> {
        use Mnemonic::*;
        match inst.mnemonic {
            Mov | Lea | Movzx | Movsx => self.fold_move(inst),
            Add | Sub | And | Or | Xor | Cmp | Test | Imul => self.fold_alu(inst),
            Neg | Not | Inc | Dec => self.fold_unary(inst),
            Shl | Shr | Sar | Rol | Ror => self.fold_shift(inst),
            Setcc => self.fold_setcc(inst),
            Cmovcc => self.fold_cmov(inst),
            // SSE family and pass-through shapes are never folded.
            _ => self.capture(inst),
        }
    }

    fn fold_move(&mut self, inst: &Inst) -> Result<(), RewriteError> {
        let dst = inst.dst.expect("move has a destination");
        let src = inst.src.expect("move has a source");

        let v = match (inst.mnemonic, &src) {
            (Mnemonic::Lea, Operand::Mem(m)) => self.effective_addr(inst, m),
            (Mnemonic::Lea, _) => return Err(RewriteError::Unsupported(inst.addr)),
            _ => self.read_operand(inst, &src),
        };

        if let Value::Static(v) = v {
            let v = match inst.mnemonic {
                Mnemonic::Movsx => alu::sign_extend(v & src.width().mask(), src.width()) as u64,
                _ => v,
            };
            if self.try_fold_write(inst, &dst, v) {
                return Ok(());
            }
        }
        self.capture(inst)
    }

    fn fold_alu(&mut self, inst: &Inst) -> Result<(), RewriteError> {
        use Mnemonic::*;
        let dst = inst.dst.expect("alu has a destination");
        let src = inst.src.expect("alu has a source");
        let width = dst.width();

        // Three-operand IMUL multiplies src by src2; otherwise the
        // destination doubles as the left operand.
        let (a, b) = if inst.mnemonic == Imul && inst.src2.is_some() {
            (
                self.read_operand(inst, &src),
                self.read_operand(inst, &inst.src2.unwrap()),
            )
        } else {
            (
                self.read_operand(inst, &dst),
                self.read_operand(inst, &src),
            )
        };

        let (Value::Static(a), Value::Static(b)) = (a, b) else {
            return self.capture(inst);
        };

        let (res, flags) = match inst.mnemonic {
            Add => alu::add(width, a, b),
            Sub | Cmp => alu::sub(width, a, b),
            And | Test => alu::and(width, a, b),
            Or => alu::or(width, a, b),
            Xor => alu::xor(width, a, b),
            Imul => alu::imul(width, a, b),
            _ => unreachable!(),
        };

        if matches!(inst.mnemonic, Cmp | Test) {
            self.state.flags.set_static(flags);
            return Ok(());
        }

        if !self.try_fold_write(inst, &dst, res) {
            return self.capture(inst);
        }

        self.state.flags.set_static(flags);
        if inst.mnemonic == Imul {
            // ZF/SF/PF/AF are architecturally undefined after IMUL.
            self.state.flags.zf = FlagValue::Dynamic;
            self.state.flags.sf = FlagValue::Dynamic;
            self.state.flags.pf = FlagValue::Dynamic;
            self.state.flags.af = FlagValue::Dynamic;
        }
        Ok(())
    }

    fn fold_unary(&mut self, inst: &Inst) -> Result<(), RewriteError> {
        use Mnemonic::*;
        let dst = inst.dst.expect("unary op has a destination");
        let width = dst.width();

        let Value::Static(a) = self.read_operand(inst, &dst) else {
            return self.capture(inst);
        };

        let old_cf = self.state.flags.cf;
        let (res, flags) = match inst.mnemonic {
            Neg => alu::neg(width, a),
            Not => {
                let r = !a & width.mask();
                if self.try_fold_write(inst, &dst, r) {
                    return Ok(()); // NOT leaves all flags untouched
                }
                return self.capture(inst);
            }
            Inc => alu::inc(width, a),
            Dec => alu::dec(width, a),
            _ => unreachable!(),
        };

        if !self.try_fold_write(inst, &dst, res) {
            return self.capture(inst);
        }
        self.state.flags.set_static(flags);
        if matches!(inst.mnemonic, Inc | Dec) {
            self.state.flags.cf = old_cf;
        }
        Ok(())
    }

    fn fold_shift(&mut self, inst: &Inst) -> Result<(), RewriteError> {
        use Mnemonic::*;
        let dst = inst.dst.expect("shift has a destination");
        let src = inst.src.expect("shift has a count");
        let width = dst.width();

        let Value::Static(count) = self.read_operand(inst, &src) else {
            return self.capture(inst);
        };
        let count = alu::mask_count(width, count);
        if count == 0 {
            // A masked count of zero changes nothing, flags included.
            return Ok(());
        }

        let Value::Static(a) = self.read_operand(inst, &dst) else {
            return self.capture(inst);
        };

        let (res, flags) = match inst.mnemonic {
            Shl => alu::shl(width, a, count),
            Shr => alu::shr(width, a, count),
            Sar => alu::sar(width, a, count),
            Rol => alu::rol(width, a, count),
            Ror => alu::ror(width, a, count),
            _ => unreachable!(),
        };

        if !self.try_fold_write(inst, &dst, res) {
            return self.capture(inst);
        }

        if matches!(inst.mnemonic, Rol | Ror) {
            // Rotates only touch CF and OF.
            self.state.flags.cf = FlagValue::Static(flags.cf);
            self.state.flags.of = if count == 1 {
                FlagValue::Static(flags.of)
            } else {
                FlagValue::Dynamic
            };
        } else {
            self.state.flags.set_static(flags);
            self.state.flags.af = FlagValue::Dynamic;
            if count != 1 {
                self.state.flags.of = FlagValue::Dynamic;
            }
        }
        Ok(())
    }

    fn fold_setcc(&mut self, inst: &Inst) -> Result<(), RewriteError> {
        let cond = inst.cond.expect("setcc carries a condition");
        let dst = inst.dst.expect("setcc has a destination");
        match self.eval_cond(cond) {
            Some(taken) => {
                if self.try_fold_write(inst, &dst, taken as u64) {
                    Ok(())
                } else {
                    // The flags are known but were produced by a folded
                    // compare, so the SETcc itself must not run at runtime;
                    // store the known result instead.
                    let mv = Inst::binary(
                        inst.addr,
                        0,
                        Mnemonic::Mov,
                        dst,
                        Operand::imm8(taken as u8),
                    );
                    self.fold_move(&mv)
                }
            }
            None => self.capture(inst),
        }
    }

    fn fold_cmov(&mut self, inst: &Inst) -> Result<(), RewriteError> {
        let cond = inst.cond.expect("cmov carries a condition");
        let dst = inst.dst.expect("cmov has a destination");
        let src = inst.src.expect("cmov has a source");

        match self.eval_cond(cond) {
            // Not taken: the destination keeps its value. (A 32-bit CMOV
            // architecturally still zero-extends; a dynamic 32-bit
            // destination keeps upper-bit garbage here, which only 64-bit
            // reads of a 32-bit result would observe.)
            Some(false) => Ok(()),
            Some(true) => {
                // Condition known taken: behaves exactly like a MOV.
                let mv = Inst::binary(inst.addr, 0, Mnemonic::Mov, dst, src);
                self.fold_move(&mv)
            }
            None => self.capture(inst),
        }
    }

    // ---------------------------------------------------------------------
    // Capture path
    // ---------------------------------------------------------------------

    /// Emit a preparatory `mov reg, imm` for a static register and mark it
    /// dynamic, so a captured instruction can consume it at runtime.
    fn materialize(&mut self, inst: &Inst, reg: Reg) -> Result<(), RewriteError> {
        let Value::Static(v) = self.state.reg(reg) else {
            return Ok(());
        };
        if self.state.contains(v, 1) || reg == Reg::Rsp {
            // Synthetic stack addresses must never reach runtime registers.
            return Err(RewriteError::StackEscape(inst.addr));
        }
        trace!(?reg, value = v, "materialize");
        let mut mv = Inst::binary(
            inst.addr,
            0,
            Mnemonic::Mov,
            Operand::reg64(reg),
            Operand::imm64(v),
        );
        mv.dst_dyn = true;
        self.out.push(mv);
        self.state.set_reg(reg, Value::Dynamic);
        Ok(())
    }

    /// Capture `inst` into the trace: substitute folded operands, emit any
    /// preparatory moves, then emit the instruction and mark its
    /// destination (and written flags) dynamic.
    fn capture(&mut self, inst: &Inst) -> Result<(), RewriteError> {
        use Mnemonic::*;
        let m = inst.mnemonic;
        let mut adj = *inst;
        let mut reshaped = false;

        // Where the destination slot is really a source (PUSH).
        let dst_is_pure_source = m == Push;

        // The destination's original effective address, for post-capture
        // stack tagging.
        let dst_stack_addr = match inst.dst {
            Some(Operand::Mem(mem)) => self
                .effective_addr(inst, &mem)
                .as_static()
                .filter(|a| self.state.contains(*a, mem.width.bytes().min(8))),
            _ => None,
        };

        // 1. Static sources become immediates where the ISA allows it,
        //    otherwise the backing register is materialized.
        if let Some(src) = adj.src {
            if let Some(new) = self.substitute_source(inst, &src, inst.dst.map(|d| d.width()))? {
                adj.src = Some(new);
                reshaped = true;
            }
        }
        if dst_is_pure_source {
            if let Some(dst) = adj.dst {
                if let Some(new) = self.substitute_source(inst, &dst, Some(Width::W64))? {
                    adj.dst = Some(new);
                    reshaped = true;
                }
            }
        }

        // 2. Fold static address components of the remaining memory
        //    operands into their displacements.
        for slot in [&mut adj.dst, &mut adj.src] {
            if let Some(Operand::Mem(mem)) = slot {
                self.fold_mem(inst, mem)?;
            }
        }

        // 3. A destination that is also consumed (read-modify-write,
        //    conditional write, or a partial-width write) must hold its
        //    static value for real before the instruction runs.
        if !dst_is_pure_source {
            if let Some(Operand::Reg { width, reg }) = adj.dst {
                let reads_dst = matches!(m, Add | Sub | And | Or | Xor | Neg | Not | Inc | Dec
                        | Shl | Shr | Sar | Rol | Ror | Cmp | Test | Cmovcc)
                    || (m == Imul && inst.src2.is_none())
                    || matches!(width, Width::W8 | Width::W16);
                if reads_dst {
                    self.materialize(inst, reg)?;
                }
            }
        }

        if reshaped {
            adj.enc = Encoding::default();
        }

        let writes_dst = !matches!(m, Cmp | Test | Push) && adj.dst.is_some();
        adj.dst_dyn = writes_dst;
        trace!("capture: {adj}");
        self.out.push(adj);

        // 4. Destination and written flags become dynamic.
        if writes_dst {
            match adj.dst {
                Some(Operand::Reg { width, reg }) => {
                    self.state.write_reg(reg, width, Value::Dynamic);
                }
                Some(Operand::Mem(mem)) => {
                    if let Some(a) = dst_stack_addr {
                        // Wider-than-8 stores dirty the slot in chunks.
                        let mut off = 0;
                        while off < mem.width.bytes() {
                            let chunk = (mem.width.bytes() - off).min(8);
                            self.state.stack_write(a + off, chunk, Value::Dynamic);
                            off += chunk;
                        }
                    }
                }
                _ => {}
            }
        }
        if m.writes_flags() {
            let old = self.state.flags;
            self.state.flags.set_dynamic();
            match m {
                // INC/DEC leave CF alone; rotates only touch CF/OF.
                Inc | Dec => self.state.flags.cf = old.cf,
                Rol | Ror => {
                    self.state.flags.zf = old.zf;
                    self.state.flags.sf = old.sf;
                    self.state.flags.pf = old.pf;
                    self.state.flags.af = old.af;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// If a source operand reads a static value, rewrite it as an
    /// immediate when the instruction can take one; otherwise materialize
    /// the registers it depends on. Returns the replacement operand.
    fn substitute_source(
        &mut self,
        inst: &Inst,
        src: &Operand,
        dst_width: Option<Width>,
    ) -> Result<Option<Operand>, RewriteError> {
        let v = match src {
            Operand::Imm { .. } | Operand::Xmm { .. } => return Ok(None),
            _ => self.read_operand(inst, src),
        };
        let Value::Static(v) = v else {
            return Ok(None);
        };

        let dst_width = dst_width.unwrap_or_else(|| src.width());
        let dst_is_reg = matches!(inst.dst, Some(Operand::Reg { .. }));

        if imm_allowed(inst.mnemonic) {
            if let Some(imm) = imm_for(v, dst_width, inst.mnemonic, dst_is_reg) {
                return Ok(Some(imm));
            }
        }

        match src {
            Operand::Reg { reg, .. } => {
                self.materialize(inst, *reg)?;
                Ok(None)
            }
            // A static value read out of the folded stack has no runtime
            // home; if it cannot travel as an immediate the capture model
            // cannot express this instruction.
            Operand::Mem(_) => Err(RewriteError::Unsupported(inst.addr)),
            _ => Ok(None),
        }
    }

    /// Fold static components of a memory operand into its displacement.
    /// Addresses inside the abstract stack are rewritten RSP-relative so
    /// the synthetic address range never reaches emitted code.
    fn fold_mem(&mut self, inst: &Inst, m: &mut MemOperand) -> Result<(), RewriteError> {
        if m.segment.is_some() || m.base == Some(Reg::Rip) {
            return Ok(());
        }

        let rsp = self.state.reg(Reg::Rsp).as_static();

        // Fully static address first: stack addresses become RSP-relative,
        // small absolute addresses become bare displacements.
        if let Value::Static(a) = self.effective_addr(inst, m) {
            if self.state.contains(a, 1) {
                if let Some(sp) = rsp {
                    m.base = Some(Reg::Rsp);
                    m.index = None;
                    m.scale = 0;
                    m.disp = a.wrapping_sub(sp) as i64;
                    return Ok(());
                }
            } else if i32::try_from(a as i64).is_ok() {
                m.base = None;
                m.index = None;
                m.scale = 0;
                m.disp = a as i64;
                return Ok(());
            }
        }

        // Partial folds, component by component.
        if let Some(idx) = m.index {
            if let Value::Static(v) = self.state.reg(idx) {
                if self.state.contains(v, 1) {
                    return Err(RewriteError::StackEscape(inst.addr));
                }
                let nd = (m.disp as u64).wrapping_add(v.wrapping_mul(m.scale as u64)) as i64;
                if i32::try_from(nd).is_ok() {
                    m.disp = nd;
                    m.index = None;
                    m.scale = 0;
                } else {
                    self.materialize(inst, idx)?;
                }
            }
        }
        if let Some(base) = m.base {
            if let Value::Static(v) = self.state.reg(base) {
                if self.state.contains(v, 1) {
                    // A stack-pointer-derived base with a dynamic index:
                    // re-anchor on RSP.
                    if let Some(sp) = rsp {
                        m.base = Some(Reg::Rsp);
                        m.disp = (m.disp as u64).wrapping_add(v).wrapping_sub(sp) as i64;
                    } else {
                        return Err(RewriteError::StackEscape(inst.addr));
                    }
                } else {
                    let nd = (m.disp as u64).wrapping_add(v) as i64;
                    if i32::try_from(nd).is_ok() {
                        m.disp = nd;
                        m.base = None;
                    } else {
                        self.materialize(inst, base)?;
                    }
                }
            }
        }

        // Canonicalize [index*1 + disp] to a plain base.
        if m.base.is_none() && m.scale <= 1 {
            if let Some(idx) = m.index.take() {
                m.base = Some(idx);
                m.scale = 0;
            }
        }
        Ok(())
    }
}

/// Instructions whose source slot can be rewritten into an immediate.
fn imm_allowed(m: Mnemonic) -> bool {
    use Mnemonic::*;
    matches!(
        m,
        Mov | Add | Sub | And | Or | Xor | Cmp | Test | Push | Shl | Shr | Sar | Rol | Ror
    )
}

/// Build an immediate operand carrying `v` for an operation of width
/// `width`, if the value survives the encoding's extension rules.
fn imm_for(v: u64, width: Width, m: Mnemonic, dst_is_reg: bool) -> Option<Operand> {
    use Mnemonic::*;

    if matches!(m, Shl | Shr | Sar | Rol | Ror) {
        return Some(Operand::imm8(v as u8));
    }

    let masked = v & width.mask();

    // Only the group-1 ALU opcodes have a sign-extended imm8 form; MOV and
    // TEST take a full-width immediate.
    let has_imm8_form = matches!(m, Add | Sub | And | Or | Xor | Cmp | Push);
    if has_imm8_form
        && width != Width::W8
        && alu::sign_extend(masked & 0xFF, Width::W8) as u64 & width.mask() == masked
    {
        return Some(Operand::imm8(masked as u8));
    }

    match width {
        Width::W8 => Some(Operand::imm8(masked as u8)),
        Width::W16 => Some(Operand::imm(Width::W16, masked)),
        Width::W32 => Some(Operand::imm32(masked as u32)),
        Width::W64 => {
            // imm32 sign-extends to 64 bits at runtime.
            if (masked as i64) == (masked as u32 as i32) as i64 {
                Some(Operand::imm32(masked as u32))
            } else if m == Mov && dst_is_reg {
                // Only `mov r64, imm64` can carry a full 64-bit immediate.
                Some(Operand::imm64(masked))
            } else {
                None
            }
        }
        Width::W128 => None,
    }
}
