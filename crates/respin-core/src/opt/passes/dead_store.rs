//! Removes preparatory `mov reg, imm` captures whose register is
//! overwritten before any read within the same basic block.

use respin_x86::{Inst, Mnemonic, Operand, Reg, Trace, Width};

use crate::opt::blocks;

pub fn run(trace: &mut Trace) -> bool {
    let mut drop = vec![false; trace.len()];
    let mut changed = false;

    for range in blocks(trace) {
        // All registers are conservatively live out of the block.
        let mut live = [true; Reg::COUNT];

        for i in range.rev() {
            let inst = &trace[i];

            if is_droppable_mov_imm(inst) {
                let Some(Operand::Reg { reg, .. }) = inst.dst else {
                    unreachable!()
                };
                if !live[reg.index()] {
                    drop[i] = true;
                    changed = true;
                    continue;
                }
            }

            if let Some(reg) = full_width_reg_write(inst) {
                live[reg.index()] = false;
            }
            for_each_read(inst, |r| {
                if r != Reg::Rip {
                    live[r.index()] = true;
                }
            });
        }
    }

    if changed {
        let kept: Vec<_> = trace
            .iter()
            .enumerate()
            .filter(|(i, _)| !drop[*i])
            .map(|(_, inst)| *inst)
            .collect();
        trace.replace(kept);
    }
    changed
}

/// `mov reg, imm` with no flag effects and a full-width destination.
fn is_droppable_mov_imm(inst: &Inst) -> bool {
    inst.mnemonic == Mnemonic::Mov
        && matches!(inst.src, Some(Operand::Imm { .. }))
        && matches!(
            inst.dst,
            Some(Operand::Reg {
                width: Width::W32 | Width::W64,
                ..
            })
        )
}

/// The register fully overwritten by this instruction, if any. Partial
/// writes (8/16-bit) keep the old upper bits and thus count as reads.
fn full_width_reg_write(inst: &Inst) -> Option<Reg> {
    if matches!(
        inst.mnemonic,
        Mnemonic::Cmp | Mnemonic::Test | Mnemonic::Push
    ) {
        return None;
    }
    match inst.dst {
        Some(Operand::Reg {
            width: Width::W32 | Width::W64,
            reg,
        }) => Some(reg),
        _ => None,
    }
}

fn for_each_read(inst: &Inst, mut f: impl FnMut(Reg)) {
    let reads_dst = !matches!(inst.mnemonic, Mnemonic::Mov | Mnemonic::Lea | Mnemonic::Pop)
        || matches!(
            inst.dst,
            Some(Operand::Reg {
                width: Width::W8 | Width::W16,
                ..
            })
        );

    for (slot, is_dst) in [(inst.dst, true), (inst.src, false), (inst.src2, false)] {
        match slot {
            Some(Operand::Reg { reg, .. }) => {
                if !is_dst || reads_dst {
                    f(reg);
                }
            }
            Some(Operand::Mem(m)) => {
                // Address registers are always consumed.
                if let Some(b) = m.base {
                    f(b);
                }
                if let Some(i) = m.index {
                    f(i);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_overwritten_materialization() {
        let mut t = Trace::default();
        t.push(Inst::binary(
            0,
            0,
            Mnemonic::Mov,
            Operand::reg64(Reg::Rcx),
            Operand::imm64(1),
        ));
        t.push(Inst::binary(
            0,
            0,
            Mnemonic::Mov,
            Operand::reg64(Reg::Rcx),
            Operand::imm64(2),
        ));
        assert!(run(&mut t));
        assert_eq!(t.len(), 1);
        assert_eq!(t[0].src, Some(Operand::imm64(2)));
    }

    #[test]
    fn keeps_mov_read_before_overwrite() {
        let mut t = Trace::default();
        t.push(Inst::binary(
            0,
            0,
            Mnemonic::Mov,
            Operand::reg64(Reg::Rcx),
            Operand::imm64(1),
        ));
        t.push(Inst::binary(
            0,
            0,
            Mnemonic::Add,
            Operand::reg64(Reg::Rax),
            Operand::reg64(Reg::Rcx),
        ));
        t.push(Inst::binary(
            0,
            0,
            Mnemonic::Mov,
            Operand::reg64(Reg::Rcx),
            Operand::imm64(2),
        ));
        assert!(!run(&mut t));
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn liveness_resets_across_blocks() {
        let mut t = Trace::default();
        t.push(Inst::binary(
            0,
            0,
            Mnemonic::Mov,
            Operand::reg64(Reg::Rcx),
            Operand::imm64(1),
        ));
        t.push(Inst::unary(4, 0, Mnemonic::Jmp, Operand::imm64(0x100)));
        t.push(Inst::binary(
            8,
            0,
            Mnemonic::Mov,
            Operand::reg64(Reg::Rcx),
            Operand::imm64(2),
        ));
        // The store before the jump is live-out of its block.
        assert!(!run(&mut t));
    }
}
