//! Removes CMP/TEST instructions whose flags are overwritten before any
//! consumer within the same basic block.

use respin_x86::{Mnemonic, Trace};

use crate::opt::blocks;

pub fn run(trace: &mut Trace) -> bool {
    let mut drop = vec![false; trace.len()];
    let mut changed = false;

    for range in blocks(trace) {
        for i in range.clone() {
            let inst = &trace[i];
            if !matches!(inst.mnemonic, Mnemonic::Cmp | Mnemonic::Test) {
                continue;
            }
            // Scan forward for the next flag event. Only a definite
            // overwrite with no intervening reader makes the flags dead;
            // reaching the end of the block keeps them (conservatively
            // live-out).
            let mut dead = false;
            for j in i + 1..range.end {
                let m = trace[j].mnemonic;
                if m.reads_flags() {
                    break;
                }
                if m.writes_flags() {
                    // INC/DEC and rotates overwrite only part of the flag
                    // set; treat a partial writer as keeping the rest alive.
                    let partial = matches!(
                        m,
                        Mnemonic::Inc | Mnemonic::Dec | Mnemonic::Rol | Mnemonic::Ror
                    );
                    dead = !partial;
                    break;
                }
            }
            if dead {
                drop[i] = true;
                changed = true;
            }
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

#[cfg(test)]
mod tests {
    use super::*;
    use respin_x86::{Cond, Inst, Operand, Reg};

    fn cmp() -> Inst {
        Inst::binary(
            0,
            0,
            Mnemonic::Cmp,
            Operand::reg64(Reg::Rax),
            Operand::reg64(Reg::Rcx),
        )
    }

    #[test]
    fn drops_clobbered_compare() {
        let mut t = Trace::default();
        t.push(cmp());
        t.push(Inst::binary(
            0,
            0,
            Mnemonic::Add,
            Operand::reg64(Reg::Rax),
            Operand::imm8(1),
        ));
        assert!(run(&mut t));
        assert_eq!(t.len(), 1);
        assert_eq!(t[0].mnemonic, Mnemonic::Add);
    }

    #[test]
    fn keeps_compare_with_consumer() {
        let mut t = Trace::default();
        t.push(cmp());
        t.push(Inst::unary(0, 0, Mnemonic::Jcc, Operand::imm64(0x40)).with_cond(Cond::E));
        assert!(!run(&mut t));
    }

    #[test]
    fn keeps_compare_at_block_end() {
        let mut t = Trace::default();
        t.push(cmp());
        assert!(!run(&mut t));
    }
}
