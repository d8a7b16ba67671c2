//! Drops `mov r, r` with identical source and destination.

use respin_x86::{Mnemonic, Operand, Trace};

pub fn run(trace: &mut Trace) -> bool {
    let before = trace.len();
    let kept: Vec<_> = trace
        .iter()
        .filter(|inst| !is_self_mov(inst))
        .copied()
        .collect();
    let changed = kept.len() != before;
    if changed {
        trace.replace(kept);
    }
    changed
}

fn is_self_mov(inst: &respin_x86::Inst) -> bool {
    if inst.mnemonic != Mnemonic::Mov {
        return false;
    }
    match (inst.dst, inst.src) {
        (
            Some(Operand::Reg { width: dw, reg: dr }),
            Some(Operand::Reg { width: sw, reg: sr }),
        ) => {
            // A 32-bit self-move still zero-extends, so only wider
            // self-moves are true no-ops.
            dr == sr && dw == sw && dw == respin_x86::Width::W64
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use respin_x86::{Inst, Reg};

    #[test]
    fn drops_only_true_self_moves() {
        let mut t = Trace::default();
        t.push(Inst::binary(
            0,
            0,
            Mnemonic::Mov,
            Operand::reg64(Reg::Rax),
            Operand::reg64(Reg::Rax),
        ));
        t.push(Inst::binary(
            0,
            0,
            Mnemonic::Mov,
            Operand::reg32(Reg::Rax),
            Operand::reg32(Reg::Rax),
        ));
        t.push(Inst::binary(
            0,
            0,
            Mnemonic::Mov,
            Operand::reg64(Reg::Rax),
            Operand::reg64(Reg::Rcx),
        ));
        assert!(run(&mut t));
        // The 32-bit self-move zero-extends and must survive.
        assert_eq!(t.len(), 2);
    }
}
