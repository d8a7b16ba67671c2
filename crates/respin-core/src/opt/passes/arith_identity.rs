//! Drops arithmetic identities: `add r, 0`, `sub r, 0`, `or r, 0`,
//! `and r, -1`. `xor r, r` is kept (the idiomatic zero).

use respin_x86::{Inst, Mnemonic, Operand, Trace, Width};

use crate::alu;

pub fn run(trace: &mut Trace) -> bool {
    let before = trace.len();
    let kept: Vec<_> = trace
        .iter()
        .filter(|inst| !is_identity(inst))
        .copied()
        .collect();
    let changed = kept.len() != before;
    if changed {
        trace.replace(kept);
    }
    changed
}

fn is_identity(inst: &Inst) -> bool {
    let Some(Operand::Reg { width, .. }) = inst.dst else {
        return false;
    };
    let Some(Operand::Imm {
        width: iw,
        value,
    }) = inst.src
    else {
        return false;
    };
    // A 32-bit destination write zero-extends even when the value is
    // unchanged, so 32-bit identities are not removable.
    if width == Width::W32 {
        return false;
    }
    let v = alu::sign_extend(value, iw) as u64 & width.mask();
    match inst.mnemonic {
        Mnemonic::Add | Mnemonic::Sub | Mnemonic::Or => v == 0,
        Mnemonic::And => v == width.mask(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use respin_x86::Reg;

    #[test]
    fn drops_add_zero_and_and_ones() {
        let mut t = Trace::default();
        t.push(Inst::binary(
            0,
            0,
            Mnemonic::Add,
            Operand::reg64(Reg::Rax),
            Operand::imm8(0),
        ));
        t.push(Inst::binary(
            0,
            0,
            Mnemonic::And,
            Operand::reg64(Reg::Rax),
            Operand::imm8(0xFF), // sign-extends to -1
        ));
        t.push(Inst::binary(
            0,
            0,
            Mnemonic::Add,
            Operand::reg64(Reg::Rax),
            Operand::imm8(1),
        ));
        assert!(run(&mut t));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn keeps_xor_zero_idiom() {
        let mut t = Trace::default();
        t.push(Inst::binary(
            0,
            0,
            Mnemonic::Xor,
            Operand::reg32(Reg::Rax),
            Operand::reg32(Reg::Rax),
        ));
        assert!(!run(&mut t));
        assert_eq!(t.len(), 1);
    }
}
