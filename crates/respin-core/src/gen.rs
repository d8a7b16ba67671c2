//! Code generation: captured trace → machine bytes in executable storage.
//!
//! Layout is single-shot: every direct branch takes the rel32 form, so
//! instruction sizes are final the moment they are emitted and only branch
//! displacements need a patch pass. Branch targets that match a trace
//! instruction's source address resolve inside the new buffer; all other
//! targets resolve against their original absolute address, which lands
//! back in the unspecialized code (both live in the same address space).

use std::collections::HashMap;

use respin_x86::{encode, encoder, EncodeError, Inst, Mnemonic, Trace};
use tracing::debug;

use crate::error::RewriteError;
use crate::storage::CodeStorage;

struct Patch {
    /// Byte position of the rel32 field in the output buffer.
    pos: usize,
    /// Offset of the first byte after the branch instruction.
    end: usize,
    /// Absolute target address in the source program.
    target: u64,
}

/// Emit `trace` into `storage` and return the entry address of the
/// generated code.
pub fn generate(trace: &Trace, storage: &mut CodeStorage) -> Result<*const u8, RewriteError> {
    let cap = trace.len() * encoder::MAX_ENC_LEN + 16;
    // Validate capacity up front: the base address must be final before any
    // displacement is computed, because the code cannot move afterwards.
    storage.reserve(cap)?;
    let base = storage.tail_addr();

    let mut buf: Vec<u8> = Vec::with_capacity(cap);
    let mut offsets: HashMap<u64, usize> = HashMap::new();
    let mut patches: Vec<Patch> = Vec::new();

    for inst in trace {
        let off = buf.len();
        if inst.len > 0 {
            offsets.entry(inst.addr).or_insert(off);
        }
        match inst.branch_target() {
            Some(target) => emit_branch_long(inst, target, &mut buf, &mut patches)?,
            None => {
                encode(inst, base + off as u64, &mut buf)?;
            }
        }
    }

    for p in patches {
        let rel = match offsets.get(&p.target) {
            Some(&toff) => toff as i64 - p.end as i64,
            None => p.target.wrapping_sub(base.wrapping_add(p.end as u64)) as i64,
        };
        let rel32 =
            i32::try_from(rel).map_err(|_| RewriteError::Encode(EncodeError::BranchOutOfRange))?;
        buf[p.pos..p.pos + 4].copy_from_slice(&rel32.to_le_bytes());
    }

    let dst = storage.reserve(buf.len())?;
    dst.copy_from_slice(&buf);
    let start = storage.commit(buf.len())?;
    debug!(bytes = buf.len(), addr = start as usize, "emitted specialized function");
    Ok(start)
}

/// Emit the rel32 form of a direct branch with a zero placeholder
/// displacement and record the patch.
fn emit_branch_long(
    inst: &Inst,
    target: u64,
    buf: &mut Vec<u8>,
    patches: &mut Vec<Patch>,
) -> Result<(), RewriteError> {
    match inst.mnemonic {
        Mnemonic::Jmp => buf.push(0xE9),
        Mnemonic::Call => buf.push(0xE8),
        Mnemonic::Jcc => {
            let cc = inst
                .cond
                .ok_or(RewriteError::Encode(EncodeError::BadOperands))?;
            buf.push(0x0F);
            buf.push(0x80 | cc.0);
        }
        _ => return Err(RewriteError::Encode(EncodeError::BadOperands)),
    }
    let pos = buf.len();
    buf.extend_from_slice(&[0; 4]);
    patches.push(Patch {
        pos,
        end: buf.len(),
        target,
    });
    Ok(())
}
