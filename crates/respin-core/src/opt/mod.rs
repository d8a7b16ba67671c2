//! Peephole optimization of captured traces.
//!
//! Each pass walks one basic block at a time (blocks end at any
//! control-flow instruction) and returns whether it changed anything; the
//! pipeline iterates to a fixpoint. Passes preserve the source addresses of
//! surviving instructions.

pub mod passes;

use respin_x86::Trace;
use tracing::debug;

const MAX_ROUNDS: usize = 8;

pub fn optimize(trace: &mut Trace) {
    let before = trace.len();
    for _ in 0..MAX_ROUNDS {
        let mut changed = false;
        changed |= passes::redundant_mov::run(trace);
        changed |= passes::arith_identity::run(trace);
        changed |= passes::dead_store::run(trace);
        changed |= passes::flag_liveness::run(trace);
        if !changed {
            break;
        }
    }
    if trace.len() != before {
        debug!(before, after = trace.len(), "optimized trace");
    }
}

/// Iterator over basic-block index ranges of a trace. A block extends up to
/// and including its control-flow terminator.
pub(crate) fn blocks(trace: &Trace) -> Vec<std::ops::Range<usize>> {
    let mut out = Vec::new();
    let mut start = 0;
    for (i, inst) in trace.iter().enumerate() {
        if inst.mnemonic.is_control_flow() {
            out.push(start..i + 1);
            start = i + 1;
        }
    }
    if start < trace.len() {
        out.push(start..trace.len());
    }
    out
}
