use respin_x86::EncodeError;
use thiserror::Error;

/// Error surface of the rewriter.
///
/// All fatal conditions abort the current `specialize` call without
/// returning a partial function; the rewriter never retries.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RewriteError {
    #[error("argument index {0} out of range (System V passes 6 integer arguments in registers)")]
    ArgIndexOutOfRange(usize),

    #[error("argument {0} is already bound")]
    ArgRebound(usize),

    #[error("emulated path reached an undecodable instruction at {0:#x}")]
    InvalidInstruction(u64),

    #[error("indirect control transfer with dynamic target at {0:#x}")]
    DynamicTarget(u64),

    #[error("step budget exhausted after {0} instructions")]
    StepBudget(u64),

    #[error("abstract stack address escapes into a captured instruction at {0:#x}")]
    StackEscape(u64),

    #[error("instruction at {0:#x} is outside the capture model")]
    Unsupported(u64),

    #[error("code storage exhausted: need {need} bytes, {avail} available")]
    StorageExhausted { need: usize, avail: usize },

    #[error("executable mapping failed (errno {0})")]
    Map(i32),

    #[error("captured instruction cannot be encoded: {0}")]
    Encode(#[from] EncodeError),
}
