//! x86-64 instruction model, decoder and encoder for the respin rewriter.
//!
//! The decoder turns raw machine bytes into [`inst::Inst`] values; the
//! encoder turns them (or synthesized instructions) back into bytes. Both
//! sides share the operand model in [`inst`], and every decoded instruction
//! carries enough recorded encoding detail that it can be re-emitted
//! without a per-mnemonic table.
//!
//! Decoding is deterministic, allocation-free per instruction, and robust:
//! unknown opcodes become `Invalid` instructions rather than errors, so a
//! caller can carry them through a trace and only fail if it actually needs
//! their semantics.

pub mod decoder;
pub mod display;
pub mod encoder;
pub mod inst;

pub use decoder::{decode_func, decode_one, DecodeError, MAX_INST_LEN};
pub use encoder::{encode, EncodeError};
pub use inst::{
    Cond, Encoding, Inst, MemOperand, Mnemonic, OpEnc, Operand, PrefixFlags, Reg, SegReg, Trace,
    Width,
};
