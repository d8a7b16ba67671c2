//! The public rewriting surface.
//!
//! A [`Rewriter`] owns one executable storage region and the per-call
//! abstract state; it is configured with argument bindings and invoked once
//! per specialization. Instances are single-threaded; independent instances
//! may run concurrently.

use respin_x86::decoder::decode_func;
use tracing::debug;

use crate::capture::{self, ARG_REGS};
use crate::error::RewriteError;
use crate::gen;
use crate::opt;
use crate::state::{AbstractState, Value};
use crate::storage::CodeStorage;

/// How a specialization argument is bound.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Binding {
    /// The argument is fixed to a known value; uses of it fold away.
    Static(u64),
    /// The argument stays a runtime parameter.
    Dynamic,
}

#[derive(Clone, Copy, Debug)]
pub struct RewriterConfig {
    /// Capacity of the executable region shared by all specializations of
    /// this instance.
    pub code_size: usize,
    /// Size of the abstract stack.
    pub stack_size: usize,
    /// Upper bound on emulated instructions per specialization.
    pub step_budget: u64,
    /// Upper bound on bytes decoded from the input function.
    pub max_decode_bytes: usize,
    /// Stop decoding at the first RET. Disable for functions whose body
    /// (e.g. inlinable helpers) continues past an early return.
    pub stop_at_first_ret: bool,
}

impl Default for RewriterConfig {
    fn default() -> Self {
        Self {
            code_size: 64 * 1024,
            stack_size: 16 * 1024,
            step_budget: 1 << 16,
            max_decode_bytes: 4096,
            stop_at_first_ret: true,
        }
    }
}

/// A generated function. The pointer stays valid until the owning
/// [`Rewriter`] is dropped.
#[derive(Clone, Copy, Debug)]
pub struct SpecializedFn {
    ptr: *const u8,
}

impl SpecializedFn {
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr
    }
}

pub struct Rewriter {
    cfg: RewriterConfig,
    storage: CodeStorage,
    bindings: [Option<Binding>; ARG_REGS.len()],
}

impl Rewriter {
    pub fn new() -> Result<Self, RewriteError> {
        Self::with_config(RewriterConfig::default())
    }

    pub fn with_config(cfg: RewriterConfig) -> Result<Self, RewriteError> {
        Ok(Self {
            cfg,
            storage: CodeStorage::new(cfg.code_size)?,
            bindings: [None; ARG_REGS.len()],
        })
    }

    /// Bind a specialization argument. Indices follow the System V AMD64
    /// integer order: 0→RDI, 1→RSI, 2→RDX, 3→RCX, 4→R8, 5→R9. Rebinding an
    /// index is rejected; unbound arguments default to dynamic.
    pub fn bind_arg(&mut self, index: usize, binding: Binding) -> Result<(), RewriteError> {
        if index >= ARG_REGS.len() {
            return Err(RewriteError::ArgIndexOutOfRange(index));
        }
        if self.bindings[index].is_some() {
            return Err(RewriteError::ArgRebound(index));
        }
        self.bindings[index] = Some(binding);
        Ok(())
    }

    /// Forget all argument bindings (for reusing the instance).
    pub fn clear_bindings(&mut self) {
        self.bindings = [None; ARG_REGS.len()];
    }

    /// Specialize the function at `fn_ptr` against the current bindings and
    /// return a pointer to the generated code, which has the same ABI.
    ///
    /// # Safety
    ///
    /// `fn_ptr` must point to the start of a callable function whose body is
    /// readable for at least `max_decode_bytes` bytes (or up to its final
    /// RET). Calling the returned pointer is itself unsafe and must only
    /// happen while this `Rewriter` is alive.
    pub unsafe fn specialize(&mut self, fn_ptr: *const u8) -> Result<SpecializedFn, RewriteError> {
        let bytes = std::slice::from_raw_parts(fn_ptr, self.cfg.max_decode_bytes);
        let decoded = decode_func(
            bytes,
            fn_ptr as u64,
            self.cfg.max_decode_bytes,
            self.cfg.stop_at_first_ret,
        );
        debug!(
            entry = fn_ptr as usize,
            count = decoded.len(),
            "decoded input function"
        );

        let mut state = AbstractState::new(self.cfg.stack_size);
        for (i, binding) in self.bindings.iter().enumerate() {
            if let Some(Binding::Static(v)) = binding {
                state.set_reg(ARG_REGS[i], Value::Static(*v));
            }
        }

        let mut trace = capture::run(&decoded, &mut state, self.cfg.step_budget)?;
        debug!(captured = trace.len(), "capture complete");

        opt::optimize(&mut trace);

        let ptr = gen::generate(&trace, &mut self.storage)?;
        Ok(SpecializedFn { ptr })
    }
}
