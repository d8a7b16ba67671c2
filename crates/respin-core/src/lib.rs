//! Dynamic binary rewriting for x86-64.
//!
//! respin decodes a compiled function in the running process, partially
//! evaluates it against a set of static argument bindings, and emits a
//! specialized copy into executable memory. The pipeline is:
//!
//! 1. decode ([`respin_x86::decoder`])
//! 2. capture: fold static operations, trace everything dynamic
//!    ([`capture`])
//! 3. peephole-optimize the captured trace ([`opt`])
//! 4. re-encode into an executable buffer ([`gen`], [`storage`])
//!
//! The entry point is [`Rewriter`]:
//!
//! ```no_run
//! use respin_core::{Binding, Rewriter};
//!
//! # fn f() -> Result<(), respin_core::RewriteError> {
//! extern "C" fn add(a: u64, b: u64) -> u64 {
//!     a + b
//! }
//!
//! let mut rw = Rewriter::new()?;
//! rw.bind_arg(0, Binding::Static(3))?;
//! rw.bind_arg(1, Binding::Dynamic)?;
//! let fp = add as extern "C" fn(u64, u64) -> u64;
//! let spec = unsafe { rw.specialize(fp as *const u8)? };
//! let add3: extern "C" fn(u64, u64) -> u64 =
//!     unsafe { std::mem::transmute(spec.as_ptr()) };
//! assert_eq!(add3(0, 4), 7);
//! # Ok(()) }
//! ```

pub(crate) mod alu;
pub mod capture;
pub mod error;
pub mod gen;
pub mod opt;
pub mod rewriter;
pub mod state;
pub mod storage;

pub use error::RewriteError;
pub use rewriter::{Binding, Rewriter, RewriterConfig, SpecializedFn};
pub use state::{AbstractState, Value};
pub use storage::CodeStorage;
