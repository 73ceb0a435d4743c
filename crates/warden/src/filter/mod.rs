//! Seccomp-BPF program construction and interpretation.
//!
//! - [`asm`] - an assembler producing verified `sock_filter` programs from
//!   relocatable fragments with symbolic labels
//! - [`eval`] - a userspace interpreter for the same programs, used by the
//!   unotify monitor to re-derive verdicts and by tests to check policy
//!   semantics without installing anything

pub mod asm;
pub mod eval;

pub use asm::{validate, AssembleError, BpfAssembler, Label};
pub use eval::{evaluate, EvalError};
