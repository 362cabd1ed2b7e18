//! The mox optimizing backend core.
//!
//! This crate contains the two parts of the backend whose correctness
//! depends on non-local reasoning rather than per-instruction translation:
//!
//! 1. Parallel move resolution ([moves]) and emission ([emit]): turning the
//!    register allocator's unordered set of simultaneous location
//!    assignments into an ordered, cycle-safe sequence of copies and
//!    exchanges, and driving those through an architecture backend.
//! 2. Deoptimization frame reconstruction ([deopt]): describing, for a
//!    chain of inlined call frames ([env]), exactly how to rebuild the
//!    unoptimized frames so that optimized code can be abandoned mid-flight
//!    with identical observable state.
//!
//! Everything here runs synchronously on the thread compiling one function;
//! no state is shared across compilations except the caller-owned
//! [deopt::DeoptTable].

use thiserror::Error;

pub mod deopt;
pub mod emit;
pub mod env;
pub(crate) mod log;
pub mod moves;
pub mod x64;

/// A failure to compile a function.
///
/// Note: violations of this crate's own invariants are never surfaced as a
/// [CompilationError]. A half-built move schedule or deopt blob cannot be
/// safely used, so those are asserts that abort the compilation outright.
#[derive(Error, Debug)]
pub enum CompilationError {
    #[error("General error: {0}")]
    /// Compilation failed for reasons that might be of interest to someone
    /// embedding mox but not to the end user running a program on it.
    General(String),
    #[error("Internal error: {0}")]
    /// Something went wrong that is probably the result of a bug in mox.
    InternalError(String),
    #[error("Internal error: {0:}")]
    /// An external resource was exhausted: the end user probably wants to
    /// be informed of this.
    ResourceExhausted(Box<dyn std::error::Error>),
}
