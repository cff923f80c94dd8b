//! Fatal errors the pipeline can surface while lowering one function.
//!
//! Selection and allocation are "abort on first error" (no partial MI
//! stream is ever published for a failed function): every fallible
//! operation downstream of `CFGBuilder` returns `Result<_, CodegenError>`
//! and the driver gives up on the current function as soon as one occurs.

use crate::sir::Symbol;
use thiserror::Error;

/// Everything that can make lowering of one function fail.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodegenError {
    /// A selector was asked to lower a SIR node it has no rule for.
    #[error("unsupported operation `{operation}` in function `{function}`")]
    UnsupportedOperation {
        function: Symbol,
        operation: String,
    },

    /// An assignment or symbol reference named a symbol never declared in
    /// scope.
    #[error("undefined symbol `{symbol}` in function `{function}`")]
    UndefinedSymbol { function: Symbol, symbol: Symbol },

    /// An array initializer was evaluated without a target symbol to
    /// allocate its backing frame slot under.
    #[error("array initializer in function `{function}` has no target symbol")]
    MissingContext { function: Symbol },

    /// An array initializer's declared type was not an array type.
    #[error("array initializer in function `{function}` is not array-typed")]
    TypeMismatch { function: Symbol },

    /// A result VR could not be assigned a physical register; results can
    /// never be spilled in place, so this is unconditionally fatal.
    #[error("register allocation failed for function `{function}`: no register available for a result")]
    AllocationFailure { function: Symbol },

    /// A SIR tree violated a caller contract (e.g. a malformed CFG marker).
    /// This is a programming error upstream of this crate, not a condition
    /// a well-formed SIR can trigger.
    #[error("malformed SIR in function `{function}`: {detail}")]
    MalformedSir { function: Symbol, detail: String },
}

/// Convenience alias used throughout the selection and allocation passes.
pub type CodegenResult<T> = Result<T, CodegenError>;
