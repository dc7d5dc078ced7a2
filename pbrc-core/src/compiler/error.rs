//! Compiler Error Types
//!
//! This module provides the error types for the whole toolchain using `thiserror`.
//! Every error is fatal: the pipeline either produces a complete binary image or
//! stops at the first diagnostic. Compilation is batch and re-runnable, so no
//! recovery is ever attempted.
//!
//! # Error Categories
//! - **Front-end errors**: lexing, parsing, and lint diagnostics (carry a line number)
//! - **Resolution errors**: unknown function references during the global pass
//! - **Register pressure**: persistent pools or temporary pools exhausted
//! - **Lowering errors**: operand shapes the code generator cannot express
//! - **Encoding errors**: instruction shapes outside the supported table

use thiserror::Error;

/// Toolchain error types.
///
/// Front-end variants carry the 1-based source line the diagnostic points at.
/// Back-end variants describe the failing function or operand instead, since
/// source positions are no longer available after lowering.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// Invalid token or malformed literal in the character stream.
    #[error("{message} (line {line})")]
    Lex { message: String, line: u32 },

    /// Structurally malformed source (bad tag, unclosed block, bad statement).
    #[error("{message} (line {line})")]
    Parse { message: String, line: u32 },

    /// Valid structure but invalid semantics (types, scopes, arity, nesting).
    #[error("{message} (line {line})")]
    Lint { message: String, line: u32 },

    /// A function reference that is neither locally defined, in the region
    /// table, nor a `FUN_XXXXXXXX` literal.
    #[error("UNKNOWN: {0}")]
    UnknownFunction(String),

    /// More than 18 persistent integer variables in one function.
    #[error("Max. local ints exceeded")]
    MaxLocalInts,

    /// More than 18 persistent float variables in one function.
    #[error("Max. local floats exceeded")]
    MaxLocalFloats,

    /// The temporary allocator ran out of caller-saved registers for a
    /// placeholder. The design deliberately does not spill to memory.
    #[error("No free register for temporary '{0}'")]
    RegisterSpill(String),

    /// An `insert` whose mask bits do not form a single contiguous run.
    #[error("Non-contiguous insertion mask '{0:#x}'")]
    NonContiguousMask(u32),

    /// An operation whose operands are both literals reached the lowerer.
    #[error("Cannot operate between two literals")]
    LiteralOperands,

    /// An AST shape the lowerer cannot express. The linter rejects these
    /// upstream; hitting this means the input AST was not validated.
    #[error("Cannot lower {0}")]
    Lowering(String),

    /// A line that survived resolution but is outside the encoder's table.
    #[error("Unhandled: {0}")]
    Encode(String),
}

impl From<std::io::Error> for CompileError {
    #[cold] // Error paths are cold
    fn from(err: std::io::Error) -> Self {
        CompileError::Parse {
            message: format!("IO error: {}", err),
            line: 0,
        }
    }
}
