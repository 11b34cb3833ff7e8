//! Trace consistency errors

use thiserror::Error;

use crate::types::ValueId;

/// Structural problems found by [`crate::Trace::check_consistency`].
///
/// Producing a malformed trace is a bug upstream; these errors exist so that
/// the bug is reported at compile time instead of as miscompiled code.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TraceError {
    /// An argument refers to a value not yet defined (or defined twice)
    #[error("operation {index} ({opname}) uses {value:?} before it is defined")]
    UndefinedValue {
        /// Operation position
        index: usize,
        /// Opcode name
        opname: &'static str,
        /// Offending value
        value: ValueId,
    },

    /// A value is used after a `LABEL` that does not carry it
    #[error("operation {index} ({opname}) uses {value:?} which is not live across the preceding label")]
    OutOfLabelScope {
        /// Operation position
        index: usize,
        /// Opcode name
        opname: &'static str,
        /// Offending value
        value: ValueId,
    },

    /// A result id was produced twice
    #[error("operation {index} redefines {value:?}")]
    Redefinition {
        /// Operation position
        index: usize,
        /// Offending value
        value: ValueId,
    },

    /// Wrong number of arguments for a fixed-arity opcode
    #[error("operation {index} ({opname}) takes {expected} arguments, got {got}")]
    Arity {
        /// Operation position
        index: usize,
        /// Opcode name
        opname: &'static str,
        /// Expected count
        expected: usize,
        /// Actual count
        got: usize,
    },

    /// Guard without a fail-argument list
    #[error("guard {index} ({opname}) has no fail arguments")]
    MissingFailArgs {
        /// Operation position
        index: usize,
        /// Opcode name
        opname: &'static str,
    },

    /// Non-guard with a fail-argument list
    #[error("operation {index} ({opname}) is not a guard but carries fail arguments")]
    UnexpectedFailArgs {
        /// Operation position
        index: usize,
        /// Opcode name
        opname: &'static str,
    },

    /// Missing or wrong descriptor
    #[error("operation {index} ({opname}) needs {expected}")]
    BadDescr {
        /// Operation position
        index: usize,
        /// Opcode name
        opname: &'static str,
        /// What was expected
        expected: &'static str,
    },

    /// Result slot does not match the opcode's result type
    #[error("operation {index} ({opname}) result slot does not match its type")]
    ResultMismatch {
        /// Operation position
        index: usize,
        /// Opcode name
        opname: &'static str,
    },

    /// The trace does not end in `FINISH` or `JUMP`
    #[error("trace does not end with FINISH or JUMP")]
    MissingTerminal,

    /// `FINISH`/`JUMP` before the end of the trace
    #[error("terminal operation at {index} is not the last operation")]
    TerminalNotLast {
        /// Operation position
        index: usize,
    },
}

/// Result type for trace checks
pub type Result<T> = std::result::Result<T, TraceError>;
