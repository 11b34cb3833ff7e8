//! Backend errors.
//!
//! Only compilation can fail with an error. Guard failures are reported as
//! [`Deadframe`](crate::Deadframe)s and misuse of the API panics.

use cranelift_codegen::CodegenError;
use cranelift_module::ModuleError;
use rjit_ir::TraceError;

/// Errors produced while compiling a loop or bridge.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Cranelift module-level error (definition, finalization, out of memory)
    #[error("cranelift module error: {0}")]
    Module(Box<ModuleError>),

    /// Cranelift rejected the generated function
    #[error("cranelift codegen error: {0}")]
    Codegen(Box<CodegenError>),

    /// The host ISA could not be configured
    #[error("isa initialization failed: {0}")]
    Isa(String),

    /// The trace failed the consistency check
    #[error("malformed trace: {0}")]
    Trace(#[from] TraceError),
}

impl From<ModuleError> for BackendError {
    fn from(value: ModuleError) -> Self {
        Self::Module(Box::new(value))
    }
}

impl From<CodegenError> for BackendError {
    fn from(value: CodegenError) -> Self {
        Self::Codegen(Box::new(value))
    }
}

/// Result type for backend operations
pub type Result<T> = std::result::Result<T, BackendError>;
