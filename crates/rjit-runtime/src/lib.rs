//! # rjit runtime
//!
//! Runtime services shared by compiled traces and the host interpreter:
//!
//! - [`ThreadContext`]: per-thread exception, nursery and saved-errno slots
//!   that compiled code addresses by fixed offsets
//! - [`Gil`]: the interpreter lock released around `CALL_RELEASE_GIL_*`
//! - [`errno`]: the `RFFI_*` save/restore protocol
//! - [`GcLayer`]: what compiled code needs from a collector, with
//!   [`NurseryGc`] as the built-in non-moving implementation

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod context;
pub mod errno;
pub mod gc;
pub mod gil;
pub mod nursery;

pub use context::{
    CurrentGuard, ThreadContext, context_for, discard_context, register_engine, retire_engine,
    thread_context_count, with_current,
};
pub use gc::GcLayer;
pub use gil::{Gil, GilGuard};
pub use nursery::{GcStats, NurseryConfig, NurseryGc};
