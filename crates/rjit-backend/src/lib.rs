//! # rjit backend
//!
//! Cranelift code generator for rjit traces.
//!
//! [`CraneliftCpu`] implements the [`Cpu`] interface: it compiles loops and
//! bridges into native code, runs them with [`Cpu::execute_token`] and
//! reports guard failures and finishes as [`Deadframe`]s. Every loop token
//! owns one code region holding its loop and all of its bridges.

#![warn(clippy::all)]
#![warn(missing_docs)]

mod compiler;
pub mod config;
mod cpu;
mod deadframe;
mod descr_cache;
mod dispatch;
mod engine;
pub mod error;
mod frame;
mod looptoken;
mod runtime_helpers;
mod translator;

pub use config::{BackendConfig, OptLevel};
pub use cpu::{CompiledInfo, Cpu, CraneliftCpu};
pub use deadframe::Deadframe;
pub use engine::{
    AssemblerHelper, BackendStats, DONE_WITH_THIS_FRAME_FLOAT, DONE_WITH_THIS_FRAME_INT,
    DONE_WITH_THIS_FRAME_REF, DONE_WITH_THIS_FRAME_VOID, PROPAGATE_EXCEPTION,
};
pub use error::{BackendError, Result};
pub use frame::JitFrame;
