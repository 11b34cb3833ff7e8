//! # rjit IR
//!
//! The trace representation consumed by the rjit backend.
//!
//! ## Design Principles
//!
//! - **Flat**: a trace is an ordered list of [`ResOperation`]s ending in `FINISH` or `JUMP`
//! - **SSA-like**: every result is produced once and referenced by [`ValueId`]
//! - **Side tables**: layout, call and failure metadata live in shared [`Descr`]s
//! - **Explicit layout**: descriptors are built from [`layout`] records, never by reflection

#![warn(clippy::all)]
#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod descr;
pub mod error;
pub mod layout;
pub mod opcode;
pub mod resop;
pub mod token;
pub mod trace;
pub mod types;

pub use descr::{
    ArrayDescr, CallDescr, CardMarking, Descr, FailDescr, FieldDescr, InteriorFieldDescr,
    SizeDescr, WriteBarrierDescr,
};
pub use error::{Result, TraceError};
pub use layout::{
    ArgKind, ArrayLayout, CallConvention, CallSignature, EffectInfo, FieldKind, FieldLayout,
    StructLayout,
};
pub use opcode::OpCode;
pub use resop::{Operand, ResOperation};
pub use token::{BackendData, JitCellToken, TargetToken};
pub use trace::{Trace, TraceBuilder};
pub use types::{Const, GcRef, Type, Value, ValueId};
