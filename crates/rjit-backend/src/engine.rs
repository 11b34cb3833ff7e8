//! State shared by a CPU and every piece of code it compiled.
//!
//! Compiled code embeds the address of the [`EngineShared`] and passes it
//! to the runtime helpers, so it lives behind an `Arc` that every code
//! region keeps alive.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use cranelift_codegen::isa::OwnedTargetIsa;
use parking_lot::RwLock;
use rjit_ir::{FailDescr, Type, Value};
use rjit_runtime::{GcLayer, Gil};
use rustc_hash::FxHashMap;

use crate::config::BackendConfig;
use crate::deadframe::Deadframe;

/// Identifier of the final descr used when a called loop returned nothing
pub const DONE_WITH_THIS_FRAME_VOID: i64 = -1;
/// Identifier of the final descr used when a called loop returned an int
pub const DONE_WITH_THIS_FRAME_INT: i64 = -2;
/// Identifier of the final descr used when a called loop returned a ref
pub const DONE_WITH_THIS_FRAME_REF: i64 = -3;
/// Identifier of the final descr used when a called loop returned a float
pub const DONE_WITH_THIS_FRAME_FLOAT: i64 = -4;
/// Identifier of the final descr used when an exception escapes a loop
pub const PROPAGATE_EXCEPTION: i64 = -5;

/// Computes the result of a `CALL_ASSEMBLER` whose callee did not finish
/// through a `done_with_this_frame` descr
pub type AssemblerHelper = Arc<dyn Fn(&Deadframe) -> Value + Send + Sync>;

/// Compilation and freeing counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendStats {
    /// Loops compiled
    pub total_compiled_loops: u64,
    /// Bridges compiled
    pub total_compiled_bridges: u64,
    /// Loops freed
    pub total_freed_loops: u64,
    /// Bridges freed together with their loops
    pub total_freed_bridges: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatCounters {
    pub compiled_loops: AtomicU64,
    pub compiled_bridges: AtomicU64,
    pub freed_loops: AtomicU64,
    pub freed_bridges: AtomicU64,
}

impl StatCounters {
    pub fn snapshot(&self) -> BackendStats {
        BackendStats {
            total_compiled_loops: self.compiled_loops.load(Ordering::Relaxed),
            total_compiled_bridges: self.compiled_bridges.load(Ordering::Relaxed),
            total_freed_loops: self.freed_loops.load(Ordering::Relaxed),
            total_freed_bridges: self.freed_bridges.load(Ordering::Relaxed),
        }
    }
}

pub(crate) struct EngineShared {
    pub id: u64,
    pub config: BackendConfig,
    pub isa: OwnedTargetIsa,
    pub gc: Arc<dyn GcLayer>,
    pub gil: Arc<Gil>,
    pub done_void: Arc<FailDescr>,
    pub done_int: Arc<FailDescr>,
    pub done_ref: Arc<FailDescr>,
    pub done_float: Arc<FailDescr>,
    pub propagate_exception: Arc<FailDescr>,
    pub assembler_helper: RwLock<Option<AssemblerHelper>>,
    pub trampolines: RwLock<FxHashMap<usize, usize>>,
    pub stats: StatCounters,
}

impl EngineShared {
    pub fn new(
        config: BackendConfig,
        isa: OwnedTargetIsa,
        gc: Arc<dyn GcLayer>,
        gil: Arc<Gil>,
    ) -> Self {
        Self {
            id: rjit_runtime::register_engine(),
            config,
            isa,
            gc,
            gil,
            done_void: FailDescr::final_descr(DONE_WITH_THIS_FRAME_VOID),
            done_int: FailDescr::final_descr(DONE_WITH_THIS_FRAME_INT),
            done_ref: FailDescr::final_descr(DONE_WITH_THIS_FRAME_REF),
            done_float: FailDescr::final_descr(DONE_WITH_THIS_FRAME_FLOAT),
            propagate_exception: FailDescr::final_descr(PROPAGATE_EXCEPTION),
            assembler_helper: RwLock::new(None),
            trampolines: RwLock::new(FxHashMap::default()),
            stats: StatCounters::default(),
        }
    }

    pub fn done_with_this_frame(&self, ty: Type) -> &Arc<FailDescr> {
        match ty {
            Type::Void => &self.done_void,
            Type::Int => &self.done_int,
            Type::Ref => &self.done_ref,
            Type::Float => &self.done_float,
        }
    }

    /// Whether `descr` is one of the `done_with_this_frame` descrs
    pub fn is_done_with_this_frame(&self, descr: &Arc<FailDescr>) -> bool {
        [
            &self.done_void,
            &self.done_int,
            &self.done_ref,
            &self.done_float,
        ]
        .into_iter()
        .any(|d| Arc::ptr_eq(d, descr))
    }
}

impl std::fmt::Debug for EngineShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineShared")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("stats", &self.stats)
            .finish()
    }
}
