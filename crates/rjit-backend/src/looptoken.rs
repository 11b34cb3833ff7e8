//! Compiled traces and the per-token loop graph.
//!
//! A loop and all of its bridges live in one [`CodeRegion`]. Traces are
//! linked through their exits: a guard exit may be patched once with a
//! bridge, and a jump exit resolves to the trace and entry of its label.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use rjit_ir::{Descr, FailDescr, JitCellToken, OpCode, TargetToken, Type};

use crate::compiler::CodeRegion;
use crate::engine::EngineShared;
use crate::frame::JitFrame;
use rjit_runtime::ThreadContext;

/// `extern "C" fn(frame, ctx, entry) -> exit index`
pub(crate) type TraceFn =
    unsafe extern "C" fn(*const JitFrame, *const ThreadContext, u64) -> u64;

/// Bookkeeping of one compiled guard
pub(crate) struct GuardRecord {
    pub types: Vec<Type>,
    pub opnum: OpCode,
    bridge: RwLock<Option<Arc<CompiledTrace>>>,
}

impl GuardRecord {
    pub fn new(types: Vec<Type>, opnum: OpCode) -> Self {
        Self {
            types,
            opnum,
            bridge: RwLock::new(None),
        }
    }

    pub fn saves_exception(&self) -> bool {
        self.opnum.guard_saves_exception()
    }

    pub fn bridge(&self) -> Option<Arc<CompiledTrace>> {
        self.bridge.read().clone()
    }

    /// Patch the guard; a guard is patched exactly once
    pub fn attach_bridge(&self, descr: &FailDescr, bridge: Arc<CompiledTrace>) {
        let mut slot = self.bridge.write();
        assert!(
            slot.is_none(),
            "guard {} already has a bridge",
            descr.identifier()
        );
        *slot = Some(bridge);
    }

    pub fn detach_bridge(&self) -> Option<Arc<CompiledTrace>> {
        self.bridge.write().take()
    }
}

/// Where a label was compiled
pub(crate) struct LabelBinding {
    pub trace: Weak<CompiledTrace>,
    pub entry: u64,
    pub types: Vec<Type>,
}

pub(crate) enum Exit {
    Finish {
        descr: Arc<FailDescr>,
        types: Vec<Type>,
    },
    Guard {
        descr: Arc<FailDescr>,
        record: Arc<GuardRecord>,
    },
    Jump {
        trace: Weak<CompiledTrace>,
        entry: u64,
    },
}

/// One loop or bridge, ready to run
pub(crate) struct CompiledTrace {
    pub code: TraceFn,
    pub exits: Vec<Exit>,
    pub frame_depth: usize,
    pub code_size: usize,
    pub region: Arc<CodeRegion>,
    /// Descriptors and tokens whose addresses are embedded in the code
    pub _descrs: Vec<Descr>,
    /// Jump targets compiled into other regions
    pub _targets: Vec<Arc<CompiledTrace>>,
}

impl std::fmt::Debug for CompiledTrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledTrace")
            .field("exits", &self.exits.len())
            .field("frame_depth", &self.frame_depth)
            .field("code_size", &self.code_size)
            .finish()
    }
}

/// Everything compiled for one [`JitCellToken`], stored in its backend slot
pub(crate) struct LoopCode {
    pub region: Arc<CodeRegion>,
    pub entry: Arc<CompiledTrace>,
    pub input_types: Vec<Type>,
    pub frame_depth: AtomicUsize,
    redirect: RwLock<Option<Arc<LoopCode>>>,
    bridges: Mutex<Vec<Arc<CompiledTrace>>>,
    guard_descrs: Mutex<Vec<Arc<FailDescr>>>,
    targets: Mutex<Vec<Arc<TargetToken>>>,
    /// Keeps the engine alive while compiled code embeds its address
    _shared: Arc<EngineShared>,
}

impl LoopCode {
    pub fn new(
        shared: Arc<EngineShared>,
        region: Arc<CodeRegion>,
        entry: Arc<CompiledTrace>,
        input_types: Vec<Type>,
    ) -> Self {
        Self {
            frame_depth: AtomicUsize::new(entry.frame_depth),
            region,
            entry,
            input_types,
            redirect: RwLock::new(None),
            bridges: Mutex::new(Vec::new()),
            guard_descrs: Mutex::new(Vec::new()),
            targets: Mutex::new(Vec::new()),
            _shared: shared,
        }
    }

    /// The code of `token`, if compiled
    pub fn of(token: &JitCellToken) -> Option<Arc<LoopCode>> {
        token.backend.get::<LoopCode>()
    }

    /// Follow redirections to the code that currently runs for this token
    pub fn resolve(self: &Arc<Self>) -> Arc<LoopCode> {
        let mut current = self.clone();
        loop {
            let next = current.redirect.read().clone();
            match next {
                Some(next) => current = next,
                None => return current,
            }
        }
    }

    pub fn redirect_to(&self, new: Arc<LoopCode>) {
        *self.redirect.write() = Some(new);
    }

    /// Widen the frame requirement; never shrinks
    pub fn widen_frame(&self, depth: usize) -> usize {
        self.frame_depth.fetch_max(depth, Ordering::AcqRel).max(depth)
    }

    pub fn frame_depth(&self) -> usize {
        self.frame_depth.load(Ordering::Acquire)
    }

    pub fn add_bridge(&self, bridge: Arc<CompiledTrace>) {
        self.bridges.lock().push(bridge);
    }

    pub fn bridge_count(&self) -> usize {
        self.bridges.lock().len()
    }

    pub fn remember_guards(&self, descrs: impl IntoIterator<Item = Arc<FailDescr>>) {
        self.guard_descrs.lock().extend(descrs);
    }

    pub fn remember_targets(&self, targets: impl IntoIterator<Item = Arc<TargetToken>>) {
        self.targets.lock().extend(targets);
    }

    /// Unlink every guard and label of this loop; returns the number of bridges dropped
    pub fn release(&self) -> usize {
        for descr in self.guard_descrs.lock().drain(..) {
            if let Some(record) = descr.backend.take::<GuardRecord>() {
                record.detach_bridge();
            }
        }
        for target in self.targets.lock().drain(..) {
            let owned = target
                .backend
                .get::<LabelBinding>()
                .and_then(|b| b.trace.upgrade())
                .is_none_or(|t| Arc::ptr_eq(&t.region, &self.region));
            if owned {
                target.backend.clear();
            }
        }
        self.redirect.write().take();
        let mut bridges = self.bridges.lock();
        let count = bridges.len();
        bridges.clear();
        count
    }
}
