//! The execution engine interface and its Cranelift implementation.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use rjit_ir::{
    ArrayDescr, ArrayLayout, CallDescr, CallSignature, Descr, FailDescr, FieldDescr, GcRef,
    InteriorFieldDescr, JitCellToken, OpCode, SizeDescr, StructLayout, TargetToken, Trace, Type,
    Value,
};
use rjit_runtime::{GcLayer, Gil, NurseryGc, context_for, retire_engine};

use crate::compiler::{self, CodeRegion, TraceKind};
use crate::config::BackendConfig;
use crate::deadframe::Deadframe;
use crate::descr_cache::DescrCache;
use crate::dispatch;
use crate::engine::{AssemblerHelper, BackendStats, EngineShared};
use crate::error::Result;
use crate::frame;
use crate::looptoken::{GuardRecord, LoopCode};

/// Where compiled code landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompiledInfo {
    /// Address of the first instruction
    pub asmaddr: usize,
    /// Size of the machine code in bytes
    pub asmlen: usize,
    /// Frame slots the token's code needs after this compilation
    pub frame_depth: usize,
}

/// What a compiler backend provides to the tracing JIT.
///
/// Compilation errors are fatal to the caller. Contract violations (wrong
/// argument count or types, bridging a final descr, patching a guard twice)
/// panic. Guard failures are returned as [`Deadframe`]s.
pub trait Cpu: Send + Sync {
    /// Compile `trace` as the loop of `token`
    fn compile_loop(&self, trace: &Trace, token: &Arc<JitCellToken>) -> Result<CompiledInfo>;

    /// Compile `trace` and attach it to the guard of `descr` in `token`'s code.
    ///
    /// The trace's input arguments must match the guard's fail arguments in
    /// order and type.
    fn compile_bridge(
        &self,
        descr: &Arc<FailDescr>,
        trace: &Trace,
        token: &Arc<JitCellToken>,
    ) -> Result<CompiledInfo>;

    /// Run `token`'s loop until a `FINISH` or a guard without bridge
    fn execute_token(&self, token: &Arc<JitCellToken>, args: &[Value]) -> Deadframe;

    /// The guard or finish that produced `deadframe`
    fn get_latest_descr(&self, deadframe: &Deadframe) -> Arc<FailDescr> {
        deadframe.descr().clone()
    }

    /// Integer fail argument `index`
    fn get_int_value(&self, deadframe: &Deadframe, index: usize) -> i64 {
        deadframe.get_int_value(index)
    }

    /// Float fail argument `index`, bit-exact
    fn get_float_value(&self, deadframe: &Deadframe, index: usize) -> f64 {
        deadframe.get_float_value(index)
    }

    /// Reference fail argument `index`
    fn get_ref_value(&self, deadframe: &Deadframe, index: usize) -> GcRef {
        deadframe.get_ref_value(index)
    }

    /// The exception pending when the deadframe was produced, or null
    fn grab_exc_value(&self, deadframe: &Deadframe) -> GcRef {
        deadframe.exc_value()
    }

    /// Materialize the frame of a call in flight.
    ///
    /// # Safety
    ///
    /// `force_token` must be a `FORCE_TOKEN` value of an execution that has
    /// not returned yet.
    unsafe fn force(&self, force_token: i64) -> Deadframe;

    /// Attach interpreter data to the execution of `deadframe`
    fn set_savedata_ref(&self, deadframe: &Deadframe, value: GcRef) {
        deadframe.set_savedata_ref(value);
    }

    /// Data attached with [`Cpu::set_savedata_ref`]
    fn get_savedata_ref(&self, deadframe: &Deadframe) -> GcRef {
        deadframe.savedata_ref()
    }

    /// Make every future `GUARD_NOT_INVALIDATED` of `token`'s code fail
    fn invalidate_loop(&self, token: &JitCellToken);

    /// Make `CALL_ASSEMBLER`s of `old` run `new`'s loop
    fn redirect_call_assembler(&self, old: &JitCellToken, new: &JitCellToken);

    /// Release the loop and every bridge of `token`
    fn free_loop_and_bridges(&self, token: &JitCellToken);

    /// Descriptor of field `name` of `layout`
    fn fielddescrof(&self, layout: &StructLayout, name: &str) -> Arc<FieldDescr>;

    /// Descriptor of the array type `layout`
    fn arraydescrof(&self, layout: &ArrayLayout) -> Arc<ArrayDescr>;

    /// Descriptor of field `name` of the items of `layout`
    fn interiorfielddescrof(&self, layout: &ArrayLayout, name: &str) -> Arc<InteriorFieldDescr>;

    /// Size descriptor of `layout`
    fn sizeof(&self, layout: &StructLayout) -> Arc<SizeDescr>;

    /// Call descriptor of `signature`
    fn calldescrof(&self, signature: &CallSignature) -> Arc<CallDescr>;

    /// Final descr a called loop finishes through when returning a `ty`
    fn done_with_this_frame_descr(&self, ty: Type) -> Arc<FailDescr>;

    /// Final descr a loop finishes through when an exception escapes it
    fn propagate_exception_descr(&self) -> Arc<FailDescr>;
}

/// Guard descrs of `trace`
fn guard_descrs(trace: &Trace) -> impl Iterator<Item = Arc<FailDescr>> + '_ {
    trace
        .operations
        .iter()
        .filter(|op| op.opnum.is_guard())
        .filter_map(|op| op.fail_descr().cloned())
}

/// Target tokens of the labels of `trace`
fn label_targets(trace: &Trace) -> impl Iterator<Item = Arc<TargetToken>> + '_ {
    trace
        .operations
        .iter()
        .filter(|op| op.opnum == OpCode::Label)
        .filter_map(|op| op.descr.as_ref().and_then(Descr::as_target).cloned())
}

/// [`Cpu`] generating native code with Cranelift
pub struct CraneliftCpu {
    shared: Arc<EngineShared>,
    descrs: DescrCache,
}

impl std::fmt::Debug for CraneliftCpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CraneliftCpu")
            .field("shared", &self.shared)
            .field("descrs", &self.descrs.len())
            .finish()
    }
}

impl CraneliftCpu {
    /// CPU for the host using `gc` for allocation and `gil` for release-GIL calls
    pub fn new(config: BackendConfig, gc: Arc<dyn GcLayer>, gil: Arc<Gil>) -> Result<Self> {
        let isa = compiler::build_isa(&config)?;
        tracing::debug!(isa = %isa.triple(), opt_level = ?config.opt_level, "cranelift cpu ready");
        Ok(Self {
            shared: Arc::new(EngineShared::new(config, isa, gc, gil)),
            descrs: DescrCache::new(),
        })
    }

    /// CPU with a [`NurseryGc`] sized from `config` and a fresh lock
    pub fn with_config(config: BackendConfig) -> Result<Self> {
        let gc = Arc::new(NurseryGc::new(config.nursery_config()));
        Self::new(config, gc, Arc::new(Gil::new()))
    }

    /// CPU configured from the `RJIT_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::with_config(BackendConfig::from_env())
    }

    /// Active configuration
    pub fn config(&self) -> &BackendConfig {
        &self.shared.config
    }

    /// The collector compiled code allocates from
    pub fn gc(&self) -> &Arc<dyn GcLayer> {
        &self.shared.gc
    }

    /// The lock released by `CALL_RELEASE_GIL_*`
    pub fn gil(&self) -> &Arc<Gil> {
        &self.shared.gil
    }

    /// Compilation and freeing counters
    pub fn stats(&self) -> BackendStats {
        self.shared.stats.snapshot()
    }

    /// Install the callback computing `CALL_ASSEMBLER` results of loops that
    /// did not finish through a `done_with_this_frame` descr
    pub fn set_assembler_helper(&self, helper: AssemblerHelper) {
        *self.shared.assembler_helper.write() = Some(helper);
    }

    /// Make code compiled from now on call `trampoline` instead of `func`
    pub fn register_trampoline(&self, func: usize, trampoline: usize) {
        tracing::debug!(func, trampoline, "call target substituted");
        self.shared.trampolines.write().insert(func, trampoline);
    }

    /// Frame slots `token`'s code currently needs
    pub fn frame_depth(&self, token: &JitCellToken) -> Option<usize> {
        LoopCode::of(token).map(|code| code.frame_depth())
    }

    /// Bridges attached to `token`'s code
    pub fn bridge_count(&self, token: &JitCellToken) -> usize {
        LoopCode::of(token).map_or(0, |code| code.bridge_count())
    }

    fn loop_code(&self, token: &JitCellToken) -> Arc<LoopCode> {
        LoopCode::of(token)
            .unwrap_or_else(|| panic!("loop {} is not compiled", token.number()))
    }
}

impl Cpu for CraneliftCpu {
    fn compile_loop(&self, trace: &Trace, token: &Arc<JitCellToken>) -> Result<CompiledInfo> {
        assert!(
            !token.backend.is_set(),
            "loop {} is already compiled",
            token.number()
        );
        let region = Arc::new(CodeRegion::new(&self.shared, token.number())?);
        let entry = compiler::compile_trace(&self.shared, &region, trace, TraceKind::Loop)?;
        let info = CompiledInfo {
            asmaddr: entry.code as usize,
            asmlen: entry.code_size,
            frame_depth: entry.frame_depth,
        };
        let code = Arc::new(LoopCode::new(
            self.shared.clone(),
            region,
            entry,
            trace.inputarg_types(),
        ));
        code.remember_guards(guard_descrs(trace));
        code.remember_targets(label_targets(trace));
        token.backend.set(code);
        self.shared
            .stats
            .compiled_loops
            .fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            token = token.number(),
            asmlen = info.asmlen,
            frame_depth = info.frame_depth,
            "loop compiled"
        );
        Ok(info)
    }

    fn compile_bridge(
        &self,
        descr: &Arc<FailDescr>,
        trace: &Trace,
        token: &Arc<JitCellToken>,
    ) -> Result<CompiledInfo> {
        assert!(
            !descr.is_final(),
            "cannot bridge final descr {}",
            descr.identifier()
        );
        let record = descr.backend.get::<GuardRecord>().unwrap_or_else(|| {
            panic!("guard {} was never compiled", descr.identifier())
        });
        // a forced frame continues in the interpreter, never in compiled code
        assert!(
            record.opnum != OpCode::GuardNotForced,
            "cannot bridge guard_not_forced {}",
            descr.identifier()
        );
        assert_eq!(
            trace.inputarg_types(),
            record.types,
            "bridge inputs do not match the fail arguments of guard {}",
            descr.identifier()
        );
        let code = self.loop_code(token);
        let bridge = compiler::compile_trace(&self.shared, &code.region, trace, TraceKind::Bridge)?;
        code.remember_guards(guard_descrs(trace));
        code.remember_targets(label_targets(trace));
        let frame_depth = code.widen_frame(bridge.frame_depth);
        let info = CompiledInfo {
            asmaddr: bridge.code as usize,
            asmlen: bridge.code_size,
            frame_depth,
        };
        code.add_bridge(bridge.clone());
        record.attach_bridge(descr, bridge);
        self.shared
            .stats
            .compiled_bridges
            .fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            token = token.number(),
            guard = descr.identifier(),
            asmlen = info.asmlen,
            frame_depth,
            "bridge attached"
        );
        Ok(info)
    }

    fn execute_token(&self, token: &Arc<JitCellToken>, args: &[Value]) -> Deadframe {
        let code = self.loop_code(token);
        let current = code.resolve();
        let input_types = &current.input_types;
        assert_eq!(
            args.len(),
            input_types.len(),
            "loop {} takes {} arguments, got {}",
            token.number(),
            input_types.len(),
            args.len()
        );
        for (i, (arg, &ty)) in args.iter().zip(input_types).enumerate() {
            assert_eq!(arg.ty(), ty, "argument {i} of loop {} is not of type {ty}", token.number());
        }
        let raw: Vec<u64> = args.iter().map(|v| v.to_bits()).collect();
        // SAFETY: the context belongs to this thread and lives until the
        // thread exits or the CPU is dropped on it.
        let ctx = unsafe { &*context_for(self.shared.id) };
        let _current = ctx.enter();
        dispatch::execute(&self.shared, ctx, &code, &raw)
    }

    unsafe fn force(&self, force_token: i64) -> Deadframe {
        // SAFETY: guaranteed by the caller.
        let frame = unsafe { frame::frame_from_token(force_token) };
        frame.force()
    }

    fn invalidate_loop(&self, token: &JitCellToken) {
        let code = self.loop_code(token);
        code.region.invalidate();
        tracing::debug!(token = token.number(), "loop invalidated");
    }

    fn redirect_call_assembler(&self, old: &JitCellToken, new: &JitCellToken) {
        let old_code = self.loop_code(old);
        let new_code = self.loop_code(new).resolve();
        assert_eq!(
            old_code.input_types, new_code.input_types,
            "redirected loops must take the same arguments"
        );
        old_code.widen_frame(new_code.frame_depth());
        old_code.redirect_to(new_code);
        tracing::debug!(from = old.number(), to = new.number(), "call_assembler redirected");
    }

    fn free_loop_and_bridges(&self, token: &JitCellToken) {
        let Some(code) = token.backend.take::<LoopCode>() else {
            return;
        };
        let bridges = code.release();
        let stats = &self.shared.stats;
        stats.freed_loops.fetch_add(1, Ordering::Relaxed);
        stats
            .freed_bridges
            .fetch_add(bridges as u64, Ordering::Relaxed);
        tracing::debug!(token = token.number(), bridges, "loop freed");
    }

    fn fielddescrof(&self, layout: &StructLayout, name: &str) -> Arc<FieldDescr> {
        self.descrs.field(layout, name)
    }

    fn arraydescrof(&self, layout: &ArrayLayout) -> Arc<ArrayDescr> {
        self.descrs.array(layout)
    }

    fn interiorfielddescrof(&self, layout: &ArrayLayout, name: &str) -> Arc<InteriorFieldDescr> {
        self.descrs.interior_field(layout, name)
    }

    fn sizeof(&self, layout: &StructLayout) -> Arc<SizeDescr> {
        self.descrs.size(layout)
    }

    fn calldescrof(&self, signature: &CallSignature) -> Arc<CallDescr> {
        self.descrs.call(signature)
    }

    fn done_with_this_frame_descr(&self, ty: Type) -> Arc<FailDescr> {
        self.shared.done_with_this_frame(ty).clone()
    }

    fn propagate_exception_descr(&self) -> Arc<FailDescr> {
        self.shared.propagate_exception.clone()
    }
}

impl Drop for CraneliftCpu {
    fn drop(&mut self) {
        retire_engine(self.shared.id);
    }
}
