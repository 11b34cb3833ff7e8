//! Code regions and the Cranelift compilation pipeline.
//!
//! Each loop token gets its own [`CodeRegion`]: one `JITModule` holding the
//! loop and every bridge later attached to it. The region is freed, code
//! memory included, once nothing references any of its traces.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use cranelift_codegen::ir::{AbiParam, UserFuncName, types};
use cranelift_codegen::isa::OwnedTargetIsa;
use cranelift_codegen::settings::{self, Configurable};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{Linkage, Module, default_libcall_names};
use parking_lot::Mutex;
use rjit_ir::{Descr, Trace};

use crate::config::BackendConfig;
use crate::engine::EngineShared;
use crate::error::{BackendError, Result};
use crate::looptoken::{CompiledTrace, Exit, GuardRecord, LabelBinding, TraceFn};
use crate::runtime_helpers::{self, HelperFuncIds, HelperRefs};
use crate::translator::{self, ExitSpec, TranslateEnv};

#[cfg(not(target_pointer_width = "64"))]
compile_error!("rjit-backend supports 64-bit targets only");

/// Build the host ISA from the configuration
pub(crate) fn build_isa(config: &BackendConfig) -> Result<OwnedTargetIsa> {
    let isa_err = |e: &dyn std::fmt::Display| BackendError::Isa(e.to_string());
    let mut flags = settings::builder();
    flags
        .set("opt_level", config.opt_level.as_setting())
        .map_err(|e| isa_err(&e))?;
    flags
        .set(
            "enable_verifier",
            if config.verify_traces { "true" } else { "false" },
        )
        .map_err(|e| isa_err(&e))?;
    flags.set("is_pic", "false").map_err(|e| isa_err(&e))?;
    flags
        .set("use_colocated_libcalls", "false")
        .map_err(|e| isa_err(&e))?;
    let isa_builder = cranelift_native::builder().map_err(|e| isa_err(&e))?;
    isa_builder
        .finish(settings::Flags::new(flags))
        .map_err(|e| isa_err(&e))
}

struct RegionModule {
    module: JITModule,
    helper_ids: HelperFuncIds,
    builder_ctx: FunctionBuilderContext,
    context: cranelift_codegen::Context,
    next_function: u32,
}

// SAFETY: the module is only touched under the region's mutex.
unsafe impl Send for RegionModule {}

/// Executable memory owned by one loop token
pub(crate) struct CodeRegion {
    token_number: u64,
    module: Mutex<Option<RegionModule>>,
    /// Non-zero once the loop was invalidated; read by `GUARD_NOT_INVALIDATED`
    invalidated: Box<AtomicU64>,
}

impl CodeRegion {
    pub fn new(shared: &EngineShared, token_number: u64) -> Result<Self> {
        let mut builder = JITBuilder::with_isa(shared.isa.clone(), default_libcall_names());
        runtime_helpers::register_symbols(&mut builder);
        let mut module = JITModule::new(builder);
        let helper_ids = HelperFuncIds::declare(&mut module)?;
        Ok(Self {
            token_number,
            module: Mutex::new(Some(RegionModule {
                module,
                helper_ids,
                builder_ctx: FunctionBuilderContext::new(),
                context: cranelift_codegen::Context::new(),
                next_function: 0,
            })),
            invalidated: Box::new(AtomicU64::new(0)),
        })
    }

    pub fn invalidate(&self) {
        self.invalidated.store(1, Ordering::Release);
    }

    fn invalidated_addr(&self) -> usize {
        &*self.invalidated as *const AtomicU64 as usize
    }
}

impl Drop for CodeRegion {
    fn drop(&mut self) {
        if let Some(region) = self.module.get_mut().take() {
            tracing::debug!(token = self.token_number, "freeing code region");
            // SAFETY: no trace of this region is referenced any more.
            unsafe { region.module.free_memory() };
        }
    }
}

/// Whether the trace is a loop or a bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TraceKind {
    Loop,
    Bridge,
}

/// Compile `trace` into `region` and link its labels and exits
pub(crate) fn compile_trace(
    shared: &Arc<EngineShared>,
    region: &Arc<CodeRegion>,
    trace: &Trace,
    kind: TraceKind,
) -> Result<Arc<CompiledTrace>> {
    if shared.config.verify_traces {
        trace.check_consistency()?;
    }

    let mut guard = region.module.lock();
    let Some(rm) = guard.as_mut() else {
        unreachable!("code region used after free")
    };

    let mut signature = rm.module.make_signature();
    // Signature: (frame: I64, ctx: I64, entry: I64) -> I64
    signature.params.push(AbiParam::new(types::I64));
    signature.params.push(AbiParam::new(types::I64));
    signature.params.push(AbiParam::new(types::I64));
    signature.returns.push(AbiParam::new(types::I64));

    let name = format!(
        "rjit_{}_{}_{}",
        match kind {
            TraceKind::Loop => "loop",
            TraceKind::Bridge => "bridge",
        },
        region.token_number,
        rm.next_function
    );
    rm.next_function += 1;
    let func_id = rm
        .module
        .declare_function(&name, Linkage::Local, &signature)?;

    rm.context.func = cranelift_codegen::ir::Function::with_name_signature(
        UserFuncName::user(0, func_id.as_u32()),
        signature,
    );
    let helpers = HelperRefs::declare(&rm.helper_ids, &mut rm.module, &mut rm.context.func);

    let env = TranslateEnv {
        shared: Arc::as_ptr(shared) as usize,
        gc: shared.gc.as_ref(),
        invalidated_addr: region.invalidated_addr(),
        call_conv: rm.module.isa().default_call_conv(),
        helpers,
        trampolines: &shared.trampolines.read(),
    };
    let translation = {
        let mut builder = FunctionBuilder::new(&mut rm.context.func, &mut rm.builder_ctx);
        let t = translator::translate_trace(&mut builder, &env, trace);
        builder.finalize();
        t
    };

    if let Err(err) = rm.module.define_function(func_id, &mut rm.context) {
        rm.module.clear_context(&mut rm.context);
        return Err(err.into());
    }
    let code_size = rm
        .context
        .compiled_code()
        .map(|c| c.code_buffer().len())
        .unwrap_or(0);
    rm.module.clear_context(&mut rm.context);
    rm.module.finalize_definitions()?;
    let code_ptr = rm.module.get_finalized_function(func_id);
    drop(guard);

    // SAFETY: the function was declared with the `TraceFn` signature.
    let code = unsafe { std::mem::transmute::<*const u8, TraceFn>(code_ptr) };

    let mut targets = Vec::new();
    let mut guard_descrs = Vec::new();
    let exits = translation
        .exits
        .into_iter()
        .map(|spec| match spec {
            ExitSpec::Finish { descr, types } => Exit::Finish { descr, types },
            ExitSpec::Guard {
                descr,
                types,
                opnum,
            } => {
                descr.record_fail_arg_types(types.clone());
                let record = Arc::new(GuardRecord::new(types, opnum));
                guard_descrs.push((descr.clone(), record.clone()));
                Exit::Guard { descr, record }
            }
            ExitSpec::Jump { target, types } => {
                let binding = target.backend.get::<LabelBinding>().unwrap_or_else(|| {
                    panic!("jump to label {} that was never compiled", target.number())
                });
                assert_eq!(
                    binding.types,
                    types,
                    "jump arguments do not match label {}",
                    target.number()
                );
                if let Some(t) = binding.trace.upgrade()
                    && !Arc::ptr_eq(&t.region, region)
                {
                    targets.push(t);
                }
                Exit::Jump {
                    trace: binding.trace.clone(),
                    entry: binding.entry,
                }
            }
        })
        .collect();

    let compiled = Arc::new(CompiledTrace {
        code,
        exits,
        frame_depth: translation.frame_depth,
        code_size,
        region: region.clone(),
        _descrs: embedded_descrs(trace),
        _targets: targets,
    });

    for (descr, record) in guard_descrs {
        descr.backend.set(record);
    }
    for label in translation.labels {
        label.target.backend.set(Arc::new(LabelBinding {
            trace: Arc::downgrade(&compiled),
            entry: label.entry,
            types: label.types,
        }));
    }

    tracing::debug!(
        token = region.token_number,
        kind = ?kind,
        ops = trace.operations.len(),
        code_size,
        frame_depth = compiled.frame_depth,
        "compiled trace"
    );
    Ok(compiled)
}

/// Descriptors whose addresses a trace embeds, so they outlive its code
pub(crate) fn embedded_descrs(trace: &Trace) -> Vec<Descr> {
    trace
        .operations
        .iter()
        .filter_map(|op| op.descr.clone())
        .collect()
}
