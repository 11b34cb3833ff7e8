//! Runtime helpers called from compiled traces.
//!
//! Slow paths (allocation refills, write barriers, the interpreter lock and
//! nested loop calls) are not inlined. Compiled code calls `extern "C"`
//! helpers imported into each code region by symbol name.
//!
//! # ABI
//!
//! Every parameter and result is a 64-bit integer. Helpers that need the
//! engine take the `EngineShared` address as their first argument and the
//! current `ThreadContext` address as their second.

use cranelift_codegen::ir::{self, AbiParam, types};
use cranelift_codegen::isa::CallConv;
use cranelift_jit::JITBuilder;
use cranelift_module::{FuncId, Linkage, Module};
use rjit_ir::{ArrayDescr, JitCellToken};
use rjit_runtime::{ThreadContext, errno};

use crate::dispatch;
use crate::engine::EngineShared;
use crate::error::Result;

// ---------------------------------------------------------------------------
// Helper kind enumeration
// ---------------------------------------------------------------------------

/// Identifies a runtime helper function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HelperKind {
    /// `(shared, ctx, size) -> addr`
    MallocNursery = 0,
    /// `(shared, ctx, array_descr, length) -> addr`
    MallocArray = 1,
    /// `(shared, obj) -> 0`
    WriteBarrier = 2,
    /// `(shared, obj) -> 0`
    WriteBarrierArray = 3,
    /// `(shared, ctx, saveerr) -> released`
    ReleaseGil = 4,
    /// `(shared, ctx, saveerr, released) -> 0`
    ReacquireGil = 5,
    /// `(shared, ctx, loop_token, args_ptr) -> result bits`
    CallAssembler = 6,
    /// `(addr, len) -> 0`
    ZeroMemory = 7,
}

/// Number of helpers
pub const HELPER_COUNT: usize = 8;

impl HelperKind {
    /// Every helper, indexed by discriminant
    pub const ALL: [HelperKind; HELPER_COUNT] = [
        Self::MallocNursery,
        Self::MallocArray,
        Self::WriteBarrier,
        Self::WriteBarrierArray,
        Self::ReleaseGil,
        Self::ReacquireGil,
        Self::CallAssembler,
        Self::ZeroMemory,
    ];

    /// Symbol under which the helper is registered
    pub fn symbol_name(self) -> &'static str {
        match self {
            Self::MallocNursery => "rjit_rt_malloc_nursery",
            Self::MallocArray => "rjit_rt_malloc_array",
            Self::WriteBarrier => "rjit_rt_write_barrier",
            Self::WriteBarrierArray => "rjit_rt_write_barrier_array",
            Self::ReleaseGil => "rjit_rt_release_gil",
            Self::ReacquireGil => "rjit_rt_reacquire_gil",
            Self::CallAssembler => "rjit_rt_call_assembler",
            Self::ZeroMemory => "rjit_rt_zero_memory",
        }
    }

    /// Number of `i64` parameters
    pub fn param_count(self) -> usize {
        match self {
            Self::WriteBarrier | Self::WriteBarrierArray | Self::ZeroMemory => 2,
            Self::MallocNursery | Self::ReleaseGil => 3,
            Self::MallocArray | Self::ReacquireGil | Self::CallAssembler => 4,
        }
    }

    /// Whether the helper returns a value
    pub fn has_result(self) -> bool {
        matches!(
            self,
            Self::MallocNursery | Self::MallocArray | Self::ReleaseGil | Self::CallAssembler
        )
    }

    fn address(self) -> *const u8 {
        match self {
            Self::MallocNursery => rjit_rt_malloc_nursery as *const u8,
            Self::MallocArray => rjit_rt_malloc_array as *const u8,
            Self::WriteBarrier => rjit_rt_write_barrier as *const u8,
            Self::WriteBarrierArray => rjit_rt_write_barrier_array as *const u8,
            Self::ReleaseGil => rjit_rt_release_gil as *const u8,
            Self::ReacquireGil => rjit_rt_reacquire_gil as *const u8,
            Self::CallAssembler => rjit_rt_call_assembler as *const u8,
            Self::ZeroMemory => rjit_rt_zero_memory as *const u8,
        }
    }

    /// Cranelift signature of the helper
    pub fn make_signature(self, call_conv: CallConv) -> ir::Signature {
        let mut sig = ir::Signature::new(call_conv);
        for _ in 0..self.param_count() {
            sig.params.push(AbiParam::new(types::I64));
        }
        if self.has_result() {
            sig.returns.push(AbiParam::new(types::I64));
        }
        sig
    }
}

/// Make every helper resolvable by the module built from `builder`
pub fn register_symbols(builder: &mut JITBuilder) {
    for kind in HelperKind::ALL {
        builder.symbol(kind.symbol_name(), kind.address());
    }
}

// ---------------------------------------------------------------------------
// Per-module and per-function references
// ---------------------------------------------------------------------------

/// Helper declarations inside one module
#[derive(Debug, Clone, Copy)]
pub struct HelperFuncIds {
    ids: [FuncId; HELPER_COUNT],
}

impl HelperFuncIds {
    /// Declare every helper as an import of `module`
    pub fn declare(module: &mut impl Module) -> Result<Self> {
        let call_conv = module.isa().default_call_conv();
        let mut ids = Vec::with_capacity(HELPER_COUNT);
        for kind in HelperKind::ALL {
            let sig = kind.make_signature(call_conv);
            ids.push(module.declare_function(kind.symbol_name(), Linkage::Import, &sig)?);
        }
        let ids: [FuncId; HELPER_COUNT] = ids
            .try_into()
            .unwrap_or_else(|_| unreachable!("one id per helper"));
        Ok(Self { ids })
    }
}

/// Helper references usable inside one function
#[derive(Debug, Clone, Copy)]
pub struct HelperRefs {
    refs: [ir::FuncRef; HELPER_COUNT],
}

impl HelperRefs {
    /// Import every helper into `func`
    pub fn declare(ids: &HelperFuncIds, module: &mut impl Module, func: &mut ir::Function) -> Self {
        let refs = ids.ids.map(|id| module.declare_func_in_func(id, func));
        Self { refs }
    }

    /// Reference to `kind`
    pub fn get(&self, kind: HelperKind) -> ir::FuncRef {
        self.refs[kind as usize]
    }
}

// ---------------------------------------------------------------------------
// Implementations
// ---------------------------------------------------------------------------

/// Recover the engine and context passed by compiled code.
///
/// # Safety
///
/// Both pointers must be the values compiled code received; the engine is
/// kept alive by the code region and the context by the running execution.
unsafe fn engine_and_ctx<'a>(
    shared: *const EngineShared,
    ctx: *const ThreadContext,
) -> (&'a EngineShared, &'a ThreadContext) {
    // SAFETY: guaranteed by the caller.
    unsafe { (&*shared, &*ctx) }
}

extern "C" fn rjit_rt_malloc_nursery(
    shared: *const EngineShared,
    ctx: *const ThreadContext,
    size: u64,
) -> u64 {
    // SAFETY: called from compiled code with its own engine and context.
    let (shared, ctx) = unsafe { engine_and_ctx(shared, ctx) };
    shared.gc.malloc_nursery_slowpath(ctx, size as usize) as u64
}

extern "C" fn rjit_rt_malloc_array(
    shared: *const EngineShared,
    ctx: *const ThreadContext,
    descr: *const ArrayDescr,
    length: i64,
) -> u64 {
    // SAFETY: called from compiled code with its own engine and context.
    let (shared, ctx) = unsafe { engine_and_ctx(shared, ctx) };
    assert!(length >= 0, "negative array length {length}");
    // SAFETY: the descr is kept alive by the compiled trace.
    let descr = unsafe { &*descr };
    shared.gc.malloc_array(ctx, descr, length as usize) as u64
}

extern "C" fn rjit_rt_write_barrier(shared: *const EngineShared, obj: u64) {
    // SAFETY: the engine outlives its compiled code.
    let shared = unsafe { &*shared };
    shared.gc.write_barrier(obj as usize);
}

extern "C" fn rjit_rt_write_barrier_array(shared: *const EngineShared, obj: u64) {
    // SAFETY: the engine outlives its compiled code.
    let shared = unsafe { &*shared };
    shared.gc.write_barrier_array(obj as usize);
}

extern "C" fn rjit_rt_release_gil(
    shared: *const EngineShared,
    ctx: *const ThreadContext,
    saveerr: i64,
) -> u64 {
    // SAFETY: called from compiled code with its own engine and context.
    let (shared, ctx) = unsafe { engine_and_ctx(shared, ctx) };
    let released = shared.gil.release();
    errno::before_call(ctx, saveerr);
    u64::from(released)
}

extern "C" fn rjit_rt_reacquire_gil(
    shared: *const EngineShared,
    ctx: *const ThreadContext,
    saveerr: i64,
    released: u64,
) {
    // SAFETY: called from compiled code with its own engine and context.
    let (shared, ctx) = unsafe { engine_and_ctx(shared, ctx) };
    errno::after_call(ctx, saveerr);
    if released != 0 {
        shared.gil.reacquire();
    }
}

extern "C" fn rjit_rt_call_assembler(
    shared: *const EngineShared,
    ctx: *const ThreadContext,
    token: *const JitCellToken,
    args: *const u64,
) -> u64 {
    // SAFETY: called from compiled code with its own engine and context.
    let (shared, ctx) = unsafe { engine_and_ctx(shared, ctx) };
    // SAFETY: the token is kept alive by the calling trace.
    let token = unsafe { &*token };
    dispatch::call_assembler(shared, ctx, token, args)
}

extern "C" fn rjit_rt_zero_memory(addr: u64, len: u64) {
    if len != 0 {
        // SAFETY: compiled code passes a range inside a live object.
        unsafe { std::ptr::write_bytes(addr as *mut u8, 0, len as usize) }
    }
}
