//! The dispatch loop that runs compiled traces.
//!
//! A trace returns the index of the exit it took. Jumps to labels of other
//! traces and guards patched with a bridge continue here without returning
//! to the caller; a `FINISH` or an unpatched guard ends the execution.

use std::sync::Arc;

use rjit_runtime::ThreadContext;

use crate::deadframe::Deadframe;
use crate::engine::EngineShared;
use crate::frame::JitFrame;
use crate::looptoken::{CompiledTrace, Exit, LoopCode};
use rjit_ir::JitCellToken;

/// Run `code` on a fresh frame holding `args`
pub(crate) fn execute(
    shared: &EngineShared,
    ctx: &ThreadContext,
    code: &Arc<LoopCode>,
    args: &[u64],
) -> Deadframe {
    let code = code.resolve();
    let frame = JitFrame::new(code.frame_depth().max(args.len()));
    frame.write_slots(args);
    run(shared, &frame, ctx, code.entry.clone(), 0)
}

/// Run from `entry` of `trace` until a finish or an unpatched guard
pub(crate) fn run(
    shared: &EngineShared,
    frame: &Arc<JitFrame>,
    ctx: &ThreadContext,
    mut trace: Arc<CompiledTrace>,
    mut entry: u64,
) -> Deadframe {
    loop {
        frame.ensure_depth(trace.frame_depth);
        // SAFETY: the code was compiled with the `TraceFn` signature, the frame
        // holds `frame_depth` slots and both pointers outlive the call.
        let exit = unsafe { (trace.code)(Arc::as_ptr(frame), ctx, entry) } as usize;
        let (next, next_entry) = match &trace.exits[exit] {
            Exit::Finish { descr, types } => {
                if Arc::ptr_eq(descr, &shared.propagate_exception) {
                    frame.capture_exception(ctx);
                }
                let values = frame.read_slots(types.len());
                return Deadframe::new(descr.clone(), types.clone(), values, frame.clone());
            }
            Exit::Guard { descr, record } => match record.bridge() {
                Some(bridge) => {
                    tracing::trace!(guard = descr.identifier(), "entering bridge");
                    (bridge, 0)
                }
                None => {
                    tracing::trace!(guard = descr.identifier(), "guard failed");
                    if record.saves_exception() {
                        frame.capture_exception(ctx);
                    }
                    let values = frame.read_slots(record.types.len());
                    return Deadframe::new(
                        descr.clone(),
                        record.types.clone(),
                        values,
                        frame.clone(),
                    );
                }
            },
            Exit::Jump { trace: target, entry } => {
                let target = target
                    .upgrade()
                    .unwrap_or_else(|| panic!("jump into a loop that was freed"));
                tracing::trace!(entry, "jumping to label");
                (target, *entry)
            }
        };
        trace = next;
        entry = next_entry;
    }
}

/// Body of `CALL_ASSEMBLER`: run `token`'s current loop with the arguments at `args`.
///
/// Returns the raw bits of the callee's result.
pub(crate) fn call_assembler(
    shared: &EngineShared,
    ctx: &ThreadContext,
    token: &JitCellToken,
    args: *const u64,
) -> u64 {
    let code = LoopCode::of(token)
        .unwrap_or_else(|| {
            panic!("call_assembler of loop {} that is not compiled", token.number())
        })
        .resolve();
    // SAFETY: compiled code stores one word per input argument of the callee.
    let args = unsafe { std::slice::from_raw_parts(args, code.input_types.len()) }.to_vec();
    let deadframe = execute(shared, ctx, &code, &args);
    let descr = deadframe.descr();
    if shared.is_done_with_this_frame(descr) {
        return if deadframe.is_empty() {
            0
        } else {
            deadframe.raw_value(0)
        };
    }
    if Arc::ptr_eq(descr, &shared.propagate_exception) {
        ctx.set_exception(deadframe.exc_class(), deadframe.exc_value());
        return 0;
    }
    let helper = shared
        .assembler_helper
        .read()
        .clone()
        .unwrap_or_else(|| {
            panic!(
                "loop {} left through guard {} and no assembler helper is installed",
                token.number(),
                descr.identifier()
            )
        });
    helper(&deadframe).to_bits()
}
