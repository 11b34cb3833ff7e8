//! Jit frames: the value slots shared by compiled traces and the runtime.
//!
//! Every `execute_token` call owns one [`JitFrame`]. Traces read their
//! entry values from the slots and write exit values back into them; the
//! dispatcher grows the slot array between trace calls whenever the next
//! trace needs more room than the frame has.
//!
//! The address of a frame doubles as the `FORCE_TOKEN` value handed to
//! code that may later need to force it.

use std::cell::UnsafeCell;
use std::mem::offset_of;
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use rjit_ir::{FailDescr, GcRef, Type};
use rjit_runtime::ThreadContext;

use crate::deadframe::Deadframe;

/// Value storage of one execution.
#[repr(C)]
pub struct JitFrame {
    slots: AtomicPtr<u64>,
    force_descr: AtomicUsize,
    forced: AtomicU64,
    storage: UnsafeCell<Vec<u64>>,
    guard_exc: Mutex<(usize, GcRef)>,
    savedata: Mutex<GcRef>,
    forced_state: Mutex<Option<ForcedState>>,
}

struct ForcedState {
    descr: Arc<FailDescr>,
    types: Vec<Type>,
    values: Vec<u64>,
}

// SAFETY: `storage` is resized only by the executing thread between trace
// calls. Other threads touch the slots only through `force`, which runs while
// the executing thread is parked in a native call and reads slots written
// before the interpreter lock was released.
unsafe impl Send for JitFrame {}
// SAFETY: see above.
unsafe impl Sync for JitFrame {}

/// Offset of the slot array pointer
pub const FRAME_SLOTS_OFFSET: i32 = offset_of!(JitFrame, slots) as i32;
/// Offset of the descr of the `GUARD_NOT_FORCED` following the call in flight
pub const FRAME_FORCE_DESCR_OFFSET: i32 = offset_of!(JitFrame, force_descr) as i32;
/// Offset of the forced flag tested by `GUARD_NOT_FORCED`
pub const FRAME_FORCED_OFFSET: i32 = offset_of!(JitFrame, forced) as i32;

impl std::fmt::Debug for JitFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitFrame")
            .field("depth", &self.depth())
            .field("forced", &self.is_forced())
            .finish()
    }
}

impl JitFrame {
    pub(crate) fn new(depth: usize) -> Arc<Self> {
        let mut storage = vec![0u64; depth.max(1)];
        let slots = AtomicPtr::new(storage.as_mut_ptr());
        Arc::new(Self {
            slots,
            force_descr: AtomicUsize::new(0),
            forced: AtomicU64::new(0),
            storage: UnsafeCell::new(storage),
            guard_exc: Mutex::new((0, GcRef::NULL)),
            savedata: Mutex::new(GcRef::NULL),
            forced_state: Mutex::new(None),
        })
    }

    /// Number of slots
    pub fn depth(&self) -> usize {
        // SAFETY: length reads race only with `ensure_depth`, which runs on
        // the executing thread.
        unsafe { (*self.storage.get()).len() }
    }

    /// Grow to at least `depth` slots; existing values are kept
    pub(crate) fn ensure_depth(&self, depth: usize) {
        // SAFETY: called by the executing thread outside compiled code.
        let storage = unsafe { &mut *self.storage.get() };
        if storage.len() < depth {
            tracing::trace!(from = storage.len(), to = depth, "growing jit frame");
            storage.resize(depth, 0);
            self.slots.store(storage.as_mut_ptr(), Ordering::Release);
        }
    }

    pub(crate) fn write_slots(&self, values: &[u64]) {
        self.ensure_depth(values.len());
        let base = self.slots.load(Ordering::Acquire);
        for (i, &v) in values.iter().enumerate() {
            // SAFETY: the frame holds at least `values.len()` slots.
            unsafe { *base.add(i) = v };
        }
    }

    pub(crate) fn read_slots(&self, count: usize) -> Vec<u64> {
        assert!(count <= self.depth(), "reading {count} slots of a smaller frame");
        let base = self.slots.load(Ordering::Acquire);
        // SAFETY: bounds checked above.
        (0..count).map(|i| unsafe { *base.add(i) }).collect()
    }

    /// Value of `FORCE_TOKEN` for this frame
    pub fn force_token(self: &Arc<Self>) -> i64 {
        Arc::as_ptr(self) as usize as i64
    }

    /// Whether the frame was forced
    pub fn is_forced(&self) -> bool {
        self.forced.load(Ordering::Acquire) != 0
    }

    pub(crate) fn capture_exception(&self, ctx: &ThreadContext) {
        let (class, value) = ctx.take_exception();
        if class != 0 {
            *self.guard_exc.lock() = (class, value);
        }
    }

    pub(crate) fn guard_exc(&self) -> (usize, GcRef) {
        *self.guard_exc.lock()
    }

    pub(crate) fn savedata(&self) -> GcRef {
        *self.savedata.lock()
    }

    pub(crate) fn set_savedata(&self, value: GcRef) {
        *self.savedata.lock() = value;
    }

    /// Materialize the frame of a call in flight.
    ///
    /// Returns the deadframe its `GUARD_NOT_FORCED` would produce, built from
    /// the values stored before the call; the guard fails once the call
    /// returns. Forcing again returns the same values.
    pub(crate) fn force(self: &Arc<Self>) -> Deadframe {
        let mut state = self.forced_state.lock();
        if state.is_none() {
            let ptr = self.force_descr.load(Ordering::Acquire) as *const FailDescr;
            assert!(!ptr.is_null(), "frame has no call in flight that may force it");
            // SAFETY: the descr is kept alive by the compiled trace that
            // stored it, and that trace is running.
            let descr = unsafe {
                Arc::increment_strong_count(ptr);
                Arc::from_raw(ptr)
            };
            let types = descr
                .fail_arg_types()
                .unwrap_or_else(|| panic!("guard {} was never compiled", descr.identifier()))
                .to_vec();
            let values = self.read_slots(types.len());
            tracing::debug!(guard = descr.identifier(), "frame forced");
            *state = Some(ForcedState {
                descr,
                types,
                values,
            });
            self.forced.store(1, Ordering::Release);
        }
        let Some(forced) = state.as_ref() else {
            unreachable!("forced state set above")
        };
        Deadframe::new(
            forced.descr.clone(),
            forced.types.clone(),
            forced.values.clone(),
            self.clone(),
        )
    }
}

/// Recover the frame behind a `FORCE_TOKEN` value.
///
/// # Safety
///
/// `token` must come from `FORCE_TOKEN` of an execution that is still running.
pub(crate) unsafe fn frame_from_token(token: i64) -> Arc<JitFrame> {
    let ptr = token as usize as *const JitFrame;
    // SAFETY: the running execution holds a strong reference.
    unsafe {
        Arc::increment_strong_count(ptr);
        Arc::from_raw(ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_match_layout() {
        assert_eq!(FRAME_SLOTS_OFFSET, 0);
        assert_eq!(FRAME_FORCE_DESCR_OFFSET, 8);
        assert_eq!(FRAME_FORCED_OFFSET, 16);
    }

    #[test]
    fn growing_keeps_values() {
        let frame = JitFrame::new(2);
        frame.write_slots(&[7, 8]);
        frame.ensure_depth(10);
        assert_eq!(frame.depth(), 10);
        assert_eq!(frame.read_slots(3), vec![7, 8, 0]);
    }

    #[test]
    fn token_roundtrip() {
        let frame = JitFrame::new(1);
        let token = frame.force_token();
        // SAFETY: `frame` is alive.
        let again = unsafe { frame_from_token(token) };
        assert!(Arc::ptr_eq(&frame, &again));
        assert_eq!(Arc::strong_count(&frame), 2);
    }

    #[test]
    fn force_is_idempotent() {
        let descr = FailDescr::guard(3);
        descr.record_fail_arg_types(vec![Type::Int, Type::Float]);
        let frame = JitFrame::new(2);
        frame.write_slots(&[5, 1.5f64.to_bits()]);
        frame
            .force_descr
            .store(Arc::as_ptr(&descr) as usize, Ordering::Release);
        let first = frame.force();
        frame.write_slots(&[6, 0]);
        let second = frame.force();
        assert!(frame.is_forced());
        assert_eq!(first.get_int_value(0), 5);
        assert_eq!(second.get_int_value(0), 5);
        assert_eq!(second.get_float_value(1), 1.5);
        assert!(Arc::ptr_eq(first.descr(), &descr));
    }
}
