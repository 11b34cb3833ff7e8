//! Per-thread execution context.
//!
//! Compiled code receives a pointer to the current thread's
//! [`ThreadContext`] and reads or writes its fields at the offsets exported
//! below. Native callees reach the same context through [`with_current`].

use std::cell::{Cell, RefCell};
use std::mem::offset_of;
use std::ptr;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rjit_ir::GcRef;
use rustc_hash::{FxHashMap, FxHashSet};

/// Explicit per-thread state shared between compiled code and the runtime.
///
/// Holds the pending-exception slots, the thread's nursery window and the
/// saved OS error values used by release-GIL calls.
#[repr(C)]
#[derive(Debug, Default)]
pub struct ThreadContext {
    exc_class: Cell<usize>,
    exc_value: Cell<usize>,
    nursery_free: Cell<usize>,
    nursery_top: Cell<usize>,
    saved_errno: Cell<i32>,
    saved_alt_errno: Cell<i32>,
    saved_lasterror: Cell<u32>,
    saved_alt_lasterror: Cell<u32>,
}

/// Byte offset of the pending exception class
pub const CTX_EXC_CLASS_OFFSET: i32 = offset_of!(ThreadContext, exc_class) as i32;
/// Byte offset of the pending exception value
pub const CTX_EXC_VALUE_OFFSET: i32 = offset_of!(ThreadContext, exc_value) as i32;
/// Byte offset of the nursery bump pointer
pub const CTX_NURSERY_FREE_OFFSET: i32 = offset_of!(ThreadContext, nursery_free) as i32;
/// Byte offset of the nursery limit
pub const CTX_NURSERY_TOP_OFFSET: i32 = offset_of!(ThreadContext, nursery_top) as i32;

impl ThreadContext {
    /// Fresh context with no pending exception and an empty nursery window
    pub fn new() -> Self {
        Self::default()
    }

    // ---- exceptions ----

    /// Pending exception as `(class, value)`; class 0 means none
    pub fn exception(&self) -> (usize, GcRef) {
        (self.exc_class.get(), GcRef(self.exc_value.get()))
    }

    /// Whether an exception is pending
    pub fn has_exception(&self) -> bool {
        self.exc_class.get() != 0
    }

    /// Make an exception pending
    pub fn set_exception(&self, class: usize, value: GcRef) {
        self.exc_class.set(class);
        self.exc_value.set(value.addr());
    }

    /// Take the pending exception, leaving none
    pub fn take_exception(&self) -> (usize, GcRef) {
        let exc = self.exception();
        self.clear_exception();
        exc
    }

    /// Drop any pending exception
    pub fn clear_exception(&self) {
        self.exc_class.set(0);
        self.exc_value.set(0);
    }

    // ---- nursery ----

    /// Current nursery window `(free, top)`
    pub fn nursery(&self) -> (usize, usize) {
        (self.nursery_free.get(), self.nursery_top.get())
    }

    /// Install a new nursery window
    pub fn set_nursery(&self, free: usize, top: usize) {
        self.nursery_free.set(free);
        self.nursery_top.set(top);
    }

    // ---- saved OS errors ----

    /// Saved errno
    pub fn saved_errno(&self) -> i32 {
        self.saved_errno.get()
    }

    /// Overwrite the saved errno
    pub fn set_saved_errno(&self, v: i32) {
        self.saved_errno.set(v);
    }

    /// Saved alternate errno
    pub fn saved_alt_errno(&self) -> i32 {
        self.saved_alt_errno.get()
    }

    /// Overwrite the saved alternate errno
    pub fn set_saved_alt_errno(&self, v: i32) {
        self.saved_alt_errno.set(v);
    }

    /// Saved last-error value
    pub fn saved_lasterror(&self) -> u32 {
        self.saved_lasterror.get()
    }

    /// Overwrite the saved last-error value
    pub fn set_saved_lasterror(&self, v: u32) {
        self.saved_lasterror.set(v);
    }

    /// Saved alternate last-error value
    pub fn saved_alt_lasterror(&self) -> u32 {
        self.saved_alt_lasterror.get()
    }

    /// Overwrite the saved alternate last-error value
    pub fn set_saved_alt_lasterror(&self, v: u32) {
        self.saved_alt_lasterror.set(v);
    }

    /// Make this context the thread's current one until the guard drops
    pub fn enter(&self) -> CurrentGuard {
        let prev = CURRENT.with(|c| c.replace(self as *const ThreadContext));
        CurrentGuard { prev }
    }
}

// ---------------------------------------------------------------------------
// Thread-local registry
// ---------------------------------------------------------------------------

thread_local! {
    static CURRENT: Cell<*const ThreadContext> = const { Cell::new(ptr::null()) };
    static CONTEXTS: RefCell<ContextMap> = RefCell::new(ContextMap::default());
}

/// Engines that may still hand out contexts
static LIVE_ENGINES: LazyLock<Mutex<FxHashSet<u64>>> =
    LazyLock::new(|| Mutex::new(FxHashSet::default()));
/// Bumped whenever an engine retires; threads prune their maps when it moves
static RETIRE_EPOCH: AtomicU64 = AtomicU64::new(0);
static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct ContextMap {
    seen_epoch: u64,
    contexts: FxHashMap<u64, Box<ThreadContext>>,
}

impl ContextMap {
    fn prune_retired(&mut self) {
        let epoch = RETIRE_EPOCH.load(Ordering::Acquire);
        if epoch == self.seen_epoch {
            return;
        }
        let live = LIVE_ENGINES.lock();
        let before = self.contexts.len();
        self.contexts.retain(|id, _| live.contains(id));
        self.seen_epoch = epoch;
        if before != self.contexts.len() {
            tracing::trace!(pruned = before - self.contexts.len(), "dropped contexts of retired engines");
        }
    }
}

/// Restores the previously current context on drop (nested executions)
#[derive(Debug)]
pub struct CurrentGuard {
    prev: *const ThreadContext,
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        CURRENT.with(|c| c.set(self.prev));
    }
}

/// Run `f` with the context of the execution currently active on this thread
pub fn with_current<R>(f: impl FnOnce(&ThreadContext) -> R) -> Option<R> {
    let ptr = CURRENT.with(Cell::get);
    if ptr.is_null() {
        return None;
    }
    // SAFETY: CURRENT is only non-null while a CurrentGuard for a context
    // obtained from `context_for` is alive; those contexts are boxed and live
    // until their engine retires, which never happens during an execution.
    Some(f(unsafe { &*ptr }))
}

/// Allocate an engine id whose contexts live until [`retire_engine`]
pub fn register_engine() -> u64 {
    let id = NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed);
    LIVE_ENGINES.lock().insert(id);
    id
}

/// Forget engine `engine_id`.
///
/// The calling thread drops its context at once; other threads drop theirs
/// the next time they call [`context_for`]. Safe to call while the thread's
/// locals are being torn down.
pub fn retire_engine(engine_id: u64) {
    LIVE_ENGINES.lock().remove(&engine_id);
    RETIRE_EPOCH.fetch_add(1, Ordering::AcqRel);
    discard_context(engine_id);
}

/// This thread's context for engine `engine_id`, created on first use.
///
/// The returned pointer is stable until the engine retires (or until
/// [`discard_context`] is called for it on this thread). Contexts of
/// unregistered ids are dropped the next time any engine retires.
pub fn context_for(engine_id: u64) -> *const ThreadContext {
    CONTEXTS.with(|map| {
        let mut map = map.borrow_mut();
        map.prune_retired();
        let ctx = map
            .contexts
            .entry(engine_id)
            .or_insert_with(|| Box::new(ThreadContext::new()));
        &**ctx as *const ThreadContext
    })
}

/// Drop this thread's context for `engine_id`; a no-op during thread teardown
pub fn discard_context(engine_id: u64) {
    let _ = CONTEXTS.try_with(|map| {
        map.borrow_mut().contexts.remove(&engine_id);
    });
}

/// Number of contexts this thread holds
pub fn thread_context_count() -> usize {
    CONTEXTS
        .try_with(|map| map.borrow().contexts.len())
        .unwrap_or(0)
}
