//! Loop and label tokens

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

/// Opaque per-object storage owned by the backend.
///
/// Tokens and fail descriptors are created by the trace producer but the
/// backend needs to hang compiled state off them. The slot is type-erased so
/// this crate does not depend on the backend.
#[derive(Default)]
pub struct BackendData {
    slot: RwLock<Option<Arc<dyn Any + Send + Sync>>>,
}

impl BackendData {
    /// Read the slot as `T`
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let data = self.slot.read().clone()?;
        data.downcast::<T>().ok()
    }

    /// Replace the slot's contents
    pub fn set<T: Any + Send + Sync>(&self, value: Arc<T>) {
        *self.slot.write() = Some(value as Arc<dyn Any + Send + Sync>);
    }

    /// Store `value` only if the slot is empty; returns whether it was stored
    pub fn set_if_empty<T: Any + Send + Sync>(&self, value: Arc<T>) -> bool {
        let mut slot = self.slot.write();
        if slot.is_some() {
            return false;
        }
        *slot = Some(value as Arc<dyn Any + Send + Sync>);
        true
    }

    /// Take `T` out of the slot, leaving it empty
    pub fn take<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let data = self.slot.write().take()?;
        data.downcast::<T>().ok()
    }

    /// Empty the slot
    pub fn clear(&self) {
        self.slot.write().take();
    }

    /// Whether anything is stored
    pub fn is_set(&self) -> bool {
        self.slot.read().is_some()
    }
}

impl std::fmt::Debug for BackendData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendData")
            .field("set", &self.is_set())
            .finish()
    }
}

static NEXT_TOKEN_NUMBER: AtomicU64 = AtomicU64::new(1);

fn next_number() -> u64 {
    NEXT_TOKEN_NUMBER.fetch_add(1, Ordering::Relaxed)
}

/// Handle of one compiled loop and everything attached to it.
///
/// The token owns the compiled code: bridges attached to the loop's guards
/// live and die with it (see `free_loop_and_bridges` on the CPU).
#[derive(Debug)]
pub struct JitCellToken {
    number: u64,
    /// Backend-owned compiled state
    pub backend: BackendData,
}

impl JitCellToken {
    /// Create a fresh token with a process-unique number
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            number: next_number(),
            backend: BackendData::default(),
        })
    }

    /// Process-unique number, stable for the token's lifetime
    pub fn number(&self) -> u64 {
        self.number
    }
}

/// Names one `LABEL` so that `JUMP`s (possibly from other traces) can target it.
#[derive(Debug)]
pub struct TargetToken {
    number: u64,
    /// Backend-owned label binding
    pub backend: BackendData,
}

impl TargetToken {
    /// Create a fresh target token
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            number: next_number(),
            backend: BackendData::default(),
        })
    }

    /// Process-unique number
    pub fn number(&self) -> u64 {
        self.number
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_data_downcasts() {
        let data = BackendData::default();
        assert!(data.get::<u32>().is_none());
        data.set(Arc::new(7u32));
        assert_eq!(*data.get::<u32>().expect("u32 stored"), 7);
        assert!(data.get::<String>().is_none());
        assert!(!data.set_if_empty(Arc::new(8u32)));
        assert_eq!(*data.take::<u32>().expect("still stored"), 7);
        assert!(!data.is_set());
    }

    #[test]
    fn token_numbers_are_unique() {
        let a = JitCellToken::new();
        let b = JitCellToken::new();
        let t = TargetToken::new();
        assert_ne!(a.number(), b.number());
        assert_ne!(a.number(), t.number());
    }
}
