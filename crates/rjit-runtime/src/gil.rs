//! The interpreter-wide lock.
//!
//! Threads running interpreted or compiled code hold the [`Gil`]. A
//! release-GIL call drops it around the native callee and takes it back
//! before compiled code continues, letting other threads run meanwhile.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};

/// Interpreter lock manager, injected into the execution engine
#[derive(Debug, Default)]
pub struct Gil {
    holder: CachePadded<Mutex<Option<ThreadId>>>,
    available: Condvar,
    acquisitions: AtomicU64,
}

impl Gil {
    /// Create an unheld lock
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until this thread holds the lock
    ///
    /// # Panics
    ///
    /// If the calling thread already holds it; the lock is not re-entrant.
    pub fn acquire(&self) -> GilGuard<'_> {
        self.reacquire();
        GilGuard { gil: self }
    }

    /// Whether the calling thread holds the lock
    pub fn is_held_by_current(&self) -> bool {
        *self.holder.lock() == Some(thread::current().id())
    }

    /// Whether any thread holds the lock
    pub fn is_held(&self) -> bool {
        self.holder.lock().is_some()
    }

    /// Number of times the lock has been taken
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }

    /// Drop the lock ahead of a native call.
    ///
    /// Returns `false` (and does nothing) when the calling thread does not
    /// hold the lock; the matching [`Gil::reacquire`] must then be skipped.
    pub fn release(&self) -> bool {
        let me = thread::current().id();
        let mut holder = self.holder.lock();
        if *holder != Some(me) {
            return false;
        }
        *holder = None;
        drop(holder);
        self.available.notify_one();
        tracing::trace!(thread = ?me, "gil released");
        true
    }

    /// Take the lock back after a native call, blocking while another thread holds it
    pub fn reacquire(&self) {
        let me = thread::current().id();
        let mut holder = self.holder.lock();
        assert_ne!(*holder, Some(me), "gil is not re-entrant");
        while holder.is_some() {
            self.available.wait(&mut holder);
        }
        *holder = Some(me);
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(thread = ?me, "gil acquired");
    }
}

/// Holds the [`Gil`] until dropped
#[derive(Debug)]
pub struct GilGuard<'a> {
    gil: &'a Gil,
}

impl Drop for GilGuard<'_> {
    fn drop(&mut self) {
        self.gil.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn guard_releases_on_drop() {
        let gil = Gil::new();
        {
            let _g = gil.acquire();
            assert!(gil.is_held_by_current());
        }
        assert!(!gil.is_held());
        assert_eq!(gil.acquisitions(), 1);
    }

    #[test]
    fn release_without_holding_is_a_no_op() {
        let gil = Gil::new();
        assert!(!gil.release());
    }

    #[test]
    fn release_lets_another_thread_in() {
        let gil = Arc::new(Gil::new());
        let _g = gil.acquire();
        assert!(gil.release());
        let other = {
            let gil = gil.clone();
            std::thread::spawn(move || {
                let _g = gil.acquire();
                std::thread::sleep(Duration::from_millis(10));
            })
        };
        other.join().expect("other thread finished");
        gil.reacquire();
        assert!(gil.is_held_by_current());
        assert_eq!(gil.acquisitions(), 3);
    }
}
