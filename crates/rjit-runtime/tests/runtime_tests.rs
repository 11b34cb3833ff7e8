//! Integration tests for the lock, the errno protocol and the nursery

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use proptest::prelude::*;
use rjit_ir::{ArrayDescr, FieldKind};
use rjit_runtime::errno::{self, RFFI_FULL_ERRNO, RFFI_READSAVED_ERRNO, RFFI_SAVE_ERRNO};
use rjit_runtime::{
    GcLayer, Gil, NurseryConfig, NurseryGc, ThreadContext, context_for, register_engine,
    retire_engine, thread_context_count, with_current,
};

fn long_array() -> ArrayDescr {
    ArrayDescr {
        name: "Longs".into(),
        base_size: 16,
        item_size: 8,
        item_kind: FieldKind::Signed,
        length_offset: Some(8),
        type_id: 9,
    }
}

#[test]
fn test_gil_excludes_other_threads() {
    const THREADS: usize = 6;
    const ROUNDS: usize = 50;

    let gil = Arc::new(Gil::new());
    let inside = Arc::new(AtomicBool::new(false));
    let entered = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let gil = gil.clone();
            let inside = inside.clone();
            let entered = entered.clone();
            thread::spawn(move || {
                for _ in 0..ROUNDS {
                    let _held = gil.acquire();
                    assert!(!inside.swap(true, Ordering::SeqCst), "two holders at once");
                    entered.fetch_add(1, Ordering::Relaxed);
                    thread::yield_now();
                    inside.store(false, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker finished");
    }
    assert_eq!(entered.load(Ordering::Relaxed), THREADS * ROUNDS);
    assert_eq!(gil.acquisitions(), (THREADS * ROUNDS) as u64);
    assert!(!gil.is_held());
}

#[test]
fn test_released_gil_lets_waiters_run() {
    let gil = Arc::new(Gil::new());
    let _held = gil.acquire();
    let ran = Arc::new(AtomicBool::new(false));
    let waiter = {
        let gil = gil.clone();
        let ran = ran.clone();
        thread::spawn(move || {
            let _held = gil.acquire();
            ran.store(true, Ordering::SeqCst);
        })
    };
    thread::sleep(Duration::from_millis(20));
    assert!(!ran.load(Ordering::SeqCst));

    assert!(gil.release());
    waiter.join().expect("waiter finished");
    assert!(ran.load(Ordering::SeqCst));
    gil.reacquire();
    assert!(gil.is_held_by_current());
}

#[test]
#[should_panic(expected = "gil is not re-entrant")]
fn test_gil_is_not_reentrant() {
    let gil = Gil::new();
    let _outer = gil.acquire();
    let _inner = gil.acquire();
}

#[test]
fn test_saved_errno_is_per_context() {
    const THREADS: i32 = 4;
    let barrier = Arc::new(Barrier::new(THREADS as usize));
    let handles: Vec<_> = (1..=THREADS)
        .map(|n| {
            let barrier = barrier.clone();
            thread::spawn(move || {
                let ctx = ThreadContext::new();
                ctx.set_saved_errno(n * 10);
                errno::before_call(&ctx, RFFI_READSAVED_ERRNO);
                barrier.wait();
                assert_eq!(errno::get_errno(), n * 10);

                errno::set_errno(n * 10 + 1);
                barrier.wait();
                errno::after_call(&ctx, RFFI_SAVE_ERRNO);
                (ctx.saved_errno(), ctx.saved_alt_errno())
            })
        })
        .collect();
    for (n, handle) in (1..=THREADS).zip(handles) {
        let saved = handle.join().expect("worker finished");
        assert_eq!(saved, (n * 10 + 1, 0));
    }
}

#[test]
fn test_full_errno_round_trip() {
    let ctx = ThreadContext::new();
    ctx.set_saved_errno(4);
    errno::before_call(&ctx, RFFI_FULL_ERRNO);
    assert_eq!(errno::get_errno(), 4);
    // the callee fails with a new errno
    errno::set_errno(28);
    errno::after_call(&ctx, RFFI_FULL_ERRNO);
    assert_eq!(ctx.saved_errno(), 28);
    errno::set_errno(0);
}

#[test]
fn test_current_context_per_thread() {
    let engine = register_engine();
    let handles: Vec<_> = (0..3u64)
        .map(|n| {
            thread::spawn(move || {
                // SAFETY: the engine is retired only after every worker joined.
                let ctx = unsafe { &*context_for(engine) };
                let _current = ctx.enter();
                with_current(|c| c.set_saved_errno(n as i32)).expect("context entered");
                with_current(|c| c.saved_errno()).expect("context entered")
            })
        })
        .collect();
    for (n, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.join().expect("worker finished"), n as i32);
    }
    retire_engine(engine);
    assert!(with_current(|_| ()).is_none());
}

#[test]
fn test_retiring_during_thread_teardown() {
    struct RetireOnDrop(u64);
    impl Drop for RetireOnDrop {
        fn drop(&mut self) {
            retire_engine(self.0);
        }
    }
    thread_local! {
        static HELD: std::cell::RefCell<Option<RetireOnDrop>> = const { std::cell::RefCell::new(None) };
    }
    thread::spawn(|| {
        let engine = register_engine();
        context_for(engine);
        assert_eq!(thread_context_count(), 1);
        HELD.with(|h| *h.borrow_mut() = Some(RetireOnDrop(engine)));
    })
    .join()
    .expect("thread exits cleanly");
}

#[test]
fn test_threads_allocate_disjoint_windows() {
    let gc = Arc::new(NurseryGc::new(NurseryConfig {
        nursery_size: 512,
        ..NurseryConfig::default()
    }));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let gc = gc.clone();
            thread::spawn(move || {
                let ctx = ThreadContext::new();
                let descr = long_array();
                (0..64)
                    .map(|_| gc.malloc_array(&ctx, &descr, 3))
                    .collect::<Vec<_>>()
            })
        })
        .collect();
    let mut all: Vec<usize> = handles
        .into_iter()
        .flat_map(|h| h.join().expect("worker finished"))
        .collect();
    all.sort_unstable();
    // every array is 40 bytes; neighbours never overlap
    assert!(all.windows(2).all(|w| w[1] - w[0] >= 40));
    assert_eq!(gc.stats().array_slowpaths, 256);
    assert!(gc.stats().nursery_refills >= 4);
}

proptest! {
    #[test]
    fn prop_malloc_array_initialises_header(lengths in prop::collection::vec(0usize..20_000, 1..20)) {
        let gc = NurseryGc::default();
        let ctx = ThreadContext::new();
        let descr = long_array();
        let mut ranges = Vec::new();
        for &len in &lengths {
            let obj = gc.malloc_array(&ctx, &descr, len);
            prop_assert_eq!(obj % 8, 0);
            // SAFETY: obj was just allocated with a header and length word.
            let (header, stored) = unsafe { (*(obj as *const u64), *((obj + 8) as *const usize)) };
            prop_assert_eq!(header as u32, 9);
            prop_assert_eq!(stored, len);
            ranges.push((obj, obj + 16 + len * 8));
        }
        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            prop_assert!(pair[0].1 <= pair[1].0);
        }
    }
}
