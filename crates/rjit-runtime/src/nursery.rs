//! Non-moving nursery GC used as the backend's default [`GcLayer`].
//!
//! Young objects are bump-allocated from per-thread windows carved out of
//! zero-filled blocks. Objects never move and blocks are only released when
//! the collector is dropped; "collection" here is limited to the bookkeeping
//! the barrier protocol needs (remembered objects, card-marked arrays), which
//! makes every slow path observable.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rjit_ir::{ArrayDescr, CardMarking, GcRef, WriteBarrierDescr};
use rustc_hash::FxHashSet;

use crate::context::ThreadContext;
use crate::gc::{
    GCFLAG_CARDS_SET, GCFLAG_HAS_CARDS, GCFLAG_TRACK_YOUNG_PTRS, GcLayer, flag_byte,
};

/// Nursery sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NurseryConfig {
    /// Bytes per nursery window
    pub nursery_size: usize,
    /// Arrays at least this large bypass the nursery and get card bytes
    pub large_object_threshold: usize,
    /// `index >> card_page_shift` selects an array card
    pub card_page_shift: u8,
}

impl Default for NurseryConfig {
    fn default() -> Self {
        Self {
            nursery_size: 1 << 20,
            large_object_threshold: 64 << 10,
            card_page_shift: 7,
        }
    }
}

/// Counters exposed for tests and diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Times a thread's nursery window was replaced
    pub nursery_refills: u64,
    /// Array allocations that went through the slow path
    pub array_slowpaths: u64,
    /// Calls of the object write-barrier slow path
    pub write_barriers: u64,
    /// Calls of the array write-barrier slow path
    pub array_write_barriers: u64,
    /// Objects allocated directly as old
    pub old_allocations: u64,
}

struct RawBlock {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the block is plain memory owned by the collector.
unsafe impl Send for RawBlock {}

impl RawBlock {
    fn zeroed(size: usize) -> Self {
        let layout = Layout::from_size_align(size.max(16), 16)
            .unwrap_or_else(|_| panic!("gc block of {size} bytes is not representable"));
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            alloc::handle_alloc_error(layout)
        };
        Self { ptr, layout }
    }

    fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }
}

impl Drop for RawBlock {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with the same layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

#[inline]
const fn round_up8(n: usize) -> usize {
    (n + 7) & !7
}

/// Pointer to an object's header word.
///
/// # Safety
///
/// `obj` must be the address of a live object carrying a GC header.
#[inline]
unsafe fn header_ptr(obj: usize) -> *mut u64 {
    obj as *mut u64
}

/// Bump-pointer collector with card-marked large arrays
pub struct NurseryGc {
    config: NurseryConfig,
    blocks: Mutex<Vec<RawBlock>>,
    remembered: Mutex<FxHashSet<usize>>,
    cards_set: Mutex<Vec<usize>>,
    nursery_refills: AtomicU64,
    array_slowpaths: AtomicU64,
    write_barriers: AtomicU64,
    array_write_barriers: AtomicU64,
    old_allocations: AtomicU64,
}

impl std::fmt::Debug for NurseryGc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NurseryGc")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl NurseryGc {
    /// Create a collector
    pub fn new(config: NurseryConfig) -> Self {
        Self {
            config,
            blocks: Mutex::new(Vec::new()),
            remembered: Mutex::new(FxHashSet::default()),
            cards_set: Mutex::new(Vec::new()),
            nursery_refills: AtomicU64::new(0),
            array_slowpaths: AtomicU64::new(0),
            write_barriers: AtomicU64::new(0),
            array_write_barriers: AtomicU64::new(0),
            old_allocations: AtomicU64::new(0),
        }
    }

    /// Sizing in effect
    pub fn config(&self) -> NurseryConfig {
        self.config
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> GcStats {
        GcStats {
            nursery_refills: self.nursery_refills.load(Ordering::Relaxed),
            array_slowpaths: self.array_slowpaths.load(Ordering::Relaxed),
            write_barriers: self.write_barriers.load(Ordering::Relaxed),
            array_write_barriers: self.array_write_barriers.load(Ordering::Relaxed),
            old_allocations: self.old_allocations.load(Ordering::Relaxed),
        }
    }

    fn new_block(&self, size: usize) -> usize {
        let block = RawBlock::zeroed(size);
        let addr = block.addr();
        self.blocks.lock().push(block);
        addr
    }

    fn card_bytes_for(&self, length: usize) -> usize {
        if length == 0 {
            return 0;
        }
        let cards = ((length - 1) >> self.config.card_page_shift) + 1;
        round_up8(cards.div_ceil(8))
    }

    /// Allocate an old object; stores into it need the write barrier
    pub fn alloc_old(&self, size: usize, type_id: u32) -> GcRef {
        let obj = self.new_block(round_up8(size));
        // SAFETY: fresh block of at least 8 bytes.
        unsafe { *header_ptr(obj) = u64::from(type_id) | GCFLAG_TRACK_YOUNG_PTRS };
        self.old_allocations.fetch_add(1, Ordering::Relaxed);
        GcRef(obj)
    }

    /// Allocate an old array with card bytes in front of the header
    pub fn alloc_old_array(&self, descr: &ArrayDescr, length: usize) -> GcRef {
        let body = length
            .checked_mul(descr.item_size)
            .and_then(|n| n.checked_add(descr.base_size))
            .unwrap_or_else(|| panic!("array of {length} items overflows the address space"));
        let card_bytes = self.card_bytes_for(length);
        let start = self.new_block(card_bytes + round_up8(body));
        let obj = start + card_bytes;
        let mut header = u64::from(descr.type_id) | GCFLAG_TRACK_YOUNG_PTRS;
        if card_bytes > 0 {
            header |= GCFLAG_HAS_CARDS;
        }
        // SAFETY: obj points inside the fresh block, past the card bytes.
        unsafe {
            *header_ptr(obj) = header;
            if let Some(ofs) = descr.length_offset {
                *((obj + ofs) as *mut usize) = length;
            }
        }
        self.old_allocations.fetch_add(1, Ordering::Relaxed);
        #[cfg(debug_assertions)]
        tracing::trace!(obj, length, card_bytes, "old array allocated");
        GcRef(obj)
    }

    /// Header word of `obj`
    ///
    /// # Safety
    ///
    /// `obj` must be a live object allocated by this collector.
    pub unsafe fn header(&self, obj: GcRef) -> u64 {
        // SAFETY: guaranteed by the caller.
        unsafe { *header_ptr(obj.addr()) }
    }

    /// Whether the card covering item `index` of `obj` is marked
    ///
    /// # Safety
    ///
    /// `obj` must be a live array allocated by [`NurseryGc::alloc_old_array`]
    /// and `index` within its length.
    pub unsafe fn is_card_marked(&self, obj: GcRef, index: usize) -> bool {
        let card = index >> self.config.card_page_shift;
        let byte = obj.addr() - 1 - (card >> 3);
        // SAFETY: card bytes precede the header of such arrays.
        let value = unsafe { *(byte as *const u8) };
        value & (1 << (card & 7)) != 0
    }

    /// Whether `obj` went through the object write-barrier slow path
    pub fn is_remembered(&self, obj: GcRef) -> bool {
        self.remembered.lock().contains(&obj.addr())
    }

    /// Arrays switched to card marking by the array barrier
    pub fn objects_with_cards_set(&self) -> Vec<GcRef> {
        self.cards_set.lock().iter().map(|&a| GcRef(a)).collect()
    }

    fn bump(&self, ctx: &ThreadContext, size: usize) -> usize {
        let (free, top) = ctx.nursery();
        if free != 0 && free + size <= top {
            ctx.set_nursery(free + size, top);
            free
        } else {
            self.malloc_nursery_slowpath(ctx, size)
        }
    }
}

impl Default for NurseryGc {
    fn default() -> Self {
        Self::new(NurseryConfig::default())
    }
}

impl GcLayer for NurseryGc {
    fn write_barrier_descr(&self) -> WriteBarrierDescr {
        let (flag_byte_offset, flag_mask) = flag_byte(GCFLAG_TRACK_YOUNG_PTRS);
        let (cards_set_byte_offset, cards_set_mask) = flag_byte(GCFLAG_CARDS_SET);
        WriteBarrierDescr {
            flag_byte_offset,
            flag_mask,
            cards: Some(CardMarking {
                cards_set_byte_offset,
                cards_set_mask,
                card_page_shift: self.config.card_page_shift,
            }),
        }
    }

    fn malloc_zeroes_memory(&self) -> bool {
        true
    }

    fn max_nursery_array_bytes(&self) -> usize {
        self.config.large_object_threshold.min(self.config.nursery_size)
    }

    fn malloc_nursery_slowpath(&self, ctx: &ThreadContext, size: usize) -> usize {
        let size = round_up8(size);
        if size > self.config.nursery_size {
            return self.new_block(size);
        }
        let start = self.new_block(self.config.nursery_size);
        ctx.set_nursery(start + size, start + self.config.nursery_size);
        let refills = self.nursery_refills.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(refills, size, "nursery window refilled");
        start
    }

    fn malloc_array(&self, ctx: &ThreadContext, descr: &ArrayDescr, length: usize) -> usize {
        self.array_slowpaths.fetch_add(1, Ordering::Relaxed);
        let body = length
            .checked_mul(descr.item_size)
            .and_then(|n| n.checked_add(descr.base_size))
            .unwrap_or_else(|| panic!("array of {length} items overflows the address space"));
        if body >= self.max_nursery_array_bytes() {
            return self.alloc_old_array(descr, length).addr();
        }
        let obj = self.bump(ctx, round_up8(body));
        // SAFETY: obj is a fresh nursery chunk of at least `body` bytes.
        unsafe {
            *header_ptr(obj) = self.young_header(descr.type_id);
            if let Some(ofs) = descr.length_offset {
                *((obj + ofs) as *mut usize) = length;
            }
        }
        obj
    }

    fn write_barrier(&self, obj: usize) {
        self.write_barriers.fetch_add(1, Ordering::Relaxed);
        // SAFETY: compiled code only passes live objects.
        unsafe { *header_ptr(obj) &= !GCFLAG_TRACK_YOUNG_PTRS };
        self.remembered.lock().insert(obj);
    }

    fn write_barrier_array(&self, obj: usize) {
        self.array_write_barriers.fetch_add(1, Ordering::Relaxed);
        // SAFETY: compiled code only passes live objects.
        let header = unsafe { *header_ptr(obj) };
        if header & GCFLAG_HAS_CARDS != 0 {
            // SAFETY: as above.
            unsafe { *header_ptr(obj) = header | GCFLAG_CARDS_SET };
            self.cards_set.lock().push(obj);
        } else {
            self.write_barrier(obj);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rjit_ir::FieldKind;

    fn array_descr() -> ArrayDescr {
        ArrayDescr {
            name: "Array".into(),
            base_size: 16,
            item_size: 8,
            item_kind: FieldKind::Ref,
            length_offset: Some(8),
            type_id: 5,
        }
    }

    #[test]
    fn slowpath_installs_window() {
        let gc = NurseryGc::new(NurseryConfig {
            nursery_size: 256,
            ..NurseryConfig::default()
        });
        let ctx = ThreadContext::new();
        let a = gc.malloc_nursery_slowpath(&ctx, 24);
        let (free, top) = ctx.nursery();
        assert_eq!(free, a + 24);
        assert_eq!(top, a + 256);
        assert_eq!(gc.stats().nursery_refills, 1);
    }

    #[test]
    fn oversized_request_gets_own_block() {
        let gc = NurseryGc::new(NurseryConfig {
            nursery_size: 64,
            ..NurseryConfig::default()
        });
        let ctx = ThreadContext::new();
        let a = gc.malloc_nursery_slowpath(&ctx, 1000);
        assert_ne!(a, 0);
        assert_eq!(ctx.nursery(), (0, 0));
    }

    #[test]
    fn old_array_has_cards() {
        let gc = NurseryGc::default();
        let arr = gc.alloc_old_array(&array_descr(), 1000);
        // SAFETY: arr was just allocated by gc.
        let header = unsafe { gc.header(arr) };
        assert_ne!(header & GCFLAG_HAS_CARDS, 0);
        assert_ne!(header & GCFLAG_TRACK_YOUNG_PTRS, 0);
        // SAFETY: arr is live; length word at offset 8.
        assert_eq!(unsafe { *((arr.addr() + 8) as *const usize) }, 1000);
        // SAFETY: index within length.
        assert!(!unsafe { gc.is_card_marked(arr, 999) });
    }

    #[test]
    fn array_barrier_switches_to_cards() {
        let gc = NurseryGc::default();
        let arr = gc.alloc_old_array(&array_descr(), 10);
        gc.write_barrier_array(arr.addr());
        // SAFETY: arr is live.
        assert_ne!(unsafe { gc.header(arr) } & GCFLAG_CARDS_SET, 0);
        assert_eq!(gc.objects_with_cards_set(), vec![arr]);
        assert!(!gc.is_remembered(arr));
    }

    #[test]
    fn object_barrier_clears_flag() {
        let gc = NurseryGc::default();
        let obj = gc.alloc_old(32, 3);
        gc.write_barrier(obj.addr());
        // SAFETY: obj is live.
        assert_eq!(unsafe { gc.header(obj) } & GCFLAG_TRACK_YOUNG_PTRS, 0);
        assert!(gc.is_remembered(obj));
        assert_eq!(gc.stats().write_barriers, 1);
    }

    #[test]
    fn small_array_slowpath_uses_nursery() {
        let gc = NurseryGc::default();
        let ctx = ThreadContext::new();
        let arr = gc.malloc_array(&ctx, &array_descr(), 4);
        // SAFETY: arr is live.
        assert_eq!(unsafe { *(arr as *const u64) }, 5);
        let (free, _) = ctx.nursery();
        assert_eq!(free, arr + 48);
    }
}
