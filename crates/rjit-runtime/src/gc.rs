//! The contract between compiled code and the garbage collector.
//!
//! Compiled code inlines the allocation and write-barrier fast paths using
//! the layout facts a [`GcLayer`] reports, and calls back into it only on
//! the slow paths.

use rjit_ir::{ArrayDescr, WriteBarrierDescr};

use crate::context::ThreadContext;

/// Header word layout: type id in the low 32 bits, flags above
pub const GC_HEADER_SIZE: usize = 8;

/// The object may hold old-to-young pointers once written to; stores need a barrier
pub const GCFLAG_TRACK_YOUNG_PTRS: u64 = 1 << 32;
/// The object has card bytes in front of its header
pub const GCFLAG_HAS_CARDS: u64 = 1 << 33;
/// At least one card is marked
pub const GCFLAG_CARDS_SET: u64 = 1 << 34;

/// Byte offset within the header word and single-byte mask testing `flag`
pub const fn flag_byte(flag: u64) -> (i32, u8) {
    let bit = flag.trailing_zeros();
    let byte = if cfg!(target_endian = "little") {
        bit / 8
    } else {
        7 - bit / 8
    };
    (byte as i32, 1u8 << (bit % 8))
}

/// Type id stored in a header word
#[inline]
pub const fn header_type_id(header: u64) -> u32 {
    header as u32
}

/// Services the collector provides to the backend.
///
/// Slow-path methods are invoked from compiled code through `extern "C"`
/// shims; they may collect, so compiled code never caches raw addresses of
/// other objects across them.
pub trait GcLayer: Send + Sync + 'static {
    /// Bytes of header in front of every object's fields
    fn header_size(&self) -> usize {
        GC_HEADER_SIZE
    }

    /// Offset of the vtable word written by `NEW_WITH_VTABLE`
    fn vtable_offset(&self) -> usize {
        GC_HEADER_SIZE
    }

    /// Header word of a freshly allocated young object
    fn young_header(&self, type_id: u32) -> u64 {
        u64::from(type_id)
    }

    /// Where the barrier flags live
    fn write_barrier_descr(&self) -> WriteBarrierDescr;

    /// Whether nursery memory is handed out zero-filled
    fn malloc_zeroes_memory(&self) -> bool;

    /// Largest array (in bytes) the inline nursery path may allocate
    fn max_nursery_array_bytes(&self) -> usize;

    /// Refill `ctx`'s nursery window and return `size` bytes from it
    fn malloc_nursery_slowpath(&self, ctx: &ThreadContext, size: usize) -> usize;

    /// Allocate an array the fast path could not; header and length are initialised
    fn malloc_array(&self, ctx: &ThreadContext, descr: &ArrayDescr, length: usize) -> usize;

    /// Slow path of `COND_CALL_GC_WB`
    fn write_barrier(&self, obj: usize);

    /// Slow path of `COND_CALL_GC_WB_ARRAY`; may switch the object to card marking
    fn write_barrier_array(&self, obj: usize);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_endian = "little")]
    fn flag_bytes_little_endian() {
        assert_eq!(flag_byte(GCFLAG_TRACK_YOUNG_PTRS), (4, 0x01));
        assert_eq!(flag_byte(GCFLAG_HAS_CARDS), (4, 0x02));
        assert_eq!(flag_byte(GCFLAG_CARDS_SET), (4, 0x04));
    }

    #[test]
    fn type_id_in_low_word() {
        assert_eq!(header_type_id(GCFLAG_CARDS_SET | 77), 77);
    }
}
