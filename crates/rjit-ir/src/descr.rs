//! Descriptors: immutable side-table metadata referenced by operations.
//!
//! Every descriptor is shared through an `Arc`. Identity matters only for
//! [`FailDescr`] (which guard failed) and the tokens; layout descriptors are
//! compared by value.

use std::sync::{Arc, OnceLock};

use crate::layout::{
    ArgKind, ArrayLayout, CallConvention, CallSignature, EffectInfo, FieldKind, FieldLayout,
    StructLayout,
};
use crate::token::{BackendData, JitCellToken, TargetToken};
use crate::types::Type;

// ---------------------------------------------------------------------------
// Fail descriptors
// ---------------------------------------------------------------------------

/// Identifies the guard or `FINISH` that ended an execution.
#[derive(Debug)]
pub struct FailDescr {
    identifier: i64,
    is_final: bool,
    fail_arg_types: OnceLock<Vec<Type>>,
    /// Backend-owned guard record (bridge link, exit bookkeeping)
    pub backend: BackendData,
}

impl FailDescr {
    /// Descriptor for a guard
    pub fn guard(identifier: i64) -> Arc<Self> {
        Arc::new(Self {
            identifier,
            is_final: false,
            fail_arg_types: OnceLock::new(),
            backend: BackendData::default(),
        })
    }

    /// Descriptor for a `FINISH`; may be shared by many finishes
    pub fn final_descr(identifier: i64) -> Arc<Self> {
        Arc::new(Self {
            identifier,
            is_final: true,
            fail_arg_types: OnceLock::new(),
            backend: BackendData::default(),
        })
    }

    /// Small integer chosen by the producer for dispatch and testing
    pub fn identifier(&self) -> i64 {
        self.identifier
    }

    /// Whether this describes a `FINISH` rather than a guard
    pub fn is_final(&self) -> bool {
        self.is_final
    }

    /// Types of the guard's fail arguments, known once the guard is compiled
    pub fn fail_arg_types(&self) -> Option<&[Type]> {
        self.fail_arg_types.get().map(Vec::as_slice)
    }

    /// Record the fail-argument types; the first compilation wins
    pub fn record_fail_arg_types(&self, types: Vec<Type>) {
        let _ = self.fail_arg_types.set(types);
    }
}

// ---------------------------------------------------------------------------
// Layout descriptors
// ---------------------------------------------------------------------------

/// A struct field
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldDescr {
    /// `Struct.field`
    pub name: String,
    /// Byte offset
    pub offset: usize,
    /// Size in bytes
    pub size: usize,
    /// Interpretation
    pub kind: FieldKind,
}

impl FieldDescr {
    /// Build from a field layout of `owner`
    pub fn from_layout(owner: &str, field: &FieldLayout) -> Self {
        Self {
            name: format!("{owner}.{}", field.name),
            offset: field.offset,
            size: field.size,
            kind: field.kind,
        }
    }

    /// Trace type of the field's value
    pub fn value_type(&self) -> Type {
        self.kind.value_type()
    }

    /// Whether loads sign-extend
    pub fn is_signed(&self) -> bool {
        self.kind == FieldKind::Signed
    }

    /// Whether the field holds a GC pointer
    pub fn is_pointer_field(&self) -> bool {
        self.kind == FieldKind::Ref
    }
}

/// An array type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArrayDescr {
    /// Type name
    pub name: String,
    /// Offset of item 0
    pub base_size: usize,
    /// Bytes per item
    pub item_size: usize,
    /// Interpretation of primitive items
    pub item_kind: FieldKind,
    /// Offset of the length word
    pub length_offset: Option<usize>,
    /// GC type id
    pub type_id: u32,
}

impl ArrayDescr {
    /// Build from an array layout
    pub fn from_layout(layout: &ArrayLayout) -> Self {
        Self {
            name: layout.name.clone(),
            base_size: layout.base_size,
            item_size: layout.item_size,
            item_kind: layout.item_kind,
            length_offset: layout.length_offset,
            type_id: layout.type_id,
        }
    }

    /// Trace type of an item
    pub fn item_type(&self) -> Type {
        self.item_kind.value_type()
    }

    /// Whether item loads sign-extend
    pub fn is_item_signed(&self) -> bool {
        self.item_kind == FieldKind::Signed
    }

    /// Whether items are GC pointers
    pub fn is_array_of_pointers(&self) -> bool {
        self.item_kind == FieldKind::Ref
    }
}

/// A field of a struct stored inline in an array item
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InteriorFieldDescr {
    /// Enclosing array
    pub array: Arc<ArrayDescr>,
    /// Field within one item (offset relative to the item)
    pub field: Arc<FieldDescr>,
}

/// Size and identity of a fixed-size object
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SizeDescr {
    /// Type name
    pub name: String,
    /// Size in bytes including the header
    pub size: usize,
    /// GC type id
    pub type_id: u32,
    /// Vtable for `NEW_WITH_VTABLE`
    pub vtable: Option<usize>,
}

impl SizeDescr {
    /// Build from a struct layout
    pub fn from_layout(layout: &StructLayout) -> Self {
        Self {
            name: layout.name.clone(),
            size: layout.size,
            type_id: layout.type_id,
            vtable: layout.vtable,
        }
    }
}

/// A foreign-call signature
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallDescr {
    /// Argument kinds
    pub args: Vec<ArgKind>,
    /// Result kind
    pub result: ArgKind,
    /// Calling convention
    pub convention: CallConvention,
    /// Effect summary
    pub effect: EffectInfo,
}

impl CallDescr {
    /// Build from a signature
    pub fn from_signature(sig: &CallSignature) -> Self {
        Self {
            args: sig.args.clone(),
            result: sig.result,
            convention: sig.convention,
            effect: sig.effect,
        }
    }

    /// Trace types of the arguments
    pub fn arg_types(&self) -> Vec<Type> {
        self.args.iter().map(|a| a.value_type()).collect()
    }

    /// Trace type of the result
    pub fn result_type(&self) -> Type {
        self.result.value_type()
    }
}

/// Card-marking parameters of an array write barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CardMarking {
    /// Header byte holding the "cards set" flag
    pub cards_set_byte_offset: i32,
    /// Bit mask of that flag
    pub cards_set_mask: u8,
    /// `index >> card_page_shift` selects the card
    pub card_page_shift: u8,
}

/// Where the "needs a write barrier" flag lives in an object header.
///
/// Card bytes, when present, precede the object: card `n` is bit `n & 7`
/// of the byte at offset `!(n >> 3)` (that is `-1 - (n >> 3)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WriteBarrierDescr {
    /// Header byte holding the flag
    pub flag_byte_offset: i32,
    /// Bit mask of the flag
    pub flag_mask: u8,
    /// Array card marking, if the GC supports it
    pub cards: Option<CardMarking>,
}

// ---------------------------------------------------------------------------
// Descr
// ---------------------------------------------------------------------------

/// Descriptor attached to an operation
#[derive(Debug, Clone)]
pub enum Descr {
    /// Guard or finish identity
    Fail(Arc<FailDescr>),
    /// Struct field
    Field(Arc<FieldDescr>),
    /// Array type
    Array(Arc<ArrayDescr>),
    /// Field inside array items
    InteriorField(Arc<InteriorFieldDescr>),
    /// Foreign call signature
    Call(Arc<CallDescr>),
    /// Fixed-size allocation
    Size(Arc<SizeDescr>),
    /// Label identity
    Target(Arc<TargetToken>),
    /// Compiled loop identity (`CALL_ASSEMBLER`)
    Loop(Arc<JitCellToken>),
}

macro_rules! descr_accessor {
    ($name:ident, $variant:ident, $ty:ty) => {
        #[doc = concat!("The `", stringify!($variant), "` payload, if any")]
        pub fn $name(&self) -> Option<&Arc<$ty>> {
            match self {
                Descr::$variant(d) => Some(d),
                _ => None,
            }
        }
    };
}

impl Descr {
    descr_accessor!(as_fail, Fail, FailDescr);
    descr_accessor!(as_field, Field, FieldDescr);
    descr_accessor!(as_array, Array, ArrayDescr);
    descr_accessor!(as_interior_field, InteriorField, InteriorFieldDescr);
    descr_accessor!(as_call, Call, CallDescr);
    descr_accessor!(as_size, Size, SizeDescr);
    descr_accessor!(as_target, Target, TargetToken);
    descr_accessor!(as_loop, Loop, JitCellToken);
}

impl From<Arc<FailDescr>> for Descr {
    fn from(d: Arc<FailDescr>) -> Self {
        Descr::Fail(d)
    }
}

impl From<Arc<FieldDescr>> for Descr {
    fn from(d: Arc<FieldDescr>) -> Self {
        Descr::Field(d)
    }
}

impl From<Arc<ArrayDescr>> for Descr {
    fn from(d: Arc<ArrayDescr>) -> Self {
        Descr::Array(d)
    }
}

impl From<Arc<InteriorFieldDescr>> for Descr {
    fn from(d: Arc<InteriorFieldDescr>) -> Self {
        Descr::InteriorField(d)
    }
}

impl From<Arc<CallDescr>> for Descr {
    fn from(d: Arc<CallDescr>) -> Self {
        Descr::Call(d)
    }
}

impl From<Arc<SizeDescr>> for Descr {
    fn from(d: Arc<SizeDescr>) -> Self {
        Descr::Size(d)
    }
}

impl From<Arc<TargetToken>> for Descr {
    fn from(d: Arc<TargetToken>) -> Self {
        Descr::Target(d)
    }
}

impl From<Arc<JitCellToken>> for Descr {
    fn from(d: Arc<JitCellToken>) -> Self {
        Descr::Loop(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fail_descr_types_set_once() {
        let d = FailDescr::guard(3);
        assert_eq!(d.fail_arg_types(), None);
        d.record_fail_arg_types(vec![Type::Int, Type::Ref]);
        d.record_fail_arg_types(vec![Type::Float]);
        assert_eq!(d.fail_arg_types(), Some(&[Type::Int, Type::Ref][..]));
        assert!(!d.is_final());
        assert!(FailDescr::final_descr(0).is_final());
    }

    #[test]
    fn layout_descrs_compare_by_value() {
        let s = StructLayout::new("Point", 24, 7).field("x", 8, 8, FieldKind::Signed);
        let f = s.find_field("x").expect("field exists");
        assert_eq!(FieldDescr::from_layout(&s.name, f), FieldDescr::from_layout(&s.name, f));
        assert_eq!(FieldDescr::from_layout(&s.name, f).name, "Point.x");
        assert_eq!(SizeDescr::from_layout(&s).size, 24);
    }

    #[test]
    fn descr_accessors() {
        let d = Descr::from(FailDescr::guard(1));
        assert!(d.as_fail().is_some());
        assert!(d.as_call().is_none());
    }
}
