//! Explicit layout records.
//!
//! Descriptors are derived from these records rather than from reflection
//! over host types. A runtime describes each of its object shapes once at
//! startup and hands the records to the backend's descriptor constructors.

use crate::types::Type;

/// How the bytes of a field are interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    /// Sign-extended integer
    Signed,
    /// Zero-extended integer (also raw addresses)
    Unsigned,
    /// IEEE-754 double (size 8)
    Float,
    /// GC pointer, visible to the collector
    Ref,
}

impl FieldKind {
    /// Trace type of a value loaded from such a field
    pub const fn value_type(self) -> Type {
        match self {
            Self::Signed | Self::Unsigned => Type::Int,
            Self::Float => Type::Float,
            Self::Ref => Type::Ref,
        }
    }
}

/// One field of a struct
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldLayout {
    /// Field name, used for lookup and dumps
    pub name: String,
    /// Byte offset from the object start (header included)
    pub offset: usize,
    /// Size in bytes: 1, 2, 4 or 8
    pub size: usize,
    /// Interpretation of the bytes
    pub kind: FieldKind,
}

impl FieldLayout {
    /// Create a field record
    pub fn new(name: impl Into<String>, offset: usize, size: usize, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            offset,
            size,
            kind,
        }
    }
}

/// A fixed-size GC struct (or a raw struct when `type_id` is unused)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StructLayout {
    /// Type name
    pub name: String,
    /// Total size in bytes including the GC header
    pub size: usize,
    /// GC type id stored in the header by `NEW`
    pub type_id: u32,
    /// Vtable address for instances allocated with `NEW_WITH_VTABLE`
    pub vtable: Option<usize>,
    /// Fields
    pub fields: Vec<FieldLayout>,
}

impl StructLayout {
    /// Create an empty struct layout
    pub fn new(name: impl Into<String>, size: usize, type_id: u32) -> Self {
        Self {
            name: name.into(),
            size,
            type_id,
            vtable: None,
            fields: Vec::new(),
        }
    }

    /// Builder-style vtable
    pub fn with_vtable(mut self, vtable: usize) -> Self {
        self.vtable = Some(vtable);
        self
    }

    /// Builder-style field
    pub fn field(mut self, name: &str, offset: usize, size: usize, kind: FieldKind) -> Self {
        self.fields.push(FieldLayout::new(name, offset, size, kind));
        self
    }

    /// Look up a field by name
    pub fn find_field(&self, name: &str) -> Option<&FieldLayout> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// A variable-length array
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArrayLayout {
    /// Type name
    pub name: String,
    /// Offset of item 0
    pub base_size: usize,
    /// Bytes per item
    pub item_size: usize,
    /// Kind of primitive items (ignored for struct items)
    pub item_kind: FieldKind,
    /// Offset of the length word, `None` for raw arrays
    pub length_offset: Option<usize>,
    /// GC type id stored in the header by `NEW_ARRAY`
    pub type_id: u32,
    /// Fields of inline struct items (for interior field access)
    pub item_fields: Vec<FieldLayout>,
}

impl ArrayLayout {
    /// Array of primitive items
    pub fn new(
        name: impl Into<String>,
        base_size: usize,
        item_size: usize,
        item_kind: FieldKind,
        length_offset: Option<usize>,
        type_id: u32,
    ) -> Self {
        Self {
            name: name.into(),
            base_size,
            item_size,
            item_kind,
            length_offset,
            type_id,
            item_fields: Vec::new(),
        }
    }

    /// Builder-style interior field of a struct item
    pub fn item_field(mut self, name: &str, offset: usize, size: usize, kind: FieldKind) -> Self {
        self.item_fields.push(FieldLayout::new(name, offset, size, kind));
        self
    }
}

/// Argument and result kinds for foreign calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgKind {
    /// Integer of `size` bytes (1, 2, 4 or 8)
    Int {
        /// Width in bytes
        size: u8,
        /// Signedness
        signed: bool,
    },
    /// Raw pointer
    Pointer,
    /// GC reference
    Ref,
    /// Double
    Float,
    /// Single-precision float, carried in traces as its bit pattern (an int)
    SingleFloat,
    /// No value (results only)
    Void,
}

impl ArgKind {
    /// Signed machine word
    pub const LONG: ArgKind = ArgKind::Int {
        size: 8,
        signed: true,
    };

    /// Trace type carrying a value of this kind
    pub const fn value_type(self) -> Type {
        match self {
            Self::Int { .. } | Self::Pointer | Self::SingleFloat => Type::Int,
            Self::Ref => Type::Ref,
            Self::Float => Type::Float,
            Self::Void => Type::Void,
        }
    }
}

/// Calling convention tag of a foreign function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CallConvention {
    /// Platform C convention
    #[default]
    Cdecl,
    /// Windows `__stdcall`; identical to `Cdecl` on 64-bit targets
    Stdcall,
}

/// What a callee may do, as far as the backend cares
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EffectInfo {
    /// The callee may leave an exception pending
    pub can_raise: bool,
    /// The callee may force the calling frame
    pub may_force: bool,
}

/// A foreign function signature
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallSignature {
    /// Argument kinds, in order
    pub args: Vec<ArgKind>,
    /// Result kind
    pub result: ArgKind,
    /// Calling convention
    pub convention: CallConvention,
    /// Effect summary
    pub effect: EffectInfo,
}

impl CallSignature {
    /// Cdecl signature without effects
    pub fn new(args: Vec<ArgKind>, result: ArgKind) -> Self {
        Self {
            args,
            result,
            convention: CallConvention::Cdecl,
            effect: EffectInfo::default(),
        }
    }

    /// Builder-style convention
    pub fn with_convention(mut self, convention: CallConvention) -> Self {
        self.convention = convention;
        self
    }

    /// Builder-style effect summary
    pub fn with_effect(mut self, effect: EffectInfo) -> Self {
        self.effect = effect;
        self
    }
}
