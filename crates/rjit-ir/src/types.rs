//! Value types, constants and references

use std::fmt;

/// The type of a trace value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    /// Machine-word integer (also raw addresses and singlefloat bits)
    Int,
    /// GC reference
    Ref,
    /// IEEE-754 double
    Float,
    /// No value
    Void,
}

impl Type {
    /// One-letter code used in trace dumps (`i`, `r`, `f`, `v`)
    #[inline]
    pub const fn as_char(self) -> char {
        match self {
            Self::Int => 'i',
            Self::Ref => 'r',
            Self::Float => 'f',
            Self::Void => 'v',
        }
    }

    /// Parse a one-letter type code
    pub const fn from_char(c: char) -> Option<Self> {
        match c {
            'i' => Some(Self::Int),
            'r' => Some(Self::Ref),
            'f' => Some(Self::Float),
            'v' => Some(Self::Void),
            _ => None,
        }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Identifier of a value produced inside one trace (input argument or op result)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ValueId(pub u32);

impl ValueId {
    /// Create a new value id
    #[inline]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Get the index
    #[inline]
    pub const fn index(self) -> u32 {
        self.0
    }
}

/// Address of a GC-managed object, or null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct GcRef(pub usize);

impl GcRef {
    /// The null reference
    pub const NULL: GcRef = GcRef(0);

    /// Wrap a raw pointer
    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    /// Raw pointer view
    #[inline]
    pub fn as_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Whether this is the null reference
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address as an integer
    #[inline]
    pub const fn addr(self) -> usize {
        self.0
    }
}

/// A runtime value passed to or read from compiled code
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// Integer
    Int(i64),
    /// Double
    Float(f64),
    /// GC reference
    Ref(GcRef),
}

impl Value {
    /// Type of this value
    pub const fn ty(self) -> Type {
        match self {
            Self::Int(_) => Type::Int,
            Self::Float(_) => Type::Float,
            Self::Ref(_) => Type::Ref,
        }
    }

    /// Raw 64-bit representation as stored in frame slots
    pub fn to_bits(self) -> u64 {
        match self {
            Self::Int(v) => v as u64,
            Self::Float(v) => v.to_bits(),
            Self::Ref(r) => r.addr() as u64,
        }
    }

    /// Rebuild a value of type `ty` from its slot bits
    pub fn from_bits(ty: Type, bits: u64) -> Self {
        match ty {
            Type::Int => Self::Int(bits as i64),
            Type::Float => Self::Float(f64::from_bits(bits)),
            Type::Ref => Self::Ref(GcRef(bits as usize)),
            Type::Void => panic!("void has no value representation"),
        }
    }
}

/// Compile-time constant operand
///
/// Floats are stored as raw bits so that constants hash and compare exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Const {
    /// Integer constant
    Int(i64),
    /// Float constant (IEEE-754 bits)
    Float(u64),
    /// Reference constant
    Ref(GcRef),
}

impl Const {
    /// Float constant from a double
    #[inline]
    pub fn float(value: f64) -> Self {
        Self::Float(value.to_bits())
    }

    /// Type of the constant
    pub const fn ty(self) -> Type {
        match self {
            Self::Int(_) => Type::Int,
            Self::Float(_) => Type::Float,
            Self::Ref(_) => Type::Ref,
        }
    }

    /// Raw 64-bit representation
    pub const fn to_bits(self) -> u64 {
        match self {
            Self::Int(v) => v as u64,
            Self::Float(bits) => bits,
            Self::Ref(r) => r.0 as u64,
        }
    }

    /// Integer payload, if this is an integer constant
    pub const fn as_int(self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(v),
            _ => None,
        }
    }
}

impl From<Value> for Const {
    fn from(value: Value) -> Self {
        match value {
            Value::Int(v) => Const::Int(v),
            Value::Float(v) => Const::float(v),
            Value::Ref(r) => Const::Ref(r),
        }
    }
}
