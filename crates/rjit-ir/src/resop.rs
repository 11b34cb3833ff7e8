//! Trace operations

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::descr::{Descr, FailDescr};
use crate::opcode::OpCode;
use crate::types::{Const, GcRef, Type, ValueId};

/// Argument of an operation: an earlier value or a constant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    /// Input argument or result of an earlier operation
    Value(ValueId),
    /// Constant
    Const(Const),
}

impl Operand {
    /// Integer constant operand
    #[inline]
    pub const fn int(v: i64) -> Self {
        Self::Const(Const::Int(v))
    }

    /// Float constant operand
    #[inline]
    pub fn float(v: f64) -> Self {
        Self::Const(Const::float(v))
    }

    /// Reference constant operand
    #[inline]
    pub const fn gcref(r: GcRef) -> Self {
        Self::Const(Const::Ref(r))
    }

    /// The value id, if this is not a constant
    pub const fn as_value(self) -> Option<ValueId> {
        match self {
            Self::Value(v) => Some(v),
            Self::Const(_) => None,
        }
    }

    /// The constant, if this is one
    pub const fn as_const(self) -> Option<Const> {
        match self {
            Self::Const(c) => Some(c),
            Self::Value(_) => None,
        }
    }
}

impl From<ValueId> for Operand {
    fn from(v: ValueId) -> Self {
        Self::Value(v)
    }
}

impl From<Const> for Operand {
    fn from(c: Const) -> Self {
        Self::Const(c)
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => write!(f, "v{}", v.index()),
            Self::Const(Const::Int(i)) => write!(f, "{i}"),
            Self::Const(Const::Float(bits)) => write!(f, "{}", f64::from_bits(*bits)),
            Self::Const(Const::Ref(r)) => write!(f, "ConstPtr(0x{:x})", r.addr()),
        }
    }
}

/// One operation of a trace.
///
/// Operations are plain data once built; the trace producer is trusted to
/// pair opcodes with the right argument types and descriptors.
#[derive(Debug, Clone)]
pub struct ResOperation {
    /// Opcode
    pub opnum: OpCode,
    /// Arguments
    pub args: SmallVec<[Operand; 3]>,
    /// Descriptor, if the opcode takes one
    pub descr: Option<Descr>,
    /// Id of the produced value (`None` for void operations)
    pub result: Option<ValueId>,
    /// Values to reconstruct when this guard fails, by index
    pub fail_args: Option<Vec<ValueId>>,
}

impl ResOperation {
    /// Build an operation without a result slot
    pub fn new(opnum: OpCode, args: &[Operand], descr: Option<Descr>) -> Self {
        Self {
            opnum,
            args: SmallVec::from_slice(args),
            descr,
            result: None,
            fail_args: None,
        }
    }

    /// Builder-style result slot
    pub fn with_result(mut self, result: ValueId) -> Self {
        self.result = Some(result);
        self
    }

    /// Builder-style fail arguments
    pub fn with_fail_args(mut self, fail_args: Vec<ValueId>) -> Self {
        self.fail_args = Some(fail_args);
        self
    }

    /// Result type (`Void` for operations producing nothing)
    #[inline]
    pub fn result_type(&self) -> Type {
        self.opnum.result_type()
    }

    /// Whether this is a guard
    #[inline]
    pub fn is_guard(&self) -> bool {
        self.opnum.is_guard()
    }

    /// Whether the operation may leave an exception pending
    #[inline]
    pub fn can_raise(&self) -> bool {
        self.opnum.can_raise()
    }

    /// Argument `i`
    #[inline]
    pub fn arg(&self, i: usize) -> Operand {
        self.args[i]
    }

    /// Number of arguments
    #[inline]
    pub fn num_args(&self) -> usize {
        self.args.len()
    }

    /// Fail arguments (empty for non-guards)
    pub fn fail_args(&self) -> &[ValueId] {
        self.fail_args.as_deref().unwrap_or(&[])
    }

    /// Replace the fail arguments
    pub fn set_fail_args(&mut self, fail_args: Vec<ValueId>) {
        self.fail_args = Some(fail_args);
    }

    /// The fail descriptor of a guard or finish
    pub fn fail_descr(&self) -> Option<&Arc<FailDescr>> {
        self.descr.as_ref().and_then(Descr::as_fail)
    }
}

impl fmt::Display for ResOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(r) = self.result {
            write!(f, "v{} = ", r.index())?;
        }
        write!(f, "{}(", self.opnum.name())?;
        for (i, a) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{a}")?;
        }
        write!(f, ")")?;
        if let Some(fail) = &self.fail_args {
            write!(f, " [")?;
            for (i, v) in fail.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "v{}", v.index())?;
            }
            write!(f, "]")?;
        }
        if let Some(d) = self.fail_descr() {
            write!(f, " descr={}", d.identifier())?;
        }
        Ok(())
    }
}
