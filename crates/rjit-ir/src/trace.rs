//! Traces and the trace builder

use std::fmt;
use std::sync::Arc;

use crate::descr::{CallDescr, Descr, FailDescr};
use crate::error::{Result, TraceError};
use crate::opcode::OpCode;
use crate::resop::{Operand, ResOperation};
use crate::token::TargetToken;
use crate::types::{Type, ValueId};

/// A linear sequence of operations with typed input arguments
#[derive(Debug, Clone, Default)]
pub struct Trace {
    /// Input arguments, in order
    pub inputargs: Vec<ValueId>,
    /// Operations; the last one is `FINISH` or `JUMP`
    pub operations: Vec<ResOperation>,
    value_types: Vec<Type>,
}

impl Trace {
    /// Assemble a trace from parts; `value_types` is indexed by [`ValueId`]
    pub fn from_parts(
        inputargs: Vec<ValueId>,
        operations: Vec<ResOperation>,
        value_types: Vec<Type>,
    ) -> Self {
        Self {
            inputargs,
            operations,
            value_types,
        }
    }

    /// Type of a value
    #[inline]
    pub fn type_of(&self, v: ValueId) -> Type {
        self.value_types[v.index() as usize]
    }

    /// Type of an operand
    pub fn operand_type(&self, op: Operand) -> Type {
        match op {
            Operand::Value(v) => self.type_of(v),
            Operand::Const(c) => c.ty(),
        }
    }

    /// Types of the input arguments
    pub fn inputarg_types(&self) -> Vec<Type> {
        self.inputargs.iter().map(|&v| self.type_of(v)).collect()
    }

    /// Number of value ids allocated
    pub fn num_values(&self) -> usize {
        self.value_types.len()
    }

    /// Check the structural invariants a compiled trace relies on.
    ///
    /// Arguments must refer to values defined earlier and still live (a
    /// `LABEL` ends the scope of everything it does not carry), guards need
    /// fail arguments and a guard descriptor, and the trace ends in exactly
    /// one terminal operation. Argument types are not checked.
    pub fn check_consistency(&self) -> Result<()> {
        const UNDEFINED: u8 = 0;
        const LIVE: u8 = 1;
        const DEAD: u8 = 2;

        let mut state = vec![UNDEFINED; self.value_types.len()];
        for &v in &self.inputargs {
            state[v.index() as usize] = LIVE;
        }

        let check_use = |state: &[u8], index: usize, opname: &'static str, v: ValueId| {
            match state.get(v.index() as usize).copied().unwrap_or(UNDEFINED) {
                LIVE => Ok(()),
                DEAD => Err(TraceError::OutOfLabelScope {
                    index,
                    opname,
                    value: v,
                }),
                _ => Err(TraceError::UndefinedValue {
                    index,
                    opname,
                    value: v,
                }),
            }
        };

        let last = self.operations.len().checked_sub(1);
        for (index, op) in self.operations.iter().enumerate() {
            let opname = op.opnum.name();

            if let Some(expected) = op.opnum.arity() {
                if op.args.len() != expected {
                    return Err(TraceError::Arity {
                        index,
                        opname,
                        expected,
                        got: op.args.len(),
                    });
                }
            }

            for arg in &op.args {
                if let Operand::Value(v) = *arg {
                    check_use(&state, index, opname, v)?;
                }
            }

            if op.opnum.is_guard() {
                let Some(fail_args) = &op.fail_args else {
                    return Err(TraceError::MissingFailArgs { index, opname });
                };
                for &v in fail_args {
                    check_use(&state, index, opname, v)?;
                }
                if !op.fail_descr().is_some_and(|d| !d.is_final()) {
                    return Err(TraceError::BadDescr {
                        index,
                        opname,
                        expected: "a guard fail descr",
                    });
                }
            } else if op.fail_args.is_some() {
                return Err(TraceError::UnexpectedFailArgs { index, opname });
            }

            check_descr(index, op)?;

            if op.opnum.is_final() && Some(index) != last {
                return Err(TraceError::TerminalNotLast { index });
            }

            if op.opnum == OpCode::Label {
                for s in state.iter_mut().filter(|s| **s == LIVE) {
                    *s = DEAD;
                }
                for arg in &op.args {
                    if let Operand::Value(v) = *arg {
                        state[v.index() as usize] = LIVE;
                    }
                }
            }

            match (op.result, op.opnum.result_type()) {
                (None, Type::Void) => {}
                (Some(r), ty) if ty != Type::Void => {
                    let slot = r.index() as usize;
                    if self.value_types.get(slot) != Some(&ty) {
                        return Err(TraceError::ResultMismatch { index, opname });
                    }
                    if state[slot] != UNDEFINED {
                        return Err(TraceError::Redefinition { index, value: r });
                    }
                    state[slot] = LIVE;
                }
                _ => return Err(TraceError::ResultMismatch { index, opname }),
            }
        }

        match self.operations.last() {
            Some(op) if op.opnum.is_final() => Ok(()),
            _ => Err(TraceError::MissingTerminal),
        }
    }
}

fn check_descr(index: usize, op: &ResOperation) -> Result<()> {
    use OpCode::*;
    let descr = op.descr.as_ref();
    let (ok, expected) = match op.opnum {
        Finish => (
            op.fail_descr().is_some_and(|d| d.is_final()),
            "a final fail descr",
        ),
        Label | Jump => (descr.and_then(Descr::as_target).is_some(), "a target token"),
        GetfieldGcI | GetfieldGcR | GetfieldGcF | GetfieldRawI | GetfieldRawF | SetfieldGc
        | SetfieldRaw => (descr.and_then(Descr::as_field).is_some(), "a field descr"),
        GetarrayitemGcI | GetarrayitemGcR | GetarrayitemGcF | GetarrayitemRawI
        | GetarrayitemRawF | SetarrayitemGc | SetarrayitemRaw | ArraylenGc | NewArray
        | NewArrayClear | ZeroArray | RawLoadI | RawLoadF | RawStore => {
            (descr.and_then(Descr::as_array).is_some(), "an array descr")
        }
        GetinteriorfieldGcI | GetinteriorfieldGcR | GetinteriorfieldGcF | SetinteriorfieldGc => (
            descr.and_then(Descr::as_interior_field).is_some(),
            "an interior field descr",
        ),
        New | NewWithVtable => (descr.and_then(Descr::as_size).is_some(), "a size descr"),
        CallAssemblerI | CallAssemblerR | CallAssemblerF | CallAssemblerN => {
            (descr.and_then(Descr::as_loop).is_some(), "a loop token")
        }
        code if code.is_call() => (descr.and_then(Descr::as_call).is_some(), "a call descr"),
        _ => (true, ""),
    };
    if ok {
        Ok(())
    } else {
        Err(TraceError::BadDescr {
            index,
            opname: op.opnum.name(),
            expected,
        })
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, v) in self.inputargs.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}{}", self.type_of(*v).as_char(), v.index())?;
        }
        writeln!(f, "]")?;
        for op in &self.operations {
            writeln!(f, "{op}")?;
        }
        Ok(())
    }
}

/// Incremental trace construction with value numbering.
///
/// ```
/// use rjit_ir::{FailDescr, OpCode, Operand, TargetToken, TraceBuilder, Type};
///
/// let mut b = TraceBuilder::new();
/// let i0 = b.input(Type::Int);
/// let target = TargetToken::new();
/// b.label(&[i0], &target);
/// let i1 = b.op(OpCode::IntAdd, &[i0.into(), Operand::int(1)]);
/// let i2 = b.op(OpCode::IntLe, &[i1.into(), Operand::int(9)]);
/// b.guard(OpCode::GuardTrue, &[i2.into()], &FailDescr::guard(1), &[i1]);
/// b.jump(&[i1.into()], &target);
/// let trace = b.build();
/// assert!(trace.check_consistency().is_ok());
/// ```
#[derive(Debug, Default)]
pub struct TraceBuilder {
    inputargs: Vec<ValueId>,
    operations: Vec<ResOperation>,
    value_types: Vec<Type>,
}

impl TraceBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh(&mut self, ty: Type) -> ValueId {
        let id = ValueId(self.value_types.len() as u32);
        self.value_types.push(ty);
        id
    }

    /// Add an input argument
    pub fn input(&mut self, ty: Type) -> ValueId {
        let v = self.fresh(ty);
        self.inputargs.push(v);
        v
    }

    /// Add several input arguments
    pub fn inputs(&mut self, types: &[Type]) -> Vec<ValueId> {
        types.iter().map(|&ty| self.input(ty)).collect()
    }

    /// Append a prebuilt operation, numbering its result
    pub fn push(&mut self, mut op: ResOperation) -> Option<ValueId> {
        let ty = op.opnum.result_type();
        op.result = (ty != Type::Void).then(|| self.fresh(ty));
        let result = op.result;
        self.operations.push(op);
        result
    }

    /// Append a value-producing operation without descriptor
    pub fn op(&mut self, opnum: OpCode, args: &[Operand]) -> ValueId {
        self.op_with_descr(opnum, args, None)
    }

    /// Append a value-producing operation
    pub fn op_with_descr(
        &mut self,
        opnum: OpCode,
        args: &[Operand],
        descr: impl Into<Option<Descr>>,
    ) -> ValueId {
        assert_ne!(opnum.result_type(), Type::Void, "{} has no result", opnum.name());
        self.push(ResOperation::new(opnum, args, descr.into()))
            .unwrap_or_else(|| unreachable!())
    }

    /// Append an operation producing nothing
    pub fn void(&mut self, opnum: OpCode, args: &[Operand], descr: impl Into<Option<Descr>>) {
        assert_eq!(opnum.result_type(), Type::Void, "{} produces a value", opnum.name());
        self.push(ResOperation::new(opnum, args, descr.into()));
    }

    /// Append a call-like operation: `func` followed by `args`
    pub fn call(
        &mut self,
        opnum: OpCode,
        func: Operand,
        args: &[Operand],
        descr: &Arc<CallDescr>,
    ) -> Option<ValueId> {
        let mut all = Vec::with_capacity(args.len() + 1);
        all.push(func);
        all.extend_from_slice(args);
        self.push(ResOperation::new(opnum, &all, Some(Descr::Call(descr.clone()))))
    }

    /// Append a guard; returns the result of `GUARD_EXCEPTION`
    pub fn guard(
        &mut self,
        opnum: OpCode,
        args: &[Operand],
        descr: &Arc<FailDescr>,
        fail_args: &[ValueId],
    ) -> Option<ValueId> {
        assert!(opnum.is_guard(), "{} is not a guard", opnum.name());
        self.push(
            ResOperation::new(opnum, args, Some(Descr::Fail(descr.clone())))
                .with_fail_args(fail_args.to_vec()),
        )
    }

    /// Append a `LABEL` carrying `args`
    pub fn label(&mut self, args: &[ValueId], target: &Arc<TargetToken>) {
        let args: Vec<Operand> = args.iter().map(|&v| v.into()).collect();
        self.push(ResOperation::new(
            OpCode::Label,
            &args,
            Some(Descr::Target(target.clone())),
        ));
    }

    /// Append a `JUMP` to `target`
    pub fn jump(&mut self, args: &[Operand], target: &Arc<TargetToken>) {
        self.push(ResOperation::new(
            OpCode::Jump,
            args,
            Some(Descr::Target(target.clone())),
        ));
    }

    /// Append a `FINISH`
    pub fn finish(&mut self, args: &[Operand], descr: &Arc<FailDescr>) {
        self.push(ResOperation::new(
            OpCode::Finish,
            args,
            Some(Descr::Fail(descr.clone())),
        ));
    }

    /// Finish building
    pub fn build(self) -> Trace {
        Trace {
            inputargs: self.inputargs,
            operations: self.operations,
            value_types: self.value_types,
        }
    }
}
