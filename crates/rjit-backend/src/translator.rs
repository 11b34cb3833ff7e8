//! Trace to Cranelift IR translation.
//!
//! Every trace becomes one function `(frame, ctx, entry) -> exit index`.
//! Entry 0 starts at the top of the trace with the input arguments read
//! from the frame slots; entry `k + 1` starts at the trace's `k`-th
//! `LABEL`. Leaving the trace stores the exit's values into the frame
//! slots and returns the index of the exit in [`Translation::exits`].
//!
//! Integers and references are `i64` values, floats are `f64`.

use std::sync::Arc;

use cranelift_codegen::ir::condcodes::{FloatCC, IntCC};
use cranelift_codegen::ir::immediates::Ieee64;
use cranelift_codegen::ir::instructions::BlockArg;
use cranelift_codegen::ir::{
    AbiParam, Block, FuncRef, InstBuilder, MemFlags, Signature, StackSlotData, StackSlotKind,
    Value, types,
};
use cranelift_codegen::isa::CallConv;
use cranelift_frontend::{FunctionBuilder, Switch};
use rjit_ir::{
    ArgKind, ArrayDescr, CallConvention, CallDescr, Const, Descr, FailDescr, OpCode, Operand, ResOperation,
    TargetToken, Trace, Type, ValueId,
};
use rjit_runtime::GcLayer;
use rjit_runtime::context::{
    CTX_EXC_CLASS_OFFSET, CTX_EXC_VALUE_OFFSET, CTX_NURSERY_FREE_OFFSET, CTX_NURSERY_TOP_OFFSET,
};
use rustc_hash::FxHashMap;

use crate::frame::{FRAME_FORCE_DESCR_OFFSET, FRAME_FORCED_OFFSET, FRAME_SLOTS_OFFSET};
use crate::runtime_helpers::{HelperKind, HelperRefs};

/// What the translator needs from the engine and the code region
pub(crate) struct TranslateEnv<'a> {
    /// Address of the `EngineShared`, passed to the runtime helpers
    pub shared: usize,
    pub gc: &'a dyn GcLayer,
    /// Address of the region's invalidation word
    pub invalidated_addr: usize,
    pub call_conv: CallConv,
    pub helpers: HelperRefs,
    /// Foreign function address -> replacement
    pub trampolines: &'a FxHashMap<usize, usize>,
}

/// How the trace may be left
pub(crate) enum ExitSpec {
    Finish {
        descr: Arc<FailDescr>,
        types: Vec<Type>,
    },
    Guard {
        descr: Arc<FailDescr>,
        types: Vec<Type>,
        opnum: OpCode,
    },
    /// Jump to a label compiled in another trace
    Jump {
        target: Arc<TargetToken>,
        types: Vec<Type>,
    },
}

/// A label of this trace and the entry index that reaches it
pub(crate) struct LabelSpec {
    pub target: Arc<TargetToken>,
    pub entry: u64,
    pub types: Vec<Type>,
}

pub(crate) struct Translation {
    pub exits: Vec<ExitSpec>,
    pub labels: Vec<LabelSpec>,
    /// Slots the trace reads or writes
    pub frame_depth: usize,
}

/// Translate `trace` into the function under construction in `builder`
pub(crate) fn translate_trace(
    builder: &mut FunctionBuilder<'_>,
    env: &TranslateEnv<'_>,
    trace: &Trace,
) -> Translation {
    let entry_block = builder.create_block();
    builder.append_block_params_for_function_params(entry_block);
    builder.switch_to_block(entry_block);
    let params = builder.block_params(entry_block).to_vec();
    let (frame, ctx, entry) = (params[0], params[1], params[2]);
    let slots = builder
        .ins()
        .load(types::I64, MemFlags::trusted(), frame, FRAME_SLOTS_OFFSET);

    let mut t = Translator {
        b: builder,
        env,
        trace,
        values: vec![None; trace.num_values()],
        frame,
        ctx,
        slots,
        ovf: None,
        labels: FxHashMap::default(),
        exits: Vec::new(),
        label_specs: Vec::new(),
        frame_depth: trace.inputargs.len().max(1),
    };

    let label_entries = t.declare_labels();
    let start = t.b.create_block();
    if label_entries.is_empty() {
        t.b.ins().jump(start, &[]);
    } else {
        let mut switch = Switch::new();
        for (k, block) in label_entries.iter().enumerate() {
            switch.set_entry((k + 1) as u128, *block);
        }
        switch.emit(t.b, entry, start);
    }
    for (k, block) in label_entries.into_iter().enumerate() {
        t.b.switch_to_block(block);
        let types = t.label_specs[k].types.clone();
        let target = t.label_specs[k].target.number();
        let args: Vec<BlockArg> = types
            .iter()
            .enumerate()
            .map(|(i, &ty)| BlockArg::Value(t.load_slot(i, ty)))
            .collect();
        let label_block = t.labels[&target];
        t.b.ins().jump(label_block, &args);
    }

    t.b.switch_to_block(start);
    for (i, &v) in trace.inputargs.iter().enumerate() {
        let loaded = t.load_slot(i, trace.type_of(v));
        t.values[v.index() as usize] = Some(loaded);
    }
    for (index, op) in trace.operations.iter().enumerate() {
        t.translate_op(index, op);
    }
    t.b.seal_all_blocks();

    Translation {
        exits: t.exits,
        labels: t.label_specs,
        frame_depth: t.frame_depth,
    }
}

fn cl_type(ty: Type) -> types::Type {
    match ty {
        Type::Float => types::F64,
        Type::Int | Type::Ref => types::I64,
        Type::Void => panic!("void values have no machine type"),
    }
}

fn int_type(size: u8) -> types::Type {
    match size {
        1 => types::I8,
        2 => types::I16,
        4 => types::I32,
        8 => types::I64,
        _ => panic!("unsupported integer width {size}"),
    }
}

fn abi_param(kind: ArgKind) -> AbiParam {
    match kind {
        ArgKind::Int { size: 8, .. } | ArgKind::Pointer | ArgKind::Ref => {
            AbiParam::new(types::I64)
        }
        ArgKind::Int { size, signed: true } => AbiParam::new(int_type(size)).sext(),
        ArgKind::Int { size, signed: false } => AbiParam::new(int_type(size)).uext(),
        ArgKind::Float => AbiParam::new(types::F64),
        ArgKind::SingleFloat => AbiParam::new(types::F32),
        ArgKind::Void => panic!("void is not an argument kind"),
    }
}

fn round_up8(n: usize) -> usize {
    (n + 7) & !7
}

fn const_arg(op: &ResOperation, i: usize) -> i64 {
    op.arg(i)
        .as_const()
        .and_then(Const::as_int)
        .unwrap_or_else(|| panic!("{} expects a constant integer as argument {i}", op.opnum.name()))
}

fn call_descr(op: &ResOperation) -> &Arc<CallDescr> {
    op.descr
        .as_ref()
        .and_then(Descr::as_call)
        .unwrap_or_else(|| panic!("{} needs a call descr", op.opnum.name()))
}

fn array_descr(op: &ResOperation) -> &Arc<ArrayDescr> {
    op.descr
        .as_ref()
        .and_then(Descr::as_array)
        .unwrap_or_else(|| panic!("{} needs an array descr", op.opnum.name()))
}

struct Translator<'a, 'f, 'e> {
    b: &'a mut FunctionBuilder<'f>,
    env: &'a TranslateEnv<'e>,
    trace: &'a Trace,
    values: Vec<Option<Value>>,
    frame: Value,
    ctx: Value,
    slots: Value,
    /// Overflow flag of the last `_OVF` operation
    ovf: Option<Value>,
    labels: FxHashMap<u64, Block>,
    exits: Vec<ExitSpec>,
    label_specs: Vec<LabelSpec>,
    frame_depth: usize,
}

impl Translator<'_, '_, '_> {
    // -----------------------------------------------------------------------
    // Values and slots
    // -----------------------------------------------------------------------

    fn declare_labels(&mut self) -> Vec<Block> {
        let mut entries = Vec::new();
        for op in self.trace.operations.iter().filter(|op| op.opnum == OpCode::Label) {
            let target = op
                .descr
                .as_ref()
                .and_then(Descr::as_target)
                .unwrap_or_else(|| panic!("label without target token"))
                .clone();
            let types: Vec<Type> = op.args.iter().map(|&a| self.trace.operand_type(a)).collect();
            let block = self.b.create_block();
            for &ty in &types {
                self.b.append_block_param(block, cl_type(ty));
            }
            self.frame_depth = self.frame_depth.max(types.len());
            self.labels.insert(target.number(), block);
            entries.push(self.b.create_block());
            self.label_specs.push(LabelSpec {
                target,
                entry: entries.len() as u64,
                types,
            });
        }
        entries
    }

    fn value_of(&self, v: ValueId) -> Value {
        self.values[v.index() as usize]
            .unwrap_or_else(|| panic!("v{} used before its definition", v.index()))
    }

    fn operand(&mut self, op: Operand) -> Value {
        match op {
            Operand::Value(v) => self.value_of(v),
            Operand::Const(Const::Float(bits)) => self.b.ins().f64const(Ieee64::with_bits(bits)),
            Operand::Const(c) => self.b.ins().iconst(types::I64, c.to_bits() as i64),
        }
    }

    fn define(&mut self, op: &ResOperation, value: Value) {
        if let Some(r) = op.result {
            self.values[r.index() as usize] = Some(value);
        }
    }

    fn iconst(&mut self, v: i64) -> Value {
        self.b.ins().iconst(types::I64, v)
    }

    fn bool_to_int(&mut self, cond: Value) -> Value {
        self.b.ins().uextend(types::I64, cond)
    }

    fn load_slot(&mut self, index: usize, ty: Type) -> Value {
        self.b
            .ins()
            .load(cl_type(ty), MemFlags::trusted(), self.slots, (index * 8) as i32)
    }

    fn store_slots(&mut self, values: &[Value]) {
        self.frame_depth = self.frame_depth.max(values.len());
        for (i, &v) in values.iter().enumerate() {
            self.b
                .ins()
                .store(MemFlags::trusted(), v, self.slots, (i * 8) as i32);
        }
    }

    fn leave(&mut self, values: &[Value], exit: ExitSpec) {
        self.store_slots(values);
        let index = self.exits.len() as i64;
        self.exits.push(exit);
        let index = self.iconst(index);
        self.b.ins().return_(&[index]);
    }

    fn call_helper(&mut self, kind: HelperKind, args: &[Value]) -> Option<Value> {
        let func: FuncRef = self.env.helpers.get(kind);
        let inst = self.b.ins().call(func, args);
        self.b.inst_results(inst).first().copied()
    }

    fn shared(&mut self) -> Value {
        self.iconst(self.env.shared as i64)
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    fn translate_op(&mut self, index: usize, op: &ResOperation) {
        use OpCode::*;
        match op.opnum {
            Label => self.translate_label(op),
            Jump => self.translate_jump(op),
            Finish => {
                let values: Vec<Value> = op.args.iter().map(|&a| self.operand(a)).collect();
                let types = op.args.iter().map(|&a| self.trace.operand_type(a)).collect();
                let descr = op
                    .fail_descr()
                    .unwrap_or_else(|| panic!("finish without fail descr"))
                    .clone();
                self.leave(&values, ExitSpec::Finish { descr, types });
            }

            GuardTrue | GuardFalse | GuardValue | GuardClass | GuardNonnull | GuardIsnull
            | GuardNonnullClass | GuardGcType | GuardNoException | GuardException
            | GuardNoOverflow | GuardOverflow | GuardNotForced | GuardNotInvalidated => {
                self.translate_guard(op)
            }

            IntAdd | IntSub | IntMul | IntAnd | IntOr | IntXor | IntLshift | IntRshift
            | UintRshift | UintMulHigh => {
                let x = self.operand(op.arg(0));
                let y = self.operand(op.arg(1));
                let ins = self.b.ins();
                let r = match op.opnum {
                    IntAdd => ins.iadd(x, y),
                    IntSub => ins.isub(x, y),
                    IntMul => ins.imul(x, y),
                    IntAnd => ins.band(x, y),
                    IntOr => ins.bor(x, y),
                    IntXor => ins.bxor(x, y),
                    IntLshift => ins.ishl(x, y),
                    IntRshift => ins.sshr(x, y),
                    UintRshift => ins.ushr(x, y),
                    _ => ins.umulhi(x, y),
                };
                self.define(op, r);
            }
            IntLt | IntLe | IntEq | IntNe | IntGt | IntGe | UintLt | UintLe | UintGt | UintGe
            | PtrEq | PtrNe | InstancePtrEq | InstancePtrNe => {
                let cc = match op.opnum {
                    IntLt => IntCC::SignedLessThan,
                    IntLe => IntCC::SignedLessThanOrEqual,
                    IntEq | PtrEq | InstancePtrEq => IntCC::Equal,
                    IntNe | PtrNe | InstancePtrNe => IntCC::NotEqual,
                    IntGt => IntCC::SignedGreaterThan,
                    IntGe => IntCC::SignedGreaterThanOrEqual,
                    UintLt => IntCC::UnsignedLessThan,
                    UintLe => IntCC::UnsignedLessThanOrEqual,
                    UintGt => IntCC::UnsignedGreaterThan,
                    _ => IntCC::UnsignedGreaterThanOrEqual,
                };
                let x = self.operand(op.arg(0));
                let y = self.operand(op.arg(1));
                let c = self.b.ins().icmp(cc, x, y);
                let r = self.bool_to_int(c);
                self.define(op, r);
            }
            IntIsTrue | IntIsZero => {
                let x = self.operand(op.arg(0));
                let cc = if op.opnum == IntIsTrue {
                    IntCC::NotEqual
                } else {
                    IntCC::Equal
                };
                let c = self.b.ins().icmp_imm(cc, x, 0);
                let r = self.bool_to_int(c);
                self.define(op, r);
            }
            IntNeg | IntInvert | IntForceGeZero => {
                let x = self.operand(op.arg(0));
                let r = match op.opnum {
                    IntNeg => self.b.ins().ineg(x),
                    IntInvert => self.b.ins().bnot(x),
                    _ => {
                        let zero = self.iconst(0);
                        self.b.ins().smax(x, zero)
                    }
                };
                self.define(op, r);
            }
            IntSignext => {
                let x = self.operand(op.arg(0));
                let r = match const_arg(op, 1) {
                    8 => x,
                    n @ (1 | 2 | 4) => {
                        let narrow = self.b.ins().ireduce(int_type(n as u8), x);
                        self.b.ins().sextend(types::I64, narrow)
                    }
                    n => panic!("int_signext to {n} bytes"),
                };
                self.define(op, r);
            }
            IntAddOvf | IntSubOvf | IntMulOvf => self.translate_ovf(op),

            FloatAdd | FloatSub | FloatMul | FloatTrueDiv => {
                let x = self.operand(op.arg(0));
                let y = self.operand(op.arg(1));
                let ins = self.b.ins();
                let r = match op.opnum {
                    FloatAdd => ins.fadd(x, y),
                    FloatSub => ins.fsub(x, y),
                    FloatMul => ins.fmul(x, y),
                    _ => ins.fdiv(x, y),
                };
                self.define(op, r);
            }
            FloatNeg | FloatAbs => {
                let x = self.operand(op.arg(0));
                let r = if op.opnum == FloatNeg {
                    self.b.ins().fneg(x)
                } else {
                    self.b.ins().fabs(x)
                };
                self.define(op, r);
            }
            FloatLt | FloatLe | FloatEq | FloatNe | FloatGt | FloatGe => {
                let cc = match op.opnum {
                    FloatLt => FloatCC::LessThan,
                    FloatLe => FloatCC::LessThanOrEqual,
                    FloatEq => FloatCC::Equal,
                    FloatNe => FloatCC::NotEqual,
                    FloatGt => FloatCC::GreaterThan,
                    _ => FloatCC::GreaterThanOrEqual,
                };
                let x = self.operand(op.arg(0));
                let y = self.operand(op.arg(1));
                let c = self.b.ins().fcmp(cc, x, y);
                let r = self.bool_to_int(c);
                self.define(op, r);
            }
            CastFloatToInt => {
                let x = self.operand(op.arg(0));
                let r = self.b.ins().fcvt_to_sint_sat(types::I64, x);
                self.define(op, r);
            }
            CastIntToFloat => {
                let x = self.operand(op.arg(0));
                let r = self.b.ins().fcvt_from_sint(types::F64, x);
                self.define(op, r);
            }
            CastFloatToSinglefloat => {
                let x = self.operand(op.arg(0));
                let single = self.b.ins().fdemote(types::F32, x);
                let bits = self.b.ins().bitcast(types::I32, MemFlags::new(), single);
                let r = self.b.ins().uextend(types::I64, bits);
                self.define(op, r);
            }
            CastSinglefloatToFloat => {
                let x = self.operand(op.arg(0));
                let bits = self.b.ins().ireduce(types::I32, x);
                let single = self.b.ins().bitcast(types::F32, MemFlags::new(), bits);
                let r = self.b.ins().fpromote(types::F64, single);
                self.define(op, r);
            }
            ConvertFloatBytesToLonglong => {
                let x = self.operand(op.arg(0));
                let r = self.b.ins().bitcast(types::I64, MemFlags::new(), x);
                self.define(op, r);
            }
            ConvertLonglongBytesToFloat => {
                let x = self.operand(op.arg(0));
                let r = self.b.ins().bitcast(types::F64, MemFlags::new(), x);
                self.define(op, r);
            }
            CastPtrToInt | CastIntToPtr | SameAsI | SameAsR | SameAsF => {
                let x = self.operand(op.arg(0));
                self.define(op, x);
            }

            GetfieldGcI | GetfieldGcR | GetfieldGcF | GetfieldRawI | GetfieldRawF
            | SetfieldGc | SetfieldRaw | GetarrayitemGcI | GetarrayitemGcR | GetarrayitemGcF
            | GetarrayitemRawI | GetarrayitemRawF | SetarrayitemGc | SetarrayitemRaw
            | ArraylenGc | GetinteriorfieldGcI | GetinteriorfieldGcR | GetinteriorfieldGcF
            | SetinteriorfieldGc | RawLoadI | RawLoadF | RawStore | GcLoadI | GcLoadR
            | GcLoadF | GcLoadIndexedI | GcLoadIndexedR | GcLoadIndexedF | GcStore
            | GcStoreIndexed => self.translate_memory(op),

            New | NewWithVtable => self.translate_new(op),
            NewArray | NewArrayClear => self.translate_new_array(op),
            ZeroArray => self.translate_zero_array(op),
            CondCallGcWb => self.translate_write_barrier(op),
            CondCallGcWbArray => self.translate_write_barrier_array(op),

            CallI | CallR | CallF | CallN | CallPureI | CallPureR | CallPureF | CallPureN
            | CallLoopinvariantI | CallLoopinvariantR | CallLoopinvariantF
            | CallLoopinvariantN => {
                let descr = call_descr(op).clone();
                if let Some(r) = self.emit_call(op.arg(0), &op.args[1..], &descr) {
                    self.define(op, r);
                }
            }
            CallMayForceI | CallMayForceR | CallMayForceF | CallMayForceN => {
                let spilled = self.spill_for_force(index);
                let descr = call_descr(op).clone();
                if let Some(r) = self.emit_call(op.arg(0), &op.args[1..], &descr) {
                    self.define(op, r);
                }
                self.end_forcible_call(spilled);
            }
            CallReleaseGilI | CallReleaseGilF | CallReleaseGilN => {
                let spilled = self.spill_for_force(index);
                self.translate_release_gil(op);
                self.end_forcible_call(spilled);
            }
            CallAssemblerI | CallAssemblerR | CallAssemblerF | CallAssemblerN => {
                let spilled = self.spill_for_force(index);
                self.translate_call_assembler(op);
                self.end_forcible_call(spilled);
            }
            CondCall => self.translate_cond_call(op),
            CondCallValueI | CondCallValueR => self.translate_cond_call_value(op),

            SaveExcClass => {
                let r = self.b.ins().load(
                    types::I64,
                    MemFlags::trusted(),
                    self.ctx,
                    CTX_EXC_CLASS_OFFSET,
                );
                self.define(op, r);
            }
            SaveException => {
                let r = self.take_exception_value();
                self.define(op, r);
            }
            RestoreException => {
                let class = self.operand(op.arg(0));
                let value = self.operand(op.arg(1));
                let flags = MemFlags::trusted();
                self.b
                    .ins()
                    .store(flags, class, self.ctx, CTX_EXC_CLASS_OFFSET);
                self.b
                    .ins()
                    .store(flags, value, self.ctx, CTX_EXC_VALUE_OFFSET);
            }

            ForceToken => {
                let frame = self.frame;
                self.define(op, frame);
            }
            IncrementDebugCounter => {
                let addr = self.operand(op.arg(0));
                let old = self.b.ins().load(types::I64, MemFlags::new(), addr, 0);
                let new = self.b.ins().iadd_imm(old, 1);
                self.b.ins().store(MemFlags::new(), new, addr, 0);
            }
            DebugMergePoint | EnterPortalFrame | LeavePortalFrame | Keepalive
            | QuasiimmutField | RecordExactClass => {}
        }
    }

    // -----------------------------------------------------------------------
    // Control flow
    // -----------------------------------------------------------------------

    fn translate_label(&mut self, op: &ResOperation) {
        let target = op
            .descr
            .as_ref()
            .and_then(Descr::as_target)
            .unwrap_or_else(|| panic!("label without target token"));
        let block = self.labels[&target.number()];
        let args: Vec<BlockArg> = op
            .args
            .iter()
            .map(|&a| BlockArg::Value(self.operand(a)))
            .collect();
        self.b.ins().jump(block, &args);
        self.b.switch_to_block(block);
        let params = self.b.block_params(block).to_vec();
        for (arg, param) in op.args.iter().zip(params) {
            if let Operand::Value(v) = arg {
                self.values[v.index() as usize] = Some(param);
            }
        }
        self.ovf = None;
    }

    fn translate_jump(&mut self, op: &ResOperation) {
        let target = op
            .descr
            .as_ref()
            .and_then(Descr::as_target)
            .unwrap_or_else(|| panic!("jump without target token"))
            .clone();
        let values: Vec<Value> = op.args.iter().map(|&a| self.operand(a)).collect();
        match self.labels.get(&target.number()).copied() {
            Some(block) => {
                let args: Vec<BlockArg> = values.into_iter().map(BlockArg::Value).collect();
                self.b.ins().jump(block, &args);
            }
            None => {
                let types = op.args.iter().map(|&a| self.trace.operand_type(a)).collect();
                self.leave(&values, ExitSpec::Jump { target, types })
            }
        }
    }

    // -----------------------------------------------------------------------
    // Guards
    // -----------------------------------------------------------------------

    /// Continue in a fresh block when `pass` is non-zero, else branch to `fail`
    fn pass_if(&mut self, pass: Value, fail: Block) {
        let cont = self.b.create_block();
        self.b.ins().brif(pass, cont, &[], fail, &[]);
        self.b.switch_to_block(cont);
    }

    fn is_zero(&mut self, x: Value) -> Value {
        self.b.ins().icmp_imm(IntCC::Equal, x, 0)
    }

    fn class_matches(&mut self, obj: Value, class: Value) -> Value {
        let vtable = self.b.ins().load(
            types::I64,
            MemFlags::trusted(),
            obj,
            self.env.gc.vtable_offset() as i32,
        );
        self.b.ins().icmp(IntCC::Equal, vtable, class)
    }

    fn translate_guard(&mut self, op: &ResOperation) {
        use OpCode::*;
        let fail = self.b.create_block();
        self.b.set_cold_block(fail);
        match op.opnum {
            GuardTrue | GuardNonnull => {
                let x = self.operand(op.arg(0));
                self.pass_if(x, fail);
            }
            GuardFalse | GuardIsnull => {
                let x = self.operand(op.arg(0));
                let pass = self.is_zero(x);
                self.pass_if(pass, fail);
            }
            GuardValue => {
                let mut x = self.operand(op.arg(0));
                let mut y = self.operand(op.arg(1));
                if self.trace.operand_type(op.arg(0)) == Type::Float {
                    x = self.b.ins().bitcast(types::I64, MemFlags::new(), x);
                    y = self.b.ins().bitcast(types::I64, MemFlags::new(), y);
                }
                let pass = self.b.ins().icmp(IntCC::Equal, x, y);
                self.pass_if(pass, fail);
            }
            GuardClass => {
                let obj = self.operand(op.arg(0));
                let class = self.operand(op.arg(1));
                let pass = self.class_matches(obj, class);
                self.pass_if(pass, fail);
            }
            GuardNonnullClass => {
                let obj = self.operand(op.arg(0));
                self.pass_if(obj, fail);
                let class = self.operand(op.arg(1));
                let pass = self.class_matches(obj, class);
                self.pass_if(pass, fail);
            }
            GuardGcType => {
                let obj = self.operand(op.arg(0));
                let tid = self.operand(op.arg(1));
                let header = self
                    .b
                    .ins()
                    .load(types::I64, MemFlags::trusted(), obj, 0);
                let low = self.b.ins().band_imm(header, 0xffff_ffff);
                let pass = self.b.ins().icmp(IntCC::Equal, low, tid);
                self.pass_if(pass, fail);
            }
            GuardNoException => {
                let class = self.b.ins().load(
                    types::I64,
                    MemFlags::trusted(),
                    self.ctx,
                    CTX_EXC_CLASS_OFFSET,
                );
                let pass = self.is_zero(class);
                self.pass_if(pass, fail);
            }
            GuardException => {
                let expected = self.operand(op.arg(0));
                let class = self.b.ins().load(
                    types::I64,
                    MemFlags::trusted(),
                    self.ctx,
                    CTX_EXC_CLASS_OFFSET,
                );
                let pass = self.b.ins().icmp(IntCC::Equal, class, expected);
                self.pass_if(pass, fail);
            }
            GuardNoOverflow | GuardOverflow => {
                let ovf = self.ovf.take().unwrap_or_else(|| {
                    panic!("{} does not follow an overflow-checking operation", op.opnum.name())
                });
                if op.opnum == GuardNoOverflow {
                    let pass = self.is_zero(ovf);
                    self.pass_if(pass, fail);
                } else {
                    self.pass_if(ovf, fail);
                }
            }
            GuardNotForced => {
                let forced = self.b.ins().load(
                    types::I64,
                    MemFlags::trusted(),
                    self.frame,
                    FRAME_FORCED_OFFSET,
                );
                let pass = self.is_zero(forced);
                self.pass_if(pass, fail);
            }
            GuardNotInvalidated => {
                let addr = self.iconst(self.env.invalidated_addr as i64);
                let flag = self
                    .b
                    .ins()
                    .load(types::I64, MemFlags::trusted(), addr, 0);
                let pass = self.is_zero(flag);
                self.pass_if(pass, fail);
            }
            other => unreachable!("{} is not a guard", other.name()),
        }

        let cont = self
            .b
            .current_block()
            .unwrap_or_else(|| unreachable!("guard continuation block"));
        let descr = op
            .fail_descr()
            .unwrap_or_else(|| panic!("{} without fail descr", op.opnum.name()))
            .clone();
        let values: Vec<Value> = op.fail_args().iter().map(|&v| self.value_of(v)).collect();
        let types = op.fail_args().iter().map(|&v| self.trace.type_of(v)).collect();
        self.b.switch_to_block(fail);
        self.leave(
            &values,
            ExitSpec::Guard {
                descr,
                types,
                opnum: op.opnum,
            },
        );
        self.b.switch_to_block(cont);

        if op.opnum == GuardException {
            let value = self.take_exception_value();
            self.define(op, value);
        }
    }

    fn take_exception_value(&mut self) -> Value {
        let flags = MemFlags::trusted();
        let value = self
            .b
            .ins()
            .load(types::I64, flags, self.ctx, CTX_EXC_VALUE_OFFSET);
        let zero = self.iconst(0);
        self.b.ins().store(flags, zero, self.ctx, CTX_EXC_CLASS_OFFSET);
        self.b.ins().store(flags, zero, self.ctx, CTX_EXC_VALUE_OFFSET);
        value
    }

    fn translate_ovf(&mut self, op: &ResOperation) {
        let x = self.operand(op.arg(0));
        let y = self.operand(op.arg(1));
        let (r, ovf) = match op.opnum {
            OpCode::IntAddOvf => {
                let r = self.b.ins().iadd(x, y);
                let a = self.b.ins().bxor(x, r);
                let c = self.b.ins().bxor(y, r);
                let both = self.b.ins().band(a, c);
                (r, self.b.ins().icmp_imm(IntCC::SignedLessThan, both, 0))
            }
            OpCode::IntSubOvf => {
                let r = self.b.ins().isub(x, y);
                let a = self.b.ins().bxor(x, y);
                let c = self.b.ins().bxor(x, r);
                let both = self.b.ins().band(a, c);
                (r, self.b.ins().icmp_imm(IntCC::SignedLessThan, both, 0))
            }
            _ => {
                let r = self.b.ins().imul(x, y);
                let high = self.b.ins().smulhi(x, y);
                let sign = self.b.ins().sshr_imm(r, 63);
                (r, self.b.ins().icmp(IntCC::NotEqual, high, sign))
            }
        };
        self.ovf = Some(ovf);
        self.define(op, r);
    }

    // -----------------------------------------------------------------------
    // Memory
    // -----------------------------------------------------------------------

    /// `base + index * scale + offset`, folding constants into the offset
    fn element_addr(&mut self, base: Value, index: Operand, scale: i64, offset: i64) -> (Value, i32) {
        let (addr, total) = match index.as_const() {
            Some(c) => (base, offset.wrapping_add((c.to_bits() as i64).wrapping_mul(scale))),
            None => {
                let idx = self.operand(index);
                let scaled = if scale == 1 {
                    idx
                } else {
                    self.b.ins().imul_imm(idx, scale)
                };
                (self.b.ins().iadd(base, scaled), offset)
            }
        };
        match i32::try_from(total) {
            Ok(off) => (addr, off),
            Err(_) => (self.b.ins().iadd_imm(addr, total), 0),
        }
    }

    fn load_typed(
        &mut self,
        ty: Type,
        size: usize,
        signed: bool,
        flags: MemFlags,
        addr: Value,
        off: i32,
    ) -> Value {
        let ins = self.b.ins();
        match (ty, size) {
            (Type::Float, 8) => ins.load(types::F64, flags, addr, off),
            (Type::Float, 4) => {
                let single = ins.load(types::F32, flags, addr, off);
                self.b.ins().fpromote(types::F64, single)
            }
            (_, 8) => ins.load(types::I64, flags, addr, off),
            (Type::Int, 4) if signed => ins.sload32(flags, addr, off),
            (Type::Int, 4) => ins.uload32(flags, addr, off),
            (Type::Int, 2) if signed => ins.sload16(types::I64, flags, addr, off),
            (Type::Int, 2) => ins.uload16(types::I64, flags, addr, off),
            (Type::Int, 1) if signed => ins.sload8(types::I64, flags, addr, off),
            (Type::Int, 1) => ins.uload8(types::I64, flags, addr, off),
            _ => panic!("unsupported {ty} access of {size} bytes"),
        }
    }

    fn store_typed(
        &mut self,
        ty: Type,
        size: usize,
        flags: MemFlags,
        value: Value,
        addr: Value,
        off: i32,
    ) {
        match (ty, size) {
            (Type::Float, 8) | (Type::Int | Type::Ref, 8) => {
                self.b.ins().store(flags, value, addr, off);
            }
            (Type::Float, 4) => {
                let single = self.b.ins().fdemote(types::F32, value);
                self.b.ins().store(flags, single, addr, off);
            }
            (Type::Int, 4) => {
                self.b.ins().istore32(flags, value, addr, off);
            }
            (Type::Int, 2) => {
                self.b.ins().istore16(flags, value, addr, off);
            }
            (Type::Int, 1) => {
                self.b.ins().istore8(flags, value, addr, off);
            }
            _ => panic!("unsupported {ty} store of {size} bytes"),
        }
    }

    fn translate_memory(&mut self, op: &ResOperation) {
        use OpCode::*;
        let flags = match op.opnum {
            GetfieldRawI | GetfieldRawF | SetfieldRaw | GetarrayitemRawI | GetarrayitemRawF
            | SetarrayitemRaw | RawLoadI | RawLoadF | RawStore => MemFlags::new(),
            _ => MemFlags::trusted(),
        };
        let base = self.operand(op.arg(0));
        match op.opnum {
            GetfieldGcI | GetfieldGcR | GetfieldGcF | GetfieldRawI | GetfieldRawF => {
                let field = op
                    .descr
                    .as_ref()
                    .and_then(Descr::as_field)
                    .unwrap_or_else(|| panic!("{} needs a field descr", op.opnum.name()))
                    .clone();
                let r = self.load_typed(
                    op.opnum.result_type(),
                    field.size,
                    field.is_signed(),
                    flags,
                    base,
                    field.offset as i32,
                );
                self.define(op, r);
            }
            SetfieldGc | SetfieldRaw => {
                let field = op
                    .descr
                    .as_ref()
                    .and_then(Descr::as_field)
                    .unwrap_or_else(|| panic!("{} needs a field descr", op.opnum.name()))
                    .clone();
                let value = self.operand(op.arg(1));
                self.store_typed(
                    field.value_type(),
                    field.size,
                    flags,
                    value,
                    base,
                    field.offset as i32,
                );
            }
            GetarrayitemGcI | GetarrayitemGcR | GetarrayitemGcF | GetarrayitemRawI
            | GetarrayitemRawF => {
                let array = array_descr(op).clone();
                let (addr, off) = self.element_addr(
                    base,
                    op.arg(1),
                    array.item_size as i64,
                    array.base_size as i64,
                );
                let r = self.load_typed(
                    op.opnum.result_type(),
                    array.item_size,
                    array.is_item_signed(),
                    flags,
                    addr,
                    off,
                );
                self.define(op, r);
            }
            SetarrayitemGc | SetarrayitemRaw => {
                let array = array_descr(op).clone();
                let (addr, off) = self.element_addr(
                    base,
                    op.arg(1),
                    array.item_size as i64,
                    array.base_size as i64,
                );
                let value = self.operand(op.arg(2));
                self.store_typed(array.item_type(), array.item_size, flags, value, addr, off);
            }
            ArraylenGc => {
                let array = array_descr(op);
                let ofs = array
                    .length_offset
                    .unwrap_or_else(|| panic!("array {} has no length field", array.name));
                let r = self.b.ins().load(types::I64, flags, base, ofs as i32);
                self.define(op, r);
            }
            GetinteriorfieldGcI | GetinteriorfieldGcR | GetinteriorfieldGcF
            | SetinteriorfieldGc => {
                let interior = op
                    .descr
                    .as_ref()
                    .and_then(Descr::as_interior_field)
                    .unwrap_or_else(|| panic!("{} needs an interior field descr", op.opnum.name()))
                    .clone();
                let (addr, off) = self.element_addr(
                    base,
                    op.arg(1),
                    interior.array.item_size as i64,
                    (interior.array.base_size + interior.field.offset) as i64,
                );
                if op.opnum == SetinteriorfieldGc {
                    let value = self.operand(op.arg(2));
                    self.store_typed(
                        interior.field.value_type(),
                        interior.field.size,
                        flags,
                        value,
                        addr,
                        off,
                    );
                } else {
                    let r = self.load_typed(
                        op.opnum.result_type(),
                        interior.field.size,
                        interior.field.is_signed(),
                        flags,
                        addr,
                        off,
                    );
                    self.define(op, r);
                }
            }
            RawLoadI | RawLoadF => {
                let array = array_descr(op).clone();
                let (addr, off) = self.element_addr(base, op.arg(1), 1, 0);
                let r = self.load_typed(
                    op.opnum.result_type(),
                    array.item_size,
                    array.is_item_signed(),
                    flags,
                    addr,
                    off,
                );
                self.define(op, r);
            }
            RawStore => {
                let array = array_descr(op).clone();
                let (addr, off) = self.element_addr(base, op.arg(1), 1, 0);
                let value = self.operand(op.arg(2));
                self.store_typed(array.item_type(), array.item_size, flags, value, addr, off);
            }
            GcLoadI | GcLoadR | GcLoadF => {
                let size = const_arg(op, 2);
                let (addr, off) = self.element_addr(base, op.arg(1), 1, 0);
                let r = self.load_typed(
                    op.opnum.result_type(),
                    size.unsigned_abs() as usize,
                    size < 0,
                    flags,
                    addr,
                    off,
                );
                self.define(op, r);
            }
            GcLoadIndexedI | GcLoadIndexedR | GcLoadIndexedF => {
                let scale = const_arg(op, 2);
                let offset = const_arg(op, 3);
                let size = const_arg(op, 4);
                let (addr, off) = self.element_addr(base, op.arg(1), scale, offset);
                let r = self.load_typed(
                    op.opnum.result_type(),
                    size.unsigned_abs() as usize,
                    size < 0,
                    flags,
                    addr,
                    off,
                );
                self.define(op, r);
            }
            GcStore => {
                let size = const_arg(op, 3);
                let (addr, off) = self.element_addr(base, op.arg(1), 1, 0);
                let ty = self.trace.operand_type(op.arg(2));
                let value = self.operand(op.arg(2));
                self.store_typed(ty, size.unsigned_abs() as usize, flags, value, addr, off);
            }
            GcStoreIndexed => {
                let scale = const_arg(op, 3);
                let offset = const_arg(op, 4);
                let size = const_arg(op, 5);
                let (addr, off) = self.element_addr(base, op.arg(1), scale, offset);
                let ty = self.trace.operand_type(op.arg(2));
                let value = self.operand(op.arg(2));
                self.store_typed(ty, size.unsigned_abs() as usize, flags, value, addr, off);
            }
            other => unreachable!("{} is not a memory operation", other.name()),
        }
    }

    // -----------------------------------------------------------------------
    // Allocation and barriers
    // -----------------------------------------------------------------------

    /// Bump-allocate `size` bytes from the nursery window; refills on the slow path
    fn nursery_alloc(&mut self, size: usize) -> Value {
        let flags = MemFlags::trusted();
        let free = self
            .b
            .ins()
            .load(types::I64, flags, self.ctx, CTX_NURSERY_FREE_OFFSET);
        let new_free = self.b.ins().iadd_imm(free, size as i64);
        let top = self
            .b
            .ins()
            .load(types::I64, flags, self.ctx, CTX_NURSERY_TOP_OFFSET);
        let fits = self
            .b
            .ins()
            .icmp(IntCC::UnsignedLessThanOrEqual, new_free, top);

        let fast = self.b.create_block();
        let slow = self.b.create_block();
        let merge = self.b.create_block();
        self.b.set_cold_block(slow);
        let obj = self.b.append_block_param(merge, types::I64);
        self.b.ins().brif(fits, fast, &[], slow, &[]);

        self.b.switch_to_block(fast);
        self.b
            .ins()
            .store(flags, new_free, self.ctx, CTX_NURSERY_FREE_OFFSET);
        self.b.ins().jump(merge, &[BlockArg::Value(free)]);

        self.b.switch_to_block(slow);
        let shared = self.shared();
        let bytes = self.iconst(size as i64);
        let ctx = self.ctx;
        let refilled = self
            .call_helper(HelperKind::MallocNursery, &[shared, ctx, bytes])
            .unwrap_or_else(|| unreachable!("malloc helper returns"));
        self.b.ins().jump(merge, &[BlockArg::Value(refilled)]);

        self.b.switch_to_block(merge);
        obj
    }

    fn zero_memory(&mut self, addr: Value, len: Value) {
        self.call_helper(HelperKind::ZeroMemory, &[addr, len]);
    }

    fn translate_new(&mut self, op: &ResOperation) {
        let descr = op
            .descr
            .as_ref()
            .and_then(Descr::as_size)
            .unwrap_or_else(|| panic!("{} needs a size descr", op.opnum.name()))
            .clone();
        let gc = self.env.gc;
        let size = round_up8(descr.size.max(gc.header_size()));
        let obj = self.nursery_alloc(size);
        let header = self.iconst(gc.young_header(descr.type_id) as i64);
        self.b.ins().store(MemFlags::trusted(), header, obj, 0);
        if !gc.malloc_zeroes_memory() && size > gc.header_size() {
            let body = self.b.ins().iadd_imm(obj, gc.header_size() as i64);
            let len = self.iconst((size - gc.header_size()) as i64);
            self.zero_memory(body, len);
        }
        if op.opnum == OpCode::NewWithVtable {
            let vtable = descr
                .vtable
                .unwrap_or_else(|| panic!("size descr {} has no vtable", descr.name));
            let vtable = self.iconst(vtable as i64);
            self.b.ins().store(
                MemFlags::trusted(),
                vtable,
                obj,
                gc.vtable_offset() as i32,
            );
        }
        self.define(op, obj);
    }

    fn init_array_header(&mut self, array: &ArrayDescr, obj: Value, length: Value) {
        let header = self.iconst(self.env.gc.young_header(array.type_id) as i64);
        self.b.ins().store(MemFlags::trusted(), header, obj, 0);
        if let Some(ofs) = array.length_offset {
            self.b
                .ins()
                .store(MemFlags::trusted(), length, obj, ofs as i32);
        }
    }

    fn translate_new_array(&mut self, op: &ResOperation) {
        let array = array_descr(op).clone();
        let gc = self.env.gc;
        let max_bytes = gc.max_nursery_array_bytes();
        let length = self.operand(op.arg(0));
        let const_len = op.arg(0).as_const().and_then(Const::as_int);

        let obj = match const_len {
            Some(len)
                if len >= 0
                    && (len as usize)
                        .checked_mul(array.item_size)
                        .and_then(|n| n.checked_add(array.base_size))
                        .is_some_and(|n| n < max_bytes) =>
            {
                let bytes = array.base_size + len as usize * array.item_size;
                let obj = self.nursery_alloc(round_up8(bytes.max(gc.header_size())));
                self.init_array_header(&array, obj, length);
                obj
            }
            _ => self.new_array_dynamic(&array, length),
        };

        if op.opnum == OpCode::NewArrayClear && !gc.malloc_zeroes_memory() {
            let items = self.b.ins().iadd_imm(obj, array.base_size as i64);
            let len = self.b.ins().imul_imm(length, array.item_size as i64);
            self.zero_memory(items, len);
        }
        self.define(op, obj);
    }

    fn new_array_dynamic(&mut self, array: &Arc<ArrayDescr>, length: Value) -> Value {
        let flags = MemFlags::trusted();
        let max_bytes = self.env.gc.max_nursery_array_bytes();
        let limit = max_bytes
            .checked_sub(array.base_size)
            .map_or(0, |room| room.div_ceil(array.item_size.max(1)));

        let try_bump = self.b.create_block();
        let fast = self.b.create_block();
        let slow = self.b.create_block();
        let merge = self.b.create_block();
        self.b.set_cold_block(slow);
        let obj = self.b.append_block_param(merge, types::I64);

        let small = self
            .b
            .ins()
            .icmp_imm(IntCC::UnsignedLessThan, length, limit as i64);
        self.b.ins().brif(small, try_bump, &[], slow, &[]);

        self.b.switch_to_block(try_bump);
        let items = self.b.ins().imul_imm(length, array.item_size as i64);
        let bytes = self.b.ins().iadd_imm(items, array.base_size as i64 + 7);
        let bytes = self.b.ins().band_imm(bytes, !7);
        let free = self
            .b
            .ins()
            .load(types::I64, flags, self.ctx, CTX_NURSERY_FREE_OFFSET);
        let new_free = self.b.ins().iadd(free, bytes);
        let top = self
            .b
            .ins()
            .load(types::I64, flags, self.ctx, CTX_NURSERY_TOP_OFFSET);
        let fits = self
            .b
            .ins()
            .icmp(IntCC::UnsignedLessThanOrEqual, new_free, top);
        self.b.ins().brif(fits, fast, &[], slow, &[]);

        self.b.switch_to_block(fast);
        self.b
            .ins()
            .store(flags, new_free, self.ctx, CTX_NURSERY_FREE_OFFSET);
        self.init_array_header(array, free, length);
        self.b.ins().jump(merge, &[BlockArg::Value(free)]);

        self.b.switch_to_block(slow);
        let shared = self.shared();
        let descr = self.iconst(Arc::as_ptr(array) as i64);
        let ctx = self.ctx;
        let allocated = self
            .call_helper(HelperKind::MallocArray, &[shared, ctx, descr, length])
            .unwrap_or_else(|| unreachable!("malloc helper returns"));
        self.b.ins().jump(merge, &[BlockArg::Value(allocated)]);

        self.b.switch_to_block(merge);
        obj
    }

    fn translate_zero_array(&mut self, op: &ResOperation) {
        let array = array_descr(op).clone();
        let scale_start = const_arg(op, 3);
        let scale_len = const_arg(op, 4);
        let len = match op.arg(2).as_const().and_then(Const::as_int) {
            Some(0) => return,
            Some(n) => self.iconst(n * scale_len),
            None => {
                let n = self.operand(op.arg(2));
                self.b.ins().imul_imm(n, scale_len)
            }
        };
        let base = self.operand(op.arg(0));
        let (addr, off) = self.element_addr(base, op.arg(1), scale_start, array.base_size as i64);
        let addr = self.b.ins().iadd_imm(addr, i64::from(off));
        self.zero_memory(addr, len);
    }

    /// Non-zero when the object's barrier flag is set
    fn barrier_flag(&mut self, obj: Value) -> Value {
        let wb = self.env.gc.write_barrier_descr();
        let byte = self
            .b
            .ins()
            .uload8(types::I64, MemFlags::trusted(), obj, wb.flag_byte_offset);
        self.b.ins().band_imm(byte, i64::from(wb.flag_mask))
    }

    fn translate_write_barrier(&mut self, op: &ResOperation) {
        let obj = self.operand(op.arg(0));
        self.barrier_slow_path(obj, HelperKind::WriteBarrier);
    }

    fn barrier_slow_path(&mut self, obj: Value, helper: HelperKind) {
        let flag = self.barrier_flag(obj);
        let slow = self.b.create_block();
        let cont = self.b.create_block();
        self.b.set_cold_block(slow);
        self.b.ins().brif(flag, slow, &[], cont, &[]);

        self.b.switch_to_block(slow);
        let shared = self.shared();
        self.call_helper(helper, &[shared, obj]);
        self.b.ins().jump(cont, &[]);

        self.b.switch_to_block(cont);
    }

    fn translate_write_barrier_array(&mut self, op: &ResOperation) {
        let obj = self.operand(op.arg(0));
        let Some(cards) = self.env.gc.write_barrier_descr().cards else {
            self.barrier_slow_path(obj, HelperKind::WriteBarrierArray);
            return;
        };
        let index = self.operand(op.arg(1));
        let flags = MemFlags::trusted();

        let check = self.b.create_block();
        let slow = self.b.create_block();
        let mark = self.b.create_block();
        let cont = self.b.create_block();
        self.b.set_cold_block(slow);

        let flag = self.barrier_flag(obj);
        self.b.ins().brif(flag, check, &[], cont, &[]);

        self.b.switch_to_block(check);
        let byte = self
            .b
            .ins()
            .uload8(types::I64, flags, obj, cards.cards_set_byte_offset);
        let set = self.b.ins().band_imm(byte, i64::from(cards.cards_set_mask));
        self.b.ins().brif(set, mark, &[], slow, &[]);

        self.b.switch_to_block(slow);
        let shared = self.shared();
        self.call_helper(HelperKind::WriteBarrierArray, &[shared, obj]);
        let byte = self
            .b
            .ins()
            .uload8(types::I64, flags, obj, cards.cards_set_byte_offset);
        let set = self.b.ins().band_imm(byte, i64::from(cards.cards_set_mask));
        self.b.ins().brif(set, mark, &[], cont, &[]);

        // card n is bit (n & 7) of the byte at obj + !(n >> 3)
        self.b.switch_to_block(mark);
        let card = self
            .b
            .ins()
            .ushr_imm(index, i64::from(cards.card_page_shift));
        let byte_index = self.b.ins().ushr_imm(card, 3);
        let neg = self.b.ins().bnot(byte_index);
        let addr = self.b.ins().iadd(obj, neg);
        let bit = self.b.ins().band_imm(card, 7);
        let one = self.iconst(1);
        let mask = self.b.ins().ishl(one, bit);
        let old = self.b.ins().uload8(types::I64, flags, addr, 0);
        let new = self.b.ins().bor(old, mask);
        self.b.ins().istore8(flags, new, addr, 0);
        self.b.ins().jump(cont, &[]);

        self.b.switch_to_block(cont);
    }

    // -----------------------------------------------------------------------
    // Calls
    // -----------------------------------------------------------------------

    fn call_signature(&self, descr: &CallDescr) -> Signature {
        // 64-bit targets have no separate stdcall
        let call_conv = match descr.convention {
            CallConvention::Cdecl | CallConvention::Stdcall => self.env.call_conv,
        };
        let mut sig = Signature::new(call_conv);
        sig.params.extend(descr.args.iter().map(|&k| abi_param(k)));
        if descr.result != ArgKind::Void {
            sig.returns.push(abi_param(descr.result));
        }
        sig
    }

    fn coerce_arg(&mut self, kind: ArgKind, v: Value) -> Value {
        match kind {
            ArgKind::Int { size, .. } if size < 8 => self.b.ins().ireduce(int_type(size), v),
            ArgKind::SingleFloat => {
                let bits = self.b.ins().ireduce(types::I32, v);
                self.b.ins().bitcast(types::F32, MemFlags::new(), bits)
            }
            _ => v,
        }
    }

    fn coerce_result(&mut self, kind: ArgKind, v: Value) -> Value {
        match kind {
            ArgKind::Int { size, signed: true } if size < 8 => {
                self.b.ins().sextend(types::I64, v)
            }
            ArgKind::Int { size, signed: false } if size < 8 => {
                self.b.ins().uextend(types::I64, v)
            }
            ArgKind::SingleFloat => {
                let bits = self.b.ins().bitcast(types::I32, MemFlags::new(), v);
                self.b.ins().uextend(types::I64, bits)
            }
            _ => v,
        }
    }

    /// Call a foreign function; the result is converted to its trace representation
    fn emit_call(&mut self, func: Operand, args: &[Operand], descr: &CallDescr) -> Option<Value> {
        assert_eq!(
            args.len(),
            descr.args.len(),
            "call passes {} arguments to a function taking {}",
            args.len(),
            descr.args.len()
        );
        let callee = match func.as_const() {
            Some(c) => {
                let addr = c.to_bits() as usize;
                let target = self.env.trampolines.get(&addr).copied().unwrap_or(addr);
                self.iconst(target as i64)
            }
            None => self.operand(func),
        };
        let mut values = Vec::with_capacity(args.len());
        for (&arg, &kind) in args.iter().zip(&descr.args) {
            let v = self.operand(arg);
            values.push(self.coerce_arg(kind, v));
        }
        let sig = self.call_signature(descr);
        let sigref = self.b.import_signature(sig);
        let inst = self.b.ins().call_indirect(sigref, callee, &values);
        let result = self.b.inst_results(inst).first().copied()?;
        Some(self.coerce_result(descr.result, result))
    }

    /// Store the values a forced frame reports before a call that may force it
    fn spill_for_force(&mut self, index: usize) -> bool {
        let trace = self.trace;
        let Some(guard) = trace.operations[index + 1..]
            .iter()
            .find(|op| op.opnum != OpCode::Keepalive)
            .filter(|op| op.opnum == OpCode::GuardNotForced)
        else {
            return false;
        };
        let call_result = trace.operations[index].result;
        let mut values = Vec::with_capacity(guard.fail_args().len());
        for &v in guard.fail_args() {
            let value = if Some(v) == call_result {
                match trace.type_of(v) {
                    Type::Float => self.b.ins().f64const(0.0),
                    _ => self.iconst(0),
                }
            } else {
                self.value_of(v)
            };
            values.push(value);
        }
        self.store_slots(&values);
        let descr = guard
            .fail_descr()
            .unwrap_or_else(|| panic!("guard_not_forced without fail descr"));
        let descr = self.iconst(Arc::as_ptr(descr) as i64);
        self.b
            .ins()
            .store(MemFlags::trusted(), descr, self.frame, FRAME_FORCE_DESCR_OFFSET);
        true
    }

    fn end_forcible_call(&mut self, spilled: bool) {
        if spilled {
            let zero = self.iconst(0);
            self.b
                .ins()
                .store(MemFlags::trusted(), zero, self.frame, FRAME_FORCE_DESCR_OFFSET);
        }
    }

    fn translate_release_gil(&mut self, op: &ResOperation) {
        let saveerr = self.operand(op.arg(0));
        let descr = call_descr(op).clone();
        let shared = self.shared();
        let ctx = self.ctx;
        let released = self
            .call_helper(HelperKind::ReleaseGil, &[shared, ctx, saveerr])
            .unwrap_or_else(|| unreachable!("release helper returns"));
        let result = self.emit_call(op.arg(1), &op.args[2..], &descr);
        self.call_helper(HelperKind::ReacquireGil, &[shared, ctx, saveerr, released]);
        if let Some(r) = result {
            self.define(op, r);
        }
    }

    fn translate_call_assembler(&mut self, op: &ResOperation) {
        let token = op
            .descr
            .as_ref()
            .and_then(Descr::as_loop)
            .unwrap_or_else(|| panic!("{} needs a loop token", op.opnum.name()));
        let token = self.iconst(Arc::as_ptr(token) as i64);
        let slot = self.b.create_sized_stack_slot(StackSlotData::new(
            StackSlotKind::ExplicitSlot,
            (op.args.len().max(1) * 8) as u32,
            3,
        ));
        for (i, &arg) in op.args.iter().enumerate() {
            let v = self.operand(arg);
            self.b.ins().stack_store(v, slot, (i * 8) as i32);
        }
        let args = self.b.ins().stack_addr(types::I64, slot, 0);
        let shared = self.shared();
        let ctx = self.ctx;
        let bits = self
            .call_helper(HelperKind::CallAssembler, &[shared, ctx, token, args])
            .unwrap_or_else(|| unreachable!("call_assembler helper returns"));
        match op.opnum {
            OpCode::CallAssemblerN => {}
            OpCode::CallAssemblerF => {
                let r = self.b.ins().bitcast(types::F64, MemFlags::new(), bits);
                self.define(op, r);
            }
            _ => self.define(op, bits),
        }
    }

    fn translate_cond_call(&mut self, op: &ResOperation) {
        let descr = call_descr(op).clone();
        let cond = self.operand(op.arg(0));
        let call = self.b.create_block();
        let cont = self.b.create_block();
        self.b.set_cold_block(call);
        self.b.ins().brif(cond, call, &[], cont, &[]);

        self.b.switch_to_block(call);
        self.emit_call(op.arg(1), &op.args[2..], &descr);
        self.b.ins().jump(cont, &[]);

        self.b.switch_to_block(cont);
    }

    fn translate_cond_call_value(&mut self, op: &ResOperation) {
        let descr = call_descr(op).clone();
        let value = self.operand(op.arg(0));
        let call = self.b.create_block();
        let merge = self.b.create_block();
        self.b.set_cold_block(call);
        let result = self.b.append_block_param(merge, types::I64);
        self.b
            .ins()
            .brif(value, merge, &[BlockArg::Value(value)], call, &[]);

        self.b.switch_to_block(call);
        let computed = self
            .emit_call(op.arg(1), &op.args[2..], &descr)
            .unwrap_or_else(|| panic!("cond_call_value of a void function"));
        self.b.ins().jump(merge, &[BlockArg::Value(computed)]);

        self.b.switch_to_block(merge);
        self.define(op, result);
    }
}
