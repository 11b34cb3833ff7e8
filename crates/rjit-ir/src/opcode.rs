//! Operation codes

use crate::types::Type;

macro_rules! opcodes {
    ($( $(#[$doc:meta])* $variant:ident = $name:literal : $ty:ident ),* $(,)?) => {
        /// Trace operation codes.
        ///
        /// The `_I`/`_R`/`_F`/`_N` suffix of the textual name gives the
        /// result type (int, ref, float, none).
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum OpCode {
            $( $(#[$doc])* $variant, )*
        }

        impl OpCode {
            /// Every opcode, in declaration order
            pub const ALL: &'static [OpCode] = &[$(OpCode::$variant),*];

            /// Textual name as printed in trace dumps
            pub const fn name(self) -> &'static str {
                match self {
                    $( OpCode::$variant => $name, )*
                }
            }

            /// Type of the value produced by this operation
            pub const fn result_type(self) -> Type {
                match self {
                    $( OpCode::$variant => Type::$ty, )*
                }
            }
        }
    };
}

opcodes! {
    // ---- control flow ----
    /// Re-entry point; arguments are the only values live after it
    Label = "label": Void,
    /// Transfer to a label (descr: target token)
    Jump = "jump": Void,
    /// Leave the trace (descr: final fail descr)
    Finish = "finish": Void,

    // ---- guards ----
    /// Fails when the argument is zero
    GuardTrue = "guard_true": Void,
    /// Fails when the argument is non-zero
    GuardFalse = "guard_false": Void,
    /// Fails unless `arg0 == arg1`
    GuardValue = "guard_value": Void,
    /// Fails unless the object's vtable is `arg1`
    GuardClass = "guard_class": Void,
    /// Fails on null
    GuardNonnull = "guard_nonnull": Void,
    /// Fails on non-null
    GuardIsnull = "guard_isnull": Void,
    /// Fails on null or when the vtable differs
    GuardNonnullClass = "guard_nonnull_class": Void,
    /// Fails unless the header type id is `arg1`
    GuardGcType = "guard_gc_type": Void,
    /// Fails when an exception is pending
    GuardNoException = "guard_no_exception": Void,
    /// Fails unless the pending exception's class is `arg0`; yields the exception
    GuardException = "guard_exception": Ref,
    /// Fails when the preceding `_OVF` operation overflowed
    GuardNoOverflow = "guard_no_overflow": Void,
    /// Fails when the preceding `_OVF` operation did not overflow
    GuardOverflow = "guard_overflow": Void,
    /// Fails when the frame was forced during the preceding call
    GuardNotForced = "guard_not_forced": Void,
    /// Fails once the owning loop has been invalidated
    GuardNotInvalidated = "guard_not_invalidated": Void,

    // ---- integer ----
    /// Wrapping add
    IntAdd = "int_add": Int,
    /// Wrapping subtract
    IntSub = "int_sub": Int,
    /// Wrapping multiply
    IntMul = "int_mul": Int,
    /// Bitwise and
    IntAnd = "int_and": Int,
    /// Bitwise or
    IntOr = "int_or": Int,
    /// Bitwise xor
    IntXor = "int_xor": Int,
    /// Shift left
    IntLshift = "int_lshift": Int,
    /// Arithmetic shift right
    IntRshift = "int_rshift": Int,
    /// Logical shift right
    UintRshift = "uint_rshift": Int,
    /// High word of the unsigned 128-bit product
    UintMulHigh = "uint_mul_high": Int,
    /// Signed `<`
    IntLt = "int_lt": Int,
    /// Signed `<=`
    IntLe = "int_le": Int,
    /// `==`
    IntEq = "int_eq": Int,
    /// `!=`
    IntNe = "int_ne": Int,
    /// Signed `>`
    IntGt = "int_gt": Int,
    /// Signed `>=`
    IntGe = "int_ge": Int,
    /// Unsigned `<`
    UintLt = "uint_lt": Int,
    /// Unsigned `<=`
    UintLe = "uint_le": Int,
    /// Unsigned `>`
    UintGt = "uint_gt": Int,
    /// Unsigned `>=`
    UintGe = "uint_ge": Int,
    /// `x != 0`
    IntIsTrue = "int_is_true": Int,
    /// `x == 0`
    IntIsZero = "int_is_zero": Int,
    /// Negation
    IntNeg = "int_neg": Int,
    /// Bitwise not
    IntInvert = "int_invert": Int,
    /// `max(x, 0)`
    IntForceGeZero = "int_force_ge_zero": Int,
    /// Sign-extend the low `arg1` bytes
    IntSignext = "int_signext": Int,
    /// Add, recording overflow for the following guard
    IntAddOvf = "int_add_ovf": Int,
    /// Subtract, recording overflow for the following guard
    IntSubOvf = "int_sub_ovf": Int,
    /// Multiply, recording overflow for the following guard
    IntMulOvf = "int_mul_ovf": Int,

    // ---- float ----
    /// Add
    FloatAdd = "float_add": Float,
    /// Subtract
    FloatSub = "float_sub": Float,
    /// Multiply
    FloatMul = "float_mul": Float,
    /// Divide
    FloatTrueDiv = "float_truediv": Float,
    /// Negate
    FloatNeg = "float_neg": Float,
    /// Absolute value
    FloatAbs = "float_abs": Float,
    /// `<`
    FloatLt = "float_lt": Int,
    /// `<=`
    FloatLe = "float_le": Int,
    /// `==`
    FloatEq = "float_eq": Int,
    /// `!=` (true when unordered)
    FloatNe = "float_ne": Int,
    /// `>`
    FloatGt = "float_gt": Int,
    /// `>=`
    FloatGe = "float_ge": Int,
    /// Truncating conversion
    CastFloatToInt = "cast_float_to_int": Int,
    /// Signed conversion
    CastIntToFloat = "cast_int_to_float": Float,
    /// Round to single precision; result is the f32 bit pattern
    CastFloatToSinglefloat = "cast_float_to_singlefloat": Int,
    /// Widen an f32 bit pattern to double
    CastSinglefloatToFloat = "cast_singlefloat_to_float": Float,
    /// Reinterpret double bits as an integer
    ConvertFloatBytesToLonglong = "convert_float_bytes_to_longlong": Int,
    /// Reinterpret integer bits as a double
    ConvertLonglongBytesToFloat = "convert_longlong_bytes_to_float": Float,

    // ---- references ----
    /// Reference identity
    PtrEq = "ptr_eq": Int,
    /// Reference non-identity
    PtrNe = "ptr_ne": Int,
    /// Instance identity
    InstancePtrEq = "instance_ptr_eq": Int,
    /// Instance non-identity
    InstancePtrNe = "instance_ptr_ne": Int,
    /// Reference to address
    CastPtrToInt = "cast_ptr_to_int": Int,
    /// Address to reference
    CastIntToPtr = "cast_int_to_ptr": Ref,
    /// Copy an int
    SameAsI = "same_as_i": Int,
    /// Copy a ref
    SameAsR = "same_as_r": Ref,
    /// Copy a float
    SameAsF = "same_as_f": Float,

    // ---- memory ----
    /// Read an int field of a GC object
    GetfieldGcI = "getfield_gc_i": Int,
    /// Read a ref field of a GC object
    GetfieldGcR = "getfield_gc_r": Ref,
    /// Read a float field of a GC object
    GetfieldGcF = "getfield_gc_f": Float,
    /// Read an int field of raw memory
    GetfieldRawI = "getfield_raw_i": Int,
    /// Read a float field of raw memory
    GetfieldRawF = "getfield_raw_f": Float,
    /// Write a field of a GC object
    SetfieldGc = "setfield_gc": Void,
    /// Write a field of raw memory
    SetfieldRaw = "setfield_raw": Void,
    /// Read an int array item
    GetarrayitemGcI = "getarrayitem_gc_i": Int,
    /// Read a ref array item
    GetarrayitemGcR = "getarrayitem_gc_r": Ref,
    /// Read a float array item
    GetarrayitemGcF = "getarrayitem_gc_f": Float,
    /// Read an int item of a raw array
    GetarrayitemRawI = "getarrayitem_raw_i": Int,
    /// Read a float item of a raw array
    GetarrayitemRawF = "getarrayitem_raw_f": Float,
    /// Write an array item
    SetarrayitemGc = "setarrayitem_gc": Void,
    /// Write a raw array item
    SetarrayitemRaw = "setarrayitem_raw": Void,
    /// Array length
    ArraylenGc = "arraylen_gc": Int,
    /// Read an int field of a struct stored inline in an array
    GetinteriorfieldGcI = "getinteriorfield_gc_i": Int,
    /// Read a ref field of a struct stored inline in an array
    GetinteriorfieldGcR = "getinteriorfield_gc_r": Ref,
    /// Read a float field of a struct stored inline in an array
    GetinteriorfieldGcF = "getinteriorfield_gc_f": Float,
    /// Write a field of a struct stored inline in an array
    SetinteriorfieldGc = "setinteriorfield_gc": Void,
    /// Read an int at `addr + offset`
    RawLoadI = "raw_load_i": Int,
    /// Read a float at `addr + offset`
    RawLoadF = "raw_load_f": Float,
    /// Write at `addr + offset`
    RawStore = "raw_store": Void,
    /// `(ptr, offset, size)`; negative size means sign-extend
    GcLoadI = "gc_load_i": Int,
    /// `(ptr, offset, size)`
    GcLoadR = "gc_load_r": Ref,
    /// `(ptr, offset, size)`
    GcLoadF = "gc_load_f": Float,
    /// `(ptr, index, scale, base_offset, size)`
    GcLoadIndexedI = "gc_load_indexed_i": Int,
    /// `(ptr, index, scale, base_offset, size)`
    GcLoadIndexedR = "gc_load_indexed_r": Ref,
    /// `(ptr, index, scale, base_offset, size)`
    GcLoadIndexedF = "gc_load_indexed_f": Float,
    /// `(ptr, offset, value, size)`
    GcStore = "gc_store": Void,
    /// `(ptr, index, value, scale, base_offset, size)`
    GcStoreIndexed = "gc_store_indexed": Void,

    // ---- allocation and GC ----
    /// Allocate a fixed-size object (descr: size)
    New = "new": Ref,
    /// Allocate an instance and store its vtable (descr: size)
    NewWithVtable = "new_with_vtable": Ref,
    /// Allocate an array (descr: array)
    NewArray = "new_array": Ref,
    /// Allocate a zero-filled array (descr: array)
    NewArrayClear = "new_array_clear": Ref,
    /// `(array, start, length, scale_start, scale_length)`
    ZeroArray = "zero_array": Void,
    /// Write barrier before storing a reference into an object
    CondCallGcWb = "cond_call_gc_wb": Void,
    /// Write barrier before storing a reference into an array item
    CondCallGcWbArray = "cond_call_gc_wb_array": Void,

    // ---- calls ----
    /// Call returning an int
    CallI = "call_i": Int,
    /// Call returning a ref
    CallR = "call_r": Ref,
    /// Call returning a float
    CallF = "call_f": Float,
    /// Call returning nothing
    CallN = "call_n": Void,
    /// Pure call returning an int
    CallPureI = "call_pure_i": Int,
    /// Pure call returning a ref
    CallPureR = "call_pure_r": Ref,
    /// Pure call returning a float
    CallPureF = "call_pure_f": Float,
    /// Pure call returning nothing
    CallPureN = "call_pure_n": Void,
    /// Loop-invariant call returning an int
    CallLoopinvariantI = "call_loopinvariant_i": Int,
    /// Loop-invariant call returning a ref
    CallLoopinvariantR = "call_loopinvariant_r": Ref,
    /// Loop-invariant call returning a float
    CallLoopinvariantF = "call_loopinvariant_f": Float,
    /// Loop-invariant call returning nothing
    CallLoopinvariantN = "call_loopinvariant_n": Void,
    /// Call that may force the frame, returning an int
    CallMayForceI = "call_may_force_i": Int,
    /// Call that may force the frame, returning a ref
    CallMayForceR = "call_may_force_r": Ref,
    /// Call that may force the frame, returning a float
    CallMayForceF = "call_may_force_f": Float,
    /// Call that may force the frame, returning nothing
    CallMayForceN = "call_may_force_n": Void,
    /// `(saveerr, func, args...)` native call with the lock released, int result
    CallReleaseGilI = "call_release_gil_i": Int,
    /// `(saveerr, func, args...)` native call with the lock released, float result
    CallReleaseGilF = "call_release_gil_f": Float,
    /// `(saveerr, func, args...)` native call with the lock released, no result
    CallReleaseGilN = "call_release_gil_n": Void,
    /// Run another compiled loop, int result (descr: loop token)
    CallAssemblerI = "call_assembler_i": Int,
    /// Run another compiled loop, ref result
    CallAssemblerR = "call_assembler_r": Ref,
    /// Run another compiled loop, float result
    CallAssemblerF = "call_assembler_f": Float,
    /// Run another compiled loop, no result
    CallAssemblerN = "call_assembler_n": Void,
    /// `(cond, func, args...)`: call when `cond` is non-zero
    CondCall = "cond_call": Void,
    /// `(value, func, args...)`: `value` if non-zero, else the call's result
    CondCallValueI = "cond_call_value_i": Int,
    /// `(value, func, args...)`: `value` if non-null, else the call's result
    CondCallValueR = "cond_call_value_r": Ref,

    // ---- exceptions ----
    /// Pending exception class
    SaveExcClass = "save_exc_class": Int,
    /// Take the pending exception value, clearing it
    SaveException = "save_exception": Ref,
    /// `(class, value)`: reinstate a pending exception
    RestoreException = "restore_exception": Void,

    // ---- misc ----
    /// Handle for forcing the current frame
    ForceToken = "force_token": Int,
    /// Interpreter position marker
    DebugMergePoint = "debug_merge_point": Void,
    /// Profiler frame push
    EnterPortalFrame = "enter_portal_frame": Void,
    /// Profiler frame pop
    LeavePortalFrame = "leave_portal_frame": Void,
    /// Keep a value alive up to this point
    Keepalive = "keepalive": Void,
    /// Quasi-immutable field marker
    QuasiimmutField = "quasiimmut_field": Void,
    /// Optimizer hint about an exact class
    RecordExactClass = "record_exact_class": Void,
    /// `*(i64*)arg0 += 1`
    IncrementDebugCounter = "increment_debug_counter": Void,
}

impl OpCode {
    /// Whether this is a `GUARD_*`
    pub const fn is_guard(self) -> bool {
        matches!(
            self,
            Self::GuardTrue
                | Self::GuardFalse
                | Self::GuardValue
                | Self::GuardClass
                | Self::GuardNonnull
                | Self::GuardIsnull
                | Self::GuardNonnullClass
                | Self::GuardGcType
                | Self::GuardNoException
                | Self::GuardException
                | Self::GuardNoOverflow
                | Self::GuardOverflow
                | Self::GuardNotForced
                | Self::GuardNotInvalidated
        )
    }

    /// Whether the operation ends a trace
    pub const fn is_final(self) -> bool {
        matches!(self, Self::Finish | Self::Jump)
    }

    /// Whether the guard's failure path must capture a pending exception
    pub const fn guard_saves_exception(self) -> bool {
        matches!(
            self,
            Self::GuardNoException | Self::GuardException | Self::GuardNotForced
        )
    }

    /// Whether this is an overflow-checked arithmetic operation
    pub const fn is_ovf(self) -> bool {
        matches!(self, Self::IntAddOvf | Self::IntSubOvf | Self::IntMulOvf)
    }

    /// Whether this is an ordinary call (`CALL_*`, pure, loop-invariant)
    pub const fn is_plain_call(self) -> bool {
        matches!(
            self,
            Self::CallI
                | Self::CallR
                | Self::CallF
                | Self::CallN
                | Self::CallPureI
                | Self::CallPureR
                | Self::CallPureF
                | Self::CallPureN
                | Self::CallLoopinvariantI
                | Self::CallLoopinvariantR
                | Self::CallLoopinvariantF
                | Self::CallLoopinvariantN
        )
    }

    /// Calls after which the frame may have been forced
    pub const fn is_call_may_force(self) -> bool {
        matches!(
            self,
            Self::CallMayForceI
                | Self::CallMayForceR
                | Self::CallMayForceF
                | Self::CallMayForceN
                | Self::CallReleaseGilI
                | Self::CallReleaseGilF
                | Self::CallReleaseGilN
                | Self::CallAssemblerI
                | Self::CallAssemblerR
                | Self::CallAssemblerF
                | Self::CallAssemblerN
        )
    }

    /// Whether this is a release-GIL call
    pub const fn is_call_release_gil(self) -> bool {
        matches!(
            self,
            Self::CallReleaseGilI | Self::CallReleaseGilF | Self::CallReleaseGilN
        )
    }

    /// Whether this is a call-assembler
    pub const fn is_call_assembler(self) -> bool {
        matches!(
            self,
            Self::CallAssemblerI | Self::CallAssemblerR | Self::CallAssemblerF | Self::CallAssemblerN
        )
    }

    /// Whether this is any kind of call
    pub const fn is_call(self) -> bool {
        self.is_plain_call()
            || self.is_call_may_force()
            || matches!(self, Self::CondCall | Self::CondCallValueI | Self::CondCallValueR)
    }

    /// Whether the operation may leave an exception pending or overflow
    pub const fn can_raise(self) -> bool {
        self.is_call() || self.is_ovf()
    }

    /// Whether the operation has an observable effect beyond its result
    pub const fn has_side_effect(self) -> bool {
        self.is_guard()
            || self.is_final()
            || self.is_call()
            || matches!(
                self,
                Self::Label
                    | Self::SetfieldGc
                    | Self::SetfieldRaw
                    | Self::SetarrayitemGc
                    | Self::SetarrayitemRaw
                    | Self::SetinteriorfieldGc
                    | Self::RawStore
                    | Self::GcStore
                    | Self::GcStoreIndexed
                    | Self::ZeroArray
                    | Self::CondCallGcWb
                    | Self::CondCallGcWbArray
                    | Self::RestoreException
                    | Self::SaveException
                    | Self::IncrementDebugCounter
            )
    }

    /// Fixed argument count, or `None` for variadic operations
    pub const fn arity(self) -> Option<usize> {
        use OpCode::*;
        let n = match self {
            Label | Jump | Finish | DebugMergePoint => return None,
            CallI | CallR | CallF | CallN | CallPureI | CallPureR | CallPureF | CallPureN
            | CallLoopinvariantI | CallLoopinvariantR | CallLoopinvariantF
            | CallLoopinvariantN | CallMayForceI | CallMayForceR | CallMayForceF
            | CallMayForceN | CallReleaseGilI | CallReleaseGilF | CallReleaseGilN
            | CallAssemblerI | CallAssemblerR | CallAssemblerF | CallAssemblerN | CondCall
            | CondCallValueI | CondCallValueR => return None,

            GuardNoException | GuardNoOverflow | GuardOverflow | GuardNotForced
            | GuardNotInvalidated | New | NewWithVtable | SaveExcClass | SaveException
            | ForceToken => 0,

            GuardTrue | GuardFalse | GuardNonnull | GuardIsnull | GuardException
            | IntIsTrue | IntIsZero | IntNeg | IntInvert | IntForceGeZero | FloatNeg
            | FloatAbs | CastFloatToInt | CastIntToFloat | CastFloatToSinglefloat
            | CastSinglefloatToFloat | ConvertFloatBytesToLonglong
            | ConvertLonglongBytesToFloat | CastPtrToInt | CastIntToPtr | SameAsI | SameAsR
            | SameAsF | GetfieldGcI | GetfieldGcR | GetfieldGcF | GetfieldRawI
            | GetfieldRawF | ArraylenGc | NewArray | NewArrayClear | CondCallGcWb
            | LeavePortalFrame | Keepalive | QuasiimmutField | IncrementDebugCounter => 1,

            GuardValue | GuardClass | GuardNonnullClass | GuardGcType | IntAdd | IntSub
            | IntMul | IntAnd | IntOr | IntXor | IntLshift | IntRshift | UintRshift
            | UintMulHigh | IntLt | IntLe | IntEq | IntNe | IntGt | IntGe | UintLt | UintLe
            | UintGt | UintGe | IntSignext | IntAddOvf | IntSubOvf | IntMulOvf | FloatAdd
            | FloatSub | FloatMul | FloatTrueDiv | FloatLt | FloatLe | FloatEq | FloatNe
            | FloatGt | FloatGe | PtrEq | PtrNe | InstancePtrEq | InstancePtrNe
            | SetfieldGc | SetfieldRaw | GetarrayitemGcI | GetarrayitemGcR
            | GetarrayitemGcF | GetarrayitemRawI | GetarrayitemRawF | GetinteriorfieldGcI
            | GetinteriorfieldGcR | GetinteriorfieldGcF | RawLoadI | RawLoadF
            | CondCallGcWbArray | RestoreException | EnterPortalFrame
            | RecordExactClass => 2,

            SetarrayitemGc | SetarrayitemRaw | SetinteriorfieldGc | RawStore | GcLoadI
            | GcLoadR | GcLoadF => 3,

            GcStore => 4,
            GcLoadIndexedI | GcLoadIndexedR | GcLoadIndexedF | ZeroArray => 5,
            GcStoreIndexed => 6,
        };
        Some(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_unique() {
        let mut names: Vec<_> = OpCode::ALL.iter().map(|op| op.name()).collect();
        names.sort_unstable();
        let before = names.len();
        names.dedup();
        assert_eq!(before, names.len());
    }

    #[test]
    fn suffix_matches_result_type() {
        for op in OpCode::ALL {
            let name = op.name();
            let expected = if name.ends_with("_i") {
                Some(Type::Int)
            } else if name.ends_with("_r") {
                Some(Type::Ref)
            } else if name.ends_with("_f") {
                Some(Type::Float)
            } else if name.ends_with("_n") {
                Some(Type::Void)
            } else {
                None
            };
            if let Some(ty) = expected {
                assert_eq!(op.result_type(), ty, "{name}");
            }
        }
    }

    #[test]
    fn classification() {
        assert!(OpCode::GuardTrue.is_guard());
        assert!(!OpCode::IntAdd.is_guard());
        assert!(OpCode::CallReleaseGilN.can_raise());
        assert!(OpCode::IntMulOvf.can_raise());
        assert!(!OpCode::IntMul.can_raise());
        assert!(OpCode::Finish.is_final());
        assert!(OpCode::GuardNotForced.guard_saves_exception());
        assert_eq!(OpCode::GcStoreIndexed.arity(), Some(6));
        assert_eq!(OpCode::CallI.arity(), None);
    }
}
