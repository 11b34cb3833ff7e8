//! Allocation, field and array access, raw memory and write barriers

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use common::{compile, cpu, ints};
use rjit_backend::{BackendConfig, CraneliftCpu, Cpu};
use rjit_ir::{
    ArgKind, ArrayLayout, CallSignature, Descr, FailDescr, FieldKind, GcRef, OpCode, Operand,
    StructLayout, TargetToken, TraceBuilder, Type, Value,
};
use rjit_runtime::gc::{GCFLAG_CARDS_SET, GCFLAG_HAS_CARDS, GCFLAG_TRACK_YOUNG_PTRS, header_type_id};
use rjit_runtime::{Gil, NurseryConfig, NurseryGc};

const POINT_VTABLE: usize = 0x5000;

fn point() -> StructLayout {
    StructLayout::new("Point", 32, 11)
        .with_vtable(POINT_VTABLE)
        .field("x", 16, 8, FieldKind::Signed)
        .field("next", 24, 8, FieldKind::Ref)
}

fn int_array() -> ArrayLayout {
    ArrayLayout::new("IntArray", 16, 8, FieldKind::Signed, Some(8), 21)
}

fn ref_array() -> ArrayLayout {
    ArrayLayout::new("RefArray", 16, 8, FieldKind::Ref, Some(8), 23)
}

fn pairs() -> ArrayLayout {
    ArrayLayout::new("Pairs", 16, 16, FieldKind::Signed, Some(8), 22)
        .item_field("key", 0, 8, FieldKind::Signed)
        .item_field("value", 8, 8, FieldKind::Float)
}

fn cpu_with(nursery: &Arc<NurseryGc>) -> CraneliftCpu {
    CraneliftCpu::new(
        BackendConfig::default().with_verify_traces(true),
        nursery.clone(),
        Arc::new(Gil::new()),
    )
    .expect("host ISA should be supported")
}

/// Header word of an object
fn header(obj: GcRef) -> u64 {
    // SAFETY: every object in these tests starts with a header word.
    unsafe { *(obj.addr() as *const u64) }
}

fn word(obj: GcRef, offset: usize) -> u64 {
    // SAFETY: callers pass offsets inside the object.
    unsafe { *((obj.addr() + offset) as *const u64) }
}

#[test]
fn test_new_with_vtable_and_fields() {
    let cpu = cpu();
    let layout = point();
    let size = cpu.sizeof(&layout);
    let x = cpu.fielddescrof(&layout, "x");
    let class_guard = FailDescr::guard(1);
    let type_guard = FailDescr::guard(2);

    let mut b = TraceBuilder::new();
    let i0 = b.input(Type::Int);
    let p = b.op_with_descr(OpCode::NewWithVtable, &[], Descr::Size(size));
    b.void(OpCode::SetfieldGc, &[p.into(), i0.into()], Descr::Field(x.clone()));
    b.guard(
        OpCode::GuardClass,
        &[p.into(), Operand::int(POINT_VTABLE as i64)],
        &class_guard,
        &[i0],
    );
    b.guard(
        OpCode::GuardGcType,
        &[p.into(), Operand::int(11)],
        &type_guard,
        &[i0],
    );
    let v = b.op_with_descr(OpCode::GetfieldGcI, &[p.into()], Descr::Field(x));
    b.finish(&[p.into(), v.into()], &FailDescr::final_descr(0));
    let token = compile(&cpu, &b.build());

    let df = cpu.execute_token(&token, &[Value::Int(42)]);
    assert_eq!(df.descr().identifier(), 0);
    let obj = cpu.get_ref_value(&df, 0);
    assert!(!obj.is_null());
    assert_eq!(cpu.get_int_value(&df, 1), 42);
    assert_eq!(header_type_id(header(obj)), 11);
    assert_eq!(word(obj, 8), POINT_VTABLE as u64);
    // young objects need no barrier
    assert_eq!(header(obj) & GCFLAG_TRACK_YOUNG_PTRS, 0);

    let again = cpu.execute_token(&token, &[Value::Int(7)]);
    assert_ne!(cpu.get_ref_value(&again, 0), obj);
}

#[test]
fn test_guard_class_and_gc_type_fail() {
    let cpu = cpu();
    let size = cpu.sizeof(&point());
    let mut b = TraceBuilder::new();
    let i0 = b.input(Type::Int);
    let p = b.op_with_descr(OpCode::New, &[], Descr::Size(size));
    b.guard(
        OpCode::GuardGcType,
        &[p.into(), Operand::int(12)],
        &FailDescr::guard(1),
        &[i0],
    );
    b.finish(&[], &FailDescr::final_descr(0));
    let token = compile(&cpu, &b.build());
    let df = cpu.execute_token(&token, &[Value::Int(1)]);
    assert_eq!(df.descr().identifier(), 1);

    let mut b = TraceBuilder::new();
    let r0 = b.input(Type::Ref);
    b.guard(
        OpCode::GuardNonnullClass,
        &[r0.into(), Operand::int(POINT_VTABLE as i64)],
        &FailDescr::guard(2),
        &[],
    );
    b.finish(&[], &FailDescr::final_descr(0));
    let token = compile(&cpu, &b.build());

    let mut instance = [11u64, POINT_VTABLE as u64, 0, 0];
    let df = cpu.execute_token(&token, &[Value::Ref(GcRef::from_ptr(instance.as_ptr()))]);
    assert_eq!(df.descr().identifier(), 0);
    instance[1] = 0x6000;
    let df = cpu.execute_token(&token, &[Value::Ref(GcRef::from_ptr(instance.as_ptr()))]);
    assert_eq!(df.descr().identifier(), 2);
    let df = cpu.execute_token(&token, &[Value::Ref(GcRef::NULL)]);
    assert_eq!(df.descr().identifier(), 2);
}

#[test]
fn test_new_array_constant_and_dynamic_length() {
    let cpu = cpu();
    let descr = cpu.arraydescrof(&int_array());

    let mut b = TraceBuilder::new();
    let i0 = b.input(Type::Int);
    let fixed = b.op_with_descr(OpCode::NewArray, &[Operand::int(3)], Descr::Array(descr.clone()));
    let dynamic = b.op_with_descr(OpCode::NewArrayClear, &[i0.into()], Descr::Array(descr.clone()));
    b.void(
        OpCode::SetarrayitemGc,
        &[dynamic.into(), Operand::int(2), Operand::int(77)],
        Descr::Array(descr.clone()),
    );
    let item = b.op_with_descr(
        OpCode::GetarrayitemGcI,
        &[dynamic.into(), Operand::int(2)],
        Descr::Array(descr.clone()),
    );
    let untouched = b.op_with_descr(
        OpCode::GetarrayitemGcI,
        &[dynamic.into(), Operand::int(4)],
        Descr::Array(descr.clone()),
    );
    let fixed_len = b.op_with_descr(OpCode::ArraylenGc, &[fixed.into()], Descr::Array(descr.clone()));
    let len = b.op_with_descr(OpCode::ArraylenGc, &[dynamic.into()], Descr::Array(descr));
    b.finish(
        &[
            dynamic.into(),
            item.into(),
            untouched.into(),
            fixed_len.into(),
            len.into(),
        ],
        &FailDescr::final_descr(0),
    );
    let token = compile(&cpu, &b.build());

    let df = cpu.execute_token(&token, &[Value::Int(5)]);
    assert_eq!(cpu.get_int_value(&df, 1), 77);
    assert_eq!(cpu.get_int_value(&df, 2), 0);
    assert_eq!(cpu.get_int_value(&df, 3), 3);
    assert_eq!(cpu.get_int_value(&df, 4), 5);
    assert_eq!(header_type_id(header(cpu.get_ref_value(&df, 0))), 21);
}

#[test]
fn test_large_array_is_allocated_old_with_cards() {
    let nursery = Arc::new(NurseryGc::new(NurseryConfig::default()));
    let cpu = cpu_with(&nursery);
    let descr = cpu.arraydescrof(&ref_array());

    let mut b = TraceBuilder::new();
    let i0 = b.input(Type::Int);
    let a = b.op_with_descr(OpCode::NewArray, &[i0.into()], Descr::Array(descr.clone()));
    let len = b.op_with_descr(OpCode::ArraylenGc, &[a.into()], Descr::Array(descr));
    b.finish(&[a.into(), len.into()], &FailDescr::final_descr(0));
    let token = compile(&cpu, &b.build());

    // the first allocation installs the nursery window
    cpu.execute_token(&token, &[Value::Int(16)]);
    let before = nursery.stats().array_slowpaths;
    let small = cpu.execute_token(&token, &[Value::Int(16)]);
    assert_eq!(header(cpu.get_ref_value(&small, 0)) & GCFLAG_HAS_CARDS, 0);
    assert_eq!(nursery.stats().array_slowpaths, before);

    // 16 + 10_000 * 8 bytes exceeds the inline limit
    let large = cpu.execute_token(&token, &[Value::Int(10_000)]);
    let arr = cpu.get_ref_value(&large, 0);
    assert_eq!(cpu.get_int_value(&large, 1), 10_000);
    assert_ne!(header(arr) & GCFLAG_HAS_CARDS, 0);
    assert_ne!(header(arr) & GCFLAG_TRACK_YOUNG_PTRS, 0);
    let stats = nursery.stats();
    assert_eq!(stats.array_slowpaths, before + 1);
    assert_eq!(stats.old_allocations, 1);
}

#[test]
fn test_interior_fields() {
    let cpu = cpu();
    let layout = pairs();
    let array = cpu.arraydescrof(&layout);
    let key = cpu.interiorfielddescrof(&layout, "key");
    let value = cpu.interiorfielddescrof(&layout, "value");

    let mut b = TraceBuilder::new();
    let i0 = b.input(Type::Int);
    let a = b.op_with_descr(OpCode::NewArrayClear, &[Operand::int(4)], Descr::Array(array));
    b.void(
        OpCode::SetinteriorfieldGc,
        &[a.into(), i0.into(), Operand::int(5)],
        Descr::InteriorField(key.clone()),
    );
    b.void(
        OpCode::SetinteriorfieldGc,
        &[a.into(), i0.into(), Operand::float(2.5)],
        Descr::InteriorField(value.clone()),
    );
    let k = b.op_with_descr(
        OpCode::GetinteriorfieldGcI,
        &[a.into(), i0.into()],
        Descr::InteriorField(key),
    );
    let f = b.op_with_descr(
        OpCode::GetinteriorfieldGcF,
        &[a.into(), i0.into()],
        Descr::InteriorField(value),
    );
    b.finish(&[a.into(), k.into(), f.into()], &FailDescr::final_descr(0));
    let token = compile(&cpu, &b.build());

    let df = cpu.execute_token(&token, &[Value::Int(3)]);
    let arr = cpu.get_ref_value(&df, 0);
    assert_eq!(cpu.get_int_value(&df, 1), 5);
    assert_eq!(cpu.get_float_value(&df, 2), 2.5);
    assert_eq!(word(arr, 16 + 3 * 16), 5);
    assert_eq!(word(arr, 16 + 3 * 16 + 8), 2.5f64.to_bits());
    assert_eq!(word(arr, 16), 0);
}

#[test]
fn test_raw_and_gc_load_store() {
    let cpu = cpu();
    let raw = cpu.arraydescrof(&ArrayLayout::new("Longs", 0, 8, FieldKind::Signed, None, 0));
    let mut buf = vec![0i64; 4];

    let mut b = TraceBuilder::new();
    let p = b.input(Type::Int);
    b.void(
        OpCode::RawStore,
        &[p.into(), Operand::int(8), Operand::int(1234)],
        Descr::Array(raw.clone()),
    );
    let r1 = b.op_with_descr(
        OpCode::RawLoadI,
        &[p.into(), Operand::int(8)],
        Descr::Array(raw),
    );
    b.void(
        OpCode::GcStore,
        &[p.into(), Operand::int(16), Operand::int(-2), Operand::int(1)],
        None::<Descr>,
    );
    let signed = b.op(OpCode::GcLoadI, &[p.into(), Operand::int(16), Operand::int(-1)]);
    let unsigned = b.op(OpCode::GcLoadI, &[p.into(), Operand::int(16), Operand::int(1)]);
    b.void(
        OpCode::GcStoreIndexed,
        &[
            p.into(),
            Operand::int(3),
            Operand::int(99),
            Operand::int(8),
            Operand::int(0),
            Operand::int(8),
        ],
        None::<Descr>,
    );
    let indexed = b.op(
        OpCode::GcLoadIndexedI,
        &[
            p.into(),
            Operand::int(3),
            Operand::int(8),
            Operand::int(0),
            Operand::int(8),
        ],
    );
    b.finish(
        &[r1.into(), signed.into(), unsigned.into(), indexed.into()],
        &FailDescr::final_descr(0),
    );
    let token = compile(&cpu, &b.build());

    let df = cpu.execute_token(&token, &[Value::Int(buf.as_mut_ptr() as i64)]);
    assert_eq!(ints(&df), vec![1234, -2, 254, 99]);
    assert_eq!(buf[1], 1234);
    assert_eq!(buf[2] & 0xff, 0xfe);
    assert_eq!(buf[3], 99);
}

#[test]
fn test_typed_loads_from_gc_and_raw_memory() {
    let cpu = cpu();
    let layout = StructLayout::new("Cell", 48, 0)
        .field("r", 8, 8, FieldKind::Ref)
        .field("f", 16, 8, FieldKind::Float)
        .field("i", 24, 8, FieldKind::Signed);
    let r = cpu.fielddescrof(&layout, "r");
    let f = cpu.fielddescrof(&layout, "f");
    let i = cpu.fielddescrof(&layout, "i");
    let longs = cpu.arraydescrof(&ArrayLayout::new("Longs", 0, 8, FieldKind::Signed, None, 0));
    let doubles = cpu.arraydescrof(&ArrayLayout::new("Doubles", 0, 8, FieldKind::Float, None, 0));
    let mut buf = vec![0u64; 6];
    buf[1] = 0xabc0;
    buf[2] = 2.5f64.to_bits();
    buf[3] = 17;
    let addr = buf.as_mut_ptr() as usize;

    let mut b = TraceBuilder::new();
    let p = b.input(Type::Ref);
    let q = b.input(Type::Int);
    let gc_r = b.op_with_descr(OpCode::GetfieldGcR, &[p.into()], Descr::Field(r));
    let gc_f = b.op_with_descr(OpCode::GetfieldGcF, &[p.into()], Descr::Field(f.clone()));
    let raw_i = b.op_with_descr(OpCode::GetfieldRawI, &[q.into()], Descr::Field(i.clone()));
    let raw_f = b.op_with_descr(OpCode::GetfieldRawF, &[q.into()], Descr::Field(f));
    b.void(OpCode::SetfieldRaw, &[q.into(), Operand::int(99)], Descr::Field(i));
    let item_i = b.op_with_descr(
        OpCode::GetarrayitemRawI,
        &[q.into(), Operand::int(3)],
        Descr::Array(longs),
    );
    let item_f = b.op_with_descr(
        OpCode::GetarrayitemRawF,
        &[q.into(), Operand::int(2)],
        Descr::Array(doubles.clone()),
    );
    b.void(
        OpCode::SetarrayitemRaw,
        &[q.into(), Operand::int(4), Operand::float(1.25)],
        Descr::Array(doubles.clone()),
    );
    let load_r = b.op(OpCode::GcLoadR, &[p.into(), Operand::int(8), Operand::int(8)]);
    let load_f = b.op(OpCode::GcLoadF, &[p.into(), Operand::int(16), Operand::int(8)]);
    let indexed = |k| {
        [
            p.into(),
            Operand::int(k),
            Operand::int(8),
            Operand::int(0),
            Operand::int(8),
        ]
    };
    let indexed_r = b.op(OpCode::GcLoadIndexedR, &indexed(1));
    let indexed_f = b.op(OpCode::GcLoadIndexedF, &indexed(4));
    let raw_load = b.op_with_descr(
        OpCode::RawLoadF,
        &[q.into(), Operand::int(32)],
        Descr::Array(doubles),
    );
    b.finish(
        &[
            gc_r.into(),
            gc_f.into(),
            raw_i.into(),
            raw_f.into(),
            item_i.into(),
            item_f.into(),
            load_r.into(),
            load_f.into(),
            indexed_r.into(),
            indexed_f.into(),
            raw_load.into(),
        ],
        &FailDescr::final_descr(0),
    );
    let token = compile(&cpu, &b.build());

    let df = cpu.execute_token(
        &token,
        &[Value::Ref(GcRef(addr)), Value::Int(addr as i64)],
    );
    assert_eq!(cpu.get_ref_value(&df, 0), GcRef(0xabc0));
    assert_eq!(cpu.get_float_value(&df, 1), 2.5);
    assert_eq!(cpu.get_int_value(&df, 2), 17);
    assert_eq!(cpu.get_float_value(&df, 3), 2.5);
    assert_eq!(cpu.get_int_value(&df, 4), 99);
    assert_eq!(cpu.get_float_value(&df, 5), 2.5);
    assert_eq!(cpu.get_ref_value(&df, 6), GcRef(0xabc0));
    assert_eq!(cpu.get_float_value(&df, 7), 2.5);
    assert_eq!(cpu.get_ref_value(&df, 8), GcRef(0xabc0));
    assert_eq!(cpu.get_float_value(&df, 9), 1.25);
    assert_eq!(cpu.get_float_value(&df, 10), 1.25);
    assert_eq!(buf[3], 99);
    assert_eq!(f64::from_bits(buf[4]), 1.25);
}

#[test]
fn test_zero_array() {
    let cpu = cpu();
    let descr = cpu.arraydescrof(&int_array());

    let mut b = TraceBuilder::new();
    let r0 = b.input(Type::Ref);
    let start = b.input(Type::Int);
    let length = b.input(Type::Int);
    b.void(
        OpCode::ZeroArray,
        &[
            r0.into(),
            Operand::int(2),
            Operand::int(3),
            Operand::int(8),
            Operand::int(8),
        ],
        Descr::Array(descr.clone()),
    );
    // byte-scaled start and length
    b.void(
        OpCode::ZeroArray,
        &[
            r0.into(),
            start.into(),
            length.into(),
            Operand::int(1),
            Operand::int(1),
        ],
        Descr::Array(descr.clone()),
    );
    b.void(
        OpCode::ZeroArray,
        &[
            r0.into(),
            Operand::int(7),
            Operand::int(0),
            Operand::int(8),
            Operand::int(8),
        ],
        Descr::Array(descr),
    );
    b.finish(&[], &FailDescr::final_descr(0));
    let token = compile(&cpu, &b.build());

    // header, length, eight items
    let mut array = [21i64, 8, 1, 1, 1, 1, 1, 1, 1, 1];
    cpu.execute_token(
        &token,
        &[
            Value::Ref(GcRef::from_ptr(array.as_mut_ptr())),
            Value::Int(48),
            Value::Int(8),
        ],
    );
    assert_eq!(&array[2..], &[1, 1, 0, 0, 0, 1, 0, 1]);
}

#[test]
fn test_write_barrier_slow_path_runs_once() {
    let nursery = Arc::new(NurseryGc::new(NurseryConfig::default()));
    let cpu = cpu_with(&nursery);
    let next = cpu.fielddescrof(&point(), "next");

    let mut b = TraceBuilder::new();
    let obj = b.input(Type::Ref);
    let value = b.input(Type::Ref);
    b.void(OpCode::CondCallGcWb, &[obj.into()], None::<Descr>);
    b.void(OpCode::SetfieldGc, &[obj.into(), value.into()], Descr::Field(next));
    b.finish(&[], &FailDescr::final_descr(0));
    let token = compile(&cpu, &b.build());

    let old = nursery.alloc_old(32, 11);
    let young = nursery.alloc_old(32, 11);
    for _ in 0..2 {
        cpu.execute_token(&token, &[Value::Ref(old), Value::Ref(young)]);
    }
    assert!(nursery.is_remembered(old));
    assert_eq!(nursery.stats().write_barriers, 1);
    assert_eq!(header(old) & GCFLAG_TRACK_YOUNG_PTRS, 0);
    assert_eq!(word(old, 24), young.addr() as u64);
}

#[test]
fn test_array_write_barrier_marks_cards() {
    let nursery = Arc::new(NurseryGc::new(NurseryConfig::default()));
    let cpu = cpu_with(&nursery);
    let descr = cpu.arraydescrof(&ref_array());

    let mut b = TraceBuilder::new();
    let arr = b.input(Type::Ref);
    let index = b.input(Type::Int);
    let value = b.input(Type::Ref);
    b.void(OpCode::CondCallGcWbArray, &[arr.into(), index.into()], None::<Descr>);
    b.void(
        OpCode::SetarrayitemGc,
        &[arr.into(), index.into(), value.into()],
        Descr::Array(descr.clone()),
    );
    b.finish(&[], &FailDescr::final_descr(0));
    let token = compile(&cpu, &b.build());

    let array = nursery.alloc_old_array(&descr, 1000);
    let item = nursery.alloc_old(32, 11);
    for index in [300, 310] {
        cpu.execute_token(
            &token,
            &[Value::Ref(array), Value::Int(index), Value::Ref(item)],
        );
    }

    // SAFETY: array is live and the indices are within its length.
    unsafe {
        assert!(nursery.is_card_marked(array, 300));
        assert!(!nursery.is_card_marked(array, 0));
        assert!(!nursery.is_card_marked(array, 999));
    }
    assert_ne!(header(array) & GCFLAG_CARDS_SET, 0);
    assert_eq!(nursery.objects_with_cards_set(), vec![array]);
    assert_eq!(nursery.stats().array_write_barriers, 1);
    assert_eq!(word(array, 16 + 310 * 8), item.addr() as u64);
}

#[test]
fn test_array_barrier_without_cards_remembers_object() {
    let nursery = Arc::new(NurseryGc::new(NurseryConfig::default()));
    let cpu = cpu_with(&nursery);
    let descr = cpu.arraydescrof(&ref_array());

    let mut b = TraceBuilder::new();
    let arr = b.input(Type::Ref);
    b.void(OpCode::CondCallGcWbArray, &[arr.into(), Operand::int(0)], None::<Descr>);
    b.finish(&[], &FailDescr::final_descr(0));
    let token = compile(&cpu, &b.build());

    let empty = nursery.alloc_old_array(&descr, 0);
    cpu.execute_token(&token, &[Value::Ref(empty)]);
    assert!(nursery.is_remembered(empty));
    assert_eq!(nursery.stats().array_write_barriers, 1);
    assert_eq!(nursery.stats().write_barriers, 1);
}

#[test]
fn test_nursery_refills_in_loop() {
    let nursery = Arc::new(NurseryGc::new(NurseryConfig {
        nursery_size: 256,
        ..NurseryConfig::default()
    }));
    let cpu = cpu_with(&nursery);
    let size = cpu.sizeof(&point());

    let target = TargetToken::new();
    let mut b = TraceBuilder::new();
    let i0 = b.input(Type::Int);
    b.label(&[i0], &target);
    b.op_with_descr(OpCode::New, &[], Descr::Size(size));
    let i1 = b.op(OpCode::IntAdd, &[i0.into(), Operand::int(1)]);
    let more = b.op(OpCode::IntLt, &[i1.into(), Operand::int(100)]);
    b.guard(OpCode::GuardTrue, &[more.into()], &FailDescr::guard(1), &[i1]);
    b.jump(&[i1.into()], &target);
    let token = compile(&cpu, &b.build());

    let df = cpu.execute_token(&token, &[Value::Int(0)]);
    assert_eq!(ints(&df), vec![100]);
    // eight 32-byte objects fit one window
    assert!(nursery.stats().nursery_refills >= 12);
}

#[test]
fn test_descrs_are_cached() {
    let cpu = cpu();
    let layout = point();
    assert!(Arc::ptr_eq(&cpu.sizeof(&layout), &cpu.sizeof(&layout)));
    assert!(Arc::ptr_eq(
        &cpu.fielddescrof(&layout, "x"),
        &cpu.fielddescrof(&layout, "x")
    ));
    assert!(!Arc::ptr_eq(
        &cpu.fielddescrof(&layout, "x"),
        &cpu.fielddescrof(&layout, "next")
    ));
    assert!(Arc::ptr_eq(
        &cpu.arraydescrof(&int_array()),
        &cpu.arraydescrof(&int_array())
    ));
    assert!(Arc::ptr_eq(
        &cpu.interiorfielddescrof(&pairs(), "value"),
        &cpu.interiorfielddescrof(&pairs(), "value")
    ));
    let sig = CallSignature::new(vec![ArgKind::LONG, ArgKind::Ref], ArgKind::Void);
    assert!(Arc::ptr_eq(&cpu.calldescrof(&sig), &cpu.calldescrof(&sig.clone())));

    let x = cpu.fielddescrof(&layout, "x");
    assert_eq!(x.name, "Point.x");
    assert_eq!((x.offset, x.size), (16, 8));
    assert!(x.is_signed());
    assert!(cpu.fielddescrof(&layout, "next").is_pointer_field());
    assert!(cpu.arraydescrof(&ref_array()).is_array_of_pointers());
}

#[test]
#[should_panic(expected = "struct Point has no field y")]
fn test_unknown_field_panics() {
    cpu().fielddescrof(&point(), "y");
}

#[test]
fn test_increment_debug_counter() {
    let cpu = cpu();
    let counter = AtomicI64::new(0);
    let mut b = TraceBuilder::new();
    b.void(
        OpCode::IncrementDebugCounter,
        &[Operand::int(counter.as_ptr() as i64)],
        None::<Descr>,
    );
    b.finish(&[], &FailDescr::final_descr(0));
    let token = compile(&cpu, &b.build());
    for _ in 0..3 {
        cpu.execute_token(&token, &[]);
    }
    assert_eq!(counter.load(Ordering::SeqCst), 3);
}
