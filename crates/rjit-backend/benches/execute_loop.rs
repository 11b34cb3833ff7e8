//! Trace Execution Benchmarks
//!
//! Measures compiled counting loops, bridge dispatch and compilation itself.

use std::hint::black_box;
use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use rjit_backend::{BackendConfig, CraneliftCpu, Cpu};
use rjit_ir::{
    FailDescr, JitCellToken, OpCode, Operand, TargetToken, Trace, TraceBuilder, Type, Value,
};

fn cpu() -> CraneliftCpu {
    CraneliftCpu::with_config(BackendConfig::default()).expect("host ISA should be supported")
}

/// `while i < n { i += 1 }`, leaving through guard 1
fn counting_loop() -> (Trace, Arc<FailDescr>) {
    let target = TargetToken::new();
    let exit = FailDescr::guard(1);
    let mut b = TraceBuilder::new();
    let i0 = b.input(Type::Int);
    let n = b.input(Type::Int);
    b.label(&[i0, n], &target);
    let i1 = b.op(OpCode::IntAdd, &[i0.into(), Operand::int(1)]);
    let more = b.op(OpCode::IntLt, &[i1.into(), n.into()]);
    b.guard(OpCode::GuardTrue, &[more.into()], &exit, &[i1]);
    b.jump(&[i1.into(), n.into()], &target);
    (b.build(), exit)
}

fn bench_counting_loop(c: &mut Criterion) {
    let cpu = cpu();
    let (trace, _) = counting_loop();
    let token = JitCellToken::new();
    cpu.compile_loop(&trace, &token).expect("loop should compile");

    let mut group = c.benchmark_group("counting_loop");
    for n in [10i64, 1_000, 100_000] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| {
                let df = cpu.execute_token(&token, &[Value::Int(0), Value::Int(black_box(n))]);
                black_box(df.get_int_value(0))
            })
        });
    }
    group.finish();
}

fn bench_bridge_exit(c: &mut Criterion) {
    let cpu = cpu();
    let (trace, exit) = counting_loop();
    let token = JitCellToken::new();
    cpu.compile_loop(&trace, &token).expect("loop should compile");
    let mut b = TraceBuilder::new();
    let i = b.input(Type::Int);
    let r = b.op(OpCode::IntMul, &[i.into(), Operand::int(2)]);
    b.finish(&[r.into()], &FailDescr::final_descr(0));
    cpu.compile_bridge(&exit, &b.build(), &token)
        .expect("bridge should compile");

    c.bench_function("bridge_exit", |b| {
        b.iter(|| {
            let df = cpu.execute_token(&token, &[Value::Int(0), Value::Int(black_box(100))]);
            black_box(df.get_int_value(0))
        })
    });
}

fn bench_compile_loop(c: &mut Criterion) {
    let cpu = cpu();
    let (trace, _) = counting_loop();
    c.bench_function("compile_loop", |b| {
        b.iter(|| {
            let token = JitCellToken::new();
            cpu.compile_loop(black_box(&trace), &token)
                .expect("loop should compile");
            cpu.free_loop_and_bridges(&token);
        })
    });
}

criterion_group!(benches, bench_counting_loop, bench_bridge_exit, bench_compile_loop);
criterion_main!(benches);
