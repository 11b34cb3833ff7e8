//! Helpers shared by the backend integration tests

#![allow(dead_code)]

use std::sync::Arc;

use rjit_backend::{BackendConfig, CraneliftCpu, Cpu, Deadframe};
use rjit_ir::{JitCellToken, Trace, Value};

/// CPU with trace verification on, whatever the build profile
pub fn cpu() -> CraneliftCpu {
    CraneliftCpu::with_config(BackendConfig::default().with_verify_traces(true))
        .expect("host ISA should be supported")
}

/// Compile `trace` under a fresh token
pub fn compile(cpu: &impl Cpu, trace: &Trace) -> Arc<JitCellToken> {
    let token = JitCellToken::new();
    cpu.compile_loop(trace, &token).expect("loop should compile");
    token
}

/// Run `token` with integer arguments
pub fn run_ints(cpu: &impl Cpu, token: &Arc<JitCellToken>, args: &[i64]) -> Deadframe {
    let args: Vec<Value> = args.iter().map(|&v| Value::Int(v)).collect();
    cpu.execute_token(token, &args)
}

/// Every saved value of `deadframe` as ints
pub fn ints(deadframe: &Deadframe) -> Vec<i64> {
    (0..deadframe.len())
        .map(|i| deadframe.get_int_value(i))
        .collect()
}
