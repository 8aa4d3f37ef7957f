//! The stack-based virtual machine for loxvm: dispatch loop, call frames,
//! closures and upvalues, class/instance/method dispatch.
//!
//! [`interpret`] is the top-level entry point matching spec §6:
//! `interpret(source) -> {Ok, CompileError, RuntimeError}`.

pub mod error;
pub mod vm;

pub use error::{InterpretError, InterpretResult, RuntimeError};
pub use vm::{Vm, VmOptions};

use loxvm_core::object::NativeFn;
use loxvm_core::{Heap, Value};
use std::io::Write;
use std::sync::OnceLock;
use std::time::Instant;

/// Compiles and runs `source` in a fresh, one-shot [`Vm`] built on `heap`,
/// printing to the process's standard output. For a REPL that must keep
/// globals alive across many calls, build a [`Vm`] once and drive it with
/// [`interpret_line`] instead — this function discards its `Vm` (and with
/// it, every global) when it returns.
pub fn interpret(source: &str, heap: &mut Heap, options: VmOptions) -> InterpretResult {
    interpret_with_stdout(source, heap, options, Box::new(std::io::stdout()))
}

/// Like [`interpret`], but `print` writes to `stdout` instead — how tests
/// and embedders capture program output.
pub fn interpret_with_stdout(
    source: &str,
    heap: &mut Heap,
    options: VmOptions,
    stdout: Box<dyn Write>,
) -> InterpretResult {
    heap.stress_gc = options.stress_gc;
    let mut vm = Vm::with_stdout(heap, options, stdout);
    install_stdlib(&mut vm, heap);
    interpret_line(&mut vm, heap, source)
}

/// Compiles and runs one more `source` string against an already-built
/// [`Vm`]/[`Heap`] pair — the REPL entry point. Globals, interned strings,
/// and GC state all persist across calls, which is exactly why `vm` itself
/// is unioned into the compiler's roots: a collection triggered mid-compile
/// of *this* line must still see the globals a *previous* line defined, or
/// they could be swept out from under it (see `Compiler::extra_roots`).
pub fn interpret_line(vm: &mut Vm, heap: &mut Heap, source: &str) -> InterpretResult {
    let function = loxvm_compiler::compile_with_roots(source, heap, vm)?;
    vm.run_function(heap, function)?;
    Ok(())
}

/// Registers the native function library (`clock`) on a freshly built `vm`.
/// Exposed so a long-lived REPL session can install it once and then drive
/// many [`interpret_line`] calls.
pub fn install_stdlib(vm: &mut Vm, heap: &mut Heap) {
    vm.define_native(heap, "clock", NativeFn { name: "clock", arity: 0, func: clock_native });
}

static PROCESS_START: OnceLock<Instant> = OnceLock::new();

/// Seconds since the first call to `clock()` — monotonic, matching the
/// original's `clock() / CLOCKS_PER_SEC`. `Native` functions are plain `fn`
/// pointers (no captured state per §3), so the epoch is a process-wide
/// lazily-initialized `Instant` rather than a field on `Vm`.
fn clock_native(_args: &[Value]) -> Result<Value, String> {
    let start = PROCESS_START.get_or_init(Instant::now);
    Ok(Value::Number(start.elapsed().as_secs_f64()))
}
