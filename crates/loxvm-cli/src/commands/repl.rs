//! Bare `loxvm` invocation — an interactive read-eval-print loop.
//!
//! One [`Heap`] and one [`Vm`] persist across lines, so a variable declared
//! on one line is visible on the next. Each line is a fresh `compile()` call
//! sharing that heap, which is why [`interpret_line`] unions the live
//! `Vm`'s roots into the compile-time collector (see `Compiler::extra_roots`
//! in loxvm-compiler) — without it, a long REPL session under GC pressure
//! could sweep an earlier line's still-live globals out from under a later
//! one.

use anyhow::Context;
use loxvm_core::Heap;
use loxvm_vm::{interpret_line, install_stdlib, Vm, VmOptions};
use std::io::{self, Write};

/// Runs the loop until stdin closes (ctrl-D) or `exit`/`quit` is entered.
/// Per-line compile/runtime errors are reported and the loop continues;
/// only an I/O failure on the prompt itself aborts the REPL.
///
/// # Errors
///
/// Returns an error if reading from or writing to the terminal fails.
pub fn exec(options: VmOptions) -> anyhow::Result<()> {
    println!("loxvm — ctrl-d to quit");
    let mut heap = Heap::new();
    heap.stress_gc = options.stress_gc;
    let mut vm = Vm::new(&mut heap, options);
    install_stdlib(&mut vm, &mut heap);
    let mut line = String::new();
    loop {
        print!("> ");
        io::stdout().flush().context("failed to flush prompt")?;
        line.clear();
        let bytes_read = io::stdin().read_line(&mut line).context("failed to read a line")?;
        if bytes_read == 0 {
            println!();
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed == "exit" || trimmed == "quit" {
            break;
        }
        if let Err(e) = interpret_line(&mut vm, &mut heap, trimmed) {
            eprintln!("{e}");
        }
    }
    Ok(())
}
