//! File runner and REPL for loxvm — the "external collaborator" of spec §6:
//! owns argument parsing and exit-code selection, and calls straight into
//! [`loxvm_vm::interpret`]/[`loxvm_vm::interpret_with_stdout`] for
//! everything else.

pub mod commands;

/// Exit codes per §6: `0` success, `65` compile error, `70` runtime error.
/// `64` (usage) and `74` (I/O) are chosen directly by `main` before a
/// [`loxvm_vm::InterpretResult`] exists at all.
pub const EX_OK: i32 = 0;
pub const EX_USAGE: i32 = 64;
pub const EX_DATAERR: i32 = 65;
pub const EX_SOFTWARE: i32 = 70;
pub const EX_IOERR: i32 = 74;

/// Maps an `interpret()` outcome onto the exit code a caller should use.
#[must_use]
pub fn exit_code(result: &loxvm_vm::InterpretResult) -> i32 {
    match result {
        Ok(()) => EX_OK,
        Err(loxvm_vm::InterpretError::Compile(_)) => EX_DATAERR,
        Err(loxvm_vm::InterpretError::Runtime(_)) => EX_SOFTWARE,
    }
}
