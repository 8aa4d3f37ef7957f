//! `loxvm run <file>` — compiles and executes one source file to completion.

use anyhow::Context;
use loxvm_core::Heap;
use loxvm_vm::{InterpretResult, VmOptions};
use std::path::Path;

/// Reads `path`, runs it in a fresh [`Heap`], and returns the
/// `interpret()` outcome for the caller to turn into an exit code.
///
/// # Errors
///
/// Returns an error if `path` cannot be read (surfaced by `main` as exit
/// code 74, distinct from the `InterpretResult` the Ok branch carries).
pub fn exec(path: &Path, options: VmOptions) -> anyhow::Result<InterpretResult> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut heap = Heap::new();
    Ok(loxvm_vm::interpret(&source, &mut heap, options))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn write_temp(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn running_a_file_that_prints_succeeds() {
        let path = write_temp("loxvm_cli_run_ok.lox", "print 1 + 2;");
        let result = exec(&path, VmOptions::default()).unwrap();
        assert!(result.is_ok());
        assert_eq!(crate::exit_code(&result), crate::EX_OK);
    }

    #[test]
    fn running_a_file_with_a_compile_error_reports_data_err() {
        let path = write_temp("loxvm_cli_run_compile_err.lox", "var;");
        let result = exec(&path, VmOptions::default()).unwrap();
        assert!(matches!(result, Err(loxvm_vm::InterpretError::Compile(_))));
        assert_eq!(crate::exit_code(&result), crate::EX_DATAERR);
    }

    #[test]
    fn running_a_missing_file_is_an_io_error() {
        let path = std::env::temp_dir().join("loxvm_cli_run_does_not_exist.lox");
        assert!(exec(&path, VmOptions::default()).is_err());
    }
}
