//! Runtime error domain, kept distinct from compile-time diagnostics so a
//! caller (the CLI) can choose an exit code per §6's taxonomy without
//! string-sniffing a message.

use thiserror::Error;

/// A runtime fault: the message `runtime_error` was raised with, plus one
/// `[line L] in <name|script>` entry per active call frame, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", render_trace(message, stack_trace))]
pub struct RuntimeError {
    pub message: String,
    pub stack_trace: Vec<String>,
}

fn render_trace(message: &str, stack_trace: &[String]) -> String {
    let mut out = format!("{message}\n");
    for line in stack_trace {
        out.push_str(line);
        out.push('\n');
    }
    out
}

/// The three outcomes of [`crate::interpret`], mirroring spec §6 exactly —
/// not folded into a single `anyhow::Error`, because the CLI must tell
/// these apart to pick an exit code (64/65/70).
#[derive(Debug, Error)]
pub enum InterpretError {
    #[error("{0}")]
    Compile(#[from] loxvm_compiler::CompileError),
    #[error("{0}")]
    Runtime(#[from] RuntimeError),
}

pub type InterpretResult = Result<(), InterpretError>;
