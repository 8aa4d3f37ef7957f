//! Compile-time diagnostics.
//!
//! Errors are *reported*, not thrown: the parser keeps going (entering
//! panic mode to suppress cascades) so a single `compile()` call surfaces
//! every independent mistake in one pass, matching §7 of the design.

use std::fmt;
use thiserror::Error;

/// Where in the token stream a diagnostic was anchored, for the
/// `Error at '<lexeme>'` / `Error at end` rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagLocation {
    Lexeme(String),
    End,
    /// The scanner itself produced an `ERROR` token (e.g. an unterminated
    /// string); there is no lexeme to quote, only the scanner's message.
    None,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub line: u32,
    pub location: DiagLocation,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            DiagLocation::End => write!(f, "[line {}] Error at end: {}", self.line, self.message),
            DiagLocation::Lexeme(lexeme) => {
                write!(f, "[line {}] Error at '{}': {}", self.line, lexeme, self.message)
            }
            DiagLocation::None => write!(f, "[line {}] Error: {}", self.line, self.message),
        }
    }
}

/// Raised by [`crate::compile`] when any diagnostic was reported. Carries
/// every diagnostic collected across the whole source, not just the first.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", render_diagnostics(diagnostics))]
pub struct CompileError {
    pub diagnostics: Vec<Diagnostic>,
}

fn render_diagnostics(diagnostics: &[Diagnostic]) -> String {
    diagnostics.iter().map(|d| format!("{d}\n")).collect()
}
