//! Scanner and single-pass Pratt compiler for loxvm source text.
//!
//! [`compile`] is the sole entry point: it turns a source string into a
//! top-level [`loxvm_core::object::LoxFunction`] ready for the VM to wrap
//! in a closure and call, or a [`CompileError`] carrying every diagnostic
//! collected along the way.

pub mod compiler;
pub mod error;
pub mod scanner;

pub use compiler::{compile, compile_with_roots};
pub use error::{CompileError, DiagLocation, Diagnostic};
pub use scanner::{Scanner, Token, TokenKind};
