//! One module per subcommand, each exposing an `exec`-style entry point —
//! mirrors the teacher CLI's `commands::{run, repl}` split.

pub mod repl;
pub mod run;
