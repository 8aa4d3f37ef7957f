//! Binary entry point: argument parsing, logging/panic-report init, and
//! mapping an `interpret()` outcome onto the exit codes of spec §6.

use clap::{Parser, Subcommand};
use loxvm_cli::commands;
use loxvm_vm::VmOptions;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "loxvm", version, about = "A bytecode compiler and VM for a small dynamic scripting language")]
struct Cli {
    /// Log each dispatched instruction and the stack before it runs.
    #[arg(long, global = true)]
    trace: bool,

    /// Collect garbage before every allocation instead of only past the
    /// growth threshold — a soundness stress test, not a throughput knob.
    #[arg(long, global = true)]
    stress_gc: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run a source file to completion.
    Run {
        /// Path to a loxvm source file.
        file: PathBuf,
    },
}

fn main() -> ExitCode {
    color_eyre::install().expect("failed to install the panic/backtrace reporter");
    tracing_subscriber::fmt::init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(u8::try_from(loxvm_cli::EX_USAGE).unwrap_or(1));
        }
    };
    let options = VmOptions { trace: cli.trace, stress_gc: cli.stress_gc };

    let outcome = match cli.command {
        Some(Command::Run { file }) => commands::run::exec(&file, options).map(|result| {
            if let Err(e) = &result {
                eprintln!("{e}");
            }
            loxvm_cli::exit_code(&result)
        }),
        None => commands::repl::exec(options).map(|()| loxvm_cli::EX_OK),
    };

    match outcome {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            eprintln!("{e:?}");
            ExitCode::from(u8::try_from(loxvm_cli::EX_IOERR).unwrap_or(1))
        }
    }
}
