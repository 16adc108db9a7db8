//! Command-line arguments.

use clap::Parser;

/// MicaScript runtime.
#[derive(Parser, Debug)]
#[command(name = "mica", version, about = "MicaScript embedded scripting runtime")]
pub struct Cli {
    /// Execute a script file.
    #[arg(short, long)]
    pub file: Option<String>,

    /// Evaluate inline source.
    #[arg(short, long)]
    pub eval: Option<String>,

    /// Start the interactive REPL.
    #[arg(short, long)]
    pub repl: bool,

    /// Print a bytecode listing after parsing.
    #[arg(long)]
    pub print_bytecode: bool,

    /// Write the compiled program image next to the input file instead of
    /// executing it.
    #[arg(long)]
    pub compile: bool,
}
