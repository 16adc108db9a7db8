//! MicaScript host binary library.
//!
//! Provides the [`Runtime`] that composes parser, VM, built-ins and
//! scheduler, plus the CLI surface and REPL.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cli;
pub mod error;
pub mod repl;
pub mod runtime;

pub use cli::Cli;
pub use error::{CliError, CliResult};
pub use runtime::{run_capturing, run_capturing_with, Runtime};
