//! Error types for the CLI.

use core_types::Error;
use parser::ParseError;
use std::fmt;

/// CLI-specific errors.
#[derive(Debug)]
pub enum CliError {
    /// File I/O error.
    IoError(std::io::Error),

    /// Parse error with source context.
    ParseError(ParseError),

    /// Script runtime error.
    ScriptError(Error),

    /// Image read/write error.
    ImageError(memory_manager::ImageError),

    /// REPL error.
    ReplError(String),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::IoError(e) => write!(f, "file error: {}", e),
            CliError::ParseError(e) => write!(f, "parse error: {}", e),
            CliError::ScriptError(e) => write!(f, "script error: {}", e),
            CliError::ImageError(e) => write!(f, "image error: {}", e),
            CliError::ReplError(s) => write!(f, "repl error: {}", s),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> Self {
        CliError::IoError(err)
    }
}

impl From<ParseError> for CliError {
    fn from(err: ParseError) -> Self {
        CliError::ParseError(err)
    }
}

impl From<Error> for CliError {
    fn from(err: Error) -> Self {
        CliError::ScriptError(err)
    }
}

impl From<memory_manager::ImageError> for CliError {
    fn from(err: memory_manager::ImageError) -> Self {
        CliError::ImageError(err)
    }
}

/// Result type for CLI operations.
pub type CliResult<T> = Result<T, CliError>;
