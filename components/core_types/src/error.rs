//! Error taxonomy and non-normal call returns.
//!
//! There are no script-level exceptions: native functions and the VM
//! report outcomes through [`CallResult`]. A successful call yields a
//! [`CallReturn`] (a return count or a suspension reason); an [`Error`]
//! unwinds the current task's call chain.

use crate::time::Duration;
use std::fmt;

/// The error taxonomy.
///
/// Parse-time variants surface through the parser with line/token context;
/// runtime variants unwind all active frames of the current task and mark
/// it finished. Allocation failure is fatal to the task but not to the
/// scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// Parse: a specific token was required.
    Expected(&'static str),
    /// Parse: `var` without any declaration.
    MissingVarDecl,
    /// Parse: `for (var a, b : ...)` declares more than one variable.
    OneVarDeclAllowed,
    /// Parse: second `default:` in a switch.
    DuplicateDefault,
    /// Parse: class var initializer is not a literal.
    ConstantValueRequired,
    /// Parse: object literal entry is not `name: expr`.
    PropertyAssignment,
    /// Parse: anything else the grammar rejects.
    SyntaxError(String),
    /// Conversion: string does not parse as a number.
    CannotConvertStringToNumber,
    /// Call: wrong number of parameters for a native method.
    WrongNumberOfParams,
    /// Value outside its allowed range.
    OutOfRange,
    /// Call target is not callable.
    NotCallable,
    /// Call target property does not exist.
    PropertyDoesNotExist,
    /// Bad printf-style format string or argument mismatch.
    BadFormatString,
    /// Allocation failure.
    OutOfMemory,
    /// `arguments()` could not allocate its array.
    CannotCreateArgumentsArray,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Expected(tok) => write!(f, "expected {}", tok),
            Error::MissingVarDecl => write!(f, "missing var declaration"),
            Error::OneVarDeclAllowed => write!(f, "only one var declaration allowed here"),
            Error::DuplicateDefault => write!(f, "duplicate default case"),
            Error::ConstantValueRequired => write!(f, "constant value required"),
            Error::PropertyAssignment => write!(f, "property assignment expected"),
            Error::SyntaxError(s) => write!(f, "syntax error: {}", s),
            Error::CannotConvertStringToNumber => write!(f, "cannot convert string to number"),
            Error::WrongNumberOfParams => write!(f, "wrong number of parameters"),
            Error::OutOfRange => write!(f, "value out of range"),
            Error::NotCallable => write!(f, "value is not callable"),
            Error::PropertyDoesNotExist => write!(f, "property does not exist"),
            Error::BadFormatString => write!(f, "bad format string"),
            Error::OutOfMemory => write!(f, "out of memory"),
            Error::CannotCreateArgumentsArray => write!(f, "cannot create arguments array"),
        }
    }
}

impl std::error::Error for Error {}

/// Non-error outcome of a call or of a VM `execute` entry.
///
/// Suspension reasons propagate by unwinding to the top `execute()` entry;
/// the scheduler interprets the tag and resumes the task when the
/// condition is met. No hidden continuation state exists beyond the saved
/// frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CallReturn {
    /// Normal return leaving `n` values (0 or 1) for the caller.
    Count(u32),
    /// Suspend the task for at least the given duration.
    MsDelay(Duration),
    /// Suspend the task until an event has been delivered.
    WaitForEvent,
    /// The task's program ran to completion.
    Finished,
    /// The task was externally terminated at a safe point.
    Terminated,
}

/// Result type every native function and the VM dispatch loop return.
pub type CallResult = Result<CallReturn, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(Error::Expected(";").to_string(), "expected ;");
        assert_eq!(
            Error::CannotConvertStringToNumber.to_string(),
            "cannot convert string to number"
        );
        assert_eq!(Error::DuplicateDefault.to_string(), "duplicate default case");
    }

    #[test]
    fn test_call_return_variants() {
        let r: CallResult = Ok(CallReturn::Count(1));
        assert!(matches!(r, Ok(CallReturn::Count(1))));
        let d: CallResult = Ok(CallReturn::MsDelay(Duration::from_millis(10)));
        assert!(matches!(d, Ok(CallReturn::MsDelay(_))));
    }
}
