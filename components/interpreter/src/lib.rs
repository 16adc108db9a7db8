//! MicaScript virtual machine.
//!
//! The [`ExecutionUnit`] interprets compiled programs: a shared value
//! stack carved into per-frame windows, reference values for assignment
//! targets, and explicit suspension reasons instead of hidden coroutine
//! state. Host capabilities reach scripts through the host object
//! protocol in [`host`]: static descriptor tables of native functions
//! bound into prototype objects.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod execution_unit;
pub mod host;

pub use execution_unit::{ExecutionUnit, NativeFn};
pub use host::{
    CaptureWriter, ConsoleWriter, EventRecord, FixedResolver, GpioBackend, HostnameResolver,
    LoopbackSockets, ProtoBuilder, SimulatedPins, SocketBackend, StdResolver, StdoutWriter,
};
