//! Runtime built-ins.
//!
//! Each module declares its native handlers and an `install` that wires
//! them into an execution unit as descriptor-table prototypes (the host
//! object protocol) or bare global functions. [`install`] wires the whole
//! standard surface.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod array;
pub mod base64;
pub mod fs;
pub mod global;
pub mod gpio;
pub mod ipaddr;
pub mod iterator;
pub mod json;
pub mod object;
pub mod task;
pub mod tcp;
pub mod udp;

use interpreter::ExecutionUnit;

/// Installs every built-in global and prototype.
pub fn install(eu: &mut ExecutionUnit) {
    global::install(eu);
    iterator::install(eu);
    array::install(eu);
    object::install(eu);
    ipaddr::install(eu);
    gpio::install(eu);
    base64::install(eu);
    json::install(eu);
    fs::install(eu);
    tcp::install(eu);
    udp::install(eu);
    task::install(eu);
}
