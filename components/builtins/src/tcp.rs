//! The TCP prototype, over the host socket seam.
//!
//! Inbound traffic arrives as events through the scheduler queue; the
//! transmit surface here is the script-visible contract.

use core_types::{Atom, CallResult, CallReturn, Value, WellKnown};
use interpreter::host::ProtoBuilder;
use interpreter::ExecutionUnit;

fn port_atom(eu: &mut ExecutionUnit) -> Atom {
    eu.atoms().borrow_mut().intern("%port")
}

/// Installs the `TCP` prototype.
pub fn install(eu: &mut ExecutionUnit) {
    let atoms = eu.atoms();
    let send_a = atoms.borrow_mut().intern("send");
    let disconnect_a = atoms.borrow_mut().intern("disconnect");
    ProtoBuilder::new(eu, WellKnown::Tcp.into())
        .method(WellKnown::Constructor.into(), constructor)
        .method(send_a, send)
        .method(disconnect_a, disconnect)
        .build();
}

fn this_port(eu: &mut ExecutionUnit, this: Value) -> u16 {
    let port_a = port_atom(eu);
    this.as_object()
        .and_then(|id| eu.heap().borrow().object(id).and_then(|o| o.property(port_a)))
        .and_then(|v| match v {
            Value::Integer(n) => Some(n as u16),
            _ => None,
        })
        .unwrap_or(0)
}

/// `new TCP(port)`.
fn constructor(eu: &mut ExecutionUnit, this: Value, nparams: u32) -> CallResult {
    let port = if nparams > 0 {
        eu.to_int_value(eu.native_arg(nparams, 0))? as u16
    } else {
        0
    };
    let port_a = port_atom(eu);
    if let Some(id) = this.as_object() {
        let heap = eu.heap();
        let mut heap = heap.borrow_mut();
        if let Some(o) = heap.object_mut(id) {
            o.set_property(port_a, Value::Integer(port as i32));
        }
    }
    Ok(CallReturn::Count(0))
}

fn send(eu: &mut ExecutionUnit, this: Value, nparams: u32) -> CallResult {
    let port = this_port(eu, this);
    for i in 0..nparams {
        let data = eu.to_string_value(eu.native_arg(nparams, i));
        eu.sockets().borrow_mut().tcp_send(port, &data);
    }
    Ok(CallReturn::Count(0))
}

fn disconnect(eu: &mut ExecutionUnit, this: Value, _nparams: u32) -> CallResult {
    let port = this_port(eu, this);
    eu.sockets().borrow_mut().tcp_disconnect(port);
    Ok(CallReturn::Count(0))
}
