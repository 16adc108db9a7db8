//! The UDP prototype, over the host socket seam.

use core_types::{Atom, CallResult, CallReturn, Value, WellKnown};
use interpreter::host::ProtoBuilder;
use interpreter::ExecutionUnit;

fn port_atom(eu: &mut ExecutionUnit) -> Atom {
    eu.atoms().borrow_mut().intern("%port")
}

/// Installs the `UDP` prototype.
pub fn install(eu: &mut ExecutionUnit) {
    let atoms = eu.atoms();
    let send_a = atoms.borrow_mut().intern("send");
    ProtoBuilder::new(eu, WellKnown::Udp.into())
        .method(WellKnown::Constructor.into(), constructor)
        .method(send_a, send)
        .build();
}

/// `new UDP(port)`.
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

/// `udp.send(ip, port, data)`: `ip` is an IPAddr-style element-indexed
/// object.
fn send(eu: &mut ExecutionUnit, _this: Value, nparams: u32) -> CallResult {
    if nparams < 3 {
        return Ok(CallReturn::Count(0));
    }
    let ip_value = eu.native_arg(nparams, 0);
    let mut addr = [0u8; 4];
    if let Some(id) = ip_value.as_object() {
        let heap = eu.heap();
        let heap = heap.borrow();
        if let Some(o) = heap.object(id) {
            for (i, octet) in addr.iter_mut().enumerate() {
                if let Some(Value::Integer(n)) = o.element(i) {
                    *octet = n as u8;
                }
            }
        }
    }
    let port = eu.to_int_value(eu.native_arg(nparams, 1))? as u16;
    let data = eu.to_string_value(eu.native_arg(nparams, 2));
    eu.sockets().borrow_mut().udp_send(addr, port, &data);
    Ok(CallReturn::Count(0))
}
