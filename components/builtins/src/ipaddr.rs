//! The IPAddr prototype.
//!
//! Instances are element-indexed objects holding four octets. Hostname
//! lookup is asynchronous: the callback is pinned while the request is in
//! flight and delivered through the event queue.

use core_types::{CallResult, CallReturn, Error, Value, WellKnown};
use interpreter::host::{EventRecord, ProtoBuilder};
use interpreter::{ExecutionUnit, NativeFn};

const METHODS: &[(WellKnown, NativeFn)] = &[
    (WellKnown::Constructor, constructor),
    (WellKnown::ToString, to_string),
    (WellKnown::LookupHostname, lookup_hostname),
];

/// Installs the `IPAddr` prototype.
pub fn install(eu: &mut ExecutionUnit) {
    let mut builder = ProtoBuilder::new(eu, WellKnown::IpAddr.into());
    for &(name, handler) in METHODS {
        builder = builder.method(name.into(), handler);
    }
    builder.build();
}

fn parse_dotted(text: &str) -> Option<[u8; 4]> {
    let mut octets = [0u8; 4];
    let mut parts = text.split('.');
    for octet in &mut octets {
        let part = parts.next()?;
        *octet = part.trim().parse::<u8>().ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(octets)
}

fn store_octets(eu: &mut ExecutionUnit, this: Value, octets: [u8; 4]) {
    if let Some(id) = this.as_object() {
        let heap = eu.heap();
        let mut heap = heap.borrow_mut();
        if let Some(o) = heap.object_mut(id) {
            for (i, octet) in octets.iter().enumerate() {
                o.set_element(i, Value::Integer(*octet as i32));
            }
        }
    }
}

fn read_octets(eu: &ExecutionUnit, this: Value) -> [u8; 4] {
    let mut octets = [0u8; 4];
    if let Some(id) = this.as_object() {
        let heap = eu.heap();
        let heap = heap.borrow();
        if let Some(o) = heap.object(id) {
            for (i, octet) in octets.iter_mut().enumerate() {
                if let Some(Value::Integer(n)) = o.element(i) {
                    *octet = n as u8;
                }
            }
        }
    }
    octets
}

/// `IPAddr(str)` or `IPAddr(a, b, c, d)` with each octet in 0..=255.
fn constructor(eu: &mut ExecutionUnit, this: Value, nparams: u32) -> CallResult {
    let octets = match nparams {
        1 => {
            let text = eu.to_string_value(eu.native_arg(nparams, 0));
            parse_dotted(&text).unwrap_or([0; 4])
        }
        4 => {
            let mut octets = [0u8; 4];
            for (i, octet) in octets.iter_mut().enumerate() {
                let n = eu.to_int_value(eu.native_arg(nparams, i as u32))?;
                if !(0..=255).contains(&n) {
                    return Err(Error::OutOfRange);
                }
                *octet = n as u8;
            }
            octets
        }
        _ => [0; 4],
    };
    store_octets(eu, this, octets);
    Ok(CallReturn::Count(0))
}

fn to_string(eu: &mut ExecutionUnit, this: Value, nparams: u32) -> CallResult {
    if nparams != 0 {
        return Err(Error::WrongNumberOfParams);
    }
    let octets = read_octets(eu, this);
    let text = format!("{}.{}.{}.{}", octets[0], octets[1], octets[2], octets[3]);
    let id = eu.heap().borrow_mut().create_string(&text);
    eu.push(Value::Str(id));
    Ok(CallReturn::Count(1))
}

/// `IPAddr.lookupHostname(name, cb)`: resolve through the host seam and
/// deliver `(name, ip)` to the callback via the event queue. The record
/// pins the callback until delivery.
fn lookup_hostname(eu: &mut ExecutionUnit, _this: Value, nparams: u32) -> CallResult {
    if nparams < 2 {
        return Ok(CallReturn::Count(0));
    }
    let hostname = eu.to_string_value(eu.native_arg(nparams, 0));
    let func = eu.native_arg(nparams, 1);

    let resolved = eu.resolver().lookup(&hostname);
    if let Some(octets) = resolved {
        let proto = eu
            .global(WellKnown::IpAddr.into())
            .and_then(|v| v.as_object())
            .unwrap_or(core_types::ObjectId::NULL);
        let inst = eu.construct_instance(proto);
        store_octets(eu, Value::Obj(inst), octets);
        let name_id = eu.heap().borrow_mut().create_string(&hostname);

        eu.start_event_listening();
        eu.enqueue_event(EventRecord {
            func,
            this: Value::Undefined,
            args: vec![Value::Str(name_id), Value::Obj(inst)],
            stop_listening: true,
        });
    }
    Ok(CallReturn::Count(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dotted() {
        assert_eq!(parse_dotted("10.0.0.1"), Some([10, 0, 0, 1]));
        assert_eq!(parse_dotted("255.255.255.255"), Some([255; 4]));
        assert_eq!(parse_dotted("1.2.3"), None);
        assert_eq!(parse_dotted("1.2.3.4.5"), None);
        assert_eq!(parse_dotted("1.2.3.999"), None);
    }
}
