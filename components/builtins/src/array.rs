//! The Array prototype.

use crate::iterator::make_iterator;
use core_types::{CallResult, CallReturn, Value, WellKnown};
use interpreter::host::ProtoBuilder;
use interpreter::{ExecutionUnit, NativeFn};

const METHODS: &[(WellKnown, NativeFn)] = &[
    (WellKnown::Constructor, constructor),
    (WellKnown::Iterator, iterator),
    (WellKnown::Length, length),
];

/// Installs the `Array` prototype. The prototype itself is array-mode so
/// instances constructed from it are too.
pub fn install(eu: &mut ExecutionUnit) {
    let proto = {
        let mut builder = ProtoBuilder::new(eu, WellKnown::Array.into());
        for &(name, handler) in METHODS {
            builder = builder.method(name.into(), handler);
        }
        builder.build()
    };
    let heap = eu.heap();
    let mut heap = heap.borrow_mut();
    if let Some(o) = heap.object_mut(proto) {
        o.set_array(true);
    }
}

/// `new Array(e0, e1, ...)` seeds the instance's elements.
fn constructor(eu: &mut ExecutionUnit, this: Value, nparams: u32) -> CallResult {
    if let Some(id) = this.as_object() {
        let args: Vec<Value> = (0..nparams).map(|i| eu.native_arg(nparams, i)).collect();
        let heap = eu.heap();
        let mut heap = heap.borrow_mut();
        if let Some(o) = heap.object_mut(id) {
            o.set_array(true);
            for a in args {
                o.append_element(a);
            }
        }
    }
    Ok(CallReturn::Count(0))
}

fn iterator(eu: &mut ExecutionUnit, this: Value, _nparams: u32) -> CallResult {
    make_iterator(eu, this)
}

fn length(eu: &mut ExecutionUnit, this: Value, _nparams: u32) -> CallResult {
    let len = this
        .as_object()
        .and_then(|id| eu.heap().borrow().object(id).map(|o| o.element_count()))
        .unwrap_or(0);
    eu.push(Value::Integer(len as i32));
    Ok(CallReturn::Count(1))
}
