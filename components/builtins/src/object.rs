//! The Object prototype.

use crate::iterator::make_iterator;
use core_types::{CallResult, CallReturn, Value, WellKnown};
use interpreter::host::ProtoBuilder;
use interpreter::{ExecutionUnit, NativeFn};

const METHODS: &[(WellKnown, NativeFn)] = &[
    (WellKnown::Constructor, constructor),
    (WellKnown::Iterator, iterator),
    (WellKnown::ToString, to_string),
];

/// Installs the `Object` prototype.
pub fn install(eu: &mut ExecutionUnit) {
    let mut builder = ProtoBuilder::new(eu, WellKnown::Object.into());
    for &(name, handler) in METHODS {
        builder = builder.method(name.into(), handler);
    }
    builder.build();
}

fn constructor(_eu: &mut ExecutionUnit, _this: Value, _nparams: u32) -> CallResult {
    Ok(CallReturn::Count(0))
}

/// Iterates property values in insertion order.
fn iterator(eu: &mut ExecutionUnit, this: Value, _nparams: u32) -> CallResult {
    make_iterator(eu, this)
}

fn to_string(eu: &mut ExecutionUnit, this: Value, _nparams: u32) -> CallResult {
    let text = eu.to_string_value(this);
    let id = eu.heap().borrow_mut().create_string(&text);
    eu.push(Value::Str(id));
    Ok(CallReturn::Count(1))
}
