//! The GPIO builtin, over the host pin seam.

use core_types::{Atom, CallResult, CallReturn, Value, WellKnown};
use interpreter::host::ProtoBuilder;
use interpreter::ExecutionUnit;
use memory_manager::Object;

/// Installs the `GPIO` object with its methods and enumeration objects.
pub fn install(eu: &mut ExecutionUnit) {
    let atoms = eu.atoms();
    let set_pin_mode_a = atoms.borrow_mut().intern("setPinMode");
    let digital_write_a = atoms.borrow_mut().intern("digitalWrite");
    let digital_read_a = atoms.borrow_mut().intern("digitalRead");
    let pin_mode_a = atoms.borrow_mut().intern("PinMode");
    let trigger_a = atoms.borrow_mut().intern("Trigger");

    let pin_mode = enum_object(
        eu,
        &[("Output", 0), ("Input", 1), ("InputPullup", 2), ("OpenDrain", 3)],
    );
    let trigger = enum_object(
        eu,
        &[
            ("None", 0),
            ("RisingEdge", 1),
            ("FallingEdge", 2),
            ("BothEdges", 3),
            ("Low", 4),
            ("High", 5),
        ],
    );

    ProtoBuilder::new(eu, WellKnown::Gpio.into())
        .method(set_pin_mode_a, set_pin_mode)
        .method(digital_write_a, digital_write)
        .method(digital_read_a, digital_read)
        .property(pin_mode_a, Value::Obj(pin_mode))
        .property(trigger_a, Value::Obj(trigger))
        .build();
}

fn enum_object(eu: &mut ExecutionUnit, entries: &[(&str, i32)]) -> core_types::ObjectId {
    let names: Vec<(Atom, i32)> = {
        let atoms = eu.atoms();
        let mut atoms = atoms.borrow_mut();
        entries.iter().map(|(n, v)| (atoms.intern(n), *v)).collect()
    };
    let heap = eu.heap();
    let mut heap = heap.borrow_mut();
    let mut o = Object::mater();
    o.set_collectable(false);
    for (name, value) in names {
        o.set_property(name, Value::Integer(value));
    }
    heap.create_object(o)
}

fn set_pin_mode(eu: &mut ExecutionUnit, _this: Value, nparams: u32) -> CallResult {
    let pin = eu.to_int_value(eu.native_arg(nparams, 0))? as u8;
    let mode = eu.to_int_value(eu.native_arg(nparams, 1))? as u8;
    eu.gpio().borrow_mut().set_pin_mode(pin, mode);
    Ok(CallReturn::Count(0))
}

fn digital_write(eu: &mut ExecutionUnit, _this: Value, nparams: u32) -> CallResult {
    let pin = eu.to_int_value(eu.native_arg(nparams, 0))? as u8;
    let level = eu.truthy(eu.native_arg(nparams, 1));
    eu.gpio().borrow_mut().digital_write(pin, level);
    Ok(CallReturn::Count(0))
}

fn digital_read(eu: &mut ExecutionUnit, _this: Value, nparams: u32) -> CallResult {
    let pin = eu.to_int_value(eu.native_arg(nparams, 0))? as u8;
    let level = eu.gpio().borrow_mut().digital_read(pin);
    eu.push(Value::Bool(level));
    Ok(CallReturn::Count(1))
}
