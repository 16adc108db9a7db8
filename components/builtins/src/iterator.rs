//! The iterator protocol.
//!
//! Any object with `iterator`/`done`/`next` satisfies `for..in`. The
//! built-in iterator walks a collection's elements (array mode) or its
//! property values in insertion order; `next()` returns the current value
//! and advances.

use core_types::{Atom, CallResult, CallReturn, ObjectId, Value, WellKnown};
use interpreter::host::ProtoBuilder;
use interpreter::{ExecutionUnit, NativeFn};

/// Descriptor table for the Iterator prototype.
const METHODS: &[(WellKnown, NativeFn)] = &[(WellKnown::Done, done), (WellKnown::Next, next)];

/// Installs the `Iterator` prototype.
pub fn install(eu: &mut ExecutionUnit) {
    let mut builder = ProtoBuilder::new(eu, WellKnown::IteratorProto.into());
    for &(name, handler) in METHODS {
        builder = builder.method(name.into(), handler);
    }
    builder.build();
}

fn state_atoms(eu: &mut ExecutionUnit) -> (Atom, Atom) {
    let atoms = eu.atoms();
    let mut atoms = atoms.borrow_mut();
    (atoms.intern("%obj"), atoms.intern("%idx"))
}

/// Creates an iterator instance over `target` and pushes it; shared by
/// the Array and Object `iterator` methods.
pub fn make_iterator(eu: &mut ExecutionUnit, target: Value) -> CallResult {
    let (obj_a, idx_a) = state_atoms(eu);
    let proto = eu
        .global(WellKnown::IteratorProto.into())
        .and_then(|v| v.as_object())
        .unwrap_or(ObjectId::NULL);
    let inst = eu.construct_instance(proto);
    {
        let heap = eu.heap();
        let mut heap = heap.borrow_mut();
        if let Some(o) = heap.object_mut(inst) {
            o.set_property(obj_a, target);
            o.set_property(idx_a, Value::Integer(0));
        }
    }
    eu.push(Value::Obj(inst));
    Ok(CallReturn::Count(1))
}

/// The iterator's `(collection, cursor, length)`.
fn state(eu: &mut ExecutionUnit, this: Value) -> Option<(Value, i32, i32)> {
    let (obj_a, idx_a) = state_atoms(eu);
    let this_id = this.as_object()?;
    let heap = eu.heap();
    let heap = heap.borrow();
    let it = heap.object(this_id)?;
    let target = it.property(obj_a)?;
    let idx = match it.property(idx_a) {
        Some(Value::Integer(n)) => n,
        _ => 0,
    };
    let len = match target.as_object().and_then(|id| heap.object(id)) {
        Some(o) if o.is_array() => o.element_count() as i32,
        Some(o) => o.properties().len() as i32,
        None => 0,
    };
    Some((target, idx, len))
}

fn done(eu: &mut ExecutionUnit, this: Value, _nparams: u32) -> CallResult {
    let finished = match state(eu, this) {
        Some((_, idx, len)) => idx >= len,
        None => true,
    };
    eu.push(Value::Bool(finished));
    Ok(CallReturn::Count(1))
}

/// Returns the current value and advances the cursor.
fn next(eu: &mut ExecutionUnit, this: Value, _nparams: u32) -> CallResult {
    let (_, idx_a) = state_atoms(eu);
    let (value, idx) = match state(eu, this) {
        Some((target, idx, len)) => {
            let value = if idx < len {
                let heap = eu.heap();
                let heap = heap.borrow();
                match target.as_object().and_then(|id| heap.object(id)) {
                    Some(o) if o.is_array() => o.element(idx as usize).unwrap_or(Value::Undefined),
                    Some(o) => o
                        .properties()
                        .get(idx as usize)
                        .map(|(_, v)| *v)
                        .unwrap_or(Value::Undefined),
                    None => Value::Undefined,
                }
            } else {
                Value::Undefined
            };
            (value, idx)
        }
        None => (Value::Undefined, 0),
    };
    if let Some(this_id) = this.as_object() {
        let heap = eu.heap();
        let mut heap = heap.borrow_mut();
        if let Some(o) = heap.object_mut(this_id) {
            o.set_property(idx_a, Value::Integer(idx + 1));
        }
    }
    eu.push(value);
    Ok(CallReturn::Count(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytecode_system::{Function, Program};
    use core_types::AtomTable;
    use memory_manager::{Heap, Object};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn unit() -> ExecutionUnit {
        let heap = Rc::new(RefCell::new(Heap::new()));
        let atoms = Rc::new(RefCell::new(AtomTable::new()));
        let main = {
            let mut h = heap.borrow_mut();
            let mut o = Object::function(Function::default());
            o.set_collectable(false);
            h.create_object(o)
        };
        let mut eu = ExecutionUnit::new(Program::new(main), heap, atoms);
        install(&mut eu);
        eu
    }

    fn call_native(eu: &mut ExecutionUnit, f: NativeFn, this: Value) -> Value {
        f(eu, this, 0).unwrap();
        eu.pop_value()
    }

    #[test]
    fn test_iterator_visits_array_elements_in_order() {
        let mut eu = unit();
        let arr = {
            let heap = eu.heap();
            let mut h = heap.borrow_mut();
            let mut a = Object::array();
            for n in [3, 1, 4] {
                a.append_element(Value::Integer(n));
            }
            h.create_object(a)
        };

        make_iterator(&mut eu, Value::Obj(arr)).unwrap();
        let it = eu.pop_value();

        let mut seen = Vec::new();
        while !matches!(call_native(&mut eu, done, it), Value::Bool(true)) {
            seen.push(call_native(&mut eu, next, it));
        }
        assert_eq!(
            seen,
            vec![Value::Integer(3), Value::Integer(1), Value::Integer(4)]
        );
    }

    #[test]
    fn test_iterator_visits_property_values_in_insertion_order() {
        let mut eu = unit();
        let obj = {
            let heap = eu.heap();
            let mut h = heap.borrow_mut();
            let mut o = Object::mater();
            o.set_property(Atom(100), Value::Integer(10));
            o.set_property(Atom(101), Value::Integer(20));
            h.create_object(o)
        };

        make_iterator(&mut eu, Value::Obj(obj)).unwrap();
        let it = eu.pop_value();

        let mut seen = Vec::new();
        while !matches!(call_native(&mut eu, done, it), Value::Bool(true)) {
            seen.push(call_native(&mut eu, next, it));
        }
        assert_eq!(seen, vec![Value::Integer(10), Value::Integer(20)]);
    }

    #[test]
    fn test_done_on_empty_collection() {
        let mut eu = unit();
        let arr = {
            let heap = eu.heap();
            let mut h = heap.borrow_mut();
            h.create_object(Object::array())
        };
        make_iterator(&mut eu, Value::Obj(arr)).unwrap();
        let it = eu.pop_value();
        assert_eq!(call_native(&mut eu, done, it), Value::Bool(true));
    }
}
