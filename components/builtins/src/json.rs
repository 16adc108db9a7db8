//! The JSON builtin, backed by serde_json.

use core_types::{CallResult, CallReturn, Error, Value, WellKnown};
use interpreter::host::ProtoBuilder;
use interpreter::ExecutionUnit;
use memory_manager::Object;

const MAX_DEPTH: u32 = 64;

/// Installs the `JSON` object.
pub fn install(eu: &mut ExecutionUnit) {
    let atoms = eu.atoms();
    let parse_a = atoms.borrow_mut().intern("parse");
    let stringify_a = atoms.borrow_mut().intern("stringify");
    ProtoBuilder::new(eu, WellKnown::Json.into())
        .method(parse_a, parse)
        .method(stringify_a, stringify)
        .build();
}

fn parse(eu: &mut ExecutionUnit, _this: Value, nparams: u32) -> CallResult {
    let text = eu.to_string_value(eu.native_arg(nparams, 0));
    let json: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| Error::SyntaxError(format!("JSON parse error: {}", e)))?;
    let value = json_to_value(eu, &json);
    eu.push(value);
    Ok(CallReturn::Count(1))
}

fn stringify(eu: &mut ExecutionUnit, _this: Value, nparams: u32) -> CallResult {
    let value = eu.native_arg(nparams, 0);
    let json = value_to_json(eu, value, 0)?;
    let text = serde_json::to_string(&json).unwrap_or_else(|_| "null".to_string());
    let id = eu.heap().borrow_mut().create_string(&text);
    eu.push(Value::Str(id));
    Ok(CallReturn::Count(1))
}

/// serde_json tree to script values, allocating objects in the heap.
fn json_to_value(eu: &mut ExecutionUnit, json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                if i >= i32::MIN as i64 && i <= i32::MAX as i64 {
                    Value::Integer(i as i32)
                } else {
                    Value::Float(i as f64)
                }
            } else {
                Value::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => {
            let id = eu.heap().borrow_mut().create_string(s);
            Value::Str(id)
        }
        serde_json::Value::Array(items) => {
            let values: Vec<Value> = items.iter().map(|v| json_to_value(eu, v)).collect();
            let heap = eu.heap();
            let mut heap = heap.borrow_mut();
            let mut array = Object::array();
            for v in values {
                array.append_element(v);
            }
            Value::Obj(heap.create_object(array))
        }
        serde_json::Value::Object(entries) => {
            let props: Vec<(String, Value)> = entries
                .iter()
                .map(|(k, v)| (k.clone(), json_to_value(eu, v)))
                .collect();
            let mut object = Object::mater();
            for (key, v) in props {
                let atom = eu.atoms().borrow_mut().intern(&key);
                object.set_property(atom, v);
            }
            Value::Obj(eu.heap().borrow_mut().create_object(object))
        }
    }
}

/// Script values to a serde_json tree. Depth-limited so cyclic object
/// graphs fail instead of recursing forever.
fn value_to_json(
    eu: &ExecutionUnit,
    value: Value,
    depth: u32,
) -> Result<serde_json::Value, Error> {
    if depth > MAX_DEPTH {
        return Err(Error::OutOfRange);
    }
    Ok(match value {
        Value::Undefined | Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(b),
        Value::Integer(n) => serde_json::Value::from(n),
        Value::Float(n) => serde_json::Value::from(n),
        Value::Str(id) => serde_json::Value::String(eu.heap().borrow().string(id).to_string()),
        Value::Obj(id) => {
            let (is_array, elements, props) = {
                let heap = eu.heap();
                let heap = heap.borrow();
                match heap.object(id) {
                    Some(o) => (
                        o.is_array(),
                        o.elements().to_vec(),
                        o.properties().to_vec(),
                    ),
                    None => return Ok(serde_json::Value::Null),
                }
            };
            if is_array {
                let mut items = Vec::with_capacity(elements.len());
                for e in elements {
                    items.push(value_to_json(eu, e, depth + 1)?);
                }
                serde_json::Value::Array(items)
            } else {
                let mut map = serde_json::Map::new();
                for (atom, v) in props {
                    let key = eu.atoms().borrow().resolve(atom).to_string();
                    map.insert(key, value_to_json(eu, v, depth + 1)?);
                }
                serde_json::Value::Object(map)
            }
        }
        Value::Id(_) | Value::ElemRef(..) => serde_json::Value::Null,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytecode_system::{Function, Program};
    use core_types::AtomTable;
    use memory_manager::Heap;
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
        ExecutionUnit::new(Program::new(main), heap, atoms)
    }

    #[test]
    fn test_parse_then_stringify() {
        let mut eu = unit();
        let source = r#"{"a":1,"b":[true,null,"x"],"c":2.5}"#;
        let json: serde_json::Value = serde_json::from_str(source).unwrap();
        let value = json_to_value(&mut eu, &json);
        let back = value_to_json(&eu, value, 0).unwrap();
        assert_eq!(back, json);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let mut eu = unit();
        let id = {
            let heap = eu.heap();
            let mut h = heap.borrow_mut();
            h.create_object(Object::mater())
        };
        let self_a = eu.atoms().borrow_mut().intern("self");
        eu.heap().borrow_mut().object_mut(id).unwrap().set_property(self_a, Value::Obj(id));
        let err = value_to_json(&eu, Value::Obj(id), 0).unwrap_err();
        assert_eq!(err, Error::OutOfRange);
    }
}
