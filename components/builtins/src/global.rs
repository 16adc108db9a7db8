//! Global functions: time, output, conversions, import, events, memory.

use core_types::{CallResult, CallReturn, Duration, Error, Time, Value, WellKnown};
use interpreter::host::register_global_function;
use interpreter::ExecutionUnit;
use memory_manager::Object;

/// Installs the free-function globals.
pub fn install(eu: &mut ExecutionUnit) {
    register_global_function(eu, WellKnown::CurrentTime.into(), current_time);
    register_global_function(eu, WellKnown::Delay.into(), delay);
    register_global_function(eu, WellKnown::Print.into(), print);
    register_global_function(eu, WellKnown::Println.into(), println);
    register_global_function(eu, WellKnown::Printf.into(), printf);
    register_global_function(eu, WellKnown::ToInt.into(), to_int);
    register_global_function(eu, WellKnown::ToUInt.into(), to_uint);
    register_global_function(eu, WellKnown::ToFloat.into(), to_float);
    register_global_function(eu, WellKnown::Arguments.into(), arguments);
    register_global_function(eu, WellKnown::Import.into(), import);
    register_global_function(eu, WellKnown::ImportString.into(), import_string);
    register_global_function(eu, WellKnown::WaitForEvent.into(), wait_for_event);
    register_global_function(eu, WellKnown::Meminfo.into(), meminfo);
}

fn current_time(eu: &mut ExecutionUnit, _this: Value, _nparams: u32) -> CallResult {
    eu.push(Value::Float(Time::now().as_seconds()));
    Ok(CallReturn::Count(1))
}

fn delay(eu: &mut ExecutionUnit, _this: Value, nparams: u32) -> CallResult {
    let ms = eu.to_int_value(eu.native_arg(nparams, 0))?;
    Ok(CallReturn::MsDelay(Duration::from_millis(ms.max(0) as u64)))
}

fn print(eu: &mut ExecutionUnit, _this: Value, nparams: u32) -> CallResult {
    for i in 0..nparams {
        let s = eu.to_string_value(eu.native_arg(nparams, i));
        eu.print(&s);
    }
    Ok(CallReturn::Count(0))
}

fn println(eu: &mut ExecutionUnit, _this: Value, nparams: u32) -> CallResult {
    for i in 0..nparams {
        let s = eu.to_string_value(eu.native_arg(nparams, i));
        eu.print(&s);
    }
    eu.print("\n");
    Ok(CallReturn::Count(0))
}

fn printf(eu: &mut ExecutionUnit, _this: Value, nparams: u32) -> CallResult {
    if nparams < 1 {
        return Err(Error::BadFormatString);
    }
    let fmt = eu.to_string_value(eu.native_arg(nparams, 0));
    let args: Vec<Value> = (1..nparams).map(|i| eu.native_arg(nparams, i)).collect();
    let text = format_values(eu, &fmt, &args)?;
    eu.print(&text);
    Ok(CallReturn::Count(0))
}

/// printf-style formatting over script values.
pub fn format_values(eu: &ExecutionUnit, fmt: &str, args: &[Value]) -> Result<String, Error> {
    let mut out = String::with_capacity(fmt.len());
    let mut chars = fmt.chars();
    let mut next = 0usize;
    let mut take = |next: &mut usize| -> Result<Value, Error> {
        let v = args.get(*next).copied().ok_or(Error::BadFormatString)?;
        *next += 1;
        Ok(v)
    };
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some('d') | Some('i') => {
                let v = take(&mut next)?;
                out.push_str(&eu.to_int_value(v)?.to_string());
            }
            Some('u') => {
                let v = take(&mut next)?;
                out.push_str(&(eu.to_int_value(v)? as u32).to_string());
            }
            Some('x') => {
                let v = take(&mut next)?;
                out.push_str(&format!("{:x}", eu.to_int_value(v)? as u32));
            }
            Some('X') => {
                let v = take(&mut next)?;
                out.push_str(&format!("{:X}", eu.to_int_value(v)? as u32));
            }
            Some('s') => {
                let v = take(&mut next)?;
                out.push_str(&eu.to_string_value(v));
            }
            Some('f') | Some('g') => {
                let v = take(&mut next)?;
                out.push_str(&eu.to_float_value(v)?.to_string());
            }
            Some('c') => {
                let v = take(&mut next)?;
                let code = eu.to_int_value(v)?;
                match char::from_u32(code as u32) {
                    Some(ch) => out.push(ch),
                    None => return Err(Error::BadFormatString),
                }
            }
            _ => return Err(Error::BadFormatString),
        }
    }
    Ok(out)
}

/// Numeric parsing behind `toInt`/`toUInt`/`toFloat`: `allow_ws` permits
/// surrounding whitespace, otherwise any padding fails the conversion.
fn prepared<'s>(s: &'s str, allow_ws: bool) -> Result<&'s str, Error> {
    let trimmed = s.trim();
    if !allow_ws && trimmed.len() != s.len() {
        return Err(Error::CannotConvertStringToNumber);
    }
    Ok(trimmed)
}

fn conversion_args(eu: &ExecutionUnit, nparams: u32) -> Result<(String, bool), Error> {
    let s = eu.to_string_value(eu.native_arg(nparams, 0));
    let allow_ws = if nparams > 1 {
        eu.to_int_value(eu.native_arg(nparams, 1))? != 0
    } else {
        true
    };
    Ok((s, allow_ws))
}

fn to_int(eu: &mut ExecutionUnit, _this: Value, nparams: u32) -> CallResult {
    if nparams < 1 {
        return Ok(CallReturn::Count(0));
    }
    let (s, allow_ws) = conversion_args(eu, nparams)?;
    let n: i32 = prepared(&s, allow_ws)?
        .parse()
        .map_err(|_| Error::CannotConvertStringToNumber)?;
    eu.push(Value::Integer(n));
    Ok(CallReturn::Count(1))
}

fn to_uint(eu: &mut ExecutionUnit, _this: Value, nparams: u32) -> CallResult {
    if nparams < 1 {
        return Ok(CallReturn::Count(0));
    }
    let (s, allow_ws) = conversion_args(eu, nparams)?;
    let n: u32 = prepared(&s, allow_ws)?
        .parse()
        .map_err(|_| Error::CannotConvertStringToNumber)?;
    eu.push(Value::Integer(n as i32));
    Ok(CallReturn::Count(1))
}

fn to_float(eu: &mut ExecutionUnit, _this: Value, nparams: u32) -> CallResult {
    if nparams < 1 {
        return Ok(CallReturn::Count(0));
    }
    let (s, allow_ws) = conversion_args(eu, nparams)?;
    let n: f64 = prepared(&s, allow_ws)?
        .parse()
        .map_err(|_| Error::CannotConvertStringToNumber)?;
    eu.push(Value::Float(n));
    Ok(CallReturn::Count(1))
}

fn arguments(eu: &mut ExecutionUnit, _this: Value, _nparams: u32) -> CallResult {
    let args = eu.frame_args();
    let mut array = Object::array();
    for a in &args {
        array.append_element(*a);
    }
    let id = eu.heap().borrow_mut().create_object(array);
    if !eu.heap().borrow().is_valid_object(id) {
        return Err(Error::CannotCreateArgumentsArray);
    }
    eu.push(Value::Obj(id));
    Ok(CallReturn::Count(1))
}

fn import(eu: &mut ExecutionUnit, this: Value, nparams: u32) -> CallResult {
    if nparams < 1 {
        return Ok(CallReturn::Count(0));
    }
    let path = eu.to_string_value(eu.native_arg(nparams, 0));
    let source = std::fs::read_to_string(&path)
        .map_err(|e| Error::SyntaxError(format!("cannot open {}: {}", path, e)))?;
    import_source(eu, this, &source)
}

fn import_string(eu: &mut ExecutionUnit, this: Value, nparams: u32) -> CallResult {
    if nparams < 1 {
        return Ok(CallReturn::Count(0));
    }
    let source = eu.to_string_value(eu.native_arg(nparams, 0));
    import_source(eu, this, &source)
}

/// Compiles a secondary source into the current namespace and runs its
/// top-level function; global bindings it makes merge into the task's
/// program.
fn import_source(eu: &mut ExecutionUnit, this: Value, source: &str) -> CallResult {
    let main = {
        let heap_rc = eu.heap();
        let atoms_rc = eu.atoms();
        let mut heap = heap_rc.borrow_mut();
        let mut atoms = atoms_rc.borrow_mut();
        let program = parser::parse_program(source, &mut heap, &mut atoms)
            .map_err(|e| e.kind)?;
        program.main
    };
    let (_, value) = eu.call_value(Value::Obj(main), this, &[])?;
    eu.push(value);
    Ok(CallReturn::Count(1))
}

fn wait_for_event(_eu: &mut ExecutionUnit, _this: Value, _nparams: u32) -> CallResult {
    Ok(CallReturn::WaitForEvent)
}

fn meminfo(eu: &mut ExecutionUnit, _this: Value, _nparams: u32) -> CallResult {
    let info = eu.heap().borrow().memory_info();
    let atoms = eu.atoms();
    let mut intern = |name: &str| atoms.borrow_mut().intern(name);
    let free_size = intern("freeSize");
    let allocated_size = intern("allocatedSize");
    let num_allocations = intern("numAllocations");
    let allocations_by_type = intern("allocationsByType");
    let type_a = intern("type");
    let count_a = intern("count");
    let size_a = intern("size");

    let heap_rc = eu.heap();
    let mut heap = heap_rc.borrow_mut();

    let mut by_type = Object::array();
    for category in &info.allocations_by_type {
        let name = heap.create_string(category.type_name);
        let mut row = Object::mater();
        row.set_property(type_a, Value::Str(name));
        row.set_property(count_a, Value::Integer(category.count as i32));
        row.set_property(size_a, Value::Integer(category.size as i32));
        let row_id = heap.create_object(row);
        by_type.append_element(Value::Obj(row_id));
    }
    let by_type_id = heap.create_object(by_type);

    let mut result = Object::mater();
    result.set_property(free_size, Value::Integer(info.free_size as i32));
    result.set_property(allocated_size, Value::Integer(info.allocated_size as i32));
    result.set_property(num_allocations, Value::Integer(info.num_allocations as i32));
    result.set_property(allocations_by_type, Value::Obj(by_type_id));
    let id = heap.create_object(result);
    drop(heap);

    eu.push(Value::Obj(id));
    Ok(CallReturn::Count(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytecode_system::Program;
    use core_types::AtomTable;
    use memory_manager::Heap;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn empty_unit() -> ExecutionUnit {
        let heap = Rc::new(RefCell::new(Heap::new()));
        let atoms = Rc::new(RefCell::new(AtomTable::new()));
        let main = {
            let mut h = heap.borrow_mut();
            let mut o = Object::function(bytecode_system::Function::default());
            o.set_collectable(false);
            h.create_object(o)
        };
        ExecutionUnit::new(Program::new(main), heap, atoms)
    }

    #[test]
    fn test_format_values_basic() {
        let eu = empty_unit();
        let s = format_values(
            &eu,
            "%d %s %x%%",
            &[Value::Integer(42), Value::Integer(7), Value::Integer(255)],
        )
        .unwrap();
        assert_eq!(s, "42 7 ff%");
    }

    #[test]
    fn test_format_values_missing_arg() {
        let eu = empty_unit();
        let err = format_values(&eu, "%d %d", &[Value::Integer(1)]).unwrap_err();
        assert_eq!(err, Error::BadFormatString);
    }

    #[test]
    fn test_format_values_unknown_spec() {
        let eu = empty_unit();
        let err = format_values(&eu, "%q", &[Value::Integer(1)]).unwrap_err();
        assert_eq!(err, Error::BadFormatString);
    }

    #[test]
    fn test_prepared_whitespace_flag() {
        assert_eq!(prepared(" 42 ", true).unwrap(), "42");
        assert!(prepared(" 42 ", false).is_err());
        assert_eq!(prepared("42", false).unwrap(), "42");
    }
}
