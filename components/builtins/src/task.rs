//! The Task prototype: programmatic program loading and scheduling.
//!
//! `new Task(path)` compiles the file; `run()` asks the scheduler to
//! admit it as a task; `terminate()` requests cooperative termination by
//! token. Natives carry no state of their own, so the scheduler channels
//! ride on the execution unit.

use core_types::{Atom, CallResult, CallReturn, Error, Value, WellKnown};
use interpreter::host::ProtoBuilder;
use interpreter::ExecutionUnit;

fn state_atoms(eu: &mut ExecutionUnit) -> (Atom, Atom) {
    let atoms = eu.atoms();
    let mut atoms = atoms.borrow_mut();
    (atoms.intern("%fn"), atoms.intern("%token"))
}

/// Installs the `Task` prototype.
pub fn install(eu: &mut ExecutionUnit) {
    let atoms = eu.atoms();
    let run_a = atoms.borrow_mut().intern("run");
    let terminate_a = atoms.borrow_mut().intern("terminate");
    ProtoBuilder::new(eu, WellKnown::Task.into())
        .method(WellKnown::Constructor.into(), constructor)
        .method(run_a, run)
        .method(terminate_a, terminate)
        .build();
}

/// `new Task(path)`: compiles the source now; errors surface here, not at
/// `run()`.
fn constructor(eu: &mut ExecutionUnit, this: Value, nparams: u32) -> CallResult {
    if nparams < 1 {
        return Err(Error::WrongNumberOfParams);
    }
    let path = eu.to_string_value(eu.native_arg(nparams, 0));
    let source = std::fs::read_to_string(&path)
        .map_err(|e| Error::SyntaxError(format!("cannot open {}: {}", path, e)))?;
    let (fn_a, _) = state_atoms(eu);

    let main = {
        let heap_rc = eu.heap();
        let atoms_rc = eu.atoms();
        let mut heap = heap_rc.borrow_mut();
        let mut atoms = atoms_rc.borrow_mut();
        parser::parse_program(&source, &mut heap, &mut atoms)
            .map_err(|e| e.kind)?
            .main
    };
    if let Some(id) = this.as_object() {
        let heap = eu.heap();
        let mut heap = heap.borrow_mut();
        if let Some(o) = heap.object_mut(id) {
            o.set_property(fn_a, Value::Obj(main));
        }
    }
    Ok(CallReturn::Count(0))
}

fn run(eu: &mut ExecutionUnit, this: Value, _nparams: u32) -> CallResult {
    let (fn_a, token_a) = state_atoms(eu);
    let main = this
        .as_object()
        .and_then(|id| eu.heap().borrow().object(id).and_then(|o| o.property(fn_a)))
        .and_then(|v| v.as_object())
        .ok_or(Error::NotCallable)?;
    let token = eu.spawn_task(main);
    if let Some(id) = this.as_object() {
        let heap = eu.heap();
        let mut heap = heap.borrow_mut();
        if let Some(o) = heap.object_mut(id) {
            o.set_property(token_a, Value::Integer(token));
        }
    }
    Ok(CallReturn::Count(0))
}

fn terminate(eu: &mut ExecutionUnit, this: Value, _nparams: u32) -> CallResult {
    let (_, token_a) = state_atoms(eu);
    let token = this
        .as_object()
        .and_then(|id| eu.heap().borrow().object(id).and_then(|o| o.property(token_a)));
    if let Some(Value::Integer(token)) = token {
        eu.request_terminate(token);
    }
    Ok(CallReturn::Count(0))
}
