//! The execution unit: a stack machine over compiled programs.
//!
//! One shared value stack holds every frame's register window (locals,
//! parameters first) and operand area. Assignment targets are reference
//! values: a bare name (`Value::Id`) resolves against the globals, and a
//! slot reference (`Value::ElemRef`) resolves against an object — or,
//! when its target is the currently executing function, against the live
//! frame's local window. Every operand read resolves references; `Move`
//! writes through them.
//!
//! Suspension is explicit: natives return `MsDelay`/`WaitForEvent`, the
//! dispatch loop cleans the call area and unwinds to its entry point, and
//! the scheduler re-enters `execute()` when the condition is met.
//! Garbage collection and termination act only at safe points between
//! complete opcodes.

use crate::host::{
    ConsoleHandle, ConsoleWriter, EventRecord, GpioBackend, HostnameResolver, LoopbackSockets,
    SimulatedPins, SocketBackend, StdResolver, StdoutWriter,
};
use bytecode_system::{Function, Op, Program};
use core_types::{
    Atom, AtomTable, CallResult, CallReturn, Error, ObjectId, Value, WellKnown, PROPERTY_SPACE,
};
use memory_manager::{Heap, Object};
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

/// Signature of a native function: `(eu, this, nparams)`.
///
/// Arguments sit on the value stack; index them with
/// [`ExecutionUnit::native_arg`]. Return `Count(n)` after pushing `n`
/// values, or a suspension reason, or an error.
pub type NativeFn = fn(&mut ExecutionUnit, Value, u32) -> CallResult;

/// One activation.
struct Frame {
    /// Handle of the function object (local references resolve against it).
    func: ObjectId,
    /// Shared compiled body.
    code: Rc<Function>,
    /// Next instruction offset.
    pc: usize,
    /// Stack index of local slot 0.
    base: usize,
    /// The `this` binding.
    this: Value,
    /// Arguments as passed, for `arguments()`.
    args: Vec<Value>,
    /// True when this frame was entered through `NEW`; its return value
    /// is always the instance.
    construct: bool,
}

enum Callable {
    Script(ObjectId, Rc<Function>),
    Native(u32),
    None,
}

/// The virtual machine state bound to one task.
pub struct ExecutionUnit {
    heap: Rc<RefCell<Heap>>,
    atoms: Rc<RefCell<AtomTable>>,
    program: Program,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    natives: Vec<NativeFn>,
    builtin_globals: Vec<(Atom, Value)>,
    console: ConsoleHandle,
    resolver: Rc<dyn HostnameResolver>,
    gpio: Rc<RefCell<dyn GpioBackend>>,
    sockets: Rc<RefCell<dyn SocketBackend>>,
    events: Rc<RefCell<VecDeque<EventRecord>>>,
    listen_count: u32,
    pinned: Vec<Value>,
    execution_pins: Vec<Value>,
    terminated: Rc<Cell<bool>>,
    started: bool,
    last_trace: Option<String>,
    spawn_requests: Rc<RefCell<Vec<(i32, ObjectId)>>>,
    terminate_requests: Rc<RefCell<Vec<i32>>>,
    next_task_token: Rc<Cell<i32>>,
}

impl ExecutionUnit {
    /// Creates an execution unit for a program over shared stores.
    pub fn new(
        program: Program,
        heap: Rc<RefCell<Heap>>,
        atoms: Rc<RefCell<AtomTable>>,
    ) -> Self {
        ExecutionUnit {
            heap,
            atoms,
            program,
            stack: Vec::with_capacity(64),
            frames: Vec::with_capacity(8),
            natives: Vec::new(),
            builtin_globals: Vec::new(),
            console: Rc::new(RefCell::new(StdoutWriter)),
            resolver: Rc::new(StdResolver),
            gpio: Rc::new(RefCell::new(SimulatedPins::new())),
            sockets: Rc::new(RefCell::new(LoopbackSockets::new())),
            events: Rc::new(RefCell::new(VecDeque::new())),
            listen_count: 0,
            pinned: Vec::new(),
            execution_pins: Vec::new(),
            terminated: Rc::new(Cell::new(false)),
            started: false,
            last_trace: None,
            spawn_requests: Rc::new(RefCell::new(Vec::new())),
            terminate_requests: Rc::new(RefCell::new(Vec::new())),
            next_task_token: Rc::new(Cell::new(1)),
        }
    }

    /// Shares the host seams and task channels of another unit, so tasks
    /// spawned into the same runtime see one world.
    pub fn adopt_channels(&mut self, other: &ExecutionUnit) {
        self.console = Rc::clone(&other.console);
        self.resolver = Rc::clone(&other.resolver);
        self.gpio = Rc::clone(&other.gpio);
        self.sockets = Rc::clone(&other.sockets);
        self.spawn_requests = Rc::clone(&other.spawn_requests);
        self.terminate_requests = Rc::clone(&other.terminate_requests);
        self.next_task_token = Rc::clone(&other.next_task_token);
    }

    // ---- configuration ----

    /// Replaces the console sink.
    pub fn set_console(&mut self, console: ConsoleHandle) {
        self.console = console;
    }

    /// The console sink.
    pub fn console(&self) -> ConsoleHandle {
        Rc::clone(&self.console)
    }

    /// Replaces the hostname resolver.
    pub fn set_resolver(&mut self, resolver: Rc<dyn HostnameResolver>) {
        self.resolver = resolver;
    }

    /// The hostname resolver.
    pub fn resolver(&self) -> Rc<dyn HostnameResolver> {
        Rc::clone(&self.resolver)
    }

    /// The GPIO backend.
    pub fn gpio(&self) -> Rc<RefCell<dyn GpioBackend>> {
        Rc::clone(&self.gpio)
    }

    /// The socket backend.
    pub fn sockets(&self) -> Rc<RefCell<dyn SocketBackend>> {
        Rc::clone(&self.sockets)
    }

    /// The shared heap.
    pub fn heap(&self) -> Rc<RefCell<Heap>> {
        Rc::clone(&self.heap)
    }

    /// The shared atom table.
    pub fn atoms(&self) -> Rc<RefCell<AtomTable>> {
        Rc::clone(&self.atoms)
    }

    /// The bound program.
    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Mutable access to the bound program (global writes).
    pub fn program_mut(&mut self) -> &mut Program {
        &mut self.program
    }

    /// Shared flag the scheduler sets to request cooperative termination.
    pub fn terminate_handle(&self) -> Rc<Cell<bool>> {
        Rc::clone(&self.terminated)
    }

    /// Trace text captured by the most recent runtime error.
    pub fn take_last_trace(&mut self) -> Option<String> {
        self.last_trace.take()
    }

    // ---- native registry & globals ----

    /// Registers a native function, returning its registry slot.
    pub fn register_native(&mut self, f: NativeFn) -> u32 {
        self.natives.push(f);
        (self.natives.len() - 1) as u32
    }

    /// Registers a built-in global (prototype objects, global functions).
    pub fn register_global(&mut self, name: Atom, value: Value) {
        if let Some(slot) = self.builtin_globals.iter_mut().find(|(a, _)| *a == name) {
            slot.1 = value;
        } else {
            self.builtin_globals.push((name, value));
        }
    }

    /// Resolves a global: the program's table first, then the built-ins.
    pub fn global(&self, name: Atom) -> Option<Value> {
        self.program
            .global(name)
            .or_else(|| self.builtin_globals.iter().find(|(a, _)| *a == name).map(|(_, v)| *v))
    }

    // ---- events ----

    /// Queues an event, pinning its values until delivery.
    pub fn enqueue_event(&mut self, record: EventRecord) {
        {
            let mut heap = self.heap.borrow_mut();
            heap.add_static_value(record.func);
            heap.add_static_value(record.this);
            for &a in &record.args {
                heap.add_static_value(a);
            }
        }
        self.pinned.push(record.func);
        self.pinned.push(record.this);
        self.pinned.extend(record.args.iter().copied());
        self.events.borrow_mut().push_back(record);
    }

    /// Takes the next queued event, releasing its pins.
    pub fn take_event(&mut self) -> Option<EventRecord> {
        let record = self.events.borrow_mut().pop_front()?;
        let mut heap = self.heap.borrow_mut();
        for v in [record.func, record.this].iter().chain(record.args.iter()) {
            heap.remove_static_value(*v);
            if let Some(pos) = self.pinned.iter().position(|p| p == v) {
                self.pinned.remove(pos);
            }
        }
        drop(heap);
        Some(record)
    }

    /// True while events are queued.
    pub fn has_events(&self) -> bool {
        !self.events.borrow().is_empty()
    }

    /// Marks the task as expecting host events (an async operation is in
    /// flight).
    pub fn start_event_listening(&mut self) {
        self.listen_count += 1;
    }

    /// Ends one expectation started with
    /// [`ExecutionUnit::start_event_listening`].
    pub fn stop_event_listening(&mut self) {
        self.listen_count = self.listen_count.saturating_sub(1);
    }

    /// True while any async operation is outstanding.
    pub fn is_listening(&self) -> bool {
        self.listen_count > 0
    }

    // ---- task channels ----

    /// Requests that the scheduler admit a new task for `main`; returns a
    /// token usable with [`ExecutionUnit::request_terminate`].
    pub fn spawn_task(&mut self, main: ObjectId) -> i32 {
        let token = self.next_task_token.get();
        self.next_task_token.set(token + 1);
        self.spawn_requests.borrow_mut().push((token, main));
        token
    }

    /// Drains pending spawn requests (scheduler side).
    pub fn take_spawn_requests(&mut self) -> Vec<(i32, ObjectId)> {
        std::mem::take(&mut *self.spawn_requests.borrow_mut())
    }

    /// Requests termination of a spawned task by token.
    pub fn request_terminate(&mut self, token: i32) {
        self.terminate_requests.borrow_mut().push(token);
    }

    /// Drains pending termination requests (scheduler side).
    pub fn take_terminate_requests(&mut self) -> Vec<i32> {
        std::mem::take(&mut *self.terminate_requests.borrow_mut())
    }

    // ---- stack access for natives ----

    /// Pushes a value (natives push their return values).
    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    /// Pops a value (helpers that consume a native's pushed result).
    pub fn pop_value(&mut self) -> Value {
        self.stack.pop().unwrap_or(Value::Undefined)
    }

    /// Argument `index` of a native call with `nparams` arguments.
    pub fn native_arg(&self, nparams: u32, index: u32) -> Value {
        let len = self.stack.len();
        let at = len - nparams as usize + index as usize;
        self.stack.get(at).copied().unwrap_or(Value::Undefined)
    }

    /// Current operand stack depth (tests and diagnostics).
    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    /// Argument count of the innermost script frame, for `arguments()`.
    pub fn frame_args(&self) -> Vec<Value> {
        self.frames.last().map(|f| f.args.clone()).unwrap_or_default()
    }

    // ---- execution ----

    /// Runs or resumes the bound program.
    ///
    /// Returns `Finished` on completion, a suspension reason to hand the
    /// scheduler, `Terminated` when the termination flag was observed, or
    /// an error after unwinding all frames.
    pub fn execute(&mut self) -> CallResult {
        if !self.started {
            self.started = true;
            let main = self.program.main;
            let func = self
                .heap
                .borrow()
                .object(main)
                .and_then(|o| o.as_function_rc())
                .ok_or(Error::NotCallable)?;
            self.push_frame(main, func, Value::Undefined, Vec::new(), false);
        }
        let result = self.run(0);
        if matches!(result, Ok(CallReturn::Finished)) {
            self.stack.clear();
        }
        result
    }

    /// Calls a script or native value to completion (or suspension),
    /// returning the reason and the result value.
    pub fn call_value(
        &mut self,
        callable: Value,
        this: Value,
        args: &[Value],
    ) -> Result<(CallReturn, Value), Error> {
        let callee = self.resolve(callable)?;
        match self.callable_of(callee) {
            Callable::Script(fid, func) => {
                let depth = self.frames.len();
                self.push_frame(fid, func, this, args.to_vec(), false);
                match self.run(depth)? {
                    CallReturn::Finished => {
                        let value = self.stack.pop().unwrap_or(Value::Undefined);
                        Ok((CallReturn::Finished, value))
                    }
                    reason => Ok((reason, Value::Undefined)),
                }
            }
            Callable::Native(idx) => {
                for &a in args {
                    self.stack.push(a);
                }
                let f = self.natives[idx as usize];
                let result = f(self, this, args.len() as u32);
                match result {
                    Ok(CallReturn::Count(n)) => {
                        let mut rets = Vec::new();
                        for _ in 0..n {
                            rets.push(self.stack.pop().unwrap_or(Value::Undefined));
                        }
                        rets.reverse();
                        self.stack.truncate(self.stack.len() - args.len());
                        let value = rets.first().copied().unwrap_or(Value::Undefined);
                        Ok((CallReturn::Count(n), value))
                    }
                    Ok(reason) => {
                        self.stack.truncate(self.stack.len() - args.len());
                        Ok((reason, Value::Undefined))
                    }
                    Err(e) => Err(e),
                }
            }
            Callable::None => Err(Error::NotCallable),
        }
    }

    /// Delivers an event by calling `func` on this unit's stack.
    pub fn fire_event(&mut self, func: Value, this: Value, args: &[Value]) -> CallResult {
        let (reason, _) = self.call_value(func, this, args)?;
        Ok(reason)
    }

    fn run(&mut self, depth: usize) -> CallResult {
        loop {
            if self.frames.len() <= depth {
                return Ok(CallReturn::Finished);
            }
            if self.terminated.get() {
                self.release_task_roots();
                self.frames.clear();
                self.stack.clear();
                return Ok(CallReturn::Terminated);
            }
            match self.step() {
                Ok(None) => {}
                Ok(Some(reason)) => return Ok(reason),
                Err(e) => {
                    self.last_trace = Some(self.format_trace(&e));
                    self.frames.truncate(depth);
                    if depth == 0 {
                        self.stack.clear();
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Unpins everything this task pinned; part of cooperative
    /// termination so its closures become collectable.
    fn release_task_roots(&mut self) {
        self.unpin_execution_roots();
        let mut heap = self.heap.borrow_mut();
        for v in self.pinned.drain(..) {
            heap.remove_static_value(v);
        }
        self.events.borrow_mut().clear();
        self.listen_count = 0;
    }

    /// Pins this unit's live execution state (stack, frames, globals)
    /// into the heap's static root set.
    ///
    /// Tasks share one heap; a collection triggered inside another task's
    /// quantum cannot see this unit's suspended stack, so the scheduler
    /// pins a suspended task's roots and unpins them before resuming it.
    pub fn pin_execution_roots(&mut self) {
        self.unpin_execution_roots();
        let roots = self.gather_roots();
        let mut heap = self.heap.borrow_mut();
        for v in &roots {
            heap.add_static_value(*v);
        }
        drop(heap);
        self.execution_pins = roots;
    }

    /// Releases the pins taken by [`ExecutionUnit::pin_execution_roots`].
    pub fn unpin_execution_roots(&mut self) {
        let mut heap = self.heap.borrow_mut();
        for v in self.execution_pins.drain(..) {
            heap.remove_static_value(v);
        }
    }

    fn read_u8(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("no active frame");
        let b = frame.code.code.get(frame.pc).copied().unwrap_or(0);
        frame.pc += 1;
        b
    }

    fn read_u16(&mut self) -> u16 {
        let lo = self.read_u8();
        let hi = self.read_u8();
        u16::from_le_bytes([lo, hi])
    }

    fn read_i16(&mut self) -> i16 {
        self.read_u16() as i16
    }

    fn jump(&mut self, offset: i16) {
        let frame = self.frames.last_mut().expect("no active frame");
        frame.pc = (frame.pc as i64 + offset as i64) as usize;
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or(Value::Undefined)
    }

    fn pop_resolved(&mut self) -> Result<Value, Error> {
        let v = self.pop();
        self.resolve(v)
    }

    /// Executes one opcode. `Ok(Some(reason))` suspends.
    fn step(&mut self) -> Result<Option<CallReturn>, Error> {
        let frame = self.frames.last_mut().expect("no active frame");
        if frame.pc >= frame.code.code.len() {
            // Defensive: well-formed code always ends in Ret.
            return self.do_return(0).map(|_| None);
        }
        let byte = frame.code.code[frame.pc];
        frame.pc += 1;
        let op = Op::from_byte(byte).ok_or(Error::OutOfRange)?;

        match op {
            Op::PushK => {
                let idx = self.read_u8() as usize;
                let frame = self.frames.last().expect("no active frame");
                let v = frame.code.constants.get(idx).copied().ok_or(Error::OutOfRange)?;
                self.stack.push(v);
            }
            Op::PushId => {
                let raw = self.read_u16();
                self.stack.push(Value::Id(Atom(raw)));
            }
            Op::PushThis => {
                let this = self.frames.last().expect("no active frame").this;
                self.stack.push(this);
            }
            Op::PushLocalRef => {
                let slot = self.read_u8() as u16;
                let func = self.frames.last().expect("no active frame").func;
                self.stack.push(Value::ElemRef(func, slot));
            }
            Op::Push => {
                let v = self.pop_resolved()?;
                self.stack.push(v);
            }
            Op::Dup => {
                let v = *self.stack.last().unwrap_or(&Value::Undefined);
                self.stack.push(v);
            }
            Op::Pop => {
                let _ = self.pop();
            }
            Op::Move => {
                let src = self.pop_resolved()?;
                let dst = self.pop();
                self.write_ref(dst, src)?;
                self.stack.push(src);
            }

            Op::Add
            | Op::Sub
            | Op::Mul
            | Op::Div
            | Op::Mod
            | Op::Shl
            | Op::Sar
            | Op::Shr
            | Op::And
            | Op::Or
            | Op::Xor
            | Op::LAnd
            | Op::LOr
            | Op::Eq
            | Op::Ne
            | Op::Lt
            | Op::Le
            | Op::Gt
            | Op::Ge => {
                let b = self.pop_resolved()?;
                let a = self.pop_resolved()?;
                let r = self.binary_op(op, a, b)?;
                self.stack.push(r);
            }

            Op::UMinus => {
                let v = self.pop_resolved()?;
                let r = match self.to_number_value(v)? {
                    Value::Integer(n) => Value::Integer(n.wrapping_neg()),
                    Value::Float(n) => Value::Float(-n),
                    other => other,
                };
                self.stack.push(r);
            }
            Op::UNot => {
                let v = self.pop_resolved()?;
                let n = self.to_int_value(v)?;
                self.stack.push(Value::Integer(!n));
            }
            Op::UNeg => {
                let v = self.pop_resolved()?;
                let t = self.truthy(v);
                self.stack.push(Value::Bool(!t));
            }
            Op::PreInc | Op::PreDec | Op::PostInc | Op::PostDec => {
                let target = self.pop();
                let old = self.resolve(target)?;
                let old_num = self.to_number_value(old)?;
                let delta = if matches!(op, Op::PreInc | Op::PostInc) { 1 } else { -1 };
                let new = match old_num {
                    Value::Integer(n) => Value::Integer(n.wrapping_add(delta)),
                    Value::Float(n) => Value::Float(n + delta as f64),
                    other => other,
                };
                self.write_ref(target, new)?;
                let result = if matches!(op, Op::PreInc | Op::PreDec) { new } else { old_num };
                self.stack.push(result);
            }

            Op::Jmp => {
                let off = self.read_i16();
                self.jump(off);
            }
            Op::Jt | Op::Jf => {
                let off = self.read_i16();
                let v = self.pop_resolved()?;
                let cond = self.truthy(v);
                if cond == (op == Op::Jt) {
                    self.jump(off);
                }
            }

            Op::Call => {
                let argc = self.read_u8() as u32;
                let suspended = self.do_call(argc, false)?;
                self.maybe_collect();
                return Ok(suspended);
            }
            Op::New => {
                let argc = self.read_u8() as u32;
                let suspended = self.do_call(argc, true)?;
                self.maybe_collect();
                return Ok(suspended);
            }
            Op::Ret => {
                let retc = self.read_u8() as u32;
                self.do_return(retc)?;
                self.maybe_collect();
            }

            Op::DerefProp => {
                let name = self.pop();
                let obj_v = self.pop_resolved()?;
                let obj = obj_v.as_object().ok_or(Error::PropertyDoesNotExist)?;
                let atom = self.atomize_value(name)?;
                let slot = self.property_slot_for(obj, atom);
                self.stack.push(Value::ElemRef(obj, slot | PROPERTY_SPACE));
            }
            Op::DerefElt => {
                let idx_v = self.pop_resolved()?;
                let obj_v = self.pop_resolved()?;
                let obj = obj_v.as_object().ok_or(Error::PropertyDoesNotExist)?;
                let idx = self.to_int_value(idx_v)?;
                if !(0..PROPERTY_SPACE as i32).contains(&idx) {
                    return Err(Error::OutOfRange);
                }
                self.stack.push(Value::ElemRef(obj, idx as u16));
            }
            Op::AppendElt => {
                let v = self.pop();
                let target = *self.stack.last().unwrap_or(&Value::Undefined);
                if let Some(obj) = target.as_object() {
                    let mut heap = self.heap.borrow_mut();
                    if let Some(o) = heap.object_mut(obj) {
                        o.append_element(v);
                    }
                }
            }
            Op::AppendProp => {
                let v = self.pop();
                let name = self.pop();
                let atom = self.atomize_value(name)?;
                let target = *self.stack.last().unwrap_or(&Value::Undefined);
                if let Some(obj) = target.as_object() {
                    let mut heap = self.heap.borrow_mut();
                    if let Some(o) = heap.object_mut(obj) {
                        o.set_property(atom, v);
                    }
                }
            }
            Op::LoadLit => {
                let array = self.read_u8() != 0;
                let object = if array { Object::array() } else { Object::mater() };
                let id = self.heap.borrow_mut().create_object(object);
                self.stack.push(Value::Obj(id));
            }
            Op::CaseTest => {
                let case = self.pop_resolved()?;
                let disc_raw = *self.stack.last().unwrap_or(&Value::Undefined);
                let disc = self.resolve(disc_raw)?;
                let matched = self.values_equal(disc, case);
                self.stack.push(Value::Bool(matched));
            }
        }
        Ok(None)
    }

    // ---- calls ----

    fn callable_of(&self, v: Value) -> Callable {
        let id = match v.as_object() {
            Some(id) => id,
            None => return Callable::None,
        };
        let heap = self.heap.borrow();
        match heap.object(id) {
            Some(o) => {
                if let Some(rc) = o.as_function_rc() {
                    Callable::Script(id, rc)
                } else if let Some(n) = o.as_native() {
                    Callable::Native(n)
                } else {
                    Callable::None
                }
            }
            None => Callable::None,
        }
    }

    fn is_local_target(&self, target: ObjectId) -> bool {
        self.frames.last().map(|f| f.func == target).unwrap_or(false)
    }

    fn pop_resolved_args(&mut self, argc: usize) -> Result<Vec<Value>, Error> {
        let mut args = Vec::with_capacity(argc);
        for _ in 0..argc {
            let v = self.pop_resolved()?;
            args.push(v);
        }
        args.reverse();
        Ok(args)
    }

    fn push_frame(
        &mut self,
        func: ObjectId,
        code: Rc<Function>,
        this: Value,
        args: Vec<Value>,
        construct: bool,
    ) {
        let base = self.stack.len();
        let nlocals = code.locals.len();
        for i in 0..nlocals {
            let v = if i < code.param_end {
                args.get(i).copied().unwrap_or(Value::Undefined)
            } else {
                Value::Undefined
            };
            self.stack.push(v);
        }
        self.frames.push(Frame { func, code, pc: 0, base, this, args, construct });
    }

    fn do_call(&mut self, argc: u32, construct: bool) -> Result<Option<CallReturn>, Error> {
        let argc_us = argc as usize;
        if self.stack.len() < argc_us + 1 {
            return Err(Error::OutOfRange);
        }
        let callee_raw = self.stack[self.stack.len() - argc_us - 1];
        let receiver = match callee_raw {
            Value::ElemRef(target, slot)
                if !(self.is_local_target(target) && slot & PROPERTY_SPACE == 0) =>
            {
                Value::Obj(target)
            }
            _ => Value::Undefined,
        };
        let callee = self.resolve(callee_raw)?;

        if construct {
            return self.do_new(callee, argc);
        }

        match self.callable_of(callee) {
            Callable::Script(fid, func) => {
                let args = self.pop_resolved_args(argc_us)?;
                let _ = self.pop();
                self.push_frame(fid, func, receiver, args, false);
                Ok(None)
            }
            Callable::Native(idx) => {
                let f = self.natives[idx as usize];
                match f(self, receiver, argc) {
                    Ok(CallReturn::Count(n)) => {
                        self.finish_native_call(argc_us, n, None);
                        Ok(None)
                    }
                    Ok(reason @ (CallReturn::MsDelay(_) | CallReturn::WaitForEvent)) => {
                        self.finish_native_call(argc_us, 0, None);
                        Ok(Some(reason))
                    }
                    Ok(_) => {
                        self.finish_native_call(argc_us, 0, None);
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            }
            Callable::None => {
                if callee == Value::Undefined && matches!(callee_raw, Value::ElemRef(..)) {
                    Err(Error::PropertyDoesNotExist)
                } else {
                    Err(Error::NotCallable)
                }
            }
        }
    }

    /// Constructs an instance: copy the callee's own properties, then run
    /// its constructor with `this` bound. The instance is always the
    /// result.
    fn do_new(&mut self, callee: Value, argc: u32) -> Result<Option<CallReturn>, Error> {
        let argc_us = argc as usize;
        let class = callee.as_object().ok_or(Error::NotCallable)?;

        let (has_code, instance) = {
            let mut heap = self.heap.borrow_mut();
            let (props, has_code, is_array) = match heap.object(class) {
                Some(o) => (o.properties().to_vec(), o.has_code(), o.is_array()),
                None => return Err(Error::NotCallable),
            };
            let mut inst = Object::mater();
            inst.set_array(is_array);
            if !has_code {
                for (a, v) in props {
                    inst.set_property(a, v);
                }
            }
            (has_code, heap.create_object(inst))
        };

        let ctor = if has_code {
            Some(callee)
        } else {
            let heap = self.heap.borrow();
            heap.object(instance)
                .and_then(|o| o.property(WellKnown::Constructor.into()))
        };

        match ctor.map(|c| self.callable_of(c)).unwrap_or(Callable::None) {
            Callable::Script(fid, func) => {
                let args = self.pop_resolved_args(argc_us)?;
                let _ = self.pop();
                self.push_frame(fid, func, Value::Obj(instance), args, true);
                Ok(None)
            }
            Callable::Native(idx) => {
                let f = self.natives[idx as usize];
                match f(self, Value::Obj(instance), argc) {
                    Ok(CallReturn::Count(n)) => {
                        self.finish_native_call(argc_us, n, Some(Value::Obj(instance)));
                        Ok(None)
                    }
                    Ok(_) => {
                        self.finish_native_call(argc_us, 0, Some(Value::Obj(instance)));
                        Ok(None)
                    }
                    Err(e) => Err(e),
                }
            }
            Callable::None => {
                self.stack.truncate(self.stack.len() - argc_us - 1);
                self.stack.push(Value::Obj(instance));
                Ok(None)
            }
        }
    }

    /// Normalizes the stack after a native call: drop its return values,
    /// the arguments and the callee, then push the single result.
    fn finish_native_call(&mut self, argc: usize, rets: u32, result_override: Option<Value>) {
        let mut rets_v = Vec::new();
        for _ in 0..rets {
            rets_v.push(self.pop());
        }
        rets_v.reverse();
        self.stack.truncate(self.stack.len() - argc - 1);
        let result = result_override
            .or_else(|| rets_v.first().copied())
            .unwrap_or(Value::Undefined);
        self.stack.push(result);
    }

    fn do_return(&mut self, retc: u32) -> Result<(), Error> {
        let explicit = if retc > 0 { Some(self.pop_resolved()?) } else { None };
        let frame = match self.frames.pop() {
            Some(f) => f,
            None => return Ok(()),
        };
        let result = if frame.construct {
            frame.this
        } else if let Some(v) = explicit {
            v
        } else if frame.code.is_ctor {
            // Ctor discipline: falling off the end yields `this`.
            frame.this
        } else {
            Value::Undefined
        };
        self.stack.truncate(frame.base);
        self.stack.push(result);
        Ok(())
    }

    // ---- references ----

    /// Resolves references to values: bare names through the globals,
    /// slot references through their object or the live local window.
    pub fn resolve(&mut self, v: Value) -> Result<Value, Error> {
        match v {
            Value::Id(atom) => Ok(self.global(atom).unwrap_or(Value::Undefined)),
            Value::ElemRef(target, slot) => {
                // Local references never carry the property-space bit;
                // a property reference to the executing function still
                // goes through the store.
                if self.is_local_target(target) && slot & PROPERTY_SPACE == 0 {
                    let base = self.frames.last().map(|f| f.base).unwrap_or(0);
                    Ok(self
                        .stack
                        .get(base + slot as usize)
                        .copied()
                        .unwrap_or(Value::Undefined))
                } else {
                    Ok(self
                        .heap
                        .borrow()
                        .read_slot(target, slot)
                        .unwrap_or(Value::Undefined))
                }
            }
            other => Ok(other),
        }
    }

    fn write_ref(&mut self, dst: Value, value: Value) -> Result<(), Error> {
        match dst {
            Value::Id(atom) => {
                self.program.set_global(atom, value);
                Ok(())
            }
            Value::ElemRef(target, slot) => {
                if self.is_local_target(target) && slot & PROPERTY_SPACE == 0 {
                    let base = self.frames.last().map(|f| f.base).unwrap_or(0);
                    let at = base + slot as usize;
                    if at < self.stack.len() {
                        self.stack[at] = value;
                    }
                } else {
                    self.heap.borrow_mut().write_slot(target, slot, value);
                }
                Ok(())
            }
            _ => Err(Error::SyntaxError("invalid assignment target".to_string())),
        }
    }

    /// Finds (or creates) the property slot for `obj.atom`, seeding
    /// built-in prototype methods into the instance on first use.
    fn property_slot_for(&mut self, obj: ObjectId, atom: Atom) -> u16 {
        {
            let heap = self.heap.borrow();
            if let Some(o) = heap.object(obj) {
                if let Some(slot) = o.property_slot(atom) {
                    return slot;
                }
            }
        }
        let proto_name: Atom = {
            let heap = self.heap.borrow();
            let is_array = heap.object(obj).map(|o| o.is_array()).unwrap_or(false);
            if is_array { WellKnown::Array.into() } else { WellKnown::Object.into() }
        };
        let seeded = self
            .global(proto_name)
            .and_then(|v| v.as_object())
            .and_then(|proto| self.heap.borrow().object(proto).and_then(|o| o.property(atom)));
        let mut heap = self.heap.borrow_mut();
        match heap.object_mut(obj) {
            Some(o) => {
                if let Some(v) = seeded {
                    o.set_property(atom, v);
                    o.property_slot(atom).unwrap_or(0)
                } else {
                    o.ensure_property_slot(atom)
                }
            }
            None => 0,
        }
    }

    // ---- conversions ----

    /// Truthiness of a resolved value.
    pub fn truthy(&self, v: Value) -> bool {
        match v {
            Value::Str(id) => !self.heap.borrow().string(id).is_empty(),
            other => other.scalar_truthy().unwrap_or(true),
        }
    }

    /// Numeric-first conversion keeping integer-ness.
    pub fn to_number_value(&self, v: Value) -> Result<Value, Error> {
        match v {
            Value::Integer(_) | Value::Float(_) => Ok(v),
            Value::Bool(b) => Ok(Value::Integer(b as i32)),
            Value::Null | Value::Undefined => Ok(Value::Integer(0)),
            Value::Str(id) => {
                let heap = self.heap.borrow();
                let s = heap.string(id).trim();
                if let Ok(n) = s.parse::<i32>() {
                    Ok(Value::Integer(n))
                } else if let Ok(n) = s.parse::<f64>() {
                    Ok(Value::Float(n))
                } else {
                    Err(Error::CannotConvertStringToNumber)
                }
            }
            _ => Err(Error::CannotConvertStringToNumber),
        }
    }

    /// Conversion to a 32-bit integer.
    pub fn to_int_value(&self, v: Value) -> Result<i32, Error> {
        match self.to_number_value(v)? {
            Value::Integer(n) => Ok(n),
            Value::Float(n) => Ok(n as i32),
            _ => Err(Error::CannotConvertStringToNumber),
        }
    }

    /// Conversion to a float.
    pub fn to_float_value(&self, v: Value) -> Result<f64, Error> {
        match self.to_number_value(v)? {
            Value::Integer(n) => Ok(n as f64),
            Value::Float(n) => Ok(n),
            _ => Err(Error::CannotConvertStringToNumber),
        }
    }

    /// Conversion to display text.
    pub fn to_string_value(&self, v: Value) -> String {
        match v {
            Value::Str(id) => self.heap.borrow().string(id).to_string(),
            Value::Obj(id) => {
                let heap = self.heap.borrow();
                match heap.object(id) {
                    Some(o) if o.is_array() => "[object Array]".to_string(),
                    Some(o) if o.has_code() => "[function]".to_string(),
                    Some(_) => "[object Object]".to_string(),
                    None => "[invalid object]".to_string(),
                }
            }
            other => other.to_string(),
        }
    }

    /// Converts a property-name value to an atom.
    pub fn atomize_value(&mut self, v: Value) -> Result<Atom, Error> {
        match v {
            Value::Id(a) => Ok(a),
            Value::Str(id) => {
                let s = self.heap.borrow().string(id).to_string();
                Ok(self.atoms.borrow_mut().intern(&s))
            }
            Value::Integer(n) => Ok(self.atoms.borrow_mut().intern(&n.to_string())),
            Value::Float(n) => Ok(self.atoms.borrow_mut().intern(&n.to_string())),
            _ => Err(Error::PropertyDoesNotExist),
        }
    }

    fn values_equal(&self, a: Value, b: Value) -> bool {
        match (a, b) {
            (Value::Str(x), Value::Str(y)) => {
                let heap = self.heap.borrow();
                heap.string(x) == heap.string(y)
            }
            (Value::Obj(x), Value::Obj(y)) => x == y,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            _ => match (a.as_number(), b.as_number()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }

    fn binary_op(&mut self, op: Op, a: Value, b: Value) -> Result<Value, Error> {
        match op {
            Op::Add => {
                if matches!(a, Value::Str(_)) || matches!(b, Value::Str(_)) {
                    let s = format!("{}{}", self.to_string_value(a), self.to_string_value(b));
                    let id = self.heap.borrow_mut().create_string(&s);
                    return Ok(Value::Str(id));
                }
                self.arith(op, a, b)
            }
            Op::Sub | Op::Mul | Op::Div | Op::Mod => self.arith(op, a, b),
            Op::Shl | Op::Sar | Op::Shr | Op::And | Op::Or | Op::Xor => {
                let x = self.to_int_value(a)?;
                let y = self.to_int_value(b)?;
                Ok(Value::Integer(match op {
                    Op::Shl => x.wrapping_shl(y as u32 & 31),
                    Op::Sar => x.wrapping_shr(y as u32 & 31),
                    Op::Shr => ((x as u32).wrapping_shr(y as u32 & 31)) as i32,
                    Op::And => x & y,
                    Op::Or => x | y,
                    Op::Xor => x ^ y,
                    _ => unreachable!(),
                }))
            }
            Op::LAnd => Ok(Value::Bool(self.truthy(a) && self.truthy(b))),
            Op::LOr => Ok(Value::Bool(self.truthy(a) || self.truthy(b))),
            Op::Eq => Ok(Value::Bool(self.values_equal(a, b))),
            Op::Ne => Ok(Value::Bool(!self.values_equal(a, b))),
            Op::Lt | Op::Le | Op::Gt | Op::Ge => {
                let ordering = if let (Value::Str(x), Value::Str(y)) = (a, b) {
                    let heap = self.heap.borrow();
                    heap.string(x).cmp(heap.string(y)) as i32
                } else {
                    let x = self.to_float_value(a)?;
                    let y = self.to_float_value(b)?;
                    if x < y {
                        -1
                    } else if x > y {
                        1
                    } else {
                        0
                    }
                };
                Ok(Value::Bool(match op {
                    Op::Lt => ordering < 0,
                    Op::Le => ordering <= 0,
                    Op::Gt => ordering > 0,
                    Op::Ge => ordering >= 0,
                    _ => unreachable!(),
                }))
            }
            _ => Err(Error::OutOfRange),
        }
    }

    fn arith(&self, op: Op, a: Value, b: Value) -> Result<Value, Error> {
        let an = self.to_number_value(a)?;
        let bn = self.to_number_value(b)?;
        if let (Value::Integer(x), Value::Integer(y)) = (an, bn) {
            return Ok(match op {
                Op::Add => Value::Integer(x.wrapping_add(y)),
                Op::Sub => Value::Integer(x.wrapping_sub(y)),
                Op::Mul => Value::Integer(x.wrapping_mul(y)),
                Op::Div => {
                    if y == 0 {
                        return Err(Error::OutOfRange);
                    }
                    if x % y == 0 {
                        Value::Integer(x / y)
                    } else {
                        Value::Float(x as f64 / y as f64)
                    }
                }
                Op::Mod => {
                    if y == 0 {
                        return Err(Error::OutOfRange);
                    }
                    Value::Integer(x % y)
                }
                _ => return Err(Error::OutOfRange),
            });
        }
        let x = match an {
            Value::Integer(n) => n as f64,
            Value::Float(n) => n,
            _ => return Err(Error::CannotConvertStringToNumber),
        };
        let y = match bn {
            Value::Integer(n) => n as f64,
            Value::Float(n) => n,
            _ => return Err(Error::CannotConvertStringToNumber),
        };
        Ok(Value::Float(match op {
            Op::Add => x + y,
            Op::Sub => x - y,
            Op::Mul => x * y,
            Op::Div => x / y,
            Op::Mod => x % y,
            _ => return Err(Error::OutOfRange),
        }))
    }

    // ---- GC integration ----

    fn maybe_collect(&mut self) {
        if self.heap.borrow().should_collect() {
            self.collect_garbage();
        }
    }

    fn gather_roots(&self) -> Vec<Value> {
        let mut roots: Vec<Value> = Vec::with_capacity(self.stack.len() + 16);
        roots.extend(self.stack.iter().copied());
        for frame in &self.frames {
            roots.push(Value::Obj(frame.func));
            roots.push(frame.this);
            roots.extend(frame.args.iter().copied());
        }
        for (_, v) in self.program.globals() {
            roots.push(*v);
        }
        for id in self.program.string_literals() {
            roots.push(Value::Str(*id));
        }
        for (_, v) in &self.builtin_globals {
            roots.push(*v);
        }
        roots
    }

    /// Runs a collection rooted at this unit's live state. Safe points
    /// only: the dispatch loop calls this between complete opcodes.
    pub fn collect_garbage(&mut self) {
        let roots = self.gather_roots();
        self.heap.borrow_mut().collect(&roots);
    }

    // ---- diagnostics ----

    /// Writes text to the console sink.
    pub fn print(&mut self, text: &str) {
        self.console.borrow_mut().write(text);
    }

    /// Builds an instance of a prototype object without calling its
    /// constructor; used by natives that materialize host results.
    pub fn construct_instance(&mut self, proto: ObjectId) -> ObjectId {
        let mut heap = self.heap.borrow_mut();
        let props = heap.object(proto).map(|o| o.properties().to_vec()).unwrap_or_default();
        let mut inst = Object::mater();
        for (a, v) in props {
            inst.set_property(a, v);
        }
        heap.create_object(inst)
    }

    fn format_trace(&self, error: &Error) -> String {
        let atoms = self.atoms.borrow();
        let mut out = format!("error: {}\n", error);
        for frame in self.frames.iter().rev() {
            let name = atoms.resolve(frame.code.name);
            let name = if name.is_empty() { "<anonymous>" } else { name };
            let line = frame.code.line_for_pc(frame.pc.saturating_sub(1));
            out.push_str(&format!("  at {} (line {})\n", name, line));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_with_code(build: impl FnOnce(&mut Function)) -> ExecutionUnit {
        let heap = Rc::new(RefCell::new(Heap::new()));
        let atoms = Rc::new(RefCell::new(AtomTable::new()));
        let mut f = Function::new(WellKnown::Main.into());
        build(&mut f);
        f.emit_op(Op::Ret);
        f.emit_u8(0);
        let main = {
            let mut h = heap.borrow_mut();
            let mut o = Object::function(f);
            o.set_collectable(false);
            h.create_object(o)
        };
        ExecutionUnit::new(Program::new(main), heap, atoms)
    }

    #[test]
    fn test_integer_arithmetic() {
        let mut eu = unit_with_code(|f| {
            let a = f.add_constant(Value::Integer(6));
            let b = f.add_constant(Value::Integer(7));
            f.emit_op(Op::PushK);
            f.emit_u8(a as u8);
            f.emit_op(Op::PushK);
            f.emit_u8(b as u8);
            f.emit_op(Op::Mul);
            f.emit_op(Op::Ret);
            f.emit_u8(1);
        });
        // Main returns 42; execute clears the stack, so check via a
        // wrapper call instead.
        let main = eu.program().main;
        let (reason, value) = eu.call_value(Value::Obj(main), Value::Undefined, &[]).unwrap();
        assert_eq!(reason, CallReturn::Finished);
        assert_eq!(value, Value::Integer(42));
    }

    #[test]
    fn test_global_write_and_read() {
        let mut eu = unit_with_code(|f| {
            let k = f.add_constant(Value::Integer(9));
            f.emit_op(Op::PushId);
            f.emit_u16(500);
            f.emit_op(Op::PushK);
            f.emit_u8(k as u8);
            f.emit_op(Op::Move);
            f.emit_op(Op::Pop);
        });
        assert_eq!(eu.execute().unwrap(), CallReturn::Finished);
        assert_eq!(eu.program().global(Atom(500)), Some(Value::Integer(9)));
    }

    #[test]
    fn test_stack_balance_after_statements() {
        // Two expression statements: depth returns to zero after each.
        let mut eu = unit_with_code(|f| {
            let k = f.add_constant(Value::Integer(1));
            for _ in 0..2 {
                f.emit_op(Op::PushK);
                f.emit_u8(k as u8);
                f.emit_op(Op::Pop);
            }
        });
        assert_eq!(eu.execute().unwrap(), CallReturn::Finished);
        assert_eq!(eu.stack_depth(), 0);
    }

    #[test]
    fn test_division_by_zero_is_error() {
        let mut eu = unit_with_code(|f| {
            let a = f.add_constant(Value::Integer(1));
            let b = f.add_constant(Value::Integer(0));
            f.emit_op(Op::PushK);
            f.emit_u8(a as u8);
            f.emit_op(Op::PushK);
            f.emit_u8(b as u8);
            f.emit_op(Op::Div);
            f.emit_op(Op::Pop);
        });
        assert_eq!(eu.execute().unwrap_err(), Error::OutOfRange);
        assert!(eu.take_last_trace().is_some());
    }

    #[test]
    fn test_string_concatenation() {
        let heap = Rc::new(RefCell::new(Heap::new()));
        let atoms = Rc::new(RefCell::new(AtomTable::new()));
        let hello = heap.borrow_mut().create_string("hello ");
        let mut f = Function::new(WellKnown::Main.into());
        let a = f.add_constant(Value::Str(hello));
        let b = f.add_constant(Value::Integer(5));
        f.emit_op(Op::PushK);
        f.emit_u8(a as u8);
        f.emit_op(Op::PushK);
        f.emit_u8(b as u8);
        f.emit_op(Op::Add);
        f.emit_op(Op::Ret);
        f.emit_u8(1);
        let main = {
            let mut h = heap.borrow_mut();
            let mut o = Object::function(f);
            o.set_collectable(false);
            h.create_object(o)
        };
        let mut eu = ExecutionUnit::new(Program::new(main), heap, atoms);
        let (_, value) = eu.call_value(Value::Obj(main), Value::Undefined, &[]).unwrap();
        assert_eq!(eu.to_string_value(value), "hello 5");
    }

    #[test]
    fn test_terminate_flag_observed_at_safe_point() {
        let mut eu = unit_with_code(|f| {
            // Infinite loop: Jmp back to itself.
            f.emit_op(Op::Jmp);
            f.emit_u16((-3i16) as u16);
        });
        eu.terminate_handle().set(true);
        assert_eq!(eu.execute().unwrap(), CallReturn::Terminated);
        assert!(eu.stack_depth() == 0);
    }

    #[test]
    fn test_event_pinning_round_trip() {
        let mut eu = unit_with_code(|_| {});
        let obj = {
            let heap_rc = eu.heap();
            let mut h = heap_rc.borrow_mut();
            h.create_object(Object::mater())
        };
        eu.enqueue_event(EventRecord {
            func: Value::Undefined,
            this: Value::Undefined,
            args: vec![Value::Obj(obj)],
            stop_listening: false,
        });
        // Pinned: survives a collection with no other roots.
        eu.collect_garbage();
        assert!(eu.heap().borrow().is_valid_object(obj));

        let record = eu.take_event().unwrap();
        assert_eq!(record.args, vec![Value::Obj(obj)]);
        // Unpinned now; with no roots it is collected.
        eu.collect_garbage();
        assert!(!eu.heap().borrow().is_valid_object(obj));
    }

    #[test]
    fn test_native_call_convention() {
        fn add_native(eu: &mut ExecutionUnit, _this: Value, nparams: u32) -> CallResult {
            let a = eu.native_arg(nparams, 0);
            let b = eu.native_arg(nparams, 1);
            let x = eu.to_int_value(a)?;
            let y = eu.to_int_value(b)?;
            eu.push(Value::Integer(x + y));
            Ok(CallReturn::Count(1))
        }

        let mut eu = unit_with_code(|_| {});
        let idx = eu.register_native(add_native);
        let func = {
            let heap_rc = eu.heap();
            let mut h = heap_rc.borrow_mut();
            h.create_object(Object::native(idx))
        };
        let (reason, value) = eu
            .call_value(Value::Obj(func), Value::Undefined, &[Value::Integer(2), Value::Integer(40)])
            .unwrap();
        assert_eq!(reason, CallReturn::Count(1));
        assert_eq!(value, Value::Integer(42));
        assert_eq!(eu.stack_depth(), 0);
    }
}
