//! The runloop.

use crate::task::{Task, TaskId, TaskState};
use bytecode_system::Program;
use core_types::{CallReturn, Time};
use interpreter::ExecutionUnit;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};

/// The cooperative scheduler.
///
/// Each iteration: deliver queued events, wake due timers, run one
/// quantum of the next ready task, then (with nothing ready) block until
/// the earliest deadline.
pub struct Scheduler {
    tasks: Vec<Task>,
    ready: VecDeque<TaskId>,
    sleeping: BinaryHeap<Reverse<(Time, TaskId)>>,
    installer: Option<fn(&mut ExecutionUnit)>,
}

impl Scheduler {
    /// An empty scheduler.
    pub fn new() -> Self {
        Scheduler {
            tasks: Vec::new(),
            ready: VecDeque::new(),
            sleeping: BinaryHeap::new(),
            installer: None,
        }
    }

    /// Sets the built-in installer applied to execution units admitted
    /// for spawned tasks (`Task.run()`).
    pub fn set_installer(&mut self, installer: fn(&mut ExecutionUnit)) {
        self.installer = Some(installer);
    }

    /// Admits a task; it runs on the next iteration.
    pub fn add_task(&mut self, eu: ExecutionUnit) -> TaskId {
        self.admit(Task::new(eu, 0))
    }

    fn admit(&mut self, task: Task) -> TaskId {
        let id = self.tasks.len();
        self.tasks.push(task);
        self.ready.push_back(id);
        id
    }

    /// Requests termination of a task; it unwinds at its next safe point
    /// (or is retired immediately if it will never run again).
    pub fn terminate(&mut self, id: TaskId) {
        if let Some(task) = self.tasks.get_mut(id) {
            task.terminate();
            if matches!(task.state, TaskState::Waiting | TaskState::Sleeping(_)) {
                // It will observe the flag as soon as it runs again.
                task.state = TaskState::Ready;
                self.ready.push_back(id);
            }
        }
    }

    /// Access to a task (tests, diagnostics).
    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// Runs until every task is done.
    pub fn run(&mut self) {
        loop {
            let mut progressed = false;

            progressed |= self.deliver_events();
            progressed |= self.wake_due_timers();
            progressed |= self.admit_spawned();
            self.apply_terminate_requests();

            if let Some(id) = self.ready.pop_front() {
                self.run_quantum(id);
                progressed = true;
            }

            // A quantum may have requested spawns; admit them before
            // deciding everything is done.
            progressed |= self.admit_spawned();

            if self.tasks.iter().all(Task::is_done) {
                return;
            }
            if progressed {
                continue;
            }

            // Nothing ready: block until the earliest deadline, or give
            // up on tasks that wait with no event source left.
            if let Some(&Reverse((deadline, _))) = self.sleeping.peek() {
                let now = Time::now();
                if deadline > now {
                    std::thread::sleep((deadline - now).to_std());
                }
                continue;
            }
            if !self.resolve_stalled_waiters() {
                return;
            }
        }
    }

    /// Delivers queued events by calling into each task's VM. Events for
    /// a single source stay in order: the queue is FIFO and there is one
    /// consumer.
    fn deliver_events(&mut self) -> bool {
        let mut progressed = false;
        for id in 0..self.tasks.len() {
            loop {
                let task = &mut self.tasks[id];
                if task.is_done() {
                    break;
                }
                let record = match task.eu.take_event() {
                    Some(r) => r,
                    None => break,
                };
                progressed = true;
                task.eu.unpin_execution_roots();
                let result = task.eu.fire_event(record.func, record.this, &record.args);
                if record.stop_listening {
                    task.eu.stop_event_listening();
                }
                let mut stop = false;
                match result {
                    Ok(CallReturn::MsDelay(d)) => {
                        let deadline = Time::now() + d;
                        task.state = TaskState::Sleeping(deadline);
                        self.sleeping.push(Reverse((deadline, id)));
                        stop = true;
                    }
                    Ok(CallReturn::Terminated) => {
                        task.state = TaskState::Done;
                        stop = true;
                    }
                    Ok(_) => {
                        // The callback completed; a task that was waiting
                        // for an event is runnable again.
                        if task.state == TaskState::Waiting {
                            task.state = TaskState::Ready;
                            self.ready.push_back(id);
                        }
                    }
                    Err(_) => {
                        self.report_failure(id);
                        stop = true;
                    }
                }
                if !self.tasks[id].is_done() {
                    self.tasks[id].eu.pin_execution_roots();
                }
                if stop {
                    break;
                }
            }
        }
        progressed
    }

    fn wake_due_timers(&mut self) -> bool {
        let now = Time::now();
        let mut woke = false;
        while let Some(&Reverse((deadline, id))) = self.sleeping.peek() {
            if deadline > now {
                break;
            }
            self.sleeping.pop();
            let task = &mut self.tasks[id];
            if matches!(task.state, TaskState::Sleeping(d) if d == deadline) {
                task.state = TaskState::Ready;
                self.ready.push_back(id);
                woke = true;
            }
        }
        woke
    }

    /// Admits tasks requested through `Task.run()`. The new unit shares
    /// the requesting task's stores and host seams.
    fn admit_spawned(&mut self) -> bool {
        let mut requests: Vec<(TaskId, i32, core_types::ObjectId)> = Vec::new();
        for (id, task) in self.tasks.iter_mut().enumerate() {
            for (token, main) in task.eu.take_spawn_requests() {
                requests.push((id, token, main));
            }
        }
        let progressed = !requests.is_empty();
        for (src, token, main) in requests {
            let heap = self.tasks[src].eu.heap();
            let atoms = self.tasks[src].eu.atoms();
            let mut eu = ExecutionUnit::new(Program::new(main), heap, atoms);
            if let Some(installer) = self.installer {
                installer(&mut eu);
            }
            eu.adopt_channels(&self.tasks[src].eu);
            let id = self.tasks.len();
            self.tasks.push(Task::new(eu, token));
            self.ready.push_back(id);
        }
        progressed
    }

    fn apply_terminate_requests(&mut self) {
        let mut tokens = Vec::new();
        for task in &mut self.tasks {
            tokens.extend(task.eu.take_terminate_requests());
        }
        for token in tokens {
            for id in 0..self.tasks.len() {
                if self.tasks[id].token == token && !self.tasks[id].is_done() {
                    self.terminate(id);
                }
            }
        }
    }

    fn run_quantum(&mut self, id: TaskId) {
        let task = &mut self.tasks[id];
        if task.is_done() {
            return;
        }
        task.eu.unpin_execution_roots();
        let result = task.eu.execute();
        match result {
            Ok(CallReturn::Finished) | Ok(CallReturn::Count(_)) => {
                // Keep a listening task alive: its async completion still
                // owes it an event.
                if task.eu.is_listening() || task.eu.has_events() {
                    task.state = TaskState::Waiting;
                } else {
                    task.state = TaskState::Done;
                }
            }
            Ok(CallReturn::MsDelay(d)) => {
                let deadline = Time::now() + d;
                task.state = TaskState::Sleeping(deadline);
                self.sleeping.push(Reverse((deadline, id)));
            }
            Ok(CallReturn::WaitForEvent) => {
                if task.eu.has_events() {
                    // Already satisfied; deliver on the next iteration
                    // and resume.
                    task.state = TaskState::Waiting;
                } else if task.eu.is_listening() {
                    task.state = TaskState::Waiting;
                } else {
                    // Nothing can ever arrive; treat the wait as elapsed.
                    task.state = TaskState::Ready;
                    self.ready.push_back(id);
                }
            }
            Ok(CallReturn::Terminated) => {
                task.state = TaskState::Done;
            }
            Err(_) => {
                self.report_failure(id);
            }
        }
        // Other tasks share the heap: while this one is off the CPU its
        // live state must stay visible to their collections.
        if !self.tasks[id].is_done() {
            self.tasks[id].eu.pin_execution_roots();
        }
    }

    /// Prints the captured trace of a failed task and retires it. A task
    /// failure never takes the scheduler down.
    fn report_failure(&mut self, id: TaskId) {
        let task = &mut self.tasks[id];
        if let Some(trace) = task.eu.take_last_trace() {
            task.eu.print(&trace);
        }
        task.state = TaskState::Done;
    }

    /// Waiting tasks with no events and no listening operation can never
    /// resume; retire them rather than hang. Returns true when anything
    /// was still alive.
    fn resolve_stalled_waiters(&mut self) -> bool {
        let mut any = false;
        for task in &mut self.tasks {
            if task.state == TaskState::Waiting
                && !task.eu.has_events()
                && !task.eu.is_listening()
            {
                task.state = TaskState::Done;
                any = true;
            }
        }
        any
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytecode_system::{Function, Op};
    use core_types::{AtomTable, Value, WellKnown};
    use memory_manager::{Heap, Object};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn unit_for(build: impl FnOnce(&mut Function)) -> ExecutionUnit {
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
    fn test_runs_task_to_completion() {
        let eu = unit_for(|f| {
            let k = f.add_constant(Value::Integer(1));
            f.emit_op(Op::PushK);
            f.emit_u8(k as u8);
            f.emit_op(Op::Pop);
        });
        let mut scheduler = Scheduler::new();
        let id = scheduler.add_task(eu);
        scheduler.run();
        assert!(scheduler.task(id).unwrap().is_done());
    }

    #[test]
    fn test_delay_suspends_then_resumes() {
        fn tiny_delay(
            _eu: &mut ExecutionUnit,
            _this: Value,
            _n: u32,
        ) -> core_types::CallResult {
            Ok(CallReturn::MsDelay(core_types::Duration::from_millis(5)))
        }

        let mut eu = unit_for(|_| {});
        let idx = eu.register_native(tiny_delay);
        let func = {
            let heap = eu.heap();
            let mut h = heap.borrow_mut();
            h.create_object(Object::native(idx))
        };
        eu.register_global(core_types::Atom(900), Value::Obj(func));

        // Rebuild main to call the delaying native then finish.
        let eu = {
            let heap = eu.heap();
            let atoms = eu.atoms();
            let mut f = Function::new(WellKnown::Main.into());
            f.emit_op(Op::PushId);
            f.emit_u16(900);
            f.emit_op(Op::Call);
            f.emit_u8(0);
            f.emit_op(Op::Pop);
            f.emit_op(Op::Ret);
            f.emit_u8(0);
            let main = {
                let mut h = heap.borrow_mut();
                let mut o = Object::function(f);
                o.set_collectable(false);
                h.create_object(o)
            };
            let mut new_eu = ExecutionUnit::new(Program::new(main), heap, atoms);
            new_eu.register_native(tiny_delay);
            new_eu.register_global(core_types::Atom(900), Value::Obj(func));
            new_eu
        };

        let start = Time::now();
        let mut scheduler = Scheduler::new();
        let id = scheduler.add_task(eu);
        scheduler.run();
        let elapsed = Time::now() - start;

        assert!(scheduler.task(id).unwrap().is_done());
        assert!(elapsed.as_millis() >= 5, "resumed after {}ms", elapsed.as_millis());
    }
}
