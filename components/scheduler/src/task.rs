//! Tasks: independently scheduled script executions.

use core_types::Time;
use interpreter::ExecutionUnit;
use std::cell::Cell;
use std::rc::Rc;

/// Identifies a task within its scheduler.
pub type TaskId = usize;

/// Where a task is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Runnable; waiting for a quantum.
    Ready,
    /// Sleeping until the deadline.
    Sleeping(Time),
    /// Suspended until an event is delivered.
    Waiting,
    /// Ran to completion, was terminated, or failed.
    Done,
}

/// A cooperatively scheduled unit: one program bound to one VM context.
/// The VM never shares a stack across tasks.
pub struct Task {
    /// The task's execution unit.
    pub eu: ExecutionUnit,
    /// Scheduling state.
    pub state: TaskState,
    /// External token (`Task.run()` spawns carry one); 0 for tasks
    /// admitted directly.
    pub token: i32,
    terminate: Rc<Cell<bool>>,
}

impl Task {
    /// Wraps an execution unit as a schedulable task.
    pub fn new(eu: ExecutionUnit, token: i32) -> Self {
        let terminate = eu.terminate_handle();
        Task { eu, state: TaskState::Ready, token, terminate }
    }

    /// Requests cooperative termination; the VM observes the flag at its
    /// next safe point and unwinds.
    pub fn terminate(&self) {
        self.terminate.set(true);
    }

    /// True once the task will never run again.
    pub fn is_done(&self) -> bool {
        self.state == TaskState::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytecode_system::{Function, Program};
    use core_types::AtomTable;
    use memory_manager::{Heap, Object};
    use std::cell::RefCell;

    fn empty_task() -> Task {
        let heap = Rc::new(RefCell::new(Heap::new()));
        let atoms = Rc::new(RefCell::new(AtomTable::new()));
        let main = {
            let mut h = heap.borrow_mut();
            let mut o = Object::function(Function::default());
            o.set_collectable(false);
            h.create_object(o)
        };
        Task::new(ExecutionUnit::new(Program::new(main), heap, atoms), 0)
    }

    #[test]
    fn test_terminate_sets_shared_flag() {
        let task = empty_task();
        assert!(!task.eu.terminate_handle().get());
        task.terminate();
        assert!(task.eu.terminate_handle().get());
    }

    #[test]
    fn test_initial_state() {
        let task = empty_task();
        assert_eq!(task.state, TaskState::Ready);
        assert!(!task.is_done());
    }
}
