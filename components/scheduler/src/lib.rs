//! Cooperative event scheduler.
//!
//! A single-threaded runloop owns every [`Task`]: a FIFO of ready tasks,
//! a deadline heap of sleeping tasks, and per-task event queues. Each
//! iteration delivers pending events, wakes due timers, and runs one
//! quantum of one ready task until it yields with a suspension reason or
//! finishes. Only one VM instruction executes at any time across all
//! tasks.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod runloop;
mod task;

pub use runloop::Scheduler;
pub use task::{Task, TaskId, TaskState};
