//! # taskrt
//!
//! A cooperative M:N task runtime: many lightweight, stackful tasks
//! multiplexed onto a small number of OS threads, with integrated epoll
//! based I/O, timers and cross-thread cancellation.
//!
//! ## Model
//!
//! - Each OS thread that uses the runtime owns one scheduler. Tasks are
//!   bound to the thread that spawned them and never migrate.
//! - Tasks suspend only inside runtime calls: `this_task::yield_now`,
//!   sleeps, `poll`/`fdwait`, lock acquisition and channel waits. Ordinary
//!   code never suspends.
//! - Cancellation is cooperative. `TaskHandle::cancel` marks the task and
//!   makes it runnable; the task observes it at its next cancellation
//!   point, where the blocking call reports `Error::Interrupted`.
//! - `Deadline` bounds a stretch of task code the same way, reporting
//!   `Error::DeadlineReached`.
//!
//! ## Example
//!
//! ```no_run
//! use taskrt::sync::Channel;
//!
//! taskrt::run(|| {
//!     let ch: Channel<u32> = Channel::new(0);
//!     let tx = ch.clone();
//!     taskrt::spawn(move || {
//!         for i in 0..5 {
//!             tx.send(i).unwrap();
//!         }
//!     })
//!     .unwrap();
//!     for _ in 0..5 {
//!         let v = ch.recv().unwrap();
//!         println!("got {}", v);
//!     }
//! })
//! .unwrap();
//! ```

pub mod config;
mod deadline;
pub mod error;
pub mod io;
pub mod net;
mod runtime;
mod sched;
pub mod sync;

pub use deadline::Deadline;
pub use error::{Error, Result};
pub use io::{fdwait, poll, Interest, PollEvents, PollFd};
pub use runtime::{
    cancel_all, cancel_task, dump_tasks, now, run, shutdown, spawn_thread, task_count,
};
pub use sched::task::{spawn, spawn_with_stack, this_task, TaskHandle};
