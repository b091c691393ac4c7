//! Scoped Deadlines
//!
//! A `Deadline` imposes a time budget on the current task: when it expires,
//! the task's next cancellation point reports `DeadlineReached`, tearing it
//! out of whatever blocking call it is in. Dropping the deadline disarms
//! it. Several deadlines may overlap; whichever expires first is the one
//! the task observes.

use std::io;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::runtime;
use crate::sched::alarm::ScopedAlarm;
use crate::sched::task;

/// RAII deadline for the calling task.
pub struct Deadline {
    alarm: ScopedAlarm,
}

impl Deadline {
    /// Arm a deadline `timeout` from now. A zero timeout is rejected: it
    /// would fire before any work could happen and always signals a
    /// miscomputed duration at the call site.
    pub fn new(timeout: Duration) -> Result<Deadline> {
        if timeout.is_zero() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "zero deadline",
            )));
        }
        let t = task::current();
        let when = runtime::context().sched.cached_now() + timeout;
        let alarm = ScopedAlarm::with_error(t, when, Error::DeadlineReached);
        log::trace!(target: "taskrt::task", "deadline armed in {:?}", timeout);
        Ok(Deadline { alarm })
    }

    /// Time left before the deadline fires; zero once it fired or was
    /// canceled.
    pub fn remaining(&self) -> Duration {
        self.alarm.remaining()
    }

    /// Disarm the deadline. Idempotent; a deadline that already fired
    /// stays observed (the pending error is not recalled).
    pub fn cancel(&mut self) {
        self.alarm.cancel();
    }
}
