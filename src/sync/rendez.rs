//! Task Condition Variable
//!
//! Wait/notify coordination between tasks, always used together with a
//! `Qutex`. Sleeping enqueues the task, releases the caller's qutex and
//! suspends inside a cancellation scope; waking pops in FIFO order and
//! readies the task outside the internal mutex.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::sync::qutex::{Qutex, QutexGuard};
use crate::sched::task::{self, CancelScope, TaskRef};

/// A condition variable whose waiters are tasks.
pub struct Rendez {
    waiting: Mutex<VecDeque<TaskRef>>,
}

impl Rendez {
    pub fn new() -> Self {
        Self {
            waiting: Mutex::new(VecDeque::new()),
        }
    }

    /// Release `lk`, wait for a wakeup, and reacquire.
    ///
    /// This is a cancellation point: a cancel or deadline tears the task
    /// out of the wait list and the error propagates with the qutex
    /// released (the guard was consumed).
    pub fn sleep<'a, T>(&self, lk: QutexGuard<'a, T>) -> Result<QutexGuard<'a, T>> {
        let t = task::current();
        {
            let mut waiting = self.waiting.lock().unwrap();
            debug_assert!(
                !waiting.iter().any(|w| Arc::ptr_eq(w, &t)),
                "task {} is already waiting on this rendez",
                t.id
            );
            waiting.push_back(t.clone());
        }
        // Enqueued before the qutex drops: a wakeup between the two cannot
        // miss us.
        let qutex = lk.qutex();
        drop(lk);

        t.set_state_str("rendez wait");
        let swapped = {
            let _cancel = CancelScope::enter(&t);
            t.swap()
        };

        // Always unqueue: an interrupted or spurious resume leaves us in
        // the list, a real wakeup already removed us.
        {
            let mut waiting = self.waiting.lock().unwrap();
            waiting.retain(|w| !Arc::ptr_eq(w, &t));
        }
        swapped?;
        Ok(qutex.lock())
    }

    /// Sleep until `pred` over the protected data turns false.
    pub fn sleep_while<'a, T, F>(
        &self,
        mut lk: QutexGuard<'a, T>,
        mut pred: F,
    ) -> Result<QutexGuard<'a, T>>
    where
        F: FnMut(&mut T) -> bool,
    {
        while pred(&mut *lk) {
            lk = self.sleep(lk)?;
        }
        Ok(lk)
    }

    /// Wake the longest-waiting task, if any.
    pub fn wakeup(&self) {
        let woken = {
            let mut waiting = self.waiting.lock().unwrap();
            waiting.pop_front()
        };
        if let Some(t) = woken {
            task::Task::ready(&t, false);
        }
    }

    /// Wake every waiting task.
    pub fn wakeup_all(&self) {
        let woken = {
            let mut waiting = self.waiting.lock().unwrap();
            std::mem::take(&mut *waiting)
        };
        for t in woken {
            task::Task::ready(&t, false);
        }
    }
}

impl Default for Rendez {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Rendez {
    fn drop(&mut self) {
        let waiting = self.waiting.lock().unwrap();
        debug_assert!(
            waiting.is_empty(),
            "rendez dropped with {} tasks still waiting",
            waiting.len()
        );
    }
}
