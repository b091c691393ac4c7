//! Task Mutex
//!
//! A mutual exclusion primitive whose waiters are tasks, not OS threads.
//! A task that finds the qutex held parks itself on a FIFO waiter list and
//! suspends; unlock hands ownership to the front waiter and makes it
//! runnable. The internal OS mutex is only ever held for a few pointer
//! operations, never across a suspension.
//!
//! Acquisition is deliberately not a cancellation point: a canceled task
//! still completes `lock`, so cleanup code that needs the lock can never be
//! torn apart halfway.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use crate::sched::task::{self, TaskRef};

struct WaitState {
    owner: Option<TaskRef>,
    waiting: VecDeque<TaskRef>,
}

/// A task-aware mutex protecting the wrapped data.
///
/// The lock is released when the guard goes out of scope, handing off to
/// the longest-waiting task if there is one.
pub struct Qutex<T> {
    mtx: Mutex<WaitState>,
    data: UnsafeCell<T>,
}

// The owner protocol gives whichever task holds the guard exclusive access
// to `data`; the wait state has its own OS mutex.
unsafe impl<T: Send> Send for Qutex<T> {}
unsafe impl<T: Send> Sync for Qutex<T> {}

/// Guard providing access to the data protected by a `Qutex`.
pub struct QutexGuard<'a, T> {
    qutex: &'a Qutex<T>,
}

impl<T> Qutex<T> {
    pub fn new(data: T) -> Self {
        Self {
            mtx: Mutex::new(WaitState {
                owner: None,
                waiting: VecDeque::new(),
            }),
            data: UnsafeCell::new(data),
        }
    }

    /// Acquire the qutex, suspending the calling task while it is held
    /// elsewhere. Always completes; cancellation is observed at the
    /// caller's next real cancellation point instead.
    pub fn lock(&self) -> QutexGuard<'_, T> {
        let t = task::current();
        {
            let mut st = self.mtx.lock().unwrap();
            debug_assert!(
                !st.owner.as_ref().is_some_and(|o| Arc::ptr_eq(o, &t)),
                "recursive qutex lock by task {}",
                t.id
            );
            if st.owner.is_none() {
                st.owner = Some(t);
                return QutexGuard { qutex: self };
            }
            st.waiting.push_back(t.clone());
        }

        // Woken either by a handoff or spuriously (a cancel made us
        // runnable); loop until ownership actually arrived.
        loop {
            t.set_state_str("qutex wait");
            t.safe_swap();
            let st = self.mtx.lock().unwrap();
            if st.owner.as_ref().is_some_and(|o| Arc::ptr_eq(o, &t)) {
                break;
            }
        }
        QutexGuard { qutex: self }
    }

    /// Try to acquire without waiting.
    pub fn try_lock(&self) -> Option<QutexGuard<'_, T>> {
        let t = task::current();
        let mut st = match self.mtx.try_lock() {
            Ok(st) => st,
            Err(_) => return None,
        };
        if st.owner.is_none() {
            st.owner = Some(t);
            Some(QutexGuard { qutex: self })
        } else {
            None
        }
    }

    /// Release, or give up a pending acquisition.
    ///
    /// When the caller owns the qutex, ownership moves to the front waiter
    /// (readied outside the OS mutex) or clears. A caller that is not the
    /// owner is removed from the waiter list instead; that only happens
    /// when an error tore it out of an acquisition path.
    fn unlock(&self) {
        let t = task::current();
        let next;
        {
            let mut st = self.mtx.lock().unwrap();
            if st.owner.as_ref().is_some_and(|o| Arc::ptr_eq(o, &t)) {
                next = st.waiting.pop_front();
                st.owner = next.clone();
            } else {
                let before = st.waiting.len();
                st.waiting.retain(|w| !Arc::ptr_eq(w, &t));
                debug_assert!(
                    st.waiting.len() < before,
                    "qutex unlock by task {} which is neither owner nor waiter",
                    t.id
                );
                return;
            }
        }
        if let Some(next) = next {
            task::Task::ready(&next, false);
        }
    }
}

impl<'a, T> QutexGuard<'a, T> {
    pub(crate) fn qutex(&self) -> &'a Qutex<T> {
        self.qutex
    }
}

impl<T> Deref for QutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.qutex.data.get() }
    }
}

impl<T> DerefMut for QutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.qutex.data.get() }
    }
}

impl<T> Drop for QutexGuard<'_, T> {
    fn drop(&mut self) {
        self.qutex.unlock();
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Qutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.try_lock() {
            Some(guard) => write!(f, "Qutex {{ data: {:?} }}", &*guard),
            None => write!(f, "Qutex {{ <locked> }}"),
        }
    }
}
