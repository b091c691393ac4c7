//! Alarm Clock
//!
//! An ordered set of deadline entries, one per sleeping task, I/O timeout
//! or armed deadline. The scheduler ticks it once per loop iteration and
//! asks it how long the next wait may block. Entries are identified by a
//! sequence number so removal is idempotent.

use std::time::Instant;

use crate::error::Error;
use crate::runtime;
use crate::sched::task::TaskRef;

struct Entry<T> {
    id: u64,
    value: T,
    when: Instant,
    error: Option<Error>,
}

/// Sorted sequence of `(value, deadline)` entries, earliest first.
pub struct AlarmClock<T> {
    entries: Vec<Entry<T>>,
    next_id: u64,
}

impl<T> AlarmClock<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
        }
    }

    /// Insert an entry and return its id. Entries with equal deadlines keep
    /// insertion order.
    pub fn insert(&mut self, value: T, when: Instant, error: Option<Error>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        let at = self.entries.partition_point(|e| e.when <= when);
        self.entries.insert(
            at,
            Entry {
                id,
                value,
                when,
                error,
            },
        );
        id
    }

    /// Remove the entry with the given id. Removing an id that already
    /// fired or was removed is a no-op.
    pub fn remove(&mut self, id: u64) {
        if let Some(i) = self.entries.iter().position(|e| e.id == id) {
            self.entries.remove(i);
        }
    }

    /// Fire every entry with `when <= now`, in deadline order, then discard
    /// the fired prefix. The callback receives the entry's value and its
    /// optional error payload.
    pub fn tick<F>(&mut self, now: Instant, mut f: F)
    where
        F: FnMut(T, Option<Error>),
    {
        let due = self.entries.partition_point(|e| e.when <= now);
        for e in self.entries.drain(..due) {
            f(e.value, e.error);
        }
    }

    /// Earliest deadline, or `None` when the clock is empty.
    pub fn when(&self) -> Option<Instant> {
        self.entries.first().map(|e| e.when)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// RAII alarm against the current thread's clock.
///
/// Arms an entry for a task on construction and removes it when dropped or
/// canceled, so a wait that finishes early never leaves a stale wakeup
/// behind. `cancel` is idempotent.
pub(crate) struct ScopedAlarm {
    id: Option<u64>,
    when: Instant,
}

impl ScopedAlarm {
    /// Arm a plain wakeup for `task` at `when`.
    pub(crate) fn new(task: TaskRef, when: Instant) -> Self {
        Self::arm(task, when, None)
    }

    /// Arm a wakeup that deposits `error` in the task's pending slot.
    pub(crate) fn with_error(task: TaskRef, when: Instant, error: Error) -> Self {
        Self::arm(task, when, Some(error))
    }

    fn arm(task: TaskRef, when: Instant, error: Option<Error>) -> Self {
        let sched = &runtime::context().sched;
        let id = sched.alarms.borrow_mut().insert(task, when, error);
        Self { id: Some(id), when }
    }

    /// Time left until the alarm fires; zero once fired or canceled.
    pub(crate) fn remaining(&self) -> std::time::Duration {
        if self.id.is_some() {
            self.when.saturating_duration_since(Instant::now())
        } else {
            std::time::Duration::ZERO
        }
    }

    /// Disarm the alarm. Safe to call more than once.
    pub(crate) fn cancel(&mut self) {
        if let Some(id) = self.id.take() {
            runtime::context().sched.alarms.borrow_mut().remove(id);
        }
    }
}

impl Drop for ScopedAlarm {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_when_is_earliest() {
        let mut clock = AlarmClock::new();
        let now = Instant::now();
        assert_eq!(clock.when(), None);
        clock.insert(3u32, now + Duration::from_millis(30), None);
        clock.insert(1u32, now + Duration::from_millis(10), None);
        clock.insert(2u32, now + Duration::from_millis(20), None);
        assert_eq!(clock.when(), Some(now + Duration::from_millis(10)));
    }

    #[test]
    fn test_tick_fires_due_prefix_in_order() {
        let mut clock = AlarmClock::new();
        let now = Instant::now();
        clock.insert(2u32, now + Duration::from_millis(20), None);
        clock.insert(1u32, now + Duration::from_millis(10), None);
        clock.insert(9u32, now + Duration::from_secs(60), None);

        let mut fired = Vec::new();
        clock.tick(now + Duration::from_millis(25), |v, _| fired.push(v));
        assert_eq!(fired, vec![1, 2]);
        assert_eq!(clock.len(), 1);
        // Nothing else is due yet
        clock.tick(now + Duration::from_millis(25), |v, _| fired.push(v));
        assert_eq!(fired, vec![1, 2]);
    }

    #[test]
    fn test_equal_deadlines_keep_insertion_order() {
        let mut clock = AlarmClock::new();
        let now = Instant::now();
        let when = now + Duration::from_millis(5);
        clock.insert('a', when, None);
        clock.insert('b', when, None);
        let mut fired = Vec::new();
        clock.tick(when, |v, _| fired.push(v));
        assert_eq!(fired, vec!['a', 'b']);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut clock = AlarmClock::new();
        let now = Instant::now();
        let id = clock.insert(1u32, now + Duration::from_millis(10), None);
        clock.remove(id);
        assert!(clock.is_empty());
        clock.remove(id);
        assert!(clock.is_empty());
    }

    #[test]
    fn test_error_payload_is_delivered() {
        let mut clock = AlarmClock::new();
        let now = Instant::now();
        clock.insert(7u32, now, Some(Error::DeadlineReached));
        let mut seen = None;
        clock.tick(now, |v, e| seen = Some((v, e)));
        let (v, e) = seen.unwrap();
        assert_eq!(v, 7);
        assert!(e.unwrap().is_deadline());
    }
}
