//! Task Scheduler Module
//!
//! One scheduler per OS thread. It owns every task spawned on that thread,
//! a FIFO ready queue, a lock-free dirty queue fed by other threads, an
//! alarm clock, and (once the first I/O operation runs) an epoll reactor.
//! The scheduler loop and the tasks swap control back and forth over
//! register-level context switches; the loop itself always runs on the
//! thread's original stack.

pub(crate) mod alarm;
pub(crate) mod context;
pub(crate) mod stack;
pub(crate) mod task;

use std::cell::{Cell, RefCell, UnsafeCell};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use crate::io::fds::EventFd;
use crate::io::Reactor;
use crate::sync::mpsc::MpscQueue;
use alarm::AlarmClock;
use context::{context_switch, CpuContext};
use task::TaskRef;

/// Cross-thread surface of a scheduler.
///
/// Everything another thread may legally touch lives here: the dirty queue,
/// the live-task count, the cancel flag and the two wakeup paths. The rest
/// of the scheduler is single-threaded state owned by its thread.
pub(crate) struct SchedulerShared {
    /// Tasks readied from other threads; drained at the top of every loop
    /// iteration
    pub(crate) dirtyq: MpscQueue<TaskRef>,
    /// Number of live non-system tasks
    pub(crate) taskcount: AtomicUsize,
    /// Set by `cancel`; the owning loop broadcasts cancellation once
    canceled: AtomicBool,
    /// Reactor eventfd, or -1 while no reactor exists. Published before the
    /// owning thread first sleeps in epoll, so a producer that still reads
    /// -1 is ordered before that sleep and its dirty push is seen by the
    /// pre-sleep drain.
    wake_fd: AtomicI32,
    /// Sleep mutex for reactorless idling; `wakeup` takes it before
    /// notifying so a signal cannot slip between the drain and the wait
    sleep: Mutex<()>,
    cv: Condvar,
}

impl SchedulerShared {
    fn new() -> Self {
        Self {
            dirtyq: MpscQueue::new(),
            taskcount: AtomicUsize::new(0),
            canceled: AtomicBool::new(false),
            wake_fd: AtomicI32::new(-1),
            sleep: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    /// Wake the owning scheduler out of its idle wait, whichever kind it is
    /// currently using.
    pub(crate) fn wakeup(&self) {
        // Pairs with the fence after the wake_fd store in `with_io`: a
        // caller that still reads -1 here is ordered before that store, so
        // its dirty push is seen by the scheduler's pre-sleep drain.
        std::sync::atomic::fence(Ordering::SeqCst);
        let fd = self.wake_fd.load(Ordering::SeqCst);
        if fd >= 0 {
            EventFd::write_to(fd, 1);
        } else {
            let _guard = self.sleep.lock().unwrap();
            self.cv.notify_one();
        }
    }

    /// Request cooperative shutdown of the owning scheduler.
    pub(crate) fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        self.wakeup();
    }
}

/// Per-thread scheduler state. Single-threaded by construction; interior
/// mutability is only there so tasks and the loop can share `&Scheduler`.
pub(crate) struct Scheduler {
    pub(crate) shared: Arc<SchedulerShared>,
    /// Time cached once per loop iteration; tasks read it for sleeps and
    /// timeouts instead of hitting the clock on every call
    cached_now: Cell<Instant>,
    current: RefCell<Option<TaskRef>>,
    alltasks: RefCell<Vec<TaskRef>>,
    /// Finished tasks parked here until the next turn so a stack is never
    /// freed while control could still be on it
    gctasks: RefCell<Vec<TaskRef>>,
    readyq: RefCell<VecDeque<TaskRef>>,
    pub(crate) alarms: RefCell<AlarmClock<TaskRef>>,
    io: RefCell<Option<Reactor>>,
    /// The loop's own saved context; tasks swap back into this
    sched_ctx: UnsafeCell<CpuContext>,
    tasks_canceled: Cell<bool>,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(SchedulerShared::new()),
            cached_now: Cell::new(Instant::now()),
            current: RefCell::new(None),
            alltasks: RefCell::new(Vec::new()),
            gctasks: RefCell::new(Vec::new()),
            readyq: RefCell::new(VecDeque::new()),
            alarms: RefCell::new(AlarmClock::new()),
            io: RefCell::new(None),
            sched_ctx: UnsafeCell::new(CpuContext::new()),
            tasks_canceled: Cell::new(false),
        }
    }

    pub(crate) fn cached_now(&self) -> Instant {
        self.cached_now.get()
    }

    fn update_now(&self) -> Instant {
        let now = Instant::now();
        self.cached_now.set(now);
        now
    }

    pub(crate) fn current_task(&self) -> Option<TaskRef> {
        self.current.borrow().clone()
    }

    pub(crate) fn sched_ctx_ptr(&self) -> *mut CpuContext {
        self.sched_ctx.get()
    }

    /// Run the reactor-or-create-it dance. The wakeup fd is published to
    /// the shared surface the moment the reactor exists.
    pub(crate) fn with_io<R>(&self, f: impl FnOnce(&mut Reactor) -> R) -> R {
        let mut io = self.io.borrow_mut();
        let reactor = io.get_or_insert_with(|| {
            let r = Reactor::new();
            self.shared.wake_fd.store(r.wake_raw(), Ordering::SeqCst);
            // Pairs with the fence in `SchedulerShared::wakeup`
            std::sync::atomic::fence(Ordering::SeqCst);
            r
        });
        f(reactor)
    }

    /// Attach a freshly spawned task to this scheduler.
    pub(crate) fn attach(&self, t: TaskRef) {
        self.shared.taskcount.fetch_add(1, Ordering::SeqCst);
        log::trace!(target: "taskrt::sched", "attached {}", t.describe());
        self.alltasks.borrow_mut().push(t);
    }

    fn remove_task(&self, t: &TaskRef) {
        if !t.is_system() {
            self.shared.taskcount.fetch_sub(1, Ordering::SeqCst);
        }
        let mut all = self.alltasks.borrow_mut();
        if let Some(i) = all.iter().position(|x| Arc::ptr_eq(x, t)) {
            let arc = all.remove(i);
            self.gctasks.borrow_mut().push(arc);
        }
    }

    /// Enqueue a task owned by this scheduler. Callers must have won the
    /// task's ready flag first.
    pub(crate) fn enqueue_local(&self, t: TaskRef, front: bool) {
        let mut q = self.readyq.borrow_mut();
        if front {
            q.push_front(t);
        } else {
            q.push_back(t);
        }
    }

    /// Ready a task from the reactor: same thread, back of the queue.
    pub(crate) fn ready_for_io(&self, t: &TaskRef) {
        if !t.set_ready() {
            self.readyq.borrow_mut().push_back(t.clone());
        }
    }

    /// Cancel the task with the given id if this scheduler owns it.
    pub(crate) fn cancel_task_by_id(&self, id: u64) -> bool {
        let all = self.alltasks.borrow();
        for t in all.iter() {
            if t.id == id {
                task::Task::cancel(t);
                return true;
            }
        }
        false
    }

    /// Log id, name, state and flags of every task on this scheduler.
    pub(crate) fn dump(&self) {
        for t in self.alltasks.borrow().iter() {
            log::info!(target: "taskrt::sched", "{}", t.describe());
        }
    }

    /// Run until every non-system task has exited.
    pub(crate) fn run_loop(&self) {
        log::trace!(target: "taskrt::sched", "entering loop");
        while self.shared.taskcount.load(Ordering::SeqCst) > 0 {
            self.schedule();
        }
        log::trace!(target: "taskrt::sched", "exiting loop");
    }

    /// One scheduling turn: find a runnable task and swap into it.
    ///
    /// Each turn frees the previous turn's finished tasks, broadcasts a
    /// pending cancel, folds in remotely readied tasks, fires due alarms,
    /// and sleeps (bounded by the next alarm) when nothing is runnable.
    pub(crate) fn schedule(&self) {
        self.gctasks.borrow_mut().clear();
        loop {
            self.check_canceled();
            self.drain_dirty();
            let now = self.update_now();
            self.tick_alarms(now);
            if !self.readyq.borrow().is_empty() {
                break;
            }
            if self.shared.taskcount.load(Ordering::SeqCst) == 0 {
                // every remaining task detached or exited while we idled
                return;
            }
            let when = self.alarms.borrow().when();
            self.wait(when);
        }

        let t = match self.readyq.borrow_mut().pop_front() {
            Some(t) => t,
            None => return,
        };
        if t.has_exited() {
            // stale wakeup for a task that already finished
            return;
        }
        t.clear_ready();
        *self.current.borrow_mut() = Some(t.clone());
        log::trace!(target: "taskrt::sched", "swapping to {}", t.describe());
        unsafe { context_switch(self.sched_ctx.get(), t.ctx_ptr()) };
        *self.current.borrow_mut() = None;

        if t.has_exited() {
            self.remove_task(&t);
        }
    }

    fn check_canceled(&self) {
        if self.shared.canceled.load(Ordering::SeqCst) && !self.tasks_canceled.get() {
            self.tasks_canceled.set(true);
            self.shutdown();
        }
    }

    /// Mark every non-system task canceled. Runs at most once per cancel
    /// request; system tasks keep running.
    pub(crate) fn shutdown(&self) {
        let current = self.current_task();
        for t in self.alltasks.borrow().iter() {
            if t.is_system() {
                continue;
            }
            if let Some(cur) = &current {
                if Arc::ptr_eq(cur, t) {
                    continue;
                }
            }
            task::Task::cancel(t);
        }
    }

    fn drain_dirty(&self) {
        while let Some(t) = self.shared.dirtyq.pop() {
            log::trace!(target: "taskrt::sched", "dirty readying {}", t.describe());
            self.readyq.borrow_mut().push_back(t);
        }
    }

    fn tick_alarms(&self, now: Instant) {
        if self.alarms.borrow().is_empty() {
            return;
        }
        self.alarms.borrow_mut().tick(now, |t, error| {
            if let Some(e) = error {
                t.set_pending(e);
            }
            log::trace!(target: "taskrt::sched", "alarm fired for {}", t.describe());
            self.ready_for_io(&t);
        });
    }

    /// Sleep until something becomes runnable or `when` arrives. With a
    /// reactor the sleep happens in epoll; without one, on the condvar.
    fn wait(&self, when: Option<Instant>) {
        let has_io = self.io.borrow().is_some();
        if has_io {
            let mut io = self.io.borrow_mut();
            if let Some(reactor) = io.as_mut() {
                reactor.wait(self, when);
            }
            return;
        }

        let guard = self.shared.sleep.lock().unwrap();
        // Re-check under the sleep mutex: a producer that pushed before we
        // locked has either been drained here or will notify after we wait.
        self.drain_dirty();
        if !self.readyq.borrow().is_empty()
            || self.shared.canceled.load(Ordering::SeqCst)
            || self.shared.taskcount.load(Ordering::SeqCst) == 0
        {
            return;
        }
        match when {
            Some(tp) => {
                let now = Instant::now();
                if tp > now {
                    let _ = self.shared.cv.wait_timeout(guard, tp - now);
                }
            }
            None => {
                drop(self.shared.cv.wait(guard));
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Producers must stop writing to the eventfd before the reactor
        // closes it below.
        self.shared.wake_fd.store(-1, Ordering::SeqCst);
    }
}
