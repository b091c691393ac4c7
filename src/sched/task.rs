//! Task Management
//!
//! A task is a stackful, cooperatively scheduled activity bound to the
//! thread that spawned it. This module defines the task control block, the
//! trampoline that every fresh stack boots into, the spawn entry points and
//! the operations a task performs on itself.

use std::cell::UnsafeCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config;
use crate::error::{Error, Result};
use crate::runtime;
use crate::sched::alarm::ScopedAlarm;
use crate::sched::context::{init_context, context_switch, CpuContext};
use crate::sched::stack::{self, Stack};
use crate::sched::SchedulerShared;

/// Shared reference to a task. The owning scheduler's task table holds one
/// for the task's whole attached lifetime; queues, wait lists and handles
/// hold additional ones.
pub(crate) type TaskRef = Arc<Task>;

static TASK_ID: AtomicU64 = AtomicU64::new(0);

/// Task control block.
///
/// Split personality: the atomics at the top are the cross-thread surface
/// (readying, cancellation, detach), everything in an `UnsafeCell` belongs
/// to the owning scheduler thread alone.
pub(crate) struct Task {
    /// Unique, monotonically assigned id
    pub(crate) id: u64,
    /// Arbitrates the right to enqueue: whoever flips false to true owns
    /// the single queue slot this task may occupy
    is_ready: AtomicBool,
    /// Monotonic; once set it stays until the task exits
    canceled: AtomicBool,
    /// Set by the trampoline after the functor finished; late wakeups and
    /// cancels check it and back off
    exited: AtomicBool,
    /// System tasks are excluded from the live count and from shutdown
    system: AtomicBool,
    /// Depth of nested cancellation scopes; cancellation and pending
    /// errors are only reported while it is nonzero
    cancel_points: AtomicU64,
    /// Owning scheduler's cross-thread surface
    pub(crate) sched: Arc<SchedulerShared>,

    ctx: UnsafeCell<CpuContext>,
    _stack: UnsafeCell<Option<Stack>>,
    entry: UnsafeCell<Option<Box<dyn FnOnce()>>>,
    pending: UnsafeCell<Option<Error>>,
    name: UnsafeCell<String>,
    state: UnsafeCell<String>,
}

// Task handles travel between threads (cancel, detach, id). That is safe
// because:
// - the atomics above are the only fields other threads touch
// - ctx, _stack, entry, pending, name and state are accessed exclusively by
//   the owning scheduler thread, either from the task's own stack or from
//   the scheduler loop, which never run concurrently
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

impl Task {
    /// Create a task with its own guarded stack, primed to run `f` on the
    /// first switch.
    pub(crate) fn new(
        sched: Arc<SchedulerShared>,
        f: Box<dyn FnOnce()>,
        stack_size: usize,
    ) -> Result<TaskRef> {
        let stack = stack::allocate(stack_size)?;
        let id = TASK_ID.fetch_add(1, Ordering::SeqCst) + 1;
        let task = Arc::new(Task {
            id,
            is_ready: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
            exited: AtomicBool::new(false),
            system: AtomicBool::new(false),
            cancel_points: AtomicU64::new(0),
            sched,
            ctx: UnsafeCell::new(CpuContext::new()),
            _stack: UnsafeCell::new(None),
            entry: UnsafeCell::new(Some(f)),
            pending: UnsafeCell::new(None),
            name: UnsafeCell::new(format!("task[{}]", id)),
            state: UnsafeCell::new(String::from("new")),
        });
        log::trace!(
            target: "taskrt::task",
            "created task {} with {} byte stack",
            id,
            stack.size()
        );
        unsafe {
            let top = stack.top();
            *task._stack.get() = Some(stack);
            let arg = Arc::as_ptr(&task) as *const u8;
            init_context(&mut *task.ctx.get(), top, arg);
        }
        Ok(task)
    }

    pub(crate) fn ctx_ptr(&self) -> *mut CpuContext {
        self.ctx.get()
    }

    /// Claim the queue slot. Returns the previous flag value; the caller
    /// that sees `false` must enqueue.
    pub(crate) fn set_ready(&self) -> bool {
        self.is_ready.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn clear_ready(&self) {
        self.is_ready.store(false, Ordering::SeqCst);
    }

    pub(crate) fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    pub(crate) fn is_system(&self) -> bool {
        self.system.load(Ordering::SeqCst)
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Make the task runnable. Same-thread callers enqueue directly; other
    /// threads go through the owning scheduler's dirty queue and wake it.
    pub(crate) fn ready(this: &TaskRef, front: bool) {
        if this.set_ready() {
            return;
        }
        match runtime::try_context() {
            Some(ctx) if Arc::ptr_eq(&ctx.sched.shared, &this.sched) => {
                ctx.sched.enqueue_local(this.clone(), front);
            }
            _ => {
                this.sched.dirtyq.push(this.clone());
                this.sched.wakeup();
            }
        }
    }

    /// Request cancellation. Never preempts running code: the flag is set
    /// and the task is made runnable so it can observe it at its next
    /// cancellation point. Idempotent; a no-op once the task exited.
    pub(crate) fn cancel(this: &TaskRef) {
        this.canceled.store(true, Ordering::SeqCst);
        if this.has_exited() {
            return;
        }
        Task::ready(this, false);
    }

    /// Promote to system task: excluded from the live count and from
    /// shutdown cancellation. The owning scheduler is woken in case the
    /// count just reached zero.
    pub(crate) fn detach(&self) {
        if !self.system.swap(true, Ordering::SeqCst) {
            if self.sched.taskcount.fetch_sub(1, Ordering::SeqCst) == 1 {
                self.sched.wakeup();
            }
        }
    }

    /// Deposit an error for the task to observe at its next cancellation
    /// point. First error wins. Owning thread only.
    pub(crate) fn set_pending(&self, e: Error) {
        let slot = unsafe { &mut *self.pending.get() };
        if slot.is_none() {
            *slot = Some(e);
        }
    }

    fn take_pending(&self) -> Option<Error> {
        unsafe { (*self.pending.get()).take() }
    }

    /// Suspend until the scheduler switches back in, then report what
    /// happened while the task was parked: cancellation first, a pending
    /// error second, both only inside a cancellation scope.
    pub(crate) fn swap(&self) -> Result<()> {
        self.switch_out();
        if self.cancel_points.load(Ordering::SeqCst) > 0 {
            if self.canceled.load(Ordering::SeqCst) {
                log::trace!(target: "taskrt::task", "{} interrupted", self.describe());
                return Err(Error::Interrupted);
            }
            if let Some(e) = self.take_pending() {
                log::trace!(target: "taskrt::task", "{} woke with {}", self.describe(), e);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Suspend without reporting anything on resume. For paths that must
    /// not fail, like lock acquisition.
    pub(crate) fn safe_swap(&self) {
        self.switch_out();
    }

    fn switch_out(&self) {
        let sched = &runtime::context().sched;
        unsafe { context_switch(self.ctx_ptr(), sched.sched_ctx_ptr()) };
    }

    pub(crate) fn set_name_str(&self, s: &str) {
        let name = unsafe { &mut *self.name.get() };
        name.clear();
        name.push_str(truncated(s, config::NAME_MAX));
    }

    pub(crate) fn set_state_str(&self, s: &str) {
        let state = unsafe { &mut *self.state.get() };
        state.clear();
        state.push_str(truncated(s, config::NAME_MAX));
    }

    /// One-line diagnostic rendering; owning thread only (reads the name
    /// and state cells).
    pub(crate) fn describe(&self) -> String {
        let (name, state) = unsafe { (&*self.name.get(), &*self.state.get()) };
        format!(
            "[{} {} |{}| canceled: {} ready: {} system: {}]",
            self.id,
            name,
            state,
            self.is_canceled(),
            self.is_ready.load(Ordering::SeqCst),
            self.is_system(),
        )
    }
}

/// Truncate at a character boundary so the result stays valid UTF-8.
fn truncated(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Entry point for every fresh task stack, reached through the boot
/// trampoline. Runs the functor (skipped when the task was canceled before
/// it ever ran), contains panics, marks the task exited and switches back
/// to the scheduler for good.
pub(crate) extern "C" fn task_entry(arg: *const u8) -> ! {
    let task: &Task = unsafe { &*(arg as *const Task) };
    let entry = unsafe { (*task.entry.get()).take() };
    if let Some(f) = entry {
        if !task.is_canceled() {
            task.set_state_str("running");
            if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| String::from("non-string panic payload"));
                log::error!(
                    target: "taskrt::task",
                    "unhandled panic in {}: {}",
                    task.describe(),
                    msg
                );
            }
        }
    }
    task.set_state_str("exited");
    task.exited.store(true, Ordering::SeqCst);
    task.safe_swap();
    unreachable!("task resumed after exit");
}

/// Owner-independent handle to a spawned task.
#[derive(Clone)]
pub struct TaskHandle {
    task: TaskRef,
}

impl TaskHandle {
    /// The task's unique id.
    pub fn id(&self) -> u64 {
        self.task.id
    }

    /// Request cancellation. Safe from any thread; idempotent; a no-op if
    /// the task already exited. The task observes it at its next
    /// cancellation point.
    pub fn cancel(&self) {
        Task::cancel(&self.task);
    }

    /// Turn the task into a system task: its scheduler no longer counts it
    /// when deciding whether to exit and shutdown will not cancel it.
    pub fn detach(&self) {
        self.task.detach();
    }

    /// Whether the task has finished running.
    pub fn is_finished(&self) -> bool {
        self.task.has_exited()
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle").field("id", &self.task.id).finish()
    }
}

/// Spawn a task on the current thread with the default stack size.
///
/// The new task goes to the front of the ready queue, so it runs soon after
/// the spawner next yields. Fails only when its stack cannot be allocated.
pub fn spawn<F>(f: F) -> Result<TaskHandle>
where
    F: FnOnce() + 'static,
{
    spawn_with_stack(f, config::default_stack_size())
}

/// Spawn with an explicit stack size (rounded up to whole pages and clamped
/// to the platform minimum).
pub fn spawn_with_stack<F>(f: F, stack_size: usize) -> Result<TaskHandle>
where
    F: FnOnce() + 'static,
{
    let ctx = runtime::context();
    let task = Task::new(ctx.sched.shared.clone(), Box::new(f), stack_size)?;
    ctx.sched.attach(task.clone());
    Task::ready(&task, true);
    Ok(TaskHandle { task })
}

/// The task currently running on this thread.
pub(crate) fn current() -> TaskRef {
    runtime::context()
        .sched
        .current_task()
        .expect("not called from inside a task")
}

/// RAII cancellation scope: while at least one is alive the task will
/// observe cancellation and pending errors when it resumes from a swap.
pub(crate) struct CancelScope<'a> {
    task: &'a Task,
}

impl<'a> CancelScope<'a> {
    pub(crate) fn enter(task: &'a Task) -> Self {
        task.cancel_points.fetch_add(1, Ordering::SeqCst);
        Self { task }
    }
}

impl Drop for CancelScope<'_> {
    fn drop(&mut self) {
        self.task.cancel_points.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Operations on the calling task.
pub mod this_task {
    use super::*;

    /// Id of the calling task.
    pub fn id() -> u64 {
        current().id
    }

    /// Give up the CPU and go to the back of the ready queue. Not a
    /// cancellation point.
    pub fn yield_now() {
        let t = current();
        t.set_state_str("yield");
        if !t.set_ready() {
            runtime::context().sched.enqueue_local(t.clone(), false);
        }
        t.safe_swap();
    }

    /// Sleep until the given instant. Reports `Interrupted` if the task is
    /// canceled and `DeadlineReached` if a deadline fires first.
    pub fn sleep_until(deadline: Instant) -> Result<()> {
        let t = current();
        t.set_state_str("sleep");
        let _cancel = CancelScope::enter(&t);
        let _alarm = ScopedAlarm::new(t.clone(), deadline);
        t.swap()
    }

    /// Sleep for the given duration, measured from the scheduler's cached
    /// clock.
    pub fn sleep_for(d: Duration) -> Result<()> {
        sleep_until(runtime::context().sched.cached_now() + d)
    }

    /// Set the diagnostic name of the calling task.
    pub fn set_name(name: &str) {
        current().set_name_str(name);
    }

    /// Set the diagnostic state string of the calling task.
    pub fn set_state(state: &str) {
        current().set_state_str(state);
    }
}
