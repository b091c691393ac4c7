//! Per-Thread Runtime Context
//!
//! Every OS thread that touches the runtime gets exactly one
//! `ThreadContext`, installed lazily behind a thread-local. First use
//! anywhere in the process also runs the once-only boot sequence: an
//! alternate signal stack (so a guard-page fault has room to be reported)
//! and SIGPIPE forced to ignore (broken pipes surface as write errors).
//!
//! All live schedulers register their cross-thread surface in a
//! process-wide list so `cancel_all` can reach them.

use std::cell::OnceCell;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Once};

use crate::error::Result;
use crate::sched::{Scheduler, SchedulerShared};

pub(crate) struct ThreadContext {
    pub(crate) sched: Scheduler,
}

thread_local! {
    static THREAD_CTX: OnceCell<ThreadContext> = const { OnceCell::new() };
}

static REGISTRY: spin::Mutex<Vec<Arc<SchedulerShared>>> = spin::Mutex::new(Vec::new());
static BOOT: Once = Once::new();

fn boot() {
    BOOT.call_once(|| unsafe {
        let ss = libc::stack_t {
            ss_sp: libc::calloc(1, libc::SIGSTKSZ),
            ss_flags: 0,
            ss_size: libc::SIGSTKSZ,
        };
        if !ss.ss_sp.is_null() {
            libc::sigaltstack(&ss, std::ptr::null_mut());
        }
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}

impl ThreadContext {
    fn new() -> Self {
        boot();
        let sched = Scheduler::new();
        REGISTRY.lock().push(sched.shared.clone());
        ThreadContext { sched }
    }
}

impl Drop for ThreadContext {
    fn drop(&mut self) {
        let shared = &self.sched.shared;
        REGISTRY.lock().retain(|s| !Arc::ptr_eq(s, shared));
    }
}

/// The calling thread's runtime context, created on first use.
///
/// The reference is handed out with a thread-lifetime borrow: the
/// thread-local is only destroyed at thread exit, after the scheduler loop
/// and every task on it are gone.
pub(crate) fn context() -> &'static ThreadContext {
    THREAD_CTX.with(|cell| {
        let ctx = cell.get_or_init(ThreadContext::new);
        unsafe { &*(ctx as *const ThreadContext) }
    })
}

/// The calling thread's context if it already has one. Used on wakeup
/// paths that must not drag a full scheduler into an unrelated thread.
pub(crate) fn try_context() -> Option<&'static ThreadContext> {
    THREAD_CTX
        .try_with(|cell| cell.get().map(|ctx| unsafe { &*(ctx as *const ThreadContext) }))
        .ok()
        .flatten()
}

/// Run `f` as a task on the calling thread and drive the scheduler until
/// every non-system task has exited.
pub fn run<F>(f: F) -> Result<()>
where
    F: FnOnce() + 'static,
{
    let ctx = context();
    assert!(
        ctx.sched.current_task().is_none(),
        "run() called from inside a task"
    );
    crate::sched::task::spawn(f)?;
    ctx.sched.run_loop();
    Ok(())
}

/// Start a new OS thread with its own scheduler, run `f` as a task on it,
/// and let the thread exit once its task count reaches zero.
pub fn spawn_thread<F>(f: F) -> std::thread::JoinHandle<()>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(String::from("taskrt"))
        .spawn(move || {
            if let Err(e) = run(f) {
                log::error!(target: "taskrt", "thread task failed to start: {}", e);
            }
        })
        .expect("failed to spawn runtime thread")
}

/// Cancel every non-system task on the calling thread's scheduler and let
/// the run loop drain.
pub fn shutdown() {
    context().sched.shared.cancel();
}

/// Request cooperative shutdown of every scheduler in the process.
pub fn cancel_all() {
    for shared in REGISTRY.lock().iter() {
        shared.cancel();
    }
}

/// Cancel the task with the given id on the calling thread's scheduler.
/// Returns whether a task with that id was found.
pub fn cancel_task(id: u64) -> bool {
    context().sched.cancel_task_by_id(id)
}

/// Log name, state and flags of every task on the calling thread's
/// scheduler.
pub fn dump_tasks() {
    context().sched.dump();
}

/// The scheduler's cached clock. Coarse: updated once per scheduling turn,
/// not on every call.
pub fn now() -> std::time::Instant {
    context().sched.cached_now()
}

/// Number of live (non-system) tasks on the calling thread's scheduler.
pub fn task_count() -> usize {
    context().sched.shared.taskcount.load(Ordering::SeqCst)
}
