//! Shared test helpers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Run `f` as the root task and fail the test if it did not run to
/// completion. Task panics are contained by the runtime and only logged,
/// so an assertion inside a task shows up as a missing completion flag.
pub fn run_checked<F: FnOnce() + 'static>(f: F) {
    let done = Arc::new(AtomicBool::new(false));
    let d = done.clone();
    taskrt::run(move || {
        f();
        d.store(true, Ordering::SeqCst);
    })
    .unwrap();
    assert!(
        done.load(Ordering::SeqCst),
        "root task did not run to completion (an assertion inside it failed)"
    );
}
