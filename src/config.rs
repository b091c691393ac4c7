//! Runtime configuration constants and tunables.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Page size assumed for stack layout. Task stacks are page aligned and the
/// lowest page is the inaccessible guard.
pub const PAGE_SIZE: usize = 4096;

/// Default task stack size. Generous because task code is ordinary library
/// code with ordinary call depth (formatting, resolver calls, collections).
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// Upper bound on task name and state strings, excluding nothing; both are
/// plain UTF-8 and longer values are truncated at a character boundary.
pub const NAME_MAX: usize = 255;

/// How many epoll events the reactor asks for per wait. Bounding the batch
/// keeps a busy reactor from starving the ready queue.
pub const EVENT_BATCH: usize = 128;

static STACK_SIZE: AtomicUsize = AtomicUsize::new(DEFAULT_STACK_SIZE);

/// Stack size used by `spawn` when no explicit size is given.
pub fn default_stack_size() -> usize {
    STACK_SIZE.load(Ordering::Relaxed)
}

/// Change the process-wide default stack size for subsequently spawned
/// tasks. Values below the platform signal-stack minimum are clamped up by
/// the stack allocator.
pub fn set_default_stack_size(size: usize) {
    STACK_SIZE.store(size, Ordering::Relaxed);
}
