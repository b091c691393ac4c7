//! Task-Aware Synchronization Primitives
//!
//! Locks, condition variables and channels whose waiters are tasks. Their
//! internal OS mutexes are held only for bounded pointer work; a task that
//! has to wait parks itself and suspends instead of blocking its thread.

pub mod channel;
pub(crate) mod mpsc;
pub mod qutex;
pub mod rendez;

pub use channel::Channel;
pub use qutex::{Qutex, QutexGuard};
pub use rendez::Rendez;
