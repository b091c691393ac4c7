//! Runtime Error Types
//!
//! This module defines the error type shared by every blocking operation in
//! the runtime. Suspension points (sleeps, polls, channel waits) report
//! cancellation and deadlines through `Error`; plain syscall failures are
//! carried as `Error::Io`.

use std::fmt;
use std::io;

/// Errors produced by runtime operations
#[derive(Debug)]
pub enum Error {
    /// The task was canceled and observed it at a cancellation point
    Interrupted,

    /// A deadline armed on this task expired; observed at a cancellation
    /// point, like `Interrupted`
    DeadlineReached,

    /// Send or receive on a closed channel
    ChannelClosed,

    /// Address resolution produced no usable address
    Hostname(String),

    /// Failed to allocate a task stack during spawn
    BadStackAlloc,

    /// Underlying syscall failure
    Io(io::Error),
}

/// Result type for runtime operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for errors raised by the cancellation machinery.
    ///
    /// `DeadlineReached` counts: a deadline interrupts the task the same way
    /// an explicit cancel does, and callers that only care about "was I torn
    /// out of a blocking call" should test this instead of matching both
    /// variants.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Interrupted | Error::DeadlineReached)
    }

    /// True when a deadline (not a plain cancel) fired.
    pub fn is_deadline(&self) -> bool {
        matches!(self, Error::DeadlineReached)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Interrupted => write!(f, "task interrupted"),
            Error::DeadlineReached => write!(f, "deadline reached"),
            Error::ChannelClosed => write!(f, "channel closed"),
            Error::Hostname(host) => write!(f, "no address found for {}", host),
            Error::BadStackAlloc => write!(f, "task stack allocation failed"),
            Error::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
