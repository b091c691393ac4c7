//! Typed Channel
//!
//! FIFO channel for sending values between tasks, in either direction
//! across threads. Channels are buffered (fixed capacity) or unbuffered
//! (capacity zero: every send rendezvouses with a receive). All handles
//! cloned from the same channel share one underlying queue.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::sync::qutex::Qutex;
use crate::sync::rendez::Rendez;

struct State<T> {
    capacity: usize,
    unread: usize,
    queue: VecDeque<T>,
    closed: bool,
}

impl<T> State<T> {
    fn is_full(&self) -> bool {
        self.unread >= self.capacity
    }
}

struct Inner<T> {
    state: Qutex<State<T>>,
    not_empty: Rendez,
    not_full: Rendez,
}

/// A closeable MPMC FIFO of `T`.
///
/// Cloning produces another handle to the same channel. A handle created
/// with `with_autoclose` closes the channel when dropped; clones never do.
pub struct Channel<T> {
    inner: Arc<Inner<T>>,
    autoclose: bool,
}

impl<T> Channel<T> {
    /// Create a channel. Capacity zero makes it unbuffered: a send
    /// completes only when a receiver takes the value.
    pub fn new(capacity: usize) -> Self {
        Self::build(capacity, false)
    }

    /// Like `new`, but this handle closes the channel when dropped.
    pub fn with_autoclose(capacity: usize) -> Self {
        Self::build(capacity, true)
    }

    fn build(capacity: usize, autoclose: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Qutex::new(State {
                    capacity,
                    unread: 0,
                    queue: VecDeque::new(),
                    closed: false,
                }),
                not_empty: Rendez::new(),
                not_full: Rendez::new(),
            }),
            autoclose,
        }
    }

    /// Send a value, waiting while the buffer is full. Returns how many
    /// values were already buffered when this send went through; useful as
    /// a backpressure hint, with no guarantee beyond "less than capacity at
    /// push time".
    pub fn send(&self, item: T) -> Result<usize> {
        let inner = &self.inner;
        let mut st = inner.state.lock();
        loop {
            if st.closed {
                return Err(Error::ChannelClosed);
            }
            if !st.is_full() {
                break;
            }
            st = inner.not_full.sleep(st)?;
        }
        let prev = st.unread;
        st.queue.push_back(item);
        st.unread += 1;
        inner.not_empty.wakeup();
        Ok(prev)
    }

    /// Receive the oldest value, waiting while the channel is empty. Once
    /// the channel is closed, remaining values are still drained; after
    /// that every receive reports `ChannelClosed`.
    pub fn recv(&self) -> Result<T> {
        let inner = &self.inner;
        let mut st = inner.state.lock();
        let unbuffered = st.capacity == 0;
        if unbuffered {
            // Open a one-item window and release a parked sender
            st.capacity = 1;
            inner.not_full.wakeup();
        }
        while st.unread == 0 && !st.closed {
            st = match inner.not_empty.sleep(st) {
                Ok(st) => st,
                Err(e) => {
                    if unbuffered {
                        let mut st = inner.state.lock();
                        if st.capacity == 1 {
                            st.capacity = 0;
                        }
                    }
                    return Err(e);
                }
            };
        }
        if st.unread == 0 {
            if unbuffered {
                st.capacity = 0;
            }
            return Err(Error::ChannelClosed);
        }
        st.unread -= 1;
        let item = st.queue.pop_front().expect("unread count out of sync");
        if unbuffered {
            // Close the window again so the next send must rendezvous
            st.capacity = 0;
        } else {
            inner.not_full.wakeup();
        }
        Ok(item)
    }

    /// Close the channel and wake everyone parked on it. Idempotent.
    pub fn close(&self) {
        let inner = &self.inner;
        let mut st = inner.state.lock();
        st.closed = true;
        inner.not_empty.wakeup_all();
        inner.not_full.wakeup_all();
        drop(st);
    }

    /// Drop all buffered values and wake parked senders.
    pub fn clear(&self) {
        let inner = &self.inner;
        let mut st = inner.state.lock();
        st.queue.clear();
        st.unread = 0;
        inner.not_full.wakeup_all();
        drop(st);
    }

    /// Number of buffered, unreceived values.
    pub fn unread(&self) -> usize {
        self.inner.state.lock().unread
    }

    pub fn is_empty(&self) -> bool {
        self.unread() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            autoclose: false,
        }
    }
}

impl<T> Drop for Channel<T> {
    fn drop(&mut self) {
        if self.autoclose {
            self.close();
        }
    }
}
