//! I/O Reactor
//!
//! The reactor multiplexes file descriptor readiness, alarm deadlines and
//! cross-thread wakeups onto one epoll instance. Tasks register interest
//! with `poll`/`fdwait`, suspend, and are readied when epoll reports their
//! descriptor. Deadline-bounded waits are implemented with a timerfd armed
//! at nanosecond resolution, so `epoll_wait` itself always blocks with an
//! infinite timeout.

pub mod fds;

use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bitflags::bitflags;

use crate::error::Result;
use crate::runtime;
use crate::sched::alarm::ScopedAlarm;
use crate::sched::task::{self, CancelScope, TaskRef};
use crate::sched::Scheduler;
use fds::{EpollFd, EventFd, TimerFd};

bitflags! {
    /// Event mask for `poll`, mirroring the epoll event bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollEvents: u32 {
        const IN = libc::EPOLLIN as u32;
        const OUT = libc::EPOLLOUT as u32;
        const PRI = libc::EPOLLPRI as u32;
        const ERR = libc::EPOLLERR as u32;
        const HUP = libc::EPOLLHUP as u32;
        const RDHUP = libc::EPOLLRDHUP as u32;
    }
}

/// One descriptor/event pair for `poll`.
#[derive(Debug, Clone, Copy)]
pub struct PollFd {
    pub fd: RawFd,
    pub events: PollEvents,
    pub revents: PollEvents,
}

impl PollFd {
    pub fn new(fd: RawFd, events: PollEvents) -> Self {
        Self {
            fd,
            events,
            revents: PollEvents::empty(),
        }
    }
}

/// Direction argument for `fdwait`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

/// Per-fd registration: at most one task per direction.
#[derive(Default)]
struct PollSlot {
    in_task: Option<TaskRef>,
    out_task: Option<TaskRef>,
    in_revents: u32,
    out_revents: u32,
    /// Event mask currently registered with epoll for this fd
    events: u32,
}

pub(crate) struct Reactor {
    efd: EpollFd,
    evfd: EventFd,
    tfd: TimerFd,
    /// Registrations indexed by fd for constant-time lookup
    pollfds: Vec<PollSlot>,
    events: Vec<libc::epoll_event>,
}

impl Reactor {
    /// Create the epoll instance with its wakeup eventfd and timeout
    /// timerfd already registered. Failure here means the process cannot
    /// do I/O at all, so it is fatal.
    pub(crate) fn new() -> Self {
        let efd = EpollFd::new().expect("failed to create epoll instance");
        let evfd = EventFd::new().expect("failed to create wakeup eventfd");
        let tfd = TimerFd::new().expect("failed to create timeout timerfd");
        // Edge triggered: one wakeup per batch of writes, drained on read
        efd.add(evfd.raw(), (libc::EPOLLIN | libc::EPOLLET) as u32)
            .expect("failed to register wakeup eventfd");
        // Level triggered and drained on expiry
        efd.add(tfd.raw(), libc::EPOLLIN as u32)
            .expect("failed to register timeout timerfd");
        Self {
            efd,
            evfd,
            tfd,
            pollfds: Vec::new(),
            events: Vec::with_capacity(crate::config::EVENT_BATCH),
        }
    }

    pub(crate) fn wake_raw(&self) -> RawFd {
        self.evfd.raw()
    }

    /// Register `t` for every entry in `fds`. On failure the already
    /// registered prefix is rolled back.
    pub(crate) fn add_pollfds(&mut self, t: &TaskRef, fds: &mut [PollFd]) -> std::io::Result<()> {
        for i in 0..fds.len() {
            if let Err(e) = self.add_one(t, i, fds) {
                self.remove_pollfds(t, &mut fds[..i]);
                return Err(e);
            }
        }
        Ok(())
    }

    fn add_one(&mut self, t: &TaskRef, i: usize, fds: &mut [PollFd]) -> std::io::Result<()> {
        let pfd = &mut fds[i];
        assert!(pfd.fd >= 0, "poll on invalid fd {}", pfd.fd);
        let idx = pfd.fd as usize;
        if self.pollfds.len() <= idx {
            self.pollfds.resize_with(idx + 1, PollSlot::default);
        }
        pfd.revents = PollEvents::empty();
        let want_in = pfd.events.contains(PollEvents::IN);
        let want_out = pfd.events.contains(PollEvents::OUT);

        let slot = &mut self.pollfds[idx];
        let saved = slot.events;
        if want_in {
            debug_assert!(
                slot.in_task.is_none(),
                "fd {} already has a task waiting for input",
                pfd.fd
            );
            slot.in_task = Some(t.clone());
            slot.in_revents = 0;
            slot.events |= libc::EPOLLIN as u32;
        }
        if want_out {
            debug_assert!(
                slot.out_task.is_none(),
                "fd {} already has a task waiting for output",
                pfd.fd
            );
            slot.out_task = Some(t.clone());
            slot.out_revents = 0;
            slot.events |= libc::EPOLLOUT as u32;
        }
        let events = slot.events;

        let result = if saved == 0 {
            self.efd.add(pfd.fd, events)
        } else if saved != events {
            self.efd.modify(pfd.fd, events)
        } else {
            Ok(())
        };
        if let Err(e) = result {
            let slot = &mut self.pollfds[idx];
            if want_in {
                slot.in_task = None;
            }
            if want_out {
                slot.out_task = None;
            }
            slot.events = saved;
            return Err(e);
        }
        Ok(())
    }

    /// Drop the registrations made for `fds`, copy out the delivered event
    /// masks, and return how many entries have a nonzero `revents`.
    pub(crate) fn remove_pollfds(&mut self, t: &TaskRef, fds: &mut [PollFd]) -> usize {
        let mut ready = 0;
        for pfd in fds.iter_mut() {
            let idx = pfd.fd as usize;
            if idx >= self.pollfds.len() {
                continue;
            }
            let want_in = pfd.events.contains(PollEvents::IN);
            let want_out = pfd.events.contains(PollEvents::OUT);

            let slot = &mut self.pollfds[idx];
            let saved = slot.events;
            let mut delivered = 0u32;
            let mut registered = false;
            if want_in {
                if let Some(owner) = &slot.in_task {
                    if Arc::ptr_eq(owner, t) {
                        delivered |= slot.in_revents;
                        slot.in_task = None;
                        slot.in_revents = 0;
                        slot.events &= !(libc::EPOLLIN as u32);
                        registered = true;
                    }
                }
            }
            if want_out {
                if let Some(owner) = &slot.out_task {
                    if Arc::ptr_eq(owner, t) {
                        delivered |= slot.out_revents;
                        slot.out_task = None;
                        slot.out_revents = 0;
                        slot.events &= !(libc::EPOLLOUT as u32);
                        registered = true;
                    }
                }
            }
            let events = slot.events;

            pfd.revents = PollEvents::from_bits_truncate(delivered);
            if !pfd.revents.is_empty() {
                ready += 1;
            }
            if registered {
                if events == 0 {
                    let _ = self.efd.remove(pfd.fd);
                } else if events != saved {
                    let _ = self.efd.modify(pfd.fd, events);
                }
            }
        }
        ready
    }

    /// Block in epoll until an event, a wakeup, or `when`. Delivered events
    /// ready the registered tasks; an fd's IN and OUT tasks are both woken
    /// on any event, since epoll reports errors and hangups regardless of
    /// the requested mask.
    pub(crate) fn wait(&mut self, sched: &Scheduler, when: Option<Instant>) {
        let mut timeout_ms: i32 = -1;
        if let Some(tp) = when {
            let now = sched.cached_now();
            if tp <= now {
                timeout_ms = 0;
            } else if self.tfd.arm(tp - now).is_err() {
                // Coarse epoll timeout as a fallback
                timeout_ms = (tp - now).as_millis().min(i32::MAX as u128).max(1) as i32;
            }
        }

        if let Err(e) = self.efd.wait(&mut self.events, timeout_ms) {
            log::error!(target: "taskrt::reactor", "epoll wait failed: {}", e);
            return;
        }

        let events = std::mem::take(&mut self.events);
        for ev in &events {
            let fd = ev.u64 as RawFd;
            let bits = ev.events;
            if fd == self.evfd.raw() {
                self.evfd.read();
                continue;
            }
            if fd == self.tfd.raw() {
                self.tfd.read();
                continue;
            }
            let idx = fd as usize;
            if idx >= self.pollfds.len() {
                log::error!(target: "taskrt::reactor", "event {:#x} for unknown fd {}", bits, fd);
                continue;
            }
            let slot = &mut self.pollfds[idx];
            let in_task = slot.in_task.clone();
            let out_task = slot.out_task.clone();
            if in_task.is_some() {
                slot.in_revents |= bits;
            }
            if out_task.is_some() {
                slot.out_revents |= bits;
            }
            match (&in_task, &out_task) {
                (None, None) => {
                    log::error!(
                        target: "taskrt::reactor",
                        "event {:#x} for fd {} with no waiting task",
                        bits,
                        fd
                    );
                }
                _ => {
                    if let Some(t) = &in_task {
                        sched.ready_for_io(t);
                    }
                    if let Some(t) = &out_task {
                        let same = in_task
                            .as_ref()
                            .map(|i| Arc::ptr_eq(i, t))
                            .unwrap_or(false);
                        if !same {
                            sched.ready_for_io(t);
                        }
                    }
                }
            }
        }
        self.events = events;
    }
}

/// Suspend the calling task until one of `fds` has an event or `timeout`
/// passes. Returns the number of entries with a nonzero `revents`; zero
/// means the wait timed out. Cancellation and deadlines interrupt the wait
/// after the registrations have been dropped.
pub fn poll(fds: &mut [PollFd], timeout: Option<Duration>) -> Result<usize> {
    let ctx = runtime::context();
    let t = task::current();
    if fds.len() == 1 {
        t.set_state_str(&format!("poll fd {}", fds[0].fd));
    } else {
        t.set_state_str(&format!("poll {} fds", fds.len()));
    }
    let _cancel = CancelScope::enter(&t);
    ctx.sched.with_io(|io| io.add_pollfds(&t, fds))?;
    let alarm = timeout.map(|d| ScopedAlarm::new(t.clone(), ctx.sched.cached_now() + d));
    let swapped = t.swap();
    drop(alarm);
    let ready = ctx.sched.with_io(|io| io.remove_pollfds(&t, fds));
    swapped?;
    Ok(ready)
}

/// Wait for a single descriptor to become readable or writable. Returns
/// false on timeout and on hangup or error conditions, true when the
/// descriptor is usable for the requested direction.
pub fn fdwait(fd: RawFd, interest: Interest, timeout: Option<Duration>) -> Result<bool> {
    let events = match interest {
        Interest::Readable => PollEvents::IN,
        Interest::Writable => PollEvents::OUT,
    };
    let mut fds = [PollFd::new(fd, events)];
    if poll(&mut fds, timeout)? > 0 {
        if fds[0].revents.intersects(PollEvents::ERR | PollEvents::HUP) {
            return Ok(false);
        }
        return Ok(true);
    }
    Ok(false)
}
