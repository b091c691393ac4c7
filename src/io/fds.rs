//! File Descriptor Wrappers
//!
//! Thin RAII wrappers around the three descriptors the reactor owns. All of
//! them are created close-on-exec and closed on drop.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::config::EVENT_BATCH;

fn cvt(rc: libc::c_int) -> io::Result<libc::c_int> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

/// Owned epoll instance.
pub struct EpollFd {
    fd: RawFd,
}

impl EpollFd {
    pub fn new() -> io::Result<Self> {
        let fd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        Ok(Self { fd })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        cvt(unsafe { libc::epoll_ctl(self.fd, op, fd, &mut ev) })?;
        Ok(())
    }

    pub fn add(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events)
    }

    pub fn modify(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events)
    }

    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        cvt(unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) })?;
        Ok(())
    }

    /// Wait for events, retrying on signal interruption. `timeout_ms` of -1
    /// blocks until an event arrives. On return `events` holds the ready
    /// set.
    pub fn wait(&self, events: &mut Vec<libc::epoll_event>, timeout_ms: i32) -> io::Result<()> {
        events.clear();
        events.reserve(EVENT_BATCH);
        loop {
            let n = unsafe {
                libc::epoll_wait(self.fd, events.as_mut_ptr(), EVENT_BATCH as i32, timeout_ms)
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            unsafe { events.set_len(n as usize) };
            return Ok(());
        }
    }
}

impl Drop for EpollFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// Owned eventfd used for cross-thread wakeup.
pub struct EventFd {
    fd: RawFd,
}

impl EventFd {
    pub fn new() -> io::Result<Self> {
        let fd = cvt(unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) })?;
        Ok(Self { fd })
    }

    pub fn raw(&self) -> RawFd {
        self.fd
    }

    /// Drain the counter. Called when epoll reports the eventfd readable.
    pub fn read(&self) {
        let mut val: u64 = 0;
        unsafe {
            libc::read(
                self.fd,
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
    }

    /// Add `val` to the counter; usable from any thread and any fd copy.
    pub fn write_to(fd: RawFd, val: u64) {
        unsafe {
            libc::write(
                fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// Owned monotonic timerfd used to bound epoll waits.
pub struct TimerFd {
    fd: RawFd,
}

impl TimerFd {
    pub fn new() -> io::Result<Self> {
        let fd = cvt(unsafe {
            libc::timerfd_create(
                libc::CLOCK_MONOTONIC,
                libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
            )
        })?;
        Ok(Self { fd })
    }

    pub fn raw(&self) -> RawFd {
        self.fd
    }

    /// Arm a one-shot expiry `after` from now with nanosecond resolution.
    /// A zero duration would disarm the timer, so it is bumped to 1ns.
    pub fn arm(&self, after: Duration) -> io::Result<()> {
        let mut nanos = after.subsec_nanos() as libc::c_long;
        let secs = after.as_secs() as libc::time_t;
        if secs == 0 && nanos == 0 {
            nanos = 1;
        }
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: secs,
                tv_nsec: nanos,
            },
        };
        cvt(unsafe { libc::timerfd_settime(self.fd, 0, &spec, std::ptr::null_mut()) })?;
        Ok(())
    }

    /// Consume a pending expiry so a level-triggered registration goes
    /// quiet again.
    pub fn read(&self) {
        let mut val: u64 = 0;
        unsafe {
            libc::read(
                self.fd,
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
    }
}

impl Drop for TimerFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}
