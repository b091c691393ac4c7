//! Reactor Tests
//!
//! fdwait and poll against pipes, poll timeouts, and a loopback socket
//! echo through the task-friendly socket wrappers.

mod common;

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::run_checked;
use taskrt::net::NetSock;
use taskrt::{fdwait, poll, Interest, PollEvents, PollFd};

fn pipe() -> (RawFd, RawFd) {
    let mut fds = [0i32; 2];
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
    assert_eq!(rc, 0, "pipe2 failed");
    (fds[0], fds[1])
}

fn close(fd: RawFd) {
    unsafe { libc::close(fd) };
}

#[test]
fn test_fdwait_sees_pipe_readable() {
    let (r, w) = pipe();
    let done = Arc::new(AtomicBool::new(false));

    let d = done.clone();
    let start = Instant::now();
    run_checked(move || {
        let d2 = d.clone();
        taskrt::spawn(move || {
            let ready = fdwait(r, Interest::Readable, Some(Duration::from_secs(1))).unwrap();
            assert!(ready, "fdwait timed out with a pending byte");
            let mut buf = [0u8; 1];
            let n = unsafe { libc::read(r, buf.as_mut_ptr() as *mut libc::c_void, 1) };
            assert_eq!(n, 1);
            assert_eq!(buf[0], b'x');
            d2.store(true, Ordering::SeqCst);
        })
        .unwrap();

        taskrt::spawn(move || {
            let n = unsafe { libc::write(w, b"x".as_ptr() as *const libc::c_void, 1) };
            assert_eq!(n, 1);
        })
        .unwrap();
    });

    assert!(done.load(Ordering::SeqCst));
    assert!(
        start.elapsed() < Duration::from_millis(900),
        "pipe readiness took {:?}",
        start.elapsed()
    );
    close(r);
    close(w);
}

#[test]
fn test_fdwait_times_out() {
    let (r, w) = pipe();
    run_checked(move || {
        let start = Instant::now();
        let ready = fdwait(r, Interest::Readable, Some(Duration::from_millis(100))).unwrap();
        let elapsed = start.elapsed();
        assert!(!ready, "fdwait reported ready on a silent pipe");
        assert!(
            elapsed >= Duration::from_millis(80),
            "fdwait returned early: {:?}",
            elapsed
        );
        assert!(elapsed < Duration::from_secs(2), "fdwait overslept: {:?}", elapsed);
        close(r);
        close(w);
    });
}

#[test]
fn test_poll_reports_revents() {
    let (r, w) = pipe();
    run_checked(move || {
        let n = unsafe { libc::write(w, b"y".as_ptr() as *const libc::c_void, 1) };
        assert_eq!(n, 1);

        let mut fds = [PollFd::new(r, PollEvents::IN)];
        let ready = poll(&mut fds, Some(Duration::from_secs(1))).unwrap();
        assert_eq!(ready, 1);
        assert!(fds[0].revents.contains(PollEvents::IN));
        close(r);
        close(w);
    });
}

#[test]
fn test_poll_two_fds_one_ready() {
    let (ra, wa) = pipe();
    let (rb, wb) = pipe();
    run_checked(move || {
        let n = unsafe { libc::write(wb, b"z".as_ptr() as *const libc::c_void, 1) };
        assert_eq!(n, 1);

        let mut fds = [
            PollFd::new(ra, PollEvents::IN),
            PollFd::new(rb, PollEvents::IN),
        ];
        let ready = poll(&mut fds, Some(Duration::from_secs(1))).unwrap();
        assert_eq!(ready, 1);
        assert!(fds[0].revents.is_empty());
        assert!(fds[1].revents.contains(PollEvents::IN));
        close(ra);
        close(wa);
        close(rb);
        close(wb);
    });
}

#[test]
fn test_fdwait_reports_hangup_as_not_ready() {
    let (r, w) = pipe();
    run_checked(move || {
        close(w);
        // Hangup with nothing buffered: usable data never arrives
        let ready = fdwait(r, Interest::Readable, Some(Duration::from_secs(1))).unwrap();
        assert!(!ready, "fdwait reported a hung-up pipe as readable");
        close(r);
    });
}

#[test]
fn test_two_tasks_wait_on_different_fds() {
    let (ra, wa) = pipe();
    let (rb, wb) = pipe();
    let hit_a = Arc::new(AtomicBool::new(false));
    let hit_b = Arc::new(AtomicBool::new(false));

    let ha = hit_a.clone();
    let hb = hit_b.clone();
    run_checked(move || {
        let ha2 = ha.clone();
        taskrt::spawn(move || {
            assert!(fdwait(ra, Interest::Readable, Some(Duration::from_secs(2))).unwrap());
            ha2.store(true, Ordering::SeqCst);
        })
        .unwrap();
        let hb2 = hb.clone();
        taskrt::spawn(move || {
            assert!(fdwait(rb, Interest::Readable, Some(Duration::from_secs(2))).unwrap());
            hb2.store(true, Ordering::SeqCst);
        })
        .unwrap();

        taskrt::spawn(move || unsafe {
            libc::write(wa, b"a".as_ptr() as *const libc::c_void, 1);
            libc::write(wb, b"b".as_ptr() as *const libc::c_void, 1);
        })
        .unwrap();
    });

    assert!(hit_a.load(Ordering::SeqCst), "first waiter never woke");
    assert!(hit_b.load(Ordering::SeqCst), "second waiter never woke");
    close(ra);
    close(wa);
    close(rb);
    close(wb);
}

#[test]
fn test_loopback_echo() {
    let echoed = Arc::new(AtomicBool::new(false));
    let e = echoed.clone();
    run_checked(move || {
        let listener = NetSock::listen(&"127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = listener.local_addr().unwrap();

        taskrt::spawn(move || {
            let (peer, _from) = listener.accept(Some(Duration::from_secs(2))).unwrap();
            let mut buf = [0u8; 5];
            let n = peer
                .recv_all(&mut buf, Some(Duration::from_secs(2)))
                .unwrap();
            assert_eq!(&buf[..n], b"hello");
            peer.send(&buf[..n], Some(Duration::from_secs(2))).unwrap();
        })
        .unwrap();

        let client = NetSock::connect_to(&addr, Some(Duration::from_secs(2))).unwrap();
        client.send(b"hello", Some(Duration::from_secs(2))).unwrap();
        let mut echo = [0u8; 5];
        let n = client
            .recv_all(&mut echo, Some(Duration::from_secs(2)))
            .unwrap();
        assert_eq!(&echo[..n], b"hello");
        e.store(true, Ordering::SeqCst);
    });
    assert!(echoed.load(Ordering::SeqCst));
}

#[test]
fn test_dial_unresolvable_host_reports_hostname_error() {
    run_checked(|| {
        let r = NetSock::dial("host.invalid", 80, Some(Duration::from_secs(1)));
        assert!(
            matches!(r, Err(taskrt::Error::Hostname(_))),
            "expected hostname error"
        );
    });
}
