//! Cancellation Tests
//!
//! Cross-thread cancellation of a sleeping task, repeated observation of
//! an outstanding cancel, and shutdown of a whole scheduler.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use common::run_checked;
use taskrt::{this_task, Error};

#[test]
fn test_cancel_sleeping_task_from_another_thread() {
    let (tx, rx) = mpsc::channel();
    let interrupted = Arc::new(AtomicBool::new(false));

    let i = interrupted.clone();
    let worker = taskrt::spawn_thread(move || {
        let i2 = i.clone();
        let h = taskrt::spawn(move || {
            let r = this_task::sleep_for(Duration::from_secs(2));
            if matches!(r, Err(Error::Interrupted)) {
                i2.store(true, Ordering::SeqCst);
            }
        })
        .unwrap();
        tx.send(h).unwrap();
    });

    let handle = rx.recv().unwrap();
    thread::sleep(Duration::from_millis(100));
    let cancel_at = Instant::now();
    handle.cancel();
    worker.join().unwrap();

    assert!(interrupted.load(Ordering::SeqCst), "sleep was not interrupted");
    assert!(
        cancel_at.elapsed() < Duration::from_millis(500),
        "cancel took {:?} to take effect",
        cancel_at.elapsed()
    );
}

#[test]
fn test_outstanding_cancel_interrupts_every_sleep() {
    let observed = Arc::new(AtomicUsize::new(0));
    let o = observed.clone();
    run_checked(move || {
        let o2 = o.clone();
        let h = taskrt::spawn(move || {
            for _ in 0..3 {
                // Catch the interruption and keep going; the flag stays set
                // so the next sleep reports it again
                if this_task::sleep_for(Duration::from_millis(50)).is_err() {
                    o2.fetch_add(1, Ordering::SeqCst);
                }
            }
        })
        .unwrap();
        this_task::yield_now();
        h.cancel();
    });
    assert_eq!(observed.load(Ordering::SeqCst), 3);
}

#[test]
fn test_yield_is_not_a_cancellation_point() {
    let reached = Arc::new(AtomicBool::new(false));
    let r = reached.clone();
    run_checked(move || {
        let r2 = r.clone();
        let h = taskrt::spawn(move || {
            this_task::yield_now();
            this_task::yield_now();
            r2.store(true, Ordering::SeqCst);
        })
        .unwrap();
        h.cancel();
    });
    assert!(
        reached.load(Ordering::SeqCst),
        "yield aborted a canceled task"
    );
}

#[test]
fn test_cancel_before_first_run_skips_the_body() {
    let ran = Arc::new(AtomicBool::new(false));
    let r = ran.clone();
    run_checked(move || {
        let r2 = r.clone();
        let h = taskrt::spawn(move || {
            r2.store(true, Ordering::SeqCst);
        })
        .unwrap();
        h.cancel();
        // Only now does the spawned task get its first slice
    });
    assert!(!ran.load(Ordering::SeqCst), "canceled task body still ran");
}

#[test]
fn test_shutdown_cancels_all_tasks() {
    let interrupted = Arc::new(AtomicUsize::new(0));
    let i = interrupted.clone();
    run_checked(move || {
        for _ in 0..5 {
            let i2 = i.clone();
            taskrt::spawn(move || {
                if this_task::sleep_for(Duration::from_secs(30)).is_err() {
                    i2.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();
        }
        this_task::yield_now();
        taskrt::shutdown();
        // This task is canceled too; observe it and keep going
        let r = this_task::sleep_for(Duration::from_secs(30));
        assert!(r.is_err());
    });
    assert_eq!(interrupted.load(Ordering::SeqCst), 5);
}

#[test]
fn test_cancel_task_by_id() {
    let hit = Arc::new(AtomicBool::new(false));
    let h = hit.clone();
    run_checked(move || {
        let h2 = h.clone();
        let handle = taskrt::spawn(move || {
            if this_task::sleep_for(Duration::from_secs(30)).is_err() {
                h2.store(true, Ordering::SeqCst);
            }
        })
        .unwrap();
        this_task::yield_now();
        assert!(taskrt::cancel_task(handle.id()));
        assert!(!taskrt::cancel_task(u64::MAX));
    });
    assert!(hit.load(Ordering::SeqCst));
}
