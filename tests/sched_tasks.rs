//! Scheduler and Task Lifecycle Tests
//!
//! Covers spawning, yielding, run-to-completion, spawn ordering, panic
//! containment, detach and cancel-after-exit behavior.

mod common;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::run_checked;
use taskrt::sync::Qutex;
use taskrt::this_task;

#[test]
fn test_run_executes_task() {
    let ran = Arc::new(AtomicUsize::new(0));
    let r = ran.clone();
    run_checked(move || {
        r.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(ran.load(Ordering::SeqCst), 1);
}

#[test]
fn test_yield_fairness() {
    // Ten tasks increment a shared counter under a qutex, yield, then
    // increment again. Every task must see the counter grow between its
    // own two critical sections.
    let final_value = Arc::new(AtomicU64::new(0));
    let done = Arc::new(AtomicUsize::new(0));

    let fv = final_value.clone();
    let d = done.clone();
    run_checked(move || {
        let counter = Arc::new(Qutex::new(0u64));
        for _ in 0..10 {
            let c = counter.clone();
            let d = d.clone();
            taskrt::spawn(move || {
                let first = {
                    let mut g = c.lock();
                    *g += 1;
                    *g
                };
                this_task::yield_now();
                let second = {
                    let mut g = c.lock();
                    *g += 1;
                    *g
                };
                assert!(second > first, "counter went backwards: {} -> {}", first, second);
                d.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        // Wait until every worker ran both halves
        for _ in 0..1000 {
            if d.load(Ordering::SeqCst) == 10 {
                break;
            }
            this_task::yield_now();
        }
        fv.store(*counter.lock(), Ordering::SeqCst);
    });

    assert_eq!(done.load(Ordering::SeqCst), 10);
    assert_eq!(final_value.load(Ordering::SeqCst), 20);
}

#[test]
fn test_spawned_task_runs_before_spawner_resumes() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let o = order.clone();
    run_checked(move || {
        let o2 = o.clone();
        taskrt::spawn(move || {
            o2.lock().unwrap().push("spawned");
        })
        .unwrap();
        this_task::yield_now();
        o.lock().unwrap().push("spawner");
    });
    assert_eq!(*order.lock().unwrap(), vec!["spawned", "spawner"]);
}

#[test]
fn test_task_ids_are_unique_and_increasing() {
    run_checked(|| {
        let a = taskrt::spawn(|| {}).unwrap();
        let b = taskrt::spawn(|| {}).unwrap();
        assert!(b.id() > a.id());
    });
}

#[test]
fn test_panic_in_task_does_not_poison_the_scheduler() {
    let survived = Arc::new(AtomicUsize::new(0));
    let s = survived.clone();
    run_checked(move || {
        taskrt::spawn(|| {
            panic!("intentional test panic");
        })
        .unwrap();
        let s2 = s.clone();
        taskrt::spawn(move || {
            s2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
        this_task::yield_now();
        s.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(survived.load(Ordering::SeqCst), 2);
}

#[test]
fn test_cancel_after_exit_is_noop() {
    let slot = Arc::new(Mutex::new(None));
    let s = slot.clone();
    run_checked(move || {
        *s.lock().unwrap() = Some(taskrt::spawn(|| {}).unwrap());
    });

    let handle = slot.lock().unwrap().take().expect("spawn recorded a handle");
    assert!(handle.is_finished());
    handle.cancel();
    handle.cancel();

    // The scheduler still works afterwards
    let ok = Arc::new(AtomicUsize::new(0));
    let o = ok.clone();
    run_checked(move || {
        o.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(ok.load(Ordering::SeqCst), 1);
}

#[test]
fn test_detached_task_does_not_hold_run_open() {
    run_checked(|| {
        let h = taskrt::spawn(|| {
            // Long sleep; the runtime exits without waiting for it
            let _ = this_task::sleep_for(Duration::from_secs(60));
        })
        .unwrap();
        this_task::yield_now();
        h.detach();
    });
}

#[test]
fn test_set_name_and_state() {
    run_checked(|| {
        this_task::set_name("worker");
        this_task::set_state("testing");
        taskrt::dump_tasks();
    });
}

#[test]
fn test_spawn_threads_run_independent_schedulers() {
    let total = Arc::new(AtomicUsize::new(0));
    let mut joins = Vec::new();
    for _ in 0..4 {
        let t = total.clone();
        joins.push(taskrt::spawn_thread(move || {
            for _ in 0..10 {
                let t = t.clone();
                taskrt::spawn(move || {
                    t.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            }
        }));
    }
    for j in joins {
        j.join().unwrap();
    }
    assert_eq!(total.load(Ordering::SeqCst), 40);
}
