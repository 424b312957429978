//! Deadlock detection and transparent resolution across ordered locks.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use jobs_rs::{JobSpec, JobStatus, LockError, LockManager, Priority, Progress, Scheduler, SchedulerConfig};

fn quick_scheduler() -> Scheduler {
    Scheduler::with_config(SchedulerConfig {
        worker_retirement: Duration::from_millis(200),
        ..SchedulerConfig::default()
    })
}

/// Opt-in diagnostics: `RUST_LOG=jobs_rs=debug` shows victim selection.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

#[test]
fn two_party_cycle_resolves_and_both_finish() {
    init_tracing();
    let mgr = LockManager::new();
    let a = mgr.new_lock("a");
    let b = mgr.new_lock("b");
    let ready = Arc::new(Barrier::new(2));
    let finished = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for (first, second) in [(a.clone(), b.clone()), (b.clone(), a.clone())] {
        let ready = Arc::clone(&ready);
        let finished = Arc::clone(&finished);
        handles.push(thread::spawn(move || {
            first.acquire();
            ready.wait(); // both hold their first lock: a real cycle
            second.acquire();
            second.release();
            first.release();
            finished.fetch_add(1, Ordering::SeqCst);
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(finished.load(Ordering::SeqCst), 2);
    assert!(mgr.is_empty(), "resolved deadlock must leave no graph residue");
}

#[test]
fn three_party_ring_resolves() {
    init_tracing();
    let mgr = LockManager::new();
    let locks = [mgr.new_lock("a"), mgr.new_lock("b"), mgr.new_lock("c")];
    let ready = Arc::new(Barrier::new(3));
    let finished = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for i in 0..3 {
        let first = locks[i].clone();
        let second = locks[(i + 1) % 3].clone();
        let ready = Arc::clone(&ready);
        let finished = Arc::clone(&finished);
        handles.push(thread::spawn(move || {
            first.acquire();
            ready.wait();
            second.acquire();
            second.release();
            first.release();
            finished.fetch_add(1, Ordering::SeqCst);
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(finished.load(Ordering::SeqCst), 3);
    assert!(mgr.is_empty());
}

#[test]
fn reentrant_acquire_within_job_bodies() {
    let sched = quick_scheduler();
    let lock = sched.new_lock("shared");
    let hits = Arc::new(AtomicUsize::new(0));

    let mut jobs = Vec::new();
    for i in 0..4 {
        let lock = lock.clone();
        let hits = Arc::clone(&hits);
        let job = sched.create_job(
            JobSpec::new(format!("locker-{i}"), move |_| {
                lock.acquire();
                lock.acquire(); // reentrant
                hits.fetch_add(1, Ordering::SeqCst);
                lock.release();
                lock.release();
                JobStatus::Ok
            })
            .priority(Priority::Interactive),
        );
        jobs.push(job);
        sched.schedule(job);
    }
    for job in jobs {
        sched.join(job, None).unwrap();
    }

    assert_eq!(hits.load(Ordering::SeqCst), 4);
    assert!(sched.lock_manager().is_empty());
    sched.shutdown();
}

#[test]
fn canceled_lock_wait_inside_a_job_unwinds() {
    let sched = quick_scheduler();
    let lock = sched.new_lock("contested");

    lock.acquire(); // test thread holds the lock for the duration

    let body_lock = lock.clone();
    let job = sched.create_job(
        JobSpec::new("waiter", move |progress: &Progress| {
            match body_lock.acquire_canceling(progress) {
                Ok(()) => {
                    body_lock.release();
                    JobStatus::Ok
                }
                Err(LockError::Canceled) => JobStatus::Canceled,
            }
        })
        .priority(Priority::Interactive),
    );
    sched.schedule(job);

    // Let the job reach the lock wait, then cancel it.
    thread::sleep(Duration::from_millis(60));
    sched.cancel(job);
    sched.join(job, None).unwrap();
    assert_eq!(sched.result(job), Some(JobStatus::Canceled));

    lock.release();
    assert!(sched.lock_manager().is_empty());
    sched.shutdown();
}

#[test]
fn repeated_contention_stays_clean() {
    let mgr = LockManager::new();
    let a = mgr.new_lock("a");
    let b = mgr.new_lock("b");
    let start = Arc::new(Barrier::new(2));

    let mut handles = Vec::new();
    for (first, second) in [(a.clone(), b.clone()), (b.clone(), a.clone())] {
        let start = Arc::clone(&start);
        handles.push(thread::spawn(move || {
            start.wait();
            for _ in 0..25 {
                first.acquire();
                second.acquire();
                second.release();
                first.release();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert!(mgr.is_empty());
}
