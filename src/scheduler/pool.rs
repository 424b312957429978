//! Elastic worker pool.
//!
//! Workers are plain OS threads created on demand: a queued job first wakes
//! an idle worker, and only spawns a new thread when none is parked and the
//! pool is below capacity. Interactive jobs may spawn past capacity so a
//! saturated pool of long-running work cannot starve them. Idle workers park
//! on a [`Parker`] with a wake hint from the scheduler and retire after
//! staying idle past the configured threshold, down to the pool minimum.
//!
//! # Invariants
//!
//! - The pool mutex and the scheduler core mutex are never held together:
//!   wakeups happen after the signaling operation has released the core.
//! - `threads` counts live workers exactly; retirement and exit both
//!   decrement it before the thread returns.

use std::sync::{Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_utils::sync::{Parker, Unparker};
use tracing::{debug, warn};

use crate::job::Priority;
use crate::scheduler::core::WorkerOutcome;
use crate::scheduler::Inner;

pub(crate) struct Pool {
    min: usize,
    max: usize,
    retirement: Duration,
    home: Weak<Inner>,
    state: Mutex<PoolState>,
}

struct PoolState {
    threads: usize,
    spawned: u64,
    idle: Vec<(u64, Unparker)>,
    handles: Vec<JoinHandle<()>>,
    shutdown: bool,
}

impl Pool {
    pub(crate) fn new(min: usize, max: usize, retirement: Duration, home: Weak<Inner>) -> Self {
        Self {
            min,
            max,
            retirement,
            home,
            state: Mutex::new(PoolState {
                threads: 0,
                spawned: 0,
                idle: Vec::new(),
                handles: Vec::new(),
                shutdown: false,
            }),
        }
    }

    /// React to a job entering the queues: wake one idle worker, or grow the
    /// pool. Interactive work may grow past `max`.
    pub(crate) fn job_queued(&self, priority: Priority) {
        let unparker = {
            let mut st = self.state.lock().expect("pool state poisoned");
            if st.shutdown {
                return;
            }
            match st.idle.pop() {
                Some((_, unparker)) => Some(unparker),
                None => {
                    if st.threads < self.max {
                        self.spawn_worker(&mut st);
                    } else if priority == Priority::Interactive {
                        debug!(
                            threads = st.threads,
                            "growing past capacity for interactive job"
                        );
                        self.spawn_worker(&mut st);
                    } else {
                        warn!(
                            max = self.max,
                            "worker pool saturated; job waits for a free worker"
                        );
                    }
                    None
                }
            }
        };
        if let Some(unparker) = unparker {
            unparker.unpark();
        }
    }

    fn spawn_worker(&self, st: &mut PoolState) {
        st.threads += 1;
        st.spawned += 1;
        let id = st.spawned;
        let home = Weak::clone(&self.home);
        let retirement = self.retirement;
        let handle = thread::Builder::new()
            .name(format!("job-worker-{id}"))
            .spawn(move || worker_loop(id, home, retirement))
            .expect("failed to spawn worker thread");
        st.handles.push(handle);
        debug!(worker = id, threads = st.threads, "worker spawned");
    }

    /// Park the worker in the idle list. Refused during shutdown so the
    /// caller re-checks for the exit signal instead of sleeping through it.
    fn register_idle(&self, id: u64, unparker: Unparker) -> bool {
        let mut st = self.state.lock().expect("pool state poisoned");
        if st.shutdown {
            return false;
        }
        st.idle.push((id, unparker));
        true
    }

    /// Drop this worker's idle entry, if `job_queued` has not already
    /// claimed it.
    fn deregister_idle(&self, id: u64) {
        let mut st = self.state.lock().expect("pool state poisoned");
        st.idle.retain(|(i, _)| *i != id);
    }

    /// Leave the pool if it is above its minimum size.
    fn try_retire(&self) -> bool {
        let mut st = self.state.lock().expect("pool state poisoned");
        if st.shutdown || st.threads <= self.min {
            return false;
        }
        st.threads -= 1;
        true
    }

    fn worker_exit(&self) {
        let mut st = self.state.lock().expect("pool state poisoned");
        st.threads -= 1;
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.state.lock().expect("pool state poisoned").threads
    }

    /// Stop accepting work, wake every parked worker, and join them all.
    pub(crate) fn shutdown_and_join(&self) {
        let (idle, handles) = {
            let mut st = self.state.lock().expect("pool state poisoned");
            st.shutdown = true;
            (std::mem::take(&mut st.idle), std::mem::take(&mut st.handles))
        };
        for (_, unparker) in idle {
            unparker.unpark();
        }
        let me = thread::current().id();
        for handle in handles {
            if handle.thread().id() != me {
                let _ = handle.join();
            }
        }
    }
}

fn worker_loop(id: u64, home: Weak<Inner>, retirement: Duration) {
    let parker = Parker::new();
    let unparker = parker.unparker().clone();
    let mut idle_since: Option<Instant> = None;
    loop {
        let Some(inner) = home.upgrade() else { return };
        match inner.next_outcome() {
            WorkerOutcome::Run(token) => {
                idle_since = None;
                inner.run_job(*token);
            }
            WorkerOutcome::Exit => {
                inner.pool().worker_exit();
                debug!(worker = id, "worker exiting for shutdown");
                return;
            }
            outcome @ (WorkerOutcome::Sleep(_) | WorkerOutcome::Idle) => {
                let now = Instant::now();
                let since = *idle_since.get_or_insert(now);
                let mut idle_for = now.duration_since(since);
                if idle_for >= retirement {
                    if inner.pool().try_retire() {
                        debug!(worker = id, "idle worker retiring");
                        return;
                    }
                    // At the pool minimum: restart the idle clock.
                    idle_since = Some(now);
                    idle_for = Duration::ZERO;
                }
                let best_before = retirement - idle_for;
                let wait = match outcome {
                    WorkerOutcome::Sleep(hint) => hint.min(best_before),
                    _ => best_before,
                };
                if inner.pool().register_idle(id, unparker.clone()) {
                    drop(inner);
                    parker.park_timeout(wait);
                    if let Some(inner) = home.upgrade() {
                        inner.pool().deregister_idle(id);
                    }
                }
            }
        }
    }
}
