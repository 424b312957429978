//! Lifecycle listener fan-out.
//!
//! Listener sets are immutable snapshots replaced copy-on-write: add/remove
//! swap in a freshly cloned vector under a small mutex, while dispatch
//! iterates a snapshot without holding any lock. Third-party listener code
//! therefore never runs under a subsystem mutex, and a panicking listener is
//! caught, logged, and cannot stop notification of the remaining listeners.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tracing::error;

use crate::job::{JobId, JobStatus};

/// Payload delivered with every lifecycle event.
#[derive(Clone, Debug)]
pub struct JobEvent {
    pub job: JobId,
    pub name: Arc<str>,
    /// Set only for `done` events.
    pub status: Option<JobStatus>,
}

/// Observer of job lifecycle transitions. All methods default to no-ops so
/// implementors override only what they care about.
#[allow(unused_variables)]
pub trait JobEventListener: Send + Sync {
    /// The job entered the queues.
    fn scheduled(&self, event: &JobEvent) {}
    /// Veto point: fired after selection, before the body runs. A listener
    /// may cancel the job here and it will end without running.
    fn about_to_run(&self, event: &JobEvent) {}
    fn running(&self, event: &JobEvent) {}
    fn sleeping(&self, event: &JobEvent) {}
    fn awake(&self, event: &JobEvent) {}
    /// Terminal: `event.status` carries the result.
    fn done(&self, event: &JobEvent) {}
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum EventKind {
    Scheduled,
    AboutToRun,
    Running,
    Sleeping,
    Awake,
    Done,
}

pub(crate) type ListenerSnapshot = Arc<Vec<Arc<dyn JobEventListener>>>;

/// Copy-on-write listener collection.
pub(crate) struct ListenerSet {
    inner: Mutex<ListenerSnapshot>,
}

impl ListenerSet {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Arc::new(Vec::new())),
        }
    }

    pub(crate) fn add(&self, listener: Arc<dyn JobEventListener>) {
        let mut guard = self.inner.lock().expect("listener set poisoned");
        let mut next = guard.as_ref().clone();
        next.push(listener);
        *guard = Arc::new(next);
    }

    /// Remove by identity. Unknown listeners are ignored.
    pub(crate) fn remove(&self, listener: &Arc<dyn JobEventListener>) {
        let mut guard = self.inner.lock().expect("listener set poisoned");
        let next: Vec<_> = guard
            .iter()
            .filter(|l| !Arc::ptr_eq(l, listener))
            .cloned()
            .collect();
        *guard = Arc::new(next);
    }

    pub(crate) fn snapshot(&self) -> ListenerSnapshot {
        Arc::clone(&self.inner.lock().expect("listener set poisoned"))
    }
}

/// Deliver one event to every listener in `snapshot`, isolating panics.
pub(crate) fn dispatch(snapshot: &[Arc<dyn JobEventListener>], kind: EventKind, event: &JobEvent) {
    for listener in snapshot {
        let outcome = catch_unwind(AssertUnwindSafe(|| match kind {
            EventKind::Scheduled => listener.scheduled(event),
            EventKind::AboutToRun => listener.about_to_run(event),
            EventKind::Running => listener.running(event),
            EventKind::Sleeping => listener.sleeping(event),
            EventKind::Awake => listener.awake(event),
            EventKind::Done => listener.done(event),
        }));
        if let Err(payload) = outcome {
            error!(
                job = event.job.0,
                event = ?kind,
                panic = panic_message(payload.as_ref()),
                "job listener panicked during notification"
            );
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}
