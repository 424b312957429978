//! Progress/cancellation handles.
//!
//! A [`Progress`] is the cooperative channel between the subsystem and a unit
//! of work: the scheduler and lock manager report *why* a caller is waiting
//! (`set_blocked`), and cancellation is requested by flipping a flag the work
//! body is expected to poll. Nothing here preempts a thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::job::JobId;

/// Shared cancellation + blocked-reason handle. Cheap to clone.
#[derive(Clone, Default)]
pub struct Progress {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    canceled: AtomicBool,
    blocked: Mutex<Option<String>>,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once cancellation has been requested.
    pub fn is_canceled(&self) -> bool {
        self.inner.canceled.load(Ordering::Acquire)
    }

    /// Request cooperative cancellation.
    pub fn set_canceled(&self) {
        self.inner.canceled.store(true, Ordering::Release);
    }

    /// Record why the owning operation is currently waiting.
    pub fn set_blocked(&self, reason: impl Into<String>) {
        *self.inner.blocked.lock().expect("progress mutex poisoned") = Some(reason.into());
    }

    pub fn clear_blocked(&self) {
        *self.inner.blocked.lock().expect("progress mutex poisoned") = None;
    }

    /// The current blocked reason, if any.
    pub fn blocked_reason(&self) -> Option<String> {
        self.inner
            .blocked
            .lock()
            .expect("progress mutex poisoned")
            .clone()
    }

    /// Rearm for the next run of a rescheduled job.
    pub(crate) fn reset(&self) {
        self.inner.canceled.store(false, Ordering::Release);
        self.clear_blocked();
    }
}

impl std::fmt::Debug for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Progress")
            .field("canceled", &self.is_canceled())
            .field("blocked", &self.blocked_reason())
            .finish()
    }
}

/// Boundary contract for callers that want to supply their own monitor
/// wiring per job (for example to bridge into a UI progress service).
pub trait ProgressProvider: Send + Sync {
    fn create_progress(&self, job: JobId) -> Progress;
}
