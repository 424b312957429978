//! Job identity, attributes, and lifecycle vocabulary.
//!
//! A job is described by a [`JobSpec`] (name, priority, optional rule, work
//! closure) and addressed afterwards through an opaque Copy [`JobId`] handle.
//! Records live inside the scheduler; clients never hold the record itself.
//!
//! ## Lifecycle
//!
//! ```text
//!            schedule(delay>0)          wake time elapses
//!   NONE ─────────────────────▶ SLEEPING ─────────────────▶ WAITING
//!     │                                                        │
//!     │ schedule(delay=0)                                      │ selected by
//!     └───────────────────────────────────────────────────────▶│ worker
//!                                                              ▼
//!                              rule conflict ◀──────────── RUNNING
//!                            BLOCKED ─────▶ WAITING           │
//!                            (chained)   (chain released)     │ end
//!                                                              ▼
//!                                                            NONE
//! ```

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::progress::Progress;
use crate::rule::ScheduleRule;

/// Opaque job handle: the job's creation sequence number.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(pub(crate) u64);

impl fmt::Debug for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

/// Discrete priority levels, each with a fixed scheduling delay added before
/// the job becomes eligible. Lower-variance work gets the shorter delay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Priority {
    Interactive,
    Short,
    Long,
    Build,
    Decorate,
}

impl Priority {
    /// Delay applied when `schedule` is called without an explicit delay.
    pub fn scheduling_delay(self) -> Duration {
        match self {
            Priority::Interactive => Duration::ZERO,
            Priority::Short => Duration::from_millis(50),
            Priority::Long => Duration::from_millis(100),
            Priority::Build => Duration::from_millis(500),
            Priority::Decorate => Duration::from_millis(1000),
        }
    }

    /// Queue ordering rank; lower runs first among equally-eligible jobs.
    pub(crate) fn rank(self) -> u8 {
        match self {
            Priority::Interactive => 0,
            Priority::Short => 1,
            Priority::Long => 2,
            Priority::Build => 3,
            Priority::Decorate => 4,
        }
    }
}

/// Current position in the lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobState {
    /// Not queued, not running. Initial and terminal state.
    None,
    /// Queued with a wake time in the future (or indefinite).
    Sleeping,
    /// Eligible (or about to become eligible) for selection by a worker.
    Waiting,
    /// Parked on a running job's blocking chain due to a rule conflict.
    Blocked,
    Running,
}

/// Terminal result of one run. Cancellation is a normal outcome, not an
/// error; a panicking job body is reported as `Error`, never as a crashed
/// worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Ok,
    Error(String),
    Canceled,
}

/// The work callback. Invoked on a worker thread; expected to poll the
/// progress handle for cooperative cancellation.
pub type WorkFn = dyn Fn(&Progress) -> JobStatus + Send + Sync;

/// Family-membership predicate, consulted by `find` and the family
/// operations with an opaque family token.
pub type FamilyFn = dyn Fn(&dyn Any) -> bool + Send + Sync;

/// Pre-schedule guard; returning `false` turns `schedule` into a no-op.
pub type GuardFn = dyn Fn() -> bool + Send + Sync;

/// Everything needed to create a job.
///
/// Built fluently:
///
/// ```
/// use jobs_rs::{JobSpec, JobStatus, Priority, NamedRule};
///
/// let spec = JobSpec::new("index", |_progress| JobStatus::Ok)
///     .priority(Priority::Short)
///     .rule(NamedRule::new("workspace/index"));
/// ```
pub struct JobSpec {
    pub(crate) name: Arc<str>,
    pub(crate) priority: Priority,
    pub(crate) rule: Option<Arc<dyn ScheduleRule>>,
    pub(crate) system: bool,
    pub(crate) work: Arc<WorkFn>,
    pub(crate) family: Option<Arc<FamilyFn>>,
    pub(crate) should_schedule: Option<Arc<GuardFn>>,
}

impl JobSpec {
    pub fn new<F>(name: impl AsRef<str>, work: F) -> Self
    where
        F: Fn(&Progress) -> JobStatus + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(name.as_ref()),
            priority: Priority::Long,
            rule: None,
            system: false,
            work: Arc::new(work),
            family: None,
            should_schedule: None,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn rule(mut self, rule: Arc<dyn ScheduleRule>) -> Self {
        self.rule = Some(rule);
        self
    }

    /// System jobs are excluded from default (`None`-family) queries.
    pub fn system(mut self, system: bool) -> Self {
        self.system = system;
        self
    }

    pub fn family<F>(mut self, belongs_to: F) -> Self
    where
        F: Fn(&dyn Any) -> bool + Send + Sync + 'static,
    {
        self.family = Some(Arc::new(belongs_to));
        self
    }

    pub fn should_schedule<F>(mut self, guard: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.should_schedule = Some(Arc::new(guard));
        self
    }
}

impl fmt::Debug for JobSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobSpec")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("rule", &self.rule)
            .field("system", &self.system)
            .finish()
    }
}
