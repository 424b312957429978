//! Scheduler facade: the public surface of the subsystem.
//!
//! [`Scheduler`] owns four loosely-coupled pieces behind one `Arc`: the
//! [`core`] state machine (single mutex), the elastic worker [`pool`], the
//! [`LockManager`], and the global listener set. Every public operation
//! follows the same shape: lock the core, transition, collect deferred
//! notices, unlock, then deliver the notices. Client code (job bodies,
//! listeners, rule predicates via conflict checks excepted) therefore never
//! runs under the core mutex.
//!
//! ```text
//!   client ──▶ Scheduler ──▶ Mutex<Core> ──▶ notices ──▶ listeners
//!                 │                              │
//!                 │                              └─▶ Pool (unpark/spawn)
//!                 └─▶ LockManager (rule locks, deadlock graph)
//! ```

pub(crate) mod core;
pub(crate) mod pool;
pub(crate) mod queue;

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use tracing::error;

use crate::job::{JobId, JobSpec, JobState, JobStatus, Priority};
use crate::listener::{
    dispatch, panic_message, EventKind, JobEvent, JobEventListener, ListenerSet, ListenerSnapshot,
};
use crate::locks::{LockManager, OrderedLock};
use crate::progress::{Progress, ProgressProvider};
use crate::rule::ScheduleRule;
use crate::scheduler::core::{
    Core, Grant, ImplicitCancel, JobKind, JobRecord, Notice, RunToken, WorkerOutcome,
};
use crate::scheduler::pool::Pool;

/// Granularity of blocked waits in `join` and `begin_rule`; bounds
/// cancellation latency.
const WAIT_SLICE: Duration = Duration::from_millis(20);

/// Tunables, validated once at construction.
pub struct SchedulerConfig {
    /// Workers kept alive even when idle.
    pub min_workers: usize,
    /// Soft ceiling on pool size; interactive jobs may exceed it.
    pub max_workers: usize,
    /// Idle time after which a worker above the minimum exits.
    pub worker_retirement: Duration,
    /// Poll interval for `join_family`.
    pub family_join_poll: Duration,
    /// Optional per-job progress wiring.
    pub progress_provider: Option<Arc<dyn ProgressProvider>>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 25,
            worker_retirement: Duration::from_secs(60),
            family_join_poll: Duration::from_millis(100),
            progress_provider: None,
        }
    }
}

impl SchedulerConfig {
    /// Misconfiguration is a programming error, caught before any thread
    /// starts.
    pub fn validate(&self) {
        assert!(self.min_workers >= 1, "pool needs at least one worker");
        assert!(
            self.max_workers >= self.min_workers,
            "max_workers below min_workers"
        );
        assert!(
            !self.worker_retirement.is_zero(),
            "worker retirement must be positive"
        );
        assert!(
            !self.family_join_poll.is_zero(),
            "family join poll must be positive"
        );
    }
}

impl fmt::Debug for SchedulerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerConfig")
            .field("min_workers", &self.min_workers)
            .field("max_workers", &self.max_workers)
            .field("worker_retirement", &self.worker_retirement)
            .field("family_join_poll", &self.family_join_poll)
            .field("progress_provider", &self.progress_provider.is_some())
            .finish()
    }
}

/// Failure modes of the blocking `join` operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinError {
    /// The supplied progress handle was canceled while waiting.
    Canceled,
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::Canceled => write!(f, "join canceled"),
        }
    }
}

impl std::error::Error for JoinError {}

/// Failure modes of `begin_rule`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleError {
    /// Canceled while waiting for the rule to become available.
    Canceled,
}

impl fmt::Display for RuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleError::Canceled => write!(f, "rule wait canceled"),
        }
    }
}

impl std::error::Error for RuleError {}

/// One `begin_rule`/job-body nesting level on a thread. Only the outermost
/// real rule region carries an implicit job; nested contained regions and
/// null-rule regions are bookkeeping only.
struct RuleFrame {
    rule: Option<Arc<dyn ScheduleRule>>,
    job: Option<JobId>,
}

fn rule_ptr_eq(a: &Option<Arc<dyn ScheduleRule>>, b: &Option<Arc<dyn ScheduleRule>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        _ => false,
    }
}

/// Condvar listener bridging the `done` event to a blocked `join` caller.
struct JoinWaiter {
    done: Mutex<bool>,
    cond: Condvar,
}

impl JoinWaiter {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn wait(&self, timeout: Duration) -> bool {
        let done = self.done.lock().expect("join waiter poisoned");
        if *done {
            return true;
        }
        let (done, _) = self
            .cond
            .wait_timeout(done, timeout)
            .expect("join waiter poisoned");
        *done
    }
}

impl JobEventListener for JoinWaiter {
    fn done(&self, _event: &JobEvent) {
        let mut done = self.done.lock().expect("join waiter poisoned");
        *done = true;
        self.cond.notify_all();
    }
}

pub(crate) struct Inner {
    pool: Pool,
    cfg: SchedulerConfig,
    origin: Instant,
    core: Mutex<Core>,
    global: ListenerSet,
    locks: LockManager,
    rule_stacks: Mutex<HashMap<ThreadId, Vec<RuleFrame>>>,
    next_job_id: AtomicU64,
}

impl Inner {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn lock_core(&self) -> std::sync::MutexGuard<'_, Core> {
        self.core.lock().expect("scheduler core poisoned")
    }

    pub(crate) fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Deliver deferred side effects collected under the core mutex. Must be
    /// called with no subsystem mutex held.
    fn flush(&self, notices: Vec<Notice>) {
        for notice in notices {
            match notice {
                Notice::Event { kind, event, local } => self.dispatch_event(kind, &event, &local),
                Notice::PoolSignal { priority } => self.pool.job_queued(priority),
                Notice::RuleWait { waiter, lock } => self.locks.rule_wait(waiter, lock),
                Notice::RuleGrant { grant } => grant.set(),
            }
        }
    }

    fn dispatch_event(&self, kind: EventKind, event: &JobEvent, local: &ListenerSnapshot) {
        dispatch(&self.global.snapshot(), kind, event);
        dispatch(local, kind, event);
    }

    /// Worker entry: ask the core for work on the calling thread.
    pub(crate) fn next_outcome(&self) -> WorkerOutcome {
        let me = thread::current().id();
        let mut notices = Vec::new();
        let outcome = self
            .lock_core()
            .next_job(self.now_ms(), me, &self.locks, &mut notices);
        self.flush(notices);
        outcome
    }

    /// Execute one job on the calling worker thread, end to end.
    pub(crate) fn run_job(&self, token: RunToken) {
        let me = thread::current().id();
        {
            let mut stacks = self.rule_stacks.lock().expect("rule stacks poisoned");
            stacks.entry(me).or_default().push(RuleFrame {
                rule: token.rule.clone(),
                job: None,
            });
        }

        let event = JobEvent {
            job: token.id,
            name: Arc::clone(&token.name),
            status: None,
        };
        // Veto point: an about_to_run listener may cancel the job and the
        // body will never run.
        self.dispatch_event(EventKind::AboutToRun, &event, &token.local);
        let status = if token.progress.is_canceled() {
            JobStatus::Canceled
        } else {
            self.dispatch_event(EventKind::Running, &event, &token.local);
            let work = Arc::clone(&token.work);
            let progress = token.progress.clone();
            match catch_unwind(AssertUnwindSafe(|| work(&progress))) {
                Ok(status) => status,
                Err(payload) => {
                    let message = panic_message(payload.as_ref()).to_string();
                    error!(job = token.id.0, panic = %message, "job body panicked");
                    JobStatus::Error(message)
                }
            }
        };

        {
            let mut stacks = self.rule_stacks.lock().expect("rule stacks poisoned");
            let stack = stacks.get_mut(&me).expect("worker rule frame missing");
            let frame = stack.pop().expect("worker rule frame missing");
            assert!(
                frame.job.is_none() && rule_ptr_eq(&frame.rule, &token.rule),
                "job body left a rule region open"
            );
            if stack.is_empty() {
                stacks.remove(&me);
            }
        }

        let mut notices = Vec::new();
        {
            let mut core = self.lock_core();
            if let Some(key) = core.record(token.id).rule_lock {
                self.locks.release_rule_lock(me, key);
            }
            core.end_job(token.id, status, self.now_ms(), &self.locks, &mut notices);
        }
        self.flush(notices);
    }
}

/// Handle to the job-scheduling subsystem. Dropping it shuts the worker pool
/// down, canceling queued jobs and flagging running ones.
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    pub fn with_config(cfg: SchedulerConfig) -> Self {
        cfg.validate();
        let (min, max, retirement) = (cfg.min_workers, cfg.max_workers, cfg.worker_retirement);
        let inner = Arc::new_cyclic(|weak| Inner {
            pool: Pool::new(min, max, retirement, weak.clone()),
            cfg,
            origin: Instant::now(),
            core: Mutex::new(Core::new()),
            global: ListenerSet::new(),
            locks: LockManager::new(),
            rule_stacks: Mutex::new(HashMap::new()),
            next_job_id: AtomicU64::new(0),
        });
        Self { inner }
    }

    /// Register a job. The job starts in `NONE`; nothing runs until
    /// [`schedule`](Self::schedule).
    pub fn create_job(&self, spec: JobSpec) -> JobId {
        let id = JobId(self.inner.next_job_id.fetch_add(1, Ordering::Relaxed));
        let progress = match &self.inner.cfg.progress_provider {
            Some(provider) => provider.create_progress(id),
            None => Progress::new(),
        };
        let record = JobRecord {
            name: spec.name,
            priority: spec.priority,
            rule: spec.rule,
            system: spec.system,
            work: Some(spec.work),
            family: spec.family,
            should_schedule: spec.should_schedule,
            state: JobState::None,
            queue_key: None,
            status: None,
            blocked_by: None,
            progress,
            thread: None,
            kind: JobKind::Normal,
            rule_lock: None,
            listeners: Arc::new(ListenerSet::new()),
        };
        self.inner.lock_core().insert_record(id, record);
        id
    }

    /// Make the job eligible after its priority's scheduling delay.
    pub fn schedule(&self, job: JobId) {
        self.schedule_after(job, Duration::ZERO);
    }

    /// Make the job eligible after an explicit delay; it sleeps until then.
    pub fn schedule_after(&self, job: JobId, delay: Duration) {
        // The guard is client code: consult it without the core mutex.
        let guard = self.inner.lock_core().record(job).should_schedule.clone();
        if let Some(guard) = guard {
            if !guard() {
                return;
            }
        }
        let mut notices = Vec::new();
        self.inner.lock_core().schedule(
            job,
            delay.as_millis() as u64,
            self.inner.now_ms(),
            &mut notices,
        );
        self.inner.flush(notices);
    }

    /// Request cancellation. `true` means the job is already terminal; a
    /// running job is only flagged and ends when its body returns.
    pub fn cancel(&self, job: JobId) -> bool {
        let mut notices = Vec::new();
        let done = self.inner.lock_core().cancel(job, &mut notices);
        self.inner.flush(notices);
        done
    }

    /// Block until the job reaches `NONE`. Returns immediately for a job
    /// that was never scheduled (or already finished).
    pub fn join(&self, job: JobId, progress: Option<&Progress>) -> Result<(), JoinError> {
        loop {
            let waiter = {
                let core = self.inner.lock_core();
                if core.state(job) == JobState::None {
                    return Ok(());
                }
                // Registered under the core mutex: the done notice for this
                // run has not been snapshotted yet, so it cannot be missed.
                let waiter = Arc::new(JoinWaiter::new());
                core.record(job)
                    .listeners
                    .add(Arc::clone(&waiter) as Arc<dyn JobEventListener>);
                waiter
            };
            let outcome = loop {
                if waiter.wait(WAIT_SLICE) {
                    break Ok(());
                }
                if progress.map_or(false, |p| p.is_canceled()) {
                    break Err(JoinError::Canceled);
                }
            };
            {
                let core = self.inner.lock_core();
                if core.contains(job) {
                    let listener = Arc::clone(&waiter) as Arc<dyn JobEventListener>;
                    core.record(job).listeners.remove(&listener);
                }
            }
            outcome?;
            // Loop: the job may have been rescheduled before we observed NONE.
        }
    }

    /// Block until no job of the family remains active. `None` waits for
    /// every non-system job.
    pub fn join_family(
        &self,
        family: Option<&dyn Any>,
        progress: Option<&Progress>,
    ) -> Result<(), JoinError> {
        loop {
            if self.inner.lock_core().find(family).is_empty() {
                return Ok(());
            }
            if progress.map_or(false, |p| p.is_canceled()) {
                return Err(JoinError::Canceled);
            }
            thread::sleep(self.inner.cfg.family_join_poll);
        }
    }

    /// Put a queued job to sleep indefinitely. Returns whether it will
    /// stay asleep (running and blocked jobs cannot sleep).
    pub fn sleep(&self, job: JobId) -> bool {
        let mut notices = Vec::new();
        let slept = self.inner.lock_core().sleep(job, &mut notices);
        self.inner.flush(notices);
        slept
    }

    /// Make a sleeping job eligible now.
    pub fn wake_up(&self, job: JobId) {
        self.wake_up_after(job, Duration::ZERO);
    }

    /// Re-arm a sleeping job's wake time.
    pub fn wake_up_after(&self, job: JobId, delay: Duration) {
        let mut notices = Vec::new();
        self.inner.lock_core().wake_up(
            job,
            delay.as_millis() as u64,
            self.inner.now_ms(),
            &mut notices,
        );
        self.inner.flush(notices);
    }

    pub fn set_priority(&self, job: JobId, priority: Priority) {
        self.inner.lock_core().set_priority(job, priority);
    }

    /// Replace the job's rule. Forbidden while the job runs.
    pub fn set_rule(&self, job: JobId, rule: Option<Arc<dyn ScheduleRule>>) {
        self.inner.lock_core().set_rule(job, rule);
    }

    /// Active jobs of a family. `None` lists every non-system active job.
    pub fn find(&self, family: Option<&dyn Any>) -> Vec<JobId> {
        self.inner.lock_core().find(family)
    }

    pub fn cancel_family(&self, family: &dyn Any) {
        for job in self.find(Some(family)) {
            self.cancel(job);
        }
    }

    pub fn sleep_family(&self, family: &dyn Any) {
        for job in self.find(Some(family)) {
            self.sleep(job);
        }
    }

    pub fn wake_up_family(&self, family: &dyn Any) {
        for job in self.find(Some(family)) {
            self.wake_up(job);
        }
    }

    pub fn state(&self, job: JobId) -> JobState {
        self.inner.lock_core().state(job)
    }

    /// The thread currently running the job, if it is running.
    pub fn thread(&self, job: JobId) -> Option<ThreadId> {
        self.inner.lock_core().record(job).thread
    }

    /// Result of the most recent completed run, if any.
    pub fn result(&self, job: JobId) -> Option<JobStatus> {
        self.inner.lock_core().record(job).status.clone()
    }

    /// The job's progress handle, shared with its running body.
    pub fn progress(&self, job: JobId) -> Progress {
        self.inner.lock_core().record(job).progress.clone()
    }

    pub fn add_listener(&self, listener: Arc<dyn JobEventListener>) {
        self.inner.global.add(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn JobEventListener>) {
        self.inner.global.remove(listener);
    }

    pub fn add_job_listener(&self, job: JobId, listener: Arc<dyn JobEventListener>) {
        self.inner.lock_core().record(job).listeners.add(listener);
    }

    pub fn remove_job_listener(&self, job: JobId, listener: &Arc<dyn JobEventListener>) {
        self.inner.lock_core().record(job).listeners.remove(listener);
    }

    /// Acquire `rule` on the calling thread until the matching
    /// [`end_rule`](Self::end_rule). Blocks while conflicting jobs run;
    /// participates in deadlock detection like a lock.
    ///
    /// Nesting: inside a running job or an outer region, a non-null rule
    /// must be contained by the enclosing rule (programming error
    /// otherwise) and acquires nothing new.
    pub fn begin_rule(
        &self,
        rule: Option<Arc<dyn ScheduleRule>>,
        progress: &Progress,
    ) -> Result<(), RuleError> {
        let me = thread::current().id();
        {
            let mut stacks = self.inner.rule_stacks.lock().expect("rule stacks poisoned");
            if let Some(stack) = stacks.get_mut(&me) {
                if !stack.is_empty() {
                    if let Some(new_rule) = &rule {
                        let outer = stack
                            .iter()
                            .rev()
                            .find_map(|f| f.rule.clone())
                            .expect("cannot begin a rule inside a rule-less region");
                        assert!(
                            outer.contains(new_rule.as_ref()),
                            "nested rule must be contained by the enclosing rule"
                        );
                    }
                    stack.push(RuleFrame { rule, job: None });
                    return Ok(());
                }
            }
            if rule.is_none() {
                stacks
                    .entry(me)
                    .or_default()
                    .push(RuleFrame { rule: None, job: None });
                return Ok(());
            }
        }
        let rule = rule.expect("checked above");
        self.begin_rule_outermost(me, rule, progress)
    }

    /// Outermost non-null region: an implicit job carries the rule through
    /// the ordinary conflict machinery and the scheduler grants it.
    fn begin_rule_outermost(
        &self,
        me: ThreadId,
        rule: Arc<dyn ScheduleRule>,
        progress: &Progress,
    ) -> Result<(), RuleError> {
        let id = JobId(self.inner.next_job_id.fetch_add(1, Ordering::Relaxed));
        let grant = Arc::new(Grant::new());
        let record = JobRecord {
            name: Arc::from(format!("rule region: {rule:?}")),
            priority: Priority::Interactive,
            rule: Some(Arc::clone(&rule)),
            system: true,
            work: None,
            family: None,
            should_schedule: None,
            state: JobState::None,
            queue_key: None,
            status: None,
            blocked_by: None,
            progress: progress.clone(),
            thread: None,
            kind: JobKind::Implicit {
                thread: me,
                grant: Arc::clone(&grant),
            },
            rule_lock: None,
            listeners: Arc::new(ListenerSet::new()),
        };
        let mut notices = Vec::new();
        {
            let mut core = self.inner.lock_core();
            core.insert_record(id, record);
            core.schedule_implicit(id, self.inner.now_ms(), &self.inner.locks, &mut notices);
        }
        self.inner.flush(notices);

        loop {
            if grant.wait_for(WAIT_SLICE) {
                self.inner.locks.clear_rule_wait(me);
                // Locks lent out while we waited come back before the region
                // is entered.
                self.inner.locks.resume_suspended();
                progress.clear_blocked();
                let mut stacks = self.inner.rule_stacks.lock().expect("rule stacks poisoned");
                stacks.entry(me).or_default().push(RuleFrame {
                    rule: Some(rule),
                    job: Some(id),
                });
                return Ok(());
            }
            if progress.is_canceled() {
                let mut notices = Vec::new();
                let outcome = self.inner.lock_core().cancel_implicit(id, &mut notices);
                self.inner.flush(notices);
                self.inner.locks.clear_rule_wait(me);
                if outcome == ImplicitCancel::AlreadyGranted {
                    // Grant raced the cancellation: give the region back.
                    self.end_rule_job(me, id);
                }
                self.inner.locks.resume_suspended();
                progress.clear_blocked();
                return Err(RuleError::Canceled);
            }
            progress.set_blocked(format!("waiting for rule: {rule:?}"));
        }
    }

    /// Leave the innermost rule region. The rule must be the one passed to
    /// the matching `begin_rule`.
    pub fn end_rule(&self, rule: Option<Arc<dyn ScheduleRule>>) {
        let me = thread::current().id();
        let frame = {
            let mut stacks = self.inner.rule_stacks.lock().expect("rule stacks poisoned");
            let stack = stacks.get_mut(&me).expect("end_rule without begin_rule");
            let frame = stack.pop().expect("end_rule without begin_rule");
            if stack.is_empty() {
                stacks.remove(&me);
            }
            frame
        };
        assert!(
            rule_ptr_eq(&frame.rule, &rule),
            "end_rule does not match the innermost begin_rule"
        );
        if let Some(id) = frame.job {
            self.end_rule_job(me, id);
        }
    }

    fn end_rule_job(&self, owner: ThreadId, id: JobId) {
        let mut notices = Vec::new();
        {
            let mut core = self.inner.lock_core();
            let key = core
                .record(id)
                .rule_lock
                .expect("granted rule region without a rule lock");
            self.inner.locks.release_rule_lock(owner, key);
            core.end_job(id, JobStatus::Ok, self.inner.now_ms(), &self.inner.locks, &mut notices);
            core.remove_implicit(id);
        }
        self.inner.flush(notices);
    }

    /// Create a reentrant lock tracked by this scheduler's deadlock
    /// detector.
    pub fn new_lock(&self, name: impl AsRef<str>) -> OrderedLock {
        self.inner.locks.new_lock(name)
    }

    /// Shared handle to the lock manager.
    pub fn lock_manager(&self) -> LockManager {
        self.inner.locks.clone()
    }

    /// Live worker threads right now.
    pub fn worker_count(&self) -> usize {
        self.inner.pool.worker_count()
    }

    /// Cancel queued jobs, flag running ones, and join every worker. Safe to
    /// call more than once.
    pub fn shutdown(&self) {
        let mut notices = Vec::new();
        {
            let mut core = self.inner.lock_core();
            if core.shutdown {
                return;
            }
            core.drain_for_shutdown(&mut notices);
        }
        self.inner.flush(notices);
        self.inner.pool.shutdown_and_join();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::NamedRule;
    use std::sync::atomic::AtomicBool;

    fn quick_scheduler() -> Scheduler {
        Scheduler::with_config(SchedulerConfig {
            worker_retirement: Duration::from_millis(200),
            ..SchedulerConfig::default()
        })
    }

    #[test]
    fn schedule_runs_job_and_join_returns() {
        let sched = quick_scheduler();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let job = sched.create_job(
            JobSpec::new("t", move |_| {
                flag.store(true, Ordering::Release);
                JobStatus::Ok
            })
            .priority(Priority::Interactive),
        );
        sched.schedule(job);
        sched.join(job, None).unwrap();

        assert!(ran.load(Ordering::Acquire));
        assert_eq!(sched.state(job), JobState::None);
        assert_eq!(sched.result(job), Some(JobStatus::Ok));
        sched.shutdown();
    }

    #[test]
    fn should_schedule_guard_vetoes() {
        let sched = quick_scheduler();
        let job = sched.create_job(
            JobSpec::new("vetoed", |_| JobStatus::Ok).should_schedule(|| false),
        );
        sched.schedule(job);
        assert_eq!(sched.state(job), JobState::None);
        assert_eq!(sched.result(job), None);
        sched.shutdown();
    }

    #[test]
    fn begin_end_rule_round_trip() {
        let sched = quick_scheduler();
        let rule = NamedRule::new("res");
        let progress = Progress::new();
        sched.begin_rule(Some(Arc::clone(&rule)), &progress).unwrap();

        // Nested contained region acquires nothing new.
        let nested = NamedRule::new("res/part");
        sched.begin_rule(Some(Arc::clone(&nested)), &progress).unwrap();
        sched.end_rule(Some(nested));

        sched.end_rule(Some(rule));
        assert!(sched.lock_manager().is_empty());
        sched.shutdown();
    }

    #[test]
    #[should_panic(expected = "nested rule must be contained by the enclosing rule")]
    fn nested_uncontained_rule_is_fatal() {
        let sched = quick_scheduler();
        let progress = Progress::new();
        let outer = NamedRule::new("a");
        sched.begin_rule(Some(outer), &progress).unwrap();
        let unrelated = NamedRule::new("b");
        let _ = sched.begin_rule(Some(unrelated), &progress);
    }

    #[test]
    fn null_rule_region_is_bookkeeping_only() {
        let sched = quick_scheduler();
        let progress = Progress::new();
        sched.begin_rule(None, &progress).unwrap();
        sched.end_rule(None);
        assert!(sched.lock_manager().is_empty());
        sched.shutdown();
    }

    #[test]
    fn join_on_unscheduled_job_returns_immediately() {
        let sched = quick_scheduler();
        let job = sched.create_job(JobSpec::new("idle", |_| JobStatus::Ok));
        sched.join(job, None).unwrap();
        sched.shutdown();
    }
}
