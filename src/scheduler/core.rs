//! Scheduler state machine.
//!
//! Everything in this module runs under the scheduler's single mutex. State
//! transitions never invoke client code directly; instead each operation
//! appends [`Notice`]s that the facade delivers after releasing the mutex
//! (listener callbacks, pool wakeups, lock-graph edges, rule grants). That
//! discipline is what keeps third-party code from deadlocking against the
//! worker pool's own bookkeeping.
//!
//! # Invariants
//!
//! - A job is in at most one of: ready queue, sleep queue, running set, or
//!   exactly one blocking chain. `queue_key` stays valid while blocked so
//!   chain release can restore the original ordering key.
//! - Promotion WAITING -> RUNNING happens here, under the mutex, so two
//!   workers can never simultaneously pick jobs with conflicting rules.
//! - Any running job that heads a blocking chain has a rule, and therefore
//!   a registered virtual rule lock.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::ThreadId;
use std::time::Duration;

use tracing::debug;

use crate::job::{FamilyFn, GuardFn, JobId, JobState, JobStatus, Priority, WorkFn};
use crate::listener::{EventKind, JobEvent, ListenerSet, ListenerSnapshot};
use crate::locks::{LockKey, LockManager};
use crate::progress::Progress;
use crate::rule::{conflicting, ScheduleRule};
use crate::scheduler::queue::{JobQueue, QueueKey};

/// One-shot grant signal for an implicit (`begin_rule`) job.
pub(crate) struct Grant {
    granted: Mutex<bool>,
    cond: Condvar,
}

impl Grant {
    pub(crate) fn new() -> Self {
        Self {
            granted: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn set(&self) {
        let mut g = self.granted.lock().expect("grant poisoned");
        *g = true;
        self.cond.notify_all();
    }

    /// Wait up to `timeout` for the grant. Returns whether it arrived.
    pub(crate) fn wait_for(&self, timeout: Duration) -> bool {
        let g = self.granted.lock().expect("grant poisoned");
        if *g {
            return true;
        }
        let (g, _) = self
            .cond
            .wait_timeout(g, timeout)
            .expect("grant poisoned");
        *g
    }
}

#[derive(Clone)]
pub(crate) enum JobKind {
    Normal,
    /// A `begin_rule` region: runs on its owning client thread, granted by
    /// the scheduler rather than handed to a worker.
    Implicit {
        thread: ThreadId,
        grant: Arc<Grant>,
    },
}

impl JobKind {
    pub(crate) fn is_implicit(&self) -> bool {
        matches!(self, JobKind::Implicit { .. })
    }
}

/// A job record, owned exclusively by the scheduler.
pub(crate) struct JobRecord {
    pub name: Arc<str>,
    pub priority: Priority,
    pub rule: Option<Arc<dyn ScheduleRule>>,
    pub system: bool,
    pub work: Option<Arc<WorkFn>>,
    pub family: Option<Arc<FamilyFn>>,
    pub should_schedule: Option<Arc<GuardFn>>,
    pub state: JobState,
    /// Ordering key; kept while blocked so chain release restores position.
    pub queue_key: Option<QueueKey>,
    pub status: Option<JobStatus>,
    pub blocked_by: Option<JobId>,
    pub progress: Progress,
    pub thread: Option<ThreadId>,
    pub kind: JobKind,
    /// Virtual lock registered for the rule while running.
    pub rule_lock: Option<LockKey>,
    pub listeners: Arc<ListenerSet>,
}

/// Deferred side effects, executed by the facade after unlocking the core.
pub(crate) enum Notice {
    Event {
        kind: EventKind,
        event: JobEvent,
        local: ListenerSnapshot,
    },
    PoolSignal {
        priority: Priority,
    },
    RuleWait {
        waiter: ThreadId,
        lock: LockKey,
    },
    RuleGrant {
        grant: Arc<Grant>,
    },
}

/// What a worker should do next.
pub(crate) enum WorkerOutcome {
    Run(Box<RunToken>),
    /// Nothing runnable yet; sleep at most this long before asking again.
    Sleep(Duration),
    /// Nothing queued at all.
    Idle,
    /// Scheduler is shutting down.
    Exit,
}

/// Everything a worker needs to execute one job outside the core mutex.
pub(crate) struct RunToken {
    pub id: JobId,
    pub name: Arc<str>,
    pub work: Arc<WorkFn>,
    pub rule: Option<Arc<dyn ScheduleRule>>,
    pub rule_lock: Option<LockKey>,
    pub progress: Progress,
    pub local: ListenerSnapshot,
}

/// Outcome of canceling an implicit job that may have been granted first.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ImplicitCancel {
    Canceled,
    AlreadyGranted,
}

pub(crate) struct Core {
    jobs: HashMap<JobId, JobRecord>,
    ready: JobQueue,
    sleeping: JobQueue,
    running: Vec<JobId>,
    chains: HashMap<JobId, Vec<JobId>>,
    next_sched_seq: u64,
    pub shutdown: bool,
}

impl Core {
    pub(crate) fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            ready: JobQueue::new(),
            sleeping: JobQueue::new(),
            running: Vec::new(),
            chains: HashMap::new(),
            next_sched_seq: 0,
            shutdown: false,
        }
    }

    pub(crate) fn insert_record(&mut self, id: JobId, record: JobRecord) {
        let prev = self.jobs.insert(id, record);
        assert!(prev.is_none(), "job id reused");
    }

    pub(crate) fn record(&self, id: JobId) -> &JobRecord {
        self.jobs.get(&id).expect("unknown job handle")
    }

    pub(crate) fn record_mut(&mut self, id: JobId) -> &mut JobRecord {
        self.jobs.get_mut(&id).expect("unknown job handle")
    }

    pub(crate) fn contains(&self, id: JobId) -> bool {
        self.jobs.contains_key(&id)
    }

    fn next_seq(&mut self) -> u64 {
        let s = self.next_sched_seq;
        self.next_sched_seq += 1;
        s
    }

    /// Listener notice for a lifecycle event. Implicit jobs are internal
    /// and fire no events.
    fn event_notice(&self, id: JobId, kind: EventKind, notices: &mut Vec<Notice>) {
        let rec = self.record(id);
        if rec.kind.is_implicit() {
            return;
        }
        notices.push(Notice::Event {
            kind,
            event: JobEvent {
                job: id,
                name: Arc::clone(&rec.name),
                status: if kind == EventKind::Done {
                    rec.status.clone()
                } else {
                    None
                },
            },
            local: rec.listeners.snapshot(),
        });
    }

    /// Enqueue a job. No-op unless the record is in `NONE`.
    pub(crate) fn schedule(
        &mut self,
        id: JobId,
        delay_ms: u64,
        now: u64,
        notices: &mut Vec<Notice>,
    ) {
        if self.shutdown {
            return;
        }
        if self.record(id).state != JobState::None {
            return;
        }
        let seq = self.next_seq();
        let rec = self.record_mut(id);
        rec.status = None;
        rec.progress.reset();

        let effective = if delay_ms > 0 {
            delay_ms
        } else {
            rec.priority.scheduling_delay().as_millis() as u64
        };
        let key = QueueKey {
            start: now.saturating_add(effective),
            rank: rec.priority.rank(),
            seq,
        };
        rec.queue_key = Some(key);
        if delay_ms > 0 {
            rec.state = JobState::Sleeping;
            self.sleeping.insert(key, id);
        } else {
            rec.state = JobState::Waiting;
            self.ready.insert(key, id);
        }
        debug!(job = id.0, delay_ms, "job scheduled");
        self.event_notice(id, EventKind::Scheduled, notices);
        let priority = self.record(id).priority;
        notices.push(Notice::PoolSignal { priority });
    }

    /// Enqueue an implicit (`begin_rule`) job and try to grant it at once.
    pub(crate) fn schedule_implicit(
        &mut self,
        id: JobId,
        now: u64,
        locks: &LockManager,
        notices: &mut Vec<Notice>,
    ) {
        let seq = self.next_seq();
        let rec = self.record_mut(id);
        assert!(rec.kind.is_implicit(), "schedule_implicit on a normal job");
        let key = QueueKey {
            start: now,
            rank: Priority::Interactive.rank(),
            seq,
        };
        rec.queue_key = Some(key);
        rec.state = JobState::Waiting;
        self.ready.insert(key, id);
        self.grant_implicits(now, locks, notices);
    }

    /// Move elapsed sleepers into the ready queue. No `awake` event: only an
    /// explicit `wake_up` fires one.
    fn promote_sleepers(&mut self, now: u64) {
        for (key, id) in self.sleeping.take_eligible(now) {
            let rec = self.record_mut(id);
            assert_eq!(rec.state, JobState::Sleeping, "sleep queue out of sync");
            rec.state = JobState::Waiting;
            self.ready.insert(key, id);
        }
    }

    /// Is any running job, or a job already chained behind one, conflicting
    /// with `rule`? Returns the chain head to park behind.
    fn find_blocker(&self, rule: &Option<Arc<dyn ScheduleRule>>) -> Option<JobId> {
        let rule = rule.as_ref()?;
        for &root in &self.running {
            if let Some(root_rule) = &self.record(root).rule {
                if conflicting(root_rule, rule) {
                    return Some(root);
                }
            }
            if let Some(chain) = self.chains.get(&root) {
                for &member in chain {
                    if let Some(member_rule) = &self.record(member).rule {
                        if conflicting(member_rule, rule) {
                            return Some(root);
                        }
                    }
                }
            }
        }
        None
    }

    /// Park `id` behind `root`, appending to its blocking chain.
    fn block(&mut self, id: JobId, root: JobId, notices: &mut Vec<Notice>) {
        let root_name = Arc::clone(&self.record(root).name);
        let root_lock = self.record(root).rule_lock;
        let key = self.record(id).queue_key.expect("blocked job lost its key");
        self.ready.remove(key, id);

        let rec = self.record_mut(id);
        rec.state = JobState::Blocked;
        rec.blocked_by = Some(root);
        rec.progress
            .set_blocked(format!("waiting for job: {root_name}"));
        let implicit_thread = match &rec.kind {
            JobKind::Implicit { thread, .. } => Some(*thread),
            JobKind::Normal => None,
        };
        self.chains.entry(root).or_default().push(id);
        debug!(job = id.0, root = root.0, "job blocked behind conflicting job");

        if let Some(waiter) = implicit_thread {
            // Feed the rule wait into the deadlock graph: the client thread
            // is effectively waiting on the chain head's rule lock.
            let lock = root_lock.expect("chain head without a rule lock");
            notices.push(Notice::RuleWait { waiter, lock });
        }
    }

    /// Promote `id` to RUNNING and register its rule's virtual lock for
    /// `thread`. Must be called with the candidate still WAITING.
    fn promote(&mut self, id: JobId, thread: ThreadId, locks: &LockManager) {
        let key = self.record(id).queue_key.expect("promoted job lost its key");
        self.ready.remove(key, id);
        let name = Arc::clone(&self.record(id).name);
        let rule_lock = if self.record(id).rule.is_some() {
            Some(locks.register_rule_lock(thread, &name))
        } else {
            None
        };
        let rec = self.record_mut(id);
        rec.state = JobState::Running;
        rec.thread = Some(thread);
        rec.rule_lock = rule_lock;
        self.running.push(id);
    }

    /// Grant every eligible, unconflicted implicit job. Called whenever the
    /// ready queue or running set changes in a way that could unblock one.
    pub(crate) fn grant_implicits(
        &mut self,
        now: u64,
        locks: &LockManager,
        notices: &mut Vec<Notice>,
    ) {
        for (key, id) in self.ready.ordered() {
            if key.start > now {
                break;
            }
            let rec = self.record(id);
            if rec.state != JobState::Waiting || !rec.kind.is_implicit() {
                continue;
            }
            match self.find_blocker(&rec.rule.clone()) {
                Some(root) => self.block(id, root, notices),
                None => {
                    let (thread, grant) = match &self.record(id).kind {
                        JobKind::Implicit { thread, grant } => (*thread, Arc::clone(grant)),
                        JobKind::Normal => unreachable!(),
                    };
                    self.promote(id, thread, locks);
                    notices.push(Notice::RuleGrant { grant });
                }
            }
        }
    }

    /// Worker entry point: the next runnable job, or how long to sleep.
    pub(crate) fn next_job(
        &mut self,
        now: u64,
        worker: ThreadId,
        locks: &LockManager,
        notices: &mut Vec<Notice>,
    ) -> WorkerOutcome {
        if self.shutdown {
            return WorkerOutcome::Exit;
        }
        self.promote_sleepers(now);

        let mut future_start: Option<u64> = None;
        for (key, id) in self.ready.ordered() {
            if key.start > now {
                future_start = Some(key.start);
                break;
            }
            // Entries touched earlier in this scan may have moved.
            let rec = self.record(id);
            if rec.state != JobState::Waiting || rec.queue_key != Some(key) {
                continue;
            }
            let rule = rec.rule.clone();
            if rec.kind.is_implicit() {
                match self.find_blocker(&rule) {
                    Some(root) => self.block(id, root, notices),
                    None => {
                        let (thread, grant) = match &self.record(id).kind {
                            JobKind::Implicit { thread, grant } => (*thread, Arc::clone(grant)),
                            JobKind::Normal => unreachable!(),
                        };
                        self.promote(id, thread, locks);
                        notices.push(Notice::RuleGrant { grant });
                    }
                }
                continue;
            }
            match self.find_blocker(&rule) {
                Some(root) => {
                    self.block(id, root, notices);
                }
                None => {
                    self.promote(id, worker, locks);
                    let rec = self.record(id);
                    return WorkerOutcome::Run(Box::new(RunToken {
                        id,
                        name: Arc::clone(&rec.name),
                        work: Arc::clone(rec.work.as_ref().expect("normal job without work")),
                        rule: rec.rule.clone(),
                        rule_lock: rec.rule_lock,
                        progress: rec.progress.clone(),
                        local: rec.listeners.snapshot(),
                    }));
                }
            }
        }

        let hint = [future_start, self.sleeping.first_start()]
            .into_iter()
            .flatten()
            .min();
        match hint {
            Some(start) if start != u64::MAX => {
                WorkerOutcome::Sleep(Duration::from_millis(start.saturating_sub(now).max(1)))
            }
            _ => WorkerOutcome::Idle,
        }
    }

    /// Terminal transition for a running job; releases its blocking chain.
    /// The caller must already have released the rule's virtual lock.
    pub(crate) fn end_job(
        &mut self,
        id: JobId,
        status: JobStatus,
        now: u64,
        locks: &LockManager,
        notices: &mut Vec<Notice>,
    ) {
        let idx = self
            .running
            .iter()
            .position(|&r| r == id)
            .expect("ended job not in running set");
        self.running.remove(idx);

        let rec = self.record_mut(id);
        assert_eq!(rec.state, JobState::Running, "end_job on non-running job");
        rec.state = JobState::None;
        rec.status = Some(status);
        rec.thread = None;
        rec.rule_lock = None;
        rec.queue_key = None;
        debug!(job = id.0, "job ended");

        for member in self.chains.remove(&id).unwrap_or_default() {
            let rec = self.record_mut(member);
            assert_eq!(rec.state, JobState::Blocked, "chain member not blocked");
            rec.state = JobState::Waiting;
            rec.blocked_by = None;
            rec.progress.clear_blocked();
            let key = rec.queue_key.expect("chained job lost its key");
            let priority = rec.priority;
            self.ready.insert(key, member);
            notices.push(Notice::PoolSignal { priority });
        }

        self.event_notice(id, EventKind::Done, notices);
        self.grant_implicits(now, locks, notices);
    }

    /// Cooperative cancel. `true` means the job is (now) terminal.
    pub(crate) fn cancel(&mut self, id: JobId, notices: &mut Vec<Notice>) -> bool {
        match self.record(id).state {
            // Canceling an idle job succeeds trivially, with no events.
            JobState::None => true,
            JobState::Running => {
                self.record(id).progress.set_canceled();
                false
            }
            JobState::Waiting | JobState::Sleeping => {
                let rec = self.record_mut(id);
                let key = rec.queue_key.take().expect("queued job lost its key");
                let was_sleeping = rec.state == JobState::Sleeping;
                rec.state = JobState::None;
                rec.status = Some(JobStatus::Canceled);
                if was_sleeping {
                    self.sleeping.remove(key, id);
                } else {
                    self.ready.remove(key, id);
                }
                self.event_notice(id, EventKind::Done, notices);
                true
            }
            JobState::Blocked => {
                let root = self.record(id).blocked_by.expect("blocked without root");
                let chain = self.chains.get_mut(&root).expect("missing blocking chain");
                let idx = chain
                    .iter()
                    .position(|&m| m == id)
                    .expect("job not present in its blocking chain");
                chain.remove(idx);
                let rec = self.record_mut(id);
                rec.state = JobState::None;
                rec.status = Some(JobStatus::Canceled);
                rec.blocked_by = None;
                rec.queue_key = None;
                rec.progress.clear_blocked();
                self.event_notice(id, EventKind::Done, notices);
                true
            }
        }
    }

    /// Cancel an implicit job, unless its grant already happened (in which
    /// case the caller owns the rule region and must end it normally).
    pub(crate) fn cancel_implicit(&mut self, id: JobId, notices: &mut Vec<Notice>) -> ImplicitCancel {
        if self.record(id).state == JobState::Running {
            return ImplicitCancel::AlreadyGranted;
        }
        let canceled = self.cancel(id, notices);
        assert!(canceled, "queued implicit job must cancel synchronously");
        self.jobs.remove(&id);
        ImplicitCancel::Canceled
    }

    /// Drop a finished implicit record; they are not client-addressable.
    pub(crate) fn remove_implicit(&mut self, id: JobId) {
        let rec = self.jobs.remove(&id).expect("unknown implicit job");
        assert!(rec.kind.is_implicit());
        assert_eq!(rec.state, JobState::None);
    }

    /// Put a queued job to sleep indefinitely. Running/blocked jobs cannot
    /// sleep; idle jobs succeed trivially.
    pub(crate) fn sleep(&mut self, id: JobId, notices: &mut Vec<Notice>) -> bool {
        match self.record(id).state {
            JobState::None => true,
            JobState::Running | JobState::Blocked => false,
            JobState::Sleeping => {
                let rec = self.record_mut(id);
                let key = rec.queue_key.expect("queued job lost its key");
                self.sleeping.remove(key, id);
                let new_key = QueueKey {
                    start: u64::MAX,
                    ..key
                };
                self.record_mut(id).queue_key = Some(new_key);
                self.sleeping.insert(new_key, id);
                true
            }
            JobState::Waiting => {
                let rec = self.record_mut(id);
                let key = rec.queue_key.expect("queued job lost its key");
                rec.state = JobState::Sleeping;
                let new_key = QueueKey {
                    start: u64::MAX,
                    ..key
                };
                rec.queue_key = Some(new_key);
                self.ready.remove(key, id);
                self.sleeping.insert(new_key, id);
                self.event_notice(id, EventKind::Sleeping, notices);
                true
            }
        }
    }

    /// Wake a sleeping job; with zero delay it becomes eligible immediately.
    pub(crate) fn wake_up(&mut self, id: JobId, delay_ms: u64, now: u64, notices: &mut Vec<Notice>) {
        if self.record(id).state != JobState::Sleeping {
            return;
        }
        let rec = self.record_mut(id);
        let key = rec.queue_key.expect("queued job lost its key");
        let new_key = QueueKey {
            start: now.saturating_add(delay_ms),
            ..key
        };
        rec.queue_key = Some(new_key);
        self.sleeping.remove(key, id);
        if delay_ms == 0 {
            self.record_mut(id).state = JobState::Waiting;
            self.ready.insert(new_key, id);
            self.event_notice(id, EventKind::Awake, notices);
            let priority = self.record(id).priority;
            notices.push(Notice::PoolSignal { priority });
        } else {
            self.sleeping.insert(new_key, id);
        }
    }

    /// Re-rank a queued job. Takes effect on the next schedule for running
    /// or idle jobs.
    pub(crate) fn set_priority(&mut self, id: JobId, priority: Priority) {
        let rec = self.record_mut(id);
        if rec.priority == priority {
            return;
        }
        rec.priority = priority;
        let state = rec.state;
        let Some(key) = rec.queue_key else {
            return;
        };
        let new_key = QueueKey {
            rank: priority.rank(),
            ..key
        };
        match state {
            JobState::Waiting => {
                self.record_mut(id).queue_key = Some(new_key);
                self.ready.remove(key, id);
                self.ready.insert(new_key, id);
            }
            JobState::Sleeping => {
                self.record_mut(id).queue_key = Some(new_key);
                self.sleeping.remove(key, id);
                self.sleeping.insert(new_key, id);
            }
            // Blocked jobs re-enter the ready queue from their stored key
            // when the chain releases; keep its rank current.
            JobState::Blocked => {
                self.record_mut(id).queue_key = Some(new_key);
            }
            JobState::Running | JobState::None => {}
        }
    }

    /// Replace the rule of a not-running job. Changing the rule of a running
    /// job would undermine the conflict scan, so it is a programming error;
    /// blocked jobs are already committed to a chain, so the call no-ops.
    pub(crate) fn set_rule(&mut self, id: JobId, rule: Option<Arc<dyn ScheduleRule>>) {
        let rec = self.record_mut(id);
        assert_ne!(
            rec.state,
            JobState::Running,
            "cannot change the rule of a running job"
        );
        if rec.state == JobState::Blocked {
            return;
        }
        rec.rule = rule;
    }

    /// Snapshot jobs matching a family token. `None` matches every
    /// non-terminal, non-system job; a token consults each job's predicate.
    pub(crate) fn find(&self, family: Option<&dyn Any>) -> Vec<JobId> {
        let mut out: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|(_, rec)| rec.state != JobState::None && !rec.kind.is_implicit())
            .filter(|(_, rec)| match family {
                None => !rec.system,
                Some(token) => rec.family.as_ref().map_or(false, |f| f(token)),
            })
            .map(|(&id, _)| id)
            .collect();
        out.sort();
        out
    }

    pub(crate) fn state(&self, id: JobId) -> JobState {
        self.record(id).state
    }

    pub(crate) fn drain_for_shutdown(&mut self, notices: &mut Vec<Notice>) -> Vec<JobId> {
        self.shutdown = true;
        let queued: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|(_, rec)| {
                matches!(
                    rec.state,
                    JobState::Waiting | JobState::Sleeping | JobState::Blocked
                )
            })
            .map(|(&id, _)| id)
            .collect();
        for id in &queued {
            // Flag progress too: a `begin_rule` caller blocked on a grant
            // notices the cancellation and unwinds.
            self.record(*id).progress.set_canceled();
            self.cancel(*id, notices);
        }
        assert_eq!(self.ready.len(), 0, "ready queue survived shutdown drain");
        assert_eq!(self.sleeping.len(), 0, "sleep queue survived shutdown drain");
        // Running jobs are only flagged; their workers finish cooperatively.
        let running = self.running.clone();
        for id in &running {
            self.record(*id).progress.set_canceled();
        }
        running
    }

    #[cfg(test)]
    pub(crate) fn running_len(&self) -> usize {
        self.running.len()
    }
}
