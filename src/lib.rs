//! Cooperative job scheduling with rule-based mutual exclusion.
//!
//! ## Scope
//! This crate runs asynchronous units of work ("jobs") on a managed, elastic
//! thread pool while guaranteeing that jobs touching overlapping resources
//! never execute concurrently. Overlap is expressed through [`ScheduleRule`]
//! conflict predicates; jobs whose rules conflict with an active job are
//! parked on that job's blocking chain and released when it finishes.
//!
//! ## Key invariants
//! - Two jobs with conflicting rules never have overlapping running intervals.
//!   Promotion from waiting to running happens under the scheduler's single
//!   mutex, so two workers can never pick conflicting jobs.
//! - Jobs of equal priority and no rule conflict start in schedule order.
//! - The lock manager's wait-for graph is empty whenever no thread holds or
//!   waits for a tracked resource. Deadlocks among reentrant locks and rule
//!   regions are detected at acquisition time and resolved by suspending one
//!   participant's locks; no participant ever sees a deadlock error.
//! - Cancellation is cooperative: a running job is only flagged through its
//!   [`Progress`] handle, never preempted.
//!
//! ## Flow
//! `JobSpec -> Scheduler::create_job -> schedule -> (sleep queue | ready queue)
//! -> worker picks next conflict-free job -> run -> end -> blocking chain
//! released -> listeners notified`
//!
//! ## Notable entry points
//! - [`Scheduler`]: the central authority; owns queues, the running set, the
//!   worker pool, and the lock manager.
//! - [`JobSpec`] / [`JobId`]: describing and addressing units of work.
//! - [`ScheduleRule`] / [`MultiRule`] / [`NamedRule`]: conflict predicates.
//! - [`OrderedLock`] and [`Scheduler::begin_rule`]: explicit mutual exclusion
//!   for non-job code, tracked in the same deadlock graph as job rules.

pub mod job;
pub mod listener;
pub mod locks;
pub mod progress;
pub mod rule;
pub mod scheduler;

pub use job::{JobId, JobSpec, JobState, JobStatus, Priority};
pub use listener::{JobEvent, JobEventListener};
pub use locks::{LockError, LockManager, OrderedLock};
pub use progress::{Progress, ProgressProvider};
pub use rule::{MultiRule, NamedRule, ScheduleRule};
pub use scheduler::{JoinError, RuleError, Scheduler, SchedulerConfig};
