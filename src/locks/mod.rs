//! Reentrant ordered locks with transparent deadlock resolution.
//!
//! [`LockManager`] owns the wait-for graph; [`OrderedLock`] handles are thin
//! keys into it. Acquisition runs cycle detection synchronously under the
//! graph mutex; a detected cycle is resolved by suspending one participant's
//! locks (see [`graph`]) rather than surfacing an error. Scheduling rules of
//! running jobs and `begin_rule` regions are bridged into the same graph as
//! virtual "rule locks", so rule-vs-lock cycles are detected exactly like
//! lock-vs-lock ones.
//!
//! # Invariants
//!
//! - The graph has zero nodes when no thread holds or waits for anything;
//!   canceled waits and resolved deadlocks fully retract their entries.
//! - A worker's mutexes are never held while blocking here: the manager
//!   never calls back into the scheduler or worker pool.
//! - A thread's suspended locks are reacquired, in original order, before
//!   any later `acquire` on that thread returns.

pub(crate) mod graph;

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::progress::Progress;

pub(crate) use graph::LockKey;
use graph::{Graph, ResumeStep};

/// Granularity of blocked waits; bounds cancellation latency.
const WAIT_SLICE: Duration = Duration::from_millis(20);

/// Failure modes of a cancelable acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockError {
    /// The supplied progress handle was canceled while waiting.
    Canceled,
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::Canceled => write!(f, "lock wait canceled"),
        }
    }
}

impl std::error::Error for LockError {}

struct Sync {
    graph: Mutex<Graph>,
    cond: Condvar,
}

/// Owner of the wait-for graph. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct LockManager {
    sync: Arc<Sync>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            sync: Arc::new(Sync {
                graph: Mutex::new(Graph::new()),
                cond: Condvar::new(),
            }),
        }
    }

    /// Create a reentrant lock tracked by this manager.
    pub fn new_lock(&self, name: impl AsRef<str>) -> OrderedLock {
        let key = self.graph().alloc_key();
        OrderedLock {
            sync: Arc::clone(&self.sync),
            key,
            label: Arc::from(name.as_ref()),
        }
    }

    /// Core liveness property: true when no thread holds or waits for any
    /// tracked resource.
    pub fn is_empty(&self) -> bool {
        self.graph().is_empty()
    }

    fn graph(&self) -> MutexGuard<'_, Graph> {
        self.sync.graph.lock().expect("lock graph poisoned")
    }

    /// Register a running job's rule as a virtual lock owned by `owner`.
    pub(crate) fn register_rule_lock(&self, owner: ThreadId, label: &Arc<str>) -> LockKey {
        let mut g = self.graph();
        let key = g.alloc_key();
        g.ensure_lock(key, label, true);
        assert!(g.try_enter(owner, key), "fresh rule lock must be free");
        key
    }

    /// Release a rule's virtual lock when its job ends or its region exits.
    pub(crate) fn release_rule_lock(&self, owner: ThreadId, key: LockKey) {
        let mut g = self.graph();
        g.release(owner, key);
        g.prune_lock(key);
        g.prune_thread(owner);
        drop(g);
        self.sync.cond.notify_all();
    }

    /// Record that `waiter` (a `begin_rule` caller) is blocked behind the
    /// rule lock `key`, then run cycle resolution. The grant itself comes
    /// from the scheduler; this edge only feeds deadlock detection.
    pub(crate) fn rule_wait(&self, waiter: ThreadId, key: LockKey) {
        let mut g = self.graph();
        if !g.contains_lock(key) {
            // Holder already finished; the grant is imminent.
            return;
        }
        g.set_wait(waiter, key);
        if let Some(hops) = g.cycle_from(waiter) {
            if let Some(victim) = g.pick_victim(&hops) {
                let rule = g.lock_label(key).unwrap_or_else(|| Arc::from("?"));
                debug!(?victim, rule = %rule, "rule wait closed a cycle; suspending victim locks");
                if g.suspend_all(victim) {
                    drop(g);
                    self.sync.cond.notify_all();
                }
            }
        }
    }

    /// Retract `waiter`'s rule-wait edge (grant arrived or wait canceled).
    /// The waited-on lock may already be released by its holder with this
    /// edge as the sole remaining reference, so prune it here too.
    pub(crate) fn clear_rule_wait(&self, waiter: ThreadId) {
        let mut g = self.graph();
        if let Some(key) = g.clear_wait(waiter) {
            g.prune_lock(key);
        }
        g.prune_thread(waiter);
    }

    /// Block until every lock suspended from the current thread has been
    /// reacquired. No-op for threads with an empty ledger.
    pub(crate) fn resume_suspended(&self) {
        let me = thread::current().id();
        let mut g = self.graph();
        loop {
            match g.resume_step(me) {
                ResumeStep::Done => {
                    g.clear_wait(me);
                    g.prune_thread(me);
                    return;
                }
                ResumeStep::Blocked(key) => {
                    g.set_wait(me, key);
                    let (guard, _) = self
                        .sync
                        .cond
                        .wait_timeout(g, WAIT_SLICE)
                        .expect("lock graph poisoned");
                    g = guard;
                }
            }
        }
    }
}

/// A reentrant mutual-exclusion lock participating in deadlock detection.
///
/// Clones address the same lock. Acquire/release must be paired on the same
/// thread; releasing a lock the thread does not own is a programming error.
#[derive(Clone)]
pub struct OrderedLock {
    sync: Arc<Sync>,
    key: LockKey,
    label: Arc<str>,
}

impl fmt::Debug for OrderedLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OrderedLock({})", self.label)
    }
}

impl OrderedLock {
    pub fn name(&self) -> &str {
        &self.label
    }

    /// Block until the lock is acquired. Deadlock with other tracked locks
    /// resolves transparently; the call still returns with the lock held.
    pub fn acquire(&self) {
        let acquired = self
            .acquire_inner(None, None)
            .expect("uncancelable acquire cannot be canceled");
        assert!(acquired, "untimed acquire cannot time out");
    }

    /// Try to acquire within `timeout`. Returns whether the lock was taken.
    pub fn try_acquire_for(&self, timeout: Duration) -> bool {
        self.acquire_inner(Some(timeout), None)
            .expect("uncancelable acquire cannot be canceled")
    }

    /// Acquire, honoring cooperative cancellation. While blocked, the
    /// progress handle carries a blocked reason naming this lock.
    pub fn acquire_canceling(&self, progress: &Progress) -> Result<(), LockError> {
        match self.acquire_inner(None, Some(progress)) {
            Ok(acquired) => {
                assert!(acquired, "untimed acquire cannot time out");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Decrement the reentrancy depth; frees the lock at zero and wakes
    /// waiting threads to re-race for it.
    pub fn release(&self) {
        let me = thread::current().id();
        let mut g = self.sync.graph.lock().expect("lock graph poisoned");
        g.release(me, self.key);
        g.prune_lock(self.key);
        g.prune_thread(me);
        drop(g);
        self.sync.cond.notify_all();
    }

    fn acquire_inner(
        &self,
        timeout: Option<Duration>,
        progress: Option<&Progress>,
    ) -> Result<bool, LockError> {
        let me = thread::current().id();
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut reported_blocked = false;
        let mut g = self.sync.graph.lock().expect("lock graph poisoned");
        loop {
            // Locks suspended while this thread previously waited come back
            // first, in their original order.
            let resume_target = match g.resume_step(me) {
                ResumeStep::Done => None,
                ResumeStep::Blocked(key) => Some(key),
            };

            let blocked_on = match resume_target {
                Some(key) => key,
                None => {
                    g.ensure_lock(self.key, &self.label, false);
                    if g.try_enter(me, self.key) {
                        g.clear_wait(me);
                        drop(g);
                        if reported_blocked {
                            if let Some(p) = progress {
                                p.clear_blocked();
                            }
                        }
                        return Ok(true);
                    }
                    self.key
                }
            };

            g.set_wait(me, blocked_on);
            if let Some(hops) = g.cycle_from(me) {
                if let Some(victim) = g.pick_victim(&hops) {
                    debug!(?victim, lock = %self.label, "deadlock detected; suspending victim locks");
                    if g.suspend_all(victim) && victim != me {
                        // The victim's locks are now acquirable; retry
                        // immediately, our target may be among them.
                        self.sync.cond.notify_all();
                        continue;
                    }
                    self.sync.cond.notify_all();
                }
            }

            if let Some(p) = progress {
                if !reported_blocked {
                    p.set_blocked(format!("waiting for lock: {}", self.label));
                    reported_blocked = true;
                }
            }

            let slice = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        self.unwind_wait(&mut g, me, reported_blocked, progress);
                        return Ok(false);
                    }
                    WAIT_SLICE.min(d - now)
                }
                None => WAIT_SLICE,
            };

            let (guard, _) = self
                .sync
                .cond
                .wait_timeout(g, slice)
                .expect("lock graph poisoned");
            g = guard;

            if let Some(p) = progress {
                if p.is_canceled() {
                    self.unwind_wait(&mut g, me, reported_blocked, progress);
                    return Err(LockError::Canceled);
                }
            }
        }
    }

    /// Retract all wait state created by an unsuccessful acquire. Suspended
    /// locks stay in the ledger; this thread still owns them and resumes on
    /// its next protected-region entry.
    fn unwind_wait(
        &self,
        g: &mut MutexGuard<'_, Graph>,
        me: ThreadId,
        reported_blocked: bool,
        progress: Option<&Progress>,
    ) {
        if let Some(key) = g.clear_wait(me) {
            g.prune_lock(key);
        }
        g.prune_lock(self.key);
        g.prune_thread(me);
        if reported_blocked {
            if let Some(p) = progress {
                p.clear_blocked();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    fn thread_ids(n: usize) -> Vec<ThreadId> {
        (0..n)
            .map(|_| {
                thread::spawn(|| thread::current().id())
                    .join()
                    .expect("id helper thread")
            })
            .collect()
    }

    /// The holder of a rule lock may release it while a rule wait still
    /// points at it; the waiter's retraction is then the last reference and
    /// must take the node with it.
    #[test]
    fn rule_wait_retracted_after_holder_release_empties_graph() {
        let mgr = LockManager::new();
        let ids = thread_ids(2);
        let (owner, waiter) = (ids[0], ids[1]);

        let key = mgr.register_rule_lock(owner, &Arc::from("build"));
        mgr.rule_wait(waiter, key);
        mgr.release_rule_lock(owner, key);
        mgr.clear_rule_wait(waiter);
        assert!(mgr.is_empty(), "retracted rule wait must leave no graph residue");
    }

    #[test]
    fn uncontended_acquire_release_empties_graph() {
        let mgr = LockManager::new();
        let lock = mgr.new_lock("a");
        lock.acquire();
        lock.acquire();
        lock.release();
        lock.release();
        assert!(mgr.is_empty());
    }

    #[test]
    fn timeout_expires_when_lock_is_held_elsewhere() {
        let mgr = LockManager::new();
        let lock = mgr.new_lock("a");
        let l2 = lock.clone();
        let hold = Arc::new(Barrier::new(2));
        let h2 = Arc::clone(&hold);

        let t = thread::spawn(move || {
            l2.acquire();
            h2.wait(); // holder ready
            h2.wait(); // release requested
            l2.release();
        });

        hold.wait();
        assert!(!lock.try_acquire_for(Duration::from_millis(50)));
        hold.wait();
        t.join().unwrap();
        assert!(mgr.is_empty());
    }

    #[test]
    fn canceled_wait_unwinds_graph_state() {
        let mgr = LockManager::new();
        let lock = mgr.new_lock("a");
        let l2 = lock.clone();
        let barrier = Arc::new(Barrier::new(2));
        let b2 = Arc::clone(&barrier);
        let progress = Progress::new();
        let p2 = progress.clone();

        let holder = thread::spawn(move || {
            l2.acquire();
            b2.wait(); // held
            b2.wait(); // waiter canceled and done
            l2.release();
        });

        barrier.wait();
        let canceler = {
            let p = progress.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(60));
                p.set_canceled();
            })
        };
        assert_eq!(lock.acquire_canceling(&p2), Err(LockError::Canceled));
        canceler.join().unwrap();
        barrier.wait();
        holder.join().unwrap();
        assert!(mgr.is_empty(), "canceled wait must leave no graph residue");
    }

    #[test]
    fn blocked_reason_is_reported_and_cleared() {
        let mgr = LockManager::new();
        let lock = mgr.new_lock("db");
        let l2 = lock.clone();
        let barrier = Arc::new(Barrier::new(2));
        let b2 = Arc::clone(&barrier);

        let holder = thread::spawn(move || {
            l2.acquire();
            b2.wait();
            thread::sleep(Duration::from_millis(100));
            l2.release();
        });

        barrier.wait();
        let progress = Progress::new();
        lock.acquire_canceling(&progress).unwrap();
        assert_eq!(progress.blocked_reason(), None);
        lock.release();
        holder.join().unwrap();
        assert!(mgr.is_empty());
    }

    /// Two threads acquiring {a,b} and {b,a}: the classic cycle. Both must
    /// complete and the graph must end empty.
    #[test]
    fn opposite_order_deadlock_resolves() {
        let mgr = LockManager::new();
        let a = mgr.new_lock("a");
        let b = mgr.new_lock("b");
        let done = Arc::new(AtomicUsize::new(0));
        let start = Arc::new(Barrier::new(2));

        let mut handles = Vec::new();
        for (first, second) in [(a.clone(), b.clone()), (b.clone(), a.clone())] {
            let start = Arc::clone(&start);
            let done = Arc::clone(&done);
            handles.push(thread::spawn(move || {
                start.wait();
                for _ in 0..20 {
                    first.acquire();
                    second.acquire();
                    second.release();
                    first.release();
                }
                done.fetch_add(1, Ordering::Relaxed);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(done.load(Ordering::Relaxed), 2);
        assert!(mgr.is_empty());
    }
}
