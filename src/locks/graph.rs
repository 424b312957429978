//! Wait-for graph with cycle detection and lock suspension.
//!
//! Nodes are threads and tracked locks (ordered locks plus the virtual locks
//! standing in for scheduling rules). Edges are "thread holds lock" (with a
//! reentrancy depth) and "thread waits for lock". All mutation happens under
//! the lock manager's mutex; this module holds no synchronization of its own.
//!
//! # Model
//!
//! ```text
//!   threads: T -> { waits_for: Option<L>, held: [L..], suspended: [(L, depth)..] }
//!   locks:   L -> { state: Free | Held{owner, depth} | Suspended{owner, depth},
//!                   waiters, is_rule }
//!
//!   cycle:   T0 --waits--> L0 --held-by--> T1 --waits--> L1 --held-by--> T0
//! ```
//!
//! A blocked thread waits for at most one lock, so cycle detection is a walk
//! along `waits_for`/owner edges rather than a general DFS. When a walk from
//! the acquiring thread returns to it, a cycle exists and is resolved by
//! *suspending* every lock held by one participant: each such lock becomes
//! acquirable by others while its owner and depth are remembered, and the
//! victim reacquires them (in original order) before its own `acquire`
//! returns.
//!
//! # Invariants
//!
//! - A lock in `Suspended{owner, ..}` state has a matching entry in
//!   `owner`'s suspension ledger; the ledger entry survives the lock being
//!   lent to (and later freed by) a third thread.
//! - `held` reflects acquisition order; the ledger reflects suspension order.
//! - The graph is empty (zero nodes) whenever no thread holds or waits for
//!   any tracked resource.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::ThreadId;

pub(crate) type LockKey = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LockState {
    Free,
    Held { owner: ThreadId, depth: u32 },
    Suspended { owner: ThreadId, depth: u32 },
}

#[derive(Debug)]
pub(crate) struct LockNode {
    pub state: LockState,
    /// Threads currently blocked with `waits_for == this lock`.
    pub waiters: usize,
    /// Virtual locks standing in for scheduling rules. Suspending one does
    /// not unblock its graph waiters (the scheduler owns rule grants), so
    /// victim selection skips edges that point at rule locks.
    pub is_rule: bool,
    pub label: Arc<str>,
}

#[derive(Debug, Default)]
pub(crate) struct ThreadNode {
    pub waits_for: Option<LockKey>,
    pub held: Vec<LockKey>,
    /// Locks revoked from this thread by deadlock resolution, with the depth
    /// to restore, in suspension order.
    pub suspended: Vec<(LockKey, u32)>,
    /// Monotonic stamp of when this thread last started blocking.
    pub blocked_stamp: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ResumeStep {
    /// Suspension ledger is empty; nothing to restore.
    Done,
    /// The next suspended lock is held by another thread; wait for it.
    Blocked(LockKey),
}

pub(crate) struct Graph {
    locks: HashMap<LockKey, LockNode>,
    threads: HashMap<ThreadId, ThreadNode>,
    next_key: LockKey,
    stamp: u64,
}

impl Graph {
    pub(crate) fn new() -> Self {
        Self {
            locks: HashMap::new(),
            threads: HashMap::new(),
            next_key: 0,
            stamp: 0,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.locks.is_empty() && self.threads.is_empty()
    }

    pub(crate) fn alloc_key(&mut self) -> LockKey {
        let k = self.next_key;
        self.next_key += 1;
        k
    }

    pub(crate) fn contains_lock(&self, key: LockKey) -> bool {
        self.locks.contains_key(&key)
    }

    pub(crate) fn ensure_lock(&mut self, key: LockKey, label: &Arc<str>, is_rule: bool) {
        self.locks.entry(key).or_insert_with(|| LockNode {
            state: LockState::Free,
            waiters: 0,
            is_rule,
            label: Arc::clone(label),
        });
    }

    fn thread_mut(&mut self, t: ThreadId) -> &mut ThreadNode {
        self.threads.entry(t).or_default()
    }

    /// Record `t` blocking on `key`. Re-waiting on the same lock keeps the
    /// original stamp so victim selection sees when blocking began.
    pub(crate) fn set_wait(&mut self, t: ThreadId, key: LockKey) {
        let previous = self.thread_mut(t).waits_for;
        if previous == Some(key) {
            return;
        }
        if let Some(old) = previous {
            if let Some(node) = self.locks.get_mut(&old) {
                node.waiters -= 1;
            }
        }
        self.stamp += 1;
        let stamp = self.stamp;
        let tn = self.thread_mut(t);
        tn.waits_for = Some(key);
        tn.blocked_stamp = stamp;
        self.locks
            .get_mut(&key)
            .expect("wait edge added for untracked lock")
            .waiters += 1;
    }

    /// Retract `t`'s wait edge. Returns the lock it was waiting for, so the
    /// caller can prune a node this was the last reference to.
    pub(crate) fn clear_wait(&mut self, t: ThreadId) -> Option<LockKey> {
        let tn = self.threads.get_mut(&t)?;
        let old = tn.waits_for.take()?;
        if let Some(node) = self.locks.get_mut(&old) {
            node.waiters -= 1;
        }
        Some(old)
    }

    /// Attempt to take `key` for `t`. Resumption of `t`'s own ledger must
    /// already be complete (see [`Graph::resume_step`]).
    pub(crate) fn try_enter(&mut self, t: ThreadId, key: LockKey) -> bool {
        let node = self.locks.get_mut(&key).expect("untracked lock");
        match node.state {
            LockState::Free => {
                node.state = LockState::Held { owner: t, depth: 1 };
                self.thread_mut(t).held.push(key);
                true
            }
            LockState::Held { owner, depth } if owner == t => {
                node.state = LockState::Held {
                    owner,
                    depth: depth + 1,
                };
                true
            }
            LockState::Suspended { owner, depth } if owner == t => {
                // Untouched since suspension: resume and re-enter in one step.
                node.state = LockState::Held {
                    owner: t,
                    depth: depth + 1,
                };
                self.ledger_remove(t, key);
                self.thread_mut(t).held.push(key);
                true
            }
            LockState::Suspended { .. } => {
                // Borrow a lock suspended from another thread; its owner and
                // depth stay recorded in that thread's ledger.
                node.state = LockState::Held { owner: t, depth: 1 };
                self.thread_mut(t).held.push(key);
                true
            }
            LockState::Held { .. } => false,
        }
    }

    /// Restore as many of `t`'s suspended locks as possible, in suspension
    /// order. Stops at the first lock currently held by another thread.
    pub(crate) fn resume_step(&mut self, t: ThreadId) -> ResumeStep {
        loop {
            let Some(&(key, depth)) = self.threads.get(&t).and_then(|tn| tn.suspended.first())
            else {
                return ResumeStep::Done;
            };
            let node = self.locks.get_mut(&key).expect("suspended lock untracked");
            match node.state {
                LockState::Suspended { owner, .. } if owner == t => {
                    node.state = LockState::Held { owner: t, depth };
                }
                LockState::Free => {
                    // Was lent out and released; reclaim with original depth.
                    node.state = LockState::Held { owner: t, depth };
                }
                _ => return ResumeStep::Blocked(key),
            }
            let tn = self.thread_mut(t);
            tn.suspended.remove(0);
            tn.held.push(key);
        }
    }

    /// Decrement `t`'s hold on `key`; frees it at depth zero.
    ///
    /// Also covers the canceled-waiter path: a thread whose locks were
    /// suspended while it waited may release one of them before any further
    /// acquire resumes it, in which case only the ledger is adjusted.
    pub(crate) fn release(&mut self, t: ThreadId, key: LockKey) {
        let node = self.locks.get_mut(&key).expect("released untracked lock");
        match node.state {
            LockState::Held { owner, depth } if owner == t => {
                if depth > 1 {
                    node.state = LockState::Held {
                        owner,
                        depth: depth - 1,
                    };
                } else {
                    node.state = LockState::Free;
                    self.remove_held(t, key);
                }
            }
            LockState::Suspended { owner, depth } if owner == t => {
                if depth > 1 {
                    node.state = LockState::Suspended {
                        owner,
                        depth: depth - 1,
                    };
                    self.ledger_set_depth(t, key, depth - 1);
                } else {
                    node.state = LockState::Free;
                    self.ledger_remove(t, key);
                }
            }
            LockState::Held { .. } | LockState::Free => {
                // Suspended and lent out (or lent and since freed).
                let adjusted = self.ledger_decrement(t, key);
                assert!(adjusted, "lock released by a thread that does not own it");
            }
            LockState::Suspended { .. } => {
                panic!("lock released by a thread that does not own it");
            }
        }
    }

    /// Walk `waits_for`/owner edges from `start`. Returns the hops
    /// `(waiter, waited_lock)` of a cycle through `start`, or `None`.
    pub(crate) fn cycle_from(&self, start: ThreadId) -> Option<Vec<(ThreadId, LockKey)>> {
        let mut hops: Vec<(ThreadId, LockKey)> = Vec::new();
        let mut cur = start;
        loop {
            let lock = self.threads.get(&cur).and_then(|tn| tn.waits_for)?;
            hops.push((cur, lock));
            let owner = match self.locks.get(&lock).map(|n| n.state) {
                Some(LockState::Held { owner, .. }) => owner,
                // Free or suspended: no edge, the waiter will re-race.
                _ => return None,
            };
            if owner == start {
                return Some(hops);
            }
            if hops.iter().any(|&(t, _)| t == owner) {
                // A cycle not involving `start`; its participants resolve it.
                return None;
            }
            cur = owner;
        }
    }

    /// Deterministic victim rule: among cycle participants that hold an
    /// ordered (non-rule) lock some participant waits on, suspend the one
    /// that blocked most recently.
    pub(crate) fn pick_victim(&self, hops: &[(ThreadId, LockKey)]) -> Option<ThreadId> {
        let mut best: Option<(ThreadId, u64)> = None;
        for (i, &(_, lock)) in hops.iter().enumerate() {
            if self.locks.get(&lock).map_or(true, |n| n.is_rule) {
                continue;
            }
            let holder = if i + 1 < hops.len() {
                hops[i + 1].0
            } else {
                hops[0].0
            };
            let stamp = self
                .threads
                .get(&holder)
                .map(|tn| tn.blocked_stamp)
                .unwrap_or(0);
            if best.map_or(true, |(_, s)| stamp > s) {
                best = Some((holder, stamp));
            }
        }
        best.map(|(t, _)| t)
    }

    /// Revoke every lock held by `victim`, remembering owner and depth.
    /// Returns whether anything was suspended.
    pub(crate) fn suspend_all(&mut self, victim: ThreadId) -> bool {
        let held = match self.threads.get_mut(&victim) {
            Some(tn) => std::mem::take(&mut tn.held),
            None => return false,
        };
        let any = !held.is_empty();
        for key in held {
            let node = self.locks.get_mut(&key).expect("held lock untracked");
            let depth = match node.state {
                LockState::Held { owner, depth } => {
                    assert!(owner == victim, "held list out of sync with lock state");
                    depth
                }
                _ => panic!("held list out of sync with lock state"),
            };
            node.state = LockState::Suspended {
                owner: victim,
                depth,
            };
            self.thread_mut(victim).suspended.push((key, depth));
        }
        any
    }

    #[cfg(test)]
    pub(crate) fn lock_state(&self, key: LockKey) -> Option<LockState> {
        self.locks.get(&key).map(|n| n.state)
    }

    pub(crate) fn lock_label(&self, key: LockKey) -> Option<Arc<str>> {
        self.locks.get(&key).map(|n| Arc::clone(&n.label))
    }

    /// Drop a lock node once it is free, unwatched, and absent from every
    /// suspension ledger. A lent-out lock can be `Free` while its original
    /// owner still expects to reclaim it on resume; such a node must stay.
    pub(crate) fn prune_lock(&mut self, key: LockKey) {
        if let Some(node) = self.locks.get(&key) {
            if node.state == LockState::Free && node.waiters == 0 && !self.ledger_references(key) {
                self.locks.remove(&key);
            }
        }
    }

    fn ledger_references(&self, key: LockKey) -> bool {
        self.threads
            .values()
            .any(|tn| tn.suspended.iter().any(|&(k, _)| k == key))
    }

    /// Drop a thread node once it holds nothing and waits for nothing.
    pub(crate) fn prune_thread(&mut self, t: ThreadId) {
        if let Some(tn) = self.threads.get(&t) {
            if tn.waits_for.is_none() && tn.held.is_empty() && tn.suspended.is_empty() {
                self.threads.remove(&t);
            }
        }
    }

    fn remove_held(&mut self, t: ThreadId, key: LockKey) {
        let tn = self.thread_mut(t);
        let idx = tn
            .held
            .iter()
            .position(|&k| k == key)
            .expect("released lock missing from held list");
        tn.held.remove(idx);
    }

    fn ledger_remove(&mut self, t: ThreadId, key: LockKey) {
        let tn = self.thread_mut(t);
        let idx = tn
            .suspended
            .iter()
            .position(|&(k, _)| k == key)
            .expect("suspended lock missing from ledger");
        tn.suspended.remove(idx);
    }

    fn ledger_set_depth(&mut self, t: ThreadId, key: LockKey, depth: u32) {
        let tn = self.thread_mut(t);
        let entry = tn
            .suspended
            .iter_mut()
            .find(|(k, _)| *k == key)
            .expect("suspended lock missing from ledger");
        entry.1 = depth;
    }

    fn ledger_decrement(&mut self, t: ThreadId, key: LockKey) -> bool {
        let Some(tn) = self.threads.get_mut(&t) else {
            return false;
        };
        let Some(idx) = tn.suspended.iter().position(|&(k, _)| k == key) else {
            return false;
        };
        if tn.suspended[idx].1 > 1 {
            tn.suspended[idx].1 -= 1;
        } else {
            tn.suspended.remove(idx);
        }
        true
    }
}
