//! Priority-ordered job queues.
//!
//! Both the ready and sleep queues order by `(start_time, priority rank,
//! schedule sequence)`. The sequence tie-break preserves FIFO among jobs of
//! equal priority scheduled back-to-back; start time dominates so that a
//! priority's fixed scheduling delay naturally orders eligibility.

use std::collections::BTreeSet;

use crate::job::JobId;

/// Ordering key for a queued job. Lower sorts first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct QueueKey {
    /// Milliseconds since scheduler start; `u64::MAX` = sleeping forever.
    pub start: u64,
    pub rank: u8,
    /// Schedule-time sequence number (not creation order).
    pub seq: u64,
}

/// One of the two scheduler queues. Thin wrapper over an ordered set; all
/// synchronization lives in the scheduler core.
#[derive(Debug, Default)]
pub(crate) struct JobQueue {
    entries: BTreeSet<(QueueKey, JobId)>,
}

impl JobQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn insert(&mut self, key: QueueKey, job: JobId) {
        let inserted = self.entries.insert((key, job));
        assert!(inserted, "job already present in queue");
    }

    /// Removing a job that is not queued is a broken invariant.
    pub(crate) fn remove(&mut self, key: QueueKey, job: JobId) {
        let removed = self.entries.remove(&(key, job));
        assert!(removed, "job not present in queue");
    }

    /// Earliest start time in the queue, if any.
    pub(crate) fn first_start(&self) -> Option<u64> {
        self.entries.iter().next().map(|(k, _)| k.start)
    }

    /// Jobs whose start time has arrived, removed in queue order.
    pub(crate) fn take_eligible(&mut self, now: u64) -> Vec<(QueueKey, JobId)> {
        let mut out = Vec::new();
        while let Some(&(key, job)) = self.entries.iter().next() {
            if key.start > now {
                break;
            }
            self.entries.remove(&(key, job));
            out.push((key, job));
        }
        out
    }

    /// Snapshot of the current order (cheap: queues are small).
    pub(crate) fn ordered(&self) -> Vec<(QueueKey, JobId)> {
        self.entries.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(start: u64, rank: u8, seq: u64) -> QueueKey {
        QueueKey { start, rank, seq }
    }

    #[test]
    fn orders_by_start_then_rank_then_seq() {
        let mut q = JobQueue::new();
        q.insert(key(10, 2, 3), JobId(3));
        q.insert(key(10, 0, 4), JobId(4));
        q.insert(key(5, 4, 5), JobId(5));
        q.insert(key(10, 0, 1), JobId(1));

        let order: Vec<u64> = q.ordered().iter().map(|(_, j)| j.0).collect();
        assert_eq!(order, vec![5, 1, 4, 3]);
    }

    #[test]
    fn take_eligible_respects_now() {
        let mut q = JobQueue::new();
        q.insert(key(5, 0, 1), JobId(1));
        q.insert(key(20, 0, 2), JobId(2));
        q.insert(key(u64::MAX, 0, 3), JobId(3));

        let eligible = q.take_eligible(10);
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].1, JobId(1));
        assert_eq!(q.len(), 2);
        assert_eq!(q.first_start(), Some(20));
    }

    #[test]
    #[should_panic(expected = "job not present in queue")]
    fn removing_absent_job_panics() {
        let mut q = JobQueue::new();
        q.remove(key(1, 1, 1), JobId(9));
    }
}
