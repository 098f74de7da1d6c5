//! Flush work queue.
//!
//! A [`WorkUnit`] is owned by whoever holds it: the queue until it is popped,
//! the storage server afterwards. Dropping the unit is what frees it, so it is
//! freed exactly once whether the flush succeeds, fails, or the unit is still
//! queued at shutdown.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use tierdb_core::metrics::Stats;

/// Completion state shared by all work units of a connection.
pub(crate) struct WorkTracker {
    pending: AtomicU64,
    pub(crate) flush_cond: Condvar,
    pub(crate) flush_mutex: Mutex<()>,
    stats: Stats,
}

impl WorkTracker {
    pub(crate) fn new(stats: Stats) -> Self {
        Self {
            pending: AtomicU64::new(0),
            flush_cond: Condvar::new(),
            flush_mutex: Mutex::new(()),
            stats,
        }
    }

    /// Work units created but not yet freed.
    pub(crate) fn pending(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }

    pub(crate) fn notify(&self) {
        let _guard = self.flush_mutex.lock();
        self.flush_cond.notify_all();
    }
}

/// Flush one generation of a tiered tree.
pub struct WorkUnit {
    pub tiered_uri: String,
    pub id: u32,
    tracker: Arc<WorkTracker>,
}

impl WorkUnit {
    pub(crate) fn new(tracker: &Arc<WorkTracker>, tiered_uri: &str, id: u32) -> Self {
        tracker.pending.fetch_add(1, Ordering::AcqRel);
        Self {
            tiered_uri: tiered_uri.to_string(),
            id,
            tracker: Arc::clone(tracker),
        }
    }
}

impl std::fmt::Debug for WorkUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkUnit")
            .field("tiered_uri", &self.tiered_uri)
            .field("id", &self.id)
            .finish()
    }
}

impl Drop for WorkUnit {
    fn drop(&mut self) {
        self.tracker.pending.fetch_sub(1, Ordering::AcqRel);
        self.tracker.stats.record_work_freed();
        self.tracker.notify();
    }
}

/// FIFO of work units.
#[derive(Default)]
pub(crate) struct WorkQueue {
    units: Mutex<VecDeque<WorkUnit>>,
}

impl WorkQueue {
    pub(crate) fn push(&self, unit: WorkUnit) {
        self.units.lock().push_back(unit);
    }

    pub(crate) fn pop(&self) -> Option<WorkUnit> {
        self.units.lock().pop_front()
    }

    /// Free everything still queued.
    pub(crate) fn drain(&self) -> usize {
        let units: Vec<WorkUnit> = self.units.lock().drain(..).collect();
        units.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_and_single_free() {
        let stats = Stats::new();
        let tracker = Arc::new(WorkTracker::new(stats.clone()));
        let queue = WorkQueue::default();
        for id in 1..=3 {
            queue.push(WorkUnit::new(&tracker, "tiered:t", id));
        }
        assert_eq!(tracker.pending(), 3);

        let ids: Vec<u32> = std::iter::from_fn(|| queue.pop()).map(|u| u.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(queue.pop().is_none());
        assert_eq!(tracker.pending(), 0);
        assert_eq!(stats.snapshot().work_freed, 3);
    }

    #[test]
    fn test_drain_frees_queued_units() {
        let stats = Stats::new();
        let tracker = Arc::new(WorkTracker::new(stats.clone()));
        let queue = WorkQueue::default();
        queue.push(WorkUnit::new(&tracker, "tiered:t", 1));
        queue.push(WorkUnit::new(&tracker, "tiered:t", 2));
        assert_eq!(queue.drain(), 2);
        assert_eq!(tracker.pending(), 0);
        assert_eq!(stats.snapshot().work_freed, 2);
    }
}
