//! # Statistics
//!
//! Connection-wide counters for schema creation, the file handle cache and
//! tiered storage. Counters are relaxed atomics; a [`StatsSnapshot`] is a
//! point-in-time copy suitable for logging or assertions in tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Statistics collector
#[derive(Clone, Default)]
pub struct Stats {
    inner: Arc<StatsInner>,
}

#[derive(Default)]
struct StatsInner {
    // Schema
    creates: AtomicU64,
    imports: AtomicU64,

    // File handle cache
    fh_opens: AtomicU64,
    fh_closes: AtomicU64,
    fh_races_lost: AtomicU64,

    // Tiered storage
    flush_tier: AtomicU64,
    flush_tier_busy: AtomicU64,
    work_queued: AtomicU64,
    work_dequeued: AtomicU64,
    work_freed: AtomicU64,
    local_removals: AtomicU64,
    tier_switches: AtomicU64,

    panics: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_create(&self) {
        self.inner.creates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_import(&self) {
        self.inner.imports.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fh_open(&self) {
        self.inner.fh_opens.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fh_close(&self) {
        self.inner.fh_closes.fetch_add(1, Ordering::Relaxed);
    }

    /// An opener built a handle but another thread inserted first.
    pub fn record_fh_race_lost(&self) {
        self.inner.fh_races_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush_tier(&self) {
        self.inner.flush_tier.fetch_add(1, Ordering::Relaxed);
    }

    /// Metadata update for a flushed object found the handle busy.
    pub fn record_flush_tier_busy(&self) {
        self.inner.flush_tier_busy.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_work_queued(&self) {
        self.inner.work_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_work_dequeued(&self) {
        self.inner.work_dequeued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_work_freed(&self) {
        self.inner.work_freed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_local_removal(&self) {
        self.inner.local_removals.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tier_switch(&self) {
        self.inner.tier_switches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_panic(&self) {
        self.inner.panics.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current statistics snapshot
    pub fn snapshot(&self) -> StatsSnapshot {
        let i = &self.inner;
        StatsSnapshot {
            creates: i.creates.load(Ordering::Relaxed),
            imports: i.imports.load(Ordering::Relaxed),
            fh_opens: i.fh_opens.load(Ordering::Relaxed),
            fh_closes: i.fh_closes.load(Ordering::Relaxed),
            fh_races_lost: i.fh_races_lost.load(Ordering::Relaxed),
            flush_tier: i.flush_tier.load(Ordering::Relaxed),
            flush_tier_busy: i.flush_tier_busy.load(Ordering::Relaxed),
            work_queued: i.work_queued.load(Ordering::Relaxed),
            work_dequeued: i.work_dequeued.load(Ordering::Relaxed),
            work_freed: i.work_freed.load(Ordering::Relaxed),
            local_removals: i.local_removals.load(Ordering::Relaxed),
            tier_switches: i.tier_switches.load(Ordering::Relaxed),
            panics: i.panics.load(Ordering::Relaxed),
        }
    }
}

/// Statistics snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub creates: u64,
    pub imports: u64,
    pub fh_opens: u64,
    pub fh_closes: u64,
    pub fh_races_lost: u64,
    pub flush_tier: u64,
    pub flush_tier_busy: u64,
    pub work_queued: u64,
    pub work_dequeued: u64,
    pub work_freed: u64,
    pub local_removals: u64,
    pub tier_switches: u64,
    pub panics: u64,
}

impl StatsSnapshot {
    /// Work units queued but not yet freed.
    pub fn work_outstanding(&self) -> u64 {
        self.work_queued.saturating_sub(self.work_freed)
    }
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "schema: creates={} imports={}", self.creates, self.imports)?;
        writeln!(
            f,
            "file handles: opens={} closes={} races_lost={}",
            self.fh_opens, self.fh_closes, self.fh_races_lost
        )?;
        write!(
            f,
            "tiered: flush_tier={} busy={} queued={} dequeued={} freed={} switches={} removals={} panics={}",
            self.flush_tier,
            self.flush_tier_busy,
            self.work_queued,
            self.work_dequeued,
            self.work_freed,
            self.tier_switches,
            self.local_removals,
            self.panics
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_shared_between_clones() {
        let stats = Stats::new();
        let other = stats.clone();
        stats.record_work_queued();
        stats.record_work_queued();
        other.record_work_freed();

        let snap = stats.snapshot();
        assert_eq!(snap.work_queued, 2);
        assert_eq!(snap.work_freed, 1);
        assert_eq!(snap.work_outstanding(), 1);
    }
}
