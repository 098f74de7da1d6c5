//! # Randomized Workload Driver
//!
//! Interleaves the transactions of several simulated workers against a
//! [`MemStore`], logging every operation through the oracle, re-checking each
//! transaction before it commits, replaying random historic operations, and
//! periodically rolling the store back to stable and replaying everything
//! still covered.

use std::ops::RangeInclusive;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use tierdb_core::error::{Error, Result};
use tierdb_core::types::Timestamp;

use crate::snap::{OpKind, OracleConfig, Resolution, RollbackVerifier, SnapTracker};
use crate::store::{MemStore, MemTxn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadConfig {
    pub workers: usize,
    /// Keys loaded before the run; inserts append after them.
    pub keys: u64,
    /// Transactions to resolve before stopping.
    pub transactions: usize,
    pub max_ops: usize,
    pub seed: u64,
    pub oracle: OracleConfig,
    /// Move stable forward every N resolved transactions, `0` to never.
    pub stable_every: usize,
    /// Distance oldest trails stable by.
    pub oldest_lag: u64,
    /// Roll back to stable every N resolved transactions, `0` to never.
    pub rollback_every: usize,
    /// Chance an otherwise successful transaction rolls back anyway.
    pub abort_ratio: f64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            keys: 100,
            transactions: 1000,
            max_ops: 8,
            seed: 0,
            oracle: OracleConfig::default(),
            stable_every: 10,
            oldest_lag: 50,
            rollback_every: 0,
            abort_ratio: 0.1,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadReport {
    pub committed: u64,
    pub rolled_back: u64,
    /// Rollbacks forced by a write conflict.
    pub conflicts: u64,
    pub operations: u64,
    /// Historic operations replayed one at a time.
    pub replayed: u64,
    pub rts_runs: u64,
    pub rts_replayed: u64,
}

struct OpenTxn<'a> {
    txn: MemTxn<'a>,
    remaining: usize,
}

struct KeySpace {
    next_insert: u64,
    serial: u64,
    reverse: bool,
}

impl KeySpace {
    fn pick(&self, rng: &mut StdRng) -> u64 {
        rng.gen_range(1..self.next_insert)
    }

    fn value(&mut self, keyno: u64) -> Vec<u8> {
        self.serial += 1;
        format!("{:010}.{}", keyno, self.serial).into_bytes()
    }

    /// Truncate bounds as logged (`keyno`, `last`) plus the key range they
    /// cover. `0` is an open end.
    fn truncate_bounds(&self, rng: &mut StdRng) -> (u64, u64, RangeInclusive<u64>) {
        let low = self.pick(rng);
        let high = low + rng.gen_range(0..8);
        let open_start = rng.gen_ratio(1, 10);
        let open_stop = rng.gen_ratio(1, 10);
        if self.reverse {
            let start = if open_start { 0 } else { high };
            let stop = if open_stop { 0 } else { low };
            let hi = if start == 0 { u64::MAX } else { start };
            (start, stop, stop..=hi)
        } else {
            let start = if open_start { 0 } else { low };
            let stop = if open_stop { 0 } else { high };
            let hi = if stop == 0 { u64::MAX } else { stop };
            (start, stop, start..=hi)
        }
    }
}

/// One operation of an open transaction, logged only if it succeeded.
fn step(rng: &mut StdRng, txn: &mut MemTxn<'_>, tracker: &mut SnapTracker, keys: &mut KeySpace) -> Result<()> {
    match rng.gen_range(0..100) {
        0..=39 => {
            let keyno = keys.pick(rng);
            let found = txn.search(keyno);
            tracker.track(OpKind::Read, keyno, 0, found.as_deref());
        }
        40..=54 => {
            let keyno = keys.next_insert;
            keys.next_insert += 1;
            let value = keys.value(keyno);
            txn.update(keyno, value.clone())?;
            tracker.track(OpKind::Insert, keyno, 0, Some(&value));
        }
        55..=84 => {
            let keyno = keys.pick(rng);
            let value = keys.value(keyno);
            txn.update(keyno, value.clone())?;
            tracker.track(OpKind::Update, keyno, 0, Some(&value));
        }
        85..=96 => {
            let keyno = keys.pick(rng);
            txn.remove(keyno)?;
            tracker.track(OpKind::Remove, keyno, 0, None);
        }
        _ => {
            let (start, stop, range) = keys.truncate_bounds(rng);
            txn.truncate(range)?;
            tracker.track(OpKind::Truncate, start, stop, None);
        }
    }
    Ok(())
}

/// Run a workload to completion. Any mismatch the oracle finds is returned
/// as a `Corruption` error.
pub fn run(config: &WorkloadConfig) -> Result<WorkloadReport> {
    if config.workers == 0 || config.keys == 0 || config.max_ops == 0 {
        return Err(Error::invalid("workload needs workers, keys and operations"));
    }
    let store = MemStore::new();
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut clock: Timestamp = 1;

    {
        let mut load = store.begin(0)?;
        let mut keys = KeySpace {
            next_insert: 1,
            serial: 0,
            reverse: false,
        };
        for keyno in 1..=config.keys {
            load.update(keyno, keys.value(keyno))?;
        }
        load.commit(clock)?;
    }

    let mut keys = KeySpace {
        next_insert: config.keys + 1,
        serial: config.keys,
        reverse: config.oracle.reverse,
    };
    let mut trackers: Vec<SnapTracker> = (0..config.workers)
        .map(|w| SnapTracker::new(config.oracle.clone(), config.seed ^ (w as u64 + 1)))
        .collect();
    let mut open: Vec<Option<OpenTxn<'_>>> = (0..config.workers).map(|_| None).collect();
    let mut verifier = RollbackVerifier::new();
    let mut report = WorkloadReport::default();
    let mut resolved = 0usize;

    while resolved < config.transactions {
        let w = rng.gen_range(0..config.workers);
        let tracker = &mut trackers[w];

        if open[w].is_none() {
            let (_, stable) = store.timestamps();
            // Every commit timestamp handed out later is newer than `clock`.
            tracker.op_init(clock, true, stable);
            open[w] = Some(OpenTxn {
                txn: store.begin(clock)?,
                remaining: rng.gen_range(1..=config.max_ops),
            });
            continue;
        }
        let Some(current) = open[w].as_mut() else { continue };

        if current.remaining > 0 {
            current.remaining -= 1;
            report.operations += 1;
            match step(&mut rng, &mut current.txn, tracker, &mut keys) {
                Ok(()) => continue,
                Err(Error::Rollback { message }) => {
                    debug!("worker {} conflict: {}", w, message);
                    report.conflicts += 1;
                    report.rolled_back += 1;
                    tracker.repeat_update(Resolution::RolledBack);
                    if let Some(done) = open[w].take() {
                        done.txn.rollback();
                    }
                }
                Err(e) => return Err(e),
            }
        } else {
            let Some(done) = open[w].take() else { continue };
            if rng.gen_bool(config.abort_ratio.clamp(0.0, 1.0)) {
                tracker.repeat_update(Resolution::RolledBack);
                done.txn.rollback();
                report.rolled_back += 1;
            } else {
                tracker.repeat_txn(&done.txn)?;
                clock += 1;
                done.txn.commit(clock)?;
                tracker.repeat_update(Resolution::Committed(clock));
                report.committed += 1;
            }
            if rng.gen_ratio(1, 4) && tracker.repeat_single(&store)? {
                report.replayed += 1;
            }
        }
        resolved += 1;

        if config.stable_every > 0 && resolved % config.stable_every == 0 {
            // Oldest may not pass a reader that is still open.
            let pinned = open.iter().flatten().map(|o| o.txn.read_ts()).min().unwrap_or(clock);
            store.set_stable(clock)?;
            store.set_oldest(clock.saturating_sub(config.oldest_lag).min(pinned))?;
        }

        if config.rollback_every > 0 && resolved % config.rollback_every == 0 {
            for (tracker, slot) in trackers.iter_mut().zip(open.iter_mut()) {
                if let Some(o) = slot.take() {
                    tracker.repeat_update(Resolution::RolledBack);
                    o.txn.rollback();
                    report.rolled_back += 1;
                }
            }
            store.rollback_to_stable()?;
            let (oldest, stable) = store.timestamps();
            let count = verifier.repeat_rollback(&store, &mut trackers, oldest, stable)?;
            report.rts_runs += 1;
            report.rts_replayed += count as u64;
        }
    }

    info!(
        "workload done: {} committed, {} rolled back, {} replayed, {} replayed after rollback_to_stable",
        report.committed, report.rolled_back, report.replayed, report.rts_replayed
    );
    Ok(report)
}
