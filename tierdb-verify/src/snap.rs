//! # Snapshot-Isolation Oracle
//!
//! Each worker logs the operations of its transactions into a circular
//! buffer, one record per operation with a copy of the value it read or
//! wrote. When a transaction resolves, every operation no other operation of
//! the same transaction disturbed is marked repeatable, and can later be
//! replayed in a fresh snapshot pinned at the recorded timestamp.
//!
//! ```text
//!   op_init ──> track ... track ──> repeat_txn ──> repeat_update
//!                                                     │
//!              repeat_single / repeat_rollback <──────┘
//! ```
//!
//! With rollback-to-stable checking on, a worker keeps two logs. When the
//! stable timestamp moves and the worker reads past it, the current log is
//! stashed and the other one reused, so the stashed log still holds the
//! operations from just before stable for [`RollbackVerifier`].

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use tierdb_core::error::{Error, Result};
use tierdb_core::types::{Timestamp, TS_NONE};

use crate::store::{SnapshotReader, SnapshotStore};

/// Operations per log.
pub const DEFAULT_LIST_SIZE: usize = 512;

/// Consecutive rollback checks with nothing to replay before warning.
pub const WARN_RTS_NO_CHECK: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OpKind {
    #[default]
    Read,
    Insert,
    Update,
    Remove,
    Truncate,
}

impl OpKind {
    fn is_write(self) -> bool {
        self != OpKind::Read
    }
}

/// One logged operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapOp {
    pub kind: OpKind,
    /// Transaction the operation belongs to; `0` marks an unused slot.
    pub opid: u64,
    pub keyno: u64,
    /// Truncate stop key, `0` for an open end.
    pub last: u64,
    /// Value read or written; `None` for a miss, a remove or a truncate.
    pub value: Option<Vec<u8>>,
    /// Replay timestamp, set once the operation is repeatable.
    pub ts: Timestamp,
    pub repeatable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    pub list_size: usize,
    /// Keep a stashed log for rollback-to-stable checking.
    pub rollback_to_stable: bool,
    /// Truncates run from `keyno` down to `last`.
    pub reverse: bool,
    /// Not-found and a zero byte are the same value.
    pub fixed_length: bool,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            list_size: DEFAULT_LIST_SIZE,
            rollback_to_stable: false,
            reverse: false,
            fixed_length: false,
        }
    }
}

/// How a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Committed(Timestamp),
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replay {
    Verified,
    AgedOut,
    RolledBack,
}

/// Per-worker operation log.
#[derive(Debug)]
pub struct SnapTracker {
    config: OracleConfig,
    logs: Vec<Vec<SnapOp>>,
    current: usize,
    cursor: usize,
    first: usize,
    opid: u64,
    read_ts: Timestamp,
    repeatable_reads: bool,
    wrapped: bool,
    stable_ts: Timestamp,
    rng: StdRng,
}

impl SnapTracker {
    pub fn new(config: OracleConfig, seed: u64) -> Self {
        let size = config.list_size.max(2);
        let count = if config.rollback_to_stable { 2 } else { 1 };
        Self {
            logs: vec![vec![SnapOp::default(); size]; count],
            config,
            current: 0,
            cursor: 0,
            first: 0,
            opid: 0,
            read_ts: TS_NONE,
            repeatable_reads: false,
            wrapped: false,
            stable_ts: TS_NONE,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn config(&self) -> &OracleConfig {
        &self.config
    }

    /// Id of the transaction being logged.
    pub fn opid(&self) -> u64 {
        self.opid
    }

    /// The open transaction overwrote its own records.
    pub fn wrapped(&self) -> bool {
        self.wrapped
    }

    /// The log new operations go to.
    pub fn log(&self) -> &[SnapOp] {
        &self.logs[self.current]
    }

    /// The other log, when rollback checking keeps one.
    pub fn stashed(&self) -> Option<&[SnapOp]> {
        if self.logs.len() < 2 {
            return None;
        }
        Some(&self.logs[self.current ^ 1])
    }

    pub fn repeatable_count(&self) -> usize {
        self.logs.iter().flatten().filter(|op| op.repeatable).count()
    }

    /// Start logging a new transaction reading at `read_ts`.
    ///
    /// `repeatable_reads` is false when the read timestamp was not older than
    /// every concurrently running uncommitted update. `stable_ts` is the
    /// current global stable timestamp.
    pub fn op_init(&mut self, read_ts: Timestamp, repeatable_reads: bool, stable_ts: Timestamp) {
        self.opid += 1;

        if self.config.rollback_to_stable && stable_ts != self.stable_ts && read_ts > stable_ts {
            self.stable_ts = stable_ts;
            self.current ^= 1;
            self.cursor = 0;
            for op in &mut self.logs[self.current] {
                op.repeatable = false;
            }
            debug!("stable moved to {}, switched to log {}", stable_ts, self.current);
        }

        self.first = self.cursor;
        self.read_ts = read_ts;
        self.repeatable_reads = repeatable_reads;
        self.wrapped = false;
    }

    /// Log one operation of the open transaction.
    pub fn track(&mut self, kind: OpKind, keyno: u64, last: u64, value: Option<&[u8]>) {
        let opid = self.opid;
        let log = &mut self.logs[self.current];
        let slot = &mut log[self.cursor];
        slot.kind = kind;
        slot.opid = opid;
        slot.keyno = keyno;
        slot.last = if kind == OpKind::Truncate { last } else { 0 };
        slot.ts = TS_NONE;
        slot.repeatable = false;
        slot.value = match kind {
            OpKind::Remove | OpKind::Truncate => None,
            _ => value.map(<[u8]>::to_vec),
        };

        self.cursor = (self.cursor + 1) % log.len();
        if log[self.cursor].opid == opid {
            self.wrapped = true;
        }
    }

    /// Slots of the open transaction, oldest first.
    fn txn_slots(&self) -> Vec<usize> {
        let log = &self.logs[self.current];
        let n = log.len();
        (0..n)
            .map(|i| (self.first + i) % n)
            .take_while(|&i| log[i].opid == self.opid)
            .collect()
    }

    /// Whether `other` leaves the record `current` touched alone.
    fn independent(&self, current: &SnapOp, other: &SnapOp) -> bool {
        if !other.kind.is_write() {
            return true;
        }
        if other.keyno == current.keyno {
            return false;
        }
        if other.kind == OpKind::Truncate {
            let (start, stop, k) = (other.keyno, other.last, current.keyno);
            let covered = if self.config.reverse {
                (start == 0 || start >= k) && (stop == 0 || stop <= k)
            } else {
                (start == 0 || start <= k) && (stop == 0 || stop >= k)
            };
            if covered {
                return false;
            }
        }
        true
    }

    fn later_independent(&self, idx: usize) -> bool {
        let log = &self.logs[self.current];
        let n = log.len();
        let mut p = idx;
        for _ in 1..n {
            p = (p + 1) % n;
            if log[p].opid != self.opid {
                break;
            }
            if !self.independent(&log[idx], &log[p]) {
                return false;
            }
        }
        true
    }

    fn earlier_independent(&self, idx: usize) -> bool {
        let log = &self.logs[self.current];
        let n = log.len();
        let mut p = idx;
        for _ in 1..n {
            p = (p + n - 1) % n;
            if log[p].opid != self.opid {
                break;
            }
            if !self.independent(&log[idx], &log[p]) {
                return false;
            }
        }
        true
    }

    /// Repeatable while the transaction is open or after it committed.
    /// Writes must not be followed by another write to the record; reads must
    /// not be surrounded by one.
    fn repeat_ok_commit(&self, idx: usize) -> bool {
        let op = &self.logs[self.current][idx];
        if op.kind == OpKind::Truncate {
            return false;
        }
        if !self.later_independent(idx) {
            return false;
        }
        op.kind.is_write() || self.earlier_independent(idx)
    }

    /// Repeatable after the transaction rolled back: unmodified reads only.
    fn repeat_ok_rollback(&self, idx: usize) -> bool {
        self.logs[self.current][idx].kind == OpKind::Read && self.earlier_independent(idx)
    }

    /// Re-check every operation of the still-open transaction through its
    /// own reader.
    pub fn repeat_txn(&self, reader: &dyn SnapshotReader) -> Result<()> {
        if self.wrapped {
            return Ok(());
        }
        for idx in self.txn_slots() {
            if self.repeat_ok_commit(idx) {
                let op = &self.logs[self.current][idx];
                let found = reader.search(op.keyno)?;
                verify(&self.config, op, found.as_deref())?;
            }
        }
        Ok(())
    }

    /// Mark the operations of the resolved transaction that can be replayed
    /// later: reads at the read timestamp, writes at the commit timestamp.
    pub fn repeat_update(&mut self, resolution: Resolution) {
        if self.wrapped {
            return;
        }
        let (read_ts, repeatable_reads) = (self.read_ts, self.repeatable_reads);
        for idx in self.txn_slots() {
            let kind = self.logs[self.current][idx].kind;
            if !repeatable_reads && kind == OpKind::Read {
                continue;
            }
            let (repeatable, ts) = match resolution {
                Resolution::Committed(commit_ts) => {
                    let ts = if kind == OpKind::Read { read_ts } else { commit_ts };
                    (self.repeat_ok_commit(idx), ts)
                }
                Resolution::RolledBack => (self.repeat_ok_rollback(idx), read_ts),
            };
            let op = &mut self.logs[self.current][idx];
            op.repeatable = repeatable;
            if repeatable {
                op.ts = ts;
            }
        }
    }

    /// Replay one repeatable record, starting the search at a random slot.
    /// Returns whether a record was verified.
    pub fn repeat_single(&mut self, store: &dyn SnapshotStore) -> Result<bool> {
        let log = &self.logs[self.current];
        let n = log.len();
        let start = self.rng.gen_range(0..n);
        let Some(idx) = (0..n).map(|i| (start + i) % n).find(|&i| log[i].repeatable) else {
            return Ok(false);
        };
        let op = log[idx].clone();
        match replay(&self.config, store, &op, true)? {
            Replay::Verified => Ok(true),
            Replay::AgedOut => {
                self.ts_clear(op.ts);
                Ok(false)
            }
            Replay::RolledBack => Ok(false),
        }
    }

    /// Forget repeatable records at or before `ts`.
    pub fn ts_clear(&mut self, ts: Timestamp) {
        for op in &mut self.logs[self.current] {
            if op.repeatable && op.ts <= ts {
                op.repeatable = false;
            }
        }
    }
}

/// Replays every worker's repeatable records after a rollback-to-stable and
/// tracks how often there was nothing to check.
#[derive(Debug, Default)]
pub struct RollbackVerifier {
    consecutive_empty: u32,
}

impl RollbackVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replay records with `oldest <= ts <= stable` from both logs of every
    /// worker, then clear every marker. Returns the number replayed.
    pub fn repeat_rollback(
        &mut self,
        store: &dyn SnapshotStore,
        trackers: &mut [SnapTracker],
        oldest: Timestamp,
        stable: Timestamp,
    ) -> Result<u32> {
        let mut count = 0u32;
        info!("rollback_to_stable: checking");
        for tracker in trackers.iter_mut() {
            for log in 0..tracker.logs.len() {
                for slot in 0..tracker.logs[log].len() {
                    let op = &tracker.logs[log][slot];
                    if op.repeatable && op.ts <= stable && op.ts >= oldest {
                        let op = op.clone();
                        if replay(&tracker.config, store, &op, false)? == Replay::AgedOut {
                            tracker.ts_clear(op.ts);
                        }
                        count += 1;
                        if count % 100 == 0 {
                            debug!("rollback_to_stable: {} ops repeated", count);
                        }
                    }
                    tracker.logs[log][slot].repeatable = false;
                }
            }
        }

        info!("rollback_to_stable: {} ops repeated", count);
        if count == 0 {
            self.consecutive_empty += 1;
            if self.consecutive_empty >= WARN_RTS_NO_CHECK {
                warn!(
                    "{} consecutive runs with no rollback_to_stable checking",
                    self.consecutive_empty
                );
            }
        } else {
            self.consecutive_empty = 0;
        }
        Ok(count)
    }

    pub fn consecutive_empty(&self) -> u32 {
        self.consecutive_empty
    }
}

fn replay(config: &OracleConfig, store: &dyn SnapshotStore, op: &SnapOp, rollback_allowed: bool) -> Result<Replay> {
    match store.search_at(op.keyno, op.ts) {
        Ok(found) => {
            debug!(
                "repeat {} ts={} {}",
                op.keyno,
                op.ts,
                describe(op.value.as_deref())
            );
            verify(config, op, found.as_deref())?;
            Ok(Replay::Verified)
        }
        Err(Error::InvalidArgument { .. }) => Ok(Replay::AgedOut),
        Err(Error::Rollback { .. }) if rollback_allowed => Ok(Replay::RolledBack),
        Err(e) => Err(e),
    }
}

/// Compare what a replay found with what was logged.
fn verify(config: &OracleConfig, op: &SnapOp, found: Option<&[u8]>) -> Result<()> {
    let expected = match op.kind {
        OpKind::Remove => None,
        OpKind::Truncate => {
            return Err(Error::invalid(format!("truncate of {} cannot be replayed", op.keyno)));
        }
        _ => op.value.as_deref(),
    };
    if found == expected {
        return Ok(());
    }
    let zero = |v: Option<&[u8]>| matches!(v, None | Some([0]));
    if config.fixed_length && zero(found) && zero(expected) {
        return Ok(());
    }

    let details = format!(
        "snapshot-isolation {} search mismatch: expected {}, found {}",
        op.keyno,
        describe(expected),
        describe(found)
    );
    error!("{}", details);
    Err(Error::Corruption { details })
}

fn describe(value: Option<&[u8]>) -> String {
    let Some(bytes) = value else {
        return "{deleted}".to_string();
    };
    let mut out = String::from("{");
    for b in bytes {
        if b.is_ascii_graphic() || *b == b' ' {
            out.push(*b as char);
        } else {
            out.push_str(&format!("\\{:02x}", b));
        }
    }
    out.push('}');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Value;
    use std::collections::HashMap;

    /// Reader over a fixed map.
    struct MapReader(HashMap<u64, Value>);

    impl SnapshotReader for MapReader {
        fn search(&self, keyno: u64) -> Result<Option<Value>> {
            Ok(self.0.get(&keyno).cloned())
        }
    }

    fn tracker(size: usize) -> SnapTracker {
        SnapTracker::new(
            OracleConfig {
                list_size: size,
                ..Default::default()
            },
            7,
        )
    }

    fn flags(t: &SnapTracker) -> Vec<(OpKind, u64, bool)> {
        t.log()
            .iter()
            .filter(|op| op.opid == t.opid())
            .map(|op| (op.kind, op.keyno, op.repeatable))
            .collect()
    }

    #[test]
    fn test_read_then_write_same_key() {
        let mut t = tracker(16);
        t.op_init(10, true, 0);
        t.track(OpKind::Read, 1, 0, Some(b"old"));
        t.track(OpKind::Update, 1, 0, Some(b"new"));
        t.track(OpKind::Read, 2, 0, Some(b"two"));
        t.repeat_update(Resolution::Committed(11));

        assert_eq!(
            flags(&t),
            vec![
                (OpKind::Read, 1, false),
                (OpKind::Update, 1, true),
                (OpKind::Read, 2, true),
            ]
        );
        assert_eq!(t.log()[1].ts, 11);
        assert_eq!(t.log()[2].ts, 10);
    }

    #[test]
    fn test_write_followed_by_write_not_repeatable() {
        let mut t = tracker(16);
        t.op_init(10, true, 0);
        t.track(OpKind::Update, 3, 0, Some(b"a"));
        t.track(OpKind::Remove, 3, 0, None);
        t.repeat_update(Resolution::Committed(11));
        assert_eq!(flags(&t), vec![(OpKind::Update, 3, false), (OpKind::Remove, 3, true)]);
    }

    #[test]
    fn test_truncate_never_repeatable_and_covers_range() {
        let mut t = tracker(16);
        t.op_init(10, true, 0);
        t.track(OpKind::Update, 5, 0, Some(b"a"));
        t.track(OpKind::Update, 20, 0, Some(b"b"));
        t.track(OpKind::Truncate, 3, 10, None);
        t.repeat_update(Resolution::Committed(11));
        assert_eq!(
            flags(&t),
            vec![
                (OpKind::Update, 5, false),
                (OpKind::Update, 20, true),
                (OpKind::Truncate, 3, false),
            ]
        );
    }

    #[test]
    fn test_reverse_truncate_overlap() {
        let mut t = SnapTracker::new(
            OracleConfig {
                list_size: 16,
                reverse: true,
                ..Default::default()
            },
            7,
        );
        t.op_init(10, true, 0);
        t.track(OpKind::Update, 5, 0, Some(b"a"));
        t.track(OpKind::Update, 12, 0, Some(b"b"));
        // Runs from 10 down to 3.
        t.track(OpKind::Truncate, 10, 3, None);
        t.repeat_update(Resolution::Committed(11));
        let flags = flags(&t);
        assert!(!flags[0].2);
        assert!(flags[1].2);
    }

    #[test]
    fn test_rollback_keeps_clean_reads_only() {
        let mut t = tracker(16);
        t.op_init(10, true, 0);
        t.track(OpKind::Read, 1, 0, Some(b"a"));
        t.track(OpKind::Update, 2, 0, Some(b"b"));
        t.track(OpKind::Read, 2, 0, Some(b"b"));
        t.repeat_update(Resolution::RolledBack);
        assert_eq!(
            flags(&t),
            vec![
                (OpKind::Read, 1, true),
                (OpKind::Update, 2, false),
                (OpKind::Read, 2, false),
            ]
        );
    }

    #[test]
    fn test_unrepeatable_reads_skipped() {
        let mut t = tracker(16);
        t.op_init(10, false, 0);
        t.track(OpKind::Read, 1, 0, Some(b"a"));
        t.track(OpKind::Update, 2, 0, Some(b"b"));
        t.repeat_update(Resolution::Committed(11));
        assert_eq!(flags(&t), vec![(OpKind::Read, 1, false), (OpKind::Update, 2, true)]);
    }

    #[test]
    fn test_wrap_abandons_transaction() {
        let mut t = tracker(4);
        t.op_init(10, true, 0);
        for k in 1..=3 {
            t.track(OpKind::Update, k, 0, Some(b"v"));
        }
        assert!(!t.wrapped());
        t.track(OpKind::Update, 4, 0, Some(b"v"));
        assert!(t.wrapped());

        t.repeat_update(Resolution::Committed(11));
        assert_eq!(t.repeatable_count(), 0);
        // Nothing is checked either.
        t.repeat_txn(&MapReader(HashMap::new())).unwrap();

        t.op_init(12, true, 0);
        assert!(!t.wrapped());
    }

    #[test]
    fn test_repeat_txn_detects_mismatch() {
        let mut t = tracker(16);
        t.op_init(10, true, 0);
        t.track(OpKind::Read, 1, 0, Some(b"a"));
        t.track(OpKind::Remove, 2, 0, None);

        let good = MapReader(HashMap::from([(1, b"a".to_vec())]));
        t.repeat_txn(&good).unwrap();

        let bad = MapReader(HashMap::from([(1, b"a".to_vec()), (2, b"ghost".to_vec())]));
        let err = t.repeat_txn(&bad).unwrap_err();
        assert!(matches!(err, Error::Corruption { .. }));
        assert!(err.to_string().contains("{ghost}"));
    }

    #[test]
    fn test_fixed_length_zero_is_not_found() {
        let config = OracleConfig {
            fixed_length: true,
            ..Default::default()
        };
        let read_zero = SnapOp {
            kind: OpKind::Read,
            keyno: 1,
            value: Some(vec![0]),
            ..Default::default()
        };
        verify(&config, &read_zero, None).unwrap();
        let removed = SnapOp {
            kind: OpKind::Remove,
            keyno: 1,
            ..Default::default()
        };
        verify(&config, &removed, Some(&[0u8][..])).unwrap();
        assert!(verify(&config, &removed, Some(&[7u8][..])).is_err());
        assert!(verify(&OracleConfig::default(), &read_zero, None).is_err());
    }

    #[test]
    fn test_stable_advance_switches_logs() {
        let mut t = SnapTracker::new(
            OracleConfig {
                list_size: 8,
                rollback_to_stable: true,
                ..Default::default()
            },
            7,
        );
        t.op_init(10, true, 5);
        t.track(OpKind::Update, 1, 0, Some(b"a"));
        t.repeat_update(Resolution::Committed(11));
        assert_eq!(t.log()[0].keyno, 1);

        // Stable moved but we do not read past it: keep logging here.
        t.op_init(12, true, 20);
        assert_eq!(t.log()[0].keyno, 1);

        t.op_init(25, true, 20);
        assert!(t.log().iter().all(|op| !op.repeatable));
        let stashed = t.stashed().unwrap();
        assert!(stashed[0].repeatable);
        assert_eq!(stashed[0].ts, 11);
    }

    #[test]
    fn test_ts_clear() {
        let mut t = tracker(16);
        t.op_init(10, true, 0);
        t.track(OpKind::Update, 1, 0, Some(b"a"));
        t.repeat_update(Resolution::Committed(11));
        t.op_init(20, true, 0);
        t.track(OpKind::Update, 2, 0, Some(b"b"));
        t.repeat_update(Resolution::Committed(21));

        t.ts_clear(15);
        assert_eq!(t.repeatable_count(), 1);
        assert_eq!(t.log().iter().find(|op| op.repeatable).map(|op| op.keyno), Some(2));
    }
}
