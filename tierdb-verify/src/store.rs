//! # Reference Multi-Version Store
//!
//! A small in-memory MVCC store with snapshot transactions, write-write
//! conflict detection, an oldest/stable timestamp window and
//! rollback-to-stable. The oracle replays against anything implementing
//! [`SnapshotStore`]; this store is the one the workload driver uses.

use std::collections::{BTreeMap, HashMap};
use std::ops::RangeInclusive;

use parking_lot::Mutex;
use tracing::debug;

use tierdb_core::error::{Error, Result};
use tierdb_core::types::{Timestamp, TS_NONE};

pub type Value = Vec<u8>;

/// Reads inside an open transaction.
pub trait SnapshotReader {
    fn search(&self, keyno: u64) -> Result<Option<Value>>;
}

/// Reads in a fresh snapshot transaction.
pub trait SnapshotStore {
    /// Read `keyno` as of `read_ts`.
    ///
    /// A timestamp older than the store's retained window fails with
    /// `InvalidArgument`.
    fn search_at(&self, keyno: u64, read_ts: Timestamp) -> Result<Option<Value>>;
}

#[derive(Debug, Clone)]
struct Version {
    ts: Timestamp,
    value: Option<Value>,
}

#[derive(Debug, Default)]
struct StoreState {
    /// Versions per key, ascending by timestamp.
    versions: BTreeMap<u64, Vec<Version>>,
    /// Keys written by open transactions.
    locks: HashMap<u64, u64>,
    oldest: Timestamp,
    stable: Timestamp,
    next_txn: u64,
}

impl StoreState {
    fn visible(&self, keyno: u64, read_ts: Timestamp) -> Option<&Value> {
        self.versions
            .get(&keyno)?
            .iter()
            .rev()
            .find(|v| v.ts <= read_ts)?
            .value
            .as_ref()
    }

    /// Drop versions no reader at or after `oldest` can see.
    fn prune(&mut self) {
        let oldest = self.oldest;
        for versions in self.versions.values_mut() {
            if let Some(keep) = versions.iter().rposition(|v| v.ts <= oldest) {
                versions.drain(..keep);
            }
        }
        self.versions
            .retain(|_, versions| !(versions.len() == 1 && versions[0].value.is_none() && versions[0].ts <= oldest));
    }
}

#[derive(Debug, Default)]
pub struct MemStore {
    state: Mutex<StoreState>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a snapshot transaction reading at `read_ts`.
    pub fn begin(&self, read_ts: Timestamp) -> Result<MemTxn<'_>> {
        let mut state = self.state.lock();
        if read_ts < state.oldest {
            return Err(Error::invalid(format!(
                "read timestamp {} older than oldest timestamp {}",
                read_ts, state.oldest
            )));
        }
        state.next_txn += 1;
        Ok(MemTxn {
            store: self,
            id: state.next_txn,
            read_ts,
            writes: BTreeMap::new(),
            resolved: false,
        })
    }

    /// Move the oldest timestamp forward. Moving it backwards is ignored.
    pub fn set_oldest(&self, ts: Timestamp) -> Result<()> {
        let mut state = self.state.lock();
        if ts <= state.oldest {
            return Ok(());
        }
        if state.stable != TS_NONE && ts > state.stable {
            return Err(Error::invalid(format!(
                "oldest timestamp {} newer than stable timestamp {}",
                ts, state.stable
            )));
        }
        state.oldest = ts;
        state.prune();
        Ok(())
    }

    /// Move the stable timestamp forward. Moving it backwards is ignored.
    pub fn set_stable(&self, ts: Timestamp) -> Result<()> {
        let mut state = self.state.lock();
        if ts < state.oldest {
            return Err(Error::invalid(format!(
                "stable timestamp {} older than oldest timestamp {}",
                ts, state.oldest
            )));
        }
        if ts > state.stable {
            state.stable = ts;
        }
        Ok(())
    }

    /// `(oldest, stable)`
    pub fn timestamps(&self) -> (Timestamp, Timestamp) {
        let state = self.state.lock();
        (state.oldest, state.stable)
    }

    /// Discard every version committed after the stable timestamp. Fails
    /// with `Busy` while transactions hold writes.
    pub fn rollback_to_stable(&self) -> Result<usize> {
        let mut state = self.state.lock();
        if !state.locks.is_empty() {
            return Err(Error::busy(format!(
                "rollback_to_stable with {} keys held by open transactions",
                state.locks.len()
            )));
        }
        let stable = state.stable;
        let mut removed = 0;
        for versions in state.versions.values_mut() {
            let before = versions.len();
            versions.retain(|v| v.ts <= stable);
            removed += before - versions.len();
        }
        state.versions.retain(|_, versions| !versions.is_empty());
        debug!("rollback_to_stable at {} removed {} versions", stable, removed);
        Ok(removed)
    }

    /// Keys with a live newest version.
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state
            .versions
            .values()
            .filter(|v| v.last().map_or(false, |v| v.value.is_some()))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotStore for MemStore {
    fn search_at(&self, keyno: u64, read_ts: Timestamp) -> Result<Option<Value>> {
        let txn = self.begin(read_ts)?;
        Ok(txn.search(keyno))
    }
}

/// An open snapshot transaction. Dropping it unresolved rolls it back.
#[derive(Debug)]
pub struct MemTxn<'a> {
    store: &'a MemStore,
    id: u64,
    read_ts: Timestamp,
    writes: BTreeMap<u64, Option<Value>>,
    resolved: bool,
}

impl<'a> MemTxn<'a> {
    pub fn read_ts(&self) -> Timestamp {
        self.read_ts
    }

    pub fn search(&self, keyno: u64) -> Option<Value> {
        if let Some(own) = self.writes.get(&keyno) {
            return own.clone();
        }
        self.store.state.lock().visible(keyno, self.read_ts).cloned()
    }

    pub fn update(&mut self, keyno: u64, value: Value) -> Result<()> {
        self.write(keyno, Some(value))
    }

    pub fn remove(&mut self, keyno: u64) -> Result<()> {
        self.write(keyno, None)
    }

    /// Remove every key this transaction sees in `range`; returns how many.
    pub fn truncate(&mut self, range: RangeInclusive<u64>) -> Result<usize> {
        let mut keys: Vec<u64> = {
            let state = self.store.state.lock();
            state
                .versions
                .range(range.clone())
                .filter(|(k, _)| state.visible(**k, self.read_ts).is_some())
                .map(|(k, _)| *k)
                .collect()
        };
        keys.extend(self.writes.range(range).filter(|(_, v)| v.is_some()).map(|(k, _)| *k));
        keys.sort_unstable();
        keys.dedup();
        keys.retain(|k| self.search(*k).is_some());
        for keyno in &keys {
            self.write(*keyno, None)?;
        }
        Ok(keys.len())
    }

    fn write(&mut self, keyno: u64, value: Option<Value>) -> Result<()> {
        {
            let mut state = self.store.state.lock();
            if let Some(owner) = state.locks.get(&keyno) {
                if *owner != self.id {
                    return Err(Error::rollback(format!(
                        "key {} is being written by transaction {}",
                        keyno, owner
                    )));
                }
            }
            let newest = state.versions.get(&keyno).and_then(|v| v.last()).map(|v| v.ts);
            if let Some(ts) = newest.filter(|ts| *ts > self.read_ts) {
                return Err(Error::rollback(format!(
                    "key {} committed at {} after read timestamp {}",
                    keyno, ts, self.read_ts
                )));
            }
            state.locks.insert(keyno, self.id);
        }
        self.writes.insert(keyno, value);
        Ok(())
    }

    /// Make the writes visible at `commit_ts`, which must be newer than both
    /// the read and the stable timestamps.
    pub fn commit(mut self, commit_ts: Timestamp) -> Result<()> {
        let mut state = self.store.state.lock();
        if commit_ts <= self.read_ts || commit_ts <= state.stable {
            return Err(Error::invalid(format!(
                "commit timestamp {} not after read timestamp {} and stable timestamp {}",
                commit_ts, self.read_ts, state.stable
            )));
        }
        for (keyno, value) in std::mem::take(&mut self.writes) {
            state.locks.remove(&keyno);
            state
                .versions
                .entry(keyno)
                .or_default()
                .push(Version { ts: commit_ts, value });
        }
        self.resolved = true;
        Ok(())
    }

    pub fn rollback(mut self) {
        self.release();
    }

    fn release(&mut self) {
        let mut state = self.store.state.lock();
        for keyno in self.writes.keys() {
            if state.locks.get(keyno) == Some(&self.id) {
                state.locks.remove(keyno);
            }
        }
        self.writes.clear();
        self.resolved = true;
    }
}

impl Drop for MemTxn<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.release();
        }
    }
}

impl SnapshotReader for MemTxn<'_> {
    fn search(&self, keyno: u64) -> Result<Option<Value>> {
        Ok(MemTxn::search(self, keyno))
    }
}
