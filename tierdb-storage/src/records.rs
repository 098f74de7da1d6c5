//! In-memory rows of every data source, keyed by source URI.
//!
//! Rows are written to their data file when the file is checkpointed and are
//! loaded back from the file when it is imported.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use tierdb_core::error::{Error, Result};
use tierdb_core::types::Timestamp;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRow {
    pub key: Vec<String>,
    pub values: Vec<String>,
    /// Commit timestamp of the insert.
    pub start_ts: Timestamp,
    /// Commit timestamp of the removal, if removed.
    pub stop_ts: Option<Timestamp>,
}

type Rows = BTreeMap<Vec<String>, StoredRow>;

#[derive(Default)]
pub struct RecordStore {
    sources: RwLock<HashMap<String, Rows>>,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, source: &str, key: Vec<String>, values: Vec<String>, ts: Timestamp) {
        let row = StoredRow {
            key: key.clone(),
            values,
            start_ts: ts,
            stop_ts: None,
        };
        self.sources
            .write()
            .entry(source.to_string())
            .or_default()
            .insert(key, row);
    }

    /// Mark a row removed at `ts`.
    pub fn remove(&self, source: &str, key: &[String], ts: Timestamp) -> Result<()> {
        let mut sources = self.sources.write();
        let row = sources
            .get_mut(source)
            .and_then(|rows| rows.get_mut(key))
            .filter(|row| row.stop_ts.is_none())
            .ok_or_else(|| Error::not_found(format!("{}: key {:?}", source, key)))?;
        row.stop_ts = Some(ts);
        Ok(())
    }

    pub fn get(&self, source: &str, key: &[String]) -> Option<StoredRow> {
        self.sources.read().get(source).and_then(|rows| rows.get(key)).cloned()
    }

    /// Every row of a source in key order, including removed rows.
    pub fn rows(&self, source: &str) -> Vec<StoredRow> {
        self.sources
            .read()
            .get(source)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Live rows only.
    pub fn live_rows(&self, source: &str) -> Vec<StoredRow> {
        self.rows(source).into_iter().filter(|r| r.stop_ts.is_none()).collect()
    }

    pub fn load(&self, source: &str, rows: Vec<StoredRow>) {
        let rows: Rows = rows.into_iter().map(|r| (r.key.clone(), r)).collect();
        self.sources.write().insert(source.to_string(), rows);
    }

    pub fn drop_source(&self, source: &str) {
        self.sources.write().remove(source);
    }
}
