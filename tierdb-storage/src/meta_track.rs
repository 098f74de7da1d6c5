//! # Tracked Operations
//!
//! Undo log for multi-step schema changes. Every metadata write and file
//! creation performed while tracking is on is recorded together with what it
//! takes to reverse it. Tracking nests; only the outermost `off` either
//! discards the log or replays it in reverse.
//!
//! Data handle locks taken during the scope are parked here too and released
//! when the outermost scope ends, whether it commits or unrolls.

use tracing::{debug, warn};

use tierdb_core::error::{Error, Result};

use crate::connection::ConnectionInner;
use crate::dhandle::ExclusiveGuard;

#[derive(Debug)]
pub enum TrackedOp {
    /// Metadata entry was inserted.
    Insert { uri: String },
    /// Metadata entry was removed; holds the removed value.
    Remove { uri: String, config: String },
    /// Metadata entry was overwritten; `previous` is `None` if it did not exist.
    Update { uri: String, previous: Option<String> },
    /// Data file was created on disk.
    FileCreate { name: String },
    /// Rows were loaded into the record store for a source.
    Records { source: String },
    /// Exclusive handle lock held until the scope ends.
    HandleLock(ExclusiveGuard),
}

impl TrackedOp {
    fn undo(&self, conn: &ConnectionInner) -> Result<()> {
        match self {
            TrackedOp::Insert { uri } => match conn.metadata.remove(uri) {
                Err(Error::NotFound { .. }) => Ok(()),
                other => other.map(|_| ()),
            },
            TrackedOp::Remove { uri, config } => conn.metadata.update(uri, config).map(|_| ()),
            TrackedOp::Update { uri, previous } => match previous {
                Some(config) => conn.metadata.update(uri, config).map(|_| ()),
                None => conn.metadata.remove(uri).map(|_| ()),
            },
            TrackedOp::FileCreate { name } => {
                conn.records.drop_source(&format!("file:{}", name));
                match conn.fh_cache.file_system().remove(name) {
                    Err(Error::NoEntry { .. }) => Ok(()),
                    other => other,
                }
            }
            TrackedOp::Records { source } => {
                conn.records.drop_source(source);
                Ok(())
            }
            TrackedOp::HandleLock(_) => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
pub struct MetaTrack {
    depth: u32,
    ops: Vec<TrackedOp>,
}

impl MetaTrack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&mut self) {
        self.depth += 1;
    }

    pub fn is_on(&self) -> bool {
        self.depth > 0
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Record an operation. Outside a tracking scope the operation is dropped,
    /// which releases any lock it carries.
    pub fn push(&mut self, op: TrackedOp) {
        if self.is_on() {
            self.ops.push(op);
        }
    }

    pub fn insert(&mut self, uri: &str) {
        self.push(TrackedOp::Insert { uri: uri.to_string() });
    }

    pub fn remove(&mut self, uri: &str, config: String) {
        self.push(TrackedOp::Remove {
            uri: uri.to_string(),
            config,
        });
    }

    pub fn update(&mut self, uri: &str, previous: Option<String>) {
        self.push(TrackedOp::Update {
            uri: uri.to_string(),
            previous,
        });
    }

    pub fn file_create(&mut self, name: &str) {
        self.push(TrackedOp::FileCreate { name: name.to_string() });
    }

    pub fn records(&mut self, source: &str) {
        self.push(TrackedOp::Records {
            source: source.to_string(),
        });
    }

    pub fn handle_lock(&mut self, guard: ExclusiveGuard) {
        self.push(TrackedOp::HandleLock(guard));
    }

    /// Leave a tracking scope. At the outermost level the log is either
    /// replayed in reverse (`unroll`) or discarded.
    pub fn off(&mut self, conn: &ConnectionInner, unroll: bool) -> Result<()> {
        if self.depth == 0 {
            return Err(Error::invalid("metadata tracking is not on"));
        }
        self.depth -= 1;
        if self.depth > 0 {
            return Ok(());
        }

        let ops = std::mem::take(&mut self.ops);
        if !unroll {
            return Ok(());
        }

        debug!("unrolling {} tracked operations", ops.len());
        let mut first_err = None;
        for op in ops.iter().rev() {
            if let Err(e) = op.undo(conn) {
                warn!("failed to undo {:?}: {}", op, e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
