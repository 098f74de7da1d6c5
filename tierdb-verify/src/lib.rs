//! # TierDB Verify
//!
//! Snapshot-isolation checking for TierDB:
//! - `snap`     - per-worker operation logs, repeatability rules and replay
//! - `store`    - the reader interfaces replay runs against, and a reference
//!                multi-version store implementing them
//! - `workload` - a seeded randomized driver tying the two together

pub mod snap;
pub mod store;
pub mod workload;

pub use snap::{OpKind, OracleConfig, Resolution, RollbackVerifier, SnapOp, SnapTracker};
pub use store::{MemStore, MemTxn, SnapshotReader, SnapshotStore};
pub use workload::{run, WorkloadConfig, WorkloadReport};
